extern crate alloc;

use alloc::{format, string::String, vec::Vec};
use core::fmt::Debug;

use bitvec::prelude::*;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::debug;
use nom::{
    bytes::{complete::take, streaming::take as take_bits},
    combinator::map,
    error::{ErrorKind, FromExternalError, ParseError},
    number::complete::be_u8,
    sequence::tuple,
    Needed,
};
use nom_bitvec::BSlice;
use thiserror::Error;

use crate::{oid, util, Asn1Node, Asn1Tree, Asn1Value, Cursor, NodeId, Tag, TagClass, UniversalTag};

type DecodeIn<'input> = BSlice<'input, u8, Msb0>;

/// Returns the value of a decoding attempt
#[derive(Debug, PartialEq)]
pub struct Decoded<T: Debug + PartialEq> {
    /// indicates the number of bytes that were consumed by the decoder
    pub bytes_consumed: usize,
    /// the decoded return value
    pub decoded: T,
}

pub trait Decode: Sized + Debug + PartialEq {
    type Error: From<DecodeError>;

    /// Decoder trait for DER encoded data.
    /// Takes binary data as input; the decoded structures share the input buffer.
    /// The `Decode` trait is implemented for
    ///  - `Asn1Tree` (any sequence of ASN.1 TLVs)
    ///  - `Receipt` (a PKCS #7 signed App Store receipt)
    /// ### Usage
    /// ```rust
    /// # use receipt_asn1::*;
    /// let data: &'static [u8] = &[
    ///   0x30, 0x0b, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    /// ];
    /// let result = Asn1Tree::decode(data).unwrap();
    /// assert_eq!(13, result.bytes_consumed);
    /// let algorithm = result.decoded.root(0).unwrap().child(0).unwrap();
    /// assert_eq!(Some("2.16.840.1.101.3.4.2.1"), algorithm.value().as_oid());
    /// ```
    fn decode<I: Into<Bytes>>(input: I) -> Result<Decoded<Self>, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("Long-form length announces more length octets than available!")]
    LengthEncoding,
    #[error("Content of {needed} bytes exceeds the {remaining} remaining bytes!")]
    OutOfBuffer { needed: u64, remaining: usize },
    #[error("{0}")]
    Parse(String),
    #[error("Parser error: {0:?}")]
    Nom(ErrorKind),
}

impl From<nom::Err<DecodeError>> for DecodeError {
    fn from(value: nom::Err<DecodeError>) -> Self {
        match value {
            nom::Err::Incomplete(Needed::Size(n)) => DecodeError::Parse(format!(
                "Unexpected end of input: Needs at least other {n} bytes!"
            )),
            nom::Err::Incomplete(_) => DecodeError::Parse("Unexpected end of input!".into()),
            nom::Err::Error(e) | nom::Err::Failure(e) => e,
        }
    }
}

impl<I> ParseError<I> for DecodeError {
    fn from_error_kind(_: I, kind: ErrorKind) -> Self {
        DecodeError::Nom(kind)
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<I, E> FromExternalError<I, E> for DecodeError {
    fn from_external_error(_: I, kind: ErrorKind, _: E) -> Self {
        DecodeError::Nom(kind)
    }
}

pub type IResult<I, T> = nom::IResult<I, T, DecodeError>;

pub(crate) trait BitwiseDecodable {
    /// Trait implemented by binary input data formats
    /// that can be read bit by bit
    fn bitwise(&self) -> DecodeIn<'_>;
}

impl<const SIZE: usize> BitwiseDecodable for [u8; SIZE] {
    fn bitwise(&self) -> DecodeIn<'_> {
        DecodeIn::from(BitSlice::<u8, Msb0>::from_slice(self))
    }
}

impl Decode for Asn1Tree {
    type Error = DecodeError;

    fn decode<I: Into<Bytes>>(input: I) -> Result<Decoded<Self>, DecodeError> {
        TreeDecoder::new(input.into()).run()
    }
}

fn decode_bitwise_identifier(input: DecodeIn<'_>) -> IResult<DecodeIn<'_>, Tag> {
    map(
        tuple((take_bits(2usize), take_bits(1usize), take_bits(5usize))),
        |(class, constructed, number): (DecodeIn<'_>, DecodeIn<'_>, DecodeIn<'_>)| Tag {
            class: TagClass::from(class.0.load_be::<u8>()),
            constructed: constructed.0[0],
            number: number.0.load_be::<u8>(),
        },
    )(input)
}

fn decode_bytewise_identifier(input: &[u8]) -> IResult<&[u8], Tag> {
    let (input, byte) = be_u8(input)?;
    let (_, tag) = decode_bitwise_identifier([byte].bitwise())?;
    Ok((input, tag))
}

/// Reads a definite length. An exhausted input reads as length 0,
/// as does the indefinite form `0x80`.
fn decode_bytewise_length(input: &[u8]) -> IResult<&[u8], u64> {
    if input.is_empty() {
        return Ok((input, 0));
    }
    let (input, byte) = be_u8(input)?;
    match byte {
        len if len < 128 => Ok((input, len.into())),
        len => {
            let count = usize::from(len & 0b0111_1111);
            if count > 8 {
                return Err(nom::Err::Failure(DecodeError::Parse(format!(
                    "Length of {count} octets does not fit into 64 bits!"
                ))));
            }
            let (input, bytes) = take::<usize, &[u8], DecodeError>(count)(input)
                .map_err(|_| nom::Err::Failure(DecodeError::LengthEncoding))?;
            let length = bytes
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
            Ok((input, length))
        }
    }
}

fn decode_bytewise_content(length: u64, input: &[u8]) -> IResult<&[u8], &[u8]> {
    match usize::try_from(length) {
        Ok(len) if len <= input.len() => take(len)(input),
        _ => Err(nom::Err::Failure(DecodeError::OutOfBuffer {
            needed: length,
            remaining: input.len(),
        })),
    }
}

fn decode_bytewise_header(input: &[u8]) -> IResult<&[u8], (Tag, &[u8])> {
    let (input, tag) = decode_bytewise_identifier(input)?;
    let (input, length) = decode_bytewise_length(input)?;
    let (input, content) = decode_bytewise_content(length, input)?;
    Ok((input, (tag, content)))
}

fn decode_universal_value(kind: Option<UniversalTag>, content: &Bytes) -> Asn1Value {
    let text = |decoded: Option<String>| decoded.map_or(Asn1Value::Absent, Asn1Value::String);
    let date = |parse: fn(&str) -> Option<DateTime<Utc>>| {
        util::decode_ascii(content)
            .and_then(|s| parse(&s))
            .map_or(Asn1Value::Absent, Asn1Value::Date)
    };
    match kind {
        Some(UniversalTag::Boolean) => Asn1Value::Boolean(content.first().is_some_and(|b| *b != 0)),
        Some(UniversalTag::Integer) => {
            let start = content
                .iter()
                .position(|byte| *byte != 0)
                .unwrap_or(content.len());
            Asn1Value::Integer(content.slice(start..))
        }
        Some(UniversalTag::Null) => Asn1Value::Absent,
        Some(UniversalTag::ObjectIdentifier) => {
            oid::decode_oid(content).map_or(Asn1Value::Absent, Asn1Value::ObjectIdentifier)
        }
        Some(
            UniversalTag::Utf8String
            | UniversalTag::PrintableString
            | UniversalTag::NumericString
            | UniversalTag::GeneralString
            | UniversalTag::UniversalString
            | UniversalTag::CharacterString
            | UniversalTag::T61String,
        ) => text(core::str::from_utf8(content).ok().map(String::from)),
        Some(UniversalTag::BmpString) => text(util::decode_utf16(content)),
        Some(UniversalTag::VisibleString | UniversalTag::Ia5String) => {
            text(util::decode_ascii(content))
        }
        Some(UniversalTag::UtcTime) => date(util::parse_utc_time),
        Some(UniversalTag::GeneralizedTime) => date(util::parse_generalized_time),
        Some(UniversalTag::BitString) => Asn1Value::Bytes(content.slice(content.len().min(1)..)),
        _ => Asn1Value::Bytes(content.clone()),
    }
}

fn text_or_bytes(content: &Bytes) -> Asn1Value {
    match core::str::from_utf8(content) {
        Ok(text) => Asn1Value::String(text.into()),
        Err(_) => Asn1Value::Bytes(content.clone()),
    }
}

/// How a frame on the work stack relates to the frame below it.
enum Level {
    /// the whole input
    Root,
    /// the content octets of a constructed node
    Content,
    /// a constructed node without content octets; its children continue
    /// on the cursor of the frame below
    Shared,
    /// an attempt to read the content of an OCTET STRING as ASN.1
    Nested { checkpoint: usize },
}

struct Frame {
    cursor: Cursor,
    owner: Option<NodeId>,
    level: Level,
}

/// Builds an [`Asn1Tree`] with an explicit work stack instead of recursion,
/// so deeply nested input cannot exhaust the call stack.
struct TreeDecoder {
    tree: Asn1Tree,
    stack: Vec<Frame>,
    bytes_consumed: usize,
}

impl TreeDecoder {
    fn new(input: Bytes) -> Self {
        Self {
            tree: Asn1Tree::default(),
            stack: alloc::vec![Frame {
                cursor: Cursor::new(input),
                owner: None,
                level: Level::Root,
            }],
            bytes_consumed: 0,
        }
    }

    fn run(mut self) -> Result<Decoded<Asn1Tree>, DecodeError> {
        while let Some(top) = self.stack.last_mut() {
            if top.cursor.is_exhausted() {
                self.close_frame();
                continue;
            }
            let (tag, content) = match top.cursor.parse_shared(decode_bytewise_header) {
                Ok(header) => header,
                Err(error) => {
                    self.unwind(error)?;
                    continue;
                }
            };
            let owner = top.owner;
            if tag.constructed {
                let frame = if content.is_empty() {
                    Frame {
                        cursor: top.cursor.clone(),
                        owner: None,
                        level: Level::Shared,
                    }
                } else {
                    Frame {
                        cursor: Cursor::new(content.clone()),
                        owner: None,
                        level: Level::Content,
                    }
                };
                let id = self.tree.push(Asn1Node::new(tag, content, owner));
                self.stack.push(Frame {
                    owner: Some(id),
                    ..frame
                });
            } else if tag.is_end_of_content() {
                self.close_frame();
            } else if tag.is(UniversalTag::OctetString) {
                let id = self.tree.push(Asn1Node::new(tag, content.clone(), owner));
                self.stack.push(Frame {
                    cursor: Cursor::new(content),
                    owner: Some(id),
                    level: Level::Nested {
                        checkpoint: self.tree.len(),
                    },
                });
            } else {
                let value = match tag.class {
                    TagClass::Universal => decode_universal_value(tag.kind(), &content),
                    _ => text_or_bytes(&content),
                };
                let id = self.tree.push(Asn1Node::new(tag, content, owner));
                self.tree.node_mut(id).value = value;
            }
        }
        Ok(Decoded {
            bytes_consumed: self.bytes_consumed,
            decoded: self.tree,
        })
    }

    fn close_frame(&mut self) {
        let Some(frame) = self.stack.pop() else {
            return;
        };
        match frame.level {
            Level::Root => self.bytes_consumed = frame.cursor.position(),
            Level::Content => (),
            Level::Shared => {
                if let Some(below) = self.stack.last_mut() {
                    below.cursor = frame.cursor;
                }
            }
            Level::Nested { .. } => {
                if let Some(owner) = frame.owner {
                    if self.tree.node(owner).is_some_and(|node| node.child_count() == 0) {
                        self.fall_back(owner);
                    }
                }
            }
        }
    }

    /// Discards frames up to the innermost OCTET STRING attempt and keeps
    /// that string's content as a plain value. Errors outside of any
    /// attempt abort decoding.
    fn unwind(&mut self, error: DecodeError) -> Result<(), DecodeError> {
        while let Some(frame) = self.stack.pop() {
            if let (Level::Nested { checkpoint }, Some(owner)) = (frame.level, frame.owner) {
                debug!("OCTET STRING content is not ASN.1 ({error}), keeping it as value");
                self.tree.rollback(checkpoint, owner);
                self.fall_back(owner);
                return Ok(());
            }
        }
        Err(error)
    }

    fn fall_back(&mut self, owner: NodeId) {
        let node = self.tree.node_mut(owner);
        node.value = text_or_bytes(&node.raw);
    }
}
