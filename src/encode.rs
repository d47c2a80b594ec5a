extern crate alloc;

use alloc::{format, string::String, vec::Vec};

use bitvec::prelude::*;
use bytes::Bytes;
use thiserror::Error;

use super::*;

#[derive(Debug, PartialEq, Error)]
pub enum EncodeError {
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    Common(String),
    #[cfg(feature = "json")]
    #[error("{0}")]
    Json(String),
}

impl EncodeError {
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Unsupported(message) => message,
            Self::Common(message) => message,
            #[cfg(feature = "json")]
            Self::Json(message) => message,
        }
    }
}

#[derive(Debug, Default)]
pub struct Encoder {
    bits: BitVec<u8, Msb0>,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bits: bitvec![u8, Msb0;],
        }
    }
}

impl From<Encoder> for Vec<u8> {
    fn from(val: Encoder) -> Self {
        val.bits.into_vec()
    }
}

impl From<Encoder> for Bytes {
    fn from(val: Encoder) -> Self {
        <Encoder as core::convert::Into<Vec<u8>>>::into(val).into()
    }
}

pub trait Encode {
    fn encode(&self, output: &mut Encoder) -> Result<(), EncodeError>;

    fn encode_to_vec(&self) -> Result<Vec<u8>, EncodeError> {
        let mut encoder = Encoder::new();
        self.encode(&mut encoder)?;
        Ok(encoder.into())
    }

    #[cfg(feature = "json")]
    fn encode_to_json(&self) -> Result<String, EncodeError>
    where
        Self: Sized + Serialize,
    {
        serde_json::to_string(self)
            .map_err(|e| EncodeError::Json(format!("Error encoding JSON: {e:?}")))
    }
}

impl Encode for Tag {
    fn encode(&self, output: &mut Encoder) -> Result<(), EncodeError> {
        if self.number > 30 {
            return Err(EncodeError::Unsupported(format!(
                "Tag number {} needs a multi-octet identifier!",
                self.number
            )));
        }
        let class: u8 = match self.class {
            TagClass::Universal => 0,
            TagClass::Application => 1,
            TagClass::ContextSpecific => 2,
            TagClass::Private => 3,
        };
        output.bits.extend_from_bitslice(&class.view_bits::<Msb0>()[6..]);
        output.bits.push(self.constructed);
        output
            .bits
            .extend_from_bitslice(&self.number.view_bits::<Msb0>()[3..]);
        Ok(())
    }
}

#[allow(clippy::unnecessary_wraps, reason = "common interface")]
fn encode_der_length(length: usize, output: &mut Encoder) -> Result<(), EncodeError> {
    match length {
        len if len < 128 => {
            #[allow(clippy::cast_possible_truncation)]
            output.bits.extend_from_raw_slice(&[len as u8]);
            Ok(())
        }
        len => {
            let raw = len.to_be_bytes();
            let mut length_bytes = raw.as_ref();
            while length_bytes.len() > 1 && length_bytes[0] == 0 {
                length_bytes = &length_bytes[1..];
            }
            #[allow(clippy::cast_possible_truncation)]
            output
                .bits
                .extend_from_raw_slice(&[(length_bytes.len() + 128) as u8]);
            output.bits.extend_from_raw_slice(length_bytes);
            Ok(())
        }
    }
}

fn encode_tlv(tag: Tag, content: &[u8], output: &mut Encoder) -> Result<(), EncodeError> {
    tag.encode(output)?;
    encode_der_length(content.len(), output)?;
    output.bits.extend_from_raw_slice(content);
    Ok(())
}

/// Encodes a dotted-decimal object identifier into its content octets.
/// The first two arcs must fit into a single octet.
pub fn encode_oid(dotted: &str) -> Result<Vec<u8>, EncodeError> {
    let arcs = dotted
        .split('.')
        .map(str::parse::<u128>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EncodeError::Common(format!("Invalid object identifier {dotted}: {e}")))?;
    let (first, second, rest) = match arcs.as_slice() {
        [first, second, rest @ ..] => (*first, *second, rest),
        _ => {
            return Err(EncodeError::Common(format!(
                "Object identifier {dotted} needs at least two arcs!"
            )))
        }
    };
    if first > 2 || second >= 40 {
        return Err(EncodeError::Unsupported(format!(
            "First arcs of {dotted} do not fit into a single octet!"
        )));
    }
    #[allow(clippy::cast_possible_truncation)]
    let mut content = alloc::vec![(first * 40 + second) as u8];
    for arc in rest {
        let mut groups = alloc::vec![];
        let mut remaining = *arc;
        loop {
            #[allow(clippy::cast_possible_truncation)]
            groups.push((remaining & 0x7f) as u8);
            remaining >>= 7;
            if remaining == 0 {
                break;
            }
        }
        let last = groups.len() - 1;
        content.extend(
            groups
                .iter()
                .rev()
                .enumerate()
                .map(|(i, group)| if i == last { *group } else { group | 0x80 }),
        );
    }
    Ok(content)
}

impl Encode for NodeRef<'_> {
    /// Writes identifier, definite length and the original content octets.
    fn encode(&self, output: &mut Encoder) -> Result<(), EncodeError> {
        encode_tlv(self.tag(), self.raw(), output)
    }
}

impl NodeRef<'_> {
    /// DER encoding of this node as found in the input.
    pub fn to_der(&self) -> Result<Bytes, EncodeError> {
        self.encode_to_vec().map(Bytes::from)
    }

    /// DER encoding of this node's content under a different tag,
    /// e.g. `[0] IMPLICIT` signed attributes re-tagged as `SET OF`.
    pub fn to_der_with_tag(&self, tag: Tag) -> Result<Bytes, EncodeError> {
        let mut encoder = Encoder::new();
        encode_tlv(tag, self.raw(), &mut encoder)?;
        Ok(encoder.into())
    }
}
