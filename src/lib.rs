#![doc = include_str!("../README.md")]
extern crate alloc;

mod cursor;
mod decode;
mod encode;
pub mod oid;
mod purchases;
mod receipt;
pub(crate) mod util;
#[cfg(feature = "validate")]
mod validate;
mod x509;

use alloc::{string::String, vec::Vec};
use core::fmt::{self, Debug, Display};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use num::BigUint;
use num_traits::ToPrimitive;
#[cfg(feature = "json")]
use serde::{Deserialize, Serialize};

pub use cursor::Cursor;
pub use decode::*;
pub use encode::*;
pub use oid::KnownOid;
pub use purchases::*;
pub use receipt::*;
#[cfg(feature = "validate")]
pub use validate::*;
pub use x509::*;

/// Class bits (7 and 6) of an ASN.1 identifier octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
pub enum TagClass {
    Universal,
    Application,
    ContextSpecific,
    Private,
}

impl From<u8> for TagClass {
    fn from(bits: u8) -> Self {
        match bits & 0b11 {
            0 => TagClass::Universal,
            1 => TagClass::Application,
            2 => TagClass::ContextSpecific,
            _ => TagClass::Private,
        }
    }
}

/// Tag numbers of the universal class.
/// Numbers without a variant are kept as raw tag numbers on the [`Tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum UniversalTag {
    EndOfContent = 0,
    Boolean = 1,
    Integer = 2,
    BitString = 3,
    OctetString = 4,
    Null = 5,
    ObjectIdentifier = 6,
    ObjectDescriptor = 7,
    External = 8,
    Real = 9,
    Enumerated = 10,
    EmbeddedPdv = 11,
    Utf8String = 12,
    RelativeOid = 13,
    Sequence = 16,
    Set = 17,
    NumericString = 18,
    PrintableString = 19,
    T61String = 20,
    VideotexString = 21,
    Ia5String = 22,
    UtcTime = 23,
    GeneralizedTime = 24,
    GraphicString = 25,
    VisibleString = 26,
    GeneralString = 27,
    UniversalString = 28,
    CharacterString = 29,
    BmpString = 30,
}

impl TryFrom<u8> for UniversalTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => UniversalTag::EndOfContent,
            1 => UniversalTag::Boolean,
            2 => UniversalTag::Integer,
            3 => UniversalTag::BitString,
            4 => UniversalTag::OctetString,
            5 => UniversalTag::Null,
            6 => UniversalTag::ObjectIdentifier,
            7 => UniversalTag::ObjectDescriptor,
            8 => UniversalTag::External,
            9 => UniversalTag::Real,
            10 => UniversalTag::Enumerated,
            11 => UniversalTag::EmbeddedPdv,
            12 => UniversalTag::Utf8String,
            13 => UniversalTag::RelativeOid,
            16 => UniversalTag::Sequence,
            17 => UniversalTag::Set,
            18 => UniversalTag::NumericString,
            19 => UniversalTag::PrintableString,
            20 => UniversalTag::T61String,
            21 => UniversalTag::VideotexString,
            22 => UniversalTag::Ia5String,
            23 => UniversalTag::UtcTime,
            24 => UniversalTag::GeneralizedTime,
            25 => UniversalTag::GraphicString,
            26 => UniversalTag::VisibleString,
            27 => UniversalTag::GeneralString,
            28 => UniversalTag::UniversalString,
            29 => UniversalTag::CharacterString,
            30 => UniversalTag::BmpString,
            other => return Err(other),
        })
    }
}

/// Decoded identifier octet.
/// Tag numbers above 30 (multi-octet identifiers) are not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
pub struct Tag {
    pub class: TagClass,
    pub constructed: bool,
    pub number: u8,
}

impl Tag {
    pub const SEQUENCE: Tag = Tag::universal(UniversalTag::Sequence, true);
    pub const SET: Tag = Tag::universal(UniversalTag::Set, true);

    #[must_use]
    pub const fn universal(kind: UniversalTag, constructed: bool) -> Self {
        Self {
            class: TagClass::Universal,
            constructed,
            number: kind as u8,
        }
    }

    #[must_use]
    pub const fn context_specific(number: u8, constructed: bool) -> Self {
        Self {
            class: TagClass::ContextSpecific,
            constructed,
            number,
        }
    }

    /// Returns the universal tag kind, or `None` for other classes
    /// and unassigned universal numbers.
    #[must_use]
    pub fn kind(&self) -> Option<UniversalTag> {
        match self.class {
            TagClass::Universal => UniversalTag::try_from(self.number).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is(&self, kind: UniversalTag) -> bool {
        self.kind() == Some(kind)
    }

    #[must_use]
    pub fn is_end_of_content(&self) -> bool {
        !self.constructed && self.is(UniversalTag::EndOfContent)
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.class, self.kind()) {
            (TagClass::Universal, Some(kind)) => write!(f, "{kind:?}"),
            (TagClass::Universal, None) => write!(f, "UNIVERSAL {}", self.number),
            (TagClass::Application, _) => write!(f, "[APPLICATION {}]", self.number),
            (TagClass::ContextSpecific, _) => write!(f, "[{}]", self.number),
            (TagClass::Private, _) => write!(f, "[PRIVATE {}]", self.number),
        }
    }
}

/// Decoded value of a primitive node.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Asn1Value {
    #[default]
    Absent,
    Boolean(bool),
    /// Big-endian unsigned integer with leading zero octets stripped.
    /// Zero is represented by an empty buffer.
    Integer(Bytes),
    String(String),
    Bytes(Bytes),
    Date(DateTime<Utc>),
    /// Dotted-decimal object identifier.
    ObjectIdentifier(String),
}

impl Asn1Value {
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Asn1Value::Absent)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Asn1Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte content of integer and byte-blob values.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Asn1Value::Integer(b) | Asn1Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_big_uint(&self) -> Option<BigUint> {
        match self {
            Asn1Value::Integer(b) => Some(BigUint::from_bytes_be(b)),
            _ => None,
        }
    }

    /// Integer value, if it fits into 64 bits.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        self.as_big_uint().and_then(|int| int.to_u64())
    }

    #[must_use]
    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Asn1Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_oid(&self) -> Option<&str> {
        match self {
            Asn1Value::ObjectIdentifier(oid) => Some(oid),
            _ => None,
        }
    }
}

impl Display for Asn1Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asn1Value::Absent => Ok(()),
            Asn1Value::Boolean(b) => write!(f, "{b}"),
            Asn1Value::Integer(b) => write!(f, "{}", BigUint::from_bytes_be(b)),
            Asn1Value::String(s) => write!(f, "{s}"),
            Asn1Value::Bytes(b) => {
                for byte in b.iter() {
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            }
            Asn1Value::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Asn1Value::ObjectIdentifier(oid) => match oid::name_of(oid) {
                Some(name) => write!(f, "{oid} ({name})"),
                None => write!(f, "{oid}"),
            },
        }
    }
}

/// Index of a node inside its [`Asn1Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// A decoded tag-length-value triple.
#[derive(Debug, Clone, PartialEq)]
pub struct Asn1Node {
    pub tag: Tag,
    /// content octets as found in the input
    pub raw: Bytes,
    pub value: Asn1Value,
    pub(crate) children: Vec<NodeId>,
    pub(crate) parent: Option<NodeId>,
}

impl Asn1Node {
    pub(crate) fn new(tag: Tag, raw: Bytes, parent: Option<NodeId>) -> Self {
        Self {
            tag,
            raw,
            value: Asn1Value::Absent,
            children: Vec::new(),
            parent,
        }
    }
}

/// Arena holding every node of a decoded buffer.
/// Children and parents refer to each other through [`NodeId`]s.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Asn1Tree {
    nodes: Vec<Asn1Node>,
    roots: Vec<NodeId>,
}

impl Asn1Tree {
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> impl ExactSizeIterator<Item = NodeRef<'_>> + '_ {
        self.roots.iter().map(|id| NodeRef { tree: self, id: *id })
    }

    #[must_use]
    pub fn root(&self, index: usize) -> Option<NodeRef<'_>> {
        self.roots.get(index).map(|id| NodeRef { tree: self, id: *id })
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<NodeRef<'_>> {
        (id.0 < self.nodes.len()).then_some(NodeRef { tree: self, id })
    }

    pub(crate) fn push(&mut self, node: Asn1Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        match node.parent {
            Some(parent) => self.nodes[parent.0].children.push(id),
            None => self.roots.push(id),
        }
        self.nodes.push(node);
        id
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Asn1Node {
        &mut self.nodes[id.0]
    }

    /// Drops every node created at or after `checkpoint` and
    /// unlinks them from `owner`.
    pub(crate) fn rollback(&mut self, checkpoint: usize, owner: NodeId) {
        self.nodes.truncate(checkpoint);
        self.nodes[owner.0].children.clear();
    }
}

impl Display for Asn1Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for root in self.roots() {
            for (depth, node) in root.walk() {
                let tag = node.tag();
                write!(f, "{:indent$}{tag}", "", indent = depth * 2)?;
                if node.value().is_absent() {
                    writeln!(f)?;
                } else {
                    writeln!(f, ": {}", node.value())?;
                }
            }
        }
        Ok(())
    }
}

/// Borrowed handle to a node, used for navigating the tree.
#[derive(Clone, Copy)]
pub struct NodeRef<'t> {
    tree: &'t Asn1Tree,
    id: NodeId,
}

impl Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id)
            .field("tag", &self.tag())
            .field("value", self.value())
            .finish()
    }
}

impl PartialEq for NodeRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.tree, other.tree) && self.id == other.id
    }
}

impl<'t> NodeRef<'t> {
    fn inner(&self) -> &'t Asn1Node {
        &self.tree.nodes[self.id.0]
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn tree(&self) -> &'t Asn1Tree {
        self.tree
    }

    #[must_use]
    pub fn tag(&self) -> Tag {
        self.inner().tag
    }

    #[must_use]
    pub fn raw(&self) -> &'t Bytes {
        &self.inner().raw
    }

    #[must_use]
    pub fn value(&self) -> &'t Asn1Value {
        &self.inner().value
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeRef<'t>> {
        self.inner().parent.map(|id| NodeRef {
            tree: self.tree,
            id,
        })
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.inner().children.len()
    }

    #[must_use]
    pub fn child(&self, index: usize) -> Option<NodeRef<'t>> {
        self.inner().children.get(index).map(|id| NodeRef {
            tree: self.tree,
            id: *id,
        })
    }

    #[must_use]
    pub fn last_child(&self) -> Option<NodeRef<'t>> {
        self.inner().children.last().map(|id| NodeRef {
            tree: self.tree,
            id: *id,
        })
    }

    pub fn children(&self) -> impl ExactSizeIterator<Item = NodeRef<'t>> + 't {
        let tree = self.tree;
        self.inner()
            .children
            .iter()
            .map(move |id| NodeRef { tree, id: *id })
    }

    /// Pre-order traversal starting at (and including) this node,
    /// yielding the depth relative to this node.
    #[must_use]
    pub fn walk(&self) -> Walk<'t> {
        Walk {
            tree: self.tree,
            stack: alloc::vec![(0, self.id)],
        }
    }

    /// Finds the first OBJECT IDENTIFIER below this node whose value is `oid`.
    #[must_use]
    pub fn find_oid(&self, oid: &str) -> Option<NodeRef<'t>> {
        self.walk().skip(1).map(|(_, node)| node).find(|node| {
            node.tag().is(UniversalTag::ObjectIdentifier) && node.value().as_oid() == Some(oid)
        })
    }

    /// First string value of this node or any node below it.
    #[must_use]
    pub fn as_string(&self) -> Option<&'t str> {
        self.walk().find_map(|(_, node)| node.value().as_str())
    }

    /// Follows the first child until reaching a node without children.
    #[must_use]
    pub fn first_leaf(&self) -> NodeRef<'t> {
        let mut node = *self;
        while let Some(child) = node.child(0) {
            node = child;
        }
        node
    }
}

/// Iterator returned by [`NodeRef::walk`].
pub struct Walk<'t> {
    tree: &'t Asn1Tree,
    stack: Vec<(usize, NodeId)>,
}

impl<'t> Iterator for Walk<'t> {
    type Item = (usize, NodeRef<'t>);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, id) = self.stack.pop()?;
        let node = &self.tree.nodes[id.0];
        self.stack
            .extend(node.children.iter().rev().map(|child| (depth + 1, *child)));
        Some((depth, NodeRef { tree: self.tree, id }))
    }
}
