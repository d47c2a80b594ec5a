extern crate alloc;

use alloc::{string::String, vec::Vec};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::trace;
#[cfg(feature = "json")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    util, Asn1Tree, CertificateFields, Decode, DecodeError, Decoded, KnownOid, NodeId, NodeRef,
    SignatureInfo, Tag,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReceiptError {
    #[error("Receipt structure is invalid: {0} not found!")]
    InvalidReceiptBlock(&'static str),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Attribute types of the receipt payload, as numbered by Apple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReceiptAttributeType {
    ReceiptType = 0,
    BundleIdentifier = 2,
    BundleVersion = 3,
    OpaqueValue = 4,
    Sha1Hash = 5,
    AgeRating = 10,
    CreationDate = 12,
    InAppPurchase = 17,
    OriginalPurchaseDate = 18,
    OriginalApplicationVersion = 19,
    ExpirationDate = 21,
}

impl ReceiptAttributeType {
    #[must_use]
    pub fn from_type(value: u64) -> Option<Self> {
        Some(match value {
            0 => Self::ReceiptType,
            2 => Self::BundleIdentifier,
            3 => Self::BundleVersion,
            4 => Self::OpaqueValue,
            5 => Self::Sha1Hash,
            10 => Self::AgeRating,
            12 => Self::CreationDate,
            17 => Self::InAppPurchase,
            18 => Self::OriginalPurchaseDate,
            19 => Self::OriginalApplicationVersion,
            21 => Self::ExpirationDate,
            _ => return None,
        })
    }
}

/// Attribute types of an in-app purchase record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PurchaseAttributeType {
    Quantity = 1701,
    ProductIdentifier = 1702,
    TransactionIdentifier = 1703,
    PurchaseDate = 1704,
    OriginalTransactionIdentifier = 1705,
    OriginalPurchaseDate = 1706,
    ExpiresDate = 1708,
    WebOrderLineItemId = 1711,
    CancellationDate = 1712,
    IsInIntroOfferPeriod = 1719,
}

impl PurchaseAttributeType {
    #[must_use]
    pub fn from_type(value: u64) -> Option<Self> {
        Some(match value {
            1701 => Self::Quantity,
            1702 => Self::ProductIdentifier,
            1703 => Self::TransactionIdentifier,
            1704 => Self::PurchaseDate,
            1705 => Self::OriginalTransactionIdentifier,
            1706 => Self::OriginalPurchaseDate,
            1708 => Self::ExpiresDate,
            1711 => Self::WebOrderLineItemId,
            1712 => Self::CancellationDate,
            1719 => Self::IsInIntroOfferPeriod,
            _ => return None,
        })
    }
}

/// One in-app purchase found in the receipt.
/// An expiration date marks an auto-renewable subscription.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
pub struct PurchaseRecord {
    pub quantity: Option<u64>,
    pub product_identifier: Option<String>,
    pub transaction_identifier: Option<String>,
    pub original_transaction_identifier: Option<String>,
    pub purchase_date: Option<DateTime<Utc>>,
    pub original_purchase_date: Option<DateTime<Utc>>,
    pub expires_date: Option<DateTime<Utc>>,
    pub cancellation_date: Option<DateTime<Utc>>,
    pub is_in_intro_offer_period: Option<u64>,
    pub web_order_line_item_id: Option<u64>,
}

/// Fields of the receipt attribute set.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
pub struct ReceiptPayload {
    /// e.g. `ProductionSandbox`
    pub receipt_type: Option<String>,
    pub bundle_identifier: Option<String>,
    /// attribute content as stored, used for the device hash
    pub bundle_identifier_data: Option<Bytes>,
    pub bundle_version: Option<String>,
    pub original_application_version: Option<String>,
    pub opaque_value: Option<Bytes>,
    pub sha1_hash: Option<Bytes>,
    pub age_rating: Option<String>,
    pub creation_date: Option<DateTime<Utc>>,
    pub creation_date_string: Option<String>,
    pub original_purchase_date: Option<DateTime<Utc>>,
    pub original_purchase_date_string: Option<String>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub expiration_date_string: Option<String>,
    pub purchases: Vec<PurchaseRecord>,
}

#[cfg(feature = "json")]
impl ReceiptPayload {
    pub fn to_json(&self) -> Result<String, crate::EncodeError> {
        serde_json::to_string(self).map_err(|e| {
            crate::EncodeError::Json(alloc::format!("Error encoding JSON: {e:?}"))
        })
    }
}

/// `SEQUENCE { type INTEGER, version INTEGER, value OCTET STRING }`
struct Attribute<'t> {
    kind: u64,
    value: NodeRef<'t>,
}

impl<'t> Attribute<'t> {
    fn read(node: NodeRef<'t>) -> Option<Self> {
        let kind = node.child(0)?.value().as_u64()?;
        let value = node.child(2)?;
        Some(Self { kind, value })
    }

    fn string(&self) -> Option<String> {
        self.value.as_string().map(String::from)
    }

    fn integer(&self) -> Option<u64> {
        self.value.child(0)?.value().as_u64()
    }

    fn date(&self) -> Option<DateTime<Utc>> {
        self.value.as_string().and_then(util::parse_receipt_date)
    }

    fn raw(&self) -> Bytes {
        self.value.raw().clone()
    }
}

fn extract_payload(attributes: NodeRef<'_>) -> ReceiptPayload {
    let mut payload = ReceiptPayload::default();
    for attribute in attributes.children().filter_map(Attribute::read) {
        let Some(kind) = ReceiptAttributeType::from_type(attribute.kind) else {
            trace!("Skipping receipt attribute of type {}", attribute.kind);
            continue;
        };
        match kind {
            ReceiptAttributeType::ReceiptType => payload.receipt_type = attribute.string(),
            ReceiptAttributeType::BundleIdentifier => {
                payload.bundle_identifier = attribute.string();
                payload.bundle_identifier_data = Some(attribute.raw());
            }
            ReceiptAttributeType::BundleVersion => payload.bundle_version = attribute.string(),
            ReceiptAttributeType::OpaqueValue => payload.opaque_value = Some(attribute.raw()),
            ReceiptAttributeType::Sha1Hash => payload.sha1_hash = Some(attribute.raw()),
            ReceiptAttributeType::AgeRating => payload.age_rating = attribute.string(),
            ReceiptAttributeType::CreationDate => {
                payload.creation_date = attribute.date();
                payload.creation_date_string = attribute.string();
            }
            ReceiptAttributeType::OriginalPurchaseDate => {
                payload.original_purchase_date = attribute.date();
                payload.original_purchase_date_string = attribute.string();
            }
            ReceiptAttributeType::ExpirationDate => {
                payload.expiration_date = attribute.date();
                payload.expiration_date_string = attribute.string();
            }
            ReceiptAttributeType::OriginalApplicationVersion => {
                payload.original_application_version = attribute.string();
            }
            ReceiptAttributeType::InAppPurchase => {
                payload.purchases.push(extract_purchase(attribute.value));
            }
        }
    }
    payload
}

fn extract_purchase(value: NodeRef<'_>) -> PurchaseRecord {
    let mut record = PurchaseRecord::default();
    let fields = value.child(0).into_iter().flat_map(|set| set.children());
    for field in fields.filter_map(Attribute::read) {
        let Some(kind) = PurchaseAttributeType::from_type(field.kind) else {
            trace!("Skipping purchase attribute of type {}", field.kind);
            continue;
        };
        match kind {
            PurchaseAttributeType::Quantity => record.quantity = field.integer(),
            PurchaseAttributeType::ProductIdentifier => record.product_identifier = field.string(),
            PurchaseAttributeType::TransactionIdentifier => {
                record.transaction_identifier = field.string();
            }
            PurchaseAttributeType::OriginalTransactionIdentifier => {
                record.original_transaction_identifier = field.string();
            }
            PurchaseAttributeType::PurchaseDate => record.purchase_date = field.date(),
            PurchaseAttributeType::OriginalPurchaseDate => {
                record.original_purchase_date = field.date();
            }
            PurchaseAttributeType::ExpiresDate => record.expires_date = field.date(),
            PurchaseAttributeType::CancellationDate => record.cancellation_date = field.date(),
            PurchaseAttributeType::WebOrderLineItemId => {
                record.web_order_line_item_id = field.integer();
            }
            PurchaseAttributeType::IsInIntroOfferPeriod => {
                record.is_in_intro_offer_period = field.integer();
            }
        }
    }
    record
}

/// A decoded App Store receipt: the ASN.1 tree together with the
/// structures read from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    tree: Asn1Tree,
    signed_data: NodeId,
    content: NodeId,
    payload: ReceiptPayload,
    digest_algorithms: Vec<String>,
    certificates: Vec<CertificateFields>,
    signatures: Vec<SignatureInfo>,
}

impl Decode for Receipt {
    type Error = ReceiptError;

    fn decode<I: Into<Bytes>>(input: I) -> Result<Decoded<Self>, ReceiptError> {
        let Decoded {
            bytes_consumed,
            decoded,
        } = Asn1Tree::decode(input)?;
        Ok(Decoded {
            bytes_consumed,
            decoded: Receipt::try_from(decoded)?,
        })
    }
}

impl TryFrom<Asn1Tree> for Receipt {
    type Error = ReceiptError;

    fn try_from(tree: Asn1Tree) -> Result<Self, ReceiptError> {
        let signed_data = signed_data_block(&tree)?;
        let content = receipt_content(signed_data)?;
        let attributes = content
            .child(0)
            .ok_or(ReceiptError::InvalidReceiptBlock("receipt attribute set"))?;

        let payload = extract_payload(attributes);
        let digest_algorithms = digest_algorithms(signed_data);
        let certificates = signed_data
            .children()
            .find(|child| child.tag() == Tag::context_specific(0, true))
            .map(|set| set.children().filter_map(CertificateFields::read).collect())
            .unwrap_or_default();
        let signatures = signed_data
            .last_child()
            .filter(|child| child.tag() == Tag::SET)
            .map(|set| set.children().filter_map(SignatureInfo::read).collect())
            .unwrap_or_default();
        let (signed_data, content) = (signed_data.id(), content.id());

        Ok(Self {
            tree,
            signed_data,
            content,
            payload,
            digest_algorithms,
            certificates,
            signatures,
        })
    }
}

/// `ContentInfo` → `[0] EXPLICIT` → `SignedData`
fn signed_data_block(tree: &Asn1Tree) -> Result<NodeRef<'_>, ReceiptError> {
    tree.root(0)
        .and_then(|content_info| content_info.child(1))
        .and_then(|explicit| explicit.child(0))
        .ok_or(ReceiptError::InvalidReceiptBlock("PKCS #7 signed data"))
}

/// The `eContent` OCTET STRING of the encapsulated pkcs7-data content.
fn receipt_content(signed_data: NodeRef<'_>) -> Result<NodeRef<'_>, ReceiptError> {
    signed_data
        .find_oid(KnownOid::Pkcs7Data.oid())
        .ok_or(ReceiptError::InvalidReceiptBlock("pkcs7-data content type"))?
        .parent()
        .and_then(|content_info| content_info.last_child())
        .and_then(|explicit| explicit.child(0))
        .ok_or(ReceiptError::InvalidReceiptBlock("receipt content"))
}

fn digest_algorithms(signed_data: NodeRef<'_>) -> Vec<String> {
    signed_data
        .child(1)
        .into_iter()
        .flat_map(|set| set.children())
        .filter_map(|algorithm| algorithm.child(0)?.value().as_oid().map(String::from))
        .collect()
}

impl Receipt {
    #[must_use]
    pub fn tree(&self) -> &Asn1Tree {
        &self.tree
    }

    #[must_use]
    pub fn payload(&self) -> &ReceiptPayload {
        &self.payload
    }

    /// The PKCS #7 `SignedData` block.
    #[must_use]
    pub fn signed_data(&self) -> Option<NodeRef<'_>> {
        self.tree.node(self.signed_data)
    }

    /// Content octets covered by the signature when no signed
    /// attributes are present.
    #[must_use]
    pub fn signed_content(&self) -> Bytes {
        self.tree
            .node(self.content)
            .map(|content| content.raw().clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn digest_algorithms(&self) -> &[String] {
        &self.digest_algorithms
    }

    /// Certificates in the order they appear, the signing certificate first.
    #[must_use]
    pub fn certificates(&self) -> &[CertificateFields] {
        &self.certificates
    }

    #[must_use]
    pub fn signatures(&self) -> &[SignatureInfo] {
        &self.signatures
    }
}
