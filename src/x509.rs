extern crate alloc;

use alloc::{string::String, vec::Vec};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use num::BigUint;
#[cfg(feature = "json")]
use serde::{Deserialize, Serialize};

use crate::{NodeRef, Tag, UniversalTag};

/// Attribute type and value pairs of an X.501 `Name`, in encoding order.
pub type DistinguishedName = Vec<(String, String)>;

fn read_name(name: NodeRef<'_>) -> DistinguishedName {
    name.children()
        .flat_map(|rdn| rdn.children())
        .filter_map(|atv| {
            let kind = atv.child(0)?.value().as_oid()?;
            let value = atv.child(1)?.as_string()?;
            Some((String::from(kind), String::from(value)))
        })
        .collect()
}

fn lookup<'n>(name: &'n DistinguishedName, oid: &str) -> Option<&'n str> {
    name.iter()
        .find(|(kind, _)| kind == oid)
        .map(|(_, value)| value.as_str())
}

fn algorithm_oid(identifier: NodeRef<'_>) -> Option<String> {
    identifier.child(0)?.value().as_oid().map(String::from)
}

/// Fields of an X.509 certificate carried in the PKCS #7 certificate set.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
pub struct CertificateFields {
    pub version: u64,
    pub serial_number: Bytes,
    pub signature_algorithm: Option<String>,
    pub issuer: DistinguishedName,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub subject: DistinguishedName,
    pub public_key_algorithm: Option<String>,
    /// content of the `subjectPublicKey` BIT STRING,
    /// a PKCS #1 `RSAPublicKey` for RSA keys
    pub subject_public_key: Bytes,
    pub extensions: Vec<String>,
    pub der: Bytes,
}

impl CertificateFields {
    /// Reads a `Certificate` node. Returns `None` if the node does not
    /// look like a certificate.
    #[must_use]
    pub fn read(certificate: NodeRef<'_>) -> Option<Self> {
        let tbs = certificate.child(0)?;
        if tbs.tag() != Tag::SEQUENCE {
            return None;
        }
        let explicit_version = tbs.child(0)?;
        let versioned = explicit_version.tag() == Tag::context_specific(0, true);
        // version 1 certificates omit the [0] field
        let field = |position: usize| {
            position
                .checked_sub(usize::from(!versioned))
                .and_then(|index| tbs.child(index))
        };
        let version = if versioned {
            explicit_version.first_leaf().value().as_u64()? + 1
        } else {
            1
        };
        let serial_number = field(1)?.value().as_bytes()?.clone();
        let signature_algorithm = field(2).and_then(algorithm_oid);
        let issuer = read_name(field(3)?);
        let validity = field(4)?;
        let not_before = validity.child(0).and_then(|time| time.value().as_date());
        let not_after = validity.child(1).and_then(|time| time.value().as_date());
        let subject = read_name(field(5)?);
        let public_key_info = field(6)?;
        let public_key_algorithm = public_key_info.child(0).and_then(algorithm_oid);
        let subject_public_key = public_key_info
            .child(1)
            .filter(|key| key.tag().is(UniversalTag::BitString))?
            .value()
            .as_bytes()?
            .clone();
        let extensions = field(7)
            .filter(|extensions| extensions.tag() == Tag::context_specific(3, true))
            .and_then(|extensions| extensions.child(0))
            .map(|sequence| {
                sequence
                    .children()
                    .filter_map(|extension| extension.child(0)?.value().as_oid().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            version,
            serial_number,
            signature_algorithm,
            issuer,
            not_before,
            not_after,
            subject,
            public_key_algorithm,
            subject_public_key,
            extensions,
            der: certificate.to_der().ok()?,
        })
    }

    #[must_use]
    pub fn serial(&self) -> BigUint {
        BigUint::from_bytes_be(&self.serial_number)
    }

    /// Value of the first issuer attribute of type `oid`.
    #[must_use]
    pub fn issuer(&self, oid: &str) -> Option<&str> {
        lookup(&self.issuer, oid)
    }

    #[must_use]
    pub fn subject(&self, oid: &str) -> Option<&str> {
        lookup(&self.subject, oid)
    }

    #[must_use]
    pub fn has_extension(&self, oid: &str) -> bool {
        self.extensions.iter().any(|extension| extension == oid)
    }

    /// True iff `date` lies strictly inside the validity window.
    #[must_use]
    pub fn check_validity(&self, date: DateTime<Utc>) -> bool {
        match (self.not_before, self.not_after) {
            (Some(not_before), Some(not_after)) => not_before < date && date < not_after,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
pub enum SignerIdentifier {
    IssuerAndSerialNumber {
        issuer: DistinguishedName,
        serial_number: Bytes,
    },
    SubjectKeyIdentifier(Bytes),
}

impl SignerIdentifier {
    fn read(sid: NodeRef<'_>) -> Option<Self> {
        if sid.tag() == Tag::SEQUENCE {
            Some(Self::IssuerAndSerialNumber {
                issuer: read_name(sid.child(0)?),
                serial_number: sid.child(1)?.value().as_bytes()?.clone(),
            })
        } else if sid.tag() == Tag::context_specific(0, false) {
            Some(Self::SubjectKeyIdentifier(sid.raw().clone()))
        } else {
            None
        }
    }

    /// Whether `certificate` is the one identified.
    #[must_use]
    pub fn identifies(&self, certificate: &CertificateFields) -> bool {
        match self {
            Self::IssuerAndSerialNumber {
                issuer,
                serial_number,
            } => *issuer == certificate.issuer && *serial_number == certificate.serial_number,
            Self::SubjectKeyIdentifier(_) => false,
        }
    }
}

/// A PKCS #7 `SignerInfo`:
/// ```text
/// SignerInfo ::= SEQUENCE {
///   version CMSVersion,
///   sid SignerIdentifier,
///   digestAlgorithm DigestAlgorithmIdentifier,
///   signedAttrs [0] IMPLICIT SignedAttributes OPTIONAL,
///   signatureAlgorithm SignatureAlgorithmIdentifier,
///   signature SignatureValue,
///   unsignedAttrs [1] IMPLICIT UnsignedAttributes OPTIONAL }
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
pub struct SignatureInfo {
    pub version: u64,
    pub signer: SignerIdentifier,
    pub digest_algorithm: String,
    /// DER of the signed attributes, re-tagged as `SET OF`
    pub signed_attributes: Option<Bytes>,
    pub signature_algorithm: String,
    pub signature: Bytes,
}

impl SignatureInfo {
    #[must_use]
    pub fn read(signer_info: NodeRef<'_>) -> Option<Self> {
        let version = signer_info.child(0)?.value().as_u64()?;
        let signer = SignerIdentifier::read(signer_info.child(1)?)?;
        let digest_algorithm = algorithm_oid(signer_info.child(2)?)?;
        let attributes = signer_info
            .child(3)
            .filter(|node| node.tag() == Tag::context_specific(0, true));
        let signed_attributes = match attributes {
            Some(attributes) => Some(attributes.to_der_with_tag(Tag::SET).ok()?),
            None => None,
        };
        let position = if signed_attributes.is_some() { 4 } else { 3 };
        let signature_algorithm = algorithm_oid(signer_info.child(position)?)?;
        let signature = signer_info
            .child(position + 1)
            .filter(|node| node.tag().is(UniversalTag::OctetString))?
            .raw()
            .clone();

        Some(Self {
            version,
            signer,
            digest_algorithm,
            signed_attributes,
            signature_algorithm,
            signature,
        })
    }

    /// The octets the signature was computed over: the signed attributes
    /// if present, the encapsulated content otherwise.
    #[must_use]
    pub fn signed_bytes(&self, content: &Bytes) -> Bytes {
        self.signed_attributes
            .clone()
            .unwrap_or_else(|| content.clone())
    }
}
