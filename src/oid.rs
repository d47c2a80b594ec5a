//! Object identifiers known to the receipt and certificate walkers.
//!
//! The table is a process-wide constant; lookups never allocate.

extern crate alloc;

use alloc::string::String;
use core::fmt::{self, Display, Write};

#[cfg(feature = "json")]
use serde::{Deserialize, Serialize};

macro_rules! known_oids {
    ($($variant:ident => $oid:literal, $name:literal;)*) => {
        /// Algorithms, content types and attribute types recognized by name.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
        pub enum KnownOid {
            $($variant,)*
        }

        static TABLE: &[(&str, KnownOid, &str)] = &[
            $(($oid, KnownOid::$variant, $name),)*
        ];
    };
}

known_oids! {
    // PKCS #7 content types
    Pkcs7Data => "1.2.840.113549.1.7.1", "pkcs7-data";
    Pkcs7SignedData => "1.2.840.113549.1.7.2", "pkcs7-signedData";
    Pkcs7EnvelopedData => "1.2.840.113549.1.7.3", "pkcs7-envelopedData";
    Pkcs7SignedAndEnvelopedData => "1.2.840.113549.1.7.4", "pkcs7-signedAndEnvelopedData";
    Pkcs7DigestedData => "1.2.840.113549.1.7.5", "pkcs7-digestedData";
    Pkcs7EncryptedData => "1.2.840.113549.1.7.6", "pkcs7-encryptedData";
    // PKCS #9 attributes
    EmailAddress => "1.2.840.113549.1.9.1", "emailAddress";
    ContentType => "1.2.840.113549.1.9.3", "contentType";
    MessageDigest => "1.2.840.113549.1.9.4", "messageDigest";
    SigningTime => "1.2.840.113549.1.9.5", "signingTime";
    // public key and signature algorithms
    Dsa => "1.2.840.10040.4.1", "dsa";
    EcPublicKey => "1.2.840.10045.2.1", "ecPublicKey";
    Prime256v1 => "1.2.840.10045.3.1.7", "prime256v1";
    Secp384r1 => "1.3.132.0.34", "secp384r1";
    EcdsaWithSha256 => "1.2.840.10045.4.3.2", "ecdsaWithSHA256";
    EcdsaWithSha384 => "1.2.840.10045.4.3.3", "ecdsaWithSHA384";
    EcdsaWithSha512 => "1.2.840.10045.4.3.4", "ecdsaWithSHA512";
    RsaEncryption => "1.2.840.113549.1.1.1", "rsaEncryption";
    Md5WithRsaEncryption => "1.2.840.113549.1.1.4", "md5WithRSAEncryption";
    Sha1WithRsaEncryption => "1.2.840.113549.1.1.5", "sha1WithRSAEncryption";
    RsaPss => "1.2.840.113549.1.1.10", "rsaPSS";
    Sha256WithRsaEncryption => "1.2.840.113549.1.1.11", "sha256WithRSAEncryption";
    Sha384WithRsaEncryption => "1.2.840.113549.1.1.12", "sha384WithRSAEncryption";
    Sha512WithRsaEncryption => "1.2.840.113549.1.1.13", "sha512WithRSAEncryption";
    // digest algorithms
    Md5 => "1.2.840.113549.2.5", "md5";
    Sha1 => "1.3.14.3.2.26", "sha1";
    Sha256 => "2.16.840.1.101.3.4.2.1", "sha256";
    Sha384 => "2.16.840.1.101.3.4.2.2", "sha384";
    Sha512 => "2.16.840.1.101.3.4.2.3", "sha512";
    Sha3_224 => "2.16.840.1.101.3.4.2.7", "sha3-224";
    Sha3_256 => "2.16.840.1.101.3.4.2.8", "sha3-256";
    Sha3_384 => "2.16.840.1.101.3.4.2.9", "sha3-384";
    // X.520 name attributes
    CommonName => "2.5.4.3", "commonName";
    Surname => "2.5.4.4", "surname";
    SerialNumber => "2.5.4.5", "serialNumber";
    CountryName => "2.5.4.6", "countryName";
    LocalityName => "2.5.4.7", "localityName";
    StateOrProvinceName => "2.5.4.8", "stateOrProvinceName";
    OrganizationName => "2.5.4.10", "organizationName";
    OrganizationalUnitName => "2.5.4.11", "organizationalUnitName";
    Title => "2.5.4.12", "title";
    DomainComponent => "0.9.2342.19200300.100.1.25", "domainComponent";
    UserId => "0.9.2342.19200300.100.1.1", "userId";
    // certificate extensions
    SubjectKeyIdentifier => "2.5.29.14", "subjectKeyIdentifier";
    KeyUsage => "2.5.29.15", "keyUsage";
    BasicConstraints => "2.5.29.19", "basicConstraints";
    CrlDistributionPoints => "2.5.29.31", "cRLDistributionPoints";
    CertificatePolicies => "2.5.29.32", "certificatePolicies";
    AuthorityKeyIdentifier => "2.5.29.35", "authorityKeyIdentifier";
    ExtendedKeyUsage => "2.5.29.37", "extKeyUsage";
    AuthorityInfoAccess => "1.3.6.1.5.5.7.1.1", "authorityInfoAccess";
    EtsiQcsCompliance => "0.4.0.1862.1.1", "etsiQcsCompliance";
    EtsiQcsRetentionPeriod => "0.4.0.1862.1.3", "etsiQcsRetentionPeriod";
    EtsiQcsQcSscd => "0.4.0.1862.1.4", "etsiQcsQcSSCD";
    // Apple certificate markers
    AppleReceiptSigning => "1.2.840.113635.100.6.11.1", "appleReceiptSigning";
    AppleWwdrIntermediate => "1.2.840.113635.100.6.2.1", "appleWwdrIntermediate";
}

impl KnownOid {
    /// Looks up a dotted-decimal identifier.
    #[must_use]
    pub fn from_oid(oid: &str) -> Option<Self> {
        TABLE
            .iter()
            .find(|(dotted, _, _)| *dotted == oid)
            .map(|(_, known, _)| *known)
    }

    #[must_use]
    pub fn oid(&self) -> &'static str {
        self.entry().0
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.entry().2
    }

    fn entry(&self) -> &'static (&'static str, KnownOid, &'static str) {
        // every variant is generated together with its table row
        TABLE
            .iter()
            .find(|(_, known, _)| known == self)
            .unwrap_or(&TABLE[0])
    }
}

impl Display for KnownOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Human readable name of a dotted-decimal identifier, if it is known.
#[must_use]
pub fn name_of(oid: &str) -> Option<&'static str> {
    KnownOid::from_oid(oid).map(|known| known.name())
}

/// Decodes the content octets of an OBJECT IDENTIFIER into dotted-decimal form.
///
/// The first octet carries the first two arcs (`first / 40`, `first % 40`);
/// every following arc is base-128 with the high bit marking continuation.
/// An unterminated trailing arc is ignored.
#[must_use]
pub fn decode_oid(content: &[u8]) -> Option<String> {
    let (first, rest) = content.split_first()?;
    let mut dotted = String::new();
    write!(dotted, "{}.{}", first / 40, first % 40).ok()?;
    let mut arc: u128 = 0;
    for byte in rest {
        arc = arc.checked_mul(128)? | u128::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            write!(dotted, ".{arc}").ok()?;
            arc = 0;
        }
    }
    Some(dotted)
}
