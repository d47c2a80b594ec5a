extern crate alloc;

use alloc::{boxed::Box, format, string::String};

use bytes::Bytes;
use log::{debug, warn};
use openssl::{
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{PKey, Public},
    rsa::Rsa,
    sign::Verifier,
};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::{KnownOid, Receipt, ReceiptPayload};

pub trait Validate {
    /// The `Validate` trait exposes a `validate` method that checks one aspect of a receipt.
    /// #### Returns
    /// - `Ok(ValidationResult::Success)` if the check passed
    /// - `Ok(ValidationResult::Failure { reason })` if the check failed
    /// - `Err(ValidationError)` if the check could not be run
    fn validate(&self) -> Result<ValidationResult, ValidationError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Success,
    Failure { reason: FailureReason },
}

impl ValidationResult {
    fn failure(reason: FailureReason) -> Self {
        ValidationResult::Failure { reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureFailure {
    #[error("receipt carries no signed data")]
    ReceiptSignedDataNotFound,
    #[error("signature does not match the signed content")]
    InvalidSignature,
    #[error("public key could not be loaded")]
    UnableToLoadPublicKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("Receipt hash does not match this device!")]
    HashValidation,
    #[error("Bundle identifier does not match the app!")]
    BundleIdentifierVerification,
    #[error("Bundle version does not match the app!")]
    BundleVersionVerification,
    #[error("Signature validation failed: {0}")]
    SignatureValidation(SignatureFailure),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Device identifier is not available on this platform!")]
    DeviceIdentifierUnavailable,
    #[error("{0}")]
    Unsupported(String),
    #[error("Cryptographic backend error: {0}")]
    Crypto(String),
}

impl From<ErrorStack> for ValidationError {
    fn from(value: ErrorStack) -> Self {
        ValidationError::Crypto(value.to_string())
    }
}

/// Steps of [`ReceiptValidator::validate`], in the order they are passed.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationState {
    Unvalidated,
    HashChecked,
    IdentityChecked,
    SignatureChecked,
    Valid,
    Failed(FailureReason),
}

/// Which Info.plist entry the app reports as its version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionKey {
    /// `CFBundleShortVersionString`
    ShortVersionString,
    /// `CFBundleVersion`
    BundleVersion,
}

impl Default for VersionKey {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            VersionKey::ShortVersionString
        } else {
            VersionKey::BundleVersion
        }
    }
}

/// Identity of the running app.
pub trait AppIdentity {
    fn bundle_identifier(&self) -> &str;
    fn bundle_version(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StaticAppIdentity {
    pub bundle_identifier: String,
    pub short_version_string: String,
    pub bundle_version: String,
    pub version_key: VersionKey,
}

impl StaticAppIdentity {
    /// Identity reporting `version` under either key.
    pub fn new(bundle_identifier: impl Into<String>, version: impl Into<String>) -> Self {
        let version = version.into();
        Self {
            bundle_identifier: bundle_identifier.into(),
            short_version_string: version.clone(),
            bundle_version: version,
            version_key: VersionKey::default(),
        }
    }
}

impl AppIdentity for StaticAppIdentity {
    fn bundle_identifier(&self) -> &str {
        &self.bundle_identifier
    }

    fn bundle_version(&self) -> &str {
        match self.version_key {
            VersionKey::ShortVersionString => &self.short_version_string,
            VersionKey::BundleVersion => &self.bundle_version,
        }
    }
}

/// Source of the 16 byte vendor identifier the receipt hash is bound to.
pub trait DeviceIdentifier {
    /// `None` where the platform has no such identifier.
    fn vendor_identifier(&self) -> Option<[u8; 16]>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StaticDeviceIdentifier(pub Option<[u8; 16]>);

impl From<[u8; 16]> for StaticDeviceIdentifier {
    fn from(value: [u8; 16]) -> Self {
        StaticDeviceIdentifier(Some(value))
    }
}

impl DeviceIdentifier for StaticDeviceIdentifier {
    fn vendor_identifier(&self) -> Option<[u8; 16]> {
        self.0
    }
}

/// Pinned public key the receipt signature is checked against. Keys
/// carried inside the receipt are never trusted.
#[derive(Debug, Clone, PartialEq)]
pub enum TrustedKey {
    /// PKCS #1 `RSAPublicKey`, DER encoded
    Pkcs1Der(Bytes),
}

pub struct ValidatorConfig {
    pub app: Box<dyn AppIdentity>,
    pub device: Box<dyn DeviceIdentifier>,
    pub trusted_key: TrustedKey,
}

impl ValidatorConfig {
    pub fn new(
        app: impl AppIdentity + 'static,
        device: impl DeviceIdentifier + 'static,
        trusted_key: TrustedKey,
    ) -> Self {
        Self {
            app: Box::new(app),
            device: Box::new(device),
            trusted_key,
        }
    }
}

/// Recomputes the device binding hash.
pub struct HashCheck<'a> {
    pub payload: &'a ReceiptPayload,
    pub device: &'a dyn DeviceIdentifier,
}

impl Validate for HashCheck<'_> {
    fn validate(&self) -> Result<ValidationResult, ValidationError> {
        let device = self
            .device
            .vendor_identifier()
            .ok_or(ValidationError::DeviceIdentifierUnavailable)?;
        let (Some(opaque), Some(bundle), Some(stored)) = (
            &self.payload.opaque_value,
            &self.payload.bundle_identifier_data,
            &self.payload.sha1_hash,
        ) else {
            return Ok(ValidationResult::failure(FailureReason::HashValidation));
        };
        let mut hasher = Sha1::new();
        hasher.update(device);
        hasher.update(opaque);
        hasher.update(bundle);
        if hasher.finalize().as_slice() == stored.as_ref() {
            Ok(ValidationResult::Success)
        } else {
            Ok(ValidationResult::failure(FailureReason::HashValidation))
        }
    }
}

pub struct IdentityCheck<'a> {
    pub payload: &'a ReceiptPayload,
    pub app: &'a dyn AppIdentity,
}

impl Validate for IdentityCheck<'_> {
    fn validate(&self) -> Result<ValidationResult, ValidationError> {
        if self.payload.bundle_identifier.as_deref() != Some(self.app.bundle_identifier()) {
            return Ok(ValidationResult::failure(
                FailureReason::BundleIdentifierVerification,
            ));
        }
        if self.payload.bundle_version.as_deref() != Some(self.app.bundle_version()) {
            return Ok(ValidationResult::failure(
                FailureReason::BundleVersionVerification,
            ));
        }
        Ok(ValidationResult::Success)
    }
}

/// Verifies the first signer's RSA PKCS #1 v1.5 signature.
pub struct SignatureCheck<'a> {
    pub receipt: &'a Receipt,
    pub trusted_key: &'a TrustedKey,
}

fn signature_failure(failure: SignatureFailure) -> ValidationResult {
    ValidationResult::failure(FailureReason::SignatureValidation(failure))
}

fn message_digest(oid: &str) -> Result<MessageDigest, ValidationError> {
    match KnownOid::from_oid(oid) {
        Some(KnownOid::Sha1) => Ok(MessageDigest::sha1()),
        Some(KnownOid::Sha256) => Ok(MessageDigest::sha256()),
        Some(KnownOid::Sha384) => Ok(MessageDigest::sha384()),
        Some(KnownOid::Sha512) => Ok(MessageDigest::sha512()),
        _ => Err(ValidationError::Unsupported(format!(
            "Digest algorithm {oid} is unsupported!"
        ))),
    }
}

fn rsa_public_key(pkcs1: &[u8]) -> Result<PKey<Public>, ErrorStack> {
    let rsa = Rsa::public_key_from_der_pkcs1(pkcs1)?;
    PKey::from_rsa(rsa)
}

impl Validate for SignatureCheck<'_> {
    fn validate(&self) -> Result<ValidationResult, ValidationError> {
        let content = self.receipt.signed_content();
        let Some(signature) = self.receipt.signatures().first() else {
            return Ok(signature_failure(SignatureFailure::ReceiptSignedDataNotFound));
        };
        if content.is_empty() || signature.signature.is_empty() {
            return Ok(signature_failure(SignatureFailure::ReceiptSignedDataNotFound));
        }
        let TrustedKey::Pkcs1Der(key) = self.trusted_key;
        let public_key = match rsa_public_key(key) {
            Ok(public_key) => public_key,
            Err(e) => {
                debug!("Loading RSA public key failed: {e}");
                return Ok(signature_failure(SignatureFailure::UnableToLoadPublicKey));
            }
        };
        let digest = message_digest(&signature.digest_algorithm)?;
        let signed = signature.signed_bytes(&content);
        let mut verifier = Verifier::new(digest, &public_key)?;
        match verifier.verify_oneshot(&signature.signature, &signed) {
            Ok(true) => Ok(ValidationResult::Success),
            Ok(false) => Ok(signature_failure(SignatureFailure::InvalidSignature)),
            Err(e) => {
                debug!("RSA verification rejected the signature: {e}");
                Ok(signature_failure(SignatureFailure::InvalidSignature))
            }
        }
    }
}

macro_rules! validate_and_continue {
    ($state:expr, $candidate:expr, $next:expr) => {
        match $candidate.validate()? {
            ValidationResult::Success => {
                debug!("Receipt validation step passed, now {:?}", $next);
                $state = $next;
            }
            failure => return Ok(failure),
        }
    };
}

/// Runs hash, identity and signature checks against a decoded receipt.
/// The first failing check ends validation; the outcome is kept and
/// returned by later calls.
pub struct ReceiptValidator<'r> {
    receipt: &'r Receipt,
    config: ValidatorConfig,
    state: ValidationState,
}

impl<'r> ReceiptValidator<'r> {
    #[must_use]
    pub fn new(receipt: &'r Receipt, config: ValidatorConfig) -> Self {
        Self {
            receipt,
            config,
            state: ValidationState::Unvalidated,
        }
    }

    #[must_use]
    pub fn state(&self) -> &ValidationState {
        &self.state
    }

    #[must_use]
    pub fn receipt(&self) -> &'r Receipt {
        self.receipt
    }

    #[must_use]
    pub fn payload(&self) -> &'r ReceiptPayload {
        self.receipt.payload()
    }

    pub fn validate(&mut self) -> Result<ValidationResult, ValidationError> {
        match &self.state {
            ValidationState::Valid => return Ok(ValidationResult::Success),
            ValidationState::Failed(reason) => return Ok(ValidationResult::failure(*reason)),
            _ => (),
        }
        let result = self.run_checks()?;
        self.state = match &result {
            ValidationResult::Success => ValidationState::Valid,
            ValidationResult::Failure { reason } => {
                warn!("Receipt validation failed: {reason}");
                ValidationState::Failed(*reason)
            }
        };
        Ok(result)
    }

    pub fn is_valid_receipt(&mut self) -> Result<bool, ValidationError> {
        Ok(self.validate()? == ValidationResult::Success)
    }

    fn run_checks(&mut self) -> Result<ValidationResult, ValidationError> {
        let receipt = self.receipt;
        let config = &self.config;
        validate_and_continue!(
            self.state,
            HashCheck {
                payload: receipt.payload(),
                device: config.device.as_ref(),
            },
            ValidationState::HashChecked
        );
        validate_and_continue!(
            self.state,
            IdentityCheck {
                payload: receipt.payload(),
                app: config.app.as_ref(),
            },
            ValidationState::IdentityChecked
        );
        validate_and_continue!(
            self.state,
            SignatureCheck {
                receipt,
                trusted_key: &config.trusted_key,
            },
            ValidationState::SignatureChecked
        );
        Ok(ValidationResult::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        encode_oid,
        receipt::tests::{load, SANDBOX_RECEIPT, SUBSCRIPTION_RECEIPT},
        Decode,
    };
    use alloc::{rc::Rc, vec::Vec};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use core::cell::Cell;
    use openssl::{
        asn1::Asn1Time,
        bn::BigNum,
        pkcs7::{Pkcs7, Pkcs7Flags},
        stack::Stack,
        x509::{X509NameBuilder, X509},
    };

    const DEVICE: [u8; 16] = [
        0x3b, 0x21, 0x9c, 0x04, 0x8e, 0x6f, 0x4d, 0x12, 0xa0, 0x77, 0x5e, 0xc3, 0x19, 0x40, 0xbd,
        0x2a,
    ];

    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = alloc::vec![tag];
        match content.len() {
            len if len < 128 => out.push(len as u8),
            len if len < 256 => out.extend([0x81, len as u8]),
            len => out.extend([0x82, (len >> 8) as u8, len as u8]),
        }
        out.extend_from_slice(content);
        out
    }

    fn attribute(kind: u8, value: &[u8]) -> Vec<u8> {
        tlv(
            0x30,
            &[tlv(0x02, &[kind]), tlv(0x02, &[0x01]), tlv(0x04, value)].concat(),
        )
    }

    /// Receipt attribute set for `com.example.shop` 2.1 bound to [`DEVICE`].
    fn receipt_attributes() -> Vec<u8> {
        let bundle = tlv(0x0c, b"com.example.shop");
        let opaque = [0xa5; 16];
        let mut hasher = Sha1::new();
        hasher.update(DEVICE);
        hasher.update(opaque);
        hasher.update(&bundle);
        let hash = hasher.finalize();
        tlv(
            0x31,
            &[
                attribute(2, &bundle),
                attribute(3, &tlv(0x0c, b"2.1")),
                attribute(4, &opaque),
                attribute(5, hash.as_slice()),
            ]
            .concat(),
        )
    }

    fn unsigned_receipt() -> Receipt {
        let attributes = receipt_attributes();
        let content_info = tlv(
            0x30,
            &[
                tlv(0x06, &encode_oid(KnownOid::Pkcs7Data.oid()).unwrap()),
                tlv(0xa0, &tlv(0x04, &attributes)),
            ]
            .concat(),
        );
        let digest_algorithms = tlv(
            0x31,
            &tlv(0x30, &tlv(0x06, &encode_oid(KnownOid::Sha1.oid()).unwrap())),
        );
        let signed_data = tlv(
            0x30,
            &[tlv(0x02, &[0x01]), digest_algorithms, content_info].concat(),
        );
        let data = tlv(
            0x30,
            &[
                tlv(0x06, &encode_oid(KnownOid::Pkcs7SignedData.oid()).unwrap()),
                tlv(0xa0, &signed_data),
            ]
            .concat(),
        );
        Receipt::decode(data).unwrap().decoded
    }

    /// Key of the App Store receipt signing certificate.
    fn pinned_key() -> TrustedKey {
        TrustedKey::Pkcs1Der(
            load(SANDBOX_RECEIPT).certificates()[0]
                .subject_public_key
                .clone(),
        )
    }

    fn config(version: &str, device: Option<[u8; 16]>) -> ValidatorConfig {
        ValidatorConfig::new(
            StaticAppIdentity::new("com.example.shop", version),
            StaticDeviceIdentifier(device),
            pinned_key(),
        )
    }

    struct CountingDevice(Rc<Cell<usize>>);

    impl DeviceIdentifier for CountingDevice {
        fn vendor_identifier(&self) -> Option<[u8; 16]> {
            self.0.set(self.0.get() + 1);
            Some(DEVICE)
        }
    }

    #[test]
    fn passes_hash_and_identity_before_signature() {
        let receipt = unsigned_receipt();
        assert_eq!(Some("com.example.shop"), receipt.payload().bundle_identifier.as_deref());
        let mut validator = ReceiptValidator::new(&receipt, config("2.1", Some(DEVICE)));
        assert_eq!(&ValidationState::Unvalidated, validator.state());
        assert_eq!(
            Ok(ValidationResult::Failure {
                reason: FailureReason::SignatureValidation(
                    SignatureFailure::ReceiptSignedDataNotFound
                )
            }),
            validator.validate()
        );
        assert_eq!(
            &ValidationState::Failed(FailureReason::SignatureValidation(
                SignatureFailure::ReceiptSignedDataNotFound
            )),
            validator.state()
        );
        assert_eq!(Ok(false), validator.is_valid_receipt());
    }

    #[test]
    fn rejects_foreign_app() {
        let receipt = unsigned_receipt();
        let mut validator = ReceiptValidator::new(&receipt, config("2.0", Some(DEVICE)));
        assert_eq!(
            Ok(ValidationResult::Failure {
                reason: FailureReason::BundleVersionVerification
            }),
            validator.validate()
        );
        let app = StaticAppIdentity::new("com.example.other", "2.1");
        assert_eq!(
            Ok(ValidationResult::Failure {
                reason: FailureReason::BundleIdentifierVerification
            }),
            IdentityCheck {
                payload: receipt.payload(),
                app: &app,
            }
            .validate()
        );
    }

    #[test]
    fn selects_version_by_key() {
        let app = StaticAppIdentity {
            bundle_identifier: "com.example.shop".into(),
            short_version_string: "2.1".into(),
            bundle_version: "421".into(),
            version_key: VersionKey::BundleVersion,
        };
        assert_eq!("421", app.bundle_version());
        let app = StaticAppIdentity {
            version_key: VersionKey::ShortVersionString,
            ..app
        };
        assert_eq!("2.1", app.bundle_version());
    }

    #[test]
    fn keeps_terminal_state() {
        let receipt = unsigned_receipt();
        let calls = Rc::new(Cell::new(0));
        let mut validator = ReceiptValidator::new(
            &receipt,
            ValidatorConfig::new(
                StaticAppIdentity::new("com.example.shop", "1.0"),
                CountingDevice(calls.clone()),
                pinned_key(),
            ),
        );
        let first = validator.validate();
        assert_eq!(first, validator.validate());
        assert_eq!(1, calls.get());
        assert_eq!(
            &ValidationState::Failed(FailureReason::BundleVersionVerification),
            validator.state()
        );
    }

    #[test]
    fn fails_without_device_identifier() {
        let receipt = unsigned_receipt();
        let mut validator = ReceiptValidator::new(&receipt, config("2.1", None));
        assert_eq!(
            Err(ValidationError::DeviceIdentifierUnavailable),
            validator.validate()
        );
        assert_eq!(&ValidationState::Unvalidated, validator.state());
    }

    #[test]
    fn stops_at_hash_mismatch() {
        let receipt = load(SANDBOX_RECEIPT);
        // a key that cannot be loaded would fail the signature step differently
        let mut validator = ReceiptValidator::new(
            &receipt,
            ValidatorConfig::new(
                StaticAppIdentity::new("com.bjitgroup.easypurchase", "1"),
                StaticDeviceIdentifier::from([0; 16]),
                TrustedKey::Pkcs1Der(Bytes::from_static(&[0x30, 0x00])),
            ),
        );
        assert_eq!(
            Ok(ValidationResult::Failure {
                reason: FailureReason::HashValidation
            }),
            validator.validate()
        );
        assert_eq!(
            &ValidationState::Failed(FailureReason::HashValidation),
            validator.state()
        );
        assert_eq!(receipt.payload(), validator.payload());
    }

    #[test]
    fn verifies_receipt_signatures() {
        for fixture in [SANDBOX_RECEIPT, SUBSCRIPTION_RECEIPT] {
            let receipt = load(fixture);
            let leaf = TrustedKey::Pkcs1Der(receipt.certificates()[0].subject_public_key.clone());
            assert_eq!(
                Ok(ValidationResult::Success),
                SignatureCheck {
                    receipt: &receipt,
                    trusted_key: &leaf,
                }
                .validate()
            );
        }
    }

    #[test]
    fn rejects_wrong_keys() {
        let receipt = load(SANDBOX_RECEIPT);
        let intermediate =
            TrustedKey::Pkcs1Der(receipt.certificates()[1].subject_public_key.clone());
        assert_eq!(
            Ok(signature_failure(SignatureFailure::InvalidSignature)),
            SignatureCheck {
                receipt: &receipt,
                trusted_key: &intermediate,
            }
            .validate()
        );
        assert_eq!(
            Ok(signature_failure(SignatureFailure::UnableToLoadPublicKey)),
            SignatureCheck {
                receipt: &receipt,
                trusted_key: &TrustedKey::Pkcs1Der(Bytes::from_static(&[0x02, 0x01, 0x01])),
            }
            .validate()
        );
    }

    #[test]
    fn rejects_tampered_content() {
        let mut data = STANDARD.decode(SANDBOX_RECEIPT.trim()).unwrap();
        let needle = b"com.bjitgroup.easypurchase";
        let position = data
            .windows(needle.len())
            .position(|window| window == needle)
            .unwrap();
        data[position] = b'd';
        let receipt = Receipt::decode(data).unwrap().decoded;
        assert_eq!(
            Some("dom.bjitgroup.easypurchase"),
            receipt.payload().bundle_identifier.as_deref()
        );
        assert_eq!(
            Ok(signature_failure(SignatureFailure::InvalidSignature)),
            SignatureCheck {
                receipt: &receipt,
                trusted_key: &pinned_key(),
            }
            .validate()
        );
    }

    /// Signs `content` as PKCS #7 with a fresh self-signed certificate.
    fn self_signed(content: &[u8]) -> (Vec<u8>, TrustedKey) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "Mac App Store and iTunes Store Receipt Signing")
            .unwrap();
        let name = name.build();
        let mut certificate = X509::builder().unwrap();
        certificate.set_version(2).unwrap();
        certificate
            .set_serial_number(&BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap())
            .unwrap();
        certificate.set_subject_name(&name).unwrap();
        certificate.set_issuer_name(&name).unwrap();
        certificate.set_pubkey(&key).unwrap();
        certificate
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        certificate
            .set_not_after(&Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        certificate.sign(&key, MessageDigest::sha256()).unwrap();
        let certificate = certificate.build();
        let signed = Pkcs7::sign(
            &certificate,
            &key,
            &Stack::<X509>::new().unwrap(),
            content,
            Pkcs7Flags::BINARY | Pkcs7Flags::NOATTR,
        )
        .unwrap();
        let own_key = key.rsa().unwrap().public_key_to_der_pkcs1().unwrap();
        (signed.to_der().unwrap(), TrustedKey::Pkcs1Der(own_key.into()))
    }

    #[test]
    fn rejects_self_signed_receipt() {
        let (data, own_key) = self_signed(&receipt_attributes());
        let receipt = Receipt::decode(data).unwrap().decoded;
        assert_eq!(1, receipt.certificates().len());

        let mut validator = ReceiptValidator::new(&receipt, config("2.1", Some(DEVICE)));
        assert_eq!(
            Ok(signature_failure(SignatureFailure::InvalidSignature)),
            validator.validate()
        );
        assert_eq!(
            &ValidationState::Failed(FailureReason::SignatureValidation(
                SignatureFailure::InvalidSignature
            )),
            validator.state()
        );

        // only the signer's own key accepts it
        let mut validator = ReceiptValidator::new(
            &receipt,
            ValidatorConfig::new(
                StaticAppIdentity::new("com.example.shop", "2.1"),
                StaticDeviceIdentifier::from(DEVICE),
                own_key,
            ),
        );
        assert_eq!(Ok(true), validator.is_valid_receipt());
    }

    #[test]
    fn maps_digest_algorithms() {
        assert!(message_digest(KnownOid::Sha1.oid()).is_ok());
        assert!(message_digest(KnownOid::Sha256.oid()).is_ok());
        assert!(matches!(
            message_digest(KnownOid::Md5.oid()),
            Err(ValidationError::Unsupported(_))
        ));
    }
}
