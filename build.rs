#[cfg(feature = "validate")]
use std::env;

fn main() {
    // receipt signatures are verified through the OpenSSL 3 EVP interface
    #[cfg(feature = "validate")]
    if let Some(version) = env::var("DEP_OPENSSL_VERSION_NUMBER")
        .ok()
        .and_then(|v| u64::from_str_radix(&v, 16).ok())
    {
        assert!(
            version >= 0x3000_0000,
            "receipt-asn1 supports openssl >= 3 only!"
        );
    }
}
