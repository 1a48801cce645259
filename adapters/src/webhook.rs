//! Webhook signature verification
//!
//! Inbound push notifications are the alternative ingestion path to
//! polling. The verifier computes an HMAC over the raw, unparsed request
//! body and compares it against the supplied signature in constant time.
//! Any malformed input verifies false; the caller treats false as reject,
//! never as retry.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// HMAC algorithm used by the source system
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HmacAlgorithm {
    /// HMAC-SHA1 (legacy sources)
    Sha1,
    /// HMAC-SHA256 (default)
    Sha256,
    /// HMAC-SHA512
    Sha512,
}

impl HmacAlgorithm {
    fn scheme_prefix(&self) -> &'static str {
        match self {
            HmacAlgorithm::Sha1 => "sha1=",
            HmacAlgorithm::Sha256 => "sha256=",
            HmacAlgorithm::Sha512 => "sha512=",
        }
    }
}

impl Default for HmacAlgorithm {
    fn default() -> Self {
        HmacAlgorithm::Sha256
    }
}

/// Validates inbound webhook signatures
#[derive(Debug, Clone, Default)]
pub struct WebhookVerifier {
    algorithm: HmacAlgorithm,
}

impl WebhookVerifier {
    /// Verifier with the given algorithm
    pub fn new(algorithm: HmacAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Verify `signature_header` against the HMAC of `body` under `secret`.
    ///
    /// The header is a hex signature, optionally carrying the scheme prefix
    /// of the configured algorithm (`sha256=...`). A wrong or foreign
    /// prefix, non-hex payload, wrong length, or empty secret all verify
    /// false.
    pub fn verify(&self, signature_header: &str, body: &[u8], secret: &[u8]) -> bool {
        if secret.is_empty() {
            return false;
        }

        let header = signature_header.trim();
        let hex_signature = match header.strip_prefix(self.algorithm.scheme_prefix()) {
            Some(stripped) => stripped,
            None if header.contains('=') => return false,
            None => header,
        };

        let signature = match hex::decode(hex_signature) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };

        // verify_slice is a constant-time comparison
        match self.algorithm {
            HmacAlgorithm::Sha1 => match HmacSha1::new_from_slice(secret) {
                Ok(mut mac) => {
                    mac.update(body);
                    mac.verify_slice(&signature).is_ok()
                }
                Err(_) => false,
            },
            HmacAlgorithm::Sha256 => match HmacSha256::new_from_slice(secret) {
                Ok(mut mac) => {
                    mac.update(body);
                    mac.verify_slice(&signature).is_ok()
                }
                Err(_) => false,
            },
            HmacAlgorithm::Sha512 => match HmacSha512::new_from_slice(secret) {
                Ok(mut mac) => {
                    mac.update(body);
                    mac.verify_slice(&signature).is_ok()
                }
                Err(_) => false,
            },
        }
    }

    /// Compute the hex signature for `body` under `secret`, with scheme
    /// prefix. What a well-behaved source system would send.
    pub fn sign(&self, body: &[u8], secret: &[u8]) -> String {
        let digest = match self.algorithm {
            HmacAlgorithm::Sha1 => {
                let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC key");
                mac.update(body);
                mac.finalize().into_bytes().to_vec()
            }
            HmacAlgorithm::Sha256 => {
                let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC key");
                mac.update(body);
                mac.finalize().into_bytes().to_vec()
            }
            HmacAlgorithm::Sha512 => {
                let mut mac = HmacSha512::new_from_slice(secret).expect("HMAC key");
                mac.update(body);
                mac.finalize().into_bytes().to_vec()
            }
        };
        format!("{}{}", self.algorithm.scheme_prefix(), hex::encode(digest))
    }
}
