//! Key-set HMAC for verification certificates.
//!
//! The verification server binds a certificate to the exact key set being
//! published through an HMAC-SHA256 over a canonical cleartext, keyed with a
//! fresh random secret that is later handed to the key server.

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::SigningError;
use crate::storage::models::ExposureKey;

type HmacSha256 = Hmac<Sha256>;

/// Length of the generated HMAC secret.
pub const HMAC_KEY_LENGTH: usize = 16;

/// HMAC secret and digest for one key set.
#[derive(Debug, Clone)]
pub struct KeySetHmac {
    pub secret: [u8; HMAC_KEY_LENGTH],
    pub digest: Vec<u8>,
}

impl KeySetHmac {
    /// Generate a fresh secret and compute the digest over `keys`.
    pub fn generate(keys: &[ExposureKey]) -> Result<Self, SigningError> {
        let mut secret = [0u8; HMAC_KEY_LENGTH];
        OsRng.fill_bytes(&mut secret);
        Self::with_secret(secret, keys)
    }

    pub fn with_secret(
        secret: [u8; HMAC_KEY_LENGTH],
        keys: &[ExposureKey],
    ) -> Result<Self, SigningError> {
        let digest = compute_hmac(&secret, keys)?;
        Ok(Self { secret, digest })
    }

    pub fn secret_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.secret)
    }

    pub fn digest_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.digest)
    }
}

/// Cleartext the HMAC is computed over.
///
/// Keys are sorted by their base64 string; each contributes
/// `key.intervalNumber.intervalCount.transmissionRisk`, joined by `,`.
pub fn hmac_cleartext(keys: &[ExposureKey]) -> String {
    let mut sorted: Vec<&ExposureKey> = keys.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    sorted
        .iter()
        .map(|k| {
            format!(
                "{}.{}.{}.{}",
                k.key, k.interval_number, k.interval_count, k.transmission_risk
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub fn compute_hmac(secret: &[u8], keys: &[ExposureKey]) -> Result<Vec<u8>, SigningError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| SigningError::Sign(format!("HMAC key rejected: {}", e)))?;
    mac.update(hmac_cleartext(keys).as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str, n: u32, c: u32, r: i32) -> ExposureKey {
        ExposureKey {
            key: k.to_string(),
            interval_number: n,
            interval_count: c,
            transmission_risk: r,
        }
    }

    #[test]
    fn test_cleartext_sorted_by_key() {
        let keys = vec![key("z3==", 10, 144, 2), key("a1==", 20, 144, 0)];
        assert_eq!(hmac_cleartext(&keys), "a1==.20.144.0,z3==.10.144.2");
    }

    #[test]
    fn test_cleartext_empty() {
        assert_eq!(hmac_cleartext(&[]), "");
    }

    #[test]
    fn test_hmac_independent_of_input_order() {
        let secret = [5u8; HMAC_KEY_LENGTH];
        let a = vec![key("b", 1, 1, 1), key("a", 2, 2, 2)];
        let b = vec![key("a", 2, 2, 2), key("b", 1, 1, 1)];
        assert_eq!(
            compute_hmac(&secret, &a).unwrap(),
            compute_hmac(&secret, &b).unwrap()
        );
    }

    #[test]
    fn test_generated_hmac_verifies() {
        let keys = vec![key("AAAAAAAAAAAAAAAAAAAAAA==", 2_680_128, 144, 3)];
        let hmac = KeySetHmac::generate(&keys).unwrap();
        assert_eq!(hmac.digest.len(), 32);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&hmac.secret).unwrap();
        mac.update(hmac_cleartext(&keys).as_bytes());
        assert!(mac.verify_slice(&hmac.digest).is_ok());

        let decoded = general_purpose::STANDARD.decode(hmac.secret_base64()).unwrap();
        assert_eq!(decoded.len(), HMAC_KEY_LENGTH);
    }

    #[test]
    fn test_fresh_secret_per_call() {
        let keys = vec![key("a", 1, 1, 1)];
        let first = KeySetHmac::generate(&keys).unwrap();
        let second = KeySetHmac::generate(&keys).unwrap();
        assert_ne!(first.secret, second.secret);
    }
}
