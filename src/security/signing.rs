//! Detached batch signatures.
//!
//! Signs canonical batch bytes as PKCS#7 signed data (detached, binary)
//! with the national signing certificate and returns base64 DER.

use base64::{engine::general_purpose, Engine as _};
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::X509;

use crate::error::SigningError;
use crate::logging::structured::LogContext;

/// Signs upload batches with the national signing certificate.
pub struct BatchSigner {
    certificate: X509,
    private_key: PKey<Private>,
}

impl std::fmt::Debug for BatchSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSigner")
            .field("subject", &self.subject())
            .finish_non_exhaustive()
    }
}

impl BatchSigner {
    /// Decode the certificate and private key from PEM.
    ///
    /// Fails if either is malformed or the key does not belong to the
    /// certificate.
    pub fn from_pem(certificate_pem: &[u8], private_key_pem: &[u8]) -> Result<Self, SigningError> {
        let certificate = X509::from_pem(certificate_pem)
            .map_err(|e| SigningError::Certificate(e.to_string()))?;

        let private_key = PKey::private_key_from_pem(private_key_pem)
            .map_err(|e| SigningError::PrivateKey(e.to_string()))?;

        let public_key = certificate
            .public_key()
            .map_err(|e| SigningError::Certificate(e.to_string()))?;

        if !public_key.public_eq(&private_key) {
            return Err(SigningError::PrivateKey(
                "Private key does not match certificate".to_string(),
            ));
        }

        log::info!("SIGNING_CERTIFICATE_LOADED subject={}", subject_of(&certificate));

        Ok(Self {
            certificate,
            private_key,
        })
    }

    /// Subject of the signing certificate, for logging.
    pub fn subject(&self) -> String {
        subject_of(&self.certificate)
    }

    /// Sign `data` and return the base64 DER signature.
    pub fn sign(&self, data: &[u8], ctx: &LogContext) -> Result<String, SigningError> {
        let chain = Stack::new().map_err(|e| SigningError::Sign(e.to_string()))?;

        let signed = Pkcs7::sign(
            &self.certificate,
            &self.private_key,
            &chain,
            data,
            Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
        )
        .map_err(|e| SigningError::Sign(e.to_string()))?;

        let der = signed
            .to_der()
            .map_err(|e| SigningError::Sign(e.to_string()))?;

        log::debug!(
            "{} BATCH_SIGNED bytes={} signature_bytes={}",
            ctx,
            data.len(),
            der.len()
        );

        Ok(general_purpose::STANDARD.encode(der))
    }
}

fn subject_of(certificate: &X509) -> String {
    certificate
        .subject_name()
        .entries()
        .map(|entry| String::from_utf8_lossy(entry.data().as_slice()).into_owned())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
pub(crate) mod tests {
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::x509::store::X509StoreBuilder;
    use openssl::x509::{X509Builder, X509NameBuilder};

    use super::*;

    /// Self-signed P-256 certificate and PKCS#8 key, both PEM.
    pub(crate) fn test_signing_material(common_name: &str) -> (Vec<u8>, Vec<u8>) {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", common_name).unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        let cert = builder.build();
        (
            cert.to_pem().unwrap(),
            key.private_key_to_pem_pkcs8().unwrap(),
        )
    }

    #[test]
    fn test_sign_produces_verifiable_detached_signature() {
        let (cert_pem, key_pem) = test_signing_material("efgs-test");
        let signer = BatchSigner::from_pem(&cert_pem, &key_pem).unwrap();
        assert_eq!(signer.subject(), "efgs-test");

        let data = b"EREREREREREREREREREREQ==.AAAAAA==.";
        let signature = signer.sign(data, &LogContext::new("run-test")).unwrap();

        let der = general_purpose::STANDARD.decode(signature).unwrap();
        let pkcs7 = Pkcs7::from_der(&der).unwrap();
        let certs = Stack::new().unwrap();
        let store = X509StoreBuilder::new().unwrap().build();

        pkcs7
            .verify(&certs, &store, Some(data), None, Pkcs7Flags::NOVERIFY)
            .unwrap();
        assert!(pkcs7
            .verify(&certs, &store, Some(b"tampered"), None, Pkcs7Flags::NOVERIFY)
            .is_err());
    }

    #[test]
    fn test_malformed_certificate_rejected() {
        let (_, key_pem) = test_signing_material("efgs-test");
        let err = BatchSigner::from_pem(b"not a certificate", &key_pem).unwrap_err();
        assert!(matches!(err, SigningError::Certificate(_)));
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let (cert_pem, _) = test_signing_material("efgs-a");
        let (_, other_key) = test_signing_material("efgs-b");
        let err = BatchSigner::from_pem(&cert_pem, &other_key).unwrap_err();
        assert!(matches!(err, SigningError::PrivateKey(_)));
    }
}
