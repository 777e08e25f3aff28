//! Key server publish pipeline.
//!
//! Each sub-batch runs its own four-step exchange, strictly in order:
//! issue code, verify code, certificate, publish. Verification codes are
//! single-use, so sub-batches never share a code, token or certificate.

use chrono::NaiveDate;

use crate::batching::overlap::overlap_bounded_chunks;
use crate::clients::keyserver::{KeyServer, PublishRequest};
use crate::clients::verification::{IssueCodeRequest, VerificationServer};
use crate::error::{ClientError, Step, SyncError};
use crate::logging::structured::LogContext;
use crate::security::key_hmac::KeySetHmac;
use crate::storage::models::ExposureKey;

use super::context::RunContext;

/// Outcome of one published sub-batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubBatchResult {
    pub sent: usize,
    pub inserted: usize,
    pub revision_token: String,
}

/// Outcome of one group's publish.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub sub_batches: Vec<SubBatchResult>,
}

impl PublishReport {
    pub fn sent(&self) -> usize {
        self.sub_batches.iter().map(|s| s.sent).sum()
    }

    pub fn inserted(&self) -> usize {
        self.sub_batches.iter().map(|s| s.inserted).sum()
    }
}

/// Business rejection carried in a response body.
fn check_rejection(step: Step, code: &str, message: &str) -> Result<(), ClientError> {
    if code.is_empty() && message.is_empty() {
        return Ok(());
    }
    Err(ClientError::Rejected {
        step,
        code: code.to_string(),
        message: message.to_string(),
    })
}

/// A required response field that came back empty.
fn require(step: Step, field: &str, value: String) -> Result<String, ClientError> {
    if value.is_empty() {
        return Err(ClientError::Decode {
            step,
            message: format!("response has no {}", field),
        });
    }
    Ok(value)
}

/// Publishes downloaded keys to the local key server.
pub struct PublishPipeline<'a> {
    pub verification: &'a dyn VerificationServer,
    pub keyserver: &'a dyn KeyServer,
    pub test_type: &'a str,
    pub batch_size: usize,
    pub max_overlapping: usize,
}

impl<'a> PublishPipeline<'a> {
    /// Publish one group's keys under `haid`.
    ///
    /// The group is split into overlap-bounded sub-batches; a failing
    /// sub-batch does not stop its siblings.
    pub fn publish_group(
        &self,
        haid: &str,
        keys: Vec<ExposureKey>,
        run: &RunContext,
        ctx: &LogContext,
    ) -> Result<PublishReport, SyncError> {
        let total = keys.len();
        let chunks = overlap_bounded_chunks(keys, self.batch_size, self.max_overlapping)?;

        log::info!(
            "{} PUBLISH_START haid={} keys={} sub_batches={}",
            ctx,
            haid,
            total,
            chunks.len()
        );

        let mut report = PublishReport::default();
        let mut failures = Vec::new();

        for (index, chunk) in chunks.iter().enumerate() {
            let label = format!("{}#{}", haid, index);
            if run.is_cancelled() {
                log::warn!(
                    "{} PUBLISH_CANCELLED haid={} remaining_sub_batches={}",
                    ctx,
                    haid,
                    chunks.len() - index
                );
                failures.push((label, SyncError::Cancelled));
                break;
            }

            let chunk_ctx = ctx.with_batch(&label);
            match self.publish_sub_batch(haid, chunk, run.run_date(), &chunk_ctx) {
                Ok(result) => report.sub_batches.push(result),
                Err(e) => {
                    log::error!(
                        "{} PUBLISH_SUB_BATCH_FAILED step={} error={}",
                        chunk_ctx,
                        failed_step(&e),
                        e
                    );
                    failures.push((label, e));
                }
            }
        }

        log::info!(
            "{} PUBLISH_COMPLETE haid={} sent={} inserted={} failed_sub_batches={}",
            ctx,
            haid,
            report.sent(),
            report.inserted(),
            failures.len()
        );

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(SyncError::PublishFailed { failures })
        }
    }

    fn publish_sub_batch(
        &self,
        haid: &str,
        keys: &[ExposureKey],
        test_date: NaiveDate,
        ctx: &LogContext,
    ) -> Result<SubBatchResult, SyncError> {
        // 1. Issue code
        let issued = self.verification.issue_code(&IssueCodeRequest {
            test_type: self.test_type.to_string(),
            symptom_date: None,
            test_date: Some(test_date.format("%Y-%m-%d").to_string()),
            tz_offset: 0,
        })?;
        check_rejection(Step::IssueCode, &issued.error_code, &issued.error)?;
        let code = require(Step::IssueCode, "code", issued.code)?;
        log::debug!("{} VERIFICATION_CODE_ISSUED uuid={}", ctx, issued.uuid);

        // 2. Verify code
        let verified = self.verification.verify_code(&code)?;
        check_rejection(Step::VerifyCode, &verified.error_code, &verified.error)?;
        let token = require(Step::VerifyCode, "token", verified.token)?;

        // 3. Certificate bound to this exact key set
        let hmac = KeySetHmac::generate(keys)?;
        let certified = self.verification.certificate(&token, &hmac.digest_base64())?;
        check_rejection(Step::Certificate, &certified.error_code, &certified.error)?;
        let certificate = require(Step::Certificate, "certificate", certified.certificate)?;

        // 4. Publish
        let response = self.keyserver.publish(&PublishRequest {
            keys: keys.to_vec(),
            health_authority_id: haid.to_string(),
            verification_payload: certificate,
            hmac_key: hmac.secret_base64(),
        })?;
        check_rejection(Step::Publish, &response.code, &response.error_message)?;

        if response.inserted_exposures < keys.len() {
            log::warn!(
                "{} PUBLISH_PARTIAL_INSERT sent={} inserted={}",
                ctx,
                keys.len(),
                response.inserted_exposures
            );
        } else {
            log::info!("{} PUBLISH_SUB_BATCH_OK inserted={}", ctx, response.inserted_exposures);
        }

        Ok(SubBatchResult {
            sent: keys.len(),
            inserted: response.inserted_exposures,
            revision_token: response.revision_token,
        })
    }
}

fn failed_step(error: &SyncError) -> String {
    match error {
        SyncError::Client(e) => e.step().to_string(),
        SyncError::Signing(_) => "hmac".to_string(),
        _ => "-".to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use base64::{engine::general_purpose, Engine as _};
    use parking_lot::Mutex;

    use super::*;
    use crate::clients::keyserver::PublishResponse;
    use crate::clients::verification::{
        CertificateResponse, IssueCodeResponse, VerifyCodeResponse,
    };
    use crate::security::key_hmac::compute_hmac;

    /// Verification server handing out numbered codes and tokens.
    #[derive(Default)]
    pub(crate) struct FakeVerification {
        pub issued: Mutex<u32>,
        pub hmacs: Mutex<Vec<String>>,
        /// Fail the certificate step of the n-th certificate request (0-based).
        pub reject_certificate: Option<usize>,
    }

    impl VerificationServer for FakeVerification {
        fn issue_code(&self, request: &IssueCodeRequest) -> Result<IssueCodeResponse, ClientError> {
            assert!(request.test_date.is_some());
            let mut issued = self.issued.lock();
            *issued += 1;
            Ok(IssueCodeResponse {
                code: format!("code-{}", *issued),
                uuid: format!("uuid-{}", *issued),
                ..Default::default()
            })
        }

        fn verify_code(&self, code: &str) -> Result<VerifyCodeResponse, ClientError> {
            Ok(VerifyCodeResponse {
                token: format!("token-for-{}", code),
                test_type: "confirmed".to_string(),
                ..Default::default()
            })
        }

        fn certificate(&self, token: &str, hmac: &str) -> Result<CertificateResponse, ClientError> {
            let mut hmacs = self.hmacs.lock();
            let index = hmacs.len();
            hmacs.push(hmac.to_string());
            if self.reject_certificate == Some(index) {
                return Ok(CertificateResponse {
                    error: "token expired".to_string(),
                    error_code: "token_expired".to_string(),
                    ..Default::default()
                });
            }
            Ok(CertificateResponse {
                certificate: format!("cert({})", token),
                ..Default::default()
            })
        }
    }

    /// Key server recording publishes; inserts all keys unless capped.
    #[derive(Default)]
    pub(crate) struct FakeKeyServer {
        pub published: Mutex<Vec<PublishRequest>>,
        pub insert_cap: Option<usize>,
    }

    impl KeyServer for FakeKeyServer {
        fn publish(&self, request: &PublishRequest) -> Result<PublishResponse, ClientError> {
            self.published.lock().push(request.clone());
            let inserted = self
                .insert_cap
                .map_or(request.keys.len(), |cap| cap.min(request.keys.len()));
            Ok(PublishResponse {
                inserted_exposures: inserted,
                revision_token: "rev".to_string(),
                ..Default::default()
            })
        }
    }

    fn key(byte: u8, interval_number: u32) -> ExposureKey {
        ExposureKey {
            key: general_purpose::STANDARD.encode([byte; 16]),
            interval_number,
            interval_count: 144,
            transmission_risk: 1,
        }
    }

    fn pipeline<'a>(
        verification: &'a FakeVerification,
        keyserver: &'a FakeKeyServer,
        batch_size: usize,
    ) -> PublishPipeline<'a> {
        PublishPipeline {
            verification,
            keyserver,
            test_type: "confirmed",
            batch_size,
            max_overlapping: 15,
        }
    }

    #[test]
    fn test_single_sub_batch_flow() {
        let verification = FakeVerification::default();
        let keyserver = FakeKeyServer::default();
        let run = RunContext::new();
        let keys = vec![key(1, 2_680_128), key(2, 2_680_272)];

        let report = pipeline(&verification, &keyserver, 10)
            .publish_group("efgs-de", keys, &run, &run.log_context())
            .unwrap();
        assert_eq!(report.sent(), 2);
        assert_eq!(report.inserted(), 2);

        let published = keyserver.published.lock();
        assert_eq!(published.len(), 1);
        let request = &published[0];
        assert_eq!(request.health_authority_id, "efgs-de");
        assert_eq!(request.verification_payload, "cert(token-for-code-1)");

        // The certificate's HMAC was computed with the secret handed to the key server.
        let secret = general_purpose::STANDARD.decode(&request.hmac_key).unwrap();
        let expected = compute_hmac(&secret, &request.keys).unwrap();
        assert_eq!(
            verification.hmacs.lock()[0],
            general_purpose::STANDARD.encode(expected)
        );
    }

    #[test]
    fn test_sub_batches_get_fresh_codes() {
        let verification = FakeVerification::default();
        let keyserver = FakeKeyServer::default();
        let run = RunContext::new();
        let keys: Vec<ExposureKey> = (0..5).map(|i| key(i, 2_680_000 + 144 * i as u32)).collect();

        let report = pipeline(&verification, &keyserver, 2)
            .publish_group("efgs-fr", keys, &run, &run.log_context())
            .unwrap();
        assert_eq!(report.sub_batches.len(), 3);
        assert_eq!(*verification.issued.lock(), 3);

        let payloads: Vec<String> = keyserver
            .published
            .lock()
            .iter()
            .map(|r| r.verification_payload.clone())
            .collect();
        assert_eq!(
            payloads,
            vec![
                "cert(token-for-code-1)",
                "cert(token-for-code-2)",
                "cert(token-for-code-3)"
            ]
        );
    }

    #[test]
    fn test_rejected_sub_batch_does_not_stop_siblings() {
        let verification = FakeVerification {
            reject_certificate: Some(0),
            ..Default::default()
        };
        let keyserver = FakeKeyServer::default();
        let run = RunContext::new();
        let keys: Vec<ExposureKey> = (0..4).map(|i| key(i, 2_680_000 + 144 * i as u32)).collect();

        let err = pipeline(&verification, &keyserver, 2)
            .publish_group("efgs-it", keys, &run, &run.log_context())
            .unwrap_err();

        match err {
            SyncError::PublishFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "efgs-it#0");
                assert!(matches!(
                    failures[0].1,
                    SyncError::Client(ClientError::Rejected { step: Step::Certificate, .. })
                ));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(keyserver.published.lock().len(), 1);
    }

    #[test]
    fn test_partial_insert_is_not_an_error() {
        let verification = FakeVerification::default();
        let keyserver = FakeKeyServer {
            insert_cap: Some(1),
            ..Default::default()
        };
        let run = RunContext::new();
        let keys = vec![key(1, 2_680_128), key(2, 2_680_272), key(3, 2_680_416)];

        let report = pipeline(&verification, &keyserver, 10)
            .publish_group("efgs-es", keys, &run, &run.log_context())
            .unwrap();
        assert_eq!(report.sent(), 3);
        assert_eq!(report.inserted(), 1);
    }

    #[test]
    fn test_check_rejection() {
        assert!(check_rejection(Step::Publish, "", "").is_ok());
        assert!(matches!(
            check_rejection(Step::Publish, "", "batch too large"),
            Err(ClientError::Rejected { step: Step::Publish, .. })
        ));
    }

    #[test]
    fn test_missing_code_is_protocol_error() {
        assert!(matches!(
            require(Step::IssueCode, "code", String::new()),
            Err(ClientError::Decode { step: Step::IssueCode, .. })
        ));
    }
}
