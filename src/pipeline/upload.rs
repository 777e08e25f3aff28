//! Gateway upload pipeline.
//!
//! Coordinates one upload run:
//! 1. Load pending keys inside the retention window
//! 2. Sort by canonical bytes so batches and tags are deterministic
//! 3. Split into contiguous batches
//! 4. Tag, sign and POST each batch
//! 5. Apply the gateway's verdict to each key's retry state
//!
//! A failing batch never stops the batches after it; failures are collected
//! and reported together.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::batching::contiguous::contiguous_chunks;
use crate::clients::gateway::{Gateway, UploadRequest, UploadResponse};
use crate::encoding::canonical::{batch_bytes, batch_tag, canonical_bytes};
use crate::encoding::wire::encode_upload_body;
use crate::error::{ClientError, Step, SyncError};
use crate::logging::structured::LogContext;
use crate::security::signing::BatchSigner;
use crate::storage::models::PersistedKey;
use crate::storage::store::KeyStore;

use super::context::RunContext;

/// Per-key outcome lists of a `207 Multi-Status` upload answer.
///
/// Field names are the HTTP status each key would have received on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PartialOutcome {
    #[serde(rename = "201")]
    pub success: Vec<usize>,
    #[serde(rename = "409")]
    pub duplicate: Vec<usize>,
    #[serde(rename = "500")]
    pub error: Vec<usize>,
}

/// Gateway verdict on one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// 201: every key accepted.
    Accepted,
    /// 207: per-key verdicts.
    Partial(PartialOutcome),
    /// 400: whole batch rejected.
    Rejected,
}

/// Classify a raw upload answer. Unknown statuses are errors and leave key
/// state untouched.
pub fn interpret_upload_response(response: &UploadResponse) -> Result<UploadOutcome, ClientError> {
    match response.status {
        201 => Ok(UploadOutcome::Accepted),
        207 => serde_json::from_str(&response.body)
            .map(UploadOutcome::Partial)
            .map_err(|e| ClientError::Decode {
                step: Step::GatewayUpload,
                message: format!("Invalid multi-status body: {}", e),
            }),
        400 => Ok(UploadOutcome::Rejected),
        status => Err(ClientError::UnexpectedStatus {
            step: Step::GatewayUpload,
            status,
            body: response.body.clone(),
        }),
    }
}

/// Counts for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub tag: String,
    pub keys: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub retried: usize,
}

/// Summary of an upload run.
#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub pending: usize,
    pub batches: Vec<BatchResult>,
}

impl UploadReport {
    pub fn accepted(&self) -> usize {
        self.batches.iter().map(|b| b.accepted).sum()
    }

    pub fn retried(&self) -> usize {
        self.batches.iter().map(|b| b.retried).sum()
    }
}

/// Uploads locally collected keys to the gateway.
pub struct UploadPipeline<'a> {
    pub store: &'a dyn KeyStore,
    pub gateway: &'a dyn Gateway,
    pub signer: &'a BatchSigner,
    pub batch_size: usize,
    pub retention: chrono::Duration,
}

impl<'a> UploadPipeline<'a> {
    pub fn run(&self, run: &RunContext) -> Result<UploadReport, SyncError> {
        let ctx = run.log_context();
        let since = run.started_at - self.retention;

        let mut rows = self.store.pending_since(since)?;
        if rows.is_empty() {
            log::info!("{} UPLOAD_NOTHING_PENDING since={}", ctx, since.to_rfc3339());
            return Ok(UploadReport::default());
        }

        rows.sort_by_cached_key(|row| canonical_bytes(&row.key));
        let batches = contiguous_chunks(&rows, self.batch_size)?;

        log::info!(
            "{} UPLOAD_START pending={} batches={} batch_size={}",
            ctx,
            rows.len(),
            batches.len(),
            self.batch_size
        );

        let mut report = UploadReport {
            pending: rows.len(),
            batches: Vec::with_capacity(batches.len()),
        };
        let mut failures = Vec::new();

        for (index, batch) in batches.iter().enumerate() {
            let tag = batch_tag(run.run_date(), batch.iter().map(|row| &row.key));

            if run.is_cancelled() {
                log::warn!(
                    "{} UPLOAD_CANCELLED remaining_batches={}",
                    ctx,
                    batches.len() - index
                );
                failures.push((tag, SyncError::Cancelled));
                break;
            }

            let batch_ctx = ctx.with_batch(&tag);
            match self.upload_batch(batch, &tag, &batch_ctx) {
                Ok(result) => report.batches.push(result),
                Err(e) => {
                    log::error!("{} UPLOAD_BATCH_FAILED error={}", batch_ctx, e);
                    failures.push((tag, e));
                }
            }
        }

        log::info!(
            "{} UPLOAD_COMPLETE batches_ok={} batches_failed={} accepted={} retried={}",
            ctx,
            report.batches.len(),
            failures.len(),
            report.accepted(),
            report.retried()
        );

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(SyncError::UploadFailed { failures })
        }
    }

    fn upload_batch(
        &self,
        batch: &[PersistedKey],
        tag: &str,
        ctx: &LogContext,
    ) -> Result<BatchResult, SyncError> {
        let keys = batch.iter().map(|row| &row.key);
        let signature = self.signer.sign(&batch_bytes(keys.clone()), ctx)?;

        let request = UploadRequest {
            batch_tag: tag.to_string(),
            signature,
            body: encode_upload_body(keys),
        };

        log::info!(
            "{} UPLOAD_BATCH_SENT keys={} body_bytes={}",
            ctx,
            batch.len(),
            request.body.len()
        );

        let response = self.gateway.upload(&request)?;
        let outcome = interpret_upload_response(&response)?;

        self.apply_outcome(batch, tag, &outcome, ctx)
    }

    /// Update key state for a classified answer.
    fn apply_outcome(
        &self,
        batch: &[PersistedKey],
        tag: &str,
        outcome: &UploadOutcome,
        ctx: &LogContext,
    ) -> Result<BatchResult, SyncError> {
        let mut result = BatchResult {
            tag: tag.to_string(),
            keys: batch.len(),
            ..BatchResult::default()
        };

        match outcome {
            UploadOutcome::Accepted => {
                let ids: Vec<i64> = batch.iter().map(|row| row.id).collect();
                self.finish(&ids)?;
                result.accepted = ids.len();
                log::info!("{} UPLOAD_BATCH_ACCEPTED keys={}", ctx, ids.len());
            }
            UploadOutcome::Rejected => {
                let ids: Vec<i64> = batch.iter().map(|row| row.id).collect();
                self.store.record_rejection(&ids)?;
                result.retried = ids.len();
                log::warn!("{} UPLOAD_BATCH_REJECTED keys={}", ctx, ids.len());
            }
            UploadOutcome::Partial(partial) => {
                let success = resolve_indices(batch, &partial.success, "201", ctx);
                let duplicate = resolve_indices(batch, &partial.duplicate, "409", ctx);
                let terminal: BTreeSet<i64> = success.iter().chain(&duplicate).copied().collect();

                let retry: Vec<i64> = resolve_indices(batch, &partial.error, "500", ctx)
                    .into_iter()
                    .filter(|id| !terminal.contains(id))
                    .collect();

                let terminal: Vec<i64> = terminal.into_iter().collect();
                self.finish(&terminal)?;
                self.store.record_rejection(&retry)?;

                result.accepted = success.len();
                result.duplicates = duplicate.len();
                result.retried = retry.len();

                log::warn!(
                    "{} UPLOAD_BATCH_PARTIAL accepted={} duplicates={} retried={} unreported={}",
                    ctx,
                    result.accepted,
                    result.duplicates,
                    result.retried,
                    batch.len() - terminal.len() - retry.len()
                );
            }
        }

        Ok(result)
    }

    /// Mark keys terminal, then remove them.
    fn finish(&self, ids: &[i64]) -> Result<(), SyncError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.store.mark_terminal(ids)?;
        self.store.delete(ids)?;
        Ok(())
    }
}

/// Map batch positions to key ids, ignoring out-of-range positions.
fn resolve_indices(
    batch: &[PersistedKey],
    indices: &[usize],
    bucket: &str,
    ctx: &LogContext,
) -> Vec<i64> {
    let mut ids = Vec::with_capacity(indices.len());
    let mut seen = BTreeSet::new();
    for &index in indices {
        match batch.get(index) {
            Some(row) => {
                if seen.insert(row.id) {
                    ids.push(row.id);
                }
            }
            None => log::warn!(
                "{} UPLOAD_INDEX_OUT_OF_RANGE bucket={} index={} batch_len={}",
                ctx,
                bucket,
                index,
                batch.len()
            ),
        }
    }
    ids
}
