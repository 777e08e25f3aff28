//! Gateway download pipeline.
//!
//! Runs under the scheduled-download lock:
//! 1. Page through the gateway's keys for a date
//! 2. Validate and group them by origin country
//! 3. Publish each group under its Health Authority ID
//!
//! One group's failure never stops the others; failures are aggregated.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;

use crate::clients::gateway::{DownloadPage, Gateway};
use crate::coordination::lock::{Acquisition, DistributedLock};
use crate::error::{ClientError, Step, SyncError};
use crate::routing::authority::{group_by_origin, AuthorityMap};
use crate::validation::keys::validate_records;

use super::context::RunContext;
use super::publish::{PublishPipeline, PublishReport};

/// Continuation tag as the gateway means it; absent, blank and `"null"` end
/// the download.
pub fn normalize_batch_tag(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim)
        .filter(|tag| !tag.is_empty() && !tag.eq_ignore_ascii_case("null"))
}

enum PageState {
    First,
    Next(String),
    Done,
}

/// Lazy sequence of download pages for one date.
///
/// Ends when the gateway stops sending a continuation tag. Cancellation is
/// checked before every request. A tag pointing back at a page already
/// requested ends the sequence with an error.
pub struct Pages<'a> {
    gateway: &'a dyn Gateway,
    date: NaiveDate,
    run: &'a RunContext,
    state: PageState,
    requested: HashSet<String>,
}

impl<'a> Pages<'a> {
    pub fn new(gateway: &'a dyn Gateway, date: NaiveDate, run: &'a RunContext) -> Self {
        Self {
            gateway,
            date,
            run,
            state: PageState::First,
            requested: HashSet::new(),
        }
    }
}

impl Iterator for Pages<'_> {
    type Item = Result<DownloadPage, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        let tag = match std::mem::replace(&mut self.state, PageState::Done) {
            PageState::Done => return None,
            PageState::First => None,
            PageState::Next(tag) => Some(tag),
        };

        if self.run.is_cancelled() {
            return Some(Err(SyncError::Cancelled));
        }

        if let Some(tag) = &tag {
            self.requested.insert(tag.clone());
        }

        let page = match self.gateway.download_page(self.date, tag.as_deref()) {
            Ok(page) => page,
            Err(e) => return Some(Err(e.into())),
        };

        let next = normalize_batch_tag(page.next_batch_tag.as_deref()).map(str::to_string);
        match next {
            Some(next) if self.requested.contains(&next) => {
                return Some(Err(ClientError::Decode {
                    step: Step::GatewayDownload,
                    message: format!("gateway revisited batch tag {}", next),
                }
                .into()));
            }
            Some(next) => self.state = PageState::Next(next),
            None => {}
        }

        Some(Ok(page))
    }
}

/// Summary of a download run.
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    /// Another instance held the download lock.
    pub skipped: bool,
    pub pages: usize,
    pub downloaded: usize,
    pub rejected: usize,
    /// Publish results by origin country.
    pub published: BTreeMap<String, PublishReport>,
}

/// Imports gateway keys into the local key server.
pub struct DownloadPipeline<'a> {
    pub gateway: &'a dyn Gateway,
    pub lock: &'a DistributedLock,
    pub lock_name: &'a str,
    pub authorities: &'a AuthorityMap,
    pub publisher: PublishPipeline<'a>,
}

impl<'a> DownloadPipeline<'a> {
    pub fn run(&self, date: NaiveDate, run: &RunContext) -> Result<DownloadReport, SyncError> {
        let ctx = run.log_context();

        let handle = match self.lock.acquire(self.lock_name, &ctx)? {
            Acquisition::Acquired(handle) => handle,
            Acquisition::AlreadyHeld => {
                log::info!("{} DOWNLOAD_SKIPPED lock={}", ctx, self.lock_name);
                return Ok(DownloadReport {
                    skipped: true,
                    ..DownloadReport::default()
                });
            }
        };

        let result = self.download_and_publish(date, run);

        if let Err(e) = handle.release() {
            log::warn!("{} LOCK_RELEASE_FAILED error={}", ctx, e);
        }
        result
    }

    fn download_and_publish(
        &self,
        date: NaiveDate,
        run: &RunContext,
    ) -> Result<DownloadReport, SyncError> {
        let ctx = run.log_context();
        let mut report = DownloadReport::default();

        let mut records = Vec::new();
        for page in Pages::new(self.gateway, date, run) {
            let page = page?;
            report.pages += 1;
            crate::log_debug!(
                ctx,
                "DOWNLOAD_PAGE",
                page = report.pages,
                keys = page.keys.len(),
                next = page.next_batch_tag
            );
            records.extend(page.keys);
        }

        report.downloaded = records.len();
        log::info!(
            "{} DOWNLOAD_FETCHED date={} pages={} keys={}",
            ctx,
            date,
            report.pages,
            report.downloaded
        );
        if records.is_empty() {
            return Ok(report);
        }

        let summary = validate_records(&records, &ctx);
        report.rejected = summary.rejected;

        let mut failures = Vec::new();
        let groups = group_by_origin(summary.keys, &ctx);
        let group_count = groups.len();

        for (index, (country, keys)) in groups.into_iter().enumerate() {
            let group_ctx = ctx.with_group(&country);

            if run.is_cancelled() {
                log::warn!(
                    "{} DOWNLOAD_CANCELLED remaining_groups={}",
                    group_ctx,
                    group_count - index
                );
                failures.push((country, SyncError::Cancelled));
                break;
            }

            let Some(haid) = self.authorities.resolve(&country) else {
                crate::log_error!(group_ctx, "GROUP_UNMAPPED", keys = keys.len());
                failures.push((country.clone(), SyncError::UnmappedCountry(country)));
                continue;
            };

            let exposure_keys = keys.iter().map(|k| k.to_exposure_key()).collect();
            match self
                .publisher
                .publish_group(haid, exposure_keys, run, &group_ctx)
            {
                Ok(published) => {
                    report.published.insert(country, published);
                }
                Err(e) => {
                    log::error!("{} GROUP_FAILED haid={} error={}", group_ctx, haid, e);
                    failures.push((country, e));
                }
            }
        }

        log::info!(
            "{} DOWNLOAD_COMPLETE groups_ok={} groups_failed={} rejected={}",
            ctx,
            report.published.len(),
            failures.len(),
            report.rejected
        );

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(SyncError::DownloadFailed { failures })
        }
    }
}
