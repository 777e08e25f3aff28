//! Key models.
//!
//! `DiagnosisKey` is the canonical exposure-key record exchanged with the
//! gateway; `PersistedKey` adds the storage metadata of the export table;
//! `ExposureKey` is the reduced view the local key server accepts.

use std::collections::BTreeSet;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Length of temporary exposure key material.
pub const KEY_LENGTH: usize = 16;

/// Seconds per rolling interval (10 minutes).
pub const INTERVAL_SECONDS: i64 = 600;

/// Rolling intervals per day.
pub const INTERVALS_PER_DAY: u32 = 144;

/// How a diagnosis was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportType {
    #[default]
    Unknown,
    ConfirmedTest,
    ConfirmedClinicalDiagnosis,
    SelfReport,
    Recursive,
    Revoked,
}

impl ReportType {
    pub fn as_i32(self) -> i32 {
        match self {
            ReportType::Unknown => 0,
            ReportType::ConfirmedTest => 1,
            ReportType::ConfirmedClinicalDiagnosis => 2,
            ReportType::SelfReport => 3,
            ReportType::Recursive => 4,
            ReportType::Revoked => 5,
        }
    }

    /// Unknown discriminants map to `Unknown`.
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ReportType::ConfirmedTest,
            2 => ReportType::ConfirmedClinicalDiagnosis,
            3 => ReportType::SelfReport,
            4 => ReportType::Recursive,
            5 => ReportType::Revoked,
            _ => ReportType::Unknown,
        }
    }
}

/// Canonical diagnosis key record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosisKey {
    pub key_data: [u8; KEY_LENGTH],
    pub rolling_start_interval_number: u32,
    pub rolling_period: u32,
    pub transmission_risk_level: i32,
    pub visited_countries: Vec<String>,
    pub origin: String,
    pub report_type: ReportType,
    pub days_since_onset_of_symptoms: i32,
}

impl DiagnosisKey {
    /// UTC calendar date the key's validity window starts on.
    pub fn key_date(&self) -> NaiveDate {
        interval_date(self.rolling_start_interval_number)
    }

    /// Reduced key-server view of this key.
    pub fn to_exposure_key(&self) -> ExposureKey {
        ExposureKey {
            key: general_purpose::STANDARD.encode(self.key_data),
            interval_number: self.rolling_start_interval_number,
            interval_count: self.rolling_period,
            transmission_risk: self.transmission_risk_level,
        }
    }
}

/// Upload state of a persisted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Awaiting upload; `attempts` counts gateway rejections so far.
    Pending { attempts: u32 },
    /// Uploaded or confirmed duplicate. Never uploaded again.
    Terminal,
}

impl RetryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RetryState::Terminal)
    }

    /// State after one more rejected upload attempt. Terminal stays terminal.
    pub fn after_rejection(self) -> Self {
        match self {
            RetryState::Pending { attempts } => RetryState::Pending {
                attempts: attempts.saturating_add(1),
            },
            RetryState::Terminal => RetryState::Terminal,
        }
    }
}

impl Default for RetryState {
    fn default() -> Self {
        RetryState::Pending { attempts: 0 }
    }
}

/// A diagnosis key row of the export table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedKey {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub retry: RetryState,
    pub key: DiagnosisKey,
}

/// Key as submitted to the local key server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureKey {
    /// Base64 key material.
    pub key: String,
    #[serde(rename = "rollingStartNumber")]
    pub interval_number: u32,
    #[serde(rename = "rollingPeriod")]
    pub interval_count: u32,
    #[serde(rename = "transmissionRisk")]
    pub transmission_risk: i32,
}

impl ExposureKey {
    /// UTC calendar date of the key's interval number.
    pub fn key_date(&self) -> NaiveDate {
        interval_date(self.interval_number)
    }

    /// Build the canonical record for a locally published key.
    ///
    /// Days since onset is `key date - onset date` in whole days and is
    /// negative when symptoms started after the key's date.
    pub fn to_diagnosis_key(
        &self,
        symptom_onset: NaiveDate,
        origin: &str,
        visited_countries: &BTreeSet<String>,
        report_type: ReportType,
    ) -> Result<DiagnosisKey, String> {
        let bytes = general_purpose::STANDARD
            .decode(&self.key)
            .map_err(|e| format!("Failed to decode base64 key: {}", e))?;

        let key_data: [u8; KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
            format!("Invalid key length: expected {}, got {}", KEY_LENGTH, b.len())
        })?;

        let days = (self.key_date() - symptom_onset).num_days();

        Ok(DiagnosisKey {
            key_data,
            rolling_start_interval_number: self.interval_number,
            rolling_period: self.interval_count,
            transmission_risk_level: self.transmission_risk,
            visited_countries: visited_countries.iter().cloned().collect(),
            origin: origin.to_uppercase(),
            report_type,
            days_since_onset_of_symptoms: days as i32,
        })
    }
}

/// UTC date containing the given rolling interval.
pub fn interval_date(interval_number: u32) -> NaiveDate {
    DateTime::from_timestamp(interval_number as i64 * INTERVAL_SECONDS, 0)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// First rolling interval of a UTC date.
pub fn date_interval(date: NaiveDate) -> u32 {
    let secs = date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default();
    (secs / INTERVAL_SECONDS) as u32
}
