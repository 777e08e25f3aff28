//! Downloaded key validation.
//!
//! Converts gateway records into canonical `DiagnosisKey`s, dropping records
//! that no key server would accept.

use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;

use crate::encoding::wire::DiagnosisKeyRecord;
use crate::logging::structured::LogContext;
use crate::storage::models::{DiagnosisKey, INTERVALS_PER_DAY, KEY_LENGTH};

lazy_static! {
    /// ISO 3166-1 alpha-2 country code, case-insensitive.
    static ref COUNTRY_CODE: Regex = Regex::new(r"^[A-Za-z]{2}$").unwrap();
}

/// Why a downloaded record was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRejection {
    InvalidBase64(String),
    InvalidKeyLength(usize),
    InvalidRollingPeriod(u32),
    InvalidOrigin(String),
    InvalidVisitedCountry(String),
}

impl std::fmt::Display for KeyRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyRejection::InvalidBase64(e) => write!(f, "invalid base64 key data: {}", e),
            KeyRejection::InvalidKeyLength(len) => {
                write!(f, "invalid key length: expected {}, got {}", KEY_LENGTH, len)
            }
            KeyRejection::InvalidRollingPeriod(p) => write!(f, "invalid rolling period: {}", p),
            KeyRejection::InvalidOrigin(o) => write!(f, "invalid origin: {:?}", o),
            KeyRejection::InvalidVisitedCountry(c) => write!(f, "invalid visited country: {:?}", c),
        }
    }
}

/// Outcome of validating one download.
#[derive(Debug, Default)]
pub struct ValidationSummary {
    pub keys: Vec<DiagnosisKey>,
    pub rejected: usize,
}

pub fn is_country_code(code: &str) -> bool {
    COUNTRY_CODE.is_match(code)
}

/// Validate a single record. Country codes are upper-cased.
pub fn validate_record(record: &DiagnosisKeyRecord) -> Result<DiagnosisKey, KeyRejection> {
    let bytes = general_purpose::STANDARD
        .decode(&record.key_data)
        .map_err(|e| KeyRejection::InvalidBase64(e.to_string()))?;

    let len = bytes.len();
    let key_data: [u8; KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| KeyRejection::InvalidKeyLength(len))?;

    if record.rolling_period == 0 || record.rolling_period > INTERVALS_PER_DAY {
        return Err(KeyRejection::InvalidRollingPeriod(record.rolling_period));
    }

    if !is_country_code(&record.origin) {
        return Err(KeyRejection::InvalidOrigin(record.origin.clone()));
    }

    let mut visited_countries = Vec::with_capacity(record.visited_countries.len());
    for country in &record.visited_countries {
        if !is_country_code(country) {
            return Err(KeyRejection::InvalidVisitedCountry(country.clone()));
        }
        visited_countries.push(country.to_uppercase());
    }

    Ok(DiagnosisKey {
        key_data,
        rolling_start_interval_number: record.rolling_start_interval_number,
        rolling_period: record.rolling_period,
        transmission_risk_level: record.transmission_risk_level,
        visited_countries,
        origin: record.origin.to_uppercase(),
        report_type: record.report_type,
        days_since_onset_of_symptoms: record.days_since_onset_of_symptoms,
    })
}

/// Validate a downloaded page set, logging and counting dropped records.
pub fn validate_records(records: &[DiagnosisKeyRecord], ctx: &LogContext) -> ValidationSummary {
    let mut summary = ValidationSummary::default();

    for (index, record) in records.iter().enumerate() {
        match validate_record(record) {
            Ok(key) => summary.keys.push(key),
            Err(reason) => {
                log::warn!(
                    "{} KEY_REJECTED index={} origin={:?} reason={}",
                    ctx,
                    index,
                    record.origin,
                    reason
                );
                summary.rejected += 1;
            }
        }
    }

    if summary.rejected > 0 {
        log::warn!(
            "{} KEY_VALIDATION_COMPLETE valid={} rejected={}",
            ctx,
            summary.keys.len(),
            summary.rejected
        );
    } else {
        log::debug!("{} KEY_VALIDATION_COMPLETE valid={}", ctx, summary.keys.len());
    }

    summary
}
