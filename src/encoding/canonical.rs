//! Canonical diagnosis key encoding.
//!
//! Every field is base64-encoded and terminated by `.`; integers are encoded
//! big-endian before base64. The result depends only on field values, never
//! on the in-memory order of `visited_countries`.

use base64::{engine::general_purpose, Engine as _};
use chrono::NaiveDate;
use sha1::{Digest, Sha1};

use crate::storage::models::DiagnosisKey;

/// Field terminator.
const SEPARATOR: u8 = b'.';

/// Hex characters of the batch digest kept in a batch tag.
const TAG_HASH_CHARS: usize = 7;

/// Canonical bytes of a single key.
pub fn canonical_bytes(key: &DiagnosisKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(160);

    push_field(&mut out, &key.key_data);
    push_field(&mut out, &key.rolling_start_interval_number.to_be_bytes());
    push_field(&mut out, &key.rolling_period.to_be_bytes());
    push_field(&mut out, &key.transmission_risk_level.to_be_bytes());
    push_field(&mut out, canonical_countries(&key.visited_countries).as_bytes());
    push_field(&mut out, key.origin.as_bytes());
    push_field(&mut out, &key.report_type.as_i32().to_be_bytes());
    push_field(&mut out, &key.days_since_onset_of_symptoms.to_be_bytes());

    out
}

/// Canonical bytes of a batch: its keys' canonical bytes in batch order.
pub fn batch_bytes<'a, I>(keys: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a DiagnosisKey>,
{
    keys.into_iter().flat_map(canonical_bytes).collect()
}

/// Content-derived batch identifier: `YYYY-MM-DD-<7 hex chars of SHA1>`.
pub fn batch_tag<'a, I>(date: NaiveDate, keys: I) -> String
where
    I: IntoIterator<Item = &'a DiagnosisKey>,
{
    let digest = Sha1::digest(batch_bytes(keys));
    let hex = hex::encode(digest);
    format!("{}-{}", date.format("%Y-%m-%d"), &hex[..TAG_HASH_CHARS])
}

/// Countries sorted by their base64 form (stable), joined by `,`.
fn canonical_countries(countries: &[String]) -> String {
    let mut encoded: Vec<(String, &str)> = countries
        .iter()
        .map(|c| (general_purpose::STANDARD.encode(c), c.as_str()))
        .collect();
    encoded.sort_by(|a, b| a.0.cmp(&b.0));

    encoded
        .into_iter()
        .map(|(_, country)| country)
        .collect::<Vec<_>>()
        .join(",")
}

fn push_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(general_purpose::STANDARD.encode(bytes).as_bytes());
    out.push(SEPARATOR);
}
