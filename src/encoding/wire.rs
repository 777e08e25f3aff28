//! Gateway wire formats.
//!
//! Downloads arrive as JSON `{ "keys": [...] }`; uploads are sent as a
//! protobuf `DiagnosisKeyBatch`.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::storage::models::{DiagnosisKey, ReportType};

/// Diagnosis key as it appears in gateway JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisKeyRecord {
    /// Base64 key material.
    pub key_data: String,
    pub rolling_start_interval_number: u32,
    pub rolling_period: u32,
    #[serde(default)]
    pub transmission_risk_level: i32,
    #[serde(default)]
    pub visited_countries: Vec<String>,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub report_type: ReportType,
    #[serde(default, alias = "days_since_onset_of_symptoms")]
    pub days_since_onset_of_symptoms: i32,
}

impl From<&DiagnosisKey> for DiagnosisKeyRecord {
    fn from(key: &DiagnosisKey) -> Self {
        Self {
            key_data: general_purpose::STANDARD.encode(key.key_data),
            rolling_start_interval_number: key.rolling_start_interval_number,
            rolling_period: key.rolling_period,
            transmission_risk_level: key.transmission_risk_level,
            visited_countries: key.visited_countries.clone(),
            origin: key.origin.clone(),
            report_type: key.report_type,
            days_since_onset_of_symptoms: key.days_since_onset_of_symptoms,
        }
    }
}

/// Body of a gateway download page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadBody {
    #[serde(default)]
    pub keys: Vec<DiagnosisKeyRecord>,
}

/// Protobuf upload batch.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtoDiagnosisKeyBatch {
    #[prost(message, repeated, tag = "1")]
    pub keys: Vec<ProtoDiagnosisKey>,
}

/// Protobuf diagnosis key.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtoDiagnosisKey {
    #[prost(bytes = "vec", tag = "1")]
    pub key_data: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub rolling_start_interval_number: u32,
    #[prost(uint32, tag = "3")]
    pub rolling_period: u32,
    #[prost(int32, tag = "4")]
    pub transmission_risk_level: i32,
    #[prost(string, repeated, tag = "5")]
    pub visited_countries: Vec<String>,
    #[prost(string, tag = "6")]
    pub origin: String,
    /// `ReportType` discriminant; enums share the int32 varint encoding.
    #[prost(int32, tag = "7")]
    pub report_type: i32,
    #[prost(sint32, tag = "8")]
    pub days_since_onset_of_symptoms: i32,
}

impl From<&DiagnosisKey> for ProtoDiagnosisKey {
    fn from(key: &DiagnosisKey) -> Self {
        Self {
            key_data: key.key_data.to_vec(),
            rolling_start_interval_number: key.rolling_start_interval_number,
            rolling_period: key.rolling_period,
            transmission_risk_level: key.transmission_risk_level,
            visited_countries: key.visited_countries.clone(),
            origin: key.origin.clone(),
            report_type: key.report_type.as_i32(),
            days_since_onset_of_symptoms: key.days_since_onset_of_symptoms,
        }
    }
}

/// Encode keys, in order, as a protobuf upload body.
pub fn encode_upload_body<'a, I>(keys: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a DiagnosisKey>,
{
    let batch = ProtoDiagnosisKeyBatch {
        keys: keys.into_iter().map(ProtoDiagnosisKey::from).collect(),
    };
    prost::Message::encode_to_vec(&batch)
}
