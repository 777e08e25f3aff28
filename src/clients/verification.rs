//! Verification server client.
//!
//! Issues single-use verification codes, exchanges them for tokens and
//! tokens for HMAC-bound certificates.

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Step};

use super::http::{body_text, build_client, decode_json, join_url, send_with_backoff, HttpSettings};

pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueCodeRequest {
    pub test_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symptom_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_date: Option<String>,
    pub tz_offset: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IssueCodeResponse {
    pub code: String,
    pub uuid: String,
    pub error: String,
    pub error_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerifyCodeResponse {
    pub token: String,
    #[serde(rename = "testtype")]
    pub test_type: String,
    pub symptom_date: String,
    pub error: String,
    pub error_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateResponse {
    pub certificate: String,
    pub error: String,
    pub error_code: String,
}

#[derive(Debug, Serialize)]
struct VerifyCodeRequest<'a> {
    code: &'a str,
    accept: &'a [String],
}

#[derive(Debug, Serialize)]
struct CertificateRequest<'a> {
    token: &'a str,
    ekeyhmac: &'a str,
}

/// Verification server operations.
pub trait VerificationServer: Send + Sync {
    /// Issue a code via the admin API.
    fn issue_code(&self, request: &IssueCodeRequest) -> Result<IssueCodeResponse, ClientError>;

    /// Exchange a code for a verification token via the device API.
    fn verify_code(&self, code: &str) -> Result<VerifyCodeResponse, ClientError>;

    /// Exchange a token and base64 key-set HMAC for a certificate.
    fn certificate(&self, token: &str, hmac: &str) -> Result<CertificateResponse, ClientError>;
}

#[derive(Debug, Clone)]
pub struct HttpVerificationServer {
    base_url: String,
    admin_api_key: String,
    device_api_key: String,
    accept_test_types: Vec<String>,
    client: Client,
    settings: HttpSettings,
}

impl HttpVerificationServer {
    pub fn new(
        base_url: &str,
        admin_api_key: &str,
        device_api_key: &str,
        test_type: &str,
        settings: HttpSettings,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: base_url.to_string(),
            admin_api_key: admin_api_key.to_string(),
            device_api_key: device_api_key.to_string(),
            accept_test_types: vec![test_type.to_string()],
            client: build_client(&settings, None, Step::IssueCode)?,
            settings,
        })
    }

    /// POST a JSON body; 2xx and 400 carry a decodable body, anything else
    /// is an unexpected status.
    fn post<B, R>(&self, step: Step, path: &str, api_key: &str, body: &B) -> Result<R, ClientError>
    where
        B: Serialize,
        R: serde::de::DeserializeOwned,
    {
        let url = join_url(&self.base_url, path);
        let response = send_with_backoff(&self.settings, step, || {
            self.client
                .post(&url)
                .header(API_KEY_HEADER, api_key)
                .json(body)
        })?;

        let status = response.status();
        let text = body_text(step, response)?;
        if !status.is_success() && status.as_u16() != 400 {
            return Err(ClientError::UnexpectedStatus {
                step,
                status: status.as_u16(),
                body: text,
            });
        }
        decode_json(step, &text)
    }
}

impl VerificationServer for HttpVerificationServer {
    fn issue_code(&self, request: &IssueCodeRequest) -> Result<IssueCodeResponse, ClientError> {
        self.post(Step::IssueCode, "api/issue", &self.admin_api_key, request)
    }

    fn verify_code(&self, code: &str) -> Result<VerifyCodeResponse, ClientError> {
        let request = VerifyCodeRequest {
            code,
            accept: &self.accept_test_types,
        };
        self.post(Step::VerifyCode, "api/verify", &self.device_api_key, &request)
    }

    fn certificate(&self, token: &str, hmac: &str) -> Result<CertificateResponse, ClientError> {
        let request = CertificateRequest {
            token,
            ekeyhmac: hmac,
        };
        self.post(Step::Certificate, "api/certificate", &self.device_api_key, &request)
    }
}
