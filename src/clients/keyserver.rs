//! Key server publish client.

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Step};
use crate::storage::models::ExposureKey;

use super::http::{body_text, build_client, decode_json, join_url, send_with_backoff, HttpSettings};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishRequest {
    pub keys: Vec<ExposureKey>,
    #[serde(rename = "healthAuthorityID")]
    pub health_authority_id: String,
    /// Verification certificate.
    #[serde(rename = "verificationPayload")]
    pub verification_payload: String,
    /// Base64 secret the certificate's HMAC was computed with.
    #[serde(rename = "hmacKey")]
    pub hmac_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishResponse {
    pub inserted_exposures: usize,
    pub revision_token: String,
    pub code: String,
    pub error_message: String,
}

/// Key server operations.
pub trait KeyServer: Send + Sync {
    fn publish(&self, request: &PublishRequest) -> Result<PublishResponse, ClientError>;
}

#[derive(Debug, Clone)]
pub struct HttpKeyServer {
    base_url: String,
    client: Client,
    settings: HttpSettings,
}

impl HttpKeyServer {
    pub fn new(base_url: &str, settings: HttpSettings) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: base_url.to_string(),
            client: build_client(&settings, None, Step::Publish)?,
            settings,
        })
    }
}

impl KeyServer for HttpKeyServer {
    fn publish(&self, request: &PublishRequest) -> Result<PublishResponse, ClientError> {
        let url = join_url(&self.base_url, "v1/publish");
        let response = send_with_backoff(&self.settings, Step::Publish, || {
            self.client.post(&url).json(request)
        })?;

        let status = response.status();
        let text = body_text(Step::Publish, response)?;
        if !status.is_success() && status.as_u16() != 400 {
            return Err(ClientError::UnexpectedStatus {
                step: Step::Publish,
                status: status.as_u16(),
                body: text,
            });
        }
        decode_json(Step::Publish, &text)
    }
}
