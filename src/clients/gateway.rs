//! Federation gateway client.

use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;

use crate::encoding::wire::{DiagnosisKeyRecord, DownloadBody};
use crate::error::{ClientError, Step};

use super::http::{body_text, build_client, decode_json, join_url, send_with_backoff, HttpSettings};

pub const DOWNLOAD_ACCEPT: &str = "application/json; version=1.0";
pub const UPLOAD_CONTENT_TYPE: &str = "application/protobuf; version=1.0";
pub const BATCH_TAG_HEADER: &str = "batchTag";
pub const BATCH_SIGNATURE_HEADER: &str = "batchSignature";
pub const NEXT_BATCH_TAG_HEADER: &str = "nextBatchTag";

/// A signed, encoded upload batch.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub batch_tag: String,
    /// Base64 detached signature over the batch's canonical bytes.
    pub signature: String,
    /// Protobuf `DiagnosisKeyBatch`.
    pub body: Vec<u8>,
}

/// Raw upload answer; status classes are interpreted by the upload pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub status: u16,
    pub body: String,
}

/// One page of a download.
#[derive(Debug, Clone, Default)]
pub struct DownloadPage {
    pub keys: Vec<DiagnosisKeyRecord>,
    /// Raw `nextBatchTag` header, if the gateway sent one.
    pub next_batch_tag: Option<String>,
}

/// Federation gateway operations.
pub trait Gateway: Send + Sync {
    fn upload(&self, request: &UploadRequest) -> Result<UploadResponse, ClientError>;

    /// Fetch the keys of `date`, continuing from `batch_tag` when given.
    fn download_page(
        &self,
        date: NaiveDate,
        batch_tag: Option<&str>,
    ) -> Result<DownloadPage, ClientError>;
}

/// Gateway client over mutual TLS.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    base_url: String,
    client: Client,
    settings: HttpSettings,
}

impl HttpGateway {
    /// `identity_pem` holds the client certificate and key the gateway
    /// authenticates this backend by.
    pub fn new(
        base_url: &str,
        identity_pem: Option<&[u8]>,
        settings: HttpSettings,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: base_url.to_string(),
            client: build_client(&settings, identity_pem, Step::GatewayUpload)?,
            settings,
        })
    }
}

impl Gateway for HttpGateway {
    fn upload(&self, request: &UploadRequest) -> Result<UploadResponse, ClientError> {
        let url = join_url(&self.base_url, "diagnosiskeys/upload");

        let response = send_with_backoff(&self.settings, Step::GatewayUpload, || {
            self.client
                .post(&url)
                .header(CONTENT_TYPE, UPLOAD_CONTENT_TYPE)
                .header(BATCH_TAG_HEADER, &request.batch_tag)
                .header(BATCH_SIGNATURE_HEADER, &request.signature)
                .body(request.body.clone())
        })?;

        let status = response.status().as_u16();
        let body = body_text(Step::GatewayUpload, response)?;
        Ok(UploadResponse { status, body })
    }

    fn download_page(
        &self,
        date: NaiveDate,
        batch_tag: Option<&str>,
    ) -> Result<DownloadPage, ClientError> {
        let url = join_url(
            &self.base_url,
            &format!("diagnosiskeys/download/{}", date.format("%Y-%m-%d")),
        );

        let response = send_with_backoff(&self.settings, Step::GatewayDownload, || {
            let request = self.client.get(&url).header(ACCEPT, DOWNLOAD_ACCEPT);
            match batch_tag {
                Some(tag) => request.header(BATCH_TAG_HEADER, tag),
                None => request,
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            // No batches published for this date.
            return Ok(DownloadPage::default());
        }

        let next_batch_tag = response
            .headers()
            .get(NEXT_BATCH_TAG_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let body = body_text(Step::GatewayDownload, response)?;
        if !status.is_success() {
            return Err(ClientError::UnexpectedStatus {
                step: Step::GatewayDownload,
                status: status.as_u16(),
                body,
            });
        }

        let parsed: DownloadBody = decode_json(Step::GatewayDownload, &body)?;
        Ok(DownloadPage {
            keys: parsed.keys,
            next_batch_tag,
        })
    }
}
