//! Shared blocking HTTP plumbing.
//!
//! Builds clients with a bounded timeout and retries requests the remote
//! side throttles with `429 Too Many Requests`.

use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::RETRY_AFTER;
use reqwest::{Identity, StatusCode};

use crate::error::{ClientError, Step};

/// Backoff before the first throttled retry.
const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound of a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Transport settings shared by all clients.
#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub max_throttle_retries: u32,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_throttle_retries: 3,
        }
    }
}

/// Build a blocking client, optionally presenting a TLS client identity.
pub fn build_client(
    settings: &HttpSettings,
    identity_pem: Option<&[u8]>,
    step: Step,
) -> Result<Client, ClientError> {
    let mut builder = Client::builder().timeout(settings.timeout);

    if let Some(pem) = identity_pem {
        let identity = Identity::from_pem(pem).map_err(|e| ClientError::Request {
            step,
            message: format!("Invalid client identity: {}", e),
        })?;
        builder = builder.identity(identity);
    }

    builder.build().map_err(|e| ClientError::Request {
        step,
        message: format!("Failed to build HTTP client: {}", e),
    })
}

/// Send a request, sleeping and retrying while the server answers 429.
///
/// `build` is called once per attempt since a sent request is consumed.
pub fn send_with_backoff<F>(
    settings: &HttpSettings,
    step: Step,
    build: F,
) -> Result<Response, ClientError>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0u32;
    loop {
        let response = build().send().map_err(|e| transport(step, e))?;

        if response.status() != StatusCode::TOO_MANY_REQUESTS
            || attempt >= settings.max_throttle_retries
        {
            return Ok(response);
        }

        let delay = retry_after(&response).unwrap_or_else(|| backoff(attempt));
        log::warn!(
            "HTTP_THROTTLED step={} attempt={} delay_ms={}",
            step,
            attempt + 1,
            delay.as_millis()
        );
        thread::sleep(delay);
        attempt += 1;
    }
}

/// Exponential backoff for the given zero-based attempt, capped.
pub fn backoff(attempt: u32) -> Duration {
    BASE_BACKOFF
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_BACKOFF)
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_BACKOFF))
}

pub fn transport(step: Step, error: reqwest::Error) -> ClientError {
    ClientError::Transport {
        step,
        message: error.to_string(),
    }
}

/// Read the body as text, mapping read failures to transport errors.
pub fn body_text(step: Step, response: Response) -> Result<String, ClientError> {
    response.text().map_err(|e| transport(step, e))
}

/// Decode a JSON body.
pub fn decode_json<T: serde::de::DeserializeOwned>(step: Step, body: &str) -> Result<T, ClientError> {
    serde_json::from_str(body).map_err(|e| ClientError::Decode {
        step,
        message: e.to_string(),
    })
}

/// Join a base URL and a path with exactly one slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
