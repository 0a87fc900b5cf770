use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::error::SubmitError;

const BASE_DELAY_MS: u64 = 200;

/// Which remote system a request went to; decides the error variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Archive,
    Storage,
}

impl Service {
    fn transport(self, message: String) -> SubmitError {
        match self {
            Service::Archive => SubmitError::ArchiveHttp(message),
            Service::Storage => SubmitError::StorageHttp(message),
        }
    }

    fn status(self, status: u16, message: String) -> SubmitError {
        match self {
            Service::Archive => SubmitError::ArchiveStatus { status, message },
            Service::Storage => SubmitError::StorageStatus { status, message },
        }
    }
}

pub fn build_client(
    service: Service,
    token: Option<&str>,
    timeout: Duration,
) -> Result<Client, SubmitError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("seq-submit/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| service.transport(err.to_string()))?,
    );
    if let Some(token) = token {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| service.transport(err.to_string()))?,
        );
    }
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|err| service.transport(err.to_string()))
}

/// Sends until a success, a non-retryable failure, or `max_retries` retries.
/// Running out of retries wraps the last failure in `RetriesExhausted`.
pub fn send_with_retries<F>(
    service: Service,
    max_retries: usize,
    mut make_req: F,
) -> Result<Response, SubmitError>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt = 0usize;
    loop {
        let (err, retryable) = match make_req().send() {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => {
                let status = resp.status().as_u16();
                let message = error_message(resp);
                (service.status(status, message), is_retryable_status(status))
            }
            Err(err) => {
                let retryable = is_retryable_error(&err);
                (service.transport(err.to_string()), retryable)
            }
        };

        if !retryable {
            return Err(err);
        }
        if attempt >= max_retries {
            return Err(SubmitError::RetriesExhausted {
                attempts: attempt + 1,
                source: Box::new(err),
            });
        }
        tracing::debug!(?service, attempt, error = %err, "retrying request");
        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
        attempt += 1;
    }
}

/// Prefers the `message` field of a JSON error body over the raw text.
fn error_message(response: Response) -> String {
    let status = response.status();
    let text = response.text().unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| text.trim().to_string());
    if message.is_empty() {
        format!("HTTP {status}")
    } else {
        message
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
