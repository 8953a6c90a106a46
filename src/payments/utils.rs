use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

/// Request body sent to the provider.
#[derive(Debug, Clone, Copy)]
pub enum RequestBody<'a> {
    Empty,
    Json(&'a JsonValue),
    /// Pre-encoded `application/x-www-form-urlencoded` body.
    Form(&'a str),
}

#[derive(Debug, Clone, Copy)]
pub enum Auth<'a> {
    Bearer(&'a str),
    /// Already base64-encoded `client:secret`.
    Basic(&'a str),
}

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    provider: &'static str,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(provider: &'static str, timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            provider,
            timeout,
            max_retries,
        })
    }

    /// Sends a request and returns the decoded JSON body.
    ///
    /// 429 and 5xx responses as well as transport failures are retried with
    /// exponential backoff. Empty 2xx bodies decode as `{}`.
    pub async fn request_json(
        &self,
        method: reqwest::Method,
        url: &str,
        auth: Option<Auth<'_>>,
        body: RequestBody<'_>,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<JsonValue> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let mut request = self.client.request(method.clone(), url);
            request = request.timeout(self.timeout);

            match auth {
                Some(Auth::Bearer(token)) => request = request.bearer_auth(token),
                Some(Auth::Basic(encoded)) => {
                    let value = HeaderValue::from_str(&format!("Basic {}", encoded)).map_err(
                        |_| PaymentError::AuthenticationError {
                            message: "invalid basic credentials".to_string(),
                        },
                    )?;
                    request = request.header(AUTHORIZATION, value);
                }
                None => {}
            }
            for (k, v) in additional_headers {
                request = request.header(*k, *v);
            }
            request = match body {
                RequestBody::Empty => request,
                RequestBody::Json(payload) => request.json(payload),
                RequestBody::Form(encoded) => request
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(encoded.to_string()),
            };

            let response = request
                .send()
                .await
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("provider request failed: {}", e),
                });

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        if text.trim().is_empty() {
                            return Ok(JsonValue::Object(Default::default()));
                        }
                        return serde_json::from_str::<JsonValue>(&text).map_err(|e| {
                            PaymentError::InvalidResponse {
                                message: format!("invalid {} JSON response: {}", self.provider, e),
                            }
                        });
                    }

                    if status.as_u16() == 401 {
                        return Err(PaymentError::AuthenticationError {
                            message: format!("{} rejected credentials", self.provider),
                        });
                    }

                    if status.as_u16() == 429 {
                        if attempt < self.max_retries {
                            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                            continue;
                        }
                        return Err(PaymentError::RateLimitError {
                            message: format!("{} rate limit exceeded", self.provider),
                            retry_after_seconds: None,
                        });
                    }

                    if status.is_server_error() && attempt < self.max_retries {
                        warn!(
                            provider = self.provider,
                            status = %status,
                            attempt = attempt + 1,
                            "provider server error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }

                    return Err(PaymentError::ProviderError {
                        provider: self.provider.to_string(),
                        message: format!("HTTP {}: {}", status, text),
                        provider_code: Some(status.as_u16().to_string()),
                        retryable: status.is_server_error(),
                    });
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(PaymentError::NetworkError {
            message: format!("{} request failed", self.provider),
        }))
    }
}

/// Reads a string at a JSON pointer, skipping blanks.
pub fn json_str<'a>(value: &'a JsonValue, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Encodes form pairs; values are restricted to unreserved characters.
pub fn encode_form(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
