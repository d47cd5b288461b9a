//! HTTP attempt planning, response validation and the reqwest transport.

use std::sync::LazyLock;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use reqwest::header::{CONTENT_RANGE, RANGE};
use url::Url;

use super::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::request::RequestError;
use crate::stream::ByteRange;

static CONTENT_RANGE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^bytes (\d+)-(\d+)/(\d+|\*)$").ok());

/// What an HTTP attempt asks for, derived from the request state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAttemptPlan {
    pub url: Url,
    pub segment_range: Option<ByteRange>,
    /// Bytes kept from previous attempts; the attempt resumes after them
    pub loaded_bytes: u64,
    pub total_bytes: Option<u64>,
}

impl HttpAttemptPlan {
    /// Inclusive range to request, if the attempt is ranged.
    pub fn request_range(&self) -> Option<(u64, Option<u64>)> {
        match self.segment_range {
            Some(range) => Some((range.start + self.loaded_bytes, Some(range.end))),
            None if self.loaded_bytes > 0 => Some((self.loaded_bytes, None)),
            None => None,
        }
    }

    pub fn to_request(&self) -> HttpRequest {
        HttpRequest {
            url: self.url.clone(),
            range: self.request_range(),
        }
    }
}

/// Accepted response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseVerdict {
    /// Server ignored the resume range; received bytes must be dropped
    pub restart: bool,
    /// Segment size learned from the headers
    pub learned_total: Option<u64>,
}

/// Rejected response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFailure {
    pub error: RequestError,
    /// Received bytes are unusable for a resume
    pub clear_loaded_bytes: bool,
}

impl HttpFailure {
    fn mismatch() -> Self {
        Self {
            error: RequestError::HttpBytesMismatch,
            clear_loaded_bytes: true,
        }
    }
}

/// Checks status and length headers against the plan.
///
/// # Errors
///
/// - `HttpBytesMismatch` - 406, or lengths disagree with the requested range
/// - `HttpError` - Non-2xx status
/// - `HttpUnexpectedStatusCode` - 2xx status that does not fit the request
pub fn validate_response(
    plan: &HttpAttemptPlan,
    status: u16,
    content_length: Option<u64>,
    content_range: Option<&str>,
) -> Result<ResponseVerdict, HttpFailure> {
    if status == 406 {
        return Err(HttpFailure::mismatch());
    }
    if !(200..300).contains(&status) {
        return Err(HttpFailure {
            error: RequestError::HttpError { status },
            clear_loaded_bytes: false,
        });
    }

    match (plan.request_range(), status) {
        (Some(_), 200) => {
            if plan.segment_range.is_some() {
                return Err(HttpFailure {
                    error: RequestError::HttpUnexpectedStatusCode { status },
                    clear_loaded_bytes: true,
                });
            }
            Ok(ResponseVerdict {
                restart: true,
                learned_total: content_length,
            })
        }
        (Some((from, to)), 206) => {
            let expected_length = match to {
                Some(to) => Some(to + 1 - from),
                None => plan
                    .total_bytes
                    .map(|total| total.saturating_sub(plan.loaded_bytes)),
            };
            if matches!((expected_length, content_length), (Some(expected), Some(actual)) if expected != actual)
            {
                return Err(HttpFailure::mismatch());
            }

            let mut learned_total = None;
            if let Some(header) = content_range {
                let (start, end, total) = parse_content_range(header).ok_or_else(HttpFailure::mismatch)?;
                if start != from || to.is_some_and(|to| to != end) {
                    return Err(HttpFailure::mismatch());
                }
                if plan.segment_range.is_none() {
                    match (plan.total_bytes, total) {
                        (Some(known), Some(total)) if known != total => {
                            return Err(HttpFailure::mismatch());
                        }
                        (None, total) => learned_total = total,
                        _ => {}
                    }
                }
            }
            Ok(ResponseVerdict {
                restart: false,
                learned_total,
            })
        }
        (None, 200) => {
            if matches!((plan.total_bytes, content_length), (Some(known), Some(actual)) if known != actual)
            {
                return Err(HttpFailure::mismatch());
            }
            Ok(ResponseVerdict {
                restart: false,
                learned_total: if plan.total_bytes.is_none() {
                    content_length
                } else {
                    None
                },
            })
        }
        _ => Err(HttpFailure {
            error: RequestError::HttpUnexpectedStatusCode { status },
            clear_loaded_bytes: false,
        }),
    }
}

/// Parses `bytes a-b/total`; a `*` total yields `None`.
pub fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    let captures = CONTENT_RANGE_PATTERN.as_ref()?.captures(header.trim())?;
    let start = captures.get(1)?.as_str().parse().ok()?;
    let end = captures.get(2)?.as_str().parse().ok()?;
    let total = captures.get(3)?.as_str().parse().ok();
    Some((start, end, total))
}

/// `HttpTransport` over a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpTransport {
    client: reqwest::Client,
}

impl ReqwestHttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestHttpTransport {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.get(request.url.clone());
        if let Some(range) = request.range_header() {
            builder = builder.header(RANGE, range);
        }

        let response = builder.send().await.map_err(|e| TransportError::Http {
            reason: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| TransportError::Http {
                    reason: e.to_string(),
                })
            })
            .boxed();

        Ok(HttpResponse {
            status,
            content_length,
            content_range,
            body,
        })
    }
}
