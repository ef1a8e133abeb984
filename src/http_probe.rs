//! External HEAD probe contract (spec §6): HEAD request with a 1-byte
//! range-GET fallback when the response is ambiguous.
//!
//! Grounded on the teacher crate's `download::manager::{try_head,
//! try_range_probe, filename_from_headers, parse_content_range}`, extended
//! to surface `retry_after_seconds` (parsed the way the
//! `AharonR-downloader` pack example uses `httpdate` for the same header).

use reqwest::{header, Client, StatusCode, Url};

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub status_code: u16,
    pub total_bytes: Option<u64>,
    pub content_type: String,
    pub accepts_ranges: bool,
    pub suggested_filename: Option<String>,
    pub retry_after_seconds: Option<u64>,
}

pub async fn probe(client: &Client, url: &Url) -> Result<ProbeResult, CoreError> {
    let response = client.head(url.clone()).send().await?;
    let status = response.status();

    if status.is_success() {
        let total = parse_content_length(response.headers().get(header::CONTENT_LENGTH));
        let accepts_ranges = parse_accept_ranges(response.headers().get(header::ACCEPT_RANGES));
        let content_type = parse_content_type(response.headers().get(header::CONTENT_TYPE));
        let filename = filename_from_headers(&response);

        if total.is_some() {
            return Ok(ProbeResult {
                status_code: status.as_u16(),
                total_bytes: total,
                content_type,
                accepts_ranges,
                suggested_filename: filename,
                retry_after_seconds: None,
            });
        }

        if accepts_ranges {
            let mut result = range_probe(client, url).await?;
            if result.suggested_filename.is_none() {
                result.suggested_filename = filename;
            }
            return Ok(result);
        }

        return Ok(ProbeResult {
            status_code: status.as_u16(),
            total_bytes: None,
            content_type,
            accepts_ranges,
            suggested_filename: filename,
            retry_after_seconds: None,
        });
    }

    if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
        return range_probe(client, url).await;
    }

    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status.as_u16() == 429 {
        return Err(CoreError::Transient(format!(
            "HEAD {url} returned {status}"
        )));
    }
    Err(CoreError::PermanentServer(format!(
        "HEAD {url} returned {status}"
    )))
}

/// 1-byte range GET fallback, used when HEAD is ambiguous or rejected.
async fn range_probe(client: &Client, url: &Url) -> Result<ProbeResult, CoreError> {
    let response = client
        .get(url.clone())
        .header(header::RANGE, "bytes=0-0")
        .send()
        .await?;
    let status = response.status();

    if status == StatusCode::PARTIAL_CONTENT {
        let total = parse_content_range(response.headers().get(header::CONTENT_RANGE))
            .ok_or_else(|| CoreError::PermanentServer("missing Content-Range header".into()))?;
        let content_type = parse_content_type(response.headers().get(header::CONTENT_TYPE));
        let filename = filename_from_headers(&response);
        Ok(ProbeResult {
            status_code: status.as_u16(),
            total_bytes: Some(total),
            content_type,
            accepts_ranges: true,
            suggested_filename: filename,
            retry_after_seconds: None,
        })
    } else if status.is_success() {
        let content_type = parse_content_type(response.headers().get(header::CONTENT_TYPE));
        let filename = filename_from_headers(&response);
        let total = response.content_length();
        Ok(ProbeResult {
            status_code: status.as_u16(),
            total_bytes: total,
            content_type,
            accepts_ranges: false,
            suggested_filename: filename,
            retry_after_seconds: None,
        })
    } else if status.is_server_error() || status.as_u16() == 429 {
        Err(CoreError::Transient(format!(
            "range probe for {url} returned {status}"
        )))
    } else {
        Err(CoreError::PermanentServer(format!(
            "range probe for {url} returned {status}"
        )))
    }
}

fn parse_content_length(value: Option<&header::HeaderValue>) -> Option<u64> {
    value.and_then(|v| v.to_str().ok()).and_then(|s| s.parse().ok())
}

fn parse_accept_ranges(value: Option<&header::HeaderValue>) -> bool {
    value
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("bytes"))
        .unwrap_or(false)
}

fn parse_content_type(value: Option<&header::HeaderValue>) -> String {
    value
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string()
}

fn parse_content_range(value: Option<&header::HeaderValue>) -> Option<u64> {
    let raw = value?.to_str().ok()?;
    let parts: Vec<&str> = raw.split('/').collect();
    if parts.len() != 2 {
        return None;
    }
    parts[1].parse().ok()
}

fn filename_from_headers(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_disposition)
}

fn parse_content_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename=") {
            let trimmed = rest.trim_matches('"');
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Parses a `Retry-After` header as either a plain integer seconds count or
/// an HTTP-date, per RFC 7231 §7.1.3.
pub fn parse_retry_after(value: Option<&header::HeaderValue>) -> Option<u64> {
    let raw = value?.to_str().ok()?;
    if let Ok(secs) = raw.trim().parse::<u64>() {
        return Some(secs);
    }
    let when = httpdate::parse_http_date(raw.trim()).ok()?;
    let now = std::time::SystemTime::now();
    when.duration_since(now).ok().map(|d| d.as_secs())
}
