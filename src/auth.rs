//! Shared Key request signing for the Blob and Queue REST APIs.
//!
//! Implements the `SharedKey {account}:{signature}` authorization scheme:
//! an HMAC-SHA256 over a canonical string-to-sign built from the request
//! verb, standard headers, sorted `x-ms-*` headers, and the canonicalized
//! resource (`/{account}/{path}` plus sorted query parameters).

use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AzureError;

type HmacSha256 = Hmac<Sha256>;

/// Azure REST API version sent with every storage request.
pub(crate) const API_VERSION: &str = "2023-11-03";

/// Current UTC time in the RFC 1123 format expected by `x-ms-date`.
pub(crate) fn rfc1123_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Append a SAS token query string to a URL.
pub(crate) fn append_sas(url: &str, token: &str) -> String {
    let token = token.trim_start_matches('?');
    if url.contains('?') {
        format!("{url}&{token}")
    } else {
        format!("{url}?{token}")
    }
}

/// Compute the `Authorization` header for a storage request.
///
/// `resource_path` is the un-encoded path after the account (for example
/// `"invoices/2026/report.pdf"` for a blob or `"emails/messages"` for a
/// queue). `ms_headers` must already contain `x-ms-date` and `x-ms-version`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn shared_key_authorization(
    account: &str,
    key: &[u8],
    method: &str,
    resource_path: &str,
    query: &[(&'static str, String)],
    content_length: Option<usize>,
    content_type: &str,
    if_none_match: &str,
    ms_headers: &[(String, String)],
) -> Result<String, AzureError> {
    // Content-Length: empty for zero-length and body-less requests
    // (API versions 2015-02-21 and later).
    let content_length = match content_length {
        Some(0) | None => String::new(),
        Some(len) => len.to_string(),
    };

    let mut headers: Vec<(String, String)> = ms_headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect();
    headers.sort_by(|a, b| a.0.cmp(&b.0));
    let canonicalized_headers = headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut canonicalized_resource = format!("/{account}/{resource_path}");
    if !query.is_empty() {
        let mut sorted = query.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (k, v) in &sorted {
            canonicalized_resource.push_str(&format!("\n{}:{v}", k.to_lowercase()));
        }
    }

    // VERB, Content-Encoding, Content-Language, Content-Length, Content-MD5,
    // Content-Type, Date, If-Modified-Since, If-Match, If-None-Match,
    // If-Unmodified-Since, Range, canonicalized headers, canonicalized
    // resource. Date stays empty because x-ms-date takes precedence.
    let string_to_sign = format!(
        "{method}\n\n\n{content_length}\n\n{content_type}\n\n\n\n{if_none_match}\n\n\n{canonicalized_headers}\n{canonicalized_resource}"
    );

    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AzureError::Configuration(format!("invalid account key: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!("SharedKey {account}:{signature}"))
}
