//! Signed HTTP plumbing shared by the Blob and Queue services.

use bytes::Bytes;
use reqwest::{Client, Method, Response};

use crate::auth::{self, API_VERSION};
use crate::config::{StorageAuth, StorageCredentials};
use crate::error::AzureError;

/// A storage REST request awaiting signing and dispatch.
pub(crate) struct StorageRequest {
    method: Method,
    /// Full URL with the path percent-encoded, without query parameters.
    url: String,
    /// Un-encoded path after the account, for the canonicalized resource.
    resource_path: String,
    query: Vec<(&'static str, String)>,
    /// Extra `x-ms-*` headers, lowercase names.
    ms_headers: Vec<(String, String)>,
    content_type: Option<String>,
    if_none_match: Option<String>,
    body: Option<Bytes>,
}

impl StorageRequest {
    pub(crate) fn new(
        method: Method,
        url: impl Into<String>,
        resource_path: impl Into<String>,
    ) -> Self {
        Self {
            method,
            url: url.into(),
            resource_path: resource_path.into(),
            query: Vec::new(),
            ms_headers: Vec::new(),
            content_type: None,
            if_none_match: None,
            body: None,
        }
    }

    pub(crate) fn query(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    pub(crate) fn ms_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.ms_headers.push((name.into(), value.into()));
        self
    }

    pub(crate) fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub(crate) fn if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }

    pub(crate) fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Sign and dispatch a storage request, returning the raw response.
///
/// Shared Key credentials produce an `Authorization` header; SAS credentials
/// append the token to the URL instead.
pub(crate) async fn send(
    client: &Client,
    credentials: &StorageCredentials,
    request: StorageRequest,
) -> Result<Response, AzureError> {
    let date = auth::rfc1123_now();
    let mut ms_headers = vec![
        ("x-ms-date".to_owned(), date),
        ("x-ms-version".to_owned(), API_VERSION.to_owned()),
    ];
    ms_headers.extend(request.ms_headers.iter().cloned());

    let authorization = match &credentials.auth {
        StorageAuth::SharedKey { key } => Some(auth::shared_key_authorization(
            &credentials.account,
            key,
            request.method.as_str(),
            &request.resource_path,
            &request.query,
            request.body.as_ref().map(Bytes::len),
            request.content_type.as_deref().unwrap_or(""),
            request.if_none_match.as_deref().unwrap_or(""),
            &ms_headers,
        )?),
        StorageAuth::SasToken { .. } => None,
    };

    let url = match &credentials.auth {
        StorageAuth::SasToken { token } => auth::append_sas(&request.url, token),
        StorageAuth::SharedKey { .. } => request.url,
    };

    let mut builder = client.request(request.method, url);
    if !request.query.is_empty() {
        builder = builder.query(&request.query);
    }
    for (name, value) in &ms_headers {
        builder = builder.header(name, value);
    }
    if let Some(content_type) = &request.content_type {
        builder = builder.header("Content-Type", content_type);
    }
    if let Some(etag) = &request.if_none_match {
        builder = builder.header("If-None-Match", etag);
    }
    if let Some(authorization) = authorization {
        builder = builder.header("Authorization", authorization);
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    Ok(builder.send().await?)
}
