//! Per-container Blob Storage operations.
//!
//! [`BlobService`] wraps one container: upload (with duplicate-avoiding
//! rename on conflict), download, delete, prefix listing, server-side
//! rename, and metadata reads. [`BlobServiceFactory`] caches one service
//! per container name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, info, instrument};

use crate::config::StorageCredentials;
use crate::error::AzureError;
use crate::transport::{self, StorageRequest};

/// Percent-encoding set for blob paths: everything except unreserved
/// characters and `/` (Azure expects `/` unencoded in blob paths).
const BLOB_PATH_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Options for [`BlobService::upload`].
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// When `false`, an existing blob is never replaced; the key is suffixed
    /// with `(1)`, `(2)`, … until a free name is found.
    pub overwrite: bool,

    /// `Content-Type` stored with the blob. Defaults to
    /// `application/octet-stream`.
    pub content_type: Option<String>,

    /// When set, a follow-up properties call marks the blob as a download
    /// attachment with this filename.
    pub friendly_name: Option<String>,

    /// Metadata key-value pairs attached to the blob.
    pub metadata: HashMap<String, String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            overwrite: true,
            content_type: None,
            friendly_name: None,
            metadata: HashMap::new(),
        }
    }
}

impl UploadOptions {
    /// Set whether an existing blob may be replaced.
    #[must_use]
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Set the stored `Content-Type`.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the attachment filename for downloads.
    #[must_use]
    pub fn with_friendly_name(mut self, friendly_name: impl Into<String>) -> Self {
        self.friendly_name = Some(friendly_name.into());
        self
    }

    /// Attach a metadata key-value pair.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Blob operations scoped to a single container.
pub struct BlobService {
    client: Client,
    credentials: StorageCredentials,
    container: String,
}

impl std::fmt::Debug for BlobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobService")
            .field("container", &self.container)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl BlobService {
    /// Create a service for `container`, creating the container with
    /// blob-level public read access when it does not exist yet.
    pub async fn new(
        credentials: StorageCredentials,
        container: impl Into<String>,
    ) -> Result<Self, AzureError> {
        let service = Self {
            client: Client::new(),
            credentials,
            container: container.into(),
        };
        service.ensure_container().await?;
        Ok(service)
    }

    /// The container this service operates on.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Full (encoded) URL of a blob in this container.
    pub fn blob_url(&self, blob_name: &str) -> String {
        let encoded =
            percent_encoding::utf8_percent_encode(blob_name, &BLOB_PATH_ENCODE_SET).to_string();
        format!(
            "{}/{}/{encoded}",
            self.credentials.blob_endpoint, self.container
        )
    }

    fn container_url(&self) -> String {
        format!("{}/{}", self.credentials.blob_endpoint, self.container)
    }

    fn resource_path(&self, blob_name: &str) -> String {
        format!("{}/{blob_name}", self.container)
    }

    /// Create the container if it does not exist, requesting blob-level
    /// public read access on creation. A container that already exists
    /// (409) keeps whatever access policy it has.
    async fn ensure_container(&self) -> Result<(), AzureError> {
        let request = StorageRequest::new(Method::PUT, self.container_url(), &self.container)
            .query("restype", "container")
            .ms_header("x-ms-blob-public-access", "blob");

        let response = transport::send(&self.client, &self.credentials, request).await?;
        match response.status() {
            status if status.is_success() => {
                info!(container = %self.container, "container created");
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            _ => Err(AzureError::from_response(response).await),
        }
    }

    /// Upload a blob, returning its URL.
    ///
    /// With `overwrite` disabled the upload sends `If-None-Match: *`; on a
    /// 409 conflict the key is rewritten to `name(1).ext`, `name(2).ext`, …
    /// until a free name is found.
    #[instrument(skip(self, data, options), fields(container = %self.container))]
    pub async fn upload(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        options: &UploadOptions,
    ) -> Result<String, AzureError> {
        let key = decode_key(key);
        let data: Bytes = data.into();
        let content_type = options
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");

        let stored = upload_until_free(&key, options.overwrite, |candidate| {
            let data = data.clone();
            async move { self.put_blob(&candidate, data, content_type, options).await }
        })
        .await?;

        if let Some(friendly_name) = &options.friendly_name {
            self.set_attachment_disposition(&stored, friendly_name).await?;
        }
        info!(blob = %stored, "blob uploaded");
        Ok(self.blob_url(&stored))
    }

    /// One Put Blob attempt for a candidate name.
    async fn put_blob(
        &self,
        blob_name: &str,
        data: Bytes,
        content_type: &str,
        options: &UploadOptions,
    ) -> Result<UploadOutcome, AzureError> {
        debug!(blob = %blob_name, size = data.len(), "uploading blob");

        let mut request = StorageRequest::new(
            Method::PUT,
            self.blob_url(blob_name),
            self.resource_path(blob_name),
        )
        .ms_header("x-ms-blob-type", "BlockBlob")
        .content_type(content_type)
        .body(data);
        for (name, value) in &options.metadata {
            request = request.ms_header(format!("x-ms-meta-{name}"), value);
        }
        if !options.overwrite {
            request = request.if_none_match("*");
        }

        let response = transport::send(&self.client, &self.credentials, request).await?;
        match response.status() {
            status if status.is_success() => Ok(UploadOutcome::Created),
            StatusCode::CONFLICT if !options.overwrite => {
                debug!(blob = %blob_name, "blob exists, trying next name");
                Ok(UploadOutcome::Conflict)
            }
            _ => Err(AzureError::from_response(response).await),
        }
    }

    /// Mark a blob as a download attachment with the given filename.
    async fn set_attachment_disposition(
        &self,
        blob_name: &str,
        friendly_name: &str,
    ) -> Result<(), AzureError> {
        let request = StorageRequest::new(
            Method::PUT,
            self.blob_url(blob_name),
            self.resource_path(blob_name),
        )
        .query("comp", "properties")
        .ms_header(
            "x-ms-blob-content-disposition",
            format!("attachment; filename={friendly_name}"),
        )
        .ms_header("x-ms-blob-content-type", "application/octet-stream");

        let response = transport::send(&self.client, &self.credentials, request).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AzureError::from_response(response).await)
        }
    }

    /// Download a blob's content.
    #[instrument(skip(self), fields(container = %self.container))]
    pub async fn download(&self, key: &str) -> Result<Bytes, AzureError> {
        let key = decode_key(key);
        let request = StorageRequest::new(Method::GET, self.blob_url(&key), self.resource_path(&key));

        let response = transport::send(&self.client, &self.credentials, request).await?;
        match response.status() {
            status if status.is_success() => {
                let body = response.bytes().await?;
                debug!(blob = %key, size = body.len(), "blob downloaded");
                Ok(body)
            }
            StatusCode::NOT_FOUND => Err(AzureError::NotFound(key)),
            _ => Err(AzureError::from_response(response).await),
        }
    }

    /// Delete a blob. Missing blobs are treated as already deleted.
    #[instrument(skip(self), fields(container = %self.container))]
    pub async fn delete(&self, key: &str) -> Result<(), AzureError> {
        let key = decode_key(key);
        let request =
            StorageRequest::new(Method::DELETE, self.blob_url(&key), self.resource_path(&key));

        let response = transport::send(&self.client, &self.credentials, request).await?;
        match response.status() {
            status if status.is_success() => {
                info!(blob = %key, "blob deleted");
                Ok(())
            }
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(AzureError::from_response(response).await),
        }
    }

    /// Whether a blob exists.
    pub async fn exists(&self, key: &str) -> Result<bool, AzureError> {
        self.head(&decode_key(key)).await
    }

    /// HEAD probe over an already-decoded blob name.
    async fn head(&self, blob_name: &str) -> Result<bool, AzureError> {
        let request = StorageRequest::new(
            Method::HEAD,
            self.blob_url(blob_name),
            self.resource_path(blob_name),
        );

        let response = transport::send(&self.client, &self.credentials, request).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(AzureError::from_response(response).await),
        }
    }

    /// List the URLs of all blobs whose names start with `prefix`,
    /// following continuation markers.
    #[instrument(skip(self), fields(container = %self.container))]
    pub async fn find(&self, prefix: &str) -> Result<Vec<String>, AzureError> {
        let mut urls = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = StorageRequest::new(Method::GET, self.container_url(), &self.container)
                .query("restype", "container")
                .query("comp", "list")
                .query("prefix", prefix);
            if let Some(marker) = &marker {
                request = request.query("marker", marker.clone());
            }

            let response = transport::send(&self.client, &self.credentials, request).await?;
            if !response.status().is_success() {
                return Err(AzureError::from_response(response).await);
            }

            let body = response.text().await?;
            let page = parse_list_blobs(&body);
            urls.extend(page.names.iter().map(|name| self.blob_url(name)));

            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        debug!(prefix, count = urls.len(), "listed blobs");
        Ok(urls)
    }

    /// Server-side copy of `from` to `to`, returning the destination URL.
    ///
    /// Returns `Ok(None)` when the source blob does not exist.
    #[instrument(skip(self), fields(container = %self.container))]
    pub async fn rename(&self, from: &str, to: &str) -> Result<Option<String>, AzureError> {
        let from = decode_key(from);
        let to = decode_key(to);

        // `from` is decoded already; probe without decoding a second time.
        if !self.head(&from).await? {
            return Ok(None);
        }

        let request = StorageRequest::new(Method::PUT, self.blob_url(&to), self.resource_path(&to))
            .ms_header("x-ms-copy-source", self.blob_url(&from));

        let response = transport::send(&self.client, &self.credentials, request).await?;
        if response.status().is_success() {
            info!(from = %from, to = %to, "blob renamed");
            Ok(Some(self.blob_url(&to)))
        } else {
            Err(AzureError::from_response(response).await)
        }
    }

    /// Read a blob's metadata key-value pairs.
    pub async fn metadata(&self, key: &str) -> Result<HashMap<String, String>, AzureError> {
        let key = decode_key(key);
        let request =
            StorageRequest::new(Method::HEAD, self.blob_url(&key), self.resource_path(&key));

        let response = transport::send(&self.client, &self.credentials, request).await?;
        match response.status() {
            status if status.is_success() => {
                let metadata = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| {
                        let meta_key = name.as_str().strip_prefix("x-ms-meta-")?;
                        Some((meta_key.to_owned(), value.to_str().ok()?.to_owned()))
                    })
                    .collect();
                Ok(metadata)
            }
            StatusCode::NOT_FOUND => Err(AzureError::NotFound(key)),
            _ => Err(AzureError::from_response(response).await),
        }
    }
}

/// Caching factory of per-container [`BlobService`] instances.
///
/// Services are created on first use (which also creates the container) and
/// shared afterwards.
pub struct BlobServiceFactory {
    credentials: StorageCredentials,
    services: DashMap<String, Arc<BlobService>>,
}

impl std::fmt::Debug for BlobServiceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobServiceFactory")
            .field("credentials", &self.credentials)
            .field("containers", &self.services.len())
            .finish()
    }
}

impl BlobServiceFactory {
    /// Create a factory over the given storage account.
    pub fn new(credentials: StorageCredentials) -> Self {
        Self {
            credentials,
            services: DashMap::new(),
        }
    }

    /// Get the cached service for `container`, creating it (and the
    /// container itself) on first use.
    pub async fn get_or_create(&self, container: &str) -> Result<Arc<BlobService>, AzureError> {
        if let Some(service) = self.services.get(container) {
            return Ok(Arc::clone(&service));
        }
        let service = Arc::new(BlobService::new(self.credentials.clone(), container).await?);
        Ok(self
            .services
            .entry(container.to_owned())
            .or_insert(service)
            .clone())
    }
}

/// Result of a single Put Blob attempt.
enum UploadOutcome {
    Created,
    Conflict,
}

/// Drive upload attempts through conflict renames: iteration 0 tries the
/// key as-is, later iterations try `name(1).ext`, `name(2).ext`, … until an
/// attempt succeeds. With `overwrite` set the candidate never changes (a
/// conflict is then an error and surfaces from the attempt itself).
async fn upload_until_free<F, Fut>(
    key: &str,
    overwrite: bool,
    mut attempt: F,
) -> Result<String, AzureError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<UploadOutcome, AzureError>>,
{
    let mut iteration = 0;
    loop {
        let candidate = if overwrite {
            key.to_owned()
        } else {
            duplicate_aware_key(key, iteration)
        };
        match attempt(candidate.clone()).await? {
            UploadOutcome::Created => return Ok(candidate),
            UploadOutcome::Conflict => iteration += 1,
        }
    }
}

/// Percent-decode an incoming blob key once before use.
fn decode_key(key: &str) -> String {
    percent_encoding::percent_decode_str(key)
        .decode_utf8_lossy()
        .into_owned()
}

/// Rewrite `key` for the given conflict iteration: `dir/name(2).ext`.
/// Iteration 0 leaves the key untouched.
fn duplicate_aware_key(key: &str, iteration: u32) -> String {
    if iteration == 0 {
        return key.to_owned();
    }
    let (dir, file) = match key.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, key),
    };
    let renamed = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}({iteration}).{ext}"),
        _ => format!("{file}({iteration})"),
    };
    match dir {
        Some(dir) => format!("{dir}/{renamed}"),
        None => renamed,
    }
}

/// One page of a List Blobs response.
struct ListBlobsPage {
    names: Vec<String>,
    next_marker: Option<String>,
}

/// Extract blob names and the continuation marker from a List Blobs XML
/// body. Deliberately tag-level parsing; the response schema is flat and
/// stable.
fn parse_list_blobs(body: &str) -> ListBlobsPage {
    let next_marker = text_between(body, "<NextMarker>", "</NextMarker>")
        .filter(|marker| !marker.is_empty())
        .map(unescape_xml);

    let mut names = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find("<Blob>") {
        let Some(end) = rest[start..].find("</Blob>") else {
            break;
        };
        let blob_xml = &rest[start..start + end];
        if let Some(name) = text_between(blob_xml, "<Name>", "</Name>") {
            names.push(unescape_xml(name));
        }
        rest = &rest[start + end..];
    }

    ListBlobsPage { names, next_marker }
}

/// Undo the XML escaping applied to text nodes in list responses.
/// `&amp;` goes last so already-unescaped entities are not re-expanded.
fn unescape_xml(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn text_between<'a>(haystack: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = haystack.find(open)? + open.len();
    let end = haystack[start..].find(close)?;
    Some(&haystack[start..start + end])
}
