use std::collections::HashMap;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::AzureError;

/// Well-known Azurite development storage account.
const DEV_STORE_ACCOUNT: &str = "devstoreaccount1";
/// Well-known Azurite development storage key (public, documented by Azurite).
const DEV_STORE_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// How storage requests are authenticated.
#[derive(Clone)]
pub enum StorageAuth {
    /// Shared Key authentication with the decoded storage account key.
    SharedKey {
        /// Raw (base64-decoded) account key bytes.
        key: Vec<u8>,
    },
    /// SAS token authentication, appended to every request URL.
    SasToken {
        /// The token query string, without a leading `?`.
        token: String,
    },
}

impl std::fmt::Debug for StorageAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedKey { .. } => f.write_str("SharedKey([REDACTED])"),
            Self::SasToken { .. } => f.write_str("SasToken([REDACTED])"),
        }
    }
}

/// Parsed Azure Storage account credentials and endpoints.
///
/// Built from a standard storage connection string. The blob and queue
/// endpoints default to `https://{account}.blob.core.windows.net` and
/// `https://{account}.queue.core.windows.net` but can be overridden for
/// local development (e.g. Azurite) via `BlobEndpoint=` / `QueueEndpoint=`
/// pairs or the builder methods.
#[derive(Clone)]
pub struct StorageCredentials {
    /// Storage account name.
    pub account: String,
    pub(crate) auth: StorageAuth,
    /// Base URL of the Blob service, without a trailing slash.
    pub blob_endpoint: String,
    /// Base URL of the Queue service, without a trailing slash.
    pub queue_endpoint: String,
}

impl std::fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("account", &self.account)
            .field("auth", &self.auth)
            .field("blob_endpoint", &self.blob_endpoint)
            .field("queue_endpoint", &self.queue_endpoint)
            .finish()
    }
}

impl StorageCredentials {
    /// Parse an Azure Storage connection string.
    ///
    /// Recognizes `AccountName`, `AccountKey`, `SharedAccessSignature`,
    /// `DefaultEndpointsProtocol`, `EndpointSuffix`, `BlobEndpoint`,
    /// `QueueEndpoint`, and `UseDevelopmentStorage=true` (the Azurite
    /// well-known account).
    ///
    /// # Errors
    ///
    /// Returns [`AzureError::Configuration`] when the account name is missing,
    /// the account key is not valid base64, or neither an account key nor a
    /// SAS token is present.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, AzureError> {
        let pairs: HashMap<&str, &str> = connection_string
            .split(';')
            .filter(|part| !part.is_empty())
            .filter_map(|part| part.split_once('='))
            .map(|(k, v)| (k.trim(), v))
            .collect();

        if pairs
            .get("UseDevelopmentStorage")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            return Ok(Self {
                account: DEV_STORE_ACCOUNT.to_owned(),
                auth: StorageAuth::SharedKey {
                    key: base64::engine::general_purpose::STANDARD
                        .decode(DEV_STORE_KEY)
                        .map_err(|e| AzureError::Configuration(e.to_string()))?,
                },
                blob_endpoint: format!("http://127.0.0.1:10000/{DEV_STORE_ACCOUNT}"),
                queue_endpoint: format!("http://127.0.0.1:10001/{DEV_STORE_ACCOUNT}"),
            });
        }

        let account = pairs.get("AccountName").ok_or_else(|| {
            AzureError::Configuration("connection string is missing AccountName".to_owned())
        })?;

        let auth = if let Some(key) = pairs.get("AccountKey") {
            let key = base64::engine::general_purpose::STANDARD
                .decode(key)
                .map_err(|e| {
                    AzureError::Configuration(format!("AccountKey is not valid base64: {e}"))
                })?;
            StorageAuth::SharedKey { key }
        } else if let Some(sas) = pairs.get("SharedAccessSignature") {
            StorageAuth::SasToken {
                token: sas.trim_start_matches('?').to_owned(),
            }
        } else {
            return Err(AzureError::Configuration(
                "connection string has neither AccountKey nor SharedAccessSignature".to_owned(),
            ));
        };

        let protocol = pairs
            .get("DefaultEndpointsProtocol")
            .copied()
            .unwrap_or("https");
        let suffix = pairs
            .get("EndpointSuffix")
            .copied()
            .unwrap_or("core.windows.net");

        let blob_endpoint = pairs.get("BlobEndpoint").map_or_else(
            || format!("{protocol}://{account}.blob.{suffix}"),
            |e| e.trim_end_matches('/').to_owned(),
        );
        let queue_endpoint = pairs.get("QueueEndpoint").map_or_else(
            || format!("{protocol}://{account}.queue.{suffix}"),
            |e| e.trim_end_matches('/').to_owned(),
        );

        Ok(Self {
            account: (*account).to_owned(),
            auth,
            blob_endpoint,
            queue_endpoint,
        })
    }

    /// Override the Blob service endpoint (for Azurite or private endpoints).
    #[must_use]
    pub fn with_blob_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.blob_endpoint = endpoint.into().trim_end_matches('/').to_owned();
        self
    }

    /// Override the Queue service endpoint.
    #[must_use]
    pub fn with_queue_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.queue_endpoint = endpoint.into().trim_end_matches('/').to_owned();
        self
    }
}

/// Configuration for the Event Grid publishing service.
#[derive(Clone, Serialize, Deserialize)]
pub struct EventGridConfig {
    /// Topic endpoint URL, e.g. `https://mytopic.westeurope-1.eventgrid.azure.net/api/events`.
    pub topic_endpoint: String,

    /// Topic access key, sent as the `aeg-sas-key` header. Redacted in `Debug`.
    pub access_key: String,

    /// CloudEvent `source` attribute applied to every published event.
    pub source: String,
}

impl std::fmt::Debug for EventGridConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventGridConfig")
            .field("topic_endpoint", &self.topic_endpoint)
            .field("access_key", &"[REDACTED]")
            .field("source", &self.source)
            .finish()
    }
}

impl EventGridConfig {
    /// Create a new `EventGridConfig`.
    pub fn new(
        topic_endpoint: impl Into<String>,
        access_key: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            topic_endpoint: topic_endpoint.into(),
            access_key: access_key.into(),
            source: source.into(),
        }
    }
}
