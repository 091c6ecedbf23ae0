//! Convenience clients for Azure Blob Storage, Queue Storage, and Event Grid.
//!
//! This crate provides feature-gated service clients:
//!
//! - **Blob Storage** (`blob` feature) — Per-container upload (with
//!   duplicate-avoiding rename on conflict), download, delete, listing,
//!   rename, and metadata, plus a caching [`BlobServiceFactory`]
//! - **Queue Storage** (`queue` feature) — CloudEvent messages posted as
//!   Base64 XML envelopes, with queue auto-creation and retries
//! - **Event Grid** (`eventgrid` feature) — Size-aware CloudEvent batching
//!   with per-batch retries
//!
//! The storage clients authenticate with Shared Key or SAS credentials
//! parsed from a standard connection string via [`StorageCredentials`].

pub mod config;
pub mod error;

#[cfg(any(feature = "queue", feature = "eventgrid"))]
pub mod events;

#[cfg(any(feature = "queue", feature = "eventgrid"))]
pub mod retry;

#[cfg(any(feature = "blob", feature = "queue"))]
mod auth;

#[cfg(any(feature = "blob", feature = "queue"))]
mod transport;

#[cfg(feature = "blob")]
pub mod blob;

#[cfg(feature = "queue")]
pub mod queue;

#[cfg(feature = "eventgrid")]
pub mod eventgrid;

// Re-exports for convenience.
pub use config::{EventGridConfig, StorageCredentials};
pub use error::AzureError;

#[cfg(any(feature = "queue", feature = "eventgrid"))]
pub use events::{CloudEvent, Event};

#[cfg(any(feature = "queue", feature = "eventgrid"))]
pub use retry::RetryPolicy;

#[cfg(feature = "blob")]
pub use blob::{BlobService, BlobServiceFactory, UploadOptions};

#[cfg(feature = "queue")]
pub use queue::{QueueService, SendOptions};

#[cfg(feature = "eventgrid")]
pub use eventgrid::EventGridService;
