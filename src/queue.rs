//! Queue Storage publishing.
//!
//! Messages are CloudEvents serialized to JSON, Base64-encoded, and posted
//! inside the Queue service XML envelope. A missing queue is created on the
//! first 404 and the message is sent again, and transient failures are
//! retried with exponential backoff.

use std::future::Future;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, info, instrument};

use crate::config::StorageCredentials;
use crate::error::AzureError;
use crate::events::{CloudEvent, Event};
use crate::retry::{self, RetryPolicy};
use crate::transport::{self, StorageRequest};

/// Options for sending a queue message.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// How long the message stays invisible after enqueue.
    pub visibility_timeout: Option<Duration>,

    /// Message time-to-live. `None` means the message never expires.
    pub time_to_live: Option<Duration>,
}

impl SendOptions {
    /// Delay the message's first delivery.
    #[must_use]
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    /// Expire the message after the given duration.
    #[must_use]
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// Sends CloudEvents to Azure Storage queues.
pub struct QueueService {
    client: Client,
    credentials: StorageCredentials,
    source: String,
    policy: RetryPolicy,
}

impl std::fmt::Debug for QueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService")
            .field("source", &self.source)
            .field("credentials", &self.credentials)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl QueueService {
    /// Create a service publishing events attributed to `source`.
    pub fn new(credentials: StorageCredentials, source: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            credentials,
            source: source.into(),
            policy: RetryPolicy::queue_default(),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Send one CloudEvent to `queue`.
    ///
    /// The event is stamped with the current time when it has none. When the
    /// queue does not exist it is created and the message is sent again.
    #[instrument(skip(self, event, options), fields(event_type = %event.event_type))]
    pub async fn send(
        &self,
        queue: &str,
        event: &CloudEvent,
        options: &SendOptions,
    ) -> Result<(), AzureError> {
        let mut event = event.clone();
        event.ensure_time();
        let body = message_envelope(&serde_json::to_string(&event)?);

        retry::with_retry(&self.policy, "queue send", || {
            put_or_create(
                || self.put_message(queue, body.clone(), options),
                || self.create_queue(queue),
            )
        })
        .await?;

        info!(queue, event_id = %event.id, "queue message sent");
        Ok(())
    }

    /// Send several CloudEvents to `queue`, in order.
    pub async fn send_all(
        &self,
        queue: &str,
        events: &[CloudEvent],
        options: &SendOptions,
    ) -> Result<(), AzureError> {
        for event in events {
            self.send(queue, event, options).await?;
        }
        Ok(())
    }

    /// Wrap `data` in a CloudEvent and send it to `queue`.
    pub async fn send_data<E: Event>(
        &self,
        queue: &str,
        data: &E,
        options: &SendOptions,
    ) -> Result<(), AzureError> {
        let event = CloudEvent::new(
            self.source.clone(),
            data.event_type(),
            serde_json::to_value(data)?,
        );
        self.send(queue, &event, options).await
    }

    async fn put_message(
        &self,
        queue: &str,
        body: String,
        options: &SendOptions,
    ) -> Result<(), AzureError> {
        let url = format!("{}/{queue}/messages", self.credentials.queue_endpoint);
        let mut request = StorageRequest::new(Method::POST, url, format!("{queue}/messages"))
            .query("messagettl", ttl_seconds(options.time_to_live))
            .content_type("application/xml")
            .body(body);
        if let Some(timeout) = options.visibility_timeout {
            request = request.query("visibilitytimeout", timeout.as_secs().to_string());
        }

        let response = transport::send(&self.client, &self.credentials, request).await?;
        if response.status().is_success() {
            debug!(queue, "message enqueued");
            Ok(())
        } else {
            Err(AzureError::from_response(response).await)
        }
    }

    async fn create_queue(&self, queue: &str) -> Result<(), AzureError> {
        let url = format!("{}/{queue}", self.credentials.queue_endpoint);
        let request = StorageRequest::new(Method::PUT, url, queue);

        let response = transport::send(&self.client, &self.credentials, request).await?;
        match response.status() {
            status if status.is_success() => {
                info!(queue, "queue created");
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            _ => Err(AzureError::from_response(response).await),
        }
    }
}

/// Put a message, creating the queue and putting the message again when the
/// first attempt hits a 404. The whole recovery counts as one attempt in
/// the surrounding retry cycle; any other error passes through untouched.
async fn put_or_create<P, PFut, C, CFut>(
    mut put_message: P,
    create_queue: C,
) -> Result<(), AzureError>
where
    P: FnMut() -> PFut,
    PFut: Future<Output = Result<(), AzureError>>,
    C: FnOnce() -> CFut,
    CFut: Future<Output = Result<(), AzureError>>,
{
    match put_message().await {
        Err(AzureError::Http { status: 404, .. }) => {
            create_queue().await?;
            put_message().await
        }
        result => result,
    }
}

/// Queue message envelope: Base64-encoded text inside the service's XML
/// wrapper. Base64 output never needs XML escaping.
fn message_envelope(json: &str) -> String {
    format!(
        "<QueueMessage><MessageText>{}</MessageText></QueueMessage>",
        BASE64.encode(json)
    )
}

/// `messagettl` value: seconds, or `-1` for a message that never expires.
fn ttl_seconds(ttl: Option<Duration>) -> String {
    match ttl {
        Some(ttl) => ttl.as_secs().to_string(),
        None => "-1".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn missing_queue() -> AzureError {
        AzureError::Http {
            status: 404,
            message: "QueueNotFound".into(),
        }
    }

    #[tokio::test]
    async fn missing_queue_is_created_and_message_resent() {
        let puts = AtomicU32::new(0);
        let creates = AtomicU32::new(0);
        let result = put_or_create(
            || {
                let n = puts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 { Err(missing_queue()) } else { Ok(()) }
                }
            },
            || {
                creates.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(puts.load(Ordering::SeqCst), 2);
        assert_eq!(creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_errors_do_not_create_the_queue() {
        let creates = AtomicU32::new(0);
        let result = put_or_create(
            || async {
                Err(AzureError::Http {
                    status: 403,
                    message: "forbidden".into(),
                })
            },
            || {
                creates.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await;
        assert_eq!(result.unwrap_err().status(), Some(403));
        assert_eq!(creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn queue_recovery_fits_in_one_retry_attempt() {
        // Zero retries: creation plus resend must succeed within the first
        // attempt, not burn a retry on the 404.
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        let puts = AtomicU32::new(0);
        let result = retry::with_retry(&policy, "test", || {
            put_or_create(
                || {
                    let n = puts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 { Err(missing_queue()) } else { Ok(()) }
                    }
                },
                || async { Ok(()) },
            )
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(puts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn envelope_wraps_base64_payload() {
        let envelope = message_envelope(r#"{"id":"1"}"#);
        assert_eq!(
            envelope,
            "<QueueMessage><MessageText>eyJpZCI6IjEifQ==</MessageText></QueueMessage>"
        );
    }

    #[test]
    fn envelope_round_trips_through_base64() {
        let json = r#"{"specversion":"1.0","type":"invoice.created"}"#;
        let envelope = message_envelope(json);
        let encoded = envelope
            .strip_prefix("<QueueMessage><MessageText>")
            .and_then(|rest| rest.strip_suffix("</MessageText></QueueMessage>"))
            .unwrap();
        assert_eq!(BASE64.decode(encoded).unwrap(), json.as_bytes());
    }

    #[test]
    fn ttl_defaults_to_never_expire() {
        assert_eq!(ttl_seconds(None), "-1");
    }

    #[test]
    fn ttl_formats_whole_seconds() {
        assert_eq!(ttl_seconds(Some(Duration::from_secs(7200))), "7200");
    }

    #[test]
    fn send_options_builders() {
        let options = SendOptions::default()
            .with_visibility_timeout(Duration::from_secs(30))
            .with_time_to_live(Duration::from_secs(60));
        assert_eq!(options.visibility_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.time_to_live, Some(Duration::from_secs(60)));
    }
}
