//! Event Grid publishing.
//!
//! Events are wrapped as CloudEvents and split into payload-size-limited
//! batches. Each batch is posted to the topic endpoint with retries; when
//! retries run out the failure is logged at error level and propagated.

use reqwest::Client;
use tracing::{debug, error, info, instrument};

use crate::config::EventGridConfig;
use crate::error::AzureError;
use crate::events::{CloudEvent, Event};
use crate::retry::{self, RetryPolicy};

/// Maximum serialized `data` bytes per batch. Event Grid documents a
/// 1 536 000-byte request cap, but requests well under it were observed to
/// be rejected, so batches are kept much smaller.
const BATCH_SIZE_LIMIT: usize = 500_000;

const BATCH_CONTENT_TYPE: &str = "application/cloudevents-batch+json; charset=utf-8";

/// Publishes CloudEvents to an Event Grid topic.
pub struct EventGridService {
    client: Client,
    config: EventGridConfig,
    policy: RetryPolicy,
}

impl std::fmt::Debug for EventGridService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventGridService")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl EventGridService {
    /// Create a service for the configured topic.
    pub fn new(config: EventGridConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            policy: RetryPolicy::event_grid_default(),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Publish `events` to the topic, batching by payload size.
    ///
    /// An empty slice is a no-op. Batches are sent sequentially in event
    /// order; each batch is retried independently.
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub async fn publish<E: Event>(&self, events: &[E]) -> Result<(), AzureError> {
        if events.is_empty() {
            return Ok(());
        }

        let cloud_events = events
            .iter()
            .map(|event| {
                Ok(CloudEvent::new(
                    self.config.source.clone(),
                    event.event_type(),
                    serde_json::to_value(event)?,
                ))
            })
            .collect::<Result<Vec<_>, AzureError>>()?;

        let batches = split_into_batches(&cloud_events)?;
        let batch_count = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            debug!(batch = index + 1, batch_count, events = batch.len(), "sending batch");
            if let Err(err) = self.send_batch(batch).await {
                error!(
                    batch = index + 1,
                    error = %err,
                    "failed to publish events to Event Grid after multiple retries"
                );
                return Err(err);
            }
        }

        info!(events = cloud_events.len(), batches = batch_count, "events published");
        Ok(())
    }

    async fn send_batch(&self, batch: Vec<&CloudEvent>) -> Result<(), AzureError> {
        let body = serde_json::to_vec(&batch)?;
        retry::with_retry(&self.policy, "event grid publish", || {
            let body = body.clone();
            async move {
                let response = self
                    .client
                    .post(&self.config.topic_endpoint)
                    .header("aeg-sas-key", &self.config.access_key)
                    .header(reqwest::header::CONTENT_TYPE, BATCH_CONTENT_TYPE)
                    .body(body)
                    .send()
                    .await?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(AzureError::from_response(response).await)
                }
            }
        })
        .await
    }
}

/// Split events into batches whose summed serialized `data` size stays under
/// [`BATCH_SIZE_LIMIT`]. An event that would overflow the running batch
/// flushes it first; a single oversized event still forms its own batch.
fn split_into_batches(events: &[CloudEvent]) -> Result<Vec<Vec<&CloudEvent>>, AzureError> {
    let mut batches = Vec::new();
    let mut current: Vec<&CloudEvent> = Vec::new();
    let mut current_size = 0;

    for event in events {
        let event_size = serde_json::to_vec(&event.data)?.len();
        if !current.is_empty() && current_size + event_size > BATCH_SIZE_LIMIT {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push(event);
        current_size += event_size;
    }
    if !current.is_empty() {
        batches.push(current);
    }

    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_with_data_bytes(len: usize) -> CloudEvent {
        // A JSON string of n chars serializes to n + 2 bytes (quotes).
        CloudEvent::new("/test", "test.event", json!("x".repeat(len - 2)))
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(split_into_batches(&[]).unwrap().is_empty());
    }

    #[test]
    fn small_events_share_one_batch() {
        let events = vec![event_with_data_bytes(100), event_with_data_bytes(100)];
        let batches = split_into_batches(&events).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn overflow_flushes_running_batch() {
        let events = vec![
            event_with_data_bytes(300_000),
            event_with_data_bytes(300_000),
            event_with_data_bytes(100),
        ];
        let batches = split_into_batches(&events).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[1].len(), 2);
    }

    #[test]
    fn oversized_event_ships_alone() {
        let events = vec![
            event_with_data_bytes(100),
            event_with_data_bytes(600_000),
            event_with_data_bytes(100),
        ];
        let batches = split_into_batches(&events).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1][0].data, events[1].data);
    }

    #[test]
    fn exact_limit_stays_in_batch() {
        let events = vec![
            event_with_data_bytes(BATCH_SIZE_LIMIT - 100),
            event_with_data_bytes(100),
        ];
        let batches = split_into_batches(&events).unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn order_is_preserved_across_batches() {
        let events: Vec<CloudEvent> = (0..5).map(|_| event_with_data_bytes(200_000)).collect();
        let batches = split_into_batches(&events).unwrap();
        let flattened: Vec<&str> = batches
            .iter()
            .flatten()
            .map(|event| event.id.as_str())
            .collect();
        let expected: Vec<&str> = events.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(flattened, expected);
    }
}
