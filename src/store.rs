use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use url::Url;

use crate::errors::{AppError, WriteFailure};
use crate::event_stream::{EventStreamDecoder, StoreEvent};
use crate::models::{LeadLocation, LEADS_ROOT};

/// Stream of live events from the store.
pub type EventStream = BoxStream<'static, Result<StoreEvent, AppError>>;

/// Transport to the hosted lead store.
///
/// Implementations only move bytes; retries, timeouts and decoding of the lead
/// hierarchy live in the adapter.
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Reads the whole `phoneLeads` subtree once.
    async fn fetch_tree(&self) -> Result<Value, AppError>;

    /// Opens the live event feed for the `phoneLeads` subtree.
    async fn open_event_stream(&self) -> Result<EventStream, AppError>;

    /// Whether anything is stored at `location`.
    async fn exists(&self, location: &LeadLocation) -> Result<bool, AppError>;

    /// Merges `fields` into the node at `location`.
    async fn update_fields(&self, location: &LeadLocation, fields: Value) -> Result<(), AppError>;

    /// Removes the node at `location`.
    async fn remove(&self, location: &LeadLocation) -> Result<(), AppError>;

    /// Overwrites the whole `phoneLeads` subtree.
    async fn replace_tree(&self, tree: &Value) -> Result<(), AppError>;
}

/// Client for the Firebase Realtime Database REST API.
#[derive(Clone)]
pub struct RtdbStore {
    client: reqwest::Client,
    base_url: Url,
    auth: Option<String>,
    request_timeout: Duration,
}

impl RtdbStore {
    /// Creates a new `RtdbStore`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Database URL, e.g. `https://<project>-default-rtdb.firebaseio.com`.
    /// * `auth` - Optional database secret or ID token, sent as the `auth` query parameter.
    /// * `request_timeout` - Timeout for one-shot requests. The event stream has none.
    pub fn new(
        base_url: &str,
        auth: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, AppError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::BadRequest(format!("Invalid store URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::BadRequest(format!(
                "Store URL cannot be a base: {}",
                base_url
            )));
        }

        // No client-wide timeout: it would also cut the long-lived event stream.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                AppError::InternalError(format!("Failed to create store client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            auth,
            request_timeout,
        })
    }

    /// Builds `<base>/<segments...>.json`, percent-encoding each segment.
    pub fn url_for(&self, segments: &[&str]) -> Result<Url, AppError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                AppError::InternalError(format!("Store URL cannot be a base: {}", self.base_url))
            })?;
            path.pop_if_empty();
            if let Some((last, parents)) = segments.split_last() {
                path.extend(parents);
                path.push(&format!("{}.json", last));
            } else {
                path.push(".json");
            }
        }
        if let Some(ref token) = self.auth {
            url.query_pairs_mut().append_pair("auth", token);
        }
        Ok(url)
    }

    fn redacted(url: &Url) -> String {
        let mut shown = url.clone();
        shown.set_query(None);
        shown.to_string()
    }

    fn location_url(&self, location: &LeadLocation) -> Result<Url, AppError> {
        self.url_for(&location.segments())
    }

    async fn write_error(response: reqwest::Response) -> AppError {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        AppError::WriteFailed(WriteFailure::Rejected { status, body })
    }
}

#[async_trait]
impl LeadStore for RtdbStore {
    async fn fetch_tree(&self) -> Result<Value, AppError> {
        let url = self.url_for(&[LEADS_ROOT])?;
        tracing::info!("Fetching lead tree from {}", Self::redacted(&url));

        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| AppError::SubscriptionFailed(format!("Store request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::SubscriptionFailed(format!(
                "Store returned {}: {}",
                status, error_text
            )));
        }

        response.json().await.map_err(|e| {
            AppError::MalformedSnapshot(format!("Failed to parse store response: {}", e))
        })
    }

    async fn open_event_stream(&self) -> Result<EventStream, AppError> {
        let url = self.url_for(&[LEADS_ROOT])?;
        tracing::info!("Opening lead event stream at {}", Self::redacted(&url));

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| AppError::SubscriptionFailed(format!("Event stream request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::SubscriptionFailed(format!(
                "Event stream returned {}: {}",
                status, error_text
            )));
        }

        let bytes = response.bytes_stream().boxed();
        let events = stream::unfold(
            (bytes, EventStreamDecoder::default(), VecDeque::new()),
            |(mut bytes, mut decoder, mut pending)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((event, (bytes, decoder, pending)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            pending.extend(decoder.feed(&chunk).into_iter().map(StoreEvent::try_from));
                        }
                        Some(Err(e)) => {
                            let err = AppError::SubscriptionFailed(format!(
                                "Event stream interrupted: {}",
                                e
                            ));
                            return Some((Err(err), (bytes, decoder, pending)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(events.boxed())
    }

    async fn exists(&self, location: &LeadLocation) -> Result<bool, AppError> {
        let mut url = self.location_url(location)?;
        url.query_pairs_mut().append_pair("shallow", "true");

        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| AppError::WriteFailed(e.into()))?;

        if !response.status().is_success() {
            return Err(Self::write_error(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AppError::WriteFailed(e.into()))?;
        Ok(!body.is_null())
    }

    async fn update_fields(&self, location: &LeadLocation, fields: Value) -> Result<(), AppError> {
        let url = self.location_url(location)?;
        tracing::info!("Updating lead at {}", location);

        let response = self
            .client
            .patch(url)
            .timeout(self.request_timeout)
            .json(&fields)
            .send()
            .await
            .map_err(|e| AppError::WriteFailed(e.into()))?;

        if !response.status().is_success() {
            return Err(Self::write_error(response).await);
        }

        tracing::info!("✓ Lead updated at {}", location);
        Ok(())
    }

    async fn remove(&self, location: &LeadLocation) -> Result<(), AppError> {
        let url = self.location_url(location)?;
        tracing::info!("Deleting lead at {}", location);

        let response = self
            .client
            .delete(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| AppError::WriteFailed(e.into()))?;

        if !response.status().is_success() {
            return Err(Self::write_error(response).await);
        }

        tracing::info!("✓ Lead deleted at {}", location);
        Ok(())
    }

    async fn replace_tree(&self, tree: &Value) -> Result<(), AppError> {
        let url = self.url_for(&[LEADS_ROOT])?;
        tracing::info!("Replacing lead tree at {}", Self::redacted(&url));

        let response = self
            .client
            .put(url)
            .timeout(self.request_timeout)
            .json(tree)
            .send()
            .await
            .map_err(|e| AppError::WriteFailed(e.into()))?;

        if !response.status().is_success() {
            return Err(Self::write_error(response).await);
        }
        Ok(())
    }
}
