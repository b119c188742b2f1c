//! Backend adapter: turns the store's live feed into flat snapshots and issues
//! point mutations against individual leads.

use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::circuit_breaker::{create_write_circuit_breaker, reconnect_backoff, WriteBreaker};
use crate::errors::{AppError, WriteFailure};
use crate::event_stream::StoreEvent;
use crate::models::LeadLocation;
use crate::snapshot::{self, Snapshot};
use crate::store::LeadStore;

/// Timing knobs for the adapter.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// Upper bound for one mutation round-trip, existence probe included.
    pub write_timeout: Duration,
    /// First delay before reconnecting the live feed.
    pub reconnect_initial: Duration,
    /// Cap for the reconnect delay.
    pub reconnect_max: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

pub struct BackendAdapter {
    store: Arc<dyn LeadStore>,
    settings: AdapterSettings,
    breaker: WriteBreaker,
}

/// Handle to a live subscription.
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) stops deliveries:
/// the liveness flag is cleared before the feed task is aborted, and every
/// delivery checks the flag first.
pub struct Subscription {
    live: Arc<AtomicBool>,
    retry: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Tears the subscription down. Consumes the handle, so it runs exactly once.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Skips the pending reconnect delay, if any. Does nothing while the feed
    /// is connected.
    pub fn retry_now(&self) {
        self.retry.notify_waiters();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.live.store(false, Ordering::Release);
        self.task.abort();
        tracing::info!("Lead feed unsubscribed");
    }
}

impl BackendAdapter {
    pub fn new(store: Arc<dyn LeadStore>, settings: AdapterSettings) -> Self {
        Self {
            store,
            settings,
            breaker: create_write_circuit_breaker(),
        }
    }

    /// Registers for continuous updates.
    ///
    /// Every applied `put`/`patch` event yields a complete flattened snapshot.
    /// Transport failures are reported through `on_error` and the feed
    /// reconnects with exponential backoff until the subscription is dropped.
    pub fn subscribe<S, E>(&self, on_snapshot: S, on_error: E) -> Subscription
    where
        S: Fn(Snapshot) + Send + Sync + 'static,
        E: Fn(AppError) + Send + Sync + 'static,
    {
        let live = Arc::new(AtomicBool::new(true));
        let retry = Arc::new(Notify::new());
        let store = Arc::clone(&self.store);
        let settings = self.settings.clone();

        let task = tokio::spawn(run_feed(
            store,
            settings,
            Arc::clone(&live),
            Arc::clone(&retry),
            on_snapshot,
            on_error,
        ));

        Subscription { live, retry, task }
    }

    /// Sets the `notes` field. An empty string clears the notes.
    pub async fn update_notes(&self, location: &LeadLocation, notes: &str) -> Result<(), AppError> {
        self.guarded_write("update_notes", location, json!({ "notes": notes }))
            .await
    }

    /// Sets `called = true` and `called_at = at` (ISO-8601, millisecond precision).
    pub async fn mark_called(
        &self,
        location: &LeadLocation,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let fields = json!({
            "called": true,
            "called_at": at.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        self.guarded_write("mark_called", location, fields).await
    }

    /// Removes the lead upstream.
    pub async fn delete_lead(&self, location: &LeadLocation) -> Result<(), AppError> {
        let store = Arc::clone(&self.store);
        self.run_guarded("delete_lead", location, async move {
            if !store.exists(location).await? {
                return Err(AppError::NotFound(format!("No lead stored at {}", location)));
            }
            store.remove(location).await
        })
        .await
    }

    async fn guarded_write(
        &self,
        op: &'static str,
        location: &LeadLocation,
        fields: Value,
    ) -> Result<(), AppError> {
        let store = Arc::clone(&self.store);
        self.run_guarded(op, location, async move {
            // PATCH on a missing path would silently recreate the lead.
            if !store.exists(location).await? {
                return Err(AppError::NotFound(format!("No lead stored at {}", location)));
            }
            store.update_fields(location, fields).await
        })
        .await
    }

    /// Runs a write under the write timeout and the circuit breaker.
    async fn run_guarded<F>(
        &self,
        op: &'static str,
        location: &LeadLocation,
        write: F,
    ) -> Result<(), AppError>
    where
        F: Future<Output = Result<(), AppError>>,
    {
        if !self.breaker.is_call_permitted() {
            tracing::warn!("{} rejected for {}: circuit open", op, location);
            return Err(AppError::WriteFailed(WriteFailure::CircuitOpen));
        }

        match tokio::time::timeout(self.settings.write_timeout, write).await {
            Err(_) => {
                self.breaker.on_error();
                tracing::error!(
                    "{} timed out after {:?} for {}",
                    op,
                    self.settings.write_timeout,
                    location
                );
                Err(AppError::WriteFailed(WriteFailure::Timeout))
            }
            Ok(Err(e)) if e.is_not_found() => {
                // The store answered; a vanished lead says nothing about its health.
                self.breaker.on_success();
                tracing::info!("{} found no lead at {}", op, location);
                Err(e)
            }
            Ok(Err(e)) => {
                self.breaker.on_error();
                tracing::error!("{} failed for {}: {}", op, location, e);
                Err(e)
            }
            Ok(Ok(())) => {
                self.breaker.on_success();
                tracing::debug!("{} succeeded for {}", op, location);
                Ok(())
            }
        }
    }
}

/// Why one connection of the live feed ended.
enum FeedEnd {
    Failed(AppError),
    Closed,
}

async fn run_feed<S, E>(
    store: Arc<dyn LeadStore>,
    settings: AdapterSettings,
    live: Arc<AtomicBool>,
    retry: Arc<Notify>,
    on_snapshot: S,
    on_error: E,
) where
    S: Fn(Snapshot) + Send + Sync + 'static,
    E: Fn(AppError) + Send + Sync + 'static,
{
    let deliver_snapshot = |snapshot: Snapshot| {
        if live.load(Ordering::Acquire) {
            on_snapshot(snapshot);
        }
    };
    let deliver_error = |err: AppError| {
        if live.load(Ordering::Acquire) {
            on_error(err);
        }
    };

    let mut backoff = reconnect_backoff(settings.reconnect_initial, settings.reconnect_max);

    while live.load(Ordering::Acquire) {
        let mut healthy = false;

        let end = match store.open_event_stream().await {
            Ok(mut events) => {
                tracing::info!("Lead feed connected");
                let mut tree = Value::Null;
                loop {
                    match events.next().await {
                        Some(Ok(StoreEvent::Put { path, data })) => {
                            snapshot::apply_put(&mut tree, &path, data);
                        }
                        Some(Ok(StoreEvent::Patch { path, data })) => {
                            snapshot::apply_patch(&mut tree, &path, data);
                        }
                        Some(Ok(StoreEvent::KeepAlive)) => continue,
                        Some(Ok(StoreEvent::Cancelled(reason))) => {
                            break FeedEnd::Failed(AppError::SubscriptionFailed(format!(
                                "Store cancelled the feed: {}",
                                reason
                            )));
                        }
                        Some(Ok(StoreEvent::AuthRevoked)) => {
                            break FeedEnd::Failed(AppError::SubscriptionFailed(
                                "Store credential revoked".to_string(),
                            ));
                        }
                        Some(Err(e)) if matches!(e.root(), AppError::MalformedSnapshot(_)) => {
                            tracing::warn!("Skipping unreadable feed event: {}", e);
                            continue;
                        }
                        Some(Err(e)) => break FeedEnd::Failed(e),
                        None => break FeedEnd::Closed,
                    }

                    if !healthy {
                        healthy = true;
                        backoff =
                            reconnect_backoff(settings.reconnect_initial, settings.reconnect_max);
                    }

                    let snapshot = snapshot::flatten(&tree);
                    tracing::debug!(
                        "Lead feed snapshot: {} records, {} malformed nodes",
                        snapshot.records.len(),
                        snapshot.malformed.len()
                    );
                    deliver_snapshot(snapshot);
                }
            }
            Err(e) => FeedEnd::Failed(e),
        };

        let err = match end {
            FeedEnd::Failed(e) => e,
            FeedEnd::Closed => AppError::SubscriptionFailed("Store closed the feed".to_string()),
        };

        let delay = backoff.next().unwrap_or(settings.reconnect_max);
        tracing::warn!("Lead feed down ({}), reconnecting in {:?}", err, delay);

        // Register before delivering the error; a retry sent from `on_error` must wake this wait.
        let retried = retry.notified();
        tokio::pin!(retried);
        retried.as_mut().enable();
        deliver_error(err);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut retried => {
                tracing::info!("Lead feed retry requested");
            }
        }
    }
}
