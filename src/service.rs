//! Dashboard service: a single task that owns the [`LeadEngine`] and processes
//! one command queue in order.
//!
//! Snapshots and feed errors arrive from the adapter's subscription, queries
//! and intents from the HTTP handlers. Writes run in their own tasks and post
//! their outcome back into the same queue, so the engine is never shared and
//! never waits on I/O.

use chrono::{SubsecRound, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::adapter::{BackendAdapter, Subscription};
use crate::engine::{ConfirmedWrite, DashboardState, FilterUpdate, LeadEngine};
use crate::errors::AppError;
use crate::filter::Facets;
use crate::models::{LeadId, LeadLocation};
use crate::snapshot::Snapshot;
use crate::stats::DashboardStats;

type Reply<T> = oneshot::Sender<T>;

/// A user intent that needs a store write.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationIntent {
    UpdateNotes(String),
    MarkCalled,
    Delete,
}

impl MutationIntent {
    async fn execute(
        self,
        adapter: &BackendAdapter,
        location: &LeadLocation,
    ) -> Result<ConfirmedWrite, AppError> {
        match self {
            MutationIntent::UpdateNotes(notes) => {
                adapter.update_notes(location, &notes).await?;
                Ok(ConfirmedWrite::Notes(notes))
            }
            MutationIntent::MarkCalled => {
                // Stored with millisecond precision; keep the local copy identical.
                let at = Utc::now().trunc_subsecs(3);
                adapter.mark_called(location, at).await?;
                Ok(ConfirmedWrite::Called(at))
            }
            MutationIntent::Delete => {
                adapter.delete_lead(location).await?;
                Ok(ConfirmedWrite::Deleted)
            }
        }
    }
}

enum Command {
    Snapshot(Snapshot),
    FeedError(AppError),
    Query(Reply<DashboardState>),
    Stats(Reply<DashboardStats>),
    Facets(Reply<Facets>),
    SetFilter {
        update: FilterUpdate,
        reply: Reply<Result<DashboardState, AppError>>,
    },
    ToggleSort(Reply<DashboardState>),
    Mutate {
        id: LeadId,
        intent: MutationIntent,
        reply: Reply<Result<DashboardState, AppError>>,
    },
    WriteCompleted {
        id: LeadId,
        outcome: Result<ConfirmedWrite, AppError>,
        reply: Reply<Result<DashboardState, AppError>>,
    },
    Retry,
    Shutdown(Reply<()>),
}

/// Cloneable front door to the dashboard service.
#[derive(Clone)]
pub struct DashboardHandle {
    commands: mpsc::UnboundedSender<Command>,
}

pub struct DashboardService {
    engine: LeadEngine,
    adapter: Arc<BackendAdapter>,
    subscription: Option<Subscription>,
    commands: mpsc::UnboundedReceiver<Command>,
    completions: mpsc::UnboundedSender<Command>,
}

impl DashboardService {
    /// Subscribes to the live feed and starts the service task.
    pub fn spawn(adapter: Arc<BackendAdapter>) -> (DashboardHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let snapshots = tx.clone();
        let errors = tx.clone();
        let subscription = adapter.subscribe(
            move |snapshot| {
                let _ = snapshots.send(Command::Snapshot(snapshot));
            },
            move |err| {
                let _ = errors.send(Command::FeedError(err));
            },
        );

        let service = Self {
            engine: LeadEngine::new(),
            adapter,
            subscription: Some(subscription),
            commands: rx,
            completions: tx.clone(),
        };
        let task = tokio::spawn(service.run());

        (DashboardHandle { commands: tx }, task)
    }

    async fn run(mut self) {
        tracing::info!("Dashboard service started");

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Snapshot(snapshot) => {
                    tracing::debug!("Applying snapshot of {} records", snapshot.records.len());
                    self.engine.apply_snapshot(snapshot, Utc::now());
                }
                Command::FeedError(err) => {
                    tracing::warn!("Lead feed degraded: {}", err);
                    self.engine.record_feed_error(&err, Utc::now());
                }
                Command::Query(reply) => {
                    let _ = reply.send(self.engine.state());
                }
                Command::Stats(reply) => {
                    let _ = reply.send(self.engine.stats());
                }
                Command::Facets(reply) => {
                    let _ = reply.send(self.engine.facets().clone());
                }
                Command::SetFilter { update, reply } => {
                    let result = self
                        .engine
                        .apply_filter_update(update)
                        .map(|()| self.engine.state());
                    let _ = reply.send(result);
                }
                Command::ToggleSort(reply) => {
                    let order = self.engine.toggle_sort_order();
                    tracing::debug!("Sort order now {:?}", order);
                    let _ = reply.send(self.engine.state());
                }
                Command::Mutate { id, intent, reply } => self.start_write(id, intent, reply),
                Command::WriteCompleted { id, outcome, reply } => {
                    let result = self
                        .engine
                        .complete_write(&id, outcome)
                        .map(|()| self.engine.state());
                    let _ = reply.send(result);
                }
                Command::Retry => {
                    if let Some(subscription) = &self.subscription {
                        subscription.retry_now();
                    }
                }
                Command::Shutdown(done) => {
                    if let Some(subscription) = self.subscription.take() {
                        subscription.unsubscribe();
                    }
                    let _ = done.send(());
                    break;
                }
            }
        }

        tracing::info!("Dashboard service stopped");
    }

    fn start_write(
        &self,
        id: LeadId,
        intent: MutationIntent,
        reply: Reply<Result<DashboardState, AppError>>,
    ) {
        let location = match self.engine.locate(&id) {
            Ok(location) => location,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let already_called = self.engine.get(&id).is_some_and(|record| record.lead.called);
        if matches!(intent, MutationIntent::MarkCalled) && already_called {
            tracing::debug!("{} is already marked called", location);
            let _ = reply.send(Ok(self.engine.state()));
            return;
        }

        tracing::info!("{:?} requested for {}", intent, location);
        let adapter = Arc::clone(&self.adapter);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let outcome = intent.execute(&adapter, &location).await;
            let _ = completions.send(Command::WriteCompleted { id, outcome, reply });
        });
    }
}

impl DashboardHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, AppError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| AppError::InternalError("Dashboard service is not running".to_string()))?;
        response
            .await
            .map_err(|_| AppError::InternalError("Dashboard service dropped the request".to_string()))
    }

    pub async fn state(&self) -> Result<DashboardState, AppError> {
        self.request(Command::Query).await
    }

    pub async fn stats(&self) -> Result<DashboardStats, AppError> {
        self.request(Command::Stats).await
    }

    pub async fn facets(&self) -> Result<Facets, AppError> {
        self.request(Command::Facets).await
    }

    pub async fn update_filter(&self, update: FilterUpdate) -> Result<DashboardState, AppError> {
        self.request(|reply| Command::SetFilter { update, reply })
            .await?
    }

    pub async fn toggle_sort(&self) -> Result<DashboardState, AppError> {
        self.request(Command::ToggleSort).await
    }

    /// Issues a write and waits until its outcome has been reconciled.
    pub async fn mutate(
        &self,
        id: LeadId,
        intent: MutationIntent,
    ) -> Result<DashboardState, AppError> {
        self.request(|reply| Command::Mutate { id, intent, reply })
            .await?
    }

    pub async fn update_notes(&self, id: LeadId, notes: String) -> Result<DashboardState, AppError> {
        self.mutate(id, MutationIntent::UpdateNotes(notes)).await
    }

    pub async fn mark_called(&self, id: LeadId) -> Result<DashboardState, AppError> {
        self.mutate(id, MutationIntent::MarkCalled).await
    }

    pub async fn delete_lead(&self, id: LeadId) -> Result<DashboardState, AppError> {
        self.mutate(id, MutationIntent::Delete).await
    }

    /// Skips the feed's pending reconnect delay.
    pub fn retry_feed(&self) -> Result<(), AppError> {
        self.commands
            .send(Command::Retry)
            .map_err(|_| AppError::InternalError("Dashboard service is not running".to_string()))
    }

    /// Stops the service and its subscription. Later calls on any handle fail.
    pub async fn shutdown(&self) -> Result<(), AppError> {
        self.request(Command::Shutdown).await
    }
}
