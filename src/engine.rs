//! Aggregation & filter engine.
//!
//! Owns the flattened record set, the filter controls and the feed/write
//! status shown on the dashboard. All transitions are synchronous and free of
//! I/O; the dashboard service feeds snapshots and write outcomes into it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::AppError;
use crate::filter::{compute_view, CalledState, FacetFilter, Facets, LeadFilter, SortOrder};
use crate::models::{dial_uri, LeadId, LeadLocation, LeadRecord};
use crate::snapshot::Snapshot;
use crate::stats::{score_percent, score_scale, DashboardStats};

/// Health of the live feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedStatus {
    /// No snapshot received yet.
    Connecting,
    Live,
    /// The feed failed; the last good records are still served.
    Degraded {
        error: String,
        retryable: bool,
        since: DateTime<Utc>,
    },
}

/// A write the store has acknowledged, ready to be reflected locally.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmedWrite {
    Notes(String),
    Called(DateTime<Utc>),
    Deleted,
}

/// Partial update of the filter controls. Absent fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterUpdate {
    pub min_score: Option<f64>,
    pub city: Option<FacetFilter>,
    pub business_type: Option<FacetFilter>,
    pub called: Option<CalledState>,
    pub sort_order: Option<SortOrder>,
}

/// One row of the dashboard table.
#[derive(Debug, Clone, Serialize)]
pub struct LeadRow {
    #[serde(flatten)]
    pub record: LeadRecord,
    pub score_percent: f64,
    pub dial_uri: Option<String>,
}

/// Everything the dashboard renders in one response.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardState {
    pub rows: Vec<LeadRow>,
    pub total: usize,
    pub shown: usize,
    pub score_scale: f64,
    pub facets: Facets,
    pub filter: LeadFilter,
    pub sort_order: SortOrder,
    pub status: FeedStatus,
    pub last_write_error: Option<String>,
    pub malformed_nodes: usize,
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct LeadEngine {
    records: Vec<LeadRecord>,
    index: HashMap<LeadId, usize>,
    filter: LeadFilter,
    sort_order: SortOrder,
    facets: Facets,
    status: FeedStatus,
    last_write_error: Option<String>,
    malformed_nodes: usize,
    last_snapshot_at: Option<DateTime<Utc>>,
}

impl Default for LeadEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LeadEngine {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
            filter: LeadFilter::default(),
            sort_order: SortOrder::default(),
            facets: Facets::derive(&[]),
            status: FeedStatus::Connecting,
            last_write_error: None,
            malformed_nodes: 0,
            last_snapshot_at: None,
        }
    }

    // ============ Feed ============

    /// Replaces the record set wholesale with `snapshot`.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot, at: DateTime<Utc>) {
        self.malformed_nodes = snapshot.malformed.len();
        self.records = snapshot.records;
        self.reindex();
        self.status = FeedStatus::Live;
        self.last_snapshot_at = Some(at);
    }

    /// Marks the feed degraded. Records are kept.
    pub fn record_feed_error(&mut self, err: &AppError, at: DateTime<Utc>) {
        let since = match &self.status {
            FeedStatus::Degraded { since, .. } => *since,
            _ => at,
        };
        self.status = FeedStatus::Degraded {
            error: err.to_string(),
            retryable: matches!(err.root(), AppError::SubscriptionFailed(_)),
            since,
        };
    }

    fn reindex(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(pos, record)| (record.id.clone(), pos))
            .collect();
        self.facets = Facets::derive(&self.records);
    }

    // ============ Controls ============

    pub fn set_min_score(&mut self, min_score: f64) -> Result<(), AppError> {
        if !min_score.is_finite() || min_score < 0.0 {
            return Err(AppError::BadRequest(format!(
                "min_score must be a finite, non-negative number, got {}",
                min_score
            )));
        }
        self.filter.min_score = min_score;
        Ok(())
    }

    pub fn set_city_filter(&mut self, city: FacetFilter) {
        self.filter.city = city;
    }

    pub fn set_business_type_filter(&mut self, business_type: FacetFilter) {
        self.filter.business_type = business_type;
    }

    pub fn set_called_filter(&mut self, called: CalledState) {
        self.filter.called = called;
    }

    pub fn set_sort_order(&mut self, order: SortOrder) {
        self.sort_order = order;
    }

    pub fn toggle_sort_order(&mut self) -> SortOrder {
        self.sort_order = self.sort_order.toggled();
        self.sort_order
    }

    /// Applies every present field, or none of them if one is invalid.
    pub fn apply_filter_update(&mut self, update: FilterUpdate) -> Result<(), AppError> {
        if let Some(min_score) = update.min_score {
            self.set_min_score(min_score)?;
        }
        if let Some(city) = update.city {
            self.set_city_filter(city);
        }
        if let Some(business_type) = update.business_type {
            self.set_business_type_filter(business_type);
        }
        if let Some(called) = update.called {
            self.set_called_filter(called);
        }
        if let Some(order) = update.sort_order {
            self.set_sort_order(order);
        }
        Ok(())
    }

    // ============ Reads ============

    pub fn records(&self) -> &[LeadRecord] {
        &self.records
    }

    pub fn get(&self, id: &LeadId) -> Option<&LeadRecord> {
        self.index.get(id).map(|&pos| &self.records[pos])
    }

    pub fn filter(&self) -> &LeadFilter {
        &self.filter
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    pub fn status(&self) -> &FeedStatus {
        &self.status
    }

    pub fn last_write_error(&self) -> Option<&str> {
        self.last_write_error.as_deref()
    }

    pub fn facets(&self) -> &Facets {
        &self.facets
    }

    pub fn view(&self) -> Vec<&LeadRecord> {
        compute_view(&self.records, &self.filter, self.sort_order)
    }

    pub fn stats(&self) -> DashboardStats {
        DashboardStats::compute(&self.records)
    }

    pub fn state(&self) -> DashboardState {
        let scale = score_scale(&self.records);
        let rows: Vec<LeadRow> = self
            .view()
            .into_iter()
            .map(|record| LeadRow {
                score_percent: score_percent(record.score(), scale),
                dial_uri: record.lead.phone.as_deref().and_then(dial_uri),
                record: record.clone(),
            })
            .collect();

        DashboardState {
            total: self.records.len(),
            shown: rows.len(),
            rows,
            score_scale: scale,
            facets: self.facets.clone(),
            filter: self.filter.clone(),
            sort_order: self.sort_order,
            status: self.status.clone(),
            last_write_error: self.last_write_error.clone(),
            malformed_nodes: self.malformed_nodes,
            last_snapshot_at: self.last_snapshot_at,
        }
    }

    // ============ Mutations ============

    /// Resolves an id to the upstream location of its record.
    pub fn locate(&self, id: &LeadId) -> Result<LeadLocation, AppError> {
        self.get(id)
            .map(LeadRecord::location)
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", id)))
    }

    /// Reconciles local state with the outcome of a write.
    ///
    /// Success is applied, `NotFound` drops the stale row, any other failure
    /// leaves the records untouched and becomes the last write error.
    pub fn complete_write(
        &mut self,
        id: &LeadId,
        outcome: Result<ConfirmedWrite, AppError>,
    ) -> Result<(), AppError> {
        match outcome {
            Ok(write) => {
                self.last_write_error = None;
                self.apply_confirmed(id, write);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.drop_stale(id);
                Err(e)
            }
            Err(e) => {
                self.record_write_error(&e);
                Err(e)
            }
        }
    }

    pub fn apply_confirmed(&mut self, id: &LeadId, write: ConfirmedWrite) {
        let Some(&pos) = self.index.get(id) else {
            // A snapshot already replaced the records; it carries the write too.
            tracing::debug!("Confirmed write for {} has no local record", id);
            return;
        };

        match write {
            ConfirmedWrite::Notes(notes) => self.records[pos].lead.notes = notes,
            ConfirmedWrite::Called(at) => {
                let lead = &mut self.records[pos].lead;
                lead.called = true;
                lead.called_at = Some(at);
            }
            ConfirmedWrite::Deleted => self.remove(pos),
        }
    }

    pub fn drop_stale(&mut self, id: &LeadId) {
        if let Some(&pos) = self.index.get(id) {
            tracing::info!("Dropping stale lead {}", id);
            self.remove(pos);
        }
    }

    pub fn record_write_error(&mut self, err: &AppError) {
        self.last_write_error = Some(err.to_string());
    }

    fn remove(&mut self, pos: usize) {
        self.records.remove(pos);
        self.reindex();
    }
}
