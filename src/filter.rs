//! Filter predicates, sort order, and facet derivation for the lead view.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::LeadRecord;

/// Sentinel facet value meaning "no restriction".
pub const ALL: &str = "all";

/// Restriction on one facet dimension (city or business type).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FacetFilter {
    #[default]
    All,
    Only(String),
}

impl FacetFilter {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            FacetFilter::All => true,
            FacetFilter::Only(expected) => expected == value,
        }
    }
}

impl From<String> for FacetFilter {
    fn from(value: String) -> Self {
        if value == ALL {
            FacetFilter::All
        } else {
            FacetFilter::Only(value)
        }
    }
}

impl From<&str> for FacetFilter {
    fn from(value: &str) -> Self {
        FacetFilter::from(value.to_string())
    }
}

impl From<FacetFilter> for String {
    fn from(filter: FacetFilter) -> Self {
        match filter {
            FacetFilter::All => ALL.to_string(),
            FacetFilter::Only(value) => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalledState {
    #[default]
    All,
    Called,
    NotCalled,
}

impl CalledState {
    pub fn matches(self, called: bool) -> bool {
        match self {
            CalledState::All => true,
            CalledState::Called => called,
            CalledState::NotCalled => !called,
        }
    }
}

/// Order of the view by `overall_score`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn toggled(self) -> Self {
        match self {
            SortOrder::Asc => SortOrder::Desc,
            SortOrder::Desc => SortOrder::Asc,
        }
    }
}

/// The composable lead filter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadFilter {
    pub min_score: f64,
    pub city: FacetFilter,
    pub business_type: FacetFilter,
    pub called: CalledState,
}

impl LeadFilter {
    pub fn matches(&self, record: &LeadRecord) -> bool {
        record.score() >= self.min_score
            && self.city.matches(&record.city)
            && self.business_type.matches(&record.business_type)
            && self.called.matches(record.lead.called)
    }
}

/// Filters and sorts `records`. Pure; equal scores keep their input order.
pub fn compute_view<'a>(
    records: &'a [LeadRecord],
    filter: &LeadFilter,
    order: SortOrder,
) -> Vec<&'a LeadRecord> {
    let mut view: Vec<&LeadRecord> = records.iter().filter(|r| filter.matches(r)).collect();
    // sort_by is stable
    match order {
        SortOrder::Asc => view.sort_by(|a, b| a.score().total_cmp(&b.score())),
        SortOrder::Desc => view.sort_by(|a, b| b.score().total_cmp(&a.score())),
    }
    view
}

/// Distinct facet values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Facets {
    pub cities: Vec<String>,
    pub business_types: Vec<String>,
}

impl Facets {
    pub fn derive(records: &[LeadRecord]) -> Self {
        Self {
            cities: facet_values(records.iter().map(|r| r.city.as_str())),
            business_types: facet_values(records.iter().map(|r| r.business_type.as_str())),
        }
    }
}

/// `"all"` followed by the sorted distinct values.
pub fn facet_values<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let distinct: BTreeSet<&str> = values.filter(|v| *v != ALL).collect();
    std::iter::once(ALL.to_string())
        .chain(distinct.into_iter().map(str::to_string))
        .collect()
}
