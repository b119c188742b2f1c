//! Dashboard statistics over the full record set.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{LeadRecord, Recommendation};

/// Labels of the percentage buckets, lowest first.
pub const SCORE_BUCKETS: [&str; 5] = ["0-20", "21-40", "41-60", "61-80", "81-100"];

/// Scale that scores in `records` were produced on: 10 when every score fits
/// in 0-10, otherwise 100.
pub fn score_scale<'a>(records: impl IntoIterator<Item = &'a LeadRecord>) -> f64 {
    let max = records
        .into_iter()
        .map(LeadRecord::score)
        .fold(0.0_f64, f64::max);
    if max <= 10.0 {
        10.0
    } else {
        100.0
    }
}

/// Score as a percentage of `scale`, clamped to 0-100.
pub fn score_percent(score: f64, scale: f64) -> f64 {
    (score / scale * 100.0).clamp(0.0, 100.0)
}

fn bucket_index(percent: f64) -> usize {
    match percent {
        p if p <= 20.0 => 0,
        p if p <= 40.0 => 1,
        p if p <= 60.0 => 2,
        p if p <= 80.0 => 3,
        _ => 4,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecommendationCounts {
    pub proceed: usize,
    pub investigate: usize,
    pub reject: usize,
    /// Leads without a validation block or with an unrecognized verdict.
    pub unvalidated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreBucket {
    pub label: &'static str,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStats {
    pub total_leads: usize,
    pub average_score: f64,
    pub score_scale: f64,
    pub cities_count: usize,
    pub business_types_count: usize,
    pub called_count: usize,
    pub validation: RecommendationCounts,
    pub score_distribution: Vec<ScoreBucket>,
    pub leads_by_city: BTreeMap<String, usize>,
    pub leads_by_business_type: BTreeMap<String, usize>,
}

impl DashboardStats {
    pub fn compute(records: &[LeadRecord]) -> Self {
        let scale = score_scale(records);
        let mut validation = RecommendationCounts::default();
        let mut buckets = [0usize; 5];
        let mut leads_by_city: BTreeMap<String, usize> = BTreeMap::new();
        let mut leads_by_business_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_score = 0.0;
        let mut called_count = 0;

        for record in records {
            total_score += record.score();
            if record.lead.called {
                called_count += 1;
            }
            *leads_by_city.entry(record.city.clone()).or_default() += 1;
            *leads_by_business_type
                .entry(record.business_type.clone())
                .or_default() += 1;

            match record.lead.validation.as_ref().map(|v| v.recommendation) {
                Some(Recommendation::Proceed) => validation.proceed += 1,
                Some(Recommendation::Investigate) => validation.investigate += 1,
                Some(Recommendation::Reject) => validation.reject += 1,
                Some(Recommendation::Unknown) | None => validation.unvalidated += 1,
            }

            buckets[bucket_index(score_percent(record.score(), scale))] += 1;
        }

        let total_leads = records.len();
        Self {
            total_leads,
            average_score: if total_leads > 0 {
                total_score / total_leads as f64
            } else {
                0.0
            },
            score_scale: scale,
            cities_count: leads_by_city.len(),
            business_types_count: leads_by_business_type.len(),
            called_count,
            validation,
            score_distribution: SCORE_BUCKETS
                .iter()
                .zip(buckets)
                .map(|(label, count)| ScoreBucket { label, count })
                .collect(),
            leads_by_city,
            leads_by_business_type,
        }
    }
}
