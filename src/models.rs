use chrono::{DateTime, Utc};
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::errors::AppError;

/// Root node of the lead hierarchy in the store.
pub const LEADS_ROOT: &str = "phoneLeads";

/// Keys the ingestion pipeline copies into stored leads that duplicate provenance.
const PROVENANCE_KEYS: [&str; 5] = ["city", "business_type", "category", "batch_key", "id"];

// ============ Store Models ============

/// One business contact and its AI-derived sales analysis, as stored upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    /// Business name.
    pub name: String,
    /// Phone number as scraped (unnormalized).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Street address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Business website.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// Contact email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Overall score. Producers use either a 0-10 or a 0-100 scale.
    pub overall_score: f64,
    /// Whether somebody already called this lead.
    #[serde(default)]
    pub called: bool,
    /// When the lead was marked called. Only meaningful when `called` is true.
    #[serde(
        default,
        alias = "calledAt",
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub called_at: Option<DateTime<Utc>>,
    /// Free-text notes.
    #[serde(default)]
    pub notes: String,
    /// AI analysis block.
    pub analysis: Analysis,
    /// Optional validation verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
    /// Display-only fields (description, rating, social links, hours, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Lead {
    /// Drops copies of the provenance fields that the ingestion pipeline stores
    /// inside each lead; the authoritative values come from the hierarchy path.
    pub fn strip_provenance(&mut self) {
        for key in PROVENANCE_KEYS {
            self.extra.remove(key);
        }
    }
}

/// Accepts RFC 3339 strings or epoch milliseconds; anything else reads as absent.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Some(Value::Number(n)) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    })
}

/// AI analysis of a lead. Only the section scores are ever interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub tech_stack: AnalysisSection,
    pub operations: AnalysisSection,
    pub growth_potential: AnalysisSection,
    pub software_opportunity: AnalysisSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_maker: Option<AnalysisSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sales_conversation: Option<SalesConversation>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A scored analysis section with free-form detail fields
/// (current systems, pain points, growth indicators, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSection {
    pub score: f64,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// Talking points for the sales call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SalesConversation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub opening_points: Vec<String>,
    #[serde(default)]
    pub pain_points_to_discuss: Vec<String>,
    #[serde(default)]
    pub roi_examples: Vec<String>,
    #[serde(default)]
    pub solutions_to_propose: Vec<String>,
    #[serde(default, alias = "questions")]
    pub questions_to_ask: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Validation verdict attached by the second-pass reviewer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    #[serde(default)]
    pub recommendation: Recommendation,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub is_legitimate: bool,
    #[serde(default)]
    pub validation_points: Vec<String>,
    #[serde(default)]
    pub red_flags: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Proceed,
    Investigate,
    Reject,
    #[default]
    #[serde(other)]
    Unknown,
}

// ============ Identity & Addressing ============

/// Opaque, stable lead identifier.
///
/// Minted once per record from its hierarchy path; never used as a store path itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeadId(String);

impl LeadId {
    const TOKEN_LEN: usize = 32;

    /// Derives the identifier from the composite key.
    ///
    /// Segments are joined with an ASCII unit separator so that
    /// `("a/b", "c")` and `("a", "b/c")` never collide.
    pub fn mint(city: &str, business_type: &str, batch_key: &str, name: &str) -> Self {
        let mut hasher = Sha256::new();
        for (i, segment) in [city, business_type, batch_key, name].iter().enumerate() {
            if i > 0 {
                hasher.update([0x1f]);
            }
            hasher.update(segment.as_bytes());
        }
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..Self::TOKEN_LEN / 2]))
    }

    /// Parses a token received from a client.
    pub fn parse(token: &str) -> Result<Self, AppError> {
        let token = token.trim();
        if token.len() != Self::TOKEN_LEN || !token.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AppError::BadRequest(format!("Invalid lead id: {}", token)));
        }
        Ok(Self(token.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a lead sits inside its batch node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LeadSlot {
    /// An entry of the batch's `leads` container: an array index or a map key.
    Entry(String),
    /// The batch node is itself the lead.
    #[default]
    BatchNode,
}

/// Fully resolved upstream address of a lead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadLocation {
    pub city: String,
    pub business_type: String,
    pub batch_key: String,
    pub slot: LeadSlot,
}

impl LeadLocation {
    /// Path segments below the store root, starting with [`LEADS_ROOT`].
    pub fn segments(&self) -> Vec<&str> {
        let mut segments = vec![
            LEADS_ROOT,
            self.city.as_str(),
            self.business_type.as_str(),
            self.batch_key.as_str(),
        ];
        if let LeadSlot::Entry(key) = &self.slot {
            segments.push("leads");
            segments.push(key.as_str());
        }
        segments
    }
}

impl fmt::Display for LeadLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments().join("/"))
    }
}

// ============ Flattened Records ============

/// A lead plus the provenance attached while flattening the hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadRecord {
    pub id: LeadId,
    pub city: String,
    pub business_type: String,
    pub batch_key: String,
    #[serde(skip)]
    pub slot: LeadSlot,
    #[serde(flatten)]
    pub lead: Lead,
}

impl LeadRecord {
    pub fn new(
        city: impl Into<String>,
        business_type: impl Into<String>,
        batch_key: impl Into<String>,
        slot: LeadSlot,
        mut lead: Lead,
    ) -> Self {
        let city = city.into();
        let business_type = business_type.into();
        let batch_key = batch_key.into();
        lead.strip_provenance();
        Self {
            id: LeadId::mint(&city, &business_type, &batch_key, &lead.name),
            city,
            business_type,
            batch_key,
            slot,
            lead,
        }
    }

    pub fn score(&self) -> f64 {
        self.lead.overall_score
    }

    pub fn location(&self) -> LeadLocation {
        LeadLocation {
            city: self.city.clone(),
            business_type: self.business_type.clone(),
            batch_key: self.batch_key.clone(),
            slot: self.slot.clone(),
        }
    }
}

/// Normalizes a scraped phone number into a `tel:` URI (E.164, US default region).
///
/// Returns `None` for numbers libphonenumber does not consider valid.
pub fn dial_uri(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    match phonenumber::parse(Some(CountryId::US), trimmed) {
        Ok(number) if phonenumber::is_valid(&number) => {
            Some(format!("tel:{}", number.format().mode(Mode::E164)))
        }
        Ok(_) => {
            tracing::debug!("Phone number not dialable: {}", trimmed);
            None
        }
        Err(e) => {
            tracing::debug!("Failed to parse phone '{}': {:?}", trimmed, e);
            None
        }
    }
}
