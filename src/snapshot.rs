//! Decoding of the upstream lead hierarchy.
//!
//! The store keeps leads under `phoneLeads/{city}/{business_type}/{batch_key}`.
//! Producers disagree on what a batch node looks like, so every batch is decoded
//! into a [`BatchNode`] and normalized into flat [`LeadRecord`]s right here.
//! Nothing past this module sees the raw shapes.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use crate::models::{Lead, LeadId, LeadRecord, LeadSlot};

/// A batch node, decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchNode {
    /// `{ "leads": [...] }` or `{ "leads": { key: lead } }`, plus optional metadata.
    BatchOfLeads(Vec<(LeadSlot, Lead)>),
    /// The batch node is itself a lead.
    SingleLead(Box<Lead>),
}

/// A node that matched neither known shape and was skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedNode {
    pub path: String,
    pub reason: String,
}

/// The complete flattened record set at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub records: Vec<LeadRecord>,
    pub malformed: Vec<MalformedNode>,
}

/// A batch node split into its raw lead values, before any lead is decoded.
enum RawBatch<'v> {
    Leads(Vec<(String, &'v Value)>),
    Single(&'v Value),
}

impl<'v> RawBatch<'v> {
    fn split(path: &str, value: &'v Value, malformed: &mut Vec<MalformedNode>) -> Option<Self> {
        let Value::Object(fields) = value else {
            malformed.push(MalformedNode {
                path: path.to_string(),
                reason: format!("expected an object, found {}", kind_of(value)),
            });
            return None;
        };

        if let Some(container) = fields.get("leads") {
            let entries: Vec<(String, &Value)> = match container {
                Value::Array(items) => items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), v))
                    .collect(),
                Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
                other => {
                    malformed.push(MalformedNode {
                        path: format!("{}/leads", path),
                        reason: format!("expected a list or map of leads, found {}", kind_of(other)),
                    });
                    return None;
                }
            };
            // Deleted array entries come back as null holes.
            return Some(RawBatch::Leads(
                entries.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            ));
        }

        if fields.contains_key("name") && fields.contains_key("overall_score") {
            return Some(RawBatch::Single(value));
        }

        malformed.push(MalformedNode {
            path: path.to_string(),
            reason: "neither a batch of leads nor a lead".to_string(),
        });
        None
    }
}

impl BatchNode {
    /// Decodes one batch node. Individual leads that fail to decode inside a
    /// valid container are reported in `malformed` and skipped.
    pub fn decode(path: &str, value: &Value, malformed: &mut Vec<MalformedNode>) -> Option<Self> {
        match RawBatch::split(path, value, malformed)? {
            RawBatch::Leads(entries) => {
                let mut leads = Vec::with_capacity(entries.len());
                for (key, raw) in entries {
                    match serde_json::from_value::<Lead>(raw.clone()) {
                        Ok(lead) => leads.push((LeadSlot::Entry(key), lead)),
                        Err(e) => malformed.push(MalformedNode {
                            path: format!("{}/leads/{}", path, key),
                            reason: e.to_string(),
                        }),
                    }
                }
                Some(BatchNode::BatchOfLeads(leads))
            }
            RawBatch::Single(raw) => match serde_json::from_value::<Lead>(raw.clone()) {
                Ok(lead) => Some(BatchNode::SingleLead(Box::new(lead))),
                Err(e) => {
                    malformed.push(MalformedNode {
                        path: path.to_string(),
                        reason: e.to_string(),
                    });
                    None
                }
            },
        }
    }

    pub fn into_leads(self) -> Vec<(LeadSlot, Lead)> {
        match self {
            BatchNode::BatchOfLeads(leads) => leads,
            BatchNode::SingleLead(lead) => vec![(LeadSlot::BatchNode, *lead)],
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Iterates the children of a hierarchy level. RTDB returns levels with dense
/// integer keys as arrays, so arrays are treated as index-keyed maps.
fn children(value: &Value) -> Option<Vec<(String, &Value)>> {
    match value {
        Value::Object(map) => Some(map.iter().map(|(k, v)| (k.clone(), v)).collect()),
        Value::Array(items) => Some(
            items
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_null())
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
        ),
        _ => None,
    }
}

/// Flattens the `phoneLeads` subtree into a snapshot.
///
/// Malformed nodes are skipped and reported; they never abort the snapshot.
/// When two leads share the same identity the later one replaces the earlier
/// record in place.
pub fn flatten(tree: &Value) -> Snapshot {
    let mut snapshot = Snapshot::default();
    if tree.is_null() {
        return snapshot;
    }

    let Some(cities) = children(tree) else {
        snapshot.malformed.push(MalformedNode {
            path: "/".to_string(),
            reason: format!("expected an object, found {}", kind_of(tree)),
        });
        return snapshot;
    };

    let mut positions: HashMap<LeadId, usize> = HashMap::new();

    for (city, city_node) in cities {
        let Some(types) = children(city_node) else {
            snapshot.malformed.push(MalformedNode {
                path: city.clone(),
                reason: format!("expected business types, found {}", kind_of(city_node)),
            });
            continue;
        };

        for (business_type, type_node) in types {
            let type_path = format!("{}/{}", city, business_type);
            let Some(batches) = children(type_node) else {
                snapshot.malformed.push(MalformedNode {
                    path: type_path,
                    reason: format!("expected batches, found {}", kind_of(type_node)),
                });
                continue;
            };

            for (batch_key, batch_value) in batches {
                let batch_path = format!("{}/{}", type_path, batch_key);
                let Some(batch) = BatchNode::decode(&batch_path, batch_value, &mut snapshot.malformed)
                else {
                    continue;
                };

                for (slot, lead) in batch.into_leads() {
                    let record = LeadRecord::new(&city, &business_type, &batch_key, slot, lead);
                    match positions.get(&record.id) {
                        Some(&pos) => {
                            tracing::debug!(
                                "Duplicate lead '{}' in {}, keeping the later entry",
                                record.lead.name,
                                batch_path
                            );
                            snapshot.records[pos] = record;
                        }
                        None => {
                            positions.insert(record.id.clone(), snapshot.records.len());
                            snapshot.records.push(record);
                        }
                    }
                }
            }
        }
    }

    for node in &snapshot.malformed {
        tracing::warn!("Skipping malformed node {}: {}", node.path, node.reason);
    }

    snapshot
}

// ============ Live tree maintenance ============

fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Converts an array node into an index-keyed object so children can be
/// addressed by key, matching how the store itself treats arrays.
fn as_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        let converted = match node.take() {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .filter(|(_, v)| !v.is_null())
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
            _ => Map::new(),
        };
        *node = Value::Object(converted);
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just converted to an object"),
    }
}

/// Applies a `put` event: replaces the node at `path` (null deletes it).
pub fn apply_put(tree: &mut Value, path: &str, data: Value) {
    let segments = path_segments(path);
    let Some((last, parents)) = segments.split_last() else {
        *tree = data;
        return;
    };

    if data.is_null() {
        let mut node = &mut *tree;
        for segment in parents {
            if !(node.is_object() || node.is_array()) {
                return;
            }
            let Some(child) = as_object(node).get_mut(*segment) else {
                return;
            };
            node = child;
        }
        if node.is_object() || node.is_array() {
            as_object(node).remove(*last);
        }
        return;
    }

    let mut node = &mut *tree;
    for segment in parents {
        node = as_object(node)
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    as_object(node).insert(last.to_string(), data);
}

/// Applies a `patch` event: merges each child of `data` into the node at `path`.
pub fn apply_patch(tree: &mut Value, path: &str, data: Value) {
    let Value::Object(children) = data else {
        apply_put(tree, path, data);
        return;
    };
    let base = path.trim_end_matches('/');
    for (key, value) in children {
        apply_put(tree, &format!("{}/{}", base, key), value);
    }
}

// ============ Canonical schema ============

/// Counts produced by [`normalize_tree`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub batches: usize,
    pub rewritten_batches: usize,
    pub leads: usize,
    pub dropped_nodes: usize,
}

/// Characters the store forbids in keys.
fn sanitize_key(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '.' | '$' | '#' | '[' | ']' | '/' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.trim().is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Whether `key` is `sanitize_key(name)`, possibly with a `_<n>` suffix
/// added to separate names that sanitize alike.
fn is_key_for(key: &str, name: &str) -> bool {
    let base = sanitize_key(name);
    match key.strip_prefix(base.as_str()) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('_')
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

fn is_keyed_by_name(batch: &Value) -> bool {
    let Some(Value::Object(leads)) = batch.get("leads") else {
        return false;
    };
    leads.iter().all(|(key, lead)| {
        lead.get("name")
            .and_then(Value::as_str)
            .is_some_and(|name| is_key_for(key, name))
    })
}

/// Rewrites every batch into the canonical `{metadata?, leads: {<name>: lead}}`
/// shape so that leads are addressable by name.
///
/// Lead values are carried over verbatim. A later lead with the same name
/// replaces the earlier one; distinct names that sanitize to the same key get
/// a numeric suffix. Malformed nodes are dropped and counted.
pub fn normalize_tree(tree: &Value) -> (Value, NormalizeReport) {
    let mut report = NormalizeReport::default();
    let mut out = Map::new();

    let Some(cities) = children(tree) else {
        return (Value::Object(out), report);
    };

    for (city, city_node) in cities {
        let Some(types) = children(city_node) else {
            report.dropped_nodes += 1;
            continue;
        };
        let mut city_out = Map::new();

        for (business_type, type_node) in types {
            let Some(batches) = children(type_node) else {
                report.dropped_nodes += 1;
                continue;
            };
            let mut type_out = Map::new();

            for (batch_key, batch_value) in batches {
                report.batches += 1;
                let mut malformed = Vec::new();
                let path = format!("{}/{}/{}", city, business_type, batch_key);
                let Some(raw) = RawBatch::split(&path, batch_value, &mut malformed) else {
                    report.dropped_nodes += 1;
                    continue;
                };

                let mut batch_out = Map::new();
                let entries = match raw {
                    RawBatch::Leads(entries) => {
                        // Everything beside the container (metadata, source, ...) is kept.
                        if let Value::Object(fields) = batch_value {
                            for (key, value) in fields.iter().filter(|(k, _)| *k != "leads") {
                                batch_out.insert(key.clone(), value.clone());
                            }
                        }
                        entries
                    }
                    RawBatch::Single(value) => vec![(String::new(), value)],
                };

                let mut leads = Map::new();
                let mut keys = BatchKeys::default();
                for (slot, raw_lead) in entries {
                    let name = match serde_json::from_value::<Lead>(raw_lead.clone()) {
                        Ok(lead) => lead.name,
                        Err(e) => {
                            tracing::warn!("Dropping unreadable lead {}/{}: {}", path, slot, e);
                            report.dropped_nodes += 1;
                            continue;
                        }
                    };
                    let key = keys.claim(&name, &slot);
                    leads.insert(key, raw_lead.clone());
                }

                report.leads += leads.len();
                batch_out.insert("leads".to_string(), Value::Object(leads));
                let batch_out = Value::Object(batch_out);
                if batch_out != *batch_value {
                    report.rewritten_batches += 1;
                }
                type_out.insert(batch_key, batch_out);
            }

            if !type_out.is_empty() {
                city_out.insert(business_type, Value::Object(type_out));
            }
        }

        if !city_out.is_empty() {
            out.insert(city, Value::Object(city_out));
        }
    }

    (Value::Object(out), report)
}

/// Lead keys handed out within one batch.
#[derive(Default)]
struct BatchKeys {
    by_name: HashMap<String, String>,
    taken: HashSet<String>,
}

impl BatchKeys {
    /// Returns the key for `name`. The same name always maps to the same key;
    /// a current key that already fits the name is kept.
    fn claim(&mut self, name: &str, current: &str) -> String {
        if let Some(key) = self.by_name.get(name) {
            return key.clone();
        }

        let key = if is_key_for(current, name) && !self.taken.contains(current) {
            current.to_string()
        } else {
            let base = sanitize_key(name);
            let mut key = base.clone();
            let mut n = 1;
            while self.taken.contains(&key) {
                n += 1;
                key = format!("{}_{}", base, n);
            }
            key
        };

        self.taken.insert(key.clone());
        self.by_name.insert(name.to_string(), key.clone());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lead(name: &str, score: f64) -> Value {
        json!({
            "name": name,
            "phone": "512-472-3400",
            "overall_score": score,
            "analysis": {
                "tech_stack": {"score": 5},
                "operations": {"score": 5},
                "growth_potential": {"score": 5},
                "software_opportunity": {"score": 5}
            }
        })
    }

    #[test]
    fn test_flattens_both_batch_shapes() {
        let tree = json!({
            "Austin": {
                "plumber": {
                    "b1": {"metadata": {"total_leads": 2}, "leads": [lead("A", 8.0), lead("B", 3.0)]},
                    "b2": lead("C", 6.0)
                }
            },
            "Dallas": {
                "dentist": {
                    "b3": {"leads": {"D": lead("D", 9.0)}}
                }
            }
        });

        let snapshot = flatten(&tree);
        assert!(snapshot.malformed.is_empty());
        let names: Vec<_> = snapshot.records.iter().map(|r| r.lead.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C", "D"]);

        let a = &snapshot.records[0];
        assert_eq!(a.city, "Austin");
        assert_eq!(a.business_type, "plumber");
        assert_eq!(a.batch_key, "b1");
        assert_eq!(a.slot, LeadSlot::Entry("0".into()));
        assert_eq!(snapshot.records[2].slot, LeadSlot::BatchNode);
        assert_eq!(snapshot.records[3].slot, LeadSlot::Entry("D".into()));
    }

    #[test]
    fn test_null_batch_is_skipped_not_fatal() {
        let tree = json!({
            "Austin": {
                "plumber": {
                    "b1": {"leads": [lead("A", 8.0)]},
                    "broken": null,
                    "b2": {"leads": [lead("B", 4.0)]}
                }
            }
        });

        let snapshot = flatten(&tree);
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.malformed.len(), 1);
        assert_eq!(snapshot.malformed[0].path, "Austin/plumber/broken");
    }

    #[test]
    fn test_bad_lead_inside_batch_only_drops_that_lead() {
        let tree = json!({
            "Austin": {"plumber": {"b1": {"leads": [
                lead("A", 8.0),
                {"name": "no score"},
                null,
                lead("B", 2.0)
            ]}}}
        });

        let snapshot = flatten(&tree);
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.records[1].slot, LeadSlot::Entry("3".into()));
        assert_eq!(snapshot.malformed.len(), 1);
        assert_eq!(snapshot.malformed[0].path, "Austin/plumber/b1/leads/1");
    }

    #[test]
    fn test_unrecognized_shapes_are_reported() {
        let tree = json!({
            "Austin": {
                "plumber": {"b1": {"status": "done"}, "b2": 42, "b3": {"leads": "nope"}},
                "roofer": "oops"
            }
        });

        let snapshot = flatten(&tree);
        assert!(snapshot.records.is_empty());
        assert_eq!(snapshot.malformed.len(), 4);
    }

    #[test]
    fn test_duplicate_identity_last_wins_in_place() {
        let tree = json!({
            "Austin": {"plumber": {"b1": {"leads": [
                lead("A", 1.0),
                lead("B", 2.0),
                lead("A", 9.0)
            ]}}}
        });

        let snapshot = flatten(&tree);
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.records[0].lead.name, "A");
        assert_eq!(snapshot.records[0].score(), 9.0);
        assert_eq!(snapshot.records[0].slot, LeadSlot::Entry("2".into()));
    }

    #[test]
    fn test_empty_and_non_object_roots() {
        assert_eq!(flatten(&Value::Null), Snapshot::default());
        let snapshot = flatten(&json!("garbage"));
        assert!(snapshot.records.is_empty());
        assert_eq!(snapshot.malformed.len(), 1);
    }

    #[test]
    fn test_put_and_patch_maintain_tree() {
        let mut tree = Value::Null;
        apply_put(
            &mut tree,
            "/",
            json!({"Austin": {"plumber": {"b1": {"leads": [lead("A", 8.0), lead("B", 3.0)]}}}}),
        );
        assert_eq!(flatten(&tree).records.len(), 2);

        apply_patch(
            &mut tree,
            "/Austin/plumber/b1/leads/1",
            json!({"notes": "call back friday", "called": true}),
        );
        let snapshot = flatten(&tree);
        let b = snapshot.records.iter().find(|r| r.lead.name == "B").unwrap();
        assert_eq!(b.lead.notes, "call back friday");
        assert!(b.lead.called);
        assert_eq!(b.slot, LeadSlot::Entry("1".into()));

        apply_put(&mut tree, "/Austin/plumber/b1/leads/0", Value::Null);
        let snapshot = flatten(&tree);
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].lead.name, "B");

        apply_put(&mut tree, "/Dallas/dentist/b9", lead("Z", 5.0));
        assert_eq!(flatten(&tree).records.len(), 2);

        // Deleting below a missing parent is a no-op.
        apply_put(&mut tree, "/Houston/x/y", Value::Null);
        assert_eq!(flatten(&tree).records.len(), 2);
    }

    #[test]
    fn test_normalize_tree_keys_leads_by_name() {
        let tree = json!({
            "Austin": {"plumber": {
                "b1": {"metadata": {"total_leads": 2}, "leads": [lead("Joe's #1 Plumbing", 8.0), lead("B", 3.0)]},
                "b2": lead("C", 6.0),
                "b3": {"leads": {"D": lead("D", 1.0)}},
                "bad": null
            }}
        });

        let (normalized, report) = normalize_tree(&tree);
        assert_eq!(report.batches, 4);
        assert_eq!(report.rewritten_batches, 2);
        assert_eq!(report.leads, 4);
        assert_eq!(report.dropped_nodes, 1);

        let b1 = &normalized["Austin"]["plumber"]["b1"];
        assert_eq!(b1["metadata"]["total_leads"], json!(2));
        assert!(b1["leads"].get("Joe's _1 Plumbing").is_some());
        assert!(normalized["Austin"]["plumber"]["b2"]["leads"].get("C").is_some());

        let snapshot = flatten(&normalized);
        assert_eq!(snapshot.records.len(), 4);
        assert!(snapshot
            .records
            .iter()
            .all(|r| matches!(r.slot, LeadSlot::Entry(_))));
    }

    #[test]
    fn test_normalize_tree_keeps_names_that_sanitize_alike() {
        let tree = json!({
            "Austin": {"plumber": {
                "b1": {"leads": [lead("A.B", 4.0), lead("A_B", 5.0), lead("A.B", 6.0)]}
            }}
        });
        let before = flatten(&tree);

        let (normalized, report) = normalize_tree(&tree);
        assert_eq!(report.leads, 2);
        assert_eq!(report.dropped_nodes, 0);

        let leads = &normalized["Austin"]["plumber"]["b1"]["leads"];
        assert_eq!(leads["A_B"]["name"], json!("A.B"));
        assert_eq!(leads["A_B"]["overall_score"], json!(6.0));
        assert_eq!(leads["A_B_2"]["name"], json!("A_B"));

        let after = flatten(&normalized);
        assert_eq!(after.records.len(), before.records.len());

        let (again, second) = normalize_tree(&normalized);
        assert_eq!(second.rewritten_batches, 0);
        assert_eq!(again, normalized);
    }

    #[test]
    fn test_normalize_tree_carries_lead_and_batch_fields_verbatim() {
        let mut odd = lead("Ace Pipes", 7.0);
        odd["calledAt"] = json!("yesterday-ish");
        odd["crm_id"] = json!(991);
        let tree = json!({
            "Austin": {"plumber": {
                "b1": {"metadata": {"total_leads": 1}, "source": "maps", "leads": [odd.clone()]}
            }}
        });

        let (normalized, report) = normalize_tree(&tree);
        assert_eq!(report.rewritten_batches, 1);

        let b1 = &normalized["Austin"]["plumber"]["b1"];
        assert_eq!(b1["source"], json!("maps"));
        assert_eq!(b1["metadata"]["total_leads"], json!(1));
        assert_eq!(b1["leads"]["Ace Pipes"], odd);
    }
}
