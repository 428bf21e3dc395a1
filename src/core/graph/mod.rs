//! Knowledge-graph build and deduplication. Analyst outputs are ingested
//! item by item (one bad entity never loses the batch), exact duplicates
//! are soft-merged with the audit trail intact, near-duplicates are flagged
//! for later human or higher-tier resolution, and per-entity connection
//! counts are recomputed once the batch has settled.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use crate::core::store::types::EntityRecord;
use crate::core::store::{CaseStore, NewEntity, NewRelationship};

#[derive(Debug, Clone)]
pub struct ExactMerge {
    pub merged_id: String,
    pub into_id: String,
    pub normalized_name: String,
}

#[derive(Debug, Clone)]
pub struct FuzzyFlag {
    pub entity_a: String,
    pub entity_b: String,
    pub name_a: String,
    pub name_b: String,
    pub score: f64,
}

#[derive(Debug, Default)]
pub struct DedupReport {
    pub exact_merges: Vec<ExactMerge>,
    pub fuzzy_flags: Vec<FuzzyFlag>,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub entities_added: usize,
    pub relationships_added: usize,
    pub skipped: usize,
}

static PUNCTUATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s]").expect("valid pattern"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid pattern"));

/// Matching key: lowercase, punctuation stripped, whitespace collapsed.
/// Used only for matching; the display name is never rewritten.
pub fn normalize_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let stripped = PUNCTUATION_RE.replace_all(&lowered, "");
    WHITESPACE_RE
        .replace_all(stripped.trim(), " ")
        .to_string()
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0usize; b_chars.len() + 1];

    for (i, ca) in a_chars.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Normalized similarity in [0, 1]: 1.0 is identical, 0.0 shares nothing.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein_distance(a, b) as f64 / max_len as f64
}

/// Write one analyst's extracted entities and relationships into the graph.
/// Every item commits in its own savepoint; a malformed item is skipped with
/// a warning and the rest of the batch survives.
pub async fn ingest_findings(
    store: &CaseStore,
    case_id: &str,
    source_domain: &str,
    output: &Value,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    let mut name_to_id: HashMap<String, String> = HashMap::new();

    if let Some(entities) = output.get("entities").and_then(|v| v.as_array()) {
        for item in entities {
            let Some(name) = item.get("name").and_then(|v| v.as_str()) else {
                warn!("Skipping entity without a name in [{}]", source_domain);
                report.skipped += 1;
                continue;
            };
            let entity_type = item
                .get("entity_type")
                .or_else(|| item.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let confidence = item
                .get("confidence")
                .and_then(|v| v.as_i64())
                .unwrap_or(50);
            let properties_json = item.get("properties").map(|p| p.to_string());

            let new = NewEntity {
                name: name.to_string(),
                entity_type: entity_type.to_string(),
                source_domain: source_domain.to_string(),
                confidence,
                properties_json,
            };
            let normalized = normalize_name(name);
            match store.insert_entity(case_id, &normalized, &new).await {
                Ok(rec) => {
                    report.entities_added += 1;
                    name_to_id.entry(normalized).or_insert(rec.entity_id);
                }
                Err(e) => {
                    warn!("Skipping malformed entity '{}': {}", name, e);
                    report.skipped += 1;
                }
            }
        }
    }

    if let Some(relationships) = output.get("relationships").and_then(|v| v.as_array()) {
        for item in relationships {
            let source = item.get("source").and_then(|v| v.as_str());
            let target = item.get("target").and_then(|v| v.as_str());
            let (Some(source), Some(target)) = (source, target) else {
                warn!("Skipping relationship without endpoints in [{}]", source_domain);
                report.skipped += 1;
                continue;
            };
            let rel_type = item
                .get("rel_type")
                .or_else(|| item.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or("related_to");
            let label = item.get("label").and_then(|v| v.as_str()).unwrap_or(rel_type);
            let strength = item.get("strength").and_then(|v| v.as_i64()).unwrap_or(50);

            let source_id = resolve_entity(store, case_id, source, &name_to_id).await;
            let target_id = resolve_entity(store, case_id, target, &name_to_id).await;
            let (Some(source_id), Some(target_id)) = (source_id, target_id) else {
                warn!(
                    "Skipping relationship [{}] -> [{}]: unresolved endpoint",
                    source, target
                );
                report.skipped += 1;
                continue;
            };

            let new = NewRelationship {
                source_id,
                target_id,
                rel_type: rel_type.to_string(),
                label: label.to_string(),
                strength,
            };
            match store.insert_or_strengthen_relationship(case_id, &new).await {
                Ok(_) => report.relationships_added += 1,
                Err(e) => {
                    warn!("Skipping malformed relationship: {}", e);
                    report.skipped += 1;
                }
            }
        }
    }

    Ok(report)
}

async fn resolve_entity(
    store: &CaseStore,
    case_id: &str,
    name: &str,
    batch: &HashMap<String, String>,
) -> Option<String> {
    let normalized = normalize_name(name);
    if let Some(id) = batch.get(&normalized) {
        return Some(id.clone());
    }
    match store.find_active_entity(case_id, &normalized).await {
        Ok(Some(rec)) => Some(rec.entity_id),
        _ => None,
    }
}

/// Merge exact duplicates and flag near-duplicates across the whole case.
///
/// Entities are partitioned by type but not by source domain, so the same
/// party found by two analysts collapses into one node. Within a type,
/// entities sharing a normalized name soft-merge into the earliest-created
/// one; relationships are repointed before the merge pointer is written so
/// no edge ever references a merged-away node. Pairs of distinct names
/// scoring at or above `fuzzy_threshold` are reported, never auto-merged.
pub async fn deduplicate(
    store: &CaseStore,
    case_id: &str,
    fuzzy_threshold: f64,
) -> Result<DedupReport> {
    let mut report = DedupReport::default();
    let entities = store.list_active_entities(case_id).await?;

    let mut by_type: BTreeMap<String, Vec<&EntityRecord>> = BTreeMap::new();
    for entity in &entities {
        by_type.entry(entity.entity_type.clone()).or_default().push(entity);
    }

    for (entity_type, members) in &by_type {
        // Members arrive in seq order, so the first of each name group is
        // the earliest-created and becomes primary.
        let mut by_name: BTreeMap<&str, Vec<&EntityRecord>> = BTreeMap::new();
        for entity in members {
            by_name
                .entry(entity.normalized_name.as_str())
                .or_default()
                .push(entity);
        }

        for (normalized, group) in &by_name {
            if group.len() < 2 {
                continue;
            }
            let primary = group[0];
            for duplicate in &group[1..] {
                store
                    .repoint_relationships(case_id, &duplicate.entity_id, &primary.entity_id)
                    .await?;
                if store
                    .soft_merge_entity(&duplicate.entity_id, &primary.entity_id)
                    .await?
                {
                    info!(
                        "Merged [{}] into [{}] ({} '{}')",
                        duplicate.entity_id, primary.entity_id, entity_type, normalized
                    );
                    report.exact_merges.push(ExactMerge {
                        merged_id: duplicate.entity_id.clone(),
                        into_id: primary.entity_id.clone(),
                        normalized_name: (*normalized).to_string(),
                    });
                }
            }
        }

        // Near-duplicate pass over the surviving distinct names.
        let names: Vec<(&str, &EntityRecord)> = by_name
            .iter()
            .map(|(name, group)| (*name, group[0]))
            .collect();
        for i in 0..names.len() {
            for j in (i + 1)..names.len() {
                let (name_a, entity_a) = names[i];
                let (name_b, entity_b) = names[j];
                let score = similarity(name_a, name_b);
                if score >= fuzzy_threshold {
                    info!(
                        "Near-duplicate candidates in [{}]: '{}' ~ '{}' ({:.2})",
                        entity_type, name_a, name_b, score
                    );
                    report.fuzzy_flags.push(FuzzyFlag {
                        entity_a: entity_a.entity_id.clone(),
                        entity_b: entity_b.entity_id.clone(),
                        name_a: entity_a.name.clone(),
                        name_b: entity_b.name.clone(),
                        score,
                    });
                }
            }
        }
    }

    Ok(report)
}

/// Recount, for every non-merged entity, the edges touching it, and write
/// the counts back. Must run only after the current batch's merges and
/// repoints have committed; a degree computed mid-merge would undercount.
pub async fn compute_degrees(store: &CaseStore, case_id: &str) -> Result<usize> {
    let degrees = store.degrees_for_case(case_id).await?;
    let mut updated = 0;
    for (entity_id, degree) in degrees {
        if store.set_entity_degree(&entity_id, degree).await? {
            updated += 1;
        }
    }
    Ok(updated)
}
