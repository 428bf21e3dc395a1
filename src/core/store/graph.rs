//! Knowledge-graph row operations. Each write validates and commits inside
//! its own SAVEPOINT so one malformed entity or relationship rolls back
//! alone instead of losing the whole batch.

use anyhow::{Result, anyhow};
use rusqlite::params;

use super::CaseStore;
use super::types::{EntityRecord, RelationshipRecord};

const ENTITY_COLUMNS: &str = "seq, entity_id, case_id, name, normalized_name, entity_type, source_domain, confidence, properties_json, merged_into, merge_count, degree";

#[derive(Debug, Clone)]
pub struct NewEntity {
    pub name: String,
    pub entity_type: String,
    pub source_domain: String,
    pub confidence: i64,
    pub properties_json: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewRelationship {
    pub source_id: String,
    pub target_id: String,
    pub rel_type: String,
    pub label: String,
    pub strength: i64,
}

impl CaseStore {
    /// Insert one entity. Empty names and out-of-range confidence are
    /// rejected here so the caller's per-item loop can skip just this item.
    pub async fn insert_entity(
        &self,
        case_id: &str,
        normalized_name: &str,
        new: &NewEntity,
    ) -> Result<EntityRecord> {
        let mut db = self.db.lock().await;
        let sp = db.savepoint()?;

        if new.name.trim().is_empty() {
            return Err(anyhow!("entity name is empty"));
        }
        if !(0..=100).contains(&new.confidence) {
            return Err(anyhow!(
                "entity '{}' confidence {} outside 0-100",
                new.name,
                new.confidence
            ));
        }

        let entity_id = uuid::Uuid::new_v4().to_string();
        sp.execute(
            "INSERT INTO kg_entities
             (entity_id, case_id, name, normalized_name, entity_type, source_domain, confidence, properties_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entity_id,
                case_id,
                new.name,
                normalized_name,
                new.entity_type,
                new.source_domain,
                new.confidence,
                new.properties_json
            ],
        )?;
        let rec = sp.query_row(
            &format!("SELECT {ENTITY_COLUMNS} FROM kg_entities WHERE entity_id = ?1"),
            params![entity_id],
            Self::map_entity,
        )?;
        sp.commit()?;
        Ok(rec)
    }

    /// Insert a directed edge, or strengthen the existing edge with the same
    /// (source, target, type). Strength saturates at 100. Both endpoints must
    /// exist within the same case.
    pub async fn insert_or_strengthen_relationship(
        &self,
        case_id: &str,
        new: &NewRelationship,
    ) -> Result<RelationshipRecord> {
        let mut db = self.db.lock().await;
        let sp = db.savepoint()?;

        for endpoint in [&new.source_id, &new.target_id] {
            let found: Option<String> = sp
                .query_row(
                    "SELECT case_id FROM kg_entities WHERE entity_id = ?1",
                    params![endpoint],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            match found {
                None => return Err(anyhow!("relationship endpoint {} not found", endpoint)),
                Some(owner) if owner != case_id => {
                    return Err(anyhow!(
                        "relationship endpoint {} belongs to another case",
                        endpoint
                    ));
                }
                Some(_) => {}
            }
        }

        let strength = new.strength.clamp(0, 100);
        let updated = sp.execute(
            "UPDATE kg_relationships SET strength = MIN(100, strength + ?1)
             WHERE case_id = ?2 AND source_id = ?3 AND target_id = ?4 AND rel_type = ?5",
            params![strength, case_id, new.source_id, new.target_id, new.rel_type],
        )?;
        let relationship_id = if updated > 0 {
            sp.query_row(
                "SELECT relationship_id FROM kg_relationships
                 WHERE case_id = ?1 AND source_id = ?2 AND target_id = ?3 AND rel_type = ?4",
                params![case_id, new.source_id, new.target_id, new.rel_type],
                |row| row.get::<_, String>(0),
            )?
        } else {
            let relationship_id = uuid::Uuid::new_v4().to_string();
            sp.execute(
                "INSERT INTO kg_relationships
                 (relationship_id, case_id, source_id, target_id, rel_type, label, strength)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    relationship_id,
                    case_id,
                    new.source_id,
                    new.target_id,
                    new.rel_type,
                    new.label,
                    strength
                ],
            )?;
            relationship_id
        };

        let rec = sp.query_row(
            "SELECT relationship_id, case_id, source_id, target_id, rel_type, label, strength
             FROM kg_relationships WHERE relationship_id = ?1",
            params![relationship_id],
            Self::map_relationship,
        )?;
        sp.commit()?;
        Ok(rec)
    }

    /// Entities not yet merged away, in creation order.
    pub async fn list_active_entities(&self, case_id: &str) -> Result<Vec<EntityRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM kg_entities
             WHERE case_id = ?1 AND merged_into IS NULL ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![case_id], Self::map_entity)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Every entity for the case, merged ones included (audit view).
    pub async fn list_entities(&self, case_id: &str) -> Result<Vec<EntityRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM kg_entities WHERE case_id = ?1 ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![case_id], Self::map_entity)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Earliest non-merged entity with the given normalized name, if any.
    pub async fn find_active_entity(
        &self,
        case_id: &str,
        normalized_name: &str,
    ) -> Result<Option<EntityRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM kg_entities
             WHERE case_id = ?1 AND normalized_name = ?2 AND merged_into IS NULL
             ORDER BY seq ASC LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![case_id, normalized_name])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::map_entity(row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn get_entity(&self, entity_id: &str) -> Result<Option<EntityRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM kg_entities WHERE entity_id = ?1 LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![entity_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::map_entity(row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn list_relationships(&self, case_id: &str) -> Result<Vec<RelationshipRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT relationship_id, case_id, source_id, target_id, rel_type, label, strength
             FROM kg_relationships WHERE case_id = ?1 ORDER BY relationship_id ASC",
        )?;
        let rows = stmt.query_map(params![case_id], Self::map_relationship)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Rewrite every edge referencing `from_id` to reference `to_id`.
    /// Returns the number of rewritten rows.
    pub async fn repoint_relationships(
        &self,
        case_id: &str,
        from_id: &str,
        to_id: &str,
    ) -> Result<usize> {
        let mut db = self.db.lock().await;
        let sp = db.savepoint()?;
        let sources = sp.execute(
            "UPDATE kg_relationships SET source_id = ?1 WHERE case_id = ?2 AND source_id = ?3",
            params![to_id, case_id, from_id],
        )?;
        let targets = sp.execute(
            "UPDATE kg_relationships SET target_id = ?1 WHERE case_id = ?2 AND target_id = ?3",
            params![to_id, case_id, from_id],
        )?;
        sp.commit()?;
        Ok(sources + targets)
    }

    /// Set the merge pointer and bump the primary's merge counter in one
    /// step. Refused unless both rows are still un-merged and distinct, which
    /// keeps the merged-into pointers a forest.
    pub async fn soft_merge_entity(&self, entity_id: &str, into_id: &str) -> Result<bool> {
        if entity_id == into_id {
            return Ok(false);
        }
        let mut db = self.db.lock().await;
        let sp = db.savepoint()?;
        let rows = sp.execute(
            "UPDATE kg_entities SET merged_into = ?2
             WHERE entity_id = ?1 AND merged_into IS NULL
               AND (SELECT merged_into FROM kg_entities WHERE entity_id = ?2) IS NULL",
            params![entity_id, into_id],
        )?;
        if rows == 0 {
            return Ok(false);
        }
        sp.execute(
            "UPDATE kg_entities SET merge_count = merge_count + 1 WHERE entity_id = ?1",
            params![into_id],
        )?;
        sp.commit()?;
        Ok(true)
    }

    /// Current edge count per non-merged entity, computed from the
    /// relationship table.
    pub async fn degrees_for_case(&self, case_id: &str) -> Result<Vec<(String, i64)>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT e.entity_id,
                    (SELECT COUNT(*) FROM kg_relationships r
                     WHERE r.case_id = e.case_id
                       AND (r.source_id = e.entity_id OR r.target_id = e.entity_id))
             FROM kg_entities e
             WHERE e.case_id = ?1 AND e.merged_into IS NULL
             ORDER BY e.seq ASC",
        )?;
        let rows = stmt.query_map(params![case_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn set_entity_degree(&self, entity_id: &str, degree: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE kg_entities SET degree = ?1 WHERE entity_id = ?2",
            params![degree, entity_id],
        )?;
        Ok(rows > 0)
    }

    fn map_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
        Ok(EntityRecord {
            seq: row.get(0)?,
            entity_id: row.get(1)?,
            case_id: row.get(2)?,
            name: row.get(3)?,
            normalized_name: row.get(4)?,
            entity_type: row.get(5)?,
            source_domain: row.get(6)?,
            confidence: row.get(7)?,
            properties_json: row.get(8)?,
            merged_into: row.get(9)?,
            merge_count: row.get(10)?,
            degree: row.get(11)?,
        })
    }

    fn map_relationship(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelationshipRecord> {
        Ok(RelationshipRecord {
            relationship_id: row.get(0)?,
            case_id: row.get(1)?,
            source_id: row.get(2)?,
            target_id: row.get(3)?,
            rel_type: row.get(4)?,
            label: row.get(5)?,
            strength: row.get(6)?,
        })
    }
}
