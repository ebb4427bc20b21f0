//! SQLite-backed tier store implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Days, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::schema::{initialize_schema, is_initialized, SCHEMA_VERSION};
use crate::memory::types::*;

/// Persistence contract for lifecycle state.
///
/// Every mutation of a single item's row is one statement or one
/// transaction, so concurrent workers sharing a database never observe a
/// tier change without its audit record.
pub trait TierStore: Send + Sync {
    /// Fetch an item's metric, or `NotFound`.
    fn get(&self, item_id: &str) -> Result<TierMetric>;

    /// Insert or overwrite an item's metric. Does not audit.
    fn upsert(&self, metric: &TierMetric) -> Result<()>;

    /// Insert an L0 row unless the item already exists. Returns the stored
    /// metric and whether it was created.
    fn create_if_absent(&self, item_id: &str) -> Result<(TierMetric, bool)>;

    /// Append an audit record.
    fn append_audit(&self, record: &NewAuditRecord) -> Result<AuditRecord>;

    /// All items currently in `tier`.
    fn list_by_tier(&self, tier: Tier) -> Result<Vec<TierMetric>>;

    /// Item counts per tier; every tier is present.
    fn counts_by_tier(&self) -> Result<HashMap<Tier, u64>>;

    /// Audit records, newest first.
    fn audit_log(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>>;

    /// Persist a forgetting measurement, returning its id.
    fn record_forgetting(&self, metric: &ForgettingMetric) -> Result<i64>;

    /// Daily forgetting aggregates for the last `window_days` calendar days
    /// (today included), ascending by date.
    fn forgetting_trends(&self, window_days: u32) -> Result<Vec<TrendPoint>>;

    /// Conditionally move `audit.item_id` from `audit.from_tier` to
    /// `audit.to_tier` and append `audit`, atomically.
    fn transition(&self, audit: &NewAuditRecord) -> Result<TransitionWrite>;

    /// Insert a new item at an explicit tier together with its `place` record.
    fn place(&self, metric: &TierMetric, audit: &NewAuditRecord) -> Result<AuditRecord>;

    /// Record a reprocessing pass. Returns `false` when the stored cycle is
    /// already newer than `cycle`.
    fn record_update(&self, item_id: &str, cycle: u64, refresh: &MetricRefresh) -> Result<bool>;

    /// Promotions and demotions audited since `since`.
    fn transition_counts_since(&self, since: DateTime<Utc>) -> Result<(u64, u64)>;

    /// Remove an item's metric row. Audit history is kept.
    fn purge(&self, item_id: &str) -> Result<bool>;
}

/// SQLite-backed tier store.
#[derive(Clone)]
pub struct SqliteTierStore {
    conn: Arc<Mutex<Connection>>,
}

const METRIC_COLUMNS: &str = "item_id, tier, surprise_score, retrieval_count_7d, retrieval_count_30d,
     validator_overlap, last_promoted_at, last_demoted_at, last_update_cycle,
     created_at, updated_at";

const AUDIT_COLUMNS: &str = "id, item_id, action, from_tier, to_tier, reason, surprise_score,
     retrieval_count_7d, validator_overlap, performed_by, created_at";

impl SqliteTierStore {
    /// Open or create a tier store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        initialize_schema(&conn)?;
        debug!(path = %path.as_ref().display(), version = SCHEMA_VERSION, "Opened tier store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        initialize_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Whether the schema has been created on this connection.
    pub fn is_initialized(&self) -> bool {
        self.with_conn(|conn| Ok(is_initialized(conn)))
            .unwrap_or(false)
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::StoreUnavailable(format!("Failed to lock connection: {}", e)))?;
        f(&mut conn)
    }

    fn row_to_metric(row: &Row) -> rusqlite::Result<TierMetric> {
        Ok(TierMetric {
            item_id: row.get(0)?,
            tier: tier_column(row, 1)?,
            surprise_score: row.get(2)?,
            retrieval_count_7d: row.get(3)?,
            retrieval_count_30d: row.get(4)?,
            validator_overlap: row.get(5)?,
            last_promoted_at: opt_ts_column(row, 6)?,
            last_demoted_at: opt_ts_column(row, 7)?,
            last_update_cycle: row.get::<_, i64>(8)?.max(0) as u64,
            created_at: ts_column(row, 9)?,
            updated_at: ts_column(row, 10)?,
        })
    }

    fn row_to_audit(row: &Row) -> rusqlite::Result<AuditRecord> {
        let action_str: String = row.get(2)?;
        let action = AuditAction::parse(&action_str)
            .ok_or_else(|| conversion_error(2, format!("unknown audit action {action_str}")))?;

        let from_tier = match row.get::<_, Option<String>>(3)? {
            Some(s) => Some(
                Tier::parse(&s).ok_or_else(|| conversion_error(3, format!("unknown tier {s}")))?,
            ),
            None => None,
        };

        Ok(AuditRecord {
            id: row.get(0)?,
            item_id: row.get(1)?,
            action,
            from_tier,
            to_tier: tier_column(row, 4)?,
            reason: row.get(5)?,
            surprise_score: row.get(6)?,
            retrieval_count_7d: row.get(7)?,
            validator_overlap: row.get(8)?,
            performed_by: row.get(9)?,
            created_at: ts_column(row, 10)?,
        })
    }

    fn get_in(conn: &Connection, item_id: &str) -> Result<Option<TierMetric>> {
        let metric = conn
            .query_row(
                &format!("SELECT {METRIC_COLUMNS} FROM tier_metrics WHERE item_id = ?1"),
                params![item_id],
                Self::row_to_metric,
            )
            .optional()?;
        Ok(metric)
    }

    fn insert_audit(tx: &Transaction, record: &NewAuditRecord) -> Result<AuditRecord> {
        let now = Utc::now();
        tx.execute(
            "INSERT INTO audit_log (
                item_id, action, from_tier, to_tier, reason, surprise_score,
                retrieval_count_7d, validator_overlap, performed_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.item_id,
                record.action.as_str(),
                record.from_tier.map(|t| t.as_str()),
                record.to_tier.as_str(),
                record.reason,
                clamp_unit(record.surprise_score),
                record.retrieval_count_7d,
                clamp_unit(record.validator_overlap),
                record.performed_by,
                format_ts(&now),
            ],
        )?;

        Ok(AuditRecord {
            id: tx.last_insert_rowid(),
            item_id: record.item_id.clone(),
            action: record.action,
            from_tier: record.from_tier,
            to_tier: record.to_tier,
            reason: record.reason.clone(),
            surprise_score: clamp_unit(record.surprise_score),
            retrieval_count_7d: record.retrieval_count_7d,
            validator_overlap: clamp_unit(record.validator_overlap),
            performed_by: record.performed_by.clone(),
            created_at: parse_ts(&format_ts(&now)).unwrap_or(now),
        })
    }

    fn insert_metric(tx: &Transaction, metric: &TierMetric, now: &DateTime<Utc>) -> Result<()> {
        tx.execute(
            &format!(
                "INSERT INTO tier_metrics ({METRIC_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)"
            ),
            params![
                metric.item_id,
                metric.tier.as_str(),
                clamp_unit(metric.surprise_score),
                metric.retrieval_count_7d,
                metric.retrieval_count_30d,
                clamp_unit(metric.validator_overlap),
                metric.last_promoted_at.as_ref().map(format_ts),
                metric.last_demoted_at.as_ref().map(format_ts),
                metric.last_update_cycle as i64,
                format_ts(now),
            ],
        )?;
        Ok(())
    }
}

impl TierStore for SqliteTierStore {
    fn get(&self, item_id: &str) -> Result<TierMetric> {
        self.with_conn(|conn| Self::get_in(conn, item_id))?
            .ok_or_else(|| Error::not_found(item_id))
    }

    fn upsert(&self, metric: &TierMetric) -> Result<()> {
        self.with_conn(|conn| {
            let now = format_ts(&Utc::now());
            conn.execute(
                &format!(
                    "INSERT INTO tier_metrics ({METRIC_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                     ON CONFLICT(item_id) DO UPDATE SET
                        tier = excluded.tier,
                        surprise_score = excluded.surprise_score,
                        retrieval_count_7d = excluded.retrieval_count_7d,
                        retrieval_count_30d = excluded.retrieval_count_30d,
                        validator_overlap = excluded.validator_overlap,
                        last_promoted_at = excluded.last_promoted_at,
                        last_demoted_at = excluded.last_demoted_at,
                        last_update_cycle = excluded.last_update_cycle,
                        updated_at = excluded.updated_at"
                ),
                params![
                    metric.item_id,
                    metric.tier.as_str(),
                    clamp_unit(metric.surprise_score),
                    metric.retrieval_count_7d,
                    metric.retrieval_count_30d,
                    clamp_unit(metric.validator_overlap),
                    metric.last_promoted_at.as_ref().map(format_ts),
                    metric.last_demoted_at.as_ref().map(format_ts),
                    metric.last_update_cycle as i64,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    fn create_if_absent(&self, item_id: &str) -> Result<(TierMetric, bool)> {
        self.with_conn(|conn| {
            let now = format_ts(&Utc::now());
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO tier_metrics (item_id, tier, created_at, updated_at)
                 VALUES (?1, 'L0', ?2, ?2)",
                params![item_id, now],
            )?;
            let metric = Self::get_in(conn, item_id)?.ok_or_else(|| Error::not_found(item_id))?;
            Ok((metric, inserted > 0))
        })
    }

    fn append_audit(&self, record: &NewAuditRecord) -> Result<AuditRecord> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let audit = Self::insert_audit(&tx, record)?;
            tx.commit()?;
            Ok(audit)
        })
    }

    fn list_by_tier(&self, tier: Tier) -> Result<Vec<TierMetric>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {METRIC_COLUMNS} FROM tier_metrics WHERE tier = ?1 ORDER BY item_id"
            ))?;
            let metrics = stmt
                .query_map(params![tier.as_str()], Self::row_to_metric)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(metrics)
        })
    }

    fn counts_by_tier(&self) -> Result<HashMap<Tier, u64>> {
        self.with_conn(|conn| {
            let mut counts: HashMap<Tier, u64> = Tier::ALL.iter().map(|t| (*t, 0)).collect();
            let mut stmt = conn.prepare("SELECT tier, COUNT(*) FROM tier_metrics GROUP BY tier")?;
            let rows = stmt.query_map([], |row| Ok((tier_column(row, 0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (tier, count) = row?;
                counts.insert(tier, count.max(0) as u64);
            }
            Ok(counts)
        })
    }

    fn audit_log(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        self.with_conn(|conn| {
            let limit = query.limit as i64;
            let offset = query.offset as i64;

            let records = match query.item_id {
                Some(ref item_id) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE item_id = ?1
                         ORDER BY id DESC LIMIT ?2 OFFSET ?3"
                    ))?;
                    let rows = stmt.query_map(params![item_id, limit, offset], Self::row_to_audit)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {AUDIT_COLUMNS} FROM audit_log ORDER BY id DESC LIMIT ?1 OFFSET ?2"
                    ))?;
                    let rows = stmt.query_map(params![limit, offset], Self::row_to_audit)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
            };

            Ok(records)
        })
    }

    fn record_forgetting(&self, metric: &ForgettingMetric) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO forgetting_metrics (
                    regression_item_id, regression_query, recall_at_k_before, recall_at_k_after,
                    forgetting_delta, faithfulness_score, overlap_score,
                    evaluation_timestamp, knowledge_update_timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    metric.regression_item_id,
                    metric.regression_query,
                    metric.recall_at_k_before,
                    metric.recall_at_k_after,
                    metric.recall_at_k_before - metric.recall_at_k_after,
                    metric.faithfulness_score,
                    metric.overlap_score,
                    format_ts(&metric.evaluation_timestamp),
                    metric.knowledge_update_timestamp.as_ref().map(format_ts),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn forgetting_trends(&self, window_days: u32) -> Result<Vec<TrendPoint>> {
        if window_days == 0 {
            return Ok(Vec::new());
        }

        // Windows reaching past chrono's date range have no lower bound
        let cutoff = Utc::now()
            .date_naive()
            .checked_sub_days(Days::new(u64::from(window_days) - 1))
            .map(|first_day| first_day.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "0000-01-01".to_string());

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT substr(evaluation_timestamp, 1, 10) AS day,
                        AVG(forgetting_delta), AVG(recall_at_k_before), AVG(recall_at_k_after),
                        COUNT(*)
                 FROM forgetting_metrics
                 WHERE evaluation_timestamp >= ?1
                 GROUP BY day
                 ORDER BY day ASC",
            )?;

            let points = stmt
                .query_map(params![cutoff], |row| {
                    let day: String = row.get(0)?;
                    let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                        .map_err(|e| conversion_error(0, e.to_string()))?;
                    Ok(TrendPoint {
                        date,
                        avg_delta: row.get(1)?,
                        avg_recall_before: row.get(2)?,
                        avg_recall_after: row.get(3)?,
                        count: row.get::<_, i64>(4)?.max(0) as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(points)
        })
    }

    fn transition(&self, audit: &NewAuditRecord) -> Result<TransitionWrite> {
        let expected = audit.from_tier.ok_or_else(|| {
            Error::InvalidInput(format!(
                "transition of {} requires a from_tier snapshot",
                audit.item_id
            ))
        })?;
        let target = audit.to_tier;

        let timestamp_column = match target.cmp(&expected) {
            std::cmp::Ordering::Greater => "last_promoted_at",
            std::cmp::Ordering::Less => "last_demoted_at",
            std::cmp::Ordering::Equal => {
                return Err(Error::InvalidInput(format!(
                    "transition of {} from {} to itself",
                    audit.item_id, expected
                )))
            }
        };

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let now = format_ts(&Utc::now());

            let rows = tx.execute(
                &format!(
                    "UPDATE tier_metrics SET tier = ?1, {timestamp_column} = ?2, updated_at = ?2
                     WHERE item_id = ?3 AND tier = ?4"
                ),
                params![target.as_str(), now, audit.item_id, expected.as_str()],
            )?;

            if rows == 0 {
                // Dropping the transaction rolls it back
                return match Self::get_in(&tx, &audit.item_id)? {
                    Some(current) => Ok(TransitionWrite::Conflict {
                        current: current.tier,
                    }),
                    None => Err(Error::not_found(&audit.item_id)),
                };
            }

            let record = Self::insert_audit(&tx, audit)?;
            let metric =
                Self::get_in(&tx, &audit.item_id)?.ok_or_else(|| Error::not_found(&audit.item_id))?;
            tx.commit()?;

            Ok(TransitionWrite::Applied {
                metric,
                audit: record,
            })
        })
    }

    fn place(&self, metric: &TierMetric, audit: &NewAuditRecord) -> Result<AuditRecord> {
        self.with_conn(|conn| {
            // Take the write lock up front so the existence check and the
            // insert see the same snapshot
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if Self::get_in(&tx, &metric.item_id)?.is_some() {
                return Err(Error::InvalidInput(format!(
                    "{} is already under lifecycle management",
                    metric.item_id
                )));
            }

            Self::insert_metric(&tx, metric, &Utc::now())?;
            let record = Self::insert_audit(&tx, audit)?;
            tx.commit()?;
            Ok(record)
        })
    }

    fn record_update(&self, item_id: &str, cycle: u64, refresh: &MetricRefresh) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE tier_metrics SET
                    last_update_cycle = ?2,
                    surprise_score = COALESCE(?3, surprise_score),
                    retrieval_count_7d = COALESCE(?4, retrieval_count_7d),
                    retrieval_count_30d = COALESCE(?5, retrieval_count_30d),
                    validator_overlap = COALESCE(?6, validator_overlap),
                    updated_at = ?7
                 WHERE item_id = ?1 AND last_update_cycle <= ?2",
                params![
                    item_id,
                    cycle as i64,
                    refresh.surprise_score.map(clamp_unit),
                    refresh.retrieval_count_7d,
                    refresh.retrieval_count_30d,
                    refresh.validator_overlap.map(clamp_unit),
                    format_ts(&Utc::now()),
                ],
            )?;

            if rows > 0 {
                return Ok(true);
            }

            match Self::get_in(conn, item_id)? {
                Some(current) => {
                    debug!(
                        item_id,
                        cycle,
                        stored_cycle = current.last_update_cycle,
                        "Ignoring stale cycle update"
                    );
                    Ok(false)
                }
                None => Err(Error::not_found(item_id)),
            }
        })
    }

    fn transition_counts_since(&self, since: DateTime<Utc>) -> Result<(u64, u64)> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT action, COUNT(*) FROM audit_log
                 WHERE created_at >= ?1 AND action IN ('promote', 'demote')
                 GROUP BY action",
            )?;
            let rows = stmt.query_map(params![format_ts(&since)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let (mut promotions, mut demotions) = (0u64, 0u64);
            for row in rows {
                let (action, count) = row?;
                match AuditAction::parse(&action) {
                    Some(AuditAction::Promote) => promotions = count.max(0) as u64,
                    Some(AuditAction::Demote) => demotions = count.max(0) as u64,
                    _ => {}
                }
            }
            Ok((promotions, demotions))
        })
    }

    fn purge(&self, item_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM tier_metrics WHERE item_id = ?1",
                params![item_id],
            )?;
            Ok(rows > 0)
        })
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(Error::Internal(msg)),
    )
}

fn tier_column(row: &Row, idx: usize) -> rusqlite::Result<Tier> {
    let s: String = row.get(idx)?;
    Tier::parse(&s).ok_or_else(|| conversion_error(idx, format!("unknown tier {s}")))
}

fn ts_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).ok_or_else(|| conversion_error(idx, format!("bad timestamp {s}")))
}

fn opt_ts_column(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => parse_ts(&s)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("bad timestamp {s}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn promote_record(metric: &TierMetric) -> NewAuditRecord {
        let target = metric.tier.next().unwrap();
        NewAuditRecord::from_metric(metric, AuditAction::Promote, target, "test", SYSTEM_ACTOR)
    }

    #[test]
    fn test_upsert_and_get() {
        let store = SqliteTierStore::in_memory().unwrap();
        let metric = TierMetric::new("doc-1")
            .with_surprise(0.42)
            .with_retrieval_counts(3, 11)
            .with_validator_overlap(0.5);

        store.upsert(&metric).unwrap();
        let stored = store.get("doc-1").unwrap();

        assert_eq!(stored.tier, Tier::L0);
        assert_eq!(stored.surprise_score, 0.42);
        assert_eq!(stored.retrieval_count_7d, 3);
        assert_eq!(stored.retrieval_count_30d, 11);
        assert_eq!(stored.last_update_cycle, 0);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let store = SqliteTierStore::in_memory().unwrap();
        assert!(matches!(store.get("nope"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_upsert_overwrites_and_keeps_created_at() {
        let store = SqliteTierStore::in_memory().unwrap();
        store.upsert(&TierMetric::new("doc-1")).unwrap();
        let first = store.get("doc-1").unwrap();

        store
            .upsert(&TierMetric::new("doc-1").with_tier(Tier::L2).with_surprise(0.9))
            .unwrap();
        let second = store.get("doc-1").unwrap();

        assert_eq!(second.tier, Tier::L2);
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn test_create_if_absent() {
        let store = SqliteTierStore::in_memory().unwrap();
        let (metric, created) = store.create_if_absent("doc-1").unwrap();
        assert!(created);
        assert_eq!(metric.tier, Tier::L0);

        store
            .upsert(&TierMetric::new("doc-1").with_tier(Tier::L1))
            .unwrap();
        let (metric, created) = store.create_if_absent("doc-1").unwrap();
        assert!(!created);
        assert_eq!(metric.tier, Tier::L1);
    }

    #[test]
    fn test_counts_by_tier_includes_empty_tiers() {
        let store = SqliteTierStore::in_memory().unwrap();
        store.upsert(&TierMetric::new("a")).unwrap();
        store.upsert(&TierMetric::new("b")).unwrap();
        store.upsert(&TierMetric::new("c").with_tier(Tier::L2)).unwrap();

        let counts = store.counts_by_tier().unwrap();
        assert_eq!(counts.len(), 4);
        assert_eq!(counts[&Tier::L0], 2);
        assert_eq!(counts[&Tier::L1], 0);
        assert_eq!(counts[&Tier::L2], 1);
        assert_eq!(counts[&Tier::L3], 0);

        let l0: Vec<String> = store
            .list_by_tier(Tier::L0)
            .unwrap()
            .into_iter()
            .map(|m| m.item_id)
            .collect();
        assert_eq!(l0, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_transition_applies_and_audits() {
        let store = SqliteTierStore::in_memory().unwrap();
        let metric = TierMetric::new("doc-1").with_surprise(0.7);
        store.upsert(&metric).unwrap();

        let write = store.transition(&promote_record(&metric)).unwrap();
        let TransitionWrite::Applied { metric, audit } = write else {
            panic!("expected applied transition");
        };

        assert_eq!(metric.tier, Tier::L1);
        assert!(metric.last_promoted_at.is_some());
        assert!(metric.last_demoted_at.is_none());
        assert_eq!(audit.from_tier, Some(Tier::L0));
        assert_eq!(audit.to_tier, Tier::L1);
        assert_eq!(audit.surprise_score, 0.7);

        let log = store.audit_log(&AuditQuery::new().item("doc-1")).unwrap();
        assert_eq!(log, vec![audit]);
    }

    #[test]
    fn test_transition_conflict_writes_nothing() {
        let store = SqliteTierStore::in_memory().unwrap();
        let stale = TierMetric::new("doc-1");
        store.upsert(&stale.clone().with_tier(Tier::L1)).unwrap();

        let write = store.transition(&promote_record(&stale)).unwrap();
        assert_eq!(write, TransitionWrite::Conflict { current: Tier::L1 });

        assert_eq!(store.get("doc-1").unwrap().tier, Tier::L1);
        assert!(store.audit_log(&AuditQuery::new()).unwrap().is_empty());
    }

    #[test]
    fn test_transition_missing_item() {
        let store = SqliteTierStore::in_memory().unwrap();
        let ghost = TierMetric::new("ghost");
        let result = store.transition(&promote_record(&ghost));
        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert!(store.audit_log(&AuditQuery::new()).unwrap().is_empty());
    }

    #[test]
    fn test_place_rejects_existing_item() {
        let store = SqliteTierStore::in_memory().unwrap();
        let metric = TierMetric::new("seed").with_tier(Tier::L3);
        let audit = NewAuditRecord {
            from_tier: None,
            ..NewAuditRecord::from_metric(&metric, AuditAction::Place, Tier::L3, "seed", "ops")
        };

        let record = store.place(&metric, &audit).unwrap();
        assert_eq!(record.from_tier, None);
        assert_eq!(store.get("seed").unwrap().tier, Tier::L3);

        assert!(matches!(
            store.place(&metric, &audit),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(store.audit_log(&AuditQuery::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_record_update_is_monotonic() {
        let store = SqliteTierStore::in_memory().unwrap();
        store.upsert(&TierMetric::new("doc-1")).unwrap();

        let refresh = MetricRefresh {
            surprise_score: Some(1.4),
            retrieval_count_7d: Some(5),
            ..Default::default()
        };
        assert!(store.record_update("doc-1", 20, &refresh).unwrap());

        let stored = store.get("doc-1").unwrap();
        assert_eq!(stored.last_update_cycle, 20);
        assert_eq!(stored.surprise_score, 1.0);
        assert_eq!(stored.retrieval_count_7d, 5);

        // Older cycle from a slow worker is ignored
        assert!(!store
            .record_update("doc-1", 10, &MetricRefresh::default())
            .unwrap());
        assert_eq!(store.get("doc-1").unwrap().last_update_cycle, 20);

        assert!(matches!(
            store.record_update("nope", 1, &MetricRefresh::default()),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_audit_log_pagination_newest_first() {
        let store = SqliteTierStore::in_memory().unwrap();
        for i in 0..5 {
            let metric = TierMetric::new(format!("doc-{i}"));
            store.append_audit(&promote_record(&metric)).unwrap();
        }

        let page = store
            .audit_log(&AuditQuery::new().limit(2).offset(1))
            .unwrap();
        let ids: Vec<&str> = page.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, vec!["doc-3", "doc-2"]);
    }

    #[test]
    fn test_transition_counts_since() {
        let store = SqliteTierStore::in_memory().unwrap();
        let metric = TierMetric::new("doc-1").with_tier(Tier::L2);
        store.upsert(&metric).unwrap();
        store.transition(&promote_record(&metric)).unwrap();

        let now = store.get("doc-1").unwrap();
        let demote = NewAuditRecord::from_metric(&now, AuditAction::Demote, Tier::L2, "t", "ops");
        store.transition(&demote).unwrap();

        let since = Utc::now() - Duration::days(7);
        assert_eq!(store.transition_counts_since(since).unwrap(), (1, 1));
        let future = Utc::now() + Duration::days(1);
        assert_eq!(store.transition_counts_since(future).unwrap(), (0, 0));
    }

    #[test]
    fn test_forgetting_trends_group_by_day() {
        let store = SqliteTierStore::in_memory().unwrap();
        let now = Utc::now();
        let yesterday = now - Duration::days(1);
        let long_ago = now - Duration::days(30);

        for (before, after, ts) in [
            (0.9, 0.7, yesterday),
            (0.8, 0.8, yesterday),
            (0.6, 0.9, now),
            (1.0, 0.0, long_ago),
        ] {
            let metric = ForgettingMetric::new("probe", "q", before, after).evaluated_at(ts);
            store.record_forgetting(&metric).unwrap();
        }

        let trends = store.forgetting_trends(7).unwrap();
        assert_eq!(trends.len(), 2);
        assert_eq!(trends[0].date, yesterday.date_naive());
        assert_eq!(trends[0].count, 2);
        assert!((trends[0].avg_delta - 0.1).abs() < 1e-9);
        assert!((trends[0].avg_recall_before - 0.85).abs() < 1e-9);
        assert_eq!(trends[1].date, now.date_naive());
        assert!((trends[1].avg_delta - (-0.3)).abs() < 1e-9);

        assert!(store.forgetting_trends(0).unwrap().is_empty());
    }

    #[test]
    fn test_forgetting_trends_window_beyond_date_range_is_unbounded() {
        let store = SqliteTierStore::in_memory().unwrap();
        let long_ago = Utc::now() - Duration::days(3_650);
        store
            .record_forgetting(&ForgettingMetric::new("probe", "q", 0.9, 0.4).evaluated_at(long_ago))
            .unwrap();
        store
            .record_forgetting(&ForgettingMetric::new("probe", "q", 0.5, 0.5))
            .unwrap();

        for window in [100_000_000, u32::MAX] {
            let trends = store.forgetting_trends(window).unwrap();
            assert_eq!(trends.len(), 2);
            assert_eq!(trends[0].date, long_ago.date_naive());
        }
    }

    #[test]
    fn test_purge_keeps_audit_history() {
        let store = SqliteTierStore::in_memory().unwrap();
        let metric = TierMetric::new("doc-1");
        store.upsert(&metric).unwrap();
        store.transition(&promote_record(&metric)).unwrap();

        assert!(store.purge("doc-1").unwrap());
        assert!(!store.purge("doc-1").unwrap());
        assert!(matches!(store.get("doc-1"), Err(Error::NotFound { .. })));
        assert_eq!(
            store.audit_log(&AuditQuery::new().item("doc-1")).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_two_connections_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiers.db");

        let worker_a = SqliteTierStore::open(&path).unwrap();
        let worker_b = SqliteTierStore::open(&path).unwrap();

        worker_a.upsert(&TierMetric::new("shared")).unwrap();
        let seen_by_a = worker_a.get("shared").unwrap();

        // Worker B wins the race
        worker_b.transition(&promote_record(&seen_by_a)).unwrap();

        let write = worker_a.transition(&promote_record(&seen_by_a)).unwrap();
        assert_eq!(write, TransitionWrite::Conflict { current: Tier::L1 });
        assert_eq!(worker_a.audit_log(&AuditQuery::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_place_after_another_connection_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiers.db");

        let worker_a = SqliteTierStore::open(&path).unwrap();
        let worker_b = SqliteTierStore::open(&path).unwrap();

        let metric = TierMetric::new("seed").with_tier(Tier::L2);
        let audit = NewAuditRecord {
            from_tier: None,
            ..NewAuditRecord::from_metric(&metric, AuditAction::Place, Tier::L2, "seed", "ops")
        };

        worker_a.upsert(&TierMetric::new("other")).unwrap();
        worker_b.place(&metric, &audit).unwrap();

        assert_eq!(worker_a.get("seed").unwrap().tier, Tier::L2);
        assert!(matches!(
            worker_a.place(&metric, &audit),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(worker_b.audit_log(&AuditQuery::new()).unwrap().len(), 1);
    }
}
