use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod models;
use models::*;

/// Thread-safe SQLite handle (single connection behind a mutex).
///
/// Holds the append-only bet ledger and the settlement log. Both survive
/// restarts, which is what keeps the "already bet" check honest after a crash.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Private in-memory database, used by tests and one-off tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Bet ledger ───────────────────────────────────────────────────────────

    /// Append a bet record. Records are never updated or deleted.
    pub fn insert_bet_record(&self, rec: &BetRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bet_records (
                match_id, option_id, match_title, option_text, stake, odds,
                rule, success, endpoint, message, dry_run, submitted_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                rec.match_id,
                rec.option_id,
                rec.match_title,
                rec.option_text,
                rec.stake,
                rec.odds,
                rec.rule,
                rec.success,
                rec.endpoint.map(|e| e.as_str()),
                rec.message,
                rec.dry_run,
                rec.submitted_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// True if a successful wager already exists for this (match, option).
    pub fn has_successful_bet(&self, match_id: &str, option_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bet_records
             WHERE match_id=?1 AND option_id=?2 AND success=1",
            params![match_id, option_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Stake of the successful wager on (match, option), if any.
    pub fn successful_stake(&self, match_id: &str, option_id: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let stake = conn
            .query_row(
                "SELECT stake FROM bet_records
                 WHERE match_id=?1 AND option_id=?2 AND success=1
                 ORDER BY submitted_at ASC LIMIT 1",
                params![match_id, option_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(stake)
    }

    /// List bet records, newest first (paginated)
    pub fn list_bet_records(&self, limit: i64, offset: i64) -> Result<Vec<BetRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, match_id, option_id, match_title, option_text, stake, odds,
                    rule, success, endpoint, message, dry_run, submitted_at
             FROM bet_records ORDER BY submitted_at DESC, id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let records = stmt
            .query_map(params![limit, offset], map_bet_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// All records (successful or not) for one match, oldest first
    pub fn list_bets_for_match(&self, match_id: &str) -> Result<Vec<BetRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, match_id, option_id, match_title, option_text, stake, odds,
                    rule, success, endpoint, message, dry_run, submitted_at
             FROM bet_records WHERE match_id=?1 ORDER BY submitted_at ASC, id ASC",
        )?;
        let records = stmt
            .query_map(params![match_id], map_bet_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Total successfully committed stake since `since` (used to restore the
    /// day's risk counters on startup).
    pub fn committed_stake_since(&self, since: DateTime<Utc>) -> Result<f64> {
        let conn = self.conn.lock();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(stake),0) FROM bet_records
             WHERE success=1 AND submitted_at >= ?1",
            params![since],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    // ── Skipped wagers ───────────────────────────────────────────────────────

    pub fn insert_skipped_wager(&self, s: &SkippedWager) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO skipped_wagers (
                match_id, option_id, match_title, option_text, stake, rule,
                reason_kind, reason, skipped_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                s.match_id,
                s.option_id,
                s.match_title,
                s.option_text,
                s.stake,
                s.rule,
                s.reason_kind,
                s.reason,
                s.skipped_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Skipped wagers, newest first
    pub fn list_skipped_wagers(&self, limit: i64, offset: i64) -> Result<Vec<SkippedWager>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, match_id, option_id, match_title, option_text, stake, rule,
                    reason_kind, reason, skipped_at
             FROM skipped_wagers ORDER BY skipped_at DESC, id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset], |row| {
                Ok(SkippedWager {
                    id: row.get(0)?,
                    match_id: row.get(1)?,
                    option_id: row.get(2)?,
                    match_title: row.get(3)?,
                    option_text: row.get(4)?,
                    stake: row.get(5)?,
                    rule: row.get(6)?,
                    reason_kind: row.get(7)?,
                    reason: row.get(8)?,
                    skipped_at: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Settlements ──────────────────────────────────────────────────────────

    pub fn insert_settlement(&self, s: &Settlement) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settlements (match_id, option_id, stake, payout, recorded_at)
             VALUES (?1,?2,?3,?4,?5)",
            params![s.match_id, s.option_id, s.stake, s.payout, s.recorded_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// True if the wager on (match, option) was already settled.
    pub fn is_settled(&self, match_id: &str, option_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM settlements WHERE match_id=?1 AND option_id=?2",
            params![match_id, option_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Realised loss recorded since `since`.
    pub fn loss_since(&self, since: DateTime<Utc>) -> Result<f64> {
        let conn = self.conn.lock();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(MAX(stake - payout, 0)),0) FROM settlements
             WHERE recorded_at >= ?1",
            params![since],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    /// Get aggregate wagering stats
    pub fn get_stats(&self) -> Result<Stats> {
        let conn = self.conn.lock();
        let successful_bets: i64 = conn
            .query_row("SELECT COUNT(*) FROM bet_records WHERE success=1", [], |r| r.get(0))
            .unwrap_or(0);
        let failed_bets: i64 = conn
            .query_row("SELECT COUNT(*) FROM bet_records WHERE success=0", [], |r| r.get(0))
            .unwrap_or(0);
        let total_staked: f64 = conn
            .query_row(
                "SELECT COALESCE(SUM(stake),0) FROM bet_records WHERE success=1",
                [],
                |r| r.get(0),
            )
            .unwrap_or(0.0);
        let skipped_wagers: i64 = conn
            .query_row("SELECT COUNT(*) FROM skipped_wagers", [], |r| r.get(0))
            .unwrap_or(0);
        let settled_bets: i64 = conn
            .query_row("SELECT COUNT(*) FROM settlements", [], |r| r.get(0))
            .unwrap_or(0);
        let settled_net: f64 = conn
            .query_row(
                "SELECT COALESCE(SUM(payout - stake),0) FROM settlements",
                [],
                |r| r.get(0),
            )
            .unwrap_or(0.0);
        Ok(Stats {
            successful_bets,
            failed_bets,
            total_staked,
            skipped_wagers,
            settled_bets,
            settled_net,
        })
    }

    /// Run raw SQL against the connection (tests use it to inject faults).
    #[cfg(test)]
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_bet_record(row: &rusqlite::Row) -> rusqlite::Result<BetRecord> {
    let endpoint: Option<String> = row.get(9)?;
    Ok(BetRecord {
        id: row.get(0)?,
        match_id: row.get(1)?,
        option_id: row.get(2)?,
        match_title: row.get(3)?,
        option_text: row.get(4)?,
        stake: row.get(5)?,
        odds: row.get(6)?,
        rule: row.get(7)?,
        success: row.get(8)?,
        endpoint: endpoint.as_deref().and_then(Endpoint::parse),
        message: row.get(10)?,
        dry_run: row.get(11)?,
        submitted_at: row.get(12)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS bet_records (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    match_id      TEXT    NOT NULL,
    option_id     TEXT    NOT NULL,
    match_title   TEXT    NOT NULL,
    option_text   TEXT    NOT NULL,
    stake         REAL    NOT NULL,
    odds          REAL    NOT NULL,
    rule          TEXT    NOT NULL,
    success       INTEGER NOT NULL,
    endpoint      TEXT,
    message       TEXT,
    dry_run       INTEGER NOT NULL DEFAULT 0,
    submitted_at  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS skipped_wagers (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    match_id     TEXT    NOT NULL,
    option_id    TEXT    NOT NULL,
    match_title  TEXT    NOT NULL,
    option_text  TEXT    NOT NULL,
    stake        REAL    NOT NULL,
    rule         TEXT    NOT NULL,
    reason_kind  TEXT    NOT NULL,
    reason       TEXT    NOT NULL,
    skipped_at   TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS settlements (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    match_id    TEXT    NOT NULL,
    option_id   TEXT    NOT NULL,
    stake       REAL    NOT NULL,
    payout      REAL    NOT NULL,
    recorded_at TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bet_records_pair ON bet_records(match_id, option_id);
CREATE INDEX IF NOT EXISTS idx_bet_records_submitted ON bet_records(submitted_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_settlements_pair ON settlements(match_id, option_id);
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub successful_bets: i64,
    pub failed_bets: i64,
    pub total_staked: f64,
    /// Wagers the executor refused before submission
    pub skipped_wagers: i64,
    pub settled_bets: i64,
    /// Sum of (payout − stake) over settled wagers
    pub settled_net: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn make_record(match_id: &str, option_id: &str, stake: f64, success: bool) -> BetRecord {
        BetRecord {
            id: None,
            match_id: match_id.into(),
            option_id: option_id.into(),
            match_title: "T1 vs GEN".into(),
            option_text: "T1".into(),
            stake,
            odds: 2.0,
            rule: "fallback".into(),
            success,
            endpoint: success.then_some(Endpoint::Primary),
            message: None,
            dry_run: false,
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_failed_record_does_not_count_as_bet() {
        let db = Database::open_in_memory().unwrap();
        db.insert_bet_record(&make_record("g1", "o1", 100.0, false)).unwrap();
        assert!(!db.has_successful_bet("g1", "o1").unwrap());

        db.insert_bet_record(&make_record("g1", "o1", 100.0, true)).unwrap();
        assert!(db.has_successful_bet("g1", "o1").unwrap());
        assert!(!db.has_successful_bet("g1", "o2").unwrap());
    }

    #[test]
    fn test_records_round_trip_endpoint() {
        let db = Database::open_in_memory().unwrap();
        let mut rec = make_record("g1", "o1", 50.0, true);
        rec.endpoint = Some(Endpoint::Backup);
        db.insert_bet_record(&rec).unwrap();

        let rows = db.list_bets_for_match("g1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].endpoint, Some(Endpoint::Backup));
        assert!(rows[0].id.is_some());
    }

    #[test]
    fn test_committed_stake_since_skips_failures_and_old_rows() {
        let db = Database::open_in_memory().unwrap();
        let mut old = make_record("g0", "o1", 70.0, true);
        old.submitted_at = Utc::now() - Duration::days(2);
        db.insert_bet_record(&old).unwrap();
        db.insert_bet_record(&make_record("g1", "o1", 40.0, true)).unwrap();
        db.insert_bet_record(&make_record("g2", "o1", 25.0, false)).unwrap();

        let since = Utc::now() - Duration::hours(1);
        assert_relative_eq!(db.committed_stake_since(since).unwrap(), 40.0, epsilon = 1e-9);
    }

    #[test]
    fn test_loss_since_ignores_winning_settlements() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        for (opt, payout) in [("o1", 0.0), ("o2", 250.0)] {
            db.insert_settlement(&Settlement {
                id: None,
                match_id: "g1".into(),
                option_id: opt.into(),
                stake: 100.0,
                payout,
                recorded_at: now,
            })
            .unwrap();
        }
        assert_relative_eq!(
            db.loss_since(now - Duration::minutes(1)).unwrap(),
            100.0,
            epsilon = 1e-9
        );
        assert!(db.is_settled("g1", "o2").unwrap());

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.settled_bets, 2);
        assert_relative_eq!(stats.settled_net, 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_skipped_wagers_listed_newest_first_and_counted() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        for (i, kind) in ["budget_exceeded", "duplicate_wager"].iter().enumerate() {
            db.insert_skipped_wager(&SkippedWager {
                id: None,
                match_id: format!("g{}", i),
                option_id: "o1".into(),
                match_title: "T1 vs GEN".into(),
                option_text: "T1".into(),
                stake: 100.0,
                rule: "fallback".into(),
                reason_kind: kind.to_string(),
                reason: "refused".into(),
                skipped_at: now + Duration::seconds(i as i64),
            })
            .unwrap();
        }
        let rows = db.list_skipped_wagers(10, 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].reason_kind, "duplicate_wager");
        assert_eq!(db.get_stats().unwrap().skipped_wagers, 2);
        // skips never count as wagers
        assert!(!db.has_successful_bet("g0", "o1").unwrap());
    }

    #[test]
    fn test_bet_ledger_survives_reopen() {
        let path = std::env::temp_dir().join(format!("autobet-ledger-{}.db", std::process::id()));
        let path = path.to_string_lossy().to_string();
        let _ = std::fs::remove_file(&path);
        {
            let db = Database::open(&path).unwrap();
            db.insert_bet_record(&make_record("g1", "o1", 100.0, true)).unwrap();
        }
        let reopened = Database::open(&path).unwrap();
        assert!(reopened.has_successful_bet("g1", "o1").unwrap());
        drop(reopened);
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path, suffix));
        }
    }
}
