//! SQLite write sink.
//!
//! One database holds the whole report. Foreign keys are enforced, so a write
//! that references a row deleted by another client fails with
//! `SQLITE_CONSTRAINT_FOREIGNKEY` and surfaces as
//! [`SinkError::ReferentialIntegrity`]. Updates that match no row are reported
//! the same way.
//!
//! Batched writes (messages, checkpoint samples, statistics) are buffered and
//! written in one transaction by [`flush_cache`](WriteSink::flush_cache), or as
//! soon as the buffer reaches its capacity.

use std::path::Path;

use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn};

use crate::event::{
    CheckpointEnd, CheckpointSample, CheckpointStart, EntityId, RunInfo, RunUpdate,
    StatisticsBatch, SuiteUpdate, TestResult, TestcaseStart, TestcaseUpdate,
};
use crate::sink::{
    CheckpointInfo, EntityKind, FailedWrite, MessageParent, MessageRecord, SinkBackendKind,
    SinkError, SinkResult, StatisticsKind, WriteSink,
};

/// Schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

const REPORT_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS runs (
    run_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_name        TEXT NOT NULL,
    os_name         TEXT NOT NULL DEFAULT '',
    product_name    TEXT NOT NULL DEFAULT '',
    version_name    TEXT NOT NULL DEFAULT '',
    build_name      TEXT NOT NULL DEFAULT '',
    host_name       TEXT NOT NULL DEFAULT '',
    user_note       TEXT,
    started_at      INTEGER NOT NULL,
    ended_at        INTEGER
);

CREATE TABLE IF NOT EXISTS run_metainfo (
    metainfo_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id          INTEGER NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    meta_key        TEXT NOT NULL,
    meta_value      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS suites (
    suite_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id          INTEGER NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    name            TEXT NOT NULL,
    package         TEXT NOT NULL DEFAULT '',
    user_note       TEXT,
    started_at      INTEGER NOT NULL,
    ended_at        INTEGER
);
CREATE INDEX IF NOT EXISTS idx_suites_run ON suites(run_id);

CREATE TABLE IF NOT EXISTS testcases (
    testcase_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    suite_id        INTEGER NOT NULL REFERENCES suites(suite_id) ON DELETE CASCADE,
    suite_full_name TEXT NOT NULL DEFAULT '',
    scenario_name   TEXT NOT NULL DEFAULT '',
    scenario_description TEXT NOT NULL DEFAULT '',
    testcase_name   TEXT NOT NULL,
    user_note       TEXT,
    result          INTEGER NOT NULL DEFAULT 4,
    started_at      INTEGER NOT NULL,
    ended_at        INTEGER
);
CREATE INDEX IF NOT EXISTS idx_testcases_suite ON testcases(suite_id);

CREATE TABLE IF NOT EXISTS scenario_metainfo (
    metainfo_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    testcase_id     INTEGER NOT NULL REFERENCES testcases(testcase_id) ON DELETE CASCADE,
    meta_key        TEXT NOT NULL,
    meta_value      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    message_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id          INTEGER REFERENCES runs(run_id) ON DELETE CASCADE,
    suite_id        INTEGER REFERENCES suites(suite_id) ON DELETE CASCADE,
    testcase_id     INTEGER REFERENCES testcases(testcase_id) ON DELETE CASCADE,
    level           INTEGER NOT NULL,
    message         TEXT NOT NULL,
    escape_html     INTEGER NOT NULL DEFAULT 0,
    machine         TEXT NOT NULL,
    thread_name     TEXT NOT NULL,
    timestamp       INTEGER NOT NULL,
    CHECK ((run_id IS NOT NULL) + (suite_id IS NOT NULL) + (testcase_id IS NOT NULL) = 1)
);
CREATE INDEX IF NOT EXISTS idx_messages_testcase ON messages(testcase_id);

CREATE TABLE IF NOT EXISTS load_queues (
    load_queue_id   INTEGER PRIMARY KEY,
    result          INTEGER NOT NULL,
    ended_at        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    load_queue_id   INTEGER NOT NULL,
    name            TEXT NOT NULL,
    thread_name     TEXT NOT NULL,
    started_at      INTEGER NOT NULL,
    response_time   INTEGER,
    transfer_size   INTEGER NOT NULL DEFAULT 0,
    transfer_unit   TEXT NOT NULL DEFAULT '',
    result          INTEGER
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_queue ON checkpoints(load_queue_id);

CREATE TABLE IF NOT EXISTS statistics (
    stat_row_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    testcase_id     INTEGER NOT NULL REFERENCES testcases(testcase_id) ON DELETE CASCADE,
    kind            TEXT NOT NULL,
    machine         TEXT NOT NULL,
    statistic_id    INTEGER NOT NULL,
    value           REAL NOT NULL,
    timestamp       INTEGER NOT NULL
);
";

/// Map a SQLite error; foreign-key violations blame `entity`.
fn sink_error(entity: EntityKind, err: rusqlite::Error) -> SinkError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
            return SinkError::ReferentialIntegrity {
                entity,
                message: err.to_string(),
            };
        }
        if matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ) {
            return SinkError::Busy(err.to_string());
        }
    }
    SinkError::Database(err.to_string())
}

fn db_error(err: rusqlite::Error) -> SinkError {
    SinkError::Database(err.to_string())
}

/// An update that matched nothing means the row is gone.
fn expect_row(changed: usize, entity: EntityKind, id: EntityId) -> SinkResult<()> {
    if changed == 0 {
        Err(SinkError::ReferentialIntegrity {
            entity,
            message: format!("{entity} {id} does not exist"),
        })
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Message(MessageParent, MessageRecord),
    Statistics(EntityId, StatisticsKind, StatisticsBatch),
    Checkpoint(EntityId, CheckpointSample),
}

impl PendingWrite {
    /// Parent row the write references.
    fn parent(&self) -> (EntityKind, EntityId) {
        match self {
            Self::Message(parent, _) => (parent.entity(), parent.id()),
            Self::Statistics(testcase_id, ..) => (EntityKind::Testcase, *testcase_id),
            Self::Checkpoint(load_queue_id, _) => (EntityKind::LoadQueue, *load_queue_id),
        }
    }

    fn targets_testcase(&self, testcase_ids: &[EntityId]) -> bool {
        match self.parent() {
            (EntityKind::Testcase, id) => testcase_ids.contains(&id),
            _ => false,
        }
    }
}

fn write_message(conn: &Connection, parent: MessageParent, record: &MessageRecord) -> SinkResult<()> {
    let (run_id, suite_id, testcase_id) = match parent {
        MessageParent::Run(id) => (Some(id), None, None),
        MessageParent::Suite(id) => (None, Some(id), None),
        MessageParent::Testcase(id) => (None, None, Some(id)),
    };
    conn.execute(
        "INSERT INTO messages \
         (run_id, suite_id, testcase_id, level, message, escape_html, machine, thread_name, timestamp) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            run_id,
            suite_id,
            testcase_id,
            record.level.code(),
            record.text,
            record.escape_html,
            record.machine,
            record.thread,
            record.timestamp_ms,
        ],
    )
    .map_err(|e| sink_error(parent.entity(), e))?;
    Ok(())
}

fn write_statistics(
    conn: &Connection,
    testcase_id: EntityId,
    kind: StatisticsKind,
    stats: &StatisticsBatch,
) -> SinkResult<()> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO statistics (testcase_id, kind, machine, statistic_id, value, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .map_err(db_error)?;
    for sample in &stats.samples {
        stmt.execute(params![
            testcase_id,
            kind.as_str(),
            stats.monitored_machine,
            sample.statistic_id,
            sample.value,
            stats.timestamp,
        ])
        .map_err(|e| sink_error(EntityKind::Testcase, e))?;
    }
    Ok(())
}

fn write_checkpoint(
    conn: &Connection,
    load_queue_id: EntityId,
    sample: &CheckpointSample,
) -> SinkResult<()> {
    conn.execute(
        "INSERT INTO checkpoints \
         (load_queue_id, name, thread_name, started_at, response_time, transfer_size, transfer_unit, result) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            load_queue_id,
            sample.name,
            sample.thread,
            sample.start_timestamp,
            sample.response_time,
            sample.transfer_size,
            sample.transfer_unit,
            sample.result.code(),
        ],
    )
    .map_err(|e| sink_error(EntityKind::LoadQueue, e))?;
    Ok(())
}

fn apply(conn: &Connection, write: &PendingWrite) -> SinkResult<()> {
    match write {
        PendingWrite::Message(parent, record) => write_message(conn, *parent, record),
        PendingWrite::Statistics(testcase_id, kind, stats) => {
            write_statistics(conn, *testcase_id, *kind, stats)
        }
        PendingWrite::Checkpoint(load_queue_id, sample) => {
            write_checkpoint(conn, *load_queue_id, sample)
        }
    }
}

/// Per-run totals for `runledger summary`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: EntityId,
    pub run_name: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub suites: u64,
    pub testcases: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub running: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub runs: Vec<RunSummary>,
    pub messages: u64,
    pub checkpoints: u64,
    pub statistics: u64,
}

pub struct SqliteSink {
    conn: Connection,
    pending: Vec<PendingWrite>,
    batch_capacity: usize,
}

impl SqliteSink {
    /// Open or create a report database.
    pub fn open(db_path: &Path, batch_capacity: usize) -> SinkResult<Self> {
        let _span = info_span!("sqlite_sink_open", path = %db_path.display()).entered();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SinkError::Connection(e.to_string()))?;
            }
        }
        let conn = Connection::open(db_path).map_err(|e| SinkError::Connection(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_error)?;
        Self::init(conn, batch_capacity)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(batch_capacity: usize) -> SinkResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| SinkError::Connection(e.to_string()))?;
        Self::init(conn, batch_capacity)
    }

    fn init(conn: Connection, batch_capacity: usize) -> SinkResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(db_error)?;
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(db_error)?;
        if version == 0 {
            conn.execute_batch(REPORT_SCHEMA).map_err(db_error)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(db_error)?;
        }
        Ok(Self {
            conn,
            pending: Vec::new(),
            batch_capacity: batch_capacity.max(1),
        })
    }

    /// Writes buffered and not yet flushed.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Underlying connection, for inspection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    fn buffer(&mut self, write: PendingWrite, batch: bool) -> SinkResult<()> {
        if !batch {
            return apply(&self.conn, &write);
        }
        self.pending.push(write);
        if self.pending.len() >= self.batch_capacity {
            debug!(pending = self.pending.len(), "Batch capacity reached; flushing");
            self.flush_cache()?;
        }
        Ok(())
    }

    fn count(&self, table: &str) -> SinkResult<u64> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .map_err(db_error)?;
        Ok(count as u64)
    }

    fn exists(&self, sql: &str, id: EntityId) -> SinkResult<bool> {
        self.conn
            .query_row(sql, [id], |_| Ok(()))
            .optional()
            .map(|row| row.is_some())
            .map_err(db_error)
    }

    /// Per-run testcase totals plus row counts.
    pub fn summary(&self) -> SinkResult<ReportSummary> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT r.run_id, r.run_name, r.started_at, r.ended_at, \
                        (SELECT COUNT(*) FROM suites s WHERE s.run_id = r.run_id), \
                        COUNT(t.testcase_id), \
                        COALESCE(SUM(t.result = 1), 0), \
                        COALESCE(SUM(t.result = 0), 0), \
                        COALESCE(SUM(t.result = 2), 0), \
                        COALESCE(SUM(t.result = 4), 0) \
                 FROM runs r \
                 LEFT JOIN suites s2 ON s2.run_id = r.run_id \
                 LEFT JOIN testcases t ON t.suite_id = s2.suite_id \
                 GROUP BY r.run_id \
                 ORDER BY r.run_id",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RunSummary {
                    run_id: row.get(0)?,
                    run_name: row.get(1)?,
                    started_at: row.get(2)?,
                    ended_at: row.get(3)?,
                    suites: row.get::<_, i64>(4)? as u64,
                    testcases: row.get::<_, i64>(5)? as u64,
                    passed: row.get::<_, i64>(6)? as u64,
                    failed: row.get::<_, i64>(7)? as u64,
                    skipped: row.get::<_, i64>(8)? as u64,
                    running: row.get::<_, i64>(9)? as u64,
                })
            })
            .map_err(db_error)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.map_err(db_error)?);
        }
        Ok(ReportSummary {
            runs,
            messages: self.count("messages")?,
            checkpoints: self.count("checkpoints")?,
            statistics: self.count("statistics")?,
        })
    }
}

impl std::fmt::Debug for SqliteSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSink")
            .field("pending", &self.pending.len())
            .field("batch_capacity", &self.batch_capacity)
            .finish_non_exhaustive()
    }
}

impl WriteSink for SqliteSink {
    fn backend_kind(&self) -> SinkBackendKind {
        SinkBackendKind::Sqlite
    }

    fn run_db_sanity_check(&mut self) -> SinkResult<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(db_error)?;
        if version != SCHEMA_VERSION {
            return Err(SinkError::SanityCheck(format!(
                "schema version {version}, expected {SCHEMA_VERSION}"
            )));
        }
        let foreign_keys: i64 = self
            .conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .map_err(db_error)?;
        if foreign_keys != 1 {
            return Err(SinkError::SanityCheck(
                "foreign key enforcement is disabled".to_string(),
            ));
        }
        let check: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(db_error)?;
        if check != "ok" {
            return Err(SinkError::SanityCheck(format!("quick_check: {check}")));
        }
        Ok(())
    }

    fn start_run(&mut self, run: &RunInfo, timestamp_ms: i64, _batch: bool) -> SinkResult<EntityId> {
        self.conn
            .execute(
                "INSERT INTO runs \
                 (run_name, os_name, product_name, version_name, build_name, host_name, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.run_name,
                    run.os_name,
                    run.product_name,
                    run.version_name,
                    run.build_name,
                    run.host_name,
                    timestamp_ms,
                ],
            )
            .map_err(db_error)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn end_run(&mut self, run_id: EntityId, timestamp_ms: i64, _batch: bool) -> SinkResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET ended_at = ?2 WHERE run_id = ?1",
                params![run_id, timestamp_ms],
            )
            .map_err(db_error)?;
        expect_row(changed, EntityKind::Run, run_id)
    }

    fn update_run(&mut self, run_id: EntityId, update: &RunUpdate, _batch: bool) -> SinkResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET \
                 run_name = COALESCE(?2, run_name), \
                 os_name = COALESCE(?3, os_name), \
                 product_name = COALESCE(?4, product_name), \
                 version_name = COALESCE(?5, version_name), \
                 build_name = COALESCE(?6, build_name), \
                 user_note = COALESCE(?7, user_note), \
                 host_name = COALESCE(?8, host_name) \
                 WHERE run_id = ?1",
                params![
                    run_id,
                    update.run_name,
                    update.os_name,
                    update.product_name,
                    update.version_name,
                    update.build_name,
                    update.user_note,
                    update.host_name,
                ],
            )
            .map_err(db_error)?;
        expect_row(changed, EntityKind::Run, run_id)
    }

    fn add_run_metainfo(
        &mut self,
        run_id: EntityId,
        key: &str,
        value: &str,
        _batch: bool,
    ) -> SinkResult<()> {
        self.conn
            .execute(
                "INSERT INTO run_metainfo (run_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
                params![run_id, key, value],
            )
            .map_err(|e| sink_error(EntityKind::Run, e))?;
        Ok(())
    }

    fn start_suite(
        &mut self,
        run_id: EntityId,
        name: &str,
        package: &str,
        timestamp_ms: i64,
        _batch: bool,
    ) -> SinkResult<EntityId> {
        self.conn
            .execute(
                "INSERT INTO suites (run_id, name, package, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![run_id, name, package, timestamp_ms],
            )
            .map_err(|e| sink_error(EntityKind::Run, e))?;
        Ok(self.conn.last_insert_rowid())
    }

    fn end_suite(&mut self, suite_id: EntityId, timestamp_ms: i64, _batch: bool) -> SinkResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE suites SET ended_at = ?2 WHERE suite_id = ?1",
                params![suite_id, timestamp_ms],
            )
            .map_err(db_error)?;
        expect_row(changed, EntityKind::Suite, suite_id)
    }

    fn update_suite(
        &mut self,
        suite_id: EntityId,
        update: &SuiteUpdate,
        _batch: bool,
    ) -> SinkResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE suites SET name = COALESCE(?2, name), user_note = COALESCE(?3, user_note) \
                 WHERE suite_id = ?1",
                params![suite_id, update.suite_name, update.user_note],
            )
            .map_err(db_error)?;
        expect_row(changed, EntityKind::Suite, suite_id)
    }

    fn start_testcase(
        &mut self,
        suite_id: EntityId,
        testcase: &TestcaseStart,
        timestamp_ms: i64,
        _batch: bool,
    ) -> SinkResult<EntityId> {
        self.conn
            .execute(
                "INSERT INTO testcases \
                 (suite_id, suite_full_name, scenario_name, scenario_description, testcase_name, result, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    suite_id,
                    testcase.suite_full_name,
                    testcase.scenario_name,
                    testcase.scenario_description,
                    testcase.testcase_name,
                    TestResult::Running.code(),
                    timestamp_ms,
                ],
            )
            .map_err(|e| sink_error(EntityKind::Suite, e))?;
        Ok(self.conn.last_insert_rowid())
    }

    fn end_testcase(
        &mut self,
        testcase_id: EntityId,
        result: TestResult,
        timestamp_ms: i64,
        _batch: bool,
    ) -> SinkResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE testcases SET result = ?2, ended_at = ?3 WHERE testcase_id = ?1",
                params![testcase_id, result.code(), timestamp_ms],
            )
            .map_err(db_error)?;
        expect_row(changed, EntityKind::Testcase, testcase_id)
    }

    fn update_testcase(
        &mut self,
        testcase_id: EntityId,
        update: &TestcaseUpdate,
        _batch: bool,
    ) -> SinkResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE testcases SET \
                 suite_full_name = COALESCE(?2, suite_full_name), \
                 scenario_name = COALESCE(?3, scenario_name), \
                 scenario_description = COALESCE(?4, scenario_description), \
                 testcase_name = COALESCE(?5, testcase_name), \
                 user_note = COALESCE(?6, user_note), \
                 result = COALESCE(?7, result) \
                 WHERE testcase_id = ?1",
                params![
                    testcase_id,
                    update.suite_full_name,
                    update.scenario_name,
                    update.scenario_description,
                    update.testcase_name,
                    update.user_note,
                    update.result.map(TestResult::code),
                ],
            )
            .map_err(db_error)?;
        expect_row(changed, EntityKind::Testcase, testcase_id)
    }

    fn delete_testcases(&mut self, testcase_ids: &[EntityId]) -> SinkResult<()> {
        let buffered = self.pending.len();
        self.pending
            .retain(|write| !write.targets_testcase(testcase_ids));
        if self.pending.len() < buffered {
            debug!(
                dropped = buffered - self.pending.len(),
                "Dropped batched writes of deleted testcases"
            );
        }
        let tx = self.conn.transaction().map_err(db_error)?;
        for testcase_id in testcase_ids {
            tx.execute(
                "DELETE FROM testcases WHERE testcase_id = ?1",
                [testcase_id],
            )
            .map_err(db_error)?;
        }
        tx.commit().map_err(db_error)
    }

    fn add_scenario_metainfo(
        &mut self,
        testcase_id: EntityId,
        key: &str,
        value: &str,
        _batch: bool,
    ) -> SinkResult<()> {
        self.conn
            .execute(
                "INSERT INTO scenario_metainfo (testcase_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
                params![testcase_id, key, value],
            )
            .map_err(|e| sink_error(EntityKind::Testcase, e))?;
        Ok(())
    }

    fn clear_scenario_metainfo(&mut self, testcase_id: EntityId, _batch: bool) -> SinkResult<()> {
        self.conn
            .execute(
                "DELETE FROM scenario_metainfo WHERE testcase_id = ?1",
                [testcase_id],
            )
            .map_err(db_error)?;
        Ok(())
    }

    fn start_checkpoint(
        &mut self,
        load_queue_id: EntityId,
        checkpoint: &CheckpointStart,
        _batch: bool,
    ) -> SinkResult<CheckpointInfo> {
        self.conn
            .execute(
                "INSERT INTO checkpoints (load_queue_id, name, thread_name, started_at, transfer_unit) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    load_queue_id,
                    checkpoint.name,
                    checkpoint.thread,
                    checkpoint.start_timestamp,
                    checkpoint.transfer_unit,
                ],
            )
            .map_err(|e| sink_error(EntityKind::LoadQueue, e))?;
        Ok(CheckpointInfo {
            checkpoint_id: self.conn.last_insert_rowid(),
            load_queue_id,
            name: checkpoint.name.clone(),
            thread: checkpoint.thread.clone(),
            start_timestamp: checkpoint.start_timestamp,
            transfer_unit: checkpoint.transfer_unit.clone(),
        })
    }

    fn end_checkpoint(
        &mut self,
        started: &CheckpointInfo,
        end: &CheckpointEnd,
        _batch: bool,
    ) -> SinkResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE checkpoints SET response_time = ?2, transfer_size = ?3, result = ?4 \
                 WHERE checkpoint_id = ?1",
                params![
                    started.checkpoint_id,
                    started.response_time(end.end_timestamp),
                    end.transfer_size,
                    end.result.code(),
                ],
            )
            .map_err(db_error)?;
        expect_row(changed, EntityKind::Checkpoint, started.checkpoint_id)
    }

    fn insert_checkpoint(
        &mut self,
        load_queue_id: EntityId,
        sample: &CheckpointSample,
        batch: bool,
    ) -> SinkResult<()> {
        self.buffer(PendingWrite::Checkpoint(load_queue_id, sample.clone()), batch)
    }

    fn end_load_queue(
        &mut self,
        load_queue_id: EntityId,
        result: TestResult,
        timestamp_ms: i64,
        _batch: bool,
    ) -> SinkResult<()> {
        self.conn
            .execute(
                "INSERT INTO load_queues (load_queue_id, result, ended_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(load_queue_id) DO UPDATE SET result = excluded.result, ended_at = excluded.ended_at",
                params![load_queue_id, result.code(), timestamp_ms],
            )
            .map_err(db_error)?;
        Ok(())
    }

    fn insert_message(
        &mut self,
        testcase_id: EntityId,
        message: &MessageRecord,
        batch: bool,
    ) -> SinkResult<()> {
        self.buffer(
            PendingWrite::Message(MessageParent::Testcase(testcase_id), message.clone()),
            batch,
        )
    }

    fn insert_run_message(
        &mut self,
        run_id: EntityId,
        message: &MessageRecord,
        batch: bool,
    ) -> SinkResult<()> {
        self.buffer(
            PendingWrite::Message(MessageParent::Run(run_id), message.clone()),
            batch,
        )
    }

    fn insert_suite_message(
        &mut self,
        suite_id: EntityId,
        message: &MessageRecord,
        batch: bool,
    ) -> SinkResult<()> {
        self.buffer(
            PendingWrite::Message(MessageParent::Suite(suite_id), message.clone()),
            batch,
        )
    }

    fn insert_statistics(
        &mut self,
        testcase_id: EntityId,
        kind: StatisticsKind,
        stats: &StatisticsBatch,
        batch: bool,
    ) -> SinkResult<()> {
        self.buffer(
            PendingWrite::Statistics(testcase_id, kind, stats.clone()),
            batch,
        )
    }

    fn is_run_present(&mut self, run_id: EntityId) -> SinkResult<bool> {
        self.exists("SELECT 1 FROM runs WHERE run_id = ?1", run_id)
    }

    fn is_suite_present(&mut self, suite_id: EntityId) -> SinkResult<bool> {
        self.exists("SELECT 1 FROM suites WHERE suite_id = ?1", suite_id)
    }

    fn is_testcase_present(&mut self, testcase_id: EntityId) -> SinkResult<bool> {
        self.exists("SELECT 1 FROM testcases WHERE testcase_id = ?1", testcase_id)
    }

    fn flush_cache(&mut self) -> SinkResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let tx = self.conn.transaction().map_err(db_error)?;
        let mut failed = Vec::new();
        for write in &pending {
            if let Err(error) = apply(&tx, write) {
                let (entity, id) = write.parent();
                warn!(%entity, id, error = %error, "Batched write failed");
                failed.push(FailedWrite { entity, id, error });
            }
        }
        tx.commit().map_err(db_error)?;
        debug!(
            written = pending.len() - failed.len(),
            failed = failed.len(),
            "Flushed batched writes"
        );
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SinkError::BatchFailed(failed))
        }
    }
}
