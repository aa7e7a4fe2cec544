use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde_json::Value;
use snapshot_kernel_core::{
    create_table_sql, encoded_key, file_sha256, rows_sha256, sort_rows, unique_index_sql,
    CrosscheckReport, DiffReport, Event, KernelError, MigrationRecord, MigrationStep, RowChanges,
    RunId, RunIndexEntry, RunStatus, SchemaAuditReport, SchemaContract, Snapshot, SnapshotLabel,
    SnapshotMode, TableAudit, TableSnapshot, AUDIT_LOG_FILE, DIFF_REPORT_FILE, SNAPSHOTS_DIR,
};
use time::OffsetDateTime;

const SNAPSHOT_INDEX_TABLE: &str = "snapshot_index";
const MIGRATION_LEDGER_TABLE: &str = "schema_migrations";
const MEMORY_EVENTS_TABLE: &str = "memory_events";
const TRACE_EVENTS_TABLE: &str = "trace_events";

// Shadow-table rebuild for the one known defect class: a NOT NULL `ts`
// without a default breaks inserts that omit it. Fixed canonical shape
// on purpose; this path never generalizes to arbitrary schema changes.
const REBUILD_SNAPSHOT_INDEX_CREATE_SQL: &str = "
CREATE TABLE IF NOT EXISTS __new_snapshot_index (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
  run_id TEXT,
  mode TEXT,
  tables_changed TEXT,
  snapshot_id TEXT,
  created_at TEXT,
  pre_checksum TEXT,
  post_checksum TEXT,
  run_dir TEXT,
  status TEXT
)";

const REBUILD_SNAPSHOT_INDEX_COPY_SQL: &str = "
INSERT INTO __new_snapshot_index
  (id, ts, run_id, mode, tables_changed, snapshot_id, created_at,
   pre_checksum, post_checksum, run_dir, status)
SELECT
  id,
  COALESCE(ts, CURRENT_TIMESTAMP),
  run_id,
  mode,
  tables_changed,
  snapshot_id,
  created_at,
  pre_checksum,
  post_checksum,
  run_dir,
  status
FROM snapshot_index";

// Column auto-detection priorities for externally-shaped event tables.
const TEXT_COLUMN_PRIORITY: [&str; 8] =
    ["event_text", "description", "message", "event", "text", "title", "name", "tag"];
const CONTENT_COLUMN_PRIORITY: [&str; 7] =
    ["content", "payload", "data", "extra", "details", "meta", "context"];
const ID_COLUMN_PRIORITY: [&str; 2] = ["id", "rowid"];

/// Parameters for one memory/trace reconciliation pass.
#[derive(Debug, Clone)]
pub struct CrosscheckQuery {
    pub run_id: Option<String>,
    pub window: u32,
    pub start_marker: String,
    pub done_marker: String,
}

impl Default for CrosscheckQuery {
    fn default() -> Self {
        Self {
            run_id: None,
            window: 500,
            start_marker: "snapshot_wrap start".to_string(),
            done_marker: "snapshot_wrap done".to_string(),
        }
    }
}

/// Common interface for the memory and trace event sinks.
pub trait EventSink {
    /// Persist one structured event.
    ///
    /// # Errors
    /// Returns an error when the backing table cannot be created or the
    /// insert fails.
    fn record(&mut self, event: &Event) -> Result<()>;
}

pub struct MemorySink<'c> {
    conn: &'c Connection,
}

impl EventSink for MemorySink<'_> {
    fn record(&mut self, event: &Event) -> Result<()> {
        ensure_contract_table(self.conn, MEMORY_EVENTS_TABLE)?;
        let payload = serde_json::to_string(&serde_json::json!({
            "run_id": event.run_id.as_str(),
            "payload": event.payload,
        }))
        .context("failed to serialize memory event payload")?;
        self.conn
            .execute(
                "INSERT INTO memory_events (ts, tag, payload) VALUES (?1, ?2, ?3)",
                params![rfc3339(event.recorded_at)?, event.label, payload],
            )
            .context("failed to insert memory event")?;
        Ok(())
    }
}

pub struct TraceSink<'c> {
    conn: &'c Connection,
}

impl EventSink for TraceSink<'_> {
    fn record(&mut self, event: &Event) -> Result<()> {
        ensure_contract_table(self.conn, TRACE_EVENTS_TABLE)?;
        let context = serde_json::to_string(&serde_json::json!({
            "run_id": event.run_id.as_str(),
            "payload": event.payload,
        }))
        .context("failed to serialize trace event context")?;
        self.conn
            .execute(
                "INSERT INTO trace_events (ts, level, tag, message, context)
                 VALUES (?1, 'info', ?2, ?3, ?4)",
                params![rfc3339(event.recorded_at)?, event.label, event.label, context],
            )
            .context("failed to insert trace event")?;
        Ok(())
    }
}

/// Store over one live embedded database. Snapshot capture only ever
/// reads the live database; the single mutation surface is the schema
/// migrator, the run index, and the event tables. At most one migrator
/// or indexer is assumed to run at a time; no locking is taken.
pub struct SnapshotStore {
    conn: Connection,
    db_path: PathBuf,
}

impl SnapshotStore {
    /// Open the live database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, db_path: path.to_path_buf() })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Capture one labeled point-in-time snapshot under
    /// `{root}/.snapshots/{stamp}_run-{run_id}/`.
    ///
    /// The copy goes through the engine's online backup API so it is
    /// transactionally consistent even with a concurrent writer; a raw
    /// byte copy of a live database can be torn. `off` mode returns
    /// minimal metadata and copies nothing.
    ///
    /// # Errors
    /// Returns an error on any directory, copy, or read failure; a
    /// partial snapshot directory must be treated as invalid.
    pub fn take_snapshot(
        &self,
        root: &Path,
        label: SnapshotLabel,
        run_id: &RunId,
        mode: SnapshotMode,
    ) -> Result<Snapshot> {
        let stamp = filename_stamp()?;
        let run_dir = root.join(SNAPSHOTS_DIR).join(format!("{stamp}_run-{run_id}"));
        for side in ["pre", "post", "diff"] {
            let dir = run_dir.join(side);
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
        }

        let mut snapshot = Snapshot {
            run_id: run_id.clone(),
            label,
            mode,
            created_at: OffsetDateTime::now_utc(),
            run_dir: path_to_posix(&run_dir)?,
            db_path: path_to_posix(&self.db_path)?,
            db_checksum: None,
            tables: BTreeMap::new(),
        };

        if mode == SnapshotMode::Off {
            return Ok(snapshot);
        }

        let copy_path = snapshot.db_copy_path();
        self.conn
            .backup(DatabaseName::Main, &copy_path, None)
            .with_context(|| format!("failed to back up database to {}", copy_path.display()))?;

        snapshot.db_checksum = Some(
            file_sha256(&copy_path)
                .with_context(|| format!("failed to checksum {}", copy_path.display()))?,
        );

        let copy = Connection::open(&copy_path)
            .with_context(|| format!("failed to open snapshot copy {}", copy_path.display()))?;

        let schema = dump_schema(&copy)?;
        write_pretty_json(&snapshot.schema_path(), &schema)?;

        for table in list_user_tables(&copy)? {
            let pk = primary_key_columns(&copy, &table)?;
            let rows = fetch_sorted_rows(&copy, &table, &pk)?;
            let checksum = if mode == SnapshotMode::Heavy {
                Some(rows_sha256(&rows).context("failed to checksum row set")?)
            } else {
                None
            };
            snapshot
                .tables
                .insert(table, TableSnapshot { row_count: rows.len() as u64, pk, checksum });
        }

        write_pretty_json(&snapshot.tables_meta_path(), &snapshot.tables)?;
        write_pretty_json(&snapshot.meta_path(), &snapshot)?;

        Ok(snapshot)
    }

    /// Compare the `pre` and `post` snapshots of one run and persist the
    /// report under the pre snapshot's `diff/` directory.
    ///
    /// Output is deterministic: rows are keyed by primary-key tuple
    /// (full-row tuple when there is no primary key), so retrieval order
    /// never affects the result. A table present in only one snapshot
    /// counts as fully added or fully removed.
    ///
    /// # Errors
    /// Returns an error when the snapshots do not form a pre/post pair
    /// of the same run, either was captured with mode `off`, or a copy
    /// cannot be read.
    pub fn compare_snapshots(pre: &Snapshot, post: &Snapshot) -> Result<DiffReport> {
        if pre.label != SnapshotLabel::Pre || post.label != SnapshotLabel::Post {
            return Err(KernelError::InvalidArgument(
                "compare_snapshots requires a pre snapshot and a post snapshot".to_string(),
            )
            .into());
        }
        if pre.run_id != post.run_id {
            return Err(KernelError::InvalidArgument(format!(
                "snapshots belong to different runs: {} vs {}",
                pre.run_id, post.run_id
            ))
            .into());
        }
        if pre.mode == SnapshotMode::Off || post.mode == SnapshotMode::Off {
            return Err(KernelError::InvalidArgument(
                "cannot diff snapshots captured with mode off".to_string(),
            )
            .into());
        }

        let pre_db = open_copy(&pre.db_copy_path())?;
        let post_db = open_copy(&post.db_copy_path())?;

        let pre_tables: BTreeSet<String> = list_user_tables(&pre_db)?.into_iter().collect();
        let post_tables: BTreeSet<String> = list_user_tables(&post_db)?.into_iter().collect();

        let mut report = DiffReport {
            run_id: pre.run_id.clone(),
            tables_changed: Vec::new(),
            row_changes: BTreeMap::new(),
        };

        for table in pre_tables.union(&post_tables) {
            // Prefer the post schema's key; fall back to pre's when the
            // table was dropped.
            let pk = if post_tables.contains(table) {
                primary_key_columns(&post_db, table)?
            } else {
                primary_key_columns(&pre_db, table)?
            };

            let pre_rows = if pre_tables.contains(table) {
                keyed_rows(&pre_db, table, &pk)?
            } else {
                BTreeMap::new()
            };
            let post_rows = if post_tables.contains(table) {
                keyed_rows(&post_db, table, &pk)?
            } else {
                BTreeMap::new()
            };

            let pre_keys: BTreeSet<&String> = pre_rows.keys().collect();
            let post_keys: BTreeSet<&String> = post_rows.keys().collect();

            let added = post_keys.difference(&pre_keys).count() as u64;
            let removed = pre_keys.difference(&post_keys).count() as u64;
            let changed = pre_keys
                .intersection(&post_keys)
                .filter(|key| pre_rows.get(**key) != post_rows.get(**key))
                .count() as u64;

            let changes = RowChanges { added, removed, changed };
            if changes.total() > 0 {
                report.tables_changed.push(table.clone());
                report.row_changes.insert(table.clone(), changes);
            }
        }

        write_pretty_json(&pre.diff_report_path(), &report)?;
        Ok(report)
    }

    /// Audit the live schema against a contract. Read-only; a found
    /// violation is a structured negative result, never an error.
    ///
    /// # Errors
    /// Returns an error only when the live schema cannot be inspected.
    pub fn audit_schema(&self, contract: &SchemaContract) -> Result<SchemaAuditReport> {
        contract.validate()?;

        let mut ok = true;
        let mut tables = BTreeMap::new();

        for (table, spec) in &contract.tables {
            let mut audit = TableAudit::default();
            let have = table_columns(&self.conn, table)?;
            if !have.is_empty() {
                audit.present = true;
                audit.missing_columns =
                    spec.columns.iter().filter(|c| !have.contains(*c)).cloned().collect();
                audit.extra_columns =
                    have.iter().filter(|c| !spec.columns.contains(*c)).cloned().collect();
                if !spec.unique.is_empty() {
                    let enforced = unique_indexed_columns(&self.conn, table)?;
                    audit.satisfied_unique =
                        spec.unique.iter().filter(|c| enforced.contains(*c)).cloned().collect();
                }
            } else {
                audit.missing_columns = spec.columns.clone();
            }

            ok = ok && audit.satisfies(spec);
            tables.insert(table.clone(), audit);
        }

        Ok(SchemaAuditReport { ok, tables })
    }

    /// Bring the live database up to the contract with additive,
    /// idempotent DDL. A zero-step run (already compliant) appends no
    /// ledger row; any effective run appends exactly one. Ledger
    /// versions combine the contract version with a second-resolution
    /// stamp, so two effective runs within the same second collapse
    /// into one row (the later replaces the earlier).
    ///
    /// Individual column-add failures are recorded as warning steps and
    /// migration continues with the remaining tables, so a clean return
    /// does not imply full compliance; callers re-audit to confirm.
    ///
    /// # Errors
    /// Returns an error when the audit, table creation, shadow rebuild,
    /// or ledger write fails.
    pub fn apply_migrations(&mut self, contract: &SchemaContract) -> Result<Vec<MigrationStep>> {
        self.conn
            .execute(
                &create_table_sql(
                    MIGRATION_LEDGER_TABLE,
                    contract_table(&SchemaContract::builtin(), MIGRATION_LEDGER_TABLE)?,
                ),
                [],
            )
            .context("failed to ensure schema_migrations table")?;

        let report = self.audit_schema(contract)?;
        let mut steps: Vec<MigrationStep> = Vec::new();

        for (table, audit) in &report.tables {
            let spec = contract_table(contract, table)?;

            if !audit.present {
                self.conn
                    .execute(&create_table_sql(table, spec), [])
                    .with_context(|| format!("failed to create table {table}"))?;
                steps.push(MigrationStep::CreateTable { table: table.clone() });
                for column in &spec.unique {
                    self.conn
                        .execute(&unique_index_sql(table, column), [])
                        .with_context(|| format!("failed to index {table}({column})"))?;
                    steps.push(MigrationStep::CreateUniqueIndex {
                        table: table.clone(),
                        column: column.clone(),
                    });
                }
                continue;
            }

            for column in &audit.missing_columns {
                match self.conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} TEXT"), [])
                {
                    Ok(_) => steps.push(MigrationStep::AddColumn {
                        table: table.clone(),
                        column: column.clone(),
                    }),
                    Err(err) => steps.push(MigrationStep::Warning {
                        table: table.clone(),
                        detail: format!("ADD {column} failed: {err}"),
                    }),
                }
            }

            // Rebuild before indexing: the table swap drops any index
            // created on the old table.
            if table == SNAPSHOT_INDEX_TABLE {
                if let Some(step) = self.maybe_rebuild_snapshot_index_ts_default()? {
                    steps.push(step);
                }
            }

            for column in &spec.unique {
                if audit.satisfied_unique.contains(column) && !rebuilt(&steps, table) {
                    continue;
                }
                match self.conn.execute(&unique_index_sql(table, column), []) {
                    Ok(_) => steps.push(MigrationStep::CreateUniqueIndex {
                        table: table.clone(),
                        column: column.clone(),
                    }),
                    Err(err) => steps.push(MigrationStep::Warning {
                        table: table.clone(),
                        detail: format!("INDEX {column} failed: {err}"),
                    }),
                }
            }
        }

        if !steps.is_empty() {
            let version = format!("{}-{}", contract.version, compact_stamp()?);
            let details: Vec<String> = steps.iter().map(MigrationStep::describe).collect();
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO schema_migrations (version, applied_at, details)
                     VALUES (?1, ?2, ?3)",
                    params![
                        version,
                        now_rfc3339()?,
                        serde_json::to_string(&details)
                            .context("failed to serialize migration details")?
                    ],
                )
                .context("failed to append migration ledger row")?;
        }

        Ok(steps)
    }

    /// Rebuild `snapshot_index` only when `ts` is NOT NULL without a
    /// default, coalescing existing nulls to the current timestamp.
    fn maybe_rebuild_snapshot_index_ts_default(&mut self) -> Result<Option<MigrationStep>> {
        let Some((notnull, default)) = self.ts_column_meta()? else {
            return Ok(None);
        };
        if !notnull || default.is_some() {
            return Ok(None);
        }

        let tx = self.conn.transaction().context("failed to start rebuild transaction")?;
        tx.execute_batch(REBUILD_SNAPSHOT_INDEX_CREATE_SQL)
            .context("failed to create shadow snapshot_index table")?;
        tx.execute_batch(REBUILD_SNAPSHOT_INDEX_COPY_SQL)
            .context("failed to copy rows into shadow snapshot_index table")?;
        tx.execute_batch(
            "DROP TABLE snapshot_index;
             ALTER TABLE __new_snapshot_index RENAME TO snapshot_index;",
        )
        .context("failed to swap shadow snapshot_index table into place")?;
        tx.commit().context("failed to commit snapshot_index rebuild")?;

        Ok(Some(MigrationStep::RebuildTable {
            table: SNAPSHOT_INDEX_TABLE.to_string(),
            reason: "ts DEFAULT CURRENT_TIMESTAMP".to_string(),
        }))
    }

    fn ts_column_meta(&self) -> Result<Option<(bool, Option<String>)>> {
        let mut stmt = self
            .conn
            .prepare("PRAGMA table_info(snapshot_index)")
            .context("failed to inspect snapshot_index")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == "ts" {
                let notnull: i64 = row.get(3)?;
                let default: Option<String> = row.get(4)?;
                return Ok(Some((notnull == 1, default)));
            }
        }
        Ok(None)
    }

    /// Read the migration ledger, oldest first.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be read or decoded.
    pub fn migration_history(&self) -> Result<Vec<MigrationRecord>> {
        if !table_exists(&self.conn, MIGRATION_LEDGER_TABLE)? {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT version, applied_at, details FROM schema_migrations ORDER BY applied_at ASC, version ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let details_raw: Option<String> = row.get(2)?;
            let details = match details_raw {
                Some(raw) => serde_json::from_str(&raw)
                    .context("failed to decode migration ledger details")?,
                None => Vec::new(),
            };
            records.push(MigrationRecord {
                version: row.get(0)?,
                applied_at: row.get(1)?,
                details,
            });
        }
        Ok(records)
    }

    /// Append one run to the index table, creating it if absent.
    /// Returns the generated snapshot id.
    ///
    /// # Errors
    /// Returns an error when the index table cannot be created or the
    /// insert fails.
    pub fn index_run(
        &self,
        run_id: &RunId,
        run_dir: &Path,
        pre_checksum: Option<&str>,
        post_checksum: Option<&str>,
        status: RunStatus,
    ) -> Result<String> {
        ensure_contract_table(&self.conn, SNAPSHOT_INDEX_TABLE)?;
        let snapshot_id = format!("{run_id}-{}", filename_stamp()?);
        self.conn
            .execute(
                "INSERT INTO snapshot_index
                   (snapshot_id, run_id, created_at, pre_checksum, post_checksum, run_dir, status)
                 VALUES (?1, ?2, datetime('now'), ?3, ?4, ?5, ?6)",
                params![
                    snapshot_id,
                    run_id.as_str(),
                    pre_checksum,
                    post_checksum,
                    path_to_posix(run_dir)?,
                    status.as_str()
                ],
            )
            .context("failed to insert snapshot_index row")?;
        Ok(snapshot_id)
    }

    /// Most recent indexed run, optionally restricted to one run id.
    ///
    /// # Errors
    /// Returns an error when the index cannot be queried or a stored
    /// status value is unknown.
    pub fn latest_run(&self, run_id: Option<&str>) -> Result<Option<RunIndexEntry>> {
        if !table_exists(&self.conn, SNAPSHOT_INDEX_TABLE)? {
            return Ok(None);
        }

        let select = "SELECT snapshot_id, run_id, created_at, pre_checksum, post_checksum, run_dir, status
                      FROM snapshot_index";
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String, Option<String>, Option<String>, Option<String>, String, String)> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        };

        let raw = match run_id {
            Some(id) => self
                .conn
                .query_row(
                    &format!("{select} WHERE run_id = ?1 ORDER BY rowid DESC LIMIT 1"),
                    params![id],
                    map_row,
                )
                .optional()?,
            None => self
                .conn
                .query_row(&format!("{select} ORDER BY rowid DESC LIMIT 1"), [], map_row)
                .optional()?,
        };

        let Some((snapshot_id, run_id, created_at, pre_checksum, post_checksum, run_dir, status)) =
            raw
        else {
            return Ok(None);
        };

        let status = RunStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown run status in snapshot_index: {status}"))?;
        Ok(Some(RunIndexEntry {
            snapshot_id,
            run_id,
            created_at: created_at.unwrap_or_default(),
            pre_checksum,
            post_checksum,
            run_dir,
            status,
        }))
    }

    #[must_use]
    pub fn memory_sink(&self) -> MemorySink<'_> {
        MemorySink { conn: &self.conn }
    }

    #[must_use]
    pub fn trace_sink(&self) -> TraceSink<'_> {
        TraceSink { conn: &self.conn }
    }

    /// Record one event in both the memory and trace streams.
    ///
    /// # Errors
    /// Returns an error when either sink fails.
    pub fn record_dual(&self, event: &Event) -> Result<()> {
        self.memory_sink().record(event)?;
        self.trace_sink().record(event)
    }

    /// Reconcile the memory and trace event streams by run id: run ids
    /// where only one stream recorded a start or done marker, plus run
    /// ids where either stream recorded a marker more than once.
    ///
    /// # Errors
    /// Returns an error when either event table is missing or unreadable;
    /// a mismatch itself is data in the report, never an error.
    pub fn crosscheck(&self, query: &CrosscheckQuery) -> Result<CrosscheckReport> {
        let memory = fetch_events(&self.conn, MEMORY_EVENTS_TABLE, query.window)?;
        let trace = fetch_events(&self.conn, TRACE_EVENTS_TABLE, query.window)?;

        let (m_starts, m_dones) = collect_markers(&memory, query);
        let (t_starts, t_dones) = collect_markers(&trace, query);

        let mut keys: BTreeSet<String> = BTreeSet::new();
        for map in [&m_starts, &t_starts, &m_dones, &t_dones] {
            keys.extend(map.keys().cloned());
        }

        let mut report = CrosscheckReport::default();
        for key in keys {
            let ms = m_starts.get(&key).copied().unwrap_or(0);
            let ts = t_starts.get(&key).copied().unwrap_or(0);
            let md = m_dones.get(&key).copied().unwrap_or(0);
            let td = t_dones.get(&key).copied().unwrap_or(0);

            if ms > 0 && ts == 0 {
                report.memory_only_starts.push(key.clone());
            }
            if ts > 0 && ms == 0 {
                report.trace_only_starts.push(key.clone());
            }
            if md > 0 && td == 0 {
                report.memory_only_dones.push(key.clone());
            }
            if td > 0 && md == 0 {
                report.trace_only_dones.push(key.clone());
            }
            if ms > 1 || ts > 1 || md > 1 || td > 1 {
                report.duplicates.push(key);
            }
        }

        Ok(report)
    }
}

/// Append one JSON event line to the run's `audit.jsonl`.
///
/// # Errors
/// Returns an error when the line cannot be serialized or appended.
pub fn write_audit_line(run_dir: &Path, event: &Event) -> Result<()> {
    let path = run_dir.join(AUDIT_LOG_FILE);
    let line = serde_json::to_string(event).context("failed to serialize audit event")?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open audit log {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}

/// Load persisted snapshot metadata from a `snapshot_meta.json` file.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed.
pub fn load_snapshot_meta(path: &Path) -> Result<Snapshot> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot meta {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse snapshot meta {}", path.display()))
}

/// Load a persisted diff report from a run directory.
///
/// # Errors
/// Returns an error when the report is missing or unparsable.
pub fn load_diff_report(run_dir: &Path) -> Result<DiffReport> {
    let path = run_dir.join("diff").join(DIFF_REPORT_FILE);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read diff report {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse diff report {}", path.display()))
}

fn rebuilt(steps: &[MigrationStep], table: &str) -> bool {
    steps
        .iter()
        .any(|step| matches!(step, MigrationStep::RebuildTable { table: t, .. } if t == table))
}

fn contract_table<'a>(
    contract: &'a SchemaContract,
    table: &str,
) -> Result<&'a snapshot_kernel_core::TableContract> {
    contract
        .tables
        .get(table)
        .ok_or_else(|| anyhow!("contract does not declare table {table}"))
}

fn ensure_contract_table(conn: &Connection, table: &str) -> Result<()> {
    let contract = SchemaContract::builtin();
    let spec = contract_table(&contract, table)?;
    conn.execute(&create_table_sql(table, spec), [])
        .with_context(|| format!("failed to ensure table {table}"))?;
    // A lazily created table must still pass its own contract audit, so
    // the contracted unique indexes come with it.
    for column in &spec.unique {
        conn.execute(&unique_index_sql(table, column), [])
            .with_context(|| format!("failed to ensure index on {table}({column})"))?;
    }
    Ok(())
}

fn open_copy(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(anyhow!("snapshot copy does not exist: {}", path.display()));
    }
    Connection::open(path)
        .with_context(|| format!("failed to open snapshot copy {}", path.display()))
}

fn dump_schema(conn: &Connection) -> Result<BTreeMap<String, Option<String>>> {
    let mut stmt = conn
        .prepare("SELECT name, sql FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .context("failed to read sqlite_master")?;
    let mut rows = stmt.query([])?;
    let mut schema = BTreeMap::new();
    while let Some(row) = rows.next()? {
        schema.insert(row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?);
    }
    Ok(schema)
}

fn list_user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .context("failed to list tables")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut tables = Vec::new();
    for row in rows {
        tables.push(row?);
    }
    Ok(tables)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table}"))?;
    Ok(exists == 1)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}

fn primary_key_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;
    // pk ordinal > 0 means the column is part of the primary key.
    let mut keyed: Vec<(i64, String)> = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        let pk: i64 = row.get(5)?;
        if pk > 0 {
            keyed.push((pk, name));
        }
    }
    keyed.sort();
    Ok(keyed.into_iter().map(|(_, name)| name).collect())
}

fn unique_indexed_columns(conn: &Connection, table: &str) -> Result<BTreeSet<String>> {
    let mut names = Vec::new();
    {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_list({table})"))
            .with_context(|| format!("failed to list indexes for {table}"))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            let unique: i64 = row.get(2)?;
            if unique == 1 {
                names.push(name);
            }
        }
    }

    let mut columns = BTreeSet::new();
    for name in names {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_info({name})"))
            .with_context(|| format!("failed to inspect index {name}"))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            if let Some(column) = row.get::<_, Option<String>>(2)? {
                columns.insert(column);
            }
        }
    }
    Ok(columns)
}

fn sql_value_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    match value {
        rusqlite::types::ValueRef::Null => Value::Null,
        rusqlite::types::ValueRef::Integer(i) => Value::from(i),
        rusqlite::types::ValueRef::Real(f) => {
            serde_json::Number::from_f64(f).map_or_else(|| Value::String(f.to_string()), Value::Number)
        }
        rusqlite::types::ValueRef::Text(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        rusqlite::types::ValueRef::Blob(bytes) => Value::String(format!("hex:{}", hex::encode(bytes))),
    }
}

fn fetch_sorted_rows(
    conn: &Connection,
    table: &str,
    pk: &[String],
) -> Result<Vec<snapshot_kernel_core::Row>> {
    let mut stmt = conn
        .prepare(&format!("SELECT * FROM {table}"))
        .with_context(|| format!("failed to read rows from {table}"))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|name| (*name).to_string()).collect();

    let mut rows = Vec::new();
    let mut raw = stmt.query([])?;
    while let Some(row) = raw.next()? {
        let mut decoded = snapshot_kernel_core::Row::new();
        for (index, column) in columns.iter().enumerate() {
            decoded.insert(column.clone(), sql_value_to_json(row.get_ref(index)?));
        }
        rows.push(decoded);
    }

    sort_rows(&mut rows, pk);
    Ok(rows)
}

fn keyed_rows(
    conn: &Connection,
    table: &str,
    pk: &[String],
) -> Result<BTreeMap<String, snapshot_kernel_core::Row>> {
    let rows = fetch_sorted_rows(conn, table, pk)?;
    let mut keyed = BTreeMap::new();
    for row in rows {
        let key = encoded_key(&row, pk).context("failed to encode row key")?;
        keyed.insert(key, row);
    }
    Ok(keyed)
}

fn fetch_events(conn: &Connection, table: &str, window: u32) -> Result<Vec<(i64, String, Value)>> {
    let columns = table_columns(conn, table)?;
    if columns.is_empty() {
        return Err(anyhow!("event table not found or has no columns: {table}"));
    }

    let id_col = pick_column(&columns, &ID_COLUMN_PRIORITY).unwrap_or_else(|| columns[0].clone());
    let text_col = pick_column(&columns, &TEXT_COLUMN_PRIORITY)
        .unwrap_or_else(|| columns.get(1).unwrap_or(&columns[0]).clone());
    let content_col =
        pick_column(&columns, &CONTENT_COLUMN_PRIORITY).unwrap_or_else(|| text_col.clone());

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {id_col} AS _id, {text_col} AS _txt, {content_col} AS _content
             FROM {table} ORDER BY _id DESC LIMIT ?1"
        ))
        .with_context(|| format!("failed to read events from {table}"))?;

    let mut rows = stmt.query(params![i64::from(window)])?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        let id: Option<i64> = row.get(0)?;
        let text: Option<String> = row.get(1)?;
        let content: Option<String> = row.get(2)?;
        let parsed = content
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        events.push((id.unwrap_or(0), text.unwrap_or_default().trim().to_string(), parsed));
    }
    Ok(events)
}

fn pick_column(columns: &[String], priorities: &[&str]) -> Option<String> {
    let lower: BTreeMap<String, &String> =
        columns.iter().map(|c| (c.to_lowercase(), c)).collect();
    priorities.iter().find_map(|p| lower.get(*p).map(|c| (*c).clone()))
}

fn collect_markers(
    events: &[(i64, String, Value)],
    query: &CrosscheckQuery,
) -> (BTreeMap<String, u32>, BTreeMap<String, u32>) {
    let start = query.start_marker.to_lowercase();
    let done = query.done_marker.to_lowercase();
    let mut starts: BTreeMap<String, u32> = BTreeMap::new();
    let mut dones: BTreeMap<String, u32> = BTreeMap::new();

    for (_, text, content) in events {
        let rid = content
            .get("run_id")
            .and_then(Value::as_str)
            .unwrap_or("no-runid")
            .to_string();
        if let Some(filter) = &query.run_id {
            if &rid != filter {
                continue;
            }
        }
        let label = text.to_lowercase();
        if label.contains(&start) {
            *starts.entry(rid).or_insert(0) += 1;
        } else if label.contains(&done) {
            *dones.entry(rid).or_insert(0) += 1;
        }
    }

    (starts, dones)
}

fn write_pretty_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let body =
        serde_json::to_vec_pretty(value).context("failed to serialize snapshot artifact")?;
    fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn path_to_posix(path: &Path) -> Result<String> {
    let raw = path
        .to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))?;
    Ok(raw.replace('\\', "/"))
}

fn filename_stamp() -> Result<String> {
    format_stamp("[year]-[month]-[day]T[hour]-[minute]-[second]Z")
}

fn compact_stamp() -> Result<String> {
    format_stamp("[year][month][day][hour][minute][second]")
}

fn format_stamp(pattern: &str) -> Result<String> {
    let format = time::format_description::parse(pattern)
        .context("failed to build timestamp format")?;
    OffsetDateTime::now_utc().format(&format).context("failed to format timestamp")
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
