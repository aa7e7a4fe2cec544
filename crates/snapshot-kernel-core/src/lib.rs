use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub const DB_COPY_FILE: &str = "db_copy.sqlite3";
pub const SCHEMA_FILE: &str = "schema.json";
pub const TABLES_FILE: &str = "tables.json";
pub const SNAPSHOT_META_FILE: &str = "snapshot_meta.json";
pub const DIFF_REPORT_FILE: &str = "report.json";
pub const AUDIT_LOG_FILE: &str = "audit.jsonl";
pub const SNAPSHOTS_DIR: &str = ".snapshots";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Opaque correlation identifier for one pre/operation/post cycle.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotLabel {
    Pre,
    Post,
}

impl SnapshotLabel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pre" => Some(Self::Pre),
            "post" => Some(Self::Post),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    Off,
    Light,
    Heavy,
}

impl SnapshotMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Light => "light",
            Self::Heavy => "heavy",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(Self::Off),
            "light" => Some(Self::Light),
            "heavy" => Some(Self::Heavy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(Self::Ok),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Per-table metadata captured inside a snapshot. `checksum` is only
/// populated in heavy mode.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableSnapshot {
    pub row_count: u64,
    pub pk: Vec<String>,
    pub checksum: Option<String>,
}

/// One labeled point-in-time capture of the database for one run.
/// Immutable after creation; superseded only by a new run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub run_id: RunId,
    pub label: SnapshotLabel,
    pub mode: SnapshotMode,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub run_dir: String,
    pub db_path: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub db_checksum: Option<String>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableSnapshot>,
}

impl Snapshot {
    #[must_use]
    pub fn label_dir(&self) -> PathBuf {
        Path::new(&self.run_dir).join(self.label.as_str())
    }

    #[must_use]
    pub fn db_copy_path(&self) -> PathBuf {
        self.label_dir().join(DB_COPY_FILE)
    }

    #[must_use]
    pub fn schema_path(&self) -> PathBuf {
        self.label_dir().join(SCHEMA_FILE)
    }

    #[must_use]
    pub fn tables_meta_path(&self) -> PathBuf {
        self.label_dir().join(TABLES_FILE)
    }

    #[must_use]
    pub fn meta_path(&self) -> PathBuf {
        self.label_dir().join(SNAPSHOT_META_FILE)
    }

    #[must_use]
    pub fn diff_report_path(&self) -> PathBuf {
        Path::new(&self.run_dir).join("diff").join(DIFF_REPORT_FILE)
    }

    #[must_use]
    pub fn audit_log_path(&self) -> PathBuf {
        Path::new(&self.run_dir).join(AUDIT_LOG_FILE)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, Eq, PartialEq)]
pub struct RowChanges {
    pub added: u64,
    pub removed: u64,
    pub changed: u64,
}

impl RowChanges {
    #[must_use]
    pub fn total(self) -> u64 {
        self.added + self.removed + self.changed
    }
}

/// Result of comparing a `pre` and a `post` snapshot of the same run.
/// A table appears in `tables_changed` iff its change counts are nonzero.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DiffReport {
    pub run_id: RunId,
    pub tables_changed: Vec<String>,
    pub row_changes: BTreeMap<String, RowChanges>,
}

impl DiffReport {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.tables_changed.is_empty()
    }
}

/// Minimum required shape for one table. Columns are loosely typed on
/// purpose: the contract fixes names only, so shapes can evolve
/// additively without breaking earlier writers.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableContract {
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: Vec<String>,
}

/// Declarative minimum schema shape a database must satisfy. Extra live
/// columns beyond the contract are always permitted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaContract {
    pub version: String,
    pub tables: BTreeMap<String, TableContract>,
}

impl SchemaContract {
    /// The contract for the subsystem's own tables: dual event logs, the
    /// run index, and the migration ledger.
    #[must_use]
    pub fn builtin() -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(
            "memory_events".to_string(),
            TableContract {
                columns: string_vec(&["id", "ts", "tag", "payload"]),
                unique: Vec::new(),
            },
        );
        tables.insert(
            "trace_events".to_string(),
            TableContract {
                columns: string_vec(&["id", "ts", "level", "tag", "message", "context"]),
                unique: Vec::new(),
            },
        );
        tables.insert(
            "snapshot_index".to_string(),
            TableContract {
                columns: string_vec(&[
                    "id",
                    "ts",
                    "run_id",
                    "mode",
                    "tables_changed",
                    "snapshot_id",
                    "created_at",
                    "pre_checksum",
                    "post_checksum",
                    "run_dir",
                    "status",
                ]),
                unique: Vec::new(),
            },
        );
        tables.insert(
            "manifest".to_string(),
            TableContract {
                columns: string_vec(&["id", "path", "added_ts", "phase"]),
                unique: string_vec(&["path"]),
            },
        );
        tables.insert(
            "schema_migrations".to_string(),
            TableContract {
                columns: string_vec(&["version", "applied_at", "details"]),
                unique: Vec::new(),
            },
        );
        Self { version: "1".to_string(), tables }
    }

    /// Parse a contract from JSON and validate it.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidArgument`] when the JSON is
    /// unparsable or the contract shape is invalid.
    pub fn from_json_str(raw: &str) -> Result<Self, KernelError> {
        let contract: Self = serde_json::from_str(raw)
            .map_err(|err| KernelError::InvalidArgument(format!("unparsable contract: {err}")))?;
        contract.validate()?;
        Ok(contract)
    }

    /// Check structural invariants. Table and column names are
    /// interpolated into DDL, so they must be plain identifiers.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidArgument`] on an empty contract,
    /// empty column lists, non-identifier names, or unique columns not
    /// listed in `columns`.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.version.trim().is_empty() {
            return Err(KernelError::InvalidArgument(
                "contract version MUST be non-empty".to_string(),
            ));
        }
        if self.tables.is_empty() {
            return Err(KernelError::InvalidArgument(
                "contract MUST declare at least one table".to_string(),
            ));
        }
        for (table, spec) in &self.tables {
            if !is_identifier(table) {
                return Err(KernelError::InvalidArgument(format!(
                    "table name is not a plain identifier: {table}"
                )));
            }
            if spec.columns.is_empty() {
                return Err(KernelError::InvalidArgument(format!(
                    "table {table} MUST declare at least one column"
                )));
            }
            for column in &spec.columns {
                if !is_identifier(column) {
                    return Err(KernelError::InvalidArgument(format!(
                        "column name is not a plain identifier: {table}.{column}"
                    )));
                }
            }
            for column in &spec.unique {
                if !spec.columns.contains(column) {
                    return Err(KernelError::InvalidArgument(format!(
                        "unique column {table}.{column} is not in the column list"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn string_vec(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with(|c: char| c.is_ascii_digit())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, Eq, PartialEq)]
pub struct TableAudit {
    pub present: bool,
    pub missing_columns: Vec<String>,
    pub extra_columns: Vec<String>,
    pub satisfied_unique: Vec<String>,
}

impl TableAudit {
    /// Whether this table meets its contract: present, no missing
    /// columns, and every contracted unique column enforced by some
    /// unique index. Extra columns never fail the audit.
    #[must_use]
    pub fn satisfies(&self, spec: &TableContract) -> bool {
        self.present
            && self.missing_columns.is_empty()
            && spec.unique.iter().all(|column| self.satisfied_unique.contains(column))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaAuditReport {
    pub ok: bool,
    pub tables: BTreeMap<String, TableAudit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum MigrationStep {
    CreateTable { table: String },
    CreateUniqueIndex { table: String, column: String },
    AddColumn { table: String, column: String },
    RebuildTable { table: String, reason: String },
    Warning { table: String, detail: String },
}

impl MigrationStep {
    #[must_use]
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning { .. })
    }

    /// Ledger-friendly one-line description of the step.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::CreateTable { table } => format!("CREATE {table}"),
            Self::CreateUniqueIndex { table, column } => {
                format!("INDEX {}({column})", unique_index_name(table, column))
            }
            Self::AddColumn { table, column } => format!("ALTER {table} ADD {column}"),
            Self::RebuildTable { table, reason } => format!("REBUILD {table} ({reason})"),
            Self::Warning { table, detail } => format!("[WARN] {table}: {detail}"),
        }
    }
}

/// One row of the append-only migration ledger.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationRecord {
    pub version: String,
    pub applied_at: String,
    pub details: Vec<String>,
}

/// One row of the run index, the system of record for "latest run" and
/// "run by id" lookups.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunIndexEntry {
    pub snapshot_id: String,
    pub run_id: String,
    pub created_at: String,
    pub pre_checksum: Option<String>,
    pub post_checksum: Option<String>,
    pub run_dir: String,
    pub status: RunStatus,
}

/// One structured event for the dual memory/trace logs. Both sinks
/// consume the same shape; there is exactly one way to build it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub label: String,
    pub run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub payload: Value,
}

impl Event {
    #[must_use]
    pub fn new(label: impl Into<String>, run_id: RunId, payload: Value) -> Self {
        Self { label: label.into(), run_id, recorded_at: OffsetDateTime::now_utc(), payload }
    }
}

/// Reconciliation result for the memory and trace event streams. Lists
/// hold run IDs; mismatches are data, never errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, Eq, PartialEq)]
pub struct CrosscheckReport {
    pub memory_only_starts: Vec<String>,
    pub trace_only_starts: Vec<String>,
    pub memory_only_dones: Vec<String>,
    pub trace_only_dones: Vec<String>,
    pub duplicates: Vec<String>,
}

impl CrosscheckReport {
    #[must_use]
    pub fn is_aligned(&self) -> bool {
        self.memory_only_starts.is_empty()
            && self.trace_only_starts.is_empty()
            && self.memory_only_dones.is_empty()
            && self.trace_only_dones.is_empty()
            && self.duplicates.is_empty()
    }
}

// ---------- DDL builders ----------

/// Build the permissive CREATE TABLE statement for one contracted table.
/// Everything is TEXT except the conventional `id` autoincrement key,
/// the ledger's `version` primary key, and the run index `ts` column,
/// which carries a default so inserts may omit it.
#[must_use]
pub fn create_table_sql(table: &str, spec: &TableContract) -> String {
    let mut defs = Vec::with_capacity(spec.columns.len());
    for column in &spec.columns {
        if column == "id" {
            defs.push("id INTEGER PRIMARY KEY AUTOINCREMENT".to_string());
        } else if table == "schema_migrations" && column == "version" {
            defs.push("version TEXT PRIMARY KEY".to_string());
        } else if table == "snapshot_index" && column == "ts" {
            defs.push("ts TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP".to_string());
        } else {
            defs.push(format!("{column} TEXT"));
        }
    }
    format!("CREATE TABLE IF NOT EXISTS {table} ({})", defs.join(", "))
}

#[must_use]
pub fn unique_index_name(table: &str, column: &str) -> String {
    format!("ux_{table}_{column}")
}

#[must_use]
pub fn unique_index_sql(table: &str, column: &str) -> String {
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {table}({column})",
        unique_index_name(table, column)
    )
}

// ---------- canonicalization & checksums ----------

/// One database row as a sorted column-name → JSON-value map, so key
/// ordering in serialized form is stable by construction.
pub type Row = BTreeMap<String, Value>;

/// Total, deterministic ordering over JSON values: rank by type, then by
/// value. Used to canonicalize row order independently of physical
/// storage order.
#[must_use]
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(xi), Some(yi)) = (x.as_i64(), y.as_i64()) {
                xi.cmp(&yi)
            } else {
                let xf = x.as_f64().unwrap_or(f64::NAN);
                let yf = y.as_f64().unwrap_or(f64::NAN);
                xf.total_cmp(&yf).then_with(|| x.to_string().cmp(&y.to_string()))
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                let ord = cmp_values(xv, yv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let mut x_keys: Vec<&String> = x.keys().collect();
            let mut y_keys: Vec<&String> = y.keys().collect();
            x_keys.sort();
            y_keys.sort();
            for (xk, yk) in x_keys.iter().zip(y_keys.iter()) {
                let ord = xk.cmp(yk);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = cmp_values(&x[xk.as_str()], &y[yk.as_str()]);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x_keys.len().cmp(&y_keys.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

fn row_sort_key<'a>(row: &'a Row, key_columns: &[String]) -> Vec<&'a Value> {
    if key_columns.is_empty() {
        row.values().collect()
    } else {
        key_columns.iter().map(|column| row.get(column).unwrap_or(&Value::Null)).collect()
    }
}

fn cmp_keys(a: &[&Value], b: &[&Value]) -> Ordering {
    for (av, bv) in a.iter().zip(b.iter()) {
        let ord = cmp_values(av, bv);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Sort rows by primary-key tuple, or by the full row tuple when the
/// table has no primary key.
pub fn sort_rows(rows: &mut [Row], key_columns: &[String]) {
    rows.sort_by(|a, b| cmp_keys(&row_sort_key(a, key_columns), &row_sort_key(b, key_columns)));
}

/// Encode a row's key tuple as canonical JSON text, usable as a map key.
///
/// # Errors
/// Returns an error when the key tuple cannot be serialized.
pub fn encoded_key(row: &Row, key_columns: &[String]) -> serde_json::Result<String> {
    serde_json::to_string(&row_sort_key(row, key_columns))
}

/// Canonical digest of an already-sorted row set: compact JSON with
/// stable key ordering, hashed as a unit.
///
/// # Errors
/// Returns an error when the rows cannot be serialized.
pub fn rows_sha256(rows: &[Row]) -> serde_json::Result<String> {
    let encoded = serde_json::to_string(rows)?;
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Streamed SHA-256 over file bytes, in 1 MiB blocks.
///
/// # Errors
/// Returns an error when the file cannot be opened or read.
pub fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

// ---------- config resolution ----------

/// Resolve the default snapshot mode from an explicit precedence chain:
/// environment override, then the config file, then the tail of the
/// history file, then heavy. Computed once at process start and threaded
/// into operations as a parameter; there is no ambient mode state.
#[must_use]
pub fn resolve_snapshot_mode(
    env_value: Option<&str>,
    config_file: Option<&Path>,
    history_file: Option<&Path>,
) -> SnapshotMode {
    env_value
        .and_then(SnapshotMode::parse)
        .or_else(|| config_file.and_then(mode_from_config))
        .or_else(|| history_file.and_then(mode_from_history))
        .unwrap_or(SnapshotMode::Heavy)
}

fn read_json_value(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn mode_from_config(path: &Path) -> Option<SnapshotMode> {
    let data = read_json_value(path)?;
    for key in ["snapshot_mode", "mode"] {
        if let Some(mode) = data.get(key).and_then(Value::as_str).and_then(SnapshotMode::parse) {
            return Some(mode);
        }
    }
    None
}

fn mode_from_history(path: &Path) -> Option<SnapshotMode> {
    let data = read_json_value(path)?;
    let history = data.get("history")?.as_array()?;
    // Scan newest to oldest for the first parsable mode.
    history
        .iter()
        .rev()
        .find_map(|entry| entry.get("mode").and_then(Value::as_str).and_then(SnapshotMode::parse))
}
