use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use snapshot_kernel_core::{
    resolve_snapshot_mode, Event, RunId, RunIndexEntry, RunStatus, SchemaContract, SnapshotLabel,
    SnapshotMode,
};
use snapshot_kernel_store_sqlite::{
    load_diff_report, load_snapshot_meta, write_audit_line, CrosscheckQuery, SnapshotStore,
};

const CLI_CONTRACT_VERSION: &str = "sk.v1";
const MODE_ENV_VARS: [&str; 2] = ["SNAPSHOT_KERNEL_MODE", "SK_SNAPSHOT_MODE"];
const CONFIG_FILE: &str = "configs/snapshot_kernel.json";
const HISTORY_FILE: &str = "configs/snapshot_history.json";

#[derive(Debug, Parser)]
#[command(name = "sk")]
#[command(about = "Snapshot Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./snapshot_kernel.sqlite3")]
    db: PathBuf,

    /// Root directory holding `.snapshots/` and `configs/`.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    Crosscheck(CrosscheckArgs),
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    Take(SnapshotTakeArgs),
    Diff(SnapshotDiffArgs),
    Wrap(SnapshotWrapArgs),
}

#[derive(Debug, Args)]
struct SnapshotTakeArgs {
    #[arg(long)]
    label: String,
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    mode: Option<String>,
}

#[derive(Debug, Args)]
struct SnapshotDiffArgs {
    #[arg(long)]
    pre_meta: PathBuf,
    #[arg(long)]
    post_meta: PathBuf,
}

#[derive(Debug, Args)]
struct SnapshotWrapArgs {
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    mode: Option<String>,
    /// Command to run between the pre and post snapshots.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum SchemaCommand {
    Audit(SchemaAuditArgs),
    Migrate(SchemaMigrateArgs),
}

#[derive(Debug, Args)]
struct SchemaAuditArgs {
    /// Contract JSON file; defaults to the built-in contract.
    #[arg(long)]
    contract: Option<PathBuf>,
    /// Exit non-zero when the audit finds a violation.
    #[arg(long, default_value_t = false)]
    assert: bool,
    /// Include the full per-table report in the output.
    #[arg(long, default_value_t = false)]
    print_report: bool,
}

#[derive(Debug, Args)]
struct SchemaMigrateArgs {
    #[arg(long)]
    contract: Option<PathBuf>,
    /// Execute the migration; without this flag only the plan is shown.
    #[arg(long, default_value_t = false)]
    apply: bool,
    /// Free-form note carried in the command output.
    #[arg(long)]
    reason: Option<String>,
}

#[derive(Debug, Subcommand)]
enum RunsCommand {
    Latest,
    Show(RunsShowArgs),
    Audit(RunsAuditArgs),
}

#[derive(Debug, Args)]
struct RunsShowArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
struct RunsAuditArgs {
    #[arg(long)]
    run_id: Option<String>,
}

#[derive(Debug, Args)]
struct CrosscheckArgs {
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long, default_value_t = 500)]
    window: u32,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mode = resolved_mode(&cli.root);
    match cli.command {
        Command::Snapshot { command } => match command {
            SnapshotCommand::Take(args) => {
                let store = SnapshotStore::open(&cli.db)?;
                run_snapshot_take(&args, &store, &cli.root, mode)
            }
            SnapshotCommand::Diff(args) => run_snapshot_diff(&args),
            SnapshotCommand::Wrap(args) => {
                let store = SnapshotStore::open(&cli.db)?;
                run_snapshot_wrap(&args, &store, &cli.root, mode)
            }
        },
        Command::Schema { command } => match command {
            SchemaCommand::Audit(args) => {
                let store = SnapshotStore::open(&cli.db)?;
                run_schema_audit(&args, &store)
            }
            SchemaCommand::Migrate(args) => {
                let mut store = SnapshotStore::open(&cli.db)?;
                run_schema_migrate(&args, &mut store)
            }
        },
        Command::Runs { command } => {
            let store = SnapshotStore::open(&cli.db)?;
            match command {
                RunsCommand::Latest => run_runs_latest(&store),
                RunsCommand::Show(args) => run_runs_show(&args, &store),
                RunsCommand::Audit(args) => run_runs_audit(&args, &store),
            }
        }
        Command::Crosscheck(args) => {
            let store = SnapshotStore::open(&cli.db)?;
            run_crosscheck(&args, &store)
        }
    }
}

fn resolved_mode(root: &Path) -> SnapshotMode {
    let env_value = MODE_ENV_VARS.iter().find_map(|name| std::env::var(name).ok());
    resolve_snapshot_mode(
        env_value.as_deref(),
        Some(&root.join(CONFIG_FILE)),
        Some(&root.join(HISTORY_FILE)),
    )
}

fn parse_mode(raw: Option<&str>, resolved: SnapshotMode) -> Result<SnapshotMode> {
    match raw {
        None => Ok(resolved),
        Some(value) => SnapshotMode::parse(value)
            .ok_or_else(|| anyhow!("unknown snapshot mode: {value} (expected off|light|heavy)")),
    }
}

fn parse_label(raw: &str) -> Result<SnapshotLabel> {
    SnapshotLabel::parse(raw)
        .ok_or_else(|| anyhow!("unknown snapshot label: {raw} (expected pre|post)"))
}

fn load_contract(path: Option<&Path>) -> Result<SchemaContract> {
    let contract = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read contract file {}", path.display()))?;
            SchemaContract::from_json_str(&raw)?
        }
        None => SchemaContract::builtin(),
    };
    contract.validate()?;
    Ok(contract)
}

fn run_snapshot_take(
    args: &SnapshotTakeArgs,
    store: &SnapshotStore,
    root: &Path,
    resolved: SnapshotMode,
) -> Result<ExitCode> {
    let label = parse_label(&args.label)?;
    let mode = parse_mode(args.mode.as_deref(), resolved)?;
    let run_id = RunId::from(args.run_id.as_str());

    let snapshot = store.take_snapshot(root, label, &run_id, mode)?;
    emit_json(serde_json::to_value(&snapshot).context("failed to serialize snapshot")?)?;
    Ok(ExitCode::SUCCESS)
}

fn run_snapshot_diff(args: &SnapshotDiffArgs) -> Result<ExitCode> {
    let pre = load_snapshot_meta(&args.pre_meta)?;
    let post = load_snapshot_meta(&args.post_meta)?;
    let report = SnapshotStore::compare_snapshots(&pre, &post)?;
    emit_json(serde_json::to_value(&report).context("failed to serialize diff report")?)?;
    Ok(ExitCode::SUCCESS)
}

fn run_snapshot_wrap(
    args: &SnapshotWrapArgs,
    store: &SnapshotStore,
    root: &Path,
    resolved: SnapshotMode,
) -> Result<ExitCode> {
    let mode = parse_mode(args.mode.as_deref(), resolved)?;
    let run_id = args.run_id.as_deref().map_or_else(RunId::new, RunId::from);

    let pre = store.take_snapshot(root, SnapshotLabel::Pre, &run_id, mode)?;
    let run_dir = PathBuf::from(&pre.run_dir);

    let start = Event::new(
        "snapshot_wrap start",
        run_id.clone(),
        serde_json::json!({ "command": args.command, "mode": mode.as_str() }),
    );
    write_audit_line(&run_dir, &start)?;
    store.record_dual(&start)?;

    let (program, rest) = args
        .command
        .split_first()
        .ok_or_else(|| anyhow!("wrap requires a command after --"))?;
    let child = std::process::Command::new(program)
        .args(rest)
        .status()
        .with_context(|| format!("failed to run wrapped command: {program}"));

    // Exit status of the wrapped command, 1 when it could not be
    // spawned or died on a signal.
    let exit_code = match &child {
        Ok(status) => status.code().unwrap_or(1),
        Err(_) => 1,
    };
    let status = if exit_code == 0 { RunStatus::Ok } else { RunStatus::Error };

    let post = store.take_snapshot(root, SnapshotLabel::Post, &run_id, mode)?;
    let diff = if mode == SnapshotMode::Off {
        None
    } else {
        Some(SnapshotStore::compare_snapshots(&pre, &post)?)
    };

    let done = Event::new(
        "snapshot_wrap done",
        run_id.clone(),
        serde_json::json!({
            "status": status.as_str(),
            "exit_code": exit_code,
            "tables_changed": diff.as_ref().map(|d| d.tables_changed.clone()),
        }),
    );
    write_audit_line(&run_dir, &done)?;
    store.record_dual(&done)?;

    let snapshot_id = store.index_run(
        &run_id,
        &run_dir,
        pre.db_checksum.as_deref(),
        post.db_checksum.as_deref(),
        status,
    )?;

    emit_json(serde_json::json!({
        "run_id": run_id.as_str(),
        "snapshot_id": snapshot_id,
        "status": status.as_str(),
        "exit_code": exit_code,
        "run_dir": pre.run_dir,
        "diff": diff,
    }))?;

    if let Err(err) = child {
        return Err(err);
    }
    Ok(exit_code_from(exit_code))
}

fn run_schema_audit(args: &SchemaAuditArgs, store: &SnapshotStore) -> Result<ExitCode> {
    let contract = load_contract(args.contract.as_deref())?;
    let report = store.audit_schema(&contract)?;

    let mut output = serde_json::json!({
        "ok": report.ok,
        "contract": contract.version,
    });
    if args.print_report {
        output["tables"] =
            serde_json::to_value(&report.tables).context("failed to serialize audit report")?;
    }
    emit_json(output)?;

    if args.assert && !report.ok {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_schema_migrate(args: &SchemaMigrateArgs, store: &mut SnapshotStore) -> Result<ExitCode> {
    let contract = load_contract(args.contract.as_deref())?;

    if !args.apply {
        // Plan only: describe what an apply would do, change nothing.
        let report = store.audit_schema(&contract)?;
        let mut planned = Vec::new();
        for (table, audit) in &report.tables {
            if !audit.satisfies(
                contract
                    .tables
                    .get(table)
                    .ok_or_else(|| anyhow!("contract does not declare table {table}"))?,
            ) {
                planned.push(table.clone());
            }
        }
        emit_json(serde_json::json!({
            "applied": false,
            "contract": contract.version,
            "tables_needing_migration": planned,
            "reason": args.reason,
        }))?;
        return Ok(ExitCode::SUCCESS);
    }

    let steps = store.apply_migrations(&contract)?;
    let details: Vec<String> = steps.iter().map(|step| step.describe()).collect();
    let warnings = steps.iter().filter(|step| step.is_warning()).count();
    emit_json(serde_json::json!({
        "applied": true,
        "contract": contract.version,
        "steps": details,
        "warnings": warnings,
        "reason": args.reason,
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn run_runs_latest(store: &SnapshotStore) -> Result<ExitCode> {
    let entry = store.latest_run(None)?.ok_or_else(|| anyhow!("no runs indexed"))?;
    emit_json(serde_json::to_value(&entry).context("failed to serialize run entry")?)?;
    Ok(ExitCode::SUCCESS)
}

fn run_runs_show(args: &RunsShowArgs, store: &SnapshotStore) -> Result<ExitCode> {
    let entry = store
        .latest_run(Some(&args.run_id))?
        .ok_or_else(|| anyhow!("run not found in snapshot_index: {}", args.run_id))?;
    emit_json(serde_json::to_value(&entry).context("failed to serialize run entry")?)?;
    Ok(ExitCode::SUCCESS)
}

fn run_runs_audit(args: &RunsAuditArgs, store: &SnapshotStore) -> Result<ExitCode> {
    let entry = match &args.run_id {
        Some(id) => store
            .latest_run(Some(id))?
            .ok_or_else(|| anyhow!("run not found in snapshot_index: {id}"))?,
        None => store.latest_run(None)?.ok_or_else(|| anyhow!("no runs indexed"))?,
    };

    let diff = load_diff_report(Path::new(&entry.run_dir)).ok();
    let summary = audit_summary(&entry, diff.as_ref())?;

    let event = Event::new("runs_audit report", RunId::from(entry.run_id.as_str()), summary.clone());
    store.record_dual(&event)?;

    emit_json(summary)?;
    Ok(ExitCode::SUCCESS)
}

fn audit_summary(entry: &RunIndexEntry, diff: Option<&snapshot_kernel_core::DiffReport>) -> Result<Value> {
    Ok(serde_json::json!({
        "snapshot_id": entry.snapshot_id,
        "run_id": entry.run_id,
        "status": entry.status.as_str(),
        "run_dir": entry.run_dir,
        "diff": diff
            .map(serde_json::to_value)
            .transpose()
            .context("failed to serialize diff report")?,
    }))
}

fn run_crosscheck(args: &CrosscheckArgs, store: &SnapshotStore) -> Result<ExitCode> {
    let query = CrosscheckQuery {
        run_id: args.run_id.clone(),
        window: args.window,
        ..CrosscheckQuery::default()
    };
    let report = store.crosscheck(&query)?;
    emit_json(serde_json::json!({
        "aligned": report.is_aligned(),
        "memory_only_starts": report.memory_only_starts,
        "trace_only_starts": report.trace_only_starts,
        "memory_only_dones": report.memory_only_dones,
        "trace_only_dones": report.trace_only_dones,
        "duplicates": report.duplicates,
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn exit_code_from(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}
