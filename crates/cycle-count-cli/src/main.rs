use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cycle_count_api::{
    migrate_database, CycleCountApi, EscalationRequest, LookupSerialRequest, MarkFoundRequest,
    NdjsonAuditSink, ReconcileRequest, ReportMismatchRequest, StartCountRequest,
    SubmitCountRequest,
};
use cycle_count_core::{normalize_bin, AuditPatch, AuditStatus, ExceptionFilter, ScanEntry};
use cycle_count_store_sqlite::{SnapshotReader, SqliteStore};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

mod logging;

use logging::{init_tracing, LogFormat};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ccount")]
#[command(about = "Cycle count reconciliation CLI")]
struct Cli {
    #[arg(long, env = "CYCLE_COUNT_DB", default_value = "./cycle_count.sqlite3")]
    db: PathBuf,
    /// Directory receiving one NDJSON mirror file per audit tab.
    #[arg(long, env = "CYCLE_COUNT_AUDIT_DIR")]
    audit_dir: Option<PathBuf>,
    #[arg(long, env = "CYCLE_COUNT_LOG_LEVEL", default_value = "warn")]
    log_level: String,
    #[arg(long, env = "CYCLE_COUNT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    Count {
        #[command(subcommand)]
        command: Box<CountCommand>,
    },
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
    Exceptions {
        #[command(subcommand)]
        command: ExceptionsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    /// Replace the expected snapshot with an NDJSON file of expected rows.
    Import(SnapshotImportArgs),
    Show(BinArgs),
}

#[derive(Debug, Args)]
struct SnapshotImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct BinArgs {
    #[arg(long)]
    bin: String,
}

#[derive(Debug, Subcommand)]
enum CountCommand {
    Start(CountStartArgs),
    Submit(CountSubmitArgs),
    /// Reconcile without writing.
    Reconcile(CountReconcileArgs),
    MarkFound(CountMarkFoundArgs),
    Escalate(EscalationArgs),
    ResolveEscalation(EscalationArgs),
    Status(BinArgs),
    List,
}

#[derive(Debug, Args)]
struct CountStartArgs {
    #[arg(long)]
    bin: String,
    #[arg(long)]
    counter: String,
    #[arg(long)]
    user: Option<String>,
}

#[derive(Debug, Args)]
struct CountSubmitArgs {
    #[arg(long)]
    bin: String,
    #[arg(long)]
    counter: String,
    #[arg(long)]
    user: String,
    /// JSON file holding an array of scan entries.
    #[arg(long)]
    entries: PathBuf,
}

#[derive(Debug, Args)]
struct CountReconcileArgs {
    #[arg(long)]
    bin: String,
    #[arg(long)]
    entries: PathBuf,
}

#[derive(Debug, Args)]
struct CountMarkFoundArgs {
    #[arg(long)]
    bin: String,
    /// Serial id, or a SKU for a short non-serial item.
    #[arg(long)]
    serial_id: String,
    #[arg(long, default_value = "")]
    found_by: String,
}

#[derive(Debug, Args)]
struct EscalationArgs {
    #[arg(long)]
    bin: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    /// Resolve a scanned serial against the snapshot.
    Lookup(AuditLookupArgs),
    Report(AuditReportArgs),
    Patch(AuditPatchArgs),
    List(AuditListArgs),
}

#[derive(Debug, Args)]
struct AuditLookupArgs {
    #[arg(long)]
    serial_id: String,
    #[arg(long)]
    scanned_bin: String,
    #[arg(long, default_value = "")]
    scanned_by: String,
}

#[derive(Debug, Args)]
struct AuditReportArgs {
    #[arg(long)]
    serial_id: String,
    #[arg(long)]
    scanned_bin: String,
    #[arg(long)]
    expected_bin: Option<String>,
    #[arg(long, default_value = "")]
    scanned_by: String,
}

#[derive(Debug, Args)]
struct AuditPatchArgs {
    #[arg(long)]
    id: String,
    #[arg(long, value_enum)]
    status: Option<AuditStatusArg>,
    #[arg(long)]
    moved_to: Option<String>,
    #[arg(long)]
    moved_by: Option<String>,
}

#[derive(Debug, Args)]
struct AuditListArgs {
    #[arg(long, value_enum)]
    status: Option<AuditStatusArg>,
}

#[derive(Debug, Subcommand)]
enum ExceptionsCommand {
    List(ExceptionsListArgs),
    Ignore(SerialArgs),
    Unignore(SerialArgs),
    Ignored,
}

#[derive(Debug, Args)]
struct ExceptionsListArgs {
    #[arg(long)]
    bin: Option<String>,
    #[arg(long)]
    user: Option<String>,
}

#[derive(Debug, Args)]
struct SerialArgs {
    #[arg(long)]
    serial_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AuditStatusArg {
    Open,
    Moved,
    Closed,
    Invalid,
}

impl From<AuditStatusArg> for AuditStatus {
    fn from(value: AuditStatusArg) -> Self {
        match value {
            AuditStatusArg::Open => Self::Open,
            AuditStatusArg::Moved => Self::Moved,
            AuditStatusArg::Closed => Self::Closed,
            AuditStatusArg::Invalid => Self::Invalid,
        }
    }
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
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn read_entries(path: &Path) -> Result<Vec<ScanEntry>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read entries file {}", path.display()))?;
    let entries: Vec<ScanEntry> = serde_json::from_str(&body).with_context(|| {
        format!("entries file {} is not a JSON array of scan entries", path.display())
    })?;
    debug!(path = %path.display(), entries = entries.len(), "scan entries loaded");
    Ok(entries)
}

fn open_api(cli: &Cli) -> Result<CycleCountApi> {
    debug!(db = %cli.db.display(), "opening cycle count store");
    let api = CycleCountApi::open_sqlite(&cli.db)?;
    Ok(match &cli.audit_dir {
        Some(dir) => api.with_audit_sink(Arc::new(NdjsonAuditSink::new(dir.clone()))),
        None => api,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format)?;

    match &cli.command {
        Command::Db { command } => run_db(command, &cli.db),
        Command::Snapshot { command } => run_snapshot(command, &cli.db),
        Command::Count { command } => run_count(command, &open_api(&cli)?),
        Command::Audit { command } => run_audit(command, &open_api(&cli)?),
        Command::Exceptions { command } => run_exceptions(command, &open_api(&cli)?),
    }
}

fn run_db(command: &DbCommand, db: &Path) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = SqliteStore::open(db)?.schema_status()?;
            emit_json(json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = migrate_database(db, args.dry_run)?;
            info!(
                db = %db.display(),
                dry_run = args.dry_run,
                current_version = result.current_version,
                after_version = ?result.after_version,
                "migrate finished"
            );
            emit(&result)
        }
        DbCommand::IntegrityCheck => emit(&SqliteStore::open_migrated(db)?.integrity_check()?),
    }
}

fn run_snapshot(command: &SnapshotCommand, db: &Path) -> Result<()> {
    let store = SqliteStore::open_migrated(db)?;
    match command {
        SnapshotCommand::Import(args) => {
            let summary = store.import_snapshot_ndjson(&args.input)?;
            info!(
                source = %summary.source,
                rows = summary.rows,
                sha256 = %summary.sha256,
                "snapshot imported"
            );
            emit(&summary)
        }
        SnapshotCommand::Show(args) => {
            let bin = normalize_bin(&args.bin)?;
            let rows = store.expected_rows(&bin)?;
            emit_json(json!({ "bin": bin, "rows": rows }))
        }
    }
}

fn run_count(command: &CountCommand, api: &CycleCountApi) -> Result<()> {
    match command {
        CountCommand::Start(args) => emit(&api.start_count(&StartCountRequest {
            bin: args.bin.clone(),
            counter: args.counter.clone(),
            user: args.user.clone(),
        })?),
        CountCommand::Submit(args) => emit(&api.submit_count(SubmitCountRequest {
            bin: args.bin.clone(),
            counter: args.counter.clone(),
            user: args.user.clone(),
            entries: read_entries(&args.entries)?,
        })?),
        CountCommand::Reconcile(args) => emit(&api.reconcile(&ReconcileRequest {
            bin: args.bin.clone(),
            entries: read_entries(&args.entries)?,
        })?),
        CountCommand::MarkFound(args) => emit(&api.mark_found(&MarkFoundRequest {
            bin: args.bin.clone(),
            serial_id: args.serial_id.clone(),
            found_by: args.found_by.clone(),
        })?),
        CountCommand::Escalate(args) => emit(&api.escalate(&EscalationRequest {
            bin: args.bin.clone(),
            actor: args.actor.clone(),
        })?),
        CountCommand::ResolveEscalation(args) => emit(&api.resolve_escalation(&EscalationRequest {
            bin: args.bin.clone(),
            actor: args.actor.clone(),
        })?),
        CountCommand::Status(args) => emit(&api.get_bin_status(&args.bin)?),
        CountCommand::List => emit_json(json!({ "bins": api.list_bins()? })),
    }
}

fn run_audit(command: &AuditCommand, api: &CycleCountApi) -> Result<()> {
    match command {
        AuditCommand::Lookup(args) => emit(&api.lookup_serial(&LookupSerialRequest {
            serial_id: args.serial_id.clone(),
            scanned_bin: args.scanned_bin.clone(),
            scanned_by: args.scanned_by.clone(),
        })?),
        AuditCommand::Report(args) => emit(&api.report_mismatch(&ReportMismatchRequest {
            serial_id: args.serial_id.clone(),
            scanned_bin: args.scanned_bin.clone(),
            expected_bin: args.expected_bin.clone(),
            scanned_by: args.scanned_by.clone(),
        })?),
        AuditCommand::Patch(args) => emit(&api.patch_audit(
            &args.id,
            &AuditPatch {
                status: args.status.map(AuditStatus::from),
                moved_to: args.moved_to.clone(),
                moved_by: args.moved_by.clone(),
            },
        )?),
        AuditCommand::List(args) => {
            let audits = api.list_audits(args.status.map(AuditStatus::from))?;
            emit_json(json!({ "audits": audits }))
        }
    }
}

fn run_exceptions(command: &ExceptionsCommand, api: &CycleCountApi) -> Result<()> {
    match command {
        ExceptionsCommand::List(args) => {
            let rows = api.list_exceptions(&ExceptionFilter {
                bin: args.bin.clone(),
                user: args.user.clone(),
            })?;
            emit_json(json!({ "rows": rows }))
        }
        ExceptionsCommand::Ignore(args) => emit(&api.ignore_serial(&args.serial_id)?),
        ExceptionsCommand::Unignore(args) => emit(&api.unignore_serial(&args.serial_id)?),
        ExceptionsCommand::Ignored => emit_json(json!({ "ignored": api.list_ignored()? })),
    }
}
