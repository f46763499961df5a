use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use cycle_count_core::{
    apply_audit_patch, canonical_bin, compute_exceptions, escalation_patch, latest_for_bin,
    mark_found, merge_bin_record, merge_mismatch, normalize_bin, resolution_patch, sort_audits,
    start_patch, submission_patch, AuditId, AuditPatch, AuditStatus, BinRecord, BinRecordPatch,
    CountError, ExceptionFilter, ExceptionRow, ExpectedRow, MismatchOutcome, MismatchReport,
    ReconciliationResult, ScanEntry, WrongBinAuditRecord,
};
use cycle_count_store_sqlite::{
    InMemorySnapshot, KeyValueStore, MemoryStore, SnapshotReader, SqliteStore,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const CYCLE_COUNTS_KEY: &str = "cycle_counts";
pub const WRONG_BIN_AUDITS_KEY: &str = "wrong_bin_audits";
pub const NOT_SCANNED_IGNORE_KEY: &str = "not_scanned_ignore";

/// Audit-sink tab receiving bin count writes.
pub const COUNTS_TAB: &str = "cycle_counts";
/// Audit-sink tab receiving wrong-bin audit writes.
pub const AUDITS_TAB: &str = "wrong_bin_audits";

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Fire-and-forget mirror of written rows for human review. Failures never
/// reach the caller of an operation.
pub trait AuditSink: Send + Sync {
    /// # Errors
    /// Returns an error when the row cannot be delivered.
    fn append(&self, tab: &str, row: &Value) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn append(&self, _tab: &str, _row: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Appends each mirrored row as one JSON line to `<dir>/<tab>.ndjson`.
#[derive(Debug)]
pub struct NdjsonAuditSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl NdjsonAuditSink {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, write_lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn tab_path(&self, tab: &str) -> PathBuf {
        self.dir.join(format!("{tab}.ndjson"))
    }
}

impl AuditSink for NdjsonAuditSink {
    fn append(&self, tab: &str, row: &Value) -> anyhow::Result<()> {
        let line = serde_json::to_string(row).context("failed to serialize audit row")?;
        let _guard = self.write_lock.lock().map_err(|_| anyhow!("audit sink lock poisoned"))?;

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create audit dir {}", self.dir.display()))?;
        let path = self.tab_path(tab);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open audit tab {}", path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append audit row to {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Apply pending migrations to a database file, or report the plan in dry-run mode.
///
/// # Errors
/// Returns [`CountError::DependencyUnavailable`] when the database cannot be
/// opened, inspected or migrated.
pub fn migrate_database(db_path: &Path, dry_run: bool) -> Result<MigrateResult, CountError> {
    let store = SqliteStore::open(db_path).map_err(CountError::dependency)?;
    let before = store.schema_status().map_err(CountError::dependency)?;
    if dry_run {
        return Ok(MigrateResult {
            dry_run: true,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: None,
            up_to_date: None,
        });
    }

    store.migrate().map_err(CountError::dependency)?;
    let after = store.schema_status().map_err(CountError::dependency)?;
    info!(
        from = before.current_version,
        to = after.current_version,
        "database migrated"
    );
    Ok(MigrateResult {
        dry_run: false,
        current_version: before.current_version,
        target_version: before.target_version,
        would_apply_versions: before.pending_versions,
        after_version: Some(after.current_version),
        up_to_date: Some(after.pending_versions.is_empty()),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartCountRequest {
    pub bin: String,
    #[serde(default)]
    pub counter: String,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitCountRequest {
    pub bin: String,
    #[serde(default)]
    pub counter: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, alias = "scanEntries", alias = "items")]
    pub entries: Vec<ScanEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub bin: String,
    #[serde(default, alias = "scanEntries", alias = "items")]
    pub entries: Vec<ScanEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkFoundRequest {
    pub bin: String,
    #[serde(alias = "serialId", alias = "identifier")]
    pub serial_id: String,
    #[serde(default, alias = "foundBy", alias = "user")]
    pub found_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkFoundResult {
    pub record: BinRecord,
    pub adjusted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscalationRequest {
    pub bin: String,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportMismatchRequest {
    #[serde(alias = "serialId")]
    pub serial_id: String,
    #[serde(alias = "scannedBin")]
    pub scanned_bin: String,
    #[serde(default, alias = "expectedBin")]
    pub expected_bin: Option<String>,
    #[serde(default, alias = "scannedBy")]
    pub scanned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LookupSerialRequest {
    #[serde(alias = "serialId")]
    pub serial_id: String,
    #[serde(alias = "scannedBin")]
    pub scanned_bin: String,
    #[serde(default, alias = "scannedBy")]
    pub scanned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LookupSerialResult {
    pub serial_id: String,
    pub scanned_bin: String,
    pub expected: Option<ExpectedRow>,
    pub in_expected_bin: bool,
    pub audit: Option<WrongBinAuditRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IgnoreResult {
    pub serial_id: String,
    pub changed: bool,
    pub ignored: Vec<String>,
}

/// Facade over the bin record repository, wrong-bin ledger and not-scanned
/// aggregator. Every collaborator is injected; nothing is process-global.
#[derive(Clone)]
pub struct CycleCountApi {
    store: Arc<dyn KeyValueStore>,
    snapshot: Arc<dyn SnapshotReader>,
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl CycleCountApi {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, snapshot: Arc<dyn SnapshotReader>) -> Self {
        Self { store, snapshot, sink: Arc::new(NoopAuditSink), clock: Arc::new(SystemClock) }
    }

    /// In-process store over an already loaded snapshot.
    #[must_use]
    pub fn in_memory(snapshot: InMemorySnapshot) -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(snapshot))
    }

    /// Open (and migrate) a `SQLite` database serving both records and snapshot.
    ///
    /// # Errors
    /// Returns [`CountError::DependencyUnavailable`] when the database cannot be
    /// opened or migrated.
    pub fn open_sqlite(db_path: &Path) -> Result<Self, CountError> {
        let store = Arc::new(SqliteStore::open_migrated(db_path).map_err(CountError::dependency)?);
        Ok(Self::new(store.clone(), store))
    }

    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create or touch the record for a bin and set its counter.
    ///
    /// # Errors
    /// Returns [`CountError::InvalidArgument`] for a blank bin, or
    /// [`CountError::DependencyUnavailable`] when the store fails.
    pub fn start_count(&self, request: &StartCountRequest) -> Result<BinRecord, CountError> {
        let bin = normalize_bin(&request.bin)?;
        let now = self.clock.now();
        let record =
            self.upsert(start_patch(&bin, &request.counter, request.user.as_deref()), now)?;
        info!(bin = %record.bin, counter = %record.counter, state = record.state.as_str(), "count started");
        Ok(record)
    }

    /// Reconcile a scan list against the snapshot without writing anything.
    ///
    /// # Errors
    /// Returns [`CountError::InvalidArgument`] for a blank bin, or
    /// [`CountError::DependencyUnavailable`] when the snapshot cannot be read.
    pub fn reconcile(&self, request: &ReconcileRequest) -> Result<ReconciliationResult, CountError> {
        let bin = normalize_bin(&request.bin)?;
        let rows = self.snapshot.expected_rows(&bin).map_err(CountError::dependency)?;
        debug!(bin = %bin, expected_rows = rows.len(), entries = request.entries.len(), "reconciling");
        cycle_count_core::reconcile(&bin, &rows, &request.entries)
    }

    /// Reconcile and persist a completed count.
    ///
    /// # Errors
    /// Returns [`CountError::InvalidArgument`] for a blank bin, or
    /// [`CountError::DependencyUnavailable`] when the snapshot or store fails.
    pub fn submit_count(&self, request: SubmitCountRequest) -> Result<BinRecord, CountError> {
        let bin = normalize_bin(&request.bin)?;
        let result = self.reconcile(&ReconcileRequest {
            bin: bin.clone(),
            entries: request.entries.clone(),
        })?;
        let existing = self.find_latest(&bin)?;
        let now = self.clock.now();
        let patch = submission_patch(
            existing.as_ref(),
            &request.counter,
            &request.user,
            request.entries,
            result,
            now,
        );
        let record = self.upsert(patch, now)?;
        info!(
            bin = %record.bin,
            total = record.total,
            scanned = record.scanned,
            missing = record.missing,
            state = record.state.as_str(),
            "count submitted"
        );
        self.mirror(COUNTS_TAB, &record);
        Ok(record)
    }

    /// Apply the one-unit found adjustment for a serial or SKU.
    ///
    /// # Errors
    /// Returns [`CountError::InvalidArgument`] for a blank bin or identifier, or
    /// [`CountError::DependencyUnavailable`] when the store fails.
    pub fn mark_found(&self, request: &MarkFoundRequest) -> Result<MarkFoundResult, CountError> {
        let bin = normalize_bin(&request.bin)?;
        let existing = self.find_latest(&bin)?;
        let now = self.clock.now();
        let found = mark_found(existing.as_ref(), &bin, &request.serial_id, &request.found_by, now)?;
        let record = self.upsert(found.patch, now)?;
        info!(
            bin = %record.bin,
            identifier = %request.serial_id.trim(),
            adjusted = found.adjusted,
            missing = record.missing,
            "item marked found"
        );
        if found.adjusted {
            self.mirror(COUNTS_TAB, &record);
        }
        Ok(MarkFoundResult { record, adjusted: found.adjusted })
    }

    /// # Errors
    /// Returns [`CountError::NotFound`] when the bin has no record,
    /// [`CountError::InvalidArgument`] for a blank bin or actor, or
    /// [`CountError::DependencyUnavailable`] when the store fails.
    pub fn escalate(&self, request: &EscalationRequest) -> Result<BinRecord, CountError> {
        let existing = self.require_record(&request.bin)?;
        let now = self.clock.now();
        let record = self.upsert(escalation_patch(&existing, &request.actor, now)?, now)?;
        info!(bin = %record.bin, actor = %request.actor.trim(), "bin escalated to supervisor");
        self.mirror(COUNTS_TAB, &record);
        Ok(record)
    }

    /// # Errors
    /// Returns [`CountError::NotFound`] when the bin has no record,
    /// [`CountError::InvalidArgument`] when it is not escalated or the actor is
    /// blank, or [`CountError::DependencyUnavailable`] when the store fails.
    pub fn resolve_escalation(&self, request: &EscalationRequest) -> Result<BinRecord, CountError> {
        let existing = self.require_record(&request.bin)?;
        let now = self.clock.now();
        let record = self.upsert(resolution_patch(&existing, &request.actor, now)?, now)?;
        info!(
            bin = %record.bin,
            actor = %request.actor.trim(),
            state = record.state.as_str(),
            "escalation resolved"
        );
        self.mirror(COUNTS_TAB, &record);
        Ok(record)
    }

    /// # Errors
    /// Returns [`CountError::NotFound`] when the bin has no record.
    pub fn get_bin_status(&self, bin: &str) -> Result<BinRecord, CountError> {
        self.require_record(bin)
    }

    /// All bin records ordered by bin code.
    ///
    /// # Errors
    /// Returns [`CountError::DependencyUnavailable`] when the store fails.
    pub fn list_bins(&self) -> Result<Vec<BinRecord>, CountError> {
        let mut records = self.load_records()?;
        records.sort_by(|lhs, rhs| lhs.bin.cmp(&rhs.bin));
        Ok(records)
    }

    /// Open or refresh the wrong-bin audit for a serial. A missing expected
    /// bin is resolved from the snapshot.
    ///
    /// # Errors
    /// Returns [`CountError::InvalidArgument`] for a blank serial or scanned
    /// bin, or [`CountError::DependencyUnavailable`] when a collaborator fails.
    pub fn report_mismatch(
        &self,
        request: &ReportMismatchRequest,
    ) -> Result<MismatchOutcome, CountError> {
        let expected_bin = match request.expected_bin.as_deref().map(str::trim) {
            Some(bin) if !bin.is_empty() => canonical_bin(bin),
            _ => self
                .snapshot
                .find_serial(&request.serial_id)
                .map_err(CountError::dependency)?
                .map(|row| canonical_bin(&row.location))
                .unwrap_or_default(),
        };
        self.record_mismatch(&MismatchReport {
            serial_id: request.serial_id.clone(),
            scanned_bin: request.scanned_bin.clone(),
            expected_bin,
            scanned_by: request.scanned_by.clone(),
        })
    }

    /// Resolve a scanned serial against the snapshot, opening a wrong-bin audit
    /// when it turns up outside its expected location.
    ///
    /// # Errors
    /// Returns [`CountError::InvalidArgument`] for a blank serial or scanned
    /// bin, or [`CountError::DependencyUnavailable`] when a collaborator fails.
    pub fn lookup_serial(
        &self,
        request: &LookupSerialRequest,
    ) -> Result<LookupSerialResult, CountError> {
        let serial_id = request.serial_id.trim().to_string();
        if serial_id.is_empty() {
            return Err(CountError::InvalidArgument("serial_id MUST be provided".to_string()));
        }
        let scanned_bin = normalize_bin(&request.scanned_bin)
            .map_err(|_| CountError::InvalidArgument("scanned_bin MUST be provided".to_string()))?;

        let expected = self.snapshot.find_serial(&serial_id).map_err(CountError::dependency)?;
        let Some(row) = expected else {
            warn!(serial_id = %serial_id, scanned_bin = %scanned_bin, "serial not present in snapshot");
            return Ok(LookupSerialResult {
                serial_id,
                scanned_bin,
                expected: None,
                in_expected_bin: false,
                audit: None,
            });
        };

        let expected_bin = canonical_bin(&row.location);
        let in_expected_bin = expected_bin == scanned_bin;
        let audit = if in_expected_bin {
            None
        } else {
            let outcome = self.record_mismatch(&MismatchReport {
                serial_id: serial_id.clone(),
                scanned_bin: scanned_bin.clone(),
                expected_bin,
                scanned_by: request.scanned_by.clone(),
            })?;
            Some(outcome.record)
        };

        Ok(LookupSerialResult { serial_id, scanned_bin, expected: Some(row), in_expected_bin, audit })
    }

    /// # Errors
    /// Returns [`CountError::InvalidArgument`] for a malformed id,
    /// [`CountError::NotFound`] for an unknown one, or
    /// [`CountError::DependencyUnavailable`] when the store fails.
    pub fn patch_audit(
        &self,
        id: &str,
        patch: &AuditPatch,
    ) -> Result<WrongBinAuditRecord, CountError> {
        let audit_id = AuditId::parse(id)
            .ok_or_else(|| CountError::InvalidArgument(format!("invalid audit id: {id}")))?;
        let mut audits = self.load_audits()?;
        let updated = apply_audit_patch(&mut audits, audit_id, patch, self.clock.now())?;
        self.save_json(WRONG_BIN_AUDITS_KEY, &audits)?;
        info!(audit_id = %updated.id, status = updated.status.as_str(), "wrong-bin audit patched");
        self.mirror(AUDITS_TAB, &updated);
        Ok(updated)
    }

    /// Audits newest first, optionally restricted to one status.
    ///
    /// # Errors
    /// Returns [`CountError::DependencyUnavailable`] when the store fails.
    pub fn list_audits(
        &self,
        status: Option<AuditStatus>,
    ) -> Result<Vec<WrongBinAuditRecord>, CountError> {
        let mut audits = self.load_audits()?;
        if let Some(status) = status {
            audits.retain(|audit| audit.status == status);
        }
        sort_audits(&mut audits);
        Ok(audits)
    }

    /// # Errors
    /// Returns [`CountError::DependencyUnavailable`] when the store fails.
    pub fn list_exceptions(&self, filter: &ExceptionFilter) -> Result<Vec<ExceptionRow>, CountError> {
        let records = self.load_records()?;
        let ignored = self.load_ignored()?;
        let rows = compute_exceptions(&records, &ignored, filter);
        debug!(records = records.len(), ignored = ignored.len(), rows = rows.len(), "exceptions computed");
        Ok(rows)
    }

    /// # Errors
    /// Returns [`CountError::InvalidArgument`] for a blank serial, or
    /// [`CountError::DependencyUnavailable`] when the store fails.
    pub fn ignore_serial(&self, serial_id: &str) -> Result<IgnoreResult, CountError> {
        self.update_ignored(serial_id, true)
    }

    /// # Errors
    /// Returns [`CountError::InvalidArgument`] for a blank serial, or
    /// [`CountError::DependencyUnavailable`] when the store fails.
    pub fn unignore_serial(&self, serial_id: &str) -> Result<IgnoreResult, CountError> {
        self.update_ignored(serial_id, false)
    }

    /// # Errors
    /// Returns [`CountError::DependencyUnavailable`] when the store fails.
    pub fn list_ignored(&self) -> Result<Vec<String>, CountError> {
        Ok(self.load_ignored()?.into_iter().collect())
    }

    fn update_ignored(&self, serial_id: &str, ignore: bool) -> Result<IgnoreResult, CountError> {
        let serial_id = serial_id.trim().to_string();
        if serial_id.is_empty() {
            return Err(CountError::InvalidArgument("serial_id MUST be provided".to_string()));
        }
        let mut ignored = self.load_ignored()?;
        let changed =
            if ignore { ignored.insert(serial_id.clone()) } else { ignored.remove(&serial_id) };
        if changed {
            self.save_json(NOT_SCANNED_IGNORE_KEY, &ignored)?;
            info!(serial_id = %serial_id, ignored = ignore, "ignore list updated");
        }
        Ok(IgnoreResult { serial_id, changed, ignored: ignored.into_iter().collect() })
    }

    fn record_mismatch(&self, report: &MismatchReport) -> Result<MismatchOutcome, CountError> {
        let mut audits = self.load_audits()?;
        let outcome = merge_mismatch(&mut audits, report, self.clock.now())?;
        self.save_json(WRONG_BIN_AUDITS_KEY, &audits)?;
        info!(
            audit_id = %outcome.record.id,
            serial_id = %outcome.record.serial_id,
            scanned_bin = %outcome.record.scanned_bin,
            expected_bin = %outcome.record.expected_bin,
            created = outcome.created,
            "wrong-bin mismatch recorded"
        );
        self.mirror(AUDITS_TAB, &outcome.record);
        Ok(outcome)
    }

    fn require_record(&self, bin: &str) -> Result<BinRecord, CountError> {
        let bin = normalize_bin(bin)?;
        self.find_latest(&bin)?
            .ok_or_else(|| CountError::NotFound(format!("no count record for bin {bin}")))
    }

    fn find_latest(&self, bin: &str) -> Result<Option<BinRecord>, CountError> {
        let records = self.load_records()?;
        Ok(latest_for_bin(&records, bin).cloned())
    }

    /// Read-merge-write of one bin. Duplicates of the bin collapse into the
    /// merged record. There is no lock across the read and the write.
    fn upsert(&self, patch: BinRecordPatch, now: OffsetDateTime) -> Result<BinRecord, CountError> {
        let bin = normalize_bin(&patch.bin)?;
        let mut records = self.load_records()?;
        let existing = latest_for_bin(&records, &bin).cloned();
        let merged = merge_bin_record(existing, patch, now)?;
        records.retain(|record| canonical_bin(&record.bin) != bin);
        records.push(merged.clone());
        self.save_json(CYCLE_COUNTS_KEY, &records)?;
        Ok(merged)
    }

    fn load_records(&self) -> Result<Vec<BinRecord>, CountError> {
        self.load_json(CYCLE_COUNTS_KEY)
    }

    fn load_audits(&self) -> Result<Vec<WrongBinAuditRecord>, CountError> {
        self.load_json(WRONG_BIN_AUDITS_KEY)
    }

    fn load_ignored(&self) -> Result<BTreeSet<String>, CountError> {
        self.load_json(NOT_SCANNED_IGNORE_KEY)
    }

    fn load_json<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, CountError> {
        match self.store.get(key).map_err(CountError::dependency)? {
            Some(value) => serde_json::from_value(value)
                .with_context(|| format!("stored value for key {key} is malformed"))
                .map_err(CountError::dependency),
            None => Ok(T::default()),
        }
    }

    fn save_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CountError> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("failed to serialize value for key {key}"))
            .map_err(CountError::dependency)?;
        self.store.set(key, &value).map_err(CountError::dependency)
    }

    fn mirror<T: Serialize>(&self, tab: &str, row: &T) {
        let delivered = serde_json::to_value(row)
            .context("failed to serialize mirrored row")
            .and_then(|value| self.sink.append(tab, &value));
        if let Err(err) = delivered {
            warn!(tab, error = %format!("{err:#}"), "audit sink append failed");
        }
    }
}
