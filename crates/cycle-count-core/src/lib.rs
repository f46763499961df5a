use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CountError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    DependencyUnavailable,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::DependencyUnavailable => "dependency_unavailable",
        }
    }
}

impl CountError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DependencyUnavailable(_) => ErrorKind::DependencyUnavailable,
        }
    }

    /// Wrap a collaborator failure (store, snapshot) without losing its context chain.
    pub fn dependency(err: impl Display) -> Self {
        Self::DependencyUnavailable(format!("{err:#}"))
    }
}

/// Canonical form of a bin code: trimmed and uppercased.
///
/// # Errors
/// Returns [`CountError::InvalidArgument`] when the code is blank.
pub fn normalize_bin(raw: &str) -> Result<String, CountError> {
    let bin = canonical_bin(raw);
    if bin.is_empty() {
        return Err(CountError::InvalidArgument("bin MUST be provided".to_string()));
    }
    Ok(bin)
}

#[must_use]
pub fn canonical_bin(raw: &str) -> String {
    raw.trim().to_uppercase()
}

#[must_use]
pub fn canonical_sku(raw: &str) -> String {
    raw.trim().to_uppercase()
}

fn non_blank(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn require(raw: &str, field: &str) -> Result<String, CountError> {
    non_blank(raw)
        .map(str::to_string)
        .ok_or_else(|| CountError::InvalidArgument(format!("{field} MUST be provided")))
}

fn count_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AuditId(pub Uuid);

impl AuditId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }
}

impl Default for AuditId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AuditId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum BinState {
    #[default]
    Investigation,
    Complete,
    Supervisor,
}

impl BinState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Investigation => "investigation",
            Self::Complete => "complete",
            Self::Supervisor => "supervisor",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "investigation" => Some(Self::Investigation),
            "complete" => Some(Self::Complete),
            "supervisor" => Some(Self::Supervisor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Open,
    Moved,
    Closed,
    Invalid,
}

impl AuditStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Moved => "moved",
            Self::Closed => "closed",
            Self::Invalid => "invalid",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "moved" => Some(Self::Moved),
            "closed" => Some(Self::Closed),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    Serial,
    Nonserial,
}

impl ExceptionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Nonserial => "nonserial",
        }
    }
}

fn default_quantity() -> u32 {
    1
}

/// One line of the expected-inventory snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpectedRow {
    pub location: String,
    pub sku: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "serialId")]
    pub serial_id: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

impl ExpectedRow {
    #[must_use]
    pub fn serial(&self) -> Option<&str> {
        self.serial_id.as_deref().and_then(non_blank)
    }

    /// The row as snapshot readers hand it out: location, SKU and serial
    /// trimmed, blank serial dropped. Case is preserved.
    #[must_use]
    pub fn trimmed(&self) -> Self {
        Self {
            location: self.location.trim().to_string(),
            sku: self.sku.trim().to_string(),
            description: self.description.clone(),
            serial_id: self.serial().map(str::to_string),
            quantity: self.quantity,
        }
    }
}

/// One line of a submitted count. Unknown fields are ignored on input.
///
/// A blank serial counts as absent, so a scan UI that always sends the
/// serial field still yields a non-serial line when a SKU is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged, try_from = "RawScanEntry")]
pub enum ScanEntry {
    Serial { scanned_serial_id: String },
    NonSerial { sku: String, qty_entered: u32 },
}

impl ScanEntry {
    #[must_use]
    pub fn serial(serial_id: impl Into<String>) -> Self {
        Self::Serial { scanned_serial_id: serial_id.into() }
    }

    #[must_use]
    pub fn non_serial(sku: impl Into<String>, qty_entered: u32) -> Self {
        Self::NonSerial { sku: sku.into(), qty_entered }
    }

    #[must_use]
    pub fn serial_id(&self) -> Option<&str> {
        match self {
            Self::Serial { scanned_serial_id } => non_blank(scanned_serial_id),
            Self::NonSerial { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawScanEntry {
    #[serde(default, alias = "scannedSerialId", alias = "serialId", alias = "serial_id")]
    scanned_serial_id: Option<String>,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default, alias = "qtyEntered")]
    qty_entered: Option<u32>,
}

impl TryFrom<RawScanEntry> for ScanEntry {
    type Error = CountError;

    fn try_from(raw: RawScanEntry) -> Result<Self, Self::Error> {
        if let Some(serial) = raw.scanned_serial_id.as_deref().and_then(non_blank) {
            return Ok(Self::serial(serial));
        }
        match (raw.sku.as_deref().and_then(non_blank), raw.qty_entered) {
            (Some(sku), Some(qty_entered)) => Ok(Self::non_serial(sku, qty_entered)),
            (Some(sku), None) => {
                Err(CountError::InvalidArgument(format!("scan entry for sku {sku} has no quantity")))
            }
            (None, _) => Err(CountError::InvalidArgument(
                "scan entry needs a serial id or a sku".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissingSerial {
    pub serial_id: String,
    pub sku: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shortage {
    pub sku: String,
    pub description: String,
    pub expected_qty: u32,
    pub entered_qty: u32,
    pub shortage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub bin: String,
    pub total: u32,
    pub scanned: u32,
    pub missing: u32,
    pub missing_serials: Vec<MissingSerial>,
    pub non_serial_shortages: Vec<Shortage>,
}

struct SkuTally {
    description: String,
    expected: u32,
}

/// Reconcile a bin count against the expected rows.
///
/// Rows for other locations are skipped, so callers may pass either the
/// bin-scoped rows from a snapshot reader or the whole snapshot.
///
/// # Errors
/// Returns [`CountError::InvalidArgument`] when `bin` is blank.
pub fn reconcile(
    bin: &str,
    expected: &[ExpectedRow],
    entries: &[ScanEntry],
) -> Result<ReconciliationResult, CountError> {
    let bin = normalize_bin(bin)?;

    let mut expected_serials: BTreeMap<String, &ExpectedRow> = BTreeMap::new();
    let mut expected_skus: BTreeMap<String, SkuTally> = BTreeMap::new();
    for row in expected.iter().filter(|row| canonical_bin(&row.location) == bin) {
        if let Some(serial) = row.serial() {
            expected_serials.entry(serial.to_string()).or_insert(row);
            continue;
        }
        let sku = canonical_sku(&row.sku);
        if sku.is_empty() {
            continue;
        }
        let tally = expected_skus
            .entry(sku)
            .or_insert_with(|| SkuTally { description: row.description.clone(), expected: 0 });
        tally.expected = tally.expected.saturating_add(row.quantity);
    }

    let scanned_serials =
        entries.iter().filter_map(ScanEntry::serial_id).collect::<BTreeSet<&str>>();

    let mut entered_skus: BTreeMap<String, u32> = BTreeMap::new();
    for entry in entries {
        if let ScanEntry::NonSerial { sku, qty_entered } = entry {
            let sku = canonical_sku(sku);
            if sku.is_empty() {
                continue;
            }
            let slot = entered_skus.entry(sku).or_insert(0);
            *slot = slot.saturating_add(*qty_entered);
        }
    }

    let mut missing_serials = Vec::new();
    let mut matched_serials = 0_u32;
    for (serial, row) in &expected_serials {
        if scanned_serials.contains(serial.as_str()) {
            matched_serials += 1;
        } else {
            missing_serials.push(MissingSerial {
                serial_id: serial.clone(),
                sku: canonical_sku(&row.sku),
                description: row.description.clone(),
            });
        }
    }

    let mut non_serial_shortages = Vec::new();
    let mut expected_qty_total = 0_u32;
    let mut matched_qty_total = 0_u32;
    for (sku, tally) in &expected_skus {
        let entered = entered_skus.get(sku).copied().unwrap_or(0);
        expected_qty_total = expected_qty_total.saturating_add(tally.expected);
        matched_qty_total = matched_qty_total.saturating_add(entered.min(tally.expected));
        if tally.expected > entered {
            non_serial_shortages.push(Shortage {
                sku: sku.clone(),
                description: tally.description.clone(),
                expected_qty: tally.expected,
                entered_qty: entered,
                shortage: tally.expected - entered,
            });
        }
    }

    let total = count_u32(expected_serials.len()).saturating_add(expected_qty_total);
    let scanned = matched_serials.saturating_add(matched_qty_total);

    Ok(ReconciliationResult {
        bin,
        total,
        scanned,
        missing: total.saturating_sub(scanned),
        missing_serials,
        non_serial_shortages,
    })
}

/// The persistent count record for one bin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinRecord {
    pub bin: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub counter: String,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub scanned: u32,
    #[serde(default)]
    pub missing: u32,
    #[serde(default)]
    pub items: Vec<ScanEntry>,
    #[serde(default)]
    pub missing_serials: Vec<MissingSerial>,
    #[serde(default)]
    pub non_serial_shortages: Vec<Shortage>,
    #[serde(default)]
    pub state: BinState,
    #[serde(with = "time::serde::rfc3339")]
    pub started: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub submitted_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub escalated_by: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub escalated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub escalation_resolved_by: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub escalation_resolved_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_found_by: Option<String>,
}

impl BinRecord {
    #[must_use]
    pub fn new(bin: String, started: OffsetDateTime) -> Self {
        Self {
            bin,
            user: String::new(),
            counter: String::new(),
            total: 0,
            scanned: 0,
            missing: 0,
            items: Vec::new(),
            missing_serials: Vec::new(),
            non_serial_shortages: Vec::new(),
            state: BinState::Investigation,
            started,
            updated_at: started,
            submitted_at: None,
            escalated_by: None,
            escalated_at: None,
            escalation_resolved_by: None,
            escalation_resolved_at: None,
            last_found_by: None,
        }
    }

    #[must_use]
    pub fn is_escalated(&self) -> bool {
        self.escalated_at.is_some()
    }

    /// State implied by the current counts. An active escalation always wins.
    #[must_use]
    pub fn derived_state(&self) -> BinState {
        if self.is_escalated() {
            BinState::Supervisor
        } else if self.missing == 0 {
            BinState::Complete
        } else {
            BinState::Investigation
        }
    }

    /// Most recent of `submitted_at`, `updated_at` and `started`.
    #[must_use]
    pub fn last_activity(&self) -> OffsetDateTime {
        let mut latest = self.started.max(self.updated_at);
        if let Some(submitted_at) = self.submitted_at {
            latest = latest.max(submitted_at);
        }
        latest
    }
}

/// Field-level changes for an upsert. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinRecordPatch {
    pub bin: String,
    pub user: Option<String>,
    pub counter: Option<String>,
    pub total: Option<u32>,
    pub scanned: Option<u32>,
    pub missing: Option<u32>,
    pub items: Option<Vec<ScanEntry>>,
    pub missing_serials: Option<Vec<MissingSerial>>,
    pub non_serial_shortages: Option<Vec<Shortage>>,
    pub state: Option<BinState>,
    pub started: Option<OffsetDateTime>,
    pub submitted_at: Option<OffsetDateTime>,
    pub escalated_by: Option<String>,
    pub escalated_at: Option<OffsetDateTime>,
    pub clear_escalation: bool,
    pub escalation_resolved_by: Option<String>,
    pub escalation_resolved_at: Option<OffsetDateTime>,
    pub last_found_by: Option<String>,
}

impl BinRecordPatch {
    #[must_use]
    pub fn for_bin(bin: impl Into<String>) -> Self {
        Self { bin: bin.into(), ..Self::default() }
    }
}

/// Merge a patch into the stored record (or a fresh one).
///
/// `started` is first-write-wins and `updated_at` always becomes `now`.
///
/// # Errors
/// Returns [`CountError::InvalidArgument`] when the patch has no bin code.
pub fn merge_bin_record(
    existing: Option<BinRecord>,
    patch: BinRecordPatch,
    now: OffsetDateTime,
) -> Result<BinRecord, CountError> {
    let bin = normalize_bin(&patch.bin)?;
    let mut record =
        existing.unwrap_or_else(|| BinRecord::new(bin.clone(), patch.started.unwrap_or(now)));
    record.bin = bin;

    if let Some(user) = patch.user {
        record.user = user;
    }
    if let Some(counter) = patch.counter {
        record.counter = counter;
    }
    if let Some(total) = patch.total {
        record.total = total;
    }
    if let Some(scanned) = patch.scanned {
        record.scanned = scanned;
    }
    if let Some(missing) = patch.missing {
        record.missing = missing;
    }
    if let Some(items) = patch.items {
        record.items = items;
    }
    if let Some(missing_serials) = patch.missing_serials {
        record.missing_serials = missing_serials;
    }
    if let Some(shortages) = patch.non_serial_shortages {
        record.non_serial_shortages = shortages;
    }
    if let Some(state) = patch.state {
        record.state = state;
    }
    if let Some(submitted_at) = patch.submitted_at {
        record.submitted_at = Some(submitted_at);
    }
    if patch.clear_escalation {
        record.escalated_by = None;
        record.escalated_at = None;
    }
    if let Some(escalated_by) = patch.escalated_by {
        record.escalated_by = Some(escalated_by);
    }
    if let Some(escalated_at) = patch.escalated_at {
        record.escalated_at = Some(escalated_at);
    }
    if let Some(resolved_by) = patch.escalation_resolved_by {
        record.escalation_resolved_by = Some(resolved_by);
    }
    if let Some(resolved_at) = patch.escalation_resolved_at {
        record.escalation_resolved_at = Some(resolved_at);
    }
    if let Some(found_by) = patch.last_found_by {
        record.last_found_by = Some(found_by);
    }
    record.updated_at = now;

    Ok(record)
}

/// Pick the record for `bin` among possibly duplicated rows, newest activity first.
#[must_use]
pub fn latest_for_bin<'a>(records: &'a [BinRecord], bin: &str) -> Option<&'a BinRecord> {
    let bin = canonical_bin(bin);
    records
        .iter()
        .filter(|record| canonical_bin(&record.bin) == bin)
        .max_by(|lhs, rhs| lhs.last_activity().cmp(&rhs.last_activity()))
}

#[must_use]
pub fn start_patch(bin: &str, counter: &str, user: Option<&str>) -> BinRecordPatch {
    BinRecordPatch {
        counter: Some(counter.trim().to_string()),
        user: user.and_then(non_blank).map(str::to_string),
        ..BinRecordPatch::for_bin(bin)
    }
}

/// Build the write for a completed count. State is recomputed from scratch
/// unless the bin carries an unresolved escalation.
#[must_use]
pub fn submission_patch(
    existing: Option<&BinRecord>,
    counter: &str,
    user: &str,
    entries: Vec<ScanEntry>,
    result: ReconciliationResult,
    now: OffsetDateTime,
) -> BinRecordPatch {
    let escalated = existing.is_some_and(BinRecord::is_escalated);
    let state = if escalated {
        BinState::Supervisor
    } else if result.missing == 0 {
        BinState::Complete
    } else {
        BinState::Investigation
    };

    BinRecordPatch {
        user: Some(user.trim().to_string()),
        counter: Some(counter.trim().to_string()),
        total: Some(result.total),
        scanned: Some(result.scanned),
        missing: Some(result.missing),
        items: Some(entries),
        missing_serials: Some(result.missing_serials),
        non_serial_shortages: Some(result.non_serial_shortages),
        state: Some(state),
        submitted_at: Some(now),
        ..BinRecordPatch::for_bin(result.bin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkFound {
    pub patch: BinRecordPatch,
    pub adjusted: bool,
}

/// One-unit adjustment for an item reported found after the count.
///
/// This deliberately does not re-run [`reconcile`]: the record may not hold
/// the full original scan set.
///
/// # Errors
/// Returns [`CountError::InvalidArgument`] when the bin or identifier is blank.
pub fn mark_found(
    existing: Option<&BinRecord>,
    bin: &str,
    identifier: &str,
    found_by: &str,
    now: OffsetDateTime,
) -> Result<MarkFound, CountError> {
    let bin = normalize_bin(bin)?;
    let identifier = require(identifier, "serial_id")?;
    let mut record = existing.cloned().unwrap_or_else(|| BinRecord::new(bin.clone(), now));

    let before = record.missing_serials.len();
    record.missing_serials.retain(|missing| missing.serial_id.trim() != identifier);
    let mut adjusted = record.missing_serials.len() != before;

    if adjusted {
        let already_listed =
            record.items.iter().any(|entry| entry.serial_id() == Some(identifier.as_str()));
        if !already_listed {
            record.items.push(ScanEntry::serial(identifier.clone()));
        }
    } else {
        let sku = canonical_sku(&identifier);
        if let Some(index) = record.non_serial_shortages.iter().position(|row| row.sku == sku) {
            let row = &mut record.non_serial_shortages[index];
            row.entered_qty = row.entered_qty.saturating_add(1);
            row.shortage = row.expected_qty.saturating_sub(row.entered_qty);
            if row.shortage == 0 {
                record.non_serial_shortages.remove(index);
            }
            bump_item_quantity(&mut record.items, &sku);
            adjusted = true;
        }
    }

    if adjusted {
        record.scanned = record.scanned.saturating_add(1);
        record.missing = record.missing.saturating_sub(1);
    }

    let patch = BinRecordPatch {
        scanned: Some(record.scanned),
        missing: Some(record.missing),
        items: Some(record.items.clone()),
        missing_serials: Some(record.missing_serials.clone()),
        non_serial_shortages: Some(record.non_serial_shortages.clone()),
        state: Some(if adjusted { record.derived_state() } else { record.state }),
        last_found_by: non_blank(found_by).map(str::to_string),
        ..BinRecordPatch::for_bin(bin)
    };

    Ok(MarkFound { patch, adjusted })
}

fn bump_item_quantity(items: &mut Vec<ScanEntry>, sku: &str) {
    for entry in items.iter_mut() {
        if let ScanEntry::NonSerial { sku: entry_sku, qty_entered } = entry {
            if canonical_sku(entry_sku) == sku {
                *qty_entered = qty_entered.saturating_add(1);
                return;
            }
        }
    }
    items.push(ScanEntry::non_serial(sku, 1));
}

/// # Errors
/// Returns [`CountError::InvalidArgument`] when `actor` is blank.
pub fn escalation_patch(
    record: &BinRecord,
    actor: &str,
    now: OffsetDateTime,
) -> Result<BinRecordPatch, CountError> {
    let actor = require(actor, "actor")?;
    Ok(BinRecordPatch {
        state: Some(BinState::Supervisor),
        escalated_by: Some(actor),
        escalated_at: Some(now),
        ..BinRecordPatch::for_bin(record.bin.clone())
    })
}

/// # Errors
/// Returns [`CountError::InvalidArgument`] when `actor` is blank or the bin is
/// not currently escalated.
pub fn resolution_patch(
    record: &BinRecord,
    actor: &str,
    now: OffsetDateTime,
) -> Result<BinRecordPatch, CountError> {
    let actor = require(actor, "actor")?;
    if !record.is_escalated() {
        return Err(CountError::InvalidArgument(format!(
            "bin {} has no active escalation",
            record.bin
        )));
    }
    let state = if record.missing == 0 { BinState::Complete } else { BinState::Investigation };
    Ok(BinRecordPatch {
        state: Some(state),
        clear_escalation: true,
        escalation_resolved_by: Some(actor),
        escalation_resolved_at: Some(now),
        ..BinRecordPatch::for_bin(record.bin.clone())
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrongBinAuditRecord {
    pub id: AuditId,
    pub serial_id: String,
    pub scanned_bin: String,
    pub expected_bin: String,
    pub scanned_by: String,
    pub status: AuditStatus,
    #[serde(default)]
    pub moved_to: Option<String>,
    #[serde(default)]
    pub moved_by: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MismatchReport {
    pub serial_id: String,
    pub scanned_bin: String,
    #[serde(default)]
    pub expected_bin: String,
    #[serde(default)]
    pub scanned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MismatchOutcome {
    pub record: WrongBinAuditRecord,
    pub created: bool,
}

fn fill_blank(slot: &mut String, value: &str) {
    if slot.trim().is_empty() && !value.is_empty() {
        *slot = value.to_string();
    }
}

/// Record a wrong-bin sighting. A serial never holds more than one open audit:
/// a repeat report only fills that audit's blank fields.
///
/// # Errors
/// Returns [`CountError::InvalidArgument`] when the serial or scanned bin is blank.
pub fn merge_mismatch(
    audits: &mut Vec<WrongBinAuditRecord>,
    report: &MismatchReport,
    now: OffsetDateTime,
) -> Result<MismatchOutcome, CountError> {
    let serial_id = require(&report.serial_id, "serial_id")?;
    let scanned_bin = normalize_bin(&report.scanned_bin)
        .map_err(|_| CountError::InvalidArgument("scanned_bin MUST be provided".to_string()))?;
    let expected_bin = canonical_bin(&report.expected_bin);
    let scanned_by = report.scanned_by.trim().to_string();

    if let Some(open) = audits
        .iter_mut()
        .find(|audit| audit.status == AuditStatus::Open && audit.serial_id == serial_id)
    {
        fill_blank(&mut open.scanned_bin, &scanned_bin);
        fill_blank(&mut open.expected_bin, &expected_bin);
        fill_blank(&mut open.scanned_by, &scanned_by);
        open.updated_at = now;
        return Ok(MismatchOutcome { record: open.clone(), created: false });
    }

    let record = WrongBinAuditRecord {
        id: AuditId::new(),
        serial_id,
        scanned_bin,
        expected_bin,
        scanned_by,
        status: AuditStatus::Open,
        moved_to: None,
        moved_by: None,
        created_at: now,
        updated_at: now,
    };
    audits.push(record.clone());
    Ok(MismatchOutcome { record, created: true })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditPatch {
    #[serde(default)]
    pub status: Option<AuditStatus>,
    #[serde(default)]
    pub moved_to: Option<String>,
    #[serde(default)]
    pub moved_by: Option<String>,
}

/// Apply status/move changes to one audit.
///
/// # Errors
/// Returns [`CountError::NotFound`] for an unknown id and
/// [`CountError::InvalidArgument`] when reopening would leave the serial with
/// two open audits.
pub fn apply_audit_patch(
    audits: &mut [WrongBinAuditRecord],
    id: AuditId,
    patch: &AuditPatch,
    now: OffsetDateTime,
) -> Result<WrongBinAuditRecord, CountError> {
    let index = audits
        .iter()
        .position(|audit| audit.id == id)
        .ok_or_else(|| CountError::NotFound(format!("audit not found: {id}")))?;
    if patch.status == Some(AuditStatus::Open) {
        let serial_id = &audits[index].serial_id;
        if let Some(other) = audits.iter().find(|audit| {
            audit.id != id && audit.status == AuditStatus::Open && &audit.serial_id == serial_id
        }) {
            return Err(CountError::InvalidArgument(format!(
                "serial {serial_id} already has open audit {}",
                other.id
            )));
        }
    }

    let audit = &mut audits[index];
    if let Some(status) = patch.status {
        audit.status = status;
    }
    if let Some(moved_to) = &patch.moved_to {
        audit.moved_to = Some(canonical_bin(moved_to));
    }
    if let Some(moved_by) = &patch.moved_by {
        audit.moved_by = Some(moved_by.trim().to_string());
    }
    audit.updated_at = now;
    Ok(audit.clone())
}

/// Newest first; ties broken by id so the listing is reproducible.
pub fn sort_audits(audits: &mut [WrongBinAuditRecord]) {
    audits.sort_by(|lhs, rhs| rhs.created_at.cmp(&lhs.created_at).then(lhs.id.cmp(&rhs.id)));
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExceptionFilter {
    #[serde(default)]
    pub bin: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl ExceptionFilter {
    fn matches(&self, record: &BinRecord) -> bool {
        if let Some(bin) = self.bin.as_deref().and_then(non_blank) {
            if canonical_bin(bin) != canonical_bin(&record.bin) {
                return false;
            }
        }
        if let Some(user) = self.user.as_deref().and_then(non_blank) {
            if !record.user.trim().eq_ignore_ascii_case(user) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExceptionRow {
    pub bin: String,
    pub kind: ExceptionKind,
    pub serial_id: Option<String>,
    pub sku: String,
    pub description: String,
    pub expected_qty: u32,
    pub entered_qty: u32,
    pub shortage: u32,
    pub user: String,
    pub counter: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub submitted_at: Option<OffsetDateTime>,
}

impl ExceptionRow {
    fn sort_key(&self) -> &str {
        self.serial_id.as_deref().unwrap_or(&self.sku)
    }

    fn cmp(lhs: &Self, rhs: &Self) -> Ordering {
        lhs.bin
            .cmp(&rhs.bin)
            .then(lhs.kind.cmp(&rhs.kind))
            .then_with(|| lhs.sort_key().cmp(rhs.sort_key()))
            .then_with(|| lhs.sku.cmp(&rhs.sku))
    }
}

/// Collect not-scanned exceptions across bins, minus ignored serials.
///
/// Output is ordered by bin, serial rows before non-serial rows, then by
/// serial id or sku, independent of the order of `records`.
#[must_use]
pub fn compute_exceptions(
    records: &[BinRecord],
    ignored: &BTreeSet<String>,
    filter: &ExceptionFilter,
) -> Vec<ExceptionRow> {
    let mut rows = Vec::new();
    for record in records.iter().filter(|record| filter.matches(record)) {
        let bin = canonical_bin(&record.bin);
        for missing in &record.missing_serials {
            let serial_id = missing.serial_id.trim();
            if ignored.contains(serial_id) {
                continue;
            }
            rows.push(ExceptionRow {
                bin: bin.clone(),
                kind: ExceptionKind::Serial,
                serial_id: Some(serial_id.to_string()),
                sku: missing.sku.clone(),
                description: missing.description.clone(),
                expected_qty: 1,
                entered_qty: 0,
                shortage: 1,
                user: record.user.clone(),
                counter: record.counter.clone(),
                submitted_at: record.submitted_at,
            });
        }
        for shortage in &record.non_serial_shortages {
            let deficit = shortage.expected_qty.saturating_sub(shortage.entered_qty);
            if deficit == 0 {
                continue;
            }
            rows.push(ExceptionRow {
                bin: bin.clone(),
                kind: ExceptionKind::Nonserial,
                serial_id: None,
                sku: shortage.sku.clone(),
                description: shortage.description.clone(),
                expected_qty: shortage.expected_qty,
                entered_qty: shortage.entered_qty,
                shortage: deficit,
                user: record.user.clone(),
                counter: record.counter.clone(),
                submitted_at: record.submitted_at,
            });
        }
    }
    rows.sort_by(ExceptionRow::cmp);
    rows
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn later(seconds: i64) -> OffsetDateTime {
        fixture_time() + Duration::seconds(seconds)
    }

    fn serial_row(location: &str, serial: &str, sku: &str) -> ExpectedRow {
        ExpectedRow {
            location: location.to_string(),
            sku: sku.to_string(),
            description: format!("{sku} handset"),
            serial_id: Some(serial.to_string()),
            quantity: 1,
        }
    }

    fn qty_row(location: &str, sku: &str, quantity: u32) -> ExpectedRow {
        ExpectedRow {
            location: location.to_string(),
            sku: sku.to_string(),
            description: format!("{sku} accessory"),
            serial_id: None,
            quantity,
        }
    }

    fn scenario_rows() -> Vec<ExpectedRow> {
        vec![serial_row("A-12", "123", "X"), qty_row("A-12", "Y", 5), qty_row("B-01", "Z", 9)]
    }

    fn reconcile_ok(bin: &str, rows: &[ExpectedRow], entries: &[ScanEntry]) -> ReconciliationResult {
        match reconcile(bin, rows, entries) {
            Ok(result) => result,
            Err(err) => panic!("reconcile should succeed: {err}"),
        }
    }

    fn merge_ok(
        existing: Option<BinRecord>,
        patch: BinRecordPatch,
        now: OffsetDateTime,
    ) -> BinRecord {
        match merge_bin_record(existing, patch, now) {
            Ok(record) => record,
            Err(err) => panic!("merge should succeed: {err}"),
        }
    }

    fn submitted(
        existing: Option<BinRecord>,
        entries: Vec<ScanEntry>,
        now: OffsetDateTime,
    ) -> BinRecord {
        let result = reconcile_ok("A-12", &scenario_rows(), &entries);
        let patch = submission_patch(existing.as_ref(), "c-1", "alice", entries, result, now);
        merge_ok(existing, patch, now)
    }

    // Test IDs: TREC-001
    #[test]
    fn scenario_a_partial_sku_count_leaves_investigation() {
        let record = submitted(
            None,
            vec![ScanEntry::serial("123"), ScanEntry::non_serial("Y", 3)],
            fixture_time(),
        );

        assert_eq!((record.total, record.scanned, record.missing), (6, 4, 2));
        assert!(record.missing_serials.is_empty());
        assert_eq!(
            record.non_serial_shortages,
            vec![Shortage {
                sku: "Y".to_string(),
                description: "Y accessory".to_string(),
                expected_qty: 5,
                entered_qty: 3,
                shortage: 2,
            }]
        );
        assert_eq!(record.state, BinState::Investigation);
        assert_eq!(record.submitted_at, Some(fixture_time()));
    }

    // Test IDs: TREC-002
    #[test]
    fn scenario_b_unscanned_serial_is_reported_missing() {
        let record = submitted(None, vec![ScanEntry::non_serial("Y", 5)], fixture_time());

        assert_eq!((record.total, record.scanned, record.missing), (6, 5, 1));
        assert_eq!(record.missing_serials.len(), 1);
        assert_eq!(record.missing_serials[0].serial_id, "123");
        assert_eq!(record.missing_serials[0].sku, "X");
        assert!(record.non_serial_shortages.is_empty());
        assert_eq!(record.state, BinState::Investigation);
    }

    // Test IDs: TREC-003
    #[test]
    fn scenario_c_mark_found_closes_the_last_unit() {
        let record = submitted(None, vec![ScanEntry::non_serial("Y", 5)], fixture_time());
        let found = match mark_found(Some(&record), "a-12", "123", "alice", later(5)) {
            Ok(found) => found,
            Err(err) => panic!("mark_found should succeed: {err}"),
        };
        assert!(found.adjusted);

        let record = merge_ok(Some(record), found.patch, later(5));
        assert!(record.missing_serials.is_empty());
        assert_eq!((record.scanned, record.missing), (6, 0));
        assert_eq!(record.state, BinState::Complete);
        assert_eq!(record.last_found_by.as_deref(), Some("alice"));
        assert!(record.items.iter().any(|entry| entry.serial_id() == Some("123")));
    }

    // Test IDs: TREC-004
    #[test]
    fn over_scans_and_foreign_serials_do_not_inflate_scanned() {
        let result = reconcile_ok(
            "A-12",
            &scenario_rows(),
            &[
                ScanEntry::serial("123"),
                ScanEntry::serial("123"),
                ScanEntry::serial("not-in-bin"),
                ScanEntry::non_serial("Y", 9),
                ScanEntry::non_serial("Z", 4),
            ],
        );

        assert_eq!((result.total, result.scanned, result.missing), (6, 6, 0));
        assert!(result.non_serial_shortages.is_empty());
    }

    // Test IDs: TREC-005
    #[test]
    fn non_serial_rows_are_summed_per_sku_and_bin_match_ignores_case() {
        let rows = vec![qty_row("a-12", "y", 2), qty_row(" A-12 ", "Y", 3), qty_row("A-13", "Y", 7)];
        let result = reconcile_ok("A-12", &rows, &[ScanEntry::non_serial("y", 1)]);

        assert_eq!(result.bin, "A-12");
        assert_eq!(result.total, 5);
        assert_eq!(result.non_serial_shortages.len(), 1);
        assert_eq!(result.non_serial_shortages[0].expected_qty, 5);
        assert_eq!(result.non_serial_shortages[0].entered_qty, 1);
        assert_eq!(result.non_serial_shortages[0].shortage, 4);
    }

    // Test IDs: TREC-006
    #[test]
    fn empty_bin_is_invalid_and_unknown_bin_is_empty() {
        let err = match reconcile("   ", &scenario_rows(), &[]) {
            Ok(_) => panic!("blank bin should be rejected"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let result = reconcile_ok("Q-99", &scenario_rows(), &[ScanEntry::serial("123")]);
        assert_eq!((result.total, result.scanned, result.missing), (0, 0, 0));
        assert!(result.missing_serials.is_empty());
    }

    // Test IDs: TREC-007
    #[test]
    fn duplicate_serial_rows_count_once() {
        let rows = vec![serial_row("A-12", "123", "X"), serial_row("A-12", "123", "X")];
        let result = reconcile_ok("A-12", &rows, &[ScanEntry::serial("123")]);
        assert_eq!((result.total, result.scanned, result.missing), (1, 1, 0));
    }

    // Test IDs: TREC-008
    #[test]
    fn scan_entries_accept_camel_case_and_extra_fields() {
        let entries: Vec<ScanEntry> = match serde_json::from_value(serde_json::json!([
            { "scannedSerialId": "123", "note": "top shelf" },
            { "sku": "Y", "qtyEntered": 2, "bin": "A-12" },
            { "sku": "Y", "qty_entered": 1 }
        ])) {
            Ok(entries) => entries,
            Err(err) => panic!("scan entries should deserialize: {err}"),
        };

        assert_eq!(entries[0], ScanEntry::serial("123"));
        assert_eq!(entries[1], ScanEntry::non_serial("Y", 2));
        let result = reconcile_ok("A-12", &scenario_rows(), &entries);
        assert_eq!(result.scanned, 4);
    }

    // Test IDs: TREC-009
    #[test]
    fn blank_serial_with_sku_counts_as_non_serial_line() {
        let entries: Vec<ScanEntry> = match serde_json::from_value(serde_json::json!([
            { "scannedSerialId": "", "sku": "Y", "qtyEntered": 5 },
            { "scannedSerialId": "  123 " }
        ])) {
            Ok(entries) => entries,
            Err(err) => panic!("scan entries should deserialize: {err}"),
        };

        assert_eq!(entries[0], ScanEntry::non_serial("Y", 5));
        assert_eq!(entries[1], ScanEntry::serial("123"));
        let result = reconcile_ok("A-12", &scenario_rows(), &entries);
        assert_eq!((result.total, result.scanned, result.missing), (6, 6, 0));
        assert!(result.non_serial_shortages.is_empty());
    }

    // Test IDs: TREC-011
    #[test]
    fn missing_serial_takes_canonical_sku_from_first_matching_row() {
        let rows = vec![serial_row("A-12", "103", " s3 "), serial_row("a-12", "103", "S1")];
        let result = reconcile_ok("A-12", &rows, &[]);
        assert_eq!(result.total, 1);
        assert_eq!(result.missing_serials.len(), 1);
        assert_eq!(result.missing_serials[0].sku, "S3");
    }

    // Test IDs: TREC-010
    #[test]
    fn scan_entry_without_serial_or_sku_is_rejected() {
        for payload in [
            serde_json::json!({ "scannedSerialId": " ", "qtyEntered": 2 }),
            serde_json::json!({}),
            serde_json::json!({ "sku": "Y" }),
        ] {
            match serde_json::from_value::<ScanEntry>(payload.clone()) {
                Ok(entry) => panic!("expected rejection for {payload}, got {entry:?}"),
                Err(err) => assert!(err.to_string().contains("invalid argument"), "{err}"),
            }
        }
    }

    // Test IDs: TBIN-001
    #[test]
    fn upsert_merge_keeps_first_started_and_refreshes_updated_at() {
        let first = merge_ok(
            None,
            BinRecordPatch { started: Some(fixture_time()), ..BinRecordPatch::for_bin("a-12") },
            fixture_time(),
        );
        let second = merge_ok(
            Some(first),
            BinRecordPatch {
                started: Some(later(3_600)),
                counter: Some("c-2".to_string()),
                ..BinRecordPatch::for_bin("A-12")
            },
            later(60),
        );

        assert_eq!(second.bin, "A-12");
        assert_eq!(second.started, fixture_time());
        assert_eq!(second.updated_at, later(60));
        assert_eq!(second.counter, "c-2");
    }

    // Test IDs: TBIN-002
    #[test]
    fn upsert_merge_replaces_arrays_only_when_provided() {
        let record = submitted(None, vec![ScanEntry::non_serial("Y", 1)], fixture_time());
        let merged = merge_ok(
            Some(record.clone()),
            BinRecordPatch { user: Some("bob".to_string()), ..BinRecordPatch::for_bin("A-12") },
            later(1),
        );
        assert_eq!(merged.items, record.items);
        assert_eq!(merged.missing_serials, record.missing_serials);
        assert_eq!(merged.user, "bob");

        let cleared = merge_ok(
            Some(merged),
            BinRecordPatch { items: Some(Vec::new()), ..BinRecordPatch::for_bin("A-12") },
            later(2),
        );
        assert!(cleared.items.is_empty());
        assert_eq!(cleared.non_serial_shortages, record.non_serial_shortages);
    }

    // Test IDs: TBIN-003
    #[test]
    fn upsert_merge_requires_bin() {
        let err = match merge_bin_record(None, BinRecordPatch::for_bin(""), fixture_time()) {
            Ok(_) => panic!("blank bin should be rejected"),
            Err(err) => err,
        };
        assert_eq!(err, CountError::InvalidArgument("bin MUST be provided".to_string()));
    }

    // Test IDs: TBIN-004
    #[test]
    fn latest_for_bin_prefers_most_recent_activity() {
        let mut old = BinRecord::new("A-12".to_string(), fixture_time());
        old.counter = "old".to_string();
        let mut new = BinRecord::new("a-12".to_string(), fixture_time());
        new.counter = "new".to_string();
        new.submitted_at = Some(later(30));
        let other = BinRecord::new("B-01".to_string(), later(90));

        let records = vec![new, old, other];
        let latest = latest_for_bin(&records, " A-12");
        assert_eq!(latest.map(|record| record.counter.as_str()), Some("new"));
        assert!(latest_for_bin(&records, "C-03").is_none());
    }

    // Test IDs: TSTATE-001
    #[test]
    fn clean_submit_completes_and_escalation_is_sticky() {
        let record = submitted(
            None,
            vec![ScanEntry::serial("123"), ScanEntry::non_serial("Y", 5)],
            fixture_time(),
        );
        assert_eq!(record.state, BinState::Complete);

        let patch = match escalation_patch(&record, "sam", later(1)) {
            Ok(patch) => patch,
            Err(err) => panic!("escalation should succeed: {err}"),
        };
        let escalated = merge_ok(Some(record), patch, later(1));
        assert_eq!(escalated.state, BinState::Supervisor);
        assert_eq!(escalated.escalated_by.as_deref(), Some("sam"));

        let resubmitted = submitted(
            Some(escalated),
            vec![ScanEntry::serial("123"), ScanEntry::non_serial("Y", 5)],
            later(2),
        );
        assert_eq!(resubmitted.missing, 0);
        assert_eq!(resubmitted.state, BinState::Supervisor);

        let patch = match resolution_patch(&resubmitted, "lead", later(3)) {
            Ok(patch) => patch,
            Err(err) => panic!("resolution should succeed: {err}"),
        };
        let resolved = merge_ok(Some(resubmitted), patch, later(3));
        assert_eq!(resolved.state, BinState::Complete);
        assert!(resolved.escalated_at.is_none());
        assert_eq!(resolved.escalation_resolved_by.as_deref(), Some("lead"));
    }

    // Test IDs: TSTATE-002
    #[test]
    fn resolution_requires_active_escalation() {
        let record = BinRecord::new("A-12".to_string(), fixture_time());
        let err = match resolution_patch(&record, "lead", later(1)) {
            Ok(_) => panic!("resolution without escalation should fail"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    // Test IDs: TSTATE-003
    #[test]
    fn mark_found_on_sku_shortage_adds_one_unit() {
        let record = submitted(
            None,
            vec![ScanEntry::serial("123"), ScanEntry::non_serial("Y", 4)],
            fixture_time(),
        );
        let found = match mark_found(Some(&record), "A-12", "y", "alice", later(1)) {
            Ok(found) => found,
            Err(err) => panic!("mark_found should succeed: {err}"),
        };
        assert!(found.adjusted);
        let record = merge_ok(Some(record), found.patch, later(1));

        assert!(record.non_serial_shortages.is_empty());
        assert_eq!((record.scanned, record.missing), (6, 0));
        assert!(record.items.contains(&ScanEntry::non_serial("Y", 5)));
    }

    // Test IDs: TSTATE-004
    #[test]
    fn mark_found_without_match_leaves_counts_and_creates_minimal_record() {
        let found = match mark_found(None, "q-1", "777", "alice", fixture_time()) {
            Ok(found) => found,
            Err(err) => panic!("mark_found should succeed: {err}"),
        };
        assert!(!found.adjusted);
        let record = merge_ok(None, found.patch, fixture_time());
        assert_eq!(record.bin, "Q-1");
        assert_eq!((record.scanned, record.missing), (0, 0));
        assert_eq!(record.state, BinState::Investigation);
    }

    // Test IDs: TAUD-001
    #[test]
    fn scenario_d_repeat_mismatch_keeps_one_open_audit() {
        let mut audits = Vec::new();
        let report = MismatchReport {
            serial_id: "999".to_string(),
            scanned_bin: "B-01".to_string(),
            expected_bin: "C-02".to_string(),
            scanned_by: "bob".to_string(),
        };

        let first = match merge_mismatch(&mut audits, &report, fixture_time()) {
            Ok(outcome) => outcome,
            Err(err) => panic!("first report should succeed: {err}"),
        };
        let second = match merge_mismatch(&mut audits, &report, later(10)) {
            Ok(outcome) => outcome,
            Err(err) => panic!("second report should succeed: {err}"),
        };

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(audits.len(), 1);
        assert_eq!(first.record.id, second.record.id);
        assert_eq!(second.record.created_at, fixture_time());
        assert_eq!(second.record.updated_at, later(10));
    }

    // Test IDs: TAUD-002
    #[test]
    fn repeat_mismatch_fills_blank_fields_only() {
        let mut audits = Vec::new();
        let sparse = MismatchReport {
            serial_id: "999".to_string(),
            scanned_bin: "b-01".to_string(),
            expected_bin: String::new(),
            scanned_by: String::new(),
        };
        let full = MismatchReport {
            serial_id: "999".to_string(),
            scanned_bin: "Z-99".to_string(),
            expected_bin: "c-02".to_string(),
            scanned_by: "bob".to_string(),
        };

        if let Err(err) = merge_mismatch(&mut audits, &sparse, fixture_time()) {
            panic!("sparse report should succeed: {err}");
        }
        let merged = match merge_mismatch(&mut audits, &full, later(1)) {
            Ok(outcome) => outcome.record,
            Err(err) => panic!("full report should succeed: {err}"),
        };

        assert_eq!(merged.scanned_bin, "B-01");
        assert_eq!(merged.expected_bin, "C-02");
        assert_eq!(merged.scanned_by, "bob");
    }

    // Test IDs: TAUD-003
    #[test]
    fn resolved_audit_allows_a_new_open_record() {
        let mut audits = Vec::new();
        let report = MismatchReport {
            serial_id: "999".to_string(),
            scanned_bin: "B-01".to_string(),
            expected_bin: "C-02".to_string(),
            scanned_by: "bob".to_string(),
        };
        let first = match merge_mismatch(&mut audits, &report, fixture_time()) {
            Ok(outcome) => outcome.record,
            Err(err) => panic!("report should succeed: {err}"),
        };

        let patch = AuditPatch {
            status: Some(AuditStatus::Moved),
            moved_to: Some(" c-02 ".to_string()),
            moved_by: Some("bob".to_string()),
        };
        let moved = apply_audit_patch(&mut audits, first.id, &patch, later(1));
        assert_eq!(moved.as_ref().ok().and_then(|audit| audit.moved_to.as_deref()), Some("C-02"));
        match apply_audit_patch(&mut audits, AuditId::new(), &patch, later(1)) {
            Ok(audit) => panic!("unknown id should not patch {audit:?}"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::NotFound),
        }

        let again = match merge_mismatch(&mut audits, &report, later(2)) {
            Ok(outcome) => outcome,
            Err(err) => panic!("report should succeed: {err}"),
        };
        assert!(again.created);
        assert_ne!(again.record.id, first.id);
        assert_eq!(audits.len(), 2);
    }

    // Test IDs: TAUD-005
    #[test]
    fn reopen_is_rejected_while_serial_has_another_open_audit() {
        let mut audits = Vec::new();
        let report = MismatchReport {
            serial_id: "999".to_string(),
            scanned_bin: "B-01".to_string(),
            expected_bin: "C-02".to_string(),
            scanned_by: "bob".to_string(),
        };
        let first = match merge_mismatch(&mut audits, &report, fixture_time()) {
            Ok(outcome) => outcome.record,
            Err(err) => panic!("report should succeed: {err}"),
        };
        let close = AuditPatch { status: Some(AuditStatus::Closed), ..AuditPatch::default() };
        if let Err(err) = apply_audit_patch(&mut audits, first.id, &close, later(1)) {
            panic!("close should succeed: {err}");
        }
        let second = match merge_mismatch(&mut audits, &report, later(2)) {
            Ok(outcome) => outcome.record,
            Err(err) => panic!("report should succeed: {err}"),
        };

        let reopen = AuditPatch { status: Some(AuditStatus::Open), ..AuditPatch::default() };
        match apply_audit_patch(&mut audits, first.id, &reopen, later(3)) {
            Ok(audit) => panic!("reopen should be rejected, got {audit:?}"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::InvalidArgument),
        }
        let open = audits.iter().filter(|audit| audit.status == AuditStatus::Open).count();
        assert_eq!(open, 1);
        assert_eq!(audits[0].status, AuditStatus::Closed);
        assert_eq!(audits[0].updated_at, later(1));

        if let Err(err) = apply_audit_patch(&mut audits, second.id, &close, later(4)) {
            panic!("close should succeed: {err}");
        }
        let reopened = match apply_audit_patch(&mut audits, first.id, &reopen, later(5)) {
            Ok(audit) => audit,
            Err(err) => panic!("reopen should succeed once no other audit is open: {err}"),
        };
        assert_eq!(reopened.status, AuditStatus::Open);
    }

    // Test IDs: TAUD-004
    #[test]
    fn mismatch_requires_serial_and_scanned_bin() {
        let mut audits = Vec::new();
        for (serial_id, scanned_bin) in [("", "B-01"), ("999", " ")] {
            let report = MismatchReport {
                serial_id: serial_id.to_string(),
                scanned_bin: scanned_bin.to_string(),
                expected_bin: String::new(),
                scanned_by: String::new(),
            };
            let err = match merge_mismatch(&mut audits, &report, fixture_time()) {
                Ok(_) => panic!("invalid report should be rejected"),
                Err(err) => err,
            };
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        assert!(audits.is_empty());
    }

    // Test IDs: TEXC-001
    #[test]
    fn scenario_e_ignored_serials_are_dropped() {
        let record = submitted(None, vec![ScanEntry::non_serial("Y", 2)], fixture_time());
        let records = vec![record];

        let all = compute_exceptions(&records, &BTreeSet::new(), &ExceptionFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, ExceptionKind::Serial);
        assert_eq!(all[1].kind, ExceptionKind::Nonserial);
        assert_eq!(all[1].shortage, 3);

        let ignored = BTreeSet::from(["123".to_string()]);
        let filtered = compute_exceptions(&records, &ignored, &ExceptionFilter::default());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].sku, "Y");
        assert_eq!(records[0].missing_serials.len(), 1);
    }

    // Test IDs: TEXC-002
    #[test]
    fn exception_filters_match_bin_and_user() {
        let mut a = BinRecord::new("A-12".to_string(), fixture_time());
        a.user = "Alice".to_string();
        a.missing_serials.push(MissingSerial {
            serial_id: "1".to_string(),
            sku: "X".to_string(),
            description: String::new(),
        });
        let mut b = a.clone();
        b.bin = "B-01".to_string();
        b.user = "bob".to_string();

        let records = vec![a, b];
        let by_bin = ExceptionFilter { bin: Some("b-01".to_string()), user: None };
        let by_user = ExceptionFilter { bin: None, user: Some("alice".to_string()) };

        let rows = compute_exceptions(&records, &BTreeSet::new(), &by_bin);
        assert_eq!(rows.iter().map(|row| row.bin.as_str()).collect::<Vec<_>>(), vec!["B-01"]);
        let rows = compute_exceptions(&records, &BTreeSet::new(), &by_user);
        assert_eq!(rows.iter().map(|row| row.bin.as_str()).collect::<Vec<_>>(), vec!["A-12"]);
    }

    fn arb_rows() -> impl Strategy<Value = Vec<ExpectedRow>> {
        prop::collection::vec(
            (
                prop::sample::select(vec!["A-1", "a-1", "B-2"]),
                prop::sample::select(vec!["S1", "S2", "s3"]),
                prop::option::of(prop::sample::select(vec!["100", "101", "102", "103"])),
                0_u32..8,
            )
                .prop_map(|(location, sku, serial, quantity)| ExpectedRow {
                    location: location.to_string(),
                    sku: sku.to_string(),
                    description: String::new(),
                    serial_id: serial.map(str::to_string),
                    quantity,
                }),
            0..24,
        )
    }

    fn arb_entries() -> impl Strategy<Value = Vec<ScanEntry>> {
        prop::collection::vec(
            prop_oneof![
                prop::sample::select(vec!["100", "101", "104"])
                    .prop_map(|serial| ScanEntry::serial(serial)),
                (prop::sample::select(vec!["S1", "s2", "S3", "S9"]), 0_u32..6)
                    .prop_map(|(sku, qty)| ScanEntry::non_serial(sku, qty)),
            ],
            0..16,
        )
    }

    // Test IDs: TDET-001
    proptest! {
        #[test]
        fn property_reconcile_is_order_independent(
            rows in arb_rows(),
            entries in arb_entries(),
        ) {
            let forward = reconcile("A-1", &rows, &entries);
            let mut rows_rev = rows.clone();
            rows_rev.reverse();
            let mut entries_rev = entries.clone();
            entries_rev.reverse();
            let backward = reconcile("a-1", &rows_rev, &entries_rev);

            // The first matching row annotates a missing serial, so only the
            // counted fields are order independent.
            let counted = |result: &ReconciliationResult| {
                (
                    result.total,
                    result.scanned,
                    result.missing,
                    result
                        .missing_serials
                        .iter()
                        .map(|missing| missing.serial_id.clone())
                        .collect::<Vec<_>>(),
                    result
                        .non_serial_shortages
                        .iter()
                        .map(|shortage| (shortage.sku.clone(), shortage.expected_qty, shortage.entered_qty))
                        .collect::<Vec<_>>(),
                )
            };
            let forward = match forward {
                Ok(result) => result,
                Err(err) => return Err(TestCaseError::fail(format!("reconcile failed: {err}"))),
            };
            let backward = match backward {
                Ok(result) => result,
                Err(err) => return Err(TestCaseError::fail(format!("reconcile failed: {err}"))),
            };
            prop_assert_eq!(counted(&forward), counted(&backward));
        }
    }

    // Test IDs: TDET-002
    proptest! {
        #[test]
        fn property_missing_matches_total_minus_scanned(
            rows in arb_rows(),
            entries in arb_entries(),
        ) {
            let result = reconcile("A-1", &rows, &entries);
            prop_assert!(result.is_ok());
            let result = result.unwrap_or_else(|_| unreachable!());
            prop_assert!(result.scanned <= result.total);
            prop_assert_eq!(result.missing, result.total.saturating_sub(result.scanned));
            let shortfall: u32 = result.non_serial_shortages.iter().map(|row| row.shortage).sum();
            prop_assert_eq!(
                result.missing,
                u32::try_from(result.missing_serials.len()).unwrap_or(u32::MAX) + shortfall
            );
        }
    }

    // Test IDs: TDET-003
    proptest! {
        #[test]
        fn property_exceptions_ignore_record_order(
            rows in arb_rows(),
            entries in arb_entries(),
            ignore_first in any::<bool>(),
        ) {
            let mut records = Vec::new();
            for (index, bin) in ["A-1", "B-2"].iter().enumerate() {
                let result = reconcile(bin, &rows, &entries);
                prop_assert!(result.is_ok());
                let result = result.unwrap_or_else(|_| unreachable!());
                let now = later(i64::try_from(index).unwrap_or(0));
                let patch = submission_patch(None, "c", "u", entries.clone(), result, now);
                let record = merge_bin_record(None, patch, now);
                prop_assert!(record.is_ok());
                records.push(record.unwrap_or_else(|_| unreachable!()));
            }
            let ignored = if ignore_first {
                BTreeSet::from(["100".to_string()])
            } else {
                BTreeSet::new()
            };

            let forward = compute_exceptions(&records, &ignored, &ExceptionFilter::default());
            records.reverse();
            let backward = compute_exceptions(&records, &ignored, &ExceptionFilter::default());
            prop_assert_eq!(&forward, &backward);
            prop_assert!(forward.windows(2).all(|pair| ExceptionRow::cmp(&pair[0], &pair[1]) != Ordering::Greater));
            if ignore_first {
                prop_assert!(forward.iter().all(|row| row.serial_id.as_deref() != Some("100")));
            }
        }
    }
}
