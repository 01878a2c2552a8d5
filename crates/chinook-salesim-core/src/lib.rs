//! Core logic for the D-1 sales simulator.
//!
//! Everything here is pure with respect to the database: the batch executor
//! talks to the stored sale routines through the [`SaleFunctions`] seam and
//! the verifier reads live state through [`InvoiceLookup`]. The sqlite store
//! crate provides both implementations; tests provide scripted ones.

use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use ulid::Ulid;

/// Seconds covered by the D-1 window, midnight to 23:59:59 inclusive.
pub const WINDOW_SECONDS: i64 = 86_399;

/// Absolute tolerance when comparing a stored invoice total against the
/// logged total. Absorbs decimal/float rounding on the round trip.
pub const TOTAL_TOLERANCE: f64 = 0.001;

/// Prefix of every simulation log artifact file name.
pub const LOG_FILE_PREFIX: &str = "sim-run-";

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SimError {
    /// Required database objects are absent. Raised before any mutation;
    /// `missing` names every absent object, not just the first.
    #[error("missing required database objects: {}", missing.join(", "))]
    Validation { missing: Vec<String> },
    /// A failure inside the batch transaction. The whole batch rolls back.
    #[error("batch operation failed: {0}")]
    Operation(String),
    /// The verifier found no simulation log artifact to check against.
    #[error("no simulation log found under {}", .0.display())]
    NoLogFound(PathBuf),
    #[error("simulation log error: {0}")]
    Log(String),
    #[error("time error: {0}")]
    Time(String),
}

// --- time window -----------------------------------------------------------

/// The D-1 window: `[start, end]` at one-second resolution, where `start` is
/// midnight UTC of the day before the run and `end` is 23:59:59 of that day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct D1Window {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl D1Window {
    #[must_use]
    pub fn d1_date(&self) -> Date {
        self.start.date()
    }

    #[must_use]
    pub fn duration_seconds(&self) -> i64 {
        (self.end - self.start).whole_seconds()
    }

    /// Draws a uniformly distributed instant inside the window at one-second
    /// granularity. Statistically uniform, not cryptographic.
    pub fn random_timestamp<R: Rng>(&self, rng: &mut R) -> OffsetDateTime {
        let offset = rng.gen_range(0..=self.duration_seconds());
        self.start + Duration::seconds(offset)
    }
}

/// Resolves the D-1 window for a run starting at `now`.
///
/// Pure function of `now`; must be resolved once per run and the same pair
/// reused for every timestamp generated in that run.
///
/// # Errors
/// Returns [`SimError::Time`] when `now` has no previous calendar day.
pub fn resolve_d1_window(now: OffsetDateTime) -> Result<D1Window, SimError> {
    let today = now.to_offset(UtcOffset::UTC).date();
    let yesterday = today
        .previous_day()
        .ok_or_else(|| SimError::Time("no previous calendar day exists".to_string()))?;

    let start = PrimitiveDateTime::new(yesterday, Time::MIDNIGHT).assume_utc();
    let end = start + Duration::seconds(WINDOW_SECONDS);
    Ok(D1Window { start, end })
}

/// Pre-generates `count` insert timestamps, sorted chronologically so the
/// committed batch reads like a real day of activity.
#[must_use]
pub fn generate_timestamps<R: Rng>(
    window: &D1Window,
    count: u32,
    rng: &mut R,
) -> Vec<OffsetDateTime> {
    let mut stamps: Vec<OffsetDateTime> = (0..count)
        .map(|_| window.random_timestamp(rng))
        .collect();
    stamps.sort_unstable();
    stamps
}

// --- operation records -----------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One logged unit of simulated activity.
///
/// `invoice_id` is `None` when the sale routine reported no eligible row;
/// such records stay in the log as no-op entries so the verifier can account
/// for the gap between requested and performed counts. Insert records carry
/// the monetary `total`; update/delete records do not. `at` is the simulated
/// sale instant for inserts and the wall-clock execution instant otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub invoice_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Requested per-type operation counts for one batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct BatchRequest {
    pub inserts: u32,
    pub updates: u32,
    pub deletes: u32,
}

impl BatchRequest {
    #[must_use]
    pub fn total(&self) -> u32 {
        self.inserts + self.updates + self.deletes
    }
}

// --- batch executor --------------------------------------------------------

/// Result of one successful `simulate_new_sale` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewSale {
    pub invoice_id: i64,
    pub total: f64,
}

/// The stored sale routines, treated as opaque. Implementations run inside
/// the batch transaction; any `Err` aborts and rolls back the whole batch,
/// while `Ok(None)` means "no eligible row" and is recorded as a no-op.
pub trait SaleFunctions {
    /// # Errors
    /// Returns [`SimError::Operation`] on a database failure.
    fn simulate_new_sale(&mut self, at: OffsetDateTime) -> Result<Option<NewSale>, SimError>;

    /// # Errors
    /// Returns [`SimError::Operation`] on a database failure.
    fn simulate_update_sale(&mut self, day: Date) -> Result<Option<i64>, SimError>;

    /// # Errors
    /// Returns [`SimError::Operation`] on a database failure.
    fn simulate_delete_sale(&mut self, day: Date) -> Result<Option<i64>, SimError>;
}

/// Runs the full batch in fixed order: deletes, then updates, then inserts.
///
/// Deletes and updates target rows that already exist in the window, so they
/// run before this batch adds new rows that would otherwise become spuriously
/// eligible targets. Every requested call yields exactly one record,
/// including no-op outcomes. An insert call returning no row is recorded with
/// absent id/total and surfaced as a warning, never dropped and never fatal.
///
/// The caller owns the surrounding transaction; this function performs no
/// commit or rollback itself.
///
/// # Errors
/// Propagates the first [`SimError`] from a sale routine; the caller must
/// then roll back so no partial batch is ever committed.
pub fn execute_batch<F: SaleFunctions, R: Rng>(
    funcs: &mut F,
    window: &D1Window,
    request: &BatchRequest,
    rng: &mut R,
) -> Result<Vec<OperationRecord>, SimError> {
    let day = window.d1_date();
    let mut records = Vec::new();

    for index in 1..=request.deletes {
        let invoice_id = funcs.simulate_delete_sale(day)?;
        if invoice_id.is_none() {
            tracing::warn!(index, "delete: no eligible D-1 row found");
        }
        records.push(OperationRecord {
            kind: OperationKind::Delete,
            invoice_id,
            total: None,
            at: now_utc(),
        });
        report_progress("delete", index, request.deletes);
    }

    for index in 1..=request.updates {
        let invoice_id = funcs.simulate_update_sale(day)?;
        if invoice_id.is_none() {
            tracing::warn!(index, "update: no eligible D-1 row found");
        }
        records.push(OperationRecord {
            kind: OperationKind::Update,
            invoice_id,
            total: None,
            at: now_utc(),
        });
        report_progress("update", index, request.updates);
    }

    let timestamps = generate_timestamps(window, request.inserts, rng);
    for (index, at) in (1_u32..).zip(timestamps) {
        match funcs.simulate_new_sale(at)? {
            Some(sale) => records.push(OperationRecord {
                kind: OperationKind::Insert,
                invoice_id: Some(sale.invoice_id),
                total: Some(sale.total),
                at,
            }),
            None => {
                tracing::warn!(index, "insert: sale routine returned no row");
                records.push(OperationRecord {
                    kind: OperationKind::Insert,
                    invoice_id: None,
                    total: None,
                    at,
                });
            }
        }
        report_progress("insert", index, request.inserts);
    }

    Ok(records)
}

fn report_progress(kind: &str, done: u32, total: u32) {
    let step = (total / 10).max(1);
    if done % step == 0 || done == total {
        tracing::info!(kind, done, total, "batch progress");
    }
}

// --- simulation log --------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogSummary {
    pub run_id: Ulid,
    /// D-1 calendar day, `YYYY-MM-DD`.
    pub d1_date: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub requested: BatchRequest,
}

/// The durable artifact of one run: summary plus the ordered operation list.
/// Written once, strictly after commit; the verifier's sole input besides
/// live database reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationLog {
    pub summary: LogSummary,
    pub operations: Vec<OperationRecord>,
}

/// File name for a run starting at `run_start`; deterministic so runs are
/// individually addressable and sortable by name.
///
/// # Errors
/// Returns [`SimError::Time`] when formatting fails.
pub fn log_file_name(run_start: OffsetDateTime) -> Result<String, SimError> {
    let format = time::format_description::parse(
        "[year][month][day]T[hour][minute][second]Z",
    )
    .map_err(|err| SimError::Time(err.to_string()))?;
    let stamp = run_start
        .to_offset(UtcOffset::UTC)
        .format(&format)
        .map_err(|err| SimError::Time(err.to_string()))?;
    Ok(format!("{LOG_FILE_PREFIX}{stamp}.json"))
}

/// Writes the log artifact under `dir`. Must be invoked exactly once per
/// successful run, strictly after the batch transaction commits; never for a
/// rolled-back run.
///
/// # Errors
/// Returns [`SimError::Log`] on serialization or filesystem failure.
pub fn write_log(dir: &Path, log: &SimulationLog) -> Result<PathBuf, SimError> {
    fs::create_dir_all(dir).map_err(|err| {
        SimError::Log(format!(
            "failed to create log directory {}: {err}",
            dir.display()
        ))
    })?;

    let path = dir.join(log_file_name(log.summary.started_at)?);
    let body = serde_json::to_string_pretty(log)
        .map_err(|err| SimError::Log(format!("failed to serialize simulation log: {err}")))?;
    fs::write(&path, body).map_err(|err| {
        SimError::Log(format!("failed to write {}: {err}", path.display()))
    })?;

    tracing::info!(path = %path.display(), operations = log.operations.len(), "simulation log written");
    Ok(path)
}

/// Locates the most recently modified log artifact under `dir`, breaking
/// modification-time ties by file name (names sort chronologically).
///
/// # Errors
/// Returns [`SimError::NoLogFound`] when the directory is absent or holds no
/// log artifact.
pub fn find_latest_log(dir: &Path) -> Result<PathBuf, SimError> {
    let entries = fs::read_dir(dir).map_err(|_| SimError::NoLogFound(dir.to_path_buf()))?;

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|err| SimError::Log(err.to_string()))?;
        let path = entry.path();

        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX) && name.ends_with(".json"));
        if !is_log {
            continue;
        }

        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .map_err(|err| SimError::Log(format!("failed to stat {}: {err}", path.display())))?;

        let is_newer = newest
            .as_ref()
            .map_or(true, |(best_time, best_path)| {
                (modified, &path) > (*best_time, best_path)
            });
        if is_newer {
            newest = Some((modified, path));
        }
    }

    newest
        .map(|(_, path)| path)
        .ok_or_else(|| SimError::NoLogFound(dir.to_path_buf()))
}

/// # Errors
/// Returns [`SimError::Log`] when the artifact cannot be read or parsed.
pub fn read_log(path: &Path) -> Result<SimulationLog, SimError> {
    let body = fs::read_to_string(path).map_err(|err| {
        SimError::Log(format!("failed to read {}: {err}", path.display()))
    })?;
    serde_json::from_str(&body).map_err(|err| {
        SimError::Log(format!("failed to parse {}: {err}", path.display()))
    })
}

// --- verifier --------------------------------------------------------------

/// Read-only invoice lookup used by the verifier. No transaction required.
pub trait InvoiceLookup {
    /// # Errors
    /// Returns [`SimError::Operation`] on a database failure.
    fn invoice_total(&self, invoice_id: i64) -> Result<Option<f64>, SimError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mismatch {
    pub kind: OperationKind,
    pub invoice_id: i64,
    pub detail: String,
}

impl Display for Mismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} invoice {}: {}",
            self.kind.as_str(),
            self.invoice_id,
            self.detail
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VerificationReport {
    pub inserts_checked: usize,
    pub updates_checked: usize,
    pub deletes_checked: usize,
    /// Logged operations with no invoice id: requested calls for which the
    /// sale routine found no eligible row. Counted, never failed.
    pub noop_records: usize,
    pub mismatches: Vec<Mismatch>,
}

impl VerificationReport {
    #[must_use]
    pub fn failures(&self) -> usize {
        self.mismatches.len()
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Reconciles a simulation log against live database state.
///
/// Per insert: the row must exist and its stored total must match the logged
/// total within [`TOTAL_TOLERANCE`]. Per delete: the row must be absent. Per
/// update: the row must still exist (existence only; the log cannot carry
/// pre-update values). Mismatches accumulate; a failure never aborts the
/// remaining checks. Performs no mutation, so repeated runs against unchanged
/// state produce identical reports.
///
/// # Errors
/// Returns [`SimError::Operation`] only when a lookup itself fails.
pub fn verify_log(
    log: &SimulationLog,
    db: &impl InvoiceLookup,
) -> Result<VerificationReport, SimError> {
    let mut report = VerificationReport::default();

    for record in &log.operations {
        let Some(invoice_id) = record.invoice_id else {
            report.noop_records += 1;
            continue;
        };

        match record.kind {
            OperationKind::Insert => {
                report.inserts_checked += 1;
                match db.invoice_total(invoice_id)? {
                    None => report.mismatches.push(Mismatch {
                        kind: OperationKind::Insert,
                        invoice_id,
                        detail: "logged insert but row is missing".to_string(),
                    }),
                    Some(stored) => match record.total {
                        Some(logged) if (stored - logged).abs() <= TOTAL_TOLERANCE => {}
                        Some(logged) => report.mismatches.push(Mismatch {
                            kind: OperationKind::Insert,
                            invoice_id,
                            detail: format!(
                                "stored total {stored:.3} differs from logged total {logged:.3}"
                            ),
                        }),
                        None => report.mismatches.push(Mismatch {
                            kind: OperationKind::Insert,
                            invoice_id,
                            detail: "insert record carries no logged total".to_string(),
                        }),
                    },
                }
            }
            OperationKind::Update => {
                report.updates_checked += 1;
                if db.invoice_total(invoice_id)?.is_none() {
                    report.mismatches.push(Mismatch {
                        kind: OperationKind::Update,
                        invoice_id,
                        detail: "logged update but row is missing".to_string(),
                    });
                }
            }
            OperationKind::Delete => {
                report.deletes_checked += 1;
                if db.invoice_total(invoice_id)?.is_some() {
                    report.mismatches.push(Mismatch {
                        kind: OperationKind::Delete,
                        invoice_id,
                        detail: "logged delete but row is still present".to_string(),
                    });
                }
            }
        }
    }

    Ok(report)
}

// --- run statistics --------------------------------------------------------

/// Post-commit revenue summary printed after a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunStats {
    pub committed_operations: usize,
    pub committed_inserts: usize,
    pub noop_operations: usize,
    pub total_revenue: f64,
    pub average_sale: f64,
}

impl RunStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_records(records: &[OperationRecord]) -> Self {
        let mut committed_inserts = 0_usize;
        let mut noop_operations = 0_usize;
        let mut total_revenue = 0.0_f64;

        for record in records {
            match (record.kind, record.invoice_id) {
                (_, None) => noop_operations += 1,
                (OperationKind::Insert, Some(_)) => {
                    committed_inserts += 1;
                    total_revenue += record.total.unwrap_or(0.0);
                }
                _ => {}
            }
        }

        let average_sale = if committed_inserts == 0 {
            0.0
        } else {
            total_revenue / committed_inserts as f64
        };

        Self {
            committed_operations: records.len() - noop_operations,
            committed_inserts,
            noop_operations,
            total_revenue,
            average_sale,
        }
    }
}

// --- time helpers ----------------------------------------------------------

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`SimError::Time`] when parsing fails or the input is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, SimError> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| SimError::Time(format!("invalid RFC3339 timestamp: {err}")))?;
    if parsed.offset() != UtcOffset::UTC {
        return Err(SimError::Time("timestamp MUST use UTC offset Z".to_string()));
    }
    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`SimError::Time`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SimError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| SimError::Time(format!("failed to format RFC3339 timestamp: {err}")))
}

/// # Errors
/// Returns [`SimError::Time`] when formatting fails.
pub fn format_date(day: Date) -> Result<String, SimError> {
    let format = time::format_description::parse("[year]-[month]-[day]")
        .map_err(|err| SimError::Time(err.to_string()))?;
    day.format(&format)
        .map_err(|err| SimError::Time(err.to_string()))
}

/// # Errors
/// Returns [`SimError::Time`] when parsing fails.
pub fn parse_date(value: &str) -> Result<Date, SimError> {
    let format = time::format_description::parse("[year]-[month]-[day]")
        .map_err(|err| SimError::Time(err.to_string()))?;
    Date::parse(value, &format)
        .map_err(|err| SimError::Time(format!("invalid date {value}: {err}")))
}
