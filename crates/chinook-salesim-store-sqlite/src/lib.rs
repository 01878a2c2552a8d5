#![allow(clippy::missing_errors_doc)]

//! SQLite-backed sales store: the database boundary of the simulator.
//!
//! `migrate` installs the schema, the sequence counters, and the routine
//! registry; `validate` checks that catalog before any batch runs;
//! `run_batch` adapts one transaction to the core executor's
//! [`SaleFunctions`] seam. The registry tables play the role a server-side
//! catalog would on an engine with stored routines and sequences.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chinook_salesim_core::{
    execute_batch, format_date, format_rfc3339, now_utc, BatchRequest, D1Window, InvoiceLookup,
    NewSale, OperationRecord, SaleFunctions, SimError,
};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use time::{Date, OffsetDateTime};

const SALES_MIGRATION_VERSION: i64 = 1;
const MAX_LINES_PER_SALE: i64 = 5;

pub const REQUIRED_ROUTINES: [&str; 3] = [
    "simulate_new_sale",
    "simulate_update_sale",
    "simulate_delete_sale",
];
pub const REQUIRED_SEQUENCES: [&str; 2] = ["invoice_id_seq", "invoice_line_id_seq"];

const SCHEMA_SALES_V1: &str = r"
CREATE TABLE IF NOT EXISTS tracks (
  track_id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  unit_price REAL NOT NULL CHECK (unit_price > 0.0)
);

CREATE TABLE IF NOT EXISTS invoices (
  invoice_id INTEGER PRIMARY KEY,
  invoice_date TEXT NOT NULL,
  total REAL NOT NULL CHECK (total >= 0.0)
);

CREATE TABLE IF NOT EXISTS invoice_lines (
  invoice_line_id INTEGER PRIMARY KEY,
  invoice_id INTEGER NOT NULL REFERENCES invoices(invoice_id) ON DELETE CASCADE,
  track_id INTEGER NOT NULL REFERENCES tracks(track_id),
  unit_price REAL NOT NULL,
  quantity INTEGER NOT NULL CHECK (quantity >= 1)
);

CREATE INDEX IF NOT EXISTS idx_invoices_date ON invoices(invoice_date);
CREATE INDEX IF NOT EXISTS idx_invoice_lines_invoice ON invoice_lines(invoice_id);

CREATE TABLE IF NOT EXISTS sales_sequences (
  sequence_name TEXT PRIMARY KEY,
  next_value INTEGER NOT NULL CHECK (next_value >= 1)
);

CREATE TABLE IF NOT EXISTS sales_routines (
  routine_name TEXT PRIMARY KEY,
  registered_at TEXT NOT NULL
);
";

// Small fixed price list standing in for the Chinook track catalog.
const TRACK_SEED: [(&str, f64); 12] = [
    ("For Those About To Rock", 0.99),
    ("Balls to the Wall", 0.99),
    ("Fast As a Shark", 0.99),
    ("Restless and Wild", 0.99),
    ("Princess of the Dawn", 0.99),
    ("Put The Finger On You", 0.99),
    ("Inject The Venom", 1.29),
    ("Snowballed", 1.29),
    ("Evil Walks", 1.29),
    ("Spellbound", 1.99),
    ("Breaking The Rules", 1.99),
    ("Night Of The Long Knives", 1.99),
];

pub struct SqliteSalesStore {
    conn: Connection,
}

impl SqliteSalesStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Installs the sales schema, sequence counters, routine registry, and
    /// seed track catalog. Idempotent; this is the `setup` command's body.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SALES_V1)
            .context("failed to apply sales schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SALES_MIGRATION_VERSION, now],
            )
            .context("failed to register sales schema migration")?;

        for name in REQUIRED_ROUTINES {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO sales_routines(routine_name, registered_at)
                     VALUES (?1, ?2)",
                    params![name, now],
                )
                .with_context(|| format!("failed to register routine {name}"))?;
        }

        // Counters start past the historical id range so simulated ids
        // never collide with seeded rows.
        for name in REQUIRED_SEQUENCES {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO sales_sequences(sequence_name, next_value)
                     VALUES (?1, 1000)",
                    params![name],
                )
                .with_context(|| format!("failed to seed sequence {name}"))?;
        }

        for (index, (name, unit_price)) in (1_i64..).zip(TRACK_SEED) {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO tracks(track_id, name, unit_price)
                     VALUES (?1, ?2, ?3)",
                    params![index, name, unit_price],
                )
                .context("failed to seed track catalog")?;
        }

        Ok(())
    }

    /// Confirms the three sale routines and two sequences exist, naming every
    /// missing object. Read-only; runs before the batch transaction opens.
    ///
    /// # Errors
    /// Returns [`SimError::Validation`] listing all absent objects.
    pub fn validate(&self) -> Result<(), SimError> {
        let mut missing = Vec::new();

        for name in REQUIRED_ROUTINES {
            if !self.routine_registered(name)? {
                missing.push(format!("routine {name}"));
            }
        }
        for name in REQUIRED_SEQUENCES {
            if !self.sequence_defined(name)? {
                missing.push(format!("sequence {name}"));
            }
        }

        if missing.is_empty() {
            tracing::debug!("database state validation successful");
            Ok(())
        } else {
            Err(SimError::Validation { missing })
        }
    }

    /// Runs the whole batch in a single transaction: committed as a unit on
    /// success, rolled back as a unit on any routine failure. Never commits a
    /// partial batch.
    pub fn run_batch<R: Rng>(
        &mut self,
        request: &BatchRequest,
        window: &D1Window,
        rng: &mut R,
    ) -> Result<Vec<OperationRecord>> {
        tracing::info!(
            inserts = request.inserts,
            updates = request.updates,
            deletes = request.deletes,
            "starting batch in a single transaction"
        );

        let tx = self
            .conn
            .transaction()
            .context("failed to start batch transaction")?;

        let records = {
            let mut routines = TxnSaleRoutines { tx: &tx };
            execute_batch(&mut routines, window, request, rng)
                .map_err(anyhow::Error::new)
                .context("batch aborted, rolling back all changes")?
        };

        tx.commit().context("failed to commit batch transaction")?;
        tracing::info!(operations = records.len(), "batch committed");
        Ok(records)
    }

    pub fn invoice_total(&self, invoice_id: i64) -> Result<Option<f64>> {
        self.conn
            .query_row(
                "SELECT total FROM invoices WHERE invoice_id = ?1",
                params![invoice_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up invoice {invoice_id}"))
    }

    pub fn count_invoices_on(&self, day: Date) -> Result<i64> {
        let day = format_date(day).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM invoices WHERE date(invoice_date) = ?1",
                params![day],
                |row| row.get(0),
            )
            .context("failed to count invoices")
    }

    fn routine_registered(&self, name: &str) -> Result<bool, SimError> {
        if !table_exists(&self.conn, "sales_routines")? {
            return Ok(false);
        }
        catalog_row_exists(
            &self.conn,
            "SELECT 1 FROM sales_routines WHERE routine_name = ?1",
            name,
        )
    }

    fn sequence_defined(&self, name: &str) -> Result<bool, SimError> {
        if !table_exists(&self.conn, "sales_sequences")? {
            return Ok(false);
        }
        catalog_row_exists(
            &self.conn,
            "SELECT 1 FROM sales_sequences WHERE sequence_name = ?1",
            name,
        )
    }
}

impl InvoiceLookup for SqliteSalesStore {
    fn invoice_total(&self, invoice_id: i64) -> Result<Option<f64>, SimError> {
        SqliteSalesStore::invoice_total(self, invoice_id)
            .map_err(|err| SimError::Operation(err.to_string()))
    }
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, SimError> {
    catalog_row_exists(
        conn,
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        name,
    )
}

fn catalog_row_exists(conn: &Connection, query: &str, name: &str) -> Result<bool, SimError> {
    conn.query_row(query, params![name], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
        .map_err(|err| SimError::Operation(format!("catalog query failed: {err}")))
}

// --- sale routines ---------------------------------------------------------

/// Adapts one open transaction to the core executor's routine seam.
struct TxnSaleRoutines<'a, 'tx> {
    tx: &'a Transaction<'tx>,
}

impl SaleFunctions for TxnSaleRoutines<'_, '_> {
    fn simulate_new_sale(&mut self, at: OffsetDateTime) -> Result<Option<NewSale>, SimError> {
        simulate_new_sale(self.tx, at).map_err(|err| SimError::Operation(err.to_string()))
    }

    fn simulate_update_sale(&mut self, day: Date) -> Result<Option<i64>, SimError> {
        simulate_update_sale(self.tx, day).map_err(|err| SimError::Operation(err.to_string()))
    }

    fn simulate_delete_sale(&mut self, day: Date) -> Result<Option<i64>, SimError> {
        simulate_delete_sale(self.tx, day).map_err(|err| SimError::Operation(err.to_string()))
    }
}

/// Creates one invoice dated `at` with 1 to 5 random track lines, drawing ids
/// from both sequences. Returns `None` when the track catalog is empty, the
/// routine's "no row produced" outcome.
fn simulate_new_sale(conn: &Connection, at: OffsetDateTime) -> Result<Option<NewSale>> {
    // Bitmask keeps RANDOM() non-negative without abs() overflow.
    let line_count: i64 = conn.query_row(
        "SELECT 1 + (RANDOM() & 2147483647) % ?1",
        params![MAX_LINES_PER_SALE],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT track_id, unit_price FROM tracks ORDER BY RANDOM() LIMIT ?1",
    )?;
    let mut rows = stmt.query(params![line_count])?;
    let mut picks: Vec<(i64, f64)> = Vec::new();
    while let Some(row) = rows.next()? {
        picks.push((row.get(0)?, row.get(1)?));
    }
    if picks.is_empty() {
        return Ok(None);
    }

    let invoice_id = next_sequence_value(conn, "invoice_id_seq")?;
    let total = round_currency(picks.iter().map(|(_, price)| price).sum());
    let invoice_date = format_rfc3339(at).map_err(|err| anyhow!(err.to_string()))?;

    conn.execute(
        "INSERT INTO invoices(invoice_id, invoice_date, total) VALUES (?1, ?2, ?3)",
        params![invoice_id, invoice_date, total],
    )
    .context("failed to insert invoice")?;

    for (track_id, unit_price) in picks {
        let line_id = next_sequence_value(conn, "invoice_line_id_seq")?;
        conn.execute(
            "INSERT INTO invoice_lines(invoice_line_id, invoice_id, track_id, unit_price, quantity)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![line_id, invoice_id, track_id, unit_price],
        )
        .context("failed to insert invoice line")?;
    }

    Ok(Some(NewSale { invoice_id, total }))
}

/// Adds one random track line to a random invoice dated `day` and adjusts its
/// total. Returns `None` when no invoice exists on that day.
fn simulate_update_sale(conn: &Connection, day: Date) -> Result<Option<i64>> {
    let Some(invoice_id) = pick_invoice_on(conn, day)? else {
        return Ok(None);
    };

    let (track_id, unit_price): (i64, f64) = conn
        .query_row(
            "SELECT track_id, unit_price FROM tracks ORDER BY RANDOM() LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .context("no tracks available for update")?;

    let line_id = next_sequence_value(conn, "invoice_line_id_seq")?;
    conn.execute(
        "INSERT INTO invoice_lines(invoice_line_id, invoice_id, track_id, unit_price, quantity)
         VALUES (?1, ?2, ?3, ?4, 1)",
        params![line_id, invoice_id, track_id, unit_price],
    )
    .context("failed to insert update line")?;

    conn.execute(
        "UPDATE invoices SET total = ROUND(total + ?2, 2) WHERE invoice_id = ?1",
        params![invoice_id, unit_price],
    )
    .context("failed to adjust invoice total")?;

    Ok(Some(invoice_id))
}

/// Removes a random invoice dated `day` together with its lines. Returns
/// `None` when no invoice exists on that day.
fn simulate_delete_sale(conn: &Connection, day: Date) -> Result<Option<i64>> {
    let Some(invoice_id) = pick_invoice_on(conn, day)? else {
        return Ok(None);
    };

    conn.execute(
        "DELETE FROM invoice_lines WHERE invoice_id = ?1",
        params![invoice_id],
    )
    .context("failed to delete invoice lines")?;
    conn.execute(
        "DELETE FROM invoices WHERE invoice_id = ?1",
        params![invoice_id],
    )
    .context("failed to delete invoice")?;

    Ok(Some(invoice_id))
}

fn pick_invoice_on(conn: &Connection, day: Date) -> Result<Option<i64>> {
    let day = format_date(day).map_err(|err| anyhow!(err.to_string()))?;
    conn.query_row(
        "SELECT invoice_id FROM invoices WHERE date(invoice_date) = ?1
         ORDER BY RANDOM() LIMIT 1",
        params![day],
        |row| row.get(0),
    )
    .optional()
    .context("failed to pick an eligible invoice")
}

fn next_sequence_value(conn: &Connection, name: &str) -> Result<i64> {
    let value: i64 = conn
        .query_row(
            "SELECT next_value FROM sales_sequences WHERE sequence_name = ?1",
            params![name],
            |row| row.get(0),
        )
        .with_context(|| format!("sequence {name} is not defined"))?;

    conn.execute(
        "UPDATE sales_sequences SET next_value = next_value + 1 WHERE sequence_name = ?1",
        params![name],
    )
    .with_context(|| format!("failed to advance sequence {name}"))?;

    Ok(value)
}

fn round_currency(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
