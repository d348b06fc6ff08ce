//! Z report (end-of-day close).
//!
//! A report covers every bill recorded since the last committed Z report.
//! The period start is kept in `local_settings` (`system` /
//! `last_z_report_timestamp`); committing a report stamps its bills with the
//! report id and advances the period start, so successive reports never
//! count a bill twice.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bills::{self, BillFilter, BillKind, JournalSummary};
use crate::db::{self, DbState};
use crate::money::Money;
use crate::tables;

const PERIOD_START_KEY: &str = "last_z_report_timestamp";
const EPOCH: &str = "1970-01-01T00:00:00Z";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTable {
    pub table_id: String,
    pub label: String,
    pub guests: u32,
    pub outstanding: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZReport {
    pub id: String,
    pub period_start: String,
    pub period_end: String,
    pub totals: JournalSummary,
    pub full_count: i64,
    pub partial_count: i64,
    pub split_count: i64,
    pub open_tables: Vec<OpenTable>,
    pub outstanding_total: Money,
    pub generated_at: String,
}

impl ZReport {
    pub fn has_open_tables(&self) -> bool {
        !self.open_tables.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Period
// ---------------------------------------------------------------------------

/// Timestamp of the last committed Z report, or the epoch if none.
fn period_start(conn: &Connection) -> String {
    db::get_setting(conn, "system", PERIOD_START_KEY).unwrap_or_else(|| EPOCH.to_string())
}

fn period_filter(start: &str) -> BillFilter {
    BillFilter {
        from: Some(start.to_string()),
        unreported_only: true,
        ..BillFilter::default()
    }
}

// ---------------------------------------------------------------------------
// Generate / commit
// ---------------------------------------------------------------------------

fn build_report(conn: &Connection) -> Result<ZReport, String> {
    let start = period_start(conn);
    let filter = period_filter(&start);

    let totals = bills::journal_totals_conn(conn, &filter)?;
    let period_bills = bills::list_bills_conn(conn, &filter)?;
    let count_kind = |kind: BillKind| period_bills.iter().filter(|b| b.kind == kind).count() as i64;

    let open_tables: Vec<OpenTable> = tables::list_tables_conn(conn)?
        .into_iter()
        .filter(|t| t.total.is_positive())
        .map(|t| OpenTable {
            table_id: t.id,
            label: t.label,
            guests: t.guests,
            outstanding: t.total,
        })
        .collect();
    let outstanding_total: Money = open_tables.iter().map(|t| t.outstanding).sum();

    let now = Utc::now().to_rfc3339();
    Ok(ZReport {
        id: Uuid::new_v4().to_string(),
        period_start: start,
        period_end: now.clone(),
        full_count: count_kind(BillKind::Full),
        partial_count: count_kind(BillKind::Partial),
        split_count: count_kind(BillKind::CustomSplit),
        totals,
        open_tables,
        outstanding_total,
        generated_at: now,
    })
}

/// Preview the report for the current period without closing it.
pub fn generate_z_report(db: &DbState) -> Result<ZReport, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    build_report(&conn)
}

/// Close the current period.
///
/// Fails while any table still carries an outstanding order.
pub fn commit_z_report(db: &DbState) -> Result<ZReport, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<ZReport, String> {
        let report = build_report(&conn)?;
        if report.has_open_tables() {
            return Err(format!(
                "Cannot commit Z report: {} table(s) still have open orders ({} outstanding)",
                report.open_tables.len(),
                report.outstanding_total
            ));
        }

        let report_json =
            serde_json::to_string(&report).map_err(|e| format!("serialize report: {e}"))?;
        conn.execute(
            "INSERT INTO z_reports (id, period_start, period_end, bill_count, gross_cents, report_json, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                report.id,
                report.period_start,
                report.period_end,
                report.totals.bill_count,
                report.totals.gross.cents(),
                report_json,
                report.generated_at,
            ],
        )
        .map_err(|e| format!("insert z_report: {e}"))?;

        let stamped = conn
            .execute(
                "UPDATE bills SET z_report_id = ?1 WHERE z_report_id IS NULL AND created_at >= ?2",
                params![report.id, report.period_start],
            )
            .map_err(|e| format!("stamp bills: {e}"))?;
        if stamped as i64 != report.totals.bill_count {
            warn!(
                stamped,
                expected = report.totals.bill_count,
                "Z report bill count mismatch"
            );
        }

        db::set_setting(&conn, "system", PERIOD_START_KEY, &report.period_end)?;
        Ok(report)
    })();

    match result {
        Ok(report) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            info!(
                z_report_id = %report.id,
                bills = report.totals.bill_count,
                gross = %report.totals.gross,
                period_start = %report.period_start,
                "Z report committed"
            );
            Ok(report)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Get / List
// ---------------------------------------------------------------------------

fn map_report_row(row: &rusqlite::Row) -> rusqlite::Result<(String, String)> {
    Ok((row.get(0)?, row.get(1)?))
}

fn decode(id: &str, json: &str) -> Result<ZReport, String> {
    serde_json::from_str(json).map_err(|e| format!("z_report {id} is unreadable: {e}"))
}

pub fn get_z_report(db: &DbState, z_report_id: &str) -> Result<Option<ZReport>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let row = conn
        .query_row(
            "SELECT id, report_json FROM z_reports WHERE id = ?1",
            params![z_report_id],
            map_report_row,
        )
        .optional()
        .map_err(|e| format!("query z_report: {e}"))?;

    row.map(|(id, json)| decode(&id, &json)).transpose()
}

/// Committed reports, newest first.
pub fn list_z_reports(db: &DbState, limit: usize) -> Result<Vec<ZReport>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT id, report_json FROM z_reports
             ORDER BY generated_at DESC, rowid DESC
             LIMIT ?1",
        )
        .map_err(|e| format!("prepare: {e}"))?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt
        .query_map(params![limit], map_report_row)
        .map_err(|e| format!("query: {e}"))?;

    let mut reports = Vec::new();
    for row in rows.flatten() {
        match decode(&row.0, &row.1) {
            Ok(report) => reports.push(report),
            Err(e) => warn!("{e}"),
        }
    }
    Ok(reports)
}

// ===========================================================================
// Tests
// ===========================================================================
