use crate::database::{
    schema::{DbCommitment, DbNotification, DbTrigger, TriggerStatus},
    DatabaseError,
};

use std::{path::Path, str::FromStr, time::Duration};

use bitcoin::Txid;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};

/// Registrations and the monitor both write to the same file; SQLite
/// serializes them for us as long as we give it some room.
pub const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum age of a first attempt before a registration is permanently
/// skipped by the scheduler.
pub const MAX_RETRY_WINDOW: i64 = 7 * 86_400;

/// Retry every 6 hours during the first day after the first attempt..
pub const FIRST_DAY_RETRY_INTERVAL: i64 = 21_600;
/// ..then every 24 hours until the retry window closes.
pub const LATER_RETRY_INTERVAL: i64 = 86_400;

/// Perform a set of modifications to the database inside a single transaction
pub fn db_exec<F>(path: &Path, modifications: F) -> Result<(), DatabaseError>
where
    F: FnOnce(&Transaction) -> Result<(), DatabaseError>,
{
    let mut conn = Connection::open(path)
        .map_err(|e| DatabaseError(format!("Opening database: {}", e)))?;
    conn.busy_timeout(DB_BUSY_TIMEOUT)?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| DatabaseError(format!("Creating transaction: {}", e)))?;

    modifications(&tx)?;
    tx.commit()
        .map_err(|e| DatabaseError(format!("Committing transaction: {}", e)))?;

    Ok(())
}

// Internal helper for queries boilerplate
fn db_query<'a, P, F, T>(
    path: &Path,
    stmt_str: &'a str,
    params: P,
    f: F,
) -> Result<Vec<T>, DatabaseError>
where
    P: rusqlite::Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let conn = Connection::open(path)
        .map_err(|e| DatabaseError(format!("Opening database for query: {}", e)))?;
    conn.busy_timeout(DB_BUSY_TIMEOUT)?;

    let result = conn
        .prepare(stmt_str)
        .map_err(|e| DatabaseError(format!("Preparing query: '{}'", e)))?
        .query_map(params, f)
        .map_err(|e| DatabaseError(format!("Mapping query: '{}'", e)))?
        .collect::<rusqlite::Result<Vec<T>>>()
        .map_err(|e| DatabaseError(format!("Executing query: '{}'", e)));
    result
}

// A TEXT column holding a txid in the usual reversed-hex form
fn txid_from_row(row: &Row, index: usize) -> rusqlite::Result<Txid> {
    let hex: String = row.get(index)?;
    Txid::from_str(&hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_txid_from_row(row: &Row, index: usize) -> rusqlite::Result<Option<Txid>> {
    let hex: Option<String> = row.get(index)?;
    hex.map(|hex| {
        Txid::from_str(&hex).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
    })
    .transpose()
}

fn status_from_row(row: &Row, index: usize) -> rusqlite::Result<TriggerStatus> {
    let status: String = row.get(index)?;
    TriggerStatus::from_str(&status).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            format!("Unknown trigger status '{}'", status).into(),
        )
    })
}

fn trigger_from_row(row: &Row) -> rusqlite::Result<DbTrigger> {
    Ok(DbTrigger {
        txid: txid_from_row(row, 0)?,
        vault_id: row.get(1)?,
        status: status_from_row(row, 2)?,
        commitment_txid: opt_txid_from_row(row, 3)?,
    })
}

fn notification_from_row(row: &Row) -> rusqlite::Result<DbNotification> {
    Ok(DbNotification {
        push_token: row.get(0)?,
        vault_id: row.get(1)?,
        wallet_id: row.get(2)?,
        wallet_name: row.get(3)?,
        vault_number: row.get(4)?,
        watchtower_id: row.get(5)?,
        locale: row.get(6)?,
        first_attempt_at: row.get(7)?,
        last_attempt_at: row.get(8)?,
        attempt_count: row.get(9)?,
        acknowledged: row.get(10)?,
    })
}

const NOTIFICATION_COLUMNS: &str = "n.push_token, n.vault_id, n.wallet_id, n.wallet_name, \
     n.vault_number, n.watchtower_id, n.locale, n.first_attempt_at, n.last_attempt_at, \
     n.attempt_count, n.acknowledged";

/// Get the database version
pub fn db_version(db_path: &Path) -> Result<u32, DatabaseError> {
    let mut rows = db_query(db_path, "SELECT version FROM version", [], |row| {
        row.get::<_, u32>(0)
    })?;

    rows.pop()
        .ok_or_else(|| DatabaseError("No row in version table?".to_string()))
}

/// The height up to which the last successful cycle scanned, if any cycle
/// completed yet.
pub fn db_last_checked_height(db_path: &Path) -> Result<Option<u32>, DatabaseError> {
    let mut rows = db_query(
        db_path,
        "SELECT last_checked_height FROM network_state WHERE id = 1",
        [],
        |row| row.get::<_, Option<u32>>(0),
    )?;

    Ok(rows.pop().flatten())
}

/// All triggers currently in one of the given statuses.
pub fn db_triggers_by_status(
    db_path: &Path,
    statuses: &[TriggerStatus],
) -> Result<Vec<DbTrigger>, DatabaseError> {
    // The IN list is built from our own enum, not from user input.
    let list = statuses
        .iter()
        .map(|s| format!("'{}'", s))
        .collect::<Vec<_>>()
        .join(",");
    db_query(
        db_path,
        &format!(
            "SELECT txid, vault_id, status, commitment_txid FROM vault_txids \
             WHERE status IN ({}) ORDER BY txid",
            list
        ),
        [],
        trigger_from_row,
    )
}

/// A single trigger by txid.
pub fn db_trigger(db_path: &Path, txid: &Txid) -> Result<Option<DbTrigger>, DatabaseError> {
    let mut rows = db_query(
        db_path,
        "SELECT txid, vault_id, status, commitment_txid FROM vault_txids WHERE txid = ?1",
        [txid.to_string()],
        trigger_from_row,
    )?;

    Ok(rows.pop())
}

/// Whether any trigger already moved past 'unchecked'. Used by the
/// first-run corruption guard.
pub fn db_has_checked_triggers(db_path: &Path) -> Result<bool, DatabaseError> {
    let mut rows = db_query(
        db_path,
        "SELECT COUNT(*) FROM vault_txids WHERE status != 'unchecked'",
        [],
        |row| row.get::<_, i64>(0),
    )?;

    Ok(rows.pop().unwrap_or(0) > 0)
}

/// The vault a commitment txid is bound to, if any.
pub fn db_commitment(db_path: &Path, txid: &Txid) -> Result<Option<DbCommitment>, DatabaseError> {
    let mut rows = db_query(
        db_path,
        "SELECT txid, vault_id, created_at FROM commitments WHERE txid = ?1",
        [txid.to_string()],
        |row| {
            Ok(DbCommitment {
                txid: txid_from_row(row, 0)?,
                vault_id: row.get(1)?,
                created_at: row.get(2)?,
            })
        },
    )?;

    Ok(rows.pop())
}

/// A notification registration by primary key.
pub fn db_notification(
    db_path: &Path,
    push_token: &str,
    vault_id: &str,
) -> Result<Option<DbNotification>, DatabaseError> {
    let mut rows = db_query(
        db_path,
        &format!(
            "SELECT {} FROM notifications n WHERE n.push_token = ?1 AND n.vault_id = ?2",
            NOTIFICATION_COLUMNS
        ),
        [push_token, vault_id],
        notification_from_row,
    )?;

    Ok(rows.pop())
}

/// A notification registration joined with the trigger that makes it
/// eligible for delivery.
#[derive(Debug, Clone)]
pub struct DbDueNotification {
    pub notification: DbNotification,
    pub txid: Txid,
    pub status: TriggerStatus,
    pub commitment_txid: Option<Txid>,
}

fn due_notification_from_row(row: &Row) -> rusqlite::Result<DbDueNotification> {
    Ok(DbDueNotification {
        notification: notification_from_row(row)?,
        txid: txid_from_row(row, 11)?,
        status: status_from_row(row, 12)?,
        commitment_txid: opt_txid_from_row(row, 13)?,
    })
}

// A vault can in principle carry several triggers; a registration is due
// once, for the first eligible one.
fn dedup_by_registration(rows: Vec<DbDueNotification>) -> Vec<DbDueNotification> {
    let mut seen = std::collections::HashSet::new();
    rows.into_iter()
        .filter(|row| {
            seen.insert((
                row.notification.push_token.clone(),
                row.notification.vault_id.clone(),
            ))
        })
        .collect()
}

/// Registrations whose delivery schedule is due at `now`:
/// never acknowledged, trigger seen on the network, inside the retry
/// window, and either never attempted or past the current phase's delay
/// (6-hourly during the first day, daily afterwards).
pub fn db_due_notifications(
    db_path: &Path,
    now: i64,
) -> Result<Vec<DbDueNotification>, DatabaseError> {
    let rows = db_query(
        db_path,
        &format!(
            "SELECT {}, t.txid, t.status, t.commitment_txid \
             FROM notifications n \
             JOIN vault_txids t ON t.vault_id = n.vault_id \
             WHERE n.acknowledged = 0 \
               AND t.status IN ('reversible', 'irreversible') \
               AND (n.first_attempt_at IS NULL OR n.first_attempt_at > ?1 - ?2) \
               AND (n.attempt_count = 0 \
                 OR (?1 - n.first_attempt_at <= ?4 AND ?1 - n.last_attempt_at >= ?3) \
                 OR (?1 - n.first_attempt_at > ?4 AND ?1 - n.last_attempt_at >= ?4)) \
             ORDER BY n.push_token, n.vault_id, t.txid",
            NOTIFICATION_COLUMNS
        ),
        rusqlite::params![
            now,
            MAX_RETRY_WINDOW,
            FIRST_DAY_RETRY_INTERVAL,
            LATER_RETRY_INTERVAL
        ],
        due_notification_from_row,
    )?;

    Ok(dedup_by_registration(rows))
}

/// The unacknowledged, already-attempted registrations of a device whose
/// trigger is currently seen on the network. Backs the /notifications
/// endpoint.
pub fn db_active_notifications(
    db_path: &Path,
    push_token: &str,
) -> Result<Vec<DbDueNotification>, DatabaseError> {
    let rows = db_query(
        db_path,
        &format!(
            "SELECT {}, t.txid, t.status, t.commitment_txid \
             FROM notifications n \
             JOIN vault_txids t ON t.vault_id = n.vault_id \
             WHERE n.push_token = ?1 \
               AND n.acknowledged = 0 \
               AND n.attempt_count > 0 \
               AND t.status IN ('reversible', 'irreversible') \
             ORDER BY n.vault_id, t.txid",
            NOTIFICATION_COLUMNS
        ),
        [push_token],
        due_notification_from_row,
    )?;

    Ok(dedup_by_registration(rows))
}
