use crate::database::{
    interface::{db_exec, db_version},
    schema::{TriggerStatus, SCHEMA},
    DatabaseError, DB_VERSION,
};

use std::{fs, path::Path};

use bitcoin::Txid;
use rusqlite::{params, Connection, OptionalExtension};

// Create the db file with RW permissions only for the user
fn create_db_file(db_path: &Path) -> Result<(), std::io::Error> {
    let mut options = fs::OpenOptions::new();
    let options = options.read(true).write(true).create_new(true);

    #[cfg(unix)]
    return {
        use std::os::unix::fs::OpenOptionsExt;

        options.mode(0o600).open(db_path)?;
        Ok(())
    };

    #[cfg(not(unix))]
    return {
        options.open(db_path)?;
        Ok(())
    };
}

// No database yet ? Create a new one from the schema, in WAL mode so that
// the registration handlers and the monitor don't starve each other.
fn create_db(db_path: &Path) -> Result<(), DatabaseError> {
    // Rusqlite could create it for us, but we want custom permissions
    create_db_file(db_path)
        .map_err(|e| DatabaseError(format!("Creating db file: {}", e)))?;

    let conn = Connection::open(db_path)
        .map_err(|e| DatabaseError(format!("Opening fresh database: {}", e)))?;
    // journal_mode is persistent, setting it once at creation is enough
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| DatabaseError(format!("Setting journal mode: {}", e)))?;

    db_exec(db_path, |tx| {
        tx.execute_batch(SCHEMA)
            .map_err(|e| DatabaseError(format!("Creating database: {}", e)))?;
        tx.execute(
            "INSERT INTO version (version) VALUES (?1)",
            params![DB_VERSION],
        )
        .map_err(|e| DatabaseError(format!("Inserting version: {}", e)))?;
        tx.execute(
            "INSERT INTO network_state (id, last_checked_height) VALUES (1, NULL)",
            [],
        )
        .map_err(|e| DatabaseError(format!("Inserting network state: {}", e)))?;

        Ok(())
    })
}

// Called on startup to check database integrity
fn check_db(db_path: &Path) -> Result<(), DatabaseError> {
    // We'll eventually do migration here if version < VERSION, but be strict until then.
    let version = db_version(db_path)?;
    if version != DB_VERSION {
        return Err(DatabaseError(format!(
            "Unexpected database version: got '{}', expected '{}'",
            version, DB_VERSION
        )));
    }

    Ok(())
}

/// Create the watchtower database for a network if it does not exist yet,
/// and integrity-check it.
pub fn setup_db(db_path: &Path) -> Result<(), DatabaseError> {
    if !db_path.exists() {
        log::info!("No database at {:?}, creating a new one.", db_path);
        create_db(db_path)?;
    }

    check_db(db_path)?;

    Ok(())
}

/// Everything a single registration call wants persisted for one vault.
#[derive(Debug, Clone)]
pub struct VaultRegistration {
    pub vault_id: String,
    pub vault_number: u32,
    pub trigger_txids: Vec<Txid>,
    pub commitment_txid: Option<Txid>,
    pub push_token: String,
    pub wallet_id: String,
    pub wallet_name: String,
    pub watchtower_id: String,
    pub locale: String,
}

/// Atomically record a vault registration: the commitment binding (if
/// any), the (device, vault) notification row and the trigger rows all
/// commit together, or not at all.
///
/// Both the notification and the trigger inserts are first-write-wins:
/// re-registering is a no-op, and a trigger txid already registered under
/// another vault is left untouched.
pub fn db_register_vault(
    db_path: &Path,
    registration: &VaultRegistration,
    now: i64,
) -> Result<(), DatabaseError> {
    db_exec(db_path, |tx| {
        if let Some(commitment_txid) = &registration.commitment_txid {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT vault_id FROM commitments WHERE txid = ?1",
                    [commitment_txid.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| DatabaseError(format!("Querying commitment: {}", e)))?;
            match existing {
                Some(vault_id) if vault_id != registration.vault_id => {
                    return Err(DatabaseError(format!(
                        "Commitment '{}' is already bound to another vault",
                        commitment_txid
                    )));
                }
                Some(_) => {}
                None => {
                    tx.execute(
                        "INSERT INTO commitments (txid, vault_id, created_at) VALUES (?1, ?2, ?3)",
                        params![
                            commitment_txid.to_string(),
                            registration.vault_id,
                            now
                        ],
                    )
                    .map_err(|e| DatabaseError(format!("Inserting commitment: {}", e)))?;
                }
            }
        }

        tx.execute(
            "INSERT OR IGNORE INTO notifications (push_token, vault_id, wallet_id, \
             wallet_name, vault_number, watchtower_id, locale) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                registration.push_token,
                registration.vault_id,
                registration.wallet_id,
                registration.wallet_name,
                registration.vault_number,
                registration.watchtower_id,
                registration.locale,
            ],
        )
        .map_err(|e| DatabaseError(format!("Inserting notification: {}", e)))?;

        for txid in &registration.trigger_txids {
            tx.execute(
                "INSERT OR IGNORE INTO vault_txids (txid, vault_id, status, commitment_txid) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    txid.to_string(),
                    registration.vault_id,
                    TriggerStatus::Unchecked.to_string(),
                    registration
                        .commitment_txid
                        .as_ref()
                        .map(|txid| txid.to_string()),
                ],
            )
            .map_err(|e| DatabaseError(format!("Inserting trigger txid: {}", e)))?;
        }

        Ok(())
    })
}

/// Record a trigger's new status, as decided by the monitor.
pub fn db_update_trigger_status(
    db_path: &Path,
    txid: &Txid,
    status: TriggerStatus,
) -> Result<(), DatabaseError> {
    db_exec(db_path, |tx| {
        tx.execute(
            "UPDATE vault_txids SET status = ?1 WHERE txid = ?2",
            params![status.to_string(), txid.to_string()],
        )
        .map_err(|e| {
            DatabaseError(format!("Updating trigger to '{}': {}", status, e))
        })?;

        Ok(())
    })
}

/// Called at the very end of a successful cycle.
pub fn db_update_last_checked_height(db_path: &Path, height: u32) -> Result<(), DatabaseError> {
    db_exec(db_path, |tx| {
        tx.execute(
            "INSERT INTO network_state (id, last_checked_height) VALUES (1, ?1) \
             ON CONFLICT (id) DO UPDATE SET last_checked_height = ?1",
            params![height],
        )
        .map_err(|e| DatabaseError(format!("Updating last checked height: {}", e)))?;

        Ok(())
    })
}

/// Attempt bookkeeping, persisted before the push is handed to the
/// gateway. First attempt stamps both timestamps, later attempts only
/// move last_attempt_at.
pub fn db_record_attempt(
    db_path: &Path,
    push_token: &str,
    vault_id: &str,
    now: i64,
) -> Result<(), DatabaseError> {
    db_exec(db_path, |tx| {
        tx.execute(
            "UPDATE notifications SET \
             first_attempt_at = COALESCE(first_attempt_at, ?1), \
             last_attempt_at = ?1, \
             attempt_count = attempt_count + 1 \
             WHERE push_token = ?2 AND vault_id = ?3",
            params![now, push_token, vault_id],
        )
        .map_err(|e| DatabaseError(format!("Recording delivery attempt: {}", e)))?;

        Ok(())
    })
}

/// Mark a (device, vault) registration as acknowledged. Terminal: the
/// scheduler will never pick it up again. Returns whether such a
/// registration existed.
pub fn db_acknowledge(
    db_path: &Path,
    push_token: &str,
    vault_id: &str,
) -> Result<bool, DatabaseError> {
    let mut updated = 0;
    db_exec(db_path, |tx| {
        updated = tx
            .execute(
                "UPDATE notifications SET acknowledged = 1 \
                 WHERE push_token = ?1 AND vault_id = ?2",
                params![push_token, vault_id],
            )
            .map_err(|e| DatabaseError(format!("Acknowledging notification: {}", e)))?;

        Ok(())
    })?;

    Ok(updated > 0)
}

/// The vault's trigger went out of sight (reorg or mempool purge): clear
/// the attempt bookkeeping of every registration of this vault so the
/// next sighting notifies from scratch.
pub fn db_reset_delivery(db_path: &Path, vault_id: &str) -> Result<(), DatabaseError> {
    db_exec(db_path, |tx| {
        tx.execute(
            "UPDATE notifications SET \
             first_attempt_at = NULL, last_attempt_at = NULL, attempt_count = 0 \
             WHERE vault_id = ?1",
            params![vault_id],
        )
        .map_err(|e| DatabaseError(format!("Resetting delivery bookkeeping: {}", e)))?;

        Ok(())
    })
}
