//! Commitment verification.
//!
//! A commitment is the funding transaction that created a vault. It is
//! checked twice: at registration time it must pay at least one address
//! of the operator-managed authorized-addresses database (proof of
//! payment for the service), and before the first notification the
//! observed trigger must spend one of its outputs (spend-proof).

use crate::{
    chain::ChainSource,
    config::NetworkId,
    database::{interface::db_commitment, DatabaseError},
};

use std::path::Path;

use bitcoin::{consensus::encode, Address, Transaction, Txid};
use rusqlite::{Connection, OpenFlags, OptionalExtension};

#[derive(Debug)]
pub enum CommitmentError {
    /// The provided hex is not a Bitcoin transaction
    Decode(String),
    /// This commitment is already bound to another vault
    Reused(Txid),
    /// No output of the commitment pays an authorized address
    Unauthorized(Txid),
    /// The authorized-addresses database is not usable
    AuthorizationUnavailable(String),
    Database(DatabaseError),
}

impl std::fmt::Display for CommitmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CommitmentError::Decode(e) => write!(f, "Invalid commitment transaction: {}", e),
            CommitmentError::Reused(txid) => {
                write!(f, "Commitment '{}' is bound to another vault", txid)
            }
            CommitmentError::Unauthorized(txid) => {
                write!(f, "Commitment '{}' pays no authorized address", txid)
            }
            CommitmentError::AuthorizationUnavailable(e) => {
                write!(f, "Authorized-addresses database unavailable: {}", e)
            }
            CommitmentError::Database(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CommitmentError {}

impl From<DatabaseError> for CommitmentError {
    fn from(e: DatabaseError) -> Self {
        Self::Database(e)
    }
}

fn tx_from_hex(hex: &str) -> Result<Transaction, CommitmentError> {
    let bytes = hex::decode(hex).map_err(|e| CommitmentError::Decode(e.to_string()))?;
    encode::deserialize::<Transaction>(&bytes).map_err(|e| CommitmentError::Decode(e.to_string()))
}

// The output addresses of the transaction under this network's
// parameters. Non-standard outputs are simply not addresses.
fn output_addresses(tx: &Transaction, network: NetworkId) -> Vec<String> {
    tx.output
        .iter()
        .filter_map(|txo| {
            Address::from_script(&txo.script_pubkey, network.address_network())
                .map(|address| address.to_string())
                .ok()
        })
        .collect()
}

// Look the addresses up in the externally-maintained database. We only
// ever open it read-only: it belongs to another process.
fn any_address_authorized(
    addresses_db: &Path,
    addresses: &[String],
) -> Result<bool, CommitmentError> {
    let conn = Connection::open_with_flags(addresses_db, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| {
            CommitmentError::AuthorizationUnavailable(format!(
                "Opening '{}': {}",
                addresses_db.display(),
                e
            ))
        })?;
    let mut stmt = conn
        .prepare("SELECT 1 FROM addresses WHERE address = ?1")
        .map_err(|e| CommitmentError::AuthorizationUnavailable(format!("Querying: {}", e)))?;

    for address in addresses {
        let hit: Option<i64> = stmt
            .query_row([address], |row| row.get(0))
            .optional()
            .map_err(|e| CommitmentError::AuthorizationUnavailable(format!("Querying: {}", e)))?;
        if hit.is_some() {
            return Ok(true);
        }
    }

    Ok(false)
}

// Decode the commitment and make sure its txid is not already bound to
// another vault. Returns the decoded transaction, its txid and whether
// this exact binding already exists (idempotent re-registration).
fn decode_and_check_reuse(
    watchtower_db: &Path,
    vault_id: &str,
    commitment_hex: &str,
) -> Result<(Transaction, Txid, bool), CommitmentError> {
    let tx = tx_from_hex(commitment_hex)?;
    let txid = tx.txid();

    match db_commitment(watchtower_db, &txid)? {
        Some(commitment) if commitment.vault_id == vault_id => Ok((tx, txid, true)),
        Some(_) => Err(CommitmentError::Reused(txid)),
        None => Ok((tx, txid, false)),
    }
}

/// Decode a commitment and check the exclusive-binding invariant only.
/// Used when the service runs without commitment authorization: the
/// commitment is still bound for the spend-proof, but no proof of
/// payment is required.
pub fn check_binding(
    watchtower_db: &Path,
    vault_id: &str,
    commitment_hex: &str,
) -> Result<Txid, CommitmentError> {
    decode_and_check_reuse(watchtower_db, vault_id, commitment_hex).map(|(_, txid, _)| txid)
}

/// Check that a hex-encoded commitment authorizes the declared vault:
/// either it is already bound to this vault (idempotent re-registration),
/// or it pays at least one authorized address. Returns the commitment
/// txid to bind to the vault's triggers.
pub fn check_authorization(
    watchtower_db: &Path,
    addresses_db: &Path,
    network: NetworkId,
    vault_id: &str,
    commitment_hex: &str,
) -> Result<Txid, CommitmentError> {
    let (tx, txid, already_bound) =
        decode_and_check_reuse(watchtower_db, vault_id, commitment_hex)?;
    if already_bound {
        return Ok(txid);
    }

    let addresses = output_addresses(&tx, network);
    if any_address_authorized(addresses_db, &addresses)? {
        Ok(txid)
    } else {
        Err(CommitmentError::Unauthorized(txid))
    }
}

/// Spend-proof: does the trigger spend an output of its commitment? On
/// any chain failure we answer no, the scheduler will ask again next
/// cycle.
pub fn spends_commitment(
    chain: &dyn ChainSource,
    trigger: &Txid,
    commitment: &Txid,
) -> bool {
    match chain.tx_details(trigger) {
        Ok(Some(details)) => details
            .vin
            .iter()
            .any(|input| input.txid.as_ref() == Some(commitment)),
        Ok(None) => false,
        Err(e) => {
            log::warn!(
                "Error fetching trigger '{}' for spend-proof: '{}'",
                trigger,
                e
            );
            false
        }
    }
}
