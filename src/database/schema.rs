use std::{fmt, str::FromStr};

use bitcoin::Txid;

pub const SCHEMA: &str = "\
CREATE TABLE version (
    version INTEGER NOT NULL
);

/* The trigger transactions we watch the chain for. A txid is globally
 * unique across all vaults of a network: registering it again under
 * another vault is a no-op (first write wins).
 * The commitment_txid, when set, MUST reference a row of 'commitments'
 * with the same vault_id.
 */
CREATE TABLE vault_txids (
    txid TEXT PRIMARY KEY NOT NULL,
    vault_id TEXT NOT NULL,
    status TEXT NOT NULL,
    commitment_txid TEXT
);

/* The funding transaction that created a vault. Proof-of-payment for the
 * service, and spend-proof anchor for the vault's triggers. A commitment
 * txid belongs to exactly one vault, ever.
 */
CREATE TABLE commitments (
    txid TEXT PRIMARY KEY NOT NULL,
    vault_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

/* One row per (device, vault) pair. Attempt bookkeeping is reset as a
 * whole when the vault's trigger disappears from the chain view:
 * attempt_count = 0 <=> first_attempt_at IS NULL <=> last_attempt_at IS NULL.
 */
CREATE TABLE notifications (
    push_token TEXT NOT NULL,
    vault_id TEXT NOT NULL,
    wallet_id TEXT NOT NULL,
    wallet_name TEXT NOT NULL,
    vault_number INTEGER NOT NULL,
    watchtower_id TEXT NOT NULL,
    locale TEXT NOT NULL,
    first_attempt_at INTEGER,
    last_attempt_at INTEGER,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    acknowledged INTEGER NOT NULL DEFAULT 0 CHECK (acknowledged IN (0,1)),
    PRIMARY KEY (push_token, vault_id)
);

/* Singleton anchor for cycle resumption. last_checked_height is written
 * only at the end of a fully successful cycle.
 */
CREATE TABLE network_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_checked_height INTEGER
);

CREATE INDEX vault_txids_status ON vault_txids (status);
CREATE INDEX vault_txids_vault ON vault_txids (vault_id);
CREATE INDEX notifications_vault ON notifications (vault_id);
";

/// Where a trigger transaction stands with regard to the chain view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    /// Registered, never looked up yet
    Unchecked,
    /// Looked up, found neither in a block nor in the mempool
    Unseen,
    /// Seen, but with fewer confirmations than the irreversible threshold
    Reversible,
    /// Confirmed deeply enough that we consider it final
    Irreversible,
}

impl TriggerStatus {
    /// Statuses the notification scheduler considers "the vault was accessed"
    pub fn is_seen(&self) -> bool {
        matches!(self, Self::Reversible | Self::Irreversible)
    }
}

impl FromStr for TriggerStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unchecked" => Ok(Self::Unchecked),
            "unseen" => Ok(Self::Unseen),
            "reversible" => Ok(Self::Reversible),
            "irreversible" => Ok(Self::Irreversible),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                Self::Unchecked => "unchecked",
                Self::Unseen => "unseen",
                Self::Reversible => "reversible",
                Self::Irreversible => "irreversible",
            }
        )
    }
}

/// A row of the "vault_txids" table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbTrigger {
    pub txid: Txid,
    pub vault_id: String,
    pub status: TriggerStatus,
    pub commitment_txid: Option<Txid>,
}

/// A row of the "commitments" table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbCommitment {
    pub txid: Txid,
    pub vault_id: String,
    pub created_at: i64,
}

/// A row of the "notifications" table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbNotification {
    pub push_token: String,
    pub vault_id: String,
    pub wallet_id: String,
    pub wallet_name: String,
    pub vault_number: u32,
    pub watchtower_id: String,
    pub locale: String,
    pub first_attempt_at: Option<i64>,
    pub last_attempt_at: Option<i64>,
    pub attempt_count: u32,
    pub acknowledged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_status_roundtrip() {
        for status in [
            TriggerStatus::Unchecked,
            TriggerStatus::Unseen,
            TriggerStatus::Reversible,
            TriggerStatus::Irreversible,
        ] {
            assert_eq!(TriggerStatus::from_str(&status.to_string()), Ok(status));
        }
        assert!(TriggerStatus::from_str("confirmed").is_err());
    }

    #[test]
    fn seen_statuses() {
        assert!(!TriggerStatus::Unchecked.is_seen());
        assert!(!TriggerStatus::Unseen.is_seen());
        assert!(TriggerStatus::Reversible.is_seen());
        assert!(TriggerStatus::Irreversible.is_seen());
    }
}
