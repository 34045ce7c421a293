pub mod client;

use std::collections::HashSet;

use bitcoin::{BlockHash, Txid};
use serde::Deserialize;

/// An error happened while talking to the Esplora indexer
#[derive(Debug)]
pub enum ChainError {
    /// The indexer did not answer within the deadline
    Timeout,
    /// We could not reach the indexer
    Transport(reqwest::Error),
    /// The indexer answered with an unexpected HTTP status
    Status(u16),
    /// The indexer answered something we could not interpret
    Payload(String),
}

impl ChainError {
    /// Worth retrying within the same call?
    pub fn is_transient(&self) -> bool {
        match self {
            ChainError::Timeout | ChainError::Transport(_) => true,
            ChainError::Status(code) => *code == 429 || *code >= 500,
            ChainError::Payload(_) => false,
        }
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ChainError::Timeout => write!(f, "Chain server error: request timed out"),
            ChainError::Transport(e) => write!(f, "Chain server error: {}", e),
            ChainError::Status(code) => write!(f, "Chain server error: HTTP status {}", code),
            ChainError::Payload(e) => write!(f, "Chain server error: bad payload: {}", e),
        }
    }
}

impl std::error::Error for ChainError {}

/// Confirmation state of a transaction known to the indexer.
#[derive(Debug, Clone, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    pub block_height: Option<u32>,
    pub block_hash: Option<BlockHash>,
}

/// The slice of a transaction's details we care about: which outpoints
/// it spends.
#[derive(Debug, Clone, Deserialize)]
pub struct TxDetails {
    pub vin: Vec<TxInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxInput {
    // Absent on coinbase inputs
    #[serde(default)]
    pub txid: Option<Txid>,
}

/// What the monitor needs from a chain view. Implemented over Esplora in
/// production, and by an in-memory fake in the monitor tests.
pub trait ChainSource {
    /// Current best block height.
    fn tip_height(&self) -> Result<u32, ChainError>;

    /// Hash of the block currently at the given height.
    fn block_hash(&self, height: u32) -> Result<BlockHash, ChainError>;

    /// Ordered txids of a block.
    fn block_txids(&self, hash: &BlockHash) -> Result<Vec<Txid>, ChainError>;

    /// The txids currently in the mempool. Large.
    fn mempool_txids(&self) -> Result<HashSet<Txid>, ChainError>;

    /// Confirmation status of a transaction, or None if the indexer never
    /// heard of it.
    fn tx_status(&self, txid: &Txid) -> Result<Option<TxStatus>, ChainError>;

    /// Details of a transaction, or None if the indexer never heard of it.
    fn tx_details(&self, txid: &Txid) -> Result<Option<TxDetails>, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ChainError::Timeout.is_transient());
        assert!(ChainError::Status(500).is_transient());
        assert!(ChainError::Status(503).is_transient());
        assert!(ChainError::Status(429).is_transient());
        assert!(!ChainError::Status(400).is_transient());
        assert!(!ChainError::Status(404).is_transient());
        assert!(!ChainError::Payload("nonsense".to_string()).is_transient());
    }

    #[test]
    fn tx_status_decoding() {
        let confirmed: TxStatus = serde_json::from_str(
            "{\"confirmed\":true,\"block_height\":705632,\"block_hash\":\
             \"00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054\",\
             \"block_time\":1633804175}",
        )
        .unwrap();
        assert!(confirmed.confirmed);
        assert_eq!(confirmed.block_height, Some(705632));
        assert!(confirmed.block_hash.is_some());

        let mempool: TxStatus = serde_json::from_str("{\"confirmed\":false}").unwrap();
        assert!(!mempool.confirmed);
        assert_eq!(mempool.block_height, None);
    }

    #[test]
    fn tx_details_decoding() {
        let details: TxDetails = serde_json::from_str(
            "{\"txid\":\"2222222222222222222222222222222222222222222222222222222222222222\",\
             \"version\":2,\"vin\":[{\"txid\":\
             \"1111111111111111111111111111111111111111111111111111111111111111\",\
             \"vout\":0}],\"vout\":[]}",
        )
        .unwrap();
        assert_eq!(details.vin.len(), 1);
        assert_eq!(
            details.vin[0].txid.unwrap().to_string(),
            "1111111111111111111111111111111111111111111111111111111111111111"
        );
    }
}
