pub mod cache;
pub mod poller;

use crate::{chain::ChainError, database::DatabaseError};

/// Message from the main thread to a network's monitor thread
pub enum MonitorMessage {
    Shutdown,
}

/// An error happened in a monitor's cycle. Never escapes the cycle
/// boundary: the loop logs it, clears the block cache and retries from
/// the same height next cycle.
#[derive(Debug)]
pub enum MonitorError {
    Chain(ChainError),
    Database(DatabaseError),
    /// The store contradicts itself (first-run guard tripped)
    Corruption(String),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MonitorError::Chain(e) => write!(f, "{}", e),
            MonitorError::Database(e) => write!(f, "{}", e),
            MonitorError::Corruption(s) => write!(f, "Corrupted state: {}", s),
        }
    }
}

impl std::error::Error for MonitorError {}

impl From<ChainError> for MonitorError {
    fn from(e: ChainError) -> Self {
        Self::Chain(e)
    }
}

impl From<DatabaseError> for MonitorError {
    fn from(e: DatabaseError) -> Self {
        Self::Database(e)
    }
}
