//! In-memory fakes shared by the unit tests: a scriptable chain view and
//! a push gateway that records what it was asked to deliver.

use crate::{
    chain::{ChainError, ChainSource, TxDetails, TxInput, TxStatus},
    notifier::push::{PushError, PushGateway, PushMessage},
};

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::PathBuf,
    str::FromStr,
    sync::{Arc, Mutex},
};

use bitcoin::{BlockHash, Txid};

pub fn dummy_txid(n: u8) -> Txid {
    Txid::from_str(&format!("{:064x}", n)).expect("Valid txid hex")
}

/// A unique, clean temporary database path for one test.
pub fn temp_db_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "watchtowerd-{}-{}.sqlite",
        name,
        std::process::id()
    ));
    if path.exists() {
        std::fs::remove_file(&path).expect("Removing stale test db");
    }
    path
}

#[derive(Default)]
struct ChainState {
    tip: u32,
    // Height -> hash, re-assigned whenever a block is (re)set so a
    // "reorged" block gets a fresh hash like on a real chain
    hashes: BTreeMap<u32, BlockHash>,
    txids: HashMap<BlockHash, Vec<Txid>>,
    mempool: HashSet<Txid>,
    details: HashMap<Txid, TxDetails>,
    hash_counter: u64,
}

/// A scriptable chain view. Clones share the underlying state, so a test
/// can keep a handle and rewrite history between monitor cycles.
#[derive(Clone, Default)]
pub struct FakeChain(Arc<Mutex<ChainState>>);

impl FakeChain {
    pub fn set_tip(&self, tip: u32) {
        self.0.lock().unwrap().tip = tip;
    }

    /// Define (or rewrite) the block at the given height.
    pub fn set_block(&self, height: u32, txids: Vec<Txid>) {
        let mut state = self.0.lock().unwrap();
        state.hash_counter += 1;
        let hash = BlockHash::from_str(&format!("{:016x}{:048x}", height, state.hash_counter))
            .expect("Valid block hash hex");
        if let Some(old) = state.hashes.insert(height, hash) {
            state.txids.remove(&old);
        }
        state.txids.insert(hash, txids);
    }

    /// Make sure every height of the range has (an empty) block.
    pub fn fill_blocks(&self, from: u32, to: u32) {
        for height in from..=to {
            if !self.0.lock().unwrap().hashes.contains_key(&height) {
                self.set_block(height, vec![]);
            }
        }
    }

    pub fn add_mempool(&self, txid: Txid) {
        self.0.lock().unwrap().mempool.insert(txid);
    }

    pub fn remove_mempool(&self, txid: &Txid) {
        self.0.lock().unwrap().mempool.remove(txid);
    }

    pub fn set_details(&self, txid: Txid, spends: Vec<Txid>) {
        self.0.lock().unwrap().details.insert(
            txid,
            TxDetails {
                vin: spends
                    .into_iter()
                    .map(|txid| TxInput { txid: Some(txid) })
                    .collect(),
            },
        );
    }
}

impl ChainSource for FakeChain {
    fn tip_height(&self) -> Result<u32, ChainError> {
        Ok(self.0.lock().unwrap().tip)
    }

    fn block_hash(&self, height: u32) -> Result<BlockHash, ChainError> {
        self.0
            .lock()
            .unwrap()
            .hashes
            .get(&height)
            .copied()
            .ok_or_else(|| ChainError::Payload(format!("no block at height {}", height)))
    }

    fn block_txids(&self, hash: &BlockHash) -> Result<Vec<Txid>, ChainError> {
        self.0
            .lock()
            .unwrap()
            .txids
            .get(hash)
            .cloned()
            .ok_or_else(|| ChainError::Payload(format!("unknown block '{}'", hash)))
    }

    fn mempool_txids(&self) -> Result<HashSet<Txid>, ChainError> {
        Ok(self.0.lock().unwrap().mempool.clone())
    }

    fn tx_status(&self, txid: &Txid) -> Result<Option<TxStatus>, ChainError> {
        let state = self.0.lock().unwrap();
        for (height, hash) in state.hashes.iter() {
            if state.txids[hash].contains(txid) {
                return Ok(Some(TxStatus {
                    confirmed: true,
                    block_height: Some(*height),
                    block_hash: Some(*hash),
                }));
            }
        }
        if state.mempool.contains(txid) {
            return Ok(Some(TxStatus {
                confirmed: false,
                block_height: None,
                block_hash: None,
            }));
        }
        Ok(None)
    }

    fn tx_details(&self, txid: &Txid) -> Result<Option<TxDetails>, ChainError> {
        Ok(self.0.lock().unwrap().details.get(txid).cloned())
    }
}

/// A push gateway that records messages instead of delivering them, and
/// can be told to fail.
#[derive(Clone, Default)]
pub struct RecordingGateway {
    sent: Arc<Mutex<Vec<PushMessage>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingGateway {
    pub fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

impl PushGateway for RecordingGateway {
    fn send(&self, message: &PushMessage) -> Result<(), PushError> {
        if *self.failing.lock().unwrap() {
            return Err(PushError::Status(503));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
