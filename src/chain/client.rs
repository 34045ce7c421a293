use crate::chain::{ChainError, ChainSource, TxDetails, TxStatus};

use std::{
    collections::HashSet,
    str::FromStr,
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use bitcoin::{BlockHash, Txid};
use serde::de::DeserializeOwned;

/// If the indexer takes more than 30 seconds to answer one of our
/// queries, fail.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Leave the indexer some breathing room between two of our calls.
const MIN_CALL_GAP: Duration = Duration::from_millis(300);

/// How many times a single operation is tried before the cycle gives up.
const MAX_ATTEMPTS: u32 = 3;

/// A typed client for one network's Esplora-compatible REST API.
///
/// All calls go through the pacing gate: a call may only start once the
/// previous call's minimum gap has elapsed, and the gate is re-armed
/// after each call whether it succeeded or not.
pub struct EsploraClient {
    base_url: String,
    client: reqwest::blocking::Client,
    next_call: Mutex<Instant>,
}

impl EsploraClient {
    pub fn new(base_url: &str) -> Result<Self, ChainError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ChainError::Transport)?;

        Ok(EsploraClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            next_call: Mutex::new(Instant::now()),
        })
    }

    fn pace(&self) {
        let next_call = *self.next_call.lock().unwrap();
        let now = Instant::now();
        if next_call > now {
            thread::sleep(next_call - now);
        }
    }

    fn rearm(&self) {
        *self.next_call.lock().unwrap() = Instant::now() + MIN_CALL_GAP;
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response, ChainError> {
        self.pace();
        let response = self.client.get(format!("{}{}", self.base_url, path)).send();
        self.rearm();

        response.map_err(|e| {
            if e.is_timeout() {
                ChainError::Timeout
            } else {
                ChainError::Transport(e)
            }
        })
    }

    // One GET with retries on transient failures. When `allow_missing`, a
    // 404 is a structured absence, not an error.
    fn call<T>(
        &self,
        path: &str,
        allow_missing: bool,
        parse: impl Fn(reqwest::blocking::Response) -> Result<T, ChainError>,
    ) -> Result<Option<T>, ChainError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let result = self.get(path).and_then(|response| {
                let status = response.status();
                if status.is_success() {
                    parse(response).map(Some)
                } else if status.as_u16() == 404 && allow_missing {
                    Ok(None)
                } else {
                    Err(ChainError::Status(status.as_u16()))
                }
            });

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    log::debug!(
                        "Error calling '{}{}' (attempt {}): '{}'. Retrying.",
                        self.base_url,
                        path,
                        attempt,
                        e
                    );
                    thread::sleep(MIN_CALL_GAP * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn call_text<T: FromStr>(&self, path: &str) -> Result<T, ChainError>
    where
        T::Err: std::fmt::Display,
    {
        self.call(path, false, |response| {
            let body = response.text().map_err(ChainError::Transport)?;
            T::from_str(body.trim())
                .map_err(|e| ChainError::Payload(format!("parsing '{}': {}", body.trim(), e)))
        })
        .map(|value| value.expect("404 is an error here"))
    }

    fn call_json<T: DeserializeOwned>(
        &self,
        path: &str,
        allow_missing: bool,
    ) -> Result<Option<T>, ChainError> {
        self.call(path, allow_missing, |response| {
            response
                .json::<T>()
                .map_err(|e| ChainError::Payload(e.to_string()))
        })
    }
}

impl ChainSource for EsploraClient {
    fn tip_height(&self) -> Result<u32, ChainError> {
        self.call_text("/blocks/tip/height")
    }

    fn block_hash(&self, height: u32) -> Result<BlockHash, ChainError> {
        self.call_text(&format!("/block-height/{}", height))
    }

    fn block_txids(&self, hash: &BlockHash) -> Result<Vec<Txid>, ChainError> {
        Ok(self
            .call_json::<Vec<Txid>>(&format!("/block/{}/txids", hash), false)?
            .expect("404 is an error here"))
    }

    fn mempool_txids(&self) -> Result<HashSet<Txid>, ChainError> {
        Ok(self
            .call_json::<Vec<Txid>>("/mempool/txids", false)?
            .expect("404 is an error here")
            .into_iter()
            .collect())
    }

    fn tx_status(&self, txid: &Txid) -> Result<Option<TxStatus>, ChainError> {
        self.call_json(&format!("/tx/{}/status", txid), true)
    }

    fn tx_details(&self, txid: &Txid) -> Result<Option<TxDetails>, ChainError> {
        self.call_json(&format!("/tx/{}", txid), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_normalization() {
        let client = EsploraClient::new("http://localhost:3002/").unwrap();
        assert_eq!(client.base_url, "http://localhost:3002");
        let client = EsploraClient::new("https://blockstream.info/api").unwrap();
        assert_eq!(client.base_url, "https://blockstream.info/api");
    }

    #[test]
    fn pacing_gate_spaces_calls() {
        let client = EsploraClient::new("http://localhost:3002").unwrap();

        // First call may go through immediately
        let start = Instant::now();
        client.pace();
        assert!(start.elapsed() < MIN_CALL_GAP);

        // Once re-armed, the next call has to wait out the gap
        client.rearm();
        client.pace();
        assert!(start.elapsed() >= MIN_CALL_GAP);
    }
}
