//! The per-network monitoring engine.
//!
//! Each enabled network runs one monitor on its own thread. A cycle
//! reconciles the store with the indexer's view of the chain and the
//! mempool, then hands the eligible registrations to the notification
//! scheduler, and only then commits the scanned height. A crash or error
//! anywhere in between makes the next cycle redo the same window.
//!
//! `irreversible` is terminal: a reorg deeper than the threshold window
//! goes unnoticed, by the threshold's definition of "deep enough".

use crate::{
    chain::ChainSource,
    config::{NetworkId, IRREVERSIBLE_THRESHOLD},
    database::{
        actions::{
            db_reset_delivery, db_update_last_checked_height, db_update_trigger_status,
        },
        interface::{db_has_checked_triggers, db_last_checked_height, db_triggers_by_status},
        schema::TriggerStatus,
    },
    monitor::{cache::BlockCache, MonitorError, MonitorMessage},
    notifier::{self, push::PushGateway},
    unix_now,
};

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::mpsc::{Receiver, RecvTimeoutError},
};

use bitcoin::Txid;

/// The per-network monitoring state: the store, the chain view, the push
/// gateway and the block cache all belong to this network alone.
pub struct Monitor<C: ChainSource, P: PushGateway> {
    network: NetworkId,
    db_path: PathBuf,
    chain: C,
    push: P,
    cache: BlockCache,
}

fn status_at_depth(confirmations: u32) -> TriggerStatus {
    if confirmations >= IRREVERSIBLE_THRESHOLD {
        TriggerStatus::Irreversible
    } else {
        TriggerStatus::Reversible
    }
}

impl<C: ChainSource, P: PushGateway> Monitor<C, P> {
    pub fn new(network: NetworkId, db_path: PathBuf, chain: C, push: P) -> Monitor<C, P> {
        Monitor {
            network,
            db_path,
            chain,
            push,
            // Twice the rescan depth is enough to keep the working set
            // memoized across cycles
            cache: BlockCache::new(2 * IRREVERSIBLE_THRESHOLD as usize),
        }
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    fn update_status(&self, txid: &Txid, from: TriggerStatus, to: TriggerStatus) -> Result<(), MonitorError> {
        if from == to {
            return Ok(());
        }
        log::debug!(
            "Trigger '{}' moving from '{}' to '{}' on '{}'",
            txid,
            from,
            to,
            self.network
        );
        db_update_trigger_status(&self.db_path, txid, to)?;

        Ok(())
    }

    // Triggers we never looked up yet get an individual status query.
    fn check_unchecked_triggers(
        &self,
        tip: u32,
        mempool: &HashSet<Txid>,
    ) -> Result<(), MonitorError> {
        for trigger in db_triggers_by_status(&self.db_path, &[TriggerStatus::Unchecked])? {
            let status = self.chain.tx_status(&trigger.txid)?;
            let confirmed = status.as_ref().map(|s| s.confirmed).unwrap_or(false);

            let new_status = if confirmed || mempool.contains(&trigger.txid) {
                let confirmations = status
                    .as_ref()
                    .and_then(|s| s.block_height)
                    .map(|height| tip.saturating_sub(height) + 1)
                    .unwrap_or(0);
                status_at_depth(confirmations)
            } else {
                TriggerStatus::Unseen
            };
            self.update_status(&trigger.txid, trigger.status, new_status)?;
        }

        Ok(())
    }

    // Walk the blocks from just below the last checked height up to the
    // tip. Replaced blocks miss the hash-keyed cache and get re-fetched,
    // which is how reorgs up to the threshold depth are absorbed.
    // Returns the union of the txids seen in the window.
    fn scan_window(
        &mut self,
        last_checked: u32,
        tip: u32,
        mempool: &HashSet<Txid>,
    ) -> Result<HashSet<Txid>, MonitorError> {
        let mut scanned = HashSet::new();
        let start = last_checked.saturating_sub(IRREVERSIBLE_THRESHOLD);

        for height in start..=tip {
            let hash = self.chain.block_hash(height)?;
            if self.cache.get(&hash).is_none() {
                let txids = self.chain.block_txids(&hash)?;
                self.cache.insert(hash, txids);
            }
            let block_txids: HashSet<Txid> = self
                .cache
                .get(&hash)
                .expect("Just inserted")
                .iter()
                .copied()
                .collect();
            scanned.extend(block_txids.iter().copied());

            for trigger in db_triggers_by_status(
                &self.db_path,
                &[TriggerStatus::Unseen, TriggerStatus::Reversible],
            )? {
                if block_txids.contains(&trigger.txid) {
                    let confirmations = tip - height + 1;
                    self.update_status(
                        &trigger.txid,
                        trigger.status,
                        status_at_depth(confirmations),
                    )?;
                } else if trigger.status == TriggerStatus::Unseen
                    && mempool.contains(&trigger.txid)
                {
                    self.update_status(&trigger.txid, trigger.status, TriggerStatus::Reversible)?;
                }
            }
        }

        Ok(scanned)
    }

    // A reversible trigger that shows up neither in the rescanned window
    // nor in the mempool was reorged out or purged: forget we saw it, and
    // start the vault's delivery bookkeeping over.
    fn sweep_disappeared(
        &self,
        scanned: &HashSet<Txid>,
        mempool: &HashSet<Txid>,
    ) -> Result<(), MonitorError> {
        for trigger in db_triggers_by_status(&self.db_path, &[TriggerStatus::Reversible])? {
            if !scanned.contains(&trigger.txid) && !mempool.contains(&trigger.txid) {
                log::warn!(
                    "Trigger '{}' of vault '{}' disappeared from '{}' (reorg or mempool purge)",
                    trigger.txid,
                    trigger.vault_id,
                    self.network
                );
                self.update_status(&trigger.txid, trigger.status, TriggerStatus::Unseen)?;
                db_reset_delivery(&self.db_path, &trigger.vault_id)?;
            }
        }

        Ok(())
    }

    /// One pass over this network: reconcile trigger statuses with the
    /// chain view, notify, and commit the scanned height. Any error
    /// leaves the height untouched so the next cycle redoes the window.
    pub fn run_cycle(&mut self, now: i64) -> Result<(), MonitorError> {
        let last_checked = db_last_checked_height(&self.db_path)?;
        let tip = self.chain.tip_height()?;
        log::trace!(
            "Starting cycle on '{}': tip {}, last checked {:?}",
            self.network,
            tip,
            last_checked
        );

        // First run: nothing can have been checked before our first look
        // at the chain.
        if last_checked.is_none() && db_has_checked_triggers(&self.db_path)? {
            return Err(MonitorError::Corruption(
                "no last checked height, but some triggers are already checked".to_string(),
            ));
        }

        let mempool = self.chain.mempool_txids()?;

        self.check_unchecked_triggers(tip, &mempool)?;

        // The disappearance sweep is only meaningful against a freshly
        // rescanned window: on a first cycle nothing was scanned and a
        // just-confirmed trigger would wrongly look vanished.
        if let Some(last_checked) = last_checked.filter(|height| *height > 0) {
            let scanned = self.scan_window(last_checked, tip, &mempool)?;
            self.sweep_disappeared(&scanned, &mempool)?;
        }

        notifier::dispatch_due(&self.db_path, self.network, &self.chain, &self.push, now)?;

        db_update_last_checked_height(&self.db_path, tip)?;

        Ok(())
    }
}

/// The monitor event loop: run a cycle, sleep until the next one or
/// until the main thread tells us to stop. The in-flight cycle always
/// completes; only the sleep is interruptible.
pub fn monitor_main_loop<C: ChainSource, P: PushGateway>(
    mut monitor: Monitor<C, P>,
    rx: Receiver<MonitorMessage>,
) {
    let interval = monitor.network().cycle_interval();
    log::info!(
        "Monitor for '{}' started, cycling every {}s",
        monitor.network(),
        interval.as_secs()
    );

    loop {
        if let Err(e) = monitor.run_cycle(unix_now()) {
            log::error!("Error in cycle on '{}': '{}'", monitor.network(), e);
            monitor.clear_cache();
        }

        match rx.recv_timeout(interval) {
            Ok(MonitorMessage::Shutdown) => {
                log::info!("Monitor for '{}' received shutdown. Exiting.", monitor.network());
                return;
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::error!(
                    "Monitor for '{}': channel with main thread disconnected. Exiting.",
                    monitor.network()
                );
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}
