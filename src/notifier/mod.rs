//! The notification scheduler.
//!
//! Invoked by the monitor at the end of each cycle, before the height
//! commit. Selection is entirely delegated to the store (see
//! `db_due_notifications`); this module gates first attempts behind the
//! commitment spend-proof, records the attempt bookkeeping and hands the
//! composed message to the push gateway. Bookkeeping goes in before the
//! delivery attempt: a failed push is simply retried at the next slot of
//! the schedule.

pub mod messages;
pub mod push;

use crate::{
    chain::ChainSource,
    commitment::spends_commitment,
    config::NetworkId,
    database::{
        actions::db_record_attempt, interface::db_due_notifications, DatabaseError,
    },
};

use std::path::Path;

use push::{PushGateway, PushMessage};

/// Deliver every notification whose schedule is due at `now`.
pub fn dispatch_due(
    db_path: &Path,
    network: NetworkId,
    chain: &dyn ChainSource,
    gateway: &dyn PushGateway,
    now: i64,
) -> Result<(), DatabaseError> {
    for due in db_due_notifications(db_path, now)? {
        let notification = &due.notification;

        // A commitment-bound trigger must prove it actually spends its
        // commitment before we notify the first time. Not provable yet
        // (or chain hiccup): ask again next cycle, without consuming an
        // attempt.
        if notification.attempt_count == 0 {
            if let Some(commitment_txid) = &due.commitment_txid {
                if !spends_commitment(chain, &due.txid, commitment_txid) {
                    log::warn!(
                        "Trigger '{}' doesn't prove spending its commitment '{}', \
                         delaying the first notification",
                        due.txid,
                        commitment_txid
                    );
                    continue;
                }
            }
        }

        let first_attempt_at = notification.first_attempt_at.unwrap_or(now);
        let elapsed = if notification.attempt_count == 0 {
            None
        } else {
            Some(now - first_attempt_at)
        };

        db_record_attempt(db_path, &notification.push_token, &notification.vault_id, now)?;

        let (title, body) = messages::compose(
            &notification.locale,
            notification.vault_number,
            &notification.wallet_name,
            elapsed,
        );
        let message = PushMessage {
            to: notification.push_token.clone(),
            title,
            body,
            data: serde_json::json!({
                "vaultId": notification.vault_id,
                "walletId": notification.wallet_id,
                "walletName": notification.wallet_name,
                "vaultNumber": notification.vault_number,
                "watchtowerId": notification.watchtower_id,
                "txid": due.txid.to_string(),
                "attemptCount": notification.attempt_count + 1,
                "firstDetectedAt": first_attempt_at,
                "networkId": network.to_string(),
            }),
        };

        match gateway.send(&message) {
            Ok(()) => log::debug!(
                "Notified '{}' about vault '{}' (attempt {})",
                notification.push_token,
                notification.vault_id,
                notification.attempt_count + 1
            ),
            // Not rolled back: the schedule will come around again
            Err(e) => log::warn!(
                "Error notifying '{}' about vault '{}': '{}'",
                notification.push_token,
                notification.vault_id,
                e
            ),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::{
            actions::{
                db_register_vault, db_update_trigger_status, setup_db, VaultRegistration,
            },
            interface::db_notification,
            schema::TriggerStatus,
        },
        testutil::{dummy_txid, temp_db_path, FakeChain, RecordingGateway},
    };

    use std::fs;

    fn register_with_commitment(
        db_path: &std::path::Path,
        vault_id: &str,
        txid: bitcoin::Txid,
        commitment: Option<bitcoin::Txid>,
    ) {
        db_register_vault(
            db_path,
            &VaultRegistration {
                vault_id: vault_id.to_string(),
                vault_number: 7,
                trigger_txids: vec![txid],
                commitment_txid: commitment,
                push_token: "ExponentPushToken[notify]".to_string(),
                wallet_id: "wallet-1".to_string(),
                wallet_name: "Savings".to_string(),
                watchtower_id: "wt-1".to_string(),
                locale: "es".to_string(),
            },
            0,
        )
        .unwrap();
    }

    #[test]
    fn payload_content() {
        let db_path = temp_db_path("notifier-payload");
        setup_db(&db_path).unwrap();
        let txid = dummy_txid(1);
        register_with_commitment(&db_path, "vault-1", txid, None);
        db_update_trigger_status(&db_path, &txid, TriggerStatus::Reversible).unwrap();

        let chain = FakeChain::default();
        let gateway = RecordingGateway::default();
        dispatch_due(&db_path, NetworkId::Tape, &chain, &gateway, 5_000).unwrap();

        let sent = gateway.sent();
        assert_eq!(sent.len(), 1);
        let message = &sent[0];
        assert_eq!(message.to, "ExponentPushToken[notify]");
        assert_eq!(message.title, "Bóveda #7 accedida");
        assert!(message.body.contains("ahora mismo"));
        assert_eq!(message.data["vaultId"], "vault-1");
        assert_eq!(message.data["walletId"], "wallet-1");
        assert_eq!(message.data["vaultNumber"], 7);
        assert_eq!(message.data["watchtowerId"], "wt-1");
        assert_eq!(message.data["txid"], txid.to_string());
        assert_eq!(message.data["attemptCount"], 1);
        assert_eq!(message.data["firstDetectedAt"], 5_000);
        assert_eq!(message.data["networkId"], "tape");

        fs::remove_file(&db_path).unwrap();
    }

    #[test]
    fn spend_proof_gates_first_attempt() {
        let db_path = temp_db_path("notifier-gate");
        setup_db(&db_path).unwrap();
        let txid = dummy_txid(2);
        let commitment = dummy_txid(3);
        register_with_commitment(&db_path, "vault-1", txid, Some(commitment));
        db_update_trigger_status(&db_path, &txid, TriggerStatus::Reversible).unwrap();

        let chain = FakeChain::default();
        let gateway = RecordingGateway::default();

        // The chain doesn't know the trigger yet: no delivery, and no
        // attempt consumed
        dispatch_due(&db_path, NetworkId::Regtest, &chain, &gateway, 1_000).unwrap();
        assert_eq!(gateway.sent_count(), 0);
        let notification = db_notification(&db_path, "ExponentPushToken[notify]", "vault-1")
            .unwrap()
            .unwrap();
        assert_eq!(notification.attempt_count, 0);

        // The trigger spends something else: still gated
        chain.set_details(txid, vec![dummy_txid(4)]);
        dispatch_due(&db_path, NetworkId::Regtest, &chain, &gateway, 1_100).unwrap();
        assert_eq!(gateway.sent_count(), 0);

        // The trigger provably spends its commitment: delivered
        chain.set_details(txid, vec![dummy_txid(4), commitment]);
        dispatch_due(&db_path, NetworkId::Regtest, &chain, &gateway, 1_200).unwrap();
        assert_eq!(gateway.sent_count(), 1);
        let notification = db_notification(&db_path, "ExponentPushToken[notify]", "vault-1")
            .unwrap()
            .unwrap();
        assert_eq!(notification.attempt_count, 1);
        assert_eq!(notification.first_attempt_at, Some(1_200));

        // The proof is only required once: later attempts skip it
        dispatch_due(&db_path, NetworkId::Regtest, &chain, &gateway, 1_200 + 21_600).unwrap();
        assert_eq!(gateway.sent_count(), 2);

        fs::remove_file(&db_path).unwrap();
    }

    #[test]
    fn elapsed_time_in_later_attempts() {
        let db_path = temp_db_path("notifier-elapsed");
        setup_db(&db_path).unwrap();
        let txid = dummy_txid(5);
        register_with_commitment(&db_path, "vault-1", txid, None);
        db_update_trigger_status(&db_path, &txid, TriggerStatus::Irreversible).unwrap();

        let chain = FakeChain::default();
        let gateway = RecordingGateway::default();

        dispatch_due(&db_path, NetworkId::Regtest, &chain, &gateway, 1_000).unwrap();
        dispatch_due(&db_path, NetworkId::Regtest, &chain, &gateway, 1_000 + 21_600).unwrap();

        let sent = gateway.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].body.contains("ahora mismo"));
        assert!(sent[1].body.contains("hace 6 horas"));
        assert_eq!(sent[1].data["attemptCount"], 2);
        // firstDetectedAt doesn't move with later attempts
        assert_eq!(sent[1].data["firstDetectedAt"], 1_000);

        fs::remove_file(&db_path).unwrap();
    }
}
