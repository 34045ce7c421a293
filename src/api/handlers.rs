use crate::{
    api::ApiState,
    commitment::{check_authorization, check_binding, CommitmentError},
    config::NetworkId,
    database::{
        actions::{db_acknowledge, db_register_vault, VaultRegistration},
        interface::{db_active_notifications, db_trigger},
        schema::TriggerStatus,
    },
    unix_now,
};

use std::{str::FromStr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

type ApiResponse = (StatusCode, Json<Value>);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    push_token: String,
    wallet_id: String,
    wallet_name: String,
    watchtower_id: String,
    #[serde(default)]
    locale: Option<String>,
    vaults: Vec<RegisterVault>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterVault {
    vault_id: String,
    vault_number: u32,
    trigger_tx_ids: Vec<String>,
    #[serde(default)]
    commitment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckRequest {
    push_token: String,
    vault_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationsRequest {
    push_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationView {
    vault_id: String,
    wallet_id: String,
    wallet_name: String,
    vault_number: u32,
    watchtower_id: String,
    txid: String,
    attempt_count: u32,
    first_detected_at: Option<i64>,
    last_attempt_at: Option<i64>,
    network_id: String,
}

fn error_response(status: StatusCode, error: &str, message: String) -> ApiResponse {
    (status, Json(json!({ "error": error, "message": message })))
}

fn bad_request(message: String) -> ApiResponse {
    error_response(StatusCode::BAD_REQUEST, "validation", message)
}

fn internal_error(message: String) -> ApiResponse {
    log::error!("Internal error handling a request: {}", message);
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "internal error".to_string(),
    )
}

fn commitment_error_response(e: CommitmentError) -> ApiResponse {
    match e {
        CommitmentError::Decode(_) => bad_request(e.to_string()),
        CommitmentError::Reused(_) => {
            error_response(StatusCode::FORBIDDEN, "commitment_reused", e.to_string())
        }
        CommitmentError::Unauthorized(_) => {
            error_response(StatusCode::FORBIDDEN, "unauthorized", e.to_string())
        }
        CommitmentError::AuthorizationUnavailable(_) => error_response(
            StatusCode::FORBIDDEN,
            "authorization_unavailable",
            e.to_string(),
        ),
        CommitmentError::Database(e) => internal_error(e.to_string()),
    }
}

// The network segment of the path, checked against the set of networks
// this instance actually monitors.
fn resolve_network(state: &ApiState, network: &str) -> Result<NetworkId, ApiResponse> {
    let network = NetworkId::from_str(network)
        .map_err(|_| bad_request(format!("unknown network '{}'", network)))?;
    if !state.config.is_enabled(network) {
        return Err(bad_request(format!("network '{}' is not enabled", network)));
    }

    Ok(network)
}

fn parse_body<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ApiResponse> {
    serde_json::from_value(body).map_err(|e| bad_request(format!("invalid request body: {}", e)))
}

pub async fn liveness() -> StatusCode {
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------- register

fn register_blocking(
    state: Arc<ApiState>,
    network: NetworkId,
    request: RegisterRequest,
) -> ApiResponse {
    if request.push_token.is_empty() {
        return bad_request("empty pushToken".to_string());
    }
    if request.vaults.is_empty() {
        return bad_request("no vaults to register".to_string());
    }

    let db_path = state.config.db_file(network);
    let locale = request.locale.as_deref().unwrap_or("en");
    let now = unix_now();

    for vault in &request.vaults {
        if vault.vault_id.is_empty() {
            return bad_request("empty vaultId".to_string());
        }
        let mut trigger_txids = Vec::with_capacity(vault.trigger_tx_ids.len());
        for txid in &vault.trigger_tx_ids {
            match Txid::from_str(txid) {
                Ok(txid) => trigger_txids.push(txid),
                Err(e) => return bad_request(format!("invalid trigger txid '{}': {}", txid, e)),
            }
        }
        if trigger_txids.is_empty() {
            return bad_request(format!("no trigger txids for vault '{}'", vault.vault_id));
        }

        let commitment_txid = match &vault.commitment {
            Some(hex) => {
                let checked = if state.config.with_commitments {
                    check_authorization(
                        &db_path,
                        &state.config.addresses_db_file(network),
                        network,
                        &vault.vault_id,
                        hex,
                    )
                } else {
                    check_binding(&db_path, &vault.vault_id, hex)
                };
                match checked {
                    Ok(txid) => Some(txid),
                    Err(e) => return commitment_error_response(e),
                }
            }
            None => None,
        };

        // Re-registering a vault whose access already went irreversible
        // can't rewind anything, but it is allowed.
        for txid in &trigger_txids {
            match db_trigger(&db_path, txid) {
                Ok(Some(trigger)) if trigger.status == TriggerStatus::Irreversible => {
                    log::warn!(
                        "Re-registration of trigger '{}' (vault '{}') which is already irreversible",
                        txid,
                        trigger.vault_id
                    );
                }
                Ok(_) => {}
                Err(e) => return internal_error(e.to_string()),
            }
        }

        let registration = VaultRegistration {
            vault_id: vault.vault_id.clone(),
            vault_number: vault.vault_number,
            trigger_txids,
            commitment_txid,
            push_token: request.push_token.clone(),
            wallet_id: request.wallet_id.clone(),
            wallet_name: request.wallet_name.clone(),
            watchtower_id: request.watchtower_id.clone(),
            locale: locale.to_string(),
        };
        if let Err(e) = db_register_vault(&db_path, &registration, now) {
            return internal_error(e.to_string());
        }
        log::info!(
            "Registered vault '{}' ({} triggers) for '{}' on '{}'",
            vault.vault_id,
            registration.trigger_txids.len(),
            request.push_token,
            network
        );
    }

    (StatusCode::OK, Json(json!({})))
}

async fn handle_register(state: Arc<ApiState>, network: NetworkId, body: Value) -> ApiResponse {
    let request = match parse_body::<RegisterRequest>(body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    tokio::task::spawn_blocking(move || register_blocking(state, network, request))
        .await
        .unwrap_or_else(|e| internal_error(format!("registration task died: {}", e)))
}

pub async fn register_default(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> ApiResponse {
    match resolve_network(&state, "bitcoin") {
        Ok(network) => handle_register(state, network, body).await,
        Err(response) => response,
    }
}

pub async fn register(
    State(state): State<Arc<ApiState>>,
    Path(network): Path<String>,
    Json(body): Json<Value>,
) -> ApiResponse {
    match resolve_network(&state, &network) {
        Ok(network) => handle_register(state, network, body).await,
        Err(response) => response,
    }
}

// --------------------------------------------------------------------- ack

async fn handle_ack(state: Arc<ApiState>, network: NetworkId, body: Value) -> ApiResponse {
    let request = match parse_body::<AckRequest>(body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let db_path = state.config.db_file(network);
    tokio::task::spawn_blocking(move || {
        match db_acknowledge(&db_path, &request.push_token, &request.vault_id) {
            Ok(true) => {
                log::info!(
                    "Acknowledged vault '{}' for '{}'",
                    request.vault_id,
                    request.push_token
                );
                (StatusCode::OK, Json(json!({})))
            }
            Ok(false) => error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                "no such registration".to_string(),
            ),
            Err(e) => internal_error(e.to_string()),
        }
    })
    .await
    .unwrap_or_else(|e| internal_error(format!("ack task died: {}", e)))
}

pub async fn ack_default(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> ApiResponse {
    match resolve_network(&state, "bitcoin") {
        Ok(network) => handle_ack(state, network, body).await,
        Err(response) => response,
    }
}

pub async fn ack(
    State(state): State<Arc<ApiState>>,
    Path(network): Path<String>,
    Json(body): Json<Value>,
) -> ApiResponse {
    match resolve_network(&state, &network) {
        Ok(network) => handle_ack(state, network, body).await,
        Err(response) => response,
    }
}

// ----------------------------------------------------------- notifications

async fn handle_notifications(state: Arc<ApiState>, network: NetworkId, body: Value) -> ApiResponse {
    let request = match parse_body::<NotificationsRequest>(body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let db_path = state.config.db_file(network);
    tokio::task::spawn_blocking(move || {
        match db_active_notifications(&db_path, &request.push_token) {
            Ok(entries) => {
                let notifications: Vec<NotificationView> = entries
                    .into_iter()
                    .map(|entry| NotificationView {
                        vault_id: entry.notification.vault_id,
                        wallet_id: entry.notification.wallet_id,
                        wallet_name: entry.notification.wallet_name,
                        vault_number: entry.notification.vault_number,
                        watchtower_id: entry.notification.watchtower_id,
                        txid: entry.txid.to_string(),
                        attempt_count: entry.notification.attempt_count,
                        first_detected_at: entry.notification.first_attempt_at,
                        last_attempt_at: entry.notification.last_attempt_at,
                        network_id: network.to_string(),
                    })
                    .collect();
                (
                    StatusCode::OK,
                    Json(json!({ "notifications": notifications })),
                )
            }
            Err(e) => internal_error(e.to_string()),
        }
    })
    .await
    .unwrap_or_else(|e| internal_error(format!("notifications task died: {}", e)))
}

pub async fn notifications_default(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> ApiResponse {
    match resolve_network(&state, "bitcoin") {
        Ok(network) => handle_notifications(state, network, body).await,
        Err(response) => response,
    }
}

pub async fn notifications(
    State(state): State<Arc<ApiState>>,
    Path(network): Path<String>,
    Json(body): Json<Value>,
) -> ApiResponse {
    match resolve_network(&state, &network) {
        Ok(network) => handle_notifications(state, network, body).await,
        Err(response) => response,
    }
}
