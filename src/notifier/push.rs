//! Delivery of push notifications through Expo.

use std::time::Duration;

use serde::Serialize;

/// The Expo push service endpoint.
pub const EXPO_PUSH_URL: &str = "https://exp.host/--/api/v2/push/send";

const PUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum PushError {
    /// We could not reach the push service
    Transport(reqwest::Error),
    /// The push service answered with a non-2xx status
    Status(u16),
    /// The push service accepted the request but rejected the message
    Rejected(String),
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PushError::Transport(e) => write!(f, "Push service error: {}", e),
            PushError::Status(code) => write!(f, "Push service error: HTTP status {}", code),
            PushError::Rejected(e) => write!(f, "Push service rejected the message: {}", e),
        }
    }
}

impl std::error::Error for PushError {}

/// One notification, ready for delivery.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

/// Seam between the scheduler and the actual delivery channel. The tests
/// plug a recording fake here.
pub trait PushGateway {
    fn send(&self, message: &PushMessage) -> Result<(), PushError>;
}

pub struct ExpoPushGateway {
    client: reqwest::blocking::Client,
    url: String,
}

impl ExpoPushGateway {
    pub fn new() -> Result<ExpoPushGateway, PushError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .map_err(PushError::Transport)?;

        Ok(ExpoPushGateway {
            client,
            url: EXPO_PUSH_URL.to_string(),
        })
    }
}

impl PushGateway for ExpoPushGateway {
    fn send(&self, message: &PushMessage) -> Result<(), PushError> {
        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .map_err(PushError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Status(status.as_u16()));
        }

        // A 200 can still carry a per-message error, eg for an expired
        // push token.
        let body: serde_json::Value = response.json().map_err(PushError::Transport)?;
        if body["data"]["status"] == "error" {
            let details = body["data"]["message"]
                .as_str()
                .unwrap_or("no details")
                .to_string();
            return Err(PushError::Rejected(details));
        }

        Ok(())
    }
}
