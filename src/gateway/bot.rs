//! HTTP client for the trade-bot settlement service.
//!
//! The bot service owns the operator's inventory sessions and talks to the
//! actual trading network; this client only stages offers, dispatches them,
//! and polls the status event stream.
//!
//! Auth: `Authorization: Bearer {key}` on every request.
//! All endpoints are JSON under `{base_url}/v1/`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::{GatewayEvent, OfferDirection, OfferHandle, OfferStatus, SettlementGateway};
use crate::types::UserProfile;

const GATEWAY_NAME: &str = "trade-bot";

/// Request timeout. The gateway is a localhost sidecar; anything slower
/// than this is treated as unavailable.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// API response types (bot JSON → Rust)
// ---------------------------------------------------------------------------

/// Response from `POST /v1/offers` (stage an offer).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageOfferResponse {
    handle_id: String,
}

/// Response from `POST /v1/offers/{handle}/send`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendOfferResponse {
    status: String,
    offer_id: String,
}

/// Response from `GET /v1/offers/{id}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferStatusResponse {
    status: String,
}

/// One row from `GET /v1/events`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BotEvent {
    seq: u64,
    offer_id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsResponse {
    #[serde(default)]
    events: Vec<BotEvent>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct BotGateway {
    client: Client,
    base_url: String,
    api_key: Secret<String>,
    /// Updated on every request outcome; consulted by `is_connected`.
    connected: AtomicBool,
    /// Event-stream cursor: the last `seq` consumed.
    cursor: AtomicU64,
}

impl BotGateway {
    pub fn new(base_url: impl Into<String>, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client for trade-bot gateway")?;

        Ok(BotGateway {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: Secret::new(api_key),
            connected: AtomicBool::new(false),
            cursor: AtomicU64::new(0),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    fn note_outcome<T>(&self, result: Result<T>) -> Result<T> {
        self.connected.store(result.is_ok(), Ordering::Relaxed);
        result
    }

    /// Poll the status event stream past the internal cursor. Returns the
    /// transitions in `seq` order; the cursor only advances on success.
    pub async fn poll_events(&self) -> Result<Vec<GatewayEvent>> {
        let after = self.cursor.load(Ordering::Relaxed);
        let url = format!("{}?after={}", self.url("events"), after);

        let result = async {
            let response = self
                .client
                .get(&url)
                .bearer_auth(self.api_key.expose_secret())
                .send()
                .await
                .context("Trade-bot events request failed")?;
            let body: EventsResponse = response
                .error_for_status()
                .context("Trade-bot events request rejected")?
                .json()
                .await
                .context("Failed to parse trade-bot events")?;
            Ok(body)
        }
        .await;
        let body = self.note_outcome(result)?;

        let mut events = Vec::with_capacity(body.events.len());
        for row in body.events {
            self.cursor.fetch_max(row.seq, Ordering::Relaxed);
            match row.status.parse::<OfferStatus>() {
                Ok(status) => events.push(GatewayEvent {
                    offer_id: row.offer_id,
                    status,
                }),
                Err(e) => {
                    // Skip rather than wedge the stream on one bad row.
                    warn!(seq = row.seq, error = %e, "Unknown status in event stream");
                }
            }
        }

        debug!(count = events.len(), cursor = after, "Polled gateway events");
        Ok(events)
    }
}

#[async_trait]
impl SettlementGateway for BotGateway {
    async fn propose(
        &self,
        user: &UserProfile,
        asset_ids: &[String],
        direction: OfferDirection,
    ) -> Result<OfferHandle> {
        let body = serde_json::json!({
            "partnerId": user.id,
            "tradeUrl": user.trade_url,
            "assetIds": asset_ids,
            "direction": direction.to_string(),
        });

        let result = async {
            let response = self
                .client
                .post(self.url("offers"))
                .bearer_auth(self.api_key.expose_secret())
                .json(&body)
                .send()
                .await
                .context("Trade-bot propose request failed")?;
            let staged: StageOfferResponse = response
                .error_for_status()
                .context("Trade-bot rejected offer proposal")?
                .json()
                .await
                .context("Failed to parse propose response")?;
            Ok(staged)
        }
        .await;
        let staged = self.note_outcome(result)?;

        debug!(
            user_id = %user.id,
            items = asset_ids.len(),
            %direction,
            handle = %staged.handle_id,
            "Offer staged"
        );
        Ok(OfferHandle {
            id: staged.handle_id,
        })
    }

    async fn send(&self, handle: &OfferHandle) -> Result<(OfferStatus, String)> {
        let path = format!("offers/{}/send", urlencoding::encode(&handle.id));

        let result = async {
            let response = self
                .client
                .post(self.url(&path))
                .bearer_auth(self.api_key.expose_secret())
                .send()
                .await
                .context("Trade-bot send request failed")?;
            let sent: SendOfferResponse = response
                .error_for_status()
                .context("Trade-bot refused to send offer")?
                .json()
                .await
                .context("Failed to parse send response")?;
            Ok(sent)
        }
        .await;
        let sent = self.note_outcome(result)?;

        let status: OfferStatus = sent
            .status
            .parse()
            .with_context(|| format!("Trade-bot returned unknown status: {}", sent.status))?;
        Ok((status, sent.offer_id))
    }

    async fn status(&self, external_id: &str) -> Result<Option<OfferStatus>> {
        let path = format!("offers/{}", urlencoding::encode(external_id));

        let result = async {
            let response = self
                .client
                .get(self.url(&path))
                .bearer_auth(self.api_key.expose_secret())
                .send()
                .await
                .context("Trade-bot status request failed")?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }

            let body: OfferStatusResponse = response
                .error_for_status()
                .context("Trade-bot status request rejected")?
                .json()
                .await
                .context("Failed to parse status response")?;
            Ok(Some(body))
        }
        .await;
        let body = self.note_outcome(result)?;

        match body {
            Some(b) => Ok(Some(b.status.parse()?)),
            None => Ok(None),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn name(&self) -> &str {
        GATEWAY_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
