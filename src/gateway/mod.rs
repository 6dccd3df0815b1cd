//! Trade settlement gateway.
//!
//! Defines the `SettlementGateway` trait — the seam to the external system
//! that physically moves items between user and operator custody — and the
//! offer status model its event stream reports. The gateway is eventually
//! consistent: `propose`/`send` return quickly, terminal outcomes arrive
//! later as `(external id, status)` events with arbitrary delay.

pub mod bot;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{TradeStatus, UserProfile};

// ---------------------------------------------------------------------------
// Offer model
// ---------------------------------------------------------------------------

/// Which way the items move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferDirection {
    /// User → operator custody (a deposit).
    Incoming,
    /// Operator → user custody (a payout).
    Outgoing,
}

impl fmt::Display for OfferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfferDirection::Incoming => write!(f, "incoming"),
            OfferDirection::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// Gateway-reported offer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    /// Delivered to the counterparty, awaiting action.
    Sent,
    Accepted,
    Declined,
    Expired,
    Canceled,
    /// Held by the gateway pending manual confirmation on the user's side.
    Escrow,
    /// The gateway could not complete the transfer.
    Failed,
}

impl OfferStatus {
    /// Whether the gateway will report further transitions for this offer.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OfferStatus::Sent)
    }

    /// The audit-trail status a gateway outcome maps to.
    pub fn as_trade_status(&self) -> TradeStatus {
        match self {
            OfferStatus::Sent => TradeStatus::Sent,
            OfferStatus::Accepted => TradeStatus::Accepted,
            OfferStatus::Declined => TradeStatus::Declined,
            OfferStatus::Expired => TradeStatus::Expired,
            OfferStatus::Canceled => TradeStatus::Canceled,
            OfferStatus::Escrow => TradeStatus::Escrow,
            OfferStatus::Failed => TradeStatus::Failed,
        }
    }
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OfferStatus::Sent => "sent",
            OfferStatus::Accepted => "accepted",
            OfferStatus::Declined => "declined",
            OfferStatus::Expired => "expired",
            OfferStatus::Canceled => "canceled",
            OfferStatus::Escrow => "escrow",
            OfferStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OfferStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(OfferStatus::Sent),
            "accepted" => Ok(OfferStatus::Accepted),
            "declined" => Ok(OfferStatus::Declined),
            "expired" => Ok(OfferStatus::Expired),
            "canceled" => Ok(OfferStatus::Canceled),
            "escrow" => Ok(OfferStatus::Escrow),
            "failed" => Ok(OfferStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown offer status: {s}")),
        }
    }
}

/// Opaque reference to a proposed-but-not-yet-sent offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferHandle {
    pub id: String,
}

/// One entry from the gateway's status event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// The external settlement reference (`external_id` from `send`).
    pub offer_id: String,
    pub status: OfferStatus,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the external trade-offer service.
///
/// Implementors stage an offer (`propose`), dispatch it (`send`, which
/// yields the external id the event stream refers to), and answer direct
/// status queries (`status`) for reconciliation after local/gateway
/// divergence.
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    /// Stage a transfer of `asset_ids` to/from `user`.
    async fn propose(
        &self,
        user: &UserProfile,
        asset_ids: &[String],
        direction: OfferDirection,
    ) -> Result<OfferHandle>;

    /// Dispatch a staged offer. Returns the initial status and the external
    /// settlement reference subsequent events carry.
    async fn send(&self, handle: &OfferHandle) -> Result<(OfferStatus, String)>;

    /// Direct status query. `None` means the gateway no longer knows the
    /// offer.
    async fn status(&self, external_id: &str) -> Result<Option<OfferStatus>>;

    /// Last-known connectivity. Used for fail-fast no-op decisions; the
    /// authoritative answer is still the next call's outcome.
    fn is_connected(&self) -> bool;

    /// Gateway name for logging and identification.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
