//! Shared types for the POTLINE engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that fairness, engine, gateway,
//! and storage modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Round
// ---------------------------------------------------------------------------

/// One timed instance of the pooled-wager game.
///
/// Created when no active round exists, mutated only by the deposit
/// confirmation handler and the completion routine, immutable once
/// `Completed` or `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    /// Monotonic sequence number, assigned by the store.
    pub id: i64,
    pub status: RoundStatus,
    pub created_at: DateTime<Utc>,
    /// Set when the first participant joins (the countdown anchor).
    pub start_time: Option<DateTime<Utc>>,
    /// Countdown deadline. Persisted so a restart resumes the same clock.
    pub end_time: Option<DateTime<Utc>>,
    /// Contributed items in deposit order.
    pub items: Vec<PotItem>,
    /// One entry per distinct user, in first-deposit order. The ordering is
    /// part of the public draw protocol.
    pub participants: Vec<Participant>,
    /// Sum of non-withheld item values.
    pub total_value: Decimal,
    pub total_tickets: u64,
    pub winner: Option<String>,
    pub winning_ticket: Option<u64>,
    /// Secret until the round is terminal.
    pub server_seed: String,
    /// Published at creation, before any deposit is accepted.
    pub server_seed_hash: String,
    /// Generated server-side at the draw point.
    pub client_seed: Option<String>,
    /// SHA-256 of server seed ‖ client seed.
    pub provable_hash: Option<String>,
    pub tax_value: Decimal,
    /// Asset ids withheld as tax, removed from the payout.
    pub tax_asset_ids: Vec<String>,
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Round #{} [{}] pot=${:.2} items={} participants={} tickets={}",
            self.id,
            self.status,
            self.total_value,
            self.items.len(),
            self.participants.len(),
            self.total_tickets,
        )
    }
}

impl Round {
    /// Whether deposits may still be confirmed into this round.
    pub fn accepts_deposits(&self) -> bool {
        self.status == RoundStatus::Active
    }

    /// Whether the round has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RoundStatus::Completed | RoundStatus::Error)
    }

    /// The participant entry for a user, if they have deposited.
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    /// Items delivered to the winner: everything not withheld as tax.
    pub fn payout_items(&self) -> Vec<PotItem> {
        self.items
            .iter()
            .filter(|i| !self.tax_asset_ids.contains(&i.asset_id))
            .cloned()
            .collect()
    }

    /// Public view of the round. The server seed is revealed only once the
    /// round is terminal; before that observers get the hash alone.
    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            id: self.id,
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            items: self.items.clone(),
            participants: self.participants.clone(),
            total_value: self.total_value,
            total_tickets: self.total_tickets,
            winner: self.winner.clone(),
            winning_ticket: self.winning_ticket,
            server_seed: if self.is_terminal() {
                Some(self.server_seed.clone())
            } else {
                None
            },
            server_seed_hash: self.server_seed_hash.clone(),
            client_seed: if self.is_terminal() {
                self.client_seed.clone()
            } else {
                None
            },
            provable_hash: if self.is_terminal() {
                self.provable_hash.clone()
            } else {
                None
            },
            tax_value: self.tax_value,
        }
    }

    /// Helper to build a fresh test round with a fixed commitment pair.
    #[cfg(test)]
    pub fn sample(id: i64) -> Self {
        Round {
            id,
            status: RoundStatus::Active,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            items: Vec::new(),
            participants: Vec::new(),
            total_value: Decimal::ZERO,
            total_tickets: 0,
            winner: None,
            winning_ticket: None,
            server_seed: "a".repeat(64),
            server_seed_hash: "b".repeat(64),
            client_seed: None,
            provable_hash: None,
            tax_value: Decimal::ZERO,
            tax_asset_ids: Vec::new(),
        }
    }
}

/// Externally visible round state. Seeds are withheld until reveal time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub id: i64,
    pub status: RoundStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub items: Vec<PotItem>,
    pub participants: Vec<Participant>,
    pub total_value: Decimal,
    pub total_tickets: u64,
    pub winner: Option<String>,
    pub winning_ticket: Option<u64>,
    pub server_seed: Option<String>,
    pub server_seed_hash: String,
    pub client_seed: Option<String>,
    pub provable_hash: Option<String>,
    pub tax_value: Decimal,
}

/// Round lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundStatus {
    Pending,
    Active,
    Rolling,
    Completed,
    Error,
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundStatus::Pending => write!(f, "pending"),
            RoundStatus::Active => write!(f, "active"),
            RoundStatus::Rolling => write!(f, "rolling"),
            RoundStatus::Completed => write!(f, "completed"),
            RoundStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for RoundStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RoundStatus::Pending),
            "active" => Ok(RoundStatus::Active),
            "rolling" => Ok(RoundStatus::Rolling),
            "completed" => Ok(RoundStatus::Completed),
            "error" => Ok(RoundStatus::Error),
            _ => Err(anyhow::anyhow!("Unknown round status: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Participant & items
// ---------------------------------------------------------------------------

/// A user's aggregate stake in one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub name: String,
    pub avatar: String,
    /// Settlement destination, snapshotted from the profile at first deposit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_url: Option<String>,
    /// Cumulative contributed value across all confirmed deposits.
    pub value: Decimal,
    /// Derived from cumulative value; recomputed upward, never decremented.
    pub tickets: u64,
}

impl Participant {
    /// The profile shape the settlement gateway works with.
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.user_id.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            trade_url: self.trade_url.clone(),
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (${:.2}, {} tickets)",
            self.name, self.value, self.tickets,
        )
    }
}

/// A single contributed item. The price is snapshotted at deposit time and
/// never re-priced retroactively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PotItem {
    pub asset_id: String,
    pub name: String,
    pub image_url: String,
    pub price: Decimal,
    pub user_id: String,
    pub round_id: i64,
}

impl fmt::Display for PotItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (${:.2}) [{}]", self.name, self.price, self.asset_id)
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Minimal profile the engine needs: identity handling itself lives outside
/// the core, but deposits and payouts need display fields and the trade
/// destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub avatar: String,
    /// Settlement destination. Payouts are skipped (with a recorded reason)
    /// when absent.
    pub trade_url: Option<String>,
}

impl UserProfile {
    #[cfg(test)]
    pub fn sample(id: &str) -> Self {
        UserProfile {
            id: id.to_string(),
            name: format!("user-{id}"),
            avatar: String::new(),
            trade_url: Some(format!("https://trade.example.com/{id}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Pending deposits
// ---------------------------------------------------------------------------

/// Ephemeral record bridging "user agreed to contribute" and "gateway
/// confirmed the transfer". Keyed by a locally generated id, swept by the
/// periodic reconciliation pass once `expires_at` has passed. Never persisted
/// beyond process lifetime.
#[derive(Debug, Clone)]
pub struct PendingDeposit {
    pub id: Uuid,
    /// Full profile so the confirmation handler can build the participant
    /// entry without a directory lookup.
    pub user: UserProfile,
    pub round_id: i64,
    /// Proposed items with prices snapshotted at proposal time.
    pub items: Vec<PotItem>,
    pub total_value: Decimal,
    /// External settlement reference, set once the gateway accepts the
    /// proposal.
    pub offer_id: Option<String>,
    /// The audit-trail row tracking this attempt.
    pub trade_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Matches the gateway's own cancellation window.
    pub expires_at: DateTime<Utc>,
}

impl PendingDeposit {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Trade records
// ---------------------------------------------------------------------------

/// Direction of an external settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeKind {
    Deposit,
    Payout,
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeKind::Deposit => write!(f, "deposit"),
            TradeKind::Payout => write!(f, "payout"),
        }
    }
}

impl std::str::FromStr for TradeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TradeKind::Deposit),
            "payout" => Ok(TradeKind::Payout),
            _ => Err(anyhow::anyhow!("Unknown trade kind: {s}")),
        }
    }
}

/// Lifecycle status of a settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    /// Recorded locally, not yet handed to the gateway.
    Queued,
    /// Accepted by the gateway, awaiting the counterparty.
    Sent,
    Accepted,
    Declined,
    Expired,
    Canceled,
    /// Held by the gateway pending manual confirmation — a soft success
    /// requiring user follow-up.
    Escrow,
    Failed,
    /// Deliberately not sent; the reason is recorded on the trade.
    Skipped,
    /// Items moved but the round-side commit was rejected. Requires manual
    /// reconciliation.
    NeedsReview,
}

impl TradeStatus {
    /// Whether the gateway can still change this status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TradeStatus::Queued | TradeStatus::Sent)
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeStatus::Queued => "queued",
            TradeStatus::Sent => "sent",
            TradeStatus::Accepted => "accepted",
            TradeStatus::Declined => "declined",
            TradeStatus::Expired => "expired",
            TradeStatus::Canceled => "canceled",
            TradeStatus::Escrow => "escrow",
            TradeStatus::Failed => "failed",
            TradeStatus::Skipped => "skipped",
            TradeStatus::NeedsReview => "needs_review",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TradeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TradeStatus::Queued),
            "sent" => Ok(TradeStatus::Sent),
            "accepted" => Ok(TradeStatus::Accepted),
            "declined" => Ok(TradeStatus::Declined),
            "expired" => Ok(TradeStatus::Expired),
            "canceled" => Ok(TradeStatus::Canceled),
            "escrow" => Ok(TradeStatus::Escrow),
            "failed" => Ok(TradeStatus::Failed),
            "skipped" => Ok(TradeStatus::Skipped),
            "needs_review" => Ok(TradeStatus::NeedsReview),
            _ => Err(anyhow::anyhow!("Unknown trade status: {s}")),
        }
    }
}

/// Durable audit row for every external settlement attempt, independent of
/// the ephemeral pending-deposit bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub round_id: i64,
    pub user_id: String,
    pub kind: TradeKind,
    pub asset_ids: Vec<String>,
    pub value: Decimal,
    pub status: TradeStatus,
    pub offer_id: Option<String>,
    /// Recorded skip/failure reason, if any.
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeRecord {
    /// New record in `Queued` state, to be persisted before the gateway call.
    pub fn new(
        round_id: i64,
        user_id: &str,
        kind: TradeKind,
        asset_ids: Vec<String>,
        value: Decimal,
    ) -> Self {
        let now = Utc::now();
        TradeRecord {
            id: Uuid::new_v4(),
            round_id,
            user_id: user_id.to_string(),
            kind,
            asset_ids,
            value,
            status: TradeStatus::Queued,
            offer_id: None,
            note: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl fmt::Display for TradeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} trade {} round #{} user {} ${:.2} [{}]",
            self.kind, self.id, self.round_id, self.user_id, self.value, self.status,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for the round engine.
///
/// Validation and precondition failures carry messages safe to show to end
/// users. Storage and integrity failures are logged in full and surfaced
/// through `user_message` as a generic error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Round is closed for deposits")]
    RoundClosed,

    #[error("No active round")]
    NoActiveRound,

    #[error("Round limit reached: {0}")]
    LimitReached(String),

    #[error("A deposit offer is already pending for this user")]
    AlreadyPending,

    #[error("Invalid deposit: {0}")]
    InvalidDeposit(String),

    #[error("Trade service unavailable")]
    GatewayUnavailable,

    #[error("Trade service error: {0}")]
    Gateway(String),

    #[error("No trade destination configured")]
    NoTradeDestination,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Data integrity error: {0}")]
    Integrity(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// The message shown to end users. Internal detail stays in the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            EngineError::RoundClosed => "This round is closed. Try the next one.",
            EngineError::NoActiveRound => "No round is open right now.",
            EngineError::LimitReached(_) => "The round limit has been reached.",
            EngineError::AlreadyPending => "You already have a pending deposit offer.",
            EngineError::InvalidDeposit(_) => "That deposit could not be accepted.",
            EngineError::GatewayUnavailable | EngineError::Gateway(_) => {
                "The trade service is unavailable. Try again shortly."
            }
            EngineError::NoTradeDestination => {
                "Set your trade URL before depositing or receiving winnings."
            }
            EngineError::Storage(_) | EngineError::Integrity(_) | EngineError::Config(_) => {
                "Something went wrong. Please try again."
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
