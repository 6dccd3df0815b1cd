//! Real-time event fan-out.
//!
//! One-way emission of round/participant/winner events to all connected
//! observers, plus per-user notices on the same bus. The transport that
//! carries these to browsers lives outside the core; here they are a
//! `tokio::sync::broadcast` channel that never blocks the engine — slow
//! observers lag and drop, the engine does not wait.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{Participant, PotItem, TradeStatus};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything observers can learn about the engine, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoundEvent {
    /// A new round is open. Only the commitment hash is published; the seed
    /// stays secret until the round is terminal.
    RoundCreated {
        round_id: i64,
        server_seed_hash: String,
    },
    /// First participant joined; the countdown is running.
    CountdownStarted {
        round_id: i64,
        end_time: DateTime<Utc>,
    },
    /// A deposit was confirmed and committed into the pot.
    DepositConfirmed {
        round_id: i64,
        participant: Participant,
        items: Vec<PotItem>,
        total_value: Decimal,
        total_tickets: u64,
    },
    /// The countdown expired; no further deposits. Selection in progress.
    RoundRolling { round_id: i64 },
    /// The draw is done. Seeds are now public for verification.
    WinnerSelected {
        round_id: i64,
        user_id: String,
        winning_ticket: u64,
        total_tickets: u64,
        server_seed: String,
        client_seed: String,
        provable_hash: String,
        pot_value: Decimal,
        tax_value: Decimal,
    },
    /// The round reached a terminal state.
    RoundClosed {
        round_id: i64,
        errored: bool,
    },
    /// A payout settlement attempt changed status.
    PayoutUpdate {
        round_id: i64,
        user_id: String,
        status: TradeStatus,
    },
    /// One-way per-user notification channel.
    UserNotice { user_id: String, message: String },
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Broadcast bus for engine events. Cheap to clone; every subscriber gets
/// every event from the moment it subscribes.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RoundEvent>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        EventBus { tx }
    }

    /// Emit an event to all observers. Emission never fails: with no
    /// subscribers the event is simply dropped.
    pub fn emit(&self, event: RoundEvent) {
        debug!(event = ?event, "emit");
        let _ = self.tx.send(event);
    }

    /// Emit a batch in order (the shape state transitions return).
    pub fn emit_all(&self, events: Vec<RoundEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Send a notice addressed to a single user.
    pub fn notify_user(&self, user_id: &str, message: impl Into<String>) {
        self.emit(RoundEvent::UserNotice {
            user_id: user_id.to_string(),
            message: message.into(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
