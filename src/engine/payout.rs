//! Payout coordinator.
//!
//! Invoked once per completed round with the winner's post-tax item list.
//! The trade record is persisted *before* the gateway request goes out, so
//! a crash mid-request still leaves an auditable "attempted" row. Terminal
//! outcomes arrive later on the gateway event stream and update that row.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{EventBus, RoundEvent};
use crate::gateway::{GatewayEvent, OfferDirection, OfferStatus, SettlementGateway};
use crate::storage::Store;
use crate::types::{Round, TradeKind, TradeRecord, TradeStatus, UserProfile};

/// An offer in flight: external id → the trade row and addressee it belongs
/// to. The dispatcher consults this to route gateway events.
#[derive(Debug, Clone)]
struct OutstandingPayout {
    trade_id: Uuid,
    round_id: i64,
    user_id: String,
}

pub struct PayoutCoordinator {
    gateway: Arc<dyn SettlementGateway>,
    store: Store,
    events: EventBus,
    outstanding: Mutex<HashMap<String, OutstandingPayout>>,
}

impl PayoutCoordinator {
    pub fn new(gateway: Arc<dyn SettlementGateway>, store: Store, events: EventBus) -> Self {
        PayoutCoordinator {
            gateway,
            store,
            events,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver a completed round's winnings.
    ///
    /// No-ops with a recorded reason when there is nothing to send, the
    /// winner has no settlement destination, or the gateway is down. The
    /// skip is itself a trade record so the audit trail stays complete.
    pub async fn dispatch(&self, round: &Round) -> Result<()> {
        let Some(winner_id) = round.winner.clone() else {
            // Empty round: nothing was won.
            return Ok(());
        };
        let winner = round
            .participant(&winner_id)
            .map(|p| p.profile())
            .ok_or_else(|| anyhow::anyhow!("winner {winner_id} not among participants"))?;

        let items = round.payout_items();
        let asset_ids: Vec<String> = items.iter().map(|i| i.asset_id.clone()).collect();
        let value = round.total_value;

        if items.is_empty() {
            return self
                .skip(round, &winner, "entire pot value withheld as tax")
                .await;
        }
        if winner.trade_url.is_none() {
            self.events
                .notify_user(&winner.id, "Set your trade URL to receive your winnings.");
            return self.skip(round, &winner, "winner has no trade destination").await;
        }
        if !self.gateway.is_connected() {
            self.events.notify_user(
                &winner.id,
                "The trade service is down; your winnings will be handled manually.",
            );
            return self.skip(round, &winner, "gateway unavailable").await;
        }

        // Persist the attempt before anything irreversible happens.
        let trade = TradeRecord::new(round.id, &winner.id, TradeKind::Payout, asset_ids.clone(), value);
        self.store.insert_trade(&trade).await?;

        let sent = async {
            let handle = self
                .gateway
                .propose(&winner, &asset_ids, OfferDirection::Outgoing)
                .await?;
            self.gateway.send(&handle).await
        }
        .await;

        match sent {
            Ok((status, external_id)) => {
                self.store
                    .update_trade(trade.id, status.as_trade_status(), Some(&external_id), None)
                    .await?;
                self.outstanding.lock().expect("payout map poisoned").insert(
                    external_id.clone(),
                    OutstandingPayout {
                        trade_id: trade.id,
                        round_id: round.id,
                        user_id: winner.id.clone(),
                    },
                );
                info!(
                    round_id = round.id,
                    winner = %winner.id,
                    offer_id = %external_id,
                    items = items.len(),
                    value = %value,
                    "Payout offer sent"
                );
                self.events.emit(RoundEvent::PayoutUpdate {
                    round_id: round.id,
                    user_id: winner.id.clone(),
                    status: status.as_trade_status(),
                });
                if status == OfferStatus::Escrow {
                    self.events.notify_user(
                        &winner.id,
                        "Your winnings are on hold — confirm the trade on your side to release them.",
                    );
                }
                Ok(())
            }
            Err(e) => {
                warn!(round_id = round.id, winner = %winner.id, error = %e, "Payout send failed");
                self.store
                    .update_trade(trade.id, TradeStatus::Failed, None, Some(&e.to_string()))
                    .await?;
                self.events.emit(RoundEvent::PayoutUpdate {
                    round_id: round.id,
                    user_id: winner.id.clone(),
                    status: TradeStatus::Failed,
                });
                self.events.notify_user(
                    &winner.id,
                    "Sending your winnings failed; the payout will be retried manually.",
                );
                Ok(())
            }
        }
    }

    /// Route a gateway status event to the payout it belongs to. Returns
    /// false when the offer is not one of ours.
    pub async fn handle_event(&self, event: &GatewayEvent) -> Result<bool> {
        let payout = {
            let outstanding = self.outstanding.lock().expect("payout map poisoned");
            match outstanding.get(&event.offer_id) {
                Some(p) => p.clone(),
                None => return Ok(false),
            }
        };

        if !event.status.is_terminal() {
            return Ok(true);
        }

        let status = event.status.as_trade_status();
        self.store.update_trade(payout.trade_id, status, None, None).await?;
        self.outstanding
            .lock()
            .expect("payout map poisoned")
            .remove(&event.offer_id);

        info!(
            round_id = payout.round_id,
            user_id = %payout.user_id,
            offer_id = %event.offer_id,
            %status,
            "Payout offer resolved"
        );
        self.events.emit(RoundEvent::PayoutUpdate {
            round_id: payout.round_id,
            user_id: payout.user_id.clone(),
            status,
        });

        match event.status {
            OfferStatus::Accepted => {
                self.events
                    .notify_user(&payout.user_id, "Winnings delivered. Congratulations!");
            }
            OfferStatus::Escrow => {
                self.events.notify_user(
                    &payout.user_id,
                    "Your winnings are on hold — confirm the trade on your side to release them.",
                );
            }
            _ => {
                self.events.notify_user(
                    &payout.user_id,
                    "The winnings offer did not go through; it will be handled manually.",
                );
            }
        }
        Ok(true)
    }

    /// Record a deliberate no-op with its reason.
    async fn skip(&self, round: &Round, winner: &UserProfile, reason: &str) -> Result<()> {
        warn!(round_id = round.id, winner = %winner.id, reason, "Payout skipped");
        let mut trade = TradeRecord::new(
            round.id,
            &winner.id,
            TradeKind::Payout,
            round.payout_items().iter().map(|i| i.asset_id.clone()).collect(),
            round.total_value,
        );
        trade.status = TradeStatus::Skipped;
        trade.note = Some(reason.to_string());
        self.store.insert_trade(&trade).await?;
        self.events.emit(RoundEvent::PayoutUpdate {
            round_id: round.id,
            user_id: winner.id.clone(),
            status: TradeStatus::Skipped,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
