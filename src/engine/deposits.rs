//! Deposit reconciliation coordinator.
//!
//! Two-phase commit against the settlement gateway: `propose` stages the
//! transfer and records a `PendingDeposit`; the gateway's asynchronous
//! status events drive `handle_event`, which re-validates and commits the
//! contribution into the round — or clears the marker on a terminal
//! failure. A periodic `sweep` reconciles entries whose expiry passed
//! without a gateway verdict, querying gateway status directly rather than
//! trusting local state alone.

use anyhow::Result;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::round::RoundEngine;
use crate::events::EventBus;
use crate::gateway::{GatewayEvent, OfferDirection, OfferStatus, SettlementGateway};
use crate::pricing::PriceBook;
use crate::storage::Store;
use crate::types::{
    EngineError, PendingDeposit, PotItem, TradeKind, TradeRecord, TradeStatus, UserProfile,
};

// ---------------------------------------------------------------------------
// Inputs & outputs
// ---------------------------------------------------------------------------

/// One item a user offers to contribute. The display name doubles as the
/// pricing key; the price itself is snapshotted here, at proposal time.
#[derive(Debug, Clone)]
pub struct DepositItem {
    pub asset_id: String,
    pub name: String,
    pub image_url: String,
}

/// What the caller gets back from a successful proposal.
#[derive(Debug, Clone)]
pub struct DepositProposal {
    pub id: Uuid,
    pub offer_id: String,
    pub total_value: Decimal,
    pub expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DepositConfig {
    pub max_items_per_deposit: usize,
    pub max_items_per_pot: usize,
    pub max_participants: usize,
    /// Pending-deposit lifetime; matches the gateway's cancellation window.
    pub offer_ttl: Duration,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct DepositCoordinator {
    cfg: DepositConfig,
    engine: Arc<RoundEngine>,
    gateway: Arc<dyn SettlementGateway>,
    pricing: Arc<PriceBook>,
    store: Store,
    events: EventBus,
    /// Correlation table, keyed by operation id. At most one entry per user;
    /// entries carry their own expiry and are swept, not timer-driven.
    pending: Mutex<HashMap<Uuid, PendingDeposit>>,
}

impl DepositCoordinator {
    pub fn new(
        cfg: DepositConfig,
        engine: Arc<RoundEngine>,
        gateway: Arc<dyn SettlementGateway>,
        pricing: Arc<PriceBook>,
        store: Store,
        events: EventBus,
    ) -> Self {
        DepositCoordinator {
            cfg,
            engine,
            gateway,
            pricing,
            store,
            events,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending map poisoned").len()
    }

    fn pending_for_user(&self, user_id: &str) -> Option<PendingDeposit> {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .values()
            .find(|p| p.user.id == user_id)
            .cloned()
    }

    fn pending_for_offer(&self, offer_id: &str) -> Option<PendingDeposit> {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .values()
            .find(|p| p.offer_id.as_deref() == Some(offer_id))
            .cloned()
    }

    fn remove_pending(&self, id: Uuid) {
        self.pending.lock().expect("pending map poisoned").remove(&id);
    }

    // -- Phase 1: propose -------------------------------------------------

    /// Validate, snapshot prices, record the pending marker, and hand the
    /// transfer to the gateway. Ceilings are checked against the
    /// authoritative store immediately before proposing to narrow the race
    /// window against concurrent proposals.
    pub async fn propose(
        &self,
        user: &UserProfile,
        items: Vec<DepositItem>,
    ) -> Result<DepositProposal, EngineError> {
        if user.trade_url.is_none() {
            return Err(EngineError::NoTradeDestination);
        }
        if items.is_empty() {
            return Err(EngineError::InvalidDeposit("no items offered".to_string()));
        }
        if items.len() > self.cfg.max_items_per_deposit {
            return Err(EngineError::LimitReached(format!(
                "at most {} items per deposit",
                self.cfg.max_items_per_deposit
            )));
        }

        let round = self.engine.snapshot().await.ok_or(EngineError::NoActiveRound)?;
        if !matches!(round.status, crate::types::RoundStatus::Active) {
            return Err(EngineError::RoundClosed);
        }

        // One in-flight proposal per user. A stale one is detected and
        // cleared by asking the gateway, not by trusting local state.
        if let Some(existing) = self.pending_for_user(&user.id) {
            self.clear_if_stale(existing).await?;
        }

        // Reserve the user's slot before any suspension point so two
        // concurrent proposals can't both pass the check.
        let operation_id = Uuid::new_v4();
        {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            if pending.values().any(|p| p.user.id == user.id) {
                return Err(EngineError::AlreadyPending);
            }
            let now = Utc::now();
            pending.insert(
                operation_id,
                PendingDeposit {
                    id: operation_id,
                    user: user.clone(),
                    round_id: round.id,
                    items: Vec::new(),
                    total_value: Decimal::ZERO,
                    offer_id: None,
                    trade_id: None,
                    created_at: now,
                    expires_at: now + self.cfg.offer_ttl,
                },
            );
        }

        match self.propose_inner(operation_id, user, items, &round).await {
            Ok(proposal) => Ok(proposal),
            Err(e) => {
                self.remove_pending(operation_id);
                Err(e)
            }
        }
    }

    async fn propose_inner(
        &self,
        operation_id: Uuid,
        user: &UserProfile,
        items: Vec<DepositItem>,
        round: &crate::types::RoundSnapshot,
    ) -> Result<DepositProposal, EngineError> {
        // Ceilings against the authoritative store, right before proposing.
        let stored_items = self
            .store
            .count_round_items(round.id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        if stored_items + items.len() > self.cfg.max_items_per_pot {
            return Err(EngineError::LimitReached(format!(
                "pot holds at most {} items",
                self.cfg.max_items_per_pot
            )));
        }
        let is_participant = round.participants.iter().any(|p| p.user_id == user.id);
        if !is_participant {
            let stored_participants = self
                .store
                .count_round_participants(round.id)
                .await
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            if stored_participants >= self.cfg.max_participants {
                return Err(EngineError::LimitReached(format!(
                    "round holds at most {} participants",
                    self.cfg.max_participants
                )));
            }
        }

        // Price snapshot. Never re-priced after this point.
        let pot_items: Vec<PotItem> = items
            .iter()
            .map(|item| PotItem {
                asset_id: item.asset_id.clone(),
                name: item.name.clone(),
                image_url: item.image_url.clone(),
                price: self.pricing.price(&item.name),
                user_id: user.id.clone(),
                round_id: round.id,
            })
            .collect();
        let total_value: Decimal = pot_items.iter().map(|i| i.price).sum();
        let asset_ids: Vec<String> = pot_items.iter().map(|i| i.asset_id.clone()).collect();

        // Audit row goes in before the external call.
        let trade = TradeRecord::new(round.id, &user.id, TradeKind::Deposit, asset_ids.clone(), total_value);
        self.store
            .insert_trade(&trade)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let expires_at = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            let entry = pending
                .get_mut(&operation_id)
                .ok_or_else(|| EngineError::Integrity("pending entry vanished".to_string()))?;
            entry.items = pot_items;
            entry.total_value = total_value;
            entry.trade_id = Some(trade.id);
            entry.expires_at
        };

        let sent = async {
            let handle = self
                .gateway
                .propose(user, &asset_ids, OfferDirection::Incoming)
                .await?;
            self.gateway.send(&handle).await
        }
        .await;

        let (status, offer_id) = match sent {
            Ok(result) => result,
            Err(e) => {
                warn!(user_id = %user.id, error = %e, "Deposit offer dispatch failed");
                let _ = self
                    .store
                    .update_trade(trade.id, TradeStatus::Failed, None, Some(&e.to_string()))
                    .await;
                return Err(EngineError::GatewayUnavailable);
            }
        };

        {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            if let Some(entry) = pending.get_mut(&operation_id) {
                entry.offer_id = Some(offer_id.clone());
            }
        }
        self.store
            .update_trade(trade.id, status.as_trade_status(), Some(&offer_id), None)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        info!(
            user_id = %user.id,
            round_id = round.id,
            offer_id = %offer_id,
            items = asset_ids.len(),
            value = %total_value,
            "Deposit offer sent"
        );
        self.events
            .notify_user(&user.id, "Deposit offer sent — accept it to join the pot.");

        Ok(DepositProposal {
            id: operation_id,
            offer_id,
            total_value,
            expires_at,
        })
    }

    /// Resolve an existing pending entry for a user who is proposing again:
    /// still open at the gateway → reject; terminal or unknown → clear it.
    async fn clear_if_stale(&self, existing: PendingDeposit) -> Result<(), EngineError> {
        let Some(offer_id) = existing.offer_id.clone() else {
            // Dispatch still in flight; nothing to reconcile against yet.
            return Err(EngineError::AlreadyPending);
        };

        let status = self
            .gateway
            .status(&offer_id)
            .await
            .map_err(|_| EngineError::GatewayUnavailable)?;

        match status {
            Some(OfferStatus::Sent) => Err(EngineError::AlreadyPending),
            Some(OfferStatus::Accepted) => {
                // The accept event hasn't reached us yet; commit it through
                // the normal path rather than dropping the contribution.
                // That clears the user's slot, so the new proposal proceeds.
                self.process_event(&GatewayEvent {
                    offer_id,
                    status: OfferStatus::Accepted,
                })
                .await
                .map_err(|e| EngineError::Gateway(e.to_string()))?;
                Ok(())
            }
            Some(terminal) => {
                info!(
                    user_id = %existing.user.id,
                    offer_id = %offer_id,
                    status = %terminal,
                    "Clearing stale pending deposit"
                );
                self.remove_pending(existing.id);
                if let Some(trade_id) = existing.trade_id {
                    let _ = self
                        .store
                        .update_trade(trade_id, terminal.as_trade_status(), None, None)
                        .await;
                }
                Ok(())
            }
            None => {
                info!(
                    user_id = %existing.user.id,
                    offer_id = %offer_id,
                    "Gateway no longer knows pending offer; clearing"
                );
                self.remove_pending(existing.id);
                if let Some(trade_id) = existing.trade_id {
                    let _ = self
                        .store
                        .update_trade(trade_id, TradeStatus::Expired, None, None)
                        .await;
                }
                Ok(())
            }
        }
    }

    // -- Phase 2: confirm -------------------------------------------------

    /// Route a gateway status event to the pending deposit it belongs to.
    /// Returns false when the offer is not one of ours.
    pub async fn handle_event(&self, event: &GatewayEvent) -> Result<bool> {
        self.process_event(event).await
    }

    async fn process_event(&self, event: &GatewayEvent) -> Result<bool> {
        let Some(entry) = self.pending_for_offer(&event.offer_id) else {
            return Ok(false);
        };

        match event.status {
            OfferStatus::Sent => Ok(true),
            // A held deposit offer is not in our custody yet; wait for the
            // real verdict.
            OfferStatus::Escrow => {
                debug!(offer_id = %event.offer_id, "Deposit offer held in escrow");
                Ok(true)
            }
            OfferStatus::Accepted => {
                self.commit(entry).await?;
                Ok(true)
            }
            OfferStatus::Declined
            | OfferStatus::Expired
            | OfferStatus::Canceled
            | OfferStatus::Failed => {
                self.clear(entry, event.status).await?;
                Ok(true)
            }
        }
    }

    /// The items are in operator custody now; re-validate and commit into
    /// the round. A rejection at this point cannot return the items — the
    /// trade is flagged for manual reconciliation instead.
    async fn commit(&self, entry: PendingDeposit) -> Result<()> {
        // The marker goes first so no second confirmation can replay it.
        self.remove_pending(entry.id);

        let outcome = self
            .engine
            .confirm_deposit(entry.round_id, &entry.user, entry.items.clone())
            .await;

        match outcome {
            Ok(()) => {
                if let Some(trade_id) = entry.trade_id {
                    self.store
                        .update_trade(trade_id, TradeStatus::Accepted, None, None)
                        .await?;
                }
                info!(
                    user_id = %entry.user.id,
                    round_id = entry.round_id,
                    value = %entry.total_value,
                    "Deposit confirmed"
                );
                self.events
                    .notify_user(&entry.user.id, "Deposit confirmed — you're in the pot.");
                Ok(())
            }
            Err(e) => {
                warn!(
                    user_id = %entry.user.id,
                    round_id = entry.round_id,
                    error = %e,
                    "Deposit confirmed by gateway but rejected by the round; manual reconciliation required"
                );
                if let Some(trade_id) = entry.trade_id {
                    self.store
                        .update_trade(
                            trade_id,
                            TradeStatus::NeedsReview,
                            None,
                            Some(&e.to_string()),
                        )
                        .await?;
                }
                self.events.notify_user(&entry.user.id, e.user_message());
                Ok(())
            }
        }
    }

    /// Terminal non-success from the gateway: drop the marker, close the
    /// audit row, tell the user. Round state is untouched.
    async fn clear(&self, entry: PendingDeposit, status: OfferStatus) -> Result<()> {
        self.remove_pending(entry.id);
        if let Some(trade_id) = entry.trade_id {
            self.store
                .update_trade(trade_id, status.as_trade_status(), None, None)
                .await?;
        }
        info!(
            user_id = %entry.user.id,
            offer_id = ?entry.offer_id,
            %status,
            "Pending deposit cleared"
        );
        self.events.notify_user(
            &entry.user.id,
            format!("Your deposit offer was {status}. You can try again."),
        );
        Ok(())
    }

    // -- Reconciliation sweep ---------------------------------------------

    /// Single periodic pass over expired pending deposits. Each one is
    /// reconciled against gateway-reported status; only when the gateway
    /// still shows the offer open is the entry left for the next pass.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let expired: Vec<PendingDeposit> = {
            let pending = self.pending.lock().expect("pending map poisoned");
            pending
                .values()
                .filter(|p| p.is_expired(now))
                .cloned()
                .collect()
        };

        for entry in expired {
            let Some(offer_id) = entry.offer_id.clone() else {
                // Never made it to the gateway; the proposal path owns its
                // cleanup unless the process lost track of it.
                warn!(user_id = %entry.user.id, "Expired pending deposit without offer id");
                self.remove_pending(entry.id);
                continue;
            };

            match self.gateway.status(&offer_id).await {
                Ok(Some(OfferStatus::Sent)) => {
                    warn!(
                        offer_id = %offer_id,
                        "Offer still open at gateway past local expiry; leaving for next sweep"
                    );
                }
                Ok(Some(status)) => {
                    if let Err(e) = self
                        .process_event(&GatewayEvent {
                            offer_id: offer_id.clone(),
                            status,
                        })
                        .await
                    {
                        warn!(offer_id = %offer_id, error = %e, "Sweep reconciliation failed");
                    }
                }
                Ok(None) => {
                    if let Err(e) = self.clear(entry, OfferStatus::Expired).await {
                        warn!(offer_id = %offer_id, error = %e, "Sweep cleanup failed");
                    }
                }
                Err(e) => {
                    warn!(offer_id = %offer_id, error = %e, "Gateway unreachable during sweep");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
