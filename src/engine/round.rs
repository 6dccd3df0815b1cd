//! Round engine — owns the single live round aggregate and drives time.
//!
//! All round mutations funnel through two handlers: deposit confirmation
//! (`confirm_deposit`) and timer expiry (`finalize_expired`). The `rolling`
//! flag is the actual mutual exclusion between them: storage writes and
//! gateway calls are suspension points where the other handler could run,
//! so function scoping alone is not enough. Both handlers re-check round
//! state immediately before mutating, not just on entry.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::payout::PayoutCoordinator;
use super::state::{self, RoundRules};
use crate::events::{EventBus, RoundEvent};
use crate::fairness::{self, TaxPolicy};
use crate::storage::Store;
use crate::types::{EngineError, PotItem, Round, RoundSnapshot, RoundStatus, UserProfile};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RoundEngineConfig {
    /// Countdown length once the first participant joins.
    pub round_duration: Duration,
    /// Pause between a terminal round and opening the next one.
    pub cooldown: std::time::Duration,
    /// Backoff between round-creation retries. Creation fails closed: it
    /// keeps retrying rather than leaving the system without a round.
    pub create_retry: std::time::Duration,
    pub ticket_ratio: Decimal,
    pub max_items_per_pot: usize,
    pub max_participants: usize,
    pub tax: TaxPolicy,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct RoundEngine {
    cfg: RoundEngineConfig,
    store: Store,
    events: EventBus,
    payout: Arc<PayoutCoordinator>,
    /// The one live aggregate (arena-of-one). Held only for short,
    /// non-I/O-free critical sections by the expiry handler; the deposit
    /// handler holds it across its persist to stay strictly serialized.
    current: Mutex<Option<Round>>,
    /// Set for the whole expiry-to-terminal window; deposit confirmation
    /// consults it before and after taking the aggregate lock.
    rolling: AtomicBool,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RoundEngine {
    pub fn new(
        cfg: RoundEngineConfig,
        store: Store,
        events: EventBus,
        payout: Arc<PayoutCoordinator>,
    ) -> Arc<Self> {
        Arc::new(RoundEngine {
            cfg,
            store,
            events,
            payout,
            current: Mutex::new(None),
            rolling: AtomicBool::new(false),
            timer: std::sync::Mutex::new(None),
        })
    }

    fn rules(&self) -> RoundRules {
        RoundRules {
            round_duration: self.cfg.round_duration,
            ticket_ratio: self.cfg.ticket_ratio,
            max_items_per_pot: self.cfg.max_items_per_pot,
            max_participants: self.cfg.max_participants,
        }
    }

    // -- Queries ----------------------------------------------------------

    /// Public view of the live round, if any.
    pub async fn snapshot(&self) -> Option<RoundSnapshot> {
        self.current.lock().await.as_ref().map(|r| r.snapshot())
    }

    /// Public view of any round by sequence number; the live aggregate wins
    /// over the store for the current one.
    pub async fn snapshot_by_id(&self, id: i64) -> Result<Option<RoundSnapshot>, EngineError> {
        if let Some(round) = self.current.lock().await.as_ref() {
            if round.id == id {
                return Ok(Some(round.snapshot()));
            }
        }
        self.store
            .load_round(id)
            .await
            .map(|opt| opt.map(|r| r.snapshot()))
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    // -- Lifecycle --------------------------------------------------------

    /// Restore state after a restart: reload the persisted open round, and
    /// resume its countdown from the persisted `end_time` (never reset it —
    /// that would let restarts stretch rounds). A round caught mid-roll is
    /// finalized immediately.
    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        match self
            .store
            .load_open_round()
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
        {
            Some(round) => {
                info!(round_id = round.id, status = %round.status, "Resuming persisted round");
                let end_time = round.end_time;
                let mid_roll = round.status == RoundStatus::Rolling;
                *self.current.lock().await = Some(round);

                if mid_roll {
                    let engine = Arc::clone(self);
                    tokio::spawn(async move { engine.finalize_expired().await });
                } else if let Some(end) = end_time {
                    self.arm_timer(end);
                }
            }
            None => self.ensure_round().await,
        }
        Ok(())
    }

    /// Make sure a non-terminal round exists, opening one if needed.
    /// Creation retries on a fixed backoff until persistence succeeds.
    pub async fn ensure_round(self: &Arc<Self>) {
        {
            let guard = self.current.lock().await;
            if let Some(round) = guard.as_ref() {
                if !round.is_terminal() {
                    return;
                }
            }
        }

        loop {
            match self.try_open_round().await {
                Ok((round, events)) => {
                    info!(round_id = round.id, hash = %round.server_seed_hash, "Round opened");
                    *self.current.lock().await = Some(round);
                    self.events.emit_all(events);
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Round creation failed; retrying");
                    tokio::time::sleep(self.cfg.create_retry).await;
                }
            }
        }
    }

    async fn try_open_round(&self) -> Result<(Round, Vec<RoundEvent>)> {
        let id = self.store.next_round_id().await?;
        let seed = fairness::generate_server_seed();
        let hash = fairness::seed_hash(&seed);
        let (round, events) = state::open_round(id, seed, hash, Utc::now());
        self.store.save_round(&round).await?;
        Ok((round, events))
    }

    // -- Deposit confirmation handler -------------------------------------

    /// Commit a gateway-confirmed deposit into round `round_id`.
    ///
    /// "Round is no longer active" is a legitimate outcome here even though
    /// it was active at proposal time; the caller maps it to a rejection,
    /// not a bug. A confirmation aimed at an earlier round never lands in
    /// its successor.
    pub async fn confirm_deposit(
        self: &Arc<Self>,
        round_id: i64,
        user: &UserProfile,
        items: Vec<PotItem>,
    ) -> Result<(), EngineError> {
        if self.rolling.load(Ordering::SeqCst) {
            return Err(EngineError::RoundClosed);
        }

        let mut guard = self.current.lock().await;
        // Re-check under the lock: the expiry handler may have raised the
        // flag while we waited.
        if self.rolling.load(Ordering::SeqCst) {
            return Err(EngineError::RoundClosed);
        }
        let round = guard.as_ref().ok_or(EngineError::NoActiveRound)?;
        if round.id != round_id {
            return Err(EngineError::RoundClosed);
        }

        let (next, events) =
            state::apply_deposit(round, user, items, &self.rules(), Utc::now())?;
        self.store
            .save_round(&next)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let countdown_started = round.end_time.is_none() && next.end_time.is_some();
        let end_time = next.end_time;
        *guard = Some(next);
        drop(guard);

        if countdown_started {
            if let Some(end) = end_time {
                self.arm_timer(end);
            }
        }
        self.events.emit_all(events);
        Ok(())
    }

    // -- Timer ------------------------------------------------------------

    /// (Re)arm the countdown to fire at `end_time`. A past deadline fires
    /// immediately, which is what resume-after-downtime wants.
    pub fn arm_timer(self: &Arc<Self>, end_time: DateTime<Utc>) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let delay = (end_time - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
            engine.finalize_expired().await;
        });
        if let Some(old) = self
            .timer
            .lock()
            .expect("timer lock poisoned")
            .replace(handle)
        {
            old.abort();
        }
    }

    /// Cancel the countdown. Idempotent: cancelling twice, or after the
    /// timer fired, is a no-op.
    pub fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().expect("timer lock poisoned").take() {
            handle.abort();
        }
    }

    // -- Expiry handler ---------------------------------------------------

    /// Timer-expiry handler: close the deposit window, draw, withhold tax,
    /// pay out, then open the next round after the cooldown.
    pub async fn finalize_expired(self: &Arc<Self>) {
        // Single-winner gate for the whole finalization window.
        if self
            .rolling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.finalize_inner().await;
        self.rolling.store(false, Ordering::SeqCst);

        tokio::time::sleep(self.cfg.cooldown).await;
        self.ensure_round().await;
    }

    async fn finalize_inner(self: &Arc<Self>) {
        // Transition to rolling before reading any draw state, so nothing
        // can land between "time elapsed" and "selection computed".
        let rolling_round = {
            let mut guard = self.current.lock().await;
            let Some(round) = guard.as_ref().cloned() else { return };
            match round.status {
                RoundStatus::Active => match state::start_rolling(&round) {
                    Ok((next, events)) => {
                        *guard = Some(next.clone());
                        drop(guard);
                        self.events.emit_all(events);
                        next
                    }
                    Err(_) => return,
                },
                // A restart caught us mid-roll; pick up where we left off.
                RoundStatus::Rolling => round,
                _ => return,
            }
        };

        if let Err(e) = self.store.save_round(&rolling_round).await {
            error!(round_id = rolling_round.id, error = %e, "Failed to persist rolling state");
            self.mark_error(&rolling_round).await;
            return;
        }

        // Empty-round guard: nothing staked, nothing to draw.
        if rolling_round.participants.is_empty() {
            match state::complete_empty(&rolling_round) {
                Ok((done, events)) => {
                    if let Err(e) = self.store.save_round(&done).await {
                        error!(round_id = done.id, error = %e, "Failed to persist empty completion");
                        self.mark_error(&rolling_round).await;
                        return;
                    }
                    info!(round_id = done.id, "Round expired empty");
                    *self.current.lock().await = Some(done);
                    self.events.emit_all(events);
                }
                Err(e) => {
                    error!(round_id = rolling_round.id, error = %e, "Empty completion rejected");
                    self.mark_error(&rolling_round).await;
                }
            }
            return;
        }

        let client_seed = fairness::generate_client_seed();
        let outcome = match state::draw(&rolling_round, client_seed) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(round_id = rolling_round.id, error = %e, "Draw failed");
                self.mark_error(&rolling_round).await;
                return;
            }
        };
        let tax = fairness::assess(
            &rolling_round.items,
            rolling_round.total_value,
            &self.cfg.tax,
        );

        let (done, events) = match state::complete(&rolling_round, &outcome, &tax) {
            Ok(result) => result,
            Err(e) => {
                error!(round_id = rolling_round.id, error = %e, "Completion rejected");
                self.mark_error(&rolling_round).await;
                return;
            }
        };
        if let Err(e) = self.store.save_round(&done).await {
            error!(round_id = done.id, error = %e, "Failed to persist completed round");
            self.mark_error(&rolling_round).await;
            return;
        }

        info!(
            round_id = done.id,
            winner = done.winner.as_deref().unwrap_or("-"),
            winning_ticket = outcome.winning_ticket,
            total_tickets = done.total_tickets,
            pot = %done.total_value,
            tax = %done.tax_value,
            "Round completed"
        );
        *self.current.lock().await = Some(done.clone());
        self.events.emit_all(events);

        // Payout failures are recorded on the trade row; they don't fail
        // the round.
        if let Err(e) = self.payout.dispatch(&done).await {
            warn!(round_id = done.id, error = %e, "Payout dispatch error");
        }
    }

    /// External-service or integrity failure during finalization: the round
    /// is marked `error` and the cycle moves on instead of retrying it
    /// indefinitely.
    async fn mark_error(&self, round: &Round) {
        let (failed, events) = state::fail(round);
        if let Err(e) = self.store.save_round(&failed).await {
            error!(round_id = failed.id, error = %e, "Failed to persist error state");
        }
        *self.current.lock().await = Some(failed);
        self.events.emit_all(events);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
