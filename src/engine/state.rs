//! Pure round state transitions.
//!
//! Every transition takes the current aggregate by reference and returns a
//! new aggregate plus the events it emits, or a typed error. Nothing here
//! touches storage, timers, or the gateway — the `RoundEngine` owns the one
//! live aggregate and sequences these functions around its I/O.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::events::RoundEvent;
use crate::fairness::{self, TaxAssessment};
use crate::types::{EngineError, Participant, PotItem, Round, RoundStatus, UserProfile};

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// The per-round constants transitions are checked against.
#[derive(Debug, Clone)]
pub struct RoundRules {
    pub round_duration: Duration,
    pub ticket_ratio: Decimal,
    pub max_items_per_pot: usize,
    pub max_participants: usize,
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Open a fresh round around a new commitment pair. The emitted event
/// carries only the seed hash; the seed itself stays in the aggregate.
pub fn open_round(
    id: i64,
    server_seed: String,
    server_seed_hash: String,
    now: DateTime<Utc>,
) -> (Round, Vec<RoundEvent>) {
    let round = Round {
        id,
        status: RoundStatus::Active,
        created_at: now,
        start_time: None,
        end_time: None,
        items: Vec::new(),
        participants: Vec::new(),
        total_value: Decimal::ZERO,
        total_tickets: 0,
        winner: None,
        winning_ticket: None,
        server_seed,
        server_seed_hash: server_seed_hash.clone(),
        client_seed: None,
        provable_hash: None,
        tax_value: Decimal::ZERO,
        tax_asset_ids: Vec::new(),
    };
    let events = vec![RoundEvent::RoundCreated {
        round_id: id,
        server_seed_hash,
    }];
    (round, events)
}

/// Commit a confirmed deposit into the round.
///
/// The caller must hold the aggregate and must have re-checked that the
/// round is still accepting deposits at confirmation time; this function
/// enforces it again and is the final word.
pub fn apply_deposit(
    round: &Round,
    user: &UserProfile,
    items: Vec<PotItem>,
    rules: &RoundRules,
    now: DateTime<Utc>,
) -> Result<(Round, Vec<RoundEvent>), EngineError> {
    if !round.accepts_deposits() {
        return Err(EngineError::RoundClosed);
    }
    if items.is_empty() {
        return Err(EngineError::InvalidDeposit("no items".to_string()));
    }
    if round.items.len() + items.len() > rules.max_items_per_pot {
        return Err(EngineError::LimitReached(format!(
            "pot holds at most {} items",
            rules.max_items_per_pot
        )));
    }
    let is_new_participant = round.participant(&user.id).is_none();
    if is_new_participant && round.participants.len() >= rules.max_participants {
        return Err(EngineError::LimitReached(format!(
            "round holds at most {} participants",
            rules.max_participants
        )));
    }

    let mut next = round.clone();
    let mut events = Vec::new();

    let deposit_value: Decimal = items.iter().map(|i| i.price).sum();
    let items: Vec<PotItem> = items
        .into_iter()
        .map(|mut item| {
            item.round_id = round.id;
            item.user_id = user.id.clone();
            item
        })
        .collect();
    next.items.extend(items.iter().cloned());

    if is_new_participant {
        next.participants.push(Participant {
            user_id: user.id.clone(),
            name: user.name.clone(),
            avatar: user.avatar.clone(),
            trade_url: user.trade_url.clone(),
            value: Decimal::ZERO,
            tickets: 0,
        });
    }
    let entry = next
        .participants
        .iter_mut()
        .find(|p| p.user_id == user.id)
        .ok_or_else(|| EngineError::Integrity("participant vanished during upsert".to_string()))?;
    entry.value += deposit_value;
    // Recomputed from cumulative value; never decremented.
    let recomputed = fairness::tickets_for_value(entry.value, rules.ticket_ratio);
    entry.tickets = entry.tickets.max(recomputed);
    let participant = entry.clone();

    next.total_value += deposit_value;
    next.total_tickets = next.participants.iter().map(|p| p.tickets).sum();

    // The countdown anchors to the first participant, not round creation.
    if next.start_time.is_none() {
        next.start_time = Some(now);
        next.end_time = Some(now + rules.round_duration);
        events.push(RoundEvent::CountdownStarted {
            round_id: next.id,
            end_time: now + rules.round_duration,
        });
    }

    events.push(RoundEvent::DepositConfirmed {
        round_id: next.id,
        participant,
        items,
        total_value: next.total_value,
        total_tickets: next.total_tickets,
    });

    Ok((next, events))
}

/// Close the deposit window. Runs before any draw state is read so nothing
/// can land between "time elapsed" and "selection computed".
pub fn start_rolling(round: &Round) -> Result<(Round, Vec<RoundEvent>), EngineError> {
    if round.status != RoundStatus::Active {
        return Err(EngineError::RoundClosed);
    }
    let mut next = round.clone();
    next.status = RoundStatus::Rolling;
    let events = vec![RoundEvent::RoundRolling { round_id: next.id }];
    Ok((next, events))
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// The draw result: everything derived from the seeds and the frozen
/// participant list.
#[derive(Debug, Clone)]
pub struct DrawOutcome {
    pub client_seed: String,
    pub provable_hash: String,
    pub winning_ticket: u64,
    pub winner_index: usize,
}

/// Derive the winner from a rolling round and a client seed. Pure: the same
/// round and seed always reproduce the same outcome.
pub fn draw(round: &Round, client_seed: String) -> Result<DrawOutcome, EngineError> {
    if round.status != RoundStatus::Rolling {
        return Err(EngineError::Integrity(format!(
            "draw on a {} round",
            round.status
        )));
    }
    let provable = fairness::provable_hash(&round.server_seed, &client_seed);
    let winning_ticket = fairness::derive_ticket(&provable, round.total_tickets)
        .ok_or_else(|| EngineError::Integrity("draw on an empty pot".to_string()))?;
    let counts: Vec<u64> = round.participants.iter().map(|p| p.tickets).collect();
    let winner_index = fairness::winner_index(&counts, winning_ticket).ok_or_else(|| {
        EngineError::Integrity(format!(
            "ticket {winning_ticket} outside cumulative ranges"
        ))
    })?;

    Ok(DrawOutcome {
        client_seed,
        provable_hash: provable,
        winning_ticket,
        winner_index,
    })
}

/// Finalize a rolling round: record the draw, withhold tax, reveal seeds.
/// The aggregate becomes immutable after this.
pub fn complete(
    round: &Round,
    outcome: &DrawOutcome,
    tax: &TaxAssessment,
) -> Result<(Round, Vec<RoundEvent>), EngineError> {
    if round.status != RoundStatus::Rolling {
        return Err(EngineError::Integrity(format!(
            "complete on a {} round",
            round.status
        )));
    }
    let winner = round
        .participants
        .get(outcome.winner_index)
        .ok_or_else(|| EngineError::Integrity("winner index out of range".to_string()))?;

    let mut next = round.clone();
    next.status = RoundStatus::Completed;
    next.winner = Some(winner.user_id.clone());
    next.winning_ticket = Some(outcome.winning_ticket);
    next.client_seed = Some(outcome.client_seed.clone());
    next.provable_hash = Some(outcome.provable_hash.clone());
    next.tax_value = tax.value;
    next.tax_asset_ids = tax.asset_ids.clone();
    // The pot value announced with the winner is net of tax.
    next.total_value -= tax.value;

    let events = vec![
        RoundEvent::WinnerSelected {
            round_id: next.id,
            user_id: winner.user_id.clone(),
            winning_ticket: outcome.winning_ticket,
            total_tickets: next.total_tickets,
            server_seed: next.server_seed.clone(),
            client_seed: outcome.client_seed.clone(),
            provable_hash: outcome.provable_hash.clone(),
            pot_value: next.total_value,
            tax_value: tax.value,
        },
        RoundEvent::RoundClosed {
            round_id: next.id,
            errored: false,
        },
    ];
    Ok((next, events))
}

/// Terminal path for a round that expired with no participants: completed,
/// no winner, no draw. Keeps ticket math away from an empty pot.
pub fn complete_empty(round: &Round) -> Result<(Round, Vec<RoundEvent>), EngineError> {
    if round.is_terminal() {
        return Err(EngineError::RoundClosed);
    }
    if !round.participants.is_empty() {
        return Err(EngineError::Integrity(
            "empty-round completion with participants".to_string(),
        ));
    }
    let mut next = round.clone();
    next.status = RoundStatus::Completed;
    let events = vec![RoundEvent::RoundClosed {
        round_id: next.id,
        errored: false,
    }];
    Ok((next, events))
}

/// Terminal error path. Used when finalization hits an external-service or
/// integrity failure; the next round is scheduled instead of retrying this
/// one indefinitely.
pub fn fail(round: &Round) -> (Round, Vec<RoundEvent>) {
    let mut next = round.clone();
    next.status = RoundStatus::Error;
    let events = vec![RoundEvent::RoundClosed {
        round_id: next.id,
        errored: true,
    }];
    (next, events)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fairness::seed_hash;
    use rust_decimal_macros::dec;

    fn rules() -> RoundRules {
        RoundRules {
            round_duration: Duration::seconds(120),
            ticket_ratio: dec!(0.01),
            max_items_per_pot: 10,
            max_participants: 3,
        }
    }

    fn items_worth(user: &str, prices: &[Decimal]) -> Vec<PotItem> {
        prices
            .iter()
            .enumerate()
            .map(|(i, price)| PotItem {
                asset_id: format!("{user}-{i}-{price}"),
                name: format!("Item {i}"),
                image_url: String::new(),
                price: *price,
                user_id: user.to_string(),
                round_id: 0,
            })
            .collect()
    }

    fn active_round() -> Round {
        let seed = "s".repeat(64);
        let hash = seed_hash(&seed);
        open_round(1, seed, hash, Utc::now()).0
    }

    #[test]
    fn test_open_round_emits_hash_not_seed() {
        let seed = "s".repeat(64);
        let (round, events) = open_round(5, seed.clone(), seed_hash(&seed), Utc::now());

        assert_eq!(round.status, RoundStatus::Active);
        assert!(round.start_time.is_none());
        assert_eq!(round.total_value, Decimal::ZERO);

        match &events[..] {
            [RoundEvent::RoundCreated {
                round_id,
                server_seed_hash,
            }] => {
                assert_eq!(*round_id, 5);
                assert_eq!(server_seed_hash, &round.server_seed_hash);
                assert_ne!(server_seed_hash, &seed);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_first_deposit_starts_countdown() {
        let round = active_round();
        let now = Utc::now();
        let (next, events) = apply_deposit(
            &round,
            &UserProfile::sample("u1"),
            items_worth("u1", &[dec!(1)]),
            &rules(),
            now,
        )
        .unwrap();

        assert_eq!(next.start_time, Some(now));
        assert_eq!(next.end_time, Some(now + Duration::seconds(120)));
        assert!(matches!(events[0], RoundEvent::CountdownStarted { .. }));
        assert!(matches!(events[1], RoundEvent::DepositConfirmed { .. }));
    }

    #[test]
    fn test_second_deposit_does_not_reset_countdown() {
        let round = active_round();
        let t0 = Utc::now();
        let (round, _) = apply_deposit(
            &round,
            &UserProfile::sample("u1"),
            items_worth("u1", &[dec!(1)]),
            &rules(),
            t0,
        )
        .unwrap();

        let t1 = t0 + Duration::seconds(30);
        let (round, events) = apply_deposit(
            &round,
            &UserProfile::sample("u2"),
            items_worth("u2", &[dec!(2)]),
            &rules(),
            t1,
        )
        .unwrap();

        assert_eq!(round.end_time, Some(t0 + Duration::seconds(120)));
        assert!(events
            .iter()
            .all(|e| !matches!(e, RoundEvent::CountdownStarted { .. })));
    }

    #[test]
    fn test_pot_total_equals_participant_sum() {
        let mut round = active_round();
        let deposits: &[(&str, &[Decimal])] = &[
            ("u1", &[dec!(1.25), dec!(0.75)]),
            ("u2", &[dec!(10)]),
            ("u1", &[dec!(3.50)]),
        ];
        for (user, prices) in deposits {
            let (next, _) = apply_deposit(
                &round,
                &UserProfile::sample(user),
                items_worth(user, prices),
                &rules(),
                Utc::now(),
            )
            .unwrap();
            round = next;

            let participant_sum: Decimal = round.participants.iter().map(|p| p.value).sum();
            assert_eq!(participant_sum, round.total_value);
        }
        assert_eq!(round.total_value, dec!(15.50));
        assert_eq!(round.participants.len(), 2);
    }

    #[test]
    fn test_tickets_monotonic_across_deposits() {
        let mut round = active_round();
        let user = UserProfile::sample("u1");
        let mut last_tickets = 0;

        for price in [dec!(0.50), dec!(2.00), dec!(0.019)] {
            let (next, _) = apply_deposit(
                &round,
                &user,
                items_worth("u1", &[price]),
                &rules(),
                Utc::now(),
            )
            .unwrap();
            round = next;

            let tickets = round.participant("u1").unwrap().tickets;
            assert!(tickets >= last_tickets);
            last_tickets = tickets;
        }
        // 0.50 + 2.00 + 0.019 = 2.519 → 251 tickets at $0.01.
        assert_eq!(last_tickets, 251);
    }

    #[test]
    fn test_deposit_rejected_when_not_active() {
        let round = active_round();
        let (rolling, _) = start_rolling(&round).unwrap();

        let result = apply_deposit(
            &rolling,
            &UserProfile::sample("u1"),
            items_worth("u1", &[dec!(1)]),
            &rules(),
            Utc::now(),
        );
        assert!(matches!(result, Err(EngineError::RoundClosed)));
    }

    #[test]
    fn test_deposit_rejected_over_item_ceiling() {
        let round = active_round();
        let prices: Vec<Decimal> = (0..11).map(|_| dec!(1)).collect();
        let result = apply_deposit(
            &round,
            &UserProfile::sample("u1"),
            items_worth("u1", &prices),
            &rules(),
            Utc::now(),
        );
        assert!(matches!(result, Err(EngineError::LimitReached(_))));
    }

    #[test]
    fn test_deposit_rejected_over_participant_ceiling() {
        let mut round = active_round();
        for user in ["u1", "u2", "u3"] {
            let (next, _) = apply_deposit(
                &round,
                &UserProfile::sample(user),
                items_worth(user, &[dec!(1)]),
                &rules(),
                Utc::now(),
            )
            .unwrap();
            round = next;
        }

        // A fourth distinct user is over the ceiling…
        let result = apply_deposit(
            &round,
            &UserProfile::sample("u4"),
            items_worth("u4", &[dec!(1)]),
            &rules(),
            Utc::now(),
        );
        assert!(matches!(result, Err(EngineError::LimitReached(_))));

        // …but an existing participant can still add.
        assert!(apply_deposit(
            &round,
            &UserProfile::sample("u1"),
            items_worth("u1", &[dec!(1)]),
            &rules(),
            Utc::now(),
        )
        .is_ok());
    }

    #[test]
    fn test_empty_deposit_rejected() {
        let result = apply_deposit(
            &active_round(),
            &UserProfile::sample("u1"),
            Vec::new(),
            &rules(),
            Utc::now(),
        );
        assert!(matches!(result, Err(EngineError::InvalidDeposit(_))));
    }

    #[test]
    fn test_start_rolling_only_from_active() {
        let round = active_round();
        let (rolling, events) = start_rolling(&round).unwrap();
        assert_eq!(rolling.status, RoundStatus::Rolling);
        assert!(matches!(events[0], RoundEvent::RoundRolling { round_id: 1 }));

        assert!(start_rolling(&rolling).is_err());
    }

    #[test]
    fn test_draw_is_deterministic() {
        let mut round = active_round();
        for (user, value) in [("u1", dec!(10)), ("u2", dec!(20)), ("u3", dec!(70))] {
            let (next, _) = apply_deposit(
                &round,
                &UserProfile::sample(user),
                items_worth(user, &[value]),
                &rules(),
                Utc::now(),
            )
            .unwrap();
            round = next;
        }
        let (rolling, _) = start_rolling(&round).unwrap();

        let a = draw(&rolling, "fixed-client-seed".to_string()).unwrap();
        let b = draw(&rolling, "fixed-client-seed".to_string()).unwrap();
        assert_eq!(a.winning_ticket, b.winning_ticket);
        assert_eq!(a.winner_index, b.winner_index);
        assert_eq!(a.provable_hash, b.provable_hash);
        assert_eq!(rolling.total_tickets, 10000);
        assert!(a.winning_ticket < 10000);
    }

    #[test]
    fn test_draw_requires_rolling() {
        let round = active_round();
        assert!(draw(&round, "seed".to_string()).is_err());
    }

    #[test]
    fn test_complete_reveals_seeds_and_deducts_tax() {
        let mut round = active_round();
        let (next, _) = apply_deposit(
            &round,
            &UserProfile::sample("u1"),
            items_worth("u1", &[dec!(100)]),
            &rules(),
            Utc::now(),
        )
        .unwrap();
        round = next;
        let (rolling, _) = start_rolling(&round).unwrap();
        let outcome = draw(&rolling, "client".to_string()).unwrap();

        let tax = TaxAssessment {
            asset_ids: vec![rolling.items[0].asset_id.clone()],
            value: dec!(100),
        };
        let (done, events) = complete(&rolling, &outcome, &tax).unwrap();

        assert_eq!(done.status, RoundStatus::Completed);
        assert_eq!(done.winner.as_deref(), Some("u1"));
        assert_eq!(done.total_value, Decimal::ZERO);
        assert_eq!(done.tax_value, dec!(100));
        assert!(done.payout_items().is_empty());
        assert!(done.client_seed.is_some());

        match &events[0] {
            RoundEvent::WinnerSelected {
                user_id,
                server_seed,
                ..
            } => {
                assert_eq!(user_id, "u1");
                assert_eq!(server_seed, &done.server_seed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            events[1],
            RoundEvent::RoundClosed { errored: false, .. }
        ));

        // Terminal: no further deposits.
        let result = apply_deposit(
            &done,
            &UserProfile::sample("u2"),
            items_worth("u2", &[dec!(1)]),
            &rules(),
            Utc::now(),
        );
        assert!(matches!(result, Err(EngineError::RoundClosed)));
    }

    #[test]
    fn test_complete_empty_round() {
        let round = active_round();
        let (done, events) = complete_empty(&round).unwrap();
        assert_eq!(done.status, RoundStatus::Completed);
        assert!(done.winner.is_none());
        assert!(matches!(
            events[0],
            RoundEvent::RoundClosed { errored: false, .. }
        ));
    }

    #[test]
    fn test_complete_empty_rejects_populated_round() {
        let round = active_round();
        let (round, _) = apply_deposit(
            &round,
            &UserProfile::sample("u1"),
            items_worth("u1", &[dec!(1)]),
            &rules(),
            Utc::now(),
        )
        .unwrap();
        assert!(complete_empty(&round).is_err());
    }

    #[test]
    fn test_fail_marks_error() {
        let round = active_round();
        let (failed, events) = fail(&round);
        assert_eq!(failed.status, RoundStatus::Error);
        assert!(matches!(
            events[0],
            RoundEvent::RoundClosed { errored: true, .. }
        ));
    }
}
