//! Commit-reveal draw protocol.
//!
//! A high-entropy server seed is generated and hashed at round creation;
//! the hash is public immediately, the seed only after the round completes.
//! At the draw point a fresh client seed is generated server-side, the two
//! are concatenated and hashed, and the first 4 bytes of that hash reduce
//! modulo the ticket total to the winning ticket.
//!
//! Participant iteration order is insertion order and is part of the public
//! protocol: any verifier must walk cumulative ticket ranges the same way.

use rand::RngCore;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Server seed length in bytes (hex-encoded to 64 chars).
const SERVER_SEED_BYTES: usize = 32;

/// Client seed length in bytes (hex-encoded to 32 chars).
const CLIENT_SEED_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// Seed generation & hashing
// ---------------------------------------------------------------------------

/// Generate the round's secret server seed.
pub fn generate_server_seed() -> String {
    let mut bytes = [0u8; SERVER_SEED_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate the draw-time client seed. No external input is solicited;
/// the protocol is auditable after the fact rather than interactive.
pub fn generate_client_seed() -> String {
    let mut bytes = [0u8; CLIENT_SEED_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 of a seed string, hex-encoded. Published at round creation as
/// the commitment.
pub fn seed_hash(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 of `server_seed ‖ client_seed`, hex-encoded — the reveal-time
/// hash the winning ticket is derived from.
pub fn provable_hash(server_seed: &str, client_seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(server_seed.as_bytes());
    hasher.update(client_seed.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Ticket math
// ---------------------------------------------------------------------------

/// Tickets purchased by a cumulative contributed value at the given ratio
/// (e.g. $10.00 at a $0.01 ratio → 1000 tickets). Truncates, never rounds up.
pub fn tickets_for_value(value: Decimal, ticket_ratio: Decimal) -> u64 {
    if ticket_ratio <= Decimal::ZERO {
        return 0;
    }
    (value / ticket_ratio).floor().to_u64().unwrap_or(0)
}

/// The winning ticket: first 4 bytes of the provable hash as a big-endian
/// unsigned integer, reduced modulo `total_tickets`.
///
/// Returns None for an empty pot (`total_tickets == 0`) or a malformed hash.
pub fn derive_ticket(provable_hash_hex: &str, total_tickets: u64) -> Option<u64> {
    if total_tickets == 0 {
        return None;
    }
    let prefix = provable_hash_hex.get(..8)?;
    let value = u32::from_str_radix(prefix, 16).ok()?;
    Some(u64::from(value) % total_tickets)
}

/// The index of the participant whose cumulative ticket range
/// `[before, before + tickets)` contains `winning_ticket`, walking the
/// counts in insertion order.
pub fn winner_index(ticket_counts: &[u64], winning_ticket: u64) -> Option<usize> {
    let mut cumulative: u64 = 0;
    for (index, tickets) in ticket_counts.iter().enumerate() {
        if winning_ticket < cumulative + tickets {
            return Some(index);
        }
        cumulative += tickets;
    }
    None
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// The four checkpoints of the public verification protocol, in dependency
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checkpoint {
    SeedHash,
    CombinedHash,
    DerivedTicket,
    WinnerLookup,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::SeedHash => write!(f, "seed-hash"),
            Checkpoint::CombinedHash => write!(f, "combined-hash"),
            Checkpoint::DerivedTicket => write!(f, "derived-ticket"),
            Checkpoint::WinnerLookup => write!(f, "winner-lookup"),
        }
    }
}

/// Everything a verifier needs to replay a completed draw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationInput {
    /// The revealed server seed.
    pub server_seed: String,
    /// The revealed client seed.
    pub client_seed: String,
    /// The hash published at round creation.
    pub server_seed_hash: String,
    /// The combined hash recorded at the draw point.
    pub provable_hash: String,
    pub winning_ticket: u64,
    pub total_tickets: u64,
    /// Ticket counts per participant, in insertion order.
    pub ticket_counts: Vec<u64>,
    /// The recorded winner's position in that order.
    pub winner_index: usize,
}

/// Outcome of a verification run. `failed_at` names the first checkpoint
/// that did not reproduce; later checkpoints are not evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub failed_at: Option<Checkpoint>,
}

impl VerificationReport {
    fn pass() -> Self {
        VerificationReport {
            passed: true,
            failed_at: None,
        }
    }

    fn fail(checkpoint: Checkpoint) -> Self {
        VerificationReport {
            passed: false,
            failed_at: Some(checkpoint),
        }
    }
}

/// Replay a draw from the revealed seeds and confirm equality at each of
/// the four checkpoints: hash-of-secret, combined hash, derived ticket,
/// participant lookup.
pub fn verify(input: &VerificationInput) -> VerificationReport {
    if seed_hash(&input.server_seed) != input.server_seed_hash {
        return VerificationReport::fail(Checkpoint::SeedHash);
    }

    let combined = provable_hash(&input.server_seed, &input.client_seed);
    if combined != input.provable_hash {
        return VerificationReport::fail(Checkpoint::CombinedHash);
    }

    match derive_ticket(&combined, input.total_tickets) {
        Some(ticket) if ticket == input.winning_ticket => {}
        _ => return VerificationReport::fail(Checkpoint::DerivedTicket),
    }

    match winner_index(&input.ticket_counts, input.winning_ticket) {
        Some(index) if index == input.winner_index => {}
        _ => return VerificationReport::fail(Checkpoint::WinnerLookup),
    }

    VerificationReport::pass()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
