//! Fairness engine — commitment generation, winner-ticket derivation,
//! verification, and tax withholding.
//!
//! Everything here is deterministic and side-effect-free (seed generation
//! aside), so external verifiers can reproduce every draw bit-for-bit.

pub mod commitment;
pub mod tax;

pub use commitment::{
    derive_ticket, generate_client_seed, generate_server_seed, provable_hash, seed_hash,
    tickets_for_value, verify, winner_index, Checkpoint, VerificationInput, VerificationReport,
};
pub use tax::{assess, TaxAssessment, TaxPolicy};
