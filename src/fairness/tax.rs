//! Tax withholding.
//!
//! Above a pot-value threshold, a slice of the pot is withheld as operator
//! revenue, realized as specific low-value items. Cheapest items are taken
//! first (ties by encounter order) until the withheld value reaches the
//! target percentage, without ever crossing the cap percentage. Taking the
//! cheapest items first keeps the number of withheld items small, which
//! keeps payout packaging simple.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::types::PotItem;

/// Withholding policy: kicks in at `threshold`, targets `min_pct` percent of
/// the pot, never exceeds `max_pct` percent.
#[derive(Debug, Clone)]
pub struct TaxPolicy {
    pub threshold: Decimal,
    pub min_pct: Decimal,
    pub max_pct: Decimal,
}

/// The withheld item set and its total value.
#[derive(Debug, Clone, Default)]
pub struct TaxAssessment {
    pub asset_ids: Vec<String>,
    pub value: Decimal,
}

impl TaxAssessment {
    pub fn is_empty(&self) -> bool {
        self.asset_ids.is_empty()
    }
}

/// Assess tax for a pot. Returns an empty assessment below the threshold.
///
/// The minimum is a target (it may be unreachable when every remaining item
/// would cross the cap); the cap is a hard bound.
pub fn assess(items: &[PotItem], pot_value: Decimal, policy: &TaxPolicy) -> TaxAssessment {
    if pot_value < policy.threshold {
        return TaxAssessment::default();
    }

    let hundred = dec!(100);
    let target = pot_value * policy.min_pct / hundred;
    let cap = pot_value * policy.max_pct / hundred;

    // Stable sort: equal prices keep their encounter order.
    let mut order: Vec<&PotItem> = items.iter().collect();
    order.sort_by(|a, b| a.price.cmp(&b.price));

    let mut assessment = TaxAssessment::default();
    for item in order {
        if assessment.value >= target {
            break;
        }
        // Ascending prices: once one item would cross the cap, so would all
        // remaining ones.
        if assessment.value + item.price > cap {
            break;
        }
        assessment.asset_ids.push(item.asset_id.clone());
        assessment.value += item.price;
    }

    assessment
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
