//! Kelly Criterion sizing for decimal-odds wagers.
//!
//! Standard formula:
//!   f* = (b·p − q) / b
//! where
//!   b  = net odds received on the bet (decimal odds − 1)
//!   p  = estimated probability of winning
//!   q  = 1 − p
//!
//! The board pays out in points and a single bad read of the market can wipe
//! a day's budget, so the fraction is hard-capped at [`MAX_KELLY_FRACTION`].

/// Upper bound on the Kelly fraction of bankroll for any single wager.
pub const MAX_KELLY_FRACTION: f64 = 0.1;

/// No single wager may stake more than this fraction of the balance.
pub const MAX_STAKE_FRACTION: f64 = 0.1;

/// Probability assumed when no external signal exists for an option.
pub const NEUTRAL_PROBABILITY: f64 = 0.5;

/// Calculate the capped Kelly stake fraction.
///
/// # Arguments
/// * `odds`     – Decimal odds offered (profit + stake per unit staked).
/// * `win_prob` – Estimated probability that the wager wins (0.0–1.0).
///
/// Returns a fraction in `[0, MAX_KELLY_FRACTION]`; `0.0` when there is no
/// edge or the odds cannot pay anything.
pub fn kelly_fraction(odds: f64, win_prob: f64) -> f64 {
    let b = odds - 1.0;
    if b.is_nan() || b <= 0.0 || !win_prob.is_finite() {
        return 0.0;
    }
    let p = win_prob.clamp(0.0, 1.0);
    let q = 1.0 - p;
    let f = (b * p - q) / b;
    f.clamp(0.0, MAX_KELLY_FRACTION)
}

/// Win probability implied by a reference decimal price.
///
/// Missing or unusable references (≤ 1.0) degrade to [`NEUTRAL_PROBABILITY`].
pub fn implied_probability(reference_odds: Option<f64>) -> f64 {
    match reference_odds {
        Some(o) if o > 1.0 && o.is_finite() => 1.0 / o,
        _ => NEUTRAL_PROBABILITY,
    }
}

/// Expected value signal of an option: probability minus the break-even
/// probability implied by the offered odds.
pub fn value(win_prob: f64, odds: f64) -> f64 {
    if odds <= 0.0 {
        return f64::NEG_INFINITY;
    }
    win_prob - 1.0 / odds
}

/// Size a wager: the Kelly share of balance, capped by the configured
/// per-wager amount and by [`MAX_STAKE_FRACTION`] of the balance.
pub fn proposed_stake(fraction: f64, balance: f64, bet_amount: f64) -> f64 {
    (fraction * balance)
        .min(bet_amount)
        .min(MAX_STAKE_FRACTION * balance)
        .max(0.0)
}
