//! Wager selection.
//!
//! Three rules are tried in order and the first one that yields a candidate
//! fitting the daily budget wins:
//!
//! 1. **Arbitrage** – the board offers more than an external reference price.
//!    Every such option is tried in board order until one fits the budget.
//! 2. **Equilibrium** – the crowd's stake distribution, blended with the
//!    reference (or neutral) probability, makes an option look underpriced.
//! 3. **Fallback** – the highest offered odds at or above the minimum.
//!
//! Selection is a pure function of its inputs; the risk state is only read.

use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::db::models::{Match, MatchOption, ReferenceOdds};

use super::kelly::{implied_probability, kelly_fraction, proposed_stake, value, MAX_STAKE_FRACTION};
use super::odds_cache::reference_for;
use super::risk::RiskState;

/// The option and stake picked by a selection rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Wager {
    pub option: MatchOption,
    pub stake: f64,
}

/// Result of [`DecisionEngine::select`], tagged by the rule that fired.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Arbitrage(Wager),
    Equilibrium(Wager),
    Fallback(Wager),
    NoDecision,
}

impl Decision {
    pub fn wager(&self) -> Option<&Wager> {
        match self {
            Decision::Arbitrage(w) | Decision::Equilibrium(w) | Decision::Fallback(w) => Some(w),
            Decision::NoDecision => None,
        }
    }

    /// Name of the rule that produced this decision.
    pub fn rule(&self) -> &'static str {
        match self {
            Decision::Arbitrage(_) => "arbitrage",
            Decision::Equilibrium(_) => "equilibrium",
            Decision::Fallback(_) => "fallback",
            Decision::NoDecision => "none",
        }
    }
}

/// Tunables read by the selection rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionParams {
    pub min_odds: f64,
    pub bet_amount: f64,
    pub max_daily_bet_fraction: f64,
    pub stop_loss_fraction: f64,
}

impl From<&Config> for DecisionParams {
    fn from(c: &Config) -> Self {
        DecisionParams {
            min_odds: c.min_odds,
            bet_amount: c.bet_amount,
            max_daily_bet_fraction: c.max_daily_bet_fraction,
            stop_loss_fraction: c.stop_loss_fraction,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    params: DecisionParams,
}

impl DecisionEngine {
    pub fn new(params: DecisionParams) -> Self {
        DecisionEngine { params }
    }

    pub fn params(&self) -> &DecisionParams {
        &self.params
    }

    /// Pick an option and stake for `m`, or [`Decision::NoDecision`].
    pub fn select(
        &self,
        m: &Match,
        balance: f64,
        reference: &ReferenceOdds,
        risk: &RiskState,
    ) -> Decision {
        if !(balance.is_finite() && balance > 0.0) || m.options.is_empty() {
            return Decision::NoDecision;
        }
        if risk.stop_loss_hit(balance, self.params.stop_loss_fraction) {
            debug!("Match {}: stop-loss reached, no decision", m.id);
            return Decision::NoDecision;
        }

        if let Some(w) = self.arbitrage(m, balance, reference, risk) {
            return Decision::Arbitrage(w);
        }
        if let Some(w) = self.equilibrium(m, balance, reference) {
            if self.fits_budget(&w, balance, risk) {
                return Decision::Equilibrium(w);
            }
            debug!("Match {}: equilibrium stake {:.2} over budget", m.id, w.stake);
        }
        if let Some(w) = self.fallback(m, balance) {
            if self.fits_budget(&w, balance, risk) {
                return Decision::Fallback(w);
            }
            debug!("Match {}: fallback stake {:.2} over budget", m.id, w.stake);
        }
        Decision::NoDecision
    }

    fn eligible(&self, opt: &MatchOption) -> bool {
        opt.odds.is_finite() && opt.odds > 1.0 && opt.odds >= self.params.min_odds
    }

    fn fits_budget(&self, w: &Wager, balance: f64, risk: &RiskState) -> bool {
        w.stake > 0.0
            && risk.cumulative_stake() + w.stake
                <= balance * self.params.max_daily_bet_fraction + 1e-9
    }

    /// First option (board order) whose offered odds beat its reference and
    /// whose stake fits the remaining budget.
    fn arbitrage(
        &self,
        m: &Match,
        balance: f64,
        reference: &ReferenceOdds,
        risk: &RiskState,
    ) -> Option<Wager> {
        m.options.iter().find_map(|opt| {
            let ref_odds = reference_for(reference, &opt.text)?;
            if !(self.eligible(opt) && opt.odds > ref_odds) {
                return None;
            }
            let f = kelly_fraction(opt.odds, implied_probability(Some(ref_odds)));
            let w = Wager {
                option: opt.clone(),
                stake: proposed_stake(f, balance, self.params.bet_amount),
            };
            if !self.fits_budget(&w, balance, risk) {
                debug!(
                    "Match {}: arbitrage on '{}' ({:.2}) over budget",
                    m.id, opt.text, w.stake
                );
                return None;
            }
            Some(w)
        })
    }

    /// Option with the best crowd-weighted value; skipped when nobody has
    /// backed anything yet.
    fn equilibrium(&self, m: &Match, balance: f64, reference: &ReferenceOdds) -> Option<Wager> {
        let total = m.backed_total();
        if total <= 0.0 {
            return None;
        }

        let mut best: Option<(&MatchOption, f64, f64)> = None;
        for opt in m.options.iter().filter(|o| self.eligible(o)) {
            let weight = opt.backed_total.max(0.0) / total;
            let p_ext = implied_probability(reference_for(reference, &opt.text));
            let p_adj = p_ext * weight / (1.0 + m.tax_rate.max(0.0));
            let v = value(p_adj, opt.odds);
            // strict > keeps the earliest option on ties
            if v > 0.0 && best.map_or(true, |(_, best_v, _)| v > best_v) {
                best = Some((opt, v, p_adj));
            }
        }

        let (opt, _, p_adj) = best?;
        let f = kelly_fraction(opt.odds, p_adj);
        Some(Wager {
            option: opt.clone(),
            stake: proposed_stake(f, balance, self.params.bet_amount),
        })
    }

    /// Highest offered odds among eligible options.
    fn fallback(&self, m: &Match, balance: f64) -> Option<Wager> {
        let mut best: Option<&MatchOption> = None;
        for opt in m.options.iter().filter(|o| self.eligible(o)) {
            if best.map_or(true, |b| opt.odds > b.odds) {
                best = Some(opt);
            }
        }
        best.map(|opt| Wager {
            option: opt.clone(),
            stake: self.params.bet_amount.min(MAX_STAKE_FRACTION * balance),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wager::risk::today;
    use crate::wager::testkit::{make_match, make_option};
    use approx::assert_relative_eq;

    fn engine() -> DecisionEngine {
        DecisionEngine::new(DecisionParams {
            min_odds: 1.5,
            bet_amount: 100.0,
            max_daily_bet_fraction: 0.2,
            stop_loss_fraction: 0.2,
        })
    }

    fn fresh_risk() -> RiskState {
        RiskState::new(today())
    }

    fn reference(pairs: &[(&str, f64)]) -> ReferenceOdds {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn m1() -> Match {
        make_match(
            "M1",
            vec![make_option("A", 2.0, 50.0), make_option("B", 1.8, 50.0)],
        )
    }

    #[test]
    fn test_arbitrage_scenario() {
        let d = engine().select(&m1(), 1000.0, &reference(&[("A", 1.5)]), &fresh_risk());
        match d {
            Decision::Arbitrage(w) => {
                assert_eq!(w.option.id, "A");
                assert_relative_eq!(w.stake, 100.0, epsilon = 1e-9);
            }
            other => panic!("Expected Arbitrage, got {:?}", other),
        }
    }

    #[test]
    fn test_budget_exhausted_yields_no_decision() {
        let mut risk = fresh_risk();
        risk.committed_stake = 850.0;
        let d = engine().select(&m1(), 1000.0, &reference(&[("A", 1.5)]), &risk);
        assert_eq!(d, Decision::NoDecision);
    }

    #[test]
    fn test_no_eligible_option() {
        let m = make_match(
            "M2",
            vec![make_option("A", 1.4, 10.0), make_option("B", 1.2, 90.0)],
        );
        let d = engine().select(&m, 1000.0, &reference(&[("A", 1.1)]), &fresh_risk());
        assert_eq!(d, Decision::NoDecision);
    }

    #[test]
    fn test_odds_at_one_never_eligible_even_with_low_min() {
        let e = DecisionEngine::new(DecisionParams {
            min_odds: 0.5,
            ..*engine().params()
        });
        let m = make_match("M3", vec![make_option("A", 1.0, 10.0)]);
        assert_eq!(e.select(&m, 1000.0, &ReferenceOdds::new(), &fresh_risk()), Decision::NoDecision);
    }

    #[test]
    fn test_arbitrage_requires_strictly_better_odds() {
        // Offered equals reference → no arbitrage; crowd is empty → fallback
        let m = make_match(
            "M4",
            vec![make_option("A", 2.0, 0.0), make_option("B", 1.6, 0.0)],
        );
        let d = engine().select(&m, 1000.0, &reference(&[("A", 2.0)]), &fresh_risk());
        assert_eq!(d.rule(), "fallback");
    }

    #[test]
    fn test_equilibrium_picks_crowd_weighted_value() {
        // No reference: p_ext = 0.5. A: weight 0.9 → p_adj 0.45, value 0.05.
        let m = make_match(
            "M5",
            vec![make_option("A", 2.5, 900.0), make_option("B", 1.6, 100.0)],
        );
        match engine().select(&m, 1000.0, &ReferenceOdds::new(), &fresh_risk()) {
            Decision::Equilibrium(w) => {
                assert_eq!(w.option.id, "A");
                // b = 1.5, p = 0.45 → f = (0.675 − 0.55) / 1.5
                assert_relative_eq!(w.stake, 1000.0 * (0.125 / 1.5), epsilon = 1e-9);
            }
            other => panic!("Expected Equilibrium, got {:?}", other),
        }
    }

    #[test]
    fn test_equilibrium_discounts_tax() {
        // Same as above but a 20% rake pushes value negative → fallback
        let mut m = make_match(
            "M6",
            vec![make_option("A", 2.5, 900.0), make_option("B", 1.6, 100.0)],
        );
        m.tax_rate = 0.2;
        let d = engine().select(&m, 1000.0, &ReferenceOdds::new(), &fresh_risk());
        assert_eq!(d.rule(), "fallback");
        assert_eq!(d.wager().unwrap().option.id, "A");
    }

    #[test]
    fn test_fallback_picks_highest_odds() {
        let m = make_match(
            "M7",
            vec![
                make_option("A", 1.6, 0.0),
                make_option("B", 1.9, 0.0),
                make_option("C", 1.3, 0.0),
            ],
        );
        match engine().select(&m, 1000.0, &ReferenceOdds::new(), &fresh_risk()) {
            Decision::Fallback(w) => {
                assert_eq!(w.option.id, "B");
                assert_relative_eq!(w.stake, 100.0, epsilon = 1e-9);
            }
            other => panic!("Expected Fallback, got {:?}", other),
        }
    }

    #[test]
    fn test_fallback_tie_keeps_board_order() {
        let m = make_match(
            "M8",
            vec![make_option("A", 1.9, 0.0), make_option("B", 1.9, 0.0)],
        );
        let d = engine().select(&m, 1000.0, &ReferenceOdds::new(), &fresh_risk());
        assert_eq!(d.wager().unwrap().option.id, "A");
    }

    #[test]
    fn test_over_budget_rule_falls_through() {
        // Arbitrage proposes 100 but only 60 is left; fallback stake is also
        // 100, so nothing fits.
        let mut risk = fresh_risk();
        risk.committed_stake = 140.0;
        let d = engine().select(&m1(), 1000.0, &reference(&[("A", 1.5)]), &risk);
        assert_eq!(d, Decision::NoDecision);

        // With a smaller Kelly share the arbitrage stake fits.
        let small_edge = reference(&[("A", 1.9)]);
        let d = engine().select(&m1(), 1000.0, &small_edge, &risk);
        assert_eq!(d.rule(), "arbitrage");
    }

    #[test]
    fn test_arbitrage_moves_to_next_option_that_fits() {
        // A (2.0 vs 1.5) wants 100 but only 60 is left; B (1.8 vs 1.75)
        // has a thinner edge whose Kelly stake fits.
        let mut risk = fresh_risk();
        risk.committed_stake = 140.0;
        let refs = reference(&[("A", 1.5), ("B", 1.75)]);
        match engine().select(&m1(), 1000.0, &refs, &risk) {
            Decision::Arbitrage(w) => {
                assert_eq!(w.option.id, "B");
                // b = 0.8, p = 1/1.75 → f = (0.8p − (1 − p)) / 0.8
                let p = 1.0 / 1.75;
                let f = (0.8 * p - (1.0 - p)) / 0.8;
                assert_relative_eq!(w.stake, 1000.0 * f, epsilon = 1e-6);
            }
            other => panic!("Expected Arbitrage on B, got {:?}", other),
        }
    }

    #[test]
    fn test_accepted_stake_within_remaining_budget() {
        let m = m1();
        let refs = reference(&[("A", 1.5)]);
        for (balance, committed) in [(1000.0, 0.0), (1000.0, 90.0), (400.0, 20.0), (5000.0, 900.0)] {
            let mut risk = fresh_risk();
            risk.committed_stake = committed;
            if let Some(w) = engine().select(&m, balance, &refs, &risk).wager() {
                assert!(w.stake <= balance * 0.2 - committed + 1e-9);
                assert!(w.stake <= balance * MAX_STAKE_FRACTION + 1e-9);
            }
        }
    }

    #[test]
    fn test_stop_loss_blocks_selection() {
        let mut risk = fresh_risk();
        risk.cumulative_loss = 250.0;
        let d = engine().select(&m1(), 1000.0, &reference(&[("A", 1.5)]), &risk);
        assert_eq!(d, Decision::NoDecision);
    }

    #[test]
    fn test_zero_balance_no_decision() {
        let d = engine().select(&m1(), 0.0, &ReferenceOdds::new(), &fresh_risk());
        assert_eq!(d, Decision::NoDecision);
    }
}
