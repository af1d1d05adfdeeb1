//! Multi-track mortgage amortization ("Shpitzer" annuity schedules).
//!
//! Every track runs the same monthly loop: index the balance (CPI-linked
//! tracks only), resolve the month's annual rate, pay the annuity that
//! clears the remaining balance over the remaining term. The payment is
//! recomputed only when the rate or the indexed balance changes, so a
//! Fixed track pays one constant amount and an Adjustable track pays a
//! constant amount within each reset segment.

use std::collections::BTreeMap;

use serde::Serialize;

use super::error::{EngineError, EngineResult};
use super::types::{MortgagePlan, MortgageTrack, RateEnvironment};

/// Largest gap tolerated between the plan's principal and the financed amount.
pub const FINANCING_TOLERANCE: f64 = 0.01;

/// Monthly schedule for one track over a simulation horizon.
///
/// All vectors have `horizon_months + 1` entries. Entry 0 holds the opening
/// balance and no flows; months past the end of the term are zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSchedule {
    pub payment: Vec<f64>,
    pub interest: Vec<f64>,
    pub principal_paid: Vec<f64>,
    pub balance: Vec<f64>,
    /// Annual rate in percent applied in each month.
    pub rate: Vec<f64>,
}

impl TrackSchedule {
    fn zeros(horizon_months: usize) -> Self {
        Self {
            payment: vec![0.0; horizon_months + 1],
            interest: vec![0.0; horizon_months + 1],
            principal_paid: vec![0.0; horizon_months + 1],
            balance: vec![0.0; horizon_months + 1],
            rate: vec![0.0; horizon_months + 1],
        }
    }

    pub fn horizon_months(&self) -> usize {
        self.payment.len() - 1
    }

    /// Payment due in the first month.
    pub fn monthly_payment(&self) -> f64 {
        self.payment.get(1).copied().unwrap_or(0.0)
    }

    pub fn total_paid(&self) -> f64 {
        self.payment.iter().sum()
    }

    pub fn total_interest(&self) -> f64 {
        self.interest.iter().sum()
    }

    /// Sum of scheduled payments from `month` (1-based) to the horizon.
    pub fn remaining_payments(&self, month: usize) -> f64 {
        self.payment.iter().skip(month.max(1)).sum()
    }
}

/// Element-wise sum of every track in a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSchedule {
    pub payment: Vec<f64>,
    pub interest: Vec<f64>,
    pub principal_paid: Vec<f64>,
    pub balance: Vec<f64>,
}

impl AggregateSchedule {
    pub fn zeros(horizon_months: usize) -> Self {
        Self {
            payment: vec![0.0; horizon_months + 1],
            interest: vec![0.0; horizon_months + 1],
            principal_paid: vec![0.0; horizon_months + 1],
            balance: vec![0.0; horizon_months + 1],
        }
    }

    pub fn horizon_months(&self) -> usize {
        self.payment.len() - 1
    }

    pub fn add(&mut self, track: &TrackSchedule) {
        debug_assert_eq!(self.payment.len(), track.payment.len());
        for (acc, v) in [
            (&mut self.payment, &track.payment),
            (&mut self.interest, &track.interest),
            (&mut self.principal_paid, &track.principal_paid),
            (&mut self.balance, &track.balance),
        ] {
            for (a, b) in acc.iter_mut().zip(v) {
                *a += b;
            }
        }
    }

    pub fn total_paid(&self) -> f64 {
        self.payment.iter().sum()
    }

    pub fn total_interest(&self) -> f64 {
        self.interest.iter().sum()
    }

    pub fn remaining_payments(&self, month: usize) -> f64 {
        self.payment.iter().skip(month.max(1)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSchedules {
    pub tracks: BTreeMap<String, TrackSchedule>,
    pub total: AggregateSchedule,
}

pub fn aggregate<'a>(
    schedules: impl IntoIterator<Item = &'a TrackSchedule>,
    horizon_months: usize,
) -> AggregateSchedule {
    let mut total = AggregateSchedule::zeros(horizon_months);
    for schedule in schedules {
        total.add(schedule);
    }
    total
}

/// Amortizes every track of `plan`. CPI-linked tracks all use `cpi_index`.
pub fn amortize_plan(
    plan: &MortgagePlan,
    horizon_months: usize,
    rates: &RateEnvironment,
    cpi_index: Option<&[f64]>,
) -> EngineResult<PlanSchedules> {
    let mut tracks = BTreeMap::new();
    for (name, track) in plan.iter() {
        let schedule = amortize(name, track, horizon_months, rates, cpi_index)?;
        tracks.insert(name.clone(), schedule);
    }
    let total = aggregate(tracks.values(), horizon_months);
    Ok(PlanSchedules { tracks, total })
}

/// Checks that the plan funds exactly `financed_amount`.
pub fn validate_financing(plan: &MortgagePlan, financed_amount: f64) -> EngineResult<()> {
    let total = plan.total_principal();
    if (total - financed_amount).abs() > FINANCING_TOLERANCE {
        return Err(EngineError::invalid_mortgage(
            "<plan>",
            format!("track principals sum to {total:.2}, financed amount is {financed_amount:.2}"),
        ));
    }
    Ok(())
}

/// Static checks plus rate resolution for every month the track is active
/// within the horizon.
pub fn validate_track(
    name: &str,
    track: &MortgageTrack,
    horizon_months: usize,
    rates: &RateEnvironment,
) -> EngineResult<()> {
    let principal = track.principal();
    if !principal.is_finite() || principal <= 0.0 {
        return Err(EngineError::invalid_mortgage(name, "principal must be > 0"));
    }
    if track.term_years() == 0 {
        return Err(EngineError::invalid_mortgage(name, "term_years must be > 0"));
    }
    if !track.interest_rate().is_finite() {
        return Err(EngineError::invalid_mortgage(name, "interest_rate must be finite"));
    }
    match track {
        MortgageTrack::Prime {
            spread, rate_floor, ..
        } => {
            if !spread.is_finite() {
                return Err(EngineError::invalid_mortgage(name, "spread must be finite"));
            }
            if let Some(floor) = rate_floor {
                if !floor.is_finite() || *floor < 0.0 {
                    return Err(EngineError::invalid_mortgage(name, "rate_floor must be >= 0"));
                }
            }
        }
        MortgageTrack::Adjustable {
            reset_interval_months,
            reference_rates,
            ..
        }
        | MortgageTrack::AdjustableCpiLinked {
            reset_interval_months,
            reference_rates,
            ..
        } => {
            if *reset_interval_months == 0 {
                return Err(EngineError::invalid_mortgage(
                    name,
                    "reset_interval_months must be > 0",
                ));
            }
            if reference_rates.iter().any(|r| !r.is_finite()) {
                return Err(EngineError::invalid_mortgage(
                    name,
                    "reference_rates must be finite",
                ));
            }
        }
        MortgageTrack::Fixed { .. } | MortgageTrack::CpiLinked { .. } => {}
    }

    let active = track.term_months().min(horizon_months);
    for month in 1..=active {
        let rate = rate_for_month(name, track, month, rates)?;
        if rate <= -1200.0 {
            return Err(EngineError::invalid_mortgage(
                name,
                format!("rate {rate}% in month {month} is not a valid annual rate"),
            ));
        }
    }
    Ok(())
}

/// Annual rate in percent for a 1-based month.
pub fn rate_for_month(
    name: &str,
    track: &MortgageTrack,
    month: usize,
    rates: &RateEnvironment,
) -> EngineResult<f64> {
    match track {
        MortgageTrack::Fixed { interest_rate, .. }
        | MortgageTrack::CpiLinked { interest_rate, .. } => Ok(*interest_rate),
        MortgageTrack::Prime {
            interest_rate,
            spread,
            rate_floor,
            ..
        } => {
            let prime = rates
                .prime_rate_path
                .as_deref()
                .and_then(|path| path.get(month - 1).or(path.last()))
                .copied()
                .unwrap_or(*interest_rate);
            let combined = prime + spread;
            if combined >= 0.0 {
                return Ok(combined);
            }
            match rate_floor {
                Some(floor) => Ok(combined.max(*floor)),
                None => Err(EngineError::invalid_mortgage(
                    name,
                    format!(
                        "prime {prime}% + spread {spread}% is negative in month {month} and no rate_floor is set"
                    ),
                )),
            }
        }
        MortgageTrack::Adjustable {
            interest_rate,
            reset_interval_months,
            reference_rates,
            ..
        }
        | MortgageTrack::AdjustableCpiLinked {
            interest_rate,
            reset_interval_months,
            reference_rates,
            ..
        } => {
            let segment = (month - 1) / (*reset_interval_months).max(1) as usize;
            if segment == 0 {
                return Ok(*interest_rate);
            }
            Ok(reference_rates
                .get(segment - 1)
                .or(reference_rates.last())
                .copied()
                .unwrap_or(*interest_rate))
        }
    }
}

/// Payment that clears `balance` in `remaining_months` equal instalments.
pub fn annuity_payment(balance: f64, annual_rate_pct: f64, remaining_months: usize) -> f64 {
    if remaining_months == 0 {
        return balance;
    }
    let n = remaining_months as f64;
    let r = annual_rate_pct / 100.0 / 12.0;
    if r.abs() < 1e-12 {
        return balance / n;
    }
    balance * r / (1.0 - (1.0 + r).powf(-n))
}

/// Amortizes one track over `horizon_months`.
///
/// CPI-linked tracks need `cpi_index` covering every active month (entry 0
/// is the base level). Their nominal balance grows with the index and may
/// stand above the borrowed principal during the term; the final scheduled
/// payment still clears it.
pub fn amortize(
    name: &str,
    track: &MortgageTrack,
    horizon_months: usize,
    rates: &RateEnvironment,
    cpi_index: Option<&[f64]>,
) -> EngineResult<TrackSchedule> {
    let factors = match cpi_index {
        Some(index) if track.is_cpi_linked() => {
            let active = track.term_months().min(horizon_months);
            Some(indexation_factors(name, index, active)?)
        }
        _ => None,
    };
    amortize_indexed(name, track, horizon_months, rates, factors.as_deref())
}

/// Month-over-month CPI factors from index levels; entry 0 is 1.0.
pub fn indexation_factors(
    name: &str,
    index: &[f64],
    active_months: usize,
) -> EngineResult<Vec<f64>> {
    if index.len() < active_months + 1 {
        return Err(EngineError::invalid_mortgage(
            name,
            format!(
                "CPI trajectory covers {} months, track needs {active_months}",
                index.len().saturating_sub(1)
            ),
        ));
    }
    if index[..=active_months].iter().any(|v| !v.is_finite() || *v <= 0.0) {
        return Err(EngineError::invalid_mortgage(
            name,
            "CPI index levels must be finite and > 0",
        ));
    }
    let mut factors = Vec::with_capacity(active_months + 1);
    factors.push(1.0);
    factors.extend(index[..=active_months].windows(2).map(|w| w[1] / w[0]));
    Ok(factors)
}

/// Like [`amortize`], with CPI given as per-month indexation factors.
pub fn amortize_indexed(
    name: &str,
    track: &MortgageTrack,
    horizon_months: usize,
    rates: &RateEnvironment,
    cpi_factors: Option<&[f64]>,
) -> EngineResult<TrackSchedule> {
    validate_track(name, track, horizon_months, rates)?;

    let term = track.term_months();
    let active = term.min(horizon_months);
    let cpi = if track.is_cpi_linked() {
        let factors = cpi_factors.ok_or_else(|| {
            EngineError::invalid_mortgage(name, "CPI-linked track requires a CPI trajectory")
        })?;
        if factors.len() < active + 1 {
            return Err(EngineError::invalid_mortgage(
                name,
                format!(
                    "CPI trajectory covers {} months, track needs {active}",
                    factors.len().saturating_sub(1)
                ),
            ));
        }
        if factors[1..=active].iter().any(|f| !f.is_finite() || *f <= 0.0) {
            return Err(EngineError::invalid_mortgage(
                name,
                "CPI indexation factors must be finite and > 0",
            ));
        }
        Some(factors)
    } else {
        None
    };

    let mut schedule = TrackSchedule::zeros(horizon_months);
    let mut balance = track.principal();
    schedule.balance[0] = balance;
    schedule.rate[0] = rate_for_month(name, track, 1, rates)?;

    let mut current: Option<(f64, f64)> = None;
    for month in 1..=active {
        let mut indexed = false;
        if let Some(factors) = cpi {
            let factor = factors[month];
            if factor != 1.0 {
                balance *= factor;
                indexed = true;
            }
        }

        let annual_rate = rate_for_month(name, track, month, rates)?;
        let remaining = term - month + 1;
        let monthly_rate = annual_rate / 100.0 / 12.0;
        let interest = balance * monthly_rate;

        let payment = match current {
            Some((rate, payment)) if rate == annual_rate && !indexed => payment,
            _ => annuity_payment(balance, annual_rate, remaining),
        };
        current = Some((annual_rate, payment));

        let (payment, principal_paid) = if remaining == 1 {
            (balance + interest, balance)
        } else {
            (payment, payment - interest)
        };
        balance = if remaining == 1 {
            0.0
        } else {
            balance - principal_paid
        };

        schedule.payment[month] = payment;
        schedule.interest[month] = interest;
        schedule.principal_paid[month] = principal_paid;
        schedule.balance[month] = balance;
        schedule.rate[month] = annual_rate;
    }

    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CpiSource;
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn fixed(principal: f64, term_years: u32, interest_rate: f64) -> MortgageTrack {
        MortgageTrack::Fixed {
            principal,
            term_years,
            interest_rate,
        }
    }

    fn no_market() -> RateEnvironment {
        RateEnvironment::default()
    }

    #[test]
    fn fixed_track_pays_off_exactly_at_term() {
        let track = fixed(650_000.0, 30, 4.0);
        let s = amortize("fixed", &track, 360, &no_market(), None).expect("valid");

        assert_eq!(s.balance.len(), 361);
        assert_eq!(s.balance[0], 650_000.0);
        assert_eq!(s.balance[360], 0.0);

        let r: f64 = 0.04 / 12.0;
        let expected = 650_000.0 * r * (1.0 + r).powi(360) / ((1.0 + r).powi(360) - 1.0);
        assert_approx(s.monthly_payment(), expected);
        for month in 1..360 {
            assert_eq!(s.payment[month], s.payment[1]);
        }
        assert_approx_tol(s.payment[360], expected, 1e-4);

        assert_approx_tol(s.total_interest(), s.total_paid() - 650_000.0, 1e-4);
        assert!(s.balance.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn zero_rate_track_repays_linearly() {
        let track = fixed(120_000.0, 10, 0.0);
        let s = amortize("zero", &track, 120, &no_market(), None).expect("valid");
        assert_approx(s.monthly_payment(), 1_000.0);
        assert_approx(s.total_interest(), 0.0);
        assert_eq!(s.balance[120], 0.0);
    }

    #[test]
    fn horizon_shorter_than_term_truncates_schedule() {
        let track = fixed(500_000.0, 25, 5.0);
        let s = amortize("short", &track, 60, &no_market(), None).expect("valid");
        assert_eq!(s.horizon_months(), 60);
        assert!(s.balance[60] > 0.0);
        assert!(s.balance[60] < 500_000.0);
    }

    #[test]
    fn months_after_term_are_zero() {
        let track = fixed(100_000.0, 5, 3.0);
        let s = amortize("done", &track, 120, &no_market(), None).expect("valid");
        assert_eq!(s.balance[60], 0.0);
        for month in 61..=120 {
            assert_eq!(s.payment[month], 0.0);
            assert_eq!(s.balance[month], 0.0);
        }
    }

    #[test]
    fn prime_track_adds_spread_to_reference() {
        let track = MortgageTrack::Prime {
            principal: 300_000.0,
            term_years: 20,
            interest_rate: 6.0,
            spread: -0.5,
            rate_floor: None,
        };
        let s = amortize("prime", &track, 240, &no_market(), None).expect("valid");
        assert_approx(s.rate[1], 5.5);
        assert_approx(s.monthly_payment(), annuity_payment(300_000.0, 5.5, 240));
        assert_eq!(s.balance[240], 0.0);
    }

    #[test]
    fn prime_track_follows_supplied_rate_path() {
        let track = MortgageTrack::Prime {
            principal: 100_000.0,
            term_years: 2,
            interest_rate: 6.0,
            spread: 1.0,
            rate_floor: None,
        };
        let rates = RateEnvironment {
            prime_rate_path: Some(vec![4.0, 4.0, 5.0]),
            cpi: None,
        };
        let s = amortize("prime", &track, 24, &rates, None).expect("valid");
        assert_approx(s.rate[1], 5.0);
        assert_approx(s.rate[3], 6.0);
        assert_approx(s.rate[24], 6.0);
        assert!(s.payment[3] > s.payment[2]);
        assert_eq!(s.balance[24], 0.0);
    }

    #[test]
    fn negative_prime_rate_requires_floor() {
        let mut track = MortgageTrack::Prime {
            principal: 100_000.0,
            term_years: 10,
            interest_rate: 0.25,
            spread: -0.5,
            rate_floor: None,
        };
        let err = amortize("prime", &track, 120, &no_market(), None).expect_err("negative");
        assert!(matches!(err, EngineError::InvalidMortgage { ref track, .. } if track == "prime"));

        if let MortgageTrack::Prime { rate_floor, .. } = &mut track {
            *rate_floor = Some(0.0);
        }
        let s = amortize("prime", &track, 120, &no_market(), None).expect("floored");
        assert_approx(s.rate[1], 0.0);
        assert_approx(s.monthly_payment(), 100_000.0 / 120.0);
    }

    #[test]
    fn cpi_linked_with_flat_index_matches_fixed() {
        let linked = MortgageTrack::CpiLinked {
            principal: 400_000.0,
            term_years: 15,
            interest_rate: 3.0,
        };
        let flat = vec![100.0; 181];
        let a = amortize("linked", &linked, 180, &no_market(), Some(&flat)).expect("valid");
        let b = amortize("fixed", &fixed(400_000.0, 15, 3.0), 180, &no_market(), None)
            .expect("valid");
        for month in 0..=180 {
            assert_approx_tol(a.balance[month], b.balance[month], 1e-6);
            assert_approx_tol(a.payment[month], b.payment[month], 1e-6);
        }
    }

    #[test]
    fn cpi_linked_nominal_balance_can_exceed_principal() {
        let linked = MortgageTrack::CpiLinked {
            principal: 100_000.0,
            term_years: 30,
            interest_rate: 1.0,
        };
        let index: Vec<f64> = (0..=360).map(|m| 1.005_f64.powi(m)).collect();
        let s = amortize("linked", &linked, 360, &no_market(), Some(&index)).expect("valid");

        assert!(s.balance[60] > 100_000.0);
        assert!(s.payment[120] > s.payment[1]);
        assert_eq!(s.balance[360], 0.0);

        let real_balance_24 = s.balance[24] / index[24];
        let unindexed = amortize("fixed", &fixed(100_000.0, 30, 1.0), 360, &no_market(), None)
            .expect("valid");
        assert_approx_tol(real_balance_24, unindexed.balance[24], 1e-6);
    }

    #[test]
    fn indexation_factors_reproduce_level_schedule() {
        let linked = MortgageTrack::CpiLinked {
            principal: 100_000.0,
            term_years: 10,
            interest_rate: 2.0,
        };
        let index: Vec<f64> = (0..=120).map(|m| 100.0 * 1.003_f64.powi(m)).collect();
        let factors = indexation_factors("linked", &index, 120).expect("valid");
        assert_eq!(factors[0], 1.0);
        assert_approx(factors[37], 1.003);

        let by_level =
            amortize("linked", &linked, 120, &no_market(), Some(&index)).expect("valid");
        let by_factor =
            amortize_indexed("linked", &linked, 120, &no_market(), Some(&factors)).expect("valid");
        for month in 0..=120 {
            assert_approx_tol(by_level.balance[month], by_factor.balance[month], 1e-6);
        }
    }

    #[test]
    fn deflation_past_level_underflow_still_amortizes() {
        let linked = MortgageTrack::CpiLinked {
            principal: 100_000.0,
            term_years: 30,
            interest_rate: 2.0,
        };
        // The cumulative index would fall below f64::MIN_POSITIVE long before month 360.
        let factors = [vec![1.0], vec![1e-3; 360]].concat();
        let s = amortize_indexed("linked", &linked, 360, &no_market(), Some(&factors))
            .expect("factors stay positive");
        assert!(s.balance.iter().all(|b| b.is_finite() && *b >= 0.0));
        assert_eq!(s.balance[360], 0.0);

        let bad = [vec![1.0], vec![0.0; 360]].concat();
        assert!(matches!(
            amortize_indexed("linked", &linked, 360, &no_market(), Some(&bad)),
            Err(EngineError::InvalidMortgage { .. })
        ));
    }

    #[test]
    fn cpi_linked_requires_trajectory_of_sufficient_length() {
        let linked = MortgageTrack::CpiLinked {
            principal: 100_000.0,
            term_years: 10,
            interest_rate: 2.0,
        };
        assert!(matches!(
            amortize("linked", &linked, 120, &no_market(), None),
            Err(EngineError::InvalidMortgage { .. })
        ));
        let short = vec![1.0; 13];
        assert!(matches!(
            amortize("linked", &linked, 120, &no_market(), Some(&short)),
            Err(EngineError::InvalidMortgage { .. })
        ));
        assert!(amortize("linked", &linked, 12, &no_market(), Some(&short)).is_ok());
    }

    #[test]
    fn adjustable_track_resets_rate_per_segment() {
        let track = MortgageTrack::Adjustable {
            principal: 1_000_000.0,
            term_years: 30,
            interest_rate: 3.0,
            reset_interval_months: 60,
            reference_rates: vec![3.5, 4.0, 4.5],
        };
        let s = amortize("adj", &track, 360, &no_market(), None).expect("valid");
        assert_approx(s.rate[60], 3.0);
        assert_approx(s.rate[61], 3.5);
        assert_approx(s.rate[121], 4.0);
        assert_approx(s.rate[181], 4.5);
        assert_approx(s.rate[300], 4.5);

        for month in 62..=120 {
            assert_eq!(s.payment[month], s.payment[61]);
        }
        assert_approx(s.payment[61], annuity_payment(s.balance[60], 3.5, 300));
        assert_eq!(s.balance[360], 0.0);
    }

    #[test]
    fn adjustable_cpi_linked_combines_reset_and_indexation() {
        let track = MortgageTrack::AdjustableCpiLinked {
            principal: 200_000.0,
            term_years: 10,
            interest_rate: 2.0,
            reset_interval_months: 60,
            reference_rates: vec![3.0],
        };
        let index: Vec<f64> = (0..=120).map(|m| 1.002_f64.powi(m)).collect();
        let s = amortize("adj_linked", &track, 120, &no_market(), Some(&index)).expect("valid");
        assert_approx(s.rate[61], 3.0);
        assert!(s.payment[2] > s.payment[1]);
        assert_eq!(s.balance[120], 0.0);
    }

    #[test]
    fn rejects_non_positive_principal_and_term() {
        assert!(matches!(
            amortize("a", &fixed(0.0, 30, 4.0), 360, &no_market(), None),
            Err(EngineError::InvalidMortgage { .. })
        ));
        assert!(matches!(
            amortize("b", &fixed(-5.0, 30, 4.0), 360, &no_market(), None),
            Err(EngineError::InvalidMortgage { .. })
        ));
        assert!(matches!(
            amortize("c", &fixed(100.0, 0, 4.0), 360, &no_market(), None),
            Err(EngineError::InvalidMortgage { .. })
        ));
    }

    #[test]
    fn plan_aggregation_sums_tracks() {
        let plan: MortgagePlan = [
            ("fixed", fixed(300_000.0, 30, 4.0)),
            (
                "prime",
                MortgageTrack::Prime {
                    principal: 200_000.0,
                    term_years: 20,
                    interest_rate: 5.5,
                    spread: -0.5,
                    rate_floor: None,
                },
            ),
        ]
        .into_iter()
        .collect();
        let schedules = amortize_plan(&plan, 360, &no_market(), None).expect("valid");
        let f = &schedules.tracks["fixed"];
        let p = &schedules.tracks["prime"];
        for month in 0..=360 {
            assert_approx(schedules.total.payment[month], f.payment[month] + p.payment[month]);
            assert_approx(schedules.total.balance[month], f.balance[month] + p.balance[month]);
        }
        assert_approx(schedules.total.balance[0], 500_000.0);
        assert_approx_tol(
            schedules.total.total_interest(),
            f.total_interest() + p.total_interest(),
            1e-6,
        );
        assert_approx_tol(
            schedules.total.remaining_payments(241),
            f.remaining_payments(241),
            1e-6,
        );
    }

    #[test]
    fn plan_with_linked_track_uses_series_cpi() {
        let plan: MortgagePlan = [(
            "linked",
            MortgageTrack::CpiLinked {
                principal: 100_000.0,
                term_years: 5,
                interest_rate: 2.0,
            },
        )]
        .into_iter()
        .collect();
        let index: Vec<f64> = (0..=60).map(|m| 100.0 + m as f64 * 0.2).collect();
        let rates = RateEnvironment {
            prime_rate_path: None,
            cpi: Some(CpiSource::Series {
                index: index.clone(),
            }),
        };
        let schedules = amortize_plan(&plan, 60, &rates, Some(&index)).expect("valid");
        assert_eq!(schedules.total.balance[60], 0.0);
    }

    #[test]
    fn financing_must_match_plan_principal() {
        let plan: MortgagePlan = [("fixed", fixed(500_000.0, 30, 4.0))].into_iter().collect();
        assert!(validate_financing(&plan, 500_000.0).is_ok());
        assert!(matches!(
            validate_financing(&plan, 450_000.0),
            Err(EngineError::InvalidMortgage { .. })
        ));
        assert!(validate_financing(&MortgagePlan::default(), 0.0).is_ok());
    }

    #[test]
    fn empty_aggregate_is_all_zero() {
        let total = aggregate(std::iter::empty(), 24);
        assert_eq!(total.payment.len(), 25);
        assert_eq!(total.total_paid(), 0.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(48))]

        #[test]
        fn prop_fixed_balance_reaches_zero_and_interest_reconciles(
            principal in 1_000u32..3_000_000,
            term_years in 1u32..41,
            rate_bp in 0u32..1_500
        ) {
            let principal = principal as f64;
            let rate = rate_bp as f64 / 100.0;
            let track = fixed(principal, term_years, rate);
            let months = term_years as usize * 12;
            let s = amortize("p", &track, months, &no_market(), None).expect("valid");
            prop_assert!(s.balance[months] == 0.0);
            prop_assert!(s.balance.iter().all(|b| *b >= -1e-6));
            let gap = (s.total_interest() - (s.total_paid() - principal)).abs();
            prop_assert!(gap <= 1e-6 * principal.max(1.0));
        }
    }
}
