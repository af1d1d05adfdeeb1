use rayon::prelude::*;

use super::error::{EngineError, EngineResult};
use super::types::{
    BuyingResult, Comparison, InvestmentResult, PathMatrix, PercentileBands, PercentileSummary,
    ScenarioKind, ScenarioSummary, Winner,
};

/// Linear-interpolated percentile (`p` in 0..=100) over a sorted copy.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(&sorted, p)
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        sorted[lower]
    } else {
        let w = rank - lower as f64;
        sorted[lower] * (1.0 - w) + sorted[upper] * w
    }
}

pub fn summarize_values(values: &[f64]) -> PercentileSummary {
    if values.is_empty() {
        return PercentileSummary::default();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len() as f64;
    let mean = sorted.iter().sum::<f64>() / n;
    let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    PercentileSummary {
        median: percentile_sorted(&sorted, 50.0),
        p10: percentile_sorted(&sorted, 10.0),
        p90: percentile_sorted(&sorted, 90.0),
        mean,
        std: variance.sqrt(),
    }
}

/// Percentile summary of the final column.
pub fn summarize(paths: &PathMatrix) -> PercentileSummary {
    summarize_values(&paths.final_column())
}

/// p10/median/p90 for every month, for fan charts.
pub fn percentile_bands(paths: &PathMatrix) -> PercentileBands {
    let per_column: Vec<(f64, f64, f64)> = (0..paths.n_cols())
        .into_par_iter()
        .map(|col| {
            let mut column = paths.column(col);
            column.sort_by(|a, b| a.total_cmp(b));
            (
                percentile_sorted(&column, 10.0),
                percentile_sorted(&column, 50.0),
                percentile_sorted(&column, 90.0),
            )
        })
        .collect();

    let mut bands = PercentileBands {
        p10: Vec::with_capacity(per_column.len()),
        median: Vec::with_capacity(per_column.len()),
        p90: Vec::with_capacity(per_column.len()),
    };
    for (p10, median, p90) in per_column {
        bands.p10.push(p10);
        bands.median.push(median);
        bands.p90.push(p90);
    }
    bands
}

/// `(final / invested)^(1/years) - 1`. Absent without a positive base or
/// when the final value is negative; a final value of zero is a total loss.
pub fn annualized_return(final_value: f64, invested: f64, years: u32) -> Option<f64> {
    if invested <= 0.0 || final_value < 0.0 || years == 0 {
        return None;
    }
    Some((final_value / invested).powf(1.0 / years as f64) - 1.0)
}

pub fn scenario_summary(
    scenario: ScenarioKind,
    final_values: &PercentileSummary,
    total_invested: f64,
    simulation_years: u32,
    n_sim: usize,
) -> ScenarioSummary {
    ScenarioSummary {
        scenario,
        simulation_years,
        n_sim,
        median: final_values.median,
        pessimistic: final_values.p10,
        optimistic: final_values.p90,
        total_invested,
        total_return: final_values.median - total_invested,
        annualized_return: annualized_return(final_values.median, total_invested, simulation_years),
    }
}

pub fn compare(buying: &BuyingResult, investment: &InvestmentResult) -> EngineResult<Comparison> {
    compare_summaries(&buying.summary, &investment.summary)
}

/// Head-to-head on medians. Both runs must cover the same horizon with the
/// same number of paths.
pub fn compare_summaries(
    buying: &ScenarioSummary,
    investment: &ScenarioSummary,
) -> EngineResult<Comparison> {
    if buying.scenario != ScenarioKind::Buying || investment.scenario != ScenarioKind::Investment {
        return Err(EngineError::incomparable(
            "expected one buying and one investment summary",
        ));
    }
    if buying.simulation_years != investment.simulation_years {
        return Err(EngineError::incomparable(format!(
            "simulation_years differ: buying {} vs investment {}",
            buying.simulation_years, investment.simulation_years
        )));
    }
    if buying.n_sim != investment.n_sim {
        return Err(EngineError::incomparable(format!(
            "n_sim differs: buying {} vs investment {}",
            buying.n_sim, investment.n_sim
        )));
    }

    let winner = if investment.median > buying.median {
        Winner::Investment
    } else if buying.median > investment.median {
        Winner::Buying
    } else {
        Winner::Tie
    };

    Ok(Comparison {
        winner,
        difference: (investment.median - buying.median).abs(),
        buying_median: buying.median,
        investment_median: investment.median,
    })
}
