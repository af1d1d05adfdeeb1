use std::time::Instant;

use tracing::{debug, info};

use super::error::{EngineError, EngineResult};
use super::paths::{
    CancellationToken, SECURITIES_STREAM, generate_growth_factors_with_cancel, map_rows_in_blocks,
    resolve_seed, sample_row_indices, stream_seed,
};
use super::stats::{percentile_bands, scenario_summary, summarize};
use super::types::{
    InvestmentRequest, InvestmentResult, MONTHS_PER_YEAR, PathMatrix, ScenarioKind,
};

struct InvestmentRow {
    untaxed: Vec<f64>,
    taxed: Vec<f64>,
}

pub fn validate_investment(request: &InvestmentRequest) -> EngineResult<()> {
    request.settings.validate()?;
    request.forecast_params.validate("forecast_params")?;
    request.profile.validate(request.settings.simulation_years)?;
    for (label, value) in [
        ("tax_rate", request.tax_rate),
        ("transaction_fee", request.transaction_fee),
        ("percentage_management_fee", request.percentage_management_fee),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(EngineError::invalid_parameter(format!(
                "{label} must be between 0 and 100"
            )));
        }
    }
    if !request.fixed_management_fee.is_finite() || request.fixed_management_fee < 0.0 {
        return Err(EngineError::invalid_parameter(
            "fixed_management_fee must be >= 0",
        ));
    }
    Ok(())
}

/// Balance after paying `tax_rate` percent on the gain over `basis`.
pub fn after_tax_value(value: f64, basis: f64, tax_rate: f64) -> f64 {
    value - (tax_rate / 100.0) * (value - basis).max(0.0)
}

/// Cumulative principal put in by the end of each month; entry 0 is savings.
pub fn contributions_to_date(request: &InvestmentRequest) -> Vec<f64> {
    let n_months = request.settings.n_months();
    let mut contributed = Vec::with_capacity(n_months + 1);
    let mut total = request.profile.savings;
    contributed.push(total);
    for month in 1..=n_months {
        total += request.profile.income_for_month(month);
        contributed.push(total);
    }
    contributed
}

pub fn simulate_investment(request: &InvestmentRequest) -> EngineResult<InvestmentResult> {
    simulate_investment_with_cancel(request, &CancellationToken::new())
}

pub fn simulate_investment_with_cancel(
    request: &InvestmentRequest,
    cancel: &CancellationToken,
) -> EngineResult<InvestmentResult> {
    validate_investment(request)?;

    let started = Instant::now();
    let settings = request.settings;
    let n_months = settings.n_months();
    let seed = resolve_seed(settings.seed);
    debug!(
        n_sim = settings.n_sim,
        years = settings.simulation_years,
        seed,
        "running investment scenario"
    );

    let growth = generate_growth_factors_with_cancel(
        request.forecast_params,
        settings.n_sim,
        n_months,
        Some(stream_seed(seed, SECURITIES_STREAM)),
        cancel,
    )?;
    let contributed = contributions_to_date(request);

    let rows = map_rows_in_blocks(settings.n_sim, cancel, |row| {
        simulate_row(request, growth.row(row), &contributed)
    })?;
    let (untaxed_rows, taxed_rows): (Vec<_>, Vec<_>) =
        rows.into_iter().map(|r| (r.untaxed, r.taxed)).unzip();
    let untaxed = PathMatrix::from_rows(untaxed_rows)?;
    let taxed = PathMatrix::from_rows(taxed_rows)?;

    let final_value_untaxed = summarize(&untaxed);
    let final_value_taxed = summarize(&taxed);
    let total_contributed = contributed[n_months];
    let summary = scenario_summary(
        ScenarioKind::Investment,
        &final_value_taxed,
        total_contributed,
        settings.simulation_years,
        settings.n_sim,
    );

    let sampled = settings
        .path_sample
        .map(|k| sample_row_indices(settings.n_sim, k, seed));

    info!(
        n_sim = settings.n_sim,
        median_taxed = final_value_taxed.median,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "investment scenario complete"
    );

    Ok(InvestmentResult {
        summary,
        final_value_untaxed,
        final_value_taxed,
        total_contributed,
        investment_bands: percentile_bands(&taxed),
        investment_paths_untaxed: sampled.as_deref().map(|idx| untaxed.select_rows(idx)),
        investment_paths_taxed: sampled.as_deref().map(|idx| taxed.select_rows(idx)),
    })
}

/// Monthly order: market return, contribution net of transaction fee, fixed
/// fee, and every twelfth month the percentage fee.
fn simulate_row(request: &InvestmentRequest, growth: &[f64], contributed: &[f64]) -> InvestmentRow {
    let fee_keep = 1.0 - request.transaction_fee / 100.0;
    let annual_fee_keep = 1.0 - request.percentage_management_fee / 100.0;
    let n_months = growth.len() - 1;

    let mut untaxed = Vec::with_capacity(n_months + 1);
    let mut taxed = Vec::with_capacity(n_months + 1);

    let mut balance = if request.initial_already_invested {
        request.profile.savings
    } else {
        request.profile.savings * fee_keep
    };
    untaxed.push(balance);
    taxed.push(after_tax_value(balance, contributed[0], request.tax_rate));

    for month in 1..=n_months {
        balance *= growth[month];

        let contribution = request.profile.income_for_month(month);
        balance += if contribution > 0.0 {
            contribution * fee_keep
        } else {
            contribution
        };
        balance -= request.fixed_management_fee;
        if month % MONTHS_PER_YEAR == 0 {
            balance *= annual_fee_keep;
        }
        balance = balance.max(0.0);

        untaxed.push(balance);
        taxed.push(after_tax_value(balance, contributed[month], request.tax_rate));
    }

    InvestmentRow { untaxed, taxed }
}
