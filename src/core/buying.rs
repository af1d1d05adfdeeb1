use std::time::Instant;

use tracing::{debug, info, warn};

use super::error::{EngineError, EngineResult};
use super::mortgage::{
    AggregateSchedule, aggregate, amortize, amortize_indexed, validate_financing, validate_track,
};
use super::paths::{
    CPI_STREAM, CancellationToken, PROPERTY_STREAM, derive_seed, gbm_factor_row,
    generate_paths_with_cancel, map_rows_in_blocks, resolve_seed, sample_row_indices, stream_seed,
};
use super::stats::{percentile_bands, scenario_summary, summarize, summarize_values};
use super::types::{
    BuyingRequest, BuyingResult, CpiSource, ForecastParams, InsolvencyReport, MONTHS_PER_YEAR,
    MortgageTrack, PathMatrix, ScenarioKind,
};

#[derive(Debug)]
struct BuyingRow {
    net_equity: Vec<f64>,
    final_cash: f64,
    total_maintenance: f64,
    remaining_mortgage: f64,
    insolvent_month: Option<usize>,
}

/// Mortgage costs split by whether they depend on the simulated path.
struct MortgageCosts<'a> {
    shared: AggregateSchedule,
    per_path: Vec<(&'a String, &'a MortgageTrack)>,
    cpi_forecast: Option<ForecastParams>,
    cpi_seed: u64,
}

pub fn validate_buying(request: &BuyingRequest) -> EngineResult<()> {
    let settings = &request.settings;
    settings.validate()?;
    request.forecast_params.validate("forecast_params")?;
    request.profile.validate(settings.simulation_years)?;

    if !request.apartment_price.is_finite() || request.apartment_price <= 0.0 {
        return Err(EngineError::invalid_parameter("apartment_price must be > 0"));
    }
    if !request.down_payment.is_finite() || request.down_payment < 0.0 {
        return Err(EngineError::invalid_parameter("down_payment must be >= 0"));
    }
    if request.down_payment > request.apartment_price {
        return Err(EngineError::invalid_parameter(
            "down_payment must be <= apartment_price",
        ));
    }
    if !request.down_payment_prefunded && request.down_payment > request.profile.savings {
        return Err(EngineError::invalid_parameter(
            "down_payment must be <= savings unless it is prefunded",
        ));
    }
    if !(0.0..=100.0).contains(&request.maintenance_cost_rate) {
        return Err(EngineError::invalid_parameter(
            "maintenance_cost_rate must be between 0 and 100",
        ));
    }
    if !request.fixed_maintenance_cost.is_finite() || request.fixed_maintenance_cost < 0.0 {
        return Err(EngineError::invalid_parameter(
            "fixed_maintenance_cost must be >= 0",
        ));
    }

    validate_financing(
        &request.mortgage,
        request.apartment_price - request.down_payment,
    )?;
    let n_months = settings.n_months();
    for (name, track) in request.mortgage.iter() {
        validate_track(name, track, n_months, &request.rates)?;
        if track.is_cpi_linked() {
            match &request.rates.cpi {
                None => {
                    return Err(EngineError::invalid_mortgage(
                        name.as_str(),
                        "CPI-linked track requires a CPI source",
                    ));
                }
                Some(CpiSource::Simulated { forecast }) => forecast.validate("cpi.forecast")?,
                Some(CpiSource::Series { .. }) => {}
            }
        }
    }
    Ok(())
}

pub fn simulate_buying(request: &BuyingRequest) -> EngineResult<BuyingResult> {
    simulate_buying_with_cancel(request, &CancellationToken::new())
}

pub fn simulate_buying_with_cancel(
    request: &BuyingRequest,
    cancel: &CancellationToken,
) -> EngineResult<BuyingResult> {
    validate_buying(request)?;

    let started = Instant::now();
    let settings = request.settings;
    let n_months = settings.n_months();
    let seed = resolve_seed(settings.seed);
    debug!(
        n_sim = settings.n_sim,
        years = settings.simulation_years,
        tracks = request.mortgage.tracks.len(),
        seed,
        "running buying scenario"
    );

    let costs = mortgage_costs(request, n_months, seed)?;
    let property = generate_paths_with_cancel(
        request.apartment_price,
        request.forecast_params,
        settings.n_sim,
        n_months,
        Some(stream_seed(seed, PROPERTY_STREAM)),
        cancel,
    )?;

    let rows = map_rows_in_blocks(settings.n_sim, cancel, |row| {
        simulate_row(request, &costs, row, property.row(row))
    })?
    .into_iter()
    .collect::<EngineResult<Vec<_>>>()?;

    let mut final_net_worth = Vec::with_capacity(rows.len());
    let mut final_cash = Vec::with_capacity(rows.len());
    let mut maintenance = Vec::with_capacity(rows.len());
    let mut remaining = Vec::with_capacity(rows.len());
    let mut insolvent_paths = 0;
    let mut earliest_insolvent_month: Option<usize> = None;
    let mut equity_rows = Vec::with_capacity(rows.len());
    for row in rows {
        final_net_worth.push(row.net_equity[n_months] + row.final_cash);
        final_cash.push(row.final_cash);
        maintenance.push(row.total_maintenance);
        remaining.push(row.remaining_mortgage);
        if let Some(month) = row.insolvent_month {
            insolvent_paths += 1;
            earliest_insolvent_month =
                Some(earliest_insolvent_month.map_or(month, |m| m.min(month)));
        }
        equity_rows.push(row.net_equity);
    }
    let net_equity_paths = PathMatrix::from_rows(equity_rows)?;

    let insolvency = InsolvencyReport {
        insolvent_paths,
        insolvent_fraction: insolvent_paths as f64 / settings.n_sim as f64,
        earliest_insolvent_month,
    };
    if insolvent_paths > 0 {
        warn!(
            insolvent_paths,
            fraction = insolvency.insolvent_fraction,
            "income and savings did not cover mortgage and maintenance on some paths"
        );
    }

    let net_worth = summarize_values(&final_net_worth);
    let prefunded = if request.down_payment_prefunded {
        request.down_payment
    } else {
        0.0
    };
    let total_invested = request.profile.savings + prefunded + request.profile.total_income();
    let summary = scenario_summary(
        ScenarioKind::Buying,
        &net_worth,
        total_invested,
        settings.simulation_years,
        settings.n_sim,
    );

    let sampled = settings
        .path_sample
        .map(|k| sample_row_indices(settings.n_sim, k, seed));

    info!(
        n_sim = settings.n_sim,
        median_net_worth = net_worth.median,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "buying scenario complete"
    );

    Ok(BuyingResult {
        summary,
        final_property_value: summarize(&property),
        net_equity: summarize(&net_equity_paths),
        net_worth,
        total_maintenance_cost: summarize_values(&maintenance),
        remaining_mortgage: summarize_values(&remaining),
        cash_reserve: summarize_values(&final_cash),
        insolvency,
        mortgage_schedule: costs.shared,
        net_equity_bands: percentile_bands(&net_equity_paths),
        property_value_paths: sampled.as_deref().map(|idx| property.select_rows(idx)),
        net_equity_paths: sampled.as_deref().map(|idx| net_equity_paths.select_rows(idx)),
    })
}

/// Amortizes every track whose schedule is the same on all paths; tracks
/// indexed by a simulated CPI are deferred to the per-path loop.
fn mortgage_costs(
    request: &BuyingRequest,
    n_months: usize,
    seed: u64,
) -> EngineResult<MortgageCosts<'_>> {
    let (cpi_series, cpi_forecast) = match &request.rates.cpi {
        Some(CpiSource::Series { index }) => (Some(index.as_slice()), None),
        Some(CpiSource::Simulated { forecast }) => (None, Some(*forecast)),
        None => (None, None),
    };

    let mut shared = AggregateSchedule::zeros(n_months);
    let mut per_path = Vec::new();
    for (name, track) in request.mortgage.iter() {
        if track.is_cpi_linked() && cpi_forecast.is_some() {
            per_path.push((name, track));
            continue;
        }
        let schedule = amortize(name, track, n_months, &request.rates, cpi_series)?;
        shared.add(&schedule);
    }

    Ok(MortgageCosts {
        shared,
        per_path,
        cpi_forecast,
        cpi_seed: stream_seed(seed, CPI_STREAM),
    })
}

fn simulate_row(
    request: &BuyingRequest,
    costs: &MortgageCosts<'_>,
    row: usize,
    property: &[f64],
) -> EngineResult<BuyingRow> {
    let n_months = property.len() - 1;

    let path_schedule = match costs.cpi_forecast {
        Some(forecast) if !costs.per_path.is_empty() => {
            let cpi = gbm_factor_row(forecast, n_months, derive_seed(costs.cpi_seed, row as u64));
            let schedules = costs
                .per_path
                .iter()
                .map(|(name, track)| {
                    amortize_indexed(name, track, n_months, &request.rates, Some(cpi.as_slice()))
                })
                .collect::<EngineResult<Vec<_>>>()?;
            Some(aggregate(&schedules, n_months))
        }
        _ => None,
    };
    let balance_at = |month: usize| {
        costs.shared.balance[month] + path_schedule.as_ref().map_or(0.0, |s| s.balance[month])
    };
    let payment_at = |month: usize| {
        costs.shared.payment[month] + path_schedule.as_ref().map_or(0.0, |s| s.payment[month])
    };

    let monthly_fixed_maintenance = request.fixed_maintenance_cost / MONTHS_PER_YEAR as f64;
    let maintenance_rate = request.maintenance_cost_rate / 100.0 / MONTHS_PER_YEAR as f64;

    let mut cash = if request.down_payment_prefunded {
        request.profile.savings
    } else {
        request.profile.savings - request.down_payment
    };
    let mut total_maintenance = 0.0;
    let mut insolvent_month = None;
    let mut net_equity = Vec::with_capacity(n_months + 1);
    net_equity.push(property[0] - balance_at(0));

    for month in 1..=n_months {
        let maintenance = monthly_fixed_maintenance + maintenance_rate * property[month];
        cash += request.profile.income_for_month(month) - payment_at(month) - maintenance;
        total_maintenance += maintenance;
        if cash < 0.0 && insolvent_month.is_none() {
            insolvent_month = Some(month);
        }
        net_equity.push(property[month] - balance_at(month));
    }

    Ok(BuyingRow {
        net_equity,
        final_cash: cash,
        total_maintenance,
        remaining_mortgage: balance_at(n_months),
        insolvent_month,
    })
}
