use serde::Serialize;
use tracing::info;

use super::buying::{simulate_buying_with_cancel, validate_buying};
use super::error::{EngineError, EngineResult};
use super::investment::{simulate_investment_with_cancel, validate_investment};
use super::paths::CancellationToken;
use super::stats::compare;
use super::types::{BuyingRequest, BuyingResult, Comparison, InvestmentRequest, InvestmentResult};

/// Both scenarios run over the same horizon and path count, plus their
/// head-to-head comparison.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub buying: BuyingResult,
    pub investment: InvestmentResult,
    pub comparison: Comparison,
}

/// Whatever subset of scenarios was requested. `comparison` is present only
/// when both ran.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buying: Option<BuyingResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub investment: Option<InvestmentResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<Comparison>,
}

impl From<ComparisonReport> for ScenarioOutcome {
    fn from(report: ComparisonReport) -> Self {
        Self {
            buying: Some(report.buying),
            investment: Some(report.investment),
            comparison: Some(report.comparison),
        }
    }
}

fn check_comparable(buying: &BuyingRequest, investment: &InvestmentRequest) -> EngineResult<()> {
    let (b, i) = (&buying.settings, &investment.settings);
    if b.simulation_years != i.simulation_years {
        return Err(EngineError::incomparable(format!(
            "simulation_years differ: buying {} vs investment {}",
            b.simulation_years, i.simulation_years
        )));
    }
    if b.n_sim != i.n_sim {
        return Err(EngineError::incomparable(format!(
            "n_sim differs: buying {} vs investment {}",
            b.n_sim, i.n_sim
        )));
    }
    Ok(())
}

/// Runs both scenarios in parallel and compares their medians. Inputs are
/// validated up front so neither side starts when the other is invalid.
pub fn simulate_both(
    buying: &BuyingRequest,
    investment: &InvestmentRequest,
    cancel: &CancellationToken,
) -> EngineResult<ComparisonReport> {
    check_comparable(buying, investment)?;
    validate_buying(buying)?;
    validate_investment(investment)?;

    let (buying_result, investment_result) = rayon::join(
        || simulate_buying_with_cancel(buying, cancel),
        || simulate_investment_with_cancel(investment, cancel),
    );
    let buying = buying_result?;
    let investment = investment_result?;
    let comparison = compare(&buying, &investment)?;

    info!(
        winner = ?comparison.winner,
        difference = comparison.difference,
        "scenario comparison complete"
    );

    Ok(ComparisonReport {
        buying,
        investment,
        comparison,
    })
}

pub fn run_scenarios(
    buying: Option<&BuyingRequest>,
    investment: Option<&InvestmentRequest>,
    cancel: &CancellationToken,
) -> EngineResult<ScenarioOutcome> {
    match (buying, investment) {
        (Some(b), Some(i)) => simulate_both(b, i, cancel).map(ScenarioOutcome::from),
        (Some(b), None) => Ok(ScenarioOutcome {
            buying: Some(simulate_buying_with_cancel(b, cancel)?),
            ..ScenarioOutcome::default()
        }),
        (None, Some(i)) => Ok(ScenarioOutcome {
            investment: Some(simulate_investment_with_cancel(i, cancel)?),
            ..ScenarioOutcome::default()
        }),
        (None, None) => Err(EngineError::invalid_parameter(
            "at least one scenario must be provided",
        )),
    }
}
