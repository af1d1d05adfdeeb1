mod buying;
mod engine;
mod error;
mod investment;
mod mortgage;
mod paths;
mod stats;
mod types;

pub use buying::{simulate_buying, simulate_buying_with_cancel, validate_buying};
pub use engine::{ComparisonReport, ScenarioOutcome, run_scenarios, simulate_both};
pub use error::{EngineError, EngineResult};
pub use investment::{
    after_tax_value, contributions_to_date, simulate_investment, simulate_investment_with_cancel,
    validate_investment,
};
pub use mortgage::{
    AggregateSchedule, FINANCING_TOLERANCE, PlanSchedules, TrackSchedule, aggregate, amortize,
    amortize_indexed, amortize_plan, annuity_payment, indexation_factors, rate_for_month,
    validate_financing, validate_track,
};
pub use paths::{
    CancellationToken, PATH_BLOCK_ROWS, generate_growth_factors_with_cancel, generate_paths,
    generate_paths_with_cancel,
};
pub use stats::{
    annualized_return, compare, compare_summaries, percentile, percentile_bands,
    scenario_summary, summarize, summarize_values,
};
pub use types::{
    BuyingRequest, BuyingResult, Comparison, CpiSource, FinancialProfile, ForecastParams,
    InsolvencyReport, InvestmentRequest, InvestmentResult, MONTHS_PER_YEAR, MortgagePlan,
    MortgageTrack, PathMatrix, PercentileBands, PercentileSummary, RateEnvironment,
    ScenarioKind, ScenarioSummary, SimulationSettings, Winner, default_reset_interval_months,
};
