use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{
    BuyingRequest, CancellationToken, CpiSource, FINANCING_TOLERANCE, FinancialProfile,
    ForecastParams, InvestmentRequest, MONTHS_PER_YEAR, MortgagePlan, MortgageTrack,
    RateEnvironment, SimulationSettings, run_scenarios, simulate_buying, simulate_investment,
    validate_buying, validate_investment,
};

/// Values used for anything a scenario payload leaves out. Loaded from an
/// optional JSON file; missing keys keep their built-in value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineDefaults {
    pub property_forecast: ForecastParams,
    pub securities_forecast: ForecastParams,
    pub cpi_forecast: ForecastParams,
    pub simulation_years: u32,
    pub n_sim: usize,
    pub max_n_sim: usize,
    pub tax_rate: f64,
    pub reset_interval_months: u32,
    pub path_sample: Option<usize>,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            property_forecast: ForecastParams::new(0.05, 0.05),
            securities_forecast: ForecastParams::new(0.07, 0.15),
            cpi_forecast: ForecastParams::new(0.025, 0.01),
            simulation_years: 30,
            n_sim: 10_000,
            max_n_sim: 50_000,
            tax_rate: 25.0,
            reset_interval_months: 60,
            path_sample: Some(100),
        }
    }
}

impl EngineDefaults {
    pub fn from_json(json: &str) -> Result<Self, String> {
        let defaults = serde_json::from_str::<Self>(json)
            .map_err(|e| format!("Invalid defaults JSON: {e}"))?;
        defaults.validate()?;
        Ok(defaults)
    }

    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let json = fs::read_to_string(path)
                    .map_err(|e| format!("Cannot read --defaults {}: {e}", path.display()))?;
                Self::from_json(&json)
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_n_sim == 0 {
            return Err("max_n_sim must be > 0".to_string());
        }
        if self.n_sim == 0 || self.n_sim > self.max_n_sim {
            return Err(format!(
                "default n_sim must be between 1 and max_n_sim ({})",
                self.max_n_sim
            ));
        }
        if self.simulation_years == 0 {
            return Err("default simulation_years must be > 0".to_string());
        }
        if !(0.0..=100.0).contains(&self.tax_rate) {
            return Err("default tax_rate must be between 0 and 100".to_string());
        }
        if self.reset_interval_months == 0 {
            return Err("reset_interval_months must be > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ForecastPayload {
    mu: Option<f64>,
    sigma: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProfilePayload {
    monthly_free_income: Option<Vec<Vec<f64>>>,
    savings: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MortgageTrackPayload {
    #[serde(rename = "type")]
    kind: String,
    principal: f64,
    term_years: u32,
    #[serde(default)]
    interest_rate: Option<f64>,
    #[serde(default)]
    spread: Option<f64>,
    #[serde(default)]
    rate_floor: Option<f64>,
    #[serde(default)]
    reset_interval_months: Option<u32>,
    #[serde(default)]
    reference_rates: Option<Vec<f64>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BuyingPayload {
    profile: Option<ProfilePayload>,
    apartment_price: Option<f64>,
    down_payment: Option<f64>,
    down_payment_prefunded: Option<bool>,
    mortgage_params: Option<BTreeMap<String, MortgageTrackPayload>>,
    maintenance_cost_rate: Option<f64>,
    fixed_maintenance_cost: Option<f64>,
    forecast_params: Option<ForecastPayload>,
    simulation_years: Option<u32>,
    n_sim: Option<usize>,
    seed: Option<u64>,
    path_sample: Option<usize>,
    prime_rate_path: Option<Vec<f64>>,
    cpi_index: Option<Vec<f64>>,
    cpi_forecast: Option<ForecastPayload>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InvestmentPayload {
    profile: Option<ProfilePayload>,
    tax_rate: Option<f64>,
    transaction_fee: Option<f64>,
    percentage_management_fee: Option<f64>,
    #[serde(alias = "ILS_management_fee")]
    fixed_management_fee: Option<f64>,
    initial_already_invested: Option<bool>,
    forecast_params: Option<ForecastPayload>,
    simulation_years: Option<u32>,
    n_sim: Option<usize>,
    seed: Option<u64>,
    path_sample: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ComparisonPayload {
    buying_scenario: Option<BuyingPayload>,
    investment_scenario: Option<InvestmentPayload>,
}

#[derive(Parser, Debug)]
#[command(
    name = "tbontb",
    about = "Monte Carlo comparison of buying a home with a mortgage against investing the same money"
)]
pub struct Cli {
    #[arg(long, global = true, help = "JSON file overriding engine defaults")]
    pub defaults: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        help = "Seed for reproducible runs; overrides any seed in the scenario"
    )]
    pub seed: Option<u64>,
    #[arg(long, global = true, help = "Print single-line JSON")]
    pub compact: bool,
    #[arg(short, long, global = true, action = ArgAction::Count, help = "Raise log verbosity")]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Simulate buying a property with a mortgage
    Buy(ScenarioArgs),
    /// Simulate investing savings and free income in securities
    Invest(ScenarioArgs),
    /// Run both scenarios and report which one ends ahead
    Compare(ScenarioArgs),
}

#[derive(Args, Debug)]
pub struct ScenarioArgs {
    #[arg(long, help = "Scenario JSON file, or - for stdin")]
    pub scenario: PathBuf,
}

fn resolve_forecast(payload: Option<ForecastPayload>, fallback: ForecastParams) -> ForecastParams {
    let payload = payload.unwrap_or_default();
    ForecastParams::new(
        payload.mu.unwrap_or(fallback.mu),
        payload.sigma.unwrap_or(fallback.sigma),
    )
}

fn build_settings(
    simulation_years: Option<u32>,
    n_sim: Option<usize>,
    seed: Option<u64>,
    path_sample: Option<usize>,
    defaults: &EngineDefaults,
    cli_seed: Option<u64>,
) -> Result<SimulationSettings, String> {
    let simulation_years = simulation_years.unwrap_or(defaults.simulation_years);
    if simulation_years == 0 {
        return Err("simulation_years must be > 0".to_string());
    }
    let n_sim = n_sim.unwrap_or(defaults.n_sim);
    if n_sim == 0 || n_sim > defaults.max_n_sim {
        return Err(format!(
            "n_sim must be between 1 and {}",
            defaults.max_n_sim
        ));
    }
    Ok(SimulationSettings {
        simulation_years,
        n_sim,
        seed: cli_seed.or(seed),
        path_sample: path_sample.or(defaults.path_sample).filter(|&k| k > 0),
    })
}

fn build_profile(
    payload: Option<ProfilePayload>,
    simulation_years: u32,
) -> Result<FinancialProfile, String> {
    let Some(payload) = payload else {
        return Err("profile is required".to_string());
    };
    let savings = payload.savings.unwrap_or(0.0);
    if !savings.is_finite() || savings < 0.0 {
        return Err("profile.savings must be >= 0".to_string());
    }
    let Some(years) = payload.monthly_free_income else {
        return Err("profile.monthly_free_income is required".to_string());
    };
    if years.len() != simulation_years as usize {
        return Err(format!(
            "profile.monthly_free_income has {} years, simulation_years is {simulation_years}",
            years.len()
        ));
    }

    let mut monthly_free_income = Vec::with_capacity(years.len());
    for (idx, year) in years.into_iter().enumerate() {
        let row: [f64; MONTHS_PER_YEAR] = year.try_into().map_err(|y: Vec<f64>| {
            format!(
                "profile.monthly_free_income year {idx} must have exactly 12 months, got {}",
                y.len()
            )
        })?;
        monthly_free_income.push(row);
    }
    Ok(FinancialProfile {
        monthly_free_income,
        savings,
    })
}

fn build_track(
    name: &str,
    payload: MortgageTrackPayload,
    prime_rate_path: Option<&[f64]>,
    defaults: &EngineDefaults,
) -> Result<MortgageTrack, String> {
    let kind = payload.kind.to_ascii_lowercase();
    let path_rate = match kind.as_str() {
        "prime" => prime_rate_path.and_then(|path| path.first().copied()),
        _ => None,
    };
    let interest_rate = match (payload.interest_rate, path_rate) {
        (Some(rate), _) => {
            if !(0.0..=100.0).contains(&rate) {
                return Err(format!(
                    "mortgage_params.{name}.interest_rate must be between 0 and 100"
                ));
            }
            rate
        }
        (None, Some(rate)) => rate,
        (None, None) => {
            return Err(format!("mortgage_params.{name}.interest_rate is required"));
        }
    };
    if payload.term_years == 0 {
        return Err(format!("mortgage_params.{name}.term_years must be > 0"));
    }
    if !payload.principal.is_finite() || payload.principal <= 0.0 {
        return Err(format!("mortgage_params.{name}.principal must be > 0"));
    }

    let principal = payload.principal;
    let term_years = payload.term_years;
    let reset_interval_months = payload
        .reset_interval_months
        .unwrap_or(defaults.reset_interval_months);
    let reference_rates = payload.reference_rates.unwrap_or_default();

    let track = match kind.as_str() {
        "fixed" => MortgageTrack::Fixed {
            principal,
            term_years,
            interest_rate,
        },
        "prime" => MortgageTrack::Prime {
            principal,
            term_years,
            interest_rate,
            spread: payload.spread.unwrap_or(0.0),
            rate_floor: payload.rate_floor,
        },
        "linked" | "cpi_linked" => MortgageTrack::CpiLinked {
            principal,
            term_years,
            interest_rate,
        },
        "adjustable" => MortgageTrack::Adjustable {
            principal,
            term_years,
            interest_rate,
            reset_interval_months,
            reference_rates,
        },
        "adjustablelinked" | "adjustable_cpi_linked" => MortgageTrack::AdjustableCpiLinked {
            principal,
            term_years,
            interest_rate,
            reset_interval_months,
            reference_rates,
        },
        other => {
            return Err(format!(
                "mortgage_params.{name}.type '{other}' must be one of fixed, prime, linked, adjustable, adjustablelinked"
            ));
        }
    };
    Ok(track)
}

fn build_buying_request(
    payload: BuyingPayload,
    defaults: &EngineDefaults,
    cli_seed: Option<u64>,
) -> Result<BuyingRequest, String> {
    let settings = build_settings(
        payload.simulation_years,
        payload.n_sim,
        payload.seed,
        payload.path_sample,
        defaults,
        cli_seed,
    )?;
    let profile = build_profile(payload.profile, settings.simulation_years)?;

    let Some(apartment_price) = payload.apartment_price else {
        return Err("apartment_price is required".to_string());
    };
    if !apartment_price.is_finite() || apartment_price <= 0.0 {
        return Err("apartment_price must be > 0".to_string());
    }
    let down_payment = payload.down_payment.unwrap_or(0.0);
    if !(0.0..=apartment_price).contains(&down_payment) {
        return Err("down_payment must be between 0 and apartment_price".to_string());
    }

    let mut tracks = BTreeMap::new();
    for (name, track) in payload.mortgage_params.unwrap_or_default() {
        let track = build_track(&name, track, payload.prime_rate_path.as_deref(), defaults)?;
        tracks.insert(name, track);
    }
    let mortgage = MortgagePlan { tracks };
    let financed = apartment_price - down_payment;
    if (mortgage.total_principal() - financed).abs() > FINANCING_TOLERANCE {
        return Err(format!(
            "mortgage_params principals sum to {:.2}, apartment_price - down_payment is {financed:.2}",
            mortgage.total_principal()
        ));
    }

    let maintenance_cost_rate = payload.maintenance_cost_rate.unwrap_or(0.0);
    if !(0.0..=100.0).contains(&maintenance_cost_rate) {
        return Err("maintenance_cost_rate must be between 0 and 100".to_string());
    }

    let cpi = match (payload.cpi_index, mortgage.has_cpi_linked()) {
        (Some(index), _) => Some(CpiSource::Series { index }),
        (None, true) => Some(CpiSource::Simulated {
            forecast: resolve_forecast(payload.cpi_forecast, defaults.cpi_forecast),
        }),
        (None, false) => None,
    };

    let request = BuyingRequest {
        profile,
        forecast_params: resolve_forecast(payload.forecast_params, defaults.property_forecast),
        settings,
        apartment_price,
        down_payment,
        down_payment_prefunded: payload.down_payment_prefunded.unwrap_or(false),
        mortgage,
        maintenance_cost_rate,
        fixed_maintenance_cost: payload.fixed_maintenance_cost.unwrap_or(0.0),
        rates: RateEnvironment {
            prime_rate_path: payload.prime_rate_path,
            cpi,
        },
    };
    validate_buying(&request).map_err(|e| e.to_string())?;
    Ok(request)
}

fn build_investment_request(
    payload: InvestmentPayload,
    defaults: &EngineDefaults,
    cli_seed: Option<u64>,
) -> Result<InvestmentRequest, String> {
    let settings = build_settings(
        payload.simulation_years,
        payload.n_sim,
        payload.seed,
        payload.path_sample,
        defaults,
        cli_seed,
    )?;
    let profile = build_profile(payload.profile, settings.simulation_years)?;

    let tax_rate = payload.tax_rate.unwrap_or(defaults.tax_rate);
    let transaction_fee = payload.transaction_fee.unwrap_or(0.0);
    let percentage_management_fee = payload.percentage_management_fee.unwrap_or(0.0);
    for (label, value) in [
        ("tax_rate", tax_rate),
        ("transaction_fee", transaction_fee),
        ("percentage_management_fee", percentage_management_fee),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(format!("{label} must be between 0 and 100"));
        }
    }
    let fixed_management_fee = payload.fixed_management_fee.unwrap_or(0.0);
    if !fixed_management_fee.is_finite() || fixed_management_fee < 0.0 {
        return Err("ILS_management_fee must be >= 0".to_string());
    }

    let request = InvestmentRequest {
        profile,
        forecast_params: resolve_forecast(payload.forecast_params, defaults.securities_forecast),
        settings,
        tax_rate,
        transaction_fee,
        percentage_management_fee,
        fixed_management_fee,
        initial_already_invested: payload.initial_already_invested.unwrap_or(true),
    };
    validate_investment(&request).map_err(|e| e.to_string())?;
    Ok(request)
}

pub fn buying_request_from_json(
    json: &str,
    defaults: &EngineDefaults,
    cli_seed: Option<u64>,
) -> Result<BuyingRequest, String> {
    let payload = serde_json::from_str::<BuyingPayload>(json)
        .map_err(|e| format!("Invalid buying scenario JSON: {e}"))?;
    build_buying_request(payload, defaults, cli_seed)
}

pub fn investment_request_from_json(
    json: &str,
    defaults: &EngineDefaults,
    cli_seed: Option<u64>,
) -> Result<InvestmentRequest, String> {
    let payload = serde_json::from_str::<InvestmentPayload>(json)
        .map_err(|e| format!("Invalid investment scenario JSON: {e}"))?;
    build_investment_request(payload, defaults, cli_seed)
}

/// Parses a comparison payload. At least one scenario must be present.
pub fn comparison_requests_from_json(
    json: &str,
    defaults: &EngineDefaults,
    cli_seed: Option<u64>,
) -> Result<(Option<BuyingRequest>, Option<InvestmentRequest>), String> {
    let payload = serde_json::from_str::<ComparisonPayload>(json)
        .map_err(|e| format!("Invalid comparison JSON: {e}"))?;
    if payload.buying_scenario.is_none() && payload.investment_scenario.is_none() {
        return Err("At least one of buying_scenario or investment_scenario is required".to_string());
    }
    let buying = payload
        .buying_scenario
        .map(|p| build_buying_request(p, defaults, cli_seed))
        .transpose()
        .map_err(|e| format!("buying_scenario: {e}"))?;
    let investment = payload
        .investment_scenario
        .map(|p| build_investment_request(p, defaults, cli_seed))
        .transpose()
        .map_err(|e| format!("investment_scenario: {e}"))?;
    Ok((buying, investment))
}

fn read_scenario(path: &Path) -> Result<String, String> {
    if path.as_os_str() == "-" {
        return io::read_to_string(io::stdin()).map_err(|e| format!("Cannot read stdin: {e}"));
    }
    fs::read_to_string(path)
        .map_err(|e| format!("Cannot read --scenario {}: {e}", path.display()))
}

fn to_json<T: Serialize>(value: &T, compact: bool) -> Result<String, String> {
    let rendered = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    };
    rendered.map_err(|e| format!("Cannot serialise result: {e}"))
}

/// Runs the selected subcommand on already-loaded scenario JSON and returns
/// the rendered result.
pub fn execute(
    command: &Command,
    json: &str,
    defaults: &EngineDefaults,
    seed: Option<u64>,
    compact: bool,
) -> Result<String, String> {
    match command {
        Command::Buy(_) => {
            let request = buying_request_from_json(json, defaults, seed)?;
            let result = simulate_buying(&request).map_err(|e| e.to_string())?;
            to_json(&result, compact)
        }
        Command::Invest(_) => {
            let request = investment_request_from_json(json, defaults, seed)?;
            let result = simulate_investment(&request).map_err(|e| e.to_string())?;
            to_json(&result, compact)
        }
        Command::Compare(_) => {
            let (buying, investment) = comparison_requests_from_json(json, defaults, seed)?;
            let outcome = run_scenarios(
                buying.as_ref(),
                investment.as_ref(),
                &CancellationToken::new(),
            )
            .map_err(|e| e.to_string())?;
            to_json(&outcome, compact)
        }
    }
}

pub fn run(cli: Cli) -> Result<(), String> {
    let defaults = EngineDefaults::load(cli.defaults.as_deref())?;
    let scenario = match &cli.command {
        Command::Buy(args) | Command::Invest(args) | Command::Compare(args) => &args.scenario,
    };
    debug!(scenario = %scenario.display(), seed = ?cli.seed, "loading scenario");
    let json = read_scenario(scenario)?;
    let output = execute(&cli.command, &json, &defaults, cli.seed, cli.compact)?;
    println!("{output}");
    Ok(())
}
