use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};
use super::mortgage::AggregateSchedule;

pub const MONTHS_PER_YEAR: usize = 12;

/// Annual GBM drift and volatility, both as decimals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastParams {
    pub mu: f64,
    pub sigma: f64,
}

impl ForecastParams {
    pub fn new(mu: f64, sigma: f64) -> Self {
        Self { mu, sigma }
    }

    pub fn validate(&self, label: &str) -> EngineResult<()> {
        if !self.mu.is_finite() {
            return Err(EngineError::invalid_parameter(format!(
                "{label}.mu must be finite"
            )));
        }
        if !self.sigma.is_finite() || self.sigma < 0.0 {
            return Err(EngineError::invalid_parameter(format!(
                "{label}.sigma must be finite and >= 0"
            )));
        }
        Ok(())
    }

    pub fn monthly_drift(&self) -> f64 {
        (self.mu - 0.5 * self.sigma * self.sigma) / MONTHS_PER_YEAR as f64
    }

    pub fn monthly_vol(&self) -> f64 {
        self.sigma / (MONTHS_PER_YEAR as f64).sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialProfile {
    /// One row of twelve monthly amounts per simulated year.
    pub monthly_free_income: Vec<[f64; MONTHS_PER_YEAR]>,
    pub savings: f64,
}

impl FinancialProfile {
    /// Income for a 1-based month index.
    pub fn income_for_month(&self, month: usize) -> f64 {
        debug_assert!(month >= 1);
        let year = (month - 1) / MONTHS_PER_YEAR;
        let within = (month - 1) % MONTHS_PER_YEAR;
        self.monthly_free_income
            .get(year)
            .map(|row| row[within])
            .unwrap_or(0.0)
    }

    pub fn total_income(&self) -> f64 {
        self.monthly_free_income.iter().flatten().sum()
    }

    pub fn validate(&self, simulation_years: u32) -> EngineResult<()> {
        if !self.savings.is_finite() || self.savings < 0.0 {
            return Err(EngineError::invalid_parameter("savings must be >= 0"));
        }
        if self.monthly_free_income.len() != simulation_years as usize {
            return Err(EngineError::invalid_parameter(format!(
                "monthly_free_income covers {} years, simulation_years is {simulation_years}",
                self.monthly_free_income.len()
            )));
        }
        if self
            .monthly_free_income
            .iter()
            .flatten()
            .any(|v| !v.is_finite())
        {
            return Err(EngineError::invalid_parameter(
                "monthly_free_income must contain finite values",
            ));
        }
        Ok(())
    }
}

pub fn default_reset_interval_months() -> u32 {
    60
}

/// One component loan of a mortgage plan. Rates are annual percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MortgageTrack {
    Fixed {
        principal: f64,
        term_years: u32,
        interest_rate: f64,
    },
    /// `interest_rate` is the prime reference in effect for the run; a
    /// prime series in the [`RateEnvironment`] replaces it month by month.
    Prime {
        principal: f64,
        term_years: u32,
        interest_rate: f64,
        spread: f64,
        #[serde(default)]
        rate_floor: Option<f64>,
    },
    /// `interest_rate` is the real rate; principal is indexed monthly by CPI.
    #[serde(alias = "linked")]
    CpiLinked {
        principal: f64,
        term_years: u32,
        interest_rate: f64,
    },
    Adjustable {
        principal: f64,
        term_years: u32,
        interest_rate: f64,
        #[serde(default = "default_reset_interval_months")]
        reset_interval_months: u32,
        #[serde(default)]
        reference_rates: Vec<f64>,
    },
    #[serde(alias = "adjustablelinked")]
    AdjustableCpiLinked {
        principal: f64,
        term_years: u32,
        interest_rate: f64,
        #[serde(default = "default_reset_interval_months")]
        reset_interval_months: u32,
        #[serde(default)]
        reference_rates: Vec<f64>,
    },
}

impl MortgageTrack {
    pub fn principal(&self) -> f64 {
        match self {
            Self::Fixed { principal, .. }
            | Self::Prime { principal, .. }
            | Self::CpiLinked { principal, .. }
            | Self::Adjustable { principal, .. }
            | Self::AdjustableCpiLinked { principal, .. } => *principal,
        }
    }

    pub fn term_years(&self) -> u32 {
        match self {
            Self::Fixed { term_years, .. }
            | Self::Prime { term_years, .. }
            | Self::CpiLinked { term_years, .. }
            | Self::Adjustable { term_years, .. }
            | Self::AdjustableCpiLinked { term_years, .. } => *term_years,
        }
    }

    pub fn interest_rate(&self) -> f64 {
        match self {
            Self::Fixed { interest_rate, .. }
            | Self::Prime { interest_rate, .. }
            | Self::CpiLinked { interest_rate, .. }
            | Self::Adjustable { interest_rate, .. }
            | Self::AdjustableCpiLinked { interest_rate, .. } => *interest_rate,
        }
    }

    pub fn term_months(&self) -> usize {
        self.term_years() as usize * MONTHS_PER_YEAR
    }

    pub fn is_cpi_linked(&self) -> bool {
        matches!(self, Self::CpiLinked { .. } | Self::AdjustableCpiLinked { .. })
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Fixed { .. } => "fixed",
            Self::Prime { .. } => "prime",
            Self::CpiLinked { .. } => "cpi_linked",
            Self::Adjustable { .. } => "adjustable",
            Self::AdjustableCpiLinked { .. } => "adjustable_cpi_linked",
        }
    }
}

/// Named tracks that together fund the financed part of a purchase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MortgagePlan {
    pub tracks: BTreeMap<String, MortgageTrack>,
}

impl MortgagePlan {
    pub fn total_principal(&self) -> f64 {
        self.tracks.values().map(MortgageTrack::principal).sum()
    }

    pub fn has_cpi_linked(&self) -> bool {
        self.tracks.values().any(MortgageTrack::is_cpi_linked)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MortgageTrack)> {
        self.tracks.iter()
    }
}

impl<S: Into<String>> FromIterator<(S, MortgageTrack)> for MortgagePlan {
    fn from_iter<I: IntoIterator<Item = (S, MortgageTrack)>>(iter: I) -> Self {
        Self {
            tracks: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CpiSource {
    /// Index levels per month, entry 0 being the base level.
    Series { index: Vec<f64> },
    /// A fresh CPI trajectory is drawn for every simulated path.
    Simulated { forecast: ForecastParams },
}

/// Market inputs resolved before a run starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateEnvironment {
    /// Prime reference rate per month, in percent.
    #[serde(default)]
    pub prime_rate_path: Option<Vec<f64>>,
    #[serde(default)]
    pub cpi: Option<CpiSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    pub simulation_years: u32,
    pub n_sim: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Number of rows kept from each path matrix for charts.
    #[serde(default)]
    pub path_sample: Option<usize>,
}

impl SimulationSettings {
    pub fn n_months(&self) -> usize {
        self.simulation_years as usize * MONTHS_PER_YEAR
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.simulation_years < 1 {
            return Err(EngineError::invalid_parameter(
                "simulation_years must be >= 1",
            ));
        }
        if self.n_sim < 1 {
            return Err(EngineError::invalid_parameter("n_sim must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyingRequest {
    pub profile: FinancialProfile,
    pub forecast_params: ForecastParams,
    pub settings: SimulationSettings,
    pub apartment_price: f64,
    pub down_payment: f64,
    /// Down payment funded outside `savings` (gift, sale of other assets).
    #[serde(default)]
    pub down_payment_prefunded: bool,
    pub mortgage: MortgagePlan,
    /// Annual maintenance as a percentage of the current property value.
    #[serde(default)]
    pub maintenance_cost_rate: f64,
    /// Annual fixed maintenance in currency.
    #[serde(default)]
    pub fixed_maintenance_cost: f64,
    #[serde(default)]
    pub rates: RateEnvironment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestmentRequest {
    pub profile: FinancialProfile,
    pub forecast_params: ForecastParams,
    pub settings: SimulationSettings,
    /// Percent of realised gains taken at the horizon.
    pub tax_rate: f64,
    /// Percent of every contribution.
    #[serde(default)]
    pub transaction_fee: f64,
    /// Annual percent of balance, charged every twelfth month.
    #[serde(default)]
    pub percentage_management_fee: f64,
    /// Fixed currency amount charged every month.
    #[serde(default, alias = "ILS_management_fee")]
    pub fixed_management_fee: f64,
    #[serde(default = "default_true")]
    pub initial_already_invested: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentileSummary {
    pub median: f64,
    pub p10: f64,
    pub p90: f64,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileBands {
    pub p10: Vec<f64>,
    pub median: Vec<f64>,
    pub p90: Vec<f64>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ScenarioKind {
    Buying,
    Investment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub scenario: ScenarioKind,
    pub simulation_years: u32,
    pub n_sim: usize,
    pub median: f64,
    pub pessimistic: f64,
    pub optimistic: f64,
    pub total_invested: f64,
    pub total_return: f64,
    pub annualized_return: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InsolvencyReport {
    pub insolvent_paths: usize,
    pub insolvent_fraction: f64,
    pub earliest_insolvent_month: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuyingResult {
    pub summary: ScenarioSummary,
    pub final_property_value: PercentileSummary,
    pub net_equity: PercentileSummary,
    pub net_worth: PercentileSummary,
    pub total_maintenance_cost: PercentileSummary,
    pub remaining_mortgage: PercentileSummary,
    pub cash_reserve: PercentileSummary,
    pub insolvency: InsolvencyReport,
    pub mortgage_schedule: AggregateSchedule,
    pub net_equity_bands: PercentileBands,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_value_paths: Option<PathMatrix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_equity_paths: Option<PathMatrix>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvestmentResult {
    pub summary: ScenarioSummary,
    pub final_value_untaxed: PercentileSummary,
    pub final_value_taxed: PercentileSummary,
    pub total_contributed: f64,
    pub investment_bands: PercentileBands,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub investment_paths_untaxed: Option<PathMatrix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub investment_paths_taxed: Option<PathMatrix>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Winner {
    Buying,
    Investment,
    Tie,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub winner: Winner,
    pub difference: f64,
    pub buying_median: f64,
    pub investment_median: f64,
}

/// Row-major `n_sim x n_cols` grid; row = path, column = month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PathMatrixData")]
pub struct PathMatrix {
    n_rows: usize,
    n_cols: usize,
    values: Vec<f64>,
}

#[derive(Deserialize)]
struct PathMatrixData {
    n_rows: usize,
    n_cols: usize,
    values: Vec<f64>,
}

impl TryFrom<PathMatrixData> for PathMatrix {
    type Error = EngineError;

    fn try_from(data: PathMatrixData) -> EngineResult<Self> {
        if data.n_rows > 0 && data.n_cols == 0 {
            return Err(EngineError::invalid_parameter(
                "path matrix rows must hold at least one month",
            ));
        }
        if data.n_rows.checked_mul(data.n_cols) != Some(data.values.len()) {
            return Err(EngineError::invalid_parameter(format!(
                "path matrix of {} x {} cannot hold {} values",
                data.n_rows,
                data.n_cols,
                data.values.len()
            )));
        }
        Ok(Self {
            n_rows: data.n_rows,
            n_cols: data.n_cols,
            values: data.values,
        })
    }
}

impl PathMatrix {
    pub fn zeros(n_rows: usize, n_cols: usize) -> Self {
        Self {
            n_rows,
            n_cols,
            values: vec![0.0; n_rows * n_cols],
        }
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> EngineResult<Self> {
        let n_rows = rows.len();
        let n_cols = rows.first().map_or(0, Vec::len);
        if n_cols == 0 {
            return Err(EngineError::invalid_parameter(
                "path matrix needs at least one non-empty row",
            ));
        }
        if rows.iter().any(|r| r.len() != n_cols) {
            return Err(EngineError::invalid_parameter(
                "path matrix rows must share one length",
            ));
        }
        Ok(Self {
            n_rows,
            n_cols,
            values: rows.into_iter().flatten().collect(),
        })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn n_months(&self) -> usize {
        self.n_cols.saturating_sub(1)
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.n_cols + col]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.values[row * self.n_cols..(row + 1) * self.n_cols]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks(self.n_cols.max(1)).take(self.n_rows)
    }

    pub fn column(&self, col: usize) -> Vec<f64> {
        self.rows().map(|r| r[col]).collect()
    }

    /// Last month of every row; empty when the matrix has no columns.
    pub fn final_column(&self) -> Vec<f64> {
        match self.n_cols.checked_sub(1) {
            Some(last) => self.column(last),
            None => Vec::new(),
        }
    }

    pub(crate) fn rows_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// Copies the listed rows, in order, into a new matrix.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut values = Vec::with_capacity(indices.len() * self.n_cols);
        for &i in indices {
            values.extend_from_slice(self.row(i));
        }
        Self {
            n_rows: indices.len(),
            n_cols: self.n_cols,
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rows_rejects_missing_or_ragged_rows() {
        assert!(PathMatrix::from_rows(vec![]).is_err());
        assert!(PathMatrix::from_rows(vec![vec![]]).is_err());
        assert!(PathMatrix::from_rows(vec![vec![], vec![]]).is_err());
        assert!(PathMatrix::from_rows(vec![vec![1.0, 2.0], vec![3.0]]).is_err());

        let m = PathMatrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).expect("rectangular");
        assert_eq!(m.final_column(), vec![2.0, 4.0]);
        assert_eq!(m.n_months(), 1);
    }

    #[test]
    fn final_column_of_empty_matrix_is_empty() {
        assert!(PathMatrix::zeros(0, 0).final_column().is_empty());
        assert!(PathMatrix::zeros(3, 0).final_column().is_empty());
    }

    #[test]
    fn deserialized_matrix_must_match_its_shape() {
        let ok: PathMatrix =
            serde_json::from_str(r#"{"n_rows":2,"n_cols":2,"values":[1.0,2.0,3.0,4.0]}"#)
                .expect("consistent shape");
        assert_eq!(ok.row(1), &[3.0, 4.0]);

        let short = serde_json::from_str::<PathMatrix>(
            r#"{"n_rows":2,"n_cols":3,"values":[1.0,2.0,3.0,4.0]}"#,
        );
        assert!(short.is_err());

        let zero_width =
            serde_json::from_str::<PathMatrix>(r#"{"n_rows":2,"n_cols":0,"values":[]}"#);
        assert!(zero_width.is_err());

        let json = serde_json::to_string(&ok).expect("serializes");
        assert_eq!(serde_json::from_str::<PathMatrix>(&json).expect("round trip"), ok);
    }
}
