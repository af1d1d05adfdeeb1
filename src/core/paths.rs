//! Monte Carlo path generation under Geometric Brownian Motion.
//!
//! Every row draws from its own `StdRng` whose seed is derived from the run
//! seed and the row index, so a matrix is identical no matter how rayon
//! schedules the rows. Rows are produced in blocks of [`PATH_BLOCK_ROWS`];
//! a [`CancellationToken`] is polled before each block.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use tracing::debug;

use super::error::{EngineError, EngineResult};
use super::types::{ForecastParams, PathMatrix};

pub const PATH_BLOCK_ROWS: usize = 1024;

pub(crate) const PROPERTY_STREAM: u64 = 1;
pub(crate) const SECURITIES_STREAM: u64 = 2;
pub(crate) const CPI_STREAM: u64 = 3;
pub(crate) const SAMPLE_STREAM: u64 = 4;

/// Cooperative cancellation flag shared between a caller and a running
/// simulation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Generates `n_sim` GBM trajectories of `n_months` monthly steps.
///
/// Column 0 holds `initial_value` for every row. Each step applies
/// `exp((mu - sigma^2/2)/12 + sigma/sqrt(12) * Z)` with an independent
/// standard normal `Z`. Without a seed the draws come from fresh entropy.
pub fn generate_paths(
    initial_value: f64,
    params: ForecastParams,
    n_sim: usize,
    n_months: usize,
    seed: Option<u64>,
) -> EngineResult<PathMatrix> {
    generate_paths_with_cancel(
        initial_value,
        params,
        n_sim,
        n_months,
        seed,
        &CancellationToken::new(),
    )
}

pub fn generate_paths_with_cancel(
    initial_value: f64,
    params: ForecastParams,
    n_sim: usize,
    n_months: usize,
    seed: Option<u64>,
    cancel: &CancellationToken,
) -> EngineResult<PathMatrix> {
    if !initial_value.is_finite() {
        return Err(EngineError::invalid_parameter(
            "initial_value must be finite",
        ));
    }
    fill_matrix(params, n_sim, n_months, seed, cancel, |row, row_seed| {
        fill_gbm_row(row, initial_value, params, row_seed)
    })
}

/// Per-month growth factors `exp(r_t)` drawn exactly as [`generate_paths`]
/// draws them, so a path equals its initial value times the running product
/// of its factors. Column 0 is 1.0.
pub fn generate_growth_factors_with_cancel(
    params: ForecastParams,
    n_sim: usize,
    n_months: usize,
    seed: Option<u64>,
    cancel: &CancellationToken,
) -> EngineResult<PathMatrix> {
    fill_matrix(params, n_sim, n_months, seed, cancel, |row, row_seed| {
        fill_factor_row(row, params, row_seed)
    })
}

fn fill_matrix<F>(
    params: ForecastParams,
    n_sim: usize,
    n_months: usize,
    seed: Option<u64>,
    cancel: &CancellationToken,
    fill_row: F,
) -> EngineResult<PathMatrix>
where
    F: Fn(&mut [f64], u64) + Sync + Send,
{
    params.validate("forecast_params")?;
    if n_sim < 1 {
        return Err(EngineError::invalid_parameter("n_sim must be >= 1"));
    }
    if n_months < 1 {
        return Err(EngineError::invalid_parameter("n_months must be >= 1"));
    }

    let seed = resolve_seed(seed);
    debug!(n_sim, n_months, seed, mu = params.mu, sigma = params.sigma, "generating GBM paths");

    let n_cols = n_months + 1;
    let mut matrix = PathMatrix::zeros(n_sim, n_cols);
    for (block_index, block) in matrix
        .rows_mut()
        .chunks_mut(PATH_BLOCK_ROWS * n_cols)
        .enumerate()
    {
        let first_row = block_index * PATH_BLOCK_ROWS;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled {
                next_row: first_row,
            });
        }
        block
            .par_chunks_mut(n_cols)
            .enumerate()
            .for_each(|(offset, row)| {
                fill_row(row, derive_seed(seed, (first_row + offset) as u64));
            });
    }
    Ok(matrix)
}

/// Single row of growth factors, used where each simulated path needs its
/// own auxiliary series (e.g. CPI indexation).
pub(crate) fn gbm_factor_row(params: ForecastParams, n_months: usize, seed: u64) -> Vec<f64> {
    let mut row = vec![0.0; n_months + 1];
    fill_factor_row(&mut row, params, seed);
    row
}

fn fill_factor_row(row: &mut [f64], params: ForecastParams, seed: u64) {
    let drift = params.monthly_drift();
    let vol = params.monthly_vol();
    let mut rng = StdRng::seed_from_u64(seed);

    row[0] = 1.0;
    for factor in row.iter_mut().skip(1) {
        let z: f64 = StandardNormal.sample(&mut rng);
        *factor = (drift + vol * z).exp();
    }
}

fn fill_gbm_row(row: &mut [f64], initial_value: f64, params: ForecastParams, seed: u64) {
    fill_factor_row(row, params, seed);
    row[0] = initial_value;
    for t in 1..row.len() {
        row[t] *= row[t - 1];
    }
}

/// Maps `f` over path indices `0..n_rows` block by block, checking the
/// token before each block.
pub(crate) fn map_rows_in_blocks<T, F>(
    n_rows: usize,
    cancel: &CancellationToken,
    f: F,
) -> EngineResult<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    let mut out = Vec::with_capacity(n_rows);
    for start in (0..n_rows).step_by(PATH_BLOCK_ROWS) {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled { next_row: start });
        }
        let end = (start + PATH_BLOCK_ROWS).min(n_rows);
        debug!(start, end, n_rows, "simulating path block");
        let block: Vec<T> = (start..end).into_par_iter().map(&f).collect();
        out.extend(block);
    }
    Ok(out)
}

/// Sorted, distinct row indices to keep for charts.
pub(crate) fn sample_row_indices(n_rows: usize, max_rows: usize, seed: u64) -> Vec<usize> {
    if max_rows >= n_rows {
        return (0..n_rows).collect();
    }
    let mut rng = StdRng::seed_from_u64(stream_seed(seed, SAMPLE_STREAM));
    let mut picked = rand::seq::index::sample(&mut rng, n_rows, max_rows).into_vec();
    picked.sort_unstable();
    picked
}

pub(crate) fn resolve_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(rand::random)
}

pub(crate) fn stream_seed(base_seed: u64, stream: u64) -> u64 {
    splitmix64(base_seed ^ stream.rotate_left(32))
}

pub(crate) fn derive_seed(base_seed: u64, row: u64) -> u64 {
    splitmix64(base_seed ^ splitmix64(row))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{any, prop_assert_eq, proptest};

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(32))]

        #[test]
        fn prop_column_zero_is_initial_value(
            seed in any::<u64>(),
            initial in 1u32..5_000_000,
            mu_bp in -2_000i32..3_000,
            sigma_bp in 0u32..8_000,
            n_sim in 1usize..40,
            n_months in 1usize..30
        ) {
            let params = ForecastParams::new(mu_bp as f64 / 10_000.0, sigma_bp as f64 / 10_000.0);
            let initial = initial as f64;
            let paths = generate_paths(initial, params, n_sim, n_months, Some(seed)).expect("valid");
            prop_assert_eq!(paths.n_rows(), n_sim);
            prop_assert_eq!(paths.n_cols(), n_months + 1);
            for row in paths.rows() {
                prop_assert_eq!(row[0], initial);
            }
        }
    }

    #[test]
    fn log_returns_converge_to_gbm_moments() {
        let params = ForecastParams::new(0.07, 0.15);
        let years = 2.0;
        let paths = generate_paths(1.0, params, 100_000, 24, Some(99)).expect("valid");

        let logs: Vec<f64> = paths.rows().map(|r| (r[24] / r[0]).ln()).collect();
        let n = logs.len() as f64;
        let mean = logs.iter().sum::<f64>() / n;
        let var = logs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);

        assert_approx_tol(mean, (0.07 - 0.5 * 0.15 * 0.15) * years, 0.003);
        assert_approx_tol(var, 0.15 * 0.15 * years, 0.002);
    }

    #[test]
    fn fixed_seed_reproduces_matrix() {
        let params = ForecastParams::new(0.05, 0.2);
        let a = generate_paths(100.0, params, 2_100, 6, Some(7)).expect("valid");
        let b = generate_paths(100.0, params, 2_100, 6, Some(7)).expect("valid");
        let c = generate_paths(100.0, params, 2_100, 6, Some(8)).expect("valid");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn unseeded_runs_differ() {
        let params = ForecastParams::new(0.05, 0.2);
        let a = generate_paths(100.0, params, 4, 12, None).expect("valid");
        let b = generate_paths(100.0, params, 4, 12, None).expect("valid");
        assert_ne!(a, b);
    }

    #[test]
    fn zero_volatility_compounds_drift() {
        let params = ForecastParams::new(0.06, 0.0);
        let paths = generate_paths(1_000.0, params, 3, 12, Some(1)).expect("valid");
        for row in paths.rows() {
            assert_approx_tol(row[12], 1_000.0 * 0.06_f64.exp(), 1e-9);
        }
    }

    #[test]
    fn rejects_invalid_parameters() {
        let bad_sigma = ForecastParams::new(0.05, -0.1);
        assert!(matches!(
            generate_paths(1.0, bad_sigma, 1, 1, Some(1)),
            Err(EngineError::InvalidParameter { .. })
        ));
        let ok = ForecastParams::new(0.05, 0.1);
        assert!(matches!(
            generate_paths(1.0, ok, 0, 1, Some(1)),
            Err(EngineError::InvalidParameter { .. })
        ));
        assert!(matches!(
            generate_paths(1.0, ok, 1, 0, Some(1)),
            Err(EngineError::InvalidParameter { .. })
        ));
        let nan_mu = ForecastParams::new(f64::NAN, 0.1);
        assert!(generate_paths(1.0, nan_mu, 1, 1, Some(1)).is_err());
    }

    #[test]
    fn cancelled_token_stops_before_first_block() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let params = ForecastParams::new(0.05, 0.1);
        let err = generate_paths_with_cancel(1.0, params, 10, 12, Some(1), &cancel)
            .expect_err("must cancel");
        assert_eq!(err, EngineError::Cancelled { next_row: 0 });
    }

    #[test]
    fn sampled_rows_are_sorted_distinct_and_stable() {
        let a = sample_row_indices(500, 20, 11);
        let b = sample_row_indices(500, 20, 11);
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sample_row_indices(5, 20, 11), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn growth_factors_rebuild_paths_from_same_draws() {
        let params = ForecastParams::new(0.04, 0.3);
        let cancel = CancellationToken::new();
        let paths = generate_paths(250.0, params, 1_500, 18, Some(21)).expect("valid");
        let factors =
            generate_growth_factors_with_cancel(params, 1_500, 18, Some(21), &cancel)
                .expect("valid");

        for (path, factor) in paths.rows().zip(factors.rows()) {
            assert_eq!(factor[0], 1.0);
            let mut level = 250.0;
            for t in 1..=18 {
                level *= factor[t];
                assert_approx_tol(path[t], level, 1e-9 * level.max(1.0));
            }
        }
    }

    #[test]
    fn extreme_volatility_factors_stay_positive_where_levels_vanish() {
        let params = ForecastParams::new(0.0, 8.0);
        let cancel = CancellationToken::new();
        let factors = generate_growth_factors_with_cancel(params, 50, 360, Some(3), &cancel)
            .expect("valid");
        assert!(factors.rows().flatten().all(|f| f.is_finite() && *f > 0.0));

        let levels = generate_paths(1.0, params, 50, 360, Some(3)).expect("valid");
        assert!(levels.final_column().iter().all(|v| *v == 0.0));
        assert_eq!(gbm_factor_row(params, 360, derive_seed(3, 7)), factors.row(7).to_vec());
    }

    #[test]
    fn derive_seed_changes_per_row_and_base() {
        assert_ne!(derive_seed(42, 0), derive_seed(42, 1));
        assert_ne!(derive_seed(42, 0), derive_seed(43, 0));
        assert_ne!(stream_seed(42, PROPERTY_STREAM), stream_seed(42, SECURITIES_STREAM));
    }
}
