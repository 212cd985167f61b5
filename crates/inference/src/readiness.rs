//! Readiness inference engine (spec §4.7 "Readiness engine"), ported from
//! `run_readiness_inference`'s Normal-Normal conjugate update.

use crate::math2x2::{ci95, round_n};
use serde::Serialize;

pub const MIN_POINTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    High,
    Moderate,
    Low,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReadinessResult {
    InsufficientData { engine: &'static str, required_points: usize, observed_points: usize },
    Ok(ReadinessOk),
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessOk {
    pub engine: &'static str,
    pub readiness_today: ReadinessToday,
    pub baseline: Baseline,
    pub diagnostics: ReadinessDiagnostics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessToday {
    pub mean: f64,
    pub ci95: [f64; 2],
    pub state: ReadinessState,
}

#[derive(Debug, Clone, Serialize)]
pub struct Baseline {
    pub posterior_mean: f64,
    pub posterior_ci95: [f64; 2],
    pub observations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessDiagnostics {
    pub obs_var: f64,
    pub prior_mean: f64,
    pub prior_var: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessParams {
    pub prior_mean: f64,
    pub prior_var: f64,
}

impl Default for ReadinessParams {
    fn default() -> Self {
        Self { prior_mean: 0.6, prior_var: 0.04 }
    }
}

/// `observations` is the daily readiness score series, each in `[0,1]`
/// (spec §4.4.4's composition formula), chronologically ordered.
pub fn run_readiness_inference(observations: &[f64], params: ReadinessParams) -> ReadinessResult {
    if observations.len() < MIN_POINTS {
        return ReadinessResult::InsufficientData {
            engine: "none",
            required_points: MIN_POINTS,
            observed_points: observations.len(),
        };
    }

    let n = observations.len() as f64;
    let obs_mean = observations.iter().sum::<f64>() / n;
    let obs_var = (observations.iter().map(|x| (x - obs_mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0)).max(0.005);

    let post_precision = (1.0 / params.prior_var) + (n / obs_var);
    let post_var = 1.0 / post_precision;
    let post_mean = post_var * ((params.prior_mean / params.prior_var) + (n * obs_mean / obs_var));
    let post_sd = post_var.sqrt();

    let latest = *observations.last().unwrap();
    let short_term = 0.7 * latest + 0.3 * post_mean;

    let state = if short_term >= 0.72 {
        ReadinessState::High
    } else if short_term <= 0.45 {
        ReadinessState::Low
    } else {
        ReadinessState::Moderate
    };

    ReadinessResult::Ok(ReadinessOk {
        engine: "normal_normal",
        readiness_today: ReadinessToday { mean: round_n(short_term, 3), ci95: ci95(short_term, post_sd), state },
        baseline: Baseline {
            posterior_mean: round_n(post_mean, 3),
            posterior_ci95: ci95(post_mean, post_sd),
            observations: observations.len(),
        },
        diagnostics: ReadinessDiagnostics {
            obs_var: round_n(obs_var, 5),
            prior_mean: params.prior_mean,
            prior_var: params.prior_var,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_below_five_points() {
        let observations = vec![0.6; 4];
        assert!(matches!(
            run_readiness_inference(&observations, ReadinessParams::default()),
            ReadinessResult::InsufficientData { observed_points: 4, .. }
        ));
    }

    #[test]
    fn five_points_produce_a_full_result_and_high_state() {
        let observations = vec![0.9, 0.92, 0.88, 0.95, 0.91];
        let result = run_readiness_inference(&observations, ReadinessParams::default());
        match result {
            ReadinessResult::Ok(ok) => assert_eq!(ok.readiness_today.state, ReadinessState::High),
            _ => panic!("expected Ok"),
        }
    }
}
