//! Strength inference engine (spec §4.7 "Strength engine").
//!
//! Closed-form Bayesian linear regression over `(day_offset, e1RM)` points,
//! ported from `_closed_form_strength` in the reference implementation. The
//! original also offers a PyMC posterior-sampling path; that is out of scope
//! here (DESIGN.md) — this engine always reports itself as `closed_form`.

use crate::math2x2::{ci95, dot, inv2, matvec, normal_cdf, round_n};
use serde::Serialize;

pub const MIN_POINTS: usize = 3;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StrengthResult {
    InsufficientData { engine: &'static str, required_points: usize, observed_points: usize },
    Ok(StrengthOk),
}

#[derive(Debug, Clone, Serialize)]
pub struct StrengthOk {
    pub engine: &'static str,
    pub trend: Trend,
    pub estimated_1rm: Estimate,
    pub predicted_1rm: Prediction,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trend {
    pub slope_kg_per_day: f64,
    pub slope_kg_per_week: f64,
    pub slope_ci95: [f64; 2],
    pub plateau_probability: f64,
    pub improving_probability: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Estimate {
    pub mean: f64,
    pub ci95: [f64; 2],
}

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub horizon_days: i64,
    pub mean: f64,
    pub ci95: [f64; 2],
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub sigma: f64,
    pub alpha_sd: f64,
    pub beta_sd: f64,
}

/// Parameters threaded explicitly, never as ambient globals (spec §9's
/// "Population priors" re-architecture row).
#[derive(Debug, Clone, Copy)]
pub struct StrengthParams {
    pub horizon_days: f64,
    pub slope_plateau_threshold: f64,
}

impl Default for StrengthParams {
    fn default() -> Self {
        Self { horizon_days: 28.0, slope_plateau_threshold: 0.02 }
    }
}

/// `points` is `(day_offset, estimated_1rm)`, finite and already materialized
/// from the handler's lazy per-session fold.
pub fn run_strength_inference(points: &[(f64, f64)], params: StrengthParams) -> StrengthResult {
    if points.len() < MIN_POINTS {
        return StrengthResult::InsufficientData {
            engine: "none",
            required_points: MIN_POINTS,
            observed_points: points.len(),
        };
    }

    let x: Vec<f64> = points.iter().map(|p| p.0).collect();
    let y: Vec<f64> = points.iter().map(|p| p.1).collect();
    let n = x.len() as f64;

    let x_mean = x.iter().sum::<f64>() / n;
    let x_centered: Vec<f64> = x.iter().map(|xi| xi - x_mean).collect();

    let y_mean = y.iter().sum::<f64>() / n;
    let prior_mean: [f64; 2] = [y_mean, 0.0];
    let prior_cov = [[400.0, 0.0], [0.0, 4.0]];
    let prior_prec = inv2(prior_cov);

    let sample_var = y.iter().map(|yi| (yi - y_mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0);
    let sigma2 = sample_var.max(25.0);

    let s11 = x_centered.len() as f64;
    let s12: f64 = x_centered.iter().sum();
    let s22: f64 = x_centered.iter().map(|xi| xi * xi).sum();
    let xtx = [[s11 / sigma2, s12 / sigma2], [s12 / sigma2, s22 / sigma2]];
    let xty = [
        y.iter().sum::<f64>() / sigma2,
        x_centered.iter().zip(&y).map(|(xi, yi)| xi * yi).sum::<f64>() / sigma2,
    ];

    let post_prec = [
        [xtx[0][0] + prior_prec[0][0], xtx[0][1] + prior_prec[0][1]],
        [xtx[1][0] + prior_prec[1][0], xtx[1][1] + prior_prec[1][1]],
    ];
    let post_cov = inv2(post_prec);
    let rhs = [xty[0] + dot(prior_prec[0], prior_mean), xty[1] + dot(prior_prec[1], prior_mean)];
    let post_mean = matvec(post_cov, rhs);

    let alpha_mu = post_mean[0];
    let beta_mu = post_mean[1];
    let alpha_sd = post_cov[0][0].max(1e-9).sqrt();
    let beta_sd = post_cov[1][1].max(1e-9).sqrt();

    let x_last = *x_centered.last().unwrap();
    let x_future = x_last + params.horizon_days;

    let current_mu = alpha_mu + beta_mu * x_last;
    let current_var = sigma2 + post_cov[0][0] + x_last * x_last * post_cov[1][1] + 2.0 * x_last * post_cov[0][1];
    let current_sd = current_var.max(1e-9).sqrt();

    let future_mu = alpha_mu + beta_mu * x_future;
    let future_var = sigma2 + post_cov[0][0] + x_future * x_future * post_cov[1][1] + 2.0 * x_future * post_cov[0][1];
    let future_sd = future_var.max(1e-9).sqrt();

    let plateau_probability = normal_cdf(params.slope_plateau_threshold, beta_mu, beta_sd);
    let improving_probability = 1.0 - normal_cdf(0.0, beta_mu, beta_sd);

    StrengthResult::Ok(StrengthOk {
        engine: "closed_form",
        trend: Trend {
            slope_kg_per_day: round_n(beta_mu, 4),
            slope_kg_per_week: round_n(beta_mu * 7.0, 3),
            slope_ci95: ci95(beta_mu, beta_sd),
            plateau_probability: round_n(plateau_probability, 4),
            improving_probability: round_n(improving_probability, 4),
        },
        estimated_1rm: Estimate { mean: round_n(current_mu, 2), ci95: ci95(current_mu, current_sd) },
        predicted_1rm: Prediction {
            horizon_days: params.horizon_days as i64,
            mean: round_n(future_mu, 2),
            ci95: ci95(future_mu, future_sd),
        },
        diagnostics: Diagnostics {
            sigma: round_n(sigma2.sqrt(), 3),
            alpha_sd: round_n(alpha_sd, 4),
            beta_sd: round_n(beta_sd, 6),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_below_three_points() {
        for observed in 0..MIN_POINTS {
            let points: Vec<(f64, f64)> = (0..observed).map(|i| (i as f64, 100.0)).collect();
            let result = run_strength_inference(&points, StrengthParams::default());
            assert!(matches!(result, StrengthResult::InsufficientData { observed_points, .. } if observed_points == observed));
        }
    }

    #[test]
    fn three_points_produce_a_full_result() {
        let points = vec![(0.0, 100.0), (7.0, 102.5), (14.0, 105.0)];
        let result = run_strength_inference(&points, StrengthParams::default());
        assert!(matches!(result, StrengthResult::Ok(_)));
    }

    #[test]
    fn upward_trend_has_low_plateau_probability() {
        let points = vec![(0.0, 100.0), (7.0, 110.0), (14.0, 120.0), (21.0, 130.0)];
        if let StrengthResult::Ok(ok) = run_strength_inference(&points, StrengthParams::default()) {
            assert!(ok.trend.plateau_probability < 0.5);
            assert!(ok.trend.improving_probability > 0.5);
        } else {
            panic!("expected Ok result");
        }
    }
}
