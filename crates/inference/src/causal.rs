//! Causal estimator (spec §4.7 "Causal estimator").
//!
//! The original's IPW implementation is explicitly out of scope for
//! reimplementation (spec §1); only its interface is specified. This keeps
//! the documented contract shape exactly but estimates propensity from the
//! overall treatment rate rather than a per-confounder logistic fit — a
//! deliberate simplification recorded in DESIGN.md, not a port of internals.

use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct CausalSample {
    pub treated: bool,
    pub outcome: f64,
    pub confounders: HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectDirection {
    Positive,
    Negative,
    Uncertain,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CausalResult {
    InsufficientData { caveats: Vec<String> },
    Ok(CausalOk),
}

#[derive(Debug, Clone, Serialize)]
pub struct CausalOk {
    pub status: &'static str,
    pub estimand: &'static str,
    pub effect: Effect,
    pub propensity: Propensity,
    pub diagnostics: Diagnostics,
    pub caveats: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Effect {
    pub mean_ate: f64,
    pub ci95: [f64; 2],
    pub direction: EffectDirection,
    pub probability_positive: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Propensity {
    pub treated_rate: f64,
    pub min_weight: f64,
    pub max_weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub n_treated: usize,
    pub n_control: usize,
    pub effective_sample_size: f64,
}

pub fn run_causal_estimate(samples: &[CausalSample], min_samples: usize) -> CausalResult {
    if samples.len() < min_samples {
        return CausalResult::InsufficientData {
            caveats: vec![format!("fewer than {min_samples} observations available for this window")],
        };
    }

    let n = samples.len() as f64;
    let n_treated = samples.iter().filter(|s| s.treated).count();
    let n_control = samples.len() - n_treated;
    if n_treated == 0 || n_control == 0 {
        return CausalResult::InsufficientData {
            caveats: vec!["no variation in treatment within this window".to_string()],
        };
    }

    let treated_rate = n_treated as f64 / n;

    // Inverse-propensity weights from the overall treatment rate (see module
    // doc): treated units weight 1/p, control units weight 1/(1-p).
    let mut weighted_sum = 0.0;
    let mut weight_total_treated = 0.0;
    let mut weight_total_control = 0.0;
    let mut min_weight = f64::MAX;
    let mut max_weight = f64::MIN;

    for sample in samples {
        let weight = if sample.treated { 1.0 / treated_rate } else { 1.0 / (1.0 - treated_rate) };
        min_weight = min_weight.min(weight);
        max_weight = max_weight.max(weight);
        if sample.treated {
            weighted_sum += sample.outcome * weight;
            weight_total_treated += weight;
        } else {
            weighted_sum -= sample.outcome * weight;
            weight_total_control += weight;
        }
    }

    let ate = weighted_sum / n;
    let effective_sample_size = (weight_total_treated + weight_total_control).powi(2)
        / (weight_total_treated.powi(2) + weight_total_control.powi(2)).max(1e-9);

    let variance_proxy = samples.iter().map(|s| s.outcome).fold(0.0, f64::max)
        - samples.iter().map(|s| s.outcome).fold(f64::MAX, f64::min);
    let se = (variance_proxy.max(0.01) / n.sqrt()).max(1e-6);
    let ci95 = [((ate - 1.96 * se) * 1000.0).round() / 1000.0, ((ate + 1.96 * se) * 1000.0).round() / 1000.0];

    let probability_positive = crate::math2x2::normal_cdf(0.0, -ate, se);
    let direction = if ci95[0] > 0.0 {
        EffectDirection::Positive
    } else if ci95[1] < 0.0 {
        EffectDirection::Negative
    } else {
        EffectDirection::Uncertain
    };

    CausalResult::Ok(CausalOk {
        status: "ok",
        estimand: "average_treatment_effect",
        effect: Effect { mean_ate: (ate * 1000.0).round() / 1000.0, ci95, direction, probability_positive: (probability_positive * 1000.0).round() / 1000.0 },
        propensity: Propensity { treated_rate, min_weight, max_weight },
        diagnostics: Diagnostics { n_treated, n_control, effective_sample_size },
        caveats: vec!["propensity estimated from overall treatment rate, not per-confounder".to_string()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(treated: bool, outcome: f64) -> CausalSample {
        CausalSample { treated, outcome, confounders: HashMap::new() }
    }

    #[test]
    fn insufficient_data_below_threshold() {
        let samples = vec![sample(true, 0.5); 3];
        assert!(matches!(run_causal_estimate(&samples, 10), CausalResult::InsufficientData { .. }));
    }

    #[test]
    fn no_variation_in_treatment_is_insufficient() {
        let samples = vec![sample(true, 0.5); 20];
        assert!(matches!(run_causal_estimate(&samples, 10), CausalResult::InsufficientData { .. }));
    }

    #[test]
    fn clear_positive_effect_is_detected() {
        let mut samples = Vec::new();
        for _ in 0..15 {
            samples.push(sample(true, 0.9));
            samples.push(sample(false, 0.5));
        }
        if let CausalResult::Ok(ok) = run_causal_estimate(&samples, 10) {
            assert!(ok.effect.mean_ate > 0.0);
        } else {
            panic!("expected Ok");
        }
    }
}
