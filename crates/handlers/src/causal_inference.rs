//! Causal inference handler (spec §4.4.6).
//!
//! Builds rolling daily context (sleep, energy, soreness, load, protein,
//! calories), forms IPW samples for three interventions
//! (`program_change`, `nutrition_shift`, `sleep_intervention`) over
//! `history_days_required = 7` past days + the current + next day, and
//! passes each intervention's samples to the causal estimator.

use async_trait::async_trait;
use kura_core::Payload;
use kura_events::ProjectionWrite;
use kura_inference::{run_causal_estimate, CausalSample};
use kura_registry::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

use crate::shared::{load_active_typed_events, load_user_context, local_date, record_inference_run, round_n};

pub const DIMENSION: &str = "causal_inference";
const SOURCE_EVENT_TYPES: &[&str] =
    &["sleep.logged", "energy.logged", "soreness.logged", "set.logged", "meal.logged", "training_plan.created", "training_plan.updated", "sleep_target.set", "nutrition_target.set"];
const HISTORY_DAYS_REQUIRED: usize = 7;
const SLEEP_SHIFT_HOURS: f64 = 0.75;
const PROTEIN_SHIFT_G: f64 = 20.0;
const INTERVENTIONS: &[&str] = &["program_change", "nutrition_shift", "sleep_intervention"];

pub struct CausalInferenceHandler {
    pub min_samples: usize,
}

impl CausalInferenceHandler {
    pub fn new(min_samples: usize) -> Self {
        Self { min_samples }
    }
}

#[async_trait]
impl Handler for CausalInferenceHandler {
    fn dimension(&self) -> &'static str {
        DIMENSION
    }

    async fn handle(&self, ctx: &HandlerContext, invocation: &HandlerInvocation) -> HandlerOutcome {
        let user_id = invocation.user_id;
        let user_ctx = match load_user_context(ctx, user_id).await {
            Ok(c) => c,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        let events = match load_active_typed_events(ctx, user_id, SOURCE_EVENT_TYPES, &user_ctx.retracted).await {
            Ok(events) => events,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        if events.is_empty() {
            if let Err(e) = ctx.projections.delete(user_id, DIMENSION, "overview").await {
                return HandlerOutcome::Retryable(e.to_string());
            }
            return HandlerOutcome::Completed;
        }

        let daily_context = build_daily_context(&events, user_ctx.timezone);
        let samples_by_intervention = build_samples(&daily_context);
        let last_event_id = events.last().map(|e| e.event_id);

        let mut intervention_results = serde_json::Map::new();
        for name in INTERVENTIONS {
            let started_at = chrono::Utc::now();
            let samples = samples_by_intervention.get(*name).cloned().unwrap_or_default();
            let treated = samples.iter().filter(|s| s.treated).count();
            let result = run_causal_estimate(&samples, self.min_samples);
            let result_value = serde_json::to_value(&result).unwrap_or(json!({}));

            let status = match &result {
                kura_inference::CausalResult::Ok(_) => kura_events::InferenceStatus::Success,
                kura_inference::CausalResult::InsufficientData { .. } => kura_events::InferenceStatus::Skipped,
            };
            record_inference_run(ctx, user_id, DIMENSION, name, "ipw_causal_estimate", status, result_value.clone(), None, started_at).await;

            intervention_results.insert(
                name.to_string(),
                json!({
                    "windows_evaluated": samples.len(),
                    "treated_windows": treated,
                    "result": result_value,
                }),
            );
        }

        let data = json!({
            "history_days_required": HISTORY_DAYS_REQUIRED,
            "daily_context_days": daily_context.len(),
            "interventions": serde_json::Value::Object(intervention_results),
        });
        let write = ProjectionWrite::new(user_id, DIMENSION, "overview".to_string(), Payload::new(data), last_event_id);
        if let Err(e) = ctx.projections.upsert(write).await {
            return HandlerOutcome::Retryable(e.to_string());
        }
        HandlerOutcome::Completed
    }

    fn manifest_contribution(&self, projection_data: &Payload) -> serde_json::Value {
        let Some(rows) = projection_data.get_array("rows") else { return serde_json::Value::Null };
        let Some(data) = rows.first().and_then(|r| r.get("data")) else { return json!({}) };
        let Some(interventions) = data.get("interventions").and_then(|v| v.as_object()) else { return json!({}) };

        let available: Vec<&String> = interventions
            .iter()
            .filter(|(_, v)| v.get("result").and_then(|r| r.get("status")).and_then(|s| s.as_str()) == Some("ok"))
            .map(|(name, _)| name)
            .collect();

        let mut strongest_name: Option<&str> = None;
        let mut strongest_value = 0.0_f64;
        for (name, payload) in interventions {
            let mean_ate = payload.get("result").and_then(|r| r.get("effect")).and_then(|e| e.get("mean_ate")).and_then(|v| v.as_f64()).unwrap_or(0.0);
            if mean_ate.abs() > strongest_value.abs() {
                strongest_name = Some(name);
                strongest_value = mean_ate;
            }
        }

        let mut result = json!({
            "interventions_modeled": available,
            "insight_count": available.len(),
        });
        if let Some(name) = strongest_name {
            result["strongest_signal"] = json!({"intervention": name, "mean_ate": strongest_value});
        }
        result
    }
}

#[derive(Clone, Default)]
struct DayContext {
    readiness_score: f64,
    sleep_hours: f64,
    load_volume: f64,
    protein_g: f64,
    program_change_event: bool,
    sleep_target_event: bool,
    nutrition_target_event: bool,
}

fn build_daily_context(events: &[kura_events::Event], timezone: chrono_tz::Tz) -> Vec<DayContext> {
    #[derive(Default)]
    struct RawDay {
        sleep_sum: f64,
        sleep_n: usize,
        energy_sum: f64,
        energy_n: usize,
        soreness_sum: f64,
        soreness_n: usize,
        load_volume: f64,
        protein_g: f64,
        program_change_event: bool,
        sleep_target_event: bool,
        nutrition_target_event: bool,
    }

    let mut by_day: BTreeMap<chrono::NaiveDate, RawDay> = BTreeMap::new();
    for event in events {
        let day = local_date(event.timestamp, timezone);
        let bucket = by_day.entry(day).or_default();
        match event.event_type.as_str() {
            "sleep.logged" => {
                if let Some(h) = event.data.get_f64("duration_hours") {
                    bucket.sleep_sum += h;
                    bucket.sleep_n += 1;
                }
            }
            "energy.logged" => {
                if let Some(l) = event.data.get_f64("level") {
                    bucket.energy_sum += l;
                    bucket.energy_n += 1;
                }
            }
            "soreness.logged" => {
                if let Some(s) = event.data.get_f64("severity") {
                    bucket.soreness_sum += s;
                    bucket.soreness_n += 1;
                }
            }
            "set.logged" => {
                let weight = event.data.get_f64("weight_kg").unwrap_or(0.0);
                let reps = event.data.get_f64("reps").unwrap_or(0.0);
                bucket.load_volume += weight * reps;
            }
            "meal.logged" => {
                bucket.protein_g += event.data.get_f64("protein_g").unwrap_or(0.0);
            }
            "training_plan.created" | "training_plan.updated" => bucket.program_change_event = true,
            "sleep_target.set" => bucket.sleep_target_event = true,
            "nutrition_target.set" => bucket.nutrition_target_event = true,
            _ => {}
        }
    }

    let load_values: Vec<f64> = by_day.values().map(|d| d.load_volume).filter(|v| *v > 0.0).collect();
    let load_baseline = median(&load_values).max(1.0);

    by_day
        .into_values()
        .map(|bucket| {
            let sleep_hours = if bucket.sleep_n > 0 { bucket.sleep_sum / bucket.sleep_n as f64 } else { 6.5 };
            let energy = if bucket.energy_n > 0 { bucket.energy_sum / bucket.energy_n as f64 } else { 6.0 };
            let soreness_avg = if bucket.soreness_n > 0 { bucket.soreness_sum / bucket.soreness_n as f64 } else { 0.0 };

            let sleep_score = (sleep_hours / 8.0).clamp(0.0, 1.2);
            let energy_score = (energy / 10.0).clamp(0.0, 1.0);
            let soreness_penalty = (soreness_avg / 5.0).clamp(0.0, 1.0);
            let load_penalty = (bucket.load_volume / load_baseline).clamp(0.0, 1.4);
            let readiness_score = (0.45 * sleep_score + 0.35 * energy_score - 0.20 * soreness_penalty - 0.15 * load_penalty + 0.25).clamp(0.0, 1.0);

            DayContext {
                readiness_score: round_n(readiness_score, 3),
                sleep_hours: round_n(sleep_hours, 2),
                load_volume: round_n(bucket.load_volume, 2),
                protein_g: round_n(bucket.protein_g, 2),
                program_change_event: bucket.program_change_event,
                sleep_target_event: bucket.sleep_target_event,
                nutrition_target_event: bucket.nutrition_target_event,
            }
        })
        .collect()
}

fn build_samples(daily_context: &[DayContext]) -> HashMap<String, Vec<CausalSample>> {
    let mut samples: HashMap<String, Vec<CausalSample>> = INTERVENTIONS.iter().map(|n| (n.to_string(), Vec::new())).collect();
    if daily_context.len() <= HISTORY_DAYS_REQUIRED + 1 {
        return samples;
    }

    for idx in HISTORY_DAYS_REQUIRED..daily_context.len() - 1 {
        let current = &daily_context[idx];
        let next_day = &daily_context[idx + 1];
        let history = &daily_context[idx - HISTORY_DAYS_REQUIRED..idx];

        let baseline_readiness = mean(history.iter().map(|d| d.readiness_score), 0.5);
        let baseline_sleep = mean(history.iter().map(|d| d.sleep_hours), 6.5);
        let baseline_load = mean(history.iter().map(|d| d.load_volume), 0.0);
        let baseline_protein = mean(history.iter().map(|d| d.protein_g), 0.0);

        let sleep_shift = current.sleep_hours >= baseline_sleep + SLEEP_SHIFT_HOURS;
        let nutrition_shift = current.protein_g >= baseline_protein + PROTEIN_SHIFT_G;

        let mut confounders = HashMap::new();
        confounders.insert("baseline_readiness".to_string(), baseline_readiness);
        confounders.insert("baseline_sleep_hours".to_string(), baseline_sleep);
        confounders.insert("baseline_load_volume".to_string(), baseline_load);
        confounders.insert("baseline_protein_g".to_string(), baseline_protein);
        confounders.insert("current_readiness".to_string(), current.readiness_score);
        confounders.insert("current_sleep_hours".to_string(), current.sleep_hours);
        confounders.insert("current_load_volume".to_string(), current.load_volume);
        confounders.insert("current_protein_g".to_string(), current.protein_g);

        let outcome = next_day.readiness_score;
        samples.get_mut("program_change").unwrap().push(CausalSample { treated: current.program_change_event, outcome, confounders: confounders.clone() });
        samples.get_mut("nutrition_shift").unwrap().push(CausalSample { treated: current.nutrition_target_event || nutrition_shift, outcome, confounders: confounders.clone() });
        samples.get_mut("sleep_intervention").unwrap().push(CausalSample { treated: current.sleep_target_event || sleep_shift, outcome, confounders });
    }
    samples
}

fn mean(values: impl Iterator<Item = f64>, fallback: f64) -> f64 {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        fallback
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fewer_than_history_window_yields_no_samples() {
        let daily_context = vec![DayContext::default(); 3];
        let samples = build_samples(&daily_context);
        assert!(samples["program_change"].is_empty());
    }

    #[test]
    fn enough_days_produces_one_sample_per_eligible_day() {
        let daily_context = vec![DayContext::default(); 12];
        let samples = build_samples(&daily_context);
        assert_eq!(samples["program_change"].len(), 12 - HISTORY_DAYS_REQUIRED - 1);
    }
}
