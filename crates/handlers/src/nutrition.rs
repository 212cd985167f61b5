//! Nutrition handler (spec §4.4.3).
//!
//! Single `overview` key folding `meal.logged` into recent entries, daily
//! totals, and weekly averages for calories/protein/carbs/fat, plus the
//! latest non-retracted `nutrition_target.set`. The original implementation
//! tracked nutrition as raw meal entries only; this port adds the same
//! daily/weekly rollups the other recovery-adjacent dimensions carry so
//! `user_profile` and the quality engine can reason about it uniformly.

use async_trait::async_trait;
use chrono::NaiveDate;
use kura_core::Payload;
use kura_events::{Event, ProjectionWrite};
use kura_registry::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::shared::{iso_week_key, load_active_typed_events, load_user_context, round_n, DataQuality};

pub const DIMENSION: &str = "nutrition";
const KNOWN_MEAL: &[&str] = &["calories", "protein_g", "carbs_g", "fat_g", "meal_type", "description"];
const RECENT_LIMIT: usize = 30;
const WEEKLY_WEEKS: usize = 26;

pub struct NutritionHandler;

#[async_trait]
impl Handler for NutritionHandler {
    fn dimension(&self) -> &'static str {
        DIMENSION
    }

    async fn handle(&self, ctx: &HandlerContext, invocation: &HandlerInvocation) -> HandlerOutcome {
        let user_id = invocation.user_id;
        let user_ctx = match load_user_context(ctx, user_id).await {
            Ok(c) => c,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        let events = match load_active_typed_events(ctx, user_id, &["meal.logged"], &user_ctx.retracted).await {
            Ok(events) => events,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        let target = match load_active_typed_events(ctx, user_id, &["nutrition_target.set"], &user_ctx.retracted).await {
            Ok(events) => events.last().map(|e| e.data.as_value().clone()),
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };

        if events.is_empty() && target.is_none() {
            if let Err(e) = ctx.projections.delete(user_id, DIMENSION, "overview").await {
                return HandlerOutcome::Retryable(e.to_string());
            }
            return HandlerOutcome::Completed;
        }

        let last_event_id = events.last().map(|e| e.event_id);
        let data = build_overview(&events, target, user_ctx.timezone);
        let write = ProjectionWrite::new(user_id, DIMENSION, "overview".to_string(), Payload::new(data), last_event_id);
        if let Err(e) = ctx.projections.upsert(write).await {
            return HandlerOutcome::Retryable(e.to_string());
        }
        HandlerOutcome::Completed
    }
}

#[derive(Default, Clone, Copy)]
struct Macros {
    calories: f64,
    protein_g: f64,
    carbs_g: f64,
    fat_g: f64,
    meals: usize,
}

fn build_overview(events: &[Event], target: Option<Value>, timezone: chrono_tz::Tz) -> Value {
    let mut dq = DataQuality::new();
    let mut recent_entries: Vec<Value> = Vec::new();
    let mut by_day: BTreeMap<NaiveDate, Macros> = BTreeMap::new();
    let mut by_week: BTreeMap<String, Vec<Macros>> = BTreeMap::new();

    for event in events {
        crate::shared::note_unknown_fields(&mut dq, event, KNOWN_MEAL);
        let local_date = crate::shared::local_date(event.timestamp, timezone);
        let macros = Macros {
            calories: event.data.get_f64("calories").unwrap_or(0.0),
            protein_g: event.data.get_f64("protein_g").unwrap_or(0.0),
            carbs_g: event.data.get_f64("carbs_g").unwrap_or(0.0),
            fat_g: event.data.get_f64("fat_g").unwrap_or(0.0),
            meals: 1,
        };
        if event.data.get("calories").is_none() && event.data.get("protein_g").is_none() && event.data.get("carbs_g").is_none() && event.data.get("fat_g").is_none() {
            dq.add_field_hint("meal.logged", "no macro fields present on this entry");
        }

        let mut entry = Map::new();
        entry.insert("date".into(), json!(local_date.to_string()));
        entry.insert("calories".into(), json!(macros.calories));
        entry.insert("protein_g".into(), json!(macros.protein_g));
        entry.insert("carbs_g".into(), json!(macros.carbs_g));
        entry.insert("fat_g".into(), json!(macros.fat_g));
        if let Some(t) = event.data.get_str("meal_type") {
            entry.insert("meal_type".into(), json!(t));
        }
        recent_entries.push(Value::Object(entry));

        let day_entry = by_day.entry(local_date).or_default();
        day_entry.calories += macros.calories;
        day_entry.protein_g += macros.protein_g;
        day_entry.carbs_g += macros.carbs_g;
        day_entry.fat_g += macros.fat_g;
        day_entry.meals += 1;

        by_week.entry(iso_week_key(local_date)).or_default().push(macros);
    }

    let start = recent_entries.len().saturating_sub(RECENT_LIMIT);
    let recent_entries = recent_entries[start..].to_vec();

    let mut weeks: Vec<&String> = by_week.keys().collect();
    weeks.sort();
    if weeks.len() > WEEKLY_WEEKS {
        let drop = weeks.len() - WEEKLY_WEEKS;
        weeks.drain(0..drop);
    }
    let weekly_average: Vec<Value> = weeks
        .iter()
        .map(|week| {
            let values = &by_week[*week];
            let n = values.len() as f64;
            json!({
                "week": week,
                "avg_calories": round_n(values.iter().map(|m| m.calories).sum::<f64>() / n, 0),
                "avg_protein_g": round_n(values.iter().map(|m| m.protein_g).sum::<f64>() / n, 1),
                "avg_carbs_g": round_n(values.iter().map(|m| m.carbs_g).sum::<f64>() / n, 1),
                "avg_fat_g": round_n(values.iter().map(|m| m.fat_g).sum::<f64>() / n, 1),
                "meals": values.len(),
            })
        })
        .collect();

    let total_meals: usize = by_day.values().map(|d| d.meals).sum();
    let mut out = json!({
        "total_meals_logged": total_meals,
        "recent_entries": recent_entries,
        "weekly_average": weekly_average,
        "data_quality": dq.into_value(),
    });
    if let Some(target) = target {
        out["target"] = target;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kura_core::UserId;

    fn event(data: Value) -> Event {
        Event {
            event_id: kura_core::EventId::new(),
            user_id: UserId::new(),
            timestamp: Utc::now(),
            event_type: "meal.logged".to_string(),
            data: Payload::new(data),
            metadata: Payload::empty(),
        }
    }

    #[test]
    fn aggregates_macros_across_entries() {
        let events = vec![event(json!({"calories": 500, "protein_g": 30})), event(json!({"calories": 300, "protein_g": 10}))];
        let data = build_overview(&events, None, chrono_tz::Tz::UTC);
        assert_eq!(data["total_meals_logged"], json!(2));
    }

    #[test]
    fn entry_without_macros_gets_a_field_hint() {
        let events = vec![event(json!({"meal_type": "lunch"}))];
        let data = build_overview(&events, None, chrono_tz::Tz::UTC);
        assert!(!data["data_quality"]["field_hints"].as_array().unwrap().is_empty());
    }
}
