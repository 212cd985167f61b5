//! Training plan handler (spec §4.4.3).
//!
//! The only prescriptive dimension: replays `training_plan.created/updated/
//! archived` to reconstruct the currently active plan (latest non-archived
//! by creation time) plus a short archived-plan history.

use async_trait::async_trait;
use kura_core::Payload;
use kura_events::{Event, ProjectionWrite};
use kura_registry::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::shared::{load_active_typed_events, load_user_context};

pub const DIMENSION: &str = "training_plan";
const ARCHIVE_HISTORY_LIMIT: usize = 5;
const SOURCE_EVENT_TYPES: &[&str] = &["training_plan.created", "training_plan.updated", "training_plan.archived"];

pub struct TrainingPlanHandler;

#[async_trait]
impl Handler for TrainingPlanHandler {
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

        let last_event_id = events.last().map(|e| e.event_id);
        let data = build_overview(&events);
        let write = ProjectionWrite::new(user_id, DIMENSION, "overview".to_string(), Payload::new(data), last_event_id);
        if let Err(e) = ctx.projections.upsert(write).await {
            return HandlerOutcome::Retryable(e.to_string());
        }
        HandlerOutcome::Completed
    }

    fn manifest_contribution(&self, projection_data: &Payload) -> Value {
        let Some(rows) = projection_data.get_array("rows") else { return Value::Null };
        let Some(data) = rows.first().and_then(|r| r.get("data")) else { return json!({}) };
        let mut result = serde_json::Map::new();
        match data.get("active_plan").filter(|v| !v.is_null()) {
            Some(active) => {
                result.insert("has_active_plan".to_string(), Value::Bool(true));
                result.insert("plan_name".to_string(), active.get("name").cloned().unwrap_or_else(|| Value::String("unnamed".to_string())));
                let sessions = active.get("sessions").and_then(Value::as_array).map(Vec::len).unwrap_or(0);
                result.insert("sessions_per_week".to_string(), json!(sessions));
            }
            None => {
                result.insert("has_active_plan".to_string(), Value::Bool(false));
            }
        }
        result.insert("total_plans".to_string(), data.get("total_plans").cloned().unwrap_or(json!(0)));
        Value::Object(result)
    }
}

fn build_overview(events: &[Event]) -> Value {
    let mut plans: BTreeMap<String, Value> = BTreeMap::new();
    let mut archived_plans: Vec<Value> = Vec::new();

    for event in events {
        let plan_id = event.data.get_str("plan_id").unwrap_or("default").to_string();
        match event.event_type.as_str() {
            "training_plan.created" => {
                plans.insert(
                    plan_id.clone(),
                    json!({
                        "plan_id": plan_id,
                        "name": event.data.get_str("name").unwrap_or("unnamed"),
                        "created_at": event.timestamp,
                        "updated_at": event.timestamp,
                        "status": "active",
                        "sessions": event.data.get("sessions").cloned().unwrap_or_else(|| json!([])),
                        "cycle_weeks": event.data.get("cycle_weeks").cloned().unwrap_or(Value::Null),
                        "notes": event.data.get("notes").cloned().unwrap_or(Value::Null),
                    }),
                );
            }
            "training_plan.updated" => {
                if let Some(plan) = plans.get_mut(&plan_id) {
                    plan["updated_at"] = json!(event.timestamp);
                    if let Some(v) = event.data.get("name") {
                        plan["name"] = v.clone();
                    }
                    if let Some(v) = event.data.get("sessions") {
                        plan["sessions"] = v.clone();
                    }
                    if let Some(v) = event.data.get("cycle_weeks") {
                        plan["cycle_weeks"] = v.clone();
                    }
                    if let Some(v) = event.data.get("notes") {
                        plan["notes"] = v.clone();
                    }
                }
            }
            "training_plan.archived" => {
                if let Some(mut plan) = plans.remove(&plan_id) {
                    plan["status"] = json!("archived");
                    plan["archived_at"] = json!(event.timestamp);
                    if let Some(reason) = event.data.get_str("reason") {
                        plan["archive_reason"] = json!(reason);
                    }
                    archived_plans.push(plan);
                }
            }
            _ => {}
        }
    }

    let total_plans = plans.len() + archived_plans.len();
    let mut remaining: Vec<Value> = plans.into_values().collect();
    remaining.sort_by(|a, b| a["created_at"].as_str().cmp(&b["created_at"].as_str()));
    for plan in remaining.iter_mut().rev().skip(1) {
        plan["status"] = json!("inactive");
    }
    let active_plan = remaining.pop();

    let start = archived_plans.len().saturating_sub(ARCHIVE_HISTORY_LIMIT);
    json!({
        "active_plan": active_plan,
        "total_plans": total_plans,
        "plan_history": archived_plans[start..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use kura_core::UserId;

    fn event(event_type: &str, data: Value, ts: chrono::DateTime<Utc>) -> Event {
        Event {
            event_id: kura_core::EventId::new(),
            user_id: UserId::new(),
            timestamp: ts,
            event_type: event_type.to_string(),
            data: Payload::new(data),
            metadata: Payload::empty(),
        }
    }

    #[test]
    fn latest_created_plan_is_active() {
        let now = Utc::now();
        let events = vec![
            event("training_plan.created", json!({"plan_id": "a", "name": "Base"}), now),
            event("training_plan.created", json!({"plan_id": "b", "name": "Peak"}), now + Duration::days(1)),
        ];
        let data = build_overview(&events);
        assert_eq!(data["active_plan"]["plan_id"], json!("b"));
        assert_eq!(data["total_plans"], json!(2));
    }

    #[test]
    fn archived_plan_is_removed_from_active_set() {
        let now = Utc::now();
        let events = vec![
            event("training_plan.created", json!({"plan_id": "a", "name": "Base"}), now),
            event("training_plan.archived", json!({"plan_id": "a"}), now + Duration::days(1)),
        ];
        let data = build_overview(&events);
        assert!(data["active_plan"].is_null());
        assert_eq!(data["plan_history"].as_array().unwrap().len(), 1);
    }
}
