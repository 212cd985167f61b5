//! The twelve projection handlers (spec §4.4) plus the shared helpers they're
//! built from (spec §4.4's common contract) and [`register_all`], which
//! wires every handler into a [`Registry`] in the fixed order the spec
//! requires (`user_profile` last, since its system layer reflects every
//! other dimension).

pub mod body_composition;
pub mod causal_inference;
pub mod custom_projection;
pub mod exercise_progression;
pub mod nutrition;
pub mod quality_health;
pub mod readiness_inference;
pub mod recovery;
pub mod schema_capabilities;
pub mod shared;
pub mod strength_inference;
pub mod training_plan;
pub mod training_timeline;
pub mod user_profile;

use std::sync::{Arc, OnceLock};

use kura_inference::{ReadinessParams, StrengthParams};
use kura_registry::{DimensionMeta, Registry};
use serde_json::json;

/// Tunables threaded into handler construction at startup (spec §4.6's
/// `config` concern) — everything a deployment might reasonably want to
/// adjust without a code change.
#[derive(Debug, Clone)]
pub struct HandlersConfig {
    pub strength_params: StrengthParams,
    pub readiness_params: ReadinessParams,
    pub causal_min_samples: usize,
    pub training_load_v2_enabled: bool,
    pub allow_tier_a_auto_apply: bool,
}

impl Default for HandlersConfig {
    fn default() -> Self {
        Self {
            strength_params: StrengthParams::default(),
            readiness_params: ReadinessParams::default(),
            causal_min_samples: 5,
            training_load_v2_enabled: false,
            allow_tier_a_auto_apply: true,
        }
    }
}

/// Builds the full registry and returns it behind the same deferred handle
/// the quality-health and user-profile handlers use to dry-run proposals
/// and enumerate dimensions — `Registry` holds no self-reference, so every
/// consumer (this function included) reaches it through the cell rather
/// than taking ownership.
pub fn register_all(config: &HandlersConfig) -> Arc<OnceLock<Registry>> {
    let cell: Arc<OnceLock<Registry>> = Arc::new(OnceLock::new());
    let quality_handler = quality_health::QualityHealthHandler::new(config.allow_tier_a_auto_apply, cell.clone());
    let profile_handler = user_profile::UserProfileHandler::new(cell.clone());

    let registry = Registry::builder()
        .register(
            &["bodyweight.logged", "measurement.logged", "weight_target.set"],
            Arc::new(body_composition::BodyCompositionHandler),
            DimensionMeta {
                name: body_composition::DIMENSION,
                description: "Bodyweight and body measurements over time",
                key_shape: "single `overview` key",
                granularity_tags: &["day", "week", "all_time"],
                related_dimensions: &["training_timeline", "recovery"],
                context_seeds: &["body_composition_goals", "weigh_in_habits", "measurement_preferences"],
                output_schema: json!({"recent": "array", "weekly": "array", "all_time": "object", "target": "object|null"}),
            },
        )
        .register(
            &["sleep.logged", "soreness.logged", "energy.logged", "sleep_target.set"],
            Arc::new(recovery::RecoveryHandler),
            DimensionMeta {
                name: recovery::DIMENSION,
                description: "Recovery signals: sleep, soreness, energy levels",
                key_shape: "single `overview` key",
                granularity_tags: &["day", "week"],
                related_dimensions: &["training_timeline", "body_composition"],
                context_seeds: &["sleep_habits", "recovery_priorities", "stress_factors"],
                output_schema: json!({"recent": "array", "weekly": "array"}),
            },
        )
        .register(
            &["meal.logged", "nutrition_target.set"],
            Arc::new(nutrition::NutritionHandler),
            DimensionMeta {
                name: nutrition::DIMENSION,
                description: "Meal logging: calories and macros over time",
                key_shape: "single `overview` key",
                granularity_tags: &["day", "week"],
                related_dimensions: &["recovery", "causal_inference"],
                context_seeds: &["nutrition_tracking_interest", "dietary_preferences"],
                output_schema: json!({"recent": "array", "weekly": "array", "target": "object|null"}),
            },
        )
        .register(
            &["training_plan.created", "training_plan.updated", "training_plan.archived"],
            Arc::new(training_plan::TrainingPlanHandler),
            DimensionMeta {
                name: training_plan::DIMENSION,
                description: "Prescribed training: what should happen when",
                key_shape: "single `overview` key",
                granularity_tags: &["session", "week", "cycle"],
                related_dimensions: &["training_timeline", "exercise_progression"],
                context_seeds: &["training_goals", "program_preferences"],
                output_schema: json!({"active_plan": "object|null", "history": "array"}),
            },
        )
        .register(
            &["set.logged", "session.completed", "activity.imported"],
            Arc::new(training_timeline::TrainingTimelineHandler::new(config.training_load_v2_enabled)),
            DimensionMeta {
                name: training_timeline::DIMENSION,
                description: "Training patterns: when, what, how much",
                key_shape: "single `overview` key",
                granularity_tags: &["day", "week"],
                related_dimensions: &["exercise_progression", "training_plan"],
                context_seeds: &["training_frequency_per_week", "typical_session_length"],
                output_schema: json!({"recent_sessions": "array", "weekly_load": "array"}),
            },
        )
        .register(
            &["set.logged", "set.corrected"],
            Arc::new(exercise_progression::ExerciseProgressionHandler),
            DimensionMeta {
                name: exercise_progression::DIMENSION,
                description: "Strength progression per exercise over time",
                key_shape: "one key per canonical exercise",
                granularity_tags: &["set", "week"],
                related_dimensions: &["training_timeline", "user_profile"],
                context_seeds: &["exercise_vocabulary", "training_modality", "experience_level", "typical_rep_ranges"],
                output_schema: json!({"recent_sessions": "array", "weekly_rollup": "array"}),
            },
        )
        .register(
            &["set.logged", "set.corrected"],
            Arc::new(strength_inference::StrengthInferenceHandler::new(config.strength_params)),
            DimensionMeta {
                name: strength_inference::DIMENSION,
                description: "Closed-form strength trend and near-term forecast per exercise",
                key_shape: "one key per canonical exercise",
                granularity_tags: &["session", "week", "forecast"],
                related_dimensions: &["exercise_progression", "training_timeline"],
                context_seeds: &["goals", "experience_level", "injuries", "training_modality"],
                output_schema: json!({"trend": "object|null", "forecast": "object|null"}),
            },
        )
        .register(
            &["sleep.logged", "energy.logged", "soreness.logged", "set.logged"],
            Arc::new(readiness_inference::ReadinessInferenceHandler::new(config.readiness_params)),
            DimensionMeta {
                name: readiness_inference::DIMENSION,
                description: "Day-level readiness estimate from recovery and load signals",
                key_shape: "single `overview` key",
                granularity_tags: &["day", "week"],
                related_dimensions: &["recovery", "training_timeline"],
                context_seeds: &["readiness_signals_of_interest"],
                output_schema: json!({"estimate": "object|null"}),
            },
        )
        .register(
            &[
                "training_plan.created",
                "training_plan.updated",
                "training_plan.archived",
                "meal.logged",
                "nutrition_target.set",
                "sleep.logged",
                "sleep_target.set",
                "set.logged",
                "energy.logged",
                "soreness.logged",
            ],
            Arc::new(causal_inference::CausalInferenceHandler::new(config.causal_min_samples)),
            DimensionMeta {
                name: causal_inference::DIMENSION,
                description: "Observational intervention-effect estimates via inverse-propensity weighting",
                key_shape: "one key per intervention",
                granularity_tags: &["intervention_window"],
                related_dimensions: &["readiness_inference", "training_plan"],
                context_seeds: &["program_change_history"],
                output_schema: json!({"windows_evaluated": "number", "result": "object"}),
            },
        )
        .register(
            custom_projection::RULE_LIFECYCLE_EVENT_TYPES,
            Arc::new(custom_projection::CustomProjectionHandler::new()),
            DimensionMeta {
                name: custom_projection::PROJECTION_TYPE,
                description: "Agent-declared ad hoc projections: field tracking or categorized tracking",
                key_shape: "one key per declared rule name",
                granularity_tags: &["day", "category"],
                related_dimensions: &["user_profile"],
                context_seeds: &[],
                output_schema: json!({"kind": "field_tracking|categorized_tracking"}),
            },
        )
        .register(
            &[
                "set.logged",
                "set.corrected",
                "exercise.alias_created",
                "preference.set",
                "profile.updated",
                "goal.set",
                "bodyweight.logged",
                "projection_rule.created",
                "projection_rule.archived",
                "training_plan.created",
                "training_plan.updated",
                "training_plan.archived",
                "weight_target.set",
                "sleep_target.set",
                "nutrition_target.set",
                "quality.fix.applied",
                "quality.fix.rejected",
                "quality.issue.closed",
            ],
            Arc::new(quality_handler),
            DimensionMeta {
                name: quality_health::DIMENSION,
                description: "Invariant health and policy-gated repair proposals",
                key_shape: "single `overview` key",
                granularity_tags: &["snapshot"],
                related_dimensions: &["user_profile"],
                context_seeds: &[],
                output_schema: json!({"quality_score": "number", "status": "string", "proposals": "array"}),
            },
        )
        .register(user_profile::RELEVANT_EVENT_TYPES, Arc::new(profile_handler), {
            DimensionMeta {
                name: user_profile::DIMENSION,
                description: "The agent's three-layer entry point: system capabilities, user identity, proactive agenda",
                key_shape: "single `me` key",
                granularity_tags: &["snapshot"],
                related_dimensions: &["exercise_progression", "quality_health"],
                context_seeds: &[],
                output_schema: json!({"system": "object", "user": "object", "agenda": "array"}),
            }
        })
        .build();

    cell.set(registry).unwrap_or_else(|_| unreachable!("register_all populates its own fresh cell exactly once"));
    cell
}
