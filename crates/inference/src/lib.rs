//! External inference collaborators (spec §4.7): strength trend/forecast,
//! readiness posterior, and a causal effect estimator. Fixed contracts and
//! insufficient-data thresholds per spec; internals are simplified
//! closed-form models, not a port of any proprietary statistical library.

mod causal;
mod math2x2;
mod readiness;
mod strength;

pub use causal::{run_causal_estimate, CausalOk, CausalResult, CausalSample, Effect, EffectDirection};
pub use readiness::{ReadinessOk, ReadinessParams, ReadinessResult, ReadinessState, run_readiness_inference};
pub use strength::{StrengthOk, StrengthParams, StrengthResult, run_strength_inference};
