pub mod agent;
pub mod reaction;
pub mod replay;
pub mod seasonal;

pub use agent::*;
pub use reaction::*;
pub use replay::*;
pub use seasonal::*;

use serde::{Deserialize, Serialize};

/// Schema version of the persisted learning documents.
pub const RESIDUAL_SCHEMA_VERSION: u32 = 1;
pub const RESIDUAL_DOC: &str = "residual_agent";
pub const REPLAY_DOC: &str = "replay_buffer";

/// Everything the learning layer persists besides the replay buffer: the
/// agent table plus the seasonal and reaction trackers, which share the
/// agent's schema version and rebuild-on-mismatch policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningState {
    pub agent: AgentTable,
    pub seasonal: SeasonalLearner,
    pub reaction: ReactionTimingTracker,
}
