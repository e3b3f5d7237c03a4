//! 核心协调层：碎片聚合、限流派发、人工接管、意图延续、回合编排

pub mod aggregator;
pub mod builder;
pub mod carry_over;
pub mod dispatcher;
pub mod error;
pub mod normalizer;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod takeover;
pub mod topic;

pub use aggregator::{
    AggregatorSettings, BatchHandler, ConversationKey, FireReason, FragmentAggregator, ReadyBatch,
};
pub use builder::{create_llm_from_config, Coordinator, CoordinatorBuilder};
pub use carry_over::{
    CarryOutcome, CarryOverSettings, IntentCarryOver, ProductGroup, Subtopic,
};
pub use dispatcher::{DispatchRequest, DispatchResponse, DispatchSettings, Dispatcher};
pub use error::{DispatchError, FailureClass, RecoveryAction};
pub use normalizer::{
    JoinNormalizer, ReassemblyNormalizer, TurnNormalizer, FRAGMENT_SEPARATOR,
};
pub use orchestrator::{TurnOrchestrator, TurnOutcome, TurnSettings};
pub use recovery::RecoveryEngine;
pub use shutdown::ShutdownManager;
pub use state::CoordinatorState;
pub use takeover::{TakeoverGate, TakeoverState};
pub use topic::{KeywordTopicPolicy, NoTopicReset, TopicPolicy};
