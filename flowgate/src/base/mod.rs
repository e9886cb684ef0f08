//! Types shared by every part of the entry pipeline.

mod context;
mod resource;
mod result;
mod slot_chain;
mod tok_result;

pub use context::ContextPool;
pub use context::EntryContext;
pub use context::EntryInput;
pub use resource::ResourceType;
pub use resource::ResourceWrapper;
pub use resource::TrafficType;
pub use result::BlockError;
pub use result::BlockRule;
pub use result::BlockType;
pub use result::ResultStatus;
pub use result::TokenResult;
pub use slot_chain::BaseSlot;
pub use slot_chain::RouterSlot;
pub use slot_chain::RuleCheckSlot;
pub use slot_chain::SlotChain;
pub use slot_chain::StatPrepareSlot;
pub use slot_chain::StatSlot;
pub use tok_result::TokResult;
pub use tok_result::TokResultStatus;

/// Error type recorded on a context by the guarded business logic.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
