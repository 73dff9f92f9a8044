mod context;
mod engine;
mod state;

pub use context::{StateSnapshot, TransitionContext, TransitionOptions, TransitionResult};
pub use engine::TransitionEngine;
pub use state::{GuardFn, GuardInput, TableBuilder, TransitionTable, WorkflowState};
