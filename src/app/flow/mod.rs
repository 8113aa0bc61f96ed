pub mod compiler;
pub mod condition;
pub mod graph;
pub mod runtime;

pub use compiler::{compile, CompiledPlan};
pub use condition::{Condition, FlowRuntimeContext};
pub use graph::{GraphDefinition, NodeKind};
pub use runtime::{FlowEngine, FlowResponse, RuntimeState};
