pub mod assembler;
#[path = "loop.rs"]
pub mod agent_loop;
pub mod tools;

pub use agent_loop::{AgentState, Orchestrator, OrchestratorConfig};
pub use assembler::{AssembledToolCall, AssemblerError, ToolCallAssembler};
