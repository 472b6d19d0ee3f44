pub mod anthropic;
pub mod base;
pub mod errors;
pub mod sse;

pub use base::{
    ChatRequest, Message, ModelProvider, ModelResponse, ProviderMetrics, RetryConfig, StopReason,
    StreamEvent, StreamHandler, ToolDefinition,
};
