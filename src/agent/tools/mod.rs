pub mod base;
pub mod filesystem;
pub mod gateway;
pub mod shell;
pub mod web;

pub use base::{ApprovalPolicy, Tool, ToolCapability, ToolContext, ToolOutput};
pub use gateway::{ToolDispatch, ToolGateway};
