use crate::agent::tools::base::{
    ActionTraits, ApprovalPolicy, Tool, ToolCapability, ToolContext, ToolOutput,
};
use crate::security::label::{DataClass, TrustLevel};
use crate::utils::lexical_normalize;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolve a tool-supplied path against the working directory and reject
/// anything that escapes it. Non-existent paths are normalized lexically so
/// `..` components cannot sidestep the check.
fn resolve_in_workdir(path_str: &str, work_dir: &Path) -> Result<PathBuf, String> {
    let raw = Path::new(path_str);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        work_dir.join(raw)
    };
    let resolved = joined
        .canonicalize()
        .unwrap_or_else(|_| lexical_normalize(&joined));
    let work_resolved = work_dir
        .canonicalize()
        .unwrap_or_else(|_| lexical_normalize(work_dir));
    if !resolved.starts_with(&work_resolved) {
        return Err("Access denied: path outside working directory".to_string());
    }
    Ok(resolved)
}

pub struct ReadFileTool {
    cap: usize,
}

impl ReadFileTool {
    pub fn new(cap: usize) -> Self {
        Self { cap }
    }
}

impl Default for ReadFileTool {
    fn default() -> Self {
        Self::new(200_000)
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file inside the working directory."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, absolute or relative to the working directory"
                }
            },
            "required": ["path"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability {
            approval: ApprovalPolicy::Auto,
            // File contents belong to the user; secrets inside elevate the class
            output_trust: TrustLevel::User,
            output_class: DataClass::Internal,
            output_cap: self.cap,
            timeout: Duration::from_secs(30),
            ..ToolCapability::default()
        }
    }

    fn action(&self) -> &str {
        "read"
    }

    fn approval_target(&self, args: &Value) -> Option<String> {
        args["path"].as_str().map(str::to_string)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let path_str = args["path"].as_str().unwrap_or_default();
        let path = match resolve_in_workdir(path_str, &ctx.work_dir) {
            Ok(path) => path,
            Err(reason) => return Ok(ToolOutput::fail(reason)),
        };

        if !path.exists() {
            return Ok(ToolOutput::fail(format!("File not found: {}", path_str)));
        }
        if !path.is_file() {
            return Ok(ToolOutput::fail(format!(
                "Not a file: {} (use bash `ls` for directories)",
                path_str
            )));
        }

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(ToolOutput::ok(content)),
            Err(e) => Ok(ToolOutput::fail(format!("Error reading file: {}", e))),
        }
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file inside the working directory, creating parent directories as needed."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, absolute or relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability {
            approval: ApprovalPolicy::Ask,
            output_trust: TrustLevel::System,
            output_class: DataClass::Public,
            output_cap: 4_096,
            traits: ActionTraits {
                destructive: true,
                ..ActionTraits::default()
            },
            timeout: Duration::from_secs(30),
            ..ToolCapability::default()
        }
    }

    fn action(&self) -> &str {
        "write"
    }

    fn approval_target(&self, args: &Value) -> Option<String> {
        args["path"].as_str().map(str::to_string)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let path_str = args["path"].as_str().unwrap_or_default();
        let content = args["content"].as_str().unwrap_or_default();

        let path = match resolve_in_workdir(path_str, &ctx.work_dir) {
            Ok(path) => path,
            Err(reason) => return Ok(ToolOutput::fail(reason)),
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok(ToolOutput::fail(format!(
                    "Error creating parent directory: {}",
                    e
                )));
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => Ok(ToolOutput::ok(format!(
                "Wrote {} bytes to {}",
                content.len(),
                path_str
            ))),
            Err(e) => Ok(ToolOutput::fail(format!("Error writing file: {}", e))),
        }
    }
}
