use crate::security::label::{ContentLabel, DataClass, TrustLevel};

/// Outcome of a flow-control check for labelled content heading to a
/// destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDecision {
    Allow,
    /// Requires an interactive confirmation before proceeding.
    Ask,
    Deny,
}

/// Where labelled content is about to flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDestination {
    /// Outbound network write (request body, query params).
    NetworkEgress,
    /// Long-lived semantic memory store.
    SemanticMemory,
    /// In-process working memory.
    WorkingMemory,
    /// Content passed as another tool's input.
    ToolChain {
        /// Sink can exfiltrate (network-outbound tool).
        sink_leaky: bool,
        /// Sink redacts/sanitizes its input before any side effect.
        sink_sanitizes: bool,
    },
}

/// Decide whether content with `label` may flow to `destination`.
pub fn decide(label: &ContentLabel, destination: FlowDestination) -> FlowDecision {
    match destination {
        FlowDestination::NetworkEgress => {
            if label.data_class == DataClass::Secret {
                FlowDecision::Deny
            } else if label.trust == TrustLevel::Untrusted
                && label.data_class >= DataClass::Sensitive
            {
                FlowDecision::Deny
            } else if label.data_class >= DataClass::Sensitive {
                FlowDecision::Ask
            } else {
                FlowDecision::Allow
            }
        }
        FlowDestination::SemanticMemory => match label.trust {
            TrustLevel::Untrusted => FlowDecision::Deny,
            TrustLevel::Verified => FlowDecision::Ask,
            TrustLevel::User | TrustLevel::System => FlowDecision::Allow,
        },
        FlowDestination::WorkingMemory => {
            if label.data_class == DataClass::Secret {
                // Must be redacted before it can enter working memory
                FlowDecision::Deny
            } else {
                FlowDecision::Allow
            }
        }
        FlowDestination::ToolChain {
            sink_leaky,
            sink_sanitizes,
        } => {
            if label.data_class == DataClass::Secret && !sink_sanitizes {
                FlowDecision::Deny
            } else if label.trust == TrustLevel::Untrusted && sink_leaky {
                FlowDecision::Ask
            } else {
                FlowDecision::Allow
            }
        }
    }
}

/// Short human-readable reason for a non-allow decision, used in tool
/// results and audit entries.
pub fn reason(label: &ContentLabel, destination: FlowDestination) -> String {
    match destination {
        FlowDestination::NetworkEgress => format!(
            "content labelled {:?}/{:?} may not leave the machine",
            label.trust, label.data_class
        ),
        FlowDestination::SemanticMemory => format!(
            "content from {:?} origin requires confirmation before long-term storage",
            label.trust
        ),
        FlowDestination::WorkingMemory => {
            "secret content must be redacted before entering working memory".to_string()
        }
        FlowDestination::ToolChain { .. } => format!(
            "chaining {:?}/{:?} content into this tool requires review",
            label.trust, label.data_class
        ),
    }
}
