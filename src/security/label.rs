use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How much the system trusts the origin of a piece of content.
/// Ordering matters: combining labels takes the minimum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Fetched from the network, produced by a sandboxed process, etc.
    Untrusted,
    /// Passed an integrity check (signed source, pinned host).
    Verified,
    /// Typed by the local user.
    User,
    /// Produced by meao itself.
    System,
}

/// Sensitivity of the content. Combining labels takes the maximum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DataClass {
    Public,
    Internal,
    Sensitive,
    Secret,
}

/// Immutable taint tag attached to every string that crosses a trust
/// boundary. Created when content enters the system and carried alongside it
/// to the model, memory, and egress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentLabel {
    pub trust: TrustLevel,
    pub data_class: DataClass,
    /// Where the content entered the system (tool name, channel, "user").
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Provenance chain; finite and short in practice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inherited_from: Option<Box<ContentLabel>>,
}

impl ContentLabel {
    pub fn new(trust: TrustLevel, data_class: DataClass, origin: impl Into<String>) -> Self {
        Self {
            trust,
            data_class,
            origin: origin.into(),
            origin_id: None,
            timestamp: Utc::now(),
            inherited_from: None,
        }
    }

    pub fn with_origin_id(mut self, origin_id: impl Into<String>) -> Self {
        self.origin_id = Some(origin_id.into());
        self
    }

    /// Label for text typed by the local user. User input is trusted as to
    /// origin but treated as sensitive data by default.
    pub fn user_input() -> Self {
        Self::new(TrustLevel::User, DataClass::Sensitive, "user")
    }

    /// Label for content meao generated itself.
    pub fn system(origin: impl Into<String>) -> Self {
        Self::new(TrustLevel::System, DataClass::Internal, origin)
    }

    /// Combine two labels: the result is no more trusting and no less
    /// sensitive than either input. The right-hand label is recorded as
    /// provenance.
    pub fn combine(&self, other: &ContentLabel) -> ContentLabel {
        ContentLabel {
            trust: self.trust.min(other.trust),
            data_class: self.data_class.max(other.data_class),
            origin: self.origin.clone(),
            origin_id: self.origin_id.clone(),
            timestamp: Utc::now(),
            inherited_from: Some(Box::new(other.clone())),
        }
    }

    /// Raise the data class (never lowers). Used when a secret scan finds
    /// material in content that was labelled less sensitive.
    pub fn elevate(&self, data_class: DataClass) -> ContentLabel {
        ContentLabel {
            data_class: self.data_class.max(data_class),
            ..self.clone()
        }
    }
}
