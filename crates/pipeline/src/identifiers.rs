//! Identifier newtypes.
//!
//! Node and edge names are both strings, as are delegate and service names;
//! giving each its own type keeps them from being passed for one another.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares non-empty string identifiers. Each gets `new` (`None` when
/// empty), `as_str`, `Display` and `Borrow<str>` so maps keyed by the
/// identifier can be queried with a plain name.
macro_rules! string_id {
    ($($(#[$attr:meta])* $name:ident),+ $(,)?) => {$(
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let value = value.into();
                (!value.is_empty()).then_some(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    )+};
}

/// Declares identifiers assigned as integers by the work-item tracker.
macro_rules! tracker_id {
    ($($(#[$attr:meta])* $name:ident),+ $(,)?) => {$(
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub fn new(value: u64) -> Self {
                Self(value)
            }

            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    )+};
}

string_id! {
    /// Unique node name within one graph.
    NodeId,
    /// Unique edge name within one graph.
    EdgeId,
    /// Name of a graph description, e.g. `"default"`.
    PipelineName,
    /// Provider and model of an LLM delegate, e.g. `"anthropic:claude-sonnet-4-5"`.
    /// Alignment compares judge and producer identities to detect self-judging.
    DelegateId,
    /// Key of a domain service in the `[services]` configuration table.
    DomainServiceName,
    /// Repository-relative path of an artifact.
    ArtifactPath,
}

tracker_id! {
    /// The work item a run belongs to.
    WorkItemId,
    /// A work item created by a spawning node.
    SubWorkItemId,
}

/// One pipeline run. Every invocation of the engine for the same run reloads
/// its snapshot under this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineRunId(Uuid);

impl PipelineRunId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for PipelineRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for PipelineRunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
