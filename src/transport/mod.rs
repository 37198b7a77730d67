//! Remote submission: the one place the queue waits on the outside world.
//!
//! The worker hands each leased item to a [`Transport`] and classifies what
//! comes back. Implementations report outcomes, never panic on remote errors,
//! and leave the overall deadline to the caller.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::WorkItem;

pub use http::HttpTransport;

/// Outcome of submitting one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Submission {
    /// The endpoint explicitly accepted the record.
    Success,
    /// The endpoint rejected the record itself. Retrying cannot help.
    Permanent { code: u16 },
    /// The request did not get a verdict. Worth retrying later.
    Transient { kind: TransientKind },
}

impl Submission {
    /// Short classification stored in `last_error`.
    pub fn classification(&self) -> String {
        match self {
            Submission::Success => "success".to_string(),
            Submission::Permanent { code } => format!("rejected: {code}"),
            Submission::Transient { kind } => kind.to_string(),
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Submission::Success => "success",
            Submission::Permanent { .. } => "permanent",
            Submission::Transient { .. } => "transient",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    Network,
    Timeout,
    Dns,
    Server5xx,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransientKind::Network => "network",
            TransientKind::Timeout => "timeout",
            TransientKind::Dns => "dns",
            TransientKind::Server5xx => "server_5xx",
        };
        write!(f, "{s}")
    }
}

/// Submits work items to the remote endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn submit(&self, item: &WorkItem) -> Submission;
}

/// Stand-in when no endpoint is configured. Every submission is a network failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfigured;

#[async_trait]
impl Transport for Unconfigured {
    async fn submit(&self, _item: &WorkItem) -> Submission {
        Submission::Transient {
            kind: TransientKind::Network,
        }
    }
}
