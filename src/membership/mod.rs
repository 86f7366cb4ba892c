//! Cluster Membership
//!
//! Turns member lifecycle notifications into reconciliation commands
//! against `proxysql_servers`.
//!
//! - `source`: the membership feed trait and a channel-backed feed
//! - `reconciler`: join/leave procedures
//! - `dispatcher`: serializes feed events onto one handler task
//! - `watermark`: poll-based core loop with a checksum watermark
//! - `satellite`: periodic resync for secondary members
//! - `kube`: Kubernetes pod feed (feature `kubernetes`)

pub mod dispatcher;
pub mod reconcile_dst;
pub mod reconciler;
pub mod satellite;
pub mod source;
pub mod watermark;
#[cfg(feature = "kubernetes")]
pub mod kube;

pub use dispatcher::EventDispatcher;
pub use reconcile_dst::{ReconcileDSTConfig, ReconcileDSTHarness, ReconcileDSTResult};
pub use reconciler::Reconciler;
pub use satellite::SatelliteResync;
pub use source::{ChannelSource, FeedStream, MemberSource};
pub use watermark::{WatermarkLoop, WatermarkStore};

use serde::Deserialize;

/// Which part of the cluster a member belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberRole {
    /// Core member, listed in `proxysql_servers`
    Primary,
    /// Satellite member, never listed
    Secondary,
}

/// Pod lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl MemberPhase {
    /// Parse a Kubernetes pod phase string; anything unrecognized is Unknown
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => MemberPhase::Pending,
            "Running" => MemberPhase::Running,
            "Succeeded" => MemberPhase::Succeeded,
            "Failed" => MemberPhase::Failed,
            _ => MemberPhase::Unknown,
        }
    }
}

/// One cluster member as reported by the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub address: String,
    pub name: String,
    pub uid: String,
    pub role: MemberRole,
    pub phase: MemberPhase,
}

impl Member {
    pub fn is_primary(&self) -> bool {
        self.role == MemberRole::Primary
    }

    /// `address:name:uid`, the unit hashed into the watermark
    pub fn fingerprint(&self) -> String {
        format!("{}:{}:{}", self.address, self.name, self.uid)
    }
}

/// An ordered membership notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Member seen at feed start or newly created
    Observed(Member),
    /// Member changed lifecycle phase
    Transitioned { old: Member, new: Member },
    /// Initial listing has been delivered in full
    Synced,
}

/// Label selector for cluster members
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemberSelector {
    pub namespace: String,
    pub app: String,
    pub component: String,
}

impl Default for MemberSelector {
    fn default() -> Self {
        MemberSelector {
            namespace: "proxysql".to_string(),
            app: "proxysql".to_string(),
            component: "core".to_string(),
        }
    }
}

impl MemberSelector {
    /// `app=<app>,component=<component>`
    pub fn label_selector(&self) -> String {
        format!("app={},component={}", self.app, self.component)
    }

    /// Selector over every member of the app regardless of component
    pub fn app_selector(&self) -> String {
        format!("app={}", self.app)
    }
}

/// Error type for membership feeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The feed ended
    Closed,
    /// The orchestration platform could not be reached
    Unavailable(String),
    /// A member record was missing required fields
    Malformed(String),
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::Closed => write!(f, "membership feed closed"),
            FeedError::Unavailable(msg) => write!(f, "membership feed unavailable: {}", msg),
            FeedError::Malformed(msg) => write!(f, "malformed member: {}", msg),
        }
    }
}

impl std::error::Error for FeedError {}
