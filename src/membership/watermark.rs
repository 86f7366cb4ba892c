//! Poll-based core reconciliation
//!
//! Every interval the core lists its peers, hashes the running primaries
//! (the set that becomes rows), and compares the digest against the watermark
//! left by the previous run. An unchanged set only re-pushes the server list to runtime (so peers that joined
//! through the cluster protocol are accepted); a changed one rebuilds
//! `proxysql_servers` from scratch.

use super::{Member, MemberSelector, MemberSource};
use crate::admin::statements::{self, RUNTIME_LOADS};
use crate::control::{ControlPlane, Execution};
use crate::error::{AgentError, Result};
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// SHA-1 hex digest of the sorted `address:name:uid` lines of `members`
pub fn digest(members: &[Member]) -> String {
    let mut lines: Vec<String> = members.iter().map(Member::fingerprint).collect();
    lines.sort();

    let mut hasher = Sha1::new();
    hasher.update(lines.join("\n").as_bytes());

    let mut hex = String::with_capacity(40);
    for byte in hasher.finalize() {
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

/// Watermark persisted in a single local file
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        WatermarkStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Previous digest; a missing or unreadable file counts as none
    pub fn load(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Some(contents.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(file = %self.path.display(), error = %e, "failed to read watermark");
                None
            }
        }
    }

    pub fn store(&self, digest: &str) -> std::io::Result<()> {
        std::fs::write(&self.path, digest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkOutcome {
    /// Listing was empty; nothing was sent
    NoMembers,
    /// Digest matched; only the server list was re-pushed
    Unchanged,
    /// Table rebuilt with this many core rows
    Rebuilt(usize),
    /// Shutdown began partway through
    Interrupted,
}

pub struct WatermarkLoop {
    control: Arc<ControlPlane>,
    source: Arc<dyn MemberSource>,
    selector: MemberSelector,
    store: WatermarkStore,
    cluster_port: u16,
    interval: Duration,
}

impl WatermarkLoop {
    pub fn new(
        control: Arc<ControlPlane>,
        source: Arc<dyn MemberSource>,
        selector: MemberSelector,
        store: WatermarkStore,
        cluster_port: u16,
        interval: Duration,
    ) -> Self {
        WatermarkLoop {
            control,
            source,
            selector,
            store,
            cluster_port,
            interval,
        }
    }

    pub async fn reconcile_once(&self) -> Result<WatermarkOutcome> {
        let members = self.source.list(&self.selector).await?;
        if members.is_empty() {
            warn!(selector = %self.selector.label_selector(), "no members returned");
            return Ok(WatermarkOutcome::NoMembers);
        }

        let mut cores: Vec<Member> = members
            .into_iter()
            .filter(|m| m.is_primary() && m.phase == super::MemberPhase::Running)
            .collect();
        cores.sort_by(|a, b| a.address.cmp(&b.address));

        // Digest covers the rows written, so a phase change at a stable
        // address still triggers a rebuild
        let digest = digest(&cores);
        if self.store.load().as_deref() == Some(digest.as_str()) {
            let outcome = match self.step(statements::LOAD_SERVERS_TO_RUNTIME).await? {
                Execution::Skipped => WatermarkOutcome::Interrupted,
                Execution::Applied(_) => WatermarkOutcome::Unchanged,
            };
            return Ok(outcome);
        }

        let mut commands = Vec::with_capacity(cores.len() + 2 + RUNTIME_LOADS.len());
        commands.push(statements::CLEAR_SERVERS.to_string());
        for member in &cores {
            commands.push(statements::replace_server(
                &member.address,
                self.cluster_port,
                0,
                &member.name,
            ));
        }
        if cores.is_empty() {
            commands.push(statements::insert_placeholder(self.cluster_port));
        }
        commands.extend(RUNTIME_LOADS.iter().map(|s| s.to_string()));

        for command in &commands {
            if self.step(command).await?.is_skipped() {
                debug!("shutdown in progress, abandoning rebuild");
                return Ok(WatermarkOutcome::Interrupted);
            }
        }

        if let Err(e) = self.store.store(&digest) {
            error!(file = %self.store.path().display(), error = %e, "failed to write watermark");
        }

        info!(cores = cores.len(), digest = %digest, "rebuilt proxysql_servers");
        Ok(WatermarkOutcome::Rebuilt(cores.len()))
    }

    /// Reconcile every interval until `cancel` fires or shutdown begins
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "core poll loop started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.control.is_shutting_down() {
                break;
            }
            if let Err(e) = self.reconcile_once().await {
                error!(error = %e, "core reconciliation failed");
            }
        }
        info!("core poll loop stopped");
    }

    async fn step(&self, command: &str) -> Result<Execution> {
        self.control.execute(command).await.map_err(|e| {
            error!(command, error = %e, "command failed");
            AgentError::command(command, e)
        })
    }
}
