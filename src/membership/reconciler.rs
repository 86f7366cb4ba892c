//! Join and leave procedures
//!
//! Every command goes through `ControlPlane::execute`, which checks the
//! shutdown phase immediately before sending. A procedure that loses the
//! race with shutdown stops at the first skipped command and reports
//! success.

use super::{FeedEvent, Member, MemberPhase};
use crate::admin::statements::{self, RUNTIME_LOADS};
use crate::control::{ControlPlane, Execution};
use crate::error::{AgentError, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct Reconciler {
    control: Arc<ControlPlane>,
    identity: String,
    cluster_port: u16,
}

/// Whether a command sequence ran to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Completed,
    Interrupted,
}

impl Reconciler {
    pub fn new(control: Arc<ControlPlane>, identity: impl Into<String>, cluster_port: u16) -> Self {
        Reconciler {
            control,
            identity: identity.into(),
            cluster_port,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Member seen at feed start or newly created. Only this agent's own
    /// member registers itself.
    pub async fn on_member_observed(&self, member: &Member) -> Result<()> {
        if member.name != self.identity {
            return Ok(());
        }
        if member.address.is_empty() {
            // Pending pods have no IP yet; the Running transition joins
            debug!(member = %member.name, "no address yet, deferring registration");
            return Ok(());
        }

        let Some(conn) = self.control.acquire() else {
            debug!(member = %member.name, "not running, skipping registration check");
            return Ok(());
        };

        let query = statements::count_server(&member.address);
        let existing = conn
            .query_scalar(&query)
            .await
            .map_err(|e| AgentError::command(query.as_str(), e))?
            .unwrap_or(0);

        if existing > 0 {
            debug!(member = %member.name, address = %member.address, "already registered");
            return Ok(());
        }

        self.join(member).await
    }

    pub async fn on_member_transition(&self, old: &Member, new: &Member) -> Result<()> {
        match (old.phase, new.phase) {
            (MemberPhase::Pending, MemberPhase::Running) => self.join(new).await,
            (MemberPhase::Running, MemberPhase::Failed) => self.leave(old).await,
            _ => Ok(()),
        }
    }

    /// Register `member`: drop the placeholder, add its row if primary, then
    /// push everything to runtime
    pub async fn join(&self, member: &Member) -> Result<()> {
        let mut commands = Vec::with_capacity(2 + RUNTIME_LOADS.len());
        commands.push(statements::delete_placeholder());
        if member.is_primary() {
            commands.push(statements::replace_server(
                &member.address,
                self.cluster_port,
                0,
                &member.name,
            ));
        }
        commands.extend(RUNTIME_LOADS.iter().map(|s| s.to_string()));

        if self.run(&commands).await? == Progress::Completed {
            info!(member = %member.name, address = %member.address, "member joined");
        }
        Ok(())
    }

    /// Deregister `member`. Restores the placeholder when it was the last
    /// primary row.
    pub async fn leave(&self, member: &Member) -> Result<()> {
        if member.is_primary() {
            let delete = statements::delete_server(&member.address);
            if self.step(&delete).await?.is_skipped() {
                return Ok(());
            }

            let Some(conn) = self.control.acquire() else {
                return Ok(());
            };
            let query = statements::count_core_servers();
            let remaining = conn
                .query_scalar(&query)
                .await
                .map_err(|e| AgentError::command(query.as_str(), e))?
                .unwrap_or(0);

            if remaining == 0 {
                let placeholder = statements::insert_placeholder(self.cluster_port);
                if self.step(&placeholder).await?.is_skipped() {
                    return Ok(());
                }
            }
        }

        let loads: Vec<String> = RUNTIME_LOADS.iter().map(|s| s.to_string()).collect();
        if self.run(&loads).await? == Progress::Completed {
            info!(member = %member.name, address = %member.address, "member left");
        }
        Ok(())
    }

    /// Best-effort dispatch of one feed event; errors are logged, never
    /// returned
    pub async fn handle(&self, event: FeedEvent) {
        let result = match &event {
            FeedEvent::Observed(member) => self.on_member_observed(member).await,
            FeedEvent::Transitioned { old, new } => self.on_member_transition(old, new).await,
            FeedEvent::Synced => {
                debug!("membership feed synced");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "reconciliation failed");
        }
    }

    async fn run(&self, commands: &[String]) -> Result<Progress> {
        for command in commands {
            if self.step(command).await?.is_skipped() {
                debug!(command = %command, "shutdown in progress, abandoning reconciliation");
                return Ok(Progress::Interrupted);
            }
        }
        Ok(Progress::Completed)
    }

    async fn step(&self, command: &str) -> Result<Execution> {
        self.control.execute(command).await.map_err(|e| {
            error!(command, error = %e, "command failed");
            AgentError::command(command, e)
        })
    }
}
