//! Deterministic Simulation Testing for Membership Reconciliation
//!
//! Drives a `Reconciler` against a `SimulatedAdmin` with seeded random
//! lifecycle events and checks the topology invariants after each one:
//! - one row per running primary, no rows for anyone else
//! - placeholder present iff zero primary rows
//! - runtime copy matches the table after every procedure

use super::{Member, MemberPhase, MemberRole, Reconciler};
use crate::admin::{SimulatedAdmin, TopologyRow};
use crate::control::ControlPlane;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::sync::Arc;

const CLUSTER_PORT: u16 = 6032;

/// Configuration for reconciliation DST
#[derive(Debug, Clone)]
pub struct ReconcileDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Size of the member pool
    pub num_members: usize,
    /// Probability of a running member failing
    pub fail_prob: f64,
    /// Probability of re-delivering a transition that was already handled
    pub redeliver_prob: f64,
}

impl Default for ReconcileDSTConfig {
    fn default() -> Self {
        ReconcileDSTConfig {
            seed: 0,
            num_members: 5,
            fail_prob: 0.3,
            redeliver_prob: 0.15,
        }
    }
}

impl ReconcileDSTConfig {
    pub fn new(seed: u64) -> Self {
        ReconcileDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Many members failing often; the placeholder flips frequently
    pub fn high_churn(seed: u64) -> Self {
        ReconcileDSTConfig {
            seed,
            num_members: 3,
            fail_prob: 0.5,
            redeliver_prob: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReconcileOp {
    Start { name: String },
    Fail { name: String },
    Redeliver { name: String },
    ObserveSelf,
}

/// Result of a reconciliation DST run
#[derive(Debug, Clone)]
pub struct ReconcileDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub joins: u64,
    pub leaves: u64,
    pub redeliveries: u64,
    pub invariant_violations: Vec<String>,
    pub last_op: Option<ReconcileOp>,
}

impl ReconcileDSTResult {
    pub fn new(seed: u64) -> Self {
        ReconcileDSTResult {
            seed,
            total_operations: 0,
            joins: 0,
            leaves: 0,
            redeliveries: 0,
            invariant_violations: Vec::new(),
            last_op: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops (joins:{}, leaves:{}, redeliveries:{}), {} violations",
            self.seed,
            self.total_operations,
            self.joins,
            self.leaves,
            self.redeliveries,
            self.invariant_violations.len()
        )
    }
}

/// DST harness for the reconciler
pub struct ReconcileDSTHarness {
    config: ReconcileDSTConfig,
    rng: ChaCha8Rng,
    admin: SimulatedAdmin,
    reconciler: Reconciler,
    members: Vec<Member>,
    result: ReconcileDSTResult,
}

impl ReconcileDSTHarness {
    pub fn new(config: ReconcileDSTConfig) -> Self {
        let admin = SimulatedAdmin::with_placeholder(CLUSTER_PORT);
        let control = Arc::new(ControlPlane::new(Arc::new(admin.clone())));
        let members = (0..config.num_members)
            .map(|i| Member {
                address: format!("10.0.0.{}", i + 1),
                name: format!("core-{}", i),
                uid: format!("uid-{}", i),
                role: MemberRole::Primary,
                phase: MemberPhase::Pending,
            })
            .collect();

        ReconcileDSTHarness {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            result: ReconcileDSTResult::new(config.seed),
            reconciler: Reconciler::new(control, "core-0", CLUSTER_PORT),
            admin,
            members,
            config,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::new(ReconcileDSTConfig::new(seed))
    }

    fn with_phase(member: &Member, phase: MemberPhase) -> Member {
        Member {
            phase,
            ..member.clone()
        }
    }

    async fn run_single_op(&mut self) {
        let idx = self.rng.gen_range(0..self.members.len());
        let member = self.members[idx].clone();
        let roll: f64 = self.rng.gen();

        let outcome = match member.phase {
            MemberPhase::Running if roll < self.config.fail_prob => {
                self.result.last_op = Some(ReconcileOp::Fail {
                    name: member.name.clone(),
                });
                let failed = Self::with_phase(&member, MemberPhase::Failed);
                let outcome = self.reconciler.on_member_transition(&member, &failed).await;
                // Replacement pod reuses the slot
                self.members[idx] = Self::with_phase(&member, MemberPhase::Pending);
                self.result.leaves += 1;
                outcome
            }
            MemberPhase::Running if roll < self.config.fail_prob + self.config.redeliver_prob => {
                self.result.last_op = Some(ReconcileOp::Redeliver {
                    name: member.name.clone(),
                });
                let pending = Self::with_phase(&member, MemberPhase::Pending);
                self.result.redeliveries += 1;
                self.reconciler.on_member_transition(&pending, &member).await
            }
            MemberPhase::Running => {
                self.result.last_op = Some(ReconcileOp::ObserveSelf);
                let me = self.members[0].clone();
                if me.phase == MemberPhase::Running {
                    self.reconciler.on_member_observed(&me).await
                } else {
                    Ok(())
                }
            }
            _ => {
                self.result.last_op = Some(ReconcileOp::Start {
                    name: member.name.clone(),
                });
                let running = Self::with_phase(&member, MemberPhase::Running);
                let outcome = self.reconciler.on_member_transition(&member, &running).await;
                self.members[idx] = running;
                self.result.joins += 1;
                outcome
            }
        };

        self.result.total_operations += 1;

        let check = match outcome {
            Ok(()) => self.check_invariants(),
            Err(e) => Err(format!("reconciliation failed: {}", e)),
        };
        if let Err(violation) = check {
            self.result.invariant_violations.push(format!(
                "Op #{}: {:?} - {}",
                self.result.total_operations, self.result.last_op, violation
            ));
        }
    }

    fn check_invariants(&self) -> Result<(), String> {
        let rows = self.admin.rows();
        let core_rows: Vec<&TopologyRow> = rows.iter().filter(|r| !r.is_placeholder()).collect();

        // Invariant 1: exactly the running primaries have rows
        let expected: BTreeSet<&str> = self
            .members
            .iter()
            .filter(|m| m.phase == MemberPhase::Running)
            .map(|m| m.address.as_str())
            .collect();
        let actual: BTreeSet<&str> = core_rows.iter().map(|r| r.hostname.as_str()).collect();
        if expected != actual || core_rows.len() != expected.len() {
            return Err(format!(
                "Row mismatch: expected={:?}, actual={:?}",
                expected, actual
            ));
        }

        // Invariant 2: placeholder iff no primary rows
        let has_placeholder = rows.iter().any(TopologyRow::is_placeholder);
        if has_placeholder != core_rows.is_empty() {
            return Err(format!(
                "Placeholder invariant broken: placeholder={}, core_rows={}",
                has_placeholder,
                core_rows.len()
            ));
        }

        // Invariant 3: runtime reflects the table
        if self.admin.runtime_rows() != rows && !self.admin.runtime_rows().is_empty() {
            return Err("Runtime copy diverged from proxysql_servers".to_string());
        }

        Ok(())
    }

    pub async fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            self.run_single_op().await;
            if !self.result.invariant_violations.is_empty() {
                break;
            }
        }
    }

    pub fn result(&self) -> &ReconcileDSTResult {
        &self.result
    }

    pub fn admin(&self) -> &SimulatedAdmin {
        &self.admin
    }
}

/// Run a batch of DST tests
pub async fn run_reconcile_batch(
    start_seed: u64,
    num_seeds: usize,
    ops_per_seed: usize,
    config_fn: fn(u64) -> ReconcileDSTConfig,
) -> Vec<ReconcileDSTResult> {
    let mut results = Vec::with_capacity(num_seeds);
    for i in 0..num_seeds {
        let seed = start_seed + i as u64;
        let mut harness = ReconcileDSTHarness::new(config_fn(seed));
        harness.run(ops_per_seed).await;
        results.push(harness.result().clone());
    }
    results
}

/// Summarize batch results
pub fn summarize_reconcile_batch(results: &[ReconcileDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed = total - passed;
    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();

    let mut summary = format!(
        "Reconcile DST Summary\n\
         =====================\n\
         Seeds: {} total, {} passed, {} failed\n\
         Total operations: {}\n",
        total, passed, failed, total_ops
    );

    if failed > 0 {
        summary.push_str("\nFailed seeds:\n");
        for result in results.iter().filter(|r| !r.is_success()) {
            summary.push_str(&format!("  Seed {}: {}\n", result.seed, result.summary()));
            for violation in &result.invariant_violations {
                summary.push_str(&format!("    - {}\n", violation));
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reconcile_dst_single_seed() {
        let mut harness = ReconcileDSTHarness::with_seed(12345);
        harness.run(200).await;
        let result = harness.result();
        println!("{}", result.summary());
        assert!(result.is_success(), "{:?}", result.invariant_violations);
        assert!(result.joins > 0);
    }
}
