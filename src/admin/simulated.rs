//! Simulated Admin Interface with Fault Injection
//!
//! In-memory model of the parts of the ProxySQL admin schema the agent
//! touches: `proxysql_servers`, its runtime copy, backend and client
//! counters, and the cluster health metrics. Every statement and query is
//! recorded so tests can assert on exact command sequences.

use super::statements::{self, PLACEHOLDER_HOSTNAME};
use super::{AdminError, AdminExecutor, AdminFuture};
use parking_lot::Mutex;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One `proxysql_servers` record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyRow {
    pub hostname: String,
    pub port: u16,
    pub weight: u32,
    pub comment: String,
}

impl TopologyRow {
    pub fn placeholder(port: u16) -> Self {
        TopologyRow {
            hostname: PLACEHOLDER_HOSTNAME.to_string(),
            port,
            weight: 0,
            comment: PLACEHOLDER_HOSTNAME.to_string(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.hostname == PLACEHOLDER_HOSTNAME
    }
}

/// Deterministic faults
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminFault {
    /// Fail every execution of this exact statement
    FailStatement(String),
    /// Fail every execution of this exact query
    FailQuery(String),
    /// Fail pings
    FailPing,
}

struct SimulatedState {
    servers: BTreeMap<String, TopologyRow>,
    config_servers: Vec<TopologyRow>,
    runtime_servers: Vec<TopologyRow>,
    backends: (i64, i64, i64),
    clients: Option<i64>,
    missing_cores: i64,
    statements: Vec<String>,
    queries: Vec<String>,
    paused: bool,
    shut_down: bool,
    closed: bool,
    faults: Vec<AdminFault>,
    rng: ChaCha8Rng,
    fail_prob: f64,
    latency: Duration,
}

/// Cloneable handle; clones share the same simulated server
#[derive(Clone)]
pub struct SimulatedAdmin {
    state: Arc<Mutex<SimulatedState>>,
}

impl Default for SimulatedAdmin {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAdmin {
    /// Empty `proxysql_servers`, empty config
    pub fn new() -> Self {
        SimulatedAdmin {
            state: Arc::new(Mutex::new(SimulatedState {
                servers: BTreeMap::new(),
                config_servers: Vec::new(),
                runtime_servers: Vec::new(),
                backends: (0, 0, 0),
                clients: Some(0),
                missing_cores: 0,
                statements: Vec::new(),
                queries: Vec::new(),
                paused: false,
                shut_down: false,
                closed: false,
                faults: Vec::new(),
                rng: ChaCha8Rng::seed_from_u64(0),
                fail_prob: 0.0,
                latency: Duration::ZERO,
            })),
        }
    }

    /// Freshly booted node: the config file ships only the placeholder row
    pub fn with_placeholder(port: u16) -> Self {
        let admin = Self::new();
        {
            let mut state = admin.state.lock();
            let row = TopologyRow::placeholder(port);
            state.config_servers = vec![row.clone()];
            state.servers.insert(row.hostname.clone(), row);
        }
        admin
    }

    /// Fail each statement/query with probability `prob`, reproducibly per seed
    pub fn with_failure_probability(self, seed: u64, prob: f64) -> Self {
        {
            let mut state = self.state.lock();
            state.rng = ChaCha8Rng::seed_from_u64(seed);
            state.fail_prob = prob;
        }
        self
    }

    pub fn inject(&self, fault: AdminFault) {
        self.state.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.faults.clear();
        state.fail_prob = 0.0;
    }

    /// Delay applied to every call before it takes effect
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn set_backends(&self, total: i64, online: i64, shunned: i64) {
        self.state.lock().backends = (total, online, shunned);
    }

    /// `None` models an empty `mysql_connections` table
    pub fn set_clients(&self, clients: Option<i64>) {
        self.state.lock().clients = clients;
    }

    pub fn set_missing_cores(&self, missing: i64) {
        self.state.lock().missing_cores = missing;
    }

    pub fn set_config_servers(&self, rows: Vec<TopologyRow>) {
        self.state.lock().config_servers = rows;
    }

    /// Current `proxysql_servers`, ordered by hostname
    pub fn rows(&self) -> Vec<TopologyRow> {
        self.state.lock().servers.values().cloned().collect()
    }

    pub fn runtime_rows(&self) -> Vec<TopologyRow> {
        self.state.lock().runtime_servers.clone()
    }

    pub fn core_rows(&self) -> Vec<TopologyRow> {
        self.rows().into_iter().filter(|r| !r.is_placeholder()).collect()
    }

    pub fn has_placeholder(&self) -> bool {
        self.state.lock().servers.contains_key(PLACEHOLDER_HOSTNAME)
    }

    /// Statements that were applied, in order
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Queries that were answered, in order
    pub fn queries(&self) -> Vec<String> {
        self.state.lock().queries.clone()
    }

    pub fn statement_count(&self, statement: &str) -> usize {
        self.state
            .lock()
            .statements
            .iter()
            .filter(|s| s.as_str() == statement)
            .count()
    }

    pub fn query_count(&self, query: &str) -> usize {
        self.state
            .lock()
            .queries
            .iter()
            .filter(|q| q.as_str() == query)
            .count()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.statements.clear();
        state.queries.clear();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn apply_statement(&self, statement: &str) -> Result<u64, AdminError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AdminError::Closed);
        }
        let injected = state
            .faults
            .iter()
            .any(|f| matches!(f, AdminFault::FailStatement(s) if s == statement));
        if injected || roll(&mut state) {
            return Err(AdminError::Statement(format!("injected failure: {}", statement)));
        }

        let normalized = statement.trim().trim_end_matches(';');
        let affected = if normalized == statements::CLEAR_SERVERS {
            let n = state.servers.len() as u64;
            state.servers.clear();
            n
        } else if let Some(rest) =
            normalized.strip_prefix("DELETE FROM proxysql_servers WHERE hostname = ")
        {
            let hostname = parse_literal(rest)?;
            u64::from(state.servers.remove(&hostname).is_some())
        } else if let Some(rest) = normalized.strip_prefix("REPLACE INTO proxysql_servers VALUES ") {
            let row = parse_row(rest)?;
            state.servers.insert(row.hostname.clone(), row);
            1
        } else if normalized == statements::LOAD_SERVERS_FROM_CONFIG {
            let rows = state.config_servers.clone();
            state.servers = rows.into_iter().map(|r| (r.hostname.clone(), r)).collect();
            state.servers.len() as u64
        } else if normalized == statements::LOAD_SERVERS_TO_RUNTIME {
            state.runtime_servers = state.servers.values().cloned().collect();
            0
        } else if normalized.starts_with("LOAD ") && normalized.ends_with(" TO RUNTIME") {
            0
        } else if normalized == statements::PAUSE {
            state.paused = true;
            0
        } else if normalized == statements::SHUTDOWN_SLOW {
            state.shut_down = true;
            0
        } else {
            return Err(AdminError::Statement(format!(
                "unrecognized statement: {}",
                statement
            )));
        };

        state.statements.push(statement.to_string());
        Ok(affected)
    }

    fn answer_query(&self, query: &str) -> Result<Option<i64>, AdminError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AdminError::Closed);
        }
        let injected = state
            .faults
            .iter()
            .any(|f| matches!(f, AdminFault::FailQuery(q) if q == query));
        if injected || roll(&mut state) {
            return Err(AdminError::Statement(format!("injected failure: {}", query)));
        }

        let answer = if let Some(rest) =
            query.strip_prefix("SELECT COUNT(*) FROM proxysql_servers WHERE hostname = ")
        {
            let hostname = parse_literal(rest)?;
            Some(i64::from(state.servers.contains_key(&hostname)))
        } else if query == statements::count_core_servers() {
            Some(state.servers.values().filter(|r| !r.is_placeholder()).count() as i64)
        } else if query == statements::COUNT_BACKENDS {
            Some(state.backends.0)
        } else if query == statements::COUNT_ONLINE_BACKENDS {
            Some(state.backends.1)
        } else if query == statements::COUNT_SHUNNED_BACKENDS {
            Some(state.backends.2)
        } else if query == statements::CONNECTED_CLIENTS {
            state.clients
        } else if query.starts_with("SELECT COUNT(hostname) FROM stats_proxysql_servers_metrics") {
            Some(state.missing_cores)
        } else {
            return Err(AdminError::Statement(format!("unrecognized query: {}", query)));
        };

        state.queries.push(query.to_string());
        Ok(answer)
    }
}

fn roll(state: &mut SimulatedState) -> bool {
    state.fail_prob > 0.0 && state.rng.gen_bool(state.fail_prob)
}

fn parse_literal(raw: &str) -> Result<String, AdminError> {
    let raw = raw.trim();
    raw.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .map(|s| s.replace("''", "'"))
        .ok_or_else(|| AdminError::Statement(format!("malformed literal: {}", raw)))
}

/// Parse `('host', port, weight, 'comment')`
fn parse_row(raw: &str) -> Result<TopologyRow, AdminError> {
    let malformed = || AdminError::Statement(format!("malformed row: {}", raw));
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(malformed)?;

    let mut fields = Vec::with_capacity(4);
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if in_quotes && chars.peek() == Some(&'\'') => {
                current.push_str("''");
                chars.next();
            }
            '\'' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);

    if fields.len() != 4 {
        return Err(malformed());
    }

    Ok(TopologyRow {
        hostname: parse_literal(&fields[0])?,
        port: fields[1].trim().parse().map_err(|_| malformed())?,
        weight: fields[2].trim().parse().map_err(|_| malformed())?,
        comment: parse_literal(&fields[3])?,
    })
}

impl AdminExecutor for SimulatedAdmin {
    fn execute<'a>(&'a self, statement: &'a str) -> AdminFuture<'a, u64> {
        Box::pin(async move {
            self.simulate_latency().await;
            self.apply_statement(statement)
        })
    }

    fn query_scalar<'a>(&'a self, query: &'a str) -> AdminFuture<'a, Option<i64>> {
        Box::pin(async move {
            self.simulate_latency().await;
            self.answer_query(query)
        })
    }

    fn ping(&self) -> AdminFuture<'_, ()> {
        Box::pin(async move {
            let state = self.state.lock();
            if state.closed {
                return Err(AdminError::Closed);
            }
            if state.faults.contains(&AdminFault::FailPing) {
                return Err(AdminError::Connection("injected ping failure".to_string()));
            }
            Ok(())
        })
    }

    fn close(&self) -> AdminFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().closed = true;
            Ok(())
        })
    }
}
