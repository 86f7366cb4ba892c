//! Admin statements issued by the agent.
//!
//! Every statement text the agent sends lives here so the reconciler, the
//! shutdown sequence, the probes and the simulated store agree on it.

/// Hostname of the row standing in for "no core registered yet"
pub const PLACEHOLDER_HOSTNAME: &str = "proxysql-core";

pub const CLEAR_SERVERS: &str = "DELETE FROM proxysql_servers";
pub const LOAD_SERVERS_FROM_CONFIG: &str = "LOAD PROXYSQL SERVERS FROM CONFIG";
pub const LOAD_SERVERS_TO_RUNTIME: &str = "LOAD PROXYSQL SERVERS TO RUNTIME";
/// Same load as sent by the satellite resync, statement terminator included
pub const LOAD_SERVERS_TO_RUNTIME_TERMINATED: &str = "LOAD PROXYSQL SERVERS TO RUNTIME;";

/// Runtime loads issued after every membership change. Later stages read
/// state loaded by earlier ones, so the order is fixed.
pub const RUNTIME_LOADS: [&str; 6] = [
    LOAD_SERVERS_TO_RUNTIME,
    "LOAD ADMIN VARIABLES TO RUNTIME",
    "LOAD MYSQL VARIABLES TO RUNTIME",
    "LOAD MYSQL SERVERS TO RUNTIME",
    "LOAD MYSQL USERS TO RUNTIME",
    "LOAD MYSQL QUERY RULES TO RUNTIME",
];

pub const PAUSE: &str = "PROXYSQL PAUSE";
pub const SHUTDOWN_SLOW: &str = "PROXYSQL SHUTDOWN SLOW";

pub const COUNT_BACKENDS: &str = "SELECT COUNT(*) FROM runtime_mysql_servers";
pub const COUNT_ONLINE_BACKENDS: &str =
    "SELECT COUNT(*) FROM runtime_mysql_servers WHERE status = 'ONLINE'";
pub const COUNT_SHUNNED_BACKENDS: &str =
    "SELECT COUNT(*) FROM runtime_mysql_servers WHERE status = 'SHUNNED'";
pub const CONNECTED_CLIENTS: &str =
    "SELECT Client_Connections_connected FROM mysql_connections ORDER BY timestamp DESC LIMIT 1";

/// Quote a value as a single-quoted SQL string literal
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn delete_server(hostname: &str) -> String {
    format!("DELETE FROM proxysql_servers WHERE hostname = {}", quote(hostname))
}

pub fn delete_placeholder() -> String {
    delete_server(PLACEHOLDER_HOSTNAME)
}

/// Upsert a cluster row. `REPLACE` keeps a repeated join idempotent.
pub fn replace_server(hostname: &str, port: u16, weight: u32, comment: &str) -> String {
    format!(
        "REPLACE INTO proxysql_servers VALUES ({}, {}, {}, {})",
        quote(hostname),
        port,
        weight,
        quote(comment)
    )
}

pub fn insert_placeholder(port: u16) -> String {
    replace_server(PLACEHOLDER_HOSTNAME, port, 0, PLACEHOLDER_HOSTNAME)
}

pub fn count_server(hostname: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM proxysql_servers WHERE hostname = {}",
        quote(hostname)
    )
}

pub fn count_core_servers() -> String {
    format!(
        "SELECT COUNT(*) FROM proxysql_servers WHERE hostname != {}",
        quote(PLACEHOLDER_HOSTNAME)
    )
}

/// Cores that have not answered a cluster health check within `threshold_ms`
pub fn count_missing_cores(threshold_ms: u64) -> String {
    format!(
        "SELECT COUNT(hostname) FROM stats_proxysql_servers_metrics \
         WHERE last_check_ms > {} AND hostname != {} AND Uptime_s > 0",
        threshold_ms,
        quote(PLACEHOLDER_HOSTNAME)
    )
}
