//! Admin interface over the MySQL wire protocol.

use super::{AdminError, AdminExecutor, AdminFuture};
use crate::config::AdminConfig;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder};
use tokio::sync::Mutex;
use tracing::info;

/// Single long-lived admin connection. The mutex serializes statements, so a
/// `close` waits for the in-flight statement to finish.
pub struct MysqlAdmin {
    conn: Mutex<Option<Conn>>,
}

impl MysqlAdmin {
    pub async fn connect(config: &AdminConfig) -> Result<Self, AdminError> {
        let (host, port) = config
            .host_and_port()
            .map_err(|e| AdminError::Connection(e.to_string()))?;

        let opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(config.username.clone()))
            .pass(Some(config.password.clone()))
            .prefer_socket(false);

        let mut conn = Conn::new(opts)
            .await
            .map_err(|e| AdminError::Connection(e.to_string()))?;
        conn.ping()
            .await
            .map_err(|e| AdminError::Connection(format!("failed to ping ProxySQL: {}", e)))?;

        info!(host = %config.address, "connected to ProxySQL admin");

        Ok(MysqlAdmin {
            conn: Mutex::new(Some(conn)),
        })
    }
}

impl AdminExecutor for MysqlAdmin {
    fn execute<'a>(&'a self, statement: &'a str) -> AdminFuture<'a, u64> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(AdminError::Closed)?;
            conn.query_drop(statement)
                .await
                .map_err(|e| AdminError::Statement(e.to_string()))?;
            Ok(conn.affected_rows())
        })
    }

    fn query_scalar<'a>(&'a self, query: &'a str) -> AdminFuture<'a, Option<i64>> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(AdminError::Closed)?;
            let row: Option<Option<i64>> = conn
                .query_first(query)
                .await
                .map_err(|e| AdminError::Statement(e.to_string()))?;
            Ok(row.flatten())
        })
    }

    fn ping(&self) -> AdminFuture<'_, ()> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(AdminError::Closed)?;
            conn.ping()
                .await
                .map_err(|e| AdminError::Connection(e.to_string()))
        })
    }

    fn close(&self) -> AdminFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().await.take();
            match conn {
                Some(conn) => conn
                    .disconnect()
                    .await
                    .map_err(|e| AdminError::Connection(e.to_string())),
                None => Ok(()),
            }
        })
    }
}
