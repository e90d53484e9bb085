/// MySQL backend sessions over sqlx
///
/// Statements are sent without bind arguments, so sqlx issues them over the
/// text protocol and row values come back in their wire text form. They are
/// forwarded to clients byte for byte.
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Either, Executor, Row, TypeInfo};
use std::time::Duration;
use tracing::debug;

use super::{BackendConnector, BackendSession, ColumnInfo, QueryOutcome};
use crate::config::BackendCredentials;
use crate::core::Backend;
use crate::error::{RutaError, RutaResult};
use crate::routing::statement;
use crate::utils::parse_address;

/// Opens [`MySqlSession`]s with a fixed set of credentials
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    credentials: BackendCredentials,
    connect_timeout: Duration,
}

impl MySqlConnector {
    pub fn new(credentials: BackendCredentials, connect_timeout: Duration) -> Self {
        Self {
            credentials,
            connect_timeout,
        }
    }

    /// Connections carry client statements verbatim, so sqlx's own session
    /// setup (sql_mode, time_zone, SET NAMES) stays off and the server
    /// defaults apply.
    fn options(&self, backend: &Backend) -> RutaResult<MySqlConnectOptions> {
        let (host, port) = parse_address(&backend.address)?;
        let mut options = MySqlConnectOptions::new()
            .host(&host)
            .port(port)
            .username(&self.credentials.username)
            .password(&self.credentials.password)
            .pipes_as_concat(false)
            .no_engine_substitution(false)
            .timezone(None::<String>)
            .set_names(false);
        if let Some(database) = &self.credentials.database {
            options = options.database(database);
        }
        Ok(options.disable_statement_logging())
    }
}

#[async_trait]
impl BackendConnector for MySqlConnector {
    async fn connect(&self, backend: &Backend) -> RutaResult<Box<dyn BackendSession>> {
        let options = self.options(backend)?;
        let connection = tokio::time::timeout(self.connect_timeout, options.connect())
            .await
            .map_err(|_| RutaError::timeout(format!("connect to {}", backend.id)))?
            .map_err(map_sqlx_error)?;
        debug!(backend = %backend.id, "Opened backend connection");
        Ok(Box::new(MySqlSession { connection }))
    }
}

/// A single sqlx MySQL connection
pub struct MySqlSession {
    connection: MySqlConnection,
}

impl MySqlSession {
    /// First column of the first row as text
    async fn scalar(&mut self, sql: &str) -> RutaResult<Option<String>> {
        let row = self
            .connection
            .fetch_optional(sql)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.and_then(|row| text_value(&row, 0)))
    }
}

#[async_trait]
impl BackendSession for MySqlSession {
    async fn execute(&mut self, sql: &str) -> RutaResult<QueryOutcome> {
        let mut columns: Option<Vec<ColumnInfo>> = None;
        let mut rows = Vec::new();
        let mut affected_rows = 0;
        let mut last_insert_id = 0;

        {
            let mut stream = self.connection.fetch_many(sql);
            while let Some(item) = stream.try_next().await.map_err(map_sqlx_error)? {
                match item {
                    Either::Left(done) => {
                        affected_rows += done.rows_affected();
                        if done.last_insert_id() != 0 {
                            last_insert_id = done.last_insert_id();
                        }
                    }
                    Either::Right(row) => {
                        if columns.is_none() {
                            columns = Some(column_info(&row));
                        }
                        rows.push(row_values(&row));
                    }
                }
            }
        }

        if let Some(columns) = columns {
            return Ok(QueryOutcome::ResultSet { columns, rows });
        }

        // Empty result: recover column metadata from a prepare
        if statement::is_read_statement(sql) {
            if let Ok(described) = self.connection.describe(sql).await {
                let columns: Vec<ColumnInfo> = described
                    .columns()
                    .iter()
                    .map(|c| ColumnInfo::from_type_name(c.name(), c.type_info().name()))
                    .collect();
                if !columns.is_empty() {
                    return Ok(QueryOutcome::ResultSet {
                        columns,
                        rows: Vec::new(),
                    });
                }
            }
        }

        Ok(QueryOutcome::Modified {
            affected_rows,
            last_insert_id,
        })
    }

    async fn ping(&mut self) -> RutaResult<()> {
        self.connection.ping().await.map_err(map_sqlx_error)
    }

    async fn read_only(&mut self) -> RutaResult<bool> {
        let value = self.scalar("SELECT @@global.read_only").await?;
        Ok(matches!(value.as_deref(), Some("1") | Some("ON")))
    }

    async fn replication_lag(&mut self) -> RutaResult<Option<u64>> {
        // MySQL 8.0.22+ naming first, then the legacy statement
        let row = match self.connection.fetch_optional("SHOW REPLICA STATUS").await {
            Ok(row) => row.map(|row| named_value(&row, "Seconds_Behind_Source")),
            Err(sqlx::Error::Database(_)) => self
                .connection
                .fetch_optional("SHOW SLAVE STATUS")
                .await
                .map_err(map_sqlx_error)?
                .map(|row| named_value(&row, "Seconds_Behind_Master")),
            Err(e) => return Err(map_sqlx_error(e)),
        };
        Ok(row.flatten().and_then(|lag| lag.trim().parse().ok()))
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.connection.close().await {
            debug!("Error closing backend connection: {}", e);
        }
    }
}

fn column_info(row: &MySqlRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|c| ColumnInfo::from_type_name(c.name(), c.type_info().name()))
        .collect()
}

fn row_values(row: &MySqlRow) -> Vec<Option<Bytes>> {
    (0..row.len())
        .map(|i| {
            row.try_get_unchecked::<Option<Vec<u8>>, _>(i)
                .ok()
                .flatten()
                .map(Bytes::from)
        })
        .collect()
}

fn text_value(row: &MySqlRow, index: usize) -> Option<String> {
    row.try_get_unchecked::<Option<Vec<u8>>, _>(index)
        .ok()
        .flatten()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn named_value(row: &MySqlRow, column: &str) -> Option<String> {
    row.try_get_unchecked::<Option<Vec<u8>>, _>(column)
        .ok()
        .flatten()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Server-reported SQL errors keep their code and SQLSTATE; everything
/// else is a transport failure on the connection.
pub fn map_sqlx_error(error: sqlx::Error) -> RutaError {
    match error {
        sqlx::Error::Database(db) => match db.try_downcast_ref::<MySqlDatabaseError>() {
            Some(mysql) => RutaError::Query {
                code: mysql.number(),
                sql_state: mysql.code().unwrap_or("HY000").to_string(),
                message: mysql.message().to_string(),
            },
            None => RutaError::Query {
                code: 1105,
                sql_state: "HY000".to_string(),
                message: db.message().to_string(),
            },
        },
        sqlx::Error::Io(e) => RutaError::Network(e),
        sqlx::Error::PoolTimedOut => RutaError::timeout("backend connection"),
        other => RutaError::backend(other.to_string()),
    }
}
