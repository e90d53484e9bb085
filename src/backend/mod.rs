//! Backend database sessions
//!
//! The pool manager and the health monitor never talk to MySQL directly.
//! They hold a [`BackendConnector`] that opens [`BackendSession`]s; the
//! production connector is [`mysql::MySqlConnector`], tests substitute an
//! in-memory one.

pub mod mysql;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::Backend;
use crate::error::RutaResult;

/// Opens sessions against a backend
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, backend: &Backend) -> RutaResult<Box<dyn BackendSession>>;
}

/// One established connection to a backend server
#[async_trait]
pub trait BackendSession: Send {
    /// Run a statement as-is and collect its full result
    async fn execute(&mut self, sql: &str) -> RutaResult<QueryOutcome>;

    async fn ping(&mut self) -> RutaResult<()>;

    /// Current value of the server's global `read_only` flag
    async fn read_only(&mut self) -> RutaResult<bool>;

    /// Seconds the replica is behind its source; `None` when replication
    /// reports NULL or the server is not a replica
    async fn replication_lag(&mut self) -> RutaResult<Option<u64>>;

    async fn close(self: Box<Self>);
}

/// Result of a single statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    ResultSet {
        columns: Vec<ColumnInfo>,
        /// Text-encoded values; `None` is SQL NULL
        rows: Vec<Vec<Option<Bytes>>>,
    },
    Modified {
        affected_rows: u64,
        last_insert_id: u64,
    },
}

impl QueryOutcome {
    pub fn ok() -> Self {
        QueryOutcome::Modified {
            affected_rows: 0,
            last_insert_id: 0,
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            QueryOutcome::ResultSet { rows, .. } => rows.len(),
            QueryOutcome::Modified { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: ColumnType,
    pub unsigned: bool,
}

impl ColumnInfo {
    pub fn new<S: Into<String>>(name: S, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            unsigned: false,
        }
    }

    /// Build from a server type name such as `BIGINT UNSIGNED` or `VARCHAR`
    pub fn from_type_name<S: Into<String>>(name: S, type_name: &str) -> Self {
        let upper = type_name.trim().to_ascii_uppercase();
        let (base, unsigned) = match upper.strip_suffix(" UNSIGNED") {
            Some(base) => (base.to_string(), true),
            None => (upper, false),
        };
        Self {
            name: name.into(),
            column_type: ColumnType::from_type_name(&base),
            unsigned,
        }
    }
}

/// MySQL column type codes as sent in column definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0a,
    Time = 0x0b,
    DateTime = 0x0c,
    Year = 0x0d,
    VarChar = 0x0f,
    Bit = 0x10,
    Json = 0xf5,
    NewDecimal = 0xf6,
    Enum = 0xf7,
    Set = 0xf8,
    Blob = 0xfc,
    VarString = 0xfd,
    String = 0xfe,
    Geometry = 0xff,
}

impl ColumnType {
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "BOOLEAN" | "TINYINT" => ColumnType::Tiny,
            "SMALLINT" => ColumnType::Short,
            "INT" | "INTEGER" => ColumnType::Long,
            "MEDIUMINT" => ColumnType::Int24,
            "BIGINT" => ColumnType::LongLong,
            "FLOAT" => ColumnType::Float,
            "DOUBLE" => ColumnType::Double,
            "DECIMAL" => ColumnType::NewDecimal,
            "NULL" => ColumnType::Null,
            "TIMESTAMP" => ColumnType::Timestamp,
            "DATE" => ColumnType::Date,
            "TIME" => ColumnType::Time,
            "DATETIME" => ColumnType::DateTime,
            "YEAR" => ColumnType::Year,
            "BIT" => ColumnType::Bit,
            "JSON" => ColumnType::Json,
            "ENUM" => ColumnType::Enum,
            "SET" => ColumnType::Set,
            "GEOMETRY" => ColumnType::Geometry,
            "CHAR" | "BINARY" => ColumnType::String,
            "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "TINYTEXT" | "TEXT"
            | "MEDIUMTEXT" | "LONGTEXT" => ColumnType::Blob,
            _ => ColumnType::VarString,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether values of this type are binary (charset 63) rather than text
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ColumnType::Decimal
                | ColumnType::Tiny
                | ColumnType::Short
                | ColumnType::Long
                | ColumnType::Float
                | ColumnType::Double
                | ColumnType::LongLong
                | ColumnType::Int24
                | ColumnType::Year
                | ColumnType::NewDecimal
                | ColumnType::Bit
        )
    }
}
