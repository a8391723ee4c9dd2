use futures_util::TryStreamExt;
use log::warn;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgColumn, PgConnectOptions, PgConnection};
use sqlx::{Column, Connection, Either, Executor, Statement, TypeInfo};
use std::future::Future;
use std::str::FromStr;
use thiserror::Error;

use crate::codec;
use crate::parser::command_tag;
use crate::pool::ManageConnection;

/// A failed statement. The message is the database's own text.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct QueryError {
    message: String,
    fatal: bool,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    /// An error after which the connection cannot be reused
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

impl From<sqlx::Error> for QueryError {
    fn from(err: sqlx::Error) -> Self {
        let fatal = matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::WorkerCrashed
        );
        let message = match err.as_database_error() {
            Some(db_err) => db_err.message().to_string(),
            None => err.to_string(),
        };
        Self { message, fatal }
    }
}

/// How each row is encoded in the response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RowShape {
    /// Values in column order
    Array,
    /// Column name to value. Repeated column names keep the last value.
    #[default]
    Object,
}

impl RowShape {
    /// `?type=array` selects arrays; anything else means objects.
    pub fn from_param(value: Option<&str>) -> Self {
        match value {
            Some("array") => RowShape::Array,
            _ => RowShape::Object,
        }
    }

    fn shape_row(self, columns: &[ColumnDescription], values: Vec<JsonValue>) -> JsonValue {
        match self {
            RowShape::Array => JsonValue::Array(values),
            RowShape::Object => JsonValue::Object(
                columns
                    .iter()
                    .map(|column| column.name.clone())
                    .zip(values)
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescription {
    pub name: String,
    pub index: usize,
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_oid: Option<u32>,
}

/// Rows as the driver produced them, before shaping
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<ColumnDescription>,
    pub rows: Vec<Vec<JsonValue>>,
    pub rows_affected: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub command: String,
    pub query: String,
    pub rows: Vec<JsonValue>,
    pub row_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_description: Option<Vec<ColumnDescription>>,
}

impl QueryResult {
    pub fn from_result_set(query: &str, set: ResultSet, shape: RowShape) -> Self {
        let ResultSet {
            columns,
            rows,
            rows_affected,
        } = set;

        let rows = rows
            .into_iter()
            .map(|values| shape.shape_row(&columns, values))
            .collect();

        Self {
            command: command_tag(query),
            query: query.to_string(),
            rows,
            row_count: rows_affected,
            row_description: (!columns.is_empty()).then_some(columns),
        }
    }
}

/// A connection able to run one statement with positional arguments
pub trait QueryConnection: Send {
    fn run(
        &mut self,
        query: &str,
        args: &[JsonValue],
    ) -> impl Future<Output = Result<ResultSet, QueryError>> + Send;
}

pub async fn execute<C: QueryConnection>(
    conn: &mut C,
    query: &str,
    args: &[JsonValue],
    shape: RowShape,
) -> Result<QueryResult, QueryError> {
    let set = conn.run(query, args).await?;
    Ok(QueryResult::from_result_set(query, set, shape))
}

/// Opens plain Postgres connections for the pool
pub struct PgManager {
    options: PgConnectOptions,
}

impl PgManager {
    pub fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Ok(Self {
            options: PgConnectOptions::from_str(database_url)?,
        })
    }
}

impl ManageConnection for PgManager {
    type Connection = PgConnection;
    type Error = sqlx::Error;

    async fn connect(&self) -> Result<PgConnection, sqlx::Error> {
        PgConnection::connect_with(&self.options).await
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(err) = conn.close().await {
            warn!("Failed to close database connection: {}", err);
        }
    }
}

impl QueryConnection for PgConnection {
    async fn run(&mut self, query: &str, args: &[JsonValue]) -> Result<ResultSet, QueryError> {
        // Prepared first so arguments can follow the parameter types the
        // server inferred. The statement is cached and reused by the fetch.
        let prepared = (&mut *self).prepare(query).await?;
        let params = match prepared.parameters() {
            Some(Either::Left(types)) => types.to_vec(),
            _ => Vec::new(),
        };

        let mut set = ResultSet {
            columns: describe_columns(prepared.columns()),
            ..ResultSet::default()
        };

        let statement = codec::bind_args(sqlx::query(query), args, &params)?;
        let mut results = (&mut *self).fetch_many(statement);
        while let Some(step) = results.try_next().await? {
            match step {
                Either::Left(done) => set.rows_affected += done.rows_affected(),
                Either::Right(row) => set.rows.push(codec::row_to_values(&row)?),
            }
        }

        Ok(set)
    }
}

fn describe_columns(columns: &[PgColumn]) -> Vec<ColumnDescription> {
    columns
        .iter()
        .map(|column| ColumnDescription {
            name: column.name().to_string(),
            index: column.ordinal(),
            type_name: column.type_info().name().to_string(),
            type_oid: column.type_info().oid().map(|oid| oid.0),
        })
        .collect()
}
