//! Binding of [`QueryParam`] values onto driver queries.

use crate::models::{QueryParam, SqlQuery};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, MySqlArguments>;
type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;
type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_mysql_param<'q>(query: MySqlQuery<'q>, param: &'q QueryParam) -> MySqlQuery<'q> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

fn bind_postgres_param<'q>(query: PgQuery<'q>, param: &'q QueryParam) -> PgQuery<'q> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

fn bind_sqlite_param<'q>(query: SqliteQuery<'q>, param: &'q QueryParam) -> SqliteQuery<'q> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        // No native JSON type; stored as text
        QueryParam::Json(v) => query.bind(v.to_string()),
    }
}

/// Build a MySQL query with every value of `query` bound in order.
pub(crate) fn mysql_query(query: &SqlQuery) -> MySqlQuery<'_> {
    query
        .values()
        .iter()
        .fold(sqlx::query(query.sql()), bind_mysql_param)
}

/// Build a PostgreSQL query with every value of `query` bound in order.
pub(crate) fn postgres_query(query: &SqlQuery) -> PgQuery<'_> {
    query
        .values()
        .iter()
        .fold(sqlx::query(query.sql()), bind_postgres_param)
}

/// Build a SQLite query with every value of `query` bound in order.
pub(crate) fn sqlite_query(query: &SqlQuery) -> SqliteQuery<'_> {
    query
        .values()
        .iter()
        .fold(sqlx::query(query.sql()), bind_sqlite_param)
}
