//! Parameter binding utilities for database queries.
//!
//! This module resolves `Binds` into the positional form the MySQL protocol
//! understands (rewriting `:name` placeholders to `?`) and binds `QueryParam`
//! values to sqlx query objects.

use crate::error::{DbError, DbResult};
use crate::models::{Binds, QueryParam};
use sqlx::MySql;
use sqlx::mysql::MySqlArguments;
use sqlx::types::Json;

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::UInt(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
        QueryParam::DateTime(v) => query.bind(*v),
        QueryParam::NaiveDateTime(v) => query.bind(*v),
    }
}

/// Turn `binds` into SQL with positional placeholders plus values in order.
///
/// Positional binds pass through untouched. Named binds rewrite every `:name`
/// outside of string literals, quoted identifiers and comments to `?`; a name
/// may appear more than once. `::` is left alone.
pub(crate) fn resolve_binds(sql: &str, binds: Binds) -> DbResult<(String, Vec<QueryParam>)> {
    match binds {
        Binds::None => Ok((sql.to_string(), Vec::new())),
        Binds::Positional(params) => Ok((sql.to_string(), params)),
        Binds::Named(named) => {
            let mut params = Vec::new();
            let rewritten = rewrite_named(sql, |name| match named.get(name) {
                Some(value) => {
                    params.push(value.clone());
                    Ok(())
                }
                None => Err(DbError::invalid_input(format!(
                    "Named placeholder ':{}' has no bound value",
                    name
                ))),
            })?;
            Ok((rewritten, params))
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

fn rewrite_named<F>(sql: &str, mut on_name: F) -> DbResult<String>
where
    F: FnMut(&str) -> DbResult<()>,
{
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut state = Scan::Code;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            Scan::Quoted(quote) => {
                out.push(c);
                if c == '\\' && quote != '`' {
                    if let Some(escaped) = next {
                        out.push(escaped);
                        i += 1;
                    }
                } else if c == quote {
                    state = Scan::Code;
                }
            }
            Scan::LineComment => {
                out.push(c);
                if c == '\n' {
                    state = Scan::Code;
                }
            }
            Scan::BlockComment => {
                out.push(c);
                if c == '*' && next == Some('/') {
                    out.push('/');
                    i += 1;
                    state = Scan::Code;
                }
            }
            Scan::Code => match c {
                '\'' | '"' | '`' => {
                    out.push(c);
                    state = Scan::Quoted(c);
                }
                '#' => {
                    out.push(c);
                    state = Scan::LineComment;
                }
                '-' if next == Some('-') => {
                    out.push_str("--");
                    i += 1;
                    state = Scan::LineComment;
                }
                '/' if next == Some('*') => {
                    out.push_str("/*");
                    i += 1;
                    state = Scan::BlockComment;
                }
                ':' if next == Some(':') => {
                    out.push_str("::");
                    i += 1;
                }
                ':' if next.is_some_and(|n| n.is_ascii_alphabetic() || n == '_') => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                    {
                        end += 1;
                    }
                    let name: String = chars[start..end].iter().collect();
                    on_name(&name)?;
                    out.push('?');
                    i = end;
                    continue;
                }
                _ => out.push(c),
            },
        }
        i += 1;
    }

    Ok(out)
}
