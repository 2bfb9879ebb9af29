use std::collections::HashMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;

use crate::error::SqlTaskpoolError;
use crate::types::RowValues;

use super::placeholders::bind_named;
use super::sanitize;

/// Trusted SQL text placed into a statement verbatim, never bound.
///
/// ```rust
/// use sql_taskpool::prelude::*;
///
/// let stmt = Builder::new()
///     .update("counters")
///     .set([("hits", Arg::from(Expression::new("hits + 1")))])
///     .and_where(Condition::fields([("id", 3)]))
///     .compile()
///     .unwrap();
/// assert_eq!(stmt.sql, "update counters set hits=hits + 1 where id = ?");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression(String);

impl Expression {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value handed to the builder.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Bound through a `?` placeholder.
    Value(RowValues),
    /// Expands to `in (?,?,..)` in a field condition.
    List(Vec<RowValues>),
    /// Inlined as is.
    Expr(Expression),
}

impl Arg {
    /// A list for `field in (..)` conditions.
    pub fn list<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<RowValues>,
    {
        Arg::List(values.into_iter().map(Into::into).collect())
    }
}

macro_rules! arg_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg::Value(value.into())
                }
            }
        )*
    };
}

arg_from_value!(i64, i32, f64, bool, &str, String, NaiveDateTime, JsonValue);

impl From<RowValues> for Arg {
    fn from(value: RowValues) -> Self {
        Arg::Value(value)
    }
}

impl From<Vec<RowValues>> for Arg {
    fn from(values: Vec<RowValues>) -> Self {
        Arg::List(values)
    }
}

impl From<Expression> for Arg {
    fn from(expr: Expression) -> Self {
        Arg::Expr(expr)
    }
}

/// A `where` / `having` / join `on` condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// SQL used as written.
    Raw(String),
    /// SQL with `:name` placeholders and their values.
    Named {
        sql: String,
        params: HashMap<String, Arg>,
    },
    /// `field = ?` for each entry, `field in (..)` for lists, joined by `and`.
    Fields(Vec<(String, Arg)>),
}

impl Condition {
    #[must_use]
    pub fn raw(sql: impl Into<String>) -> Self {
        Condition::Raw(sql.into())
    }

    /// ```rust
    /// use sql_taskpool::prelude::*;
    ///
    /// let cond = Condition::named(
    ///     "(uid = :a or uid = :b) and status = :status",
    ///     [("a", Arg::from(1)), ("b", Arg::from(2)), ("status", Arg::from("on"))],
    /// );
    /// # let _ = cond;
    /// ```
    pub fn named<I, K, V>(sql: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Arg>,
    {
        Condition::Named {
            sql: sql.into(),
            params: params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn fields<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Arg>,
    {
        Condition::Fields(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub(crate) fn to_fragment(&self) -> Result<Fragment, SqlTaskpoolError> {
        let fragment = match self {
            Condition::Raw(sql) => Fragment::compound(sql.trim().to_owned(), Vec::new()),
            Condition::Named { sql, params } => {
                let (sql, params) = bind_named(sql, params)?;
                Fragment::compound(sql.trim().to_owned(), params)
            }
            Condition::Fields(entries) => fields_fragment(entries)?,
        };
        if fragment.sql.is_empty() {
            return Err(SqlTaskpoolError::BuilderMisuse("empty condition".into()));
        }
        Ok(fragment)
    }
}

impl From<&str> for Condition {
    fn from(sql: &str) -> Self {
        Condition::raw(sql)
    }
}

impl From<String> for Condition {
    fn from(sql: String) -> Self {
        Condition::Raw(sql)
    }
}

fn fields_fragment(entries: &[(String, Arg)]) -> Result<Fragment, SqlTaskpoolError> {
    let mut parts = Vec::with_capacity(entries.len());
    let mut params = Vec::new();
    for (field, value) in entries {
        let field = sanitize(field);
        match value {
            Arg::Value(value) => {
                parts.push(format!("{field} = ?"));
                params.push(value.clone());
            }
            Arg::List(values) if values.is_empty() => {
                return Err(SqlTaskpoolError::BuilderMisuse(format!(
                    "empty list for `{field} in (..)`"
                )));
            }
            Arg::List(values) => {
                let marks = vec!["?"; values.len()].join(",");
                parts.push(format!("{field} in ({marks})"));
                params.extend(values.iter().cloned());
            }
            Arg::Expr(expr) => parts.push(format!("{field} = {expr}")),
        }
    }
    Ok(Fragment {
        compound: parts.len() > 1,
        sql: parts.join(" and "),
        params,
    })
}

/// Compiled SQL piece plus the values for its placeholders.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Fragment {
    pub(crate) sql: String,
    pub(crate) params: Vec<RowValues>,
    /// Needs parentheses when and-ed with other fragments.
    pub(crate) compound: bool,
}

impl Fragment {
    fn compound(sql: String, params: Vec<RowValues>) -> Self {
        Self {
            sql,
            params,
            compound: true,
        }
    }
}

/// `a and (b or c) and ..` over all fragments, with their parameters in order.
pub(crate) fn and_all(fragments: &[Fragment]) -> Fragment {
    if let [single] = fragments {
        return single.clone();
    }
    let sql = fragments
        .iter()
        .map(|f| {
            if f.compound {
                format!("({})", f.sql)
            } else {
                f.sql.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" and ");
    Fragment {
        sql,
        params: fragments.iter().flat_map(|f| f.params.iter().cloned()).collect(),
        compound: true,
    }
}
