//! Statement builder: a value type assembled call by call and compiled to
//! parameterized SQL.
//!
//! Identifiers (tables, fields, ordering, grouping, index names) cannot be
//! bound, so they pass through [`sanitize`]. Values always go through `?`.

mod compile;
mod condition;
mod placeholders;

use std::sync::LazyLock;

use regex::Regex;

use crate::types::RowValues;

pub use compile::CompiledStatement;
pub use condition::{Arg, Condition, Expression};

use condition::Fragment;
pub(crate) use placeholders::bind_named;

static IDENTIFIER_NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^-a-zA-Z0-9_.,\s*]+").expect("identifier filter pattern is valid")
});

/// Strip everything but letters, digits, `_ - . , *` and whitespace, then
/// collapse whitespace runs.
#[must_use]
pub fn sanitize(text: &str) -> String {
    IDENTIFIER_NOISE
        .replace_all(text, "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Update,
    Insert,
    Replace,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
    Right,
}

impl JoinKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JoinKind::Inner => "inner",
            JoinKind::Left => "left",
            JoinKind::Right => "right",
        }
    }
}

/// `"left"` / `"right"` (any case); anything else is an inner join.
impl From<&str> for JoinKind {
    fn from(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "left" => JoinKind::Left,
            "right" => JoinKind::Right,
            _ => JoinKind::Inner,
        }
    }
}

/// One SQL statement under construction.
///
/// Every method consumes and returns the builder, so a partly built
/// statement can be cloned and finished two ways without interference.
/// The first verb (`select`, `update`, `insert`, `replace`, `delete`) sticks;
/// later verbs are ignored until [`Builder::reset`]. Misuse is reported by
/// [`Builder::compile`].
///
/// ```rust
/// use sql_taskpool::prelude::*;
///
/// let stmt = Builder::new()
///     .select("uid,name")
///     .from("t")
///     .and_where(Condition::fields([("uid", 5)]))
///     .compile()
///     .unwrap();
/// assert_eq!(stmt.sql, "select uid,name from t where uid = ?");
/// assert_eq!(stmt.params, vec![RowValues::Int(5)]);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Builder {
    pub(crate) kind: Option<StatementKind>,
    pub(crate) fields: Option<String>,
    pub(crate) table: String,
    pub(crate) joins: Vec<Fragment>,
    pub(crate) wheres: Vec<Fragment>,
    pub(crate) havings: Vec<Fragment>,
    pub(crate) group_by: Option<String>,
    pub(crate) order_by: Option<String>,
    pub(crate) limit: Option<(u64, u64)>,
    pub(crate) set: Option<Fragment>,
    pub(crate) values: Option<Fragment>,
    pub(crate) force_index: Option<String>,
    /// Misuse per clause, in the order recorded; `compile` reports the first.
    misuse: Vec<(&'static str, String)>,
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn verb(mut self, kind: StatementKind, table: &str) -> Self {
        if self.kind.is_none() {
            self.kind = Some(kind);
            if !table.is_empty() {
                self.table = sanitize(table);
            }
        }
        self
    }

    fn misuse(mut self, clause: &'static str, message: impl Into<String>) -> Self {
        self.misuse.push((clause, message.into()));
        self
    }

    /// Start a `select`. An empty `fields` keeps `*`.
    #[must_use]
    pub fn select(self, fields: &str) -> Self {
        if self.kind.is_some() {
            return self;
        }
        let this = self.verb(StatementKind::Select, "");
        if fields.trim().is_empty() {
            this
        } else {
            this.fields(fields)
        }
    }

    #[must_use]
    pub fn update(self, table: &str) -> Self {
        self.verb(StatementKind::Update, table)
    }

    #[must_use]
    pub fn insert(self, table: &str) -> Self {
        self.verb(StatementKind::Insert, table)
    }

    #[must_use]
    pub fn replace(self, table: &str) -> Self {
        self.verb(StatementKind::Replace, table)
    }

    #[must_use]
    pub fn delete(self, table: &str) -> Self {
        self.verb(StatementKind::Delete, table)
    }

    /// Replace the field list. Empty means `*`.
    #[must_use]
    pub fn fields(mut self, fields: &str) -> Self {
        let fields = sanitize(fields);
        self.fields = (!fields.is_empty()).then_some(fields);
        self
    }

    /// Replace the field list with trusted SQL, e.g. `count(*) as cnt`.
    #[must_use]
    pub fn fields_expr(mut self, fields: &Expression) -> Self {
        self.fields = Some(fields.as_str().to_owned());
        self
    }

    /// Table with an optional alias, e.g. `users as u`.
    #[must_use]
    pub fn from(mut self, table: &str) -> Self {
        self.table = sanitize(table);
        self
    }

    #[must_use]
    pub fn table(self, table: &str) -> Self {
        self.from(table)
    }

    #[must_use]
    pub fn force_index(mut self, index: &str) -> Self {
        self.force_index = Some(format!("force index({})", sanitize(index)));
        self
    }

    /// Add a join. Joins accumulate in call order.
    #[must_use]
    pub fn join(mut self, table: &str, on: impl Into<Condition>, kind: JoinKind) -> Self {
        match on.into().to_fragment() {
            Ok(on) => {
                self.joins.push(Fragment {
                    sql: format!("{} join {} on {}", kind.as_str(), sanitize(table), on.sql),
                    params: on.params,
                    compound: false,
                });
                self
            }
            Err(err) => self.misuse("join", err.to_string()),
        }
    }

    /// Add a `where` condition; repeated calls are and-ed.
    #[must_use]
    pub fn and_where(mut self, condition: impl Into<Condition>) -> Self {
        match condition.into().to_fragment() {
            Ok(fragment) => {
                self.wheres.push(fragment);
                self
            }
            Err(err) => self.misuse("where", err.to_string()),
        }
    }

    /// Add a `having` condition; repeated calls are and-ed.
    #[must_use]
    pub fn and_having(mut self, condition: impl Into<Condition>) -> Self {
        match condition.into().to_fragment() {
            Ok(fragment) => {
                self.havings.push(fragment);
                self
            }
            Err(err) => self.misuse("having", err.to_string()),
        }
    }

    #[must_use]
    pub fn group_by(mut self, fields: &str) -> Self {
        self.group_by = Some(sanitize(fields));
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: &str) -> Self {
        self.order_by = Some(sanitize(order));
        self
    }

    /// `count` rows starting at row `offset` (0-based).
    #[must_use]
    pub fn limit(mut self, count: u64, offset: u64) -> Self {
        self.limit = Some((count, offset));
        self
    }

    /// Assignments for `update`; replaces earlier ones. An empty set is ignored.
    #[must_use]
    pub fn set<I, K, V>(mut self, data: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Arg>,
    {
        let mut parts = Vec::new();
        let mut params = Vec::new();
        for (field, value) in data {
            let field = sanitize(&field.into());
            match value.into() {
                Arg::Value(value) => {
                    parts.push(format!("{field}=?"));
                    params.push(value);
                }
                Arg::Expr(expr) => parts.push(format!("{field}={expr}")),
                Arg::List(_) => return self.misuse("set", format!("cannot assign a list to `{field}`")),
            }
        }
        if !parts.is_empty() {
            self.set = Some(Fragment {
                sql: parts.join(","),
                params,
                compound: false,
            });
        }
        self
    }

    /// One row for `insert` / `replace`; replaces earlier values.
    #[must_use]
    pub fn values<I, K, V>(self, row: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Arg>,
    {
        self.values_rows([row])
    }

    /// Several rows for a bulk `insert` / `replace`. Every row must name the
    /// same columns in the same order as the first.
    #[must_use]
    pub fn values_rows<R, I, K, V>(mut self, rows: R) -> Self
    where
        R: IntoIterator<Item = I>,
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Arg>,
    {
        let mut columns: Option<Vec<String>> = None;
        let mut tuples = Vec::new();
        let mut params = Vec::new();

        for row in rows {
            let mut names = Vec::new();
            let mut slots = Vec::new();
            for (field, value) in row {
                names.push(sanitize(&field.into()));
                match value.into() {
                    Arg::Value(value) => {
                        slots.push("?".to_owned());
                        params.push(value);
                    }
                    Arg::Expr(expr) => slots.push(expr.as_str().to_owned()),
                    Arg::List(_) => return self.misuse("values", "cannot insert a list into one column"),
                }
            }
            match &columns {
                None => columns = Some(names),
                Some(first) if *first != names => {
                    return self.misuse(
                        "values",
                        format!(
                            "row columns ({}) differ from the first row ({})",
                            names.join(","),
                            first.join(",")
                        ),
                    );
                }
                Some(_) => {}
            }
            tuples.push(format!("({})", slots.join(",")));
        }

        match columns {
            Some(columns) if !columns.is_empty() => {
                self.values = Some(Fragment {
                    sql: format!("({}) values {}", columns.join(","), tuples.join(",")),
                    params,
                    compound: false,
                });
                self
            }
            _ => self.misuse("values", "values need at least one column"),
        }
    }

    /// Clear everything, verb included.
    #[must_use]
    pub fn reset(self) -> Self {
        Self::default()
    }

    /// Clear one clause and its parameters, along with any misuse that clause
    /// recorded. `name` is matched ignoring case and underscores (`order_by`,
    /// `orderBy`, `ORDERBY`); a trailing `params` is accepted. Unknown names
    /// are ignored.
    #[must_use]
    pub fn reset_clause(mut self, name: &str) -> Self {
        let normalized = name.replace('_', "").to_ascii_lowercase();
        let clause = normalized.strip_suffix("params").unwrap_or(&normalized);
        let cleared = match clause {
            "type" | "kind" => {
                self.kind = None;
                None
            }
            "fields" => {
                self.fields = None;
                None
            }
            "table" => {
                self.table.clear();
                None
            }
            "join" | "joins" => {
                self.joins.clear();
                Some("join")
            }
            "where" => {
                self.wheres.clear();
                Some("where")
            }
            "having" => {
                self.havings.clear();
                Some("having")
            }
            "groupby" => {
                self.group_by = None;
                None
            }
            "orderby" => {
                self.order_by = None;
                None
            }
            "limit" => {
                self.limit = None;
                None
            }
            "set" => {
                self.set = None;
                Some("set")
            }
            "values" => {
                self.values = None;
                Some("values")
            }
            "forceindex" => {
                self.force_index = None;
                None
            }
            _ => None,
        };
        if let Some(cleared) = cleared {
            self.misuse.retain(|(clause, _)| *clause != cleared);
        }
        self
    }

    #[must_use]
    pub fn kind(&self) -> Option<StatementKind> {
        self.kind
    }

    /// `(count, offset)` if a limit is set.
    #[must_use]
    pub fn limit_value(&self) -> Option<(u64, u64)> {
        self.limit
    }

    pub(crate) fn misuse_message(&self) -> Option<&str> {
        self.misuse.first().map(|(_, message)| message.as_str())
    }
}

pub(crate) fn all_params<'a>(fragments: impl IntoIterator<Item = &'a Fragment>) -> Vec<RowValues> {
    fragments
        .into_iter()
        .flat_map(|f| f.params.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_punctuation() {
        assert_eq!(sanitize("name; DROP TABLE x"), "name DROP TABLE x");
        assert_eq!(sanitize("t.a, b-c, *"), "t.a, b-c, *");
        assert_eq!(sanitize("a'); --"), "a --");
        assert_eq!(sanitize("  uid   desc "), "uid desc");
    }

    #[test]
    fn first_verb_sticks() {
        let b = Builder::new().insert("t").delete("u").select("a");
        assert_eq!(b.kind(), Some(StatementKind::Insert));
        assert_eq!(b.table, "t");
    }

    #[test]
    fn join_kind_from_str_defaults_to_inner() {
        assert_eq!(JoinKind::from("LEFT"), JoinKind::Left);
        assert_eq!(JoinKind::from("right"), JoinKind::Right);
        assert_eq!(JoinKind::from("outer"), JoinKind::Inner);
    }

    #[test]
    fn reset_clause_matches_loosely() {
        let b = Builder::new()
            .select("a")
            .from("t")
            .order_by("a desc")
            .limit(10, 0)
            .and_where(Condition::fields([("a", 1)]));
        let b = b.reset_clause("Order_By").reset_clause("LIMIT");
        assert_eq!(b.order_by, None);
        assert_eq!(b.limit, None);
        assert_eq!(b.wheres.len(), 1);
        let b = b.reset_clause("whereParams").reset_clause("nonsense");
        assert!(b.wheres.is_empty());
        assert_eq!(b.kind(), Some(StatementKind::Select));
    }

    #[test]
    fn reset_clears_verb() {
        let b = Builder::new().delete("t").reset().update("u");
        assert_eq!(b.kind(), Some(StatementKind::Update));
        assert_eq!(b.table, "u");
    }

    #[test]
    fn clones_do_not_share_state() {
        let base = Builder::new().select("a").from("t");
        let narrowed = base.clone().and_where("a > 1");
        assert!(base.wheres.is_empty());
        assert_eq!(narrowed.wheres.len(), 1);
    }

    #[test]
    fn mismatched_bulk_rows_are_misuse() {
        let b = Builder::new()
            .insert("t")
            .values_rows([vec![("a", 1), ("b", 2)], vec![("a", 3), ("c", 4)]]);
        assert!(b.misuse_message().is_some());
    }

    #[test]
    fn reset_clause_drops_that_clause_misuse_only() {
        let b = Builder::new()
            .update("t")
            .set([("a", Arg::list([1, 2]))])
            .and_where(Condition::named("a = :a", [("b", 1)]));
        assert!(b.misuse_message().unwrap().contains("list"));

        let b = b.reset_clause("set");
        assert!(b.misuse_message().is_some());
        let b = b.reset_clause("where");
        assert_eq!(b.misuse_message(), None);

        let stmt = b
            .set([("a", 1)])
            .and_where(Condition::named("id = :id", [("id", 2)]))
            .compile()
            .unwrap();
        assert_eq!(stmt.sql, "update t set a=? where id = ?");
        assert_eq!(stmt.params, vec![RowValues::Int(1), RowValues::Int(2)]);
    }
}
