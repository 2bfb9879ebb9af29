use crate::error::SqlTaskpoolError;
use crate::types::RowValues;

use super::condition::{Fragment, and_all};
use super::{Builder, StatementKind, all_params};

/// SQL with `?` placeholders and the values for them, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub sql: String,
    pub params: Vec<RowValues>,
}

impl Builder {
    /// Compile to SQL and parameters. The builder is left untouched.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::BuilderMisuse`] for the first misuse recorded
    /// while building, when no verb was given, or when the verb lacks its
    /// table, assignments or values.
    pub fn compile(&self) -> Result<CompiledStatement, SqlTaskpoolError> {
        if let Some(message) = self.misuse_message() {
            return Err(SqlTaskpoolError::BuilderMisuse(message.to_owned()));
        }
        let Some(kind) = self.kind else {
            return Err(SqlTaskpoolError::BuilderMisuse(
                "no statement verb (select/update/insert/replace/delete)".into(),
            ));
        };
        if kind != StatementKind::Select && self.table.is_empty() {
            return Err(SqlTaskpoolError::BuilderMisuse(format!(
                "{kind:?} statement without a table"
            )));
        }

        let statement = match kind {
            StatementKind::Select => self.compile_select(),
            StatementKind::Update => self.compile_update()?,
            StatementKind::Insert => self.compile_insert("insert")?,
            StatementKind::Replace => self.compile_insert("replace")?,
            StatementKind::Delete => self.compile_delete(),
        };
        Ok(statement)
    }

    fn compile_select(&self) -> CompiledStatement {
        let fields = self.fields.as_deref().unwrap_or("*");
        if self.table.is_empty() {
            return CompiledStatement {
                sql: format!("select {fields}"),
                params: Vec::new(),
            };
        }

        let joins = self.joins_sql();
        let wheres = clause("where", &self.wheres);
        let havings = clause("having", &self.havings);
        let group_by = self.group_by.as_ref().map(|g| format!("group by {g}"));
        let order_by = self.order_by.as_ref().map(|o| format!("order by {o}"));
        let limit = self
            .limit
            .map(|(count, offset)| format!("limit {offset},{count}"));

        let sql = join_parts([
            Some(format!("select {fields} from {}", self.table)),
            joins,
            self.force_index.clone(),
            wheres.as_ref().map(|w| w.sql.clone()),
            group_by,
            havings.as_ref().map(|h| h.sql.clone()),
            order_by,
            limit,
        ]);

        let mut params = all_params(&self.joins);
        params.extend(wheres.map(|w| w.params).unwrap_or_default());
        params.extend(havings.map(|h| h.params).unwrap_or_default());
        CompiledStatement { sql, params }
    }

    fn compile_update(&self) -> Result<CompiledStatement, SqlTaskpoolError> {
        let Some(set) = &self.set else {
            return Err(SqlTaskpoolError::BuilderMisuse(
                "update without assignments".into(),
            ));
        };
        let wheres = clause("where", &self.wheres);

        let sql = join_parts([
            Some(format!("update {}", self.table)),
            self.joins_sql(),
            Some(format!("set {}", set.sql)),
            wheres.as_ref().map(|w| w.sql.clone()),
        ]);

        let mut params = all_params(&self.joins);
        params.extend(set.params.iter().cloned());
        params.extend(wheres.map(|w| w.params).unwrap_or_default());
        Ok(CompiledStatement { sql, params })
    }

    fn compile_insert(&self, verb: &str) -> Result<CompiledStatement, SqlTaskpoolError> {
        let Some(values) = &self.values else {
            return Err(SqlTaskpoolError::BuilderMisuse(format!(
                "{verb} without values"
            )));
        };
        Ok(CompiledStatement {
            sql: format!("{verb} into {} {}", self.table, values.sql),
            params: values.params.clone(),
        })
    }

    fn compile_delete(&self) -> CompiledStatement {
        let wheres = clause("where", &self.wheres);
        // Single-table delete takes a row count only.
        let limit = self.limit.map(|(count, _)| format!("limit {count}"));

        let sql = join_parts([
            Some(format!("delete from {}", self.table)),
            wheres.as_ref().map(|w| w.sql.clone()),
            self.order_by.as_ref().map(|o| format!("order by {o}")),
            limit,
        ]);

        CompiledStatement {
            sql,
            params: wheres.map(|w| w.params).unwrap_or_default(),
        }
    }

    fn joins_sql(&self) -> Option<String> {
        (!self.joins.is_empty()).then(|| {
            self.joins
                .iter()
                .map(|j| j.sql.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        })
    }
}

fn clause(keyword: &str, fragments: &[Fragment]) -> Option<Fragment> {
    if fragments.is_empty() {
        return None;
    }
    let combined = and_all(fragments);
    Some(Fragment {
        sql: format!("{keyword} {}", combined.sql),
        params: combined.params,
        compound: false,
    })
}

fn join_parts<const N: usize>(parts: [Option<String>; N]) -> String {
    parts
        .into_iter()
        .flatten()
        .filter(|p| !p.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
