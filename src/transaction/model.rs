use std::sync::LazyLock;

use regex::Regex;

use crate::types::Role;

static WRITE_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(update|replace|delete|insert|drop|grant|truncate|alter|create)\b")
        .expect("write verb pattern is valid")
});

/// Best-effort role for a statement: [`Role::Write`] when any `;`-separated
/// fragment starts with a writing verb, [`Role::Read`] otherwise.
///
/// Verbs that do not lead a fragment (CTEs, subqueries, comments) are not seen.
#[must_use]
pub fn infer_role(sql: &str) -> Role {
    if sql
        .split(';')
        .map(str::trim)
        .any(|fragment| WRITE_VERB.is_match(fragment))
    {
        Role::Write
    } else {
        Role::Read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads() {
        assert_eq!(infer_role("select 1"), Role::Read);
        assert_eq!(infer_role("  SELECT * FROM t where name = 'update'"), Role::Read);
        assert_eq!(infer_role("show tables"), Role::Read);
        assert_eq!(infer_role(""), Role::Read);
    }

    #[test]
    fn writes_any_case() {
        for sql in [
            "insert into t values (1)",
            "UPDATE t SET a = 1",
            "Delete from t",
            "replace into t values (1)",
            "drop table t",
            "grant all on db.* to u",
            "truncate t",
            "alter table t add c int",
            "create table t (a int)",
        ] {
            assert_eq!(infer_role(sql), Role::Write, "{sql}");
        }
    }

    #[test]
    fn later_fragment_can_write() {
        assert_eq!(infer_role("select 1;  insert into t values (2)"), Role::Write);
        assert_eq!(infer_role("select 1;\n\tdelete from t"), Role::Write);
    }

    #[test]
    fn verb_must_be_a_whole_word() {
        assert_eq!(infer_role("updates_view"), Role::Read);
        assert_eq!(infer_role("created_at"), Role::Read);
    }
}
