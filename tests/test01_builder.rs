use sql_taskpool::prelude::*;

#[test]
fn select_with_join_named_and_list_conditions() -> Result<(), SqlTaskpoolError> {
    let stmt = Builder::new()
        .select("u.uid, u.name")
        .from("users as u")
        .join("orders as o", "o.uid = u.uid", JoinKind::from("LEFT"))
        .and_where(Condition::named(
            "u.uid = :id or u.parent = :id",
            [("id", 9)],
        ))
        .and_where(Condition::fields([("u.state", Arg::list([1, 2]))]))
        .order_by("u.uid desc")
        .limit(10, 20)
        .compile()?;

    assert_eq!(
        stmt.sql,
        "select u.uid, u.name from users as u left join orders as o on o.uid = u.uid \
         where (u.uid = ? or u.parent = ?) and u.state in (?,?) order by u.uid desc limit 20,10"
    );
    assert_eq!(
        stmt.params,
        vec![
            RowValues::Int(9),
            RowValues::Int(9),
            RowValues::Int(1),
            RowValues::Int(2)
        ]
    );
    Ok(())
}

#[test]
fn first_verb_wins() -> Result<(), SqlTaskpoolError> {
    let builder = Builder::new()
        .update("t")
        .select("a")
        .set([("a", 1)])
        .and_where(Condition::fields([("id", 2)]));
    assert_eq!(builder.kind(), Some(StatementKind::Update));

    let stmt = builder.compile()?;
    assert_eq!(stmt.sql, "update t set a=? where id = ?");
    assert_eq!(stmt.params, vec![RowValues::Int(1), RowValues::Int(2)]);
    Ok(())
}

#[test]
fn compile_does_not_consume_and_reset_clears_clauses() -> Result<(), SqlTaskpoolError> {
    let builder = Builder::new()
        .select("")
        .from("t")
        .and_where(Condition::fields([("a", 1)]))
        .order_by("a")
        .limit(5, 0);

    let first = builder.compile()?;
    assert_eq!(first, builder.compile()?);
    assert_eq!(first.sql, "select * from t where a = ? order by a limit 0,5");

    let stripped = builder.clone().reset_clause("orderBy").reset_clause("LIMIT").compile()?;
    assert_eq!(stripped.sql, "select * from t where a = ?");

    let unwhered = builder.clone().reset_clause("where_params").compile()?;
    assert_eq!(unwhered.sql, "select * from t order by a limit 0,5");
    assert!(unwhered.params.is_empty());

    assert!(builder.reset().compile().is_err());
    Ok(())
}

#[test]
fn identifiers_are_sanitized_values_are_bound() -> Result<(), SqlTaskpoolError> {
    let stmt = Builder::new()
        .select("name")
        .from("users; drop table users")
        .and_where(Condition::fields([("name", "x'; drop table users; --")]))
        .compile()?;

    assert_eq!(stmt.sql, "select name from users drop table users where name = ?");
    assert_eq!(
        stmt.params,
        vec![RowValues::Text("x'; drop table users; --".into())]
    );
    assert_eq!(sanitize("  a;\n  b`c` "), "a bc");
    Ok(())
}

#[test]
fn having_and_group_by() -> Result<(), SqlTaskpoolError> {
    let stmt = Builder::new()
        .select("uid")
        .from("orders")
        .and_where(Condition::fields([("state", 1), ("kind", 2)]))
        .group_by("uid")
        .and_having(Condition::named("count(*) > :n", [("n", 3)]))
        .compile()?;

    assert_eq!(
        stmt.sql,
        "select uid from orders where state = ? and kind = ? group by uid having count(*) > ?"
    );
    assert_eq!(
        stmt.params,
        vec![RowValues::Int(1), RowValues::Int(2), RowValues::Int(3)]
    );
    Ok(())
}

#[test]
fn named_placeholder_mismatch_is_misuse() {
    let missing = Builder::new()
        .select("")
        .from("t")
        .and_where(Condition::named("a = :a and b = :b", [("a", 1)]))
        .compile();
    assert!(matches!(missing, Err(SqlTaskpoolError::BuilderMisuse(_))));

    let extra = Builder::new()
        .select("")
        .from("t")
        .and_where(Condition::named("a = :a", [("a", 1), ("b", 2)]))
        .compile();
    assert!(matches!(extra, Err(SqlTaskpoolError::BuilderMisuse(_))));

    let quoted = Builder::new()
        .select("")
        .from("t")
        .and_where(Condition::named("a = ':b' and c = :c", [("c", 1)]))
        .compile();
    assert!(quoted.is_ok());
}

#[test]
fn mismatched_bulk_rows_are_rejected() {
    let result = Builder::new()
        .insert("t")
        .values_rows([vec![("a", 1), ("b", 2)], vec![("b", 3), ("a", 4)]])
        .compile();
    assert!(matches!(result, Err(SqlTaskpoolError::BuilderMisuse(_))));

    let empty_list = Builder::new()
        .select("")
        .from("t")
        .and_where(Condition::fields([("id", Arg::list(Vec::<i64>::new()))]))
        .compile();
    assert!(matches!(empty_list, Err(SqlTaskpoolError::BuilderMisuse(_))));
}

#[test]
fn resetting_a_misused_clause_makes_the_builder_usable() -> Result<(), SqlTaskpoolError> {
    let broken = Builder::new()
        .select("id")
        .from("users")
        .and_where(Condition::named("a = :a", [("b", 1)]));
    assert!(matches!(broken.compile(), Err(SqlTaskpoolError::BuilderMisuse(_))));

    let stmt = broken
        .reset_clause("where")
        .and_where(Condition::fields([("a", 1)]))
        .compile()?;
    assert_eq!(stmt.sql, "select id from users where a = ?");
    assert_eq!(stmt.params, vec![RowValues::Int(1)]);
    Ok(())
}
