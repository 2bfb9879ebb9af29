//! Named `:name` placeholders to positional `?`.
//!
//! The scan skips quoted strings, backtick identifiers and comments, and
//! leaves `::` (casts) alone.

use std::collections::{BTreeSet, HashMap};

use crate::error::SqlTaskpoolError;
use crate::types::RowValues;

use super::condition::Arg;

#[derive(Clone, Copy)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    Backticked,
    LineComment,
    BlockComment,
}

fn is_line_comment_start(bytes: &[u8], idx: usize) -> bool {
    (bytes.get(idx) == Some(&b'-') && bytes.get(idx + 1) == Some(&b'-'))
        || bytes.get(idx) == Some(&b'#')
}

fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn scan_name(bytes: &[u8], start: usize) -> Option<usize> {
    let mut idx = start;
    while idx < bytes.len() && is_name_byte(bytes[idx]) {
        idx += 1;
    }
    (idx > start).then_some(idx)
}

/// Rewrite `sql` with positional placeholders.
///
/// Every occurrence of `:name` becomes `?` with the value of `name` appended
/// to the returned parameters (so a name may repeat), except expressions,
/// which are inlined. The names used in `sql` and the keys of `params` must
/// be the same set.
///
/// # Errors
/// Returns [`SqlTaskpoolError::BuilderMisuse`] when a placeholder has no
/// value, a value has no placeholder, or a value is a list.
pub(crate) fn bind_named(
    sql: &str,
    params: &HashMap<String, Arg>,
) -> Result<(String, Vec<RowValues>), SqlTaskpoolError> {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut bound = Vec::new();
    let mut seen = BTreeSet::new();
    let mut state = State::Normal;
    let mut copied = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        match state {
            State::Normal => match b {
                b'\'' => state = State::SingleQuoted,
                b'"' => state = State::DoubleQuoted,
                b'`' => state = State::Backticked,
                _ if is_line_comment_start(bytes, idx) => state = State::LineComment,
                _ if is_block_comment_start(bytes, idx) => {
                    state = State::BlockComment;
                    idx += 1;
                }
                b':' if bytes.get(idx + 1) == Some(&b':') => idx += 1,
                b':' => {
                    if let Some(end) = scan_name(bytes, idx + 1) {
                        let name = &sql[idx + 1..end];
                        let value = params.get(name).ok_or_else(|| {
                            SqlTaskpoolError::BuilderMisuse(format!(
                                "placeholder :{name} has no value in `{sql}`"
                            ))
                        })?;
                        out.push_str(&sql[copied..idx]);
                        match value {
                            Arg::Value(value) => {
                                out.push('?');
                                bound.push(value.clone());
                            }
                            Arg::Expr(expr) => out.push_str(expr.as_str()),
                            Arg::List(_) => {
                                return Err(SqlTaskpoolError::BuilderMisuse(format!(
                                    "placeholder :{name} cannot bind a list"
                                )));
                            }
                        }
                        seen.insert(name);
                        copied = end;
                        idx = end - 1;
                    }
                }
                _ => {}
            },
            State::SingleQuoted => {
                if b == b'\\' {
                    idx += 1;
                } else if b == b'\'' {
                    if bytes.get(idx + 1) == Some(&b'\'') {
                        idx += 1;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuoted => {
                if b == b'\\' {
                    idx += 1;
                } else if b == b'"' {
                    if bytes.get(idx + 1) == Some(&b'"') {
                        idx += 1;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::Backticked => {
                if b == b'`' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment => {
                if is_block_comment_end(bytes, idx) {
                    state = State::Normal;
                    idx += 1;
                }
            }
        }
        idx += 1;
    }
    out.push_str(&sql[copied..]);

    let mut unused: Vec<&str> = params
        .keys()
        .map(String::as_str)
        .filter(|key| !seen.contains(key))
        .collect();
    if !unused.is_empty() {
        unused.sort_unstable();
        return Err(SqlTaskpoolError::BuilderMisuse(format!(
            "values without placeholder in `{sql}`: {}",
            unused.join(", ")
        )));
    }

    Ok((out, bound))
}
