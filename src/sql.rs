//! SQL fragment utilities.
//!
//! All SQL generated by the library quotes identifiers with `"…"` and never
//! embeds user-provided values as string literals; values go through
//! positional parameter binding in the engine adapter. The helpers here
//! build the recurring fragments: quoted identifiers, column lists
//! (optionally qualified), equi-join conditions over a key list, and NULL
//! projections used to widen a select to a larger column set.

use itertools::Itertools;

/// Quote a SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Comma-separated list of quoted column references.
pub fn col_list<I, S>(cols: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    cols.into_iter()
        .map(|c| quote_ident(c.as_ref()))
        .join(", ")
}

/// Comma-separated list of qualified column references (`q."c1", q."c2"`).
///
/// The qualifier is used verbatim; pass a quoted identifier when the
/// qualifier itself needs quoting.
pub fn prefixed_col_list<I, S>(qualifier: &str, cols: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    cols.into_iter()
        .map(|c| format!("{qualifier}.{}", quote_ident(c.as_ref())))
        .join(", ")
}

/// Equi-join condition over a key list: `l."k1" = r."k1" and l."k2" = …`.
///
/// Qualifiers are used verbatim and may be omitted on either side, in which
/// case the column reference is unqualified.
pub fn join_condition<I, S>(keys: I, left: Option<&str>, right: Option<&str>) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let l = left.map(|q| format!("{q}.")).unwrap_or_default();
    let r = right.map(|q| format!("{q}.")).unwrap_or_default();
    keys.into_iter()
        .map(|k| {
            let c = quote_ident(k.as_ref());
            format!("{l}{c} = {r}{c}")
        })
        .join(" and ")
}

/// NULL projection for columns absent on one side of a union:
/// `null as "c1", null as "c2"`.
pub fn null_projection<I, S>(cols: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    cols.into_iter()
        .map(|c| format!("null as {}", quote_ident(c.as_ref())))
        .join(", ")
}

/// `nextval('seq')` fragment with single quotes escaped.
///
/// Sequence names are the one place a name travels as a string literal
/// rather than an identifier; the engine resolves it by name at runtime.
pub fn nextval(sequence: &str) -> String {
    format!("nextval('{}')", sequence.replace('\'', "''"))
}

/// Collapse whitespace runs so generated statements can be compared
/// independently of layout.
#[cfg(test)]
pub(crate) fn normalize_ws(sql: &str) -> String {
    sql.split_whitespace().join(" ")
}
