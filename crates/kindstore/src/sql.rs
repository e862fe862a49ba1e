//! Query-to-SQL translation for the SQLite backend.
//!
//! Everything user-supplied (values, JSON paths, match text) is bound as a
//! parameter. The only interpolated identifier is the table name, which is
//! the kind; it has already passed the name pattern and is always quoted,
//! so kinds that collide with SQL keywords still work.

use rusqlite::types::Value;

use crate::query::{Direction, Query};
use crate::urn::check_name;
use crate::Result;

/// Columns shared by every kind table.
pub(crate) const COLUMNS: &str =
    "id, namespace, state, data, indexed_by, created_by, updated_by, created_at, updated_at";

/// SQL text with positional parameters in order of appearance.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Validated table name for a kind.
pub(crate) fn table(kind: &str) -> Result<&str> {
    check_name("kind", kind)?;
    Ok(kind)
}

/// Full-text shadow table for a kind. Kinds start with a letter, so the
/// leading underscore keeps this out of the kind namespace.
pub(crate) fn fts_table(kind: &str) -> String {
    format!("_fts_{kind}")
}

/// `createdAt` -> `created_at`
fn snake_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len() + 4);
    for (i, ch) in field.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Row column a field name maps to, if it is one of the shared columns.
pub(crate) fn column_for(field: &str) -> Option<&'static str> {
    match snake_case(field).as_str() {
        "id" => Some("id"),
        "namespace" => Some("namespace"),
        "state" => Some("state"),
        "indexed_by" => Some("indexed_by"),
        "created_at" => Some("created_at"),
        "created_by" => Some("created_by"),
        "updated_at" => Some("updated_at"),
        "updated_by" => Some("updated_by"),
        _ => None,
    }
}

/// `address.city` -> `$.address.city`
pub(crate) fn json_path(field: &str) -> String {
    format!("$.{field}")
}

/// Tokens as the FTS5 `unicode61` tokenizer would see them (ASCII folding only).
pub(crate) fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// FTS5 MATCH expression: every token quoted, implicitly ANDed.
///
/// `None` when the text has no tokens, which leaves the query unrestricted.
pub(crate) fn fts_expression(text: &str) -> Option<String> {
    let terms: Vec<String> = tokens(text).map(|term| format!("\"{term}\"")).collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn texts(values: &[String]) -> impl Iterator<Item = Value> + '_ {
    values.iter().map(|v| Value::Text(v.clone()))
}

/// WHERE clause (without the keyword) and its parameters; `None` when unfiltered.
pub(crate) fn where_clause(
    kind: &str,
    query: &Query,
    full_text: bool,
) -> Result<Option<(String, Vec<Value>)>> {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    for (column, values) in [
        ("namespace", &query.namespaces),
        ("state", &query.states),
        ("indexed_by", &query.indexes),
    ] {
        if !values.is_empty() {
            clauses.push(format!("{column} IN ({})", placeholders(values.len())));
            params.extend(texts(values));
        }
    }

    for (field, values) in &query.filters {
        crate::query::check_path(field)?;
        match column_for(field) {
            Some(column) => {
                clauses.push(format!("{column} IN ({})", placeholders(values.len())));
            }
            None => {
                clauses.push(format!(
                    "CAST(json_extract(data, ?) AS TEXT) IN ({})",
                    placeholders(values.len())
                ));
                params.push(Value::Text(json_path(field)));
            }
        }
        params.extend(texts(values));
    }

    if let Some(text) = query.match_text.as_deref() {
        if full_text {
            if let Some(expr) = fts_expression(text) {
                let fts = fts_table(table(kind)?);
                clauses.push(format!(
                    "rowid IN (SELECT rowid FROM \"{fts}\" WHERE \"{fts}\" MATCH ?)"
                ));
                params.push(Value::Text(expr));
            }
        } else if !text.trim().is_empty() {
            clauses.push("instr(lower(data), lower(?)) > 0".to_string());
            params.push(Value::Text(text.trim().to_string()));
        }
    }

    if clauses.is_empty() {
        Ok(None)
    } else {
        Ok(Some((clauses.join(" AND "), params)))
    }
}

/// Full SELECT with filters, ordering and pagination.
pub(crate) fn select(kind: &str, query: &Query, full_text: bool) -> Result<Statement> {
    query.validate()?;
    let table = table(kind)?;
    let mut sql = format!("SELECT {COLUMNS} FROM \"{table}\"");
    let mut params = Vec::new();

    if let Some((clause, where_params)) = where_clause(kind, query, full_text)? {
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
        params.extend(where_params);
    }

    let mut order: Vec<String> = Vec::new();
    let mut has_id = false;
    for key in query.sort_keys()? {
        let dir = match key.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        match column_for(&key.field) {
            Some(column) => {
                has_id |= column == "id";
                order.push(format!("{column} {dir}"));
            }
            None => {
                order.push(format!("json_extract(data, ?) {dir}"));
                params.push(Value::Text(json_path(&key.field)));
            }
        }
    }
    if !has_id {
        order.push("id ASC".to_string());
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(&order.join(", "));

    sql.push_str(" LIMIT ? OFFSET ?");
    params.push(Value::Integer(clamp_i64(query.limit)));
    params.push(Value::Integer(clamp_i64(query.offset)));

    Ok(Statement { sql, params })
}

/// COUNT(*) with the same filters as [`select`].
pub(crate) fn count(kind: &str, query: &Query, full_text: bool) -> Result<Statement> {
    let table = table(kind)?;
    let mut sql = format!("SELECT COUNT(*) FROM \"{table}\"");
    let mut params = Vec::new();
    if let Some((clause, where_params)) = where_clause(kind, query, full_text)? {
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
        params = where_params;
    }
    Ok(Statement { sql, params })
}

fn clamp_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn unfiltered_select_sorts_by_id_with_default_paging() {
        let stmt = select("person", &Query::new(), true).unwrap();
        assert_eq!(
            stmt.sql,
            format!("SELECT {COLUMNS} FROM \"person\" ORDER BY id ASC LIMIT ? OFFSET ?")
        );
        assert_eq!(stmt.params, vec![Value::Integer(1000), Value::Integer(0)]);
    }

    #[test]
    fn set_filters_become_in_predicates() {
        let q = Query::new()
            .namespace("acme")
            .namespace("globex")
            .state("active")
            .index("eu");
        let (clause, params) = where_clause("person", &q, true).unwrap().unwrap();
        assert_eq!(
            clause,
            "namespace IN (?, ?) AND state IN (?) AND indexed_by IN (?)"
        );
        assert_eq!(
            params,
            vec![text("acme"), text("globex"), text("active"), text("eu")]
        );
    }

    #[test]
    fn filters_route_to_columns_or_json_paths() {
        let q = Query::new()
            .filter("createdBy", "alice")
            .filter("address.city", "Oslo")
            .filter("address.city", "Bergen");
        let (clause, params) = where_clause("person", &q, true).unwrap().unwrap();
        assert_eq!(
            clause,
            "CAST(json_extract(data, ?) AS TEXT) IN (?, ?) AND created_by IN (?)"
        );
        assert_eq!(
            params,
            vec![
                text("$.address.city"),
                text("Oslo"),
                text("Bergen"),
                text("alice")
            ]
        );
    }

    #[test]
    fn match_uses_fts_or_substring() {
        let q = Query::new().matching("number 47");
        let (clause, params) = where_clause("app", &q, true).unwrap().unwrap();
        assert_eq!(
            clause,
            r#"rowid IN (SELECT rowid FROM "_fts_app" WHERE "_fts_app" MATCH ?)"#
        );
        assert_eq!(params, vec![text("\"number\" \"47\"")]);

        let (clause, params) = where_clause("app", &q, false).unwrap().unwrap();
        assert_eq!(clause, "instr(lower(data), lower(?)) > 0");
        assert_eq!(params, vec![text("number 47")]);
    }

    #[test]
    fn blank_match_adds_nothing() {
        let q = Query::new().matching("   ");
        assert!(where_clause("app", &q, true).unwrap().is_none());
    }

    #[test]
    fn sort_mixes_columns_and_json_paths() {
        let q = Query::new().sort(["-updatedAt", "name"]).limit(5).offset(1);
        let stmt = select("person", &q, true).unwrap();
        assert!(stmt
            .sql
            .ends_with("ORDER BY updated_at DESC, json_extract(data, ?) ASC, id ASC LIMIT ? OFFSET ?"));
        assert_eq!(
            stmt.params,
            vec![text("$.name"), Value::Integer(5), Value::Integer(1)]
        );
    }

    #[test]
    fn explicit_id_sort_is_not_duplicated() {
        let stmt = select("person", &Query::new().sort(["-id"]), true).unwrap();
        assert!(stmt.sql.contains("ORDER BY id DESC LIMIT"));
    }

    #[test]
    fn count_ignores_pagination() {
        let q = Query::new().state("active").limit(3).sort(["-name"]);
        let stmt = count("person", &q, true).unwrap();
        assert_eq!(stmt.sql, r#"SELECT COUNT(*) FROM "person" WHERE state IN (?)"#);
        assert_eq!(stmt.params, vec![text("active")]);
    }

    #[test]
    fn rejects_bad_kind_and_zero_limit() {
        assert!(select("Person; DROP", &Query::new(), true).is_err());
        assert!(select("person", &Query::new().limit(0), true).is_err());
    }

    #[test]
    fn fts_terms_are_quoted_tokens() {
        assert_eq!(
            fts_expression("Say \"hi\", o'neil"),
            Some(r#""say" "hi" "o" "neil""#.to_string())
        );
        assert_eq!(fts_expression(""), None);
        assert_eq!(fts_expression("!!! -- ?"), None);
    }

    #[test]
    fn punctuation_only_match_adds_nothing() {
        let q = Query::new().matching("!!!");
        assert!(where_clause("app", &q, true).unwrap().is_none());
    }

    #[test]
    fn shadow_table_cannot_be_a_kind() {
        assert_eq!(fts_table("app"), "_fts_app");
        assert!(table(&fts_table("app")).is_err());
    }

    #[test]
    fn column_names_are_case_normalized() {
        assert_eq!(column_for("CreatedAt"), Some("created_at"));
        assert_eq!(column_for("updated_by"), Some("updated_by"));
        assert_eq!(column_for("name"), None);
    }
}
