//! Query fragments and bound parameters.
//! All values reach SQLite through named parameters; fragment SQL text is only ever
//! concatenated with other fragment text, never with caller or actor values.

use std::borrow::Cow;
use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

/// Parameter names the engine binds itself on every composed query.
pub const RESERVED_PARAMS: &[&str] = &["actor", "actor_id", "action"];

static PARAM_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap());
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static STRING_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self { SqlValue::Text(s) => Some(s.as_str()), _ => None }
    }

    pub fn is_null(&self) -> bool { matches!(self, SqlValue::Null) }

    pub(crate) fn from_ref(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Text(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self { SqlValue::Text(s.to_string()) }
}
impl From<String> for SqlValue {
    fn from(s: String) -> Self { SqlValue::Text(s) }
}
impl From<i64> for SqlValue {
    fn from(i: i64) -> Self { SqlValue::Integer(i) }
}
impl From<bool> for SqlValue {
    fn from(b: bool) -> Self { SqlValue::Integer(if b { 1 } else { 0 }) }
}
impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self { v.map(Into::into).unwrap_or(SqlValue::Null) }
}

/// Named parameters without the leading ':'. Ordered so composed queries are reproducible.
pub type Params = BTreeMap<String, SqlValue>;

/// A SQL text plus the named parameters it references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFragment {
    pub sql: String,
    #[serde(default)]
    pub params: Params,
}

impl QueryFragment {
    pub fn new<S: Into<String>>(sql: S) -> Self { Self { sql: sql.into(), params: Params::new() } }

    pub fn with_params<S: Into<String>>(sql: S, params: Params) -> Self { Self { sql: sql.into(), params } }

    pub fn bind<K: Into<String>, V: Into<SqlValue>>(mut self, name: K, value: V) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// A fragment selecting `(parent, child)` that yields no rows.
    pub fn empty_resources() -> Self { Self::new("SELECT NULL AS parent, NULL AS child WHERE 0") }

    /// SQL text with string literals blanked, for scanning placeholders and separators.
    pub fn code_text(&self) -> Cow<'_, str> { STRING_LITERAL.replace_all(&self.sql, "''") }

    /// Names of every `:name` placeholder in the SQL text, in order of first use.
    pub fn placeholders(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let text = self.code_text();
        for cap in PLACEHOLDER.captures_iter(&text) {
            let name = cap[1].to_string();
            if !out.contains(&name) { out.push(name); }
        }
        out
    }
}

pub fn is_valid_param_name(name: &str) -> bool { PARAM_NAME.is_match(name) }

/// Engine-internal names start with '_' and the fixed reserved set is bound per call.
pub fn is_reserved_param(name: &str) -> bool {
    name.starts_with('_') || RESERVED_PARAMS.contains(&name)
}

/// Parameters of a composed query as rusqlite named-parameter pairs.
pub(crate) fn named_params(params: &Params) -> Vec<(String, &dyn ToSql)> {
    params.iter().map(|(k, v)| (format!(":{}", k), v as &dyn ToSql)).collect()
}

/// Bind only the parameters the SQL text references; SQLite rejects unknown names.
pub(crate) fn bind_named(stmt: &mut rusqlite::Statement<'_>, params: &Params) -> rusqlite::Result<()> {
    for (name, value) in named_params(params) {
        if let Some(idx) = stmt.parameter_index(&name)? {
            stmt.raw_bind_parameter(idx, value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_names() {
        assert!(is_valid_param_name("cfg_0_parent"));
        assert!(!is_valid_param_name("0abc"));
        assert!(!is_valid_param_name("a-b"));
        assert!(!is_valid_param_name(""));
        assert!(is_reserved_param("actor"));
        assert!(is_reserved_param("actor_id"));
        assert!(is_reserved_param("_check_parent"));
        assert!(!is_reserved_param("actor_team"));
    }

    #[test]
    fn placeholders_are_deduplicated_in_order() {
        let q = QueryFragment::new("SELECT :b AS parent, :a AS child, :b AS x WHERE :actor_id IS NOT NULL");
        assert_eq!(q.placeholders(), vec!["b", "a", "actor_id"]);
        let lit = QueryFragment::new("SELECT 'db:table' AS reason, :p AS parent");
        assert_eq!(lit.placeholders(), vec!["p"]);
        assert!(!lit.code_text().contains("db:table"));
    }

    #[test]
    fn option_and_bool_conversion() {
        assert_eq!(SqlValue::from(None::<String>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("db")), SqlValue::Text("db".into()));
        assert_eq!(SqlValue::from(true), SqlValue::Integer(1));
    }
}
