//! SELECT-only statement builder
//!
//! The compiler assembles statements exclusively through [`Query`] and
//! [`Select`]. Nothing here can render anything but `SELECT` or
//! `WITH ... SELECT`, and every user-supplied value travels as a `?`
//! bind parameter attached to the predicate that uses it.

use chrono::NaiveDate;
use itertools::Itertools;
use rusqlite::types::{ToSql, ToSqlOutput};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a compiler-made label.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a compiler-derived number so that it reads back as the same value.
pub fn number_literal(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Positional parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BindValue {
    Integer(i64),
    Real(f64),
    Date(NaiveDate),
    Text(String),
}

impl BindValue {
    /// Convert a scalar JSON filter value; arrays, objects and null have no bind form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(BindValue::Text(s.clone())),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(BindValue::Integer(i)),
                None => n.as_f64().map(BindValue::Real),
            },
            serde_json::Value::Bool(b) => Some(BindValue::Integer(i64::from(*b))),
            _ => None,
        }
    }
}

impl fmt::Display for BindValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindValue::Integer(v) => write!(f, "{}", v),
            BindValue::Real(v) => write!(f, "{}", v),
            BindValue::Date(v) => write!(f, "{}", v),
            BindValue::Text(v) => f.write_str(v),
        }
    }
}

impl ToSql for BindValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            BindValue::Integer(v) => ToSqlOutput::from(*v),
            BindValue::Real(v) => ToSqlOutput::from(*v),
            BindValue::Date(v) => ToSqlOutput::from(v.format("%Y-%m-%d").to_string()),
            BindValue::Text(v) => ToSqlOutput::from(v.as_str()),
        })
    }
}

/// A boolean SQL fragment and the values for its `?` markers, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<BindValue>,
}

impl Predicate {
    pub fn new(sql: impl Into<String>, params: Vec<BindValue>) -> Self {
        Self { sql: sql.into(), params }
    }

    /// Predicate without parameters.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }

    pub fn any(parts: Vec<Predicate>) -> Self {
        Self::combine(parts, " OR ")
    }

    pub fn all(parts: Vec<Predicate>) -> Self {
        Self::combine(parts, " AND ")
    }

    fn combine(parts: Vec<Predicate>, op: &str) -> Self {
        if parts.len() <= 1 {
            return parts.into_iter().next().unwrap_or_else(|| Predicate::raw("1 = 1"));
        }
        let sql = format!("({})", parts.iter().map(|p| p.sql.as_str()).join(op));
        let params = parts.into_iter().flat_map(|p| p.params).collect();
        Self { sql, params }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
struct Join {
    kind: JoinKind,
    source: String,
    alias: Option<String>,
    on: Option<String>,
}

/// One SELECT block.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    columns: Vec<String>,
    from: String,
    from_alias: Option<String>,
    joins: Vec<Join>,
    predicates: Vec<Predicate>,
    group_by: Vec<String>,
    order_by: Vec<String>,
    limit: Option<i64>,
}

impl Select {
    /// Select from a physical table (identifier is quoted).
    pub fn from_table(table: &str) -> Self {
        Self::from_source(quote_ident(table))
    }

    /// Select from a CTE defined in the enclosing [`Query`].
    pub fn from_cte(name: &str) -> Self {
        Self::from_source(name.to_string())
    }

    fn from_source(from: String) -> Self {
        Self {
            columns: Vec::new(),
            from,
            from_alias: None,
            joins: Vec::new(),
            predicates: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.from_alias = Some(alias.to_string());
        self
    }

    pub fn column(mut self, expr: impl Into<String>) -> Self {
        self.columns.push(expr.into());
        self
    }

    pub fn column_as(self, expr: impl AsRef<str>, name: &str) -> Self {
        let rendered = format!("{} AS {}", expr.as_ref(), quote_ident(name));
        self.column(rendered)
    }

    pub fn columns<I, S>(mut self, exprs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(exprs.into_iter().map(Into::into));
        self
    }

    pub fn left_join(mut self, cte: &str, alias: &str, on: impl Into<String>) -> Self {
        self.joins.push(Join {
            kind: JoinKind::Left,
            source: cte.to_string(),
            alias: Some(alias.to_string()),
            on: Some(on.into()),
        });
        self
    }

    pub fn cross_join(mut self, cte: &str) -> Self {
        self.joins.push(Join { kind: JoinKind::Cross, source: cte.to_string(), alias: None, on: None });
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn filters(mut self, predicates: impl IntoIterator<Item = Predicate>) -> Self {
        self.predicates.extend(predicates);
        self
    }

    pub fn group_by<I, S>(mut self, exprs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by.extend(exprs.into_iter().map(Into::into));
        self
    }

    pub fn order_by<I, S>(mut self, exprs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_by.extend(exprs.into_iter().map(Into::into));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn render_into(&self, out: &mut Vec<String>, params: &mut Vec<BindValue>, indent: &str) {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        out.push(format!("{}SELECT {}", indent, columns));
        match &self.from_alias {
            Some(alias) => out.push(format!("{}FROM {} AS {}", indent, self.from, alias)),
            None => out.push(format!("{}FROM {}", indent, self.from)),
        }
        for join in &self.joins {
            let target = match &join.alias {
                Some(alias) => format!("{} AS {}", join.source, alias),
                None => join.source.clone(),
            };
            let line = match (join.kind, &join.on) {
                (JoinKind::Left, Some(on)) => format!("{}LEFT JOIN {} ON {}", indent, target, on),
                (JoinKind::Left, None) => format!("{}LEFT JOIN {} ON 1 = 1", indent, target),
                (JoinKind::Cross, _) => format!("{}CROSS JOIN {}", indent, target),
            };
            out.push(line);
        }
        if !self.predicates.is_empty() {
            out.push(format!(
                "{}WHERE {}",
                indent,
                self.predicates.iter().map(|p| p.sql.as_str()).join(" AND ")
            ));
            params.extend(self.predicates.iter().flat_map(|p| p.params.iter().cloned()));
        }
        if !self.group_by.is_empty() {
            out.push(format!("{}GROUP BY {}", indent, self.group_by.join(", ")));
        }
        if !self.order_by.is_empty() {
            out.push(format!("{}ORDER BY {}", indent, self.order_by.join(", ")));
        }
        if let Some(limit) = self.limit {
            out.push(format!("{}LIMIT {}", indent, limit));
        }
    }
}

/// A complete statement: optional named stages followed by a final SELECT.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    ctes: Vec<(String, Select)>,
    body: Select,
}

impl Query {
    pub fn new(body: Select) -> Self {
        Self { ctes: Vec::new(), body }
    }

    pub fn with_stages(ctes: Vec<(&str, Select)>, body: Select) -> Self {
        Self {
            ctes: ctes.into_iter().map(|(name, select)| (name.to_string(), select)).collect(),
            body,
        }
    }

    /// Render SQL text and its bind parameters in `?` order.
    pub fn render(&self) -> (String, Vec<BindValue>) {
        let mut lines = Vec::new();
        let mut params = Vec::new();
        for (i, (name, select)) in self.ctes.iter().enumerate() {
            let opener = if i == 0 { "WITH" } else { "," };
            lines.push(format!("{} {} AS (", opener, name));
            select.render_into(&mut lines, &mut params, "  ");
            lines.push(")".to_string());
        }
        self.body.render_into(&mut lines, &mut params, "");
        (lines.join("\n"), params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_and_labels_are_escaped() {
        assert_eq!(quote_ident("DATE OCC"), "\"DATE OCC\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("Other (<5)"), "'Other (<5)'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(number_literal(10.0), "10.0");
        assert_eq!(number_literal(0.25), "0.25");
    }

    #[test]
    fn params_follow_placeholder_order_across_stages() {
        let first = Select::from_table("t")
            .column("COUNT(*) AS value")
            .filter(Predicate::new("\"a\" = ?", vec![BindValue::Text("x".into())]));
        let second = Select::from_table("t")
            .column("COUNT(*) AS value")
            .filter(Predicate::new("\"b\" = ?", vec![BindValue::Integer(2)]));
        let body = Select::from_cte("first").alias("f").left_join("second", "s", "1 = 1");
        let (sql, params) = Query::with_stages(vec![("first", first), ("second", second)], body).render();
        assert!(sql.starts_with("WITH first AS ("));
        assert!(sql.contains("LEFT JOIN second AS s ON 1 = 1"));
        assert_eq!(params, vec![BindValue::Text("x".into()), BindValue::Integer(2)]);
        assert_eq!(sql.matches('?').count(), params.len());
    }

    #[test]
    fn combined_predicates_keep_param_order() {
        let any = Predicate::any(vec![
            Predicate::new("a = ?", vec![BindValue::Integer(1)]),
            Predicate::new("b = ?", vec![BindValue::Integer(2)]),
        ]);
        assert_eq!(any.sql, "(a = ? OR b = ?)");
        assert_eq!(any.params, vec![BindValue::Integer(1), BindValue::Integer(2)]);
    }

    #[test]
    fn json_scalars_bind_and_containers_do_not() {
        assert_eq!(BindValue::from_json(&serde_json::json!(3)), Some(BindValue::Integer(3)));
        assert_eq!(BindValue::from_json(&serde_json::json!(2.5)), Some(BindValue::Real(2.5)));
        assert_eq!(BindValue::from_json(&serde_json::json!([1])), None);
    }
}
