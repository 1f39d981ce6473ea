//! SQL grammar used to render raw expressions and sub-queries into key text.

use thiserror::Error;

use crate::domain::{Expression, OrderClause, Predicate, QueryDescriptor, Value, WhereClause};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GrammarError {
    #[error("raw expression is empty")]
    EmptyExpression,
    #[error("raw expression `{raw}` cannot be rendered: {reason}")]
    Unsupported { raw: String, reason: &'static str },
}

/// A compiled select statement: SQL text with `?` placeholders and the
/// literals bound to them, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub bindings: Vec<Value>,
}

/// Renders expressions and queries for a SQL dialect.
pub trait Grammar: Send + Sync {
    /// Literal text of a raw expression.
    fn render_expression(&self, expression: &Expression) -> Result<String, GrammarError>;

    fn compile_select(&self, query: &QueryDescriptor) -> Result<CompiledQuery, GrammarError>;

    /// Substitutes bindings into placeholders, yielding the literal statement.
    fn interpolate(&self, compiled: &CompiledQuery) -> Result<String, GrammarError> {
        let mut bindings = compiled.bindings.iter();
        let mut out = String::with_capacity(compiled.sql.len());
        for ch in compiled.sql.chars() {
            if ch != '?' {
                out.push(ch);
                continue;
            }
            match bindings.next() {
                Some(Value::Raw(expression)) => out.push_str(&self.render_expression(expression)?),
                Some(value) => out.push_str(&value.to_string()),
                None => out.push('?'),
            }
        }
        Ok(out)
    }
}

/// Plain ANSI-flavoured grammar without identifier quoting.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardGrammar;

impl StandardGrammar {
    pub fn new() -> Self {
        Self
    }

    fn parameter(&self, value: &Value, bindings: &mut Vec<Value>) -> Result<String, GrammarError> {
        if let Value::Raw(expression) = value {
            return self.render_expression(expression);
        }
        bindings.push(value.clone());
        Ok("?".to_string())
    }

    fn compile_wheres(
        &self,
        clauses: &[WhereClause],
        bindings: &mut Vec<Value>,
    ) -> Result<String, GrammarError> {
        let mut sql = String::new();
        for (index, clause) in clauses.iter().enumerate() {
            if index > 0 {
                sql.push(' ');
                sql.push_str(clause.boolean.as_sql());
                sql.push(' ');
            }
            sql.push_str(&self.compile_predicate(&clause.predicate, bindings)?);
        }
        Ok(sql)
    }

    fn compile_predicate(
        &self,
        predicate: &Predicate,
        bindings: &mut Vec<Value>,
    ) -> Result<String, GrammarError> {
        let sql = match predicate {
            Predicate::Basic {
                column,
                operator,
                value,
            } => format!("{column} {operator} {}", self.parameter(value, bindings)?),
            Predicate::In {
                column,
                values,
                negated,
            } => {
                if values.is_empty() {
                    return Ok(if *negated { "1 = 1" } else { "0 = 1" }.to_string());
                }
                let params = values
                    .iter()
                    .map(|value| self.parameter(value, bindings))
                    .collect::<Result<Vec<_>, _>>()?;
                let not = if *negated { "not " } else { "" };
                format!("{column} {not}in ({})", params.join(", "))
            }
            Predicate::InSub {
                column,
                query,
                negated,
            } => {
                let compiled = self.compile_select(query)?;
                bindings.extend(compiled.bindings);
                let not = if *negated { "not " } else { "" };
                format!("{column} {not}in ({})", compiled.sql)
            }
            Predicate::Null { column, negated } => {
                let not = if *negated { "not " } else { "" };
                format!("{column} is {not}null")
            }
            Predicate::Between {
                column,
                low,
                high,
                negated,
            } => {
                let low = self.parameter(low, bindings)?;
                let high = self.parameter(high, bindings)?;
                let not = if *negated { "not " } else { "" };
                format!("{column} {not}between {low} and {high}")
            }
            Predicate::Column {
                first,
                operator,
                second,
            } => format!("{first} {operator} {second}"),
            Predicate::Raw {
                sql,
                bindings: raw_bindings,
            } => {
                bindings.extend(raw_bindings.iter().cloned());
                sql.clone()
            }
            Predicate::Nested { clauses } => {
                format!("({})", self.compile_wheres(clauses, bindings)?)
            }
            Predicate::Exists { query, negated } => {
                let compiled = self.compile_select(query)?;
                bindings.extend(compiled.bindings);
                let not = if *negated { "not " } else { "" };
                format!("{not}exists ({})", compiled.sql)
            }
        };
        Ok(sql)
    }

    fn compile_order(&self, order: &OrderClause) -> Result<String, GrammarError> {
        match order {
            OrderClause::Column { column, direction } => {
                Ok(format!("{column} {}", direction.as_sql()))
            }
            OrderClause::Raw { expression } => self.render_expression(expression),
            OrderClause::Random { seed } => Ok(match seed {
                Some(seed) => format!("random({seed})"),
                None => "random()".to_string(),
            }),
        }
    }
}

impl Grammar for StandardGrammar {
    fn render_expression(&self, expression: &Expression) -> Result<String, GrammarError> {
        let raw = expression.raw.trim();
        if raw.is_empty() {
            return Err(GrammarError::EmptyExpression);
        }
        if raw.contains(';') {
            return Err(GrammarError::Unsupported {
                raw: raw.to_string(),
                reason: "multiple statements",
            });
        }
        Ok(raw.to_string())
    }

    fn compile_select(&self, query: &QueryDescriptor) -> Result<CompiledQuery, GrammarError> {
        let mut bindings = Vec::new();
        let mut sql = format!(
            "select {} from {}",
            query.columns.join(", "),
            query.entity.table
        );

        for join in &query.joins {
            sql.push_str(" inner join ");
            sql.push_str(&join.table);
        }

        if !query.wheres.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&self.compile_wheres(&query.wheres, &mut bindings)?);
        }

        if !query.orders.is_empty() {
            let orders = query
                .orders
                .iter()
                .map(|order| self.compile_order(order))
                .collect::<Result<Vec<_>, _>>()?;
            sql.push_str(" order by ");
            sql.push_str(&orders.join(", "));
        }

        if let Some(limit) = query.limit {
            sql.push_str(&format!(" limit {limit}"));
        }
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" offset {offset}"));
        }

        Ok(CompiledQuery { sql, bindings })
    }
}
