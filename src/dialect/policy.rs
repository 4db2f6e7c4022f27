// ============================================================================
// Criteria Policies
// ============================================================================
//
// Restriction-to-SQL translation, one match arm per restriction variant.
// Every arm renders two ways:
//
//   native    - literals are inlined, for display and native queries
//   prepared  - `?` markers with the bind values appended in order
//
// Both paths go through the same column resolution and value preparation so
// case folding, LIKE wrapping and field transformation never diverge.
//
// ============================================================================

use crate::core::{DbError, Result, Value};
use crate::criteria::{
    CompareOp, CompoundRestriction, NullOp, Param, RangeOp, Restriction, SetOp,
};
use crate::entity::EntityInfo;
use chrono::{NaiveDate, NaiveDateTime};

/// Dialect-wide limits and naming switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialectPolicies {
    /// Maximum number of values in one `IN (...)` list. Zero disables
    /// chunking.
    pub max_clause_values: usize,
    /// Upper-case every identifier emitted for native queries.
    pub all_upper_case: bool,
}

impl Default for DialectPolicies {
    fn default() -> Self {
        Self {
            max_clause_values: 1000,
            all_upper_case: false,
        }
    }
}

/// Split `length` items into blocks of at most `block_size`.
///
/// `split_to_blocks(235, 100)` is `[100, 100, 35]`; a block size of zero
/// yields one block holding everything.
pub fn split_to_blocks(length: usize, block_size: usize) -> Vec<usize> {
    if block_size == 0 {
        return vec![length];
    }
    let mut blocks = vec![block_size; length / block_size];
    let remainder = length % block_size;
    if remainder > 0 {
        blocks.push(remainder);
    }
    blocks
}

/// Resolves fields to columns and prepares bind values for one entity.
pub struct CriteriaContext<'a> {
    info: &'a EntityInfo,
    view: bool,
    policies: &'a DialectPolicies,
}

impl<'a> CriteriaContext<'a> {
    pub fn new(info: &'a EntityInfo, view: bool, policies: &'a DialectPolicies) -> Self {
        Self {
            info,
            view,
            policies,
        }
    }

    pub fn column(&self, field: &str) -> Result<&'a str> {
        self.info.column(field, self.view).ok_or_else(|| {
            DbError::InvalidArgument(format!(
                "Field '{}' is not mapped for entity '{}'",
                field,
                self.info.name()
            ))
        })
    }

    /// Forward-transform `value` when `field` is a transformed field.
    fn forward(&self, field: &str, value: &Value) -> Result<Value> {
        match self.info.field(field) {
            Some(info) => info.forward(value),
            None => Ok(value.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Native,
    Prepared,
}

/// Column expression with the operator that follows it.
struct CompareSql {
    op: &'static str,
    lower: bool,
    wrap: Wrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wrap {
    None,
    Contains,
    Prefix,
    Suffix,
}

impl Wrap {
    fn apply(self, value: Value) -> Value {
        match (self, value) {
            (Wrap::None, value) => value,
            (Wrap::Contains, Value::Text(s)) => Value::Text(format!("%{}%", s)),
            (Wrap::Prefix, Value::Text(s)) => Value::Text(format!("{}%", s)),
            (Wrap::Suffix, Value::Text(s)) => Value::Text(format!("%{}", s)),
            (_, other) => other,
        }
    }

    fn apply_column(self, column: String) -> String {
        match self {
            Wrap::None => column,
            Wrap::Contains => format!("('%' || {} || '%')", column),
            Wrap::Prefix => format!("({} || '%')", column),
            Wrap::Suffix => format!("('%' || {})", column),
        }
    }
}

fn compare_sql(op: CompareOp) -> CompareSql {
    let (op_sql, wrap) = match op {
        CompareOp::Equals | CompareOp::IEquals => (" = ", Wrap::None),
        CompareOp::NotEquals | CompareOp::INotEquals => (" <> ", Wrap::None),
        CompareOp::LessThan => (" < ", Wrap::None),
        CompareOp::LessOrEqual => (" <= ", Wrap::None),
        CompareOp::GreaterThan => (" > ", Wrap::None),
        CompareOp::GreaterOrEqual => (" >= ", Wrap::None),
        CompareOp::Like | CompareOp::ILike => (" LIKE ", Wrap::Contains),
        CompareOp::NotLike => (" NOT LIKE ", Wrap::Contains),
        CompareOp::BeginsWith | CompareOp::IBeginsWith => (" LIKE ", Wrap::Prefix),
        CompareOp::NotBeginWith => (" NOT LIKE ", Wrap::Prefix),
        CompareOp::EndsWith | CompareOp::IEndsWith => (" LIKE ", Wrap::Suffix),
        CompareOp::NotEndWith => (" NOT LIKE ", Wrap::Suffix),
    };
    CompareSql {
        op: op_sql,
        lower: op.is_case_insensitive(),
        wrap,
    }
}

fn lower_column(column: &str, lower: bool) -> String {
    if lower {
        format!("LOWER({})", column)
    } else {
        column.to_string()
    }
}

/// Render a literal for native SQL.
pub fn native_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Date(d) => format!("DATE '{}'", format_date(d)),
        Value::Timestamp(ts) => format!("TIMESTAMP '{}'", format_timestamp(ts)),
    }
}

fn format_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

struct Renderer<'c, 'a> {
    ctx: &'c CriteriaContext<'a>,
    mode: Mode,
    sql: String,
    params: Vec<Value>,
}

impl<'c, 'a> Renderer<'c, 'a> {
    fn new(ctx: &'c CriteriaContext<'a>, mode: Mode) -> Self {
        Self {
            ctx,
            mode,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    /// Emit a value operand: a `?` plus bind value, or an inline literal.
    fn push_value(&mut self, field: &str, value: &Value, lower: bool, wrap: Wrap) -> Result<()> {
        let mut value = self.ctx.forward(field, value)?;
        if lower {
            value = value.to_lowercase();
        }
        let value = wrap.apply(value);
        match self.mode {
            Mode::Native => self.sql.push_str(&native_literal(&value)),
            Mode::Prepared => {
                self.sql.push('?');
                self.params.push(value);
            }
        }
        Ok(())
    }

    fn push_param(&mut self, field: &str, param: &Param, lower: bool, wrap: Wrap) -> Result<()> {
        match param {
            Param::Value(value) => self.push_value(field, value, lower, wrap),
            Param::Field(other) => {
                let column = lower_column(self.ctx.column(other)?, lower);
                self.sql.push_str(&wrap.apply_column(column));
                Ok(())
            }
        }
    }

    fn render(&mut self, restriction: &Restriction) -> Result<()> {
        match restriction {
            Restriction::Null { op, field } => {
                self.sql.push_str(self.ctx.column(field)?);
                self.sql.push_str(match op {
                    NullOp::IsNull => " IS NULL",
                    NullOp::IsNotNull => " IS NOT NULL",
                });
            }
            Restriction::Compare { op, field, param } => {
                let compare = compare_sql(*op);
                let column = lower_column(self.ctx.column(field)?, compare.lower);
                self.sql.push_str(&column);
                self.sql.push_str(compare.op);
                self.push_param(field, param, compare.lower, compare.wrap)?;
            }
            Restriction::Range {
                op,
                field,
                lower,
                upper,
            } => {
                self.sql.push_str(self.ctx.column(field)?);
                self.sql.push_str(match op {
                    RangeOp::Between => " BETWEEN ",
                    RangeOp::NotBetween => " NOT BETWEEN ",
                });
                self.push_param(field, lower, false, Wrap::None)?;
                self.sql.push_str(" AND ");
                self.push_param(field, upper, false, Wrap::None)?;
            }
            Restriction::Set { op, field, values } => {
                self.render_set(*op, field, values)?;
            }
            Restriction::Compound(compound) => self.render_compound(compound)?,
        }
        Ok(())
    }

    /// `(C IN (?, ?) OR C IN (?))`, chunked by `max_clause_values`.
    fn render_set(&mut self, op: SetOp, field: &str, values: &[Value]) -> Result<()> {
        if values.is_empty() {
            return Err(DbError::coded(
                crate::core::ErrorCode::EmptyMultiValueRestriction,
                format!("Multi-value restriction on '{}' has no values", field),
            ));
        }
        let (op_sql, mult_op_sql) = match op {
            SetOp::Amongst => (" IN ", " OR "),
            SetOp::NotAmongst => (" NOT IN ", " AND "),
        };
        let column = self.ctx.column(field)?;
        let blocks = split_to_blocks(values.len(), self.ctx.policies.max_clause_values);

        self.sql.push('(');
        let mut remaining = values;
        for (j, block) in blocks.iter().enumerate() {
            if j > 0 {
                self.sql.push_str(mult_op_sql);
            }
            self.sql.push_str(column);
            self.sql.push_str(op_sql);
            self.sql.push('(');
            let (chunk, rest) = remaining.split_at(*block);
            for (i, value) in chunk.iter().enumerate() {
                if i > 0 {
                    self.sql.push_str(", ");
                }
                self.push_value(field, value, false, Wrap::None)?;
            }
            self.sql.push(')');
            remaining = rest;
        }
        self.sql.push(')');
        Ok(())
    }

    fn render_compound(&mut self, compound: &CompoundRestriction) -> Result<()> {
        let children: Vec<&Restriction> = compound.effective().collect();
        if children.is_empty() {
            return Ok(());
        }
        let brackets = children.len() > 1;
        if brackets {
            self.sql.push('(');
        }
        for (i, restriction) in children.into_iter().enumerate() {
            if i > 0 {
                self.sql.push(' ');
                self.sql.push_str(compound.op.sql());
                self.sql.push(' ');
            }
            self.render(restriction)?;
        }
        if brackets {
            self.sql.push(')');
        }
        Ok(())
    }
}

/// Native SQL fragment with inlined literals.
pub fn translate(ctx: &CriteriaContext<'_>, restriction: &Restriction) -> Result<String> {
    let mut renderer = Renderer::new(ctx, Mode::Native);
    renderer.render(restriction)?;
    Ok(renderer.sql)
}

/// Prepared SQL fragment and its bind values, in marker order.
pub fn prepare(ctx: &CriteriaContext<'_>, restriction: &Restriction) -> Result<(String, Vec<Value>)> {
    let mut renderer = Renderer::new(ctx, Mode::Prepared);
    renderer.render(restriction)?;
    Ok((renderer.sql, renderer.params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{CompoundRestriction, Restriction};
    use crate::entity::FieldTransformer;
    use std::sync::Arc;

    struct Reverse;

    impl FieldTransformer for Reverse {
        fn forward(&self, value: &Value) -> Result<Value> {
            Ok(match value {
                Value::Text(s) => Value::Text(s.chars().rev().collect()),
                other => other.clone(),
            })
        }

        fn reverse(&self, value: &Value) -> Result<Value> {
            self.forward(value)
        }
    }

    fn author() -> EntityInfo {
        EntityInfo::builder("author")
            .field("name")
            .field("age")
            .field("minAge")
            .transformed_field("secret", Arc::new(Reverse))
            .list_only("countryName", "countryId", "country", "name")
            .build()
    }

    #[test]
    fn test_split_to_blocks() {
        assert_eq!(split_to_blocks(235, 100), vec![100, 100, 35]);
        assert_eq!(split_to_blocks(200, 100), vec![100, 100]);
        assert_eq!(split_to_blocks(7, 0), vec![7]);
    }

    #[test]
    fn test_compound_brackets_only_for_multiple_children() {
        let info = author();
        let policies = DialectPolicies::default();
        let ctx = CriteriaContext::new(&info, false, &policies);

        let mut single = CompoundRestriction::and();
        single.add(Restriction::compare(CompareOp::Equals, "name", "Ann"));
        assert_eq!(
            translate(&ctx, &Restriction::Compound(single.clone())).unwrap(),
            "NAME = 'Ann'"
        );

        single.add(Restriction::null(NullOp::IsNull, "age"));
        assert_eq!(
            translate(&ctx, &Restriction::Compound(single)).unwrap(),
            "(NAME = 'Ann' AND AGE IS NULL)"
        );
    }

    #[test]
    fn test_empty_nested_compound_is_skipped() {
        let info = author();
        let policies = DialectPolicies::default();
        let ctx = CriteriaContext::new(&info, false, &policies);

        let mut root = CompoundRestriction::and();
        root.restrictions.push(Restriction::compare(CompareOp::Equals, "name", "x"));
        root.restrictions.push(Restriction::Compound(CompoundRestriction::or()));

        assert_eq!(translate(&ctx, &Restriction::Compound(root.clone())).unwrap(), "NAME = 'x'");
        let (sql, params) = prepare(&ctx, &Restriction::Compound(root)).unwrap();
        assert_eq!(sql, "NAME = ?");
        assert_eq!(params, vec![Value::Text("x".into())]);
    }

    #[test]
    fn test_empty_set_uses_multi_value_code() {
        let info = author();
        let policies = DialectPolicies::default();
        let ctx = CriteriaContext::new(&info, false, &policies);
        let restriction = Restriction::Set {
            op: SetOp::Amongst,
            field: "age".into(),
            values: Vec::new(),
        };
        let err = prepare(&ctx, &restriction).unwrap_err();
        assert!(err.is_code(crate::core::ErrorCode::EmptyMultiValueRestriction));
    }

    #[test]
    fn test_case_insensitive_lowers_both_paths() {
        let info = author();
        let policies = DialectPolicies::default();
        let ctx = CriteriaContext::new(&info, false, &policies);
        let restriction = Restriction::compare(CompareOp::ILike, "name", "AnN");

        assert_eq!(translate(&ctx, &restriction).unwrap(), "LOWER(NAME) LIKE '%ann%'");
        let (sql, params) = prepare(&ctx, &restriction).unwrap();
        assert_eq!(sql, "LOWER(NAME) LIKE ?");
        assert_eq!(params, vec![Value::Text("%ann%".into())]);
    }

    #[test]
    fn test_field_to_field_renders_second_column() {
        let info = author();
        let policies = DialectPolicies::default();
        let ctx = CriteriaContext::new(&info, false, &policies);
        let restriction = Restriction::compare_field(CompareOp::GreaterOrEqual, "age", "minAge");
        let (sql, params) = prepare(&ctx, &restriction).unwrap();
        assert_eq!(sql, "AGE >= MIN_AGE");
        assert!(params.is_empty());
    }

    #[test]
    fn test_transformed_field_is_forwarded() {
        let info = author();
        let policies = DialectPolicies::default();
        let ctx = CriteriaContext::new(&info, false, &policies);
        let restriction = Restriction::compare(CompareOp::Equals, "secret", "abc");
        let (_, params) = prepare(&ctx, &restriction).unwrap();
        assert_eq!(params, vec![Value::Text("cba".into())]);
    }

    #[test]
    fn test_list_only_field_needs_view() {
        let info = author();
        let policies = DialectPolicies::default();
        let restriction = Restriction::compare(CompareOp::Equals, "countryName", "Chad");

        let table = CriteriaContext::new(&info, false, &policies);
        assert!(translate(&table, &restriction).is_err());
        let view = CriteriaContext::new(&info, true, &policies);
        assert_eq!(translate(&view, &restriction).unwrap(), "COUNTRY_NAME = 'Chad'");
    }

    #[test]
    fn test_between_binds_two_values() {
        let info = author();
        let policies = DialectPolicies::default();
        let ctx = CriteriaContext::new(&info, false, &policies);
        let restriction = Restriction::range(RangeOp::NotBetween, "age", 20, 30);
        let (sql, params) = prepare(&ctx, &restriction).unwrap();
        assert_eq!(sql, "AGE NOT BETWEEN ? AND ?");
        assert_eq!(params, vec![Value::Integer(20), Value::Integer(30)]);
    }
}
