// ============================================================================
// SQL Dialects
// ============================================================================
//
// A dialect turns queries, native queries and record mutations into SQL.
// Everything except pagination is shared through provided trait methods, so
// a concrete dialect only names itself, exposes its policies and renders its
// pagination clause.
//
// ============================================================================

pub mod ansi;
pub mod policy;

pub use ansi::AnsiDialect;
pub use policy::{CriteriaContext, DialectPolicies, native_literal, split_to_blocks};

use crate::core::{DbError, ID_FIELD, Record, Result, Value};
use crate::criteria::{CompoundRestriction, Restriction, RestrictionType};
use crate::entity::EntityInfo;
use crate::query::{AggregateFunction, NativeQuery, NativeQueryFilter, OrderType, QueryDef, Update};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    #[default]
    Ansi,
}

impl DialectKind {
    pub fn create(&self, policies: DialectPolicies) -> Arc<dyn SqlDialect> {
        match self {
            DialectKind::Ansi => Arc::new(AnsiDialect::new(policies)),
        }
    }
}

impl std::str::FromStr for DialectKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ansi" => Ok(DialectKind::Ansi),
            other => Err(DbError::ConfigError(format!("Unknown dialect '{}'", other))),
        }
    }
}

/// SQL text with its bind parameters in marker order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlStatement {
    fn new(sql: String, params: Vec<Value>) -> Self {
        Self { sql, params }
    }
}

pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &str;

    fn policies(&self) -> &DialectPolicies;

    /// Trailing pagination clause, empty when neither offset nor limit apply.
    fn pagination_clause(&self, offset: i32, limit: i32) -> String;

    fn field_to_native_column_map(&self, info: &EntityInfo, view: bool) -> Vec<(String, String)> {
        info.field_to_column_map(view)
    }

    /// Native SQL fragment for `restriction`.
    fn translate_criteria(&self, info: &EntityInfo, restriction: &Restriction, view: bool) -> Result<String> {
        let ctx = CriteriaContext::new(info, view, self.policies());
        policy::translate(&ctx, restriction)
    }

    fn prepare_criteria(
        &self,
        info: &EntityInfo,
        restriction: &Restriction,
        view: bool,
    ) -> Result<SqlStatement> {
        let ctx = CriteriaContext::new(info, view, self.policies());
        let (sql, params) = policy::prepare(&ctx, restriction)?;
        Ok(SqlStatement::new(sql, params))
    }

    fn prepare_find(&self, info: &EntityInfo, query: &QueryDef, view: bool) -> Result<SqlStatement> {
        let ctx = CriteriaContext::new(info, view, self.policies());
        let mut sql = String::from("SELECT ");
        if query.is_distinct() {
            sql.push_str("DISTINCT ");
        }

        let columns: Vec<String> = match query.select().filter(|s| !s.is_empty()) {
            Some(select) => select
                .fields()
                .iter()
                .map(|f| ctx.column(f).map(str::to_string))
                .collect::<Result<_>>()?,
            None => self
                .field_to_native_column_map(info, view)
                .into_iter()
                .map(|(_, column)| column)
                .collect(),
        };
        sql.push_str(&columns.join(", "));
        sql.push_str(" FROM ");
        sql.push_str(if view { info.view() } else { info.table() });

        let params = push_where(&mut sql, &ctx, query.criteria())?;

        if let Some(order) = query.order().filter(|o| !o.is_empty()) {
            let parts = order
                .parts()
                .iter()
                .map(|part| {
                    ctx.column(&part.field).map(|c| match part.order_type {
                        OrderType::Ascending => format!("{} ASC", c),
                        OrderType::Descending => format!("{} DESC", c),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&parts.join(", "));
        }

        let pagination = self.pagination_clause(query.offset(), query.limit());
        if !pagination.is_empty() {
            sql.push(' ');
            sql.push_str(&pagination);
        }
        Ok(SqlStatement::new(sql, params))
    }

    fn prepare_count(&self, info: &EntityInfo, query: &QueryDef) -> Result<SqlStatement> {
        let ctx = CriteriaContext::new(info, false, self.policies());
        let mut sql = format!("SELECT COUNT(*) FROM {}", info.table());
        let params = push_where(&mut sql, &ctx, query.criteria())?;
        Ok(SqlStatement::new(sql, params))
    }

    fn prepare_aggregate(
        &self,
        info: &EntityInfo,
        functions: &[AggregateFunction],
        query: &QueryDef,
    ) -> Result<SqlStatement> {
        let ctx = CriteriaContext::new(info, false, self.policies());
        let group_columns: Vec<&str> = match query.group_by() {
            Some(group_by) => group_by
                .fields()
                .iter()
                .map(|f| ctx.column(f))
                .collect::<Result<_>>()?,
            None => Vec::new(),
        };

        let mut selected: Vec<String> = group_columns.iter().map(|c| c.to_string()).collect();
        for function in functions {
            let column = ctx.column(&function.field)?;
            selected.push(format!("{}({})", function.aggregate_type.sql(), column));
        }

        let mut sql = format!("SELECT {} FROM {}", selected.join(", "), info.table());
        let params = push_where(&mut sql, &ctx, query.criteria())?;
        if !group_columns.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_columns.join(", "));
        }
        Ok(SqlStatement::new(sql, params))
    }

    fn prepare_create(&self, info: &EntityInfo, record: &Record) -> Result<SqlStatement> {
        let mut columns = Vec::with_capacity(info.fields().len());
        let mut params = Vec::with_capacity(info.fields().len());
        for field in info.fields() {
            columns.push(field.column.as_str());
            params.push(field.forward(record.get(&field.name))?);
        }
        let markers = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            info.table(),
            columns.join(", "),
            markers
        );
        Ok(SqlStatement::new(sql, params))
    }

    /// `UPDATE` of every non-id field; `version` adds an optimistic check.
    fn prepare_update_by_id(
        &self,
        info: &EntityInfo,
        record: &Record,
        version: Option<i64>,
    ) -> Result<SqlStatement> {
        let mut sets = Vec::new();
        let mut params = Vec::new();
        for field in info.fields().iter().filter(|f| f.name != ID_FIELD) {
            sets.push(format!("{} = ?", field.column));
            params.push(field.forward(record.get(&field.name))?);
        }
        let mut sql = format!("UPDATE {} SET {}", info.table(), sets.join(", "));
        push_id_version(&mut sql, &mut params, info, record.get(ID_FIELD).clone(), version)?;
        Ok(SqlStatement::new(sql, params))
    }

    fn prepare_update_all(
        &self,
        info: &EntityInfo,
        query: &QueryDef,
        update: &Update,
    ) -> Result<SqlStatement> {
        let ctx = CriteriaContext::new(info, false, self.policies());
        let mut sets = Vec::with_capacity(update.len());
        let mut params = Vec::with_capacity(update.len());
        for (field, value) in update.iter() {
            sets.push(format!("{} = ?", ctx.column(field)?));
            params.push(match info.field(field) {
                Some(field_info) => field_info.forward(value)?,
                None => value.clone(),
            });
        }
        let mut sql = format!("UPDATE {} SET {}", info.table(), sets.join(", "));
        params.extend(push_where(&mut sql, &ctx, query.criteria())?);
        Ok(SqlStatement::new(sql, params))
    }

    fn prepare_delete_by_id(
        &self,
        info: &EntityInfo,
        id: i64,
        version: Option<i64>,
    ) -> Result<SqlStatement> {
        let mut sql = format!("DELETE FROM {}", info.table());
        let mut params = Vec::new();
        push_id_version(&mut sql, &mut params, info, Value::Integer(id), version)?;
        Ok(SqlStatement::new(sql, params))
    }

    fn prepare_delete_all(&self, info: &EntityInfo, query: &QueryDef) -> Result<SqlStatement> {
        let ctx = CriteriaContext::new(info, false, self.policies());
        let mut sql = format!("DELETE FROM {}", info.table());
        let params = push_where(&mut sql, &ctx, query.criteria())?;
        Ok(SqlStatement::new(sql, params))
    }

    /// Native SQL for a raw-table query; literals are inlined.
    fn generate_native_query(&self, query: &NativeQuery) -> Result<String> {
        let upper = self.policies().all_upper_case;
        let ident = |s: &str| if upper { s.to_uppercase() } else { s.to_string() };
        let table = |s: &str| match query.schema_name() {
            Some(schema) => format!("{}.{}", ident(schema), ident(s)),
            None => ident(s),
        };

        let mut sql = String::from("SELECT ");
        if query.is_distinct() {
            sql.push_str("DISTINCT ");
        }
        if query.columns().is_empty() {
            sql.push('*');
        } else {
            let columns: Vec<String> = query
                .columns()
                .iter()
                .map(|c| format!("{}.{}", ident(&c.table_name), ident(&c.column_name)))
                .collect();
            sql.push_str(&columns.join(", "));
        }
        sql.push_str(" FROM ");
        sql.push_str(&table(query.table_name()));

        for join in query.joins() {
            sql.push_str(&format!(
                " {} {} ON {}.{} = {}.{}",
                join.join_type.sql(),
                table(&join.table_b),
                ident(&join.table_a),
                ident(&join.column_a),
                ident(&join.table_b),
                ident(&join.column_b)
            ));
        }

        if let Some(root) = query.root_filter() {
            let mut where_sql = String::new();
            render_native_filter(&mut where_sql, root, &ident, self.policies())?;
            if !where_sql.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&where_sql);
            }
        }

        if query.is_order() {
            let parts: Vec<String> = query
                .orders()
                .iter()
                .map(|o| {
                    let dir = if o.order_type.is_ascending() { "ASC" } else { "DESC" };
                    format!("{}.{} {}", ident(&o.table_name), ident(&o.column_name), dir)
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&parts.join(", "));
        }

        let pagination = self.pagination_clause(query.offset(), query.limit());
        if !pagination.is_empty() {
            sql.push(' ');
            sql.push_str(&pagination);
        }
        Ok(sql)
    }
}

fn push_where(
    sql: &mut String,
    ctx: &CriteriaContext<'_>,
    criteria: &CompoundRestriction,
) -> Result<Vec<Value>> {
    if criteria.is_vacuous() {
        return Ok(Vec::new());
    }
    let (where_sql, params) = policy::prepare(ctx, &Restriction::Compound(criteria.clone()))?;
    sql.push_str(" WHERE ");
    sql.push_str(&where_sql);
    Ok(params)
}

fn push_id_version(
    sql: &mut String,
    params: &mut Vec<Value>,
    info: &EntityInfo,
    id: Value,
    version: Option<i64>,
) -> Result<()> {
    let id_column = info.column(ID_FIELD, false).unwrap_or("ID");
    sql.push_str(&format!(" WHERE {} = ?", id_column));
    params.push(id);
    if let Some(version) = version {
        let version_field = info.version_field().ok_or_else(|| {
            DbError::InvalidArgument(format!("Entity '{}' is not versioned", info.name()))
        })?;
        let version_column = info.column(version_field, false).unwrap_or(version_field);
        sql.push_str(&format!(" AND {} = ?", version_column));
        params.push(Value::Integer(version));
    }
    Ok(())
}

/// A compound filter with no leaf anywhere below it.
fn is_vacuous_filter(filter: &NativeQueryFilter) -> bool {
    filter
        .sub_filters()
        .is_some_and(|subs| subs.iter().all(is_vacuous_filter))
}

fn render_native_filter(
    sql: &mut String,
    filter: &NativeQueryFilter,
    ident: &dyn Fn(&str) -> String,
    policies: &DialectPolicies,
) -> Result<()> {
    if let Some(sub_filters) = filter.sub_filters() {
        let sub_filters: Vec<&NativeQueryFilter> =
            sub_filters.iter().filter(|sub| !is_vacuous_filter(sub)).collect();
        if sub_filters.is_empty() {
            return Ok(());
        }
        let joiner = if filter.op() == RestrictionType::Or { " OR " } else { " AND " };
        let brackets = sub_filters.len() > 1;
        if brackets {
            sql.push('(');
        }
        for (i, sub) in sub_filters.into_iter().enumerate() {
            if i > 0 {
                sql.push_str(joiner);
            }
            render_native_filter(sql, sub, ident, policies)?;
        }
        if brackets {
            sql.push(')');
        }
        return Ok(());
    }

    let column = format!(
        "{}.{}",
        ident(filter.table_name().unwrap_or_default()),
        ident(filter.column_name().unwrap_or_default())
    );
    let param = |p: Option<&Value>| native_literal(p.unwrap_or(&Value::Null));
    let like = |prefix: &str, suffix: &str, lower: bool| {
        let value = filter.param1().cloned().unwrap_or(Value::Null);
        let value = if lower { value.to_lowercase() } else { value };
        match value {
            Value::Text(s) => native_literal(&Value::Text(format!("{}{}{}", prefix, s, suffix))),
            other => native_literal(&other),
        }
    };

    match filter.op() {
        RestrictionType::Equals => sql.push_str(&format!("{} = {}", column, param(filter.param1()))),
        RestrictionType::NotEquals => {
            sql.push_str(&format!("{} <> {}", column, param(filter.param1())))
        }
        RestrictionType::IEquals => sql.push_str(&format!(
            "LOWER({}) = {}",
            column,
            native_literal(&filter.param1().cloned().unwrap_or(Value::Null).to_lowercase())
        )),
        RestrictionType::INotEquals => sql.push_str(&format!(
            "LOWER({}) <> {}",
            column,
            native_literal(&filter.param1().cloned().unwrap_or(Value::Null).to_lowercase())
        )),
        RestrictionType::LessThan => sql.push_str(&format!("{} < {}", column, param(filter.param1()))),
        RestrictionType::LessOrEqual => {
            sql.push_str(&format!("{} <= {}", column, param(filter.param1())))
        }
        RestrictionType::GreaterThan => {
            sql.push_str(&format!("{} > {}", column, param(filter.param1())))
        }
        RestrictionType::GreaterOrEqual => {
            sql.push_str(&format!("{} >= {}", column, param(filter.param1())))
        }
        RestrictionType::Between | RestrictionType::NotBetween => {
            let op = if filter.op() == RestrictionType::Between { "BETWEEN" } else { "NOT BETWEEN" };
            sql.push_str(&format!(
                "{} {} {} AND {}",
                column,
                op,
                param(filter.param1()),
                param(filter.param2())
            ));
        }
        RestrictionType::Amongst | RestrictionType::NotAmongst => {
            let (op_sql, mult_op_sql) = if filter.op() == RestrictionType::Amongst {
                (" IN ", " OR ")
            } else {
                (" NOT IN ", " AND ")
            };
            let values = filter.values();
            if values.is_empty() {
                return Err(DbError::coded(
                    crate::core::ErrorCode::EmptyMultiValueRestriction,
                    format!("Multi-value filter on '{}' has no values", column),
                ));
            }
            let mut remaining = values;
            let mut chunks = Vec::new();
            for block in split_to_blocks(values.len(), policies.max_clause_values) {
                let (chunk, rest) = remaining.split_at(block);
                let literals: Vec<String> = chunk.iter().map(native_literal).collect();
                chunks.push(format!("{}{}({})", column, op_sql, literals.join(", ")));
                remaining = rest;
            }
            sql.push('(');
            sql.push_str(&chunks.join(mult_op_sql));
            sql.push(')');
        }
        RestrictionType::Like => sql.push_str(&format!("{} LIKE {}", column, like("%", "%", false))),
        RestrictionType::ILike => {
            sql.push_str(&format!("LOWER({}) LIKE {}", column, like("%", "%", true)))
        }
        RestrictionType::NotLike => {
            sql.push_str(&format!("{} NOT LIKE {}", column, like("%", "%", false)))
        }
        RestrictionType::BeginsWith => {
            sql.push_str(&format!("{} LIKE {}", column, like("", "%", false)))
        }
        RestrictionType::IBeginsWith => {
            sql.push_str(&format!("LOWER({}) LIKE {}", column, like("", "%", true)))
        }
        RestrictionType::NotBeginWith => {
            sql.push_str(&format!("{} NOT LIKE {}", column, like("", "%", false)))
        }
        RestrictionType::EndsWith => sql.push_str(&format!("{} LIKE {}", column, like("%", "", false))),
        RestrictionType::IEndsWith => {
            sql.push_str(&format!("LOWER({}) LIKE {}", column, like("%", "", true)))
        }
        RestrictionType::NotEndWith => {
            sql.push_str(&format!("{} NOT LIKE {}", column, like("%", "", false)))
        }
        RestrictionType::IsNull => sql.push_str(&format!("{} IS NULL", column)),
        RestrictionType::IsNotNull => sql.push_str(&format!("{} IS NOT NULL", column)),
        RestrictionType::And | RestrictionType::Or => {
            return Err(DbError::InvalidState(
                "Compound filter without sub-filters".into(),
            ));
        }
    }
    Ok(())
}
