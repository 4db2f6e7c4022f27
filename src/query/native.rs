use super::OrderType;
use crate::core::{DbError, ErrorCode, Result, Value};
use crate::criteria::RestrictionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlJoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

impl SqlJoinType {
    pub fn sql(&self) -> &'static str {
        match self {
            SqlJoinType::Inner => "INNER JOIN",
            SqlJoinType::LeftOuter => "LEFT JOIN",
            SqlJoinType::RightOuter => "RIGHT JOIN",
            SqlJoinType::FullOuter => "FULL OUTER JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NativeQueryColumn {
    pub table_name: String,
    pub column_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NativeQueryJoin {
    pub join_type: SqlJoinType,
    pub table_a: String,
    pub column_a: String,
    pub table_b: String,
    pub column_b: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NativeQueryOrder {
    pub order_type: OrderType,
    pub table_name: String,
    pub column_name: String,
}

/// A filter node. Compound nodes carry sub-filters and no column; simple
/// nodes carry a column and up to two parameters (or a value list for
/// multi-value kinds).
#[derive(Debug, Clone, PartialEq)]
pub struct NativeQueryFilter {
    op: RestrictionType,
    table_name: Option<String>,
    column_name: Option<String>,
    param1: Option<Value>,
    param2: Option<Value>,
    values: Vec<Value>,
    sub_filters: Option<Vec<NativeQueryFilter>>,
}

impl NativeQueryFilter {
    fn compound(op: RestrictionType) -> Self {
        Self {
            op,
            table_name: None,
            column_name: None,
            param1: None,
            param2: None,
            values: Vec::new(),
            sub_filters: Some(Vec::new()),
        }
    }

    pub fn op(&self) -> RestrictionType {
        self.op
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }

    pub fn column_name(&self) -> Option<&str> {
        self.column_name.as_deref()
    }

    pub fn param1(&self) -> Option<&Value> {
        self.param1.as_ref()
    }

    pub fn param2(&self) -> Option<&Value> {
        self.param2.as_ref()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Sub-filters; `None` for simple filters.
    pub fn sub_filters(&self) -> Option<&[NativeQueryFilter]> {
        self.sub_filters.as_deref()
    }

    pub fn is_compound(&self) -> bool {
        self.op.is_compound()
    }
}

/// Immutable raw-table query produced by `NativeQueryBuilder`.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeQuery {
    schema_name: Option<String>,
    table_name: String,
    columns: Vec<NativeQueryColumn>,
    joins: Vec<NativeQueryJoin>,
    orders: Vec<NativeQueryOrder>,
    root_filter: Option<NativeQueryFilter>,
    offset: i32,
    limit: i32,
    distinct: bool,
}

impl NativeQuery {
    pub fn builder() -> NativeQueryBuilder {
        NativeQueryBuilder::default()
    }

    pub fn schema_name(&self) -> Option<&str> {
        self.schema_name.as_deref()
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn columns(&self) -> &[NativeQueryColumn] {
        &self.columns
    }

    pub fn joins(&self) -> &[NativeQueryJoin] {
        &self.joins
    }

    pub fn orders(&self) -> &[NativeQueryOrder] {
        &self.orders
    }

    pub fn root_filter(&self) -> Option<&NativeQueryFilter> {
        self.root_filter.as_ref()
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn limit(&self) -> i32 {
        self.limit
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn is_join(&self) -> bool {
        !self.joins.is_empty()
    }

    pub fn is_filter(&self) -> bool {
        self.root_filter.is_some()
    }

    pub fn is_order(&self) -> bool {
        !self.orders.is_empty()
    }
}

/// Builder enforcing balanced compound filters and a single root.
///
/// ```
/// use unifydb::criteria::RestrictionType;
/// use unifydb::query::NativeQuery;
///
/// # fn main() -> unifydb::Result<()> {
/// let query = NativeQuery::builder()
///     .table_name("BOOK")
///     .add_column("BOOK", "TITLE")
///     .begin_compound_filter(RestrictionType::And)?
///     .add_simple_filter(RestrictionType::Equals, "BOOK", "ID", Some(101.into()), None)?
///     .end_compound_filter()?
///     .build()?;
/// assert!(query.is_filter());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct NativeQueryBuilder {
    schema_name: Option<String>,
    table_name: String,
    columns: Vec<NativeQueryColumn>,
    joins: Vec<NativeQueryJoin>,
    orders: Vec<NativeQueryOrder>,
    filter_stack: Vec<NativeQueryFilter>,
    root_filter: Option<NativeQueryFilter>,
    offset: i32,
    limit: i32,
    distinct: bool,
}

impl NativeQueryBuilder {
    pub fn schema_name(mut self, schema_name: &str) -> Self {
        self.schema_name = Some(schema_name.to_string());
        self
    }

    pub fn table_name(mut self, table_name: &str) -> Self {
        self.table_name = table_name.to_string();
        self
    }

    pub fn add_column(mut self, table_name: &str, column_name: &str) -> Self {
        self.columns.push(NativeQueryColumn {
            table_name: table_name.to_string(),
            column_name: column_name.to_string(),
        });
        self
    }

    pub fn add_join(
        mut self,
        join_type: SqlJoinType,
        table_a: &str,
        column_a: &str,
        table_b: &str,
        column_b: &str,
    ) -> Self {
        self.joins.push(NativeQueryJoin {
            join_type,
            table_a: table_a.to_string(),
            column_a: column_a.to_string(),
            table_b: table_b.to_string(),
            column_b: column_b.to_string(),
        });
        self
    }

    pub fn add_order(mut self, order_type: OrderType, table_name: &str, column_name: &str) -> Self {
        self.orders.push(NativeQueryOrder {
            order_type,
            table_name: table_name.to_string(),
            column_name: column_name.to_string(),
        });
        self
    }

    pub fn offset(mut self, offset: i32) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = limit;
        self
    }

    pub fn distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    /// Open an AND/OR context. Only one root compound filter is allowed.
    pub fn begin_compound_filter(mut self, op: RestrictionType) -> Result<Self> {
        if !op.is_compound() {
            return Err(DbError::InvalidArgument(format!(
                "Restriction type '{}' is not a compound type",
                op
            )));
        }
        if self.filter_stack.is_empty() && self.root_filter.is_some() {
            return Err(DbError::InvalidState(
                "Multiple root compound filter not allowed".into(),
            ));
        }
        self.filter_stack.push(NativeQueryFilter::compound(op));
        Ok(self)
    }

    pub fn add_simple_filter(
        self,
        op: RestrictionType,
        table_name: &str,
        column_name: &str,
        param1: Option<Value>,
        param2: Option<Value>,
    ) -> Result<Self> {
        if matches!(op, RestrictionType::Amongst | RestrictionType::NotAmongst) {
            return Err(DbError::InvalidArgument(format!(
                "Restriction type '{}' needs add_multi_value_filter",
                op
            )));
        }
        self.add_filter(op, table_name, column_name, param1, param2, Vec::new())
    }

    /// Simple filter for `Amongst`/`NotAmongst` kinds.
    pub fn add_multi_value_filter(
        self,
        op: RestrictionType,
        table_name: &str,
        column_name: &str,
        values: Vec<Value>,
    ) -> Result<Self> {
        if !matches!(op, RestrictionType::Amongst | RestrictionType::NotAmongst) {
            return Err(DbError::InvalidArgument(format!(
                "Restriction type '{}' is not a multi-value type",
                op
            )));
        }
        if values.is_empty() {
            return Err(DbError::coded(
                ErrorCode::EmptyMultiValueRestriction,
                format!("Multi-value filter on '{}.{}' has no values", table_name, column_name),
            ));
        }
        self.add_filter(op, table_name, column_name, None, None, values)
    }

    fn add_filter(
        mut self,
        op: RestrictionType,
        table_name: &str,
        column_name: &str,
        param1: Option<Value>,
        param2: Option<Value>,
        values: Vec<Value>,
    ) -> Result<Self> {
        if op.is_compound() {
            return Err(DbError::InvalidArgument(format!(
                "Restriction type '{}' is a compound type",
                op
            )));
        }
        let parent = self.filter_stack.last_mut().ok_or_else(|| {
            DbError::InvalidState("No compound filter context is open".into())
        })?;
        if let Some(sub_filters) = parent.sub_filters.as_mut() {
            sub_filters.push(NativeQueryFilter {
                op,
                table_name: Some(table_name.to_string()),
                column_name: Some(column_name.to_string()),
                param1,
                param2,
                values,
                sub_filters: None,
            });
        }
        Ok(self)
    }

    pub fn end_compound_filter(mut self) -> Result<Self> {
        let filter = self.filter_stack.pop().ok_or_else(|| {
            DbError::InvalidState("No compound filter context to end".into())
        })?;
        if filter.sub_filters().is_none_or(<[NativeQueryFilter]>::is_empty) {
            return Err(DbError::InvalidState(format!(
                "Compound filter '{}' has no sub-filters",
                filter.op()
            )));
        }
        match self.filter_stack.last_mut() {
            Some(parent) => {
                if let Some(sub_filters) = parent.sub_filters.as_mut() {
                    sub_filters.push(filter);
                }
            }
            None => self.root_filter = Some(filter),
        }
        Ok(self)
    }

    pub fn build(self) -> Result<NativeQuery> {
        if !self.filter_stack.is_empty() {
            return Err(DbError::InvalidState(format!(
                "{} compound filter context(s) still open",
                self.filter_stack.len()
            )));
        }
        Ok(NativeQuery {
            schema_name: self.schema_name,
            table_name: self.table_name,
            columns: self.columns,
            joins: self.joins,
            orders: self.orders,
            root_filter: self.root_filter,
            offset: self.offset,
            limit: self.limit,
            distinct: self.distinct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_compound_filter() {
        let query = NativeQuery::builder()
            .begin_compound_filter(RestrictionType::And)
            .unwrap()
            .add_simple_filter(RestrictionType::Equals, "TESTTBL", "TESTTBL_ID", Some(101.into()), None)
            .unwrap()
            .end_compound_filter()
            .unwrap()
            .build()
            .unwrap();

        let root = query.root_filter().unwrap();
        assert_eq!(root.op(), RestrictionType::And);
        let subs = root.sub_filters().unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].op(), RestrictionType::Equals);
        assert_eq!(subs[0].table_name(), Some("TESTTBL"));
        assert_eq!(subs[0].column_name(), Some("TESTTBL_ID"));
        assert_eq!(subs[0].param1(), Some(&Value::Integer(101)));
        assert!(subs[0].param2().is_none());
        assert!(subs[0].sub_filters().is_none());
    }

    #[test]
    fn test_deep_compound_filter() {
        let query = NativeQuery::builder()
            .begin_compound_filter(RestrictionType::And)
            .unwrap()
            .add_simple_filter(RestrictionType::Equals, "TESTTBL", "TESTTBL_ID", Some(101.into()), None)
            .unwrap()
            .add_simple_filter(RestrictionType::Between, "TESTTBL", "AGE", Some(24.into()), Some(46.into()))
            .unwrap()
            .begin_compound_filter(RestrictionType::Or)
            .unwrap()
            .add_simple_filter(RestrictionType::BeginsWith, "TESTTBL", "NAME", Some("A".into()), None)
            .unwrap()
            .add_simple_filter(RestrictionType::BeginsWith, "TESTTBL", "NAME", Some("B".into()), None)
            .unwrap()
            .end_compound_filter()
            .unwrap()
            .add_simple_filter(RestrictionType::IsNotNull, "TESTTBL", "ADDRESS", None, None)
            .unwrap()
            .end_compound_filter()
            .unwrap()
            .build()
            .unwrap();

        let subs = query.root_filter().unwrap().sub_filters().unwrap();
        assert_eq!(subs.len(), 4);
        assert_eq!(subs[1].param2(), Some(&Value::Integer(46)));
        assert_eq!(subs[2].op(), RestrictionType::Or);
        let nested = subs[2].sub_filters().unwrap();
        assert_eq!(nested.len(), 2);
        assert_eq!(nested[1].param1(), Some(&Value::Text("B".into())));
        assert_eq!(subs[3].op(), RestrictionType::IsNotNull);
    }

    #[test]
    fn test_begin_with_simple_type_fails() {
        let err = NativeQuery::builder()
            .begin_compound_filter(RestrictionType::Equals)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(_)));
    }

    #[test]
    fn test_end_without_context_fails() {
        let err = NativeQuery::builder().end_compound_filter().unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[test]
    fn test_simple_filter_with_compound_type_fails() {
        let err = NativeQuery::builder()
            .add_simple_filter(RestrictionType::And, "TESTTBL", "TESTTBL_ID", None, None)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(_)));
    }

    #[test]
    fn test_simple_filter_without_context_fails() {
        let err = NativeQuery::builder()
            .add_simple_filter(RestrictionType::Equals, "TESTTBL", "TESTTBL_ID", Some(201.into()), None)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[test]
    fn test_build_with_open_context_fails() {
        let err = NativeQuery::builder()
            .begin_compound_filter(RestrictionType::And)
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[test]
    fn test_empty_compound_filter_is_rejected() {
        let err = NativeQuery::builder()
            .begin_compound_filter(RestrictionType::And)
            .unwrap()
            .add_simple_filter(RestrictionType::Equals, "T", "NAME", Some("x".into()), None)
            .unwrap()
            .begin_compound_filter(RestrictionType::Or)
            .unwrap()
            .end_compound_filter()
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[test]
    fn test_multi_value_kinds_need_values() {
        let builder = || {
            NativeQuery::builder()
                .begin_compound_filter(RestrictionType::And)
                .unwrap()
        };

        let err = builder()
            .add_simple_filter(RestrictionType::Amongst, "T", "ID", Some(1.into()), None)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(_)));

        let err = builder()
            .add_multi_value_filter(RestrictionType::NotAmongst, "T", "ID", Vec::new())
            .unwrap_err();
        assert!(err.is_code(ErrorCode::EmptyMultiValueRestriction));

        assert!(builder()
            .add_multi_value_filter(RestrictionType::Amongst, "T", "ID", vec![1.into(), 2.into()])
            .is_ok());
    }

    #[test]
    fn test_multiple_root_filters_fail() {
        let err = NativeQuery::builder()
            .begin_compound_filter(RestrictionType::And)
            .unwrap()
            .add_simple_filter(RestrictionType::IsNull, "T", "A", None, None)
            .unwrap()
            .end_compound_filter()
            .unwrap()
            .begin_compound_filter(RestrictionType::Or)
            .unwrap_err();
        assert!(err.to_string().contains("Multiple root compound filter"));
    }
}
