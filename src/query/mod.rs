// ============================================================================
// Query Model
// ============================================================================
//
// `Query<T>` is the typed builder callers use. It wraps an untyped
// `QueryDef`, which is what crosses the `DatabaseSession` boundary and what
// entity policies and dialects inspect.
//
// Criteria, select, group-by and order are reference-counted and shared by
// `copy()`. A mutation through either copy detaches that copy first
// (copy-on-write), so the other query never observes it.
//
// ============================================================================

pub mod aggregate;
pub mod native;
pub mod update;

pub use aggregate::{AggregateFunction, AggregateType, Aggregation, Grouping, GroupingAggregation};
pub use native::{
    NativeQuery, NativeQueryBuilder, NativeQueryColumn, NativeQueryFilter, NativeQueryJoin,
    NativeQueryOrder, SqlJoinType,
};
pub use update::Update;

use crate::core::{Result, Value};
use crate::criteria::{
    CompareOp, CompoundRestriction, CriteriaBuilder, LogicalOp, NullOp, RangeOp, Restriction,
    SetOp,
};
use crate::entity::Entity;
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderType {
    #[default]
    Ascending,
    Descending,
}

impl OrderType {
    pub fn is_ascending(&self) -> bool {
        matches!(self, OrderType::Ascending)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
    fields: Vec<String>,
    distinct: bool,
}

impl Select {
    pub fn add(&mut self, field: &str) {
        if !self.fields.iter().any(|f| f == field) {
            self.fields.push(field.to_string());
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn set_distinct(&mut self, distinct: bool) {
        self.distinct = distinct;
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
        self.distinct = false;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupBy {
    fields: Vec<String>,
}

impl GroupBy {
    pub fn add(&mut self, field: &str) {
        if !self.fields.iter().any(|f| f == field) {
            self.fields.push(field.to_string());
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderPart {
    pub field: String,
    pub order_type: OrderType,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Order {
    parts: Vec<OrderPart>,
}

impl Order {
    pub fn add(&mut self, field: &str, order_type: OrderType) {
        self.parts.push(OrderPart {
            field: field.to_string(),
            order_type,
        });
    }

    pub fn parts(&self) -> &[OrderPart] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }
}

/// Untyped query specification.
#[derive(Debug, Clone)]
pub struct QueryDef {
    entity: String,
    criteria: Arc<CompoundRestriction>,
    select: Option<Arc<Select>>,
    group_by: Option<Arc<GroupBy>>,
    order: Option<Arc<Order>>,
    min_property: Option<String>,
    max_property: Option<String>,
    offset: i32,
    limit: i32,
    ignore_tenancy: bool,
    ignore_empty_criteria: bool,
    apply_app_query_limit: bool,
    must_match: bool,
}

impl QueryDef {
    pub fn new(entity: &str) -> Self {
        Self::with_root(entity, LogicalOp::And, false)
    }

    fn with_root(entity: &str, op: LogicalOp, apply_app_query_limit: bool) -> Self {
        Self {
            entity: entity.to_string(),
            criteria: Arc::new(CompoundRestriction::new(op)),
            select: None,
            group_by: None,
            order: None,
            min_property: None,
            max_property: None,
            offset: 0,
            limit: 0,
            ignore_tenancy: false,
            ignore_empty_criteria: false,
            apply_app_query_limit,
            must_match: true,
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn criteria(&self) -> &CompoundRestriction {
        &self.criteria
    }

    /// Root criteria as a restriction, `None` when nothing was added.
    pub fn restriction(&self) -> Option<Restriction> {
        if self.criteria.is_vacuous() {
            None
        } else {
            Some(Restriction::Compound((*self.criteria).clone()))
        }
    }

    pub fn add_restriction(&mut self, restriction: Restriction) {
        Arc::make_mut(&mut self.criteria).add(restriction);
    }

    pub fn is_empty_criteria(&self) -> bool {
        self.criteria.is_vacuous()
    }

    pub fn is_restricted_field(&self, field: &str) -> bool {
        self.criteria.is_restricted_field(field)
    }

    /// Every field referenced by the criteria.
    pub fn restricted_fields(&self) -> BTreeSet<String> {
        let mut fields = Vec::new();
        for restriction in &self.criteria.restrictions {
            restriction.collect_fields(&mut fields);
        }
        fields.into_iter().collect()
    }

    pub fn select(&self) -> Option<&Select> {
        self.select.as_deref()
    }

    pub fn add_select(&mut self, field: &str) {
        Arc::make_mut(self.select.get_or_insert_with(Default::default)).add(field);
    }

    pub fn is_distinct(&self) -> bool {
        self.select.as_ref().is_some_and(|s| s.is_distinct())
    }

    pub fn set_distinct(&mut self, distinct: bool) {
        Arc::make_mut(self.select.get_or_insert_with(Default::default)).set_distinct(distinct);
    }

    pub fn group_by(&self) -> Option<&GroupBy> {
        self.group_by.as_deref()
    }

    pub fn add_group_by(&mut self, field: &str) {
        Arc::make_mut(self.group_by.get_or_insert_with(Default::default)).add(field);
    }

    pub fn order(&self) -> Option<&Order> {
        self.order.as_deref()
    }

    pub fn add_order(&mut self, field: &str, order_type: OrderType) {
        Arc::make_mut(self.order.get_or_insert_with(Default::default)).add(field, order_type);
    }

    pub fn min_property(&self) -> Option<&str> {
        self.min_property.as_deref()
    }

    pub fn max_property(&self) -> Option<&str> {
        self.max_property.as_deref()
    }

    pub fn set_min(&mut self, field: &str) {
        self.min_property = Some(field.to_string());
    }

    pub fn set_max(&mut self, field: &str) {
        self.max_property = Some(field.to_string());
    }

    pub fn is_min_max(&self) -> bool {
        self.min_property.is_some() || self.max_property.is_some()
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: i32) {
        self.offset = offset;
    }

    pub fn limit(&self) -> i32 {
        self.limit
    }

    pub fn set_limit(&mut self, limit: i32) {
        self.limit = limit;
    }

    /// True whenever `offset >= 0` or `limit > 0`. With the default offset
    /// of 0 this is always true; use `is_limit`/`is_offset` for the
    /// explicit checks.
    pub fn is_pagination(&self) -> bool {
        self.offset >= 0 || self.limit > 0
    }

    pub fn is_limit(&self) -> bool {
        self.limit > 0
    }

    pub fn is_offset(&self) -> bool {
        self.offset > 0
    }

    pub fn is_ignore_tenancy(&self) -> bool {
        self.ignore_tenancy
    }

    pub fn set_ignore_tenancy(&mut self, ignore: bool) {
        self.ignore_tenancy = ignore;
    }

    pub fn is_ignore_empty_criteria(&self) -> bool {
        self.ignore_empty_criteria
    }

    pub fn set_ignore_empty_criteria(&mut self, ignore: bool) {
        self.ignore_empty_criteria = ignore;
    }

    pub fn is_apply_app_query_limit(&self) -> bool {
        self.apply_app_query_limit
    }

    pub fn set_apply_app_query_limit(&mut self, apply: bool) {
        self.apply_app_query_limit = apply;
    }

    pub fn is_must_match(&self) -> bool {
        self.must_match
    }

    pub fn set_must_match(&mut self, must_match: bool) {
        self.must_match = must_match;
    }

    /// Reset criteria, select, order, pagination and the criteria flags.
    pub fn clear(&mut self) {
        self.clear_criteria();
        if let Some(select) = self.select.as_mut() {
            Arc::make_mut(select).clear();
        }
        if let Some(order) = self.order.as_mut() {
            Arc::make_mut(order).clear();
        }
        self.offset = 0;
        self.limit = 0;
        self.ignore_empty_criteria = false;
        self.apply_app_query_limit = false;
    }

    pub fn clear_criteria(&mut self) {
        Arc::make_mut(&mut self.criteria).clear();
    }

    pub fn clear_select(&mut self) {
        if let Some(select) = self.select.as_mut() {
            Arc::make_mut(select).clear();
        }
    }

    pub fn clear_order(&mut self) {
        if let Some(order) = self.order.as_mut() {
            Arc::make_mut(order).clear();
        }
    }

    /// Shallow copy sharing criteria, select and order.
    pub fn copy(&self) -> Self {
        let mut copy = Self::with_root(&self.entity, self.criteria.op, self.apply_app_query_limit);
        copy.criteria = Arc::clone(&self.criteria);
        copy.copy_shared_from(self);
        copy
    }

    /// Copy without criteria; select and order are still shared.
    pub fn copy_no_criteria(&self) -> Self {
        let mut copy = Self::with_root(&self.entity, self.criteria.op, self.apply_app_query_limit);
        copy.copy_shared_from(self);
        copy
    }

    /// Copy keeping only the entity and the application-limit flag.
    pub fn copy_no_all(&self) -> Self {
        Self::with_root(&self.entity, LogicalOp::And, self.apply_app_query_limit)
    }

    fn copy_shared_from(&mut self, other: &QueryDef) {
        self.select = other.select.clone();
        self.group_by = other.group_by.clone();
        self.order = other.order.clone();
        self.offset = other.offset;
        self.limit = other.limit;
        self.ignore_empty_criteria = other.ignore_empty_criteria;
        self.ignore_tenancy = other.ignore_tenancy;
        self.must_match = other.must_match;
    }

    /// True when `other` shares this query's criteria object.
    pub fn shares_criteria_with(&self, other: &QueryDef) -> bool {
        Arc::ptr_eq(&self.criteria, &other.criteria)
    }
}

/// Typed query over entity `T`.
pub struct Query<T> {
    def: QueryDef,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self::from_def(self.def.clone())
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Query").field(&self.def).finish()
    }
}

impl<T: Entity> Query<T> {
    /// Query whose predicates are ANDed together.
    pub fn of() -> Self {
        Self::from_def(QueryDef::new(T::ENTITY))
    }

    /// Query whose predicates are ORed together.
    pub fn of_defaulting_to_or() -> Self {
        Self::from_def(QueryDef::with_root(T::ENTITY, LogicalOp::Or, false))
    }

    /// Query subject to the application query limit.
    pub fn of_app_limited() -> Self {
        Self::from_def(QueryDef::with_root(T::ENTITY, LogicalOp::And, true))
    }
}

impl<T> Query<T> {
    fn from_def(def: QueryDef) -> Self {
        Self {
            def,
            _entity: PhantomData,
        }
    }

    pub fn def(&self) -> &QueryDef {
        &self.def
    }

    pub fn def_mut(&mut self) -> &mut QueryDef {
        &mut self.def
    }

    pub fn into_def(self) -> QueryDef {
        self.def
    }

    fn compare(mut self, op: CompareOp, field: &str, value: impl Into<Value>) -> Self {
        self.def.add_restriction(Restriction::compare(op, field, value));
        self
    }

    fn compare_field(mut self, op: CompareOp, field: &str, other_field: &str) -> Self {
        self.def
            .add_restriction(Restriction::compare_field(op, field, other_field));
        self
    }

    pub fn add_restriction(mut self, restriction: Restriction) -> Self {
        self.def.add_restriction(restriction);
        self
    }

    /// Add the criteria assembled by `builder` as one restriction.
    pub fn add_criteria(self, builder: CriteriaBuilder) -> Result<Self> {
        let restriction = builder.build()?;
        Ok(self.add_restriction(restriction))
    }

    pub fn equals(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::Equals, field, value)
    }

    pub fn iequals(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::IEquals, field, value)
    }

    pub fn not_equals(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::NotEquals, field, value)
    }

    pub fn inot_equals(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::INotEquals, field, value)
    }

    pub fn less(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::LessThan, field, value)
    }

    pub fn less_equal(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::LessOrEqual, field, value)
    }

    pub fn greater(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::GreaterThan, field, value)
    }

    pub fn greater_equal(self, field: &str, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::GreaterOrEqual, field, value)
    }

    pub fn like(self, field: &str, value: &str) -> Self {
        self.compare(CompareOp::Like, field, value)
    }

    pub fn ilike(self, field: &str, value: &str) -> Self {
        self.compare(CompareOp::ILike, field, value)
    }

    pub fn not_like(self, field: &str, value: &str) -> Self {
        self.compare(CompareOp::NotLike, field, value)
    }

    pub fn begins_with(self, field: &str, value: &str) -> Self {
        self.compare(CompareOp::BeginsWith, field, value)
    }

    pub fn ibegins_with(self, field: &str, value: &str) -> Self {
        self.compare(CompareOp::IBeginsWith, field, value)
    }

    pub fn not_begin_with(self, field: &str, value: &str) -> Self {
        self.compare(CompareOp::NotBeginWith, field, value)
    }

    pub fn ends_with(self, field: &str, value: &str) -> Self {
        self.compare(CompareOp::EndsWith, field, value)
    }

    pub fn iends_with(self, field: &str, value: &str) -> Self {
        self.compare(CompareOp::IEndsWith, field, value)
    }

    pub fn not_end_with(self, field: &str, value: &str) -> Self {
        self.compare(CompareOp::NotEndWith, field, value)
    }

    pub fn equals_field(self, field: &str, other_field: &str) -> Self {
        self.compare_field(CompareOp::Equals, field, other_field)
    }

    pub fn not_equals_field(self, field: &str, other_field: &str) -> Self {
        self.compare_field(CompareOp::NotEquals, field, other_field)
    }

    pub fn less_field(self, field: &str, other_field: &str) -> Self {
        self.compare_field(CompareOp::LessThan, field, other_field)
    }

    pub fn less_equal_field(self, field: &str, other_field: &str) -> Self {
        self.compare_field(CompareOp::LessOrEqual, field, other_field)
    }

    pub fn greater_field(self, field: &str, other_field: &str) -> Self {
        self.compare_field(CompareOp::GreaterThan, field, other_field)
    }

    pub fn greater_equal_field(self, field: &str, other_field: &str) -> Self {
        self.compare_field(CompareOp::GreaterOrEqual, field, other_field)
    }

    pub fn between(mut self, field: &str, lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        self.def
            .add_restriction(Restriction::range(RangeOp::Between, field, lower, upper));
        self
    }

    pub fn not_between(
        mut self,
        field: &str,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
    ) -> Self {
        self.def
            .add_restriction(Restriction::range(RangeOp::NotBetween, field, lower, upper));
        self
    }

    pub fn between_field(mut self, field: &str, lower_field: &str, upper_field: &str) -> Self {
        self.def.add_restriction(Restriction::range_field(
            RangeOp::Between,
            field,
            lower_field,
            upper_field,
        ));
        self
    }

    pub fn not_between_field(mut self, field: &str, lower_field: &str, upper_field: &str) -> Self {
        self.def.add_restriction(Restriction::range_field(
            RangeOp::NotBetween,
            field,
            lower_field,
            upper_field,
        ));
        self
    }

    /// `field IN (values)`. An empty `values` is rejected.
    pub fn amongst<I, V>(mut self, field: &str, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.def
            .add_restriction(Restriction::set(SetOp::Amongst, field, values)?);
        Ok(self)
    }

    pub fn not_amongst<I, V>(mut self, field: &str, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.def
            .add_restriction(Restriction::set(SetOp::NotAmongst, field, values)?);
        Ok(self)
    }

    pub fn is_null(mut self, field: &str) -> Self {
        self.def.add_restriction(Restriction::null(NullOp::IsNull, field));
        self
    }

    pub fn is_not_null(mut self, field: &str) -> Self {
        self.def
            .add_restriction(Restriction::null(NullOp::IsNotNull, field));
        self
    }

    pub fn add_select(mut self, field: &str) -> Self {
        self.def.add_select(field);
        self
    }

    pub fn add_group_by(mut self, field: &str) -> Self {
        self.def.add_group_by(field);
        self
    }

    pub fn add_order(mut self, field: &str) -> Self {
        self.def.add_order(field, OrderType::Ascending);
        self
    }

    pub fn add_order_by(mut self, order_type: OrderType, field: &str) -> Self {
        self.def.add_order(field, order_type);
        self
    }

    pub fn min(mut self, field: &str) -> Self {
        self.def.set_min(field);
        self
    }

    pub fn max(mut self, field: &str) -> Self {
        self.def.set_max(field);
        self
    }

    pub fn offset(mut self, offset: i32) -> Self {
        self.def.set_offset(offset);
        self
    }

    pub fn limit(mut self, limit: i32) -> Self {
        self.def.set_limit(limit);
        self
    }

    pub fn distinct(mut self, distinct: bool) -> Self {
        self.def.set_distinct(distinct);
        self
    }

    pub fn ignore_tenancy(mut self, ignore: bool) -> Self {
        self.def.set_ignore_tenancy(ignore);
        self
    }

    pub fn ignore_empty_criteria(mut self, ignore: bool) -> Self {
        self.def.set_ignore_empty_criteria(ignore);
        self
    }

    pub fn apply_app_query_limit(mut self, apply: bool) -> Self {
        self.def.set_apply_app_query_limit(apply);
        self
    }

    pub fn must_match(mut self, must_match: bool) -> Self {
        self.def.set_must_match(must_match);
        self
    }

    pub fn is_pagination(&self) -> bool {
        self.def.is_pagination()
    }

    pub fn is_limit(&self) -> bool {
        self.def.is_limit()
    }

    pub fn is_offset(&self) -> bool {
        self.def.is_offset()
    }

    pub fn is_empty_criteria(&self) -> bool {
        self.def.is_empty_criteria()
    }

    pub fn clear(mut self) -> Self {
        self.def.clear();
        self
    }

    pub fn copy(&self) -> Self {
        Self::from_def(self.def.copy())
    }

    pub fn copy_no_criteria(&self) -> Self {
        Self::from_def(self.def.copy_no_criteria())
    }

    pub fn copy_no_all(&self) -> Self {
        Self::from_def(self.def.copy_no_all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorCode, Record};

    struct Book;

    impl Entity for Book {
        const ENTITY: &'static str = "book";

        fn to_record(&self) -> Record {
            Record::new(Self::ENTITY)
        }

        fn from_record(_record: Record) -> Result<Self> {
            Ok(Book)
        }
    }

    #[test]
    fn test_predicates_accumulate_under_and_root() {
        let query = Query::<Book>::of()
            .equals("title", "Dune")
            .greater("pages", 100)
            .is_not_null("isbn");
        assert_eq!(query.def().criteria().op, LogicalOp::And);
        assert_eq!(query.def().criteria().len(), 3);
        assert!(query.def().is_restricted_field("pages"));
        assert!(query.def().is_must_match());
    }

    #[test]
    fn test_defaulting_to_or() {
        let query = Query::<Book>::of_defaulting_to_or().equals("a", 1).equals("b", 2);
        assert_eq!(query.def().criteria().op, LogicalOp::Or);
    }

    #[test]
    fn test_pagination_flags() {
        let query = Query::<Book>::of();
        // Default offset of zero already counts as pagination.
        assert!(query.is_pagination());
        assert!(!query.is_limit());
        assert!(!query.is_offset());

        let query = query.offset(-1);
        assert!(!query.is_pagination());
        let query = query.limit(20);
        assert!(query.is_pagination());
        assert!(query.is_limit());
    }

    #[test]
    fn test_empty_amongst_is_rejected() {
        let err = Query::<Book>::of()
            .amongst("id", Vec::<i64>::new())
            .unwrap_err();
        assert!(err.is_code(ErrorCode::EmptyMultiValueRestriction));
    }

    #[test]
    fn test_copy_shares_then_detaches_on_write() {
        let original = Query::<Book>::of().equals("title", "Dune").add_order("title");
        let copy = original.copy();
        assert!(copy.def().shares_criteria_with(original.def()));

        let copy = copy.equals("author", "Herbert");
        assert!(!copy.def().shares_criteria_with(original.def()));
        assert_eq!(original.def().criteria().len(), 1);
        assert_eq!(copy.def().criteria().len(), 2);
        assert_eq!(copy.def().order().map(|o| o.parts().len()), Some(1));
    }

    #[test]
    fn test_copy_variants_drop_state() {
        let original = Query::<Book>::of_app_limited()
            .equals("title", "Dune")
            .add_select("title")
            .limit(5);

        let no_criteria = original.copy_no_criteria();
        assert!(no_criteria.is_empty_criteria());
        assert_eq!(no_criteria.def().limit(), 5);
        assert!(no_criteria.def().select().is_some());

        let no_all = original.copy_no_all();
        assert!(no_all.is_empty_criteria());
        assert!(no_all.def().select().is_none());
        assert_eq!(no_all.def().limit(), 0);
        assert!(no_all.def().is_apply_app_query_limit());
    }

    #[test]
    fn test_clear_resets_state() {
        let query = Query::<Book>::of()
            .equals("title", "Dune")
            .add_select("title")
            .offset(3)
            .limit(4)
            .ignore_empty_criteria(true)
            .clear();
        assert!(query.is_empty_criteria());
        assert_eq!(query.def().offset(), 0);
        assert_eq!(query.def().limit(), 0);
        assert!(!query.def().is_ignore_empty_criteria());
        assert!(query.def().select().is_some_and(|s| s.is_empty()));
    }
}
