// ============================================================================
// Database Sessions
// ============================================================================
//
// A `DatabaseSession` is the unit of work against one data source. It is
// owned by exactly one transaction frame, keeps a nested savepoint stack and
// is committed or rolled back, then closed, when that frame completes.
//
// Sessions work on untyped `Record`s and `QueryDef`s so the trait stays
// object safe; the `Database` facade does the typed conversion.
//
// ============================================================================

pub mod eval;
pub mod memory;

pub use memory::{MemoryDataSource, MemoryDatabaseSession};

use crate::core::{Record, Result, Value};
use crate::dialect::SqlDialect;
use crate::entity::{ChildKind, EntityRegistry};
use crate::query::{AggregateFunction, Aggregation, GroupingAggregation, QueryDef, Update};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::sync::Arc;

/// Mapping a read goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Live table mapping.
    Table,
    /// Denormalised list view; list-only fields resolve here.
    View,
}

/// Which child associations a read fetches or a mutation cascades to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildFetch {
    None,
    Editable,
    ReadOnly,
    All,
}

impl ChildFetch {
    pub fn includes(&self, kind: ChildKind) -> bool {
        match self {
            ChildFetch::None => false,
            ChildFetch::Editable => kind == ChildKind::Editable,
            ChildFetch::ReadOnly => kind == ChildKind::ReadOnly,
            ChildFetch::All => true,
        }
    }
}

/// Which row a single-result read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// Exactly one match; more than one is an error.
    Single,
    First,
    Last,
}

/// How a read is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    pub source: Source,
    /// Skip list-only fields and child associations.
    pub lean: bool,
    pub children: ChildFetch,
    pub pick: Pick,
}

impl FetchPlan {
    pub fn find() -> Self {
        Self {
            source: Source::Table,
            lean: false,
            children: ChildFetch::All,
            pick: Pick::Single,
        }
    }

    pub fn find_lean() -> Self {
        Self {
            lean: true,
            children: ChildFetch::None,
            ..Self::find()
        }
    }

    pub fn list() -> Self {
        Self {
            source: Source::View,
            ..Self::find()
        }
    }

    pub fn list_lean() -> Self {
        Self {
            source: Source::View,
            ..Self::find_lean()
        }
    }

    pub fn with_pick(mut self, pick: Pick) -> Self {
        self.pick = pick;
        self
    }

    pub fn with_children(mut self, children: ChildFetch) -> Self {
        self.children = children;
        self
    }

    pub fn is_view(&self) -> bool {
        self.source == Source::View
    }
}

#[async_trait]
pub trait DatabaseSession: Send + Sync {
    fn data_source_name(&self) -> &str;

    /// Insert `record` and the child associations selected by `children`.
    /// Returns the assigned id, which is also written back to `record`.
    async fn create(&self, record: &mut Record, children: ChildFetch) -> Result<i64>;

    /// Fails with `RECORD_WITH_PK_NOT_FOUND`, or with
    /// `RECORD_WITH_PK_VERSION_NOT_FOUND` when `version` is given.
    async fn find_by_id(
        &self,
        entity: &str,
        id: i64,
        version: Option<i64>,
        plan: FetchPlan,
    ) -> Result<Record>;

    /// Single-result read. `None` when nothing matches and the query does
    /// not require a match.
    async fn find(&self, query: &QueryDef, plan: FetchPlan) -> Result<Option<Record>>;

    async fn find_all(&self, query: &QueryDef, plan: FetchPlan) -> Result<Vec<Record>>;

    /// Stored record clashing with `record` on any unique constraint.
    async fn find_constraint(&self, record: &Record) -> Result<Option<Record>>;

    async fn find_children(&self, record: &mut Record, children: ChildFetch, view: bool) -> Result<()>;

    async fn populate_list_only(&self, record: &mut Record) -> Result<()>;

    /// The single value of `field`; fails with
    /// `RECORD_AT_LEAST_ONE_VALUE_EXPECTED` when nothing matches.
    async fn value(&self, field: &str, query: &QueryDef) -> Result<Value>;

    async fn value_list(&self, field: &str, query: &QueryDef) -> Result<Vec<Value>>;

    /// `(key, value)` pairs in match order.
    async fn value_pairs(
        &self,
        key_field: &str,
        value_field: &str,
        query: &QueryDef,
    ) -> Result<Vec<(Value, Value)>>;

    async fn min(&self, field: &str, query: &QueryDef) -> Result<Value>;

    async fn max(&self, field: &str, query: &QueryDef) -> Result<Value>;

    async fn count(&self, query: &QueryDef) -> Result<usize>;

    async fn aggregate(&self, function: &AggregateFunction, query: &QueryDef) -> Result<Aggregation>;

    async fn aggregate_many(
        &self,
        functions: &[AggregateFunction],
        query: &QueryDef,
    ) -> Result<Vec<Aggregation>>;

    async fn aggregate_group_many(
        &self,
        functions: &[AggregateFunction],
        query: &QueryDef,
    ) -> Result<Vec<GroupingAggregation>>;

    /// Update every field of `record` by id. With `version_check` the stored
    /// version must equal the record's version.
    async fn update_by_id(
        &self,
        record: &mut Record,
        version_check: bool,
        children: ChildFetch,
    ) -> Result<usize>;

    async fn update_fields_by_id(&self, entity: &str, id: i64, update: &Update) -> Result<usize>;

    async fn update_all(&self, query: &QueryDef, update: &Update) -> Result<usize>;

    async fn delete_by_id(&self, record: &Record, version_check: bool) -> Result<usize>;

    async fn delete(&self, entity: &str, id: i64) -> Result<usize>;

    async fn delete_all(&self, query: &QueryDef) -> Result<usize>;

    async fn get_now(&self) -> Result<NaiveDateTime>;

    async fn set_savepoint(&self) -> Result<()>;

    async fn clear_savepoint(&self) -> Result<()>;

    async fn rollback_to_savepoint(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn is_closed(&self) -> bool;
}

/// Source of sessions for one configured data store.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn dialect(&self) -> Arc<dyn SqlDialect>;

    fn registry(&self) -> Arc<EntityRegistry>;

    /// Open a session. Fails with `DATASOURCE_CONNECTION_UNAVAILABLE` when
    /// every connection slot is taken.
    async fn create_session(&self) -> Result<Arc<dyn DatabaseSession>>;
}
