// ============================================================================
// Database Facade
// ============================================================================
//
// `Database` is a typed delegator. Every operation asks the transaction
// manager for the session this database has in the current transaction and
// forwards to it, converting between entities and records on the way.
//
// ============================================================================

use crate::core::{DbError, ErrorCode, Record, Result, Value};
use crate::entity::{Entity, EntityRegistry};
use crate::query::{AggregateFunction, Aggregation, GroupingAggregation, Query, QueryDef, Update};
use crate::session::{ChildFetch, DataSource, DatabaseSession, FetchPlan, Pick};
use crate::transaction::DatabaseTransactionManager;
use chrono::NaiveDateTime;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a `Database` handle, the key under which a transaction frame
/// caches its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseId(u64);

impl DatabaseId {
    fn new() -> Self {
        DatabaseId(NEXT_DATABASE_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db_{}", self.0)
    }
}

struct DatabaseInner {
    id: DatabaseId,
    data_source: Arc<dyn DataSource>,
    transaction_manager: Arc<DatabaseTransactionManager>,
}

#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.id)
            .field("data_source", &self.inner.data_source.name())
            .finish()
    }
}

impl Database {
    pub fn new(
        data_source: Arc<dyn DataSource>,
        transaction_manager: Arc<DatabaseTransactionManager>,
    ) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                id: DatabaseId::new(),
                data_source,
                transaction_manager,
            }),
        }
    }

    pub fn id(&self) -> DatabaseId {
        self.inner.id
    }

    /// Name of the underlying data source.
    pub fn name(&self) -> &str {
        self.inner.data_source.name()
    }

    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.inner.data_source
    }

    pub fn registry(&self) -> Arc<EntityRegistry> {
        self.inner.data_source.registry()
    }

    pub fn transaction_manager(&self) -> &Arc<DatabaseTransactionManager> {
        &self.inner.transaction_manager
    }

    /// Open a fresh session on the data source. Used by the transaction
    /// manager when this database joins a frame.
    pub async fn create_database_session(&self) -> Result<Arc<dyn DatabaseSession>> {
        self.inner.data_source.create_session().await
    }

    async fn session(&self) -> Result<Arc<dyn DatabaseSession>> {
        self.inner.transaction_manager.get_database_session(self).await
    }

    // ------------------------------------------------------------------
    // Shared read paths
    // ------------------------------------------------------------------

    async fn read_one<T: Entity>(&self, query: &Query<T>, plan: FetchPlan) -> Result<Option<T>> {
        self.session()
            .await?
            .find(query.def(), plan)
            .await?
            .map(T::from_record)
            .transpose()
    }

    async fn read_required<T: Entity>(&self, query: &Query<T>, plan: FetchPlan) -> Result<T> {
        self.read_one(query, plan).await?.ok_or_else(|| {
            DbError::coded(
                ErrorCode::RecordNotFound,
                format!("No record of '{}' matches the query", T::ENTITY),
            )
        })
    }

    async fn read_by_id<T: Entity>(&self, id: i64, version: Option<i64>, plan: FetchPlan) -> Result<T> {
        let record = self
            .session()
            .await?
            .find_by_id(T::ENTITY, id, version, plan)
            .await?;
        T::from_record(record)
    }

    async fn read_all<T: Entity>(&self, query: &Query<T>, plan: FetchPlan) -> Result<Vec<T>> {
        self.session()
            .await?
            .find_all(query.def(), plan)
            .await?
            .into_iter()
            .map(T::from_record)
            .collect()
    }

    async fn read_all_map<T: Entity>(
        &self,
        key_field: &str,
        query: &Query<T>,
        plan: FetchPlan,
    ) -> Result<HashMap<Value, T>> {
        let records = self.session().await?.find_all(query.def(), plan).await?;
        let mut map = HashMap::with_capacity(records.len());
        for record in records {
            map.insert(record.get(key_field).clone(), T::from_record(record)?);
        }
        Ok(map)
    }

    async fn read_all_list_map<T: Entity>(
        &self,
        key_field: &str,
        query: &Query<T>,
        plan: FetchPlan,
    ) -> Result<HashMap<Value, Vec<T>>> {
        let records = self.session().await?.find_all(query.def(), plan).await?;
        let mut map: HashMap<Value, Vec<T>> = HashMap::new();
        for record in records {
            map.entry(record.get(key_field).clone())
                .or_default()
                .push(T::from_record(record)?);
        }
        Ok(map)
    }

    async fn read_children<T: Entity>(&self, entity: &mut T, children: ChildFetch, view: bool) -> Result<()> {
        let mut record = entity.to_record();
        self.session()
            .await?
            .find_children(&mut record, children, view)
            .await?;
        *entity = T::from_record(record)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads through the table mapping
    // ------------------------------------------------------------------

    /// Single match with children, `None` when nothing matches. Fails with
    /// `RECORD_MULTIPLE_FOUND` on more than one match.
    pub async fn find<T: Entity>(&self, query: &Query<T>) -> Result<Option<T>> {
        self.read_one(query, FetchPlan::find()).await
    }

    /// Like `find`, failing with `RECORD_NOT_FOUND` when nothing matches.
    pub async fn find_one<T: Entity>(&self, query: &Query<T>) -> Result<T> {
        self.read_required(query, FetchPlan::find()).await
    }

    pub async fn find_lean<T: Entity>(&self, query: &Query<T>) -> Result<Option<T>> {
        self.read_one(query, FetchPlan::find_lean()).await
    }

    pub async fn find_first<T: Entity>(&self, query: &Query<T>) -> Result<Option<T>> {
        self.read_one(query, FetchPlan::find().with_pick(Pick::First)).await
    }

    pub async fn find_last<T: Entity>(&self, query: &Query<T>) -> Result<Option<T>> {
        self.read_one(query, FetchPlan::find().with_pick(Pick::Last)).await
    }

    pub async fn find_lean_first<T: Entity>(&self, query: &Query<T>) -> Result<Option<T>> {
        self.read_one(query, FetchPlan::find_lean().with_pick(Pick::First)).await
    }

    pub async fn find_lean_last<T: Entity>(&self, query: &Query<T>) -> Result<Option<T>> {
        self.read_one(query, FetchPlan::find_lean().with_pick(Pick::Last)).await
    }

    pub async fn find_by_id<T: Entity>(&self, id: i64) -> Result<T> {
        self.read_by_id(id, None, FetchPlan::find()).await
    }

    pub async fn find_by_id_version<T: Entity>(&self, id: i64, version: i64) -> Result<T> {
        self.read_by_id(id, Some(version), FetchPlan::find()).await
    }

    pub async fn find_lean_by_id<T: Entity>(&self, id: i64) -> Result<T> {
        self.read_by_id(id, None, FetchPlan::find_lean()).await
    }

    pub async fn find_lean_by_id_version<T: Entity>(&self, id: i64, version: i64) -> Result<T> {
        self.read_by_id(id, Some(version), FetchPlan::find_lean()).await
    }

    /// Every match, without children.
    pub async fn find_all<T: Entity>(&self, query: &Query<T>) -> Result<Vec<T>> {
        self.read_all(query, FetchPlan::find().with_children(ChildFetch::None)).await
    }

    pub async fn find_all_with_children<T: Entity>(&self, query: &Query<T>) -> Result<Vec<T>> {
        self.read_all(query, FetchPlan::find()).await
    }

    /// Every match keyed by `key_field`; later matches replace earlier ones
    /// with the same key.
    pub async fn find_all_map<T: Entity>(&self, key_field: &str, query: &Query<T>) -> Result<HashMap<Value, T>> {
        self.read_all_map(key_field, query, FetchPlan::find_lean()).await
    }

    pub async fn find_all_list_map<T: Entity>(
        &self,
        key_field: &str,
        query: &Query<T>,
    ) -> Result<HashMap<Value, Vec<T>>> {
        self.read_all_list_map(key_field, query, FetchPlan::find_lean()).await
    }

    pub async fn find_children<T: Entity>(&self, entity: &mut T) -> Result<()> {
        self.read_children(entity, ChildFetch::All, false).await
    }

    pub async fn find_editable_children<T: Entity>(&self, entity: &mut T) -> Result<()> {
        self.read_children(entity, ChildFetch::Editable, false).await
    }

    pub async fn find_read_only_children<T: Entity>(&self, entity: &mut T) -> Result<()> {
        self.read_children(entity, ChildFetch::ReadOnly, false).await
    }

    /// Stored entity clashing with `entity` on a unique constraint.
    pub async fn find_constraint<T: Entity>(&self, entity: &T) -> Result<Option<T>> {
        self.session()
            .await?
            .find_constraint(&entity.to_record())
            .await?
            .map(T::from_record)
            .transpose()
    }

    // ------------------------------------------------------------------
    // Reads through the list view mapping
    // ------------------------------------------------------------------

    pub async fn list<T: Entity>(&self, query: &Query<T>) -> Result<Option<T>> {
        self.read_one(query, FetchPlan::list()).await
    }

    pub async fn list_one<T: Entity>(&self, query: &Query<T>) -> Result<T> {
        self.read_required(query, FetchPlan::list()).await
    }

    pub async fn list_lean<T: Entity>(&self, query: &Query<T>) -> Result<Option<T>> {
        self.read_one(query, FetchPlan::list_lean()).await
    }

    pub async fn list_first<T: Entity>(&self, query: &Query<T>) -> Result<Option<T>> {
        self.read_one(query, FetchPlan::list().with_pick(Pick::First)).await
    }

    pub async fn list_last<T: Entity>(&self, query: &Query<T>) -> Result<Option<T>> {
        self.read_one(query, FetchPlan::list().with_pick(Pick::Last)).await
    }

    pub async fn list_by_id<T: Entity>(&self, id: i64) -> Result<T> {
        self.read_by_id(id, None, FetchPlan::list()).await
    }

    pub async fn list_by_id_version<T: Entity>(&self, id: i64, version: i64) -> Result<T> {
        self.read_by_id(id, Some(version), FetchPlan::list()).await
    }

    pub async fn list_lean_by_id<T: Entity>(&self, id: i64) -> Result<T> {
        self.read_by_id(id, None, FetchPlan::list_lean()).await
    }

    pub async fn list_all<T: Entity>(&self, query: &Query<T>) -> Result<Vec<T>> {
        self.read_all(query, FetchPlan::list().with_children(ChildFetch::None)).await
    }

    pub async fn list_all_with_children<T: Entity>(&self, query: &Query<T>) -> Result<Vec<T>> {
        self.read_all(query, FetchPlan::list()).await
    }

    pub async fn list_all_map<T: Entity>(&self, key_field: &str, query: &Query<T>) -> Result<HashMap<Value, T>> {
        self.read_all_map(key_field, query, FetchPlan::list().with_children(ChildFetch::None))
            .await
    }

    pub async fn list_all_list_map<T: Entity>(
        &self,
        key_field: &str,
        query: &Query<T>,
    ) -> Result<HashMap<Value, Vec<T>>> {
        self.read_all_list_map(key_field, query, FetchPlan::list().with_children(ChildFetch::None))
            .await
    }

    pub async fn list_children<T: Entity>(&self, entity: &mut T) -> Result<()> {
        self.read_children(entity, ChildFetch::All, true).await
    }

    // ------------------------------------------------------------------
    // Value reads and aggregates
    // ------------------------------------------------------------------

    pub async fn value<T: Entity>(&self, field: &str, query: &Query<T>) -> Result<Value> {
        self.session().await?.value(field, query.def()).await
    }

    pub async fn value_list<T: Entity>(&self, field: &str, query: &Query<T>) -> Result<Vec<Value>> {
        self.session().await?.value_list(field, query.def()).await
    }

    pub async fn value_set<T: Entity>(&self, field: &str, query: &Query<T>) -> Result<HashSet<Value>> {
        Ok(self.value_list(field, query).await?.into_iter().collect())
    }

    pub async fn value_map<T: Entity>(
        &self,
        key_field: &str,
        value_field: &str,
        query: &Query<T>,
    ) -> Result<HashMap<Value, Value>> {
        let pairs = self
            .session()
            .await?
            .value_pairs(key_field, value_field, query.def())
            .await?;
        Ok(pairs.into_iter().collect())
    }

    pub async fn value_list_map<T: Entity>(
        &self,
        key_field: &str,
        value_field: &str,
        query: &Query<T>,
    ) -> Result<HashMap<Value, Vec<Value>>> {
        let pairs = self
            .session()
            .await?
            .value_pairs(key_field, value_field, query.def())
            .await?;
        let mut map: HashMap<Value, Vec<Value>> = HashMap::new();
        for (key, value) in pairs {
            map.entry(key).or_default().push(value);
        }
        Ok(map)
    }

    pub async fn min<T: Entity>(&self, field: &str, query: &Query<T>) -> Result<Value> {
        self.session().await?.min(field, query.def()).await
    }

    pub async fn max<T: Entity>(&self, field: &str, query: &Query<T>) -> Result<Value> {
        self.session().await?.max(field, query.def()).await
    }

    pub async fn count<T: Entity>(&self, query: &Query<T>) -> Result<usize> {
        self.session().await?.count(query.def()).await
    }

    /// Number of stored records of `T`.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use unifydb::{DataSourceConfig, DatabaseTransactionManager, Entity, EntityInfo, EntityRegistry, Record};
    /// # struct Note;
    /// # impl Entity for Note {
    /// #     const ENTITY: &'static str = "note";
    /// #     fn to_record(&self) -> Record { Record::new(Self::ENTITY) }
    /// #     fn from_record(_: Record) -> unifydb::Result<Self> { Ok(Note) }
    /// # }
    /// # tokio_test::block_on(async {
    /// let registry = EntityRegistry::builder()
    ///     .register(EntityInfo::builder("note").build())
    ///     .build()?;
    /// let manager = Arc::new(DatabaseTransactionManager::default());
    /// let db = unifydb::open_memory_database(DataSourceConfig::new("notes"), registry, &manager)?;
    ///
    /// let count = manager
    ///     .transactional(unifydb::TransactionAttribute::Required, async {
    ///         db.create(&mut Note).await?;
    ///         db.count_all::<Note>().await
    ///     })
    ///     .await?;
    /// assert_eq!(count, 1);
    /// # Ok::<(), unifydb::DbError>(())
    /// # }).unwrap();
    /// ```
    pub async fn count_all<T: Entity>(&self) -> Result<usize> {
        let mut query = QueryDef::new(T::ENTITY);
        query.set_ignore_empty_criteria(true);
        self.session().await?.count(&query).await
    }

    pub async fn exists<T: Entity>(&self, query: &Query<T>) -> Result<bool> {
        Ok(self.count(query).await? > 0)
    }

    pub async fn aggregate<T: Entity>(&self, function: &AggregateFunction, query: &Query<T>) -> Result<Aggregation> {
        self.session().await?.aggregate(function, query.def()).await
    }

    pub async fn aggregate_many<T: Entity>(
        &self,
        functions: &[AggregateFunction],
        query: &Query<T>,
    ) -> Result<Vec<Aggregation>> {
        self.session().await?.aggregate_many(functions, query.def()).await
    }

    /// Aggregates per distinct combination of the query's group-by fields,
    /// in ascending grouping order.
    pub async fn aggregate_group_many<T: Entity>(
        &self,
        functions: &[AggregateFunction],
        query: &Query<T>,
    ) -> Result<Vec<GroupingAggregation>> {
        self.session()
            .await?
            .aggregate_group_many(functions, query.def())
            .await
    }

    /// Fill the list-only fields of `entity` from their foreign records.
    pub async fn populate_list_only<T: Entity>(&self, entity: &mut T) -> Result<()> {
        let mut record = entity.to_record();
        self.session().await?.populate_list_only(&mut record).await?;
        *entity = T::from_record(record)?;
        Ok(())
    }

    pub async fn get_now(&self) -> Result<NaiveDateTime> {
        self.session().await?.get_now().await
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Insert `entity` with its children. The assigned id (and any fields
    /// set by the entity policy) are written back to `entity`.
    pub async fn create<T: Entity>(&self, entity: &mut T) -> Result<i64> {
        let mut record = entity.to_record();
        let id = self
            .session()
            .await?
            .create(&mut record, ChildFetch::All)
            .await?;
        *entity = T::from_record(record)?;
        Ok(id)
    }

    /// Update `entity` by id, replacing the child slots selected by
    /// `children`. With `version_check` a stale version fails with
    /// `RECORD_WITH_PK_VERSION_NOT_FOUND`.
    pub async fn update_by_id_with<T: Entity>(
        &self,
        entity: &mut T,
        version_check: bool,
        children: ChildFetch,
    ) -> Result<usize> {
        let mut record = entity.to_record();
        let result = self
            .session()
            .await?
            .update_by_id(&mut record, version_check, children)
            .await;
        write_back(entity, record, result)
    }

    pub async fn update_by_id<T: Entity>(&self, entity: &mut T) -> Result<usize> {
        self.update_by_id_with(entity, false, ChildFetch::All).await
    }

    pub async fn update_by_id_editable_children<T: Entity>(&self, entity: &mut T) -> Result<usize> {
        self.update_by_id_with(entity, false, ChildFetch::Editable).await
    }

    pub async fn update_by_id_read_only_children<T: Entity>(&self, entity: &mut T) -> Result<usize> {
        self.update_by_id_with(entity, false, ChildFetch::ReadOnly).await
    }

    pub async fn update_lean_by_id<T: Entity>(&self, entity: &mut T) -> Result<usize> {
        self.update_by_id_with(entity, false, ChildFetch::None).await
    }

    pub async fn update_by_id_version<T: Entity>(&self, entity: &mut T) -> Result<usize> {
        self.update_by_id_with(entity, true, ChildFetch::All).await
    }

    pub async fn update_by_id_version_editable_children<T: Entity>(&self, entity: &mut T) -> Result<usize> {
        self.update_by_id_with(entity, true, ChildFetch::Editable).await
    }

    pub async fn update_lean_by_id_version<T: Entity>(&self, entity: &mut T) -> Result<usize> {
        self.update_by_id_with(entity, true, ChildFetch::None).await
    }

    /// Assign the fields of `update` on the record of `T` with `id`.
    /// Returns zero when there is no such record.
    pub async fn update_fields_by_id<T: Entity>(&self, id: i64, update: &Update) -> Result<usize> {
        self.session()
            .await?
            .update_fields_by_id(T::ENTITY, id, update)
            .await
    }

    pub async fn update_all<T: Entity>(&self, query: &Query<T>, update: &Update) -> Result<usize> {
        self.session().await?.update_all(query.def(), update).await
    }

    /// Delete `entity` and all its children.
    pub async fn delete_by_id<T: Entity>(&self, entity: &T) -> Result<usize> {
        self.session()
            .await?
            .delete_by_id(&entity.to_record(), false)
            .await
    }

    pub async fn delete_by_id_version<T: Entity>(&self, entity: &T) -> Result<usize> {
        self.session()
            .await?
            .delete_by_id(&entity.to_record(), true)
            .await
    }

    pub async fn delete<T: Entity>(&self, id: i64) -> Result<usize> {
        self.session().await?.delete(T::ENTITY, id).await
    }

    pub async fn delete_all<T: Entity>(&self, query: &Query<T>) -> Result<usize> {
        self.session().await?.delete_all(query.def()).await
    }
}

/// Convert the session's copy of the record back into the entity, on
/// failure too, so policy rollbacks such as a restored version number reach
/// the caller.
fn write_back<T: Entity>(entity: &mut T, record: Record, result: Result<usize>) -> Result<usize> {
    match result {
        Ok(count) => {
            *entity = T::from_record(record)?;
            Ok(count)
        }
        Err(err) => {
            if let Ok(restored) = T::from_record(record) {
                *entity = restored;
            }
            Err(err)
        }
    }
}
