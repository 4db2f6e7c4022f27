// ============================================================================
// In-Memory Data Source
// ============================================================================
//
// Committed rows live in a shared store of persistent `im` tables. Every
// session keeps a private overlay of the rows it changed; reads merge the
// committed store with that overlay, commit folds the overlay into the store
// and rollback discards it. Because the overlay is itself a persistent map a
// savepoint is a cheap clone of it.
//
// Each statement runs against a copy of the overlay and only replaces it on
// success, so a failing statement leaves no partial writes behind.
//
// Writers never overwrite each other silently. Touching a committed row or a
// unique key takes a claim owned by the session until it commits or rolls
// back; a second session asking for the same claim fails at once. Commit then
// re-checks, under the store write lock, that every committed row the session
// touched still exists with the version it first saw and that no unique key
// is duplicated. A failed check publishes nothing.
//
// ============================================================================

use super::eval::Evaluator;
use super::{ChildFetch, DataSource, DatabaseSession, FetchPlan, Pick};
use crate::config::DataSourceConfig;
use crate::core::{DbError, ErrorCode, ID_FIELD, Record, Result, Value};
use crate::criteria::{CompareOp, Restriction};
use crate::dialect::{SqlDialect, SqlStatement};
use crate::entity::{ChildCardinality, EntityInfo, EntityRegistry};
use crate::query::{
    AggregateFunction, AggregateType, Aggregation, Grouping, GroupingAggregation, Order, OrderType,
    QueryDef, Update,
};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

type Table = im::OrdMap<i64, Record>;
type Tables = im::HashMap<String, Table>;
type Changes = im::HashMap<String, im::OrdMap<i64, Option<Record>>>;
/// Version of each committed row as first seen by the session.
type Basis = im::HashMap<String, im::OrdMap<i64, Option<i64>>>;

/// Uncommitted work of one session.
#[derive(Debug, Clone, Default)]
struct Overlay {
    rows: Changes,
    basis: Basis,
}

impl Overlay {
    fn written(&self) -> usize {
        self.rows.values().map(|rows| rows.len()).sum()
    }
}

/// Something only one session at a time may write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Claim {
    Row {
        entity: String,
        id: i64,
    },
    Key {
        entity: String,
        constraint: usize,
        values: Vec<Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claimed {
    Taken,
    Held,
    Refused,
}

/// State shared by a data source and every session it opened.
struct Shared {
    store: RwLock<Tables>,
    claims: std::sync::Mutex<HashMap<Claim, u64>>,
    sequence: AtomicI64,
    next_session: AtomicU64,
    open_sessions: AtomicUsize,
    max_connections: usize,
}

impl Shared {
    fn release_slot(&self) {
        let _ = self
            .open_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn claim(&self, claim: Claim, owner: u64) -> Result<Claimed> {
        let mut claims = self.claims.lock()?;
        Ok(match claims.get(&claim) {
            Some(holder) if *holder == owner => Claimed::Held,
            Some(_) => Claimed::Refused,
            None => {
                claims.insert(claim, owner);
                Claimed::Taken
            }
        })
    }

    fn release(&self, taken: &[Claim]) -> Result<()> {
        let mut claims = self.claims.lock()?;
        for claim in taken {
            claims.remove(claim);
        }
        Ok(())
    }

    fn release_all(&self, owner: u64) -> Result<()> {
        self.claims.lock()?.retain(|_, holder| *holder != owner);
        Ok(())
    }
}

/// Data source keeping committed rows in memory.
pub struct MemoryDataSource {
    config: DataSourceConfig,
    dialect: Arc<dyn SqlDialect>,
    registry: Arc<EntityRegistry>,
    shared: Arc<Shared>,
}

impl MemoryDataSource {
    pub fn new(config: DataSourceConfig, registry: Arc<EntityRegistry>) -> Result<Self> {
        config.validate()?;
        let dialect = config.dialect.create(config.policies());

        info!(
            data_source = %config.name,
            dialect = dialect.name(),
            max_connections = config.max_connections,
            "Created in-memory data source"
        );

        let shared = Arc::new(Shared {
            store: RwLock::new(Tables::new()),
            claims: std::sync::Mutex::new(HashMap::new()),
            sequence: AtomicI64::new(0),
            next_session: AtomicU64::new(0),
            open_sessions: AtomicUsize::new(0),
            max_connections: config.max_connections,
        });

        Ok(Self {
            config,
            dialect,
            registry,
            shared,
        })
    }

    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    /// Number of sessions currently holding a connection slot.
    pub fn open_sessions(&self) -> usize {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }

    /// Number of committed rows of `entity`.
    pub async fn committed_rows(&self, entity: &str) -> usize {
        self.shared
            .store
            .read()
            .await
            .get(entity)
            .map_or(0, |table| table.len())
    }

    fn acquire_slot(&self) -> Result<()> {
        let max = self.shared.max_connections;
        self.shared
            .open_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|open| {
                DbError::coded(
                    ErrorCode::DatasourceConnectionUnavailable,
                    format!(
                        "Data source '{}' has no free connection ({} of {} in use)",
                        self.config.name, open, max
                    ),
                )
            })
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn dialect(&self) -> Arc<dyn SqlDialect> {
        Arc::clone(&self.dialect)
    }

    fn registry(&self) -> Arc<EntityRegistry> {
        Arc::clone(&self.registry)
    }

    async fn create_session(&self) -> Result<Arc<dyn DatabaseSession>> {
        self.acquire_slot()?;
        debug!(data_source = %self.config.name, open = self.open_sessions(), "Opened session");
        Ok(Arc::new(MemoryDatabaseSession {
            id: self.shared.next_session.fetch_add(1, Ordering::SeqCst),
            name: self.config.name.clone(),
            dialect: Arc::clone(&self.dialect),
            registry: Arc::clone(&self.registry),
            app_query_limit: self.config.app_query_limit,
            shared: Arc::clone(&self.shared),
            state: Mutex::new(SessionState::default()),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Default)]
struct SessionState {
    overlay: Overlay,
    savepoints: Vec<Overlay>,
}

/// Session over a `MemoryDataSource`.
pub struct MemoryDatabaseSession {
    id: u64,
    name: String,
    dialect: Arc<dyn SqlDialect>,
    registry: Arc<EntityRegistry>,
    app_query_limit: Option<i32>,
    shared: Arc<Shared>,
    state: Mutex<SessionState>,
    closed: AtomicBool,
}

impl MemoryDatabaseSession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::coded(
                ErrorCode::DatasourceSessionIsClosed,
                format!("Session on data source '{}' is closed", self.name),
            ));
        }
        Ok(())
    }

    /// Run one statement against a copy of the session overlay.
    async fn run<R, F>(&self, statement: F) -> Result<R>
    where
        F: FnOnce(&mut Workspace<'_>) -> Result<R> + Send,
    {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let base = self.shared.store.read().await.clone();
        let mut workspace = Workspace {
            session: self,
            base,
            overlay: state.overlay.clone(),
            taken: Vec::new(),
            now: Utc::now().naive_utc(),
        };
        match statement(&mut workspace) {
            Ok(result) => {
                state.overlay = workspace.overlay;
                Ok(result)
            }
            Err(err) => {
                self.shared.release(&workspace.taken)?;
                Err(err)
            }
        }
    }
}

impl Drop for MemoryDatabaseSession {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shared.release_all(self.id);
            self.shared.release_slot();
        }
    }
}

#[async_trait]
impl DatabaseSession for MemoryDatabaseSession {
    fn data_source_name(&self) -> &str {
        &self.name
    }

    async fn create(&self, record: &mut Record, children: ChildFetch) -> Result<i64> {
        self.run(|ws| ws.create(record, children)).await
    }

    async fn find_by_id(
        &self,
        entity: &str,
        id: i64,
        version: Option<i64>,
        plan: FetchPlan,
    ) -> Result<Record> {
        self.run(|ws| ws.find_by_id(entity, id, version, plan)).await
    }

    async fn find(&self, query: &QueryDef, plan: FetchPlan) -> Result<Option<Record>> {
        self.run(|ws| ws.find(query, plan)).await
    }

    async fn find_all(&self, query: &QueryDef, plan: FetchPlan) -> Result<Vec<Record>> {
        self.run(|ws| ws.find_all(query, plan)).await
    }

    async fn find_constraint(&self, record: &Record) -> Result<Option<Record>> {
        self.run(|ws| ws.find_constraint(record)).await
    }

    async fn find_children(&self, record: &mut Record, children: ChildFetch, view: bool) -> Result<()> {
        self.run(|ws| {
            let info = ws.info(record.entity())?;
            ws.fetch_children(&info, record, children, view, None)
        })
        .await
    }

    async fn populate_list_only(&self, record: &mut Record) -> Result<()> {
        self.run(|ws| ws.populate_list_only(record)).await
    }

    async fn value(&self, field: &str, query: &QueryDef) -> Result<Value> {
        self.run(|ws| ws.value(field, query)).await
    }

    async fn value_list(&self, field: &str, query: &QueryDef) -> Result<Vec<Value>> {
        self.run(|ws| ws.value_list(field, query)).await
    }

    async fn value_pairs(
        &self,
        key_field: &str,
        value_field: &str,
        query: &QueryDef,
    ) -> Result<Vec<(Value, Value)>> {
        self.run(|ws| ws.value_pairs(key_field, value_field, query))
            .await
    }

    async fn min(&self, field: &str, query: &QueryDef) -> Result<Value> {
        let function = AggregateFunction::minimum(field);
        self.run(|ws| ws.aggregate(&function, query).map(|a| a.value))
            .await
    }

    async fn max(&self, field: &str, query: &QueryDef) -> Result<Value> {
        let function = AggregateFunction::maximum(field);
        self.run(|ws| ws.aggregate(&function, query).map(|a| a.value))
            .await
    }

    async fn count(&self, query: &QueryDef) -> Result<usize> {
        self.run(|ws| ws.count(query)).await
    }

    async fn aggregate(&self, function: &AggregateFunction, query: &QueryDef) -> Result<Aggregation> {
        self.run(|ws| ws.aggregate(function, query)).await
    }

    async fn aggregate_many(
        &self,
        functions: &[AggregateFunction],
        query: &QueryDef,
    ) -> Result<Vec<Aggregation>> {
        self.run(|ws| {
            functions
                .iter()
                .map(|function| ws.aggregate(function, query))
                .collect()
        })
        .await
    }

    async fn aggregate_group_many(
        &self,
        functions: &[AggregateFunction],
        query: &QueryDef,
    ) -> Result<Vec<GroupingAggregation>> {
        self.run(|ws| ws.aggregate_group_many(functions, query))
            .await
    }

    async fn update_by_id(
        &self,
        record: &mut Record,
        version_check: bool,
        children: ChildFetch,
    ) -> Result<usize> {
        self.run(|ws| ws.update_by_id(record, version_check, children))
            .await
    }

    async fn update_fields_by_id(&self, entity: &str, id: i64, update: &Update) -> Result<usize> {
        self.run(|ws| ws.update_fields_by_id(entity, id, update))
            .await
    }

    async fn update_all(&self, query: &QueryDef, update: &Update) -> Result<usize> {
        self.run(|ws| ws.update_all(query, update)).await
    }

    async fn delete_by_id(&self, record: &Record, version_check: bool) -> Result<usize> {
        self.run(|ws| ws.delete_by_id(record, version_check)).await
    }

    async fn delete(&self, entity: &str, id: i64) -> Result<usize> {
        self.run(|ws| ws.delete(entity, id)).await
    }

    async fn delete_all(&self, query: &QueryDef) -> Result<usize> {
        self.run(|ws| ws.delete_all(query)).await
    }

    async fn get_now(&self) -> Result<NaiveDateTime> {
        self.ensure_open()?;
        Ok(Utc::now().naive_utc())
    }

    async fn set_savepoint(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let snapshot = state.overlay.clone();
        state.savepoints.push(snapshot);
        debug!(data_source = %self.name, depth = state.savepoints.len(), "Set savepoint");
        Ok(())
    }

    async fn clear_savepoint(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        state
            .savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| DbError::InvalidState(format!("Session on '{}' has no savepoint to clear", self.name)))
    }

    async fn rollback_to_savepoint(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let savepoint = state.savepoints.last().cloned().ok_or_else(|| {
            DbError::InvalidState(format!("Session on '{}' has no savepoint to roll back to", self.name))
        })?;
        state.overlay = savepoint;
        debug!(data_source = %self.name, depth = state.savepoints.len(), "Rolled back to savepoint");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let overlay = std::mem::take(&mut state.overlay);
        state.savepoints.clear();

        let published = {
            let mut store = self.shared.store.write().await;
            let published = publish(&store, &overlay, &self.registry).map(|tables| *store = tables);
            self.shared.release_all(self.id)?;
            published
        };
        if let Err(err) = published {
            warn!(data_source = %self.name, error = %err, "Commit rejected, changes discarded");
            return Err(err);
        }
        debug!(data_source = %self.name, rows = overlay.written(), "Committed session");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        *state = SessionState::default();
        self.shared.release_all(self.id)?;
        debug!(data_source = %self.name, "Rolled back session");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        *state = SessionState::default();
        self.shared.release_all(self.id)?;
        self.shared.release_slot();
        debug!(data_source = %self.name, "Closed session");
        Ok(())
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Committed rows plus this session's overlay, as seen by one statement.
struct Workspace<'a> {
    session: &'a MemoryDatabaseSession,
    base: Tables,
    overlay: Overlay,
    /// Claims first taken by the running statement.
    taken: Vec<Claim>,
    now: NaiveDateTime,
}

impl Workspace<'_> {
    fn info(&self, entity: &str) -> Result<Arc<EntityInfo>> {
        self.session.registry.get(entity).map(Arc::clone)
    }

    fn dialect(&self) -> &dyn SqlDialect {
        self.session.dialect.as_ref()
    }

    fn trace(&self, operation: &str, statement: &SqlStatement) {
        debug!(
            data_source = %self.session.name,
            operation,
            sql = %statement.sql,
            params = statement.params.len(),
            "Executing statement"
        );
    }

    fn policy_now(&self, info: &EntityInfo) -> Option<NaiveDateTime> {
        info.policy()
            .filter(|policy| policy.is_set_now())
            .map(|_| self.now)
    }

    // ------------------------------------------------------------------
    // Row access
    // ------------------------------------------------------------------

    fn rows(&self, entity: &str) -> Table {
        let mut table = self.base.get(entity).cloned().unwrap_or_default();
        if let Some(changed) = self.overlay.rows.get(entity) {
            for (id, row) in changed.iter() {
                match row {
                    Some(row) => {
                        table.insert(*id, row.clone());
                    }
                    None => {
                        table.remove(id);
                    }
                }
            }
        }
        table
    }

    /// Stage a write of `row` (or a delete when `None`) for `entity`/`id`.
    fn put(&mut self, entity: &str, id: i64, row: Option<Record>) -> Result<()> {
        let info = self.info(entity)?;
        if let Some(row) = &row {
            if !info.unique_constraints().is_empty() {
                let others = self.rows(entity).without(&id);
                if let Some(constraint) = unique_clash(&info, &others, row) {
                    return Err(unique_violation(&info, constraint));
                }
            }
        }

        let committed = self.base.get(entity).and_then(|table| table.get(&id)).cloned();
        if let Some(committed) = committed {
            let claim = Claim::Row {
                entity: entity.to_string(),
                id,
            };
            self.take(claim, || row_conflict(&info, id))?;

            let mut basis = self.overlay.basis.get(entity).cloned().unwrap_or_default();
            if !basis.contains_key(&id) {
                let version = info.version_field().and_then(|f| committed.get(f).as_i64());
                basis.insert(id, version);
                self.overlay.basis.insert(entity.to_string(), basis);
            }
        }

        if let Some(row) = &row {
            for (index, constraint) in info.unique_constraints().iter().enumerate() {
                let values: Vec<Value> = constraint.iter().map(|f| row.get(f).clone()).collect();
                if values.iter().any(Value::is_null) {
                    continue;
                }
                let claim = Claim::Key {
                    entity: entity.to_string(),
                    constraint: index,
                    values,
                };
                self.take(claim, || unique_violation(&info, constraint))?;
            }
        }

        let mut table = self.overlay.rows.get(entity).cloned().unwrap_or_default();
        table.insert(id, row);
        self.overlay.rows.insert(entity.to_string(), table);
        Ok(())
    }

    fn take(&mut self, claim: Claim, refused: impl FnOnce() -> DbError) -> Result<()> {
        match self.session.shared.claim(claim.clone(), self.session.id)? {
            Claimed::Taken => {
                self.taken.push(claim);
                Ok(())
            }
            Claimed::Held => Ok(()),
            Claimed::Refused => Err(refused()),
        }
    }

    fn next_id(&self) -> i64 {
        self.session.shared.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stored form: mapped fields only, forward-transformed.
    fn to_stored(info: &EntityInfo, record: &Record) -> Result<Record> {
        let mut stored = Record::new(info.name());
        for field in info.fields() {
            stored.set(field.name.clone(), field.forward(record.get(&field.name))?);
        }
        Ok(stored)
    }

    fn to_public(info: &EntityInfo, stored: &Record) -> Result<Record> {
        let mut record = Record::new(info.name());
        for (name, value) in stored.fields() {
            let value = match info.field(name) {
                Some(field) => field.reverse(value)?,
                None => value.clone(),
            };
            record.set(name.clone(), value);
        }
        Ok(record)
    }

    fn public_value(info: &EntityInfo, field: &str, stored: &Record) -> Result<Value> {
        match info.field(field) {
            Some(field_info) => field_info.reverse(stored.get(field)),
            None => Ok(stored.get(field).clone()),
        }
    }

    /// Fill list-only fields from their foreign records. With `strict` a
    /// dangling key is an error, otherwise the field reads as NULL.
    fn resolve_list_only(&self, info: &EntityInfo, record: &mut Record, strict: bool) -> Result<()> {
        for list_only in info.list_only() {
            let Some(key) = record.get(&list_only.key).as_i64() else {
                if !strict {
                    record.set(list_only.name.clone(), Value::Null);
                }
                continue;
            };

            let foreign_info = self.info(&list_only.foreign_entity)?;
            match self.rows(&list_only.foreign_entity).get(&key) {
                Some(foreign) => {
                    let value = Self::public_value(&foreign_info, &list_only.property, foreign)?;
                    record.set(list_only.name.clone(), value);
                }
                None if strict => {
                    return Err(DbError::coded(
                        ErrorCode::RecordWithPkNotFound,
                        format!(
                            "Record of '{}' with id {} not found",
                            list_only.foreign_entity, key
                        ),
                    ));
                }
                None => record.set(list_only.name.clone(), Value::Null),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Query evaluation
    // ------------------------------------------------------------------

    /// Stored rows matching the criteria of `query`, ordered, with the
    /// min/max property applied and optionally paginated.
    fn matching(
        &self,
        info: &EntityInfo,
        query: &QueryDef,
        view: bool,
        paginate: bool,
    ) -> Result<Vec<Record>> {
        let evaluator = Evaluator::new(info);
        let mut rows = Vec::new();
        for (_, stored) in self.rows(info.name()).iter() {
            let mut row = stored.clone();
            if view {
                self.resolve_list_only(info, &mut row, false)?;
            }
            if evaluator.matches_criteria(&row, query.criteria())? {
                rows.push(row);
            }
        }

        if let Some(field) = query.min_property() {
            rows = keep_extreme(rows, field, CmpOrdering::Less)?;
        }
        if let Some(field) = query.max_property() {
            rows = keep_extreme(rows, field, CmpOrdering::Greater)?;
        }

        sort_rows(&mut rows, query.order())?;
        Ok(if paginate {
            self.paginate(rows, query)
        } else {
            rows
        })
    }

    fn paginate<T>(&self, rows: Vec<T>, query: &QueryDef) -> Vec<T> {
        let limit = if query.is_limit() {
            Some(query.limit())
        } else if query.is_apply_app_query_limit() {
            self.session.app_query_limit
        } else {
            None
        };
        let offset = if query.is_offset() { query.offset() as usize } else { 0 };
        let rows = rows.into_iter().skip(offset);
        match limit {
            Some(limit) => rows.take(limit as usize).collect(),
            None => rows.collect(),
        }
    }

    fn prepared(&self, info: &EntityInfo, query: &QueryDef) -> Result<QueryDef> {
        let mut query = query.clone();
        if let Some(policy) = info.policy() {
            policy.pre_query(&mut query)?;
        }
        Ok(query)
    }

    /// Public records for `query`, projected onto the select list.
    fn select(&self, query: &QueryDef, view: bool, lean: bool) -> Result<Vec<Record>> {
        let info = self.info(query.entity())?;
        let query = self.prepared(&info, query)?;
        let statement = self.dialect().prepare_find(&info, &query, view)?;
        self.trace("find", &statement);

        let distinct = query.is_distinct();
        let rows = self.matching(&info, &query, view, !distinct)?;
        let select = query.select().filter(|s| !s.is_empty());

        let mut records = Vec::with_capacity(rows.len());
        let mut seen = HashSet::new();
        for row in rows {
            let mut record = Self::to_public(&info, &row)?;
            if let Some(select) = select {
                let mut projected = Record::new(info.name());
                for field in select.fields() {
                    projected.set(field.clone(), record.get(field).clone());
                }
                record = projected;
            } else if view && lean {
                for list_only in info.list_only() {
                    record.remove(&list_only.name);
                }
            }

            if distinct {
                let key: Vec<Value> = record.fields().values().cloned().collect();
                if !seen.insert(key) {
                    continue;
                }
            }
            records.push(record);
        }

        Ok(if distinct {
            self.paginate(records, &query)
        } else {
            records
        })
    }

    fn require_mutation_criteria(&self, query: &QueryDef, operation: &str) -> Result<()> {
        if query.is_empty_criteria() && !query.is_ignore_empty_criteria() {
            return Err(DbError::coded(
                ErrorCode::EmptyCriteria,
                format!(
                    "{} on '{}' without criteria requires ignore_empty_criteria",
                    operation,
                    query.entity()
                ),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn find_by_id(
        &self,
        entity: &str,
        id: i64,
        version: Option<i64>,
        plan: FetchPlan,
    ) -> Result<Record> {
        let info = self.info(entity)?;
        let mut query = QueryDef::new(entity);
        query.add_restriction(Restriction::compare(CompareOp::Equals, ID_FIELD, id));
        if let (Some(version), Some(field)) = (version, info.version_field()) {
            query.add_restriction(Restriction::compare(CompareOp::Equals, field, version));
        }
        let statement = self.dialect().prepare_find(&info, &query, plan.is_view())?;
        self.trace("find_by_id", &statement);

        let not_found = || match version {
            Some(version) => DbError::coded(
                ErrorCode::RecordWithPkVersionNotFound,
                format!("Record of '{}' with id {} and version {} not found", entity, id, version),
            ),
            None => DbError::coded(
                ErrorCode::RecordWithPkNotFound,
                format!("Record of '{}' with id {} not found", entity, id),
            ),
        };

        let mut stored = self.rows(entity).get(&id).cloned().ok_or_else(not_found)?;
        if let (Some(version), Some(field)) = (version, info.version_field()) {
            if stored.get(field).as_i64() != Some(version) {
                return Err(not_found());
            }
        }

        if plan.is_view() {
            self.resolve_list_only(&info, &mut stored, false)?;
        }
        let mut record = Self::to_public(&info, &stored)?;
        if plan.is_view() && plan.lean {
            for list_only in info.list_only() {
                record.remove(&list_only.name);
            }
        }
        if !plan.lean {
            self.fetch_children(&info, &mut record, plan.children, plan.is_view(), None)?;
        }
        Ok(record)
    }

    fn find(&self, query: &QueryDef, plan: FetchPlan) -> Result<Option<Record>> {
        let mut records = self.select(query, plan.is_view(), plan.lean)?;
        let record = match plan.pick {
            Pick::Single if records.len() > 1 => {
                return Err(DbError::coded(
                    ErrorCode::RecordMultipleFound,
                    format!(
                        "{} records of '{}' match a single-record query",
                        records.len(),
                        query.entity()
                    ),
                ));
            }
            Pick::Single | Pick::First => {
                if records.is_empty() {
                    None
                } else {
                    Some(records.swap_remove(0))
                }
            }
            Pick::Last => records.pop(),
        };

        match record {
            Some(mut record) => {
                if !plan.lean {
                    let info = self.info(query.entity())?;
                    self.fetch_children(&info, &mut record, plan.children, plan.is_view(), query.select())?;
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn find_all(&self, query: &QueryDef, plan: FetchPlan) -> Result<Vec<Record>> {
        let mut records = self.select(query, plan.is_view(), plan.lean)?;
        if !plan.lean && plan.children != ChildFetch::None {
            let info = self.info(query.entity())?;
            for record in &mut records {
                self.fetch_children(&info, record, plan.children, plan.is_view(), query.select())?;
            }
        }
        Ok(records)
    }

    fn fetch_children(
        &self,
        info: &EntityInfo,
        record: &mut Record,
        children: ChildFetch,
        view: bool,
        select: Option<&crate::query::Select>,
    ) -> Result<()> {
        let Some(id) = record.id() else {
            return Ok(());
        };
        let select = select.filter(|s| !s.is_empty());

        for child in info.children() {
            if !children.includes(child.kind) {
                continue;
            }
            if select.is_some_and(|s| !s.fields().contains(&child.name)) {
                continue;
            }

            let mut query = QueryDef::new(&child.child_entity);
            query.add_restriction(Restriction::compare(CompareOp::Equals, &child.fk_field, id));
            query.add_order(ID_FIELD, OrderType::Ascending);
            let mut rows = self.select(&query, view, false)?;

            let child_info = self.info(&child.child_entity)?;
            for row in &mut rows {
                self.fetch_children(&child_info, row, children, view, None)?;
            }

            match child.cardinality {
                ChildCardinality::Single => {
                    if rows.len() > 1 {
                        return Err(DbError::coded(
                            ErrorCode::RecordMultipleChildFound,
                            format!(
                                "Record of '{}' with id {} has {} '{}' children",
                                info.name(),
                                id,
                                rows.len(),
                                child.name
                            ),
                        ));
                    }
                    record.set_child(child.name.clone(), rows.pop());
                }
                ChildCardinality::Many => record.set_child_list(child.name.clone(), rows),
            }
        }
        Ok(())
    }

    fn find_constraint(&self, record: &Record) -> Result<Option<Record>> {
        let info = self.info(record.entity())?;
        for constraint in info.unique_constraints() {
            let mut query = QueryDef::new(info.name());
            for field in constraint {
                query.add_restriction(Restriction::compare(
                    CompareOp::Equals,
                    field,
                    record.get(field).clone(),
                ));
            }
            if let Some(found) = self.select(&query, false, true)?.into_iter().next() {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn populate_list_only(&self, record: &mut Record) -> Result<()> {
        let info = self.info(record.entity())?;
        self.resolve_list_only(&info, record, true)
    }

    fn value(&self, field: &str, query: &QueryDef) -> Result<Value> {
        let mut values = self.value_list(field, query)?;
        match values.len() {
            0 if query.is_must_match() => Err(DbError::coded(
                ErrorCode::RecordAtLeastOneValueExpected,
                format!("No value of '{}.{}' matches the query", query.entity(), field),
            )),
            0 => Ok(Value::Null),
            1 => Ok(values.swap_remove(0)),
            n => Err(DbError::coded(
                ErrorCode::RecordMultipleFound,
                format!("{} values of '{}.{}' match a single-value query", n, query.entity(), field),
            )),
        }
    }

    fn value_list(&self, field: &str, query: &QueryDef) -> Result<Vec<Value>> {
        let mut value_query = query.clone();
        value_query.clear_select();
        value_query.add_select(field);
        value_query.set_distinct(query.is_distinct());
        Ok(self
            .select(&value_query, true, false)?
            .into_iter()
            .map(|record| record.get(field).clone())
            .collect())
    }

    fn value_pairs(
        &self,
        key_field: &str,
        value_field: &str,
        query: &QueryDef,
    ) -> Result<Vec<(Value, Value)>> {
        let mut pair_query = query.clone();
        pair_query.clear_select();
        pair_query.add_select(key_field);
        pair_query.add_select(value_field);
        pair_query.set_distinct(query.is_distinct());
        Ok(self
            .select(&pair_query, true, false)?
            .into_iter()
            .map(|record| (record.get(key_field).clone(), record.get(value_field).clone()))
            .collect())
    }

    fn count(&self, query: &QueryDef) -> Result<usize> {
        let info = self.info(query.entity())?;
        let query = self.prepared(&info, query)?;
        let statement = self.dialect().prepare_count(&info, &query)?;
        self.trace("count", &statement);
        Ok(self.matching(&info, &query, false, false)?.len())
    }

    fn aggregate(&self, function: &AggregateFunction, query: &QueryDef) -> Result<Aggregation> {
        let info = self.info(query.entity())?;
        let query = self.prepared(&info, query)?;
        let statement = self
            .dialect()
            .prepare_aggregate(&info, std::slice::from_ref(function), &query)?;
        self.trace("aggregate", &statement);

        let values = self
            .matching(&info, &query, false, false)?
            .iter()
            .map(|row| Self::public_value(&info, &function.field, row))
            .collect::<Result<Vec<_>>>()?;
        Ok(Aggregation {
            function: function.clone(),
            value: aggregate_values(function, &values)?,
        })
    }

    fn aggregate_group_many(
        &self,
        functions: &[AggregateFunction],
        query: &QueryDef,
    ) -> Result<Vec<GroupingAggregation>> {
        let info = self.info(query.entity())?;
        let query = self.prepared(&info, query)?;
        let group_fields = match query.group_by().filter(|g| !g.is_empty()) {
            Some(group_by) => group_by.fields().to_vec(),
            None => {
                return Err(DbError::InvalidArgument(format!(
                    "Grouped aggregation on '{}' requires at least one group-by field",
                    query.entity()
                )));
            }
        };
        let statement = self.dialect().prepare_aggregate(&info, functions, &query)?;
        self.trace("aggregate_group", &statement);

        let mut groups: BTreeMap<Vec<Grouping>, Vec<Record>> = BTreeMap::new();
        for row in self.matching(&info, &query, false, false)? {
            let key = group_fields
                .iter()
                .map(|field| Self::public_value(&info, field, &row).map(|v| Grouping::from_value(&v)))
                .collect::<Result<Vec<_>>>()?;
            groups.entry(key).or_default().push(row);
        }

        let mut result = Vec::with_capacity(groups.len());
        for (groupings, rows) in groups {
            let mut aggregations = Vec::with_capacity(functions.len());
            for function in functions {
                let values = rows
                    .iter()
                    .map(|row| Self::public_value(&info, &function.field, row))
                    .collect::<Result<Vec<_>>>()?;
                aggregations.push(Aggregation {
                    function: function.clone(),
                    value: aggregate_values(function, &values)?,
                });
            }
            result.push(GroupingAggregation {
                groupings,
                aggregations,
            });
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    fn create(&mut self, record: &mut Record, children: ChildFetch) -> Result<i64> {
        let info = self.info(record.entity())?;
        let result = self.create_record(&info, record, children);
        if result.is_err() {
            if let Some(policy) = info.policy() {
                policy.on_create_error(record);
            }
        }
        result
    }

    fn create_record(&mut self, info: &EntityInfo, record: &mut Record, children: ChildFetch) -> Result<i64> {
        let assigned = match info.policy() {
            Some(policy) => policy.pre_create(record, self.policy_now(info))?,
            None => None,
        };
        let id = match assigned {
            Some(id) => id,
            None => self.next_id(),
        };
        record.set_id(id);

        let rows = self.rows(info.name());
        if rows.contains_key(&id) {
            return Err(DbError::ExecutionError(format!(
                "Duplicate id {} for '{}'",
                id,
                info.name()
            )));
        }

        let stored = Self::to_stored(info, record)?;
        let statement = self.dialect().prepare_create(info, record)?;
        self.trace("create", &statement);
        self.put(info.name(), id, Some(stored))?;

        self.create_children(info, record, id, children)?;
        Ok(id)
    }

    fn create_children(
        &mut self,
        info: &EntityInfo,
        record: &mut Record,
        id: i64,
        children: ChildFetch,
    ) -> Result<()> {
        for child in info.children() {
            if !children.includes(child.kind) {
                continue;
            }
            let Some(slot) = record.child(&child.name) else {
                continue;
            };

            let mut created = Vec::new();
            for child_record in slot.records() {
                let mut child_record = child_record.clone();
                child_record.set(child.fk_field.clone(), id);
                self.create(&mut child_record, children)?;
                created.push(child_record);
            }

            match child.cardinality {
                ChildCardinality::Single => record.set_child(child.name.clone(), created.pop()),
                ChildCardinality::Many => record.set_child_list(child.name.clone(), created),
            }
        }
        Ok(())
    }

    /// Delete every child row of the parent with `id`, recursively.
    fn delete_children(&mut self, info: &EntityInfo, id: i64, children: ChildFetch) -> Result<()> {
        for child in info.children() {
            if !children.includes(child.kind) {
                continue;
            }
            let child_info = self.info(&child.child_entity)?;
            let child_ids: Vec<i64> = self
                .rows(&child.child_entity)
                .iter()
                .filter(|(_, row)| row.get(&child.fk_field).as_i64() == Some(id))
                .map(|(child_id, _)| *child_id)
                .collect();
            for child_id in child_ids {
                self.delete_children(&child_info, child_id, ChildFetch::All)?;
                self.put(&child.child_entity, child_id, None)?;
            }
        }
        Ok(())
    }

    fn update_by_id(&mut self, record: &mut Record, version_check: bool, children: ChildFetch) -> Result<usize> {
        let info = self.info(record.entity())?;
        let old_version = info.version_field().and_then(|f| record.get(f).as_i64());
        let result = self.update_record(&info, record, old_version, version_check, children);
        if result.is_err() {
            if let Some(policy) = info.policy() {
                policy.on_update_error(record);
            }
        }
        result
    }

    fn update_record(
        &mut self,
        info: &EntityInfo,
        record: &mut Record,
        old_version: Option<i64>,
        version_check: bool,
        children: ChildFetch,
    ) -> Result<usize> {
        if let Some(policy) = info.policy() {
            policy.pre_update(record, self.policy_now(info))?;
        }
        let id = record.id().ok_or_else(|| {
            DbError::InvalidArgument(format!("Record of '{}' has no id", info.name()))
        })?;

        let version_field = info.version_field().filter(|_| version_check);
        let statement = self.dialect().prepare_update_by_id(
            info,
            record,
            version_field.and(old_version),
        )?;
        self.trace("update_by_id", &statement);

        let matched = self.rows(info.name()).get(&id).is_some_and(|existing| match version_field {
            Some(field) => existing.get(field).as_i64() == old_version,
            None => true,
        });
        if !matched {
            return Err(match version_field {
                Some(_) => DbError::coded(
                    ErrorCode::RecordWithPkVersionNotFound,
                    format!(
                        "Record of '{}' with id {} and version {:?} not found",
                        info.name(),
                        id,
                        old_version
                    ),
                ),
                None => DbError::coded(
                    ErrorCode::RecordWithPkNotFound,
                    format!("Record of '{}' with id {} not found", info.name(), id),
                ),
            });
        }

        let stored = Self::to_stored(info, record)?;
        self.put(info.name(), id, Some(stored))?;

        if children != ChildFetch::None {
            self.delete_children(info, id, children)?;
            self.create_children(info, record, id, children)?;
        }
        Ok(1)
    }

    fn update_fields_by_id(&mut self, entity: &str, id: i64, update: &Update) -> Result<usize> {
        let info = self.info(entity)?;
        let mut query = QueryDef::new(entity);
        query.add_restriction(Restriction::compare(CompareOp::Equals, ID_FIELD, id));
        let statement = self.dialect().prepare_update_all(&info, &query, update)?;
        self.trace("update_fields_by_id", &statement);

        match self.rows(entity).get(&id).cloned() {
            Some(mut stored) => {
                apply_update(&info, &mut stored, update)?;
                self.put(entity, id, Some(stored))?;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn update_all(&mut self, query: &QueryDef, update: &Update) -> Result<usize> {
        self.require_mutation_criteria(query, "Update")?;
        let info = self.info(query.entity())?;
        let query = self.prepared(&info, query)?;
        let statement = self.dialect().prepare_update_all(&info, &query, update)?;
        self.trace("update_all", &statement);

        let rows = self.matching(&info, &query, false, true)?;
        for mut stored in rows.iter().cloned() {
            apply_update(&info, &mut stored, update)?;
            let id = stored.id().ok_or_else(|| {
                DbError::InvalidState(format!("Stored record of '{}' has no id", info.name()))
            })?;
            self.put(info.name(), id, Some(stored))?;
        }
        Ok(rows.len())
    }

    fn delete_by_id(&mut self, record: &Record, version_check: bool) -> Result<usize> {
        let info = self.info(record.entity())?;
        let mut record = record.clone();
        let result = self.delete_record(&info, &mut record, version_check);
        if result.is_err() {
            if let Some(policy) = info.policy() {
                policy.on_delete_error(&mut record);
            }
        }
        result
    }

    fn delete_record(&mut self, info: &EntityInfo, record: &mut Record, version_check: bool) -> Result<usize> {
        let old_version = info.version_field().and_then(|f| record.get(f).as_i64());
        if let Some(policy) = info.policy() {
            policy.pre_delete(record, self.policy_now(info))?;
        }
        let id = record.id().ok_or_else(|| {
            DbError::InvalidArgument(format!("Record of '{}' has no id", info.name()))
        })?;

        let version_field = info.version_field().filter(|_| version_check);
        let statement = self
            .dialect()
            .prepare_delete_by_id(info, id, version_field.and(old_version))?;
        self.trace("delete_by_id", &statement);

        let matched = self.rows(info.name()).get(&id).is_some_and(|existing| match version_field {
            Some(field) => existing.get(field).as_i64() == old_version,
            None => true,
        });
        if !matched {
            return Err(match version_field {
                Some(_) => DbError::coded(
                    ErrorCode::RecordWithPkVersionNotFound,
                    format!(
                        "Record of '{}' with id {} and version {:?} not found",
                        info.name(),
                        id,
                        old_version
                    ),
                ),
                None => DbError::coded(
                    ErrorCode::RecordWithPkNotFound,
                    format!("Record of '{}' with id {} not found", info.name(), id),
                ),
            });
        }

        self.delete_children(info, id, ChildFetch::All)?;
        self.put(info.name(), id, None)?;
        Ok(1)
    }

    fn delete(&mut self, entity: &str, id: i64) -> Result<usize> {
        let info = self.info(entity)?;
        let statement = self.dialect().prepare_delete_by_id(&info, id, None)?;
        self.trace("delete", &statement);

        if !self.rows(entity).contains_key(&id) {
            return Err(DbError::coded(
                ErrorCode::RecordWithPkNotFound,
                format!("Record of '{}' with id {} not found", entity, id),
            ));
        }
        self.delete_children(&info, id, ChildFetch::All)?;
        self.put(entity, id, None)?;
        Ok(1)
    }

    fn delete_all(&mut self, query: &QueryDef) -> Result<usize> {
        self.require_mutation_criteria(query, "Delete")?;
        let info = self.info(query.entity())?;
        let query = self.prepared(&info, query)?;
        let statement = self.dialect().prepare_delete_all(&info, &query)?;
        self.trace("delete_all", &statement);

        let ids: Vec<i64> = self
            .matching(&info, &query, false, true)?
            .iter()
            .filter_map(Record::id)
            .collect();
        for id in &ids {
            self.delete_children(&info, *id, ChildFetch::All)?;
            self.put(info.name(), *id, None)?;
        }
        Ok(ids.len())
    }
}

fn unique_violation(info: &EntityInfo, constraint: &[String]) -> DbError {
    DbError::ExecutionError(format!(
        "Unique constraint ({}) violated on '{}'",
        constraint.join(", "),
        info.name()
    ))
}

fn row_conflict(info: &EntityInfo, id: i64) -> DbError {
    match info.version_field() {
        Some(_) => DbError::coded(
            ErrorCode::RecordWithPkVersionNotFound,
            format!("Record of '{}' with id {} was changed by another session", info.name(), id),
        ),
        None => DbError::coded(
            ErrorCode::RecordWithPkNotFound,
            format!("Record of '{}' with id {} was changed by another session", info.name(), id),
        ),
    }
}

/// First unique constraint of `info` that `row` duplicates in `others`. A
/// constraint with a null field never clashes.
fn unique_clash<'a>(info: &'a EntityInfo, others: &Table, row: &Record) -> Option<&'a [String]> {
    info.unique_constraints()
        .iter()
        .find(|constraint| {
            constraint.iter().all(|field| !row.get(field).is_null())
                && others
                    .values()
                    .any(|existing| constraint.iter().all(|field| existing.get(field) == row.get(field)))
        })
        .map(Vec::as_slice)
}

/// The committed tables after applying `overlay` to `store`, or the first
/// conflict with work committed since the overlay's rows were read.
fn publish(store: &Tables, overlay: &Overlay, registry: &EntityRegistry) -> Result<Tables> {
    for (entity, basis) in overlay.basis.iter() {
        let info = registry.get(entity)?;
        let table = store.get(entity);
        for (id, version) in basis.iter() {
            let unchanged = table.and_then(|t| t.get(id)).is_some_and(|current| {
                match info.version_field() {
                    Some(field) => current.get(field).as_i64() == *version,
                    None => true,
                }
            });
            if !unchanged {
                return Err(row_conflict(info, *id));
            }
        }
    }

    let mut tables = store.clone();
    for (entity, rows) in overlay.rows.iter() {
        let mut table = tables.get(entity).cloned().unwrap_or_default();
        for (id, row) in rows.iter() {
            match row {
                Some(row) => {
                    table.insert(*id, row.clone());
                }
                None => {
                    table.remove(id);
                }
            }
        }
        tables.insert(entity.clone(), table);
    }

    for (entity, rows) in overlay.rows.iter() {
        let info = registry.get(entity)?;
        if info.unique_constraints().is_empty() {
            continue;
        }
        let table = tables.get(entity).cloned().unwrap_or_default();
        for (id, row) in rows.iter() {
            let Some(row) = row else { continue };
            if let Some(constraint) = unique_clash(info, &table.without(id), row) {
                return Err(unique_violation(info, constraint));
            }
        }
    }
    Ok(tables)
}

fn apply_update(info: &EntityInfo, stored: &mut Record, update: &Update) -> Result<()> {
    for (field, value) in update.iter() {
        let field_info = info.field(field).ok_or_else(|| {
            DbError::InvalidArgument(format!("Field '{}' is not mapped on '{}'", field, info.name()))
        })?;
        if field_info.name == ID_FIELD {
            return Err(DbError::InvalidArgument(format!(
                "Field '{}' of '{}' cannot be updated",
                field,
                info.name()
            )));
        }
        stored.set(field, field_info.forward(value)?);
    }
    Ok(())
}

fn sort_rows(rows: &mut [Record], order: Option<&Order>) -> Result<()> {
    let Some(order) = order.filter(|o| !o.is_empty()) else {
        return Ok(());
    };
    let mut failure = None;
    rows.sort_by(|a, b| {
        for part in order.parts() {
            match a.get(&part.field).compare(b.get(&part.field)) {
                Ok(CmpOrdering::Equal) => continue,
                Ok(ordering) if part.order_type.is_ascending() => return ordering,
                Ok(ordering) => return ordering.reverse(),
                Err(err) => {
                    failure.get_or_insert(err);
                    return CmpOrdering::Equal;
                }
            }
        }
        CmpOrdering::Equal
    });
    failure.map_or(Ok(()), Err)
}

/// Keep the rows whose `field` equals the minimum (`Less`) or maximum
/// (`Greater`) non-null value.
fn keep_extreme(rows: Vec<Record>, field: &str, wanted: CmpOrdering) -> Result<Vec<Record>> {
    let mut extreme: Option<Value> = None;
    for row in &rows {
        let value = row.get(field);
        if value.is_null() {
            continue;
        }
        let replace = match &extreme {
            Some(current) => value.compare(current)? == wanted,
            None => true,
        };
        if replace {
            extreme = Some(value.clone());
        }
    }
    Ok(match extreme {
        Some(extreme) => rows.into_iter().filter(|r| *r.get(field) == extreme).collect(),
        None => Vec::new(),
    })
}

fn aggregate_values(function: &AggregateFunction, values: &[Value]) -> Result<Value> {
    let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
    match function.aggregate_type {
        AggregateType::Count => Ok(Value::Integer(present.len() as i64)),
        AggregateType::Sum | AggregateType::Average => {
            if present.is_empty() {
                return Ok(Value::Null);
            }
            let mut int_sum: i64 = 0;
            let mut float_sum = 0.0;
            let mut all_integers = true;
            for value in &present {
                match value {
                    Value::Integer(i) => {
                        int_sum = int_sum.checked_add(*i).ok_or_else(|| {
                            DbError::ExecutionError(format!("{} of '{}' overflows", function.aggregate_type, function.field))
                        })?;
                        float_sum += *i as f64;
                    }
                    Value::Float(f) => {
                        all_integers = false;
                        float_sum += f;
                    }
                    other => {
                        return Err(DbError::TypeMismatch(format!(
                            "{} requires numeric values, '{}' holds {}",
                            function.aggregate_type,
                            function.field,
                            other.type_name()
                        )));
                    }
                }
            }
            Ok(match function.aggregate_type {
                AggregateType::Sum if all_integers => Value::Integer(int_sum),
                AggregateType::Sum => Value::Float(float_sum),
                _ => Value::Float(float_sum / present.len() as f64),
            })
        }
        AggregateType::Maximum | AggregateType::Minimum => {
            let wanted = if function.aggregate_type == AggregateType::Maximum {
                CmpOrdering::Greater
            } else {
                CmpOrdering::Less
            };
            let mut extreme: Option<&Value> = None;
            for value in present {
                let replace = match extreme {
                    Some(current) => value.compare(current)? == wanted,
                    None => true,
                };
                if replace {
                    extreme = Some(value);
                }
            }
            Ok(extreme.cloned().unwrap_or(Value::Null))
        }
    }
}
