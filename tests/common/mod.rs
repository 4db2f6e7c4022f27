//! Recording test doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use std::sync::{Arc, Mutex};
use unifydb::core::{DbError, Record, Result, Value};
use unifydb::dialect::{DialectKind, DialectPolicies, SqlDialect};
use unifydb::entity::EntityRegistry;
use unifydb::query::{AggregateFunction, Aggregation, GroupingAggregation, QueryDef, Update};
use unifydb::session::{ChildFetch, DataSource, DatabaseSession, FetchPlan};
use unifydb::transaction::{EntityChangeEvent, EntityChangeEventBroadcaster};

/// Ordered log of everything the doubles observed.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[derive(Clone, Copy, Default)]
pub struct Failures {
    pub commit: bool,
    pub close: bool,
}

/// Data source whose sessions only record lifecycle calls.
pub struct RecordingDataSource {
    name: String,
    journal: Journal,
    failures: Failures,
    dialect: Arc<dyn SqlDialect>,
    registry: Arc<EntityRegistry>,
}

impl RecordingDataSource {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self::failing(name, journal, Failures::default())
    }

    pub fn failing(name: &str, journal: &Journal, failures: Failures) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            failures,
            dialect: DialectKind::Ansi.create(DialectPolicies::default()),
            registry: EntityRegistry::builder().build().unwrap(),
        }
    }
}

#[async_trait]
impl DataSource for RecordingDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> Arc<dyn SqlDialect> {
        Arc::clone(&self.dialect)
    }

    fn registry(&self) -> Arc<EntityRegistry> {
        Arc::clone(&self.registry)
    }

    async fn create_session(&self) -> Result<Arc<dyn DatabaseSession>> {
        self.journal.push(format!("{}:open", self.name));
        Ok(Arc::new(RecordingSession {
            name: self.name.clone(),
            journal: self.journal.clone(),
            failures: self.failures,
            closed: Mutex::new(false),
        }))
    }
}

pub struct RecordingSession {
    name: String,
    journal: Journal,
    failures: Failures,
    closed: Mutex<bool>,
}

impl RecordingSession {
    fn record(&self, what: &str) {
        self.journal.push(format!("{}:{}", self.name, what));
    }

    fn unsupported<T>(&self) -> Result<T> {
        Err(DbError::ExecutionError(format!("{} records lifecycle calls only", self.name)))
    }
}

#[async_trait]
impl DatabaseSession for RecordingSession {
    fn data_source_name(&self) -> &str {
        &self.name
    }

    async fn create(&self, _record: &mut Record, _children: ChildFetch) -> Result<i64> {
        self.record("create");
        Ok(1)
    }

    async fn find_by_id(&self, _entity: &str, _id: i64, _version: Option<i64>, _plan: FetchPlan) -> Result<Record> {
        self.unsupported()
    }

    async fn find(&self, _query: &QueryDef, _plan: FetchPlan) -> Result<Option<Record>> {
        Ok(None)
    }

    async fn find_all(&self, _query: &QueryDef, _plan: FetchPlan) -> Result<Vec<Record>> {
        Ok(Vec::new())
    }

    async fn find_constraint(&self, _record: &Record) -> Result<Option<Record>> {
        Ok(None)
    }

    async fn find_children(&self, _record: &mut Record, _children: ChildFetch, _view: bool) -> Result<()> {
        Ok(())
    }

    async fn populate_list_only(&self, _record: &mut Record) -> Result<()> {
        Ok(())
    }

    async fn value(&self, _field: &str, _query: &QueryDef) -> Result<Value> {
        self.unsupported()
    }

    async fn value_list(&self, _field: &str, _query: &QueryDef) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }

    async fn value_pairs(&self, _key: &str, _value: &str, _query: &QueryDef) -> Result<Vec<(Value, Value)>> {
        Ok(Vec::new())
    }

    async fn min(&self, _field: &str, _query: &QueryDef) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn max(&self, _field: &str, _query: &QueryDef) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn count(&self, _query: &QueryDef) -> Result<usize> {
        self.record("count");
        Ok(0)
    }

    async fn aggregate(&self, _function: &AggregateFunction, _query: &QueryDef) -> Result<Aggregation> {
        self.unsupported()
    }

    async fn aggregate_many(&self, _functions: &[AggregateFunction], _query: &QueryDef) -> Result<Vec<Aggregation>> {
        Ok(Vec::new())
    }

    async fn aggregate_group_many(
        &self,
        _functions: &[AggregateFunction],
        _query: &QueryDef,
    ) -> Result<Vec<GroupingAggregation>> {
        Ok(Vec::new())
    }

    async fn update_by_id(&self, _record: &mut Record, _version_check: bool, _children: ChildFetch) -> Result<usize> {
        self.unsupported()
    }

    async fn update_fields_by_id(&self, _entity: &str, _id: i64, _update: &Update) -> Result<usize> {
        self.unsupported()
    }

    async fn update_all(&self, _query: &QueryDef, _update: &Update) -> Result<usize> {
        self.unsupported()
    }

    async fn delete_by_id(&self, _record: &Record, _version_check: bool) -> Result<usize> {
        self.unsupported()
    }

    async fn delete(&self, _entity: &str, _id: i64) -> Result<usize> {
        self.unsupported()
    }

    async fn delete_all(&self, _query: &QueryDef) -> Result<usize> {
        self.unsupported()
    }

    async fn get_now(&self) -> Result<NaiveDateTime> {
        Ok(Utc::now().naive_utc())
    }

    async fn set_savepoint(&self) -> Result<()> {
        self.record("savepoint");
        Ok(())
    }

    async fn clear_savepoint(&self) -> Result<()> {
        self.record("clear_savepoint");
        Ok(())
    }

    async fn rollback_to_savepoint(&self) -> Result<()> {
        self.record("rollback_to_savepoint");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.record("commit");
        if self.failures.commit {
            return Err(DbError::ExecutionError("commit refused".into()));
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.record("rollback");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        *self.closed.lock().unwrap() = true;
        if self.failures.close {
            return Err(DbError::ExecutionError("close refused".into()));
        }
        Ok(())
    }

    async fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

/// Broadcaster writing `event:<entity>:<id>` entries to the journal.
pub struct RecordingBroadcaster {
    journal: Journal,
}

impl RecordingBroadcaster {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
        }
    }
}

#[async_trait]
impl EntityChangeEventBroadcaster for RecordingBroadcaster {
    async fn broadcast_entity_change(&self, event: &EntityChangeEvent) -> Result<()> {
        let id = event.id.map_or_else(|| "-".to_string(), |id| id.to_string());
        self.journal.push(format!("event:{}:{}", event.entity, id));
        Ok(())
    }
}
