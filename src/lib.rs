// ============================================================================
// UnifyDB Library
// ============================================================================

pub mod config;
pub mod core;
pub mod criteria;
pub mod database;
pub mod dialect;
pub mod entity;
pub mod query;
pub mod session;
pub mod transaction;

// Re-export main types for convenience
pub use crate::core::{DbError, ErrorCode, ID_FIELD, Record, Result, Value};
pub use config::{DataSourceConfig, TransactionConfig};
pub use criteria::{CriteriaBuilder, Restriction, RestrictionType};
pub use database::{Database, DatabaseId};
pub use dialect::{AnsiDialect, DialectKind, SqlDialect};
pub use entity::{Entity, EntityInfo, EntityPolicy, EntityRegistry};
pub use query::{NativeQuery, Query, Update};
pub use session::{DataSource, DatabaseSession, MemoryDataSource};
pub use transaction::{
    DatabaseTransactionManager, EntityChangeEvent, EntityChangeEventBroadcaster,
    EntityChangeEventType, TransactionAttribute,
};

/// Open a database over a fresh in-memory data source.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use unifydb::{
///     DataSourceConfig, DatabaseTransactionManager, Entity, EntityInfo, EntityRegistry, Query,
///     Record, TransactionAttribute,
/// };
///
/// struct Author {
///     id: Option<i64>,
///     name: String,
/// }
///
/// impl Entity for Author {
///     const ENTITY: &'static str = "author";
///
///     fn to_record(&self) -> Record {
///         let mut record = Record::new(Self::ENTITY).with("name", self.name.as_str());
///         if let Some(id) = self.id {
///             record.set_id(id);
///         }
///         record
///     }
///
///     fn from_record(record: Record) -> unifydb::Result<Self> {
///         Ok(Self {
///             id: record.id(),
///             name: record.get("name").as_str().unwrap_or_default().to_string(),
///         })
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() -> unifydb::Result<()> {
/// let registry = EntityRegistry::builder()
///     .register(EntityInfo::builder("author").field("name").build())
///     .build()?;
/// let manager = Arc::new(DatabaseTransactionManager::default());
/// let db = unifydb::open_memory_database(DataSourceConfig::new("books"), registry, &manager)?;
///
/// let found = manager
///     .transactional(TransactionAttribute::Required, async {
///         let mut author = Author { id: None, name: "Austen".into() };
///         db.create(&mut author).await?;
///         db.find_one(&Query::<Author>::of().ibegins_with("name", "aus")).await
///     })
///     .await?;
/// assert_eq!(found.name, "Austen");
/// # Ok(())
/// # }
/// ```
pub fn open_memory_database(
    config: DataSourceConfig,
    registry: std::sync::Arc<EntityRegistry>,
    transaction_manager: &std::sync::Arc<DatabaseTransactionManager>,
) -> Result<Database> {
    let source = MemoryDataSource::new(config, registry)?;
    Ok(Database::new(
        std::sync::Arc::new(source),
        std::sync::Arc::clone(transaction_manager),
    ))
}
