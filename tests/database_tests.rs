/// Database facade tests
///
/// Typed reads and writes over the in-memory data source, inside
/// propagating transactions.
/// Run with: cargo test --test database_tests

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Barrier;
use unifydb::core::ChildSlot;
use unifydb::entity::ChildKind;
use unifydb::query::{AggregateFunction, AggregateType};
use unifydb::{
    DataSourceConfig, Database, DatabaseTransactionManager, Entity, EntityInfo, EntityRegistry,
    ErrorCode, Query, Record, TransactionAttribute, Update, Value,
};

#[derive(Debug, Clone, PartialEq)]
struct Author {
    id: Option<i64>,
    name: String,
    country: String,
}

impl Author {
    fn new(name: &str, country: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            country: country.to_string(),
        }
    }
}

impl Entity for Author {
    const ENTITY: &'static str = "author";

    fn to_record(&self) -> Record {
        let mut record = Record::new(Self::ENTITY)
            .with("name", self.name.as_str())
            .with("country", self.country.as_str());
        if let Some(id) = self.id {
            record.set_id(id);
        }
        record
    }

    fn from_record(record: Record) -> unifydb::Result<Self> {
        Ok(Self {
            id: record.id(),
            name: record.get("name").as_str().unwrap_or_default().to_string(),
            country: record.get("country").as_str().unwrap_or_default().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Chapter {
    id: Option<i64>,
    heading: String,
}

impl Entity for Chapter {
    const ENTITY: &'static str = "chapter";

    fn to_record(&self) -> Record {
        let mut record = Record::new(Self::ENTITY).with("heading", self.heading.as_str());
        if let Some(id) = self.id {
            record.set_id(id);
        }
        record
    }

    fn from_record(record: Record) -> unifydb::Result<Self> {
        Ok(Self {
            id: record.id(),
            heading: record.get("heading").as_str().unwrap_or_default().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Book {
    id: Option<i64>,
    version: Option<i64>,
    title: String,
    author_id: i64,
    pages: i64,
    chapters: Option<Vec<Chapter>>,
}

impl Book {
    fn new(title: &str, author_id: i64, pages: i64) -> Self {
        Self {
            id: None,
            version: None,
            title: title.to_string(),
            author_id,
            pages,
            chapters: None,
        }
    }
}

impl Entity for Book {
    const ENTITY: &'static str = "book";

    fn to_record(&self) -> Record {
        let mut record = Record::new(Self::ENTITY)
            .with("title", self.title.as_str())
            .with("authorId", self.author_id)
            .with("pages", self.pages);
        if let Some(id) = self.id {
            record.set_id(id);
        }
        if let Some(version) = self.version {
            record.set("versionNo", version);
        }
        if let Some(chapters) = &self.chapters {
            record.set_child_list("chapters", chapters.iter().map(Entity::to_record).collect());
        }
        record
    }

    fn from_record(record: Record) -> unifydb::Result<Self> {
        let chapters = match record.child("chapters") {
            Some(ChildSlot::List(list)) => Some(
                list.iter()
                    .cloned()
                    .map(Chapter::from_record)
                    .collect::<unifydb::Result<Vec<_>>>()?,
            ),
            _ => None,
        };
        Ok(Self {
            id: record.id(),
            version: record.get("versionNo").as_i64(),
            title: record.get("title").as_str().unwrap_or_default().to_string(),
            author_id: record.get("authorId").as_i64().unwrap_or_default(),
            pages: record.get("pages").as_i64().unwrap_or_default(),
            chapters,
        })
    }
}

fn registry() -> Arc<EntityRegistry> {
    EntityRegistry::builder()
        .register(
            EntityInfo::builder("author")
                .field("name")
                .field("country")
                .unique_constraint(&["name"])
                .build(),
        )
        .register(
            EntityInfo::builder("book")
                .field("title")
                .field("authorId")
                .field("pages")
                .versioned("versionNo")
                .child_list("chapters", "chapter", "bookId", ChildKind::Editable)
                .build(),
        )
        .register(EntityInfo::builder("chapter").field("bookId").field("heading").build())
        .build()
        .unwrap()
}

fn library(max_connections: usize) -> (Arc<DatabaseTransactionManager>, Database) {
    let manager = Arc::new(DatabaseTransactionManager::default());
    let db = unifydb::open_memory_database(
        DataSourceConfig::new("library").max_connections(max_connections),
        registry(),
        &manager,
    )
    .unwrap();
    (manager, db)
}

async fn seed_authors(manager: &DatabaseTransactionManager, db: &Database) -> anyhow::Result<Vec<i64>> {
    let ids = manager
        .transactional(TransactionAttribute::Required, async {
            let mut ids = Vec::new();
            for (name, country) in [("Austen", "UK"), ("Tolstoy", "RU"), ("Eliot", "UK")] {
                ids.push(db.create(&mut Author::new(name, country)).await?);
            }
            Ok(ids)
        })
        .await?;
    Ok(ids)
}

#[tokio::test]
async fn test_create_and_read_back() -> anyhow::Result<()> {
    let (manager, db) = library(2);
    let ids = seed_authors(&manager, &db).await?;
    assert_eq!(ids, vec![1, 2, 3]);

    manager
        .transactional(TransactionAttribute::Required, async {
            let austen: Author = db.find_by_id(ids[0]).await?;
            assert_eq!(austen.name, "Austen");

            let british = db
                .find_all(&Query::<Author>::of().equals("country", "UK").add_order("name"))
                .await?;
            let names: Vec<_> = british.iter().map(|a| a.name.as_str()).collect();
            assert_eq!(names, vec!["Austen", "Eliot"]);

            assert_eq!(db.count_all::<Author>().await?, 3);
            assert!(db.exists(&Query::<Author>::of().iequals("name", "tolstoy")).await?);
            Ok(())
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_find_returns_none_and_find_one_fails() -> anyhow::Result<()> {
    let (manager, db) = library(2);
    seed_authors(&manager, &db).await?;

    let outcome: unifydb::Result<()> = manager
        .transactional(TransactionAttribute::Required, async {
            let missing = Query::<Author>::of().equals("name", "Dickens");
            assert!(db.find(&missing).await?.is_none());

            let err = db.find_one(&missing).await.unwrap_err();
            assert!(err.is_code(ErrorCode::RecordNotFound));

            let err = db
                .find(&Query::<Author>::of().equals("country", "UK"))
                .await
                .unwrap_err();
            assert!(err.is_code(ErrorCode::RecordMultipleFound));

            let first = db
                .find_first(&Query::<Author>::of().equals("country", "UK").add_order("name"))
                .await?;
            assert_eq!(first.map(|a| a.name), Some("Austen".to_string()));
            Ok(())
        })
        .await;
    outcome?;
    Ok(())
}

#[tokio::test]
async fn test_rolled_back_transaction_discards_writes() -> anyhow::Result<()> {
    let (manager, db) = library(2);

    let outcome: unifydb::Result<i64> = manager
        .transactional(TransactionAttribute::Required, async {
            db.create(&mut Author::new("Austen", "UK")).await?;
            db.create(&mut Author::new("Austen", "UK")).await
        })
        .await;
    assert!(outcome.is_err());

    let count = manager
        .transactional(TransactionAttribute::Required, async { db.count_all::<Author>().await })
        .await?;
    assert_eq!(count, 0);
    Ok(())
}

#[tokio::test]
async fn test_version_conflict_restores_entity_version() -> anyhow::Result<()> {
    let (manager, db) = library(2);

    manager
        .transactional(TransactionAttribute::Required, async {
            let mut book = Book::new("Emma", 1, 300);
            db.create(&mut book).await?;
            assert_eq!(book.version, Some(1));

            let mut stale = book.clone();
            book.pages = 320;
            assert_eq!(db.update_by_id_version(&mut book).await?, 1);
            assert_eq!(book.version, Some(2));

            stale.pages = 10;
            let err = db.update_by_id_version(&mut stale).await.unwrap_err();
            assert!(err.is_code(ErrorCode::RecordWithPkVersionNotFound));
            assert_eq!(stale.version, Some(1));

            let stored: Book = db.find_lean_by_id(book.id.unwrap_or_default()).await?;
            assert_eq!(stored.pages, 320);
            Ok(())
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_children_follow_their_parent() -> anyhow::Result<()> {
    let (manager, db) = library(2);

    manager
        .transactional(TransactionAttribute::Required, async {
            let mut book = Book::new("Emma", 1, 300);
            book.chapters = Some(vec![
                Chapter { id: None, heading: "One".into() },
                Chapter { id: None, heading: "Two".into() },
            ]);
            let id = db.create(&mut book).await?;

            let found: Book = db.find_by_id(id).await?;
            let headings: Vec<_> = found
                .chapters
                .unwrap_or_default()
                .into_iter()
                .map(|c| c.heading)
                .collect();
            assert_eq!(headings, vec!["One", "Two"]);

            let lean: Book = db.find_lean_by_id(id).await?;
            assert!(lean.chapters.is_none());

            let mut edited: Book = db.find_by_id(id).await?;
            edited.chapters = Some(vec![Chapter { id: None, heading: "Only".into() }]);
            db.update_by_id(&mut edited).await?;
            assert_eq!(db.count_all::<Chapter>().await?, 1);

            db.delete::<Book>(id).await?;
            assert_eq!(db.count_all::<Chapter>().await?, 0);
            Ok(())
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_value_reads() -> anyhow::Result<()> {
    let (manager, db) = library(2);
    seed_authors(&manager, &db).await?;

    manager
        .transactional(TransactionAttribute::Required, async {
            let countries = db.value_set("country", &Query::<Author>::of().ignore_empty_criteria(true)).await?;
            assert_eq!(countries.len(), 2);
            assert!(countries.contains(&Value::from("RU")));

            let by_country = db
                .value_list_map("country", "name", &Query::<Author>::of().ignore_empty_criteria(true))
                .await?;
            assert_eq!(by_country[&Value::from("UK")].len(), 2);

            let names = db
                .value_map("name", "country", &Query::<Author>::of().ignore_empty_criteria(true))
                .await?;
            assert_eq!(names[&Value::from("Tolstoy")], Value::from("RU"));

            let err = db
                .value("name", &Query::<Author>::of().equals("country", "FR").must_match(true))
                .await
                .unwrap_err();
            assert!(err.is_code(ErrorCode::RecordAtLeastOneValueExpected));
            Ok(())
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_aggregates_and_bulk_updates() -> anyhow::Result<()> {
    let (manager, db) = library(2);

    manager
        .transactional(TransactionAttribute::Required, async {
            for (title, author, pages) in [("Emma", 1, 300), ("Persuasion", 1, 250), ("War and Peace", 2, 1200)] {
                db.create(&mut Book::new(title, author, pages)).await?;
            }

            let total = db
                .aggregate(
                    &AggregateFunction::new(AggregateType::Sum, "pages"),
                    &Query::<Book>::of().equals("authorId", 1),
                )
                .await?;
            assert_eq!(total.value, Value::Integer(550));

            let updated = db
                .update_all(
                    &Query::<Book>::of().greater("pages", 1000),
                    &Update::new().add("pages", 1225),
                )
                .await?;
            assert_eq!(updated, 1);
            assert_eq!(db.max("pages", &Query::<Book>::of().ignore_empty_criteria(true)).await?, Value::Integer(1225));

            let err = db
                .update_all(&Query::<Book>::of(), &Update::new().add("pages", 0))
                .await
                .unwrap_err();
            assert!(err.is_code(ErrorCode::EmptyCriteria));
            Ok(())
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_nested_requires_new_needs_a_second_connection() -> anyhow::Result<()> {
    let (manager, db) = library(1);

    let outcome: unifydb::Result<()> = manager
        .transactional(TransactionAttribute::Required, async {
            db.create(&mut Author::new("Austen", "UK")).await?;
            let inner: unifydb::Result<i64> = manager
                .transactional(TransactionAttribute::RequiresNew, async {
                    db.create(&mut Author::new("Eliot", "UK")).await
                })
                .await;
            let err = inner.unwrap_err();
            assert!(err.is_code(ErrorCode::DatasourceConnectionUnavailable));
            Ok(())
        })
        .await;
    outcome?;

    let count = manager
        .transactional(TransactionAttribute::Required, async { db.count_all::<Author>().await })
        .await?;
    assert_eq!(count, 1);
    Ok(())
}

#[tokio::test]
async fn test_database_requires_transaction() {
    let (manager, db) = library(1);

    let err = DatabaseTransactionManager::scope(async { db.count_all::<Author>().await })
        .await
        .unwrap_err();
    assert!(err.is_code(ErrorCode::TransactionIsRequired));

    let err = manager
        .transactional(TransactionAttribute::NotSupported, async { db.count_all::<Author>().await })
        .await
        .unwrap_err();
    assert!(err.is_code(ErrorCode::TransactionIsRequired));
}

#[tokio::test]
async fn test_concurrent_transactions_are_isolated() -> anyhow::Result<()> {
    let (manager, db) = library(4);

    let writers = ["Austen", "Tolstoy", "Eliot"].map(|name| {
        let manager = Arc::clone(&manager);
        let db = db.clone();
        async move {
            manager
                .transactional(TransactionAttribute::Required, async {
                    assert_eq!(manager.stack_size(), 1);
                    db.create(&mut Author::new(name, "UK")).await
                })
                .await
        }
    });
    let ids = join_all(writers)
        .await
        .into_iter()
        .collect::<unifydb::Result<Vec<_>>>()?;
    assert_eq!(ids.len(), 3);

    let count = manager
        .transactional(TransactionAttribute::Required, async { db.count_all::<Author>().await })
        .await?;
    assert_eq!(count, 3);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_version_checked_updates_have_one_winner() -> anyhow::Result<()> {
    let (manager, db) = library(4);
    let seeded = manager
        .transactional(TransactionAttribute::Required, async {
            let mut book = Book::new("Emma", 1, 300);
            db.create(&mut book).await?;
            Ok(book)
        })
        .await?;

    let barrier = Arc::new(Barrier::new(2));
    let writers = [310, 320].map(|pages| {
        let manager = Arc::clone(&manager);
        let db = db.clone();
        let barrier = Arc::clone(&barrier);
        let mut book = seeded.clone();
        async move {
            manager
                .transactional(TransactionAttribute::Required, async {
                    book.pages = pages;
                    let updated = db.update_by_id_version(&mut book).await;
                    barrier.wait().await;
                    updated.map(|_| pages)
                })
                .await
        }
    });
    let results = join_all(writers).await;

    let winners: Vec<i64> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(err) if err.is_code(ErrorCode::RecordWithPkVersionNotFound)
    )));

    let stored: Book = manager
        .transactional(TransactionAttribute::Required, async {
            db.find_by_id(seeded.id.unwrap_or_default()).await
        })
        .await?;
    assert_eq!(stored.pages, winners[0]);
    assert_eq!(stored.version, Some(2));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_creates_keep_unique_names() -> anyhow::Result<()> {
    let (manager, db) = library(4);

    let barrier = Arc::new(Barrier::new(2));
    let writers = ["UK", "IE"].map(|country| {
        let manager = Arc::clone(&manager);
        let db = db.clone();
        let barrier = Arc::clone(&barrier);
        async move {
            manager
                .transactional(TransactionAttribute::Required, async {
                    let created = db.create(&mut Author::new("dup", country)).await;
                    barrier.wait().await;
                    created
                })
                .await
        }
    });
    let results = join_all(writers).await;
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(unifydb::DbError::ExecutionError(_)))));

    let count = manager
        .transactional(TransactionAttribute::Required, async {
            db.count(&Query::<Author>::of().equals("name", "dup")).await
        })
        .await?;
    assert_eq!(count, 1);
    Ok(())
}
