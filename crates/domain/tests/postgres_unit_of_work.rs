//! Unit of work and repository tests against PostgreSQL
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p domain --test postgres_unit_of_work
//! ```

use std::sync::Arc;

use common::{AggregateId, Version};
use domain::{
    AggregateRepository, AggregateRoot, DomainError, ExecContext, RetryConfig, StateRepository,
    UnitOfWork, UnitOfWorkConfig, User,
};
use serial_test::serial;
use sqlx::PgPool;
use storage::{OutboxStatus, OutboxStore, PostgresStore, StorageError, Store, Transaction};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_aggregates_and_outbox.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE aggregates, outbox")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStore::new(pool)
}

fn create_uow(store: PostgresStore) -> UnitOfWork<PostgresStore> {
    UnitOfWork::with_config(
        store,
        UnitOfWorkConfig {
            retry: RetryConfig::disabled(),
            ..UnitOfWorkConfig::default()
        },
    )
}

async fn register(uow: &UnitOfWork<PostgresStore>, email: &str) -> AggregateId {
    let users = StateRepository::<User>::new();
    uow.execute(&ExecContext::new(), |scope| {
        let users = &users;
        let email = email.to_string();
        async move {
            let mut user = User::register(email, "Test User")?;
            scope.save(users, &mut user).await?;
            Ok(user.id())
        }
    })
    .await
    .unwrap()
}

async fn stored_version(store: &PostgresStore, id: AggregateId) -> Option<Version> {
    let mut tx = store.begin().await.unwrap();
    let row = tx.load_aggregate("User", id).await.unwrap();
    tx.rollback().await.unwrap();
    row.map(|row| row.version)
}

#[tokio::test]
#[serial]
async fn execute_commits_state_and_outbox_together() {
    let store = get_test_store().await;
    let uow = create_uow(store.clone());

    let user_id = register(&uow, "ada@example.com").await;

    assert_eq!(stored_version(&store, user_id).await, Some(Version::first()));
    let pending = store.get_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_type, "UserRegistered");
    assert_eq!(pending[0].aggregate_id, user_id);
    assert_eq!(pending[0].status, OutboxStatus::Pending);
}

#[tokio::test]
#[serial]
async fn failed_execute_leaves_nothing_behind() {
    let store = get_test_store().await;
    let uow = create_uow(store.clone());
    let users = StateRepository::<User>::new();
    let created = std::sync::Mutex::new(None);

    let result: Result<(), DomainError> = uow
        .execute(&ExecContext::new(), |scope| {
            let (users, created) = (&users, &created);
            async move {
                let mut user = User::register("grace@example.com", "Grace")?;
                scope.save(users, &mut user).await?;
                *created.lock().unwrap() = Some(user.id());
                Err(DomainError::validation("rejected after save"))
            }
        })
        .await;

    assert!(matches!(result, Err(DomainError::Validation(_))));
    let user_id = created.lock().unwrap().expect("logic ran");
    assert_eq!(stored_version(&store, user_id).await, None);
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending + stats.processing + stats.published + stats.failed, 0);
}

#[tokio::test]
#[serial]
async fn racing_saves_from_the_same_version() {
    let store = get_test_store().await;
    let uow = create_uow(store.clone());
    let users = StateRepository::<User>::new();
    let user_id = register(&uow, "ada@example.com").await;

    let mut first_tx = store.begin().await.unwrap();
    let mut second_tx = store.begin().await.unwrap();
    let mut first = users.find_by_id(&mut first_tx, user_id).await.unwrap().unwrap();
    let mut second = users.find_by_id(&mut second_tx, user_id).await.unwrap().unwrap();

    first.rename("First Writer").unwrap();
    users.save(&mut first_tx, &mut first).await.unwrap();

    // Blocks on the row lock until the first transaction commits.
    let racer = tokio::spawn(async move {
        second.rename("Second Writer").unwrap();
        let result = users.save(&mut second_tx, &mut second).await;
        second_tx.rollback().await.unwrap();
        (result, second.version())
    });
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    first_tx.commit().await.unwrap();

    let (result, version) = racer.await.unwrap();
    assert!(matches!(
        result,
        Err(StorageError::ConcurrentModification { .. })
    ));
    assert_eq!(version, Version::first());
    assert_eq!(first.version(), Version::new(2));
    assert_eq!(stored_version(&store, user_id).await, Some(Version::new(2)));
}

#[tokio::test]
#[serial]
async fn stale_save_conflicts_then_reload_succeeds() {
    let store = get_test_store().await;
    let uow = create_uow(store.clone());
    let users = StateRepository::<User>::new();
    let user_id = register(&uow, "ada@example.com").await;
    let ctx = ExecContext::new();

    let stale = uow
        .execute(&ctx, |scope| {
            let users = &users;
            async move { scope.load(users, user_id).await }
        })
        .await
        .unwrap();

    uow.execute(&ctx, |scope| {
        let users = &users;
        async move {
            let mut user = scope.load(users, user_id).await?;
            user.rename("First Writer")?;
            scope.save(users, &mut user).await
        }
    })
    .await
    .unwrap();

    let conflict = uow
        .execute(&ctx, |scope| {
            let users = &users;
            let mut user = stale.clone();
            async move {
                user.rename("Second Writer")?;
                scope.save(users, &mut user).await
            }
        })
        .await;
    assert!(conflict.unwrap_err().is_concurrent_modification());

    let version = uow
        .execute(&ctx, |scope| {
            let users = &users;
            async move {
                let mut user = scope.load(users, user_id).await?;
                user.rename("Second Writer")?;
                scope.save(users, &mut user).await?;
                Ok(user.version())
            }
        })
        .await
        .unwrap();

    assert_eq!(version, Version::new(3));
    assert_eq!(stored_version(&store, user_id).await, Some(Version::new(3)));
    // Registration plus one rename per successful write; the conflict left no record.
    assert_eq!(store.get_pending(10).await.unwrap().len(), 3);
}

#[tokio::test]
#[serial]
async fn removing_a_missing_aggregate_is_not_found() {
    let store = get_test_store().await;
    let uow = create_uow(store.clone());
    let users = StateRepository::<User>::new();
    let user_id = register(&uow, "ada@example.com").await;

    let mut tx = store.begin().await.unwrap();
    let user = users.find_by_id(&mut tx, user_id).await.unwrap().unwrap();
    users.remove(&mut tx, &user).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let result = users.remove(&mut tx, &user).await;
    assert!(matches!(result, Err(StorageError::NotFound { .. })));
}
