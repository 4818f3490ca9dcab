//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container and need a running Docker
//! daemon, so they are ignored by default. Run with:
//!
//! ```bash
//! cargo test -p saga-store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use saga_store::{
    InstanceQuery, PostgresSagaStore, SagaContext, SagaId, SagaInstance, SagaPersistence,
    SagaPersistenceExt, SagaSnapshot, SagaStatus, SagaStepRecord, StepPhase, StepStatus,
    StoreError, Version,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
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
                "../../../migrations/001_create_saga_tables.sql"
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

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresSagaStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_snapshots, saga_step_records, saga_instances")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaStore::new(pool)
}

fn record(saga_id: SagaId, index: usize, status: StepStatus) -> SagaStepRecord {
    SagaStepRecord::builder()
        .saga_id(saga_id)
        .step(index, format!("step-{index}"))
        .status(status)
        .build()
        .unwrap()
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn save_and_load_instance() {
    let store = get_test_store().await;
    let ctx = SagaContext::new().with("order_id", serde_json::json!("o-42"));
    let instance = SagaInstance::new("OrderFulfillment", ctx.clone());

    let version = store.save(&instance).await.unwrap();
    assert_eq!(version, Version::first());

    let loaded = store.require_instance(instance.id).await.unwrap();
    assert_eq!(loaded.definition_name, "OrderFulfillment");
    assert_eq!(loaded.status, SagaStatus::Pending);
    assert_eq!(loaded.context, ctx);
    assert_eq!(loaded.version, Version::first());
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn stale_version_conflicts() {
    let store = get_test_store().await;
    let mut instance = SagaInstance::new("Test", SagaContext::new());
    instance.version = store.save(&instance).await.unwrap();

    let mut winner = instance.clone();
    winner.transition(SagaStatus::Running).unwrap();
    store.save(&winner).await.unwrap();

    let mut loser = instance.clone();
    loser.current_step_index = 3;
    let err = store.save(&loser).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Conflict { expected, actual, .. }
            if expected == Version::first() && actual == Version::new(2)
    ));

    let loaded = store.require_instance(instance.id).await.unwrap();
    assert_eq!(loaded.current_step_index, 0);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn records_are_sequenced_and_replayable() {
    let store = get_test_store().await;
    let instance = SagaInstance::new("Test", SagaContext::new());
    store.save(&instance).await.unwrap();

    let mut completed = record(instance.id, 0, StepStatus::Completed);
    completed.output = Some(SagaContext::new().with("reservation_id", serde_json::json!("R-1")));
    store
        .append_step_record(record(instance.id, 0, StepStatus::Running))
        .await
        .unwrap();
    store.append_step_record(completed).await.unwrap();

    let mut compensation = record(instance.id, 0, StepStatus::Failed);
    compensation.phase = StepPhase::Compensation;
    compensation.error_detail = Some("refund rejected".to_string());
    let seq = store.append_step_record(compensation).await.unwrap();
    assert_eq!(seq, 3);

    let (_, history) = store.load(instance.id).await.unwrap().unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(
        history[1].output.as_ref().unwrap().get_value("reservation_id"),
        Some(&serde_json::json!("R-1"))
    );
    assert_eq!(history[2].phase, StepPhase::Compensation);

    let tail = store.records_after(instance.id, 1).await.unwrap();
    assert_eq!(tail.len(), 2);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn snapshot_keeps_latest() {
    let store = get_test_store().await;
    let instance = SagaInstance::new("Test", SagaContext::new());
    store.save(&instance).await.unwrap();

    store
        .save_snapshot(SagaSnapshot::new(
            instance.id,
            Version::new(3),
            6,
            serde_json::json!({"n": 6}),
        ))
        .await
        .unwrap();
    store
        .save_snapshot(SagaSnapshot::new(
            instance.id,
            Version::new(2),
            4,
            serde_json::json!({"n": 4}),
        ))
        .await
        .unwrap();

    let snapshot = store.get_snapshot(instance.id).await.unwrap().unwrap();
    assert_eq!(snapshot.last_sequence, 6);
    assert_eq!(snapshot.state, serde_json::json!({"n": 6}));
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn list_active_and_filtered() {
    let store = get_test_store().await;

    let running = SagaInstance::new("A", SagaContext::new());
    let mut running_saved = running.clone();
    running_saved.version = store.save(&running).await.unwrap();
    running_saved.transition(SagaStatus::Running).unwrap();
    store.save(&running_saved).await.unwrap();

    let mut done = SagaInstance::new("B", SagaContext::new());
    done.status = SagaStatus::Completed;
    store.save(&done).await.unwrap();

    let active = store.list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, running.id);

    let by_name = store
        .list(InstanceQuery::new().definition_name("B"))
        .await
        .unwrap();
    assert_eq!(by_name.len(), 1);
    assert_eq!(by_name[0].status, SagaStatus::Completed);
}
