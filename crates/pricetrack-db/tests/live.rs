//! Live integration tests for the Postgres stores using `#[sqlx::test]`.
//!
//! Each test gets a fresh, fully-migrated Postgres database spun up by the
//! sqlx test harness. The `migrations` path is relative to the crate root
//! (`crates/pricetrack-db/`), so `"../../migrations"` resolves to the
//! workspace migration directory.

use chrono::{DateTime, Duration, TimeZone, Utc};
use pricetrack_core::{CronExpression, NewProduct, Product, Schedule, ScheduleState};
use pricetrack_db::{PgStore, PriceLedgerStore, ProductStore, ScheduleStore};
use rust_decimal::Decimal;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
}

async fn seed_product(
    store: &PgStore,
    url: &str,
    price: Decimal,
    observed_at: DateTime<Utc>,
) -> Product {
    store
        .create_product(&NewProduct {
            name: format!("Product at {url}"),
            source_url: url.to_string(),
            initial_price: price,
            observed_at,
        })
        .await
        .unwrap_or_else(|e| panic!("seed_product failed for '{url}': {e}"))
}

async fn start_schedule(store: &PgStore, product: &Product, created_at: DateTime<Utc>) -> Schedule {
    let schedule = Schedule::new_playing(product.id, CronExpression::default(), created_at);
    let mut tx = store.begin_transaction().await.expect("begin");
    tx.add_schedule(&schedule).await.expect("add_schedule");
    tx.commit().await.expect("commit");
    schedule
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn create_product_writes_product_and_first_observation(pool: sqlx::PgPool) {
    let store = PgStore::new(pool);
    let product = seed_product(&store, "https://shop.test/a", Decimal::new(1999, 2), at(0)).await;

    assert!(store.product_exists("https://shop.test/a").await.unwrap());
    assert_eq!(
        store.get_product_url_by_id(product.id).await.unwrap().as_deref(),
        Some("https://shop.test/a")
    );

    let pair = store
        .get_current_and_previous(product.id)
        .await
        .unwrap()
        .expect("pair");
    assert_eq!(pair.current.price, Decimal::new(1999, 2));
    assert!(pair.previous.is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn duplicate_source_url_is_constraint_violation(pool: sqlx::PgPool) {
    let store = PgStore::new(pool.clone());
    seed_product(&store, "https://shop.test/dup", Decimal::ONE, at(0)).await;

    let err = store
        .create_product(&NewProduct {
            name: "Again".to_string(),
            source_url: "https://shop.test/dup".to_string(),
            initial_price: Decimal::TWO,
            observed_at: at(1),
        })
        .await
        .unwrap_err();
    assert!(err.is_constraint_violation(), "got {err:?}");

    // The failed create must not leave a stray observation behind.
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM price_observations")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn delete_product_cascades_to_ledger_and_schedules(pool: sqlx::PgPool) {
    let store = PgStore::new(pool);
    let product = seed_product(&store, "https://shop.test/del", Decimal::ONE, at(0)).await;
    start_schedule(&store, &product, at(1)).await;

    assert!(store.delete_product(product.id).await.unwrap());
    assert!(store.get_product(product.id).await.unwrap().is_none());
    assert!(store.get_schedule(product.id).await.unwrap().is_none());
    assert!(store
        .get_current_and_previous(product.id)
        .await
        .unwrap()
        .is_none());
    assert!(!store.delete_product(product.id).await.unwrap());
}

// ---------------------------------------------------------------------------
// Price ledger
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn previous_price_skips_equal_timestamps(pool: sqlx::PgPool) {
    let store = PgStore::new(pool);
    let product = seed_product(&store, "https://shop.test/p", Decimal::new(1000, 2), at(1)).await;
    store
        .append_observation(product.id, Decimal::new(1200, 2), at(2))
        .await
        .unwrap();
    store
        .append_observation(product.id, Decimal::new(1200, 2), at(3))
        .await
        .unwrap();

    let pair = store
        .get_current_and_previous(product.id)
        .await
        .unwrap()
        .expect("pair");
    assert_eq!(pair.current.observed_at, at(3));
    assert_eq!(pair.previous.as_ref().map(|p| p.observed_at), Some(at(2)));
    assert_eq!(pair.percent_change(), Decimal::ZERO);

    // A duplicate of the newest timestamp does not become "previous".
    store
        .append_observation(product.id, Decimal::new(1500, 2), at(3))
        .await
        .unwrap();
    let pair = store
        .get_current_and_previous(product.id)
        .await
        .unwrap()
        .expect("pair");
    assert_eq!(pair.current.price, Decimal::new(1500, 2));
    assert_eq!(pair.previous.as_ref().map(|p| p.observed_at), Some(at(2)));
    assert_eq!(pair.percent_change(), Decimal::new(25, 0));
}

#[sqlx::test(migrations = "../../migrations")]
async fn append_for_missing_product_is_constraint_violation(pool: sqlx::PgPool) {
    let store = PgStore::new(pool);
    let err = store
        .append_observation(uuid::Uuid::new_v4(), Decimal::ONE, at(0))
        .await
        .unwrap_err();
    assert!(err.is_constraint_violation(), "got {err:?}");
}

#[sqlx::test(migrations = "../../migrations")]
async fn report_lists_each_product_once_with_latest_schedule_state(pool: sqlx::PgPool) {
    let store = PgStore::new(pool);
    let older = seed_product(&store, "https://shop.test/old", Decimal::new(1000, 2), at(0)).await;
    store
        .append_observation(older.id, Decimal::new(800, 2), at(10))
        .await
        .unwrap();
    let newer = seed_product(&store, "https://shop.test/new", Decimal::new(500, 2), at(5)).await;
    start_schedule(&store, &newer, at(6)).await;
    assert!(store
        .transition_state(newer.id, ScheduleState::Playing, ScheduleState::Paused)
        .await
        .unwrap());

    let rows = store.list_all_with_analytics().await.unwrap();
    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0].id, newer.id);
    assert_eq!(rows[0].schedule_state, Some(ScheduleState::Paused));
    assert_eq!(rows[0].current_price, Some(Decimal::new(500, 2)));
    assert_eq!(rows[0].percent_change, Decimal::ZERO);

    assert_eq!(rows[1].id, older.id);
    assert_eq!(rows[1].schedule_state, None);
    assert_eq!(rows[1].previous_price, Some(Decimal::new(1000, 2)));
    assert_eq!(rows[1].percent_change, Decimal::new(-20, 0));
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn rollback_discards_schedule(pool: sqlx::PgPool) {
    let store = PgStore::new(pool);
    let product = seed_product(&store, "https://shop.test/rb", Decimal::ONE, at(0)).await;

    let mut tx = store.begin_transaction().await.unwrap();
    tx.add_schedule(&Schedule::new_playing(product.id, CronExpression::default(), at(1)))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert!(store.get_schedule(product.id).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn second_active_schedule_is_rejected(pool: sqlx::PgPool) {
    let store = PgStore::new(pool);
    let product = seed_product(&store, "https://shop.test/two", Decimal::ONE, at(0)).await;
    start_schedule(&store, &product, at(1)).await;

    let mut tx = store.begin_transaction().await.unwrap();
    let err = tx
        .add_schedule(&Schedule::new_playing(product.id, CronExpression::default(), at(2)))
        .await
        .unwrap_err();
    assert!(err.is_constraint_violation(), "got {err:?}");
    tx.rollback().await.unwrap();

    // Once stopped, a fresh schedule may be created and becomes the latest.
    assert!(store
        .transition_state(product.id, ScheduleState::Playing, ScheduleState::Stopped)
        .await
        .unwrap());
    start_schedule(&store, &product, at(3)).await;

    let history = store.list_schedules_for_product(product.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].state, ScheduleState::Stopped);
    let latest = store.get_schedule(product.id).await.unwrap().unwrap();
    assert_eq!(latest.state, ScheduleState::Playing);
    assert_eq!(latest.created_at, at(3));
}

#[sqlx::test(migrations = "../../migrations")]
async fn record_run_updates_active_schedule_only(pool: sqlx::PgPool) {
    let store = PgStore::new(pool);
    let product = seed_product(&store, "https://shop.test/run", Decimal::ONE, at(0)).await;
    start_schedule(&store, &product, at(1)).await;

    store
        .record_run(product.id, at(60), Some(at(120)))
        .await
        .unwrap();
    let schedule = store.get_schedule(product.id).await.unwrap().unwrap();
    assert_eq!(schedule.last_run, Some(at(60)));
    assert_eq!(schedule.next_run, Some(at(120)));

    store
        .transition_state(product.id, ScheduleState::Playing, ScheduleState::Stopped)
        .await
        .unwrap();
    store.record_run(product.id, at(180), None).await.unwrap();
    let schedule = store.get_schedule(product.id).await.unwrap().unwrap();
    assert_eq!(schedule.last_run, Some(at(60)));

    let playing = store
        .list_schedules_by_state(ScheduleState::Playing)
        .await
        .unwrap();
    assert!(playing.is_empty());
}
