use std::path::Path;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::Mutex;
use tracksync_core::{EntityKind, Record, Value};
use tracksync_normalize::{load_payload_file, normalize, unwrap_envelope, NormalizedBatch};
use tracksync_storage::{
    prepare_rows, StoreConfig, StoreError, UpsertStore, WriteOutcome, MAX_BIND_PARAMS,
};
use uuid::Uuid;

// concurrent CREATE ... IF NOT EXISTS can race on the system catalogs
static MIGRATE: Mutex<()> = Mutex::const_new(());

// two bind parameters per junction row
const PAIRS_PER_STATEMENT: usize = MAX_BIND_PARAMS / 2;

async fn connect_db_from_env() -> Option<UpsertStore> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    let store = UpsertStore::connect(&StoreConfig::new(database_url)).await.ok()?;
    let _guard = MIGRATE.lock().await;
    store.migrate().await.expect("migrate");
    Some(store)
}

fn lazy_store() -> UpsertStore {
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://tracksync@localhost/unused")
        .expect("lazy pool");
    UpsertStore::from_pool(pool)
}

fn fixture_batch(kind: EntityKind) -> NormalizedBatch {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(kind.source().as_str())
        .join(format!("{}.json", kind.table()));
    let records = unwrap_envelope(load_payload_file(path).expect("fixture")).expect("envelope");
    normalize(kind, records.as_ref())
        .expect("normalize")
        .into_batch()
        .expect("fixture has records")
}

fn user(id: &str, name: &str) -> Record {
    let mut record = Record::new();
    record.insert("id", id);
    record.insert("name", name);
    record.insert("active", Value::Bool(true));
    record
}

#[tokio::test]
async fn empty_write_is_a_no_op_without_touching_the_database() {
    let store = lazy_store();
    assert_eq!(store.write("linear.users", &[]).await.unwrap(), WriteOutcome::NoOp);
}

#[tokio::test]
async fn invalid_writes_fail_before_any_sql_is_sent() {
    let store = lazy_store();
    let records = vec![user("u1", "Ada")];

    let err = store.write("linear.nope", &records).await.unwrap_err();
    assert!(matches!(err, StoreError::UnknownTable(ref t) if t == "linear.nope"));

    let mut mistyped = Record::new();
    mistyped.insert("id", "p1");
    mistyped.insert("hourly_rate_amount", Value::Bool(true));
    let err = store.write("clockify.projects", &[mistyped]).await.unwrap_err();
    assert!(matches!(err, StoreError::TypeMismatch { .. }));

    let err = store
        .write("linear.users", &[Record::from_iter([("name", "anonymous")])])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::MissingKey { .. }));
}

#[tokio::test]
async fn upsert_keeps_one_row_with_the_latest_values() {
    let Some(store) = connect_db_from_env().await else {
        return;
    };
    let id = format!("usr-{}", Uuid::new_v4());

    let first = store.write("linear.users", &[user(&id, "before")]).await.unwrap();
    assert_eq!(first, WriteOutcome::Written);
    store.write("linear.users", &[user(&id, "after")]).await.unwrap();

    let row = store.fetch_by_id("linear.users", &id).await.unwrap();
    assert_eq!(row.get("name"), Some(&Value::from("after")));
    let matching = store
        .fetch_all("linear.users")
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.id() == Some(id.as_str()))
        .count();
    assert_eq!(matching, 1);
}

#[tokio::test]
async fn duplicate_keys_in_one_batch_keep_the_last_occurrence() {
    let Some(store) = connect_db_from_env().await else {
        return;
    };
    let id = format!("usr-{}", Uuid::new_v4());
    let batch = vec![user(&id, "first"), user(&id, "second")];
    assert_eq!(store.write("linear.users", &batch).await.unwrap(), WriteOutcome::Written);

    let row = store.fetch_by_id("linear.users", &id).await.unwrap();
    assert_eq!(row.get("name"), Some(&Value::from("second")));
}

#[tokio::test]
async fn writing_the_same_batch_twice_is_idempotent() {
    let Some(store) = connect_db_from_env().await else {
        return;
    };
    let users = fixture_batch(EntityKind::LinearUsers);
    let teams = fixture_batch(EntityKind::LinearTeams);

    store.write_batch(&users).await.unwrap();
    store.write_batch(&teams).await.unwrap();
    let before_users = store.fetch_all("linear.users").await.unwrap();
    let before_members = store.fetch_all("linear.team_members").await.unwrap();

    store.write_batch(&users).await.unwrap();
    let second = store.write_batch(&teams).await.unwrap();
    let members = second
        .iter()
        .find(|w| w.relation == "linear.team_members")
        .unwrap();
    assert_eq!(members.outcome, WriteOutcome::Unchanged);

    let fixture_ids: Vec<_> = users.primary.records.iter().filter_map(Record::id).collect();
    let pick = |rows: Vec<Record>| {
        rows.into_iter()
            .filter(|r| r.id().is_some_and(|id| fixture_ids.contains(&id)))
            .collect::<Vec<_>>()
    };
    assert_eq!(
        pick(store.fetch_all("linear.users").await.unwrap()),
        pick(before_users)
    );
    assert_eq!(store.fetch_all("linear.team_members").await.unwrap().len(), before_members.len());
}

#[tokio::test]
async fn typed_columns_survive_the_round_trip() {
    let Some(store) = connect_db_from_env().await else {
        return;
    };
    let entries = fixture_batch(EntityKind::ClockifyTimeEntries);
    store.write_batch(&entries).await.unwrap();

    let expected = &entries.primary.records[0];
    let stored = store
        .fetch_by_id("clockify.time_entries", expected.id().unwrap())
        .await
        .unwrap();
    assert_eq!(&stored, expected);
    assert_eq!(
        stored.get("time_interval_duration"),
        Some(&Value::Duration(chrono::Duration::minutes(90)))
    );
}

#[tokio::test]
async fn missing_rows_and_dangling_references_are_reported() {
    let Some(store) = connect_db_from_env().await else {
        return;
    };
    let err = store
        .fetch_by_id("linear.users", &Uuid::new_v4().to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    let dangling = Record::from_iter([
        ("team_id", Uuid::new_v4().to_string()),
        ("user_id", Uuid::new_v4().to_string()),
    ]);
    let err = store.write("linear.team_members", &[dangling]).await.unwrap_err();
    assert!(matches!(err, StoreError::Constraint { .. }), "{err:?}");
}

fn member(team_id: &str, user_id: &str) -> Record {
    Record::from_iter([("team_id", team_id), ("user_id", user_id)])
}

async fn members_of(store: &UpsertStore, team_id: &str) -> usize {
    store
        .fetch_all("linear.team_members")
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.get("team_id") == Some(&Value::from(team_id)))
        .count()
}

#[tokio::test]
async fn a_failing_row_rolls_back_the_whole_write() {
    let Some(store) = connect_db_from_env().await else {
        return;
    };
    let team_id = format!("team-{}", Uuid::new_v4());
    let user_id = format!("usr-{}", Uuid::new_v4());
    store
        .write("linear.teams", &[Record::from_iter([("id", team_id.as_str())])])
        .await
        .unwrap();
    store.write("linear.users", &[user(&user_id, "Ada")]).await.unwrap();

    let batch = vec![
        member(&team_id, &user_id),
        member(&team_id, &Uuid::new_v4().to_string()),
    ];
    let err = store.write("linear.team_members", &batch).await.unwrap_err();
    assert!(matches!(err, StoreError::Constraint { .. }), "{err:?}");
    assert_eq!(members_of(&store, &team_id).await, 0);
}

#[tokio::test]
async fn statements_split_across_chunks_share_one_transaction() {
    let Some(store) = connect_db_from_env().await else {
        return;
    };
    let team_id = format!("team-{}", Uuid::new_v4());
    store
        .write("linear.teams", &[Record::from_iter([("id", team_id.as_str())])])
        .await
        .unwrap();

    let table = store.table("linear.team_members").unwrap();
    let users: Vec<Record> = (0..PAIRS_PER_STATEMENT)
        .map(|_| Record::from_iter([("id", format!("usr-{}", Uuid::new_v4()))]))
        .collect();
    store.write("linear.users", &users).await.unwrap();

    // every pair but the last one is valid; the dangling one lands in the second statement
    let mut batch: Vec<Record> = users
        .iter()
        .map(|u| member(&team_id, u.id().unwrap()))
        .collect();
    batch.push(member(&team_id, &Uuid::new_v4().to_string()));
    let prepared = prepare_rows(table, &batch).unwrap();
    assert_eq!(prepared.groups.len(), 1);
    assert!(prepared.groups[0].rows.len() > prepared.groups[0].rows_per_statement());

    let err = store.write("linear.team_members", &batch).await.unwrap_err();
    assert!(matches!(err, StoreError::Constraint { .. }), "{err:?}");
    assert_eq!(members_of(&store, &team_id).await, 0);
}
