use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use sqlx::postgres::PgPoolOptions;
use tempfile::tempdir;
use tracksync_core::EntityKind;
use tracksync_normalize::{load_payload_file, unwrap_envelope};
use tracksync_storage::{StoreConfig, UpsertStore, WriteOutcome};
use tracksync_sync::{
    DirectorySource, EntityStatus, PayloadSource, Stage, SyncConfig, SyncPipeline,
};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn config(workspace_root: PathBuf, reports_dir: PathBuf) -> SyncConfig {
    SyncConfig {
        database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
        payload_dir: workspace_root.join("fixtures"),
        reports_dir,
        max_connections: 2,
        acquire_timeout_secs: 1,
        scheduler_enabled: false,
        sync_cron: "0 0 * * * *".to_string(),
        workspace_root,
    }
}

enum Canned {
    Payload(JsonValue),
    Broken(&'static str),
}

struct CannedSource(HashMap<EntityKind, Canned>);

#[async_trait]
impl PayloadSource for CannedSource {
    fn name(&self) -> &str {
        "canned"
    }

    async fn fetch(&self, entity: EntityKind) -> Result<Option<JsonValue>> {
        match self.0.get(&entity) {
            None => Ok(None),
            Some(Canned::Payload(v)) => Ok(Some(v.clone())),
            Some(Canned::Broken(msg)) => Err(anyhow!(*msg)),
        }
    }
}

#[tokio::test]
async fn each_entity_fails_or_succeeds_on_its_own() {
    let workspace = tempdir().expect("tempdir");
    std::fs::write(
        workspace.path().join("entities.yaml"),
        "entities:\n  - entity: linear.cycles\n  - entity: linear.issues\n  - entity: linear.users\n  - entity: linear.teams\n",
    )
    .unwrap();

    let malformed = unwrap_envelope(
        load_payload_file(workspace_root().join("fixtures/malformed/issues_missing_column.json"))
            .unwrap(),
    )
    .unwrap()
    .unwrap();
    let source = CannedSource(HashMap::from([
        (EntityKind::LinearCycles, Canned::Broken("upstream returned 502")),
        (EntityKind::LinearIssues, Canned::Payload(malformed)),
        (
            EntityKind::LinearUsers,
            Canned::Payload(json!([{"id": "u1", "name": "Ada", "active": true}])),
        ),
    ]));

    // nothing listens here, so every write times out acquiring a connection
    let pool = PgPoolOptions::new()
        .acquire_timeout(Duration::from_secs(1))
        .connect_lazy("postgres://tracksync@127.0.0.1:1/unused")
        .expect("lazy pool");
    let reports = workspace.path().join("reports");
    let pipeline = SyncPipeline::new(
        config(workspace.path().to_path_buf(), reports.clone()),
        Box::new(source),
        UpsertStore::from_pool(pool),
    );

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.entities.len(), 4);
    assert_eq!(summary.failed, 3);
    assert!(!summary.is_success());

    let cycles = summary.outcome(EntityKind::LinearCycles).unwrap();
    assert_eq!(cycles.stage, Some(Stage::Fetch));
    assert!(cycles.error.as_deref().unwrap().contains("upstream returned 502"));

    let issues = summary.outcome(EntityKind::LinearIssues).unwrap();
    assert_eq!(issues.status, EntityStatus::Failed);
    assert_eq!(issues.stage, Some(Stage::Normalize));
    assert!(issues.error.as_deref().unwrap().contains("triaged_at"));

    let users = summary.outcome(EntityKind::LinearUsers).unwrap();
    assert_eq!(users.stage, Some(Stage::Store));

    let teams = summary.outcome(EntityKind::LinearTeams).unwrap();
    assert_eq!(teams.status, EntityStatus::Empty);
    assert!(teams.error.is_none());

    let report: JsonValue = serde_json::from_str(
        &std::fs::read_to_string(reports.join(summary.run_id.to_string()).join("summary.json"))
            .unwrap(),
    )
    .unwrap();
    assert_eq!(report["failed"], json!(3));
    assert_eq!(report["source"], json!("canned"));
    assert_eq!(report["entities"][0]["entity"], json!("linear.cycles"));
    assert_eq!(report["entities"][0]["stage"], json!("fetch"));
    assert_eq!(report["entities"][3]["status"], json!("empty"));
}

#[tokio::test]
async fn fixture_sync_is_repeatable() {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        return;
    };
    let Ok(store) = UpsertStore::connect(&StoreConfig::new(database_url)).await else {
        return;
    };
    store.migrate().await.expect("migrate");

    let reports = tempdir().expect("tempdir");
    let root = workspace_root();
    let pipeline = SyncPipeline::new(
        config(root.clone(), reports.path().to_path_buf()),
        Box::new(DirectorySource::new(root.join("fixtures"))),
        store,
    );

    let first = pipeline.run_once().await.unwrap();
    assert!(first.is_success(), "{:#?}", first.entities);
    assert!(first
        .entities
        .iter()
        .all(|o| o.status == EntityStatus::Synced));

    let second = pipeline.run_once().await.unwrap();
    assert!(second.is_success());
    assert_ne!(first.run_id, second.run_id);
    let teams = second.outcome(EntityKind::LinearTeams).unwrap();
    let members = teams
        .writes
        .iter()
        .find(|w| w.relation == "linear.team_members")
        .unwrap();
    assert_eq!(members.outcome, WriteOutcome::Unchanged);
}
