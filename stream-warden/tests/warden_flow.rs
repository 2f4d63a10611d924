//! End-to-end flow over the warden with fake site adapters and a shell
//! script standing in for ffmpeg.
#![cfg(unix)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::broadcast;

use stream_warden::Error;
use stream_warden::api::CommandTable;
use stream_warden::database::{self, DbPool, SqlitePersistence};
use stream_warden::events::{DomainEvent, EventSink};
use stream_warden::locator::{LocatorService, PluginManager, StreamExtractor};
use stream_warden::notification::NoopNotifier;
use stream_warden::recorder::{CaptureBackend, RecorderConfig, RecordingService};
use stream_warden::utils::process::capture_command;
use stream_warden::warden::{QuotaLimits, Warden, WardenParts};

struct FakeExtractor {
    prefix: &'static str,
    live: RwLock<HashSet<String>>,
}

impl FakeExtractor {
    fn new(prefix: &'static str) -> Arc<Self> {
        Arc::new(Self {
            prefix,
            live: RwLock::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl StreamExtractor for FakeExtractor {
    fn can_parse(&self, url: &str) -> bool {
        url.starts_with(self.prefix)
    }

    async fn extract(&self, url: &str) -> stream_warden::Result<Option<String>> {
        Ok(self
            .live
            .read()
            .contains(url)
            .then(|| format!("{}/index.m3u8", url)))
    }
}

struct ScriptBackend;

impl CaptureBackend for ScriptBackend {
    fn name(&self) -> &str {
        "script"
    }

    fn command(&self, _source: &str, output: &Path) -> Command {
        let mut cmd = capture_command("sh");
        cmd.arg("-c")
            .arg(r#"printf 'capture' > "$OUT""#)
            .env("OUT", output);
        cmd
    }
}

struct Harness {
    warden: Arc<Warden>,
    extractor: Arc<FakeExtractor>,
    locator: Arc<LocatorService>,
    locators: Vec<Arc<LocatorService>>,
}

fn build(pool: &DbPool, dirs: &TempDir) -> Harness {
    build_with(pool, dirs, &[("fake", "https://fake.tv/")])
}

fn build_with(pool: &DbPool, dirs: &TempDir, plugins: &[(&'static str, &'static str)]) -> Harness {
    let manager = Arc::new(PluginManager::new());
    let mut extractors = Vec::new();
    let mut locators = Vec::new();
    for (name, prefix) in plugins {
        let extractor = FakeExtractor::new(*prefix);
        let locator = Arc::new(LocatorService::new(
            *name,
            extractor.clone(),
            Duration::from_secs(3600),
        ));
        manager.register(*name, locator.clone()).unwrap();
        extractors.push(extractor);
        locators.push(locator);
    }

    let recorder = RecordingService::new(
        Arc::new(ScriptBackend),
        RecorderConfig {
            archive_dir: dirs.path().join("archive"),
            quit_timeout: Duration::from_secs(2),
            progress_window: Duration::from_millis(100),
        },
    );

    let warden = Warden::new(WardenParts {
        manager,
        recorder,
        persistence: Arc::new(SqlitePersistence::new(pool.clone())),
        notifier: Arc::new(NoopNotifier),
        events: EventSink::new(),
        recording_dir: dirs.path().join("recordings"),
        disk_check_interval: Duration::from_secs(3600),
        quotas: QuotaLimits {
            instances: 2,
            ..Default::default()
        },
    })
    .unwrap();

    Harness {
        warden,
        extractor: extractors[0].clone(),
        locator: locators[0].clone(),
        locators,
    }
}

async fn wait_for(
    rx: &mut broadcast::Receiver<DomainEvent>,
    matches: impl Fn(&DomainEvent) -> bool,
) -> DomainEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for domain event")
}

#[tokio::test]
async fn test_live_source_is_captured_archived_and_restored() {
    let dirs = TempDir::new().unwrap();
    let pool = database::init_memory_pool().await.unwrap();
    database::run_migrations(&pool).await.unwrap();

    let harness = build(&pool, &dirs);
    let warden = harness.warden.clone();
    let summary = warden.restore().await.unwrap();
    assert_eq!(summary.plugins, 1);
    assert_eq!(summary.sources, 0);

    let watched = warden.add_source("https://fake.tv/alice").await.unwrap();
    assert_eq!(watched.owner.as_deref(), Some("fake"));
    let parked = warden.add_source("https://other.tv/bob").await.unwrap();
    assert_eq!(parked.owner, None);
    assert_eq!(parked.last_known_validity, Some(false));
    assert_eq!(harness.locator.urls(), vec!["https://fake.tv/alice"]);

    let mut events = warden.events().subscribe();
    warden.start();

    harness
        .extractor
        .live
        .write()
        .insert("https://fake.tv/alice".to_string());
    harness.locator.sweep_now().await.unwrap();

    let event = wait_for(&mut events, |e| {
        matches!(e, DomainEvent::ArchiveRecordAdded { .. })
    })
    .await;
    let DomainEvent::ArchiveRecordAdded { record } = event else {
        unreachable!();
    };
    assert_eq!(record.label, "https://fake.tv/alice");
    assert_eq!(record.size_bytes, 7);
    assert!(Path::new(&record.path).starts_with(dirs.path().join("archive")));

    // Back under its plugin once the capture is over.
    let view = warden.source("https://fake.tv/alice").unwrap();
    assert!(view.last_seen_at.is_some());
    assert!(!view.recording);
    assert_eq!(view.owner.as_deref(), Some("fake"));
    assert!(harness.locator.owns("https://fake.tv/alice"));

    // A stray file in the archive is reported as dangling.
    let stray = dirs.path().join("archive").join("stray.ts");
    tokio::fs::write(&stray, b"x").await.unwrap();
    assert_eq!(warden.dangling_archives().await.unwrap(), vec![stray]);

    warden.stop().await;

    // A fresh warden over the same database sees the same state.
    let restored = build(&pool, &dirs);
    let summary = restored.warden.restore().await.unwrap();
    assert_eq!(summary.sources, 2);
    assert_eq!(summary.archives, 1);
    assert_eq!(restored.locator.urls(), vec!["https://fake.tv/alice"]);
    let view = restored.warden.source("https://FAKE.tv/alice").unwrap();
    assert!(view.last_seen_at.is_some());
}

#[tokio::test]
async fn test_plugin_disable_parks_sources_and_persists() {
    let dirs = TempDir::new().unwrap();
    let pool = database::init_memory_pool().await.unwrap();
    database::run_migrations(&pool).await.unwrap();

    let harness = build(&pool, &dirs);
    let warden = harness.warden.clone();
    warden.restore().await.unwrap();
    warden.add_source("https://fake.tv/alice").await.unwrap();

    let id = warden.manager().plugin_by_name("fake").unwrap().id();
    assert!(id > 0);

    let plugin = warden.enable_plugin(id, false).await.unwrap();
    assert!(!plugin.enabled);
    assert!(harness.locator.urls().is_empty());
    assert_eq!(warden.source("https://fake.tv/alice").unwrap().owner, None);

    let restored = build(&pool, &dirs);
    restored.warden.restore().await.unwrap();
    let plugin = restored.warden.manager().plugin_by_name("fake").unwrap();
    assert!(!plugin.is_enabled());
    assert!(restored.locator.urls().is_empty());

    restored.warden.enable_plugin(id, true).await.unwrap();
    assert_eq!(restored.locator.urls(), vec!["https://fake.tv/alice"]);
}

#[tokio::test]
async fn test_command_table() {
    let dirs = TempDir::new().unwrap();
    let pool = database::init_memory_pool().await.unwrap();
    database::run_migrations(&pool).await.unwrap();

    let harness = build(&pool, &dirs);
    harness.warden.restore().await.unwrap();
    let commands = CommandTable::new(harness.warden.clone());

    assert!(commands.names().contains(&"snapshot"));
    assert!(matches!(
        commands.execute("launch_rockets", json!({})).await,
        Err(Error::NotFound { .. })
    ));

    let added = commands
        .execute("add_source", json!({ "url": "https://fake.tv/carol" }))
        .await
        .unwrap();
    assert_eq!(added["owner"], "fake");

    let duplicate = commands
        .execute("add_source", json!({ "url": "https://FAKE.tv/carol" }))
        .await;
    assert!(matches!(duplicate, Err(Error::Validation(_))));

    let missing_args = commands.execute("remove_source", json!({})).await;
    assert!(matches!(missing_args, Err(Error::Validation(_))));

    let snapshot = commands.execute("snapshot", json!(null)).await.unwrap();
    assert_eq!(snapshot["sources"].as_array().unwrap().len(), 1);
    assert_eq!(snapshot["quotas"][0]["name"], "instance");
    assert_eq!(snapshot["paused"], false);

    commands
        .execute("remove_source", json!({ "url": "https://fake.tv/carol" }))
        .await
        .unwrap();
    assert!(harness.locator.urls().is_empty());
    let dangling = commands
        .execute("dangling_archives", json!({}))
        .await
        .unwrap();
    assert_eq!(dangling, json!([]));
}

#[tokio::test]
async fn test_source_plugin_order_survives_restart() {
    let dirs = TempDir::new().unwrap();
    let pool = database::init_memory_pool().await.unwrap();
    database::run_migrations(&pool).await.unwrap();
    let plugins = [("fake", "https://fake.tv/"), ("generic", "https://")];

    let harness = build_with(&pool, &dirs, &plugins);
    harness.warden.restore().await.unwrap();
    let view = harness.warden.add_source("https://fake.tv/dave").await.unwrap();
    assert_eq!(view.plugins, vec!["fake", "generic"]);
    assert_eq!(view.owner.as_deref(), Some("fake"));

    let view = harness
        .warden
        .reorder_source_plugin("https://fake.tv/dave", 0, 1)
        .await
        .unwrap();
    assert_eq!(view.plugins, vec!["generic", "fake"]);
    assert_eq!(view.owner.as_deref(), Some("generic"));
    assert!(harness.locators[0].urls().is_empty());
    assert_eq!(harness.locators[1].urls(), vec!["https://fake.tv/dave"]);

    let order = harness.warden.reorder_plugin(1, 0).await.unwrap();
    assert_eq!(order, vec!["generic", "fake"]);

    let restored = build_with(&pool, &dirs, &plugins);
    restored.warden.restore().await.unwrap();
    let names: Vec<String> = restored
        .warden
        .manager()
        .plugins()
        .iter()
        .map(|p| p.name().to_string())
        .collect();
    assert_eq!(names, vec!["generic", "fake"]);
    let view = restored.warden.source("https://fake.tv/dave").unwrap();
    assert_eq!(view.plugins, vec!["generic", "fake"]);
    assert_eq!(restored.locators[1].urls(), vec!["https://fake.tv/dave"]);
}
