//! End-to-end tests for the module plane: manifest discovery, instance
//! spawning, registration, correlated dispatch, timeouts, and cleanup.
//!
//! Modules here are small POSIX shell scripts speaking the NDJSON IPC
//! protocol on stdio, so the tests exercise real child processes without
//! needing a JavaScript runtime on the test machine.

use atrium::correlator::RequestKind;
use atrium::error::DispatchError;
use atrium::manifest::ManifestRegistry;
use atrium::supervisor::ModuleHost;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// A module that registers one route and one command, then answers every
/// invoke with `{"pong": true}`.
const PONG_MODULE: &str = r#"
echo '{"type":"register","routes":[{"method":"GET","path":"/ping","handlerId":"h1"}],"commands":[{"name":"echo","handlerId":"h2"}]}'
while read -r line; do
  case "$line" in
    *'"type":"invoke"'*)
      id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
      printf '{"type":"response","id":"%s","payload":{"pong":true}}\n' "$id"
      ;;
  esac
done
"#;

/// A module that registers and then never replies to anything.
const SILENT_MODULE: &str = r#"
echo '{"type":"register","routes":[{"method":"GET","path":"/op","handlerId":"h1"}],"commands":[]}'
while read -r line; do
  :
done
"#;

fn write_fake_module(root: &Path, name: &str, manifest_extra: &str, script: &str) {
    let dir = root.join(name);
    let dist = dir.join("dist");
    std::fs::create_dir_all(&dist).unwrap();
    std::fs::write(
        dir.join("manifest.json"),
        format!(r#"{{"name": "{name}"{manifest_extra}}}"#),
    )
    .unwrap();
    std::fs::write(dist.join("index.js"), script).unwrap();
}

async fn load_from(root: &Path, host: &Arc<ModuleHost>, counts: &[(&str, usize)]) {
    let registry = ManifestRegistry::scan(root).unwrap();
    let order = registry.resolve_order().unwrap();
    host.record_discovered(&registry.names());
    host.record_skipped(&order.skipped);

    for name in &order.sorted {
        let manifest = registry.get(name).unwrap().clone();
        let count = counts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| *c)
            .unwrap_or(1);
        host.load_module(manifest, count).await;
    }
}

/// Poll until the module has registered its routes.
async fn wait_for_registration(host: &Arc<ModuleHost>) {
    timeout(Duration::from_secs(5), async {
        while host.registry.route_count() == 0 {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("module never registered");
}

#[tokio::test(flavor = "multi_thread")]
async fn register_then_dispatch_round_trip() {
    let root = tempfile::tempdir().unwrap();
    write_fake_module(root.path(), "fake", "", PONG_MODULE);

    let host = ModuleHost::new("sh", json!({}), None);
    load_from(root.path(), &host, &[]).await;
    wait_for_registration(&host).await;

    // register -> lookup returns exactly the registered handler.
    let route = host.registry.lookup_route("fake", "GET", "/ping").unwrap();
    assert_eq!(route.entry.handler_id, "h1");

    let command = host.registry.lookup_command("fake.echo").unwrap();
    assert_eq!(command.handler_id, "h2");

    let reply = host
        .dispatch(
            "fake",
            "h1",
            json!({"query": {}, "params": {}}),
            None,
            RequestKind::Http,
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(reply.payload, json!({"pong": true}));

    host.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn killed_module_becomes_unavailable() {
    let root = tempfile::tempdir().unwrap();
    write_fake_module(root.path(), "fake", "", PONG_MODULE);

    let host = ModuleHost::new("sh", json!({}), None);
    load_from(root.path(), &host, &[]).await;
    wait_for_registration(&host).await;

    host.shutdown();

    // Cleanup removes the module, its routes, and its commands.
    timeout(Duration::from_secs(5), async {
        while host.module_count() > 0 {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("module was never cleaned up");

    assert_eq!(host.registry.route_count(), 0);
    assert_eq!(host.registry.command_count(), 0);

    // Still known from the scan, but with nothing live behind it; the
    // gateway turns this state into a 503 rather than a 404.
    assert!(host.is_known_module("fake"));
    assert!(!host.has_live_instances("fake"));

    let err = host
        .dispatch(
            "fake",
            "h1",
            json!({}),
            None,
            RequestKind::Http,
            None,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Unavailable(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_module_times_out() {
    let root = tempfile::tempdir().unwrap();
    write_fake_module(root.path(), "slow", "", SILENT_MODULE);

    let host = ModuleHost::new("sh", json!({}), None);
    load_from(root.path(), &host, &[]).await;
    wait_for_registration(&host).await;

    let started = std::time::Instant::now();
    let err = host
        .dispatch(
            "slow",
            "h1",
            json!({}),
            None,
            RequestKind::Http,
            None,
            Duration::from_millis(400),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Timeout(_)));
    assert!(started.elapsed() >= Duration::from_millis(400));
    // The correlator entry died with the deadline.
    assert_eq!(host.correlator.in_flight(), 0);

    host.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_instance_false_caps_instance_count() {
    let root = tempfile::tempdir().unwrap();
    write_fake_module(
        root.path(),
        "single",
        r#", "multiInstanceSpawning": false"#,
        PONG_MODULE,
    );
    write_fake_module(root.path(), "scaled", "", PONG_MODULE);

    let host = ModuleHost::new("sh", json!({}), None);
    load_from(root.path(), &host, &[("single", 4), ("scaled", 3)]).await;
    wait_for_registration(&host).await;

    let statuses = host.module_statuses();
    let instances = |name: &str| {
        statuses
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.instances)
            .unwrap_or(0)
    };

    assert_eq!(instances("single"), 1);
    assert_eq!(instances("scaled"), 3);

    host.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_module_is_unavailable() {
    let host = ModuleHost::new("sh", json!({}), None);

    let err = host
        .dispatch(
            "ghost",
            "h1",
            json!({}),
            None,
            RequestKind::Http,
            None,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Unavailable(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_entry_file_skips_module() {
    let root = tempfile::tempdir().unwrap();

    // Manifest without an entry file on disk.
    let dir = root.path().join("broken");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("manifest.json"), r#"{"name": "broken"}"#).unwrap();

    write_fake_module(root.path(), "healthy", "", PONG_MODULE);

    let host = ModuleHost::new("sh", json!({}), None);
    load_from(root.path(), &host, &[]).await;
    wait_for_registration(&host).await;

    assert_eq!(host.module_count(), 1);
    assert!(host.skipped_modules().contains(&"broken".to_string()));
    assert!(host.registry.lookup_route("healthy", "GET", "/ping").is_some());

    host.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn dependency_order_loads_dependencies_first() {
    let root = tempfile::tempdir().unwrap();
    write_fake_module(root.path(), "base", "", PONG_MODULE);
    write_fake_module(
        root.path(),
        "addon",
        r#", "dependencies": ["base"]"#,
        PONG_MODULE,
    );

    let registry = ManifestRegistry::scan(root.path()).unwrap();
    let order = registry.resolve_order().unwrap();

    assert_eq!(order.sorted, vec!["base".to_string(), "addon".to_string()]);
    assert!(order.skipped.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn circular_dependency_aborts_boot() {
    let root = tempfile::tempdir().unwrap();
    write_fake_module(root.path(), "a", r#", "dependencies": ["b"]"#, PONG_MODULE);
    write_fake_module(root.path(), "b", r#", "dependencies": ["a"]"#, PONG_MODULE);

    let registry = ManifestRegistry::scan(root.path()).unwrap();
    // Fatal: no partial load list comes back.
    assert!(registry.resolve_order().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn sharded_dispatch_is_sticky_across_instances() {
    let root = tempfile::tempdir().unwrap();

    // Each instance answers with its own pid so stickiness is observable.
    let script = r#"
echo '{"type":"register","routes":[{"method":"GET","path":"/who","handlerId":"h1"}],"commands":[]}'
while read -r line; do
  case "$line" in
    *'"type":"invoke"'*)
      id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
      printf '{"type":"response","id":"%s","payload":{"pid":%s}}\n' "$id" "$$"
      ;;
  esac
done
"#;
    write_fake_module(root.path(), "svc", "", script);

    let host = ModuleHost::new("sh", json!({}), None);
    load_from(root.path(), &host, &[("svc", 3)]).await;
    wait_for_registration(&host).await;

    let ask = |key: &'static str| {
        let host = host.clone();
        async move {
            host.dispatch(
                "svc",
                "h1",
                json!({}),
                Some(key),
                RequestKind::Http,
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap()
            .payload["pid"]
                .clone()
        }
    };

    let first = ask("user-42").await;
    for _ in 0..5 {
        assert_eq!(ask("user-42").await, first);
    }

    host.shutdown();
}
