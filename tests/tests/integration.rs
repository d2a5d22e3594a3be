use std::sync::Arc;

use hotswap_kernel::{FrameworkState, LifecycleEvent, ModuleKey, ModuleState};
use hotswap_plugins::{
    ArtifactNameDescriptors, BytesArtifact, EntryLocation, HostResolver, LifecycleError,
    PluginFramework, PluginsError, Resolver,
};
use hotswap_testing::{ArchiveBuilder, PluginDir, RecordingEventSink, ScriptedActivator};

fn key(k: &str) -> ModuleKey {
    ModuleKey::new(k).unwrap()
}

fn framework(
    dir: &PluginDir,
    activator: &ScriptedActivator,
    sink: &RecordingEventSink,
) -> PluginFramework {
    PluginFramework::builder(dir.config())
        .activator(Arc::new(activator.clone()))
        .event_sink(Arc::new(sink.clone()))
        .build()
        .unwrap()
}

#[test]
fn test_resolution_order_seen_by_activation() {
    let dir = PluginDir::new();
    let host = Arc::new(HostResolver::new());
    host.register("json", b"host-json".to_vec());
    host.register("log-api", b"host-log".to_vec());

    dir.deploy(
        "reports-1.0.zip",
        &ArchiveBuilder::new()
            .entry("json", "module-json")
            .nested("a.zip", ArchiveBuilder::new().entry("json", "a-json").entry("yaml", "a-yaml"))
            .nested("b.zip", ArchiveBuilder::new().entry("yaml", "b-yaml").entry("csv", "b-csv")),
    );

    let activator = ScriptedActivator::new();
    for probe in ["json", "yaml", "csv", "log-api", "missing"] {
        activator.probe(probe);
    }
    let framework = PluginFramework::builder(dir.config())
        .activator(Arc::new(activator.clone()))
        .host_resolver(host)
        .build()
        .unwrap();
    framework.start().unwrap();

    let id = framework.lifecycle().modules()[0].clone();
    assert_eq!(activator.observed_bytes(&id, "json").unwrap(), b"module-json");
    assert_eq!(activator.observed_bytes(&id, "yaml").unwrap(), b"a-yaml");
    assert_eq!(activator.observed_bytes(&id, "csv").unwrap(), b"b-csv");
    assert_eq!(activator.observed_bytes(&id, "log-api").unwrap(), b"host-log");
    assert_eq!(activator.observed_bytes(&id, "missing"), None);

    let resolver = framework.resolver(&key("reports")).unwrap();
    assert!(matches!(
        resolver.find_resource("log-api").unwrap(),
        EntryLocation::Host { .. }
    ));
    match resolver.find_resource("yaml").unwrap() {
        EntryLocation::Nested { bundled_as, .. } => assert_eq!(bundled_as, "bundled-libs/a.zip"),
        other => panic!("unexpected location {other:?}"),
    }
}

#[test]
fn test_failed_activation_is_reported_and_recoverable() {
    let dir = PluginDir::new();
    dir.deploy("audit-1.0.0.zip", &ArchiveBuilder::new().entry("a", "a"));
    dir.deploy("mail-1.0.0.zip", &ArchiveBuilder::new().entry("m", "m"));

    let activator = ScriptedActivator::new();
    let sink = RecordingEventSink::new();
    let framework = framework(&dir, &activator, &sink);

    let audit = hotswap_kernel::ModuleId::new(key("audit"), "1.0.0");
    activator.fail_activation(&audit);
    framework.start().unwrap();

    let lifecycle = framework.lifecycle();
    assert_eq!(lifecycle.state(&audit), Some(ModuleState::Failed));
    assert!(lifecycle.failure(&audit).unwrap().contains("scripted activation failure"));
    assert!(sink.events().iter().any(|e| matches!(
        e,
        LifecycleEvent::ModuleFailed { module, .. } if *module == audit
    )));
    // the other module is unaffected
    let mail = hotswap_kernel::ModuleId::new(key("mail"), "1.0.0");
    assert_eq!(lifecycle.state(&mail), Some(ModuleState::Enabled));

    activator.heal();
    lifecycle.enable(&audit).unwrap();
    assert_eq!(lifecycle.state(&audit), Some(ModuleState::Enabled));
    hotswap_testing::assert_activated!(activator, &audit, 2);
}

#[test]
fn test_non_disableable_module() {
    let dir = PluginDir::new();
    dir.deploy("core-1.0.zip", &ArchiveBuilder::new().entry("c", "c"));

    let framework = PluginFramework::builder(dir.config())
        .descriptors(Arc::new(ArtifactNameDescriptors::new().non_disableable(key("core"))))
        .build()
        .unwrap();
    framework.start().unwrap();

    let id = framework.lifecycle().modules()[0].clone();
    let err = framework.lifecycle().disable(&id).unwrap_err();
    assert!(matches!(err, LifecycleError::NotDisableable(_)));
    assert_eq!(framework.lifecycle().state(&id), Some(ModuleState::Enabled));
}

#[test]
fn test_install_upgrade_revert_round_trip() {
    let dir = PluginDir::new();
    let original = ArchiveBuilder::new().entry("version", "1");
    let deployed = dir.deploy("audit-1.0.0.zip", &original);
    let original_bytes = std::fs::read(&deployed).unwrap();

    let activator = ScriptedActivator::new();
    let sink = RecordingEventSink::new();
    let framework = framework(&dir, &activator, &sink);
    framework.start().unwrap();

    let k = key("audit");
    for _ in 0..3 {
        framework
            .install_plugin(&k, &BytesArtifact::new("audit-1.0.0.zip", original_bytes.clone()))
            .unwrap();
    }
    framework
        .install_plugin(
            &k,
            &BytesArtifact::new("audit-2.0.0.zip", ArchiveBuilder::new().entry("version", "2").build()),
        )
        .unwrap();
    assert_eq!(dir.listing(), vec![".bak-audit-1.0.0.zip", "audit-2.0.0.zip"]);
    assert_eq!(framework.installer().backup_records().len(), 1);

    let resolver = framework.resolver(&k).unwrap();
    assert_eq!(&*resolver.resolve("version").unwrap().bytes, b"2");

    assert!(framework.revert_plugin(&k).unwrap());
    assert_eq!(dir.listing(), vec!["audit-1.0.0.zip"]);
    assert_eq!(std::fs::read(&deployed).unwrap(), original_bytes);
    let resolver = framework.resolver(&k).unwrap();
    assert_eq!(&*resolver.resolve("version").unwrap().bytes, b"1");
    assert!(!framework.installer().has_backup(&k));
}

#[test]
fn test_stray_backup_blocks_install() {
    let dir = PluginDir::new();
    dir.deploy("audit-1.0.0.zip", &ArchiveBuilder::new().entry("v", "1"));
    std::fs::write(dir.plugins().join(".bak-audit-1.0.0.zip"), b"left over").unwrap();

    let framework = PluginFramework::builder(dir.config()).build().unwrap();
    framework.start().unwrap();

    let err = framework
        .install_plugin(
            &key("audit"),
            &BytesArtifact::new("audit-1.0.0.zip", ArchiveBuilder::new().entry("v", "2").build()),
        )
        .unwrap_err();
    assert!(matches!(err.current_context(), PluginsError::Install(_)));
}

#[test]
fn test_framework_events_carry_snapshots() {
    let dir = PluginDir::new();
    dir.deploy("audit-1.0.0.zip", &ArchiveBuilder::new().entry("v", "1"));

    let activator = ScriptedActivator::new();
    let sink = RecordingEventSink::new();
    let framework = framework(&dir, &activator, &sink);

    framework.start().unwrap();
    framework.warm_restart().unwrap();
    framework.shutdown().unwrap();

    let snapshots: Vec<_> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            LifecycleEvent::FrameworkStarted(s)
            | LifecycleEvent::FrameworkWarmRestarted(s)
            | LifecycleEvent::FrameworkShutdown(s) => Some(s),
            _ => None,
        })
        .collect();

    assert_eq!(snapshots.len(), 3);
    assert_eq!(snapshots[0].state, FrameworkState::Started);
    assert_eq!(snapshots[0].modules.len(), 1);
    assert_eq!(snapshots[1].state, FrameworkState::Started);
    assert_eq!(snapshots[2].state, FrameworkState::Shutdown);
    assert!(snapshots[2].modules.is_empty());

    // activate, deactivate and reactivate on warm restart, deactivate on shutdown
    assert_eq!(activator.history().len(), 4);
}

#[test]
fn test_shutdown_releases_nested_scratch_files() {
    let dir = PluginDir::new();
    dir.deploy(
        "reports-1.0.zip",
        &ArchiveBuilder::new().nested("lib.zip", ArchiveBuilder::new().entry("x", "x")),
    );

    let framework = PluginFramework::builder(dir.config()).build().unwrap();
    framework.start().unwrap();
    assert_eq!(dir.scratch_files(), 1);

    framework.warm_restart().unwrap();
    assert_eq!(dir.scratch_files(), 1);

    framework.shutdown().unwrap();
    assert_eq!(dir.scratch_files(), 0);
}

#[test]
fn test_changed_artifact_swaps_module_in_place() {
    let dir = PluginDir::new();
    let path = dir.deploy("audit-1.0.0.zip", &ArchiveBuilder::new().entry("v", "1"));

    let activator = ScriptedActivator::new();
    let sink = RecordingEventSink::new();
    let framework = framework(&dir, &activator, &sink);
    framework.start().unwrap();
    sink.clear();

    ArchiveBuilder::new().entry("v", "1b").write_to(&path);
    dir.bump_mtime(&path);
    assert_eq!(framework.scan_for_new_modules().unwrap(), 1);

    assert_eq!(
        sink.names(),
        vec!["module_uninstalled", "module_installed", "module_enabled"]
    );
    let resolver = framework.resolver(&key("audit")).unwrap();
    assert_eq!(&*resolver.resolve("v").unwrap().bytes, b"1b");
}

#[tokio::test]
async fn test_poller_hot_swaps_changed_artifact() {
    let dir = PluginDir::new();
    let path = dir.deploy("audit-1.0.0.zip", &ArchiveBuilder::new().entry("v", "1"));

    let activator = ScriptedActivator::new();
    let sink = RecordingEventSink::new();
    let config = dir.config().with_scan_interval(std::time::Duration::from_millis(10));
    let framework = Arc::new(
        PluginFramework::builder(config)
            .activator(Arc::new(activator.clone()))
            .event_sink(Arc::new(sink.clone()))
            .build()
            .unwrap(),
    );
    framework.start().unwrap();
    let (poller, loader) = framework.spawn_poller();

    ArchiveBuilder::new().entry("v", "2").write_to(&path);
    dir.bump_mtime(&path);

    let mut swapped = false;
    for _ in 0..500 {
        let bytes = framework
            .resolver(&key("audit"))
            .and_then(|r| r.resolve("v").ok())
            .map(|u| u.bytes.to_vec());
        if bytes.as_deref() == Some(b"2".as_slice()) {
            swapped = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(swapped);

    poller.stop().await;
    loader.await.unwrap();

    let audit = hotswap_kernel::ModuleId::new(key("audit"), "1.0.0");
    hotswap_testing::assert_activated!(activator, &audit, 2);
    assert!(sink.names().contains(&"module_uninstalled"));
    framework.shutdown().unwrap();
}
