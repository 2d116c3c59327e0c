//! End-to-end: supervisor, factory and endpoints over a fake fleet.

use std::path::{Path, PathBuf};
use std::time::Duration;

use plfm_device_plugin::config::Backend;
use plfm_device_plugin::endpoint::{Health, Request, Response, KUBELET_SOCKET, VISIBLE_DEVICES_ENV};
use plfm_device_plugin::supervisor::Trigger;
use plfm_device_plugin::{Flags, PluginFactory, Supervisor};
use plfm_gpu::{AnnotatedId, FakeLibrary, LibError, MigStrategy, NumaResolver};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

async fn roundtrip(socket: &Path, request: &Request) -> Response {
    let stream = UnixStream::connect(socket).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut json = serde_json::to_string(request).unwrap();
    json.push('\n');
    write.write_all(json.as_bytes()).await.unwrap();

    let mut lines = BufReader::new(read).lines();
    let line = lines.next_line().await.unwrap().unwrap();
    serde_json::from_str(&line).unwrap()
}

async fn wait_for(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{} never appeared", path.display());
}

fn flags(plugin_dir: &Path, strategy: MigStrategy) -> Flags {
    Flags {
        mig_strategy: Some(strategy),
        plugin_dir: Some(plugin_dir.to_path_buf()),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mixed_fleet_serves_each_resource() {
    let plugin_dir = tempfile::tempdir().unwrap();
    let sysfs = tempfile::tempdir().unwrap();
    std::fs::write(plugin_dir.path().join(KUBELET_SOCKET), b"").unwrap();

    let library = FakeLibrary::new(plfm_testing::mixed_fleet());
    let factory = PluginFactory::with_library(
        flags(plugin_dir.path(), MigStrategy::Mixed),
        NumaResolver::new(sysfs.path()),
        library.clone(),
    );
    let (tx, rx) = mpsc::channel(4);
    let handle = tokio::spawn(Supervisor::new(factory, rx).run());

    let gpu = plugin_dir.path().join("nvidia-gpu.sock");
    let small = plugin_dir.path().join("nvidia-mig-1g.5gb.sock");
    let large = plugin_dir.path().join("nvidia-mig-3g.20gb.sock");
    wait_for(&gpu).await;
    wait_for(&small).await;
    wait_for(&large).await;
    // Profiles without instantiated partitions get no endpoint.
    assert!(!plugin_dir.path().join("nvidia-mig-7g.40gb.sock").exists());

    match roundtrip(&large, &Request::List).await {
        Response::Devices { devices } => {
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].id, "MIG-large");
            assert_eq!(devices[0].health, Health::Healthy);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    let request = Request::PreferredAllocation {
        available: vec![AnnotatedId::new("GPU-full")],
        required: vec![],
        size: 1,
    };
    assert_eq!(
        roundtrip(&gpu, &request).await,
        Response::PreferredAllocation {
            devices: vec!["GPU-full".to_string()]
        }
    );

    match roundtrip(&small, &Request::Allocate { devices: vec!["MIG-small".to_string()] }).await {
        Response::Allocate(allocation) => {
            assert_eq!(allocation.envs.get(VISIBLE_DEVICES_ENV).map(String::as_str), Some("MIG-small"));
        }
        other => panic!("unexpected response: {other:?}"),
    }

    tx.send(Trigger::Shutdown("SIGTERM".to_string())).await.unwrap();
    handle.await.unwrap().unwrap();

    for socket in [&gpu, &small, &large] {
        assert!(!socket.exists(), "{} left behind", socket.display());
    }
    assert_eq!(library.init_calls(), 1);
    assert_eq!(library.shutdown_calls(), 1);
    assert_eq!(library.open_event_sets(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lenient_init_failure_waits_for_shutdown() {
    let plugin_dir = tempfile::tempdir().unwrap();
    let sysfs = tempfile::tempdir().unwrap();

    let library = FakeLibrary::new(plfm_testing::two_gpus());
    library.fail("init", LibError::LibraryNotFound);
    let flags = Flags {
        fail_on_init_error: Some(false),
        ..flags(plugin_dir.path(), MigStrategy::None)
    };
    let factory = PluginFactory::with_library(flags, NumaResolver::new(sysfs.path()), library.clone());
    let (tx, rx) = mpsc::channel(4);
    let handle = tokio::spawn(Supervisor::new(factory, rx).run());

    tx.send(Trigger::Hangup).await.unwrap();
    tx.send(Trigger::Shutdown("SIGTERM".to_string())).await.unwrap();
    handle.await.unwrap().unwrap();

    // The session never opened, so it is never closed.
    assert_eq!(library.shutdown_calls(), 0);
    assert!(!PathBuf::from(plugin_dir.path()).join("nvidia-gpu.sock").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fail_fast_init_failure_exits() {
    let plugin_dir = tempfile::tempdir().unwrap();
    let sysfs = tempfile::tempdir().unwrap();

    let library = FakeLibrary::new(plfm_testing::two_gpus());
    library.fail("init", LibError::Uninitialized);
    let factory = PluginFactory::with_library(
        flags(plugin_dir.path(), MigStrategy::None),
        NumaResolver::new(sysfs.path()),
        library,
    );
    let (_tx, rx) = mpsc::channel(4);

    let err = Supervisor::new(factory, rx).run().await.unwrap_err();
    assert!(err.to_string().contains("failed to initialize"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_strategy_layout_is_fatal() {
    let plugin_dir = tempfile::tempdir().unwrap();
    let sysfs = tempfile::tempdir().unwrap();
    std::fs::write(plugin_dir.path().join(KUBELET_SOCKET), b"").unwrap();

    // A full GPU next to a MIG-enabled one cannot use the single strategy.
    let library = FakeLibrary::new(plfm_testing::mixed_fleet());
    let factory = PluginFactory::with_library(
        flags(plugin_dir.path(), MigStrategy::Single),
        NumaResolver::new(sysfs.path()),
        library.clone(),
    );
    let (_tx, rx) = mpsc::channel(4);

    let err = Supervisor::new(factory, rx).run().await.unwrap_err();
    assert!(format!("{err:#}").contains("MIG strategy"));
    assert_eq!(library.shutdown_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_preferred_allocation_keeps_nvlink_pairs_together() {
    let plugin_dir = tempfile::tempdir().unwrap();
    let sysfs = tempfile::tempdir().unwrap();
    std::fs::write(plugin_dir.path().join(KUBELET_SOCKET), b"").unwrap();

    let factory = PluginFactory::with_library(
        flags(plugin_dir.path(), MigStrategy::None),
        NumaResolver::new(sysfs.path()),
        FakeLibrary::new(plfm_testing::four_gpus()),
    );
    let (tx, rx) = mpsc::channel(4);
    let handle = tokio::spawn(Supervisor::new(factory, rx).run());

    let gpu = plugin_dir.path().join("nvidia-gpu.sock");
    wait_for(&gpu).await;

    let available: Vec<AnnotatedId> = ["GPU-0", "GPU-1", "GPU-2", "GPU-3"]
        .into_iter()
        .map(AnnotatedId::new)
        .collect();
    let request = Request::PreferredAllocation {
        available,
        required: vec!["GPU-2".to_string()],
        size: 2,
    };
    assert_eq!(
        roundtrip(&gpu, &request).await,
        Response::PreferredAllocation {
            devices: vec!["GPU-2".to_string(), "GPU-3".to_string()]
        }
    );

    tx.send(Trigger::Shutdown("SIGTERM".to_string())).await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fake_backend_single_strategy_serves_partitions() {
    let plugin_dir = tempfile::tempdir().unwrap();
    let sysfs = tempfile::tempdir().unwrap();
    std::fs::write(plugin_dir.path().join(KUBELET_SOCKET), b"").unwrap();

    let topology = plugin_dir.path().join("topology.json");
    std::fs::write(
        &topology,
        plfm_testing::topology_json(&plfm_testing::single_profile_mig()),
    )
    .unwrap();
    let flags = Flags {
        backend: Some(Backend::Fake),
        fake_topology: Some(topology),
        pass_device_specs: Some(true),
        ..flags(plugin_dir.path(), MigStrategy::Single)
    };
    let factory = PluginFactory::new(flags, NumaResolver::new(sysfs.path()));
    let (tx, rx) = mpsc::channel(4);
    let handle = tokio::spawn(Supervisor::new(factory, rx).run());

    // Under the single strategy the partitions are served as the gpu resource.
    let gpu = plugin_dir.path().join("nvidia-gpu.sock");
    wait_for(&gpu).await;

    match roundtrip(&gpu, &Request::List).await {
        Response::Devices { devices } => {
            let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
            assert_eq!(ids, vec!["MIG-1", "MIG-2"]);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    match roundtrip(&gpu, &Request::Allocate { devices: vec!["MIG-2".to_string()] }).await {
        Response::Allocate(allocation) => {
            let paths: Vec<&str> = allocation
                .devices
                .iter()
                .map(|d| d.container_path.as_str())
                .collect();
            assert!(paths.contains(&"/dev/nvidia-caps/nvidia-cap14"));
            assert!(paths.contains(&"/dev/nvidia-caps/nvidia-cap15"));
        }
        other => panic!("unexpected response: {other:?}"),
    }

    tx.send(Trigger::Shutdown("SIGTERM".to_string())).await.unwrap();
    handle.await.unwrap().unwrap();
}
