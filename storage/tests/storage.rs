//! The storage layer over a shared pool and an in-memory remote.

use std::sync::Arc;
use std::time::Duration;

use sftp_driver::{Credential, RegistryModel};
use sshpool::memory::MemoryRemote;
use sshpool::PoolConfig;
use storage::{FileInfo, HealthStatus, Settings, StorageFactory, WalkControl};
use storage_driver::StorageErrorKind;

fn factory(remote: &MemoryRemote) -> StorageFactory {
    StorageFactory::new(
        Arc::new(remote.clone()),
        PoolConfig {
            gc_interval: Duration::ZERO,
            max_idle: 4,
        },
    )
}

fn model(base: &str) -> RegistryModel {
    RegistryModel {
        url: format!("sftp://files.example.com{base}"),
        insecure: true,
        credential: Some(Credential {
            access_key: "registry".into(),
            access_secret: "hunter2".into(),
        }),
    }
}

#[tokio::test]
async fn registry_records_share_one_connection() {
    let remote = MemoryRemote::new();
    let factory = factory(&remote);

    let blobs = factory.from_registry("sftp", model("/blobs")).unwrap();
    let manifests = factory.from_registry("sftp", model("/manifests")).unwrap();
    assert_eq!(blobs.name(), "sftp");

    blobs.put_content("/sha256/ab/data", b"blob").await.unwrap();
    manifests.put_content("/latest", b"manifest").await.unwrap();

    assert_eq!(remote.file("/blobs/sha256/ab/data").unwrap(), b"blob");
    assert_eq!(remote.file("/manifests/latest").unwrap(), b"manifest");
    assert_eq!(factory.pool().active_connections(), 1);
    assert_eq!(remote.connects(), 1);
}

#[tokio::test]
async fn upload_commits_streamed_content() {
    let remote = MemoryRemote::new();
    let storage = factory(&remote).from_registry("sftp", model("/srv")).unwrap();

    let content = vec![7u8; 100 * 1024];
    let size = storage.upload("/big", &mut content.as_slice()).await.unwrap();
    assert_eq!(size, content.len() as u64);
    assert_eq!(storage.get_content("/big").await.unwrap(), content);
    assert_eq!(remote.open_sessions(), 0);
}

#[tokio::test]
async fn walk_through_storage_handle() {
    let remote = MemoryRemote::new();
    let storage = factory(&remote).from_registry("sftp", model("/srv")).unwrap();
    storage.put_content("/a/b", b"1").await.unwrap();
    storage.put_content("/c", b"2").await.unwrap();

    let mut seen = Vec::new();
    storage
        .walk("/", &mut |info: &FileInfo| {
            seen.push(info.path.clone());
            Ok(WalkControl::Continue)
        })
        .await
        .unwrap();
    assert_eq!(seen, vec!["/a", "/a/b", "/c"]);
}

#[tokio::test]
async fn health_status_follows_the_endpoint() {
    let remote = MemoryRemote::new();
    let factory = factory(&remote);
    let storage = factory.from_registry("sftp", model("/")).unwrap();

    assert_eq!(storage.health_status().await, HealthStatus::Healthy);

    remote.break_connections();
    remote.set_refuse_connect(true);
    assert_eq!(storage.health_status().await, HealthStatus::Unhealthy);

    remote.set_refuse_connect(false);
    assert_eq!(storage.health_status().await, HealthStatus::Healthy);
}

#[tokio::test]
async fn shutdown_stops_all_storage() {
    let remote = MemoryRemote::new();
    let factory = factory(&remote);
    let storage = factory.from_registry("sftp", model("/")).unwrap();
    storage.put_content("/f", b"data").await.unwrap();

    factory.shutdown().await;
    assert!(factory.pool().is_shutdown());
    assert_eq!(factory.pool().active_connections(), 0);

    let err = storage.get_content("/f").await.unwrap_err();
    assert_eq!(err.kind(), StorageErrorKind::Precondition);
    assert_eq!(storage.health_status().await, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn settings_build_storage() {
    let remote = MemoryRemote::new();
    let settings = Settings::from_toml(
        r#"
[pool]
max-idle = 2

[storage.sftp]
url = "sftp://registry@files.example.com/srv"
insecure = true
"#,
    )
    .unwrap();

    let factory = StorageFactory::new(Arc::new(remote.clone()), settings.pool);
    let storage = factory.build(&settings.storage).unwrap();
    storage.put_content("/hello", b"hello").await.unwrap();
    assert_eq!(remote.file("/srv/hello").unwrap(), b"hello");
    factory.shutdown().await;
}
