use std::sync::Arc;

use courier::{Controller, CourierConfig, worker::default_jobs};
use courier_delivery::{MemoryMessageStore, queue::NewQueuedMessage};
use pretty_assertions::assert_eq;

fn config(dir: &tempfile::TempDir, resolv_conf: &std::path::Path) -> CourierConfig {
    CourierConfig::from_ron(&format!(
        r#"(
            database: (url: "sqlite://{}"),
            dns: (resolv_conf_path: "{}"),
            worker: (threads: 1),
        )"#,
        dir.path().join("queue.db").display(),
        resolv_conf.display(),
    ))
    .unwrap()
}

#[tokio::test]
async fn test_context_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let resolv_conf = dir.path().join("resolv.conf");
    std::fs::write(&resolv_conf, "nameserver 127.0.0.53\noptions timeout:2\n").unwrap();

    let controller = Controller::new(config(&dir, &resolv_conf));
    let context = controller
        .context(Some(Arc::new(MemoryMessageStore::new())))
        .await
        .unwrap();

    let identity = context.identity().to_string();
    assert!(identity.starts_with("host:"));
    assert!(identity.ends_with(&format!(" pid:{}", std::process::id())));
    assert_eq!(context.settings().maximum_delivery_attempts, 18);
    assert_eq!(context.database().queued_messages().count().await.unwrap(), 0);
    assert!(dir.path().join("queue.db").exists());
}

#[tokio::test]
async fn test_missing_resolver_configuration_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let controller = Controller::new(config(&dir, &dir.path().join("absent.conf")));

    let err = controller
        .context(Some(Arc::new(MemoryMessageStore::new())))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("absent.conf"));
}

#[tokio::test]
async fn test_resolver_without_nameservers_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let resolv_conf = dir.path().join("resolv.conf");
    std::fs::write(&resolv_conf, "search example.com\n").unwrap();

    let controller = Controller::new(config(&dir, &resolv_conf));
    let err = controller
        .context(Some(Arc::new(MemoryMessageStore::new())))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("DNS resolver configuration error"));
}

#[tokio::test]
async fn test_worker_without_store_leaves_queue_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let resolv_conf = dir.path().join("resolv.conf");
    std::fs::write(&resolv_conf, "nameserver 127.0.0.53\n").unwrap();

    let controller = Controller::new(config(&dir, &resolv_conf));
    let context = controller.context(None).await.unwrap();
    assert!(!context.has_store());

    let repo = context.database().queued_messages();
    repo.create(&NewQueuedMessage {
        server_id: 1,
        message_id: 42,
        domain: "example.net".to_string(),
        ip_address_id: None,
        route_id: None,
        manual: false,
        batch_key: Some("outgoing-example.net".to_string()),
    })
    .await
    .unwrap();

    let mut jobs = default_jobs(&context, "work0");
    let names: Vec<_> = jobs.iter().map(|job| job.name()).collect();
    assert_eq!(names, vec!["ProcessWebhookRequests"]);

    for job in &mut jobs {
        assert!(!job.call().await.unwrap());
    }

    let row = repo.find(1).await.unwrap().unwrap();
    assert_eq!(row.message_id, 42);
    assert!(row.locked_by.is_none());
    assert_eq!(repo.count().await.unwrap(), 1);
}
