//! End-to-end daemon lifecycle over the real Unix socket: registry
//! commands, a triggered run, status polling and graceful stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nfsync_core::{DateRange, Settings, TaxId};
use nfsync_daemon::{
    request, request_run, request_status, request_stop, serve, DaemonContext, DaemonError,
    DaemonRequest,
};
use nfsync_engine::pipeline::build_engine_with;
use nfsync_providers::{Document, ProviderError, SinkClient, SourceClient, UploadTarget};
use serde_json::{json, Value};
use tempfile::TempDir;

struct NothingNew;

impl SourceClient for NothingNew {
    fn count(&self, _: &TaxId, _: &DateRange) -> Result<u64, ProviderError> {
        Ok(0)
    }

    fn fetch_page(
        &self,
        _: &TaxId,
        _: &DateRange,
        _: u64,
        _: u64,
    ) -> Result<Vec<Document>, ProviderError> {
        Ok(Vec::new())
    }
}

struct NoSink;

impl SinkClient for NoSink {
    fn credential(&self) -> Result<String, ProviderError> {
        Err(ProviderError::MissingCredentials)
    }

    fn invalidate_credential(&self, _: &str) {}

    fn uses_static_token(&self) -> bool {
        false
    }

    fn request_upload_target(&self, _: &str, _: usize) -> Result<UploadTarget, ProviderError> {
        Err(ProviderError::MissingCredentials)
    }

    fn write_payload(&self, _: &UploadTarget, _: &[u8]) -> Result<(), ProviderError> {
        Err(ProviderError::MissingCredentials)
    }
}

async fn call<T, F>(data_dir: &PathBuf, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(PathBuf) -> T + Send + 'static,
{
    let data_dir = data_dir.clone();
    tokio::task::spawn_blocking(move || f(data_dir))
        .await
        .expect("blocking client call")
}

async fn wait_for_socket(data_dir: &PathBuf) {
    let socket = nfsync_daemon::paths::socket_path(data_dir);
    for _ in 0..100 {
        if socket.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("daemon socket never appeared at {}", socket.display());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_serves_registry_run_and_stop() {
    let home = TempDir::new().expect("tempdir");
    let data_dir = home.path().to_path_buf();
    let mut settings = Settings::default();
    settings.schedule.enabled = false;
    let engine = build_engine_with(&data_dir, &settings, Arc::new(NothingNew), Arc::new(NoSink));
    let ctx = Arc::new(DaemonContext::new(data_dir.clone(), settings.schedule, engine));

    let server = tokio::spawn(serve(ctx));
    wait_for_socket(&data_dir).await;

    let added = call(&data_dir, |dir| {
        request(
            &dir,
            &DaemonRequest {
                id: Some("123.456.789-01".into()),
                ..DaemonRequest::command("add")
            },
        )
    })
    .await
    .expect("add");
    assert_eq!(added["id"], json!("12345678901"));

    let started = call(&data_dir, |dir| {
        request_run(&dir, vec!["12345678901".into()], "2024-01-01", "2024-01-31")
    })
    .await
    .expect("run");
    assert_eq!(started["started"], json!(true));

    let mut status = Value::Null;
    for _ in 0..100 {
        status = call(&data_dir, |dir| request_status(&dir)).await.expect("status");
        if status["status"]["last_run_at"].is_string()
            && status["state"]["is_processing"] == json!(false)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status["running"], json!(true));
    assert_eq!(status["schedule_enabled"], json!(false));
    assert_eq!(status["status"]["summary"]["processed_identifiers"], json!(1));
    assert_eq!(status["state"]["status_message"], json!("Finished successfully."));

    call(&data_dir, |dir| request_stop(&dir)).await.expect("stop");
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("daemon exits after stop")
        .expect("join")
        .expect("serve result");

    let after = call(&data_dir, |dir| request_status(&dir)).await;
    assert!(matches!(after, Err(DaemonError::DaemonNotRunning { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_daemon_refuses_a_live_socket() {
    let home = TempDir::new().expect("tempdir");
    let data_dir = home.path().to_path_buf();
    let mut settings = Settings::default();
    settings.schedule.enabled = false;

    let first = Arc::new(DaemonContext::new(
        data_dir.clone(),
        settings.schedule.clone(),
        build_engine_with(&data_dir, &settings, Arc::new(NothingNew), Arc::new(NoSink)),
    ));
    let server = tokio::spawn(serve(first));
    wait_for_socket(&data_dir).await;

    let second = Arc::new(DaemonContext::new(
        data_dir.clone(),
        settings.schedule.clone(),
        build_engine_with(&data_dir, &settings, Arc::new(NothingNew), Arc::new(NoSink)),
    ));
    let refused = tokio::time::timeout(Duration::from_secs(5), serve(second))
        .await
        .expect("second daemon returns");
    assert!(refused.is_err(), "live socket must abort startup");

    call(&data_dir, |dir| request_stop(&dir)).await.expect("stop");
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("first daemon exits")
        .expect("join")
        .expect("serve result");
}
