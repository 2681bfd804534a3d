use std::fs;
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use nfsync_core::config::ScheduleSettings;
use nfsync_core::persist::ensure_dir;
use nfsync_core::{DateRange, Settings};
use nfsync_engine::{pipeline, Engine, RunOutcome, RunRequest};

use crate::error::{io_err, DaemonError};
use crate::paths::{log_path, logs_dir, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Set to `json` to emit structured JSON log lines.
pub const LOG_FORMAT_ENV: &str = "NFSYNC_LOG_FORMAT";

pub const SCHEDULE_STOPPED_MESSAGE: &str =
    "Automatic schedule stopped. Waiting for manual action.";

/// Shortest accepted scheduler period.
const MIN_SCHEDULE_INTERVAL: Duration = Duration::from_secs(60);

/// State shared by every daemon task and socket client.
pub struct DaemonContext {
    data_dir: PathBuf,
    engine: Arc<Engine>,
    schedule: ScheduleSettings,
    schedule_enabled: AtomicBool,
    started_at_unix: u64,
}

impl DaemonContext {
    pub fn new(data_dir: PathBuf, schedule: ScheduleSettings, engine: Engine) -> Self {
        Self {
            data_dir,
            engine: Arc::new(engine),
            schedule_enabled: AtomicBool::new(schedule.enabled),
            schedule,
            started_at_unix: unix_seconds_now(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn schedule_enabled(&self) -> bool {
        self.schedule_enabled.load(Ordering::SeqCst)
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(data_dir: &Path, log_to_file: bool) -> Result<(), DaemonError> {
    init_tracing(data_dir, log_to_file)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(data_dir.to_path_buf()))
}

/// Load settings from `data_dir`, build the HTTP-backed engine and serve.
pub async fn run(data_dir: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&data_dir)?;
    let settings = Settings::load(&data_dir)?;
    let engine = pipeline::build_engine(&data_dir, &settings);
    tracing::info!(
        data_dir = %data_dir.display(),
        schedule_enabled = settings.schedule.enabled,
        interval_secs = settings.schedule.interval_secs,
        "daemon starting",
    );
    serve(Arc::new(DaemonContext::new(
        data_dir,
        settings.schedule,
        engine,
    )))
    .await
}

/// Run the scheduler, socket server, log rotation and signal handler until
/// one of them requests shutdown.
pub async fn serve(ctx: Arc<DaemonContext>) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&ctx.data_dir)?;
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler = spawn_until_shutdown(
        &shutdown_tx,
        scheduler_task(ctx.clone(), shutdown_tx.subscribe()),
    );
    let socket_server = spawn_until_shutdown(
        &shutdown_tx,
        socket_server_task(ctx.clone(), shutdown_tx.clone(), shutdown_tx.subscribe()),
    );
    let rotation = spawn_until_shutdown(
        &shutdown_tx,
        log_rotation_task(ctx.data_dir.clone(), shutdown_tx.subscribe()),
    );
    let signal = spawn_until_shutdown(&shutdown_tx, ctrl_c_task(shutdown_tx.subscribe()));

    let (scheduler, socket_server, rotation, signal) =
        tokio::join!(scheduler, socket_server, rotation, signal);

    if ctx.engine.shared_state().is_active() {
        tracing::info!("waiting for the active run to finish before exiting");
    }

    handle_join("scheduler", scheduler)?;
    handle_join("socket_server", socket_server)?;
    handle_join("log_rotation", rotation)?;
    handle_join("signal_handler", signal)
}

/// Spawn `task`; whichever way it ends, every other task is told to stop.
fn spawn_until_shutdown<F>(
    shutdown_tx: &broadcast::Sender<()>,
    task: F,
) -> JoinHandle<Result<(), DaemonError>>
where
    F: Future<Output = Result<(), DaemonError>> + Send + 'static,
{
    let shutdown_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let result = task.await;
        let _ = shutdown_tx.send(());
        result
    })
}

async fn ctrl_c_task(mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), DaemonError> {
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                tracing::info!("received ctrl-c, shutting down daemon");
                Ok(())
            }
            Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
        },
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

async fn scheduler_task(
    ctx: Arc<DaemonContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let period = Duration::from_secs(ctx.schedule.interval_secs).max(MIN_SCHEDULE_INTERVAL);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    if ctx.schedule_enabled() {
        tracing::info!(every_secs = period.as_secs(), "scheduled runs enabled");
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                if !ctx.schedule_enabled() {
                    tracing::debug!("schedule stopped; skipping tick");
                    continue;
                }
                tracing::info!("starting scheduled run");
                let request = {
                    let ctx = ctx.clone();
                    blocking(move || {
                        pipeline::scheduled_request(ctx.engine.registry(), &ctx.schedule)
                    })
                    .await?
                };
                match request {
                    Ok(request) => {
                        start_run(&ctx, request, "schedule");
                    }
                    Err(err) => tracing::error!(error = %err, "could not build scheduled run"),
                }
            }
        }
    }
    Ok(())
}

/// Claim the run slot and execute on a blocking worker.
///
/// Returns the fire-and-forget answer for the trigger boundary.
fn start_run(ctx: &Arc<DaemonContext>, request: RunRequest, trigger: &'static str) -> Value {
    if !request.is_complete() {
        tracing::info!(trigger, "run requested without identifiers or dates; ignoring");
        return json!({ "started": false, "reason": "missing parameters" });
    }
    let Some(permit) = ctx.engine.try_begin() else {
        tracing::info!(trigger, "run already in progress; ignoring trigger");
        return json!({ "started": false, "reason": "a run is already in progress" });
    };

    let engine = ctx.engine.clone();
    tokio::task::spawn_blocking(move || match engine.execute(permit, request) {
        Ok(RunOutcome::Completed(report)) => tracing::info!(
            trigger,
            found = report.summary.found,
            sent = report.summary.sent,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            identifiers_in_error = report.identifiers_in_error,
            "run completed",
        ),
        Ok(outcome) => tracing::info!(trigger, outcome = ?outcome, "run finished without processing"),
        Err(err) => tracing::error!(trigger, error = %err, "run aborted"),
    });
    json!({ "started": true })
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

async fn socket_server_task(
    ctx: Arc<DaemonContext>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&ctx.data_dir);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = ctx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, ctx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    ctx: Arc<DaemonContext>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stopping = request.cmd == "stop";
        let response = handle_command(&ctx, request, &shutdown_tx).await?;
        write_response(&mut writer, &response).await?;
        if stopping {
            break;
        }
    }

    Ok(())
}

/// Answer one request. Only internal failures (a panicked blocking task)
/// are returned as errors; everything else becomes an error response.
pub async fn handle_command(
    ctx: &Arc<DaemonContext>,
    request: DaemonRequest,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<DaemonResponse, DaemonError> {
    let cmd = request.cmd.clone();
    let response = match cmd.as_str() {
        "status" => DaemonResponse::ok(build_status_payload(ctx).await?),
        "run" => handle_run(ctx, request),
        "list" => {
            let ctx = ctx.clone();
            match blocking(move || ctx.engine.registry().list_all()).await? {
                Ok(records) => DaemonResponse::ok(json!(records)),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "add" => {
            let Some(raw) = request.id.filter(|id| !id.trim().is_empty()) else {
                return Ok(DaemonResponse::error("an identifier is required"));
            };
            let ctx = ctx.clone();
            let id = raw.clone();
            match blocking(move || ctx.engine.registry().add(&id)).await? {
                Ok(Some(record)) => {
                    tracing::info!(id = %record.id, "identifier registered");
                    DaemonResponse::ok(json!(record))
                }
                Ok(None) => DaemonResponse::error(format!("identifier {raw} is already registered")),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "remove" => {
            let ids = request.ids.unwrap_or_default();
            if ids.is_empty() {
                return Ok(DaemonResponse::error("at least one identifier is required"));
            }
            let ctx = ctx.clone();
            match blocking(move || ctx.engine.registry().delete_many(&ids)).await? {
                Ok(removed) => DaemonResponse::ok(json!({ "removed": removed })),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "reset" => {
            let Some(permit) = ctx.engine.try_begin() else {
                return Ok(DaemonResponse::error(
                    "cannot reset while a run is in progress",
                ));
            };
            let ctx = ctx.clone();
            let result = blocking(move || {
                let _permit = permit;
                reset_all(&ctx.engine)
            })
            .await?;
            match result {
                Ok(()) => {
                    tracing::info!("registry, ledger and run status reset");
                    DaemonResponse::ok(json!({ "reset": true }))
                }
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "stop-schedule" => {
            ctx.schedule_enabled.store(false, Ordering::SeqCst);
            ctx.engine.shared_state().set_message(SCHEDULE_STOPPED_MESSAGE);
            tracing::info!("scheduled runs stopped");
            DaemonResponse::ok(json!({ "schedule_enabled": false }))
        }
        "stop" => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    };
    Ok(response)
}

fn handle_run(ctx: &Arc<DaemonContext>, request: DaemonRequest) -> DaemonResponse {
    let identifiers = request.identifiers.filter(|ids| !ids.is_empty());
    let range = match (request.start_date.as_deref(), request.end_date.as_deref()) {
        (Some(start), Some(end)) => match DateRange::parse(start, end) {
            Ok(range) => Some(range),
            Err(err) => return DaemonResponse::error(err.to_string()),
        },
        _ => None,
    };
    DaemonResponse::ok(start_run(
        ctx,
        RunRequest { identifiers, range },
        "socket",
    ))
}

fn reset_all(engine: &Engine) -> Result<(), nfsync_core::StoreError> {
    engine.registry().reset()?;
    engine.dispatcher().ledger().reset()?;
    engine.status_store().reset()
}

async fn build_status_payload(ctx: &Arc<DaemonContext>) -> Result<Value, DaemonError> {
    let status = {
        let ctx = ctx.clone();
        blocking(move || ctx.engine.status_store().load()).await?
    };
    let (status, status_error) = match status {
        Ok(status) => (json!(status), Value::Null),
        Err(err) => (Value::Null, json!(err.to_string())),
    };

    Ok(json!({
        "running": true,
        "started_at_unix": ctx.started_at_unix,
        "schedule_enabled": ctx.schedule_enabled(),
        "schedule_interval_secs": ctx.schedule.interval_secs,
        "data_dir": ctx.data_dir.display().to_string(),
        "socket": socket_path(&ctx.data_dir).display().to_string(),
        "status": status,
        "status_error": status_error,
        "state": ctx.engine.processing_state(),
    }))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

async fn log_rotation_task(
    data_dir: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let data_dir = data_dir.clone();
                // Failures are logged inside rotate_logs.
                tokio::task::spawn_blocking(move || {
                    crate::log_rotation::rotate_logs(&data_dir);
                })
                .await
                .ok();
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn blocking<T, F>(work: F) -> Result<T, DaemonError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| DaemonError::Protocol(format!("blocking task join error: {err}")))
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(data_dir: &Path) -> Result<(), DaemonError> {
    ensure_dir(data_dir)?;
    let logs = logs_dir(data_dir);
    fs::create_dir_all(&logs).map_err(|e| io_err(&logs, e))
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the global subscriber. Library crates log through the `log`
/// facade, which the subscriber picks up as well.
pub fn init_tracing(data_dir: &Path, log_to_file: bool) -> Result<(), DaemonError> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.trim().eq_ignore_ascii_case("json"));
    let builder = fmt().with_env_filter(filter).with_target(false);

    if !log_to_file {
        if json {
            let _ = builder.json().try_init();
        } else {
            let _ = builder.try_init();
        }
        return Ok(());
    }

    let logs = logs_dir(data_dir);
    fs::create_dir_all(&logs).map_err(|e| io_err(&logs, e))?;
    let path = log_path(data_dir);
    if json {
        let _ = builder.json().with_writer(append_writer(path)).try_init();
    } else {
        let _ = builder
            .with_ansi(false)
            .with_writer(append_writer(path))
            .try_init();
    }
    Ok(())
}

/// Reopen the log per event so rotation never leaves the daemon writing to
/// a renamed file.
fn append_writer(path: PathBuf) -> impl Fn() -> Box<dyn Write> + Send + Sync + 'static {
    move || -> Box<dyn Write> {
        match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Box::new(file),
            Err(_) => Box::new(std::io::stderr()),
        }
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
