use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinSet;

use ob_core::config::{config_dir_at, load_at};
use ob_core::Config;
use ob_sync::{CyclePhase, Engine, EngineConfig, GitCli, VaultStatus, VcsClient};

use crate::error::{io_err, DaemonError};
use crate::log_rotation::{rotate_logs, RotationPolicy};
use crate::logging::init_tracing;
use crate::paths::{logs_dir, pid_path, socket_path, LOG_ROTATION_INTERVAL};
use crate::pidfile::PidFile;
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::scheduler::{timer_task, Scheduler, Trigger, TriggerOutcome};

/// Periods of the two scheduled triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timers {
    pub settle: Duration,
    pub reconcile: Duration,
}

impl From<&Config> for Timers {
    fn from(config: &Config) -> Self {
        Self {
            settle: Duration::from_secs(config.sync.settle_interval_secs.max(1)),
            reconcile: Duration::from_secs(config.sync.reconcile_interval_secs.max(1)),
        }
    }
}

/// Most recent finished cycle, for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct LastCycle {
    pub trigger: String,
    pub finished_at_unix: u64,
    pub outcome: TriggerOutcome,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path, log_file: Option<PathBuf>) -> Result<(), DaemonError> {
    init_tracing(log_file);
    let config = load_at(home)?.with_env_overrides().validate()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Run the daemon for `config` until `stop`, ctrl-c or SIGTERM.
pub async fn run(home: PathBuf, config: Config) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let pid = PidFile::acquire(&pid_path(&home))?;

    let vault = config.vault();
    let engine = Engine::new(GitCli::new(&vault), EngineConfig::from(&config));
    tracing::info!(
        vault = %vault,
        remote = %config.remote_ref(),
        pid = std::process::id(),
        settle_secs = config.sync.settle_interval_secs,
        reconcile_secs = config.sync.reconcile_interval_secs,
        squash_threshold = config.sync.squash_threshold,
        "daemon started",
    );

    let result = serve(home, Scheduler::new(engine), Timers::from(&config)).await;
    drop(pid);
    tracing::info!("daemon stopped");
    result
}

/// Timers, trigger dispatch, control socket, log rotation and signal
/// handling for one scheduler. Returns after shutdown once every in-flight
/// cycle has finished.
pub async fn serve<C: VcsClient + 'static>(
    home: PathBuf,
    scheduler: Scheduler<C>,
    timers: Timers,
) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let (trigger_tx, trigger_rx) = mpsc::channel::<Trigger>(16);
    let daemon = Daemon::new(home.clone(), scheduler, timers, shutdown_tx.clone());

    let timer_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = timer_task(
                timers.settle,
                timers.reconcile,
                trigger_tx,
                shutdown.subscribe(),
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let dispatch_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = daemon.clone();
        tokio::spawn(async move {
            let result = dispatch_task(daemon, trigger_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = daemon.clone();
        tokio::spawn(async move {
            let result = socket_server_task(daemon, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(home, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move { signal_task(shutdown).await })
    };

    let (timer_result, dispatch_result, socket_result, rotation_result, signal_result) = tokio::join!(
        timer_handle,
        dispatch_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    daemon.drain_cycles().await;

    handle_join("timers", timer_result)?;
    handle_join("dispatcher", dispatch_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared daemon state
// ---------------------------------------------------------------------------

struct Daemon<C> {
    home: PathBuf,
    scheduler: Scheduler<C>,
    timers: Timers,
    cycles: Arc<Mutex<JoinSet<()>>>,
    last_cycle: Arc<RwLock<Option<LastCycle>>>,
    /// Vault state from the last status read taken while no cycle ran.
    last_status: Arc<RwLock<Option<VaultStatus>>>,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
}

impl<C> Clone for Daemon<C> {
    fn clone(&self) -> Self {
        Self {
            home: self.home.clone(),
            scheduler: self.scheduler.clone(),
            timers: self.timers,
            cycles: self.cycles.clone(),
            last_cycle: self.last_cycle.clone(),
            last_status: self.last_status.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            started_at_unix: self.started_at_unix,
        }
    }
}

impl<C: VcsClient + 'static> Daemon<C> {
    fn new(
        home: PathBuf,
        scheduler: Scheduler<C>,
        timers: Timers,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            home,
            scheduler,
            timers,
            cycles: Arc::new(Mutex::new(JoinSet::new())),
            last_cycle: Arc::new(RwLock::new(None)),
            last_status: Arc::new(RwLock::new(None)),
            shutdown_tx,
            started_at_unix: unix_seconds_now(),
        }
    }

    /// Fire `trigger` and track the cycle until it finishes. The receiver
    /// yields its outcome; dropping it is fine.
    fn dispatch(&self, trigger: Trigger) -> oneshot::Receiver<TriggerOutcome> {
        let (respond_to, rx) = oneshot::channel();
        let handle = self.scheduler.fire(trigger);
        let last_cycle = self.last_cycle.clone();

        let mut cycles = self.cycles.lock().unwrap_or_else(PoisonError::into_inner);
        while cycles.try_join_next().is_some() {}
        cycles.spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(%trigger, error = %err, "cycle task join failure");
                    TriggerOutcome::Failed {
                        phase: CyclePhase::Idle,
                        error: format!("cycle task join failure: {err}"),
                    }
                }
            };
            if outcome != TriggerOutcome::Skipped {
                *last_cycle.write().await = Some(LastCycle {
                    trigger: trigger.to_string(),
                    finished_at_unix: unix_seconds_now(),
                    outcome: outcome.clone(),
                });
            }
            let _ = respond_to.send(outcome);
        });
        rx
    }

    async fn drain_cycles(&self) {
        let mut cycles = {
            let mut guard = self.cycles.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        if !cycles.is_empty() {
            tracing::info!(in_flight = cycles.len(), "waiting for running cycles");
        }
        while let Some(result) = cycles.join_next().await {
            if let Err(err) = result {
                tracing::warn!(error = %err, "cycle tracker join failure");
            }
        }
    }

    /// While a cycle holds the vault the last vault state is served from
    /// cache (`vault_cached`), so status never runs git next to a cycle.
    async fn status_payload(&self) -> Result<Value, DaemonError> {
        let in_flight = self.scheduler.in_flight();
        let vault = if in_flight {
            self.last_status.read().await.clone()
        } else {
            let scheduler = self.scheduler.clone();
            let status = tokio::task::spawn_blocking(move || scheduler.engine().status())
                .await
                .map_err(|err| DaemonError::Protocol(format!("status task join error: {err}")))??;
            *self.last_status.write().await = Some(status.clone());
            Some(status)
        };
        let last_cycle = self.last_cycle.read().await.clone();
        let config = self.scheduler.engine().config();

        Ok(json!({
            "running": true,
            "pid": std::process::id(),
            "started_at_unix": self.started_at_unix,
            "in_flight": in_flight,
            "vault": vault,
            "vault_cached": in_flight,
            "last_cycle": last_cycle,
            "settle_interval_secs": self.timers.settle.as_secs(),
            "reconcile_interval_secs": self.timers.reconcile.as_secs(),
            "squash_threshold": config.squash_threshold,
            "socket": socket_path(&self.home).display().to_string(),
        }))
    }

    /// Run `trigger` to completion for a socket client.
    async fn run_for_client(&self, trigger: Trigger) -> DaemonResponse {
        match self.dispatch(trigger).await {
            Ok(TriggerOutcome::Skipped) => DaemonResponse::error(format!(
                "a cycle is already running for {}",
                self.scheduler.engine().config().vault
            )),
            Ok(TriggerOutcome::Failed { error, .. }) => DaemonResponse::error(error),
            Ok(outcome) => DaemonResponse::ok(json!(outcome)),
            Err(_) => DaemonResponse::error("cycle result was dropped"),
        }
    }

    async fn handle_request(&self, request: DaemonRequest) -> DaemonResponse {
        match request.cmd.as_str() {
            "status" => match self.status_payload().await {
                Ok(payload) => DaemonResponse::ok(payload),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "sync" => self.run_for_client(Trigger::Manual).await,
            "squash" => match request.commits {
                Some(commits) if commits > 0 => {
                    self.run_for_client(Trigger::Compact { commits }).await
                }
                _ => DaemonResponse::error("squash requires a positive `commits` count"),
            },
            "stop" => {
                let _ = self.shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn dispatch_task<C: VcsClient + 'static>(
    daemon: Daemon<C>,
    mut triggers: mpsc::Receiver<Trigger>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            trigger = triggers.recv() => {
                let Some(trigger) = trigger else { break };
                // Scheduled outcomes are only logged.
                drop(daemon.dispatch(trigger));
            }
        }
    }
    Ok(())
}

async fn socket_server_task<C: VcsClient + 'static>(
    daemon: Daemon<C>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&daemon.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let daemon = daemon.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, daemon).await {
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

async fn handle_socket_client<C: VcsClient + 'static>(
    stream: UnixStream,
    daemon: Daemon<C>,
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

        let stop = request.cmd == "stop";
        let response = daemon.handle_request(request).await;
        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(LOG_ROTATION_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                // Failures are logged inside rotate_logs.
                let _ = tokio::task::spawn_blocking(move || {
                    rotate_logs(&home, RotationPolicy::default());
                })
                .await;
            }
        }
    }
    Ok(())
}

async fn signal_task(shutdown: broadcast::Sender<()>) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut shutdown_rx = shutdown.subscribe();
    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;

    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down daemon");
            let _ = shutdown.send(());
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                tracing::info!("received ctrl-c, shutting down daemon");
                let _ = shutdown.send(());
                Ok(())
            }
            Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    if StdUnixStream::connect(socket).is_ok() {
        return Err(DaemonError::Protocol(format!(
            "daemon socket already in use: {}",
            socket.display()
        )));
    }
    tracing::warn!(socket = %socket.display(), "removing stale daemon socket before bind");

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [config_dir_at(home), logs_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
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

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use ob_core::{RemoteRef, VaultPath};
    use ob_sync::fake::FakeVcs;
    use tempfile::TempDir;

    use crate::protocol::{request_squash, request_status, request_stop, request_sync};

    const LONG: Timers = Timers {
        settle: Duration::from_secs(3600),
        reconcile: Duration::from_secs(12 * 3600),
    };

    fn scheduler() -> Scheduler<FakeVcs> {
        Scheduler::new(Engine::new(
            FakeVcs::new("/vault"),
            EngineConfig {
                vault: VaultPath::from(PathBuf::from("/vault")),
                remote: RemoteRef::default(),
                squash_threshold: 25,
            },
        ))
    }

    fn daemon(home: &Path) -> Daemon<FakeVcs> {
        let (shutdown_tx, _) = broadcast::channel(4);
        Daemon::new(home.to_path_buf(), scheduler(), LONG, shutdown_tx)
    }

    #[test]
    fn timers_come_from_config() {
        let mut config = Config::new("/vault");
        config.sync.settle_interval_secs = 30;
        let timers = Timers::from(&config);
        assert_eq!(timers.settle, Duration::from_secs(30));
        assert_eq!(timers.reconcile, Duration::from_secs(43_200));
    }

    #[tokio::test]
    async fn manual_sync_while_in_flight_is_refused() {
        let home = TempDir::new().unwrap();
        let daemon = daemon(home.path());
        let vault = daemon.scheduler.engine().config().vault.clone();
        let _held = daemon.scheduler.flights().try_acquire(&vault).unwrap();

        let response = daemon.handle_request(DaemonRequest::new("sync")).await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("already running"));
        assert!(daemon.scheduler.engine().client().calls().is_empty());
    }

    #[tokio::test]
    async fn squash_without_count_is_rejected() {
        let home = TempDir::new().unwrap();
        let daemon = daemon(home.path());

        let response = daemon.handle_request(DaemonRequest::new("squash")).await;
        assert!(!response.ok);
        let response = daemon.handle_request(DaemonRequest::squash(0)).await;
        assert!(!response.ok);
        assert!(daemon.scheduler.engine().client().calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_an_error_response() {
        let home = TempDir::new().unwrap();
        let response = daemon(home.path())
            .handle_request(DaemonRequest::new("reboot"))
            .await;
        assert_eq!(response.error.as_deref(), Some("unknown command 'reboot'"));
    }

    #[tokio::test]
    async fn finished_cycle_is_reported_in_status() {
        let home = TempDir::new().unwrap();
        let daemon = daemon(home.path());
        daemon.scheduler.engine().client().write("a.md", "a\n");

        let outcome = daemon.dispatch(Trigger::Settle).await.unwrap();
        assert!(outcome.is_success());

        let payload = daemon.status_payload().await.unwrap();
        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["in_flight"], json!(false));
        assert_eq!(payload["vault"]["dirty"], json!(false));
        assert_eq!(payload["vault"]["ahead"], json!(1));
        assert_eq!(payload["last_cycle"]["trigger"], json!("settle"));
        assert_eq!(payload["last_cycle"]["outcome"]["outcome"], json!("cycle"));
        assert_eq!(payload["squash_threshold"], json!(25));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_during_a_cycle_runs_no_git() {
        let home = TempDir::new().unwrap();
        let daemon = daemon(home.path());
        let fresh = daemon.status_payload().await.unwrap();
        assert_eq!(fresh["vault_cached"], json!(false));

        let client = daemon.scheduler.engine().client();
        let gate = client.gate_fetch();
        client.clear_calls();
        let outcome = daemon.dispatch(Trigger::Reconcile);
        let gate = tokio::task::spawn_blocking(move || {
            gate.wait_entered();
            gate
        })
        .await
        .unwrap();

        let during = daemon.status_payload().await.unwrap();
        assert_eq!(during["in_flight"], json!(true));
        assert_eq!(during["vault_cached"], json!(true));
        assert_eq!(during["vault"], fresh["vault"]);
        assert_eq!(client.calls(), vec!["fetch"]);

        gate.release();
        assert!(outcome.await.unwrap().is_success());
        let after = daemon.status_payload().await.unwrap();
        assert_eq!(after["vault_cached"], json!(false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn control_socket_serves_status_sync_squash_and_stop() {
        let home = TempDir::new().unwrap();
        let scheduler = scheduler();
        scheduler.engine().client().write("a.md", "a\n");
        let server = tokio::spawn(serve(home.path().to_path_buf(), scheduler.clone(), LONG));

        // Wait for the startup cycle to be recorded.
        let mut status = Value::Null;
        for _ in 0..50 {
            let home = home.path().to_path_buf();
            status = tokio::task::spawn_blocking(move || request_status(&home))
                .await
                .unwrap()
                .unwrap_or(Value::Null);
            if !status["last_cycle"].is_null() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status["last_cycle"]["trigger"], json!("startup"));
        assert_eq!(status["vault"]["ahead"], json!(1));

        let h = home.path().to_path_buf();
        let synced = tokio::task::spawn_blocking(move || request_sync(&h))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(synced["outcome"], json!("cycle"));
        assert_eq!(synced["push"]["result"], json!("pushed"));

        let h = home.path().to_path_buf();
        let refused = tokio::task::spawn_blocking(move || request_squash(&h, 0))
            .await
            .unwrap();
        assert!(refused.is_err());

        let h = home.path().to_path_buf();
        tokio::task::spawn_blocking(move || request_stop(&h))
            .await
            .unwrap()
            .unwrap();
        server.await.unwrap().unwrap();

        assert!(!socket_path(home.path()).exists());
        assert_eq!(
            scheduler.engine().client().remote_log(),
            vec!["Squashed 1 commits by ob", "initial"]
        );
    }
}
