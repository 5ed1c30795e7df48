use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cardwall_events::{topics, Bus};
use cardwall_kernel::Kernel;
use cardwall_protocol::{
    About, Card, CardKind, CardSubmission, Error, PendingRequest, Result, RunSummary, ShowOutcome,
};
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::watch;

use crate::coordinate::{self, EventCallback};
use crate::export::ExportFormat;
use crate::router::paths;
use crate::{config, export, router, telemetry, AppState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Serve from a task inside the calling process; dies with it.
    #[default]
    Thread,
    /// Spawn a detached server process that outlives the caller.
    Process,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub port: Option<u16>,
    pub open_browser: bool,
    pub mode: Mode,
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum ServerStatus {
    NotRunning,
    Running(About),
}

struct Embedded {
    state: AppState,
    port: u16,
}

enum Inner {
    Embedded(Embedded),
    Remote { base: String, http: reqwest::Client },
}

/// Handle to a running service. Cloneable; all caller-facing operations
/// go through it, never through ambient globals.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<Inner>,
}

// An async mutex: the guard spans the bind and spawn, so concurrent
// `start` calls serialize instead of both binding a listener.
static INSTANCE: Lazy<tokio::sync::Mutex<Option<ServiceHandle>>> =
    Lazy::new(|| tokio::sync::Mutex::new(None));

/// Start the display service. Idempotent within a process: a second call
/// while running returns the existing handle instead of binding twice.
pub async fn start(opts: StartOptions) -> Result<ServiceHandle> {
    let mut cell = INSTANCE.lock().await;
    if let Some(existing) = cell.clone() {
        return Ok(existing);
    }
    let handle = match opts.mode {
        Mode::Thread => start_embedded(&opts).await?,
        Mode::Process => start_detached(&opts).await?,
    };
    *cell = Some(handle.clone());
    drop(cell);
    if opts.open_browser {
        open_browser(handle.base_url());
    }
    Ok(handle)
}

async fn start_embedded(opts: &StartOptions) -> Result<ServiceHandle> {
    telemetry::init();
    let state_dir = opts.state_dir.clone().unwrap_or_else(config::state_dir);
    let kernel = Kernel::open(&state_dir)?;
    let bus = Bus::new_with_replay(256, 256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let port = opts.port.unwrap_or_else(config::default_port);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| Error::Bind(format!("port {port}: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Bind(e.to_string()))?
        .port();

    let state = AppState::new(bus, kernel, shutdown_tx, port);
    let app = router::build_router().with_state(state.clone());
    let mut rx = shutdown_rx;
    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = rx.changed().await;
        });
        if let Err(err) = serve.await {
            tracing::error!(%err, "display service exited with error");
        }
    });
    tracing::info!(port, "display service listening");
    Ok(ServiceHandle {
        inner: Arc::new(Inner::Embedded(Embedded { state, port })),
    })
}

async fn start_detached(opts: &StartOptions) -> Result<ServiceHandle> {
    let port = opts.port.unwrap_or_else(config::default_port);
    let base = format!("http://127.0.0.1:{port}");
    let http = http_client();

    // Reuse an instance that is already up on the target port.
    if probe(&http, &base).await {
        return Ok(remote_handle(base, http));
    }

    let bin = std::env::var("CARDWALL_SERVER_BIN").unwrap_or_else(|_| "cardwall-server".into());
    let mut cmd = std::process::Command::new(bin);
    cmd.arg("--port")
        .arg(port.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(dir) = &opts.state_dir {
        cmd.env("CARDWALL_STATE_DIR", dir);
    }
    cmd.spawn()
        .map_err(|e| Error::Transport(format!("spawn detached server: {e}")))?;

    for _ in 0..50 {
        if probe(&http, &base).await {
            return Ok(remote_handle(base, http));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(Error::Transport(format!(
        "detached server did not come up on {base}"
    )))
}

fn remote_handle(base: String, http: reqwest::Client) -> ServiceHandle {
    ServiceHandle {
        inner: Arc::new(Inner::Remote { base, http }),
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn probe(http: &reqwest::Client, base: &str) -> bool {
    matches!(
        http.get(format!("{base}{}", paths::HEALTHZ))
            .timeout(Duration::from_millis(500))
            .send()
            .await,
        Ok(resp) if resp.status().is_success()
    )
}

fn open_browser(url: String) {
    #[cfg(target_os = "macos")]
    let program = "open";
    #[cfg(target_os = "windows")]
    let program = "explorer";
    #[cfg(all(unix, not(target_os = "macos")))]
    let program = "xdg-open";
    if let Err(err) = std::process::Command::new(program).arg(&url).spawn() {
        tracing::warn!(%err, url, "could not open browser");
    }
}

async fn remote_err(resp: reqwest::Response) -> Error {
    let status = resp.status();
    let detail = resp
        .json::<Value>()
        .await
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
        .unwrap_or_else(|| status.to_string());
    match status.as_u16() {
        400 => Error::Validation(detail),
        404 => Error::NotFound(detail),
        _ => Error::Transport(detail),
    }
}

impl ServiceHandle {
    pub fn base_url(&self) -> String {
        match self.inner.as_ref() {
            Inner::Embedded(e) => format!("http://127.0.0.1:{}", e.port),
            Inner::Remote { base, .. } => base.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self.inner.as_ref() {
            Inner::Embedded(e) => e.port,
            Inner::Remote { base, .. } => base
                .rsplit(':')
                .next()
                .and_then(|p| p.parse().ok())
                .unwrap_or(config::DEFAULT_PORT),
        }
    }

    /// Non-blocking show: write the card, return it immediately.
    pub async fn show(&self, sub: CardSubmission) -> Result<Card> {
        match self.inner.as_ref() {
            Inner::Embedded(e) => coordinate::write_card(&e.state, &sub),
            Inner::Remote { base, http } => {
                let resp = http
                    .post(format!("{base}{}", paths::CARDS))
                    .json(&sub)
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(remote_err(resp).await);
                }
                resp.json().await.map_err(|e| Error::Transport(e.to_string()))
            }
        }
    }

    /// Blocking show: suspend until the reviewer confirms, skips, or the
    /// timeout elapses. Timeout is a normal outcome.
    pub async fn show_wait(
        &self,
        sub: CardSubmission,
        prompt: Option<String>,
        timeout_secs: Option<f64>,
    ) -> Result<ShowOutcome> {
        match self.inner.as_ref() {
            Inner::Embedded(e) => coordinate::show_and_wait(&e.state, sub, prompt, timeout_secs)
                .await
                .map(|(_, outcome)| outcome),
            Inner::Remote { base, http } => {
                let secs = timeout_secs.unwrap_or(cardwall_protocol::DEFAULT_WAIT_TIMEOUT_SECS as f64);
                let body = serde_json::json!({
                    "card": sub,
                    "prompt": prompt,
                    "timeout_secs": timeout_secs,
                });
                let resp = http
                    .post(format!("{base}{}", paths::SHOW))
                    .timeout(Duration::from_secs_f64(secs + 30.0))
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(remote_err(resp).await);
                }
                let v: Value = resp.json().await.map_err(|e| Error::Transport(e.to_string()))?;
                serde_json::from_value(v["outcome"].clone())
                    .map_err(|e| Error::Transport(e.to_string()))
            }
        }
    }

    /// Write a section divider card.
    pub async fn section(&self, title: &str, run: Option<&str>) -> Result<Card> {
        self.show(CardSubmission {
            kind: Some(CardKind::Section),
            title: Some(title.to_string()),
            run: run.map(|r| r.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn cards(&self, run: &str) -> Result<Vec<Card>> {
        match self.inner.as_ref() {
            Inner::Embedded(e) => e.state.kernel().list_cards(run),
            Inner::Remote { base, http } => {
                let resp = http
                    .get(format!("{base}/runs/{run}/cards"))
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(remote_err(resp).await);
                }
                let v: Value = resp.json().await.map_err(|e| Error::Transport(e.to_string()))?;
                serde_json::from_value(v["items"].clone())
                    .map_err(|e| Error::Transport(e.to_string()))
            }
        }
    }

    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        match self.inner.as_ref() {
            Inner::Embedded(e) => e.state.kernel().list_runs(),
            Inner::Remote { base, http } => {
                let resp = http
                    .get(format!("{base}{}", paths::RUNS))
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(remote_err(resp).await);
                }
                let v: Value = resp.json().await.map_err(|e| Error::Transport(e.to_string()))?;
                serde_json::from_value(v["items"].clone())
                    .map_err(|e| Error::Transport(e.to_string()))
            }
        }
    }

    pub async fn delete_run(&self, label: &str) -> Result<bool> {
        match self.inner.as_ref() {
            Inner::Embedded(e) => {
                let deleted = e.state.kernel().delete_run(label)?;
                if deleted {
                    e.state
                        .bus()
                        .publish(topics::TOPIC_RUN_DELETED, &serde_json::json!({"run": label}));
                }
                Ok(deleted)
            }
            Inner::Remote { base, http } => {
                let resp = http
                    .delete(format!("{base}/runs/{label}"))
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(remote_err(resp).await);
                }
                let v: Value = resp.json().await.map_err(|e| Error::Transport(e.to_string()))?;
                Ok(v["deleted"].as_bool().unwrap_or(false))
            }
        }
    }

    pub async fn clean_runs(&self, older_than: &str) -> Result<usize> {
        let cutoff = cardwall_protocol::parse_older_than(older_than)?;
        match self.inner.as_ref() {
            Inner::Embedded(e) => e.state.kernel().clean_runs(cutoff),
            Inner::Remote { base, http } => {
                let resp = http
                    .post(format!("{base}{}", paths::RUNS_CLEAN))
                    .json(&serde_json::json!({"older_than": older_than}))
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(remote_err(resp).await);
                }
                let v: Value = resp.json().await.map_err(|e| Error::Transport(e.to_string()))?;
                Ok(v["removed"].as_u64().unwrap_or(0) as usize)
            }
        }
    }

    /// Unacknowledged send-to-agent requests, oldest first. Acknowledge
    /// each consumed request or it comes back on the next poll.
    pub async fn pending_requests(&self) -> Result<Vec<PendingRequest>> {
        match self.inner.as_ref() {
            Inner::Embedded(e) => e.state.kernel().list_pending(),
            Inner::Remote { base, http } => {
                let resp = http
                    .get(format!("{base}{}", paths::PENDING))
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(remote_err(resp).await);
                }
                let v: Value = resp.json().await.map_err(|e| Error::Transport(e.to_string()))?;
                serde_json::from_value(v["items"].clone())
                    .map_err(|e| Error::Transport(e.to_string()))
            }
        }
    }

    pub async fn acknowledge(&self, request_id: &str) -> Result<bool> {
        match self.inner.as_ref() {
            Inner::Embedded(e) => e.state.kernel().ack_pending(request_id),
            Inner::Remote { base, http } => {
                let resp = http
                    .post(format!("{base}/pending/{request_id}/ack"))
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(remote_err(resp).await);
                }
                let v: Value = resp.json().await.map_err(|e| Error::Transport(e.to_string()))?;
                Ok(v["acked"].as_bool().unwrap_or(false))
            }
        }
    }

    /// Retrieve a selection artifact by id.
    pub async fn get_selection(&self, artifact_id: &str) -> Result<Value> {
        match self.inner.as_ref() {
            Inner::Embedded(e) => e.state.kernel().get_artifact(artifact_id),
            Inner::Remote { base, http } => {
                let resp = http
                    .get(format!("{base}/artifacts/{artifact_id}"))
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(remote_err(resp).await);
                }
                resp.json().await.map_err(|e| Error::Transport(e.to_string()))
            }
        }
    }

    pub async fn export(
        &self,
        path: &std::path::Path,
        format: ExportFormat,
        run: Option<&str>,
    ) -> Result<PathBuf> {
        match self.inner.as_ref() {
            Inner::Embedded(e) => export::export(e.state.kernel(), path, format, run),
            Inner::Remote { base, http } => {
                let resp = http
                    .post(format!("{base}{}", paths::EXPORT))
                    .json(&serde_json::json!({
                        "path": path,
                        "format": match format {
                            ExportFormat::Json => "json",
                            ExportFormat::Html => "html",
                        },
                        "run": run,
                    }))
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(remote_err(resp).await);
                }
                let v: Value = resp.json().await.map_err(|e| Error::Transport(e.to_string()))?;
                Ok(PathBuf::from(v["path"].as_str().unwrap_or_default()))
            }
        }
    }

    /// Register an event callback. Thread mode only; a detached server
    /// cannot call back into this process.
    pub fn on_event(&self, cb: EventCallback) -> Result<()> {
        match self.inner.as_ref() {
            Inner::Embedded(e) => {
                e.state.coordinator().add_callback(cb);
                Ok(())
            }
            Inner::Remote { .. } => Err(Error::Transport(
                "on_event callbacks require thread mode".into(),
            )),
        }
    }

    /// Tear down an embedded instance. For a detached instance use
    /// `stop_server`.
    pub async fn stop(&self) {
        if let Inner::Embedded(e) = self.inner.as_ref() {
            e.state
                .bus()
                .publish(topics::TOPIC_SERVICE_STOPPING, &serde_json::json!({}));
            e.state.request_shutdown();
        }
        let mut cell = INSTANCE.lock().await;
        if let Some(current) = cell.as_ref() {
            if Arc::ptr_eq(&current.inner, &self.inner) {
                *cell = None;
            }
        }
    }

    pub async fn status(&self) -> Result<About> {
        match self.inner.as_ref() {
            Inner::Embedded(e) => Ok(About {
                service: "cardwall".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                pid: std::process::id(),
                port: e.port,
                uptime_secs: e.state.uptime_secs(),
                runs: e.state.kernel().count_runs()?,
            }),
            Inner::Remote { base, http } => {
                let resp = http
                    .get(format!("{base}{}", paths::ABOUT))
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(remote_err(resp).await);
                }
                resp.json().await.map_err(|e| Error::Transport(e.to_string()))
            }
        }
    }
}

/// Ask a detached instance to shut down. Returns whether one was found.
/// Run data on disk survives; only the serving process terminates.
pub async fn stop_server(port: Option<u16>) -> Result<bool> {
    let port = port.unwrap_or_else(config::default_port);
    let http = http_client();
    let mut req = http
        .post(format!("http://127.0.0.1:{port}{}", paths::SHUTDOWN))
        .timeout(Duration::from_secs(2));
    if let Some(token) = config::admin_token() {
        req = req.bearer_auth(token);
    }
    match req.send().await {
        Ok(resp) if resp.status().is_success() => Ok(true),
        Ok(resp) => Err(remote_err(resp).await),
        // Nothing listening is the negative result, not an error.
        Err(_) => Ok(false),
    }
}

/// Status of a detached instance. Absence is a normal result.
pub async fn server_status(port: Option<u16>) -> ServerStatus {
    let port = port.unwrap_or_else(config::default_port);
    let http = http_client();
    let resp = http
        .get(format!("http://127.0.0.1:{port}{}", paths::ABOUT))
        .timeout(Duration::from_secs(2))
        .send()
        .await;
    match resp {
        Ok(resp) if resp.status().is_success() => match resp.json::<About>().await {
            Ok(about) => ServerStatus::Running(about),
            Err(_) => ServerStatus::NotRunning,
        },
        _ => ServerStatus::NotRunning,
    }
}
