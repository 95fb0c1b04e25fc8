//! Control plane: start/stop lifecycle, status and counters, and the JSON
//! request/response surface the UI polls.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::counters::{Counters, CountersSnapshot};
use crate::hosts::{self, HostsError};
use crate::logging::{LogBuffer, LogRecord};
use crate::routing::{RouteError, RouteTable};
use crate::server::{self, ServerContext};
use crate::tls;
use crate::trust::{self, InstallOutcome, TrustError};

/// Extra slack on top of the server's own drain window.
const STOP_TIMEOUT: Duration = Duration::from_secs(server::DRAIN_TIMEOUT.as_secs() + 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ProxyState,
    pub counters: CountersSnapshot,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("certificate setup failed: {0}")]
    Trust(#[from] TrustError),
    #[error("hosts file update failed: {0}")]
    Hosts(#[from] HostsError),
    #[error("invalid proxy configuration: {0}")]
    Config(#[from] RouteError),
    #[error("tls initialization failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// One operation of the control API. Serialized as JSON with an `op` tag.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ControlRequest {
    Start { config: ProxyConfig },
    Stop,
    Status,
    GetCounters,
    GetLogs { since: u64 },
    ClearLogs,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ControlResponse {
    Ack,
    Status { status: StatusSnapshot },
    Counters { counters: CountersSnapshot },
    Logs { records: Vec<LogRecord> },
    Error { message: String },
}

struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

struct Inner {
    state: ProxyState,
    last_error: Option<String>,
    running: Option<Running>,
}

/// Owns the proxy lifecycle. `Stopped -> Starting -> Running -> Stopping ->
/// Stopped`, with `Failed` reachable from `Starting` and `Running`.
pub struct Controller {
    inner: tokio::sync::Mutex<Inner>,
    counters: Arc<Counters>,
    logs: LogBuffer,
}

impl Controller {
    pub fn new(logs: LogBuffer) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(Inner {
                state: ProxyState::Stopped,
                last_error: None,
                running: None,
            }),
            counters: Arc::new(Counters::new()),
            logs,
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// Prepares the host (certificate, trust store, hosts block), binds the
    /// listener and spawns the accept loop. Idempotent while running.
    pub async fn start(&self, config: ProxyConfig) -> Result<SocketAddr, StartError> {
        let mut inner = self.inner.lock().await;
        if let Some(running) = &inner.running {
            tracing::debug!("start requested while already running");
            return Ok(running.local_addr);
        }

        inner.state = ProxyState::Starting;
        match self.start_inner(config).await {
            Ok(running) => {
                let addr = running.local_addr;
                inner.state = ProxyState::Running;
                inner.last_error = None;
                inner.running = Some(running);
                Ok(addr)
            }
            Err(e) => {
                inner.state = ProxyState::Failed;
                inner.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn start_inner(&self, config: ProxyConfig) -> Result<Running, StartError> {
        let data_dir = trust::data_dir()?;
        let bundle = trust::ensure(&data_dir, &config.certificate_domains())?;

        match trust::install_to_system_trust(&bundle)? {
            InstallOutcome::Installed => {
                tracing::info!(fingerprint = %bundle.fingerprint, "trust anchor installed");
            }
            InstallOutcome::AlreadyPresent => {
                tracing::debug!(fingerprint = %bundle.fingerprint, "trust anchor already installed");
            }
        }

        hosts::ensure_aliases(&hosts::hosts_path(), &config.hosts_aliases())?;

        let table = RouteTable::new(&config)?;
        let tls_config = tls::server_config(&bundle)?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StartError::Bind { addr, source })?;
        let local_addr = listener.local_addr().unwrap_or(addr);

        let ctx = Arc::new(ServerContext::new(
            config,
            table,
            tls_config,
            self.counters.clone(),
        ));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server::serve(listener, ctx, shutdown.clone()));

        tracing::info!(addr = %local_addr, "proxy listening");
        Ok(Running {
            shutdown,
            task,
            local_addr,
        })
    }

    /// Stops accepting, drains in-flight connections, removes the hosts
    /// block. The certificate stays installed; uninstalling it is a
    /// separate explicit action.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        let Some(running) = inner.running.take() else {
            inner.state = ProxyState::Stopped;
            return;
        };

        inner.state = ProxyState::Stopping;
        running.shutdown.cancel();

        let mut task = running.task;
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!("accept loop did not stop in time, aborting");
            task.abort();
            let _ = task.await;
        }

        if let Err(e) = hosts::remove_block(&hosts::hosts_path()) {
            tracing::warn!(error = %e, "failed to remove hosts block");
        }

        inner.state = ProxyState::Stopped;
        tracing::info!("proxy stopped");
    }

    pub async fn status(&self) -> StatusSnapshot {
        let inner = self.inner.lock().await;
        StatusSnapshot {
            state: inner.state,
            counters: self.counters.snapshot(),
            last_error: inner.last_error.clone(),
        }
    }

    /// JSON-in, JSON-out wrapper around [`Controller::dispatch`].
    pub async fn dispatch_json(&self, request: &str) -> String {
        let response = match serde_json::from_str::<ControlRequest>(request) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => ControlResponse::Error {
                message: format!("invalid control request: {}", e),
            },
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(r#"{{"kind":"error","message":"serialization failed: {}"}}"#, e)
        })
    }

    /// Maps one control request to one response. The UI polls; there is no
    /// streaming surface.
    pub async fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Start { config } => match self.start(config).await {
                Ok(_) => ControlResponse::Ack,
                Err(e) => ControlResponse::Error {
                    message: e.to_string(),
                },
            },
            ControlRequest::Stop => {
                self.stop().await;
                ControlResponse::Ack
            }
            ControlRequest::Status => ControlResponse::Status {
                status: self.status().await,
            },
            ControlRequest::GetCounters => ControlResponse::Counters {
                counters: self.counters.snapshot(),
            },
            ControlRequest::GetLogs { since } => ControlResponse::Logs {
                records: self.logs.records_since(since),
            },
            ControlRequest::ClearLogs => {
                self.logs.clear();
                ControlResponse::Ack
            }
        }
    }
}
