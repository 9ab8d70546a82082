//! Base for state managers: daemons that own one retained status document.

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bus::{handler, BusConfig, MessageBus, Transport};
use crate::error::BusError;
use crate::ipc::{ManagerRequest, RequestResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerPhase {
    Init,
    Connecting,
    WaitingDependencies,
    Running,
    Stopping,
    Stopped,
}

impl ManagerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerPhase::Init => "init",
            ManagerPhase::Connecting => "connecting",
            ManagerPhase::WaitingDependencies => "waiting for dependencies",
            ManagerPhase::Running => "running",
            ManagerPhase::Stopping => "stopping",
            ManagerPhase::Stopped => "stopped",
        }
    }
}

/// Shared plumbing for a state manager: its bus, stop event and published status.
pub struct ManagerState<S> {
    name: &'static str,
    bus: Arc<MessageBus>,
    stop: CancellationToken,
    status: Mutex<Option<S>>,
    last_published: tokio::sync::Mutex<Option<String>>,
    phase: watch::Sender<ManagerPhase>,
}

impl<S: Serialize + Clone + Send + Sync + 'static> ManagerState<S> {
    /// The offline status doubles as the bus last will.
    pub fn new(
        name: &'static str,
        dependencies: &[&str],
        offline_status: &S,
        config: BusConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BusError> {
        let stop = CancellationToken::new();
        let bus = MessageBus::builder(name, config, transport)
            .dependencies(dependencies.iter().copied())
            .last_will(serde_json::to_string(offline_status)?)
            .no_dependency_event(stop.clone())
            .build()?;

        Ok(Self {
            name,
            bus,
            stop,
            status: Mutex::new(None),
            last_published: tokio::sync::Mutex::new(None),
            phase: watch::channel(ManagerPhase::Init).0,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn halt(&self) {
        if !self.stop.is_cancelled() {
            info!("Halting");
        }
        self.stop.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Wait until the manager is halted.
    pub async fn wait_loop(&self) {
        self.stop.cancelled().await
    }

    pub fn phase(&self) -> ManagerPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<ManagerPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: ManagerPhase) {
        debug!("{} is {}", self.name, phase.as_str());
        self.phase.send_replace(phase);
    }

    pub fn status(&self) -> Option<S> {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record and publish a new status. Publishing is skipped when the document is unchanged.
    pub async fn set_status(&self, status: S) -> Result<(), BusError> {
        let payload = serde_json::to_string(&status)?;
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = Some(status);

        let mut last = self.last_published.lock().await;
        if last.as_deref() == Some(payload.as_str()) {
            trace!("Status unchanged, not republishing");
            return Ok(());
        }

        self.bus.publish_raw("", &payload, true, true).await?;
        *last = Some(payload);
        Ok(())
    }

    /// Serve `{prefix}/{name}/request/{request_name}`.
    ///
    /// Malformed requests are dropped. The response is published on
    /// `{prefix}/{name}/request/{request_name}/{uuid}` with the request's uuid.
    pub async fn register_request<R, F, Fut>(&self, request_name: &str, f: F) -> Result<(), BusError>
    where
        R: ManagerRequest,
        F: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RequestResponse> + Send + 'static,
    {
        let bus = Arc::downgrade(&self.bus);
        let f = Arc::new(f);
        let name = request_name.to_string();

        self.bus
            .subscribe(
                &format!("{}/request/{}", self.name, request_name),
                handler(move |_, payload| {
                    let bus = bus.clone();
                    let f = Arc::clone(&f);
                    let name = name.clone();
                    async move {
                        let request: R = match serde_json::from_str(&payload) {
                            Ok(request) => request,
                            Err(e) => {
                                warn!("Received malformed {} request: {}", name, e);
                                return;
                            }
                        };
                        let uuid = request.uuid();
                        debug!(
                            "Handling {} request {} from {}",
                            name,
                            uuid,
                            request.header().sender_name
                        );

                        let mut response = f(request).await;
                        response.uuid = uuid;

                        let Some(bus) = bus.upgrade() else {
                            return;
                        };
                        let topic = format!("request/{}/{}", name, uuid);
                        if let Err(e) = bus.publish(&topic, &response, false, true).await {
                            warn!("Unable to respond to {} request {}: {}", name, uuid, e);
                        }
                    }
                }),
            )
            .await
    }
}

#[async_trait]
pub trait StateManager: Send + Sync + 'static {
    type Status: Serialize + Clone + Send + Sync + 'static;

    fn state(&self) -> &ManagerState<Self::Status>;

    fn offline_status(&self) -> Self::Status;

    /// Register subscriptions and request handlers. Runs before connecting.
    async fn init(self: Arc<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn main(self: Arc<Self>) -> anyhow::Result<()>;
}

/// Drive a manager through its whole lifecycle.
pub async fn run<M: StateManager>(manager: Arc<M>) -> anyhow::Result<()> {
    let state = manager.state();
    info!("{} v{} starting", state.name(), crate::ipc::ASTORIA_VERSION);

    Arc::clone(&manager).init().await?;

    state.set_phase(ManagerPhase::Connecting);
    state.bus().connect().await?;

    state.set_phase(ManagerPhase::WaitingDependencies);
    state.bus().wait_dependencies().await;

    let result = if state.is_stopping() {
        warn!("Stopped before dependencies became available");
        Ok(())
    } else {
        state.set_phase(ManagerPhase::Running);
        Arc::clone(&manager).main().await
    };

    state.set_phase(ManagerPhase::Stopping);
    if state.bus().is_connected() {
        if let Err(e) = state.set_status(manager.offline_status()).await {
            warn!("Unable to publish offline status: {}", e);
        }
        if let Err(e) = state.bus().disconnect().await {
            warn!("Unable to disconnect cleanly: {}", e);
        }
    } else {
        warn!("Broker connection already gone, relying on last will");
    }

    state.set_phase(ManagerPhase::Stopped);
    info!("{} stopped", state.name());
    result
}

/// Halt on SIGHUP, SIGINT or SIGTERM.
pub fn spawn_signal_handler(stop: CancellationToken) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sighup.recv() => info!("Received SIGHUP"),
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
            stop.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received Ctrl+C");
            stop.cancel();
        });
    }

    Ok(())
}
