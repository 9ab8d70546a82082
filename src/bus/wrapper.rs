use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::broker::Delivery;
use super::frame::Will;
use super::topic::Topic;
use super::transport::Transport;
use crate::error::BusError;
use crate::ipc::{ManagerRequest, RequestResponse, StatusHeader};

pub const DEFAULT_TOPIC_PREFIX: &str = "astoria";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked with the wildcard captures and the raw payload of a message.
pub type Handler = Arc<dyn Fn(Vec<String>, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Box an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Vec<String>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |captures, payload| Box::pin(f(captures, payload)))
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub topic_prefix: String,
    pub request_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

pub struct MessageBusBuilder {
    client_name: String,
    config: BusConfig,
    transport: Arc<dyn Transport>,
    last_will: Option<String>,
    dependencies: Vec<String>,
    no_dependency_event: Option<CancellationToken>,
}

impl MessageBusBuilder {
    /// Retained payload the broker publishes on the client's own topic if it drops uncleanly.
    pub fn last_will(mut self, payload: impl Into<String>) -> Self {
        self.last_will = Some(payload.into());
        self
    }

    pub fn dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = names.into_iter().map(Into::into).collect();
        self
    }

    /// Token cancelled when a dependency goes away or the broker connection is lost.
    pub fn no_dependency_event(mut self, token: CancellationToken) -> Self {
        self.no_dependency_event = Some(token);
        self
    }

    pub fn build(self) -> Result<Arc<MessageBus>, BusError> {
        let root = Topic::parse(&self.config.topic_prefix)?;
        let own = root.join(&self.client_name)?;
        let dependency_pattern = root.join("+")?;
        let response_pattern = root.join("+/request/+/+")?;

        let health = self
            .dependencies
            .iter()
            .map(|name| (name.clone(), watch::channel(false).0))
            .collect();

        let bus = Arc::new_cyclic(|weak: &Weak<MessageBus>| {
            let mut handlers: HashMap<Topic, Handler> = HashMap::new();

            let dep = weak.clone();
            handlers.insert(
                dependency_pattern,
                handler(move |captures, payload| {
                    let dep = dep.clone();
                    async move {
                        if let Some(bus) = dep.upgrade() {
                            bus.handle_dependency_status(&captures, &payload);
                        }
                    }
                }),
            );

            let resp = weak.clone();
            handlers.insert(
                response_pattern,
                handler(move |captures, payload| {
                    let resp = resp.clone();
                    async move {
                        if let Some(bus) = resp.upgrade() {
                            bus.handle_response(&captures, &payload);
                        }
                    }
                }),
            );

            MessageBus {
                client_name: self.client_name,
                root,
                own,
                transport: self.transport,
                last_will: self.last_will,
                dependencies: self.dependencies,
                health,
                no_dependency: self
                    .no_dependency_event
                    .unwrap_or_else(CancellationToken::new),
                handlers: RwLock::new(handlers),
                pending: Mutex::new(HashMap::new()),
                request_timeout: self.config.request_timeout,
                disconnecting: AtomicBool::new(false),
            }
        });

        Ok(bus)
    }
}

/// One client's view of the message bus.
///
/// Owns dependency health tracking, handler dispatch and request/response correlation.
pub struct MessageBus {
    client_name: String,
    root: Topic,
    own: Topic,
    transport: Arc<dyn Transport>,
    last_will: Option<String>,
    dependencies: Vec<String>,
    health: HashMap<String, watch::Sender<bool>>,
    no_dependency: CancellationToken,
    handlers: RwLock<HashMap<Topic, Handler>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<RequestResponse>>>,
    request_timeout: Duration,
    disconnecting: AtomicBool,
}

impl MessageBus {
    pub fn builder(
        client_name: impl Into<String>,
        config: BusConfig,
        transport: Arc<dyn Transport>,
    ) -> MessageBusBuilder {
        MessageBusBuilder {
            client_name: client_name.into(),
            config,
            transport,
            last_will: None,
            dependencies: Vec::new(),
            no_dependency_event: None,
        }
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Topic this client publishes under, `{prefix}/{client}`.
    pub fn own_topic(&self) -> &Topic {
        &self.own
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn no_dependency_event(&self) -> &CancellationToken {
        &self.no_dependency
    }

    pub async fn connect(self: &Arc<Self>) -> Result<(), BusError> {
        if self.transport.is_connected() {
            error!("Attempted to connect, but client is already connected");
            return Err(BusError::AlreadyConnected);
        }

        let will = self.last_will.as_ref().map(|payload| Will {
            topic: self.own.to_string(),
            payload: payload.clone(),
            retain: true,
        });

        self.disconnecting.store(false, Ordering::SeqCst);
        let deliveries = self.transport.connect(&self.client_name, will).await?;
        info!("Connected to broker as '{}'", self.client_name);

        let patterns: Vec<Topic> = self.read_handlers().keys().cloned().collect();
        for pattern in &patterns {
            self.transport.subscribe(pattern).await?;
        }

        tokio::spawn(Arc::clone(self).dispatch(deliveries));
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), BusError> {
        if !self.transport.is_connected() {
            error!("Attempted to disconnect, but client is not connected");
            return Err(BusError::NotConnected);
        }

        self.disconnecting.store(true, Ordering::SeqCst);
        self.transport.disconnect().await?;

        if self.transport.is_connected() {
            error!("Transport still connected after disconnect");
            return Err(BusError::DisconnectFailed);
        }
        info!("Disconnected from broker");
        Ok(())
    }

    /// Subscribe to `{prefix}/{suffix}`.
    pub async fn subscribe(&self, suffix: &str, handler: Handler) -> Result<(), BusError> {
        let topic = self.root.join(suffix)?;
        debug!("Subscribing to {}", topic);
        self.write_handlers().insert(topic.clone(), handler);
        if self.transport.is_connected() {
            self.transport.subscribe(&topic).await?;
        }
        Ok(())
    }

    /// Publish to `{prefix}/{client}/{suffix}`, or to `{prefix}/{suffix}` without the client prefix.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        suffix: &str,
        payload: &T,
        retain: bool,
        auto_prefix_client_name: bool,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_string(payload)?;
        self.publish_raw(suffix, &payload, retain, auto_prefix_client_name)
            .await
    }

    pub async fn publish_raw(
        &self,
        suffix: &str,
        payload: &str,
        retain: bool,
        auto_prefix_client_name: bool,
    ) -> Result<(), BusError> {
        if !self.transport.is_connected() {
            return Err(BusError::NotConnected);
        }

        let base = if auto_prefix_client_name {
            &self.own
        } else {
            &self.root
        };
        let topic = base.join(suffix)?;
        if !topic.is_publishable() {
            return Err(BusError::NotPublishable(topic.to_string()));
        }

        trace!(topic = %topic, retain = retain, "Publishing");
        self.transport
            .publish(&topic.to_string(), payload, retain)
            .await
    }

    /// Wait until every dependency reports RUNNING, or the no-dependency event fires.
    pub async fn wait_dependencies(&self) {
        if self.dependencies.is_empty() {
            return;
        }

        info!("Waiting for dependencies: {}", self.dependencies.join(", "));
        let waits = self.health.values().map(|tx| {
            let mut rx = tx.subscribe();
            async move {
                let _ = rx.wait_for(|up| *up).await;
            }
        });

        tokio::select! {
            _ = join_all(waits) => info!("All dependencies are running"),
            _ = self.no_dependency.cancelled() => {
                warn!("Stopped waiting for dependencies");
            }
        }
    }

    pub fn dependency_is_running(&self, name: &str) -> bool {
        self.health.get(name).map(|tx| *tx.borrow()).unwrap_or(false)
    }

    /// Send a request to a declared dependency and wait for its correlated response.
    ///
    /// A response with `success = false` becomes [`BusError::RequestFailed`].
    pub async fn manager_request<R: ManagerRequest>(
        &self,
        daemon: &str,
        request_name: &str,
        request: &R,
    ) -> Result<RequestResponse, BusError> {
        if !self.dependencies.iter().any(|d| d == daemon) {
            return Err(BusError::UndeclaredDependency(daemon.to_string()));
        }

        let uuid = request.uuid();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(uuid, tx);

        let suffix = format!("{}/request/{}", daemon, request_name);
        if let Err(e) = self.publish(&suffix, request, false, false).await {
            self.lock_pending().remove(&uuid);
            return Err(e);
        }

        let outcome = tokio::time::timeout(self.request_timeout, rx).await;
        self.lock_pending().remove(&uuid);

        match outcome {
            Ok(Ok(response)) if response.success => Ok(response),
            Ok(Ok(response)) => Err(BusError::RequestFailed(response.reason)),
            Ok(Err(_)) => Err(BusError::ResponseDropped),
            Err(_) => Err(BusError::Timeout {
                daemon: daemon.to_string(),
                request: request_name.to_string(),
            }),
        }
    }

    async fn dispatch(self: Arc<Self>, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = deliveries.recv().await {
            let matched: Vec<(Handler, Vec<String>)> = self
                .read_handlers()
                .iter()
                .filter_map(|(pattern, h)| {
                    pattern
                        .matches(&delivery.topic)
                        .map(|captures| (Arc::clone(h), captures))
                })
                .collect();

            if matched.is_empty() {
                trace!(topic = %delivery.topic, "No handler for message");
            }
            for (h, captures) in matched {
                tokio::spawn(h(captures, delivery.payload.clone()));
            }
        }

        if !self.disconnecting.load(Ordering::SeqCst) {
            error!("Lost connection to the broker");
            self.no_dependency.cancel();
        }
    }

    fn handle_dependency_status(&self, captures: &[String], payload: &str) {
        let Some(name) = captures.first() else {
            return;
        };
        let Some(event) = self.health.get(name) else {
            return;
        };

        let running = if payload.is_empty() {
            false
        } else {
            match serde_json::from_str::<StatusHeader>(payload) {
                Ok(header) => header.status.is_running(),
                Err(e) => {
                    warn!("Unable to decode status of {}: {}", name, e);
                    false
                }
            }
        };

        let was_running = event.send_replace(running);
        if running && !was_running {
            info!("Dependency {} is running", name);
        } else if !running && was_running {
            warn!("Dependency {} is no longer running", name);
            self.no_dependency.cancel();
        }
    }

    fn handle_response(&self, captures: &[String], payload: &str) {
        let Some(Ok(uuid)) = captures.get(2).map(|raw| Uuid::parse_str(raw)) else {
            debug!("Ignoring response with malformed correlation id");
            return;
        };

        let Some(tx) = self.lock_pending().remove(&uuid) else {
            trace!("Ignoring response {} for another client", uuid);
            return;
        };

        let response = match serde_json::from_str::<RequestResponse>(payload) {
            Ok(response) => response,
            Err(e) => RequestResponse {
                uuid,
                success: false,
                reason: format!("Invalid response: {}", e),
            },
        };
        let _ = tx.send(response);
    }

    fn read_handlers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Topic, Handler>> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_handlers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Topic, Handler>> {
        self.handlers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<RequestResponse>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::broker::Broker;
    use crate::bus::transport::LocalTransport;
    use crate::ipc::{ManagerMessage, RequestHeader};
    use std::sync::atomic::AtomicUsize;

    fn local_bus(
        broker: &Arc<Broker>,
        name: &str,
        deps: &[&str],
    ) -> (Arc<MessageBus>, Arc<LocalTransport>) {
        let transport = Arc::new(LocalTransport::new(Arc::clone(broker)));
        let bus = MessageBus::builder(name, BusConfig::default(), transport.clone())
            .dependencies(deps.iter().copied())
            .build()
            .unwrap();
        (bus, transport)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_are_guarded() {
        let broker = Broker::new();
        let (bus, _) = local_bus(&broker, "astdiskd", &[]);

        assert!(matches!(bus.disconnect().await, Err(BusError::NotConnected)));
        bus.connect().await.unwrap();
        assert!(matches!(bus.connect().await, Err(BusError::AlreadyConnected)));
        bus.disconnect().await.unwrap();
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn test_publish_prefixing() {
        let broker = Broker::new();
        let (bus, _) = local_bus(&broker, "astdiskd", &[]);
        bus.connect().await.unwrap();

        bus.publish("", &ManagerMessage::running(), true, true)
            .await
            .unwrap();
        bus.publish("broadcast/test", &"x", true, false)
            .await
            .unwrap();

        assert!(broker.retained("astoria/astdiskd").is_some());
        assert!(broker.retained("astoria/broadcast/test").is_some());
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcards_and_disconnected() {
        let broker = Broker::new();
        let (bus, _) = local_bus(&broker, "astdiskd", &[]);
        assert!(matches!(
            bus.publish("", &"x", false, true).await,
            Err(BusError::NotConnected)
        ));

        bus.connect().await.unwrap();
        assert!(matches!(
            bus.publish("+", &"x", false, true).await,
            Err(BusError::NotPublishable(_))
        ));
    }

    #[tokio::test]
    async fn test_all_matching_handlers_invoked() {
        let broker = Broker::new();
        let (bus, _) = local_bus(&broker, "watcher", &[]);
        let hits = Arc::new(AtomicUsize::new(0));

        for suffix in ["astdiskd", "+"] {
            let hits = Arc::clone(&hits);
            bus.subscribe(
                suffix,
                handler(move |_, _| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();
        }
        bus.connect().await.unwrap();

        broker.publish("astoria/astdiskd", "{}", false);
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wait_dependencies_ready() {
        let broker = Broker::new();
        let (bus, _) = local_bus(&broker, "astmetad", &["astdiskd"]);
        bus.connect().await.unwrap();

        let waiter = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move { bus.wait_dependencies().await }
        });
        settle().await;
        assert!(!waiter.is_finished());

        let running = serde_json::to_string(&ManagerMessage::running()).unwrap();
        broker.publish("astoria/astdiskd", &running, true);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(bus.dependency_is_running("astdiskd"));
        assert!(!bus.no_dependency_event().is_cancelled());
    }

    #[tokio::test]
    async fn test_retained_stopped_status_does_not_abort_startup() {
        let broker = Broker::new();
        let stopped = serde_json::to_string(&ManagerMessage::stopped()).unwrap();
        broker.publish("astoria/astdiskd", &stopped, true);

        let (bus, _) = local_bus(&broker, "astmetad", &["astdiskd"]);
        bus.connect().await.unwrap();
        settle().await;

        assert!(!bus.dependency_is_running("astdiskd"));
        assert!(!bus.no_dependency_event().is_cancelled());
    }

    #[tokio::test]
    async fn test_dependency_loss_fires_event() {
        let broker = Broker::new();
        let (bus, _) = local_bus(&broker, "astprocd", &["astdiskd", "astmetad"]);
        bus.connect().await.unwrap();

        let running = serde_json::to_string(&ManagerMessage::running()).unwrap();
        let stopped = serde_json::to_string(&ManagerMessage::stopped()).unwrap();
        broker.publish("astoria/astdiskd", &running, true);
        settle().await;
        broker.publish("astoria/astdiskd", &stopped, true);
        settle().await;

        assert!(bus.no_dependency_event().is_cancelled());
        // The wait unblocks even though astmetad never came up.
        tokio::time::timeout(Duration::from_secs(1), bus.wait_dependencies())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bus_loss_fires_event() {
        let broker = Broker::new();
        let (bus, transport) = local_bus(&broker, "astmetad", &["astdiskd"]);
        bus.connect().await.unwrap();

        transport.sever();
        settle().await;

        assert!(bus.no_dependency_event().is_cancelled());
    }

    #[tokio::test]
    async fn test_clean_disconnect_does_not_fire_event() {
        let broker = Broker::new();
        let (bus, _) = local_bus(&broker, "astmetad", &[]);
        bus.connect().await.unwrap();
        bus.disconnect().await.unwrap();
        settle().await;
        assert!(!bus.no_dependency_event().is_cancelled());
    }

    #[tokio::test]
    async fn test_request_to_undeclared_dependency_rejected() {
        let broker = Broker::new();
        let (bus, _) = local_bus(&broker, "astctl", &[]);
        bus.connect().await.unwrap();
        let result = bus
            .manager_request("astprocd", "kill", &RequestHeader::new("astctl"))
            .await;
        assert!(matches!(result, Err(BusError::UndeclaredDependency(_))));
    }

    #[tokio::test]
    async fn test_request_timeout_clears_pending() {
        let broker = Broker::new();
        let transport = Arc::new(LocalTransport::new(Arc::clone(&broker)));
        let config = BusConfig {
            request_timeout: Duration::from_millis(50),
            ..BusConfig::default()
        };
        let bus = MessageBus::builder("astctl", config, transport)
            .dependencies(["astprocd"])
            .build()
            .unwrap();
        bus.connect().await.unwrap();

        let result = bus
            .manager_request("astprocd", "kill", &RequestHeader::new("astctl"))
            .await;
        assert!(matches!(result, Err(BusError::Timeout { .. })));
        assert!(bus.lock_pending().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_correlate_out_of_order() {
        let broker = Broker::new();
        let (server, _) = local_bus(&broker, "astprocd", &[]);
        let (client, _) = local_bus(&broker, "astctl", &["astprocd"]);

        // Answer each request with its own id as the reason, in reverse arrival order.
        let seen: Arc<Mutex<Vec<RequestHeader>>> = Arc::default();
        {
            let seen = Arc::clone(&seen);
            let broker = Arc::clone(&broker);
            server
                .subscribe(
                    "astprocd/request/kill",
                    handler(move |_, payload| {
                        let seen = Arc::clone(&seen);
                        let broker = Arc::clone(&broker);
                        async move {
                            let request: RequestHeader = serde_json::from_str(&payload).unwrap();
                            let batch = {
                                let mut seen = seen.lock().unwrap();
                                seen.push(request);
                                if seen.len() < 2 {
                                    return;
                                }
                                std::mem::take(&mut *seen)
                            };
                            for request in batch.iter().rev() {
                                let response = RequestResponse::ok_with(request, request.uuid.to_string());
                                broker.publish(
                                    &format!("astoria/astprocd/request/kill/{}", request.uuid),
                                    &serde_json::to_string(&response).unwrap(),
                                    false,
                                );
                            }
                        }
                    }),
                )
                .await
                .unwrap();
        }
        server.connect().await.unwrap();
        client.connect().await.unwrap();

        let first = RequestHeader::new("astctl");
        let second = RequestHeader::new("astctl");
        let (a, b) = tokio::join!(
            client.manager_request("astprocd", "kill", &first),
            client.manager_request("astprocd", "kill", &second),
        );

        assert_eq!(a.unwrap().reason, first.uuid.to_string());
        assert_eq!(b.unwrap().reason, second.uuid.to_string());
    }

    #[tokio::test]
    async fn test_malformed_response_becomes_failure() {
        let broker = Broker::new();
        let (client, _) = local_bus(&broker, "astctl", &["astmetad"]);
        client.connect().await.unwrap();

        let request = RequestHeader::new("astctl");
        let topic = format!("astoria/astmetad/request/mutate/{}", request.uuid);
        let responder = {
            let broker = Arc::clone(&broker);
            async move {
                settle().await;
                broker.publish(&topic, "not json", false);
            }
        };

        let (result, _) = tokio::join!(
            client.manager_request("astmetad", "mutate", &request),
            responder
        );
        match result {
            Err(BusError::RequestFailed(reason)) => assert!(reason.starts_with("Invalid response")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
