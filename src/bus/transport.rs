use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::broker::{Broker, Delivery, SessionId};
use super::frame::{Frame, Will};
use super::topic::Topic;
use crate::error::BusError;

/// Connection to a broker.
///
/// The receiver handed out by `connect` closes when the connection is lost.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        client_id: &str,
        will: Option<Will>,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BusError>;

    async fn subscribe(&self, pattern: &Topic) -> Result<(), BusError>;

    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError>;

    async fn disconnect(&self) -> Result<(), BusError>;

    fn is_connected(&self) -> bool;
}

/// Transport to a broker in the same process.
pub struct LocalTransport {
    broker: Arc<Broker>,
    session: Mutex<Option<SessionId>>,
}

impl LocalTransport {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> Option<SessionId> {
        *self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop the session as if the connection died. The broker publishes the will.
    pub fn sever(&self) {
        let taken = self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(id) = taken {
            self.broker.detach(id, false);
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(
        &self,
        client_id: &str,
        will: Option<Will>,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BusError> {
        if self.is_connected() {
            return Err(BusError::AlreadyConnected);
        }
        let (id, rx) = self.broker.attach(client_id, will);
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
        Ok(rx)
    }

    async fn subscribe(&self, pattern: &Topic) -> Result<(), BusError> {
        let id = self.session().ok_or(BusError::NotConnected)?;
        self.broker.subscribe(id, pattern.clone());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.broker.publish(topic, payload, retain);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        let taken = self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        let id = taken.ok_or(BusError::NotConnected)?;
        self.broker.detach(id, true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session()
            .map(|id| self.broker.is_attached(id))
            .unwrap_or(false)
    }
}

/// Transport to the broker daemon over a unix socket.
pub struct SocketTransport {
    socket_path: PathBuf,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    // Fresh flag per connection so a stale reader task cannot clear a newer one.
    connected: Mutex<Arc<AtomicBool>>,
}

impl SocketTransport {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            writer: tokio::sync::Mutex::new(None),
            connected: Mutex::new(Arc::new(AtomicBool::new(false))),
        }
    }

    fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn send(&self, frame: Frame) -> Result<(), BusError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BusError::NotConnected)?;
        if let Err(e) = frame.write_to(writer).await {
            self.flag().store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn connect(
        &self,
        client_id: &str,
        will: Option<Will>,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BusError> {
        if self.is_connected() {
            return Err(BusError::AlreadyConnected);
        }

        let stream = UnixStream::connect(&self.socket_path).await?;
        let (mut reader, mut writer) = stream.into_split();

        Frame::Connect {
            client_id: client_id.to_string(),
            will,
        }
        .write_to(&mut writer)
        .await?;

        match Frame::read_from(&mut reader).await? {
            Some(Frame::ConnAck) => {}
            other => {
                return Err(BusError::Protocol(format!(
                    "expected conn_ack, got {:?}",
                    other
                )))
            }
        }
        debug!("Connected to broker at {}", self.socket_path.display());

        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        *self.connected.lock().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&connected);
        *self.writer.lock().await = Some(writer);

        tokio::spawn(async move {
            loop {
                match Frame::read_from(&mut reader).await {
                    Ok(Some(Frame::Publish { topic, payload, .. })) => {
                        trace!(topic = %topic, "Received");
                        if tx.send(Delivery { topic, payload }).is_err() {
                            break;
                        }
                    }
                    Ok(Some(other)) => warn!("Unexpected frame from broker: {:?}", other),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Broker connection error: {}", e);
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        Ok(rx)
    }

    async fn subscribe(&self, pattern: &Topic) -> Result<(), BusError> {
        self.send(Frame::Subscribe {
            pattern: pattern.to_string(),
        })
        .await
    }

    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError> {
        self.send(Frame::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        })
        .await
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let result = self.send(Frame::Disconnect).await;
        self.writer.lock().await.take();
        self.flag().store(false, Ordering::SeqCst);
        result
    }

    fn is_connected(&self) -> bool {
        self.flag().load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::server::BrokerServer;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_local_connect_twice_fails() {
        let transport = LocalTransport::new(Broker::new());
        let _rx = transport.connect("a", None).await.unwrap();
        assert!(matches!(
            transport.connect("a", None).await,
            Err(BusError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_local_sever_closes_deliveries() {
        let broker = Broker::new();
        let transport = LocalTransport::new(Arc::clone(&broker));
        let mut rx = transport
            .connect(
                "astdiskd",
                Some(Will {
                    topic: "astoria/astdiskd".to_string(),
                    payload: "offline".to_string(),
                    retain: true,
                }),
            )
            .await
            .unwrap();

        transport.sever();

        assert!(rx.recv().await.is_none());
        assert!(!transport.is_connected());
        assert_eq!(broker.retained("astoria/astdiskd").as_deref(), Some("offline"));
    }

    #[tokio::test]
    async fn test_socket_transport_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("broker.sock");
        let stop = CancellationToken::new();
        let server = BrokerServer::new(&socket);
        let server_task = tokio::spawn(server.run(stop.clone()));

        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let publisher = SocketTransport::new(&socket);
        let subscriber = SocketTransport::new(&socket);
        let _pub_rx = publisher.connect("pub", None).await.unwrap();
        let mut rx = subscriber.connect("sub", None).await.unwrap();

        subscriber
            .subscribe(&Topic::parse("astoria/+").unwrap())
            .await
            .unwrap();
        // Subscription is applied by the broker before the retained publish arrives.
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher
            .publish("astoria/astdiskd", "{}", true)
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.topic, "astoria/astdiskd");

        subscriber.disconnect().await.unwrap();
        assert!(!subscriber.is_connected());
        assert!(matches!(
            subscriber.disconnect().await,
            Err(BusError::NotConnected)
        ));

        stop.cancel();
        server_task.await.unwrap().unwrap();
    }
}
