use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::broker::Broker;
use super::frame::Frame;
use super::topic::Topic;
use crate::error::BusError;

/// Broker daemon listening on a unix socket.
pub struct BrokerServer {
    socket_path: PathBuf,
    broker: Arc<Broker>,
}

impl BrokerServer {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            broker: Broker::new(),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub async fn run(self, stop: CancellationToken) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket {}", self.socket_path.display())
            })?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind {}", self.socket_path.display()))?;

        info!("Broker listening on: {}", self.socket_path.display());

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let broker = Arc::clone(&self.broker);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(broker, stream).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = stop.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        info!("Broker stopped");
        Ok(())
    }
}

async fn handle_connection(broker: Arc<Broker>, stream: UnixStream) -> Result<(), BusError> {
    trace!("New connection accepted");
    let (mut reader, mut writer) = stream.into_split();

    let (client_id, will) = match Frame::read_from(&mut reader).await? {
        Some(Frame::Connect { client_id, will }) => (client_id, will),
        Some(other) => {
            return Err(BusError::Protocol(format!(
                "expected connect frame, got {:?}",
                other
            )))
        }
        None => return Ok(()),
    };

    let (session, mut deliveries) = broker.attach(&client_id, will);
    Frame::ConnAck.write_to(&mut writer).await?;

    // Deliveries end when the broker drops the session.
    let forwarder = tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let frame = Frame::Publish {
                topic: delivery.topic,
                payload: delivery.payload,
                retain: false,
            };
            if let Err(e) = frame.write_to(&mut writer).await {
                debug!("Failed to forward delivery: {}", e);
                break;
            }
        }
    });

    let mut clean = false;
    loop {
        let frame = match Frame::read_from(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping client '{}': {}", client_id, e);
                break;
            }
        };

        match frame {
            Frame::Subscribe { pattern } => match Topic::parse(&pattern) {
                Ok(topic) => broker.subscribe(session, topic),
                Err(e) => warn!("Client '{}' sent bad subscription: {}", client_id, e),
            },
            Frame::Publish {
                topic,
                payload,
                retain,
            } => broker.publish(&topic, &payload, retain),
            Frame::Disconnect => {
                clean = true;
                break;
            }
            Frame::Connect { .. } | Frame::ConnAck => {
                warn!("Client '{}' sent unexpected {:?}", client_id, frame);
            }
        }
    }

    broker.detach(session, clean);
    let _ = forwarder.await;
    Ok(())
}
