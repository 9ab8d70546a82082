use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use astoria::bus::{handler, BroadcastHelper, MessageBus};
use astoria::config::AstoriaConfig;
use astoria::daemons::{astdiskd, astmetad, astprocd, socket_transport};
use astoria::error::BusError;
use astoria::ipc::{
    DiskManagerMessage, EventHeader, MetadataManagerMessage, MetadataSetRequest, ProcessManagerMessage,
    RequestHeader, RequestResponse, StartButtonEvent, StaticDiskRequest, UsercodeLogEvent,
};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::args::{CtlCommands, DiskCommands, MetadataCommands, UsercodeCommands};

pub(crate) async fn cmd_ctl(command: CtlCommands, config: &AstoriaConfig) -> anyhow::Result<()> {
    match command {
        CtlCommands::Metadata { command } => cmd_metadata(command, config).await,
        CtlCommands::Usercode { command } => cmd_usercode(command, config).await,
        CtlCommands::Disks { command } => cmd_disks(command, config).await,
        CtlCommands::Start => cmd_start(config).await,
    }
}

fn client_name() -> String {
    format!("astctl-{}", std::process::id())
}

/// Connect a short-lived client and wait for `daemon` to report RUNNING.
async fn connect(config: &AstoriaConfig, daemon: Option<&str>) -> anyhow::Result<Arc<MessageBus>> {
    let bus_config = config.bus_config();
    let timeout = bus_config.request_timeout;
    let bus = MessageBus::builder(client_name(), bus_config, socket_transport(config))
        .dependencies(daemon)
        .build()?;

    bus.connect()
        .await
        .with_context(|| format!("Unable to reach the broker at {}", config.socket_path().display()))?;

    if let Some(daemon) = daemon {
        tokio::time::timeout(timeout, bus.wait_dependencies())
            .await
            .map_err(|_| anyhow!("{} is not running", daemon))?;
    }
    Ok(bus)
}

/// The retained status document of `daemon`.
async fn fetch_status<T: DeserializeOwned + Send + 'static>(
    bus: &MessageBus,
    daemon: &str,
    timeout: Duration,
) -> anyhow::Result<T> {
    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    bus.subscribe(
        daemon,
        handler(move |_, payload| {
            let tx = tx.lock().unwrap_or_else(|e| e.into_inner()).take();
            async move {
                if let Some(tx) = tx {
                    let _ = tx.send(payload);
                }
            }
        }),
    )
    .await?;

    let payload = tokio::time::timeout(timeout, rx)
        .await
        .map_err(|_| anyhow!("No status published by {}", daemon))?
        .map_err(|_| anyhow!("Subscription to {} closed", daemon))?;
    serde_json::from_str(&payload).with_context(|| format!("Invalid status from {}", daemon))
}

/// The daemon's explanation of a request outcome, success or failure.
fn response_reason(result: &Result<RequestResponse, BusError>) -> Option<&str> {
    match result {
        Ok(response) => Some(response.reason.as_str()),
        Err(BusError::RequestFailed(reason)) => Some(reason.as_str()),
        Err(_) => None,
    }
    .filter(|reason| !reason.is_empty())
}

async fn finish(bus: &MessageBus, result: Result<RequestResponse, BusError>) -> anyhow::Result<()> {
    match response_reason(&result) {
        Some(reason) if result.is_ok() => println!("{}", reason),
        Some(reason) => eprintln!("{}", reason),
        None => {}
    }
    bus.disconnect().await?;
    result.map(|_| ()).map_err(|e| anyhow!(e))
}

async fn cmd_metadata(command: MetadataCommands, config: &AstoriaConfig) -> anyhow::Result<()> {
    let bus = connect(config, Some(astmetad::NAME)).await?;
    match command {
        MetadataCommands::Show => {
            let status: MetadataManagerMessage =
                fetch_status(&bus, astmetad::NAME, config.bus_config().request_timeout).await?;
            println!("{}", serde_json::to_string_pretty(&status.metadata)?);
            bus.disconnect().await?;
            Ok(())
        }
        MetadataCommands::Set { attr, value } => {
            let request = MetadataSetRequest {
                header: RequestHeader::new(bus.client_name()),
                attr,
                value,
            };
            let result = bus.manager_request(astmetad::NAME, "mutate", &request).await;
            finish(&bus, result).await
        }
    }
}

async fn cmd_usercode(command: UsercodeCommands, config: &AstoriaConfig) -> anyhow::Result<()> {
    let bus = connect(config, Some(astprocd::NAME)).await?;
    let request = RequestHeader::new(bus.client_name());
    match command {
        UsercodeCommands::Kill => {
            let result = bus.manager_request(astprocd::NAME, "kill", &request).await;
            finish(&bus, result).await
        }
        UsercodeCommands::Restart => {
            let result = bus.manager_request(astprocd::NAME, "restart", &request).await;
            finish(&bus, result).await
        }
        UsercodeCommands::Log => cmd_usercode_log(bus, config).await,
    }
}

async fn cmd_usercode_log(bus: Arc<MessageBus>, config: &AstoriaConfig) -> anyhow::Result<()> {
    let status: ProcessManagerMessage =
        fetch_status(&bus, astprocd::NAME, config.bus_config().request_timeout).await?;
    match status.code_status {
        Some(code) => eprintln!("Usercode is {}", code),
        None => eprintln!("No usercode disk inserted"),
    }

    let logs = BroadcastHelper::<UsercodeLogEvent>::subscribe(Arc::clone(&bus)).await?;
    loop {
        tokio::select! {
            event = logs.recv() => print!("{}", event.content),
            _ = tokio::signal::ctrl_c() => break,
            _ = bus.no_dependency_event().cancelled() => {
                eprintln!("astprocd went away");
                break;
            }
        }
    }
    bus.disconnect().await?;
    Ok(())
}

async fn cmd_disks(command: DiskCommands, config: &AstoriaConfig) -> anyhow::Result<()> {
    let bus = connect(config, Some(astdiskd::NAME)).await?;
    match command {
        DiskCommands::List => {
            let status: DiskManagerMessage =
                fetch_status(&bus, astdiskd::NAME, config.bus_config().request_timeout).await?;
            if status.disks.is_empty() {
                println!("No disks mounted");
            }
            for (uuid, path) in &status.disks {
                println!("{}\t{}", uuid, path.display());
            }
            bus.disconnect().await?;
            Ok(())
        }
        DiskCommands::Add { path } => {
            let request = static_request(&bus, &path)?;
            let result = bus.manager_request(astdiskd::NAME, "add_static_disk", &request).await;
            finish(&bus, result).await
        }
        DiskCommands::Remove { path } => {
            let request = static_request(&bus, &path)?;
            let result = bus.manager_request(astdiskd::NAME, "remove_static_disk", &request).await;
            finish(&bus, result).await
        }
        DiskCommands::RemoveAll => {
            let request = RequestHeader::new(bus.client_name());
            let result = bus
                .manager_request(astdiskd::NAME, "remove_all_static_disks", &request)
                .await;
            finish(&bus, result).await
        }
    }
}

fn static_request(bus: &MessageBus, path: &Path) -> anyhow::Result<StaticDiskRequest> {
    let path = std::path::absolute(path)
        .with_context(|| format!("Invalid path {}", path.display()))?;
    Ok(StaticDiskRequest {
        header: RequestHeader::new(bus.client_name()),
        path,
    })
}

async fn cmd_start(config: &AstoriaConfig) -> anyhow::Result<()> {
    let bus = connect(config, None).await?;
    let event = StartButtonEvent {
        header: EventHeader::new::<StartButtonEvent>(bus.client_name(), 0),
    };
    BroadcastHelper::<StartButtonEvent>::sender(Arc::clone(&bus))
        .send(&event)
        .await?;
    println!("Start button pressed");
    bus.disconnect().await?;
    Ok(())
}
