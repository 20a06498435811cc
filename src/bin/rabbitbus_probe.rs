//! rabbitbus-probe: round-trips a heartbeat through the configured broker.
//!
//! Subscribes a logging handler to `Heartbeat`, starts consuming, publishes
//! one heartbeat and keeps consuming until ctrl-c.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use rabbitbus::bus::init_event_bus;
use rabbitbus::config::Config;
use rabbitbus::utils::bootstrap::init_tracing;
use rabbitbus::{Event, EventHandler, HandlerResult, Message, MessageHeader};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Heartbeat {
    #[serde(flatten)]
    header: MessageHeader,
    source: String,
}

impl Message for Heartbeat {}

impl Event for Heartbeat {
    fn header(&self) -> &MessageHeader {
        &self.header
    }
}

#[derive(Default)]
struct LogHeartbeat;

#[async_trait]
impl EventHandler<Heartbeat> for LogHeartbeat {
    async fn handle(&self, event: Heartbeat) -> HandlerResult {
        info!(
            source = %event.source,
            sent_at = %event.timestamp(),
            "Heartbeat received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(std::env::args().nth(1).as_deref())?;
    info!(rabbitmq = ?config.messaging.rabbitmq, "Starting probe");

    let bus = init_event_bus(&config.messaging).await?;
    bus.subscribe::<Heartbeat, LogHeartbeat>().await?;
    bus.start_all().await?;

    let heartbeat = Heartbeat {
        header: MessageHeader::new::<Heartbeat>(),
        source: "rabbitbus-probe".to_string(),
    };
    if let Err(e) = bus.publish(&heartbeat).await {
        error!(error = %e, "Failed to publish heartbeat");
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
