//! wirelink - BGAPI device driver
//!
//! Connects to a BGAPI module exposed over TCP (a serial-to-TCP bridge or a
//! networked module), logs its events and queries its firmware information.

use std::net::TcpStream;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;
use wirelink_engine::config::CONFIG_ENV;
use wirelink_engine::{Config, Engine, EngineError, WorkerPool};
use wirelink_protocol::bgapi::{BgapiCodec, Command, Event, MessageId, Response};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if WIRELINK_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var(CONFIG_ENV) {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var(CONFIG_ENV).is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting wirelink");
    tracing::info!("  Device address: {}", config.transport.addr);
    tracing::info!("  Error threshold: {}", config.engine.error_threshold);

    let stream =
        TcpStream::connect_timeout(&config.transport.addr, config.transport.connect_timeout())?;
    stream.set_nodelay(true)?;
    // Reads must time out so the reader thread notices a close.
    stream.set_read_timeout(Some(config.transport.read_timeout()))?;
    let output = stream.try_clone()?;

    let pool = WorkerPool::from_handle(Handle::current());
    let engine = Engine::open_with_pool(BgapiCodec::new(), stream, output, config.engine, pool)?;

    let link_lost = Arc::new(Notify::new());
    let notify = link_lost.clone();
    engine.register_event_listener(log_event)?;
    engine.register_lifecycle_listener(move |error: &EngineError| {
        tracing::error!("Device link lost: {}", error);
        notify.notify_one();
    })?;

    match engine
        .send_async(&Command::SystemHello, MessageId::SYSTEM_HELLO, None)?
        .await
    {
        Ok(_) => tracing::info!("Device answered hello"),
        Err(e) if e.is_closed() => {
            tracing::error!("Device link closed before hello: {}", e);
            return Err(e.into());
        }
        Err(e) => tracing::warn!("Hello failed: {}", e),
    }

    match engine
        .send_async(&Command::SystemGetInfo, MessageId::SYSTEM_GET_INFO, None)?
        .await
    {
        Ok(Response::SystemGetInfo(info)) => tracing::info!(
            "Firmware {}.{}.{} build {} (protocol {}, hw {})",
            info.major,
            info.minor,
            info.patch,
            info.build,
            info.protocol_version,
            info.hw
        ),
        Ok(other) => tracing::warn!("Unexpected response: {:?}", other),
        Err(e) => tracing::warn!("get_info failed: {}", e),
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, closing device link...");
            engine.close(engine.config().close_timeout())?;
        }
        _ = link_lost.notified() => {}
    }

    let stats = engine.frame_stats();
    tracing::info!(
        "Stopped after {} frames ({} resyncs, {} oversized)",
        stats.frames,
        stats.resyncs,
        stats.oversized
    );
    Ok(())
}

fn log_event(event: &Event) {
    match event {
        Event::SystemBoot(info) => tracing::info!(
            "Device booted: firmware {}.{}.{} build {}",
            info.major,
            info.minor,
            info.patch,
            info.build
        ),
        Event::ConnectionStatus {
            connection,
            address,
            flags,
            ..
        } => tracing::info!(
            "Connection {} to {} (flags {:#04x})",
            connection,
            address,
            flags
        ),
        Event::ConnectionDisconnected { connection, reason } => {
            tracing::info!("Connection {} closed (reason {:#06x})", connection, reason)
        }
        Event::GapScanResponse {
            sender, rssi, data, ..
        } => tracing::info!(
            "Scan response from {} rssi {} ({} bytes)",
            sender,
            rssi,
            data.len()
        ),
    }
}
