use lifespan_sync::{
    BtleTransport, ChannelBroadcaster, RecordAssembler, RelaySink, Result, Supervisor,
    SupervisorHandle, SyncConfig,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🏃 LifeSpan Sync Listener");

    // Optional JSON config path as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            SyncConfig::from_file(path)?
        }
        None => SyncConfig::default(),
    };

    let (transport, events) = match BtleTransport::new(&config).await {
        Ok(transport) => transport,
        Err(e) => {
            error!("❌ Failed to open Bluetooth adapter: {}", e);
            return Err(e);
        }
    };

    // Stand-in for the phone app: decode whatever the relay publishes
    let (broadcaster, mut subscriber) = ChannelBroadcaster::new();
    let (sink, _worker) = RelaySink::spawn(broadcaster, config.relay_chunk_size);
    tokio::spawn(async move {
        let mut assembler = RecordAssembler::new();
        while let Some(chunk) = subscriber.recv().await {
            match assembler.push(&chunk) {
                Ok(Some(records)) => {
                    for record in records {
                        info!("✅ Synced workout ending {}: {}", record.end, record);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Discarding relayed payload: {}", e),
            }
        }
    });

    let supervisor = Supervisor::new(transport, sink, config)?;
    let (handle, control) = SupervisorHandle::new();
    handle.set_listening(true)?;

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Shutting down...");
            let _ = shutdown.shutdown();
        }
    });

    info!("Waiting for a LifeSpan console. Press Ctrl+C to stop");
    supervisor.run(events, control).await;
    drop(handle);

    Ok(())
}
