use lifespan_sync::{
    protocol::Decimal, ChannelBroadcaster, RecordAssembler, RelaySink, Result, SimulatedTransport,
    Supervisor, SupervisorHandle, SyncConfig, VirtualTreadmill,
};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🧪 LifeSpan Sync against a simulated console");

    let treadmill =
        VirtualTreadmill::new().with_workout(4210, Decimal::from_parts(1, 92), 187, 2_460);
    let (transport, events) = SimulatedTransport::new(treadmill);
    let console = transport.clone();

    let config = SyncConfig {
        cooldown_ms: 500,
        ..SyncConfig::default()
    };

    let (broadcaster, mut subscriber) = ChannelBroadcaster::new();
    let (sink, _worker) = RelaySink::spawn(broadcaster, config.relay_chunk_size);

    let supervisor = Supervisor::new(transport, sink, config)?;
    let (handle, control) = SupervisorHandle::new();
    handle.set_listening(true)?;
    let running = tokio::spawn(supervisor.run(events, control));

    let mut assembler = RecordAssembler::new();
    while let Some(chunk) = subscriber.recv().await {
        if let Some(records) = assembler.push(&chunk)? {
            for record in records {
                info!("✅ Received: {}", record);
            }
            break;
        }
    }

    // Let a second, empty session run through the cooldown
    tokio::time::sleep(Duration::from_secs(1)).await;
    let treadmill = console.treadmill().await;
    info!(
        "Console was reset {} time(s), {} steps remaining",
        treadmill.resets(),
        treadmill.steps()
    );

    handle.shutdown()?;
    let _ = running.await;
    Ok(())
}
