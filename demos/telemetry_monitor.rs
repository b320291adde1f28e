use std::{sync::Arc, time::Duration};
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use ergolink::{
    ble::BtleTransport, serial::SerialTransport, ConnectionState, DeviceFamily, DeviceIdentity,
    DeviceSession, Result, SessionSignal, Settings, Transport, WatchBridgeFactory,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging, RUST_LOG=ergolink=debug for wire traces
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("📊 Ergolink Telemetry Monitor Example");

    // Usage: telemetry_monitor [settings.json] [/dev/rfcommN]
    let mut args = std::env::args().skip(1);
    let settings = match args.next() {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let settings = Arc::new(settings);

    let (identity, transport): (DeviceIdentity, Box<dyn Transport>) = match args.next() {
        Some(node) => {
            info!("Using serial treadmill on {}", node);
            let identity = DeviceIdentity::new("TRX ROUTE KEY", node, DeviceFamily::ToorxTreadmill);
            let transport: Box<dyn Transport> = Box::new(SerialTransport::rfcomm(settings.timeouts.clone()));
            (identity, transport)
        }
        None => {
            info!("Searching for Bluetooth fitness devices...");
            let transport = BtleTransport::new(settings.timeouts.clone()).await?;
            let Some(identity) = transport.scan().await?.into_iter().next() else {
                error!("❌ No supported device found");
                return Ok(());
            };
            let transport: Box<dyn Transport> = Box::new(transport);
            (identity, transport)
        }
    };

    info!("✅ Using: {}", identity);
    let bridge = WatchBridgeFactory::new();
    let session = DeviceSession::new(identity, transport, settings)
        .with_bridge_factory(Box::new(bridge.clone()));
    let handle = session.handle();
    let mut signals = handle.subscribe_signals();
    let task = tokio::spawn(session.run());

    info!("🔍 Starting telemetry monitoring...");
    info!("Press Ctrl+C to stop monitoring");

    let mut monitor_interval = interval(Duration::from_secs(2));
    let start_time = Instant::now();
    let mut max_speed: f64 = 0.0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            signal = signals.recv() => match signal {
                Ok(SessionSignal::Ready) => info!("🚀 Device ready"),
                Ok(SessionSignal::Disconnected) => warn!("❌ Link dropped, reconnecting"),
                Ok(SessionSignal::ResistanceApplied(level)) => info!("Resistance {}", level),
                Ok(_) => {}
                Err(e) => warn!("Signal stream: {}", e),
            },
            _ = monitor_interval.tick() => {
                if handle.state() != ConnectionState::Ready {
                    continue;
                }

                let snapshot = handle.snapshot();
                max_speed = max_speed.max(snapshot.speed);

                let elapsed = start_time.elapsed();
                let minutes = elapsed.as_secs() / 60;
                let seconds = elapsed.as_secs() % 60;

                println!("\n📊 Telemetry ({minutes:02}:{seconds:02})");
                println!("┌─────────────────────────────────────────┐");
                println!("│ Speed:       {:8.2} km/h               │", snapshot.speed);
                println!("│ Distance:    {:8.3} km                 │", snapshot.distance);
                println!("│ Cadence:     {:8.0} rpm                │", snapshot.cadence);
                println!("│ Power:       {:8.0} W                  │", snapshot.power);
                println!("│ Heart rate:  {:8.0} bpm                │", snapshot.heart_rate);
                println!("│ Calories:    {:8.0} kcal               │", snapshot.calories);
                println!("│ Resistance:  {:8.0}                    │", snapshot.resistance);
                println!("│ Inclination: {:8.1} %                  │", snapshot.inclination);
                println!("└─────────────────────────────────────────┘");

                if bridge.created() > 0 {
                    println!("🔁 Mirrored to virtual peripheral");
                }
            }
        }
    }

    info!("🔌 Disconnecting...");
    handle.shutdown();
    match task.await {
        Ok(Ok(())) => info!("✅ Disconnected successfully"),
        Ok(Err(e)) => error!("❌ Session ended with error: {}", e),
        Err(e) => error!("❌ Session task failed: {}", e),
    }

    println!("\n📊 Final Session Summary:");
    println!(
        "  Duration: {:02}:{:02}",
        start_time.elapsed().as_secs() / 60,
        start_time.elapsed().as_secs() % 60
    );
    println!("  Max Speed: {max_speed:.1} km/h");
    println!("  Total Distance: {:.3} km", handle.snapshot().distance);

    info!("🎉 Telemetry monitoring completed!");
    Ok(())
}
