use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use client_core::{DispatchMonitor, HttpApi, MonitorEvent};
use shared::domain::Trip;
use tracing::warn;

mod config;

use config::load_settings;

/// Terminal monitor for active dispatch trips.
#[derive(Parser, Debug)]
struct Args {
    /// Dispatch server base URL (overrides monitor.toml / env).
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    usuario: Option<String>,
    #[arg(long)]
    clave: Option<String>,
    /// Seconds between full snapshot refreshes (drift correction).
    #[arg(long)]
    refresh_secs: Option<u64>,
}

fn print_trips(trips: &[Trip]) {
    println!("{:<8} {:<10} {:<20} {:<10} {:>9}", "viaje", "vehiculo", "conductor", "estado", "progreso");
    for trip in trips {
        println!(
            "{:<8} {:<10} {:<20} {:<10} {:>7}% ({}/{} entregadas, {} no, {} pendientes)",
            trip.trip_id,
            trip.vehicle_number,
            trip.driver_name,
            format!("{:?}", trip.status),
            trip.progress_percent,
            trip.delivered_guides,
            trip.total_guides,
            trip.undelivered_guides,
            trip.pending_guides,
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(v) = args.server_url {
        settings.server_url = v;
    }
    if let Some(v) = args.usuario {
        settings.usuario = Some(v);
    }
    if let Some(v) = args.clave {
        settings.clave = Some(v);
    }
    if let Some(v) = args.refresh_secs {
        settings.refresh_secs = v;
    }

    let api = Arc::new(HttpApi::new(settings.server_url.clone()));
    if let (Some(usuario), Some(clave)) = (&settings.usuario, &settings.clave) {
        api.login(usuario, clave).await?;
    }
    let ws_url = api.websocket_url().await?;

    let monitor = DispatchMonitor::new(api);
    let trips = monitor.refresh().await?;
    println!("Watching {trips} active trips on {}", settings.server_url);
    print_trips(&monitor.snapshot().await);

    monitor.connect_events(&ws_url).await?;

    let mut events = monitor.subscribe_events();
    let mut refresh = tokio::time::interval(Duration::from_secs(settings.refresh_secs.max(1)));
    refresh.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = refresh.tick() => {
                if let Err(err) = monitor.refresh().await {
                    warn!(%err, "snapshot refresh failed, keeping current state");
                }
            }
            event = events.recv() => match event {
                Ok(MonitorEvent::Updated(_)) | Ok(MonitorEvent::SnapshotLoaded { .. }) => {
                    print_trips(&monitor.snapshot().await);
                }
                Ok(MonitorEvent::Ignored(_)) => {}
                Ok(MonitorEvent::Error(message)) => warn!(%message, "monitor error"),
                Ok(MonitorEvent::Disconnected) => {
                    warn!("push channel closed, falling back to periodic refresh");
                }
                Err(_) => break,
            },
        }
    }

    monitor.shutdown().await;
    Ok(())
}
