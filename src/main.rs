//! LinkedLamp Provisioner - Main Entry Point

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use linkedlamp_provisioner::{
    DeviceId, DiscoveredDevice, ProvisionOutcome, ProvisioningClient,
    backend::BluerBackend,
    config::{Action, CliArgs, ProvisionSettings, Settings},
    core::cancel::Deadline,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pause between two empty scan windows
const RESCAN_PAUSE: Duration = Duration::from_secs(1);

type Client = ProvisioningClient<BluerBackend>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,linkedlamp_provisioner=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from(CliArgs::parse());
    info!(?settings, "Starting LinkedLamp provisioner");

    let backend = Arc::new(BluerBackend::new(settings.adapter.as_deref()).await?);
    let client = ProvisioningClient::new(backend);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match shutdown_signal().await {
                Ok(()) => {
                    info!("Received shutdown signal, cancelling");
                    cancel.cancel();
                }
                Err(e) => warn!("Failed to listen for shutdown signals: {}", e),
            }
        }
    });

    let result = match &settings.action {
        Action::Scan {
            window,
            first,
            json,
        } => run_scan(&client, &settings.name_prefix, *window, *first, *json, &cancel).await,
        Action::Provision(provision) => {
            run_provision(&client, &settings.name_prefix, provision, &cancel).await
        }
    };

    client.cancel_and_reset().await;
    result
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

async fn run_scan(
    client: &Client,
    prefix: &str,
    window: Duration,
    first: bool,
    json: bool,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = Deadline::new(cancel, window);
    let devices: Vec<DiscoveredDevice> = if first {
        client
            .scan_first(Some(prefix), deadline.token())
            .await?
            .into_iter()
            .collect()
    } else {
        client.scan(Some(prefix), deadline.token()).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("No lamps found");
    } else {
        for device in &devices {
            println!("{}", device);
        }
    }
    Ok(())
}

/// Repeat short scans until a lamp shows up; `None` once cancelled
async fn find_lamp(
    client: &Client,
    prefix: &str,
    settings: &ProvisionSettings,
    cancel: &CancellationToken,
) -> Result<Option<DiscoveredDevice>, Box<dyn std::error::Error>> {
    let attempts = settings.max_scan_attempts;
    for attempt in 1..=attempts {
        let deadline = Deadline::new(cancel, settings.scan_window);
        if let Some(device) = client.scan_first(Some(prefix), deadline.token()).await? {
            info!("Found {}", device);
            return Ok(Some(device));
        }
        if cancel.is_cancelled() {
            return Ok(None);
        }

        info!("No lamp found (attempt {}/{})", attempt, attempts);
        if attempt < attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(RESCAN_PAUSE) => {}
            }
        }
    }

    Err(format!("No lamp advertising {:?} found after {} scans", prefix, attempts).into())
}

async fn run_provision(
    client: &Client,
    prefix: &str,
    settings: &ProvisionSettings,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = settings.context()?;

    let device = match &settings.device {
        Some(address) => DeviceId::new(address.as_str()),
        None => match find_lamp(client, prefix, settings, cancel).await? {
            Some(device) => device.id,
            None => {
                println!("Cancelled");
                return Ok(());
            }
        },
    };

    let deadline = Deadline::new(cancel, settings.timeout);
    match client.provision(&device, &ctx, deadline.token()).await {
        Ok(ProvisionOutcome::Provisioned) => {
            println!("{} joined group {:?} on {:?}", device, ctx.group_name(), ctx.ssid());
            Ok(())
        }
        Ok(ProvisionOutcome::Cancelled) if cancel.is_cancelled() => {
            println!("Cancelled");
            Ok(())
        }
        Ok(ProvisionOutcome::Cancelled) => Err(format!(
            "{} did not answer within {}s",
            device,
            settings.timeout.as_secs()
        )
        .into()),
        Err(e) => {
            if e.is_credentials_problem() {
                error!("{}; check the WiFi name and password", e);
            } else {
                error!("{}; move closer to the lamp and retry", e);
            }
            Err(e.into())
        }
    }
}
