//! RTL88xxAU driver host
//!
//! Attaches the first supported adapter, brings the interface up and logs
//! received frames until interrupted.

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use common::{create_bridge, setup_logging};
use driver::config::{DriverConfig, parse_device_id};
use driver::usb::RusbTransport;
use driver::usb::rusb_transport::find_supported_devices;
use driver::worker::{
    ChannelEndpoint, DriverBridge, DriverCommand, DriverEvent, spawn_driver_worker,
};
use driver::{DRIVER_NAME, DRIVER_VERSION, DeviceState, DeviceStateMachine, DeviceTable};
use rusb::UsbContext;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Capacity of the command and event channels
const BRIDGE_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "rtl88xxau")]
#[command(
    author,
    version,
    about = "User-space driver core for RTL8812AU/RTL8821AU/RTL8814AU USB Wi-Fi adapters"
)]
#[command(long_about = "
Attaches a supported Realtek USB Wi-Fi adapter, opens its bulk and interrupt
pipes and keeps receive transfers posted until interrupted with Ctrl-C.

EXAMPLES:
    # Attach the first supported adapter
    rtl88xxau

    # Pick a specific adapter
    rtl88xxau --device 0x0bda:0x8812

    # List supported adapters and exit
    rtl88xxau --list-devices

CONFIGURATION:
    Configuration is read from, in order:
    1. Path specified with --config
    2. ~/.config/rtl88xxau/driver.toml
    3. /etc/rtl88xxau/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List supported USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Attach this device (0xVVVV:0xPPPP)
    #[arg(short, long, value_name = "VID:PID")]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        DriverConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        DriverConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("{} driver v{}", DRIVER_NAME, DRIVER_VERSION);
    info!("Log level: {}", log_level);

    let mut settings = config.driver_settings()?;
    let selected = args.device.as_deref().map(parse_device_id).transpose()?;
    if let Some(pair) = selected {
        // An explicitly requested device is accepted even if not in the table.
        if !settings.devices.is_supported(pair.0, pair.1) {
            let mut extra = config
                .usb
                .extra_devices
                .iter()
                .map(|entry| parse_device_id(entry))
                .collect::<Result<Vec<_>>>()?;
            extra.push(pair);
            settings.devices = DeviceTable::with_extra(extra);
        }
    }

    let context = rusb::Context::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices(&context, &settings.devices);
    }

    let device = find_supported_devices(&context, &settings.devices)?
        .into_iter()
        .find(|device| match selected {
            None => true,
            Some((vid, pid)) => device
                .device_descriptor()
                .map(|d| d.vendor_id() == vid && d.product_id() == pid)
                .unwrap_or(false),
        })
        .ok_or_else(|| anyhow!("No supported adapter found"))?;

    let transport = Arc::new(RusbTransport::new(device)?);
    let (bus, address) = transport.location();
    info!("Using device at bus {} address {}", bus, address);

    let (bridge, worker) = create_bridge::<DriverCommand, DriverEvent>(BRIDGE_CAPACITY);
    let endpoint = ChannelEndpoint::new(&worker);
    let machine = DeviceStateMachine::probe(transport, settings, Box::new(endpoint))
        .context("Failed to attach device")?;
    if let (Some(chip), Some(identity)) = (machine.chip_type(), machine.identity()) {
        info!(
            "Attached {} ({:04x}:{:04x})",
            chip, identity.vendor_id, identity.product_id
        );
    }

    let worker_handle =
        spawn_driver_worker(machine, worker).context("Failed to spawn driver worker")?;

    let result = run(&bridge).await;

    info!("Shutting down driver...");
    if let Err(e) = shutdown(&bridge).await {
        warn!("Shutdown did not complete cleanly: {}", e);
    }
    tokio::task::spawn_blocking(move || worker_handle.join())
        .await
        .context("Failed to join driver worker")?
        .map_err(|_| anyhow!("Driver worker panicked"))?;

    result
}

/// Bring the interface up and log events until Ctrl-C or device loss
async fn run(bridge: &DriverBridge) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(DriverCommand::BringUp { response: tx })
        .await?;
    rx.await
        .context("Driver worker dropped the request")?
        .context("Failed to bring interface up")?;
    info!("Interface up, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                return Ok(());
            }
            event = bridge.recv_event() => {
                match event? {
                    DriverEvent::FrameReceived(frame) => {
                        debug!("Received frame ({} bytes)", frame.len());
                    }
                    DriverEvent::TransmitCompleted(token) => debug!("Transmit {} completed", token),
                    DriverEvent::TransmitFailed { token, status } => {
                        warn!("Transmit {} failed: {}", token, status);
                    }
                    DriverEvent::LinkDown => warn!("Link down"),
                    DriverEvent::StateChanged(DeviceState::Closed) => {
                        error!("Device closed");
                        bail!("Device is gone");
                    }
                    DriverEvent::StateChanged(state) => info!("Device state: {}", state),
                }
            }
        }
    }
}

async fn shutdown(bridge: &DriverBridge) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(DriverCommand::BringDown { response: tx })
        .await?;
    match rx.await? {
        Ok(report) => info!(
            "Interface down ({} completions drained, {} leaked)",
            report.completed, report.leaked
        ),
        Err(e) => debug!("Bring down skipped: {}", e),
    }

    bridge.send_command(DriverCommand::Shutdown).await?;
    Ok(())
}

fn list_devices(context: &rusb::Context, table: &DeviceTable) -> Result<()> {
    let devices = context.devices().context("Failed to enumerate USB devices")?;

    let mut found = 0;
    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        let (vid, pid) = (descriptor.vendor_id(), descriptor.product_id());
        let Some(chip) = table.chip_type(vid, pid) else {
            continue;
        };
        found += 1;
        println!(
            "Bus {:03} Device {:03}: ID {:04x}:{:04x} {} [{}]",
            device.bus_number(),
            device.address(),
            vid,
            pid,
            table.product_name(vid, pid).unwrap_or("unknown"),
            chip
        );
    }

    if found == 0 {
        println!("No supported devices found");
    }
    Ok(())
}
