//! dmxd
//!
//! DMX daemon hosting the USB DMX and Art-Net plugins on a tokio reactor.

mod config;
mod reactor;

use anyhow::{Context, Result};
use clap::Parser;
use common::{PluginAdaptor, PluginHandle, PluginRegistration, destroy, setup_logging};
use config::DaemonConfig;
use reactor::Reactor;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::signal;
use tracing::{error, info, warn};
use usbdmx::UsbSubsystem;

#[derive(Parser, Debug)]
#[command(name = "dmxd")]
#[command(author, version, about = "DMX daemon for USB DMX widgets and Art-Net")]
#[command(long_about = "
Drives USB DMX widgets (Anyma uDMX, Eurolite USB-DMX512 PRO, Fadecandy,
Sunlite USBDMX2, Velleman K8062) and an Art-Net node with four input and four
output ports.

EXAMPLES:
    # Run with default config
    dmxd

    # Run with custom config
    dmxd --config /path/to/dmxd.toml

    # Show which USB devices are supported widgets
    dmxd --list-devices

    # Run with debug logging
    dmxd --log-level debug

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/dmxd/dmxd.toml
    3. /etc/dmxd/dmxd.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and the widget model each one matches, then exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = DaemonConfig::default_path();
        DaemonConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(ref path) => {
            DaemonConfig::load(Some(path.clone())).context("Failed to load configuration")?
        }
        None => DaemonConfig::load_or_default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.daemon.log_level);
    config::validate_log_level(log_level)?;
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("dmxd v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        return list_devices(&config);
    }

    run(config).await
}

/// Print every USB device and the widget model it matches
fn list_devices(config: &DaemonConfig) -> Result<()> {
    let subsystem = usbdmx::LibUsbSubsystem::new(config.usbdmx.libusb_debug_level);
    let context = subsystem
        .open_context()
        .context("Failed to open USB context")?;
    let listings = usbdmx::survey(context.as_ref()).context("Failed to enumerate USB devices")?;

    if listings.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", listings.len());
    for listing in listings {
        let model = match listing.kind {
            Some(kind) if config.usbdmx.models.contains(&kind) => kind.display_name().to_string(),
            Some(kind) => format!("{} (disabled in config)", kind.display_name()),
            None => "not a supported widget".to_string(),
        };
        println!(
            "  Bus {} {:04x}:{:04x} - {}",
            listing.slot, listing.descriptor.vendor_id, listing.descriptor.product_id, model
        );
    }
    Ok(())
}

fn plugin_table(config: &DaemonConfig) -> Vec<PluginRegistration> {
    let mut table = Vec::new();
    if config.usbdmx.enabled {
        table.push(usbdmx::registration(config.usbdmx.clone()));
    }
    if config.artnet.enabled {
        table.push(artnet::registration(config.artnet.clone()));
    }
    table
}

async fn run(config: DaemonConfig) -> Result<()> {
    let reactor = Arc::new(Reactor::new(Handle::current()));
    let adaptor: Arc<dyn PluginAdaptor> = reactor.clone();

    let mut plugins: Vec<PluginHandle> = Vec::new();
    for registration in plugin_table(&config) {
        let mut plugin = registration.create(adaptor.clone());
        match plugin.start() {
            Ok(()) => info!("Started plugin {}", plugin.name()),
            Err(e) => error!("Failed to start plugin {}: {}", plugin.name(), e),
        }
        plugins.push(plugin);
    }

    if !plugins.iter().any(|p| p.is_enabled()) {
        warn!("No plugin is running");
    }
    for id in reactor.device_ids() {
        if let Some(device) = reactor.device(&id) {
            info!("Device {}: {} ({} ports)", id, device.name(), device.ports().len());
        }
    }
    info!("Press Ctrl+C to shutdown");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    // Plugin teardown joins worker threads and waits on USB events
    tokio::task::block_in_place(|| {
        while let Some(plugin) = plugins.pop() {
            destroy(plugin);
        }
    });

    if reactor.fd_count() > 0 || reactor.timer_count() > 0 {
        warn!(
            "{} descriptor(s) and {} timer(s) left registered after shutdown",
            reactor.fd_count(),
            reactor.timer_count()
        );
    }
    info!("Shutdown complete");
    Ok(())
}
