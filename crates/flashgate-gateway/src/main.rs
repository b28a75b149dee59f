//! Flashgate gateway binary.
//!
//! # Usage
//!
//! ```bash
//! # Serve the default data layout on the default port
//! flashgate-gateway
//!
//! # Point at real programmer data
//! flashgate-gateway --bind 0.0.0.0:7690 \
//!     --boards-dir /usr/share/openocd/scripts/target \
//!     --firmware-dir /var/lib/flashgate/firmware
//! ```

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use flashgate_core::listener::TcpGateListener;
use flashgate_gateway::{Gateway, GatewayConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Flash-programmer gateway
#[derive(Parser, Debug)]
#[command(name = "flashgate-gateway")]
#[command(about = "Embedded gateway for the flashgate programmer protocol")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:7690")]
    bind: SocketAddr,

    /// Directory of board configuration files (*.cfg)
    #[arg(long, default_value = "data/boards")]
    boards_dir: PathBuf,

    /// Directory of firmware images (also the upload target)
    #[arg(long, default_value = "data/firmware")]
    firmware_dir: PathBuf,

    /// Path of the favourites document
    #[arg(long, default_value = "data/favourites.json")]
    favourites: PathBuf,

    /// External programmer command
    #[arg(long, default_value = "openocd")]
    flash_program: String,

    /// External debugger command
    #[arg(long, default_value = "gdb-multiarch")]
    debugger_program: String,

    /// Programmer interface configuration for debug sessions
    #[arg(long, default_value = "interface/raspberrypi-swd.cfg")]
    openocd_interface: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("flashgate gateway starting");

    let config = GatewayConfig {
        bind: args.bind,
        boards_dir: args.boards_dir,
        firmware_dir: args.firmware_dir,
        favourites_path: args.favourites,
        flash_program: args.flash_program,
        debugger_program: args.debugger_program,
        openocd_interface: args.openocd_interface,
    };

    let gateway = Gateway::open(&config)?;
    let listener = TcpGateListener::bind(config.bind).await?;

    tracing::info!("listening on {}", listener.local_addr()?);

    gateway.run(listener).await?;

    Ok(())
}
