// Copyright (C) 2024 Agrolink
// All rights reserved.
//
// This software may be modified and distributed under the terms
// of the included license.  See the LICENSE file for details.

use std::{sync::Arc, time::Duration};

use clap::Parser;

use agrolink::{
    iface::LinkMonitor,
    isobus::ANY_ADDRESS,
    journal::Journal,
    net::Network,
    ring::RingLog,
};

mod config;
mod server;
mod wire;

#[derive(Parser)]
#[command(author = "Copyright (C) 2024 Agrolink")]
#[command(version, propagate_version = true)]
#[command(about = "ISOBUS gateway daemon", long_about = None)]
struct Args {
    /// CAN network interface(s).
    #[arg(required = true)]
    interface: Vec<String>,
    /// Bind address.
    #[arg(short = 'b', long = "bind", default_value = "0.0.0.0:30200")]
    address: String,
    /// Ring buffer file.
    #[arg(short = 'f', long = "file", default_value = "agrolink.ring", value_name = "FILE")]
    ring_file: std::path::PathBuf,
    /// Ring buffer size as a power of two.
    #[arg(long, default_value_t = 15, value_name = "ORDER")]
    ring_order: u32,
    /// Message journal directory.
    #[arg(long, default_value = "agrolink.journal", value_name = "DIR")]
    journal: std::path::PathBuf,
    /// Configuration file.
    #[arg(
        short = 'c',
        long = "config",
        alias = "conf",
        value_name = "FILE"
    )]
    config: Option<std::path::PathBuf>,
    /// Quiet output (no logging).
    #[arg(long)]
    quiet: bool,
    /// Daemonize the service.
    #[arg(short = 'D', long)]
    daemon: bool,
    /// Level of verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use log::LevelFilter;

    let args = Args::parse();

    let mut log_config = simplelog::ConfigBuilder::new();
    if args.daemon {
        log_config.set_time_level(LevelFilter::Off);
        log_config.set_thread_level(LevelFilter::Off);
    }

    log_config.set_target_level(LevelFilter::Off);
    log_config.set_location_level(LevelFilter::Off);
    log_config.add_filter_ignore_str("sled");
    log_config.add_filter_ignore_str("mio");

    let log_level = if args.daemon {
        LevelFilter::Info
    } else if args.quiet {
        LevelFilter::Off
    } else {
        match args.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    let color_choice = if args.daemon {
        simplelog::ColorChoice::Never
    } else {
        simplelog::ColorChoice::Auto
    };

    simplelog::TermLogger::init(
        log_level,
        log_config.build(),
        simplelog::TerminalMode::Mixed,
        color_choice,
    )?;

    if args.daemon {
        log::debug!("Running service as daemon");
    }

    let config = match &args.config {
        Some(path) => config::from_file(path)?,
        None => config::GatewayConfig::default(),
    };
    let name = config.name.to_name();

    let monitor = LinkMonitor::new();
    tokio::spawn(monitor.clone().watch(Duration::from_secs(2)));

    let (sender, inbound) = tokio::sync::mpsc::channel(256);
    let mut handles = Vec::new();

    for (index, interface) in args.interface.iter().enumerate() {
        let network = Arc::new(Network::bind(interface, &monitor)?);
        {
            let network = network.clone();
            let interface = interface.clone();
            tokio::spawn(async move {
                if let Err(e) = network.run().await {
                    log::error!("{}: {}", interface, e);
                }
            });
        }

        let mut endpoint = network.open(name);
        let address = endpoint.bind(ANY_ADDRESS).await?;
        log::info!("{}: claimed address 0x{:X}", interface, address);

        handles.push(endpoint.handle());
        tokio::spawn(server::pump(index, endpoint, sender.clone()));
    }

    let ring = RingLog::open(&args.ring_file, args.ring_order)?;
    let journal = Journal::open(&args.journal)?;

    let listener = tokio::net::TcpListener::bind(&args.address).await?;
    log::info!("Listening on {}", args.address);

    server::Server::new(listener, inbound, handles, ring, journal)
        .run()
        .await?;

    Ok(())
}
