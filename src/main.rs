use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;

use crate::config::Config;
use crate::crawler::Crawler;
use crate::geoip::DisabledGeoLookup;
use crate::store::MemoryNodeStore;

mod config;
mod crawler;
mod geoip;
mod rpc;
mod store;
mod webapi;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the project configuration file
    #[arg(short, long, default_value = "project.config.yaml")]
    config: PathBuf,

    /// Run a single crawl pass and exit instead of looping forever
    #[arg(long)]
    once: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

fn init_logging(level: LevelFilter) {
    SimpleLogger::new()
        .with_colors(true)
        .with_level(level)
        .with_local_timestamps()
        .init()
        .unwrap();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level);

    let config = Config::load(&args.config)?;
    if config.dev_mode {
        log::warn!("development mode: private and loopback addresses will be crawled");
    }

    let store = Arc::new(MemoryNodeStore::default());
    let geo = Arc::new(DisabledGeoLookup);
    let crawler = Crawler::new(config, store, geo)?;

    if args.once {
        crawler.run_single_pass().await?;
    } else {
        crawler.run().await;
    }

    Ok(())
}
