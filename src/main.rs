mod command;
mod dhcp;
mod domain_watcher;
mod filter;
mod group;
mod group_macs;
mod models;
mod monitor;
mod net_watcher;
mod nft;
mod storage;
mod system;
mod usage;
mod utils;

use clap::Parser;
use command::{run, Opt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    run(opt).await?;
    Ok(())
}
