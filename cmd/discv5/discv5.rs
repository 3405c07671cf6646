mod cli;
mod initializers;

use std::path::Path;

use clap::Parser;
use ethrex_discv5::Discv5Server;
use tracing::info;

use crate::{
    cli::Options,
    initializers::{get_config, get_signer, init_tracing},
};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let opts = Options::parse();
    init_tracing(&opts);

    let signer = get_signer(Path::new(&opts.datadir))?;
    let handle = Discv5Server::spawn(get_config(&opts), signer).await?;
    info!(enr = %handle.local_record().enr_url(), addr = ?handle.local_addr()?, "Discovery node running");

    tokio::signal::ctrl_c().await?;
    info!(nodes = handle.routing_table().len(), "Received Ctrl+C, stopping");
    handle.shutdown().await;
    Ok(())
}
