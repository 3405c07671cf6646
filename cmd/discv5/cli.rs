use std::net::IpAddr;

use clap::Parser as ClapParser;
use ethrex_discv5::NodeRecord;
use tracing::Level;

pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_DATADIR: &str = ".discv5";

#[derive(ClapParser, Debug)]
#[command(name = "discv5", author, version = VERSION_STRING, about = "Standalone discv5 discovery node", long_about = None)]
pub struct Options {
    #[arg(long = "log.level", default_value_t = Level::INFO, value_name = "LOG_LEVEL")]
    pub log_level: Level,
    #[arg(
        long = "discovery.addr",
        default_value = "0.0.0.0",
        value_name = "ADDRESS",
        help_heading = "Discovery options"
    )]
    pub discovery_addr: IpAddr,
    #[arg(
        long = "discovery.port",
        default_value_t = 30303,
        value_name = "PORT",
        env = "DISCV5_PORT",
        help_heading = "Discovery options"
    )]
    pub discovery_port: u16,
    #[arg(
        long = "discovery.external-addr",
        value_name = "ADDRESS",
        help = "IP advertised in the local record",
        help_heading = "Discovery options"
    )]
    pub external_addr: Option<IpAddr>,
    #[arg(long = "bootnodes", value_name = "BOOTNODE_LIST", value_delimiter = ',', num_args = 1..)]
    pub bootnodes: Vec<NodeRecord>,
    #[arg(
        long = "datadir",
        value_name = "DATA_DIRECTORY",
        help = "Directory holding the node key",
        default_value = DEFAULT_DATADIR,
    )]
    pub datadir: String,
}
