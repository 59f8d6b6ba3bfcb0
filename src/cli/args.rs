use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Settings file, every setting has a default
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Route table to load at startup
    #[arg(short, long)]
    pub routes: Option<PathBuf>,

    #[arg(long)]
    pub xds_port: Option<u16>,

    /// Node identity proxies connect with
    #[arg(long)]
    pub node_id: Option<String>,

    /// Write the route table back to the routes file on shutdown
    #[arg(long)]
    pub save_on_exit: bool,
}
