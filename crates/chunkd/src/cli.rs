use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "chunkd", version, about = "chunkd chunkserver")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long, env = "CHUNKD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the master host from the config file.
    #[arg(long, env = "CHUNKD_MASTER_HOST")]
    pub master_host: Option<String>,

    /// Override the client listen port from the config file.
    #[arg(long, env = "CHUNKD_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    /// Directory holding the persisted chunkserver identity.
    #[arg(long, env = "CHUNKD_DATA_PATH")]
    pub data_path: Option<PathBuf>,
}
