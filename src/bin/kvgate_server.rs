//!
//! kvgate server binary
//! --------------------
//! Command-line entry point for the kvgate HTTP server. Configuration comes from
//! CLI flags and `KVGATE_*` environment variables; see `--help`.

use anyhow::Result;
use std::env;

use kvgate::config::{has_flag, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    println!(r"   __                     __
  / /____   ______ _____ _/ /____
 / //_/ | / / __ `/ __ `/ __/ _ \
/ ,<  | |/ / /_/ / /_/ / /_/  __/
/_/|_| |___/\__, /\__,_/\__/\___/
           /____/                 ");

    // Initialize tracing subscriber with env filter if provided
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("{}", ServerConfig::usage());
        return Ok(());
    }

    let config = ServerConfig::from_args_and_env(&args);
    println!(
        "kvgate starting on {} (data_dir={})",
        config.addr(),
        config.data_dir.display()
    );
    if config.clear_all_key.is_none() {
        tracing::warn!("KVGATE_CLEAR_ALL_KEY not set; /clearAll is disabled");
    }

    kvgate::server::run(config).await
}
