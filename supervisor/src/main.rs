#[macro_use]
extern crate log;

use std::path::PathBuf;

use clap::Parser;
use mcp_core::shmem::DEFAULT_SHM_NAME;
use mcp_supervisor::supervisor::run_supervisor;

/// Mission-control supervisor daemon
#[derive(Parser)]
#[command(name = "mcpd", version, about)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long, default_value = "/etc/mcp/mcp.conf")]
    config: PathBuf,

    /// Name of the shared publication region
    #[arg(long, default_value = DEFAULT_SHM_NAME)]
    shm_name: String,
}

/// Helper to print top-level errors through [log::error]
#[quit::main]
fn main() {
    let args = Args::parse();

    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    std::env::set_var("RUST_LOG", level.clone());

    pretty_env_logger::formatted_builder()
        .parse_filters(&level)
        .format_timestamp_secs()
        .init();

    match run_supervisor(&args.config, &args.shm_name) {
        Ok(_) => {}
        Err(e) => {
            error!("{e}");
            quit::with_code(1);
        }
    }
}
