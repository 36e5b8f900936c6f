use std::process;
use std::sync::Arc;

// 3rd-party libs
use clap::Parser;

use synthd_core::*;

mod cliargs;
mod config;
mod consts;
mod defaults;
mod logging;
mod runner;
mod sim;

pub use cliargs::*;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Arc::new(CliArgs::parse());
    if let Err(ref err) = runner::run_app(args).await {
        log::error!("Application error: {err}");
        process::exit(-1);
    }
    Ok(())
}
