use std::time::Duration;

use clap::Parser;

mod commands;
mod input;
mod pairing;
mod view;

use crate::commands::{BoxError, Cli};

fn main() -> Result<(), BoxError> {
    env_logger::init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("roster-runtime")
        .enable_all()
        .build()?;
    rt.block_on(cli.run())?;
    // Reading stdin parks a blocking thread; don't wait on it forever.
    rt.shutdown_timeout(Duration::from_millis(500));
    Ok(())
}
