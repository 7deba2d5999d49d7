//! Resets a readout card channel.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use cru_dma::{BufferParameters, ChannelFactory, Parameters, ResetLevel};
use cru_utils::CommonOptions;

#[derive(Parser)]
#[command(name = "roc-reset", about = "Resets a readout card channel")]
#[command(after_help = "Example: roc-reset --id=12345 --channel=0 --reset=INTERNAL")]
struct Cli {
    #[command(flatten)]
    common: CommonOptions,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cru_utils::execute(cli.common.verbose, || run(&cli))
}

fn run(cli: &Cli) -> Result<()> {
    let level = match cli.common.reset_level()? {
        Some(level) => level,
        None => ResetLevel::Internal,
    };

    let parameters = Parameters::new(cli.common.card_id()?, cli.common.channel)
        .with_buffer_parameters(BufferParameters::Null);
    let mut channel =
        ChannelFactory::dma_channel(&parameters).context("could not open channel")?;
    channel.reset_channel(level)?;
    info!("reset ({}) done", level);
    Ok(())
}
