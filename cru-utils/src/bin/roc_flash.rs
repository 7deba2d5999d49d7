//! Programs a readout card's flash memory.
//!
//! Flashing is a legacy C-RORC operation; on a CRU this utility only
//! reports that, it never touches the card.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::Parser;

use cru_dma::pci::CardType;
use cru_dma::ChannelFactory;
use cru_utils::CommonOptions;

#[derive(Parser)]
#[command(name = "roc-flash", about = "Programs the card's flash memory")]
#[command(after_help = "Example: roc-flash --id=12345 --file=/dir/my_file")]
struct Cli {
    #[command(flatten)]
    common: CommonOptions,

    /// Path of the file to flash
    #[arg(long = "file")]
    file: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cru_utils::execute(cli.common.verbose, || run(&cli))
}

fn run(cli: &Cli) -> Result<()> {
    let device = ChannelFactory::find_card(&cli.common.card_id()?)?;
    match device.descriptor.card_type {
        CardType::Crorc => {
            // The C-RORC flashing path lives with the legacy tooling.
            bail!(
                "flashing {} requires the legacy C-RORC tools",
                cli.file.display()
            )
        }
        card_type => bail!("flashing is not supported on the {}", card_type),
    }
}
