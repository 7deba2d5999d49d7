//! Configures a readout card's data source.

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use cru_dma::bar::{registers, CtrlBar};
use cru_dma::{ChannelFactory, DataSource};
use cru_utils::CommonOptions;

#[derive(Parser)]
#[command(name = "roc-config", about = "Configures a readout card")]
#[command(after_help = "Example: roc-config --id=#0 --source=INTERNAL")]
struct Cli {
    #[command(flatten)]
    common: CommonOptions,

    /// Data source: INTERNAL, FEE, or DDG
    #[arg(long = "source")]
    source: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cru_utils::execute(cli.common.verbose, || run(&cli))
}

fn run(cli: &Cli) -> Result<()> {
    let source = DataSource::from_str_upper(&cli.source)
        .with_context(|| format!("unknown data source '{}'", cli.source))?;
    let selection = match source {
        DataSource::Internal => registers::DATA_SOURCE_SELECT_INTERNAL,
        DataSource::Fee | DataSource::Ddg => registers::DATA_SOURCE_SELECT_GBT,
        DataSource::Diu | DataSource::Siu => {
            bail!("the CRU does not support data source {}", source)
        }
    };

    let card_id = cli.common.card_id()?;
    let device = ChannelFactory::find_card(&card_id)?;
    let ctrl = cru_dma::bar::CruBar::new(device.map_bar(0)?);

    if !ctrl.firmware_features().data_selection {
        bail!("firmware does not support data source selection");
    }
    ctrl.set_data_source(selection);
    info!("data source set to {}", source);
    Ok(())
}
