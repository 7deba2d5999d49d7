//! Prints a readout card's identity, links, and telemetry.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use cru_dma::bar::ConfigBar;
use cru_dma::{BufferParameters, ChannelFactory, Parameters};
use cru_utils::CommonOptions;

#[derive(Parser)]
#[command(name = "roc-status", about = "Prints readout card status")]
#[command(after_help = "Example: roc-status --id=0000:3b:00.0")]
struct Cli {
    #[command(flatten)]
    common: CommonOptions,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cru_utils::execute(cli.common.verbose, || run(&cli))
}

fn run(cli: &Cli) -> Result<()> {
    let card_id = cli.common.card_id()?;
    let device = ChannelFactory::find_card(&card_id)?;
    let descriptor = &device.descriptor;

    let parameters = Parameters::new(card_id, cli.common.channel)
        .with_buffer_parameters(BufferParameters::Null);
    let mut channel =
        ChannelFactory::dma_channel(&parameters).context("could not open channel")?;
    cli.common.apply_reset(&mut channel)?;

    println!("Card type:       {}", descriptor.card_type);
    println!("PCI address:     {}", descriptor.pci_address);
    println!("Sequence number: #{}", descriptor.sequence_number);

    let absent = || "n/a".to_string();
    println!(
        "Serial:          {}",
        channel.serial().map(|s| s.to_string()).unwrap_or_else(absent)
    );
    println!(
        "Temperature:     {}",
        channel
            .temperature()
            .map(|t| format!("{:.1} C", t))
            .unwrap_or_else(absent)
    );
    println!(
        "Firmware:        {}",
        channel.firmware_info().unwrap_or_else(absent)
    );
    println!(
        "Card id:         {}",
        channel.card_id().unwrap_or_else(absent)
    );

    let config = ChannelFactory::config_bar(&card_id)?;
    let links = config.data_taking_links();
    println!(
        "Links:           {}",
        links
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    );
    println!("Dropped packets: {}", channel.dropped_packets());
    println!("First orbit:     {:#x}", channel.counter_first_orbit());

    Ok(())
}
