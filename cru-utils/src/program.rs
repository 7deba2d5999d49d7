//! Shared scaffolding for the utilities.
//!
//! Every utility takes the same card-addressing options, installs the same
//! logger, and maps any driver error to a non-zero exit code. A SIGINT sets
//! a process-wide flag that long-running operations poll; the channel engine
//! itself never looks at it.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use clap::Args;
use log::error;

use cru_dma::pci::PciAddress;
use cru_dma::{CardId, CruDmaChannel, ResetLevel};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT into the interrupt flag.
pub fn install_interrupt_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
    }
}

/// Whether the user asked the utility to stop.
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Options every utility accepts.
#[derive(Args, Debug)]
pub struct CommonOptions {
    /// Card id: serial number, PCI address (e.g. 0000:3b:00.0), or
    /// sequence number (e.g. '#0')
    #[arg(long = "id")]
    pub id: String,

    /// DMA channel number
    #[arg(long = "channel", default_value_t = 0)]
    pub channel: u32,

    /// Reset the channel first: NOTHING or INTERNAL
    #[arg(long = "reset")]
    pub reset: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl CommonOptions {
    pub fn card_id(&self) -> Result<CardId> {
        parse_card_id(&self.id)
    }

    /// The reset level the user asked for, if any.
    pub fn reset_level(&self) -> Result<Option<ResetLevel>> {
        self.reset
            .as_deref()
            .map(|spelled| {
                ResetLevel::from_str_upper(spelled)
                    .with_context(|| format!("unknown reset level '{}'", spelled))
            })
            .transpose()
    }

    /// Run the requested reset, if any, against a freshly built channel.
    pub fn apply_reset(&self, channel: &mut CruDmaChannel) -> Result<()> {
        if let Some(level) = self.reset_level()? {
            channel.reset_channel(level)?;
        }
        Ok(())
    }
}

/// Parse the three card id spellings.
pub fn parse_card_id(s: &str) -> Result<CardId> {
    if let Some(sequence) = s.strip_prefix('#') {
        let n = sequence
            .parse()
            .with_context(|| format!("bad sequence number '{}'", s))?;
        return Ok(CardId::SequenceNumber(n));
    }
    if let Some(address) = PciAddress::parse(s) {
        return Ok(CardId::Address(address));
    }
    match s.parse() {
        Ok(serial) => Ok(CardId::Serial(serial)),
        Err(_) => bail!("card id '{}' is not a serial, PCI address, or #sequence", s),
    }
}

/// Standard utility wrapper: logger, interrupt flag, error-to-exit-code.
pub fn execute(verbose: bool, run: impl FnOnce() -> Result<()>) -> ExitCode {
    crate::logging::init(verbose);
    install_interrupt_handler();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
