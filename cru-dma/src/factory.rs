//! Channel construction against real hardware.
//!
//! The factory is the only place that touches sysfs: it resolves a card id
//! to a probed device, maps the BAR windows, builds the requested buffer
//! provider, gathers the host memory facts, and hands everything to
//! [`CruDmaChannel::new`] as plain capabilities.

use log::{debug, warn};

use crate::bar::{ConfigBar, CruBar};
use crate::buffer::{BufferProvider, FileBufferProvider, MemoryBufferProvider, NullBufferProvider};
use crate::channel::CruDmaChannel;
use crate::error::{Error, Result};
use crate::hostmem::HostMemoryInfo;
use crate::parameters::{BufferParameters, CardId, Parameters};
use crate::pci::{enumerate_cards, CardType, RocPciDevice};

pub struct ChannelFactory;

impl ChannelFactory {
    /// Build a DMA channel for the card and channel the parameters name.
    pub fn dma_channel(parameters: &Parameters) -> Result<CruDmaChannel> {
        let prefix = format!(
            "[{} channel={}]",
            parameters.card_id, parameters.channel_number
        );

        let device = Self::find_card(&parameters.card_id)?;
        if device.descriptor.card_type != CardType::Cru {
            return Err(Error::UnsupportedCard {
                channel: prefix,
                message: format!(
                    "DMA channels are only supported on the CRU, found {}",
                    device.descriptor.card_type
                ),
            });
        }

        let ctrl = CruBar::new(device.map_bar(0)?);
        let config = CruBar::new(device.map_bar(2)?);

        let buffer: Box<dyn BufferProvider> = match &parameters.buffer_parameters {
            None => {
                return Err(Error::Parameter {
                    channel: prefix,
                    message: "DMA channel requires buffer parameters".to_string(),
                });
            }
            Some(BufferParameters::Memory { address, size }) => {
                debug!("{} initializing with DMA buffer from memory region", prefix);
                Box::new(MemoryBufferProvider::identity_mapped(*address, *size))
            }
            Some(BufferParameters::File { path, size }) => {
                debug!(
                    "{} initializing with DMA buffer from memory-mapped file",
                    prefix
                );
                Box::new(FileBufferProvider::open(path, *size, &prefix)?)
            }
            Some(BufferParameters::Null) => {
                debug!("{} initializing with null DMA buffer", prefix);
                Box::new(NullBufferProvider)
            }
        };

        let host = HostMemoryInfo::gather().map_err(|source| Error::Io {
            channel: prefix,
            message: "could not gather process memory maps".to_string(),
            source,
        })?;

        CruDmaChannel::new(parameters, Box::new(ctrl), Box::new(config), buffer, &host)
    }

    /// Map a card's configuration BAR (BAR2) for register-only utilities.
    pub fn config_bar(card_id: &CardId) -> Result<CruBar> {
        let device = Self::find_card(card_id)?;
        Ok(CruBar::new(device.map_bar(2)?))
    }

    /// Resolve a card id against the probe.
    pub fn find_card(card_id: &CardId) -> Result<RocPciDevice> {
        let cards = enumerate_cards()?;
        let not_found = || Error::Parameter {
            channel: format!("[{}]", card_id),
            message: format!("no readout card matches id {}", card_id),
        };

        match card_id {
            CardId::Address(address) => cards
                .into_iter()
                .find(|card| card.descriptor.pci_address == *address)
                .ok_or_else(not_found),
            CardId::SequenceNumber(n) => cards
                .into_iter()
                .find(|card| card.descriptor.sequence_number == *n)
                .ok_or_else(not_found),
            CardId::Serial(serial) => {
                for card in cards {
                    match card.map_bar(2) {
                        Ok(bar) => {
                            if CruBar::new(bar).serial() == *serial {
                                return Ok(card);
                            }
                        }
                        Err(e) => {
                            warn!(
                                "skipping {} while resolving serial: {}",
                                card.descriptor.pci_address, e
                            );
                        }
                    }
                }
                Err(not_found())
            }
        }
    }
}
