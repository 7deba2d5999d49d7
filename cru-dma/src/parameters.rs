//! Channel configuration.
//!
//! `Parameters` collects everything a channel needs to come up: which card,
//! which DMA channel, where the buffer lives, and what feeds the links.

use core::fmt;

use crate::pci::PciAddress;

/// Default DMA page size. The card writes one page per transaction.
pub const DMA_PAGE_SIZE: u64 = 8 * 1024;

/// Identifies a card: by serial number, by PCI address, or by its position
/// in the enumeration order of the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardId {
    /// Integer serial number, as printed on the card.
    Serial(i32),
    /// Full PCI address, e.g. `0000:3b:00.0`.
    Address(PciAddress),
    /// Position in probe enumeration order, e.g. `#2`.
    SequenceNumber(u32),
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardId::Serial(serial) => write!(f, "{}", serial),
            CardId::Address(address) => write!(f, "{}", address),
            CardId::SequenceNumber(n) => write!(f, "#{}", n),
        }
    }
}

/// What feeds the DMA stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// The card's internal data generator (loopback).
    Internal,
    /// Front-end electronics over the optical links.
    Fee,
    /// The data-generator core upstream of the links.
    Ddg,
    /// Detector data link, source-side. Not supported by the CRU.
    Diu,
    /// Detector data link, destination-side. Not supported by the CRU.
    Siu,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataSource::Internal => "INTERNAL",
            DataSource::Fee => "FEE",
            DataSource::Ddg => "DDG",
            DataSource::Diu => "DIU",
            DataSource::Siu => "SIU",
        };
        f.write_str(name)
    }
}

impl DataSource {
    /// Parse the upper-case CLI spelling.
    pub fn from_str_upper(s: &str) -> Option<Self> {
        match s {
            "INTERNAL" => Some(DataSource::Internal),
            "FEE" => Some(DataSource::Fee),
            "DDG" => Some(DataSource::Ddg),
            "DIU" => Some(DataSource::Diu),
            "SIU" => Some(DataSource::Siu),
            _ => None,
        }
    }
}

/// How deep a reset to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetLevel {
    /// No reset at all.
    Nothing,
    /// Card-internal reset. The only level the CRU supports.
    Internal,
    /// Internal reset plus the detector data link. Legacy cards only.
    InternalDiu,
    /// Internal reset plus both link sides. Legacy cards only.
    InternalDiuSiu,
}

impl fmt::Display for ResetLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResetLevel::Nothing => "NOTHING",
            ResetLevel::Internal => "INTERNAL",
            ResetLevel::InternalDiu => "INTERNAL_DIU",
            ResetLevel::InternalDiuSiu => "INTERNAL_DIU_SIU",
        };
        f.write_str(name)
    }
}

impl ResetLevel {
    /// Parse the upper-case CLI spelling.
    pub fn from_str_upper(s: &str) -> Option<Self> {
        match s {
            "NOTHING" => Some(ResetLevel::Nothing),
            "INTERNAL" => Some(ResetLevel::Internal),
            "INTERNAL_DIU" => Some(ResetLevel::InternalDiu),
            "INTERNAL_DIU_SIU" => Some(ResetLevel::InternalDiuSiu),
            _ => None,
        }
    }
}

/// Where the DMA buffer comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferParameters {
    /// A region the client already owns, e.g. shared memory it set up.
    Memory { address: usize, size: usize },
    /// A file to map, typically on hugetlbfs.
    File { path: std::path::PathBuf, size: usize },
    /// No buffer. Register-only channels (reset, status).
    Null,
}

/// Everything needed to construct a DMA channel.
#[derive(Debug, Clone)]
pub struct Parameters {
    pub card_id: CardId,
    pub channel_number: u32,
    pub data_source: DataSource,
    pub dma_page_size: u64,
    pub buffer_parameters: Option<BufferParameters>,
}

impl Parameters {
    /// Start from a card and channel; everything else defaults.
    pub fn new(card_id: CardId, channel_number: u32) -> Self {
        Self {
            card_id,
            channel_number,
            data_source: DataSource::Internal,
            dma_page_size: DMA_PAGE_SIZE,
            buffer_parameters: None,
        }
    }

    pub fn with_data_source(mut self, data_source: DataSource) -> Self {
        self.data_source = data_source;
        self
    }

    pub fn with_dma_page_size(mut self, dma_page_size: u64) -> Self {
        self.dma_page_size = dma_page_size;
        self
    }

    pub fn with_buffer_parameters(mut self, buffer: BufferParameters) -> Self {
        self.buffer_parameters = Some(buffer);
        self
    }
}
