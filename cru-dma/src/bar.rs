//! Register access behind capability traits.
//!
//! The channel engine never touches raw registers: it holds a [`CtrlBar`]
//! (BAR0, data-taking control and the superpage descriptor FIFO) and a
//! [`ConfigBar`] (BAR2, link enumeration and telemetry). The concrete
//! [`CruBar`] implements both over a memory-mapped window; tests drive the
//! engine through mock implementations instead.

use log::debug;

use crate::firmware::FirmwareFeatures;
use crate::pci::MappedBar;

/// One optical input channel on the card.
pub type LinkId = u16;

/// Register map, as 32-bit word indices into the BAR windows.
pub mod registers {
    //! Word indices (byte address / 4) and magic values.

    // --- BAR0: DMA engine control ---

    /// DMA engine arm/disarm.
    pub const DMA_CONTROL: usize = 0x200 / 4;
    /// Card-wide reset strobe.
    pub const RESET_CONTROL: usize = 0x400 / 4;
    /// Internal counter reset strobe.
    pub const RESET_COUNTERS: usize = 0x404 / 4;
    /// Feature safe-word and disable bits.
    pub const FIRMWARE_FEATURES: usize = 0x41C / 4;
    /// Depth of the per-link superpage descriptor FIFO. 0 = unsupported.
    pub const MAX_SUPERPAGE_DESCRIPTORS: usize = 0x420 / 4;
    /// This DMA engine's endpoint number (0 or 1).
    pub const ENDPOINT_ID: usize = 0x500 / 4;
    /// Data generator counter reset strobe.
    pub const DATA_GENERATOR_CONTROL: usize = 0x600 / 4;
    /// Single-shot error injection into the data generator stream.
    pub const DATA_GENERATOR_INJECT_ERROR: usize = 0x608 / 4;
    /// Data source selector.
    pub const DATA_SOURCE_SELECT: usize = 0x700 / 4;
    /// Debug mode gate for the internal generator.
    pub const DEBUG_MODE: usize = 0x704 / 4;

    /// Selector value: links feed the stream (GBT).
    pub const DATA_SOURCE_SELECT_GBT: u32 = 0x0;
    /// Selector value: internal data generator loopback.
    pub const DATA_SOURCE_SELECT_INTERNAL: u32 = 0x2;

    /// Start of the per-link superpage FIFO windows.
    pub const LINK_BASE: usize = 0x2000 / 4;
    /// Words per link window.
    pub const LINK_STRIDE: usize = 0x40 / 4;
    /// Descriptor bus address, low half.
    pub const LINK_SUPERPAGE_ADDRESS_LOW: usize = 0x0;
    /// Descriptor bus address, high half.
    pub const LINK_SUPERPAGE_ADDRESS_HIGH: usize = 0x1;
    /// Descriptor page count; the write pushes the descriptor.
    pub const LINK_SUPERPAGE_PAGES: usize = 0x2;
    /// Count of superpages the card completed on this link.
    pub const LINK_SUPERPAGE_COUNT: usize = 0x3;
    /// Received byte count of the oldest completed superpage. 0 = unsupported.
    pub const LINK_SUPERPAGE_SIZE: usize = 0x4;
    /// Times this link's descriptor FIFO ran empty.
    pub const LINK_SUPERPAGE_FIFO_EMPTY: usize = 0x5;

    // --- BAR2: configuration and telemetry ---

    /// Bitmask of links enabled for data taking.
    pub const LINK_ENABLE_MASK: usize = 0x100 / 4;
    /// Data taking on/off.
    pub const DATA_TAKING_CONTROL: usize = 0x104 / 4;
    /// Dropped packet counters, one word per endpoint.
    pub const DROPPED_PACKETS: usize = 0x120 / 4;
    /// Card serial number.
    pub const SERIAL_NUMBER: usize = 0x140 / 4;
    /// Raw die temperature reading.
    pub const TEMPERATURE: usize = 0x144 / 4;
    /// Firmware build info, three consecutive words.
    pub const FIRMWARE_INFO: usize = 0x148 / 4;
    /// Chip ID, two consecutive words.
    pub const CHIP_ID: usize = 0x154 / 4;
}

/// BAR0 capability: data-taking control and the superpage descriptor FIFO.
pub trait CtrlBar {
    fn firmware_features(&self) -> FirmwareFeatures;
    /// Descriptor FIFO depth per link; 0 when the firmware predates the
    /// register.
    fn max_superpage_descriptors(&self) -> u32;
    fn set_data_source(&self, selection: u32);
    fn start_dma_engine(&self);
    fn stop_dma_engine(&self);
    fn reset_card(&self);
    fn reset_data_generator_counter(&self);
    fn reset_internal_counters(&self);
    /// Hand the card one superpage worth of bus-addressable space.
    fn push_superpage_descriptor(&self, link_id: LinkId, dma_pages: u32, bus_address: u64);
    /// Monotonic count of superpages the card completed on this link.
    fn superpage_count(&self, link_id: LinkId) -> u32;
    /// Received byte count of the oldest completed superpage; 0 when the
    /// firmware does not report sizes.
    fn superpage_size(&self, link_id: LinkId) -> u32;
    fn superpage_fifo_empty_counter(&self, link_id: LinkId) -> u32;
    fn endpoint_number(&self) -> u32;
    fn debug_mode_enabled(&self) -> bool;
    fn set_debug_mode_enabled(&self, enabled: bool);
    fn data_generator_inject_error(&self);
}

/// BAR2 capability: link enumeration and telemetry.
pub trait ConfigBar {
    /// Links enabled for data taking, in card enumeration order.
    fn data_taking_links(&self) -> Vec<LinkId>;
    fn enable_data_taking(&self);
    fn disable_data_taking(&self);
    fn dropped_packets(&self, endpoint: u32) -> i32;
    fn serial(&self) -> i32;
    fn temperature(&self) -> f32;
    fn firmware_info(&self) -> String;
    fn card_id(&self) -> String;
    /// Raw 32-bit register read at a word index.
    fn read_register(&self, word_index: usize) -> u32;
}

/// Concrete BAR implementation over a memory-mapped register window.
///
/// One `CruBar` wraps one window; a channel owns two (BAR0 and BAR2), each
/// implementing the matching capability trait.
pub struct CruBar {
    bar: MappedBar,
}

impl CruBar {
    pub fn new(bar: MappedBar) -> Self {
        Self { bar }
    }

    fn link_word(link_id: LinkId, offset: usize) -> usize {
        registers::LINK_BASE + link_id as usize * registers::LINK_STRIDE + offset
    }
}

impl CtrlBar for CruBar {
    fn firmware_features(&self) -> FirmwareFeatures {
        FirmwareFeatures::from_register(self.bar.read(registers::FIRMWARE_FEATURES))
    }

    fn max_superpage_descriptors(&self) -> u32 {
        self.bar.read(registers::MAX_SUPERPAGE_DESCRIPTORS)
    }

    fn set_data_source(&self, selection: u32) {
        self.bar.write(registers::DATA_SOURCE_SELECT, selection);
    }

    fn start_dma_engine(&self) {
        self.bar.write(registers::DMA_CONTROL, 0x1);
    }

    fn stop_dma_engine(&self) {
        self.bar.write(registers::DMA_CONTROL, 0x0);
    }

    fn reset_card(&self) {
        self.bar.write(registers::RESET_CONTROL, 0x1);
    }

    fn reset_data_generator_counter(&self) {
        self.bar.write(registers::DATA_GENERATOR_CONTROL, 0x1);
    }

    fn reset_internal_counters(&self) {
        self.bar.write(registers::RESET_COUNTERS, 0x1);
    }

    fn push_superpage_descriptor(&self, link_id: LinkId, dma_pages: u32, bus_address: u64) {
        debug!(
            "push descriptor: link {} pages {} bus {:#x}",
            link_id, dma_pages, bus_address
        );
        self.bar.write(
            Self::link_word(link_id, registers::LINK_SUPERPAGE_ADDRESS_LOW),
            bus_address as u32,
        );
        self.bar.write(
            Self::link_word(link_id, registers::LINK_SUPERPAGE_ADDRESS_HIGH),
            (bus_address >> 32) as u32,
        );
        // The page count write commits the descriptor; address words must
        // land first.
        self.bar.write(
            Self::link_word(link_id, registers::LINK_SUPERPAGE_PAGES),
            dma_pages,
        );
    }

    fn superpage_count(&self, link_id: LinkId) -> u32 {
        self.bar
            .read(Self::link_word(link_id, registers::LINK_SUPERPAGE_COUNT))
    }

    fn superpage_size(&self, link_id: LinkId) -> u32 {
        self.bar
            .read(Self::link_word(link_id, registers::LINK_SUPERPAGE_SIZE))
    }

    fn superpage_fifo_empty_counter(&self, link_id: LinkId) -> u32 {
        self.bar
            .read(Self::link_word(link_id, registers::LINK_SUPERPAGE_FIFO_EMPTY))
    }

    fn endpoint_number(&self) -> u32 {
        self.bar.read(registers::ENDPOINT_ID)
    }

    fn debug_mode_enabled(&self) -> bool {
        self.bar.read(registers::DEBUG_MODE) != 0
    }

    fn set_debug_mode_enabled(&self, enabled: bool) {
        self.bar
            .write(registers::DEBUG_MODE, if enabled { 0x1 } else { 0x0 });
    }

    fn data_generator_inject_error(&self) {
        self.bar.write(registers::DATA_GENERATOR_INJECT_ERROR, 0x1);
    }
}

impl ConfigBar for CruBar {
    fn data_taking_links(&self) -> Vec<LinkId> {
        let mask = self.bar.read(registers::LINK_ENABLE_MASK);
        (0..32)
            .filter(|bit| mask & (1 << bit) != 0)
            .map(|bit| bit as LinkId)
            .collect()
    }

    fn enable_data_taking(&self) {
        self.bar.write(registers::DATA_TAKING_CONTROL, 0x1);
    }

    fn disable_data_taking(&self) {
        self.bar.write(registers::DATA_TAKING_CONTROL, 0x0);
    }

    fn dropped_packets(&self, endpoint: u32) -> i32 {
        self.bar.read(registers::DROPPED_PACKETS + endpoint as usize) as i32
    }

    fn serial(&self) -> i32 {
        self.bar.read(registers::SERIAL_NUMBER) as i32
    }

    fn temperature(&self) -> f32 {
        // Sysmon transfer function: raw ADC counts to degrees Celsius.
        let raw = self.bar.read(registers::TEMPERATURE) & 0x3FF;
        raw as f32 * 503.975 / 1024.0 - 273.15
    }

    fn firmware_info(&self) -> String {
        let words: Vec<u32> = (0..3)
            .map(|i| self.bar.read(registers::FIRMWARE_INFO + i))
            .collect();
        format!("{:08x}-{:08x}-{:08x}", words[0], words[1], words[2])
    }

    fn card_id(&self) -> String {
        let high = self.bar.read(registers::CHIP_ID);
        let low = self.bar.read(registers::CHIP_ID + 1);
        format!("{:08x}{:08x}", high, low)
    }

    fn read_register(&self, word_index: usize) -> u32 {
        self.bar.read(word_index)
    }
}
