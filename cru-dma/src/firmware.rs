//! Firmware feature discovery.
//!
//! Full firmware builds expose every optional feature. Standalone builds
//! advertise themselves with a safe-word in the feature register and carry a
//! bit per disabled feature.

use bitflags::bitflags;

/// Safe-word in the low half of the feature register marking a standalone
/// firmware build.
const STANDALONE_SAFEWORD: u32 = 0x5AFE;

bitflags! {
    /// Disable bits reported by standalone firmware builds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct DisabledFeatures: u32 {
        const DATA_SELECTION = 1 << 16;
        const TEMPERATURE    = 1 << 17;
        const SERIAL         = 1 << 18;
        const FIRMWARE_INFO  = 1 << 19;
    }
}

/// The set of optional firmware features the card reports at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareFeatures {
    /// Firmware build info words are populated.
    pub firmware_info: bool,
    /// Serial number readout is available.
    pub serial: bool,
    /// Temperature sensor readout is available.
    pub temperature: bool,
    /// The data source selector register is wired up.
    pub data_selection: bool,
    /// Chip ID readout is available.
    pub chip_id: bool,
    /// This is a standalone (reduced) firmware build.
    pub standalone: bool,
}

impl FirmwareFeatures {
    /// A full firmware build: everything available.
    pub fn full() -> Self {
        Self {
            firmware_info: true,
            serial: true,
            temperature: true,
            data_selection: true,
            chip_id: true,
            standalone: false,
        }
    }

    /// Decode the feature register.
    ///
    /// The low 16 bits carry the standalone safe-word; without it the build
    /// is a full one and every feature is present. Standalone builds report
    /// one *disable* bit per feature in the high half and never support
    /// chip ID readout.
    pub fn from_register(raw: u32) -> Self {
        if raw & 0xFFFF != STANDALONE_SAFEWORD {
            return Self::full();
        }
        let disabled = DisabledFeatures::from_bits_truncate(raw);
        Self {
            firmware_info: !disabled.contains(DisabledFeatures::FIRMWARE_INFO),
            serial: !disabled.contains(DisabledFeatures::SERIAL),
            temperature: !disabled.contains(DisabledFeatures::TEMPERATURE),
            data_selection: !disabled.contains(DisabledFeatures::DATA_SELECTION),
            chip_id: false,
            standalone: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_build_has_everything() {
        let features = FirmwareFeatures::from_register(0x0000_0000);
        assert_eq!(features, FirmwareFeatures::full());
        assert!(!features.standalone);
        assert!(features.chip_id);
    }

    #[test]
    fn test_standalone_with_no_disable_bits() {
        let features = FirmwareFeatures::from_register(0x0000_5AFE);
        assert!(features.standalone);
        assert!(features.firmware_info);
        assert!(features.serial);
        assert!(features.temperature);
        assert!(features.data_selection);
        // Never available on standalone builds.
        assert!(!features.chip_id);
    }

    #[test]
    fn test_standalone_disable_bits() {
        let raw = STANDALONE_SAFEWORD | (1 << 17) | (1 << 18);
        let features = FirmwareFeatures::from_register(raw);
        assert!(features.standalone);
        assert!(!features.temperature);
        assert!(!features.serial);
        assert!(features.firmware_info);
        assert!(features.data_selection);
    }
}
