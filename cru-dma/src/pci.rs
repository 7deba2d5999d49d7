//! PCI card discovery and BAR mapping.
//!
//! Cards are found through sysfs: each entry under `/sys/bus/pci/devices`
//! carries vendor/device id files and mmappable `resourceN` files for the
//! BAR windows. No kernel driver beyond the generic sysfs interface is
//! assumed; the IOMMU-backed buffer registration happens elsewhere.

use std::fmt;
use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use log::{debug, warn};

use crate::error::{Error, Result};

/// CERN's PCI vendor id.
pub const VENDOR_CERN: u16 = 0x10DC;
/// Device id of the CRU.
pub const DEVICE_CRU: u16 = 0xE001;
/// Device id of the legacy C-RORC.
pub const DEVICE_CRORC: u16 = 0x0033;

/// The card families the driver knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    Cru,
    Crorc,
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardType::Cru => f.write_str("CRU"),
            CardType::Crorc => f.write_str("C-RORC"),
        }
    }
}

/// A PCI geographic address: domain, bus, device (slot), function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    /// Parse `DDDD:BB:DD.F` (all fields hex), e.g. `0000:3b:00.0`.
    pub fn parse(s: &str) -> Option<Self> {
        let (domain_str, rest) = s.split_once(':')?;
        let (bus_str, rest) = rest.split_once(':')?;
        let (device_str, function_str) = rest.split_once('.')?;

        let domain = u16::from_str_radix(domain_str, 16).ok()?;
        let bus = u8::from_str_radix(bus_str, 16).ok()?;
        let device = u8::from_str_radix(device_str, 16).ok()?;
        let function = u8::from_str_radix(function_str, 16).ok()?;

        Some(PciAddress {
            domain,
            bus,
            device,
            function,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// Everything the probe learned about one card.
#[derive(Debug, Clone)]
pub struct CardDescriptor {
    pub card_type: CardType,
    pub pci_address: PciAddress,
    /// Position in enumeration order, stable for one boot.
    pub sequence_number: u32,
}

/// A probed card with its sysfs directory, ready to map BARs from.
#[derive(Debug, Clone)]
pub struct RocPciDevice {
    pub descriptor: CardDescriptor,
    sysfs_path: PathBuf,
}

impl RocPciDevice {
    /// Map one of the card's BAR windows.
    pub fn map_bar(&self, index: u8) -> Result<MappedBar> {
        let path = self.sysfs_path.join(format!("resource{}", index));
        MappedBar::open(&path, &self.descriptor.pci_address.to_string())
    }
}

fn read_sysfs_hex(path: &Path) -> Option<u16> {
    let raw = fs::read_to_string(path).ok()?;
    let trimmed = raw.trim_end().trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16).ok()
}

/// Scan sysfs for readout cards, ordered by PCI address.
///
/// The index into the returned list is the card's sequence number.
pub fn enumerate_cards() -> Result<Vec<RocPciDevice>> {
    enumerate_cards_in(Path::new("/sys/bus/pci/devices"))
}

fn enumerate_cards_in(devices_dir: &Path) -> Result<Vec<RocPciDevice>> {
    let entries = fs::read_dir(devices_dir).map_err(|source| Error::Io {
        channel: "[probe]".into(),
        message: format!("could not scan {}", devices_dir.display()),
        source,
    })?;

    let mut cards = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(address) = name.to_str().and_then(PciAddress::parse) else {
            continue;
        };

        let vendor = read_sysfs_hex(&entry.path().join("vendor"));
        let device = read_sysfs_hex(&entry.path().join("device"));
        if vendor != Some(VENDOR_CERN) {
            continue;
        }

        let card_type = match device {
            Some(DEVICE_CRU) => CardType::Cru,
            Some(DEVICE_CRORC) => CardType::Crorc,
            _ => continue,
        };

        debug!("probe: found {} at {}", card_type, address);
        cards.push((address, card_type, entry.path()));
    }

    cards.sort_by_key(|(address, _, _)| *address);

    Ok(cards
        .into_iter()
        .enumerate()
        .map(|(i, (pci_address, card_type, sysfs_path))| RocPciDevice {
            descriptor: CardDescriptor {
                card_type,
                pci_address,
                sequence_number: i as u32,
            },
            sysfs_path,
        })
        .collect())
}

/// A memory-mapped BAR window with volatile 32-bit register access.
pub struct MappedBar {
    base: *mut u32,
    len: usize,
}

// The mapping is owned for the card's lifetime and register access is
// volatile; the channel contract makes all access single-threaded.
unsafe impl Send for MappedBar {}

impl MappedBar {
    fn open(path: &Path, card: &str) -> Result<Self> {
        let io_err = |message: String, source| Error::Io {
            channel: format!("[{}]", card),
            message,
            source,
        };

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| io_err(format!("could not open {}", path.display()), e))?;
        let len = file
            .metadata()
            .map_err(|e| io_err(format!("could not stat {}", path.display()), e))?
            .len() as usize;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io_err(
                format!("could not map {}", path.display()),
                std::io::Error::last_os_error(),
            ));
        }

        debug!("mapped BAR {} ({} bytes)", path.display(), len);
        Ok(Self {
            base: base as *mut u32,
            len,
        })
    }

    /// Number of 32-bit registers in the window.
    pub fn register_count(&self) -> usize {
        self.len / 4
    }

    /// Volatile read of the register at `word_index`.
    pub fn read(&self, word_index: usize) -> u32 {
        if word_index >= self.register_count() {
            warn!("BAR read past window: word {:#x}", word_index);
            return 0xFFFF_FFFF;
        }
        unsafe { ptr::read_volatile(self.base.add(word_index)) }
    }

    /// Volatile write of the register at `word_index`.
    pub fn write(&self, word_index: usize, value: u32) {
        if word_index >= self.register_count() {
            warn!("BAR write past window: word {:#x}", word_index);
            return;
        }
        unsafe { ptr::write_volatile(self.base.add(word_index), value) }
    }
}

impl Drop for MappedBar {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}
