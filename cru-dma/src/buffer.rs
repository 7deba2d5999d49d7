//! DMA buffer providers.
//!
//! A channel owns one registered host-memory region for its whole lifetime
//! and reaches it through the [`BufferProvider`] capability: base address,
//! total size, the scatter-gather list the registration produced, and the
//! logical-offset-to-bus-address translation the card needs for descriptors.

use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

use log::debug;

use crate::error::{Error, Result};

/// One physically contiguous, bus-addressable piece of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterGatherEntry {
    /// Logical offset of this piece within the buffer.
    pub offset: u64,
    /// Length of the piece in bytes.
    pub size: u64,
    /// Bus address the card uses to reach the piece.
    pub bus_address: u64,
}

/// Capability over the registered DMA buffer.
pub trait BufferProvider {
    /// Host virtual base address of the region.
    fn address(&self) -> *const u8;
    /// Total size of the region in bytes.
    fn size(&self) -> u64;
    /// Number of scatter-gather entries the registration produced.
    fn scatter_gather_list_size(&self) -> usize;
    /// Translate a logical buffer offset into a bus address.
    ///
    /// The offset must lie inside the registered region; callers validate
    /// ranges before building descriptors.
    fn bus_offset_address(&self, offset: u64) -> u64;
}

fn lookup_bus_address(list: &[ScatterGatherEntry], offset: u64) -> u64 {
    for entry in list {
        if offset >= entry.offset && offset < entry.offset + entry.size {
            return entry.bus_address + (offset - entry.offset);
        }
    }
    panic!("offset {:#x} outside the registered buffer", offset);
}

/// A client-owned memory region, registered as-is.
pub struct MemoryBufferProvider {
    address: *const u8,
    size: u64,
    sg_list: Vec<ScatterGatherEntry>,
}

impl MemoryBufferProvider {
    pub fn new(address: usize, size: usize, sg_list: Vec<ScatterGatherEntry>) -> Self {
        Self {
            address: address as *const u8,
            size: size as u64,
            sg_list,
        }
    }

    /// Register a region mapped through the IOMMU as one contiguous bus
    /// range starting at the region's own address.
    pub fn identity_mapped(address: usize, size: usize) -> Self {
        let sg_list = vec![ScatterGatherEntry {
            offset: 0,
            size: size as u64,
            bus_address: address as u64,
        }];
        Self::new(address, size, sg_list)
    }
}

impl BufferProvider for MemoryBufferProvider {
    fn address(&self) -> *const u8 {
        self.address
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn scatter_gather_list_size(&self) -> usize {
        self.sg_list.len()
    }

    fn bus_offset_address(&self, offset: u64) -> u64 {
        lookup_bus_address(&self.sg_list, offset)
    }
}

/// A memory-mapped file, typically on hugetlbfs.
///
/// Mapping keeps the file open for the channel's lifetime; the mapping is
/// torn down on drop.
pub struct FileBufferProvider {
    _file: fs::File,
    inner: MemoryBufferProvider,
    mapped_len: usize,
}

impl FileBufferProvider {
    pub fn open(path: &Path, size: usize, channel_prefix: &str) -> Result<Self> {
        let io_err = |message: String, source| Error::Io {
            channel: channel_prefix.to_string(),
            message,
            source,
        };

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| io_err(format!("could not open buffer file {}", path.display()), e))?;
        file.set_len(size as u64)
            .map_err(|e| io_err(format!("could not size buffer file {}", path.display()), e))?;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io_err(
                format!("could not map buffer file {}", path.display()),
                std::io::Error::last_os_error(),
            ));
        }

        debug!("mapped buffer file {} ({} bytes)", path.display(), size);
        Ok(Self {
            _file: file,
            inner: MemoryBufferProvider::identity_mapped(base as usize, size),
            mapped_len: size,
        })
    }
}

impl Drop for FileBufferProvider {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.inner.address() as *mut libc::c_void, self.mapped_len);
        }
    }
}

impl BufferProvider for FileBufferProvider {
    fn address(&self) -> *const u8 {
        self.inner.address()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn scatter_gather_list_size(&self) -> usize {
        self.inner.scatter_gather_list_size()
    }

    fn bus_offset_address(&self, offset: u64) -> u64 {
        self.inner.bus_offset_address(offset)
    }
}

/// No buffer at all, for register-only channels (reset, status).
pub struct NullBufferProvider;

impl BufferProvider for NullBufferProvider {
    fn address(&self) -> *const u8 {
        ptr::null()
    }

    fn size(&self) -> u64 {
        0
    }

    fn scatter_gather_list_size(&self) -> usize {
        0
    }

    fn bus_offset_address(&self, offset: u64) -> u64 {
        panic!("null buffer has no bus addresses (offset {:#x})", offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_mapping_translation() {
        let provider = MemoryBufferProvider::identity_mapped(0x10_0000, 0x8000);
        assert_eq!(provider.size(), 0x8000);
        assert_eq!(provider.scatter_gather_list_size(), 1);
        assert_eq!(provider.bus_offset_address(0), 0x10_0000);
        assert_eq!(provider.bus_offset_address(0x4000), 0x10_4000);
    }

    #[test]
    fn test_multi_entry_translation() {
        let sg_list = vec![
            ScatterGatherEntry {
                offset: 0,
                size: 0x2000,
                bus_address: 0xA000_0000,
            },
            ScatterGatherEntry {
                offset: 0x2000,
                size: 0x2000,
                bus_address: 0xB000_0000,
            },
        ];
        let provider = MemoryBufferProvider::new(0x10_0000, 0x4000, sg_list);
        assert_eq!(provider.scatter_gather_list_size(), 2);
        assert_eq!(provider.bus_offset_address(0x1FFF), 0xA000_1FFF);
        assert_eq!(provider.bus_offset_address(0x2000), 0xB000_0000);
        assert_eq!(provider.bus_offset_address(0x3ABC), 0xB000_1ABC);
    }

    #[test]
    #[should_panic(expected = "outside the registered buffer")]
    fn test_out_of_range_offset_panics() {
        let provider = MemoryBufferProvider::identity_mapped(0x10_0000, 0x1000);
        provider.bus_offset_address(0x1000);
    }

    #[test]
    fn test_null_provider_is_empty() {
        let provider = NullBufferProvider;
        assert_eq!(provider.size(), 0);
        assert_eq!(provider.scatter_gather_list_size(), 0);
        assert!(provider.address().is_null());
    }
}
