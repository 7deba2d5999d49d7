//! Host memory facts the channel pre-flight needs.
//!
//! DMA without an IOMMU requires the buffer to be physically contiguous,
//! which in practice means hugepage-backed. Whether a mapping is hugepage
//! backed is visible in `/proc/self/smaps` (`KernelPageSize`), and IOMMU
//! enablement in `/sys/kernel/iommu_groups`. Both are gathered up front and
//! handed to construction as plain data.

use std::fs;
use std::io;
use std::path::Path;

/// One mapping of the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMap {
    pub address_start: u64,
    pub address_end: u64,
    /// Backing page size in KiB; > 4 means hugepages.
    pub page_size_kib: u64,
}

/// Snapshot of the memory facts construction validates against.
#[derive(Debug, Clone, Default)]
pub struct HostMemoryInfo {
    pub maps: Vec<MemoryMap>,
    pub iommu_enabled: bool,
}

impl HostMemoryInfo {
    /// Gather the live facts for this process.
    pub fn gather() -> io::Result<Self> {
        Ok(Self {
            maps: process_memory_maps()?,
            iommu_enabled: iommu_enabled(),
        })
    }

    /// The mapping that starts exactly at `address`, if any.
    pub fn map_at(&self, address: u64) -> Option<&MemoryMap> {
        self.maps.iter().find(|map| map.address_start == address)
    }
}

/// Parse the calling process's smaps.
pub fn process_memory_maps() -> io::Result<Vec<MemoryMap>> {
    let content = fs::read_to_string("/proc/self/smaps")?;
    Ok(parse_smaps(&content))
}

/// The IOMMU is on when the kernel populated any IOMMU groups.
pub fn iommu_enabled() -> bool {
    iommu_enabled_in(Path::new("/sys/kernel/iommu_groups"))
}

fn iommu_enabled_in(groups_dir: &Path) -> bool {
    fs::read_dir(groups_dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn parse_smaps(content: &str) -> Vec<MemoryMap> {
    let mut maps = Vec::new();
    for line in content.lines() {
        if let Some((range, _)) = line.split_once(' ') {
            if let Some((start, end)) = parse_address_range(range) {
                maps.push(MemoryMap {
                    address_start: start,
                    address_end: end,
                    page_size_kib: 4,
                });
                continue;
            }
        }
        if let Some(rest) = line.strip_prefix("KernelPageSize:") {
            if let Some(kib) = parse_kib(rest) {
                if let Some(map) = maps.last_mut() {
                    map.page_size_kib = kib;
                }
            }
        }
    }
    maps
}

fn parse_address_range(range: &str) -> Option<(u64, u64)> {
    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    (start < end).then_some((start, end))
}

fn parse_kib(field: &str) -> Option<u64> {
    let field = field.trim();
    let value = field.strip_suffix("kB")?.trim();
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
7f5c40000000-7f5c40200000 rw-s 00000000 00:2d 123  /mnt/hugetlbfs/roc_0
Size:               2048 kB
KernelPageSize:     2048 kB
MMUPageSize:        2048 kB
7f5c42000000-7f5c42021000 rw-p 00000000 00:00 0
Size:                132 kB
KernelPageSize:        4 kB
MMUPageSize:           4 kB
";

    #[test]
    fn test_parse_smaps_entries() {
        let maps = parse_smaps(SAMPLE);
        assert_eq!(maps.len(), 2);
        assert_eq!(
            maps[0],
            MemoryMap {
                address_start: 0x7f5c_4000_0000,
                address_end: 0x7f5c_4020_0000,
                page_size_kib: 2048,
            }
        );
        assert_eq!(maps[1].page_size_kib, 4);
    }

    #[test]
    fn test_map_at_matches_exact_start() {
        let info = HostMemoryInfo {
            maps: parse_smaps(SAMPLE),
            iommu_enabled: false,
        };
        assert!(info.map_at(0x7f5c_4000_0000).is_some());
        assert!(info.map_at(0x7f5c_4000_1000).is_none());
    }

    #[test]
    fn test_parse_ignores_malformed_lines() {
        let maps = parse_smaps("not-a-map-line\nKernelPageSize: about right\n");
        assert!(maps.is_empty());
    }
}
