//! The DMA channel engine.
//!
//! A channel feeds the card superpage descriptors across its enabled links,
//! polls the per-link completion counters, and surfaces filled superpages
//! back to the client in completion order. The card side is reached only
//! through the [`CtrlBar`]/[`ConfigBar`] capabilities and the buffer only
//! through [`BufferProvider`], so the engine itself is plain bookkeeping:
//! per-link in-flight queues, one ready queue, and an aggregate free-slot
//! counter that must always equal the sum of per-link free slots.
//!
//! The client owns the calling thread. Nothing here blocks or yields except
//! two bounded settle sleeps during start and reset. The card is the one
//! true concurrent party: it advances completion counters at any time, and
//! the only defense is the invariant check in [`CruDmaChannel::fill_superpages`].

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use superpage_queue::SuperpageQueue;

use crate::bar::{registers, ConfigBar, CtrlBar, LinkId};
use crate::buffer::BufferProvider;
use crate::error::{Error, Result};
use crate::firmware::FirmwareFeatures;
use crate::hostmem::HostMemoryInfo;
use crate::parameters::{DataSource, Parameters, ResetLevel, DMA_PAGE_SIZE};
use crate::pci::CardType;
use crate::superpage::Superpage;

/// Fallback descriptor FIFO depth for firmware without the depth register.
pub const MAX_SUPERPAGE_DESCRIPTORS_DEFAULT: u32 = 128;
/// Upper bound of links one DMA endpoint serves.
pub const MAX_LINKS: u32 = 32;
/// Superpage sizes must be a multiple of this.
pub const SUPERPAGE_SIZE_GRANULARITY: u64 = 32 * 1024;
/// Smallest hugepage size, the bound for the scatter-gather sanity check.
const HUGEPAGE_MIN_SIZE: u64 = 2 * 1024 * 1024;
/// Minimum interval between FIFO-stall warnings.
const FIFO_HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(15);
/// Hardware settle time after arming the DMA engine.
const DMA_ENGINE_SETTLE: Duration = Duration::from_millis(10);
/// Hardware settle time between reset steps.
const RESET_SETTLE: Duration = Duration::from_millis(100);

/// DMA engine state as the driver tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaState {
    Unknown,
    Stopped,
    Started,
}

/// Per-link state: identity, harvest counter, and the in-flight queue.
///
/// The queue mirrors the card's descriptor FIFO for this link; its order is
/// the order the card will complete superpages.
struct Link {
    id: LinkId,
    superpage_counter: u32,
    queue: SuperpageQueue<Superpage>,
}

/// A DMA channel on a CRU.
pub struct CruDmaChannel {
    prefix: String,
    ctrl: Box<dyn CtrlBar>,
    config: Box<dyn ConfigBar>,
    buffer: Box<dyn BufferProvider>,
    data_source: DataSource,
    dma_page_size: u64,
    features: FirmwareFeatures,
    link_queue_capacity: usize,
    ready_queue_capacity: usize,
    links: Vec<Link>,
    ready_queue: SuperpageQueue<Superpage>,
    /// Aggregate free slots across all link queues. Invariant: equals
    /// `Σ (link_queue_capacity - link.queue.len())`.
    link_queues_total_available: i64,
    dma_state: DmaState,
    first_superpage_pushed: bool,
    empty_fifo_counters: HashMap<LinkId, u32>,
    last_fifo_warning: Option<Instant>,
    debug_register_dirty: bool,
}

impl CruDmaChannel {
    /// Construct a channel from its capabilities, running the full
    /// pre-flight validation. The DMA engine is left stopped.
    pub fn new(
        parameters: &Parameters,
        ctrl: Box<dyn CtrlBar>,
        config: Box<dyn ConfigBar>,
        buffer: Box<dyn BufferProvider>,
        host: &HostMemoryInfo,
    ) -> Result<Self> {
        let prefix = format!(
            "[{} channel={}]",
            parameters.card_id, parameters.channel_number
        );

        // One DMA channel per CRU endpoint.
        if parameters.channel_number != 0 {
            return Err(Error::Parameter {
                channel: prefix,
                message: format!(
                    "channel number {} not supported, the CRU only has channel 0",
                    parameters.channel_number
                ),
            });
        }

        if matches!(parameters.data_source, DataSource::Diu | DataSource::Siu) {
            return Err(Error::UnsupportedDataSource {
                channel: prefix,
                data_source: parameters.data_source,
            });
        }

        if parameters.dma_page_size != DMA_PAGE_SIZE {
            warn!(
                "{} DMA page size {} not the default {}; unsupported - behaviour not specified",
                prefix, parameters.dma_page_size, DMA_PAGE_SIZE
            );
        }

        let features = ctrl.firmware_features();
        if features.standalone {
            let mut disabled = String::new();
            let mut log_feature = |name, enabled: bool| {
                if !enabled {
                    disabled.push(' ');
                    disabled.push_str(name);
                }
            };
            log_feature("firmware-info", features.firmware_info);
            log_feature("serial-number", features.serial);
            log_feature("temperature", features.temperature);
            log_feature("data-selection", features.data_selection);
            debug!("{} standalone firmware features disabled:{}", prefix, disabled);
        }

        let mut max_superpage_descriptors = ctrl.max_superpage_descriptors();
        if max_superpage_descriptors == 0 {
            // Firmware predates the depth register.
            max_superpage_descriptors = MAX_SUPERPAGE_DESCRIPTORS_DEFAULT;
        }
        let link_queue_capacity = max_superpage_descriptors as usize;
        let ready_queue_capacity = link_queue_capacity * MAX_LINKS as usize;

        let link_ids = config.data_taking_links();
        if link_ids.is_empty() {
            return Err(Error::NoLinksEnabled { channel: prefix });
        }
        info!(
            "{} using link(s): {}",
            prefix,
            link_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let links: Vec<Link> = link_ids
            .into_iter()
            .map(|id| Link {
                id,
                superpage_counter: 0,
                queue: SuperpageQueue::new(link_queue_capacity + 1),
            })
            .collect();
        let ready_queue = SuperpageQueue::new(ready_queue_capacity + 1);
        let link_queues_total_available = (link_queue_capacity * links.len()) as i64;

        Self::check_buffer(&prefix, buffer.as_ref(), host)?;

        Ok(Self {
            prefix,
            ctrl,
            config,
            buffer,
            data_source: parameters.data_source,
            dma_page_size: parameters.dma_page_size,
            features,
            link_queue_capacity,
            ready_queue_capacity,
            links,
            ready_queue,
            link_queues_total_available,
            dma_state: DmaState::Stopped,
            first_superpage_pushed: false,
            empty_fifo_counters: HashMap::new(),
            last_fifo_warning: None,
            debug_register_dirty: false,
        })
    }

    /// Scatter-gather sanity and hugepage/IOMMU pre-flight.
    fn check_buffer(
        prefix: &str,
        buffer: &dyn BufferProvider,
        host: &HostMemoryInfo,
    ) -> Result<()> {
        let sg_list_size = buffer.scatter_gather_list_size();
        let buffer_size = buffer.size();
        debug!("{} scatter-gather list size: {}", prefix, sg_list_size);
        if sg_list_size as u64 > buffer_size / HUGEPAGE_MIN_SIZE {
            return Err(Error::BufferConfig {
                channel: prefix.to_string(),
                message: format!(
                    "scatter-gather list size {} greater than buffer size divided by 2 MiB \
                     (minimum hugepage size); the IOMMU is off and the buffer is not backed \
                     by hugepages - an unsupported buffer configuration",
                    sg_list_size
                ),
            });
        }

        if buffer_size == 0 {
            return Ok(());
        }
        match host.map_at(buffer.address() as u64) {
            Some(map) if map.page_size_kib > 4 => {
                info!("{} buffer is hugepage-backed", prefix);
            }
            Some(_) if host.iommu_enabled => {
                warn!(
                    "{} buffer is not hugepage-backed, but the IOMMU is enabled",
                    prefix
                );
            }
            Some(_) => {
                return Err(Error::BufferConfig {
                    channel: prefix.to_string(),
                    message: "buffer is not hugepage-backed and the IOMMU is disabled - \
                              unsupported buffer configuration (was roc-setup-hugetlbfs run?)"
                        .to_string(),
                });
            }
            None => {
                warn!("{} failed to check whether buffer is hugepage-backed", prefix);
            }
        }
        Ok(())
    }

    /// Which card family this channel drives.
    pub fn card_type(&self) -> CardType {
        CardType::Cru
    }

    pub fn dma_state(&self) -> DmaState {
        self.dma_state
    }

    /// Arm the card and begin taking data.
    ///
    /// Calling this on a started channel logs and leaves it started.
    pub fn start_dma(&mut self) -> Result<()> {
        match self.dma_state {
            DmaState::Unknown => {
                warn!("{} unknown DMA state", self.prefix);
            }
            DmaState::Started => {
                warn!("{} DMA already started, ignoring start request", self.prefix);
            }
            DmaState::Stopped => {
                debug!("{} starting DMA", self.prefix);
                self.device_start_dma();
            }
        }
        self.dma_state = DmaState::Started;
        Ok(())
    }

    fn device_start_dma(&mut self) {
        let selection = if self.data_source == DataSource::Internal {
            self.enable_debug_mode();
            registers::DATA_SOURCE_SELECT_INTERNAL
        } else {
            // FEE and DDG both arrive over the links.
            registers::DATA_SOURCE_SELECT_GBT
        };

        if self.features.data_selection {
            self.ctrl.set_data_source(selection);
        } else {
            warn!(
                "{} did not set data source, feature not supported by firmware",
                self.prefix
            );
        }

        if selection == registers::DATA_SOURCE_SELECT_GBT {
            // Never start from a live state; must precede the reset.
            self.config.disable_data_taking();
        }

        self.reset_cru();

        for link in &mut self.links {
            link.queue.clear();
            link.superpage_counter = 0;
        }
        self.ready_queue.clear();
        self.link_queues_total_available =
            (self.link_queue_capacity * self.links.len()) as i64;

        self.ctrl.start_dma_engine();
        thread::sleep(DMA_ENGINE_SETTLE);

        if selection == registers::DATA_SOURCE_SELECT_GBT {
            self.config.enable_data_taking();
        }
    }

    /// Stop taking data, draining latched completions and reclaiming
    /// whatever the card still holds.
    ///
    /// Calling this on a stopped channel logs and leaves it stopped.
    pub fn stop_dma(&mut self) -> Result<()> {
        match self.dma_state {
            DmaState::Unknown => {
                warn!("{} unknown DMA state", self.prefix);
            }
            DmaState::Stopped => {
                warn!("{} DMA already stopped, ignoring stop request", self.prefix);
            }
            DmaState::Started => {
                debug!("{} stopping DMA", self.prefix);
                self.device_stop_dma()?;
            }
        }
        self.dma_state = DmaState::Stopped;
        Ok(())
    }

    fn device_stop_dma(&mut self) -> Result<()> {
        self.ctrl.stop_dma_engine();
        self.config.disable_data_taking();

        // Completions the card latched before the stop are real data.
        self.fill_superpages()?;

        self.reclaim_superpages()
    }

    /// Return every in-flight superpage to the client, unfilled.
    fn reclaim_superpages(&mut self) -> Result<()> {
        for index in 0..self.links.len() {
            while !self.links[index].queue.is_empty() {
                self.transfer_superpage_from_link_to_ready(index, true)?;
            }
            debug_assert!(self.links[index].queue.is_empty());
        }
        Ok(())
    }

    /// Run the requested reset against a stopped channel.
    pub fn reset_channel(&mut self, level: ResetLevel) -> Result<()> {
        if level == ResetLevel::Nothing {
            return Ok(());
        }
        if self.dma_state == DmaState::Unknown {
            return Err(Error::State {
                channel: self.prefix.clone(),
                message: "reset channel failed, DMA in unknown state",
            });
        }
        if self.dma_state != DmaState::Stopped {
            return Err(Error::State {
                channel: self.prefix.clone(),
                message: "reset channel failed, DMA was not stopped",
            });
        }
        if level != ResetLevel::Internal {
            return Err(Error::UnsupportedResetLevel {
                channel: self.prefix.clone(),
                reset_level: level,
            });
        }

        debug!("{} resetting channel", self.prefix);
        self.reset_cru();
        Ok(())
    }

    fn reset_cru(&mut self) {
        self.ctrl.reset_data_generator_counter();
        thread::sleep(RESET_SETTLE);
        self.ctrl.reset_card();
        thread::sleep(RESET_SETTLE);
        self.ctrl.reset_internal_counters();
    }

    fn enable_debug_mode(&mut self) {
        if !self.ctrl.debug_mode_enabled() {
            self.ctrl.set_debug_mode_enabled(true);
            self.debug_register_dirty = true;
        }
    }

    /// Push-time invariant checks.
    fn check_superpage(&self, superpage: &Superpage) -> Result<()> {
        let reject = |message| {
            Err(Error::Superpage {
                channel: self.prefix.clone(),
                message,
                offset: superpage.offset,
                size: superpage.size,
            })
        };
        if superpage.size == 0 {
            return reject("size is zero");
        }
        if superpage.size % SUPERPAGE_SIZE_GRANULARITY != 0 {
            return reject("size not a multiple of 32 KiB");
        }
        if superpage.size % self.dma_page_size != 0 {
            return reject("size not a multiple of the DMA page size");
        }
        if superpage.offset + superpage.size > self.buffer.size() {
            return reject("region exceeds the buffer");
        }
        if superpage.offset % 4 != 0 {
            return reject("offset not 32-bit aligned");
        }
        Ok(())
    }

    /// The link with the shallowest queue; ties go to the lowest index.
    fn next_link_index(&self) -> usize {
        let mut smallest_index = 0;
        let mut smallest_len = usize::MAX;
        for (index, link) in self.links.iter().enumerate() {
            let len = link.queue.len();
            if len < smallest_len {
                smallest_index = index;
                smallest_len = len;
            }
        }
        smallest_index
    }

    /// Hand one superpage to the card.
    ///
    /// Returns `Ok(false)` when DMA is not started; the superpage is not
    /// taken. Every accepted superpage goes to the least-loaded link.
    pub fn push_superpage(&mut self, superpage: Superpage) -> Result<bool> {
        if self.dma_state != DmaState::Started {
            return Ok(false);
        }

        self.check_superpage(&superpage)?;

        if self.link_queues_total_available == 0 {
            return Err(Error::QueueFull {
                channel: self.prefix.clone(),
                queue: "transfer",
            });
        }

        let index = self.next_link_index();
        let link = &mut self.links[index];

        // Unreachable while the aggregate counter is consistent.
        if link.queue.len() >= self.link_queue_capacity {
            return Err(Error::QueueFull {
                channel: self.prefix.clone(),
                queue: "link",
            });
        }
        if link.queue.push_back(superpage).is_err() {
            return Err(Error::QueueFull {
                channel: self.prefix.clone(),
                queue: "link",
            });
        }
        self.link_queues_total_available -= 1;

        let dma_pages = superpage.size / self.dma_page_size;
        let bus_address = self.buffer.bus_offset_address(superpage.offset);
        self.ctrl
            .push_superpage_descriptor(link.id, dma_pages as u32, bus_address);

        self.first_superpage_pushed = true;
        Ok(true)
    }

    /// Harvest completions from every link into the ready queue.
    ///
    /// A full ready queue back-pressures the card: harvesting stops for
    /// that link and resumes on the next call, nothing is dropped.
    pub fn fill_superpages(&mut self) -> Result<()> {
        for index in 0..self.links.len() {
            let link = &self.links[index];
            let hw_count = self.ctrl.superpage_count(link.id);
            let mut available = hw_count.wrapping_sub(link.superpage_counter);

            if available as usize > link.queue.len() {
                let err = Error::FirmwareInvariantViolation {
                    channel: self.prefix.clone(),
                    link_id: link.id,
                    available,
                    in_flight: link.queue.len(),
                    harvested: link.superpage_counter,
                    reported: hw_count,
                };
                error!("{}", err);
                return Err(err);
            }

            while available > 0 {
                if self.ready_queue.len() >= self.ready_queue_capacity {
                    break;
                }
                self.transfer_superpage_from_link_to_ready(index, false)?;
                available -= 1;
            }
        }
        Ok(())
    }

    /// Move the head of one link queue to the ready queue.
    ///
    /// Not reclaiming marks the page ready and fills in the received byte
    /// count from the card (full size when the firmware cannot report
    /// sizes). Reclaiming returns the page unfilled.
    fn transfer_superpage_from_link_to_ready(
        &mut self,
        link_index: usize,
        reclaim: bool,
    ) -> Result<()> {
        let link = &mut self.links[link_index];
        let Some(front) = link.queue.front() else {
            return Err(Error::QueueEmpty {
                channel: self.prefix.clone(),
                message: "could not transfer superpage from link to ready queue, \
                          link queue is empty",
            });
        };

        let mut superpage = *front;
        if reclaim {
            superpage.ready = false;
            superpage.received = 0;
        } else {
            superpage.ready = true;
            let hw_size = self.ctrl.superpage_size(link.id);
            superpage.received = if hw_size == 0 {
                // Firmware without size reporting: claim the full page.
                superpage.size
            } else {
                hw_size as u64
            };
        }
        superpage.link_id = link.id;

        if self.ready_queue.push_back(superpage).is_err() {
            return Err(Error::QueueFull {
                channel: self.prefix.clone(),
                queue: "ready",
            });
        }
        link.queue.pop_front();
        link.superpage_counter = link.superpage_counter.wrapping_add(1);
        self.link_queues_total_available += 1;
        Ok(())
    }

    /// Peek the oldest completed superpage.
    pub fn superpage(&self) -> Result<Superpage> {
        self.ready_queue.front().copied().ok_or(Error::QueueEmpty {
            channel: self.prefix.clone(),
            message: "could not get superpage, ready queue was empty",
        })
    }

    /// Take the oldest completed superpage.
    pub fn pop_superpage(&mut self) -> Result<Superpage> {
        self.ready_queue.pop_front().ok_or(Error::QueueEmpty {
            channel: self.prefix.clone(),
            message: "could not pop superpage, ready queue was empty",
        })
    }

    /// Whether every link's descriptor FIFO stayed non-empty since the last
    /// check. An emptied FIFO means the card starved at least once.
    pub fn are_superpage_fifos_healthy(&mut self) -> bool {
        if self.dma_state != DmaState::Started || !self.first_superpage_pushed {
            return true;
        }

        let mut ok = true;
        for link in &self.links {
            let empty_counter = self.ctrl.superpage_fifo_empty_counter(link.id);
            if let Some(&previous) = self.empty_fifo_counters.get(&link.id) {
                if previous != empty_counter {
                    let due = self
                        .last_fifo_warning
                        .map(|at| at.elapsed() >= FIFO_HEALTH_LOG_INTERVAL)
                        .unwrap_or(true);
                    if due {
                        warn!(
                            "{} empty counter of superpage FIFO of link {} increased \
                             from {:#x} to {:#x}",
                            self.prefix, link.id, previous, empty_counter
                        );
                        self.last_fifo_warning = Some(Instant::now());
                    }
                    ok = false;
                }
            }
            self.empty_fifo_counters.insert(link.id, empty_counter);
        }
        ok
    }

    /// Free slots across all link queues.
    pub fn transfer_queue_available(&self) -> i64 {
        self.link_queues_total_available
    }

    /// The transfer queue is empty when every slot is available.
    pub fn is_transfer_queue_empty(&self) -> bool {
        self.link_queues_total_available
            == (self.link_queue_capacity * self.links.len()) as i64
    }

    pub fn ready_queue_size(&self) -> usize {
        self.ready_queue.len()
    }

    pub fn is_ready_queue_full(&self) -> bool {
        self.ready_queue.len() >= self.ready_queue_capacity
    }

    /// Packets the card dropped on this channel's endpoint.
    pub fn dropped_packets(&self) -> i32 {
        let endpoint = self.ctrl.endpoint_number();
        self.config.dropped_packets(endpoint)
    }

    /// Serial number, when the firmware exposes it.
    pub fn serial(&self) -> Option<i32> {
        self.features.serial.then(|| self.config.serial())
    }

    /// Die temperature in Celsius, when the firmware exposes it.
    pub fn temperature(&self) -> Option<f32> {
        self.features.temperature.then(|| self.config.temperature())
    }

    /// Firmware build info, when the firmware exposes it.
    pub fn firmware_info(&self) -> Option<String> {
        self.features.firmware_info.then(|| self.config.firmware_info())
    }

    /// Chip ID, when the firmware exposes it.
    pub fn card_id(&self) -> Option<String> {
        self.features.chip_id.then(|| self.config.card_id())
    }

    /// First-orbit counter of this channel's endpoint, -1 for an endpoint
    /// the driver does not know.
    pub fn counter_first_orbit(&self) -> i64 {
        let address: u32 = match self.ctrl.endpoint_number() {
            0 => 0x64_002C,
            1 => 0x74_002C,
            _ => return -1,
        };
        // Byte-addressed; register access is 32-bit words.
        self.config.read_register((address / 4) as usize) as i64
    }

    /// Fire one generator error into the stream. Refused when the FEE is
    /// the source, there is no generator in the path.
    pub fn inject_error(&mut self) -> bool {
        if self.data_source != DataSource::Fee {
            self.ctrl.data_generator_inject_error();
            true
        } else {
            false
        }
    }
}

impl Drop for CruDmaChannel {
    fn drop(&mut self) {
        self.ctrl.stop_dma_engine();
        if !self.ready_queue.is_empty() {
            debug!(
                "{} remaining superpages in the ready queue: {}",
                self.prefix,
                self.ready_queue.len()
            );
        }
        if self.data_source == DataSource::Internal && self.debug_register_dirty {
            self.ctrl.set_debug_mode_enabled(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryBufferProvider;
    use crate::hostmem::MemoryMap;
    use crate::parameters::{BufferParameters, CardId};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    const BUFFER_ADDRESS: usize = 0x7f00_0000_0000;
    const KIB: u64 = 1024;

    /// Simulated card shared between the two mock BAR handles.
    struct MockCard {
        features: Cell<FirmwareFeatures>,
        max_descriptors: Cell<u32>,
        links: RefCell<Vec<LinkId>>,
        endpoint: Cell<u32>,
        // Per-link completion state.
        completion_counts: RefCell<HashMap<LinkId, u32>>,
        completion_sizes: RefCell<HashMap<LinkId, VecDeque<u32>>>,
        empty_fifo_counters: RefCell<HashMap<LinkId, u32>>,
        // Observations.
        pushed: RefCell<Vec<(LinkId, u32, u64)>>,
        dma_armed: Cell<bool>,
        data_taking: Cell<bool>,
        debug_mode: Cell<bool>,
        resets: Cell<u32>,
        injected_errors: Cell<u32>,
        temperature_reads: Cell<u32>,
        registers: RefCell<HashMap<usize, u32>>,
        dropped: RefCell<HashMap<u32, i32>>,
    }

    impl MockCard {
        fn new(links: &[LinkId], max_descriptors: u32) -> Rc<Self> {
            Rc::new(Self {
                features: Cell::new(FirmwareFeatures::full()),
                max_descriptors: Cell::new(max_descriptors),
                links: RefCell::new(links.to_vec()),
                endpoint: Cell::new(0),
                completion_counts: RefCell::new(HashMap::new()),
                completion_sizes: RefCell::new(HashMap::new()),
                empty_fifo_counters: RefCell::new(HashMap::new()),
                pushed: RefCell::new(Vec::new()),
                dma_armed: Cell::new(false),
                data_taking: Cell::new(false),
                debug_mode: Cell::new(false),
                resets: Cell::new(0),
                injected_errors: Cell::new(0),
                temperature_reads: Cell::new(0),
                registers: RefCell::new(HashMap::new()),
                dropped: RefCell::new(HashMap::new()),
            })
        }

        /// The card completes the oldest in-flight superpage on a link.
        fn complete_superpage(&self, link_id: LinkId, received: u32) {
            *self
                .completion_counts
                .borrow_mut()
                .entry(link_id)
                .or_insert(0) += 1;
            self.completion_sizes
                .borrow_mut()
                .entry(link_id)
                .or_default()
                .push_back(received);
        }

        /// Pretend the firmware completed more than the driver pushed.
        fn force_completion_count(&self, link_id: LinkId, count: u32) {
            self.completion_counts.borrow_mut().insert(link_id, count);
        }
    }

    struct MockCtrl(Rc<MockCard>);
    struct MockConfig(Rc<MockCard>);

    impl CtrlBar for MockCtrl {
        fn firmware_features(&self) -> FirmwareFeatures {
            self.0.features.get()
        }
        fn max_superpage_descriptors(&self) -> u32 {
            self.0.max_descriptors.get()
        }
        fn set_data_source(&self, _selection: u32) {}
        fn start_dma_engine(&self) {
            self.0.dma_armed.set(true);
        }
        fn stop_dma_engine(&self) {
            self.0.dma_armed.set(false);
        }
        fn reset_card(&self) {
            self.0.resets.set(self.0.resets.get() + 1);
        }
        fn reset_data_generator_counter(&self) {}
        fn reset_internal_counters(&self) {}
        fn push_superpage_descriptor(&self, link_id: LinkId, dma_pages: u32, bus_address: u64) {
            self.0.pushed.borrow_mut().push((link_id, dma_pages, bus_address));
        }
        fn superpage_count(&self, link_id: LinkId) -> u32 {
            self.0
                .completion_counts
                .borrow()
                .get(&link_id)
                .copied()
                .unwrap_or(0)
        }
        fn superpage_size(&self, link_id: LinkId) -> u32 {
            self.0
                .completion_sizes
                .borrow_mut()
                .get_mut(&link_id)
                .and_then(|sizes| sizes.pop_front())
                .unwrap_or(0)
        }
        fn superpage_fifo_empty_counter(&self, link_id: LinkId) -> u32 {
            self.0
                .empty_fifo_counters
                .borrow()
                .get(&link_id)
                .copied()
                .unwrap_or(0)
        }
        fn endpoint_number(&self) -> u32 {
            self.0.endpoint.get()
        }
        fn debug_mode_enabled(&self) -> bool {
            self.0.debug_mode.get()
        }
        fn set_debug_mode_enabled(&self, enabled: bool) {
            self.0.debug_mode.set(enabled);
        }
        fn data_generator_inject_error(&self) {
            self.0.injected_errors.set(self.0.injected_errors.get() + 1);
        }
    }

    impl ConfigBar for MockConfig {
        fn data_taking_links(&self) -> Vec<LinkId> {
            self.0.links.borrow().clone()
        }
        fn enable_data_taking(&self) {
            self.0.data_taking.set(true);
        }
        fn disable_data_taking(&self) {
            self.0.data_taking.set(false);
        }
        fn dropped_packets(&self, endpoint: u32) -> i32 {
            self.0
                .dropped
                .borrow()
                .get(&endpoint)
                .copied()
                .unwrap_or(0)
        }
        fn serial(&self) -> i32 {
            11225
        }
        fn temperature(&self) -> f32 {
            self.0.temperature_reads.set(self.0.temperature_reads.get() + 1);
            41.5
        }
        fn firmware_info(&self) -> String {
            "20260412-00c0ffee-00000001".to_string()
        }
        fn card_id(&self) -> String {
            "0badcafe00000001".to_string()
        }
        fn read_register(&self, word_index: usize) -> u32 {
            self.0
                .registers
                .borrow()
                .get(&word_index)
                .copied()
                .unwrap_or(0)
        }
    }

    fn hugepage_host(buffer_size: u64) -> HostMemoryInfo {
        HostMemoryInfo {
            maps: vec![MemoryMap {
                address_start: BUFFER_ADDRESS as u64,
                address_end: BUFFER_ADDRESS as u64 + buffer_size,
                page_size_kib: 2048,
            }],
            iommu_enabled: false,
        }
    }

    fn parameters(data_source: DataSource) -> Parameters {
        Parameters::new(CardId::Serial(12345), 0)
            .with_data_source(data_source)
            .with_buffer_parameters(BufferParameters::Memory {
                address: BUFFER_ADDRESS,
                size: 1024 * KIB as usize,
            })
    }

    fn channel_with(
        card: &Rc<MockCard>,
        data_source: DataSource,
        buffer_size: usize,
    ) -> CruDmaChannel {
        let buffer = MemoryBufferProvider::identity_mapped(BUFFER_ADDRESS, buffer_size);
        CruDmaChannel::new(
            &parameters(data_source),
            Box::new(MockCtrl(card.clone())),
            Box::new(MockConfig(card.clone())),
            Box::new(buffer),
            &hugepage_host(buffer_size as u64),
        )
        .unwrap()
    }

    fn started_channel(card: &Rc<MockCard>, buffer_size: usize) -> CruDmaChannel {
        let mut channel = channel_with(card, DataSource::Internal, buffer_size);
        channel.start_dma().unwrap();
        channel
    }

    #[test]
    fn test_happy_path_single_link() {
        let card = MockCard::new(&[0], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        let size = 256 * KIB;
        for i in 0..4 {
            let accepted = channel.push_superpage(Superpage::new(i * size, size)).unwrap();
            assert!(accepted);
        }
        assert_eq!(channel.transfer_queue_available(), 0);

        for _ in 0..4 {
            card.complete_superpage(0, size as u32);
            channel.fill_superpages().unwrap();
        }

        assert_eq!(channel.ready_queue_size(), 4);
        for i in 0..4 {
            let superpage = channel.pop_superpage().unwrap();
            assert_eq!(superpage.offset, i * size);
            assert_eq!(superpage.size, size);
            assert!(superpage.ready);
            assert_eq!(superpage.received, 262144);
            assert_eq!(superpage.link_id, 0);
        }
        assert!(channel.is_transfer_queue_empty());
    }

    #[test]
    fn test_least_loaded_round_robin() {
        let card = MockCard::new(&[0, 1, 2], 2);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        for i in 0..6 {
            channel
                .push_superpage(Superpage::new(i * 32 * KIB, 32 * KIB))
                .unwrap();
        }

        let pushed_links: Vec<LinkId> =
            card.pushed.borrow().iter().map(|(id, _, _)| *id).collect();
        assert_eq!(pushed_links, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(channel.transfer_queue_available(), 0);
    }

    #[test]
    fn test_descriptor_contents() {
        let card = MockCard::new(&[5], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        channel
            .push_superpage(Superpage::new(64 * KIB, 64 * KIB))
            .unwrap();

        let pushed = card.pushed.borrow();
        let (link_id, dma_pages, bus_address) = pushed[0];
        assert_eq!(link_id, 5);
        // 64 KiB in 8 KiB DMA pages.
        assert_eq!(dma_pages, 8);
        assert_eq!(bus_address, BUFFER_ADDRESS as u64 + 64 * KIB);
    }

    #[test]
    fn test_push_not_started_returns_false() {
        let card = MockCard::new(&[0], 4);
        let mut channel = channel_with(&card, DataSource::Internal, 1024 * KIB as usize);
        let accepted = channel
            .push_superpage(Superpage::new(0, 32 * KIB))
            .unwrap();
        assert!(!accepted);
        assert!(card.pushed.borrow().is_empty());
    }

    #[test]
    fn test_push_invariant_violations() {
        let card = MockCard::new(&[0], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        let cases = [
            Superpage::new(0, 0),
            Superpage::new(0, 32 * KIB - 4),
            Superpage::new(1024 * KIB - 32 * KIB + 4, 32 * KIB),
            Superpage::new(2, 32 * KIB),
        ];
        for superpage in cases {
            let result = channel.push_superpage(superpage);
            assert!(
                matches!(result, Err(Error::Superpage { .. })),
                "expected superpage error for {:?}",
                superpage
            );
        }
        // Nothing reached the card, nothing was accounted.
        assert!(card.pushed.borrow().is_empty());
        assert!(channel.is_transfer_queue_empty());
    }

    #[test]
    fn test_transfer_queue_full() {
        let card = MockCard::new(&[0, 1], 1);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        assert!(channel.push_superpage(Superpage::new(0, 32 * KIB)).unwrap());
        assert!(channel
            .push_superpage(Superpage::new(32 * KIB, 32 * KIB))
            .unwrap());
        let result = channel.push_superpage(Superpage::new(64 * KIB, 32 * KIB));
        assert!(matches!(result, Err(Error::QueueFull { queue: "transfer", .. })));
    }

    #[test]
    fn test_last_slot_goes_to_the_link_owning_it() {
        let card = MockCard::new(&[0, 1], 2);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        // Fill link 0 fully and link 1 partially by completing nothing.
        for i in 0..3 {
            channel
                .push_superpage(Superpage::new(i * 32 * KIB, 32 * KIB))
                .unwrap();
        }
        assert_eq!(channel.transfer_queue_available(), 1);

        channel
            .push_superpage(Superpage::new(96 * KIB, 32 * KIB))
            .unwrap();
        let pushed_links: Vec<LinkId> =
            card.pushed.borrow().iter().map(|(id, _, _)| *id).collect();
        // Last push must land on link 1, the only one with a free slot.
        assert_eq!(pushed_links, vec![0, 1, 0, 1]);
        assert_eq!(channel.transfer_queue_available(), 0);
    }

    #[test]
    fn test_fill_firmware_invariant_violation() {
        let card = MockCard::new(&[0], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        channel.push_superpage(Superpage::new(0, 32 * KIB)).unwrap();
        // Firmware claims one more completion than in-flight descriptors.
        card.force_completion_count(0, 2);

        let result = channel.fill_superpages();
        assert!(matches!(
            result,
            Err(Error::FirmwareInvariantViolation { link_id: 0, available: 2, in_flight: 1, .. })
        ));
    }

    #[test]
    fn test_full_size_fallback_when_firmware_reports_zero() {
        let card = MockCard::new(&[0], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        channel
            .push_superpage(Superpage::new(0, 64 * KIB))
            .unwrap();
        // Count advances but the size register reads zero.
        *card.completion_counts.borrow_mut().entry(0).or_insert(0) += 1;

        channel.fill_superpages().unwrap();
        let superpage = channel.pop_superpage().unwrap();
        assert!(superpage.ready);
        assert_eq!(superpage.received, 64 * KIB);
    }

    #[test]
    fn test_reclaim_on_stop() {
        let card = MockCard::new(&[0], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        for i in 0..3 {
            channel
                .push_superpage(Superpage::new(i * 32 * KIB, 32 * KIB))
                .unwrap();
        }
        card.complete_superpage(0, 32 * KIB as u32);

        channel.stop_dma().unwrap();
        assert_eq!(channel.dma_state(), DmaState::Stopped);
        assert!(!card.dma_armed.get());
        assert_eq!(channel.ready_queue_size(), 3);

        let first = channel.pop_superpage().unwrap();
        assert!(first.ready);
        assert_eq!(first.received, 32 * KIB);
        for _ in 0..2 {
            let reclaimed = channel.pop_superpage().unwrap();
            assert!(!reclaimed.ready);
            assert_eq!(reclaimed.received, 0);
        }
        assert!(channel.is_transfer_queue_empty());
    }

    #[test]
    fn test_stop_and_start_are_idempotent() {
        let card = MockCard::new(&[0], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        channel.start_dma().unwrap();
        assert_eq!(channel.dma_state(), DmaState::Started);

        channel.stop_dma().unwrap();
        channel.stop_dma().unwrap();
        assert_eq!(channel.dma_state(), DmaState::Stopped);
    }

    #[test]
    fn test_start_resets_bookkeeping() {
        let card = MockCard::new(&[0], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        channel.push_superpage(Superpage::new(0, 32 * KIB)).unwrap();
        card.complete_superpage(0, 32 * KIB as u32);
        channel.fill_superpages().unwrap();
        channel.stop_dma().unwrap();

        // The card forgets completions across the reset; so must the driver.
        card.completion_counts.borrow_mut().clear();
        card.completion_sizes.borrow_mut().clear();
        channel.start_dma().unwrap();

        assert_eq!(channel.ready_queue_size(), 0);
        assert!(channel.is_transfer_queue_empty());
        assert!(card.dma_armed.get());
    }

    #[test]
    fn test_ready_queue_backpressure() {
        let card = MockCard::new(&[0], 2);
        let mut channel = started_channel(&card, 1024 * KIB as usize);
        // Shrink the ready queue to one slot to make back-pressure visible.
        channel.ready_queue_capacity = 1;
        channel.ready_queue = SuperpageQueue::new(2);

        channel.push_superpage(Superpage::new(0, 32 * KIB)).unwrap();
        channel
            .push_superpage(Superpage::new(32 * KIB, 32 * KIB))
            .unwrap();
        card.complete_superpage(0, 32 * KIB as u32);
        card.complete_superpage(0, 32 * KIB as u32);

        channel.fill_superpages().unwrap();
        assert_eq!(channel.ready_queue_size(), 1);
        assert!(channel.is_ready_queue_full());

        // Popping frees the slot; the next harvest resumes where it left off.
        let first = channel.pop_superpage().unwrap();
        assert_eq!(first.offset, 0);
        channel.fill_superpages().unwrap();
        let second = channel.pop_superpage().unwrap();
        assert_eq!(second.offset, 32 * KIB);
    }

    #[test]
    fn test_get_and_pop_empty_ready_queue() {
        let card = MockCard::new(&[0], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);
        assert!(matches!(channel.superpage(), Err(Error::QueueEmpty { .. })));
        assert!(matches!(
            channel.pop_superpage(),
            Err(Error::QueueEmpty { .. })
        ));
    }

    #[test]
    fn test_get_peeks_without_consuming() {
        let card = MockCard::new(&[0], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);
        channel.push_superpage(Superpage::new(0, 32 * KIB)).unwrap();
        card.complete_superpage(0, 1234);
        channel.fill_superpages().unwrap();

        let peeked = channel.superpage().unwrap();
        let popped = channel.pop_superpage().unwrap();
        assert_eq!(peeked, popped);
        assert_eq!(popped.received, 1234);
    }

    #[test]
    fn test_construction_rejects_diu_and_siu() {
        for source in [DataSource::Diu, DataSource::Siu] {
            let card = MockCard::new(&[0], 4);
            let buffer =
                MemoryBufferProvider::identity_mapped(BUFFER_ADDRESS, 1024 * KIB as usize);
            let result = CruDmaChannel::new(
                &parameters(source),
                Box::new(MockCtrl(card.clone())),
                Box::new(MockConfig(card.clone())),
                Box::new(buffer),
                &hugepage_host(1024 * KIB),
            );
            assert!(matches!(
                result,
                Err(Error::UnsupportedDataSource { data_source, .. }) if data_source == source
            ));
        }
    }

    #[test]
    fn test_construction_rejects_nonzero_channel() {
        let card = MockCard::new(&[0], 4);
        let buffer = MemoryBufferProvider::identity_mapped(BUFFER_ADDRESS, 1024 * KIB as usize);
        let params = Parameters::new(CardId::Serial(12345), 1);
        let result = CruDmaChannel::new(
            &params,
            Box::new(MockCtrl(card.clone())),
            Box::new(MockConfig(card.clone())),
            Box::new(buffer),
            &hugepage_host(1024 * KIB),
        );
        assert!(matches!(result, Err(Error::Parameter { .. })));
    }

    #[test]
    fn test_construction_requires_links() {
        let card = MockCard::new(&[], 4);
        let buffer = MemoryBufferProvider::identity_mapped(BUFFER_ADDRESS, 1024 * KIB as usize);
        let result = CruDmaChannel::new(
            &parameters(DataSource::Internal),
            Box::new(MockCtrl(card.clone())),
            Box::new(MockConfig(card.clone())),
            Box::new(buffer),
            &hugepage_host(1024 * KIB),
        );
        assert!(matches!(result, Err(Error::NoLinksEnabled { .. })));
    }

    #[test]
    fn test_construction_falls_back_to_default_descriptor_depth() {
        let card = MockCard::new(&[0, 1], 0);
        let channel = channel_with(&card, DataSource::Internal, 1024 * KIB as usize);
        assert_eq!(
            channel.transfer_queue_available(),
            (MAX_SUPERPAGE_DESCRIPTORS_DEFAULT * 2) as i64
        );
    }

    #[test]
    fn test_construction_rejects_non_hugepage_without_iommu() {
        let card = MockCard::new(&[0], 4);
        let buffer = MemoryBufferProvider::identity_mapped(BUFFER_ADDRESS, 1024 * KIB as usize);
        let host = HostMemoryInfo {
            maps: vec![MemoryMap {
                address_start: BUFFER_ADDRESS as u64,
                address_end: BUFFER_ADDRESS as u64 + 1024 * KIB,
                page_size_kib: 4,
            }],
            iommu_enabled: false,
        };
        let result = CruDmaChannel::new(
            &parameters(DataSource::Internal),
            Box::new(MockCtrl(card.clone())),
            Box::new(MockConfig(card.clone())),
            Box::new(buffer),
            &host,
        );
        match result {
            Err(Error::BufferConfig { message, .. }) => {
                assert!(message.contains("roc-setup-hugetlbfs"));
            }
            other => panic!("expected buffer config error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_construction_accepts_non_hugepage_with_iommu() {
        let card = MockCard::new(&[0], 4);
        let buffer = MemoryBufferProvider::identity_mapped(BUFFER_ADDRESS, 1024 * KIB as usize);
        let host = HostMemoryInfo {
            maps: vec![MemoryMap {
                address_start: BUFFER_ADDRESS as u64,
                address_end: BUFFER_ADDRESS as u64 + 1024 * KIB,
                page_size_kib: 4,
            }],
            iommu_enabled: true,
        };
        assert!(CruDmaChannel::new(
            &parameters(DataSource::Internal),
            Box::new(MockCtrl(card.clone())),
            Box::new(MockConfig(card.clone())),
            Box::new(buffer),
            &host,
        )
        .is_ok());
    }

    #[test]
    fn test_construction_rejects_suspicious_scatter_gather_list() {
        let card = MockCard::new(&[0], 4);
        // 1 MiB buffer claiming two SG entries: more than size / 2 MiB.
        let sg_list = vec![
            crate::buffer::ScatterGatherEntry {
                offset: 0,
                size: 512 * KIB,
                bus_address: 0xA000_0000,
            },
            crate::buffer::ScatterGatherEntry {
                offset: 512 * KIB,
                size: 512 * KIB,
                bus_address: 0xB000_0000,
            },
        ];
        let buffer =
            MemoryBufferProvider::new(BUFFER_ADDRESS, 1024 * KIB as usize, sg_list);
        let result = CruDmaChannel::new(
            &parameters(DataSource::Internal),
            Box::new(MockCtrl(card.clone())),
            Box::new(MockConfig(card.clone())),
            Box::new(buffer),
            &hugepage_host(1024 * KIB),
        );
        assert!(matches!(result, Err(Error::BufferConfig { .. })));
    }

    #[test]
    fn test_null_buffer_passes_preflight() {
        let card = MockCard::new(&[0], 4);
        let params = Parameters::new(CardId::Serial(12345), 0)
            .with_buffer_parameters(BufferParameters::Null);
        let channel = CruDmaChannel::new(
            &params,
            Box::new(MockCtrl(card.clone())),
            Box::new(MockConfig(card.clone())),
            Box::new(crate::buffer::NullBufferProvider),
            &HostMemoryInfo::default(),
        );
        assert!(channel.is_ok());
    }

    #[test]
    fn test_reset_requires_stopped() {
        let card = MockCard::new(&[0], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);
        let result = channel.reset_channel(ResetLevel::Internal);
        assert!(matches!(result, Err(Error::State { .. })));

        channel.stop_dma().unwrap();
        let resets_before = card.resets.get();
        channel.reset_channel(ResetLevel::Internal).unwrap();
        assert_eq!(card.resets.get(), resets_before + 1);
    }

    #[test]
    fn test_reset_nothing_is_a_noop() {
        let card = MockCard::new(&[0], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);
        // No-op even while started.
        channel.reset_channel(ResetLevel::Nothing).unwrap();
        assert_eq!(channel.dma_state(), DmaState::Started);
    }

    #[test]
    fn test_reset_rejects_legacy_levels() {
        let card = MockCard::new(&[0], 4);
        let mut channel = channel_with(&card, DataSource::Internal, 1024 * KIB as usize);
        for level in [ResetLevel::InternalDiu, ResetLevel::InternalDiuSiu] {
            let result = channel.reset_channel(level);
            assert!(matches!(
                result,
                Err(Error::UnsupportedResetLevel { reset_level, .. }) if reset_level == level
            ));
        }
    }

    #[test]
    fn test_feature_gated_telemetry() {
        let card = MockCard::new(&[0], 4);
        card.features.set(FirmwareFeatures {
            temperature: false,
            ..FirmwareFeatures::full()
        });
        let channel = channel_with(&card, DataSource::Internal, 1024 * KIB as usize);

        assert_eq!(channel.temperature(), None);
        // The gate must short-circuit before any register access.
        assert_eq!(card.temperature_reads.get(), 0);

        assert_eq!(channel.serial(), Some(11225));
        assert!(channel.firmware_info().is_some());
        assert!(channel.card_id().is_some());
    }

    #[test]
    fn test_counter_first_orbit_endpoints() {
        let card = MockCard::new(&[0], 4);
        card.endpoint.set(1);
        card.registers
            .borrow_mut()
            .insert(0x74_002C / 4, 0xDEAD_BEEF);
        let channel = channel_with(&card, DataSource::Internal, 1024 * KIB as usize);
        assert_eq!(channel.counter_first_orbit(), 0xDEAD_BEEF);

        card.endpoint.set(0);
        card.registers
            .borrow_mut()
            .insert(0x64_002C / 4, 0x0000_0042);
        assert_eq!(channel.counter_first_orbit(), 0x42);

        card.endpoint.set(2);
        assert_eq!(channel.counter_first_orbit(), -1);
    }

    #[test]
    fn test_dropped_packets_uses_own_endpoint() {
        let card = MockCard::new(&[0], 4);
        card.endpoint.set(1);
        card.dropped.borrow_mut().insert(1, 77);
        card.dropped.borrow_mut().insert(0, -1);
        let channel = channel_with(&card, DataSource::Internal, 1024 * KIB as usize);
        assert_eq!(channel.dropped_packets(), 77);
    }

    #[test]
    fn test_inject_error_gated_on_data_source() {
        let card = MockCard::new(&[0], 4);
        let mut channel = channel_with(&card, DataSource::Internal, 1024 * KIB as usize);
        assert!(channel.inject_error());
        assert_eq!(card.injected_errors.get(), 1);

        let card = MockCard::new(&[0], 4);
        let mut channel = channel_with(&card, DataSource::Fee, 1024 * KIB as usize);
        assert!(!channel.inject_error());
        assert_eq!(card.injected_errors.get(), 0);
    }

    #[test]
    fn test_fifo_health_tracks_empty_counter() {
        let card = MockCard::new(&[0], 4);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        // Healthy while nothing was pushed yet.
        assert!(channel.are_superpage_fifos_healthy());

        channel.push_superpage(Superpage::new(0, 32 * KIB)).unwrap();
        // First observation just primes the counter.
        assert!(channel.are_superpage_fifos_healthy());
        assert!(channel.are_superpage_fifos_healthy());

        card.empty_fifo_counters.borrow_mut().insert(0, 3);
        assert!(!channel.are_superpage_fifos_healthy());
        // Counter stable again: healthy.
        assert!(channel.are_superpage_fifos_healthy());
    }

    #[test]
    fn test_fifo_health_trivially_true_when_stopped() {
        let card = MockCard::new(&[0], 4);
        let mut channel = channel_with(&card, DataSource::Internal, 1024 * KIB as usize);
        card.empty_fifo_counters.borrow_mut().insert(0, 9);
        assert!(channel.are_superpage_fifos_healthy());
    }

    #[test]
    fn test_available_accounting_invariant() {
        let card = MockCard::new(&[0, 1], 3);
        let mut channel = started_channel(&card, 1024 * KIB as usize);

        let expected = |channel: &CruDmaChannel| -> i64 {
            channel
                .links
                .iter()
                .map(|link| (channel.link_queue_capacity - link.queue.len()) as i64)
                .sum()
        };

        assert_eq!(channel.transfer_queue_available(), expected(&channel));
        for i in 0..5 {
            channel
                .push_superpage(Superpage::new(i * 32 * KIB, 32 * KIB))
                .unwrap();
            assert_eq!(channel.transfer_queue_available(), expected(&channel));
        }
        card.complete_superpage(0, 32 * KIB as u32);
        card.complete_superpage(1, 32 * KIB as u32);
        channel.fill_superpages().unwrap();
        assert_eq!(channel.transfer_queue_available(), expected(&channel));

        channel.stop_dma().unwrap();
        assert_eq!(channel.transfer_queue_available(), expected(&channel));
        assert!(channel.is_transfer_queue_empty());
    }

    #[test]
    fn test_debug_mode_cleared_on_drop() {
        let card = MockCard::new(&[0], 4);
        {
            let mut channel = channel_with(&card, DataSource::Internal, 1024 * KIB as usize);
            channel.start_dma().unwrap();
            assert!(card.debug_mode.get());
        }
        assert!(!card.debug_mode.get());
        assert!(!card.dma_armed.get());
    }
}
