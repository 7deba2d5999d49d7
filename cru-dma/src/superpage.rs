//! The superpage record exchanged between client and driver.

/// A contiguous, bus-addressable region of the registered buffer, submitted
/// to the card to receive link data.
///
/// The client fills in `offset` and `size`; the driver sets `received`,
/// `ready` and `link_id` when the region comes back through the ready queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Superpage {
    /// Byte offset into the registered buffer. Must be 32-bit aligned.
    pub offset: u64,
    /// Length in bytes. Must be a non-zero multiple of 32 KiB.
    pub size: u64,
    /// Bytes actually filled, set on completion.
    pub received: u64,
    /// True once the hardware has reported the region complete.
    pub ready: bool,
    /// The link that produced the data, set by the driver.
    pub link_id: u16,
}

impl Superpage {
    /// Build a request for the given buffer region.
    pub fn new(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            received: 0,
            ready: false,
            link_id: 0,
        }
    }
}
