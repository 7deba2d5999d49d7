//! Host-side DMA driver for the CRU PCIe readout card.
//!
//! The card streams event data from its optical links into host memory by
//! bus-mastering DMA. The driver keeps the card supplied with large,
//! page-aligned buffer regions (superpages), polls for their completion, and
//! hands filled regions back to the client in completion order.
//!
//! The center of the crate is [`channel::CruDmaChannel`]; everything around
//! it is a capability it consumes: [`bar`] for register access, [`buffer`]
//! for the registered DMA region, [`hostmem`] for the facts the buffer
//! pre-flight validates, [`pci`] for finding the card. [`factory`] wires the
//! real implementations together.

pub mod bar;
pub mod buffer;
pub mod channel;
pub mod error;
pub mod factory;
pub mod firmware;
pub mod hostmem;
pub mod parameters;
pub mod pci;
pub mod superpage;

pub use bar::{ConfigBar, CtrlBar, LinkId};
pub use buffer::BufferProvider;
pub use channel::{CruDmaChannel, DmaState};
pub use error::{Error, Result};
pub use factory::ChannelFactory;
pub use parameters::{BufferParameters, CardId, DataSource, Parameters, ResetLevel};
pub use superpage::Superpage;
