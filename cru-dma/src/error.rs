//! Error kinds surfaced by the driver.
//!
//! Every channel-level error message leads with a prefix identifying the
//! card and channel it came from, and carries the violating value where
//! there is one. Construction-time errors are fatal to the channel; no
//! partially constructed channel is ever handed out.

use thiserror::Error;

use crate::parameters::{DataSource, ResetLevel};

/// The result of a driver operation.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing configuration.
    #[error("{channel} {message}")]
    Parameter { channel: String, message: String },

    /// A data source this card family cannot provide.
    #[error("{channel} CRU does not support data source {data_source}")]
    UnsupportedDataSource {
        channel: String,
        data_source: DataSource,
    },

    /// A reset level this card family cannot run.
    #[error("{channel} the CRU can only be reset internally (requested {reset_level})")]
    UnsupportedResetLevel {
        channel: String,
        reset_level: ResetLevel,
    },

    /// The buffer cannot be used for DMA as configured.
    #[error("{channel} {message}")]
    BufferConfig { channel: String, message: String },

    /// A superpage failed a push-time invariant.
    #[error("{channel} could not enqueue superpage: {message} (offset {offset:#x}, size {size:#x})")]
    Superpage {
        channel: String,
        message: &'static str,
        offset: u64,
        size: u64,
    },

    /// Push attempted with no slot available.
    #[error("{channel} could not push superpage, {queue} queue was full")]
    QueueFull {
        channel: String,
        queue: &'static str,
    },

    /// Get or pop attempted on an empty queue.
    #[error("{channel} {message}")]
    QueueEmpty {
        channel: String,
        message: &'static str,
    },

    /// An operation ran against the wrong DMA state.
    #[error("{channel} {message}")]
    State { channel: String, message: &'static str },

    /// The firmware reported more completions than the driver ever pushed.
    /// Fatal: the descriptor FIFO is corrupt or a push was lost.
    #[error(
        "{channel} FATAL: firmware reported more superpages available ({available}) than present \
         in FIFO ({in_flight}) on link {link_id}; {harvested} harvested according to driver, \
         {reported} pushed according to firmware"
    )]
    FirmwareInvariantViolation {
        channel: String,
        link_id: u16,
        available: u32,
        in_flight: usize,
        harvested: u32,
        reported: u32,
    },

    /// Construction found zero data-taking links.
    #[error("{channel} no links are enabled; check with roc-status, configure with roc-config")]
    NoLinksEnabled { channel: String },

    /// Operation valid only on a different card type.
    #[error("{channel} {message}")]
    UnsupportedCard { channel: String, message: String },

    /// A system call against the device or buffer failed.
    #[error("{channel} {message}: {source}")]
    Io {
        channel: String,
        message: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// A short stable name for the error kind, for logging and exit-code
    /// mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Parameter { .. }
            | Error::UnsupportedDataSource { .. }
            | Error::UnsupportedResetLevel { .. } => "parameter",
            Error::BufferConfig { .. } => "buffer-config",
            Error::Superpage { .. } => "superpage",
            Error::QueueFull { .. } => "queue-full",
            Error::QueueEmpty { .. } => "queue-empty",
            Error::State { .. } => "state",
            Error::FirmwareInvariantViolation { .. } => "firmware-invariant",
            Error::NoLinksEnabled { .. } => "no-links",
            Error::UnsupportedCard { .. } => "unsupported-card",
            Error::Io { .. } => "io",
        }
    }
}
