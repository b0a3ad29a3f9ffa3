use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A USB transfer failed or was truncated.
    #[error("USB transport error: {0}")]
    Transport(#[from] rusb::Error),

    /// A firmware image file could not be read.
    #[error("firmware image I/O error: {0}")]
    Io(#[from] io::Error),

    /// The firmware image file was empty.
    #[error("firmware image is empty")]
    EmptyImage,

    /// The device reported `errVENDOR` for a DNLOAD: flash is read-only
    /// protected.
    #[error("read-only protection active")]
    ReadOnlyProtection,

    /// The device reported `errTARGET` for a DNLOAD: address pointer was
    /// rejected.
    #[error("invalid address error")]
    InvalidAddress,

    /// The device reported some other DFU status code for a DNLOAD.
    #[error("unknown DFU error ({0})")]
    UnknownDfuStatus(u8),

    /// The firmware image is too large for the adapter's effective flash
    /// size.
    #[error("firmware image ({image_size} bytes) exceeds available flash ({available} bytes)")]
    ImageTooLarge { image_size: usize, available: usize },

    /// No candidate adapter answered after a full enumeration/rescan pass.
    #[error("no bootloader-mode adapter found")]
    NotFound,
}
