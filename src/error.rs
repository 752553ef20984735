use thiserror::Error;

/// Errors surfaced by the encoding and decoding pipelines.
///
/// Encoding is strict: parameter and budget violations abort the tile.
/// Decoding is lenient where the format allows it; recoverable bitstream
/// damage is reported through [`crate::tcd::DecodeStatus`] instead of this
/// type, and only unrecoverable conditions (bad configuration, geometry
/// that cannot be set up) end up here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum J2kError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("image geometry is inconsistent: {0}")]
    InvalidImage(&'static str),

    #[error("tile {tile}: no pass selection fits the rate budget")]
    RateBudget { tile: u32 },

    #[error("packet would exceed the remaining byte budget")]
    PacketBudget,

    #[error("tile {tile}: packet stream ends early at byte {offset}")]
    TruncatedStream { tile: u32, offset: usize },

    #[error("malformed packet header: {0}")]
    MalformedPacket(&'static str),

    #[error("tile {tile}: cannot discard {reduce} resolution levels, component has only {available}")]
    ReduceTooLarge {
        tile: u32,
        reduce: u32,
        available: u32,
    },

    #[error("destination too small")]
    DestinationTooSmall,
}
