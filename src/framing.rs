// ABOUTME: Defines the FramingProtocol trait, a stateless function over a byte window
// ABOUTME: Provides LengthPrefixedProtocol and RawProtocol, the two built-in framings

//! Framing protocol contract — spec.md §4.2.
//!
//! A framing protocol is a stateless function over a byte window: given
//! whatever bytes have accumulated so far, report whether a complete frame is
//! present, more data is needed, or the stream is unrecoverably malformed.
//! This mirrors `examples/original_source/include/server_protocol.h`'s
//! `ParsePackage`/`PackageStatus` pair, generalized from its three-variant
//! enum into one that also carries the parsed lengths.

/// Result of applying a [`FramingProtocol`] to the current receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Not enough bytes yet to determine whether a frame is complete.
    Incomplete,
    /// A complete frame is present. `frame_len` is the total on-wire size
    /// (including any length header); `payload_len` is the portion handed to
    /// the user's message handler.
    Complete { frame_len: usize, payload_len: usize },
    /// The window can never yield a valid frame; the connection must close.
    Fatal,
}

/// A stateless frame parser. Implementations must not mutate `window`, and
/// must be safe to call repeatedly as more bytes accumulate.
pub trait FramingProtocol: Send + Sync {
    /// Inspect the current receive window and report what can be determined
    /// about the frame at its head.
    fn parse(&self, window: &[u8]) -> FrameOutcome;
}

/// The 4-byte-big-endian-length-prefixed framing protocol from spec.md §4.2.
///
/// The first 4 bytes are a big-endian `u32` giving the *total* frame length,
/// header included. Valid totals are `[4, 65_535]`; anything else is fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixedProtocol;

impl LengthPrefixedProtocol {
    const HEADER_LEN: usize = 4;
    const MAX_TOTAL_LEN: usize = 65_535;

    /// Encode `payload` as a complete wire frame: 4-byte big-endian total
    /// length, then the payload.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let total = payload.len() + Self::HEADER_LEN;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

impl FramingProtocol for LengthPrefixedProtocol {
    fn parse(&self, window: &[u8]) -> FrameOutcome {
        if window.len() < Self::HEADER_LEN {
            return FrameOutcome::Incomplete;
        }
        let total = u32::from_be_bytes([window[0], window[1], window[2], window[3]]) as usize;
        if !(Self::HEADER_LEN..=Self::MAX_TOTAL_LEN).contains(&total) {
            return FrameOutcome::Fatal;
        }
        if window.len() < total {
            return FrameOutcome::Incomplete;
        }
        FrameOutcome::Complete {
            frame_len: total,
            payload_len: total - Self::HEADER_LEN,
        }
    }
}

/// The degenerate protocol used when no framing protocol is attached: each
/// readable chunk currently sitting in the window is delivered as one
/// logical message, immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawProtocol;

impl FramingProtocol for RawProtocol {
    fn parse(&self, window: &[u8]) -> FrameOutcome {
        if window.is_empty() {
            FrameOutcome::Incomplete
        } else {
            FrameOutcome::Complete {
                frame_len: window.len(),
                payload_len: window.len(),
            }
        }
    }
}
