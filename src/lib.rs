//! A Rust library implementing the demultiplexer core for MPEG-DASH media streams.
//!
//! [DASH](https://en.wikipedia.org/wiki/Dynamic_Adaptive_Streaming_over_HTTP) (dynamic adaptive
//! streaming over HTTP), also called MPEG-DASH, is a technology used for media streaming over the
//! web, for video on demand as well as live/OTT TV. The Media Presentation Description (MPD) is an
//! XML manifest describing the resources forming a streaming service. This library parses the
//! manifest (as formally defined in ISO/IEC standard 23009-1), selects the active Period, admits
//! the video, audio and subtitle Representations it finds there, computes the segment schedule for
//! both static (VOD) and dynamic (live) presentations, and streams initialization plus media
//! segments to a nested container demultiplexer supplied by the caller.
//!
//! Each Representation is presented as a continuous byte stream (initialization section followed by
//! media fragments in segment order). The top-level demultiplexer pulls packets from the nested
//! demuxers in `(segment number, timestamp)` order, rescales their timestamps to a fixed 90 kHz
//! clock and attaches per-segment metadata. For dynamic presentations the manifest is refreshed and
//! reconciled in place whenever a reader outruns the published schedule.
//!
//! ## DASH features supported
//!
//! - VOD (static) and live (dynamic) stream manifests
//! - Segment addressing via SegmentTemplate with SegmentTimeline, SegmentTemplate@duration,
//!   SegmentList, and single-file BaseURL
//! - Manifest refresh with timeline splicing and Period transitions
//! - Per-stream enable/disable (discard flags) with catch-up on re-enable
//!
//! ## Limitations / unsupported features
//!
//! - Encrypted content using DRM
//! - Switching between Periods during playback (a single Period is active)
//! - Byte-range seeking at the presentation layer
//
//
// Reference dash.js library: https://github.com/Dash-Industry-Forum/dash.js
// Google Shaka player: https://github.com/google/shaka-player
// The DASH code in VLC: https://code.videolan.org/videolan/vlc/-/tree/master/modules/demux/dash

#![allow(non_snake_case)]

pub mod mpd;
pub mod manifest;
pub mod scheduler;
pub mod refresh;
pub mod transport;
pub mod reader;
pub mod demux;

use thiserror::Error;

/// Errors produced by the DASH demultiplexer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DashDemuxError {
    /// The manifest is structurally invalid: missing MPD root or type attribute, no suitable
    /// Period, or a Representation that disappeared across a refresh.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    /// The URL scheme is not one of http/https/file (or their crypto-prefixed forms), or a
    /// file-scheme URL has an extension outside the allowed set.
    #[error("protocol not allowed: {0}")]
    InvalidProtocol(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("I/O error {1}: {0}")]
    Io(#[source] std::io::Error, String),
    /// The cancellation token fired while an operation was pending.
    #[error("operation interrupted")]
    Interrupted,
    /// Codec, resolution, frame rate or scan type drifted across a manifest refresh. Fatal for
    /// the affected Representation.
    #[error("stream parameters changed: {0}")]
    InputChanged(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("end of stream")]
    EndOfStream,
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, DashDemuxError>;

pub use demux::{ContainerDemuxer, ContainerDemuxOpener, DashDemuxer, DashOptions, MediaPacket, RawPacket};
pub use manifest::{DashContext, Fragment, MediaType, ParsedMpd, Representation, TimelineEntry};
pub use reader::{RepresentationReader, SegmentSource};
pub use transport::{Transport, TransportOptions};

/// Highest score returned by [`probe`], indicating a certain match.
pub const PROBE_SCORE_MAX: u8 = 100;

/// Score a buffer of initial input bytes for being a DASH MPD manifest.
///
/// Returns 0 unless the buffer contains the literal `<MPD`; returns [`PROBE_SCORE_MAX`] when one
/// of the standard DASH profile identifiers is also present.
pub fn probe(buf: &[u8]) -> u8 {
    let text = String::from_utf8_lossy(buf);
    if !text.contains("<MPD") {
        return 0;
    }
    if text.contains("dash:profile:isoff-on-demand:2011") ||
        text.contains("dash:profile:isoff-live:2011") ||
        text.contains("dash:profile:isoff-live:2012") ||
        text.contains("dash:profile:isoff-main:2011") ||
        text.contains("3GPP:PSS:profile:DASH1")
    {
        return PROBE_SCORE_MAX;
    }
    if text.contains("dash:profile") {
        return PROBE_SCORE_MAX;
    }
    0
}
