//! Top-level demultiplexer: one nested container demuxer per Representation, packets delivered
//! in `(segment number, timestamp)` order.
//!
//! The container format of the media segments (fMP4, MPEG-TS, WebM) is outside this crate; the
//! caller supplies a [`ContainerDemuxOpener`] that probes the byte stream a
//! [`RepresentationReader`] produces and returns a [`ContainerDemuxer`]. The nested demuxer
//! receives its byte source explicitly on every call and must not retain it between calls.

use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use crate::manifest::{self, DashContext, MediaType, Representation};
use crate::reader::{RepresentationReader, SegmentSource};
use crate::scheduler;
use crate::transport::{Transport, TransportOptions};
use crate::{DashDemuxError, Result};

/// Configuration for [`DashDemuxer::open`].
#[derive(Debug, Clone)]
pub struct DashOptions {
    /// Comma-separated whitelist of file extensions permitted on file-scheme URLs; the literal
    /// `ALL` disables the check.
    pub allowed_extensions: String,
    /// Bias timeline segment numbers by the Representation's first sequence number.
    pub use_timeline_segment_offset_correction: bool,
    /// Keep the live edge one segment back when no presentation delay or time-shift depth is
    /// configured, so only segments the packager has finished writing are fetched.
    pub fetch_completed_segments_only: bool,
    /// HTTP options replayed on every fetch.
    pub transport: TransportOptions,
}

impl Default for DashOptions {
    fn default() -> DashOptions {
        DashOptions {
            allowed_extensions: String::from("aac,m4a,m4s,m4v,mov,mp4,webm,ts"),
            use_timeline_segment_offset_correction: true,
            fetch_completed_segments_only: true,
            transport: TransportOptions::default(),
        }
    }
}

/// A packet as produced by a nested container demuxer, in the container's own time base.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub data: Bytes,
    pub pts: i64,
    /// Time base of `pts`, as a rational `(numerator, denominator)`.
    pub time_base: (i64, i64),
}

/// A packet delivered by [`DashDemuxer::read_packet`].
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub stream_index: usize,
    pub data: Bytes,
    /// Presentation timestamp rescaled to the fixed 90 kHz clock.
    pub pts_90k: i64,
    /// Per-packet side data: `segNumber`, `segSize` (-1 when unknown), `fragTimescale` and
    /// `fragDuration`, all as decimal strings.
    pub metadata: HashMap<String, String>,
}

/// A container demultiplexer reading from a seekless byte stream.
#[async_trait]
pub trait ContainerDemuxer: Send {
    /// Pull the next packet, reading bytes from `src` as needed. `Ok(None)` means the byte
    /// stream cycle is exhausted; errors from `src` must be propagated unchanged.
    async fn read_packet(&mut self, src: &mut dyn SegmentSource) -> Result<Option<RawPacket>>;

    /// Seek within the container. Only meaningful for streams backed by a single resource.
    async fn seek(&mut self, _position_ms: i64, _src: &mut dyn SegmentSource) -> Result<()> {
        Err(DashDemuxError::NotSupported(String::from("seeking in this container")))
    }
}

/// Probes the start of a Representation's byte stream and opens a [`ContainerDemuxer`] on it.
#[async_trait]
pub trait ContainerDemuxOpener: Send + Sync {
    async fn open(&self, src: &mut dyn SegmentSource) -> Result<Box<dyn ContainerDemuxer>>;
}

// The byte source handed to nested demuxers: borrows the reader together with everything a read
// may need (the shared context is mutated when a read triggers a manifest refresh).
struct ReaderSource<'a> {
    reader: &'a mut RepresentationReader,
    ctx: &'a mut DashContext,
    transport: &'a Transport,
    manifest_url: &'a str,
}

#[async_trait]
impl SegmentSource for ReaderSource<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader.read(self.ctx, self.transport, self.manifest_url, buf).await
    }
}

struct DashStream {
    reader: RepresentationReader,
    demux: Option<Box<dyn ContainerDemuxer>>,
    stream_index: usize,
    discard: bool,
}

/// Summary of one demuxed stream, mirroring what the manifest declared for it.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub stream_index: usize,
    pub media_type: MediaType,
    pub id: String,
    pub bandwidth: u64,
    pub lang: Option<String>,
    pub codecs: Option<String>,
    pub width: u64,
    pub height: u64,
}

/// The top-level DASH demultiplexer.
pub struct DashDemuxer {
    url: String,
    ctx: DashContext,
    streams: Vec<DashStream>,
    transport: Transport,
    opener: Box<dyn ContainerDemuxOpener>,
    cancel: CancellationToken,
    metadata: HashMap<String, String>,
}

fn rescale_to_90k(pts: i64, time_base: (i64, i64)) -> i64 {
    let (num, den) = time_base;
    if den == 0 {
        return 0;
    }
    pts.saturating_mul(num).saturating_mul(90_000) / den
}

impl DashDemuxer {
    /// Fetch and parse the manifest at `url`, admit its Representations, and open a nested
    /// container demuxer on each one.
    pub async fn open(
        url: &str,
        options: DashOptions,
        opener: Box<dyn ContainerDemuxOpener>,
    ) -> Result<DashDemuxer> {
        Self::open_with_cancellation(url, options, opener, CancellationToken::new()).await
    }

    /// Like [`DashDemuxer::open`], with an externally controlled cancellation token. The token
    /// is polled before every blocking operation; cancelling it fails the pending operation
    /// with [`DashDemuxError::Interrupted`].
    pub async fn open_with_cancellation(
        url: &str,
        options: DashOptions,
        opener: Box<dyn ContainerDemuxOpener>,
        cancel: CancellationToken,
    ) -> Result<DashDemuxer> {
        let transport = Transport::new(&options.transport, &options.allowed_extensions,
                                       cancel.clone())?;
        let (final_url, body) = transport.fetch_manifest(url).await?;
        let parsed = manifest::parse_manifest(&final_url, &body, 0, 0, &options)?;
        let mut demuxer = DashDemuxer {
            url: url.to_string(),
            ctx: parsed.context,
            streams: Vec::new(),
            transport,
            opener,
            cancel,
            metadata: parsed.metadata,
        };
        let reps = parsed.videos.into_iter()
            .chain(parsed.audios)
            .chain(parsed.subtitles);
        for rep in reps {
            demuxer.add_stream(rep);
        }
        if demuxer.streams.is_empty() {
            return Err(DashDemuxError::InvalidManifest(String::from("no playable streams")));
        }

        for idx in 0..demuxer.streams.len() {
            let media_type = demuxer.streams[idx].reader.rep.media_type;
            let first_idx = demuxer.first_stream_of(media_type);
            if idx != first_idx && demuxer.common_init_section(media_type) {
                // One fetch serves the whole group; later members copy the leader's buffer.
                let (before, rest) = demuxer.streams.split_at_mut(idx);
                let leader = &before[first_idx].reader;
                rest[0].reader.copy_init_from(leader);
            }
            demuxer.open_stream(idx).await?;
            debug!("stream {idx} opened at segment {} (last {})",
                   demuxer.streams[idx].reader.rep.cur_seq_no,
                   demuxer.streams[idx].reader.rep.last_seq_no);
        }
        Ok(demuxer)
    }

    fn add_stream(&mut self, mut rep: Representation) {
        let now = scheduler::wallclock_secs();
        rep.cur_seq_no = scheduler::current_segment_no(&self.ctx, &rep, now);
        if rep.last_seq_no == 0 {
            rep.last_seq_no = scheduler::max_segment_no(&self.ctx, &rep, now);
        }
        rep.set_period_from(&self.ctx);
        let stream_index = self.streams.len();
        self.streams.push(DashStream {
            reader: RepresentationReader::new(rep),
            demux: None,
            stream_index,
            discard: false,
        });
    }

    fn first_stream_of(&self, media_type: MediaType) -> usize {
        self.streams.iter()
            .position(|s| s.reader.rep.media_type == media_type)
            .unwrap_or(0)
    }

    // All Representations of this media type share one identical init section (same URL, byte
    // range and size), so a single fetch can serve the group.
    fn common_init_section(&self, media_type: MediaType) -> bool {
        let mut group = self.streams.iter()
            .filter(|s| s.reader.rep.media_type == media_type);
        let Some(first) = group.next() else {
            return false;
        };
        let Some(signature) = first.reader.init_signature() else {
            return false;
        };
        let mut others = 0;
        for stream in group {
            if stream.reader.init_signature().as_ref() != Some(&signature) {
                return false;
            }
            others += 1;
        }
        others > 0
    }

    async fn open_stream(&mut self, idx: usize) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DashDemuxError::Interrupted);
        }
        let DashDemuxer { url, ctx, streams, transport, opener, .. } = self;
        let stream = &mut streams[idx];
        let mut src = ReaderSource {
            reader: &mut stream.reader,
            ctx,
            transport,
            manifest_url: url,
        };
        stream.demux = Some(opener.open(&mut src).await?);
        Ok(())
    }

    /// Enable or disable delivery from a stream. Disabled streams release their nested demuxer
    /// and transport handle on the next read; re-enabled ones catch up to their siblings and
    /// reopen.
    pub fn set_discard(&mut self, stream_index: usize, discard: bool) {
        if let Some(stream) = self.streams.get_mut(stream_index) {
            stream.discard = discard;
        }
    }

    async fn recheck_discard_flags(&mut self) -> Result<()> {
        for idx in 0..self.streams.len() {
            let needed = !self.streams[idx].discard;
            if needed && self.streams[idx].demux.is_none() {
                let media_type = self.streams[idx].reader.rep.media_type;
                // Catch up to the most advanced sibling before rejoining.
                let max_seq = self.streams.iter()
                    .filter(|s| s.reader.rep.media_type == media_type)
                    .map(|s| s.reader.rep.cur_seq_no)
                    .max()
                    .unwrap_or(0);
                let stream = &mut self.streams[idx];
                stream.reader.reset_for_restart();
                stream.reader.rep.cur_seq_no = stream.reader.rep.cur_seq_no.max(max_seq);
                self.open_stream(idx).await?;
                info!("now receiving stream {idx}");
            } else if !needed && self.streams[idx].demux.is_some() {
                let stream = &mut self.streams[idx];
                stream.demux = None;
                stream.reader.close_input();
                info!("no longer receiving stream {idx}");
            }
        }
        Ok(())
    }

    // The open stream with the smallest (segment number, timestamp) pair reads next, keeping
    // the per-Representation positions close together.
    fn select_stream(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut min_seq = 0i64;
        let mut min_ts = 0i64;
        for (idx, stream) in self.streams.iter().enumerate() {
            if stream.demux.is_none() {
                continue;
            }
            let rep = &stream.reader.rep;
            if best.is_none()
                || rep.cur_seq_no < min_seq
                || (rep.cur_seq_no == min_seq && rep.cur_timestamp < min_ts)
            {
                best = Some(idx);
                min_seq = rep.cur_seq_no;
                min_ts = rep.cur_timestamp;
            }
        }
        best
    }

    /// Read the next packet of the presentation.
    pub async fn read_packet(&mut self) -> Result<MediaPacket> {
        self.recheck_discard_flags().await?;
        loop {
            if self.cancel.is_cancelled() {
                return Err(DashDemuxError::Interrupted);
            }
            let Some(idx) = self.select_stream() else {
                return Err(DashDemuxError::InvalidManifest(String::from("no active streams")));
            };
            let outcome = {
                let DashDemuxer { url, ctx, streams, transport, .. } = self;
                let DashStream { reader, demux, .. } = &mut streams[idx];
                let Some(demux) = demux.as_mut() else {
                    continue;
                };
                let mut src = ReaderSource {
                    reader: &mut *reader,
                    ctx: &mut *ctx,
                    transport,
                    manifest_url: url,
                };
                demux.read_packet(&mut src).await
            };
            match outcome {
                Ok(Some(packet)) => {
                    let stream = &mut self.streams[idx];
                    stream.reader.rep.cur_timestamp =
                        rescale_to_90k(packet.pts, packet.time_base);
                    let seg_size = stream.reader.current_segment_size();
                    let rep = &stream.reader.rep;
                    let mut metadata = HashMap::new();
                    metadata.insert(String::from("segNumber"), rep.cur_seq_no.to_string());
                    if let Some(size) = seg_size {
                        metadata.insert(String::from("segSize"), size.to_string());
                    }
                    metadata.insert(String::from("fragTimescale"),
                                    rep.fragment_timescale.to_string());
                    let frag_duration = match rep.timelines.first() {
                        Some(entry) => entry.duration,
                        None => rep.fragment_duration,
                    };
                    metadata.insert(String::from("fragDuration"), frag_duration.to_string());
                    return Ok(MediaPacket {
                        stream_index: stream.stream_index,
                        data: packet.data,
                        pts_90k: rep.cur_timestamp,
                        metadata,
                    });
                },
                Ok(None) | Err(DashDemuxError::EndOfStream) => {
                    if self.streams[idx].reader.is_restart_needed {
                        // The fragment ended; reopen the nested demuxer on the next one.
                        self.streams[idx].reader.reset_for_restart();
                        self.open_stream(idx).await?;
                        continue;
                    }
                    return Err(DashDemuxError::EndOfStream);
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Seek every stream to `position_ms`. Not supported for live presentations.
    pub async fn seek(&mut self, position_ms: i64) -> Result<()> {
        if self.ctx.is_live {
            return Err(DashDemuxError::NotSupported(String::from("seeking a live stream")));
        }
        debug!("seek to {position_ms}ms");
        for idx in 0..self.streams.len() {
            // Discarded streams reposition without reopening.
            let dry_run = self.streams[idx].demux.is_none();
            self.seek_stream(idx, position_ms, dry_run).await?;
        }
        Ok(())
    }

    async fn seek_stream(&mut self, idx: usize, position_ms: i64, dry_run: bool) -> Result<()> {
        if self.streams[idx].reader.rep.fragments.len() == 1 {
            // Single-resource mode: the nested demuxer seeks inside the container.
            self.streams[idx].reader.rep.cur_timestamp = 0;
            self.streams[idx].reader.reset_for_restart();
            if dry_run {
                return Ok(());
            }
            let DashDemuxer { url, ctx, streams, transport, .. } = self;
            let DashStream { reader, demux, .. } = &mut streams[idx];
            let Some(demux) = demux.as_mut() else {
                return Ok(());
            };
            let mut src = ReaderSource {
                reader: &mut *reader,
                ctx: &mut *ctx,
                transport,
                manifest_url: url,
            };
            return demux.seek(position_ms, &mut src).await;
        }
        {
            let DashDemuxer { ctx, streams, .. } = self;
            streams[idx].reader.seek_to(ctx, position_ms);
        }
        if dry_run {
            return Ok(());
        }
        self.open_stream(idx).await
    }

    /// Total duration of a static presentation; `None` when live.
    pub fn duration(&self) -> Option<Duration> {
        if self.ctx.is_live {
            None
        } else {
            Some(Duration::from_secs(self.ctx.media_presentation_duration))
        }
    }

    pub fn is_live(&self) -> bool {
        self.ctx.is_live
    }

    /// ProgramInformation metadata from the manifest (Title, Source, Copyright).
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Descriptions of the demuxed streams, indexed by `stream_index`.
    pub fn stream_info(&self) -> Vec<StreamInfo> {
        self.streams.iter()
            .map(|s| {
                let rep = &s.reader.rep;
                StreamInfo {
                    stream_index: s.stream_index,
                    media_type: rep.media_type,
                    id: rep.id.clone(),
                    bandwidth: rep.bandwidth,
                    lang: rep.lang.clone(),
                    codecs: rep.codecs.clone(),
                    width: rep.width,
                    height: rep.height,
                }
            })
            .collect()
    }

    /// The cancellation token interrupting this demuxer's blocking operations.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
