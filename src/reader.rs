//! Per-Representation read pipeline.
//!
//! A [`RepresentationReader`] presents one Representation as a lazy byte stream: the
//! initialization section, then the current media fragment, then end-of-fragment. The top-level
//! demultiplexer resets the reader at each fragment boundary and reopens its nested container
//! demuxer, so every open cycle sees `init + fragment` as one contiguous stream. For dynamic
//! presentations the reader drives the manifest refresher whenever it runs out of schedule.

use async_trait::async_trait;
use tracing::{debug, trace, warn};
use crate::manifest::{DashContext, Fragment};
use crate::refresh;
use crate::scheduler;
use crate::transport::{SegmentInput, Transport};
use crate::{DashDemuxError, Result};

/// Initialization sections larger than this are truncated.
pub const MAX_INIT_SECTION_SIZE: usize = 1024 * 1024;

/// A seekless byte stream feeding a nested container demuxer.
#[async_trait]
pub trait SegmentSource: Send {
    /// Read some bytes. `Ok(0)` signals the end of the current stream cycle (the nested demuxer
    /// should finish up and let the top-level demuxer restart it); `EndOfStream` signals the end
    /// of the whole presentation.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// State machine producing the byte stream of a single Representation.
pub struct RepresentationReader {
    pub rep: crate::manifest::Representation,
    input: Option<SegmentInput>,
    cur_seg: Option<Fragment>,
    cur_seg_offset: u64,
    cur_seg_size: Option<u64>,
    init_buf: Vec<u8>,
    init_read_offset: usize,
    init_loaded: bool,
    /// Set when a fragment ended; the top-level demuxer resets the reader and reopens the nested
    /// demuxer before reading on.
    pub is_restart_needed: bool,
}

impl RepresentationReader {
    pub fn new(rep: crate::manifest::Representation) -> RepresentationReader {
        RepresentationReader {
            rep,
            input: None,
            cur_seg: None,
            cur_seg_offset: 0,
            cur_seg_size: None,
            init_buf: Vec::new(),
            init_read_offset: 0,
            init_loaded: false,
            is_restart_needed: false,
        }
    }

    /// Drop the current input handle, releasing the transport resource.
    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// Rewind to the start of a fresh stream cycle: offsets zeroed so the next read replays the
    /// init section and opens the next fragment.
    pub fn reset_for_restart(&mut self) {
        self.cur_seg_offset = 0;
        self.init_read_offset = 0;
        self.input = None;
        self.is_restart_needed = false;
    }

    /// Mark the init section for reload. The buffer allocation is kept and refilled on the next
    /// read; used when a refresh moves the Representation onto a new Period.
    pub fn mark_init_for_reload(&mut self) {
        self.init_loaded = false;
        self.init_read_offset = 0;
    }

    /// Identity of the init section for shared-init detection: URL, offset and size.
    pub fn init_signature(&self) -> Option<(String, u64, Option<u64>)> {
        self.rep.init_section.as_ref()
            .map(|init| (init.url.clone(), init.offset, init.size))
    }

    /// Adopt another reader's already-loaded init section instead of fetching our own copy.
    pub fn copy_init_from(&mut self, other: &RepresentationReader) {
        self.init_buf.clear();
        self.init_buf.extend_from_slice(&other.init_buf);
        self.init_read_offset = 0;
        self.init_loaded = other.init_loaded;
        self.rep.cur_timestamp = other.rep.cur_timestamp;
    }

    /// Size of the current segment: `Some(-1)` when a segment is open but its size is unknown,
    /// `None` when no segment is open.
    pub fn current_segment_size(&self) -> Option<i64> {
        self.cur_seg.as_ref()
            .map(|_| self.cur_seg_size.map_or(-1, |s| s as i64))
    }

    /// Position the reader on the segment covering `position_ms`. Only used for static
    /// presentations with more than one fragment.
    pub fn seek_to(&mut self, _ctx: &DashContext, position_ms: i64) {
        self.close_input();
        let rep = &mut self.rep;
        if !rep.timelines.is_empty() && rep.fragment_timescale > 0 {
            let ts = rep.fragment_timescale;
            let mut num = rep.first_seq_no;
            let mut duration = 0i64;
            'walk: for entry in &rep.timelines {
                if entry.start_time > 0 {
                    duration = entry.start_time;
                }
                duration += entry.duration;
                if position_ms < duration * 1000 / ts {
                    break 'walk;
                }
                for _ in 0..entry.repeat {
                    duration += entry.duration;
                    num += 1;
                    if position_ms < duration * 1000 / ts {
                        break 'walk;
                    }
                }
                num += 1;
            }
            rep.cur_seq_no = num.min(rep.last_seq_no);
            debug!("seek to {position_ms}ms lands on segment {}", rep.cur_seq_no);
        } else if rep.fragment_duration > 0 {
            rep.cur_seq_no = rep.first_seq_no
                + ((position_ms * rep.fragment_timescale) / rep.fragment_duration) / 1000;
        } else {
            warn!("seek without timeline or fragment duration");
            rep.cur_seq_no = rep.first_seq_no;
        }
        rep.cur_timestamp = 0;
        self.cur_seg = None;
        self.cur_seg_offset = 0;
        self.init_read_offset = 0;
    }

    // Determine the fragment the reader should stream next, refreshing the manifest for dynamic
    // presentations when the schedule has run out. `Ok(None)` means the static presentation is
    // exhausted.
    async fn current_fragment(
        &mut self,
        ctx: &mut DashContext,
        transport: &Transport,
        manifest_url: &str,
    ) -> Result<Option<Fragment>> {
        while !self.rep.fragments.is_empty() {
            if transport.interrupted() {
                return Err(DashDemuxError::Interrupted);
            }
            let idx = self.rep.cur_seq_no - self.rep.first_seq_no;
            if idx >= 0 && (idx as usize) < self.rep.fragments.len() {
                return Ok(Some(self.rep.fragments[idx as usize].clone()));
            } else if ctx.is_live {
                refresh::refresh_manifest(transport, manifest_url, ctx, self).await?;
            } else {
                break;
            }
        }
        if ctx.is_live {
            let now = scheduler::wallclock_secs();
            let min_seq = scheduler::min_segment_no(ctx, &self.rep, now);
            let mut max_seq = scheduler::max_segment_no(ctx, &self.rep, now);
            if !self.rep.timelines.is_empty() || !self.rep.fragments.is_empty() {
                refresh::refresh_manifest(transport, manifest_url, ctx, self).await?;
                max_seq = scheduler::max_segment_no(ctx, &self.rep, scheduler::wallclock_secs());
            }
            if self.rep.cur_seq_no <= min_seq {
                debug!("stale segment: cur[{}] min[{min_seq}] max[{max_seq}]", self.rep.cur_seq_no);
                self.rep.cur_seq_no =
                    scheduler::current_segment_no(ctx, &self.rep, scheduler::wallclock_secs());
            } else if self.rep.cur_seq_no > max_seq {
                trace!("ahead of schedule: cur[{}] min[{min_seq}] max[{max_seq}]",
                       self.rep.cur_seq_no);
                // Keep refreshing until the schedule catches up with us.
                while self.rep.cur_seq_no > max_seq {
                    if transport.interrupted() {
                        return Err(DashDemuxError::Interrupted);
                    }
                    debug!("no fragment published yet for segment {}, refreshing",
                           self.rep.cur_seq_no);
                    refresh::refresh_manifest(transport, manifest_url, ctx, self).await?;
                    max_seq = scheduler::max_segment_no(ctx, &self.rep, scheduler::wallclock_secs());
                }
            }
        } else if self.rep.cur_seq_no > self.rep.last_seq_no {
            return Ok(None);
        }
        match scheduler::media_url(ctx, &self.rep, self.rep.cur_seq_no) {
            Some(url) => Ok(Some(Fragment::new(url))),
            None => {
                warn!("Representation {} has no way to address segment {}",
                      self.rep.id, self.rep.cur_seq_no);
                Ok(None)
            },
        }
    }

    // Fetch the init section into the internal buffer, once per Representation (and again after
    // a Period transition marked it for reload).
    async fn update_init_section(&mut self, transport: &Transport) -> Result<()> {
        let Some(init) = self.rep.init_section.clone() else {
            return Ok(());
        };
        if self.init_loaded {
            return Ok(());
        }
        let mut input = transport.open(&init.url, init.offset, init.size).await?;
        let cap = init.size.or(input.size())
            .map_or(MAX_INIT_SECTION_SIZE, |s| (s as usize).min(MAX_INIT_SECTION_SIZE));
        debug!("downloading an initialization section of size {cap}");
        self.init_buf.clear();
        let mut chunk = [0u8; 8192];
        while self.init_buf.len() < cap {
            let want = chunk.len().min(cap - self.init_buf.len());
            let n = input.read(&mut chunk[..want]).await?;
            if n == 0 {
                break;
            }
            self.init_buf.extend_from_slice(&chunk[..n]);
        }
        debug!("downloaded {} bytes of an expected {cap} bytes in the initialization section",
               self.init_buf.len());
        self.init_read_offset = 0;
        self.init_loaded = true;
        Ok(())
    }

    async fn open_fragment(&mut self, transport: &Transport, frag: &mut Fragment) -> Result<()> {
        if frag.size.is_none() {
            // measuring up front is much cheaper than streaming to EOF
            frag.size = transport.probe_size(&frag.url).await;
        }
        debug!("request for url '{}', offset {}, size {:?}", frag.url, frag.offset, frag.size);
        let input = transport.open(&frag.url, frag.offset, frag.size).await?;
        self.cur_seg_size = frag.size.or_else(|| input.size());
        self.cur_seg_offset = 0;
        self.input = Some(input);
        Ok(())
    }

    async fn read_from_current(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(input) = self.input.as_mut() else {
            return Ok(0);
        };
        let mut limit = buf.len();
        if let Some(size) = self.cur_seg_size {
            let remaining = size.saturating_sub(self.cur_seg_offset);
            if remaining == 0 {
                return Ok(0);
            }
            limit = limit.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        }
        let n = input.read(&mut buf[..limit]).await?;
        self.cur_seg_offset += n as u64;
        Ok(n)
    }

    /// Produce the next bytes of the Representation's stream: first the remainder of the init
    /// buffer, then the remainder of the current media segment. At the end of a segment the
    /// restart flag is raised and `Ok(0)` returned; a static presentation past its last segment
    /// fails with `EndOfStream`.
    pub async fn read(
        &mut self,
        ctx: &mut DashContext,
        transport: &Transport,
        manifest_url: &str,
        buf: &mut [u8],
    ) -> Result<usize> {
        loop {
            if self.input.is_none() {
                self.cur_seg = None;
                let Some(frag) = self.current_fragment(ctx, transport, manifest_url).await? else {
                    return Err(DashDemuxError::EndOfStream);
                };
                self.cur_seg = Some(frag);

                if let Err(e) = self.update_init_section(transport).await {
                    if transport.interrupted() || matches!(e, DashDemuxError::Interrupted) {
                        return Err(DashDemuxError::Interrupted);
                    }
                    warn!("failed to open an initialization section: {e}");
                    continue;
                }

                let Some(mut frag) = self.cur_seg.take() else {
                    continue;
                };
                match self.open_fragment(transport, &mut frag).await {
                    Ok(()) => self.cur_seg = Some(frag),
                    Err(e) => {
                        if transport.interrupted() || matches!(e, DashDemuxError::Interrupted) {
                            return Err(DashDemuxError::Interrupted);
                        }
                        warn!("failed to open fragment of Representation {}: {e}", self.rep.id);
                        if !ctx.is_live {
                            // A live reader must hold position: the segment number may be ahead
                            // of what the packager has published, and the refresher will
                            // re-anchor it. A static presentation just skips the broken segment.
                            self.rep.cur_seq_no += 1;
                        }
                        continue;
                    },
                }
            }

            if self.init_read_offset < self.init_buf.len() {
                // push the init section out before the first bytes of the fragment
                let n = (self.init_buf.len() - self.init_read_offset).min(buf.len());
                buf[..n].copy_from_slice(&self.init_buf[self.init_read_offset..self.init_read_offset + n]);
                self.init_read_offset += n;
                return Ok(n);
            }

            if self.cur_seg.is_none() {
                let Some(frag) = self.current_fragment(ctx, transport, manifest_url).await? else {
                    return Err(DashDemuxError::EndOfStream);
                };
                self.cur_seg = Some(frag);
            }

            let n = self.read_from_current(buf).await?;
            if n > 0 {
                return Ok(n);
            }

            // Fragment exhausted. Advance and hand control back to the top-level demuxer, which
            // resets us and reopens the nested demuxer for the next cycle.
            if ctx.is_live || self.rep.cur_seq_no < self.rep.last_seq_no {
                if !self.is_restart_needed {
                    self.rep.cur_seq_no += 1;
                }
                self.is_restart_needed = true;
            }
            return Ok(0);
        }
    }
}
