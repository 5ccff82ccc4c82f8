//! Live manifest refresh and reconciliation.
//!
//! A dynamic presentation republishes its manifest as new segments appear. When a reader outruns
//! the schedule it has, the manifest is re-fetched, re-parsed at the reader's current timepoint,
//! and the freshly parsed Representation matching the reader's id is spliced into the live state:
//! either continuing the existing timeline (same Period) or advancing onto a new Period. The rest
//! of the parsed document is discarded; readers other than the target are left untouched.

use tracing::{debug, error, warn};
use crate::manifest::{self, DashContext, MediaType, ParsedMpd, Representation};
use crate::reader::RepresentationReader;
use crate::scheduler;
use crate::transport::Transport;
use crate::{DashDemuxError, Result};

/// Re-fetch and re-parse the manifest on behalf of `reader`, splicing the new schedule into it.
///
/// On failure the previous state is left untouched and remains readable.
pub async fn refresh_manifest(
    transport: &Transport,
    manifest_url: &str,
    ctx: &mut DashContext,
    reader: &mut RepresentationReader,
) -> Result<()> {
    let timepoint = scheduler::current_timepoint(ctx, &reader.rep);
    let (final_url, body) = transport.fetch_manifest(manifest_url).await?;
    let options = crate::demux::DashOptions {
        use_timeline_segment_offset_correction: ctx.use_timeline_segment_offset_correction,
        fetch_completed_segments_only: ctx.fetch_completed_segments_only,
        ..crate::demux::DashOptions::default()
    };
    let new = manifest::parse_manifest(&final_url, &body, timepoint, ctx.period_start, &options)?;
    reconcile(ctx, reader, new)
}

// Compare the stream parameters that must not drift across a refresh. Any change terminates
// playback of the Representation rather than silently switching decoder configuration.
fn check_stream_params(fresh: &Representation, old: &Representation) -> Result<()> {
    match old.media_type {
        MediaType::Video => {
            if fresh.width != old.width || fresh.height != old.height {
                error!("{}: video resolution changed from ({},{}) to ({},{})",
                       old.id, old.width, old.height, fresh.width, fresh.height);
                return Err(DashDemuxError::InputChanged(
                    format!("{}: video resolution changed", old.id)));
            }
            if fresh.frame_rate != old.frame_rate {
                error!("{}: video frame rate changed from {}/{} to {}/{}",
                       old.id, old.frame_rate.num, old.frame_rate.den,
                       fresh.frame_rate.num, fresh.frame_rate.den);
                return Err(DashDemuxError::InputChanged(
                    format!("{}: video frame rate changed", old.id)));
            }
            if fresh.codecs != old.codecs {
                error!("{}: video codec changed from {:?} to {:?}",
                       old.id, old.codecs, fresh.codecs);
                return Err(DashDemuxError::InputChanged(
                    format!("{}: video codec changed", old.id)));
            }
            if fresh.scan_type != old.scan_type {
                error!("{}: video scan type changed from {:?} to {:?}",
                       old.id, old.scan_type, fresh.scan_type);
                return Err(DashDemuxError::InputChanged(
                    format!("{}: video scan type changed", old.id)));
            }
        },
        MediaType::Audio => {
            if fresh.codecs != old.codecs {
                error!("{}: audio codec changed from {:?} to {:?}",
                       old.id, old.codecs, fresh.codecs);
                return Err(DashDemuxError::InputChanged(
                    format!("{}: audio codec changed", old.id)));
            }
        },
        MediaType::Subtitle => {},
    }
    Ok(())
}

/// Splice a freshly parsed manifest into the reader's Representation and adopt the new
/// presentation-global state. The freshly parsed Representation vectors are cannibalized and
/// dropped.
pub fn reconcile(
    ctx: &mut DashContext,
    reader: &mut RepresentationReader,
    mut new: ParsedMpd,
) -> Result<()> {
    let pool = match reader.rep.media_type {
        MediaType::Video => &mut new.videos,
        MediaType::Audio => &mut new.audios,
        MediaType::Subtitle => &mut new.subtitles,
    };
    let fresh_idx = pool.iter()
        .position(|r| !reader.rep.id.is_empty() && r.id == reader.rep.id)
        .ok_or_else(|| {
            error!("new manifest is missing Representation {}", reader.rep.id);
            DashDemuxError::InvalidManifest(
                format!("new manifest is missing Representation {}", reader.rep.id))
        })?;
    let mut fresh = pool.swap_remove(fresh_idx);
    check_stream_params(&fresh, &reader.rep)?;

    let new_ctx = new.context;
    let now = scheduler::wallclock_secs();

    if !reader.rep.timelines.is_empty() {
        if new_ctx.period_start > reader.rep.period_start {
            debug!("new Period at {}, previous Period at {}",
                   new_ctx.period_start, reader.rep.period_start);
            reader.rep.timelines = std::mem::take(&mut fresh.timelines);
            reader.rep.first_seq_no = fresh.first_seq_no;
            reader.rep.start_number = fresh.start_number;
            reader.rep.cur_seq_no = fresh.first_seq_no;
            reader.rep.last_seq_no = scheduler::max_segment_no(&new_ctx, &reader.rep, now);
            reader.rep.init_section = std::mem::take(&mut fresh.init_section);
            reader.mark_init_for_reload();
        } else {
            // Continue the existing timeline: find our current position on the new one.
            let ts = reader.rep.fragment_timescale.max(1);
            let current_time =
                scheduler::segment_start_time(&new_ctx, &reader.rep, reader.rep.cur_seq_no) / ts;
            let new_seq = scheduler::next_segment_from_timeline(
                &new_ctx, &fresh, current_time * fresh.fragment_timescale.max(1) - 1);
            if new_seq >= 0 {
                reader.rep.timelines = std::mem::take(&mut fresh.timelines);
                reader.rep.first_seq_no = fresh.first_seq_no;
                reader.rep.start_number = fresh.start_number;
                reader.rep.cur_seq_no = new_seq;
                reader.rep.last_seq_no = scheduler::max_segment_no(&new_ctx, &reader.rep, now);
            } else {
                warn!("{}: current position is beyond the refreshed timeline", reader.rep.id);
            }
        }
    } else if !reader.rep.fragments.is_empty() {
        // Adopt the new explicit list; the window may have shifted forward.
        let window_len = reader.rep.fragments.len() as i64;
        let out_of_window = fresh.start_number > reader.rep.start_number + window_len;
        reader.rep.fragments = std::mem::take(&mut fresh.fragments);
        reader.rep.first_seq_no = fresh.first_seq_no;
        reader.rep.start_number = fresh.start_number;
        if out_of_window || reader.rep.cur_seq_no < reader.rep.first_seq_no {
            reader.rep.cur_seq_no = reader.rep.first_seq_no;
        }
        reader.rep.last_seq_no = scheduler::max_segment_no(&new_ctx, &reader.rep, now);
        if new_ctx.period_start > reader.rep.period_start {
            debug!("new Period at {}, previous Period at {}",
                   new_ctx.period_start, reader.rep.period_start);
            reader.rep.init_section = std::mem::take(&mut fresh.init_section);
            reader.rep.cur_seq_no = fresh.start_number;
            reader.mark_init_for_reload();
        }
    }

    *ctx = new_ctx;
    reader.rep.set_period_from(ctx);
    Ok(())
}
