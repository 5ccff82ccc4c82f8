//! Segment scheduling: the "current segment number" arithmetic for static and dynamic
//! presentations, timeline walks, and URL template expansion.
//!
//! All of the segment-number functions take the wall clock as an explicit `now` argument (UTC
//! seconds) so live-edge computations are deterministic under test; [`wallclock_secs`] supplies
//! the real clock.

use std::collections::HashMap;
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::trace;
use crate::manifest::{DashContext, Representation};

/// Seconds since the Unix epoch.
pub fn wallclock_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

// From https://dashif.org/docs/DASH-IF-IOP-v4.3.pdf:
// "For the avoidance of doubt, only %0[width]d is permitted and no other identifiers. The reason
// is that such a string replacement can be easily implemented without requiring a specific library."
//
// Instead of pulling in C printf() or a reimplementation such as the printf_compat crate, we
// reimplement this functionality directly.
//
// Example template: "$RepresentationID$/$Number%06d$.m4s"
lazy_static! {
    static ref URL_TEMPLATE_IDS: Vec<(&'static str, String, Regex)> = {
        vec!["RepresentationID", "Number", "Time", "Bandwidth"].into_iter()
            .map(|k| (k, format!("${k}$"), Regex::new(&format!("\\${k}%0(\\d+)d\\$")).unwrap()))
            .collect()
    };
}

/// Substitute the DASH URL-template placeholders `$RepresentationID$`, `$Number$`, `$Time$` and
/// `$Bandwidth$` (each optionally carrying a `%0Nd` width modifier) with the values present in
/// `params`. `$$` produces a literal `$`.
pub fn resolve_url_template(template: &str, params: &HashMap<&str, String>) -> String {
    let mut result = template.to_string();
    for (k, ident, rx) in URL_TEMPLATE_IDS.iter() {
        // first check for simple cases such as $Number$
        if result.contains(ident) {
            if let Some(value) = params.get(*k) {
                result = result.replace(ident, value);
            }
        }
        // now check for complex cases such as $Number%06d$
        if let Some(cap) = rx.captures(&result) {
            if let Some(value) = params.get(*k) {
                let width: usize = cap[1].parse::<usize>().unwrap();
                let count = format!("{value:0>width$}");
                let m = rx.find(&result).unwrap();
                result = result[..m.start()].to_owned() + &count + &result[m.end()..];
            }
        }
    }
    if result.contains("$$") {
        result = result.replace("$$", "$");
    }
    result
}

/// Expand a Representation's media template for segment `seq`, filling `$Number$` and `$Time$`.
/// Returns `None` when the Representation has no template.
pub fn media_url(ctx: &DashContext, rep: &Representation, seq: i64) -> Option<String> {
    let template = rep.url_template.as_ref()?;
    let params = HashMap::from([
        ("Number", seq.to_string()),
        ("Time", segment_start_time(ctx, rep, seq).to_string()),
    ]);
    Some(resolve_url_template(template, &params))
}

/// Start time of segment `seq` on the Representation's timeline, in timescale units.
///
/// Walks the timeline entries accumulating durations; a positive `start_time` overrides the
/// accumulator at an entry boundary (discontinuity). With the segment-offset correction enabled
/// and `seq` at or past `first_seq_no`, the number is first rebased to a timeline index. Inside
/// an open-ended (`repeat == -1`) run the schedule is synthetic: `duration × seq`.
pub fn segment_start_time(ctx: &DashContext, rep: &Representation, mut seq: i64) -> i64 {
    let mut start_time = 0i64;
    if rep.timelines.is_empty() {
        return 0;
    }
    if ctx.use_timeline_segment_offset_correction && seq >= rep.first_seq_no {
        seq -= rep.first_seq_no;
    }
    let mut num = 0i64;
    for entry in &rep.timelines {
        if entry.start_time > 0 {
            start_time = entry.start_time;
        }
        if num == seq {
            return start_time;
        }
        start_time += entry.duration;
        if entry.repeat == -1 {
            return entry.duration * seq;
        }
        for _ in 0..entry.repeat {
            num += 1;
            if num == seq {
                return start_time;
            }
            start_time += entry.duration;
        }
        num += 1;
    }
    start_time
}

/// The first segment whose timeline start reaches `cur_time`, or -1 when the timeline ends
/// before it. With the segment-offset correction enabled the result is rebased onto the
/// Representation's numbering by adding `first_seq_no`.
pub fn next_segment_from_timeline(ctx: &DashContext, rep: &Representation, cur_time: i64) -> i64 {
    let mut num = 0i64;
    let mut start_time = 0i64;
    let mut found = false;
    'walk: for entry in &rep.timelines {
        if entry.start_time > 0 {
            start_time = entry.start_time;
        }
        if start_time >= cur_time {
            found = true;
            break;
        }
        if entry.repeat == -1 {
            // Open-ended run: every remaining segment has this duration, so the target index
            // falls out of a division.
            if entry.duration <= 0 {
                break;
            }
            num += (cur_time - start_time + entry.duration - 1) / entry.duration;
            found = true;
            break;
        }
        start_time += entry.duration;
        for _ in 0..entry.repeat {
            num += 1;
            if start_time >= cur_time {
                found = true;
                break 'walk;
            }
            start_time += entry.duration;
        }
        num += 1;
    }
    if !found {
        return -1;
    }
    if ctx.use_timeline_segment_offset_correction {
        num + rep.first_seq_no
    } else {
        num
    }
}

// End of the published timeline in timescale units. An open-ended entry extends to the Period
// duration when it is known, and to the live edge otherwise.
fn timeline_end_time(ctx: &DashContext, rep: &Representation, now: u64) -> i64 {
    let mut start_time = 0i64;
    for entry in &rep.timelines {
        if entry.start_time > 0 {
            start_time = entry.start_time;
        }
        if entry.repeat == -1 {
            let timescale = rep.fragment_timescale.max(1);
            if ctx.period_duration > 0 {
                return ctx.period_duration as i64 * timescale;
            }
            return now.saturating_sub(ctx.availability_start_time) as i64 * timescale;
        }
        start_time += entry.duration * (entry.repeat + 1);
    }
    start_time
}

/// The segment number a Representation should start (or resume) reading at.
pub fn current_segment_no(ctx: &DashContext, rep: &Representation, now: u64) -> i64 {
    if !ctx.is_live {
        return rep.first_seq_no;
    }
    let elapsed = now.saturating_sub(ctx.availability_start_time) as i64;
    if !rep.fragments.is_empty() {
        trace!("current segment from explicit fragment list");
        rep.first_seq_no
    } else if !rep.timelines.is_empty() {
        trace!("current segment from timeline");
        // Anchor 60 seconds behind the end of the published timeline.
        let anchor = timeline_end_time(ctx, rep, now) - 60 * rep.fragment_timescale;
        let num = next_segment_from_timeline(ctx, rep, anchor);
        if num == -1 {
            rep.first_seq_no
        } else if !ctx.use_timeline_segment_offset_correction {
            num + rep.first_seq_no
        } else {
            num
        }
    } else if rep.fragment_duration > 0 {
        trace!("current segment from fragment duration, timescale = {}, \
                presentation_time_offset = {}",
               rep.fragment_timescale, rep.presentation_time_offset);
        let dur = rep.fragment_duration;
        let ts = rep.fragment_timescale;
        if rep.presentation_time_offset != 0 {
            rep.first_seq_no
                + (elapsed * ts - rep.presentation_time_offset) / dur
                - ctx.min_buffer_time as i64
        } else if ctx.publish_time > 0 && ctx.availability_start_time == 0 {
            let mut num = if ctx.min_buffer_time != 0 {
                rep.first_seq_no
                    + ((ctx.publish_time as i64 + dur
                        - ctx.suggested_presentation_delay as i64) * ts) / dur
                    - ctx.min_buffer_time as i64
            } else {
                rep.first_seq_no
                    + ((ctx.publish_time as i64 - ctx.time_shift_buffer_depth as i64 + dur
                        - ctx.suggested_presentation_delay as i64) * ts) / dur
            };
            if num > rep.first_seq_no
                && ctx.time_shift_buffer_depth == 0
                && ctx.suggested_presentation_delay == 0
                && ctx.fetch_completed_segments_only
            {
                num -= 1;
            }
            num
        } else {
            let mut num = rep.first_seq_no
                + ((elapsed - ctx.suggested_presentation_delay as i64) * ts) / dur;
            if num > rep.first_seq_no
                && ctx.suggested_presentation_delay == 0
                && ctx.fetch_completed_segments_only
            {
                num -= 1;
            }
            num
        }
    } else {
        rep.first_seq_no
    }
}

/// The oldest segment number still inside the time-shift window.
pub fn min_segment_no(ctx: &DashContext, rep: &Representation, now: u64) -> i64 {
    if ctx.is_live && rep.fragment_duration > 0 {
        let elapsed = now.saturating_sub(ctx.availability_start_time) as i64;
        let mut num = rep.first_seq_no
            + ((elapsed - ctx.time_shift_buffer_depth as i64) * rep.fragment_timescale)
              / rep.fragment_duration;
        if num > rep.first_seq_no
            && ctx.time_shift_buffer_depth == 0
            && ctx.fetch_completed_segments_only
        {
            num -= 1;
        }
        num
    } else {
        rep.first_seq_no
    }
}

/// The newest segment number the schedule describes.
pub fn max_segment_no(ctx: &DashContext, rep: &Representation, now: u64) -> i64 {
    if !rep.fragments.is_empty() {
        return rep.first_seq_no + rep.fragments.len() as i64 - 1;
    }
    if !rep.timelines.is_empty() {
        let mut num = rep.first_seq_no + rep.timelines.len() as i64 - 1;
        for entry in &rep.timelines {
            if entry.repeat == -1 {
                if entry.duration > 0 {
                    num = (ctx.period_duration as i64 * rep.fragment_timescale) / entry.duration;
                }
            } else {
                num += entry.repeat;
            }
        }
        return num;
    }
    if rep.fragment_duration > 0 {
        if ctx.is_live {
            let elapsed = now.saturating_sub(ctx.availability_start_time) as i64;
            let mut num = rep.first_seq_no
                + (elapsed * rep.fragment_timescale) / rep.fragment_duration;
            if num > rep.first_seq_no && ctx.fetch_completed_segments_only {
                num -= 1;
            }
            return num;
        }
        // Static presentation: the last segment is the one covering the end of the declared
        // media presentation duration.
        let total_ticks = ctx.media_presentation_duration as i64 * rep.fragment_timescale;
        let n_segments = (total_ticks + rep.fragment_duration - 1) / rep.fragment_duration;
        return rep.first_seq_no + n_segments - 1;
    }
    0
}

/// The playback position in seconds since availability start, used to select the Period when
/// re-parsing a manifest on behalf of this Representation.
pub fn current_timepoint(ctx: &DashContext, rep: &Representation) -> u64 {
    if ctx.is_live {
        if !rep.timelines.is_empty() {
            if rep.period_start == 0 {
                return 0;
            }
            let ts = rep.fragment_timescale.max(1);
            return rep.period_start
                + (segment_start_time(ctx, rep, rep.cur_seq_no) / ts).max(0) as u64;
        } else if rep.fragment_duration > 0 {
            let ts = rep.fragment_timescale.max(1);
            return ((rep.first_seq_no * rep.fragment_duration) / ts).max(0) as u64;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{MediaType, TimelineEntry};

    fn context() -> DashContext {
        DashContext::default()
    }

    fn timeline_rep(entries: &[(i64, i64, i64)], timescale: i64, first: i64) -> Representation {
        let mut rep = Representation::new(MediaType::Video);
        rep.timelines = entries.iter()
            .map(|&(start_time, repeat, duration)| TimelineEntry { start_time, repeat, duration })
            .collect();
        rep.fragment_timescale = timescale;
        rep.first_seq_no = first;
        rep.cur_seq_no = first;
        rep
    }

    #[test]
    fn test_resolve_url_template() {
        use std::collections::HashMap;

        assert_eq!(resolve_url_template("AA$Time$BB", &HashMap::from([("Time", "ZZZ".to_string())])),
                   "AAZZZBB");
        assert_eq!(resolve_url_template("AA$Number%06d$BB", &HashMap::from([("Number", "42".to_string())])),
                   "AA000042BB");
        let dict = HashMap::from([("RepresentationID", "640x480".to_string()),
                                  ("Number", "42".to_string()),
                                  ("Time", "ZZZ".to_string())]);
        assert_eq!(resolve_url_template("AA/$RepresentationID$/segment-$Number%05d$.mp4", &dict),
                   "AA/640x480/segment-00042.mp4");
        // $$ escapes a literal dollar sign
        assert_eq!(resolve_url_template("price$$$Number$.m4s",
                                        &HashMap::from([("Number", "7".to_string())])),
                   "price$7.m4s");
        // expansion is deterministic
        let a = resolve_url_template("$RepresentationID$-$Time%08d$.m4s", &dict);
        let b = resolve_url_template("$RepresentationID$-$Time%08d$.m4s", &dict);
        assert_eq!(a, b);
    }

    #[test]
    fn test_segment_start_time_accumulates_runs() {
        let ctx = context();
        // 3 + 4 segments of 1000, then one of 500
        let rep = timeline_rep(&[(0, 2, 1000), (0, 3, 1000), (0, 0, 500)], 1000, 0);
        assert_eq!(segment_start_time(&ctx, &rep, 0), 0);
        assert_eq!(segment_start_time(&ctx, &rep, 1), 1000);
        assert_eq!(segment_start_time(&ctx, &rep, 3), 3000);
        assert_eq!(segment_start_time(&ctx, &rep, 6), 6000);
        assert_eq!(segment_start_time(&ctx, &rep, 7), 7000);
    }

    #[test]
    fn test_segment_start_time_discontinuity() {
        let ctx = context();
        // second entry jumps the clock forward to 10000
        let rep = timeline_rep(&[(0, 1, 1000), (10000, 1, 1000)], 1000, 0);
        assert_eq!(segment_start_time(&ctx, &rep, 1), 1000);
        assert_eq!(segment_start_time(&ctx, &rep, 2), 10000);
        assert_eq!(segment_start_time(&ctx, &rep, 3), 11000);
    }

    #[test]
    fn test_segment_start_time_offset_correction() {
        let mut ctx = context();
        let rep = timeline_rep(&[(0, 9, 1000)], 1000, 5);
        // with correction, segment numbers are biased by first_seq_no
        assert_eq!(segment_start_time(&ctx, &rep, 5), 0);
        assert_eq!(segment_start_time(&ctx, &rep, 7), 2000);
        ctx.use_timeline_segment_offset_correction = false;
        assert_eq!(segment_start_time(&ctx, &rep, 2), 2000);
    }

    #[test]
    fn test_next_segment_from_timeline() {
        let ctx = context();
        let rep = timeline_rep(&[(0, 9, 1000)], 1000, 0);
        assert_eq!(next_segment_from_timeline(&ctx, &rep, 500), 1);
        assert_eq!(next_segment_from_timeline(&ctx, &rep, 1000), 1);
        assert_eq!(next_segment_from_timeline(&ctx, &rep, 8999), 9);
        // past the end of the timeline
        assert_eq!(next_segment_from_timeline(&ctx, &rep, 100000), -1);
    }

    #[test]
    fn test_next_segment_with_offset_correction() {
        let ctx = context();
        let rep = timeline_rep(&[(0, 9, 1000)], 1000, 3);
        assert_eq!(next_segment_from_timeline(&ctx, &rep, 500), 4);
    }

    #[test]
    fn test_vod_current_is_first() {
        let ctx = context();
        let mut rep = timeline_rep(&[(0, 9, 1000)], 1000, 4);
        rep.cur_seq_no = 9;
        assert_eq!(current_segment_no(&ctx, &rep, 1_000_000), 4);
    }

    #[test]
    fn test_live_timeline_current_trails_edge() {
        let mut ctx = context();
        ctx.is_live = true;
        ctx.availability_start_time = 1_000_000;
        // 10 closed segments of one second, then an open-ended run
        let rep = timeline_rep(&[(0, 9, 48000), (0, -1, 48000)], 48000, 1);
        // 100 seconds after availability start, reading begins about 60 seconds behind the edge
        let cur = current_segment_no(&ctx, &rep, 1_000_100);
        assert_eq!(cur, 41);
    }

    #[test]
    fn test_live_duration_current_and_window() {
        let mut ctx = context();
        ctx.is_live = true;
        ctx.availability_start_time = 1_000_000;
        ctx.time_shift_buffer_depth = 30;
        ctx.suggested_presentation_delay = 10;
        let mut rep = Representation::new(MediaType::Video);
        rep.fragment_duration = 2;
        rep.fragment_timescale = 1;
        rep.first_seq_no = 1;
        let now = 1_000_100;
        // (100 - 10) / 2 = 45 segments past the first
        assert_eq!(current_segment_no(&ctx, &rep, now), 46);
        // window floor honors the time-shift depth
        assert_eq!(min_segment_no(&ctx, &rep, now), 36);
        assert_eq!(max_segment_no(&ctx, &rep, now), 50);
    }

    #[test]
    fn test_live_duration_completed_segments_bias() {
        let mut ctx = context();
        ctx.is_live = true;
        ctx.availability_start_time = 1_000_000;
        let mut rep = Representation::new(MediaType::Video);
        rep.fragment_duration = 2;
        rep.fragment_timescale = 1;
        rep.first_seq_no = 0;
        let now = 1_000_100;
        // with no delay configured, stay one segment behind the edge
        assert_eq!(current_segment_no(&ctx, &rep, now), 49);
        assert_eq!(max_segment_no(&ctx, &rep, now), 49);
        ctx.fetch_completed_segments_only = false;
        assert_eq!(current_segment_no(&ctx, &rep, now), 50);
        assert_eq!(max_segment_no(&ctx, &rep, now), 50);
    }

    #[test]
    fn test_live_duration_publish_time_anchor() {
        // No availabilityStartTime: the schedule anchors on publishTime instead.
        let mut ctx = context();
        ctx.is_live = true;
        ctx.publish_time = 1000;
        let mut rep = Representation::new(MediaType::Video);
        rep.fragment_duration = 2;
        rep.fragment_timescale = 1;
        rep.first_seq_no = 0;
        assert_eq!(current_segment_no(&ctx, &rep, 0), 500);
        ctx.min_buffer_time = 3;
        assert_eq!(current_segment_no(&ctx, &rep, 0), 497);
    }

    #[test]
    fn test_vod_duration_max_segment() {
        let mut ctx = context();
        ctx.media_presentation_duration = 30;
        let mut rep = Representation::new(MediaType::Video);
        rep.fragment_duration = 96000;
        rep.fragment_timescale = 48000;
        rep.first_seq_no = 10;
        rep.cur_seq_no = 10;
        // 30 s of 2 s segments numbered from 10: the last one is 24
        assert_eq!(max_segment_no(&ctx, &rep, 0), 24);
    }

    #[test]
    fn test_vod_template_media_url() {
        let ctx = context();
        let mut rep = Representation::new(MediaType::Video);
        rep.url_template = Some(String::from("https://cdn.example.com/v/video1/$Number%05d$.m4s"));
        rep.fragment_duration = 96000;
        rep.fragment_timescale = 48000;
        rep.first_seq_no = 10;
        assert_eq!(media_url(&ctx, &rep, 12).as_deref(),
                   Some("https://cdn.example.com/v/video1/00012.m4s"));
    }

    #[test]
    fn test_max_segment_no_timeline() {
        let mut ctx = context();
        let rep = timeline_rep(&[(0, 2, 1000), (0, 0, 1000), (0, 4, 1000)], 1000, 0);
        assert_eq!(max_segment_no(&ctx, &rep, 0), 8);
        // an open-ended entry spans the declared Period duration
        ctx.period_duration = 20;
        let rep = timeline_rep(&[(0, -1, 1000)], 1000, 0);
        assert_eq!(max_segment_no(&ctx, &rep, 0), 20);
    }

    #[test]
    fn test_explicit_fragment_window() {
        let ctx = context();
        let mut rep = Representation::new(MediaType::Video);
        rep.first_seq_no = 3;
        rep.fragments = vec![
            crate::manifest::Fragment::new(String::from("https://cdn.example.com/s3.m4s")),
            crate::manifest::Fragment::new(String::from("https://cdn.example.com/s4.m4s")),
        ];
        assert_eq!(max_segment_no(&ctx, &rep, 0), 4);
        assert_eq!(min_segment_no(&ctx, &rep, 0), 3);
    }

    #[test]
    fn test_current_timepoint() {
        let mut ctx = context();
        ctx.is_live = true;
        let mut rep = timeline_rep(&[(0, 9, 48000)], 48000, 1);
        rep.cur_seq_no = 5;
        // zero period start pins the timepoint to the Period origin
        assert_eq!(current_timepoint(&ctx, &rep), 0);
        rep.period_start = 3600;
        assert_eq!(current_timepoint(&ctx, &rep), 3604);
        // duration-based live uses the window start
        let mut rep = Representation::new(MediaType::Audio);
        rep.fragment_duration = 2;
        rep.fragment_timescale = 1;
        rep.first_seq_no = 100;
        assert_eq!(current_timepoint(&ctx, &rep), 200);
    }
}
