//! Materialized manifest model and the parser that builds it from an MPD document.
//!
//! The serde model in [`crate::mpd`] mirrors the XML document; this module turns it into the
//! state the demultiplexer actually runs on: one [`DashContext`] of presentation-global timing
//! data plus one [`Representation`] per admitted media stream, each with a single resolved
//! segment-addressing scheme (explicit fragment list, segment timeline, or URL template with a
//! fixed fragment duration).

use std::collections::HashMap;
use tracing::{debug, trace, warn};
use url::Url;
use crate::mpd::{self, AdaptationSet, Period, SegmentList, SegmentTemplate};
use crate::scheduler::resolve_url_template;
use crate::{DashDemuxError, Result};

/// Manifests larger than this are refused outright.
pub const MAX_MANIFEST_SIZE: usize = 50 * 1024;

/// The kind of media content carried by a Representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
}

/// An independently fetchable byte range within a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Absolute URL of the resource.
    pub url: String,
    /// Byte offset of the first byte of the fragment within the resource.
    pub offset: u64,
    /// Length in bytes; `None` means read to the end of the resource.
    pub size: Option<u64>,
}

impl Fragment {
    pub fn new(url: String) -> Fragment {
        Fragment { url, offset: 0, size: None }
    }

    /// Build a fragment from a URL and an optional `Initialization@range` / `@mediaRange`
    /// specifier of the form "45-67" (both bounds inclusive).
    pub fn with_range(url: String, range: Option<&str>) -> Result<Fragment> {
        let mut frag = Fragment::new(url);
        if let Some(range) = range {
            let (start, end) = parse_range(range)?;
            frag.offset = start;
            frag.size = Some(end.saturating_sub(start) + 1);
        }
        Ok(frag)
    }
}

// Parse a range specifier, such as an Initialization@range or SegmentURL@mediaRange attribute, of
// the form "45-67".
fn parse_range(range: &str) -> Result<(u64, u64)> {
    let v: Vec<&str> = range.split_terminator('-').collect();
    if v.len() != 2 {
        return Err(DashDemuxError::InvalidManifest(format!("invalid range specifier: {range}")));
    }
    let start: u64 = v[0].parse()
        .map_err(|_| DashDemuxError::InvalidManifest(String::from("invalid start for range specifier")))?;
    let end: u64 = v[1].parse()
        .map_err(|_| DashDemuxError::InvalidManifest(String::from("invalid end for range specifier")))?;
    Ok((start, end))
}

/// One run of contiguous segments of identical duration, in timescale units.
///
/// A `start_time` greater than the sum of the preceding runs expresses a discontinuity; a
/// `repeat` of -1 extends the run until the end of the Period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub start_time: i64,
    pub repeat: i64,
    pub duration: i64,
}

/// A video frame rate, expressed as a rational as in the MPD `frameRate` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameRate {
    pub num: i64,
    pub den: i64,
}

impl FrameRate {
    /// Parse a frameRate attribute, either "30" or "30000/1001".
    pub fn parse(s: &str) -> Option<FrameRate> {
        match s.split_once('/') {
            Some((num, den)) => {
                let num = num.parse().ok()?;
                let den = den.parse().ok()?;
                Some(FrameRate { num, den })
            },
            None => Some(FrameRate { num: s.parse().ok()?, den: 1 }),
        }
    }
}

/// One encoding of one media track, delivered as a sequence of segments.
///
/// Exactly one of the addressing sources is authoritative: a non-empty `fragments` vector, a
/// non-empty `timelines` vector, or `url_template` together with `fragment_duration`.
#[derive(Debug, Clone)]
pub struct Representation {
    pub id: String,
    pub media_type: MediaType,
    pub lang: Option<String>,
    pub codecs: Option<String>,
    pub scan_type: Option<String>,
    pub bandwidth: u64,
    pub frame_rate: FrameRate,
    pub width: u64,
    pub height: u64,

    /// Media URL pattern with `$RepresentationID$` and `$Bandwidth$` already substituted;
    /// `$Number$` and `$Time$` are filled in per segment.
    pub url_template: Option<String>,
    /// Explicit fragment list (SegmentList addressing or single-file mode).
    pub fragments: Vec<Fragment>,
    pub timelines: Vec<TimelineEntry>,
    pub init_section: Option<Fragment>,

    /// Fixed fragment duration in `fragment_timescale` units (template@duration addressing).
    pub fragment_duration: i64,
    pub fragment_timescale: i64,
    pub presentation_time_offset: i64,
    pub start_number: i64,

    pub first_seq_no: i64,
    pub last_seq_no: i64,
    pub cur_seq_no: i64,
    /// Timestamp of the most recent packet, in a fixed 90 kHz clock.
    pub cur_timestamp: i64,

    /// Period attributes observed when this Representation was admitted.
    pub period_start: u64,
    pub period_duration: u64,
    pub period_mpd_duration: u64,
}

impl Representation {
    /// Create an empty Representation of the given media type.
    pub fn new(media_type: MediaType) -> Representation {
        Representation {
            id: String::new(),
            media_type,
            lang: None,
            codecs: None,
            scan_type: None,
            bandwidth: 0,
            frame_rate: FrameRate::default(),
            width: 0,
            height: 0,
            url_template: None,
            fragments: Vec::new(),
            timelines: Vec::new(),
            init_section: None,
            fragment_duration: 0,
            fragment_timescale: 0,
            presentation_time_offset: 0,
            start_number: 0,
            first_seq_no: 0,
            last_seq_no: 0,
            cur_seq_no: 0,
            cur_timestamp: 0,
            period_start: 0,
            period_duration: 0,
            period_mpd_duration: 0,
        }
    }

    /// Record the active Period attributes on this Representation.
    pub fn set_period_from(&mut self, ctx: &DashContext) {
        self.period_start = ctx.period_start;
        self.period_duration = ctx.period_duration;
        self.period_mpd_duration = ctx.media_presentation_duration;
    }
}

/// Presentation-global state shared by every Representation of the active Period.
#[derive(Debug, Clone)]
pub struct DashContext {
    /// The manifest URL after redirects; relative references resolve against it.
    pub base_url: String,
    /// `MPD@type="dynamic"`.
    pub is_live: bool,

    pub availability_start_time: u64,
    pub availability_end_time: u64,
    pub publish_time: u64,
    pub minimum_update_period: u64,
    pub suggested_presentation_delay: u64,
    pub time_shift_buffer_depth: u64,
    pub min_buffer_time: u64,
    pub media_presentation_duration: u64,

    /// Start and duration of the active Period, in seconds.
    pub period_start: u64,
    pub period_duration: u64,

    /// Bias timeline segment numbers by `first_seq_no`.
    pub use_timeline_segment_offset_correction: bool,
    /// Bias the live edge back by one segment so only fully written segments are fetched.
    pub fetch_completed_segments_only: bool,
}

/// The result of parsing one manifest document: global context plus the admitted
/// Representations, grouped by media type.
#[derive(Debug, Clone, Default)]
pub struct ParsedMpd {
    pub context: DashContext,
    pub videos: Vec<Representation>,
    pub audios: Vec<Representation>,
    pub subtitles: Vec<Representation>,
    /// ProgramInformation metadata (Title, Source, Copyright).
    pub metadata: HashMap<String, String>,
}

impl Default for DashContext {
    fn default() -> DashContext {
        DashContext {
            base_url: String::new(),
            is_live: false,
            availability_start_time: 0,
            availability_end_time: 0,
            publish_time: 0,
            minimum_update_period: 0,
            suggested_presentation_delay: 0,
            time_shift_buffer_depth: 0,
            min_buffer_time: 0,
            media_presentation_duration: 0,
            period_start: 0,
            period_duration: 0,
            use_timeline_segment_offset_correction: true,
            fetch_completed_segments_only: true,
        }
    }
}

fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://") ||
        s.starts_with("https://") ||
        s.starts_with("file://")
}

fn parse_error(why: &str, e: impl std::error::Error) -> DashDemuxError {
    DashDemuxError::InvalidManifest(format!("{why}: {e}"))
}

// Resolve a BaseURL entry, segment reference or template against the current base. An absolute
// reference replaces the base outright; a relative one follows RFC 3986. CDNs frequently hang an
// auth token off the manifest URL's query string, and every segment fetch must carry it, so the
// base's query survives resolution unless the reference has a query of its own.
//
// resolve_reference(https://cdn.example.com/live/Manifest.mpd?token=abc, chunk-$Number$.m4s)
//   => https://cdn.example.com/live/chunk-$Number$.m4s?token=abc
pub(crate) fn resolve_reference(current: &Url, reference: &str) -> Result<Url> {
    if is_absolute_url(reference) {
        return Url::parse(reference).map_err(|e| parse_error("parsing BaseURL", e));
    }
    let mut resolved = current.join(reference)
        .map_err(|e| parse_error("resolving reference against BaseURL", e))?;
    if resolved.query().is_none() {
        resolved.set_query(current.query());
    }
    Ok(resolved)
}

/// Resolve the BaseURL inheritance chain `[MPD, Period, AdaptationSet, Representation]` into a
/// single absolute base.
///
/// The innermost absolute entry becomes the root (falling back to the manifest URL itself), and
/// every entry nested deeper than the root is resolved against it in document order. When
/// relative entries follow an absolute root lacking a trailing `/`, one is inserted so the
/// relatives append below it rather than replacing its last path segment.
pub fn resolve_base(manifest_url: &str, chain: [Option<&str>; 4]) -> Result<Url> {
    let mut root_idx = None;
    for (i, entry) in chain.iter().enumerate().rev() {
        if let Some(e) = entry {
            if is_absolute_url(e.trim()) {
                root_idx = Some(i);
                break;
            }
        }
    }
    let first_relative = root_idx.map_or(0, |i| i + 1);
    let have_relatives = chain[first_relative..].iter()
        .any(|e| e.map_or(false, |s| !s.trim().is_empty()));
    let mut base = match root_idx {
        Some(i) => {
            let mut root = chain[i].unwrap().trim().to_string();
            if have_relatives && !root.ends_with('/') {
                root.push('/');
            }
            Url::parse(&root).map_err(|e| parse_error("parsing BaseURL", e))?
        },
        None => Url::parse(manifest_url)
            .map_err(|e| parse_error("parsing manifest URL", e))?,
    };
    for entry in chain[first_relative..].iter().flatten() {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        base = resolve_reference(&base, entry)?;
    }
    Ok(base)
}

// Determine the media type carried by a node from its contentType or mimeType attribute.
fn media_type_of(content_type: Option<&str>, mime_type: Option<&str>) -> Option<MediaType> {
    for val in [content_type, mime_type].into_iter().flatten() {
        let val = val.to_ascii_lowercase();
        if val.contains("video") {
            return Some(MediaType::Video);
        } else if val.contains("audio") {
            return Some(MediaType::Audio);
        } else if val.contains("text") {
            return Some(MediaType::Subtitle);
        }
    }
    None
}

// Walk a SegmentTemplate inheritance chain (most specific first), returning the first value the
// accessor produces.
fn inherited_template_attr<T>(
    chain: &[Option<&SegmentTemplate>],
    accessor: impl Fn(&SegmentTemplate) -> Option<T>,
) -> Option<T> {
    chain.iter().flatten().find_map(|st| accessor(st))
}

fn inherited_list_attr<T>(
    chain: &[Option<&SegmentList>],
    accessor: impl Fn(&SegmentList) -> Option<T>,
) -> Option<T> {
    chain.iter().flatten().find_map(|sl| accessor(sl))
}

fn timeline_entries(tl: &mpd::SegmentTimeline) -> Vec<TimelineEntry> {
    tl.segments.iter()
        .map(|s| TimelineEntry {
            start_time: s.t.unwrap_or(0),
            repeat: s.r.unwrap_or(0),
            duration: s.d,
        })
        .collect()
}

/// Parse one manifest document into a [`ParsedMpd`].
///
/// `manifest_url` is the document URL after redirects. `current_timepoint` is the playback
/// position in seconds since availability start (0 for the initial parse) used for Period
/// selection; `prev_period_start` is the start of the previously active Period (0 initially),
/// which the fallback selection will not move behind.
pub fn parse_manifest(
    manifest_url: &str,
    xml: &str,
    current_timepoint: u64,
    prev_period_start: u64,
    options: &crate::demux::DashOptions,
) -> Result<ParsedMpd> {
    if xml.len() > MAX_MANIFEST_SIZE {
        return Err(DashDemuxError::InvalidManifest(
            format!("manifest too large: {} bytes", xml.len())));
    }
    let doc = mpd::parse(xml)?;

    let mut ctx = DashContext {
        base_url: manifest_url.to_string(),
        use_timeline_segment_offset_correction: options.use_timeline_segment_offset_correction,
        fetch_completed_segments_only: options.fetch_completed_segments_only,
        ..DashContext::default()
    };

    let mpdtype = doc.mpdtype.as_deref()
        .ok_or_else(|| DashDemuxError::InvalidManifest(String::from("missing type attribute on MPD")))?;
    ctx.is_live = mpdtype.eq_ignore_ascii_case("dynamic");

    if let Some(v) = &doc.availabilityStartTime {
        ctx.availability_start_time = mpd::parse_xs_datetime_secs(v);
    }
    if let Some(v) = &doc.availabilityEndTime {
        ctx.availability_end_time = mpd::parse_xs_datetime_secs(v);
    }
    if let Some(v) = &doc.publishTime {
        ctx.publish_time = mpd::parse_xs_datetime_secs(v);
    }
    if let Some(v) = &doc.minimumUpdatePeriod {
        ctx.minimum_update_period = mpd::parse_xs_duration_secs(v);
    }
    if let Some(v) = &doc.timeShiftBufferDepth {
        ctx.time_shift_buffer_depth = mpd::parse_xs_duration_secs(v);
    }
    if let Some(v) = &doc.minBufferTime {
        ctx.min_buffer_time = mpd::parse_xs_duration_secs(v);
    }
    if let Some(v) = &doc.suggestedPresentationDelay {
        ctx.suggested_presentation_delay = mpd::parse_xs_duration_secs(v);
    }
    if let Some(v) = &doc.mediaPresentationDuration {
        ctx.media_presentation_duration = mpd::parse_xs_duration_secs(v);
    }

    let mut metadata = HashMap::new();
    if let Some(pi) = &doc.ProgramInformation {
        if let Some(t) = pi.Title.as_ref().and_then(|t| t.content.clone()) {
            metadata.insert(String::from("Title"), t);
        }
        if let Some(s) = pi.Source.as_ref().and_then(|s| s.content.clone()) {
            metadata.insert(String::from("Source"), s);
        }
        if let Some(c) = pi.Copyright.as_ref().and_then(|c| c.content.clone()) {
            metadata.insert(String::from("Copyright"), c);
        }
    }

    // Period selection: prefer the Period whose start is at or before the current timepoint and
    // closest to it. Lacking one, default to the newest Period that does not move behind the
    // previously active Period.
    let mut matching: Option<&Period> = None;
    let mut default: Option<&Period> = None;
    let mut min_period_diff = i64::MAX;
    let mut default_floor = prev_period_start;
    for period in &doc.periods {
        let start_sec = period.start.as_deref().map(mpd::parse_xs_duration_secs).unwrap_or(0);
        let duration_sec = period.duration.as_deref().map(mpd::parse_xs_duration_secs).unwrap_or(0);
        debug!("found Period: start {start_sec}s, duration {duration_sec}s, \
                current timepoint {current_timepoint}s");
        if matching.is_none() && start_sec >= default_floor {
            trace!("default Period candidate at start {start_sec}s");
            default_floor = start_sec;
            ctx.period_start = start_sec;
            ctx.period_duration = duration_sec;
            default = Some(period);
        }
        let diff = current_timepoint as i64 - start_sec as i64;
        if diff >= 0 && diff <= min_period_diff {
            trace!("current timepoint {current_timepoint}s matched to Period start {start_sec}s");
            min_period_diff = diff;
            ctx.period_start = start_sec;
            ctx.period_duration = duration_sec;
            matching = Some(period);
        }
    }
    let period = matching.or(default)
        .ok_or_else(|| DashDemuxError::InvalidManifest(String::from("no suitable Period")))?;
    if ctx.period_start > 0 {
        ctx.media_presentation_duration = ctx.period_duration;
    }

    let mpd_base = doc.base_urls.first().map(|b| b.base.as_str());
    let period_base = period.BaseURL.as_ref().map(|b| b.base.as_str());

    let mut parsed = ParsedMpd {
        context: ctx,
        videos: Vec::new(),
        audios: Vec::new(),
        subtitles: Vec::new(),
        metadata,
    };

    for adaptation in &period.adaptations {
        for rep in &adaptation.representations {
            match parse_representation(manifest_url, &parsed.context, period,
                                       mpd_base, period_base, adaptation, rep)? {
                Some(rep) => {
                    match rep.media_type {
                        MediaType::Video => parsed.videos.push(rep),
                        MediaType::Audio => parsed.audios.push(rep),
                        MediaType::Subtitle => parsed.subtitles.push(rep),
                    }
                },
                None => continue,
            }
        }
    }

    Ok(parsed)
}

// Convert one Representation node into the materialized model, resolving its addressing scheme.
// Returns Ok(None) for nodes that are skipped (unknown media type, unrecognized addressing).
fn parse_representation(
    manifest_url: &str,
    ctx: &DashContext,
    period: &Period,
    mpd_base: Option<&str>,
    period_base: Option<&str>,
    adaptation: &AdaptationSet,
    rep_node: &mpd::Representation,
) -> Result<Option<Representation>> {
    let media_type = media_type_of(rep_node.contentType.as_deref(), rep_node.mimeType.as_deref())
        .or_else(|| adaptation.ContentComponent.as_ref()
                 .and_then(|cc| media_type_of(cc.contentType.as_deref(), None)))
        .or_else(|| media_type_of(adaptation.contentType.as_deref(),
                                  adaptation.mimeType.as_deref()));
    let Some(media_type) = media_type else {
        debug!("skipping Representation with unsupported media type");
        return Ok(None);
    };

    let mut rep = Representation::new(media_type);
    if let Some(id) = &rep_node.id {
        rep.id = id.clone();
    }
    rep.bandwidth = rep_node.bandwidth.unwrap_or(0);
    rep.lang = adaptation.lang.clone();

    let base = resolve_base(manifest_url, [
        mpd_base,
        period_base,
        adaptation.BaseURL.as_ref().map(|b| b.base.as_str()),
        rep_node.BaseURL.as_ref().map(|b| b.base.as_str()),
    ])?;

    // Template parameters known at admission time; $Number$ and $Time$ stay in the pattern for
    // the scheduler to fill per segment.
    let mut params = HashMap::from([("RepresentationID", rep.id.clone())]);
    if let Some(b) = rep_node.bandwidth {
        params.insert("Bandwidth", b.to_string());
    }

    let template_chain = [
        rep_node.SegmentTemplate.as_ref(),
        adaptation.SegmentTemplate.as_ref(),
        period.SegmentTemplate.as_ref(),
    ];
    let list_chain = [
        rep_node.SegmentList.as_ref(),
        adaptation.SegmentList.as_ref(),
        period.SegmentList.as_ref(),
    ];

    if template_chain.iter().any(Option::is_some) {
        if let Some(init) = inherited_template_attr(&template_chain, |st| st.initialization.clone()) {
            let path = resolve_url_template(&init, &params);
            let url = resolve_reference(&base, &path)?;
            rep.init_section = Some(Fragment::new(url.to_string()));
        }
        if let Some(media) = inherited_template_attr(&template_chain, |st| st.media.clone()) {
            let path = resolve_url_template(&media, &params);
            let url = resolve_reference(&base, &path)?;
            rep.url_template = Some(url.to_string());
        }
        if let Some(pto) = inherited_template_attr(&template_chain, |st| st.presentationTimeOffset) {
            rep.presentation_time_offset = pto;
            trace!("presentation_time_offset = {pto}");
        }
        if let Some(d) = inherited_template_attr(&template_chain, |st| st.duration) {
            rep.fragment_duration = d;
        }
        if let Some(ts) = inherited_template_attr(&template_chain, |st| st.timescale) {
            rep.fragment_timescale = ts;
        }
        if let Some(sn) = inherited_template_attr(&template_chain, |st| st.startNumber) {
            rep.start_number = sn;
            rep.first_seq_no = sn;
        }
        for prop in &adaptation.supplemental_properties {
            if prop.schemeIdUri.as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("http://dashif.org/guidelines/last-segment-number"))
            {
                match prop.value.as_deref().map(str::parse::<i64>) {
                    Some(Ok(n)) => rep.last_seq_no = n - 1,
                    _ => warn!("missing or invalid value on last-segment-number property"),
                }
            }
        }
        let timeline = template_chain.iter().flatten()
            .find_map(|st| st.SegmentTimeline.as_ref())
            .or_else(|| list_chain[1..].iter().flatten()
                     .find_map(|sl| sl.SegmentTimeline.as_ref()));
        if let Some(tl) = timeline {
            rep.timelines = timeline_entries(tl);
        }
    } else if rep_node.BaseURL.is_some() && rep_node.SegmentList.is_none() {
        // Single-file mode: the resolved BaseURL chain names the media resource itself.
        let url = resolve_url_template(base.as_str(), &params);
        rep.fragments.push(Fragment::new(url));
    } else if let Some(list) = list_chain.iter().flatten().next() {
        if let Some(d) = inherited_list_attr(&list_chain, |sl| sl.duration) {
            rep.fragment_duration = d;
        }
        if let Some(ts) = inherited_list_attr(&list_chain, |sl| sl.timescale) {
            rep.fragment_timescale = ts;
        }
        if let Some(sn) = inherited_list_attr(&list_chain, |sl| sl.startNumber) {
            rep.start_number = sn;
            rep.first_seq_no = sn;
        }
        if let Some(init) = &list.Initialization {
            if init.sourceURL.is_some() || init.range.is_some() {
                let url = match &init.sourceURL {
                    Some(su) => {
                        let path = resolve_url_template(su, &params);
                        resolve_reference(&base, &path)?.to_string()
                    },
                    None => base.to_string(),
                };
                rep.init_section = Some(Fragment::with_range(url, init.range.as_deref())?);
            }
        }
        for seg in &list.segment_urls {
            if seg.media.is_none() && seg.mediaRange.is_none() {
                continue;
            }
            let url = match &seg.media {
                Some(m) => {
                    let path = resolve_url_template(m, &params);
                    resolve_reference(&base, &path)?.to_string()
                },
                None => base.to_string(),
            };
            rep.fragments.push(Fragment::with_range(url, seg.mediaRange.as_deref())?);
        }
        let timeline = list_chain[1..].iter().flatten()
            .find_map(|sl| sl.SegmentTimeline.as_ref());
        if let Some(tl) = timeline {
            rep.timelines = timeline_entries(tl);
        }
    } else {
        warn!("unknown addressing format on Representation {}", rep.id);
        return Ok(None);
    }

    if rep.fragment_duration > 0 && rep.fragment_timescale == 0 {
        rep.fragment_timescale = 1;
    }

    if media_type == MediaType::Video {
        if let Some(fr) = &rep_node.frameRate {
            match FrameRate::parse(fr) {
                Some(parsed) => rep.frame_rate = parsed,
                None => debug!("ignoring invalid frame rate '{fr}'"),
            }
        }
        rep.codecs = rep_node.codecs.clone().or_else(|| adaptation.codecs.clone());
        rep.scan_type = rep_node.scanType.clone();
        rep.width = rep_node.width.unwrap_or(0);
        rep.height = rep_node.height.unwrap_or(0);
    } else if media_type == MediaType::Audio {
        rep.codecs = rep_node.codecs.clone().or_else(|| adaptation.codecs.clone());
    }

    rep.cur_seq_no = rep.first_seq_no;
    rep.set_period_from(ctx);
    Ok(Some(rep))
}
