//! Serde-based data model of the MPD manifest document.
//!
//! The MPD format is documented by ISO using an XML Schema at
//! <https://standards.iso.org/ittf/PubliclyAvailableStandards/MPEG-DASH_schema_files/DASH-MPD-edition2.xsd>.
//! We occasionally diverge from the standard when in-the-wild implementations do.
//!
//! We are using the quick_xml + serde crates to deserialize the XML content to Rust structs. Note
//! that serde will ignore unknown fields when deserializing, so we don't need to cover every single
//! possible element and attribute; only those the demultiplexer acts on are modelled here. Timing
//! attributes are kept as strings and converted by the manifest parser, which wants the lenient
//! warn-and-zero behavior of [`parse_xs_duration_secs`] rather than a deserialization failure.

use serde::Deserialize;
use tracing::warn;
use crate::{DashDemuxError, Result};

/// The title of the media stream.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct Title {
    #[serde(rename = "$text")]
    pub content: Option<String>,
}

/// The original source of the media stream.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct Source {
    #[serde(rename = "$text")]
    pub content: Option<String>,
}

/// Copyright information concerning the media stream.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct Copyright {
    #[serde(rename = "$text")]
    pub content: Option<String>,
}

/// Metainformation concerning the media stream (title, language, etc.)
#[derive(Debug, Default, Deserialize, Clone)]
pub struct ProgramInformation {
    pub Title: Option<Title>,
    pub Source: Option<Source>,
    pub Copyright: Option<Copyright>,
    /// Language in RFC 5646 format
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    #[serde(rename = "@moreInformationURL")]
    pub moreInformationURL: Option<String>,
}

/// Describes a sequence of contiguous Segments with identical duration.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct S {
    /// Start time in timescale units relative to the beginning of the Period. A value greater
    /// than the running sum of preceding durations expresses a discontinuity.
    #[serde(rename = "@t")]
    pub t: Option<i64>,
    /// The segment duration in timescale units.
    #[serde(rename = "@d")]
    pub d: i64,
    /// The repeat count (number of contiguous Segments with identical duration minus one). A
    /// value of -1 means the duration repeats until the end of the Period.
    #[serde(rename = "@r")]
    pub r: Option<i64>,
}

/// Contains a sequence of `S` elements, each of which describes a sequence of contiguous segments
/// of identical duration.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub segments: Vec<S>,
}

/// The first media segment in a sequence of Segments. Subsequent segments can be concatenated to
/// this segment to produce a media stream.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct Initialization {
    #[serde(rename = "@sourceURL")]
    pub sourceURL: Option<String>,
    #[serde(rename = "@range")]
    pub range: Option<String>,
}

/// Allows template-based `SegmentURL` construction. Specifies various substitution rules using
/// dynamic values such as `$Time$` and `$Number$` that map to a sequence of Segments.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct SegmentTemplate {
    #[serde(rename = "@initialization")]
    pub initialization: Option<String>,
    #[serde(rename = "@media")]
    pub media: Option<String>,
    pub SegmentTimeline: Option<SegmentTimeline>,
    #[serde(rename = "@startNumber")]
    pub startNumber: Option<i64>,
    // note: the spec says this is an unsigned int, not an xs:duration
    #[serde(rename = "@duration")]
    pub duration: Option<i64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<i64>,
    #[serde(rename = "@presentationTimeOffset")]
    pub presentationTimeOffset: Option<i64>,
}

/// A URI string that specifies one or more common locations for Segments and other resources.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct BaseURL {
    #[serde(rename = "$text", default)]
    pub base: String,
}

/// The URL of a media segment.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct SegmentURL {
    #[serde(rename = "@media")]
    pub media: Option<String>, // actually an URI
    #[serde(rename = "@mediaRange")]
    pub mediaRange: Option<String>,
}

/// Contains a sequence of SegmentURL elements.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct SegmentList {
    // note: the spec says this is an unsigned int, not an xs:duration
    #[serde(rename = "@duration")]
    pub duration: Option<i64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<i64>,
    #[serde(rename = "@startNumber")]
    pub startNumber: Option<i64>,
    pub Initialization: Option<Initialization>,
    pub SegmentTimeline: Option<SegmentTimeline>,
    #[serde(rename = "SegmentURL", default)]
    pub segment_urls: Vec<SegmentURL>,
}

/// A representation describes a version of the content, using a specific encoding and bitrate.
/// Streams often have multiple representations with different bitrates, to allow the client to
/// select that most suitable to its network conditions.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct Representation {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    // The specification says that @mimeType is mandatory, but it's not always present on
    // akamaized.net MPDs
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    /// An RFC6381 string, <https://tools.ietf.org/html/rfc6381>
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    /// If present, this attribute is expected to be set to "progressive" or "interlaced".
    #[serde(rename = "@scanType")]
    pub scanType: Option<String>,
    #[serde(rename = "@frameRate")]
    pub frameRate: Option<String>, // it can be something like "15/2"
    #[serde(rename = "@bandwidth")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "@width")]
    pub width: Option<u64>,
    #[serde(rename = "@height")]
    pub height: Option<u64>,
    pub BaseURL: Option<BaseURL>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub SegmentList: Option<SegmentList>,
}

/// Describes a media content component.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct ContentComponent {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    /// Language in RFC 5646 format
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
}

/// A property that the author of the MPD considers useful but not essential for processing.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct SupplementalProperty {
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
}

/// Contains a set of Representations. For example, if multiple language streams are available for
/// the audio content, each one can be in its own AdaptationSet.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct AdaptationSet {
    #[serde(rename = "@id")]
    pub id: Option<i64>,
    pub BaseURL: Option<BaseURL>,
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    /// Content language, in RFC 5646 format
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    /// An RFC6381 string, <https://tools.ietf.org/html/rfc6381>
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@frameRate")]
    pub frameRate: Option<String>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub SegmentList: Option<SegmentList>,
    pub ContentComponent: Option<ContentComponent>,
    #[serde(rename = "SupplementalProperty", default)]
    pub supplemental_properties: Vec<SupplementalProperty>,
    #[serde(rename = "Representation", default)]
    pub representations: Vec<Representation>,
}

/// Describes a chunk of the content with a start time and a duration. Content can be split up into
/// multiple periods (such as chapters, advertising segments).
#[derive(Debug, Default, Deserialize, Clone)]
pub struct Period {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@start")]
    pub start: Option<String>,
    // note: the spec says that this is an xs:duration, not an unsigned int as for other
    // "duration" fields
    #[serde(rename = "@duration")]
    pub duration: Option<String>,
    pub BaseURL: Option<BaseURL>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub SegmentList: Option<SegmentList>,
    #[serde(rename = "AdaptationSet", default)]
    pub adaptations: Vec<AdaptationSet>,
}

/// The root node of a parsed DASH MPD manifest.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct MPD {
    #[serde(rename = "@type")]
    pub mpdtype: Option<String>,
    #[serde(rename = "@xmlns")]
    pub xmlns: Option<String>,
    #[serde(rename = "@profiles")]
    pub profiles: Option<String>,
    #[serde(rename = "@minBufferTime")]
    pub minBufferTime: Option<String>,
    #[serde(rename = "@minimumUpdatePeriod")]
    pub minimumUpdatePeriod: Option<String>,
    #[serde(rename = "@timeShiftBufferDepth")]
    pub timeShiftBufferDepth: Option<String>,
    #[serde(rename = "@mediaPresentationDuration")]
    pub mediaPresentationDuration: Option<String>,
    #[serde(rename = "@suggestedPresentationDelay")]
    pub suggestedPresentationDelay: Option<String>,
    #[serde(rename = "@publishTime")]
    pub publishTime: Option<String>,
    #[serde(rename = "@availabilityStartTime")]
    pub availabilityStartTime: Option<String>,
    #[serde(rename = "@availabilityEndTime")]
    pub availabilityEndTime: Option<String>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
    /// There may be several BaseURLs, for redundancy (for example multiple CDNs)
    #[serde(rename = "BaseURL", default)]
    pub base_urls: Vec<BaseURL>,
    pub ProgramInformation: Option<ProgramInformation>,
}

/// Parse an MPD manifest, provided as an XML string, returning an `MPD` node.
pub fn parse(xml: &str) -> Result<MPD> {
    quick_xml::de::from_str(xml)
        .map_err(|e| DashDemuxError::InvalidManifest(format!("deserializing MPD: {e}")))
}

// Parse an XML duration string, as per https://www.w3.org/TR/xmlschema-2/#duration
//
// The lexical representation for duration is the ISO 8601 extended format PnYnMnDTnHnMnS. Only the
// D, H, M and S components contribute here; fractional seconds are truncated. A malformed value is
// reported with a warning and treated as zero, which matches how tolerant players deal with broken
// manifests in the wild.
//
// Examples: "PT0H0M30.030S", "PT1.2S", "PT1H30M15S", "P1DT2H"
pub fn parse_xs_duration_secs(s: &str) -> u64 {
    match iso8601::duration(s) {
        Ok(iso8601::Duration::YMDHMS { day, hour, minute, second, .. }) => {
            ((day as u64 * 24 + hour as u64) * 60 + minute as u64) * 60 + second as u64
        },
        Ok(iso8601::Duration::Weeks(_)) => {
            warn!("xs:duration {s} uses a week component, ignoring");
            0
        },
        Err(e) => {
            warn!("couldn't parse xs:duration {s}: {e:?}");
            0
        },
    }
}

// Parse an XML dateTime string in UTC ("2022-09-15T16:30:00Z", possibly with fractional seconds)
// into seconds since the Unix epoch. A malformed value is reported with a warning and treated as
// zero.
pub fn parse_xs_datetime_secs(s: &str) -> u64 {
    match s.parse::<chrono::DateTime<chrono::Utc>>() {
        Ok(dt) => dt.timestamp().max(0) as u64,
        Err(e) => {
            warn!("couldn't parse xs:dateTime {s}: {e}");
            0
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xs_duration() {
        assert_eq!(parse_xs_duration_secs("PT1H30M15S"), 5415);
        assert_eq!(parse_xs_duration_secs("P1DT2H"), 93600);
        assert_eq!(parse_xs_duration_secs("PT3H11M53S"), 11513);
        assert_eq!(parse_xs_duration_secs("PT30M38S"), 1838);
        assert_eq!(parse_xs_duration_secs("PT0H10M0.00S"), 600);
        // fractional seconds are truncated
        assert_eq!(parse_xs_duration_secs("PT1.5S"), 1);
        assert_eq!(parse_xs_duration_secs("PT0S"), 0);
        // malformed values map to zero
        assert_eq!(parse_xs_duration_secs(""), 0);
        assert_eq!(parse_xs_duration_secs("foobles"), 0);
    }

    #[test]
    fn test_parse_xs_datetime() {
        assert_eq!(parse_xs_datetime_secs("1970-01-01T00:00:00Z"), 0);
        assert_eq!(parse_xs_datetime_secs("1970-01-01T01:01:01Z"), 3661);
        assert_eq!(parse_xs_datetime_secs("2022-09-15T16:30:00Z"), 1663259400);
        assert_eq!(parse_xs_datetime_secs("2022-09-15T16:30:00.5Z"), 1663259400);
        assert_eq!(parse_xs_datetime_secs("yesterday-ish"), 0);
    }

    #[test]
    fn test_parse_minimal_mpd() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
          <MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static"
               mediaPresentationDuration="PT30S">
            <Period>
              <AdaptationSet contentType="video" mimeType="video/mp4">
                <Representation id="v1" bandwidth="1000000" width="1280" height="720"
                                codecs="avc1.640028">
                  <SegmentTemplate media="seg-$Number$.m4s" initialization="init.mp4"
                                   duration="96000" timescale="48000" startNumber="1"/>
                </Representation>
              </AdaptationSet>
            </Period>
          </MPD>"#;
        let mpd = parse(xml).unwrap();
        assert_eq!(mpd.mpdtype.as_deref(), Some("static"));
        assert_eq!(mpd.periods.len(), 1);
        let adapt = &mpd.periods[0].adaptations[0];
        assert_eq!(adapt.contentType.as_deref(), Some("video"));
        let rep = &adapt.representations[0];
        assert_eq!(rep.id.as_deref(), Some("v1"));
        assert_eq!(rep.bandwidth, Some(1000000));
        let st = rep.SegmentTemplate.as_ref().unwrap();
        assert_eq!(st.duration, Some(96000));
        assert_eq!(st.timescale, Some(48000));
        assert_eq!(st.startNumber, Some(1));
    }

    #[test]
    fn test_parse_segment_timeline() {
        let xml = r#"<MPD type="dynamic" availabilityStartTime="2022-09-15T16:30:00Z">
            <Period start="PT0S">
              <AdaptationSet contentType="video">
                <Representation id="v1" bandwidth="500000">
                  <SegmentTemplate media="s-$Time$.m4s" timescale="48000">
                    <SegmentTimeline>
                      <S t="0" d="48000" r="9"/>
                      <S d="48000" r="-1"/>
                    </SegmentTimeline>
                  </SegmentTemplate>
                </Representation>
              </AdaptationSet>
            </Period>
          </MPD>"#;
        let mpd = parse(xml).unwrap();
        let st = mpd.periods[0].adaptations[0].representations[0].SegmentTemplate.as_ref().unwrap();
        let tl = st.SegmentTimeline.as_ref().unwrap();
        assert_eq!(tl.segments.len(), 2);
        assert_eq!(tl.segments[0].t, Some(0));
        assert_eq!(tl.segments[0].r, Some(9));
        assert_eq!(tl.segments[1].t, None);
        assert_eq!(tl.segments[1].r, Some(-1));
    }

    #[test]
    fn test_parse_segment_list() {
        let xml = r#"<MPD type="static">
            <Period>
              <AdaptationSet contentType="audio" lang="en">
                <Representation id="a1" bandwidth="64000">
                  <SegmentList duration="10" timescale="1">
                    <Initialization sourceURL="init.mp4" range="0-862"/>
                    <SegmentURL media="s1.m4s"/>
                    <SegmentURL media="s2.m4s" mediaRange="100-200"/>
                  </SegmentList>
                </Representation>
              </AdaptationSet>
            </Period>
          </MPD>"#;
        let mpd = parse(xml).unwrap();
        let sl = mpd.periods[0].adaptations[0].representations[0].SegmentList.as_ref().unwrap();
        assert_eq!(sl.segment_urls.len(), 2);
        assert_eq!(sl.segment_urls[0].media.as_deref(), Some("s1.m4s"));
        assert_eq!(sl.segment_urls[1].mediaRange.as_deref(), Some("100-200"));
        let init = sl.Initialization.as_ref().unwrap();
        assert_eq!(init.sourceURL.as_deref(), Some("init.mp4"));
        assert_eq!(init.range.as_deref(), Some("0-862"));
    }

    #[test]
    fn test_parse_base_url_text() {
        let xml = r#"<MPD type="static">
            <BaseURL>https://cdn.example.com/media/</BaseURL>
            <Period>
              <AdaptationSet contentType="video">
                <Representation id="v1" bandwidth="1">
                  <BaseURL>video.mp4</BaseURL>
                </Representation>
              </AdaptationSet>
            </Period>
          </MPD>"#;
        let mpd = parse(xml).unwrap();
        assert_eq!(mpd.base_urls[0].base, "https://cdn.example.com/media/");
        let rep = &mpd.periods[0].adaptations[0].representations[0];
        assert_eq!(rep.BaseURL.as_ref().unwrap().base, "video.mp4");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("this is not XML").is_err());
    }
}
