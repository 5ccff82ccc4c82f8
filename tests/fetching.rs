// End-to-end tests for the demuxer pipeline, serving manifests and media segments from a local
// axum server.
//
// To run tests while enabling printing to stdout/stderr
//
//    cargo test --test fetching -- --show-output

pub mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use axum::{routing::get, Router};
use axum::extract::State;
use axum::http::{header, Method, Uri};
use axum::response::IntoResponse;
use dash_stream_demux::{DashDemuxError, DashDemuxer, DashOptions, MediaType};
use common::{payload_for, serve, setup_logging, MockOpener};

#[derive(Debug, Default)]
struct AppState {
    manifest: String,
    manifest_requests: AtomicUsize,
    init_requests: AtomicUsize,
    segment_requests: AtomicUsize,
}

async fn send_manifest(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.manifest_requests.fetch_add(1, Ordering::SeqCst);
    ([(header::CONTENT_TYPE, "application/dash+xml")], state.manifest.clone())
}

async fn send_media(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
) -> impl IntoResponse {
    if method == Method::GET {
        if uri.path().contains("init") {
            state.init_requests.fetch_add(1, Ordering::SeqCst);
        } else {
            state.segment_requests.fetch_add(1, Ordering::SeqCst);
        }
    }
    ([(header::CONTENT_TYPE, "video/mp4")], payload_for(uri.path()))
}

fn media_server(manifest: String) -> (Router, Arc<AppState>) {
    let state = Arc::new(AppState { manifest, ..AppState::default() });
    let app = Router::new()
        .route("/media/Manifest.mpd", get(send_manifest))
        .fallback(send_media)
        .with_state(state.clone());
    (app, state)
}

#[tokio::test]
async fn test_vod_segment_list_is_gapless() {
    setup_logging();
    let manifest = String::from(r#"<MPD type="static" mediaPresentationDuration="PT30S">
        <Period>
          <AdaptationSet contentType="video" mimeType="video/mp4">
            <Representation id="v1" bandwidth="2000000" width="1280" height="720">
              <SegmentList duration="10" timescale="1">
                <Initialization sourceURL="v1-init.mp4"/>
                <SegmentURL media="v1-s1.m4s"/>
                <SegmentURL media="v1-s2.m4s"/>
                <SegmentURL media="v1-s3.m4s"/>
              </SegmentList>
            </Representation>
          </AdaptationSet>
        </Period>
      </MPD>"#);
    let (app, state) = media_server(manifest);
    let base = serve(app).await;

    let mut demuxer = DashDemuxer::open(
        &format!("{base}/media/Manifest.mpd"),
        DashOptions::default(),
        Box::new(MockOpener),
    ).await.unwrap();

    assert_eq!(demuxer.duration(), Some(std::time::Duration::from_secs(30)));
    assert!(!demuxer.is_live());
    let info = demuxer.stream_info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].media_type, MediaType::Video);
    assert_eq!(info[0].id, "v1");
    assert_eq!(info[0].width, 1280);

    let mut collected = Vec::new();
    let mut seg_numbers = Vec::new();
    loop {
        match demuxer.read_packet().await {
            Ok(pkt) => {
                assert_eq!(pkt.stream_index, 0);
                assert_eq!(pkt.metadata.get("fragDuration").map(String::as_str), Some("10"));
                assert_eq!(pkt.metadata.get("fragTimescale").map(String::as_str), Some("1"));
                assert_eq!(pkt.metadata.get("segSize").map(String::as_str), Some("2000"));
                seg_numbers.push(pkt.metadata.get("segNumber").cloned().unwrap());
                collected.extend_from_slice(&pkt.data);
            },
            Err(DashDemuxError::EndOfStream) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    // Each stream cycle replays the init section in front of the media segment, and segments
    // arrive in order with no gaps or duplication.
    let init = payload_for("/media/v1-init.mp4");
    let mut expected = Vec::new();
    for seg in ["/media/v1-s1.m4s", "/media/v1-s2.m4s", "/media/v1-s3.m4s"] {
        expected.extend_from_slice(&init);
        expected.extend_from_slice(&payload_for(seg));
    }
    assert_eq!(collected, expected);
    assert_eq!(seg_numbers.first().map(String::as_str), Some("0"));
    assert_eq!(seg_numbers.last().map(String::as_str), Some("2"));

    // The init section was fetched from the network exactly once.
    assert_eq!(state.init_requests.load(Ordering::SeqCst), 1);
    assert_eq!(state.segment_requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_vod_single_file() {
    setup_logging();
    let manifest = String::from(r#"<MPD type="static" mediaPresentationDuration="PT10S">
        <Period>
          <AdaptationSet contentType="video" mimeType="video/mp4">
            <Representation id="v1" bandwidth="2000000">
              <BaseURL>video.mp4</BaseURL>
            </Representation>
          </AdaptationSet>
        </Period>
      </MPD>"#);
    let (app, state) = media_server(manifest);
    let base = serve(app).await;

    let mut demuxer = DashDemuxer::open(
        &format!("{base}/media/Manifest.mpd"),
        DashOptions::default(),
        Box::new(MockOpener),
    ).await.unwrap();

    let mut collected = Vec::new();
    loop {
        match demuxer.read_packet().await {
            Ok(pkt) => {
                assert_eq!(pkt.metadata.get("segNumber").map(String::as_str), Some("0"));
                assert_eq!(pkt.metadata.get("segSize").map(String::as_str), Some("2000"));
                collected.extend_from_slice(&pkt.data);
            },
            Err(DashDemuxError::EndOfStream) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    // no init section: the stream is exactly the resource
    assert_eq!(collected, payload_for("/media/video.mp4"));
    assert_eq!(state.segment_requests.load(Ordering::SeqCst), 1);
    assert_eq!(state.init_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_vod_template_numbering() {
    setup_logging();
    let manifest = String::from(r#"<MPD type="static" mediaPresentationDuration="PT6S">
        <Period>
          <AdaptationSet contentType="video" mimeType="video/mp4">
            <Representation id="video1" bandwidth="1000000">
              <SegmentTemplate media="$RepresentationID$/$Number%05d$.m4s"
                               initialization="$RepresentationID$/init.mp4"
                               startNumber="10" duration="2" timescale="1"/>
            </Representation>
          </AdaptationSet>
        </Period>
      </MPD>"#);
    let (app, state) = media_server(manifest);
    let base = serve(app).await;

    let mut demuxer = DashDemuxer::open(
        &format!("{base}/media/Manifest.mpd"),
        DashOptions::default(),
        Box::new(MockOpener),
    ).await.unwrap();

    let mut seg_numbers = Vec::new();
    let mut collected = Vec::new();
    loop {
        match demuxer.read_packet().await {
            Ok(pkt) => {
                seg_numbers.push(pkt.metadata.get("segNumber").cloned().unwrap());
                collected.extend_from_slice(&pkt.data);
            },
            Err(DashDemuxError::EndOfStream) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    // 6 s of 2 s segments starting at number 10: segments 10, 11, 12 with %05d expansion
    assert_eq!(seg_numbers.first().map(String::as_str), Some("10"));
    assert_eq!(seg_numbers.last().map(String::as_str), Some("12"));
    let init = payload_for("/media/video1/init.mp4");
    let mut expected = Vec::new();
    for seg in ["/media/video1/00010.m4s", "/media/video1/00011.m4s", "/media/video1/00012.m4s"] {
        expected.extend_from_slice(&init);
        expected.extend_from_slice(&payload_for(seg));
    }
    assert_eq!(collected, expected);
    assert_eq!(state.init_requests.load(Ordering::SeqCst), 1);
    assert_eq!(state.segment_requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_discard_flags_pause_and_resume_a_stream() {
    setup_logging();
    let manifest = String::from(r#"<MPD type="static" mediaPresentationDuration="PT40S">
        <Period>
          <AdaptationSet contentType="video" mimeType="video/mp4">
            <Representation id="v1" bandwidth="2000000">
              <SegmentList duration="10" timescale="1">
                <Initialization sourceURL="v1-init.mp4"/>
                <SegmentURL media="v1-s1.m4s"/>
                <SegmentURL media="v1-s2.m4s"/>
                <SegmentURL media="v1-s3.m4s"/>
                <SegmentURL media="v1-s4.m4s"/>
              </SegmentList>
            </Representation>
          </AdaptationSet>
          <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="en">
            <Representation id="a1" bandwidth="128000">
              <SegmentList duration="10" timescale="1">
                <Initialization sourceURL="a1-init.mp4"/>
                <SegmentURL media="a1-s1.m4s"/>
                <SegmentURL media="a1-s2.m4s"/>
                <SegmentURL media="a1-s3.m4s"/>
                <SegmentURL media="a1-s4.m4s"/>
              </SegmentList>
            </Representation>
          </AdaptationSet>
        </Period>
      </MPD>"#);
    let (app, _state) = media_server(manifest);
    let base = serve(app).await;

    let mut demuxer = DashDemuxer::open(
        &format!("{base}/media/Manifest.mpd"),
        DashOptions::default(),
        Box::new(MockOpener),
    ).await.unwrap();
    let info = demuxer.stream_info();
    assert_eq!(info.len(), 2);
    assert_eq!(info[1].media_type, MediaType::Audio);
    assert_eq!(info[1].lang.as_deref(), Some("en"));

    let mut saw_audio_before = false;
    for _ in 0..3 {
        let pkt = demuxer.read_packet().await.unwrap();
        saw_audio_before |= pkt.stream_index == 1;
    }

    demuxer.set_discard(1, true);
    for _ in 0..3 {
        let pkt = demuxer.read_packet().await.unwrap();
        assert_eq!(pkt.stream_index, 0, "discarded stream must not deliver packets");
    }

    demuxer.set_discard(1, false);
    let mut saw_audio_after = false;
    loop {
        match demuxer.read_packet().await {
            Ok(pkt) => saw_audio_after |= pkt.stream_index == 1,
            Err(DashDemuxError::EndOfStream) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(saw_audio_after, "re-enabled stream should resume delivering packets");
    let _ = saw_audio_before;
}

#[tokio::test]
async fn test_live_seek_is_not_supported() {
    setup_logging();
    let manifest = String::from(r#"<MPD type="dynamic">
        <Period start="PT0S">
          <AdaptationSet contentType="video" mimeType="video/mp4">
            <Representation id="v1" bandwidth="2000000">
              <SegmentList duration="10" timescale="1">
                <Initialization sourceURL="v1-init.mp4"/>
                <SegmentURL media="v1-s1.m4s"/>
                <SegmentURL media="v1-s2.m4s"/>
                <SegmentURL media="v1-s3.m4s"/>
              </SegmentList>
            </Representation>
          </AdaptationSet>
        </Period>
      </MPD>"#);
    let (app, _state) = media_server(manifest);
    let base = serve(app).await;

    let mut demuxer = DashDemuxer::open(
        &format!("{base}/media/Manifest.mpd"),
        DashOptions::default(),
        Box::new(MockOpener),
    ).await.unwrap();
    assert!(demuxer.is_live());
    assert_eq!(demuxer.duration(), None);
    let pkt = demuxer.read_packet().await.unwrap();
    assert_eq!(pkt.stream_index, 0);

    let err = demuxer.seek(1000).await;
    assert!(matches!(err, Err(DashDemuxError::NotSupported(_))));
}

#[tokio::test]
async fn test_rejected_scheme() {
    setup_logging();
    let err = DashDemuxer::open(
        "ftp://cdn.example.com/Manifest.mpd",
        DashOptions::default(),
        Box::new(MockOpener),
    ).await;
    assert!(matches!(err, Err(DashDemuxError::InvalidProtocol(_))));
}

#[tokio::test]
async fn test_manifest_http_error() {
    setup_logging();
    let app = Router::new();
    let base = serve(app).await;
    let err = DashDemuxer::open(
        &format!("{base}/media/Manifest.mpd"),
        DashOptions::default(),
        Box::new(MockOpener),
    ).await;
    assert!(matches!(err, Err(DashDemuxError::Network(_))));
}

#[tokio::test]
async fn test_program_information_metadata() {
    setup_logging();
    let manifest = String::from(r#"<MPD type="static" mediaPresentationDuration="PT10S">
        <ProgramInformation>
          <Title>Test stream</Title>
          <Copyright>Example rights holder</Copyright>
        </ProgramInformation>
        <Period>
          <AdaptationSet contentType="video" mimeType="video/mp4">
            <Representation id="v1" bandwidth="2000000">
              <BaseURL>video.mp4</BaseURL>
            </Representation>
          </AdaptationSet>
        </Period>
      </MPD>"#);
    let (app, _state) = media_server(manifest);
    let base = serve(app).await;
    let demuxer = DashDemuxer::open(
        &format!("{base}/media/Manifest.mpd"),
        DashOptions::default(),
        Box::new(MockOpener),
    ).await.unwrap();
    assert_eq!(demuxer.metadata().get("Title").map(String::as_str), Some("Test stream"));
    assert_eq!(demuxer.metadata().get("Copyright").map(String::as_str),
               Some("Example rights holder"));
}
