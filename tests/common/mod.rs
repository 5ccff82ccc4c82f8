// Shared code for our test harness.

#![allow(dead_code)]

use std::sync::Once;
use async_trait::async_trait;
use bytes::Bytes;
use dash_stream_demux::{ContainerDemuxer, ContainerDemuxOpener, RawPacket, Result, SegmentSource};

static TRACING_INIT: Once = Once::new();

pub fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    TRACING_INIT.call_once(|| {
        let fmt_layer = fmt::layer()
            .compact()
            .with_target(false);
        let filter_layer = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info,reqwest=warn,hyper=warn,h2=warn"))
            .expect("initializing logging");
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    });
}

/// Bind an ephemeral port, serve `app` on it in the background, and return the base URL.
pub async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Deterministic segment payload derived from the request path, so tests can predict the exact
/// bytes a URL serves.
pub fn payload_for(path: &str) -> Vec<u8> {
    path.as_bytes().iter().cycle().take(2000).copied().collect()
}

pub const PROBE_SIZE: usize = 32;

/// A minimal stand-in for a container demuxer: emits the raw bytes of the stream as packets with
/// a monotonically increasing 90 kHz timestamp. Good enough to exercise the byte pipeline and
/// packet scheduling without a real fMP4/TS parser.
pub struct ChunkDemuxer {
    pending: Vec<u8>,
    pts: i64,
}

#[async_trait]
impl ContainerDemuxer for ChunkDemuxer {
    async fn read_packet(&mut self, src: &mut dyn SegmentSource) -> Result<Option<RawPacket>> {
        let mut buf = [0u8; 4096];
        let mut data = std::mem::take(&mut self.pending);
        let n = src.read(&mut buf).await?;
        if n == 0 && data.is_empty() {
            return Ok(None);
        }
        data.extend_from_slice(&buf[..n]);
        let pts = self.pts;
        self.pts += 3000;
        Ok(Some(RawPacket { data: Bytes::from(data), pts, time_base: (1, 90_000) }))
    }

    async fn seek(&mut self, _position_ms: i64, _src: &mut dyn SegmentSource) -> Result<()> {
        self.pending.clear();
        self.pts = 0;
        Ok(())
    }
}

/// Opener for [`ChunkDemuxer`]: reads a small probe buffer from the head of the stream, the way
/// a real container demuxer sniffs the format, and keeps those bytes for the first packet.
pub struct MockOpener;

#[async_trait]
impl ContainerDemuxOpener for MockOpener {
    async fn open(&self, src: &mut dyn SegmentSource) -> Result<Box<dyn ContainerDemuxer>> {
        let mut probe = vec![0u8; PROBE_SIZE];
        let mut filled = 0;
        while filled < PROBE_SIZE {
            let n = src.read(&mut probe[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        probe.truncate(filled);
        Ok(Box::new(ChunkDemuxer { pending: probe, pts: 0 }))
    }
}
