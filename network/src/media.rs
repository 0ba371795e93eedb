use bytes::Bytes;
use log::debug;
use session_core::{Error, MediaKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// A locally captured track, shared read-only by every PeerLink
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    rtc: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl LocalTrack {
    /// Create a track of the given kind within `stream_id`
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let id = format!("{}-{}", kind, Uuid::new_v4());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));

        Self {
            id,
            kind,
            rtc,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Track handle handed to the media transport
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    /// Push one encoded frame to every connection carrying this track
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::InvalidState(format!("Track {} is stopped", self.id)));
        }
        self.rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to write sample: {}", e)))
    }

    /// Stop capturing. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Stopped local {} track {}", self.kind, self.id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Single local capture fanned out to every PeerLink
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self { tracks }
    }

    /// One audio and one video track in a fresh stream
    pub fn camera_and_microphone() -> Self {
        let stream_id = format!("local-{}", Uuid::new_v4());
        Self::new(vec![
            Arc::new(LocalTrack::new(MediaKind::Audio, &stream_id)),
            Arc::new(LocalTrack::new(MediaKind::Video, &stream_id)),
        ])
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}
