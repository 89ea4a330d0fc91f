//! Local and remote media as seen by the call core.
//!
//! Capture and rendering live outside this crate. The connection manager only
//! attaches tracks it is handed and never stops them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::MediaError;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(Self::Audio),
            RTPCodecType::Video => Some(Self::Video),
            _ => None,
        }
    }
}

/// A captured track owned by the media collaborator
#[derive(Clone)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub track: Arc<dyn TrackLocal + Send + Sync>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.track.id())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

/// A track received from the peer
#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: MediaKind,
    pub id: String,
    pub stream_id: String,
    /// Engine handle for reading RTP; absent for engines without real media
    pub handle: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Adds `track`, replacing an earlier track with the same id.
    pub fn upsert(&mut self, track: RemoteTrack) {
        if self.id.is_empty() {
            self.id = track.stream_id.clone();
        }
        self.tracks.retain(|t| t.id != track.id);
        self.tracks.push(track);
    }
}

/// Media capture and rendering collaborator
#[async_trait]
pub trait MediaPort: Send + Sync {
    fn has_stream(&self) -> bool;

    fn current_stream(&self) -> Option<LocalStream>;

    /// Opens capture devices when no stream is active yet.
    async fn acquire(&self) -> Result<LocalStream, MediaError>;

    fn set_remote_stream(&self, stream: RemoteStream);

    fn clear_remote_stream(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(id: &str) -> RemoteTrack {
        RemoteTrack {
            kind: MediaKind::Audio,
            id: id.into(),
            stream_id: "remote-stream".into(),
            handle: None,
        }
    }

    #[test]
    fn upsert_replaces_same_track() {
        let mut stream = RemoteStream::default();
        stream.upsert(remote("a"));
        stream.upsert(remote("a"));
        stream.upsert(remote("b"));
        assert_eq!(stream.id, "remote-stream");
        assert_eq!(stream.tracks.len(), 2);
    }

    #[test]
    fn codec_type_maps_to_kind() {
        assert_eq!(MediaKind::from_codec_type(RTPCodecType::Video), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_codec_type(RTPCodecType::Unspecified), None);
    }
}
