//! Collaborator interfaces for the hosting service.
//!
//! The capture core never talks to the network directly; it consumes
//! these traits. Implementations are expected to handle their own
//! transient retry behavior — a returned error means "no data this
//! cycle" to every caller in this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Stream delivery protocol variants the capture process can use.
///
/// HLS is the primary transport; RTMP is the fallback when no HLS URL
/// resolves for the current broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Hls,
    Rtmp,
}

/// One resolvable stream variant for a live room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub transport: Transport,
    /// Relative quality; higher is better.
    pub quality: u32,
    pub url: String,
}

/// A room id paired with a predicted or confirmed start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRoom {
    pub room_id: String,
    pub start_at: DateTime<Utc>,
}

/// The two independently rate-limited poll endpoints.
#[async_trait]
pub trait ScheduleFeed: Send + Sync {
    /// Rooms with a predicted upcoming start time.
    async fn poll_upcoming(&self) -> Result<Vec<ScheduledRoom>>;

    /// Rooms currently live, with their confirmed start time.
    async fn poll_live(&self) -> Result<Vec<ScheduledRoom>>;
}

/// Direct live-status check for a single room.
#[async_trait]
pub trait LiveStatusProbe: Send + Sync {
    async fn check_live(&self, room_id: &str) -> Result<bool>;
}

/// Resolves the current stream URLs for a live room.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve_urls(&self, room_id: &str) -> Result<Vec<StreamSource>>;
}

/// Pick the best source for capture: the highest-quality entry for the
/// primary transport, falling back to the secondary transport.
pub fn select_source(sources: &[StreamSource]) -> Option<&StreamSource> {
    best_for(sources, Transport::Hls).or_else(|| best_for(sources, Transport::Rtmp))
}

fn best_for(sources: &[StreamSource], transport: Transport) -> Option<&StreamSource> {
    sources
        .iter()
        .filter(|s| s.transport == transport)
        .max_by_key(|s| s.quality)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(transport: Transport, quality: u32, url: &str) -> StreamSource {
        StreamSource {
            transport,
            quality,
            url: url.to_string(),
        }
    }

    #[test]
    fn selects_best_primary_quality() {
        let sources = vec![
            source(Transport::Rtmp, 1000, "rtmp://a"),
            source(Transport::Hls, 360, "https://low.m3u8"),
            source(Transport::Hls, 1080, "https://high.m3u8"),
        ];
        let picked = select_source(&sources).unwrap();
        assert_eq!(picked.url, "https://high.m3u8");
    }

    #[test]
    fn falls_back_to_secondary_transport() {
        let sources = vec![source(Transport::Rtmp, 720, "rtmp://only")];
        let picked = select_source(&sources).unwrap();
        assert_eq!(picked.transport, Transport::Rtmp);
    }

    #[test]
    fn empty_list_selects_nothing() {
        assert!(select_source(&[]).is_none());
    }
}
