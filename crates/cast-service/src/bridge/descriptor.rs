//! Session descriptor (SDP) for the encoder.
//!
//! Each active leg gets an RTP/RTCP port pair on loopback. Ports are assigned
//! in leg order starting at the base port and stepping by two; inactive legs
//! are skipped without consuming a pair.

use super::state::BridgeLeg;
use crate::errors::CastError;
use crate::transport::LOOPBACK;
use common::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use std::fmt::Write as _;
use std::path::Path;

/// `s=` line of the descriptor.
pub const SESSION_NAME: &str = "Duocast Stream";

/// One stream the encoder reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub consumer_id: ConsumerId,
    pub kind: MediaKind,
    pub port: u16,
    pub rtcp_port: u16,
    pub payload_type: u8,
    pub codec: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub entries: Vec<StreamEntry>,
    pub sdp: String,
}

impl StreamDescriptor {
    /// Build the descriptor for the active legs.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if a leg has no usable codec, `Internal` if the port
    /// range overflows.
    pub fn generate(legs: &[BridgeLeg], base_port: u16, origin: i64) -> Result<Self, CastError> {
        let mut entries = Vec::with_capacity(legs.len());
        let mut port = base_port;

        for leg in legs.iter().filter(|leg| leg.active) {
            let codec = leg.rtp_parameters.primary_codec().ok_or_else(|| {
                CastError::InvalidRequest(format!("consumer {} has no codec", leg.consumer_id))
            })?;
            let rtcp_port = port
                .checked_add(1)
                .ok_or_else(|| CastError::Internal("RTP port range exhausted".to_string()))?;

            entries.push(StreamEntry {
                producer_id: leg.producer_id,
                transport_id: leg.transport_id,
                consumer_id: leg.consumer_id,
                kind: leg.kind,
                port,
                rtcp_port,
                payload_type: codec.payload_type,
                codec: codec.codec_name()?.to_string(),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
            });

            port = port
                .checked_add(2)
                .ok_or_else(|| CastError::Internal("RTP port range exhausted".to_string()))?;
        }

        let sdp = render(&entries, origin);
        Ok(Self { entries, sdp })
    }

    #[must_use]
    pub fn count(&self, kind: MediaKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    #[must_use]
    pub fn entry_for(&self, producer_id: ProducerId) -> Option<&StreamEntry> {
        self.entries.iter().find(|e| e.producer_id == producer_id)
    }

    /// Write the SDP where the encoder reads it.
    pub async fn write_to(&self, path: &Path) -> Result<(), CastError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.sdp.as_bytes()).await?;
        Ok(())
    }
}

fn render(entries: &[StreamEntry], origin: i64) -> String {
    let mut sdp = String::new();
    // Writing into a String cannot fail
    let _ = write!(sdp, "v=0\r\n");
    let _ = write!(sdp, "o=- {origin} {origin} IN IP4 {LOOPBACK}\r\n");
    let _ = write!(sdp, "s={SESSION_NAME}\r\n");
    let _ = write!(sdp, "t=0 0\r\n");

    for entry in entries {
        let _ = write!(
            sdp,
            "m={} {} RTP/AVP {}\r\n",
            entry.kind, entry.port, entry.payload_type
        );
        let _ = write!(sdp, "c=IN IP4 {LOOPBACK}\r\n");
        let _ = write!(sdp, "a=rtcp:{}\r\n", entry.rtcp_port);
        let _ = write!(
            sdp,
            "a=rtpmap:{} {}/{}",
            entry.payload_type, entry.codec, entry.clock_rate
        );
        if let Some(channels) = entry.channels.filter(|c| *c > 1) {
            let _ = write!(sdp, "/{channels}");
        }
        let _ = write!(sdp, "\r\n");
        let _ = write!(sdp, "a=mid:{}-{}\r\n", entry.producer_id, entry.kind);
    }

    sdp
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use common::rtp::{RtpCodecParameters, RtpParameters};
    use serde_json::Map;

    fn leg(kind: MediaKind, active: bool) -> BridgeLeg {
        let codec = match kind {
            MediaKind::Audio => RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 100,
                clock_rate: 48_000,
                channels: Some(2),
                parameters: Map::new(),
                rtcp_feedback: Vec::new(),
            },
            MediaKind::Video => RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 101,
                clock_rate: 90_000,
                channels: None,
                parameters: Map::new(),
                rtcp_feedback: Vec::new(),
            },
        };
        BridgeLeg {
            producer_id: ProducerId::new(),
            kind,
            transport_id: TransportId::new(),
            consumer_id: ConsumerId::new(),
            rtp_parameters: RtpParameters {
                mid: None,
                codecs: vec![codec],
                header_extensions: Vec::new(),
                encodings: Vec::new(),
                rtcp: None,
            },
            active,
        }
    }

    #[test]
    fn test_four_streams_get_sequential_pairs() {
        let legs = vec![
            leg(MediaKind::Audio, true),
            leg(MediaKind::Video, true),
            leg(MediaKind::Audio, true),
            leg(MediaKind::Video, true),
        ];

        let descriptor = StreamDescriptor::generate(&legs, 5004, 1).unwrap();

        let ports: Vec<(u16, u16)> = descriptor
            .entries
            .iter()
            .map(|e| (e.port, e.rtcp_port))
            .collect();
        assert_eq!(ports, vec![(5004, 5005), (5006, 5007), (5008, 5009), (5010, 5011)]);
        assert_eq!(descriptor.sdp.matches("m=").count(), 4);
        assert_eq!(descriptor.count(MediaKind::Audio), 2);
        assert_eq!(descriptor.count(MediaKind::Video), 2);
    }

    #[test]
    fn test_inactive_legs_are_skipped() {
        let legs = vec![
            leg(MediaKind::Audio, true),
            leg(MediaKind::Video, false),
            leg(MediaKind::Video, true),
        ];

        let descriptor = StreamDescriptor::generate(&legs, 5004, 1).unwrap();

        assert_eq!(descriptor.entries.len(), 2);
        assert_eq!(descriptor.entries[1].producer_id, legs[2].producer_id);
        assert_eq!(descriptor.entries[1].port, 5006);
        assert!(descriptor.entry_for(legs[1].producer_id).is_none());
    }

    #[test]
    fn test_sdp_lines() {
        let legs = vec![leg(MediaKind::Audio, true), leg(MediaKind::Video, true)];
        let descriptor = StreamDescriptor::generate(&legs, 5004, 42).unwrap();
        let lines: Vec<&str> = descriptor.sdp.split("\r\n").collect();

        assert_eq!(lines[0], "v=0");
        assert_eq!(lines[1], "o=- 42 42 IN IP4 127.0.0.1");
        assert_eq!(lines[2], "s=Duocast Stream");
        assert_eq!(lines[3], "t=0 0");
        assert_eq!(lines[4], "m=audio 5004 RTP/AVP 100");
        assert_eq!(lines[5], "c=IN IP4 127.0.0.1");
        assert_eq!(lines[6], "a=rtcp:5005");
        assert_eq!(lines[7], "a=rtpmap:100 opus/48000/2");
        assert_eq!(lines[8], format!("a=mid:{}-audio", legs[0].producer_id));
        assert_eq!(lines[9], "m=video 5006 RTP/AVP 101");
        assert_eq!(lines[12], "a=rtpmap:101 VP8/90000");
        assert!(descriptor.sdp.ends_with("\r\n"));
    }

    #[test]
    fn test_port_overflow_is_an_error() {
        let legs = vec![leg(MediaKind::Audio, true), leg(MediaKind::Video, true)];
        assert!(StreamDescriptor::generate(&legs, u16::MAX - 1, 1).is_err());
    }

    #[tokio::test]
    async fn test_write_creates_parent() {
        let dir = std::env::temp_dir().join(format!("cast-sdp-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("stream.sdp");
        let descriptor =
            StreamDescriptor::generate(&[leg(MediaKind::Audio, true)], 5004, 1).unwrap();

        descriptor.write_to(&path).await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(written, descriptor.sdp);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
