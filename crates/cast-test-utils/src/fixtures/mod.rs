//! Pre-configured test data for cast service tests.
//!
//! Provides:
//! - RTP parameters for Opus audio and VP8 video producers
//! - Receive capabilities, compatible and incompatible
//! - DTLS parameters for `transport-connect`
//! - `TestWorkspace`: a temporary directory with config vars pointing into it

use common::rtp::{RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters};
use common::types::MediaKind;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Opus stereo as a browser would send it.
#[must_use]
pub fn opus_rtp_parameters() -> RtpParameters {
    let mut parameters = Map::new();
    parameters.insert("useinbandfec".to_string(), json!(1));
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48_000,
            channels: Some(2),
            parameters,
            rtcp_feedback: vec![json!({"type": "transport-cc"})],
        }],
        header_extensions: Vec::new(),
        encodings: vec![json!({"ssrc": 1111})],
        rtcp: Some(json!({"cname": "test"})),
    }
}

/// VP8 as a browser would send it.
#[must_use]
pub fn vp8_rtp_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("1".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90_000,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: vec![json!({"type": "nack"}), json!({"type": "goog-remb"})],
        }],
        header_extensions: Vec::new(),
        encodings: vec![json!({"ssrc": 2222})],
        rtcp: Some(json!({"cname": "test"})),
    }
}

/// Parameters for `kind`.
#[must_use]
pub fn rtp_parameters(kind: MediaKind) -> RtpParameters {
    match kind {
        MediaKind::Audio => opus_rtp_parameters(),
        MediaKind::Video => vp8_rtp_parameters(),
    }
}

/// A receiver able to decode Opus and VP8.
#[must_use]
pub fn receive_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            codec_capability(MediaKind::Audio, "audio/opus", 48_000, Some(2)),
            codec_capability(MediaKind::Video, "video/VP8", 90_000, None),
        ],
        header_extensions: Vec::new(),
    }
}

/// A receiver that only decodes H264, so cannot consume the fixtures above.
#[must_use]
pub fn h264_only_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![codec_capability(
            MediaKind::Video,
            "video/H264",
            90_000,
            None,
        )],
        header_extensions: Vec::new(),
    }
}

fn codec_capability(
    kind: MediaKind,
    mime_type: &str,
    clock_rate: u32,
    channels: Option<u8>,
) -> RtpCodecCapability {
    RtpCodecCapability {
        kind,
        mime_type: mime_type.to_string(),
        preferred_payload_type: None,
        clock_rate,
        channels,
        parameters: Map::new(),
        rtcp_feedback: Vec::new(),
    }
}

/// DTLS parameters as sent in `transport-connect`.
#[must_use]
pub fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{
            "algorithm": "sha-256",
            "value": "82:5A:68:3D:36:C3:0A:DE:AF:E7:32:43:D2:88:83:57:AC:2D:65:E5:80:C4:B6:FB:AF:1A:A0:21:9F:6D:0C:AD"
        }]
    })
}

/// Temporary output directory plus the config vars pointing into it.
///
/// The directory is removed on drop.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    /// # Panics
    ///
    /// If the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: tempfile::Builder::new()
                .prefix("cast-test-")
                .tempdir()
                .expect("create temp dir"),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn public_dir(&self) -> PathBuf {
        self.dir.path().join("public")
    }

    #[must_use]
    pub fn hls_dir(&self) -> PathBuf {
        self.public_dir().join("hls")
    }

    #[must_use]
    pub fn sdp_path(&self) -> PathBuf {
        self.dir.path().join("stream.sdp")
    }

    /// Config vars for a fast test server: ephemeral port, short warm-up and
    /// readiness timeout, output inside this workspace.
    #[must_use]
    pub fn config_vars(&self) -> HashMap<String, String> {
        HashMap::from([
            ("CAST_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("CAST_LISTEN_IP".to_string(), "127.0.0.1".to_string()),
            ("CAST_ANNOUNCED_IP".to_string(), "127.0.0.1".to_string()),
            (
                "CAST_PUBLIC_DIR".to_string(),
                self.public_dir().display().to_string(),
            ),
            (
                "CAST_HLS_DIR".to_string(),
                self.hls_dir().display().to_string(),
            ),
            (
                "CAST_SDP_PATH".to_string(),
                self.sdp_path().display().to_string(),
            ),
            ("CAST_REQUEST_TIMEOUT_MS".to_string(), "2000".to_string()),
            ("CAST_ENCODER_READY_TIMEOUT_MS".to_string(), "500".to_string()),
            ("CAST_ENCODER_SPAWN_ATTEMPTS".to_string(), "2".to_string()),
            ("CAST_ENCODER_WARMUP_MS".to_string(), "20".to_string()),
        ])
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
