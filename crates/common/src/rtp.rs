//! RTP parameter and capability types exchanged during signaling.
//!
//! Field names follow the camelCase wire format used by browser-side media
//! clients. Fields the orchestrator never inspects are carried through
//! untouched as JSON values.

use crate::error::CommonError;
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Codec parameters negotiated for a single RTP stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    /// e.g. `audio/opus`, `video/VP8`
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecParameters {
    /// Codec name as it appears in an SDP `rtpmap` attribute (`opus`, `VP8`).
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::InvalidMimeType`] if the mime type has no `/`.
    pub fn codec_name(&self) -> Result<&str, CommonError> {
        match self.mime_type.split_once('/') {
            Some((_, name)) if !name.is_empty() => Ok(name),
            _ => Err(CommonError::InvalidMimeType(self.mime_type.clone())),
        }
    }
}

/// RTP send/receive parameters of a producer or consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

impl RtpParameters {
    /// The primary (first) codec. Streams always negotiate at least one.
    #[must_use]
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }
}

/// A codec an endpoint is able to receive or send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecCapability {
    /// Whether this capability can decode a stream encoded with `codec`.
    ///
    /// Mime types compare case-insensitively; the clock rate must match and,
    /// for audio, the channel count must match when both sides declare one.
    #[must_use]
    pub fn matches(&self, kind: MediaKind, codec: &RtpCodecParameters) -> bool {
        if self.kind != kind || !self.mime_type.eq_ignore_ascii_case(&codec.mime_type) {
            return false;
        }
        if self.clock_rate != codec.clock_rate {
            return false;
        }
        match (kind, self.channels, codec.channels) {
            (MediaKind::Audio, Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}

/// The full set of codecs an endpoint supports.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// Find the first local codec able to decode `codec`.
    #[must_use]
    pub fn find_match(
        &self,
        kind: MediaKind,
        codec: &RtpCodecParameters,
    ) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.matches(kind, codec))
    }

    /// Build a single-codec capability set mirroring a producer's primary
    /// codec, so a server-side endpoint can consume exactly what is sent.
    #[must_use]
    pub fn mirroring(kind: MediaKind, parameters: &RtpParameters) -> Self {
        let codecs = parameters
            .primary_codec()
            .map(|codec| RtpCodecCapability {
                kind,
                mime_type: codec.mime_type.clone(),
                preferred_payload_type: Some(codec.payload_type),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: codec.rtcp_feedback.clone(),
            })
            .into_iter()
            .collect();

        Self {
            codecs,
            header_extensions: Vec::new(),
        }
    }
}
