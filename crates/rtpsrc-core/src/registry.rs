//! Payload type registry
//!
//! Two ordered tables map payload types to media parameters:
//!
//! - the *static* table holds the RFC 3551 assignments and is keyed by the
//!   payload type number,
//! - the *dynamic* table is keyed by encoding name and is used for payload
//!   types >= 96, or for any payload type when an encoding name is forced.
//!
//! Both are scanned linearly and the first match wins. Table order encodes
//! precedence (L16 at 10 before 11, DVI4 at 8 kHz before 16 kHz, ...), so the
//! entries must stay exactly in the order they are authored here.

use std::fmt;

use serde::Serialize;

/// Kind of media carried by a payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Application,
}

impl MediaKind {
    /// Name used in the `media` caps field
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Application => "application",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a payload type table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayloadTypeEntry {
    /// Payload type number; `None` is a wildcard matched by encoding name only
    pub payload_type: Option<u8>,
    /// Media kind
    pub media: MediaKind,
    /// RTP clock rate in Hz
    pub clock_rate: u32,
    /// Encoding name as used in SDP `a=rtpmap`
    pub encoding_name: &'static str,
    /// Format specific parameters, copied verbatim into the caps
    pub extra_params: &'static [(&'static str, &'static str)],
}

const fn fixed(
    pt: u8,
    media: MediaKind,
    clock_rate: u32,
    encoding_name: &'static str,
    extra_params: &'static [(&'static str, &'static str)],
) -> PayloadTypeEntry {
    PayloadTypeEntry {
        payload_type: Some(pt),
        media,
        clock_rate,
        encoding_name,
        extra_params,
    }
}

const fn named(
    media: MediaKind,
    clock_rate: u32,
    encoding_name: &'static str,
    extra_params: &'static [(&'static str, &'static str)],
) -> PayloadTypeEntry {
    PayloadTypeEntry {
        payload_type: None,
        media,
        clock_rate,
        encoding_name,
        extra_params,
    }
}

use self::MediaKind::{Application, Audio, Video};

/// RFC 3551 static payload types, in authored order
pub static STATIC_PAYLOAD_TYPES: &[PayloadTypeEntry] = &[
    fixed(0, Audio, 8000, "PCMU", &[]),
    fixed(3, Audio, 8000, "GSM", &[]),
    fixed(4, Audio, 8000, "G723", &[]),
    fixed(5, Audio, 8000, "DVI4", &[]),
    fixed(6, Audio, 16000, "DVI4", &[]),
    fixed(7, Audio, 8000, "LPC", &[]),
    fixed(8, Audio, 8000, "PCMA", &[]),
    fixed(9, Audio, 8000, "G722", &[]),
    fixed(10, Audio, 44100, "L16", &[("encoding-params", "2")]),
    fixed(11, Audio, 44100, "L16", &[("encoding-params", "1")]),
    fixed(12, Audio, 8000, "QCELP", &[]),
    fixed(13, Audio, 8000, "CN", &[]),
    fixed(14, Audio, 90000, "MPA", &[]),
    fixed(15, Audio, 8000, "G728", &[]),
    fixed(16, Audio, 11025, "DVI4", &[]),
    fixed(17, Audio, 22050, "DVI4", &[]),
    fixed(18, Audio, 8000, "G729", &[]),
    fixed(25, Video, 90000, "CelB", &[]),
    fixed(26, Video, 90000, "JPEG", &[]),
    fixed(28, Video, 90000, "nv", &[]),
    fixed(31, Video, 90000, "H261", &[]),
    fixed(32, Video, 90000, "MPV", &[]),
    fixed(33, Video, 90000, "MP2T", &[]),
    fixed(34, Video, 90000, "H263", &[]),
];

/// Encoding-name keyed parameters for dynamic payload types, in authored order
pub static DYNAMIC_PAYLOAD_TYPES: &[PayloadTypeEntry] = &[
    named(Video, 90000, "MP4V-ES", &[("profile-level-id", "1")]),
    named(Video, 90000, "H264", &[]),
    named(Video, 90000, "H265", &[]),
    named(Video, 90000, "H263-1998", &[]),
    named(Video, 90000, "H263-2000", &[]),
    named(Video, 90000, "JPEG2000", &[("sampling", "YCbCr-4:2:0")]),
    named(Video, 90000, "VP8", &[]),
    named(Video, 90000, "VP9", &[]),
    named(Video, 90000, "THEORA", &[]),
    named(Audio, 90000, "MP4A-LATM", &[]),
    named(Audio, 44100, "MPEG4-GENERIC", &[("mode", "AAC-hbr"), ("sizelength", "13")]),
    named(Audio, 32000, "MPEG4-GENERIC-AUDIO", &[("mode", "AAC-hbr")]),
    named(Audio, 48000, "L16", &[]),
    named(Audio, 48000, "L24", &[]),
    named(Video, 90000, "RAW", &[]),
    named(Video, 90000, "RAW-RGB24", &[]),
    named(Audio, 8000, "AMR", &[("encoding-params", "1"), ("octet-align", "1")]),
    named(Audio, 16000, "AMR-WB", &[("encoding-params", "1"), ("octet-align", "1")]),
    named(Audio, 48000, "OPUS", &[("encoding-params", "2")]),
    named(Audio, 16000, "SPEEX", &[]),
    named(Audio, 16000, "G7221", &[("bitrate", "32000")]),
    named(Application, 90000, "X-GST", &[]),
];

/// Look up a static payload type by number
pub fn lookup_static(pt: u8) -> Option<&'static PayloadTypeEntry> {
    STATIC_PAYLOAD_TYPES
        .iter()
        .find(|entry| entry.payload_type == Some(pt))
}

/// Look up dynamic payload parameters by encoding name
pub fn lookup_dynamic(encoding_name: &str) -> Option<&'static PayloadTypeEntry> {
    DYNAMIC_PAYLOAD_TYPES
        .iter()
        .find(|entry| entry.encoding_name == encoding_name)
}

/// Look up a static payload type by encoding name instead of number
pub fn lookup_static_by_name(encoding_name: &str) -> Option<&'static PayloadTypeEntry> {
    STATIC_PAYLOAD_TYPES
        .iter()
        .find(|entry| entry.encoding_name == encoding_name)
}
