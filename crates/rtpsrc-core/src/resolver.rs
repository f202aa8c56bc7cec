//! Payload type to caps resolution
//!
//! The session manager asks for caps every time it sees a payload type it has
//! no mapping for yet. Resolution walks a fixed fallback chain:
//!
//! 1. with a forced encoding name, skip straight to the dynamic table,
//! 2. otherwise the static table keyed by number is authoritative,
//! 3. a static miss without a forced name defaults the name to
//!    [`FALLBACK_ENCODING_NAME`] (encoders that send no usable signaling),
//! 4. look the name up in the dynamic table,
//! 5. then in the static table by name,
//! 6. otherwise the format is unknown.
//!
//! Found entries go through [`fixup_caps`] before being handed out.

use tracing::{debug, warn};

use crate::caps::Caps;
use crate::registry::{self, PayloadTypeEntry};

/// Encoding name assumed when nothing else identifies the stream
pub const FALLBACK_ENCODING_NAME: &str = "MP4V-ES";

/// Which table produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    /// Static table, matched by payload type number
    Static,
    /// Dynamic table, matched by encoding name
    Dynamic,
    /// Static table, matched by encoding name
    StaticByName,
}

/// Outcome of a payload type resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Resolved caps; `None` if the format is unrecognized
    pub caps: Option<Caps>,
    /// Table the caps came from
    pub source: Option<MatchSource>,
    /// Set when the encoding name had to be defaulted for this query.
    /// Callers persist it so later queries reuse the same name.
    pub defaulted: Option<&'static str>,
}

impl Resolution {
    fn found(
        entry: &PayloadTypeEntry,
        pt: u8,
        source: MatchSource,
        defaulted: Option<&'static str>,
    ) -> Self {
        Self {
            caps: Some(fixup_caps(entry_caps(entry, pt), entry.encoding_name)),
            source: Some(source),
            defaulted,
        }
    }

    /// Whether a table entry matched
    pub fn is_found(&self) -> bool {
        self.caps.is_some()
    }
}

/// Resolve caps for `pt`, honouring a forced encoding name
pub fn resolve(pt: u8, encoding_name: Option<&str>) -> Resolution {
    let mut defaulted = None;

    let name = match encoding_name {
        Some(name) => name,
        None => {
            if let Some(entry) = registry::lookup_static(pt) {
                debug!("found as static param: {}", entry.encoding_name);
                return Resolution::found(entry, pt, MatchSource::Static, None);
            }
            debug!("no static parameters found for pt {}", pt);

            defaulted = Some(FALLBACK_ENCODING_NAME);
            FALLBACK_ENCODING_NAME
        }
    };

    if let Some(entry) = registry::lookup_dynamic(name) {
        debug!("found dynamic parameters [{}]", name);
        return Resolution::found(entry, pt, MatchSource::Dynamic, defaulted);
    }

    // A static format whose number was not declared but whose name is known
    if let Some(entry) = registry::lookup_static_by_name(name) {
        debug!("found static parameters [{}]", name);
        return Resolution::found(entry, pt, MatchSource::StaticByName, defaulted);
    }

    warn!("no rtp parameters found for payload type {} ({})", pt, name);
    Resolution {
        caps: None,
        source: None,
        defaulted,
    }
}

/// Build the caps for a table entry
///
/// Entries without a number, or with number 0, take the requested payload type.
pub fn entry_caps(entry: &PayloadTypeEntry, requested_pt: u8) -> Caps {
    let payload = match entry.payload_type {
        Some(pt) if pt != 0 => pt,
        _ => requested_pt,
    };

    let mut caps = Caps::rtp()
        .with("media", entry.media.as_str())
        .with("clock-rate", entry.clock_rate as i32)
        .with("encoding-name", entry.encoding_name)
        .with("payload", payload as i32);

    for (key, value) in entry.extra_params {
        caps.set(key, *value);
    }

    caps
}

/// Expand encoding-name aliases into concrete parameters
///
/// Idempotent, and descriptors for names without an alias pass through
/// untouched.
pub fn fixup_caps(mut caps: Caps, encoding_name: &str) -> Caps {
    match encoding_name {
        "MPEG4-GENERIC-AUDIO" => {
            caps.set("clock-rate", 32000);
            caps.set("encoding-name", "MPEG4-GENERIC");
            caps.set("config", "1288");
            caps.set("sizelength", "13");
        }
        "L16" => {
            caps.set("clock-rate", 48000);
            caps.set("encoding-name", "L16");
            caps.set("channels", 2);
        }
        "RAW-RGB24" => {
            caps.set("media", "video");
            caps.set("clock-rate", 90000);
            caps.set("encoding-name", "RAW");
            caps.set("sampling", "RGB");
            caps.set("depth", 24);
            caps.set("width", 800);
            caps.set("height", 600);
        }
        _ => {}
    }
    caps
}
