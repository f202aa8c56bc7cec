//! Session configuration
//!
//! [`Settings`] holds every knob of an RTP source. Values can come from
//! explicit setters, from the query part of an `rtp://` URI, or from a TOML
//! file:
//!
//! ```toml
//! uri = "rtp://239.1.1.1:5004"
//! encoding-name = "H264"
//! latency = 300
//! select-pt = 96
//! ignore-ssrc = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::uri::RtpUri;

/// Default jitterbuffer latency in milliseconds
pub const DEFAULT_LATENCY_MS: u32 = 200;

/// Highest value accepted for `select-pt`
pub const MAX_SELECT_PT: i32 = 128;

/// Configuration of one RTP source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    /// Where to receive from
    pub uri: Option<RtpUri>,
    /// Forced encoding name, bypassing the static payload table
    pub encoding_name: Option<String>,
    /// Only let this payload type through; `None` disables filtering
    ///
    /// Written as -1..=128 in documents, -1 meaning `None`.
    #[serde(with = "select_pt_serde")]
    pub select_pt: Option<u8>,
    /// Jitterbuffer latency in milliseconds
    #[serde(rename = "latency")]
    pub latency_ms: u32,
    /// Receive and send RTCP on port + 1
    pub enable_rtcp: bool,
    /// Do not demultiplex on payload type changes
    pub ignore_pt: bool,
    /// Keep a single output regardless of how many SSRCs appear
    pub ignore_ssrc: bool,
    /// Interface used for multicast joins
    pub multicast_iface: Option<String>,
    /// Kernel receive buffer size in bytes, 0 for the system default
    pub buffer_size: u32,
    /// Packets are encrypted and need a decryption stage
    pub encrypt: bool,
    /// Key derivation rate handed to the decryption stage
    #[serde(rename = "rate")]
    pub key_derivation_rate: u32,
    /// Restrict the RTCP sink to IPv4 sockets
    pub force_ipv4: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            uri: None,
            encoding_name: None,
            select_pt: None,
            latency_ms: DEFAULT_LATENCY_MS,
            enable_rtcp: true,
            ignore_pt: false,
            ignore_ssrc: false,
            multicast_iface: None,
            buffer_size: 0,
            encrypt: false,
            key_derivation_rate: 0,
            force_ipv4: false,
        }
    }
}

impl Settings {
    /// Load settings from a TOML document
    ///
    /// Query parameters of the `uri` key are applied on top of the document.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let mut settings: Settings =
            toml::from_str(document).map_err(|e| Error::Config(e.to_string()))?;

        if let Some(uri) = settings.uri.clone() {
            settings.apply_query(uri.query())?;
        }

        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&document)
    }

    /// `select-pt` as the signed value exposed on the configuration surface
    pub fn select_pt_value(&self) -> i32 {
        self.select_pt.map(i32::from).unwrap_or(-1)
    }

    /// Apply URI query pairs
    ///
    /// Either every pair is applied or, on the first bad pair, none is.
    pub fn apply_query(&mut self, pairs: &[(String, String)]) -> Result<()> {
        let mut staged = self.clone();
        for (key, value) in pairs {
            staged.set_from_str(key, value)?;
        }
        *self = staged;
        Ok(())
    }

    /// Set a single property from its textual form
    pub fn set_from_str(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "encoding-name" => {
                self.encoding_name = non_empty(value);
            }
            "select-pt" => {
                self.select_pt = parse_select_pt(parse_number::<i32>(key, value)?)?;
            }
            "latency" => self.latency_ms = parse_number(key, value)?,
            "enable-rtcp" => self.enable_rtcp = parse_bool(key, value)?,
            "ignore-pt" => self.ignore_pt = parse_bool(key, value)?,
            "ignore-ssrc" => self.ignore_ssrc = parse_bool(key, value)?,
            "multicast-iface" => self.multicast_iface = non_empty(value),
            "buffer-size" => self.buffer_size = parse_number(key, value)?,
            "encrypt" => self.encrypt = parse_bool(key, value)?,
            "rate" => self.key_derivation_rate = parse_number(key, value)?,
            "force-ipv4" => self.force_ipv4 = parse_bool(key, value)?,
            _ => return Err(Error::unknown_property(key)),
        }
        Ok(())
    }
}

/// Validate a `select-pt` value; -1 disables payload type selection
pub fn parse_select_pt(value: i32) -> Result<Option<u8>> {
    match value {
        -1 => Ok(None),
        0..=MAX_SELECT_PT => Ok(Some(value as u8)),
        _ => Err(Error::invalid_value(
            "select-pt",
            value,
            format!("must be within -1..={}", MAX_SELECT_PT),
        )),
    }
}

/// `select-pt` in its signed document form
mod select_pt_serde {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::parse_select_pt;

    pub fn serialize<S: Serializer>(value: &Option<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(value.map(i32::from).unwrap_or(-1))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u8>, D::Error> {
        let raw = i32::deserialize(deserializer)?;
        parse_select_pt(raw).map_err(de::Error::custom)
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::invalid_value(key, value, "expected a boolean")),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| Error::invalid_value(key, value, e.to_string()))
}
