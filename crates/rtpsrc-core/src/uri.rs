//! `rtp://` URI handling
//!
//! A session is addressed as `rtp://host:port[?key=value&...]`. Query pairs
//! carry properties (`encoding-name`, `latency`, ...) and are applied through
//! the regular setters by [`crate::settings::Settings::apply_query`].

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use url::{Host, Url};

use crate::error::{Error, Result};

/// URI scheme handled by the RTP source
pub const RTP_SCHEME: &str = "rtp";

/// Direction of a URI handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriType {
    /// Produces data from the URI
    Src,
    /// Consumes data into the URI
    Sink,
}

/// A resource that can be addressed by URI
pub trait UriHandler {
    /// Direction of the handler
    fn uri_type() -> UriType
    where
        Self: Sized;

    /// URI schemes understood by the handler
    fn protocols() -> &'static [&'static str]
    where
        Self: Sized;

    /// Currently configured URI, as it was set
    fn uri(&self) -> Option<String>;

    /// Configure the handler from a URI
    fn set_uri(&self, uri: &str) -> Result<()>;
}

/// A parsed `rtp://` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpUri {
    raw: String,
    host: String,
    port: u16,
    query: Vec<(String, String)>,
}

impl RtpUri {
    /// Parse an `rtp://host:port[?query]` URI
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| Error::invalid_uri(uri, e.to_string()))?;

        if url.scheme() != RTP_SCHEME {
            return Err(Error::invalid_uri(
                uri,
                format!("unsupported scheme '{}', expected '{}'", url.scheme(), RTP_SCHEME),
            ));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(Error::invalid_uri(uri, "missing host")),
        };

        let port = url
            .port()
            .ok_or_else(|| Error::invalid_uri(uri, "missing port"))?;

        let query = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(Self {
            raw: uri.to_string(),
            host,
            port,
            query,
        })
    }

    /// Host name or IP literal, without IPv6 brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    /// RTP port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// RTCP port (RTP port + 1), if it fits
    pub fn rtcp_port(&self) -> Option<u16> {
        self.port.checked_add(1)
    }

    /// Query pairs in the order they appear
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// The URI string exactly as it was parsed
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `udp://` URI for a socket bound to this host and `port`
    pub fn udp_uri(&self, port: u16) -> String {
        if self.host.contains(':') {
            format!("udp://[{}]:{}", self.host, port)
        } else {
            format!("udp://{}:{}", self.host, port)
        }
    }
}

impl fmt::Display for RtpUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for RtpUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for RtpUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RtpUri::parse(&raw).map_err(de::Error::custom)
    }
}
