//! Capability descriptors
//!
//! A [`Caps`] value describes a media format attached to a stream: a media
//! type name such as `application/x-rtp` plus an ordered list of typed fields
//! (`media`, `clock-rate`, `encoding-name`, `payload`, ...). Field order is
//! kept as inserted so descriptors render the same way every time.

use std::fmt;

/// Media type of RTP media streams
pub const RTP_MEDIA_TYPE: &str = "application/x-rtp";

/// Media type of RTCP control streams
pub const RTCP_MEDIA_TYPE: &str = "application/x-rtcp";

/// A single typed caps field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapsValue {
    /// Integer field, e.g. `clock-rate`
    Int(i32),
    /// String field, e.g. `encoding-name`
    Str(String),
}

impl CapsValue {
    fn type_name(&self) -> &'static str {
        match self {
            CapsValue::Int(_) => "int",
            CapsValue::Str(_) => "string",
        }
    }
}

impl From<i32> for CapsValue {
    fn from(v: i32) -> Self {
        CapsValue::Int(v)
    }
}

impl From<&str> for CapsValue {
    fn from(v: &str) -> Self {
        CapsValue::Str(v.to_string())
    }
}

impl From<String> for CapsValue {
    fn from(v: String) -> Self {
        CapsValue::Str(v)
    }
}

impl fmt::Display for CapsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapsValue::Int(v) => write!(f, "({}){}", self.type_name(), v),
            CapsValue::Str(v) => write!(f, "({}){}", self.type_name(), v),
        }
    }
}

/// Structured description of a media format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caps {
    name: String,
    fields: Vec<(String, CapsValue)>,
}

impl Caps {
    /// Create empty caps with the given media type name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Create empty `application/x-rtp` caps
    pub fn rtp() -> Self {
        Self::new(RTP_MEDIA_TYPE)
    }

    /// Create empty `application/x-rtcp` caps
    pub fn rtcp() -> Self {
        Self::new(RTCP_MEDIA_TYPE)
    }

    /// Builder-style [`Caps::set`]
    pub fn with(mut self, field: &str, value: impl Into<CapsValue>) -> Self {
        self.set(field, value);
        self
    }

    /// Media type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set a field, replacing an existing value in place
    pub fn set(&mut self, field: &str, value: impl Into<CapsValue>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| k == field) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((field.to_string(), value)),
        }
    }

    /// Get a field value
    pub fn get(&self, field: &str) -> Option<&CapsValue> {
        self.fields.iter().find(|(k, _)| k == field).map(|(_, v)| v)
    }

    /// Get an integer field
    pub fn get_int(&self, field: &str) -> Option<i32> {
        match self.get(field) {
            Some(CapsValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Get a string field
    pub fn get_str(&self, field: &str) -> Option<&str> {
        match self.get(field) {
            Some(CapsValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Iterate over fields in insertion order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &CapsValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Payload type carried by RTP caps, if any
    pub fn payload(&self) -> Option<i32> {
        self.get_int("payload")
    }

    /// Whether these caps describe RTCP control traffic
    pub fn is_rtcp(&self) -> bool {
        self.name == RTCP_MEDIA_TYPE
    }

    /// Check whether both descriptors could describe the same stream
    ///
    /// Names must match and every field present on both sides must be equal.
    /// Fields present on only one side do not constrain the intersection.
    pub fn can_intersect(&self, other: &Caps) -> bool {
        if self.name != other.name {
            return false;
        }

        self.fields.iter().all(|(k, v)| match other.get(k) {
            Some(theirs) => theirs == v,
            None => true,
        })
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (k, v) in &self.fields {
            write!(f, ", {}={}", k, v)?;
        }
        Ok(())
    }
}
