//! Collaborator stages
//!
//! The orchestrator never touches sockets or packets itself. UDP transport,
//! decryption, payload filtering and the RTP session manager are provided by a
//! [`Backend`], which instantiates stages on demand. Each stage role has a
//! typed configuration struct that is pushed into it as a whole, both at
//! assembly time and whenever a live property changes.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::caps::Caps;

/// Kind of processing stage managed by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// UDP source receiving RTP
    MediaSource,
    /// UDP source receiving RTCP
    ControlSource,
    /// UDP sink sending RTCP
    ControlSink,
    /// Packet decryption
    Decryptor,
    /// Drops every payload type except the selected one
    PayloadFilter,
    /// Rewrites caps on an exposed branch
    CapsSetter,
    /// RTP session manager (jitterbuffer, SSRC demux, RTCP)
    SessionManager,
}

impl StageKind {
    /// Stable kebab-case name, used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::MediaSource => "media-source",
            StageKind::ControlSource => "control-source",
            StageKind::ControlSink => "control-sink",
            StageKind::Decryptor => "decryptor",
            StageKind::PayloadFilter => "payload-filter",
            StageKind::CapsSetter => "caps-setter",
            StageKind::SessionManager => "session-manager",
        }
    }

    /// Whether an activation failure of this stage is tolerated
    pub fn is_optional(&self) -> bool {
        matches!(self, StageKind::ControlSource | StageKind::ControlSink)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a collaborator stage
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stage}: {reason}")]
pub struct StageError {
    /// Stage that failed
    pub stage: StageKind,
    /// Collaborator supplied reason
    pub reason: String,
}

impl StageError {
    /// Create a new stage error
    pub fn new(stage: StageKind, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

/// Failure reported by [`Backend::link`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct LinkError(pub String);

/// Direction of a pad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadDirection {
    /// Data flows into the stage
    Sink,
    /// Data flows out of the stage
    Src,
}

/// A named endpoint on a stage
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PadHandle {
    /// Name of the stage owning the pad
    pub element: String,
    /// Pad name on that stage
    pub pad: String,
}

impl PadHandle {
    pub fn new(element: impl Into<String>, pad: impl Into<String>) -> Self {
        Self {
            element: element.into(),
            pad: pad.into(),
        }
    }
}

impl fmt::Display for PadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.element, self.pad)
    }
}

/// A new output branch announced by the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    /// Endpoint of the branch on the session manager
    pub pad: PadHandle,
    /// Direction of the new pad
    pub direction: PadDirection,
    /// Caps the branch carries, if already known
    pub caps: Option<Caps>,
}

impl Branch {
    /// A source branch carrying `caps`
    pub fn src(pad: PadHandle, caps: Caps) -> Self {
        Self {
            pad,
            direction: PadDirection::Src,
            caps: Some(caps),
        }
    }

    /// Whether the branch carries RTCP
    pub fn is_control(&self) -> bool {
        self.caps.as_ref().is_some_and(|caps| caps.is_rtcp())
    }
}

/// Opaque identifier of a socket owned by a UDP stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(pub u64);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Payload type to caps callback installed on the session manager.
///
/// Arguments are the session id and the payload type.
pub type PtMapFn = Arc<dyn Fn(u32, u8) -> Option<Caps> + Send + Sync>;

/// Channel on which the session manager announces new branches
pub type BranchSender = mpsc::UnboundedSender<Branch>;

/// How a UDP source binds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceBinding {
    /// Join a multicast group, `udp://group:port`
    Uri(String),
    /// Listen on a local port on every interface
    Port(u16),
}

impl fmt::Display for SourceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceBinding::Uri(uri) => f.write_str(uri),
            SourceBinding::Port(port) => write!(f, "port {}", port),
        }
    }
}

/// Configuration of a UDP source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpSourceConfig {
    pub binding: SourceBinding,
    pub reuse: bool,
    pub multicast_iface: Option<String>,
    pub buffer_size: u32,
    pub auto_multicast: bool,
    /// Close the socket on deactivation
    pub close_socket: bool,
    /// Caps stamped on outgoing buffers
    pub caps: Option<Caps>,
}

/// Configuration of a UDP sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpSinkConfig {
    pub host: String,
    pub port: u16,
    pub sync: bool,
    pub is_async: bool,
    pub force_ipv4: bool,
    pub buffer_size: u32,
    pub multicast_iface: Option<String>,
    pub auto_multicast: bool,
    pub close_socket: bool,
    /// Socket shared with another stage instead of opening a new one
    pub socket: Option<SocketHandle>,
}

/// Configuration of the session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionManagerConfig {
    /// Emit events for lost packets
    pub do_lost: bool,
    /// Remove sources that time out
    pub autoremove: bool,
    pub ignore_pt: bool,
    pub latency_ms: u32,
}

/// Common lifecycle of every stage
pub trait Stage: Send + Sync {
    /// Unique name of the stage instance
    fn name(&self) -> &str;

    /// Bring the stage to the running state
    fn activate(&self) -> Result<(), StageError>;

    /// Return the stage to the idle state; must tolerate repeated calls
    fn deactivate(&self);
}

/// UDP receiving stage
pub trait UdpSource: Stage {
    fn configure(&self, config: &UdpSourceConfig);

    /// Socket in use, only available once active
    fn used_socket(&self) -> Option<SocketHandle>;

    fn src_pad(&self) -> PadHandle;
}

/// UDP sending stage
pub trait UdpSink: Stage {
    fn configure(&self, config: &UdpSinkConfig);

    fn sink_pad(&self) -> PadHandle;
}

/// Packet decryption stage
pub trait Decryptor: Stage {
    /// Key derivation rate; accepted and forwarded, semantics are up to the stage
    fn set_key_derivation_rate(&self, rate: u32);

    fn sink_pad(&self) -> PadHandle;
    fn src_pad(&self) -> PadHandle;
}

/// Stage letting a single payload type through
pub trait PayloadFilter: Stage {
    /// `None` lets every payload type through
    fn set_selected_pt(&self, pt: Option<u8>);

    fn sink_pad(&self) -> PadHandle;
    fn src_pad(&self) -> PadHandle;
}

/// Stage that forces caps fields on a branch
pub trait CapsSetter: Stage {
    fn set_caps(&self, caps: Caps);

    fn sink_pad(&self) -> PadHandle;
    fn src_pad(&self) -> PadHandle;
}

/// RTP session manager
pub trait SessionManager: Stage {
    fn configure(&self, config: &SessionManagerConfig);

    /// Install the payload type to caps callback
    fn set_pt_map(&self, pt_map: Option<PtMapFn>);

    /// Install the channel on which new output branches are announced
    fn set_branch_sender(&self, sender: Option<BranchSender>);

    /// Request the RTP input of session 0
    fn recv_rtp_sink(&self) -> PadHandle;

    /// Request the RTCP input of session 0
    fn recv_rtcp_sink(&self) -> PadHandle;

    /// Request the RTCP output of session 0
    fn send_rtcp_src(&self) -> PadHandle;
}

/// Factory and container for stages
pub trait Backend: Send + Sync {
    fn create_udp_source(&self, kind: StageKind) -> Result<Arc<dyn UdpSource>, StageError>;
    fn create_udp_sink(&self) -> Result<Arc<dyn UdpSink>, StageError>;
    fn create_decryptor(&self) -> Result<Arc<dyn Decryptor>, StageError>;
    fn create_payload_filter(&self) -> Result<Arc<dyn PayloadFilter>, StageError>;
    fn create_caps_setter(&self) -> Result<Arc<dyn CapsSetter>, StageError>;
    fn create_session_manager(&self) -> Result<Arc<dyn SessionManager>, StageError>;

    /// Connect a source pad to a sink pad
    fn link(&self, src: &PadHandle, sink: &PadHandle) -> Result<(), LinkError>;

    /// Drop a stage from the container once it is deactivated
    fn release(&self, name: &str);
}
