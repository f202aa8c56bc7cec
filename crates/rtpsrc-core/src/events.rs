//! Events emitted by an [`crate::RtpSource`]

use crate::caps::Caps;
use crate::elements::PadHandle;

/// Why a branch was dropped without being exposed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The branch carries a payload type other than the selected one
    PayloadTypeMismatch { selected: u8, found: Option<i32> },
    /// A caps rewrite stage could not be inserted
    CapsSetterFailed(String),
}

/// Session events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// Topology assembled and running
    Started,
    /// Topology torn down
    Stopped,
    /// A new output port is visible and link-ready
    PortAdded {
        name: String,
        target: PadHandle,
        caps: Option<Caps>,
    },
    /// The single port kept under ignore-ssrc now follows another branch
    PortRetargeted {
        name: String,
        previous: PadHandle,
        target: PadHandle,
    },
    /// A sink or RTCP branch that is handled internally
    BranchIgnored { pad: PadHandle },
    /// A branch that violates the configured policy
    BranchRejected { pad: PadHandle, reason: RejectReason },
    /// No encoding name was set and the fallback was assumed
    EncodingNameDefaulted { encoding_name: String, pt: u8 },
}

impl SourceEvent {
    /// Name of the port the event is about, if any
    pub fn port_name(&self) -> Option<&str> {
        match self {
            SourceEvent::PortAdded { name, .. } | SourceEvent::PortRetargeted { name, .. } => {
                Some(name)
            }
            _ => None,
        }
    }
}
