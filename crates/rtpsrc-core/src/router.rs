//! Branch routing
//!
//! Every output branch the session manager creates ends up in exactly one of
//! three places: ignored (sink pads, RTCP), rejected (payload type contradicts
//! the selection filter), or exposed as a named output port. Exposure may go
//! through a caps rewrite stage first, and under the ignore-ssrc policy the
//! single existing port is repointed instead of a new one being added.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::caps::Caps;
use crate::elements::{Backend, Branch, CapsSetter, PadDirection, PadHandle, StageError, StageKind};
use crate::events::{RejectReason, SourceEvent};
use crate::settings::Settings;

/// Payload type every branch is relabelled to when payload types are ignored
pub const SENTINEL_PAYLOAD_TYPE: i32 = 96;

/// Prefix of exposed port names
pub const PORT_PREFIX: &str = "src";

/// An output port visible to consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedPort {
    /// `src0`, `src1`, ...
    pub name: String,
    /// Endpoint the port forwards
    pub target: PadHandle,
    /// Caps of the branch behind the port
    pub caps: Option<Caps>,
    /// Set once the port is link-ready
    pub active: bool,
}

/// The subset of settings that drives routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoutingPolicy {
    pub select_pt: Option<u8>,
    pub ignore_pt: bool,
    pub ignore_ssrc: bool,
}

impl From<&Settings> for RoutingPolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            select_pt: settings.select_pt,
            ignore_pt: settings.ignore_pt,
            ignore_ssrc: settings.ignore_ssrc,
        }
    }
}

/// Routing counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingStats {
    pub ports_exposed: u64,
    pub ports_retargeted: u64,
    pub sink_branches_ignored: u64,
    pub control_branches_ignored: u64,
    pub pt_mismatches: u64,
    pub ssrc_conflicts: u64,
    pub rewrite_failures: u64,
}

enum Placement {
    Create,
    Retarget(usize),
}

/// Outcome of [`Router::decide`]
pub enum Decision {
    /// Nothing left to do; the event, if any, says why
    Done(Option<SourceEvent>),
    /// The branch becomes a port once its target is prepared
    Expose(PendingPort),
}

/// A branch cleared for exposure
pub struct PendingPort {
    branch: Branch,
    rewrite: bool,
    ignore_ssrc: bool,
}

impl PendingPort {
    /// Build the port target, inserting a caps setter when payload types
    /// are ignored
    ///
    /// This talks to the backend, which may call back into the session, so
    /// it must run without any session lock held.
    pub fn prepare(self, backend: &dyn Backend) -> PreparedPort {
        let target = if self.rewrite {
            insert_rewriter(&self.branch, backend)
        } else {
            Ok(PortTarget {
                pad: self.branch.pad.clone(),
                caps: self.branch.caps.clone(),
                rewriter: None,
            })
        };

        PreparedPort {
            branch_pad: self.branch.pad,
            ignore_ssrc: self.ignore_ssrc,
            target,
        }
    }
}

struct PortTarget {
    pad: PadHandle,
    caps: Option<Caps>,
    rewriter: Option<Arc<dyn CapsSetter>>,
}

/// A branch whose port target exists, waiting for [`Router::commit`]
pub struct PreparedPort {
    branch_pad: PadHandle,
    ignore_ssrc: bool,
    target: Result<PortTarget, StageError>,
}

impl PreparedPort {
    /// Give up on the port; returns the stages built for it
    pub fn abandon(self) -> Vec<Arc<dyn CapsSetter>> {
        match self.target {
            Ok(PortTarget {
                rewriter: Some(setter),
                ..
            }) => vec![setter],
            _ => Vec::new(),
        }
    }
}

/// Result of [`Router::commit`]
pub struct Commit {
    pub event: Option<SourceEvent>,
    /// Caps setters no longer behind any port, see [`release_rewriters`]
    pub stale: Vec<Arc<dyn CapsSetter>>,
}

/// Insert a caps setter forcing the sentinel payload type behind `branch`
fn insert_rewriter(branch: &Branch, backend: &dyn Backend) -> Result<PortTarget, StageError> {
    let setter = backend.create_caps_setter()?;
    let forced = Caps::rtp().with("payload", SENTINEL_PAYLOAD_TYPE);

    debug!("Setting caps to pt {}", SENTINEL_PAYLOAD_TYPE);
    setter.set_caps(forced.clone());

    if let Err(e) = backend.link(&branch.pad, &setter.sink_pad()) {
        backend.release(setter.name());
        return Err(StageError::new(StageKind::CapsSetter, e.0));
    }

    if let Err(e) = setter.activate() {
        backend.release(setter.name());
        return Err(e);
    }

    let caps = match &branch.caps {
        Some(caps) => {
            let mut caps = caps.clone();
            caps.set("payload", SENTINEL_PAYLOAD_TYPE);
            caps
        }
        None => forced,
    };

    Ok(PortTarget {
        pad: setter.src_pad(),
        caps: Some(caps),
        rewriter: Some(setter),
    })
}

/// Deactivate and release caps setters handed out by the router
///
/// Runs without any session lock held, like [`PendingPort::prepare`].
pub fn release_rewriters(setters: Vec<Arc<dyn CapsSetter>>, backend: &dyn Backend) {
    for setter in setters.into_iter().rev() {
        setter.deactivate();
        backend.release(setter.name());
    }
}

/// Port set and per-branch decisions of one session
///
/// Routing is split in three steps so that no backend call happens while the
/// owner holds its lock: [`Router::decide`], then [`PendingPort::prepare`],
/// then [`Router::commit`].
#[derive(Default)]
pub struct Router {
    ports: Vec<ExposedPort>,
    next_index: u32,
    rewriters: Vec<Arc<dyn CapsSetter>>,
    stats: RoutingStats,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ignore, reject or clear `branch` for exposure
    pub fn decide(&mut self, branch: Branch, policy: &RoutingPolicy) -> Decision {
        debug!(
            "adding a pad {} with caps {}",
            branch.pad,
            branch
                .caps
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "(none)".to_string())
        );

        if branch.direction == PadDirection::Sink {
            debug!("Sink pad => Nothing to do");
            self.stats.sink_branches_ignored += 1;
            return Decision::Done(Some(SourceEvent::BranchIgnored { pad: branch.pad }));
        }

        if branch.is_control() {
            debug!("not interested in pad with rtcp caps");
            self.stats.control_branches_ignored += 1;
            return Decision::Done(Some(SourceEvent::BranchIgnored { pad: branch.pad }));
        }

        if let (Some(selected), Some(caps)) = (policy.select_pt, branch.caps.as_ref()) {
            let wanted = Caps::rtp().with("payload", i32::from(selected));
            if !caps.can_intersect(&wanted) {
                // The payload filter upstream should have dropped these packets
                error!(
                    "Received pt {:?} whereas pt-select equals {}",
                    caps.payload(),
                    selected
                );
                self.stats.pt_mismatches += 1;
                return Decision::Done(Some(SourceEvent::BranchRejected {
                    pad: branch.pad,
                    reason: RejectReason::PayloadTypeMismatch {
                        selected,
                        found: caps.payload(),
                    },
                }));
            }
        }

        if policy.ignore_ssrc {
            debug!("SSRC ignored, reconnecting on last pad");
            if self.placement(true).is_none() {
                return Decision::Done(None);
            }
        }

        Decision::Expose(PendingPort {
            branch,
            rewrite: policy.ignore_pt,
            ignore_ssrc: policy.ignore_ssrc,
        })
    }

    /// Turn a prepared branch into a new or retargeted port
    ///
    /// Any port change is complete, active and visible in [`Router::ports`]
    /// by the time the returned event exists.
    pub fn commit(&mut self, prepared: PreparedPort) -> Commit {
        let target = match prepared.target {
            Ok(target) => target,
            Err(e) => {
                error!("Could not insert caps setter after {}: {}", prepared.branch_pad, e);
                self.stats.rewrite_failures += 1;
                return Commit {
                    event: Some(SourceEvent::BranchRejected {
                        pad: prepared.branch_pad,
                        reason: RejectReason::CapsSetterFailed(e.to_string()),
                    }),
                    stale: Vec::new(),
                };
            }
        };

        // Ports may have changed while the target was prepared
        let Some(placement) = self.placement(prepared.ignore_ssrc) else {
            return Commit {
                event: None,
                stale: target.rewriter.into_iter().collect(),
            };
        };

        debug!("new pad on session manager {}", target.pad);
        if let Some(setter) = target.rewriter {
            self.rewriters.push(setter);
        }

        match placement {
            Placement::Create => Commit {
                event: Some(self.create(target.pad, target.caps)),
                stale: Vec::new(),
            },
            Placement::Retarget(index) => {
                let (event, previous) = self.retarget(index, target.pad, target.caps);
                Commit {
                    event: Some(event),
                    stale: self.detach_rewriter(&previous),
                }
            }
        }
    }

    fn placement(&mut self, ignore_ssrc: bool) -> Option<Placement> {
        if !ignore_ssrc {
            return Some(Placement::Create);
        }
        match self.ports.len() {
            0 => Some(Placement::Create),
            1 => Some(Placement::Retarget(0)),
            n => {
                warn!("{} exposed ports instead of 1; can't reconnect", n);
                self.stats.ssrc_conflicts += 1;
                None
            }
        }
    }

    fn create(&mut self, target: PadHandle, caps: Option<Caps>) -> SourceEvent {
        let name = format!("{}{}", PORT_PREFIX, self.next_index);
        self.next_index += 1;

        let port = ExposedPort {
            name: name.clone(),
            target: target.clone(),
            caps: caps.clone(),
            active: true,
        };
        self.ports.push(port);
        self.stats.ports_exposed += 1;

        debug!("exposed {} -> {}", name, target);
        SourceEvent::PortAdded { name, target, caps }
    }

    fn retarget(&mut self, index: usize, target: PadHandle, caps: Option<Caps>) -> (SourceEvent, PadHandle) {
        let port = &mut self.ports[index];
        let previous = std::mem::replace(&mut port.target, target.clone());
        port.caps = caps;
        port.active = true;
        self.stats.ports_retargeted += 1;

        debug!("retargeted {} from {} to {}", port.name, previous, target);
        let event = SourceEvent::PortRetargeted {
            name: port.name.clone(),
            previous: previous.clone(),
            target,
        };
        (event, previous)
    }

    /// Take out the caps setter that fed `previous`, if there was one
    fn detach_rewriter(&mut self, previous: &PadHandle) -> Vec<Arc<dyn CapsSetter>> {
        let (stale, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.rewriters)
            .into_iter()
            .partition(|setter| setter.name() == previous.element);
        self.rewriters = kept;
        stale
    }

    /// Snapshot of the exposed ports, in creation order
    pub fn ports(&self) -> Vec<ExposedPort> {
        self.ports.clone()
    }

    pub fn stats(&self) -> RoutingStats {
        self.stats
    }

    /// Index the next created port will get
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Remove every port; port numbering continues
    ///
    /// Returns the caps setters to hand to [`release_rewriters`].
    pub fn clear(&mut self) -> Vec<Arc<dyn CapsSetter>> {
        self.ports.clear();
        std::mem::take(&mut self.rewriters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{JournalEntry, RecordingBackend};

    /// Run all three routing steps on the calling thread
    fn route(
        router: &mut Router,
        branch: Branch,
        policy: &RoutingPolicy,
        backend: &RecordingBackend,
    ) -> Option<SourceEvent> {
        let pending = match router.decide(branch, policy) {
            Decision::Done(event) => return event,
            Decision::Expose(pending) => pending,
        };
        let commit = router.commit(pending.prepare(backend));
        release_rewriters(commit.stale, backend);
        commit.event
    }

    fn media_branch(ssrc: u32, pt: i32) -> Branch {
        Branch::src(
            PadHandle::new("session-manager0", format!("recv_rtp_src_0_{}_{}", ssrc, pt)),
            Caps::rtp().with("media", "video").with("payload", pt),
        )
    }

    #[test]
    fn test_each_branch_gets_a_port() {
        let backend = RecordingBackend::new();
        let mut router = Router::new();
        let policy = RoutingPolicy::default();

        let first = route(&mut router, media_branch(1, 96), &policy, &backend).unwrap();
        let second = route(&mut router, media_branch(2, 96), &policy, &backend).unwrap();

        assert_eq!(first.port_name(), Some("src0"));
        assert_eq!(second.port_name(), Some("src1"));
        assert_eq!(router.ports().len(), 2);
        assert!(router.ports().iter().all(|p| p.active));
    }

    #[test]
    fn test_ignore_ssrc_retargets_single_port() {
        let backend = RecordingBackend::new();
        let mut router = Router::new();
        let policy = RoutingPolicy {
            ignore_ssrc: true,
            ..Default::default()
        };

        route(&mut router, media_branch(1, 96), &policy, &backend);
        let event = route(&mut router, media_branch(2, 96), &policy, &backend).unwrap();

        assert!(matches!(event, SourceEvent::PortRetargeted { ref name, .. } if name == "src0"));
        let ports = router.ports();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].target.pad, "recv_rtp_src_0_2_96");
        assert_eq!(router.stats().ports_retargeted, 1);
    }

    #[test]
    fn test_ignore_ssrc_with_several_ports_is_a_no_op() {
        let backend = RecordingBackend::new();
        let mut router = Router::new();

        route(&mut router, media_branch(1, 96), &RoutingPolicy::default(), &backend);
        route(&mut router, media_branch(2, 96), &RoutingPolicy::default(), &backend);

        let policy = RoutingPolicy {
            ignore_ssrc: true,
            ..Default::default()
        };
        assert!(route(&mut router, media_branch(3, 96), &policy, &backend).is_none());
        assert_eq!(router.ports().len(), 2);
        assert_eq!(router.stats().ssrc_conflicts, 1);
    }

    #[test]
    fn test_control_and_sink_branches_are_ignored() {
        let backend = RecordingBackend::new();
        let mut router = Router::new();
        let policy = RoutingPolicy::default();

        let rtcp = Branch::src(PadHandle::new("session-manager0", "send_rtcp_src_0"), Caps::rtcp());
        let sink = Branch {
            pad: PadHandle::new("session-manager0", "recv_rtp_sink_0"),
            direction: PadDirection::Sink,
            caps: None,
        };

        assert!(matches!(
            route(&mut router, rtcp, &policy, &backend),
            Some(SourceEvent::BranchIgnored { .. })
        ));
        assert!(matches!(
            route(&mut router, sink, &policy, &backend),
            Some(SourceEvent::BranchIgnored { .. })
        ));
        assert!(router.ports().is_empty());
    }

    #[test]
    fn test_select_pt_mismatch_is_rejected() {
        let backend = RecordingBackend::new();
        let mut router = Router::new();
        let policy = RoutingPolicy {
            select_pt: Some(96),
            ..Default::default()
        };

        let event = route(&mut router, media_branch(1, 97), &policy, &backend).unwrap();
        assert_eq!(
            event,
            SourceEvent::BranchRejected {
                pad: PadHandle::new("session-manager0", "recv_rtp_src_0_1_97"),
                reason: RejectReason::PayloadTypeMismatch {
                    selected: 96,
                    found: Some(97)
                },
            }
        );
        assert!(router.ports().is_empty());
        assert_eq!(router.stats().pt_mismatches, 1);

        // Matching payload type goes through
        let event = route(&mut router, media_branch(1, 96), &policy, &backend).unwrap();
        assert_eq!(event.port_name(), Some("src0"));
    }

    #[test]
    fn test_ignore_pt_inserts_caps_setter() {
        let backend = RecordingBackend::new();
        let mut router = Router::new();
        let policy = RoutingPolicy {
            ignore_pt: true,
            ..Default::default()
        };

        let event = route(&mut router, media_branch(1, 100), &policy, &backend).unwrap();
        let SourceEvent::PortAdded { target, caps, .. } = event else {
            panic!("expected a new port");
        };
        assert_eq!(target, PadHandle::new("caps-setter0", "src"));
        assert_eq!(caps.unwrap().payload(), Some(SENTINEL_PAYLOAD_TYPE));
        assert_eq!(backend.active_stages(), vec!["caps-setter0".to_string()]);

        release_rewriters(router.clear(), &backend);
        assert!(backend.active_stages().is_empty());
        assert!(router.ports().is_empty());
        assert_eq!(router.next_index(), 1);
    }

    #[test]
    fn test_branch_without_caps_is_exposed() {
        let backend = RecordingBackend::new();
        let mut router = Router::new();
        let policy = RoutingPolicy {
            select_pt: Some(96),
            ..Default::default()
        };
        let branch = Branch {
            pad: PadHandle::new("session-manager0", "recv_rtp_src_0_1_96"),
            direction: PadDirection::Src,
            caps: None,
        };

        let event = route(&mut router, branch, &policy, &backend).unwrap();
        assert_eq!(event.port_name(), Some("src0"));
    }

    #[test]
    fn test_retargeting_releases_previous_caps_setter() {
        let backend = RecordingBackend::new();
        let mut router = Router::new();
        let policy = RoutingPolicy {
            ignore_pt: true,
            ignore_ssrc: true,
            ..Default::default()
        };

        for ssrc in 1..=5 {
            route(&mut router, media_branch(ssrc, 100), &policy, &backend).unwrap();
        }

        let ports = router.ports();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].target, PadHandle::new("caps-setter4", "src"));
        assert_eq!(backend.active_stages(), vec!["caps-setter4".to_string()]);
        assert!(backend.journal().contains(&JournalEntry::Release {
            name: "caps-setter0".into()
        }));

        release_rewriters(router.clear(), &backend);
        assert!(backend.active_stages().is_empty());
    }

    #[test]
    fn test_commit_rechecks_single_port() {
        let backend = RecordingBackend::new();
        let mut router = Router::new();
        let policy = RoutingPolicy {
            ignore_pt: true,
            ignore_ssrc: true,
            ..Default::default()
        };

        // Two branches cleared before either is committed
        let Decision::Expose(first) = router.decide(media_branch(1, 96), &policy) else {
            panic!("expected exposure");
        };
        let Decision::Expose(second) = router.decide(media_branch(2, 96), &policy) else {
            panic!("expected exposure");
        };
        let first = first.prepare(&backend);
        let second = second.prepare(&backend);

        let added = router.commit(first);
        assert_eq!(added.event.unwrap().port_name(), Some("src0"));
        let moved = router.commit(second);
        assert!(matches!(moved.event, Some(SourceEvent::PortRetargeted { .. })));
        assert_eq!(moved.stale.len(), 1);
        assert_eq!(moved.stale[0].name(), "caps-setter0");
        assert_eq!(router.ports().len(), 1);
    }

    #[test]
    fn test_failed_rewrite_is_rejected() {
        let backend = RecordingBackend::new();
        backend.fail_creation(StageKind::CapsSetter);
        let mut router = Router::new();
        let policy = RoutingPolicy {
            ignore_pt: true,
            ..Default::default()
        };

        let event = route(&mut router, media_branch(1, 96), &policy, &backend).unwrap();
        assert!(matches!(
            event,
            SourceEvent::BranchRejected {
                reason: RejectReason::CapsSetterFailed(_),
                ..
            }
        ));
        assert!(router.ports().is_empty());
        assert_eq!(router.stats().rewrite_failures, 1);
    }
}
