//! In-memory backend
//!
//! [`RecordingBackend`] implements every stage role without touching the
//! network. It journals each factory, configuration, link and lifecycle call
//! in order, which makes topology and ordering observable. Failures can be
//! injected per stage kind, and branches and payload type queries can be fed
//! in as if a real session manager produced them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::caps::Caps;
use crate::elements::{
    Backend, Branch, BranchSender, CapsSetter, Decryptor, LinkError, PadHandle, PayloadFilter,
    PtMapFn, SessionManager, SessionManagerConfig, SocketHandle, Stage, StageError, StageKind,
    UdpSink, UdpSinkConfig, UdpSource, UdpSourceConfig,
};

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Create { kind: StageKind, name: String },
    ConfigureSource { name: String, config: UdpSourceConfig },
    ConfigureSink { name: String, config: UdpSinkConfig },
    ConfigureSessionManager { name: String, config: SessionManagerConfig },
    SetRate { name: String, rate: u32 },
    SetSelectedPt { name: String, pt: Option<u8> },
    SetCaps { name: String, caps: Caps },
    InstallPtMap { name: String, installed: bool },
    InstallBranchSender { name: String, installed: bool },
    Link { src: PadHandle, sink: PadHandle },
    Activate { name: String },
    Deactivate { name: String },
    Release { name: String },
}

impl JournalEntry {
    /// Name of the stage the entry is about, if it concerns a single stage
    pub fn stage(&self) -> Option<&str> {
        match self {
            JournalEntry::Create { name, .. }
            | JournalEntry::ConfigureSource { name, .. }
            | JournalEntry::ConfigureSink { name, .. }
            | JournalEntry::ConfigureSessionManager { name, .. }
            | JournalEntry::SetRate { name, .. }
            | JournalEntry::SetSelectedPt { name, .. }
            | JournalEntry::SetCaps { name, .. }
            | JournalEntry::InstallPtMap { name, .. }
            | JournalEntry::InstallBranchSender { name, .. }
            | JournalEntry::Activate { name }
            | JournalEntry::Deactivate { name }
            | JournalEntry::Release { name } => Some(name),
            JournalEntry::Link { .. } => None,
        }
    }
}

impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalEntry::Create { kind, name } => write!(f, "create    {} ({})", name, kind),
            JournalEntry::ConfigureSource { name, config } => {
                write!(
                    f,
                    "configure {} bind={} reuse={} auto-multicast={} close-socket={} buffer-size={}",
                    name,
                    config.binding,
                    config.reuse,
                    config.auto_multicast,
                    config.close_socket,
                    config.buffer_size
                )?;
                if let Some(iface) = &config.multicast_iface {
                    write!(f, " multicast-iface={}", iface)?;
                }
                if let Some(caps) = &config.caps {
                    write!(f, " caps=\"{}\"", caps)?;
                }
                Ok(())
            }
            JournalEntry::ConfigureSink { name, config } => {
                write!(
                    f,
                    "configure {} host={} port={} sync={} async={} force-ipv4={} auto-multicast={} close-socket={}",
                    name,
                    config.host,
                    config.port,
                    config.sync,
                    config.is_async,
                    config.force_ipv4,
                    config.auto_multicast,
                    config.close_socket
                )?;
                match config.socket {
                    Some(socket) => write!(f, " socket={}", socket),
                    None => Ok(()),
                }
            }
            JournalEntry::ConfigureSessionManager { name, config } => write!(
                f,
                "configure {} do-lost={} autoremove={} ignore-pt={} latency={}",
                name, config.do_lost, config.autoremove, config.ignore_pt, config.latency_ms
            ),
            JournalEntry::SetRate { name, rate } => write!(f, "configure {} rate={}", name, rate),
            JournalEntry::SetSelectedPt { name, pt } => write!(
                f,
                "configure {} pt-select={}",
                name,
                pt.map(i32::from).unwrap_or(-1)
            ),
            JournalEntry::SetCaps { name, caps } => write!(f, "configure {} caps=\"{}\"", name, caps),
            JournalEntry::InstallPtMap { name, installed } => {
                write!(f, "callback  {} pt-map={}", name, installed)
            }
            JournalEntry::InstallBranchSender { name, installed } => {
                write!(f, "callback  {} branches={}", name, installed)
            }
            JournalEntry::Link { src, sink } => write!(f, "link      {} -> {}", src, sink),
            JournalEntry::Activate { name } => write!(f, "activate  {}", name),
            JournalEntry::Deactivate { name } => write!(f, "stop      {}", name),
            JournalEntry::Release { name } => write!(f, "release   {}", name),
        }
    }
}

#[derive(Default)]
struct Recorder {
    journal: Vec<JournalEntry>,
    instances: HashMap<StageKind, u32>,
    fail_create: HashSet<StageKind>,
    fail_activate: HashSet<StageKind>,
    fail_link: bool,
    next_socket: u64,
    active: Vec<String>,
    session_manager: Option<Weak<RecordedStage>>,
}

impl Recorder {
    fn record(&mut self, entry: JournalEntry) {
        trace!("{}", entry);
        self.journal.push(entry);
    }
}

/// Backend that records instead of doing I/O
#[derive(Clone, Default)]
pub struct RecordingBackend {
    recorder: Arc<Mutex<Recorder>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make creation of every stage of `kind` fail
    pub fn fail_creation(&self, kind: StageKind) {
        self.recorder.lock().fail_create.insert(kind);
    }

    /// Make activation of every stage of `kind` fail
    pub fn fail_activation(&self, kind: StageKind) {
        self.recorder.lock().fail_activate.insert(kind);
    }

    /// Make every link attempt fail
    pub fn fail_links(&self, fail: bool) {
        self.recorder.lock().fail_link = fail;
    }

    /// Recorded calls, oldest first
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.recorder.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.recorder.lock().journal.clear();
    }

    /// Names of the stages currently active, in activation order
    pub fn active_stages(&self) -> Vec<String> {
        self.recorder.lock().active.clone()
    }

    fn session_manager(&self) -> Option<Arc<RecordedStage>> {
        self.recorder
            .lock()
            .session_manager
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Announce `branch` the way the session manager would
    ///
    /// Returns false if no session manager with a branch channel exists.
    pub fn emit_branch(&self, branch: Branch) -> bool {
        let sender = self
            .session_manager()
            .and_then(|sm| sm.branch_tx.lock().clone());
        match sender {
            Some(tx) => tx.send(branch).is_ok(),
            None => false,
        }
    }

    /// Announce a media branch for `ssrc` carrying `caps`
    pub fn emit_media_branch(&self, ssrc: u32, caps: Caps) -> bool {
        let pt = caps.payload().unwrap_or_default();
        let name = self
            .session_manager()
            .map(|sm| sm.name.clone())
            .unwrap_or_else(|| "session-manager0".to_string());
        self.emit_branch(Branch::src(
            PadHandle::new(name, format!("recv_rtp_src_0_{}_{}", ssrc, pt)),
            caps,
        ))
    }

    /// Ask the installed payload type callback for caps
    ///
    /// The outer `None` means no callback is installed.
    pub fn request_pt_map(&self, session: u32, pt: u8) -> Option<Option<Caps>> {
        let pt_map = self
            .session_manager()
            .and_then(|sm| sm.pt_map.lock().clone())?;
        Some(pt_map(session, pt))
    }

    fn create(&self, kind: StageKind) -> Result<Arc<RecordedStage>, StageError> {
        let mut recorder = self.recorder.lock();
        if recorder.fail_create.contains(&kind) {
            return Err(StageError::new(kind, "not installed"));
        }

        let index = recorder.instances.entry(kind).or_insert(0);
        let name = format!("{}{}", kind, index);
        *index += 1;

        recorder.record(JournalEntry::Create {
            kind,
            name: name.clone(),
        });

        let stage = Arc::new(RecordedStage {
            kind,
            name,
            recorder: self.recorder.clone(),
            socket: Mutex::new(None),
            pt_map: Mutex::new(None),
            branch_tx: Mutex::new(None),
        });

        if kind == StageKind::SessionManager {
            recorder.session_manager = Some(Arc::downgrade(&stage));
        }
        Ok(stage)
    }
}

impl Backend for RecordingBackend {
    fn create_udp_source(&self, kind: StageKind) -> Result<Arc<dyn UdpSource>, StageError> {
        Ok(self.create(kind)?)
    }

    fn create_udp_sink(&self) -> Result<Arc<dyn UdpSink>, StageError> {
        Ok(self.create(StageKind::ControlSink)?)
    }

    fn create_decryptor(&self) -> Result<Arc<dyn Decryptor>, StageError> {
        Ok(self.create(StageKind::Decryptor)?)
    }

    fn create_payload_filter(&self) -> Result<Arc<dyn PayloadFilter>, StageError> {
        Ok(self.create(StageKind::PayloadFilter)?)
    }

    fn create_caps_setter(&self) -> Result<Arc<dyn CapsSetter>, StageError> {
        Ok(self.create(StageKind::CapsSetter)?)
    }

    fn create_session_manager(&self) -> Result<Arc<dyn SessionManager>, StageError> {
        Ok(self.create(StageKind::SessionManager)?)
    }

    fn link(&self, src: &PadHandle, sink: &PadHandle) -> Result<(), LinkError> {
        let mut recorder = self.recorder.lock();
        if recorder.fail_link {
            return Err(LinkError(format!("{} refused {}", sink, src)));
        }
        recorder.record(JournalEntry::Link {
            src: src.clone(),
            sink: sink.clone(),
        });
        Ok(())
    }

    fn release(&self, name: &str) {
        let mut recorder = self.recorder.lock();
        recorder.active.retain(|n| n != name);
        recorder.record(JournalEntry::Release {
            name: name.to_string(),
        });
    }
}

/// A stage playing whichever role it was created for
struct RecordedStage {
    kind: StageKind,
    name: String,
    recorder: Arc<Mutex<Recorder>>,
    socket: Mutex<Option<SocketHandle>>,
    pt_map: Mutex<Option<PtMapFn>>,
    branch_tx: Mutex<Option<BranchSender>>,
}

impl RecordedStage {
    fn record(&self, entry: JournalEntry) {
        self.recorder.lock().record(entry);
    }

    fn pad(&self, pad: &str) -> PadHandle {
        PadHandle::new(self.name.clone(), pad)
    }
}

impl Stage for RecordedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn activate(&self) -> Result<(), StageError> {
        let mut recorder = self.recorder.lock();
        if recorder.fail_activate.contains(&self.kind) {
            return Err(StageError::new(self.kind, "state change failed"));
        }

        if matches!(self.kind, StageKind::MediaSource | StageKind::ControlSource) {
            recorder.next_socket += 1;
            *self.socket.lock() = Some(SocketHandle(recorder.next_socket));
        }

        if !recorder.active.contains(&self.name) {
            recorder.active.push(self.name.clone());
        }
        recorder.record(JournalEntry::Activate {
            name: self.name.clone(),
        });
        Ok(())
    }

    fn deactivate(&self) {
        let mut recorder = self.recorder.lock();
        let was_active = recorder.active.iter().any(|n| n == &self.name);
        recorder.active.retain(|n| n != &self.name);
        *self.socket.lock() = None;

        if was_active {
            recorder.record(JournalEntry::Deactivate {
                name: self.name.clone(),
            });
        }
    }
}

impl UdpSource for RecordedStage {
    fn configure(&self, config: &UdpSourceConfig) {
        self.record(JournalEntry::ConfigureSource {
            name: self.name.clone(),
            config: config.clone(),
        });
    }

    fn used_socket(&self) -> Option<SocketHandle> {
        *self.socket.lock()
    }

    fn src_pad(&self) -> PadHandle {
        self.pad("src")
    }
}

impl UdpSink for RecordedStage {
    fn configure(&self, config: &UdpSinkConfig) {
        self.record(JournalEntry::ConfigureSink {
            name: self.name.clone(),
            config: config.clone(),
        });
    }

    fn sink_pad(&self) -> PadHandle {
        self.pad("sink")
    }
}

impl Decryptor for RecordedStage {
    fn set_key_derivation_rate(&self, rate: u32) {
        self.record(JournalEntry::SetRate {
            name: self.name.clone(),
            rate,
        });
    }

    fn sink_pad(&self) -> PadHandle {
        self.pad("sink")
    }

    fn src_pad(&self) -> PadHandle {
        self.pad("src")
    }
}

impl PayloadFilter for RecordedStage {
    fn set_selected_pt(&self, pt: Option<u8>) {
        self.record(JournalEntry::SetSelectedPt {
            name: self.name.clone(),
            pt,
        });
    }

    fn sink_pad(&self) -> PadHandle {
        self.pad("sink")
    }

    fn src_pad(&self) -> PadHandle {
        self.pad("src")
    }
}

impl CapsSetter for RecordedStage {
    fn set_caps(&self, caps: Caps) {
        self.record(JournalEntry::SetCaps {
            name: self.name.clone(),
            caps,
        });
    }

    fn sink_pad(&self) -> PadHandle {
        self.pad("sink")
    }

    fn src_pad(&self) -> PadHandle {
        self.pad("src")
    }
}

impl SessionManager for RecordedStage {
    fn configure(&self, config: &SessionManagerConfig) {
        self.record(JournalEntry::ConfigureSessionManager {
            name: self.name.clone(),
            config: *config,
        });
    }

    fn set_pt_map(&self, pt_map: Option<PtMapFn>) {
        let installed = pt_map.is_some();
        *self.pt_map.lock() = pt_map;
        self.record(JournalEntry::InstallPtMap {
            name: self.name.clone(),
            installed,
        });
    }

    fn set_branch_sender(&self, sender: Option<BranchSender>) {
        let installed = sender.is_some();
        *self.branch_tx.lock() = sender;
        self.record(JournalEntry::InstallBranchSender {
            name: self.name.clone(),
            installed,
        });
    }

    fn recv_rtp_sink(&self) -> PadHandle {
        self.pad("recv_rtp_sink_0")
    }

    fn recv_rtcp_sink(&self) -> PadHandle {
        self.pad("recv_rtcp_sink_0")
    }

    fn send_rtcp_src(&self) -> PadHandle {
        self.pad("send_rtcp_src_0")
    }
}
