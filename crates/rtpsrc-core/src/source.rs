//! RTP source orchestrator
//!
//! [`RtpSource`] owns the settings, the running [`SessionGraph`] and the port
//! set of one receive session. The session manager reaches back into it
//! through two callbacks: the payload type map, called synchronously from
//! whatever thread the collaborator runs on, and the branch channel, drained
//! by a single router task so that each branch is handled to completion
//! before the next one is looked at.
//!
//! All live state sits behind one mutex per instance. Nothing that calls
//! into a collaborator runs while that mutex is held, since collaborators may
//! answer with a payload type query on the same thread.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::caps::Caps;
use crate::elements::{Backend, Branch, PtMapFn};
use crate::error::{Error, Result};
use crate::events::SourceEvent;
use crate::graph::{GraphHooks, GraphStages, SessionGraph};
use crate::resolver::resolve;
use crate::router::{
    release_rewriters, Decision, ExposedPort, Router, RoutingPolicy, SENTINEL_PAYLOAD_TYPE,
};
use crate::settings::{parse_select_pt, Settings};
use crate::uri::{RtpUri, UriHandler, UriType, RTP_SCHEME};

/// Lifecycle phase of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Active,
}

/// Counters describing what happened to branches and payload types
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub ports_exposed: u64,
    pub ports_retargeted: u64,
    pub sink_branches_ignored: u64,
    pub control_branches_ignored: u64,
    pub pt_mismatches: u64,
    pub ssrc_conflicts: u64,
    pub rewrite_failures: u64,
    pub pt_map_queries: u64,
    pub unresolved_payload_types: u64,
    /// Encoding name assumed for the current session because none was configured
    pub defaulted_encoding_name: Option<String>,
}

struct State {
    phase: Phase,
    settings: Settings,
    graph: Option<SessionGraph>,
    /// Bumped on every successful start
    session: u64,
    router: Router,
    pt_map_queries: u64,
    unresolved_payload_types: u64,
    defaulted_encoding_name: Option<String>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    state: Mutex<State>,
    /// Serialises pushes of live settings into the stages
    forwarding: Mutex<()>,
    event_tx: mpsc::UnboundedSender<SourceEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SourceEvent>>>,
    router_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn emit(&self, event: SourceEvent) {
        // Nobody listening is fine
        let _ = self.event_tx.send(event);
    }

    fn request_pt_map(&self, session: u32, pt: u8) -> Option<Caps> {
        debug!("requesting caps for pt {} in session {}", pt, session);

        let mut state = self.state.lock();
        state.pt_map_queries += 1;

        let encoding_name = state
            .settings
            .encoding_name
            .clone()
            .or_else(|| state.defaulted_encoding_name.clone());
        let resolution = resolve(pt, encoding_name.as_deref());

        if let Some(name) = resolution.defaulted {
            info!("No encoding name set, assuming {}", name);
            state.defaulted_encoding_name = Some(name.to_string());
            self.emit(SourceEvent::EncodingNameDefaulted {
                encoding_name: name.to_string(),
                pt,
            });
        }

        match resolution.caps {
            Some(caps) => {
                debug!("Returning {}", caps);
                Some(caps)
            }
            None => {
                state.unresolved_payload_types += 1;
                None
            }
        }
    }

    fn handle_branch(&self, branch: Branch) {
        let (session, pending) = {
            let mut state = self.state.lock();
            if state.phase != Phase::Active {
                debug!("Dropping branch {} on inactive source", branch.pad);
                return;
            }

            let policy = RoutingPolicy::from(&state.settings);
            match state.router.decide(branch, &policy) {
                Decision::Done(event) => {
                    if let Some(event) = event {
                        self.emit(event);
                    }
                    return;
                }
                Decision::Expose(pending) => (state.session, pending),
            }
        };

        let prepared = pending.prepare(self.backend.as_ref());

        let (event, stale) = {
            let mut state = self.state.lock();
            if state.phase != Phase::Active || state.session != session {
                debug!("Session ended while exposing a branch");
                (None, prepared.abandon())
            } else {
                let commit = state.router.commit(prepared);
                (commit.event, commit.stale)
            }
        };

        // A retargeted port's old caps setter is gone before anyone hears of it
        release_rewriters(stale, self.backend.as_ref());
        if let Some(event) = event {
            self.emit(event);
        }
    }
}

/// An RTP receive session
///
/// Configure it through the setters or an `rtp://` URI, then [`start`] it
/// inside a Tokio runtime. Output ports show up as [`SourceEvent::PortAdded`]
/// events and in [`RtpSource::ports`].
///
/// [`start`]: RtpSource::start
pub struct RtpSource {
    inner: Arc<Inner>,
}

impl RtpSource {
    /// Create an idle source using `backend` for its stages
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_settings(backend, Settings::default())
    }

    /// Create an idle source with preloaded settings
    pub fn with_settings(backend: Arc<dyn Backend>, settings: Settings) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                backend,
                forwarding: Mutex::new(()),
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    settings,
                    graph: None,
                    session: 0,
                    router: Router::new(),
                    pt_map_queries: 0,
                    unresolved_payload_types: 0,
                    defaulted_encoding_name: None,
                }),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                router_task: Mutex::new(None),
            }),
        }
    }

    /// Take the event receiver; only the first call gets it
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SourceEvent>> {
        self.inner.event_rx.lock().take()
    }

    fn pt_map_fn(&self) -> PtMapFn {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |session, pt| {
            weak.upgrade()
                .and_then(|inner| inner.request_pt_map(session, pt))
        })
    }

    /// Assemble and activate the processing graph
    ///
    /// Starting an already started source does nothing.
    pub async fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let settings = {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Idle {
                debug!("Source already started");
                return Ok(());
            }
            if state.settings.uri.is_none() {
                return Err(Error::MissingUri);
            }
            state.phase = Phase::Starting;
            state.settings.clone()
        };

        info!("Configuring rtpsrc");

        // A forced encoding name also describes the raw input
        let source_caps = settings.encoding_name.as_deref().and_then(|name| {
            resolve(SENTINEL_PAYLOAD_TYPE as u8, Some(name)).caps
        });

        let (branch_tx, mut branch_rx) = mpsc::unbounded_channel::<Branch>();
        let hooks = GraphHooks {
            pt_map: self.pt_map_fn(),
            branch_tx,
            source_caps,
        };

        // Built without holding the lock, collaborators may call back in
        let assembled = SessionGraph::assemble(self.inner.backend.clone(), &settings, hooks);

        let graph = match assembled {
            Ok(graph) => graph,
            Err(e) => {
                self.inner.state.lock().phase = Phase::Idle;
                return Err(e);
            }
        };

        let forwarding = self.inner.forwarding.lock();
        let stages = graph.stages();
        let installed = {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Starting {
                let changed = (state.settings != settings).then(|| state.settings.clone());
                state.graph = Some(graph);
                state.phase = Phase::Active;
                state.session += 1;
                Ok(changed)
            } else {
                Err(graph)
            }
        };

        match installed {
            Ok(Some(current)) => stages.reconfigure(&current),
            Ok(None) => {}
            Err(mut stopped) => {
                debug!("Source stopped while starting");
                drop(forwarding);
                stopped.teardown();
                return Ok(());
            }
        }
        drop(forwarding);

        let weak = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            while let Some(branch) = branch_rx.recv().await {
                match weak.upgrade() {
                    Some(inner) => inner.handle_branch(branch),
                    None => break,
                }
            }
            debug!("Branch router finished");
        });
        *self.inner.router_task.lock() = Some(task);

        self.inner.emit(SourceEvent::Started);
        info!("✅ rtpsrc started");
        Ok(())
    }

    /// Tear the session down
    ///
    /// Safe to call at any time and any number of times. Ports disappear but
    /// their numbering continues on the next start.
    pub async fn stop(&self) {
        let task = self.inner.router_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let (graph, stale) = {
            let mut state = self.inner.state.lock();
            state.phase = Phase::Idle;
            state.defaulted_encoding_name = None;
            (state.graph.take(), state.router.clear())
        };

        release_rewriters(stale, self.inner.backend.as_ref());
        if let Some(mut graph) = graph {
            info!("🛑 Shutting down rtpsrc");
            graph.teardown();
            self.inner.emit(SourceEvent::Stopped);
        }
    }

    /// Payload type to caps callback, as seen by the session manager
    pub fn request_pt_map(&self, session: u32, pt: u8) -> Option<Caps> {
        self.inner.request_pt_map(session, pt)
    }

    /// Route one branch synchronously
    pub fn handle_branch(&self, branch: Branch) {
        self.inner.handle_branch(branch);
    }

    /// Exposed ports, in creation order
    pub fn ports(&self) -> Vec<ExposedPort> {
        self.inner.state.lock().router.ports()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    pub fn is_active(&self) -> bool {
        self.phase() == Phase::Active
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let state = self.inner.state.lock();
        let stats = state.router.stats();
        Diagnostics {
            ports_exposed: stats.ports_exposed,
            ports_retargeted: stats.ports_retargeted,
            sink_branches_ignored: stats.sink_branches_ignored,
            control_branches_ignored: stats.control_branches_ignored,
            pt_mismatches: stats.pt_mismatches,
            ssrc_conflicts: stats.ssrc_conflicts,
            rewrite_failures: stats.rewrite_failures,
            pt_map_queries: state.pt_map_queries,
            unresolved_payload_types: state.unresolved_payload_types,
            defaulted_encoding_name: state.defaulted_encoding_name.clone(),
        }
    }

    /// Snapshot of the current settings
    pub fn settings(&self) -> Settings {
        self.inner.state.lock().settings.clone()
    }

    /// Replace every setting at once; only while idle
    pub fn set_settings(&self, settings: Settings) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Idle {
            return Err(Error::invalid_state("settings"));
        }
        state.settings = settings;
        Ok(())
    }

    /// Apply `f` to the settings and forward the result to running stages
    fn update_live(&self, f: impl FnOnce(&mut Settings)) {
        let _forwarding = self.inner.forwarding.lock();
        let (stages, settings): (Option<GraphStages>, Settings) = {
            let mut state = self.inner.state.lock();
            f(&mut state.settings);
            (
                state.graph.as_ref().map(SessionGraph::stages),
                state.settings.clone(),
            )
        };
        if let Some(stages) = stages {
            stages.reconfigure(&settings);
        }
    }

    /// Apply `f` to the settings, refusing while a session runs
    fn update_idle(&self, property: &str, f: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Idle {
            return Err(Error::invalid_state(property));
        }
        f(&mut state.settings);
        Ok(())
    }

    pub fn encoding_name(&self) -> Option<String> {
        self.inner.state.lock().settings.encoding_name.clone()
    }

    /// Force an encoding name, bypassing the static payload table
    pub fn set_encoding_name(&self, name: Option<&str>) -> Result<()> {
        let name = name.filter(|n| !n.is_empty());
        self.update_idle("encoding-name", |s| s.encoding_name = name.map(str::to_string))?;
        if let Some(name) = name {
            info!("Force encoding name {}, do you know what you are doing?", name);
        }
        Ok(())
    }

    /// Selected payload type, -1 when disabled
    pub fn select_pt(&self) -> i32 {
        self.inner.state.lock().settings.select_pt_value()
    }

    pub fn set_select_pt(&self, pt: i32) -> Result<()> {
        let select_pt = parse_select_pt(pt)?;
        self.update_live(|s| s.select_pt = select_pt);
        debug!("set select pt: {}", pt);
        Ok(())
    }

    pub fn latency(&self) -> u32 {
        self.inner.state.lock().settings.latency_ms
    }

    pub fn set_latency(&self, latency_ms: u32) {
        self.update_live(|s| s.latency_ms = latency_ms);
    }

    pub fn enable_rtcp(&self) -> bool {
        self.inner.state.lock().settings.enable_rtcp
    }

    pub fn set_enable_rtcp(&self, enable: bool) -> Result<()> {
        self.update_idle("enable-rtcp", |s| s.enable_rtcp = enable)
    }

    pub fn ignore_pt(&self) -> bool {
        self.inner.state.lock().settings.ignore_pt
    }

    pub fn set_ignore_pt(&self, ignore: bool) {
        self.update_live(|s| s.ignore_pt = ignore);
    }

    pub fn ignore_ssrc(&self) -> bool {
        self.inner.state.lock().settings.ignore_ssrc
    }

    pub fn set_ignore_ssrc(&self, ignore: bool) -> Result<()> {
        self.update_idle("ignore-ssrc", |s| s.ignore_ssrc = ignore)
    }

    pub fn multicast_iface(&self) -> Option<String> {
        self.inner.state.lock().settings.multicast_iface.clone()
    }

    pub fn set_multicast_iface(&self, iface: Option<&str>) {
        let iface = iface.filter(|i| !i.is_empty()).map(str::to_string);
        self.update_live(|s| s.multicast_iface = iface);
    }

    pub fn buffer_size(&self) -> u32 {
        self.inner.state.lock().settings.buffer_size
    }

    pub fn set_buffer_size(&self, size: u32) {
        self.update_live(|s| s.buffer_size = size);
    }

    pub fn encrypt(&self) -> bool {
        self.inner.state.lock().settings.encrypt
    }

    pub fn set_encrypt(&self, encrypt: bool) -> Result<()> {
        self.update_idle("encrypt", |s| s.encrypt = encrypt)
    }

    pub fn key_derivation_rate(&self) -> u32 {
        self.inner.state.lock().settings.key_derivation_rate
    }

    pub fn set_key_derivation_rate(&self, rate: u32) {
        if !rate.is_power_of_two() && rate != 0 {
            warn!("Key derivation rate {} is not a power of 2", rate);
        }
        self.update_live(|s| s.key_derivation_rate = rate);
    }

    pub fn force_ipv4(&self) -> bool {
        self.inner.state.lock().settings.force_ipv4
    }

    pub fn set_force_ipv4(&self, force: bool) {
        self.update_live(|s| s.force_ipv4 = force);
    }
}

impl UriHandler for RtpSource {
    fn uri_type() -> UriType {
        UriType::Src
    }

    fn protocols() -> &'static [&'static str] {
        &[RTP_SCHEME]
    }

    fn uri(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .settings
            .uri
            .as_ref()
            .map(|u| u.as_str().to_string())
    }

    fn set_uri(&self, uri: &str) -> Result<()> {
        let parsed = RtpUri::parse(uri)?;

        let mut state = self.inner.state.lock();
        if state.phase != Phase::Idle {
            return Err(Error::invalid_state("uri"));
        }

        let mut staged = state.settings.clone();
        staged.apply_query(parsed.query())?;
        staged.uri = Some(parsed);
        state.settings = staged;

        debug!("URI set to {}", uri);
        Ok(())
    }
}

impl Drop for RtpSource {
    fn drop(&mut self) {
        if let Some(task) = self.inner.router_task.lock().take() {
            task.abort();
        }
    }
}
