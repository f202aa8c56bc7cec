//! Processing graph assembly
//!
//! The graph is built once per activation and never rewired while running:
//!
//! ```text
//! media source -> [decryptor] -> [payload filter] -> session manager (recv_rtp_sink)
//! control source ------------------------------------> session manager (recv_rtcp_sink)
//! session manager (send_rtcp_src) -------------------> control sink
//! ```
//!
//! The control sink sends from the control source's socket, so the control
//! source has to be active, and its socket known, before the sink is
//! configured and activated.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::caps::Caps;
use crate::elements::{
    Backend, BranchSender, Decryptor, PadHandle, PayloadFilter, PtMapFn, SessionManager,
    SessionManagerConfig, SocketHandle, SourceBinding, Stage, StageKind, UdpSink, UdpSinkConfig,
    UdpSource, UdpSourceConfig,
};
use crate::error::{Error, Result};
use crate::multicast::is_multicast;
use crate::settings::Settings;
use crate::uri::RtpUri;

/// Callbacks and initial caps wired into a new graph
pub struct GraphHooks {
    /// Installed on the session manager before activation
    pub pt_map: PtMapFn,
    /// Receives every branch created by the session manager
    pub branch_tx: BranchSender,
    /// Caps stamped on the media source
    pub source_caps: Option<Caps>,
}

/// How a UDP source for `port` on the URI host binds
pub fn source_binding(uri: &RtpUri, port: u16) -> SourceBinding {
    if is_multicast(uri.host()) {
        SourceBinding::Uri(uri.udp_uri(port))
    } else {
        SourceBinding::Port(port)
    }
}

/// Media source configuration
pub fn media_source_config(settings: &Settings, uri: &RtpUri, caps: Option<Caps>) -> UdpSourceConfig {
    UdpSourceConfig {
        binding: source_binding(uri, uri.port()),
        reuse: true,
        multicast_iface: settings.multicast_iface.clone(),
        buffer_size: settings.buffer_size,
        auto_multicast: true,
        close_socket: true,
        caps,
    }
}

/// Control source configuration; the socket outlives the stage for the sink
pub fn control_source_config(settings: &Settings, uri: &RtpUri, rtcp_port: u16) -> UdpSourceConfig {
    UdpSourceConfig {
        binding: source_binding(uri, rtcp_port),
        reuse: false,
        multicast_iface: settings.multicast_iface.clone(),
        buffer_size: settings.buffer_size,
        auto_multicast: true,
        close_socket: false,
        caps: None,
    }
}

/// Control sink configuration
///
/// The control source already joined any multicast group, so the sink does
/// not join again.
pub fn control_sink_config(
    settings: &Settings,
    uri: &RtpUri,
    rtcp_port: u16,
    socket: Option<SocketHandle>,
) -> UdpSinkConfig {
    UdpSinkConfig {
        host: uri.host().to_string(),
        port: rtcp_port,
        sync: false,
        is_async: false,
        force_ipv4: settings.force_ipv4,
        buffer_size: settings.buffer_size,
        multicast_iface: settings.multicast_iface.clone(),
        auto_multicast: false,
        close_socket: false,
        socket,
    }
}

/// Session manager configuration
pub fn session_manager_config(settings: &Settings) -> SessionManagerConfig {
    SessionManagerConfig {
        do_lost: true,
        autoremove: true,
        ignore_pt: settings.ignore_pt,
        latency_ms: settings.latency_ms,
    }
}

/// Control leg: inbound RTCP source and outbound RTCP sink sharing one socket
#[derive(Clone)]
struct ControlLeg {
    rtcp_port: u16,
    source: Arc<dyn UdpSource>,
    sink: Arc<dyn UdpSink>,
    socket: Option<SocketHandle>,
}

/// Shared handles to the stages of a graph
///
/// Cheap to clone, so live settings can be pushed without holding whatever
/// lock guards the owning [`SessionGraph`].
#[derive(Clone)]
pub struct GraphStages {
    uri: RtpUri,
    source_caps: Option<Caps>,
    media_source: Option<Arc<dyn UdpSource>>,
    decryptor: Option<Arc<dyn Decryptor>>,
    payload_filter: Option<Arc<dyn PayloadFilter>>,
    session_manager: Option<Arc<dyn SessionManager>>,
    control: Option<ControlLeg>,
}

impl GraphStages {
    /// Push live-changeable settings into the stages
    pub fn reconfigure(&self, settings: &Settings) {
        debug!("Forwarding settings to running stages");
        self.configure(settings);
    }

    fn configure(&self, settings: &Settings) {
        if let Some(source) = &self.media_source {
            source.configure(&media_source_config(settings, &self.uri, self.source_caps.clone()));
        }
        if let Some(decryptor) = &self.decryptor {
            decryptor.set_key_derivation_rate(settings.key_derivation_rate);
        }
        if let Some(filter) = &self.payload_filter {
            filter.set_selected_pt(settings.select_pt);
        }
        if let Some(session_manager) = &self.session_manager {
            session_manager.configure(&session_manager_config(settings));
        }
        if let Some(control) = &self.control {
            control
                .source
                .configure(&control_source_config(settings, &self.uri, control.rtcp_port));
            control.sink.configure(&control_sink_config(
                settings,
                &self.uri,
                control.rtcp_port,
                control.socket,
            ));
        }
    }
}

/// Activate one stage; failures of optional stages are only logged
fn activate_stage<S: Stage + ?Sized>(stage: &S, kind: StageKind) -> Result<()> {
    match stage.activate() {
        Ok(()) => Ok(()),
        Err(e) if kind.is_optional() => {
            error!("Could not activate {}: {}", kind, e);
            Ok(())
        }
        Err(e) => Err(Error::stage_activation(e)),
    }
}

/// A running processing graph
pub struct SessionGraph {
    backend: Arc<dyn Backend>,
    stages: GraphStages,
}

impl SessionGraph {
    /// Instantiate, wire and activate the graph for `settings`
    ///
    /// Fails if a required stage cannot be created, linked or activated, in
    /// which case everything created so far is torn down again.
    pub fn assemble(backend: Arc<dyn Backend>, settings: &Settings, hooks: GraphHooks) -> Result<Self> {
        let uri = settings.uri.clone().ok_or(Error::MissingUri)?;

        let rtcp_port = if settings.enable_rtcp {
            Some(uri.rtcp_port().ok_or_else(|| {
                Error::invalid_uri(uri.as_str(), "no room for the RTCP port above the RTP port")
            })?)
        } else {
            None
        };

        let mut graph = SessionGraph {
            backend,
            stages: GraphStages {
                uri,
                source_caps: hooks.source_caps.clone(),
                media_source: None,
                decryptor: None,
                payload_filter: None,
                session_manager: None,
                control: None,
            },
        };

        match graph.build(settings, rtcp_port, hooks) {
            Ok(()) => Ok(graph),
            Err(e) => {
                error!("Failed to assemble RTP session graph: {}", e);
                graph.teardown();
                Err(e)
            }
        }
    }

    fn build(&mut self, settings: &Settings, rtcp_port: Option<u16>, hooks: GraphHooks) -> Result<()> {
        let backend = self.backend.clone();

        debug!("Creating elements");
        let media_source = backend
            .create_udp_source(StageKind::MediaSource)
            .map_err(Error::stage_creation)?;
        self.stages.media_source = Some(media_source.clone());

        let session_manager = backend
            .create_session_manager()
            .map_err(Error::stage_creation)?;
        self.stages.session_manager = Some(session_manager.clone());

        if let Some(rtcp_port) = rtcp_port {
            let source = backend
                .create_udp_source(StageKind::ControlSource)
                .map_err(Error::stage_creation)?;
            let sink = match backend.create_udp_sink() {
                Ok(sink) => sink,
                Err(e) => {
                    backend.release(source.name());
                    return Err(Error::stage_creation(e));
                }
            };
            self.stages.control = Some(ControlLeg {
                rtcp_port,
                source,
                sink,
                socket: None,
            });
        }

        if settings.encrypt {
            let decryptor = backend.create_decryptor().map_err(Error::stage_creation)?;
            self.stages.decryptor = Some(decryptor);
        }

        if settings.select_pt.is_some() {
            let filter = backend
                .create_payload_filter()
                .map_err(Error::stage_creation)?;
            self.stages.payload_filter = Some(filter);
        }

        self.stages.configure(settings);

        // Media chain
        let mut upstream = media_source.src_pad();
        if let Some(decryptor) = &self.stages.decryptor {
            self.link(&upstream, &decryptor.sink_pad())?;
            upstream = decryptor.src_pad();
        }
        if let Some(filter) = &self.stages.payload_filter {
            self.link(&upstream, &filter.sink_pad())?;
            upstream = filter.src_pad();
        }
        self.link(&upstream, &session_manager.recv_rtp_sink())?;

        session_manager.set_pt_map(Some(hooks.pt_map));
        session_manager.set_branch_sender(Some(hooks.branch_tx));

        if let Some(control) = &self.stages.control {
            self.link(&control.source.src_pad(), &session_manager.recv_rtcp_sink())?;
            self.link(&session_manager.send_rtcp_src(), &control.sink.sink_pad())?;
        }

        activate_stage(media_source.as_ref(), StageKind::MediaSource)?;
        if let Some(decryptor) = &self.stages.decryptor {
            activate_stage(decryptor.as_ref(), StageKind::Decryptor)?;
        }
        if let Some(filter) = &self.stages.payload_filter {
            activate_stage(filter.as_ref(), StageKind::PayloadFilter)?;
        }
        activate_stage(session_manager.as_ref(), StageKind::SessionManager)?;

        self.activate_control_leg(settings)?;

        info!(
            "✅ RTP session graph running on {} (rtcp: {}, encrypt: {}, select-pt: {})",
            self.stages.uri,
            self.stages.control.is_some(),
            self.stages.decryptor.is_some(),
            settings.select_pt_value()
        );
        Ok(())
    }

    /// Source first so that its socket exists, then the sink on that socket
    fn activate_control_leg(&mut self, settings: &Settings) -> Result<()> {
        let uri = self.stages.uri.clone();
        let Some(control) = self.stages.control.as_mut() else {
            return Ok(());
        };

        activate_stage(control.source.as_ref(), StageKind::ControlSource)?;

        control.socket = control.source.used_socket();
        match control.socket {
            Some(socket) => debug!("RTCP source has {}", socket),
            None => warn!("No valid socket retrieved from RTCP source"),
        }

        control.sink.configure(&control_sink_config(
            settings,
            &uri,
            control.rtcp_port,
            control.socket,
        ));

        activate_stage(control.sink.as_ref(), StageKind::ControlSink)
    }

    fn link(&self, src: &PadHandle, sink: &PadHandle) -> Result<()> {
        debug!("Linking {} -> {}", src, sink);
        self.backend
            .link(src, sink)
            .map_err(|e| Error::link(src, sink, e.0))
    }

    /// Handles for pushing live settings
    pub fn stages(&self) -> GraphStages {
        self.stages.clone()
    }

    /// URI the graph was built for
    pub fn uri(&self) -> &RtpUri {
        &self.stages.uri
    }

    /// Socket shared by the control source and sink
    pub fn control_socket(&self) -> Option<SocketHandle> {
        self.stages.control.as_ref().and_then(|c| c.socket)
    }

    /// Whether the graph still holds any stage
    pub fn is_active(&self) -> bool {
        self.stages.media_source.is_some()
            || self.stages.session_manager.is_some()
            || self.stages.control.is_some()
    }

    /// Deactivate and release every stage, downstream first
    ///
    /// Safe to call any number of times.
    pub fn teardown(&mut self) {
        let stages = &mut self.stages;

        if let Some(session_manager) = stages.session_manager.take() {
            session_manager.set_branch_sender(None);
            session_manager.set_pt_map(None);
            session_manager.deactivate();
            self.backend.release(session_manager.name());
        }

        let control = stages.control.take();
        if let Some(control) = &control {
            control.sink.deactivate();
            self.backend.release(control.sink.name());
        }

        if let Some(filter) = stages.payload_filter.take() {
            filter.deactivate();
            self.backend.release(filter.name());
        }

        if let Some(decryptor) = stages.decryptor.take() {
            decryptor.deactivate();
            self.backend.release(decryptor.name());
        }

        if let Some(control) = control {
            control.source.deactivate();
            self.backend.release(control.source.name());
        }

        if let Some(source) = stages.media_source.take() {
            source.deactivate();
            self.backend.release(source.name());
        }
    }
}

impl Drop for SessionGraph {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingBackend;
    use tokio::sync::mpsc;

    fn hooks() -> GraphHooks {
        let (branch_tx, _branch_rx) = mpsc::unbounded_channel();
        GraphHooks {
            pt_map: Arc::new(|_, _| None),
            branch_tx,
            source_caps: None,
        }
    }

    fn settings_for(uri: &str) -> Settings {
        Settings {
            uri: Some(RtpUri::parse(uri).unwrap()),
            ..Settings::default()
        }
    }

    #[test]
    fn test_multicast_binding_uses_group_uri() {
        let settings = settings_for("rtp://239.1.1.1:5004");
        let uri = settings.uri.as_ref().unwrap();
        let config = media_source_config(&settings, uri, None);
        assert_eq!(config.binding, SourceBinding::Uri("udp://239.1.1.1:5004".into()));
        assert!(config.reuse);
        assert!(config.auto_multicast);

        let control = control_source_config(&settings, uri, 5005);
        assert_eq!(control.binding, SourceBinding::Uri("udp://239.1.1.1:5005".into()));
        assert!(!control.close_socket);
    }

    #[test]
    fn test_unicast_binding_uses_port() {
        let settings = settings_for("rtp://192.168.1.10:6000");
        let uri = settings.uri.as_ref().unwrap();
        assert_eq!(
            media_source_config(&settings, uri, None).binding,
            SourceBinding::Port(6000)
        );
        assert_eq!(
            control_source_config(&settings, uri, 6001).binding,
            SourceBinding::Port(6001)
        );
    }

    #[test]
    fn test_control_sink_config() {
        let mut settings = settings_for("rtp://239.1.1.1:5004");
        settings.force_ipv4 = true;
        settings.buffer_size = 65536;
        let uri = settings.uri.clone().unwrap();

        let config = control_sink_config(&settings, &uri, 5005, Some(SocketHandle(7)));
        assert_eq!(config.host, "239.1.1.1");
        assert_eq!(config.port, 5005);
        assert!(!config.sync);
        assert!(!config.is_async);
        assert!(!config.auto_multicast);
        assert!(!config.close_socket);
        assert!(config.force_ipv4);
        assert_eq!(config.buffer_size, 65536);
        assert_eq!(config.socket, Some(SocketHandle(7)));
    }

    #[test]
    fn test_session_manager_config() {
        let mut settings = Settings::default();
        settings.ignore_pt = true;
        settings.latency_ms = 80;
        let config = session_manager_config(&settings);
        assert!(config.do_lost);
        assert!(config.autoremove);
        assert!(config.ignore_pt);
        assert_eq!(config.latency_ms, 80);
    }

    #[test]
    fn test_assembled_graph_shares_control_socket() {
        let backend = RecordingBackend::new();
        let settings = settings_for("rtp://239.1.1.1:5004");

        let mut graph = SessionGraph::assemble(Arc::new(backend.clone()), &settings, hooks()).unwrap();
        assert!(graph.is_active());
        assert_eq!(graph.uri().port(), 5004);
        assert!(graph.control_socket().is_some());

        graph.teardown();
        assert!(!graph.is_active());
        assert_eq!(graph.control_socket(), None);
        assert!(backend.active_stages().is_empty());

        // Second teardown has nothing left to release
        let journal_len = backend.journal().len();
        graph.teardown();
        assert_eq!(backend.journal().len(), journal_len);
    }

    #[test]
    fn test_rtcp_port_overflow_is_rejected() {
        let backend = RecordingBackend::new();
        let settings = settings_for("rtp://10.0.0.1:65535");

        let err = SessionGraph::assemble(Arc::new(backend.clone()), &settings, hooks()).err();
        assert!(matches!(err, Some(Error::InvalidUri { .. })));
        assert!(backend.journal().is_empty());
    }
}
