//! Collaborators that call back into the source from inside a backend call
//!
//! A real session manager may answer a payload type query on the same thread
//! that is linking or configuring one of its neighbours. None of that may
//! block on the source's own state.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::timeout;

use rtpsrc_core::elements::{
    Backend, CapsSetter, Decryptor, LinkError, PadHandle, PayloadFilter, SessionManager, Stage,
    StageError, StageKind, UdpSink, UdpSource,
};
use rtpsrc_core::recording::RecordingBackend;
use rtpsrc_core::{Caps, RtpSource, SourceEvent, UriHandler};

/// Wraps the recording backend and queries the pt-map whenever a caps setter
/// is linked or a payload filter is reconfigured
#[derive(Clone)]
struct EagerBackend {
    inner: RecordingBackend,
    answers: Arc<Mutex<Vec<Option<Caps>>>>,
}

impl EagerBackend {
    fn new() -> Self {
        Self {
            inner: RecordingBackend::new(),
            answers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn query(&self) {
        if let Some(answer) = self.inner.request_pt_map(0, 96) {
            self.answers.lock().push(answer);
        }
    }

    fn answers(&self) -> Vec<Option<Caps>> {
        self.answers.lock().clone()
    }
}

struct EagerFilter {
    inner: Arc<dyn PayloadFilter>,
    backend: EagerBackend,
}

impl Stage for EagerFilter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn activate(&self) -> Result<(), StageError> {
        self.inner.activate()
    }

    fn deactivate(&self) {
        self.inner.deactivate()
    }
}

impl PayloadFilter for EagerFilter {
    fn set_selected_pt(&self, pt: Option<u8>) {
        self.backend.query();
        self.inner.set_selected_pt(pt);
    }

    fn sink_pad(&self) -> PadHandle {
        self.inner.sink_pad()
    }

    fn src_pad(&self) -> PadHandle {
        self.inner.src_pad()
    }
}

impl Backend for EagerBackend {
    fn create_udp_source(&self, kind: StageKind) -> Result<Arc<dyn UdpSource>, StageError> {
        self.inner.create_udp_source(kind)
    }

    fn create_udp_sink(&self) -> Result<Arc<dyn UdpSink>, StageError> {
        self.inner.create_udp_sink()
    }

    fn create_decryptor(&self) -> Result<Arc<dyn Decryptor>, StageError> {
        self.inner.create_decryptor()
    }

    fn create_payload_filter(&self) -> Result<Arc<dyn PayloadFilter>, StageError> {
        let inner = self.inner.create_payload_filter()?;
        Ok(Arc::new(EagerFilter {
            inner,
            backend: self.clone(),
        }))
    }

    fn create_caps_setter(&self) -> Result<Arc<dyn CapsSetter>, StageError> {
        self.inner.create_caps_setter()
    }

    fn create_session_manager(&self) -> Result<Arc<dyn SessionManager>, StageError> {
        self.inner.create_session_manager()
    }

    fn link(&self, src: &PadHandle, sink: &PadHandle) -> Result<(), LinkError> {
        if sink.element.starts_with("caps-setter") {
            self.query();
        }
        self.inner.link(src, sink)
    }

    fn release(&self, name: &str) {
        self.inner.release(name)
    }
}

fn create_source(uri: &str) -> (Arc<RtpSource>, EagerBackend) {
    let backend = EagerBackend::new();
    let source = RtpSource::new(Arc::new(backend.clone()));
    source.set_uri(uri).expect("valid uri");
    (Arc::new(source), backend)
}

/// Run `f` on its own thread; false if it did not finish in time
fn finishes<F: FnOnce() + Send + 'static>(f: F) -> bool {
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    thread::spawn(move || {
        f();
        let _ = done_tx.send(());
    });
    done_rx.recv_timeout(Duration::from_secs(3)).is_ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pt_map_query_while_inserting_caps_setter() {
    let (source, backend) = create_source("rtp://10.1.1.1:5004?ignore-pt=true");
    let mut events = source.take_event_receiver().unwrap();
    source.start().await.unwrap();
    assert_eq!(events.recv().await, Some(SourceEvent::Started));

    backend.inner.emit_media_branch(0x1111, Caps::rtp().with("payload", 101));

    let event = timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(SourceEvent::EncodingNameDefaulted { .. }) => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("branch routed without blocking");
    assert_eq!(event.and_then(|e| e.port_name().map(str::to_string)).as_deref(), Some("src0"));

    let answers = backend.answers();
    assert_eq!(answers.len(), 1);
    assert!(answers[0].is_some());

    source.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_synchronous_branch_handling_with_reentrant_link() {
    let (source, backend) = create_source("rtp://10.1.1.1:5004?ignore-pt=true&ignore-ssrc=true");
    source.start().await.unwrap();

    let routed = {
        let source = source.clone();
        finishes(move || {
            for ssrc in 1..=3u32 {
                source.handle_branch(rtpsrc_core::Branch::src(
                    PadHandle::new("session-manager0", format!("recv_rtp_src_0_{}_101", ssrc)),
                    Caps::rtp().with("payload", 101),
                ));
            }
        })
    };
    assert!(routed, "handle_branch blocked on a pt-map query");

    let ports = source.ports();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].target, PadHandle::new("caps-setter2", "src"));
    assert_eq!(backend.answers().len(), 3);

    source.stop().await;
    assert!(backend.inner.active_stages().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pt_map_query_while_forwarding_live_settings() {
    let (source, backend) = create_source("rtp://10.1.1.1:5004?select-pt=96");
    source.start().await.unwrap();
    let before = backend.answers().len();

    let forwarded = {
        let source = source.clone();
        finishes(move || source.set_select_pt(97).unwrap())
    };
    assert!(forwarded, "set_select_pt blocked on a pt-map query");
    assert_eq!(backend.answers().len(), before + 1);
    assert_eq!(source.select_pt(), 97);

    source.stop().await;
}
