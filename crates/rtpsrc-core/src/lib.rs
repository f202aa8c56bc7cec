//! # rtpsrc-core: RTP receive session orchestration
//!
//! This library receives an RTP media stream (optionally paired with its RTCP
//! control stream), resolves the stream's payload type to concrete caps and
//! exposes the resulting elementary streams through dynamically created output
//! ports.
//!
//! The heavy lifting (UDP sockets, jitter buffering, SSRC bookkeeping, RTCP
//! generation, decryption) is done by collaborators reached through the traits
//! in [`elements`]. This crate decides *when* those collaborators are created,
//! *how* they are wired together and *what* happens to every output branch the
//! session manager creates.
//!
//! ## Components
//!
//! - [`registry`]: ordered static/dynamic payload-type tables
//! - [`resolver`]: payload type (+ optional forced encoding name) to [`Caps`]
//! - [`multicast`]: address classification driving socket setup
//! - [`graph`]: conditional processing-chain assembly
//! - [`router`]: discard / expose / rewrite-and-expose decisions per branch
//! - [`source`]: the [`RtpSource`] orchestrator tying it all together
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rtpsrc_core::{RtpSource, UriHandler};
//! use rtpsrc_core::recording::RecordingBackend;
//!
//! # async fn run() -> rtpsrc_core::Result<()> {
//! let source = RtpSource::new(Arc::new(RecordingBackend::new()));
//! source.set_uri("rtp://239.1.1.1:5004?encoding-name=H264&latency=300")?;
//! let mut events = source.take_event_receiver().expect("receiver taken once");
//!
//! source.start().await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! source.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod caps;
pub mod elements;
pub mod error;
pub mod events;
pub mod graph;
pub mod logging;
pub mod multicast;
pub mod recording;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod settings;
pub mod source;
pub mod uri;

pub use caps::{Caps, CapsValue};
pub use elements::{Backend, Branch, PadDirection, PadHandle, StageError, StageKind};
pub use error::{Error, Result};
pub use events::SourceEvent;
pub use multicast::is_multicast;
pub use registry::{MediaKind, PayloadTypeEntry};
pub use resolver::{resolve, Resolution};
pub use router::ExposedPort;
pub use settings::Settings;
pub use source::{Diagnostics, RtpSource};
pub use uri::{RtpUri, UriHandler, UriType};

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
