//! QDL-Core: Qualcomm Emergency Download (EDL) engine in Rust.
//!
//! This crate uploads a Firehose programmer to a device in EDL mode over
//! Sahara, then flashes or provisions its storage by executing XML scripts
//! through the Firehose protocol.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: Byte channel to one device (nusb, mock)
//! - **Registry**: Device enumeration and exclusive channel leases
//! - **Protocol**: Sahara handshake, Firehose command engine
//! - **Script**: XML script interpreter producing flash operations
//! - **Pump**: Sequential, chunked execution with progress
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator and status mapping
//!
//! # Example
//!
//! ```no_run
//! use qdl_core::{Session, SessionConfig, StorageType};
//!
//! let config = SessionConfig {
//!     storage: StorageType::Ufs,
//!     programmer: Some("prog_firehose_ddr.elf".into()),
//!     scripts: vec!["rawprogram0.xml".into(), "patch0.xml".into()],
//!     ..Default::default()
//! };
//!
//! let mut session = Session::new(config);
//! session.run().expect("flash failed");
//! ```

pub mod broadcast;
pub mod error;
pub mod events;
pub mod geometry;
pub mod protocol;
pub mod pump;
pub mod registry;
pub mod script;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastObserver, ProgressSink, set_progress_sink};
pub use error::{RunError, Status};
pub use events::{
    LogLevel, Phase, ProgressEvent, QdlEvent, QdlObserver, RecordingObserver,
    TracingObserver,
};
pub use geometry::{StorageGeometry, StorageType};
pub use pump::{PumpSummary, TransferPump};
pub use registry::{Device, DeviceBackend, DeviceRegistry};
pub use script::{FlashOperation, ScriptError};
pub use session::{Mode, Session, SessionConfig};
pub use transport::{Channel, MockBackend, MockChannel, NusbBackend, TransportError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
