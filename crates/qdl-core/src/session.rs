//! QDL Session - one flash or provision run against one device.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::error::{RunError, Status};
use crate::events::{Phase, QdlEvent, QdlObserver, TracingObserver};
use crate::geometry::StorageType;
use crate::protocol::{ConfigureOptions, Firehose, PowerAction, Sahara, SaharaImages};
use crate::pump::{PumpSummary, TransferPump};
use crate::registry::DeviceRegistry;
use crate::script::{self, OpKind};

/// What a run does with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Flash,
    Provision,
}

impl Mode {
    /// Map a C enum value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Mode::Flash),
            1 => Some(Mode::Provision),
            _ => None,
        }
    }

    /// Status reported for protocol failures in this mode.
    pub fn failure_status(self) -> Status {
        match self {
            Mode::Flash => Status::FlashFailed,
            Mode::Provision => Status::ProvisionFailed,
        }
    }
}

/// Configuration for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub mode: Mode,
    /// Device serial. `None` or empty selects the first device found.
    pub serial: Option<String>,
    pub storage: StorageType,
    /// Firehose programmer uploaded over Sahara.
    pub programmer: Option<PathBuf>,
    /// Scripts, executed in order.
    pub scripts: Vec<PathBuf>,
    /// Skip directives whose image is missing instead of failing.
    pub allow_missing: bool,
    /// Searched for images before each script's own directory.
    pub include_dir: Option<PathBuf>,
    /// Transfer chunk size in bytes. `None` or 0 uses the default.
    pub out_chunk_size: Option<usize>,
    /// Reset the device once every operation succeeded.
    pub reset_on_success: bool,
    pub sahara_timeout_ms: u64,
    pub firehose_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Flash,
            serial: None,
            storage: StorageType::Unknown,
            programmer: None,
            scripts: Vec::new(),
            allow_missing: false,
            include_dir: None,
            out_chunk_size: None,
            reset_on_success: true,
            sahara_timeout_ms: 5_000,
            firehose_timeout_ms: 30_000,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Orchestrates one run: scripts, device, Sahara, Firehose, transfer.
pub struct Session<O: QdlObserver> {
    config: SessionConfig,
    registry: DeviceRegistry,
    observer: Arc<O>,
    phase: Phase,
}

impl Session<TracingObserver> {
    /// Create a session over USB with the default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, DeviceRegistry::usb(), Arc::new(TracingObserver))
    }
}

impl<O: QdlObserver> Session<O> {
    /// Create a session with a custom registry and observer.
    pub fn with_observer(
        config: SessionConfig,
        registry: DeviceRegistry,
        observer: Arc<O>,
    ) -> Self {
        Self {
            config,
            registry,
            observer,
            phase: Phase::Parsing,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, to: Phase) {
        let from = self.phase;
        self.phase = to;
        info!(from = %from, to = %to, "Phase");
        self.observer.on_event(&QdlEvent::PhaseChanged { from, to });
    }

    /// Run the session to completion. Any failure aborts it.
    #[instrument(skip(self), fields(mode = ?self.config.mode, storage = %self.config.storage))]
    pub fn run(&mut self) -> Result<PumpSummary, RunError> {
        let result = self.execute();
        match &result {
            Ok(_) => {
                self.enter(Phase::Complete);
                self.observer.on_event(&QdlEvent::Complete);
            }
            Err(e) => {
                error!(error = %e, "Session failed");
                self.enter(Phase::Error);
            }
        }
        result
    }

    /// Run and map the outcome to a status code.
    pub fn run_status(&mut self) -> Status {
        match self.run() {
            Ok(_) => Status::Ok,
            Err(e) => e.status(self.config.mode),
        }
    }

    fn execute(&mut self) -> Result<PumpSummary, RunError> {
        let observer = Arc::clone(&self.observer);
        let config = self.config.clone();

        // Host side first: nothing below touches the device.
        let path = config
            .programmer
            .as_deref()
            .ok_or_else(|| RunError::InvalidArgument("no programmer image given".into()))?;
        let programmer = std::fs::read(path).map_err(|source| RunError::Programmer {
            path: path.to_path_buf(),
            source,
        })?;
        if programmer.is_empty() {
            return Err(RunError::InvalidArgument(format!(
                "programmer {} is empty",
                path.display()
            )));
        }
        info!(path = %path.display(), bytes = programmer.len(), "Programmer loaded");

        let geometry = config.storage.geometry();
        let ops = script::parse(
            &config.scripts,
            config.include_dir.as_deref(),
            geometry,
            config.allow_missing,
        )?;
        info!(operations = ops.len(), scripts = config.scripts.len(), "Scripts parsed");
        let script_resets = ops.iter().any(|op| matches!(op.kind, OpKind::Power(_)));

        self.enter(Phase::Connecting);
        let device = self.registry.resolve(config.serial.as_deref())?;
        let channel = self.registry.open(&device)?;
        info!(serial = %device.serial, product = %device.product, "Device opened");
        observer.on_event(&QdlEvent::DeviceOpened {
            serial: device.serial.clone(),
            product: device.product.clone(),
        });

        self.enter(Phase::Sahara);
        let handoff = Sahara::new(
            channel,
            observer.as_ref(),
            Duration::from_millis(config.sahara_timeout_ms),
        )
        .run(&SaharaImages::programmer(programmer))?;

        self.enter(Phase::Configure);
        let mut firehose = Firehose::new(
            handoff,
            observer.as_ref(),
            Duration::from_millis(config.firehose_timeout_ms),
        );
        firehose.configure(&ConfigureOptions::new(geometry.memory_name))?;

        self.enter(Phase::Transfer);
        let summary = TransferPump::new(observer.as_ref(), config.out_chunk_size)
            .run(&mut firehose, ops)?;

        if config.reset_on_success && !script_resets {
            self.enter(Phase::Reset);
            firehose.power(PowerAction::Reset)?;
        }
        Ok(summary)
    }
}
