//! Firehose: the XML command protocol spoken by the uploaded programmer.
//!
//! Every command is one `<data>` document. The device answers with zero or
//! more `<log>` documents followed by a `<response value="ACK|NAK">`.
//! Bulk payloads (`program`, `read`) switch the channel into raw mode
//! between the first ACK and a closing one.

use std::fmt;
use std::io::Write;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use super::constants::*;
use super::sahara::Handoff;
use super::xml::{self, XmlElement};
use crate::events::{ProgressEvent, QdlEvent, QdlObserver};
use crate::transport::{Channel, TransportError};

const DOCUMENT_END: &[u8] = b"</data>";

/// Why the device refused a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakClass {
    /// The device log says the target (partition, LUN, file) does not exist.
    NotFound,
    Rejected,
}

impl NakClass {
    fn classify(logs: &[String]) -> Self {
        if logs
            .iter()
            .any(|l| l.to_ascii_lowercase().contains("not found"))
        {
            NakClass::NotFound
        } else {
            NakClass::Rejected
        }
    }
}

fn log_suffix(log: &Option<String>) -> String {
    match log {
        Some(l) => format!(": {l}"),
        None => String::new(),
    }
}

#[derive(Error, Debug)]
pub enum FirehoseError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Device rejected configure{}", log_suffix(.log))]
    ConfigureRejected { log: Option<String> },
    #[error("Device NAKed <{command}>{}", log_suffix(.log))]
    Nak {
        command: String,
        class: NakClass,
        log: Option<String>,
    },
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Device did not enter raw mode for <{0}>")]
    RawModeRefused(String),
    #[error("Cannot send <{command}> while {state}")]
    InvalidState {
        state: FirehoseState,
        command: String,
    },
    #[error("Chunk of {len} bytes exceeds negotiated payload of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Chunk of {len} bytes is not a multiple of {sector_size}")]
    Misaligned { len: usize, sector_size: usize },
    #[error("Raw transfer expected {expected} bytes, got {actual}")]
    RawLength { expected: u64, actual: u64 },
    #[error("Read sink error: {0}")]
    Sink(#[from] std::io::Error),
}

impl FirehoseError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FirehoseError::Nak {
                class: NakClass::NotFound,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirehoseState {
    AwaitingConfigureAck,
    Ready,
    Executing,
    Failed,
}

impl fmt::Display for FirehoseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirehoseState::AwaitingConfigureAck => write!(f, "awaiting configure"),
            FirehoseState::Ready => write!(f, "ready"),
            FirehoseState::Executing => write!(f, "executing"),
            FirehoseState::Failed => write!(f, "failed"),
        }
    }
}

/// First sector of a range: a number, or an expression the device evaluates
/// (e.g. `NUM_DISK_SECTORS-33.`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartSector {
    Absolute(u64),
    Expr(String),
}

impl StartSector {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.parse::<u64>() {
            Ok(n) => StartSector::Absolute(n),
            Err(_) => StartSector::Expr(raw.to_string()),
        }
    }
}

impl fmt::Display for StartSector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartSector::Absolute(n) => write!(f, "{n}"),
            StartSector::Expr(e) => f.write_str(e),
        }
    }
}

/// Sectors on one physical partition (LUN).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorRange {
    pub sector_size: usize,
    pub num_sectors: u64,
    pub lun: u32,
    pub start: StartSector,
}

impl SectorRange {
    pub fn byte_len(&self) -> u64 {
        self.num_sectors * self.sector_size as u64
    }

    fn element(&self, name: &str) -> XmlElement {
        XmlElement::new(name)
            .attr("SECTOR_SIZE_IN_BYTES", self.sector_size)
            .attr("num_partition_sectors", self.num_sectors)
            .attr("physical_partition_number", self.lun)
            .attr("start_sector", &self.start)
    }
}

/// In-place edit of a few bytes of one sector on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchCommand {
    pub sector_size: usize,
    pub lun: u32,
    pub start: StartSector,
    pub byte_offset: u64,
    pub size_in_bytes: u64,
    pub value: String,
    pub what: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Reset,
    Off,
}

impl PowerAction {
    fn as_str(self) -> &'static str {
        match self {
            PowerAction::Reset => "reset",
            PowerAction::Off => "off",
        }
    }
}

/// Parameters of `<configure>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureOptions {
    pub memory_name: String,
    pub verbose: bool,
    /// Proposed `MaxPayloadSizeToTargetInBytes`.
    pub max_payload: usize,
    pub skip_storage_init: bool,
}

impl ConfigureOptions {
    pub fn new(memory_name: impl Into<String>) -> Self {
        Self {
            memory_name: memory_name.into(),
            verbose: false,
            max_payload: FIREHOSE_DEFAULT_PAYLOAD,
            skip_storage_init: false,
        }
    }

    fn element(&self, max_payload: usize) -> XmlElement {
        XmlElement::new("configure")
            .attr("MemoryName", &self.memory_name)
            .attr("Verbose", u8::from(self.verbose))
            .attr("AlwaysValidate", 0)
            .attr("MaxDigestTableSizeInBytes", 2048)
            .attr("MaxPayloadSizeToTargetInBytes", max_payload)
            .attr("ZLPAwareHost", 1)
            .attr("SkipStorageInit", u8::from(self.skip_storage_init))
            .attr("SkipWrite", 0)
    }
}

/// A `<response>` and the device logs that preceded it.
#[derive(Debug)]
struct Response {
    element: XmlElement,
    logs: Vec<String>,
}

impl Response {
    fn is_ack(&self) -> bool {
        self.element
            .get("value")
            .is_some_and(|v| v.eq_ignore_ascii_case("ACK"))
    }

    fn rawmode(&self) -> bool {
        self.element
            .get("rawmode")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    fn usize_attr(&self, key: &str) -> Option<usize> {
        self.element.get(key).and_then(|v| v.trim().parse().ok())
    }

    fn into_nak(self, command: &str) -> FirehoseError {
        FirehoseError::Nak {
            command: command.to_string(),
            class: NakClass::classify(&self.logs),
            log: self.logs.last().cloned(),
        }
    }
}

/// Firehose engine over a channel that completed the Sahara handoff.
pub struct Firehose<'a, C: Channel, O: QdlObserver> {
    channel: C,
    observer: &'a O,
    state: FirehoseState,
    timeout: Duration,
    pending: Vec<u8>,
    max_payload: usize,
}

impl<'a, C: Channel, O: QdlObserver> Firehose<'a, C, O> {
    pub fn new(handoff: Handoff<C>, observer: &'a O, timeout: Duration) -> Self {
        Self {
            channel: handoff.channel,
            observer,
            state: FirehoseState::AwaitingConfigureAck,
            timeout,
            pending: Vec::new(),
            max_payload: FIREHOSE_DEFAULT_PAYLOAD,
        }
    }

    pub fn state(&self) -> FirehoseState {
        self.state
    }

    /// Payload size granted by the device.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn goto(&mut self, next: FirehoseState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Firehose transition");
            self.state = next;
        }
    }

    /// Record a failure. A NotFound NAK keeps the engine usable.
    fn fail<T>(&mut self, e: FirehoseError) -> Result<T, FirehoseError> {
        if e.is_not_found() {
            self.goto(FirehoseState::Ready);
        } else {
            warn!(error = %e, "Firehose failed");
            self.goto(FirehoseState::Failed);
        }
        Err(e)
    }

    fn begin(&mut self, command: &str) -> Result<(), FirehoseError> {
        if self.state != FirehoseState::Ready {
            return Err(FirehoseError::InvalidState {
                state: self.state,
                command: command.to_string(),
            });
        }
        self.goto(FirehoseState::Executing);
        Ok(())
    }

    fn send(&mut self, element: &XmlElement) -> Result<(), FirehoseError> {
        let doc = element.to_document();
        debug!(command = %element.name, "Firehose >>");
        trace!("{doc}");
        self.channel.write_all(doc.as_bytes(), self.timeout)?;
        Ok(())
    }

    /// Next complete `<data>` document, reading more from the device as needed.
    fn next_document(&mut self) -> Result<String, FirehoseError> {
        loop {
            if let Some(end) = self
                .pending
                .windows(DOCUMENT_END.len())
                .position(|w| w == DOCUMENT_END)
                .map(|i| i + DOCUMENT_END.len())
            {
                let doc: Vec<u8> = self.pending.drain(..end).collect();
                return Ok(String::from_utf8_lossy(&doc).into_owned());
            }
            if self.pending.len() > FIREHOSE_MAX_PENDING {
                return Err(FirehoseError::Malformed(format!(
                    "{} bytes without a document terminator",
                    self.pending.len()
                )));
            }
            let bytes = self.channel.read(FIREHOSE_READ_SIZE, self.timeout)?;
            self.pending.extend_from_slice(&bytes);
        }
    }

    /// Read documents until a `<response>`, surfacing logs on the way.
    fn read_response(&mut self) -> Result<Response, FirehoseError> {
        let mut logs = Vec::new();
        loop {
            let doc = self.next_document()?;
            trace!("Firehose << {}", doc.trim());
            let elements = xml::parse_elements(&doc)
                .map_err(|e| FirehoseError::Malformed(format!("{e} in {}", doc.trim())))?;

            let mut response = None;
            for element in elements {
                match element.name.as_str() {
                    "log" => {
                        if let Some(msg) = element.get("value") {
                            self.device_log(msg);
                            logs.push(msg.to_string());
                        }
                    }
                    "response" => response = Some(element),
                    other => debug!(element = other, "Ignoring device element"),
                }
            }
            if let Some(element) = response {
                return Ok(Response { element, logs });
            }
        }
    }

    fn device_log(&self, msg: &str) {
        debug!(device = msg, "Device log");
        self.observer
            .on_event(&QdlEvent::Progress(ProgressEvent::advisory(msg)));
    }

    /// Send `element` and require an ACK.
    fn roundtrip(&mut self, element: &XmlElement) -> Result<Response, FirehoseError> {
        self.send(element)?;
        let response = self.read_response()?;
        if response.is_ack() {
            Ok(response)
        } else {
            Err(response.into_nak(&element.name))
        }
    }

    fn execute(&mut self, element: XmlElement) -> Result<(), FirehoseError> {
        self.begin(&element.name)?;
        match self.roundtrip(&element) {
            Ok(_) => {
                self.goto(FirehoseState::Ready);
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Negotiate storage and payload size. Returns the granted payload size.
    #[instrument(skip_all, name = "configure", fields(memory = %options.memory_name))]
    pub fn configure(&mut self, options: &ConfigureOptions) -> Result<usize, FirehoseError> {
        if self.state != FirehoseState::AwaitingConfigureAck {
            return Err(FirehoseError::InvalidState {
                state: self.state,
                command: "configure".into(),
            });
        }
        match self.negotiate(options) {
            Ok(payload) => {
                info!(payload, "Firehose configured");
                self.max_payload = payload;
                self.goto(FirehoseState::Ready);
                Ok(payload)
            }
            Err(e) => {
                warn!(error = %e, "Configure failed");
                self.goto(FirehoseState::Failed);
                Err(e)
            }
        }
    }

    fn negotiate(&mut self, options: &ConfigureOptions) -> Result<usize, FirehoseError> {
        let mut requested = options.max_payload;
        let mut retried = false;
        loop {
            self.send(&options.element(requested))?;
            let response = self.read_response()?;
            if response.is_ack() {
                let granted = response
                    .usize_attr("MaxPayloadSizeToTargetInBytes")
                    .filter(|&n| n > 0)
                    .unwrap_or(requested);
                return Ok(granted);
            }

            let supported = response
                .usize_attr("MaxPayloadSizeToTargetInBytesSupported")
                .filter(|&n| n > 0 && n < requested);
            match supported {
                Some(limit) if !retried => {
                    info!(requested, limit, "Retrying configure with device payload limit");
                    requested = limit;
                    retried = true;
                }
                _ => {
                    return Err(FirehoseError::ConfigureRejected {
                        log: response.logs.last().cloned(),
                    });
                }
            }
        }
    }

    /// Start writing `range`. The returned writer must be finished before
    /// any other command.
    #[instrument(skip(self), level = "debug")]
    pub fn program(
        &mut self,
        range: &SectorRange,
        filename: &str,
        label: &str,
    ) -> Result<RawProgram<'_, 'a, C, O>, FirehoseError> {
        let element = range
            .element("program")
            .attr("filename", filename)
            .attr("label", label);
        self.begin("program")?;
        let entered = self.roundtrip(&element).and_then(|r| {
            if r.rawmode() {
                Ok(())
            } else {
                Err(FirehoseError::RawModeRefused("program".into()))
            }
        });
        if let Err(e) = entered {
            return self.fail(e);
        }
        Ok(RawProgram {
            sector_size: range.sector_size,
            expected: range.byte_len(),
            written: 0,
            engine: self,
        })
    }

    /// Read `range` back from the device into `sink`. Returns bytes read.
    #[instrument(skip(self, sink), level = "debug")]
    pub fn read(
        &mut self,
        range: &SectorRange,
        sink: &mut dyn Write,
    ) -> Result<u64, FirehoseError> {
        self.begin("read")?;
        match self.read_raw(&range.element("read"), range.byte_len(), sink) {
            Ok(n) => {
                self.goto(FirehoseState::Ready);
                Ok(n)
            }
            Err(e) => self.fail(e),
        }
    }

    fn read_raw(
        &mut self,
        element: &XmlElement,
        expected: u64,
        sink: &mut dyn Write,
    ) -> Result<u64, FirehoseError> {
        let response = self.roundtrip(element)?;
        if !response.rawmode() {
            return Err(FirehoseError::RawModeRefused(element.name.clone()));
        }

        let mut received = 0u64;
        // Raw bytes may have arrived together with the ACK document.
        if !self.pending.is_empty() {
            let take = self.pending.len().min(usize::try_from(expected).unwrap_or(usize::MAX));
            let head: Vec<u8> = self.pending.drain(..take).collect();
            sink.write_all(&head)?;
            received += take as u64;
        }
        while received < expected {
            let remaining = expected - received;
            let want = usize::try_from(remaining)
                .unwrap_or(usize::MAX)
                .min(self.max_payload);
            let bytes = self.channel.read(want, self.timeout)?;
            let take = bytes.len().min(want);
            sink.write_all(&bytes[..take])?;
            self.pending.extend_from_slice(&bytes[take..]);
            received += take as u64;
        }
        sink.flush()?;

        let closing = self.read_response()?;
        if !closing.is_ack() {
            return Err(closing.into_nak(&element.name));
        }
        Ok(received)
    }

    pub fn erase(&mut self, range: &SectorRange) -> Result<(), FirehoseError> {
        self.execute(range.element("erase"))
    }

    pub fn patch(&mut self, patch: &PatchCommand) -> Result<(), FirehoseError> {
        self.execute(
            XmlElement::new("patch")
                .attr("SECTOR_SIZE_IN_BYTES", patch.sector_size)
                .attr("byte_offset", patch.byte_offset)
                .attr("filename", "DISK")
                .attr("physical_partition_number", patch.lun)
                .attr("size_in_bytes", patch.size_in_bytes)
                .attr("start_sector", &patch.start)
                .attr("value", &patch.value)
                .attr("what", &patch.what),
        )
    }

    pub fn set_bootable_drive(&mut self, lun: u32) -> Result<(), FirehoseError> {
        self.execute(XmlElement::new("setbootablestoragedrive").attr("value", lun))
    }

    pub fn power(&mut self, action: PowerAction) -> Result<(), FirehoseError> {
        self.execute(XmlElement::new("power").attr("value", action.as_str()))
    }

    /// Forward a storage provisioning element (e.g. `<ufs .../>`) as is.
    pub fn provision(&mut self, element: &XmlElement) -> Result<(), FirehoseError> {
        self.execute(element.clone())
    }
}

/// Raw-mode writer for one `<program>`.
pub struct RawProgram<'e, 'a, C: Channel, O: QdlObserver> {
    engine: &'e mut Firehose<'a, C, O>,
    sector_size: usize,
    expected: u64,
    written: u64,
}

impl<C: Channel, O: QdlObserver> RawProgram<'_, '_, C, O> {
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Send one sector-aligned chunk no larger than the negotiated payload.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), FirehoseError> {
        let len = data.len();
        let check = if len > self.engine.max_payload {
            Err(FirehoseError::PayloadTooLarge {
                len,
                max: self.engine.max_payload,
            })
        } else if len % self.sector_size != 0 {
            Err(FirehoseError::Misaligned {
                len,
                sector_size: self.sector_size,
            })
        } else if self.written + len as u64 > self.expected {
            Err(FirehoseError::RawLength {
                expected: self.expected,
                actual: self.written + len as u64,
            })
        } else {
            Ok(())
        };
        if let Err(e) = check {
            return self.engine.fail(e);
        }

        let timeout = self.engine.timeout;
        if let Err(e) = self.engine.channel.write_all(data, timeout) {
            return self.engine.fail(e.into());
        }
        self.written += len as u64;
        trace!(written = self.written, expected = self.expected, "Raw chunk sent");
        Ok(())
    }

    /// Wait for the closing ACK.
    pub fn finish(self) -> Result<(), FirehoseError> {
        if self.written != self.expected {
            return self.engine.fail(FirehoseError::RawLength {
                expected: self.expected,
                actual: self.written,
            });
        }
        match self.engine.read_response() {
            Ok(r) if r.is_ack() => {
                self.engine.goto(FirehoseState::Ready);
                Ok(())
            }
            Ok(r) => self.engine.fail(r.into_nak("program")),
            Err(e) => self.engine.fail(e),
        }
    }
}

/// Device-side document builders, shared with tests of higher layers.
#[cfg(test)]
pub(crate) mod device {
    pub fn ack() -> String {
        r#"<?xml version="1.0" encoding="UTF-8" ?><data><response value="ACK" /></data>"#.into()
    }

    pub fn raw_ack() -> String {
        r#"<?xml version="1.0" encoding="UTF-8" ?><data><response value="ACK" rawmode="true" /></data>"#.into()
    }

    pub fn nak() -> String {
        r#"<?xml version="1.0" encoding="UTF-8" ?><data><response value="NAK" /></data>"#.into()
    }

    pub fn log(msg: &str) -> String {
        format!(r#"<?xml version="1.0" encoding="UTF-8" ?><data><log value="{msg}" /></data>"#)
    }

    pub fn configure_ack(payload: usize) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8" ?><data><response value="ACK" MemoryName="emmc" MaxPayloadSizeToTargetInBytes="{payload}" MaxPayloadSizeFromTargetInBytes="4096" /></data>"#
        )
    }
}
