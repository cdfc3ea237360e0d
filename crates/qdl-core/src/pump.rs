//! Transfer pump: streams parsed operations through a configured Firehose engine.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::events::{LogLevel, ProgressEvent, QdlEvent, QdlObserver};
use crate::geometry::StorageGeometry;
use crate::protocol::{Firehose, FirehoseError, FIREHOSE_DEFAULT_PAYLOAD, SectorRange};
use crate::script::{FlashOperation, ImageSource, OpKind};
use crate::transport::Channel;

#[derive(Error, Debug)]
pub enum PumpError {
    #[error("{op}: {source}")]
    Firehose {
        op: String,
        #[source]
        source: FirehoseError,
    },
    #[error("{}: {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a run through the pump did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpSummary {
    pub completed: usize,
    pub skipped: usize,
    /// Image bytes written to the device.
    pub bytes: u64,
}

enum Outcome {
    Done(u64),
    Skipped,
}

/// Sequential executor for a list of operations.
pub struct TransferPump<'o, O: QdlObserver> {
    observer: &'o O,
    out_chunk_size: Option<usize>,
}

impl<'o, O: QdlObserver> TransferPump<'o, O> {
    /// `out_chunk_size` of `None` or zero uses the default payload size.
    pub fn new(observer: &'o O, out_chunk_size: Option<usize>) -> Self {
        Self {
            observer,
            out_chunk_size: out_chunk_size.filter(|&n| n > 0),
        }
    }

    /// Chunk size for a transfer: requested size capped by the negotiated
    /// payload, rounded down to whole sectors, never below one sector.
    pub fn effective_chunk(&self, negotiated: usize, sector_size: usize) -> usize {
        let requested = self.out_chunk_size.unwrap_or(FIREHOSE_DEFAULT_PAYLOAD);
        StorageGeometry::align_chunk(requested.min(negotiated), sector_size)
    }

    fn emit(&self, event: ProgressEvent) {
        self.observer.on_event(&QdlEvent::Progress(event));
    }

    fn log(&self, level: LogLevel, message: String) {
        self.observer.on_event(&QdlEvent::Log { level, message });
    }

    /// Run `ops` in order. The first non-skippable failure aborts the run.
    #[instrument(skip_all, fields(operations = ops.len()))]
    pub fn run<C: Channel, F: QdlObserver>(
        &self,
        firehose: &mut Firehose<'_, C, F>,
        ops: Vec<FlashOperation>,
    ) -> Result<PumpSummary, PumpError> {
        let mut summary = PumpSummary::default();
        for op in ops {
            match self.dispatch(firehose, &op) {
                Ok(Outcome::Done(bytes)) => {
                    summary.completed += 1;
                    summary.bytes += bytes;
                }
                Ok(Outcome::Skipped) => summary.skipped += 1,
                Err(PumpError::Firehose { source, .. })
                    if op.skippable && source.is_not_found() =>
                {
                    self.log(LogLevel::Warn, format!("{op}: target not found on device, skipped"));
                    self.emit(ProgressEvent::advisory(format!("skip {op}: not found on device")));
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            bytes = summary.bytes,
            "All operations done"
        );
        Ok(summary)
    }

    fn dispatch<C: Channel, F: QdlObserver>(
        &self,
        firehose: &mut Firehose<'_, C, F>,
        op: &FlashOperation,
    ) -> Result<Outcome, PumpError> {
        let device = |source: FirehoseError| PumpError::Firehose {
            op: op.to_string(),
            source,
        };

        match &op.kind {
            OpKind::Program {
                image: ImageSource::Absent { name },
                ..
            } => {
                self.log(LogLevel::Warn, format!("{op}: image {name} missing, skipped"));
                self.emit(ProgressEvent::advisory(format!("skip {name}: image not found")));
                return Ok(Outcome::Skipped);
            }
            OpKind::Program {
                range,
                image: ImageSource::Resolved(path),
                file_offset,
                size,
            } => {
                return self
                    .program(firehose, op, range, path, *file_offset, *size)
                    .map(Outcome::Done);
            }
            _ => {}
        }

        self.emit(ProgressEvent::advisory(op.to_string()));
        match &op.kind {
            OpKind::Erase { range } => firehose.erase(range).map_err(device)?,
            OpKind::Patch(patch) => firehose.patch(patch).map_err(device)?,
            OpKind::Read { range, output } => {
                let file = File::create(output).map_err(|source| PumpError::Image {
                    path: output.clone(),
                    source,
                })?;
                let mut sink = BufWriter::new(file);
                let n = firehose.read(range, &mut sink).map_err(device)?;
                debug!(bytes = n, output = %output.display(), "Read back");
            }
            OpKind::SetBootable { lun } => firehose.set_bootable_drive(*lun).map_err(device)?,
            OpKind::Provision(element) => firehose.provision(element).map_err(device)?,
            OpKind::Power(action) => firehose.power(*action).map_err(device)?,
            OpKind::Program { .. } => {}
        }
        Ok(Outcome::Done(0))
    }

    fn program<C: Channel, F: QdlObserver>(
        &self,
        firehose: &mut Firehose<'_, C, F>,
        op: &FlashOperation,
        range: &SectorRange,
        path: &Path,
        file_offset: u64,
        size: u64,
    ) -> Result<u64, PumpError> {
        let host = |source: io::Error| PumpError::Image {
            path: path.to_path_buf(),
            source,
        };
        let device = |source: FirehoseError| PumpError::Firehose {
            op: op.to_string(),
            source,
        };

        let mut file = File::open(path).map_err(host)?;
        file.seek(SeekFrom::Start(file_offset)).map_err(host)?;

        let chunk = self.effective_chunk(firehose.max_payload(), range.sector_size);
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let task = if op.label.is_empty() {
            filename.clone()
        } else {
            op.label.clone()
        };
        debug!(task = %task, size, chunk, "Programming");

        let mut raw = firehose
            .program(range, &filename, &op.label)
            .map_err(device)?;
        let mut buf = vec![0u8; chunk];
        let mut sent = 0u64;
        while sent < size {
            let want = (size - sent).min(chunk as u64) as usize;
            let filled = fill(&mut file, &mut buf[..want]).map_err(host)?;
            let last = sent + want as u64 == size;
            // Only the tail of the final sector may be missing from the file.
            if filled < want && (!last || want - filled >= range.sector_size) {
                return Err(host(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "image ended {} bytes into a {size} byte transfer",
                        sent + filled as u64
                    ),
                )));
            }
            buf[filled..want].fill(0);
            raw.write_chunk(&buf[..want]).map_err(device)?;
            sent += want as u64;
            if !last {
                self.emit(ProgressEvent::new(task.clone(), sent, size));
            }
        }
        raw.finish().map_err(device)?;
        // Reported once the device acknowledged the whole image.
        self.emit(ProgressEvent::new(task, sent, size));
        Ok(sent)
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::events::RecordingObserver;
    use crate::geometry::StorageType;
    use crate::protocol::firehose::device::*;
    use crate::protocol::{ConfigureOptions, Handoff, StartSector};
    use crate::script::Interpreter;
    use crate::transport::MockChannel;

    const T: Duration = Duration::from_millis(10);

    fn configured<'a>(
        mock: &MockChannel,
        obs: &'a RecordingObserver,
        payload: usize,
    ) -> Firehose<'a, MockChannel, RecordingObserver> {
        let mut fh = Firehose::new(Handoff::assume_programmer_running(mock.clone()), obs, T);
        mock.queue_str(&configure_ack(payload));
        fh.configure(&ConfigureOptions::new("emmc")).unwrap();
        mock.clear_writes();
        fh
    }

    fn program_script(dir: &TempDir, images: &[(&str, usize)]) -> Vec<FlashOperation> {
        let mut xml = String::from("<data>");
        for (name, len) in images {
            fs::write(dir.path().join(name), vec![0x5Au8; *len]).unwrap();
            xml.push_str(&format!(
                r#"<program SECTOR_SIZE_IN_BYTES="512" filename="{name}" label="{name}" num_partition_sectors="0" physical_partition_number="0" start_sector="0"/>"#
            ));
        }
        xml.push_str("</data>");
        let script = dir.path().join("rawprogram0.xml");
        fs::write(&script, xml).unwrap();
        Interpreter::new(StorageType::Emmc.geometry())
            .parse_file(&script)
            .unwrap()
    }

    #[test]
    fn test_effective_chunk() {
        let obs = RecordingObserver::new();
        assert_eq!(TransferPump::new(&obs, None).effective_chunk(1 << 20, 512), 1 << 20);
        assert_eq!(TransferPump::new(&obs, Some(0)).effective_chunk(65536, 4096), 65536);
        assert_eq!(TransferPump::new(&obs, Some(1000)).effective_chunk(1 << 20, 512), 512);
        assert_eq!(TransferPump::new(&obs, Some(1024)).effective_chunk(1 << 20, 4096), 4096);
        assert_eq!(TransferPump::new(&obs, Some(1 << 20)).effective_chunk(6000, 512), 5632);
    }

    #[test]
    fn test_progress_per_chunk() {
        let dir = TempDir::new().unwrap();
        let ops = program_script(&dir, &[("a.img", 4096), ("b.img", 8192)]);
        let mock = MockChannel::new();
        let obs = RecordingObserver::new();
        let mut fh = configured(&mock, &obs, 1 << 20);
        for _ in 0..2 {
            mock.queue_str(&raw_ack());
            mock.queue_str(&ack());
        }

        let summary = TransferPump::new(&obs, Some(1024)).run(&mut fh, ops).unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.bytes, 12288);

        for (task, size, events) in [("a.img", 4096u64, 4usize), ("b.img", 8192, 8)] {
            let progress = obs.progress_for(task);
            assert_eq!(progress.len(), events);
            assert!(progress.windows(2).all(|w| w[0].value < w[1].value));
            assert!(progress.iter().all(|p| p.total == size && p.value <= size));
            assert_eq!(progress.iter().filter(|p| p.value == size).count(), 1);
            assert_eq!(progress.last().unwrap().value, size);
        }
        // program, 4 chunks, program, 8 chunks
        assert_eq!(mock.writes().len(), 14);
    }

    #[test]
    fn test_last_chunk_zero_padded() {
        let dir = TempDir::new().unwrap();
        let ops = program_script(&dir, &[("odd.img", 700)]);
        let mock = MockChannel::new();
        let obs = RecordingObserver::new();
        let mut fh = configured(&mock, &obs, 1 << 20);
        mock.queue_str(&raw_ack());
        mock.queue_str(&ack());

        TransferPump::new(&obs, None).run(&mut fh, ops).unwrap();
        let writes = mock.writes();
        assert_eq!(writes[1].len(), 1024);
        assert!(writes[1][..700].iter().all(|&b| b == 0x5A));
        assert!(writes[1][700..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_no_full_progress_when_closing_ack_fails() {
        let dir = TempDir::new().unwrap();
        let ops = program_script(&dir, &[("boot.img", 4096)]);
        let mock = MockChannel::new();
        let obs = RecordingObserver::new();
        let mut fh = configured(&mock, &obs, 1 << 20);
        mock.queue_str(&raw_ack());
        mock.queue_str(&log("ERROR: write failed"));
        mock.queue_str(&nak());

        let err = TransferPump::new(&obs, Some(1024)).run(&mut fh, ops).unwrap_err();
        assert!(matches!(err, PumpError::Firehose { .. }));

        let progress = obs.progress_for("boot.img");
        assert_eq!(progress.len(), 3);
        assert!(progress.iter().all(|p| p.value < 4096));
    }

    #[test]
    fn test_image_shrunk_after_parse_fails() {
        let dir = TempDir::new().unwrap();
        let ops = program_script(&dir, &[("system.img", 4096)]);
        fs::write(dir.path().join("system.img"), vec![0x5Au8; 1024]).unwrap();
        let mock = MockChannel::new();
        let obs = RecordingObserver::new();
        let mut fh = configured(&mock, &obs, 1 << 20);
        mock.queue_str(&raw_ack());

        let err = TransferPump::new(&obs, Some(1024)).run(&mut fh, ops).unwrap_err();
        match err {
            PumpError::Image { path, source } => {
                assert!(path.ends_with("system.img"));
                assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected error: {other}"),
        }
        // program command and the one chunk the file still had
        assert_eq!(mock.writes().len(), 2);
    }

    #[test]
    fn test_chunk_capped_by_negotiated_payload() {
        let dir = TempDir::new().unwrap();
        let ops = program_script(&dir, &[("a.img", 4096)]);
        let mock = MockChannel::new();
        let obs = RecordingObserver::new();
        let mut fh = configured(&mock, &obs, 2048);
        mock.queue_str(&raw_ack());
        mock.queue_str(&ack());

        TransferPump::new(&obs, None).run(&mut fh, ops).unwrap();
        assert_eq!(obs.progress_for("a.img").len(), 2);
    }

    fn absent_op(skippable: bool) -> FlashOperation {
        FlashOperation {
            kind: OpKind::Program {
                range: SectorRange {
                    sector_size: 512,
                    num_sectors: 8,
                    lun: 0,
                    start: StartSector::Absolute(0),
                },
                image: ImageSource::Absent {
                    name: "modem.img".into(),
                },
                file_offset: 0,
                size: 4096,
            },
            label: "modem".into(),
            script: "rawprogram0.xml".into(),
            skippable,
        }
    }

    #[test]
    fn test_absent_image_skipped_without_io() {
        let mock = MockChannel::new();
        let obs = RecordingObserver::new();
        let mut fh = configured(&mock, &obs, 1 << 20);

        let summary = TransferPump::new(&obs, None)
            .run(&mut fh, vec![absent_op(true)])
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(mock.writes().is_empty());
        let skips: Vec<ProgressEvent> = obs
            .progress()
            .into_iter()
            .filter(|p| p.is_advisory() && p.task.starts_with("skip"))
            .collect();
        assert_eq!(skips.len(), 1);
        let warned = obs.events().into_iter().any(|e| match e {
            QdlEvent::Log { level, message } => {
                level == LogLevel::Warn && message.contains("modem.img")
            }
            _ => false,
        });
        assert!(warned);
    }

    fn erase_op(label: &str, skippable: bool) -> FlashOperation {
        FlashOperation {
            kind: OpKind::Erase {
                range: SectorRange {
                    sector_size: 512,
                    num_sectors: 8,
                    lun: 4,
                    start: StartSector::Absolute(0),
                },
            },
            label: label.into(),
            script: "rawprogram4.xml".into(),
            skippable,
        }
    }

    #[test]
    fn test_not_found_nak_skipped_when_allowed() {
        let mock = MockChannel::new();
        let obs = RecordingObserver::new();
        let mut fh = configured(&mock, &obs, 1 << 20);
        mock.queue_str(&log("ERROR: LUN 4 not found"));
        mock.queue_str(&nak());
        mock.queue_str(&ack());

        let summary = TransferPump::new(&obs, None)
            .run(&mut fh, vec![erase_op("vendor", true), erase_op("misc", true)])
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.completed, 1);
    }

    #[test]
    fn test_not_found_nak_fatal_when_not_allowed() {
        let mock = MockChannel::new();
        let obs = RecordingObserver::new();
        let mut fh = configured(&mock, &obs, 1 << 20);
        mock.queue_str(&log("ERROR: LUN 4 not found"));
        mock.queue_str(&nak());

        let err = TransferPump::new(&obs, None)
            .run(&mut fh, vec![erase_op("vendor", false), erase_op("misc", false)])
            .unwrap_err();
        assert!(matches!(err, PumpError::Firehose { ref op, .. } if op == "erase vendor"));
        // Aborted before the second operation.
        assert_eq!(mock.written_xml().len(), 1);
    }

    #[test]
    fn test_rejected_nak_fatal_even_when_skippable() {
        let mock = MockChannel::new();
        let obs = RecordingObserver::new();
        let mut fh = configured(&mock, &obs, 1 << 20);
        mock.queue_str(&log("ERROR: write protected"));
        mock.queue_str(&nak());

        assert!(TransferPump::new(&obs, None)
            .run(&mut fh, vec![erase_op("vendor", true)])
            .is_err());
    }

    #[test]
    fn test_host_image_vanishes() {
        let dir = TempDir::new().unwrap();
        let ops = program_script(&dir, &[("gone.img", 1024)]);
        fs::remove_file(dir.path().join("gone.img")).unwrap();
        let mock = MockChannel::new();
        let obs = RecordingObserver::new();
        let mut fh = configured(&mock, &obs, 1 << 20);

        let err = TransferPump::new(&obs, None).run(&mut fh, ops).unwrap_err();
        assert!(matches!(err, PumpError::Image { .. }));
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn test_read_writes_output_file() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("gpt_backup.bin");
        let mock = MockChannel::new();
        let obs = RecordingObserver::new();
        let mut fh = configured(&mock, &obs, 1 << 20);
        let mut data = raw_ack().into_bytes();
        data.extend_from_slice(&[0xEEu8; 512]);
        mock.queue(data);
        mock.queue_str(&ack());

        let op = FlashOperation {
            kind: OpKind::Read {
                range: SectorRange {
                    sector_size: 512,
                    num_sectors: 1,
                    lun: 0,
                    start: StartSector::Absolute(1),
                },
                output: output.clone(),
            },
            label: String::new(),
            script: "read.xml".into(),
            skippable: false,
        };
        TransferPump::new(&obs, None).run(&mut fh, vec![op]).unwrap();
        assert_eq!(fs::read(&output).unwrap(), vec![0xEEu8; 512]);
    }
}
