//! Script interpreter: XML directives to validated operations.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use super::ScriptError;
use super::op::{FlashOperation, ImageSource, OpKind};
use crate::geometry::StorageGeometry;
use crate::protocol::xml;
use crate::protocol::{PatchCommand, PowerAction, SectorRange, StartSector, XmlElement};

fn parse_int(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Parses scripts against one storage geometry.
#[derive(Debug, Clone)]
pub struct Interpreter {
    include_dir: Option<PathBuf>,
    geometry: StorageGeometry,
    allow_missing: bool,
}

impl Interpreter {
    pub fn new(geometry: StorageGeometry) -> Self {
        Self {
            include_dir: None,
            geometry,
            allow_missing: false,
        }
    }

    /// Directory searched first for images.
    pub fn include_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.include_dir = dir;
        self
    }

    pub fn allow_missing(mut self, allow: bool) -> Self {
        self.allow_missing = allow;
        self
    }

    #[instrument(skip_all, fields(files = files.len()))]
    pub fn parse_files<P: AsRef<Path>>(
        &self,
        files: &[P],
    ) -> Result<Vec<FlashOperation>, ScriptError> {
        let mut ops = Vec::new();
        for file in files {
            ops.extend(self.parse_file(file.as_ref())?);
        }
        Ok(ops)
    }

    pub fn parse_file(&self, path: &Path) -> Result<Vec<FlashOperation>, ScriptError> {
        let text = fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse_str(&text, path)
    }

    /// Parse script text as if read from `path`.
    pub fn parse_str(&self, text: &str, path: &Path) -> Result<Vec<FlashOperation>, ScriptError> {
        let elements = xml::parse_elements(text).map_err(|e| ScriptError::Xml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut ops = Vec::new();
        for element in &elements {
            let directive = Directive {
                interp: self,
                element,
                path,
            };
            if let Some(kind) = directive.interpret()? {
                ops.push(FlashOperation {
                    kind,
                    label: element.get("label").unwrap_or_default().to_string(),
                    script: path.to_path_buf(),
                    skippable: self.allow_missing,
                });
            }
        }
        debug!(script = %path.display(), operations = ops.len(), "Script parsed");
        Ok(ops)
    }

    fn script_dir(path: &Path) -> &Path {
        path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Include dir, then the script's directory, then the name itself if absolute.
    fn resolve_image(&self, name: &str, script: &Path) -> Option<PathBuf> {
        let name_path = Path::new(name);
        self.include_dir
            .iter()
            .map(|dir| dir.join(name))
            .chain(std::iter::once(Self::script_dir(script).join(name)))
            .chain(name_path.is_absolute().then(|| name_path.to_path_buf()))
            .find(|candidate| candidate.is_file())
    }

    fn output_path(&self, name: &str, script: &Path) -> PathBuf {
        let name_path = Path::new(name);
        if name_path.is_absolute() {
            return name_path.to_path_buf();
        }
        match &self.include_dir {
            Some(dir) => dir.join(name),
            None => Self::script_dir(script).join(name),
        }
    }
}

/// One element being interpreted, with error context.
struct Directive<'a> {
    interp: &'a Interpreter,
    element: &'a XmlElement,
    path: &'a Path,
}

impl Directive<'_> {
    fn interpret(&self) -> Result<Option<OpKind>, ScriptError> {
        match self.element.name.as_str() {
            "program" => self.program(),
            "erase" => {
                let sector_size = self.sector_size()?;
                Ok(Some(OpKind::Erase {
                    range: self.range(sector_size)?,
                }))
            }
            "patch" => self.patch(),
            "read" => {
                let sector_size = self.sector_size()?;
                let name = self.required("filename")?;
                Ok(Some(OpKind::Read {
                    range: self.range(sector_size)?,
                    output: self.interp.output_path(name, self.path),
                }))
            }
            "setbootablestoragedrive" => Ok(Some(OpKind::SetBootable {
                lun: self.u32_attr("value")?,
            })),
            "ufs" => Ok(Some(OpKind::Provision(self.element.clone()))),
            "power" => {
                let action = match self.required("value")?.trim().to_ascii_lowercase().as_str() {
                    "reset" => PowerAction::Reset,
                    "off" => PowerAction::Off,
                    _ => return Err(self.bad_value("value")),
                };
                Ok(Some(OpKind::Power(action)))
            }
            other => {
                warn!(element = other, script = %self.path.display(), "Skipping unknown directive");
                Ok(None)
            }
        }
    }

    fn program(&self) -> Result<Option<OpKind>, ScriptError> {
        let sector_size = self.sector_size()?;
        let mut range = self.range(sector_size)?;
        let label = self.element.get("label").unwrap_or_default();
        let name = self.element.get("filename").unwrap_or_default().trim();
        if name.is_empty() {
            debug!(label, "Program without filename, nothing to write");
            return Ok(None);
        }
        let file_offset = self.int_or("file_sector_offset", 0)? * sector_size as u64;

        let Some(image) = self.interp.resolve_image(name, self.path) else {
            if !self.interp.allow_missing {
                return Err(ScriptError::MissingImage {
                    path: self.path.to_path_buf(),
                    name: name.to_string(),
                });
            }
            warn!(image = name, label, "Image missing, directive will be skipped");
            return Ok(Some(OpKind::Program {
                size: range.byte_len(),
                range,
                image: ImageSource::Absent {
                    name: name.to_string(),
                },
                file_offset,
            }));
        };

        let len = fs::metadata(&image)
            .map_err(|source| ScriptError::Io {
                path: image.clone(),
                source,
            })?
            .len();
        if file_offset > len {
            return Err(self.misaligned(format!(
                "file_sector_offset points past the end of {} ({len} bytes)",
                image.display()
            )));
        }
        let size = StorageGeometry::round_up(len - file_offset, sector_size);
        if size == 0 {
            warn!(image = %image.display(), label, "Empty image, nothing to write");
            return Ok(None);
        }
        let sectors = size / sector_size as u64;
        if range.num_sectors != 0 && sectors > range.num_sectors {
            return Err(ScriptError::ImageTooLarge {
                path: self.path.to_path_buf(),
                label: label.to_string(),
                size,
                capacity: range.byte_len(),
            });
        }
        range.num_sectors = sectors;

        Ok(Some(OpKind::Program {
            range,
            image: ImageSource::Resolved(image),
            file_offset,
            size,
        }))
    }

    fn patch(&self) -> Result<Option<OpKind>, ScriptError> {
        let target = self.element.get("filename").unwrap_or_default();
        if target != "DISK" {
            debug!(target, "Host file patch, not sent to the device");
            return Ok(None);
        }
        let sector_size = self.sector_size()?;
        let byte_offset = self.int("byte_offset")?;
        let size_in_bytes = self.int("size_in_bytes")?;
        if byte_offset.saturating_add(size_in_bytes) > sector_size as u64 {
            return Err(self.misaligned(format!(
                "{size_in_bytes} bytes at offset {byte_offset} do not fit one {sector_size}-byte sector"
            )));
        }
        Ok(Some(OpKind::Patch(PatchCommand {
            sector_size,
            lun: self.u32_or("physical_partition_number", 0)?,
            start: StartSector::parse(self.required("start_sector")?),
            byte_offset,
            size_in_bytes,
            value: self.required("value")?.to_string(),
            what: self.element.get("what").unwrap_or_default().to_string(),
        })))
    }

    /// Declared sector size checked against the geometry.
    fn sector_size(&self) -> Result<usize, ScriptError> {
        let geometry = &self.interp.geometry;
        let Some(raw) = self.element.get("SECTOR_SIZE_IN_BYTES") else {
            return geometry
                .sector_size
                .ok_or_else(|| self.missing("SECTOR_SIZE_IN_BYTES"));
        };
        let declared = parse_int(raw)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| self.bad_value("SECTOR_SIZE_IN_BYTES"))?;
        if !geometry.accepts_sector_size(declared) {
            return Err(self.misaligned(format!(
                "sector size {declared} does not match {} storage",
                geometry.storage
            )));
        }
        Ok(declared)
    }

    fn range(&self, sector_size: usize) -> Result<SectorRange, ScriptError> {
        Ok(SectorRange {
            sector_size,
            num_sectors: self.int_or("num_partition_sectors", 0)?,
            lun: self.u32_or("physical_partition_number", 0)?,
            start: StartSector::parse(self.required("start_sector")?),
        })
    }

    fn required(&self, attr: &'static str) -> Result<&str, ScriptError> {
        self.element.get(attr).ok_or_else(|| self.missing(attr))
    }

    fn int(&self, attr: &'static str) -> Result<u64, ScriptError> {
        parse_int(self.required(attr)?).ok_or_else(|| self.bad_value(attr))
    }

    /// Missing or empty attributes take `default`.
    fn int_or(&self, attr: &'static str, default: u64) -> Result<u64, ScriptError> {
        match self.element.get(attr).map(str::trim) {
            None | Some("") => Ok(default),
            Some(raw) => parse_int(raw).ok_or_else(|| self.bad_value(attr)),
        }
    }

    fn u32_attr(&self, attr: &'static str) -> Result<u32, ScriptError> {
        u32::try_from(self.int(attr)?).map_err(|_| self.bad_value(attr))
    }

    fn u32_or(&self, attr: &'static str, default: u32) -> Result<u32, ScriptError> {
        u32::try_from(self.int_or(attr, default.into())?).map_err(|_| self.bad_value(attr))
    }

    fn missing(&self, attr: &'static str) -> ScriptError {
        ScriptError::MissingAttribute {
            path: self.path.to_path_buf(),
            element: self.element.name.clone(),
            attr,
        }
    }

    fn bad_value(&self, attr: &'static str) -> ScriptError {
        ScriptError::BadValue {
            path: self.path.to_path_buf(),
            element: self.element.name.clone(),
            attr,
            value: self.element.get(attr).unwrap_or_default().to_string(),
        }
    }

    fn misaligned(&self, reason: String) -> ScriptError {
        ScriptError::Misaligned {
            path: self.path.to_path_buf(),
            element: self.element.name.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::StorageType;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn interp(storage: StorageType) -> Interpreter {
        Interpreter::new(storage.geometry())
    }

    #[test]
    fn test_program_resolves_image_next_to_script() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "boot.img", &[1u8; 4097]);
        let script = write(
            dir.path(),
            "rawprogram0.xml",
            br#"<?xml version="1.0" ?>
            <data>
              <program SECTOR_SIZE_IN_BYTES="512" filename="boot.img" label="boot_a"
                       num_partition_sectors="16" physical_partition_number="0" start_sector="34"/>
            </data>"#,
        );

        let ops = interp(StorageType::Emmc).parse_file(&script).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].label, "boot_a");
        assert_eq!(ops[0].size(), 4608);
        assert!(!ops[0].skippable);
        match &ops[0].kind {
            OpKind::Program { range, image, .. } => {
                assert_eq!(range.num_sectors, 9);
                assert_eq!(range.start, StartSector::Absolute(34));
                assert_eq!(image, &ImageSource::Resolved(dir.path().join("boot.img")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_include_dir_wins_over_script_dir() {
        let scripts = TempDir::new().unwrap();
        let include = TempDir::new().unwrap();
        write(scripts.path(), "a.img", &[0u8; 512]);
        write(include.path(), "a.img", &[0u8; 1024]);
        let script = write(
            scripts.path(),
            "rp.xml",
            br#"<data><program SECTOR_SIZE_IN_BYTES="512" filename="a.img" label="a" num_partition_sectors="0" start_sector="0"/></data>"#,
        );

        let ops = interp(StorageType::Emmc)
            .include_dir(Some(include.path().to_path_buf()))
            .parse_file(&script)
            .unwrap();
        assert_eq!(ops[0].size(), 1024);
    }

    #[test]
    fn test_missing_image() {
        let dir = TempDir::new().unwrap();
        let xml = br#"<data><program SECTOR_SIZE_IN_BYTES="4096" filename="system.img" label="system" num_partition_sectors="8" start_sector="0"/></data>"#;
        let script = write(dir.path(), "rp.xml", xml);

        let err = interp(StorageType::Ufs).parse_file(&script).unwrap_err();
        assert!(matches!(err, ScriptError::MissingImage { ref name, .. } if name == "system.img"));

        let ops = interp(StorageType::Ufs)
            .allow_missing(true)
            .parse_file(&script)
            .unwrap();
        assert!(ops[0].is_absent());
        assert!(ops[0].skippable);
        assert_eq!(ops[0].size(), 8 * 4096);
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let xml = r#"<data><erase SECTOR_SIZE_IN_BYTES="512" num_partition_sectors="8" start_sector="0"/></data>"#;
        let path = Path::new("erase.xml");
        assert!(interp(StorageType::Emmc).parse_str(xml, path).is_ok());
        assert!(interp(StorageType::Unknown).parse_str(xml, path).is_ok());
        for storage in [StorageType::Ufs, StorageType::Nand, StorageType::Spinor] {
            assert!(matches!(
                interp(storage).parse_str(xml, path),
                Err(ScriptError::Misaligned { .. })
            ));
        }

        let odd = r#"<data><erase SECTOR_SIZE_IN_BYTES="1000" num_partition_sectors="8" start_sector="0"/></data>"#;
        assert!(matches!(
            interp(StorageType::Unknown).parse_str(odd, path),
            Err(ScriptError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_unknown_storage_needs_declared_sector_size() {
        let xml = r#"<data><erase num_partition_sectors="8" start_sector="0"/></data>"#;
        let path = Path::new("erase.xml");
        assert!(interp(StorageType::Nvme).parse_str(xml, path).is_ok());
        assert!(matches!(
            interp(StorageType::Unknown).parse_str(xml, path),
            Err(ScriptError::MissingAttribute { attr: "SECTOR_SIZE_IN_BYTES", .. })
        ));
    }

    #[test]
    fn test_image_too_large() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "big.img", &[0u8; 4096 * 3]);
        let script = write(
            dir.path(),
            "rp.xml",
            br#"<data><program SECTOR_SIZE_IN_BYTES="4096" filename="big.img" label="big" num_partition_sectors="2" start_sector="6"/></data>"#,
        );
        assert!(matches!(
            interp(StorageType::Ufs).parse_file(&script),
            Err(ScriptError::ImageTooLarge { size: 12288, capacity: 8192, .. })
        ));
    }

    #[test]
    fn test_file_sector_offset_reduces_size() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "gpt.bin", &[0u8; 512 * 40]);
        let script = write(
            dir.path(),
            "rp.xml",
            br#"<data><program SECTOR_SIZE_IN_BYTES="512" file_sector_offset="6" filename="gpt.bin" label="backup" num_partition_sectors="34" start_sector="NUM_DISK_SECTORS-34."/></data>"#,
        );
        let ops = interp(StorageType::Emmc).parse_file(&script).unwrap();
        match &ops[0].kind {
            OpKind::Program {
                range, file_offset, size, ..
            } => {
                assert_eq!(*file_offset, 3072);
                assert_eq!(*size, 512 * 34);
                assert_eq!(range.start, StartSector::Expr("NUM_DISK_SECTORS-34.".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_patches_and_skips() {
        let xml = r#"<?xml version="1.0" ?>
            <data>
              <program SECTOR_SIZE_IN_BYTES="512" filename="" label="userdata" num_partition_sectors="0" start_sector="0"/>
              <patch SECTOR_SIZE_IN_BYTES="512" byte_offset="16" filename="gpt_main0.bin" physical_partition_number="0" size_in_bytes="4" start_sector="1" value="0" what="host"/>
              <patch SECTOR_SIZE_IN_BYTES="512" byte_offset="16" filename="DISK" physical_partition_number="0" size_in_bytes="4" start_sector="1" value="CRC32(1,92)" what="Update CRC"/>
              <frobnicate/>
              <setbootablestoragedrive value="1"/>
              <power value="reset"/>
            </data>"#;
        let ops = interp(StorageType::Emmc)
            .parse_str(xml, Path::new("patch0.xml"))
            .unwrap();
        let directives: Vec<&str> = ops.iter().map(|o| o.kind.directive()).collect();
        assert_eq!(directives, vec!["patch", "setbootablestoragedrive", "power"]);
        match &ops[0].kind {
            OpKind::Patch(p) => {
                assert_eq!(p.value, "CRC32(1,92)");
                assert_eq!(p.byte_offset, 16);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ops[1].kind, OpKind::SetBootable { lun: 1 });
    }

    #[test]
    fn test_patch_crossing_sector_rejected() {
        let xml = r#"<data><patch SECTOR_SIZE_IN_BYTES="512" byte_offset="510" filename="DISK" size_in_bytes="4" start_sector="1" value="0"/></data>"#;
        assert!(matches!(
            interp(StorageType::Emmc).parse_str(xml, Path::new("p.xml")),
            Err(ScriptError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_order_preserved_across_files() {
        let dir = TempDir::new().unwrap();
        let first = write(
            dir.path(),
            "a.xml",
            br#"<data><erase SECTOR_SIZE_IN_BYTES="4096" num_partition_sectors="1" start_sector="0" label="one"/><erase SECTOR_SIZE_IN_BYTES="4096" num_partition_sectors="1" start_sector="0" label="one"/></data>"#,
        );
        let second = write(
            dir.path(),
            "b.xml",
            br#"<data><ufs bNumberLU="3" bBootEnable="1" label="two"/></data>"#,
        );

        let ops = super::super::parse(
            &[first.clone(), second.clone()],
            None,
            StorageType::Ufs.geometry(),
            false,
        )
        .unwrap();
        let labels: Vec<&str> = ops.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, vec!["one", "one", "two"]);
        assert_eq!(ops[0].script, first);
        assert_eq!(ops[2].script, second);
        assert!(matches!(&ops[2].kind, OpKind::Provision(e) if e.get("bNumberLU") == Some("3")));
    }

    #[test]
    fn test_malformed_inputs_carry_path() {
        let path = Path::new("broken.xml");
        let err = interp(StorageType::Emmc)
            .parse_str("<data><erase start_sector=\"0\"", path)
            .unwrap_err();
        assert!(err.to_string().starts_with("broken.xml"));

        let xml = r#"<data><erase num_partition_sectors="lots" start_sector="0"/></data>"#;
        let err = interp(StorageType::Emmc).parse_str(xml, path).unwrap_err();
        assert!(matches!(err, ScriptError::BadValue { attr: "num_partition_sectors", .. }));

        let err = interp(StorageType::Emmc)
            .parse_str(r#"<data><power value="explode"/></data>"#, path)
            .unwrap_err();
        assert!(matches!(err, ScriptError::BadValue { attr: "value", .. }));

        assert!(matches!(
            interp(StorageType::Emmc).parse_file(Path::new("/nonexistent/rawprogram0.xml")),
            Err(ScriptError::Io { .. })
        ));
    }
}
