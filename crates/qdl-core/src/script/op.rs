//! Parsed script directives.

use std::fmt;
use std::path::PathBuf;

use crate::protocol::{PatchCommand, PowerAction, SectorRange, XmlElement};

/// Where a program directive's data comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Image found on the host.
    Resolved(PathBuf),
    /// Image missing at parse time; skip instead of failing.
    Absent { name: String },
}

/// What a directive does on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Program {
        range: SectorRange,
        image: ImageSource,
        /// Byte offset into the image where data starts.
        file_offset: u64,
        /// Bytes sent, padded to whole sectors.
        size: u64,
    },
    Erase {
        range: SectorRange,
    },
    Patch(PatchCommand),
    Read {
        range: SectorRange,
        output: PathBuf,
    },
    SetBootable {
        lun: u32,
    },
    /// Storage provisioning element forwarded verbatim.
    Provision(XmlElement),
    Power(PowerAction),
}

impl OpKind {
    pub fn directive(&self) -> &'static str {
        match self {
            OpKind::Program { .. } => "program",
            OpKind::Erase { .. } => "erase",
            OpKind::Patch(_) => "patch",
            OpKind::Read { .. } => "read",
            OpKind::SetBootable { .. } => "setbootablestoragedrive",
            OpKind::Provision(_) => "provision",
            OpKind::Power(_) => "power",
        }
    }
}

/// One directive, validated against the storage geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashOperation {
    pub kind: OpKind,
    pub label: String,
    /// Script the directive came from.
    pub script: PathBuf,
    /// Parsed with `allow_missing`: a missing image or a device "not found"
    /// skips this directive instead of failing the run.
    pub skippable: bool,
}

impl FlashOperation {
    /// Bytes of image data this operation moves to the device.
    pub fn size(&self) -> u64 {
        match &self.kind {
            OpKind::Program { size, .. } => *size,
            _ => 0,
        }
    }

    /// Image was missing at parse time.
    pub fn is_absent(&self) -> bool {
        matches!(
            self.kind,
            OpKind::Program {
                image: ImageSource::Absent { .. },
                ..
            }
        )
    }
}

impl fmt::Display for FlashOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_empty() {
            write!(f, "{}", self.kind.directive())
        } else {
            write!(f, "{} {}", self.kind.directive(), self.label)
        }
    }
}
