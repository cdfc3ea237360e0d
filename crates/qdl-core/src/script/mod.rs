//! Flashing scripts: `rawprogram*.xml`, `patch*.xml` and provisioning XML.
//!
//! Scripts are parsed into an ordered list of [`FlashOperation`]s before any
//! device I/O, so a bad script or a missing image never touches the device.

pub mod op;
pub mod parser;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use op::{FlashOperation, ImageSource, OpKind};
pub use parser::Interpreter;

use crate::geometry::StorageGeometry;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: malformed XML: {message}", .path.display())]
    Xml { path: PathBuf, message: String },
    #[error("{}: <{element}> is missing attribute {attr}", .path.display())]
    MissingAttribute {
        path: PathBuf,
        element: String,
        attr: &'static str,
    },
    #[error("{}: <{element}> {attr}={value:?} is not a valid value", .path.display())]
    BadValue {
        path: PathBuf,
        element: String,
        attr: &'static str,
        value: String,
    },
    #[error("{}: image {name} not found", .path.display())]
    MissingImage { path: PathBuf, name: String },
    #[error("{}: <{element}> {reason}", .path.display())]
    Misaligned {
        path: PathBuf,
        element: String,
        reason: String,
    },
    #[error("{}: image for {label:?} is {size} bytes, partition holds {capacity}", .path.display())]
    ImageTooLarge {
        path: PathBuf,
        label: String,
        size: u64,
        capacity: u64,
    },
}

/// Parse `files` in order into one operation list.
pub fn parse<P: AsRef<Path>>(
    files: &[P],
    include_dir: Option<&Path>,
    geometry: StorageGeometry,
    allow_missing: bool,
) -> Result<Vec<FlashOperation>, ScriptError> {
    Interpreter::new(geometry)
        .include_dir(include_dir.map(Path::to_path_buf))
        .allow_missing(allow_missing)
        .parse_files(files)
}
