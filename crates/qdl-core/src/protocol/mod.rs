//! Protocol module - Sahara and Firehose over a transport channel.

pub mod constants;
pub mod firehose;
pub mod sahara;
pub mod xml;

pub use constants::*;
pub use firehose::{
    ConfigureOptions, Firehose, FirehoseError, FirehoseState, NakClass, PatchCommand,
    PowerAction, RawProgram, SectorRange, StartSector,
};
pub use sahara::{Handoff, Sahara, SaharaError, SaharaImages, SaharaState};
pub use xml::XmlElement;
