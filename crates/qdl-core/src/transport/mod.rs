//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockBackend, MockChannel};
pub use self::nusb::{NusbBackend, NusbChannel};
pub use traits::{Channel, TransportError};
