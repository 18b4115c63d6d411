//! Records, collaborator traits and error kinds shared across Haven.

pub mod clock;
pub mod error;
pub mod memory;
pub mod model;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{Error, Result, StoreError};
pub use memory::InMemoryStore;
pub use store::{AdminStore, ControlStore, GeofenceStore, StoreResult};
