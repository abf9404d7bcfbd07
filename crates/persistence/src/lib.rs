pub mod error;
pub mod record;
pub mod idx;
pub mod snapshot;

pub use error::{PersistenceError, Result};
pub use record::{Record, FRAME_HEADER_SIZE};
