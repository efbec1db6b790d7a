//! # Storage driver contract
//!
//! The uniform, path-addressed filesystem contract that registry storage
//! backends implement, along with the shared error vocabulary and the
//! helpers every backend needs (a generic walk and a concurrency limiter).

mod driver;
mod error;
mod regulator;
mod walk;

pub use driver::FileInfo;
pub use driver::FileReader;
pub use driver::FileWriter;
pub use driver::StorageDriver;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
pub use regulator::{Regulator, RegulatorGuard};
pub use walk::{walk_fallback, WalkControl, WalkFn};
