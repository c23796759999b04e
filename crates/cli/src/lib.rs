//! dirsync-cli: Client-side session driver

pub mod driver;

pub use driver::{Driver, SyncOutcome, SyncStats};
