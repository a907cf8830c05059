#![doc = " Parent-side thread driver and worker-side dispatcher."]

mod driver;
pub(crate) mod ident;
pub mod worker;

// Re-export key types for easier usage
pub use driver::{SpawnOptions, Thread};
