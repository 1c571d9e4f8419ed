//! Repository traits for metadata operations.

pub mod files;
pub mod links;
pub mod packages;
pub mod queue;

pub use files::{FileRepo, StaleFilter};
pub use links::LinkRepo;
pub use packages::PackageRepo;
pub use queue::QueueRepo;
