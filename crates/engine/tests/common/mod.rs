//! Common test utilities and fixtures.

pub mod engine;
pub mod fetcher;
pub mod fixtures;

#[allow(unused_imports)]
pub use engine::*;
#[allow(unused_imports)]
pub use fetcher::*;
#[allow(unused_imports)]
pub use fixtures::*;
