//! Common test infrastructure
//!
//! Fake backends and build fixtures for the end-to-end pipeline tests.
//! Tests should only import from this module, not from internal submodules.

mod fakes;
mod fixtures;

#[allow(unused_imports)]
pub use fakes::{EngineCall, FakeBackends, FakeEngine, FakeStorage};
#[allow(unused_imports)]
pub use fixtures::*;
