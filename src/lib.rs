//! Black-box conformance harness for the bcachefs userspace tool.
//!
//! [`fixture::Provisioner`] hands out disposable backing files,
//! [`runner::Runner`] runs the tool against them (optionally under
//! valgrind) and [`assertions`] checks the captured output.

pub mod assertions;
pub mod baseline;
pub mod cases;
pub mod config;
pub mod error;
pub mod fixture;
pub mod runner;
pub mod valgrind;

#[cfg(test)]
mod testutil;

pub use config::HarnessConfig;
pub use error::HarnessError;
pub use fixture::{Fixture, FixtureState, Provisioner};
pub use runner::{CommandResult, Invocation, Runner};
