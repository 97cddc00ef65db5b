//! Shared test utilities for slotmail integration tests.
//!
//! - `TestHarness` wires a full engine over an in-memory database
//! - `FakeTransport` and `FakeRefresher` stand in for SMTP and the OAuth token endpoint

pub mod fakes;
pub mod harness;

pub use fakes::{Delivery, FakeRefresher, FakeTransport};
pub use harness::{fixture_slot, message, TestHarness, ACCOUNT};
