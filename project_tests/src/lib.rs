//! # Project Tests
//!
//! Cross-crate integration tests of the forwarder. The shared mock servers
//! live in [`support`]; each `test_*.rs` file is its own test target.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod support;
