#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **medley-runtime** – Assembly of the Medley pipeline.
//!
//! Reads configuration from the environment, wires the component graph
//! leaves-first, and hands the supervised tree to the `medley` binary.
//! This crate is also where capability ports meet their implementations:
//! the analytics store serves the detection, import-progress, and
//! failed-events ports; the producer WAL serves the event-sink port.

pub mod config;
pub mod pipeline;
pub mod ports;

pub use config::MedleyConfig;
pub use pipeline::{MessagingCore, Pipeline};
