//! Status channel bridge between the supervisor, the loader and its workers.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Command, Reply)
//! - **codec**: newline-delimited JSON framing
//! - **channel**: the inherited descriptor, read and written synchronously

pub mod channel;
pub mod codec;
pub mod protocol;
