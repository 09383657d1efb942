//! Command-line interface of the decoder binary.

pub mod args;

pub use args::{Args, Format};
