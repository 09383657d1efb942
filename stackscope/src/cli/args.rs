//! CLI argument definitions

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "stackscope",
    about = "Decode stackscope binary profiles",
    after_help = "\
EXAMPLES:
    stackscope profile.mojo                     Collapsed stacks (flamegraph input)
    stackscope profile.mojo --format json       Aggregate summary as JSON
    stackscope profile.mojo --format dump       Raw event listing"
)]
pub struct Args {
    /// Profile file produced by the sampler
    pub input: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Fold)]
    pub format: Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Collapsed stacks, one line per unique stack
    Fold,
    /// JSON summary of threads and hot stacks
    Json,
    /// Raw decoded event listing
    Dump,
}
