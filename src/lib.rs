#![forbid(unsafe_code)]

pub mod backend;
pub mod benchmark;
pub mod cli;
pub mod closure;
pub mod config;
pub mod error;
pub mod logging;
pub mod mixer;
pub mod model;
pub mod pipeline;
pub mod postfit;
pub mod process;
pub mod qa;
pub mod report;
pub mod selection;
pub mod tuning;
pub mod wav;

pub use config::{AppConfig, BackendKind};
pub use error::{DubError, DubResult};
pub use pipeline::{CancellationToken, RunArtifacts, RunRequest, run_dub};
