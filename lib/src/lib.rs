#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod error;
pub mod exec;
pub mod host_key;
pub mod run;
pub mod sink;
pub mod transfer;
pub mod transport;

pub use config::ConfigInputs;
pub use error::RunError;
pub use error::Stage;
pub use exec::ExecutionOutcome;
pub use host_key::HostKeyPolicy;
pub use run::RunState;
pub use run::Runner;
pub use sink::OutputSink;
pub use sink::StdioSink;
