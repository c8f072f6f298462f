pub mod broker;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod ffprobe;
pub mod job;
pub mod progress;
pub mod scan;
pub mod server;
pub mod task;

pub use broker::{progress_broker, BrokerEndpoint, ProgressHandle};
pub use config::ConverterConfig;
pub use controller::{Controller, ControllerReport, LifecycleState};
pub use engine::{FfmpegEngine, TranscodeEngine};
pub use error::ConvertError;
pub use job::{Job, JobOutcome, JobTable};
pub use progress::Progress;
pub use server::StatusServer;
