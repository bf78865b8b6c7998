// Library exports for integration testing
//
// The binary entrypoint lives in main.rs; everything it wires together is
// exposed here so tests can drive the controller with in-memory collaborators.

pub mod config;
pub mod controller;
pub mod discovery;
pub mod git;
pub mod metrics;
pub mod pipeline;
pub mod registrar;
pub mod retry;
pub mod secret;
pub mod signature;
pub mod webhook;

pub use config::{ControllerArgs, ControllerConfig};
pub use controller::{Collaborators, ControllerState, ReadinessCheck, StartupError, StartupPhase};
pub use pipeline::{PipelineRunResponse, PipelineTriggerRequest};
pub use secret::HmacSecret;
