//! capsule: out-of-process worker supervision over a loopback control channel.

#[cfg(not(unix))]
compile_error!("capsule supervises workers through unix pipes and signals");

mod version;

pub mod admin;
pub mod bridge;
pub mod commander;
pub mod container;
pub mod hook;
pub mod http;
pub mod launch;
pub mod log_spy;
pub mod services;
pub mod supervisor;
pub mod worker;

pub use bridge::protocol::{Command, CommandToken, MessageCount, Response};
pub use commander::{Commander, ControlError};
pub use container::{Container, ContainerConfig, ContainerError, ContainerState};
pub use launch::{LaunchSpec, LaunchSpecBuilder};
pub use log_spy::{LogSpy, SpyBook, SpyingLayer};
pub use services::{ConfigService, ServiceError, TraceService};
pub use supervisor::{ProcessSupervisor, SupervisorError, WorkerProcess};
pub use version::{CAPSULE_VERSION, VersionInfo};
pub use worker::{WorkerConfig, WorkerExit, WorkerHandler, run_worker};
