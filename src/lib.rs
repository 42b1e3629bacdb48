#[macro_use]
extern crate tracing;

pub mod build_context;
pub mod config;
pub mod constants;
pub mod errors;
pub mod events;
pub mod fs;
pub mod ingress;
pub mod io_models;
pub mod job;
pub mod kube_client;
pub mod metrics_registry;
pub mod msg_publisher;
pub mod object_storage;
pub mod orchestrator;
pub mod service;
pub mod sidecar;
pub mod utilities;
