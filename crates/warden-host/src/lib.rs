//! # Warden Host
//!
//! Control plane for a local llama-server worker process: supervision,
//! connectivity, resource monitoring and admission control.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  start   ┌──────────────────┐
//! │ ConnectionManager│ -------> │ ProcessSupervisor│ --> llama-server
//! │  (retry, probe)  │          │  (spawn, stop)   │
//! └──────────────────┘          └──────────────────┘
//!          │                             │
//!          └──────────┐      ┌───────────┘
//!                     v      v
//!                  ┌────────────┐
//!                  │ StatusBus  │ <-- ResourceMonitor <-- AdmissionController
//!                  └────────────┘       (sysinfo)          (RecordStore)
//! ```
//!
//! Every component is a single shared instance per process. [`Warden`]
//! builds one of each around a shared [`StatusBus`].
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use warden_host::{HttpHealthProbe, Warden, WardenConfig};
//!
//! let config = WardenConfig::builder()
//!     .exec_path("/usr/local/bin/llama-server")
//!     .model_path("/models/qwen.gguf")
//!     .build()?;
//! let warden = Warden::new(config, Arc::new(HttpHealthProbe::new()), store);
//!
//! warden.connect().await?;
//! ```

mod admission;
mod config;
mod connection;
mod error;
mod events;
mod eviction;
mod probe;
mod resources;
mod sampler;
mod supervisor;
mod warden;

pub use admission::{
    AdmissionController, AdmissionDenial, AdmissionRequest, AdmissionResult, MemoryOptimization,
    Priority,
};
pub use config::{
    EvictionConfig, HostConfig, ResourceThresholds, RetryConfig, WardenConfig,
    WardenConfigBuilder, DEFAULT_READY_MARKER,
};
pub use connection::{
    ConnectionManager, ConnectionState, ConnectionStatus, SupervisedWorker, WorkerHost,
};
pub use error::{SupervisorError, WardenError};
pub use events::{Component, StatusBus, StatusEvent};
pub use eviction::{evict_stale_records, EvictionCandidate, EvictionReport, RecordStore};
pub use probe::{HealthProbe, HttpHealthProbe, DEFAULT_PORT};
pub use resources::{
    CpuSnapshot, MemorySnapshot, ResourceLevel, ResourceMonitor, ResourceSnapshot, ResourceStatus,
    ESTIMATED_PROCESS_CPU_SHARE,
};
pub use sampler::{CpuReading, MemoryReading, SysinfoSampler, SystemSampler};
pub use supervisor::{HostProcessState, ProcessSupervisor, Ready};
pub use warden::Warden;
