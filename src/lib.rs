//! Keeps producers and consumers of a partitioned, cursor-based log service
//! running through the loss of their primary stream.
//!
//! A [`FailoverController`] retries each remote call with exponential
//! backoff and, once the primary is considered failed, switches to a
//! secondary stream. Producers create the secondary on demand and record it
//! in a shared [`registry`]; consumers running in other processes discover it
//! there.

pub mod client;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod error;
pub mod export;
pub mod producer;
pub mod registry;
pub mod retry;
pub mod shutdown;
pub mod sleeper;
pub mod target;

pub use client::{AdminClient, ClientFactory, CreatedTarget, FetchBatch, Message, StreamClient};
pub use config::HaConfig;
pub use consumer::{ConsumerLoop, ConsumerReport, ConsumerSettings, PollOutcome};
pub use controller::{ControllerConfig, FailoverController, FailoverState, OpKind, Role};
pub use error::{Error, Result, ServiceError};
pub use export::{EnvExporter, NoopExporter, ProcessEnvExporter, ShellExporter};
pub use producer::{Delivery, ProducerLoop, ProducerReport, ProducerSettings};
pub use registry::{FailoverRegistry, FileRegistry, MemoryRegistry, Provision, Slot};
pub use retry::{classify, ErrorClass, RetryDecision, RetryPolicy};
pub use shutdown::ShutdownFlag;
pub use sleeper::{RecordingSleeper, Sleeper, ThreadSleeper};
pub use target::{CursorPosition, CursorState, TargetRef};
