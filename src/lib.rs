#![allow(clippy::doc_markdown)] // Allow technical terms like XREADGROUP, XAUTOCLAIM in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # AgentBus Core
//!
//! Event-driven communication core for supervisor/worker agent systems.
//!
//! ## Overview
//!
//! Agents exchange immutable [`MessageEnvelope`]s over append-only log streams.
//! Consumer groups give competing-consumer, at-least-once delivery; a protocol
//! layer adds request/response, publish/subscribe, task coordination and health
//! monitoring on top; and [`WorkerAgent`] runs task-specific logic with a strict
//! one-task-at-a-time lifecycle.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Envelope, log stream transports, subscriptions and the [`MessageBus`]
//! - [`protocols`] - Protocol messages, middleware and the four communication protocols
//! - [`worker`] - Worker agent runtime, processor contract and metrics
//! - [`config`] - Layered configuration (`AGENTBUS__*` overrides)
//! - [`logging`] - Structured `tracing` setup
//! - [`metrics`] - OpenTelemetry instruments
//! - [`error`] - Umbrella error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentbus_core::config::AgentBusConfig;
//! use agentbus_core::messaging::{InMemoryLogStream, MessageBus, Payload};
//! use agentbus_core::worker::{TaskOutcome, TaskProcessor, WorkerAgent};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl TaskProcessor for Echo {
//!     fn worker_type(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn process_task(&self, payload: &Payload) -> anyhow::Result<TaskOutcome> {
//!         Ok(TaskOutcome::success(serde_json::Value::Object(payload.clone())))
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentBusConfig::default();
//! let bus = Arc::new(MessageBus::new(Arc::new(InMemoryLogStream::new()), config.bus.clone()));
//!
//! let worker = WorkerAgent::new(Arc::new(Echo), bus.clone(), config.worker.clone());
//! worker.start().await?;
//! // ... tasks published to `supervisor:tasks` are now processed ...
//! worker.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery Semantics
//!
//! Entries within one stream reach a consumer group in append order. A consumer
//! that crashes between receiving and acknowledging an entry causes redelivery
//! once the entry has been idle past the visibility timeout, so handlers must
//! tolerate duplicates. A live consumer renews the entry it is handling, so
//! slow handlers are never duplicated by their siblings.

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod protocols;
pub mod worker;

pub use config::{AgentBusConfig, BusConfig, ConfigLoader, WorkerConfig};
pub use error::{AgentBusError, AgentBusResult};
pub use messaging::{
    MessageBus, MessageEnvelope, MessageKind, MessagePriority, MessagingError, Payload,
};
pub use protocols::{ProtocolContext, ProtocolError, ProtocolMessage};
pub use worker::{TaskOutcome, TaskProcessor, WorkerAgent, WorkerError, WorkerStatus};
