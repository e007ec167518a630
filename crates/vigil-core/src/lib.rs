//! # vigil-core
//!
//! Core library for vigil - a host-resident security and telemetry agent.
//!
//! This crate provides the two subsystems at the heart of the agent:
//!
//! - **Capture ring** ([`ring`]): a rotating set of shared-memory-backed
//!   segments buffering recent system events, able to answer retrospective
//!   capture requests ("give me everything around this moment") while the
//!   producer keeps appending.
//! - **Policy engine** ([`policy`]): matches live events against compiled
//!   security policies, performs reactive actions (scoped captures,
//!   container pause/stop), and defers event emission until every action
//!   has settled.
//!
//! Around those sit the [`compliance`] streaming client, the [`egress`]
//! serializer feeding the collector transport queue, and the shared
//! [`event`] model and [`config`] value.
//!
//! External collaborators (the kernel event source, the rule condition
//! compiler, the container runtime, the infrastructure inventory) are
//! expressed as ports - traits the embedding binary implements.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use vigil_core::config::AgentConfig;
//! use vigil_core::egress::{BoundedSinkQueue, EgressHandler};
//! use vigil_core::ring::MemoryDumper;
//!
//! let config = AgentConfig::default();
//! let sink = Arc::new(BoundedSinkQueue::new(config.egress.queue_capacity));
//! let egress = Arc::new(EgressHandler::new(sink, config.egress.compression));
//! let dumper = MemoryDumper::open(&config.memdump, &config.run_root, egress).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod compliance;
pub mod config;
pub mod egress;
pub mod event;
pub mod policy;
pub mod ring;

pub use config::AgentConfig;
pub use event::{Event, EventType, EventTypeSet};
pub use policy::engine::SecurityEngine;
pub use ring::MemoryDumper;
