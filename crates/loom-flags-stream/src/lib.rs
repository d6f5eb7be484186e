// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Resilient server-sent event streaming for Loom feature flags clients.
//!
//! This crate keeps a long-lived event stream open, reconnects with jittered
//! exponential backoff when it drops, parses frames out of partial chunks and
//! fans them out to registered listeners.
//!
//! # Features
//!
//! - **Reconnecting state machine**: [`EventSource`] with Connecting, Open,
//!   Error and Closed states and a pluggable retry decision
//! - **Incremental parsing**: [`EventParser`] handles frames split across
//!   arbitrary chunk boundaries
//! - **Typed dispatch**: listeners keyed by [`EventKind`] receive [`StreamEvent`]s
//! - **Visibility control**: [`VisibilityController`] stops the stream in the
//!   background and restarts it in the foreground, debounced
//! - **Injectable collaborators**: transport, scheduler and randomness are
//!   traits, so tests run on a virtual clock with [`ManualScheduler`]
//!
//! # Example
//!
//! ```ignore
//! use loom_flags_stream::{eval_stream_path, listener, EventKind, EventSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = serde_json::json!({"kind": "user", "key": "user123"});
//!     let url = format!(
//!         "https://clientstream.example.com{}",
//!         eval_stream_path("client-side-id", &context)
//!     );
//!
//!     let source = EventSource::builder(url)
//!         .retry_decision(|ctx| ctx.status != 401)
//!         .build()?;
//!
//!     source.add_event_listener(
//!         EventKind::Custom("put".to_string()),
//!         listener(|event| {
//!             if let Some(frame) = event.as_frame() {
//!                 println!("{}", frame.data);
//!             }
//!         }),
//!     );
//!
//!     tokio::signal::ctrl_c().await?;
//!     source.close();
//!     Ok(())
//! }
//! ```

pub mod backoff;
mod config;
mod error;
mod event;
mod event_source;
mod http_transport;
mod listeners;
pub mod parser;
mod requests;
pub mod scheduler;
pub mod transport;
mod visibility;

pub use backoff::{FastRandom, RandomSource, RetryState, SequenceRandom};
pub use config::{
	EventSourceConfig, RetryContext, RetryDecision, StreamSettings, DEFAULT_VISIBILITY_DEBOUNCE,
};
pub use error::{Result, StreamError};
pub use event::{
	ErrorEvent, EventFrame, EventKind, ReadyState, RetryEvent, StreamEvent, DEFAULT_EVENT_TYPE,
};
pub use event_source::{ConnectionStatus, EventSource, EventSourceBuilder, LAST_EVENT_ID_PARAM};
pub use http_transport::{user_agent, HttpTransport, HttpTransportFactory};
pub use listeners::{
	listener, LifecycleHooks, Listener, ListenerRegistry, NoOpLifecycleHooks, SharedLifecycleHooks,
};
pub use parser::EventParser;
pub use requests::{eval_stream_path, EventSourceInit, StreamRequests};
pub use scheduler::{ManualScheduler, Scheduler, SharedScheduler, TokioScheduler};
pub use transport::{
	SharedTransportFactory, Transport, TransportFactory, TransportFailure, TransportHandler,
	TransportRequest,
};
pub use visibility::{
	Streamer, Visibility, VisibilityCallback, VisibilityController, VisibilitySignal,
	VisibilitySource,
};
