// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event source factory used by the flags client.
//!
//! The client asks for a new stream whenever its evaluation context changes.
//! [`StreamRequests`] remembers the most recent source so the visibility
//! controller can start, stop and inspect whichever stream is current.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tracing::debug;

use crate::config::{EventSourceConfig, RetryDecision};
use crate::error::Result;
use crate::event_source::{ConnectionStatus, EventSource};
use crate::http_transport::HttpTransportFactory;
use crate::scheduler::{SharedScheduler, TokioScheduler};
use crate::transport::SharedTransportFactory;
use crate::visibility::Streamer;

/// Per-stream options supplied by the flags client.
#[derive(Clone, Default)]
pub struct EventSourceInit {
	pub headers: BTreeMap<String, String>,
	/// Decides whether a terminal error is retried. `None` retries everything.
	pub error_filter: Option<RetryDecision>,
}

impl std::fmt::Debug for EventSourceInit {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventSourceInit")
			.field("headers", &self.headers.keys().collect::<Vec<_>>())
			.field("has_error_filter", &self.error_filter.is_some())
			.finish()
	}
}

/// Creates event sources and tracks the current one.
pub struct StreamRequests {
	factory: SharedTransportFactory,
	scheduler: SharedScheduler,
	base: EventSourceConfig,
	current: Mutex<Option<EventSource>>,
}

impl StreamRequests {
	pub fn new(factory: SharedTransportFactory, scheduler: SharedScheduler) -> Self {
		Self {
			factory,
			scheduler,
			base: EventSourceConfig::default(),
			current: Mutex::new(None),
		}
	}

	/// HTTP transport and tokio timers on the current runtime.
	pub fn current_runtime() -> Result<Self> {
		Ok(Self::new(
			Arc::new(HttpTransportFactory::current()?),
			Arc::new(TokioScheduler::current()?),
		))
	}

	/// Base configuration that every created source starts from.
	pub fn with_config(mut self, config: EventSourceConfig) -> Self {
		self.base = config;
		self
	}

	fn lock(&self) -> MutexGuard<'_, Option<EventSource>> {
		self.current.lock().unwrap_or_else(|p| p.into_inner())
	}

	/// Creates a source for `url` and makes it the current one.
	///
	/// The previous source, if any, is left to its owner.
	pub fn create_event_source(&self, url: &str, init: EventSourceInit) -> Result<EventSource> {
		let mut config = self.base.clone();
		config.headers.extend(init.headers);
		if init.error_filter.is_some() {
			config.retry_decision = init.error_filter;
		}

		let source = EventSource::builder(url)
			.config(config)
			.transport_factory(Arc::clone(&self.factory))
			.scheduler(Arc::clone(&self.scheduler))
			.build()?;

		debug!(url = %url, "Created event source");
		*self.lock() = Some(source.clone());
		Ok(source)
	}

	/// The most recently created source.
	pub fn event_source(&self) -> Option<EventSource> {
		self.lock().clone()
	}
}

impl std::fmt::Debug for StreamRequests {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StreamRequests")
			.field("current", &*self.lock())
			.finish()
	}
}

impl Streamer for StreamRequests {
	fn start(&self) {
		if let Some(source) = self.event_source() {
			source.start();
		}
	}

	fn stop(&self) {
		if let Some(source) = self.event_source() {
			source.stop();
		}
	}

	/// `Closed` when no source has been created.
	fn status(&self) -> ConnectionStatus {
		self.event_source()
			.map_or(ConnectionStatus::Closed, |source| source.status())
	}
}

/// Path of the evaluation stream for `context`: `/eval/{id}/{base64url(json)}`.
pub fn eval_stream_path(client_side_id: &str, context: &serde_json::Value) -> String {
	let encoded = URL_SAFE_NO_PAD.encode(context.to_string());
	format!("/eval/{client_side_id}/{encoded}")
}
