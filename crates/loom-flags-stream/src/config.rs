// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration for event sources and the visibility controller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use serde::{Deserialize, Serialize};

use crate::backoff::{
	FastRandom, RandomSource, RetryState, DEFAULT_INITIAL_RETRY_DELAY, DEFAULT_JITTER_RATIO,
	MAX_RETRY_DELAY,
};
use crate::error::{Result, StreamError};
use crate::listeners::{NoOpLifecycleHooks, SharedLifecycleHooks};

/// Default debounce applied to visibility changes.
pub const DEFAULT_VISIBILITY_DEBOUNCE: Duration = Duration::from_secs(5);

/// Details handed to a [`RetryDecision`] when a connection closes with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
	/// HTTP status, or `0` when none was received.
	pub status: u16,
	pub message: String,
}

/// Decides whether a terminal transport error should be retried.
pub type RetryDecision = Arc<dyn Fn(&RetryContext) -> bool + Send + Sync>;

/// Options for one [`EventSource`](crate::EventSource).
#[derive(Clone)]
pub struct EventSourceConfig {
	pub body: Option<String>,
	pub headers: BTreeMap<String, String>,
	pub method: Method,
	/// Bound on waiting for the response head. `None` waits indefinitely.
	pub timeout: Option<Duration>,
	pub with_credentials: bool,
	/// When unset every terminal error is retried.
	pub retry_decision: Option<RetryDecision>,
	pub initial_retry_delay: Duration,
	pub max_retry_delay: Duration,
	pub jitter_ratio: f64,
	pub hooks: SharedLifecycleHooks,
	pub random: Arc<dyn RandomSource>,
}

impl Default for EventSourceConfig {
	fn default() -> Self {
		Self {
			body: None,
			headers: BTreeMap::new(),
			method: Method::GET,
			timeout: None,
			with_credentials: false,
			retry_decision: None,
			initial_retry_delay: DEFAULT_INITIAL_RETRY_DELAY,
			max_retry_delay: MAX_RETRY_DELAY,
			jitter_ratio: DEFAULT_JITTER_RATIO,
			hooks: Arc::new(NoOpLifecycleHooks),
			random: Arc::new(FastRandom),
		}
	}
}

impl EventSourceConfig {
	pub fn validate(&self) -> Result<()> {
		if self.initial_retry_delay.is_zero() {
			return Err(StreamError::InvalidConfig(
				"initial retry delay must be > 0".to_string(),
			));
		}
		if self.max_retry_delay < self.initial_retry_delay {
			return Err(StreamError::InvalidConfig(
				"max retry delay must be >= initial retry delay".to_string(),
			));
		}
		if !(0.0..=1.0).contains(&self.jitter_ratio) {
			return Err(StreamError::InvalidConfig(
				"jitter ratio must be between 0.0 and 1.0".to_string(),
			));
		}
		Ok(())
	}

	pub(crate) fn retry_state(&self) -> RetryState {
		RetryState::new(
			self.initial_retry_delay,
			self.max_retry_delay,
			self.jitter_ratio,
		)
	}

	/// Whether a terminal error should trigger a reconnect.
	pub(crate) fn should_retry(&self, context: &RetryContext) -> bool {
		self.retry_decision
			.as_ref()
			.map_or(true, |decide| decide(context))
	}
}

impl std::fmt::Debug for EventSourceConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventSourceConfig")
			.field("method", &self.method)
			.field("headers", &self.headers.keys().collect::<Vec<_>>())
			.field("has_body", &self.body.is_some())
			.field("timeout", &self.timeout)
			.field("with_credentials", &self.with_credentials)
			.field("has_retry_decision", &self.retry_decision.is_some())
			.field("initial_retry_delay", &self.initial_retry_delay)
			.field("max_retry_delay", &self.max_retry_delay)
			.field("jitter_ratio", &self.jitter_ratio)
			.finish()
	}
}

/// Tunables that hosts typically load from a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
	pub initial_retry_delay_ms: u64,
	pub max_retry_delay_ms: u64,
	pub jitter_ratio: f64,
	/// `0` disables the response timeout.
	pub timeout_ms: u64,
	pub visibility_debounce_ms: u64,
}

impl Default for StreamSettings {
	fn default() -> Self {
		Self {
			initial_retry_delay_ms: 1000,
			max_retry_delay_ms: 30_000,
			jitter_ratio: DEFAULT_JITTER_RATIO,
			timeout_ms: 0,
			visibility_debounce_ms: 5000,
		}
	}
}

impl StreamSettings {
	/// Overlays these settings onto `config`.
	pub fn apply(&self, mut config: EventSourceConfig) -> EventSourceConfig {
		config.initial_retry_delay = Duration::from_millis(self.initial_retry_delay_ms);
		config.max_retry_delay = Duration::from_millis(self.max_retry_delay_ms);
		config.jitter_ratio = self.jitter_ratio;
		config.timeout = (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms));
		config
	}

	pub fn visibility_debounce(&self) -> Duration {
		Duration::from_millis(self.visibility_debounce_ms)
	}
}
