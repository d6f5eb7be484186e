// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the flags streaming transport.

use thiserror::Error;

/// Streaming transport errors.
///
/// Transport failures on a live connection are never returned from
/// [`EventSource`](crate::EventSource) methods; they are dispatched as
/// [`StreamEvent::Error`](crate::StreamEvent::Error) and drive reconnection.
/// These variants cover the synchronous failures surfaced to callers.
#[derive(Debug, Error)]
pub enum StreamError {
	/// Listener removal was requested for an event type that was never registered.
	#[error("'{0}' type is not supported event type")]
	UnsupportedEventType(String),

	/// The stream URL could not be parsed.
	#[error("invalid stream URL '{url}': {source}")]
	InvalidUrl {
		url: String,
		#[source]
		source: url::ParseError,
	},

	/// The transport factory could not start a connection.
	#[error("transport unavailable: {0}")]
	TransportUnavailable(String),

	/// Configuration failed validation.
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	/// Building the HTTP client or request failed.
	#[error("HTTP request failed: {0}")]
	Request(#[from] reqwest::Error),
}

impl StreamError {
	/// Returns true for errors raised while constructing a connection.
	///
	/// These are converted into dispatched `exception` error events by the
	/// state machine rather than returned.
	pub fn is_construction_error(&self) -> bool {
		matches!(
			self,
			StreamError::InvalidUrl { .. } | StreamError::TransportUnavailable(_) | StreamError::Request(_)
		)
	}
}

/// Result type alias for streaming operations.
pub type Result<T> = std::result::Result<T, StreamError>;
