// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Boundary between the event source and whatever moves bytes.
//!
//! An [`EventSource`](crate::EventSource) asks a [`TransportFactory`] for one
//! connection at a time and hears back through a [`TransportHandler`]. The
//! production implementation is [`HttpTransportFactory`](crate::HttpTransportFactory).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use url::Url;

use crate::error::Result;
use crate::event::ReadyState;

/// Everything a transport needs to open one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
	pub url: Url,
	pub method: Method,
	pub headers: BTreeMap<String, String>,
	pub body: Option<String>,
	/// Bound on waiting for the response head. `None` waits indefinitely.
	pub timeout: Option<Duration>,
	pub with_credentials: bool,
}

/// Failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
	pub message: String,
	/// HTTP status, or `0` when none was received.
	pub status: u16,
	/// State of the transport after the failure. `Closed` means the
	/// connection is gone and a reconnect is needed.
	pub ready_state: ReadyState,
}

impl TransportFailure {
	pub fn closed(message: impl Into<String>, status: u16) -> Self {
		Self {
			message: message.into(),
			status,
			ready_state: ReadyState::Closed,
		}
	}

	pub fn is_terminal(&self) -> bool {
		self.ready_state == ReadyState::Closed
	}
}

/// Reactions a transport delivers back to its event source.
pub trait TransportHandler: Send + Sync {
	fn on_open(&self);

	/// A chunk of decoded text, in arrival order.
	fn on_message(&self, chunk: &str);

	fn on_error(&self, failure: TransportFailure);
}

/// A live connection.
pub trait Transport: Send + Sync {
	fn ready_state(&self) -> ReadyState;

	/// Stops delivery. No handler reactions follow a close.
	fn close(&self);
}

/// Creates transports.
pub trait TransportFactory: Send + Sync {
	/// Starts a connection. Errors returned here are construction failures;
	/// failures after this returns are reported through `handler`.
	fn connect(
		&self,
		request: TransportRequest,
		handler: Arc<dyn TransportHandler>,
	) -> Result<Box<dyn Transport>>;
}

/// Shared factory handle.
pub type SharedTransportFactory = Arc<dyn TransportFactory>;
