// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP streaming transport built on reqwest.
//!
//! Each connection runs as a task on the configured tokio runtime. The task
//! sends one request, reports the response head, then forwards decoded body
//! chunks until the stream ends. Every way the task finishes is reported as a
//! closed [`TransportFailure`] so the event source decides whether to
//! reconnect.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL};
use reqwest::{Client, RequestBuilder};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::error::{Result, StreamError};
use crate::event::ReadyState;
use crate::transport::{
	Transport, TransportFactory, TransportFailure, TransportHandler, TransportRequest,
};

/// Returns the User-Agent sent on stream requests.
pub fn user_agent() -> String {
	format!("loom-flags-stream/{}", env!("CARGO_PKG_VERSION"))
}

/// Opens streaming HTTP connections.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
	client: Client,
	runtime: Handle,
}

impl HttpTransportFactory {
	pub fn new(runtime: Handle) -> Result<Self> {
		let client = Client::builder().user_agent(user_agent()).build()?;
		Ok(Self::with_client(client, runtime))
	}

	/// Uses a preconfigured client, e.g. one with proxies or custom TLS roots.
	pub fn with_client(client: Client, runtime: Handle) -> Self {
		Self { client, runtime }
	}

	/// Uses the runtime the caller is running on.
	pub fn current() -> Result<Self> {
		let runtime = Handle::try_current().map_err(|e| {
			StreamError::TransportUnavailable(format!("no tokio runtime available: {e}"))
		})?;
		Self::new(runtime)
	}

	fn build_request(&self, request: &TransportRequest) -> Result<RequestBuilder> {
		let mut headers = HeaderMap::new();
		headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
		headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
		for (name, value) in &request.headers {
			let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
				StreamError::TransportUnavailable(format!("invalid header name '{name}': {e}"))
			})?;
			let value = HeaderValue::from_str(value).map_err(|e| {
				StreamError::TransportUnavailable(format!("invalid value for header '{name}': {e}"))
			})?;
			headers.insert(name, value);
		}

		let mut builder = self
			.client
			.request(request.method.clone(), request.url.clone())
			.headers(headers);
		if let Some(body) = &request.body {
			builder = builder.body(body.clone());
		}
		Ok(builder)
	}
}

impl TransportFactory for HttpTransportFactory {
	fn connect(
		&self,
		request: TransportRequest,
		handler: Arc<dyn TransportHandler>,
	) -> Result<Box<dyn Transport>> {
		let builder = self.build_request(&request)?;
		let ready_state = Arc::new(AtomicU8::new(encode(ReadyState::Connecting)));

		debug!(
			url = %request.url,
			method = %request.method,
			with_credentials = request.with_credentials,
			"Starting HTTP stream"
		);

		let task = self.runtime.spawn(run_connection(
			builder,
			request.timeout,
			handler,
			Arc::clone(&ready_state),
		));

		Ok(Box::new(HttpTransport {
			task: task.abort_handle(),
			ready_state,
		}))
	}
}

/// One streaming HTTP connection.
#[derive(Debug)]
pub struct HttpTransport {
	task: AbortHandle,
	ready_state: Arc<AtomicU8>,
}

impl Transport for HttpTransport {
	fn ready_state(&self) -> ReadyState {
		decode(self.ready_state.load(Ordering::SeqCst))
	}

	fn close(&self) {
		self.task.abort();
		self.ready_state
			.store(encode(ReadyState::Closed), Ordering::SeqCst);
	}
}

impl Drop for HttpTransport {
	fn drop(&mut self) {
		self.task.abort();
	}
}

fn encode(state: ReadyState) -> u8 {
	state.code() as u8
}

fn decode(code: u8) -> ReadyState {
	match code {
		0 => ReadyState::Connecting,
		1 => ReadyState::Open,
		_ => ReadyState::Closed,
	}
}

async fn run_connection(
	request: RequestBuilder,
	timeout: Option<Duration>,
	handler: Arc<dyn TransportHandler>,
	ready_state: Arc<AtomicU8>,
) {
	let fail = |failure: TransportFailure| {
		ready_state.store(encode(ReadyState::Closed), Ordering::SeqCst);
		handler.on_error(failure);
	};

	let send = request.send();
	let sent = match timeout {
		Some(limit) => match tokio::time::timeout(limit, send).await {
			Ok(sent) => sent,
			Err(_) => {
				return fail(TransportFailure::closed(
					format!("timed out after {}ms waiting for response", limit.as_millis()),
					0,
				));
			}
		},
		None => send.await,
	};

	let response = match sent {
		Ok(response) => response,
		Err(e) => {
			let status = e.status().map_or(0, |s| s.as_u16());
			return fail(TransportFailure::closed(e.to_string(), status));
		}
	};

	let status = response.status();
	if !status.is_success() {
		let body = response.text().await.unwrap_or_default();
		let message = if body.is_empty() {
			status.to_string()
		} else {
			body
		};
		return fail(TransportFailure::closed(message, status.as_u16()));
	}

	ready_state.store(encode(ReadyState::Open), Ordering::SeqCst);
	info!(status = status.as_u16(), "HTTP stream established");
	handler.on_open();

	let mut decoder = Utf8Decoder::default();
	let mut body = response.bytes_stream();
	while let Some(chunk) = body.next().await {
		match chunk {
			Ok(bytes) => {
				let text = decoder.decode(&bytes);
				if !text.is_empty() {
					handler.on_message(&text);
				}
			}
			Err(e) => return fail(TransportFailure::closed(e.to_string(), 0)),
		}
	}

	debug!("HTTP stream ended");
	fail(TransportFailure::closed("stream ended", 0));
}

/// Decodes UTF-8 across chunk boundaries, holding back incomplete sequences.
#[derive(Debug, Default)]
struct Utf8Decoder {
	pending: Vec<u8>,
}

impl Utf8Decoder {
	fn decode(&mut self, bytes: &[u8]) -> String {
		self.pending.extend_from_slice(bytes);
		let mut out = String::new();
		loop {
			match std::str::from_utf8(&self.pending) {
				Ok(text) => {
					out.push_str(text);
					self.pending.clear();
					return out;
				}
				Err(e) => {
					let valid = e.valid_up_to();
					out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
					match e.error_len() {
						None => {
							self.pending.drain(..valid);
							return out;
						}
						Some(len) => {
							out.push(char::REPLACEMENT_CHARACTER);
							self.pending.drain(..valid + len);
						}
					}
				}
			}
		}
	}
}
