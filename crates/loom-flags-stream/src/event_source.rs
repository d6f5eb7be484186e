// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reconnecting event stream client.
//!
//! [`EventSource`] owns at most one transport connection at a time. It feeds
//! incoming text to the [`EventParser`], dispatches frames to listeners and
//! reschedules itself with jittered exponential backoff when the connection
//! drops.
//!
//! # State machine
//!
//! ```text
//!             open()                transport open
//!   ┌──────────────────► Connecting ───────────────► Open
//!   │                        │                        │
//!   │        transport error │                        │ transport error
//!   │                        ▼                        ▼
//!   │                      Error ◄────────────────────┘
//!   │                        │ terminal + retry allowed
//!   │                        ▼
//!   └──── timer fires ◄── try_connect()            close() ──► Closed
//! ```
//!
//! Transport failures never surface as `Err` from these methods. They are
//! dispatched as [`StreamEvent::Error`] and, when terminal, trigger a
//! reconnect unless the configured retry decision declines it.
//!
//! No internal lock is held while listeners, hooks, the transport or the
//! scheduler run, so listeners may call [`EventSource::open`] and
//! [`EventSource::close`] re-entrantly.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use http::Method;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::RandomSource;
use crate::config::{EventSourceConfig, RetryContext, RetryDecision, StreamSettings};
use crate::error::{Result, StreamError};
use crate::event::{ErrorEvent, EventKind, RetryEvent, StreamEvent};
use crate::http_transport::HttpTransportFactory;
use crate::listeners::{Dispatcher, LifecycleHooks, Listener};
use crate::parser::EventParser;
use crate::scheduler::{SharedScheduler, TimerHandle, TokioScheduler};
use crate::transport::{
	SharedTransportFactory, Transport, TransportFailure, TransportHandler, TransportRequest,
};

/// Query parameter carrying the last seen event id on reconnect.
pub const LAST_EVENT_ID_PARAM: &str = "lastEventId";

/// Connection state of an [`EventSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
	Connecting,
	Open,
	Error,
	Closed,
}

impl ConnectionStatus {
	/// Numeric code: Error=-1, Connecting=0, Open=1, Closed=2.
	pub fn code(self) -> i8 {
		match self {
			ConnectionStatus::Error => -1,
			ConnectionStatus::Connecting => 0,
			ConnectionStatus::Open => 1,
			ConnectionStatus::Closed => 2,
		}
	}
}

struct State {
	status: ConnectionStatus,
	retry: crate::backoff::RetryState,
	parser: EventParser,
	transport: Option<Box<dyn Transport>>,
	/// Bumped whenever the current transport is replaced or closed.
	generation: u64,
	/// Id of the reconnect timer that is allowed to fire.
	timer_id: Option<u64>,
	timer: Option<Box<dyn TimerHandle>>,
	next_timer_id: u64,
}

struct Inner {
	url: String,
	config: EventSourceConfig,
	factory: SharedTransportFactory,
	scheduler: SharedScheduler,
	dispatcher: Dispatcher,
	state: Mutex<State>,
}

/// Reconnecting client for a server-sent event stream.
///
/// Cloning yields another handle to the same connection.
///
/// # Example
///
/// ```ignore
/// use loom_flags_stream::{listener, EventKind, EventSource};
///
/// let source = EventSource::builder("https://flags.example.com/eval/client-id/e30")
///     .header("Authorization", "client-id")
///     .build()?;
///
/// source.add_event_listener(
///     EventKind::Custom("put".into()),
///     listener(|event| println!("{event:?}")),
/// );
/// ```
#[derive(Clone)]
pub struct EventSource {
	inner: Arc<Inner>,
}

impl EventSource {
	/// Starts building an event source for `url`.
	pub fn builder(url: impl Into<String>) -> EventSourceBuilder {
		EventSourceBuilder::new(url)
	}

	/// Creates an event source and schedules an immediate connect attempt.
	pub fn new(
		url: impl Into<String>,
		config: EventSourceConfig,
		factory: SharedTransportFactory,
		scheduler: SharedScheduler,
	) -> Self {
		let url = url.into();
		let state = State {
			status: ConnectionStatus::Connecting,
			retry: config.retry_state(),
			parser: EventParser::new(url.clone()),
			transport: None,
			generation: 0,
			timer_id: None,
			timer: None,
			next_timer_id: 0,
		};
		let inner = Arc::new(Inner {
			url,
			dispatcher: Dispatcher::new(Arc::clone(&config.hooks)),
			config,
			factory,
			scheduler,
			state: Mutex::new(state),
		});

		inner.try_connect(true);
		Self { inner }
	}

	/// Opens a new connection, replacing any current one.
	pub fn open(&self) {
		self.inner.open();
	}

	/// Closes the connection and cancels any pending reconnect.
	///
	/// Dispatches `close` only when the source was not already closed.
	pub fn close(&self) {
		self.inner.close();
	}

	/// Schedules `close()` followed by `open()`.
	///
	/// Without `force_no_delay` the delay comes from the backoff policy and
	/// counts as a retry attempt.
	pub fn try_connect(&self, force_no_delay: bool) {
		self.inner.try_connect(force_no_delay);
	}

	pub fn status(&self) -> ConnectionStatus {
		self.inner.lock().status
	}

	/// Reconnect attempts scheduled since the last successful open.
	pub fn retry_count(&self) -> u32 {
		self.inner.lock().retry.retry_count()
	}

	pub fn last_event_id(&self) -> Option<String> {
		self.inner.lock().parser.last_event_id().map(str::to_string)
	}

	pub fn url(&self) -> &str {
		&self.inner.url
	}

	pub fn config(&self) -> &EventSourceConfig {
		&self.inner.config
	}

	/// Names of lifecycle kinds map to the lifecycle tables. Server frames
	/// that reuse such a name are delivered under `EventKind::Custom(name)`.
	pub fn add_event_listener(&self, kind: impl Into<EventKind>, listener: Listener) {
		self.inner.dispatcher.registry().add(kind.into(), listener);
	}

	pub fn remove_event_listener(&self, kind: impl Into<EventKind>, listener: &Listener) {
		self.inner
			.dispatcher
			.registry()
			.remove(&kind.into(), listener);
	}

	/// Clears listeners for `kind`, or for every kind when `None`.
	///
	/// Fails with [`StreamError::UnsupportedEventType`] for a kind that has
	/// never been registered.
	pub fn remove_all_event_listeners(&self, kind: Option<EventKind>) -> Result<()> {
		self.inner.dispatcher.registry().remove_all(kind.as_ref())
	}

	/// Number of listeners registered for `kind`.
	pub fn listener_count(&self, kind: impl Into<EventKind>) -> usize {
		self.inner.dispatcher.registry().len(&kind.into())
	}

	/// Invokes listeners and the lifecycle hook for `event`.
	pub fn dispatch(&self, event: &StreamEvent) {
		self.inner.dispatcher.dispatch(event);
	}

	#[cfg(test)]
	fn next_retry_delay(&self) -> Duration {
		let mut state = self.inner.lock();
		state.retry.next_retry_delay(self.inner.config.random.as_ref())
	}
}

impl std::fmt::Debug for EventSource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventSource")
			.field("url", &self.inner.url)
			.field("status", &self.status())
			.finish()
	}
}

impl Inner {
	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(|p| p.into_inner())
	}

	fn request_url(&self, last_event_id: Option<&str>) -> Result<Url> {
		let mut url = Url::parse(&self.url).map_err(|source| StreamError::InvalidUrl {
			url: self.url.clone(),
			source,
		})?;

		if let Some(id) = last_event_id {
			let retained: Vec<(String, String)> = url
				.query_pairs()
				.filter(|(key, _)| key != LAST_EVENT_ID_PARAM)
				.map(|(key, value)| (key.into_owned(), value.into_owned()))
				.collect();
			url.query_pairs_mut()
				.clear()
				.extend_pairs(retained)
				.append_pair(LAST_EVENT_ID_PARAM, id);
		}

		Ok(url)
	}

	fn open(self: &Arc<Self>) {
		let (generation, previous, url) = {
			let mut state = self.lock();
			state.generation += 1;
			state.parser.reset();
			state.status = ConnectionStatus::Connecting;
			let url = self.request_url(state.parser.last_event_id());
			(state.generation, state.transport.take(), url)
		};

		if let Some(previous) = previous {
			previous.close();
		}

		let url = match url {
			Ok(url) => url,
			Err(e) => return self.fail_construction(generation, e),
		};

		info!(url = %url, "Opening event stream");

		let request = TransportRequest {
			url,
			method: self.config.method.clone(),
			headers: self.config.headers.clone(),
			body: self.config.body.clone(),
			timeout: self.config.timeout,
			with_credentials: self.config.with_credentials,
		};
		let handler = Arc::new(ConnectionHandler {
			inner: Arc::downgrade(self),
			generation,
		});

		match self.factory.connect(request, handler) {
			Ok(transport) => {
				let stale = {
					let mut state = self.lock();
					if state.generation == generation {
						state.transport = Some(transport);
						None
					} else {
						Some(transport)
					}
				};
				if let Some(stale) = stale {
					stale.close();
				}
			}
			Err(e) => self.fail_construction(generation, e),
		}
	}

	fn fail_construction(&self, generation: u64, error: StreamError) {
		{
			let mut state = self.lock();
			if state.generation == generation {
				state.status = ConnectionStatus::Error;
			}
		}
		warn!(url = %self.url, error = %error, "Failed to open event stream");
		self.dispatcher
			.dispatch(&StreamEvent::Error(ErrorEvent::Exception {
				message: error.to_string(),
			}));
	}

	fn close(&self) {
		let (was_closed, timer, transport) = {
			let mut state = self.lock();
			let was_closed = state.status == ConnectionStatus::Closed;
			state.status = ConnectionStatus::Closed;
			state.generation += 1;
			state.timer_id = None;
			(was_closed, state.timer.take(), state.transport.take())
		};

		if let Some(timer) = timer {
			timer.cancel();
		}
		if let Some(transport) = transport {
			transport.close();
		}

		if !was_closed {
			info!(url = %self.url, "Event stream closed");
			self.dispatcher.dispatch(&StreamEvent::Close);
		}
	}

	fn try_connect(self: &Arc<Self>, force_no_delay: bool) {
		let delay = if force_no_delay {
			Duration::ZERO
		} else {
			let mut state = self.lock();
			state.retry.next_retry_delay(self.config.random.as_ref())
		};

		debug!(
			delay_ms = delay.as_millis() as u64,
			"Will open new connection"
		);
		self.dispatcher
			.dispatch(&StreamEvent::Retry(RetryEvent { delay }));

		let (timer_id, previous) = {
			let mut state = self.lock();
			state.next_timer_id += 1;
			let timer_id = state.next_timer_id;
			state.timer_id = Some(timer_id);
			(timer_id, state.timer.take())
		};
		if let Some(previous) = previous {
			previous.cancel();
		}

		let weak = Arc::downgrade(self);
		let handle = self.scheduler.schedule(
			delay,
			Box::new(move || {
				if let Some(inner) = weak.upgrade() {
					inner.reconnect_now(timer_id);
				}
			}),
		);

		let mut state = self.lock();
		if state.timer_id == Some(timer_id) {
			state.timer = Some(handle);
		} else {
			drop(state);
			handle.cancel();
		}
	}

	fn reconnect_now(self: &Arc<Self>, timer_id: u64) {
		{
			let mut state = self.lock();
			if state.timer_id != Some(timer_id) {
				return;
			}
			state.timer_id = None;
			state.timer = None;
		}
		self.close();
		self.open();
	}

	fn handle_open(&self, generation: u64) {
		{
			let mut state = self.lock();
			if state.generation != generation {
				return;
			}
			state.status = ConnectionStatus::Open;
			state.retry.reset();
		}
		info!(url = %self.url, "Event stream connection established");
		self.dispatcher.dispatch(&StreamEvent::Open);
	}

	fn handle_message(&self, generation: u64, chunk: &str) {
		let frames = {
			let mut state = self.lock();
			if state.generation != generation {
				return;
			}
			state.parser.push(chunk)
		};

		for frame in frames {
			// A listener or a reconnect timer may have closed the connection.
			if self.lock().generation != generation {
				debug!("Dropping frames from a replaced connection");
				return;
			}
			debug!(event_type = %frame.event_type, "Dispatching event frame");
			self.dispatcher.dispatch(&StreamEvent::Message(frame));
		}
	}

	fn handle_error(self: &Arc<Self>, generation: u64, failure: TransportFailure) {
		{
			let mut state = self.lock();
			if state.generation != generation {
				return;
			}
			state.status = ConnectionStatus::Error;
		}

		warn!(
			url = %self.url,
			status = failure.status,
			message = %failure.message,
			"Event stream error"
		);
		self.dispatcher
			.dispatch(&StreamEvent::Error(ErrorEvent::Transport {
				message: failure.message.clone(),
				status: failure.status,
				ready_state: failure.ready_state,
			}));

		if !failure.is_terminal() {
			return;
		}

		// A listener may have closed or reopened the source during dispatch.
		if self.lock().generation != generation {
			debug!("Skipping reconnect, connection was replaced during error dispatch");
			return;
		}

		let context = RetryContext {
			status: failure.status,
			message: failure.message,
		};
		if self.config.should_retry(&context) {
			debug!("Connection closed, retrying");
			self.try_connect(false);
		} else {
			info!(status = context.status, "Retry declined, event stream stays down");
		}
	}
}

impl Drop for Inner {
	fn drop(&mut self) {
		let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
		if let Some(timer) = state.timer.take() {
			timer.cancel();
		}
		if let Some(transport) = state.transport.take() {
			transport.close();
		}
	}
}

/// Routes transport reactions for one connection generation.
struct ConnectionHandler {
	inner: Weak<Inner>,
	generation: u64,
}

impl TransportHandler for ConnectionHandler {
	fn on_open(&self) {
		if let Some(inner) = self.inner.upgrade() {
			inner.handle_open(self.generation);
		}
	}

	fn on_message(&self, chunk: &str) {
		if let Some(inner) = self.inner.upgrade() {
			inner.handle_message(self.generation, chunk);
		}
	}

	fn on_error(&self, failure: TransportFailure) {
		if let Some(inner) = self.inner.upgrade() {
			inner.handle_error(self.generation, failure);
		}
	}
}

/// Builder for [`EventSource`].
pub struct EventSourceBuilder {
	url: String,
	config: EventSourceConfig,
	transport_factory: Option<SharedTransportFactory>,
	scheduler: Option<SharedScheduler>,
}

impl EventSourceBuilder {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			config: EventSourceConfig::default(),
			transport_factory: None,
			scheduler: None,
		}
	}

	/// Replaces the whole configuration.
	pub fn config(mut self, config: EventSourceConfig) -> Self {
		self.config = config;
		self
	}

	/// Applies file-loaded settings on top of the current configuration.
	pub fn settings(mut self, settings: &StreamSettings) -> Self {
		self.config = settings.apply(self.config);
		self
	}

	pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.config.headers.insert(name.into(), value.into());
		self
	}

	pub fn method(mut self, method: Method) -> Self {
		self.config.method = method;
		self
	}

	pub fn body(mut self, body: impl Into<String>) -> Self {
		self.config.body = Some(body.into());
		self
	}

	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.config.timeout = Some(timeout);
		self
	}

	pub fn with_credentials(mut self, with_credentials: bool) -> Self {
		self.config.with_credentials = with_credentials;
		self
	}

	/// Only reconnect after a terminal error when `decide` returns true.
	pub fn retry_decision<F>(mut self, decide: F) -> Self
	where
		F: Fn(&RetryContext) -> bool + Send + Sync + 'static,
	{
		let decide: RetryDecision = Arc::new(decide);
		self.config.retry_decision = Some(decide);
		self
	}

	pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
		self.config.initial_retry_delay = delay;
		self
	}

	pub fn max_retry_delay(mut self, delay: Duration) -> Self {
		self.config.max_retry_delay = delay;
		self
	}

	pub fn jitter_ratio(mut self, ratio: f64) -> Self {
		self.config.jitter_ratio = ratio;
		self
	}

	pub fn lifecycle_hooks(mut self, hooks: impl LifecycleHooks + 'static) -> Self {
		self.config.hooks = Arc::new(hooks);
		self
	}

	pub fn random_source(mut self, random: impl RandomSource + 'static) -> Self {
		self.config.random = Arc::new(random);
		self
	}

	/// Defaults to [`HttpTransportFactory`] on the current tokio runtime.
	pub fn transport_factory(mut self, factory: SharedTransportFactory) -> Self {
		self.transport_factory = Some(factory);
		self
	}

	/// Defaults to [`TokioScheduler`] on the current tokio runtime.
	pub fn scheduler(mut self, scheduler: SharedScheduler) -> Self {
		self.scheduler = Some(scheduler);
		self
	}

	/// Validates the configuration and creates the event source, which
	/// immediately schedules its first connection.
	pub fn build(self) -> Result<EventSource> {
		self.config.validate()?;

		let scheduler = match self.scheduler {
			Some(scheduler) => scheduler,
			None => Arc::new(TokioScheduler::current()?),
		};
		let factory = match self.transport_factory {
			Some(factory) => factory,
			None => Arc::new(HttpTransportFactory::current()?),
		};

		debug!(url = %self.url, config = ?self.config, "Event source initialized");
		Ok(EventSource::new(self.url, self.config, factory, scheduler))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backoff::SequenceRandom;
	use crate::event::{EventFrame, ReadyState};
	use crate::listeners::listener;
	use crate::scheduler::ManualScheduler;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	const URL: &str = "https://mock.events.uri/eval/abc";

	struct MockTransport {
		closed: AtomicBool,
		closes: Arc<AtomicUsize>,
	}

	impl Transport for MockTransport {
		fn ready_state(&self) -> ReadyState {
			if self.closed.load(Ordering::SeqCst) {
				ReadyState::Closed
			} else {
				ReadyState::Connecting
			}
		}

		fn close(&self) {
			self.closed.store(true, Ordering::SeqCst);
			self.closes.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[derive(Default)]
	struct MockFactory {
		requests: Mutex<Vec<TransportRequest>>,
		handlers: Mutex<Vec<Arc<dyn TransportHandler>>>,
		closes: Arc<AtomicUsize>,
		fail: AtomicBool,
	}

	impl MockFactory {
		fn connects(&self) -> usize {
			self.requests.lock().unwrap().len()
		}

		fn last_request(&self) -> TransportRequest {
			self.requests.lock().unwrap().last().cloned().unwrap()
		}

		fn handler(&self) -> Arc<dyn TransportHandler> {
			self.handlers.lock().unwrap().last().cloned().unwrap()
		}

		fn closes(&self) -> usize {
			self.closes.load(Ordering::SeqCst)
		}
	}

	impl crate::transport::TransportFactory for MockFactory {
		fn connect(
			&self,
			request: TransportRequest,
			handler: Arc<dyn TransportHandler>,
		) -> Result<Box<dyn Transport>> {
			if self.fail.load(Ordering::SeqCst) {
				return Err(StreamError::TransportUnavailable("offline".to_string()));
			}
			self.requests.lock().unwrap().push(request);
			self.handlers.lock().unwrap().push(handler);
			Ok(Box::new(MockTransport {
				closed: AtomicBool::new(false),
				closes: Arc::clone(&self.closes),
			}))
		}
	}

	#[derive(Default)]
	struct RecordingHooks {
		opens: AtomicUsize,
		closes: AtomicUsize,
		errors: Mutex<Vec<ErrorEvent>>,
		retries: Mutex<Vec<Duration>>,
	}

	impl LifecycleHooks for Arc<RecordingHooks> {
		fn on_open(&self) {
			self.opens.fetch_add(1, Ordering::SeqCst);
		}

		fn on_close(&self) {
			self.closes.fetch_add(1, Ordering::SeqCst);
		}

		fn on_error(&self, error: &ErrorEvent) {
			self.errors.lock().unwrap().push(error.clone());
		}

		fn on_retrying(&self, retry: &RetryEvent) {
			self.retries.lock().unwrap().push(retry.delay);
		}
	}

	struct Harness {
		source: EventSource,
		factory: Arc<MockFactory>,
		scheduler: ManualScheduler,
		hooks: Arc<RecordingHooks>,
	}

	fn harness_with(url: &str, configure: impl FnOnce(EventSourceBuilder) -> EventSourceBuilder) -> Harness {
		let factory = Arc::new(MockFactory::default());
		let scheduler = ManualScheduler::new();
		let hooks = Arc::new(RecordingHooks::default());
		let builder = EventSource::builder(url)
			.transport_factory(factory.clone())
			.scheduler(Arc::new(scheduler.clone()))
			.lifecycle_hooks(Arc::clone(&hooks))
			.random_source(SequenceRandom::new([0.888, 0.999]));
		let source = configure(builder).build().unwrap();
		Harness {
			source,
			factory,
			scheduler,
			hooks,
		}
	}

	fn harness() -> Harness {
		harness_with(URL, |b| b)
	}

	/// Runs the construction-time connect and opens the transport.
	fn connected() -> Harness {
		let h = harness();
		h.scheduler.run_all();
		h.factory.handler().on_open();
		h
	}

	fn collect(source: &EventSource, kind: impl Into<EventKind>) -> Arc<Mutex<Vec<StreamEvent>>> {
		let events = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&events);
		source.add_event_listener(
			kind,
			listener(move |event| sink.lock().unwrap().push(event.clone())),
		);
		events
	}

	#[test]
	fn test_construction_schedules_immediate_connect() {
		let h = harness();
		assert_eq!(h.source.status(), ConnectionStatus::Connecting);
		assert_eq!(h.scheduler.pending(), 1);
		assert_eq!(h.scheduler.next_deadline(), Some(Duration::ZERO));
		assert_eq!(*h.hooks.retries.lock().unwrap(), vec![Duration::ZERO]);
		assert_eq!(h.factory.connects(), 0);

		h.scheduler.run_all();
		assert_eq!(h.factory.connects(), 1);
		assert_eq!(h.source.status(), ConnectionStatus::Connecting);
	}

	#[test]
	fn test_status_is_connecting_initially() {
		let h = harness();
		assert_eq!(h.source.status(), ConnectionStatus::Connecting);
		assert_eq!(h.source.status().code(), 0);
	}

	#[test]
	fn test_open_sets_connecting_synchronously() {
		let h = connected();
		assert_eq!(h.source.status(), ConnectionStatus::Open);

		h.source.open();
		assert_eq!(h.source.status(), ConnectionStatus::Connecting);
		assert_eq!(h.factory.connects(), 2);
		// The previous transport is closed before the new one opens.
		assert_eq!(h.factory.closes(), 1);
	}

	#[test]
	fn test_transport_open_resets_retry_count() {
		let h = harness();
		h.scheduler.run_all();
		h.source.next_retry_delay();
		h.source.next_retry_delay();
		assert_eq!(h.source.retry_count(), 2);

		let opens = collect(&h.source, EventKind::Open);
		h.factory.handler().on_open();

		assert_eq!(h.source.status(), ConnectionStatus::Open);
		assert_eq!(h.source.retry_count(), 0);
		assert_eq!(*opens.lock().unwrap(), vec![StreamEvent::Open]);
		assert_eq!(h.hooks.opens.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_next_retry_delay_twice() {
		let h = harness();
		let first = h.source.next_retry_delay();
		let second = h.source.next_retry_delay();

		assert_eq!(h.source.retry_count(), 2);
		assert_eq!(first, Duration::from_millis(556));
		assert_eq!(second, Duration::from_millis(1001));
	}

	#[test]
	fn test_try_connect_force_no_delay() {
		let h = harness();
		h.source.try_connect(true);

		assert_eq!(
			*h.hooks.retries.lock().unwrap(),
			vec![Duration::ZERO, Duration::ZERO]
		);
		h.scheduler.run_all();

		assert_eq!(h.factory.connects(), 1);
		assert_eq!(h.hooks.closes.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_try_connect_with_delay() {
		let h = harness();
		h.scheduler.run_all();
		let retries = collect(&h.source, EventKind::Retry);

		h.source.try_connect(false);
		assert_eq!(
			*retries.lock().unwrap(),
			vec![StreamEvent::Retry(RetryEvent {
				delay: Duration::from_millis(556)
			})]
		);

		assert_eq!(h.scheduler.advance(Duration::from_millis(555)), 0);
		assert_eq!(h.factory.connects(), 1);
		assert_eq!(h.scheduler.advance(Duration::from_millis(1)), 1);
		assert_eq!(h.factory.connects(), 2);
		assert_eq!(h.source.retry_count(), 1);
	}

	#[test]
	fn test_messages_dispatched_by_type() {
		let h = connected();
		let messages = collect(&h.source, EventKind::Message);
		let puts = collect(&h.source, "put");

		h.factory
			.handler()
			.on_message("data: test message\n\nevent: put\ndata: {\"flags\":{}}\n\n");

		assert_eq!(
			*messages.lock().unwrap(),
			vec![StreamEvent::Message(EventFrame {
				event_type: "message".to_string(),
				data: "test message".to_string(),
				last_event_id: None,
				source_url: URL.to_string(),
			})]
		);
		let puts = puts.lock().unwrap();
		assert_eq!(puts.len(), 1);
		assert_eq!(puts[0].as_frame().unwrap().data, "{\"flags\":{}}");
	}

	#[test]
	fn test_server_frame_named_error_is_not_a_lifecycle_error() {
		let h = connected();
		let errors = collect(&h.source, EventKind::Error);
		let server_errors = collect(&h.source, EventKind::Custom("error".to_string()));

		h.factory.handler().on_message("event: error\ndata: boom\n\n");

		assert!(errors.lock().unwrap().is_empty());
		assert!(h.hooks.errors.lock().unwrap().is_empty());
		let server_errors = server_errors.lock().unwrap();
		assert_eq!(server_errors.len(), 1);
		assert_eq!(server_errors[0].as_frame().unwrap().data, "boom");
		assert_eq!(h.source.status(), ConnectionStatus::Open);
	}

	#[test]
	fn test_no_frames_dispatched_after_close() {
		let h = connected();
		let order = Arc::new(Mutex::new(Vec::new()));
		let source = h.source.clone();
		let sink = Arc::clone(&order);
		h.source.add_event_listener(
			EventKind::Message,
			listener(move |event| {
				sink.lock().unwrap().push(event.as_frame().unwrap().data.clone());
				source.close();
			}),
		);
		let sink = Arc::clone(&order);
		h.source.add_event_listener(
			EventKind::Close,
			listener(move |_| sink.lock().unwrap().push("close".to_string())),
		);

		h.factory
			.handler()
			.on_message("data: one\n\ndata: two\n\n");

		assert_eq!(*order.lock().unwrap(), vec!["one", "close"]);
		assert_eq!(h.source.status(), ConnectionStatus::Closed);
	}

	#[test]
	fn test_partial_chunks_across_messages() {
		let h = connected();
		let messages = collect(&h.source, EventKind::Message);
		let handler = h.factory.handler();

		handler.on_message("data: par");
		handler.on_message("tial\n");
		assert!(messages.lock().unwrap().is_empty());
		handler.on_message("\n");
		assert_eq!(messages.lock().unwrap().len(), 1);
	}

	#[test]
	fn test_terminal_error_schedules_reconnect() {
		let h = connected();
		let errors = collect(&h.source, EventKind::Error);

		h.factory
			.handler()
			.on_error(TransportFailure::closed("stream ended", 0));

		assert_eq!(h.source.status(), ConnectionStatus::Error);
		assert_eq!(
			*errors.lock().unwrap(),
			vec![StreamEvent::Error(ErrorEvent::Transport {
				message: "stream ended".to_string(),
				status: 0,
				ready_state: ReadyState::Closed,
			})]
		);
		assert_eq!(h.source.retry_count(), 1);
		assert_eq!(
			h.hooks.retries.lock().unwrap().last(),
			Some(&Duration::from_millis(556))
		);

		h.scheduler.run_all();
		assert_eq!(h.factory.connects(), 2);
	}

	#[test]
	fn test_non_terminal_error_does_not_reconnect() {
		let h = connected();
		h.factory.handler().on_error(TransportFailure {
			message: "error".to_string(),
			status: 500,
			ready_state: ReadyState::Connecting,
		});

		assert_eq!(h.source.status(), ConnectionStatus::Error);
		assert_eq!(h.scheduler.pending(), 0);
		assert_eq!(h.source.retry_count(), 0);
	}

	#[test]
	fn test_retry_decision_gates_reconnect() {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let recorder = Arc::clone(&seen);
		let h = harness_with(URL, move |b| {
			b.retry_decision(move |ctx| {
				recorder.lock().unwrap().push(ctx.clone());
				ctx.status != 401
			})
		});
		h.scheduler.run_all();

		h.factory
			.handler()
			.on_error(TransportFailure::closed("unauthorized", 401));
		assert_eq!(h.scheduler.pending(), 0);
		assert_eq!(
			*seen.lock().unwrap(),
			vec![RetryContext {
				status: 401,
				message: "unauthorized".to_string()
			}]
		);

		h.factory
			.handler()
			.on_error(TransportFailure::closed("bad gateway", 502));
		assert_eq!(h.scheduler.pending(), 1);
	}

	#[test]
	fn test_reconnect_sends_last_event_id() {
		let h = connected();
		h.factory.handler().on_message("id: 99\ndata: x\n\n");
		assert_eq!(h.source.last_event_id(), Some("99".to_string()));

		h.factory
			.handler()
			.on_error(TransportFailure::closed("dropped", 0));
		h.scheduler.run_all();

		let request = h.factory.last_request();
		assert_eq!(
			request.url.as_str(),
			"https://mock.events.uri/eval/abc?lastEventId=99"
		);
	}

	#[test]
	fn test_last_event_id_replaces_existing_query_param() {
		let h = harness_with("https://mock.events.uri/eval?lastEventId=1&h=abc", |b| b);
		h.scheduler.run_all();
		h.factory.handler().on_message("id: 2\ndata: x\n\n");
		h.source.open();

		let url = h.factory.last_request().url;
		let pairs: Vec<(String, String)> = url
			.query_pairs()
			.map(|(k, v)| (k.into_owned(), v.into_owned()))
			.collect();
		assert_eq!(
			pairs,
			vec![
				("h".to_string(), "abc".to_string()),
				("lastEventId".to_string(), "2".to_string())
			]
		);
	}

	#[test]
	fn test_request_carries_config() {
		let h = harness_with(URL, |b| {
			b.header("Authorization", "client-id")
				.method(Method::POST)
				.body("{}")
				.timeout(Duration::from_secs(10))
				.with_credentials(true)
		});
		h.scheduler.run_all();

		let request = h.factory.last_request();
		assert_eq!(request.method, Method::POST);
		assert_eq!(
			request.headers.get("Authorization").map(String::as_str),
			Some("client-id")
		);
		assert_eq!(request.body.as_deref(), Some("{}"));
		assert_eq!(request.timeout, Some(Duration::from_secs(10)));
		assert!(request.with_credentials);
	}

	#[test]
	fn test_invalid_url_dispatches_exception() {
		let h = harness_with("not a url", |b| b);
		let errors = collect(&h.source, EventKind::Error);
		h.scheduler.run_all();

		assert_eq!(h.source.status(), ConnectionStatus::Error);
		assert_eq!(h.factory.connects(), 0);
		let errors = errors.lock().unwrap();
		assert!(matches!(
			&errors[..],
			[StreamEvent::Error(ErrorEvent::Exception { message })] if message.contains("invalid stream URL")
		));
	}

	#[test]
	fn test_factory_failure_dispatches_exception() {
		let h = harness();
		h.factory.fail.store(true, Ordering::SeqCst);
		h.scheduler.run_all();

		assert_eq!(h.source.status(), ConnectionStatus::Error);
		let errors = h.hooks.errors.lock().unwrap();
		assert_eq!(
			*errors,
			vec![ErrorEvent::Exception {
				message: "transport unavailable: offline".to_string()
			}]
		);
		// Construction failures do not loop.
		assert_eq!(h.scheduler.pending(), 0);
	}

	#[test]
	fn test_close_is_idempotent() {
		let h = connected();
		let closes = collect(&h.source, EventKind::Close);

		h.source.close();
		h.source.close();

		assert_eq!(h.source.status(), ConnectionStatus::Closed);
		assert_eq!(closes.lock().unwrap().len(), 1);
		assert_eq!(h.factory.closes(), 1);
	}

	#[test]
	fn test_close_cancels_pending_reconnect() {
		let h = connected();
		h.factory
			.handler()
			.on_error(TransportFailure::closed("dropped", 0));
		assert_eq!(h.scheduler.pending(), 1);

		h.source.close();
		assert_eq!(h.scheduler.pending(), 0);
		h.scheduler.run_all();
		assert_eq!(h.factory.connects(), 1);
	}

	#[test]
	fn test_stale_transport_reactions_ignored() {
		let h = connected();
		let stale = h.factory.handler();
		h.source.open();
		let messages = collect(&h.source, EventKind::Message);

		stale.on_message("data: late\n\n");
		stale.on_error(TransportFailure::closed("late", 0));

		assert!(messages.lock().unwrap().is_empty());
		assert_eq!(h.source.status(), ConnectionStatus::Connecting);
		assert_eq!(h.scheduler.pending(), 0);
	}

	#[test]
	fn test_close_from_error_listener_stops_reconnect() {
		let h = connected();
		let source = h.source.clone();
		h.source
			.add_event_listener(EventKind::Error, listener(move |_| source.close()));

		h.factory
			.handler()
			.on_error(TransportFailure::closed("dropped", 0));

		assert_eq!(h.source.status(), ConnectionStatus::Closed);
		assert_eq!(h.scheduler.pending(), 0);
	}

	#[test]
	fn test_reopen_from_open_listener_does_not_deadlock() {
		let h = connected();
		let source = h.source.clone();
		let reopened = Arc::new(AtomicBool::new(false));
		let flag = Arc::clone(&reopened);
		h.source.add_event_listener(
			EventKind::Open,
			listener(move |_| {
				if !flag.swap(true, Ordering::SeqCst) {
					source.open();
				}
			}),
		);

		h.factory.handler().on_open();
		assert!(reopened.load(Ordering::SeqCst));
		assert_eq!(h.source.status(), ConnectionStatus::Connecting);
		assert_eq!(h.factory.connects(), 2);
	}

	#[test]
	fn test_retry_count_grows_between_opens() {
		let h = connected();
		for expected in 1..=3 {
			h.factory
				.handler()
				.on_error(TransportFailure::closed("dropped", 0));
			assert_eq!(h.source.retry_count(), expected);
			h.scheduler.run_all();
		}
		h.factory.handler().on_open();
		assert_eq!(h.source.retry_count(), 0);
	}

	#[test]
	fn test_remove_all_event_listeners_unknown_type() {
		let h = harness();
		let err = h
			.source
			.remove_all_event_listeners(Some(EventKind::from("patch")))
			.unwrap_err();
		assert!(matches!(err, StreamError::UnsupportedEventType(_)));
	}

	#[test]
	fn test_add_remove_listener_through_source() {
		let h = harness();
		let l = listener(|_| {});
		h.source.add_event_listener("message", Arc::clone(&l));
		assert_eq!(h.source.listener_count("message"), 1);

		h.source.remove_event_listener("message", &l);
		assert_eq!(h.source.listener_count("message"), 0);

		h.source.add_event_listener("message", l);
		h.source.remove_all_event_listeners(None).unwrap();
		assert_eq!(h.source.listener_count("message"), 0);
	}

	#[test]
	fn test_dispatch_reaches_listeners() {
		let h = harness();
		let opens = collect(&h.source, EventKind::Open);
		h.source.dispatch(&StreamEvent::Open);
		assert_eq!(*opens.lock().unwrap(), vec![StreamEvent::Open]);
	}

	#[test]
	fn test_dropping_last_handle_closes_transport() {
		let h = connected();
		let factory = Arc::clone(&h.factory);
		drop(h);
		assert_eq!(factory.closes(), 1);
	}

	#[test]
	fn test_builder_rejects_invalid_config() {
		let result = EventSource::builder(URL)
			.transport_factory(Arc::new(MockFactory::default()))
			.scheduler(Arc::new(ManualScheduler::new()))
			.jitter_ratio(2.0)
			.build();
		assert!(matches!(result, Err(StreamError::InvalidConfig(_))));
	}
}
