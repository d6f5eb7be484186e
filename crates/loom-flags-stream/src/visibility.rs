// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Starts and stops a stream as the host moves between foreground and
//! background.
//!
//! Changes are debounced on the trailing edge. When the debounce timer fires
//! the controller reads the source's current value, so a flap that ends where
//! it started does nothing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::debug;

use crate::event_source::{ConnectionStatus, EventSource};
use crate::scheduler::{SharedScheduler, TimerHandle};

/// Foreground state reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
	Visible,
	Hidden,
}

/// Called when a visibility source may have changed.
pub type VisibilityCallback = Arc<dyn Fn() + Send + Sync>;

/// A two-valued signal the host can subscribe to.
pub trait VisibilitySource: Send + Sync {
	fn current(&self) -> Visibility;

	/// Registers `callback`; returns an id for [`unsubscribe`](Self::unsubscribe).
	fn subscribe(&self, callback: VisibilityCallback) -> u64;

	fn unsubscribe(&self, id: u64);
}

struct SignalState {
	value: Visibility,
	next_id: u64,
	subscribers: BTreeMap<u64, VisibilityCallback>,
}

/// Host-settable [`VisibilitySource`].
#[derive(Clone)]
pub struct VisibilitySignal {
	state: Arc<Mutex<SignalState>>,
}

impl VisibilitySignal {
	pub fn new(initial: Visibility) -> Self {
		Self {
			state: Arc::new(Mutex::new(SignalState {
				value: initial,
				next_id: 0,
				subscribers: BTreeMap::new(),
			})),
		}
	}

	fn lock(&self) -> MutexGuard<'_, SignalState> {
		self.state.lock().unwrap_or_else(|p| p.into_inner())
	}

	/// Updates the value and notifies subscribers when it changed.
	pub fn set(&self, value: Visibility) {
		let subscribers: Vec<VisibilityCallback> = {
			let mut state = self.lock();
			if state.value == value {
				return;
			}
			state.value = value;
			state.subscribers.values().cloned().collect()
		};

		for callback in subscribers {
			callback();
		}
	}

	pub fn subscriber_count(&self) -> usize {
		self.lock().subscribers.len()
	}
}

impl VisibilitySource for VisibilitySignal {
	fn current(&self) -> Visibility {
		self.lock().value
	}

	fn subscribe(&self, callback: VisibilityCallback) -> u64 {
		let mut state = self.lock();
		state.next_id += 1;
		let id = state.next_id;
		state.subscribers.insert(id, callback);
		id
	}

	fn unsubscribe(&self, id: u64) {
		self.lock().subscribers.remove(&id);
	}
}

impl std::fmt::Debug for VisibilitySignal {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.lock();
		f.debug_struct("VisibilitySignal")
			.field("value", &state.value)
			.field("subscribers", &state.subscribers.len())
			.finish()
	}
}

/// Something the controller can start and stop.
pub trait Streamer: Send + Sync {
	fn start(&self);

	fn stop(&self);

	fn status(&self) -> ConnectionStatus;
}

impl Streamer for EventSource {
	fn start(&self) {
		self.try_connect(true);
	}

	fn stop(&self) {
		self.close();
	}

	fn status(&self) -> ConnectionStatus {
		EventSource::status(self)
	}
}

struct ControllerState {
	last_known: Visibility,
	pending: Option<(u64, Box<dyn TimerHandle>)>,
	next_timer_id: u64,
}

struct Shared {
	source: Arc<dyn VisibilitySource>,
	streamer: Arc<dyn Streamer>,
	scheduler: SharedScheduler,
	debounce: Duration,
	state: Mutex<ControllerState>,
}

/// Drives a [`Streamer`] from a [`VisibilitySource`].
///
/// Dropping the controller unsubscribes from the source and cancels any
/// pending debounce.
pub struct VisibilityController {
	shared: Arc<Shared>,
	subscription: u64,
}

impl VisibilityController {
	pub fn new(
		source: Arc<dyn VisibilitySource>,
		streamer: Arc<dyn Streamer>,
		scheduler: SharedScheduler,
		debounce: Duration,
	) -> Self {
		let shared = Arc::new(Shared {
			state: Mutex::new(ControllerState {
				last_known: source.current(),
				pending: None,
				next_timer_id: 0,
			}),
			source,
			streamer,
			scheduler,
			debounce,
		});

		let weak = Arc::downgrade(&shared);
		let subscription = shared.source.subscribe(Arc::new(move || {
			if let Some(shared) = weak.upgrade() {
				shared.on_signal();
			}
		}));

		Self {
			shared,
			subscription,
		}
	}

	/// Visibility as of the last handled change.
	pub fn last_known(&self) -> Visibility {
		self.shared.lock().last_known
	}

	/// Reacts to `current` immediately, bypassing the debounce.
	pub fn handle_change(&self, current: Visibility) {
		self.shared.handle_change(current);
	}
}

impl Drop for VisibilityController {
	fn drop(&mut self) {
		self.shared.source.unsubscribe(self.subscription);
		if let Some((_, timer)) = self.shared.lock().pending.take() {
			timer.cancel();
		}
	}
}

impl std::fmt::Debug for VisibilityController {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("VisibilityController")
			.field("last_known", &self.last_known())
			.field("debounce", &self.shared.debounce)
			.finish()
	}
}

impl Shared {
	fn lock(&self) -> MutexGuard<'_, ControllerState> {
		self.state.lock().unwrap_or_else(|p| p.into_inner())
	}

	fn on_signal(self: &Arc<Self>) {
		if self.debounce.is_zero() {
			return self.handle_change(self.source.current());
		}

		let (timer_id, previous) = {
			let mut state = self.lock();
			state.next_timer_id += 1;
			(state.next_timer_id, state.pending.take())
		};
		if let Some((_, previous)) = previous {
			previous.cancel();
		}

		let weak = Arc::downgrade(self);
		let handle = self.scheduler.schedule(
			self.debounce,
			Box::new(move || {
				if let Some(shared) = weak.upgrade() {
					shared.on_debounced(timer_id);
				}
			}),
		);

		let stale = self.lock().pending.replace((timer_id, handle));
		if let Some((_, stale)) = stale {
			stale.cancel();
		}
	}

	fn on_debounced(&self, timer_id: u64) {
		{
			let mut state = self.lock();
			if state.pending.as_ref().is_some_and(|(id, _)| *id == timer_id) {
				state.pending = None;
			}
		}
		self.handle_change(self.source.current());
	}

	fn handle_change(&self, current: Visibility) {
		let previous = {
			let mut state = self.lock();
			std::mem::replace(&mut state.last_known, current)
		};
		debug!(visibility = ?current, "Visibility state changed");

		match (previous, current) {
			(Visibility::Hidden, Visibility::Visible) => {
				if self.streamer.status() == ConnectionStatus::Open {
					debug!("Not starting streamer because the stream is already open");
				} else {
					debug!("Starting streamer after becoming visible");
					self.streamer.start();
				}
			}
			(Visibility::Visible, Visibility::Hidden) => {
				debug!("Hidden, stopping streamer");
				self.streamer.stop();
			}
			_ => debug!("No action needed"),
		}
	}
}
