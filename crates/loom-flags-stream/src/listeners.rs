// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Listener registry and synchronous fan-out dispatch.
//!
//! Listeners are kept per [`EventKind`] in registration order. Dispatch
//! snapshots the sequence before invoking it, so a listener may register or
//! remove listeners, or open and close the event source, without deadlocking.
//!
//! After user listeners run, the matching [`LifecycleHooks`] method fires.
//! Hooks are separate from the registry and cannot be removed.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::event::{ErrorEvent, EventKind, RetryEvent, StreamEvent};

/// A registered callback. Identity (for removal) is the shared allocation.
pub type Listener = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Wraps a closure as a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
	F: Fn(&StreamEvent) + Send + Sync + 'static,
{
	Arc::new(f)
}

/// Fixed reactions invoked after listeners on every lifecycle dispatch.
pub trait LifecycleHooks: Send + Sync {
	fn on_open(&self) {}

	fn on_close(&self) {}

	fn on_error(&self, _error: &ErrorEvent) {}

	fn on_retrying(&self, _retry: &RetryEvent) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpLifecycleHooks;

impl LifecycleHooks for NoOpLifecycleHooks {}

/// Shared hooks handle.
pub type SharedLifecycleHooks = Arc<dyn LifecycleHooks>;

/// Ordered listener sequences keyed by event kind.
#[derive(Clone)]
pub struct ListenerRegistry {
	table: BTreeMap<EventKind, Vec<Listener>>,
}

impl ListenerRegistry {
	pub fn new() -> Self {
		let table = EventKind::BUILT_IN
			.into_iter()
			.map(|kind| (kind, Vec::new()))
			.collect();
		Self { table }
	}

	/// Appends `listener`; adding the same listener twice makes it fire twice.
	pub fn add(&mut self, kind: EventKind, listener: Listener) {
		self.table.entry(kind).or_default().push(listener);
	}

	/// Removes every occurrence of `listener` from `kind`.
	pub fn remove(&mut self, kind: &EventKind, listener: &Listener) {
		if let Some(listeners) = self.table.get_mut(kind) {
			listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
		}
	}

	/// Clears one kind, or every kind when `kind` is `None`.
	pub fn remove_all(&mut self, kind: Option<&EventKind>) -> Result<()> {
		match kind {
			None => {
				self.table.values_mut().for_each(Vec::clear);
				Ok(())
			}
			Some(kind) => match self.table.get_mut(kind) {
				Some(listeners) => {
					listeners.clear();
					Ok(())
				}
				None => Err(StreamError::UnsupportedEventType(kind.to_string())),
			},
		}
	}

	/// Snapshot of the listeners for `kind`.
	pub fn listeners(&self, kind: &EventKind) -> Vec<Listener> {
		self.table.get(kind).cloned().unwrap_or_default()
	}

	pub fn contains(&self, kind: &EventKind, listener: &Listener) -> bool {
		self.table
			.get(kind)
			.is_some_and(|listeners| listeners.iter().any(|l| Arc::ptr_eq(l, listener)))
	}

	pub fn len(&self, kind: &EventKind) -> usize {
		self.table.get(kind).map_or(0, Vec::len)
	}

	/// Kinds present in the table.
	pub fn kinds(&self) -> impl Iterator<Item = &EventKind> {
		self.table.keys()
	}
}

impl Default for ListenerRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for ListenerRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let mut map = f.debug_map();
		for (kind, listeners) in &self.table {
			map.entry(&kind.as_str(), &listeners.len());
		}
		map.finish()
	}
}

/// Registry plus hooks; the dispatch half of an event source.
pub(crate) struct Dispatcher {
	registry: Mutex<ListenerRegistry>,
	hooks: SharedLifecycleHooks,
}

impl Dispatcher {
	pub(crate) fn new(hooks: SharedLifecycleHooks) -> Self {
		Self {
			registry: Mutex::new(ListenerRegistry::new()),
			hooks,
		}
	}

	pub(crate) fn registry(&self) -> MutexGuard<'_, ListenerRegistry> {
		self.registry
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	pub(crate) fn dispatch(&self, event: &StreamEvent) {
		let kind = event.kind();
		let listeners = self.registry().listeners(&kind);

		for listener in listeners {
			if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
				warn!(event_type = %kind, "Listener panicked during dispatch");
			}
		}

		match event {
			StreamEvent::Open => self.hooks.on_open(),
			StreamEvent::Close => self.hooks.on_close(),
			StreamEvent::Error(error) => {
				debug!(error = ?error, "Dispatching error event");
				self.hooks.on_error(error);
			}
			StreamEvent::Retry(retry) => self.hooks.on_retrying(retry),
			StreamEvent::Message(_) => {}
		}
	}
}
