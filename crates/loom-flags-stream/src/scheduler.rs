// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delayed task scheduling.
//!
//! Reconnect and debounce timers go through [`Scheduler`] so hosts can pick a
//! runtime and tests can drive a virtual clock with [`ManualScheduler`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::error::{Result, StreamError};

/// Work to run when a timer fires.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cancels a scheduled task. Cancelling after the task ran is a no-op.
pub trait TimerHandle: Send + Sync {
	fn cancel(&self);
}

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync {
	fn schedule(&self, delay: Duration, task: Task) -> Box<dyn TimerHandle>;
}

/// Shared scheduler handle.
pub type SharedScheduler = Arc<dyn Scheduler>;

/// Scheduler that spawns a sleeping task on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
	handle: Handle,
}

impl TokioScheduler {
	pub fn new(handle: Handle) -> Self {
		Self { handle }
	}

	/// Uses the runtime the caller is running on.
	pub fn current() -> Result<Self> {
		Handle::try_current()
			.map(Self::new)
			.map_err(|e| StreamError::InvalidConfig(format!("no tokio runtime available: {e}")))
	}
}

struct TokioTimer(AbortHandle);

impl TimerHandle for TokioTimer {
	fn cancel(&self) {
		self.0.abort();
	}
}

impl Scheduler for TokioScheduler {
	fn schedule(&self, delay: Duration, task: Task) -> Box<dyn TimerHandle> {
		let join = self.handle.spawn(async move {
			tokio::time::sleep(delay).await;
			task();
		});
		Box::new(TokioTimer(join.abort_handle()))
	}
}

/// Upper bound on timers fired by one [`ManualScheduler::run_all`] call.
pub const MAX_RUN_ALL: usize = 10_000;

#[derive(Default)]
struct ManualState {
	now: Duration,
	next_id: u64,
	timers: BTreeMap<(Duration, u64), Task>,
}

/// Virtual-time scheduler. Nothing runs until the clock is advanced.
#[derive(Clone, Default)]
pub struct ManualScheduler {
	state: Arc<Mutex<ManualState>>,
}

struct ManualTimer {
	key: (Duration, u64),
	state: Weak<Mutex<ManualState>>,
}

impl TimerHandle for ManualTimer {
	fn cancel(&self) {
		if let Some(state) = self.state.upgrade() {
			let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
			state.timers.remove(&self.key);
		}
	}
}

impl ManualScheduler {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, ManualState> {
		self.state.lock().unwrap_or_else(|p| p.into_inner())
	}

	/// Virtual time elapsed since creation.
	pub fn now(&self) -> Duration {
		self.lock().now
	}

	/// Number of timers waiting to fire.
	pub fn pending(&self) -> usize {
		self.lock().timers.len()
	}

	/// Deadline of the earliest pending timer.
	pub fn next_deadline(&self) -> Option<Duration> {
		self.lock().timers.keys().next().map(|(deadline, _)| *deadline)
	}

	/// Fires the earliest timer whose deadline is at or before `limit`.
	fn fire_next(&self, limit: Option<Duration>) -> bool {
		let task = {
			let mut state = self.lock();
			let Some(&key) = state.timers.keys().next() else {
				return false;
			};
			if limit.is_some_and(|limit| key.0 > limit) {
				return false;
			}
			state.now = state.now.max(key.0);
			state.timers.remove(&key)
		};
		if let Some(task) = task {
			task();
		}
		true
	}

	/// Moves the clock forward by `by`, firing due timers in deadline order.
	/// Returns the number of timers fired.
	pub fn advance(&self, by: Duration) -> usize {
		let target = self.now() + by;
		let mut fired = 0;
		while self.fire_next(Some(target)) {
			fired += 1;
		}
		self.lock().now = target;
		fired
	}

	/// Fires timers until none remain, or [`MAX_RUN_ALL`] have fired.
	pub fn run_all(&self) -> usize {
		let mut fired = 0;
		while fired < MAX_RUN_ALL && self.fire_next(None) {
			fired += 1;
		}
		fired
	}
}

impl Scheduler for ManualScheduler {
	fn schedule(&self, delay: Duration, task: Task) -> Box<dyn TimerHandle> {
		let mut state = self.lock();
		let key = (state.now + delay, state.next_id);
		state.next_id += 1;
		state.timers.insert(key, task);
		Box::new(ManualTimer {
			key,
			state: Arc::downgrade(&self.state),
		})
	}
}

impl std::fmt::Debug for ManualScheduler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.lock();
		f.debug_struct("ManualScheduler")
			.field("now", &state.now)
			.field("pending", &state.timers.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn push(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Task {
		let log = Arc::clone(log);
		Box::new(move || log.lock().unwrap().push(name))
	}

	#[test]
	fn test_manual_fires_in_deadline_order() {
		let scheduler = ManualScheduler::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		scheduler.schedule(Duration::from_millis(300), push(&log, "late"));
		scheduler.schedule(Duration::from_millis(100), push(&log, "early"));
		scheduler.schedule(Duration::from_millis(100), push(&log, "early-second"));

		assert_eq!(scheduler.advance(Duration::from_millis(150)), 2);
		assert_eq!(*log.lock().unwrap(), vec!["early", "early-second"]);
		assert_eq!(scheduler.now(), Duration::from_millis(150));

		assert_eq!(scheduler.run_all(), 1);
		assert_eq!(scheduler.now(), Duration::from_millis(300));
	}

	#[test]
	fn test_manual_cancel_prevents_firing() {
		let scheduler = ManualScheduler::new();
		let fired = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&fired);
		let handle = scheduler.schedule(
			Duration::ZERO,
			Box::new(move || {
				counter.fetch_add(1, Ordering::SeqCst);
			}),
		);

		handle.cancel();
		assert_eq!(scheduler.pending(), 0);
		assert_eq!(scheduler.run_all(), 0);
		assert_eq!(fired.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn test_manual_task_can_schedule_more_work() {
		let scheduler = ManualScheduler::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let inner_scheduler = scheduler.clone();
		let inner_log = Arc::clone(&log);
		scheduler.schedule(
			Duration::from_millis(10),
			Box::new(move || {
				inner_log.lock().unwrap().push("outer");
				inner_scheduler.schedule(Duration::from_millis(10), push(&inner_log, "inner"));
			}),
		);

		assert_eq!(scheduler.advance(Duration::from_millis(25)), 2);
		assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
	}

	#[test]
	fn test_run_all_stops_runaway_loops() {
		fn reschedule(scheduler: ManualScheduler) {
			let next = scheduler.clone();
			scheduler.schedule(Duration::from_millis(1), Box::new(move || reschedule(next)));
		}

		let scheduler = ManualScheduler::new();
		reschedule(scheduler.clone());
		assert_eq!(scheduler.run_all(), MAX_RUN_ALL);
	}

	#[tokio::test(start_paused = true)]
	async fn test_tokio_scheduler_fires_after_delay() {
		let scheduler = TokioScheduler::current().unwrap();
		let (tx, rx) = tokio::sync::oneshot::channel();
		scheduler.schedule(
			Duration::from_secs(5),
			Box::new(move || {
				let _ = tx.send(());
			}),
		);

		tokio::time::timeout(Duration::from_secs(6), rx)
			.await
			.expect("timer should fire")
			.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn test_tokio_scheduler_cancel() {
		let scheduler = TokioScheduler::current().unwrap();
		let (tx, rx) = tokio::sync::oneshot::channel::<()>();
		let handle = scheduler.schedule(
			Duration::from_secs(1),
			Box::new(move || {
				let _ = tx.send(());
			}),
		);
		handle.cancel();

		// Sender is dropped with the aborted task.
		assert!(rx.await.is_err());
	}
}
