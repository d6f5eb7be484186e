// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reconnect delay calculation with exponential backoff and jitter.
//!
//! The nominal delay doubles with every attempt up to [`MAX_RETRY_DELAY`].
//! Jitter then removes a random share of it so that many clients dropped by
//! the same outage do not reconnect in lockstep. With the default ratio of
//! 0.5 the final delay lies between 50% and 100% of the nominal delay.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Upper bound for the nominal reconnect delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Default share of the nominal delay that jitter may remove.
pub const DEFAULT_JITTER_RATIO: f64 = 0.5;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_INITIAL_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Source of uniformly distributed values in `[0, 1)`.
pub trait RandomSource: Send + Sync {
	fn next_f64(&self) -> f64;
}

/// Random source backed by `fastrand`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FastRandom;

impl RandomSource for FastRandom {
	fn next_f64(&self) -> f64 {
		fastrand::f64()
	}
}

/// Replays a fixed sequence of values, then yields `0.0` (no jitter).
#[derive(Debug, Default)]
pub struct SequenceRandom {
	values: Mutex<VecDeque<f64>>,
}

impl SequenceRandom {
	pub fn new(values: impl IntoIterator<Item = f64>) -> Self {
		Self {
			values: Mutex::new(values.into_iter().collect()),
		}
	}
}

impl RandomSource for SequenceRandom {
	fn next_f64(&self) -> f64 {
		self.values
			.lock()
			.ok()
			.and_then(|mut values| values.pop_front())
			.unwrap_or(0.0)
	}
}

/// Nominal delay for `retry_count`: `min(base * 2^retry_count, 30s)`.
pub fn backoff(base: Duration, retry_count: u32) -> Duration {
	capped_backoff(base, retry_count, MAX_RETRY_DELAY)
}

/// Same as [`backoff`] with a caller-chosen ceiling.
pub fn capped_backoff(base: Duration, retry_count: u32, max_delay: Duration) -> Duration {
	let base_ms = duration_millis(base);
	let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
	let delay_ms = base_ms.saturating_mul(factor);
	Duration::from_millis(delay_ms.min(duration_millis(max_delay)))
}

/// Removes `floor(random * ratio * delay)` milliseconds from `delay`.
pub fn jitter(delay: Duration, ratio: f64, random: &dyn RandomSource) -> Duration {
	let delay_ms = duration_millis(delay) as f64;
	let reduction = (random.next_f64() * ratio * delay_ms).trunc();
	Duration::from_millis((delay_ms - reduction).max(0.0) as u64)
}

fn duration_millis(duration: Duration) -> u64 {
	u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Reconnect bookkeeping owned by a single event source.
#[derive(Debug, Clone)]
pub struct RetryState {
	retry_count: u32,
	initial_delay: Duration,
	max_delay: Duration,
	jitter_ratio: f64,
}

impl RetryState {
	pub fn new(initial_delay: Duration, max_delay: Duration, jitter_ratio: f64) -> Self {
		Self {
			retry_count: 0,
			initial_delay,
			max_delay,
			jitter_ratio,
		}
	}

	/// Number of reconnect attempts scheduled since the last successful open.
	pub fn retry_count(&self) -> u32 {
		self.retry_count
	}

	/// Called when a connection opens.
	pub fn reset(&mut self) {
		self.retry_count = 0;
	}

	/// Computes the jittered delay for the current attempt and advances the count.
	///
	/// Only the reconnect scheduler should call this; every call consumes an
	/// attempt.
	pub fn next_retry_delay(&mut self, random: &dyn RandomSource) -> Duration {
		let nominal = capped_backoff(self.initial_delay, self.retry_count, self.max_delay);
		let delay = jitter(nominal, self.jitter_ratio, random);
		self.retry_count = self.retry_count.saturating_add(1);
		delay
	}
}

impl Default for RetryState {
	fn default() -> Self {
		Self::new(
			DEFAULT_INITIAL_RETRY_DELAY,
			MAX_RETRY_DELAY,
			DEFAULT_JITTER_RATIO,
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	fn ms(value: u64) -> Duration {
		Duration::from_millis(value)
	}

	#[test]
	fn test_backoff_doubles() {
		assert_eq!(backoff(ms(1000), 0), ms(1000));
		assert_eq!(backoff(ms(1000), 1), ms(2000));
		assert_eq!(backoff(ms(1000), 2), ms(4000));
	}

	#[test]
	fn test_backoff_returns_max_delay() {
		assert_eq!(backoff(ms(1000), 5), ms(30_000));
		assert_eq!(backoff(ms(1000), u32::MAX), ms(30_000));
	}

	#[test]
	fn test_jitter_with_fixed_randomness() {
		let random = SequenceRandom::new([0.888, 0.999]);
		assert_eq!(jitter(ms(1000), DEFAULT_JITTER_RATIO, &random), ms(556));
		assert_eq!(jitter(ms(2000), DEFAULT_JITTER_RATIO, &random), ms(1001));
	}

	#[test]
	fn test_sequence_random_exhausted_yields_zero() {
		let random = SequenceRandom::new([0.25]);
		assert_eq!(random.next_f64(), 0.25);
		assert_eq!(random.next_f64(), 0.0);
		assert_eq!(jitter(ms(800), DEFAULT_JITTER_RATIO, &random), ms(800));
	}

	#[test]
	fn test_next_retry_delay_advances_count() {
		let random = SequenceRandom::new([0.888, 0.999]);
		let mut state = RetryState::default();

		let first = state.next_retry_delay(&random);
		let second = state.next_retry_delay(&random);

		assert_eq!(state.retry_count(), 2);
		assert_eq!(first, ms(556));
		assert_eq!(second, ms(1001));
	}

	#[test]
	fn test_reset_clears_count() {
		let mut state = RetryState::default();
		state.next_retry_delay(&FastRandom);
		state.next_retry_delay(&FastRandom);
		state.reset();
		assert_eq!(state.retry_count(), 0);
	}

	#[test]
	fn test_custom_max_delay() {
		let mut state = RetryState::new(ms(500), ms(1500), 0.0);
		let delays: Vec<_> = (0..4).map(|_| state.next_retry_delay(&FastRandom)).collect();
		assert_eq!(delays, vec![ms(500), ms(1000), ms(1500), ms(1500)]);
	}

	proptest! {
		#[test]
		fn backoff_matches_capped_doubling(base_ms in 1u64..10_000, retry_count in 0u32..20) {
			let expected = (base_ms * 2u64.pow(retry_count)).min(30_000);
			prop_assert_eq!(backoff(ms(base_ms), retry_count), ms(expected));
		}

		#[test]
		fn jitter_stays_within_half_and_full_delay(delay_ms in 1u64..60_000, r in 0.0f64..1.0) {
			let random = SequenceRandom::new([r]);
			let jittered = jitter(ms(delay_ms), DEFAULT_JITTER_RATIO, &random);
			prop_assert!(jittered <= ms(delay_ms));
			prop_assert!(jittered.as_millis() as f64 >= 0.5 * delay_ms as f64);
		}

		#[test]
		fn retry_count_is_monotonic(calls in 1usize..40) {
			let mut state = RetryState::default();
			let mut previous = state.retry_count();
			for _ in 0..calls {
				state.next_retry_delay(&FastRandom);
				prop_assert!(state.retry_count() > previous);
				previous = state.retry_count();
			}
		}
	}
}
