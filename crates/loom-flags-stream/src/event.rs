// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event kinds and payloads dispatched by an [`EventSource`](crate::EventSource).
//!
//! Every dispatch carries a [`StreamEvent`]. Lifecycle kinds (`open`, `close`,
//! `error`, `retry`) have dedicated variants; every frame parsed off the wire
//! is a [`StreamEvent::Message`] keyed by the frame's own event type.
//!
//! Lifecycle listener tables only ever receive lifecycle payloads. A frame
//! whose `event:` name collides with a lifecycle kind, such as `event: error`,
//! is keyed as [`EventKind::Custom`] and does not fire lifecycle hooks.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Event type used when a frame carries no `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Key of a listener sequence in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
	Open,
	Message,
	Error,
	Close,
	Retry,
	/// A server-defined event type such as `put` or `patch`.
	Custom(String),
}

impl EventKind {
	/// Built-in kinds that always exist in a listener table.
	pub const BUILT_IN: [EventKind; 5] = [
		EventKind::Open,
		EventKind::Message,
		EventKind::Error,
		EventKind::Close,
		EventKind::Retry,
	];

	pub fn as_str(&self) -> &str {
		match self {
			EventKind::Open => "open",
			EventKind::Message => "message",
			EventKind::Error => "error",
			EventKind::Close => "close",
			EventKind::Retry => "retry",
			EventKind::Custom(name) => name,
		}
	}
}

impl From<&str> for EventKind {
	fn from(name: &str) -> Self {
		match name {
			"open" => EventKind::Open,
			"message" => EventKind::Message,
			"error" => EventKind::Error,
			"close" => EventKind::Close,
			"retry" => EventKind::Retry,
			other => EventKind::Custom(other.to_string()),
		}
	}
}

impl From<String> for EventKind {
	fn from(name: String) -> Self {
		EventKind::from(name.as_str())
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One complete protocol frame, delimited on the wire by a blank line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFrame {
	/// Value of the `event:` field, or `message`.
	pub event_type: String,
	/// All `data:` lines of the frame joined with `\n`.
	pub data: String,
	/// Most recent `id:` seen on the connection, if any.
	pub last_event_id: Option<String>,
	/// URL the event source was created for.
	pub source_url: String,
}

impl EventFrame {
	/// `Message` for the default type, otherwise `Custom`, even for names
	/// like `error` or `open`.
	pub fn kind(&self) -> EventKind {
		match self.event_type.as_str() {
			DEFAULT_EVENT_TYPE => EventKind::Message,
			other => EventKind::Custom(other.to_string()),
		}
	}
}

/// Readiness of the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
	Connecting,
	Open,
	Closed,
}

impl ReadyState {
	/// Numeric code matching the browser `EventSource.readyState` values.
	pub fn code(self) -> u16 {
		match self {
			ReadyState::Connecting => 0,
			ReadyState::Open => 1,
			ReadyState::Closed => 2,
		}
	}
}

/// Payload of an `error` dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorEvent {
	/// The transport reported a failure.
	Transport {
		message: String,
		/// HTTP status when known, `0` when the connection closed without one.
		status: u16,
		ready_state: ReadyState,
	},
	/// The connection could not be constructed at all.
	Exception { message: String },
}

impl ErrorEvent {
	pub fn message(&self) -> &str {
		match self {
			ErrorEvent::Transport { message, .. } | ErrorEvent::Exception { message } => message,
		}
	}
}

/// Payload of a `retry` dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryEvent {
	/// How long until the reconnect timer fires.
	pub delay: Duration,
}

impl RetryEvent {
	pub fn delay_millis(&self) -> u128 {
		self.delay.as_millis()
	}
}

/// Tagged union of everything an event source dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
	Open,
	Close,
	Message(EventFrame),
	Error(ErrorEvent),
	Retry(RetryEvent),
}

impl StreamEvent {
	/// Registry key this event is dispatched under.
	pub fn kind(&self) -> EventKind {
		match self {
			StreamEvent::Open => EventKind::Open,
			StreamEvent::Close => EventKind::Close,
			StreamEvent::Message(frame) => frame.kind(),
			StreamEvent::Error(_) => EventKind::Error,
			StreamEvent::Retry(_) => EventKind::Retry,
		}
	}

	pub fn as_frame(&self) -> Option<&EventFrame> {
		match self {
			StreamEvent::Message(frame) => Some(frame),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_event_kind_round_trips_names() {
		for kind in EventKind::BUILT_IN {
			assert_eq!(EventKind::from(kind.as_str()), kind);
		}
		assert_eq!(
			EventKind::from("put"),
			EventKind::Custom("put".to_string())
		);
	}

	#[test]
	fn test_frame_kind_follows_event_type() {
		let frame = EventFrame {
			event_type: "patch".to_string(),
			data: "{}".to_string(),
			last_event_id: None,
			source_url: "https://flags.example.com/eval".to_string(),
		};
		assert_eq!(frame.kind(), EventKind::Custom("patch".to_string()));

		let message = EventFrame {
			event_type: DEFAULT_EVENT_TYPE.to_string(),
			..frame
		};
		assert_eq!(StreamEvent::Message(message).kind(), EventKind::Message);
	}

	#[test]
	fn test_frames_never_use_lifecycle_kinds() {
		for name in ["open", "close", "error", "retry"] {
			let frame = EventFrame {
				event_type: name.to_string(),
				data: "boom".to_string(),
				last_event_id: None,
				source_url: "https://flags.example.com/eval".to_string(),
			};
			assert_eq!(frame.kind(), EventKind::Custom(name.to_string()));
			assert_eq!(
				StreamEvent::Message(frame).kind(),
				EventKind::Custom(name.to_string())
			);
		}
	}

	#[test]
	fn test_error_event_serializes_with_type_tag() {
		let event = ErrorEvent::Transport {
			message: "error".to_string(),
			status: 0,
			ready_state: ReadyState::Closed,
		};
		let json = serde_json::to_value(&event).unwrap();
		assert_eq!(json["type"], "transport");
		assert_eq!(json["ready_state"], "closed");
		assert_eq!(event.message(), "error");
	}

	#[test]
	fn test_ready_state_codes() {
		assert_eq!(ReadyState::Connecting.code(), 0);
		assert_eq!(ReadyState::Open.code(), 1);
		assert_eq!(ReadyState::Closed.code(), 2);
	}
}
