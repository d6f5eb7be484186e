// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Incremental parser for the `text/event-stream` wire format.
//!
//! Chunks arrive in arbitrary pieces. Each complete line is applied to the
//! [`ParserCursor`] once, as soon as its `\n` arrives; only the trailing
//! unterminated line stays buffered. A frame is emitted when its terminating
//! blank line has been received.

use tracing::debug;

use crate::event::{EventFrame, DEFAULT_EVENT_TYPE};

/// Parser progress for one connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParserCursor {
	/// Persists across frames and reconnects.
	pub last_event_id: Option<String>,
	/// Reset after each emitted frame.
	pub current_event_type: Option<String>,
	/// `data` lines seen since the last delimiter.
	pub pending_data_lines: Vec<String>,
	/// Byte offset into the retained buffer of the first unprocessed line.
	pub processed_offset: usize,
}

impl ParserCursor {
	fn apply_line(&mut self, raw: &str, source_url: &str, frames: &mut Vec<EventFrame>) {
		let line = raw.trim_matches(|c: char| c.is_whitespace() || c == '\u{a0}');

		if line.starts_with("event") {
			// An empty name falls back to the default type.
			let event_type = field_value(line, "event");
			self.current_event_type = (!event_type.is_empty()).then(|| event_type.to_string());
		} else if line.starts_with("retry") {
			if let Ok(retry_ms) = field_value(line, "retry").parse::<i64>() {
				// The client's own backoff policy decides reconnect timing.
				debug!(retry_ms, "Ignoring server reconnect hint");
			}
		} else if line.starts_with("data") {
			self.pending_data_lines.push(field_value(line, "data").to_string());
		} else if line.starts_with("id:") {
			self.last_event_id = Some(field_value(line, "id").to_string());
		} else if line == "id" {
			self.last_event_id = None;
		} else if line.is_empty() {
			if !self.pending_data_lines.is_empty() {
				let event_type = self
					.current_event_type
					.take()
					.unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string());
				frames.push(EventFrame {
					event_type,
					data: self.pending_data_lines.join("\n"),
					last_event_id: self.last_event_id.clone(),
					source_url: source_url.to_string(),
				});
				self.pending_data_lines.clear();
			}
		}
	}
}

/// Strips `name`, an optional `:` and leading whitespace from `line`.
fn field_value<'a>(line: &'a str, name: &str) -> &'a str {
	let rest = &line[name.len()..];
	rest.strip_prefix(':').unwrap_or(rest).trim_start()
}

/// Stateful frame parser owned by one event source.
#[derive(Debug, Clone)]
pub struct EventParser {
	source_url: String,
	buffer: String,
	cursor: ParserCursor,
}

impl EventParser {
	pub fn new(source_url: impl Into<String>) -> Self {
		Self {
			source_url: source_url.into(),
			buffer: String::new(),
			cursor: ParserCursor::default(),
		}
	}

	/// Appends `chunk` and returns the frames it completed, in wire order.
	pub fn push(&mut self, chunk: &str) -> Vec<EventFrame> {
		// The retained buffer holds no `\n`, so only the new text is searched.
		let searched = self.buffer.len();
		self.buffer.push_str(chunk);
		let frames = self.scan(searched);

		// Consumed text is never rescanned.
		self.buffer.drain(..self.cursor.processed_offset);
		self.cursor.processed_offset = 0;

		frames
	}

	fn scan(&mut self, searched: usize) -> Vec<EventFrame> {
		let mut frames = Vec::new();
		let mut line_start = self.cursor.processed_offset;

		for (index, _) in self.buffer[searched..].match_indices('\n') {
			let newline = searched + index;
			let raw = &self.buffer[line_start..newline];
			self.cursor.apply_line(raw, &self.source_url, &mut frames);
			line_start = newline + 1;
		}

		self.cursor.processed_offset = line_start;
		frames
	}

	/// Prepares for a fresh connection. The last event id survives so it can
	/// be sent when reconnecting.
	pub fn reset(&mut self) {
		self.buffer.clear();
		self.cursor.processed_offset = 0;
		self.cursor.pending_data_lines.clear();
		self.cursor.current_event_type = None;
	}

	pub fn cursor(&self) -> &ParserCursor {
		&self.cursor
	}

	pub fn last_event_id(&self) -> Option<&str> {
		self.cursor.last_event_id.as_deref()
	}

	/// Trailing text not yet terminated by `\n`.
	pub fn buffered(&self) -> &str {
		&self.buffer
	}

	pub fn source_url(&self) -> &str {
		&self.source_url
	}
}
