// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! `loom-flags-tail`: print frames from a feature flags event stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use loom_flags_stream::{
	eval_stream_path, listener, EventKind, EventSource, StreamEvent, StreamSettings,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONTEXT: &str = r#"{"kind":"user","key":"anonymous"}"#;

/// Tail a Loom feature flags event stream
#[derive(Parser, Debug)]
#[command(name = "loom-flags-tail", version, about, long_about = None)]
struct Args {
	/// Stream URL, or the stream host when --client-side-id is given
	#[arg(env = "LOOM_FLAGS_STREAM_URL")]
	url: String,

	/// Client-side id; appends /eval/{id}/{context} to the URL
	#[arg(long, env = "LOOM_FLAGS_CLIENT_SIDE_ID")]
	client_side_id: Option<String>,

	/// Evaluation context as JSON
	#[arg(long, default_value = DEFAULT_CONTEXT)]
	context: String,

	/// Request header (repeatable: -H KEY=VALUE)
	#[arg(long = "header", short = 'H', value_name = "KEY=VALUE", value_parser = parse_header)]
	headers: Vec<(String, String)>,

	/// Event types to print besides `message` (repeatable)
	#[arg(long = "event", short = 'e', default_values_t = ["put".to_string(), "patch".to_string(), "delete".to_string()])]
	events: Vec<String>,

	/// HTTP statuses that stop reconnection (repeatable)
	#[arg(long = "no-retry-status", value_name = "STATUS")]
	no_retry_statuses: Vec<u16>,

	/// TOML file with retry and timeout settings
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Print frames as JSON lines
	#[arg(long)]
	json: bool,

	/// Log level
	#[arg(short, long, default_value = "info")]
	log_level: String,

	/// Output logs as JSON
	#[arg(long)]
	json_logs: bool,
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
	let (name, value) = raw
		.split_once('=')
		.ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
	let name = name.trim();
	if name.is_empty() {
		return Err(format!("header name is empty in '{raw}'"));
	}
	Ok((name.to_string(), value.trim().to_string()))
}

fn stream_url(base: &str, client_side_id: Option<&str>, context: &str) -> Result<String> {
	let Some(id) = client_side_id else {
		return Ok(base.to_string());
	};
	let context: serde_json::Value =
		serde_json::from_str(context).context("--context must be valid JSON")?;
	let base = url::Url::parse(base).with_context(|| format!("invalid stream URL '{base}'"))?;
	let path = eval_stream_path(id, &context);
	Ok(format!("{}{}", base.as_str().trim_end_matches('/'), path))
}

fn load_settings(path: Option<&Path>) -> Result<StreamSettings> {
	let Some(path) = path else {
		return Ok(StreamSettings::default());
	};
	let raw = std::fs::read_to_string(path)
		.with_context(|| format!("failed to read config file {}", path.display()))?;
	toml::from_str(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}

fn init_tracing(level: &str, json: bool) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(format!("loom_flags_stream={level},loom_flags_tail={level}")));

	if json {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().json().with_writer(std::io::stderr))
			.init();
	} else {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().compact().with_writer(std::io::stderr))
			.init();
	}
}

fn print_event(event: &StreamEvent, json: bool) {
	let Some(frame) = event.as_frame() else {
		return;
	};
	if json {
		match serde_json::to_string(frame) {
			Ok(line) => println!("{line}"),
			Err(e) => warn!(error = %e, "Failed to serialize frame"),
		}
	} else {
		println!("{}: {}", frame.event_type, frame.data);
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	init_tracing(&args.log_level, args.json_logs);

	let settings = load_settings(args.config.as_deref())?;
	let url = stream_url(&args.url, args.client_side_id.as_deref(), &args.context)?;

	let mut builder = EventSource::builder(&url).settings(&settings);
	for (name, value) in args.headers {
		builder = builder.header(name, value);
	}
	if !args.no_retry_statuses.is_empty() {
		let stop_on = args.no_retry_statuses;
		builder = builder.retry_decision(move |ctx| !stop_on.contains(&ctx.status));
	}
	let source = builder.build().context("failed to create event source")?;

	let json = args.json;
	let printer = listener(move |event| print_event(event, json));
	source.add_event_listener(EventKind::Message, Arc::clone(&printer));
	for event_type in &args.events {
		source.add_event_listener(event_type.as_str(), Arc::clone(&printer));
	}
	source.add_event_listener(
		EventKind::Error,
		listener(|event| {
			if let StreamEvent::Error(error) = event {
				warn!(error = %error.message(), "Stream error");
			}
		}),
	);

	info!(url = %url, "Tailing event stream, press Ctrl-C to stop");
	tokio::signal::ctrl_c()
		.await
		.context("failed to listen for Ctrl-C")?;

	source.close();
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn test_parse_header() {
		assert_eq!(
			parse_header("Authorization=client-side-id").unwrap(),
			("Authorization".to_string(), "client-side-id".to_string())
		);
		assert_eq!(
			parse_header("X-Token = a=b").unwrap(),
			("X-Token".to_string(), "a=b".to_string())
		);
		assert!(parse_header("no-separator").is_err());
		assert!(parse_header("=value").is_err());
	}

	#[test]
	fn test_stream_url_without_client_side_id() {
		let url = stream_url("https://stream.example.com/sse", None, "not json").unwrap();
		assert_eq!(url, "https://stream.example.com/sse");
	}

	#[test]
	fn test_stream_url_with_client_side_id() {
		let url = stream_url(
			"https://clientstream.example.com/",
			Some("abc"),
			r#""~~~""#,
		)
		.unwrap();
		assert_eq!(url, "https://clientstream.example.com/eval/abc/In5-fiI");
	}

	#[test]
	fn test_stream_url_rejects_bad_context() {
		assert!(stream_url("https://clientstream.example.com", Some("abc"), "{").is_err());
	}

	#[test]
	fn test_args_defaults() {
		let args = Args::try_parse_from(["loom-flags-tail", "https://stream.example.com"]).unwrap();
		assert_eq!(args.events, vec!["put", "patch", "delete"]);
		assert_eq!(args.log_level, "info");
		assert!(args.headers.is_empty());
		assert!(!args.json);
	}

	#[test]
	fn test_args_repeatable_flags() {
		let args = Args::try_parse_from([
			"loom-flags-tail",
			"https://stream.example.com",
			"-H",
			"Authorization=abc",
			"--no-retry-status",
			"401",
			"--no-retry-status",
			"403",
			"-e",
			"ping",
		])
		.unwrap();
		assert_eq!(
			args.headers,
			vec![("Authorization".to_string(), "abc".to_string())]
		);
		assert_eq!(args.no_retry_statuses, vec![401, 403]);
		assert_eq!(args.events, vec!["ping"]);
	}

	#[test]
	fn test_load_settings_defaults_without_file() {
		assert_eq!(load_settings(None).unwrap(), StreamSettings::default());
	}

	proptest! {
		#[test]
		fn prop_header_round_trips(name in "[A-Za-z][A-Za-z0-9-]{0,20}", value in "[a-z0-9=]{0,20}") {
			let (parsed_name, parsed_value) = parse_header(&format!("{name}={value}")).unwrap();
			prop_assert_eq!(parsed_name, name);
			prop_assert_eq!(parsed_value, value);
		}
	}
}
