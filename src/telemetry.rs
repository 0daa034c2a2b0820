//! Tracing setup shared by the API server and the standalone worker.
//!
//! Environment knobs:
//! - `RUST_LOG` wins when set; otherwise `AXUM_LOG_LEVEL` picks the base
//!   level (default `debug`) and sqlx statements are held at `warn`.
//! - `AXUM_SPAN_EVENTS`: `full`, `enter_exit`, anything else means close
//!   events only.
//! - `FORCE_COLOR`: `1|true|yes` or `0|false|no`; unset auto-detects a TTY.

use std::env;

use is_terminal::IsTerminal;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

// ---

/// Install the global fmt subscriber. Call once, before the first event.
pub fn init_tracing() {
    // ---
    let env_filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(default_directives(env::var("AXUM_LOG_LEVEL").ok().as_deref())),
    };

    let ansi = forced_color(env::var("FORCE_COLOR").ok().as_deref())
        .unwrap_or_else(|| std::io::stdout().is_terminal());

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events(env::var("AXUM_SPAN_EVENTS").ok().as_deref()))
        .with_env_filter(env_filter)
        .with_ansi(ansi)
        .compact()
        .init();
}

fn span_events(mode: Option<&str>) -> FmtSpan {
    // ---
    match mode {
        Some("full") => FmtSpan::FULL,
        Some("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    }
}

/// `None` leaves the decision to TTY detection.
fn forced_color(value: Option<&str>) -> Option<bool> {
    // ---
    match value {
        Some("1" | "true" | "yes") => Some(true),
        Some("0" | "false" | "no") => Some(false),
        _ => None,
    }
}

/// Filter directives for an `AXUM_LOG_LEVEL` value.
fn default_directives(level: Option<&str>) -> String {
    // ---
    let level = match level {
        Some(l @ ("trace" | "debug" | "info" | "warn" | "error")) => l,
        _ => "debug",
    };
    format!("{level},sqlx::query=warn")
}
