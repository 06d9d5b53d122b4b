//! Log setup for the courier processes.
//!
//! Events keep their module path as the target, so filtering is per crate.
//! Peer traffic carries a `direction` field (`outgoing` or `incoming`) and
//! defaults to TRACE; everything else is tagged `internal`.
//!
//! `LOG_LEVEL` sets the level for every courier crate. `COURIER_LOG` takes
//! comma separated `target=level` overrides on top, e.g.
//! `courier_smtp=trace,courier_delivery::dns=debug`. Events from other crates
//! (sqlx, hyper, rustls) are never emitted.

use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::Targets, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

/// Crates whose events are emitted.
pub const TARGETS: [&str; 5] = [
    "courier",
    "courier_common",
    "courier_delivery",
    "courier_metrics",
    "courier_smtp",
];

const LEVEL_VAR: &str = "LOG_LEVEL";
const OVERRIDES_VAR: &str = "COURIER_LOG";

#[doc(hidden)]
#[macro_export]
macro_rules! tagged {
    ($level:expr, $direction:literal, $($msg:tt)*) => {
        $crate::tracing::event!($level, direction = $direction, $($msg)*)
    };
}

/// Traffic written to a remote peer (SMTP commands, HTTP requests).
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::tagged!($crate::tracing::Level::$level, "outgoing", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::outgoing!(level = TRACE, $($msg)*)
    };
}

/// Traffic read back from a remote peer.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::tagged!($crate::tracing::Level::$level, "incoming", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::incoming!(level = TRACE, $($msg)*)
    };
}

/// Worker lifecycle and bookkeeping.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::tagged!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

fn parse_level(value: Option<&str>, default: LevelFilter) -> LevelFilter {
    value.map_or(default, |level| {
        LevelFilter::from_str(level).unwrap_or_else(|_| {
            eprintln!("Invalid {LEVEL_VAR} {level}, defaulting to {default}");
            default
        })
    })
}

/// Every courier crate at `level`, then the `overrides` directives that name
/// a courier target. Directives for other crates are dropped.
#[must_use]
pub fn filter(level: LevelFilter, overrides: Option<&str>) -> Targets {
    let mut targets = TARGETS
        .iter()
        .fold(Targets::new(), |targets, target| targets.with_target(*target, level));

    let Some(overrides) = overrides.filter(|overrides| !overrides.trim().is_empty()) else {
        return targets;
    };

    match overrides.parse::<Targets>() {
        Ok(parsed) => {
            for (target, level) in &parsed {
                if is_courier_target(target) {
                    targets = targets.with_target(target, level);
                } else {
                    eprintln!("Ignoring {OVERRIDES_VAR} directive for {target}");
                }
            }
        }
        Err(err) => eprintln!("Invalid {OVERRIDES_VAR} ({err}), ignoring it"),
    }
    targets
}

fn is_courier_target(target: &str) -> bool {
    let krate = target.split("::").next().unwrap_or_default();
    TARGETS.contains(&krate)
}

/// Installs the global subscriber from `LOG_LEVEL` and `COURIER_LOG`.
///
/// Debug builds default to TRACE, release builds to INFO.
pub fn init() {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };
    let level = parse_level(std::env::var(LEVEL_VAR).ok().as_deref(), default);
    let overrides = std::env::var(OVERRIDES_VAR).ok();

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .with_thread_names(true)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(filter(level, overrides.as_deref())),
        )
        .init();
}
