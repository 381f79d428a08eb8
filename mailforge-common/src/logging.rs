//! Logging over `tracing`.
//!
//! Protocol traffic is tagged with a `dir` field (`"<<"` client to server,
//! `">>"` server to client) under the `mailforge::wire` target, so a full
//! session transcript is one filter directive away; everything else goes to
//! `mailforge::server`. `LOG_LEVEL` accepts either a bare level (`info`,
//! `trace`, ...) or a full directive set (`warn,mailforge::wire=trace`).

use std::io::IsTerminal;

use tracing_subscriber::{EnvFilter, prelude::*};

/// Log a line received from the client.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::tracing::event!(
            target: "mailforge::wire",
            $crate::tracing::Level::$level,
            dir = "<<",
            $($arg)+
        )
    };

    ($($arg:tt)+) => {
        $crate::incoming!(level = TRACE, $($arg)+)
    };
}

/// Log a reply sent to the client.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::tracing::event!(
            target: "mailforge::wire",
            $crate::tracing::Level::$level,
            dir = ">>",
            $($arg)+
        )
    };

    ($($arg:tt)+) => {
        $crate::outgoing!(level = TRACE, $($arg)+)
    };
}

/// Log an internal engine event.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::tracing::event!(
            target: "mailforge::server",
            $crate::tracing::Level::$level,
            $($arg)+
        )
    };

    ($($arg:tt)+) => {
        $crate::internal!(level = TRACE, $($arg)+)
    };
}

/// Targets covered by the default directives: the macro targets above plus
/// every workspace crate, so third-party noise stays at `warn`.
const CRATE_TARGETS: [&str; 6] = [
    "mailforge",
    "mailforge_common",
    "mailforge_smtp",
    "mailforge_spam",
    "mailforge_relay",
    "mailforge_store",
];

fn default_filter() -> EnvFilter {
    let level = if cfg!(debug_assertions) { "trace" } else { "info" };

    let mut filter = EnvFilter::new("warn");
    for target in CRATE_TARGETS {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install the global subscriber. `LOG_LEVEL` overrides the defaults; an
/// unparseable value falls back to them rather than silencing everything.
pub fn init() {
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(default_filter);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(std::io::stdout().is_terminal())
                .with_target(true),
        )
        .with(filter)
        .init();
}

#[cfg(test)]
mod test {
    use super::default_filter;

    #[test]
    fn default_directives_parse() {
        // Construction must not silently drop directives
        let filter = default_filter();
        let rendered = filter.to_string();

        for target in super::CRATE_TARGETS {
            assert!(rendered.contains(target), "missing directive for {target}");
        }
    }
}
