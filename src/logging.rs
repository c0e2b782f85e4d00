use core::fmt::{self, Display, Write as _};

use serde::{Deserialize, Serialize};
use tracing::{metadata::LevelFilter, Event, Level, Subscriber};
use tracing_subscriber::{
    filter::FilterFn,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!(target: "unmta", $level, $span);
        let _enter = span.enter();

        $crate::tracing::event!(target: "unmta", $level, $($msg),*)
    }};
}

/// Log one line of the client->server dialog. Visible at the `smtp` level.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::incoming!(level = TRACE, $($msg),*)
    };
}

/// Log one line of the server->client dialog. Visible at the `smtp` level.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

/// The five logging levels, ordered by verbosity. `Smtp` additionally prints
/// the full client<->server dialog.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    #[default]
    Info = 2,
    Debug = 3,
    Smtp = 4,
}

impl LogLevel {
    #[must_use]
    pub const fn filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Smtp => LevelFilter::TRACE,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Smtp => "smtp",
        })
    }
}

/// Renders events as `[<level>]: <message>`, with `TRACE` shown as `smtp`.
struct LogFormat;

impl<S, N> FormatEvent<S, N> for LogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = match *event.metadata().level() {
            Level::ERROR => "error",
            Level::WARN => "warn",
            Level::INFO => "info",
            Level::DEBUG => "debug",
            Level::TRACE => "smtp",
        };

        write!(writer, "[{level}]: ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber at the configured level.
///
/// Repeated initialisation (e.g. from multiple tests in one process) is
/// ignored rather than treated as an error.
pub fn init(level: LogLevel) {
    let _ = tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(LogFormat)
                .with_filter(level.filter())
                .with_filter(FilterFn::new(|metadata| {
                    cfg!(debug_assertions) || metadata.target().starts_with("unmta")
                })),
        )
        .try_init();
}

#[cfg(test)]
mod test {
    use super::LogLevel;

    #[test]
    fn level_names() {
        assert_eq!(LogLevel::Error.to_string(), "error");
        assert_eq!(LogLevel::Smtp.to_string(), "smtp");
        assert_eq!(LogLevel::default().to_string(), "info");
    }

    #[test]
    fn level_order() {
        assert!(LogLevel::Error < LogLevel::Smtp);
        assert_eq!(LogLevel::Warn as u8, 1);
        assert_eq!(LogLevel::Smtp as u8, 4);
    }

    #[test]
    fn level_parses_from_config_strings() {
        for (name, level) in [
            ("error", LogLevel::Error),
            ("warn", LogLevel::Warn),
            ("info", LogLevel::Info),
            ("debug", LogLevel::Debug),
            ("smtp", LogLevel::Smtp),
        ] {
            let parsed: LogLevel = toml::Value::String(name.to_string()).try_into().unwrap();
            assert_eq!(parsed, level);
        }
    }
}
