//! Terse log lines for interactive use: `warning: message key=value`

use owo_colors::OwoColorize as _;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

pub struct CompactFormatter;

impl<S, N> FormatEvent<S, N> for CompactFormatter
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
        let label = match *event.metadata().level() {
            Level::ERROR => Some("error:"),
            Level::WARN => Some("warning:"),
            Level::INFO => None,
            Level::DEBUG => Some("debug:"),
            Level::TRACE => Some("trace:"),
        };

        if let Some(label) = label {
            if writer.has_ansi_escapes() {
                match *event.metadata().level() {
                    Level::ERROR => write!(writer, "{} ", label.red().bold())?,
                    Level::WARN => write!(writer, "{} ", label.yellow().bold())?,
                    _ => write!(writer, "{} ", label.dimmed())?,
                }
            } else {
                write!(writer, "{} ", label)?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
