//! linkfront/src/logging.rs
//! Logging initialization: severity-colored stderr, or append-mode file.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

/// Line format with the whole line colored by severity: red for errors,
/// yellow for warnings, white for info. File output drops the color.
struct SeverityColorFormat {
    ansi: bool,
}

impl SeverityColorFormat {
    fn color(level: &Level) -> &'static str {
        if *level == Level::ERROR {
            "\x1b[31m"
        } else if *level == Level::WARN {
            "\x1b[33m"
        } else if *level == Level::INFO {
            "\x1b[37m"
        } else if *level == Level::DEBUG {
            "\x1b[34m"
        } else {
            "\x1b[35m"
        }
    }
}

impl<S, N> FormatEvent<S, N> for SeverityColorFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        if self.ansi {
            write!(writer, "{}", Self::color(metadata.level()))?;
        }
        write!(writer, "[")?;
        SystemTime.format_time(&mut writer)?;
        write!(writer, "]-[{}]-[{}]: ", metadata.level(), metadata.target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        if self.ansi {
            write!(writer, "\x1b[0m")?;
        }
        writeln!(writer)
    }
}

/// Installs the global subscriber. With an output path, lines are appended
/// to the file without color; otherwise they go to stderr with ANSI color
/// per level. The filter honours `RUST_LOG` and defaults to `info`.
pub fn init(output: Option<&Path>) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let install = match output {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .event_format(SeverityColorFormat { ansi: false })
                        .with_writer(Arc::new(file)),
                )
                .try_init()
        }
        None => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(SeverityColorFormat { ansi: true })
                    .with_writer(io::stderr),
            )
            .try_init(),
    };
    install.map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}
