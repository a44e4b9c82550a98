// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for the extension.
//!
//! Lambda interleaves extension output with the function's own logs in CloudWatch, so every
//! line is prefixed to make it easy to filter:
//!
//! ```text
//! APM_EXTENSION | INFO | Extension listening for apm data on 127.0.0.1:8200
//! APM_EXTENSION | DEBUG | invocation{request_id=abc}: Flush started - Checking for agent data
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const LOG_PREFIX: &str = "APM_EXTENSION";

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "{LOG_PREFIX} | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Builds the filter for `log_level`, silencing the HTTP stack below it.
pub fn env_filter(log_level: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    EnvFilter::try_new(format!(
        "h2=off,hyper=off,hyper_util=off,reqwest=off,rustls=off,{log_level}"
    ))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(log_level: &str) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(log_level)?)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for SharedBuffer {
        type Writer = SharedBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_lines_are_prefixed_with_level_and_spans() {
        let buffer = SharedBuffer::default();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter("debug").unwrap())
            .event_format(Formatter)
            .with_writer(buffer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("invocation", request_id = "abc");
            let _guard = span.enter();
            tracing::info!(count = 2, "Flushed agent data");
        });

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            output,
            "APM_EXTENSION | INFO | invocation{request_id=\"abc\"}: Flushed agent data count=2\n"
        );
    }

    #[test]
    fn test_env_filter_accepts_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(env_filter(level).is_ok());
        }
    }
}
