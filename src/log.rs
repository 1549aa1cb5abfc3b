//! The log sink collaborator.
//!
//! The engine emits diagnostic messages to named categories at one of
//! seven severities. The sink itself is a pluggable collaborator: this
//! module only defines the narrow interface the core talks to
//! and a default implementation that bridges onto the `log` facade crate,
//! the way a kernel logger bridges `log::Level` onto its own severity
//! markers.

use core::fmt;

/// Log severities, ordered from most to least urgent.
///
/// `log::Level` only has five variants, so [`FacadeLogSink`] collapses
/// `Fatal` into `Error` and `Log` into `Info` when bridging onto it; the
/// full seven-way vocabulary is preserved at the call site for sinks that
/// want it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Fatal,
    Error,
    Warning,
    Display,
    Log,
    Verbose,
    VeryVerbose,
}

impl Severity {
    /// Maps onto the nearest `log::Level`.
    #[must_use]
    pub const fn as_log_level(self) -> log::Level {
        match self {
            Severity::Fatal | Severity::Error => log::Level::Error,
            Severity::Warning => log::Level::Warn,
            Severity::Display | Severity::Log => log::Level::Info,
            Severity::Verbose => log::Level::Debug,
            Severity::VeryVerbose => log::Level::Trace,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Fatal => "Fatal",
            Severity::Error => "Error",
            Severity::Warning => "Warning",
            Severity::Display => "Display",
            Severity::Log => "Log",
            Severity::Verbose => "Verbose",
            Severity::VeryVerbose => "VeryVerbose",
        };
        f.write_str(name)
    }
}

/// A collaborator the engine emits diagnostics to. `category` is a short
/// name grouping related emits (`"Core"`, `"Memory"`, `"Texture"`, ...),
/// the engine itself performs no filtering beyond this call, severity
/// filtering is the sink's responsibility.
pub trait LogSink: Send + Sync {
    fn log(&self, category: &str, severity: Severity, message: &fmt::Arguments<'_>);
}

/// The default [`LogSink`], forwarding every emit to the `log` facade
/// crate with `category` as the record's `target` and [`Severity::
/// as_log_level`] as its level.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeLogSink;

impl LogSink for FacadeLogSink {
    fn log(&self, category: &str, severity: Severity, message: &fmt::Arguments<'_>) {
        log::log!(target: category, severity.as_log_level(), "{message}");
    }
}

macro_rules! emit {
    ($sink:expr, $category:expr, $severity:expr, $($arg:tt)+) => {
        $sink.log($category, $severity, &format_args!($($arg)+))
    };
}

pub(crate) use emit;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<(String, Severity, String)>>,
    }

    impl LogSink for RecordingSink {
        fn log(&self, category: &str, severity: Severity, message: &fmt::Arguments<'_>) {
            self.records
                .lock()
                .unwrap()
                .push((category.to_string(), severity, message.to_string()));
        }
    }

    #[test]
    fn emit_macro_formats_and_records() {
        let sink = RecordingSink::default();
        emit!(sink, "Texture", Severity::Warning, "page {} evicted", 7);

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "Texture");
        assert_eq!(records[0].1, Severity::Warning);
        assert_eq!(records[0].2, "page 7 evicted");
    }

    #[test]
    fn severity_maps_onto_log_level() {
        assert_eq!(Severity::Fatal.as_log_level(), log::Level::Error);
        assert_eq!(Severity::VeryVerbose.as_log_level(), log::Level::Trace);
    }
}
