//! Debug trace sinks
//!
//! The transport reports what it resolves and which addresses it tries as
//! plain text lines. Callers plug in a [`TraceSink`]; without one, lines are
//! dropped.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Receives formatted trace lines
pub trait TraceSink: Send + Sync {
    /// Handle one line. The return value of the underlying logger, if any,
    /// is ignored.
    fn trace(&self, line: &str);
}

impl<F> TraceSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn trace(&self, line: &str) {
        self(line)
    }
}

/// Forwards trace lines to the `tracing` crate at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn trace(&self, line: &str) {
        tracing::debug!(target: "hostsock::trace", "{}", line);
    }
}

/// Gate in front of an optional sink.
///
/// Lines are formatted only when tracing is enabled and a sink is present.
/// A panicking sink is contained here.
#[derive(Clone, Default)]
pub struct Tracer {
    sink: Option<Arc<dyn TraceSink>>,
    enabled: bool,
}

impl Tracer {
    /// Create a tracer
    pub fn new(sink: Option<Arc<dyn TraceSink>>, enabled: bool) -> Self {
        Tracer { sink, enabled }
    }

    /// A tracer that drops everything
    pub fn disabled() -> Self {
        Tracer::default()
    }

    /// Replace the sink
    pub fn set_sink(&mut self, sink: Arc<dyn TraceSink>) {
        self.sink = Some(sink);
    }

    /// Whether lines will reach a sink
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.sink.is_some()
    }

    /// Emit one line
    pub fn line(&self, args: fmt::Arguments<'_>) {
        if !self.enabled {
            return;
        }
        if let Some(sink) = &self.sink {
            let line = args.to_string();
            let result = panic::catch_unwind(AssertUnwindSafe(|| sink.trace(&line)));
            if result.is_err() {
                tracing::warn!("trace sink panicked; line dropped");
            }
        }
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("sink", &self.sink.is_some())
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting() -> (Arc<Mutex<Vec<String>>>, Arc<dyn TraceSink>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = lines.clone();
        let sink: Arc<dyn TraceSink> = Arc::new(move |line: &str| {
            sink_lines.lock().unwrap().push(line.to_string());
        });
        (lines, sink)
    }

    #[test]
    fn test_enabled_tracer_delivers() {
        let (lines, sink) = collecting();
        let tracer = Tracer::new(Some(sink), true);
        tracer.line(format_args!("connecting to {}", "::1"));
        assert_eq!(*lines.lock().unwrap(), vec!["connecting to ::1".to_string()]);
    }

    #[test]
    fn test_disabled_tracer_drops() {
        let (lines, sink) = collecting();
        let tracer = Tracer::new(Some(sink), false);
        tracer.line(format_args!("ignored"));
        assert!(lines.lock().unwrap().is_empty());
        assert!(!tracer.is_enabled());
    }

    #[test]
    fn test_missing_sink_is_noop() {
        let tracer = Tracer::new(None, true);
        tracer.line(format_args!("nobody listens"));
        assert!(!tracer.is_enabled());
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let sink: Arc<dyn TraceSink> = Arc::new(|_: &str| panic!("broken logger"));
        let tracer = Tracer::new(Some(sink), true);
        tracer.line(format_args!("still fine"));
    }
}
