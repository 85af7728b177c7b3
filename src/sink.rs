/// Observers for lines captured from a child process.
///
/// The runner hands every captured line to an `OutputSink` in addition to
/// accumulating it, so callers decide where the echo goes (logs, a test
/// buffer, nowhere).
use std::fmt;

/// Which pipe a captured line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives each line as soon as it is read from the child.
///
/// Called concurrently from both drain tasks; implementations must not block.
pub trait OutputSink: Send + Sync {
    fn line(&self, stream: StreamKind, line: &str);
}

/// Echoes captured lines into the `tracing` log at debug level.
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn line(&self, stream: StreamKind, line: &str) {
        tracing::debug!(stream = %stream, "{line}");
    }
}

/// Discards everything.
pub struct NullSink;

impl OutputSink for NullSink {
    fn line(&self, _stream: StreamKind, _line: &str) {}
}

#[cfg(test)]
pub mod testing {
    use super::{OutputSink, StreamKind};
    use std::sync::Mutex;

    /// Records every line it sees, in arrival order.
    #[derive(Default)]
    pub struct CollectingSink {
        lines: Mutex<Vec<(StreamKind, String)>>,
    }

    impl CollectingSink {
        pub fn lines(&self) -> Vec<(StreamKind, String)> {
            self.lines.lock().unwrap().clone()
        }

        pub fn lines_for(&self, stream: StreamKind) -> Vec<String> {
            self.lines()
                .into_iter()
                .filter(|(s, _)| *s == stream)
                .map(|(_, l)| l)
                .collect()
        }
    }

    impl OutputSink for CollectingSink {
        fn line(&self, stream: StreamKind, line: &str) {
            self.lines.lock().unwrap().push((stream, line.to_string()));
        }
    }
}
