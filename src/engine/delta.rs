//! Incremental delta computation.
//!
//! Snapshot engines report the full text generated so far; token engines
//! report only what is new. Both come out of [`DeltaStreamer::push`] as
//! non-empty deltas whose concatenation is exactly the final text.

use super::EngineError;

/// How an engine reports progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamShape {
    /// Every increment is the whole text so far.
    Cumulative,
    /// Every increment is only the newly generated fragment.
    Incremental,
}

/// `current[len(previous)..]`, provided `current` extends `previous`.
pub fn next_delta<'a>(previous: &str, current: &'a str) -> Result<&'a str, EngineError> {
    // A byte prefix of a valid str always ends on a char boundary.
    current
        .strip_prefix(previous)
        .ok_or(EngineError::NonMonotonic)
}

/// Turns engine increments into emit-once deltas.
#[derive(Debug)]
pub struct DeltaStreamer {
    shape: StreamShape,
    snapshot: String,
    emitted: usize,
}

impl DeltaStreamer {
    pub fn new(shape: StreamShape) -> Self {
        Self {
            shape,
            snapshot: String::new(),
            emitted: 0,
        }
    }

    pub fn shape(&self) -> StreamShape {
        self.shape
    }

    /// Feed one increment. Returns the delta to emit, or `None` when the
    /// increment adds nothing.
    pub fn push(&mut self, increment: String) -> Result<Option<String>, EngineError> {
        let delta = match self.shape {
            StreamShape::Incremental => increment,
            StreamShape::Cumulative => {
                let delta = next_delta(&self.snapshot, &increment)?.to_string();
                self.snapshot = increment;
                delta
            }
        };
        if delta.is_empty() {
            return Ok(None);
        }
        self.emitted += 1;
        Ok(Some(delta))
    }

    /// Number of non-empty deltas produced so far.
    pub fn deltas_emitted(&self) -> usize {
        self.emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(shape: StreamShape, increments: &[&str]) -> Result<Vec<String>, EngineError> {
        let mut streamer = DeltaStreamer::new(shape);
        let mut out = Vec::new();
        for inc in increments {
            if let Some(d) = streamer.push(inc.to_string())? {
                out.push(d);
            }
        }
        Ok(out)
    }

    #[test]
    fn test_cumulative_snapshots() {
        let deltas = run(StreamShape::Cumulative, &["", "4", "4."]).unwrap();
        assert_eq!(deltas, vec!["4", "."]);
    }

    #[test]
    fn test_incremental_passthrough() {
        let deltas = run(StreamShape::Incremental, &["He", "", "llo"]).unwrap();
        assert_eq!(deltas, vec!["He", "llo"]);
    }

    #[test]
    fn test_incremental_is_not_double_applied() {
        // Fragments that happen to look like prefixes must pass through as is.
        let deltas = run(StreamShape::Incremental, &["ab", "ab", "abc"]).unwrap();
        assert_eq!(deltas.concat(), "ababab".to_string() + "c");
    }

    #[test]
    fn test_repeated_snapshot_emits_nothing() {
        let deltas = run(StreamShape::Cumulative, &["a", "a", "ab"]).unwrap();
        assert_eq!(deltas, vec!["a", "b"]);
    }

    #[test]
    fn test_rewritten_snapshot_is_rejected() {
        let err = run(StreamShape::Cumulative, &["hello", "help"]).unwrap_err();
        assert_eq!(err, EngineError::NonMonotonic);
    }

    #[test]
    fn test_multibyte_suffix() {
        assert_eq!(next_delta("naï", "naïve").unwrap(), "ve");
        assert_eq!(next_delta("", "日本").unwrap(), "日本");
    }

    #[test]
    fn test_delta_count() {
        let mut s = DeltaStreamer::new(StreamShape::Cumulative);
        s.push(String::new()).unwrap();
        s.push("x".into()).unwrap();
        assert_eq!(s.deltas_emitted(), 1);
    }
}
