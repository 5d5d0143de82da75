//! Delta computation over arbitrary snapshot sequences.

use proptest::prelude::*;
use sealed_llm::engine::{next_delta, DeltaStreamer, EngineError, StreamShape};

proptest! {
    #[test]
    fn prop_cumulative_deltas_rebuild_final_text(pieces in proptest::collection::vec(".{0,6}", 0..20)) {
        let mut streamer = DeltaStreamer::new(StreamShape::Cumulative);
        let mut snapshot = String::new();
        let mut rebuilt = String::new();
        for piece in &pieces {
            snapshot.push_str(piece);
            if let Some(delta) = streamer.push(snapshot.clone()).unwrap() {
                prop_assert!(!delta.is_empty());
                rebuilt.push_str(&delta);
            }
        }
        prop_assert_eq!(rebuilt, snapshot);
        prop_assert_eq!(
            streamer.deltas_emitted(),
            pieces.iter().filter(|p| !p.is_empty()).count()
        );
    }

    #[test]
    fn prop_incremental_concatenates(pieces in proptest::collection::vec(".{0,6}", 0..20)) {
        let mut streamer = DeltaStreamer::new(StreamShape::Incremental);
        let mut rebuilt = String::new();
        for piece in &pieces {
            if let Some(delta) = streamer.push(piece.clone()).unwrap() {
                rebuilt.push_str(&delta);
            }
        }
        prop_assert_eq!(rebuilt, pieces.concat());
    }
}

#[test]
fn test_next_delta_examples() {
    assert_eq!(next_delta("", "4").unwrap(), "4");
    assert_eq!(next_delta("4", "4.").unwrap(), ".");
    assert_eq!(next_delta("héllo", "héllo wörld").unwrap(), " wörld");
    assert_eq!(next_delta("abc", "abx"), Err(EngineError::NonMonotonic));
    assert_eq!(next_delta("abc", "ab"), Err(EngineError::NonMonotonic));
}
