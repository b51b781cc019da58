use std::collections::HashSet;

use parley_transport::{SourceDocument, StreamEvent};

use crate::turn::ConversationTurn;

/// Folds one stream event into a turn.
///
/// Resolved turns are returned unchanged, so events that leak past a terminal
/// event cannot mutate them.
pub fn accumulate(mut turn: ConversationTurn, event: StreamEvent) -> ConversationTurn {
    if !turn.is_pending {
        tracing::debug!(turn_id = %turn.id, "ignoring stream event for resolved turn");
        return turn;
    }

    match event {
        StreamEvent::Chunk(text) => turn.answer.push_str(&text),
        StreamEvent::Sources(sources) => turn.sources = dedupe_sources(sources),
        StreamEvent::Error(message) => {
            turn.error = Some(message);
            turn.is_pending = false;
        }
        StreamEvent::Done => turn.is_pending = false,
    }
    turn
}

/// Resolves a pending turn as canceled by the user. Partial answer text and
/// sources are kept.
pub fn cancel(mut turn: ConversationTurn, message: &str) -> ConversationTurn {
    if !turn.is_pending {
        return turn;
    }

    turn.error = Some(message.to_string());
    turn.is_pending = false;
    turn
}

/// Keeps the first document for each truthy citation id, in order of first
/// appearance. Documents without a usable citation id are dropped.
pub fn dedupe_sources(sources: Vec<SourceDocument>) -> Vec<SourceDocument> {
    let mut seen = HashSet::new();
    sources
        .into_iter()
        .filter(|source| match source.citation_key() {
            Some(citation_id) => seen.insert(citation_id.clone()),
            None => false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use parley_transport::SourceLocation;

    use super::*;

    fn fold(turn: ConversationTurn, events: Vec<StreamEvent>) -> ConversationTurn {
        events.into_iter().fold(turn, accumulate)
    }

    #[test]
    fn chunks_then_done_concatenate_in_order() {
        let chunks = ["Retrieval", "-augmented", " ", "génération", ""];
        let mut events = chunks
            .iter()
            .map(|chunk| StreamEvent::Chunk(chunk.to_string()))
            .collect::<Vec<_>>();
        events.push(StreamEvent::Done);

        let turn = fold(ConversationTurn::pending("What is RAG?"), events);

        assert_eq!(turn.answer, chunks.concat());
        assert_eq!(turn.error, None);
        assert!(!turn.is_pending);
    }

    #[test]
    fn chunk_keeps_turn_pending() {
        let turn = accumulate(
            ConversationTurn::pending("Q"),
            StreamEvent::Chunk("Hi".to_string()),
        );
        assert!(turn.is_pending);
        assert_eq!(turn.answer, "Hi");
    }

    #[test]
    fn error_preserves_partial_answer() {
        let turn = fold(
            ConversationTurn::pending("Q"),
            vec![
                StreamEvent::Chunk("Partial".to_string()),
                StreamEvent::Error("server down".to_string()),
            ],
        );

        assert_eq!(turn.answer, "Partial");
        assert_eq!(turn.error.as_deref(), Some("server down"));
        assert!(!turn.is_pending);
    }

    #[test]
    fn events_after_terminal_are_ignored() {
        let resolved = fold(
            ConversationTurn::pending("Q"),
            vec![StreamEvent::Chunk("done".to_string()), StreamEvent::Done],
        );

        let after = fold(
            resolved.clone(),
            vec![
                StreamEvent::Chunk(" late".to_string()),
                StreamEvent::Sources(vec![SourceDocument::link("https://a").with_citation_id(1u64)]),
                StreamEvent::Error("late failure".to_string()),
            ],
        );

        assert_eq!(after, resolved);
    }

    #[test]
    fn sources_do_not_resolve_the_turn() {
        let turn = accumulate(
            ConversationTurn::pending("Q"),
            StreamEvent::Sources(vec![SourceDocument::link("https://a").with_citation_id(1u64)]),
        );

        assert!(turn.is_pending);
        assert_eq!(turn.sources.len(), 1);
    }

    #[test]
    fn cancel_resolves_pending_turn_only() {
        let partial = accumulate(
            ConversationTurn::pending("Q"),
            StreamEvent::Chunk("Par".to_string()),
        );
        let canceled = cancel(partial, "Request aborted");
        assert_eq!(canceled.answer, "Par");
        assert_eq!(canceled.error.as_deref(), Some("Request aborted"));
        assert!(!canceled.is_pending);

        let done = accumulate(ConversationTurn::pending("Q"), StreamEvent::Done);
        assert_eq!(cancel(done.clone(), "Request aborted"), done);
    }

    #[test]
    fn dedupe_keeps_first_occurrence_in_order() {
        let sources = vec![
            SourceDocument::file("kb", "first.pdf").with_citation_id(1u64),
            SourceDocument::file("kb", "duplicate.pdf").with_citation_id(1u64),
            SourceDocument::link("https://kb.example.com/2").with_citation_id(2u64),
        ];

        let deduped = dedupe_sources(sources);

        assert_eq!(deduped.len(), 2);
        assert_eq!(
            deduped[0].location,
            SourceLocation::File {
                bucket_name: "kb".to_string(),
                object_name: "first.pdf".to_string(),
            }
        );
        assert_eq!(deduped[1].citation_id.as_ref().map(|id| id.as_str()), Some("2"));
    }

    #[test]
    fn dedupe_drops_missing_citation_ids_and_is_idempotent() {
        let sources = vec![
            SourceDocument::link("https://none"),
            SourceDocument::link("https://blank").with_citation_id(""),
            SourceDocument::link("https://c").with_citation_id("c"),
            SourceDocument::link("https://b").with_citation_id("b"),
            SourceDocument::link("https://c-again").with_citation_id("c"),
        ];

        let once = dedupe_sources(sources);
        let twice = dedupe_sources(once.clone());

        assert_eq!(
            once.iter()
                .filter_map(|source| source.citation_key().map(|id| id.as_str()))
                .collect::<Vec<_>>(),
            vec!["c", "b"]
        );
        assert_eq!(once, twice);
    }

    #[test]
    fn dedupe_keeps_string_zero_and_blank_citation_ids() {
        let sources: Vec<SourceDocument> = serde_json::from_str(
            r#"[{"link": "https://a", "citationId": "0"}, {"link": "https://b", "citationId": " "}]"#,
        )
        .unwrap();

        assert_eq!(dedupe_sources(sources).len(), 2);
    }
}
