use serde::{Deserialize, Serialize};

use super::event::{SourceDocument, StreamEvent};

/// How a chat response body is split into events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFraming {
    /// Every decoded text increment is a chunk; end of body completes the turn.
    PlainText,
    /// One JSON object per line: `{"chunk": ..}`, `{"sources": [..]}`,
    /// `{"error": ..}` or `{"done": true}`.
    #[default]
    EventLines,
}

/// Incremental UTF-8 decoder that tolerates code points split across chunks.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes as much as possible, keeping an incomplete trailing sequence
    /// for the next call. Invalid sequences become U+FFFD.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut decoded = String::new();
        let mut consumed = 0;

        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(error) => {
                    let valid_end = consumed + error.valid_up_to();
                    // valid_up_to guarantees this range is valid UTF-8.
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[consumed..valid_end]));
                    match error.error_len() {
                        Some(invalid_len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            consumed = valid_end + invalid_len;
                        }
                        None => {
                            consumed = valid_end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        decoded
    }

    /// Flushes bytes left over at end of input.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Splits decoded text into complete lines.
#[derive(Debug, Default)]
struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);

        let mut lines = Vec::new();
        while let Some(newline) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=newline).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    sources: Option<Vec<SourceDocument>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    done: bool,
}

impl WireEvent {
    fn into_events(self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(chunk) = self.chunk
            && !chunk.is_empty()
        {
            events.push(StreamEvent::Chunk(chunk));
        }
        if let Some(sources) = self.sources {
            events.push(StreamEvent::Sources(sources));
        }
        if let Some(error) = self.error {
            events.push(StreamEvent::Error(error));
        } else if self.done {
            events.push(StreamEvent::Done);
        }
        events
    }
}

/// Parses one `EventLines` line. Blank lines carry no events.
pub fn parse_event_line(line: &str) -> Result<Vec<StreamEvent>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    let wire: WireEvent = serde_json::from_str(line)?;
    Ok(wire.into_events())
}

/// Turns raw body bytes into stream events and stops at the first terminal one.
#[derive(Debug)]
pub struct EventDecoder {
    framing: StreamFraming,
    utf8: Utf8Decoder,
    lines: LineBuffer,
    terminated: bool,
}

impl EventDecoder {
    pub fn new(framing: StreamFraming) -> Self {
        Self {
            framing,
            utf8: Utf8Decoder::new(),
            lines: LineBuffer::default(),
            terminated: false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        if self.terminated {
            return Vec::new();
        }

        let text = self.utf8.push(bytes);
        self.decode_text(&text)
    }

    /// Drains buffered input and closes the event sequence with `Done` unless
    /// a terminal event was already produced.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.terminated {
            return Vec::new();
        }

        let text = self.utf8.finish();
        let mut events = self.decode_text(&text);

        if !self.terminated
            && self.framing == StreamFraming::EventLines
            && let Some(rest) = self.lines.finish()
        {
            events.extend(self.decode_line(&rest));
        }

        if !self.terminated {
            self.terminated = true;
            events.push(StreamEvent::Done);
        }
        events
    }

    fn decode_text(&mut self, text: &str) -> Vec<StreamEvent> {
        if text.is_empty() {
            return Vec::new();
        }

        match self.framing {
            StreamFraming::PlainText => vec![StreamEvent::Chunk(text.to_string())],
            StreamFraming::EventLines => {
                let mut events = Vec::new();
                for line in self.lines.push(text) {
                    events.extend(self.decode_line(&line));
                    if self.terminated {
                        break;
                    }
                }
                events
            }
        }
    }

    fn decode_line(&mut self, line: &str) -> Vec<StreamEvent> {
        let parsed = match parse_event_line(line) {
            Ok(events) => events,
            Err(error) => {
                tracing::warn!(error = %error, "received malformed stream event line");
                vec![StreamEvent::Error(format!(
                    "malformed stream event: {error}"
                ))]
            }
        };

        let mut events = Vec::with_capacity(parsed.len());
        for event in parsed {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                self.terminated = true;
                break;
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_byte_character_split_across_chunks_is_buffered() {
        let text = "héllo → wörld";
        let bytes = text.as_bytes();
        let mut decoder = Utf8Decoder::new();
        let mut decoded = String::new();

        // Feed one byte at a time so every multi-byte sequence is split.
        for byte in bytes {
            decoded.push_str(&decoder.push(std::slice::from_ref(byte)));
        }
        decoded.push_str(&decoder.finish());

        assert_eq!(decoded, text);
    }

    #[test]
    fn incomplete_tail_waits_for_next_chunk() {
        let arrow = "→".as_bytes();
        let mut decoder = Utf8Decoder::new();

        assert_eq!(decoder.push(&[b'a', arrow[0], arrow[1]]), "a");
        assert!(decoder.has_pending());
        assert_eq!(decoder.push(&arrow[2..]), "→");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn invalid_bytes_are_replaced_not_dropped() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn truncated_sequence_at_end_is_flushed_lossily() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&"é".as_bytes()[..1]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn plain_text_framing_emits_chunks_then_done() {
        let mut decoder = EventDecoder::new(StreamFraming::PlainText);
        let mut events = decoder.push(b"Hi");
        events.extend(decoder.push(b" there"));
        events.extend(decoder.finish());

        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk("Hi".to_string()),
                StreamEvent::Chunk(" there".to_string()),
                StreamEvent::Done,
            ]
        );
    }

    #[test]
    fn event_lines_split_mid_line_are_reassembled() {
        let mut decoder = EventDecoder::new(StreamFraming::EventLines);
        let mut events = decoder.push(br#"{"chunk":"Hi"}
{"chu"#);
        events.extend(decoder.push(br#"nk":" there"}
{"sources":[{"link":"https://a","citationId":1}]}
{"done":true}
"#));

        assert!(decoder.is_terminated());
        assert_eq!(events.len(), 4);
        assert_eq!(events[1], StreamEvent::Chunk(" there".to_string()));
        assert!(matches!(&events[2], StreamEvent::Sources(sources) if sources.len() == 1));
        assert_eq!(events[3], StreamEvent::Done);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn nothing_is_decoded_after_a_terminal_line() {
        let mut decoder = EventDecoder::new(StreamFraming::EventLines);
        let events = decoder.push(
            b"{\"error\":\"server down\"}\n{\"chunk\":\"late\"}\n",
        );

        assert_eq!(events, vec![StreamEvent::Error("server down".to_string())]);
        assert!(decoder.push(b"{\"chunk\":\"later\"}\n").is_empty());
    }

    #[test]
    fn trailing_line_without_newline_is_parsed_on_finish() {
        let mut decoder = EventDecoder::new(StreamFraming::EventLines);
        assert!(decoder.push(br#"{"chunk":"tail"}"#).is_empty());

        assert_eq!(
            decoder.finish(),
            vec![StreamEvent::Chunk("tail".to_string()), StreamEvent::Done]
        );
    }

    #[test]
    fn malformed_line_is_a_terminal_error() {
        let mut decoder = EventDecoder::new(StreamFraming::EventLines);
        let events = decoder.push(b"not json\n");

        assert!(matches!(events.as_slice(), [StreamEvent::Error(message)] if message.starts_with("malformed stream event")));
        assert!(decoder.is_terminated());
    }
}
