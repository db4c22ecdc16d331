use crate::chat::message::Message;

const FENCE: &str = "```";

/// A run of reply text, split at fenced code blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Code {
        language: Option<String>,
        code: String,
    },
}

/// Splits `text` into prose and fenced code.
///
/// A fence that is not closed yet stays text, since a streaming reply may
/// still be inside it.
pub fn split_segments(text: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(FENCE) {
        let after_open = &rest[open + FENCE.len()..];
        let Some(line_end) = after_open.find('\n') else {
            break;
        };
        let body = &after_open[line_end + 1..];
        let Some(close) = body.find(FENCE) else {
            break;
        };

        push_text(&mut segments, &rest[..open]);

        let language = after_open[..line_end].trim();
        let code = body[..close].strip_suffix('\n').unwrap_or(&body[..close]);
        segments.push(Segment::Code {
            language: (!language.is_empty()).then(|| language.to_string()),
            code: code.to_string(),
        });

        let after_close = &body[close + FENCE.len()..];
        rest = after_close.strip_prefix('\n').unwrap_or(after_close);
    }

    push_text(&mut segments, rest);
    segments
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
}

/// Formats one finished message for a plain terminal.
pub fn format_message(message: &Message) -> String {
    let mut out = message_header(message);

    for segment in split_segments(&message.text) {
        match segment {
            Segment::Text(text) => out.push_str(&text),
            Segment::Code { language, code } => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&format_code_block(language.as_deref(), &code));
            }
        }
    }

    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

pub fn message_header(message: &Message) -> String {
    format!("[{}] {}: ", message.timestamp, message.from.label())
}

pub fn format_code_block(language: Option<&str>, code: &str) -> String {
    let mut out = format!("  ┌─ {}\n", language.unwrap_or("code"));
    for line in code.lines() {
        out.push_str("  │ ");
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("  └─\n");
    out
}

/// Length of the part of a trailing text segment that can no longer turn
/// into code: everything before the first fence or a run of backticks that
/// may still grow into one.
pub fn stable_prefix_len(text: &str) -> usize {
    let end = text.find(FENCE).unwrap_or(text.len());
    text[..end].trim_end_matches('`').len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::MessageId;

    #[test]
    fn plain_text_is_one_segment() {
        assert_eq!(
            split_segments("no code here"),
            vec![Segment::Text("no code here".to_string())]
        );
        assert!(split_segments("").is_empty());
    }

    #[test]
    fn fenced_block_is_split_out_with_language() {
        let text = "Try this:\n```rust\nfn main() {}\n```\nDone.";
        assert_eq!(
            split_segments(text),
            vec![
                Segment::Text("Try this:\n".to_string()),
                Segment::Code {
                    language: Some("rust".to_string()),
                    code: "fn main() {}".to_string(),
                },
                Segment::Text("Done.".to_string()),
            ]
        );
    }

    #[test]
    fn fence_without_language_has_none() {
        let segments = split_segments("```\nls -la\n```");
        assert_eq!(
            segments,
            vec![Segment::Code {
                language: None,
                code: "ls -la".to_string(),
            }]
        );
    }

    #[test]
    fn unterminated_fence_stays_text() {
        let text = "Here:\n```python\nprint(1)";
        assert_eq!(split_segments(text), vec![Segment::Text(text.to_string())]);
    }

    #[test]
    fn formatted_message_frames_code() {
        let message = Message::bot(MessageId::new(1), "See:\n```sh\necho hi\n```");
        let rendered = format_message(&message);

        assert!(rendered.contains("bot: See:\n"));
        assert!(rendered.contains("  ┌─ sh\n  │ echo hi\n  └─\n"));
    }

    #[test]
    fn stable_prefix_stops_before_possible_fences() {
        assert_eq!(stable_prefix_len("plain"), 5);
        assert_eq!(stable_prefix_len("Run:\n```sh\nls"), 5);
        assert_eq!(stable_prefix_len("Run:\n``"), 5);
        assert_eq!(stable_prefix_len("inline `code`"), 12);
    }
}
