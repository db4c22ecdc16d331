//! Line-oriented front-end: command parsing and incremental transcript output.

use std::io::{self, Write};
use std::path::PathBuf;

use ragchat_stream::{ChatMode, HandoffStatus, SessionEpoch};
use tokio::sync::watch;

use crate::chat::message::{Message, MessageId};
use crate::chat::render::{
    Segment, format_code_block, format_message, message_header, split_segments,
    stable_prefix_len,
};
use crate::chat::store::{Session, SessionSnapshot};

pub const HELP_TEXT: &str = "\
commands:
  /new               start a new chat
  /mode rag|agent    switch endpoint
  /human             ask for a human operator
  /prompt [text]     show or replace the RAG prompt template
  /upload <path>     add a pdf, docx or txt file to the knowledge base
  /health            check the backend
  /save              keep the current mode and connection as defaults
  /quit              exit
anything else is sent as a message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    NewChat,
    Mode(ChatMode),
    Human,
    ShowPrompt,
    SetPrompt(String),
    Upload(PathBuf),
    Health,
    Save,
    Help,
    Quit,
    /// A slash command that could not be understood; carries the hint to print.
    Invalid(String),
}

impl Command {
    /// Parses one input line; blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let Some(command) = trimmed.strip_prefix('/') else {
            return Some(Self::Send(line.trim_end_matches(['\r', '\n']).to_string()));
        };

        let (name, argument) = match command.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (command, ""),
        };

        let parsed = match name {
            "new" => Self::NewChat,
            "mode" => match ChatMode::parse(argument) {
                Some(mode) => Self::Mode(mode),
                None => Self::Invalid("usage: /mode rag|agent".to_string()),
            },
            "human" => Self::Human,
            "prompt" if argument.is_empty() => Self::ShowPrompt,
            // Template placeholders are written as literal `\n` on one line.
            "prompt" => Self::SetPrompt(argument.replace("\\n", "\n")),
            "upload" if argument.is_empty() => Self::Invalid("usage: /upload <path>".to_string()),
            "upload" => Self::Upload(PathBuf::from(argument)),
            "health" => Self::Health,
            "save" => Self::Save,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => Self::Invalid(format!("unknown command /{other}; try /help")),
        };
        Some(parsed)
    }
}

/// Turns successive session snapshots into append-only terminal output.
///
/// The reply of the running turn is printed as it grows, holding back text
/// that may still become a code block; every other row is printed once,
/// formatted, when it first appears.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    epoch: Option<SessionEpoch>,
    printed: usize,
    live: Option<LiveReply>,
    handoff_announced: bool,
}

/// Print position inside the reply that is still streaming.
#[derive(Debug)]
struct LiveReply {
    id: MessageId,
    segments_done: usize,
    text_printed: usize,
    line_open: bool,
}

impl LiveReply {
    fn start(message: &Message, out: &mut String) -> Self {
        out.push_str(&message_header(message));
        Self {
            id: message.id,
            segments_done: 0,
            text_printed: 0,
            line_open: true,
        }
    }

    fn advance(&mut self, text: &str, finished: bool, out: &mut String) {
        let segments = split_segments(text);
        let last = segments.len().saturating_sub(1);

        for (index, segment) in segments.iter().enumerate().skip(self.segments_done) {
            match segment {
                Segment::Text(text) => {
                    let growing = !finished && index == last;
                    let settled = if growing {
                        stable_prefix_len(text)
                    } else {
                        text.len()
                    };
                    if let Some(fresh) = text.get(self.text_printed..settled)
                        && !fresh.is_empty()
                    {
                        out.push_str(fresh);
                        self.line_open = !fresh.ends_with('\n');
                        self.text_printed = settled;
                    }
                    if growing {
                        return;
                    }
                }
                Segment::Code { language, code } => {
                    if self.line_open {
                        out.push('\n');
                    }
                    out.push_str(&format_code_block(language.as_deref(), code));
                    self.line_open = false;
                }
            }
            self.segments_done = index + 1;
            self.text_printed = 0;
        }

        if finished && self.line_open {
            out.push('\n');
            self.line_open = false;
        }
    }
}

impl TranscriptPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, session: &Session) -> String {
        let mut out = String::new();

        if self.epoch != Some(session.epoch) {
            if self.epoch.is_some() {
                out.push_str("\n--- new chat ---\n");
            }
            self.epoch = Some(session.epoch);
            self.printed = 0;
            self.live = None;
            self.handoff_announced = false;
        }

        let last = session.messages.len().saturating_sub(1);
        while let Some(message) = session.messages.get(self.printed) {
            let growing = session.loading() && self.printed == last && message.from.is_bot();
            let live = self.live.take().filter(|live| live.id == message.id);

            if !growing && live.is_none() {
                out.push_str(&format_message(message));
            } else {
                let mut live = match live {
                    Some(live) => live,
                    None => LiveReply::start(message, &mut out),
                };
                live.advance(&message.text, !growing, &mut out);
                if growing {
                    self.live = Some(live);
                    break;
                }
            }
            self.printed += 1;
        }

        if session.handoff_status == HandoffStatus::Pending && !self.handoff_announced {
            self.handoff_announced = true;
            out.push_str("(a human operator has been requested; input is disabled until /new)\n");
        }

        out
    }
}

/// Writes every session update to `out` until the store goes away.
///
/// Stops at the first write error.
pub async fn print_transcript<W: Write>(
    mut updates: watch::Receiver<SessionSnapshot>,
    mut out: W,
) -> io::Result<()> {
    let mut printer = TranscriptPrinter::new();
    loop {
        let snapshot = updates.borrow_and_update().clone();
        let output = printer.render(&snapshot);
        if !output.is_empty() {
            out.write_all(output.as_bytes())?;
            out.flush()?;
        }

        if updates.changed().await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::store::{MessageStore, TurnOutcome};
    use ragchat_stream::{ChatEvent, StreamTarget, TurnId};
    use std::path::Path;

    #[test]
    fn parses_commands_and_messages() {
        assert_eq!(Command::parse("   "), None);
        assert_eq!(
            Command::parse("what is rag?\n"),
            Some(Command::Send("what is rag?".to_string()))
        );
        assert_eq!(Command::parse("/new"), Some(Command::NewChat));
        assert_eq!(
            Command::parse("/mode Agent"),
            Some(Command::Mode(ChatMode::Agent))
        );
        assert!(matches!(
            Command::parse("/mode human"),
            Some(Command::Invalid(_))
        ));
        assert_eq!(Command::parse("/prompt"), Some(Command::ShowPrompt));
        assert_eq!(
            Command::parse("/prompt Context:\\n{context}"),
            Some(Command::SetPrompt("Context:\n{context}".to_string()))
        );
        assert_eq!(
            Command::parse("/upload docs/guide.pdf"),
            Some(Command::Upload(Path::new("docs/guide.pdf").to_path_buf()))
        );
        assert!(matches!(Command::parse("/upload"), Some(Command::Invalid(_))));
        assert_eq!(Command::parse("/save"), Some(Command::Save));
        assert_eq!(Command::parse("/quit"), Some(Command::Quit));
        assert!(matches!(Command::parse("/dance"), Some(Command::Invalid(_))));
    }

    #[test]
    fn live_reply_is_printed_incrementally() {
        let mut store = MessageStore::new(ChatMode::Rag, "", None);
        let mut printer = TranscriptPrinter::new();

        store.append_user("hi");
        let target = StreamTarget::new(store.session().epoch, TurnId::new(1));
        let bot_id = store.begin_bot_reply(target).unwrap();
        let first = printer.render(store.session());
        assert!(first.ends_with("you: hi\n"), "{first}");

        store.on_event(target, bot_id, ChatEvent::data("hel"));
        assert!(printer.render(store.session()).ends_with("bot: hel"));

        store.on_event(target, bot_id, ChatEvent::data("lo"));
        assert_eq!(printer.render(store.session()), "lo");

        store.finish_turn(target, &TurnOutcome::Completed);
        assert_eq!(printer.render(store.session()), "\n");
        assert_eq!(printer.render(store.session()), "");
    }

    #[test]
    fn streamed_code_block_is_framed_once_closed() {
        let mut store = MessageStore::new(ChatMode::Rag, "", None);
        let mut printer = TranscriptPrinter::new();

        store.append_user("how do I list files?");
        let target = StreamTarget::new(store.session().epoch, TurnId::new(1));
        let bot_id = store.begin_bot_reply(target).unwrap();
        printer.render(store.session());

        let mut streamed = String::new();
        for chunk in ["See:\n`", "``sh\necho", " hi\n``", "`\n"] {
            store.on_event(target, bot_id, ChatEvent::data(chunk));
            streamed.push_str(&printer.render(store.session()));
        }
        assert!(!streamed.contains("```"), "{streamed}");
        assert!(streamed.ends_with("  ┌─ sh\n  │ echo hi\n  └─\n"), "{streamed}");

        store.on_event(target, bot_id, ChatEvent::data("Done."));
        streamed.push_str(&printer.render(store.session()));

        store.finish_turn(target, &TurnOutcome::Completed);
        streamed.push_str(&printer.render(store.session()));

        let reply = store.session().message(bot_id).unwrap();
        let expected = format_message(reply);
        let body = expected.split_once("bot: ").unwrap().1;
        assert!(streamed.ends_with(body), "{streamed}");
        assert!(streamed.ends_with("  └─\nDone.\n"), "{streamed}");
    }

    #[test]
    fn unclosed_fence_is_printed_raw_when_the_reply_ends() {
        let mut store = MessageStore::new(ChatMode::Rag, "", None);
        let mut printer = TranscriptPrinter::new();

        let target = StreamTarget::new(store.session().epoch, TurnId::new(1));
        let bot_id = store.begin_bot_reply(target).unwrap();
        store.on_event(target, bot_id, ChatEvent::data("Try:\n```py\nprint(1)"));
        let partial = printer.render(store.session());
        assert!(partial.ends_with("bot: Try:\n"), "{partial}");

        store.finish_turn(target, &TurnOutcome::Completed);
        assert_eq!(printer.render(store.session()), "```py\nprint(1)\n");
    }

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn transcript_printing_ends_with_the_store() {
        let mut store = MessageStore::new(ChatMode::Rag, "", Some("Hello!"));
        let updates = store.subscribe();
        store.append_user("hi");
        drop(store);

        let mut out = Vec::new();
        print_transcript(updates, &mut out).await.unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("bot: Hello!\n"), "{out}");
        assert!(out.ends_with("you: hi\n"), "{out}");
    }

    #[tokio::test]
    async fn transcript_printing_stops_on_write_error() {
        let store = MessageStore::new(ChatMode::Rag, "", Some("Hello!"));
        let updates = store.subscribe();

        let error = print_transcript(updates, ClosedPipe).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
        drop(store);
    }

    #[test]
    fn reset_and_handoff_are_announced_once() {
        let mut store = MessageStore::new(ChatMode::Agent, "", Some("Hello!"));
        let mut printer = TranscriptPrinter::new();
        assert!(printer.render(store.session()).contains("bot: Hello!"));

        let target = StreamTarget::new(store.session().epoch, TurnId::new(1));
        let bot_id = store.begin_bot_reply(target).unwrap();
        store.on_event(
            target,
            bot_id,
            ChatEvent::HandoffStatus(HandoffStatus::Pending),
        );
        store.finish_turn(target, &TurnOutcome::Completed);

        assert!(printer.render(store.session()).contains("human operator"));
        assert_eq!(printer.render(store.session()), "");

        store.reset().unwrap();
        assert_eq!(printer.render(store.session()), "\n--- new chat ---\n");
    }
}
