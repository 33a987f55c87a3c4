//! Line-oriented console front end.
//!
//! Parses slash commands typed by the user, drives a [`SessionHandle`] and
//! renders [`ChatEvent`]s and store contents as printable lines. The binary
//! owns the actual stdin/stdout I/O.

use std::fmt::Write as _;

use chrono::{DateTime, Local, Utc};
use mentorchat_proto::message::{ConversationSummary, Message, UserId};

use crate::chat::{ChatEvent, ConversationState};
use crate::net::{SessionError, SessionHandle, SessionStatus};

/// Help text printed by `/help`.
pub const HELP: &str = "\
commands:
  /list [query]        list conversations, optionally filtered
  /open <peer>         open a conversation and load its history
  /close <peer>        close a conversation
  /send <peer> <text>  send a message
  /history <peer>      print a conversation
  /online              list users seen online
  /reconnect           reconnect the push channel
  /status              show connection state and list filter
  /help                show this help
  /quit                exit
text without a leading slash is sent to the open conversation";

/// One-line summary of a [`SessionStatus`].
#[must_use]
pub fn render_status(status: &SessionStatus) -> String {
    let connection = match (status.connected, status.reconnect_pending) {
        (true, _) => "connected",
        (false, true) => "reconnecting",
        (false, false) if status.reconnect_enabled => "disconnected",
        (false, false) => "disconnected (auto-reconnect off)",
    };
    match &status.query {
        Some(query) => format!("{connection}, list filter \"{query}\""),
        None => connection.to_string(),
    }
}

/// Fallback when the configured timestamp format is invalid.
const FALLBACK_TIMESTAMP_FORMAT: &str = "%H:%M";

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `/list [query]`
    List(Option<String>),
    /// `/open <peer>`
    Open(UserId),
    /// `/close <peer>`
    Close(UserId),
    /// `/send <peer> <text>`
    Send {
        /// Recipient.
        peer: UserId,
        /// Message text.
        text: String,
    },
    /// `/history <peer>`
    History(UserId),
    /// `/online`
    Online,
    /// `/reconnect`
    Reconnect,
    /// `/status`
    Status,
    /// `/help`
    Help,
    /// `/quit`
    Quit,
    /// Plain text for the open conversation.
    Say(String),
}

/// Errors from [`parse_command`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The line was blank.
    #[error("empty input")]
    Empty,
    /// The command is not known.
    #[error("unknown command /{0} (try /help)")]
    UnknownCommand(String),
    /// A required argument was not given.
    #[error("/{command} needs {argument}")]
    MissingArgument {
        /// The command.
        command: &'static str,
        /// Name of the missing argument.
        argument: &'static str,
    },
}

/// Parse one input line.
///
/// # Errors
///
/// Returns [`ParseError`] for blank lines, unknown commands and missing
/// arguments.
pub fn parse_command(line: &str) -> Result<ConsoleCommand, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(ConsoleCommand::Say(line.to_string()));
    };

    let (name, args) = split_word(rest);
    match name {
        "list" | "ls" => Ok(ConsoleCommand::List(
            (!args.is_empty()).then(|| args.to_string()),
        )),
        "open" => peer_arg("open", args).map(ConsoleCommand::Open),
        "close" => peer_arg("close", args).map(ConsoleCommand::Close),
        "history" => peer_arg("history", args).map(ConsoleCommand::History),
        "send" => {
            let (peer, text) = split_word(args);
            if peer.is_empty() {
                return Err(ParseError::MissingArgument {
                    command: "send",
                    argument: "a peer",
                });
            }
            if text.is_empty() {
                return Err(ParseError::MissingArgument {
                    command: "send",
                    argument: "message text",
                });
            }
            Ok(ConsoleCommand::Send {
                peer: UserId::new(peer),
                text: text.to_string(),
            })
        }
        "online" => Ok(ConsoleCommand::Online),
        "reconnect" => Ok(ConsoleCommand::Reconnect),
        "status" => Ok(ConsoleCommand::Status),
        "help" | "?" => Ok(ConsoleCommand::Help),
        "quit" | "exit" | "q" => Ok(ConsoleCommand::Quit),
        other => Err(ParseError::UnknownCommand(other.to_string())),
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (s, ""),
    }
}

fn peer_arg(command: &'static str, args: &str) -> Result<UserId, ParseError> {
    let (peer, _) = split_word(args);
    if peer.is_empty() {
        Err(ParseError::MissingArgument {
            command,
            argument: "a peer",
        })
    } else {
        Ok(UserId::new(peer))
    }
}

/// Whether the console should keep reading input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep going.
    Continue,
    /// The user asked to quit.
    Quit,
}

/// Console state between lines: the conversation being viewed and pending
/// output requests.
#[derive(Debug)]
pub struct Console {
    me: UserId,
    current: Option<UserId>,
    list_pending: bool,
    timestamp_format: String,
}

impl Console {
    /// Creates a console for `me`, rendering times with `timestamp_format`
    /// (chrono `strftime` syntax).
    #[must_use]
    pub fn new(me: UserId, timestamp_format: impl Into<String>) -> Self {
        Self {
            me,
            current: None,
            list_pending: false,
            timestamp_format: timestamp_format.into(),
        }
    }

    /// The conversation plain text is sent to, if any.
    #[must_use]
    pub const fn current(&self) -> Option<&UserId> {
        self.current.as_ref()
    }

    /// Execute one command against the session. Returns the lines to print.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn execute(
        &mut self,
        command: ConsoleCommand,
        session: &SessionHandle,
        out: &mut Vec<String>,
    ) -> Result<Flow, SessionError> {
        match command {
            ConsoleCommand::List(query) => {
                self.list_pending = true;
                session
                    .refresh_summaries(Some(query.unwrap_or_default()))
                    .await?;
            }
            ConsoleCommand::Open(peer) => {
                if let Some(previous) = self.current.take()
                    && previous != peer
                {
                    session.close_conversation(&previous).await?;
                }
                out.push(format!("opening conversation with {peer}..."));
                session.open_conversation(&peer).await?;
                self.current = Some(peer);
            }
            ConsoleCommand::Close(peer) => {
                session.close_conversation(&peer).await?;
                if self.current.as_ref() == Some(&peer) {
                    self.current = None;
                }
                out.push(format!("closed conversation with {peer}"));
            }
            ConsoleCommand::Send { peer, text } => session.send_message(&peer, &text).await?,
            ConsoleCommand::Say(text) => match &self.current {
                Some(peer) => session.send_message(peer, &text).await?,
                None => out.push("no open conversation, use /open <peer> first".to_string()),
            },
            ConsoleCommand::History(peer) => {
                let messages = session.messages(&peer).await?;
                self.render_history(&peer, &messages, out);
            }
            ConsoleCommand::Online => {
                let users = session.online_users().await?;
                if users.is_empty() {
                    out.push("nobody seen online yet".to_string());
                } else {
                    let names: Vec<&str> = users.iter().map(UserId::as_str).collect();
                    out.push(format!("online: {}", names.join(", ")));
                }
            }
            ConsoleCommand::Reconnect => {
                session.reconnect().await?;
                out.push("reconnecting...".to_string());
            }
            ConsoleCommand::Status => out.push(render_status(&session.status().await?)),
            ConsoleCommand::Help => out.extend(HELP.lines().map(str::to_string)),
            ConsoleCommand::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    /// Render one session event. Some events trigger a read of the store.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn on_event(
        &mut self,
        event: ChatEvent,
        session: &SessionHandle,
        out: &mut Vec<String>,
    ) -> Result<(), SessionError> {
        match event {
            ChatEvent::MessageReceived { peer, message } => {
                let marker = if self.current.as_ref() == Some(&peer) {
                    ""
                } else {
                    "(new) "
                };
                out.push(format!("{marker}{}", self.format_message(&message)));
            }
            ChatEvent::SummariesUpdated if self.list_pending => {
                self.list_pending = false;
                let summaries = session.summaries().await?;
                if summaries.is_empty() {
                    out.push("no conversations".to_string());
                }
                out.extend(summaries.iter().map(format_summary));
            }
            ChatEvent::StateChanged {
                peer,
                state: ConversationState::Open,
            } if self.current.as_ref() == Some(&peer) => {
                let messages = session.messages(&peer).await?;
                self.render_history(&peer, &messages, out);
            }
            ChatEvent::PresenceChanged { user } => out.push(format!("* {user} is online")),
            ChatEvent::ConnectionStatus { connected: true } => {
                out.push("* live updates connected".to_string());
            }
            ChatEvent::ConnectionStatus { connected: false } => {
                out.push("* live updates lost, reconnecting".to_string());
            }
            ChatEvent::SummariesUpdated
            | ChatEvent::ConversationUpdated { .. }
            | ChatEvent::StateChanged { .. } => {}
        }
        Ok(())
    }

    fn render_history(&self, peer: &UserId, messages: &[Message], out: &mut Vec<String>) {
        out.push(format!("--- conversation with {peer} ---"));
        if messages.is_empty() {
            out.push("(no messages)".to_string());
        }
        out.extend(messages.iter().map(|m| self.format_message(m)));
    }

    /// Format a message as `[time] <sender> text`, with a delivery marker on
    /// the user's own messages.
    #[must_use]
    pub fn format_message(&self, message: &Message) -> String {
        let time = format_timestamp(message.sent_at, &self.timestamp_format);
        let own = message.sender_id == self.me;
        let sender = if own { "you" } else { message.sender_id.as_str() };
        let status = match (own, message.is_read, message.delivered) {
            (false, _, _) => "",
            (true, true, _) => " [read]",
            (true, false, true) => " [delivered]",
            (true, false, false) => " [sent]",
        };
        format!("[{time}] <{sender}> {}{status}", message.text)
    }
}

/// Format a conversation summary as one line.
#[must_use]
pub fn format_summary(summary: &ConversationSummary) -> String {
    let mut line = summary.peer_id.to_string();
    if let Some(name) = &summary.display_name {
        let _ = write!(line, " ({name})");
    }
    if summary.is_online {
        line.push_str(" *online*");
    }
    if summary.unread_count > 0 {
        let _ = write!(line, " [{} unread]", summary.unread_count);
    }
    if let Some(text) = &summary.last_message_text {
        let _ = write!(line, ": {text}");
    }
    line
}

/// Render `at` in local time. An invalid `format` falls back to `%H:%M`.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>, format: &str) -> String {
    let local = at.with_timezone(&Local);
    let mut out = String::new();
    if write!(out, "{}", local.format(format)).is_err() {
        out.clear();
        let _ = write!(out, "{}", local.format(FALLBACK_TIMESTAMP_FORMAT));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mentorchat_proto::message::MessageId;

    fn message(from: &str, to: &str) -> Message {
        Message {
            id: MessageId::new(1),
            sender_id: UserId::new(from),
            receiver_id: UserId::new(to),
            text: "hello there".to_string(),
            sent_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            is_read: false,
            delivered: false,
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("/list"), Ok(ConsoleCommand::List(None)));
        assert_eq!(
            parse_command("/list  ann lee "),
            Ok(ConsoleCommand::List(Some("ann lee".to_string())))
        );
        assert_eq!(
            parse_command("/open 31"),
            Ok(ConsoleCommand::Open(UserId::new("31")))
        );
        assert_eq!(
            parse_command("/close 31"),
            Ok(ConsoleCommand::Close(UserId::new("31")))
        );
        assert_eq!(
            parse_command("/history 31"),
            Ok(ConsoleCommand::History(UserId::new("31")))
        );
        assert_eq!(parse_command("/online"), Ok(ConsoleCommand::Online));
        assert_eq!(parse_command("/reconnect"), Ok(ConsoleCommand::Reconnect));
        assert_eq!(parse_command("/status"), Ok(ConsoleCommand::Status));
        assert_eq!(parse_command("/help"), Ok(ConsoleCommand::Help));
        assert_eq!(parse_command("/quit"), Ok(ConsoleCommand::Quit));
        assert_eq!(parse_command("/q"), Ok(ConsoleCommand::Quit));
    }

    #[test]
    fn send_keeps_inner_whitespace() {
        assert_eq!(
            parse_command("/send 31 see you  at 5"),
            Ok(ConsoleCommand::Send {
                peer: UserId::new("31"),
                text: "see you  at 5".to_string(),
            })
        );
    }

    #[test]
    fn plain_text_is_say() {
        assert_eq!(
            parse_command("  hi all  "),
            Ok(ConsoleCommand::Say("hi all".to_string()))
        );
    }

    #[test]
    fn parse_errors() {
        assert_eq!(parse_command("   "), Err(ParseError::Empty));
        assert_eq!(
            parse_command("/dance"),
            Err(ParseError::UnknownCommand("dance".to_string()))
        );
        assert!(matches!(
            parse_command("/open"),
            Err(ParseError::MissingArgument { command: "open", .. })
        ));
        assert!(matches!(
            parse_command("/send 31"),
            Err(ParseError::MissingArgument {
                command: "send",
                argument: "message text"
            })
        ));
        assert!(matches!(
            parse_command("/send"),
            Err(ParseError::MissingArgument {
                command: "send",
                argument: "a peer"
            })
        ));
    }

    #[test]
    fn formats_incoming_message() {
        let console = Console::new(UserId::new("me"), "%H:%M");
        let line = console.format_message(&message("31", "me"));
        assert!(line.ends_with("<31> hello there"), "got: {line}");
    }

    #[test]
    fn formats_own_message_status() {
        let console = Console::new(UserId::new("me"), "%H:%M");
        let mut msg = message("me", "31");
        assert!(console.format_message(&msg).ends_with("<you> hello there [sent]"));
        msg.delivered = true;
        assert!(console.format_message(&msg).ends_with("[delivered]"));
        msg.is_read = true;
        assert!(console.format_message(&msg).ends_with("[read]"));
    }

    #[test]
    fn formats_summary() {
        let summary = ConversationSummary {
            display_name: Some("Ann".to_string()),
            last_message_text: Some("see you".to_string()),
            unread_count: 2,
            is_online: true,
            ..ConversationSummary::empty(UserId::new("31"))
        };
        assert_eq!(
            format_summary(&summary),
            "31 (Ann) *online* [2 unread]: see you"
        );
        assert_eq!(
            format_summary(&ConversationSummary::empty(UserId::new("4"))),
            "4"
        );
    }

    #[test]
    fn renders_status() {
        let mut status = SessionStatus {
            connected: true,
            reconnect_pending: false,
            reconnect_enabled: true,
            query: Some("ann".to_string()),
        };
        assert_eq!(render_status(&status), "connected, list filter \"ann\"");

        status.connected = false;
        status.query = None;
        assert_eq!(render_status(&status), "disconnected");
        status.reconnect_pending = true;
        assert_eq!(render_status(&status), "reconnecting");
        status.reconnect_pending = false;
        status.reconnect_enabled = false;
        assert_eq!(
            render_status(&status),
            "disconnected (auto-reconnect off)"
        );
    }

    #[test]
    fn timestamp_format_falls_back_when_invalid() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let good = format_timestamp(at, "%Y");
        assert_eq!(good, "2024");
        let fallback = format_timestamp(at, "%Q");
        assert_eq!(fallback, format_timestamp(at, "%H:%M"));
    }
}
