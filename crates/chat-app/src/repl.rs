use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::chat::{ChatController, Role, SessionPhase};

type InputLines = Lines<BufReader<Stdin>>;

/// Line-oriented surface over the controller.
///
/// Renders [`crate::chat::SessionStore`] state and issues controller calls;
/// it never touches the message list directly.
pub struct ChatRepl {
    controller: ChatController,
}

impl ChatRepl {
    pub fn new(controller: ChatController) -> Self {
        Self { controller }
    }

    pub async fn run(mut self) {
        self.print_welcome();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            if !prompt() {
                break;
            }
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(error = %error, "failed to read input");
                    break;
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            self.controller.pump();
            if line.starts_with('/') {
                if self.handle_command(line, &mut lines).await {
                    break;
                }
                continue;
            }

            self.send(line, &mut lines).await;
        }

        println!("Bye!");
    }

    async fn send(&mut self, text: &str, lines: &mut InputLines) {
        if !self.controller.send_message(text).await {
            return;
        }
        let Some(resolved) = self.wait_for_reply(lines).await else {
            return;
        };

        let Some(reply) = self.controller.store().messages().last() else {
            return;
        };
        println!("{}", reply.content);
        if !resolved && let Some(detail) = &reply.error {
            println!("  ({detail})");
        }
    }

    /// Waits for the pending reply while keeping stdin responsive so `/stop`
    /// can land mid-turn. Returns the resolution outcome, or `None` when the
    /// turn was stopped.
    async fn wait_for_reply(&mut self, lines: &mut InputLines) -> Option<bool> {
        enum Step {
            Resolved(bool),
            Input(Option<String>),
        }

        while self.controller.is_generating() {
            let step = tokio::select! {
                resolved = self.controller.resolve_turn() => Step::Resolved(resolved),
                line = lines.next_line() => Step::Input(line.unwrap_or_default()),
            };

            match step {
                Step::Resolved(resolved) => {
                    self.controller.pump();
                    return Some(resolved);
                }
                Step::Input(Some(line)) if line.trim() == "/stop" => {
                    self.controller.stop_generation().await;
                    println!("Stopped.");
                    return None;
                }
                Step::Input(Some(line)) => {
                    if !line.trim().is_empty() {
                        println!("(reply pending; /stop to cancel)");
                    }
                }
                // Stdin is gone, stop the turn and let the caller wind down.
                Step::Input(None) => {
                    self.controller.stop_generation().await;
                    return None;
                }
            }
        }
        Some(true)
    }

    /// Handles one slash command; returns true when the loop should exit.
    async fn handle_command(&mut self, line: &str, lines: &mut InputLines) -> bool {
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "/quit" | "/exit" | "/q" => return true,
            "/help" | "/h" | "/?" => self.print_help(),
            "/new" => {
                self.controller.create_new_session().await;
                println!("Started a new conversation.");
            }
            "/list" => self.print_sessions(),
            "/select" => match self.session_at(rest) {
                Some(session_id) => {
                    self.controller.select_session(Some(session_id)).await;
                    self.print_messages();
                }
                None => println!("Usage: /select <number from /list>"),
            },
            "/delete" => match self.session_at(rest) {
                Some(session_id) => {
                    self.controller.delete_session(session_id).await;
                    println!("Deleted.");
                    self.print_sessions();
                }
                None => println!("Usage: /delete <number from /list>"),
            },
            "/regen" => self.regenerate(lines).await,
            // A pending turn is only ever awaited inside wait_for_reply, so a
            // /stop that reaches this dispatcher has nothing to cancel.
            "/stop" => println!("Nothing to stop."),
            "/edit" => match rest.split_once(char::is_whitespace) {
                Some((index, text)) if index.parse::<usize>().is_ok() => {
                    let index: usize = index.parse().unwrap_or_default();
                    if self.controller.edit_message(index, text).await {
                        self.print_messages();
                    } else {
                        println!("Nothing edited.");
                    }
                }
                _ => println!("Usage: /edit <message number> <new text>"),
            },
            "/messages" => self.print_messages(),
            _ => {
                println!("Unknown command: {command}");
                println!("Type /help for available commands");
            }
        }
        false
    }

    /// Regenerates the most recent assistant reply, the only one the surface
    /// exposes for regeneration.
    async fn regenerate(&mut self, lines: &mut InputLines) {
        let target = self
            .controller
            .store()
            .messages()
            .iter()
            .rposition(|message| message.role == Role::Assistant);

        let Some(index) = target else {
            println!("No assistant reply to regenerate.");
            return;
        };
        if !self.controller.regenerate_response(index).await {
            println!("Cannot regenerate right now.");
            return;
        }
        if self.wait_for_reply(lines).await.is_none() {
            return;
        }

        if let Some(reply) = self.controller.store().messages().get(index) {
            println!("{}", reply.content);
        }
    }

    fn session_at(&self, argument: &str) -> Option<murmur_store::SessionId> {
        let number: usize = argument.parse().ok()?;
        self.controller
            .store()
            .sessions()
            .get(number.checked_sub(1)?)
            .map(|session| session.id.clone())
    }

    fn print_welcome(&self) {
        println!();
        println!("murmur chat");
        println!("Type a message and press enter, or /help for commands.");
        println!();
    }

    fn print_help(&self) {
        println!();
        println!("Commands:");
        println!("  /new                    start a new conversation");
        println!("  /list                   list conversations");
        println!("  /select <n>             switch to conversation n");
        println!("  /delete <n>             delete conversation n");
        println!("  /regen                  regenerate the last reply");
        println!("  /stop                   cancel the pending reply");
        println!("  /edit <n> <text>        rewrite message n");
        println!("  /messages               show the current conversation");
        println!("  /quit                   exit");
        println!();
    }

    fn print_sessions(&self) {
        let store = self.controller.store();
        if store.sessions().is_empty() {
            println!("No conversations yet.");
            return;
        }
        for (position, session) in store.sessions().iter().enumerate() {
            let marker = if Some(&session.id) == store.selected() {
                "*"
            } else {
                " "
            };
            println!(
                "{marker} {}. {} ({} messages)",
                position + 1,
                session.title,
                session.message_count
            );
        }
    }

    fn print_messages(&self) {
        let store = self.controller.store();
        if let Some(error) = store.store_error() {
            println!("(store unavailable: {error})");
        }
        if store.phase() == SessionPhase::Unselected {
            println!("No conversation selected.");
            return;
        }
        for (index, message) in store.messages().iter().enumerate() {
            let speaker = match message.role {
                Role::User => "you",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            let state = if message.is_streaming { " …" } else { "" };
            println!("{index}. [{speaker}]{state} {}", message.content);
            if let Some(error) = &message.error {
                println!("   ({error})");
            }
        }
    }
}

fn prompt() -> bool {
    print!("> ");
    std::io::stdout().flush().is_ok()
}
