//! Line-editing loops for chat mode and the interactive shell.

use anyhow::Result;
use console::{Style, Term, style};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use conduit_llm::Message;

use super::ask::cancel_on_ctrl_c;
use super::{print_diagnostic, render};
use crate::setup::Runtime;

/// What a line asks the loop to do.
#[derive(Debug, PartialEq, Eq)]
pub enum ChatCommand<'a> {
    Quit,
    Clear,
    Tools,
    Help,
    Message(&'a str),
}

impl<'a> ChatCommand<'a> {
    /// Commands are bare words; a leading `/` is also accepted.
    pub fn parse(line: &'a str) -> Self {
        match line.trim().trim_start_matches('/') {
            "quit" | "exit" | "q" => ChatCommand::Quit,
            "clear" | "cls" => ChatCommand::Clear,
            "tools" => ChatCommand::Tools,
            "help" | "?" => ChatCommand::Help,
            _ => ChatCommand::Message(line.trim()),
        }
    }
}

/// REPL state.
pub struct Repl {
    runtime: Runtime,
    editor: Editor<(), DefaultHistory>,
    term: Term,
    history: Vec<Message>,
    verbose: bool,
}

impl Repl {
    pub fn new(runtime: Runtime, verbose: bool) -> Result<Self> {
        let config = Config::builder()
            .history_ignore_space(true)
            .auto_add_history(true)
            .build();

        Ok(Self {
            runtime,
            editor: Editor::with_config(config)?,
            term: Term::stdout(),
            history: Vec::new(),
            verbose,
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Chat until `quit` or Ctrl-D. History persists across turns.
    pub async fn chat(&mut self) -> Result<()> {
        self.print_chat_welcome();

        loop {
            let prompt = format!("{} ", style("you>").green().bold());
            let line = match self.editor.readline(&prompt) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) => {
                    println!();
                    print_dim("(Interrupted - type quit to leave chat)");
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!();
                    break;
                }
                Err(e) => {
                    print_diagnostic("input", &e.to_string());
                    break;
                }
            };

            match ChatCommand::parse(&line) {
                ChatCommand::Message("") => continue,
                ChatCommand::Quit => break,
                ChatCommand::Clear => {
                    self.history.clear();
                    self.term.clear_screen()?;
                    print_dim("Conversation cleared");
                }
                ChatCommand::Tools => self.print_tools(),
                ChatCommand::Help => print_chat_help(),
                ChatCommand::Message(message) => {
                    let message = message.to_string();
                    if let Err(e) = self.send(&message).await {
                        print_diagnostic("chat", &e.to_string());
                    }
                }
            }
        }

        print_dim("Leaving chat");
        Ok(())
    }

    /// Send one message, continuing the conversation so far.
    async fn send(&mut self, message: &str) -> Result<()> {
        let (archive_tx, archive_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let watcher = cancel_on_ctrl_c(cancel.clone());

        let engine = self
            .runtime
            .engine(self.history.clone(), Some(archive_tx), Some(cancel))?;
        let outcome = render(engine.submit(message), self.verbose).await;
        watcher.abort();

        // The archive holds the whole conversation, including failed turns.
        if let Ok(messages) = archive_rx.await {
            self.history = messages;
        }

        if let Some(rounds) = outcome?.rounds.filter(|r| *r > 0) {
            tracing::debug!(rounds, "Query used tools");
        }
        println!();
        Ok(())
    }

    /// The top-level shell entered when no subcommand is given.
    pub async fn shell(&mut self) -> Result<()> {
        print_shell_welcome();

        loop {
            let prompt = format!("{} ", style("conduit>").cyan().bold());
            let line = match self.editor.readline(&prompt) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) => {
                    println!();
                    print_dim("(Interrupted - type quit to exit)");
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!();
                    break;
                }
                Err(e) => {
                    print_diagnostic("input", &e.to_string());
                    break;
                }
            };

            match line.trim() {
                "" => continue,
                "list-tools" | "tools" => self.print_tools(),
                "chat" => self.chat().await?,
                "clear" | "cls" => self.term.clear_screen()?,
                "help" | "?" => print_shell_help(),
                "quit" | "exit" => break,
                other => {
                    print_diagnostic("shell", &format!("unknown command: {}", other));
                    print_dim("Type help for available commands");
                }
            }
        }

        print_dim("Goodbye!");
        Ok(())
    }

    fn print_tools(&self) {
        let snapshot = self.runtime.registry.snapshot();
        if snapshot.is_empty() {
            print_dim("No tools available");
            return;
        }

        let dim = Style::new().dim();
        println!();
        println!("{}", style("Available Tools").bold());
        println!("{}", dim.apply_to("─".repeat(40)));
        for tool in snapshot.iter() {
            match &tool.description {
                Some(description) => println!(
                    "  {}  {}",
                    style(&tool.qualified_name).cyan(),
                    dim.apply_to(description)
                ),
                None => println!("  {}", style(&tool.qualified_name).cyan()),
            }
        }
        println!();
    }

    fn print_chat_welcome(&self) {
        let dim = Style::new().dim();
        println!();
        println!("{}", style("Conduit Chat").bold().cyan());
        println!("{}", dim.apply_to("─".repeat(40)));
        println!(
            "{}",
            dim.apply_to(format!(
                "Model {} with {} tools. Type help for commands.",
                self.runtime.provider.model(),
                self.runtime.registry.snapshot().len()
            ))
        );
        println!();
    }
}

fn print_dim(msg: &str) {
    let dim = Style::new().dim();
    println!("{}", dim.apply_to(msg));
}

fn print_chat_help() {
    let dim = Style::new().dim();
    println!();
    println!("{}", style("Chat Commands").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!("  {}  - Leave chat", style("quit, exit").cyan());
    println!("  {}  - Forget the conversation", style("clear").cyan());
    println!("  {}  - List available tools", style("tools").cyan());
    println!("  {}  - Show this help", style("help").cyan());
    println!();
    println!("{}", dim.apply_to("Ctrl+C cancels a running answer."));
    println!();
}

fn print_shell_welcome() {
    let dim = Style::new().dim();
    println!();
    println!("{}", style("Conduit").bold().cyan());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!("{}", dim.apply_to("Type help for commands, Ctrl+D to exit."));
    println!();
}

fn print_shell_help() {
    let dim = Style::new().dim();
    println!();
    println!("{}", style("Available Commands").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!("  {}  - List available tools", style("list-tools").cyan());
    println!("  {}  - Start chat mode", style("chat").cyan());
    println!("  {}  - Clear the screen", style("clear").cyan());
    println!("  {}  - Show this help", style("help").cyan());
    println!("  {}  - Exit", style("quit").cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_commands() {
        assert_eq!(ChatCommand::parse("quit"), ChatCommand::Quit);
        assert_eq!(ChatCommand::parse(" /exit "), ChatCommand::Quit);
        assert_eq!(ChatCommand::parse("cls"), ChatCommand::Clear);
        assert_eq!(ChatCommand::parse("/tools"), ChatCommand::Tools);
        assert_eq!(ChatCommand::parse("?"), ChatCommand::Help);
        assert_eq!(
            ChatCommand::parse("  how many orders?  "),
            ChatCommand::Message("how many orders?")
        );
        assert_eq!(ChatCommand::parse("   "), ChatCommand::Message(""));
    }
}
