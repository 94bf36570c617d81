//! Chat command handler.
//!
//! Interactive question loop over one repository. Each answer sees the
//! conversation so far.

use super::{open_ready, print_answer_stream};
use clap::Args;
use repowiki_core::{config::AppConfig, AppError, AppResult};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
Commands:
  help, h, ?     Show this help
  clear, cls     Forget the conversation so far
  exit, quit, q  Leave the chat
Anything else is asked as a question. Ctrl-C stops an answer in progress.";

/// What a line of input asks for.
#[derive(Debug, PartialEq, Eq)]
enum ChatInput<'a> {
    Help,
    Clear,
    Exit,
    Empty,
    Question(&'a str),
}

impl<'a> ChatInput<'a> {
    fn parse(line: &'a str) -> Self {
        let trimmed = line.trim();
        match trimmed.to_lowercase().as_str() {
            "" => ChatInput::Empty,
            "help" | "h" | "?" => ChatInput::Help,
            "clear" | "cls" => ChatInput::Clear,
            "exit" | "quit" | "q" => ChatInput::Exit,
            _ => ChatInput::Question(trimmed),
        }
    }
}

/// Interactive question and answer session
#[derive(Args, Debug)]
pub struct ChatCommand {
    /// Path to a local checkout, or the URL it was built from
    pub repo: String,
}

impl ChatCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing chat command for '{}'", self.repo);

        let kb = open_ready(config, &self.repo).await?;
        println!(
            "Chatting about '{}'. Type 'help' for commands.",
            kb.repository()
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            print!("> ");
            std::io::stdout().flush().ok();

            // Ctrl-C at the prompt leaves, like end of input
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                println!();
                break;
            };

            match ChatInput::parse(&line) {
                ChatInput::Empty => continue,
                ChatInput::Help => println!("{}", HELP),
                ChatInput::Clear => {
                    kb.clear_conversation();
                    println!("Conversation cleared.");
                }
                ChatInput::Exit => break,
                ChatInput::Question(question) => {
                    let result = match kb.query(question).await {
                        Ok(stream) => print_answer_stream(stream, question).await.map(|_| ()),
                        Err(e) => Err(e),
                    };

                    match result {
                        Ok(()) => {}
                        Err(e @ (AppError::Generation(_) | AppError::BuildInProgress)) => {
                            eprintln!("{}", e);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        tracing::debug!("Chat ended after {} turns", kb.history().len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ChatInput::parse("help"), ChatInput::Help);
        assert_eq!(ChatInput::parse(" ? "), ChatInput::Help);
        assert_eq!(ChatInput::parse("CLS"), ChatInput::Clear);
        assert_eq!(ChatInput::parse("quit"), ChatInput::Exit);
        assert_eq!(ChatInput::parse("q"), ChatInput::Exit);
        assert_eq!(ChatInput::parse("   "), ChatInput::Empty);
    }

    #[test]
    fn test_questions_are_trimmed() {
        assert_eq!(
            ChatInput::parse("  where is the router?\n"),
            ChatInput::Question("where is the router?")
        );
    }
}
