//! Interactive shell loop
//!
//! Reads one command per stdin line and prints replies to stdout. Updates
//! from `listen` subscriptions are printed as they arrive, between prompts.

pub mod command;
pub mod playground;
pub mod session;

use std::io::Write;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::ui;
use command::parse_line;
pub use session::{Reply, Session};

/// Exit status for a shell that lost its API
pub const EXIT_UNREACHABLE: i32 = 1;

/// Print `reply`; returns the exit status when the shell should stop
pub fn render(reply: Reply) -> Option<i32> {
    match reply {
        Reply::Say(text) => {
            println!("{}", text);
            None
        }
        Reply::Quiet => None,
        Reply::Exit => Some(0),
        Reply::Abort(reason) => {
            ui::say_error(&reason);
            Some(EXIT_UNREACHABLE)
        }
    }
}

fn prompt(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{}", text).context("failed to write prompt")?;
    stdout.flush().context("failed to flush prompt")
}

/// Run the shell until `exit`, end of input, or an unreachable API
pub async fn run(
    mut session: Session,
    mut notices: mpsc::UnboundedReceiver<String>,
    prompt_text: &str,
) -> Result<i32> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt(prompt_text)?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read input")? else {
                    println!();
                    return Ok(0);
                };
                match session.execute(parse_line(&line)).await {
                    Ok(reply) => {
                        if let Some(status) = render(reply) {
                            return Ok(status);
                        }
                    }
                    Err(e) => ui::say_error(&format!("{:#}", e)),
                }
                prompt(prompt_text)?;
            }
            Some(notice) = notices.recv() => {
                println!("\n{}", notice);
                prompt(prompt_text)?;
            }
        }
    }
}
