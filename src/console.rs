//! Interaction adapter — prompts the local player.
//!
//! One task owns the input stream; callers post a prompt request over an
//! mpsc channel and await the reply on a oneshot. The session lock is
//! never held while the user types. Production wires stdin; tests hand in
//! a scripted reader.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};

/// A syntactically valid answer to the move prompt.
///
/// Coordinates are 0-based; range and occupancy are the board's call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveInput {
    Cell { row: i32, col: i32 },
    Quit,
}

enum Prompt {
    Move {
        reply: oneshot::Sender<MoveInput>,
    },
    YesNo {
        question: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Handle to the prompt task. Cheap to clone.
#[derive(Clone)]
pub struct Console {
    tx: mpsc::Sender<Prompt>,
}

impl Console {
    /// Adapter over standard input.
    pub fn stdin() -> Self {
        Self::with_reader(BufReader::new(tokio::io::stdin()))
    }

    /// Adapter over an arbitrary input stream.
    pub fn with_reader<R>(reader: BufReader<R>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(prompt_task(reader, rx));
        Self { tx }
    }

    /// Scripted console for tests: answers come from `input` line by line.
    pub fn scripted(input: &str) -> Self {
        let cursor = std::io::Cursor::new(input.to_owned().into_bytes());
        Self::with_reader(BufReader::new(cursor))
    }

    /// Ask for a move until the answer parses; `quit` short-circuits.
    /// An exhausted or closed input stream counts as quitting.
    pub async fn prompt_move(&self) -> MoveInput {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Prompt::Move { reply }).await.is_err() {
            return MoveInput::Quit;
        }
        rx.await.unwrap_or(MoveInput::Quit)
    }

    /// Yes/no question; an answer starting with `s`/`S` means yes.
    /// An exhausted or closed input stream means no.
    pub async fn ask_yes_no(&self, question: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let prompt = Prompt::YesNo {
            question: question.to_owned(),
            reply,
        };
        if self.tx.send(prompt).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

async fn prompt_task<R>(mut reader: BufReader<R>, mut rx: mpsc::Receiver<Prompt>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut line = String::new();
    while let Some(prompt) = rx.recv().await {
        match prompt {
            Prompt::Move { reply } => {
                let answer = loop {
                    show_prompt("Enter move (row col) or 'quit': ");
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break MoveInput::Quit,
                        Ok(_) => {}
                    }
                    let trimmed = line.trim();
                    if trimmed.eq_ignore_ascii_case("quit") {
                        break MoveInput::Quit;
                    }
                    match parse_move(trimmed) {
                        Ok((row, col)) => break MoveInput::Cell { row, col },
                        Err(MoveParseError::WrongArity) => {
                            println!("Invalid format. Enter two numbers separated by a space.")
                        }
                        Err(MoveParseError::NotNumeric) => {
                            println!("Non-numeric input. Try again.")
                        }
                    }
                };
                let _ = reply.send(answer);
            }
            Prompt::YesNo { question, reply } => {
                show_prompt(&question);
                line.clear();
                let answer = match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => false,
                    Ok(_) => line.trim().to_lowercase().starts_with('s'),
                };
                let _ = reply.send(answer);
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum MoveParseError {
    WrongArity,
    NotNumeric,
}

/// Parse `row col` (1-based) into 0-based coordinates.
fn parse_move(input: &str) -> Result<(i32, i32), MoveParseError> {
    let fields: Vec<&str> = input.split_whitespace().collect();
    if fields.len() != 2 {
        return Err(MoveParseError::WrongArity);
    }
    match (fields[0].parse::<i32>(), fields[1].parse::<i32>()) {
        (Ok(row), Ok(col)) => Ok((row - 1, col - 1)),
        _ => Err(MoveParseError::NotNumeric),
    }
}

fn show_prompt(text: &str) {
    print!("{text}");
    let _ = std::io::stdout().flush();
}
