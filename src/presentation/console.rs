//! Interactive pin console.
//!
//! Drives a [`PinBoard`] from stdin and renders readings pushed by the data
//! plane, one line per pin.

use crate::domain::pins::{format_reading, ParsePinError, Pin, PinBoard, PinOperation};
use crate::infrastructure::data_plane::{
    DataPlaneClient, DataPlaneMessage, DataPlaneReader, DataPlaneRequest,
};
use anyhow::Result;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

pub const HELP: &str = "\
commands:
  <pin> <high|low|read>   set a pin level or switch it to analogue read
  read                    request a reading from every pin in read mode
  show                    print the board
  status                  print session states
  help                    this text
  quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleInput {
    Select(Pin, PinOperation),
    Read,
    Show,
    Status,
    Help,
    Quit,
    Empty,
}

pub fn parse_input(line: &str) -> Result<ConsoleInput, ParsePinError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    Ok(match words.as_slice() {
        [] => ConsoleInput::Empty,
        ["read"] => ConsoleInput::Read,
        ["show"] => ConsoleInput::Show,
        ["status"] => ConsoleInput::Status,
        ["help"] | ["?"] => ConsoleInput::Help,
        ["quit"] | ["exit"] => ConsoleInput::Quit,
        [pin, op] => ConsoleInput::Select(pin.parse()?, op.parse()?),
        [other, ..] => return Err(ParsePinError::UnknownPin(other.to_string())),
    })
}

/// One row per pin: name, mode, last reading.
pub fn render_board(board: &PinBoard) -> String {
    board
        .pins()
        .iter()
        .map(|s| {
            let reading = s.reading.map(format_reading).unwrap_or_else(|| "-".into());
            format!("{:<4} {:<5} {}", s.pin.name(), s.mode.to_string(), reading)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn print_messages(mut reader: DataPlaneReader, board: Arc<Mutex<PinBoard>>) {
    loop {
        match reader.next_message() {
            Ok(Some(DataPlaneMessage::Notification(received))) => {
                let mut board = board.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(pin) = board.record(&received.notification) {
                    if let Some(value) = board.reading(pin) {
                        println!("[{}] {} = {}", received.device, pin, format_reading(value));
                    }
                }
            }
            Ok(Some(DataPlaneMessage::Status(sessions))) => {
                if sessions.is_empty() {
                    println!("no sessions");
                }
                for s in sessions {
                    println!("{}  {}", s.device, s.state);
                }
            }
            Ok(Some(DataPlaneMessage::Error(e))) => println!("error: {}", e),
            Ok(Some(other)) => debug!("Reply: {:?}", other),
            Ok(None) => {
                println!("data plane closed");
                break;
            }
            Err(e) => {
                warn!("Data plane read failed: {}", e);
                break;
            }
        }
    }
}

/// Run the console until `quit` or end of input.
pub fn run_console(client: DataPlaneClient, origin: u32) -> Result<()> {
    let board = Arc::new(Mutex::new(PinBoard::new(origin)));
    let (mut writer, reader) = client.into_split();

    let printer_board = board.clone();
    std::thread::Builder::new()
        .name("console-reader".into())
        .spawn(move || print_messages(reader, printer_board))?;

    println!("{}", HELP);
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let input = match parse_input(&line) {
            Ok(input) => input,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        let requests: Vec<DataPlaneRequest> = {
            let mut board = board.lock().unwrap_or_else(PoisonError::into_inner);
            match input {
                ConsoleInput::Select(pin, op) => board
                    .select(pin, op)
                    .map(DataPlaneRequest::Send)
                    .into_iter()
                    .collect(),
                ConsoleInput::Read => {
                    let reads = board.read_requests();
                    if reads.is_empty() {
                        println!("no pin is in read mode");
                    }
                    reads.into_iter().map(DataPlaneRequest::Send).collect()
                }
                ConsoleInput::Show => {
                    println!("{}", render_board(&board));
                    Vec::new()
                }
                ConsoleInput::Status => vec![DataPlaneRequest::Status],
                ConsoleInput::Help => {
                    println!("{}", HELP);
                    Vec::new()
                }
                ConsoleInput::Quit => break,
                ConsoleInput::Empty => Vec::new(),
            }
        };

        for request in &requests {
            writer.send(request)?;
        }
    }
    Ok(())
}
