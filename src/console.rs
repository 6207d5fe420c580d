//! Operator console: stdin commands in, one-line status out.

use crate::appliance::{ApplianceState, ApplianceStatus, Command};
use crate::diagnostics::format_bytes;
use crate::frame::Frame;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const HELP: &str = "commands: start | stop | export [session..] | status | quit";

pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err(HELP.to_string());
    };
    let cmd = match verb.to_ascii_lowercase().as_str() {
        "start" | "record" => Command::Start,
        "stop" => Command::Stop,
        "export" => Command::Export(words.map(str::to_string).collect()),
        "status" | "s" => Command::Status,
        "quit" | "exit" | "q" => Command::Quit,
        "help" | "?" => return Err(HELP.to_string()),
        other => return Err(format!("unknown command {:?}; {}", other, HELP)),
    };
    Ok(cmd)
}

/// Forwards stdin lines to the appliance until EOF or the loop goes away.
pub fn spawn_stdin_reader(tx: mpsc::Sender<Command>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_command(&line) {
                        Ok(cmd) => {
                            if tx.send(cmd).await.is_err() {
                                break;
                            }
                        }
                        Err(msg) => eprintln!("{}", msg),
                    }
                }
                Ok(None) => {
                    tracing::debug!("stdin closed, console input disabled");
                    break;
                }
                Err(e) => {
                    tracing::warn!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    })
}

pub fn format_status(status: &ApplianceStatus) -> String {
    let mut out = String::new();
    let state = match status.state {
        ApplianceState::Ready => "READY",
        ApplianceState::Recording => "REC",
        ApplianceState::Exporting => "EXPORT",
    };
    out.push_str(state);
    if let Some(id) = &status.session_id {
        let _ = write!(out, " {} rows={} images={}", id, status.stats.rows, status.stats.images);
    }
    for reading in &status.readout {
        match reading.rgb {
            Some(c) => {
                let _ = write!(out, " {}=({},{},{})", reading.point.id, c.r, c.g, c.b);
            }
            None => {
                let _ = write!(out, " {}=n/a", reading.point.id);
            }
        }
    }
    let _ = write!(out, " | {}", status.disk);
    if let Some(rate) = status.disk_rate.filter(|r| *r > 0.0) {
        let _ = write!(out, " (-{}/s)", format_bytes(rate as u64));
    }
    if status.frame_errors > 0 {
        let _ = write!(out, " | frame errors {}", status.frame_errors);
    }
    if !status.message.is_empty() {
        let _ = write!(out, " | {}", status.message);
    }
    out
}

/// Logs the status line every `period` while anything changes.
pub fn spawn_status_logger(
    mut rx: watch::Receiver<ApplianceStatus>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let mut last = String::new();
        loop {
            ticker.tick().await;
            match rx.has_changed() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => break,
            }
            let line = format_status(&rx.borrow_and_update());
            if line != last {
                tracing::info!("{}", line);
                last = line;
            }
        }
    })
}

/// Size of the scaled live view for a capture resolution.
pub fn preview_label(width: u32, height: u32, max_width: u32) -> String {
    let (w, h) = Frame::preview_dimensions(width, height, max_width);
    format!("{}x{} (preview {}x{})", width, height, w, h)
}
