//! Developer console for a Rabbithole session.
//!
//! Connects with the configuration from the environment, prints every chat
//! record and status change, and turns stdin lines into session commands:
//!
//! ```text
//! /signin <imei> <account-key>   /register <url>   /reset
//! /reconnect [url]               /ptt on|off       /stop
//! /status                        /wake             /quit
//! anything else is sent as text
//! ```
//!
//! Audio responses are acknowledged but not played.

use anyhow::Context;
use rabbithole_client::{
    AudioEngine, ClientConfig, CredentialStore, NoHaptics, PlaybackDone, PlaybackError,
    RabbitHole, SessionSnapshot,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

/// Accepts every audio buffer and reports it finished right away.
#[derive(Default)]
struct DiscardAudio {
    loaded: usize,
}

impl AudioEngine for DiscardAudio {
    fn load(&mut self, audio: &[u8], volume: Option<f32>) -> Result<(), PlaybackError> {
        if audio.is_empty() {
            return Err(PlaybackError::AudioInit("empty audio buffer".to_string()));
        }
        self.loaded = audio.len();
        info!(bytes = audio.len(), ?volume, "Audio response received");
        Ok(())
    }

    fn play(&mut self, done: PlaybackDone) {
        info!(token = done.token(), bytes = self.loaded, "Skipping playback");
        done.finish();
    }
}

/// Prints records and status changes as they are published.
async fn print_updates(mut updates: watch::Receiver<SessionSnapshot>) {
    let mut printed = 0;
    let mut last_state = None;
    loop {
        {
            let snapshot = updates.borrow_and_update();
            if last_state.as_ref() != Some(&snapshot.state) {
                println!("[status] {:?}", snapshot.state);
                last_state = Some(snapshot.state.clone());
            }
            for record in snapshot.records.iter().skip(printed) {
                let body = record
                    .text()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("<{} bytes>", record.content.len()));
                println!(
                    "[{}] {} ({:?}): {}",
                    record.timestamp.format("%H:%M:%S"),
                    record.author,
                    record.kind,
                    body
                );
            }
            printed = snapshot.records.len();
        }
        if updates.changed().await.is_err() {
            return;
        }
    }
}

/// One parsed console line.
#[derive(Debug, PartialEq)]
enum ConsoleCommand<'a> {
    Empty,
    Quit,
    SignIn { imei: &'a str, account_key: &'a str },
    Register(&'a str),
    Reset,
    Reconnect(Option<&'a str>),
    PushToTalk(bool),
    StopMeeting,
    Status,
    Wake,
    Text(&'a str),
    Usage(&'static str),
}

fn parse_line(line: &str) -> ConsoleCommand<'_> {
    let mut words = line.split_whitespace();
    match words.next() {
        None => ConsoleCommand::Empty,
        Some("/quit") => ConsoleCommand::Quit,
        Some("/signin") => match (words.next(), words.next()) {
            (Some(imei), Some(account_key)) => ConsoleCommand::SignIn { imei, account_key },
            _ => ConsoleCommand::Usage("usage: /signin <imei> <account-key>"),
        },
        Some("/register") => match words.next() {
            Some(url) => ConsoleCommand::Register(url),
            None => ConsoleCommand::Usage("usage: /register <url>"),
        },
        Some("/reset") => ConsoleCommand::Reset,
        Some("/reconnect") => ConsoleCommand::Reconnect(words.next()),
        Some("/ptt") => match words.next() {
            Some("on") => ConsoleCommand::PushToTalk(true),
            Some("off") => ConsoleCommand::PushToTalk(false),
            _ => ConsoleCommand::Usage("usage: /ptt on|off"),
        },
        Some("/stop") => ConsoleCommand::StopMeeting,
        Some("/status") => ConsoleCommand::Status,
        Some("/wake") => ConsoleCommand::Wake,
        Some(_) => ConsoleCommand::Text(line.trim()),
    }
}

/// Applies one console line. Returns `false` when the user asked to quit.
fn handle_line(session: &RabbitHole, line: &str) -> bool {
    match parse_line(line) {
        ConsoleCommand::Empty => {}
        ConsoleCommand::Quit => return false,
        ConsoleCommand::SignIn { imei, account_key } => session.sign_in(imei, account_key),
        ConsoleCommand::Register(url) => session.register(url),
        ConsoleCommand::Reset => session.reset_credentials(),
        ConsoleCommand::Reconnect(url) => session.reconnect(url.map(str::to_string)),
        ConsoleCommand::PushToTalk(active) => session.send_ptt(active, None),
        ConsoleCommand::StopMeeting => session.stop_meeting(),
        ConsoleCommand::Status => {
            session.refresh_status();
            match session.credentials() {
                Some(credentials) => println!("[status] signed in as {}", credentials.imei),
                None => println!("[status] no stored credentials"),
            }
        }
        // Same hook the host calls when the app returns to the foreground.
        ConsoleCommand::Wake => session.app_became_active(),
        ConsoleCommand::Text(text) => session.send_text(text),
        ConsoleCommand::Usage(usage) => println!("{}", usage),
    }
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = ClientConfig::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(url = %config.url, "Configuration loaded. Starting session...");

    // --- 3. Start the Session ---
    let credentials = CredentialStore::keychain(config.keychain_service.clone());
    let session = RabbitHole::spawn(
        &config,
        credentials,
        Box::new(DiscardAudio::default()),
        Box::new(NoHaptics),
    );
    let printer = tokio::spawn(print_updates(session.subscribe()));

    // --- 4. Read Commands ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    if !handle_line(&session, &line) {
                        break;
                    }
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                }
                info!("Received shutdown signal. Shutting down gracefully...");
                break;
            }
        }
    }

    session.shutdown().await;
    printer.abort();
    info!("Session has shut down.");
    Ok(())
}
