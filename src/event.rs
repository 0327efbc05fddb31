use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Messages the hosting application posts to the layer, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
  /// A client (page, session) started
  Register { client: String },
  /// A client went away
  Release { client: String },
  /// An intercepted outbound request
  Fetch {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    client: Option<String>,
  },
  /// Cut over now instead of waiting for old clients
  #[serde(alias = "SKIP_WAITING")]
  ForceActivate,
}

fn default_method() -> String {
  "GET".to_string()
}

/// Runtime events
#[derive(Debug)]
pub enum Event {
  Message(Message),
  /// A line that didn't parse
  Invalid(String),
  /// Periodic lifecycle check
  Tick,
  /// Input closed
  Closed,
}

/// Event handler that produces events from stdin and a tick timer
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn input reader
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      let mut ticks = tokio::time::interval(tick_rate);

      loop {
        let event = tokio::select! {
          line = lines.next_line() => match line {
            Ok(Some(line)) if line.trim().is_empty() => None,
            Ok(Some(line)) => Some(parse_line(&line)),
            Ok(None) | Err(_) => Some(Event::Closed),
          },
          _ = ticks.tick() => Some(Event::Tick),
        };
        let Some(event) = event else {
          continue;
        };

        let closed = matches!(event, Event::Closed);
        if tx.send(event).is_err() || closed {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

fn parse_line(line: &str) -> Event {
  match serde_json::from_str(line) {
    Ok(message) => Event::Message(message),
    Err(e) => Event::Invalid(format!("{}: {}", e, line)),
  }
}
