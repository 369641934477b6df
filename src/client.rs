//! Minimal command-line client: send one request and render the frames.

use crate::protocol::{Channel, OutputFrame};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub url: String,
    pub language: String,
    pub code: String,
    pub token: String,
    pub custom_dir: Option<PathBuf>,
    pub run_args: Option<String>,
    pub comp_args: Option<String>,
}

/// How the connection ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Run finished; carries the timing payload, e.g. `12.34ms`.
    Completed(String),
    /// The server reported an error on the `e` channel and closed.
    Failed,
    /// The connection closed without a terminal frame.
    Incomplete,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }
}

/// Submit one request and write `o` frames to `out`, everything else to `err`.
pub async fn submit<O, E>(options: &SubmitOptions, out: &mut O, err: &mut E) -> Result<Outcome, ClientError>
where
    O: Write,
    E: Write,
{
    let mut request = json!({
        "language": options.language,
        "code": options.code,
        "uuid": options.token,
    });
    if let Some(dir) = &options.custom_dir {
        request["customDir"] = json!(dir);
    }
    if let Some(args) = &options.run_args {
        request["runArgs"] = json!(args);
    }
    if let Some(args) = &options.comp_args {
        request["compArgs"] = json!(args);
    }

    let (mut socket, _) = connect_async(options.url.as_str()).await?;
    socket.send(Message::Text(request.to_string())).await?;

    let mut saw_error = false;
    let mut timing = None;
    while let Some(message) = socket.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            // A reset after the last frame still ends the session.
            Err(_) => break,
        };
        match OutputFrame::decode(&text) {
            Some(frame) => match frame.channel {
                Channel::Stdout => {
                    out.write_all(frame.payload.as_bytes())?;
                    out.flush()?;
                }
                Channel::Stderr => {
                    saw_error = true;
                    err.write_all(frame.payload.as_bytes())?;
                    if !frame.payload.ends_with('\n') {
                        writeln!(err)?;
                    }
                }
                Channel::Timing => {
                    writeln!(err, "finished in {}", frame.payload)?;
                    timing = Some(frame.payload);
                }
            },
            None => writeln!(err, "{text}")?,
        }
    }

    Ok(match timing {
        Some(elapsed) => Outcome::Completed(elapsed),
        None if saw_error => Outcome::Failed,
        None => Outcome::Incomplete,
    })
}
