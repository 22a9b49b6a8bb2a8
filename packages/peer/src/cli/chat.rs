//! `peer chat`: a line-oriented terminal client for the socket endpoints.

use anyhow::{Context, Result};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite;

use peer_relay::Notification;

#[derive(Parser, Debug)]
pub struct ChatArgs {
    /// Chat to join
    #[arg(long)]
    pub chat_id: String,

    /// Name to join as
    #[arg(long)]
    pub user_id: String,

    /// Server base URL
    #[arg(long, default_value = "ws://127.0.0.1:7878")]
    pub server: String,

    /// Use the polling queue endpoint instead of pub/sub
    #[arg(long)]
    pub queue: bool,
}

impl ChatArgs {
    fn url(&self) -> String {
        let endpoint = if self.queue { "queue" } else { "chat" };
        format!(
            "{}/api/ws/{}?chat_id={}&user_id={}",
            self.server.trim_end_matches('/'),
            endpoint,
            urlencoding::encode(&self.chat_id),
            urlencoding::encode(&self.user_id)
        )
    }
}

/// Render one server notification as a terminal line.
pub fn render(notification: &Notification) -> String {
    match notification {
        Notification::Info { body } => format!("* {body}"),
        Notification::Chat { message } => format!("<{}> {}", message.sender_id, message.payload),
    }
}

pub async fn chat_command(args: ChatArgs) -> Result<()> {
    let url = args.url();
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        ws_write
                            .send(tungstenite::Message::Text(line.into()))
                            .await
                            .context("Failed to send message")?;
                    }
                    None => {
                        let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        let mut stdout = std::io::stdout().lock();
                        match serde_json::from_str::<Notification>(text.as_str()) {
                            Ok(n) => writeln!(stdout, "{}", render(&n))?,
                            Err(_) => writeln!(stdout, "? {}", text.as_str())?,
                        }
                        stdout.flush()?;
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        eprintln!("[peer: connection closed]");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("Connection error"),
                }
            }
        }
    }
    Ok(())
}
