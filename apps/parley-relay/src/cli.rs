use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use parley_proto::{ClientMessage, ConnectionId, ServerMessage};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "parley-relay")]
#[command(about = "Parley signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay (default when no command is given)
    Serve(ServeArgs),
    /// Connect to a relay, claim a username and print what the relay reports
    Probe {
        /// Relay URL (e.g., ws://localhost:8000)
        #[arg(short, long, default_value = "ws://localhost:8000")]
        url: String,

        /// Username to propose
        #[arg(short = 'n', long, default_value = "probe")]
        username: String,

        /// Seconds to wait for each relay response
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
    },
}

#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Interface to bind (overrides PARLEY_RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides PARLEY_RELAY_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// First connection id (overrides PARLEY_RELAY_ID_SEED)
    #[arg(long)]
    pub id_seed: Option<u64>,
}

/// What the relay told the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub id: ConnectionId,
    pub username: String,
    pub roster: Vec<String>,
}

pub async fn run_probe(url: &str, username: &str, wait: Duration) -> Result<ProbeReport> {
    debug!("Connecting to {}", url);

    let (ws_stream, _) = match timeout(wait, connect_async(url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after {:?}", wait);
            return Err(anyhow!("Connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let id = loop {
        match timeout(wait, next_server_message(&mut read)).await.context("no id from relay")?? {
            ServerMessage::Id { id } => break id,
            other => debug!(?other, "ignoring message while waiting for id"),
        }
    };

    let request = serde_json::to_string(&ClientMessage::set_username(username))?;
    write.send(Message::Text(request.into())).await?;

    let mut accepted = None;
    let mut roster = Vec::new();
    while accepted.is_none() || roster.is_empty() {
        match timeout(wait, next_server_message(&mut read))
            .await
            .context("relay did not answer the username request")??
        {
            ServerMessage::UsernameAccepted { username } => accepted = Some(username),
            // Only rosters sent after the name was accepted include it.
            ServerMessage::UserList { users } if accepted.is_some() => roster = users,
            ServerMessage::Error { message, .. } => bail!("relay rejected username: {message}"),
            other => debug!(?other, "ignoring message while waiting for username"),
        }
    }

    let _ = write.send(Message::Close(None)).await;

    Ok(ProbeReport {
        id,
        username: accepted.unwrap_or_default(),
        roster,
    })
}

async fn next_server_message<S>(read: &mut S) -> Result<ServerMessage>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = read
            .next()
            .await
            .ok_or_else(|| anyhow!("relay closed the connection"))?
            .context("websocket read failed")?;
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).context("unexpected frame from relay");
        }
    }
}
