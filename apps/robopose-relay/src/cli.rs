use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error};

use crate::signaling::{ClientEvent, ControlCommand, ServerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Parser, Debug)]
#[command(name = "robopose-relay")]
#[command(about = "Signaling relay for phone cameras and their viewers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to bind (overrides RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides RELAY_PORT / PORT)
    #[arg(short, long)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register as a viewer and print every availability update
    Watch {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://localhost:3000/ws")]
        url: String,
    },

    /// Send one control command to a phone
    Control {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://localhost:3000/ws")]
        url: String,

        /// Target phone identity
        #[arg(long)]
        phone: String,

        /// Command payload; parsed as JSON, sent as a plain string otherwise
        #[arg(long)]
        cmd: String,
    },
}

pub async fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Watch { url } => run_watch(&url).await,
        Commands::Control { url, phone, cmd } => run_control(&url, phone, &cmd).await,
    }
}

async fn connect(url: &str) -> Result<WsStream> {
    debug!("Connecting to {}", url);
    match timeout(Duration::from_secs(5), connect_async(url)).await {
        Ok(Ok((ws_stream, _))) => Ok(ws_stream),
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            Err(anyhow::anyhow!("Connection failed: {}", e))
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            Err(anyhow::anyhow!("Connection timeout - is the relay running?"))
        }
    }
}

async fn next_event(read: &mut SplitStream<WsStream>) -> Result<Option<ServerEvent>> {
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => return Ok(Some(serde_json::from_str(text.as_str())?)),
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

async fn run_watch(url: &str) -> Result<()> {
    let (mut write, mut read) = connect(url).await?.split();

    let register = serde_json::to_string(&ClientEvent::RegisterLaptop)?;
    write.send(Message::Text(register.into())).await?;

    while let Some(event) = next_event(&mut read).await? {
        match event {
            ServerEvent::Connected(info) => {
                println!("Connected as {}", info.connection_id);
            }
            ServerEvent::AvailablePhones(phones) if phones.is_empty() => {
                println!("No phones available");
            }
            ServerEvent::AvailablePhones(phones) => {
                println!("Available phones: {}", phones.join(", "));
            }
            other => debug!("Ignoring {:?}", other),
        }
    }

    println!("Relay closed the connection");
    Ok(())
}

async fn run_control(url: &str, phone: String, cmd: &str) -> Result<()> {
    let (mut write, _read) = connect(url).await?.split();

    let event = ClientEvent::Control(ControlCommand {
        cmd: parse_command(cmd),
        target_phone_id: phone.clone(),
    });
    write
        .send(Message::Text(serde_json::to_string(&event)?.into()))
        .await?;
    write.send(Message::Close(None)).await?;

    // The relay never acknowledges relayed messages.
    println!("Sent control command to {}", phone);
    Ok(())
}

fn parse_command(cmd: &str) -> Value {
    serde_json::from_str(cmd).unwrap_or_else(|_| Value::String(cmd.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn command_payload_falls_back_to_string() {
        assert_eq!(parse_command(r#"{"speed":2}"#), json!({ "speed": 2 }));
        assert_eq!(parse_command("forward"), json!("forward"));
    }

    #[test_timeout::timeout]
    fn parses_control_subcommand() {
        let cli = Cli::parse_from([
            "robopose-relay",
            "control",
            "--phone",
            "phoneA",
            "--cmd",
            "stop",
        ]);
        match cli.command {
            Some(Commands::Control { url, phone, cmd }) => {
                assert_eq!(url, "ws://localhost:3000/ws");
                assert_eq!(phone, "phoneA");
                assert_eq!(cmd, "stop");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
