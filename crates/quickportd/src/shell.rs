//! Interactive shell run once a session is up.

use std::str::FromStr;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use quickport_core::message::{ControlMessage, FileMeta};
use quickport_core::{CompressionMode, Envelope};
use quickport_services::net::send_envelope;
use quickport_services::{get_file, SessionEvent, SessionRuntime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { path: String, mode: CompressionMode },
    Ls,
    Say(String),
    Reset,
    Help,
    Exit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        match verb {
            "get" => {
                let mut args = rest.split_whitespace();
                let path = args.next().ok_or("usage: get <path> [none|low|medium|high]")?;
                let mode = match args.next() {
                    Some(m) => m.parse().map_err(|e| format!("{e}"))?,
                    None => CompressionMode::None,
                };
                if args.next().is_some() {
                    return Err("usage: get <path> [none|low|medium|high]".into());
                }
                Ok(Self::Get {
                    path: path.to_string(),
                    mode,
                })
            }
            "ls" => Ok(Self::Ls),
            "say" if !rest.is_empty() => Ok(Self::Say(rest.to_string())),
            "say" => Err("usage: say <text>".into()),
            "reset" => Ok(Self::Reset),
            "help" | "?" => Ok(Self::Help),
            "exit" | "quit" => Ok(Self::Exit),
            other => Err(format!("unknown command {other:?}, try help")),
        }
    }
}

const HELP: &str = "\
commands:
  get <path> [none|low|medium|high]   download a file from the peer
  ls                                  list the peer's shared files
  say <text>                          send a chat line
  reset                               rebind sockets and restart background tasks
  exit                                leave";

pub async fn run(
    mut runtime: SessionRuntime,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut peer_catalog: Vec<FileMeta>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("connected to {}. type help for commands.", runtime.handle().peer.name);

    loop {
        tokio::select! {
            Some(event) = events.recv() => show_event(event, &mut peer_catalog),
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match line.parse::<Command>() {
                    Ok(c) => c,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                };
                match command {
                    Command::Get { path, mode } => {
                        let settings = runtime.transfer_settings().clone();
                        match get_file(runtime.handle(), &path, mode, &settings).await {
                            Ok(r) => println!(
                                "saved {} ({} bytes, {} chunks, {} recovery rounds)",
                                r.path.display(), r.bytes, r.chunks, r.rounds
                            ),
                            Err(e) => println!("get failed: {e}"),
                        }
                    }
                    Command::Ls => print_catalog(&peer_catalog),
                    Command::Say(text) => {
                        let handle = runtime.handle();
                        let msg = Envelope::Message(ControlMessage::Text(text));
                        if let Err(e) = send_envelope(&handle.local.primary, handle.peer.primary_addr, &msg).await {
                            println!("send failed: {e}");
                        }
                    }
                    Command::Reset => {
                        runtime = runtime.reset().await?;
                        println!("session reset");
                    }
                    Command::Help => println!("{HELP}"),
                    Command::Exit => break,
                }
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}

fn show_event(event: SessionEvent, catalog: &mut Vec<FileMeta>) {
    match event {
        SessionEvent::LivenessAlert { level, silent_for } => {
            println!("! no heartbeat from peer for {}s ({level:?}); try reset", silent_for.as_secs());
        }
        SessionEvent::LivenessRestored => println!("peer heartbeat restored"),
        SessionEvent::PeerError(e) => println!("! peer error ({:?}): {}", e.code, e.error),
        SessionEvent::PeerMessage(text) => println!("peer> {text}"),
        SessionEvent::PeerCatalog(files) => {
            println!("peer catalog updated ({} files)", files.len());
            *catalog = files;
        }
        SessionEvent::PeerFile(meta) => {
            println!("peer shared {} ({} bytes)", meta.filename, meta.size);
            catalog.retain(|m| m.filename != meta.filename);
            catalog.push(meta);
        }
        SessionEvent::TransferServed { path, result } => match result {
            Ok(chunks) => println!("sent {path} to peer ({chunks} chunks)"),
            Err(e) => println!("sending {path} failed: {e}"),
        },
    }
}

fn print_catalog(catalog: &[FileMeta]) {
    if catalog.is_empty() {
        println!("peer shares no files");
        return;
    }
    for meta in catalog {
        println!("{}", catalog_line(meta));
    }
}

/// One `ls` row. The hash is whatever the peer sent, so it is cut by
/// characters, not bytes.
fn catalog_line(meta: &FileMeta) -> String {
    let short: String = meta.hash.chars().take(12).collect();
    format!("{:>12}  {short}  {}", meta.size, meta.filename)
}
