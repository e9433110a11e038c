//! Mock VLC telnet interface
//!
//! Speaks the password handshake and the `> ` prompt framing, recording every
//! command line it receives.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct MockVlcState {
    pub password: Option<String>,
    pub playing: bool,
    pub paused: bool,
    pub playlist: Vec<String>,
    /// Command lines in arrival order, across connections
    pub commands: Vec<String>,
    pub connections: usize,
}

pub struct MockVlcServer {
    addr: SocketAddr,
    state: Arc<RwLock<MockVlcState>>,
    handle: JoinHandle<()>,
    sessions: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl MockVlcServer {
    pub async fn start(password: Option<&str>) -> Self {
        let state = Arc::new(RwLock::new(MockVlcState {
            password: password.map(str::to_string),
            ..MockVlcState::default()
        }));
        let sessions = Arc::new(RwLock::new(Vec::new()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = {
            let state = state.clone();
            let sessions = sessions.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    state.write().await.connections += 1;
                    let session = tokio::spawn(serve_connection(stream, state.clone()));
                    sessions.write().await.push(session);
                }
            })
        };

        Self {
            addr,
            state,
            handle,
            sessions,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<String> {
        self.state.read().await.commands.clone()
    }

    pub async fn connections(&self) -> usize {
        self.state.read().await.connections
    }

    pub async fn is_playing(&self) -> bool {
        self.state.read().await.playing
    }

    /// Drop every open telnet connection, as VLC does when restarted
    pub async fn drop_connections(&self) {
        for session in self.sessions.write().await.drain(..) {
            session.abort();
        }
    }

    pub async fn stop(self) {
        self.drop_connections().await;
        self.handle.abort();
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<RwLock<MockVlcState>>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let password = state.read().await.password.clone();
    match password {
        Some(expected) => loop {
            if writer
                .write_all(b"VLC media player 3.0.20 Vetinari\r\nPassword: \xff\xfb\x01")
                .await
                .is_err()
            {
                return;
            }
            let Ok(Some(given)) = lines.next_line().await else {
                return;
            };
            if given.trim() == expected {
                let _ = writer.write_all(b"\xff\xfc\x01\r\nWelcome, Master\r\n> ").await;
                break;
            }
            let _ = writer.write_all(b"\xff\xfc\x01\r\nWrong password\r\n").await;
        },
        None => {
            let _ = writer.write_all(b"Welcome, Master\r\n> ").await;
        }
    }

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        let output = {
            let mut s = state.write().await;
            s.commands.push(line.clone());
            respond(&mut s, &line)
        };

        let reply = if output.is_empty() {
            "> ".to_string()
        } else {
            format!("{}\r\n> ", output)
        };
        if writer.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn respond(state: &mut MockVlcState, line: &str) -> String {
    let (command, argument) = match line.split_once(' ') {
        Some((c, a)) => (c, a),
        None => (line, ""),
    };

    match command {
        "add" => {
            state.playlist.push(argument.to_string());
            state.playing = false;
            String::new()
        }
        "play" => {
            state.playing = !state.playlist.is_empty();
            state.paused = false;
            String::new()
        }
        "pause" => {
            state.paused = !state.paused;
            String::new()
        }
        "stop" => {
            state.playing = false;
            state.paused = false;
            String::new()
        }
        "seek" => String::new(),
        "is_playing" => if state.playing { "1" } else { "0" }.to_string(),
        "status" => {
            let phase = match (state.playing, state.paused) {
                (true, true) => "paused",
                (true, false) => "playing",
                _ => "stopped",
            };
            match state.playlist.last() {
                Some(input) => format!(
                    "( new input: {} )\r\n( audio volume: 256 )\r\n( state {} )",
                    input, phase
                ),
                None => format!("( audio volume: 256 )\r\n( state {} )", phase),
            }
        }
        "get_time" => if state.playing { "42" } else { "" }.to_string(),
        "get_length" => if state.playing { "600" } else { "" }.to_string(),
        other => format!("Unknown command `{}'. Type `help' for help.", other),
    }
}
