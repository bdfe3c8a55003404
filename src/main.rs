use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;

use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};

use ws_engine::{ClientHandshake, Config, Error, Message, Server, ServerHandshake, WebSocket};

const USAGE: &str = "usage: ws_engine serve <addr> | ws_engine connect <host> <port> [path]";

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let args: Vec<String> = env::args().skip(1).collect();
    let result = match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["serve", addr] => serve(addr, config).await,
        ["connect", host, port] => connect(host, port, "/", config).await,
        ["connect", host, port, path] => connect(host, port, path, config).await,
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Echo server until Ctrl-C, then a graceful shutdown.
async fn serve(addr: &str, config: Config) -> ws_engine::Result<()> {
    let addr: SocketAddr = addr.parse().map_err(|e| Error::Config(format!("{addr}: {e}")))?;
    let server = Server::bind(addr, ServerHandshake::new().config(config), echo).await?;
    println!("echo server listening on ws://{}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, {} live connections", server.live_connections().len());
    server.shutdown().await;
    Ok(())
}

async fn echo(ws: WebSocket) {
    while let Ok(message) = ws.receive().await {
        if ws.send(message).await.is_err() {
            break;
        }
    }
}

/// Sends each stdin line and prints the reply. Closes with 1000 at EOF.
async fn connect(host: &str, port: &str, path: &str, config: Config) -> ws_engine::Result<()> {
    let port: u16 = port.parse().map_err(|e| Error::Config(format!("port {port}: {e}")))?;
    let ws = ClientHandshake::new(host, port).path(path).config(config).connect().await?;
    info!("connected to {host}:{port}{path}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        ws.send(line).await?;
        match ws.receive().await? {
            Message::Text(text) => println!("{text}"),
            Message::Binary(data) => println!("<{} bytes>", data.len()),
        }
    }
    ws.close(1000, "").await
}
