use anyhow::{Context, Result};
use clap::Parser;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
};
use tracing::warn;

use unique_ip_chat::{
    Client, ClientEvent, Server, ServerEvent,
    cli::{Cli, ClientArgs, Command, ServerArgs},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    // Logs go to stderr; stdout carries only the chat transcript.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => run_client(args).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let (server, mut events) = Server::new(args.config());
    server
        .start(&args.bind, args.port)
        .await
        .with_context(|| format!("failed to start server on {}:{}", args.bind, args.port))?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    // A closed stdin leaves the server running until /quit or Ctrl-C.
    let mut stdin_open = true;

    loop {
        select! {
            Some(event) = events.recv() => render_server_event(&event).await?,
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) if is_quit(&line) => break,
                Some(line) => server.send_message(line.trim_end()).await,
                None => stdin_open = false,
            },
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    server.stop().await;
    while let Ok(event) = events.try_recv() {
        render_server_event(&event).await?;
    }
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let (client, mut events) = Client::new(&args.local, args.config())?;
    client
        .connect(&args.server, args.port)
        .await
        .with_context(|| {
            format!(
                "failed to connect to {}:{} from {}",
                args.server, args.port, args.local
            )
        })?;
    write_stdout(&format!("*** connected from {}", client.local_address())).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        select! {
            Some(event) = events.recv() => {
                render_client_event(&event).await?;
                if event == ClientEvent::Disconnected {
                    return Ok(());
                }
            }
            line = stdin.next_line() => match line? {
                Some(line) if is_quit(&line) => {
                    write_stdout("*** leaving chat").await?;
                    break;
                }
                Some(line) => client.send_message(line.trim_end()).await,
                None => break,
            },
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

fn is_quit(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("/quit")
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render_server_event(event: &ServerEvent) -> io::Result<()> {
    match event {
        ServerEvent::ConnectionError { .. } | ServerEvent::AcceptFailed { .. } => {
            write_stderr(&event.to_string()).await
        }
        _ => write_stdout(&event.to_string()).await,
    }
}

async fn render_client_event(event: &ClientEvent) -> io::Result<()> {
    match event {
        ClientEvent::Error(_) => write_stderr(&event.to_string()).await,
        _ => write_stdout(&event.to_string()).await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
