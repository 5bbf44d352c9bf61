use clap::{Parser, Subcommand};
use roomcall::config::CallConfig;
use roomcall::logger::init_logging;
use roomcall::peer::WebRtcTransportFactory;
use roomcall::signaling::{Relay, WebSocketConnector};
use roomcall::{CallController, CallEvent, Result, UserCommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Two-party calls over a room relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a room and chat with whoever else joins it
    Call {
        /// Room to join; asked on stdin when omitted
        #[arg(short, long)]
        room: Option<String>,

        #[arg(long, env = "ROOMCALL_SIGNALING_URL")]
        signaling_url: Option<String>,

        /// JSON config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Run the room relay
    Relay {
        #[arg(short, long, env = "ROOMCALL_LISTEN", default_value = "127.0.0.1:8080")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Relay { listen } => run_relay(&listen).await,
        Command::Call {
            room,
            signaling_url,
            config,
        } => run_call(room, signaling_url, config).await,
    }
}

async fn run_relay(listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    tokio::select! {
        result = Relay::new().serve(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Relay stopped");
            Ok(())
        }
    }
}

async fn run_call(
    room: Option<String>,
    signaling_url: Option<String>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => CallConfig::load(&path)?,
        None => CallConfig::default(),
    };
    if let Some(url) = signaling_url {
        config.signaling_url = url;
    }
    config.validate()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let room = match room {
        Some(room) => Some(room),
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(b"Room name: ").await?;
            stdout.flush().await?;
            lines.next_line().await?
        }
    };

    let connector = Arc::new(WebSocketConnector::new(config.signaling_url.clone()));
    let mut controller = CallController::new(
        config,
        connector,
        Arc::new(WebRtcTransportFactory),
        move || room.clone(),
    );

    let mut events = controller.subscribe_events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                CallEvent::Transcript(line) => println!("{}", line),
                CallEvent::Error(e) => error!("{}", e),
                CallEvent::RoomNotice(notice) => warn!("{}", notice),
                other => info!("{:?}", other),
            }
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(UserCommand::Call);

    let signal_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_tx.send(UserCommand::Shutdown);
        }
    });

    tokio::spawn(async move {
        loop {
            let command = match lines.next_line().await {
                Ok(Some(line)) => match line.trim() {
                    "" => continue,
                    "/call" => UserCommand::Call,
                    "/hangup" => UserCommand::HangUp,
                    "/quit" => UserCommand::Shutdown,
                    text => UserCommand::Send(text.to_string()),
                },
                Ok(None) => UserCommand::Shutdown,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    UserCommand::Shutdown
                }
            };
            let done = command == UserCommand::Shutdown;
            if tx.send(command).is_err() || done {
                break;
            }
        }
    });

    controller.run(rx).await;
    Ok(())
}
