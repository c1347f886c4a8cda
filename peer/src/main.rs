use clap::Parser;
use log::{error, info, warn};
use peer::input::{parse_command, Command, HELP};
use peer::network::PeerClient;
use peer::session::SessionContext;
use peer::signals::Signal;
use rand::Rng;
use shared::{RequiredSecured, SessionConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay address to connect to
    #[arg(short = 'r', long, default_value = "127.0.0.1:7777")]
    relay: String,

    /// Name shown to the other peers
    #[arg(short = 'n', long, default_value = "player")]
    name: String,

    /// Session to create or join. A random Room#### is created when omitted.
    #[arg(short = 's', long)]
    session: Option<String>,

    /// Maximum peers when this peer creates the session
    #[arg(short = 'c', long, default_value = "3")]
    capacity: usize,

    /// Exact number of rescue targets to secure
    #[arg(long)]
    required: Option<u32>,

    /// Lower bound of the random required count
    #[arg(long, default_value = "2")]
    min_required: u32,

    /// Upper bound of the random required count
    #[arg(long, default_value = "4")]
    max_required: u32,

    /// Match length in seconds
    #[arg(short = 'd', long, default_value = "300")]
    match_duration: f32,

    /// Skip the ready-check and never time out
    #[arg(short = 't', long)]
    testing: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let required_secured = match self.required {
            Some(n) => RequiredSecured::Fixed(n),
            None => RequiredSecured::Range {
                min: self.min_required,
                max: self.max_required,
            },
        };

        SessionConfig {
            max_peers: self.capacity,
            required_secured,
            match_duration_secs: self.match_duration,
            testing_mode: self.testing,
            ..SessionConfig::default()
        }
    }

    fn session_name(&self) -> String {
        match &self.session {
            Some(name) => name.clone(),
            None => format!("Room{}", rand::thread_rng().gen_range(1000..=9999)),
        }
    }
}

fn log_signal(signal: &Signal) {
    match signal {
        Signal::Outcome { text, .. } => info!("*** {} ***", text),
        Signal::Disconnected { reason } => warn!("Disconnected: {}", reason),
        Signal::MatchClock(secs) if secs % 30 != 0 => {}
        other => info!("{:?}", other),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let session_name = args.session_name();

    info!("Joining session {} on {} as {}", session_name, args.relay, args.name);
    info!("Type 'help' for commands");

    let session = SessionContext::new(args.session_config(), &args.name, &session_name);
    let mut client = PeerClient::connect(&args.relay, session).await?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim() == "help" => println!("{}", HELP),
                Ok(Some(line)) => match parse_command(&line) {
                    Ok(command) => {
                        let quit = command == Command::Quit;
                        if command_tx.send(command).is_err() || quit {
                            break;
                        }
                    }
                    Err(e) => eprintln!("{}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(signal) = signal_rx.recv().await {
            log_signal(&signal);
        }
    });

    client.run(command_rx, signal_tx).await?;

    Ok(())
}
