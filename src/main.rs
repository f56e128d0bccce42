//! CLI for Peril
//!
//! Subcommands:
//! - `server`: broadcast pause/resume and collect game logs
//! - `client`: join as a player and follow the pause state

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::Parser;
use peril::config::{Settings, load_config};
use peril::handlers::{GameLogWriter, PauseState, handler_logs, handler_pause};
use peril::pubsub::{
    BinaryCodec, QueueBinding, SimpleQueueType, Subscription, SubscriptionHandle, publish_json,
    subscribe_json,
};
use peril::routing::{
    EXCHANGE_PERIL_DIRECT, EXCHANGE_PERIL_TOPIC, GAME_LOG_SLUG, PAUSE_KEY, PlayingState,
    routing_key,
};
use peril::transport::{AmqpChannel, amqp};
use peril::utils::logging;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{error, info, warn};

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// How long a running handler gets to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "peril")]
enum Command {
    /// Run the game server REPL (pause, resume, quit)
    Server,
    /// Join the game as a player
    Client {
        /// Username to play as; prompted for when omitted
        #[arg(long)]
        username: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Could not load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let result = match cmd {
        Command::Server => run_server(&settings).await,
        Command::Client { username } => run_client(&settings, username).await,
    };

    if let Err(e) = result {
        error!("Peril exited with an error: {}", e);
        std::process::exit(1);
    }
}

async fn run_server(settings: &Settings) -> CliResult {
    let conn = amqp::connect(&settings.amqp.url).await?;
    info!("Peril game server connected to RabbitMQ");

    let publish_ch = conn.create_channel().await?;

    let binding = QueueBinding::new(
        EXCHANGE_PERIL_TOPIC,
        GAME_LOG_SLUG,
        &format!("{GAME_LOG_SLUG}.*"),
        SimpleQueueType::Durable,
    );
    let writer = GameLogWriter::new(&settings.server.log_file);
    let logs = Subscription::new(binding, BinaryCodec, handler_logs(writer))
        .with_prefetch(settings.amqp.prefetch_count)
        .start(&conn)
        .await?;
    info!(queue = %logs.queue(), "collecting game logs");

    print_server_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    tokio::select! {
        res = server_repl(&mut lines, &publish_ch) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    stop_subscription(logs).await;
    AmqpChannel::close(&publish_ch).await?;
    conn.close(200, "bye").await?;
    Ok(())
}

/// Stops taking deliveries and gives the handler in flight a bounded time to
/// settle before the connection goes away.
async fn stop_subscription(handle: SubscriptionHandle) {
    let queue = handle.queue().to_string();
    match tokio::time::timeout(SHUTDOWN_GRACE, handle.shutdown()).await {
        Ok(stats) => info!(queue = %queue, ?stats, "subscription stopped"),
        Err(_) => warn!(queue = %queue, "subscription did not stop in time"),
    }
}

async fn server_repl<Ch: AmqpChannel>(
    lines: &mut Lines<BufReader<Stdin>>,
    publish_ch: &Ch,
) -> CliResult {
    while let Some(words) = next_words(lines).await? {
        let Some(command) = words.first() else {
            continue;
        };
        match command.as_str() {
            "pause" => {
                println!("Sending pause message");
                send_playing_state(publish_ch, true).await;
            }
            "resume" => {
                println!("Sending resume message");
                send_playing_state(publish_ch, false).await;
            }
            "help" => print_server_help(),
            "quit" => {
                println!("Exiting");
                break;
            }
            _ => println!("unknown command"),
        }
    }
    Ok(())
}

/// A failed broadcast is reported and the REPL keeps going.
async fn send_playing_state<Ch: AmqpChannel>(publish_ch: &Ch, is_paused: bool) {
    let state = PlayingState { is_paused };
    if let Err(e) = publish_json(publish_ch, EXCHANGE_PERIL_DIRECT, PAUSE_KEY, &state).await {
        error!(error = %e, "could not publish playing state");
    }
}

fn print_server_help() {
    println!("Possible commands:");
    println!("* pause");
    println!("* resume");
    println!("* quit");
    println!("* help");
}

/// Client-side game session: who is playing and whether the game is paused.
#[derive(Debug)]
struct ClientSession {
    username: String,
    paused: bool,
}

impl PauseState for ClientSession {
    fn handle_pause(&mut self, state: PlayingState) {
        self.paused = state.is_paused;
        if state.is_paused {
            println!("==== Pause Detected ====");
        } else {
            println!("==== Resume Detected ====");
        }
    }
}

async fn run_client(settings: &Settings, username: Option<String>) -> CliResult {
    let conn = amqp::connect(&settings.amqp.url).await?;
    info!("Peril game client connected to RabbitMQ");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let username = match username {
        Some(username) => username,
        None => prompt_username(&mut lines).await?,
    };

    let session = Arc::new(Mutex::new(ClientSession {
        username: username.clone(),
        paused: false,
    }));

    let pause = subscribe_json(
        &conn,
        EXCHANGE_PERIL_DIRECT,
        &routing_key(PAUSE_KEY, &username),
        PAUSE_KEY,
        SimpleQueueType::Transient,
        handler_pause(Arc::clone(&session)),
    )
    .await?;
    info!(queue = %pause.queue(), "following pause state");

    print_client_help();

    tokio::select! {
        res = client_repl(&mut lines, &session) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    stop_subscription(pause).await;
    conn.close(200, "bye").await?;
    Ok(())
}

async fn client_repl(
    lines: &mut Lines<BufReader<Stdin>>,
    session: &Mutex<ClientSession>,
) -> CliResult {
    while let Some(words) = next_words(lines).await? {
        let Some(command) = words.first() else {
            continue;
        };
        match command.as_str() {
            "status" => {
                let session = session.lock().unwrap_or_else(PoisonError::into_inner);
                let state = if session.paused { "paused" } else { "running" };
                println!("{}: game is {}", session.username, state);
            }
            "help" => print_client_help(),
            "quit" => {
                println!("Exiting");
                break;
            }
            _ => println!("unknown command"),
        }
    }
    Ok(())
}

fn print_client_help() {
    println!("Possible commands:");
    println!("* status");
    println!("* help");
    println!("* quit");
}

async fn prompt_username(lines: &mut Lines<BufReader<Stdin>>) -> CliResult<String> {
    loop {
        print!("Please enter your username: ");
        tokio::io::stdout().flush().await?;
        let Some(line) = lines.next_line().await? else {
            return Err("no username given".into());
        };
        if let Some(username) = line.split_whitespace().next() {
            return Ok(username.to_string());
        }
    }
}

/// Reads the next input line split into words; `None` on end of input.
async fn next_words(lines: &mut Lines<BufReader<Stdin>>) -> CliResult<Option<Vec<String>>> {
    print!("> ");
    tokio::io::stdout().flush().await?;
    let Some(line) = lines.next_line().await? else {
        return Ok(None);
    };
    Ok(Some(line.split_whitespace().map(str::to_string).collect()))
}
