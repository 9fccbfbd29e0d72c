//! CLI for sondestream
//!
//! Subcommands:
//! - `stream`: print every payload from the feed until Ctrl-C or until
//!   reconnecting gives up
//! - `relay`: serve the feed to WebSocket clients

use std::process::ExitCode;

use clap::Parser;
use sondestream::config::{Settings, load_config};
use sondestream::relay::{RelayContext, start_relay_server};
use sondestream::stream::topics::strip_prefix;
use sondestream::utils::logging;
use sondestream::{Message, StreamManager};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "sondestream", version)]
enum Command {
    /// Print received payloads to stdout
    Stream {
        /// Topic filter under the prefix; repeat for several (default: everything)
        #[arg(long = "topic", short = 't')]
        topics: Vec<String>,
        /// Topic prefix (default from configuration, normally `sondes`)
        #[arg(long)]
        prefix: Option<String>,
        /// Decode payloads as JSON and print them compacted
        #[arg(long)]
        json: bool,
        /// Prefix each line with the topic it arrived on
        #[arg(long)]
        show_topic: bool,
    },
    /// Start the WebSocket relay
    Relay {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Request path clients connect to
        #[arg(long)]
        path: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // a missing .env is fine
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log_level);

    let outcome = match cmd {
        Command::Stream {
            topics,
            prefix,
            json,
            show_topic,
        } => run_stream(settings, topics, prefix, json, show_topic).await,
        Command::Relay { host, port, path } => run_relay(settings, host, port, path).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("sondestream failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_stream(
    settings: Settings,
    topics: Vec<String>,
    prefix: Option<String>,
    json: bool,
    show_topic: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = settings
        .stream_options()
        .with_on_connect(|client_id| info!(%client_id, "connected to SondeHub"))
        .with_on_disconnect(|reason| warn!(%reason, "lost SondeHub connection"));
    if !topics.is_empty() {
        options = options.with_topics(topics);
    }
    if let Some(prefix) = prefix {
        options = options.with_prefix(prefix);
    }
    if json {
        options = options.with_as_json(true);
    }

    let print_prefix = options.prefix.clone();
    let manager = StreamManager::start(options, move |message: Message| {
        let body = match &message.json {
            Some(value) => value.to_string(),
            None => String::from_utf8_lossy(&message.payload).into_owned(),
        };
        if show_topic {
            println!("{} {}", strip_prefix(&print_prefix, &message.topic), body);
        } else {
            println!("{body}");
        }
    })
    .await?;

    let closed = tokio::select! {
        result = manager.closed() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    };

    manager.stop().await?;
    closed?;
    Ok(())
}

async fn run_relay(
    mut settings: Settings,
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(host) = host {
        settings.relay.host = host;
    }
    if let Some(port) = port {
        settings.relay.port = port;
    }
    if let Some(path) = path {
        settings.relay.path = path;
    }

    let addr = settings.relay_addr();
    let ctx = RelayContext::new(settings.stream_options())?;

    let served = tokio::select! {
        result = start_relay_server(&addr, &settings.relay.path, ctx.clone()) => result,
        failure = ctx.failure() => Err(failure),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    };

    ctx.shutdown().await?;
    served?;
    Ok(())
}
