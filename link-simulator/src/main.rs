mod logger;
mod simulated;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use futures::StreamExt;
use link::auth::{SharedAccessKeyProvider, TokenRenewer};
use link::condition::ErrorCondition;
use link::config::LinkConfig;
use link::model::ReceivedMessage;
use link::retry::RetryPolicy;
use link::transport::{AmqpConnection, LinkIdentity};
use link::{LinkError, ReactorDispatcher, ReactorReceiver, ReceiveLinkHandler};
use simulated::{PeerOptions, SimulatedConnection, SimulatedLink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

const SIMULATED_HOST: &str = "simulated-ns.servicebus.windows.net";
const SIMULATED_CONNECTION_STRING: &str = "Endpoint=sb://simulated-ns.servicebus.windows.net/;SharedAccessKeyName=simulator;SharedAccessKey=c2ltdWxhdG9yLWtleQ==";

#[derive(Parser, Debug)]
#[command(
    name = "link-simulator",
    about = "Drive a receive link against an in-memory peer"
)]
struct Args {
    /// Messages the peer has available
    #[arg(long, default_value_t = 100)]
    messages: u32,

    /// Initial credits (defaults to `prefetch` from the configuration)
    #[arg(long)]
    prefetch: Option<u32>,

    /// Credits granted each time remote credit runs out
    #[arg(long, default_value_t = 10)]
    refill: u32,

    /// Peer never answers the local close
    #[arg(long)]
    no_close_ack: bool,

    /// Peer closes the link with this condition half way through
    #[arg(long, value_name = "CONDITION")]
    fail_with: Option<String>,

    /// Signal a connection shutdown after this many messages
    #[arg(long, value_name = "N")]
    shutdown_after: Option<u32>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Debug)]
struct ReceiveStats {
    received: u32,
    first_sequence_number: Option<i64>,
    last_sequence_number: Option<i64>,
    start_time: chrono::DateTime<Utc>,
}

impl ReceiveStats {
    fn new() -> Self {
        Self {
            received: 0,
            first_sequence_number: None,
            last_sequence_number: None,
            start_time: Utc::now(),
        }
    }

    fn record(&mut self, message: &ReceivedMessage) {
        self.received += 1;
        if self.first_sequence_number.is_none() {
            self.first_sequence_number = message.sequence_number;
        }
        self.last_sequence_number = message.sequence_number;
    }

    fn display(&self, remote_credit: u32, flowed: u32) {
        let elapsed = Utc::now().signed_duration_since(self.start_time);
        let elapsed_secs = elapsed.num_milliseconds() as f64 / 1000.0;
        let rate = if elapsed_secs > 0.0 {
            self.received as f64 / elapsed_secs
        } else {
            0.0
        };

        println!("Receive statistics ({elapsed_secs:.2}s)");
        println!("   Received: {} messages ({rate:.1}/s)", self.received);
        println!(
            "   Sequence numbers: {:?}..={:?}",
            self.first_sequence_number, self.last_sequence_number
        );
        println!("   Credits granted: {flowed}, remaining remote credit: {remote_credit}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = LinkConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    logger::setup_logger(&config.logging)?;

    let connection = SimulatedConnection::new("simulated-connection", SIMULATED_HOST);
    let identity = LinkIdentity::generate(connection.id(), connection.host(), "orders");
    let handler = Arc::new(ReceiveLinkHandler::new(identity.clone()));
    let transport_link = Arc::new(SimulatedLink::new(&identity.link_name));
    let dispatcher = Arc::new(ReactorDispatcher::new(config.dispatcher_queue_capacity));

    let provider = SharedAccessKeyProvider::from_connection_string(SIMULATED_CONNECTION_STRING)?;
    let audience = provider.properties().audience(&identity.entity_path);
    let renewer = Arc::new(TokenRenewer::new(
        Arc::new(provider),
        audience,
        config.token.clone(),
        RetryPolicy::new(config.retry.clone()),
    ));

    let receiver = ReactorReceiver::new(
        &connection,
        transport_link.clone(),
        handler.clone(),
        renewer.authorization_results(),
        dispatcher.clone(),
        config.receiver_options(),
    );
    renewer.clone().start();

    let refill = args.refill;
    receiver.set_empty_credit_listener(move || refill);

    let fail_with = args
        .fail_with
        .as_deref()
        .map(|symbol| ErrorCondition::new(symbol, Some("injected by simulator".to_string())));
    let peer = simulated::spawn_peer(
        transport_link.clone(),
        handler.clone(),
        PeerOptions {
            messages: args.messages,
            acknowledge_close: !args.no_close_ack,
            fail_with,
            fail_after: args.messages / 2,
        },
    );

    println!("Receiving from {identity}");
    receiver
        .add_credits(args.prefetch.unwrap_or(config.prefetch))
        .await
        .context("Failed to grant initial credits")?;

    let mut stats = ReceiveStats::new();
    let mut failure: Option<LinkError> = None;
    let mut last_message = None;
    let mut messages = receiver.receive();

    while stats.received < args.messages {
        match messages.next().await {
            Some(Ok(message)) => {
                stats.record(&message);
                if args.shutdown_after == Some(stats.received) {
                    connection.shutdown("Shutdown requested by simulator");
                }
                last_message = Some(message);
            }
            Some(Err(e)) => {
                failure = Some(e);
                break;
            }
            None => {
                println!("Message stream completed");
                break;
            }
        }
    }
    drop(messages);

    stats.display(receiver.credits(), transport_link.flowed());
    if let Some(message) = &last_message {
        println!("   Last message: {}", serde_json::to_string(message)?);
    }

    if let Some(error) = failure {
        let retry_delay = RetryPolicy::new(config.retry.clone())
            .calculate_retry_delay(error.is_transient(), 0);
        println!("Link failed: {error}");
        println!("   Condition: {:?}", error.condition());
        match retry_delay {
            Some(delay) => println!("   Transient, would re-create the link after {delay:?}"),
            None => println!("   Not retriable"),
        }
    }

    let close_started = Instant::now();
    receiver.close_async().await;
    println!(
        "Link closed in {:?} (disposed: {})",
        close_started.elapsed(),
        receiver.is_disposed()
    );

    renewer.shutdown();
    dispatcher.shutdown();
    let sent = peer.await.unwrap_or(0);
    log::info!("Peer sent {sent} messages");

    Ok(())
}
