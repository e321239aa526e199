//! Sample program keeping one shadow property of one thing in sync.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use proven_shadow::codec::Document;
use proven_shadow::correlation::Outcome;
use proven_shadow::topic::TopicRouter;
use proven_shadow::{
    EngineConfig, ShadowClient, ShadowClientConfig, SyncEvent, SyncFailure, UpdateOutcome,
};
use proven_shadow_memory::{MemoryShadowService, MemoryTransport};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Errors surfaced by the sample program.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Only the in-process endpoint can be served by this binary.
    #[error("unsupported endpoint `{0}`; only `memory` is available")]
    UnsupportedEndpoint(String),

    /// The simulated service failed to start.
    #[error(transparent)]
    Service(#[from] proven_shadow_memory::service::Error),

    /// Shadow client error
    #[error(transparent)]
    Shadow(#[from] proven_shadow::Error),

    /// Reading operator input failed.
    #[error("stdin error: {0}")]
    Stdin(#[from] std::io::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Endpoint of the pub/sub broker, not including a port
    #[arg(long, default_value = "memory", env = "SHADOW_SYNC_ENDPOINT")]
    endpoint: String,

    /// Client certificate in PEM format
    #[arg(long, env = "SHADOW_SYNC_CERT")]
    cert: Option<PathBuf>,

    /// Private key in PEM format
    #[arg(long, env = "SHADOW_SYNC_KEY")]
    key: Option<PathBuf>,

    /// Custom CA file in PEM format, if the broker's certificate is not in the trust store
    #[arg(long = "ca_file", env = "SHADOW_SYNC_CA_FILE")]
    ca_file: Option<PathBuf>,

    /// Name of the thing whose shadow is synced
    #[arg(long = "thing_name", env = "SHADOW_SYNC_THING_NAME")]
    thing_name: String,

    /// Shadow property to keep in sync
    #[arg(long = "shadow_property", env = "SHADOW_SYNC_SHADOW_PROPERTY")]
    shadow_property: String,

    /// Topic namespace
    #[arg(long, default_value = "$aws/things", env = "SHADOW_SYNC_NAMESPACE")]
    namespace: String,

    /// Seconds to wait for a response before an update times out
    #[arg(
        long = "request_timeout",
        default_value_t = 10,
        env = "SHADOW_SYNC_REQUEST_TIMEOUT"
    )]
    request_timeout: u64,

    /// Value reported when the property is deleted from the desired state
    #[arg(long = "default_value", default_value = "off", env = "SHADOW_SYNC_DEFAULT_VALUE")]
    default_value: String,
}

/// How to reach the broker.
#[derive(Clone, Debug)]
struct ConnectionConfig {
    endpoint: String,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    ca_file: Option<PathBuf>,
}

impl ConnectionConfig {
    async fn connect(&self, router: TopicRouter) -> Result<(MemoryTransport, MemoryShadowService), Error> {
        if self.endpoint != "memory" {
            return Err(Error::UnsupportedEndpoint(self.endpoint.clone()));
        }

        debug!(
            cert = ?self.cert,
            key = ?self.key,
            ca_file = ?self.ca_file,
            "credentials are not used by the in-process endpoint"
        );

        let transport = MemoryTransport::new();
        let service = MemoryShadowService::start(transport.clone(), router).await?;

        Ok((transport, service))
    }
}

fn describe(thing_name: &str, property: &str, event: &SyncEvent) {
    match event {
        SyncEvent::Ready => {
            println!("Subscribed to shadow updates for {thing_name}.");
            println!("Enter desired value:");
        }
        SyncEvent::Converged { value, version } => {
            println!("Finished updating reported shadow value to {value} (version {version}).");
            println!("Enter desired value:");
        }
        SyncEvent::Failed {
            desired,
            failure: SyncFailure::Rejected(error),
        } => {
            eprintln!(
                "Failed to report \"{property}\" as {desired}: error {} {}",
                error.code,
                error.message.as_deref().unwrap_or_default()
            );
        }
        SyncEvent::Failed {
            desired,
            failure: SyncFailure::Timeout,
        } => {
            eprintln!("Timed out reporting \"{property}\" as {desired}.");
        }
        SyncEvent::Faulted { reason } => {
            eprintln!("Shadow sync for {thing_name} stopped: {reason}");
        }
    }
}

async fn change_desired(
    client: &ShadowClient<MemoryTransport>,
    thing_name: &str,
    property: &str,
    value: &str,
) -> Result<(), Error> {
    println!("Changing desired shadow value to {value}.");

    let mut desired = Document::new();
    desired.insert(property.to_string(), Value::String(value.to_string()));

    let thing = thing_name.to_string();
    client
        .request_update(thing_name, desired, None, move |outcome: UpdateOutcome| match outcome {
            Outcome::Accepted(response) => {
                info!(thing = %thing, version = response.version, "desired state updated");
            }
            Outcome::Rejected(error) => {
                eprintln!("Failed to update {thing} shadow state: error {}", error.code);
            }
            Outcome::Timeout => eprintln!("Timed out updating {thing} shadow state."),
        })
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let client_config = ShadowClientConfig {
        namespace: args.namespace.clone(),
        request_timeout: Duration::from_secs(args.request_timeout),
        ..ShadowClientConfig::default()
    };
    let engine_config = EngineConfig::default().with_default_value(args.default_value.clone());
    let connection = ConnectionConfig {
        endpoint: args.endpoint,
        cert: args.cert,
        key: args.key,
        ca_file: args.ca_file,
    };

    let (transport, _service) = connection
        .connect(TopicRouter::new(client_config.namespace.clone()))
        .await?;
    let client = ShadowClient::new(transport, client_config);

    let property = args.shadow_property.clone();
    let sync = client.watch(
        &args.thing_name,
        &args.shadow_property,
        engine_config,
        move |thing_name: &str, event: &SyncEvent| describe(thing_name, &property, event),
    )?;

    let shutdown_token = CancellationToken::new();

    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt signal");
        }
        signal_shutdown_token.cancel();
    });

    let sweeper_client = client.clone();
    let sweeper_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                () = sweeper_shutdown_token.cancelled() => break,
                _ = interval.tick() => {
                    let expired = sweeper_client.expire(Instant::now());
                    if expired > 0 {
                        warn!(expired, "requests timed out");
                    }
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = shutdown_token.cancelled() => break,
            line = lines.next_line() => line?,
        };

        let Some(line) = line else {
            break;
        };

        let value = line.trim();
        match value {
            "" => {}
            "exit" | "quit" => break,
            value => change_desired(&client, &args.thing_name, &args.shadow_property, value).await?,
        }
    }

    info!("Shutting down");
    shutdown_token.cancel();
    sync.shutdown().await;

    Ok(())
}
