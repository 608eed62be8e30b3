use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use udpmeter::config::{parse_duration, LoggingConfig, MeterConfig};

#[derive(Parser)]
#[command(
    name = "udpmeter",
    about = "UDP throughput and packet-rate meter",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print the final report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept flows from any number of clients on one socket
    Server {
        /// Listen address; the default port is added if missing
        #[arg(long, env = "UDPMETER_LISTEN")]
        listen: Option<String>,

        /// How often expired flows are swept out
        #[arg(long)]
        sweep_interval: Option<String>,

        #[command(flatten)]
        flow: FlowArgs,
    },

    /// Send flows to a server
    Client {
        /// Server address; the default port is added if missing
        #[arg(env = "UDPMETER_HOST")]
        host: String,

        /// Local address to bind each connection to
        #[arg(long, env = "UDPMETER_LOCAL")]
        local: Option<String>,

        /// Number of parallel connections
        #[arg(short = 'P', long, env = "UDPMETER_CONNECTIONS")]
        connections: Option<usize>,

        /// Time between interval reports (bare number = seconds)
        #[arg(long, env = "UDPMETER_REPORT_INTERVAL")]
        interval: Option<String>,

        /// Total duration of each flow (bare number = seconds)
        #[arg(long, env = "UDPMETER_TOTAL_DURATION")]
        duration: Option<String>,

        /// Send rate cap per connection in Mbps, 0 for unlimited
        #[arg(long, env = "UDPMETER_MAX_SPEED")]
        max_speed: Option<f64>,

        #[command(flatten)]
        flow: FlowArgs,
    },
}

/// Flags shared by both modes.
#[derive(Args)]
struct FlowArgs {
    /// Run both directions
    #[arg(long)]
    duplex: bool,

    /// Receive buffer size in bytes
    #[arg(long, env = "UDPMETER_READ_SIZE")]
    read_size: Option<usize>,

    /// Send buffer size in bytes
    #[arg(long, env = "UDPMETER_WRITE_SIZE")]
    write_size: Option<usize>,
}

impl FlowArgs {
    fn apply(self, config: &mut MeterConfig) {
        if self.duplex {
            config.flow.duplex = true;
        }
        if let Some(n) = self.read_size {
            config.flow.read_size = n;
        }
        if let Some(n) = self.write_size {
            config.flow.write_size = n;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = MeterConfig::locate(cli.config.as_deref());
    let mut config = match &path {
        Some(p) => MeterConfig::load(p)?,
        None => MeterConfig::default(),
    };

    init_tracing(&config.logging);
    if let Some(p) = &path {
        tracing::info!(path = %p.display(), "loaded configuration");
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = config.runtime.worker_threads {
        builder.worker_threads(threads.max(1));
    }
    let runtime = builder
        .enable_all()
        .build()
        .context("failed to build async runtime")?;

    match cli.command {
        Commands::Server {
            listen,
            sweep_interval,
            flow,
        } => {
            if let Some(listen) = listen {
                config.network.listen_address = listen;
            }
            if let Some(sweep) = sweep_interval {
                parse_duration(&sweep).context("invalid --sweep-interval")?;
                config.network.sweep_interval = sweep;
            }
            flow.apply(&mut config);
            let settings = config.server_settings()?;

            let report = runtime.block_on(async {
                let server = udpmeter::server::Server::bind(settings).await?;
                let shutdown = CancellationToken::new();
                tokio::spawn(udpmeter::server::cancel_on(
                    tokio::signal::ctrl_c(),
                    shutdown.clone(),
                ));
                server.run(shutdown).await
            })?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nudpmeter server summary");
                println!("  flows opened : {}", report.flows_opened);
                println!("  flows expired: {}", report.flows_expired);
                println!(
                    "  received     : {} Mbps {} recv/s",
                    report.received.mbps, report.received.cps
                );
                if config.flow.duplex {
                    println!(
                        "  sent         : {} Mbps {} send/s",
                        report.sent.mbps, report.sent.cps
                    );
                }
            }
        }
        Commands::Client {
            host,
            local,
            connections,
            interval,
            duration,
            max_speed,
            flow,
        } => {
            if local.is_some() {
                config.network.local_address = local;
            }
            if let Some(n) = connections {
                config.flow.connections = n;
            }
            if let Some(interval) = interval {
                config.flow.report_interval = interval;
            }
            if let Some(duration) = duration {
                config.flow.total_duration = duration;
            }
            if let Some(mbps) = max_speed {
                config.flow.max_speed_mbps = mbps;
            }
            flow.apply(&mut config);
            let settings = config.client_settings(&host)?;

            let report = runtime.block_on(udpmeter::client::run(&settings))?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nudpmeter client summary");
                println!(
                    "  connections  : {}/{}",
                    report.connections, settings.connections
                );
                println!(
                    "  sent         : {} Mbps {} send/s",
                    report.sent.mbps, report.sent.cps
                );
                if let Some(received) = report.received {
                    println!(
                        "  received     : {} Mbps {} recv/s",
                        received.mbps, received.cps
                    );
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
