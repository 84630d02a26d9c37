use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pvars::{
    ClientBuilder, ServerBuilder, ServerPV,
    client::MonitorEvent,
    pvdata::{PvStructure, Structure, Value},
};

/// pvars - talk to, or serve, PV Access process variables
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// More logging; repeat for more
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Operation timeout, in seconds
    #[arg(short = 'w', long, default_value = "5", global = true)]
    timeout: f32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read the current value of PVs
    Get {
        names: Vec<String>,
        /// Field request, e.g. "field(value,alarm)"
        #[arg(short, long, default_value = "")]
        request: String,
    },
    /// Write one field of a PV
    Put {
        name: String,
        value: String,
        /// Field to write
        #[arg(short, long, default_value = "value")]
        field: String,
    },
    /// Show the type of a PV
    Info { name: String },
    /// Print updates to PVs until interrupted
    Monitor {
        names: Vec<String>,
        #[arg(short, long, default_value = "")]
        request: String,
        /// Updates the server may send before we acknowledge
        #[arg(short, long)]
        pipeline: Option<u32>,
    },
    /// List the servers that answer
    List,
    /// Serve a counter and a writable value, for testing
    Serve {
        /// Prefix for the served PV names
        #[arg(long, default_value = "pvars:")]
        prefix: String,
        /// Seconds between counter updates
        #[arg(long, default_value = "1")]
        period: f32,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);
    if let Err(e) = run(args).await {
        error!("{e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = Duration::from_secs_f32(args.timeout.max(0.1));
    let client = || ClientBuilder::new().timeout(timeout).start();
    match args.command {
        Command::Get { names, request } => {
            let client = client().await?;
            for name in names {
                let value = client.read(&name, &request).await?;
                println!("{name} {value}");
            }
        }
        Command::Put { name, value, field } => {
            let client = client().await?;
            client.write(&name, &field, Value::String(value)).await?;
            let value = client.read(&name, "").await?;
            println!("{name} {value}");
        }
        Command::Info { name } => {
            let client = client().await?;
            let desc = client.channel(&name).info("").await?;
            println!("{name}\n{desc}");
        }
        Command::Monitor {
            names,
            request,
            pipeline,
        } => {
            let client = client().await?;
            let mut tasks = Vec::new();
            for name in names {
                let mut subscription = client.subscribe(&name, &request, pipeline).await?;
                tasks.push(tokio::spawn(async move {
                    while let Some(event) = subscription.recv().await {
                        match event {
                            MonitorEvent::Update(update) => {
                                let overrun = if update.has_overrun() { " (overrun)" } else { "" };
                                println!("{name} {}{overrun}", update.value);
                            }
                            MonitorEvent::Disconnected => println!("{name} <disconnected>"),
                            MonitorEvent::Error(e) => println!("{name} <error: {e}>"),
                            MonitorEvent::Finished => break,
                        }
                    }
                }));
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => (),
                _ = futures_all(tasks) => (),
            }
        }
        Command::List => {
            let client = client().await?;
            for server in client.list(timeout).await? {
                let addresses: Vec<String> =
                    server.addresses.iter().map(|a| a.to_string()).collect();
                println!("{} {}", server.guid, addresses.join(" "));
            }
        }
        Command::Serve { prefix, period } => {
            serve(&prefix, Duration::from_secs_f32(period.max(0.01))).await?;
        }
    }
    Ok(())
}

async fn futures_all(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}

async fn serve(prefix: &str, period: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let server = ServerBuilder::new().start().await?;
    let counter = server.create_pv(
        &format!("{prefix}counter"),
        PvStructure::from_value(Structure::new().with("value", 0i64))?,
    )?;
    server.create_pv_with_writer(
        &format!("{prefix}value"),
        PvStructure::from_value(Structure::new().with("value", 0.0f64).with("tag", ""))?,
        |pv: &ServerPV, changed: &[String], written: &PvStructure| {
            info!("Client wrote {changed:?} of {}", pv.name());
            pv.update(written.value().clone()).map_err(|e| e.to_string())
        },
    )?;
    server.create_rpc_pv(&format!("{prefix}sum"), |request: PvStructure| {
        let total: f64 = request
            .value()
            .fields()
            .iter()
            .filter_map(|(_, v)| v.as_f64())
            .sum();
        PvStructure::from_value(Structure::new().with("value", total)).map_err(|e| e.to_string())
    })?;
    info!("Serving on TCP port {}", server.connection_port());

    let mut count = 0i64;
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {
                count += 1;
                counter.update(Structure::new().with("value", count))?;
            }
        }
    }
    server.stop();
    Ok(())
}
