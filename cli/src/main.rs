use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use common::{Config, Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(author, version, about = "Control the shuttersync upload daemon", long_about = None)]
struct Cli {
    /// Daemon socket path
    #[arg(long, default_value = common::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the asset server accepts the credentials
    Test {
        #[arg(long)]
        server_url: String,
        #[arg(long)]
        api_key: String,
    },
    /// Show the stored configuration
    Config,
    /// Validate and store a configuration from a JSON file
    Import {
        /// JSON file with server_url, api_key and paths
        file: PathBuf,
    },
    /// Start the scheduler
    Start,
    /// Stop the scheduler, draining in-flight uploads first
    Stop,
    /// Show whether the scheduler is running
    Status,
    /// Run one upload pass right now, bypassing the schedule
    Trigger {
        /// Path id or directory as shown by `config`
        path: String,
    },
    /// Tail the daemon's event stream
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let stream = UnixStream::connect(&cli.socket)
        .await
        .with_context(|| format!("cannot reach daemon at {} (is it running?)", cli.socket.display()))?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let request = match &cli.command {
        Commands::Test { server_url, api_key } => Request::TestConnection {
            server_url: server_url.clone(),
            api_key: api_key.clone(),
        },
        Commands::Config => Request::LoadConfig,
        Commands::Import { file } => {
            let raw = std::fs::read_to_string(file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let config: Config = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a valid config", file.display()))?;
            Request::SaveConfig(config)
        }
        Commands::Start => Request::StartScheduler,
        Commands::Stop => Request::StopScheduler,
        Commands::Status => Request::StatusScheduler,
        Commands::Trigger { path } => Request::TriggerNow {
            path_id: path.clone(),
        },
        Commands::Watch => Request::Watch,
    };

    let mut payload = serde_json::to_vec(&request)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;

    if matches!(cli.command, Commands::Watch) {
        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<Response>(&line)? {
                Response::Event(event) => {
                    let local = event.timestamp.with_timezone(&chrono::Local);
                    println!("[{}] {:<7} {}", local.format("%H:%M:%S"), event.level, event.message);
                }
                Response::Error(e) => eprintln!("! {}", e),
                _ => {}
            }
        }
        return Ok(());
    }

    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow!("daemon closed the connection"))?;

    match serde_json::from_str::<Response>(&line)? {
        Response::Ok => println!("OK"),
        Response::Error(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        Response::Status { running } => {
            println!("{}", if running { "running" } else { "not running" })
        }
        Response::Connection { reachable } => {
            if reachable {
                println!("Connection OK");
            } else {
                println!("Connection failed");
                std::process::exit(1);
            }
        }
        Response::Config(None) => println!("No configuration saved yet."),
        Response::Config(Some(config)) => print_config(&config),
        Response::Event(_) => {}
    }

    Ok(())
}

fn print_config(config: &Config) {
    println!("Server: {}", config.server_url);

    let mut table = Table::new();
    table.set_header(vec!["ID", "Directory", "Schedules", "Recursive"]);
    for path in &config.paths {
        table.add_row(vec![
            path.id.clone(),
            path.directory.clone(),
            path.cron_expressions.join(", "),
            path.recursive.to_string(),
        ]);
    }
    println!("{table}");
}
