mod config;
mod events;
mod hasher;
mod remote;
mod scanner;
mod scheduler;
mod uploader;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use common::{Connection, Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use config::ConfigStore;
use events::EventBus;
use remote::AssetClient;
use scheduler::Supervisor;

#[derive(Parser)]
#[command(name = "shuttersync-daemon", version, about = "Cron-scheduled image auto-uploader")]
struct Args {
    /// IPC socket path
    #[arg(long, default_value = common::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    /// Config file path (defaults to ~/.config/shuttersync/config.json)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.log_file.as_deref())?;
    log::info!("Starting shuttersync-daemon...");

    let config_path = args.config.clone().unwrap_or_else(ConfigStore::default_path);
    let store = Arc::new(ConfigStore::new(config_path));
    match store.load() {
        Ok(Some(config)) => log::info!("Loaded configuration with {} path(s)", config.paths.len()),
        Ok(None) => log::info!("No configuration yet"),
        // Not fatal: the UI gets the same error from LoadConfig and can
        // offer a fix; the daemon keeps serving commands.
        Err(e) => log::error!("Stored configuration is unusable: {}", e),
    }

    let bus = Arc::new(EventBus::new(events::DEFAULT_HISTORY));
    let client = Arc::new(AssetClient::new()?);
    let supervisor = Arc::new(Supervisor::new(store.clone(), bus.clone(), client.clone()));

    if args.socket.exists() {
        std::fs::remove_file(&args.socket)?;
    }
    let listener = UnixListener::bind(&args.socket)?;
    log::info!("Listening on {}", args.socket.display());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down, draining in-flight uploads...");
                supervisor.stop().await?;
                let _ = std::fs::remove_file(&args.socket);
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let supervisor = supervisor.clone();
                let store = store.clone();
                let bus = bus.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, supervisor, store, bus, client).await {
                        log::debug!("Client connection closed: {}", e);
                    }
                });
            }
        }
    }
}

async fn handle_client(
    stream: UnixStream,
    supervisor: Arc<Supervisor>,
    store: Arc<ConfigStore>,
    bus: Arc<EventBus>,
    client: Arc<AssetClient>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                write_response(&mut writer, &Response::Error(format!("bad request: {}", e)))
                    .await?;
                continue;
            }
        };
        log::info!("Received request: {}", request_name(&request));

        match request {
            Request::Watch => return stream_events(writer, &bus).await,
            other => {
                let response = dispatch(other, &supervisor, &store, &client).await;
                write_response(&mut writer, &response).await?;
            }
        }
    }
    Ok(())
}

async fn dispatch(
    request: Request,
    supervisor: &Supervisor,
    store: &ConfigStore,
    client: &AssetClient,
) -> Response {
    match request {
        Request::TestConnection { server_url, api_key } => {
            let conn = Connection {
                server_url: server_url.trim_end_matches('/').to_string(),
                api_key,
            };
            match client.test_connection(&conn).await {
                Ok(reachable) => Response::Connection { reachable },
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::SaveConfig(config) => match store.save(config) {
            Ok(_) => Response::Ok,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::LoadConfig => match store.load() {
            Ok(config) => Response::Config(config.map(|c| (*c).clone())),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::StartScheduler => match supervisor.start() {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::StopScheduler => match supervisor.stop().await {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::StatusScheduler => Response::Status {
            running: supervisor.status(),
        },
        Request::TriggerNow { path_id } => match supervisor.trigger_now(&path_id) {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e.to_string()),
        },
        // Handled by the connection loop before dispatch.
        Request::Watch => Response::Error("watch cannot be dispatched".to_string()),
    }
}

/// Replay the retained history, then forward live events until the client
/// hangs up (the write error ends the loop) or the daemon shuts down.
async fn stream_events(mut writer: OwnedWriteHalf, bus: &EventBus) -> anyhow::Result<()> {
    let (history, mut rx) = bus.subscribe();
    for event in history {
        write_response(&mut writer, &Response::Event(event)).await?;
    }
    loop {
        match rx.recv().await {
            Ok(event) => write_response(&mut writer, &Response::Event(event)).await?,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                let note = Response::Error(format!("{} event(s) dropped (slow consumer)", missed));
                write_response(&mut writer, &note).await?;
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> anyhow::Result<()> {
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    Ok(())
}

/// Request names for the log. The full request is never logged: SaveConfig
/// and TestConnection carry the API key.
fn request_name(request: &Request) -> &'static str {
    match request {
        Request::TestConnection { .. } => "TestConnection",
        Request::SaveConfig(_) => "SaveConfig",
        Request::LoadConfig => "LoadConfig",
        Request::StartScheduler => "StartScheduler",
        Request::StopScheduler => "StopScheduler",
        Request::StatusScheduler => "StatusScheduler",
        Request::TriggerNow { .. } => "TriggerNow",
        Request::Watch => "Watch",
    }
}

fn setup_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}
