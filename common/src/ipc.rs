use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::event::UploadEvent;

/// Commands the host UI sends to the daemon, one JSON object per line over
/// the Unix socket.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    TestConnection { server_url: String, api_key: String },
    SaveConfig(Config),
    LoadConfig,
    StartScheduler,
    StopScheduler,
    StatusScheduler,
    TriggerNow { path_id: String },
    /// Switch the connection to streaming mode: the daemon replies with the
    /// retained event history, then forwards live events until the client
    /// hangs up.
    Watch,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(String),
    Config(Option<Config>),
    Status { running: bool },
    Connection { reachable: bool },
    Event(UploadEvent),
}
