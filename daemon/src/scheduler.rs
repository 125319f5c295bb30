use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use chrono::{DateTime, Utc};
use common::{Config, CronExpression, PathConfig};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigStore;
use crate::events::EventBus;
use crate::remote::AssetClient;
use crate::scanner::{self, ScanOutcome};
use crate::uploader::{TaskState, UploadWorker};

/// Schedule evaluation granularity. Two triggers for the same expression
/// within the same minute never both fire.
pub const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Concurrent file uploads per pass. Keeps one backlogged directory from
/// saturating the network link or the remote server.
pub const UPLOADS_PER_PASS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub uploaded: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Runtime binding of one monitored directory to its compiled schedules and
/// live next-run time. Derived from config at start; discarded on stop.
pub struct PathJob {
    path: PathConfig,
    schedules: Vec<CronExpression>,
    next_run: Option<DateTime<Utc>>,
    last_status: Option<PassSummary>,
}

impl PathJob {
    pub fn new(path: PathConfig, now: DateTime<Utc>) -> anyhow::Result<Self> {
        let mut schedules = Vec::with_capacity(path.cron_expressions.len());
        for expr in &path.cron_expressions {
            let compiled = CronExpression::parse(expr).map_err(|e| {
                anyhow!("path {}: invalid cron expression `{}`: {}", path.directory, expr, e)
            })?;
            schedules.push(compiled);
        }
        let mut job = Self {
            path,
            schedules,
            next_run: None,
            last_status: None,
        };
        job.next_run = job.compute_next_run(now);
        Ok(job)
    }

    /// Earliest future firing across all of this path's expressions.
    pub fn compute_next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.next_after(after))
            .min()
    }

    pub fn due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.next_run, Some(at) if at <= now)
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.next_run
    }
}

enum RunCommand {
    /// Manual trigger: bypasses the cron check, reuses the same pass.
    Trigger(PathConfig),
    PassFinished {
        path_id: String,
        summary: PassSummary,
    },
}

struct RunHandle {
    token: CancellationToken,
    cmd_tx: mpsc::UnboundedSender<RunCommand>,
    task: JoinHandle<()>,
}

struct Inner {
    state: SchedulerState,
    run: Option<RunHandle>,
}

/// Owns the scheduler state machine and all live PathJobs. All transitions
/// go through the single inner mutex, so concurrent start/stop calls from
/// the UI cannot race.
pub struct Supervisor {
    inner: Mutex<Inner>,
    store: Arc<ConfigStore>,
    bus: Arc<EventBus>,
    client: Arc<AssetClient>,
}

impl Supervisor {
    pub fn new(store: Arc<ConfigStore>, bus: Arc<EventBus>, client: Arc<AssetClient>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SchedulerState::Stopped,
                run: None,
            }),
            store,
            bus,
            client,
        }
    }

    /// Collapsed for the UI: anything that is not fully stopped counts as
    /// running (a Stopping scheduler is still draining uploads).
    pub fn status(&self) -> bool {
        !matches!(self.inner.lock().unwrap().state, SchedulerState::Stopped)
    }

    /// Derive PathJobs from the current config and arm the tick loop.
    /// Idempotent: starting an already-running scheduler is a successful
    /// no-op. Configuration problems abort the start and leave the
    /// scheduler Stopped.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            SchedulerState::Running | SchedulerState::Starting => return Ok(()),
            SchedulerState::Stopping => bail!("scheduler is still stopping"),
            SchedulerState::Stopped => {}
        }
        inner.state = SchedulerState::Starting;

        match self.build_run() {
            Ok(run) => {
                let paths = run.1;
                inner.run = Some(run.0);
                inner.state = SchedulerState::Running;
                drop(inner);
                self.bus
                    .info(format!("Scheduler started, watching {} path(s)", paths));
                Ok(())
            }
            Err(e) => {
                inner.state = SchedulerState::Stopped;
                Err(e)
            }
        }
    }

    fn build_run(&self) -> anyhow::Result<(RunHandle, usize)> {
        let config = match self.store.current() {
            Some(config) => config,
            None => match self.store.load() {
                Ok(Some(config)) => config,
                Ok(None) => bail!("no configuration loaded"),
                Err(e) => return Err(e.into()),
            },
        };
        if config.paths.is_empty() {
            bail!("no paths configured");
        }

        let now = Utc::now();
        let mut jobs = Vec::with_capacity(config.paths.len());
        for path in &config.paths {
            let job = PathJob::new(path.clone(), now)?;
            match job.next_run() {
                Some(at) => log::info!("Path {} first run at {}", path.directory, at),
                None => log::warn!(
                    "Path {} has no scheduled runs (manual trigger only)",
                    path.directory
                ),
            }
            jobs.push(job);
        }

        let token = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_loop(
            jobs,
            config.clone(),
            token.clone(),
            cmd_tx.clone(),
            cmd_rx,
            self.bus.clone(),
            self.client.clone(),
        ));

        let paths = config.paths.len();
        Ok((RunHandle { token, cmd_tx, task }, paths))
    }

    /// Stop pulling new files, let in-flight uploads finish, and return
    /// once every pass has reached a terminal state. Stopping an already
    /// stopped scheduler is a successful no-op.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                SchedulerState::Stopped | SchedulerState::Stopping => return Ok(()),
                SchedulerState::Starting | SchedulerState::Running => {}
            }
            inner.state = SchedulerState::Stopping;
            inner.run.take()
        };

        if let Some(handle) = handle {
            handle.token.cancel();
            if let Err(e) = handle.task.await {
                log::error!("Scheduler run loop aborted: {}", e);
            }
        }

        self.inner.lock().unwrap().state = SchedulerState::Stopped;
        self.bus.info("Scheduler stopped");
        Ok(())
    }

    /// Run one pass for a path right now, bypassing its schedules. While
    /// the scheduler runs, the pass joins the active run (and is drained by
    /// `stop()`); while stopped, it runs standalone.
    pub fn trigger_now(&self, path_id: &str) -> anyhow::Result<()> {
        let config = self
            .store
            .current()
            .ok_or_else(|| anyhow!("no configuration loaded"))?;
        let path = config
            .paths
            .iter()
            .find(|p| p.id == path_id || p.directory == path_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown path: {}", path_id))?;

        let inner = self.inner.lock().unwrap();
        if let Some(run) = &inner.run {
            run.cmd_tx
                .send(RunCommand::Trigger(path))
                .map_err(|_| anyhow!("scheduler run loop is gone"))?;
        } else {
            self.bus
                .info(format!("Manual upload for {}", path.directory));
            tokio::spawn(run_pass(
                config,
                path,
                CancellationToken::new(),
                self.bus.clone(),
                self.client.clone(),
                None,
            ));
        }
        Ok(())
    }
}

/// One coordinating loop per running scheduler: drives the minute tick,
/// spawns a pass per due PathJob, recomputes next-run times, and drains all
/// in-flight passes before exiting on cancellation.
async fn run_loop(
    mut jobs: Vec<PathJob>,
    config: Arc<Config>,
    token: CancellationToken,
    cmd_tx: mpsc::UnboundedSender<RunCommand>,
    mut cmd_rx: mpsc::UnboundedReceiver<RunCommand>,
    bus: Arc<EventBus>,
    client: Arc<AssetClient>,
) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut passes: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let now = Utc::now();
                for job in jobs.iter_mut() {
                    if !job.due(now) {
                        continue;
                    }
                    // Recompute immediately so a slow pass cannot make the
                    // same minute fire twice.
                    job.next_run = job.compute_next_run(now);
                    if let Some(last) = job.last_status {
                        log::debug!(
                            "Previous pass for {}: {} uploaded, {} duplicates, {} failed",
                            job.path.directory, last.uploaded, last.duplicates, last.failed
                        );
                    }
                    bus.info(format!("Starting scheduled upload for {}", job.path.directory));
                    passes.spawn(run_pass(
                        config.clone(),
                        job.path.clone(),
                        token.child_token(),
                        bus.clone(),
                        client.clone(),
                        Some(cmd_tx.clone()),
                    ));
                }
                // Reap whatever finished since the last tick.
                while passes.try_join_next().is_some() {}
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RunCommand::Trigger(path)) => {
                        bus.info(format!("Manual upload for {}", path.directory));
                        passes.spawn(run_pass(
                            config.clone(),
                            path,
                            token.child_token(),
                            bus.clone(),
                            client.clone(),
                            Some(cmd_tx.clone()),
                        ));
                    }
                    Some(RunCommand::PassFinished { path_id, summary }) => {
                        if let Some(job) = jobs.iter_mut().find(|j| j.path.id == path_id) {
                            job.last_status = Some(summary);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Cancelled: passes stop pulling new files on their own; anything
    // mid-upload finishes before its pass completes.
    if !passes.is_empty() {
        log::info!("Draining {} active pass(es)", passes.len());
    }
    while passes.join_next().await.is_some() {}
}

async fn run_pass(
    config: Arc<Config>,
    path: PathConfig,
    token: CancellationToken,
    bus: Arc<EventBus>,
    client: Arc<AssetClient>,
    report: Option<mpsc::UnboundedSender<RunCommand>>,
) {
    let summary = execute_pass(&config, &path, &token, &bus, &client).await;
    if let Some(tx) = report {
        let _ = tx.send(RunCommand::PassFinished {
            path_id: path.id.clone(),
            summary,
        });
    }
}

/// One scan-and-upload pass for a single directory. All failures inside the
/// pass are absorbed into events; nothing here changes the scheduler state.
async fn execute_pass(
    config: &Arc<Config>,
    path: &PathConfig,
    token: &CancellationToken,
    bus: &Arc<EventBus>,
    client: &Arc<AssetClient>,
) -> PassSummary {
    let conn = config.connection();
    let root = PathBuf::from(&path.directory);
    let recursive = path.recursive;

    let outcome = tokio::task::spawn_blocking(move || scanner::scan(&root, recursive))
        .await
        .unwrap_or_else(|e| {
            log::error!("Scan task for {} aborted: {}", path.directory, e);
            ScanOutcome::default()
        });

    for error in &outcome.errors {
        bus.error(error.clone());
    }
    if outcome.candidates.is_empty() {
        if outcome.errors.is_empty() {
            bus.info(format!("No images found in {}", path.directory));
        }
        return PassSummary::default();
    }

    let total = outcome.candidates.len();
    bus.info(format!("Found {} image(s) in {}", total, path.directory));

    let worker = UploadWorker::new(client.clone(), bus.clone());
    let semaphore = Arc::new(Semaphore::new(UPLOADS_PER_PASS));
    let mut tasks: JoinSet<TaskState> = JoinSet::new();
    let mut started = 0usize;

    for candidate in outcome.candidates {
        // stop() means: pull no new files. In-flight uploads are awaited
        // below so they always reach a terminal state.
        if token.is_cancelled() {
            break;
        }
        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => {
                match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                }
            }
        };
        started += 1;
        let worker = worker.clone();
        let conn = conn.clone();
        tasks.spawn(async move {
            let _permit = permit;
            worker.process(&conn, candidate).await.state
        });
    }

    let mut summary = PassSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(TaskState::Succeeded) => summary.uploaded += 1,
            Ok(TaskState::Duplicate) => summary.duplicates += 1,
            Ok(TaskState::Failed(_)) => summary.failed += 1,
            Ok(state) => log::error!("Upload task ended in non-terminal state {:?}", state),
            Err(e) => {
                log::error!("Upload task for {} aborted: {}", path.directory, e);
                summary.failed += 1;
            }
        }
    }

    if started < total {
        bus.info(format!(
            "Upload pass for {} stopped early: {} of {} file(s) processed",
            path.directory, started, total
        ));
    } else if summary.failed > 0 {
        bus.error(format!(
            "Finished {}: {} uploaded, {} duplicates, {} failed",
            path.directory, summary.uploaded, summary.duplicates, summary.failed
        ));
    } else {
        bus.success(format!(
            "Finished {}: {} uploaded, {} duplicates",
            path.directory, summary.uploaded, summary.duplicates
        ));
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DEFAULT_HISTORY;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn job(cron: &[&str], now: DateTime<Utc>) -> PathJob {
        PathJob::new(
            PathConfig {
                id: "p1".to_string(),
                directory: "/photos".to_string(),
                cron_expressions: cron.iter().map(|s| s.to_string()).collect(),
                recursive: false,
            },
            now,
        )
        .unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn next_run_is_earliest_across_expressions() {
        let now = utc(2024, 5, 1, 10, 0);
        let job = job(&["0 22 * * *", "30 10 * * *"], now);
        assert_eq!(job.next_run(), Some(utc(2024, 5, 1, 10, 30)));
    }

    #[test]
    fn next_run_is_strictly_in_the_future() {
        let now = utc(2024, 5, 1, 10, 30);
        let job = job(&["30 10 * * *"], now);
        assert_eq!(job.next_run(), Some(utc(2024, 5, 2, 10, 30)));
        assert!(!job.due(now));
    }

    #[test]
    fn no_expressions_means_manual_only() {
        let job = job(&[], utc(2024, 5, 1, 10, 0));
        assert_eq!(job.next_run(), None);
        assert!(!job.due(utc(2099, 1, 1, 0, 0)));
    }

    #[test]
    fn invalid_stored_expression_fails_job_construction() {
        let result = PathJob::new(
            PathConfig {
                id: "p1".to_string(),
                directory: "/photos".to_string(),
                cron_expressions: vec!["not cron".to_string()],
                recursive: false,
            },
            Utc::now(),
        );
        assert!(result.is_err());
    }

    fn supervisor_with(dir: &TempDir, config: Option<Config>) -> Supervisor {
        let store = Arc::new(ConfigStore::new(dir.path().join("config.json")));
        if let Some(config) = config {
            store.save(config).unwrap();
        }
        Supervisor::new(
            store,
            Arc::new(EventBus::new(DEFAULT_HISTORY)),
            Arc::new(AssetClient::new().unwrap()),
        )
    }

    fn one_path_config(dir: &TempDir) -> Config {
        Config {
            server_url: "https://photos.example.com".to_string(),
            api_key: "key".to_string(),
            paths: vec![PathConfig {
                id: String::new(),
                directory: dir.path().display().to_string(),
                cron_expressions: vec!["0 3 * * *".to_string()],
                recursive: false,
            }],
        }
    }

    #[tokio::test]
    async fn start_without_config_fails_and_stays_stopped() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with(&dir, None);
        assert!(supervisor.start().is_err());
        assert!(!supervisor.status());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = one_path_config(&dir);
        let supervisor = supervisor_with(&dir, Some(config));

        assert!(!supervisor.status());
        supervisor.start().unwrap();
        assert!(supervisor.status());
        // Second start is a successful no-op.
        supervisor.start().unwrap();
        assert!(supervisor.status());

        supervisor.stop().await.unwrap();
        assert!(!supervisor.status());
        // Second stop is a successful no-op.
        supervisor.stop().await.unwrap();
        assert!(!supervisor.status());
    }

    #[tokio::test]
    async fn restart_after_stop_works() {
        let dir = TempDir::new().unwrap();
        let config = one_path_config(&dir);
        let supervisor = supervisor_with(&dir, Some(config));

        supervisor.start().unwrap();
        supervisor.stop().await.unwrap();
        supervisor.start().unwrap();
        assert!(supervisor.status());
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn trigger_unknown_path_fails() {
        let dir = TempDir::new().unwrap();
        let config = one_path_config(&dir);
        let supervisor = supervisor_with(&dir, Some(config));
        assert!(supervisor.trigger_now("does-not-exist").is_err());
    }

    #[tokio::test]
    async fn trigger_without_config_fails() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with(&dir, None);
        assert!(supervisor.trigger_now("anything").is_err());
    }
}
