use crate::config::WebUiConfig;
use anyhow::{Context, Result};
use log::{info, warn};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
// The server answers its port a moment after the banner shows up.
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle of the stable-diffusion-webui background process.
/// Stopped -> Starting -> Ready, back to Stopped on `stop()` or child exit.
pub struct WebUiManager {
    config: WebUiConfig,
    child: Arc<RwLock<Option<Child>>>,
    ready: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    monitor: Arc<Mutex<Option<String>>>,
}

impl WebUiManager {
    pub fn new(config: WebUiConfig) -> Self {
        Self {
            config,
            child: Arc::new(RwLock::new(None)),
            ready: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(AtomicBool::new(false)),
            monitor: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawns the process and blocks until the readiness marker appears in
    /// its stdout, plus a settle delay. Calling while already running is a
    /// warning, not an error.
    pub async fn start(&self) -> Result<()> {
        {
            let lock = self.child.read().await;
            if lock.is_some() {
                warn!("Webui process already running. Ignoring request to start again.");
                return Ok(());
            }
        }

        info!("Starting webui: {} {:?}", self.config.command, self.config.args);
        self.exited.store(false, Ordering::SeqCst);

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .current_dir(&self.config.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().context("Failed to spawn webui process")?;

        let stdout = child.stdout.take().context("Failed to open webui stdout")?;
        let stderr = child.stderr.take().context("Failed to open webui stderr")?;

        {
            let mut lock = self.child.write().await;
            *lock = Some(child);
        }

        let ready = self.ready.clone();
        let exited = self.exited.clone();
        let monitor = self.monitor.clone();
        let marker = self.config.ready_marker.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("[webui] {}", line);
                if line.contains(&marker) {
                    ready.store(true, Ordering::SeqCst);
                }
                let mut condition = monitor.lock().await;
                if condition
                    .as_ref()
                    .is_some_and(|c| line.contains(c.as_str()))
                {
                    *condition = None;
                }
            }
            ready.store(false, Ordering::SeqCst);
            exited.store(true, Ordering::SeqCst);
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("[webui] {}", line);
            }
        });

        info!("Waiting for webui to become ready...");
        while !self.ready.load(Ordering::SeqCst) {
            if self.exited.load(Ordering::SeqCst) {
                self.stop().await;
                anyhow::bail!("webui process exited before becoming ready");
            }
            sleep(POLL_INTERVAL).await;
        }
        sleep(SETTLE_DELAY).await;
        info!("Webui is ready.");

        Ok(())
    }

    /// Polls until `marker` appears in a subsequent stdout line. `None`
    /// timeout waits indefinitely, matching the upstream tooling this wraps.
    pub async fn wait_for_marker(&self, marker: &str, timeout: Option<Duration>) -> Result<()> {
        {
            let mut condition = self.monitor.lock().await;
            *condition = Some(marker.to_string());
        }

        let started = Instant::now();
        loop {
            if self.monitor.lock().await.is_none() {
                return Ok(());
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    let mut condition = self.monitor.lock().await;
                    *condition = None;
                    anyhow::bail!("Timed out waiting for log marker: {}", marker);
                }
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub async fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);
        let mut lock = self.child.write().await;
        if let Some(mut child) = lock.take() {
            let _ = child.kill().await;
        }
    }
}
