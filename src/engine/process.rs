use std::{
    io::{BufRead, BufReader, Read},
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use futures::{
    channel::oneshot,
    future::{self, BoxFuture},
};
use parking_lot::Mutex;

use crate::{
    engine::{
        EngineStarted, EngineState, EngineStatus, TunnelEngine,
        config::{EngineConfig, RenderOptions, redact_user_id},
    },
    error::EngineError,
    events::{Broadcaster, Subscription},
    process_log::{LogLineEvent, ProcessLog},
};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

type PendingStart = Mutex<Option<oneshot::Sender<Result<EngineStarted, EngineError>>>>;

#[derive(Clone, Debug)]
pub struct ProcessEngineOptions {
    pub binary: PathBuf,
    pub working_directory: PathBuf,
    pub render: RenderOptions,
    pub connect_timeout: Duration,
}

struct RunningChild {
    generation: u64,
    child: Child,
}

/// Runs an Xray-compatible binary as a child process and reads its output to
/// decide when the tunnel is up.
///
/// The child slot stays locked for the whole of `spawn`, so `stop` either
/// runs before a spawn begins or finds the child it produced.
pub struct ProcessEngine {
    options: ProcessEngineOptions,
    child: Arc<Mutex<Option<RunningChild>>>,
    process_log: Arc<Mutex<ProcessLog>>,
    status: Arc<Broadcaster<EngineStatus>>,
    generation: Arc<AtomicU64>,
}

struct Attempt {
    generation: u64,
    current: Arc<AtomicU64>,
    pending: PendingStart,
    process_log: Arc<Mutex<ProcessLog>>,
    status: Arc<Broadcaster<EngineStatus>>,
    open_streams: Arc<AtomicUsize>,
}

impl Attempt {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    fn resolve(&self, result: Result<EngineStarted, EngineError>) -> bool {
        match self.pending.lock().take() {
            Some(sender) => {
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    fn publish(&self, status: EngineStatus) {
        if self.is_current() {
            self.status.publish(status);
        }
    }

    fn handle_line(&self, line: String) {
        let event = self.process_log.lock().push_line(line.clone());
        match event {
            LogLineEvent::Started => {
                if self.resolve(Ok(EngineStarted::default())) {
                    self.publish(EngineStatus::new(EngineState::Running));
                }
            }
            LogLineEvent::ConnectError => {
                if self.resolve(Err(EngineError::Start(line.clone()))) {
                    self.publish(EngineStatus::new(EngineState::Failed).with_detail(line));
                }
            }
            LogLineEvent::PostConnectError => {
                self.publish(EngineStatus::new(EngineState::Failed).with_detail(line));
            }
            LogLineEvent::Normal => {}
        }
    }

    fn stream_closed(&self) {
        if self.open_streams.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let detail = {
            let log = self.process_log.lock();
            log.error
                .clone()
                .or_else(|| log.post_connect_error.clone())
                .or_else(|| log.lines.last().map(|line| format!("process exited after: {line}")))
                .unwrap_or_else(|| "process exited".into())
        };
        log::info!("[engine] output closed: {detail}");
        if !self.resolve(Err(EngineError::Exited(detail.clone()))) {
            self.publish(EngineStatus::new(EngineState::Stopped).with_detail(detail));
        }
    }

    fn read_stream(self: Arc<Self>, stream: impl Read + Send + 'static, label: &'static str) {
        std::thread::spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        log::trace!("[engine {label}] {line}");
                        self.handle_line(line);
                    }
                    Err(error) => {
                        log::trace!("[engine {label}] reader ended: {error}");
                        break;
                    }
                }
            }
            self.stream_closed();
        });
    }
}

impl ProcessEngine {
    pub fn new(options: ProcessEngineOptions) -> Self {
        Self {
            options,
            child: Arc::new(Mutex::new(None)),
            process_log: Arc::new(Mutex::new(ProcessLog::new())),
            status: Arc::new(Broadcaster::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn configuration_path(&self) -> PathBuf {
        self.options.working_directory.join("engine.json")
    }

    fn write_configuration(&self, config: &EngineConfig) -> Result<PathBuf, EngineError> {
        let rendered = config
            .to_xray_json(&self.options.render)
            .map_err(|error| EngineError::Start(format!("configuration serialization: {error}")))?;
        log::info!(
            "[engine] generated configuration:\n{}",
            redact_user_id(&rendered, &config.user_id)
        );

        std::fs::create_dir_all(&self.options.working_directory).map_err(|error| {
            EngineError::Start(format!(
                "failed to create {}: {error}",
                self.options.working_directory.display()
            ))
        })?;
        let path = self.configuration_path();
        std::fs::write(&path, rendered).map_err(|error| {
            EngineError::Start(format!("failed to write {}: {error}", path.display()))
        })?;
        Ok(path)
    }

    fn spawn(
        &self,
        config: EngineConfig,
    ) -> Result<(u64, oneshot::Receiver<Result<EngineStarted, EngineError>>), EngineError> {
        let mut slot = self.child.lock();
        if let Some(previous) = slot.take() {
            log::warn!("[engine] replacing a running child (pid={})", previous.child.id());
            terminate_in_background(previous.child);
        }

        let path = self.write_configuration(&config)?;
        log::info!(
            "[engine] spawning: {} run -c {}",
            self.options.binary.display(),
            path.display()
        );
        let mut child = Command::new(&self.options.binary)
            .arg("run")
            .arg("-c")
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| {
                EngineError::Start(format!(
                    "could not start {}: {error}",
                    self.options.binary.display()
                ))
            })?;
        log::info!("[engine] child started (pid={})", child.id());

        self.process_log.lock().reset();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, receiver) = oneshot::channel();
        let attempt = Arc::new(Attempt {
            generation,
            current: self.generation.clone(),
            pending: Mutex::new(Some(sender)),
            process_log: self.process_log.clone(),
            status: self.status.clone(),
            open_streams: Arc::new(AtomicUsize::new(2)),
        });
        attempt.publish(EngineStatus::new(EngineState::Starting));

        match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => {
                attempt.clone().read_stream(stdout, "stdout");
                attempt.clone().read_stream(stderr, "stderr");
            }
            _ => {
                log::warn!("[engine] no output pipes from child");
                terminate_in_background(child);
                return Err(EngineError::Start("no output pipes from child".into()));
            }
        }

        let timeout = self.options.connect_timeout;
        let watchdog = attempt.clone();
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            if watchdog.resolve(Err(EngineError::Timeout(timeout.as_secs()))) {
                log::warn!("[engine] no startup confirmation after {}s", timeout.as_secs());
                watchdog.publish(EngineStatus::new(EngineState::Failed).with_detail("timeout"));
            }
        });

        *slot = Some(RunningChild { generation, child });
        Ok((generation, receiver))
    }

    fn take_child(&self) -> Option<Child> {
        let mut slot = self.child.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        slot.take().map(|running| running.child)
    }

    /// Takes the child only if it still belongs to `generation`.
    fn take_child_of(&self, generation: u64) -> Option<Child> {
        let mut slot = self.child.lock();
        if slot.as_ref()?.generation != generation {
            return None;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        slot.take().map(|running| running.child)
    }
}

/// Kills the attempt's child if the `start` future is dropped before it
/// settles.
struct PendingAttempt<'a> {
    engine: &'a ProcessEngine,
    generation: u64,
    settled: bool,
}

impl Drop for PendingAttempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(child) = self.engine.take_child_of(self.generation) {
            log::info!("[engine] start abandoned, terminating pid={}", child.id());
            terminate_in_background(child);
        }
    }
}

impl TunnelEngine for ProcessEngine {
    fn start(&self, config: EngineConfig) -> BoxFuture<'_, Result<EngineStarted, EngineError>> {
        let (generation, receiver) = match self.spawn(config) {
            Ok(spawned) => spawned,
            Err(error) => return Box::pin(future::ready(Err(error))),
        };
        let mut attempt = PendingAttempt {
            engine: self,
            generation,
            settled: false,
        };

        Box::pin(async move {
            let result = receiver
                .await
                .unwrap_or_else(|_| Err(EngineError::Exited("start abandoned".into())));
            attempt.settled = true;
            if result.is_err()
                && let Some(child) = self.take_child_of(generation)
            {
                // the next attempt may reuse the same local port
                if let Err(error) = terminate_off_thread(child).await {
                    log::warn!("[terminate] {error}");
                }
            }
            result
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        let Some(child) = self.take_child() else {
            return Box::pin(future::ready(Ok(())));
        };

        let status = self.status.clone();
        Box::pin(async move {
            let result = terminate_off_thread(child).await;
            status.publish(EngineStatus::new(EngineState::Stopped));
            result
        })
    }

    fn status(&self) -> Subscription<EngineStatus> {
        self.status.subscribe()
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        if let Some(running) = self.child.lock().take() {
            log::info!("[engine] dropped with a running child, terminating");
            terminate_in_background(running.child);
        }
    }
}

fn send_interrupt(child: &Child) -> bool {
    if cfg!(unix) {
        Command::new("kill")
            .arg("-INT")
            .arg(child.id().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    } else {
        false
    }
}

fn terminate(mut child: Child) -> Result<(), EngineError> {
    let pid = child.id();
    if let Ok(Some(status)) = child.try_wait() {
        log::info!("[terminate] child already exited: {status}");
        return Ok(());
    }

    if send_interrupt(&child) {
        log::info!("[terminate] sent SIGINT to pid={pid}");
        let deadline = Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("[terminate] child reaped: {status}");
                    return Ok(());
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(error) => return Err(EngineError::Teardown(error.to_string())),
            }
        }
        log::warn!("[terminate] graceful shutdown timed out for pid={pid}");
    }

    child
        .kill()
        .map_err(|error| EngineError::Teardown(format!("kill pid={pid}: {error}")))?;
    match child.wait() {
        Ok(status) => {
            log::info!("[terminate] child reaped: {status}");
            Ok(())
        }
        Err(error) => Err(EngineError::Teardown(format!("wait pid={pid}: {error}"))),
    }
}

async fn terminate_off_thread(child: Child) -> Result<(), EngineError> {
    let (sender, receiver) = oneshot::channel();
    std::thread::spawn(move || {
        let _ = sender.send(terminate(child));
    });
    receiver
        .await
        .unwrap_or_else(|_| Err(EngineError::Teardown("teardown thread vanished".into())))
}

fn terminate_in_background(child: Child) {
    std::thread::spawn(move || {
        if let Err(error) = terminate(child) {
            log::warn!("[terminate] {error}");
        }
    });
}
