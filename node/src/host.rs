use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{ErrorKind, Write as _},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{error, info, warn};

use airnode_common::{
    CommissioningSignal, CounterStore, FirmwareStore, LedPattern, Level, NetworkIdentity,
    NodeAction, NodeConfig, NodeLifecycle, OtaError, OtaEvent, OtaHeader, OtaPhase, StackStatus,
    StatusSurface, StoreError, UpdateSlot,
};

const TICK_INTERVAL_MS: u64 = 50;
const STATUS_LOG_INTERVAL_MS: u64 = 1_000;
const STEERING_LATENCY_MS: u64 = 500;
const OTA_BLOCK_SIZE: usize = 256;

type HostNode = NodeLifecycle<FileStore, FileFirmware>;

#[derive(Clone)]
struct AppState {
    node: Arc<Mutex<HostNode>>,
    /// Simulated GPIO line, high while the button is released.
    button_line: Arc<AtomicBool>,
    button_wake: Arc<Notify>,
    stack: mpsc::Sender<StackRequest>,
    exit: mpsc::Sender<NodeAction>,
}

#[derive(Debug, Clone, Copy)]
enum StackRequest {
    StartSteering,
    ReadLocalTime,
}

#[derive(Debug, Clone, Default)]
struct Simulation {
    steering_failures: u32,
    button_hold_ms: Option<u64>,
    button_press_at_ms: u64,
    ota_bytes: Option<u32>,
}

impl Simulation {
    fn from_env() -> Self {
        Self {
            steering_failures: env_parse("AIRNODE_SIM_STEERING_FAILURES").unwrap_or(0),
            button_hold_ms: env_parse("AIRNODE_SIM_BUTTON_HOLD_MS"),
            button_press_at_ms: env_parse("AIRNODE_SIM_BUTTON_AT_MS").unwrap_or(5_000),
            ota_bytes: env_parse("AIRNODE_SIM_OTA_BYTES"),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config().unwrap_or_else(|err| {
        warn!("failed to load node config: {err:#}");
        NodeConfig::default()
    });

    let store_path = std::env::var("AIRNODE_STORE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("airnode-store.json"));
    let first_start = !store_path.exists();
    let store = FileStore::open(&store_path);
    let firmware = FileFirmware::new(
        store_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    );

    let mut node = NodeLifecycle::new(config, store, firmware);
    let status = node.status();
    if node.boot(monotonic_ms()) {
        warn!("reboot loop detected, factory reset is pending");
    }

    let simulation = Simulation::from_env();
    let (stack_tx, stack_rx) = mpsc::channel(16);
    let (signal_tx, signal_rx) = mpsc::channel(16);
    let (exit_tx, mut exit_rx) = mpsc::channel(1);

    let app_state = AppState {
        node: Arc::new(Mutex::new(node)),
        button_line: Arc::new(AtomicBool::new(true)),
        button_wake: Arc::new(Notify::new()),
        stack: stack_tx,
        exit: exit_tx,
    };

    spawn_status_logger(status.clone());
    spawn_button_task(app_state.clone());
    spawn_tick_loop(app_state.clone());
    spawn_signal_loop(app_state.clone(), signal_rx);
    spawn_mesh_stack(simulation.clone(), stack_rx, signal_tx.clone());

    if let Some(hold_ms) = simulation.button_hold_ms {
        spawn_button_press(app_state.clone(), simulation.button_press_at_ms, hold_ms);
    }
    if let Some(bytes) = simulation.ota_bytes {
        spawn_ota_transfer(app_state.clone(), status, bytes);
    }

    let start = if first_start {
        CommissioningSignal::FirstStart {
            status: StackStatus::OK,
        }
    } else {
        CommissioningSignal::Reboot {
            status: StackStatus::OK,
        }
    };
    signal_tx
        .send(start)
        .await
        .context("mesh stack signal channel closed")?;

    info!("node simulator started");

    tokio::select! {
        action = exit_rx.recv() => {
            match action {
                Some(NodeAction::FactoryReset) => {
                    info!("factory reset: network credentials cleared, restarting");
                }
                Some(action) => info!("{action:?}: restarting"),
                None => warn!("exit channel closed"),
            }
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("shutting down");
        }
    }

    Ok(())
}

fn load_config() -> anyhow::Result<NodeConfig> {
    let Ok(path) = std::env::var("AIRNODE_CONFIG") else {
        return Ok(NodeConfig::default());
    };

    let raw = fs::read(&path).with_context(|| format!("failed to read `{path}`"))?;
    Ok(serde_json::from_slice::<NodeConfig>(&raw)?)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

fn spawn_tick_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));

        loop {
            interval.tick().await;
            let actions = {
                let mut node = app_state.node.lock().await;
                node.tick(monotonic_ms())
            };

            if !actions.is_empty() {
                execute_node_actions(&app_state, actions).await;
            }
        }
    });
}

fn spawn_signal_loop(app_state: AppState, mut signals: mpsc::Receiver<CommissioningSignal>) {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            let actions = {
                let mut node = app_state.node.lock().await;
                node.on_commissioning_signal(signal, monotonic_ms())
            };
            execute_node_actions(&app_state, actions).await;
        }
    });
}

/// Samples the line after every wake. Several edges between wakes collapse
/// into one sample.
fn spawn_button_task(app_state: AppState) {
    tokio::spawn(async move {
        loop {
            app_state.button_wake.notified().await;
            let level = Level::from_high(app_state.button_line.load(Ordering::Acquire));
            let mut node = app_state.node.lock().await;
            node.on_button(level, monotonic_ms());
        }
    });
}

fn spawn_button_press(app_state: AppState, at_ms: u64, hold_ms: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(at_ms)).await;
        info!("simulated button pressed");
        app_state.button_line.store(false, Ordering::Release);
        app_state.button_wake.notify_one();

        tokio::time::sleep(Duration::from_millis(hold_ms)).await;
        info!("simulated button released after {hold_ms}ms");
        app_state.button_line.store(true, Ordering::Release);
        app_state.button_wake.notify_one();
    });
}

fn spawn_status_logger(status: StatusSurface) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(STATUS_LOG_INTERVAL_MS));
        let mut last: Option<LedPattern> = None;

        loop {
            interval.tick().await;
            let pattern = status.led_pattern();
            if last != Some(pattern) {
                info!("status LED: {pattern:?}");
                last = Some(pattern);
            }
        }
    });
}

/// Stands in for the radio stack: answers steering requests and time reads.
fn spawn_mesh_stack(
    simulation: Simulation,
    mut requests: mpsc::Receiver<StackRequest>,
    signals: mpsc::Sender<CommissioningSignal>,
) {
    tokio::spawn(async move {
        let mut failures_left = simulation.steering_failures;

        while let Some(request) = requests.recv().await {
            match request {
                StackRequest::StartSteering => {
                    tokio::time::sleep(Duration::from_millis(STEERING_LATENCY_MS)).await;
                    let signal = if failures_left > 0 {
                        failures_left -= 1;
                        CommissioningSignal::SteeringResult {
                            status: StackStatus(-1),
                            network: None,
                        }
                    } else {
                        CommissioningSignal::SteeringResult {
                            status: StackStatus::OK,
                            network: Some(NetworkIdentity {
                                pan_id: 0x1a62,
                                extended_pan_id: [0x21, 0x43, 0x65, 0x87, 0x09, 0xba, 0xdc, 0xfe],
                            }),
                        }
                    };

                    if signals.send(signal).await.is_err() {
                        break;
                    }
                }
                StackRequest::ReadLocalTime => {
                    let epoch = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|elapsed| elapsed.as_secs())
                        .unwrap_or(0);
                    info!("local time read from coordinator: {epoch}");
                }
            }
        }
    });
}

fn spawn_ota_transfer(app_state: AppState, status: StatusSurface, image_size: u32) {
    tokio::spawn(async move {
        while status.steering() {
            tokio::time::sleep(Duration::from_millis(STATUS_LOG_INTERVAL_MS)).await;
        }

        let config = { app_state.node.lock().await.config().ota.clone() };
        let header = OtaHeader {
            manufacturer_code: config.manufacturer_code,
            image_type: config.image_type,
            file_version: config.file_version.saturating_add(1),
            image_size,
        };
        let image: Vec<u8> = (0..image_size).map(|index| index as u8).collect();

        let mut events = vec![OtaEvent::new(OtaPhase::Start).with_header(header)];
        events.extend(image.chunks(OTA_BLOCK_SIZE).map(|block| {
            OtaEvent::new(OtaPhase::Receive)
                .with_header(header)
                .with_payload(block)
        }));
        events.push(OtaEvent::new(OtaPhase::Apply));
        events.push(OtaEvent::new(OtaPhase::Check));
        events.push(OtaEvent::new(OtaPhase::Finish).with_header(header));

        for event in events {
            let outcome = {
                let mut node = app_state.node.lock().await;
                node.on_ota_event(event)
            };

            match outcome {
                Ok(outcome) => {
                    if let Some(action) = outcome.action() {
                        execute_node_actions(&app_state, vec![action]).await;
                        return;
                    }
                }
                Err(err) => warn!("simulated OTA event rejected: {err}"),
            }
            tokio::time::sleep(Duration::from_millis(TICK_INTERVAL_MS)).await;
        }
    });
}

async fn execute_node_actions(app_state: &AppState, actions: Vec<NodeAction>) {
    for action in actions {
        match action {
            NodeAction::FactoryReset | NodeAction::Restart => {
                if app_state.exit.send(action).await.is_err() {
                    warn!("exit channel closed, dropping {action:?}");
                }
            }
            NodeAction::StartSteering => {
                info!("starting network steering");
                send_stack_request(app_state, StackRequest::StartSteering).await;
            }
            NodeAction::ReadLocalTime => {
                send_stack_request(app_state, StackRequest::ReadLocalTime).await;
            }
            NodeAction::SetLedEnabled(enabled) => info!("LED enabled: {enabled}"),
            NodeAction::SetLedBrightness(level) => info!("LED brightness: {level}"),
            NodeAction::SetFanMode(mode) => info!("fan mode: {}", mode.as_str()),
        }
    }
}

async fn send_stack_request(app_state: &AppState, request: StackRequest) {
    if let Err(err) = app_state.stack.send(request).await {
        error!("mesh stack unavailable: {err}");
    }
}

/// Key/value store persisted as a JSON object. Every write rewrites the file
/// through a temporary sibling so a crash leaves either the old or new map.
struct FileStore {
    path: PathBuf,
    values: BTreeMap<String, u8>,
}

impl FileStore {
    /// Unreadable or corrupt files start empty so every key reads its
    /// default; the next write replaces the file.
    fn open(path: &Path) -> Self {
        let values = match Self::load(path) {
            Ok(values) => values,
            Err(err) => {
                warn!("store `{}` unreadable, starting empty: {err:#}", path.display());
                BTreeMap::new()
            }
        };

        Self {
            path: path.to_path_buf(),
            values,
        }
    }

    fn load(path: &Path) -> anyhow::Result<BTreeMap<String, u8>> {
        match fs::read(path) {
            Ok(raw) => Ok(serde_json::from_slice::<BTreeMap<String, u8>>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn persist(&self, values: &BTreeMap<String, u8>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_vec_pretty(values)?)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl CounterStore for FileStore {
    fn read_u8(&self, key: &str) -> Result<Option<u8>, StoreError> {
        Ok(self.values.get(key).copied())
    }

    fn write_u8(&mut self, key: &str, value: u8) -> Result<(), StoreError> {
        let mut next = self.values.clone();
        next.insert(key.to_string(), value);
        self.persist(&next)
            .map_err(|err| StoreError::write(key, format!("{err:#}")))?;
        self.values = next;
        Ok(())
    }
}

/// Writes received images next to the store instead of a flash partition.
struct FileFirmware {
    dir: PathBuf,
}

impl FileFirmware {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

struct FileSlot {
    file: Option<File>,
    image_path: PathBuf,
    boot_path: PathBuf,
}

impl FirmwareStore for FileFirmware {
    type Slot = FileSlot;

    fn open_update_slot(&mut self) -> Result<FileSlot, OtaError> {
        let image_path = self.dir.join("airnode-update.bin");
        let file = File::create(&image_path)
            .map_err(|err| OtaError::Open(format!("{}: {err}", image_path.display())))?;

        Ok(FileSlot {
            file: Some(file),
            image_path,
            boot_path: self.dir.join("airnode-boot.json"),
        })
    }
}

impl UpdateSlot for FileSlot {
    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        let file = self.file.as_mut().ok_or_else(|| OtaError::Write {
            offset: 0,
            reason: "slot already closed".to_string(),
        })?;
        file.write_all(chunk).map_err(|err| OtaError::Write {
            offset: 0,
            reason: err.to_string(),
        })
    }

    fn close(&mut self) -> Result<(), OtaError> {
        let file = self
            .file
            .take()
            .ok_or_else(|| OtaError::Close("slot already closed".to_string()))?;
        file.sync_all()
            .map_err(|err| OtaError::Close(err.to_string()))
    }

    fn set_boot(&mut self) -> Result<(), OtaError> {
        let marker = serde_json::json!({ "boot_image": self.image_path });
        let payload =
            serde_json::to_vec_pretty(&marker).map_err(|err| OtaError::SetBoot(err.to_string()))?;
        fs::write(&self.boot_path, payload).map_err(|err| OtaError::SetBoot(err.to_string()))
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
