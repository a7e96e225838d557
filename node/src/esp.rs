use core::{ffi::c_void, num::NonZeroU32, ptr, slice};
use std::{
    sync::{Mutex, OnceLock, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use esp_idf_hal::{
    delay::{TickType, BLOCK},
    gpio::{AnyIOPin, InterruptType, PinDriver, Pull},
    task::notification::Notification,
};
use esp_idf_svc::{
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::EspOta,
    sys::{self, esp, zb, EspError},
};
use log::{error, info, warn};

use airnode_common::{
    attributes::{AttributeType, AttributeWrite},
    config::{BasicInfo, PersistedSettings},
    CommissioningSignal, CounterStore, FirmwareStore, LeaveKind, LedPattern, Level,
    NetworkIdentity, NodeAction, NodeConfig, NodeLifecycle, OtaError, OtaEvent, OtaHeader,
    OtaPhase, StackStatus, StatusSurface, StoreError, UpdateSlot,
};

const NVS_NAMESPACE: &str = "nvs";
const TICK_INTERVAL_MS: u64 = 50;
const STATUS_POLL_MS: u64 = 100;
const MESH_TASK_STACK: usize = 8192;
const MAX_CHILDREN: u8 = 16;
const OTA_HW_VERSION: u16 = 0x0001;
const OTA_MAX_DATA_SIZE: u8 = 0x40;
const COORDINATOR_ADDR: u16 = 0x0000;
const COORDINATOR_ENDPOINT: u8 = 0x01;

type EspNode = NodeLifecycle<NvsStore, PartitionFirmware>;

static NODE: OnceLock<Mutex<EspNode>> = OnceLock::new();

/// Where an action batch runs. Stack callbacks already hold the stack lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Caller {
    StackTask,
    AppTask,
}

pub fn run() -> anyhow::Result<()> {
    sys::link_patches();
    EspLogger::initialize_default();

    let config = NodeConfig::default();
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore::new(nvs_partition).context("failed to open persistent store")?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let mut node = NodeLifecycle::new(config.clone(), store, PartitionFirmware);
    if node.boot(monotonic_ms()) {
        warn!("reboot loop detected, factory reset is pending");
    }
    let status = node.status();
    let settings = node.settings();
    NODE.set(Mutex::new(node))
        .map_err(|_| anyhow!("lifecycle already initialized"))?;

    // Nothing else claims the reset button line.
    let button_pin = unsafe { AnyIOPin::new(config.button_pin) };
    let mut button = PinDriver::input(button_pin)?;
    button.set_pull(Pull::Up)?;
    button.set_interrupt_type(InterruptType::AnyEdge)?;

    let notification = Notification::new();
    let notifier = notification.notifier();
    unsafe {
        button.subscribe(move || {
            notifier.notify_and_yield(NonZeroU32::MIN);
        })?;
    }
    button.enable_interrupt()?;

    spawn_status_renderer(status)?;
    start_mesh_stack(config, settings)?;

    let tick = TickType::from(Duration::from_millis(TICK_INTERVAL_MS)).ticks();
    loop {
        if notification.wait(tick).is_some() {
            if let Err(err) = button.enable_interrupt() {
                warn!("failed to re-arm button interrupt: {err:?}");
            }
            let level = Level::from_high(button.is_high());
            with_node(|node| node.on_button(level, monotonic_ms()));
        }

        let actions = with_node(|node| node.tick(monotonic_ms())).unwrap_or_default();
        execute_node_actions(actions, Caller::AppTask);
    }
}

fn with_node<R>(f: impl FnOnce(&mut EspNode) -> R) -> Option<R> {
    let node = NODE.get()?;
    let mut guard = node.lock().unwrap_or_else(PoisonError::into_inner);
    Some(f(&mut guard))
}

fn monotonic_ms() -> u64 {
    let micros = unsafe { sys::esp_timer_get_time() };
    u64::try_from(micros / 1_000).unwrap_or(0)
}

fn spawn_status_renderer(status: StatusSurface) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("status".to_string())
        .stack_size(4096)
        .spawn(move || {
            let mut last: Option<LedPattern> = None;
            loop {
                let pattern = status.led_pattern();
                if last != Some(pattern) {
                    info!("status LED: {pattern:?}");
                    last = Some(pattern);
                }
                thread::sleep(Duration::from_millis(STATUS_POLL_MS));
            }
        })?;
    Ok(())
}

fn execute_node_actions(actions: Vec<NodeAction>, caller: Caller) {
    for action in actions {
        match action {
            NodeAction::FactoryReset => {
                warn!("factory reset: clearing network credentials");
                with_stack_lock(caller, || unsafe { zb::esp_zb_factory_reset() });
            }
            NodeAction::Restart => unsafe { sys::esp_restart() },
            NodeAction::StartSteering => with_stack_lock(caller, start_steering),
            NodeAction::ReadLocalTime => with_stack_lock(caller, read_local_time),
            NodeAction::SetLedEnabled(enabled) => info!("LED enabled: {enabled}"),
            NodeAction::SetLedBrightness(level) => info!("LED brightness: {level}"),
            NodeAction::SetFanMode(mode) => info!("fan mode: {}", mode.as_str()),
        }
    }
}

fn with_stack_lock(caller: Caller, f: impl FnOnce()) {
    if caller == Caller::StackTask {
        f();
        return;
    }

    if !unsafe { zb::esp_zb_lock_acquire(BLOCK) } {
        error!("failed to acquire mesh stack lock");
        return;
    }
    f();
    unsafe { zb::esp_zb_lock_release() };
}

fn start_steering() {
    let rc = unsafe {
        zb::esp_zb_bdb_start_top_level_commissioning(
            zb::esp_zb_bdb_commissioning_mode_mask_t_ESP_ZB_BDB_MODE_NETWORK_STEERING as u8,
        )
    };
    if let Err(err) = esp!(rc) {
        warn!("failed to start network steering: {err}");
    }
}

fn read_local_time() {
    let mut attribute = zb::esp_zb_zcl_attr_time_t_ESP_ZB_ZCL_ATTR_TIME_LOCAL_TIME_ID as u16;

    unsafe {
        let mut request: zb::esp_zb_zcl_read_attr_cmd_t = core::mem::zeroed();
        request.zcl_basic_cmd.dst_addr_u.addr_short = COORDINATOR_ADDR;
        request.zcl_basic_cmd.dst_endpoint = COORDINATOR_ENDPOINT;
        request.zcl_basic_cmd.src_endpoint = with_node(|node| node.config().endpoint)
            .unwrap_or(airnode_common::config::DEFAULT_ENDPOINT);
        request.address_mode =
            zb::esp_zb_aps_address_mode_t_ESP_ZB_APS_ADDR_MODE_16_ENDP_PRESENT as _;
        request.clusterID = zb::esp_zb_zcl_cluster_id_t_ESP_ZB_ZCL_CLUSTER_ID_TIME as u16;
        request.attr_number = 1;
        request.attr_field = &mut attribute;

        zb::esp_zb_zcl_read_attr_cmd_req(&mut request);
    }
}

fn start_mesh_stack(config: NodeConfig, settings: PersistedSettings) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("zigbee".to_string())
        .stack_size(MESH_TASK_STACK)
        .spawn(move || unsafe {
            init_mesh_stack(&config, settings);
            zb::esp_zb_stack_main_loop();
        })?;
    Ok(())
}

/// Basic cluster values. The stack keeps pointers to them for the program lifetime.
struct BasicAttributes {
    zcl_version: u8,
    application_version: u8,
    power_source: u8,
    manufacturer_name: Vec<u8>,
    model_identifier: Vec<u8>,
    sw_build: Vec<u8>,
}

impl BasicAttributes {
    fn new(basic: &BasicInfo) -> Self {
        Self {
            zcl_version: basic.zcl_version,
            application_version: basic.application_version,
            power_source: basic.power_source,
            manufacturer_name: BasicInfo::zcl_string(&basic.manufacturer_name),
            model_identifier: BasicInfo::zcl_string(&basic.model_identifier),
            sw_build: BasicInfo::zcl_string(&basic.sw_build),
        }
    }
}

unsafe fn init_mesh_stack(config: &NodeConfig, settings: PersistedSettings) {
    let mut platform: zb::esp_zb_platform_config_t = core::mem::zeroed();
    platform.radio_config.radio_mode = zb::esp_zb_radio_mode_t_ZB_RADIO_MODE_NATIVE;
    platform.host_config.host_connection_mode =
        zb::esp_zb_host_connection_mode_t_ZB_HOST_CONNECTION_MODE_NONE;
    if let Err(err) = esp!(zb::esp_zb_platform_config(&mut platform)) {
        error!("mesh platform config failed: {err}");
    }

    let mut stack: zb::esp_zb_cfg_t = core::mem::zeroed();
    stack.esp_zb_role = zb::esp_zb_nwk_device_type_t_ESP_ZB_DEVICE_TYPE_ROUTER;
    stack.install_code_policy = false;
    stack.nwk_cfg.zczr_cfg.max_children = MAX_CHILDREN;
    zb::esp_zb_init(&mut stack);

    let basic = Box::leak(Box::new(BasicAttributes::new(&config.basic)));
    let basic_cluster =
        zb::esp_zb_zcl_attr_list_create(zb::esp_zb_zcl_cluster_id_t_ESP_ZB_ZCL_CLUSTER_ID_BASIC as u16);
    for (attribute, value) in [
        (
            zb::esp_zb_zcl_basic_attr_t_ESP_ZB_ZCL_ATTR_BASIC_ZCL_VERSION_ID,
            ptr::addr_of_mut!(basic.zcl_version).cast::<c_void>(),
        ),
        (
            zb::esp_zb_zcl_basic_attr_t_ESP_ZB_ZCL_ATTR_BASIC_APPLICATION_VERSION_ID,
            ptr::addr_of_mut!(basic.application_version).cast(),
        ),
        (
            zb::esp_zb_zcl_basic_attr_t_ESP_ZB_ZCL_ATTR_BASIC_POWER_SOURCE_ID,
            ptr::addr_of_mut!(basic.power_source).cast(),
        ),
        (
            zb::esp_zb_zcl_basic_attr_t_ESP_ZB_ZCL_ATTR_BASIC_MANUFACTURER_NAME_ID,
            basic.manufacturer_name.as_mut_ptr().cast(),
        ),
        (
            zb::esp_zb_zcl_basic_attr_t_ESP_ZB_ZCL_ATTR_BASIC_MODEL_IDENTIFIER_ID,
            basic.model_identifier.as_mut_ptr().cast(),
        ),
        (
            zb::esp_zb_zcl_basic_attr_t_ESP_ZB_ZCL_ATTR_BASIC_SW_BUILD_ID,
            basic.sw_build.as_mut_ptr().cast(),
        ),
    ] {
        zb::esp_zb_basic_cluster_add_attr(basic_cluster, attribute as u16, value);
    }

    let time_cluster =
        zb::esp_zb_zcl_attr_list_create(zb::esp_zb_zcl_cluster_id_t_ESP_ZB_ZCL_CLUSTER_ID_TIME as u16);

    let mut ota_cfg: zb::esp_zb_ota_cluster_cfg_t = core::mem::zeroed();
    ota_cfg.ota_upgrade_manufacturer = config.ota.manufacturer_code;
    ota_cfg.ota_upgrade_image_type = config.ota.image_type;
    ota_cfg.ota_upgrade_downloaded_file_ver = config.ota.file_version;
    let ota_cluster = zb::esp_zb_ota_cluster_create(&mut ota_cfg);

    let ota_client = Box::leak(Box::new(zb::esp_zb_zcl_ota_upgrade_client_variable_t {
        timer_query: zb::ESP_ZB_ZCL_OTA_UPGRADE_QUERY_TIMER_COUNT_DEF as u16,
        hw_version: OTA_HW_VERSION,
        max_data_size: OTA_MAX_DATA_SIZE,
    }));
    zb::esp_zb_ota_cluster_add_attr(
        ota_cluster,
        zb::esp_zb_zcl_ota_upgrade_attr_t_ESP_ZB_ZCL_ATTR_OTA_UPGRADE_CLIENT_DATA_ID as u16,
        ptr::from_mut(ota_client).cast(),
    );

    let mut on_off_cfg: zb::esp_zb_on_off_cluster_cfg_t = core::mem::zeroed();
    on_off_cfg.on_off = settings.led_enabled;
    let mut level_cfg: zb::esp_zb_level_cluster_cfg_t = core::mem::zeroed();
    level_cfg.current_level = settings.led_brightness;
    let mut fan_cfg: zb::esp_zb_fan_control_cluster_cfg_t = core::mem::zeroed();
    fan_cfg.fan_mode = settings.fan_mode.as_u8();

    let server = zb::esp_zb_zcl_cluster_role_t_ESP_ZB_ZCL_CLUSTER_SERVER_ROLE as u8;
    let client = zb::esp_zb_zcl_cluster_role_t_ESP_ZB_ZCL_CLUSTER_CLIENT_ROLE as u8;

    let clusters = zb::esp_zb_zcl_cluster_list_create();
    zb::esp_zb_cluster_list_add_basic_cluster(clusters, basic_cluster, server);
    zb::esp_zb_cluster_list_add_time_cluster(clusters, time_cluster, client);
    zb::esp_zb_cluster_list_add_ota_cluster(clusters, ota_cluster, client);
    zb::esp_zb_cluster_list_add_on_off_cluster(
        clusters,
        zb::esp_zb_on_off_cluster_create(&mut on_off_cfg),
        server,
    );
    zb::esp_zb_cluster_list_add_level_cluster(
        clusters,
        zb::esp_zb_level_cluster_create(&mut level_cfg),
        server,
    );
    zb::esp_zb_cluster_list_add_fan_control_cluster(
        clusters,
        zb::esp_zb_fan_control_cluster_create(&mut fan_cfg),
        server,
    );

    let endpoints = zb::esp_zb_ep_list_create();
    zb::esp_zb_ep_list_add_ep(
        endpoints,
        clusters,
        zb::esp_zb_endpoint_config_t {
            endpoint: config.endpoint,
            app_profile_id: zb::esp_zb_af_profile_id_t_ESP_ZB_AF_HA_PROFILE_ID as u16,
            app_device_id: zb::esp_zb_ha_standard_devices_t_ESP_ZB_HA_SIMPLE_SENSOR_DEVICE_ID as u16,
            app_device_version: 0,
        },
    );
    zb::esp_zb_device_register(endpoints);

    zb::esp_zb_set_primary_network_channel_set(zb::ESP_ZB_TRANSCEIVER_ALL_CHANNELS_MASK);
    zb::esp_zb_core_action_handler_register(Some(action_handler));

    if let Err(err) = esp!(zb::esp_zb_start(true)) {
        error!("mesh stack start failed: {err}");
    }
}

/// Invoked by the mesh stack on its own task for every commissioning signal.
#[no_mangle]
pub unsafe extern "C" fn esp_zb_app_signal_handler(signal: *mut zb::esp_zb_app_signal_t) {
    let Some(signal) = signal.as_ref() else {
        return;
    };
    if signal.p_app_signal.is_null() {
        return;
    }

    let kind = *signal.p_app_signal;
    let status = StackStatus(signal.esp_err_status);

    let signal = match kind {
        zb::esp_zb_app_signal_type_t_ESP_ZB_BDB_SIGNAL_DEVICE_FIRST_START => {
            CommissioningSignal::FirstStart { status }
        }
        zb::esp_zb_app_signal_type_t_ESP_ZB_BDB_SIGNAL_DEVICE_REBOOT => {
            CommissioningSignal::Reboot { status }
        }
        zb::esp_zb_app_signal_type_t_ESP_ZB_BDB_SIGNAL_STEERING => {
            CommissioningSignal::SteeringResult {
                status,
                network: status.is_ok().then(|| current_network()),
            }
        }
        zb::esp_zb_app_signal_type_t_ESP_ZB_ZDO_SIGNAL_LEAVE => {
            let params = zb::esp_zb_app_signal_get_params(signal.p_app_signal)
                .cast::<zb::esp_zb_zdo_signal_leave_params_t>();
            let kind = match params.as_ref() {
                Some(params)
                    if u32::from(params.leave_type)
                        == zb::esp_zb_nwk_leave_type_t_ESP_ZB_NWK_LEAVE_TYPE_RESET =>
                {
                    LeaveKind::Reset
                }
                _ => LeaveKind::Rejoin,
            };
            CommissioningSignal::Leave { kind }
        }
        other => CommissioningSignal::Other { id: other, status },
    };

    let actions =
        with_node(|node| node.on_commissioning_signal(signal, monotonic_ms())).unwrap_or_default();
    execute_node_actions(actions, Caller::StackTask);
}

unsafe fn current_network() -> NetworkIdentity {
    let mut extended_pan_id = [0_u8; 8];
    zb::esp_zb_get_extended_pan_id(extended_pan_id.as_mut_ptr());
    NetworkIdentity {
        pan_id: zb::esp_zb_get_pan_id(),
        extended_pan_id,
    }
}

unsafe extern "C" fn action_handler(
    callback: zb::esp_zb_core_action_callback_id_t,
    message: *const c_void,
) -> zb::esp_err_t {
    if message.is_null() {
        return sys::ESP_FAIL;
    }

    match callback {
        zb::esp_zb_core_action_callback_id_s_ESP_ZB_CORE_SET_ATTR_VALUE_CB_ID => {
            attribute_handler(&*message.cast::<zb::esp_zb_zcl_set_attr_value_message_t>())
        }
        zb::esp_zb_core_action_callback_id_s_ESP_ZB_CORE_OTA_UPGRADE_VALUE_CB_ID => {
            ota_handler(&*message.cast::<zb::esp_zb_zcl_ota_upgrade_value_message_t>())
        }
        zb::esp_zb_core_action_callback_id_s_ESP_ZB_CORE_CMD_DEFAULT_RESP_CB_ID => sys::ESP_OK,
        other => {
            warn!("mesh action 0x{other:04x} callback received");
            sys::ESP_OK
        }
    }
}

unsafe fn attribute_handler(message: &zb::esp_zb_zcl_set_attr_value_message_t) -> zb::esp_err_t {
    let data = &message.attribute.data;
    let value = data.value.cast::<u8>().as_ref().copied();

    let write = AttributeWrite {
        endpoint: message.info.dst_endpoint,
        status: StackStatus(message.info.status as i32),
        cluster: message.info.cluster,
        attribute: message.attribute.id,
        kind: AttributeType::from_id(data.type_ as u8),
        value,
    };

    match with_node(|node| node.on_attribute_write(write)) {
        Some(Ok(action)) => {
            execute_node_actions(action.into_iter().collect(), Caller::StackTask);
            sys::ESP_OK
        }
        _ => sys::ESP_FAIL,
    }
}

unsafe fn ota_handler(message: &zb::esp_zb_zcl_ota_upgrade_value_message_t) -> zb::esp_err_t {
    let Some(endpoint) = with_node(|node| node.config().endpoint) else {
        return sys::ESP_FAIL;
    };
    if message.info.dst_endpoint != endpoint {
        return sys::ESP_FAIL;
    }

    let phase = match message.upgrade_status {
        zb::esp_zb_zcl_ota_upgrade_status_t_ESP_ZB_ZCL_OTA_UPGRADE_STATUS_START => OtaPhase::Start,
        zb::esp_zb_zcl_ota_upgrade_status_t_ESP_ZB_ZCL_OTA_UPGRADE_STATUS_RECEIVE => {
            OtaPhase::Receive
        }
        zb::esp_zb_zcl_ota_upgrade_status_t_ESP_ZB_ZCL_OTA_UPGRADE_STATUS_APPLY => OtaPhase::Apply,
        zb::esp_zb_zcl_ota_upgrade_status_t_ESP_ZB_ZCL_OTA_UPGRADE_STATUS_CHECK => OtaPhase::Check,
        zb::esp_zb_zcl_ota_upgrade_status_t_ESP_ZB_ZCL_OTA_UPGRADE_STATUS_FINISH => {
            OtaPhase::Finish
        }
        other => OtaPhase::Other(other as u16),
    };

    let payload = if message.payload.is_null() || message.payload_size == 0 {
        &[][..]
    } else {
        slice::from_raw_parts(message.payload, usize::from(message.payload_size))
    };

    let header = &message.ota_header;
    let event = OtaEvent::new(phase)
        .with_status(StackStatus(message.info.status as i32))
        .with_header(OtaHeader {
            manufacturer_code: header.manufacturer_code,
            image_type: header.image_type,
            file_version: header.file_version,
            image_size: header.image_size,
        })
        .with_payload(payload);

    match with_node(|node| node.on_ota_event(event)) {
        Some(Ok(outcome)) => {
            execute_node_actions(outcome.action().into_iter().collect(), Caller::StackTask);
            sys::ESP_OK
        }
        Some(Err(err)) => {
            warn!("OTA event rejected: {err}");
            sys::ESP_FAIL
        }
        None => sys::ESP_FAIL,
    }
}

struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    fn new(partition: EspDefaultNvsPartition) -> Result<Self, EspError> {
        Ok(Self {
            nvs: EspNvs::new(partition, NVS_NAMESPACE, true)?,
        })
    }
}

impl CounterStore for NvsStore {
    fn read_u8(&self, key: &str) -> Result<Option<u8>, StoreError> {
        self.nvs
            .get_u8(key)
            .map_err(|err| StoreError::read(key, format!("{err:?}")))
    }

    fn write_u8(&mut self, key: &str, value: u8) -> Result<(), StoreError> {
        self.nvs
            .set_u8(key, value)
            .map_err(|err| StoreError::write(key, format!("{err:?}")))
    }
}

/// Inactive application partition as selected by the bootloader's OTA data.
struct PartitionFirmware;

struct PartitionSlot {
    partition: *const sys::esp_partition_t,
    handle: sys::esp_ota_handle_t,
    /// `esp_ota_end` releases the handle whether or not it succeeds.
    ended: bool,
}

// The partition pointer refers to the static partition table.
unsafe impl Send for PartitionSlot {}

impl FirmwareStore for PartitionFirmware {
    type Slot = PartitionSlot;

    fn open_update_slot(&mut self) -> Result<PartitionSlot, OtaError> {
        let partition = unsafe { sys::esp_ota_get_next_update_partition(ptr::null()) };
        if partition.is_null() {
            return Err(OtaError::Open("no update partition".to_string()));
        }

        let mut handle: sys::esp_ota_handle_t = 0;
        esp!(unsafe {
            sys::esp_ota_begin(partition, sys::OTA_WITH_SEQUENTIAL_WRITES as usize, &mut handle)
        })
        .map_err(|err| OtaError::Open(err.to_string()))?;

        Ok(PartitionSlot {
            partition,
            handle,
            ended: false,
        })
    }
}

impl UpdateSlot for PartitionSlot {
    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        esp!(unsafe { sys::esp_ota_write(self.handle, chunk.as_ptr().cast(), chunk.len()) })
            .map_err(|err| OtaError::Write {
                offset: 0,
                reason: err.to_string(),
            })
    }

    fn close(&mut self) -> Result<(), OtaError> {
        if self.ended {
            return Err(OtaError::Close("slot already closed".to_string()));
        }
        self.ended = true;
        esp!(unsafe { sys::esp_ota_end(self.handle) })
            .map_err(|err| OtaError::Close(err.to_string()))
    }

    fn set_boot(&mut self) -> Result<(), OtaError> {
        esp!(unsafe { sys::esp_ota_set_boot_partition(self.partition) })
            .map_err(|err| OtaError::SetBoot(err.to_string()))
    }
}

impl Drop for PartitionSlot {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        if let Err(err) = esp!(unsafe { sys::esp_ota_abort(self.handle) }) {
            warn!("failed to abort abandoned OTA update: {err}");
        }
    }
}
