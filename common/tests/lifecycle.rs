use std::sync::{Arc, Mutex};

use airnode_common::{
    store::KEY_REBOOT_COUNT, CommissioningSignal, CommissioningState, FirmwareStore, Level,
    MemoryStore, NetworkIdentity, NodeAction, NodeConfig, NodeLifecycle, OtaError, OtaEvent,
    OtaHeader, OtaOutcome, OtaPhase, OtaStatus, ResetSource, StackStatus, UpdateSlot,
};
use pretty_assertions::assert_eq;

#[derive(Debug, Default)]
struct Flash {
    image: Vec<u8>,
    boot_selected: bool,
}

#[derive(Clone, Default)]
struct RamFirmware {
    flash: Arc<Mutex<Flash>>,
    fail_close: bool,
}

struct RamSlot {
    flash: Arc<Mutex<Flash>>,
    fail_close: bool,
}

impl FirmwareStore for RamFirmware {
    type Slot = RamSlot;

    fn open_update_slot(&mut self) -> Result<RamSlot, OtaError> {
        self.flash.lock().unwrap().image.clear();
        Ok(RamSlot {
            flash: self.flash.clone(),
            fail_close: self.fail_close,
        })
    }
}

impl UpdateSlot for RamSlot {
    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        self.flash.lock().unwrap().image.extend_from_slice(chunk);
        Ok(())
    }

    fn close(&mut self) -> Result<(), OtaError> {
        if self.fail_close {
            return Err(OtaError::Close("validation failed".to_string()));
        }
        Ok(())
    }

    fn set_boot(&mut self) -> Result<(), OtaError> {
        self.flash.lock().unwrap().boot_selected = true;
        Ok(())
    }
}

type Node = NodeLifecycle<MemoryStore, RamFirmware>;

fn node_with(store: MemoryStore) -> Node {
    NodeLifecycle::new(NodeConfig::default(), store, RamFirmware::default())
}

/// Simulates a crash right after boot: the store survives, everything else is lost.
fn crash_and_reboot(node: Node, now_ms: u64) -> (Node, bool) {
    let store = MemoryStore::from(node.store().values().clone());
    let mut node = node_with(store);
    let pending = node.boot(now_ms);
    (node, pending)
}

fn header(image_size: u32) -> OtaHeader {
    OtaHeader {
        manufacturer_code: 0x1234,
        image_type: 0x0001,
        file_version: 0x0000_0002,
        image_size,
    }
}

#[test]
fn consecutive_unclean_boots_reach_threshold_once() {
    let mut node = node_with(MemoryStore::new());
    assert!(!node.boot(0));
    assert_eq!(node.reboot_count(), 1);

    let (node, pending) = crash_and_reboot(node, 0);
    assert!(!pending);
    assert_eq!(node.reboot_count(), 2);

    let (mut node, pending) = crash_and_reboot(node, 0);
    assert!(pending);
    assert_eq!(node.reboot_count(), 0);
    assert!(node.status().reset_pending());

    assert_eq!(node.tick(2_999), Vec::<NodeAction>::new());
    assert_eq!(node.tick(3_000), vec![NodeAction::FactoryReset]);
    assert_eq!(node.reset_source(), Some(ResetSource::RebootLoop));
    assert_eq!(node.tick(6_000), Vec::<NodeAction>::new());
}

#[test]
fn third_unclean_boot_from_stored_count_of_two() {
    let mut node = node_with(MemoryStore::new().with_value(KEY_REBOOT_COUNT, 2));

    assert!(node.boot(0));
    assert_eq!(node.reboot_count(), 0);
    assert!(node.status().reset_pending());

    // Releasing the button cannot abort the watchdog path.
    node.on_button(Level::Low, 100);
    node.on_button(Level::High, 200);

    assert_eq!(node.tick(3_000), vec![NodeAction::FactoryReset]);
}

#[test]
fn stable_window_clears_previous_count() {
    let mut node = node_with(MemoryStore::new().with_value(KEY_REBOOT_COUNT, 1));
    assert!(!node.boot(1_000));
    assert_eq!(node.reboot_count(), 2);

    assert_eq!(node.tick(3_999), Vec::<NodeAction>::new());
    assert_eq!(node.reboot_count(), 2);

    assert_eq!(node.tick(4_000), Vec::<NodeAction>::new());
    assert_eq!(node.reboot_count(), 0);
    assert!(!node.status().reset_pending());

    // Well-spaced reboots never accumulate.
    let (node, pending) = crash_and_reboot(node, 0);
    assert!(!pending);
    assert_eq!(node.reboot_count(), 1);
}

#[test]
fn short_button_hold_never_resets() {
    let mut node = node_with(MemoryStore::new());
    node.boot(0);
    node.tick(3_000);

    node.on_button(Level::Low, 10_000);
    node.on_button(Level::High, 12_999);

    assert_eq!(node.tick(20_000), Vec::<NodeAction>::new());
    assert_eq!(node.reset_source(), None);
    assert!(!node.status().reset_pending());
}

#[test]
fn long_button_hold_resets_exactly_once() {
    let mut node = node_with(MemoryStore::new());
    node.boot(0);
    node.tick(3_000);

    node.on_button(Level::Low, 10_000);
    assert_eq!(node.tick(12_999), Vec::<NodeAction>::new());
    assert_eq!(node.tick(13_000), vec![NodeAction::FactoryReset]);
    assert_eq!(node.reset_source(), Some(ResetSource::LongPress));

    // Release bounce after the countdown fired is a no-op.
    node.on_button(Level::High, 13_050);
    node.on_button(Level::Low, 13_060);
    node.on_button(Level::High, 13_070);
    assert_eq!(node.tick(30_000), Vec::<NodeAction>::new());
}

#[test]
fn steering_retries_until_join_then_syncs_time() {
    let mut node = node_with(MemoryStore::new());
    node.boot(0);

    assert_eq!(
        node.on_commissioning_signal(
            CommissioningSignal::FirstStart {
                status: StackStatus::OK
            },
            10
        ),
        vec![NodeAction::StartSteering]
    );
    assert!(node.status().steering());

    for attempt in 0..3 {
        let actions = node.on_commissioning_signal(
            CommissioningSignal::SteeringResult {
                status: StackStatus(attempt + 1),
                network: None,
            },
            100,
        );
        assert_eq!(actions, vec![NodeAction::StartSteering]);
    }

    let joined = CommissioningSignal::SteeringResult {
        status: StackStatus::OK,
        network: Some(NetworkIdentity {
            pan_id: 0x4d2e,
            extended_pan_id: [0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3],
        }),
    };
    assert_eq!(
        node.on_commissioning_signal(joined, 5_000),
        vec![NodeAction::ReadLocalTime]
    );
    assert_eq!(node.commissioning_state(), CommissioningState::Joined);
    assert!(!node.status().steering());

    assert_eq!(node.on_commissioning_signal(joined, 6_000), Vec::<NodeAction>::new());

    let interval = node.config().time_sync_interval_ms;
    assert_eq!(node.tick(5_000 + interval), vec![NodeAction::ReadLocalTime]);
}

#[test]
fn ota_scenario_commits_matching_image() {
    let firmware = RamFirmware::default();
    let flash = firmware.flash.clone();
    let mut node = NodeLifecycle::new(NodeConfig::default(), MemoryStore::new(), firmware);
    node.boot(0);

    node.on_ota_event(OtaEvent::new(OtaPhase::Start).with_header(header(1_000)))
        .unwrap();
    for chunk in [600_usize, 400] {
        let payload = vec![0x5a; chunk];
        node.on_ota_event(
            OtaEvent::new(OtaPhase::Receive)
                .with_header(header(1_000))
                .with_payload(&payload),
        )
        .unwrap();
    }

    assert_eq!(
        node.on_ota_event(OtaEvent::new(OtaPhase::Check)),
        Ok(OtaOutcome::Continue)
    );
    let outcome = node
        .on_ota_event(OtaEvent::new(OtaPhase::Finish).with_header(header(1_000)))
        .unwrap();

    assert_eq!(outcome, OtaOutcome::Restart { committed: true });
    assert_eq!(outcome.action(), Some(NodeAction::Restart));
    let flash = flash.lock().unwrap();
    assert_eq!(flash.image.len(), 1_000);
    assert!(flash.boot_selected);
}

#[test]
fn ota_size_mismatch_fails_check_and_keeps_old_image() {
    let firmware = RamFirmware::default();
    let flash = firmware.flash.clone();
    let mut node = NodeLifecycle::new(NodeConfig::default(), MemoryStore::new(), firmware);

    node.on_ota_event(OtaEvent::new(OtaPhase::Start)).unwrap();
    for chunk in [600_usize, 400, 1] {
        let payload = vec![0x5a; chunk];
        node.on_ota_event(
            OtaEvent::new(OtaPhase::Receive)
                .with_header(header(1_000))
                .with_payload(&payload),
        )
        .unwrap();
    }

    assert_eq!(
        node.on_ota_event(OtaEvent::new(OtaPhase::Check)),
        Err(OtaError::SizeMismatch {
            declared: 1_000,
            received: 1_001,
        })
    );
    assert_eq!(node.ota_status(), Some(OtaStatus::Failed));
    assert_eq!(
        node.on_ota_event(OtaEvent::new(OtaPhase::Finish)),
        Ok(OtaOutcome::Restart { committed: false })
    );
    assert!(!flash.lock().unwrap().boot_selected);
}

#[test]
fn ota_finish_restarts_when_close_fails() {
    let firmware = RamFirmware {
        fail_close: true,
        ..RamFirmware::default()
    };
    let mut node = NodeLifecycle::new(NodeConfig::default(), MemoryStore::new(), firmware);

    node.on_ota_event(OtaEvent::new(OtaPhase::Start)).unwrap();
    node.on_ota_event(
        OtaEvent::new(OtaPhase::Receive)
            .with_header(header(4))
            .with_payload(&[1, 2, 3, 4]),
    )
    .unwrap();

    let outcome = node.on_ota_event(OtaEvent::new(OtaPhase::Finish)).unwrap();

    assert_eq!(outcome.action(), Some(NodeAction::Restart));
    assert!(!node.firmware().flash.lock().unwrap().boot_selected);
}
