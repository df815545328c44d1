use std::cell::Cell;
use std::rc::Rc;

use crate::servo::error::BusError;
use crate::servo::network::Network;
use crate::servo::protocol::port_handler::SimPort;
use crate::servo::protocol::registers::Register;
use crate::servo::protocol::servo_def::{ErrorFlags, INST_SYNC_WRITE, PKT_INSTRUCTION, PKT_PARAMETER0};
use crate::servo::sim::ServoBusSim;

fn network_with(ids: impl IntoIterator<Item = u8>) -> Network<SimPort> {
    let mut network = Network::from_port(SimPort::new(ServoBusSim::with_servos(ids)));
    network.scan(0, 20).expect("scan");
    network
}

fn frames(network: &Network<SimPort>) -> usize {
    network.handler().port().written().len()
}

fn sync_frames_since(network: &Network<SimPort>, start: usize) -> Vec<Vec<u8>> {
    network.handler().port().written()[start..]
        .iter()
        .filter(|frame| frame[PKT_INSTRUCTION] == INST_SYNC_WRITE)
        .cloned()
        .collect()
}

fn sim(network: &Network<SimPort>) -> &ServoBusSim {
    network.handler().port().sim()
}

#[test]
fn scan_is_ascending_with_gaps() {
    let mut network = Network::from_port(SimPort::new(ServoBusSim::with_servos([12, 3, 40])));
    assert_eq!(network.scan(0, 50).expect("scan"), vec![3, 12, 40]);
    assert_eq!(network.addresses(), vec![3, 12, 40]);

    assert_eq!(network.scan(4, 39).expect("rescan"), vec![12]);
    assert_eq!(network.addresses(), vec![12]);
}

#[test]
fn scan_rejects_inverted_range() {
    let mut network = Network::from_port(SimPort::new(ServoBusSim::with_servos([1])));
    assert!(matches!(network.scan(10, 2), Err(BusError::AddressOutOfRange(10))));
}

#[test]
fn cached_register_is_served_without_bus_traffic() {
    let mut network = network_with([1]);
    let mut servo = network.servo(1).expect("servo 1");
    assert_eq!(servo.return_delay_time().expect("first read"), 250);
    drop(servo);

    let before = frames(&network);
    let reads = network.handler().port().read_calls();
    let mut servo = network.servo(1).expect("servo 1");
    assert_eq!(servo.return_delay_time().expect("cached read"), 250);
    servo.set_return_delay_time(250).expect("same value");
    assert_eq!(frames(&network), before);
    assert_eq!(network.handler().port().read_calls(), reads);

    let mut servo = network.servo(1).expect("servo 1");
    servo.set_return_delay_time(10).expect("new value");
    assert_eq!(servo.return_delay_time().expect("cached read"), 10);
    assert_eq!(frames(&network), before + 1);
    assert_eq!(sim(&network).register(1, Register::ReturnDelayTime), Some(10));
}

#[test]
fn volatile_reads_always_hit_the_bus() {
    let mut network = network_with([1]);
    let before = frames(&network);

    let mut servo = network.servo(1).expect("servo 1");
    assert_eq!(servo.present_position().expect("first"), 512);
    assert_eq!(servo.present_position().expect("second"), 512);
    assert_eq!(frames(&network), before + 2);

    network
        .handler_mut()
        .port_mut()
        .sim_mut()
        .set_register(1, Register::PresentPosition, 600);
    let mut servo = network.servo(1).expect("servo 1");
    assert_eq!(servo.present_position().expect("third"), 600);
    assert!(servo.device().cached(Register::PresentPosition).is_none());
}

#[test]
fn synchronize_batches_dirty_servos() {
    let mut network = network_with([1, 2, 3]);
    let before = frames(&network);

    network.servo(1).expect("servo 1").set_goal_position(700).expect("goal 1");
    network.servo(3).expect("servo 3").set_goal_position(100).expect("goal 3");
    assert_eq!(frames(&network), before);

    assert_eq!(network.synchronize().expect("sync"), 2);
    let sync = sync_frames_since(&network, before);
    assert_eq!(sync.len(), 1);
    assert_eq!(frames(&network), before + 1);
    assert_eq!(
        &sync[0][PKT_PARAMETER0..sync[0].len() - 1],
        &[30, 4, 1, 0xBC, 0x02, 0, 0, 3, 100, 0, 0, 0]
    );

    assert!(network.devices().all(|device| !device.is_dirty()));
    assert_eq!(sim(&network).register(1, Register::GoalPosition), Some(700));
    assert_eq!(sim(&network).register(2, Register::GoalPosition), Some(512));
    assert_eq!(sim(&network).register(3, Register::GoalPosition), Some(100));

    assert_eq!(network.synchronize().expect("idle sync"), 0);
    assert_eq!(frames(&network), before + 1);
}

#[test]
fn stop_holds_position_until_resumed() {
    let mut network = network_with([1, 2]);
    network
        .handler_mut()
        .port_mut()
        .sim_mut()
        .set_register(2, Register::PresentPosition, 400);
    let before = frames(&network);

    network.set_stopped(true).expect("stop");
    assert!(network.is_stopped());
    assert_eq!(sync_frames_since(&network, before).len(), 1);
    assert_eq!(sim(&network).register(2, Register::GoalPosition), Some(400));
    assert_eq!(sim(&network).register(2, Register::MovingSpeed), Some(1));
    assert_eq!(sim(&network).register(1, Register::MovingSpeed), Some(1));

    let stopped_at = frames(&network);
    network.servo(1).expect("servo 1").set_goal_position(900).expect("goal");
    assert_eq!(network.synchronize().expect("sync while stopped"), 0);
    assert_eq!(frames(&network), stopped_at);
    assert!(!network.device(1).expect("servo 1").is_dirty());
    assert_eq!(sim(&network).register(1, Register::GoalPosition), Some(512));

    network.set_stopped(false).expect("resume");
    network.servo(1).expect("servo 1").set_goal_position(900).expect("goal");
    assert_eq!(network.synchronize().expect("sync"), 1);
    assert_eq!(sim(&network).register(1, Register::GoalPosition), Some(900));
}

#[test]
fn rename_collision_leaves_both_servos() {
    let mut network = network_with([1, 2]);
    let before = frames(&network);

    assert!(matches!(network.set_address(1, 2), Err(BusError::AddressCollision(2))));
    assert_eq!(network.addresses(), vec![1, 2]);
    assert_eq!(frames(&network), before);
    assert_eq!(sim(&network).ids(), vec![1, 2]);
}

#[test]
fn rename_moves_servo_and_cache() {
    let mut network = network_with([1, 2]);
    network.set_address(1, 7).expect("rename");

    assert_eq!(network.addresses(), vec![2, 7]);
    assert_eq!(sim(&network).ids(), vec![2, 7]);
    let device = network.device(7).expect("servo 7");
    assert_eq!(device.address(), 7);
    assert_eq!(device.cached(Register::Id), Some(7));

    assert_eq!(network.servo(7).expect("servo 7").model_number().expect("model"), 12);
}

#[test]
fn failed_rename_is_rolled_back() {
    let mut network = network_with([1]);
    network.handler_mut().port_mut().sim_mut().remove_servo(1);

    assert!(network.set_address(1, 5).unwrap_err().is_timeout());
    assert_eq!(network.addresses(), vec![1]);
}

#[test]
fn error_observer_is_not_reentered() {
    let mut network = network_with([2]);
    let calls = Rc::new(Cell::new(0));
    let seen = Rc::clone(&calls);
    network.set_error_observer(move |handler, address, flags| {
        seen.set(seen.get() + 1);
        assert_eq!(flags, ErrorFlags::OVERLOAD);
        assert!(handler.ping(address).expect("ping from observer").is_present());
    });
    network
        .handler_mut()
        .port_mut()
        .sim_mut()
        .set_error(2, ErrorFlags::OVERLOAD);

    let voltage = network.servo(2).expect("servo 2").present_voltage().expect("voltage");
    assert_eq!(voltage, 120);
    assert_eq!(calls.get(), 1);
    assert_eq!(network.diagnostics().device_errors, 2);

    network.servo(2).expect("servo 2").present_voltage().expect("voltage");
    assert_eq!(calls.get(), 2);
}

#[test]
fn noise_before_reply_is_skipped() {
    let mut network = network_with([1]);
    // garbage, then a complete status packet from a servo nobody asked
    network
        .handler_mut()
        .port_mut()
        .inject(&[0x00, 0xFF, 0x13, 0xFF, 0xFF, 9, 2, 0, 0xF4]);

    let model = network.servo(1).expect("servo 1").model_number().expect("model");
    assert_eq!(model, 12);
    let diagnostics = network.diagnostics();
    assert_eq!(diagnostics.framing_errors, 2);
    assert!(diagnostics.discarded_packets >= 3);
}

#[test]
fn deferred_writes_wait_for_flush() {
    let mut network = network_with([1, 2]);
    network.servo(1).expect("servo 1").write_deferred(Register::Led, 1).expect("led 1");
    network.servo(2).expect("servo 2").write_deferred(Register::Led, 1).expect("led 2");
    assert_eq!(sim(&network).register(1, Register::Led), Some(0));
    assert_eq!(sim(&network).register(1, Register::RegisteredInstruction), Some(1));

    network.flush_deferred().expect("action");
    assert_eq!(sim(&network).register(1, Register::Led), Some(1));
    assert_eq!(sim(&network).register(2, Register::Led), Some(1));
    assert_eq!(sim(&network).register(2, Register::RegisteredInstruction), Some(0));
    assert_eq!(network.handler().port().pending_rx(), 0);
}

#[test]
fn span_read_keeps_motion_cache() {
    let mut network = network_with([1]);
    network
        .handler_mut()
        .port_mut()
        .sim_mut()
        .set_register(1, Register::GoalPosition, 100);

    let mut servo = network.servo(1).expect("servo 1");
    let values = servo
        .read_span(Register::ModelNumber, Register::Punch)
        .expect("dump");
    assert_eq!(values.len(), 34);
    assert!(values.contains(&(Register::GoalPosition, 100)));
    assert!(values.contains(&(Register::PresentVoltage, 120)));
    assert_eq!(servo.goal_position(), 512);
    assert_eq!(servo.device().cached(Register::MaxTorque), Some(1023));
    assert!(servo.device().cached(Register::PresentVoltage).is_none());
}

#[test]
fn broadcast_updates_every_cache() {
    let mut network = network_with([1, 2, 3]);
    let before = frames(&network);

    network.broadcast_register(Register::Led, 1).expect("broadcast");
    assert_eq!(frames(&network), before + 1);
    assert_eq!(network.handler().port().written()[before][2], 0xFE);
    for id in [1, 2, 3] {
        assert_eq!(sim(&network).register(id, Register::Led), Some(1));
        assert!(network.servo(id).expect("servo").led().expect("led"));
    }
    assert_eq!(frames(&network), before + 1);

    assert!(matches!(
        network.broadcast_register(Register::PresentLoad, 1),
        Err(BusError::ReadOnlyRegister(Register::PresentLoad))
    ));
    assert!(matches!(network.broadcast_register(Register::Id, 1), Err(BusError::IdRegister)));
    assert_eq!(frames(&network), before + 1);
}

#[test]
fn reset_device_drops_it_until_rescan() {
    let mut network = network_with([5]);
    network.servo(5).expect("servo 5").set_led(true).expect("led");

    network.reset_device(5).expect("reset");
    assert!(network.is_empty());
    assert_eq!(sim(&network).ids(), vec![1]);
    assert!(matches!(network.reset_device(5), Err(BusError::UnknownDevice(5))));

    assert_eq!(network.scan(0, 10).expect("rescan"), vec![1]);
    assert!(!network.servo(1).expect("servo 1").led().expect("led"));
}

#[test]
fn silenced_servo_still_answers_pings() {
    let mut network = network_with([1]);
    network
        .servo(1)
        .expect("servo 1")
        .set_status_return_level(0)
        .expect("acknowledged before it takes effect");

    assert!(network.handler_mut().ping(1).expect("ping").is_present());
    let err = network.servo(1).expect("servo 1").set_led(true).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(sim(&network).register(1, Register::Led), Some(1));
}

#[test]
fn failed_restop_keeps_bus_stopped() {
    let mut network = network_with([1, 2]);
    network.set_stopped(true).expect("stop");
    network.handler_mut().port_mut().sim_mut().remove_servo(2);

    assert!(network.set_stopped(true).unwrap_err().is_timeout());
    assert!(network.is_stopped());

    network.servo(1).expect("servo 1").set_goal_position(900).expect("goal");
    assert_eq!(network.synchronize().expect("sync while stopped"), 0);
    assert_eq!(sim(&network).register(1, Register::GoalPosition), Some(512));
}

#[test]
fn failed_stop_leaves_bus_running() {
    let mut network = network_with([1, 2]);
    network.handler_mut().port_mut().sim_mut().remove_servo(2);

    assert!(network.set_stopped(true).is_err());
    assert!(!network.is_stopped());
}

#[test]
fn oversized_batch_keeps_servos_dirty() {
    let mut network = Network::from_port(SimPort::new(ServoBusSim::with_servos(0..60)));
    assert_eq!(network.scan(0, 59).expect("scan").len(), 60);
    for id in 0..60 {
        network.servo(id).expect("servo").set_goal_position(100).expect("goal");
    }
    let before = frames(&network);

    assert!(matches!(network.synchronize(), Err(BusError::PacketTooLong(_))));
    assert_eq!(frames(&network), before);
    assert!(network.devices().all(|device| device.is_dirty()));
    assert_eq!(sim(&network).register(0, Register::GoalPosition), Some(512));

    // ten servos leave the batch and send their goal directly
    for id in 50..60 {
        network.servo(id).expect("servo").set_synchronized(false).expect("sync off");
    }
    assert_eq!(network.synchronize().expect("sync"), 50);
    assert!(network.devices().all(|device| !device.is_dirty()));
    assert_eq!(sim(&network).register(0, Register::GoalPosition), Some(100));
    assert_eq!(sim(&network).register(59, Register::GoalPosition), Some(100));
}

#[test]
fn volatile_writes_always_go_out() {
    let mut network = network_with([1]);
    let before = frames(&network);

    let mut servo = network.servo(1).expect("servo 1");
    servo.set_torque_enable(true).expect("first");
    servo.set_torque_enable(true).expect("second");
    assert!(servo.device().cached(Register::TorqueEnable).is_none());
    assert_eq!(frames(&network), before + 2);
    assert_eq!(sim(&network).register(1, Register::TorqueEnable), Some(1));
}

#[test]
fn scan_covers_both_ends_of_the_address_range() {
    let mut network = Network::from_port(SimPort::new(ServoBusSim::with_servos([0, 253])));
    assert_eq!(network.handler_mut().scan_addresses(0, 253).expect("scan"), vec![0, 253]);
    assert_eq!(network.scan(0, 253).expect("network scan"), vec![0, 253]);
    assert!(matches!(
        network.handler_mut().scan_addresses(0, 254),
        Err(BusError::AddressOutOfRange(254))
    ));
}
