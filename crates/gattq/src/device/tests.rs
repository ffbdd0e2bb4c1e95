//! Engine tests against a scripted mock transport.
//!
//! The mock records every initiation it sees and, unless switched to manual
//! mode, immediately queues the matching completion event back into the
//! worker. Tests observe outcomes through channel-backed callbacks.

use crate::addr::BdAddr;
use crate::device::task::{NotifyCallback, Target};
use crate::device::{ConnectionCallback, ConnectionState, Peripheral};
use crate::error::GattError;
use crate::gatt::constants::{ATT_DEFAULT_MTU, BUSY_RETRY_LIMIT};
use crate::gatt::types::{Characteristic, CharacteristicProperties, Descriptor, Service, Uuid};
use crate::sched::Scheduler;
use crate::transport::{
    AlwaysPowered, EventSender, GattStatus, GattTransport, Initiation, LinkHandle, Phy,
    TransportEvent, WriteMode,
};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn recv<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(TIMEOUT).expect("timed out waiting for event")
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn addr() -> BdAddr {
    "00:11:22:33:44:55".parse().unwrap()
}

fn svc_uuid() -> Uuid {
    Uuid::from_u16(0x180f)
}

fn chr_uuid() -> Uuid {
    Uuid::from_u16(0x2a19)
}

/// Write-only characteristic without CCCD
fn wr_uuid() -> Uuid {
    Uuid::from_u16(0x2a20)
}

fn table(value_handle: u16) -> Vec<Service> {
    vec![Service {
        uuid: svc_uuid(),
        is_primary: true,
        start_handle: 0x0001,
        end_handle: 0x0010,
        characteristics: vec![
            Characteristic {
                uuid: chr_uuid(),
                declaration_handle: value_handle - 1,
                value_handle,
                properties: CharacteristicProperties::READ
                    | CharacteristicProperties::WRITE
                    | CharacteristicProperties::WRITE_WITHOUT_RESPONSE
                    | CharacteristicProperties::NOTIFY,
                descriptors: vec![Descriptor {
                    uuid: Uuid::from_u16(0x2902),
                    handle: value_handle + 1,
                }],
            },
            Characteristic {
                uuid: wr_uuid(),
                declaration_handle: 0x0008,
                value_handle: 0x0009,
                properties: CharacteristicProperties::WRITE,
                descriptors: Vec::new(),
            },
        ],
    }]
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    OpenLink,
    Close,
    Discover,
    ReadChara(u16),
    WriteChara(u16, Vec<u8>, WriteMode),
    ReadDesc(u16),
    WriteDesc(u16, Vec<u8>),
    SetNotify(Uuid, bool),
    RequestMtu(u16),
    SetPhy,
    ReadPhy,
    ReadRssi,
}

struct MockInner {
    events: Option<EventSender>,
    calls: Vec<Call>,
    services: Vec<Service>,
    discovery_status: GattStatus,
    open_fails: bool,
    /// Reject the next N initiations with Busy
    busy_remaining: u32,
    busy_always: bool,
    /// Deliver completion events from inside the initiation call
    auto_complete: bool,
    read_status: GattStatus,
    read_value: Vec<u8>,
    /// Per-write completion statuses, defaulting to success
    write_statuses: VecDeque<GattStatus>,
    descriptor_status: GattStatus,
    mtu_status: GattStatus,
    notify_accepts: bool,
}

struct MockTransport {
    inner: Mutex<MockInner>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(MockTransport {
            inner: Mutex::new(MockInner {
                events: None,
                calls: Vec::new(),
                services: table(0x0003),
                discovery_status: GattStatus::SUCCESS,
                open_fails: false,
                busy_remaining: 0,
                busy_always: false,
                auto_complete: true,
                read_status: GattStatus::SUCCESS,
                read_value: vec![0x2a],
                write_statuses: VecDeque::new(),
                descriptor_status: GattStatus::SUCCESS,
                mtu_status: GattStatus::SUCCESS,
                notify_accepts: true,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap()
    }

    fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Deliver an event as the transport would, from outside the worker
    fn deliver(&self, event: TransportEvent) {
        let events = self.lock().events.clone();
        events.expect("no link open").deliver(event);
    }

    fn take_busy(inner: &mut MockInner) -> bool {
        if inner.busy_always {
            return true;
        }
        if inner.busy_remaining > 0 {
            inner.busy_remaining -= 1;
            return true;
        }
        false
    }
}

impl GattTransport for MockTransport {
    fn open_link(&self, _addr: BdAddr, events: EventSender) -> Result<LinkHandle, GattError> {
        let mut inner = self.lock();
        inner.calls.push(Call::OpenLink);
        if inner.open_fails {
            return Err(GattError::TransportFailure(GattStatus::FAILURE));
        }
        inner.events = Some(events.clone());
        drop(inner);

        events.deliver(TransportEvent::LinkEstablished);
        Ok(LinkHandle(7))
    }

    fn close(&self, _link: LinkHandle) {
        self.lock().calls.push(Call::Close);
    }

    fn discover_attributes(&self, _link: LinkHandle) -> Initiation {
        let (events, status, services) = {
            let mut inner = self.lock();
            inner.calls.push(Call::Discover);
            (
                inner.events.clone(),
                inner.discovery_status,
                inner.services.clone(),
            )
        };
        if let Some(events) = events {
            events.deliver(TransportEvent::DiscoveryComplete { status, services });
        }
        Initiation::Accepted
    }

    fn read_characteristic(&self, _link: LinkHandle, chara: &Characteristic) -> Initiation {
        let (events, busy, auto, status, value) = {
            let mut inner = self.lock();
            inner.calls.push(Call::ReadChara(chara.value_handle));
            let busy = Self::take_busy(&mut inner);
            (
                inner.events.clone(),
                busy,
                inner.auto_complete,
                inner.read_status,
                inner.read_value.clone(),
            )
        };
        if busy {
            return Initiation::Busy;
        }
        if auto {
            if let Some(events) = events {
                events.deliver(TransportEvent::CharacteristicRead { status, value });
            }
        }
        Initiation::Accepted
    }

    fn write_characteristic(
        &self,
        _link: LinkHandle,
        chara: &Characteristic,
        value: &[u8],
        mode: WriteMode,
    ) -> Initiation {
        let (events, busy, auto, status) = {
            let mut inner = self.lock();
            inner
                .calls
                .push(Call::WriteChara(chara.value_handle, value.to_vec(), mode));
            let busy = Self::take_busy(&mut inner);
            let status = if busy {
                GattStatus::SUCCESS
            } else {
                inner
                    .write_statuses
                    .pop_front()
                    .unwrap_or(GattStatus::SUCCESS)
            };
            (inner.events.clone(), busy, inner.auto_complete, status)
        };
        if busy {
            return Initiation::Busy;
        }
        if auto {
            if let Some(events) = events {
                events.deliver(TransportEvent::CharacteristicWrite { status });
            }
        }
        Initiation::Accepted
    }

    fn read_descriptor(&self, _link: LinkHandle, descriptor: &Descriptor) -> Initiation {
        let (events, status, value) = {
            let mut inner = self.lock();
            inner.calls.push(Call::ReadDesc(descriptor.handle));
            (
                inner.events.clone(),
                inner.descriptor_status,
                inner.read_value.clone(),
            )
        };
        if let Some(events) = events {
            events.deliver(TransportEvent::DescriptorRead { status, value });
        }
        Initiation::Accepted
    }

    fn write_descriptor(
        &self,
        _link: LinkHandle,
        descriptor: &Descriptor,
        value: &[u8],
    ) -> Initiation {
        let (events, status) = {
            let mut inner = self.lock();
            inner
                .calls
                .push(Call::WriteDesc(descriptor.handle, value.to_vec()));
            (inner.events.clone(), inner.descriptor_status)
        };
        if let Some(events) = events {
            events.deliver(TransportEvent::DescriptorWrite { status });
        }
        Initiation::Accepted
    }

    fn set_notification_enabled(
        &self,
        _link: LinkHandle,
        chara: &Characteristic,
        enabled: bool,
    ) -> bool {
        let mut inner = self.lock();
        inner.calls.push(Call::SetNotify(chara.uuid, enabled));
        inner.notify_accepts
    }

    fn request_mtu(&self, _link: LinkHandle, mtu: u16) -> Initiation {
        let (events, status) = {
            let mut inner = self.lock();
            inner.calls.push(Call::RequestMtu(mtu));
            (inner.events.clone(), inner.mtu_status)
        };
        if let Some(events) = events {
            events.deliver(TransportEvent::MtuChanged { status, mtu });
        }
        Initiation::Accepted
    }

    fn set_preferred_phy(
        &self,
        _link: LinkHandle,
        tx_phy: Phy,
        rx_phy: Phy,
        _options: u8,
    ) -> Initiation {
        let events = {
            let mut inner = self.lock();
            inner.calls.push(Call::SetPhy);
            inner.events.clone()
        };
        if let Some(events) = events {
            events.deliver(TransportEvent::PhyUpdated {
                status: GattStatus::SUCCESS,
                tx_phy,
                rx_phy,
            });
        }
        Initiation::Accepted
    }

    fn read_phy(&self, _link: LinkHandle) -> Initiation {
        let events = {
            let mut inner = self.lock();
            inner.calls.push(Call::ReadPhy);
            inner.events.clone()
        };
        if let Some(events) = events {
            events.deliver(TransportEvent::PhyRead {
                status: GattStatus::SUCCESS,
                tx_phy: Phy::Le2M,
                rx_phy: Phy::Le2M,
            });
        }
        Initiation::Accepted
    }

    fn read_signal_strength(&self, _link: LinkHandle) -> Initiation {
        let events = {
            let mut inner = self.lock();
            inner.calls.push(Call::ReadRssi);
            inner.events.clone()
        };
        if let Some(events) = events {
            events.deliver(TransportEvent::SignalStrength {
                status: GattStatus::SUCCESS,
                rssi: -60,
            });
        }
        Initiation::Accepted
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ConnEvent {
    Connecting,
    ConnectFailed,
    Connected(usize),
    Disconnected { was_connecting: bool },
}

struct ConnProbe(Sender<ConnEvent>);

impl ConnectionCallback for ConnProbe {
    fn on_connecting(&self) {
        let _ = self.0.send(ConnEvent::Connecting);
    }

    fn on_connect_failed(&self) {
        let _ = self.0.send(ConnEvent::ConnectFailed);
    }

    fn on_connected(&self, services: &[Service]) {
        let _ = self.0.send(ConnEvent::Connected(services.len()));
    }

    fn on_disconnected(&self, was_connecting: bool) {
        let _ = self.0.send(ConnEvent::Disconnected { was_connecting });
    }
}

#[derive(Debug, PartialEq, Eq)]
enum NotifyEvent {
    Enabled,
    Disabled,
    Value(Vec<u8>),
}

struct NotifyProbe(Sender<NotifyEvent>);

impl NotifyCallback for NotifyProbe {
    fn on_enabled(&self) {
        let _ = self.0.send(NotifyEvent::Enabled);
    }

    fn on_disabled(&self) {
        let _ = self.0.send(NotifyEvent::Disabled);
    }

    fn on_value(&self, value: &[u8]) {
        let _ = self.0.send(NotifyEvent::Value(value.to_vec()));
    }
}

fn spawn(transport: &Arc<MockTransport>) -> Peripheral {
    Peripheral::spawn(
        addr(),
        Arc::clone(transport) as Arc<dyn GattTransport>,
        Arc::new(AlwaysPowered),
        Scheduler::new(),
    )
}

fn connected(transport: &Arc<MockTransport>) -> (Peripheral, Receiver<ConnEvent>) {
    let peripheral = spawn(transport);
    let (tx, rx) = mpsc::channel();
    peripheral.connect(ConnProbe(tx));
    assert_eq!(recv(&rx), ConnEvent::Connecting);
    assert!(matches!(recv(&rx), ConnEvent::Connected(_)));
    (peripheral, rx)
}

fn target() -> Target {
    Target::by_uuid(svc_uuid(), chr_uuid())
}

// ---- Connection state machine ------------------------------------------

#[test]
fn connect_discovers_then_reports_connected() {
    let transport = MockTransport::new();
    let (peripheral, _rx) = connected(&transport);

    assert_eq!(peripheral.state(), ConnectionState::Connected);
    let calls = transport.calls();
    assert_eq!(calls[0], Call::OpenLink);
    assert!(calls.contains(&Call::Discover));
}

#[test]
fn open_link_failure_reports_connect_failed() {
    let transport = MockTransport::new();
    transport.lock().open_fails = true;

    let peripheral = spawn(&transport);
    let (tx, rx) = mpsc::channel();
    peripheral.connect(ConnProbe(tx));

    assert_eq!(recv(&rx), ConnEvent::Connecting);
    assert_eq!(recv(&rx), ConnEvent::ConnectFailed);
    assert_eq!(recv(&rx), ConnEvent::Disconnected { was_connecting: true });
    assert_eq!(peripheral.state(), ConnectionState::Disconnected);
}

#[test]
fn discovery_failure_tears_the_attempt_down() {
    let transport = MockTransport::new();
    transport.lock().discovery_status = GattStatus::FAILURE;

    let peripheral = spawn(&transport);
    let (tx, rx) = mpsc::channel();
    peripheral.connect(ConnProbe(tx));

    assert_eq!(recv(&rx), ConnEvent::Connecting);
    assert_eq!(recv(&rx), ConnEvent::ConnectFailed);
    assert_eq!(recv(&rx), ConnEvent::Disconnected { was_connecting: true });
    assert_eq!(peripheral.state(), ConnectionState::Disconnected);
}

#[test]
fn duplicate_connect_reannounces_without_second_link() {
    let transport = MockTransport::new();
    let (peripheral, _rx) = connected(&transport);

    let (tx, rx) = mpsc::channel();
    peripheral.connect(ConnProbe(tx));
    assert!(matches!(recv(&rx), ConnEvent::Connected(_)));

    assert_eq!(transport.count(|c| *c == Call::OpenLink), 1);
}

#[test]
fn connect_while_connecting_reannounces_connecting_only() {
    let transport = MockTransport::new();
    let peripheral = spawn(&transport);

    let (tx1, rx1) = mpsc::channel();
    peripheral.connect(ConnProbe(tx1));
    assert_eq!(recv(&rx1), ConnEvent::Connecting);

    // Discovery has not completed yet; the second connect must only
    // re-announce the phase to its own callback
    let (tx2, rx2) = mpsc::channel();
    peripheral.connect(ConnProbe(tx2));
    assert_eq!(recv(&rx2), ConnEvent::Connecting);
    assert!(matches!(recv(&rx2), ConnEvent::Connected(_)));

    assert_eq!(transport.count(|c| *c == Call::OpenLink), 1);
}

#[test]
fn link_loss_reports_disconnected() {
    let transport = MockTransport::new();
    let (peripheral, rx) = connected(&transport);

    transport.deliver(TransportEvent::LinkLost);
    assert_eq!(recv(&rx), ConnEvent::Disconnected { was_connecting: false });
    assert_eq!(peripheral.state(), ConnectionState::Disconnected);
    assert_eq!(transport.count(|c| *c == Call::Close), 1);
}

#[test]
fn service_changed_triggers_rediscovery() {
    let transport = MockTransport::new();
    let (_peripheral, _rx) = connected(&transport);

    transport.deliver(TransportEvent::ServiceChanged);
    wait_until(|| transport.count(|c| *c == Call::Discover) == 2);
}

// ---- Operation queue ----------------------------------------------------

#[test]
fn operations_run_one_at_a_time_in_order() {
    let transport = MockTransport::new();
    transport.lock().auto_complete = false;
    let (peripheral, _rx) = connected(&transport);

    let (tx, results) = mpsc::channel();
    let tx2 = tx.clone();
    peripheral.read_characteristic(target(), move |r| {
        let _ = tx.send(("read", r.is_ok()));
    });
    peripheral.write_characteristic(target(), vec![1], WriteMode::WithResponse, move |r| {
        let _ = tx2.send(("write", r.is_ok()));
    });

    // Only the read was initiated while it is in flight
    wait_until(|| transport.count(|c| matches!(c, Call::ReadChara(_))) == 1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(transport.count(|c| matches!(c, Call::WriteChara(..))), 0);

    transport.deliver(TransportEvent::CharacteristicRead {
        status: GattStatus::SUCCESS,
        value: vec![0x2a],
    });
    assert_eq!(recv(&results), ("read", true));

    wait_until(|| transport.count(|c| matches!(c, Call::WriteChara(..))) == 1);
    transport.deliver(TransportEvent::CharacteristicWrite {
        status: GattStatus::SUCCESS,
    });
    assert_eq!(recv(&results), ("write", true));
}

#[test]
fn busy_initiation_retries_until_accepted() {
    let transport = MockTransport::new();
    transport.lock().busy_remaining = 3;
    let (peripheral, _rx) = connected(&transport);

    let (tx, results) = mpsc::channel();
    peripheral.read_characteristic(target(), move |r| {
        let _ = tx.send(r);
    });

    assert_eq!(recv(&results), Ok(vec![0x2a]));
    // Three rejected initiations plus the accepted one
    assert_eq!(transport.count(|c| matches!(c, Call::ReadChara(_))), 4);
}

#[test]
fn busy_initiation_gives_up_at_the_limit() {
    let transport = MockTransport::new();
    transport.lock().busy_always = true;
    let (peripheral, _rx) = connected(&transport);

    let (tx, results) = mpsc::channel();
    peripheral.read_characteristic(target(), move |r| {
        let _ = tx.send(r);
    });

    let result = results
        .recv_timeout(Duration::from_secs(30))
        .expect("timed out waiting for busy failure");
    assert_eq!(
        result,
        Err(GattError::Busy {
            attempts: BUSY_RETRY_LIMIT
        })
    );
    assert_eq!(
        transport.count(|c| matches!(c, Call::ReadChara(_))),
        BUSY_RETRY_LIMIT as usize
    );
}

#[test]
fn disconnect_fails_in_flight_and_queued_operations() {
    let transport = MockTransport::new();
    transport.lock().auto_complete = false;
    let (peripheral, rx) = connected(&transport);

    let (tx, results) = mpsc::channel();
    for i in 0..3 {
        let tx = tx.clone();
        peripheral.read_characteristic(target(), move |r| {
            let _ = tx.send((i, r));
        });
    }
    wait_until(|| transport.count(|c| matches!(c, Call::ReadChara(_))) == 1);

    peripheral.disconnect();
    for i in 0..3 {
        assert_eq!(recv(&results), (i, Err(GattError::Disconnected)));
    }
    assert_eq!(recv(&rx), ConnEvent::Disconnected { was_connecting: false });

    // Queued reads never reached the transport
    assert_eq!(transport.count(|c| matches!(c, Call::ReadChara(_))), 1);
}

#[test]
fn operations_without_a_link_fail_not_connected() {
    let transport = MockTransport::new();
    let peripheral = spawn(&transport);

    let (tx, results) = mpsc::channel();
    peripheral.read_characteristic(target(), move |r| {
        let _ = tx.send(r);
    });

    assert_eq!(recv(&results), Err(GattError::NotConnected));
    assert!(transport.calls().is_empty());
}

// ---- Attribute resolution -----------------------------------------------

#[test]
fn unknown_attribute_fails_before_initiation() {
    let transport = MockTransport::new();
    let (peripheral, _rx) = connected(&transport);

    let (tx, results) = mpsc::channel();
    peripheral.read_characteristic(
        Target::by_uuid(svc_uuid(), Uuid::from_u16(0xfff0)),
        move |r| {
            let _ = tx.send(r);
        },
    );

    assert_eq!(recv(&results), Err(GattError::AttributeNotFound));
    assert_eq!(transport.count(|c| matches!(c, Call::ReadChara(_))), 0);
}

#[test]
fn missing_capability_fails_before_initiation() {
    let transport = MockTransport::new();
    let (peripheral, _rx) = connected(&transport);

    let (tx, results) = mpsc::channel();
    peripheral.read_characteristic(Target::by_uuid(svc_uuid(), wr_uuid()), move |r| {
        let _ = tx.send(r);
    });

    assert_eq!(recv(&results), Err(GattError::CapabilityMissing));
    assert_eq!(transport.count(|c| matches!(c, Call::ReadChara(_))), 0);
}

#[test]
fn write_mode_is_corrected_to_a_supported_one() {
    let transport = MockTransport::new();
    let (peripheral, _rx) = connected(&transport);

    let (tx, results) = mpsc::channel();
    peripheral.write_characteristic(
        Target::by_uuid(svc_uuid(), wr_uuid()),
        vec![9],
        WriteMode::WithoutResponse,
        move |r| {
            let _ = tx.send(r);
        },
    );

    assert_eq!(recv(&results), Ok(()));
    assert_eq!(
        transport
            .calls()
            .into_iter()
            .find(|c| matches!(c, Call::WriteChara(..))),
        Some(Call::WriteChara(0x0009, vec![9], WriteMode::WithResponse))
    );
}

#[test]
fn reconnect_resolves_handles_from_the_fresh_table() {
    let transport = MockTransport::new();
    let (peripheral, rx) = connected(&transport);

    let (tx, results) = mpsc::channel();
    let tx2 = tx.clone();
    peripheral.read_characteristic(target(), move |r| {
        let _ = tx.send(r);
    });
    assert!(recv(&results).is_ok());

    peripheral.disconnect();
    assert_eq!(recv(&rx), ConnEvent::Disconnected { was_connecting: false });

    // The peripheral comes back with different handles
    transport.lock().services = table(0x0013);
    let (ctx, crx) = mpsc::channel();
    peripheral.connect(ConnProbe(ctx));
    assert_eq!(recv(&crx), ConnEvent::Connecting);
    assert!(matches!(recv(&crx), ConnEvent::Connected(_)));

    peripheral.read_characteristic(target(), move |r| {
        let _ = tx2.send(r);
    });
    assert!(recv(&results).is_ok());

    let handles: Vec<u16> = transport
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::ReadChara(handle) => Some(handle),
            _ => None,
        })
        .collect();
    assert_eq!(handles, vec![0x0003, 0x0013]);
}

// ---- Split writes -------------------------------------------------------

#[test]
fn split_write_acknowledged_reports_progress_per_chunk() {
    let transport = MockTransport::new();
    let (peripheral, _rx) = connected(&transport);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);
    let (tx, results) = mpsc::channel();
    peripheral.split_write_characteristic(
        target(),
        &[0u8; 45],
        WriteMode::WithResponse,
        20,
        Duration::ZERO,
        move |sent, total| seen.lock().unwrap().push((sent, total)),
        move |r| {
            let _ = tx.send(r);
        },
    );

    assert_eq!(recv(&results), Ok(()));
    assert_eq!(*progress.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);

    let chunks: Vec<usize> = transport
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::WriteChara(_, value, _) => Some(value.len()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![20, 20, 5]);
}

#[test]
fn split_write_acknowledged_aborts_on_chunk_failure() {
    let transport = MockTransport::new();
    transport.lock().write_statuses =
        VecDeque::from(vec![GattStatus::SUCCESS, GattStatus::FAILURE]);
    let (peripheral, _rx) = connected(&transport);

    let (tx, results) = mpsc::channel();
    peripheral.split_write_characteristic(
        target(),
        &[0u8; 45],
        WriteMode::WithResponse,
        20,
        Duration::ZERO,
        |_, _| {},
        move |r| {
            let _ = tx.send(r);
        },
    );

    assert_eq!(
        recv(&results),
        Err(GattError::TransportFailure(GattStatus::FAILURE))
    );
    // The third chunk was never sent
    assert_eq!(transport.count(|c| matches!(c, Call::WriteChara(..))), 2);
}

#[test]
fn split_write_unacknowledged_sends_through_failure() {
    let transport = MockTransport::new();
    transport.lock().write_statuses = VecDeque::from(vec![
        GattStatus::SUCCESS,
        GattStatus::FAILURE,
        GattStatus::SUCCESS,
    ]);
    let (peripheral, _rx) = connected(&transport);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);
    let (tx, results) = mpsc::channel();
    peripheral.split_write_characteristic(
        target(),
        &[0u8; 45],
        WriteMode::WithoutResponse,
        20,
        Duration::ZERO,
        move |sent, total| seen.lock().unwrap().push((sent, total)),
        move |r| {
            let _ = tx.send(r);
        },
    );

    // All chunks go out, and the latched failure is the final verdict
    assert_eq!(
        recv(&results),
        Err(GattError::TransportFailure(GattStatus::FAILURE))
    );
    assert_eq!(transport.count(|c| matches!(c, Call::WriteChara(..))), 3);
    assert_eq!(*progress.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
}

#[test]
fn split_write_empty_payload_succeeds_without_traffic() {
    let transport = MockTransport::new();
    let (peripheral, _rx) = connected(&transport);

    let (tx, results) = mpsc::channel();
    peripheral.split_write_characteristic(
        target(),
        &[],
        WriteMode::WithResponse,
        20,
        Duration::ZERO,
        |_, _| {},
        move |r| {
            let _ = tx.send(r);
        },
    );

    assert_eq!(recv(&results), Ok(()));
    assert_eq!(transport.count(|c| matches!(c, Call::WriteChara(..))), 0);
}

// ---- Notifications ------------------------------------------------------

#[test]
fn notifications_enable_dispatch_and_disable() {
    let transport = MockTransport::new();
    let (peripheral, _rx) = connected(&transport);

    let (tx, events) = mpsc::channel();
    peripheral.enable_notifications(target(), NotifyProbe(tx));
    assert_eq!(recv(&events), NotifyEvent::Enabled);

    // The CCCD got the notification value and routing was enabled first
    assert_eq!(transport.count(|c| *c == Call::SetNotify(chr_uuid(), true)), 1);
    assert_eq!(
        transport.count(|c| *c == Call::WriteDesc(0x0004, vec![0x01, 0x00])),
        1
    );

    transport.deliver(TransportEvent::ValueChanged {
        characteristic: chr_uuid(),
        value: vec![7, 8],
    });
    assert_eq!(recv(&events), NotifyEvent::Value(vec![7, 8]));

    peripheral.disable_notifications(target());
    assert_eq!(recv(&events), NotifyEvent::Disabled);
    assert_eq!(transport.count(|c| *c == Call::SetNotify(chr_uuid(), false)), 1);
    assert_eq!(
        transport.count(|c| *c == Call::WriteDesc(0x0004, vec![0x00, 0x00])),
        1
    );

    // No subscriber is left for further value changes
    transport.deliver(TransportEvent::ValueChanged {
        characteristic: chr_uuid(),
        value: vec![9],
    });
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn failed_cccd_write_reverses_routing_and_reports_disabled() {
    let transport = MockTransport::new();
    transport.lock().descriptor_status = GattStatus::FAILURE;
    let (peripheral, _rx) = connected(&transport);

    let (tx, events) = mpsc::channel();
    peripheral.enable_notifications(target(), NotifyProbe(tx));

    assert_eq!(recv(&events), NotifyEvent::Disabled);
    assert_eq!(transport.count(|c| *c == Call::SetNotify(chr_uuid(), false)), 1);

    // Nothing was registered, so value changes go nowhere
    transport.deliver(TransportEvent::ValueChanged {
        characteristic: chr_uuid(),
        value: vec![1],
    });
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn notifications_stop_at_disconnect() {
    let transport = MockTransport::new();
    let (peripheral, rx) = connected(&transport);

    let (tx, events) = mpsc::channel();
    peripheral.enable_notifications(target(), NotifyProbe(tx));
    assert_eq!(recv(&events), NotifyEvent::Enabled);

    peripheral.disconnect();
    assert_eq!(recv(&rx), ConnEvent::Disconnected { was_connecting: false });

    transport.deliver(TransportEvent::ValueChanged {
        characteristic: chr_uuid(),
        value: vec![1],
    });
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
}

// ---- Link parameters ----------------------------------------------------

#[test]
fn mtu_applies_on_success_and_resets_on_disconnect() {
    let transport = MockTransport::new();
    let (peripheral, rx) = connected(&transport);
    assert_eq!(peripheral.mtu(), ATT_DEFAULT_MTU);

    let (tx, results) = mpsc::channel();
    peripheral.request_mtu(185, move |r| {
        let _ = tx.send(r);
    });
    assert_eq!(recv(&results), Ok(185));
    assert_eq!(peripheral.mtu(), 185);

    peripheral.disconnect();
    assert_eq!(recv(&rx), ConnEvent::Disconnected { was_connecting: false });
    assert_eq!(peripheral.mtu(), ATT_DEFAULT_MTU);
}

#[test]
fn phy_and_rssi_round_through_the_queue() {
    let transport = MockTransport::new();
    let (peripheral, _rx) = connected(&transport);

    let (tx, phys) = mpsc::channel();
    peripheral.read_phy(move |r| {
        let _ = tx.send(r);
    });
    let phy = recv(&phys).unwrap();
    assert_eq!(phy.tx_phy, Phy::Le2M);

    let (tx, rssis) = mpsc::channel();
    peripheral.read_signal_strength(move |r| {
        let _ = tx.send(r);
    });
    assert_eq!(recv(&rssis), Ok(-60));
}

// ---- Attribute queries --------------------------------------------------

#[test]
fn service_and_characteristic_queries_answer_from_the_table() {
    let transport = MockTransport::new();
    let (peripheral, _rx) = connected(&transport);

    let (tx, replies) = mpsc::channel();
    let tx2 = tx.clone();
    peripheral.service(svc_uuid(), move |s| {
        let _ = tx.send(s.map(|s| s.uuid));
    });
    assert_eq!(recv(&replies), Some(svc_uuid()));

    let (ctx, creplies) = mpsc::channel();
    peripheral.characteristic(svc_uuid(), chr_uuid(), move |c| {
        let _ = ctx.send(c.map(|c| c.value_handle));
    });
    assert_eq!(recv(&creplies), Some(0x0003));

    peripheral.service(Uuid::from_u16(0xfff0), move |s| {
        let _ = tx2.send(s.map(|s| s.uuid));
    });
    assert_eq!(recv(&replies), None);
}
