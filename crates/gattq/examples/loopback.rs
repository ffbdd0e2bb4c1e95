//! Drives the engine against an in-memory transport that simulates a
//! peripheral with a battery service. No radio required.

use gattq::{
    AlwaysPowered, BdAddr, Characteristic, CharacteristicProperties, ConnectionCallback,
    Descriptor, DeviceManager, EventSender, GattStatus, GattTransport, Initiation, LinkHandle,
    NotifyCallback, Phy, Service, Target, TransportEvent, Uuid, WriteMode,
};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BATTERY_SERVICE: u16 = 0x180f;
const BATTERY_LEVEL: u16 = 0x2a19;

/// Simulated peripheral: every accepted request completes successfully, and
/// every write is echoed back as a value-change notification.
struct LoopbackTransport {
    events: Mutex<Option<EventSender>>,
}

impl LoopbackTransport {
    fn new() -> Self {
        LoopbackTransport {
            events: Mutex::new(None),
        }
    }

    fn deliver(&self, event: TransportEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            events.deliver(event);
        }
    }

    fn services() -> Vec<Service> {
        vec![Service {
            uuid: Uuid::from_u16(BATTERY_SERVICE),
            is_primary: true,
            start_handle: 0x0001,
            end_handle: 0x0005,
            characteristics: vec![Characteristic {
                uuid: Uuid::from_u16(BATTERY_LEVEL),
                declaration_handle: 0x0002,
                value_handle: 0x0003,
                properties: CharacteristicProperties::READ
                    | CharacteristicProperties::WRITE
                    | CharacteristicProperties::NOTIFY,
                descriptors: vec![Descriptor {
                    uuid: Uuid::from_u16(0x2902),
                    handle: 0x0004,
                }],
            }],
        }]
    }
}

impl GattTransport for LoopbackTransport {
    fn open_link(&self, _addr: BdAddr, events: EventSender) -> Result<LinkHandle, gattq::GattError> {
        *self.events.lock().unwrap() = Some(events.clone());
        events.deliver(TransportEvent::LinkEstablished);
        Ok(LinkHandle(1))
    }

    fn close(&self, _link: LinkHandle) {
        *self.events.lock().unwrap() = None;
    }

    fn discover_attributes(&self, _link: LinkHandle) -> Initiation {
        self.deliver(TransportEvent::DiscoveryComplete {
            status: GattStatus::SUCCESS,
            services: Self::services(),
        });
        Initiation::Accepted
    }

    fn read_characteristic(&self, _link: LinkHandle, _chara: &Characteristic) -> Initiation {
        self.deliver(TransportEvent::CharacteristicRead {
            status: GattStatus::SUCCESS,
            value: vec![87],
        });
        Initiation::Accepted
    }

    fn write_characteristic(
        &self,
        _link: LinkHandle,
        chara: &Characteristic,
        value: &[u8],
        _mode: WriteMode,
    ) -> Initiation {
        self.deliver(TransportEvent::ValueChanged {
            characteristic: chara.uuid,
            value: value.to_vec(),
        });
        self.deliver(TransportEvent::CharacteristicWrite {
            status: GattStatus::SUCCESS,
        });
        Initiation::Accepted
    }

    fn read_descriptor(&self, _link: LinkHandle, _descriptor: &Descriptor) -> Initiation {
        self.deliver(TransportEvent::DescriptorRead {
            status: GattStatus::SUCCESS,
            value: vec![0, 0],
        });
        Initiation::Accepted
    }

    fn write_descriptor(
        &self,
        _link: LinkHandle,
        _descriptor: &Descriptor,
        _value: &[u8],
    ) -> Initiation {
        self.deliver(TransportEvent::DescriptorWrite {
            status: GattStatus::SUCCESS,
        });
        Initiation::Accepted
    }

    fn set_notification_enabled(
        &self,
        _link: LinkHandle,
        _chara: &Characteristic,
        _enabled: bool,
    ) -> bool {
        true
    }

    fn request_mtu(&self, _link: LinkHandle, mtu: u16) -> Initiation {
        self.deliver(TransportEvent::MtuChanged {
            status: GattStatus::SUCCESS,
            mtu,
        });
        Initiation::Accepted
    }

    fn set_preferred_phy(
        &self,
        _link: LinkHandle,
        tx_phy: Phy,
        rx_phy: Phy,
        _options: u8,
    ) -> Initiation {
        self.deliver(TransportEvent::PhyUpdated {
            status: GattStatus::SUCCESS,
            tx_phy,
            rx_phy,
        });
        Initiation::Accepted
    }

    fn read_phy(&self, _link: LinkHandle) -> Initiation {
        self.deliver(TransportEvent::PhyRead {
            status: GattStatus::SUCCESS,
            tx_phy: Phy::Le1M,
            rx_phy: Phy::Le1M,
        });
        Initiation::Accepted
    }

    fn read_signal_strength(&self, _link: LinkHandle) -> Initiation {
        self.deliver(TransportEvent::SignalStrength {
            status: GattStatus::SUCCESS,
            rssi: -42,
        });
        Initiation::Accepted
    }
}

struct PrintingConnection(mpsc::Sender<bool>);

impl ConnectionCallback for PrintingConnection {
    fn on_connecting(&self) {
        println!("Connecting...");
    }

    fn on_connect_failed(&self) {
        println!("Connect failed");
    }

    fn on_connected(&self, services: &[Service]) {
        println!("Connected, {} services discovered", services.len());
        for service in services {
            println!("  Service {}", service.uuid);
            for chara in &service.characteristics {
                println!("    Characteristic {}", chara.uuid);
            }
        }
        let _ = self.0.send(true);
    }

    fn on_disconnected(&self, was_connecting: bool) {
        println!("Disconnected (was_connecting: {})", was_connecting);
        let _ = self.0.send(false);
    }
}

struct PrintingSubscriber;

impl NotifyCallback for PrintingSubscriber {
    fn on_enabled(&self) {
        println!("Notifications enabled");
    }

    fn on_disabled(&self) {
        println!("Notifications disabled");
    }

    fn on_value(&self, value: &[u8]) {
        println!("Value changed: {:?}", value);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manager = DeviceManager::new(
        Arc::new(LoopbackTransport::new()),
        Arc::new(AlwaysPowered),
    );

    let addr: BdAddr = "00:11:22:33:44:55".parse()?;
    let (connected_tx, connected_rx) = mpsc::channel();
    let peripheral = manager.connect(addr, PrintingConnection(connected_tx));
    connected_rx.recv_timeout(Duration::from_secs(5))?;

    let target = Target::by_uuid(Uuid::from_u16(BATTERY_SERVICE), Uuid::from_u16(BATTERY_LEVEL));

    let (done_tx, done_rx) = mpsc::channel();
    let tx = done_tx.clone();
    peripheral.read_characteristic(target.clone(), move |result| {
        println!("Battery level: {:?}", result);
        let _ = tx.send(());
    });
    done_rx.recv_timeout(Duration::from_secs(5))?;

    peripheral.enable_notifications(target.clone(), PrintingSubscriber);

    let tx = done_tx.clone();
    peripheral.write_characteristic(target.clone(), vec![50], WriteMode::WithResponse, move |r| {
        println!("Write result: {:?}", r);
        let _ = tx.send(());
    });
    done_rx.recv_timeout(Duration::from_secs(5))?;

    let tx = done_tx.clone();
    peripheral.split_write_characteristic(
        target.clone(),
        &[7u8; 45],
        WriteMode::WithResponse,
        20,
        Duration::from_millis(10),
        |sent, total| println!("Split write progress: {}/{}", sent, total),
        move |r| {
            println!("Split write result: {:?}", r);
            let _ = tx.send(());
        },
    );
    done_rx.recv_timeout(Duration::from_secs(5))?;

    let tx = done_tx.clone();
    peripheral.request_mtu(185, move |r| {
        println!("MTU: {:?}", r);
        let _ = tx.send(());
    });
    done_rx.recv_timeout(Duration::from_secs(5))?;

    let tx = done_tx;
    peripheral.read_signal_strength(move |r| {
        println!("RSSI: {:?}", r);
        let _ = tx.send(());
    });
    done_rx.recv_timeout(Duration::from_secs(5))?;

    peripheral.disconnect();
    connected_rx.recv_timeout(Duration::from_secs(5))?;

    println!("Done!");
    Ok(())
}
