//! Per-peripheral worker
//!
//! Every peripheral gets one dedicated worker thread owning its connection
//! state machine, FIFO operation queue, handle cache and notification
//! registry. All mutation happens here: callers submit commands over a
//! channel, the transport delivers completion events into the same channel,
//! and timers (busy retries, chunk pacing, the radio settle delay) are
//! deadlines the loop wakes up for. At most one operation is in flight at a
//! time; its completion event is matched purely by the in-flight task's
//! variant, because nothing else can be outstanding.

use crate::addr::BdAddr;
use crate::device::cache::HandleCache;
use crate::device::registry::NotificationRegistry;
use crate::device::task::{GattTask, Target};
use crate::device::{ConnectionCallback, ConnectionState, Shared};
use crate::error::GattError;
use crate::gatt::constants::{
    ATT_DEFAULT_MTU, BUSY_RETRY_DELAY, BUSY_RETRY_LIMIT, CLIENT_CHAR_CONFIG_UUID,
    DISABLE_NOTIFICATION_VALUE, DISCOVERY_SETTLE_DELAY, ENABLE_INDICATION_VALUE,
    ENABLE_NOTIFICATION_VALUE, RADIO_SETTLE_DELAY,
};
use crate::gatt::types::{Characteristic, CharacteristicProperties, Service, Uuid};
use crate::sched::Scheduler;
use crate::transport::{
    EventSender, GattStatus, GattTransport, Initiation, LinkHandle, RadioAvailability,
    TransportEvent, WriteMode,
};
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Caller requests submitted to the worker
pub(crate) enum Command {
    Connect(Box<dyn ConnectionCallback>),
    Disconnect { destroy: bool },
    Enqueue(GattTask),
    GetService {
        uuid: Uuid,
        reply: Box<dyn FnOnce(Option<Service>) + Send>,
    },
    GetCharacteristic {
        service: Uuid,
        characteristic: Uuid,
        reply: Box<dyn FnOnce(Option<Characteristic>) + Send>,
    },
}

/// Everything the worker loop can receive
pub(crate) enum Msg {
    Command(Command),
    Event(TransportEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerEvent {
    /// Request the link (deferred while the radio settles after power-on)
    OpenLink,
    /// Re-attempt the in-flight task's initiation after a busy rejection
    Retry,
    /// Send the next chunk of the in-flight split write
    NextChunk,
}

struct Timer {
    due: Instant,
    /// Sequence number of the in-flight task this timer belongs to
    /// (0 for connect-flow timers). A stale timer is dropped.
    seq: u64,
    event: TimerEvent,
}

/// The task currently awaiting a transport completion
struct InFlight {
    seq: u64,
    /// Consecutive busy rejections for the current initiation unit
    attempts: u32,
    task: GattTask,
}

/// Result of one initiation attempt against the transport
enum InitiateOutcome {
    /// Request started; await its completion event
    Accepted,
    /// A split-write chunk went out; optionally pace the next one
    AcceptedChunk { arm_next: bool, interval: Duration },
    /// Split write with an empty payload: nothing to send, succeed now
    EmptySplit,
    /// Transport cannot take a request right now
    Busy,
    /// The task reached initiation without a resolved handle
    Unresolvable,
}

impl From<Initiation> for InitiateOutcome {
    fn from(initiation: Initiation) -> Self {
        match initiation {
            Initiation::Accepted => InitiateOutcome::Accepted,
            Initiation::Busy => InitiateOutcome::Busy,
        }
    }
}

/// Split-write dispatcher decision, computed while the task is borrowed
enum SplitDecision {
    Fail(GattStatus),
    Succeed,
    ArmNext(Duration),
    Wait,
}

pub(crate) struct Worker {
    addr: BdAddr,
    transport: Arc<dyn GattTransport>,
    radio: Arc<dyn RadioAvailability>,
    sched: Scheduler,
    shared: Arc<Shared>,
    rx: Receiver<Msg>,
    events: EventSender,
    link: Option<LinkHandle>,
    callback: Option<Box<dyn ConnectionCallback>>,
    /// Attribute table of the current connection instance
    attrs: Vec<Service>,
    cache: HandleCache,
    registry: NotificationRegistry,
    queue: VecDeque<GattTask>,
    in_flight: Option<InFlight>,
    timers: Vec<Timer>,
    next_seq: u64,
    stop: bool,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: BdAddr,
        transport: Arc<dyn GattTransport>,
        radio: Arc<dyn RadioAvailability>,
        sched: Scheduler,
        shared: Arc<Shared>,
        rx: Receiver<Msg>,
        events: EventSender,
    ) -> Self {
        Worker {
            addr,
            transport,
            radio,
            sched,
            shared,
            rx,
            events,
            link: None,
            callback: None,
            attrs: Vec::new(),
            cache: HandleCache::new(),
            registry: NotificationRegistry::new(),
            queue: VecDeque::new(),
            in_flight: None,
            timers: Vec::new(),
            next_seq: 0,
            stop: false,
        }
    }

    /// The worker loop. Returns when the peripheral is destroyed or every
    /// handle to it has been dropped.
    pub fn run(mut self) {
        debug!("worker started for {}", self.addr);

        while !self.stop {
            self.fire_due_timers();
            if self.stop {
                break;
            }

            let msg = match self.next_deadline() {
                Some(due) => {
                    let timeout = due.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(timeout) {
                        Ok(msg) => Some(msg),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.rx.recv() {
                    Ok(msg) => Some(msg),
                    Err(_) => break,
                },
            };

            if let Some(msg) = msg {
                self.handle(msg);
            }
        }

        // Dropped or destroyed while a link was still up
        if self.link.is_some() || self.state() != ConnectionState::Disconnected {
            self.teardown(false);
        }

        debug!("worker stopped for {}", self.addr);
    }

    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.set_state(state);
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Command(cmd) => self.handle_command(cmd),
            Msg::Event(event) => self.handle_event(event),
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(callback) => self.handle_connect(callback),
            Command::Disconnect { destroy } => {
                if self.link.is_none() && self.state() == ConnectionState::Disconnected {
                    debug!("disconnect {}: already disconnected", self.addr);
                    if destroy {
                        self.stop = true;
                    }
                } else {
                    self.teardown(destroy);
                }
            }
            Command::Enqueue(task) => {
                debug!("enqueue {}", task.kind());
                self.queue.push_back(task);
                if self.in_flight.is_none() {
                    self.next_task();
                }
            }
            Command::GetService { uuid, reply } => {
                reply(self.cache.service(&uuid, &self.attrs));
            }
            Command::GetCharacteristic {
                service,
                characteristic,
                reply,
            } => {
                reply(self.cache.characteristic(&service, &characteristic, &self.attrs));
            }
        }
    }

    // ---- Connection state machine --------------------------------------

    fn handle_connect(&mut self, callback: Box<dyn ConnectionCallback>) {
        debug!("connect {}", self.addr);
        self.callback = Some(callback);

        match self.state() {
            ConnectionState::Connecting => {
                debug!("already connecting");
                if let Some(cb) = &self.callback {
                    cb.on_connecting();
                }
            }
            ConnectionState::Connected => {
                debug!("already connected");
                if let Some(cb) = &self.callback {
                    cb.on_connected(&self.attrs);
                }
            }
            ConnectionState::Disconnected => {
                self.set_state(ConnectionState::Connecting);
                if let Some(cb) = &self.callback {
                    cb.on_connecting();
                }

                if self.radio.is_powered() {
                    self.open_link();
                } else {
                    info!("radio is off, requesting power on");
                    if self.radio.request_power_on() {
                        // The adapter needs time to come up before it will
                        // take a link request
                        self.arm_timer(RADIO_SETTLE_DELAY, 0, TimerEvent::OpenLink);
                    } else {
                        warn!("radio could not be powered on");
                        self.teardown(false);
                    }
                }
            }
        }
    }

    fn open_link(&mut self) {
        if self.state() != ConnectionState::Connecting {
            return;
        }

        match self.transport.open_link(self.addr, self.events.clone()) {
            Ok(link) => {
                debug!("link request issued for {}", self.addr);
                self.link = Some(link);
            }
            Err(err) => {
                warn!("open link failed for {}: {}", self.addr, err);
                self.teardown(false);
            }
        }
    }

    /// Ask for attribute discovery after a settle delay. The request is made
    /// from the shared scheduler thread, not this worker: some stacks race
    /// when discovery is requested from the context that receives the
    /// link-established callback.
    fn schedule_discovery(&self) {
        let Some(link) = self.link else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        self.sched.schedule(DISCOVERY_SETTLE_DELAY, move || {
            let _ = transport.discover_attributes(link);
        });
    }

    /// Unwind everything: fail outstanding tasks, clear per-connection
    /// state, release the link, report, and reset negotiated parameters
    fn teardown(&mut self, destroy: bool) {
        info!("disconnect {} destroy={}", self.addr, destroy);

        let was_connecting = self.state() == ConnectionState::Connecting;
        if was_connecting {
            if let Some(cb) = &self.callback {
                cb.on_connect_failed();
            }
        }

        self.fail_in_flight(GattError::Disconnected);
        for task in std::mem::take(&mut self.queue) {
            task.fail(GattError::Disconnected);
        }

        self.timers.clear();
        self.cache.clear();
        self.registry.clear();
        self.attrs.clear();

        if let Some(link) = self.link.take() {
            self.transport.close(link);
        }

        self.set_state(ConnectionState::Disconnected);
        self.shared.set_mtu(ATT_DEFAULT_MTU);
        if let Some(cb) = self.callback.take() {
            cb.on_disconnected(was_connecting);
        }

        if destroy {
            self.stop = true;
        }
    }

    // ---- Transport events ----------------------------------------------

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LinkEstablished => {
                debug!("link established for {}", self.addr);
                self.schedule_discovery();
            }
            TransportEvent::LinkLost => {
                if self.state() == ConnectionState::Disconnected {
                    debug!("link lost while already disconnected");
                } else {
                    info!("link lost for {}", self.addr);
                    self.teardown(false);
                }
            }
            TransportEvent::ServiceChanged => {
                debug!("service changed indication, rediscovering");
                self.schedule_discovery();
            }
            TransportEvent::DiscoveryComplete { status, services } => {
                self.on_discovery_complete(status, services);
            }
            TransportEvent::CharacteristicRead { status, value } => {
                debug!("characteristic read completed status={}", status);
                self.on_read_completion(status, value, false);
            }
            TransportEvent::CharacteristicWrite { status } => {
                debug!("characteristic write completed status={}", status);
                self.on_characteristic_write(status);
            }
            TransportEvent::DescriptorRead { status, value } => {
                debug!("descriptor read completed status={}", status);
                self.on_read_completion(status, value, true);
            }
            TransportEvent::DescriptorWrite { status } => {
                debug!("descriptor write completed status={}", status);
                self.on_descriptor_write(status);
            }
            TransportEvent::MtuChanged { status, mtu } => {
                debug!("mtu changed mtu={} status={}", mtu, status);
                self.on_mtu_changed(status, mtu);
            }
            TransportEvent::PhyUpdated {
                status,
                tx_phy,
                rx_phy,
            } => {
                debug!("phy updated status={}", status);
                self.on_phy_completion(status, tx_phy, rx_phy, true);
            }
            TransportEvent::PhyRead {
                status,
                tx_phy,
                rx_phy,
            } => {
                debug!("phy read status={}", status);
                self.on_phy_completion(status, tx_phy, rx_phy, false);
            }
            TransportEvent::SignalStrength { status, rssi } => {
                debug!("signal strength read rssi={} status={}", rssi, status);
                self.on_signal_strength(status, rssi);
            }
            TransportEvent::ValueChanged {
                characteristic,
                value,
            } => {
                trace!(
                    "value changed on {}: {}",
                    characteristic,
                    hex::encode(&value)
                );
                self.registry.dispatch(&characteristic, &value);
            }
        }
    }

    fn on_discovery_complete(&mut self, status: GattStatus, services: Vec<Service>) {
        match self.state() {
            ConnectionState::Connected => {
                // Duplicate discovery completions occur, e.g. re-triggered
                // by a service-changed indication
                debug!("discovery completion while connected, ignored");
            }
            ConnectionState::Connecting => {
                if status.is_success() {
                    info!("{} connected, {} services", self.addr, services.len());
                    self.attrs = services;
                    self.set_state(ConnectionState::Connected);
                    if let Some(cb) = &self.callback {
                        cb.on_connected(&self.attrs);
                    }
                } else {
                    warn!("discovery failed with status {}", status);
                    self.teardown(false);
                }
            }
            ConnectionState::Disconnected => {
                debug!("discovery completion while disconnected, ignored");
            }
        }
    }

    // ---- Operation queue & executor ------------------------------------

    fn alloc_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Pop and start queued tasks until one is in flight or the queue is
    /// empty. Tasks that fail before initiation are completed synchronously.
    fn next_task(&mut self) {
        while self.in_flight.is_none() {
            let Some(mut task) = self.queue.pop_front() else {
                return;
            };

            debug!("execute {}", task.kind());
            match self.prepare(&mut task) {
                Ok(()) => {
                    let seq = self.alloc_seq();
                    self.in_flight = Some(InFlight {
                        seq,
                        attempts: 0,
                        task,
                    });
                    self.try_initiate();
                }
                Err(err) => {
                    debug!("{} failed before initiation: {}", task.kind(), err);
                    task.fail(err);
                }
            }
        }
    }

    /// Resolve the task's target through the handle cache and verify the
    /// required capability; fill in lazily resolved handles on the task
    fn prepare(&mut self, task: &mut GattTask) -> Result<(), GattError> {
        if self.link.is_none() {
            return Err(GattError::NotConnected);
        }

        match task {
            GattTask::ReadCharacteristic { target, .. } => {
                let chara = self.resolve_target(target)?;
                if !chara.properties.can_read() {
                    return Err(GattError::CapabilityMissing);
                }
            }
            GattTask::WriteCharacteristic { target, mode, .. } => {
                let chara = self.resolve_target(target)?;
                if !chara.properties.can_write() && !chara.properties.can_write_without_response() {
                    return Err(GattError::CapabilityMissing);
                }
                *mode = corrected_mode(chara.properties, *mode);
            }
            GattTask::SplitWriteCharacteristic {
                target,
                mode,
                state,
                ..
            } => {
                let chara = self.resolve_target(target)?;
                if !chara.properties.can_write() && !chara.properties.can_write_without_response() {
                    return Err(GattError::CapabilityMissing);
                }
                *mode = corrected_mode(chara.properties, *mode);
                // Pacing follows the mode actually used, not the one asked for
                state.acknowledged = *mode == WriteMode::WithResponse;
            }
            GattTask::ReadDescriptor {
                target,
                descriptor,
                resolved,
                ..
            }
            | GattTask::WriteDescriptor {
                target,
                descriptor,
                resolved,
                ..
            } => {
                let chara = self.resolve_target(target)?;
                *resolved = Some(
                    chara
                        .descriptor(descriptor)
                        .ok_or(GattError::AttributeNotFound)?
                        .clone(),
                );
            }
            GattTask::EnableNotification { target, cccd, .. } => {
                let chara = self.resolve_target(target)?;
                if !chara.properties.can_notify() && !chara.properties.can_indicate() {
                    return Err(GattError::CapabilityMissing);
                }
                *cccd = Some(
                    chara
                        .descriptor(&Uuid::from_u16(CLIENT_CHAR_CONFIG_UUID))
                        .ok_or(GattError::AttributeNotFound)?
                        .clone(),
                );
                // Route value changes locally before the CCCD write goes out
                let link = self.link.ok_or(GattError::NotConnected)?;
                if !self.transport.set_notification_enabled(link, &chara, true) {
                    return Err(GattError::TransportFailure(GattStatus::FAILURE));
                }
            }
            GattTask::DisableNotification {
                target,
                cccd,
                callback,
            } => {
                // Unregister first: a racing value change must not reach a
                // subscriber whose disable is already in flight
                let chara_uuid = match target {
                    Target::ByUuid { characteristic, .. } => *characteristic,
                    Target::Resolved(chara) => chara.uuid,
                };
                *callback = self.registry.remove(&chara_uuid);

                let chara = self.resolve_target(target)?;
                *cccd = Some(
                    chara
                        .descriptor(&Uuid::from_u16(CLIENT_CHAR_CONFIG_UUID))
                        .ok_or(GattError::AttributeNotFound)?
                        .clone(),
                );
                if let Some(link) = self.link {
                    let stopped = self.transport.set_notification_enabled(link, &chara, false);
                    debug!("set_notification_enabled(false) -> {}", stopped);
                }
            }
            GattTask::UpdateMtu { .. }
            | GattTask::UpdatePhy { .. }
            | GattTask::ReadPhy { .. }
            | GattTask::ReadSignalStrength { .. } => {}
        }

        Ok(())
    }

    fn resolve_target(&mut self, target: &mut Target) -> Result<Characteristic, GattError> {
        match target {
            Target::Resolved(chara) => Ok(chara.clone()),
            Target::ByUuid {
                service,
                characteristic,
            } => {
                let chara = self
                    .cache
                    .characteristic(service, characteristic, &self.attrs)
                    .ok_or(GattError::AttributeNotFound)?;
                *target = Target::Resolved(chara.clone());
                Ok(chara)
            }
        }
    }

    /// Attempt initiation of the in-flight task's current unit. Never
    /// advances the queue itself; callers check `in_flight` afterwards.
    fn try_initiate(&mut self) {
        let Some(link) = self.link else {
            self.fail_in_flight(GattError::NotConnected);
            return;
        };

        let transport = Arc::clone(&self.transport);
        let Some(fl) = self.in_flight.as_mut() else {
            return;
        };
        let seq = fl.seq;

        match initiate(transport.as_ref(), link, &mut fl.task) {
            InitiateOutcome::Accepted => {
                fl.attempts = 0;
            }
            InitiateOutcome::AcceptedChunk { arm_next, interval } => {
                fl.attempts = 0;
                if arm_next {
                    self.arm_timer(interval, seq, TimerEvent::NextChunk);
                }
            }
            InitiateOutcome::EmptySplit => {
                if let Some(GattTask::SplitWriteCharacteristic { callback, .. }) =
                    self.finish_in_flight()
                {
                    if let Some(cb) = callback {
                        cb(Ok(()));
                    }
                }
            }
            InitiateOutcome::Busy => {
                fl.attempts += 1;
                let attempts = fl.attempts;
                if attempts >= BUSY_RETRY_LIMIT {
                    warn!("initiation busy {} times, giving up", attempts);
                    self.fail_in_flight(GattError::Busy { attempts });
                } else {
                    trace!("initiation busy, retry {}", attempts);
                    self.arm_timer(BUSY_RETRY_DELAY, seq, TimerEvent::Retry);
                }
            }
            InitiateOutcome::Unresolvable => {
                self.fail_in_flight(GattError::AttributeNotFound);
            }
        }
    }

    /// Fail the in-flight task, reversing the transport-local notification
    /// flag if the task was an unfinished subscription
    fn fail_in_flight(&mut self, err: GattError) {
        if let Some(fl) = self.in_flight.take() {
            if let GattTask::EnableNotification { target, .. } = &fl.task {
                if let (Some(link), Some(chara)) = (self.link, target.characteristic()) {
                    self.transport.set_notification_enabled(link, chara, false);
                }
            }
            fl.task.fail(err);
        }
    }

    fn finish_in_flight(&mut self) -> Option<GattTask> {
        self.in_flight.take().map(|fl| fl.task)
    }

    // ---- Completion dispatcher -----------------------------------------

    fn on_read_completion(&mut self, status: GattStatus, value: Vec<u8>, descriptor: bool) {
        let matched = match self.in_flight.as_ref().map(|fl| &fl.task) {
            Some(GattTask::ReadCharacteristic { .. }) => !descriptor,
            Some(GattTask::ReadDescriptor { .. }) => descriptor,
            _ => false,
        };
        if !matched {
            debug!("unmatched read completion, ignored");
            return;
        }

        let callback = match self.finish_in_flight() {
            Some(GattTask::ReadCharacteristic { callback, .. })
            | Some(GattTask::ReadDescriptor { callback, .. }) => callback,
            _ => None,
        };
        if let Some(cb) = callback {
            if status.is_success() {
                trace!("read ok: {}", hex::encode(&value));
                cb(Ok(value));
            } else {
                cb(Err(GattError::TransportFailure(status)));
            }
        }
        self.next_task();
    }

    fn on_characteristic_write(&mut self, status: GattStatus) {
        match self.in_flight.as_ref().map(|fl| &fl.task) {
            Some(GattTask::WriteCharacteristic { .. }) => {
                if let Some(GattTask::WriteCharacteristic { callback, .. }) =
                    self.finish_in_flight()
                {
                    if let Some(cb) = callback {
                        if status.is_success() {
                            cb(Ok(()));
                        } else {
                            cb(Err(GattError::TransportFailure(status)));
                        }
                    }
                }
                self.next_task();
            }
            Some(GattTask::SplitWriteCharacteristic { .. }) => {
                self.on_split_chunk_completion(status);
            }
            _ => debug!("unmatched characteristic write completion, ignored"),
        }
    }

    fn on_split_chunk_completion(&mut self, status: GattStatus) {
        let (seq, decision) = {
            let Some(fl) = self.in_flight.as_mut() else {
                return;
            };
            let GattTask::SplitWriteCharacteristic { state, .. } = &mut fl.task else {
                return;
            };

            state.completed += 1;
            if !status.is_success() && state.failed_status.is_none() {
                state.failed_status = Some(status);
            }

            let decision = if state.acknowledged {
                if !status.is_success() {
                    // Abort: remaining chunks are never sent
                    SplitDecision::Fail(status)
                } else if state.chunks.is_empty() {
                    SplitDecision::Succeed
                } else {
                    SplitDecision::ArmNext(state.interval)
                }
            } else {
                // Send-through-failure: the run always finishes, and the
                // verdict waits for the terminal chunk's completion
                if state.chunks.is_empty() && state.completed >= state.sent {
                    match state.failed_status {
                        Some(status) => SplitDecision::Fail(status),
                        None => SplitDecision::Succeed,
                    }
                } else {
                    SplitDecision::Wait
                }
            };
            (fl.seq, decision)
        };

        match decision {
            SplitDecision::Fail(status) => {
                if let Some(GattTask::SplitWriteCharacteristic { callback, .. }) =
                    self.finish_in_flight()
                {
                    if let Some(cb) = callback {
                        cb(Err(GattError::TransportFailure(status)));
                    }
                }
                self.next_task();
            }
            SplitDecision::Succeed => {
                if let Some(GattTask::SplitWriteCharacteristic { callback, .. }) =
                    self.finish_in_flight()
                {
                    if let Some(cb) = callback {
                        cb(Ok(()));
                    }
                }
                self.next_task();
            }
            SplitDecision::ArmNext(interval) => {
                self.arm_timer(interval, seq, TimerEvent::NextChunk);
            }
            SplitDecision::Wait => {}
        }
    }

    fn on_descriptor_write(&mut self, status: GattStatus) {
        match self.in_flight.as_ref().map(|fl| &fl.task) {
            Some(GattTask::EnableNotification { .. }) => {
                if let Some(GattTask::EnableNotification {
                    target, callback, ..
                }) = self.finish_in_flight()
                {
                    let chara = target.characteristic().cloned();
                    if status.is_success() {
                        if let Some(chara) = &chara {
                            self.registry.insert(chara.uuid, Arc::clone(&callback));
                        }
                        callback.on_enabled();
                    } else {
                        if let (Some(link), Some(chara)) = (self.link, &chara) {
                            self.transport.set_notification_enabled(link, chara, false);
                        }
                        callback.on_disabled();
                    }
                }
                self.next_task();
            }
            Some(GattTask::DisableNotification { .. }) => {
                if let Some(GattTask::DisableNotification { callback, .. }) =
                    self.finish_in_flight()
                {
                    if let Some(cb) = callback {
                        cb.on_disabled();
                    }
                }
                self.next_task();
            }
            Some(GattTask::WriteDescriptor { .. }) => {
                if let Some(GattTask::WriteDescriptor { callback, .. }) = self.finish_in_flight() {
                    if let Some(cb) = callback {
                        if status.is_success() {
                            cb(Ok(()));
                        } else {
                            cb(Err(GattError::TransportFailure(status)));
                        }
                    }
                }
                self.next_task();
            }
            _ => debug!("unmatched descriptor write completion, ignored"),
        }
    }

    fn on_mtu_changed(&mut self, status: GattStatus, mtu: u16) {
        if !matches!(
            self.in_flight.as_ref().map(|fl| &fl.task),
            Some(GattTask::UpdateMtu { .. })
        ) {
            debug!("unmatched mtu completion, ignored");
            return;
        }

        if let Some(GattTask::UpdateMtu { callback, .. }) = self.finish_in_flight() {
            if status.is_success() {
                self.shared.set_mtu(mtu);
                if let Some(cb) = callback {
                    cb(Ok(mtu));
                }
            } else if let Some(cb) = callback {
                cb(Err(GattError::TransportFailure(status)));
            }
        }
        self.next_task();
    }

    fn on_phy_completion(
        &mut self,
        status: GattStatus,
        tx_phy: crate::transport::Phy,
        rx_phy: crate::transport::Phy,
        update: bool,
    ) {
        let matched = match self.in_flight.as_ref().map(|fl| &fl.task) {
            Some(GattTask::UpdatePhy { .. }) => update,
            Some(GattTask::ReadPhy { .. }) => !update,
            _ => false,
        };
        if !matched {
            debug!("unmatched phy completion, ignored");
            return;
        }

        let callback = match self.finish_in_flight() {
            Some(GattTask::UpdatePhy { callback, .. }) | Some(GattTask::ReadPhy { callback }) => {
                callback
            }
            _ => None,
        };
        if let Some(cb) = callback {
            if status.is_success() {
                cb(Ok(crate::device::task::PhyValue { tx_phy, rx_phy }));
            } else {
                cb(Err(GattError::TransportFailure(status)));
            }
        }
        self.next_task();
    }

    fn on_signal_strength(&mut self, status: GattStatus, rssi: i16) {
        if !matches!(
            self.in_flight.as_ref().map(|fl| &fl.task),
            Some(GattTask::ReadSignalStrength { .. })
        ) {
            debug!("unmatched signal strength completion, ignored");
            return;
        }

        if let Some(GattTask::ReadSignalStrength { callback }) = self.finish_in_flight() {
            if let Some(cb) = callback {
                if status.is_success() {
                    cb(Ok(rssi));
                } else {
                    cb(Err(GattError::TransportFailure(status)));
                }
            }
        }
        self.next_task();
    }

    // ---- Timers --------------------------------------------------------

    fn arm_timer(&mut self, delay: Duration, seq: u64, event: TimerEvent) {
        self.timers.push(Timer {
            due: Instant::now() + delay,
            seq,
            event,
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.due).min()
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].due <= now {
                due.push(self.timers.swap_remove(i));
            } else {
                i += 1;
            }
        }

        due.sort_by_key(|t| t.due);
        for timer in due {
            self.on_timer(timer);
        }
    }

    fn on_timer(&mut self, timer: Timer) {
        match timer.event {
            TimerEvent::OpenLink => self.open_link(),
            TimerEvent::Retry | TimerEvent::NextChunk => {
                if self.in_flight.as_ref().map(|fl| fl.seq) != Some(timer.seq) {
                    trace!("stale {:?} timer ignored", timer.event);
                    return;
                }
                self.try_initiate();
                if self.in_flight.is_none() {
                    self.next_task();
                }
            }
        }
    }
}

/// Pick the write mode the characteristic actually supports, preferring the
/// requested one
fn corrected_mode(props: CharacteristicProperties, requested: WriteMode) -> WriteMode {
    match requested {
        WriteMode::WithoutResponse if !props.can_write_without_response() => {
            WriteMode::WithResponse
        }
        WriteMode::WithResponse if !props.can_write() => WriteMode::WithoutResponse,
        mode => mode,
    }
}

/// Hand the in-flight task's current unit to the transport
fn initiate(
    transport: &dyn GattTransport,
    link: LinkHandle,
    task: &mut GattTask,
) -> InitiateOutcome {
    match task {
        GattTask::ReadCharacteristic { target, .. } => match target.characteristic() {
            Some(chara) => transport.read_characteristic(link, chara).into(),
            None => InitiateOutcome::Unresolvable,
        },
        GattTask::WriteCharacteristic {
            target,
            value,
            mode,
            ..
        } => match target.characteristic() {
            Some(chara) => transport
                .write_characteristic(link, chara, value, *mode)
                .into(),
            None => InitiateOutcome::Unresolvable,
        },
        GattTask::SplitWriteCharacteristic {
            target,
            mode,
            state,
            progress,
            ..
        } => {
            let Some(chara) = target.characteristic() else {
                return InitiateOutcome::Unresolvable;
            };
            let Some(chunk) = state.chunks.front() else {
                return if state.sent == 0 {
                    InitiateOutcome::EmptySplit
                } else {
                    // All chunks out already; completions are pending
                    InitiateOutcome::Accepted
                };
            };

            match transport.write_characteristic(link, chara, chunk, *mode) {
                Initiation::Accepted => {
                    state.chunks.pop_front();
                    state.sent += 1;
                    progress(state.sent, state.total);
                    InitiateOutcome::AcceptedChunk {
                        arm_next: !state.acknowledged && !state.chunks.is_empty(),
                        interval: state.interval,
                    }
                }
                Initiation::Busy => InitiateOutcome::Busy,
            }
        }
        GattTask::ReadDescriptor { resolved, .. } => match resolved {
            Some(desc) => transport.read_descriptor(link, desc).into(),
            None => InitiateOutcome::Unresolvable,
        },
        GattTask::WriteDescriptor {
            resolved, value, ..
        } => match resolved {
            Some(desc) => transport.write_descriptor(link, desc, value).into(),
            None => InitiateOutcome::Unresolvable,
        },
        GattTask::EnableNotification { target, cccd, .. } => {
            let (Some(chara), Some(desc)) = (target.characteristic(), cccd.as_ref()) else {
                return InitiateOutcome::Unresolvable;
            };
            // Indicate-only characteristics get the indication value
            let value: &[u8] = if chara.properties.can_notify() {
                &ENABLE_NOTIFICATION_VALUE
            } else {
                &ENABLE_INDICATION_VALUE
            };
            transport.write_descriptor(link, desc, value).into()
        }
        GattTask::DisableNotification { cccd, .. } => match cccd {
            Some(desc) => transport
                .write_descriptor(link, desc, &DISABLE_NOTIFICATION_VALUE)
                .into(),
            None => InitiateOutcome::Unresolvable,
        },
        GattTask::UpdateMtu { mtu, .. } => transport.request_mtu(link, *mtu).into(),
        GattTask::UpdatePhy {
            tx_phy,
            rx_phy,
            options,
            ..
        } => transport
            .set_preferred_phy(link, *tx_phy, *rx_phy, *options)
            .into(),
        GattTask::ReadPhy { .. } => transport.read_phy(link).into(),
        GattTask::ReadSignalStrength { .. } => transport.read_signal_strength(link).into(),
    }
}
