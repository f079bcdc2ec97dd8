//! Host-side redirection engine
//!
//! A [`Host`] owns the real device through a [`UsbBackend`] and translates
//! guest requests arriving over a [`Channel`](crate::Channel) into device
//! I/O: it claims interfaces, tracks the configuration and alternate
//! setting state, keeps per-endpoint transfer rings running for streaming
//! endpoints, forwards individual control/bulk/interrupt transfers, and
//! reports every outcome back over the wire.
//!
//! Two execution contexts meet here: the protocol context calling
//! [`do_read`](Host::do_read)/[`do_write`](Host::do_write), and the
//! device-event context delivering completions through
//! [`handle_events`](Host::handle_events) (typically a dedicated thread).
//! A single host lock guards the transfer bookkeeping, a separate
//! disconnect lock guards the disconnect transition, and the parser brings
//! its own queue lock; the locks are always taken in that order.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use fugit::MicrosDurationU32;
use log::{debug, error, info, warn};
use spin::{Mutex, RwLock};
use usb_device::control::{Recipient, Request};

use crate::backend::{
    BackendError, Completion, SetupPacket, Submission, SubmissionKind, SubmitError,
    TransferStatus, TransferToken, UsbBackend, BULK_TIMEOUT, CTRL_TIMEOUT, INTERRUPT_TIMEOUT,
    ISO_TIMEOUT,
};
use crate::caps::{Cap, Caps};
use crate::filter;
use crate::parser::{PacketSink, Parser, ParserOptions, ReadError};
use crate::proto::*;
use crate::types::{
    EndpointAddress, Speed, Status, TransferKind, MAX_ENDPOINT_SLOTS, MAX_INTERFACES,
};
use crate::{Channel, ChannelError};

/// Transfers per endpoint ring.
const MAX_TRANSFER_COUNT: usize = 16;
const MAX_PACKETS_PER_TRANSFER: u8 = 32;
/// Ring depth used for interrupt receiving.
const INTERRUPT_TRANSFER_COUNT: u8 = 5;
/// How long each pump iteration waits while draining cancellations.
const DRAIN_POLL_INTERVAL: MicrosDurationU32 = MicrosDurationU32::micros(2500);
/// USB 2 runs at most ~8000 packets/sec, so 800 queued packets mean we have
/// buffered more than 0.1 sec and the connection is not keeping up.
const QUEUED_PACKET_DROP_LIMIT: usize = 800;

/// Devices that break when reset; their quirk skips every reset the engine
/// would otherwise perform.
const RESET_BLACKLIST: &[(u16, u16)] = &[(0x1210, 0x001c), (0x2798, 0x0001)];

/// Error returned by [`Host::do_read`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HostReadError {
    /// A packet violated the framing rules; the session survives.
    Parse,
    /// The channel failed.
    Channel(ChannelError),
    /// The peer's filter rejected the device.
    DeviceRejected,
    /// The device cannot be used any more (failed reset or reclaim).
    DeviceLost,
}

/// Construction options for a [`Host`].
#[derive(Clone, Copy, Debug, Default)]
pub struct HostOptions {
    /// The channel takes ownership of written buffers (zero-copy mode).
    pub write_cb_owns_buffer: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PendingRead {
    Rejected,
    Lost,
}

/// Where a stream transfer currently lives.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TransferStage {
    /// Owned by the ring; for output streams the index of the next packet
    /// to stage into it.
    Staging(usize),
    /// In flight in the device layer.
    Submitted,
}

/// The originating request header, kept so cancellations and completions
/// can mirror it back.
#[derive(Clone, Copy, Debug)]
enum DataPacketHeader {
    Control(ControlPacketHeader),
    Bulk(BulkPacketHeader),
    Interrupt(InterruptPacketHeader),
}

/// An individually submitted (non-stream) transfer.
struct NonStreamTransfer {
    token: TransferToken,
    id: u64,
    cancelled: bool,
    ep: EndpointAddress,
    header: DataPacketHeader,
}

/// One slot of an endpoint's transfer ring.
struct StreamTransfer {
    token: TransferToken,
    id: u64,
    stage: TransferStage,
    /// Present while the ring owns the bytes (staging); travels to the
    /// backend while submitted.
    buffer: Option<Vec<u8>>,
    /// Per-packet lengths staged so far (iso output).
    packet_lengths: Vec<u32>,
}

/// Per-endpoint-slot state.
struct EpSlot {
    kind: TransferKind,
    interval: u8,
    interface: u8,
    /// Effective max packet size (high-speed iso multiplier applied).
    max_packet_size: u32,
    max_streams: u32,
    warn_on_drop: bool,
    stream_started: bool,
    pkts_per_transfer: u8,
    transfer_count: u8,
    pkt_size: u32,
    out_idx: usize,
    drop_packets: usize,
    ring: [Option<StreamTransfer>; MAX_TRANSFER_COUNT],
}

impl EpSlot {
    fn new() -> Self {
        EpSlot {
            kind: TransferKind::Invalid,
            interval: 0,
            interface: 0,
            max_packet_size: 0,
            max_streams: 0,
            warn_on_drop: false,
            stream_started: false,
            pkts_per_transfer: 0,
            transfer_count: 0,
            pkt_size: 0,
            out_idx: 0,
            drop_packets: 0,
            ring: Default::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct IsoThreshold {
    higher: u64,
    lower: u64,
    dropping: bool,
}

/// Everything guarded by the host lock.
struct Engine {
    desc: Option<crate::backend::DeviceInfo>,
    config: Option<crate::backend::ConfigInfo>,
    restore_config: i32,
    claimed: bool,
    reset: bool,
    do_not_reset: bool,
    alt_setting: [u8; MAX_INTERFACES],
    endpoints: [EpSlot; MAX_ENDPOINT_SLOTS],
    transfers: Vec<NonStreamTransfer>,
    /// Tokens of cancelled stream transfers whose completion is still
    /// outstanding.
    pending_cancels: Vec<TransferToken>,
    next_token: u64,
    iso_threshold: IsoThreshold,
    filter_rules: Option<Vec<filter::Rule>>,
    read_status: Option<PendingRead>,
}

impl Engine {
    fn new() -> Self {
        Engine {
            desc: None,
            config: None,
            restore_config: -1,
            claimed: false,
            reset: false,
            do_not_reset: false,
            alt_setting: [0; MAX_INTERFACES],
            endpoints: core::array::from_fn(|_| EpSlot::new()),
            transfers: Vec::new(),
            pending_cancels: Vec::new(),
            next_token: 1,
            iso_threshold: IsoThreshold::default(),
            filter_rules: None,
            read_status: None,
        }
    }

    fn take_token(&mut self) -> TransferToken {
        let token = TransferToken(self.next_token);
        self.next_token += 1;
        token
    }

    /// Index into `config.interfaces` for a `bInterfaceNumber`.
    fn interface_index(&self, number: u8) -> Option<usize> {
        let config = self.config.as_ref()?;
        let idx = config.interfaces.iter().position(|i| i.number == number);
        if idx.is_none() {
            error!("invalid interface number: {}", number);
        }
        idx
    }

    fn interface_numbers(&self) -> Vec<u8> {
        self.config
            .iter()
            .flat_map(|c| c.interfaces.iter().map(|i| i.number))
            .collect()
    }
}

enum IsoResult {
    Ok,
    /// This packet is borked, carry on with the next packet / transfer.
    PacketError,
    /// The whole stream is done for: stopped, stalled or device gone.
    StreamStopped,
}

/// The host-side redirection engine.
///
/// All methods take `&self`; see the module docs for the locking model.
pub struct Host<B: UsbBackend> {
    parser: Parser,
    device: RwLock<Option<Arc<B>>>,
    state: Mutex<Engine>,
    disconnect_lock: Mutex<()>,
    disconnected: AtomicBool,
    wait_disconnect: AtomicBool,
    connect_pending: AtomicBool,
    write_cb_owns_buffer: bool,
    buffered_size_hook: RwLock<Option<Box<dyn Fn() -> u64 + Send + Sync>>>,
    flush_hook: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl<B: UsbBackend> Host<B> {
    /// Creates an engine with no device attached.
    ///
    /// Queues the initial `hello` advertising the full host capability
    /// set. Attach a device with [`set_device`](Host::set_device).
    pub fn new(version: &str, options: HostOptions) -> Self {
        // The session layer adds device_disconnect_ack itself for host
        // sessions
        let mut caps = Caps::none();
        caps.set(Cap::ConnectDeviceVersion);
        caps.set(Cap::Filter);
        caps.set(Cap::EpInfoMaxPacketSize);
        caps.set(Cap::Ids64Bits);
        caps.set(Cap::BulkLength32Bits);
        caps.set(Cap::BulkReceiving);
        caps.set(Cap::BulkStreams);

        Host {
            parser: Parser::new(
                Role::Host,
                version,
                caps,
                ParserOptions {
                    no_hello: false,
                    write_cb_owns_buffer: options.write_cb_owns_buffer,
                },
            ),
            device: RwLock::new(None),
            state: Mutex::new(Engine::new()),
            disconnect_lock: Mutex::new(()),
            // No device is connected initially
            disconnected: AtomicBool::new(true),
            wait_disconnect: AtomicBool::new(false),
            connect_pending: AtomicBool::new(false),
            write_cb_owns_buffer: options.write_cb_owns_buffer,
            buffered_size_hook: RwLock::new(None),
            flush_hook: RwLock::new(None),
        }
    }

    /// Creates an engine and attaches `backend` right away.
    pub fn open(backend: B, version: &str, options: HostOptions) -> Result<Self, Status> {
        let host = Self::new(version, options);
        host.set_device(Some(backend))?;
        host.flush();
        Ok(host)
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    /// Whether the guest may currently use a device.
    pub fn connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    /// The most recent filter rules the guest pushed, if any.
    pub fn guest_filter(&self) -> Option<Vec<filter::Rule>> {
        self.state.lock().filter_rules.clone()
    }

    /// Install a callback reporting the embedder's buffered output size,
    /// used for isochronous backpressure in zero-copy mode.
    pub fn set_buffered_output_size_cb(&self, cb: Box<dyn Fn() -> u64 + Send + Sync>) {
        if !self.write_cb_owns_buffer {
            warn!("can't set callback as the engine owns the output buffer");
            return;
        }
        *self.buffered_size_hook.write() = Some(cb);
    }

    /// Install a callback invoked whenever freshly queued output should be
    /// flushed to the peer.
    pub fn set_flush_writes_cb(&self, cb: Box<dyn Fn() + Send + Sync>) {
        *self.flush_hook.write() = Some(cb);
    }

    fn flush(&self) {
        if let Some(f) = self.flush_hook.read().as_ref() {
            f();
        }
    }

    fn backend(&self) -> Option<Arc<B>> {
        self.device.read().clone()
    }

    /// Reads and dispatches guest requests until the channel would block.
    pub fn do_read<C: Channel>(&self, channel: &mut C) -> Result<(), HostReadError> {
        if let Some(status) = self.take_read_status() {
            return Err(status);
        }
        let result = {
            let mut sink = HostSink { host: self };
            self.parser.do_read(channel, &mut sink)
        };
        if let Some(status) = self.take_read_status() {
            return Err(status);
        }
        result.map_err(|e| match e {
            ReadError::Parse => HostReadError::Parse,
            ReadError::Channel(c) => HostReadError::Channel(c),
        })
    }

    fn take_read_status(&self) -> Option<HostReadError> {
        match self.state.lock().read_status.take() {
            Some(PendingRead::Rejected) => Some(HostReadError::DeviceRejected),
            Some(PendingRead::Lost) => Some(HostReadError::DeviceLost),
            None => None,
        }
    }

    /// Drains queued replies into the channel.
    pub fn do_write<C: Channel>(&self, channel: &mut C) -> Result<(), ChannelError> {
        match self.parser.do_write(channel) {
            Ok(()) => Ok(()),
            Err(crate::parser::WriteError::Channel(e)) => Err(e),
        }
    }

    pub fn has_data_to_write(&self) -> bool {
        self.parser.has_data_to_write()
    }

    pub fn buffered_output_size(&self) -> u64 {
        self.parser.buffered_output_size()
    }

    /// Pumps one device-layer completion, if any arrives within `timeout`.
    ///
    /// Returns whether a completion was handled. Typically driven from a
    /// dedicated event thread.
    pub fn handle_events(&self, timeout: MicrosDurationU32) -> bool {
        let Some(backend) = self.backend() else {
            return false;
        };
        match backend.poll_completion(timeout) {
            Some(completion) => {
                self.on_completion(completion);
                true
            }
            None => false,
        }
    }

    /// Attaches a device (clearing any previous one) or, with `None`,
    /// just detaches.
    ///
    /// On success the device is advertised to the guest, immediately or
    /// deferred until capability exchange / disconnect acknowledgement
    /// allows it.
    pub fn set_device(&self, backend: Option<B>) -> Result<(), Status> {
        self.clear_device();

        let Some(backend) = backend else {
            return Ok(());
        };
        *self.device.write() = Some(Arc::new(backend));

        if let Err(status) = self.claim(true) {
            self.clear_device();
            return Err(status);
        }

        {
            let mut st = self.state.lock();
            if let Some(desc) = st.desc {
                if RESET_BLACKLIST.contains(&(desc.vendor_id, desc.product_id)) {
                    st.do_not_reset = true;
                }
            }
        }

        // The first thing almost any guest does is a (slow) device reset,
        // so do that beforehand
        if let Err(e) = self.reset_device() {
            return Err(self.backend_error_status(e));
        }

        self.send_device_connect();
        Ok(())
    }

    fn clear_device(&self) {
        if self.device.read().is_none() {
            return;
        }

        if self.cancel_pending_transfers(false) {
            self.wait_for_cancel_completion();
        }

        self.release(true);

        {
            let mut st = self.state.lock();
            st.config = None;
            st.desc = None;
            st.do_not_reset = false;
        }

        // Dropping the last reference closes the device
        *self.device.write() = None;

        self.connect_pending.store(false, Ordering::SeqCst);
        self.handle_disconnect();
        self.flush();
    }

    /// Reads descriptors and claims every interface of the active
    /// configuration.
    fn claim(&self, initial_claim: bool) -> Result<(), Status> {
        let Some(backend) = self.backend() else {
            return Err(Status::Ioerror);
        };
        let mut st = self.state.lock();
        st.config = None;

        let desc = match backend.device_info() {
            Ok(d) => d,
            Err(e) => {
                error!("could not get device descriptor: {:?}", e);
                return Err(self.backend_error_status(e));
            }
        };
        st.desc = Some(desc);

        let config = match backend.active_config() {
            Ok(c) => c,
            Err(BackendError::NotFound) => None, // unconfigured is allowed
            Err(e) => {
                error!("could not get descriptors for active configuration: {:?}", e);
                return Err(self.backend_error_status(e));
            }
        };
        if let Some(config) = &config {
            if config.interfaces.len() > MAX_INTERFACES {
                error!(
                    "configuration has too many interfaces ({} > {})",
                    config.interfaces.len(),
                    MAX_INTERFACES
                );
                return Err(Status::Ioerror);
            }
        }
        st.config = config;

        if initial_claim {
            st.restore_config = st
                .config
                .as_ref()
                .map(|c| c.configuration_value as i32)
                .unwrap_or(-1);

            // If the device is unconfigured but has only one config, assume
            // the user did a "safely remove" and remember that config so the
            // device becomes usable again on release
            if st.restore_config == -1 && desc.num_configurations == 1 {
                if let Ok(config) = backend.config_info(0) {
                    st.restore_config = config.configuration_value as i32;
                }
            }
        }

        // All interfaces begin at alt setting 0 when (re)claimed
        st.alt_setting = [0; MAX_INTERFACES];

        st.claimed = true;
        let _ = backend.set_auto_detach_kernel_driver(true);

        for number in st.interface_numbers() {
            if let Err(e) = backend.claim_interface(number) {
                if e == BackendError::Busy {
                    error!("device is in use by another application");
                } else {
                    error!("could not claim interface {}: {:?}", number, e);
                }
                return Err(self.backend_error_status(e));
            }
        }

        self.parse_config(&mut st);
        Ok(())
    }

    /// Releases all claimed interfaces; with `attach_drivers` also hands
    /// the device back to the OS (reset, configuration restore, driver
    /// re-attach).
    fn release(&self, attach_drivers: bool) {
        let Some(backend) = self.backend() else {
            return;
        };
        let mut st = self.state.lock();
        if !st.claimed {
            return;
        }

        // The engine re-attaches drivers itself: compound interfaces must
        // all be released before any driver can bind, and before a
        // set_configuration no driver must bind at all
        let _ = backend.set_auto_detach_kernel_driver(false);

        let numbers = st.interface_numbers();
        for number in &numbers {
            match backend.release_interface(*number) {
                Ok(()) | Err(BackendError::NotFound) | Err(BackendError::NoDevice) => {}
                Err(e) => error!("could not release interface {}: {:?}", number, e),
            }
        }

        if !attach_drivers {
            return;
        }
        st.claimed = false;

        // Reset before re-binding kernel drivers, so they get the device in
        // a clean state
        if !st.do_not_reset {
            if let Err(e) = backend.reset_device() {
                // When the device was unplugged the reset fails; not worth a
                // warning then
                if e != BackendError::NoDevice {
                    error!("error resetting device: {:?}", e);
                }
                return;
            }
        }

        let current_config = st
            .config
            .as_ref()
            .map(|c| c.configuration_value as i32)
            .unwrap_or(-1);
        if current_config != st.restore_config {
            if let Err(e) = backend.set_configuration(st.restore_config) {
                error!("could not restore configuration to {}: {:?}", st.restore_config, e);
            }
            return; // set_configuration binds drivers for the new config itself
        }

        for number in &numbers {
            match backend.attach_kernel_driver(*number) {
                Ok(())
                | Err(BackendError::NotFound)
                | Err(BackendError::NoDevice)
                | Err(BackendError::NotSupported)
                | Err(BackendError::Busy) => {}
                Err(e) => error!("could not re-attach driver to interface {}: {:?}", number, e),
            }
        }
    }

    /// Resets the device unless its quirk forbids it; failure clears the
    /// device.
    fn reset_device(&self) -> Result<(), BackendError> {
        if self.state.lock().do_not_reset {
            return Ok(());
        }
        let Some(backend) = self.backend() else {
            return Err(BackendError::NoDevice);
        };
        if let Err(e) = backend.reset_device() {
            error!("error resetting device: {:?}", e);
            self.clear_device();
            return Err(e);
        }
        self.state.lock().reset = true;
        Ok(())
    }

    /// Rebuilds the endpoint table from the active configuration.
    fn parse_config(&self, st: &mut Engine) {
        for (i, slot) in st.endpoints.iter_mut().enumerate() {
            slot.kind = if i & 0x0f == 0 {
                TransferKind::Control
            } else {
                TransferKind::Invalid
            };
            slot.interval = 0;
            slot.interface = 0;
            slot.max_packet_size = 0;
            slot.max_streams = 0;
        }
        let count = st.config.as_ref().map(|c| c.interfaces.len()).unwrap_or(0);
        for i in 0..count {
            self.parse_interface(st, i);
        }
    }

    /// Folds one interface's current alternate setting into the endpoint
    /// table.
    fn parse_interface(&self, st: &mut Engine, idx: usize) {
        let speed = st.desc.map(|d| d.speed).unwrap_or(Speed::Unknown);
        let (number, endpoints) = {
            let Some(config) = st.config.as_ref() else {
                return;
            };
            let intf = &config.interfaces[idx];
            let alt = st.alt_setting[idx] as usize;
            let Some(alt_desc) = intf.alt_settings.get(alt) else {
                warn!("interface {} has no alt setting {}", intf.number, alt);
                return;
            };
            (intf.number, alt_desc.endpoints.clone())
        };

        for ep in endpoints {
            let slot = &mut st.endpoints[ep.address.slot()];
            slot.kind = TransferKind::from_wire(ep.kind & 0x03);
            slot.interval = ep.interval;
            slot.interface = number;

            // High-speed high-bandwidth iso endpoints encode a packet
            // multiplier in wMaxPacketSize bits 11-12
            let maxp = (ep.max_packet_size & 0x7ff) as u32;
            let mult = if speed == Speed::High && slot.kind == TransferKind::Isochronous {
                match (ep.max_packet_size >> 11) & 3 {
                    1 => 2,
                    2 => 3,
                    _ => 1,
                }
            } else {
                1
            };
            slot.max_packet_size = maxp * mult;
            slot.max_streams = if slot.kind == TransferKind::Bulk {
                ep.max_streams
            } else {
                0
            };
            slot.warn_on_drop = true;
        }
    }

    fn send_interface_n_ep_info(&self, st: &Engine) {
        let mut interface_info = InterfaceInfoHeader::default();
        if let Some(config) = &st.config {
            interface_info.interface_count = config.interfaces.len() as u32;
            for (i, intf) in config.interfaces.iter().enumerate() {
                let alt = st.alt_setting[i] as usize;
                let Some(alt_desc) = intf.alt_settings.get(alt) else {
                    continue;
                };
                interface_info.interface[i] = intf.number;
                interface_info.interface_class[i] = alt_desc.class;
                interface_info.interface_subclass[i] = alt_desc.subclass;
                interface_info.interface_protocol[i] = alt_desc.protocol;
            }
        }
        self.parser
            .queue_packet(0, &TypeHeader::InterfaceInfo(interface_info), &[]);

        let mut ep_info = EpInfoHeader::default();
        for (i, slot) in st.endpoints.iter().enumerate() {
            ep_info.kind[i] = slot.kind as u8;
            ep_info.interval[i] = slot.interval;
            ep_info.interface[i] = slot.interface;
            ep_info.max_packet_size[i] = slot.max_packet_size as u16;
            ep_info.max_streams[i] = slot.max_streams;
        }
        self.parser.queue_packet(0, &TypeHeader::EpInfo(ep_info), &[]);
    }

    /// Advertises the current device, or records that the advertisement is
    /// pending on the capability exchange / a disconnect acknowledgement.
    fn send_device_connect(&self) {
        if !self.disconnected.load(Ordering::SeqCst) {
            error!("internal error sending device_connect but already connected");
            return;
        }
        if !self.parser.have_peer_caps() || self.wait_disconnect.load(Ordering::SeqCst) {
            self.connect_pending.store(true, Ordering::SeqCst);
            return;
        }

        let st = self.state.lock();
        let Some(desc) = st.desc else {
            return;
        };
        let device_connect = DeviceConnectHeader {
            speed: desc.speed as u8,
            device_class: desc.device_class,
            device_subclass: desc.device_subclass,
            device_protocol: desc.device_protocol,
            vendor_id: desc.vendor_id,
            product_id: desc.product_id,
            device_version_bcd: desc.device_version_bcd,
        };
        self.send_interface_n_ep_info(&st);
        self.parser
            .queue_packet(0, &TypeHeader::DeviceConnect(device_connect), &[]);
        drop(st);

        self.connect_pending.store(false, Ordering::SeqCst);
        // The guest may now use the device
        self.disconnected.store(false, Ordering::SeqCst);
        self.flush();
    }

    /// Marks the device gone and tells the guest, exactly once.
    ///
    /// Uses its own lock so it can be called both with and without the
    /// host lock held.
    fn handle_disconnect(&self) {
        let _guard = self.disconnect_lock.lock();
        if !self.disconnected.load(Ordering::SeqCst) {
            info!("device disconnected");
            self.parser
                .queue_packet(0, &TypeHeader::DeviceDisconnect, &[]);
            if self.parser.peer_has_cap(Cap::DeviceDisconnectAck) {
                self.wait_disconnect.store(true, Ordering::SeqCst);
            }
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    /// Converts a device-layer completion code to the wire status,
    /// triggering the disconnect path where applicable.
    fn completion_status(&self, status: TransferStatus) -> Status {
        match status {
            TransferStatus::Completed => Status::Success,
            TransferStatus::Cancelled => Status::Cancelled,
            TransferStatus::Stall => Status::Stall,
            TransferStatus::TimedOut => Status::Timeout,
            TransferStatus::Overflow => Status::Babble,
            TransferStatus::NoDevice => {
                self.handle_disconnect();
                Status::Ioerror
            }
            TransferStatus::Error => Status::Ioerror,
        }
    }

    /// Converts a synchronous device-layer error to the wire status,
    /// triggering the disconnect path where applicable.
    fn backend_error_status(&self, error: BackendError) -> Status {
        match error {
            BackendError::InvalidParam => Status::Inval,
            BackendError::Timeout => Status::Timeout,
            BackendError::NoDevice => {
                self.handle_disconnect();
                Status::Ioerror
            }
            _ => Status::Ioerror,
        }
    }

    /*** Streams ***/

    fn send_stream_status(&self, st: &Engine, id: u64, ep: EndpointAddress, status: Status) {
        match st.endpoints[ep.slot()].kind {
            TransferKind::Isochronous => {
                let header = IsoStreamStatusHeader {
                    status: status as u8,
                    endpoint: ep.0,
                };
                self.parser
                    .queue_packet(id, &TypeHeader::IsoStreamStatus(header), &[]);
            }
            TransferKind::Bulk => {
                let header = BulkReceivingStatusHeader {
                    stream_id: 0,
                    endpoint: ep.0,
                    status: status as u8,
                };
                self.parser
                    .queue_packet(id, &TypeHeader::BulkReceivingStatus(header), &[]);
            }
            TransferKind::Interrupt => {
                let header = InterruptReceivingStatusHeader {
                    status: status as u8,
                    endpoint: ep.0,
                };
                self.parser
                    .queue_packet(id, &TypeHeader::InterruptReceivingStatus(header), &[]);
            }
            _ => {}
        }
    }

    fn set_iso_threshold(
        &self,
        st: &mut Engine,
        pkts_per_transfer: u8,
        transfer_count: u8,
        max_packetsize: u32,
    ) {
        let reference = pkts_per_transfer as u64 * transfer_count as u64 * max_packetsize as u64;
        st.iso_threshold.lower = reference / 2;
        st.iso_threshold.higher = reference * 3;
        debug!(
            "higher threshold is {} bytes | lower threshold is {} bytes",
            st.iso_threshold.higher, st.iso_threshold.lower
        );
    }

    fn can_write_iso_package(&self, st: &mut Engine) -> bool {
        let size = if self.write_cb_owns_buffer {
            match self.buffered_size_hook.read().as_ref() {
                Some(hook) => hook(),
                // The embedder is not dropping iso packets
                None => return true,
            }
        } else {
            self.parser.buffered_output_size()
        };

        if size >= st.iso_threshold.higher {
            if !st.iso_threshold.dropping {
                debug!(
                    "START dropping iso packets {} buffer > {} hi threshold",
                    size, st.iso_threshold.higher
                );
            }
            st.iso_threshold.dropping = true;
        } else if size < st.iso_threshold.lower {
            if st.iso_threshold.dropping {
                debug!(
                    "STOP dropping iso packets {} buffer < {} low threshold",
                    size, st.iso_threshold.lower
                );
            }
            st.iso_threshold.dropping = false;
        }

        !st.iso_threshold.dropping
    }

    /// Forwards one packet of stream data to the guest, subject to the
    /// queue-depth and iso backpressure drop policies.
    fn send_stream_data(
        &self,
        st: &mut Engine,
        id: u64,
        ep: EndpointAddress,
        status: Status,
        data: &[u8],
    ) {
        if self.parser.pending_writes() > QUEUED_PACKET_DROP_LIMIT {
            let slot = &mut st.endpoints[ep.slot()];
            if slot.warn_on_drop {
                warn!(
                    "buffered stream on endpoint {:02X}, connection too slow, dropping packets",
                    ep.0
                );
                slot.warn_on_drop = false;
            }
            debug!(
                "buffered complete ep {:02X} dropping packet status {:?} len {}",
                ep.0,
                status,
                data.len()
            );
            return;
        }

        debug!(
            "buffered complete ep {:02X} status {:?} len {}",
            ep.0,
            status,
            data.len()
        );

        match st.endpoints[ep.slot()].kind {
            TransferKind::Isochronous => {
                let header = IsoPacketHeader {
                    endpoint: ep.0,
                    status: status as u8,
                    length: data.len() as u16,
                };
                if self.can_write_iso_package(st) {
                    self.parser
                        .queue_packet(id, &TypeHeader::IsoPacket(header), data);
                }
            }
            TransferKind::Bulk => {
                let header = BufferedBulkPacketHeader {
                    stream_id: 0,
                    length: data.len() as u32,
                    endpoint: ep.0,
                    status: status as u8,
                };
                self.parser
                    .queue_packet(id, &TypeHeader::BufferedBulkPacket(header), data);
            }
            TransferKind::Interrupt => {
                let header = InterruptPacketHeader {
                    endpoint: ep.0,
                    status: status as u8,
                    length: data.len() as u16,
                };
                self.parser
                    .queue_packet(id, &TypeHeader::InterruptPacket(header), data);
            }
            _ => {}
        }
    }

    /// Tears down an endpoint's ring. Submitted transfers are cancelled at
    /// the backend and tracked until their completions drain; staged ones
    /// are simply freed.
    fn cancel_stream(&self, st: &mut Engine, backend: &B, ep: EndpointAddress) {
        let slot = &mut st.endpoints[ep.slot()];
        let mut cancelled = Vec::new();
        for entry in slot.ring.iter_mut() {
            if let Some(transfer) = entry.take() {
                if transfer.stage == TransferStage::Submitted {
                    backend.cancel(transfer.token);
                    cancelled.push(transfer.token);
                }
            }
        }
        slot.out_idx = 0;
        slot.stream_started = false;
        slot.drop_packets = 0;
        slot.pkts_per_transfer = 0;
        slot.transfer_count = 0;
        slot.pkt_size = 0;
        st.pending_cancels.extend(cancelled);
    }

    /// Hands one ring transfer to the backend.
    fn submit_stream_transfer(
        &self,
        st: &mut Engine,
        backend: &B,
        ep: EndpointAddress,
        ring_idx: usize,
    ) -> Status {
        st.reset = false;

        let slot_idx = ep.slot();
        let (submission, id) = {
            let slot = &mut st.endpoints[slot_idx];
            let kind = slot.kind;
            let pkt_size = slot.pkt_size;
            let pkts = slot.pkts_per_transfer as usize;
            let Some(transfer) = slot.ring[ring_idx].as_mut() else {
                return Status::Stall;
            };
            let Some(buffer) = transfer.buffer.take() else {
                return Status::Stall;
            };
            let sub_kind = match kind {
                TransferKind::Isochronous => SubmissionKind::Iso {
                    packet_lengths: if ep.is_in() {
                        vec![pkt_size; pkts]
                    } else {
                        core::mem::take(&mut transfer.packet_lengths)
                    },
                },
                TransferKind::Bulk => SubmissionKind::Bulk { stream_id: 0 },
                TransferKind::Interrupt => SubmissionKind::Interrupt,
                _ => return Status::Stall,
            };
            let timeout = match kind {
                TransferKind::Isochronous => ISO_TIMEOUT,
                TransferKind::Bulk => BULK_TIMEOUT,
                _ => INTERRUPT_TIMEOUT,
            };
            (
                Submission {
                    token: transfer.token,
                    endpoint: ep,
                    kind: sub_kind,
                    buffer,
                    timeout,
                },
                transfer.id,
            )
        };

        match backend.submit(submission) {
            Ok(()) => {
                if let Some(transfer) = st.endpoints[slot_idx].ring[ring_idx].as_mut() {
                    transfer.stage = TransferStage::Submitted;
                }
                Status::Success
            }
            Err(SubmitError { error, submission }) => {
                // Return the buffer so the ring can be torn down cleanly
                if let Some(transfer) = st.endpoints[slot_idx].ring[ring_idx].as_mut() {
                    transfer.buffer = Some(submission.buffer);
                }
                if error == BackendError::NoDevice {
                    self.handle_disconnect();
                } else {
                    error!(
                        "error submitting transfer on ep {:02X}: {:?}, stopping stream",
                        ep.0, error
                    );
                    self.cancel_stream(st, backend, ep);
                    self.send_stream_status(st, id, ep, Status::Stall);
                }
                Status::Stall
            }
        }
    }

    /// Submits the initial transfers of a freshly allocated (or restarted)
    /// stream.
    fn start_stream(&self, st: &mut Engine, backend: &B, ep: EndpointAddress) -> Status {
        let slot_idx = ep.slot();
        let mut count = st.endpoints[slot_idx].transfer_count as usize;
        // For out endpoints half the ring buffers guest data
        if !ep.is_in() {
            count /= 2;
        }
        for i in 0..count {
            if ep.is_in() {
                let pkts = st.endpoints[slot_idx].pkts_per_transfer as u64;
                if let Some(transfer) = st.endpoints[slot_idx].ring[i].as_mut() {
                    transfer.id = i as u64 * pkts;
                }
            }
            let status = self.submit_stream_transfer(st, backend, ep, i);
            if status != Status::Success {
                return status;
            }
        }
        st.endpoints[slot_idx].stream_started = true;
        Status::Success
    }

    /// Builds the transfer ring for a stream endpoint and, for input
    /// endpoints, submits it.
    #[allow(clippy::too_many_arguments)]
    fn alloc_stream(
        &self,
        st: &mut Engine,
        backend: &B,
        id: u64,
        ep: EndpointAddress,
        kind: TransferKind,
        pkts_per_transfer: u8,
        pkt_size: u32,
        transfer_count: u8,
        send_success: bool,
    ) {
        let slot_idx = ep.slot();

        if self.disconnected.load(Ordering::SeqCst) {
            self.send_stream_status(st, id, ep, Status::Stall);
            return;
        }
        if st.endpoints[slot_idx].kind != kind {
            error!(
                "start stream type {:?} on type {:?} endpoint",
                kind, st.endpoints[slot_idx].kind
            );
            self.send_stream_status(st, id, ep, Status::Stall);
            return;
        }
        if pkts_per_transfer < 1
            || pkts_per_transfer > MAX_PACKETS_PER_TRANSFER
            || transfer_count < 1
            || transfer_count as usize > MAX_TRANSFER_COUNT
            || st.endpoints[slot_idx].max_packet_size == 0
            || pkt_size % st.endpoints[slot_idx].max_packet_size != 0
        {
            error!("start stream type {:?} invalid parameters", kind);
            self.send_stream_status(st, id, ep, Status::Stall);
            return;
        }
        if st.endpoints[slot_idx].transfer_count != 0 {
            error!("received start type {:?} for already started stream", kind);
            self.send_stream_status(st, id, ep, Status::Inval);
            return;
        }

        debug!(
            "allocating stream ep {:02X} type {:?} packet-size {} pkts {} transfers {}",
            ep.0, kind, pkt_size, pkts_per_transfer, transfer_count
        );
        let buf_size = pkt_size as usize * pkts_per_transfer as usize;
        for i in 0..transfer_count as usize {
            let token = st.take_token();
            st.endpoints[slot_idx].ring[i] = Some(StreamTransfer {
                token,
                id: 0,
                stage: TransferStage::Staging(0),
                buffer: Some(vec![0; buf_size]),
                packet_lengths: Vec::new(),
            });
        }
        {
            let slot = &mut st.endpoints[slot_idx];
            slot.out_idx = 0;
            slot.drop_packets = 0;
            slot.pkts_per_transfer = pkts_per_transfer;
            slot.transfer_count = transfer_count;
            slot.pkt_size = pkt_size;
        }
        if kind == TransferKind::Isochronous {
            let max_packetsize = st.endpoints[slot_idx].max_packet_size;
            self.set_iso_threshold(st, pkts_per_transfer, transfer_count, max_packetsize);
        }

        // Input endpoints start streaming right away; output endpoints wait
        // for the guest to fill half the ring
        let mut status = Status::Success;
        if ep.is_in() {
            status = self.start_stream(st, backend, ep);
        }

        if send_success && status == Status::Success {
            self.send_stream_status(st, id, ep, Status::Success);
        }
    }

    /// Recovers a stalled stream: tear it down, clear the halt, rebuild it
    /// with the same parameters.
    fn clear_stream_stall(&self, st: &mut Engine, backend: &B, id: u64, ep: EndpointAddress) {
        let slot = &st.endpoints[ep.slot()];
        let kind = slot.kind;
        let pkts_per_transfer = slot.pkts_per_transfer;
        let transfer_count = slot.transfer_count;
        let pkt_size = slot.pkt_size;

        warn!("buffered stream on endpoint {:02X} stalled, clearing stall", ep.0);

        self.cancel_stream(st, backend, ep);
        if backend.clear_halt(ep).is_err() {
            self.send_stream_status(st, id, ep, Status::Stall);
            return;
        }
        self.alloc_stream(
            st,
            backend,
            id,
            ep,
            kind,
            pkts_per_transfer,
            pkt_size,
            transfer_count,
            false,
        );
    }

    fn stop_stream(&self, id: u64, ep: EndpointAddress) {
        if self.disconnected.load(Ordering::SeqCst) {
            return;
        }
        let Some(backend) = self.backend() else {
            return;
        };
        let mut st = self.state.lock();
        self.cancel_stream(&mut st, &backend, ep);
        self.send_stream_status(&st, id, ep, Status::Success);
        drop(st);
        self.flush();
    }

    /*** Cancellation ***/

    /// Cancels every stream and every individually submitted transfer.
    /// Returns whether completions are outstanding that the caller must
    /// drain.
    fn cancel_pending_transfers(&self, notify_guest: bool) -> bool {
        let Some(backend) = self.backend() else {
            return false;
        };
        let mut st = self.state.lock();
        for i in 0..MAX_ENDPOINT_SLOTS {
            let ep = EndpointAddress::from_slot(i);
            if notify_guest && st.endpoints[i].transfer_count != 0 {
                self.send_stream_status(&st, 0, ep, Status::Stall);
            }
            self.cancel_stream(&mut st, &backend, ep);
        }

        let mut wait = !st.pending_cancels.is_empty();
        for transfer in &st.transfers {
            backend.cancel(transfer.token);
            wait = true;
        }
        drop(st);

        if notify_guest {
            self.flush();
        }
        wait
    }

    /// Pumps device events until every cancelled transfer has completed.
    fn wait_for_cancel_completion(&self) {
        loop {
            let done = {
                let st = self.state.lock();
                st.pending_cancels.is_empty() && st.transfers.is_empty()
            };
            if done {
                return;
            }
            self.handle_events(DRAIN_POLL_INTERVAL);
        }
    }

    /// Cancels streams and transfers on one interface's current alternate
    /// setting.
    fn cancel_transfers_on_interface(&self, st: &mut Engine, backend: &B, idx: usize) {
        let endpoints: Vec<EndpointAddress> = {
            let Some(config) = st.config.as_ref() else {
                return;
            };
            let intf = &config.interfaces[idx];
            let alt = st.alt_setting[idx] as usize;
            match intf.alt_settings.get(alt) {
                Some(alt_desc) => alt_desc.endpoints.iter().map(|e| e.address).collect(),
                None => return,
            }
        };

        for ep in endpoints {
            self.cancel_stream(st, backend, ep);
            for transfer in st.transfers.iter().filter(|t| t.ep == ep) {
                backend.cancel(transfer.token);
            }
        }
    }

    /*** Completions ***/

    fn on_completion(&self, completion: Completion) {
        let Some(backend) = self.backend() else {
            return;
        };
        let mut st = self.state.lock();

        if let Some(pos) = st
            .pending_cancels
            .iter()
            .position(|t| *t == completion.token)
        {
            // A cancelled stream transfer finally drained; nothing to report
            st.pending_cancels.swap_remove(pos);
        } else if let Some(pos) = st
            .transfers
            .iter()
            .position(|t| t.token == completion.token)
        {
            let status = self.completion_status(completion.status);
            self.complete_non_stream(
                &mut st,
                pos,
                status,
                completion.actual_length,
                &completion.buffer,
            );
        } else if let Some((slot_idx, ring_idx)) = Self::find_stream_transfer(&st, completion.token)
        {
            match st.endpoints[slot_idx].kind {
                TransferKind::Isochronous => {
                    self.complete_iso(&mut st, &backend, slot_idx, ring_idx, completion)
                }
                TransferKind::Bulk | TransferKind::Interrupt => {
                    self.complete_buffered(&mut st, &backend, slot_idx, ring_idx, completion)
                }
                _ => {}
            }
        } else {
            warn!("completion for unknown transfer {:?}", completion.token);
        }

        drop(st);
        self.flush();
    }

    fn find_stream_transfer(st: &Engine, token: TransferToken) -> Option<(usize, usize)> {
        for (slot_idx, slot) in st.endpoints.iter().enumerate() {
            for (ring_idx, entry) in slot.ring.iter().enumerate() {
                if let Some(transfer) = entry {
                    if transfer.token == token && transfer.stage == TransferStage::Submitted {
                        return Some((slot_idx, ring_idx));
                    }
                }
            }
        }
        None
    }

    /// Finishes an individually submitted transfer: remove it, convert the
    /// status, reply to the guest (unless a cancel already replied).
    fn complete_non_stream(
        &self,
        st: &mut Engine,
        pos: usize,
        status: Status,
        actual_length: usize,
        buffer: &[u8],
    ) {
        let transfer = st.transfers.remove(pos);
        if transfer.cancelled {
            // The synthetic cancelled reply already went out
            return;
        }

        let data_in = &buffer[..actual_length.min(buffer.len())];
        match transfer.header {
            DataPacketHeader::Control(mut header) => {
                header.status = status as u8;
                header.length = actual_length as u16;
                debug!(
                    "control complete ep {:02X} status {:?} len {} id {}",
                    header.endpoint, status, header.length, transfer.id
                );
                let data = if transfer.ep.is_in() { data_in } else { &[] };
                self.parser
                    .queue_packet(transfer.id, &TypeHeader::ControlPacket(header), data);
            }
            DataPacketHeader::Bulk(mut header) => {
                header.status = status as u8;
                header.length = actual_length as u16;
                header.length_high = (actual_length >> 16) as u16;
                debug!(
                    "bulk complete ep {:02X} status {:?} len {} id {}",
                    header.endpoint, status, actual_length, transfer.id
                );
                let data = if transfer.ep.is_in() { data_in } else { &[] };
                self.parser
                    .queue_packet(transfer.id, &TypeHeader::BulkPacket(header), data);
            }
            DataPacketHeader::Interrupt(mut header) => {
                header.status = status as u8;
                header.length = actual_length as u16;
                debug!(
                    "interrupt out complete ep {:02X} status {:?} len {} id {}",
                    header.endpoint, status, header.length, transfer.id
                );
                self.parser
                    .queue_packet(transfer.id, &TypeHeader::InterruptPacket(header), &[]);
            }
        }
    }

    /// Injects a synchronous submit failure into the normal completion
    /// path.
    fn fail_submitted(&self, st: &mut Engine, token: TransferToken, error: BackendError) {
        let status = self.backend_error_status(error);
        if let Some(pos) = st.transfers.iter().position(|t| t.token == token) {
            self.complete_non_stream(st, pos, status, 0, &[]);
        }
    }

    /// Classifies an iso status: fine, this packet is bad, or the whole
    /// stream is over (handling stall recovery and disconnect inline).
    fn handle_iso_status(
        &self,
        st: &mut Engine,
        backend: &B,
        id: u64,
        ep: EndpointAddress,
        status: TransferStatus,
    ) -> IsoResult {
        match status {
            TransferStatus::Completed => IsoResult::Ok,
            // The stream was intentionally stopped
            TransferStatus::Cancelled => IsoResult::StreamStopped,
            TransferStatus::Stall => {
                self.clear_stream_stall(st, backend, id, ep);
                IsoResult::StreamStopped
            }
            TransferStatus::NoDevice => {
                self.handle_disconnect();
                IsoResult::StreamStopped
            }
            other => {
                error!("iso stream error on endpoint {:02X}: {:?}", ep.0, other);
                IsoResult::PacketError
            }
        }
    }

    fn complete_iso(
        &self,
        st: &mut Engine,
        backend: &B,
        slot_idx: usize,
        ring_idx: usize,
        completion: Completion,
    ) {
        let ep = EndpointAddress::from_slot(slot_idx);
        let num_packets = completion.iso_packets.len();

        // Mark the transfer completed (not submitted any more)
        let mut id = {
            let Some(transfer) = st.endpoints[slot_idx].ring[ring_idx].as_mut() else {
                return;
            };
            transfer.stage = TransferStage::Staging(0);
            transfer.packet_lengths.clear();
            transfer.id
        };

        // Overall transfer status first
        let mut skip_packets = false;
        match self.handle_iso_status(st, backend, id, ep, completion.status) {
            IsoResult::Ok => {}
            IsoResult::PacketError => {
                let status = self.completion_status(completion.status);
                if ep.is_in() {
                    let header = IsoPacketHeader {
                        endpoint: ep.0,
                        status: status as u8,
                        length: 0,
                    };
                    self.parser
                        .queue_packet(id, &TypeHeader::IsoPacket(header), &[]);
                    id += num_packets as u64;
                    skip_packets = true;
                } else {
                    self.send_stream_status(st, id, ep, status);
                    return;
                }
            }
            IsoResult::StreamStopped => return,
        }

        if !skip_packets {
            // Per packet status; good input packets go to the guest
            for pkt in &completion.iso_packets {
                let status = self.completion_status(pkt.status);
                let mut len = pkt.actual_length;
                match self.handle_iso_status(st, backend, id, ep, pkt.status) {
                    IsoResult::Ok => {}
                    IsoResult::PacketError => {
                        if ep.is_in() {
                            len = 0;
                        } else {
                            // Max one iso status message per transfer
                            self.send_stream_status(st, id, ep, status);
                            return;
                        }
                    }
                    IsoResult::StreamStopped => return,
                }
                if ep.is_in() {
                    let end = (pkt.offset + len).min(completion.buffer.len());
                    let data = &completion.buffer[pkt.offset.min(end)..end];
                    self.send_stream_data(st, id, ep, status, data);
                    id += 1;
                } else {
                    debug!("iso out complete ep {:02X} len {} id {}", ep.0, len, id);
                }
            }
        }

        if ep.is_in() {
            // Keep ids monotonically increasing across the whole ring
            let transfer_count = st.endpoints[slot_idx].transfer_count as u64;
            id += (transfer_count - 1) * num_packets as u64;
            if let Some(transfer) = st.endpoints[slot_idx].ring[ring_idx].as_mut() {
                transfer.id = id;
                transfer.buffer = Some(completion.buffer);
            }
            self.submit_stream_transfer(st, backend, ep, ring_idx);
        } else {
            // The buffer goes back to staging duty; output transfers are
            // resubmitted once the guest fills them again
            if let Some(transfer) = st.endpoints[slot_idx].ring[ring_idx].as_mut() {
                transfer.buffer = Some(completion.buffer);
            }
            let slot = &mut st.endpoints[slot_idx];
            let any_submitted = slot
                .ring
                .iter()
                .flatten()
                .any(|t| t.stage == TransferStage::Submitted);
            if !any_submitted {
                debug!("underflow of iso out queue on ep: {:02X}", ep.0);
                // Re-fill buffers before submitting transfers again
                for transfer in slot.ring.iter_mut().flatten() {
                    transfer.stage = TransferStage::Staging(0);
                    transfer.packet_lengths.clear();
                }
                slot.out_idx = 0;
                slot.stream_started = false;
                slot.drop_packets = 0;
            }
        }
    }

    fn complete_buffered(
        &self,
        st: &mut Engine,
        backend: &B,
        slot_idx: usize,
        ring_idx: usize,
        completion: Completion,
    ) {
        let ep = EndpointAddress::from_slot(slot_idx);

        let id = {
            let Some(transfer) = st.endpoints[slot_idx].ring[ring_idx].as_mut() else {
                return;
            };
            transfer.stage = TransferStage::Staging(0);
            transfer.id
        };

        let mut len = completion.actual_length;
        match completion.status {
            TransferStatus::Completed => {}
            TransferStatus::Stall => {
                self.clear_stream_stall(st, backend, id, ep);
                return;
            }
            TransferStatus::NoDevice => {
                self.handle_disconnect();
                return;
            }
            other => {
                error!("buffered in error on endpoint {:02X}: {:?}", ep.0, other);
                len = 0;
            }
        }

        let status = self.completion_status(completion.status);
        let end = len.min(completion.buffer.len());
        self.send_stream_data(st, id, ep, status, &completion.buffer[..end]);

        let transfer_count = st.endpoints[slot_idx].transfer_count as u64;
        if let Some(transfer) = st.endpoints[slot_idx].ring[ring_idx].as_mut() {
            transfer.id = id + transfer_count;
            transfer.buffer = Some(completion.buffer);
        }
        self.submit_stream_transfer(st, backend, ep, ring_idx);
    }

    /*** Inbound request handlers ***/

    fn on_hello(&self) {
        if self.connect_pending.load(Ordering::SeqCst) {
            self.send_device_connect();
        }
    }

    fn on_reset(&self) {
        if self.disconnected.load(Ordering::SeqCst) || self.state.lock().reset {
            return;
        }

        // The guest should have cancelled pending transfers already, but
        // those cancellations may still await completion; if we reset now
        // they would complete as NoDevice. Streams also need a clean stop
        // (the stall status tells the guest to restart them afterwards).
        if self.cancel_pending_transfers(true) {
            self.wait_for_cancel_completion();
        }

        if self.reset_device().is_err() {
            self.state.lock().read_status = Some(PendingRead::Lost);
        }
    }

    fn apply_configuration(&self, value: u8) -> Status {
        let current = self
            .state
            .lock()
            .config
            .as_ref()
            .map(|c| c.configuration_value);
        if current == Some(value) {
            return Status::Success;
        }

        self.state.lock().reset = false;

        self.cancel_pending_transfers(false);
        self.release(false);

        let mut status = Status::Success;
        if let Some(backend) = self.backend() {
            if let Err(e) = backend.set_configuration(value as i32) {
                error!("could not set active configuration to {}: {:?}", value, e);
                status = Status::Ioerror;
            }
        }

        if self.claim(false).is_err() {
            self.clear_device();
            self.state.lock().read_status = Some(PendingRead::Lost);
            return Status::Ioerror;
        }

        let st = self.state.lock();
        self.send_interface_n_ep_info(&st);
        status
    }

    fn on_set_configuration(&self, id: u64, header: &SetConfigurationHeader) {
        let status = if self.disconnected.load(Ordering::SeqCst) {
            Status::Ioerror
        } else {
            self.apply_configuration(header.configuration)
        };

        let configuration = self
            .state
            .lock()
            .config
            .as_ref()
            .map(|c| c.configuration_value)
            .unwrap_or(0);
        let reply = ConfigurationStatusHeader {
            status: status as u8,
            configuration,
        };
        self.parser
            .queue_packet(id, &TypeHeader::ConfigurationStatus(reply), &[]);
        self.flush();
    }

    fn on_get_configuration(&self, id: u64) {
        let status = if self.disconnected.load(Ordering::SeqCst) {
            Status::Ioerror
        } else {
            Status::Success
        };
        let configuration = self
            .state
            .lock()
            .config
            .as_ref()
            .map(|c| c.configuration_value)
            .unwrap_or(0);
        let reply = ConfigurationStatusHeader {
            status: status as u8,
            configuration,
        };
        self.parser
            .queue_packet(id, &TypeHeader::ConfigurationStatus(reply), &[]);
        self.flush();
    }

    fn on_set_alt_setting(&self, id: u64, header: &SetAltSettingHeader) {
        let mut reply = AltSettingStatusHeader {
            status: Status::Success as u8,
            interface: header.interface,
            alt: 0xff,
        };

        if self.disconnected.load(Ordering::SeqCst) {
            reply.status = Status::Ioerror as u8;
            self.parser
                .queue_packet(id, &TypeHeader::AltSettingStatus(reply), &[]);
            self.flush();
            return;
        }

        let Some(backend) = self.backend() else {
            return;
        };
        let mut st = self.state.lock();
        let Some(idx) = st.interface_index(header.interface) else {
            reply.status = Status::Inval as u8;
            self.parser
                .queue_packet(id, &TypeHeader::AltSettingStatus(reply), &[]);
            drop(st);
            self.flush();
            return;
        };

        st.reset = false;
        self.cancel_transfers_on_interface(&mut st, &backend, idx);

        if let Err(e) = backend.set_alt_setting(header.interface, header.alt) {
            error!(
                "could not set alt setting for interface {} to {}: {:?}",
                header.interface, header.alt, e
            );
            reply.status = self.backend_error_status(e) as u8;
            reply.alt = st.alt_setting[idx];
            self.parser
                .queue_packet(id, &TypeHeader::AltSettingStatus(reply), &[]);
            drop(st);
            self.flush();
            return;
        }

        // The new alt setting may have lost endpoints compared to the old
        // one; wipe everything that belonged to this interface
        for (j, slot) in st.endpoints.iter_mut().enumerate() {
            if slot.interface != header.interface {
                continue;
            }
            slot.kind = if j & 0x0f == 0 {
                TransferKind::Control
            } else {
                TransferKind::Invalid
            };
            slot.interval = 0;
            slot.interface = 0;
            slot.max_packet_size = 0;
        }

        st.alt_setting[idx] = header.alt;
        self.parse_interface(&mut st, idx);
        self.send_interface_n_ep_info(&st);

        reply.alt = st.alt_setting[idx];
        self.parser
            .queue_packet(id, &TypeHeader::AltSettingStatus(reply), &[]);
        drop(st);
        self.flush();
    }

    fn on_get_alt_setting(&self, id: u64, header: &GetAltSettingHeader) {
        let mut reply = AltSettingStatusHeader {
            status: Status::Success as u8,
            interface: header.interface,
            alt: 0xff,
        };

        if self.disconnected.load(Ordering::SeqCst) {
            reply.status = Status::Ioerror as u8;
        } else {
            let st = self.state.lock();
            match st.interface_index(header.interface) {
                Some(idx) => reply.alt = st.alt_setting[idx],
                None => reply.status = Status::Inval as u8,
            }
        }

        self.parser
            .queue_packet(id, &TypeHeader::AltSettingStatus(reply), &[]);
        self.flush();
    }

    fn on_start_iso_stream(&self, id: u64, header: &StartIsoStreamHeader) {
        let Some(backend) = self.backend() else {
            return;
        };
        let ep = EndpointAddress(header.endpoint);
        let mut st = self.state.lock();
        let pkt_size = st.endpoints[ep.slot()].max_packet_size;
        self.alloc_stream(
            &mut st,
            &backend,
            id,
            ep,
            TransferKind::Isochronous,
            header.pkts_per_transfer,
            pkt_size,
            header.transfer_count,
            true,
        );
        drop(st);
        self.flush();
    }

    fn on_start_interrupt_receiving(&self, id: u64, header: &StartInterruptReceivingHeader) {
        let Some(backend) = self.backend() else {
            return;
        };
        let ep = EndpointAddress(header.endpoint);
        let mut st = self.state.lock();
        let pkt_size = st.endpoints[ep.slot()].max_packet_size;
        self.alloc_stream(
            &mut st,
            &backend,
            id,
            ep,
            TransferKind::Interrupt,
            1,
            pkt_size,
            INTERRUPT_TRANSFER_COUNT,
            true,
        );
        drop(st);
        self.flush();
    }

    fn on_start_bulk_receiving(&self, id: u64, header: &StartBulkReceivingHeader) {
        let Some(backend) = self.backend() else {
            return;
        };
        let ep = EndpointAddress(header.endpoint);
        let mut st = self.state.lock();
        self.alloc_stream(
            &mut st,
            &backend,
            id,
            ep,
            TransferKind::Bulk,
            1,
            header.bytes_per_transfer,
            header.no_transfers,
            true,
        );
        drop(st);
        self.flush();
    }

    fn on_alloc_bulk_streams(&self, id: u64, header: &AllocBulkStreamsHeader) {
        let Some(backend) = self.backend() else {
            return;
        };
        let endpoints = Self::ep_mask_to_eps(header.endpoints);
        let mut reply = BulkStreamsStatusHeader {
            endpoints: header.endpoints,
            no_streams: header.no_streams,
            status: Status::Success as u8,
        };

        match backend.alloc_streams(header.no_streams, &endpoints) {
            Ok(allocated) if allocated < header.no_streams => {
                error!(
                    "tried to alloc {} bulk streams but got only {}",
                    header.no_streams, allocated
                );
                reply.status = Status::Ioerror as u8;
            }
            Ok(_) => {}
            Err(e) => {
                error!("could not alloc bulk streams: {:?}", e);
                reply.status = self.backend_error_status(e) as u8;
            }
        }

        self.parser
            .queue_packet(id, &TypeHeader::BulkStreamsStatus(reply), &[]);
        self.flush();
    }

    fn on_free_bulk_streams(&self, id: u64, header: &FreeBulkStreamsHeader) {
        let Some(backend) = self.backend() else {
            return;
        };
        let endpoints = Self::ep_mask_to_eps(header.endpoints);
        let mut reply = BulkStreamsStatusHeader {
            endpoints: header.endpoints,
            no_streams: 0,
            status: Status::Success as u8,
        };

        if let Err(e) = backend.free_streams(&endpoints) {
            error!("could not free bulk streams: {:?}", e);
            reply.status = self.backend_error_status(e) as u8;
        }

        self.parser
            .queue_packet(id, &TypeHeader::BulkStreamsStatus(reply), &[]);
        self.flush();
    }

    fn ep_mask_to_eps(mask: u32) -> Vec<EndpointAddress> {
        (0..MAX_ENDPOINT_SLOTS)
            .filter(|i| mask & (1 << i) != 0)
            .map(EndpointAddress::from_slot)
            .collect()
    }

    fn on_cancel_data_packet(&self, id: u64) {
        let Some(backend) = self.backend() else {
            return;
        };
        // The completion callback may run concurrently and would free the
        // transfer, so the cancel must happen under the host lock. The
        // device layer drops its own transfer lock before invoking
        // completions, so this cannot deadlock.
        let mut st = self.state.lock();

        // After cancellation the guest may re-use the id, so skip already
        // cancelled packets
        let reply = match st
            .transfers
            .iter_mut()
            .find(|t| !t.cancelled && t.id == id)
        {
            Some(transfer) => {
                transfer.cancelled = true;
                backend.cancel(transfer.token);
                match transfer.header {
                    DataPacketHeader::Control(mut h) => {
                        h.status = Status::Cancelled as u8;
                        h.length = 0;
                        debug!("cancelled control packet ep {:02x} id {}", h.endpoint, id);
                        Some(TypeHeader::ControlPacket(h))
                    }
                    DataPacketHeader::Bulk(mut h) => {
                        h.status = Status::Cancelled as u8;
                        h.length = 0;
                        h.length_high = 0;
                        debug!("cancelled bulk packet ep {:02x} id {}", h.endpoint, id);
                        Some(TypeHeader::BulkPacket(h))
                    }
                    DataPacketHeader::Interrupt(mut h) => {
                        h.status = Status::Cancelled as u8;
                        h.length = 0;
                        debug!("cancelled interrupt packet ep {:02x} id {}", h.endpoint, id);
                        Some(TypeHeader::InterruptPacket(h))
                    }
                }
            }
            None => {
                // The transfer may have completed before the cancel arrived;
                // that is not an error
                debug!("cancel packet id {} not found", id);
                None
            }
        };
        if let Some(reply) = reply {
            self.parser.queue_packet(id, &reply, &[]);
        }
        drop(st);
        self.flush();
    }

    fn on_filter_reject(&self) {
        if self.disconnected.load(Ordering::SeqCst) {
            return;
        }
        info!("device rejected");
        self.state.lock().read_status = Some(PendingRead::Rejected);
    }

    fn on_filter_filter(&self, rules: Vec<filter::Rule>) {
        self.state.lock().filter_rules = Some(rules);
    }

    fn on_device_disconnect_ack(&self) {
        if !self.wait_disconnect.swap(false, Ordering::SeqCst) {
            error!("received disconnect ack without sending a disconnect");
            return;
        }
        if self.connect_pending.load(Ordering::SeqCst) {
            self.send_device_connect();
        }
    }

    /*** Data packets ***/

    fn send_control_status(&self, id: u64, mut header: ControlPacketHeader, status: Status) {
        header.status = status as u8;
        header.length = 0;
        self.parser
            .queue_packet(id, &TypeHeader::ControlPacket(header), &[]);
    }

    fn send_bulk_status(&self, id: u64, mut header: BulkPacketHeader, status: Status) {
        header.status = status as u8;
        header.length = 0;
        header.length_high = 0;
        self.parser
            .queue_packet(id, &TypeHeader::BulkPacket(header), &[]);
    }

    fn send_interrupt_status(&self, id: u64, mut header: InterruptPacketHeader, status: Status) {
        header.status = status as u8;
        header.length = 0;
        self.parser
            .queue_packet(id, &TypeHeader::InterruptPacket(header), &[]);
    }

    fn on_control_packet(&self, id: u64, header: &ControlPacketHeader, data: Vec<u8>) {
        let ep = EndpointAddress(header.endpoint);
        debug!("control submit ep {:02X} len {} id {}", ep.0, header.length, id);

        if self.disconnected.load(Ordering::SeqCst) {
            self.send_control_status(id, *header, Status::Ioerror);
            self.flush();
            return;
        }
        let Some(backend) = self.backend() else {
            return;
        };
        let mut st = self.state.lock();

        if st.endpoints[ep.slot()].kind != TransferKind::Control {
            error!("control packet on non control ep {:02X}", ep.0);
            drop(st);
            self.send_control_status(id, *header, Status::Inval);
            self.flush();
            return;
        }

        st.reset = false;

        // A clear stall must go through the driver layer rather than being
        // forwarded, so its usb stack knows the halt is gone
        if header.requesttype == Recipient::Endpoint as u8
            && header.request == Request::CLEAR_FEATURE
            && header.value == 0
            && data.is_empty()
        {
            let status = match backend.clear_halt(EndpointAddress(header.index as u8)) {
                Ok(()) => Status::Success,
                Err(e) => self.backend_error_status(e),
            };
            debug!("clear halt ep {:02X} status {:?}", header.index, status);
            drop(st);
            self.send_control_status(id, *header, status);
            self.flush();
            return;
        }

        let buffer = if ep.is_in() {
            vec![0; header.length as usize]
        } else {
            data
        };
        let token = st.take_token();
        st.transfers.push(NonStreamTransfer {
            token,
            id,
            cancelled: false,
            ep,
            header: DataPacketHeader::Control(*header),
        });

        let setup = SetupPacket {
            request_type: header.requesttype,
            request: header.request,
            value: header.value,
            index: header.index,
            length: header.length,
        };
        let submission = Submission {
            token,
            endpoint: ep,
            kind: SubmissionKind::Control { setup },
            buffer,
            timeout: CTRL_TIMEOUT,
        };
        if let Err(SubmitError { error, .. }) = backend.submit(submission) {
            error!("error submitting control transfer on ep {:02X}: {:?}", ep.0, error);
            self.fail_submitted(&mut st, token, error);
            drop(st);
            self.flush();
        }
    }

    fn on_bulk_packet(&self, id: u64, header: &BulkPacketHeader, data: Vec<u8>) {
        let ep = EndpointAddress(header.endpoint);
        let len = header.total_length() as usize;
        debug!("bulk submit ep {:02X} len {} id {}", ep.0, len, id);

        if self.disconnected.load(Ordering::SeqCst) {
            self.send_bulk_status(id, *header, Status::Ioerror);
            self.flush();
            return;
        }
        let Some(backend) = self.backend() else {
            return;
        };
        let mut st = self.state.lock();

        if st.endpoints[ep.slot()].kind != TransferKind::Bulk {
            error!("bulk packet on non bulk ep {:02X}", ep.0);
            drop(st);
            self.send_bulk_status(id, *header, Status::Inval);
            self.flush();
            return;
        }

        st.reset = false;

        let buffer = if ep.is_in() { vec![0; len] } else { data };
        let token = st.take_token();
        st.transfers.push(NonStreamTransfer {
            token,
            id,
            cancelled: false,
            ep,
            header: DataPacketHeader::Bulk(*header),
        });

        let submission = Submission {
            token,
            endpoint: ep,
            kind: SubmissionKind::Bulk {
                stream_id: header.stream_id,
            },
            buffer,
            timeout: BULK_TIMEOUT,
        };
        if let Err(SubmitError { error, .. }) = backend.submit(submission) {
            error!("error submitting bulk transfer on ep {:02X}: {:?}", ep.0, error);
            self.fail_submitted(&mut st, token, error);
            drop(st);
            self.flush();
        }
    }

    fn on_interrupt_packet(&self, id: u64, header: &InterruptPacketHeader, data: Vec<u8>) {
        let ep = EndpointAddress(header.endpoint);
        debug!("interrupt submit ep {:02X} len {} id {}", ep.0, header.length, id);

        if self.disconnected.load(Ordering::SeqCst) {
            self.send_interrupt_status(id, *header, Status::Ioerror);
            self.flush();
            return;
        }
        let Some(backend) = self.backend() else {
            return;
        };
        let mut st = self.state.lock();

        if st.endpoints[ep.slot()].kind != TransferKind::Interrupt {
            error!("interrupt packet for non interrupt ep {:02X}", ep.0);
            drop(st);
            self.send_interrupt_status(id, *header, Status::Inval);
            self.flush();
            return;
        }
        if data.len() > st.endpoints[ep.slot()].max_packet_size as usize {
            error!("interrupt out packet is larger than wMaxPacketSize");
            drop(st);
            self.send_interrupt_status(id, *header, Status::Inval);
            self.flush();
            return;
        }

        st.reset = false;

        let token = st.take_token();
        st.transfers.push(NonStreamTransfer {
            token,
            id,
            cancelled: false,
            ep,
            header: DataPacketHeader::Interrupt(*header),
        });

        let submission = Submission {
            token,
            endpoint: ep,
            kind: SubmissionKind::Interrupt,
            buffer: data,
            timeout: INTERRUPT_TIMEOUT,
        };
        if let Err(SubmitError { error, .. }) = backend.submit(submission) {
            error!("error submitting interrupt transfer on ep {:02X}: {:?}", ep.0, error);
            self.fail_submitted(&mut st, token, error);
            drop(st);
            self.flush();
        }
    }

    /// Stages one guest iso packet into the endpoint's output ring,
    /// submitting and starting transfers as they fill.
    fn stage_iso_packet(
        &self,
        st: &mut Engine,
        backend: &B,
        id: u64,
        ep: EndpointAddress,
        data: &[u8],
    ) -> Status {
        let slot_idx = ep.slot();

        if st.endpoints[slot_idx].kind != TransferKind::Isochronous {
            error!("received iso packet for non iso ep {:02X}", ep.0);
            return Status::Inval;
        }
        if st.endpoints[slot_idx].transfer_count == 0 {
            error!("received iso out packet for non started iso stream");
            return Status::Inval;
        }
        if data.len() > st.endpoints[slot_idx].max_packet_size as usize {
            error!("received iso out packet is larger than wMaxPacketSize");
            return Status::Inval;
        }

        let (submit_idx, start) = {
            let slot = &mut st.endpoints[slot_idx];
            if slot.drop_packets > 0 {
                slot.drop_packets -= 1;
                return Status::Success;
            }

            let pkts = slot.pkts_per_transfer as usize;
            let count = slot.transfer_count as usize;
            let ring_idx = slot.out_idx;
            let Some(transfer) = slot.ring[ring_idx].as_mut() else {
                return Status::Inval;
            };

            let TransferStage::Staging(mut j) = transfer.stage else {
                debug!("overflow of iso out queue on ep: {:02X}, dropping packet", ep.0);
                // The stream is interrupted anyway; drop enough packets to
                // get back to the target buffer size
                slot.drop_packets = pkts * count / 2;
                return Status::Success;
            };

            // The transfer is correlated by the id of its first packet
            if j == 0 {
                transfer.id = id;
            }
            let offset: usize = transfer.packet_lengths.iter().sum::<u32>() as usize;
            if let Some(buffer) = transfer.buffer.as_mut() {
                buffer[offset..offset + data.len()].copy_from_slice(data);
            }
            transfer.packet_lengths.push(data.len() as u32);
            debug!(
                "iso out queue ep {:02X} transfer {} pkt {} len {} id {}",
                ep.0,
                ring_idx,
                j,
                data.len(),
                transfer.id
            );

            j += 1;
            transfer.stage = TransferStage::Staging(j);
            let (mut cur_i, mut cur_j) = (ring_idx, j);
            if j == pkts {
                cur_i = (ring_idx + 1) % count;
                slot.out_idx = cur_i;
                cur_j = 0;
            }

            if slot.stream_started {
                (if j == pkts { Some(ring_idx) } else { None }, false)
            } else {
                // Start the stream once half the ring is filled
                let available = cur_i * pkts + cur_j;
                let needed = pkts * count / 2;
                (None, available == needed)
            }
        };

        if let Some(ring_idx) = submit_idx {
            self.submit_stream_transfer(st, backend, ep, ring_idx);
        } else if start {
            debug!("iso out starting stream on ep {:02X}", ep.0);
            self.start_stream(st, backend, ep);
        }

        Status::Success
    }

    fn on_iso_packet(&self, id: u64, header: &IsoPacketHeader, data: Vec<u8>) {
        let ep = EndpointAddress(header.endpoint);
        let Some(backend) = self.backend() else {
            return;
        };
        let mut st = self.state.lock();

        let status = if self.disconnected.load(Ordering::SeqCst) {
            Status::Ioerror
        } else {
            self.stage_iso_packet(&mut st, &backend, id, ep, &data)
        };

        if status != Status::Success {
            self.send_stream_status(&st, id, ep, status);
        }
        drop(st);
        self.flush();
    }
}

/// Adapter feeding parser dispatch into the engine.
struct HostSink<'a, B: UsbBackend> {
    host: &'a Host<B>,
}

impl<B: UsbBackend> PacketSink for HostSink<'_, B> {
    fn hello(&mut self, _hello: &HelloHeader) {
        self.host.on_hello();
    }

    fn reset(&mut self) {
        self.host.on_reset();
    }

    fn set_configuration(&mut self, id: u64, header: &SetConfigurationHeader) {
        self.host.on_set_configuration(id, header);
    }

    fn get_configuration(&mut self, id: u64) {
        self.host.on_get_configuration(id);
    }

    fn set_alt_setting(&mut self, id: u64, header: &SetAltSettingHeader) {
        self.host.on_set_alt_setting(id, header);
    }

    fn get_alt_setting(&mut self, id: u64, header: &GetAltSettingHeader) {
        self.host.on_get_alt_setting(id, header);
    }

    fn start_iso_stream(&mut self, id: u64, header: &StartIsoStreamHeader) {
        self.host.on_start_iso_stream(id, header);
    }

    fn stop_iso_stream(&mut self, id: u64, header: &StopIsoStreamHeader) {
        self.host.stop_stream(id, EndpointAddress(header.endpoint));
    }

    fn start_interrupt_receiving(&mut self, id: u64, header: &StartInterruptReceivingHeader) {
        self.host.on_start_interrupt_receiving(id, header);
    }

    fn stop_interrupt_receiving(&mut self, id: u64, header: &StopInterruptReceivingHeader) {
        self.host.stop_stream(id, EndpointAddress(header.endpoint));
    }

    fn alloc_bulk_streams(&mut self, id: u64, header: &AllocBulkStreamsHeader) {
        self.host.on_alloc_bulk_streams(id, header);
    }

    fn free_bulk_streams(&mut self, id: u64, header: &FreeBulkStreamsHeader) {
        self.host.on_free_bulk_streams(id, header);
    }

    fn cancel_data_packet(&mut self, id: u64) {
        self.host.on_cancel_data_packet(id);
    }

    fn filter_reject(&mut self) {
        self.host.on_filter_reject();
    }

    fn filter_filter(&mut self, rules: Vec<filter::Rule>) {
        self.host.on_filter_filter(rules);
    }

    fn device_disconnect_ack(&mut self) {
        self.host.on_device_disconnect_ack();
    }

    fn start_bulk_receiving(&mut self, id: u64, header: &StartBulkReceivingHeader) {
        self.host.on_start_bulk_receiving(id, header);
    }

    fn stop_bulk_receiving(&mut self, id: u64, header: &StopBulkReceivingHeader) {
        self.host.stop_stream(id, EndpointAddress(header.endpoint));
    }

    fn control_packet(&mut self, id: u64, header: &ControlPacketHeader, data: Vec<u8>) {
        self.host.on_control_packet(id, header, data);
    }

    fn bulk_packet(&mut self, id: u64, header: &BulkPacketHeader, data: Vec<u8>) {
        self.host.on_bulk_packet(id, header, data);
    }

    fn iso_packet(&mut self, id: u64, header: &IsoPacketHeader, data: Vec<u8>) {
        self.host.on_iso_packet(id, header, data);
    }

    fn interrupt_packet(&mut self, id: u64, header: &InterruptPacketHeader, data: Vec<u8>) {
        self.host.on_interrupt_packet(id, header, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        AltSettingInfo, ConfigInfo, DeviceInfo, EndpointInfo, InterfaceInfo, IsoPacketResult,
    };
    use crate::testutil::{MockChannel, RecordingSink, SinkEvent};
    use alloc::collections::VecDeque;

    #[derive(Default)]
    struct Calls {
        submissions: Vec<Submission>,
        cancelled: Vec<TransferToken>,
        completions: VecDeque<Completion>,
        claimed: Vec<u8>,
        released: Vec<u8>,
        attached: Vec<u8>,
        cleared_halts: Vec<u8>,
        resets: usize,
        set_configs: Vec<i32>,
        alt_sets: Vec<(u8, u8)>,
        fail_next_submit: Option<BackendError>,
    }

    struct MockBackend {
        info: DeviceInfo,
        config: Mutex<Option<ConfigInfo>>,
        calls: Arc<Mutex<Calls>>,
    }

    impl UsbBackend for MockBackend {
        fn device_info(&self) -> Result<DeviceInfo, BackendError> {
            Ok(self.info)
        }

        fn active_config(&self) -> Result<Option<ConfigInfo>, BackendError> {
            Ok(self.config.lock().clone())
        }

        fn config_info(&self, _index: u8) -> Result<ConfigInfo, BackendError> {
            self.config.lock().clone().ok_or(BackendError::NotFound)
        }

        fn set_auto_detach_kernel_driver(&self, _enable: bool) -> Result<(), BackendError> {
            Ok(())
        }

        fn claim_interface(&self, number: u8) -> Result<(), BackendError> {
            self.calls.lock().claimed.push(number);
            Ok(())
        }

        fn release_interface(&self, number: u8) -> Result<(), BackendError> {
            self.calls.lock().released.push(number);
            Ok(())
        }

        fn attach_kernel_driver(&self, number: u8) -> Result<(), BackendError> {
            self.calls.lock().attached.push(number);
            Ok(())
        }

        fn set_configuration(&self, value: i32) -> Result<(), BackendError> {
            self.calls.lock().set_configs.push(value);
            if let Some(config) = self.config.lock().as_mut() {
                if value > 0 {
                    config.configuration_value = value as u8;
                }
            }
            Ok(())
        }

        fn set_alt_setting(&self, interface: u8, alt: u8) -> Result<(), BackendError> {
            self.calls.lock().alt_sets.push((interface, alt));
            Ok(())
        }

        fn clear_halt(&self, endpoint: EndpointAddress) -> Result<(), BackendError> {
            self.calls.lock().cleared_halts.push(endpoint.0);
            Ok(())
        }

        fn reset_device(&self) -> Result<(), BackendError> {
            self.calls.lock().resets += 1;
            Ok(())
        }

        fn submit(&self, submission: Submission) -> Result<(), SubmitError> {
            let mut calls = self.calls.lock();
            if let Some(error) = calls.fail_next_submit.take() {
                return Err(SubmitError { error, submission });
            }
            calls.submissions.push(submission);
            Ok(())
        }

        fn cancel(&self, token: TransferToken) {
            self.calls.lock().cancelled.push(token);
        }

        fn poll_completion(&self, _timeout: MicrosDurationU32) -> Option<Completion> {
            self.calls.lock().completions.pop_front()
        }
    }

    fn device_info() -> DeviceInfo {
        DeviceInfo {
            speed: Speed::Full,
            device_class: 0x03,
            device_subclass: 0x01,
            device_protocol: 0x01,
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_version_bcd: 0x0100,
            num_configurations: 1,
        }
    }

    fn config_with(endpoints: Vec<EndpointInfo>) -> ConfigInfo {
        ConfigInfo {
            configuration_value: 1,
            interfaces: vec![InterfaceInfo {
                number: 0,
                class: 0x03,
                subclass: 0x01,
                protocol: 0x01,
                alt_settings: vec![AltSettingInfo {
                    alt: 0,
                    class: 0x03,
                    subclass: 0x01,
                    protocol: 0x01,
                    endpoints,
                }],
            }],
        }
    }

    fn interrupt_in_config() -> ConfigInfo {
        config_with(vec![EndpointInfo {
            address: EndpointAddress(0x81),
            kind: 3,
            interval: 10,
            max_packet_size: 8,
            max_streams: 0,
        }])
    }

    fn iso_in_config() -> ConfigInfo {
        config_with(vec![EndpointInfo {
            address: EndpointAddress(0x81),
            kind: 1,
            interval: 1,
            max_packet_size: 512,
            max_streams: 0,
        }])
    }

    fn iso_out_config() -> ConfigInfo {
        config_with(vec![EndpointInfo {
            address: EndpointAddress(0x01),
            kind: 1,
            interval: 1,
            max_packet_size: 512,
            max_streams: 0,
        }])
    }

    fn bulk_config() -> ConfigInfo {
        config_with(vec![
            EndpointInfo {
                address: EndpointAddress(0x02),
                kind: 2,
                interval: 0,
                max_packet_size: 512,
                max_streams: 0,
            },
            EndpointInfo {
                address: EndpointAddress(0x82),
                kind: 2,
                interval: 0,
                max_packet_size: 512,
                max_streams: 0,
            },
        ])
    }

    fn guest_caps() -> Caps {
        let mut caps = Caps::none();
        caps.set(Cap::ConnectDeviceVersion);
        caps.set(Cap::Filter);
        // A guest that wants deferred reconnects advertises the ack
        // capability explicitly
        caps.set(Cap::DeviceDisconnectAck);
        caps.set(Cap::EpInfoMaxPacketSize);
        caps.set(Cap::Ids64Bits);
        caps.set(Cap::BulkLength32Bits);
        caps.set(Cap::BulkReceiving);
        caps.set(Cap::BulkStreams);
        caps
    }

    struct Rig {
        host: Host<MockBackend>,
        calls: Arc<Mutex<Calls>>,
        guest: Parser,
        sink: RecordingSink,
    }

    /// Builds an attached, fully negotiated host/guest pair.
    fn rig(config: Option<ConfigInfo>) -> Rig {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let backend = MockBackend {
            info: device_info(),
            config: Mutex::new(config),
            calls: calls.clone(),
        };
        let host = Host::new("test host", HostOptions::default());
        host.set_device(Some(backend)).unwrap();

        let guest = Parser::new(
            Role::Guest,
            "test guest",
            guest_caps(),
            ParserOptions::default(),
        );

        let mut rig = Rig { host, calls, guest, sink: RecordingSink::default() };
        rig.guest_to_host().unwrap(); // guest hello
        rig.drain_to_guest(); // host hello + deferred device advertisement
        rig
    }

    impl Rig {
        /// Ships everything the guest parser has queued into the host.
        fn guest_to_host(&mut self) -> Result<(), HostReadError> {
            let mut wire = MockChannel::new();
            self.guest.do_write(&mut wire).unwrap();
            let mut host_side = MockChannel::new();
            host_side.push_input(&wire.written);
            self.host.do_read(&mut host_side)
        }

        /// Ships everything the host has queued into the guest sink.
        fn drain_to_guest(&mut self) {
            let mut wire = MockChannel::new();
            self.host.do_write(&mut wire).unwrap();
            let mut guest_side = MockChannel::new();
            guest_side.push_input(&wire.written);
            self.guest.do_read(&mut guest_side, &mut self.sink).unwrap();
        }

        fn complete(&self, completion: Completion) {
            self.calls.lock().completions.push_back(completion);
            assert!(self.host.handle_events(DRAIN_POLL_INTERVAL));
        }

        fn submissions(&self) -> usize {
            self.calls.lock().submissions.len()
        }

        fn submission(&self, idx: usize) -> Submission {
            self.calls.lock().submissions[idx].clone()
        }
    }

    fn ok_completion(submission: &Submission, actual_length: usize) -> Completion {
        Completion {
            token: submission.token,
            status: TransferStatus::Completed,
            actual_length,
            buffer: submission.buffer.clone(),
            iso_packets: Vec::new(),
        }
    }

    #[test]
    fn test_claim_and_advertise() {
        let rig = rig(Some(interrupt_in_config()));

        assert_eq!(rig.calls.lock().claimed, vec![0]);
        assert_eq!(rig.calls.lock().resets, 1);
        assert!(rig.host.connected());

        // interface_info, ep_info, device_connect in that order
        let positions: Vec<usize> = rig
            .sink
            .events
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                matches!(
                    e,
                    SinkEvent::InterfaceInfo(_) | SinkEvent::EpInfo(_) | SinkEvent::DeviceConnect(_)
                )
                .then_some(i)
            })
            .collect();
        assert_eq!(positions.len(), 3);
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        match rig.sink.events.iter().find(|e| matches!(e, SinkEvent::InterfaceInfo(_))) {
            Some(SinkEvent::InterfaceInfo(h)) => {
                assert_eq!(h.interface_count, 1);
                assert_eq!(h.interface[0], 0);
                assert_eq!(h.interface_class[0], 3);
            }
            _ => unreachable!(),
        }
        match rig.sink.events.iter().find(|e| matches!(e, SinkEvent::EpInfo(_))) {
            Some(SinkEvent::EpInfo(h)) => {
                assert_eq!(h.kind[0x00], TransferKind::Control as u8);
                assert_eq!(h.kind[0x10], TransferKind::Control as u8);
                assert_eq!(h.kind[0x11], TransferKind::Interrupt as u8);
                assert_eq!(h.max_packet_size[0x11], 8);
                assert_eq!(h.interval[0x11], 10);
                assert_eq!(h.kind[0x01], TransferKind::Invalid as u8);
            }
            _ => unreachable!(),
        }
        match rig.sink.events.iter().find(|e| matches!(e, SinkEvent::DeviceConnect(_))) {
            Some(SinkEvent::DeviceConnect(h)) => {
                assert_eq!(h.vendor_id, 0x1234);
                assert_eq!(h.product_id, 0x5678);
                assert_eq!(h.device_version_bcd, 0x0100);
                assert_eq!(h.device_class, 0x03);
                assert_eq!(h.speed, Speed::Full as u8);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_reconnect_waits_for_disconnect_ack() {
        let mut rig = rig(Some(interrupt_in_config()));

        rig.host.set_device(None).unwrap();
        assert!(!rig.host.connected());

        // Re-attach before the guest acknowledged the disconnect
        let backend = MockBackend {
            info: device_info(),
            config: Mutex::new(Some(interrupt_in_config())),
            calls: rig.calls.clone(),
        };
        rig.host.set_device(Some(backend)).unwrap();

        rig.sink.events.clear();
        rig.drain_to_guest();
        assert!(rig.sink.events.contains(&SinkEvent::DeviceDisconnect));
        assert!(!rig.sink.events.iter().any(|e| matches!(e, SinkEvent::DeviceConnect(_))));

        // Receiving device_disconnect made the guest parser queue the ack;
        // delivering it releases the deferred device_connect
        rig.guest_to_host().unwrap();
        rig.drain_to_guest();
        assert!(rig.sink.events.iter().any(|e| matches!(e, SinkEvent::DeviceConnect(_))));
    }

    #[test]
    fn test_iso_stream_backpressure() {
        let mut rig = rig(Some(iso_in_config()));

        rig.guest.queue_packet(
            10,
            &TypeHeader::StartIsoStream(StartIsoStreamHeader {
                endpoint: 0x81,
                pkts_per_transfer: 8,
                transfer_count: 4,
            }),
            &[],
        );
        rig.guest_to_host().unwrap();

        // All four ring transfers submitted up front
        assert_eq!(rig.submissions(), 4);
        assert_eq!(rig.submission(0).buffer.len(), 8 * 512);
        rig.drain_to_guest();
        assert!(rig.sink.events.contains(&SinkEvent::IsoStreamStatus {
            id: 10,
            header: IsoStreamStatusHeader { status: Status::Success as u8, endpoint: 0x81 },
        }));

        let iso_completion = |s: &Submission| Completion {
            token: s.token,
            status: TransferStatus::Completed,
            actual_length: 0,
            buffer: s.buffer.clone(),
            iso_packets: (0..8)
                .map(|i| IsoPacketResult {
                    status: TransferStatus::Completed,
                    offset: i * 512,
                    actual_length: 512,
                })
                .collect(),
        };

        // Stuff the outbound queue past the high threshold (3 * 8 * 4 * 512
        // = 49152 bytes): iso input must now be dropped
        rig.host.parser().queue_packet(
            0,
            &TypeHeader::IsoPacket(IsoPacketHeader {
                endpoint: 0x81,
                status: 0,
                length: 60000,
            }),
            &vec![0; 60000],
        );
        let before = rig.host.parser().pending_writes();
        rig.complete(iso_completion(&rig.submission(0)));
        assert_eq!(rig.host.parser().pending_writes(), before);
        // The transfer was still resubmitted
        assert_eq!(rig.submissions(), 5);

        // Drain below the low threshold (8192): packets flow again
        rig.drain_to_guest();
        assert_eq!(rig.host.buffered_output_size(), 0);
        rig.complete(iso_completion(&rig.submission(1)));
        assert_eq!(rig.host.parser().pending_writes(), 8);

        rig.sink.events.clear();
        rig.drain_to_guest();
        let iso_packets = rig
            .sink
            .events
            .iter()
            .filter(|e| matches!(e, SinkEvent::IsoPacket { .. }))
            .count();
        assert_eq!(iso_packets, 8);
    }

    #[test]
    fn test_cancel_in_flight_bulk() {
        let mut rig = rig(Some(bulk_config()));

        rig.guest.queue_packet(
            42,
            &TypeHeader::BulkPacket(BulkPacketHeader {
                endpoint: 0x82,
                status: 0,
                length: 512,
                stream_id: 0,
                length_high: 0,
            }),
            &[],
        );
        rig.guest_to_host().unwrap();
        assert_eq!(rig.submissions(), 1);
        let submission = rig.submission(0);

        rig.guest.queue_packet(42, &TypeHeader::CancelDataPacket, &[]);
        rig.guest_to_host().unwrap();
        assert_eq!(rig.calls.lock().cancelled, vec![submission.token]);

        // The device layer eventually reports the cancellation; it must not
        // produce a second reply
        rig.complete(Completion {
            token: submission.token,
            status: TransferStatus::Cancelled,
            actual_length: 0,
            buffer: submission.buffer.clone(),
            iso_packets: Vec::new(),
        });

        rig.sink.events.clear();
        rig.drain_to_guest();
        let replies: Vec<_> = rig
            .sink
            .events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::BulkPacket { id, header, data } => Some((*id, *header, data.len())),
                _ => None,
            })
            .collect();
        assert_eq!(replies.len(), 1);
        let (id, header, data_len) = replies[0];
        assert_eq!(id, 42);
        assert_eq!(header.status, Status::Cancelled as u8);
        assert_eq!(header.length, 0);
        assert_eq!(header.length_high, 0);
        assert_eq!(data_len, 0);
    }

    #[test]
    fn test_cancel_of_completed_transfer_is_not_an_error() {
        let mut rig = rig(Some(bulk_config()));

        rig.guest.queue_packet(
            7,
            &TypeHeader::BulkPacket(BulkPacketHeader {
                endpoint: 0x82,
                status: 0,
                length: 4,
                stream_id: 0,
                length_high: 0,
            }),
            &[],
        );
        rig.guest_to_host().unwrap();
        let submission = rig.submission(0);
        rig.complete(ok_completion(&submission, 4));

        // The cancel races the completion and finds nothing
        rig.guest.queue_packet(7, &TypeHeader::CancelDataPacket, &[]);
        rig.guest_to_host().unwrap();
        assert!(rig.calls.lock().cancelled.is_empty());

        rig.sink.events.clear();
        rig.drain_to_guest();
        let replies = rig
            .sink
            .events
            .iter()
            .filter(|e| matches!(e, SinkEvent::BulkPacket { .. }))
            .count();
        assert_eq!(replies, 1); // only the successful completion
    }

    #[test]
    fn test_clear_halt_on_control_clear_feature() {
        let mut rig = rig(Some(interrupt_in_config()));

        rig.guest.queue_packet(
            3,
            &TypeHeader::ControlPacket(ControlPacketHeader {
                endpoint: 0x00,
                request: Request::CLEAR_FEATURE,
                requesttype: Recipient::Endpoint as u8,
                status: 0,
                value: 0,
                index: 0x81,
                length: 0,
            }),
            &[],
        );
        rig.guest_to_host().unwrap();

        assert_eq!(rig.calls.lock().cleared_halts, vec![0x81]);
        // No transfer was queued towards the device
        assert_eq!(rig.submissions(), 0);

        rig.drain_to_guest();
        match rig.sink.events.last() {
            Some(SinkEvent::ControlPacket { id, header, data }) => {
                assert_eq!(*id, 3);
                assert_eq!(header.status, Status::Success as u8);
                assert_eq!(header.length, 0);
                assert!(data.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_alt_setting_rebuilds_endpoint_table() {
        let mut config = config_with(vec![EndpointInfo {
            address: EndpointAddress(0x02),
            kind: 2,
            interval: 0,
            max_packet_size: 512,
            max_streams: 0,
        }]);
        config.interfaces[0].alt_settings.push(AltSettingInfo {
            alt: 1,
            class: 0x03,
            subclass: 0x01,
            protocol: 0x01,
            endpoints: vec![EndpointInfo {
                address: EndpointAddress(0x83),
                kind: 3,
                interval: 8,
                max_packet_size: 16,
                max_streams: 0,
            }],
        });
        let mut rig = rig(Some(config));

        rig.guest.queue_packet(
            5,
            &TypeHeader::SetAltSetting(SetAltSettingHeader { interface: 0, alt: 1 }),
            &[],
        );
        rig.guest_to_host().unwrap();
        assert_eq!(rig.calls.lock().alt_sets, vec![(0, 1)]);

        rig.sink.events.clear();
        rig.drain_to_guest();

        match rig.sink.events.iter().rev().find(|e| matches!(e, SinkEvent::EpInfo(_))) {
            Some(SinkEvent::EpInfo(h)) => {
                assert_eq!(h.kind[0x02], TransferKind::Invalid as u8);
                assert_eq!(h.kind[0x13], TransferKind::Interrupt as u8);
                assert_eq!(h.max_packet_size[0x13], 16);
            }
            _ => panic!("no ep_info after alt setting change"),
        }
        assert!(rig.sink.events.contains(&SinkEvent::AltSettingStatus {
            id: 5,
            header: AltSettingStatusHeader {
                status: Status::Success as u8,
                interface: 0,
                alt: 1,
            },
        }));
    }

    #[test]
    fn test_set_configuration_same_value_acks_immediately() {
        let mut rig = rig(Some(interrupt_in_config()));
        let claims_before = rig.calls.lock().claimed.len();

        rig.guest.queue_packet(
            9,
            &TypeHeader::SetConfiguration(SetConfigurationHeader { configuration: 1 }),
            &[],
        );
        rig.guest_to_host().unwrap();

        assert!(rig.calls.lock().set_configs.is_empty());
        assert_eq!(rig.calls.lock().claimed.len(), claims_before);
        rig.drain_to_guest();
        assert!(rig.sink.events.contains(&SinkEvent::ConfigurationStatus {
            id: 9,
            header: ConfigurationStatusHeader {
                status: Status::Success as u8,
                configuration: 1,
            },
        }));
    }

    #[test]
    fn test_set_configuration_change_reclaims() {
        let mut rig = rig(Some(interrupt_in_config()));

        rig.guest.queue_packet(
            11,
            &TypeHeader::SetConfiguration(SetConfigurationHeader { configuration: 2 }),
            &[],
        );
        rig.guest_to_host().unwrap();

        {
            let calls = rig.calls.lock();
            assert_eq!(calls.set_configs, vec![2]);
            assert_eq!(calls.released, vec![0]);
            assert_eq!(calls.claimed, vec![0, 0]);
        }

        rig.sink.events.clear();
        rig.drain_to_guest();
        // Fresh interface/ep info precede the status reply
        assert!(rig.sink.events.iter().any(|e| matches!(e, SinkEvent::EpInfo(_))));
        assert!(rig.sink.events.contains(&SinkEvent::ConfigurationStatus {
            id: 11,
            header: ConfigurationStatusHeader {
                status: Status::Success as u8,
                configuration: 2,
            },
        }));
    }

    #[test]
    fn test_requests_while_disconnected_reply_ioerror() {
        let mut rig = rig(Some(interrupt_in_config()));
        rig.host.set_device(None).unwrap();

        rig.guest.queue_packet(
            21,
            &TypeHeader::ControlPacket(ControlPacketHeader {
                endpoint: 0x80,
                request: 0x06,
                requesttype: 0x80,
                status: 0,
                value: 0x0100,
                index: 0,
                length: 8,
            }),
            &[],
        );
        rig.guest_to_host().unwrap();
        assert_eq!(rig.submissions(), 0);

        rig.sink.events.clear();
        rig.drain_to_guest();
        match rig.sink.events.iter().find(|e| matches!(e, SinkEvent::ControlPacket { .. })) {
            Some(SinkEvent::ControlPacket { id, header, .. }) => {
                assert_eq!(*id, 21);
                assert_eq!(header.status, Status::Ioerror as u8);
                assert_eq!(header.length, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_interrupt_receiving_ring() {
        let mut rig = rig(Some(interrupt_in_config()));

        rig.guest.queue_packet(
            30,
            &TypeHeader::StartInterruptReceiving(StartInterruptReceivingHeader { endpoint: 0x81 }),
            &[],
        );
        rig.guest_to_host().unwrap();

        // A fixed ring of five transfers, ids 0..=4
        assert_eq!(rig.submissions(), 5);
        rig.drain_to_guest();
        assert!(rig.sink.events.contains(&SinkEvent::InterruptReceivingStatus {
            id: 30,
            header: InterruptReceivingStatusHeader {
                status: Status::Success as u8,
                endpoint: 0x81,
            },
        }));

        // One transfer completes with 3 bytes: data reaches the guest and
        // the transfer is resubmitted with its id advanced by the ring size
        let submission = rig.submission(0);
        let mut buffer = submission.buffer.clone();
        buffer[..3].copy_from_slice(&[0xaa, 0xbb, 0xcc]);
        rig.complete(Completion {
            token: submission.token,
            status: TransferStatus::Completed,
            actual_length: 3,
            buffer,
            iso_packets: Vec::new(),
        });
        assert_eq!(rig.submissions(), 6);

        rig.sink.events.clear();
        rig.drain_to_guest();
        match rig.sink.events.last() {
            Some(SinkEvent::InterruptPacket { id, header, data }) => {
                assert_eq!(*id, 0);
                assert_eq!(header.status, Status::Success as u8);
                assert_eq!(data.as_slice(), &[0xaa, 0xbb, 0xcc]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_iso_out_staging_starts_at_half_ring() {
        let mut rig = rig(Some(iso_out_config()));

        rig.guest.queue_packet(
            0,
            &TypeHeader::StartIsoStream(StartIsoStreamHeader {
                endpoint: 0x01,
                pkts_per_transfer: 2,
                transfer_count: 4,
            }),
            &[],
        );
        rig.guest_to_host().unwrap();
        // Output streams stage first, nothing is submitted yet
        assert_eq!(rig.submissions(), 0);

        // 2 pkts * 4 transfers / 2 = 4 packets fill half the ring
        for id in 0..4u64 {
            rig.guest.queue_packet(
                id,
                &TypeHeader::IsoPacket(IsoPacketHeader {
                    endpoint: 0x01,
                    status: 0,
                    length: 512,
                }),
                &vec![id as u8; 512],
            );
            rig.guest_to_host().unwrap();
            if id < 3 {
                assert_eq!(rig.submissions(), 0);
            }
        }
        // Half the ring (two transfers of two packets) went out at once
        assert_eq!(rig.submissions(), 2);
        let first = rig.submission(0);
        assert_eq!(first.buffer[0], 0);
        assert_eq!(first.buffer[512], 1);
        match &first.kind {
            SubmissionKind::Iso { packet_lengths } => assert_eq!(packet_lengths, &vec![512, 512]),
            other => panic!("unexpected submission kind {:?}", other),
        }

        // The next full transfer is submitted directly
        for id in 4..6u64 {
            rig.guest.queue_packet(
                id,
                &TypeHeader::IsoPacket(IsoPacketHeader {
                    endpoint: 0x01,
                    status: 0,
                    length: 512,
                }),
                &vec![id as u8; 512],
            );
            rig.guest_to_host().unwrap();
        }
        assert_eq!(rig.submissions(), 3);
    }

    #[test]
    fn test_stop_iso_stream_cancels_and_restarts_cleanly() {
        let mut rig = rig(Some(iso_in_config()));

        let start = TypeHeader::StartIsoStream(StartIsoStreamHeader {
            endpoint: 0x81,
            pkts_per_transfer: 4,
            transfer_count: 2,
        });
        rig.guest.queue_packet(1, &start, &[]);
        rig.guest_to_host().unwrap();
        assert_eq!(rig.submissions(), 2);

        rig.guest.queue_packet(
            2,
            &TypeHeader::StopIsoStream(StopIsoStreamHeader { endpoint: 0x81 }),
            &[],
        );
        rig.guest_to_host().unwrap();
        let cancelled: Vec<TransferToken> = rig.calls.lock().cancelled.clone();
        assert_eq!(cancelled.len(), 2);

        // Drain the cancellations so the ring is free again
        for (i, token) in cancelled.iter().enumerate() {
            rig.complete(Completion {
                token: *token,
                status: TransferStatus::Cancelled,
                actual_length: 0,
                buffer: rig.submission(i).buffer.clone(),
                iso_packets: Vec::new(),
            });
        }

        rig.guest.queue_packet(3, &start, &[]);
        rig.guest_to_host().unwrap();
        assert_eq!(rig.submissions(), 4);

        rig.drain_to_guest();
        let statuses = rig
            .sink
            .events
            .iter()
            .filter(|e| matches!(e, SinkEvent::IsoStreamStatus { .. }))
            .count();
        assert_eq!(statuses, 3); // start, stop, start
    }

    #[test]
    fn test_submit_error_is_injected_as_completion() {
        let mut rig = rig(Some(bulk_config()));
        rig.calls.lock().fail_next_submit = Some(BackendError::Other);

        rig.guest.queue_packet(
            13,
            &TypeHeader::BulkPacket(BulkPacketHeader {
                endpoint: 0x02,
                status: 0,
                length: 4,
                stream_id: 0,
                length_high: 0,
            }),
            &[1, 2, 3, 4],
        );
        rig.guest_to_host().unwrap();
        assert_eq!(rig.submissions(), 0);

        rig.drain_to_guest();
        match rig.sink.events.last() {
            Some(SinkEvent::BulkPacket { id, header, data }) => {
                assert_eq!(*id, 13);
                assert_eq!(header.status, Status::Ioerror as u8);
                assert_eq!(header.length, 0);
                assert!(data.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_bulk_out_roundtrip() {
        let mut rig = rig(Some(bulk_config()));

        rig.guest.queue_packet(
            17,
            &TypeHeader::BulkPacket(BulkPacketHeader {
                endpoint: 0x02,
                status: 0,
                length: 4,
                stream_id: 0,
                length_high: 0,
            }),
            &[9, 8, 7, 6],
        );
        rig.guest_to_host().unwrap();
        let submission = rig.submission(0);
        assert_eq!(submission.buffer, vec![9, 8, 7, 6]);
        assert_eq!(submission.endpoint, EndpointAddress(0x02));

        rig.complete(ok_completion(&submission, 4));
        rig.sink.events.clear();
        rig.drain_to_guest();
        match rig.sink.events.last() {
            Some(SinkEvent::BulkPacket { id, header, data }) => {
                assert_eq!(*id, 17);
                assert_eq!(header.status, Status::Success as u8);
                assert_eq!(header.length, 4);
                assert!(data.is_empty()); // out transfers report status only
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_guest_filter_is_stored_and_reject_surfaces() {
        let mut rig = rig(Some(interrupt_in_config()));

        let rules = vec![filter::Rule {
            device_class: 0x03,
            vendor_id: -1,
            product_id: -1,
            device_version_bcd: -1,
            allow: false,
        }];
        rig.guest.send_filter(&rules);
        rig.guest_to_host().unwrap();
        assert_eq!(rig.host.guest_filter(), Some(rules));

        rig.guest.queue_packet(0, &TypeHeader::FilterReject, &[]);
        assert_eq!(rig.guest_to_host(), Err(HostReadError::DeviceRejected));
    }

    #[test]
    fn test_control_in_roundtrip() {
        let mut rig = rig(Some(interrupt_in_config()));

        rig.guest.queue_packet(
            55,
            &TypeHeader::ControlPacket(ControlPacketHeader {
                endpoint: 0x80,
                request: 0x06,
                requesttype: 0x80,
                status: 0,
                value: 0x0100,
                index: 0,
                length: 18,
            }),
            &[],
        );
        rig.guest_to_host().unwrap();
        let submission = rig.submission(0);
        assert_eq!(submission.buffer.len(), 18);
        match &submission.kind {
            SubmissionKind::Control { setup } => {
                assert_eq!(setup.request_type, 0x80);
                assert_eq!(setup.request, 0x06);
                assert_eq!(setup.value, 0x0100);
                assert_eq!(setup.length, 18);
            }
            other => panic!("unexpected submission kind {:?}", other),
        }

        let mut buffer = submission.buffer.clone();
        buffer[..4].copy_from_slice(&[0x12, 0x01, 0x00, 0x02]);
        rig.complete(Completion {
            token: submission.token,
            status: TransferStatus::Completed,
            actual_length: 4,
            buffer,
            iso_packets: Vec::new(),
        });

        rig.sink.events.clear();
        rig.drain_to_guest();
        match rig.sink.events.last() {
            Some(SinkEvent::ControlPacket { id, header, data }) => {
                assert_eq!(*id, 55);
                assert_eq!(header.status, Status::Success as u8);
                assert_eq!(header.length, 4);
                assert_eq!(data.as_slice(), &[0x12, 0x01, 0x00, 0x02]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_reset_request_cancels_and_resets_once() {
        let mut rig = rig(Some(interrupt_in_config()));
        // set_device already reset once
        assert_eq!(rig.calls.lock().resets, 1);

        // Nothing happened since that reset, so the request is a no-op
        rig.guest.queue_packet(0, &TypeHeader::Reset, &[]);
        rig.guest_to_host().unwrap();
        assert_eq!(rig.calls.lock().resets, 1);

        // After traffic the reset flag is gone and the request resets again
        rig.guest.queue_packet(
            60,
            &TypeHeader::ControlPacket(ControlPacketHeader {
                endpoint: 0x80,
                request: 0,
                requesttype: 0x80,
                status: 0,
                value: 0,
                index: 0,
                length: 2,
            }),
            &[],
        );
        rig.guest_to_host().unwrap();
        let submission = rig.submission(0);
        rig.complete(ok_completion(&submission, 2));

        rig.guest.queue_packet(0, &TypeHeader::Reset, &[]);
        rig.guest_to_host().unwrap();
        assert_eq!(rig.calls.lock().resets, 2);
    }
}
