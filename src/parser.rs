//! Streaming codec and session layer
//!
//! A [`Parser`] turns raw bytes from a [`Channel`](crate::Channel) into
//! dispatched messages and queues outbound messages for later draining. It
//! owns the session state: the capability sets of both peers and the
//! resulting header widths.
//!
//! The inbound side is a resumable state machine with three phases per
//! packet (fixed header, type-specific header, payload). It never blocks on
//! its own: when the channel would block, `do_read` returns and the next
//! call resumes exactly where parsing stopped. Framing violations skip the
//! remainder of the offending packet and leave the parser usable.
//!
//! Inbound messages are delivered to a [`PacketSink`], one method per
//! message type. Payload-bearing packets hand their buffer to the sink by
//! value.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, error, info, warn};
use spin::{Mutex, RwLock};

use crate::caps::{Cap, Caps, CAPS_WORDS};
use crate::filter;
use crate::proto::{self, parse, Header, HelloHeader, Role, TypeHeader};
use crate::{Channel, ChannelError};

/// Magic bytes leading a serialized parser snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0x55525031;

/// Error returned by [`Parser::do_read`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadError {
    /// A packet violated the framing rules; its remaining bytes will be
    /// skipped and the session stays usable.
    Parse,
    /// The channel failed. The session should be closed.
    Channel(ChannelError),
}

/// Error returned by [`Parser::do_write`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteError {
    Channel(ChannelError),
}

/// Error returned by [`Parser::unserialize`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SnapshotError {
    BadMagic,
    /// The embedded total length does not match the blob.
    LengthMismatch,
    /// The snapshot was taken with capabilities this parser does not have.
    CapsMismatch,
    /// Restore target is not a pristine parser.
    NotPristine,
    /// The blob ended early, carried trailing bytes, or described an
    /// invalid packet.
    Malformed,
}

/// Construction options for a [`Parser`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ParserOptions {
    /// Do not queue the initial `hello` (used when restoring a snapshot).
    pub no_hello: bool,
    /// The channel takes ownership of each buffer it is handed; partial
    /// writes are a contract violation in this mode.
    pub write_cb_owns_buffer: bool,
}

/// Consumer of inbound messages.
///
/// One method per message type; the parser calls these from within
/// [`Parser::do_read`] once a packet is complete and validated. Payload
/// buffers are passed by value and owned by the implementation afterwards.
///
/// Default implementations drop the message with a debug log, so an
/// implementation only spells out the messages its side of the session can
/// meaningfully receive.
///
/// Handlers must not call back into `do_read` on the same parser.
#[allow(unused_variables)]
pub trait PacketSink {
    fn hello(&mut self, hello: &HelloHeader) {}
    fn device_connect(&mut self, header: &proto::DeviceConnectHeader) {
        debug!("ignoring device_connect");
    }
    fn device_disconnect(&mut self) {
        debug!("ignoring device_disconnect");
    }
    fn device_disconnect_ack(&mut self) {
        debug!("ignoring device_disconnect_ack");
    }
    fn reset(&mut self) {
        debug!("ignoring reset");
    }
    fn interface_info(&mut self, header: &proto::InterfaceInfoHeader) {
        debug!("ignoring interface_info");
    }
    fn ep_info(&mut self, header: &proto::EpInfoHeader) {
        debug!("ignoring ep_info");
    }
    fn set_configuration(&mut self, id: u64, header: &proto::SetConfigurationHeader) {
        debug!("ignoring set_configuration");
    }
    fn get_configuration(&mut self, id: u64) {
        debug!("ignoring get_configuration");
    }
    fn configuration_status(&mut self, id: u64, header: &proto::ConfigurationStatusHeader) {
        debug!("ignoring configuration_status");
    }
    fn set_alt_setting(&mut self, id: u64, header: &proto::SetAltSettingHeader) {
        debug!("ignoring set_alt_setting");
    }
    fn get_alt_setting(&mut self, id: u64, header: &proto::GetAltSettingHeader) {
        debug!("ignoring get_alt_setting");
    }
    fn alt_setting_status(&mut self, id: u64, header: &proto::AltSettingStatusHeader) {
        debug!("ignoring alt_setting_status");
    }
    fn start_iso_stream(&mut self, id: u64, header: &proto::StartIsoStreamHeader) {
        debug!("ignoring start_iso_stream");
    }
    fn stop_iso_stream(&mut self, id: u64, header: &proto::StopIsoStreamHeader) {
        debug!("ignoring stop_iso_stream");
    }
    fn iso_stream_status(&mut self, id: u64, header: &proto::IsoStreamStatusHeader) {
        debug!("ignoring iso_stream_status");
    }
    fn start_interrupt_receiving(&mut self, id: u64, header: &proto::StartInterruptReceivingHeader) {
        debug!("ignoring start_interrupt_receiving");
    }
    fn stop_interrupt_receiving(&mut self, id: u64, header: &proto::StopInterruptReceivingHeader) {
        debug!("ignoring stop_interrupt_receiving");
    }
    fn interrupt_receiving_status(
        &mut self,
        id: u64,
        header: &proto::InterruptReceivingStatusHeader,
    ) {
        debug!("ignoring interrupt_receiving_status");
    }
    fn alloc_bulk_streams(&mut self, id: u64, header: &proto::AllocBulkStreamsHeader) {
        debug!("ignoring alloc_bulk_streams");
    }
    fn free_bulk_streams(&mut self, id: u64, header: &proto::FreeBulkStreamsHeader) {
        debug!("ignoring free_bulk_streams");
    }
    fn bulk_streams_status(&mut self, id: u64, header: &proto::BulkStreamsStatusHeader) {
        debug!("ignoring bulk_streams_status");
    }
    fn cancel_data_packet(&mut self, id: u64) {
        debug!("ignoring cancel_data_packet");
    }
    fn filter_reject(&mut self) {
        debug!("ignoring filter_reject");
    }
    fn filter_filter(&mut self, rules: Vec<filter::Rule>) {
        debug!("ignoring filter_filter");
    }
    fn start_bulk_receiving(&mut self, id: u64, header: &proto::StartBulkReceivingHeader) {
        debug!("ignoring start_bulk_receiving");
    }
    fn stop_bulk_receiving(&mut self, id: u64, header: &proto::StopBulkReceivingHeader) {
        debug!("ignoring stop_bulk_receiving");
    }
    fn bulk_receiving_status(&mut self, id: u64, header: &proto::BulkReceivingStatusHeader) {
        debug!("ignoring bulk_receiving_status");
    }
    fn control_packet(&mut self, id: u64, header: &proto::ControlPacketHeader, data: Vec<u8>) {
        debug!("ignoring control_packet");
    }
    fn bulk_packet(&mut self, id: u64, header: &proto::BulkPacketHeader, data: Vec<u8>) {
        debug!("ignoring bulk_packet");
    }
    fn iso_packet(&mut self, id: u64, header: &proto::IsoPacketHeader, data: Vec<u8>) {
        debug!("ignoring iso_packet");
    }
    fn interrupt_packet(&mut self, id: u64, header: &proto::InterruptPacketHeader, data: Vec<u8>) {
        debug!("ignoring interrupt_packet");
    }
    fn buffered_bulk_packet(
        &mut self,
        id: u64,
        header: &proto::BufferedBulkPacketHeader,
        data: Vec<u8>,
    ) {
        debug!("ignoring buffered_bulk_packet");
    }
}

/// One queued outbound buffer with its send progress.
struct WriteBuf {
    buf: Vec<u8>,
    pos: usize,
}

#[derive(Default)]
struct OutQueue {
    bufs: VecDeque<WriteBuf>,
    total_size: u64,
}

struct SessionState {
    our_caps: Caps,
    peer_caps: Caps,
    have_peer_caps: bool,
}

/// Inbound parse state: which phase the current packet is in and how far
/// each phase has read.
struct ParseState {
    to_skip: usize,
    header_buf: [u8; 16],
    header_read: usize,
    /// Parsed fixed header, present once `header_read` reaches the header
    /// length.
    header: Option<Header>,
    type_header: [u8; proto::MAX_TYPE_HEADER_SIZE],
    type_header_len: usize,
    type_header_read: usize,
    data: Vec<u8>,
    data_read: usize,
}

impl ParseState {
    fn pristine() -> Self {
        ParseState {
            to_skip: 0,
            header_buf: [0; 16],
            header_read: 0,
            header: None,
            type_header: [0; proto::MAX_TYPE_HEADER_SIZE],
            type_header_len: 0,
            type_header_read: 0,
            data: Vec::new(),
            data_read: 0,
        }
    }

    /// Forget the current packet (after dispatch or on a framing error).
    fn reset_packet(&mut self) {
        self.header_read = 0;
        self.header = None;
        self.type_header_len = 0;
        self.type_header_read = 0;
        self.data = Vec::new();
        self.data_read = 0;
    }
}

/// The wire protocol codec and session.
///
/// All methods take `&self`; internal state is guarded by its own locks so
/// a protocol context and a device-event context can use the parser
/// concurrently (one reader at a time, any number of queueing writers).
pub struct Parser {
    role: Role,
    write_cb_owns_buffer: bool,
    session: RwLock<SessionState>,
    state: Mutex<ParseState>,
    queue: Mutex<OutQueue>,
}

impl Parser {
    /// Creates a parser for one side of a session and, unless suppressed,
    /// queues the initial `hello` carrying `version` and `caps`.
    pub fn new(role: Role, version: &str, caps: Caps, options: ParserOptions) -> Parser {
        let mut our_caps = caps;
        // A host session always advertises the disconnect ack capability
        if role == Role::Host {
            our_caps.set(Cap::DeviceDisconnectAck);
        }
        our_caps.verify("our");

        let parser = Parser {
            role,
            write_cb_owns_buffer: options.write_cb_owns_buffer,
            session: RwLock::new(SessionState {
                our_caps,
                peer_caps: Caps::none(),
                have_peer_caps: false,
            }),
            state: Mutex::new(ParseState::pristine()),
            queue: Mutex::new(OutQueue::default()),
        };

        if !options.no_hello {
            let hello = TypeHeader::Hello(HelloHeader::new(version));
            parser.queue_packet(0, &hello, &our_caps.to_bytes());
        }
        parser
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn have_peer_caps(&self) -> bool {
        self.session.read().have_peer_caps
    }

    pub fn have_cap(&self, cap: Cap) -> bool {
        self.session.read().our_caps.has(cap)
    }

    pub fn peer_has_cap(&self, cap: Cap) -> bool {
        self.session.read().peer_caps.has(cap)
    }

    /// Whether packet ids are 64 bits wide on the wire.
    ///
    /// True only once both peers have advertised
    /// [`Cap::Ids64Bits`]; before the peer's `hello` the narrow historic
    /// width is in effect.
    pub fn using_wide_ids(&self) -> bool {
        let session = self.session.read();
        session.our_caps.has(Cap::Ids64Bits) && session.peer_caps.has(Cap::Ids64Bits)
    }

    /// Number of queued-but-unfinished outbound buffers.
    pub fn pending_writes(&self) -> usize {
        self.queue.lock().bufs.len()
    }

    pub fn has_data_to_write(&self) -> bool {
        self.pending_writes() != 0
    }

    /// Total bytes queued for the peer but not yet written.
    pub fn buffered_output_size(&self) -> u64 {
        self.queue.lock().total_size
    }

    fn active_caps(session: &SessionState) -> Caps {
        session.our_caps.intersect(&session.peer_caps)
    }

    /// Validates and queues one outbound message.
    ///
    /// An illegal message (wrong direction, missing capability, payload
    /// mismatch) is dropped with an error log rather than poisoning the
    /// stream; see the error handling rules of the protocol.
    pub fn queue_packet(&self, id: u64, header: &TypeHeader, data: &[u8]) {
        let session = self.session.read();
        let active = Self::active_caps(&session);
        let msg_type = header.msg_type();

        let Some(type_header_len) = proto::type_header_len(msg_type, self.role, true, &active)
        else {
            error!("queueing packet type {} illegal for this direction", msg_type);
            return;
        };

        if !proto::verify_type_header(
            header,
            data,
            self.role,
            true,
            &session.our_caps,
            &session.peer_caps,
        ) {
            error!("dropping invalid outbound packet type {}", msg_type);
            return;
        }

        let wide_ids = session.our_caps.has(Cap::Ids64Bits) && session.peer_caps.has(Cap::Ids64Bits);
        let header_len = proto::header_len(wide_ids);
        let mut buf = Vec::with_capacity(header_len + type_header_len + data.len());
        Header {
            msg_type,
            length: (type_header_len + data.len()) as u32,
            id,
        }
        .write_to(&mut buf, wide_ids);
        header.write_to(&mut buf, &active);
        debug_assert_eq!(buf.len(), header_len + type_header_len);
        buf.extend_from_slice(data);
        drop(session);

        let mut queue = self.queue.lock();
        queue.total_size += buf.len() as u64;
        queue.bufs.push_back(WriteBuf { buf, pos: 0 });
    }

    /// Serializes `rules` and queues a `filter_filter` message.
    ///
    /// Silently does nothing when the peer does not understand filters.
    pub fn send_filter(&self, rules: &[filter::Rule]) {
        if !self.peer_has_cap(Cap::Filter) {
            return;
        }
        match filter::rules_to_string(rules, ",", "|") {
            Ok(mut s) => {
                s.push('\0');
                self.queue_packet(0, &TypeHeader::FilterFilter, s.as_bytes());
            }
            Err(e) => error!("error creating filter string, not sending filter: {:?}", e),
        }
    }

    /// Drains the outbound queue into `channel` until everything is
    /// written, the channel would block, or the channel fails.
    ///
    /// # Panics
    ///
    /// In `write_cb_owns_buffer` mode a partial write violates the
    /// all-or-nothing contract and panics.
    pub fn do_write<C: Channel>(&self, channel: &mut C) -> Result<(), WriteError> {
        let mut queue = self.queue.lock();
        while let Some(wbuf) = queue.bufs.front_mut() {
            let remaining = wbuf.buf.len() - wbuf.pos;
            let written = channel
                .write(&wbuf.buf[wbuf.pos..])
                .map_err(WriteError::Channel)?;
            if written == 0 {
                return Ok(()); // would block, resume later
            }
            if self.write_cb_owns_buffer && written != remaining {
                panic!("partial write of an owned buffer");
            }
            wbuf.pos += written;
            if wbuf.pos == wbuf.buf.len() {
                queue.total_size -= wbuf.buf.len() as u64;
                queue.bufs.pop_front();
            }
        }
        Ok(())
    }

    /// Consumes bytes from `channel` until it would block or fails,
    /// dispatching every completed packet to `sink`.
    ///
    /// Framing violations skip the rest of the offending packet and return
    /// [`ReadError::Parse`]; the parser stays usable and the next call
    /// resumes with the following packet.
    pub fn do_read<C: Channel, S: PacketSink>(
        &self,
        channel: &mut C,
        sink: &mut S,
    ) -> Result<(), ReadError> {
        let mut st = self.state.lock();

        // Skip forward to the next packet (only used after errors)
        while st.to_skip > 0 {
            let mut scratch = [0; 4096];
            let want = st.to_skip.min(scratch.len());
            let n = channel
                .read(&mut scratch[..want])
                .map_err(ReadError::Channel)?;
            if n == 0 {
                return Ok(());
            }
            st.to_skip -= n;
        }

        loop {
            let header_len = proto::header_len(self.using_wide_ids());

            if st.header_read < header_len {
                let range = st.header_read..header_len;
                let n = channel
                    .read(&mut st.header_buf[range])
                    .map_err(ReadError::Channel)?;
                if n == 0 {
                    return Ok(());
                }
                st.header_read += n;
                if st.header_read == header_len {
                    if let Err(e) = self.begin_packet(&mut st) {
                        return Err(e);
                    }
                }
                continue;
            }

            if st.type_header_read < st.type_header_len {
                let range = st.type_header_read..st.type_header_len;
                let n = channel
                    .read(&mut st.type_header[range])
                    .map_err(ReadError::Channel)?;
                if n == 0 {
                    return Ok(());
                }
                st.type_header_read += n;
                continue;
            }

            if st.data_read < st.data.len() {
                let range = st.data_read..st.data.len();
                let n = channel
                    .read(&mut st.data[range])
                    .map_err(ReadError::Channel)?;
                if n == 0 {
                    return Ok(());
                }
                st.data_read += n;
                if st.data_read < st.data.len() {
                    continue;
                }
            }

            // All three phases complete: validate and dispatch
            self.finish_packet(&mut st, sink)?;
        }
    }

    /// Called when the fixed header is complete: validates it and sets up
    /// the remaining phases.
    fn begin_packet(&self, st: &mut ParseState) -> Result<(), ReadError> {
        let wide_ids = self.using_wide_ids();
        let header_len = proto::header_len(wide_ids);
        let Ok((_, header)) = parse::header(&st.header_buf[..header_len], wide_ids) else {
            // 16 bytes always parse; keep the failure path anyway
            st.reset_packet();
            return Err(ReadError::Parse);
        };

        let skip_packet = |st: &mut ParseState, length: u32| {
            st.to_skip = length as usize;
            st.reset_packet();
        };

        let session = self.session.read();
        let active = Self::active_caps(&session);
        drop(session);

        let Some(type_header_len) =
            proto::type_header_len(header.msg_type, self.role, false, &active)
        else {
            error!("invalid packet type: {}", header.msg_type);
            skip_packet(st, header.length);
            return Err(ReadError::Parse);
        };

        if type_header_len > proto::MAX_TYPE_HEADER_SIZE {
            error!("type specific header does not fit the parse buffer");
            skip_packet(st, header.length);
            return Err(ReadError::Parse);
        }

        if header.length > proto::MAX_PACKET_SIZE {
            error!(
                "packet length of {} larger than permitted {} bytes",
                header.length,
                proto::MAX_PACKET_SIZE
            );
            skip_packet(st, header.length);
            return Err(ReadError::Parse);
        }

        if (header.length as usize) < type_header_len
            || (header.length as usize > type_header_len
                && !proto::expect_extra_data(header.msg_type))
        {
            error!(
                "invalid packet type {} length: {}",
                header.msg_type, header.length
            );
            skip_packet(st, header.length);
            return Err(ReadError::Parse);
        }

        let data_len = header.length as usize - type_header_len;
        st.type_header_len = type_header_len;
        st.type_header_read = 0;
        st.data = vec![0; data_len];
        st.data_read = 0;
        st.header = Some(header);
        Ok(())
    }

    /// Validates the completed packet and dispatches it to the sink.
    fn finish_packet<S: PacketSink>(
        &self,
        st: &mut ParseState,
        sink: &mut S,
    ) -> Result<(), ReadError> {
        let header = match st.header {
            Some(h) => h,
            None => return Err(ReadError::Parse),
        };
        let data = core::mem::take(&mut st.data);
        let type_header_bytes = &st.type_header[..st.type_header_len];

        let session = self.session.read();
        let active = Self::active_caps(&session);
        let ours = session.our_caps;
        let peer = session.peer_caps;
        drop(session);

        let parsed = parse::type_header(type_header_bytes, header.msg_type, &active);
        st.reset_packet();

        let Some(type_header) = parsed else {
            error!("invalid type header for packet type {}", header.msg_type);
            return Err(ReadError::Parse);
        };

        if !proto::verify_type_header(&type_header, &data, self.role, false, &ours, &peer) {
            return Err(ReadError::Parse);
        }

        self.dispatch(header.id, &type_header, data, sink);
        Ok(())
    }

    fn handle_hello(&self, hello: &HelloHeader, data: &[u8]) -> bool {
        let mut session = self.session.write();
        if session.have_peer_caps {
            error!("received second hello message, ignoring");
            return false;
        }
        let mut peer_caps = Caps::from_bytes(data);
        peer_caps.verify("peer");
        session.peer_caps = peer_caps;
        session.have_peer_caps = true;

        let wide = session.our_caps.has(Cap::Ids64Bits) && peer_caps.has(Cap::Ids64Bits);
        info!(
            "peer version: {}, using {}-bit ids",
            hello.version_str(),
            if wide { 64 } else { 32 }
        );
        true
    }

    fn dispatch<S: PacketSink>(
        &self,
        id: u64,
        type_header: &TypeHeader,
        data: Vec<u8>,
        sink: &mut S,
    ) {
        match type_header {
            TypeHeader::Hello(h) => {
                if self.handle_hello(h, &data) {
                    sink.hello(h);
                }
            }
            TypeHeader::DeviceConnect(h) => sink.device_connect(h),
            TypeHeader::DeviceDisconnect => {
                sink.device_disconnect();
                // Acknowledging the disconnect is the session's job, not
                // the embedder's
                if self.peer_has_cap(Cap::DeviceDisconnectAck) {
                    self.queue_packet(0, &TypeHeader::DeviceDisconnectAck, &[]);
                }
            }
            TypeHeader::Reset => sink.reset(),
            TypeHeader::InterfaceInfo(h) => sink.interface_info(h),
            TypeHeader::EpInfo(h) => sink.ep_info(h),
            TypeHeader::SetConfiguration(h) => sink.set_configuration(id, h),
            TypeHeader::GetConfiguration => sink.get_configuration(id),
            TypeHeader::ConfigurationStatus(h) => sink.configuration_status(id, h),
            TypeHeader::SetAltSetting(h) => sink.set_alt_setting(id, h),
            TypeHeader::GetAltSetting(h) => sink.get_alt_setting(id, h),
            TypeHeader::AltSettingStatus(h) => sink.alt_setting_status(id, h),
            TypeHeader::StartIsoStream(h) => sink.start_iso_stream(id, h),
            TypeHeader::StopIsoStream(h) => sink.stop_iso_stream(id, h),
            TypeHeader::IsoStreamStatus(h) => sink.iso_stream_status(id, h),
            TypeHeader::StartInterruptReceiving(h) => sink.start_interrupt_receiving(id, h),
            TypeHeader::StopInterruptReceiving(h) => sink.stop_interrupt_receiving(id, h),
            TypeHeader::InterruptReceivingStatus(h) => sink.interrupt_receiving_status(id, h),
            TypeHeader::AllocBulkStreams(h) => sink.alloc_bulk_streams(id, h),
            TypeHeader::FreeBulkStreams(h) => sink.free_bulk_streams(id, h),
            TypeHeader::BulkStreamsStatus(h) => sink.bulk_streams_status(id, h),
            TypeHeader::CancelDataPacket => sink.cancel_data_packet(id),
            TypeHeader::FilterReject => sink.filter_reject(),
            TypeHeader::FilterFilter => {
                // Trailing NUL was verified; the text itself may still be bad
                let text = core::str::from_utf8(&data[..data.len() - 1]).unwrap_or("");
                match filter::parse_rules(text, ",", "|") {
                    Ok(rules) => sink.filter_filter(rules),
                    Err(e) => {
                        error!("error parsing filter ({:?}), ignoring filter message", e)
                    }
                }
            }
            TypeHeader::DeviceDisconnectAck => sink.device_disconnect_ack(),
            TypeHeader::StartBulkReceiving(h) => sink.start_bulk_receiving(id, h),
            TypeHeader::StopBulkReceiving(h) => sink.stop_bulk_receiving(id, h),
            TypeHeader::BulkReceivingStatus(h) => sink.bulk_receiving_status(id, h),
            TypeHeader::ControlPacket(h) => sink.control_packet(id, h, data),
            TypeHeader::BulkPacket(h) => sink.bulk_packet(id, h, data),
            TypeHeader::IsoPacket(h) => sink.iso_packet(id, h, data),
            TypeHeader::InterruptPacket(h) => sink.interrupt_packet(id, h, data),
            TypeHeader::BufferedBulkPacket(h) => sink.buffered_bulk_packet(id, h, data),
        }
    }

    /// Serializes the complete parser state into a self-contained blob.
    ///
    /// Captures both capability sets, the in-progress inbound packet (by
    /// phase cursor) and every unwritten outbound byte. The encoding is
    /// little-endian throughout.
    pub fn serialize(&self) -> Vec<u8> {
        // Same lock order as the read path: parse state, session, queue
        let st = self.state.lock();
        let session = self.session.read();
        let queue = self.queue.lock();

        let mut out = Vec::new();
        let push_u32 = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());
        let push_data = |out: &mut Vec<u8>, data: &[u8]| {
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        };

        push_u32(&mut out, SNAPSHOT_MAGIC);
        push_u32(&mut out, 0); // patched with the total length below
        push_data(&mut out, &session.our_caps.to_bytes());
        if session.have_peer_caps {
            push_data(&mut out, &session.peer_caps.to_bytes());
        } else {
            push_u32(&mut out, 0);
        }
        push_u32(&mut out, st.to_skip as u32);
        push_data(&mut out, &st.header_buf[..st.header_read]);
        push_data(&mut out, &st.type_header[..st.type_header_read]);
        push_data(&mut out, &st.data[..st.data_read]);
        push_u32(&mut out, queue.bufs.len() as u32);
        for wbuf in &queue.bufs {
            push_data(&mut out, &wbuf.buf[wbuf.pos..]);
        }

        let total = out.len() as u32;
        out[4..8].copy_from_slice(&total.to_le_bytes());
        out
    }

    /// Restores a snapshot produced by [`Parser::serialize`] into this
    /// (pristine) parser.
    ///
    /// Peer capabilities recorded in the snapshot must be a subset of what
    /// this parser supports: bits we lack fail the restore, bits we have
    /// that the snapshot lacks only warn (an older snapshot source).
    pub fn unserialize(&self, blob: &[u8]) -> Result<(), SnapshotError> {
        let mut st = self.state.lock();
        let mut session = self.session.write();
        let mut queue = self.queue.lock();

        if !queue.bufs.is_empty()
            || queue.total_size != 0
            || st.header_read != 0
            || st.type_header_read != 0
            || st.data_read != 0
            || !st.data.is_empty()
        {
            error!("unserialization must use a pristine parser");
            return Err(SnapshotError::NotPristine);
        }

        let mut cursor = Cursor { blob, pos: 0 };
        if cursor.read_u32()? != SNAPSHOT_MAGIC {
            error!("unserialize magic mismatch");
            return Err(SnapshotError::BadMagic);
        }
        if cursor.read_u32()? as usize != blob.len() {
            error!("unserialize length mismatch");
            return Err(SnapshotError::LengthMismatch);
        }

        let snap_ours = Caps::from_bytes(cursor.read_data()?);
        for i in 0..CAPS_WORDS {
            let ours = session.our_caps.0[i];
            let snap = snap_ours.0[i];
            if snap & !ours != 0 {
                // The snapshot was taken by a build with features we lack
                error!("unserialize caps mismatch ours: {:x} recv: {:x}", ours, snap);
                return Err(SnapshotError::CapsMismatch);
            }
            if snap != ours {
                warn!("unserialize missing some caps; ours: {:x} recv: {:x}", ours, snap);
            }
        }
        session.our_caps = snap_ours;

        let peer_bytes = cursor.read_data()?;
        if !peer_bytes.is_empty() {
            session.peer_caps = Caps::from_bytes(peer_bytes);
            session.have_peer_caps = true;
        }

        st.to_skip = cursor.read_u32()? as usize;

        let wide_ids =
            session.our_caps.has(Cap::Ids64Bits) && session.peer_caps.has(Cap::Ids64Bits);
        let header_len = proto::header_len(wide_ids);

        let header_bytes = cursor.read_data()?;
        if header_bytes.len() > header_len {
            return Err(SnapshotError::Malformed);
        }
        st.header_buf[..header_bytes.len()].copy_from_slice(header_bytes);
        st.header_read = header_bytes.len();
        st.type_header_len = 0;

        let mut data_len = 0;
        if st.header_read == header_len {
            let Ok((_, header)) = parse::header(&st.header_buf[..header_len], wide_ids) else {
                return Err(SnapshotError::Malformed);
            };
            if header.length > proto::MAX_PACKET_SIZE {
                error!("unserialize packet length {} too large", header.length);
                return Err(SnapshotError::Malformed);
            }
            let active = session.our_caps.intersect(&session.peer_caps);
            let Some(type_header_len) =
                proto::type_header_len(header.msg_type, self.role, false, &active)
            else {
                error!("unserialize packet header invalid");
                return Err(SnapshotError::Malformed);
            };
            if (header.length as usize) < type_header_len
                || (header.length as usize > type_header_len
                    && !proto::expect_extra_data(header.msg_type))
            {
                error!("unserialize packet header invalid");
                return Err(SnapshotError::Malformed);
            }
            st.type_header_len = type_header_len;
            data_len = header.length as usize - type_header_len;
            st.header = Some(header);
        }

        let type_header_bytes = cursor.read_data()?;
        if type_header_bytes.len() > st.type_header_len {
            return Err(SnapshotError::Malformed);
        }
        st.type_header[..type_header_bytes.len()].copy_from_slice(type_header_bytes);
        if st.header_read == header_len {
            st.type_header_read = type_header_bytes.len();
        }

        let data_bytes = cursor.read_data()?;
        if st.header_read == header_len && st.type_header_read == st.type_header_len {
            if data_bytes.len() > data_len {
                return Err(SnapshotError::Malformed);
            }
            st.data = vec![0; data_len];
            st.data[..data_bytes.len()].copy_from_slice(data_bytes);
            st.data_read = data_bytes.len();
        } else if !data_bytes.is_empty() {
            return Err(SnapshotError::Malformed);
        }

        let count = cursor.read_u32()?;
        for i in 0..count {
            let bytes = cursor.read_data()?;
            if bytes.is_empty() {
                error!("write buffer {} is empty", i);
                return Err(SnapshotError::Malformed);
            }
            queue.total_size += bytes.len() as u64;
            queue.bufs.push_back(WriteBuf {
                buf: bytes.to_vec(),
                pos: 0,
            });
        }

        if cursor.pos != blob.len() {
            error!(
                "unserialize {} bytes of extraneous state data",
                blob.len() - cursor.pos
            );
            return Err(SnapshotError::Malformed);
        }

        Ok(())
    }
}

struct Cursor<'a> {
    blob: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_u32(&mut self) -> Result<u32, SnapshotError> {
        if self.blob.len() - self.pos < 4 {
            error!("buffer underrun while unserializing state");
            return Err(SnapshotError::Malformed);
        }
        let v = u32::from_le_bytes([
            self.blob[self.pos],
            self.blob[self.pos + 1],
            self.blob[self.pos + 2],
            self.blob[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    fn read_data(&mut self) -> Result<&'a [u8], SnapshotError> {
        let len = self.read_u32()? as usize;
        if self.blob.len() - self.pos < len {
            error!("buffer underrun while unserializing state");
            return Err(SnapshotError::Malformed);
        }
        let data = &self.blob[self.pos..self.pos + len];
        self.pos += len;
        Ok(data)
    }
}
