//! Wire message model
//!
//! Every packet on the stream has a common framing: a fixed header carrying
//! the message type, the length of everything after the fixed header, and a
//! packet id, followed by a type-specific header and optional payload. This
//! framing is represented by [`Header`] plus [`TypeHeader`].
//!
//! The size of the fixed header (32 vs 64 bit ids) and of several type
//! specific headers depends on the negotiated capability set, so all parse
//! and write entry points take the relevant capability context.
//!
//! The [`parse`] submodule contains the functions turning raw bytes into
//! these structures; each header struct knows how to serialize itself back
//! via `write_to`.

use crate::caps::{Cap, Caps};
use crate::types::MAX_INTERFACES;
use alloc::vec::Vec;
use log::error;

/// Upper limit on bulk transfer payloads.
pub const MAX_BULK_TRANSFER_SIZE: u32 = 128 * 1024 * 1024;

/// Upper limit for accepted packet lengths including type headers; assumes
/// no type header is longer than 1kB.
pub const MAX_PACKET_SIZE: u32 = 1024 + MAX_BULK_TRANSFER_SIZE;

/// Size of the buffer a parser needs for the largest type-specific header
/// (the full `ep_info` layout).
pub const MAX_TYPE_HEADER_SIZE: usize = 288;

pub const MSG_HELLO: u32 = 0;
pub const MSG_DEVICE_CONNECT: u32 = 1;
pub const MSG_DEVICE_DISCONNECT: u32 = 2;
pub const MSG_RESET: u32 = 3;
pub const MSG_INTERFACE_INFO: u32 = 4;
pub const MSG_EP_INFO: u32 = 5;
pub const MSG_SET_CONFIGURATION: u32 = 6;
pub const MSG_GET_CONFIGURATION: u32 = 7;
pub const MSG_CONFIGURATION_STATUS: u32 = 8;
pub const MSG_SET_ALT_SETTING: u32 = 9;
pub const MSG_GET_ALT_SETTING: u32 = 10;
pub const MSG_ALT_SETTING_STATUS: u32 = 11;
pub const MSG_START_ISO_STREAM: u32 = 12;
pub const MSG_STOP_ISO_STREAM: u32 = 13;
pub const MSG_ISO_STREAM_STATUS: u32 = 14;
pub const MSG_START_INTERRUPT_RECEIVING: u32 = 15;
pub const MSG_STOP_INTERRUPT_RECEIVING: u32 = 16;
pub const MSG_INTERRUPT_RECEIVING_STATUS: u32 = 17;
pub const MSG_ALLOC_BULK_STREAMS: u32 = 18;
pub const MSG_FREE_BULK_STREAMS: u32 = 19;
pub const MSG_BULK_STREAMS_STATUS: u32 = 20;
pub const MSG_CANCEL_DATA_PACKET: u32 = 21;
pub const MSG_FILTER_REJECT: u32 = 22;
pub const MSG_FILTER_FILTER: u32 = 23;
pub const MSG_DEVICE_DISCONNECT_ACK: u32 = 24;
pub const MSG_START_BULK_RECEIVING: u32 = 25;
pub const MSG_STOP_BULK_RECEIVING: u32 = 26;
pub const MSG_BULK_RECEIVING_STATUS: u32 = 27;
pub const MSG_CONTROL_PACKET: u32 = 100;
pub const MSG_BULK_PACKET: u32 = 101;
pub const MSG_ISO_PACKET: u32 = 102;
pub const MSG_INTERRUPT_PACKET: u32 = 103;
pub const MSG_BUFFERED_BULK_PACKET: u32 = 104;

/// Which role a session plays on the wire.
///
/// Commands (set configuration, data submissions, ...) flow towards the
/// host; status replies and device events flow towards the guest. The role
/// decides which message types are legal in each direction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    /// This side owns the real device.
    Host,
    /// This side emits requests on behalf of a guest.
    Guest,
}

impl Role {
    /// Whether a message is a command-for-host from our perspective.
    ///
    /// Receiving as host means commands are addressed to us; sending
    /// inverts the direction.
    pub(crate) fn command_for_host(self, send: bool) -> bool {
        (self == Role::Host) != send
    }
}

/// Common packet header.
///
/// `length` counts the type-specific header plus payload, not the fixed
/// header itself. `id` is 32 or 64 bits on the wire depending on whether
/// both peers advertise [`Cap::Ids64Bits`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Header {
    pub msg_type: u32,
    pub length: u32,
    pub id: u64,
}

/// Fixed header length for the given id width.
pub fn header_len(wide_ids: bool) -> usize {
    if wide_ids {
        16
    } else {
        12
    }
}

impl Header {
    pub fn write_to(&self, out: &mut Vec<u8>, wide_ids: bool) {
        out.extend_from_slice(&self.msg_type.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        if wide_ids {
            out.extend_from_slice(&self.id.to_le_bytes());
        } else {
            out.extend_from_slice(&(self.id as u32).to_le_bytes());
        }
    }
}

/// `hello`: the first message either peer sends; carries a free-form
/// version string and, as payload, the sender's capability words.
#[derive(Clone, Copy)]
pub struct HelloHeader {
    pub version: [u8; 64],
}

impl HelloHeader {
    pub fn new(version: &str) -> Self {
        let mut bytes = [0; 64];
        // Leave at least one NUL so the peer can treat it as a C string
        let n = version.len().min(63);
        bytes[..n].copy_from_slice(&version.as_bytes()[..n]);
        HelloHeader { version: bytes }
    }

    /// The version string up to the first NUL, lossy on invalid UTF-8.
    pub fn version_str(&self) -> &str {
        let end = self.version.iter().position(|&b| b == 0).unwrap_or(64);
        core::str::from_utf8(&self.version[..end]).unwrap_or("<invalid>")
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version);
    }
}

impl core::fmt::Debug for HelloHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HelloHeader")
            .field("version", &self.version_str())
            .finish()
    }
}

/// `device_connect`: advertises the redirected device to the guest.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DeviceConnectHeader {
    pub speed: u8,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version_bcd: u16,
}

impl DeviceConnectHeader {
    pub fn write_to(&self, out: &mut Vec<u8>, with_version: bool) {
        out.push(self.speed);
        out.push(self.device_class);
        out.push(self.device_subclass);
        out.push(self.device_protocol);
        out.extend_from_slice(&self.vendor_id.to_le_bytes());
        out.extend_from_slice(&self.product_id.to_le_bytes());
        if with_version {
            out.extend_from_slice(&self.device_version_bcd.to_le_bytes());
        }
    }
}

/// `interface_info`: the interfaces of the active configuration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InterfaceInfoHeader {
    pub interface_count: u32,
    pub interface: [u8; MAX_INTERFACES],
    pub interface_class: [u8; MAX_INTERFACES],
    pub interface_subclass: [u8; MAX_INTERFACES],
    pub interface_protocol: [u8; MAX_INTERFACES],
}

impl Default for InterfaceInfoHeader {
    fn default() -> Self {
        InterfaceInfoHeader {
            interface_count: 0,
            interface: [0; MAX_INTERFACES],
            interface_class: [0; MAX_INTERFACES],
            interface_subclass: [0; MAX_INTERFACES],
            interface_protocol: [0; MAX_INTERFACES],
        }
    }
}

impl InterfaceInfoHeader {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.interface_count.to_le_bytes());
        out.extend_from_slice(&self.interface);
        out.extend_from_slice(&self.interface_class);
        out.extend_from_slice(&self.interface_subclass);
        out.extend_from_slice(&self.interface_protocol);
    }
}

/// Which of the three `ep_info` layouts is in effect.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EpInfoLayout {
    /// type / interval / interface only
    Base,
    /// adds per-endpoint max packet sizes
    MaxPacketSize,
    /// adds per-endpoint max stream counts on top
    MaxStreams,
}

impl EpInfoLayout {
    pub fn from_caps(active: &Caps) -> Self {
        if active.has(Cap::BulkStreams) {
            EpInfoLayout::MaxStreams
        } else if active.has(Cap::EpInfoMaxPacketSize) {
            EpInfoLayout::MaxPacketSize
        } else {
            EpInfoLayout::Base
        }
    }

    pub fn len(self) -> usize {
        match self {
            EpInfoLayout::Base => 96,
            EpInfoLayout::MaxPacketSize => 160,
            EpInfoLayout::MaxStreams => 288,
        }
    }
}

/// `ep_info`: per-endpoint-slot properties of the active configuration.
///
/// Indexed by the folded slot index (see
/// [`EndpointAddress::slot`](crate::types::EndpointAddress::slot)).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EpInfoHeader {
    pub kind: [u8; 32],
    pub interval: [u8; 32],
    pub interface: [u8; 32],
    pub max_packet_size: [u16; 32],
    pub max_streams: [u32; 32],
}

impl Default for EpInfoHeader {
    fn default() -> Self {
        EpInfoHeader {
            kind: [0; 32],
            interval: [0; 32],
            interface: [0; 32],
            max_packet_size: [0; 32],
            max_streams: [0; 32],
        }
    }
}

impl EpInfoHeader {
    pub fn write_to(&self, out: &mut Vec<u8>, layout: EpInfoLayout) {
        out.extend_from_slice(&self.kind);
        out.extend_from_slice(&self.interval);
        out.extend_from_slice(&self.interface);
        if layout == EpInfoLayout::Base {
            return;
        }
        for v in self.max_packet_size {
            out.extend_from_slice(&v.to_le_bytes());
        }
        if layout == EpInfoLayout::MaxStreams {
            for v in self.max_streams {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SetConfigurationHeader {
    pub configuration: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ConfigurationStatusHeader {
    pub status: u8,
    pub configuration: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SetAltSettingHeader {
    pub interface: u8,
    pub alt: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct GetAltSettingHeader {
    pub interface: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AltSettingStatusHeader {
    pub status: u8,
    pub interface: u8,
    pub alt: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StartIsoStreamHeader {
    pub endpoint: u8,
    pub pkts_per_transfer: u8,
    pub transfer_count: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StopIsoStreamHeader {
    pub endpoint: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct IsoStreamStatusHeader {
    pub status: u8,
    pub endpoint: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StartInterruptReceivingHeader {
    pub endpoint: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StopInterruptReceivingHeader {
    pub endpoint: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct InterruptReceivingStatusHeader {
    pub status: u8,
    pub endpoint: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AllocBulkStreamsHeader {
    /// Bit mask of endpoint slots to allocate streams on.
    pub endpoints: u32,
    pub no_streams: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct FreeBulkStreamsHeader {
    pub endpoints: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BulkStreamsStatusHeader {
    pub endpoints: u32,
    pub no_streams: u32,
    pub status: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StartBulkReceivingHeader {
    pub stream_id: u32,
    pub bytes_per_transfer: u32,
    pub endpoint: u8,
    pub no_transfers: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StopBulkReceivingHeader {
    pub stream_id: u32,
    pub endpoint: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BulkReceivingStatusHeader {
    pub stream_id: u32,
    pub endpoint: u8,
    pub status: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ControlPacketHeader {
    pub endpoint: u8,
    pub request: u8,
    pub requesttype: u8,
    pub status: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BulkPacketHeader {
    pub endpoint: u8,
    pub status: u8,
    pub length: u16,
    pub stream_id: u32,
    /// Upper 16 bits of the length; only on the wire when both peers
    /// advertise [`Cap::BulkLength32Bits`].
    pub length_high: u16,
}

impl BulkPacketHeader {
    pub fn total_length(&self) -> u32 {
        ((self.length_high as u32) << 16) | self.length as u32
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct IsoPacketHeader {
    pub endpoint: u8,
    pub status: u8,
    pub length: u16,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct InterruptPacketHeader {
    pub endpoint: u8,
    pub status: u8,
    pub length: u16,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BufferedBulkPacketHeader {
    pub stream_id: u32,
    pub length: u32,
    pub endpoint: u8,
    pub status: u8,
}

/// A parsed type-specific header of any message.
#[derive(Clone, Copy, Debug)]
pub enum TypeHeader {
    Hello(HelloHeader),
    DeviceConnect(DeviceConnectHeader),
    DeviceDisconnect,
    Reset,
    InterfaceInfo(InterfaceInfoHeader),
    EpInfo(EpInfoHeader),
    SetConfiguration(SetConfigurationHeader),
    GetConfiguration,
    ConfigurationStatus(ConfigurationStatusHeader),
    SetAltSetting(SetAltSettingHeader),
    GetAltSetting(GetAltSettingHeader),
    AltSettingStatus(AltSettingStatusHeader),
    StartIsoStream(StartIsoStreamHeader),
    StopIsoStream(StopIsoStreamHeader),
    IsoStreamStatus(IsoStreamStatusHeader),
    StartInterruptReceiving(StartInterruptReceivingHeader),
    StopInterruptReceiving(StopInterruptReceivingHeader),
    InterruptReceivingStatus(InterruptReceivingStatusHeader),
    AllocBulkStreams(AllocBulkStreamsHeader),
    FreeBulkStreams(FreeBulkStreamsHeader),
    BulkStreamsStatus(BulkStreamsStatusHeader),
    CancelDataPacket,
    FilterReject,
    FilterFilter,
    DeviceDisconnectAck,
    StartBulkReceiving(StartBulkReceivingHeader),
    StopBulkReceiving(StopBulkReceivingHeader),
    BulkReceivingStatus(BulkReceivingStatusHeader),
    ControlPacket(ControlPacketHeader),
    BulkPacket(BulkPacketHeader),
    IsoPacket(IsoPacketHeader),
    InterruptPacket(InterruptPacketHeader),
    BufferedBulkPacket(BufferedBulkPacketHeader),
}

impl TypeHeader {
    pub fn msg_type(&self) -> u32 {
        match self {
            TypeHeader::Hello(_) => MSG_HELLO,
            TypeHeader::DeviceConnect(_) => MSG_DEVICE_CONNECT,
            TypeHeader::DeviceDisconnect => MSG_DEVICE_DISCONNECT,
            TypeHeader::Reset => MSG_RESET,
            TypeHeader::InterfaceInfo(_) => MSG_INTERFACE_INFO,
            TypeHeader::EpInfo(_) => MSG_EP_INFO,
            TypeHeader::SetConfiguration(_) => MSG_SET_CONFIGURATION,
            TypeHeader::GetConfiguration => MSG_GET_CONFIGURATION,
            TypeHeader::ConfigurationStatus(_) => MSG_CONFIGURATION_STATUS,
            TypeHeader::SetAltSetting(_) => MSG_SET_ALT_SETTING,
            TypeHeader::GetAltSetting(_) => MSG_GET_ALT_SETTING,
            TypeHeader::AltSettingStatus(_) => MSG_ALT_SETTING_STATUS,
            TypeHeader::StartIsoStream(_) => MSG_START_ISO_STREAM,
            TypeHeader::StopIsoStream(_) => MSG_STOP_ISO_STREAM,
            TypeHeader::IsoStreamStatus(_) => MSG_ISO_STREAM_STATUS,
            TypeHeader::StartInterruptReceiving(_) => MSG_START_INTERRUPT_RECEIVING,
            TypeHeader::StopInterruptReceiving(_) => MSG_STOP_INTERRUPT_RECEIVING,
            TypeHeader::InterruptReceivingStatus(_) => MSG_INTERRUPT_RECEIVING_STATUS,
            TypeHeader::AllocBulkStreams(_) => MSG_ALLOC_BULK_STREAMS,
            TypeHeader::FreeBulkStreams(_) => MSG_FREE_BULK_STREAMS,
            TypeHeader::BulkStreamsStatus(_) => MSG_BULK_STREAMS_STATUS,
            TypeHeader::CancelDataPacket => MSG_CANCEL_DATA_PACKET,
            TypeHeader::FilterReject => MSG_FILTER_REJECT,
            TypeHeader::FilterFilter => MSG_FILTER_FILTER,
            TypeHeader::DeviceDisconnectAck => MSG_DEVICE_DISCONNECT_ACK,
            TypeHeader::StartBulkReceiving(_) => MSG_START_BULK_RECEIVING,
            TypeHeader::StopBulkReceiving(_) => MSG_STOP_BULK_RECEIVING,
            TypeHeader::BulkReceivingStatus(_) => MSG_BULK_RECEIVING_STATUS,
            TypeHeader::ControlPacket(_) => MSG_CONTROL_PACKET,
            TypeHeader::BulkPacket(_) => MSG_BULK_PACKET,
            TypeHeader::IsoPacket(_) => MSG_ISO_PACKET,
            TypeHeader::InterruptPacket(_) => MSG_INTERRUPT_PACKET,
            TypeHeader::BufferedBulkPacket(_) => MSG_BUFFERED_BULK_PACKET,
        }
    }

    /// Serializes this header with the layout the capability context calls
    /// for.
    pub fn write_to(&self, out: &mut Vec<u8>, active: &Caps) {
        match self {
            TypeHeader::Hello(h) => h.write_to(out),
            TypeHeader::DeviceConnect(h) => {
                h.write_to(out, active.has(Cap::ConnectDeviceVersion))
            }
            TypeHeader::InterfaceInfo(h) => h.write_to(out),
            TypeHeader::EpInfo(h) => h.write_to(out, EpInfoLayout::from_caps(active)),
            TypeHeader::SetConfiguration(h) => out.push(h.configuration),
            TypeHeader::ConfigurationStatus(h) => {
                out.push(h.status);
                out.push(h.configuration);
            }
            TypeHeader::SetAltSetting(h) => {
                out.push(h.interface);
                out.push(h.alt);
            }
            TypeHeader::GetAltSetting(h) => out.push(h.interface),
            TypeHeader::AltSettingStatus(h) => {
                out.push(h.status);
                out.push(h.interface);
                out.push(h.alt);
            }
            TypeHeader::StartIsoStream(h) => {
                out.push(h.endpoint);
                out.push(h.pkts_per_transfer);
                out.push(h.transfer_count);
            }
            TypeHeader::StopIsoStream(h) => out.push(h.endpoint),
            TypeHeader::IsoStreamStatus(h) => {
                out.push(h.status);
                out.push(h.endpoint);
            }
            TypeHeader::StartInterruptReceiving(h) => out.push(h.endpoint),
            TypeHeader::StopInterruptReceiving(h) => out.push(h.endpoint),
            TypeHeader::InterruptReceivingStatus(h) => {
                out.push(h.status);
                out.push(h.endpoint);
            }
            TypeHeader::AllocBulkStreams(h) => {
                out.extend_from_slice(&h.endpoints.to_le_bytes());
                out.extend_from_slice(&h.no_streams.to_le_bytes());
            }
            TypeHeader::FreeBulkStreams(h) => {
                out.extend_from_slice(&h.endpoints.to_le_bytes());
            }
            TypeHeader::BulkStreamsStatus(h) => {
                out.extend_from_slice(&h.endpoints.to_le_bytes());
                out.extend_from_slice(&h.no_streams.to_le_bytes());
                out.push(h.status);
            }
            TypeHeader::StartBulkReceiving(h) => {
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                out.extend_from_slice(&h.bytes_per_transfer.to_le_bytes());
                out.push(h.endpoint);
                out.push(h.no_transfers);
            }
            TypeHeader::StopBulkReceiving(h) => {
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                out.push(h.endpoint);
            }
            TypeHeader::BulkReceivingStatus(h) => {
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                out.push(h.endpoint);
                out.push(h.status);
            }
            TypeHeader::ControlPacket(h) => {
                out.push(h.endpoint);
                out.push(h.request);
                out.push(h.requesttype);
                out.push(h.status);
                out.extend_from_slice(&h.value.to_le_bytes());
                out.extend_from_slice(&h.index.to_le_bytes());
                out.extend_from_slice(&h.length.to_le_bytes());
            }
            TypeHeader::BulkPacket(h) => {
                out.push(h.endpoint);
                out.push(h.status);
                out.extend_from_slice(&h.length.to_le_bytes());
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                if active.has(Cap::BulkLength32Bits) {
                    out.extend_from_slice(&h.length_high.to_le_bytes());
                }
            }
            TypeHeader::IsoPacket(h) => {
                out.push(h.endpoint);
                out.push(h.status);
                out.extend_from_slice(&h.length.to_le_bytes());
            }
            TypeHeader::InterruptPacket(h) => {
                out.push(h.endpoint);
                out.push(h.status);
                out.extend_from_slice(&h.length.to_le_bytes());
            }
            // No type-specific header at all
            TypeHeader::DeviceDisconnect
            | TypeHeader::Reset
            | TypeHeader::GetConfiguration
            | TypeHeader::CancelDataPacket
            | TypeHeader::FilterReject
            | TypeHeader::FilterFilter
            | TypeHeader::DeviceDisconnectAck => {}
            TypeHeader::BufferedBulkPacket(h) => {
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                out.extend_from_slice(&h.length.to_le_bytes());
                out.push(h.endpoint);
                out.push(h.status);
            }
        }
    }
}

/// Expected type-header length for a message, or `None` when the message
/// type is unknown or illegal in this direction.
pub fn type_header_len(msg_type: u32, role: Role, send: bool, active: &Caps) -> Option<usize> {
    let command_for_host = role.command_for_host(send);

    match msg_type {
        MSG_HELLO => Some(64),
        MSG_DEVICE_CONNECT => {
            if command_for_host {
                return None;
            }
            if active.has(Cap::ConnectDeviceVersion) {
                Some(10)
            } else {
                Some(8)
            }
        }
        MSG_DEVICE_DISCONNECT => (!command_for_host).then_some(0),
        MSG_RESET => command_for_host.then_some(0),
        MSG_INTERFACE_INFO => (!command_for_host).then_some(132),
        MSG_EP_INFO => (!command_for_host).then_some(EpInfoLayout::from_caps(active).len()),
        MSG_SET_CONFIGURATION => command_for_host.then_some(1),
        MSG_GET_CONFIGURATION => command_for_host.then_some(0),
        MSG_CONFIGURATION_STATUS => (!command_for_host).then_some(2),
        MSG_SET_ALT_SETTING => command_for_host.then_some(2),
        MSG_GET_ALT_SETTING => command_for_host.then_some(1),
        MSG_ALT_SETTING_STATUS => (!command_for_host).then_some(3),
        MSG_START_ISO_STREAM => command_for_host.then_some(3),
        MSG_STOP_ISO_STREAM => command_for_host.then_some(1),
        MSG_ISO_STREAM_STATUS => (!command_for_host).then_some(2),
        MSG_START_INTERRUPT_RECEIVING => command_for_host.then_some(1),
        MSG_STOP_INTERRUPT_RECEIVING => command_for_host.then_some(1),
        MSG_INTERRUPT_RECEIVING_STATUS => (!command_for_host).then_some(2),
        MSG_ALLOC_BULK_STREAMS => command_for_host.then_some(8),
        MSG_FREE_BULK_STREAMS => command_for_host.then_some(4),
        MSG_BULK_STREAMS_STATUS => (!command_for_host).then_some(9),
        MSG_CANCEL_DATA_PACKET => command_for_host.then_some(0),
        MSG_FILTER_REJECT => command_for_host.then_some(0),
        MSG_FILTER_FILTER => Some(0),
        MSG_DEVICE_DISCONNECT_ACK => command_for_host.then_some(0),
        MSG_START_BULK_RECEIVING => command_for_host.then_some(10),
        MSG_STOP_BULK_RECEIVING => command_for_host.then_some(5),
        MSG_BULK_RECEIVING_STATUS => (!command_for_host).then_some(6),
        MSG_CONTROL_PACKET => Some(10),
        MSG_BULK_PACKET => {
            if active.has(Cap::BulkLength32Bits) {
                Some(10)
            } else {
                Some(8)
            }
        }
        MSG_ISO_PACKET => Some(4),
        MSG_INTERRUPT_PACKET => Some(4),
        MSG_BUFFERED_BULK_PACKET => (!command_for_host).then_some(10),
        _ => None,
    }
}

/// Whether a message type may carry payload beyond its type header at all.
///
/// This only gates the framing; whether payload is actually allowed for a
/// particular packet additionally depends on its endpoint direction, which
/// [`verify_type_header`] checks.
pub fn expect_extra_data(msg_type: u32) -> bool {
    matches!(
        msg_type,
        MSG_HELLO // for the variable length capabilities array
            | MSG_FILTER_FILTER
            | MSG_CONTROL_PACKET
            | MSG_BULK_PACKET
            | MSG_ISO_PACKET
            | MSG_INTERRUPT_PACKET
            | MSG_BUFFERED_BULK_PACKET
    )
}

fn verify_bulk_recv_cap(send: bool, ours: &Caps, peer: &Caps) -> bool {
    let ok = if send {
        peer.has(Cap::BulkReceiving)
    } else {
        ours.has(Cap::BulkReceiving)
    };
    if !ok {
        error!("bulk_receiving message without cap_bulk_receiving");
    }
    ok
}

/// Validates a type header against direction, payload presence and
/// capability preconditions. Mirrors the inbound checks for outbound
/// packets with the direction inverted.
pub fn verify_type_header(
    header: &TypeHeader,
    data: &[u8],
    role: Role,
    send: bool,
    ours: &Caps,
    peer: &Caps,
) -> bool {
    let command_for_host = role.command_for_host(send);

    // (endpoint, payload length claimed by the header) for data packets
    let mut ep_and_len: Option<(u8, u32)> = None;

    match header {
        TypeHeader::InterfaceInfo(h) => {
            if h.interface_count > MAX_INTERFACES as u32 {
                error!("interface_count > {}", MAX_INTERFACES);
                return false;
            }
        }
        TypeHeader::StartInterruptReceiving(h) => {
            if h.endpoint & 0x80 == 0 {
                error!("start interrupt receiving on non input ep {:02x}", h.endpoint);
                return false;
            }
        }
        TypeHeader::StopInterruptReceiving(h) => {
            if h.endpoint & 0x80 == 0 {
                error!("stop interrupt receiving on non input ep {:02x}", h.endpoint);
                return false;
            }
        }
        TypeHeader::InterruptReceivingStatus(h) => {
            if h.endpoint & 0x80 == 0 {
                error!("interrupt receiving status for non input ep {:02x}", h.endpoint);
                return false;
            }
        }
        TypeHeader::FilterReject => {
            let ok = if send { peer.has(Cap::Filter) } else { ours.has(Cap::Filter) };
            if !ok {
                error!("filter_reject without cap_filter");
                return false;
            }
        }
        TypeHeader::FilterFilter => {
            let ok = if send { peer.has(Cap::Filter) } else { ours.has(Cap::Filter) };
            if !ok {
                error!("filter_filter without cap_filter");
                return false;
            }
            if data.is_empty() {
                error!("filter_filter without data");
                return false;
            }
            if data[data.len() - 1] != 0 {
                error!("non NUL terminated filter_filter data");
                return false;
            }
        }
        TypeHeader::DeviceDisconnectAck => {
            let ok = if send {
                peer.has(Cap::DeviceDisconnectAck)
            } else {
                ours.has(Cap::DeviceDisconnectAck)
            };
            if !ok {
                error!("device_disconnect_ack without cap_device_disconnect_ack");
                return false;
            }
        }
        TypeHeader::StartBulkReceiving(h) => {
            if !verify_bulk_recv_cap(send, ours, peer) {
                return false;
            }
            if h.bytes_per_transfer > MAX_BULK_TRANSFER_SIZE {
                error!(
                    "start bulk receiving length exceeds limits {} > {}",
                    h.bytes_per_transfer, MAX_BULK_TRANSFER_SIZE
                );
                return false;
            }
            if h.endpoint & 0x80 == 0 {
                error!("start bulk receiving on non input ep {:02x}", h.endpoint);
                return false;
            }
        }
        TypeHeader::StopBulkReceiving(h) => {
            if !verify_bulk_recv_cap(send, ours, peer) {
                return false;
            }
            if h.endpoint & 0x80 == 0 {
                error!("stop bulk receiving on non input ep {:02x}", h.endpoint);
                return false;
            }
        }
        TypeHeader::BulkReceivingStatus(h) => {
            if !verify_bulk_recv_cap(send, ours, peer) {
                return false;
            }
            if h.endpoint & 0x80 == 0 {
                error!("bulk receiving status for non input ep {:02x}", h.endpoint);
                return false;
            }
        }
        TypeHeader::ControlPacket(h) => {
            ep_and_len = Some((h.endpoint, h.length as u32));
        }
        TypeHeader::BulkPacket(h) => {
            let length = if ours.intersect(peer).has(Cap::BulkLength32Bits) {
                h.total_length()
            } else {
                h.length as u32
            };
            if length > MAX_BULK_TRANSFER_SIZE {
                error!(
                    "bulk transfer length exceeds limits {} > {}",
                    length, MAX_BULK_TRANSFER_SIZE
                );
                return false;
            }
            ep_and_len = Some((h.endpoint, length));
        }
        TypeHeader::IsoPacket(h) => {
            ep_and_len = Some((h.endpoint, h.length as u32));
        }
        TypeHeader::InterruptPacket(h) => {
            ep_and_len = Some((h.endpoint, h.length as u32));
        }
        TypeHeader::BufferedBulkPacket(h) => {
            if !verify_bulk_recv_cap(send, ours, peer) {
                return false;
            }
            if h.length > MAX_BULK_TRANSFER_SIZE {
                error!(
                    "buffered bulk transfer length exceeds limits {} > {}",
                    h.length, MAX_BULK_TRANSFER_SIZE
                );
                return false;
            }
            ep_and_len = Some((h.endpoint, h.length));
        }
        _ => {}
    }

    if let Some((ep, length)) = ep_and_len {
        // Payload travels with the packet only when it flows in the
        // direction of the endpoint: OUT data towards the host, IN data
        // towards the guest.
        let ep_in = ep & 0x80 != 0;
        let carries_data = ep_in != command_for_host;
        if carries_data {
            if data.len() as u32 != length {
                error!(
                    "data len {} != header len {} ep {:02X}",
                    data.len(),
                    length,
                    ep
                );
                return false;
            }
        } else {
            if !data.is_empty() {
                error!("unexpected extra data ep {:02X}", ep);
                return false;
            }
            match header {
                TypeHeader::IsoPacket(_) => {
                    error!("iso packet sent in wrong direction");
                    return false;
                }
                TypeHeader::InterruptPacket(_) if command_for_host => {
                    error!("interrupt packet sent in wrong direction");
                    return false;
                }
                TypeHeader::BufferedBulkPacket(_) => {
                    error!("buffered bulk packet sent in wrong direction");
                    return false;
                }
                _ => {}
            }
        }
    }

    true
}

pub mod parse {
    //! nom parsers for the fixed header and every type-specific header.

    use nom::bytes::complete::take;
    use nom::combinator::map;
    use nom::number::complete::{le_u16, le_u32, le_u64, u8};
    use nom::sequence::tuple;
    use nom::IResult;

    use super::*;

    /// Parse the fixed packet header with the negotiated id width.
    pub fn header(input: &[u8], wide_ids: bool) -> IResult<&[u8], Header> {
        let (input, (msg_type, length)) = tuple((le_u32, le_u32))(input)?;
        let (input, id) = if wide_ids {
            le_u64(input)?
        } else {
            map(le_u32, u64::from)(input)?
        };
        Ok((input, Header { msg_type, length, id }))
    }

    fn u8_array<const N: usize>(input: &[u8]) -> IResult<&[u8], [u8; N]> {
        let (input, bytes) = take(N)(input)?;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        Ok((input, out))
    }

    fn le_u16_array<const N: usize>(input: &[u8]) -> IResult<&[u8], [u16; N]> {
        let (input, bytes) = take(N * 2)(input)?;
        let mut out = [0; N];
        for (i, v) in out.iter_mut().enumerate() {
            *v = u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
        }
        Ok((input, out))
    }

    fn le_u32_array<const N: usize>(input: &[u8]) -> IResult<&[u8], [u32; N]> {
        let (input, bytes) = take(N * 4)(input)?;
        let mut out = [0; N];
        for (i, v) in out.iter_mut().enumerate() {
            *v = u32::from_le_bytes([
                bytes[i * 4],
                bytes[i * 4 + 1],
                bytes[i * 4 + 2],
                bytes[i * 4 + 3],
            ]);
        }
        Ok((input, out))
    }

    pub fn hello(input: &[u8]) -> IResult<&[u8], HelloHeader> {
        map(u8_array::<64>, |version| HelloHeader { version })(input)
    }

    pub fn device_connect(input: &[u8], with_version: bool) -> IResult<&[u8], DeviceConnectHeader> {
        let (input, (speed, device_class, device_subclass, device_protocol)) =
            tuple((u8, u8, u8, u8))(input)?;
        let (input, (vendor_id, product_id)) = tuple((le_u16, le_u16))(input)?;
        let (input, device_version_bcd) = if with_version {
            le_u16(input)?
        } else {
            (input, 0)
        };
        Ok((
            input,
            DeviceConnectHeader {
                speed,
                device_class,
                device_subclass,
                device_protocol,
                vendor_id,
                product_id,
                device_version_bcd,
            },
        ))
    }

    pub fn interface_info(input: &[u8]) -> IResult<&[u8], InterfaceInfoHeader> {
        map(
            tuple((
                le_u32,
                u8_array::<MAX_INTERFACES>,
                u8_array::<MAX_INTERFACES>,
                u8_array::<MAX_INTERFACES>,
                u8_array::<MAX_INTERFACES>,
            )),
            |(interface_count, interface, interface_class, interface_subclass, interface_protocol)| {
                InterfaceInfoHeader {
                    interface_count,
                    interface,
                    interface_class,
                    interface_subclass,
                    interface_protocol,
                }
            },
        )(input)
    }

    pub fn ep_info(input: &[u8], layout: EpInfoLayout) -> IResult<&[u8], EpInfoHeader> {
        let (input, (kind, interval, interface)) =
            tuple((u8_array::<32>, u8_array::<32>, u8_array::<32>))(input)?;
        let mut header = EpInfoHeader {
            kind,
            interval,
            interface,
            ..EpInfoHeader::default()
        };
        let input = match layout {
            EpInfoLayout::Base => input,
            EpInfoLayout::MaxPacketSize => {
                let (input, max_packet_size) = le_u16_array::<32>(input)?;
                header.max_packet_size = max_packet_size;
                input
            }
            EpInfoLayout::MaxStreams => {
                let (input, max_packet_size) = le_u16_array::<32>(input)?;
                let (input, max_streams) = le_u32_array::<32>(input)?;
                header.max_packet_size = max_packet_size;
                header.max_streams = max_streams;
                input
            }
        };
        Ok((input, header))
    }

    pub fn control_packet(input: &[u8]) -> IResult<&[u8], ControlPacketHeader> {
        map(
            tuple((u8, u8, u8, u8, le_u16, le_u16, le_u16)),
            |(endpoint, request, requesttype, status, value, index, length)| ControlPacketHeader {
                endpoint,
                request,
                requesttype,
                status,
                value,
                index,
                length,
            },
        )(input)
    }

    pub fn bulk_packet(input: &[u8], wide_length: bool) -> IResult<&[u8], BulkPacketHeader> {
        let (input, (endpoint, status, length, stream_id)) =
            tuple((u8, u8, le_u16, le_u32))(input)?;
        let (input, length_high) = if wide_length { le_u16(input)? } else { (input, 0) };
        Ok((
            input,
            BulkPacketHeader {
                endpoint,
                status,
                length,
                stream_id,
                length_high,
            },
        ))
    }

    pub fn iso_packet(input: &[u8]) -> IResult<&[u8], IsoPacketHeader> {
        map(tuple((u8, u8, le_u16)), |(endpoint, status, length)| IsoPacketHeader {
            endpoint,
            status,
            length,
        })(input)
    }

    pub fn interrupt_packet(input: &[u8]) -> IResult<&[u8], InterruptPacketHeader> {
        map(tuple((u8, u8, le_u16)), |(endpoint, status, length)| InterruptPacketHeader {
            endpoint,
            status,
            length,
        })(input)
    }

    pub fn buffered_bulk_packet(input: &[u8]) -> IResult<&[u8], BufferedBulkPacketHeader> {
        map(
            tuple((le_u32, le_u32, u8, u8)),
            |(stream_id, length, endpoint, status)| BufferedBulkPacketHeader {
                stream_id,
                length,
                endpoint,
                status,
            },
        )(input)
    }

    /// Parse the type-specific header of `msg_type` under the given
    /// capability context.
    ///
    /// Fails for unknown message types or short input; direction legality
    /// is established by [`type_header_len`] before the bytes are read.
    pub fn type_header(input: &[u8], msg_type: u32, active: &Caps) -> Option<TypeHeader> {
        let parsed = match msg_type {
            MSG_HELLO => hello(input).map(|(_, h)| TypeHeader::Hello(h)),
            MSG_DEVICE_CONNECT => device_connect(input, active.has(Cap::ConnectDeviceVersion))
                .map(|(_, h)| TypeHeader::DeviceConnect(h)),
            MSG_DEVICE_DISCONNECT => return Some(TypeHeader::DeviceDisconnect),
            MSG_RESET => return Some(TypeHeader::Reset),
            MSG_INTERFACE_INFO => interface_info(input).map(|(_, h)| TypeHeader::InterfaceInfo(h)),
            MSG_EP_INFO => ep_info(input, EpInfoLayout::from_caps(active))
                .map(|(_, h)| TypeHeader::EpInfo(h)),
            MSG_SET_CONFIGURATION => map(u8, |configuration| {
                TypeHeader::SetConfiguration(SetConfigurationHeader { configuration })
            })(input)
            .map(|(_, h)| h),
            MSG_GET_CONFIGURATION => return Some(TypeHeader::GetConfiguration),
            MSG_CONFIGURATION_STATUS => map(tuple((u8, u8)), |(status, configuration)| {
                TypeHeader::ConfigurationStatus(ConfigurationStatusHeader { status, configuration })
            })(input)
            .map(|(_, h)| h),
            MSG_SET_ALT_SETTING => map(tuple((u8, u8)), |(interface, alt)| {
                TypeHeader::SetAltSetting(SetAltSettingHeader { interface, alt })
            })(input)
            .map(|(_, h)| h),
            MSG_GET_ALT_SETTING => map(u8, |interface| {
                TypeHeader::GetAltSetting(GetAltSettingHeader { interface })
            })(input)
            .map(|(_, h)| h),
            MSG_ALT_SETTING_STATUS => map(tuple((u8, u8, u8)), |(status, interface, alt)| {
                TypeHeader::AltSettingStatus(AltSettingStatusHeader { status, interface, alt })
            })(input)
            .map(|(_, h)| h),
            MSG_START_ISO_STREAM => {
                map(tuple((u8, u8, u8)), |(endpoint, pkts_per_transfer, transfer_count)| {
                    TypeHeader::StartIsoStream(StartIsoStreamHeader {
                        endpoint,
                        pkts_per_transfer,
                        transfer_count,
                    })
                })(input)
                .map(|(_, h)| h)
            }
            MSG_STOP_ISO_STREAM => map(u8, |endpoint| {
                TypeHeader::StopIsoStream(StopIsoStreamHeader { endpoint })
            })(input)
            .map(|(_, h)| h),
            MSG_ISO_STREAM_STATUS => map(tuple((u8, u8)), |(status, endpoint)| {
                TypeHeader::IsoStreamStatus(IsoStreamStatusHeader { status, endpoint })
            })(input)
            .map(|(_, h)| h),
            MSG_START_INTERRUPT_RECEIVING => map(u8, |endpoint| {
                TypeHeader::StartInterruptReceiving(StartInterruptReceivingHeader { endpoint })
            })(input)
            .map(|(_, h)| h),
            MSG_STOP_INTERRUPT_RECEIVING => map(u8, |endpoint| {
                TypeHeader::StopInterruptReceiving(StopInterruptReceivingHeader { endpoint })
            })(input)
            .map(|(_, h)| h),
            MSG_INTERRUPT_RECEIVING_STATUS => map(tuple((u8, u8)), |(status, endpoint)| {
                TypeHeader::InterruptReceivingStatus(InterruptReceivingStatusHeader {
                    status,
                    endpoint,
                })
            })(input)
            .map(|(_, h)| h),
            MSG_ALLOC_BULK_STREAMS => map(tuple((le_u32, le_u32)), |(endpoints, no_streams)| {
                TypeHeader::AllocBulkStreams(AllocBulkStreamsHeader { endpoints, no_streams })
            })(input)
            .map(|(_, h)| h),
            MSG_FREE_BULK_STREAMS => map(le_u32, |endpoints| {
                TypeHeader::FreeBulkStreams(FreeBulkStreamsHeader { endpoints })
            })(input)
            .map(|(_, h)| h),
            MSG_BULK_STREAMS_STATUS => {
                map(tuple((le_u32, le_u32, u8)), |(endpoints, no_streams, status)| {
                    TypeHeader::BulkStreamsStatus(BulkStreamsStatusHeader {
                        endpoints,
                        no_streams,
                        status,
                    })
                })(input)
                .map(|(_, h)| h)
            }
            MSG_CANCEL_DATA_PACKET => return Some(TypeHeader::CancelDataPacket),
            MSG_FILTER_REJECT => return Some(TypeHeader::FilterReject),
            MSG_FILTER_FILTER => return Some(TypeHeader::FilterFilter),
            MSG_DEVICE_DISCONNECT_ACK => return Some(TypeHeader::DeviceDisconnectAck),
            MSG_START_BULK_RECEIVING => map(
                tuple((le_u32, le_u32, u8, u8)),
                |(stream_id, bytes_per_transfer, endpoint, no_transfers)| {
                    TypeHeader::StartBulkReceiving(StartBulkReceivingHeader {
                        stream_id,
                        bytes_per_transfer,
                        endpoint,
                        no_transfers,
                    })
                },
            )(input)
            .map(|(_, h)| h),
            MSG_STOP_BULK_RECEIVING => map(tuple((le_u32, u8)), |(stream_id, endpoint)| {
                TypeHeader::StopBulkReceiving(StopBulkReceivingHeader { stream_id, endpoint })
            })(input)
            .map(|(_, h)| h),
            MSG_BULK_RECEIVING_STATUS => {
                map(tuple((le_u32, u8, u8)), |(stream_id, endpoint, status)| {
                    TypeHeader::BulkReceivingStatus(BulkReceivingStatusHeader {
                        stream_id,
                        endpoint,
                        status,
                    })
                })(input)
                .map(|(_, h)| h)
            }
            MSG_CONTROL_PACKET => control_packet(input).map(|(_, h)| TypeHeader::ControlPacket(h)),
            MSG_BULK_PACKET => bulk_packet(input, active.has(Cap::BulkLength32Bits))
                .map(|(_, h)| TypeHeader::BulkPacket(h)),
            MSG_ISO_PACKET => iso_packet(input).map(|(_, h)| TypeHeader::IsoPacket(h)),
            MSG_INTERRUPT_PACKET => {
                interrupt_packet(input).map(|(_, h)| TypeHeader::InterruptPacket(h))
            }
            MSG_BUFFERED_BULK_PACKET => {
                buffered_bulk_packet(input).map(|(_, h)| TypeHeader::BufferedBulkPacket(h))
            }
            _ => return None,
        };
        parsed.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn caps_with(bits: &[Cap]) -> Caps {
        let mut caps = Caps::none();
        for &bit in bits {
            caps.set(bit);
        }
        caps
    }

    #[test]
    fn test_header_round_trip() {
        let header = Header { msg_type: MSG_BULK_PACKET, length: 72, id: 0x1122334455667788 };

        let mut wide = Vec::new();
        header.write_to(&mut wide, true);
        assert_eq!(wide.len(), header_len(true));
        let (_, parsed) = parse::header(&wide, true).unwrap();
        assert_eq!(parsed, header);

        let mut narrow = Vec::new();
        header.write_to(&mut narrow, false);
        assert_eq!(narrow.len(), header_len(false));
        let (_, parsed) = parse::header(&narrow, false).unwrap();
        // Only the low 32 id bits survive the narrow header
        assert_eq!(parsed.id, 0x55667788);
    }

    #[test]
    fn test_hello_version_string() {
        let hello = HelloHeader::new("usbwire 0.1");
        assert_eq!(hello.version_str(), "usbwire 0.1");
        let mut out = Vec::new();
        hello.write_to(&mut out);
        assert_eq!(out.len(), 64);
        let (_, parsed) = parse::hello(&out).unwrap();
        assert_eq!(parsed.version_str(), "usbwire 0.1");
    }

    #[test]
    fn test_device_connect_layouts() {
        let header = DeviceConnectHeader {
            speed: 2,
            device_class: 3,
            device_subclass: 1,
            device_protocol: 2,
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_version_bcd: 0x0100,
        };

        let mut with_version = Vec::new();
        header.write_to(&mut with_version, true);
        assert_eq!(with_version.len(), 10);
        let (_, parsed) = parse::device_connect(&with_version, true).unwrap();
        assert_eq!(parsed, header);

        let mut without = Vec::new();
        header.write_to(&mut without, false);
        assert_eq!(without.len(), 8);
        let (_, parsed) = parse::device_connect(&without, false).unwrap();
        assert_eq!(parsed.device_version_bcd, 0);
    }

    #[test]
    fn test_ep_info_layout_lengths() {
        assert_eq!(EpInfoLayout::Base.len(), 96);
        assert_eq!(EpInfoLayout::MaxPacketSize.len(), 160);
        assert_eq!(EpInfoLayout::MaxStreams.len(), 288);

        let active = caps_with(&[Cap::EpInfoMaxPacketSize]);
        assert_eq!(EpInfoLayout::from_caps(&active), EpInfoLayout::MaxPacketSize);
        let active = caps_with(&[Cap::EpInfoMaxPacketSize, Cap::BulkStreams]);
        assert_eq!(EpInfoLayout::from_caps(&active), EpInfoLayout::MaxStreams);

        let mut header = EpInfoHeader::default();
        header.kind[1] = 3;
        header.max_packet_size[1] = 8;
        let mut out = Vec::new();
        header.write_to(&mut out, EpInfoLayout::MaxPacketSize);
        assert_eq!(out.len(), 160);
        let (_, parsed) = parse::ep_info(&out, EpInfoLayout::MaxPacketSize).unwrap();
        assert_eq!(parsed.kind[1], 3);
        assert_eq!(parsed.max_packet_size[1], 8);
    }

    #[test]
    fn test_bulk_packet_length_modes() {
        let header = BulkPacketHeader {
            endpoint: 0x81,
            status: 0,
            length: 0x2000,
            stream_id: 0,
            length_high: 0x0003,
        };
        assert_eq!(header.total_length(), 0x32000);

        let mut wide = Vec::new();
        TypeHeader::BulkPacket(header).write_to(&mut wide, &caps_with(&[Cap::BulkLength32Bits]));
        assert_eq!(wide.len(), 10);
        let (_, parsed) = parse::bulk_packet(&wide, true).unwrap();
        assert_eq!(parsed, header);

        let mut narrow = Vec::new();
        TypeHeader::BulkPacket(header).write_to(&mut narrow, &Caps::none());
        assert_eq!(narrow.len(), 8);
        let (_, parsed) = parse::bulk_packet(&narrow, false).unwrap();
        assert_eq!(parsed.length_high, 0);
    }

    #[test]
    fn test_type_header_len_directionality() {
        let active = Caps::none();
        // A host receives commands, not status replies
        assert_eq!(type_header_len(MSG_SET_CONFIGURATION, Role::Host, false, &active), Some(1));
        assert_eq!(type_header_len(MSG_CONFIGURATION_STATUS, Role::Host, false, &active), None);
        // ... but sends them
        assert_eq!(type_header_len(MSG_CONFIGURATION_STATUS, Role::Host, true, &active), Some(2));
        assert_eq!(type_header_len(MSG_DEVICE_CONNECT, Role::Host, true, &active), Some(8));
        assert_eq!(type_header_len(MSG_DEVICE_CONNECT, Role::Guest, false, &active), Some(8));
        assert_eq!(type_header_len(MSG_DEVICE_CONNECT, Role::Guest, true, &active), None);
        assert_eq!(type_header_len(9999, Role::Host, false, &active), None);
    }

    #[test]
    fn test_verify_direction_and_payload() {
        let ours = caps_with(&[Cap::Filter]);
        let peer = caps_with(&[Cap::Filter]);

        // Control OUT to the host carries its payload
        let out_packet = TypeHeader::ControlPacket(ControlPacketHeader {
            endpoint: 0x01,
            length: 4,
            ..ControlPacketHeader::default()
        });
        assert!(verify_type_header(&out_packet, &[1, 2, 3, 4], Role::Host, false, &ours, &peer));
        assert!(!verify_type_header(&out_packet, &[1, 2], Role::Host, false, &ours, &peer));

        // Control IN request to the host must not carry data
        let in_packet = TypeHeader::ControlPacket(ControlPacketHeader {
            endpoint: 0x81,
            length: 8,
            ..ControlPacketHeader::default()
        });
        assert!(verify_type_header(&in_packet, &[], Role::Host, false, &ours, &peer));
        assert!(!verify_type_header(&in_packet, &[0xff], Role::Host, false, &ours, &peer));

        // Iso data only ever flows with the endpoint direction: an input
        // endpoint's packets cannot be addressed to the host
        let iso = TypeHeader::IsoPacket(IsoPacketHeader { endpoint: 0x81, status: 0, length: 0 });
        assert!(!verify_type_header(&iso, &[], Role::Host, false, &ours, &peer));
        // ... but the host does send them (length 0 marks an error packet)
        assert!(verify_type_header(&iso, &[], Role::Guest, false, &ours, &peer));

        // filter_filter needs the cap and a NUL terminated payload
        assert!(verify_type_header(&TypeHeader::FilterFilter, b"0x03,-1,-1,-1,0\0", Role::Host, false, &ours, &peer));
        assert!(!verify_type_header(&TypeHeader::FilterFilter, b"0x03,-1,-1,-1,0", Role::Host, false, &ours, &peer));
        assert!(!verify_type_header(&TypeHeader::FilterFilter, b"x\0", Role::Host, false, &Caps::none(), &peer));
    }

    #[test]
    fn test_interface_info_limit() {
        let mut header = InterfaceInfoHeader::default();
        header.interface_count = 33;
        assert!(!verify_type_header(
            &TypeHeader::InterfaceInfo(header),
            &[],
            Role::Guest,
            false,
            &Caps::none(),
            &Caps::none()
        ));
    }

    #[test]
    fn test_receiving_family_requires_input_ep() {
        let ours = caps_with(&[Cap::BulkReceiving]);
        let h = TypeHeader::StartInterruptReceiving(StartInterruptReceivingHeader { endpoint: 0x01 });
        assert!(!verify_type_header(&h, &[], Role::Host, false, &ours, &ours));
        let h = TypeHeader::StartBulkReceiving(StartBulkReceivingHeader {
            endpoint: 0x82,
            bytes_per_transfer: 512,
            no_transfers: 2,
            stream_id: 0,
        });
        assert!(verify_type_header(&h, &[], Role::Host, false, &ours, &ours));
    }
}
