//! Shared test doubles: an in-memory channel and a recording sink.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::filter;
use crate::parser::PacketSink;
use crate::proto::*;
use crate::{Channel, ChannelError};

/// A loopback channel: tests stuff `input`, the code under test reads it
/// and writes into `written`. Optional limits simulate short reads and
/// would-block conditions.
#[derive(Default)]
pub struct MockChannel {
    pub input: VecDeque<u8>,
    pub written: Vec<u8>,
    /// Max bytes returned per read call.
    pub read_limit: Option<usize>,
    /// Remaining write budget; `Some(0)` makes writes report would-block.
    pub write_limit: Option<usize>,
    pub fail_reads: bool,
    pub fail_writes: bool,
}

impl MockChannel {
    pub fn new() -> Self {
        MockChannel::default()
    }

    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }
}

impl Channel for MockChannel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if self.fail_reads {
            return Err(ChannelError);
        }
        let mut n = buf.len().min(self.input.len());
        if let Some(limit) = self.read_limit {
            n = n.min(limit);
        }
        for slot in buf[..n].iter_mut() {
            *slot = self.input.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        if self.fail_writes {
            return Err(ChannelError);
        }
        let n = match &mut self.write_limit {
            Some(budget) => {
                let n = buf.len().min(*budget);
                *budget -= n;
                n
            }
            None => buf.len(),
        };
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// Everything a [`RecordingSink`] observed, in order.
#[derive(Clone, PartialEq, Debug)]
pub enum SinkEvent {
    Hello,
    DeviceConnect(DeviceConnectHeader),
    DeviceDisconnect,
    DeviceDisconnectAck,
    Reset,
    InterfaceInfo(InterfaceInfoHeader),
    EpInfo(EpInfoHeader),
    SetConfiguration { id: u64, configuration: u8 },
    GetConfiguration { id: u64 },
    ConfigurationStatus { id: u64, header: ConfigurationStatusHeader },
    AltSettingStatus { id: u64, header: AltSettingStatusHeader },
    IsoStreamStatus { id: u64, header: IsoStreamStatusHeader },
    InterruptReceivingStatus { id: u64, header: InterruptReceivingStatusHeader },
    BulkStreamsStatus { id: u64, header: BulkStreamsStatusHeader },
    BulkReceivingStatus { id: u64, header: BulkReceivingStatusHeader },
    CancelDataPacket { id: u64 },
    FilterReject,
    FilterFilter { rules: Vec<filter::Rule> },
    ControlPacket { id: u64, header: ControlPacketHeader, data: Vec<u8> },
    BulkPacket { id: u64, header: BulkPacketHeader, data: Vec<u8> },
    IsoPacket { id: u64, header: IsoPacketHeader, data: Vec<u8> },
    InterruptPacket { id: u64, header: InterruptPacketHeader, data: Vec<u8> },
    BufferedBulkPacket { id: u64, header: BufferedBulkPacketHeader, data: Vec<u8> },
}

/// A [`PacketSink`] that records every dispatched message.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<SinkEvent>,
}

impl PacketSink for RecordingSink {
    fn hello(&mut self, _hello: &HelloHeader) {
        self.events.push(SinkEvent::Hello);
    }

    fn device_connect(&mut self, header: &DeviceConnectHeader) {
        self.events.push(SinkEvent::DeviceConnect(*header));
    }

    fn device_disconnect(&mut self) {
        self.events.push(SinkEvent::DeviceDisconnect);
    }

    fn device_disconnect_ack(&mut self) {
        self.events.push(SinkEvent::DeviceDisconnectAck);
    }

    fn reset(&mut self) {
        self.events.push(SinkEvent::Reset);
    }

    fn interface_info(&mut self, header: &InterfaceInfoHeader) {
        self.events.push(SinkEvent::InterfaceInfo(*header));
    }

    fn ep_info(&mut self, header: &EpInfoHeader) {
        self.events.push(SinkEvent::EpInfo(*header));
    }

    fn set_configuration(&mut self, id: u64, header: &SetConfigurationHeader) {
        self.events.push(SinkEvent::SetConfiguration {
            id,
            configuration: header.configuration,
        });
    }

    fn get_configuration(&mut self, id: u64) {
        self.events.push(SinkEvent::GetConfiguration { id });
    }

    fn configuration_status(&mut self, id: u64, header: &ConfigurationStatusHeader) {
        self.events.push(SinkEvent::ConfigurationStatus { id, header: *header });
    }

    fn alt_setting_status(&mut self, id: u64, header: &AltSettingStatusHeader) {
        self.events.push(SinkEvent::AltSettingStatus { id, header: *header });
    }

    fn iso_stream_status(&mut self, id: u64, header: &IsoStreamStatusHeader) {
        self.events.push(SinkEvent::IsoStreamStatus { id, header: *header });
    }

    fn interrupt_receiving_status(&mut self, id: u64, header: &InterruptReceivingStatusHeader) {
        self.events
            .push(SinkEvent::InterruptReceivingStatus { id, header: *header });
    }

    fn bulk_streams_status(&mut self, id: u64, header: &BulkStreamsStatusHeader) {
        self.events.push(SinkEvent::BulkStreamsStatus { id, header: *header });
    }

    fn bulk_receiving_status(&mut self, id: u64, header: &BulkReceivingStatusHeader) {
        self.events
            .push(SinkEvent::BulkReceivingStatus { id, header: *header });
    }

    fn cancel_data_packet(&mut self, id: u64) {
        self.events.push(SinkEvent::CancelDataPacket { id });
    }

    fn filter_reject(&mut self) {
        self.events.push(SinkEvent::FilterReject);
    }

    fn filter_filter(&mut self, rules: Vec<filter::Rule>) {
        self.events.push(SinkEvent::FilterFilter { rules });
    }

    fn control_packet(&mut self, id: u64, header: &ControlPacketHeader, data: Vec<u8>) {
        self.events.push(SinkEvent::ControlPacket { id, header: *header, data });
    }

    fn bulk_packet(&mut self, id: u64, header: &BulkPacketHeader, data: Vec<u8>) {
        self.events.push(SinkEvent::BulkPacket { id, header: *header, data });
    }

    fn iso_packet(&mut self, id: u64, header: &IsoPacketHeader, data: Vec<u8>) {
        self.events.push(SinkEvent::IsoPacket { id, header: *header, data });
    }

    fn interrupt_packet(&mut self, id: u64, header: &InterruptPacketHeader, data: Vec<u8>) {
        self.events.push(SinkEvent::InterruptPacket { id, header: *header, data });
    }

    fn buffered_bulk_packet(&mut self, id: u64, header: &BufferedBulkPacketHeader, data: Vec<u8>) {
        self.events
            .push(SinkEvent::BufferedBulkPacket { id, header: *header, data });
    }
}
