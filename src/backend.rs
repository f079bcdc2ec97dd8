//! Interface for the USB driver layer
//!
//! In order to redirect a real device, there must be a [`UsbBackend`]
//! implementation for the platform's USB stack. The engine only relies on
//! the capability contract spelled out here; everything else about the
//! driver (event loops, fd handling, hotplug) stays outside the crate.
//!

use alloc::vec::Vec;
use fugit::{MicrosDurationU32, MillisDurationU32};
use usb_device::control::{Recipient, RequestType};
use usb_device::UsbDirection;

use crate::types::{EndpointAddress, Speed};

/// USB specifies a 5 second max timeout for control transfers.
pub const CTRL_TIMEOUT: MillisDurationU32 = MillisDurationU32::millis(5000);
/// No timeout for bulk transfers.
pub const BULK_TIMEOUT: MillisDurationU32 = MillisDurationU32::millis(0);
pub const ISO_TIMEOUT: MillisDurationU32 = MillisDurationU32::millis(1000);
/// No timeout for interrupt transfers.
pub const INTERRUPT_TIMEOUT: MillisDurationU32 = MillisDurationU32::millis(0);

/// Errors reported by the driver layer for anything that is not a transfer
/// completion.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BackendError {
    /// The device is gone. Triggers the disconnect path.
    NoDevice,
    /// The entity does not exist (no active configuration, no bound
    /// kernel driver, ...). Several callers treat this as benign.
    NotFound,
    /// The resource is held by someone else (another application has the
    /// interface).
    Busy,
    InvalidParam,
    Timeout,
    /// The operation is not supported on this platform.
    NotSupported,
    Other,
}

/// Final state of a transfer as reported by the driver layer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    /// The device went away while the transfer was in flight.
    NoDevice,
    /// The device sent more data than asked for.
    Overflow,
}

/// Caller-chosen identifier correlating a [`Submission`] with its
/// [`Completion`] and with [`UsbBackend::cancel`] calls.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct TransferToken(pub u64);

/// The SETUP stage of a control transfer.
///
/// The fields are public because the backend must put them on the bus
/// verbatim; use [`SetupPacket::new`] to construct one from the usual
/// request building blocks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn new(
        direction: UsbDirection,
        request_type: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        SetupPacket {
            request_type: (recipient as u8) | ((request_type as u8) << 5) | (direction as u8),
            request,
            value,
            index,
            length,
        }
    }
}

/// General information about the device, from its device descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceInfo {
    pub speed: Speed,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version_bcd: u16,
    pub num_configurations: u8,
}

/// One endpoint of an alternate setting.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EndpointInfo {
    pub address: EndpointAddress,
    /// Raw `bmAttributes` transfer type bits (0..=3).
    pub kind: u8,
    pub interval: u8,
    /// Raw `wMaxPacketSize`, including the high-speed iso multiplier bits.
    pub max_packet_size: u16,
    /// Maximum number of bulk streams, from the SuperSpeed companion
    /// descriptor; 0 when the endpoint has none.
    pub max_streams: u32,
}

/// One alternate setting of an interface.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AltSettingInfo {
    pub alt: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

/// One interface of a configuration, with all of its alternate settings in
/// ascending order.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InterfaceInfo {
    pub number: u8,
    /// Class triple of alternate setting 0, which is what filters judge.
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub alt_settings: Vec<AltSettingInfo>,
}

/// A configuration descriptor reduced to what the engine needs.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ConfigInfo {
    pub configuration_value: u8,
    pub interfaces: Vec<InterfaceInfo>,
}

/// What kind of transfer a [`Submission`] is.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SubmissionKind {
    Control {
        setup: SetupPacket,
    },
    Bulk {
        /// Bulk stream to use; 0 for a plain bulk transfer.
        stream_id: u32,
    },
    Interrupt,
    Iso {
        /// Length of each packet in the transfer. Offsets into the buffer
        /// are the cumulative sums of these lengths.
        packet_lengths: Vec<u32>,
    },
}

/// A transfer handed to the driver layer.
///
/// The buffer travels with the submission: for OUT transfers it holds the
/// data to send, for IN transfers its length is the amount of data
/// requested. Ownership returns to the caller with the [`Completion`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Submission {
    pub token: TransferToken,
    pub endpoint: EndpointAddress,
    pub kind: SubmissionKind,
    pub buffer: Vec<u8>,
    /// 0 means no timeout.
    pub timeout: MillisDurationU32,
}

/// A submission the driver layer refused synchronously.
///
/// Hands the submission back so the caller can reuse the buffer and inject
/// the error into its normal completion path.
#[derive(Debug)]
pub struct SubmitError {
    pub error: BackendError,
    pub submission: Submission,
}

/// Result of one packet within an isochronous transfer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IsoPacketResult {
    pub status: TransferStatus,
    /// Offset of this packet's data within the transfer buffer.
    pub offset: usize,
    /// Bytes actually transferred for this packet.
    pub actual_length: usize,
}

/// A finished (or failed, or cancelled) transfer.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Completion {
    pub token: TransferToken,
    pub status: TransferStatus,
    /// Bytes actually transferred. For control IN transfers this counts
    /// the data stage only. Unused for isochronous transfers.
    pub actual_length: usize,
    /// The buffer that travelled with the submission.
    pub buffer: Vec<u8>,
    /// Per-packet results; empty for non-isochronous transfers.
    pub iso_packets: Vec<IsoPacketResult>,
}

/// Interface to the platform USB driver for one open device.
///
/// All methods take `&self`: the engine calls into the backend both from
/// its protocol context and while handling completions, possibly from
/// different threads. Implementations are expected to be internally
/// synchronized the way mainstream USB stacks already are.
///
/// Closing the device is dropping the backend.
pub trait UsbBackend {
    /// Read the device descriptor.
    fn device_info(&self) -> Result<DeviceInfo, BackendError>;

    /// Read the descriptors of the active configuration.
    ///
    /// `Ok(None)` means the device is currently unconfigured, which is a
    /// valid state, not an error.
    fn active_config(&self) -> Result<Option<ConfigInfo>, BackendError>;

    /// Read the descriptors of the configuration at `index`
    /// (0-based, not the configuration value).
    fn config_info(&self, index: u8) -> Result<ConfigInfo, BackendError>;

    /// Make the driver layer detach any kernel driver automatically on
    /// claim and re-attach it on release.
    ///
    /// The engine turns this off again around explicit configuration
    /// changes, where it wants to control re-attachment itself.
    fn set_auto_detach_kernel_driver(&self, enable: bool) -> Result<(), BackendError> {
        let _ = enable;
        Err(BackendError::NotSupported)
    }

    /// Claim an interface (by `bInterfaceNumber`) for exclusive use.
    fn claim_interface(&self, number: u8) -> Result<(), BackendError>;

    /// Release a previously claimed interface.
    fn release_interface(&self, number: u8) -> Result<(), BackendError>;

    /// Re-attach the kernel driver of an interface.
    fn attach_kernel_driver(&self, number: u8) -> Result<(), BackendError>;

    /// Select the active configuration; -1 leaves the device unconfigured.
    fn set_configuration(&self, value: i32) -> Result<(), BackendError>;

    /// Select an alternate setting on an interface.
    fn set_alt_setting(&self, interface: u8, alt: u8) -> Result<(), BackendError>;

    /// Clear the halt/stall condition of an endpoint.
    ///
    /// Must be used instead of forwarding a CLEAR_FEATURE(HALT) control
    /// request, so the driver layer's idea of the endpoint state (data
    /// toggles in particular) stays in sync with the device.
    fn clear_halt(&self, endpoint: EndpointAddress) -> Result<(), BackendError>;

    /// Perform a USB port reset on the device.
    ///
    /// If the device looks different afterwards the driver layer may
    /// report [`BackendError::NoDevice`] from here on, like after a
    /// physical unplug.
    fn reset_device(&self) -> Result<(), BackendError>;

    /// Allocate `num_streams` bulk streams on the given endpoints.
    /// Returns the number of streams actually allocated.
    fn alloc_streams(
        &self,
        num_streams: u32,
        endpoints: &[EndpointAddress],
    ) -> Result<u32, BackendError> {
        let _ = (num_streams, endpoints);
        Err(BackendError::NotSupported)
    }

    /// Free bulk streams previously allocated on the given endpoints.
    fn free_streams(&self, endpoints: &[EndpointAddress]) -> Result<(), BackendError> {
        let _ = endpoints;
        Err(BackendError::NotSupported)
    }

    /// Hand a transfer to the driver layer.
    ///
    /// The transfer completes asynchronously through
    /// [`poll_completion`](UsbBackend::poll_completion). A synchronous
    /// refusal returns the submission so the caller keeps the buffer.
    fn submit(&self, submission: Submission) -> Result<(), SubmitError>;

    /// Ask the driver layer to cancel an in-flight transfer.
    ///
    /// Best-effort: the transfer may complete normally if cancellation
    /// arrives too late. Either way exactly one completion is delivered.
    fn cancel(&self, token: TransferToken);

    /// Wait up to `timeout` for a transfer to finish and return its
    /// completion.
    ///
    /// The engine pumps this in a loop while draining cancellations; the
    /// embedder's event loop typically pumps it for normal operation as
    /// well (often from a dedicated thread).
    fn poll_completion(&self, timeout: MicrosDurationU32) -> Option<Completion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_packet_new() {
        let setup = SetupPacket::new(
            UsbDirection::In,
            RequestType::Standard,
            Recipient::Device,
            0x06,
            0x0100,
            0,
            18,
        );
        assert_eq!(setup.request_type, 0x80);
        assert_eq!(setup.request, 0x06);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.length, 18);
    }
}
