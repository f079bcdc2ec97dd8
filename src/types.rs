//! Common types used throughout the crate
//!

use usb_device::UsbDirection;

/// Number of endpoint slots tracked per device.
///
/// Endpoint numbers are 4 bits and each number has an IN and an OUT pipe,
/// so 32 slots cover every possible endpoint address.
pub const MAX_ENDPOINT_SLOTS: usize = 32;

/// Maximum number of interfaces in a configuration that the engine (and the
/// `interface_info` wire message) can represent.
pub const MAX_INTERFACES: usize = 32;

/// The address of an endpoint as it appears on the wire and in descriptors.
///
/// Bit 7 selects the direction (1 = IN), bits 3..0 the endpoint number.
/// The remaining bits are reserved.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    /// Endpoint number (0-15).
    pub fn number(&self) -> u8 {
        self.0 & 0x0f
    }

    /// Direction of the endpoint.
    pub fn direction(&self) -> UsbDirection {
        self.0.into()
    }

    pub fn is_in(&self) -> bool {
        self.0 & 0x80 != 0
    }

    /// Folds the address byte into a 5-bit slot index.
    ///
    /// OUT endpoints occupy slots 0-15, IN endpoints slots 16-31, so both
    /// pipes of one endpoint number get distinct slots.
    pub fn slot(&self) -> usize {
        (((self.0 & 0x80) >> 3) | (self.0 & 0x0f)) as usize
    }

    /// Inverse of [`slot`](EndpointAddress::slot).
    pub fn from_slot(slot: usize) -> Self {
        let slot = slot as u8;
        EndpointAddress(((slot & 0x10) << 3) | (slot & 0x0f))
    }
}

impl From<u8> for EndpointAddress {
    fn from(raw: u8) -> Self {
        EndpointAddress(raw)
    }
}

/// Represents one of the four transfer types that USB supports, plus the
/// marker for an endpoint slot that the active configuration does not use.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TransferKind {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
    Invalid = 255,
}

impl TransferKind {
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            3 => TransferKind::Interrupt,
            _ => TransferKind::Invalid,
        }
    }
}

/// Result of a transfer as reported back over the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    Cancelled = 1,
    Inval = 2,
    Ioerror = 3,
    Stall = 4,
    Timeout = 5,
    Babble = 6,
    Disconnected = 7,
    NoDeviceInEp = 8,
}

impl Status {
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            0 => Status::Success,
            1 => Status::Cancelled,
            2 => Status::Inval,
            4 => Status::Stall,
            5 => Status::Timeout,
            6 => Status::Babble,
            7 => Status::Disconnected,
            8 => Status::NoDeviceInEp,
            _ => Status::Ioerror,
        }
    }
}

/// Speed at which the redirected device operates, as advertised in
/// `device_connect`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Speed {
    Low = 0,
    Full = 1,
    High = 2,
    Super = 3,
    Unknown = 255,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_fold() {
        assert_eq!(EndpointAddress(0x00).slot(), 0x00);
        assert_eq!(EndpointAddress(0x80).slot(), 0x10);
        assert_eq!(EndpointAddress(0x81).slot(), 0x11);
        assert_eq!(EndpointAddress(0x02).slot(), 0x02);
        assert_eq!(EndpointAddress(0x0f).slot(), 0x0f);
        assert_eq!(EndpointAddress(0x8f).slot(), 0x1f);
    }

    #[test]
    fn test_slot_round_trip() {
        for slot in 0..MAX_ENDPOINT_SLOTS {
            assert_eq!(EndpointAddress::from_slot(slot).slot(), slot);
        }
    }

    #[test]
    fn test_direction() {
        assert!(EndpointAddress(0x81).is_in());
        assert!(!EndpointAddress(0x01).is_in());
        assert_eq!(EndpointAddress(0x81).number(), 1);
    }
}
