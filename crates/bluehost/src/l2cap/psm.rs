//! Protocol/Service Multiplexer (PSM) values

use std::fmt;

/// Protocol/Service Multiplexer identifying the service behind a dynamic channel.
///
/// See Bluetooth Core Specification Vol 3, Part A, Section 4.2 and the
/// assigned numbers for logical link control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Psm(pub u16);

impl Psm {
    pub const SDP: Psm = Psm(0x0001);
    pub const RFCOMM: Psm = Psm(0x0003);
    pub const TCS_BIN: Psm = Psm(0x0005);
    pub const BNEP: Psm = Psm(0x000F);
    pub const HID_CONTROL: Psm = Psm(0x0011);
    pub const HID_INTERRUPT: Psm = Psm(0x0013);
    pub const AVCTP: Psm = Psm(0x0017);
    pub const AVDTP: Psm = Psm(0x0019);
    pub const AVCTP_BROWSING: Psm = Psm(0x001B);
    pub const ATT: Psm = Psm(0x001F);

    pub fn value(self) -> u16 {
        self.0
    }

    /// Classic PSMs are odd with the least significant bit of the upper byte clear
    pub fn is_valid_classic(self) -> bool {
        (self.0 & 0x0101) == 0x0001
    }

    /// LE PSMs fit in one octet
    pub fn is_valid_le(self) -> bool {
        (0x0001..=0x00FF).contains(&self.0)
    }

    /// Dynamically assigned, as opposed to SIG-assigned
    pub fn is_dynamic(self) -> bool {
        self.0 >= 0x1001
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Psm::SDP => "SDP",
            Psm::RFCOMM => "RFCOMM",
            Psm::TCS_BIN => "TCS-BIN",
            Psm::BNEP => "BNEP",
            Psm::HID_CONTROL => "HID-Control",
            Psm::HID_INTERRUPT => "HID-Interrupt",
            Psm::AVCTP => "AVCTP",
            Psm::AVDTP => "AVDTP",
            Psm::AVCTP_BROWSING => "AVCTP-Browsing",
            Psm::ATT => "ATT",
            _ => return None,
        };
        Some(name)
    }
}

impl From<u16> for Psm {
    fn from(value: u16) -> Self {
        Psm(value)
    }
}

impl fmt::Display for Psm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:04X})", name, self.0),
            None => write!(f, "PSM 0x{:04X}", self.0),
        }
    }
}
