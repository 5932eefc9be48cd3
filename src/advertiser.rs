//! L3 advertising identity payload (`spec.md` §6), grounded in
//! `advertising_lib.c`.
//!
//! The badge broadcasts an 11-byte manufacturer-specific payload every
//! `ADVERTISING_INTERVAL_MS` whether or not a hub is connected: battery
//! level, a bitset of which sampling sources are currently enabled, this
//! badge's assigned id/group, and its BLE MAC. A hub passively scanning
//! (rather than connected) uses this to build its own proximity picture
//! without an active request/response round trip.

use crate::codec::{Endian, Writer};
use crate::config::{ADVERTISING_COMPANY_ID, ADVERTISING_DEFAULT_GROUP, ADVERTISING_PAYLOAD_LEN};
use crate::crc16::crc16;
use crate::error::Result;
use crate::hal::BleAdvertiser;
use crate::messages::BadgeAssignment;

mod status_bits {
    pub const CLOCK_SYNCED: u8 = 1 << 0;
    pub const MICROPHONE_ENABLED: u8 = 1 << 1;
    pub const SCAN_ENABLED: u8 = 1 << 2;
    pub const ACCELEROMETER_ENABLED: u8 = 1 << 3;
    pub const ACCELEROMETER_INTERRUPT_ENABLED: u8 = 1 << 4;
    pub const BATTERY_ENABLED: u8 = 1 << 5;
}

/// Every bit the advertising payload's status byte reports (`spec.md` §6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub clock_synced: bool,
    pub microphone_enabled: bool,
    pub scan_enabled: bool,
    pub accelerometer_enabled: bool,
    pub accelerometer_interrupt_enabled: bool,
    pub battery_enabled: bool,
}

impl StatusFlags {
    fn to_byte(self) -> u8 {
        use status_bits::*;
        let mut b = 0u8;
        if self.clock_synced {
            b |= CLOCK_SYNCED;
        }
        if self.microphone_enabled {
            b |= MICROPHONE_ENABLED;
        }
        if self.scan_enabled {
            b |= SCAN_ENABLED;
        }
        if self.accelerometer_enabled {
            b |= ACCELEROMETER_ENABLED;
        }
        if self.accelerometer_interrupt_enabled {
            b |= ACCELEROMETER_INTERRUPT_ENABLED;
        }
        if self.battery_enabled {
            b |= BATTERY_ENABLED;
        }
        b
    }
}

/// Converts a battery voltage into the payload's one-byte level: `100` is
/// the zero point (badges run down to roughly 1.0 V/cell above cutoff),
/// each unit is 10 mV, clamped to `u8` (`spec.md` §6's clamp formula).
fn battery_level_byte(volts: f32) -> u8 {
    let raw = volts * 100.0 - 100.0;
    if raw <= 0.0 {
        0
    } else if raw >= 255.0 {
        255
    } else {
        raw as u8
    }
}

pub struct Advertiser<A: BleAdvertiser> {
    driver: A,
    assignment: Option<BadgeAssignment>,
}

impl<A: BleAdvertiser> Advertiser<A> {
    pub fn new(driver: A) -> Self {
        Self { driver, assignment: None }
    }

    /// Sets the stored badge assignment (from `storer::Storer`'s
    /// badge-assignment partition). `None` falls back to the default
    /// derivation: id = `crc16(mac)`, group = `ADVERTISING_DEFAULT_GROUP`.
    pub fn set_assignment(&mut self, assignment: Option<BadgeAssignment>) {
        self.assignment = assignment;
    }

    fn effective_assignment(&self) -> BadgeAssignment {
        self.assignment.unwrap_or_else(|| BadgeAssignment {
            id: crc16(&self.driver.mac_address()),
            group: ADVERTISING_DEFAULT_GROUP,
        })
    }

    /// Assembles and ships the identity payload, then (re)starts
    /// advertising at `ADVERTISING_INTERVAL_MS`.
    pub fn advertise(&mut self, battery_volts: f32, status: StatusFlags) -> Result<()> {
        let assignment = self.effective_assignment();
        let mac = self.driver.mac_address();
        let mut buf = [0u8; ADVERTISING_PAYLOAD_LEN];
        {
            let mut w = Writer::new(&mut buf);
            w.put_u8(battery_level_byte(battery_volts))?;
            w.put_u8(status.to_byte())?;
            w.put_u16(assignment.id, Endian::Little)?;
            w.put_u8(assignment.group)?;
            w.bytes(&mac)?;
        }
        self.driver.set_payload(ADVERTISING_COMPANY_ID, &buf)?;
        self.driver.start(crate::config::ADVERTISING_INTERVAL_MS)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.driver.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAdvertiser {
        mac: [u8; 6],
        payload: Option<([u8; ADVERTISING_PAYLOAD_LEN], u16)>,
        started: bool,
    }

    impl BleAdvertiser for FakeAdvertiser {
        fn set_payload(&mut self, company_id: u16, payload: &[u8]) -> Result<()> {
            let mut buf = [0u8; ADVERTISING_PAYLOAD_LEN];
            buf.copy_from_slice(payload);
            self.payload = Some((buf, company_id));
            Ok(())
        }
        fn start(&mut self, _interval_ms: u32) -> Result<()> {
            self.started = true;
            Ok(())
        }
        fn stop(&mut self) -> Result<()> {
            self.started = false;
            Ok(())
        }
        fn mac_address(&self) -> [u8; 6] {
            self.mac
        }
    }

    #[test]
    fn default_assignment_derives_id_from_mac_crc16() {
        let mac = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let driver = FakeAdvertiser { mac, payload: None, started: false };
        let mut adv = Advertiser::new(driver);
        adv.advertise(3.0, StatusFlags::default()).unwrap();
        let (payload, company_id) = adv.driver.payload.unwrap();
        assert_eq!(company_id, ADVERTISING_COMPANY_ID);
        let expected_id = crc16(&mac);
        assert_eq!(u16::from_le_bytes([payload[2], payload[3]]), expected_id);
        assert_eq!(payload[4], ADVERTISING_DEFAULT_GROUP);
        assert_eq!(&payload[5..11], &mac);
        assert!(adv.driver.started);
    }

    #[test]
    fn explicit_assignment_overrides_default() {
        let driver = FakeAdvertiser { mac: [0; 6], payload: None, started: false };
        let mut adv = Advertiser::new(driver);
        adv.set_assignment(Some(BadgeAssignment { id: 42, group: 7 }));
        adv.advertise(2.0, StatusFlags::default()).unwrap();
        let (payload, _) = adv.driver.payload.unwrap();
        assert_eq!(u16::from_le_bytes([payload[2], payload[3]]), 42);
        assert_eq!(payload[4], 7);
    }

    #[test]
    fn status_byte_encodes_every_flag() {
        let driver = FakeAdvertiser { mac: [0; 6], payload: None, started: false };
        let mut adv = Advertiser::new(driver);
        let status = StatusFlags {
            clock_synced: true,
            microphone_enabled: false,
            scan_enabled: true,
            accelerometer_enabled: false,
            accelerometer_interrupt_enabled: true,
            battery_enabled: false,
        };
        adv.advertise(3.3, status).unwrap();
        let (payload, _) = adv.driver.payload.unwrap();
        assert_eq!(payload[1], 0b0001_0101);
    }

    #[test]
    fn battery_clamps_at_both_ends() {
        assert_eq!(battery_level_byte(1.0), 0);
        assert_eq!(battery_level_byte(4.5), 255);
        assert_eq!(battery_level_byte(2.5), 150);
    }
}
