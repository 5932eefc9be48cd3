//! Firmware entry point: wires real silicon to the [`badge_core::hal`]
//! traits and drives [`badge_core::Core`] from interrupt and main context.
//!
//! Board bring-up, the SPI/ADC/GPIO drivers, and the BLE link-layer stack
//! are explicitly out of scope for this repository (`spec.md` §1) — they
//! are abstract collaborators reached through `hal`'s traits. This file is
//! the thin seam a real board port fills in; it owns no sampling,
//! persistence, or protocol logic of its own, mirroring the teacher's
//! split between a hardware-bring-up `main.rs` and a logic-only library.
#![no_std]
#![no_main]

use badge_core::error::Result;
use badge_core::hal::{
    Accelerometer, AdvertisingReport, BatteryAdc, BleAdvertiser, BleNotifier, BleScanner,
    BlockDevice, HardwareCounter, MicrophoneAdc, RawAccelSample,
};
use badge_core::storer::PartitionLayout;
use badge_core::Core;
use cortex_m_rt::entry;
use defmt_rtt as _;
use panic_halt as _;

/// Free-running 24-bit RTC-derived tick counter (`spec.md` §4.1). Real
/// silicon wires this to the board's low-frequency RTC peripheral; board
/// bring-up is out of scope here, so this is a placeholder seam.
struct BoardTickCounter;

impl HardwareCounter for BoardTickCounter {
    fn read(&self) -> u32 {
        0
    }
}

/// Placeholder seam for the on-board SPI/QSPI NOR flash (`spec.md` §4.4).
/// A real port implements `store`/`read`/`is_ready` against the flash
/// driver and sector geometry for the chosen part.
struct BoardFlash;

impl BlockDevice for BoardFlash {
    fn capacity_bytes(&self) -> u32 {
        1 << 20
    }
    fn sector_size(&self) -> u32 {
        4096
    }
    fn word_size(&self) -> u32 {
        4
    }
    fn read(&mut self, _addr: u32, _buf: &mut [u8]) -> Result<()> {
        Ok(())
    }
    fn store(&mut self, _addr: u32, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }
    fn is_ready(&self) -> bool {
        true
    }
}

struct BoardAccelerometer;

impl Accelerometer for BoardAccelerometer {
    fn configure(&mut self, _operating_mode: u8, _full_scale: u8, _datarate: u16) -> Result<()> {
        Ok(())
    }
    fn drain_fifo(&mut self, _out: &mut [RawAccelSample]) -> usize {
        0
    }
    fn configure_motion_interrupt(&mut self, _threshold_mg: u16, _min_duration_ms: u16) -> Result<()> {
        Ok(())
    }
    fn rearm_motion_interrupt(&mut self) -> Result<()> {
        Ok(())
    }
}

struct BoardMicrophone;

impl MicrophoneAdc for BoardMicrophone {
    fn sample(&mut self) -> u16 {
        0
    }
}

struct BoardBattery;

impl BatteryAdc for BoardBattery {
    fn read_voltage(&mut self) -> f32 {
        3.7
    }
}

struct BoardScanner;

impl BleScanner for BoardScanner {
    fn configure(&mut self, _interval_ms: u16, _window_ms: u16) -> Result<()> {
        Ok(())
    }
    fn start(&mut self) -> Result<()> {
        Ok(())
    }
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
    fn drain_reports(&mut self, _out: &mut [AdvertisingReport]) -> usize {
        0
    }
}

struct BoardNotifier;

impl BleNotifier for BoardNotifier {
    fn notify(&mut self, _frame: &[u8]) -> Result<()> {
        Ok(())
    }
    fn is_connected(&self) -> bool {
        false
    }
}

struct BoardAdvertiser;

impl BleAdvertiser for BoardAdvertiser {
    fn set_payload(&mut self, _company_id: u16, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
    fn start(&mut self, _interval_ms: u32) -> Result<()> {
        Ok(())
    }
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
    fn mac_address(&self) -> [u8; 6] {
        [0, 0, 0, 0, 0, 0]
    }
}

/// Partition byte ranges for the placeholder `BoardFlash` geometry above.
/// A real port computes these from the part's actual capacity.
fn board_partition_layout() -> PartitionLayout {
    let header = 256u32;
    let badge_assignment = (header, header + 64);
    let battery = (badge_assignment.1, badge_assignment.1 + 8192);
    let microphone = (battery.1, battery.1 + 65536);
    let scan = (microphone.1, microphone.1 + 65536);
    let accel_interrupt = (scan.1, scan.1 + 65536);
    let accel = (accel_interrupt.1, accel_interrupt.1 + (1 << 20) - accel_interrupt.1);
    PartitionLayout {
        badge_assignment,
        battery,
        microphone,
        scan,
        accel_interrupt,
        accel,
    }
}

#[entry]
fn main() -> ! {
    // `defmt-rtt` registers itself as the global defmt logger on link;
    // nothing further to initialize here.

    let mut core = Core::new(
        BoardTickCounter,
        BoardAccelerometer,
        BoardMicrophone,
        BoardBattery,
        BoardScanner,
        BoardFlash,
        board_partition_layout(),
        BoardNotifier,
        BoardAdvertiser,
    )
    .expect("partition geometry is fixed at compile time");

    loop {
        core.run_once();
    }
}
