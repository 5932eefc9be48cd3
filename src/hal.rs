//! Abstract hardware collaborators (`spec.md` §4.4, §6, §9's "board bring-up
//! is out of scope" line). Every peripheral the rest of the crate touches —
//! block device, accelerometer, microphone ADC, battery ADC, motion
//! interrupt, BLE radio/notify transport — is a trait here; `src/main.rs`
//! wires real silicon to them. This mirrors the teacher's split: `lib.rs`
//! never touches a register directly, `main.rs` does.

pub use crate::clock::HardwareCounter;
use crate::error::Result;

/// Raw non-volatile storage, erase-sector-oriented (`spec.md` §4.4).
///
/// `store` is async in spirit — real implementations kick off a
/// page-program and return before it lands, signalling completion via
/// [`BlockDevice::is_ready`]. A caller that calls `store` again before the
/// device reports ready gets [`crate::error::Error::Busy`] and retries,
/// matching the original's `NRF_ERROR_BUSY` convention (`spec.md` §5).
pub trait BlockDevice {
    /// Total addressable bytes.
    fn capacity_bytes(&self) -> u32;
    /// Erase-sector size; partitions wrap on sector boundaries.
    fn sector_size(&self) -> u32;
    /// Minimum well-formed write granularity (writes must be word-aligned,
    /// `spec.md` §4.4).
    fn word_size(&self) -> u32;

    /// Synchronous read of `buf.len()` bytes starting at `addr`.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Begins an (possibly asynchronous) write of `bytes` at `addr`. Returns
    /// `Err(Error::Busy)` if a previous store has not yet completed.
    fn store(&mut self, addr: u32, bytes: &[u8]) -> Result<()>;

    /// Whether the last `store` has landed. Implementations with a
    /// synchronous backing store (e.g. host-side test doubles) can always
    /// return `true`.
    fn is_ready(&self) -> bool;
}

/// One accelerometer sample as read off the sensor's own hardware FIFO.
pub type RawAccelSample = [i16; 3];

/// The accelerometer's sampled-vector path and its independent
/// motion-interrupt path (`spec.md` §4.6's "Accelerometer"/"Accelerometer
/// interrupt" sections). A real sensor (e.g. an LIS2DH-class part) exposes
/// both through one register interface; the trait keeps them together for
/// the same reason.
pub trait Accelerometer {
    /// Configures the FIFO-drain sampling path. `datarate` is in Hz.
    fn configure(&mut self, operating_mode: u8, full_scale: u8, datarate: u16) -> Result<()>;

    /// Drains up to `out.len()` queued samples from the sensor's hardware
    /// FIFO into `out`, returning the count actually drained.
    fn drain_fifo(&mut self, out: &mut [RawAccelSample]) -> usize;

    /// Arms the motion interrupt at `threshold_mg` sustained for at least
    /// `min_duration_ms`.
    fn configure_motion_interrupt(&mut self, threshold_mg: u16, min_duration_ms: u16)
        -> Result<()>;

    /// Re-arms the motion interrupt after the ignore window following a
    /// fired event (`spec.md` §4.6's debounce re-arm).
    fn rearm_motion_interrupt(&mut self) -> Result<()>;
}

/// Microphone ADC sampling (`spec.md` §4.6's "Microphone" inner-timer
/// sampling). One call == one raw ADC read of the analog front-end.
pub trait MicrophoneAdc {
    fn sample(&mut self) -> u16;
}

/// Averaged battery-supply voltage (`spec.md` §4.6's "Battery").
pub trait BatteryAdc {
    fn read_voltage(&mut self) -> f32;
}

/// BLE GATT notify path (`spec.md` §4.9/§6): a Nordic-UART-like
/// characteristic. `Sender` queues bytes and hands MTU-sized frames to
/// this trait; the receive side is fed by [`BleReceiver`].
pub trait BleNotifier {
    /// Sends one already-MTU-sized frame (`<= spec.md`'s 20-byte link MTU).
    /// `Err(Error::Busy)` means the stack's notify buffer is full; the
    /// caller retries. `Err(Error::InvalidState)` means not connected.
    fn notify(&mut self, frame: &[u8]) -> Result<()>;

    /// Whether a central is currently connected.
    fn is_connected(&self) -> bool;
}

/// One observed peer-advertising report, already classified by the radio
/// driver (`spec.md` §4.6's "Scan" source). Payload parsing/protocol
/// detection is board-specific and stays out of this trait; a driver that
/// can't recognize the advertisement's protocol reports
/// `is_known_protocol: false` and [`sampling::SamplingCore`](crate::sampling::SamplingCore)
/// drops it before aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingReport {
    pub peer_id: u16,
    pub group: u8,
    pub rssi: i8,
    pub is_known_protocol: bool,
}

/// BLE scanning control (`spec.md` §4.6's "Scan" source). Distinct from
/// [`BleAdvertiser`], which controls what *this* badge broadcasts.
pub trait BleScanner {
    fn configure(&mut self, interval_ms: u16, window_ms: u16) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;

    /// Drains up to `out.len()` reports queued since the last drain,
    /// returning the count actually drained.
    fn drain_reports(&mut self, out: &mut [AdvertisingReport]) -> usize;
}

/// BLE advertising control (`spec.md` §6's identity payload).
pub trait BleAdvertiser {
    /// Sets the manufacturer-specific payload for the next advertising
    /// interval (`company_id` plus the 11-byte identity payload are
    /// assembled by `advertiser::Advertiser`; this trait just ships bytes).
    fn set_payload(&mut self, company_id: u16, payload: &[u8]) -> Result<()>;

    fn start(&mut self, interval_ms: u32) -> Result<()>;
    fn stop(&mut self) -> Result<()>;

    /// This device's 6-byte BLE MAC, used as the default badge-id seed
    /// (`spec.md` §3, §2 of the expanded spec).
    fn mac_address(&self) -> [u8; 6];
}
