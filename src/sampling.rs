//! L3 sampling core: the five sensor sources (`spec.md` §4.6) plus the
//! scan sort/truncate policy (§4.7), grounded in `sampling_lib.c`/`.h` and
//! `processing_lib.c`.
//!
//! Each source independently tracks a batch mode (fills a chunk, handed to
//! [`crate::chunk_fifo::ChunkFifo`] for the storer to persist) and a stream
//! mode (pushes raw samples to a [`crate::ring::Ring`] for the request
//! engine's periodic stream response). Starting either mode arms the
//! underlying driver if it wasn't already running; stopping both tears it
//! down. Timer/interrupt lifecycles themselves are owned by the caller (the
//! timeout registry multiplexed in `core::Core`) — this module only reacts
//! to "a tick/interrupt happened at timestamp T", matching `spec.md` §9's
//! "no module owns an alarm, only `Core` does".

use heapless::Vec as HVec;

use crate::chunk_fifo::ChunkFifo;
use crate::config::{
    ACCELEROMETER_CHUNK_DATA_SIZE, ACCELEROMETER_CHUNK_FIFO_DEPTH,
    ACCELEROMETER_INTERRUPT_CHUNK_FIFO_DEPTH, ACCELEROMETER_INTERRUPT_STREAM_FIFO_DEPTH,
    ACCELEROMETER_STREAM_FIFO_DEPTH, BATTERY_CHUNK_FIFO_DEPTH, BATTERY_STREAM_FIFO_DEPTH,
    MICROPHONE_CHUNK_DATA_SIZE, MICROPHONE_CHUNK_FIFO_DEPTH, MICROPHONE_MIN_INNER_SAMPLES,
    MICROPHONE_STREAM_FIFO_DEPTH, SCAN_BEACON_ID_THRESHOLD, SCAN_CHUNK_DATA_SIZE,
    SCAN_CHUNK_FIFO_DEPTH, SCAN_NO_GROUP_FILTER, SCAN_PRIORITIZED_BEACONS,
    SCAN_SAMPLING_CHUNK_DATA_SIZE, SCAN_STREAM_FIFO_DEPTH, SCANNER_MINIMUM_RSSI,
};
use crate::error::Result;
use crate::hal::{Accelerometer, AdvertisingReport, BatteryAdc, BleScanner, MicrophoneAdc};
use crate::log::warn;
use crate::messages::{
    AccelerometerChunk, AccelerometerData, AccelerometerInterruptChunk, AccelerometerRawData,
    BatteryChunk, BatteryData, MicrophoneChunk, MicrophoneData, ScanChunk, ScanDevice,
    ScanResultData, Timestamp,
};
use crate::ring::Ring;

/// Scan aggregation policy (`StartScanRequest::aggregation_type`): `0` picks
/// the strongest rssi seen per peer across the scan duration, `1` averages
/// every report seen for that peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Max,
    Mean,
}

impl Aggregation {
    pub fn from_u8(v: u8) -> Self {
        if v == 1 {
            Aggregation::Mean
        } else {
            Aggregation::Max
        }
    }
}

/// Parameters for one scan cycle (`spec.md` §4.6's "Scan").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    pub interval_ms: u16,
    pub window_ms: u16,
    pub duration_s: u16,
    pub period_s: u16,
    pub aggregation: Aggregation,
    /// This badge's own assigned group. Reports whose group doesn't match
    /// are dropped, unless this is [`SCAN_NO_GROUP_FILTER`] ("no filter").
    pub own_group: u8,
}

/// Stable insertion sort (ascending by `key`) — no `alloc`, so `[T]::sort*`
/// isn't available; scan chunks are small enough (`<= 255` entries) that
/// O(n^2) costs nothing measurable once per scan duration.
fn insertion_sort_by_key<T, K, F>(arr: &mut [T], key: F)
where
    K: PartialOrd,
    F: Fn(&T) -> K,
{
    for i in 1..arr.len() {
        let mut j = i;
        while j > 0 && key(&arr[j]) < key(&arr[j - 1]) {
            arr.swap(j, j - 1);
            j -= 1;
        }
    }
}

fn is_beacon(e: &ScanResultData) -> bool {
    e.device.id >= SCAN_BEACON_ID_THRESHOLD
}

/// Sorts and truncates a scan cycle's aggregated results (`spec.md` §4.7):
/// beacons are grouped to the front and sorted rssi-descending, then the
/// `SCAN_PRIORITIZED_BEACONS` (4) strongest beacons stay pinned in front and
/// the next `len - num_beacons` entries are sorted rssi-descending, before
/// truncating to `SCAN_CHUNK_DATA_SIZE` (29).
///
/// This second sort's range is `[k, k + (len - num_beacons))`, copying
/// `processing_lib.c`'s `qsort(&scan_result_data[prioritized_beacons],
/// scan_result_data_count - num_beacons, ...)` exactly — it is *not*
/// `[k, len)`. When there are more than `SCAN_PRIORITIZED_BEACONS` beacons
/// (`num_beacons > k`), the last `num_beacons - k` entries fall outside
/// both sorted ranges and stay in their post-beacon-grouping order. This
/// is the documented `spec.md` §9 Open Question: not rssi-optimal, but
/// preserved for byte-compatibility with the hub.
pub fn sort_and_truncate_scan(
    entries: &mut HVec<ScanResultData, SCAN_SAMPLING_CHUNK_DATA_SIZE>,
) -> HVec<ScanResultData, SCAN_CHUNK_DATA_SIZE> {
    insertion_sort_by_key(entries.as_mut_slice(), |e| if is_beacon(e) { 0u8 } else { 1u8 });
    let num_beacons = entries.iter().take_while(|e| is_beacon(e)).count();
    insertion_sort_by_key(&mut entries.as_mut_slice()[..num_beacons], |e| {
        -(e.device.rssi as i16)
    });
    let k = num_beacons.min(SCAN_PRIORITIZED_BEACONS);
    let sorted_len = entries.len() - num_beacons;
    insertion_sort_by_key(&mut entries.as_mut_slice()[k..k + sorted_len], |e| {
        -(e.device.rssi as i16)
    });

    let mut out = HVec::new();
    for e in entries.iter().take(SCAN_CHUNK_DATA_SIZE) {
        // Capacity matches the iteration bound; push cannot fail.
        let _ = out.push(*e);
    }
    out
}

struct ScanAccumEntry {
    id: u16,
    rssi_accum: i32,
    count: u8,
}

/// In-progress scan cycle: running per-peer aggregation before sort/finalize.
struct ScanAccumulator {
    timestamp: Timestamp,
    entries: HVec<ScanAccumEntry, SCAN_SAMPLING_CHUNK_DATA_SIZE>,
}

impl ScanAccumulator {
    const fn new() -> Self {
        Self {
            timestamp: Timestamp { seconds: 0, ms: 0 },
            entries: HVec::new(),
        }
    }

    fn reset(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
        self.entries.clear();
    }

    fn observe(&mut self, id: u16, rssi: i8, aggregation: Aggregation) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.id == id) {
            existing.count = existing.count.saturating_add(1);
            existing.rssi_accum = match aggregation {
                Aggregation::Max => existing.rssi_accum.max(rssi as i32),
                Aggregation::Mean => existing.rssi_accum + rssi as i32,
            };
            return;
        }
        // Full accumulator silently drops further distinct peers for this
        // cycle (`spec.md` §4.3's "nothing closed is lost" doesn't apply
        // pre-finalize; this mirrors the chunk FIFO's overflow policy).
        let _ = self.entries.push(ScanAccumEntry {
            id,
            rssi_accum: rssi as i32,
            count: 1,
        });
    }

    fn finalize(&self, aggregation: Aggregation) -> HVec<ScanResultData, SCAN_SAMPLING_CHUNK_DATA_SIZE> {
        let mut out = HVec::new();
        for e in self.entries.iter() {
            let rssi = match aggregation {
                Aggregation::Max => e.rssi_accum as i8,
                Aggregation::Mean => (e.rssi_accum / e.count as i32) as i8,
            };
            let _ = out.push(ScanResultData {
                device: ScanDevice { id: e.id, rssi },
                count: e.count,
            });
        }
        out
    }
}

/// Which half (batch chunk / live stream) of a source is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ModeBits {
    batch: bool,
    stream: bool,
}

impl ModeBits {
    fn enabled(&self) -> bool {
        self.batch || self.stream
    }
}

/// The five independent sensor sources (`spec.md` §4.6), generic over the
/// hardware collaborators they drive so host tests can swap in fakes the
/// way `storer::Storer<D>` does for its block device.
pub struct SamplingCore<A: Accelerometer, M: MicrophoneAdc, B: BatteryAdc, S: BleScanner> {
    accel_driver: A,
    mic_driver: M,
    battery_driver: B,
    scan_driver: S,

    accelerometer: ModeBits,
    accelerometer_interrupt: ModeBits,
    battery: ModeBits,
    microphone: ModeBits,
    scan: ModeBits,

    pub accel_chunk_fifo: ChunkFifo<AccelerometerChunk, { ACCELEROMETER_CHUNK_FIFO_DEPTH + 1 }>,
    pub accel_stream: Ring<AccelerometerRawData, ACCELEROMETER_STREAM_FIFO_DEPTH>,

    pub accel_interrupt_chunk_fifo:
        ChunkFifo<AccelerometerInterruptChunk, { ACCELEROMETER_INTERRUPT_CHUNK_FIFO_DEPTH + 1 }>,
    pub accel_interrupt_stream: Ring<Timestamp, ACCELEROMETER_INTERRUPT_STREAM_FIFO_DEPTH>,
    accel_interrupt_ignore_duration_ms: u32,

    pub battery_chunk_fifo: ChunkFifo<BatteryChunk, { BATTERY_CHUNK_FIFO_DEPTH + 1 }>,
    pub battery_stream: Ring<BatteryData, BATTERY_STREAM_FIFO_DEPTH>,
    latest_battery: BatteryData,

    pub microphone_chunk_fifo: ChunkFifo<MicrophoneChunk, { MICROPHONE_CHUNK_FIFO_DEPTH + 1 }>,
    pub microphone_stream: Ring<MicrophoneData, MICROPHONE_STREAM_FIFO_DEPTH>,
    mic_sample_period_ms: u16,
    mic_accum_sum: u32,
    mic_accum_count: u32,

    pub scan_chunk_fifo: ChunkFifo<ScanChunk, { SCAN_CHUNK_FIFO_DEPTH + 1 }>,
    pub scan_stream: Ring<ScanDevice, SCAN_STREAM_FIFO_DEPTH>,
    scan_config: Option<ScanConfig>,
    scan_accum: ScanAccumulator,
    scan_cycle_open: bool,
}

impl<A: Accelerometer, M: MicrophoneAdc, B: BatteryAdc, S: BleScanner> SamplingCore<A, M, B, S> {
    pub fn new(accel_driver: A, mic_driver: M, battery_driver: B, scan_driver: S) -> Self {
        Self {
            accel_driver,
            mic_driver,
            battery_driver,
            scan_driver,
            accelerometer: ModeBits::default(),
            accelerometer_interrupt: ModeBits::default(),
            battery: ModeBits::default(),
            microphone: ModeBits::default(),
            scan: ModeBits::default(),
            accel_chunk_fifo: ChunkFifo::new(),
            accel_stream: Ring::new(),
            accel_interrupt_chunk_fifo: ChunkFifo::new(),
            accel_interrupt_stream: Ring::new(),
            accel_interrupt_ignore_duration_ms: 0,
            battery_chunk_fifo: ChunkFifo::new(),
            battery_stream: Ring::new(),
            latest_battery: BatteryData::default(),
            microphone_chunk_fifo: ChunkFifo::new(),
            microphone_stream: Ring::new(),
            mic_sample_period_ms: 0,
            mic_accum_sum: 0,
            mic_accum_count: 0,
            scan_chunk_fifo: ChunkFifo::new(),
            scan_stream: Ring::new(),
            scan_config: None,
            scan_accum: ScanAccumulator::new(),
            scan_cycle_open: false,
        }
    }

    // -------------------------------------------------------- status --

    pub fn accelerometer_enabled(&self) -> bool {
        self.accelerometer.enabled()
    }
    pub fn accelerometer_interrupt_enabled(&self) -> bool {
        self.accelerometer_interrupt.enabled()
    }
    pub fn battery_enabled(&self) -> bool {
        self.battery.enabled()
    }
    pub fn microphone_enabled(&self) -> bool {
        self.microphone.enabled()
    }
    pub fn scan_enabled(&self) -> bool {
        self.scan.enabled()
    }

    // `spec.md` §4.8's status response and §6's advertising status flags
    // both report batch-only activity (`request_handler_lib_02v1.c`'s
    // status response reads `sampling_configuration & SAMPLING_*`, never
    // OR'd with `STREAMING_*`; `sampling_lib.c` only calls
    // `advertiser_set_status_flag_*_enabled` from its non-streaming
    // branch) — a stream-only source must read as disabled here.
    pub fn accelerometer_batch_enabled(&self) -> bool {
        self.accelerometer.batch
    }
    pub fn accelerometer_interrupt_batch_enabled(&self) -> bool {
        self.accelerometer_interrupt.batch
    }
    pub fn battery_batch_enabled(&self) -> bool {
        self.battery.batch
    }
    pub fn microphone_batch_enabled(&self) -> bool {
        self.microphone.batch
    }
    pub fn scan_batch_enabled(&self) -> bool {
        self.scan.batch
    }

    // request::RequestEngine's streaming sub-protocol needs to know which
    // *stream* (as opposed to batch) bits are set, since it keeps
    // re-scheduling "while any stream bit is set" (`spec.md` §4.8)
    // independent of whether that source's batch half is also running.
    pub fn accelerometer_stream_enabled(&self) -> bool {
        self.accelerometer.stream
    }
    pub fn accelerometer_interrupt_stream_enabled(&self) -> bool {
        self.accelerometer_interrupt.stream
    }
    pub fn battery_stream_enabled(&self) -> bool {
        self.battery.stream
    }
    pub fn microphone_stream_enabled(&self) -> bool {
        self.microphone.stream
    }
    pub fn scan_stream_enabled(&self) -> bool {
        self.scan.stream
    }

    pub fn latest_battery_voltage(&self) -> f32 {
        self.latest_battery.voltage
    }

    // ---------------------------------------------------- accelerometer --

    fn open_accel_chunk(&self, timestamp: Timestamp) {
        let slot = self.accel_chunk_fifo.write_open();
        slot.timestamp = timestamp;
        slot.data.clear();
    }

    pub fn start_accelerometer_batch(
        &mut self,
        timestamp: Timestamp,
        operating_mode: u8,
        full_scale: u8,
        datarate: u16,
    ) -> Result<()> {
        if !self.accelerometer.enabled() {
            self.accel_driver.configure(operating_mode, full_scale, datarate)?;
        }
        self.accelerometer.batch = true;
        self.open_accel_chunk(timestamp);
        Ok(())
    }

    pub fn start_accelerometer_stream(
        &mut self,
        operating_mode: u8,
        full_scale: u8,
        datarate: u16,
    ) -> Result<()> {
        if !self.accelerometer.enabled() {
            self.accel_driver.configure(operating_mode, full_scale, datarate)?;
        }
        self.accelerometer.stream = true;
        Ok(())
    }

    pub fn stop_accelerometer_batch(&mut self) {
        self.accelerometer.batch = false;
    }

    pub fn stop_accelerometer_stream(&mut self) {
        self.accelerometer.stream = false;
    }

    /// Drains the sensor's hardware FIFO at the configured
    /// `fifo_sampling_period_ms` cadence, routing samples to whichever
    /// modes are active.
    pub fn on_accelerometer_fifo_timer(&mut self, timestamp: Timestamp) {
        let mut buf = [[0i16; 3]; 32];
        let n = self.accel_driver.drain_fifo(&mut buf);
        for raw in &buf[..n] {
            if self.accelerometer.stream {
                let _ = self.accel_stream.push(AccelerometerRawData { xyz: *raw });
            }
            if self.accelerometer.batch {
                let magnitude = (raw[0].unsigned_abs() as u32
                    + raw[1].unsigned_abs() as u32
                    + raw[2].unsigned_abs() as u32)
                    .min(u16::MAX as u32) as u16;
                let slot = self.accel_chunk_fifo.write_open();
                if slot.data.len() >= ACCELEROMETER_CHUNK_DATA_SIZE {
                    self.accel_chunk_fifo.write_close();
                    self.open_accel_chunk(timestamp);
                    let slot = self.accel_chunk_fifo.write_open();
                    let _ = slot.data.push(AccelerometerData { magnitude_mg: magnitude });
                } else {
                    let _ = slot.data.push(AccelerometerData { magnitude_mg: magnitude });
                }
            }
        }
    }

    pub fn poll_accelerometer_chunk(&self) -> Option<AccelerometerChunk> {
        let chunk = self.accel_chunk_fifo.read_open().ok()?.clone();
        self.accel_chunk_fifo.read_close();
        Some(chunk)
    }

    // ------------------------------------------------ accelerometer interrupt --

    pub fn start_accelerometer_interrupt_batch(
        &mut self,
        threshold_mg: u16,
        minimal_duration_ms: u16,
        ignore_duration_ms: u32,
    ) -> Result<()> {
        if !self.accelerometer_interrupt.enabled() {
            self.accel_driver.configure_motion_interrupt(threshold_mg, minimal_duration_ms)?;
        }
        self.accelerometer_interrupt.batch = true;
        self.accel_interrupt_ignore_duration_ms = ignore_duration_ms;
        Ok(())
    }

    pub fn start_accelerometer_interrupt_stream(
        &mut self,
        threshold_mg: u16,
        minimal_duration_ms: u16,
        ignore_duration_ms: u32,
    ) -> Result<()> {
        if !self.accelerometer_interrupt.enabled() {
            self.accel_driver.configure_motion_interrupt(threshold_mg, minimal_duration_ms)?;
        }
        self.accelerometer_interrupt.stream = true;
        self.accel_interrupt_ignore_duration_ms = ignore_duration_ms;
        Ok(())
    }

    pub fn stop_accelerometer_interrupt_batch(&mut self) {
        self.accelerometer_interrupt.batch = false;
    }

    pub fn stop_accelerometer_interrupt_stream(&mut self) {
        self.accelerometer_interrupt.stream = false;
    }

    /// The ignore-window duration the caller should arm a one-shot timeout
    /// for after each fired interrupt, before calling
    /// [`Self::rearm_accelerometer_interrupt`].
    pub fn accelerometer_interrupt_ignore_duration_ms(&self) -> u32 {
        self.accel_interrupt_ignore_duration_ms
    }

    pub fn on_motion_interrupt(&mut self, timestamp: Timestamp) {
        if self.accelerometer_interrupt.batch {
            let slot = self.accel_interrupt_chunk_fifo.write_open();
            slot.timestamp = timestamp;
            self.accel_interrupt_chunk_fifo.write_close();
        }
        if self.accelerometer_interrupt.stream {
            let _ = self.accel_interrupt_stream.push(timestamp);
        }
    }

    pub fn rearm_accelerometer_interrupt(&mut self) -> Result<()> {
        self.accel_driver.rearm_motion_interrupt()
    }

    pub fn poll_accelerometer_interrupt_chunk(&self) -> Option<AccelerometerInterruptChunk> {
        let chunk = *self.accel_interrupt_chunk_fifo.read_open().ok()?;
        self.accel_interrupt_chunk_fifo.read_close();
        Some(chunk)
    }

    // -------------------------------------------------------------- battery --

    pub fn start_battery_batch(&mut self, timestamp: Timestamp) {
        self.battery.batch = true;
        self.open_battery_chunk(timestamp);
    }

    pub fn start_battery_stream(&mut self) {
        self.battery.stream = true;
    }

    pub fn stop_battery_batch(&mut self) {
        self.battery.batch = false;
    }

    pub fn stop_battery_stream(&mut self) {
        self.battery.stream = false;
    }

    fn open_battery_chunk(&self, timestamp: Timestamp) {
        let slot = self.battery_chunk_fifo.write_open();
        slot.timestamp = timestamp;
    }

    pub fn on_battery_timer(&mut self, timestamp: Timestamp) {
        let voltage = self.battery_driver.read_voltage();
        self.latest_battery = BatteryData { voltage };
        if self.battery.batch {
            let slot = self.battery_chunk_fifo.write_open();
            slot.timestamp = timestamp;
            slot.battery = self.latest_battery;
            self.battery_chunk_fifo.write_close();
            self.open_battery_chunk(timestamp);
        }
        if self.battery.stream {
            let _ = self.battery_stream.push(self.latest_battery);
        }
    }

    pub fn poll_battery_chunk(&self) -> Option<BatteryChunk> {
        let chunk = *self.battery_chunk_fifo.read_open().ok()?;
        self.battery_chunk_fifo.read_close();
        Some(chunk)
    }

    // ------------------------------------------------------------ microphone --

    fn open_microphone_chunk(&self, timestamp: Timestamp) {
        let slot = self.microphone_chunk_fifo.write_open();
        slot.timestamp = timestamp;
        slot.sample_period_ms = self.mic_sample_period_ms;
        slot.data.clear();
    }

    pub fn start_microphone_batch(&mut self, timestamp: Timestamp, period_ms: u32) {
        self.microphone.batch = true;
        self.mic_sample_period_ms = period_ms.min(u16::MAX as u32) as u16;
        self.mic_accum_sum = 0;
        self.mic_accum_count = 0;
        self.open_microphone_chunk(timestamp);
    }

    pub fn start_microphone_stream(&mut self, period_ms: u32) {
        self.microphone.stream = true;
        self.mic_sample_period_ms = period_ms.min(u16::MAX as u32) as u16;
    }

    pub fn stop_microphone_batch(&mut self) {
        self.microphone.batch = false;
    }

    pub fn stop_microphone_stream(&mut self) {
        self.microphone.stream = false;
    }

    /// Inner-timer tick (`spec.md` §4.6/§1's `MICROPHONE_INNER_PERIOD_MS`
    /// cadence): accumulates one raw ADC read toward the current outer
    /// period's average.
    pub fn on_microphone_inner_timer(&mut self) {
        let sample = self.mic_driver.sample();
        self.mic_accum_sum += sample as u32;
        self.mic_accum_count += 1;
    }

    /// Outer-timer tick: finalizes the accumulator into one sample and
    /// resets it for the next period.
    pub fn on_microphone_outer_timer(&mut self, timestamp: Timestamp) {
        if self.mic_accum_count < MICROPHONE_MIN_INNER_SAMPLES {
            warn!("microphone: only {} inner samples this period", self.mic_accum_count);
        }
        let value = if self.mic_accum_count == 0 {
            0
        } else {
            (self.mic_accum_sum / self.mic_accum_count).min(u8::MAX as u32) as u8
        };
        self.mic_accum_sum = 0;
        self.mic_accum_count = 0;
        let sample = MicrophoneData { value };

        if self.microphone.batch {
            let slot = self.microphone_chunk_fifo.write_open();
            if slot.data.len() >= MICROPHONE_CHUNK_DATA_SIZE {
                self.microphone_chunk_fifo.write_close();
                self.open_microphone_chunk(timestamp);
                let slot = self.microphone_chunk_fifo.write_open();
                let _ = slot.data.push(sample);
            } else {
                let _ = slot.data.push(sample);
            }
        }
        if self.microphone.stream {
            let _ = self.microphone_stream.push(sample);
        }
    }

    pub fn poll_microphone_chunk(&self) -> Option<MicrophoneChunk> {
        let chunk = self.microphone_chunk_fifo.read_open().ok()?.clone();
        self.microphone_chunk_fifo.read_close();
        Some(chunk)
    }

    // ------------------------------------------------------------------ scan --

    pub fn start_scan_batch(&mut self, config: ScanConfig) {
        self.scan.batch = true;
        self.scan_config = Some(config);
    }

    pub fn start_scan_stream(&mut self, config: ScanConfig) {
        self.scan.stream = true;
        self.scan_config = Some(config);
    }

    pub fn stop_scan_batch(&mut self) {
        self.scan.batch = false;
        if !self.scan.enabled() {
            let _ = self.scan_driver.stop();
            self.scan_cycle_open = false;
        }
    }

    pub fn stop_scan_stream(&mut self) {
        self.scan.stream = false;
        if !self.scan.enabled() {
            let _ = self.scan_driver.stop();
            self.scan_cycle_open = false;
        }
    }

    /// Period timer: begins one scan cycle (`spec.md` §4.6's `period_s`).
    pub fn on_scan_period_timer(&mut self, timestamp: Timestamp) -> Result<()> {
        let config = match self.scan_config {
            Some(c) => c,
            None => return Ok(()),
        };
        self.scan_driver.configure(config.interval_ms, config.window_ms)?;
        self.scan_driver.start()?;
        self.scan_accum.reset(timestamp);
        self.scan_cycle_open = true;
        Ok(())
    }

    /// Polls the radio driver for newly-received advertising reports,
    /// filtering by protocol recognition, minimum rssi, and this badge's
    /// own group, and folding survivors into the open scan cycle.
    pub fn poll_scan_reports(&mut self) {
        if !self.scan_cycle_open {
            return;
        }
        let config = match self.scan_config {
            Some(c) => c,
            None => return,
        };
        let mut buf = [AdvertisingReport {
            peer_id: 0,
            group: 0,
            rssi: 0,
            is_known_protocol: false,
        }; 16];
        loop {
            let n = self.scan_driver.drain_reports(&mut buf);
            if n == 0 {
                break;
            }
            for report in &buf[..n] {
                if !report.is_known_protocol || report.rssi < SCANNER_MINIMUM_RSSI {
                    continue;
                }
                if config.own_group != SCAN_NO_GROUP_FILTER && report.group != config.own_group {
                    continue;
                }
                if self.scan.stream {
                    let _ = self.scan_stream.push(ScanDevice {
                        id: report.peer_id,
                        rssi: report.rssi,
                    });
                }
                self.scan_accum.observe(report.peer_id, report.rssi, config.aggregation);
            }
            if n < buf.len() {
                break;
            }
        }
    }

    /// Duration timer: ends the open scan cycle, sorts/truncates, and
    /// closes one [`ScanChunk`] if batch mode is active.
    pub fn on_scan_duration_timer(&mut self) {
        let aggregation = self
            .scan_config
            .map(|c| c.aggregation)
            .unwrap_or(Aggregation::Max);
        let _ = self.scan_driver.stop();
        self.scan_cycle_open = false;

        if !self.scan.batch {
            return;
        }
        let mut raw = self.scan_accum.finalize(aggregation);
        let sorted = sort_and_truncate_scan(&mut raw);
        let slot = self.scan_chunk_fifo.write_open();
        slot.timestamp = self.scan_accum.timestamp;
        slot.data = sorted;
        self.scan_chunk_fifo.write_close();
    }

    pub fn poll_scan_chunk(&self) -> Option<ScanChunk> {
        let chunk = self.scan_chunk_fifo.read_open().ok()?.clone();
        self.scan_chunk_fifo.read_close();
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAccel {
        fifo: HVec<[i16; 3], 8>,
        configured: bool,
    }
    impl Accelerometer for FakeAccel {
        fn configure(&mut self, _om: u8, _fs: u8, _dr: u16) -> Result<()> {
            self.configured = true;
            Ok(())
        }
        fn drain_fifo(&mut self, out: &mut [[i16; 3]]) -> usize {
            let n = self.fifo.len().min(out.len());
            for i in 0..n {
                out[i] = self.fifo[i];
            }
            let mut remaining: HVec<[i16; 3], 8> = HVec::new();
            for v in self.fifo.iter().skip(n) {
                let _ = remaining.push(*v);
            }
            self.fifo = remaining;
            n
        }
        fn configure_motion_interrupt(&mut self, _t: u16, _d: u16) -> Result<()> {
            Ok(())
        }
        fn rearm_motion_interrupt(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeMic(u16);
    impl MicrophoneAdc for FakeMic {
        fn sample(&mut self) -> u16 {
            self.0
        }
    }

    struct FakeBattery(f32);
    impl BatteryAdc for FakeBattery {
        fn read_voltage(&mut self) -> f32 {
            self.0
        }
    }

    struct FakeScanner {
        reports: HVec<AdvertisingReport, 64>,
    }
    impl BleScanner for FakeScanner {
        fn configure(&mut self, _i: u16, _w: u16) -> Result<()> {
            Ok(())
        }
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
        fn drain_reports(&mut self, out: &mut [AdvertisingReport]) -> usize {
            let n = self.reports.len().min(out.len());
            for i in 0..n {
                out[i] = self.reports[i];
            }
            let mut remaining: HVec<AdvertisingReport, 64> = HVec::new();
            for r in self.reports.iter().skip(n) {
                let _ = remaining.push(*r);
            }
            self.reports = remaining;
            n
        }
    }

    fn fixture() -> SamplingCore<FakeAccel, FakeMic, FakeBattery, FakeScanner> {
        SamplingCore::new(
            FakeAccel { fifo: HVec::new(), configured: false },
            FakeMic(100),
            FakeBattery(3.7),
            FakeScanner { reports: HVec::new() },
        )
    }

    fn ts(seconds: u32) -> Timestamp {
        Timestamp { seconds, ms: 0 }
    }

    #[test]
    fn battery_batch_closes_one_sample_per_tick() {
        let mut s = fixture();
        s.start_battery_batch(ts(0));
        s.on_battery_timer(ts(1));
        let chunk = s.poll_battery_chunk().unwrap();
        assert_eq!(chunk.timestamp, ts(0));
        assert_eq!(chunk.battery.voltage, 3.7);
        // A fresh chunk is already open for the next sample.
        assert!(s.poll_battery_chunk().is_none());
    }

    #[test]
    fn accelerometer_batch_accumulates_magnitude_and_closes_on_full() {
        let mut s = fixture();
        s.start_accelerometer_batch(ts(0), 0, 0, 100).unwrap();
        assert!(s.accel_driver.configured);
        let mut remaining = ACCELEROMETER_CHUNK_DATA_SIZE;
        while remaining > 0 {
            let batch = remaining.min(8);
            for _ in 0..batch {
                s.accel_driver.fifo.push([10, -20, 30]).unwrap();
            }
            s.on_accelerometer_fifo_timer(ts(1));
            remaining -= batch;
        }
        let chunk = s.poll_accelerometer_chunk().unwrap();
        assert_eq!(chunk.data.len(), ACCELEROMETER_CHUNK_DATA_SIZE);
        assert_eq!(chunk.data[0].magnitude_mg, 60);
    }

    #[test]
    fn microphone_warns_below_min_inner_samples_but_still_emits() {
        let mut s = fixture();
        s.start_microphone_batch(ts(0), 1000);
        s.on_microphone_inner_timer();
        s.on_microphone_outer_timer(ts(1));
        let chunk = s.poll_microphone_chunk().unwrap();
        assert_eq!(chunk.data.len(), 1);
        assert_eq!(chunk.data[0].value, 100);
    }

    #[test]
    fn scan_cycle_aggregates_by_max_rssi_and_filters_group() {
        let mut s = fixture();
        let config = ScanConfig {
            interval_ms: 100,
            window_ms: 50,
            duration_s: 1,
            period_s: 10,
            aggregation: Aggregation::Max,
            own_group: 1,
        };
        s.start_scan_batch(config);
        s.on_scan_period_timer(ts(0)).unwrap();
        s.scan_driver
            .reports
            .push(AdvertisingReport { peer_id: 5, group: 1, rssi: -60, is_known_protocol: true })
            .unwrap();
        s.scan_driver
            .reports
            .push(AdvertisingReport { peer_id: 5, group: 1, rssi: -40, is_known_protocol: true })
            .unwrap();
        // Wrong group: dropped.
        s.scan_driver
            .reports
            .push(AdvertisingReport { peer_id: 9, group: 2, rssi: -30, is_known_protocol: true })
            .unwrap();
        s.poll_scan_reports();
        s.on_scan_duration_timer();
        let chunk = s.poll_scan_chunk().unwrap();
        assert_eq!(chunk.data.len(), 1);
        assert_eq!(chunk.data[0].device.id, 5);
        assert_eq!(chunk.data[0].device.rssi, -40);
        assert_eq!(chunk.data[0].count, 2);
    }

    #[test]
    fn scan_sort_prioritizes_top_four_beacons_then_sorts_the_rest_together() {
        let mut entries: HVec<ScanResultData, SCAN_SAMPLING_CHUNK_DATA_SIZE> = HVec::new();
        let beacon_rssi = [-40i8, -50, -60, -70, -80, -90];
        for (i, rssi) in beacon_rssi.iter().enumerate() {
            entries
                .push(ScanResultData {
                    device: ScanDevice { id: SCAN_BEACON_ID_THRESHOLD + i as u16, rssi: *rssi },
                    count: 1,
                })
                .unwrap();
        }
        for i in 0..24u16 {
            let rssi = -45 - (i as i16 * 65 / 23);
            entries
                .push(ScanResultData {
                    device: ScanDevice { id: i, rssi: rssi as i8 },
                    count: 1,
                })
                .unwrap();
        }
        let sorted = sort_and_truncate_scan(&mut entries);
        assert_eq!(sorted.len(), SCAN_CHUNK_DATA_SIZE);
        // Top 4 beacons, strongest first.
        for i in 0..4 {
            assert!(is_beacon(&sorted[i]));
        }
        assert_eq!(sorted[0].device.rssi, -40);
        assert_eq!(sorted[1].device.rssi, -50);
        assert_eq!(sorted[2].device.rssi, -60);
        assert_eq!(sorted[3].device.rssi, -70);
        // From position 4 on, rssi is monotonically non-increasing across
        // both remaining beacons and badges.
        for i in 4..sorted.len() - 1 {
            assert!(sorted[i].device.rssi >= sorted[i + 1].device.rssi);
        }
    }

    #[test]
    fn scan_sort_leaves_trailing_non_prioritized_beacons_unsorted_against_badges() {
        // With more than SCAN_PRIORITIZED_BEACONS (4) beacons, the second
        // sort only covers `len - num_beacons` entries starting at `k`
        // (`processing_lib.c:171`'s `qsort(&scan_result_data[prioritized_beacons],
        // scan_result_data_count - num_beacons, ...)`), not everything past
        // `k`. The last `num_beacons - k` array slots — here the last 2 of
        // 6 beacons — are excluded from that sort, so a strong badge
        // pushed after them stays stuck behind weaker entries instead of
        // floating up by rssi.
        let mut entries: HVec<ScanResultData, SCAN_SAMPLING_CHUNK_DATA_SIZE> = HVec::new();
        let beacon_rssi = [-40i8, -50, -60, -70, -80, -90];
        for (i, rssi) in beacon_rssi.iter().enumerate() {
            entries
                .push(ScanResultData {
                    device: ScanDevice { id: SCAN_BEACON_ID_THRESHOLD + i as u16, rssi: *rssi },
                    count: 1,
                })
                .unwrap();
        }
        for (i, rssi) in [-100i8, -95, -20].iter().enumerate() {
            entries
                .push(ScanResultData { device: ScanDevice { id: i as u16, rssi: *rssi }, count: 1 })
                .unwrap();
        }
        let sorted = sort_and_truncate_scan(&mut entries);
        assert_eq!(sorted.len(), 9);
        // Top 4 beacons pinned, strongest first.
        assert_eq!(sorted[0].device.rssi, -40);
        assert_eq!(sorted[1].device.rssi, -50);
        assert_eq!(sorted[2].device.rssi, -60);
        assert_eq!(sorted[3].device.rssi, -70);
        // The sorted range [k, k + (len - num_beacons)) = [4, 7) covers the
        // 2 remaining beacons plus the weakest badge, already in order.
        assert_eq!(sorted[4].device.rssi, -80);
        assert_eq!(sorted[5].device.rssi, -90);
        assert_eq!(sorted[6].device.rssi, -100);
        // The excluded tail (indices 7, 8) keeps its pre-sort order even
        // though the badge at index 8 (-20 rssi) is the strongest entry
        // in the whole cycle besides the pinned beacons.
        assert_eq!(sorted[7].device.rssi, -95);
        assert_eq!(sorted[8].device.rssi, -20);
    }
}
