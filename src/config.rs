//! Compile-time configuration constants.
//!
//! The badge has no runtime configuration surface (no CLI, no env, no config
//! file — `spec.md` §6): every tunable lives here, the way the teacher
//! hardcodes `XTAL_FREQ_HZ`/`BASE_CLOCK`/`TABLE_SIZE` at the top of
//! `main.rs`. Values are grounded in the original firmware's `#define`s
//! where one exists.

/// Nominal hardware tick counter frequency (Hz). The original uses a
/// 32768 Hz RTC-derived app-timer tick.
pub const NOMINAL_TICK_HZ: f32 = 32768.0;

/// Width of the free-running hardware tick counter, in bits. Ticks wrap
/// at `1 << HW_COUNTER_BITS`; the tick clock absorbs that wrap into a
/// 64-bit accumulator (`clock::TickClock`).
pub const HW_COUNTER_BITS: u32 = 24;
pub const HW_COUNTER_MASK: u32 = (1u32 << HW_COUNTER_BITS) - 1;

/// Oscillator tolerance band used to clamp the clock-model slope.
pub const CLOCK_FREQ_DEVIATION_HZ: f32 = 50.0;

pub const MIN_MS_PER_TICK: f32 = 1000.0 / (NOMINAL_TICK_HZ + CLOCK_FREQ_DEVIATION_HZ);
pub const MAX_MS_PER_TICK: f32 = 1000.0 / (NOMINAL_TICK_HZ - CLOCK_FREQ_DEVIATION_HZ);
pub const NOMINAL_MS_PER_TICK: f32 = 1000.0 / NOMINAL_TICK_HZ;

/// EMA coefficient bounds for clock-model slope blending (`clock::ClockModel::sync`).
pub const CLOCK_SYNC_MAX_ALPHA: f32 = 0.3;
pub const CLOCK_SYNC_SLOPE_ALPHA: f32 = CLOCK_SYNC_MAX_ALPHA / 120_000.0;

/// Maximum number of independent logical timeouts multiplexed over one
/// hardware alarm.
pub const MAX_TIMEOUTS: usize = 20;
/// Alarm period cap, matching the original's ~100 s ceiling.
pub const MAX_ALARM_MS: u32 = 100_000;

/// Chunk capacities (`spec.md` §3), all pulled from `chunk_messages.h`.
pub const ACCELEROMETER_CHUNK_DATA_SIZE: usize = 100;
pub const MICROPHONE_CHUNK_DATA_SIZE: usize = 114;
pub const SCAN_CHUNK_DATA_SIZE: usize = 29;
pub const SCAN_SAMPLING_CHUNK_DATA_SIZE: usize = 255;

/// Scan-sort policy constants (`processing_lib.h`).
pub const SCAN_BEACON_ID_THRESHOLD: u16 = 16000;
pub const SCAN_PRIORITIZED_BEACONS: usize = 4;
/// Sentinel group-filter value meaning "no filter" (`group_filter == 0xFF`).
pub const SCAN_NO_GROUP_FILTER: u8 = 0xFF;
/// Advertising reports weaker than this (dBm) are dropped before
/// classification.
pub const SCANNER_MINIMUM_RSSI: i8 = -110;

/// Per-stream aggregated-response sample caps (`protocol_messages_02v1.h`).
pub const PROTOCOL_ACCELEROMETER_STREAM_SIZE: usize = 10;
pub const PROTOCOL_ACCELEROMETER_INTERRUPT_STREAM_SIZE: usize = 10;
pub const PROTOCOL_BATTERY_STREAM_SIZE: usize = 10;
pub const PROTOCOL_MICROPHONE_STREAM_SIZE: usize = 10;
pub const PROTOCOL_SCAN_STREAM_SIZE: usize = 10;

/// Chunk-FIFO depths (number of *elements*; the ring itself allocates one
/// extra slot per `chunk_fifo::ChunkFifo`'s invariant).
pub const ACCELEROMETER_CHUNK_FIFO_DEPTH: usize = 2;
pub const ACCELEROMETER_INTERRUPT_CHUNK_FIFO_DEPTH: usize = 2;
pub const BATTERY_CHUNK_FIFO_DEPTH: usize = 2;
pub const MICROPHONE_CHUNK_FIFO_DEPTH: usize = 2;
pub const SCAN_CHUNK_FIFO_DEPTH: usize = 2;

/// Stream ring-buffer depths (raw per-sample queues feeding the streaming
/// sub-protocol).
pub const ACCELEROMETER_STREAM_FIFO_DEPTH: usize = 32;
pub const ACCELEROMETER_INTERRUPT_STREAM_FIFO_DEPTH: usize = 8;
pub const BATTERY_STREAM_FIFO_DEPTH: usize = 8;
pub const MICROPHONE_STREAM_FIFO_DEPTH: usize = 32;
pub const SCAN_STREAM_FIFO_DEPTH: usize = 64;

/// GATT link MTU chunking size (`spec.md` §4.9/§6).
pub const LINK_MTU_BYTES: usize = 20;

/// Receive-notification queue depth (power of two, matches
/// `RECEIVE_NOTIFICATION_FIFO_SIZE` in `request_handler_lib_02v1.c`).
pub const RECEIVE_NOTIFICATION_FIFO_DEPTH: usize = 64;

/// Request/response engine timing (`request_handler_lib_02v1.c`).
pub const AWAIT_DATA_TIMEOUT_MS: u32 = 1000;
pub const TRANSMIT_DATA_TIMEOUT_MS: u32 = 100;
pub const REQUEST_SERIALIZED_BUFFER_SIZE: usize = 512;
pub const RESPONSE_MAX_TRANSMIT_RETRIES: u32 = 50;

/// `sender::Sender`'s TX/RX byte-FIFO capacity, sized to hold one fully
/// serialized request/response (`sender_lib.c`).
pub const SENDER_TX_RING_BYTES: usize = REQUEST_SERIALIZED_BUFFER_SIZE;
pub const SENDER_RX_RING_BYTES: usize = REQUEST_SERIALIZED_BUFFER_SIZE;

/// Microphone aggregation-window inner sample cadence (`1000/700` ms,
/// ~7.5% duty cycle) and the "too few inner samples" warning floor.
pub const MICROPHONE_INNER_PERIOD_MS: u32 = 1000 / 700;
pub const MICROPHONE_MIN_INNER_SAMPLES: u32 = 5;

/// Advertising identity payload (`spec.md` §6).
pub const ADVERTISING_COMPANY_ID: u16 = 0xFF00;
pub const ADVERTISING_PAYLOAD_LEN: usize = 11;
pub const ADVERTISING_DEVICE_NAME: &str = "HDBDG";
pub const ADVERTISING_INTERVAL_MS: u32 = 200;
pub const ADVERTISING_TIMEOUT_S: u32 = 6;
pub const ADVERTISING_DEFAULT_GROUP: u8 = 0;

/// Maximum number of partitions registered with the filesystem at boot
/// (badge-assignment, battery, microphone, scan, accel-interrupt, accel).
pub const MAX_PARTITIONS: usize = 6;

/// Largest encoded element payload the filesystem ever stores (the
/// accelerometer chunk, at `6 + 1 + 100*2` bytes, is the biggest), rounded
/// up. Bounds the stack buffer `filesystem::Filesystem` uses to splice an
/// element header and payload into one `BlockDevice::store` call.
pub const MAX_ELEMENT_PAYLOAD_BYTES: usize = 256;
/// Largest possible on-device element header (dynamic partition, with CRC):
/// record_id(2) + cur_len(2) + prev_xor_cur(2) + crc(2).
pub const MAX_ELEMENT_HEADER_BYTES: usize = 8;

/// Depth of `core::Core`'s cooperative task queue (`scheduler::Scheduler`).
/// A handful of continuation slots is plenty: at most one data pull and one
/// stream emitter are ever in flight at a time (`spec.md` §4.8/§9).
pub const SCHEDULER_QUEUE_DEPTH: usize = 4;
