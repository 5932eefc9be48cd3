//! Wire/storage record types (`spec.md` §3, §4.5, §6), grounded field-for-
//! field in `common_messages.h`, `chunk_messages.h`, `stream_messages.h`
//! and `protocol_messages_02v1.h`. Every scalar here is endianness-neutral;
//! callers pick [`Endian::Big`](crate::codec::Endian) for the wire and
//! [`Endian::Little`](crate::codec::Endian) for storage (`spec.md` §4.5).

use crate::codec::{Codec, Endian, Reader, Writer};
use crate::config::{
    ACCELEROMETER_CHUNK_DATA_SIZE, MICROPHONE_CHUNK_DATA_SIZE,
    PROTOCOL_ACCELEROMETER_INTERRUPT_STREAM_SIZE, PROTOCOL_ACCELEROMETER_STREAM_SIZE,
    PROTOCOL_BATTERY_STREAM_SIZE, PROTOCOL_MICROPHONE_STREAM_SIZE, PROTOCOL_SCAN_STREAM_SIZE,
    SCAN_CHUNK_DATA_SIZE, SCAN_SAMPLING_CHUNK_DATA_SIZE,
};
use crate::error::{Error, Result};
use heapless::Vec as HVec;

// ---------------------------------------------------------------- common --

/// A wall-clock timestamp (`common_messages.h`'s `Timestamp`): `0 <= ms <
/// 1000` is an invariant of the clock model (`spec.md` §3), not re-checked
/// here — the codec only moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub seconds: u32,
    pub ms: u16,
}

impl Codec for Timestamp {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        w.put_u32(self.seconds, endian)?;
        w.put_u16(self.ms, endian)
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        Ok(Self {
            seconds: r.get_u32(endian)?,
            ms: r.get_u16(endian)?,
        })
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.seconds, self.ms).cmp(&(other.seconds, other.ms))
    }
}

/// `common_messages.h`'s `BadgeAssignement` (device id + scan group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BadgeAssignment {
    pub id: u16,
    pub group: u8,
}

impl Codec for BadgeAssignment {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        w.put_u16(self.id, endian)?;
        w.put_u8(self.group)
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        Ok(Self {
            id: r.get_u16(endian)?,
            group: r.get_u8()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BatteryData {
    pub voltage: f32,
}

impl Codec for BatteryData {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        w.put_f32(self.voltage, endian)
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        Ok(Self {
            voltage: r.get_f32(endian)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MicrophoneData {
    pub value: u8,
}

impl Codec for MicrophoneData {
    fn encode(&self, w: &mut Writer, _endian: Endian) -> Result<()> {
        w.put_u8(self.value)
    }

    fn decode(r: &mut Reader, _endian: Endian) -> Result<Self> {
        Ok(Self { value: r.get_u8()? })
    }
}

/// An observed peer (`common_messages.h`'s `ScanDevice`): protocol id plus
/// signal strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanDevice {
    pub id: u16,
    pub rssi: i8,
}

impl Codec for ScanDevice {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        w.put_u16(self.id, endian)?;
        w.put_i8(self.rssi)
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        Ok(Self {
            id: r.get_u16(endian)?,
            rssi: r.get_i8()?,
        })
    }
}

/// One aggregated scan-chunk entry: a device plus a report count
/// (`common_messages.h`'s `ScanResultData`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanResultData {
    pub device: ScanDevice,
    pub count: u8,
}

impl Codec for ScanResultData {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        self.device.encode(w, endian)?;
        w.put_u8(self.count)
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        Ok(Self {
            device: ScanDevice::decode(r, endian)?,
            count: r.get_u8()?,
        })
    }
}

/// A batch-mode accelerometer magnitude sample: `|x|+|y|+|z|` in mg
/// (`common_messages.h`'s `AccelerometerData`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerometerData {
    pub magnitude_mg: u16,
}

impl Codec for AccelerometerData {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        w.put_u16(self.magnitude_mg, endian)
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        Ok(Self {
            magnitude_mg: r.get_u16(endian)?,
        })
    }
}

/// A stream-mode raw accelerometer triple (`common_messages.h`'s
/// `AccelerometerRawData`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerometerRawData {
    pub xyz: [i16; 3],
}

impl Codec for AccelerometerRawData {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        for v in self.xyz {
            w.put_i16(v, endian)?;
        }
        Ok(())
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        let mut xyz = [0i16; 3];
        for v in xyz.iter_mut() {
            *v = r.get_i16(endian)?;
        }
        Ok(Self { xyz })
    }
}

// ----------------------------------------------------------------- chunks --

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BatteryChunk {
    pub timestamp: Timestamp,
    pub battery: BatteryData,
}

impl Codec for BatteryChunk {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        self.timestamp.encode(w, endian)?;
        self.battery.encode(w, endian)
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        Ok(Self {
            timestamp: Timestamp::decode(r, endian)?,
            battery: BatteryData::decode(r, endian)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MicrophoneChunk {
    pub timestamp: Timestamp,
    pub sample_period_ms: u16,
    pub data: HVec<MicrophoneData, MICROPHONE_CHUNK_DATA_SIZE>,
}

impl Default for MicrophoneChunk {
    fn default() -> Self {
        Self {
            timestamp: Timestamp::default(),
            sample_period_ms: 0,
            data: HVec::new(),
        }
    }
}

impl Codec for MicrophoneChunk {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        self.timestamp.encode(w, endian)?;
        w.put_u16(self.sample_period_ms, endian)?;
        w.put_repeated(&self.data, endian, |w, v, e| v.encode(w, e))
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        Ok(Self {
            timestamp: Timestamp::decode(r, endian)?,
            sample_period_ms: r.get_u16(endian)?,
            data: r.get_repeated(endian, |r, e| MicrophoneData::decode(r, e))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSamplingChunk {
    pub timestamp: Timestamp,
    pub data: HVec<ScanResultData, SCAN_SAMPLING_CHUNK_DATA_SIZE>,
}

impl Default for ScanSamplingChunk {
    fn default() -> Self {
        Self {
            timestamp: Timestamp::default(),
            data: HVec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanChunk {
    pub timestamp: Timestamp,
    pub data: HVec<ScanResultData, SCAN_CHUNK_DATA_SIZE>,
}

impl Default for ScanChunk {
    fn default() -> Self {
        Self {
            timestamp: Timestamp::default(),
            data: HVec::new(),
        }
    }
}

impl Codec for ScanChunk {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        self.timestamp.encode(w, endian)?;
        w.put_repeated(&self.data, endian, |w, v, e| v.encode(w, e))
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        Ok(Self {
            timestamp: Timestamp::decode(r, endian)?,
            data: r.get_repeated(endian, |r, e| ScanResultData::decode(r, e))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccelerometerChunk {
    pub timestamp: Timestamp,
    pub data: HVec<AccelerometerData, ACCELEROMETER_CHUNK_DATA_SIZE>,
}

impl Default for AccelerometerChunk {
    fn default() -> Self {
        Self {
            timestamp: Timestamp::default(),
            data: HVec::new(),
        }
    }
}

impl Codec for AccelerometerChunk {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        self.timestamp.encode(w, endian)?;
        w.put_repeated(&self.data, endian, |w, v, e| v.encode(w, e))
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        Ok(Self {
            timestamp: Timestamp::decode(r, endian)?,
            data: r.get_repeated(endian, |r, e| AccelerometerData::decode(r, e))?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerometerInterruptChunk {
    pub timestamp: Timestamp,
}

impl Codec for AccelerometerInterruptChunk {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        self.timestamp.encode(w, endian)
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        Ok(Self {
            timestamp: Timestamp::decode(r, endian)?,
        })
    }
}

// ----------------------------------------------------------------- streams --

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BatteryStream {
    pub battery: BatteryData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MicrophoneStream {
    pub sample: MicrophoneData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanStream {
    pub device: ScanDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerometerStream {
    pub raw: AccelerometerRawData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerometerInterruptStream {
    pub timestamp: Timestamp,
}

macro_rules! stream_codec {
    ($ty:ty, $field:ident, $inner:ty) => {
        impl Codec for $ty {
            fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
                self.$field.encode(w, endian)
            }
            fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
                Ok(Self {
                    $field: <$inner>::decode(r, endian)?,
                })
            }
        }
    };
}

stream_codec!(BatteryStream, battery, BatteryData);
stream_codec!(MicrophoneStream, sample, MicrophoneData);
stream_codec!(ScanStream, device, ScanDevice);
stream_codec!(AccelerometerStream, raw, AccelerometerRawData);
stream_codec!(AccelerometerInterruptStream, timestamp, Timestamp);

// -------------------------------------------------------------- requests --

/// `protocol_messages_02v1.h`'s `StatusRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatusRequest {
    pub timestamp: Timestamp,
    pub badge_assignment: Option<BadgeAssignment>,
}

/// Shared start-request shape for microphone/battery (timestamp + timeout +
/// period).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartPeriodicRequest {
    pub timestamp: Timestamp,
    pub timeout_min: u16,
    pub period_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartScanRequest {
    pub timestamp: Timestamp,
    pub timeout_min: u16,
    pub window_ms: u16,
    pub interval_ms: u16,
    pub duration_s: u16,
    pub period_s: u16,
    pub aggregation_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartAccelerometerRequest {
    pub timestamp: Timestamp,
    pub timeout_min: u16,
    pub operating_mode: u8,
    pub full_scale: u8,
    pub datarate: u16,
    pub fifo_sampling_period_ms: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartAccelerometerInterruptRequest {
    pub timestamp: Timestamp,
    pub timeout_min: u16,
    pub threshold_mg: u16,
    pub minimal_duration_ms: u16,
    pub ignore_duration_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataRequest {
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdentifyRequest {
    pub timeout_s: u16,
}

/// Which sensing source a start/stop/data request names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Microphone,
    Scan,
    Accelerometer,
    AccelerometerInterrupt,
    Battery,
}

/// A decoded request body (`protocol_messages_02v1.h`'s `Request`
/// tagged union, `which_type in 1..=29`). Variant names mirror the
/// original `Request_*_tag` identifiers minus the `_request` suffix noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Request {
    Status(StatusRequest),
    StartMicrophone(StartPeriodicRequest),
    StopMicrophone,
    StartScan(StartScanRequest),
    StopScan,
    StartAccelerometer(StartAccelerometerRequest),
    StopAccelerometer,
    StartAccelerometerInterrupt(StartAccelerometerInterruptRequest),
    StopAccelerometerInterrupt,
    StartBattery(StartPeriodicRequest),
    StopBattery,
    MicrophoneData(DataRequest),
    ScanData(DataRequest),
    AccelerometerData(DataRequest),
    AccelerometerInterruptData(DataRequest),
    BatteryData(DataRequest),
    StartMicrophoneStream(StartPeriodicRequest),
    StopMicrophoneStream,
    StartScanStream(StartScanRequest),
    StopScanStream,
    StartAccelerometerStream(StartAccelerometerRequest),
    StopAccelerometerStream,
    StartAccelerometerInterruptStream(StartAccelerometerInterruptRequest),
    StopAccelerometerInterruptStream,
    StartBatteryStream(StartPeriodicRequest),
    StopBatteryStream,
    Identify(IdentifyRequest),
    Test,
    Restart,
}

fn encode_periodic(w: &mut Writer, endian: Endian, r: &StartPeriodicRequest) -> Result<()> {
    r.timestamp.encode(w, endian)?;
    w.put_u16(r.timeout_min, endian)?;
    w.put_u32(r.period_ms, endian)
}

fn decode_periodic(r: &mut Reader, endian: Endian) -> Result<StartPeriodicRequest> {
    Ok(StartPeriodicRequest {
        timestamp: Timestamp::decode(r, endian)?,
        timeout_min: r.get_u16(endian)?,
        period_ms: r.get_u32(endian)?,
    })
}

fn encode_scan_req(w: &mut Writer, endian: Endian, r: &StartScanRequest) -> Result<()> {
    r.timestamp.encode(w, endian)?;
    w.put_u16(r.timeout_min, endian)?;
    w.put_u16(r.window_ms, endian)?;
    w.put_u16(r.interval_ms, endian)?;
    w.put_u16(r.duration_s, endian)?;
    w.put_u16(r.period_s, endian)?;
    w.put_u8(r.aggregation_type)
}

fn decode_scan_req(r: &mut Reader, endian: Endian) -> Result<StartScanRequest> {
    Ok(StartScanRequest {
        timestamp: Timestamp::decode(r, endian)?,
        timeout_min: r.get_u16(endian)?,
        window_ms: r.get_u16(endian)?,
        interval_ms: r.get_u16(endian)?,
        duration_s: r.get_u16(endian)?,
        period_s: r.get_u16(endian)?,
        aggregation_type: r.get_u8()?,
    })
}

fn encode_accel_req(w: &mut Writer, endian: Endian, r: &StartAccelerometerRequest) -> Result<()> {
    r.timestamp.encode(w, endian)?;
    w.put_u16(r.timeout_min, endian)?;
    w.put_u8(r.operating_mode)?;
    w.put_u8(r.full_scale)?;
    w.put_u16(r.datarate, endian)?;
    w.put_u16(r.fifo_sampling_period_ms, endian)
}

fn decode_accel_req(r: &mut Reader, endian: Endian) -> Result<StartAccelerometerRequest> {
    Ok(StartAccelerometerRequest {
        timestamp: Timestamp::decode(r, endian)?,
        timeout_min: r.get_u16(endian)?,
        operating_mode: r.get_u8()?,
        full_scale: r.get_u8()?,
        datarate: r.get_u16(endian)?,
        fifo_sampling_period_ms: r.get_u16(endian)?,
    })
}

fn encode_accel_int_req(
    w: &mut Writer,
    endian: Endian,
    r: &StartAccelerometerInterruptRequest,
) -> Result<()> {
    r.timestamp.encode(w, endian)?;
    w.put_u16(r.timeout_min, endian)?;
    w.put_u16(r.threshold_mg, endian)?;
    w.put_u16(r.minimal_duration_ms, endian)?;
    w.put_u32(r.ignore_duration_ms, endian)
}

fn decode_accel_int_req(
    r: &mut Reader,
    endian: Endian,
) -> Result<StartAccelerometerInterruptRequest> {
    Ok(StartAccelerometerInterruptRequest {
        timestamp: Timestamp::decode(r, endian)?,
        timeout_min: r.get_u16(endian)?,
        threshold_mg: r.get_u16(endian)?,
        minimal_duration_ms: r.get_u16(endian)?,
        ignore_duration_ms: r.get_u32(endian)?,
    })
}

/// Request tag values (`Request_*_tag` in `protocol_messages_02v1.h`).
pub mod request_tag {
    pub const STATUS: u8 = 1;
    pub const START_MICROPHONE: u8 = 2;
    pub const STOP_MICROPHONE: u8 = 3;
    pub const START_SCAN: u8 = 4;
    pub const STOP_SCAN: u8 = 5;
    pub const START_ACCELEROMETER: u8 = 6;
    pub const STOP_ACCELEROMETER: u8 = 7;
    pub const START_ACCELEROMETER_INTERRUPT: u8 = 8;
    pub const STOP_ACCELEROMETER_INTERRUPT: u8 = 9;
    pub const START_BATTERY: u8 = 10;
    pub const STOP_BATTERY: u8 = 11;
    pub const MICROPHONE_DATA: u8 = 12;
    pub const SCAN_DATA: u8 = 13;
    pub const ACCELEROMETER_DATA: u8 = 14;
    pub const ACCELEROMETER_INTERRUPT_DATA: u8 = 15;
    pub const BATTERY_DATA: u8 = 16;
    pub const START_MICROPHONE_STREAM: u8 = 17;
    pub const STOP_MICROPHONE_STREAM: u8 = 18;
    pub const START_SCAN_STREAM: u8 = 19;
    pub const STOP_SCAN_STREAM: u8 = 20;
    pub const START_ACCELEROMETER_STREAM: u8 = 21;
    pub const STOP_ACCELEROMETER_STREAM: u8 = 22;
    pub const START_ACCELEROMETER_INTERRUPT_STREAM: u8 = 23;
    pub const STOP_ACCELEROMETER_INTERRUPT_STREAM: u8 = 24;
    pub const START_BATTERY_STREAM: u8 = 25;
    pub const STOP_BATTERY_STREAM: u8 = 26;
    pub const IDENTIFY: u8 = 27;
    pub const TEST: u8 = 28;
    pub const RESTART: u8 = 29;
}

impl Codec for Request {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        use request_tag::*;
        match self {
            Request::Status(r) => {
                w.put_u8(STATUS)?;
                r.timestamp.encode(w, endian)?;
                w.put_optional(&r.badge_assignment, endian, |w, v, e| v.encode(w, e))
            }
            Request::StartMicrophone(r) => {
                w.put_u8(START_MICROPHONE)?;
                encode_periodic(w, endian, r)
            }
            Request::StopMicrophone => w.put_u8(STOP_MICROPHONE),
            Request::StartScan(r) => {
                w.put_u8(START_SCAN)?;
                encode_scan_req(w, endian, r)
            }
            Request::StopScan => w.put_u8(STOP_SCAN),
            Request::StartAccelerometer(r) => {
                w.put_u8(START_ACCELEROMETER)?;
                encode_accel_req(w, endian, r)
            }
            Request::StopAccelerometer => w.put_u8(STOP_ACCELEROMETER),
            Request::StartAccelerometerInterrupt(r) => {
                w.put_u8(START_ACCELEROMETER_INTERRUPT)?;
                encode_accel_int_req(w, endian, r)
            }
            Request::StopAccelerometerInterrupt => w.put_u8(STOP_ACCELEROMETER_INTERRUPT),
            Request::StartBattery(r) => {
                w.put_u8(START_BATTERY)?;
                encode_periodic(w, endian, r)
            }
            Request::StopBattery => w.put_u8(STOP_BATTERY),
            Request::MicrophoneData(r) => {
                w.put_u8(MICROPHONE_DATA)?;
                r.timestamp.encode(w, endian)
            }
            Request::ScanData(r) => {
                w.put_u8(SCAN_DATA)?;
                r.timestamp.encode(w, endian)
            }
            Request::AccelerometerData(r) => {
                w.put_u8(ACCELEROMETER_DATA)?;
                r.timestamp.encode(w, endian)
            }
            Request::AccelerometerInterruptData(r) => {
                w.put_u8(ACCELEROMETER_INTERRUPT_DATA)?;
                r.timestamp.encode(w, endian)
            }
            Request::BatteryData(r) => {
                w.put_u8(BATTERY_DATA)?;
                r.timestamp.encode(w, endian)
            }
            Request::StartMicrophoneStream(r) => {
                w.put_u8(START_MICROPHONE_STREAM)?;
                encode_periodic(w, endian, r)
            }
            Request::StopMicrophoneStream => w.put_u8(STOP_MICROPHONE_STREAM),
            Request::StartScanStream(r) => {
                w.put_u8(START_SCAN_STREAM)?;
                encode_scan_req(w, endian, r)
            }
            Request::StopScanStream => w.put_u8(STOP_SCAN_STREAM),
            Request::StartAccelerometerStream(r) => {
                w.put_u8(START_ACCELEROMETER_STREAM)?;
                encode_accel_req(w, endian, r)
            }
            Request::StopAccelerometerStream => w.put_u8(STOP_ACCELEROMETER_STREAM),
            Request::StartAccelerometerInterruptStream(r) => {
                w.put_u8(START_ACCELEROMETER_INTERRUPT_STREAM)?;
                encode_accel_int_req(w, endian, r)
            }
            Request::StopAccelerometerInterruptStream => {
                w.put_u8(STOP_ACCELEROMETER_INTERRUPT_STREAM)
            }
            Request::StartBatteryStream(r) => {
                w.put_u8(START_BATTERY_STREAM)?;
                encode_periodic(w, endian, r)
            }
            Request::StopBatteryStream => w.put_u8(STOP_BATTERY_STREAM),
            Request::Identify(r) => {
                w.put_u8(IDENTIFY)?;
                w.put_u16(r.timeout_s, endian)
            }
            Request::Test => w.put_u8(TEST),
            Request::Restart => w.put_u8(RESTART),
        }
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        use request_tag::*;
        let tag = r.get_u8()?;
        Ok(match tag {
            STATUS => Request::Status(StatusRequest {
                timestamp: Timestamp::decode(r, endian)?,
                badge_assignment: r.get_optional(endian, |r, e| BadgeAssignment::decode(r, e))?,
            }),
            START_MICROPHONE => Request::StartMicrophone(decode_periodic(r, endian)?),
            STOP_MICROPHONE => Request::StopMicrophone,
            START_SCAN => Request::StartScan(decode_scan_req(r, endian)?),
            STOP_SCAN => Request::StopScan,
            START_ACCELEROMETER => Request::StartAccelerometer(decode_accel_req(r, endian)?),
            STOP_ACCELEROMETER => Request::StopAccelerometer,
            START_ACCELEROMETER_INTERRUPT => {
                Request::StartAccelerometerInterrupt(decode_accel_int_req(r, endian)?)
            }
            STOP_ACCELEROMETER_INTERRUPT => Request::StopAccelerometerInterrupt,
            START_BATTERY => Request::StartBattery(decode_periodic(r, endian)?),
            STOP_BATTERY => Request::StopBattery,
            MICROPHONE_DATA => Request::MicrophoneData(DataRequest {
                timestamp: Timestamp::decode(r, endian)?,
            }),
            SCAN_DATA => Request::ScanData(DataRequest {
                timestamp: Timestamp::decode(r, endian)?,
            }),
            ACCELEROMETER_DATA => Request::AccelerometerData(DataRequest {
                timestamp: Timestamp::decode(r, endian)?,
            }),
            ACCELEROMETER_INTERRUPT_DATA => Request::AccelerometerInterruptData(DataRequest {
                timestamp: Timestamp::decode(r, endian)?,
            }),
            BATTERY_DATA => Request::BatteryData(DataRequest {
                timestamp: Timestamp::decode(r, endian)?,
            }),
            START_MICROPHONE_STREAM => Request::StartMicrophoneStream(decode_periodic(r, endian)?),
            STOP_MICROPHONE_STREAM => Request::StopMicrophoneStream,
            START_SCAN_STREAM => Request::StartScanStream(decode_scan_req(r, endian)?),
            STOP_SCAN_STREAM => Request::StopScanStream,
            START_ACCELEROMETER_STREAM => {
                Request::StartAccelerometerStream(decode_accel_req(r, endian)?)
            }
            STOP_ACCELEROMETER_STREAM => Request::StopAccelerometerStream,
            START_ACCELEROMETER_INTERRUPT_STREAM => {
                Request::StartAccelerometerInterruptStream(decode_accel_int_req(r, endian)?)
            }
            STOP_ACCELEROMETER_INTERRUPT_STREAM => Request::StopAccelerometerInterruptStream,
            START_BATTERY_STREAM => Request::StartBatteryStream(decode_periodic(r, endian)?),
            STOP_BATTERY_STREAM => Request::StopBatteryStream,
            IDENTIFY => Request::Identify(IdentifyRequest {
                timeout_s: r.get_u16(endian)?,
            }),
            TEST => Request::Test,
            RESTART => Request::Restart,
            _ => return Err(Error::InvalidData),
        })
    }
}

impl Request {
    /// The source a start/stop/data request applies to, and whether it
    /// concerns the batch path or the stream path — used by the request
    /// engine to route into `sampling::SamplingCore` (`spec.md` §4.6/§4.8).
    pub fn source_and_stream(&self) -> Option<(Source, bool)> {
        use Request::*;
        Some(match self {
            StartMicrophone(_) | StopMicrophone | MicrophoneData(_) => (Source::Microphone, false),
            StartScan(_) | StopScan | ScanData(_) => (Source::Scan, false),
            StartAccelerometer(_) | StopAccelerometer | AccelerometerData(_) => {
                (Source::Accelerometer, false)
            }
            StartAccelerometerInterrupt(_)
            | StopAccelerometerInterrupt
            | AccelerometerInterruptData(_) => (Source::AccelerometerInterrupt, false),
            StartBattery(_) | StopBattery | BatteryData(_) => (Source::Battery, false),
            StartMicrophoneStream(_) | StopMicrophoneStream => (Source::Microphone, true),
            StartScanStream(_) | StopScanStream => (Source::Scan, true),
            StartAccelerometerStream(_) | StopAccelerometerStream => {
                (Source::Accelerometer, true)
            }
            StartAccelerometerInterruptStream(_) | StopAccelerometerInterruptStream => {
                (Source::AccelerometerInterrupt, true)
            }
            StartBatteryStream(_) | StopBatteryStream => (Source::Battery, true),
            _ => return None,
        })
    }
}

// ------------------------------------------------------------- responses --

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatusResponse {
    pub clock_synced: bool,
    pub microphone_enabled: bool,
    pub scan_enabled: bool,
    pub accelerometer_enabled: bool,
    pub accelerometer_interrupt_enabled: bool,
    pub battery_enabled: bool,
    pub timestamp: Timestamp,
    pub battery: BatteryData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartAckResponse {
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MicrophoneDataResponse {
    pub last_response: bool,
    pub timestamp: Timestamp,
    pub sample_period_ms: u16,
    pub data: HVec<MicrophoneData, MICROPHONE_CHUNK_DATA_SIZE>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanDataResponse {
    pub last_response: bool,
    pub timestamp: Timestamp,
    pub data: HVec<ScanResultData, SCAN_CHUNK_DATA_SIZE>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccelerometerDataResponse {
    pub last_response: bool,
    pub timestamp: Timestamp,
    pub data: HVec<AccelerometerData, ACCELEROMETER_CHUNK_DATA_SIZE>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerometerInterruptDataResponse {
    pub last_response: bool,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BatteryDataResponse {
    pub last_response: bool,
    pub timestamp: Timestamp,
    pub battery: BatteryData,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamResponse {
    pub timestamp: Timestamp,
    pub battery: HVec<BatteryStream, PROTOCOL_BATTERY_STREAM_SIZE>,
    pub microphone: HVec<MicrophoneStream, PROTOCOL_MICROPHONE_STREAM_SIZE>,
    pub scan: HVec<ScanStream, PROTOCOL_SCAN_STREAM_SIZE>,
    pub accelerometer: HVec<AccelerometerStream, PROTOCOL_ACCELEROMETER_STREAM_SIZE>,
    pub accelerometer_interrupt:
        HVec<AccelerometerInterruptStream, PROTOCOL_ACCELEROMETER_INTERRUPT_STREAM_SIZE>,
}

impl StreamResponse {
    pub fn is_empty(&self) -> bool {
        self.battery.is_empty()
            && self.microphone.is_empty()
            && self.scan.is_empty()
            && self.accelerometer.is_empty()
            && self.accelerometer_interrupt.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TestResponse {
    pub test_failed: bool,
}

pub mod response_tag {
    pub const STATUS: u8 = 1;
    pub const START_MICROPHONE: u8 = 2;
    pub const START_SCAN: u8 = 3;
    pub const START_ACCELEROMETER: u8 = 4;
    pub const START_ACCELEROMETER_INTERRUPT: u8 = 5;
    pub const START_BATTERY: u8 = 6;
    pub const MICROPHONE_DATA: u8 = 7;
    pub const SCAN_DATA: u8 = 8;
    pub const ACCELEROMETER_DATA: u8 = 9;
    pub const ACCELEROMETER_INTERRUPT_DATA: u8 = 10;
    pub const BATTERY_DATA: u8 = 11;
    pub const STREAM: u8 = 12;
    pub const TEST: u8 = 13;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Status(StatusResponse),
    StartMicrophone(StartAckResponse),
    StartScan(StartAckResponse),
    StartAccelerometer(StartAckResponse),
    StartAccelerometerInterrupt(StartAckResponse),
    StartBattery(StartAckResponse),
    MicrophoneData(MicrophoneDataResponse),
    ScanData(ScanDataResponse),
    AccelerometerData(AccelerometerDataResponse),
    AccelerometerInterruptData(AccelerometerInterruptDataResponse),
    BatteryData(BatteryDataResponse),
    Stream(StreamResponse),
    Test(TestResponse),
}

impl Codec for Response {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()> {
        use response_tag::*;
        match self {
            Response::Status(r) => {
                w.put_u8(STATUS)?;
                w.put_u8(r.clock_synced as u8)?;
                w.put_u8(r.microphone_enabled as u8)?;
                w.put_u8(r.scan_enabled as u8)?;
                w.put_u8(r.accelerometer_enabled as u8)?;
                w.put_u8(r.accelerometer_interrupt_enabled as u8)?;
                w.put_u8(r.battery_enabled as u8)?;
                r.timestamp.encode(w, endian)?;
                r.battery.encode(w, endian)
            }
            Response::StartMicrophone(r) => {
                w.put_u8(START_MICROPHONE)?;
                r.timestamp.encode(w, endian)
            }
            Response::StartScan(r) => {
                w.put_u8(START_SCAN)?;
                r.timestamp.encode(w, endian)
            }
            Response::StartAccelerometer(r) => {
                w.put_u8(START_ACCELEROMETER)?;
                r.timestamp.encode(w, endian)
            }
            Response::StartAccelerometerInterrupt(r) => {
                w.put_u8(START_ACCELEROMETER_INTERRUPT)?;
                r.timestamp.encode(w, endian)
            }
            Response::StartBattery(r) => {
                w.put_u8(START_BATTERY)?;
                r.timestamp.encode(w, endian)
            }
            Response::MicrophoneData(r) => {
                w.put_u8(MICROPHONE_DATA)?;
                w.put_u8(r.last_response as u8)?;
                r.timestamp.encode(w, endian)?;
                w.put_u16(r.sample_period_ms, endian)?;
                w.put_repeated(&r.data, endian, |w, v, e| v.encode(w, e))
            }
            Response::ScanData(r) => {
                w.put_u8(SCAN_DATA)?;
                w.put_u8(r.last_response as u8)?;
                r.timestamp.encode(w, endian)?;
                w.put_repeated(&r.data, endian, |w, v, e| v.encode(w, e))
            }
            Response::AccelerometerData(r) => {
                w.put_u8(ACCELEROMETER_DATA)?;
                w.put_u8(r.last_response as u8)?;
                r.timestamp.encode(w, endian)?;
                w.put_repeated(&r.data, endian, |w, v, e| v.encode(w, e))
            }
            Response::AccelerometerInterruptData(r) => {
                w.put_u8(ACCELEROMETER_INTERRUPT_DATA)?;
                w.put_u8(r.last_response as u8)?;
                r.timestamp.encode(w, endian)
            }
            Response::BatteryData(r) => {
                w.put_u8(BATTERY_DATA)?;
                w.put_u8(r.last_response as u8)?;
                r.timestamp.encode(w, endian)?;
                r.battery.encode(w, endian)
            }
            Response::Stream(r) => {
                w.put_u8(STREAM)?;
                r.timestamp.encode(w, endian)?;
                w.put_repeated(&r.battery, endian, |w, v, e| v.encode(w, e))?;
                w.put_repeated(&r.microphone, endian, |w, v, e| v.encode(w, e))?;
                w.put_repeated(&r.scan, endian, |w, v, e| v.encode(w, e))?;
                w.put_repeated(&r.accelerometer, endian, |w, v, e| v.encode(w, e))?;
                w.put_repeated(&r.accelerometer_interrupt, endian, |w, v, e| v.encode(w, e))
            }
            Response::Test(r) => {
                w.put_u8(TEST)?;
                w.put_u8(r.test_failed as u8)
            }
        }
    }

    fn decode(r: &mut Reader, endian: Endian) -> Result<Self> {
        use response_tag::*;
        let tag = r.get_u8()?;
        Ok(match tag {
            STATUS => Response::Status(StatusResponse {
                clock_synced: r.get_u8()? != 0,
                microphone_enabled: r.get_u8()? != 0,
                scan_enabled: r.get_u8()? != 0,
                accelerometer_enabled: r.get_u8()? != 0,
                accelerometer_interrupt_enabled: r.get_u8()? != 0,
                battery_enabled: r.get_u8()? != 0,
                timestamp: Timestamp::decode(r, endian)?,
                battery: BatteryData::decode(r, endian)?,
            }),
            START_MICROPHONE => Response::StartMicrophone(StartAckResponse {
                timestamp: Timestamp::decode(r, endian)?,
            }),
            START_SCAN => Response::StartScan(StartAckResponse {
                timestamp: Timestamp::decode(r, endian)?,
            }),
            START_ACCELEROMETER => Response::StartAccelerometer(StartAckResponse {
                timestamp: Timestamp::decode(r, endian)?,
            }),
            START_ACCELEROMETER_INTERRUPT => {
                Response::StartAccelerometerInterrupt(StartAckResponse {
                    timestamp: Timestamp::decode(r, endian)?,
                })
            }
            START_BATTERY => Response::StartBattery(StartAckResponse {
                timestamp: Timestamp::decode(r, endian)?,
            }),
            MICROPHONE_DATA => Response::MicrophoneData(MicrophoneDataResponse {
                last_response: r.get_u8()? != 0,
                timestamp: Timestamp::decode(r, endian)?,
                sample_period_ms: r.get_u16(endian)?,
                data: r.get_repeated(endian, |r, e| MicrophoneData::decode(r, e))?,
            }),
            SCAN_DATA => Response::ScanData(ScanDataResponse {
                last_response: r.get_u8()? != 0,
                timestamp: Timestamp::decode(r, endian)?,
                data: r.get_repeated(endian, |r, e| ScanResultData::decode(r, e))?,
            }),
            ACCELEROMETER_DATA => Response::AccelerometerData(AccelerometerDataResponse {
                last_response: r.get_u8()? != 0,
                timestamp: Timestamp::decode(r, endian)?,
                data: r.get_repeated(endian, |r, e| AccelerometerData::decode(r, e))?,
            }),
            ACCELEROMETER_INTERRUPT_DATA => {
                Response::AccelerometerInterruptData(AccelerometerInterruptDataResponse {
                    last_response: r.get_u8()? != 0,
                    timestamp: Timestamp::decode(r, endian)?,
                })
            }
            BATTERY_DATA => Response::BatteryData(BatteryDataResponse {
                last_response: r.get_u8()? != 0,
                timestamp: Timestamp::decode(r, endian)?,
                battery: BatteryData::decode(r, endian)?,
            }),
            STREAM => Response::Stream(StreamResponse {
                timestamp: Timestamp::decode(r, endian)?,
                battery: r.get_repeated(endian, |r, e| BatteryStream::decode(r, e))?,
                microphone: r.get_repeated(endian, |r, e| MicrophoneStream::decode(r, e))?,
                scan: r.get_repeated(endian, |r, e| ScanStream::decode(r, e))?,
                accelerometer: r.get_repeated(endian, |r, e| AccelerometerStream::decode(r, e))?,
                accelerometer_interrupt: r
                    .get_repeated(endian, |r, e| AccelerometerInterruptStream::decode(r, e))?,
            }),
            TEST => Response::Test(TestResponse {
                test_failed: r.get_u8()? != 0,
            }),
            _ => return Err(Error::InvalidData),
        })
    }
}
