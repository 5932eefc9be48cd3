//! The top-level glue value (`spec.md` §9's "model the sampling bitset and
//! partition ids as one owned `Core` value passed by reference, not free
//! globals"), grounded in the cascade described across
//! `request_handler_lib_02v1.c`, `sampling_lib.c`, and `timeout_lib.c`.
//!
//! `Core` owns every collaborator the original scatters across file-scope
//! statics: the tick clock, the timeout registry (and which logical
//! timeout id belongs to which source/lifecycle), the sampling state
//! machines, the storer, the BLE byte transport and frame assembler, the
//! advertiser, and the cooperative task queue. Its public surface is the
//! small set of entry points a firmware `main.rs` drives from interrupt
//! context and the main loop: `on_ble_write`, `on_motion_interrupt`,
//! `service_alarm`, `run_once`.

use heapless::Vec as HVec;

use crate::advertiser::{Advertiser, StatusFlags};
use crate::clock::{HardwareCounter, TickClock};
use crate::config::{
    ADVERTISING_INTERVAL_MS, MICROPHONE_INNER_PERIOD_MS, PROTOCOL_ACCELEROMETER_INTERRUPT_STREAM_SIZE,
    PROTOCOL_ACCELEROMETER_STREAM_SIZE, PROTOCOL_BATTERY_STREAM_SIZE, PROTOCOL_MICROPHONE_STREAM_SIZE,
    PROTOCOL_SCAN_STREAM_SIZE, REQUEST_SERIALIZED_BUFFER_SIZE, SCAN_NO_GROUP_FILTER,
};
use crate::error::{Error, Result};
use crate::hal::{Accelerometer, BatteryAdc, BleAdvertiser, BleNotifier, BleScanner, BlockDevice, MicrophoneAdc};
use crate::log::{trace, warn};
use crate::messages::{
    AccelerometerChunk, AccelerometerInterruptChunk, AccelerometerStream, BadgeAssignment,
    BatteryChunk, BatteryData, BatteryDataResponse, BatteryStream, MicrophoneChunk, MicrophoneStream,
    Request, Response, ScanChunk, ScanStream, Source, StartAckResponse, StatusResponse,
    StreamResponse, TestResponse, Timestamp,
};
use crate::request::{encode_response_frame, FrameAssembler, ResponseLatch};
use crate::sampling::{Aggregation, SamplingCore, ScanConfig};
use crate::scheduler::{Scheduler, Task};
use crate::storer::{PartitionLayout, Storer};
use crate::timeout::{TimeoutId, TimeoutRegistry};

/// Registration-order ids for every logical timeout `Core` multiplexes over
/// one hardware alarm: a stop-after-`timeout_min` id per start/stop
/// lifecycle, a periodic re-arm id per source that samples on a timer, and
/// one for the advertising refresh. `Copy` so `Core`'s methods can take a
/// local snapshot instead of holding a borrow across a `timeouts` call.
#[derive(Debug, Clone, Copy)]
struct SourceTimeouts {
    microphone_batch: TimeoutId,
    microphone_stream: TimeoutId,
    microphone_inner: TimeoutId,
    microphone_outer: TimeoutId,
    scan_batch: TimeoutId,
    scan_stream: TimeoutId,
    scan_period: TimeoutId,
    scan_duration: TimeoutId,
    accelerometer_batch: TimeoutId,
    accelerometer_stream: TimeoutId,
    accelerometer_fifo: TimeoutId,
    accelerometer_interrupt_batch: TimeoutId,
    accelerometer_interrupt_stream: TimeoutId,
    accelerometer_interrupt_ignore: TimeoutId,
    battery_batch: TimeoutId,
    battery_stream: TimeoutId,
    battery_period: TimeoutId,
    advertising: TimeoutId,
}

/// Periods for the sources whose periodic timeout must be re-armed by hand
/// after every fire (`timeout::TimeoutRegistry::tick` deactivates a fired
/// timeout rather than reloading it — see that module's doc comment).
/// Updated whenever a start request sets/changes a period; batch and
/// stream starts for the same source share one period slot, so whichever
/// start request ran most recently wins (documented as an Open Question
/// resolution in `DESIGN.md`).
#[derive(Debug, Clone, Copy, Default)]
struct Periods {
    accel_fifo_ms: u32,
    battery_ms: u32,
    mic_outer_ms: u32,
    scan_period_s: u16,
    scan_duration_s: u16,
}

/// The frame currently queued to send for an in-progress data-pull
/// sub-protocol (`spec.md` §4.8). `Some(chunk)` is the next chunk to send;
/// `None` means "send the terminating `last_response=1` sentinel, then
/// stop" — the pull finishes the tick after a `None` frame sends
/// successfully.
#[derive(Clone)]
enum PullFrame {
    Microphone(Option<MicrophoneChunk>),
    Scan(Option<ScanChunk>),
    Accelerometer(Option<AccelerometerChunk>),
    AccelerometerInterrupt(Option<AccelerometerInterruptChunk>),
    Battery(Option<BatteryChunk>),
}

enum SendOutcome {
    Sent,
    Retry,
    Disconnected,
}

/// Owns every collaborator the badge's firmware needs, generic over the
/// seven hardware traits `hal` defines plus the tick-counter source.
pub struct Core<H, A, M, B, S, D, N, ADV>
where
    H: HardwareCounter,
    A: Accelerometer,
    M: MicrophoneAdc,
    B: BatteryAdc,
    S: BleScanner,
    D: BlockDevice,
    N: BleNotifier,
    ADV: BleAdvertiser,
{
    clock: TickClock<H>,
    timeouts: TimeoutRegistry,
    ids: SourceTimeouts,
    periods: Periods,
    sampling: SamplingCore<A, M, B, S>,
    storer: Storer<D>,
    sender: crate::sender::Sender<N>,
    advertiser: Advertiser<ADV>,
    assembler: FrameAssembler,
    scheduler: Scheduler,
    pending_pull: Option<PullFrame>,
    response_latch: ResponseLatch,
    assignment: Option<BadgeAssignment>,
    last_alarm_ms: u64,
}

impl<H, A, M, B, S, D, N, ADV> Core<H, A, M, B, S, D, N, ADV>
where
    H: HardwareCounter,
    A: Accelerometer,
    M: MicrophoneAdc,
    B: BatteryAdc,
    S: BleScanner,
    D: BlockDevice,
    N: BleNotifier,
    ADV: BleAdvertiser,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hw: H,
        accel: A,
        mic: M,
        battery: B,
        scanner: S,
        device: D,
        layout: PartitionLayout,
        notifier: N,
        advertiser_driver: ADV,
    ) -> Result<Self> {
        let mut timeouts = TimeoutRegistry::new();
        let ids = SourceTimeouts {
            microphone_batch: timeouts.register()?,
            microphone_stream: timeouts.register()?,
            microphone_inner: timeouts.register()?,
            microphone_outer: timeouts.register()?,
            scan_batch: timeouts.register()?,
            scan_stream: timeouts.register()?,
            scan_period: timeouts.register()?,
            scan_duration: timeouts.register()?,
            accelerometer_batch: timeouts.register()?,
            accelerometer_stream: timeouts.register()?,
            accelerometer_fifo: timeouts.register()?,
            accelerometer_interrupt_batch: timeouts.register()?,
            accelerometer_interrupt_stream: timeouts.register()?,
            accelerometer_interrupt_ignore: timeouts.register()?,
            battery_batch: timeouts.register()?,
            battery_stream: timeouts.register()?,
            battery_period: timeouts.register()?,
            advertising: timeouts.register()?,
        };

        let mut storer = Storer::new(device, layout)?;
        let assignment = storer.read_badge_assignment().ok();
        let mut advertiser = Advertiser::new(advertiser_driver);
        advertiser.set_assignment(assignment);

        let mut core = Self {
            clock: TickClock::new(hw),
            timeouts,
            ids,
            periods: Periods::default(),
            sampling: SamplingCore::new(accel, mic, battery, scanner),
            storer,
            sender: crate::sender::Sender::new(notifier),
            advertiser,
            assembler: FrameAssembler::new(),
            scheduler: Scheduler::new(),
            pending_pull: None,
            response_latch: ResponseLatch::default(),
            assignment,
            last_alarm_ms: 0,
        };
        let _ = core.timeouts.start(core.ids.advertising, ADVERTISING_INTERVAL_MS);
        Ok(core)
    }

    fn own_group(&self) -> u8 {
        self.assignment.map(|a| a.group).unwrap_or(SCAN_NO_GROUP_FILTER)
    }

    // --------------------------------------------------------- BLE intake --

    /// Feeds one BLE write-without-response payload in (`spec.md` §4.9).
    pub fn on_ble_write(&mut self, bytes: &[u8]) -> Result<()> {
        self.sender.on_received(bytes)?;
        self.assembler.on_notification(bytes.len())
    }

    /// Called from the BLE stack's disconnect callback, and internally on
    /// any unrecoverable protocol error (`spec.md` §5): cancels any
    /// in-flight response, invalidates storage iterators, force-stops every
    /// stream, and flushes the byte transport. Sampling itself keeps
    /// running — disconnect doesn't touch batch mode.
    pub fn on_disconnected(&mut self) {
        self.sender.on_disconnected();
        self.storer.invalidate_iterators();
        self.pending_pull = None;
        self.scheduler.clear();
        self.response_latch.reset();
        self.sampling.stop_microphone_stream();
        self.sampling.stop_scan_stream();
        self.sampling.stop_accelerometer_stream();
        self.sampling.stop_accelerometer_interrupt_stream();
        self.sampling.stop_battery_stream();
        self.refresh_source_timers();
    }

    /// Motion-interrupt ISR hook (`spec.md` §4.6's "Accelerometer
    /// interrupt"): records the event, then arms the ignore-window one-shot
    /// timeout that re-arms the sensor's own interrupt line once it lapses.
    pub fn on_motion_interrupt(&mut self) {
        let ts = self.clock.wall_now();
        self.sampling.on_motion_interrupt(ts);
        let ignore_ms = self.sampling.accelerometer_interrupt_ignore_duration_ms();
        let _ = self.timeouts.start(self.ids.accelerometer_interrupt_ignore, ignore_ms);
    }

    /// Feeds an external (tick, wall-ms) observation into the clock model
    /// (`spec.md` §4.1). The sync source itself (host handshake, GPS, NTP
    /// bridge) is board/link-specific and out of scope here.
    pub fn sync_wall_clock(&mut self, tick_at_sync: u64, wall_at_sync_ms: u64) {
        self.clock.set_wall(tick_at_sync, wall_at_sync_ms);
    }

    // --------------------------------------------------------- alarm/tick --

    /// Drives the timeout registry from the hardware alarm callback, firing
    /// whatever lapsed and returning the next period to re-arm the alarm
    /// for (`None` means every timeout is inactive — leave it disarmed).
    pub fn service_alarm(&mut self) -> Option<u32> {
        let now_ms = self.clock.continuous_ms();
        let elapsed = now_ms.saturating_sub(self.last_alarm_ms) as u32;
        self.last_alarm_ms = now_ms;
        let fired = self.timeouts.tick(elapsed);
        for id in fired {
            self.handle_timeout_fired(id);
        }
        self.timeouts.next_alarm_ms()
    }

    fn handle_timeout_fired(&mut self, id: TimeoutId) {
        let ids = self.ids;
        if id == ids.microphone_batch {
            self.sampling.stop_microphone_batch();
            self.refresh_source_timers();
        } else if id == ids.microphone_stream {
            self.sampling.stop_microphone_stream();
            self.refresh_source_timers();
        } else if id == ids.microphone_inner {
            self.sampling.on_microphone_inner_timer();
            let _ = self.timeouts.start(id, MICROPHONE_INNER_PERIOD_MS);
        } else if id == ids.microphone_outer {
            let ts = self.clock.wall_now();
            self.sampling.on_microphone_outer_timer(ts);
            let period = self.periods.mic_outer_ms;
            let _ = self.timeouts.start(id, period);
        } else if id == ids.scan_batch {
            self.sampling.stop_scan_batch();
            self.refresh_source_timers();
        } else if id == ids.scan_stream {
            self.sampling.stop_scan_stream();
            self.refresh_source_timers();
        } else if id == ids.scan_period {
            let ts = self.clock.wall_now();
            if self.sampling.on_scan_period_timer(ts).is_err() {
                warn!("scan period timer: radio configure/start failed");
            }
            let period_ms = self.periods.scan_period_s as u32 * 1000;
            let _ = self.timeouts.start(id, period_ms);
            let duration_ms = self.periods.scan_duration_s as u32 * 1000;
            let _ = self.timeouts.start(ids.scan_duration, duration_ms);
        } else if id == ids.scan_duration {
            self.sampling.on_scan_duration_timer();
        } else if id == ids.accelerometer_batch {
            self.sampling.stop_accelerometer_batch();
            self.refresh_source_timers();
        } else if id == ids.accelerometer_stream {
            self.sampling.stop_accelerometer_stream();
            self.refresh_source_timers();
        } else if id == ids.accelerometer_fifo {
            let ts = self.clock.wall_now();
            self.sampling.on_accelerometer_fifo_timer(ts);
            let period = self.periods.accel_fifo_ms;
            let _ = self.timeouts.start(id, period);
        } else if id == ids.accelerometer_interrupt_batch {
            self.sampling.stop_accelerometer_interrupt_batch();
            self.refresh_source_timers();
        } else if id == ids.accelerometer_interrupt_stream {
            self.sampling.stop_accelerometer_interrupt_stream();
            self.refresh_source_timers();
        } else if id == ids.accelerometer_interrupt_ignore {
            if self.sampling.rearm_accelerometer_interrupt().is_err() {
                warn!("motion interrupt re-arm failed");
            }
        } else if id == ids.battery_batch {
            self.sampling.stop_battery_batch();
            self.refresh_source_timers();
        } else if id == ids.battery_stream {
            self.sampling.stop_battery_stream();
            self.refresh_source_timers();
        } else if id == ids.battery_period {
            let ts = self.clock.wall_now();
            self.sampling.on_battery_timer(ts);
            let period = self.periods.battery_ms;
            let _ = self.timeouts.start(id, period);
        } else if id == ids.advertising {
            let _ = self.refresh_advertising();
            let _ = self.timeouts.start(id, ADVERTISING_INTERVAL_MS);
        }
    }

    /// Starts/stops the periodic per-source timeouts to track whether that
    /// source is enabled at all (`spec.md` §4.6) — `tick` only ever
    /// deactivates, so a source that just got disabled needs its periodic
    /// timer stopped explicitly, and one that just got enabled needs it
    /// started (idempotent either way).
    fn refresh_source_timers(&mut self) {
        if self.sampling.microphone_enabled() {
            if !self.timeouts.is_active(self.ids.microphone_inner) {
                let _ = self.timeouts.start(self.ids.microphone_inner, MICROPHONE_INNER_PERIOD_MS);
            }
            if !self.timeouts.is_active(self.ids.microphone_outer) && self.periods.mic_outer_ms > 0 {
                let _ = self.timeouts.start(self.ids.microphone_outer, self.periods.mic_outer_ms);
            }
        } else {
            let _ = self.timeouts.stop(self.ids.microphone_inner);
            let _ = self.timeouts.stop(self.ids.microphone_outer);
        }

        if self.sampling.accelerometer_enabled() {
            if !self.timeouts.is_active(self.ids.accelerometer_fifo) && self.periods.accel_fifo_ms > 0 {
                let _ = self.timeouts.start(self.ids.accelerometer_fifo, self.periods.accel_fifo_ms);
            }
        } else {
            let _ = self.timeouts.stop(self.ids.accelerometer_fifo);
        }

        if self.sampling.battery_enabled() {
            if !self.timeouts.is_active(self.ids.battery_period) && self.periods.battery_ms > 0 {
                let _ = self.timeouts.start(self.ids.battery_period, self.periods.battery_ms);
            }
        } else {
            let _ = self.timeouts.stop(self.ids.battery_period);
        }

        if self.sampling.scan_enabled() {
            if !self.timeouts.is_active(self.ids.scan_period) && self.periods.scan_period_s > 0 {
                let _ = self
                    .timeouts
                    .start(self.ids.scan_period, self.periods.scan_period_s as u32 * 1000);
            }
        } else {
            let _ = self.timeouts.stop(self.ids.scan_period);
            let _ = self.timeouts.stop(self.ids.scan_duration);
        }
    }

    fn arm_stop_timeout(&mut self, id: TimeoutId, timeout_min: u16) {
        let ms = (timeout_min as u32).saturating_mul(60_000);
        let _ = self.timeouts.start(id, ms);
    }

    // ----------------------------------------------------- main loop tick --

    /// One cooperative main-loop iteration (`spec.md` §5/§9): tries to
    /// assemble and dispatch a request, drains one closed sensor chunk per
    /// source into storage, runs at most one queued continuation task, and
    /// pumps the BLE TX queue.
    pub fn run_once(&mut self) {
        self.process_requests();
        self.drain_chunks_to_storage();
        if let Some(task) = self.scheduler.pop() {
            match task {
                Task::ProcessRequests => self.process_requests(),
                Task::ContinueDataPull => self.continue_data_pull(),
                Task::EmitStream => self.try_stream_emit(),
            }
        }
        let _ = self.sender.pump();
    }

    /// Persists every batch chunk each source has closed since the last
    /// pass (`spec.md` §4.6's sampling-to-storage handoff). Independent of
    /// the request engine: chunks land in storage whether or not a hub is
    /// connected.
    fn drain_chunks_to_storage(&mut self) {
        while let Some(chunk) = self.sampling.poll_battery_chunk() {
            if self.storer.store_battery_chunk(&chunk).is_err() {
                warn!("battery chunk store failed, dropping");
            }
        }
        while let Some(chunk) = self.sampling.poll_microphone_chunk() {
            if self.storer.store_microphone_chunk(&chunk).is_err() {
                warn!("microphone chunk store failed, dropping");
            }
        }
        while let Some(chunk) = self.sampling.poll_scan_chunk() {
            if self.storer.store_scan_chunk(&chunk).is_err() {
                warn!("scan chunk store failed, dropping");
            }
        }
        while let Some(chunk) = self.sampling.poll_accelerometer_chunk() {
            if self.storer.store_accelerometer_chunk(&chunk).is_err() {
                warn!("accelerometer chunk store failed, dropping");
            }
        }
        while let Some(chunk) = self.sampling.poll_accelerometer_interrupt_chunk() {
            if self.storer.store_accelerometer_interrupt_chunk(&chunk).is_err() {
                warn!("accelerometer-interrupt chunk store failed, dropping");
            }
        }
    }

    /// Assembles and dispatches as many fully-buffered requests as are
    /// ready, stopping as soon as a data pull starts (only one response is
    /// ever in flight, `spec.md` §4.8) or the link has nothing connected.
    fn process_requests(&mut self) {
        if !self.sender.is_connected() || self.pending_pull.is_some() {
            return;
        }
        loop {
            match self.assembler.try_assemble(&mut self.sender) {
                Ok(Some(req)) => self.dispatch_request(req),
                Ok(None) => break,
                Err(_) => {
                    warn!("request decode failed, disconnecting");
                    self.on_disconnected();
                    break;
                }
            }
            if self.pending_pull.is_some() {
                break;
            }
        }
    }

    fn dispatch_request(&mut self, req: Request) {
        self.timeouts.reset_all();
        let timestamp = self.clock.wall_now();
        let clock_synced = self.clock.is_synced();

        match req {
            Request::Status(r) => {
                if let Some(assignment) = r.badge_assignment {
                    let _ = self.storer.store_badge_assignment(&assignment);
                    self.assignment = Some(assignment);
                    self.advertiser.set_assignment(Some(assignment));
                }
                self.send_response(&Response::Status(StatusResponse {
                    clock_synced,
                    microphone_enabled: self.sampling.microphone_batch_enabled(),
                    scan_enabled: self.sampling.scan_batch_enabled(),
                    accelerometer_enabled: self.sampling.accelerometer_batch_enabled(),
                    accelerometer_interrupt_enabled: self.sampling.accelerometer_interrupt_batch_enabled(),
                    battery_enabled: self.sampling.battery_batch_enabled(),
                    timestamp,
                    battery: BatteryData { voltage: self.sampling.latest_battery_voltage() },
                }));
            }

            Request::StartMicrophone(r) => {
                self.sampling.start_microphone_batch(timestamp, r.period_ms);
                self.periods.mic_outer_ms = r.period_ms;
                self.arm_stop_timeout(self.ids.microphone_batch, r.timeout_min);
                self.refresh_source_timers();
                self.send_response(&Response::StartMicrophone(StartAckResponse { timestamp }));
            }
            Request::StopMicrophone => {
                self.sampling.stop_microphone_batch();
                let _ = self.timeouts.stop(self.ids.microphone_batch);
                self.refresh_source_timers();
            }
            Request::StartMicrophoneStream(r) => {
                self.sampling.start_microphone_stream(r.period_ms);
                self.periods.mic_outer_ms = r.period_ms;
                self.arm_stop_timeout(self.ids.microphone_stream, r.timeout_min);
                self.refresh_source_timers();
                self.send_response(&Response::StartMicrophone(StartAckResponse { timestamp }));
            }
            Request::StopMicrophoneStream => {
                self.sampling.stop_microphone_stream();
                let _ = self.timeouts.stop(self.ids.microphone_stream);
                self.refresh_source_timers();
            }

            Request::StartScan(r) => {
                let config = self.scan_config_from(
                    r.interval_ms,
                    r.window_ms,
                    r.duration_s,
                    r.period_s,
                    r.aggregation_type,
                );
                self.sampling.start_scan_batch(config);
                self.periods.scan_period_s = r.period_s;
                self.periods.scan_duration_s = r.duration_s;
                self.arm_stop_timeout(self.ids.scan_batch, r.timeout_min);
                self.refresh_source_timers();
                self.send_response(&Response::StartScan(StartAckResponse { timestamp }));
            }
            Request::StopScan => {
                self.sampling.stop_scan_batch();
                let _ = self.timeouts.stop(self.ids.scan_batch);
                self.refresh_source_timers();
            }
            Request::StartScanStream(r) => {
                let config = self.scan_config_from(
                    r.interval_ms,
                    r.window_ms,
                    r.duration_s,
                    r.period_s,
                    r.aggregation_type,
                );
                self.sampling.start_scan_stream(config);
                self.periods.scan_period_s = r.period_s;
                self.periods.scan_duration_s = r.duration_s;
                self.arm_stop_timeout(self.ids.scan_stream, r.timeout_min);
                self.refresh_source_timers();
                self.send_response(&Response::StartScan(StartAckResponse { timestamp }));
            }
            Request::StopScanStream => {
                self.sampling.stop_scan_stream();
                let _ = self.timeouts.stop(self.ids.scan_stream);
                self.refresh_source_timers();
            }

            Request::StartAccelerometer(r) => {
                if self
                    .sampling
                    .start_accelerometer_batch(timestamp, r.operating_mode, r.full_scale, r.datarate)
                    .is_err()
                {
                    warn!("accelerometer configure failed");
                }
                self.periods.accel_fifo_ms = r.fifo_sampling_period_ms as u32;
                self.arm_stop_timeout(self.ids.accelerometer_batch, r.timeout_min);
                self.refresh_source_timers();
                self.send_response(&Response::StartAccelerometer(StartAckResponse { timestamp }));
            }
            Request::StopAccelerometer => {
                self.sampling.stop_accelerometer_batch();
                let _ = self.timeouts.stop(self.ids.accelerometer_batch);
                self.refresh_source_timers();
            }
            Request::StartAccelerometerStream(r) => {
                if self
                    .sampling
                    .start_accelerometer_stream(r.operating_mode, r.full_scale, r.datarate)
                    .is_err()
                {
                    warn!("accelerometer configure failed");
                }
                self.periods.accel_fifo_ms = r.fifo_sampling_period_ms as u32;
                self.arm_stop_timeout(self.ids.accelerometer_stream, r.timeout_min);
                self.refresh_source_timers();
                self.send_response(&Response::StartAccelerometer(StartAckResponse { timestamp }));
            }
            Request::StopAccelerometerStream => {
                self.sampling.stop_accelerometer_stream();
                let _ = self.timeouts.stop(self.ids.accelerometer_stream);
                self.refresh_source_timers();
            }

            Request::StartAccelerometerInterrupt(r) => {
                if self
                    .sampling
                    .start_accelerometer_interrupt_batch(r.threshold_mg, r.minimal_duration_ms, r.ignore_duration_ms)
                    .is_err()
                {
                    warn!("motion interrupt configure failed");
                }
                self.arm_stop_timeout(self.ids.accelerometer_interrupt_batch, r.timeout_min);
                self.refresh_source_timers();
                self.send_response(&Response::StartAccelerometerInterrupt(StartAckResponse { timestamp }));
            }
            Request::StopAccelerometerInterrupt => {
                self.sampling.stop_accelerometer_interrupt_batch();
                let _ = self.timeouts.stop(self.ids.accelerometer_interrupt_batch);
                self.refresh_source_timers();
            }
            Request::StartAccelerometerInterruptStream(r) => {
                if self
                    .sampling
                    .start_accelerometer_interrupt_stream(r.threshold_mg, r.minimal_duration_ms, r.ignore_duration_ms)
                    .is_err()
                {
                    warn!("motion interrupt configure failed");
                }
                self.arm_stop_timeout(self.ids.accelerometer_interrupt_stream, r.timeout_min);
                self.refresh_source_timers();
                self.send_response(&Response::StartAccelerometerInterrupt(StartAckResponse { timestamp }));
            }
            Request::StopAccelerometerInterruptStream => {
                self.sampling.stop_accelerometer_interrupt_stream();
                let _ = self.timeouts.stop(self.ids.accelerometer_interrupt_stream);
                self.refresh_source_timers();
            }

            Request::StartBattery(r) => {
                self.sampling.start_battery_batch(timestamp);
                self.periods.battery_ms = r.period_ms;
                self.arm_stop_timeout(self.ids.battery_batch, r.timeout_min);
                self.refresh_source_timers();
                self.send_response(&Response::StartBattery(StartAckResponse { timestamp }));
            }
            Request::StopBattery => {
                self.sampling.stop_battery_batch();
                let _ = self.timeouts.stop(self.ids.battery_batch);
                self.refresh_source_timers();
            }
            Request::StartBatteryStream(r) => {
                self.sampling.start_battery_stream();
                self.periods.battery_ms = r.period_ms;
                self.arm_stop_timeout(self.ids.battery_stream, r.timeout_min);
                self.refresh_source_timers();
                self.send_response(&Response::StartBattery(StartAckResponse { timestamp }));
            }
            Request::StopBatteryStream => {
                self.sampling.stop_battery_stream();
                let _ = self.timeouts.stop(self.ids.battery_stream);
                self.refresh_source_timers();
            }

            Request::MicrophoneData(r) => self.begin_data_pull(Source::Microphone, r.timestamp),
            Request::ScanData(r) => self.begin_data_pull(Source::Scan, r.timestamp),
            Request::AccelerometerData(r) => self.begin_data_pull(Source::Accelerometer, r.timestamp),
            Request::AccelerometerInterruptData(r) => {
                self.begin_data_pull(Source::AccelerometerInterrupt, r.timestamp)
            }
            Request::BatteryData(r) => self.begin_data_pull(Source::Battery, r.timestamp),

            Request::Identify(r) => {
                trace!("identify requested for {}s (LED UI out of scope)", r.timeout_s);
            }
            Request::Test => {
                self.send_response(&Response::Test(TestResponse { test_failed: false }));
            }
            Request::Restart => {
                warn!("restart requested; resetting session state");
                self.on_disconnected();
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_config_from(
        &self,
        interval_ms: u16,
        window_ms: u16,
        duration_s: u16,
        period_s: u16,
        aggregation_type: u8,
    ) -> ScanConfig {
        ScanConfig {
            interval_ms,
            window_ms,
            duration_s,
            period_s,
            aggregation: Aggregation::from_u8(aggregation_type),
            own_group: self.own_group(),
        }
    }

    // ------------------------------------------------------- data pulls --

    fn begin_data_pull(&mut self, source: Source, seek: Timestamp) {
        if self.pending_pull.is_some() {
            warn!("data pull requested while one already in flight; ignoring");
            return;
        }
        self.response_latch.reset();
        let frame = match source {
            Source::Microphone => {
                PullFrame::Microphone(self.storer.find_microphone_chunk_from_timestamp(seek).ok().flatten())
            }
            Source::Scan => PullFrame::Scan(self.storer.find_scan_chunk_from_timestamp(seek).ok().flatten()),
            Source::Accelerometer => {
                PullFrame::Accelerometer(self.storer.find_accelerometer_chunk_from_timestamp(seek).ok().flatten())
            }
            Source::AccelerometerInterrupt => PullFrame::AccelerometerInterrupt(
                self.storer.find_accelerometer_interrupt_chunk_from_timestamp(seek).ok().flatten(),
            ),
            Source::Battery => {
                PullFrame::Battery(self.storer.find_battery_chunk_from_timestamp(seek).ok().flatten())
            }
        };
        self.pending_pull = Some(frame);
        self.scheduler.post(Task::ContinueDataPull);
    }

    fn pull_frame_response(&self, frame: &PullFrame) -> Response {
        match frame {
            PullFrame::Microphone(Some(c)) => Response::MicrophoneData(crate::messages::MicrophoneDataResponse {
                last_response: false,
                timestamp: c.timestamp,
                sample_period_ms: c.sample_period_ms,
                data: c.data.clone(),
            }),
            PullFrame::Microphone(None) => Response::MicrophoneData(crate::messages::MicrophoneDataResponse {
                last_response: true,
                timestamp: Timestamp::default(),
                sample_period_ms: 0,
                data: HVec::new(),
            }),
            PullFrame::Scan(Some(c)) => Response::ScanData(crate::messages::ScanDataResponse {
                last_response: false,
                timestamp: c.timestamp,
                data: c.data.clone(),
            }),
            PullFrame::Scan(None) => Response::ScanData(crate::messages::ScanDataResponse {
                last_response: true,
                timestamp: Timestamp::default(),
                data: HVec::new(),
            }),
            PullFrame::Accelerometer(Some(c)) => {
                Response::AccelerometerData(crate::messages::AccelerometerDataResponse {
                    last_response: false,
                    timestamp: c.timestamp,
                    data: c.data.clone(),
                })
            }
            PullFrame::Accelerometer(None) => {
                Response::AccelerometerData(crate::messages::AccelerometerDataResponse {
                    last_response: true,
                    timestamp: Timestamp::default(),
                    data: HVec::new(),
                })
            }
            PullFrame::AccelerometerInterrupt(Some(c)) => Response::AccelerometerInterruptData(
                crate::messages::AccelerometerInterruptDataResponse { last_response: false, timestamp: c.timestamp },
            ),
            PullFrame::AccelerometerInterrupt(None) => Response::AccelerometerInterruptData(
                crate::messages::AccelerometerInterruptDataResponse {
                    last_response: true,
                    timestamp: Timestamp::default(),
                },
            ),
            PullFrame::Battery(Some(c)) => Response::BatteryData(BatteryDataResponse {
                last_response: false,
                timestamp: c.timestamp,
                battery: c.battery,
            }),
            PullFrame::Battery(None) => Response::BatteryData(BatteryDataResponse {
                last_response: true,
                timestamp: Timestamp::default(),
                battery: BatteryData::default(),
            }),
        }
    }

    fn advance_pull(&mut self, frame: PullFrame) -> Option<PullFrame> {
        match frame {
            PullFrame::Microphone(Some(_)) => {
                Some(PullFrame::Microphone(self.storer.get_next_microphone_chunk().ok().flatten()))
            }
            PullFrame::Microphone(None) => None,
            PullFrame::Scan(Some(_)) => Some(PullFrame::Scan(self.storer.get_next_scan_chunk().ok().flatten())),
            PullFrame::Scan(None) => None,
            PullFrame::Accelerometer(Some(_)) => {
                Some(PullFrame::Accelerometer(self.storer.get_next_accelerometer_chunk().ok().flatten()))
            }
            PullFrame::Accelerometer(None) => None,
            PullFrame::AccelerometerInterrupt(Some(_)) => Some(PullFrame::AccelerometerInterrupt(
                self.storer.get_next_accelerometer_interrupt_chunk().ok().flatten(),
            )),
            PullFrame::AccelerometerInterrupt(None) => None,
            PullFrame::Battery(Some(_)) => {
                Some(PullFrame::Battery(self.storer.get_next_battery_chunk().ok().flatten()))
            }
            PullFrame::Battery(None) => None,
        }
    }

    /// Sends exactly the current pull frame and, only once it lands,
    /// advances to the next one (`spec.md` §8 scenario 4: a retried send
    /// must resend the same frame, not skip ahead).
    fn continue_data_pull(&mut self) {
        let Some(pending) = self.pending_pull.clone() else { return };
        let resp = self.pull_frame_response(&pending);
        match self.send_response(&resp) {
            SendOutcome::Sent => {
                self.pending_pull = self.advance_pull(pending);
                if self.pending_pull.is_some() {
                    self.scheduler.post(Task::ContinueDataPull);
                }
            }
            SendOutcome::Retry => self.scheduler.post(Task::ContinueDataPull),
            SendOutcome::Disconnected => self.pending_pull = None,
        }
    }

    // --------------------------------------------------------- streaming --

    fn any_stream_active(&self) -> bool {
        self.sampling.microphone_stream_enabled()
            || self.sampling.scan_stream_enabled()
            || self.sampling.accelerometer_stream_enabled()
            || self.sampling.accelerometer_interrupt_stream_enabled()
            || self.sampling.battery_stream_enabled()
    }

    /// Gathers up to the per-source cap worth of queued stream samples into
    /// one `StreamResponse` and sends it, re-scheduling itself while any
    /// stream bit is still set (`spec.md` §4.8's streaming sub-protocol).
    fn try_stream_emit(&mut self) {
        if !self.sender.is_connected() || !self.any_stream_active() {
            return;
        }
        if self.pending_pull.is_some() {
            self.scheduler.post(Task::EmitStream);
            return;
        }

        let mut battery = HVec::new();
        while battery.len() < PROTOCOL_BATTERY_STREAM_SIZE {
            match self.sampling.battery_stream.pop() {
                Some(v) => {
                    let _ = battery.push(BatteryStream { battery: v });
                }
                None => break,
            }
        }
        let mut microphone = HVec::new();
        while microphone.len() < PROTOCOL_MICROPHONE_STREAM_SIZE {
            match self.sampling.microphone_stream.pop() {
                Some(v) => {
                    let _ = microphone.push(MicrophoneStream { sample: v });
                }
                None => break,
            }
        }
        let mut scan = HVec::new();
        while scan.len() < PROTOCOL_SCAN_STREAM_SIZE {
            match self.sampling.scan_stream.pop() {
                Some(v) => {
                    let _ = scan.push(ScanStream { device: v });
                }
                None => break,
            }
        }
        let mut accelerometer = HVec::new();
        while accelerometer.len() < PROTOCOL_ACCELEROMETER_STREAM_SIZE {
            match self.sampling.accel_stream.pop() {
                Some(v) => {
                    let _ = accelerometer.push(AccelerometerStream { raw: v });
                }
                None => break,
            }
        }
        let mut accelerometer_interrupt = HVec::new();
        while accelerometer_interrupt.len() < PROTOCOL_ACCELEROMETER_INTERRUPT_STREAM_SIZE {
            match self.sampling.accel_interrupt_stream.pop() {
                Some(v) => {
                    let _ = accelerometer_interrupt.push(crate::messages::AccelerometerInterruptStream {
                        timestamp: v,
                    });
                }
                None => break,
            }
        }

        let resp = StreamResponse {
            timestamp: self.clock.wall_now(),
            battery,
            microphone,
            scan,
            accelerometer,
            accelerometer_interrupt,
        };
        if resp.is_empty() {
            self.scheduler.post(Task::EmitStream);
            return;
        }
        match self.send_response(&Response::Stream(resp)) {
            SendOutcome::Disconnected => {}
            SendOutcome::Sent | SendOutcome::Retry => self.scheduler.post(Task::EmitStream),
        }
    }

    // ----------------------------------------------------------- sending --

    fn send_response(&mut self, resp: &Response) -> SendOutcome {
        let mut buf = [0u8; REQUEST_SERIALIZED_BUFFER_SIZE];
        let n = match encode_response_frame(resp, &mut buf) {
            Ok(n) => n,
            Err(_) => {
                warn!("response encode failed, disconnecting");
                self.on_disconnected();
                return SendOutcome::Disconnected;
            }
        };
        match self.sender.transmit(&buf[..n]) {
            Ok(()) => {
                self.response_latch.reset();
                SendOutcome::Sent
            }
            Err(Error::NoMemory) => {
                if self.response_latch.record_failure().is_err() {
                    warn!("response transmit retries exhausted, disconnecting");
                    self.on_disconnected();
                    SendOutcome::Disconnected
                } else {
                    SendOutcome::Retry
                }
            }
            Err(_) => {
                warn!("response transmit failed, disconnecting");
                self.on_disconnected();
                SendOutcome::Disconnected
            }
        }
    }

    // -------------------------------------------------------- advertising --

    /// Rebuilds and (re)ships the advertising identity payload (`spec.md`
    /// §6). Called on `ADVERTISING_INTERVAL_MS` regardless of connection
    /// state.
    pub fn refresh_advertising(&mut self) -> Result<()> {
        let status = StatusFlags {
            clock_synced: self.clock.is_synced(),
            microphone_enabled: self.sampling.microphone_batch_enabled(),
            scan_enabled: self.sampling.scan_batch_enabled(),
            accelerometer_enabled: self.sampling.accelerometer_batch_enabled(),
            accelerometer_interrupt_enabled: self.sampling.accelerometer_interrupt_batch_enabled(),
            battery_enabled: self.sampling.battery_batch_enabled(),
        };
        self.advertiser.advertise(self.sampling.latest_battery_voltage(), status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{AdvertisingReport, RawAccelSample};
    use crate::messages::StatusRequest;
    use core::cell::Cell;
    use std::cell::RefCell;
    use std::vec::Vec as StdVec;

    struct FakeCounter {
        raw: Cell<u32>,
    }
    impl HardwareCounter for FakeCounter {
        fn read(&self) -> u32 {
            self.raw.get()
        }
    }

    struct FakeAccel;
    impl Accelerometer for FakeAccel {
        fn configure(&mut self, _: u8, _: u8, _: u16) -> Result<()> {
            Ok(())
        }
        fn drain_fifo(&mut self, _out: &mut [RawAccelSample]) -> usize {
            0
        }
        fn configure_motion_interrupt(&mut self, _: u16, _: u16) -> Result<()> {
            Ok(())
        }
        fn rearm_motion_interrupt(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeMic;
    impl MicrophoneAdc for FakeMic {
        fn sample(&mut self) -> u16 {
            0
        }
    }

    struct FakeBattery;
    impl BatteryAdc for FakeBattery {
        fn read_voltage(&mut self) -> f32 {
            3.0
        }
    }

    struct FakeScanner;
    impl BleScanner for FakeScanner {
        fn configure(&mut self, _: u16, _: u16) -> Result<()> {
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

    struct MemDevice {
        bytes: StdVec<u8>,
    }
    impl BlockDevice for MemDevice {
        fn capacity_bytes(&self) -> u32 {
            self.bytes.len() as u32
        }
        fn sector_size(&self) -> u32 {
            256
        }
        fn word_size(&self) -> u32 {
            4
        }
        fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
            let start = addr as usize;
            buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
            Ok(())
        }
        fn store(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
            let start = addr as usize;
            self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
        fn is_ready(&self) -> bool {
            true
        }
    }

    struct FakeNotifier {
        connected: bool,
        sent: RefCell<StdVec<StdVec<u8>>>,
    }
    impl BleNotifier for FakeNotifier {
        fn notify(&mut self, frame: &[u8]) -> Result<()> {
            self.sent.borrow_mut().push(frame.to_vec());
            Ok(())
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    struct FakeAdvertiser {
        mac: [u8; 6],
    }
    impl BleAdvertiser for FakeAdvertiser {
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
            self.mac
        }
    }

    type TestCore = Core<FakeCounter, FakeAccel, FakeMic, FakeBattery, FakeScanner, MemDevice, FakeNotifier, FakeAdvertiser>;

    fn test_layout() -> PartitionLayout {
        PartitionLayout {
            badge_assignment: (0, 256),
            battery: (256, 4096),
            microphone: (4352, 8192),
            scan: (12544, 8192),
            accel_interrupt: (20736, 4096),
            accel: (24832, 16384),
        }
    }

    fn new_core() -> TestCore {
        Core::new(
            FakeCounter { raw: Cell::new(0) },
            FakeAccel,
            FakeMic,
            FakeBattery,
            FakeScanner,
            MemDevice { bytes: vec![0xFFu8; 24832 + 16384] },
            test_layout(),
            FakeNotifier { connected: true, sent: RefCell::new(StdVec::new()) },
            FakeAdvertiser { mac: [1, 2, 3, 4, 5, 6] },
        )
        .unwrap()
    }

    fn wire_bytes(req: &Request) -> StdVec<u8> {
        use crate::codec::{Codec, Endian, Writer};
        let mut body = [0u8; 64];
        let mut w = Writer::new(&mut body);
        req.encode(&mut w, Endian::Big).unwrap();
        let n = w.position();
        let mut out = StdVec::new();
        out.extend_from_slice(&(n as u16).to_be_bytes());
        out.extend_from_slice(&body[..n]);
        out
    }

    #[test]
    fn status_request_gets_a_status_response() {
        let mut core = new_core();
        let req = Request::Status(StatusRequest { timestamp: Timestamp::default(), badge_assignment: None });
        let bytes = wire_bytes(&req);
        core.on_ble_write(&bytes).unwrap();
        core.run_once();
        assert_eq!(core.sender.notifier().sent.borrow().len(), 1);
    }

    #[test]
    fn start_battery_then_data_pull_drains_exactly_one_chunk() {
        let mut core = new_core();
        let start = Request::StartBattery(crate::messages::StartPeriodicRequest {
            timestamp: Timestamp::default(),
            timeout_min: 0,
            period_ms: 1000,
        });
        core.on_ble_write(&wire_bytes(&start)).unwrap();
        core.run_once();
        // One battery sample timer fire closes and reopens the open chunk.
        core.sampling.on_battery_timer(Timestamp { seconds: 1, ms: 0 });
        core.run_once();

        let pull = Request::BatteryData(crate::messages::DataRequest { timestamp: Timestamp::default() });
        core.on_ble_write(&wire_bytes(&pull)).unwrap();
        core.run_once();
        while core.pending_pull.is_some() {
            core.run_once();
        }
        let sent = core.sender.notifier().sent.borrow();
        // Last_response 0 chunk + sentinel last_response 1.
        assert!(sent.len() >= 3);
    }

    #[test]
    fn disconnect_clears_pending_pull_and_stops_streams() {
        let mut core = new_core();
        core.sampling.start_battery_stream();
        core.on_disconnected();
        assert!(!core.sampling.battery_stream_enabled());
        assert!(core.pending_pull.is_none());
    }

    #[test]
    fn advertising_timer_refreshes_payload_without_a_connection() {
        let mut core = new_core();
        core.sender.notifier_mut().connected = false;
        assert!(core.refresh_advertising().is_ok());
    }
}
