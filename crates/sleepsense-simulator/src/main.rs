//! Desktop simulator for the sleepsense wearable.
//!
//! Runs the sleepsense-core scheduler on the host with synthetic sensors:
//! a skin thermometer, two pulse oximeters and their fusion, an IMU, a
//! battery gauge and a microphone fed by a simulated PDM interrupt thread.
//! Samples are logged to RAM-backed NOR flash. When the run ends the log is
//! uploaded over an in-memory link, reassembled and decoded as a receiver
//! would, and a per-sensor summary is printed.
//!
//! ```text
//! RUST_LOG=info sleepsense-simulator --seconds 20 --flush-ms 5000 --unplugged-oximeter
//! ```

use std::cell::RefCell;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use embassy_futures::select::select;
use embassy_time::{Duration, Instant, Ticker, Timer};
use embedded_io_async::{ErrorKind, ErrorType, Write};
use futures::executor::block_on;
use futures::future::join_all;
use log::{error, info, warn};

use sleepsense_core::bus::BusArbiter;
use sleepsense_core::capture::{CaptureConsumer, CaptureError, CaptureProducer, CaptureRing};
use sleepsense_core::config::DeviceConfig;
use sleepsense_core::sensors::{
    FusionCombiner, RegistryError, Sample, SampleSink, Sensor, SensorError, SensorRegistry,
    Spo2Fusion, Spo2Reading,
};
use sleepsense_core::storage::{
    ChunkAssembler, PersistentLogStore, RamFlash, StorageError, UploadLink,
};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Sensor slots available to the registry.
const MAX_SENSORS: usize = 8;

/// Flash sector size of the simulated NOR chip.
const SECTOR_SIZE: usize = 4096;

/// Simulated PDM sample rate.
const AUDIO_RATE_HZ: u32 = 8_000;

/// Samples delivered per simulated PDM interrupt (10 ms of audio).
const AUDIO_BLOCK: usize = (AUDIO_RATE_HZ / 100) as usize;

/// Audio ring capacity; must be a power of two.
const AUDIO_RING: usize = 8192;

/// Samples the microphone pops at a time.
const AUDIO_FRAME: usize = 512;

#[derive(Parser, Debug)]
#[command(
    name = "sleepsense-simulator",
    about = "Run the sleepsense sampling and logging core against synthetic sensors"
)]
struct Args {
    /// Simulated run time in seconds.
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// Override the periodic flush interval (milliseconds).
    #[arg(long)]
    flush_ms: Option<u32>,

    /// Upload chunk length in bytes.
    #[arg(long)]
    chunk_len: Option<u16>,

    /// Start with the second oximeter unplugged; it is plugged in halfway
    /// through the run.
    #[arg(long)]
    unplugged_oximeter: bool,

    /// Two seconds in, deliver this many milliseconds of audio in a single
    /// burst, to provoke a capture overflow.
    #[arg(long, default_value_t = 0)]
    audio_burst_ms: u64,
}

// ---------------------------------------------------------------------------
// Simulated bus
// ---------------------------------------------------------------------------

/// Stand-in for the shared I2C bus. Counts transactions so the summary can
/// show how busy the bus was.
#[derive(Default)]
struct SimBus {
    transactions: u32,
}

impl SimBus {
    fn transfer(&mut self) {
        self.transactions += 1;
    }
}

/// Seconds since the simulated boot.
fn uptime_secs() -> f32 {
    Instant::now().as_millis() as f32 / 1000.0
}

// ---------------------------------------------------------------------------
// Synthetic sensors
// ---------------------------------------------------------------------------

/// Skin temperature drifting slowly around 33.5 °C. Payload: one BE `f32`.
struct Thermometer;

impl Sensor<SimBus> for Thermometer {
    async fn init(&mut self, bus: &mut SimBus) -> Result<(), SensorError> {
        bus.transfer();
        Ok(())
    }

    async fn read(&mut self, bus: &mut SimBus, out: &mut Sample) -> Result<(), SensorError> {
        bus.transfer();
        let t = uptime_secs();
        let celsius = 33.5 + 0.4 * (t / 60.0).sin() + 0.05 * (t / 7.0).cos();
        out.write_f32s(&[celsius])
    }

    fn print(name: &str, sample: &Sample) {
        match sample.f32_at(0) {
            Some(c) => info!("  {}: {:.2} C", name, c),
            None => info!("  {}: (no data)", name),
        }
    }
}

/// MAX3010x-style oximeter. `quality` scales the signal-quality ratios, so a
/// low value produces readings the fusion stage should distrust.
struct PulseOximeter {
    quality: f32,
    spo2_offset: f32,
    /// Not answering on the bus until this instant.
    plugged_at: Option<Instant>,
}

impl PulseOximeter {
    fn attached(&self) -> bool {
        self.plugged_at.is_none_or(|at| Instant::now() >= at)
    }
}

impl Sensor<SimBus> for PulseOximeter {
    async fn init(&mut self, bus: &mut SimBus) -> Result<(), SensorError> {
        bus.transfer();
        if self.attached() {
            Ok(())
        } else {
            Err(SensorError::NotPresent { sensor: "max3010x" })
        }
    }

    async fn read(&mut self, bus: &mut SimBus, out: &mut Sample) -> Result<(), SensorError> {
        bus.transfer();
        if !self.attached() {
            return Err(SensorError::Bus {
                sensor: "max3010x",
                operation: "read fifo",
            });
        }
        let t = uptime_secs();
        let spo2 = 96.5 + self.spo2_offset + 0.8 * (t / 11.0).sin();
        let reading = Spo2Reading {
            ac_dc_ir: self.quality,
            ac_dc_red: self.quality * (0.97 + 0.03 * (t / 3.0).cos()),
            raw_spo2: spo2 + 0.3 * (t * 1.7).sin(),
            spo2,
            heart_rate: 58.0 + 4.0 * (t / 13.0).sin(),
        };
        reading.write_to(out)
    }

    fn print(name: &str, sample: &Sample) {
        match Spo2Reading::from_sample(sample) {
            Some(r) => info!(
                "  {}: HR {:.1}, SpO2 {:.2} (ir {:.2}, red {:.2})",
                name, r.heart_rate, r.spo2, r.ac_dc_ir, r.ac_dc_red
            ),
            None => info!("  {}: (no data)", name),
        }
    }
}

/// Orientation sensor reporting yaw, pitch and roll in degrees as three BE
/// `f32`s. The wearer rolls from side to side over a couple of minutes.
struct Imu;

impl Imu {
    fn posture(roll: f32) -> &'static str {
        match roll {
            r if r <= -90.0 => "extreme right",
            r if r <= -10.0 => "medium right",
            r if r <= 10.0 => "relatively up",
            r if r < 90.0 => "medium left",
            _ => "extreme left",
        }
    }
}

impl Sensor<SimBus> for Imu {
    async fn init(&mut self, bus: &mut SimBus) -> Result<(), SensorError> {
        bus.transfer();
        Ok(())
    }

    async fn read(&mut self, bus: &mut SimBus, out: &mut Sample) -> Result<(), SensorError> {
        bus.transfer();
        let t = uptime_secs();
        let yaw = 20.0 * (t / 40.0).sin();
        let pitch = 5.0 * (t / 9.0).cos();
        let roll = 120.0 * (t / 30.0).sin();
        out.write_f32s(&[yaw, pitch, roll])
    }

    fn print(name: &str, sample: &Sample) {
        match sample.f32_at(2) {
            Some(roll) => info!("  {}: roll {:.1} ({})", name, roll, Self::posture(roll)),
            None => info!("  {}: (no data)", name),
        }
    }
}

/// Battery gauge. Payload: one byte, charge in percent.
struct Battery;

impl Battery {
    /// Piecewise LiPo discharge curve.
    fn percent(volts: f32) -> u8 {
        let percent = if (3.75..4.2).contains(&volts) {
            80.0 + (volts - 3.75) * (20.0 / 0.45)
        } else if (3.5..3.75).contains(&volts) {
            20.0 + (volts - 3.5) * (60.0 / 0.25)
        } else if (3.2..3.5).contains(&volts) {
            (volts - 3.2) * (20.0 / 0.3)
        } else if volts >= 4.2 {
            100.0
        } else {
            0.0
        };
        percent.clamp(0.0, 100.0) as u8
    }
}

impl Sensor<SimBus> for Battery {
    async fn init(&mut self, _bus: &mut SimBus) -> Result<(), SensorError> {
        Ok(())
    }

    async fn read(&mut self, _bus: &mut SimBus, out: &mut Sample) -> Result<(), SensorError> {
        // Drains unrealistically fast so the curve is visible in short runs.
        let volts = 4.15 - 0.002 * uptime_secs();
        out.payload
            .push(Self::percent(volts))
            .map_err(|_| SensorError::PayloadTooLarge { len: 1 })
    }

    fn print(name: &str, sample: &Sample) {
        match sample.payload.first() {
            Some(p) => info!("  {}: {}%", name, p),
            None => info!("  {}: (no data)", name),
        }
    }
}

/// Microphone drained from the capture ring. Payload: RMS and peak level of
/// everything buffered since the last read, as two BE `f32`s.
struct Microphone<'r> {
    audio: CaptureConsumer<'r, i16, AUDIO_RING>,
    frame: [i16; AUDIO_FRAME],
}

impl<'r> Microphone<'r> {
    fn new(audio: CaptureConsumer<'r, i16, AUDIO_RING>) -> Self {
        Self {
            audio,
            frame: [0; AUDIO_FRAME],
        }
    }
}

impl Sensor<SimBus> for Microphone<'_> {
    async fn init(&mut self, _bus: &mut SimBus) -> Result<(), SensorError> {
        self.audio.clear();
        Ok(())
    }

    async fn read(&mut self, _bus: &mut SimBus, out: &mut Sample) -> Result<(), SensorError> {
        if self.audio.take_overflow() {
            warn!("mic: capture ring overflowed, oldest audio dropped");
        }

        let mut sum_sq = 0f64;
        let mut peak = 0u16;
        let mut count = 0usize;
        for _ in 0..AUDIO_RING / AUDIO_FRAME {
            match self.audio.pop(&mut self.frame) {
                Ok(()) => {}
                Err(CaptureError::Insufficient { .. }) => break,
                Err(e) => {
                    warn!("mic: {}", e);
                    break;
                }
            }
            for &s in &self.frame {
                sum_sq += f64::from(s) * f64::from(s);
                peak = peak.max(s.unsigned_abs());
            }
            count += AUDIO_FRAME;
        }
        if count == 0 {
            return Err(SensorError::NoData);
        }

        let rms = (sum_sq / count as f64).sqrt() as f32;
        out.write_f32s(&[rms, f32::from(peak)])
    }

    fn print(name: &str, sample: &Sample) {
        match (sample.f32_at(0), sample.f32_at(1)) {
            (Some(rms), Some(peak)) => info!("  {}: rms {:.0}, peak {:.0}", name, rms, peak),
            _ => info!("  {}: (no data)", name),
        }
    }
}

/// Simulated PDM interrupt: pushes one block of audio every 10 ms until
/// `stop` is raised, plus an optional one-off burst of `burst_ms` of silence. The signal is a breathing-modulated tone with the
/// occasional snore.
fn pdm_interrupt<const N: usize>(
    mut producer: CaptureProducer<'_, i16, N>,
    stop: &AtomicBool,
    burst_ms: u64,
) {
    let mut block = [0i16; AUDIO_BLOCK];
    let mut n: u64 = 0;
    let mut overflows = 0u32;
    let mut burst_done = burst_ms == 0;

    while !stop.load(Ordering::Relaxed) {
        for s in block.iter_mut() {
            let t = n as f32 / AUDIO_RATE_HZ as f32;
            let breath = 0.5 + 0.5 * (t * core::f32::consts::TAU / 4.0).sin();
            let snore = if (t % 12.0) < 1.5 { 6000.0 } else { 0.0 };
            let tone = (t * core::f32::consts::TAU * 140.0).sin();
            *s = ((800.0 + snore) * breath * tone) as i16;
            n += 1;
        }
        if producer.write(&block) {
            overflows += 1;
        }

        if !burst_done && n >= 2 * AUDIO_RATE_HZ as u64 {
            burst_done = true;
            block.fill(0);
            for _ in 0..burst_ms / 10 {
                if producer.write(&block) {
                    overflows += 1;
                }
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    info!("pdm: stopped after {} samples, {} overflowing writes", n, overflows);
}

// ---------------------------------------------------------------------------
// Upload link
// ---------------------------------------------------------------------------

/// In-memory stand-in for the BLE UART: collects everything written.
struct MemLink {
    connected: bool,
    received: Vec<u8>,
    writes: u32,
}

impl ErrorType for MemLink {
    type Error = ErrorKind;
}

impl Write for MemLink {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if !self.connected {
            return Err(ErrorKind::NotConnected);
        }
        self.received.extend_from_slice(buf);
        self.writes += 1;
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl UploadLink for MemLink {
    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ---------------------------------------------------------------------------
// Task plumbing
// ---------------------------------------------------------------------------

type TaskFuture<'a> = Pin<Box<dyn Future<Output = ()> + 'a>>;

/// Run `fut` until `deadline`, then drop it.
fn until<'a, F: Future + 'a>(deadline: Instant, fut: F) -> TaskFuture<'a> {
    Box::pin(async move {
        let _ = select(fut, Timer::at(deadline)).await;
    })
}

/// Registers sensors and queues each one's task, logging into `sink` when
/// there is one, to run until `deadline`.
struct Launcher<'a, 's, B, const N: usize> {
    registry: &'a SensorRegistry<N>,
    bus: &'a BusArbiter<B>,
    sink: Option<&'a dyn SampleSink>,
    tasks: &'s RefCell<Vec<TaskFuture<'a>>>,
    deadline: Instant,
}

impl<'a, B: 'a, const N: usize> Launcher<'a, '_, B, N> {
    async fn start<S>(&self, name: &str, sensor: S, freq_hz: f32) -> Result<usize, RegistryError>
    where
        S: Sensor<B> + 'a,
    {
        self.registry
            .register(name, sensor, self.bus, freq_hz, true, |task| {
                let task = match self.sink {
                    Some(sink) => task.with_sink(sink),
                    None => task,
                };
                self.tasks.borrow_mut().push(until(self.deadline, task.run()));
                Ok::<(), Infallible>(())
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = DeviceConfig::default();
    if let Some(ms) = args.flush_ms {
        config.storage.flush_interval_ms = ms;
    }
    if let Some(len) = args.chunk_len {
        config.upload.chunk_len = len;
    }
    // Boot the way the device does: from the persisted blob.
    let config = match config.encode() {
        Ok(blob) => DeviceConfig::load_or_default(&blob),
        Err(e) => {
            error!("config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.validate() {
        error!("config: {}", e);
        return ExitCode::FAILURE;
    }

    let flash = RamFlash::<SECTOR_SIZE>::new(
        (config.storage.region_base + config.storage.region_len) as usize,
    );
    let store = match PersistentLogStore::init(&config.storage, flash) {
        Ok(store) => Some(store),
        Err(e @ StorageError::Allocation { .. }) => {
            warn!("log store: {}, running without persistence", e);
            None
        }
        Err(e) => {
            error!("log store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut ring: CaptureRing<i16, AUDIO_RING> = CaptureRing::new();
    let (producer, consumer) = ring.split();
    let stop = AtomicBool::new(false);

    let outcome = std::thread::scope(|s| {
        s.spawn(|| pdm_interrupt(producer, &stop, args.audio_burst_ms));
        let outcome = simulate(&args, &config, store.as_ref(), consumer);
        stop.store(true, Ordering::Relaxed);
        outcome
    });
    let names = match outcome {
        Ok(names) => names,
        Err(code) => return code,
    };

    let Some(store) = store else {
        info!("no log to upload");
        return ExitCode::SUCCESS;
    };

    let mut link = MemLink {
        connected: true,
        received: Vec::new(),
        writes: 0,
    };
    match block_on(store.upload(&mut link, &config.upload)) {
        Ok(summary) => info!(
            "upload: {} chunks, {} bytes in {} link writes",
            summary.chunks, summary.bytes, link.writes
        ),
        Err(e) => {
            error!("upload: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let mut receiver = ChunkAssembler::new();
    if let Err(e) = receiver.push(&link.received) {
        error!("receiver: {}", e);
        return ExitCode::FAILURE;
    }
    summarize(&receiver, &names);

    let stats = block_on(store.stats());
    info!(
        "log: write_ptr={:#x} appended={} evicted={} flushed={}B wraps={}",
        stats.write_ptr, stats.appended, stats.evicted, stats.flushed_bytes, stats.wraps
    );
    ExitCode::SUCCESS
}

/// Register every sensor and run the scheduler until the configured time is
/// up. Returns the sensor names by index.
fn simulate(
    args: &Args,
    config: &DeviceConfig,
    store: Option<&PersistentLogStore<RamFlash<SECTOR_SIZE>>>,
    audio: CaptureConsumer<'_, i16, AUDIO_RING>,
) -> Result<Vec<String>, ExitCode> {
    let registry: SensorRegistry<MAX_SENSORS> =
        SensorRegistry::with_bus_timeout(config.scheduler.bus_timeout());
    let bus = BusArbiter::new(SimBus::default());

    let start = Instant::now();
    let run_for = Duration::from_secs(args.seconds);
    let deadline = start + run_for;
    let halfway = start + run_for / 2;

    let tasks = RefCell::new(Vec::new());
    let launcher = Launcher {
        registry: &registry,
        bus: &bus,
        sink: store.map(|s| s as &dyn SampleSink),
        tasks: &tasks,
        deadline,
    };
    let registered = block_on(async {
        let temp = launcher.start("temp", Thermometer, 1.0).await?;
        let primary = PulseOximeter {
            quality: 0.92,
            spo2_offset: 0.0,
            plugged_at: None,
        };
        let spo2_a = launcher.start("spo2", primary, 0.2).await?;
        let secondary = PulseOximeter {
            quality: 0.7,
            spo2_offset: -1.5,
            plugged_at: args.unplugged_oximeter.then_some(halfway),
        };
        let spo2_b = launcher.start("spo2_2", secondary, 0.2).await?;
        let imu = launcher.start("imu", Imu, 1.0).await?;
        launcher.start("battery", Battery, 0.5).await?;
        launcher.start("mic", Microphone::new(audio), 2.0).await?;
        let fusion = Spo2Fusion::new(
            &registry,
            [spo2_a, spo2_b],
            FusionCombiner::from_config(&config.fusion),
        );
        launcher.start("spo2_fused", fusion, 0.2).await?;
        Ok::<_, RegistryError>((temp, imu))
    });
    let (temp, imu) = match registered {
        Ok(indices) => indices,
        Err(e) => {
            error!("registration failed: {}", e);
            return Err(ExitCode::FAILURE);
        }
    };
    let names: Vec<String> = (0..registry.len())
        .filter_map(|i| registry.snapshot(i))
        .map(|s| s.name.as_str().to_owned())
        .collect();

    let mut futures = tasks.into_inner();
    if let Some(store) = store {
        futures.push(until(deadline, store.run_flush(config.storage.flush_interval())));
    }
    if config.scheduler.print_period_ms > 0 {
        futures.push(until(deadline, async {
            let mut ticker =
                Ticker::every(Duration::from_millis(config.scheduler.print_period_ms as u64));
            loop {
                ticker.next().await;
                info!("--- sensors at {:.1}s ---", uptime_secs());
                registry.print_all();
            }
        }));
    }
    // At the halfway mark the temperature sensor speeds up and the IMU pauses
    // for a few seconds.
    futures.push(until(deadline, async {
        Timer::at(halfway).await;
        if let Err(e) = registry.set_frequency(temp, 2.0) {
            warn!("control: {}", e);
        }
        if let Err(e) = registry.disable(imu) {
            warn!("control: {}", e);
        }
        Timer::after_secs(3).await;
        if let Err(e) = registry.enable(imu) {
            warn!("control: {}", e);
        }
    }));

    block_on(join_all(futures));

    let skipped: u32 = (0..registry.len())
        .filter_map(|i| registry.snapshot(i))
        .map(|s| s.bus_skips)
        .sum();
    let timeouts = bus.timeouts();
    if let Some(sim) = bus.try_lock() {
        info!(
            "bus: {} transactions, {} lock timeouts, {} skipped cycles",
            sim.transactions, timeouts, skipped
        );
    }
    Ok(names)
}

/// Receiver-side view of the uploaded log.
fn summarize(receiver: &ChunkAssembler, names: &[String]) {
    let mut counts = vec![0u32; names.len()];
    let mut first_ts = None;
    let mut last_ts = 0;
    let mut last_fused = None;

    for record in receiver.records() {
        if let Some(count) = counts.get_mut(record.sensor_index as usize) {
            *count += 1;
        }
        first_ts.get_or_insert(record.timestamp);
        last_ts = record.timestamp;
        if names
            .get(record.sensor_index as usize)
            .is_some_and(|n| n == "spo2_fused")
        {
            last_fused = Some(record);
        }
    }

    info!(
        "receiver: {} chunks, {} bytes, {} pending",
        receiver.chunks(),
        receiver.data().len(),
        receiver.pending()
    );
    info!(
        "receiver: records span {} ms .. {} ms",
        first_ts.unwrap_or(0),
        last_ts
    );
    for (name, count) in names.iter().zip(&counts) {
        info!("  {:<12} {:>6} records", name, count);
    }
    if let Some(record) = last_fused {
        let sample = Sample {
            payload: record.payload,
            timestamp: record.timestamp,
        };
        <Spo2Fusion<'_, MAX_SENSORS> as Sensor<SimBus>>::print("last fused", &sample);
    }
}
