//! End-to-end scheduling and logging scenarios on the host time driver.

use std::cell::RefCell;

use embassy_futures::block_on;
use embassy_futures::select::select3;
use embassy_time::{Duration, Timer};
use sleepsense_core::bus::BusArbiter;
use sleepsense_core::config::StorageConfig;
use sleepsense_core::sensors::{Sample, Sensor, SensorError, SensorRegistry, SensorTask};
use sleepsense_core::storage::{LogRecord, PersistentLogStore, RamFlash, RecordReader};

/// Always reports the same two bytes.
struct TwoBytes;

impl Sensor<()> for TwoBytes {
    async fn init(&mut self, _bus: &mut ()) -> Result<(), SensorError> {
        Ok(())
    }

    async fn read(&mut self, _bus: &mut (), out: &mut Sample) -> Result<(), SensorError> {
        out.payload
            .extend_from_slice(&[0xA1, 0xB2])
            .map_err(|_| SensorError::PayloadTooLarge { len: 2 })
    }
}

fn storage_config(flush_interval_ms: u32) -> StorageConfig {
    StorageConfig {
        region_base: 0,
        region_len: 64 * 1024,
        staging_capacity: 4096,
        flush_interval_ms,
    }
}

#[test]
fn one_hz_sensor_lands_in_flash() {
    let registry: SensorRegistry<4> = SensorRegistry::new();
    let bus = BusArbiter::new(());
    let config = storage_config(1500);
    let store = PersistentLogStore::init(&config, RamFlash::<4096>::new(64 * 1024)).unwrap();

    let spawned: RefCell<Option<SensorTask<'_, (), TwoBytes, 4>>> = RefCell::new(None);
    let index = block_on(registry.register("pair", TwoBytes, &bus, 1.0, true, |task| {
        *spawned.borrow_mut() = Some(task);
        Ok::<(), ()>(())
    }))
    .unwrap();
    let task = spawned.borrow_mut().take().unwrap().with_sink(&store);

    block_on(async {
        let checks = async {
            Timer::after_millis(1100).await;
            let last = registry.get_last(index).unwrap();
            assert_eq!(last.len(), 2);

            // First periodic flush fires at 1500 ms.
            Timer::after_millis(700).await;
            let head = store.with_flash(|f| f.bytes()[..16].to_vec()).await;
            let (first, used) = LogRecord::decode(&head).unwrap();
            assert_eq!(used, 8);
            assert_eq!(&head[4..8], &[index as u8, 2, 0xA1, 0xB2]);
            assert!(first.timestamp <= last.timestamp);
        };
        select3(task.run(), store.run_flush(config.flush_interval()), checks).await;
    });
}

#[test]
fn cached_timestamps_never_go_backwards() {
    let registry: SensorRegistry<1> = SensorRegistry::new();
    let bus = BusArbiter::new(());
    let spawned = RefCell::new(None);
    block_on(registry.register("pair", TwoBytes, &bus, 100.0, true, |task| {
        *spawned.borrow_mut() = Some(task);
        Ok::<(), ()>(())
    }))
    .unwrap();
    let mut task: SensorTask<'_, (), TwoBytes, 1> = spawned.borrow_mut().take().unwrap();

    let mut previous = 0;
    for _ in 0..5 {
        block_on(task.cycle());
        let last = registry.get_last(0).unwrap();
        assert!(last.timestamp >= previous);
        previous = last.timestamp;
        block_on(Timer::after(Duration::from_millis(3)));
    }
}

#[test]
fn flushed_region_is_the_concatenation_of_appends() {
    let store = PersistentLogStore::init(&storage_config(60_000), RamFlash::<4096>::new(64 * 1024)).unwrap();

    let mut expected = Vec::new();
    for i in 0..50u32 {
        let payload: Vec<u8> = (0..(i % 7) as u8 + 1).map(|b| b.wrapping_mul(37)).collect();
        let sample = Sample::from_bytes(&payload, 1000 + i).unwrap();
        store.append((i % 5) as u8, &sample).unwrap();

        let record = LogRecord::from_sample((i % 5) as u8, &sample);
        expected.extend_from_slice(&record.header());
        expected.extend_from_slice(&record.payload);
    }
    block_on(store.flush()).unwrap();

    let stats = block_on(store.stats());
    assert_eq!(stats.write_ptr as usize, expected.len());
    let flash = block_on(store.with_flash(|f| f.bytes().to_vec()));
    assert_eq!(&flash[..expected.len()], &expected[..]);
    assert_eq!(RecordReader::new(&flash[..expected.len()]).count(), 50);
    assert_eq!(flash[expected.len()], 0xFF);
}
