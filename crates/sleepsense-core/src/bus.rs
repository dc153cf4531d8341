//! Shared bus arbitration
//!
//! A [`BusArbiter`] owns one physical communication peripheral (the I2C bus
//! the temperature, SpO2 and IMU parts hang off) behind Embassy's async
//! `Mutex`. Every acquisition is bounded: a caller that cannot get the bus in
//! time gets `None` back and is expected to skip its work for this cycle.
//!
//! Independent physical buses get independent arbiters.

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::{Duration, with_timeout};
use embedded_hal::i2c::{Error, ErrorKind};
use embedded_hal_async::i2c::{ErrorType, I2c, Operation};
use log::warn;

/// Default bound on how long a sensor cycle waits for the bus.
pub const DEFAULT_BUS_TIMEOUT: Duration = Duration::from_millis(100);

/// Exclusive hold on the bus. Dropping it releases the bus.
pub type BusGuard<'a, T> = MutexGuard<'a, CriticalSectionRawMutex, T>;

/// Mutex serializing access to a shared communication peripheral.
///
/// The arbiter is not reentrant: a task already holding a [`BusGuard`] that
/// calls [`BusArbiter::lock`] again will simply time out.
pub struct BusArbiter<T> {
    bus: Mutex<CriticalSectionRawMutex, T>,
    timeouts: AtomicU32,
}

impl<T> BusArbiter<T> {
    /// Wrap a bus peripheral. `const` so arbiters can live in statics.
    pub const fn new(bus: T) -> Self {
        Self {
            bus: Mutex::new(bus),
            timeouts: AtomicU32::new(0),
        }
    }

    /// Wait at most `timeout` for exclusive access.
    ///
    /// A waiter that gives up leaves nothing behind: the pending lock future
    /// is dropped before it ever owned the bus, so the next caller can lock
    /// normally.
    pub async fn lock(&self, timeout: Duration) -> Option<BusGuard<'_, T>> {
        match with_timeout(timeout, self.bus.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Take the bus only if nobody holds it right now.
    pub fn try_lock(&self) -> Option<BusGuard<'_, T>> {
        self.bus.try_lock().ok()
    }

    /// Number of acquisitions that gave up since boot.
    pub fn timeouts(&self) -> u32 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

/// Error returned by [`SharedI2c`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedBusError<E> {
    /// The arbiter could not be acquired within the device's timeout.
    Busy,
    /// The underlying bus reported an error.
    Bus(E),
}

impl<E: Error> Error for SharedBusError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Busy => ErrorKind::Other,
            Self::Bus(e) => e.kind(),
        }
    }
}

/// Async I2C device handle for collaborators outside the sensor tasks.
///
/// Each transaction takes the arbiter with a bounded wait, so a driver that
/// shares the bus with the periodic sensor tasks can never stall them for
/// longer than one transaction.
///
/// # Example
///
/// ```ignore
/// static I2C_BUS: StaticCell<BusArbiter<I2c<'static, Async>>> = StaticCell::new();
///
/// let bus = I2C_BUS.init(BusArbiter::new(i2c));
/// let mut pmic = Pmic::new(SharedI2c::new(bus, DEFAULT_BUS_TIMEOUT));
/// ```
pub struct SharedI2c<'a, T> {
    bus: &'a BusArbiter<T>,
    timeout: Duration,
}

impl<'a, T> SharedI2c<'a, T> {
    /// Create a new `SharedI2c` that waits at most `timeout` per transaction.
    #[inline]
    pub const fn new(bus: &'a BusArbiter<T>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    async fn acquire(&self) -> Result<BusGuard<'a, T>, SharedBusError<T::Error>>
    where
        T: ErrorType,
    {
        self.bus.lock(self.timeout).await.ok_or_else(|| {
            warn!("shared i2c: bus busy for {} ms", self.timeout.as_millis());
            SharedBusError::Busy
        })
    }
}

impl<T> ErrorType for SharedI2c<'_, T>
where
    T: ErrorType,
{
    type Error = SharedBusError<T::Error>;
}

impl<T> I2c for SharedI2c<'_, T>
where
    T: I2c,
{
    #[inline]
    async fn read(&mut self, address: u8, read: &mut [u8]) -> Result<(), Self::Error> {
        let mut bus = self.acquire().await?;
        bus.read(address, read).await.map_err(SharedBusError::Bus)
    }

    #[inline]
    async fn write(&mut self, address: u8, write: &[u8]) -> Result<(), Self::Error> {
        let mut bus = self.acquire().await?;
        bus.write(address, write).await.map_err(SharedBusError::Bus)
    }

    #[inline]
    async fn write_read(
        &mut self,
        address: u8,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), Self::Error> {
        let mut bus = self.acquire().await?;
        bus.write_read(address, write, read)
            .await
            .map_err(SharedBusError::Bus)
    }

    #[inline]
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut bus = self.acquire().await?;
        bus.transaction(address, operations)
            .await
            .map_err(SharedBusError::Bus)
    }
}
