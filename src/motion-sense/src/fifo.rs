//! Sample FIFO shared with the host.
//!
//! Producers stage entries past the committed tail and publish them with
//! [`SampleFifo::commit()`], so the host never observes a partial unit (a timestamp without its
//! sample, or half of an interrupt harvest). When space runs out the oldest entries are evicted,
//! committed ones first, and accounted as lost.

use crate::Vector;

/// Size of an encoded entry, in bytes.
pub const ENTRY_SIZE: usize = 8;

/// Sensor number of timestamp entries not tied to a sensor.
pub const NO_SENSOR: u8 = 0xff;

bitflags::bitflags! {
    /// Flags of a FIFO entry, as seen by the host.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        const FLUSH = 1 << 0;
        const TIMESTAMP = 1 << 1;
        const WAKEUP = 1 << 2;
        const TABLET_MODE = 1 << 3;
        const ODR = 1 << 4;
        const BYPASS_FIFO = 1 << 7;
    }
}

/// Marker events inserted in the FIFO.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AsyncEvent {
    /// The host asked for a flush of this sensor.
    Flush,
    /// The rate of this sensor changed.
    Odr,
}

impl AsyncEvent {
    const fn flags(self) -> EntryFlags {
        match self {
            Self::Flush => EntryFlags::FLUSH.union(EntryFlags::TIMESTAMP),
            Self::Odr => EntryFlags::ODR.union(EntryFlags::TIMESTAMP),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Payload {
    Vector([i16; 3]),
    Timestamp(u32),
    Activity {
        activity: u8,
        state: u8,
        add_info: [i16; 2],
    },
}

/// One FIFO entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Entry {
    pub flags: EntryFlags,
    pub sensor_num: u8,
    pub payload: Payload,
}

impl Entry {
    const EMPTY: Self = Self::timestamp(NO_SENSOR, 0);

    #[must_use]
    pub const fn timestamp(sensor_num: u8, timestamp: u32) -> Self {
        Self {
            flags: EntryFlags::TIMESTAMP,
            sensor_num,
            payload: Payload::Timestamp(timestamp),
        }
    }

    #[must_use]
    pub fn data(sensor_num: u8, xyz: Vector) -> Self {
        Self {
            flags: EntryFlags::empty(),
            sensor_num,
            payload: Payload::Vector(xyz.map(clamp_i16)),
        }
    }

    #[must_use]
    pub const fn async_event(sensor_num: u8, event: AsyncEvent, timestamp: u32) -> Self {
        Self {
            flags: event.flags(),
            sensor_num,
            payload: Payload::Timestamp(timestamp),
        }
    }

    /// Returns an activity state change, flagged to wake the host.
    #[must_use]
    pub const fn activity(sensor_num: u8, activity: u8, state: u8) -> Self {
        Self {
            flags: EntryFlags::WAKEUP,
            sensor_num,
            payload: Payload::Activity {
                activity,
                state,
                add_info: [0; 2],
            },
        }
    }

    #[must_use]
    pub fn is_timestamp(&self) -> bool {
        self.flags.contains(EntryFlags::TIMESTAMP)
    }

    /// Encodes the entry in the host wire format.
    #[must_use]
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0; ENTRY_SIZE];
        let (header, body) = out.split_at_mut(2);
        header.copy_from_slice(&[self.flags.bits(), self.sensor_num]);
        match self.payload {
            Payload::Vector(xyz) => {
                for (chunk, value) in body.chunks_exact_mut(2).zip(xyz) {
                    chunk.copy_from_slice(&value.to_le_bytes());
                }
            }
            Payload::Timestamp(timestamp) => {
                // Two reserved bytes precede the timestamp.
                if let Some(chunk) = body.get_mut(2..) {
                    chunk.copy_from_slice(&timestamp.to_le_bytes());
                }
            }
            Payload::Activity {
                activity,
                state,
                add_info,
            } => {
                let (head, tail) = body.split_at_mut(2);
                head.copy_from_slice(&[activity, state]);
                for (chunk, value) in tail.chunks_exact_mut(2).zip(add_info) {
                    chunk.copy_from_slice(&value.to_le_bytes());
                }
            }
        }
        out
    }
}

/// Whether wrapping timestamp `a` is after `b`.
fn time_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Saturates a driver reading to the 16 bits of the wire format.
#[must_use]
pub fn clamp_i16(value: i32) -> i16 {
    value.clamp(i16::MIN.into(), i16::MAX.into()) as i16
}

/// Queue statistics reported to the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FifoInfo<const N: usize> {
    /// Capacity, in entries.
    pub size: u16,
    /// Committed entries waiting to be read.
    pub count: u16,
    pub total_lost: u16,
    pub lost: [u16; N],
    /// Entries lost by the activity pseudo-sensor.
    pub activity_lost: u16,
}

/// Last timestamp given to a sensor and the one expected next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct NextTimestamp {
    prev: u32,
    next: u32,
}

/// FIFO of `CAP` entries fed by `N` sensors.
///
/// `CAP` must be a power of two.
///
/// With tight timestamps, samples of a sensor committed together are spread over its data
/// period so that a burst drained from a hardware FIFO does not carry a single timestamp.
#[derive(Debug)]
pub struct SampleFifo<const CAP: usize, const N: usize> {
    buffer: [Entry; CAP],
    reads: u32,
    committed: u32,
    writes: u32,
    tight_timestamps: bool,
    total_lost: u32,
    lost: [u16; N],
    activity_lost: u16,
    bypass_needed: bool,
    wake_up_needed: bool,
    /// Data periods in microseconds, as programmed.
    periods: [u32; N],
    next_timestamps: [Option<NextTimestamp>; N],
    /// Samples staged per sensor since the last commit.
    staged_samples: [u16; N],
    requires_spreading: bool,
    /// Time the current staging cycle was collected.
    read_timestamp: u32,
}

impl<const CAP: usize, const N: usize> SampleFifo<CAP, N> {
    const MASK: u32 = {
        assert!(CAP.is_power_of_two() && CAP <= 1 << 16);
        (CAP - 1) as u32
    };

    #[must_use]
    pub const fn new(tight_timestamps: bool) -> Self {
        Self {
            buffer: [Entry::EMPTY; CAP],
            reads: 0,
            committed: 0,
            writes: 0,
            tight_timestamps,
            total_lost: 0,
            lost: [0; N],
            activity_lost: 0,
            bypass_needed: false,
            wake_up_needed: false,
            periods: [0; N],
            next_timestamps: [None; N],
            staged_samples: [0; N],
            requires_spreading: false,
            read_timestamp: 0,
        }
    }

    /// Sets the data period of `sensor`, in microseconds, and restarts its timestamp tracking.
    pub fn set_data_period(&mut self, sensor: usize, period_us: u32) {
        if let Some(period) = self.periods.get_mut(sensor) {
            *period = period_us;
        }
        if let Some(next) = self.next_timestamps.get_mut(sensor) {
            *next = None;
        }
    }

    /// Sets the time the entries staged next were collected.
    ///
    /// Spread timestamps of a burst are kept at or before it.
    pub fn set_read_timestamp(&mut self, timestamp: u32) {
        self.read_timestamp = timestamp;
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Number of committed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.committed.wrapping_sub(self.reads) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of staged, not yet committed entries.
    #[must_use]
    pub fn staged(&self) -> usize {
        self.writes.wrapping_sub(self.committed) as usize
    }

    /// Free entries, from the host point of view.
    #[must_use]
    pub fn space(&self) -> usize {
        CAP - self.len()
    }

    #[must_use]
    pub fn over_threshold(&self, threshold: usize) -> bool {
        self.space() < threshold
    }

    #[must_use]
    pub fn bypass_needed(&self) -> bool {
        self.bypass_needed
    }

    #[must_use]
    pub fn wake_up_needed(&self) -> bool {
        self.wake_up_needed
    }

    /// Clears the notification flags once the host has been told.
    pub fn reset_needed_flags(&mut self) {
        self.bypass_needed = false;
        self.wake_up_needed = false;
    }

    /// Stages `entry`, preceded by its timestamp when tight timestamps are enabled.
    pub fn stage_unit(&mut self, entry: Entry, timestamp: u32) {
        if self.tight_timestamps && !entry.is_timestamp() {
            self.ensure_space(2);
            self.stage(Entry::timestamp(entry.sensor_num, timestamp));
            if let Some(count) = self.staged_samples.get_mut(usize::from(entry.sensor_num)) {
                *count = count.saturating_add(1);
                if *count > 1 {
                    self.requires_spreading = true;
                }
            }
        } else {
            self.ensure_space(1);
        }
        self.stage(entry);
    }

    /// Publishes all staged entries.
    ///
    /// Returns the number of entries committed.
    pub fn commit(&mut self) -> usize {
        let staged = self.staged();
        let periods = self.spread_periods();
        for offset in 0..staged as u32 {
            let index = self.committed.wrapping_add(offset);
            let Some(entry) = self.slot(index).copied() else {
                continue;
            };
            if entry.flags.contains(EntryFlags::WAKEUP) {
                self.wake_up_needed = true;
                self.bypass_needed = true;
            }
            if entry.flags.contains(EntryFlags::BYPASS_FIFO) {
                self.bypass_needed = true;
            }
            if self.tight_timestamps && !entry.is_timestamp() {
                self.respace(index, entry.sensor_num, &periods);
            }
        }
        self.committed = self.writes;
        self.staged_samples = [0; N];
        self.requires_spreading = false;
        staged
    }

    /// Data periods to spread the staged samples with.
    ///
    /// A burst is squeezed into the window between its first timestamp and the read timestamp
    /// when the programmed period would not fit.
    fn spread_periods(&mut self) -> [u32; N] {
        if !self.requires_spreading {
            return self.periods;
        }
        let first = self.slot(self.committed).copied();
        let Some(Entry {
            payload: Payload::Timestamp(first),
            ..
        }) = first.filter(Entry::is_timestamp)
        else {
            motion_sense_log::debug!("fifo: spreading skipped, first entry is not a timestamp");
            self.requires_spreading = false;
            return self.periods;
        };

        let window = u32::try_from(self.read_timestamp.wrapping_sub(first) as i32).unwrap_or(0);
        let mut periods = self.periods;
        for (period, count) in periods.iter_mut().zip(self.staged_samples) {
            if window > 0 && count > 1 {
                *period = (*period).min(window / u32::from(count - 1));
            }
        }
        periods
    }

    /// Rewrites the timestamp preceding the sample at `index`.
    ///
    /// A sample never gets a timestamp before the previous sample of its sensor plus a period.
    fn respace(&mut self, index: u32, sensor_num: u8, periods: &[u32; N]) {
        let sensor = usize::from(sensor_num);
        let (Some(period), Some(state)) =
            (periods.get(sensor).copied(), self.next_timestamps.get(sensor).copied())
        else {
            return;
        };
        let stamp = index.wrapping_sub(1);
        let timestamp = match self.slot(stamp).copied() {
            Some(Entry {
                flags,
                payload: Payload::Timestamp(timestamp),
                ..
            }) if flags == EntryFlags::TIMESTAMP && stamp.wrapping_sub(self.reads) < CAP as u32 => {
                timestamp
            }
            _ => {
                motion_sense_log::warn!("fifo: entries out of order, expected a timestamp");
                return;
            }
        };

        let spread = match state {
            Some(NextTimestamp { prev, next }) if !time_after(timestamp, prev) => next,
            _ => timestamp,
        };
        if time_after(spread, self.read_timestamp) && self.read_timestamp != 0 {
            motion_sense_log::warn!(
                "fifo: sensor {} timestamp {} is in the future of {}",
                sensor,
                spread,
                self.read_timestamp
            );
        }
        if let Some(slot) = self.next_timestamps.get_mut(sensor) {
            *slot = Some(NextTimestamp {
                prev: spread,
                next: spread.wrapping_add(period),
            });
        }
        if let Some(slot) = self.buffer.get_mut((stamp & Self::MASK) as usize) {
            *slot = Entry::timestamp(sensor_num, spread);
        }
    }

    /// Stages and commits a single timestamp entry.
    pub fn add_timestamp(&mut self, timestamp: u32) {
        self.stage_unit(Entry::timestamp(NO_SENSOR, timestamp), timestamp);
        self.commit();
    }

    /// Removes and returns the oldest committed entry.
    pub fn pop_committed(&mut self) -> Option<Entry> {
        if self.is_empty() {
            return None;
        }
        let entry = self.slot(self.reads).copied();
        self.reads = self.reads.wrapping_add(1);
        entry
    }

    /// Encodes up to `max_count` committed entries into `out`.
    ///
    /// Returns the number of entries written.
    pub fn read_into(&mut self, out: &mut [u8], max_count: usize) -> usize {
        let mut count = 0;
        for chunk in out.chunks_exact_mut(ENTRY_SIZE).take(max_count) {
            let Some(entry) = self.pop_committed() else {
                break;
            };
            chunk.copy_from_slice(&entry.encode());
            count += 1;
        }
        count
    }

    /// Returns the queue statistics, clearing the loss counters when `reset` is set.
    pub fn info(&mut self, reset: bool) -> FifoInfo<N> {
        let info = FifoInfo {
            size: u16::try_from(CAP).unwrap_or(u16::MAX),
            count: u16::try_from(self.len()).unwrap_or(u16::MAX),
            total_lost: u16::try_from(self.total_lost).unwrap_or(u16::MAX),
            lost: self.lost,
            activity_lost: self.activity_lost,
        };
        if reset {
            self.total_lost = 0;
            self.lost = [0; N];
            self.activity_lost = 0;
        }
        info
    }

    fn slot(&self, index: u32) -> Option<&Entry> {
        self.buffer.get((index & Self::MASK) as usize)
    }

    fn stage(&mut self, entry: Entry) {
        if let Some(slot) = self.buffer.get_mut((self.writes & Self::MASK) as usize) {
            *slot = entry;
            self.writes = self.writes.wrapping_add(1);
        }
    }

    /// Frees room for `needed` entries, then realigns the head on a timestamp.
    fn ensure_space(&mut self, needed: usize) {
        let used = self.writes.wrapping_sub(self.reads) as usize;
        if CAP.saturating_sub(used) >= needed {
            return;
        }
        while CAP.saturating_sub(self.writes.wrapping_sub(self.reads) as usize) < needed {
            if self.pop().is_none() {
                return;
            }
        }
        if self.tight_timestamps {
            while self.reads != self.writes
                && self.slot(self.reads).is_some_and(|head| !head.is_timestamp())
            {
                self.pop();
            }
        }
    }

    /// Evicts the oldest entry, committed or not.
    fn pop(&mut self) -> Option<Entry> {
        if self.reads == self.writes {
            return None;
        }
        let entry = self.slot(self.reads).copied()?;
        if self.reads == self.committed {
            self.committed = self.committed.wrapping_add(1);
        }
        self.reads = self.reads.wrapping_add(1);

        if !entry.is_timestamp() {
            self.total_lost = self.total_lost.saturating_add(1);
            let sensor = usize::from(entry.sensor_num);
            if let Some(lost) = self.lost.get_mut(sensor) {
                *lost = lost.saturating_add(1);
            } else if sensor == N {
                self.activity_lost = self.activity_lost.saturating_add(1);
            }
        }
        // Losing a wake-up entry must still wake the host.
        if entry.flags.contains(EntryFlags::WAKEUP) {
            self.wake_up_needed = true;
            self.bypass_needed = true;
        }
        Some(entry)
    }
}
