//! Everything to do with ADS notifications: attributes, parsing and
//! encoding of notification messages, and dispatching samples to the
//! registered callbacks.

use std::collections::HashMap;
use std::convert::{TryFrom, TryInto};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, ReadBytesExt, LE};
use log::{debug, warn};

use crate::codec::DecodeError;
use crate::{lock, AmsAddr, Result};

/// A handle to the notification; this can be used to delete the notification later.
pub type Handle = u32;

/// Attributes for creating a notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    /// Length of data the notification is interested in.
    pub length: usize,
    /// When notification messages should be transmitted.
    pub trans_mode: TransmissionMode,
    /// The maximum delay between change and transmission.
    pub max_delay: Duration,
    /// The cycle time for checking for changes.
    pub cycle_time: Duration,
}

impl Attributes {
    /// Return new notification attributes.
    pub fn new(
        length: usize,
        trans_mode: TransmissionMode,
        max_delay: Duration,
        cycle_time: Duration,
    ) -> Self {
        Self { length, trans_mode, max_delay, cycle_time }
    }
}

/// When notifications should be generated.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmissionMode {
    /// No transmission.
    NoTrans = 0,
    /// Notify each client cycle.
    ClientCycle = 1,
    /// Notify once on client request.
    Client1Req = 2,
    /// Notify each server cycle.
    ServerCycle = 3,
    /// Notify when the content changes.
    ServerOnChange = 4,
}

impl TryFrom<u32> for TransmissionMode {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        Ok(match value {
            0 => Self::NoTrans,
            1 => Self::ClientCycle,
            2 => Self::Client1Req,
            3 => Self::ServerCycle,
            4 => Self::ServerOnChange,
            _ => return Err(value),
        })
    }
}

/// Where a notification is placed on the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    /// Index group and index offset.
    Index(u32, u32),
    /// A symbol name; a symbol handle is acquired for the notification's
    /// lifetime.
    Symbol(String),
}

/// An active notification, as returned by `Device::add_notification`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subscription {
    /// The device the notification lives on.
    pub target: AmsAddr,
    /// Handle assigned by the device.
    pub handle: Handle,
    /// Handle passed to the callback.
    pub user_handle: u32,
}

/// 1970-01-01 expressed as a Windows FILETIME.
pub const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;
const TICKS_PER_SEC: u64 = 10_000_000;

fn ticks_of(duration: Duration) -> u64 {
    duration
        .as_secs()
        .saturating_mul(TICKS_PER_SEC)
        .saturating_add(u64::from(duration.subsec_nanos() / 100))
}

fn duration_of(ticks: u64) -> Duration {
    Duration::from_secs(ticks / TICKS_PER_SEC) + Duration::from_nanos((ticks % TICKS_PER_SEC) * 100)
}

/// Convert a FILETIME (100 ns ticks since 1601-01-01 UTC) to a `SystemTime`.
pub fn filetime_to_system_time(filetime: u64) -> SystemTime {
    if filetime >= FILETIME_UNIX_EPOCH {
        UNIX_EPOCH + duration_of(filetime - FILETIME_UNIX_EPOCH)
    } else {
        UNIX_EPOCH
            .checked_sub(duration_of(FILETIME_UNIX_EPOCH - filetime))
            .unwrap_or(UNIX_EPOCH)
    }
}

/// Convert a `SystemTime` to a FILETIME, saturating at the ends of the range.
pub fn system_time_to_filetime(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => FILETIME_UNIX_EPOCH.saturating_add(ticks_of(after)),
        Err(before) => FILETIME_UNIX_EPOCH.saturating_sub(ticks_of(before.duration())),
    }
}

/// A notification message from the ADS server.
///
/// The message is validated completely when parsed.
pub struct Notification {
    source: AmsAddr,
    data: Vec<u8>,
    nstamps: u32,
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Notification from {} [", self.source)?;
        for sample in self.samples() {
            writeln!(f, "    {:?}", sample)?;
        }
        write!(f, "]")
    }
}

fn read_u32(ptr: &mut &[u8]) -> std::result::Result<u32, DecodeError> {
    let available = ptr.len();
    ptr.read_u32::<LE>()
        .map_err(|_| DecodeError::TruncatedFrame { needed: 4, available })
}

fn read_u64(ptr: &mut &[u8]) -> std::result::Result<u64, DecodeError> {
    let available = ptr.len();
    ptr.read_u64::<LE>()
        .map_err(|_| DecodeError::TruncatedFrame { needed: 8, available })
}

impl Notification {
    /// Parse the payload of a notification message sent by `source`.
    pub fn parse(source: AmsAddr, payload: Vec<u8>) -> std::result::Result<Self, DecodeError> {
        let mut ptr = &payload[..];
        let length = read_u32(&mut ptr)?;
        if length as usize != ptr.len() {
            return Err(DecodeError::InvalidValue("notification length", length));
        }
        let nstamps = read_u32(&mut ptr)?;
        for _ in 0..nstamps {
            let _timestamp = read_u64(&mut ptr)?;
            let nsamples = read_u32(&mut ptr)?;
            for _ in 0..nsamples {
                let _handle = read_u32(&mut ptr)?;
                let size = read_u32(&mut ptr)? as usize;
                if ptr.len() < size {
                    return Err(DecodeError::TruncatedFrame { needed: size, available: ptr.len() });
                }
                ptr = &ptr[size..];
            }
        }
        if !ptr.is_empty() {
            return Err(DecodeError::InvalidValue("notification trailing bytes", ptr.len() as u32));
        }
        Ok(Self { source, data: payload, nstamps })
    }

    /// The device that sent the notification.
    pub fn source(&self) -> AmsAddr {
        self.source
    }

    /// Return an iterator over all data samples in this notification.
    pub fn samples(&self) -> SampleIter<'_> {
        SampleIter {
            data: &self.data[8..],
            cur_timestamp: 0,
            stamps_left: self.nstamps,
            samples_left: 0,
        }
    }
}

/// A single sample in a notification message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample<'a> {
    /// The notification handle associated with the data.
    pub handle: Handle,
    /// Timestamp of generation (FILETIME: 100 ns ticks since 1601-01-01).
    pub timestamp: u64,
    /// Data of the handle at the specified time.
    pub data: &'a [u8],
}

impl Sample<'_> {
    /// The timestamp as `SystemTime`.
    pub fn system_time(&self) -> SystemTime {
        filetime_to_system_time(self.timestamp)
    }
}

/// An iterator over all samples within a notification message.
pub struct SampleIter<'a> {
    data: &'a [u8],
    cur_timestamp: u64,
    stamps_left: u32,
    samples_left: u32,
}

impl<'a> Iterator for SampleIter<'a> {
    type Item = Sample<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        // The layout was checked in `Notification::parse`.
        loop {
            if self.samples_left > 0 {
                let handle = self.data.read_u32::<LE>().ok()?;
                let length = self.data.read_u32::<LE>().ok()? as usize;
                if self.data.len() < length {
                    return None;
                }
                let (data, rest) = self.data.split_at(length);
                self.data = rest;
                self.samples_left -= 1;
                return Some(Sample { handle, data, timestamp: self.cur_timestamp });
            } else if self.stamps_left > 0 {
                self.cur_timestamp = self.data.read_u64::<LE>().ok()?;
                self.samples_left = self.data.read_u32::<LE>().ok()?;
                self.stamps_left -= 1;
            } else {
                return None;
            }
        }
    }
}

/// Builds the payload of a notification message.
///
/// ```ignore
/// let mut writer = NotificationWriter::new();
/// writer.stamp(timestamp);
/// writer.sample(handle, &[1, 2, 3, 4])?;
/// let payload = writer.finish()?;
/// ```
#[derive(Debug, Default)]
pub struct NotificationWriter {
    data: Vec<u8>,
    nstamps: u32,
    // offset of the current stamp's sample count
    stamp_pos: Option<usize>,
    nsamples: u32,
}

impl NotificationWriter {
    pub fn new() -> Self {
        Self { data: vec![0; 8], ..Self::default() }
    }

    fn close_stamp(&mut self) {
        if let Some(pos) = self.stamp_pos.take() {
            LE::write_u32(&mut self.data[pos..], self.nsamples);
        }
    }

    /// Start a new stamp; following samples belong to it.
    pub fn stamp(&mut self, timestamp: u64) -> &mut Self {
        self.close_stamp();
        self.data.extend_from_slice(&timestamp.to_le_bytes());
        self.stamp_pos = Some(self.data.len());
        self.data.extend_from_slice(&[0; 4]);
        self.nstamps += 1;
        self.nsamples = 0;
        self
    }

    /// Add a sample to the current stamp, starting one with timestamp 0 if
    /// there is none.
    pub fn sample(&mut self, handle: Handle, data: &[u8]) -> Result<&mut Self> {
        if self.stamp_pos.is_none() {
            self.stamp(0);
        }
        let size: u32 = data.len().try_into()?;
        self.data.extend_from_slice(&handle.to_le_bytes());
        self.data.extend_from_slice(&size.to_le_bytes());
        self.data.extend_from_slice(data);
        self.nsamples += 1;
        Ok(self)
    }

    /// Return the finished payload.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.close_stamp();
        let length: u32 = (self.data.len() - 4).try_into()?;
        LE::write_u32(&mut self.data[..4], length);
        LE::write_u32(&mut self.data[4..8], self.nstamps);
        Ok(self.data)
    }
}

/// A notification callback, receiving the sample and the user handle.
pub type Callback = Box<dyn FnMut(&Sample<'_>, u32) + Send>;

/// A registered notification.
pub(crate) struct Registration {
    pub target: AmsAddr,
    pub user_handle: u32,
    pub location: Location,
    pub attributes: Attributes,
    /// Symbol handle acquired for a `Location::Symbol`, released together
    /// with the notification.
    pub symbol_handle: Option<u32>,
    callback: Mutex<Callback>,
}

impl Registration {
    pub fn new(
        target: AmsAddr,
        user_handle: u32,
        location: Location,
        attributes: Attributes,
        symbol_handle: Option<u32>,
        callback: Callback,
    ) -> Self {
        Self {
            target,
            user_handle,
            location,
            attributes,
            symbol_handle,
            callback: Mutex::new(callback),
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("target", &self.target)
            .field("user_handle", &self.user_handle)
            .field("location", &self.location)
            .field("attributes", &self.attributes)
            .field("symbol_handle", &self.symbol_handle)
            .finish()
    }
}

/// Delivers notification samples to registered callbacks.
///
/// Registrations are keyed by the device address and the device-assigned
/// handle.  Callbacks run on the thread calling `dispatch`, one at a time.
pub struct Dispatcher {
    registry: Mutex<HashMap<(AmsAddr, Handle), Arc<Registration>>>,
    next_user_handle: AtomicU32,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            next_user_handle: AtomicU32::new(1),
        }
    }

    /// Mint a new user handle (never 0).
    pub fn mint_user_handle(&self) -> u32 {
        loop {
            let handle = self.next_user_handle.fetch_add(1, Ordering::Relaxed);
            if handle != 0 {
                return handle;
            }
        }
    }

    pub(crate) fn insert(&self, handle: Handle, registration: Registration) {
        let key = (registration.target, handle);
        if let Some(old) = lock(&self.registry).insert(key, Arc::new(registration)) {
            warn!("notification {} on {} registered twice, replaced {:?}", handle, key.0, old);
        }
    }

    pub(crate) fn remove(&self, target: AmsAddr, handle: Handle) -> Option<Arc<Registration>> {
        lock(&self.registry).remove(&(target, handle))
    }

    /// Remove and return all registrations.
    pub(crate) fn drain(&self) -> Vec<((AmsAddr, Handle), Arc<Registration>)> {
        lock(&self.registry).drain().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.registry).is_empty()
    }

    /// All active registrations.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.registry)
            .iter()
            .map(|(&(target, handle), reg)| Subscription {
                target,
                handle,
                user_handle: reg.user_handle,
            })
            .collect()
    }

    /// Call the callbacks for all samples in the notification, in order.
    ///
    /// Samples for unknown handles are dropped.  Returns the number of
    /// callbacks that ran to completion.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        let source = notification.source();
        let mut delivered = 0;
        for sample in notification.samples() {
            let registration = lock(&self.registry).get(&(source, sample.handle)).cloned();
            let registration = match registration {
                Some(reg) => reg,
                None => {
                    debug!("dropping sample for unknown notification {} from {}", sample.handle, source);
                    continue;
                }
            };
            let mut callback = lock(&registration.callback);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                (*callback)(&sample, registration.user_handle)
            }));
            match result {
                Ok(()) => delivered += 1,
                Err(_) => warn!(
                    "callback for notification {} on {} panicked",
                    sample.handle, source
                ),
            }
        }
        delivered
    }
}
