//! Tests for notification parsing, timestamps and dispatching.

use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};

use crate::codec::DecodeError;
use crate::notif::*;
use crate::{AmsAddr, AmsNetId};

const STAMP_1: u64 = 128_930_364_000_000_000;
const STAMP_2: u64 = STAMP_1 + 10_000_000;

fn device() -> AmsAddr {
    AmsAddr::new(AmsNetId::new(1, 2, 3, 4, 5, 6), 851)
}

fn payload() -> Vec<u8> {
    let mut writer = NotificationWriter::new();
    writer.stamp(STAMP_1);
    writer.sample(7, &[1]).unwrap().sample(8, &[2, 2]).unwrap().sample(9, &[3]).unwrap();
    writer.stamp(STAMP_2).sample(7, &[4]).unwrap();
    writer.finish().unwrap()
}

fn registration(user_handle: u32, callback: Callback) -> Registration {
    Registration::new(
        device(),
        user_handle,
        Location::Index(0x4020, 0),
        Attributes::new(1, TransmissionMode::ServerOnChange, Duration::ZERO, Duration::ZERO),
        None,
        callback,
    )
}

#[test]
fn test_filetime() {
    let time = filetime_to_system_time(STAMP_1);
    assert_eq!(DateTime::<Utc>::from(time), Utc.with_ymd_and_hms(2009, 7, 25, 23, 0, 0).unwrap());
    assert_eq!(system_time_to_filetime(time), STAMP_1);

    assert_eq!(filetime_to_system_time(FILETIME_UNIX_EPOCH), UNIX_EPOCH);
    assert_eq!(system_time_to_filetime(UNIX_EPOCH + Duration::from_nanos(250)), FILETIME_UNIX_EPOCH + 2);

    let early = filetime_to_system_time(0);
    assert_eq!(DateTime::<Utc>::from(early), Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0).unwrap());
    assert_eq!(system_time_to_filetime(early), 0);
}

#[test]
fn test_parse_samples() {
    let notification = Notification::parse(device(), payload()).unwrap();
    assert_eq!(notification.source(), device());
    let samples = notification.samples().collect::<Vec<_>>();
    assert_eq!(
        samples,
        [
            Sample { handle: 7, timestamp: STAMP_1, data: &[1] },
            Sample { handle: 8, timestamp: STAMP_1, data: &[2, 2] },
            Sample { handle: 9, timestamp: STAMP_1, data: &[3] },
            Sample { handle: 7, timestamp: STAMP_2, data: &[4] },
        ]
    );
    assert_eq!(
        DateTime::<Utc>::from(samples[3].system_time()),
        Utc.with_ymd_and_hms(2009, 7, 25, 23, 0, 1).unwrap()
    );

    // no stamps at all
    let empty = Notification::parse(device(), NotificationWriter::new().finish().unwrap()).unwrap();
    assert_eq!(empty.samples().count(), 0);
}

#[test]
fn test_parse_errors() {
    let good = payload();

    let mut short = good.clone();
    short.pop();
    assert!(matches!(
        Notification::parse(device(), short),
        Err(DecodeError::InvalidValue("notification length", _))
    ));

    // consistent length, but the last sample's data is missing
    let mut truncated = good.clone();
    truncated.pop();
    let len = truncated.len() as u32 - 4;
    truncated[..4].copy_from_slice(&len.to_le_bytes());
    assert!(matches!(
        Notification::parse(device(), truncated),
        Err(DecodeError::TruncatedFrame { needed: 1, available: 0 })
    ));

    let mut trailing = good.clone();
    trailing.push(0);
    let len = trailing.len() as u32 - 4;
    trailing[..4].copy_from_slice(&len.to_le_bytes());
    assert!(matches!(
        Notification::parse(device(), trailing),
        Err(DecodeError::InvalidValue("notification trailing bytes", 1))
    ));

    let mut many_stamps = good;
    many_stamps[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
    assert!(Notification::parse(device(), many_stamps).is_err());

    assert!(Notification::parse(device(), vec![0, 0]).is_err());
}

#[test]
fn test_dispatch() {
    let dispatcher = Dispatcher::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    dispatcher.insert(
        7,
        registration(
            100,
            Box::new(move |sample: &Sample<'_>, user_handle: u32| {
                seen_cb.lock().unwrap().push((sample.handle, user_handle, sample.data.to_vec()));
            }),
        ),
    );
    dispatcher.insert(
        8,
        registration(101, Box::new(|_: &Sample<'_>, _: u32| panic!("callback failure"))),
    );
    assert_eq!(dispatcher.len(), 2);

    // Handle 8 panics, handle 9 is unknown.
    let notification = Notification::parse(device(), payload()).unwrap();
    assert_eq!(dispatcher.dispatch(&notification), 2);
    assert_eq!(*seen.lock().unwrap(), [(7, 100, vec![1]), (7, 100, vec![4])]);

    // Handles are only valid for the device that assigned them.
    let other = AmsAddr::new(device().netid(), 852);
    let notification = Notification::parse(other, payload()).unwrap();
    assert_eq!(dispatcher.dispatch(&notification), 0);
    assert_eq!(seen.lock().unwrap().len(), 2);

    let mut subscriptions = dispatcher.subscriptions();
    subscriptions.sort_by_key(|s| s.handle);
    assert_eq!(
        subscriptions,
        [
            Subscription { target: device(), handle: 7, user_handle: 100 },
            Subscription { target: device(), handle: 8, user_handle: 101 },
        ]
    );

    assert_eq!(dispatcher.remove(device(), 7).map(|r| r.user_handle), Some(100));
    assert!(dispatcher.remove(device(), 7).is_none());
    let notification = Notification::parse(device(), payload()).unwrap();
    assert_eq!(dispatcher.dispatch(&notification), 0);

    assert_eq!(dispatcher.drain().len(), 1);
    assert!(dispatcher.is_empty());
}

#[test]
fn test_user_handles() {
    let dispatcher = Dispatcher::default();
    assert_eq!(dispatcher.mint_user_handle(), 1);
    assert_eq!(dispatcher.mint_user_handle(), 2);
}

#[test]
fn test_transmission_mode() {
    use std::convert::TryFrom;

    assert_eq!(TransmissionMode::try_from(4u32), Ok(TransmissionMode::ServerOnChange));
    assert_eq!(TransmissionMode::try_from(0u32), Ok(TransmissionMode::NoTrans));
    assert_eq!(TransmissionMode::try_from(5u32), Err(5));
}
