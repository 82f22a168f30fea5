//! Work with PLCs using the ADS protocol
//!
//! # Introduction
//!
//! ADS is the native protocol used by programmable logic controllers (PLCs) and
//! the TwinCAT automation system produced by [Beckhoff GmbH](https://www.beckhoff.com/).
//!
//! The [specification](https://infosys.beckhoff.de/content/1031/tc3_adscommon/html/tcadscommon_introads.htm)
//! can be found on their Information System pages.
//!
//! # Structure
//!
//! A [`Client`] looks up the router of a target NetID in its [`RouteTable`]
//! and keeps one [`Connection`] per router.  Any number of threads can send
//! requests over a connection at the same time; a reader thread per
//! connection matches the replies to their requests and delivers
//! notification samples to the registered callbacks.
//!
//! ```rust,ignore
//! let routes = RouteTable::new();
//! routes.add_route("5.23.10.12.1.1", "192.168.0.10", None)?;
//! let client = Client::new(routes, Timeouts::new(Duration::from_secs(1)), Source::Auto);
//! let device = client.device(AmsAddr::new("5.23.10.12.1.1".parse()?, ports::TC3_PLC_1));
//! let value: u32 = device.read_value(index::PLC_RW_M, 0)?;
//! ```

pub mod client;
pub mod codec;
pub mod conn;
pub mod errors;
pub mod index;
pub mod netid;
pub mod notif;
pub mod ports;
pub mod route;
pub mod symbol;
pub mod udp;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use client::{AdsState, Client, Device, Reply, Source, Timeouts};
pub use codec::{AmsHeader, Command, DeviceInfo, StateFlags};
pub use conn::{ConnState, Connection};
pub use errors::{Error, Result};
pub use netid::{AmsAddr, AmsNetId, AmsPort};
pub use route::{RouteEntry, RouteTable};

/// The default port for TCP communication.
pub const ADS_PORT: u16 = 0xBF02;
/// The default port for UDP communication.
pub const ADS_UDP_PORT: u16 = 0xBF03;

/// Lock a mutex, ignoring poisoning; callbacks can panic while holding
/// their own lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod test;
