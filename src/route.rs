//! The local route table, mapping AMS NetIDs to IP endpoints.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use crate::{AmsNetId, Error, Result, ADS_PORT};

/// A single route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    /// The NetID of the remote system.
    pub netid: AmsNetId,
    /// Where its AMS router listens.
    pub addr: SocketAddr,
    /// Use this NetID as our own when talking to the remote system,
    /// instead of the one derived from the connection.
    pub local_netid: Option<AmsNetId>,
}

impl RouteEntry {
    pub fn new(netid: AmsNetId, addr: SocketAddr) -> Self {
        Self { netid, addr, local_netid: None }
    }
}

/// Maps NetIDs to the IP endpoints of their routers.
///
/// Cloning the table gives another handle to the same routes; create
/// independent tables with `RouteTable::new`.  A new table is empty.
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    routes: Arc<RwLock<BTreeMap<AmsNetId, RouteEntry>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<AmsNetId, RouteEntry>> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<AmsNetId, RouteEntry>> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace the route for `netid`.
    ///
    /// `addr` is an IP address, optionally with port (`10.0.0.5` or
    /// `10.0.0.5:48898`); the port defaults to `ADS_PORT`.  `local_netid`,
    /// if given, is the NetID we present to this system.
    pub fn add_route(&self, netid: &str, addr: &str, local_netid: Option<&str>) -> Result<()> {
        let netid = netid.parse()?;
        let addr = parse_socket_addr(addr)?;
        let local_netid = local_netid.map(str::parse).transpose()?;
        self.insert(RouteEntry { netid, addr, local_netid });
        Ok(())
    }

    /// Add or replace a route.
    pub fn insert(&self, entry: RouteEntry) {
        debug!("route {} -> {}", entry.netid, entry.addr);
        self.write().insert(entry.netid, entry);
    }

    /// Remove the route for `netid`, if there is one.
    pub fn delete_route(&self, netid: AmsNetId) {
        if self.write().remove(&netid).is_some() {
            debug!("route to {} removed", netid);
        }
    }

    /// Return the endpoint of the router for `netid`.
    pub fn resolve(&self, netid: AmsNetId) -> Result<SocketAddr> {
        self.lookup(netid)
            .map(|entry| entry.addr)
            .ok_or(Error::RouteNotFound(netid))
    }

    /// Return the complete route entry for `netid`.
    pub fn lookup(&self, netid: AmsNetId) -> Option<RouteEntry> {
        self.read().get(&netid).copied()
    }

    /// Remove all routes.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Return a snapshot of all routes, ordered by NetID.
    pub fn entries(&self) -> Vec<RouteEntry> {
        self.read().values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, ADS_PORT));
    }
    addr.parse()
        .map_err(|_| Error::InvalidAddress("invalid route address", addr.into()))
}
