//! Tests for the route table.

use std::net::SocketAddr;

use crate::route::{RouteEntry, RouteTable};
use crate::{AmsNetId, Error, ADS_PORT};

#[test]
fn test_add_and_resolve() {
    let routes = RouteTable::new();
    assert!(routes.is_empty());
    routes.add_route("5.23.10.12.1.1", "192.168.0.10", None).unwrap();
    routes.add_route("5.23.10.13.1.1", "192.168.0.11:4000", Some("192.168.0.2.1.1")).unwrap();
    assert_eq!(routes.len(), 2);

    let netid = AmsNetId::new(5, 23, 10, 12, 1, 1);
    assert_eq!(
        routes.resolve(netid).unwrap(),
        SocketAddr::from(([192, 168, 0, 10], ADS_PORT))
    );
    let entry = routes.lookup(AmsNetId::new(5, 23, 10, 13, 1, 1)).unwrap();
    assert_eq!(entry.addr, SocketAddr::from(([192, 168, 0, 11], 4000)));
    assert_eq!(entry.local_netid, Some(AmsNetId::new(192, 168, 0, 2, 1, 1)));

    // Adding again replaces the entry.
    routes.add_route("5.23.10.12.1.1", "10.0.0.1", None).unwrap();
    assert_eq!(routes.len(), 2);
    assert_eq!(routes.resolve(netid).unwrap(), SocketAddr::from(([10, 0, 0, 1], ADS_PORT)));
}

#[test]
fn test_invalid_routes() {
    let routes = RouteTable::new();
    assert!(matches!(
        routes.add_route("5.23.10.12.1", "192.168.0.10", None),
        Err(Error::InvalidAddress(..))
    ));
    assert!(matches!(
        routes.add_route("5.23.10.12.1.1", "192.168.0", None),
        Err(Error::InvalidAddress("invalid route address", _))
    ));
    assert!(matches!(
        routes.add_route("5.23.10.12.1.1", "192.168.0.10", Some("x")),
        Err(Error::InvalidAddress(..))
    ));
    assert!(routes.is_empty());
}

#[test]
fn test_delete_and_clear() {
    let routes = RouteTable::new();
    let netid = AmsNetId::new(1, 2, 3, 4, 1, 1);
    routes.insert(RouteEntry::new(netid, SocketAddr::from(([127, 0, 0, 1], ADS_PORT))));
    routes.delete_route(netid);
    assert!(matches!(routes.resolve(netid), Err(Error::RouteNotFound(n)) if n == netid));
    // no-op when absent
    routes.delete_route(netid);

    routes.add_route("1.1.1.1.1.1", "127.0.0.1", None).unwrap();
    routes.add_route("2.2.2.2.1.1", "127.0.0.1", None).unwrap();
    routes.clear();
    assert!(routes.entries().is_empty());
}

#[test]
fn test_shared_and_isolated() {
    let routes = RouteTable::new();
    let shared = routes.clone();
    let isolated = RouteTable::new();
    routes.add_route("2.2.2.2.1.1", "127.0.0.1", None).unwrap();
    routes.add_route("1.1.1.1.1.1", "127.0.0.2", None).unwrap();

    assert_eq!(shared.len(), 2);
    assert!(isolated.is_empty());
    // ordered by NetID
    let netids = shared.entries().iter().map(|e| e.netid.to_string()).collect::<Vec<_>>();
    assert_eq!(netids, ["1.1.1.1.1.1", "2.2.2.2.1.1"]);
}
