//! Subscribes to a PLC variable and prints every change until Ctrl-C.
//!
//! Usage: notify <netid> <ip> [symbol]

use std::time::Duration;

use ads_mux::notif::{Attributes, Location, TransmissionMode};
use ads_mux::{AmsAddr, AmsNetId, Client, RouteTable, Source, Timeouts};
use crossbeam_channel::unbounded;

fn main() -> ads_mux::Result<()> {
    let mut args = std::env::args().skip(1);
    let netid: AmsNetId = args.next().unwrap_or_else(|| "5.62.215.36.1.1".into()).parse()?;
    let ip = args.next().unwrap_or_else(|| "127.0.0.1".into());
    let symbol = args.next().unwrap_or_else(|| "MAIN.counter".into());

    let routes = RouteTable::new();
    routes.add_route(&netid.to_string(), &ip, None)?;
    let client = Client::new(routes, Timeouts::new(Duration::from_secs(2)), Source::Auto);
    let dev = client.device(AmsAddr::new(netid, 851));
    println!("{:?}", dev.get_info()?);

    let (tx, rx) = unbounded();
    let attributes = Attributes::new(
        4,
        TransmissionMode::ServerOnChange,
        Duration::from_millis(100),
        Duration::from_millis(100),
    );
    let sub = dev.add_notification(&Location::Symbol(symbol), &attributes, None, move |sample, user| {
        let _ = tx.send((user, sample.system_time(), sample.data.to_vec()));
    })?;
    println!("subscribed: {:?}", sub);

    for (user, time, data) in rx.iter() {
        println!("[{}] {:?}: {:?}", user, time, data);
    }
    dev.delete_notification(sub.handle)
}
