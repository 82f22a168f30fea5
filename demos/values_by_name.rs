//! Reads and writes PLC variables by name, reads a whole structure as a
//! Rust struct with zerocopy traits, and lists the symbol table.
//!
//! Usage: values_by_name <netid> <ip>

use ads_mux::symbol::{self, Handle};
use ads_mux::{AmsAddr, AmsNetId, Client, RouteTable, Source, Timeouts};
use zerocopy::{FromBytes, Immutable, IntoBytes};

#[derive(Default, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed)]
struct Motor {
    position: f32,
    speed: f32,
    moving: u8,
}

fn main() -> ads_mux::Result<()> {
    let mut args = std::env::args().skip(1);
    let netid: AmsNetId = args.next().unwrap_or_else(|| "5.62.215.36.1.1".into()).parse()?;
    let ip = args.next().unwrap_or_else(|| "127.0.0.1".into());

    let routes = RouteTable::new();
    routes.add_route(&netid.to_string(), &ip, None)?;
    let client = Client::new(routes, Timeouts::none(), Source::Auto);
    let dev = client.device(AmsAddr::new(netid, 851));

    let counter: u32 = dev.read_value_by_name("MAIN.counter")?;
    dev.write_value_by_name("MAIN.counter", &counter.wrapping_add(1))?;
    println!("counter: {} -> {}", counter, dev.read_value_by_name::<u32>("MAIN.counter")?);

    let info = symbol::get_info(dev, "MAIN.motor")?;
    println!("MAIN.motor lives at {:#x}:{:#x}, {} bytes", info.index_group, info.index_offset, info.size);

    // Keep the handle for repeated reads; it is released on drop.
    let handle = Handle::new(dev, "MAIN.motor")?;
    for _ in 0..3 {
        let motor = handle.read_value::<Motor>()?;
        let (pos, spd) = (motor.position, motor.speed);
        println!("motor: pos={} spd={} moving={}", pos, spd, motor.moving != 0);
    }

    // Several variables with one sum-up request.
    let names = ["MAIN.counter", "MAIN.motor"];
    for (name, value) in names.iter().zip(dev.read_list_by_name(&names)?) {
        match value {
            Ok(data) => println!("{}: {:02x?}", name, data),
            Err(e) => println!("{}: {}", name, e),
        }
    }

    for entry in symbol::upload(dev)? {
        println!("{} : {} ({} bytes) {}", entry.name, entry.type_name, entry.size, entry.comment);
    }
    Ok(())
}
