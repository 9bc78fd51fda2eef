use env_logger;
use ktn::{Connection, PortRegistry};
use log::{error, info};
use std::process;

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        error!("demo failed: {}", e);
        process::exit(1);
    }
}

fn run() -> ktn::Result<()> {
    let server = "127.0.0.1:12345".parse().unwrap();
    let mut conn = Connection::bind("127.0.0.1:0".parse().unwrap(), PortRegistry::shared())?;

    conn.connect(server)?;
    info!("connected to {:?}", conn.remote_addr());

    conn.send("Hello World!")?;
    println!("{}", conn.receive()?);

    conn.close()
}
