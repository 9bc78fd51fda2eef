//! A server that accepts KTN connections on a given UDP port and echoes
//! every message back to its sender.

mod server;

use clap::{
    app_from_crate, crate_authors, crate_description, crate_name, crate_version,
    AppSettings, Arg,
};
use env_logger;
use log::{error, LevelFilter};
use std::{net::IpAddr, process, time::Duration};

const ADDRESS_ARG: &str = "ADDRESS";
const PORT_ARG: &str = "PORT";
const TIMEOUT_ARG: &str = "TIMEOUT";

fn main() {
    env_logger::Builder::new()
        .filter(Some("ktn_echo_server"), LevelFilter::Info)
        .filter(Some("ktn"), LevelFilter::Warn)
        .init();

    let matches = app_from_crate!()
        .setting(AppSettings::GlobalVersion)
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name(PORT_ARG)
                .short("p")
                .long("port")
                .default_value("12345")
                .takes_value(true)
                .required(true)
                .validator(|val| {
                    val.parse::<u16>().map(|_| ()).map_err(|_| {
                        format!("'{}' cannot be parsed as number.", val)
                    })
                })
                .help("The UDP Port to listen on."),
        )
        .arg(
            Arg::with_name(ADDRESS_ARG)
                .short("a")
                .long("address")
                .default_value("127.0.0.1")
                .takes_value(true)
                .validator(|val| {
                    val.parse::<IpAddr>()
                        .map(|_| ())
                        .map_err(|_| format!("'{}' is not an IP address.", val))
                })
                .help("The local IP to bind to. Must not be the unspecified address."),
        )
        .arg(
            Arg::with_name(TIMEOUT_ARG)
                .short("t")
                .long("timeout")
                .default_value("1000")
                .takes_value(true)
                .validator(|val| match val.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err(format!("'{}' is not a positive number of milliseconds.", val)),
                })
                .help("The receive timeout in milliseconds."),
        )
        .get_matches();

    let ip = matches.value_of(ADDRESS_ARG).unwrap().parse().unwrap();
    let port = matches.value_of(PORT_ARG).unwrap().parse().unwrap();
    let timeout = matches.value_of(TIMEOUT_ARG).unwrap().parse().unwrap();

    if let Err(e) = server::serve(ip, port, Duration::from_millis(timeout)) {
        error!("💥  Server failed: {}", e);
        process::exit(1);
    }
}
