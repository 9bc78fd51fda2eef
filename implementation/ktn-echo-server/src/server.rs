use ktn::{Config, Connection, Error, PortRegistry, UdpTransport};
use log::{info, warn};
use std::{
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    thread,
    time::Duration,
};

pub fn serve(ip: IpAddr, port: u16, timeout: Duration) -> ktn::Result<()> {
    let config = Config::new().recv_timeout(timeout);
    let mut listener = Connection::bind_with_config(
        SocketAddr::new(ip, port),
        PortRegistry::shared(),
        config,
    )?;

    info!("⛓  Starting echo server on {}.", listener.local_addr());

    loop {
        let conn = match listener.accept() {
            Ok(conn) => conn,
            Err(ref e) if keeps_accepting(e) => {
                warn!("💥  Could not accept a client: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };

        thread::spawn(move || echo(conn));
    }
}

/// Whether a failed `accept` only concerns the client at hand.
fn keeps_accepting(err: &Error) -> bool {
    match err {
        Error::HandshakeTimeout => true,
        Error::Io(e) => e.kind() == ErrorKind::AddrInUse,
        _ => false,
    }
}

fn echo(mut conn: Connection<UdpTransport>) {
    let peer = conn.remote_addr();
    info!("⚡️  Accepted connection from {:?} on {}.", peer, conn.local_addr());

    loop {
        let msg = match conn.receive() {
            Ok(msg) => msg,
            Err(Error::EndOfStream) => break,
            Err(e) => {
                warn!("💥  Error while receiving from client {:?}: {}", peer, e);
                return;
            }
        };

        info!("Echoing '{}' to {:?}.", msg, peer);
        if let Err(e) = conn.send(&msg) {
            warn!("💥  Error while echoing to client {:?}: {}", peer, e);
            if e.is_terminal() {
                return;
            }
        }
    }

    match conn.close() {
        Ok(()) => info!("🏁  Connection to {:?} closed.", peer),
        Err(e) => warn!("💥  Error while closing connection to {:?}: {}", peer, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn exhausted_ports_do_not_stop_the_server() {
        let no_port = io::Error::new(ErrorKind::AddrInUse, "no bindable ephemeral port");

        assert!(keeps_accepting(&Error::HandshakeTimeout));
        assert!(keeps_accepting(&Error::Io(no_port)));
        assert!(!keeps_accepting(&Error::Io(ErrorKind::UnexpectedEof.into())));
        assert!(!keeps_accepting(&Error::NotConnected));
    }
}
