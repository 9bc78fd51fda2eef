#![allow(dead_code)]

use ktn::{
    sim::{SimNetwork, SimTransport},
    Config, Connection, Error, PortRegistry, State, Transport,
};
use log::info;
use std::{
    net::SocketAddr,
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

/// Runs `func` on its own thread and fails the test if it panics or takes
/// longer than `duration`.
pub fn run_timed<T, F>(duration: Duration, func: F) -> T
where
    T: 'static + Send,
    F: 'static + Send + FnOnce() -> T,
{
    let (res_tx, res_rx) = mpsc::channel();

    thread::spawn(move || {
        let _ = res_tx.send(func());
    });

    match res_rx.recv_timeout(duration) {
        Ok(res) => res,
        Err(mpsc::RecvTimeoutError::Timeout) => panic!("timed out"),
        Err(mpsc::RecvTimeoutError::Disconnected) => panic!("test thread panicked"),
    }
}

pub fn init_logging() {
    let _ = env_logger::try_init();
}

/// A configuration with short deadlines, so that lossy runs finish quickly.
pub fn config() -> Config {
    Config::new()
        .recv_timeout(Duration::from_millis(100))
        .time_wait(Duration::from_millis(500))
}

pub fn server_addr() -> SocketAddr {
    "10.0.0.1:9000".parse().unwrap()
}

pub fn client_addr(n: u16) -> SocketAddr {
    SocketAddr::new("10.0.0.2".parse().unwrap(), 4000 + n)
}

/// Creates a closed connection bound on the simulated network.
pub fn sim_connection(
    net: &Arc<SimNetwork>,
    addr: SocketAddr,
    registry: &Arc<PortRegistry>,
) -> Connection<SimTransport> {
    let transport = net.bind(addr, config().recv_timeout).unwrap();
    Connection::new(transport, registry.clone(), config())
}

/// What the echo server saw on its single connection.
#[derive(Debug)]
pub struct Served {
    pub final_state: State,
    pub local_addr: SocketAddr,
    pub received: Vec<String>,
}

/// Accepts one connection on the listener and echoes every message until
/// the peer closes.
pub fn echo_server<T>(mut listener: Connection<T>) -> JoinHandle<ktn::Result<Served>>
where
    T: 'static + Send + Transport,
{
    thread::spawn(move || {
        let conn = listener.accept()?;
        info!("server accepted {:?}", conn.remote_addr());

        serve_echo(conn)
    })
}

/// Echoes every message on the connection until the peer closes.
pub fn serve_echo<T: Transport>(mut conn: Connection<T>) -> ktn::Result<Served> {
    let mut received = Vec::new();
    loop {
        match conn.receive() {
            Ok(msg) => {
                conn.send(&msg)?;
                received.push(msg);
            }
            Err(Error::EndOfStream) => break,
            Err(e) => return Err(e),
        }
    }
    conn.close()?;

    Ok(Served {
        final_state: conn.state(),
        local_addr: conn.local_addr(),
        received,
    })
}

/// Connects, sends every message and waits for its echo, then closes.
pub fn echo_client<T: Transport>(
    conn: &mut Connection<T>,
    server: SocketAddr,
    messages: &[&str],
) -> ktn::Result<Vec<String>> {
    conn.connect(server)?;
    assert_eq!(conn.state(), State::Established);

    let mut echoed = Vec::with_capacity(messages.len());
    for msg in messages {
        conn.send(msg)?;
        echoed.push(conn.receive()?);
    }
    conn.close()?;

    Ok(echoed)
}
