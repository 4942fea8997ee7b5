//! §8 scenario 1 end to end: connect, one byte each way, then shutdown-send on each
//! side observed as shutdown-receive (EOF) on the peer, driven through a real
//! `Scheduler` over loopback TCP rather than by hand-dispatching a single session.

use std::net::TcpListener as StdTcpListener;
use std::sync::mpsc;
use std::time::Duration;

use hive_rt::net::tcp::TcpStream;
use hive_rt::scheduler::{Config, Scheduler};
use hive_rt::session::write_queue::SendOptions;
use hive_rt::session::{SessionEvent, SessionState, ShutdownDirection};

#[test]
fn connect_exchange_shutdown_round_trip() {
    let scheduler = Scheduler::new(Config::new().with_threads(1, 1)).unwrap();

    let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();

    let client_raw = TcpStream::connect(addr).unwrap();
    let (server_raw_std, _) = std_listener.accept().unwrap();
    let server_raw = TcpStream::new(server_raw_std).unwrap();

    let client = scheduler.create_tcp_stream(client_raw, SessionState::Connected).unwrap();
    let server = scheduler.create_tcp_stream(server_raw, SessionState::Connected).unwrap();

    let (server_rx_tx, server_rx_rx) = mpsc::channel();
    let (client_rx_tx, client_rx_rx) = mpsc::channel();
    let (server_eof_tx, server_eof_rx) = mpsc::channel();
    let (client_eof_tx, client_eof_rx) = mpsc::channel();

    let server_for_cb = server.clone();
    server.on_event(move |ev| match ev {
        SessionEvent::ReadLowWatermark => {
            let data = server_for_cb.receive(64);
            if !data.is_empty() {
                let _ = server_rx_tx.send(data);
            }
        }
        SessionEvent::ShutdownReceive => {
            let _ = server_eof_tx.send(());
        }
        _ => {}
    });

    let client_for_cb = client.clone();
    client.on_event(move |ev| match ev {
        SessionEvent::ReadLowWatermark => {
            let data = client_for_cb.receive(64);
            if !data.is_empty() {
                let _ = client_rx_tx.send(data);
            }
        }
        SessionEvent::ShutdownReceive => {
            let _ = client_eof_tx.send(());
        }
        _ => {}
    });

    // Client sends one byte, server observes it.
    client.send(b"X".to_vec(), SendOptions::default(), None).unwrap();
    let received = server_rx_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(received, b"X".to_vec());

    // Server sends one byte back, client observes it.
    server.send(b"X".to_vec(), SendOptions::default(), None).unwrap();
    let received = client_rx_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(received, b"X".to_vec());

    // Server shuts down its send half; client's read queue observes EOF. With the
    // default `keep_half_open = false` policy that EOF makes the client shut down its
    // own send half in turn, which is what then lets the server observe EOF too.
    server.shutdown(ShutdownDirection::Send);
    client_eof_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    server_eof_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    // Both sides have now seen both directions shut down and closed themselves; a
    // redundant explicit shutdown/close is a no-op.
    client.shutdown(ShutdownDirection::Send);
    client.close();
    server.close();
    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(server.state(), SessionState::Closed);

    scheduler.shutdown();
}
