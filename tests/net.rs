#![cfg(feature = "net")]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use evio::net::{
    resolve, Client, ClientListener, Connect, Connection, Server, ServerListener, Severity,
};
use evio::{Error, Poller};

mod util;

use util::init;

#[derive(Default)]
struct AcceptRecorder {
    accepted: Mutex<Vec<Connection>>,
    errors: Mutex<Vec<(Error, Severity)>>,
}

impl ServerListener for AcceptRecorder {
    fn on_accept(&self, connection: Connection) {
        self.accepted.lock().unwrap().push(connection);
    }

    fn on_error(&self, error: Error, severity: Severity) {
        self.errors.lock().unwrap().push((error, severity));
    }
}

#[derive(Default)]
struct ConnectRecorder {
    connected: Mutex<Option<Connection>>,
    failed: Mutex<Option<Error>>,
}

impl ClientListener for ConnectRecorder {
    fn on_connect(&self, connection: Connection) {
        *self.connected.lock().unwrap() = Some(connection);
    }

    fn on_connect_failed(&self, error: Error) {
        *self.failed.lock().unwrap() = Some(error);
    }
}

fn drive(poller: &Poller, mut done: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        poller
            .poll(Some(Duration::from_millis(50)))
            .expect("unable to poll");
    }
}

#[test]
fn accept_and_connect() {
    init();

    let poller = Poller::new().unwrap();
    let server_side = Arc::new(AcceptRecorder::default());
    let client_side = Arc::new(ConnectRecorder::default());

    let server = Server::listen(
        &poller,
        resolve("127.0.0.1:0").unwrap(),
        server_side.clone(),
    )
    .unwrap();
    let addr = server.local_address();
    assert_ne!(addr.port(), 0);

    let pending = Client::connect(&poller, addr, client_side.clone()).unwrap();

    drive(
        &poller,
        || {
            let connected = match pending {
                Connect::Connected(_) => true,
                Connect::Pending(_) => client_side.connected.lock().unwrap().is_some(),
            };
            connected && !server_side.accepted.lock().unwrap().is_empty()
        },
        "accept and connect",
    );

    assert!(server_side.errors.lock().unwrap().is_empty());

    // The accepted connection is a live transport: push a random token
    // through it and make sure it arrives intact on the client side.
    let token: [u8; 8] = rand::random();
    let accepted = server_side.accepted.lock().unwrap().pop().unwrap();
    let sent = accepted.transport().write(&token).unwrap();
    assert!(sent.completed);
    assert_eq!(sent.bytes, token.len());

    let connection = match pending {
        Connect::Connected(connection) => connection,
        Connect::Pending(_) => client_side.connected.lock().unwrap().take().unwrap(),
    };
    assert_eq!(connection.peer_address().unwrap(), addr);

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = Vec::new();
    while received.len() < token.len() {
        assert!(Instant::now() < deadline, "timed out reading token");
        let mut buf = [0; 16];
        let result = connection.transport().read(&mut buf).unwrap();
        if result.completed {
            assert!(!result.ended, "peer closed before the token arrived");
            received.extend_from_slice(&buf[..result.bytes]);
        } else {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    assert_eq!(received, token);

    server.close();
}

#[test]
fn connect_to_closed_server_fails() {
    init();

    let poller = Poller::new().unwrap();
    let server_side = Arc::new(AcceptRecorder::default());

    // Grab a port, then free it so nothing is listening there.
    let server = Server::listen(
        &poller,
        resolve("127.0.0.1:0").unwrap(),
        server_side.clone(),
    )
    .unwrap();
    let addr = server.local_address();
    server.close();

    let client_side = Arc::new(ConnectRecorder::default());
    match Client::connect(&poller, addr, client_side.clone()) {
        // The refusal can surface synchronously or through the listener.
        Err(err) => assert!(err.is_system()),
        Ok(Connect::Connected(_)) => panic!("connected to a closed server"),
        Ok(Connect::Pending(_)) => {
            drive(
                &poller,
                || client_side.failed.lock().unwrap().is_some(),
                "connection failure",
            );
            let error = client_side.failed.lock().unwrap().take().unwrap();
            assert!(error.is_system(), "expected a system error, got {:?}", error);
        }
    }
}

#[test]
fn resolve_rejects_garbage() {
    init();
    assert!(resolve("not an address").is_err());
}
