//! End-to-end scenarios over real sockets: a server per test on an
//! ephemeral port, driven by the crate's own client.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_derive::{Deserialize, Serialize};

use synapse::register::balance::{BalanceClient, SelectMode};
use synapse::register::{Heartbeat, Register, ServiceMap};
use synapse::{frame, logging, Client, ClientError, Config, ReactorHandle, Server, Service, ServiceError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Args {
    a: i64,
    b: i64,
}

fn test_config() -> Config {
    Config {
        sub_reactors: 4,
        decoders: 4,
        workers: 16,
        ..Config::default()
    }
}

fn arith_service(log: &slog::Logger) -> Service {
    let mut service = Service::new("Arith", log);
    service.method("Sum", |args: Args, reply: &mut i64| {
        *reply = args.a + args.b;
        Ok(())
    });
    service.method("Echo", |value: u64, reply: &mut u64| {
        *reply = value;
        Ok(())
    });
    service.method("Boom", |_: Args, _: &mut i64| Err(ServiceError::new("boom")));
    service.method("Slow", |value: u64, reply: &mut u64| {
        thread::sleep(Duration::from_millis(2));
        *reply = value;
        Ok(())
    });
    service
}

fn start_server(config: &Config) -> (Arc<Server>, ReactorHandle) {
    let log = logging::discard();
    let server = Arc::new(Server::new(log.clone()));
    server.register(arith_service(&log));
    let handle = Server::serve(&server, "127.0.0.1:0", config).unwrap();
    (server, handle)
}

fn wait_until<F: FnMut() -> bool>(mut check: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn sum_round_trips_on_both_codecs() {
    let (_server, handle) = start_server(&test_config());

    for codec in &["bin", "json"] {
        let client =
            Client::connect(handle.local_addr(), codec, &logging::discard()).unwrap();
        let reply: i64 = client.call("Arith.Sum", Args { a: 3, b: 4 }).unwrap();
        assert_eq!(reply, 7);
    }
}

#[test]
fn first_call_carries_sequence_one() {
    let (_server, handle) = start_server(&test_config());
    let client = Client::connect(handle.local_addr(), "bin", &logging::discard()).unwrap();

    let call = client.go::<Args, i64>("Arith.Sum", Args { a: 1, b: 1 }).unwrap();
    assert_eq!(call.seq(), 1);
    assert_eq!(call.wait::<i64>().unwrap(), 2);
}

#[test]
fn unknown_method_reports_the_exact_error() {
    let (_server, handle) = start_server(&test_config());
    let client = Client::connect(handle.local_addr(), "bin", &logging::discard()).unwrap();

    let result: Result<i64, _> = client.call("Arith.Mul", Args { a: 1, b: 2 });
    assert_eq!(
        result.unwrap_err(),
        ClientError::Remote("rpc server: can't find methodArith.Mul".to_string())
    );

    // The failed dispatch must not poison the stream.
    let reply: i64 = client.call("Arith.Sum", Args { a: 2, b: 2 }).unwrap();
    assert_eq!(reply, 4);
}

#[test]
fn user_error_keeps_the_connection_usable() {
    let (_server, handle) = start_server(&test_config());

    for codec in &["bin", "json"] {
        let client =
            Client::connect(handle.local_addr(), codec, &logging::discard()).unwrap();

        let result: Result<i64, _> = client.call("Arith.Boom", Args { a: 0, b: 0 });
        assert_eq!(result.unwrap_err(), ClientError::Remote("boom".to_string()));

        let reply: i64 = client.call("Arith.Sum", Args { a: 20, b: 22 }).unwrap();
        assert_eq!(reply, 42);
    }
}

#[test]
fn concurrent_calls_come_back_keyed_by_sequence() {
    let (_server, handle) = start_server(&test_config());
    let client = Client::connect(handle.local_addr(), "bin", &logging::discard()).unwrap();

    let mut calls = Vec::with_capacity(1000);
    for value in 1..=1000u64 {
        calls.push((value, client.go::<u64, u64>("Arith.Slow", value).unwrap()));
    }

    let mut replies = Vec::with_capacity(1000);
    for (value, call) in calls {
        let reply = call.wait::<u64>().unwrap();
        assert_eq!(reply, value);
        replies.push(reply);
    }

    replies.sort_unstable();
    let expected: Vec<u64> = (1..=1000).collect();
    assert_eq!(replies, expected);
}

#[test]
fn unknown_codec_handshake_closes_the_connection() {
    let (_server, handle) = start_server(&test_config());

    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
    frame::write_handshake(&stream, b"{\"CodecType\":\"unknown\"}").unwrap();

    // The server tears the fd down; the read observes the shutdown.
    let mut sink = Vec::new();
    stream.read_to_end(&mut sink).unwrap();
    assert!(sink.is_empty());

    assert!(wait_until(|| handle.connections() == 0, Duration::from_secs(2)));
}

#[test]
fn closed_clients_leave_no_tracked_fds() {
    let (_server, handle) = start_server(&test_config());

    let clients: Vec<Client> = (0..8)
        .map(|_| Client::connect(handle.local_addr(), "bin", &logging::discard()).unwrap())
        .collect();
    for client in &clients {
        let reply: i64 = client.call("Arith.Sum", Args { a: 1, b: 2 }).unwrap();
        assert_eq!(reply, 3);
    }

    assert!(wait_until(|| handle.connections() == 8, Duration::from_secs(2)));
    drop(clients);
    assert!(wait_until(|| handle.connections() == 0, Duration::from_secs(5)));
}

#[test]
fn accepted_fds_spread_across_sub_reactors() {
    let config = Config {
        sub_reactors: 4,
        ..test_config()
    };
    let (_server, handle) = start_server(&config);

    let accepts = 32;
    let streams: Vec<TcpStream> = (0..accepts)
        .map(|_| TcpStream::connect(handle.local_addr()).unwrap())
        .collect();

    assert!(wait_until(
        || handle.connections() == accepts,
        Duration::from_secs(2)
    ));

    let per_reactor = accepts / config.sub_reactors;
    for load in handle.loads() {
        assert!(
            load >= per_reactor.saturating_sub(1) && load <= per_reactor + 1,
            "unbalanced sub reactor loads: {:?}",
            handle.loads()
        );
    }

    drop(streams);
}

#[test]
fn heartbeat_lapse_expires_the_registration() {
    let log = logging::discard();

    // Registry server with a one-second lease TTL.
    let registry_server = Arc::new(Server::new(log.clone()));
    let register = Register::new(Duration::from_secs(1), &log);
    registry_server.register(Register::service(&register));
    let registry_handle = Server::serve(&registry_server, "127.0.0.1:0", &test_config()).unwrap();
    let registry_addr = registry_handle.local_addr().to_string();

    // An RPC server announces itself, then never heartbeats.
    let (server, server_handle) = start_server(&test_config());
    let announce_client =
        Arc::new(Client::connect(registry_addr.as_str(), "bin", &log).unwrap());
    let heartbeat = Heartbeat::new(
        server_handle.local_addr().to_string(),
        announce_client,
        &log,
    );
    heartbeat.announce(&server).unwrap();

    let get_client = Client::connect(registry_addr.as_str(), "bin", &log).unwrap();
    let snapshot: ServiceMap = get_client.call("Register.Get", ()).unwrap();
    assert!(snapshot.contains_key("Arith.Sum"));

    thread::sleep(Duration::from_secs(2));
    let snapshot: ServiceMap = get_client.call("Register.Get", ()).unwrap();
    assert!(
        !snapshot.contains_key("Arith.Sum"),
        "lease survived past its TTL: {:?}",
        snapshot
    );
}

#[test]
fn balance_client_calls_through_the_registry() {
    let log = logging::discard();

    let registry_server = Arc::new(Server::new(log.clone()));
    let register = Register::new(Duration::from_secs(120), &log);
    registry_server.register(Register::service(&register));
    let registry_handle = Server::serve(&registry_server, "127.0.0.1:0", &test_config()).unwrap();
    let registry_addr = registry_handle.local_addr().to_string();

    // Two arith servers behind the registry.
    let mut backends = Vec::new();
    for _ in 0..2 {
        let (server, handle) = start_server(&test_config());
        let client = Arc::new(Client::connect(registry_addr.as_str(), "bin", &log).unwrap());
        let heartbeat = Heartbeat::new(handle.local_addr().to_string(), client, &log);
        heartbeat.announce(&server).unwrap();
        backends.push((server, handle));
    }

    let balance_client = BalanceClient::connect(
        registry_addr.as_str(),
        SelectMode::RoundRobin,
        "bin",
        Duration::from_secs(25),
        &log,
    )
    .unwrap();

    for value in 0..4i64 {
        let reply: i64 = balance_client
            .call("Arith.Sum", Args { a: value, b: 10 })
            .unwrap();
        assert_eq!(reply, value + 10);
    }
}
