use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, TrySendError};
use slog::{trace, Logger};

use crate::server::{Request, Server};

/// Writer controller: forward each response task into an unbuffered inbox
/// shared by an elastic pool of writers. A hand-off only succeeds when some
/// writer is parked on the inbox; when none is, spawn one and retry. Pool
/// size therefore tracks the number of simultaneously busy connections.
pub(crate) fn controller(server: Arc<Server>, tasks: Receiver<Request>, idle: Duration, log: Logger) {
    let (inbox_tx, inbox_rx) = bounded::<Request>(0);
    let mut spawned = 0usize;

    for task in tasks.iter() {
        let mut task = task;
        loop {
            match inbox_tx.try_send(task) {
                Ok(()) => break,
                Err(TrySendError::Full(returned)) => {
                    task = returned;
                    spawned += 1;
                    trace!(log, "growing writer pool"; "writers_spawned" => spawned);
                    let server = server.clone();
                    let inbox = inbox_rx.clone();
                    thread::Builder::new()
                        .name(format!("writer-{}", spawned))
                        .spawn(move || run(server, inbox, idle))
                        .expect("spawning writer thread");
                    // Give the fresh writer a chance to park on the inbox.
                    thread::yield_now();
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// One writer: serialize responses under the per-connection sending lock. A
/// write failure removes the connection; there is no retry. Sixty seconds
/// without work retires the writer and shrinks the pool.
fn run(server: Arc<Server>, inbox: Receiver<Request>, idle: Duration) {
    loop {
        match inbox.recv_timeout(idle) {
            Ok(request) => {
                if server.send_response(&request).is_err() {
                    request.conn.sub().remove(request.conn.fd());
                }
            }
            Err(_) => return,
        }
    }
}
