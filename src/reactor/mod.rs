//! The reactor topology: one accept loop, N fd-owning subReactors and three
//! stateless pools wired together with rendezvous queues.
//!
//! Flow: accept → mainReactor → subReactor → decode task → worker task →
//! write task → writer. Control inverts on would-block: the decoder or
//! writer relinquishes the fd and asks the owning subReactor to re-arm the
//! corresponding interest bit.

pub(crate) mod decode;
pub(crate) mod main_reactor;
pub(crate) mod sub_reactor;
pub(crate) mod worker;
pub(crate) mod writer;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;

use crate::config::Config;
use crate::conn::Connection;
use crate::server::{Request, Server};
use self::sub_reactor::SubReactor;

/// Observability handle for a running server: the bound address and the
/// per-subReactor fd counts.
pub struct ReactorHandle {
    local_addr: SocketAddr,
    subs: Vec<Arc<SubReactor>>,
}

impl ReactorHandle {
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tracked-fd count per subReactor.
    pub fn loads(&self) -> Vec<usize> {
        self.subs.iter().map(|sub| sub.load()).collect()
    }

    /// Total tracked fds across the topology.
    pub fn connections(&self) -> usize {
        self.loads().iter().sum()
    }
}

/// Bind `addr` and spawn the whole topology: worker pool, decode pool,
/// writer controller, subReactors and finally the accept loop. Returns once
/// the listening socket is live.
pub(crate) fn serve(server: Arc<Server>, addr: &str, config: &Config) -> io::Result<ReactorHandle> {
    let log = server.log().clone();

    let listener = main_reactor::listen(addr)?;
    let local_addr = listener.local_addr()?;

    let (decode_tx, decode_rx) = bounded::<Vec<Arc<Connection>>>(0);
    let (work_tx, work_rx) = bounded::<Request>(0);
    let (write_tx, write_rx) = bounded::<Request>(0);

    for index in 0..config.workers.max(1) {
        let server = server.clone();
        let tasks = work_rx.clone();
        let write_queue = write_tx.clone();
        thread::Builder::new()
            .name(format!("worker-{}", index))
            .spawn(move || worker::run(server, tasks, write_queue))
            .expect("spawning worker thread");
    }

    for index in 0..config.decoders.max(1) {
        let server = server.clone();
        let batches = decode_rx.clone();
        let work_queue = work_tx.clone();
        thread::Builder::new()
            .name(format!("decoder-{}", index))
            .spawn(move || decode::run(server, batches, work_queue))
            .expect("spawning decoder thread");
    }

    {
        let server = server.clone();
        let idle = config.writer_idle();
        let log = log.clone();
        thread::Builder::new()
            .name("writer-controller".to_string())
            .spawn(move || writer::controller(server, write_rx, idle, log))
            .expect("spawning writer controller thread");
    }

    let mut subs = Vec::with_capacity(config.sub_reactors.max(1));
    let mut mails = Vec::with_capacity(config.sub_reactors.max(1));
    for index in 0..config.sub_reactors.max(1) {
        let sub = SubReactor::new(index, &log)?;
        let intake = SubReactor::spawn(&sub, index, decode_tx.clone());
        mails.push((sub.clone(), intake));
        subs.push(sub);
    }

    {
        let log = log.clone();
        thread::Builder::new()
            .name("main-reactor".to_string())
            .spawn(move || main_reactor::run(listener, mails, log))
            .expect("spawning main reactor thread");
    }

    Ok(ReactorHandle { local_addr, subs })
}
