use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::{io, thread};

use crossbeam_channel::{bounded, Receiver, Sender};
use hashbrown::HashMap;
use mio::net::TcpStream;
use mio::unix::UnixReady;
use mio::{Events, PollOpt, Ready, Token};
use slog::{debug, error, o, warn, Logger};

use crate::conn::Connection;
use crate::iomux::IoMux;

// Matches the reference wait-event batch size.
const EVENT_CAPACITY: usize = 5120;

/// Messages into a subReactor's intake loop: a freshly accepted connection
/// from the mainReactor, or a writer asking for write interest on its fd.
pub(crate) enum Intake {
    Conn(TcpStream),
    ArmWrite(RawFd),
}

struct ConnEntry {
    conn: Arc<Connection>,
    interest: Ready,
    signal: Sender<()>,
}

/// One I/O-demultiplexing loop owning a set of connection fds. Two
/// cooperative threads share it: the intake loop mutates the fd map and the
/// wait loop blocks on readiness. The interest mask stored per entry and the
/// mask known to the multiplexer are kept consistent under the write lock.
pub(crate) struct SubReactor {
    conns: RwLock<HashMap<RawFd, ConnEntry>>,
    iomux: IoMux,
    load: AtomicUsize,
    log: Logger,
}

impl SubReactor {
    pub fn new(index: usize, log: &Logger) -> io::Result<Arc<SubReactor>> {
        Ok(Arc::new(SubReactor {
            conns: RwLock::new(HashMap::new()),
            iomux: IoMux::new()?,
            load: AtomicUsize::new(0),
            log: log.new(o!("sub_reactor" => index)),
        }))
    }

    /// Tracked-fd count. Read without synchronization by the mainReactor's
    /// balancer; exact balance is not required.
    #[inline]
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// Reserve a slot before hand-off so the balancer sees the fd coming.
    #[inline]
    pub fn bump_load(&self) {
        self.load.fetch_add(1, Ordering::Relaxed);
    }

    /// Start the intake and wait loops; returns the intake sender used by
    /// the mainReactor (new fds) and by writers (write-arm requests).
    pub fn spawn(
        sub: &Arc<SubReactor>,
        index: usize,
        decode_queue: Sender<Vec<Arc<Connection>>>,
    ) -> Sender<Intake> {
        let (intake_tx, intake_rx) = bounded(0);

        let intake_self = sub.clone();
        let intake_mail = intake_tx.clone();
        thread::Builder::new()
            .name(format!("sub-reactor-{}-intake", index))
            .spawn(move || intake_self.intake_loop(intake_rx, intake_mail))
            .expect("spawning sub reactor intake thread");

        let wait_self = sub.clone();
        thread::Builder::new()
            .name(format!("sub-reactor-{}", index))
            .spawn(move || wait_self.wait_loop(decode_queue))
            .expect("spawning sub reactor wait thread");

        intake_tx
    }

    fn intake_loop(self: Arc<SubReactor>, intake: Receiver<Intake>, mail: Sender<Intake>) {
        for message in intake.iter() {
            match message {
                Intake::Conn(stream) => SubReactor::insert(&self, stream, mail.clone()),
                Intake::ArmWrite(fd) => {
                    if let Err(err) = self.set_interest(fd, Ready::writable(), true) {
                        // A fd we cannot watch for writability would leave
                        // its writer parked forever; removal wakes it.
                        warn!(self.log, "write arm failed"; "fd" => fd, "error" => %err);
                        self.remove(fd);
                    }
                }
            }
        }
    }

    /// Take ownership of an accepted connection: build its entry with
    /// initial interest readable, then register edge-triggered.
    fn insert(sub: &Arc<SubReactor>, stream: TcpStream, mail: Sender<Intake>) {
        let fd = stream.as_raw_fd();
        let (conn, signal) = Connection::new(stream, fd, sub.clone(), mail, &sub.log);

        let result = {
            let mut conns = sub.conns.write().unwrap();
            let interest = Ready::readable();
            let result = sub
                .iomux
                .add(conn.stream(), Token(fd as usize), interest, PollOpt::edge());
            if result.is_ok() {
                conns.insert(
                    fd,
                    ConnEntry {
                        conn: conn.clone(),
                        interest,
                        signal,
                    },
                );
            }
            result
        };

        match result {
            Ok(()) => debug!(sub.log, "connection tracked"; "fd" => fd),
            Err(err) => {
                warn!(sub.log, "connection register failed"; "fd" => fd, "error" => %err);
                conn.mark_closed();
                sub.load.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Re-enable read interest after a decoder drained to would-block.
    #[inline]
    pub fn arm_read(&self, fd: RawFd) -> io::Result<()> {
        self.set_interest(fd, Ready::readable(), true)
    }

    fn set_interest(&self, fd: RawFd, bit: Ready, on: bool) -> io::Result<()> {
        let mut conns = self.conns.write().unwrap();
        let entry = match conns.get_mut(&fd) {
            Some(entry) => entry,
            // Already removed; nothing to toggle.
            None => return Ok(()),
        };

        if on == entry.interest.contains(bit) {
            return Ok(());
        }
        if on {
            entry.interest.insert(bit);
        } else {
            entry.interest.remove(bit);
        }

        self.iomux.modify(
            entry.conn.stream(),
            Token(fd as usize),
            entry.interest,
            PollOpt::edge(),
        )
    }

    /// Tear a connection down: unregister, shut the socket down and erase
    /// the entry atomically under the write lock. Dropping the entry drops
    /// the write-wait sender, so a parked writer wakes with a disconnect.
    pub fn remove(&self, fd: RawFd) {
        let entry = {
            let mut conns = self.conns.write().unwrap();
            match conns.remove(&fd) {
                Some(entry) => {
                    let _ = self.iomux.remove(entry.conn.stream());
                    entry.conn.mark_closed();
                    self.load.fetch_sub(1, Ordering::Relaxed);
                    Some(entry)
                }
                None => None,
            }
        };

        if entry.is_some() {
            debug!(self.log, "connection removed"; "fd" => fd);
        }
    }

    fn wait_loop(self: Arc<SubReactor>, decode_queue: Sender<Vec<Arc<Connection>>>) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        loop {
            if let Err(err) = self.iomux.wait(&mut events) {
                error!(self.log, "multiplexer failure, sub reactor terminating"; "error" => %err);
                return;
            }

            // A fresh batch container per event set; the decode pool owns it
            // after the send.
            let mut batch: Vec<Arc<Connection>> = Vec::new();

            for event in &events {
                let fd = event.token().0 as RawFd;
                let readiness = event.readiness();
                let unix_readiness = UnixReady::from(readiness);

                // Hangup and error conditions surface through the read path,
                // where the decoder observes the close.
                if readiness.is_readable() || unix_readiness.is_hup() || unix_readiness.is_error()
                {
                    let conn = {
                        let conns = self.conns.read().unwrap();
                        conns.get(&fd).map(|entry| entry.conn.clone())
                    };
                    if let Some(conn) = conn {
                        batch.push(conn);
                    }
                    // Clear read interest so no second decoder touches the
                    // fd while this batch is in flight.
                    let _ = self.set_interest(fd, Ready::readable(), false);
                }

                if readiness.is_writable() {
                    {
                        let conns = self.conns.read().unwrap();
                        if let Some(entry) = conns.get(&fd) {
                            let _ = entry.signal.try_send(());
                        }
                    }
                    let _ = self.set_interest(fd, Ready::writable(), false);
                }
            }

            if !batch.is_empty() && decode_queue.send(batch).is_err() {
                return;
            }
        }
    }
}
