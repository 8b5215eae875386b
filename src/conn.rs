use std::net::Shutdown;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};
use mio::net::TcpStream;
use slog::{o, trace, Logger};

use crate::buffer::Buffer;
use crate::codec::{Body, Decode, Encode, Header};
use crate::error::{NetError, NetResult};
use crate::frame;
use crate::reactor::sub_reactor::{Intake, SubReactor};
use crate::service::MethodType;

/// Where a connection's inbound stream currently stands. `Body` is the
/// partial-read resumption point: the header (and its resolution) survive
/// readiness edges while the body record trickles in.
pub(crate) enum ReadPhase {
    Handshake,
    Header,
    Body(Pending),
}

pub(crate) struct Pending {
    pub header: Header,
    pub method: Option<Arc<MethodType>>,
}

/// Inbound half: read buffer, phase machine and the decoder half of the
/// negotiated codec. The mutex doubles as the codec-install lock; the
/// clear-then-rearm protocol keeps it uncontended.
pub(crate) struct ConnReader {
    pub buf: Buffer,
    pub phase: ReadPhase,
    pub decoder: Option<Box<dyn Decode>>,
}

/// Outbound half: write buffer and the encoder half. The mutex is the
/// per-connection sending lock; holding it across encode+drain is what keeps
/// responses from interleaving on the wire.
pub(crate) struct ConnWriter {
    pub buf: Buffer,
    pub encoder: Option<Box<dyn Encode>>,
}

/// One accepted socket and everything owned on its behalf. Shared by the
/// decode, worker and writer stages through an `Arc`; the owning subReactor
/// holds the entry that keeps it registered.
pub struct Connection {
    fd: RawFd,
    stream: TcpStream,
    pub(crate) reader: Mutex<ConnReader>,
    pub(crate) writer: Mutex<ConnWriter>,
    write_wait: Receiver<()>,
    sub: Arc<SubReactor>,
    intake: Sender<Intake>,
    closed: AtomicBool,
    log: Logger,
}

impl Connection {
    /// Wraps an accepted stream. Returns the connection and the sender side
    /// of its write-wait signal, which lives in the subReactor's entry so
    /// that removal wakes a parked writer.
    pub(crate) fn new(
        stream: TcpStream,
        fd: RawFd,
        sub: Arc<SubReactor>,
        intake: Sender<Intake>,
        log: &Logger,
    ) -> (Arc<Connection>, Sender<()>) {
        let (signal, write_wait) = bounded(1);

        let conn = Arc::new(Connection {
            fd,
            stream,
            reader: Mutex::new(ConnReader {
                buf: Buffer::new(),
                phase: ReadPhase::Handshake,
                decoder: None,
            }),
            writer: Mutex::new(ConnWriter {
                buf: Buffer::new(),
                encoder: None,
            }),
            write_wait,
            sub,
            intake,
            closed: AtomicBool::new(false),
            log: log.new(o!("fd" => fd)),
        });

        (conn, signal)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    #[inline]
    pub(crate) fn sub(&self) -> &Arc<SubReactor> {
        &self.sub
    }

    #[inline]
    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    /// Marks the connection dead and shuts the socket down so in-flight
    /// stages fail out promptly. The fd itself closes when the last `Arc`
    /// drops.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Pull whatever the socket has into the read buffer.
    pub(crate) fn fill_read(&self, reader: &mut ConnReader) -> NetResult<usize> {
        if self.is_closed() {
            return Err(NetError::Close);
        }
        frame::fill(&mut reader.buf, &self.stream)
    }

    /// Encode one message into the write buffer and push it out whole. When
    /// the socket blocks, write interest is armed *before* parking on the
    /// write-wait signal (lost-wake rule); the subReactor delivers the signal
    /// on the next writable edge, and entry removal drops the sender so a
    /// parked writer wakes with `Close` instead of hanging.
    pub(crate) fn send_message(
        &self,
        writer: &mut ConnWriter,
        header: &Header,
        body: Option<&dyn Body>,
    ) -> NetResult<()> {
        let encoder = writer
            .encoder
            .as_mut()
            .expect("send_message before codec negotiation");
        encoder.write(&mut writer.buf, header, body)?;

        loop {
            if self.is_closed() {
                writer.buf.clear();
                return Err(NetError::Close);
            }

            match frame::drain(&mut writer.buf, &self.stream) {
                Ok(()) => return Ok(()),
                Err(NetError::Wait) => {
                    trace!(self.log, "write blocked, parking";
                           "context" => "send", "pending" => writer.buf.len());
                    self.arm_write()?;
                    if self.write_wait.recv().is_err() {
                        return Err(NetError::Close);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Ask the owning subReactor's intake loop to enable write interest.
    fn arm_write(&self) -> NetResult<()> {
        self.intake
            .send(Intake::ArmWrite(self.fd))
            .map_err(|_| NetError::Close)
    }
}
