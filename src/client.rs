use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{debug, o, warn, Logger};

use crate::buffer::Buffer;
use crate::codec::{Body, BodyCell, CodecError, CodecRegistry, Decode, Encode, Handshake, Header};
use crate::error::NetError;
use crate::frame;

#[derive(Debug, PartialEq)]
pub enum ClientError {
    Io(io::ErrorKind),
    /// Local serialization trouble, or a reply that did not fit its type.
    Codec(String),
    /// The server reported a failure through the response header.
    Remote(String),
    /// The connection is gone; pending and future calls fail with this.
    Closed,
    UnknownCodec(String),
    /// The balancer found no live server for the service.
    Unavailable(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientError::Io(kind) => write!(f, "rpc client: io error: {:?}", kind),
            ClientError::Codec(message) => write!(f, "rpc client: codec error: {}", message),
            ClientError::Remote(message) => f.write_str(message),
            ClientError::Closed => write!(f, "rpc client: connection closed"),
            ClientError::UnknownCodec(name) => {
                write!(f, "rpc client: unknown codec type {}", name)
            }
            ClientError::Unavailable(name) => {
                write!(f, "rpc balance: no available server for {}", name)
            }
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(err.kind())
    }
}

type ReplySlot = (Box<dyn Body>, Sender<Result<Box<dyn Body>, ClientError>>);

struct ClientWriter {
    stream: TcpStream,
    encoder: Box<dyn Encode>,
    buf: Buffer,
}

/// An in-flight call started with [`Client::go`]; `wait` blocks for the
/// reply. Replies arrive in whatever order the server finishes them; the
/// sequence number is the correlation key, not the arrival order.
pub struct Call {
    seq: u64,
    done: Receiver<Result<Box<dyn Body>, ClientError>>,
}

impl Call {
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn wait<R>(self) -> Result<R, ClientError>
    where
        R: Serialize + DeserializeOwned + Default + Send + 'static,
    {
        match self.done.recv() {
            Err(_) => Err(ClientError::Closed),
            Ok(Err(err)) => Err(err),
            Ok(Ok(body)) => match body.into_any().downcast::<BodyCell<R>>() {
                Ok(cell) => Ok(cell.value),
                Err(_) => Err(ClientError::Codec("reply type mismatch".to_string())),
            },
        }
    }
}

/// Blocking client speaking the full wire protocol: length-prefixed
/// handshake, then concurrent calls multiplexed over one connection. A
/// sending lock serializes request writes; a receive thread completes calls
/// by sequence number.
pub struct Client {
    seq: AtomicU64,
    writer: Mutex<ClientWriter>,
    pending: Arc<Mutex<HashMap<u64, ReplySlot>>>,
    closed: Arc<AtomicBool>,
    log: Logger,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        codec: &str,
        log: &Logger,
    ) -> Result<Client, ClientError> {
        Client::connect_with(addr, codec, &CodecRegistry::with_defaults(), log)
    }

    pub fn connect_with<A: ToSocketAddrs>(
        addr: A,
        codec: &str,
        registry: &CodecRegistry,
        log: &Logger,
    ) -> Result<Client, ClientError> {
        let (decoder, encoder) = registry
            .create(codec)
            .ok_or_else(|| ClientError::UnknownCodec(codec.to_string()))?;

        let stream = TcpStream::connect(addr)?;
        let blob = serde_json::to_vec(&Handshake {
            codec_type: codec.to_string(),
        })
        .map_err(|err| ClientError::Codec(err.to_string()))?;
        frame::write_handshake(&stream, &blob)?;

        let log = log.new(o!("codec" => codec.to_string()));
        let pending: Arc<Mutex<HashMap<u64, ReplySlot>>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let read_stream = stream.try_clone()?;
        {
            let pending = pending.clone();
            let closed = closed.clone();
            let log = log.clone();
            thread::Builder::new()
                .name("client-recv".to_string())
                .spawn(move || receive_loop(read_stream, decoder, pending, closed, log))
                .expect("spawning client receive thread");
        }

        debug!(log, "rpc client: connected");
        Ok(Client {
            seq: AtomicU64::new(0),
            writer: Mutex::new(ClientWriter {
                stream,
                encoder,
                buf: Buffer::new(),
            }),
            pending,
            closed,
            log,
        })
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the connection down; every pending call completes with `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let writer = self.writer.lock().unwrap();
        let _ = writer.stream.shutdown(Shutdown::Both);
    }

    /// Start a call; the returned [`Call`] resolves when the matching
    /// sequence comes back.
    pub fn go<A, R>(&self, service_method: &str, args: A) -> Result<Call, ClientError>
    where
        A: Serialize + DeserializeOwned + Default + Send + 'static,
        R: Serialize + DeserializeOwned + Default + Send + 'static,
    {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (done_tx, done_rx) = bounded(1);
        self.pending
            .lock()
            .unwrap()
            .insert(seq, (Box::new(BodyCell::<R>::default()), done_tx));

        let header = Header::new(service_method, seq);
        let body = BodyCell::new(args);

        let result = self.transmit(&header, &body);
        if let Err(err) = result {
            self.pending.lock().unwrap().remove(&seq);
            return Err(err);
        }

        Ok(Call { seq, done: done_rx })
    }

    /// Synchronous call: `go` plus wait.
    pub fn call<A, R>(&self, service_method: &str, args: A) -> Result<R, ClientError>
    where
        A: Serialize + DeserializeOwned + Default + Send + 'static,
        R: Serialize + DeserializeOwned + Default + Send + 'static,
    {
        self.go::<A, R>(service_method, args)?.wait()
    }

    fn transmit(&self, header: &Header, body: &dyn Body) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().unwrap();
        let writer = &mut *writer;

        if let Err(err) = writer.encoder.write(&mut writer.buf, header, Some(body)) {
            // The buffer may hold a partial message; discard it so the next
            // call starts clean.
            writer.buf.clear();
            return Err(ClientError::Codec(err.to_string()));
        }

        while !writer.buf.is_empty() {
            if let Err(err) = writer.buf.egress(&writer.stream) {
                self.closed.store(true, Ordering::Release);
                return Err(err.into());
            }
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(
    stream: TcpStream,
    mut decoder: Box<dyn Decode>,
    pending: Arc<Mutex<HashMap<u64, ReplySlot>>>,
    closed: Arc<AtomicBool>,
    log: Logger,
) {
    let mut buf = Buffer::new();

    loop {
        // Header record.
        let header = loop {
            match decoder.read_header(buf.read_slice()) {
                Ok((header, consumed)) => {
                    buf.consume(consumed);
                    break header;
                }
                Err(CodecError::Incomplete) => {
                    if let Err(err) = frame::fill(&mut buf, &stream) {
                        if err != NetError::Close {
                            warn!(log, "rpc client: read error"; "error" => %err);
                        }
                        fail_all(&pending, &closed);
                        return;
                    }
                }
                Err(err) => {
                    warn!(log, "rpc client: header decode error"; "error" => %err);
                    fail_all(&pending, &closed);
                    return;
                }
            }
        };

        let slot = pending.lock().unwrap().remove(&header.seq);

        // Body record. A reply carrying an error has an empty body, which is
        // skipped; an unexpected sequence is drained the same way.
        let target_needed = header.error.is_empty() && slot.is_some();
        let (mut reply, done) = match slot {
            Some((reply, done)) => (Some(reply), Some(done)),
            None => (None, None),
        };

        let body_result = read_body_blocking(
            &mut decoder,
            &mut buf,
            &stream,
            if target_needed {
                reply.as_mut().map(|body| body.as_mut() as &mut dyn Body)
            } else {
                None
            },
        );

        match body_result {
            Ok(()) => {
                if let Some(done) = done {
                    let outcome = if header.error.is_empty() {
                        Ok(reply.expect("reply slot present"))
                    } else {
                        Err(ClientError::Remote(header.error))
                    };
                    let _ = done.send(outcome);
                }
            }
            Err(BodyFailure::Soft(err)) => {
                if let Some(done) = done {
                    let _ = done.send(Err(err));
                }
            }
            Err(BodyFailure::Fatal(err)) => {
                if let Some(done) = done {
                    let _ = done.send(Err(err));
                }
                fail_all(&pending, &closed);
                return;
            }
        }
    }
}

enum BodyFailure {
    /// The record was consumed; the stream stays usable.
    Soft(ClientError),
    /// The stream is desynchronized or gone.
    Fatal(ClientError),
}

fn read_body_blocking(
    decoder: &mut Box<dyn Decode>,
    buf: &mut Buffer,
    stream: &TcpStream,
    mut body: Option<&mut dyn Body>,
) -> Result<(), BodyFailure> {
    loop {
        let target: Option<&mut dyn Body> = match body {
            Some(ref mut body) => Some(&mut **body),
            None => None,
        };
        match decoder.read_body(buf.read_slice(), target) {
            Ok(consumed) => {
                buf.consume(consumed);
                return Ok(());
            }
            Err(CodecError::Incomplete) => {
                if let Err(err) = frame::fill(buf, stream) {
                    let client_err = match err {
                        NetError::Close => ClientError::Closed,
                        NetError::Fatal(fault) => ClientError::Codec(format!("{:?}", fault)),
                        NetError::Wait => continue,
                    };
                    return Err(BodyFailure::Fatal(client_err));
                }
            }
            Err(CodecError::Value { consumed, message }) => {
                buf.consume(consumed);
                return Err(BodyFailure::Soft(ClientError::Codec(message)));
            }
            Err(err) => {
                return Err(BodyFailure::Fatal(ClientError::Codec(err.to_string())));
            }
        }
    }
}

fn fail_all(pending: &Arc<Mutex<HashMap<u64, ReplySlot>>>, closed: &Arc<AtomicBool>) {
    closed.store(true, Ordering::Release);
    let mut pending = pending.lock().unwrap();
    for (_, (_, done)) in pending.drain() {
        let _ = done.send(Err(ClientError::Closed));
    }
}
