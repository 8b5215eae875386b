use std::io;
use std::mem;
use std::sync::Arc;

use crossbeam_channel::Sender;
use slog::{debug, warn, Logger};

use crate::codec::{Body, BodyCell, CodecError, CodecRegistry, Handshake, Header};
use crate::config::Config;
use crate::conn::{ConnReader, Connection, Pending, ReadPhase};
use crate::error::{Fault, NetError, NetResult};
use crate::frame;
use crate::reactor::{self, ReactorHandle};
use crate::service::{Dispatcher, MethodType, Service};

/// One in-flight call. Created by the decode stage, handled by a worker,
/// written out by a writer; each hand-off through a queue is a move. The
/// header always travels with it; its error field is how soft failures
/// reach the peer.
pub struct Request {
    pub(crate) conn: Arc<Connection>,
    pub header: Header,
    pub(crate) method: Option<Arc<MethodType>>,
    pub(crate) argv: Option<Box<dyn Body>>,
    pub(crate) reply: Option<Box<dyn Body>>,
}

/// The RPC server: dispatch registry plus codec table. The reactor stages
/// borrow it through an `Arc` and call the stage operations below.
pub struct Server {
    dispatcher: Dispatcher,
    codecs: CodecRegistry,
    log: Logger,
}

impl Server {
    pub fn new(log: Logger) -> Server {
        Server::with_codecs(CodecRegistry::with_defaults(), log)
    }

    pub fn with_codecs(codecs: CodecRegistry, log: Logger) -> Server {
        Server {
            dispatcher: Dispatcher::new(&log),
            codecs,
            log,
        }
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn register(&self, service: Service) {
        self.dispatcher.register(service);
    }

    /// Every registered `Service.Method` name, in registry announcement
    /// form.
    pub fn services(&self) -> Vec<String> {
        self.dispatcher.services()
    }

    /// Bind `addr` and spawn the reactor topology around `server`. Returns
    /// once the listening socket is live.
    pub fn serve(server: &Arc<Server>, addr: &str, config: &Config) -> io::Result<ReactorHandle> {
        reactor::serve(server.clone(), addr, config)
    }

    /// Drain one ready connection: negotiate the codec if this is the first
    /// read, then decode header+body pairs and emit worker tasks until the
    /// socket would block. Edge-triggered readiness only fires on
    /// transitions, so returning before `Wait` would strand buffered
    /// requests. Never returns `Ok`.
    pub(crate) fn drain_conn(&self, conn: &Arc<Connection>, emit: &Sender<Request>) -> NetError {
        let mut reader = conn.reader.lock().unwrap();

        loop {
            let step = match reader.phase {
                ReadPhase::Handshake => self.select_codec(conn, &mut reader),
                ReadPhase::Header => self.read_header(conn, &mut reader),
                ReadPhase::Body(_) => self.read_body(conn, &mut reader, emit),
            };

            if let Err(err) = step {
                return err;
            }
        }
    }

    /// Negotiation step, once per connection: parse the length-prefixed
    /// blob, look the codec up, install both halves. An unknown name is
    /// fatal for the connection.
    fn select_codec(&self, conn: &Arc<Connection>, reader: &mut ConnReader) -> NetResult<()> {
        loop {
            let parsed = match frame::take_handshake(reader.buf.read_slice()) {
                Ok((blob, consumed)) => {
                    let handshake: Result<Handshake, _> = serde_json::from_slice(blob);
                    Some((handshake, consumed))
                }
                Err(CodecError::Incomplete) => None,
                Err(_) => return Err(NetError::Fatal(Fault::Handshake)),
            };

            match parsed {
                None => {
                    conn.fill_read(reader)?;
                }
                Some((handshake, consumed)) => {
                    reader.buf.consume(consumed);
                    let handshake = match handshake {
                        Ok(handshake) => handshake,
                        Err(err) => {
                            warn!(conn.log(), "rpc server: bad negotiation blob";
                                  "context" => "handshake", "error" => %err);
                            return Err(NetError::Fatal(Fault::Handshake));
                        }
                    };

                    let (decoder, encoder) = match self.codecs.create(&handshake.codec_type) {
                        Some(parts) => parts,
                        None => {
                            warn!(conn.log(), "rpc server: invalid codec type";
                                  "context" => "handshake", "codec" => handshake.codec_type.as_str());
                            return Err(NetError::Fatal(Fault::UnknownCodec));
                        }
                    };

                    debug!(conn.log(), "codec negotiated";
                           "context" => "handshake", "codec" => handshake.codec_type.as_str());
                    reader.decoder = Some(decoder);
                    conn.writer.lock().unwrap().encoder = Some(encoder);
                    reader.phase = ReadPhase::Header;
                    return Ok(());
                }
            }
        }
    }

    /// Parse one header record and resolve its method. Resolution failures
    /// are soft: the error rides the header into the `Body` phase so the
    /// request still flows to the writer, and the body record is skipped to
    /// keep the stream aligned.
    fn read_header(&self, conn: &Arc<Connection>, reader: &mut ConnReader) -> NetResult<()> {
        loop {
            let decoder = reader.decoder.as_mut().expect("header read before negotiation");
            match decoder.read_header(reader.buf.read_slice()) {
                Ok((header, consumed)) => {
                    reader.buf.consume(consumed);

                    let mut pending = Pending {
                        header,
                        method: None,
                    };
                    match self.dispatcher.find(&pending.header.service_method) {
                        Ok((_, method)) => pending.method = Some(method),
                        Err(err) => pending.header.error = err.to_string(),
                    }

                    reader.phase = ReadPhase::Body(pending);
                    return Ok(());
                }
                Err(CodecError::Incomplete) => {
                    conn.fill_read(reader)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Parse (or skip) the body record belonging to the pending header, then
    /// emit the worker task and return to the `Header` phase.
    fn read_body(
        &self,
        conn: &Arc<Connection>,
        reader: &mut ConnReader,
        emit: &Sender<Request>,
    ) -> NetResult<()> {
        loop {
            let method = match &reader.phase {
                ReadPhase::Body(pending) => pending.method.clone(),
                _ => unreachable!("read_body outside body phase"),
            };
            // A fresh zero value per attempt; decoding replaces it wholly.
            let mut argv = method.as_ref().map(|method| method.new_argv());

            let decoder = reader.decoder.as_mut().expect("body read before negotiation");
            let outcome = decoder.read_body(
                reader.buf.read_slice(),
                argv.as_mut().map(|body| body.as_mut() as &mut dyn Body),
            );

            match outcome {
                Ok(consumed) => {
                    reader.buf.consume(consumed);
                    return self.emit_request(conn, reader, argv, None, emit);
                }
                Err(CodecError::Value { consumed, message }) => {
                    reader.buf.consume(consumed);
                    let error = format!("rpc server: read argv error: {}", message);
                    return self.emit_request(conn, reader, None, Some(error), emit);
                }
                Err(CodecError::Incomplete) => {
                    conn.fill_read(reader)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn emit_request(
        &self,
        conn: &Arc<Connection>,
        reader: &mut ConnReader,
        argv: Option<Box<dyn Body>>,
        error: Option<String>,
        emit: &Sender<Request>,
    ) -> NetResult<()> {
        let pending = match mem::replace(&mut reader.phase, ReadPhase::Header) {
            ReadPhase::Body(pending) => pending,
            _ => unreachable!("emit outside body phase"),
        };

        let mut request = Request {
            conn: conn.clone(),
            reply: pending.method.as_ref().map(|method| method.new_reply()),
            header: pending.header,
            method: pending.method,
            argv,
        };
        if let Some(error) = error {
            request.header.error = error;
        }

        // The queues only close on process teardown.
        emit.send(request).map_err(|_| NetError::Close)
    }

    /// Worker-side invocation. Requests that already carry an error pass
    /// straight through to the writer; a method error is copied into the
    /// header for the peer.
    pub(crate) fn handle_request(&self, request: &mut Request) {
        if !request.header.error.is_empty() {
            return;
        }

        let method = request
            .method
            .as_ref()
            .expect("error-free request without method")
            .clone();
        let argv = request
            .argv
            .as_mut()
            .expect("error-free request without argument");
        let reply = request
            .reply
            .as_mut()
            .expect("error-free request without reply");

        if let Err(err) = method.invoke(argv.as_any_mut(), reply.as_any_mut()) {
            request.header.error = err.0;
        }
    }

    /// Writer-side transmission under the connection's sending lock. A
    /// failed response carries an empty body so the peer's stream stays
    /// parseable; any write failure is fatal for the connection.
    pub(crate) fn send_response(&self, request: &Request) -> NetResult<()> {
        let conn = &request.conn;
        let mut writer = conn.writer.lock().unwrap();

        let empty = BodyCell::new(());
        let body: &dyn Body = if request.header.error.is_empty() {
            match &request.reply {
                Some(reply) => reply.as_ref(),
                None => &empty,
            }
        } else {
            &empty
        };

        let result = conn.send_message(&mut writer, &request.header, Some(body));
        if let Err(err) = &result {
            if *err != NetError::Close {
                warn!(conn.log(), "rpc server: write response error";
                      "context" => "send", "seq" => request.header.seq, "error" => %err);
            }
        }
        result
    }
}
