use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use slog::{debug, warn};

use crate::conn::Connection;
use crate::error::NetError;
use crate::server::{Request, Server};

/// Decode-pool loop: drain every connection in a readiness batch. The
/// subReactor cleared read interest before batching, so this decoder is the
/// only one touching each connection; `Wait` hands the fd back by re-arming
/// read interest, anything else removes it.
pub(crate) fn run(
    server: Arc<Server>,
    batches: Receiver<Vec<Arc<Connection>>>,
    work_queue: Sender<Request>,
) {
    for batch in batches.iter() {
        for conn in batch {
            match server.drain_conn(&conn, &work_queue) {
                NetError::Wait => {
                    if let Err(err) = conn.sub().arm_read(conn.fd()) {
                        warn!(conn.log(), "read re-arm failed"; "error" => %err);
                        conn.sub().remove(conn.fd());
                    }
                }
                NetError::Close => {
                    debug!(conn.log(), "peer closed connection"; "context" => "decode");
                    conn.sub().remove(conn.fd());
                }
                NetError::Fatal(fault) => {
                    warn!(conn.log(), "connection failed";
                          "context" => "decode", "fault" => ?fault);
                    conn.sub().remove(conn.fd());
                }
            }
        }
    }
}
