use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::server::{Request, Server};

/// Worker-pool loop: invoke the resolved method and forward the request to
/// the writer stage unconditionally. The pool is large because user methods
/// are opaque and may block.
pub(crate) fn run(server: Arc<Server>, tasks: Receiver<Request>, write_queue: Sender<Request>) {
    for mut request in tasks.iter() {
        server.handle_request(&mut request);
        if write_queue.send(request).is_err() {
            return;
        }
    }
}
