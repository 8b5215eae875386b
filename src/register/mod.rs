//! Service registry with heartbeat-based liveness, plus the heartbeat sender
//! servers run against it.

pub mod balance;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};
use slog::{debug, o, warn, Logger};

use crate::client::{Client, ClientError};
use crate::error::ServiceError;
use crate::server::Server;
use crate::service::Service;

/// Snapshot returned by `Register.Get`: service name → live addresses.
pub type ServiceMap = IndexMap<String, Vec<String>>;

/// Announcement payload for `Register.Post`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostInfo {
    pub address: String,
    pub services: Vec<String>,
}

struct Lease {
    services: Vec<String>,
    heartbeat: Instant,
}

/// Lease table behind the registry's RPC surface. A server is live while its
/// last heartbeat is newer than the TTL; a TTL of zero never expires.
pub struct Register {
    leases: Mutex<HashMap<String, Lease>>,
    ttl: Duration,
    log: Logger,
}

impl Register {
    pub fn new(ttl: Duration, log: &Logger) -> Arc<Register> {
        Arc::new(Register {
            leases: Mutex::new(HashMap::new()),
            ttl,
            log: log.new(o!("component" => "register")),
        })
    }

    /// Record (or replace) the services hosted at an address and stamp its
    /// heartbeat.
    pub fn post(&self, info: PostInfo) {
        debug!(self.log, "services posted";
               "address" => info.address.as_str(), "services" => info.services.len());
        let mut leases = self.leases.lock().unwrap();
        leases.insert(
            info.address,
            Lease {
                services: info.services,
                heartbeat: Instant::now(),
            },
        );
    }

    /// Refresh an address's heartbeat. The lease mutation stays under the
    /// table lock so the stamp is atomic with the lookup.
    pub fn put(&self, address: &str) -> Result<(), ServiceError> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get_mut(address) {
            Some(lease) => {
                lease.heartbeat = Instant::now();
                Ok(())
            }
            None => Err(ServiceError::new("please call Post to register")),
        }
    }

    /// Snapshot of currently live services.
    pub fn alive(&self) -> ServiceMap {
        let leases = self.leases.lock().unwrap();
        let mut snapshot = ServiceMap::new();

        for (address, lease) in leases.iter() {
            if !self.is_live(lease) {
                continue;
            }
            for service in &lease.services {
                snapshot
                    .entry(service.clone())
                    .or_insert_with(Vec::new)
                    .push(address.clone());
            }
        }

        snapshot
    }

    #[inline]
    fn is_live(&self, lease: &Lease) -> bool {
        self.ttl == Duration::from_secs(0) || lease.heartbeat.elapsed() < self.ttl
    }

    /// The registry's RPC surface: `Register.Post`, `Register.Put`,
    /// `Register.Get`.
    pub fn service(register: &Arc<Register>) -> Service {
        let mut service = Service::new("Register", &register.log);

        let inner = register.clone();
        service.method("Post", move |info: PostInfo, _: &mut ()| {
            inner.post(info);
            Ok(())
        });

        let inner = register.clone();
        service.method("Put", move |address: String, _: &mut ()| inner.put(&address));

        let inner = register.clone();
        service.method("Get", move |_: (), reply: &mut ServiceMap| {
            *reply = inner.alive();
            Ok(())
        });

        service
    }
}

/// Heartbeat sender run by an RPC server against the registry: announce the
/// hosted services once, then refresh the lease on an interval until the
/// registry connection closes.
pub struct Heartbeat {
    address: String,
    client: Arc<Client>,
    log: Logger,
}

impl Heartbeat {
    pub fn new<S: Into<String>>(address: S, client: Arc<Client>, log: &Logger) -> Heartbeat {
        let address = address.into();
        Heartbeat {
            log: log.new(o!("component" => "heartbeat", "address" => address.clone())),
            address,
            client,
        }
    }

    /// Announce every `Service.Method` the server exposes.
    pub fn announce(&self, server: &Server) -> Result<(), ClientError> {
        self.post_services(server.services())
    }

    pub fn post_services(&self, services: Vec<String>) -> Result<(), ClientError> {
        self.client.call::<PostInfo, ()>(
            "Register.Post",
            PostInfo {
                address: self.address.clone(),
                services,
            },
        )
    }

    /// Blocking heartbeat loop; returns when the registry client closes.
    pub fn run(&self, interval: Duration) {
        while !self.client.is_closed() {
            thread::sleep(interval);
            if self.client.is_closed() {
                return;
            }
            if let Err(err) = self
                .client
                .call::<String, ()>("Register.Put", self.address.clone())
            {
                warn!(self.log, "rpc client: heartbeat failed"; "error" => %err);
            }
        }
    }

    /// Spawn the heartbeat loop on its own thread.
    pub fn spawn(self, interval: Duration) {
        thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || self.run(interval))
            .expect("spawning heartbeat thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    fn post(register: &Register, address: &str, services: &[&str]) {
        register.post(PostInfo {
            address: address.to_string(),
            services: services.iter().map(|s| s.to_string()).collect(),
        });
    }

    #[test]
    fn put_before_post_is_refused() {
        let log = logging::discard();
        let register = Register::new(Duration::from_secs(120), &log);
        assert_eq!(
            register.put("127.0.0.1:7000").unwrap_err(),
            ServiceError::new("please call Post to register")
        );
    }

    #[test]
    fn leases_expire_without_heartbeats() {
        let log = logging::discard();
        let register = Register::new(Duration::from_millis(30), &log);
        post(&register, "127.0.0.1:7000", &["Arith.Sum"]);

        assert!(register.alive().contains_key("Arith.Sum"));
        thread::sleep(Duration::from_millis(60));
        assert!(register.alive().is_empty());
    }

    #[test]
    fn put_keeps_the_lease_alive() {
        let log = logging::discard();
        let register = Register::new(Duration::from_millis(80), &log);
        post(&register, "127.0.0.1:7000", &["Arith.Sum"]);

        for _ in 0..3 {
            thread::sleep(Duration::from_millis(40));
            register.put("127.0.0.1:7000").unwrap();
        }
        assert!(register.alive().contains_key("Arith.Sum"));
    }

    #[test]
    fn zero_ttl_never_expires() {
        let log = logging::discard();
        let register = Register::new(Duration::from_secs(0), &log);
        post(&register, "127.0.0.1:7000", &["Arith.Sum"]);

        thread::sleep(Duration::from_millis(20));
        assert!(register.alive().contains_key("Arith.Sum"));
    }

    #[test]
    fn snapshot_groups_addresses_by_service() {
        let log = logging::discard();
        let register = Register::new(Duration::from_secs(120), &log);
        post(&register, "127.0.0.1:7000", &["Arith.Sum", "Arith.Mul"]);
        post(&register, "127.0.0.1:7001", &["Arith.Sum"]);

        let snapshot = register.alive();
        assert_eq!(snapshot["Arith.Sum"].len(), 2);
        assert_eq!(snapshot["Arith.Mul"].len(), 1);
    }
}
