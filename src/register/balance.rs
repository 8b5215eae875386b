//! Client-side load balancing over the registry's live-service snapshot.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{debug, o, Logger};

use super::ServiceMap;
use crate::client::{Call, Client, ClientError};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SelectMode {
    Random,
    RoundRobin,
}

struct Snapshot {
    services: ServiceMap,
    // Round-robin cursors start at a random index per service so a cold
    // cache does not aim every service at the same server.
    cursors: HashMap<String, usize>,
    refreshed: Option<Instant>,
}

/// Cache of the `Register.Get` snapshot, refreshed when older than the
/// configured TTL (zero: refresh once, never again).
pub struct Balance {
    client: Arc<Client>,
    ttl: Duration,
    state: Mutex<Snapshot>,
    log: Logger,
}

impl Balance {
    pub fn new(client: Arc<Client>, ttl: Duration, log: &Logger) -> Balance {
        Balance {
            client,
            ttl,
            state: Mutex::new(Snapshot {
                services: ServiceMap::new(),
                cursors: HashMap::new(),
                refreshed: None,
            }),
            log: log.new(o!("component" => "balance")),
        }
    }

    /// Pick a live address for `service` according to `mode`.
    pub fn get(&self, mode: SelectMode, service: &str) -> Result<String, ClientError> {
        let mut state = self.state.lock().unwrap();
        self.refresh(&mut state)?;

        let Snapshot {
            services, cursors, ..
        } = &mut *state;

        let addrs = match services.get(service) {
            Some(addrs) if !addrs.is_empty() => addrs,
            _ => return Err(ClientError::Unavailable(service.to_string())),
        };

        let addr = match mode {
            SelectMode::Random => {
                let index = rand::thread_rng().gen_range(0..addrs.len());
                addrs[index].clone()
            }
            SelectMode::RoundRobin => {
                let cursor = cursors.entry(service.to_string()).or_insert(0);
                let addr = addrs[*cursor % addrs.len()].clone();
                *cursor = (*cursor + 1) % addrs.len();
                addr
            }
        };

        Ok(addr)
    }

    fn refresh(&self, state: &mut Snapshot) -> Result<(), ClientError> {
        if self.is_fresh(state) {
            return Ok(());
        }

        debug!(self.log, "refreshing services from register");
        let services: ServiceMap = self.client.call("Register.Get", ())?;

        let mut rng = rand::thread_rng();
        state.cursors = services
            .keys()
            .map(|service| (service.clone(), rng.gen_range(0..i32::MAX as usize)))
            .collect();

        if !services.is_empty() {
            state.refreshed = Some(Instant::now());
        }
        state.services = services;
        Ok(())
    }

    fn is_fresh(&self, state: &Snapshot) -> bool {
        match state.refreshed {
            Some(at) => {
                (self.ttl == Duration::from_secs(0) && !state.services.is_empty())
                    || at.elapsed() < self.ttl
            }
            None => false,
        }
    }
}

/// A calling client that resolves every `Service.Method` through the
/// balancer, keeping one live connection per chosen server and replacing
/// connections it finds closed.
pub struct BalanceClient {
    balance: Balance,
    mode: SelectMode,
    codec: String,
    clients: Mutex<HashMap<String, Arc<Client>>>,
    log: Logger,
}

impl BalanceClient {
    pub fn connect(
        registry_addr: &str,
        mode: SelectMode,
        codec: &str,
        ttl: Duration,
        log: &Logger,
    ) -> Result<BalanceClient, ClientError> {
        let registry = Arc::new(Client::connect(registry_addr, codec, log)?);
        Ok(BalanceClient {
            balance: Balance::new(registry, ttl, log),
            mode,
            codec: codec.to_string(),
            clients: Mutex::new(HashMap::new()),
            log: log.clone(),
        })
    }

    fn client_for(&self, service_method: &str) -> Result<Arc<Client>, ClientError> {
        let addr = self.balance.get(self.mode, service_method)?;

        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(&addr) {
            if !client.is_closed() {
                return Ok(client.clone());
            }
        }

        // Holding the map lock across the dial keeps construction single-
        // flight per address.
        let client = Arc::new(Client::connect(addr.as_str(), &self.codec, &self.log)?);
        clients.insert(addr, client.clone());
        Ok(client)
    }

    pub fn call<A, R>(&self, service_method: &str, args: A) -> Result<R, ClientError>
    where
        A: Serialize + DeserializeOwned + Default + Send + 'static,
        R: Serialize + DeserializeOwned + Default + Send + 'static,
    {
        self.client_for(service_method)?.call(service_method, args)
    }

    pub fn go<A, R>(&self, service_method: &str, args: A) -> Result<Call, ClientError>
    where
        A: Serialize + DeserializeOwned + Default + Send + 'static,
        R: Serialize + DeserializeOwned + Default + Send + 'static,
    {
        self.client_for(service_method)?.go::<A, R>(service_method, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    fn snapshot_with(addrs: &[&str]) -> Snapshot {
        let mut services = ServiceMap::new();
        services.insert(
            "Arith.Sum".to_string(),
            addrs.iter().map(|a| a.to_string()).collect(),
        );
        Snapshot {
            services,
            cursors: HashMap::new(),
            refreshed: Some(Instant::now()),
        }
    }

    fn balance_with(addrs: &[&str]) -> Balance {
        // No live registry needed: the snapshot is pre-seeded and fresh.
        let log = logging::discard();
        Balance {
            client: unreachable_client(),
            ttl: Duration::from_secs(3600),
            state: Mutex::new(snapshot_with(addrs)),
            log,
        }
    }

    fn unreachable_client() -> Arc<Client> {
        // A listener nobody answers on; the balancer must not dial it while
        // the snapshot is fresh.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        Arc::new(Client::connect(addr, "bin", &logging::discard()).unwrap())
    }

    #[test]
    fn round_robin_cycles_through_addresses() {
        let balance = balance_with(&["a:1", "b:2", "c:3"]);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(balance.get(SelectMode::RoundRobin, "Arith.Sum").unwrap());
        }
        assert_eq!(seen[0..3], seen[3..6]);
        let mut unique = seen[0..3].to_vec();
        unique.sort();
        assert_eq!(unique, vec!["a:1", "b:2", "c:3"]);
    }

    #[test]
    fn random_picks_known_addresses() {
        let balance = balance_with(&["a:1", "b:2"]);
        for _ in 0..20 {
            let addr = balance.get(SelectMode::Random, "Arith.Sum").unwrap();
            assert!(addr == "a:1" || addr == "b:2");
        }
    }

    #[test]
    fn missing_service_is_unavailable() {
        let balance = balance_with(&["a:1"]);
        assert_eq!(
            balance.get(SelectMode::Random, "Arith.Mul").unwrap_err(),
            ClientError::Unavailable("Arith.Mul".to_string())
        );
    }
}
