use std::any::Any;
use std::mem;
use std::sync::{Arc, RwLock};

use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{debug, warn, Logger};

use crate::codec::{Body, BodyCell};
use crate::error::{DispatchError, ServiceError};

type InvokeFn =
    Box<dyn Fn(&mut dyn Any, &mut dyn Any) -> Result<(), ServiceError> + Send + Sync>;

/// One registered method: type-erased hooks for materializing the argument
/// and reply values plus the invocation itself. Replaces runtime reflection
/// with hooks captured at registration time; the name is the only thing the
/// wire ever sees.
pub struct MethodType {
    new_argv: fn() -> Box<dyn Body>,
    new_reply: fn() -> Box<dyn Body>,
    invoke: InvokeFn,
}

impl std::fmt::Debug for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodType").finish()
    }
}

impl MethodType {
    /// Fresh zero-value argument, decoded into by the codec.
    #[inline]
    pub(crate) fn new_argv(&self) -> Box<dyn Body> {
        (self.new_argv)()
    }

    /// Fresh zero-value reply; maps and sequences start empty so codecs that
    /// round-trip null as empty behave uniformly.
    #[inline]
    pub(crate) fn new_reply(&self) -> Box<dyn Body> {
        (self.new_reply)()
    }

    pub(crate) fn invoke(
        &self,
        argv: &mut dyn Any,
        reply: &mut dyn Any,
    ) -> Result<(), ServiceError> {
        (self.invoke)(argv, reply)
    }
}

/// A named bundle of methods built around one receiver. Mutable while being
/// assembled; immutable once handed to [`Dispatcher::register`], which is
/// what lets request-time lookups run lock-free on the method map.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
    log: Logger,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .field("log", &self.log)
            .finish()
    }
}

impl Service {
    /// It is a startup misconfiguration, and therefore fatal, to use a
    /// service name that is not exported.
    pub fn new<S: Into<String>>(name: S, log: &Logger) -> Service {
        let name = name.into();
        if !is_exported(&name) {
            panic!("rpc server: {} is not a valid service name", name);
        }

        Service {
            log: log.new(slog::o!("service" => name.clone())),
            name,
            methods: HashMap::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a method under `name`. Eligibility mirrors the wire contract:
    /// the name must be exported, the argument decodable, the reply
    /// encodable from a zero value, and the closure reports failure through
    /// the error channel only. Ineligible names are skipped with a warning.
    pub fn method<A, R, F>(&mut self, name: &str, handler: F) -> &mut Service
    where
        A: Serialize + DeserializeOwned + Default + Send + 'static,
        R: Serialize + DeserializeOwned + Default + Send + 'static,
        F: Fn(A, &mut R) -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        if !is_exported(name) {
            warn!(self.log, "rpc server: skipping unexported method"; "method" => name);
            return self;
        }
        if self.methods.contains_key(name) {
            warn!(self.log, "rpc server: method already defined"; "method" => name);
            return self;
        }

        let method = MethodType {
            new_argv: || Box::new(BodyCell::<A>::default()),
            new_reply: || Box::new(BodyCell::<R>::default()),
            invoke: Box::new(move |argv, reply| {
                let argv = argv
                    .downcast_mut::<BodyCell<A>>()
                    .expect("argument cell type mismatch");
                let reply = reply
                    .downcast_mut::<BodyCell<R>>()
                    .expect("reply cell type mismatch");
                handler(mem::take(&mut argv.value), &mut reply.value)
            }),
        };

        debug!(self.log, "rpc server: register method"; "method" => name);
        self.methods.insert(name.to_string(), Arc::new(method));
        self
    }

    #[inline]
    pub(crate) fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    #[inline]
    fn find_method(&self, name: &str) -> Option<Arc<MethodType>> {
        self.methods.get(name).cloned()
    }
}

/// The request-time map from service name to descriptor. Registration is
/// rare and load-or-store; lookups are the hot path and take the read lock
/// only.
pub struct Dispatcher {
    services: RwLock<HashMap<String, Arc<Service>>>,
    log: Logger,
}

impl Dispatcher {
    pub fn new(log: &Logger) -> Dispatcher {
        Dispatcher {
            services: RwLock::new(HashMap::new()),
            log: log.clone(),
        }
    }

    /// Store the service; a duplicate name warns and keeps the first
    /// registration.
    pub fn register(&self, service: Service) {
        let mut services = self.services.write().unwrap();
        if services.contains_key(service.name()) {
            warn!(self.log, "rpc server: service already defined"; "service" => service.name());
            return;
        }
        services.insert(service.name().to_string(), Arc::new(service));
    }

    /// Resolve `Service.Method`, splitting on the last dot: method names may
    /// not contain dots, service names may.
    pub fn find(
        &self,
        service_method: &str,
    ) -> Result<(Arc<Service>, Arc<MethodType>), DispatchError> {
        let dot = match service_method.rfind('.') {
            Some(dot) => dot,
            None => return Err(DispatchError::IllFormed(service_method.to_string())),
        };
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);

        let service = {
            let services = self.services.read().unwrap();
            match services.get(service_name) {
                Some(service) => service.clone(),
                None => return Err(DispatchError::NoService(service_name.to_string())),
            }
        };

        match service.find_method(method_name) {
            Some(method) => Ok((service, method)),
            None => Err(DispatchError::NoMethod(service_method.to_string())),
        }
    }

    /// Every registered `Service.Method` name, for registry announcement.
    pub fn services(&self) -> Vec<String> {
        let services = self.services.read().unwrap();
        let mut names = Vec::new();
        for (service_name, service) in services.iter() {
            for method in service.method_names() {
                names.push(format!("{}.{}", service_name, method));
            }
        }
        names
    }
}

#[inline]
fn is_exported(name: &str) -> bool {
    name.as_bytes()
        .first()
        .map(|byte| byte.is_ascii_uppercase())
        .unwrap_or(false)
}
