//! A process-local registry that behaves like the remote one.
//!
//! Every connection handed out by a [ReferenceConnector] shares the same [ReferenceRegistry], so
//! state written through one connection is visible through every other.  The registry can be told
//! to misbehave so that the adapter's failure handling is observable without a remote node.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use zerror_core::ErrorCore;

use super::{Connector, Error, RegistryConnection};

/////////////////////////////////////////// Registration ///////////////////////////////////////////

#[derive(Clone, Debug)]
struct Registration {
    handle: u64,
    value: Option<Vec<u8>>,
}

impl Registration {
    fn lookup(&self) -> Vec<u8> {
        match &self.value {
            Some(value) => value.clone(),
            None => format!("<0.{}.0>", self.handle).into_bytes(),
        }
    }
}

///////////////////////////////////////// ReferenceRegistry ////////////////////////////////////////

#[derive(Debug)]
struct Inner {
    nodes: BTreeMap<String, BTreeMap<String, Registration>>,
    next_handle: u64,
    calls: u64,
    fail_after: Option<u64>,
    refuse_connections: bool,
    enumerate: bool,
}

impl Inner {
    fn call(&mut self, function: &str) -> Result<(), Error> {
        self.calls += 1;
        match self.fail_after {
            Some(limit) if self.calls > limit => Err(Error::RemoteCall {
                core: ErrorCore::default(),
                function: function.to_string(),
                what: "injected failure".to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn bind(&mut self, node: &str, name: &str, value: Option<&[u8]>) {
        let handle = self.next_handle;
        self.next_handle += 1;
        let registration = Registration {
            handle,
            value: value.map(|v| v.to_vec()),
        };
        self.nodes
            .entry(node.to_string())
            .or_default()
            .insert(name.to_string(), registration);
    }
}

/// An in-memory registry.  Clones share state.
#[derive(Clone, Debug)]
pub struct ReferenceRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ReferenceRegistry {
    pub fn new() -> Self {
        let inner = Inner {
            nodes: BTreeMap::new(),
            next_handle: 1,
            calls: 0,
            fail_after: None,
            refuse_connections: false,
            enumerate: true,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// A connector that links to `node` on this registry.
    pub fn connector(&self, node: &str) -> ReferenceConnector {
        ReferenceConnector {
            registry: self.clone(),
            node: node.to_string(),
        }
    }

    /// Make subsequent connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.lock().unwrap().refuse_connections = refuse;
    }

    /// Let `calls` more remote calls through, then fail every call after.  `None` heals the
    /// registry.
    pub fn fail_calls_after(&self, calls: Option<u64>) {
        let mut inner = self.inner.lock().unwrap();
        let issued = inner.calls;
        inner.fail_after = calls.map(|c| issued + c);
    }

    /// Behave like a registry that exports no enumeration call.
    pub fn disable_enumeration(&self) {
        self.inner.lock().unwrap().enumerate = false;
    }

    /// The number of remote calls issued against this registry.
    pub fn calls(&self) -> u64 {
        self.inner.lock().unwrap().calls
    }

    /// The names currently bound on `node`, sorted.
    pub fn names(&self, node: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .get(node)
            .map(|names| names.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for ReferenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//////////////////////////////////////// ReferenceConnector ////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct ReferenceConnector {
    registry: ReferenceRegistry,
    node: String,
}

impl Connector for ReferenceConnector {
    type Connection = ReferenceConnection;

    fn node(&self) -> &str {
        &self.node
    }

    fn connect(&self) -> Result<Self::Connection, Error> {
        if self.registry.inner.lock().unwrap().refuse_connections {
            return Err(Error::ConnectionFailed {
                core: ErrorCore::default(),
                node: self.node.clone(),
                what: "connection refused".to_string(),
            });
        }
        Ok(ReferenceConnection {
            registry: self.registry.clone(),
        })
    }
}

//////////////////////////////////////// ReferenceConnection ///////////////////////////////////////

#[derive(Debug)]
pub struct ReferenceConnection {
    registry: ReferenceRegistry,
}

impl RegistryConnection for ReferenceConnection {
    fn register_name(
        &mut self,
        node: &str,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), Error> {
        let mut inner = self.registry.inner.lock().unwrap();
        inner.call("register_name")?;
        let taken = inner
            .nodes
            .get(node)
            .map(|names| names.contains_key(name))
            .unwrap_or(false);
        if taken {
            return Err(Error::AlreadyRegistered {
                core: ErrorCore::default(),
                name: name.to_string(),
            });
        }
        inner.bind(node, name, value);
        Ok(())
    }

    fn re_register_name(
        &mut self,
        node: &str,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), Error> {
        let mut inner = self.registry.inner.lock().unwrap();
        inner.call("re_register_name")?;
        inner.bind(node, name, value);
        Ok(())
    }

    fn whereis_name(&mut self, node: &str, name: &str) -> Result<Option<Vec<u8>>, Error> {
        let mut inner = self.registry.inner.lock().unwrap();
        inner.call("whereis_name")?;
        Ok(inner
            .nodes
            .get(node)
            .and_then(|names| names.get(name))
            .map(Registration::lookup))
    }

    fn registered_names(&mut self, node: &str) -> Result<Vec<String>, Error> {
        let mut inner = self.registry.inner.lock().unwrap();
        if !inner.enumerate {
            return Err(Error::Unsupported {
                core: ErrorCore::default(),
                what: "registered_names is not exported".to_string(),
            });
        }
        inner.call("registered_names")?;
        Ok(inner
            .nodes
            .get(node)
            .map(|names| names.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
