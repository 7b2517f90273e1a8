#![doc = include_str!("../README.md")]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use biometrics::Collector;

use prototk_derive::Message;

use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

pub mod adapter;
pub mod probe;
pub mod shell;

#[cfg(feature = "reference")]
pub mod reference;

#[cfg(feature = "erlang")]
pub mod erlang;

pub use adapter::{AdapterOptions, NamingMode, RegistryAdapter, ValueMode};
pub use probe::{CommandProbe, NoProbe, StartupProbe};

#[cfg(feature = "erlang")]
pub use probe::EpmdProbe;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The module on the remote node that exports the registry calls.
pub const REGISTRY_MODULE: &str = "proc_server";
/// The node the adapter connects to when nothing else is configured.
pub const DEFAULT_REMOTE_NODE: &str = "node1@127.0.0.1";
/// Registry names become atoms on the remote side, and atoms cap out at 255 characters.
pub const MAX_NAME_LEN: usize = 255;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

/// Register every sensor in this crate with the collector.
pub fn register_biometrics(collector: &Collector) {
    adapter::register_biometrics(collector);
    probe::register_biometrics(collector);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Error //////////////////////////////////////////////

#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    #[prototk(413696, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(413697, message)]
    ConnectionFailed {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        node: String,
        #[prototk(3, string)]
        what: String,
    },
    #[prototk(413698, message)]
    RemoteCall {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        function: String,
        #[prototk(3, string)]
        what: String,
    },
    #[prototk(413699, message)]
    NotFound {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        name: String,
    },
    #[prototk(413700, message)]
    Unsupported {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(413701, message)]
    AlreadyConnected {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        node: String,
    },
    #[prototk(413702, message)]
    NotConnected {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        node: String,
    },
    #[prototk(413703, message)]
    TornDown {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        node: String,
    },
    #[prototk(413704, message)]
    AlreadyRegistered {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        name: String,
    },
    #[prototk(413705, message)]
    InvalidName {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        name: String,
        #[prototk(3, string)]
        what: String,
    },
    #[prototk(413706, message)]
    ProbeFailed {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(413707, message)]
    SystemError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
}

impl Error {
    /// The status a driver sees when an operation fails with this error.
    pub fn status(&self) -> Status {
        match self {
            Error::Success { .. } => Status::Ok,
            Error::NotFound { .. } => Status::NotFound,
            Error::Unsupported { .. } => Status::Unsupported,
            _ => Status::Error,
        }
    }
}

impl Default for Error {
    fn default() -> Error {
        Error::Success {
            core: ErrorCore::default(),
        }
    }
}

iotoz! {Error}

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Error {
        Error::SystemError {
            core: ErrorCore::default(),
            what: what.to_string(),
        }
    }
}

////////////////////////////////////////////// Status //////////////////////////////////////////////

/// The outcome of one driver operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Ok,
    NotFound,
    Error,
    /// The registry model cannot express the operation.  Distinct from [Status::Ok] so that
    /// callers can tell "nothing to do" from "impossible here".
    Unsupported,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Status::Ok => write!(fmt, "OK"),
            Status::NotFound => write!(fmt, "NOT_FOUND"),
            Status::Error => write!(fmt, "ERROR"),
            Status::Unsupported => write!(fmt, "UNSUPPORTED"),
        }
    }
}

////////////////////////////////////////////// Record //////////////////////////////////////////////

/// Field/value pairs of one logical record.
pub type Record = BTreeMap<String, Vec<u8>>;

/// The set of fields a read or scan asks for.  `None` at call sites means every field.
pub type FieldSet = BTreeSet<String>;

////////////////////////////////////////////// Binding /////////////////////////////////////////////

/// The interface a workload driver exercises.  Every operation reports a [Status]; only the
/// lifecycle calls surface structured errors.
pub trait Binding: Send + Sync {
    fn init(&self) -> Result<(), Error>;
    fn cleanup(&self) -> Result<(), Error>;

    fn read(&self, table: &str, key: &str, fields: Option<&FieldSet>, result: &mut Record)
        -> Status;
    fn scan(
        &self,
        table: &str,
        start_key: &str,
        record_count: usize,
        fields: Option<&FieldSet>,
        result: &mut Vec<Record>,
    ) -> Status;
    fn update(&self, table: &str, key: &str, values: &Record) -> Status;
    fn insert(&self, table: &str, key: &str, values: &Record) -> Status;
    fn delete(&self, table: &str, key: &str) -> Status;

    fn register_biometrics(&self, collector: &Collector);
}

impl<B: Binding> Binding for Arc<B> {
    fn init(&self) -> Result<(), Error> {
        B::init(self)
    }

    fn cleanup(&self) -> Result<(), Error> {
        B::cleanup(self)
    }

    fn read(
        &self,
        table: &str,
        key: &str,
        fields: Option<&FieldSet>,
        result: &mut Record,
    ) -> Status {
        B::read(self, table, key, fields, result)
    }

    fn scan(
        &self,
        table: &str,
        start_key: &str,
        record_count: usize,
        fields: Option<&FieldSet>,
        result: &mut Vec<Record>,
    ) -> Status {
        B::scan(self, table, start_key, record_count, fields, result)
    }

    fn update(&self, table: &str, key: &str, values: &Record) -> Status {
        B::update(self, table, key, values)
    }

    fn insert(&self, table: &str, key: &str, values: &Record) -> Status {
        B::insert(self, table, key, values)
    }

    fn delete(&self, table: &str, key: &str) -> Status {
        B::delete(self, table, key)
    }

    fn register_biometrics(&self, collector: &Collector) {
        B::register_biometrics(self, collector);
    }
}

//////////////////////////////////////// RegistryConnection ////////////////////////////////////////

/// One established link to a remote process registry.  Calls block until the remote side
/// replies or the transport fails.
pub trait RegistryConnection: Send {
    /// Bind `name` in the registry of `node`.  `value` is forwarded when the adapter carries
    /// values and omitted otherwise.
    fn register_name(&mut self, node: &str, name: &str, value: Option<&[u8]>)
        -> Result<(), Error>;
    /// Bind `name`, replacing any existing binding.
    fn re_register_name(
        &mut self,
        node: &str,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), Error>;
    /// Look up `name`.  `Ok(None)` is the registry's `undefined`.
    fn whereis_name(&mut self, node: &str, name: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Every name registered on `node`.
    fn registered_names(&mut self, node: &str) -> Result<Vec<String>, Error> {
        Err(Error::Unsupported {
            core: ErrorCore::default(),
            what: format!("{} cannot enumerate registered names", node),
        })
    }
}

///////////////////////////////////////////// Connector ////////////////////////////////////////////

/// Establishes connections on behalf of the adapter, once at init and again on every explicit
/// reconnect.
pub trait Connector: Send + Sync {
    type Connection: RegistryConnection;

    /// The node this connector links to, for diagnostics.
    fn node(&self) -> &str;
    fn connect(&self) -> Result<Self::Connection, Error>;
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
