//! The registry adapter:  a [Binding] that stores records as names in a process registry.
//!
//! Each field of a record becomes one registry name.  Inserts register the name, updates
//! re-register it, and reads look it up.  The registry has no ordered key space and no removal
//! call, so scan and delete report [Status::Unsupported] without touching the remote side.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Instant;

use biometrics::{Collector, Counter, Moments};
use indicio::{clue, ERROR, INFO};
use zerror_core::ErrorCore;

use crate::probe::{NoProbe, StartupProbe};
use crate::{
    Binding, Connector, Error, FieldSet, Record, RegistryConnection, Status, COLLECTOR,
    DEFAULT_REMOTE_NODE, MAX_NAME_LEN,
};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static INIT: Counter = Counter::new("procreg.adapter.init");
static INIT_FAILED: Counter = Counter::new("procreg.adapter.init_failed");
static RECONNECT: Counter = Counter::new("procreg.adapter.reconnect");
static RECONNECT_FAILED: Counter = Counter::new("procreg.adapter.reconnect_failed");
static CLEANUP: Counter = Counter::new("procreg.adapter.cleanup");
static NOT_CONNECTED: Counter = Counter::new("procreg.adapter.not_connected");
static INVALID_NAME: Counter = Counter::new("procreg.adapter.invalid_name");
static REMOTE_FAILURE: Counter = Counter::new("procreg.adapter.remote_failure");

static READ: Counter = Counter::new("procreg.adapter.read");
static READ_ALL: Counter = Counter::new("procreg.adapter.read_all_fields");
static READ_NOT_FOUND: Counter = Counter::new("procreg.adapter.read_not_found");
static INSERT: Counter = Counter::new("procreg.adapter.insert");
static UPDATE: Counter = Counter::new("procreg.adapter.update");
static DELETE_UNSUPPORTED: Counter = Counter::new("procreg.adapter.delete_unsupported");
static SCAN_UNSUPPORTED: Counter = Counter::new("procreg.adapter.scan_unsupported");

static READ_LATENCY: Moments = Moments::new("procreg.adapter.read_latency_micros");
static INSERT_LATENCY: Moments = Moments::new("procreg.adapter.insert_latency_micros");
static UPDATE_LATENCY: Moments = Moments::new("procreg.adapter.update_latency_micros");

pub(crate) fn register_biometrics(collector: &Collector) {
    collector.register_counter(&INIT);
    collector.register_counter(&INIT_FAILED);
    collector.register_counter(&RECONNECT);
    collector.register_counter(&RECONNECT_FAILED);
    collector.register_counter(&CLEANUP);
    collector.register_counter(&NOT_CONNECTED);
    collector.register_counter(&INVALID_NAME);
    collector.register_counter(&REMOTE_FAILURE);
    collector.register_counter(&READ);
    collector.register_counter(&READ_ALL);
    collector.register_counter(&READ_NOT_FOUND);
    collector.register_counter(&INSERT);
    collector.register_counter(&UPDATE);
    collector.register_counter(&DELETE_UNSUPPORTED);
    collector.register_counter(&SCAN_UNSUPPORTED);
    collector.register_moments(&READ_LATENCY);
    collector.register_moments(&INSERT_LATENCY);
    collector.register_moments(&UPDATE_LATENCY);
}

//////////////////////////////////////////// NamingMode ////////////////////////////////////////////

/// How a (key, field) pair becomes a registry name.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum NamingMode {
    /// `key`, the separator, then `field`.  Records never collide.
    #[default]
    Qualified,
    /// The field name alone.  Every record shares one namespace.
    Field,
}

impl FromStr for NamingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qualified" => Ok(NamingMode::Qualified),
            "field" => Ok(NamingMode::Field),
            _ => Err(format!("unknown naming mode {:?}; expected qualified or field", s)),
        }
    }
}

impl Display for NamingMode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            NamingMode::Qualified => write!(fmt, "qualified"),
            NamingMode::Field => write!(fmt, "field"),
        }
    }
}

///////////////////////////////////////////// ValueMode ////////////////////////////////////////////

/// What happens to the value half of each field/value pair.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ValueMode {
    /// Forward the value with the name; reads return the value.
    #[default]
    Carry,
    /// Register the bare name; reads return the registry's process handle.
    Presence,
}

impl FromStr for ValueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "carry" => Ok(ValueMode::Carry),
            "presence" => Ok(ValueMode::Presence),
            _ => Err(format!("unknown value mode {:?}; expected carry or presence", s)),
        }
    }
}

impl Display for ValueMode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            ValueMode::Carry => write!(fmt, "carry"),
            ValueMode::Presence => write!(fmt, "presence"),
        }
    }
}

////////////////////////////////////////// AdapterOptions //////////////////////////////////////////

/// Options for the [RegistryAdapter].
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct AdapterOptions {
    /// The node identifier passed as the first argument of every registry call.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Node whose registry holds the records.", "NODE")
    )]
    pub target_node: String,
    /// How registry names are derived from keys and fields.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Registry naming: qualified or field.", "MODE")
    )]
    pub naming: NamingMode,
    /// Joins key and field under qualified naming.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Separator between key and field in qualified names.", "SEP")
    )]
    pub separator: String,
    /// Whether values travel to the registry.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Value transport: carry or presence.", "MODE")
    )]
    pub values: ValueMode,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            target_node: DEFAULT_REMOTE_NODE.to_string(),
            naming: NamingMode::Qualified,
            separator: ":".to_string(),
            values: ValueMode::Carry,
        }
    }
}

impl AdapterOptions {
    /// The registry name for `field` of the record at `key`.
    pub fn registry_name(&self, key: &str, field: &str) -> Result<String, Error> {
        let invalid = |name: &str, what: &str| Error::InvalidName {
            core: ErrorCore::default(),
            name: name.to_string(),
            what: what.to_string(),
        };
        if field.is_empty() {
            return Err(invalid(key, "field names must not be empty"));
        }
        let name = match self.naming {
            NamingMode::Field => field.to_string(),
            NamingMode::Qualified => {
                if self.separator.is_empty() {
                    return Err(invalid(key, "qualified naming needs a separator"));
                }
                if key.contains(self.separator.as_str()) {
                    return Err(invalid(key, "key contains the name separator"));
                }
                format!("{}{}{}", key, self.separator, field)
            }
        };
        if name.len() > MAX_NAME_LEN {
            return Err(invalid(&name, "name exceeds the registry's name limit"));
        }
        Ok(name)
    }

    /// The field half of `name` if it belongs to the record at `key`.
    fn field_of<'a>(&self, key: &str, name: &'a str) -> Option<&'a str> {
        match self.naming {
            NamingMode::Field => Some(name),
            NamingMode::Qualified => name
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix(self.separator.as_str()))
                .filter(|field| !field.is_empty()),
        }
    }
}

////////////////////////////////////////// ConnectionState /////////////////////////////////////////

enum ConnectionState<R> {
    Uninitialized,
    Disconnected,
    Connected(R),
    TornDown,
}

#[derive(Clone, Copy)]
enum WriteKind {
    Register,
    ReRegister,
}

////////////////////////////////////////// RegistryAdapter /////////////////////////////////////////

/// A [Binding] over a remote process registry.
///
/// The adapter owns exactly one connection.  Every call takes the connection's lock, so worker
/// threads sharing the adapter issue one remote call at a time.
pub struct RegistryAdapter<C: Connector> {
    options: AdapterOptions,
    connector: C,
    probe: Box<dyn StartupProbe>,
    state: Mutex<ConnectionState<C::Connection>>,
}

impl<C: Connector> RegistryAdapter<C> {
    /// Create a disconnected adapter.  Nothing touches the network until [Binding::init].
    pub fn new(options: AdapterOptions, connector: C) -> Self {
        Self {
            options,
            connector,
            probe: Box::new(NoProbe),
            state: Mutex::new(ConnectionState::Uninitialized),
        }
    }

    /// Run `probe` before connecting in [Binding::init].
    pub fn with_probe<P: StartupProbe + 'static>(mut self, probe: P) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn options(&self) -> &AdapterOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            &*self.state.lock().unwrap(),
            ConnectionState::Connected(_)
        )
    }

    /// Drop the current connection, if any, and establish a fresh one.  Only valid once
    /// [Binding::init] has succeeded; the startup probe does not run again.  On failure the
    /// adapter is left disconnected.
    pub fn reconnect(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            ConnectionState::Uninitialized => return Err(self.not_connected()),
            ConnectionState::TornDown => return Err(self.torn_down()),
            ConnectionState::Disconnected | ConnectionState::Connected(_) => {}
        }
        *state = ConnectionState::Disconnected;
        RECONNECT.click();
        let conn = self.connect().map_err(|err| {
            RECONNECT_FAILED.click();
            err
        })?;
        *state = ConnectionState::Connected(conn);
        Ok(())
    }

    fn connect(&self) -> Result<C::Connection, Error> {
        match self.connector.connect() {
            Ok(conn) => {
                clue!(COLLECTOR, INFO, {
                    connected: self.connector.node(),
                });
                Ok(conn)
            }
            Err(err) => {
                clue!(COLLECTOR, ERROR, {
                    connect: self.connector.node(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn not_connected(&self) -> Error {
        Error::NotConnected {
            core: ErrorCore::default(),
            node: self.connector.node().to_string(),
        }
    }

    fn torn_down(&self) -> Error {
        Error::TornDown {
            core: ErrorCore::default(),
            node: self.connector.node().to_string(),
        }
    }

    fn with_connection<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut C::Connection) -> Result<T, Error>,
    {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            ConnectionState::Connected(conn) => f(conn),
            ConnectionState::Uninitialized | ConnectionState::Disconnected => {
                Err(self.not_connected())
            }
            ConnectionState::TornDown => Err(self.torn_down()),
        }
    }

    fn read_fields(&self, key: &str, fields: Option<&FieldSet>) -> Result<Record, Error> {
        let node = self.options.target_node.as_str();
        self.with_connection(|conn| {
            let fields: Vec<String> = match fields {
                Some(fields) => fields.iter().cloned().collect(),
                None => {
                    READ_ALL.click();
                    let mut fields: Vec<String> = conn
                        .registered_names(node)?
                        .iter()
                        .filter_map(|name| self.options.field_of(key, name))
                        .map(String::from)
                        .collect();
                    if fields.is_empty() {
                        return Err(Error::NotFound {
                            core: ErrorCore::default(),
                            name: key.to_string(),
                        });
                    }
                    fields.sort();
                    fields
                }
            };
            let names = fields
                .iter()
                .map(|field| self.options.registry_name(key, field))
                .collect::<Result<Vec<_>, Error>>()?;
            let mut found = Record::new();
            for (field, name) in fields.into_iter().zip(names) {
                match conn.whereis_name(node, &name)? {
                    Some(value) => {
                        found.insert(field, value);
                    }
                    None => {
                        return Err(Error::NotFound {
                            core: ErrorCore::default(),
                            name,
                        });
                    }
                }
            }
            Ok(found)
        })
    }

    fn write_fields(&self, kind: WriteKind, key: &str, values: &Record) -> Result<(), Error> {
        let node = self.options.target_node.as_str();
        let names = values
            .keys()
            .map(|field| self.options.registry_name(key, field))
            .collect::<Result<Vec<_>, Error>>()?;
        self.with_connection(|conn| {
            for (name, value) in names.iter().zip(values.values()) {
                let value = match self.options.values {
                    ValueMode::Carry => Some(value.as_slice()),
                    ValueMode::Presence => None,
                };
                match kind {
                    WriteKind::Register => conn.register_name(node, name, value)?,
                    WriteKind::ReRegister => conn.re_register_name(node, name, value)?,
                }
            }
            Ok(())
        })
    }

    fn report(&self, op: &str, key: &str, err: Error) -> Status {
        match &err {
            Error::NotFound { .. } => {}
            Error::NotConnected { .. } | Error::TornDown { .. } => {
                NOT_CONNECTED.click();
            }
            Error::InvalidName { .. } => {
                INVALID_NAME.click();
            }
            _ => {
                REMOTE_FAILURE.click();
            }
        }
        if !matches!(err, Error::NotFound { .. }) {
            clue!(COLLECTOR, ERROR, {
                op: op,
                key: key,
                error: err.to_string(),
            });
        }
        err.status()
    }
}

impl<C: Connector> Binding for RegistryAdapter<C> {
    fn init(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            ConnectionState::Uninitialized | ConnectionState::Disconnected => {}
            ConnectionState::Connected(_) => {
                return Err(Error::AlreadyConnected {
                    core: ErrorCore::default(),
                    node: self.connector.node().to_string(),
                });
            }
            ConnectionState::TornDown => {
                return Err(self.torn_down());
            }
        }
        if let Err(err) = self.probe.probe() {
            INIT_FAILED.click();
            clue!(COLLECTOR, ERROR, {
                probe: self.connector.node(),
                error: err.to_string(),
            });
            return Err(err);
        }
        let conn = self.connect().map_err(|err| {
            INIT_FAILED.click();
            err
        })?;
        *state = ConnectionState::Connected(conn);
        INIT.click();
        Ok(())
    }

    fn cleanup(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !matches!(&*state, ConnectionState::TornDown) {
            CLEANUP.click();
            clue!(COLLECTOR, INFO, {
                cleanup: self.connector.node(),
            });
        }
        *state = ConnectionState::TornDown;
        Ok(())
    }

    fn read(
        &self,
        _: &str,
        key: &str,
        fields: Option<&FieldSet>,
        result: &mut Record,
    ) -> Status {
        let start = Instant::now();
        READ.click();
        let status = match self.read_fields(key, fields) {
            Ok(mut found) => {
                result.append(&mut found);
                Status::Ok
            }
            Err(err) => {
                if let Error::NotFound { .. } = err {
                    READ_NOT_FOUND.click();
                }
                self.report("read", key, err)
            }
        };
        READ_LATENCY.add(start.elapsed().as_micros() as f64);
        status
    }

    fn scan(
        &self,
        _: &str,
        start_key: &str,
        record_count: usize,
        _: Option<&FieldSet>,
        _: &mut Vec<Record>,
    ) -> Status {
        SCAN_UNSUPPORTED.click();
        clue!(COLLECTOR, INFO, {
            unsupported: "scan",
            start_key: start_key,
            record_count: record_count as u64,
        });
        Status::Unsupported
    }

    fn update(&self, _: &str, key: &str, values: &Record) -> Status {
        let start = Instant::now();
        UPDATE.click();
        let status = match self.write_fields(WriteKind::ReRegister, key, values) {
            Ok(()) => Status::Ok,
            Err(err) => self.report("update", key, err),
        };
        UPDATE_LATENCY.add(start.elapsed().as_micros() as f64);
        status
    }

    fn insert(&self, _: &str, key: &str, values: &Record) -> Status {
        let start = Instant::now();
        INSERT.click();
        let status = match self.write_fields(WriteKind::Register, key, values) {
            Ok(()) => Status::Ok,
            Err(err) => self.report("insert", key, err),
        };
        INSERT_LATENCY.add(start.elapsed().as_micros() as f64);
        status
    }

    fn delete(&self, _: &str, key: &str) -> Status {
        DELETE_UNSUPPORTED.click();
        clue!(COLLECTOR, INFO, {
            unsupported: "delete",
            key: key,
        });
        Status::Unsupported
    }

    fn register_biometrics(&self, collector: &Collector) {
        crate::register_biometrics(collector);
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(all(test, feature = "reference"))]
mod tests {
    use biometrics::Sensor;

    use crate::reference::{ReferenceConnector, ReferenceRegistry};

    use super::*;

    const NODE: &str = "node1@127.0.0.1";

    fn adapter(options: AdapterOptions) -> (ReferenceRegistry, RegistryAdapter<ReferenceConnector>) {
        let registry = ReferenceRegistry::new();
        let adapter = RegistryAdapter::new(options, registry.connector(NODE));
        adapter.init().unwrap();
        (registry, adapter)
    }

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(f, v)| (f.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    fn fields(names: &[&str]) -> FieldSet {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn options_parse_and_print() {
        assert_eq!(NamingMode::Field, "field".parse().unwrap());
        assert_eq!(NamingMode::Qualified, "qualified".parse().unwrap());
        assert!("other".parse::<NamingMode>().is_err());
        assert_eq!(ValueMode::Presence, "presence".parse().unwrap());
        assert_eq!(ValueMode::Carry, "carry".parse().unwrap());
        assert!("other".parse::<ValueMode>().is_err());
        assert_eq!("qualified", NamingMode::Qualified.to_string());
        assert_eq!("presence", ValueMode::Presence.to_string());
    }

    #[test]
    fn registry_names() {
        let options = AdapterOptions::default();
        assert_eq!("u1:first", options.registry_name("u1", "first").unwrap());
        assert!(options.registry_name("u:1", "first").is_err());
        assert!(options.registry_name("u1", "").is_err());
        assert!(options.registry_name(&"k".repeat(250), "first").is_err());
        let options = AdapterOptions {
            naming: NamingMode::Field,
            ..AdapterOptions::default()
        };
        assert_eq!("first", options.registry_name("u:1", "first").unwrap());
    }

    #[test]
    fn field_of_strips_key() {
        let options = AdapterOptions::default();
        assert_eq!(Some("first"), options.field_of("u1", "u1:first"));
        assert_eq!(None, options.field_of("u1", "u10:first"));
        assert_eq!(None, options.field_of("u1", "u1:"));
        assert_eq!(None, options.field_of("u1", "u2:first"));
    }

    #[test]
    fn insert_then_read() {
        let (_, adapter) = adapter(AdapterOptions::default());
        let values = record(&[("first", "brian"), ("last", "cooper")]);
        assert_eq!(Status::Ok, adapter.insert("usertable", "u1", &values));
        let mut result = Record::new();
        assert_eq!(
            Status::Ok,
            adapter.read("usertable", "u1", Some(&fields(&["first", "last"])), &mut result)
        );
        assert_eq!(values, result);
    }

    #[test]
    fn read_unknown_key() {
        let (_, adapter) = adapter(AdapterOptions::default());
        let mut result = Record::new();
        assert_eq!(
            Status::NotFound,
            adapter.read("usertable", "nobody", Some(&fields(&["first"])), &mut result)
        );
        assert_eq!(
            Status::NotFound,
            adapter.read("usertable", "nobody", None, &mut result)
        );
        assert!(result.is_empty());
    }

    #[test]
    fn read_no_partial_results() {
        let (_, adapter) = adapter(AdapterOptions::default());
        let values = record(&[("first", "brian")]);
        assert_eq!(Status::Ok, adapter.insert("usertable", "u1", &values));
        let mut result = Record::new();
        assert_eq!(
            Status::NotFound,
            adapter.read("usertable", "u1", Some(&fields(&["first", "last"])), &mut result)
        );
        assert!(result.is_empty());
    }

    #[test]
    fn read_empty_field_set() {
        let (registry, adapter) = adapter(AdapterOptions::default());
        let mut result = Record::new();
        assert_eq!(
            Status::Ok,
            adapter.read("usertable", "u1", Some(&FieldSet::new()), &mut result)
        );
        assert!(result.is_empty());
        assert_eq!(0, registry.calls());
    }

    #[test]
    fn read_all_fields() {
        let (_, adapter) = adapter(AdapterOptions::default());
        assert_eq!(
            Status::Ok,
            adapter.insert("usertable", "u1", &record(&[("first", "brian"), ("last", "cooper")]))
        );
        assert_eq!(
            Status::Ok,
            adapter.insert("usertable", "u10", &record(&[("first", "other")]))
        );
        let mut result = Record::new();
        assert_eq!(Status::Ok, adapter.read("usertable", "u1", None, &mut result));
        assert_eq!(record(&[("first", "brian"), ("last", "cooper")]), result);
    }

    #[test]
    fn read_all_without_enumeration() {
        let (registry, adapter) = adapter(AdapterOptions::default());
        assert_eq!(
            Status::Ok,
            adapter.insert("usertable", "u1", &record(&[("first", "brian")]))
        );
        registry.disable_enumeration();
        let mut result = Record::new();
        assert_eq!(
            Status::Unsupported,
            adapter.read("usertable", "u1", None, &mut result)
        );
        assert!(result.is_empty());
    }

    #[test]
    fn update_overwrites() {
        let (registry, adapter) = adapter(AdapterOptions::default());
        assert_eq!(
            Status::Ok,
            adapter.insert("usertable", "u1", &record(&[("first", "brian")]))
        );
        assert_eq!(
            Status::Ok,
            adapter.update("usertable", "u1", &record(&[("first", "bruce")]))
        );
        let mut result = Record::new();
        assert_eq!(
            Status::Ok,
            adapter.read("usertable", "u1", Some(&fields(&["first"])), &mut result)
        );
        assert_eq!(record(&[("first", "bruce")]), result);
        assert_eq!(vec!["u1:first".to_string()], registry.names(NODE));
    }

    #[test]
    fn insert_existing_name_is_error() {
        let (_, adapter) = adapter(AdapterOptions::default());
        let values = record(&[("first", "brian")]);
        assert_eq!(Status::Ok, adapter.insert("usertable", "u1", &values));
        assert_eq!(Status::Error, adapter.insert("usertable", "u1", &values));
    }

    #[test]
    fn partial_failure_keeps_earlier_fields() {
        let (registry, adapter) = adapter(AdapterOptions::default());
        registry.fail_calls_after(Some(1));
        let values = record(&[("a", "1"), ("b", "2"), ("c", "3")]);
        assert_eq!(Status::Error, adapter.insert("usertable", "u1", &values));
        assert_eq!(vec!["u1:a".to_string()], registry.names(NODE));
        // The batch stopped at the first failure.
        assert_eq!(2, registry.calls());
    }

    #[test]
    fn presence_mode_returns_handles() {
        let options = AdapterOptions {
            naming: NamingMode::Field,
            values: ValueMode::Presence,
            ..AdapterOptions::default()
        };
        let (registry, adapter) = adapter(options);
        assert_eq!(
            Status::Ok,
            adapter.insert("usertable", "u1", &record(&[("asd", "ignored")]))
        );
        let mut result = Record::new();
        assert_eq!(
            Status::Ok,
            adapter.read("usertable", "u2", Some(&fields(&["asd"])), &mut result)
        );
        assert_eq!(Some(&b"<0.1.0>".to_vec()), result.get("asd"));
        assert_eq!(vec!["asd".to_string()], registry.names(NODE));
    }

    #[test]
    fn delete_and_scan_are_unsupported() {
        let (registry, adapter) = adapter(AdapterOptions::default());
        let values = record(&[("first", "brian")]);
        assert_eq!(Status::Ok, adapter.insert("usertable", "u1", &values));
        let calls = registry.calls();
        assert_eq!(Status::Unsupported, adapter.delete("usertable", "u1"));
        let mut scanned = vec![];
        assert_eq!(
            Status::Unsupported,
            adapter.scan("usertable", "u1", 10, None, &mut scanned)
        );
        assert!(scanned.is_empty());
        assert_eq!(calls, registry.calls());
        let mut result = Record::new();
        assert_eq!(
            Status::Ok,
            adapter.read("usertable", "u1", Some(&fields(&["first"])), &mut result)
        );
        assert_eq!(values, result);
    }

    #[test]
    fn lifecycle() {
        let registry = ReferenceRegistry::new();
        let adapter = RegistryAdapter::new(AdapterOptions::default(), registry.connector(NODE));
        assert!(!adapter.is_connected());
        let values = record(&[("first", "brian")]);
        assert_eq!(Status::Error, adapter.insert("usertable", "u1", &values));
        adapter.init().unwrap();
        assert!(adapter.is_connected());
        assert!(matches!(
            adapter.init(),
            Err(Error::AlreadyConnected { .. })
        ));
        adapter.reconnect().unwrap();
        assert!(adapter.is_connected());
        adapter.cleanup().unwrap();
        adapter.cleanup().unwrap();
        assert!(!adapter.is_connected());
        assert_eq!(Status::Error, adapter.insert("usertable", "u1", &values));
        assert!(matches!(adapter.init(), Err(Error::TornDown { .. })));
        assert!(matches!(adapter.reconnect(), Err(Error::TornDown { .. })));
        let mut scanned = vec![];
        assert_eq!(
            Status::Unsupported,
            adapter.scan("usertable", "u1", 1, None, &mut scanned)
        );
    }

    #[test]
    fn init_fails_without_retry() {
        let registry = ReferenceRegistry::new();
        registry.refuse_connections(true);
        let adapter = RegistryAdapter::new(AdapterOptions::default(), registry.connector(NODE));
        assert!(matches!(
            adapter.init(),
            Err(Error::ConnectionFailed { .. })
        ));
        assert!(!adapter.is_connected());
        registry.refuse_connections(false);
        adapter.init().unwrap();
        assert!(adapter.is_connected());
    }

    #[test]
    fn failed_reconnect_leaves_adapter_disconnected() {
        let (registry, adapter) = adapter(AdapterOptions::default());
        registry.refuse_connections(true);
        let failed = RECONNECT_FAILED.read();
        assert!(matches!(
            adapter.reconnect(),
            Err(Error::ConnectionFailed { .. })
        ));
        assert!(RECONNECT_FAILED.read() > failed);
        assert!(!adapter.is_connected());
        registry.refuse_connections(false);
        adapter.reconnect().unwrap();
        assert!(adapter.is_connected());
    }

    #[test]
    fn reconnect_requires_init() {
        struct Counting(std::sync::Arc<std::sync::atomic::AtomicU64>);

        impl StartupProbe for Counting {
            fn probe(&self) -> Result<(), Error> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(())
            }
        }

        let runs = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let registry = ReferenceRegistry::new();
        let adapter = RegistryAdapter::new(AdapterOptions::default(), registry.connector(NODE))
            .with_probe(Counting(std::sync::Arc::clone(&runs)));
        assert!(matches!(
            adapter.reconnect(),
            Err(Error::NotConnected { .. })
        ));
        assert!(!adapter.is_connected());
        assert_eq!(0, runs.load(std::sync::atomic::Ordering::Relaxed));
        adapter.init().unwrap();
        assert_eq!(1, runs.load(std::sync::atomic::Ordering::Relaxed));
        adapter.reconnect().unwrap();
        assert!(adapter.is_connected());
        assert_eq!(1, runs.load(std::sync::atomic::Ordering::Relaxed));
    }

    #[test]
    fn failed_init_keeps_reconnect_refused() {
        let registry = ReferenceRegistry::new();
        registry.refuse_connections(true);
        let adapter = RegistryAdapter::new(AdapterOptions::default(), registry.connector(NODE));
        assert!(adapter.init().is_err());
        registry.refuse_connections(false);
        assert!(matches!(
            adapter.reconnect(),
            Err(Error::NotConnected { .. })
        ));
        adapter.init().unwrap();
        assert!(adapter.is_connected());
    }

    #[test]
    fn long_names_never_reach_the_registry() {
        let (registry, adapter) = adapter(AdapterOptions::default());
        let key = "k".repeat(300);
        assert_eq!(
            Status::Error,
            adapter.insert("usertable", &key, &record(&[("first", "brian")]))
        );
        assert_eq!(
            Status::Error,
            adapter.update("usertable", &key, &record(&[("first", "brian")]))
        );
        let mut result = Record::new();
        assert_eq!(
            Status::Error,
            adapter.read("usertable", &key, Some(&fields(&["first"])), &mut result)
        );
        assert!(result.is_empty());
        let long_field = "f".repeat(300);
        assert_eq!(
            Status::Error,
            adapter.insert("usertable", "u1", &record(&[("a", "1"), (&long_field, "2")]))
        );
        assert_eq!(0, registry.calls());
        assert!(registry.names(NODE).is_empty());
    }

    #[test]
    fn probe_failure_blocks_init() {
        struct Refuse;

        impl StartupProbe for Refuse {
            fn probe(&self) -> Result<(), Error> {
                Err(Error::ProbeFailed {
                    core: ErrorCore::default(),
                    what: "node is down".to_string(),
                })
            }
        }

        let registry = ReferenceRegistry::new();
        let adapter = RegistryAdapter::new(AdapterOptions::default(), registry.connector(NODE))
            .with_probe(Refuse);
        assert!(matches!(adapter.init(), Err(Error::ProbeFailed { .. })));
        assert!(!adapter.is_connected());
    }

    proptest::proptest! {
        #[test]
        fn qualified_names_are_injective(
            k1 in "[a-z0-9]{1,16}",
            f1 in "[a-z0-9:]{1,16}",
            k2 in "[a-z0-9]{1,16}",
            f2 in "[a-z0-9:]{1,16}",
        ) {
            let options = AdapterOptions::default();
            let n1 = options.registry_name(&k1, &f1).unwrap();
            let n2 = options.registry_name(&k2, &f2).unwrap();
            proptest::prop_assert_eq!(n1 == n2, k1 == k2 && f1 == f2);
            proptest::prop_assert_eq!(Some(f1.as_str()), options.field_of(&k1, &n1));
        }
    }
}
