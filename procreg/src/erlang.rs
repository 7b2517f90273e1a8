//! A registry connection over Erlang distribution.
//!
//! Every registry call becomes an `rpc:call` of the registry module on the remote node.  The
//! client's event loop runs on its own thread; calls block the caller until the reply arrives.

use std::path::{Path, PathBuf};

use erl_dist::term::{Atom, Binary, List, Term, Tuple};
use erl_rpc::{CallError, RpcClient, RpcClientHandle};
use indicio::{clue, ERROR};
use zerror_core::ErrorCore;

use crate::{Connector, Error, RegistryConnection, COLLECTOR, DEFAULT_REMOTE_NODE, REGISTRY_MODULE};

/////////////////////////////////////////// ErlangOptions //////////////////////////////////////////

/// Options for reaching the remote node.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct ErlangOptions {
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Erlang node to connect to.", "NODE")
    )]
    pub remote_node: String,
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Distribution cookie.  Defaults to ~/.erlang.cookie.", "COOKIE")
    )]
    pub cookie: String,
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Module exporting the registry calls.", "MODULE")
    )]
    pub registry_module: String,
}

impl Default for ErlangOptions {
    fn default() -> Self {
        Self {
            remote_node: DEFAULT_REMOTE_NODE.to_string(),
            cookie: String::new(),
            registry_module: REGISTRY_MODULE.to_string(),
        }
    }
}

impl ErlangOptions {
    fn cookie(&self) -> Result<String, Error> {
        if !self.cookie.is_empty() {
            return Ok(self.cookie.clone());
        }
        let home = std::env::var_os("HOME").ok_or_else(|| Error::ConnectionFailed {
            core: ErrorCore::default(),
            node: self.remote_node.clone(),
            what: "no cookie given and HOME is unset".to_string(),
        })?;
        read_cookie(&PathBuf::from(home).join(".erlang.cookie"), &self.remote_node)
    }
}

fn read_cookie(path: &Path, node: &str) -> Result<String, Error> {
    match std::fs::read_to_string(path) {
        Ok(cookie) => Ok(cookie.trim().to_string()),
        Err(err) => Err(Error::ConnectionFailed {
            core: ErrorCore::default(),
            node: node.to_string(),
            what: format!("cannot read cookie from {}: {}", path.display(), err),
        }),
    }
}

////////////////////////////////////////// ErlangConnector /////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct ErlangConnector {
    options: ErlangOptions,
}

impl ErlangConnector {
    pub fn new(options: ErlangOptions) -> Self {
        Self { options }
    }
}

impl Connector for ErlangConnector {
    type Connection = ErlangConnection;

    fn node(&self) -> &str {
        &self.options.remote_node
    }

    fn connect(&self) -> Result<Self::Connection, Error> {
        let cookie = self.options.cookie()?;
        let client = futures::executor::block_on(RpcClient::connect(
            &self.options.remote_node,
            &cookie,
        ))
        .map_err(|err| Error::ConnectionFailed {
            core: ErrorCore::default(),
            node: self.options.remote_node.clone(),
            what: err.to_string(),
        })?;
        let handle = client.handle();
        let node = self.options.remote_node.clone();
        std::thread::spawn(move || {
            if let Err(err) = futures::executor::block_on(client.run()) {
                clue!(COLLECTOR, ERROR, {
                    rpc_client: node.as_str(),
                    error: err.to_string(),
                });
            }
        });
        Ok(ErlangConnection {
            handle,
            module: self.options.registry_module.clone(),
        })
    }
}

////////////////////////////////////////// ErlangConnection ////////////////////////////////////////

pub struct ErlangConnection {
    handle: RpcClientHandle,
    module: String,
}

impl ErlangConnection {
    fn call(&mut self, function: &str, args: Vec<Term>) -> Result<Term, Error> {
        let module = Atom::from(self.module.as_str());
        let func = Atom::from(function);
        futures::executor::block_on(self.handle.call(module, func, List { elements: args }))
            .map_err(|err| call_error(function, err))
    }

    fn register(
        &mut self,
        function: &str,
        node: &str,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), Error> {
        let reply = self.call(function, registration_args(node, name, value))?;
        registration_reply(function, name, &reply)
    }
}

impl RegistryConnection for ErlangConnection {
    fn register_name(
        &mut self,
        node: &str,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), Error> {
        self.register("register_name", node, name, value)
    }

    fn re_register_name(
        &mut self,
        node: &str,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), Error> {
        self.register("re_register_name", node, name, value)
    }

    fn whereis_name(&mut self, node: &str, name: &str) -> Result<Option<Vec<u8>>, Error> {
        let reply = self.call("whereis_name", registration_args(node, name, None))?;
        Ok(lookup_reply(reply))
    }

    fn registered_names(&mut self, node: &str) -> Result<Vec<String>, Error> {
        let reply = self.call("registered_names", vec![atom(node)])?;
        names_reply(reply)
    }
}

/////////////////////////////////////////////// terms //////////////////////////////////////////////

fn atom(s: &str) -> Term {
    Term::Atom(Atom::from(s))
}

fn atom_name(term: &Term) -> Option<&str> {
    match term {
        Term::Atom(atom) => Some(atom.name.as_str()),
        _ => None,
    }
}

fn registration_args(node: &str, name: &str, value: Option<&[u8]>) -> Vec<Term> {
    let mut args = vec![atom(node), atom(name)];
    if let Some(value) = value {
        args.push(Term::Binary(Binary {
            bytes: value.to_vec(),
        }));
    }
    args
}

fn call_error(function: &str, err: CallError) -> Error {
    if let CallError::ErrorResponse { reason } = &err {
        if mentions_undef(reason) {
            return Error::Unsupported {
                core: ErrorCore::default(),
                what: format!("{} is not exported: {}", function, reason),
            };
        }
    }
    Error::RemoteCall {
        core: ErrorCore::default(),
        function: function.to_string(),
        what: err.to_string(),
    }
}

fn mentions_undef(term: &Term) -> bool {
    match term {
        Term::Atom(atom) => atom.name == "undef",
        Term::Tuple(Tuple { elements }) => elements.iter().any(mentions_undef),
        Term::List(List { elements }) => elements.iter().any(mentions_undef),
        _ => false,
    }
}

fn registration_reply(function: &str, name: &str, reply: &Term) -> Result<(), Error> {
    match atom_name(reply) {
        Some("yes") | Some("ok") => Ok(()),
        Some("no") => Err(Error::AlreadyRegistered {
            core: ErrorCore::default(),
            name: name.to_string(),
        }),
        _ => Err(Error::RemoteCall {
            core: ErrorCore::default(),
            function: function.to_string(),
            what: format!("unexpected reply {}", reply),
        }),
    }
}

fn lookup_reply(reply: Term) -> Option<Vec<u8>> {
    match reply {
        Term::Atom(atom) if atom.name == "undefined" => None,
        Term::Binary(binary) => Some(binary.bytes),
        Term::Tuple(Tuple { mut elements }) if elements.len() == 2 => match elements.pop() {
            Some(Term::Binary(binary)) => Some(binary.bytes),
            Some(other) => Some(other.to_string().into_bytes()),
            None => None,
        },
        other => Some(other.to_string().into_bytes()),
    }
}

fn names_reply(reply: Term) -> Result<Vec<String>, Error> {
    let elements = match reply {
        Term::List(List { elements }) => elements,
        other => {
            return Err(Error::RemoteCall {
                core: ErrorCore::default(),
                function: "registered_names".to_string(),
                what: format!("expected a list, got {}", other),
            });
        }
    };
    let mut names = vec![];
    for element in elements {
        match element {
            Term::Atom(atom) => names.push(atom.name),
            Term::Binary(binary) => names.push(String::from_utf8_lossy(&binary.bytes).into_owned()),
            other => names.push(other.to_string()),
        }
    }
    names.sort();
    Ok(names)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(bytes: &[u8]) -> Term {
        Term::Binary(Binary {
            bytes: bytes.to_vec(),
        })
    }

    fn tuple(elements: Vec<Term>) -> Term {
        Term::Tuple(Tuple { elements })
    }

    #[test]
    fn args_carry_value_when_given() {
        let args = registration_args("node1@127.0.0.1", "u1:first", Some(b"brian"));
        assert_eq!(
            vec![atom("node1@127.0.0.1"), atom("u1:first"), binary(b"brian")],
            args
        );
        let args = registration_args("node1@127.0.0.1", "asd", None);
        assert_eq!(vec![atom("node1@127.0.0.1"), atom("asd")], args);
    }

    #[test]
    fn lookups() {
        assert_eq!(None, lookup_reply(atom("undefined")));
        assert_eq!(Some(b"brian".to_vec()), lookup_reply(binary(b"brian")));
        assert_eq!(
            Some(b"brian".to_vec()),
            lookup_reply(tuple(vec![atom("pid"), binary(b"brian")]))
        );
        assert_eq!(Some(b"yes".to_vec()), lookup_reply(atom("yes")));
    }

    #[test]
    fn registrations() {
        registration_reply("register_name", "asd", &atom("yes")).unwrap();
        registration_reply("re_register_name", "asd", &atom("ok")).unwrap();
        assert!(matches!(
            registration_reply("register_name", "asd", &atom("no")),
            Err(Error::AlreadyRegistered { .. })
        ));
        assert!(matches!(
            registration_reply("register_name", "asd", &binary(b"?")),
            Err(Error::RemoteCall { .. })
        ));
    }

    #[test]
    fn undef_is_unsupported() {
        let undef = tuple(vec![
            atom("error"),
            tuple(vec![atom("exception"), atom("undef"), Term::List(List::nil())]),
        ]);
        let err = call_error("registered_names", CallError::ErrorResponse { reason: undef });
        assert!(matches!(err, Error::Unsupported { .. }));
        assert_eq!(crate::Status::Unsupported, err.status());
    }

    #[test]
    fn other_failures_are_remote_calls() {
        let badarg = tuple(vec![
            atom("error"),
            tuple(vec![atom("exception"), atom("badarg"), Term::List(List::nil())]),
        ]);
        let err = call_error("whereis_name", CallError::ErrorResponse { reason: badarg });
        assert!(matches!(err, Error::RemoteCall { .. }));
        assert_eq!(crate::Status::Error, err.status());
        let undefined = tuple(vec![atom("error"), atom("undefined")]);
        assert!(matches!(
            call_error("whereis_name", CallError::ErrorResponse { reason: undefined }),
            Error::RemoteCall { .. }
        ));
        assert!(matches!(
            call_error("register_name", CallError::Terminated),
            Error::RemoteCall { .. }
        ));
    }

    #[test]
    fn missing_cookie_is_connection_failure() {
        let path = std::env::temp_dir().join("procreg-no-such-dir/.erlang.cookie");
        match read_cookie(&path, DEFAULT_REMOTE_NODE) {
            Err(Error::ConnectionFailed { node, .. }) => {
                assert_eq!(DEFAULT_REMOTE_NODE, node);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cookie_is_trimmed() {
        let path = std::env::temp_dir().join(format!("procreg-cookie-{}", std::process::id()));
        std::fs::write(&path, "SECRET\n").unwrap();
        assert_eq!("SECRET", read_cookie(&path, DEFAULT_REMOTE_NODE).unwrap());
        std::fs::remove_file(&path).unwrap();
        let options = ErlangOptions {
            cookie: "given".to_string(),
            ..ErlangOptions::default()
        };
        assert_eq!("given", options.cookie().unwrap());
    }

    #[test]
    fn names() {
        let reply = Term::List(List {
            elements: vec![atom("u1:last"), atom("u1:first")],
        });
        assert_eq!(
            vec!["u1:first".to_string(), "u1:last".to_string()],
            names_reply(reply).unwrap()
        );
        assert!(names_reply(atom("undefined")).is_err());
    }
}
