//! Startup probes establish that the remote node is up before the adapter connects.
//!
//! Starting the node is a deployment concern.  A probe either runs whatever command the
//! deployment supplies or asks the port mapper daemon whether the node has registered.

use std::process::Command;
#[cfg(feature = "erlang")]
use std::time::Duration;

use biometrics::{Collector, Counter};
use indicio::{clue, ERROR, INFO};
use zerror_core::ErrorCore;

use crate::{Error, COLLECTOR};

#[cfg(feature = "erlang")]
use erl_dist::epmd::{EpmdClient, DEFAULT_EPMD_PORT};
#[cfg(feature = "erlang")]
use zerror::Z;

#[cfg(feature = "erlang")]
use crate::IoToZ;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROBE_OK: Counter = Counter::new("procreg.probe.ok");
static PROBE_FAILED: Counter = Counter::new("procreg.probe.failed");
static COMMAND_RUN: Counter = Counter::new("procreg.probe.command_run");
#[cfg(feature = "erlang")]
static EPMD_ATTEMPT: Counter = Counter::new("procreg.probe.epmd_attempt");

pub(crate) fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PROBE_OK);
    collector.register_counter(&PROBE_FAILED);
    collector.register_counter(&COMMAND_RUN);
    #[cfg(feature = "erlang")]
    collector.register_counter(&EPMD_ATTEMPT);
}

/////////////////////////////////////////// StartupProbe ///////////////////////////////////////////

/// A precondition checked once before the adapter's first connection.
pub trait StartupProbe: Send + Sync {
    fn probe(&self) -> Result<(), Error>;
}

impl StartupProbe for Vec<Box<dyn StartupProbe>> {
    fn probe(&self) -> Result<(), Error> {
        for probe in self.iter() {
            probe.probe()?;
        }
        Ok(())
    }
}

fn probe_failed(what: String) -> Error {
    PROBE_FAILED.click();
    Error::ProbeFailed {
        core: ErrorCore::default(),
        what,
    }
}

////////////////////////////////////////////// NoProbe /////////////////////////////////////////////

/// Assume the node is already running.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProbe;

impl StartupProbe for NoProbe {
    fn probe(&self) -> Result<(), Error> {
        Ok(())
    }
}

/////////////////////////////////////////// CommandProbe ///////////////////////////////////////////

/// Run a command and require that it exits zero.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandProbe {
    argv: Vec<String>,
}

impl CommandProbe {
    /// Split `command` the way a shell would.
    pub fn new(command: &str) -> Result<Self, Error> {
        if command.trim().is_empty() {
            return Err(probe_failed("empty startup command".to_string()));
        }
        let argv = shvar::split(command.trim())
            .map_err(|err| probe_failed(format!("cannot split {:?}: {:?}", command, err)))?;
        Ok(Self { argv })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

impl StartupProbe for CommandProbe {
    fn probe(&self) -> Result<(), Error> {
        COMMAND_RUN.click();
        clue!(COLLECTOR, INFO, {
            startup_command: self.argv.join(" "),
        });
        let status = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .status()
            .map_err(|err| probe_failed(format!("{}: {}", self.argv[0], err)))?;
        if !status.success() {
            clue!(COLLECTOR, ERROR, {
                startup_command: self.argv.join(" "),
                status: status.to_string(),
            });
            return Err(probe_failed(format!("{} exited with {}", self.argv[0], status)));
        }
        PROBE_OK.click();
        Ok(())
    }
}

///////////////////////////////////////////// EpmdProbe ////////////////////////////////////////////

/// Ask the port mapper daemon on the node's host whether the node has registered.
#[cfg(feature = "erlang")]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EpmdProbe {
    name: String,
    host: String,
    port: u16,
    attempts: u32,
    delay: Duration,
}

#[cfg(feature = "erlang")]
impl EpmdProbe {
    /// A probe for `node`, which must be of the form `name@host`.
    pub fn new(node: &str) -> Result<Self, Error> {
        let (name, host) = match node.split_once('@') {
            Some((name, host)) if !name.is_empty() && !host.is_empty() => (name, host),
            _ => {
                return Err(Error::InvalidName {
                    core: ErrorCore::default(),
                    name: node.to_string(),
                    what: "node names take the form name@host".to_string(),
                });
            }
        };
        Ok(Self {
            name: name.to_string(),
            host: host.to_string(),
            port: DEFAULT_EPMD_PORT,
            attempts: 1,
            delay: Duration::from_millis(500),
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Ask up to `attempts` times, sleeping `delay` between attempts.
    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.delay = delay;
        self
    }

    /// The names and distribution ports registered with the daemon.
    pub fn names(&self) -> Result<Vec<(String, u16)>, Error> {
        let stream = std::net::TcpStream::connect((self.host.as_str(), self.port))
            .as_z()
            .with_info("host", &self.host)
            .with_info("port", self.port)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let client = EpmdClient::new(futures::io::AllowStdIo::new(stream));
        futures::executor::block_on(client.get_names()).map_err(|err| Error::SystemError {
            core: ErrorCore::default(),
            what: format!("epmd at {}:{}: {}", self.host, self.port, err),
        })
    }
}

#[cfg(feature = "erlang")]
impl StartupProbe for EpmdProbe {
    fn probe(&self) -> Result<(), Error> {
        let mut last = String::new();
        for attempt in 0..self.attempts {
            if attempt > 0 {
                std::thread::sleep(self.delay);
            }
            EPMD_ATTEMPT.click();
            match self.names() {
                Ok(names) => {
                    if names.iter().any(|(name, _)| *name == self.name) {
                        PROBE_OK.click();
                        return Ok(());
                    }
                    last = format!("{} is not registered with epmd", self.name);
                }
                Err(err) => {
                    last = err.to_string();
                }
            }
            clue!(COLLECTOR, INFO, {
                epmd_probe: self.name.as_str(),
                attempt: attempt as u64,
                error: last.as_str(),
            });
        }
        Err(probe_failed(format!(
            "{}@{} after {} attempts: {}",
            self.name, self.host, self.attempts, last
        )))
    }
}

/////////////////////////////////////////// ProbeOptions ///////////////////////////////////////////

/// Options that select the startup probes.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct ProbeOptions {
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Command that starts the remote node(s) before connecting.", "CMD")
    )]
    pub startup_command: String,
    #[cfg(feature = "erlang")]
    #[cfg_attr(
        feature = "command_line",
        arrrg(flag, "Require the node to be registered with epmd before connecting.")
    )]
    pub epmd: bool,
    #[cfg(feature = "erlang")]
    #[cfg_attr(feature = "command_line", arrrg(optional, "Port of the epmd daemon.", "PORT"))]
    pub epmd_port: u16,
    #[cfg(feature = "erlang")]
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Number of times to ask epmd.", "N")
    )]
    pub epmd_attempts: u32,
    #[cfg(feature = "erlang")]
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Milliseconds between epmd attempts.", "MS")
    )]
    pub epmd_delay_ms: u64,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            startup_command: String::new(),
            #[cfg(feature = "erlang")]
            epmd: false,
            #[cfg(feature = "erlang")]
            epmd_port: DEFAULT_EPMD_PORT,
            #[cfg(feature = "erlang")]
            epmd_attempts: 10,
            #[cfg(feature = "erlang")]
            epmd_delay_ms: 500,
        }
    }
}

impl ProbeOptions {
    /// The probes these options select for `node`, run in order:  the startup command, then
    /// epmd when built with the `erlang` feature.
    #[cfg_attr(not(feature = "erlang"), allow(unused_variables))]
    pub fn probes(&self, node: &str) -> Result<Vec<Box<dyn StartupProbe>>, Error> {
        let mut probes: Vec<Box<dyn StartupProbe>> = vec![];
        if !self.startup_command.is_empty() {
            probes.push(Box::new(CommandProbe::new(&self.startup_command)?));
        }
        #[cfg(feature = "erlang")]
        if self.epmd {
            let epmd = EpmdProbe::new(node)?
                .with_port(self.epmd_port)
                .with_retries(
                    self.epmd_attempts,
                    Duration::from_millis(self.epmd_delay_ms),
                );
            probes.push(Box::new(epmd));
        }
        Ok(probes)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
