use std::fs::File;
use std::sync::Arc;
use std::time::SystemTime;

use arrrg::CommandLine;
use biometrics::{Collector, PlainTextEmitter};
use indicio::{clue, stdio::StdioEmitter, ALWAYS, INFO};
use rustyline::history::MemHistory;
use rustyline::{Config, Editor};
use texttale::ShellTextTale;
use zerror::Z;
use zerror_core::ErrorCore;

use procreg::probe::ProbeOptions;
use procreg::reference::ReferenceRegistry;
use procreg::shell::Shell;
use procreg::{
    AdapterOptions, Binding, Connector, Error, IoToZ, RegistryAdapter, StartupProbe, COLLECTOR,
};

const USAGE: &str = "USAGE: procreg-shell [--registry reference|erlang] [OPTIONS]";

////////////////////////////////////////////// Options /////////////////////////////////////////////

#[derive(Clone, Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(optional, "Registry to drive: reference or erlang.", "REGISTRY")]
    registry: String,
    #[arrrg(nested)]
    adapter: AdapterOptions,
    #[arrrg(nested)]
    probe: ProbeOptions,
    #[cfg(feature = "erlang")]
    #[arrrg(nested)]
    erlang: procreg::erlang::ErlangOptions,
    #[arrrg(optional, "Write a biometrics snapshot to this file on exit.", "FILE")]
    metrics: String,
    #[arrrg(flag, "Log clues to stderr.")]
    verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            registry: "reference".to_string(),
            adapter: AdapterOptions::default(),
            probe: ProbeOptions::default(),
            #[cfg(feature = "erlang")]
            erlang: procreg::erlang::ErlangOptions::default(),
            metrics: String::new(),
            verbose: false,
        }
    }
}

//////////////////////////////////////////////// run ///////////////////////////////////////////////

fn run<C: Connector>(
    options: &Options,
    connector: C,
    probes: Vec<Box<dyn StartupProbe>>,
) -> Result<(), Error> {
    let collector = Collector::new();
    let adapter = RegistryAdapter::new(options.adapter.clone(), connector).with_probe(probes);
    adapter.register_biometrics(&collector);
    adapter.init()?;
    let config = Config::builder()
        .max_history_size(1_000_000)
        .and_then(|config| config.history_ignore_dups(true))
        .map(|config| config.history_ignore_space(true).build())
        .map_err(system_error)?;
    let rl = Editor::with_history(config, MemHistory::new()).map_err(system_error)?;
    let mut tale = ShellTextTale::new(rl, "procreg> ");
    let mut shell = Shell::new(adapter);
    let result = shell.main_menu(&mut tale);
    shell.binding().cleanup()?;
    if !options.metrics.is_empty() {
        let mut emitter = PlainTextEmitter::new(File::create(&options.metrics)?);
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        collector.emit(&mut emitter, now)?;
    }
    result
}

fn system_error<E: std::fmt::Display>(err: E) -> Error {
    Error::SystemError {
        core: ErrorCore::default(),
        what: err.to_string(),
    }
}

/////////////////////////////////////////////// main ///////////////////////////////////////////////

fn main() {
    let (options, free) = Options::from_command_line_relaxed(USAGE);
    if !free.is_empty() {
        eprintln!("command takes no positional arguments");
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }
    if options.verbose {
        let emitter = Arc::new(StdioEmitter);
        COLLECTOR.register(emitter);
        COLLECTOR.set_verbosity(INFO);
        clue!(COLLECTOR, ALWAYS, {
            new_process: std::env::args().map(String::from).collect::<Vec<_>>(),
        });
    }
    let result = match options.registry.as_str() {
        "reference" => {
            let probes = options
                .probe
                .probes(&options.adapter.target_node)
                .pretty_unwrap();
            let registry = ReferenceRegistry::new();
            run(&options, registry.connector(&options.adapter.target_node), probes)
        }
        #[cfg(feature = "erlang")]
        "erlang" => {
            let probes = options
                .probe
                .probes(&options.erlang.remote_node)
                .pretty_unwrap();
            let connector = procreg::erlang::ErlangConnector::new(options.erlang.clone());
            run(&options, connector, probes)
        }
        registry => {
            eprintln!("unknown registry {:?}", registry);
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    };
    if let Err(err) = result {
        eprintln!("{}", err.long_form());
        std::process::exit(1);
    }
}
