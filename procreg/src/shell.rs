//! A line-oriented command interpreter over any [Binding].

use std::collections::BTreeMap;
use std::time::Instant;

use texttale::TextTale;

use crate::{Binding, Error, FieldSet, Record, Status};

/// The table commands address until `table` switches it.
pub const DEFAULT_TABLE: &str = "usertable";

const SHELL_HELP: &str = "Commands:

read key [field ...] ................. Read a record, optionally restricted to fields.
scan key recordcount [field ...] ..... Scan recordcount records starting at key.
insert key name=value [name=value ...] Insert a record.
update key name=value [name=value ...] Update a record.
delete key ........................... Delete a record.
table [tablename] .................... Show or set the table.
stats ................................ Print counts of the return codes seen so far.
help ................................. Print this help menu.
quit ................................. Leave the shell.
";

/////////////////////////////////////////////// Shell //////////////////////////////////////////////

/// Interprets commands against a [Binding] and writes results to a [TextTale].
pub struct Shell<B: Binding> {
    binding: B,
    table: String,
    tallies: BTreeMap<String, u64>,
}

impl<B: Binding> Shell<B> {
    pub fn new(binding: B) -> Self {
        Self {
            binding,
            table: DEFAULT_TABLE.to_string(),
            tallies: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn binding(&self) -> &B {
        &self.binding
    }

    /// Read commands until the tale runs dry or the user quits.
    pub fn main_menu<T: TextTale>(&mut self, tale: &mut T) -> Result<(), Error> {
        'commands: loop {
            let Some(line) = tale.next_command() else {
                break 'commands;
            };
            let line = line.trim();
            if line.is_empty() {
                continue 'commands;
            }
            let cmd = match shvar::split(line) {
                Ok(cmd) => cmd,
                Err(err) => {
                    writeln!(tale, "could not parse {:?}: {:?}", line, err)?;
                    continue 'commands;
                }
            };
            match cmd[0].as_str() {
                "read" => self.read(tale, &cmd[1..])?,
                "scan" => self.scan(tale, &cmd[1..])?,
                "insert" => self.write(tale, "insert", &cmd[1..])?,
                "update" => self.write(tale, "update", &cmd[1..])?,
                "delete" => self.delete(tale, &cmd[1..])?,
                "table" => {
                    if cmd.len() > 2 {
                        writeln!(tale, "table takes at most one argument, the table name.")?;
                    } else if cmd.len() == 2 {
                        self.table = cmd[1].clone();
                    }
                    writeln!(tale, "Using table \"{}\"", self.table)?;
                }
                "stats" => {
                    for (what, count) in self.tallies.iter() {
                        writeln!(tale, "{} {}", what, count)?;
                    }
                }
                "help" => {
                    writeln!(tale, "{}", SHELL_HELP)?;
                }
                "quit" => {
                    break 'commands;
                }
                _ => {
                    writeln!(tale, "unknown command: {}", line)?;
                }
            }
        }
        Ok(())
    }

    fn read<T: TextTale>(&mut self, tale: &mut T, args: &[String]) -> Result<(), Error> {
        if args.is_empty() {
            writeln!(tale, "USAGE: read key [field ...]")?;
            return Ok(());
        }
        let fields = field_set(&args[1..]);
        let mut record = Record::new();
        let start = Instant::now();
        let status = self
            .binding
            .read(&self.table, &args[0], fields.as_ref(), &mut record);
        self.report(tale, "read", status)?;
        print_record(tale, &record)?;
        writeln!(tale, "{} ms", start.elapsed().as_millis())?;
        Ok(())
    }

    fn scan<T: TextTale>(&mut self, tale: &mut T, args: &[String]) -> Result<(), Error> {
        if args.len() < 2 {
            writeln!(tale, "USAGE: scan key recordcount [field ...]")?;
            return Ok(());
        }
        let record_count = match args[1].parse::<usize>() {
            Ok(record_count) => record_count,
            Err(err) => {
                writeln!(tale, "invalid recordcount {:?}: {}", args[1], err)?;
                return Ok(());
            }
        };
        let fields = field_set(&args[2..]);
        let mut records = vec![];
        let start = Instant::now();
        let status = self.binding.scan(
            &self.table,
            &args[0],
            record_count,
            fields.as_ref(),
            &mut records,
        );
        self.report(tale, "scan", status)?;
        for (idx, record) in records.iter().enumerate() {
            writeln!(tale, "[record {}]", idx)?;
            print_record(tale, record)?;
        }
        writeln!(tale, "{} ms", start.elapsed().as_millis())?;
        Ok(())
    }

    fn write<T: TextTale>(
        &mut self,
        tale: &mut T,
        op: &'static str,
        args: &[String],
    ) -> Result<(), Error> {
        if args.len() < 2 {
            writeln!(tale, "USAGE: {} key name=value [name=value ...]", op)?;
            return Ok(());
        }
        let mut values = Record::new();
        for pair in args[1..].iter() {
            let Some((name, value)) = pair.split_once('=') else {
                writeln!(tale, "expected name=value, got {:?}", pair)?;
                return Ok(());
            };
            values.insert(name.to_string(), value.as_bytes().to_vec());
        }
        let start = Instant::now();
        let status = match op {
            "insert" => self.binding.insert(&self.table, &args[0], &values),
            _ => self.binding.update(&self.table, &args[0], &values),
        };
        self.report(tale, op, status)?;
        writeln!(tale, "{} ms", start.elapsed().as_millis())?;
        Ok(())
    }

    fn delete<T: TextTale>(&mut self, tale: &mut T, args: &[String]) -> Result<(), Error> {
        if args.len() != 1 {
            writeln!(tale, "USAGE: delete key")?;
            return Ok(());
        }
        let start = Instant::now();
        let status = self.binding.delete(&self.table, &args[0]);
        self.report(tale, "delete", status)?;
        writeln!(tale, "{} ms", start.elapsed().as_millis())?;
        Ok(())
    }

    fn report<T: TextTale>(&mut self, tale: &mut T, op: &str, status: Status) -> Result<(), Error> {
        *self.tallies.entry(format!("{} {}", op, status)).or_default() += 1;
        writeln!(tale, "Return code: {}", status)?;
        Ok(())
    }
}

fn field_set(fields: &[String]) -> Option<FieldSet> {
    if fields.is_empty() {
        None
    } else {
        Some(fields.iter().cloned().collect())
    }
}

fn print_record<T: TextTale>(tale: &mut T, record: &Record) -> Result<(), Error> {
    for (name, value) in record.iter() {
        writeln!(tale, "{}={}", name, String::from_utf8_lossy(value))?;
    }
    Ok(())
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
