//! Scripted peer for the helper protocol, used to drive hosts in tests.

use std::io::{BufWriter, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use haltkit_contracts::{HandleRecord, ResolveError};
use haltkit_name_helper::{open_inherited, serve, EchoSource, NameSource};

/// [`EchoSource`] plus the one behavior a library must not have: dying.
struct ExitingEcho(EchoSource);

impl NameSource for ExitingEcho {
    fn name_of(&mut self, record: &HandleRecord) -> Result<Option<String>, ResolveError> {
        if record.object_type_index == EchoSource::EXIT {
            std::process::exit(0);
        }
        self.0.name_of(record)
    }
}

fn main() -> ExitCode {
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("haltkit-name-echo: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn try_main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [request, response] = args.as_slice() else {
        anyhow::bail!("usage: haltkit-name-echo <request-pipe> <response-pipe>");
    };
    let mut reader = open_inherited(request).context("open request pipe")?;
    let mut writer = BufWriter::new(open_inherited(response).context("open response pipe")?);

    serve(&mut reader, &mut writer, &mut ExitingEcho(EchoSource)).context("pipe io")?;
    writer.flush().context("pipe io")?;
    Ok(())
}
