use std::io::{BufWriter, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use haltkit_name_helper::{open_inherited, serve, DirectSource};

fn main() -> ExitCode {
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("haltkit-name-helper: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn try_main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [request, response] = args.as_slice() else {
        anyhow::bail!("usage: haltkit-name-helper <request-pipe> <response-pipe>");
    };
    let mut reader = open_inherited(request).context("open request pipe")?;
    let mut writer = BufWriter::new(open_inherited(response).context("open response pipe")?);

    serve(&mut reader, &mut writer, &mut DirectSource).context("pipe io")?;
    writer.flush().context("pipe io")?;
    Ok(())
}
