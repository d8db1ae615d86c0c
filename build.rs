//! Build script rendering the `wirebridge` man page from the CLI definition.

use std::{env, fs, path::PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli.rs"]
mod cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    println!("cargo:rerun-if-env-changed=WIREBRIDGE_MAN_DIR");

    let out_dir = env::var_os("WIREBRIDGE_MAN_DIR")
        .map_or_else(|| PathBuf::from("target/generated-man"), PathBuf::from);
    fs::create_dir_all(&out_dir)?;

    let mut page = Vec::new();
    Man::new(cli::Cli::command()).render(&mut page)?;
    fs::write(out_dir.join("wirebridge.1"), page)?;
    Ok(())
}
