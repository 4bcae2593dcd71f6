use clap::Parser;
use std::io::Write;
use std::path::PathBuf;

use vdfs_lib::{FileDisk, FileSystem};

mod repl;

/// Intérprete interactivo de comandos sobre un disco VDFS
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Archivo que respalda el disco virtual
    #[arg(value_name = "IMAGEN", default_value = "vdisk.img")]
    path: PathBuf,

    /// Tamaño del disco en GB
    #[arg(short, long, default_value_t = 4)]
    size_gb: u32,
}

fn main() -> anyhow::Result<()> {
    env_logger::init(); // Para ver logs con RUST_LOG=debug
    let args = Args::parse();

    if args.size_gb == 0 {
        anyhow::bail!("El tamaño mínimo del disco es 1 GB.");
    }

    let disk = FileDisk::open(&args.path, args.size_gb)?;
    let fs = FileSystem::mount(disk)?;

    println!("Type 'help' to see available commands.");
    std::io::stdout().flush()?;

    repl::Repl::new(fs).run()
}
