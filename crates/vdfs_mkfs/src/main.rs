use clap::Parser;
use std::path::PathBuf;

use vdfs_lib::{FileDisk, FileSystem};

/// Herramienta para formatear un disco virtual VDFS
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Ruta al archivo que respalda el disco virtual
    #[arg(value_name = "IMAGEN")]
    path: PathBuf,

    /// Tamaño del disco en GB (si el archivo no existe o no coincide)
    #[arg(short, long, default_value_t = 4)]
    size_gb: u32,
}

fn main() -> anyhow::Result<()> {
    env_logger::init(); // Para ver logs con RUST_LOG=debug
    let args = Args::parse();

    println!("=== Formateador VDFS ===");
    println!("Disco objetivo: {:?} ({} GB)", args.path, args.size_gb);

    if args.size_gb == 0 {
        anyhow::bail!("El tamaño mínimo del disco es 1 GB.");
    }

    // 1. Abrir o crear el disco virtual
    let disk = FileDisk::open(&args.path, args.size_gb)?;

    // 2. Montar (formatea solo si hace falta) y forzar el formateo
    let mut fs = FileSystem::mount(disk)?;
    fs.format()?;
    println!("[x] Superbloque, bitmaps y directorio raíz escritos");

    // 3. Reporte de geometría
    let info = fs.disk_info();
    println!("[x] Formateo completado");
    println!("Geometría resultante:");
    println!("  tamaño de bloque : {} B", info.block_size);
    println!("  bloques totales  : {}", info.total_blocks);
    println!("  bloques libres   : {}", info.free_blocks);
    println!("  inodos totales   : {}", info.inodes_cnt);
    println!("  inodos libres    : {}", info.free_inodes);

    Ok(())
}
