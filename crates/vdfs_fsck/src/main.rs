use clap::Parser;
use colored::*; // Para output bonito
use std::collections::HashSet;
use std::path::PathBuf;

use vdfs_lib::{
    DirItem, Disk, FileDisk, FileType, Inode, StorageType, SuperBlock, BLOCK_SIZE, DIRITEM_SIZE,
    INODE_SIZE,
};

/// Verificador de consistencia para discos VDFS
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Archivo que respalda el disco virtual
    #[arg(value_name = "IMAGEN")]
    path: PathBuf,
}

struct Checker {
    disk: FileDisk,
    sb: SuperBlock,
    errors: usize,
    warnings: usize,
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Bit `idx` de una región de bitmap ya cargada (MSB primero).
fn bit_at(bitmap: &[u8], idx: u64) -> bool {
    bitmap[(idx / 8) as usize] & (1 << (7 - idx % 8)) != 0
}

impl Checker {
    fn read_block(&mut self, lba: u64) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.disk.read_block(lba, &mut buf)?;
        Ok(buf)
    }

    fn read_region(&mut self, start_lba: u64, blocks: u64) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::with_capacity((blocks as usize) * BLOCK_SIZE);
        for i in 0..blocks {
            out.extend_from_slice(&self.read_block(start_lba + i)?);
        }
        Ok(out)
    }

    fn fail(&mut self, msg: String) {
        println!("    {} {}", "[CORRUPCIÓN]".red(), msg);
        self.errors += 1;
    }

    fn warn(&mut self, msg: String) {
        println!("    {} {}", "[WARN]".yellow(), msg);
        self.warnings += 1;
    }

    fn read_inode(&mut self, id: u64) -> anyhow::Result<Inode> {
        let lba = self.sb.inode_block_start_lba + id / self.sb.inodes_per_block as u64;
        let off = (id % self.sb.inodes_per_block as u64) as usize * INODE_SIZE;
        let block = self.read_block(lba)?;
        Ok(Inode::from_bytes(&block[off..off + INODE_SIZE]))
    }

    /// Recorre un árbol de índice y acumula los LBA de sus nodos y de los
    /// bloques de datos de las hojas.
    fn walk_tree(
        &mut self,
        lba: u64,
        nodes: &mut HashSet<u64>,
        data: &mut HashSet<u64>,
    ) -> anyhow::Result<()> {
        if lba == 0 || !nodes.insert(lba) {
            return Ok(());
        }
        let buf = self.read_block(lba)?;
        let is_leaf = u64_at(&buf, 0) != 0;
        let key_cnt = u64_at(&buf, 8) as usize;
        let m = self.sb.btree_m as usize;
        let vals_off = 24 + m * 8;

        if is_leaf {
            for i in 0..key_cnt {
                data.insert(u64_at(&buf, vals_off + i * 8));
            }
        } else {
            for i in 0..=key_cnt {
                let child = u64_at(&buf, vals_off + i * 8);
                self.walk_tree(child, nodes, data)?;
            }
        }
        Ok(())
    }

    /// Primeros dos registros de un directorio, según su estrategia de
    /// almacenamiento.
    fn read_first_diritems(&mut self, node: &Inode) -> anyhow::Result<Option<[DirItem; 2]>> {
        if node.size < 2 * DIRITEM_SIZE as u64 {
            return Ok(None);
        }
        let raw: Vec<u8> = match node.storage_type {
            StorageType::Inline => node.inline_data[..2 * DIRITEM_SIZE].to_vec(),
            StorageType::Direct => self.read_block(node.block_lba)?[..2 * DIRITEM_SIZE].to_vec(),
            StorageType::Index => {
                let mut nodes = HashSet::new();
                let mut cur = node.block_lba;
                // Descenso por el hijo 0 hasta la primera hoja.
                loop {
                    if cur == 0 || !nodes.insert(cur) {
                        return Ok(None);
                    }
                    let buf = self.read_block(cur)?;
                    let is_leaf = u64_at(&buf, 0) != 0;
                    let m = self.sb.btree_m as usize;
                    let first_val = u64_at(&buf, 24 + m * 8);
                    if is_leaf {
                        let first_key = u64_at(&buf, 24);
                        if first_key != 0 || first_val == 0 {
                            return Ok(None);
                        }
                        break self.read_block(first_val)?[..2 * DIRITEM_SIZE].to_vec();
                    }
                    cur = first_val;
                }
            }
        };
        Ok(Some([
            DirItem::from_bytes(&raw[..DIRITEM_SIZE]),
            DirItem::from_bytes(&raw[DIRITEM_SIZE..]),
        ]))
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    println!("{}", "=== VDFS File System Check (fsck) ===".bold().blue());

    if !args.path.exists() {
        anyhow::bail!("El archivo de disco no existe: {:?}", args.path);
    }
    // El tamaño sale del propio archivo: abrir con otro tamaño lo limpiaría.
    let len = std::fs::metadata(&args.path)?.len();
    if len == 0 || len % (1 << 30) != 0 {
        anyhow::bail!("El archivo no tiene un tamaño de disco válido ({} B)", len);
    }
    let mut disk = FileDisk::open(&args.path, (len >> 30) as u32)?;
    println!("[*] Disco encontrado en {:?} ({} GB)", args.path, len >> 30);

    // 1. Superbloque
    println!("[*] Leyendo superbloque...");
    let mut block0 = vec![0u8; BLOCK_SIZE];
    disk.read_block(0, &mut block0)?;
    let sb = SuperBlock::decode(&block0);
    if sb.valid() {
        println!("{}", "[OK] Firma VDFS válida (magic y versión correctos)".green());
    } else {
        println!("{}", "[FAIL] Firma inválida. No es un disco VDFS".red());
        return Ok(());
    }
    println!("    > Bloques totales: {}", sb.total_blocks);
    println!("    > Inodos: {}", sb.inodes_cnt);

    let mut chk = Checker {
        disk,
        sb: sb.clone(),
        errors: 0,
        warnings: 0,
    };

    // 2. Bitmap de bloques
    println!("[*] Verificando bitmap de bloques...");
    let bitmap = chk.read_region(sb.bitmap_start_lba, sb.bitmap_blocks_cnt)?;

    for lba in 0..sb.basic_blocks_cnt {
        if !bit_at(&bitmap, lba) {
            chk.fail(format!("Bloque básico {} marcado como libre", lba));
        }
    }

    let used_bits = (0..sb.total_blocks).filter(|&i| bit_at(&bitmap, i)).count() as u64;
    let free_bits = sb.total_blocks - used_bits;
    if free_bits == sb.free_blocks {
        println!(
            "{}",
            format!("[OK] free_blocks coincide con el bitmap ({})", free_bits).green()
        );
    } else {
        chk.fail(format!(
            "free_blocks={} pero el bitmap tiene {} bits libres",
            sb.free_blocks, free_bits
        ));
    }

    // 3. Bitmap de inodos
    println!("[*] Verificando bitmap de inodos...");
    let inode_bitmap = chk.read_region(sb.inode_bitmap_start_lba, sb.inode_bitmap_blocks_cnt)?;
    let used_inodes = (0..sb.inodes_cnt).filter(|&i| bit_at(&inode_bitmap, i)).count() as u64;
    let free_inodes = sb.inodes_cnt - used_inodes;
    if free_inodes == sb.free_inodes {
        println!(
            "{}",
            format!("[OK] free_inodes coincide con el bitmap ({})", free_inodes).green()
        );
    } else {
        chk.fail(format!(
            "free_inodes={} pero el bitmap tiene {} bits libres",
            sb.free_inodes, free_inodes
        ));
    }

    // 4. Inodos activos
    println!("[*] Analizando tabla de inodos...");
    let mut referenced: HashSet<u64> = (0..sb.basic_blocks_cnt).collect();

    for id in (0..sb.inodes_cnt).filter(|&i| bit_at(&inode_bitmap, i)) {
        let node = chk.read_inode(id)?;

        match node.storage_type {
            StorageType::Inline => {
                if node.size > sb.inline_data_size as u64 {
                    chk.fail(format!("Inodo {} Inline con tamaño {}", id, node.size));
                }
                if node.block_lba != 0 {
                    chk.fail(format!("Inodo {} Inline con block_lba 0x{:X}", id, node.block_lba));
                }
            }
            StorageType::Direct => {
                if node.size > sb.block_size as u64 {
                    chk.fail(format!("Inodo {} Direct con tamaño {}", id, node.size));
                }
                if node.block_lba == 0 || node.block_lba >= sb.total_blocks {
                    chk.fail(format!(
                        "Inodo {} Direct apunta a bloque inválido 0x{:X}",
                        id, node.block_lba
                    ));
                } else {
                    referenced.insert(node.block_lba);
                }
            }
            StorageType::Index => {
                if node.block_lba == 0 || node.block_lba >= sb.total_blocks {
                    chk.fail(format!(
                        "Inodo {} Index con raíz inválida 0x{:X}",
                        id, node.block_lba
                    ));
                } else {
                    let mut tree_nodes = HashSet::new();
                    let mut data_blocks = HashSet::new();
                    chk.walk_tree(node.block_lba, &mut tree_nodes, &mut data_blocks)?;
                    referenced.extend(tree_nodes);
                    referenced.extend(data_blocks);
                }
            }
        }

        if node.file_type == FileType::Directory {
            match chk.read_first_diritems(&node)? {
                Some([dot, dotdot]) => {
                    if dot.name() != "." || dot.inode_id != id {
                        chk.fail(format!("Directorio {} sin entrada '.' propia", id));
                    }
                    if dotdot.name() != ".." {
                        chk.fail(format!("Directorio {} sin entrada '..'", id));
                    }
                }
                None => chk.fail(format!("Directorio {} sin sus dos entradas base", id)),
            }
        }
    }
    println!("    > Inodos activos revisados: {}", used_inodes);

    // 5. Alcanzabilidad: bitmap contra bloques realmente referenciados
    println!("[*] Buscando inconsistencias de alcanzabilidad...");
    for &lba in &referenced {
        if lba < sb.total_blocks && !bit_at(&bitmap, lba) {
            chk.fail(format!(
                "Bloque 0x{:X} está en uso pero marcado como LIBRE en el bitmap",
                lba
            ));
        }
    }
    for lba in 0..sb.total_blocks {
        if bit_at(&bitmap, lba) && !referenced.contains(&lba) {
            chk.warn(format!(
                "Bloque 0x{:X} marcado como ocupado pero nadie lo referencia (huérfano)",
                lba
            ));
        }
    }

    // 6. Veredicto
    if chk.errors == 0 {
        println!("\n{}", ">> EL SISTEMA DE ARCHIVOS ESTÁ SANO".bold().green());
        if chk.warnings > 0 {
            println!("   ({} advertencias)", chk.warnings);
        }
    } else {
        println!(
            "\n{} Se encontraron {} errores graves.",
            ">> PRECAUCIÓN:".bold().red(),
            chk.errors
        );
        std::process::exit(1);
    }

    Ok(())
}
