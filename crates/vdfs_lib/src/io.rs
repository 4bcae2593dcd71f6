use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::cache::{CacheBackend, Handle, LruCache};
use crate::device::Disk;
use crate::types::{Buffer, FsError, SuperBlock, BLOCK_SIZE};

/// Cantidad de bloques cacheados por defecto (256 MiB con bloques de 16 KiB).
pub const DEFAULT_CACHE_BLOCKS: usize = 16384;

pub type BlockHandle = Handle<Buffer>;

/// Respaldo del caché de bloques: lee y escribe bloques crudos del disco.
/// El LBA 0 es un centinela ("sin bloque"): carga como buffer de ceros y
/// nunca se escribe.
struct BlockBackend {
    disk: Rc<RefCell<dyn Disk>>,
}

impl CacheBackend<u64, Buffer> for BlockBackend {
    fn load(&mut self, lba: u64) -> Result<Buffer, FsError> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        if lba != 0 {
            self.disk.borrow_mut().read_block(lba, &mut buf)?;
        }
        Ok(buf)
    }

    fn save(&mut self, lba: u64, val: &Buffer) -> Result<(), FsError> {
        if lba == 0 {
            return Ok(());
        }
        assert_eq!(val.len(), BLOCK_SIZE, "buffer de bloque de tamaño inválido");
        self.disk.borrow_mut().write_block(lba, val)?;
        Ok(())
    }
}

/// Contexto de E/S: custodia el superbloque en memoria y el caché de bloques.
/// El LBA 0 no pasa por el caché; el superbloque tiene su representación
/// propia y se lee y escribe directo al disco.
pub struct IoContext {
    sb: Rc<RefCell<SuperBlock>>,
    disk: Rc<RefCell<dyn Disk>>,
    cache: LruCache<u64, Buffer, BlockBackend>,
}

impl IoContext {
    pub fn new(
        sb: Rc<RefCell<SuperBlock>>,
        disk: Rc<RefCell<dyn Disk>>,
        cache_blocks: usize,
    ) -> Self {
        let backend = BlockBackend {
            disk: Rc::clone(&disk),
        };
        Self {
            sb,
            disk,
            cache: LruCache::new(cache_blocks, backend),
        }
    }

    /// Lee el superbloque directo del LBA 0, sin pasar por el caché.
    pub fn read_super_block(&mut self) -> Result<(), FsError> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.disk.borrow_mut().read_block(0, &mut buf)?;
        *self.sb.borrow_mut() = SuperBlock::decode(&buf);
        Ok(())
    }

    /// Escribe el superbloque directo al LBA 0.
    pub fn flush_super_block(&mut self) -> Result<(), FsError> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.sb.borrow().encode_into(&mut buf)?;
        self.disk.borrow_mut().write_block(0, &buf)?;
        Ok(())
    }

    /// Handle de lectura compartida sobre un bloque cacheado.
    pub fn read_block(&mut self, lba: u64) -> Result<BlockHandle, FsError> {
        assert_ne!(lba, 0, "el LBA 0 no se lee a través del caché");
        self.cache.get(lba)
    }

    /// Handle de escritura exclusiva; la entrada queda sucia.
    pub fn acquire_block(&mut self, lba: u64) -> Result<BlockHandle, FsError> {
        assert_ne!(lba, 0, "el LBA 0 no se escribe a través del caché");
        self.cache.get_mut(lba)
    }

    /// Persiste superbloque y todo bloque sucio del caché.
    pub fn flush_all(&mut self) -> Result<(), FsError> {
        debug!("[IoContext] Vaciando superbloque y caché de bloques.");
        self.flush_super_block()?;
        self.cache.flush_all()?;
        self.disk.borrow_mut().flush()?;
        Ok(())
    }

    /// Vacía el caché y limpia el disco completo.
    pub fn clear(&mut self) -> Result<(), FsError> {
        self.cache.clear()?;
        self.disk.borrow_mut().clear()?;
        Ok(())
    }

    pub fn disk_size_gb(&self) -> u32 {
        self.disk.borrow().disk_size_gb()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDisk;
    use std::fs;
    use std::path::PathBuf;

    fn temp_disk(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vdfs_io_{}_{}.img", name, std::process::id()))
    }

    fn setup(name: &str) -> (Rc<RefCell<SuperBlock>>, IoContext, PathBuf) {
        let path = temp_disk(name);
        let _ = fs::remove_file(&path);
        let disk = FileDisk::open(&path, 1).unwrap();
        let sb = Rc::new(RefCell::new(SuperBlock::default()));
        let disk: Rc<RefCell<dyn Disk>> = Rc::new(RefCell::new(disk));
        let io = IoContext::new(Rc::clone(&sb), disk, 16);
        (sb, io, path)
    }

    #[test]
    fn test_super_block_bypasses_cache() {
        let (sb, mut io, path) = setup("super");

        *sb.borrow_mut() = SuperBlock::create(1);
        io.flush_super_block().unwrap();

        // Se corrompe la copia en memoria y se relee desde el disco.
        sb.borrow_mut().magic = 0;
        io.read_super_block().unwrap();
        assert!(sb.borrow().valid());
        assert_eq!(sb.borrow().total_blocks, 65536);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_acquire_then_read_sees_mutation() {
        let (_sb, mut io, path) = setup("handles");

        {
            let handle = io.acquire_block(10).unwrap();
            handle.borrow_mut()[0] = 0x77;
        }
        // Misma entrada del caché, sin pasar por el disco.
        let handle = io.read_block(10).unwrap();
        assert_eq!(handle.borrow()[0], 0x77);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_flush_persists_dirty_blocks() {
        let path = temp_disk("flush");
        let _ = fs::remove_file(&path);

        {
            let disk = FileDisk::open(&path, 1).unwrap();
            let sb = Rc::new(RefCell::new(SuperBlock::create(1)));
            let disk: Rc<RefCell<dyn Disk>> = Rc::new(RefCell::new(disk));
            let mut io = IoContext::new(sb, disk, 16);
            let handle = io.acquire_block(5).unwrap();
            handle.borrow_mut()[123] = 0xAB;
            drop(handle);
            io.flush_all().unwrap();
        }

        // Un contexto nuevo sobre el mismo archivo ve el byte persistido.
        let disk = FileDisk::open(&path, 1).unwrap();
        let sb = Rc::new(RefCell::new(SuperBlock::default()));
        let disk: Rc<RefCell<dyn Disk>> = Rc::new(RefCell::new(disk));
        let mut io = IoContext::new(sb, disk, 16);
        let handle = io.read_block(5).unwrap();
        assert_eq!(handle.borrow()[123], 0xAB);

        let _ = fs::remove_file(&path);
    }
}
