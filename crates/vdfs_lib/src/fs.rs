use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, error, info};

use crate::bitmap::BlockAllocator;
use crate::btree::BlockIndexer;
use crate::device::Disk;
use crate::inode::{DirItem, FileType, Inode, InodeTable, DEFAULT_INODE_CACHE};
use crate::io::{IoContext, DEFAULT_CACHE_BLOCKS};
use crate::types::{FsError, SuperBlock, DIRITEM_SIZE};

/// Entrada de un listado de directorio.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub inode_id: u64,
    pub size: u64,
    pub name: String,
}

/// Resumen de ocupación del disco (comando `df`).
#[derive(Debug, Clone)]
pub struct DiskInfo {
    pub disk_size_gb: u32,
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub inodes_cnt: u64,
    pub free_inodes: u64,
}

struct FdEntry {
    inode_id: u64,
    offset: u64,
}

/// Fachada del sistema de archivos: resolución de rutas, tabla de
/// descriptores y formateo. Composición explícita: cada componente recibe
/// sus dependencias al construirse.
pub struct FileSystem {
    sb: Rc<RefCell<SuperBlock>>,
    io: Rc<RefCell<IoContext>>,
    alloc: Rc<BlockAllocator>,
    itable: InodeTable,
    fds: HashMap<u64, FdEntry>,
    next_fd: u64,
}

impl FileSystem {
    /// Monta el sistema sobre un disco. Si el superbloque no es válido
    /// (disco nuevo, u otra versión) se formatea primero.
    pub fn mount<D: Disk + 'static>(disk: D) -> Result<Self, FsError> {
        Self::mount_with_caches(disk, DEFAULT_CACHE_BLOCKS, DEFAULT_INODE_CACHE)
    }

    pub fn mount_with_caches<D: Disk + 'static>(
        disk: D,
        cache_blocks: usize,
        cache_inodes: usize,
    ) -> Result<Self, FsError> {
        info!("[FileSystem] Arrancando sistema de archivos.");
        let sb = Rc::new(RefCell::new(SuperBlock::default()));
        let disk: Rc<RefCell<dyn Disk>> = Rc::new(RefCell::new(disk));
        let io = Rc::new(RefCell::new(IoContext::new(
            Rc::clone(&sb),
            disk,
            cache_blocks,
        )));
        let alloc = Rc::new(BlockAllocator::new(Rc::clone(&sb), Rc::clone(&io)));
        let indexer = Rc::new(RefCell::new(BlockIndexer::new(
            Rc::clone(&io),
            Rc::clone(&alloc),
        )));
        let itable = InodeTable::new(
            Rc::clone(&sb),
            Rc::clone(&io),
            Rc::clone(&alloc),
            indexer,
            cache_inodes,
        );

        let mut fs = Self {
            sb,
            io,
            alloc,
            itable,
            fds: HashMap::new(),
            next_fd: 0,
        };

        info!("[FileSystem] Leyendo superbloque.");
        fs.io.borrow_mut().read_super_block()?;
        if !fs.sb.borrow().valid() {
            info!("[FileSystem] El disco no contiene un sistema válido, se formatea.");
            fs.format()?;
        }
        fs.log_geometry();
        Ok(fs)
    }

    /// Formatea el disco: limpia cachés y disco, instala un superbloque
    /// recién derivado, reinicia ambos bitmaps y crea el directorio raíz.
    pub fn format(&mut self) -> Result<(), FsError> {
        info!("[FileSystem] Formateando el disco.");

        self.itable.clear_cache();
        self.fds.clear();
        self.io.borrow_mut().clear()?;

        let disk_size_gb = self.io.borrow().disk_size_gb();
        *self.sb.borrow_mut() = SuperBlock::create(disk_size_gb);
        self.io.borrow_mut().flush_super_block()?;

        self.alloc.reset_bitmap()?;
        self.itable.reset_inode_bitmap()?;

        debug!("[FileSystem] Creando directorio raíz.");
        let root = self
            .itable
            .allocate_inode(FileType::Directory, 0)?
            .ok_or(FsError::OutOfInodes)?;
        self.sb.borrow_mut().root_inode_id = root;
        self.write_dot_entries(root, root)?;

        self.io.borrow_mut().flush_super_block()?;
        info!("[FileSystem] Formateo completo.");
        Ok(())
    }

    /// Resuelve una ruta absoluta a su inodo. Una ruta vacía o "/" es la
    /// raíz. Devuelve None si algún componente no existe o no es navegable.
    pub fn lookup_path(&mut self, path: &str) -> Result<Option<u64>, FsError> {
        match self.resolve(path) {
            Ok(id) => Ok(Some(id)),
            Err(FsError::NotFound) | Err(FsError::NotADirectory) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn create_dir(&mut self, path: &str) -> Result<(), FsError> {
        let (parent_path, name) = split_parent(path)?;
        let parent = self.resolve(parent_path)?;
        self.expect_type(parent, FileType::Directory)?;
        if self.itable.find_inode_by_name(parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let id = self
            .itable
            .allocate_inode(FileType::Directory, parent)?
            .ok_or(FsError::OutOfInodes)?;
        self.write_dot_entries(id, parent)?;

        if let Err(e) = self.itable.add_diritem(parent, name, id) {
            self.itable.free_inode(id)?;
            return Err(e);
        }
        Ok(())
    }

    pub fn create_file(&mut self, path: &str) -> Result<(), FsError> {
        let (parent_path, name) = split_parent(path)?;
        let parent = self.resolve(parent_path)?;
        self.expect_type(parent, FileType::Directory)?;
        if self.itable.find_inode_by_name(parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let id = self
            .itable
            .allocate_inode(FileType::File, parent)?
            .ok_or(FsError::OutOfInodes)?;
        if let Err(e) = self.itable.add_diritem(parent, name, id) {
            self.itable.free_inode(id)?;
            return Err(e);
        }
        Ok(())
    }

    pub fn remove_file(&mut self, path: &str) -> Result<(), FsError> {
        let (parent_path, name) = split_parent(path)?;
        let parent = self.resolve(parent_path)?;
        let target = self
            .itable
            .find_inode_by_name(parent, name)?
            .ok_or(FsError::NotFound)?;
        self.expect_type(target, FileType::File)?;
        self.itable.remove_diritem(parent, name)
    }

    pub fn remove_dir(&mut self, path: &str) -> Result<(), FsError> {
        let (parent_path, name) = split_parent(path)?;
        let parent = self.resolve(parent_path)?;
        let target = self
            .itable
            .find_inode_by_name(parent, name)?
            .ok_or(FsError::NotFound)?;
        self.expect_type(target, FileType::Directory)?;
        self.itable.remove_diritem(parent, name)
    }

    pub fn has_dir(&mut self, path: &str) -> bool {
        matches!(
            self.resolve(path)
                .and_then(|id| self.itable.get_inode_info(id)),
            Ok(node) if node.file_type == FileType::Directory
        )
    }

    pub fn has_file(&mut self, path: &str) -> bool {
        matches!(
            self.resolve(path)
                .and_then(|id| self.itable.get_inode_info(id)),
            Ok(node) if node.file_type == FileType::File
        )
    }

    /// Abre un archivo (solo archivos) y devuelve un descriptor nuevo.
    /// Los descriptores son crecientes y no se reutilizan en la vida del
    /// proceso.
    pub fn open(&mut self, path: &str, offset: u64) -> Result<u64, FsError> {
        let id = self.resolve(path)?;
        self.expect_type(id, FileType::File)?;
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(
            fd,
            FdEntry {
                inode_id: id,
                offset,
            },
        );
        Ok(fd)
    }

    /// Lee desde la posición actual del descriptor y la avanza.
    pub fn read(&mut self, fd: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let (inode_id, offset) = {
            let entry = self.fds.get(&fd).ok_or(FsError::BadFd)?;
            (entry.inode_id, entry.offset)
        };
        let n = self.itable.read_data(inode_id, offset, buf)?;
        if let Some(entry) = self.fds.get_mut(&fd) {
            entry.offset += n as u64;
        }
        Ok(n)
    }

    /// Escribe en la posición actual del descriptor y la avanza.
    pub fn write(&mut self, fd: u64, data: &[u8]) -> Result<(), FsError> {
        let (inode_id, offset) = {
            let entry = self.fds.get(&fd).ok_or(FsError::BadFd)?;
            (entry.inode_id, entry.offset)
        };
        self.itable.write_data(inode_id, offset, data)?;
        if let Some(entry) = self.fds.get_mut(&fd) {
            entry.offset += data.len() as u64;
        }
        Ok(())
    }

    /// Mueve la posición del descriptor. Puede quedar más allá del tamaño:
    /// una escritura posterior crea una región dispersa.
    pub fn seek(&mut self, fd: u64, offset: u64) -> Result<(), FsError> {
        let entry = self.fds.get_mut(&fd).ok_or(FsError::BadFd)?;
        entry.offset = offset;
        Ok(())
    }

    /// Cierra el descriptor y vacía cachés al disco.
    pub fn close(&mut self, fd: u64) -> Result<(), FsError> {
        self.fds.remove(&fd).ok_or(FsError::BadFd)?;
        self.sync()
    }

    /// Metadatos de un inodo resuelto por ruta.
    pub fn stat(&mut self, path: &str) -> Result<Inode, FsError> {
        let id = self.resolve(path)?;
        self.itable.get_inode_info(id)
    }

    pub fn list_directory(&mut self, path: &str) -> Result<Vec<DirEntryInfo>, FsError> {
        let id = self.resolve(path)?;
        self.expect_type(id, FileType::Directory)?;
        let items = self.itable.read_dir(id)?;

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let node = self.itable.get_inode_info(item.inode_id)?;
            out.push(DirEntryInfo {
                inode_id: item.inode_id,
                size: node.size,
                name: item.name(),
            });
        }
        Ok(out)
    }

    pub fn disk_info(&self) -> DiskInfo {
        let sb = self.sb.borrow();
        DiskInfo {
            disk_size_gb: sb.disk_size_gb,
            block_size: sb.block_size,
            total_blocks: sb.total_blocks,
            free_blocks: sb.free_blocks,
            inodes_cnt: sb.inodes_cnt,
            free_inodes: sb.free_inodes,
        }
    }

    /// Persiste todo: inodos sucios, bloques sucios y superbloque.
    pub fn sync(&mut self) -> Result<(), FsError> {
        self.itable.flush()?;
        self.io.borrow_mut().flush_all()
    }

    // --- INTERNOS ---

    fn resolve(&mut self, path: &str) -> Result<u64, FsError> {
        if !path.is_empty() && !path.starts_with('/') {
            return Err(FsError::NotFound);
        }
        let mut cur = self.sb.borrow().root_inode_id;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            let node = self.itable.get_inode_info(cur)?;
            if node.file_type != FileType::Directory {
                return Err(FsError::NotADirectory);
            }
            cur = self
                .itable
                .find_inode_by_name(cur, comp)?
                .ok_or(FsError::NotFound)?;
        }
        Ok(cur)
    }

    fn expect_type(&mut self, id: u64, wanted: FileType) -> Result<(), FsError> {
        let node = self.itable.get_inode_info(id)?;
        if node.file_type != wanted {
            return Err(match wanted {
                FileType::Directory => FsError::NotADirectory,
                FileType::File => FsError::NotAFile,
            });
        }
        Ok(())
    }

    /// Instala "." y ".." como primeras dos entradas de un directorio nuevo.
    fn write_dot_entries(&mut self, dir_id: u64, parent: u64) -> Result<(), FsError> {
        let mut buf = [0u8; 2 * DIRITEM_SIZE];
        DirItem::new(dir_id, ".").to_bytes(&mut buf[..DIRITEM_SIZE]);
        DirItem::new(parent, "..").to_bytes(&mut buf[DIRITEM_SIZE..]);
        self.itable.write_data(dir_id, 0, &buf)
    }

    fn log_geometry(&self) {
        let sb = self.sb.borrow();
        debug!("[FileSystem] Magic: 0x{:X}, versión: {}.", sb.magic, sb.version);
        debug!(
            "[FileSystem] Disco: {} GB, bloques: {} de {} B.",
            sb.disk_size_gb, sb.total_blocks, sb.block_size
        );
        debug!(
            "[FileSystem] Bitmap en 0x{:X} ({} bloques), bitmap de inodos en 0x{:X} ({} bloques).",
            sb.bitmap_start_lba,
            sb.bitmap_blocks_cnt,
            sb.inode_bitmap_start_lba,
            sb.inode_bitmap_blocks_cnt
        );
        debug!(
            "[FileSystem] Tabla de inodos en 0x{:X} ({} bloques, {} inodos).",
            sb.inode_block_start_lba, sb.inode_blocks_cnt, sb.inodes_cnt
        );
        debug!(
            "[FileSystem] Región básica: {} bloques; libres: {}; raíz: {}.",
            sb.basic_blocks_cnt, sb.free_blocks, sb.root_inode_id
        );
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            error!("[FileSystem] Falló el vaciado al cerrar: {}.", e);
        }
    }
}

/// Separa una ruta absoluta en (ruta del padre, nombre final).
fn split_parent(path: &str) -> Result<(&str, &str), FsError> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() || !trimmed.starts_with('/') {
        return Err(FsError::NotFound);
    }
    let cut = trimmed.rfind('/').unwrap_or(0);
    let name = &trimmed[cut + 1..];
    if name.is_empty() {
        return Err(FsError::NotFound);
    }
    let parent = if cut == 0 { "/" } else { &trimmed[..cut] };
    Ok((parent, name))
}
