use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};

use crate::bitmap::{self, BlockAllocator};
use crate::btree::BlockIndexer;
use crate::cache::{CacheBackend, LruCache};
use crate::io::IoContext;
use crate::types::{
    FsError, SuperBlock, BLOCK_SIZE, DIRITEM_SIZE, FILENAME_SIZE, INODE_DATA_SIZE, INODE_SIZE,
};

/// Inodos decodificados cacheados por defecto.
pub const DEFAULT_INODE_CACHE: usize = 1024;

/// Entradas de directorio leídas por ronda de E/S al escanear.
const SCAN_BATCH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File = 0,
    Directory = 1,
}

impl FileType {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => FileType::Directory,
            _ => FileType::File,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// La carga útil vive dentro del inodo.
    Inline = 0,
    /// Un único bloque de datos en `block_lba`.
    Direct = 1,
    /// `block_lba` es la raíz de un árbol B+ de índice lógico a LBA.
    Index = 2,
}

impl StorageType {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StorageType::Direct,
            2 => StorageType::Index,
            _ => StorageType::Inline,
        }
    }
}

/// Inodo de tamaño fijo (512 B en disco, 32 por bloque).
/// Layout little-endian: id@0, parent@8, block_lba@16, link_cnt@24 u32,
/// file_type@28 u8, storage_type@29 u8, inline_data@30, size@504.
#[derive(Clone)]
pub struct Inode {
    pub id: u64,
    pub parent: u64,
    pub block_lba: u64,
    pub link_cnt: u32,
    pub file_type: FileType,
    pub storage_type: StorageType,
    pub inline_data: [u8; INODE_DATA_SIZE],
    pub size: u64,
}

impl Inode {
    pub fn new(id: u64, parent: u64) -> Self {
        Self {
            id,
            parent,
            block_lba: 0,
            link_cnt: 0,
            file_type: FileType::File,
            storage_type: StorageType::Inline,
            inline_data: [0; INODE_DATA_SIZE],
            size: 0,
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), INODE_SIZE);
        let mut inline_data = [0u8; INODE_DATA_SIZE];
        inline_data.copy_from_slice(&buf[30..30 + INODE_DATA_SIZE]);
        Self {
            id: u64_at(buf, 0),
            parent: u64_at(buf, 8),
            block_lba: u64_at(buf, 16),
            link_cnt: u32_at(buf, 24),
            file_type: FileType::from_u8(buf[28]),
            storage_type: StorageType::from_u8(buf[29]),
            inline_data,
            size: u64_at(buf, 504),
        }
    }

    pub fn to_bytes(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), INODE_SIZE);
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.parent.to_le_bytes());
        buf[16..24].copy_from_slice(&self.block_lba.to_le_bytes());
        buf[24..28].copy_from_slice(&self.link_cnt.to_le_bytes());
        buf[28] = self.file_type as u8;
        buf[29] = self.storage_type as u8;
        buf[30..30 + INODE_DATA_SIZE].copy_from_slice(&self.inline_data);
        buf[504..512].copy_from_slice(&self.size.to_le_bytes());
    }
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

/// Entrada de directorio de 64 B: id de inodo + nombre terminado en '\0'.
#[derive(Debug, Clone)]
pub struct DirItem {
    pub inode_id: u64,
    name: [u8; FILENAME_SIZE],
}

impl DirItem {
    /// Crea una entrada truncando el nombre al máximo representable.
    pub fn new(inode_id: u64, name: &str) -> Self {
        let mut bytes = [0u8; FILENAME_SIZE];
        let n = name.len().min(FILENAME_SIZE - 1);
        bytes[..n].copy_from_slice(&name.as_bytes()[..n]);
        Self {
            inode_id,
            name: bytes,
        }
    }

    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILENAME_SIZE);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), DIRITEM_SIZE);
        let mut name = [0u8; FILENAME_SIZE];
        name.copy_from_slice(&buf[8..8 + FILENAME_SIZE]);
        Self {
            inode_id: u64_at(buf, 0),
            name,
        }
    }

    pub fn to_bytes(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), DIRITEM_SIZE);
        buf.fill(0);
        buf[0..8].copy_from_slice(&self.inode_id.to_le_bytes());
        buf[8..8 + FILENAME_SIZE].copy_from_slice(&self.name);
    }
}

/// Respaldo del caché de inodos: cada inodo vive en un slot fijo dentro de
/// un bloque de la tabla. Guardar relee el bloque contenedor, parcha solo el
/// slot y lo reescribe, preservando a los inodos vecinos.
struct InodeBackend {
    sb: Rc<RefCell<SuperBlock>>,
    io: Rc<RefCell<IoContext>>,
}

impl InodeBackend {
    fn slot_of(&self, id: u64) -> (u64, usize) {
        let sb = self.sb.borrow();
        let lba = sb.inode_block_start_lba + id / sb.inodes_per_block as u64;
        let off = (id % sb.inodes_per_block as u64) as usize * INODE_SIZE;
        (lba, off)
    }
}

impl CacheBackend<u64, Inode> for InodeBackend {
    fn load(&mut self, id: u64) -> Result<Inode, FsError> {
        let (lba, off) = self.slot_of(id);
        let handle = self.io.borrow_mut().read_block(lba)?;
        let buf = handle.borrow();
        Ok(Inode::from_bytes(&buf[off..off + INODE_SIZE]))
    }

    fn save(&mut self, id: u64, node: &Inode) -> Result<(), FsError> {
        let (lba, off) = self.slot_of(id);
        let handle = self.io.borrow_mut().acquire_block(lba)?;
        let mut buf = handle.borrow_mut();
        node.to_bytes(&mut buf[off..off + INODE_SIZE]);
        Ok(())
    }
}

/// Tabla de inodos: bitmap de validez, slots en disco, caché LRU con
/// write-back y la máquina de estados de almacenamiento de datos.
pub struct InodeTable {
    sb: Rc<RefCell<SuperBlock>>,
    io: Rc<RefCell<IoContext>>,
    alloc: Rc<BlockAllocator>,
    indexer: Rc<RefCell<BlockIndexer>>,
    cache: LruCache<u64, Inode, InodeBackend>,
}

impl InodeTable {
    pub fn new(
        sb: Rc<RefCell<SuperBlock>>,
        io: Rc<RefCell<IoContext>>,
        alloc: Rc<BlockAllocator>,
        indexer: Rc<RefCell<BlockIndexer>>,
        cache_size: usize,
    ) -> Self {
        let backend = InodeBackend {
            sb: Rc::clone(&sb),
            io: Rc::clone(&io),
        };
        Self {
            sb,
            io,
            alloc,
            indexer,
            cache: LruCache::new(cache_size, backend),
        }
    }

    /// Pone en cero el bitmap de validez de inodos.
    pub fn reset_inode_bitmap(&mut self) -> Result<(), FsError> {
        debug!("[InodeTable] Escribiendo bitmap de inodos.");
        let (start, cnt) = {
            let sb = self.sb.borrow();
            (sb.inode_bitmap_start_lba, sb.inode_bitmap_blocks_cnt)
        };
        let mut io = self.io.borrow_mut();
        for i in 0..cnt {
            let handle = io.acquire_block(start + i)?;
            handle.borrow_mut().fill(0);
        }
        Ok(())
    }

    /// Primer ajuste sobre el bitmap de inodos. El inodo queda inicializado
    /// en el caché (sucio) con el tipo y el padre indicados.
    pub fn allocate_inode(
        &mut self,
        file_type: FileType,
        parent: u64,
    ) -> Result<Option<u64>, FsError> {
        let (start, cnt, limit) = {
            let sb = self.sb.borrow();
            (
                sb.inode_bitmap_start_lba,
                sb.inode_bitmap_blocks_cnt,
                sb.inodes_cnt,
            )
        };

        let id = {
            let mut io = self.io.borrow_mut();
            match bitmap::find_clear_bit(&mut io, start, cnt, limit)? {
                Some(id) => {
                    bitmap::set_bit(&mut io, start, id, true)?;
                    id
                }
                None => {
                    warn!("[InodeTable] Sin inodos libres.");
                    return Ok(None);
                }
            }
        };

        self.sb.borrow_mut().free_inodes -= 1;

        let handle = self.cache.get_mut(id)?;
        let mut node = handle.borrow_mut();
        *node = Inode::new(id, parent);
        node.file_type = file_type;
        debug!("[InodeTable] Inodo libre encontrado, id: {}.", id);
        Ok(Some(id))
    }

    /// Libera un inodo y en cascada su almacenamiento: el bloque Direct o el
    /// árbol de índice completo con sus bloques de datos.
    pub fn free_inode(&mut self, id: u64) -> Result<(), FsError> {
        let (storage_type, block_lba) = {
            let handle = self.cache.get(id)?;
            let node = handle.borrow();
            (node.storage_type, node.block_lba)
        };

        match storage_type {
            StorageType::Inline => {}
            StorageType::Direct => self.alloc.free_block(block_lba)?,
            StorageType::Index => self.indexer.borrow_mut().clear(block_lba)?,
        }

        {
            let handle = self.cache.get_mut(id)?;
            *handle.borrow_mut() = Inode::new(0, 0);
        }

        let start = self.sb.borrow().inode_bitmap_start_lba;
        {
            let mut io = self.io.borrow_mut();
            bitmap::set_bit(&mut io, start, id, false)?;
        }
        self.sb.borrow_mut().free_inodes += 1;
        Ok(())
    }

    pub fn get_inode_info(&mut self, id: u64) -> Result<Inode, FsError> {
        let handle = self.cache.get(id)?;
        let node = handle.borrow().clone();
        Ok(node)
    }

    /// Lee hasta `out.len()` bytes desde `offset`. Leer más allá del tamaño
    /// devuelve 0 bytes; los huecos de un archivo indexado se leen como
    /// ceros.
    pub fn read_data(&mut self, id: u64, offset: u64, out: &mut [u8]) -> Result<usize, FsError> {
        let handle = self.cache.get(id)?;
        let node = handle.borrow();

        if offset >= node.size || out.is_empty() {
            return Ok(0);
        }
        let n = (out.len() as u64).min(node.size - offset) as usize;
        let bs = BLOCK_SIZE as u64;

        match node.storage_type {
            StorageType::Inline => {
                let off = offset as usize;
                out[..n].copy_from_slice(&node.inline_data[off..off + n]);
            }
            StorageType::Direct => {
                let block_lba = node.block_lba;
                drop(node);
                let block = self.io.borrow_mut().read_block(block_lba)?;
                let buf = block.borrow();
                let off = offset as usize;
                out[..n].copy_from_slice(&buf[off..off + n]);
            }
            StorageType::Index => {
                let root = node.block_lba;
                drop(node);
                let first = offset / bs;
                let last = (offset + n as u64 - 1) / bs;
                let lbas = self.indexer.borrow_mut().find_blocks(root, first, last)?;

                let mut in_off = (offset % bs) as usize;
                let mut pos = 0usize;
                for lba in lbas {
                    let chunk = (n - pos).min(BLOCK_SIZE - in_off);
                    if lba != 0 {
                        let block = self.io.borrow_mut().read_block(lba)?;
                        let buf = block.borrow();
                        out[pos..pos + chunk].copy_from_slice(&buf[in_off..in_off + chunk]);
                    } else {
                        // Hueco: se lee como ceros.
                        out[pos..pos + chunk].fill(0);
                    }
                    pos += chunk;
                    in_off = 0;
                    if pos == n {
                        break;
                    }
                }
            }
        }
        Ok(n)
    }

    /// Escribe `data` en `offset`, ascendiendo de estrategia de
    /// almacenamiento cuando la región vigente se agota:
    /// Inline -> Direct -> Index. Las escrituras más allá del final con
    /// índice dejan huecos (regiones dispersas).
    pub fn write_data(&mut self, id: u64, offset: u64, data: &[u8]) -> Result<(), FsError> {
        if data.is_empty() {
            return Ok(());
        }
        debug!("[InodeTable] Escribiendo {} B en inodo {} @ {}.", data.len(), id, offset);

        let handle = self.cache.get_mut(id)?;
        let mut node = handle.borrow_mut();

        let bs = BLOCK_SIZE as u64;
        let mut offset = offset;
        let mut data = data;

        // --- Estado Inline ---
        if node.storage_type == StorageType::Inline {
            if offset + data.len() as u64 <= INODE_DATA_SIZE as u64 {
                let off = offset as usize;
                node.inline_data[off..off + data.len()].copy_from_slice(data);
                node.size = node.size.max(offset + data.len() as u64);
                return Ok(());
            }

            // Ascenso a Direct: la carga inline se muda a un bloque nuevo.
            let new_lba = self
                .alloc
                .allocate_block()?
                .ok_or(FsError::OutOfSpace)?;
            {
                let block = self.io.borrow_mut().acquire_block(new_lba)?;
                let mut buf = block.borrow_mut();
                buf.fill(0);
                let old = node.size as usize;
                buf[..old].copy_from_slice(&node.inline_data[..old]);
                if offset < bs {
                    let fit = ((offset + data.len() as u64).min(bs) - offset) as usize;
                    let off = offset as usize;
                    buf[off..off + fit].copy_from_slice(&data[..fit]);
                    node.size = node.size.max(offset + fit as u64);
                    offset += fit as u64;
                    data = &data[fit..];
                }
            }
            node.inline_data.fill(0);
            node.block_lba = new_lba;
            node.storage_type = StorageType::Direct;
            if data.is_empty() {
                return Ok(());
            }
        }

        // --- Estado Direct ---
        if node.storage_type == StorageType::Direct {
            if offset + data.len() as u64 <= bs {
                let block = self.io.borrow_mut().acquire_block(node.block_lba)?;
                let mut buf = block.borrow_mut();
                let off = offset as usize;
                buf[off..off + data.len()].copy_from_slice(data);
                node.size = node.size.max(offset + data.len() as u64);
                return Ok(());
            }

            if offset < bs {
                // Prefijo que todavía cabe en el bloque directo.
                let fit = (bs - offset) as usize;
                let block = self.io.borrow_mut().acquire_block(node.block_lba)?;
                let mut buf = block.borrow_mut();
                let off = offset as usize;
                buf[off..off + fit].copy_from_slice(&data[..fit]);
                node.size = node.size.max(bs);
                offset += fit as u64;
                data = &data[fit..];
            }

            // Ascenso a Index: el bloque directo pasa a ser la clave 0.
            let root = self.indexer.borrow_mut().insert_block(0, 0, node.block_lba)?;
            node.block_lba = root;
            node.storage_type = StorageType::Index;
        }

        // --- Estado Index ---
        let first = offset / bs;
        let last = (offset + data.len() as u64 - 1) / bs;
        let mut in_off = (offset % bs) as usize;

        for idx in first..=last {
            let chunk = data.len().min(BLOCK_SIZE - in_off);
            let found = self.indexer.borrow_mut().find_block(node.block_lba, idx)?;
            let lba = match found {
                Some(lba) => lba,
                None => {
                    let lba = self
                        .alloc
                        .allocate_block()?
                        .ok_or(FsError::OutOfSpace)?;
                    {
                        let block = self.io.borrow_mut().acquire_block(lba)?;
                        block.borrow_mut().fill(0);
                    }
                    let root = self
                        .indexer
                        .borrow_mut()
                        .insert_block(node.block_lba, idx, lba)?;
                    node.block_lba = root;
                    lba
                }
            };

            {
                let block = self.io.borrow_mut().acquire_block(lba)?;
                let mut buf = block.borrow_mut();
                buf[in_off..in_off + chunk].copy_from_slice(&data[..chunk]);
            }
            node.size = node.size.max(idx * bs + (in_off + chunk) as u64);
            data = &data[chunk..];
            in_off = 0;
        }

        Ok(())
    }

    // --- PROTOCOLO DE DIRECTORIOS ---

    /// Agrega una entrada al final del directorio. El contador de enlaces
    /// del destino sube, salvo para la autorreferencia "." del arranque.
    pub fn add_diritem(&mut self, dir_id: u64, name: &str, target: u64) -> Result<(), FsError> {
        debug!("[InodeTable] Agregando entrada '{}' -> {} en dir {}.", name, target, dir_id);
        let (file_type, size) = {
            let handle = self.cache.get(dir_id)?;
            let node = handle.borrow();
            (node.file_type, node.size)
        };
        if file_type != FileType::Directory {
            return Err(FsError::NotADirectory);
        }
        if self.find_inode_by_name(dir_id, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let item = DirItem::new(target, name);
        let mut buf = [0u8; DIRITEM_SIZE];
        item.to_bytes(&mut buf);
        self.write_data(dir_id, size, &buf)?;

        if target != dir_id {
            let handle = self.cache.get_mut(target)?;
            handle.borrow_mut().link_cnt += 1;
        }
        Ok(())
    }

    /// Quita una entrada compactando por intercambio con la última. Rechaza
    /// "." y "..", y los directorios no vacíos. El inodo destino se libera
    /// cuando su contador de enlaces llega a cero.
    pub fn remove_diritem(&mut self, dir_id: u64, name: &str) -> Result<(), FsError> {
        if name == "." || name == ".." {
            return Err(FsError::NotFound);
        }

        let (entry_off, target) = match self.locate_diritem(dir_id, name)? {
            Some(found) => found,
            None => return Err(FsError::NotFound),
        };

        {
            let handle = self.cache.get(target)?;
            let node = handle.borrow();
            if node.file_type == FileType::Directory
                && node.size != 2 * DIRITEM_SIZE as u64
            {
                return Err(FsError::DirNotEmpty);
            }
        }

        let remaining = {
            let handle = self.cache.get_mut(target)?;
            let mut node = handle.borrow_mut();
            node.link_cnt = node.link_cnt.saturating_sub(1);
            node.link_cnt
        };
        if remaining == 0 {
            self.free_inode(target)?;
        }

        // Compactación: la última entrada ocupa el hueco y el tamaño baja
        // un registro.
        let dir_size = {
            let handle = self.cache.get(dir_id)?;
            let size = handle.borrow().size;
            size
        };
        let last_off = dir_size - DIRITEM_SIZE as u64;
        if entry_off != last_off {
            let mut last = [0u8; DIRITEM_SIZE];
            self.read_data(dir_id, last_off, &mut last)?;
            self.write_data(dir_id, entry_off, &last)?;
        }
        {
            let handle = self.cache.get_mut(dir_id)?;
            handle.borrow_mut().size = last_off;
        }
        Ok(())
    }

    /// Busca una entrada por nombre. Escanea en lotes; un directorio
    /// inexistente o un no-directorio responden None sin propagar nada.
    pub fn find_inode_by_name(
        &mut self,
        dir_id: u64,
        name: &str,
    ) -> Result<Option<u64>, FsError> {
        Ok(self.locate_diritem(dir_id, name)?.map(|(_, id)| id))
    }

    /// Devuelve todas las entradas vivas del directorio.
    pub fn read_dir(&mut self, dir_id: u64) -> Result<Vec<DirItem>, FsError> {
        let size = {
            let handle = self.cache.get(dir_id)?;
            let node = handle.borrow();
            if node.file_type != FileType::Directory {
                return Err(FsError::NotADirectory);
            }
            node.size
        };

        let mut items = Vec::with_capacity((size / DIRITEM_SIZE as u64) as usize);
        let mut buf = vec![0u8; SCAN_BATCH * DIRITEM_SIZE];
        let mut off = 0u64;
        while off < size {
            let n = self.read_data(dir_id, off, &mut buf)?;
            if n == 0 {
                break;
            }
            for chunk in buf[..n].chunks_exact(DIRITEM_SIZE) {
                items.push(DirItem::from_bytes(chunk));
            }
            off += n as u64;
        }
        Ok(items)
    }

    /// Escribe todo inodo sucio del caché a sus bloques.
    pub fn flush(&mut self) -> Result<(), FsError> {
        self.cache.flush_all()
    }

    /// Descarta el caché sin persistir (solo tras invalidar el disco).
    pub fn clear_cache(&mut self) {
        self.cache.discard_all();
    }

    fn locate_diritem(
        &mut self,
        dir_id: u64,
        name: &str,
    ) -> Result<Option<(u64, u64)>, FsError> {
        let size = {
            let handle = self.cache.get(dir_id)?;
            let node = handle.borrow();
            if node.file_type != FileType::Directory {
                return Ok(None);
            }
            node.size
        };

        let mut buf = vec![0u8; SCAN_BATCH * DIRITEM_SIZE];
        let mut off = 0u64;
        while off < size {
            let n = self.read_data(dir_id, off, &mut buf)?;
            if n == 0 {
                break;
            }
            for (i, chunk) in buf[..n].chunks_exact(DIRITEM_SIZE).enumerate() {
                let item = DirItem::from_bytes(chunk);
                if item.name() == name {
                    return Ok(Some((off + (i * DIRITEM_SIZE) as u64, item.inode_id)));
                }
            }
            off += n as u64;
        }
        Ok(None)
    }
}

impl Drop for InodeTable {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("[InodeTable] Falló el vaciado final: {}.", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Disk, FileDisk};
    use std::fs;
    use std::path::PathBuf;

    fn temp_disk(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vdfs_itab_{}_{}.img", name, std::process::id()))
    }

    /// Composición completa sobre un disco de 1 GB recién formateado a mano
    /// (superbloque + bitmaps), sin pasar por la fachada.
    fn setup(name: &str) -> (Rc<RefCell<SuperBlock>>, InodeTable, PathBuf) {
        let path = temp_disk(name);
        let _ = fs::remove_file(&path);
        let disk = FileDisk::open(&path, 1).unwrap();
        let sb = Rc::new(RefCell::new(SuperBlock::create(1)));
        let disk: Rc<RefCell<dyn Disk>> = Rc::new(RefCell::new(disk));
        let io = Rc::new(RefCell::new(IoContext::new(Rc::clone(&sb), disk, 256)));
        let alloc = Rc::new(BlockAllocator::new(Rc::clone(&sb), Rc::clone(&io)));
        let indexer = Rc::new(RefCell::new(BlockIndexer::new(
            Rc::clone(&io),
            Rc::clone(&alloc),
        )));
        let mut table = InodeTable::new(
            Rc::clone(&sb),
            Rc::clone(&io),
            alloc.clone(),
            indexer,
            64,
        );
        alloc.reset_bitmap().unwrap();
        table.reset_inode_bitmap().unwrap();
        (sb, table, path)
    }

    #[test]
    fn test_write_read_inline() {
        let (_sb, mut table, path) = setup("inline");
        let id = table.allocate_inode(FileType::File, 0).unwrap().unwrap();

        table.write_data(id, 0, b"hola mundo").unwrap();
        let node = table.get_inode_info(id).unwrap();
        assert_eq!(node.storage_type, StorageType::Inline);
        assert_eq!(node.size, 10);
        assert_eq!(node.block_lba, 0);

        let mut buf = [0u8; 10];
        assert_eq!(table.read_data(id, 0, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"hola mundo");

        // Lectura parcial con offset.
        let mut buf = [0u8; 5];
        assert_eq!(table.read_data(id, 5, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"mundo");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_upgrade_to_direct_preserves_inline_payload() {
        let (_sb, mut table, path) = setup("direct");
        let id = table.allocate_inode(FileType::File, 0).unwrap().unwrap();

        let head = vec![0x11u8; 300];
        table.write_data(id, 0, &head).unwrap();
        // 300 + 300 supera la zona inline pero cabe en un bloque.
        let tail = vec![0x22u8; 300];
        table.write_data(id, 300, &tail).unwrap();

        let node = table.get_inode_info(id).unwrap();
        assert_eq!(node.storage_type, StorageType::Direct);
        assert_eq!(node.size, 600);
        assert_ne!(node.block_lba, 0);
        assert!(node.inline_data.iter().all(|&b| b == 0));

        let mut buf = vec![0u8; 600];
        assert_eq!(table.read_data(id, 0, &mut buf).unwrap(), 600);
        assert!(buf[..300].iter().all(|&b| b == 0x11));
        assert!(buf[300..].iter().all(|&b| b == 0x22));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_upgrade_to_index_and_overwrite_in_place() {
        let (_sb, mut table, path) = setup("index");
        let id = table.allocate_inode(FileType::File, 0).unwrap().unwrap();

        let payload = vec![0x33u8; 2 * BLOCK_SIZE + 777];
        table.write_data(id, 0, &payload).unwrap();
        let node = table.get_inode_info(id).unwrap();
        assert_eq!(node.storage_type, StorageType::Index);
        assert_eq!(node.size, payload.len() as u64);

        // Sobrescritura en el medio, cruzando una frontera de bloque.
        let patch = vec![0x44u8; 1000];
        table.write_data(id, BLOCK_SIZE as u64 - 500, &patch).unwrap();

        let mut buf = vec![0u8; payload.len()];
        assert_eq!(table.read_data(id, 0, &mut buf).unwrap(), payload.len());
        assert!(buf[..BLOCK_SIZE - 500].iter().all(|&b| b == 0x33));
        assert!(buf[BLOCK_SIZE - 500..BLOCK_SIZE + 500].iter().all(|&b| b == 0x44));
        assert!(buf[BLOCK_SIZE + 500..].iter().all(|&b| b == 0x33));
        // El tamaño no cambia al sobrescribir adentro.
        assert_eq!(table.get_inode_info(id).unwrap().size, payload.len() as u64);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_free_inode_returns_all_blocks() {
        let (sb, mut table, path) = setup("freecascade");
        let free_before = sb.borrow().free_blocks;
        let inodes_before = sb.borrow().free_inodes;

        let id = table.allocate_inode(FileType::File, 0).unwrap().unwrap();
        let payload = vec![0x55u8; 3 * BLOCK_SIZE];
        table.write_data(id, 0, &payload).unwrap();
        assert!(sb.borrow().free_blocks < free_before);

        table.free_inode(id).unwrap();
        assert_eq!(sb.borrow().free_blocks, free_before);
        assert_eq!(sb.borrow().free_inodes, inodes_before);

        // El slot en disco queda en cero tras el vaciado.
        table.flush().unwrap();
        table.clear_cache();
        let node = table.get_inode_info(id).unwrap();
        assert_eq!(node.size, 0);
        assert_eq!(node.block_lba, 0);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_diritem_protocol() {
        let (_sb, mut table, path) = setup("diritems");
        let dir = table
            .allocate_inode(FileType::Directory, 0)
            .unwrap()
            .unwrap();
        let f1 = table.allocate_inode(FileType::File, dir).unwrap().unwrap();
        let f2 = table.allocate_inode(FileType::File, dir).unwrap().unwrap();

        table.add_diritem(dir, "uno", f1).unwrap();
        table.add_diritem(dir, "dos", f2).unwrap();
        assert!(matches!(
            table.add_diritem(dir, "uno", f2),
            Err(FsError::AlreadyExists)
        ));

        assert_eq!(table.find_inode_by_name(dir, "uno").unwrap(), Some(f1));
        assert_eq!(table.find_inode_by_name(dir, "dos").unwrap(), Some(f2));
        assert_eq!(table.find_inode_by_name(dir, "tres").unwrap(), None);
        assert_eq!(table.get_inode_info(f1).unwrap().link_cnt, 1);

        let size_with_two = table.get_inode_info(dir).unwrap().size;
        table.remove_diritem(dir, "uno").unwrap();
        assert_eq!(table.find_inode_by_name(dir, "uno").unwrap(), None);
        // La última entrada se mudó al hueco y el tamaño bajó un registro.
        assert_eq!(
            table.get_inode_info(dir).unwrap().size,
            size_with_two - DIRITEM_SIZE as u64
        );
        assert_eq!(table.find_inode_by_name(dir, "dos").unwrap(), Some(f2));

        // Los nombres "." y ".." no se pueden quitar.
        assert!(table.remove_diritem(dir, ".").is_err());
        assert!(table.remove_diritem(dir, "..").is_err());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_inode_record_roundtrip() {
        let mut node = Inode::new(42, 7);
        node.block_lba = 0x1234;
        node.link_cnt = 3;
        node.file_type = FileType::Directory;
        node.storage_type = StorageType::Index;
        node.size = 99999;
        node.inline_data[0] = 0xAB;
        node.inline_data[INODE_DATA_SIZE - 1] = 0xCD;

        let mut buf = vec![0u8; INODE_SIZE];
        node.to_bytes(&mut buf);
        let back = Inode::from_bytes(&buf);

        assert_eq!(back.id, 42);
        assert_eq!(back.parent, 7);
        assert_eq!(back.block_lba, 0x1234);
        assert_eq!(back.link_cnt, 3);
        assert_eq!(back.file_type, FileType::Directory);
        assert_eq!(back.storage_type, StorageType::Index);
        assert_eq!(back.size, 99999);
        assert_eq!(back.inline_data[..], node.inline_data[..]);
    }

    #[test]
    fn test_zeroed_slot_decodes_as_empty_inode() {
        let buf = vec![0u8; INODE_SIZE];
        let node = Inode::from_bytes(&buf);
        assert_eq!(node.id, 0);
        assert_eq!(node.size, 0);
        assert_eq!(node.file_type, FileType::File);
        assert_eq!(node.storage_type, StorageType::Inline);
    }

    #[test]
    fn test_diritem_roundtrip_and_truncation() {
        let item = DirItem::new(5, "hola.txt");
        let mut buf = vec![0u8; DIRITEM_SIZE];
        item.to_bytes(&mut buf);
        let back = DirItem::from_bytes(&buf);
        assert_eq!(back.inode_id, 5);
        assert_eq!(back.name(), "hola.txt");

        // Un nombre más largo que el máximo se trunca dejando el '\0'.
        let long = "x".repeat(200);
        let item = DirItem::new(1, &long);
        assert_eq!(item.name().len(), FILENAME_SIZE - 1);
    }
}
