use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceError;

// --- CONSTANTES DE DISEÑO ---

/// Tamaño de bloque físico. Todo el formato en disco se deriva de este valor.
pub const BLOCK_SIZE: usize = 16 << 10;

pub const MAGIC: u64 = 0xEA6191;
pub const VERSION: u64 = 7;

/// Tamaño fijo de un inodo serializado (caben 32 por bloque).
pub const INODE_SIZE: usize = 512;
/// Bytes de carga útil inline dentro del inodo (512 menos la cabecera de 38).
pub const INODE_DATA_SIZE: usize = INODE_SIZE - 38;

/// Tamaño fijo de una entrada de directorio.
pub const DIRITEM_SIZE: usize = 64;
/// Longitud máxima del nombre, incluyendo el '\0' final.
pub const FILENAME_SIZE: usize = 54;

/// Cabecera de un nodo del árbol B+: is_leaf + key_cnt + next_leaf.
pub const BTREE_NODE_HEADER: usize = 24;
/// Fan-out máximo: un nodo ocupa exactamente un bloque.
pub const BTREE_M: usize = (BLOCK_SIZE - BTREE_NODE_HEADER) / 16;

/// Un bloque en memoria.
pub type Buffer = Vec<u8>;

// --- ERRORES ---

#[derive(Error, Debug)]
pub enum FsError {
    #[error("sin bloques libres en el disco")]
    OutOfSpace,
    #[error("sin inodos libres")]
    OutOfInodes,
    #[error("ruta o entrada no encontrada")]
    NotFound,
    #[error("la entrada ya existe")]
    AlreadyExists,
    #[error("no es un directorio")]
    NotADirectory,
    #[error("no es un archivo")]
    NotAFile,
    #[error("el directorio no está vacío")]
    DirNotEmpty,
    #[error("descriptor de archivo inválido")]
    BadFd,
    #[error("superbloque corrupto o de otra versión")]
    Corruption,
    #[error("error del dispositivo: {0}")]
    Device(#[from] DeviceError),
    #[error("error de serialización: {0}")]
    Encoding(#[from] bincode::Error),
}

// --- SUPERBLOQUE ---

/// Superbloque: un bloque en LBA 0 con toda la geometría del sistema.
/// Se serializa con bincode (enteros de ancho fijo, little-endian) y se
/// rellena con ceros hasta completar el bloque.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: u64,
    pub version: u64,

    pub disk_size_gb: u32,
    pub block_size: u32,
    pub total_blocks: u64,
    pub bits_per_block: u64,

    pub bitmap_start_lba: u64,
    pub bitmap_blocks_cnt: u64,

    pub inode_size: u32,
    pub inodes_per_block: u32,
    pub inodes_cnt: u64,
    pub free_inodes: u64,
    pub inode_bitmap_start_lba: u64,
    pub inode_bitmap_blocks_cnt: u64,
    pub inode_block_start_lba: u64,
    pub inode_blocks_cnt: u64,
    pub inline_data_size: u32,

    /// Superbloque + bitmap + bitmap de inodos + tabla de inodos.
    pub basic_blocks_cnt: u64,

    pub diritem_size: u32,
    pub filename_size: u32,

    pub root_inode_id: u64,
    pub free_blocks: u64,

    pub btree_m: u64,
}

impl SuperBlock {
    /// Deriva la geometría completa a partir del tamaño del disco.
    pub fn create(disk_size_gb: u32) -> Self {
        let block_size = BLOCK_SIZE as u64;
        let total_blocks = ((disk_size_gb as u64) << 30) / block_size;
        let bits_per_block = block_size * 8;

        let bitmap_start_lba = 1;
        let bitmap_blocks_cnt = (total_blocks + bits_per_block - 1) / bits_per_block;

        let inodes_per_block = block_size / INODE_SIZE as u64;
        // Proporción fija: 512 bloques de inodos por GiB de disco.
        let inode_blocks_cnt = (((1u64 << 30) / block_size) >> 7) * disk_size_gb as u64;
        let inodes_cnt = inodes_per_block * inode_blocks_cnt;

        let inode_bitmap_start_lba = bitmap_start_lba + bitmap_blocks_cnt;
        let inode_bitmap_blocks_cnt = (inodes_cnt + bits_per_block - 1) / bits_per_block;
        let inode_block_start_lba = inode_bitmap_start_lba + inode_bitmap_blocks_cnt;

        let basic_blocks_cnt =
            1 + bitmap_blocks_cnt + inode_bitmap_blocks_cnt + inode_blocks_cnt;

        Self {
            magic: MAGIC,
            version: VERSION,
            disk_size_gb,
            block_size: block_size as u32,
            total_blocks,
            bits_per_block,
            bitmap_start_lba,
            bitmap_blocks_cnt,
            inode_size: INODE_SIZE as u32,
            inodes_per_block: inodes_per_block as u32,
            inodes_cnt,
            free_inodes: inodes_cnt,
            inode_bitmap_start_lba,
            inode_bitmap_blocks_cnt,
            inode_block_start_lba,
            inode_blocks_cnt,
            inline_data_size: INODE_DATA_SIZE as u32,
            basic_blocks_cnt,
            diritem_size: DIRITEM_SIZE as u32,
            filename_size: FILENAME_SIZE as u32,
            root_inode_id: 0,
            free_blocks: total_blocks - basic_blocks_cnt,
            btree_m: BTREE_M as u64,
        }
    }

    pub fn valid(&self) -> bool {
        self.magic == MAGIC && self.version == VERSION
    }

    /// Serializa el superbloque dentro de un buffer de un bloque.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), FsError> {
        let bytes = bincode::serialize(self)?;
        buf.fill(0);
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    /// Deserializa desde un bloque crudo. Un bloque ilegible produce un
    /// superbloque con magic 0, que `valid()` rechaza.
    pub fn decode(buf: &[u8]) -> Self {
        bincode::deserialize(buf).unwrap_or_default()
    }
}
