//! Núcleo de VDFS: un sistema de archivos persistente con estructura de
//! bloques sobre un disco virtual respaldado por un archivo.
//!
//! Capas, de abajo hacia arriba: disco virtual, caché LRU de bloques con
//! write-back, contexto de E/S (custodia del superbloque), asignador de
//! bloques por bitmap, árbol B+ de indexado, tabla de inodos con tres
//! estrategias de almacenamiento y la fachada con rutas y descriptores.

pub mod bitmap;
pub mod btree;
pub mod cache;
pub mod device;
pub mod fs;
pub mod inode;
pub mod io;
pub mod types;

pub use device::{DeviceError, Disk, FileDisk};
pub use fs::{DirEntryInfo, DiskInfo, FileSystem};
pub use inode::{DirItem, FileType, Inode, StorageType};
pub use types::{
    FsError, SuperBlock, BLOCK_SIZE, DIRITEM_SIZE, FILENAME_SIZE, INODE_DATA_SIZE, INODE_SIZE,
    MAGIC, VERSION,
};
