use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

use crate::types::BLOCK_SIZE;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),
    #[error("LBA 0x{0:X} fuera del rango del disco")]
    BadLba(u64),
}

/// Disco virtual: almacenamiento de bytes de tamaño fijo con E/S a
/// granularidad de bloque. Las lecturas más allá del final devuelven ceros.
pub trait Disk {
    fn disk_size_gb(&self) -> u32;
    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), DeviceError>;
    fn write_block(&mut self, lba: u64, data: &[u8]) -> Result<(), DeviceError>;
    /// Reinicia el almacenamiento a ceros con la capacidad exacta.
    fn clear(&mut self) -> Result<(), DeviceError>;
    fn flush(&mut self) -> Result<(), DeviceError>;

    fn total_bytes(&self) -> u64 {
        (self.disk_size_gb() as u64) << 30
    }

    fn total_blocks(&self) -> u64 {
        self.total_bytes() / BLOCK_SIZE as u64
    }
}

/// Disco virtual respaldado por un archivo normal. El archivo se dimensiona
/// a la capacidad esperada al abrirlo (sparse en la mayoría de los sistemas),
/// así que nunca se lee un bloque inexistente.
pub struct FileDisk {
    file: File,
    disk_size_gb: u32,
    path: PathBuf,
}

impl FileDisk {
    pub fn open<P: AsRef<Path>>(path: P, disk_size_gb: u32) -> Result<Self, DeviceError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut disk = Self {
            file,
            disk_size_gb,
            path,
        };

        let current = disk.file.metadata()?.len();
        let expected = disk.total_bytes();
        if current != expected {
            if current != 0 {
                warn!(
                    "[VDisk] El tamaño del disco no coincide. Actual: {} B, esperado: {} B ({} GB).",
                    current, expected, disk_size_gb
                );
            } else {
                info!("[VDisk] Inicializando disco virtual nuevo en {:?}.", disk.path);
            }
            disk.clear()?;
        } else {
            info!("[VDisk] Disco virtual existente cargado desde {:?}.", disk.path);
        }

        Ok(disk)
    }

    fn block_offset(&self, lba: u64) -> Result<u64, DeviceError> {
        if lba >= self.total_blocks() {
            return Err(DeviceError::BadLba(lba));
        }
        Ok(lba * BLOCK_SIZE as u64)
    }
}

impl Disk for FileDisk {
    fn disk_size_gb(&self) -> u32 {
        self.disk_size_gb
    }

    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        let offset = self.block_offset(lba)?;
        self.file.seek(SeekFrom::Start(offset))?;

        // El archivo está pre-dimensionado, pero una lectura corta se rellena
        // con ceros igual que un disco real sin escribir.
        let mut read = 0;
        while read < buf.len() {
            match self.file.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf[read..].fill(0);
        Ok(())
    }

    fn write_block(&mut self, lba: u64, data: &[u8]) -> Result<(), DeviceError> {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        let offset = self.block_offset(lba)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DeviceError> {
        info!("[VDisk] Limpiando disco virtual.");
        let expected = self.total_bytes();
        self.file.set_len(0)?;
        self.file.set_len(expected)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.file.sync_data()?;
        Ok(())
    }
}
