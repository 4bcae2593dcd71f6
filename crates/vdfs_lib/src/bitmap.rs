use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};

use crate::io::IoContext;
use crate::types::{FsError, SuperBlock, BLOCK_SIZE};

/// Bits por bloque de bitmap.
const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;

// Disciplina de bits: 1 = ocupado, 0 = libre; dentro de un byte el bit 7
// (MSB) es el recurso de índice menor.

/// Busca el primer bit en 0 en una región de bitmap de `blocks_cnt` bloques
/// a partir de `start_lba`. Devuelve el índice global del bit, acotado a
/// `limit` (los bits sobrantes del último bloque no son recursos válidos).
pub(crate) fn find_clear_bit(
    io: &mut IoContext,
    start_lba: u64,
    blocks_cnt: u64,
    limit: u64,
) -> Result<Option<u64>, FsError> {
    for blk_idx in 0..blocks_cnt {
        let handle = io.read_block(start_lba + blk_idx)?;
        let buf = handle.borrow();
        for (byte_idx, &byte) in buf.iter().enumerate() {
            if byte == 0xFF {
                continue;
            }
            // Número de unos desde el MSB = posición del primer cero.
            let bit_idx = byte.leading_ones() as u64;
            let global = blk_idx * BITS_PER_BLOCK + byte_idx as u64 * 8 + bit_idx;
            if global >= limit {
                return Ok(None);
            }
            return Ok(Some(global));
        }
    }
    Ok(None)
}

/// Enciende o apaga un bit de la región de bitmap que inicia en `start_lba`.
pub(crate) fn set_bit(
    io: &mut IoContext,
    start_lba: u64,
    bit: u64,
    on: bool,
) -> Result<(), FsError> {
    let lba = start_lba + bit / BITS_PER_BLOCK;
    let byte_idx = ((bit % BITS_PER_BLOCK) / 8) as usize;
    let mask = 1u8 << (7 - (bit % 8));

    let handle = io.acquire_block(lba)?;
    let mut buf = handle.borrow_mut();
    if on {
        buf[byte_idx] |= mask;
    } else {
        buf[byte_idx] &= !mask;
    }
    Ok(())
}

/// Consulta un bit (solo lo usan las verificaciones).
#[cfg(test)]
pub(crate) fn get_bit(io: &mut IoContext, start_lba: u64, bit: u64) -> Result<bool, FsError> {
    let lba = start_lba + bit / BITS_PER_BLOCK;
    let byte_idx = ((bit % BITS_PER_BLOCK) / 8) as usize;
    let mask = 1u8 << (7 - (bit % 8));
    let handle = io.read_block(lba)?;
    let set = handle.borrow()[byte_idx] & mask != 0;
    Ok(set)
}

/// Asignador de bloques de datos sobre el bitmap residente en disco.
pub struct BlockAllocator {
    sb: Rc<RefCell<SuperBlock>>,
    io: Rc<RefCell<IoContext>>,
}

impl BlockAllocator {
    pub fn new(sb: Rc<RefCell<SuperBlock>>, io: Rc<RefCell<IoContext>>) -> Self {
        Self { sb, io }
    }

    /// Escribe el bitmap inicial: un prefijo de unos que cubre exactamente la
    /// región básica (superbloque, bitmaps y tabla de inodos), el resto en
    /// cero. Tres pasadas: bloques todo-unos, el bloque parcial y bloques
    /// todo-ceros.
    pub fn reset_bitmap(&self) -> Result<(), FsError> {
        debug!("[BlockAllocator] Escribiendo bitmap inicial.");
        let (start_lba, blocks_cnt, basic) = {
            let sb = self.sb.borrow();
            (sb.bitmap_start_lba, sb.bitmap_blocks_cnt, sb.basic_blocks_cnt)
        };
        let mut io = self.io.borrow_mut();

        let full_blocks = basic / BITS_PER_BLOCK;
        let remaining_bits = basic % BITS_PER_BLOCK;
        let remaining_bytes = (remaining_bits / 8) as usize;
        let tail_bits = remaining_bits % 8;

        for i in 0..full_blocks {
            let handle = io.acquire_block(start_lba + i)?;
            handle.borrow_mut().fill(0xFF);
        }

        if full_blocks < blocks_cnt {
            let handle = io.acquire_block(start_lba + full_blocks)?;
            let mut buf = handle.borrow_mut();
            buf.fill(0);
            buf[..remaining_bytes].fill(0xFF);
            if tail_bits != 0 {
                buf[remaining_bytes] = 0xFFu8 << (8 - tail_bits);
            }
        }

        for i in (full_blocks + 1)..blocks_cnt {
            let handle = io.acquire_block(start_lba + i)?;
            handle.borrow_mut().fill(0);
        }

        debug!("[BlockAllocator] Bitmap inicial completo ({} bloques básicos).", basic);
        Ok(())
    }

    /// Primer ajuste sobre el bitmap. Devuelve `None` si no hay bloque libre.
    pub fn allocate_block(&self) -> Result<Option<u64>, FsError> {
        let (start_lba, blocks_cnt, total_blocks) = {
            let sb = self.sb.borrow();
            (sb.bitmap_start_lba, sb.bitmap_blocks_cnt, sb.total_blocks)
        };

        let mut io = self.io.borrow_mut();
        let lba = match find_clear_bit(&mut io, start_lba, blocks_cnt, total_blocks)? {
            Some(bit) => bit,
            None => {
                warn!("[BlockAllocator] Sin bloques libres.");
                return Ok(None);
            }
        };

        set_bit(&mut io, start_lba, lba, true)?;
        drop(io);

        self.sb.borrow_mut().free_blocks -= 1;
        debug!("[BlockAllocator] Bloque libre encontrado, LBA: 0x{:X}.", lba);
        Ok(Some(lba))
    }

    /// Libera un bloque. El que llama garantiza que estaba asignado.
    pub fn free_block(&self, lba: u64) -> Result<(), FsError> {
        let start_lba = self.sb.borrow().bitmap_start_lba;
        {
            let mut io = self.io.borrow_mut();
            set_bit(&mut io, start_lba, lba, false)?;
        }
        self.sb.borrow_mut().free_blocks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDisk;
    use std::fs;
    use std::path::PathBuf;

    fn temp_disk(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vdfs_bmp_{}_{}.img", name, std::process::id()))
    }

    fn setup(name: &str) -> (Rc<RefCell<SuperBlock>>, Rc<RefCell<IoContext>>, BlockAllocator, PathBuf) {
        let path = temp_disk(name);
        let _ = fs::remove_file(&path);
        let disk = FileDisk::open(&path, 1).unwrap();
        let sb = Rc::new(RefCell::new(SuperBlock::create(1)));
        let disk: Rc<RefCell<dyn crate::device::Disk>> = Rc::new(RefCell::new(disk));
        let io = Rc::new(RefCell::new(IoContext::new(Rc::clone(&sb), disk, 64)));
        let alloc = BlockAllocator::new(Rc::clone(&sb), Rc::clone(&io));
        alloc.reset_bitmap().unwrap();
        (sb, io, alloc, path)
    }

    #[test]
    fn test_reset_marks_basic_region() {
        let (sb, io, _alloc, path) = setup("reset");
        let (start, basic, total) = {
            let sb = sb.borrow();
            (sb.bitmap_start_lba, sb.basic_blocks_cnt, sb.total_blocks)
        };
        let mut io = io.borrow_mut();
        for bit in 0..basic {
            assert!(get_bit(&mut io, start, bit).unwrap(), "bit {} debería estar en 1", bit);
        }
        for bit in basic..(basic + 64).min(total) {
            assert!(!get_bit(&mut io, start, bit).unwrap());
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_first_fit_allocates_after_basic() {
        let (sb, _io, alloc, path) = setup("firstfit");
        let basic = sb.borrow().basic_blocks_cnt;
        let free_before = sb.borrow().free_blocks;

        let a = alloc.allocate_block().unwrap().unwrap();
        let b = alloc.allocate_block().unwrap().unwrap();
        assert_eq!(a, basic);
        assert_eq!(b, basic + 1);
        assert_eq!(sb.borrow().free_blocks, free_before - 2);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_free_then_reuse() {
        let (sb, _io, alloc, path) = setup("reuse");
        let a = alloc.allocate_block().unwrap().unwrap();
        let _b = alloc.allocate_block().unwrap().unwrap();
        let free_after = sb.borrow().free_blocks;

        alloc.free_block(a).unwrap();
        assert_eq!(sb.borrow().free_blocks, free_after + 1);

        // Primer ajuste: el hueco se reutiliza antes de avanzar.
        let c = alloc.allocate_block().unwrap().unwrap();
        assert_eq!(c, a);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_lba_zero_never_allocated() {
        let (_sb, io, _alloc, path) = setup("lba0");
        let mut io = io.borrow_mut();
        // El bit 0 queda reservado por la región básica.
        assert!(get_bit(&mut io, 1, 0).unwrap());
        let _ = fs::remove_file(&path);
    }
}
