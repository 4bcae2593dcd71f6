use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;

use log::trace;

use crate::types::FsError;

/// Respaldo de un caché: sabe materializar un valor ausente y persistir
/// uno sucio.
pub trait CacheBackend<K, V> {
    fn load(&mut self, key: K) -> Result<V, FsError>;
    fn save(&mut self, key: K, val: &V) -> Result<(), FsError>;
}

/// Handle compartido sobre una entrada del caché. Quien lo obtuvo con `get`
/// solo debe usar `borrow()`; quien lo obtuvo con `get_mut` puede mutar con
/// `borrow_mut()` (la entrada ya quedó marcada sucia).
pub type Handle<V> = Rc<RefCell<V>>;

const NIL: usize = usize::MAX;

struct Slot<K, V> {
    key: K,
    val: Handle<V>,
    dirty: bool,
    prev: usize,
    next: usize,
}

/// Caché LRU genérico con write-back.
///
/// La lista de recencia es una lista doblemente enlazada intrusiva sobre un
/// slab de slots (índices en lugar de punteros). `head` es el más reciente.
/// Al desalojar se recorre desde el menos reciente y se salta toda entrada
/// con handles vivos afuera (`Rc::strong_count > 1`); si ninguna es
/// desalojable el caché excede su capacidad temporalmente y lo reintenta en
/// el siguiente acceso.
pub struct LruCache<K, V, B>
where
    K: Copy + Eq + Hash,
    B: CacheBackend<K, V>,
{
    capacity: usize,
    backend: B,
    map: HashMap<K, usize>,
    slots: Vec<Slot<K, V>>,
    free_slots: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<K, V, B> LruCache<K, V, B>
where
    K: Copy + Eq + Hash,
    B: CacheBackend<K, V>,
{
    pub fn new(capacity: usize, backend: B) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            backend,
            map: HashMap::new(),
            slots: Vec::new(),
            free_slots: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle de lectura compartida. Promueve la entrada a más reciente.
    pub fn get(&mut self, key: K) -> Result<Handle<V>, FsError> {
        let idx = self.access(key)?;
        Ok(Rc::clone(&self.slots[idx].val))
    }

    /// Handle de escritura exclusiva: marca la entrada sucia al obtenerla.
    pub fn get_mut(&mut self, key: K) -> Result<Handle<V>, FsError> {
        let idx = self.access(key)?;
        self.slots[idx].dirty = true;
        Ok(Rc::clone(&self.slots[idx].val))
    }

    /// Persiste toda entrada sucia y limpia las banderas.
    pub fn flush_all(&mut self) -> Result<(), FsError> {
        let mut idx = self.head;
        while idx != NIL {
            if self.slots[idx].dirty {
                let key = self.slots[idx].key;
                let val = Rc::clone(&self.slots[idx].val);
                self.backend.save(key, &val.borrow())?;
                self.slots[idx].dirty = false;
            }
            idx = self.slots[idx].next;
        }
        Ok(())
    }

    /// Persiste y descarta todo el estado.
    pub fn clear(&mut self) -> Result<(), FsError> {
        self.flush_all()?;
        self.discard_all();
        Ok(())
    }

    /// Descarta todo el estado sin persistir nada. Solo tiene sentido cuando
    /// el respaldo fue invalidado (p. ej. tras limpiar el disco).
    pub fn discard_all(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free_slots.clear();
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }

    /// Descarta una entrada sin persistirla.
    pub fn remove(&mut self, key: K) {
        if let Some(idx) = self.map.remove(&key) {
            self.unlink(idx);
            self.release_slot(idx);
        }
    }

    fn access(&mut self, key: K) -> Result<usize, FsError> {
        if let Some(&idx) = self.map.get(&key) {
            self.unlink(idx);
            self.push_front(idx);
            return Ok(idx);
        }

        if self.len >= self.capacity {
            self.evict()?;
        }

        let val = self.backend.load(key)?;
        let idx = self.take_slot(Slot {
            key,
            val: Rc::new(RefCell::new(val)),
            dirty: false,
            prev: NIL,
            next: NIL,
        });
        self.push_front(idx);
        self.map.insert(key, idx);
        self.len += 1;
        Ok(idx)
    }

    /// Desaloja la entrada menos reciente sin handles vivos afuera.
    fn evict(&mut self) -> Result<(), FsError> {
        let mut idx = self.tail;
        while idx != NIL {
            if Rc::strong_count(&self.slots[idx].val) == 1 {
                let key = self.slots[idx].key;
                if self.slots[idx].dirty {
                    let val = Rc::clone(&self.slots[idx].val);
                    self.backend.save(key, &val.borrow())?;
                }
                self.map.remove(&key);
                self.unlink(idx);
                self.release_slot(idx);
                return Ok(());
            }
            idx = self.slots[idx].prev;
        }
        trace!("[LruCache] Sin candidato de desalojo, el caché excede su capacidad.");
        Ok(())
    }

    // --- lista enlazada intrusiva ---

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = NIL;
        self.slots[idx].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else if self.head == idx {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else if self.tail == idx {
            self.tail = prev;
        }
        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
    }

    fn take_slot(&mut self, slot: Slot<K, V>) -> usize {
        if let Some(idx) = self.free_slots.pop() {
            self.slots[idx] = slot;
            idx
        } else {
            self.slots.push(slot);
            self.slots.len() - 1
        }
    }

    fn release_slot(&mut self, idx: usize) {
        self.free_slots.push(idx);
        self.len -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Respaldo en memoria que cuenta cargas y guardados.
    struct MemBackend {
        store: HashMap<u64, u64>,
        loads: usize,
        saves: usize,
    }

    impl MemBackend {
        fn new() -> Self {
            Self {
                store: HashMap::new(),
                loads: 0,
                saves: 0,
            }
        }
    }

    impl CacheBackend<u64, u64> for MemBackend {
        fn load(&mut self, key: u64) -> Result<u64, FsError> {
            self.loads += 1;
            Ok(*self.store.get(&key).unwrap_or(&0))
        }

        fn save(&mut self, key: u64, val: &u64) -> Result<(), FsError> {
            self.saves += 1;
            self.store.insert(key, *val);
            Ok(())
        }
    }

    #[test]
    fn test_hit_does_not_reload() {
        let mut cache = LruCache::new(4, MemBackend::new());
        let _ = cache.get(1).unwrap();
        let _ = cache.get(1).unwrap();
        let _ = cache.get(1).unwrap();
        assert_eq!(cache.backend.loads, 1);
    }

    #[test]
    fn test_eviction_writes_back_dirty() {
        let mut cache = LruCache::new(2, MemBackend::new());
        {
            let h = cache.get_mut(1).unwrap();
            *h.borrow_mut() = 11;
        }
        let _ = cache.get(2).unwrap();
        // La clave 1 es la menos reciente y está sucia: debe persistirse.
        let _ = cache.get(3).unwrap();
        assert_eq!(cache.backend.store.get(&1), Some(&11));
        assert_eq!(cache.len(), 2);

        // Releída desde el respaldo con el valor persistido.
        let h = cache.get(1).unwrap();
        assert_eq!(*h.borrow(), 11);
    }

    #[test]
    fn test_clean_eviction_skips_save() {
        let mut cache = LruCache::new(2, MemBackend::new());
        let _ = cache.get(1).unwrap();
        let _ = cache.get(2).unwrap();
        let _ = cache.get(3).unwrap();
        assert_eq!(cache.backend.saves, 0);
    }

    #[test]
    fn test_promotion_changes_victim() {
        let mut cache = LruCache::new(2, MemBackend::new());
        let _ = cache.get(1).unwrap();
        let _ = cache.get(2).unwrap();
        // Tocar 1 deja a 2 como víctima.
        let _ = cache.get(1).unwrap();
        let _ = cache.get(3).unwrap();
        assert!(cache.map.contains_key(&1));
        assert!(!cache.map.contains_key(&2));
    }

    #[test]
    fn test_held_handle_is_not_evicted() {
        let mut cache = LruCache::new(2, MemBackend::new());
        let pinned1 = cache.get(1).unwrap();
        let pinned2 = cache.get(2).unwrap();
        // Ambas entradas tienen handles vivos: no hay víctima y el caché
        // excede su capacidad temporalmente.
        let _ = cache.get(3).unwrap();
        assert!(cache.map.contains_key(&1));
        assert!(cache.map.contains_key(&2));
        assert_eq!(cache.len(), 3);

        drop(pinned1);
        drop(pinned2);
        // Liberados los handles, el siguiente acceso sí desaloja al menos
        // recientemente usado (la clave 1).
        let _ = cache.get(4).unwrap();
        assert!(!cache.map.contains_key(&1));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_flush_all_then_clear() {
        let mut cache = LruCache::new(4, MemBackend::new());
        for k in 0..3 {
            let h = cache.get_mut(k).unwrap();
            *h.borrow_mut() = k * 10;
        }
        cache.flush_all().unwrap();
        assert_eq!(cache.backend.saves, 3);
        // Ya no están sucias: un segundo flush no guarda nada.
        cache.flush_all().unwrap();
        assert_eq!(cache.backend.saves, 3);

        cache.clear().unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.backend.store.get(&2), Some(&20));
    }

    #[test]
    fn test_remove_discards_without_save() {
        let mut cache = LruCache::new(4, MemBackend::new());
        {
            let h = cache.get_mut(9).unwrap();
            *h.borrow_mut() = 99;
        }
        cache.remove(9);
        assert_eq!(cache.backend.saves, 0);
        assert!(cache.is_empty());
    }
}
