use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::bitmap::BlockAllocator;
use crate::io::IoContext;
use crate::types::{FsError, BLOCK_SIZE, BTREE_NODE_HEADER};

/// Dónde viven los nodos del árbol. En la composición real delega en el
/// contexto de E/S y el asignador de bloques; en pruebas, en memoria.
pub trait TreeStorage {
    fn node_size(&self) -> usize;
    fn read_node(&mut self, id: u64, buf: &mut [u8]) -> Result<(), FsError>;
    fn write_node(&mut self, id: u64, buf: &[u8]) -> Result<(), FsError>;
    fn allocate_node(&mut self) -> Result<Option<u64>, FsError>;
    fn free_node(&mut self, id: u64) -> Result<(), FsError>;
    /// Libera el recurso apuntado por un valor de hoja (el árbol no
    /// interpreta el espacio de valores, solo avisa al dueño).
    fn free_val(&mut self, val: u64) -> Result<(), FsError>;
}

/// Nodo del árbol: ocupa exactamente un bloque de almacenamiento.
/// Layout little-endian: is_leaf u64, key_cnt u64, next_leaf u64,
/// keys[M] u64, vals[M] u64. Un nodo está lleno con M-1 claves.
struct TreeNode {
    is_leaf: bool,
    key_cnt: usize,
    next: u64,
    keys: Vec<u64>,
    vals: Vec<u64>,
}

impl TreeNode {
    fn new(m: usize, is_leaf: bool) -> Self {
        Self {
            is_leaf,
            key_cnt: 0,
            next: 0,
            keys: vec![0; m],
            vals: vec![0; m],
        }
    }

    fn from_bytes(m: usize, buf: &[u8]) -> Self {
        let mut node = Self::new(m, false);
        node.is_leaf = read_u64(buf, 0) != 0;
        node.key_cnt = read_u64(buf, 8) as usize;
        node.next = read_u64(buf, 16);
        for i in 0..m {
            node.keys[i] = read_u64(buf, BTREE_NODE_HEADER + i * 8);
            node.vals[i] = read_u64(buf, BTREE_NODE_HEADER + (m + i) * 8);
        }
        node
    }

    fn to_bytes(&self, buf: &mut [u8]) {
        buf.fill(0);
        write_u64(buf, 0, self.is_leaf as u64);
        write_u64(buf, 8, self.key_cnt as u64);
        write_u64(buf, 16, self.next);
        let m = self.keys.len();
        for i in 0..m {
            write_u64(buf, BTREE_NODE_HEADER + i * 8, self.keys[i]);
            write_u64(buf, BTREE_NODE_HEADER + (m + i) * 8, self.vals[i]);
        }
    }

    /// Primer índice con clave estrictamente mayor.
    fn upper_bound(&self, key: u64) -> usize {
        self.keys[..self.key_cnt].partition_point(|&k| k <= key)
    }

    /// Primer índice con clave mayor o igual.
    fn lower_bound(&self, key: u64) -> usize {
        self.keys[..self.key_cnt].partition_point(|&k| k < key)
    }
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Árbol B+ persistente: claves u64 (índice lógico de bloque) a valores u64
/// (LBA físico). La raíz 0 representa el árbol vacío; las hojas forman una
/// lista enlazada ordenada vía `next`.
pub struct BPlusTree<S: TreeStorage> {
    storage: S,
    m: usize,
}

impl<S: TreeStorage> BPlusTree<S> {
    pub fn new(storage: S) -> Self {
        let m = (storage.node_size() - BTREE_NODE_HEADER) / 16;
        assert!(m >= 3, "el tamaño de nodo no alcanza para un árbol B+");
        Self { storage, m }
    }

    #[cfg(test)]
    fn fanout(&self) -> usize {
        self.m
    }

    fn load(&mut self, id: u64) -> Result<TreeNode, FsError> {
        let mut buf = vec![0u8; self.storage.node_size()];
        self.storage.read_node(id, &mut buf)?;
        Ok(TreeNode::from_bytes(self.m, &buf))
    }

    fn store(&mut self, id: u64, node: &TreeNode) -> Result<(), FsError> {
        let mut buf = vec![0u8; self.storage.node_size()];
        node.to_bytes(&mut buf);
        self.storage.write_node(id, &buf)
    }

    /// Inserta un par y devuelve la raíz (nueva si el árbol creció o estaba
    /// vacío). Insertar una clave ya presente es un error del que llama.
    pub fn insert(&mut self, mut root: u64, key: u64, val: u64) -> Result<u64, FsError> {
        if root == 0 {
            let id = self
                .storage
                .allocate_node()?
                .ok_or(FsError::OutOfSpace)?;
            let mut node = TreeNode::new(self.m, true);
            node.key_cnt = 1;
            node.keys[0] = key;
            node.vals[0] = val;
            self.store(id, &node)?;
            return Ok(id);
        }

        let root_node = self.load(root)?;
        if root_node.key_cnt == self.m - 1 {
            // Raíz llena: nueva raíz interna con la vieja como hijo 0.
            let new_root_id = self
                .storage
                .allocate_node()?
                .ok_or(FsError::OutOfSpace)?;
            let mut new_root = TreeNode::new(self.m, false);
            new_root.vals[0] = root;
            self.store(new_root_id, &new_root)?;
            self.split_node(new_root_id, 0)?;
            root = new_root_id;
        }

        self.node_insert(root, key, val)?;
        Ok(root)
    }

    pub fn find(&mut self, root: u64, key: u64) -> Result<Option<u64>, FsError> {
        if root == 0 {
            return Ok(None);
        }
        let mut node = self.load(root)?;
        while !node.is_leaf {
            let idx = node.upper_bound(key);
            node = self.load(node.vals[idx])?;
        }
        let idx = node.lower_bound(key);
        if idx < node.key_cnt && node.keys[idx] == key {
            Ok(Some(node.vals[idx]))
        } else {
            Ok(None)
        }
    }

    /// Valores para el rango cerrado [from, to]: desciende una vez a la hoja
    /// de `from` y recorre la cadena de hojas. Las claves ausentes quedan en
    /// 0 (huecos).
    pub fn find_range(&mut self, root: u64, from: u64, to: u64) -> Result<Vec<u64>, FsError> {
        let mut out = vec![0u64; (to - from + 1) as usize];
        if root == 0 {
            return Ok(out);
        }
        let mut node = self.load(root)?;
        while !node.is_leaf {
            let idx = node.upper_bound(from);
            node = self.load(node.vals[idx])?;
        }
        loop {
            for i in 0..node.key_cnt {
                let k = node.keys[i];
                if k > to {
                    return Ok(out);
                }
                if k >= from {
                    out[(k - from) as usize] = node.vals[i];
                }
            }
            if node.next == 0 {
                return Ok(out);
            }
            node = self.load(node.next)?;
        }
    }

    /// Libera todo el árbol en post-orden. Para las hojas avisa además al
    /// almacenamiento por cada valor guardado.
    pub fn clear(&mut self, id: u64) -> Result<(), FsError> {
        if id == 0 {
            return Ok(());
        }
        let node = self.load(id)?;
        if node.is_leaf {
            for i in 0..node.key_cnt {
                self.storage.free_val(node.vals[i])?;
            }
        } else {
            for i in 0..=node.key_cnt {
                self.clear(node.vals[i])?;
            }
        }
        self.storage.free_node(id)
    }

    /// Divide al hijo `child_idx` de `parent_id`, que está lleno. El bloque
    /// nuevo se asigna antes de tocar nada: si no hay espacio, el árbol
    /// queda intacto.
    fn split_node(&mut self, parent_id: u64, child_idx: usize) -> Result<(), FsError> {
        let new_id = self
            .storage
            .allocate_node()?
            .ok_or(FsError::OutOfSpace)?;

        let mut parent = self.load(parent_id)?;
        let child_id = parent.vals[child_idx];
        let mut child = self.load(child_id)?;

        let mid = (self.m - 1) >> 1;
        let mut new_node = TreeNode::new(self.m, child.is_leaf);

        if child.is_leaf {
            // La clave del medio sube al padre y se queda también como
            // primera clave de la hoja nueva.
            new_node.key_cnt = self.m - 1 - mid;
            new_node.keys[..new_node.key_cnt].copy_from_slice(&child.keys[mid..self.m - 1]);
            new_node.vals[..new_node.key_cnt].copy_from_slice(&child.vals[mid..self.m - 1]);
            new_node.next = child.next;
            child.next = new_id;
        } else {
            new_node.key_cnt = self.m - 2 - mid;
            new_node.keys[..new_node.key_cnt]
                .copy_from_slice(&child.keys[mid + 1..self.m - 1]);
            new_node.vals[..new_node.key_cnt + 1]
                .copy_from_slice(&child.vals[mid + 1..self.m]);
        }

        let separator = child.keys[mid];
        child.key_cnt = mid;

        for i in (child_idx + 1..=parent.key_cnt).rev() {
            parent.vals[i + 1] = parent.vals[i];
        }
        for i in (child_idx..parent.key_cnt).rev() {
            parent.keys[i + 1] = parent.keys[i];
        }
        parent.keys[child_idx] = separator;
        parent.vals[child_idx + 1] = new_id;
        parent.key_cnt += 1;

        self.store(parent_id, &parent)?;
        self.store(child_id, &child)?;
        self.store(new_id, &new_node)?;
        Ok(())
    }

    fn node_insert(&mut self, id: u64, key: u64, val: u64) -> Result<(), FsError> {
        let mut node = self.load(id)?;

        if node.is_leaf {
            let at = node.upper_bound(key);
            for i in (at..node.key_cnt).rev() {
                node.keys[i + 1] = node.keys[i];
                node.vals[i + 1] = node.vals[i];
            }
            node.keys[at] = key;
            node.vals[at] = val;
            node.key_cnt += 1;
            return self.store(id, &node);
        }

        let mut idx = node.upper_bound(key);
        let child = self.load(node.vals[idx])?;
        if child.key_cnt == self.m - 1 {
            self.split_node(id, idx)?;
            node = self.load(id)?;
            if key >= node.keys[idx] {
                idx += 1;
            }
        }
        self.node_insert(node.vals[idx], key, val)
    }
}

// --- COMPOSICIÓN REAL: NODOS EN BLOQUES DE DISCO ---

/// Adaptador de almacenamiento: los nodos son bloques del disco, asignados y
/// liberados por el asignador; los valores de hoja son bloques de datos.
pub struct BlockTreeStorage {
    io: Rc<RefCell<IoContext>>,
    alloc: Rc<BlockAllocator>,
}

impl TreeStorage for BlockTreeStorage {
    fn node_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn read_node(&mut self, id: u64, buf: &mut [u8]) -> Result<(), FsError> {
        let handle = self.io.borrow_mut().read_block(id)?;
        buf.copy_from_slice(&handle.borrow());
        Ok(())
    }

    fn write_node(&mut self, id: u64, buf: &[u8]) -> Result<(), FsError> {
        let handle = self.io.borrow_mut().acquire_block(id)?;
        handle.borrow_mut().copy_from_slice(buf);
        Ok(())
    }

    fn allocate_node(&mut self) -> Result<Option<u64>, FsError> {
        self.alloc.allocate_block()
    }

    fn free_node(&mut self, id: u64) -> Result<(), FsError> {
        self.alloc.free_block(id)
    }

    fn free_val(&mut self, val: u64) -> Result<(), FsError> {
        self.alloc.free_block(val)
    }
}

/// Indexador de bloques: mapea índice lógico de bloque de un archivo a LBA
/// físico a través del árbol B+.
pub struct BlockIndexer {
    tree: BPlusTree<BlockTreeStorage>,
}

impl BlockIndexer {
    pub fn new(io: Rc<RefCell<IoContext>>, alloc: Rc<BlockAllocator>) -> Self {
        Self {
            tree: BPlusTree::new(BlockTreeStorage { io, alloc }),
        }
    }

    pub fn find_block(&mut self, root_lba: u64, file_block_idx: u64) -> Result<Option<u64>, FsError> {
        self.tree.find(root_lba, file_block_idx)
    }

    pub fn find_blocks(
        &mut self,
        root_lba: u64,
        from_idx: u64,
        to_idx: u64,
    ) -> Result<Vec<u64>, FsError> {
        self.tree.find_range(root_lba, from_idx, to_idx)
    }

    /// Inserta la asociación y devuelve la raíz resultante.
    pub fn insert_block(
        &mut self,
        root_lba: u64,
        file_block_idx: u64,
        data_lba: u64,
    ) -> Result<u64, FsError> {
        debug!(
            "[BlockIndexer] Insertando bloque. Raíz: 0x{:X}, índice: {}, LBA: 0x{:X}.",
            root_lba, file_block_idx, data_lba
        );
        self.tree.insert(root_lba, file_block_idx, data_lba)
    }

    /// Libera el árbol completo junto con los bloques de datos que indexa.
    pub fn clear(&mut self, root_lba: u64) -> Result<(), FsError> {
        if root_lba == 0 {
            return Ok(());
        }
        self.tree.clear(root_lba)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::collections::{HashMap, HashSet};

    /// Almacenamiento en memoria con nodos pequeños para forzar divisiones.
    struct MemStorage {
        node_size: usize,
        nodes: HashMap<u64, Vec<u8>>,
        next_id: u64,
        allocated: HashSet<u64>,
        freed_nodes: HashSet<u64>,
        freed_vals: HashSet<u64>,
    }

    impl MemStorage {
        fn new(m: usize) -> Self {
            Self {
                node_size: BTREE_NODE_HEADER + m * 16,
                nodes: HashMap::new(),
                next_id: 1,
                allocated: HashSet::new(),
                freed_nodes: HashSet::new(),
                freed_vals: HashSet::new(),
            }
        }
    }

    impl TreeStorage for MemStorage {
        fn node_size(&self) -> usize {
            self.node_size
        }

        fn read_node(&mut self, id: u64, buf: &mut [u8]) -> Result<(), FsError> {
            buf.copy_from_slice(self.nodes.get(&id).expect("nodo inexistente"));
            Ok(())
        }

        fn write_node(&mut self, id: u64, buf: &[u8]) -> Result<(), FsError> {
            self.nodes.insert(id, buf.to_vec());
            Ok(())
        }

        fn allocate_node(&mut self) -> Result<Option<u64>, FsError> {
            let id = self.next_id;
            self.next_id += 1;
            self.allocated.insert(id);
            self.nodes.insert(id, vec![0; self.node_size]);
            Ok(Some(id))
        }

        fn free_node(&mut self, id: u64) -> Result<(), FsError> {
            assert!(self.freed_nodes.insert(id), "nodo liberado dos veces");
            self.nodes.remove(&id);
            Ok(())
        }

        fn free_val(&mut self, val: u64) -> Result<(), FsError> {
            assert!(self.freed_vals.insert(val), "valor liberado dos veces");
            Ok(())
        }
    }

    /// Recorre la cadena de hojas y devuelve las claves en orden.
    fn leaf_chain_keys(tree: &mut BPlusTree<MemStorage>, root: u64) -> Vec<u64> {
        let mut node = tree.load(root).unwrap();
        while !node.is_leaf {
            node = tree.load(node.vals[0]).unwrap();
        }
        let mut keys = Vec::new();
        loop {
            keys.extend_from_slice(&node.keys[..node.key_cnt]);
            if node.next == 0 {
                return keys;
            }
            node = tree.load(node.next).unwrap();
        }
    }

    /// Verifica la ocupación mínima de todo nodo no raíz.
    fn check_occupancy(tree: &mut BPlusTree<MemStorage>, id: u64, is_root: bool) {
        let m = tree.fanout();
        let node = tree.load(id).unwrap();
        if !is_root {
            assert!(node.key_cnt >= (m - 1) / 2, "nodo {} por debajo del mínimo", id);
        }
        assert!(node.key_cnt <= m - 1);
        for i in 1..node.key_cnt {
            assert!(node.keys[i - 1] < node.keys[i], "claves no crecientes");
        }
        if !node.is_leaf {
            for i in 0..=node.key_cnt {
                check_occupancy(tree, node.vals[i], false);
            }
        }
    }

    #[test]
    fn test_sequential_inserts_and_splits() {
        let mut tree = BPlusTree::new(MemStorage::new(5));
        let m = tree.fanout() as u64;
        let mut root = 0;

        for k in 0..10 * m {
            root = tree.insert(root, k, k + 1000).unwrap();
            // Cada clave insertada se encuentra de inmediato.
            assert_eq!(tree.find(root, k).unwrap(), Some(k + 1000));
        }

        let keys = leaf_chain_keys(&mut tree, root);
        let expected: Vec<u64> = (0..10 * m).collect();
        assert_eq!(keys, expected, "la cadena de hojas debe estar ordenada y completa");
        check_occupancy(&mut tree, root, true);
    }

    #[test]
    fn test_permuted_inserts_then_find_all() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0xEA6191);
        let n: u64 = 500;
        let mut keys: Vec<u64> = (0..n).collect();
        keys.shuffle(&mut rng);

        let mut tree = BPlusTree::new(MemStorage::new(5));
        let mut root = 0;
        for &k in &keys {
            root = tree.insert(root, k, k * 2 + 1).unwrap();
        }

        for k in 0..n {
            assert_eq!(tree.find(root, k).unwrap(), Some(k * 2 + 1));
        }
        // Toda clave fuera de lo insertado responde None.
        for k in n..2 * n {
            assert_eq!(tree.find(root, k).unwrap(), None);
        }
        assert_eq!(leaf_chain_keys(&mut tree, root), (0..n).collect::<Vec<_>>());
        check_occupancy(&mut tree, root, true);
    }

    #[test]
    fn test_find_on_empty_tree() {
        let mut tree = BPlusTree::new(MemStorage::new(5));
        assert_eq!(tree.find(0, 42).unwrap(), None);
        assert_eq!(tree.find_range(0, 0, 3).unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_find_range_with_holes() {
        let mut tree = BPlusTree::new(MemStorage::new(5));
        let mut root = 0;
        for k in [0u64, 2, 3, 7, 40] {
            root = tree.insert(root, k, 100 + k).unwrap();
        }

        let got = tree.find_range(root, 0, 8).unwrap();
        assert_eq!(got, vec![100, 0, 102, 103, 0, 0, 0, 107, 0]);

        // Rango que arranca en un hueco y termina pasado el final.
        let got = tree.find_range(root, 4, 41).unwrap();
        assert_eq!(got[0], 0);
        assert_eq!(got[3], 107);
        assert_eq!(got[36], 140);
    }

    #[test]
    fn test_clear_frees_every_node_and_value() {
        let mut tree = BPlusTree::new(MemStorage::new(5));
        let mut root = 0;
        let n = 200u64;
        for k in 0..n {
            root = tree.insert(root, k, k + 5000).unwrap();
        }
        tree.clear(root).unwrap();

        let st = &tree.storage;
        assert_eq!(st.freed_nodes, st.allocated, "todo nodo asignado debe liberarse");
        let expected_vals: HashSet<u64> = (0..n).map(|k| k + 5000).collect();
        assert_eq!(st.freed_vals, expected_vals);
        assert!(st.nodes.is_empty());
    }
}
