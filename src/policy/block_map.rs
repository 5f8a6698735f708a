//! Page index to block header. This is how a candidate pointer is resolved to
//! an object, by the mutator and by the background marker alike.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::policy::heap_block::BlockHeader;
use crate::util::conversions;
use crate::util::Address;

#[derive(Default)]
pub struct BlockMap {
    pages: RwLock<HashMap<usize, Arc<BlockHeader>>>,
}

impl BlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, header: &Arc<BlockHeader>) {
        let first = conversions::address_to_page_index(header.start());
        let mut pages = self.pages.write().unwrap();
        for page in first..first + header.pages() {
            let previous = pages.insert(page, header.clone());
            debug_assert!(previous.is_none(), "page {} already maps {:?}", page, previous);
        }
    }

    pub fn remove(&self, header: &BlockHeader) {
        let first = conversions::address_to_page_index(header.start());
        let mut pages = self.pages.write().unwrap();
        for page in first..first + header.pages() {
            pages.remove(&page);
        }
    }

    pub fn find(&self, addr: Address) -> Option<Arc<BlockHeader>> {
        self.pages
            .read()
            .unwrap()
            .get(&conversions::address_to_page_index(addr))
            .cloned()
    }

    /// Run `f` on the header of the block containing `addr`, without
    /// cloning the header.
    pub fn with_block<R, F: FnOnce(&BlockHeader) -> R>(&self, addr: Address, f: F) -> Option<R> {
        let pages = self.pages.read().unwrap();
        pages
            .get(&conversions::address_to_page_index(addr))
            .map(|header| f(header))
    }

    /// Every block, each once, ordered by address.
    pub fn blocks(&self) -> Vec<Arc<BlockHeader>> {
        let pages = self.pages.read().unwrap();
        let mut blocks: Vec<Arc<BlockHeader>> = pages
            .iter()
            .filter(|(page, header)| conversions::address_to_page_index(header.start()) == **page)
            .map(|(_, header)| header.clone())
            .collect();
        blocks.sort_by_key(|header| header.start());
        blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks().len()
    }
}
