//! A positioned iterator into one tree (spec §4.4).
//!
//! A cursor holds only a page number and a cell index, never a buffer
//! pointer, so that cache evictions elsewhere in the same operation cannot
//! invalidate it (spec §5). Every access re-acquires the page through the
//! pager explicitly passed in.

use crate::storage::node::{leaf_key, leaf_next, leaf_num_cells, leaf_value, TreeShape};
use crate::storage::page::Key;
use crate::storage::pager::Pager;

#[derive(Debug, Clone)]
pub struct Cursor {
    pub page_num: u32,
    pub cell_num: usize,
    pub end_of_table: bool,
    shape: TreeShape,
}

impl Cursor {
    pub(crate) fn new(page_num: u32, cell_num: usize, end_of_table: bool, shape: TreeShape) -> Self {
        Cursor { page_num, cell_num, end_of_table, shape }
    }

    /// True if the cursor is positioned at a real cell (not past the end).
    pub fn is_valid(&self, pager: &mut Pager) -> bool {
        if self.end_of_table {
            return false;
        }
        let page = pager.read_page(self.page_num);
        self.cell_num < leaf_num_cells(page) as usize
    }

    pub fn key(&self, pager: &mut Pager) -> Key {
        let page = pager.read_page(self.page_num);
        leaf_key(page, &self.shape, self.cell_num)
    }

    pub fn value<'p>(&self, pager: &'p mut Pager) -> &'p [u8] {
        let page = pager.read_page(self.page_num);
        leaf_value(page, &self.shape, self.cell_num)
    }

    /// Advances to the next cell, following `next_leaf` at the boundary
    /// (spec §4.3 Range scan). `next_leaf == 0` means end of table.
    pub fn advance(&mut self, pager: &mut Pager) {
        if self.end_of_table {
            return;
        }
        let page = pager.read_page(self.page_num);
        let num_cells = leaf_num_cells(page) as usize;
        self.cell_num += 1;
        if self.cell_num >= num_cells {
            let next = leaf_next(page);
            if next == 0 {
                self.end_of_table = true;
            } else {
                self.page_num = next;
                self.cell_num = 0;
            }
        }
    }
}
