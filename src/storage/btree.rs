//! The B+tree itself: find, insert, delete, and the split/propagate
//! machinery that keeps the tree balanced (spec §4.3).
//!
//! Grounded on `examples/original_source/src/node.c`'s
//! `leaf_node_split_and_insert`/`create_new_root`, generalized to internal
//! node splits and fixed to re-parent every moved child (the C original
//! left that as a TODO and `exit()`s on a non-root leaf split — SPEC_FULL.md
//! §"Open Question Decisions" calls for both gaps to be closed here).
//!
//! A child's separator in its parent is the true maximum key of that
//! child's whole subtree, not `node::max_key` of the child's own page
//! (those agree for a leaf child but not for an internal one, whose real
//! max lives under its `right_child`) — see `subtree_max_key`.
//!
//! `BTree` stores only a tree's shape and root page; like [`Cursor`], every
//! operation takes the pager as an explicit argument rather than borrowing
//! it for the struct's lifetime, so a tree handle and its cursors can be
//! held side by side without fighting the borrow checker.

use log::trace;

use crate::error::{DbError, DbResult};
use crate::storage::cursor::Cursor;
use crate::storage::node::{
    copy_internal_cell, copy_leaf_cell, init_internal, init_leaf, internal_child, internal_child_at,
    internal_find_child_index, internal_key, internal_num_keys, internal_right_child, leaf_find_slot,
    leaf_key, leaf_next, leaf_num_cells, leaf_value, max_key, set_internal_cell, set_internal_key,
    set_internal_num_keys, set_internal_right_child, set_leaf_cell, set_leaf_next, set_leaf_num_cells,
    TreeShape,
};
use crate::storage::page::{get_is_root, get_parent, is_leaf, set_is_root, set_parent, Key};
use crate::storage::pager::Pager;

#[derive(Debug, Clone, Copy)]
pub struct BTree {
    shape: TreeShape,
    root_page: u32,
}

enum ChildPos {
    Cell(usize),
    RightChild,
}

impl BTree {
    /// Allocates a fresh root leaf and returns a tree over it.
    pub fn create(pager: &mut Pager, shape: TreeShape) -> BTree {
        let root_page = pager.allocate_page();
        {
            let buf = pager.write_page(root_page);
            init_leaf(buf);
            set_is_root(buf, true);
        }
        pager.flush(root_page);
        BTree { shape, root_page }
    }

    /// Opens a tree whose root already exists on disk.
    pub fn open(root_page: u32, shape: TreeShape) -> BTree {
        BTree { shape, root_page }
    }

    pub fn root_page(&self) -> u32 {
        self.root_page
    }

    fn find_leaf_page(&self, pager: &mut Pager, target: &Key) -> u32 {
        let mut page_num = self.root_page;
        loop {
            let page = pager.read_page(page_num);
            if is_leaf(page) {
                return page_num;
            }
            let idx = internal_find_child_index(page, &self.shape, target);
            page_num = internal_child_at(page, &self.shape, idx);
        }
    }

    /// Positions a cursor at the smallest cell with `key >= target` (spec
    /// §4.4 "find"). Callers check `cursor.key(pager) == target` themselves
    /// to distinguish "found" from "insertion point".
    pub fn find(&self, pager: &mut Pager, target: &Key) -> Cursor {
        let leaf_page = self.find_leaf_page(pager, target);
        let page = pager.read_page(leaf_page);
        let cell_num = leaf_find_slot(page, &self.shape, target);
        let num_cells = leaf_num_cells(page) as usize;
        Cursor::new(leaf_page, cell_num, cell_num >= num_cells, self.shape)
    }

    /// Leftmost cell of the tree.
    pub fn start(&self, pager: &mut Pager) -> Cursor {
        let mut page_num = self.root_page;
        loop {
            let page = pager.read_page(page_num);
            if is_leaf(page) {
                break;
            }
            page_num = internal_child_at(page, &self.shape, 0);
        }
        let page = pager.read_page(page_num);
        let num_cells = leaf_num_cells(page) as usize;
        Cursor::new(page_num, 0, num_cells == 0, self.shape)
    }

    /// One past the rightmost cell of the tree.
    pub fn end(&self, pager: &mut Pager) -> Cursor {
        let mut page_num = self.root_page;
        loop {
            let page = pager.read_page(page_num);
            if is_leaf(page) {
                break;
            }
            page_num = internal_right_child(page);
        }
        let page = pager.read_page(page_num);
        let num_cells = leaf_num_cells(page) as usize;
        Cursor::new(page_num, num_cells, true, self.shape)
    }

    /// Inserts `(key, value)`. Fails with [`DbError::DuplicateKey`] if `key`
    /// is already present (spec §4.3 "Insert", §5 uniqueness invariant).
    pub fn insert(&self, pager: &mut Pager, key: Key, value: &[u8]) -> DbResult<()> {
        debug_assert_eq!(value.len(), self.shape.value_size);
        let leaf_page = self.find_leaf_page(pager, &key);
        let (cell_num, num_cells) = {
            let page = pager.read_page(leaf_page);
            (leaf_find_slot(page, &self.shape, &key), leaf_num_cells(page) as usize)
        };
        if cell_num < num_cells {
            let existing = {
                let page = pager.read_page(leaf_page);
                leaf_key(page, &self.shape, cell_num)
            };
            if existing == key {
                return Err(DbError::DuplicateKey(format!("{key:?}")));
            }
        }

        let max_cells = self.shape.leaf_max_cells();
        if num_cells < max_cells {
            let buf = pager.write_page(leaf_page);
            for i in (cell_num..num_cells).rev() {
                copy_leaf_cell(buf, &self.shape, i, i + 1);
            }
            set_leaf_cell(buf, &self.shape, cell_num, &key, value);
            set_leaf_num_cells(buf, (num_cells + 1) as u32);
            pager.flush(leaf_page);
        } else {
            if pager.num_pages() >= u32::MAX - 4 {
                return Err(DbError::TableFull);
            }
            self.leaf_split_and_insert(pager, leaf_page, cell_num, key, value)?;
        }
        Ok(())
    }

    /// Removes `key` if present; a no-op otherwise (spec §4.3 "Delete").
    /// Never triggers a merge or rebalance (spec §9 design note).
    pub fn delete(&self, pager: &mut Pager, key: &Key) {
        let leaf_page = self.find_leaf_page(pager, key);
        let (cell_num, num_cells, found) = {
            let page = pager.read_page(leaf_page);
            let cell_num = leaf_find_slot(page, &self.shape, key);
            let num_cells = leaf_num_cells(page) as usize;
            let found = cell_num < num_cells && &leaf_key(page, &self.shape, cell_num) == key;
            (cell_num, num_cells, found)
        };
        if !found {
            return;
        }
        let buf = pager.write_page(leaf_page);
        for i in cell_num..num_cells - 1 {
            copy_leaf_cell(buf, &self.shape, i + 1, i);
        }
        set_leaf_num_cells(buf, (num_cells - 1) as u32);
        pager.flush(leaf_page);
    }

    /// Splits a full leaf at `old_page`, inserting `(key, value)` at
    /// `cell_num` into the merged, sorted run. `old_page` keeps the smaller
    /// (left) half; a freshly allocated page gets the larger (right) half
    /// and is leaf-chained after it.
    fn leaf_split_and_insert(
        &self,
        pager: &mut Pager,
        old_page: u32,
        cell_num: usize,
        key: Key,
        value: &[u8],
    ) -> DbResult<()> {
        let max_cells = self.shape.leaf_max_cells();
        let total = max_cells + 1;

        let mut cells: Vec<(Key, Vec<u8>)> = Vec::with_capacity(total);
        {
            let old = *pager.read_page(old_page);
            for i in 0..max_cells {
                if i == cell_num {
                    cells.push((key.clone(), value.to_vec()));
                }
                cells.push((leaf_key(&old, &self.shape, i), leaf_value(&old, &self.shape, i).to_vec()));
            }
            if cell_num == max_cells {
                cells.push((key.clone(), value.to_vec()));
            }
        }
        debug_assert_eq!(cells.len(), total);

        let left_count = total / 2;
        let (was_root, old_parent, old_next) = {
            let p = pager.read_page(old_page);
            (get_is_root(p), get_parent(p), leaf_next(p))
        };

        let new_page_num = pager.allocate_page();

        {
            let buf = pager.write_page(old_page);
            init_leaf(buf);
            set_is_root(buf, false);
            set_parent(buf, old_parent);
            for (i, (k, v)) in cells[..left_count].iter().enumerate() {
                set_leaf_cell(buf, &self.shape, i, k, v);
            }
            set_leaf_num_cells(buf, left_count as u32);
            set_leaf_next(buf, new_page_num);
        }
        pager.flush(old_page);

        {
            let buf = pager.write_page(new_page_num);
            init_leaf(buf);
            set_parent(buf, old_parent);
            for (i, (k, v)) in cells[left_count..].iter().enumerate() {
                set_leaf_cell(buf, &self.shape, i, k, v);
            }
            set_leaf_num_cells(buf, (total - left_count) as u32);
            set_leaf_next(buf, old_next);
        }
        pager.flush(new_page_num);

        trace!("split leaf {old_page} -> {old_page}(left)/{new_page_num}(right)");

        if was_root {
            self.create_new_root(pager, old_page, new_page_num);
        } else {
            self.propagate_split(pager, old_parent, old_page, new_page_num)?;
        }
        Ok(())
    }

    /// Moves `left_content_page`'s (the root's) current bytes to a fresh
    /// page and rewrites the root in place as an internal node pointing at
    /// that page and `right_child_page_num`. Used whenever the root itself
    /// splits, whether it was a leaf or an internal node.
    fn create_new_root(&self, pager: &mut Pager, left_content_page: u32, right_child_page_num: u32) {
        let root_page = self.root_page;
        debug_assert_eq!(left_content_page, root_page);

        let left_page_num = pager.allocate_page();
        let snapshot = *pager.read_page(root_page);
        {
            let buf = pager.write_page(left_page_num);
            *buf = snapshot;
            set_is_root(buf, false);
            set_parent(buf, root_page);
        }
        pager.flush(left_page_num);
        self.reparent_children(pager, left_page_num);

        let left_max = self.subtree_max_key(pager, left_page_num);

        {
            let buf = pager.write_page(root_page);
            init_internal(buf);
            set_is_root(buf, true);
            set_parent(buf, 0);
            set_internal_cell(buf, &self.shape, 0, left_page_num, &left_max);
            set_internal_num_keys(buf, 1);
            set_internal_right_child(buf, right_child_page_num);
        }
        pager.flush(root_page);

        {
            let buf = pager.write_page(right_child_page_num);
            set_parent(buf, root_page);
        }
        pager.flush(right_child_page_num);

        trace!("created new root at page {root_page} over {left_page_num}/{right_child_page_num}");
    }

    /// Re-points every direct child of `page_num` at `page_num` itself. Used
    /// after an internal node's content is copied or rebuilt onto a page
    /// whose own page number its children didn't previously know about.
    fn reparent_children(&self, pager: &mut Pager, page_num: u32) {
        let page = *pager.read_page(page_num);
        if is_leaf(&page) {
            return;
        }
        let num_keys = internal_num_keys(&page) as usize;
        for i in 0..=num_keys {
            let child = internal_child_at(&page, &self.shape, i);
            let buf = pager.write_page(child);
            set_parent(buf, page_num);
            pager.flush(child);
        }
    }

    /// True maximum key of the subtree rooted at `page_num`. For a leaf this
    /// is its last cell key, same as `node::max_key`. For an internal node
    /// it is *not* the node's own last separator (spec §4.2 defines that as
    /// the last-separator, a different thing): the real maximum lives in
    /// the rightmost leaf reachable through `right_child`, so descend there.
    /// Every separator a child stores in its parent must be this value, not
    /// `node::max_key`, or invariant 2 (§3/§8) breaks as soon as a cell
    /// child is itself internal.
    fn subtree_max_key(&self, pager: &mut Pager, page_num: u32) -> Key {
        let mut page_num = page_num;
        loop {
            let page = pager.read_page(page_num);
            if is_leaf(page) {
                return max_key(page, &self.shape);
            }
            page_num = internal_right_child(page);
        }
    }

    fn find_child_position(&self, pager: &mut Pager, parent_page: u32, child_page: u32) -> ChildPos {
        let page = *pager.read_page(parent_page);
        let num_keys = internal_num_keys(&page) as usize;
        for i in 0..num_keys {
            if internal_child(&page, &self.shape, i) == child_page {
                return ChildPos::Cell(i);
            }
        }
        debug_assert_eq!(internal_right_child(&page), child_page);
        ChildPos::RightChild
    }

    /// Refreshes `child`'s separator in `parent` to `child`'s current max
    /// key. Used after `child`'s own subtree has shrunk (it just split).
    fn refresh_child_key(&self, pager: &mut Pager, parent_page: u32, child: u32) {
        let key = self.subtree_max_key(pager, child);
        if let ChildPos::Cell(i) = self.find_child_position(pager, parent_page, child) {
            let buf = pager.write_page(parent_page);
            set_internal_key(buf, &self.shape, i, &key);
            pager.flush(parent_page);
        }
        // `RightChild` stores no separator of its own; nothing to refresh.
    }

    /// Inserts a brand-new child into `parent`, in sorted position by the
    /// child's own current max key. Splits `parent` (recursively) if full.
    fn insert_child(&self, pager: &mut Pager, parent_page: u32, child: u32) -> DbResult<()> {
        let key = self.subtree_max_key(pager, child);
        let (num_keys, max_cells) = {
            let p = pager.read_page(parent_page);
            (internal_num_keys(p) as usize, self.shape.internal_max_cells())
        };
        if num_keys >= max_cells {
            return self.internal_split_and_insert(pager, parent_page, child);
        }

        let index = {
            let p = pager.read_page(parent_page);
            internal_find_child_index(p, &self.shape, &key)
        };

        if index == num_keys {
            // `child` is now the largest subtree: demote the current right
            // child into a keyed cell (by its own live max) and promote
            // `child` to the new right_child_page.
            let old_right = {
                let p = pager.read_page(parent_page);
                internal_right_child(p)
            };
            let old_right_key = self.subtree_max_key(pager, old_right);
            let buf = pager.write_page(parent_page);
            set_internal_cell(buf, &self.shape, num_keys, old_right, &old_right_key);
            set_internal_num_keys(buf, (num_keys + 1) as u32);
            set_internal_right_child(buf, child);
            pager.flush(parent_page);
        } else {
            let buf = pager.write_page(parent_page);
            for i in (index..num_keys).rev() {
                copy_internal_cell(buf, &self.shape, i, i + 1);
            }
            set_internal_cell(buf, &self.shape, index, child, &key);
            set_internal_num_keys(buf, (num_keys + 1) as u32);
            pager.flush(parent_page);
        }

        let buf = pager.write_page(child);
        set_parent(buf, parent_page);
        pager.flush(child);
        Ok(())
    }

    /// Called after a child of `parent_page` has split into itself
    /// (shrunk) and a fresh sibling `new_child`: fixes up the old
    /// separator, then inserts the new one.
    fn propagate_split(&self, pager: &mut Pager, parent_page: u32, old_child: u32, new_child: u32) -> DbResult<()> {
        self.refresh_child_key(pager, parent_page, old_child);
        self.insert_child(pager, parent_page, new_child)
    }

    /// Splits a full internal node, fitting in one more child. Gathers
    /// every existing child (keyed by its own live max key) plus the new
    /// one, sorts, and redistributes into two nodes the same way a leaf
    /// split does.
    fn internal_split_and_insert(&self, pager: &mut Pager, parent_page: u32, new_child: u32) -> DbResult<()> {
        if pager.num_pages() >= u32::MAX - 4 {
            return Err(DbError::TableFull);
        }

        let mut entries: Vec<(Key, u32)> = Vec::new();
        {
            let p = *pager.read_page(parent_page);
            let num_keys = internal_num_keys(&p) as usize;
            for i in 0..num_keys {
                entries.push((internal_key(&p, &self.shape, i), internal_child(&p, &self.shape, i)));
            }
            let right_child = internal_right_child(&p);
            let right_key = self.subtree_max_key(pager, right_child);
            entries.push((right_key, right_child));
        }
        let new_key = self.subtree_max_key(pager, new_child);
        entries.push((new_key, new_child));
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let total = entries.len();
        let left_count = total / 2;

        let (was_root, old_parent_of_this) = {
            let p = pager.read_page(parent_page);
            (get_is_root(p), get_parent(p))
        };

        let new_page_num = pager.allocate_page();

        {
            let buf = pager.write_page(parent_page);
            init_internal(buf);
            set_is_root(buf, false);
            set_parent(buf, old_parent_of_this);
            for (i, (k, c)) in entries[..left_count - 1].iter().enumerate() {
                set_internal_cell(buf, &self.shape, i, *c, k);
            }
            set_internal_num_keys(buf, (left_count - 1) as u32);
            set_internal_right_child(buf, entries[left_count - 1].1);
        }
        pager.flush(parent_page);
        self.reparent_children(pager, parent_page);

        {
            let right_entries = &entries[left_count..];
            let buf = pager.write_page(new_page_num);
            init_internal(buf);
            set_parent(buf, old_parent_of_this);
            for (i, (k, c)) in right_entries[..right_entries.len() - 1].iter().enumerate() {
                set_internal_cell(buf, &self.shape, i, *c, k);
            }
            set_internal_num_keys(buf, (right_entries.len() - 1) as u32);
            set_internal_right_child(buf, right_entries[right_entries.len() - 1].1);
        }
        pager.flush(new_page_num);
        self.reparent_children(pager, new_page_num);

        trace!("split internal node {parent_page} -> {parent_page}(left)/{new_page_num}(right)");

        if was_root {
            self.create_new_root(pager, parent_page, new_page_num);
        } else {
            self.propagate_split(pager, old_parent_of_this, parent_page, new_page_num)?;
        }
        Ok(())
    }
}
