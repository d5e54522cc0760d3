//! The table directory: a reserved metadata page plus a directory page of
//! packed table descriptors (spec §4.5 "Catalog & row codec").
//!
//! Grounded on the teacher's own `Catalog` (which persisted itself as rows
//! in a catalog B+tree); reworked into the spec's flat packed-array format
//! with a fixed-offset metadata page, since the CORE no longer owns a
//! generic row-oriented catalog tree.

use std::collections::HashMap;

use log::info;

use crate::error::{DbError, DbResult};
use crate::storage::btree::BTree;
use crate::storage::node::TreeShape;
use crate::storage::page::{KeyKind, PAGE_SIZE};
use crate::storage::pager::Pager;
use crate::storage::row::{ColumnDef, ColumnType, Schema};

const META_USERS_ROOT_OFFSET: usize = 0;
const META_USERS_INDEX_ROOT_OFFSET: usize = 4;
const META_ORDERS_ROOT_OFFSET: usize = 8;
const META_DIRECTORY_PAGE_OFFSET: usize = 12;

const DESC_NAME_LEN: usize = 32;
/// `name[32] || root_page(4) || num_columns(4)`.
const DESC_FIXED_SIZE: usize = DESC_NAME_LEN + 4 + 4;
const COL_NAME_LEN: usize = 32;
/// `name[32] || type(1) || size(4) || offset(4)`.
const COL_RECORD_SIZE: usize = COL_NAME_LEN + 1 + 4 + 4;

const USERS_INDEX_COLUMN: &str = "username";

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub root_page: u32,
    pub schema: Schema,
}

impl TableInfo {
    fn primary_key_shape(&self) -> TreeShape {
        TreeShape::new(KeyKind::Uint32, self.schema.row_size())
    }

    pub fn tree(&self) -> BTree {
        BTree::open(self.root_page, self.primary_key_shape())
    }
}

pub struct Catalog {
    pager: Pager,
    directory_page: u32,
    tables: HashMap<String, TableInfo>,
    /// Root page of the hard-coded secondary index over `users.username`
    /// (spec §4.5 "On open"), or `None` before it exists.
    users_index_root_page: Option<u32>,
}

impl Catalog {
    /// Opens an existing database file, or initializes a fresh one with the
    /// default `users`/`orders` tables and the `users.username` index (spec
    /// §4.5 "On open").
    pub fn open(mut pager: Pager) -> Catalog {
        if pager.num_pages() == 0 {
            return Self::bootstrap(pager);
        }

        let meta = *pager.read_page(0);
        let directory_page = read_u32(&meta, META_DIRECTORY_PAGE_OFFSET);
        let users_index_root_page = match read_u32(&meta, META_USERS_INDEX_ROOT_OFFSET) {
            0 => None,
            p => Some(p),
        };

        let dir = *pager.read_page(directory_page);
        let tables = parse_directory(&dir);

        info!("opened catalog: {} table(s), directory page {directory_page}", tables.len());
        Catalog { pager, directory_page, tables, users_index_root_page }
    }

    fn bootstrap(mut pager: Pager) -> Catalog {
        let meta_page = pager.allocate_page();
        debug_assert_eq!(meta_page, 0);
        let directory_page = pager.allocate_page();

        let users_schema = Schema::new(vec![
            ("id".into(), ColumnType::Int),
            ("username".into(), ColumnType::Char(32)),
            ("email".into(), ColumnType::Char(255)),
        ]);
        let users_shape = TreeShape::new(KeyKind::Uint32, users_schema.row_size());
        let users_root = BTree::create(&mut pager, users_shape).root_page();

        let index_shape = TreeShape::new(KeyKind::FixedBytes { len: 32 }, 4);
        let users_index_root = BTree::create(&mut pager, index_shape).root_page();

        let orders_schema = Schema::new(vec![
            ("id".into(), ColumnType::Int),
            ("user_id".into(), ColumnType::Int),
            ("product_name".into(), ColumnType::Char(32)),
        ]);
        let orders_shape = TreeShape::new(KeyKind::Uint32, orders_schema.row_size());
        let orders_root = BTree::create(&mut pager, orders_shape).root_page();

        let mut tables = HashMap::new();
        tables.insert("users".to_string(), TableInfo { name: "users".into(), root_page: users_root, schema: users_schema });
        tables.insert("orders".to_string(), TableInfo { name: "orders".into(), root_page: orders_root, schema: orders_schema });

        let mut catalog = Catalog {
            pager,
            directory_page,
            tables,
            users_index_root_page: Some(users_index_root),
        };
        catalog.write_metadata_page(users_root, users_index_root, orders_root);
        catalog.write_directory();
        info!("initialized fresh database: users (root {users_root}, index root {users_index_root}), orders (root {orders_root})");
        catalog
    }

    fn write_metadata_page(&mut self, users_root: u32, users_index_root: u32, orders_root: u32) {
        let buf = self.pager.write_page(0);
        write_u32(buf, META_USERS_ROOT_OFFSET, users_root);
        write_u32(buf, META_USERS_INDEX_ROOT_OFFSET, users_index_root);
        write_u32(buf, META_ORDERS_ROOT_OFFSET, orders_root);
        write_u32(buf, META_DIRECTORY_PAGE_OFFSET, self.directory_page);
        self.pager.flush(0);
    }

    fn write_directory(&mut self) {
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();

        let mut bytes = vec![0u8; PAGE_SIZE];
        let mut offset = 0usize;
        for name in &names {
            let table = &self.tables[*name];
            offset += serialize_descriptor(&mut bytes[offset..], table);
        }
        bytes[PAGE_SIZE - 4..].copy_from_slice(&(names.len() as u32).to_le_bytes());

        let buf = self.pager.write_page(self.directory_page);
        *buf = bytes.try_into().unwrap();
        self.pager.flush(self.directory_page);
    }

    pub fn pager(&mut self) -> &mut Pager {
        &mut self.pager
    }

    /// Cumulative page-access count of the underlying pager, for tests that
    /// want to observe index-probe vs. full-scan cost (spec §8 scenario 4).
    pub fn page_access_count(&self) -> u64 {
        self.pager.access_count()
    }

    pub fn table(&self, name: &str) -> DbResult<&TableInfo> {
        self.tables.get(name).ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// The hard-coded secondary index's tree, if `table`/`column` are the
    /// one pair the CORE indexes (spec §9 "one hard-coded index choice").
    pub fn index_for(&self, table: &str, column: &str) -> Option<BTree> {
        if table == "users" && column == USERS_INDEX_COLUMN {
            self.users_index_root_page.map(|root| BTree::open(root, TreeShape::new(KeyKind::FixedBytes { len: 32 }, 4)))
        } else {
            None
        }
    }

    pub fn indexed_column(&self, table: &str) -> Option<&'static str> {
        if table == "users" && self.users_index_root_page.is_some() {
            Some(USERS_INDEX_COLUMN)
        } else {
            None
        }
    }

    /// Registers a new table, allocating its root leaf page (spec §4.6
    /// "create_table"). The first column must be `INT`: it is the primary
    /// key every row's leaf cell is keyed by.
    pub fn create_table(&mut self, name: &str, columns: Vec<(String, ColumnType)>) -> DbResult<()> {
        if self.tables.contains_key(name) {
            return Err(DbError::TableAlreadyExists(name.to_string()));
        }
        match columns.first() {
            Some((_, ColumnType::Int)) => {}
            _ => return Err(DbError::SyntaxError),
        }

        let schema = Schema::new(columns);
        if !self.fits_in_directory(name, &schema) {
            return Err(DbError::MaxTablesReached);
        }

        let shape = TreeShape::new(KeyKind::Uint32, schema.row_size());
        let root_page = BTree::create(&mut self.pager, shape).root_page();

        self.tables.insert(name.to_string(), TableInfo { name: name.to_string(), root_page, schema });
        self.write_directory();
        Ok(())
    }

    fn fits_in_directory(&self, new_name: &str, new_schema: &Schema) -> bool {
        let existing: usize = self.tables.values().map(descriptor_size).sum();
        let added = DESC_FIXED_SIZE + new_schema.columns.len() * COL_RECORD_SIZE;
        debug_assert!(new_name.len() <= DESC_NAME_LEN);
        existing + added + 4 <= PAGE_SIZE
    }

    /// Rewrites the directory, flushes every dirty page, and closes the
    /// file (spec §4.5 "On close").
    pub fn close(mut self) {
        self.write_directory();
    }
}

fn descriptor_size(table: &TableInfo) -> usize {
    DESC_FIXED_SIZE + table.schema.columns.len() * COL_RECORD_SIZE
}

fn serialize_descriptor(dst: &mut [u8], table: &TableInfo) -> usize {
    write_fixed_str(&mut dst[0..DESC_NAME_LEN], &table.name);
    write_u32(dst, DESC_NAME_LEN, table.root_page);
    write_u32(dst, DESC_NAME_LEN + 4, table.schema.columns.len() as u32);

    let mut offset = DESC_FIXED_SIZE;
    for col in &table.schema.columns {
        write_fixed_str(&mut dst[offset..offset + COL_NAME_LEN], &col.name);
        dst[offset + COL_NAME_LEN] = col.col_type.tag();
        write_u32(dst, offset + COL_NAME_LEN + 1, col.col_type.size() as u32);
        write_u32(dst, offset + COL_NAME_LEN + 1 + 4, col.offset as u32);
        offset += COL_RECORD_SIZE;
    }
    offset
}

fn parse_directory(page: &[u8; PAGE_SIZE]) -> HashMap<String, TableInfo> {
    let count = read_u32(page, PAGE_SIZE - 4) as usize;
    let mut tables = HashMap::with_capacity(count);
    let mut offset = 0usize;
    for _ in 0..count {
        let name = read_fixed_str(&page[offset..offset + DESC_NAME_LEN]);
        let root_page = read_u32(page, offset + DESC_NAME_LEN);
        let num_columns = read_u32(page, offset + DESC_NAME_LEN + 4) as usize;

        let mut columns = Vec::with_capacity(num_columns);
        let mut col_offset = offset + DESC_FIXED_SIZE;
        for _ in 0..num_columns {
            let col_name = read_fixed_str(&page[col_offset..col_offset + COL_NAME_LEN]);
            let tag = page[col_offset + COL_NAME_LEN];
            let size = read_u32(page, col_offset + COL_NAME_LEN + 1) as usize;
            let decl_offset = read_u32(page, col_offset + COL_NAME_LEN + 1 + 4) as usize;
            columns.push(ColumnDef { name: col_name, col_type: ColumnType::from_tag(tag, size), offset: decl_offset });
            col_offset += COL_RECORD_SIZE;
        }
        offset = col_offset;

        tables.insert(name.clone(), TableInfo { name, root_page, schema: Schema { columns } });
    }
    tables
}

fn write_fixed_str(dst: &mut [u8], s: &str) {
    dst.fill(0);
    let bytes = s.as_bytes();
    dst[..bytes.len().min(dst.len())].copy_from_slice(&bytes[..bytes.len().min(dst.len())]);
}

fn read_fixed_str(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

fn write_u32(page: &mut [u8], offset: usize, value: u32) {
    page[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(page: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(page[offset..offset + 4].try_into().unwrap())
}
