//! Shared fixtures: an in-memory database served through data nodes, and the
//! artist/painting/group schema used by the integration tests.

#![allow(dead_code)]

use relmap::prelude::*;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

type Tables = HashMap<String, Vec<DataRow>>;

/// Tables shared by every node opened on the same database.
#[derive(Default)]
pub struct Database {
    tables: Tables,
    keys: HashMap<String, i32>,
    /// Executed statements, in order.
    pub statements: Vec<Statement>,
    /// Transaction calls as `node:action`.
    pub log: Vec<String>,
}

impl Database {
    pub fn shared() -> Rc<RefCell<Database>> {
        Rc::new(RefCell::new(Database::default()))
    }

    pub fn insert(&mut self, table: &str, row: DataRow) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn rows(&self, table: &str) -> &[DataRow] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or_default()
    }

    /// Statements executed against `table`.
    pub fn statements_for(&self, table: &str) -> Vec<&Statement> {
        self.statements.iter().filter(|s| s.table == table).collect()
    }
}

fn matches(row: &DataRow, qualifier: &DataRow) -> bool {
    qualifier
        .iter()
        .all(|(column, value)| row.get(column).unwrap_or(&Value::Null).null_safe_eq(value))
}

/// A connection to a shared [`Database`].
///
/// Statements are applied from their structured row data. Turning auto-commit
/// off takes a copy of the tables that rollback restores.
pub struct MemoryNode {
    name: String,
    db: Rc<RefCell<Database>>,
    backup: Option<Tables>,
    pub fail_commit: bool,
    pub fail_rollback: bool,
}

impl MemoryNode {
    pub fn new(name: &str, db: &Rc<RefCell<Database>>) -> Self {
        Self {
            name: name.to_string(),
            db: Rc::clone(db),
            backup: None,
            fail_commit: false,
            fail_rollback: false,
        }
    }

    fn record(&self, action: &str) {
        self.db.borrow_mut().log.push(format!("{}:{action}", self.name));
    }
}

impl RowSource for MemoryNode {
    fn select(&mut self, statement: &Statement) -> Result<Vec<DataRow>> {
        let db = self.db.borrow();
        // Every fetch hands out new snapshot versions, like a fresh result set.
        Ok(db
            .rows(&statement.table)
            .iter()
            .filter(|row| matches(row, &statement.qualifier))
            .map(|row| row.iter().map(|(c, v)| (c.to_string(), v.clone())).collect::<DataRow>())
            .collect())
    }
}

impl StatementExecutor for MemoryNode {
    fn execute(&mut self, statement: &Statement) -> Result<u64> {
        let mut db = self.db.borrow_mut();
        db.statements.push(statement.clone());
        let rows = db.tables.entry(statement.table.clone()).or_default();
        let count = match statement.kind {
            StatementKind::Insert => {
                rows.push(statement.values.clone());
                1
            }
            StatementKind::Update => {
                let mut count = 0;
                for row in rows.iter_mut().filter(|r| matches(r, &statement.qualifier)) {
                    for (column, value) in statement.values.iter() {
                        row.insert(column, value.clone());
                    }
                    count += 1;
                }
                count
            }
            StatementKind::Delete => {
                let before = rows.len();
                rows.retain(|r| !matches(r, &statement.qualifier));
                (before - rows.len()) as u64
            }
            StatementKind::Select => {
                return Err(Error::query(Some(statement.sql.as_str()), "SELECT passed to execute"));
            }
        };
        Ok(count)
    }

    fn generate_primary_key(&mut self, entity: &EntityDescriptor) -> Result<Value> {
        let mut db = self.db.borrow_mut();
        let next = db.keys.entry(entity.table.clone()).or_insert(100);
        *next += 1;
        Ok(Value::Int(*next))
    }
}

impl TransactionalConnection for MemoryNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.backup = if auto_commit {
            None
        } else {
            Some(self.db.borrow().tables.clone())
        };
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.record("commit");
        if self.fail_commit {
            // The database aborts the transaction.
            if let Some(tables) = self.backup.take() {
                self.db.borrow_mut().tables = tables;
            }
            return Err(Error::query(None, format!("{} refused to commit", self.name)));
        }
        self.backup = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.record("rollback");
        if self.fail_rollback {
            return Err(Error::query(None, format!("{} refused to roll back", self.name)));
        }
        if let Some(tables) = self.backup.take() {
            self.db.borrow_mut().tables = tables;
        }
        Ok(())
    }
}

/// Artist, Painting and ArtGroup, with artists and groups linked through the
/// ARTIST_GROUP join table.
pub fn art_schema() -> Arc<Schema> {
    Arc::new(
        Schema::new()
            .with_entity(
                EntityDescriptor::new("Artist", "ARTIST")
                    .with_attribute(AttributeInfo::new("id", "ID").primary_key())
                    .with_attribute(AttributeInfo::new("name", "NAME"))
                    .with_attribute(AttributeInfo::new("version", "VERSION").used_for_locking())
                    .with_relationship(
                        RelationshipInfo::one_to_many("paintings", "Painting").join("ID", "ARTIST_ID"),
                    )
                    .with_relationship(RelationshipInfo::many_to_many(
                        "groups",
                        "ArtGroup",
                        LinkTableInfo::new("ARTIST_GROUP", "ARTIST_ID", "GROUP_ID"),
                    ))
                    .optimistic_locking(),
            )
            .with_entity(
                EntityDescriptor::new("Painting", "PAINTING")
                    .with_attribute(AttributeInfo::new("id", "ID").primary_key())
                    .with_attribute(AttributeInfo::new("title", "TITLE"))
                    .with_relationship(
                        RelationshipInfo::many_to_one("artist", "Artist").join("ARTIST_ID", "ID"),
                    ),
            )
            .with_entity(
                EntityDescriptor::new("ArtGroup", "ARTGROUP")
                    .with_attribute(AttributeInfo::new("id", "GROUP_ID").primary_key())
                    .with_attribute(AttributeInfo::new("name", "NAME"))
                    .with_relationship(RelationshipInfo::many_to_many(
                        "artists",
                        "Artist",
                        LinkTableInfo::new("ARTIST_GROUP", "GROUP_ID", "ARTIST_ID"),
                    )),
            ),
    )
}

/// A context over a single node of `db`.
pub fn context(db: &Rc<RefCell<Database>>) -> ObjectContext {
    let domain = DataDomain::new(art_schema()).with_node(Box::new(MemoryNode::new("main", db)));
    ObjectContext::new(domain).expect("schema is valid")
}

pub fn artist_row(id: i32, name: &str, version: i32) -> DataRow {
    DataRow::new()
        .with("ID", id)
        .with("NAME", name)
        .with("VERSION", version)
}

pub fn group_row(id: i32, name: &str) -> DataRow {
    DataRow::new().with("GROUP_ID", id).with("NAME", name)
}
