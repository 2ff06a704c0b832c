//! Rows changed by one context reaching objects held by another.

mod support;

use relmap::prelude::*;
use support::{Database, artist_row, context};

fn two_contexts() -> (
    std::rc::Rc<std::cell::RefCell<Database>>,
    ObjectContext,
    ObjectContext,
    ObjectId,
) {
    let db = Database::shared();
    db.borrow_mut().insert("ARTIST", artist_row(1, "Monet", 1));
    let mut writer = context(&db);
    let mut reader = context(&db);
    let id = writer.fetch(&SelectQuery::new("Artist")).unwrap().remove(0);
    reader.fetch(&SelectQuery::new("Artist")).unwrap();
    (db, writer, reader, id)
}

#[test]
fn refetch_refreshes_committed_objects() {
    let (_db, mut writer, mut reader, id) = two_contexts();
    writer.set_value(&id, "name", "Claude Monet").unwrap();
    writer.commit_changes().unwrap();

    assert_eq!(reader.value(&id, "name").unwrap(), Value::from("Monet"));
    reader.fetch(&SelectQuery::new("Artist")).unwrap();
    assert_eq!(reader.value(&id, "name").unwrap(), Value::from("Claude Monet"));
    assert_eq!(reader.state(&id), PersistenceState::Committed);
}

#[test]
fn invalidated_objects_reload_on_next_read() {
    let (_db, mut writer, mut reader, id) = two_contexts();
    writer.set_value(&id, "name", "Claude Monet").unwrap();
    writer.commit_changes().unwrap();

    reader
        .store_mut()
        .process_invalidated_ids(std::slice::from_ref(&id))
        .unwrap();
    assert_eq!(reader.state(&id), PersistenceState::Hollow);
    assert_eq!(reader.value(&id, "name").unwrap(), Value::from("Claude Monet"));
    assert_eq!(reader.state(&id), PersistenceState::Committed);
}

#[test]
fn external_update_keeps_local_edit() {
    let (_db, mut writer, mut reader, id) = two_contexts();
    reader.set_value(&id, "name", "Oscar-Claude Monet").unwrap();

    writer.set_value(&id, "version", 2).unwrap();
    writer.commit_changes().unwrap();

    let fresh = writer.store().snapshot(&id).cloned().unwrap();
    reader.store_mut().process_updated_snapshot(&id, &fresh).unwrap();
    assert_eq!(reader.state(&id), PersistenceState::Modified);
    assert_eq!(reader.value(&id, "name").unwrap(), Value::from("Oscar-Claude Monet"));
    assert_eq!(reader.value(&id, "version").unwrap(), Value::Int(2));
}

#[test]
fn filter_follows_to_one_paths() {
    let db = Database::shared();
    {
        let mut db = db.borrow_mut();
        db.insert("ARTIST", artist_row(1, "Monet", 1));
        db.insert("ARTIST", artist_row(2, "Rembrandt", 1));
        db.insert(
            "PAINTING",
            DataRow::new().with("ID", 10).with("TITLE", "Lilies").with("ARTIST_ID", 1),
        );
        db.insert(
            "PAINTING",
            DataRow::new().with("ID", 11).with("TITLE", "Night Watch").with("ARTIST_ID", 2),
        );
    }
    let mut ctx = context(&db);
    ctx.fetch(&SelectQuery::new("Artist")).unwrap();
    let paintings = ctx.fetch(&SelectQuery::new("Painting")).unwrap();

    let qualifier = Expression::path("artist.name").like("M%").unwrap();
    assert_eq!(
        ctx.filter(&paintings, &qualifier),
        vec![ObjectId::single("Painting", "ID", 10)]
    );
    let negated = Expression::path("artist.name").like("M%").unwrap().not();
    assert_eq!(
        ctx.filter(&paintings, &negated),
        vec![ObjectId::single("Painting", "ID", 11)]
    );
}
