//! Interned queries.

mod common;

use std::sync::Arc;

use common::TestDb;
use memoflow::{
    Database, DerivedStorage, Durability, InputQuery, InputStorage, InternId, InternKey,
    InternedStorage, Query, QueryFunction, QueryResult, TableEntry,
};

// ============================================================================
// Queries
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct NameId(InternId);

impl InternKey for NameId {
    fn from_intern_id(id: InternId) -> Self {
        NameId(id)
    }

    fn as_intern_id(&self) -> InternId {
        self.0
    }
}

struct InternName;

impl Query for InternName {
    type Key = String;
    type Value = NameId;
    type Storage = InternedStorage<Self>;

    const GROUP_INDEX: u16 = 0;
    const QUERY_INDEX: u16 = 0;
    const NAME: &'static str = "intern_name";
}

/// Length of an interned name.
struct NameLen;

impl Query for NameLen {
    type Key = NameId;
    type Value = usize;
    type Storage = DerivedStorage<Self>;

    const GROUP_INDEX: u16 = 0;
    const QUERY_INDEX: u16 = 1;
    const NAME: &'static str = "name_len";
}

impl QueryFunction<TestDb> for NameLen {
    fn execute(db: &TestDb, id: &NameId) -> QueryResult<usize> {
        db.log("name_len");
        Ok(db.query::<InternName>().lookup(*id).len())
    }

    fn value_eq(old_value: &usize, new_value: &usize) -> bool {
        old_value == new_value
    }
}

struct Unrelated;

impl Query for Unrelated {
    type Key = ();
    type Value = u8;
    type Storage = InputStorage<Self>;

    const GROUP_INDEX: u16 = 0;
    const QUERY_INDEX: u16 = 2;
    const NAME: &'static str = "unrelated";
}

impl InputQuery for Unrelated {}

fn database() -> TestDb {
    TestDb::new(|builder| {
        builder
            .query::<InternName>()
            .query::<NameLen>()
            .query::<Unrelated>()
    })
}

fn intern(db: &TestDb, name: &str) -> NameId {
    match db.query::<InternName>().get(name.to_string()) {
        Ok(id) => *id,
        Err(error) => panic!("interning cannot fail outside a write: {error}"),
    }
}

// ============================================================================
// Interning
// ============================================================================

#[test]
fn test_interning_is_idempotent() {
    let db = database();
    let foo = intern(&db, "foo");
    let bar = intern(&db, "bar");

    assert_eq!(intern(&db, "foo"), foo);
    assert_ne!(foo, bar);
    assert_eq!(foo.0.as_u32(), 0);
    assert_eq!(bar.0.as_u32(), 1);
}

#[test]
fn test_lookup_returns_original_key() {
    let db = database();
    let foo = intern(&db, "foo");
    assert_eq!(db.query::<InternName>().lookup(foo), "foo");
}

#[test]
fn test_entries_and_durability() {
    let db = database();
    let foo = intern(&db, "foo");
    let bar = intern(&db, "bar");

    assert_eq!(
        db.query::<InternName>().entries(),
        vec![
            TableEntry {
                key: "foo".to_string(),
                value: Some(Arc::new(foo)),
            },
            TableEntry {
                key: "bar".to_string(),
                value: Some(Arc::new(bar)),
            },
        ]
    );
    assert_eq!(
        db.query::<InternName>().durability(&"foo".to_string()),
        Some(Durability::HIGH)
    );
    assert_eq!(db.query::<InternName>().durability(&"baz".to_string()), None);
}

#[test]
fn test_interning_does_not_start_a_revision() {
    let db = database();
    let before = db.runtime().current_revision();
    intern(&db, "foo");
    assert_eq!(db.runtime().current_revision(), before);
}

// ============================================================================
// Dependents
// ============================================================================

#[test]
fn test_readers_of_interned_values_are_high_durability() -> anyhow::Result<()> {
    let mut db = database();
    let foo = intern(&db, "foo");
    assert_eq!(*db.query::<NameLen>().get(foo)?, 3);
    assert_eq!(db.query::<NameLen>().durability(&foo), Some(Durability::HIGH));

    db.query_mut::<Unrelated>().set((), 1);
    db.clear_events();
    assert_eq!(*db.query::<NameLen>().get(foo)?, 3);
    assert_eq!(db.take_log(), vec!["name_len"]);
    assert_eq!(db.validated(), vec!["name_len(NameId(InternId(0)))"]);
    Ok(())
}

#[test]
#[should_panic(expected = "InternId(0) is unknown to interned query `intern_name`")]
fn test_lookup_after_sweep_panics() {
    let mut db = database();
    let foo = intern(&db, "foo");
    db.query_mut::<InternName>().sweep_all();
    db.query::<InternName>().lookup(foo);
}
