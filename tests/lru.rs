//! LRU eviction of derived values.

mod common;

use common::TestDb;
use memoflow::{
    Database, DerivedStorage, InputQuery, InputStorage, Query, QueryFunction, QueryResult,
};

// ============================================================================
// Queries
// ============================================================================

struct Source;

impl Query for Source {
    type Key = u32;
    type Value = i64;
    type Storage = InputStorage<Self>;

    const GROUP_INDEX: u16 = 0;
    const QUERY_INDEX: u16 = 0;
    const NAME: &'static str = "source";
}

impl InputQuery for Source {
    fn default_value(key: &u32) -> Option<i64> {
        Some(i64::from(*key))
    }
}

struct Square;

impl Query for Square {
    type Key = u32;
    type Value = i64;
    type Storage = DerivedStorage<Self>;

    const GROUP_INDEX: u16 = 0;
    const QUERY_INDEX: u16 = 1;
    const NAME: &'static str = "square";
}

impl QueryFunction<TestDb> for Square {
    fn execute(db: &TestDb, key: &u32) -> QueryResult<i64> {
        db.log(format!("square {key}"));
        let value = *db.query::<Source>().get(*key)?;
        Ok(value * value)
    }

    fn value_eq(old_value: &i64, new_value: &i64) -> bool {
        old_value == new_value
    }
}

/// Sum of the squares of 1, 2 and 3.
struct Total;

impl Query for Total {
    type Key = ();
    type Value = i64;
    type Storage = DerivedStorage<Self>;

    const GROUP_INDEX: u16 = 0;
    const QUERY_INDEX: u16 = 2;
    const NAME: &'static str = "total";
}

impl QueryFunction<TestDb> for Total {
    fn execute(db: &TestDb, _: &()) -> QueryResult<i64> {
        db.log("total");
        let mut total = 0;
        for key in 1..=3 {
            total += *db.query::<Square>().get(key)?;
        }
        Ok(total)
    }

    fn value_eq(old_value: &i64, new_value: &i64) -> bool {
        old_value == new_value
    }
}

struct Other;

impl Query for Other {
    type Key = ();
    type Value = i64;
    type Storage = InputStorage<Self>;

    const GROUP_INDEX: u16 = 0;
    const QUERY_INDEX: u16 = 3;
    const NAME: &'static str = "other";
}

impl InputQuery for Other {}

/// Untracked for odd keys, so those can never be revalidated without their
/// value.
struct Ticket;

impl Query for Ticket {
    type Key = u32;
    type Value = u32;
    type Storage = DerivedStorage<Self>;

    const GROUP_INDEX: u16 = 0;
    const QUERY_INDEX: u16 = 4;
    const NAME: &'static str = "ticket";
}

impl QueryFunction<TestDb> for Ticket {
    fn execute(db: &TestDb, key: &u32) -> QueryResult<u32> {
        if key % 2 == 1 {
            db.runtime().report_untracked_read();
        }
        Ok(*key)
    }

    fn value_eq(_: &u32, _: &u32) -> bool {
        false
    }
}

fn database() -> TestDb {
    TestDb::new(|builder| {
        builder
            .query::<Source>()
            .query::<Square>()
            .query::<Total>()
            .query::<Other>()
            .query::<Ticket>()
            .lru_capacity::<Square>(2)
            .lru_capacity::<Ticket>(1)
    })
}

/// Keys of `square` that currently hold a value.
fn resident_squares(db: &TestDb) -> Vec<u32> {
    db.query::<Square>()
        .entries()
        .into_iter()
        .filter(|entry| entry.value.is_some())
        .map(|entry| entry.key)
        .collect()
}

// ============================================================================
// Eviction
// ============================================================================

#[test]
fn test_least_recently_used_value_is_evicted() -> anyhow::Result<()> {
    let db = database();
    assert_eq!(*db.query::<Total>().get(())?, 14);
    assert_eq!(resident_squares(&db), vec![2, 3]);
    assert_eq!(db.query::<Square>().entries().len(), 3);
    Ok(())
}

#[test]
fn test_evicted_value_still_validates() -> anyhow::Result<()> {
    let mut db = database();
    db.query::<Total>().get(())?;
    db.take_log();

    db.query_mut::<Other>().set((), 1);
    db.clear_events();
    assert_eq!(*db.query::<Total>().get(())?, 14);

    // `square 1` has no value, but its dependencies are unchanged.
    assert!(db.take_log().is_empty());
    assert_eq!(
        db.validated(),
        vec!["square(1)", "square(2)", "square(3)", "total(())"]
    );
    Ok(())
}

#[test]
fn test_evicted_value_is_recomputed_on_read() -> anyhow::Result<()> {
    let db = database();
    db.query::<Total>().get(())?;
    db.take_log();

    assert_eq!(*db.query::<Square>().get(1)?, 1);
    assert_eq!(db.take_log(), vec!["square 1"]);
    assert_eq!(resident_squares(&db), vec![1, 3]);

    assert_eq!(*db.query::<Square>().get(3)?, 9);
    assert!(db.take_log().is_empty());
    Ok(())
}

#[test]
fn test_changed_input_reaches_evicted_reader() -> anyhow::Result<()> {
    let mut db = database();
    db.query::<Total>().get(())?;
    db.take_log();

    db.query_mut::<Source>().set(1, 5);
    assert_eq!(*db.query::<Total>().get(())?, 38);

    // Three keys cycling through a capacity of two: each read evicts the
    // next key, which then re-executes with its old change revision.
    assert_eq!(
        db.take_log(),
        vec!["total", "square 1", "square 2", "square 3"]
    );
    assert_eq!(resident_squares(&db), vec![2, 3]);
    Ok(())
}

// ============================================================================
// Capacity
// ============================================================================

#[test]
fn test_shrinking_capacity_evicts() -> anyhow::Result<()> {
    let mut db = database();
    db.query::<Total>().get(())?;

    db.query_mut::<Square>().set_lru_capacity(1);
    assert_eq!(resident_squares(&db), vec![3]);
    Ok(())
}

#[test]
fn test_zero_capacity_keeps_everything() -> anyhow::Result<()> {
    let mut db = database();
    db.query_mut::<Square>().set_lru_capacity(0);
    db.query::<Total>().get(())?;
    assert_eq!(resident_squares(&db), vec![1, 2, 3]);
    Ok(())
}

/// Keys of `ticket` that currently hold a value.
fn resident_tickets(db: &TestDb) -> Vec<u32> {
    db.query::<Ticket>()
        .entries()
        .into_iter()
        .filter(|entry| entry.value.is_some())
        .map(|entry| entry.key)
        .collect()
}

#[test]
fn test_untracked_values_are_not_evicted() -> anyhow::Result<()> {
    let db = database();
    db.query::<Ticket>().get(1)?;
    db.query::<Ticket>().get(3)?;
    assert_eq!(resident_tickets(&db), vec![1, 3]);
    Ok(())
}

#[test]
fn test_untracked_values_do_not_count_against_capacity() -> anyhow::Result<()> {
    let db = database();
    db.query::<Ticket>().get(2)?;
    db.query::<Ticket>().get(1)?;
    db.query::<Ticket>().get(3)?;
    // The only evictable value still fits in a capacity of one.
    assert_eq!(resident_tickets(&db), vec![2, 1, 3]);

    db.query::<Ticket>().get(4)?;
    assert_eq!(resident_tickets(&db), vec![1, 3, 4]);
    Ok(())
}

#[test]
#[should_panic(expected = "register query `square` before configuring its LRU capacity")]
fn test_capacity_before_registration_panics() {
    let _ = TestDb::new(|builder| builder.lru_capacity::<Square>(2).query::<Square>());
}
