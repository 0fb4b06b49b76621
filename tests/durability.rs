//! Durability-based validation and its interaction with backdating.

mod common;

use common::TestDb;
use memoflow::{
    Database, DerivedStorage, Durability, InputQuery, InputStorage, Query, QueryFunction,
    QueryResult,
};

// ============================================================================
// Queries
// ============================================================================

struct Config;

impl Query for Config {
    type Key = ();
    type Value = i64;
    type Storage = InputStorage<Self>;

    const GROUP_INDEX: u16 = 0;
    const QUERY_INDEX: u16 = 0;
    const NAME: &'static str = "config";
}

impl InputQuery for Config {
    const DEFAULT_DURABILITY: Durability = Durability::HIGH;
}

struct Edit;

impl Query for Edit {
    type Key = ();
    type Value = i64;
    type Storage = InputStorage<Self>;

    const GROUP_INDEX: u16 = 0;
    const QUERY_INDEX: u16 = 1;
    const NAME: &'static str = "edit";
}

impl InputQuery for Edit {}

struct Mid;

impl Query for Mid {
    type Key = ();
    type Value = i64;
    type Storage = DerivedStorage<Self>;

    const GROUP_INDEX: u16 = 0;
    const QUERY_INDEX: u16 = 2;
    const NAME: &'static str = "mid";
}

impl QueryFunction<TestDb> for Mid {
    fn execute(db: &TestDb, _: &()) -> QueryResult<i64> {
        db.log("mid");
        Ok(*db.query::<Config>().get(())? + 1)
    }

    fn value_eq(old_value: &i64, new_value: &i64) -> bool {
        old_value == new_value
    }
}

struct Top;

impl Query for Top {
    type Key = ();
    type Value = i64;
    type Storage = DerivedStorage<Self>;

    const GROUP_INDEX: u16 = 0;
    const QUERY_INDEX: u16 = 3;
    const NAME: &'static str = "top";
}

impl QueryFunction<TestDb> for Top {
    fn execute(db: &TestDb, _: &()) -> QueryResult<i64> {
        db.log("top");
        Ok(*db.query::<Mid>().get(())? * 10)
    }

    fn value_eq(old_value: &i64, new_value: &i64) -> bool {
        old_value == new_value
    }
}

struct Source;

impl Query for Source {
    type Key = ();
    type Value = i64;
    type Storage = InputStorage<Self>;

    const GROUP_INDEX: u16 = 1;
    const QUERY_INDEX: u16 = 0;
    const NAME: &'static str = "source";
}

impl InputQuery for Source {}

struct UseSource;

impl Query for UseSource {
    type Key = ();
    type Value = i64;
    type Storage = DerivedStorage<Self>;

    const GROUP_INDEX: u16 = 1;
    const QUERY_INDEX: u16 = 1;
    const NAME: &'static str = "use_source";
}

impl QueryFunction<TestDb> for UseSource {
    fn execute(db: &TestDb, _: &()) -> QueryResult<i64> {
        db.log("use_source");
        Ok(*db.query::<Source>().get(())?)
    }

    fn value_eq(old_value: &i64, new_value: &i64) -> bool {
        old_value == new_value
    }
}

struct Consumer;

impl Query for Consumer {
    type Key = ();
    type Value = i64;
    type Storage = DerivedStorage<Self>;

    const GROUP_INDEX: u16 = 1;
    const QUERY_INDEX: u16 = 2;
    const NAME: &'static str = "consumer";
}

impl QueryFunction<TestDb> for Consumer {
    fn execute(db: &TestDb, _: &()) -> QueryResult<i64> {
        db.log("consumer");
        Ok(*db.query::<UseSource>().get(())? - 1)
    }

    fn value_eq(old_value: &i64, new_value: &i64) -> bool {
        old_value == new_value
    }
}

fn database() -> TestDb {
    TestDb::new(|builder| {
        builder
            .query::<Config>()
            .query::<Edit>()
            .query::<Mid>()
            .query::<Top>()
            .query::<Source>()
            .query::<UseSource>()
            .query::<Consumer>()
    })
}

// ============================================================================
// Short-circuit validation
// ============================================================================

#[test]
fn test_low_write_skips_high_durability_dependencies() -> anyhow::Result<()> {
    let mut db = database();
    db.query_mut::<Config>().set((), 4);
    db.query_mut::<Edit>().set((), 0);

    assert_eq!(*db.query::<Top>().get(())?, 50);
    assert_eq!(db.query::<Top>().durability(&()), Some(Durability::HIGH));
    db.take_log();

    db.query_mut::<Edit>().set((), 1);
    db.clear_events();
    assert_eq!(*db.query::<Top>().get(())?, 50);

    // `mid` is never visited: the durability check alone verifies `top`.
    assert!(db.take_log().is_empty());
    assert_eq!(db.validated(), vec!["top(())"]);
    Ok(())
}

#[test]
fn test_high_synthetic_write_validates_deeply() -> anyhow::Result<()> {
    let mut db = database();
    db.query_mut::<Config>().set((), 4);
    db.query::<Top>().get(())?;
    db.take_log();

    db.synthetic_write(Durability::HIGH);
    db.clear_events();
    assert_eq!(*db.query::<Top>().get(())?, 50);
    assert!(db.take_log().is_empty());
    assert_eq!(db.validated(), vec!["mid(())", "top(())"]);
    Ok(())
}

#[test]
fn test_high_write_recomputes() -> anyhow::Result<()> {
    let mut db = database();
    db.query_mut::<Config>().set((), 4);
    db.query::<Top>().get(())?;
    db.take_log();

    db.query_mut::<Config>().set((), 5);
    assert_eq!(*db.query::<Top>().get(())?, 60);
    assert_eq!(db.take_log(), vec!["mid", "top"]);
    Ok(())
}

#[test]
fn test_lowering_an_input_reaches_its_old_readers() -> anyhow::Result<()> {
    let mut db = database();
    db.query_mut::<Config>().set((), 4);
    db.query::<Mid>().get(())?;
    db.take_log();

    // The new value is low durability, but `mid` was verified under the old
    // high durability and must still notice the change.
    db.query_mut::<Config>()
        .set_with_durability((), 7, Durability::LOW);
    assert_eq!(*db.query::<Mid>().get(())?, 8);
    assert_eq!(db.take_log(), vec!["mid"]);
    assert_eq!(db.query::<Mid>().durability(&()), Some(Durability::LOW));
    Ok(())
}

// ============================================================================
// Backdating across durability changes
// ============================================================================

#[test]
fn test_equal_value_is_backdated_at_same_durability() -> anyhow::Result<()> {
    let mut db = database();
    db.query_mut::<Source>().set((), 1);
    assert_eq!(*db.query::<Consumer>().get(())?, 0);
    db.take_log();

    db.query_mut::<Source>().set((), 1);
    assert_eq!(*db.query::<Consumer>().get(())?, 0);
    assert_eq!(db.take_log(), vec!["use_source"]);
    Ok(())
}

#[test]
fn test_backdating_is_refused_when_durability_drops() -> anyhow::Result<()> {
    let mut db = database();
    db.query_mut::<Source>()
        .set_with_durability((), 1, Durability::HIGH);
    assert_eq!(*db.query::<Consumer>().get(())?, 0);
    assert_eq!(db.query::<Consumer>().durability(&()), Some(Durability::HIGH));
    db.take_log();

    db.query_mut::<Source>()
        .set_with_durability((), 1, Durability::LOW);
    assert_eq!(*db.query::<Consumer>().get(())?, 0);

    // `use_source` produced the same value but lost durability, so it counts
    // as changed and `consumer` runs again with the lower durability.
    assert_eq!(db.take_log(), vec!["use_source", "consumer"]);
    assert_eq!(db.query::<Consumer>().durability(&()), Some(Durability::LOW));

    // From now on low writes reach `consumer` through deep validation.
    db.query_mut::<Edit>().set((), 3);
    db.clear_events();
    assert_eq!(*db.query::<Consumer>().get(())?, 0);
    assert!(db.take_log().is_empty());
    assert_eq!(db.validated(), vec!["use_source(())", "consumer(())"]);
    Ok(())
}
