//! A small key-value interpreter built from runtime effects.
//!
//! Commands are described as data, interpreted into `IO` values over a
//! shared `Ref`, and sequenced with `flat_map`.

use std::collections::HashMap;

use ember_runtime::{Error, Ref, IO};
use pretty_assertions::assert_eq;

#[derive(Debug, Clone)]
enum Command {
    Put(String, i64),
    Get(String),
    Update(String, i64),
    Delete(String),
}

type Store = Ref<HashMap<String, i64>>;

fn interpret(store: &Store, command: Command) -> IO<Option<i64>> {
    match command {
        Command::Put(key, value) => store
            .update(move |mut map| {
                map.insert(key.clone(), value);
                map
            })
            .as_(None),
        Command::Get(key) => store.get().map(move |map| map.get(&key).copied()),
        Command::Update(key, delta) => store.modify(move |mut map| {
            let next = map.get(&key).map(|v| v + delta);
            if let Some(v) = next {
                map.insert(key.clone(), v);
            }
            (map, next)
        }),
        Command::Delete(key) => store.modify(move |mut map| {
            let removed = map.remove(&key);
            (map, removed)
        }),
    }
}

fn run_script(store: Store, script: Vec<Command>) -> IO<Vec<Option<i64>>> {
    script.into_iter().fold(IO::pure(Vec::new()), move |acc, command| {
        let store = store.clone();
        acc.flat_map(move |mut results| {
            interpret(&store, command).map(move |r| {
                results.push(r);
                results
            })
        })
    })
}

#[test]
fn test_put_update_get_delete() {
    let key = || "k".to_string();
    let script = vec![
        Command::Put(key(), 2),
        Command::Update(key(), 1),
        Command::Get(key()),
        Command::Delete(key()),
        Command::Get(key()),
    ];

    let results = Ref::of(HashMap::new())
        .flat_map(move |store| run_script(store, script))
        .unsafe_run_sync()
        .unwrap();

    assert_eq!(results, vec![None, Some(3), Some(3), Some(3), None]);
}

#[test]
fn test_update_missing_key_is_none() {
    let store: Store = Ref::new(HashMap::new());
    let r = interpret(&store, Command::Update("absent".into(), 5))
        .unsafe_run_sync()
        .unwrap();
    assert_eq!(r, None);
}

#[test]
fn test_failure_in_script_stops_it() {
    let store: Store = Ref::new(HashMap::new());
    let s = store.clone();
    let program = interpret(&store, Command::Put("a".into(), 1))
        .then(IO::<Option<i64>>::raise_error(Error::msg("disk full")))
        .then(interpret(&s, Command::Put("b".into(), 2)));

    assert!(program.unsafe_run_sync().is_err());
    let map = store.get().unsafe_run_sync().unwrap();
    assert_eq!(map.get("a"), Some(&1));
    assert_eq!(map.get("b"), None);
}

#[test]
fn test_concurrent_updates_do_not_lose_writes() {
    let store: Store = Ref::new(HashMap::new());
    let fibers: Vec<_> = (0..8)
        .map(|_| {
            let s = store.clone();
            let work = (0..100).fold(IO::unit(), move |acc, _| {
                let s = s.clone();
                acc.then(
                    s.update(|mut map| {
                        *map.entry("hits".to_string()).or_insert(0) += 1;
                        map
                    }),
                )
            });
            work.start().unsafe_run_sync().unwrap()
        })
        .collect();

    for fiber in fibers {
        fiber.join().unsafe_run_sync().unwrap();
    }
    let map = store.get().unsafe_run_sync().unwrap();
    assert_eq!(map.get("hits"), Some(&800));
}
