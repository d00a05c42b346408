//! End-to-end scenarios over the public API: unique constraints,
//! secondary indexes across restart, truncate, upsert squash, read
//! views, and range splits under compaction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use borealdb::config::BoxConfig;
use borealdb::db::{Db, SpaceConfig};
use borealdb::error::ErrorCode;
use borealdb::iterator::IteratorType;
use borealdb::keydef::{FieldType, KeyDef, KeyDefOpts, KeyPart};
use borealdb::msgpack;
use borealdb::space::{IndexDef, IndexKind, SpaceDef, SpaceHandler};
use borealdb::stmt::UPSERT_PENDING;

const SPACE: u32 = 512;

fn init_tracing() {
    let _ = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

fn key_def(parts: &[(u32, FieldType)], opts: KeyDefOpts) -> Arc<KeyDef> {
    Arc::new(KeyDef::new(
        parts
            .iter()
            .map(|&(field_no, field_type)| KeyPart {
                field_no,
                field_type,
            })
            .collect(),
        opts,
    ))
}

fn schema_with(
    secondaries: &[(u32, &[(u32, FieldType)])],
    opts: KeyDefOpts,
) -> Vec<SpaceConfig> {
    let mut indexes = vec![IndexDef {
        index_id: 0,
        name: "primary".into(),
        kind: IndexKind::Tree,
        key_def: key_def(&[(0, FieldType::Unsigned)], opts.clone()),
    }];
    for (index_id, parts) in secondaries {
        indexes.push(IndexDef {
            index_id: *index_id,
            name: format!("secondary{index_id}"),
            kind: IndexKind::Tree,
            key_def: key_def(parts, opts.clone()),
        });
    }
    vec![SpaceConfig {
        def: SpaceDef {
            id: SPACE,
            name: "t".into(),
            engine: "vinyl".into(),
            field_count: None,
            temporary: false,
        },
        indexes,
    }]
}

fn tuple_u(values: &[u64]) -> Vec<u8> {
    let mut buf = Vec::new();
    msgpack::write_array_len(&mut buf, values.len() as u32);
    for v in values {
        msgpack::write_uint(&mut buf, *v);
    }
    buf
}

fn key_u(v: u64) -> Vec<u8> {
    tuple_u(&[v])
}

fn decode_u(tuple: &[u8]) -> Vec<u64> {
    let (count, mut pos) = msgpack::read_array_len(tuple).unwrap();
    (0..count)
        .map(|_| {
            let (v, n) = msgpack::read_uint(&tuple[pos..]).unwrap();
            pos += n;
            v
        })
        .collect()
}

fn add_op(field: i64, arg: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    msgpack::write_array_len(&mut buf, 1);
    msgpack::write_array_len(&mut buf, 3);
    msgpack::write_str(&mut buf, "+");
    msgpack::write_int(&mut buf, field);
    msgpack::write_int(&mut buf, arg);
    buf
}

// ------------------------------------------------------------------------------------------------
// Scenario: unique constraint
// ------------------------------------------------------------------------------------------------

#[test]
fn unique_constraint_cites_the_index() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let db = Db::open(
        BoxConfig::rooted(tmp.path()),
        schema_with(&[], KeyDefOpts::default()),
    )
    .unwrap();
    let space = db.handler(SPACE);

    space.insert(&tuple_u(&[1, 2, 3])).unwrap();
    space.insert(&tuple_u(&[5, 8, 13])).unwrap();

    let err = space.insert(&tuple_u(&[1, 9, 9])).unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateKey);
    assert!(
        err.message.contains("primary") && err.message.contains('t'),
        "error must cite the index and space: {err}"
    );
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Scenario: secondary update, surviving restart
// ------------------------------------------------------------------------------------------------

#[test]
fn secondary_update_survives_restart() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let schema = || schema_with(&[(1, &[(1, FieldType::Unsigned)])], KeyDefOpts::default());

    {
        let db = Db::open(BoxConfig::rooted(tmp.path()), schema()).unwrap();
        let space = db.handler(SPACE);
        space.insert(&tuple_u(&[1, 2, 3])).unwrap();
        space.insert(&tuple_u(&[5, 8, 13])).unwrap();

        // Update through the secondary key {2}: `+ field 3, 3`.
        space.update(1, &key_u(2), &add_op(3, 3)).unwrap();
        let found = space.get(&key_u(1)).unwrap().unwrap();
        assert_eq!(decode_u(&found), vec![1, 2, 6]);
        db.close().unwrap();
    }

    let db = Db::open(BoxConfig::rooted(tmp.path()), schema()).unwrap();
    let space = db.handler(SPACE);
    let all = space.select(0, IteratorType::All, &[], 100).unwrap();
    let tuples: Vec<Vec<u64>> = all.iter().map(|t| decode_u(t)).collect();
    assert_eq!(tuples, vec![vec![1, 2, 6], vec![5, 8, 13]]);

    // The secondary also still resolves after restart.
    let by_secondary = space.select(1, IteratorType::Eq, &key_u(2), 10).unwrap();
    assert_eq!(by_secondary.len(), 1);
    assert_eq!(decode_u(&by_secondary[0]), vec![1, 2, 6]);
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Scenario: truncate
// ------------------------------------------------------------------------------------------------

#[test]
fn truncate_drops_all_rows() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let db = Db::open(
        BoxConfig::rooted(tmp.path()),
        schema_with(&[], KeyDefOpts::default()),
    )
    .unwrap();
    let space = db.handler(SPACE);

    space.insert(&tuple_u(&[44])).unwrap();
    db.truncate(SPACE).unwrap();
    space.insert(&tuple_u(&[55])).unwrap();

    let all = space.select(0, IteratorType::All, &[], 100).unwrap();
    let tuples: Vec<Vec<u64>> = all.iter().map(|t| decode_u(t)).collect();
    assert_eq!(tuples, vec![vec![55]]);
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Scenario: upsert squash
// ------------------------------------------------------------------------------------------------

#[test]
fn two_hundred_upserts_squash_in_background() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let db = Db::open(
        BoxConfig::rooted(tmp.path()),
        schema_with(&[], KeyDefOpts::default()),
    )
    .unwrap();
    let space = db.handler(SPACE);

    space.replace(&tuple_u(&[7, 0])).unwrap();
    // A checkpoint gives the key on-disk history, so the upserts stack
    // instead of materializing at write time.
    db.checkpoint().unwrap();

    for _ in 0..200 {
        space.upsert(&tuple_u(&[7, 0]), &add_op(2, 1)).unwrap();
    }

    let found = space.get(&key_u(7)).unwrap().unwrap();
    assert_eq!(decode_u(&found), vec![7, 200]);

    // The squash worker materializes the chain: eventually the newest
    // version of the key stops being "pending".
    let index = db.space(SPACE).unwrap();
    let lsm = Arc::clone(index.primary().unwrap().lsm());
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let range = lsm.find_range(&key_u(7)).unwrap();
        let newest = range
            .active_mem()
            .unwrap()
            .newest_visible(&key_u(7), i64::MAX)
            .unwrap();
        if newest.is_some_and(|s| s.n_upserts() != UPSERT_PENDING) {
            break;
        }
        assert!(Instant::now() < deadline, "squash never ran");
        std::thread::sleep(Duration::from_millis(50));
    }

    // The value is unchanged by the squash.
    let found = space.get(&key_u(7)).unwrap().unwrap();
    assert_eq!(decode_u(&found), vec![7, 200]);
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Scenario: read view
// ------------------------------------------------------------------------------------------------

#[test]
fn read_view_commits_without_conflict() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let db = Db::open(
        BoxConfig::rooted(tmp.path()),
        schema_with(&[], KeyDefOpts::default()),
    )
    .unwrap();
    let space = db.handler(SPACE);

    space.replace(&tuple_u(&[1, 100])).unwrap(); // v1

    let a = db.begin(true);
    space.replace(&tuple_u(&[1, 200])).unwrap(); // v2 commits under A

    let seen = a.get(SPACE, &key_u(1)).unwrap().unwrap();
    assert_eq!(decode_u(&seen), vec![1, 100], "A reads v1");
    a.commit().unwrap();

    let b = db.begin(true);
    let seen = b.get(SPACE, &key_u(1)).unwrap().unwrap();
    assert_eq!(decode_u(&seen), vec![1, 200], "a new tx sees v2");
    b.commit().unwrap();
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Scenario: split under compaction
// ------------------------------------------------------------------------------------------------

#[test]
fn compaction_splits_an_oversized_range() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    // Tiny ranges and pages so a handful of checkpoints produce runs
    // past the 4/3 split threshold.
    let opts = KeyDefOpts {
        range_size: 8 * 1024,
        page_size: 1024,
        compact_wm: 2,
        ..KeyDefOpts::default()
    };
    let db = Db::open(BoxConfig::rooted(tmp.path()), schema_with(&[], opts)).unwrap();
    let space = db.handler(SPACE);

    let index = db.space(SPACE).unwrap();
    let lsm = Arc::clone(index.primary().unwrap().lsm());

    let mut key = 0u64;
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        // Pour in a batch of fat tuples and checkpoint to force runs.
        for _ in 0..300 {
            space
                .replace(&tuple_u(&[key, key, key, key, key, key, key, key]))
                .unwrap();
            key += 1;
        }
        db.checkpoint().unwrap();

        if lsm.ranges().len() >= 2 {
            break;
        }
        assert!(Instant::now() < deadline, "range never split");
    }

    // The cover stays contiguous: first begin −∞, last end +∞, bounds
    // chained in between.
    let ranges = lsm.ranges();
    assert!(ranges[0].begin().is_none());
    assert!(ranges.last().unwrap().end().is_none());
    for pair in ranges.windows(2) {
        assert_eq!(
            pair[0].end().expect("inner bound"),
            pair[1].begin().expect("inner bound"),
            "cover must be contiguous"
        );
    }

    // Every key written is still readable.
    let all = space.select(0, IteratorType::All, &[], key as usize + 10).unwrap();
    assert_eq!(all.len(), key as usize);
    db.close().unwrap();
}
