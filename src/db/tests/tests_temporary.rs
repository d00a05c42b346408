#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::config::BoxConfig;
    use crate::db::tests::helpers::*;
    use crate::db::{Db, SpaceConfig};
    use crate::keydef::FieldType;
    use crate::replication::relay::RelaySource;
    use crate::space::{IndexDef, IndexKind, SpaceDef, SpaceHandler};
    use crate::vclock::Vclock;

    const TEMP_SPACE: u32 = 513;

    /// The usual test schema plus one temporary space.
    fn schema_with_temp() -> Vec<SpaceConfig> {
        let mut space_configs = schema(&[]);
        space_configs.push(SpaceConfig {
            def: SpaceDef {
                id: TEMP_SPACE,
                name: "scratch".into(),
                engine: "vinyl".into(),
                field_count: None,
                temporary: true,
            },
            indexes: vec![IndexDef {
                index_id: 0,
                name: "pk".into(),
                kind: IndexKind::Tree,
                key_def: key_def(&[(0, FieldType::Unsigned)]),
            }],
        });
        space_configs
    }

    #[test]
    fn temporary_writes_stay_out_of_wal_and_replication() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = Db::open(BoxConfig::rooted(tmp.path()), schema_with_temp()).unwrap();

        let persistent = db.handler(SPACE);
        let scratch = db.handler(TEMP_SPACE);
        persistent.replace(&tuple_u(&[1, 1])).unwrap();
        scratch.replace(&tuple_u(&[2, 2])).unwrap();

        // Both are readable within this instance.
        assert!(persistent.get(&key_u(1)).unwrap().is_some());
        assert!(scratch.get(&key_u(2)).unwrap().is_some());

        // The replication feed carries the persistent write only.
        let rows = db.rows_since(&Vclock::new()).unwrap();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|row| row.space_id == Some(SPACE)));
        db.close().unwrap();
    }

    #[test]
    fn mixed_commit_logs_only_the_persistent_half() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = Db::open(BoxConfig::rooted(tmp.path()), schema_with_temp()).unwrap();

        // One transaction spanning both spaces of the engine.
        let tx = db.begin(false);
        tx.replace(SPACE, &tuple_u(&[1, 10])).unwrap();
        tx.replace(TEMP_SPACE, &tuple_u(&[1, 20])).unwrap();
        tx.commit().unwrap();

        let rows = db.rows_since(&Vclock::new()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].space_id, Some(SPACE));

        // Both halves are visible in memory regardless.
        assert!(db.handler(SPACE).get(&key_u(1)).unwrap().is_some());
        assert!(db.handler(TEMP_SPACE).get(&key_u(1)).unwrap().is_some());
        db.close().unwrap();
    }

    #[test]
    fn temporary_space_is_empty_after_restart() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        {
            let db = Db::open(BoxConfig::rooted(tmp.path()), schema_with_temp()).unwrap();
            db.handler(SPACE).replace(&tuple_u(&[1, 1])).unwrap();
            db.handler(TEMP_SPACE).replace(&tuple_u(&[2, 2])).unwrap();
            // Clean shutdown: the checkpoint must not smuggle the
            // temporary content into a snapshot or a run.
            db.close().unwrap();
        }

        let db = Db::open(BoxConfig::rooted(tmp.path()), schema_with_temp()).unwrap();
        assert!(db.handler(SPACE).get(&key_u(1)).unwrap().is_some());
        assert!(
            db.handler(TEMP_SPACE).get(&key_u(2)).unwrap().is_none(),
            "temporary content must not survive a restart"
        );
        db.close().unwrap();
    }
}
