#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::keydef::{FieldType, KeyDef, KeyDefOpts, KeyPart};
    use crate::msgpack;
    use crate::quota::Quota;
    use crate::range::LsmIndex;
    use crate::scheduler::Scheduler;
    use crate::stmt::Statement;
    use crate::tx::TxManager;

    fn key_def() -> Arc<KeyDef> {
        Arc::new(KeyDef::new(
            vec![KeyPart {
                field_no: 0,
                field_type: FieldType::Unsigned,
            }],
            KeyDefOpts {
                page_size: 1024,
                compact_wm: 2,
                ..KeyDefOpts::default()
            },
        ))
    }

    fn tuple_u(values: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        msgpack::write_array_len(&mut buf, values.len() as u32);
        for v in values {
            msgpack::write_uint(&mut buf, *v);
        }
        buf
    }

    fn fill(index: &Arc<LsmIndex>, keys: std::ops::Range<u64>, lsn_base: i64) {
        for k in keys {
            let stmt = Statement::new_replace(&tuple_u(&[k, k]));
            stmt.set_lsn(lsn_base + k as i64);
            index.set(stmt).unwrap();
        }
    }

    #[test]
    fn checkpoint_triggers_dump_to_disk() {
        let tmp = TempDir::new().unwrap();
        let index = LsmIndex::open(tmp.path(), 512, 0, key_def(), Uuid::new_v4()).unwrap();
        let quota = Arc::new(Quota::new(1 << 30));
        let manager = TxManager::new();

        let mut scheduler = Scheduler::start(2, Arc::clone(&quota), Arc::clone(&manager));
        scheduler.register_index(Arc::clone(&index));

        fill(&index, 0..100, 1000);
        manager.set_lsn(1100);

        scheduler.begin_checkpoint(1100);
        assert!(
            scheduler.wait_checkpoint(1100, Duration::from_secs(10)),
            "dump did not complete in time"
        );

        let ranges = index.ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].run_count(), 1);
        assert!(ranges[0].frozen_mems().unwrap().is_empty());
        assert!(ranges[0].active_mem().unwrap().is_empty());

        let (dumps, _) = scheduler.stats();
        assert!(dumps >= 1);
        scheduler.stop();
    }

    #[test]
    fn repeated_dumps_reach_compaction() {
        let tmp = TempDir::new().unwrap();
        let index = LsmIndex::open(tmp.path(), 512, 0, key_def(), Uuid::new_v4()).unwrap();
        let quota = Arc::new(Quota::new(1 << 30));
        let manager = TxManager::new();

        let mut scheduler = Scheduler::start(2, Arc::clone(&quota), Arc::clone(&manager));
        scheduler.register_index(Arc::clone(&index));

        // Two dump cycles leave two runs; the watermark is 2, so a
        // compaction should merge them into one.
        fill(&index, 0..50, 1000);
        manager.set_lsn(1050);
        scheduler.begin_checkpoint(1050);
        assert!(scheduler.wait_checkpoint(1050, Duration::from_secs(10)));

        fill(&index, 50..100, 2000);
        manager.set_lsn(2100);
        scheduler.begin_checkpoint(2100);
        assert!(scheduler.wait_checkpoint(2100, Duration::from_secs(10)));

        // Wait for the compaction to land.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let ranges = index.ranges();
            let total_runs: usize = ranges.iter().map(|r| r.run_count()).sum();
            let busy = ranges.iter().any(|r| r.is_busy());
            if total_runs <= 1 && !busy {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "compaction did not run (runs = {total_runs})"
            );
            std::thread::sleep(Duration::from_millis(20));
        }

        let (_, compactions) = scheduler.stats();
        assert!(compactions >= 1);
        scheduler.stop();

        // All hundred keys survive the merge.
        let mut reader = crate::iterator::ReadIterator::new(
            Arc::clone(&index),
            crate::iterator::IteratorType::Ge,
            &[],
            i64::MAX,
            None,
        );
        let mut count = 0;
        while reader.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 100);
    }
}
