#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::keydef::{FieldType, KeyDef, KeyDefOpts, KeyPart};
    use crate::msgpack;
    use crate::range::LsmIndex;
    use crate::run::RunWriter;
    use crate::stmt::Statement;

    fn key_def() -> Arc<KeyDef> {
        Arc::new(KeyDef::new(
            vec![KeyPart {
                field_no: 0,
                field_type: FieldType::Unsigned,
            }],
            KeyDefOpts::default(),
        ))
    }

    fn key_u(v: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        msgpack::write_array_len(&mut buf, 1);
        msgpack::write_uint(&mut buf, v);
        buf
    }

    fn tuple_u(values: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        msgpack::write_array_len(&mut buf, values.len() as u32);
        for v in values {
            msgpack::write_uint(&mut buf, *v);
        }
        buf
    }

    /// Writes one run for `(range_id, run_id)` spanning `[begin, end)`
    /// with a couple of statements inside the bounds.
    fn write_run(
        dir: &std::path::Path,
        range_id: u32,
        run_id: u32,
        begin: Option<u64>,
        end: Option<u64>,
        keys: &[u64],
        lsn_base: i64,
    ) {
        let mut writer = RunWriter::new(
            dir,
            lsn_base,
            range_id,
            run_id,
            512,
            0,
            key_def(),
            4096,
            Uuid::new_v4(),
        )
        .unwrap();
        for (i, k) in keys.iter().enumerate() {
            let stmt = Statement::new_replace(&tuple_u(&[*k, 0]));
            stmt.set_lsn(lsn_base + i as i64);
            writer.write(&stmt).unwrap();
        }
        writer
            .finish(begin.map(key_u), end.map(key_u))
            .unwrap();
    }

    fn index_dir(root: &std::path::Path) -> std::path::PathBuf {
        root.join("512").join("0")
    }

    #[test]
    fn recovers_single_full_range() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(index_dir(tmp.path())).unwrap();
        write_run(&index_dir(tmp.path()), 1, 1, None, None, &[1, 2, 3], 10);

        let index = LsmIndex::open(tmp.path(), 512, 0, key_def(), Uuid::new_v4()).unwrap();
        let ranges = index.ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].run_count(), 1);
        assert_eq!(index.max_run_lsn_for(&key_u(2)).unwrap(), 12);
    }

    #[test]
    fn newer_range_images_supersede_older() {
        let tmp = TempDir::new().unwrap();
        let dir = index_dir(tmp.path());
        std::fs::create_dir_all(&dir).unwrap();

        // Old full-span range 1, then a completed split into 2 and 3.
        write_run(&dir, 1, 1, None, None, &[1, 50], 10);
        write_run(&dir, 2, 2, None, Some(10), &[1], 20);
        write_run(&dir, 3, 3, Some(10), None, &[50], 21);

        let index = LsmIndex::open(tmp.path(), 512, 0, key_def(), Uuid::new_v4()).unwrap();
        let ranges = index.ranges();
        // Range 1 is fully covered by 2 and 3 and must be discarded.
        assert_eq!(ranges.len(), 2);
        let ids: Vec<u32> = ranges.iter().map(|r| r.id).collect();
        assert!(ids.contains(&2) && ids.contains(&3), "got {ids:?}");
        assert!(ranges[0].end().is_some());
        assert!(ranges[1].begin().is_some());
    }

    #[test]
    fn incomplete_split_keeps_parent_for_missing_half() {
        let tmp = TempDir::new().unwrap();
        let dir = index_dir(tmp.path());
        std::fs::create_dir_all(&dir).unwrap();

        // Parent spans everything; only the left child got written
        // before the crash.
        write_run(&dir, 1, 1, None, None, &[1, 50], 10);
        write_run(&dir, 2, 2, None, Some(10), &[1], 20);

        let index = LsmIndex::open(tmp.path(), 512, 0, key_def(), Uuid::new_v4()).unwrap();
        let ranges = index.ranges();
        assert_eq!(ranges.len(), 2);

        // Left child keeps its bounds; the parent is clipped to the
        // uncovered right half so the cover has no overlap.
        assert!(ranges[0].begin().is_none());
        assert_eq!(ranges[0].end(), Some(key_u(10).as_slice()));
        assert_eq!(ranges[1].begin(), Some(key_u(10).as_slice()));
        assert!(ranges[1].end().is_none());

        // Keys on both sides resolve to some range.
        assert!(index.find_range(&key_u(1)).is_ok());
        assert!(index.find_range(&key_u(99)).is_ok());
    }

    #[test]
    fn gap_between_recovered_ranges_is_filled() {
        let tmp = TempDir::new().unwrap();
        let dir = index_dir(tmp.path());
        std::fs::create_dir_all(&dir).unwrap();

        // Two disjoint ranges with a hole between 10 and 20.
        write_run(&dir, 1, 1, None, Some(10), &[1], 10);
        write_run(&dir, 2, 2, Some(20), None, &[30], 11);

        let index = LsmIndex::open(tmp.path(), 512, 0, key_def(), Uuid::new_v4()).unwrap();
        let ranges = index.ranges();
        assert_eq!(ranges.len(), 3, "hole must be filled with an empty range");

        let middle = index.find_range(&key_u(15)).unwrap();
        assert_eq!(middle.run_count(), 0);
        assert_eq!(middle.begin(), Some(key_u(10).as_slice()));
        assert_eq!(middle.end(), Some(key_u(20).as_slice()));
    }

    #[test]
    fn runs_within_a_range_are_newest_first() {
        let tmp = TempDir::new().unwrap();
        let dir = index_dir(tmp.path());
        std::fs::create_dir_all(&dir).unwrap();

        write_run(&dir, 1, 1, None, None, &[1], 10);
        write_run(&dir, 1, 2, None, None, &[1], 20);

        let index = LsmIndex::open(tmp.path(), 512, 0, key_def(), Uuid::new_v4()).unwrap();
        let ranges = index.ranges();
        assert_eq!(ranges.len(), 1);
        let runs = ranges[0].runs().unwrap();
        assert_eq!(runs.len(), 2);
        // Higher run id = newer = first.
        assert_eq!(runs[0].id, 2);
        assert_eq!(runs[1].id, 1);
    }
}
