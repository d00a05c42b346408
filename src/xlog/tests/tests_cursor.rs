#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::msgpack;
    use crate::vclock::Vclock;
    use crate::xlog::{
        CursorState, FileType, Row, RowType, SyncMode, XlogCursor, XlogMeta, XlogWriter,
        ROW_INDEX_SPACE_ID,
    };

    fn meta(filetype: FileType) -> XlogMeta {
        XlogMeta {
            filetype,
            instance_uuid: Uuid::new_v4(),
            vclock: Vclock::new(),
        }
    }

    fn data_row(lsn: i64, value: u64) -> Row {
        let mut row = Row::new(RowType::Replace);
        row.lsn = lsn;
        row.space_id = Some(512);
        let mut tuple = Vec::new();
        msgpack::write_array_len(&mut tuple, 1);
        msgpack::write_uint(&mut tuple, value);
        row.tuple = Some(tuple);
        row
    }

    fn replay_all(path: &std::path::Path) -> Vec<Row> {
        let mut cursor = XlogCursor::open(path).unwrap();
        let mut rows = Vec::new();
        while cursor.next_tx().unwrap() {
            while let Some(row) = cursor.next_row().unwrap() {
                if row.space_id != Some(ROW_INDEX_SPACE_ID) {
                    rows.push(row);
                }
            }
        }
        assert_eq!(cursor.state(), CursorState::Eof);
        rows
    }

    #[test]
    fn write_and_replay_uncompressed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("00000000000000000000.xlog");

        let mut writer =
            XlogWriter::create(&path, &meta(FileType::Xlog), SyncMode::Write, false).unwrap();
        writer.write_tx(&[data_row(1, 10), data_row(2, 20)]).unwrap();
        writer.write_tx(&[data_row(3, 30)]).unwrap();
        writer.close().unwrap();

        let rows = replay_all(&path);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].lsn, 1);
        assert_eq!(rows[2].lsn, 3);
    }

    #[test]
    fn write_and_replay_compressed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("00000000000000000000.xlog");

        let mut writer =
            XlogWriter::create(&path, &meta(FileType::Xlog), SyncMode::Write, true).unwrap();
        let rows: Vec<Row> = (1..=100).map(|i| data_row(i, i as u64)).collect();
        writer.write_tx(&rows).unwrap();
        writer.close().unwrap();

        let replayed = replay_all(&path);
        assert_eq!(replayed.len(), 100);
        for (i, row) in replayed.iter().enumerate() {
            assert_eq!(row.lsn, i as i64 + 1);
        }
    }

    #[test]
    fn each_tx_carries_a_row_index() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("00000000000000000000.xlog");

        let mut writer =
            XlogWriter::create(&path, &meta(FileType::Xlog), SyncMode::Write, false).unwrap();
        writer.write_tx(&[data_row(1, 1), data_row(2, 2)]).unwrap();
        writer.close().unwrap();

        let mut cursor = XlogCursor::open(&path).unwrap();
        assert!(cursor.next_tx().unwrap());
        let mut rows = Vec::new();
        while let Some(row) = cursor.next_row().unwrap() {
            rows.push(row);
        }
        // 2 data rows + 1 row-index row.
        assert_eq!(rows.len(), 3);
        let index_row = rows.last().unwrap();
        assert_eq!(index_row.space_id, Some(ROW_INDEX_SPACE_ID));

        // The index tuple is [bin of u32 LE offsets], one per data row.
        let tuple = index_row.tuple.as_ref().unwrap();
        let (count, pos) = msgpack::read_array_len(tuple).unwrap();
        assert_eq!(count, 1);
        let (raw, _) = msgpack::read_bin(&tuple[pos..]).unwrap();
        assert_eq!(raw.len(), 2 * 4);
        let first = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        assert_eq!(first, 0);
    }

    #[test]
    fn filetype_check() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("00000000000000000000.snap");
        let writer =
            XlogWriter::create(&path, &meta(FileType::Snap), SyncMode::Write, false).unwrap();
        writer.close().unwrap();

        assert!(XlogCursor::open_expect(&path, FileType::Snap).is_ok());
        assert!(XlogCursor::open_expect(&path, FileType::Xlog).is_err());
    }

    #[test]
    fn meta_preserves_vclock() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("00000000000000000042.xlog");
        let mut m = meta(FileType::Xlog);
        m.vclock.follow(1, 42);
        let writer = XlogWriter::create(&path, &m, SyncMode::Write, false).unwrap();
        writer.close().unwrap();

        let cursor = XlogCursor::open(&path).unwrap();
        assert_eq!(cursor.meta().vclock.get(1), 42);
        assert_eq!(cursor.meta().instance_uuid, m.instance_uuid);
    }

    #[test]
    fn inprogress_file_is_invisible_until_close() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("00000000000000000000.xlog");
        let mut writer =
            XlogWriter::create(&path, &meta(FileType::Xlog), SyncMode::Write, false).unwrap();
        writer.write_tx(&[data_row(1, 1)]).unwrap();
        assert!(!path.exists());
        writer.close().unwrap();
        assert!(path.exists());
    }
}
