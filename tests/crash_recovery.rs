//! Crash Recovery Integration Tests
//!
//! Sessions interrupted without `stop()` must come back as recordings on the
//! next start, using the on-disk chunk store and catalog.

use std::sync::Arc;

use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use voxsync::capture::{ChannelDevice, Fragment};
use voxsync::core::{
    ChunkStore, FileChunkStore, Recorder, RecorderConfig, RecordingCatalog, SqliteCatalog,
};
use voxsync::domain::RecordingStatus;
use voxsync::EngineError;

struct Stores {
    chunks: Arc<FileChunkStore>,
    catalog: SqliteCatalog,
}

fn open_stores(temp: &TempDir) -> Stores {
    Stores {
        chunks: Arc::new(FileChunkStore::new(temp.path().join("chunks"))),
        catalog: SqliteCatalog::open(&temp.path().join("catalog.db"), 5).unwrap(),
    }
}

fn recorder(stores: &Stores) -> (Recorder, tokio::sync::mpsc::Sender<Fragment>) {
    let (device, tx) = ChannelDevice::new("test", "audio/webm", 16);
    let recorder = Recorder::new(
        stores.chunks.clone(),
        Arc::new(stores.catalog.clone()),
        Arc::new(device),
        RecorderConfig::default(),
    );
    (recorder, tx)
}

#[tokio::test]
async fn test_interrupted_session_is_recovered_on_restart() {
    let temp = TempDir::new().unwrap();

    // First run: capture two flushes, then "crash" without stopping
    let session_id = {
        let stores = open_stores(&temp);
        let (mut recorder, tx) = recorder(&stores);
        let session_id = assert_ok!(recorder.start().await);

        tx.send(Fragment::new(b"He".to_vec())).await.unwrap();
        assert_eq!(assert_ok!(recorder.flush().await), Some(0));
        tx.send(Fragment::new(b"llo".to_vec())).await.unwrap();
        assert_eq!(assert_ok!(recorder.flush().await), Some(1));

        // Unflushed data is lost in a crash
        tx.send(Fragment::new(b" world".to_vec())).await.unwrap();
        drop(recorder);
        session_id
    };

    // Second run over the same directories
    let stores = open_stores(&temp);
    let orphans = stores.chunks.list_orphan_sessions().await.unwrap();
    assert!(orphans.contains(&session_id));

    let (mut recorder, _tx) = recorder(&stores);
    let report = assert_ok!(recorder.recover().await);
    assert_eq!(report.recovered.len(), 1);

    let recording = stores
        .catalog
        .find_by_session(session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recording.status, RecordingStatus::Pending);
    assert!(recording.recovered);
    assert!(recording.file_name.ends_with("_recovered.webm"));
    assert_eq!(stores.catalog.payload(&recording.id).await.unwrap(), b"Hello");

    assert!(stores.chunks.list_by_session(session_id).await.unwrap().is_empty());
    assert!(!temp.path().join("chunks").join(session_id.to_string()).exists());
}

#[tokio::test]
async fn test_recovery_skips_torn_tail() {
    let temp = TempDir::new().unwrap();
    let stores = open_stores(&temp);
    let session_id = uuid::Uuid::new_v4();

    stores.chunks.append(session_id, 0, b"kept").await.unwrap();

    // A crash mid-write leaves a partial index line behind
    let index = temp
        .path()
        .join("chunks")
        .join(session_id.to_string())
        .join("index.jsonl");
    let mut contents = std::fs::read_to_string(&index).unwrap();
    contents.push_str("{\"sequence\":1,\"captu");
    std::fs::write(&index, contents).unwrap();

    let (mut recorder, _tx) = recorder(&stores);
    let report = assert_ok!(recorder.recover().await);

    assert_eq!(report.recovered.len(), 1);
    assert_eq!(
        stores.catalog.payload(&report.recovered[0]).await.unwrap(),
        b"kept"
    );
}

#[tokio::test]
async fn test_finished_sessions_leave_nothing_to_recover() {
    let temp = TempDir::new().unwrap();
    let stores = open_stores(&temp);
    let (mut recorder, tx) = recorder(&stores);

    assert_ok!(recorder.start().await);
    tx.send(Fragment::new(b"complete".to_vec())).await.unwrap();
    assert_ok!(recorder.flush().await);
    let id = assert_ok!(recorder.stop().await).unwrap();

    let report = assert_ok!(recorder.recover().await);
    assert_eq!(report.total(), 0);

    // The catalog survives a reopen
    drop(stores);
    let reopened = open_stores(&temp);
    let recording = reopened.catalog.get(&id).await.unwrap().unwrap();
    assert_eq!(reopened.catalog.payload(&recording.id).await.unwrap(), b"complete");
}

#[tokio::test]
async fn test_cannot_stop_without_session() {
    let temp = TempDir::new().unwrap();
    let stores = open_stores(&temp);
    let (mut recorder, _tx) = recorder(&stores);

    let err = assert_err!(recorder.stop().await);
    assert!(matches!(err, EngineError::SessionConflict(_)));
}
