use std::{
    fs,
    sync::{Arc, Mutex},
    time::Duration,
};

use plower_rag::{
    app_state::Status,
    locale::Locale,
    store::{DocumentRepository, KvStore, MergeSummary},
    sync::{FolderSync, SyncOutcome},
};

#[tokio::test]
async fn synced_documents_survive_a_restart() {
    let folder = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let store_path = data.path().join("nested").join("plower_store.json");

    fs::create_dir_all(folder.path().join("docs")).unwrap();
    fs::write(folder.path().join("docs/manual.md"), "# Manual").unwrap();
    fs::write(folder.path().join("notas.TXT"), "apuntes").unwrap();
    fs::write(folder.path().join("foto.jpg"), [0u8, 1, 2]).unwrap();

    let repo = Arc::new(Mutex::new(DocumentRepository::load(
        KvStore::open(&store_path).unwrap(),
    )));
    let status = Arc::new(Mutex::new(Status::default()));
    let sync = FolderSync::new(repo.clone(), status.clone(), Locale::Ja);

    let outcome = sync
        .start(folder.path().to_path_buf(), Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Changed(MergeSummary { added: 2, updated: 0 }));
    assert_eq!(
        status.lock().unwrap().message,
        "同期フォルダから 2 件追加、0 件更新しました。"
    );
    sync.stop();

    let reopened = DocumentRepository::load(KvStore::open(&store_path).unwrap());
    let names: Vec<_> = reopened.list().iter().map(|d| d.name.clone()).collect();
    assert_eq!(names, vec!["docs/manual.md", "notas.TXT"]);
}

#[tokio::test]
async fn periodic_timer_picks_up_new_files() {
    let folder = tempfile::tempdir().unwrap();
    fs::write(folder.path().join("a.txt"), "a").unwrap();

    let repo = Arc::new(Mutex::new(DocumentRepository::load(KvStore::in_memory())));
    let sync = FolderSync::new(
        repo.clone(),
        Arc::new(Mutex::new(Status::default())),
        Locale::En,
    );
    sync.start(folder.path().to_path_buf(), Duration::from_millis(50))
        .await
        .unwrap();

    fs::write(folder.path().join("b.rs"), "fn b() {}").unwrap();
    let mut seen = 0;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        seen = repo.lock().unwrap().len();
        if seen == 2 {
            break;
        }
    }
    sync.stop();
    assert_eq!(seen, 2);
}

#[tokio::test]
async fn selecting_a_file_is_rejected() {
    let folder = tempfile::tempdir().unwrap();
    let file = folder.path().join("x.txt");
    fs::write(&file, "x").unwrap();

    let sync = FolderSync::new(
        Arc::new(Mutex::new(DocumentRepository::load(KvStore::in_memory()))),
        Arc::new(Mutex::new(Status::default())),
        Locale::En,
    );
    assert!(sync.start(file, Duration::from_secs(10)).await.is_err());
    assert!(sync.root().is_none());
}
