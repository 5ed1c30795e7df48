use cardwall_protocol::{CardKind, CardSubmission};
use cardwall_server::export::ExportFormat;
use cardwall_server::{server_status, start, Mode, ServerStatus, StartOptions};
use serde_json::json;

// One test exercises the whole embedded lifecycle because `start` is a
// process-wide singleton; parallel tests would race it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn embedded_lifecycle_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let opts = StartOptions {
        port: Some(0),
        open_browser: false,
        mode: Mode::Thread,
        state_dir: Some(dir.path().to_path_buf()),
    };
    // Racing starts serialize on the instance guard; both get the same
    // server rather than each binding a listener.
    let (first, second) = tokio::join!(start(opts.clone()), start(opts.clone()));
    let handle = first.expect("start");
    let port = handle.port();
    assert_ne!(port, 0);
    assert_eq!(second.expect("concurrent start").port(), port);

    // Idempotent: a later start returns the same instance too.
    let again = start(opts).await.expect("restart");
    assert_eq!(again.port(), port);

    handle
        .section("Exploration", Some("r1"))
        .await
        .expect("section");
    handle
        .show(CardSubmission {
            kind: Some(CardKind::KeyValue),
            payload: json!({"rows": 120, "nulls": 3}),
            title: Some("Profile".into()),
            run: Some("r1".into()),
            ..Default::default()
        })
        .await
        .expect("show");

    let cards = handle.cards("r1").await.expect("cards");
    assert_eq!(cards.len(), 2);
    assert_eq!(cards[0].kind, CardKind::Section);

    let runs = handle.list_runs().await.expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].card_count, 2);

    // The service answers over real HTTP too.
    let about = reqwest::get(format!("http://127.0.0.1:{port}/about"))
        .await
        .expect("about request")
        .json::<serde_json::Value>()
        .await
        .expect("about json");
    assert_eq!(about["service"], "cardwall");

    let out = dir.path().join("session.json");
    handle
        .export(&out, ExportFormat::Json, None)
        .await
        .expect("export");
    assert!(out.exists());

    assert!(handle.delete_run("r1").await.expect("delete"));
    assert!(!handle.delete_run("r1").await.expect("redelete"));

    handle.stop().await;
    // After stop the singleton is free again; nothing is listening on a
    // port nobody bound.
    match server_status(Some(1)).await {
        ServerStatus::NotRunning => {}
        ServerStatus::Running(about) => panic!("unexpected instance: {about:?}"),
    }
}
