use std::path::{Path, PathBuf};

use geopoll_core::Category;
use geopoll_sync::{Dispatcher, PollConfig};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture(source: &str, name: &str) -> String {
    std::fs::read_to_string(workspace_root().join("fixtures").join(source).join(name)).expect("fixture")
}

#[tokio::test]
async fn fixture_catalogs_notify_once_and_persist_across_reconnects() {
    let mut server = mockito::Server::new_async().await;

    let onspd = server
        .mock("GET", "/onspd")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(fixture("arcgis-search", "onspd.json"))
        .expect(2)
        .create_async()
        .await;
    let lgd = server
        .mock("GET", "/lgd")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(fixture("hub-datasets", "lgd.json"))
        .expect(2)
        .create_async()
        .await;
    let slack = server
        .mock("POST", "/slack")
        .with_status(200)
        .with_body("ok")
        .expect(4)
        .create_async()
        .await;
    let polling_deploy = server
        .mock("POST", "/repos/DemocracyClub/polling_deploy/issues")
        .match_header("authorization", "token test-token")
        .with_status(201)
        .with_body("{}")
        .expect(2)
        .create_async()
        .await;
    let every_election = server
        .mock("POST", "/repos/DemocracyClub/EveryElection/issues")
        .with_status(201)
        .with_body("{}")
        .expect(2)
        .create_async()
        .await;
    let stations = server
        .mock("POST", "/repos/DemocracyClub/UK-Polling-Stations/issues")
        .with_status(201)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let targets_file = dir.path().join("targets.yaml");
    std::fs::write(
        &targets_file,
        format!(
            "targets:\n  - category: postcode\n    source: arcgis-search\n    url: {base}/onspd\n  - category: boundary\n    source: hub-datasets\n    url: {base}/lgd\n",
            base = server.url()
        ),
    )
    .unwrap();

    let config = PollConfig {
        database_url: format!("sqlite://{}", dir.path().join("geopoll.sqlite").display()),
        chat_webhook_url: Some(format!("{}/slack", server.url())),
        github_api_key: Some("test-token".to_string()),
        github_api_base: server.url(),
        targets_file: Some(targets_file),
        ..PollConfig::default()
    };

    let first = Dispatcher::from_config(&config).await.unwrap();
    let summary = first.run_once().await.unwrap();
    assert_eq!(summary.total_items(), 4);
    assert_eq!(summary.total_novel(), 4);
    assert_eq!(summary.notifications().sent, 9);
    assert_eq!(summary.notifications().failed, 0);

    let postcodes = first.store().list(Category::Postcode).await.unwrap();
    assert_eq!(postcodes.len(), 2);
    assert!(postcodes.iter().any(|r| r.url
        == "https://www.arcgis.com/home/item.html?id=a8d42df48d2f4b8d9bd8bb2b3b2c4a1f"));
    assert!(first
        .store()
        .list(Category::Ward)
        .await
        .unwrap_err()
        .is_missing_table());
    drop(first);

    let second = Dispatcher::from_config(&config).await.unwrap();
    let rerun = second.run_once().await.unwrap();
    assert_eq!(rerun.total_items(), 4);
    assert_eq!(rerun.total_novel(), 0);
    assert_eq!(second.store().list(Category::Boundary).await.unwrap().len(), 2);

    onspd.assert_async().await;
    lgd.assert_async().await;
    slack.assert_async().await;
    polling_deploy.assert_async().await;
    every_election.assert_async().await;
    stations.assert_async().await;
}

#[tokio::test]
async fn init_creates_every_category_table() {
    let dir = tempfile::tempdir().unwrap();
    let config = PollConfig {
        database_url: format!("sqlite://{}", dir.path().join("init.sqlite").display()),
        ..PollConfig::default()
    };

    let dispatcher = Dispatcher::from_config(&config).await.unwrap();
    dispatcher.init_schema().await.unwrap();
    for category in Category::ALL {
        assert!(dispatcher.store().list(category).await.unwrap().is_empty());
    }
}
