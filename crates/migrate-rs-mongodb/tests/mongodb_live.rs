//! Tests against a live MongoDB server.
//!
//! Ignored by default. To run them, point `MIGRATE_MONGODB_URI` at a
//! disposable database (the tests drop everything in it and share it, so
//! they run one at a time), for example
//!
//! ```text
//! MIGRATE_MONGODB_URI=mongodb://localhost:27017/testMigration?directConnection=true \
//!     cargo test -p migrate-rs-mongodb --test mongodb_live -- --ignored --test-threads=1
//! ```
//!
//! The transaction test needs a replica set and is skipped on a standalone
//! server.

use bson::doc;
use migrate_rs_backends::base::bson_to_i64;
use migrate_rs_backends::{DocumentBackend, MongoBackend};
use migrate_rs_core::settings_loader;
use migrate_rs_core::MigrateError;
use migrate_rs_mongodb::{MongoDriver, VersionRecord, NIL_VERSION};

fn live_uri() -> Option<String> {
    std::env::var("MIGRATE_MONGODB_URI").ok().filter(|uri| !uri.is_empty())
}

async fn fresh_driver(uri: &str) -> MongoDriver {
    let driver = MongoDriver::open(uri).await.unwrap();
    driver.drop_all().await.unwrap();
    driver
}

async fn count_documents(uri: &str, collection: &str) -> i64 {
    let parsed = settings_loader::from_uri(uri).unwrap();
    let backend = MongoBackend::connect(
        &parsed.client_uri,
        parsed.direct_connection,
        &parsed.config.database_name,
    )
    .await
    .unwrap();
    let reply = backend
        .run_command(doc! { "count": collection })
        .await
        .unwrap();
    reply.get("n").and_then(bson_to_i64).unwrap()
}

fn with_option(uri: &str, option: &str) -> String {
    let separator = if uri.contains('?') { '&' } else { '?' };
    format!("{uri}{separator}{option}")
}

#[tokio::test]
#[ignore = "requires MIGRATE_MONGODB_URI"]
async fn test_live_version_and_lock() {
    let Some(uri) = live_uri() else { return };
    let driver = fresh_driver(&uri).await;

    assert_eq!(driver.version().await.unwrap(), VersionRecord::new(NIL_VERSION, false));
    for (version, dirty) in [(1, false), (1, true), (NIL_VERSION, true), (NIL_VERSION, false)] {
        driver.set_version(version, dirty).await.unwrap();
        assert_eq!(driver.version().await.unwrap(), VersionRecord::new(version, dirty));
    }

    driver.lock().await.unwrap();
    let other = MongoDriver::open(&uri).await.unwrap();
    assert!(matches!(other.lock().await, Err(MigrateError::LockHeld { .. })));
    driver.unlock().await.unwrap();
    driver.unlock().await.unwrap();
    other.lock().await.unwrap();
    other.unlock().await.unwrap();

    other.close().await.unwrap();
    driver.drop_all().await.unwrap();
    driver.close().await.unwrap();
    driver.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires MIGRATE_MONGODB_URI"]
async fn test_live_sequential_run() {
    let Some(uri) = live_uri() else { return };
    let driver = fresh_driver(&uri).await;

    driver
        .migrate(
            1,
            &br#"[
                {"createIndexes": "hello", "indexes": [{"key": {"wild": 1}, "name": "unique_wild", "unique": true}]},
                {"insert": "hello", "documents": [{"wild": "world"}]}
            ]"#[..],
        )
        .await
        .unwrap();
    assert_eq!(driver.version().await.unwrap(), VersionRecord::new(1, false));

    let err = driver
        .migrate(2, &br#"[{"insert": "hello", "documents": [{"wild": "world"}]}]"#[..])
        .await
        .unwrap_err();
    assert!(err.is_duplicate_key(), "{err}");
    assert!(err.leaves_dirty());
    assert_eq!(driver.version().await.unwrap(), VersionRecord::new(2, true));

    let err = driver.run_bytes(br#"[{"frobnicate": 1}]"#).await.unwrap_err();
    assert!(matches!(err, MigrateError::Dirty { version: 2 }));

    driver.drop_all().await.unwrap();
    driver.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires MIGRATE_MONGODB_URI"]
async fn test_live_transaction_atomicity() {
    let Some(uri) = live_uri() else { return };
    let setup = fresh_driver(&uri).await;
    setup
        .run_bytes(
            br#"[
                {"insert": "hello", "documents": [{"wild": "world"}]},
                {"createIndexes": "hello", "indexes": [{"key": {"wild": 1}, "name": "unique_wild", "unique": true}]}
            ]"#,
        )
        .await
        .unwrap();

    let driver = match MongoDriver::open(&with_option(&uri, "x-transaction-mode=true")).await {
        Ok(driver) => driver,
        Err(err) => panic!("open failed: {err}"),
    };
    let result = driver
        .migrate(
            1,
            &br#"[{"insert": "hello", "documents": [{"wild": "multiple"}, {"wild": "success"}]}]"#[..],
        )
        .await;
    if let Err(MigrateError::Config(reason)) = &result {
        eprintln!("skipping: {reason}");
        setup.drop_all().await.unwrap();
        return;
    }
    result.unwrap();

    let err = driver
        .migrate(
            2,
            &br#"[
                {"insert": "hello", "documents": [{"wild": "fail"}]},
                {"insert": "hello", "documents": [{"wild": "world"}]}
            ]"#[..],
        )
        .await
        .unwrap_err();
    assert!(!err.leaves_dirty(), "{err}");
    assert_eq!(driver.version().await.unwrap(), VersionRecord::new(1, false));

    assert_eq!(count_documents(&uri, "hello").await, 3);

    setup.drop_all().await.unwrap();
    driver.close().await.unwrap();
    setup.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires MIGRATE_MONGODB_URI"]
async fn test_live_transaction_abort_undoes_partial_batch() {
    let Some(uri) = live_uri() else { return };
    let setup = fresh_driver(&uri).await;
    setup
        .migrate(
            1,
            &br#"[
                {"createIndexes": "hello", "indexes": [{"key": {"wild": 1}, "name": "unique_wild", "unique": true}]},
                {"insert": "hello", "documents": [{"wild": "world"}, {"wild": "west"}, {"wild": "natural"}]}
            ]"#[..],
        )
        .await
        .unwrap();

    let driver = MongoDriver::open(&with_option(&uri, "x-transaction-mode=true"))
        .await
        .unwrap();
    let result = driver
        .migrate(
            2,
            &br#"[
                {"insert": "hello", "documents": [{"wild": "flower"}]},
                {"insert": "hello", "documents": [{"wild": "cat"}, {"wild": "west"}]}
            ]"#[..],
        )
        .await;
    match result {
        Err(MigrateError::Config(reason)) => eprintln!("skipping: {reason}"),
        Err(err) => {
            assert!(err.is_duplicate_key(), "{err}");
            assert!(!err.leaves_dirty());
            assert_eq!(count_documents(&uri, "hello").await, 3);
            assert_eq!(driver.version().await.unwrap(), VersionRecord::new(1, false));
        }
        Ok(report) => panic!("duplicate insert committed: {report:?}"),
    }

    setup.drop_all().await.unwrap();
    driver.close().await.unwrap();
    setup.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires MIGRATE_MONGODB_URI"]
async fn test_live_wrong_credentials_surface_on_first_operation() {
    let Some(uri) = live_uri() else { return };
    let parsed = settings_loader::from_uri(&uri).unwrap();
    let Some((scheme, rest)) = parsed.client_uri.split_once("://") else {
        return;
    };
    let hosts = rest.rsplit_once('@').map_or(rest, |(_, hosts)| hosts);
    let wrong = format!("{scheme}://nobody:wrong@{hosts}");

    let driver = MongoDriver::open(&wrong).await.unwrap();
    let err = driver
        .run_bytes(br#"[{"insert": "hello", "documents": [{"wild": "world"}]}]"#)
        .await
        .unwrap_err();
    assert!(err.is_authentication(), "{err}");
    assert!(!err.leaves_dirty());
    driver.close().await.unwrap();
}
