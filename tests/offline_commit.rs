mod common;

use common::{document_name, fields, reply, request, start, wait_for};
use firestore_sync_rs::firestore::{FirestoreSettings, FirestoreValue, ListenOptions};
use serde_json::json;

#[tokio::test]
async fn offline_set_is_pending_until_the_backend_confirms_it() {
    let (firestore, mut backend) = start("offline-commit", FirestoreSettings::default()).await;
    firestore.disable_network().await.unwrap();

    let doc = firestore.doc("a/1").unwrap();
    let (sender, snapshots) = async_channel::unbounded();
    let options = ListenOptions {
        include_metadata_changes: true,
        ..ListenOptions::default()
    };
    let _registration = firestore
        .on_document_snapshot(&doc, options, move |result| {
            let _ = sender.try_send(result.unwrap());
        })
        .await
        .unwrap();
    let initial = wait_for(&snapshots, |_| true).await;
    assert!(!initial.exists());
    assert!(initial.metadata().from_cache);

    let commit = {
        let firestore = firestore.clone();
        let doc = doc.clone();
        tokio::spawn(async move { firestore.set_doc(&doc, fields(&[("x", 1)]), None).await })
    };

    let pending = wait_for(&snapshots, |snapshot| snapshot.exists()).await;
    assert_eq!(pending.get("x").unwrap(), Some(&FirestoreValue::from_integer(1)));
    assert!(pending.metadata().from_cache);
    assert!(pending.metadata().has_pending_writes);

    firestore.enable_network().await.unwrap();

    let write = backend.accept("write").await;
    let handshake = request(&write).await;
    assert_eq!(handshake["database"], json!(format!("projects/{}/databases/(default)", common::PROJECT)));
    reply(&write, json!({"streamToken": "dDE="})).await;
    let writes = request(&write).await;
    assert_eq!(writes["writes"].as_array().map(Vec::len), Some(1));
    reply(
        &write,
        json!({
            "streamToken": "dDI=",
            "commitTime": "2024-01-01T00:00:05Z",
            "writeResults": [{"updateTime": "2024-01-01T00:00:05Z"}],
        }),
    )
    .await;

    let watch = backend.accept("listen").await;
    let add = request(&watch).await;
    let target_id = add["addTarget"]["targetId"].clone();
    for message in [
        json!({"targetChange": {"targetChangeType": "ADD", "targetIds": [target_id]}}),
        json!({"documentChange": {
            "document": {
                "name": document_name("a/1"),
                "fields": {"x": {"integerValue": "1"}},
                "updateTime": "2024-01-01T00:00:05Z",
            },
            "targetIds": [target_id],
        }}),
        json!({"targetChange": {"targetChangeType": "CURRENT", "targetIds": [target_id], "resumeToken": "AQI="}}),
        json!({"targetChange": {"readTime": "2024-01-01T00:00:06Z"}}),
    ] {
        reply(&watch, message).await;
    }

    commit.await.unwrap().unwrap();
    let synced = wait_for(&snapshots, |snapshot| {
        !snapshot.metadata().from_cache && !snapshot.metadata().has_pending_writes
    })
    .await;
    assert_eq!(synced.get("x").unwrap(), Some(&FirestoreValue::from_integer(1)));

    // Nothing is left in the mutation queue.
    firestore.wait_for_pending_writes().await.unwrap();
    firestore.terminate().await.unwrap();
}

#[tokio::test]
async fn rejected_write_is_rolled_back() {
    let (firestore, mut backend) = start("rejected-commit", FirestoreSettings::default()).await;
    let doc = firestore.doc("a/2").unwrap();
    let commit = {
        let firestore = firestore.clone();
        let doc = doc.clone();
        tokio::spawn(async move { firestore.set_doc(&doc, fields(&[("x", 2)]), None).await })
    };

    let write = backend.accept("write").await;
    let _handshake = request(&write).await;
    reply(&write, json!({"streamToken": "dDE="})).await;
    let _writes = request(&write).await;
    write
        .fail(firestore_sync_rs::firestore::FirestoreError::new(
            firestore_sync_rs::firestore::FirestoreErrorCode::PermissionDenied,
            "writes to a/ are not allowed",
        ))
        .await
        .unwrap();

    let err = commit.await.unwrap().unwrap_err();
    assert_eq!(err.code_str(), "firestore/permission-denied");
    let cached = firestore.get_doc_from_cache(&doc).await.unwrap();
    assert!(!cached.exists());
    assert!(!cached.metadata().has_pending_writes);
    firestore.terminate().await.unwrap();
}
