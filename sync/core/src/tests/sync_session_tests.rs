// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end coverage of the inbound sync path: wire decode, durable
//! bootstrap staging, history integration and subscription-set advancement.


use sync_types::{
    DownloadBatchState, DownloadCursor, DownloadableProgress, SaltedVersion, SyncProgress,
    UploadCursor, Version,
};

use crate::{
    bootstrap_store::PendingBootstrapStore,
    changeset::{Changeset, Instruction},
    history::{ClientHistory, PassthroughTransformer},
    protocol::{ClientProtocol, ServerMessage, ServerProtocol},
    storage::Database,
    subscriptions::{SubscriptionSetState, SubscriptionStore},
};
use sync_types::{ObjKey, TableKey};

fn open_db(name: &str) -> Database {
    super::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    Database::open(dir.into_path().join(name))
}

fn download_message(
    server_versions: std::ops::RangeInclusive<Version>,
    compress: bool,
) -> Vec<u8> {
    let mut body = Vec::new();
    for version in server_versions.clone() {
        let changeset = Changeset::new(vec![Instruction::CreateObject {
            table: TableKey(1),
            obj: ObjKey(100 + version as i64),
        }])
        .encode();
        ServerProtocol::insert_single_changeset_download(
            &mut body,
            version,
            0,
            version,
            0,
            changeset.len() as u64,
            &changeset,
        );
    }
    let progress = SyncProgress {
        latest_server_version: SaltedVersion::new(*server_versions.end(), 7),
        download: DownloadCursor {
            server_version: *server_versions.end(),
            last_integrated_client_version: 0,
        },
        upload: UploadCursor::default(),
    };
    ServerProtocol::default().make_download_message(1, &progress, 0, &body, compress)
}

#[test]
fn download_stages_integrates_and_completes_the_subscription() {
    let db = open_db("flx-pipeline.db");
    let history = ClientHistory::new(db.clone(), &sync_config::Parameters::default()).unwrap();
    let bootstraps = PendingBootstrapStore::new(db.clone()).unwrap();
    let subscriptions = SubscriptionStore::new(db.clone()).unwrap();

    let mut setup = db.start_write().unwrap();
    setup.add_table("data").unwrap();
    setup.commit().unwrap();

    // A new subscription set goes out to the server.
    let mut mutable = subscriptions.make_mutable_copy().unwrap();
    mutable.insert_or_assign(Some("all"), "data", "truepredicate");
    let set = subscriptions.commit(mutable).unwrap();
    assert_eq!(set.state, SubscriptionSetState::Pending);
    let query_version = set.version;

    // The server acknowledges and starts the bootstrap over two DOWNLOAD
    // messages; the second carries the final progress.
    subscriptions
        .update_state(query_version, SubscriptionSetState::Bootstrapping, None)
        .unwrap();

    let codec = ClientProtocol::default();
    let first = codec.parse_message_received(&download_message(1..=2, false)).unwrap();
    let ServerMessage::Download { changesets, .. } = first else {
        panic!("expected a download");
    };
    bootstraps
        .add_batch(query_version, None, DownloadableProgress::default(), &changesets)
        .unwrap();

    let second = codec.parse_message_received(&download_message(3..=4, true)).unwrap();
    let ServerMessage::Download {
        progress,
        changesets,
        ..
    } = second
    else {
        panic!("expected a download");
    };
    bootstraps
        .add_batch(
            query_version,
            Some(&progress),
            DownloadableProgress::default(),
            &changesets,
        )
        .unwrap();
    assert!(bootstraps.has_pending());
    assert_eq!(
        bootstraps.pending_stats().unwrap().unwrap().pending_changesets,
        4
    );

    // Integrate the staged batches, popping within the integrating
    // transaction.
    let batch = bootstraps.peek_pending(u64::MAX).unwrap();
    assert_eq!(batch.changesets.len(), 4);
    let final_progress = batch.progress.expect("bootstrap is complete for reading");
    let mut tr = db.start_write().unwrap();
    bootstraps
        .pop_front_pending(&mut tr, batch.changesets.len())
        .unwrap();
    history
        .integrate_server_changesets(
            &final_progress,
            None,
            &batch.changesets,
            DownloadBatchState::LastInBatch,
            &PassthroughTransformer,
            &mut tr,
            None,
        )
        .unwrap();
    assert!(!bootstraps.has_pending());

    // All four objects arrived.
    let read = db.start_read(None).unwrap();
    for version in 1..=4i64 {
        assert!(read.object(TableKey(1), ObjKey(100 + version)).is_ok());
    }
    let (_, _, progress) = history.get_status().unwrap();
    assert_eq!(progress.download.server_version, 4);

    // Last batch integrated: the set awaits the server's MARK.
    subscriptions
        .update_state(query_version, SubscriptionSetState::AwaitingMark, None)
        .unwrap();
    let mark = ServerProtocol::default().make_mark_message(1, 9);
    let parsed = codec.parse_message_received(&mark).unwrap();
    assert!(matches!(parsed, ServerMessage::Mark { request_ident: 9, .. }));
    subscriptions
        .update_state(query_version, SubscriptionSetState::Complete, None)
        .unwrap();
    assert_eq!(
        subscriptions.get_active().unwrap().version,
        query_version
    );
}

#[test]
fn superseding_query_version_discards_staged_bootstrap() {
    let db = open_db("flx-supersede.db");
    let bootstraps = PendingBootstrapStore::new(db.clone()).unwrap();
    let subscriptions = SubscriptionStore::new(db.clone()).unwrap();

    let mut mutable = subscriptions.make_mutable_copy().unwrap();
    mutable.insert_or_assign(Some("a"), "data", "truepredicate");
    let v1 = subscriptions.commit(mutable).unwrap();
    subscriptions
        .update_state(v1.version, SubscriptionSetState::Bootstrapping, None)
        .unwrap();

    let codec = ClientProtocol::default();
    let message = codec.parse_message_received(&download_message(1..=1, false)).unwrap();
    let ServerMessage::Download { changesets, .. } = message else {
        panic!("expected a download");
    };
    bootstraps
        .add_batch(v1.version, None, DownloadableProgress::default(), &changesets)
        .unwrap();

    // A newer subscription set arrives before the bootstrap finishes; its
    // first batch clears the stale staging area.
    let mut mutable = subscriptions.make_mutable_copy().unwrap();
    mutable.insert_or_assign(Some("b"), "data", "done == false");
    let v2 = subscriptions.commit(mutable).unwrap();
    let message = codec.parse_message_received(&download_message(2..=2, false)).unwrap();
    let ServerMessage::Download { changesets, .. } = message else {
        panic!("expected a download");
    };
    bootstraps
        .add_batch(v2.version, None, DownloadableProgress::default(), &changesets)
        .unwrap();

    let stats = bootstraps.pending_stats().unwrap().unwrap();
    assert_eq!(stats.query_version, v2.version);
    assert_eq!(stats.pending_changesets, 1);
}

#[test]
fn local_writes_round_trip_through_upload_messages() {
    let db = open_db("upload-roundtrip.db");
    let history = ClientHistory::new(db.clone(), &sync_config::Parameters::default()).unwrap();

    let mut tr = db.start_write().unwrap();
    let table = tr.add_table("data").unwrap();
    let obj = tr.create_object(table).unwrap();
    let changeset = tr.pending_changeset().unwrap();
    history
        .prepare_changeset(&mut tr, &changeset.encode())
        .unwrap();
    tr.commit().unwrap();

    // Scan, build the UPLOAD message, and decode it server-side.
    let mut cursor = UploadCursor {
        client_version: 1,
        last_integrated_server_version: 0,
    };
    let mut records = Vec::new();
    let mut locked = 0;
    history
        .find_uploadable_changesets(&mut cursor, u64::MAX, 1 << 20, &mut records, &mut locked)
        .unwrap();
    assert_eq!(records.len(), 1);

    let mut builder = ClientProtocol::default().make_upload_message_builder();
    for record in &records {
        builder.add_changeset(
            record.progress.client_version,
            record.progress.last_integrated_server_version,
            record.origin_timestamp,
            record.origin_file_ident,
            &record.changeset,
        );
    }
    let message = builder.make_upload_message(1, cursor.client_version, 0, locked);
    let parsed = ServerProtocol::default().parse_message_received(&message).unwrap();
    let crate::protocol::ClientMessage::Upload { changesets, .. } = parsed else {
        panic!("expected an upload");
    };
    assert_eq!(changesets.len(), 1);

    // The uploaded bytes decode to the original instructions.
    let decoded = Changeset::decode(&changesets[0].changeset).unwrap();
    assert_eq!(decoded, changeset);
    assert!(decoded.instructions.contains(&Instruction::CreateObject { table, obj }));
}
