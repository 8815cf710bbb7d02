//! End-to-end downloads against simulated peers found through a UDP tracker.

mod common;

use std::net::SocketAddr;

use common::{
    FakeUdpTracker, Leecher, SeederBehavior, SimulatedSeeder, engine_config, loopback,
    piece_range, three_piece_data, torrent_for, wait_for_state,
};
use shoal_core::engine::{AddTorrentParams, SessionState, spawn_engine};
use shoal_core::torrent::{Bitfield, PeerMessage, PieceIndex, TorrentCreator, TorrentError};

#[tokio::test]
async fn test_download_from_disjoint_seeders_then_serve_third_peer() {
    let data = three_piece_data();
    let tracker = FakeUdpTracker::start(vec![]).await;
    let metadata = torrent_for("reference.bin", &data, &tracker.url());
    assert_eq!(metadata.piece_count(), 3);

    let first = SimulatedSeeder::start(&metadata, &data, [0, 2], SeederBehavior::Honest).await;
    let second = SimulatedSeeder::start(&metadata, &data, [1], SeederBehavior::Honest).await;
    tracker.set_peers(vec![first.address(), second.address()]);

    let downloads = tempfile::tempdir().unwrap();
    let engine = spawn_engine(engine_config()).await.unwrap();
    let mut events = engine.subscribe();
    let info_hash = engine
        .add_torrent(AddTorrentParams::new(metadata.clone(), downloads.path()))
        .await
        .unwrap();

    wait_for_state(&mut events, info_hash, SessionState::Seeding).await;

    let status = engine.session(info_hash).await.unwrap();
    assert!(status.is_complete());
    assert_eq!(status.pieces_verified, 3);
    assert_eq!(status.bytes_verified, data.len() as u64);
    let on_disk = tokio::fs::read(downloads.path().join("reference.bin"))
        .await
        .unwrap();
    assert_eq!(on_disk, data);
    assert!(first.blocks_served() >= 2);
    assert!(second.blocks_served() >= 1);

    // A third peer asks for the short last piece.
    let listen = engine.listen_addr().await.unwrap();
    let mut leecher = Leecher::connect(loopback(listen), info_hash).await;
    let PeerMessage::Bitfield { bitfield } = leecher.next().await else {
        panic!("expected the seeder's bitfield first");
    };
    assert!(Bitfield::from_bytes(&bitfield, 3).unwrap().is_complete());

    leecher.send(PeerMessage::Interested).await;
    assert_eq!(leecher.next().await, PeerMessage::Unchoke);
    leecher
        .send(PeerMessage::Request {
            piece_index: PieceIndex::new(2),
            offset: 0,
            length: 4096,
        })
        .await;
    let PeerMessage::Piece {
        piece_index,
        offset,
        data: block,
    } = leecher.next().await
    else {
        panic!("expected a piece reply");
    };
    assert_eq!((piece_index, offset), (PieceIndex::new(2), 0));
    assert_eq!(&block[..], &data[piece_range(&metadata, 2)]);

    let status = engine.session(info_hash).await.unwrap();
    assert_eq!(status.uploaded, 4096);

    // Completed is announced once the last piece verified.
    tokio::time::timeout(common::TEST_TIMEOUT, async {
        while !tracker.announce_events().contains(&1) {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no completed announce");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_peer_is_banned_and_download_completes() {
    let data = three_piece_data();
    let tracker = FakeUdpTracker::start(vec![]).await;
    let metadata = torrent_for("reference.bin", &data, &tracker.url());

    let liar = SimulatedSeeder::start(&metadata, &data, [0, 1, 2], SeederBehavior::Corrupt).await;
    let honest = SimulatedSeeder::start(&metadata, &data, [0, 1, 2], SeederBehavior::Honest).await;
    tracker.set_peers(vec![liar.address(), honest.address()]);

    let mut config = engine_config();
    config.torrent.hash_strike_threshold = 0;
    let downloads = tempfile::tempdir().unwrap();
    let engine = spawn_engine(config).await.unwrap();
    let mut events = engine.subscribe();
    let info_hash = engine
        .add_torrent(AddTorrentParams::new(metadata, downloads.path()))
        .await
        .unwrap();

    wait_for_state(&mut events, info_hash, SessionState::Seeding).await;

    let on_disk = tokio::fs::read(downloads.path().join("reference.bin"))
        .await
        .unwrap();
    assert_eq!(on_disk, data);
    // Banned after its first bad piece and never redialled.
    assert!(liar.connections() <= 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_existing_data_seeds_without_peers() {
    let data = three_piece_data();
    let tracker = FakeUdpTracker::start(vec![]).await;
    let metadata = torrent_for("reference.bin", &data, &tracker.url());

    let downloads = tempfile::tempdir().unwrap();
    tokio::fs::write(downloads.path().join("reference.bin"), &data)
        .await
        .unwrap();

    let engine = spawn_engine(engine_config()).await.unwrap();
    let mut events = engine.subscribe();
    let info_hash = engine
        .add_torrent(AddTorrentParams::new(metadata, downloads.path()))
        .await
        .unwrap();

    wait_for_state(&mut events, info_hash, SessionState::Seeding).await;
    let status = engine.session(info_hash).await.unwrap();
    assert_eq!(status.pieces_verified, 3);
    assert_eq!(status.downloaded, 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remove_keep_files_leaves_data_untouched() {
    let data = three_piece_data();
    let tracker = FakeUdpTracker::start(vec![]).await;
    let metadata = torrent_for("reference.bin", &data, &tracker.url());
    let seeder = SimulatedSeeder::start(&metadata, &data, [0, 1, 2], SeederBehavior::Honest).await;
    tracker.set_peers(vec![seeder.address()]);

    let downloads = tempfile::tempdir().unwrap();
    let engine = spawn_engine(engine_config()).await.unwrap();
    let mut events = engine.subscribe();
    let info_hash = engine
        .add_torrent(AddTorrentParams::new(metadata.clone(), downloads.path()))
        .await
        .unwrap();
    wait_for_state(&mut events, info_hash, SessionState::Seeding).await;

    let path = downloads.path().join("reference.bin");
    let before = tokio::fs::read(&path).await.unwrap();
    engine.remove(info_hash, true).await.unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), before);
    assert!(engine.session(info_hash).await.is_err());

    // Re-adding finds the data and removing without keep_files deletes it.
    let info_hash = engine
        .add_torrent(AddTorrentParams::new(metadata, downloads.path()))
        .await
        .unwrap();
    wait_for_state(&mut events, info_hash, SessionState::Seeding).await;
    engine.remove(info_hash, false).await.unwrap();
    assert!(!path.exists());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_info_hash_is_refused_by_listener() {
    let engine = spawn_engine(engine_config()).await.unwrap();
    let listen: SocketAddr = loopback(engine.listen_addr().await.unwrap());

    let mut connection = shoal_core::torrent::PeerConnection::connect(
        listen,
        std::time::Duration::from_secs(1),
        1 << 18,
    )
    .await
    .unwrap();
    let ours = shoal_core::torrent::PeerHandshake::new(
        shoal_core::torrent::InfoHash::new([0x42; 20]),
        shoal_core::torrent::PeerId::generate("-LCH001-"),
    );
    assert!(
        connection
            .handshake(&ours, std::time::Duration::from_secs(2))
            .await
            .is_err()
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pieces_assembled_from_small_blocks() {
    let data = three_piece_data();
    let tracker = FakeUdpTracker::start(vec![]).await;
    let metadata = torrent_for("reference.bin", &data, &tracker.url());
    let seeder = SimulatedSeeder::start(&metadata, &data, [0, 1, 2], SeederBehavior::Honest).await;
    tracker.set_peers(vec![seeder.address()]);

    let mut config = engine_config();
    config.torrent.block_size = 4096;
    let downloads = tempfile::tempdir().unwrap();
    let engine = spawn_engine(config).await.unwrap();
    let mut events = engine.subscribe();
    let info_hash = engine
        .add_torrent(AddTorrentParams::new(metadata, downloads.path()))
        .await
        .unwrap();

    wait_for_state(&mut events, info_hash, SessionState::Seeding).await;

    let on_disk = tokio::fs::read(downloads.path().join("reference.bin"))
        .await
        .unwrap();
    assert_eq!(on_disk, data);
    // Four blocks for each full piece and one for the short last piece.
    assert!(seeder.blocks_served() >= 9);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_file_selection_downloads_only_touched_pieces() {
    let data = common::reference_data(40_000);
    let source = tempfile::tempdir().unwrap();
    let bundle = source.path().join("bundle");
    tokio::fs::create_dir(&bundle).await.unwrap();
    tokio::fs::write(bundle.join("a.bin"), &data[..20_000])
        .await
        .unwrap();
    tokio::fs::write(bundle.join("b.bin"), &data[20_000..])
        .await
        .unwrap();

    let tracker = FakeUdpTracker::start(vec![]).await;
    let metadata = TorrentCreator::with_piece_size(common::PIECE_LENGTH)
        .create_from_directory(&bundle, vec![tracker.url()])
        .await
        .unwrap()
        .metadata;
    assert_eq!(metadata.files.len(), 2);
    let seeder = SimulatedSeeder::start(&metadata, &data, [0, 1, 2], SeederBehavior::Honest).await;
    tracker.set_peers(vec![seeder.address()]);

    let downloads = tempfile::tempdir().unwrap();
    let engine = spawn_engine(engine_config()).await.unwrap();
    let mut events = engine.subscribe();

    let unknown_file = engine
        .add_torrent(
            AddTorrentParams::new(metadata.clone(), downloads.path()).with_file_selection(vec![5]),
        )
        .await;
    assert!(matches!(
        unknown_file,
        Err(TorrentError::InvalidFileSelection { .. })
    ));

    // a.bin spans pieces 0 and 1.
    let info_hash = engine
        .add_torrent(
            AddTorrentParams::new(metadata.clone(), downloads.path()).with_file_selection(vec![0]),
        )
        .await
        .unwrap();
    wait_for_state(&mut events, info_hash, SessionState::Seeding).await;

    let status = engine.session(info_hash).await.unwrap();
    assert!(status.is_complete());
    assert_eq!(status.pieces_wanted, 2);
    assert_eq!(status.pieces_verified, 2);
    assert_eq!(status.total_bytes, 2 * u64::from(common::PIECE_LENGTH));

    let root = downloads.path().join(&metadata.name);
    assert_eq!(
        tokio::fs::read(root.join("a.bin")).await.unwrap(),
        &data[..20_000]
    );
    let snapshot = engine.snapshot().await.unwrap();
    let torrent = snapshot.find(info_hash).unwrap();
    assert_eq!(torrent.selected_files, Some(vec![0]));
    assert!(!torrent.verified_bitfield().unwrap().has(2));

    engine.shutdown().await.unwrap();
}
