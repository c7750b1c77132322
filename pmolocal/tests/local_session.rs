#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};
use pmolocal::{LocalError, LocalSession};
use pmostream::{AudioChunk, EncoderOptions, OutputQueue, PlaybackSession, TranscodeBridge};

fn write_wav(path: &Path, channels: u16, frames: u32) -> Vec<i16> {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let spec = WavSpec {
        channels,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    let samples: Vec<i16> = (0..frames * u32::from(channels))
        .map(|i| (i % 2000) as i16 - 1000)
        .collect();
    for s in &samples {
        writer.write_sample(*s).unwrap();
    }
    writer.finalize().unwrap();
    samples
}

fn cat_bridge() -> (TranscodeBridge, OutputQueue) {
    let options = EncoderOptions::with_program("cat", Vec::new()).with_chunk_size(8192);
    TranscodeBridge::spawn(&options, 0).unwrap()
}

async fn collect(mut queue: OutputQueue) -> (Vec<u8>, bool) {
    let mut body = Vec::new();
    let mut ended = false;
    while let Some(chunk) = queue.next().await {
        match chunk {
            AudioChunk::Data(bytes) => body.extend_from_slice(&bytes),
            AudioChunk::EndOfStream => ended = true,
        }
    }
    (body, ended)
}

#[tokio::test]
async fn search_and_load_use_file_names() {
    let dir = tempfile::tempdir().unwrap();
    write_wav(&dir.path().join("Mezzanine/Massive Attack - Teardrop.wav"), 2, 22_050);
    write_wav(&dir.path().join("Mezzanine/Massive Attack - Angel.wav"), 2, 4_410);
    write_wav(&dir.path().join("Portishead - Roads.wav"), 2, 4_410);

    let session = LocalSession::open(dir.path()).unwrap();
    assert_eq!(session.track_count(), 3);

    let found = session.search("massive TEARDROP").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].album, "Mezzanine");

    assert_eq!(session.search("mezzanine").await.unwrap().len(), 2);
    assert!(session.search("bjork").await.unwrap().is_empty());

    let loaded = session.load_track(&found[0].reference).await.unwrap();
    assert_eq!(loaded.name, "Teardrop");
    assert_eq!(loaded.duration_ms, 500);
    assert!(loaded.is_ready());
}

#[tokio::test]
async fn unknown_reference_is_a_session_error() {
    let dir = tempfile::tempdir().unwrap();
    let session = LocalSession::open(dir.path()).unwrap();
    let err = session.load_track("/nowhere.wav").await.unwrap_err();
    assert!(err.to_string().contains("unknown track"));
}

#[tokio::test]
async fn missing_directory_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        LocalSession::open(dir.path().join("absent")),
        Err(LocalError::MissingLibrary(_))
    ));
}

#[tokio::test]
async fn delivers_little_endian_pcm_then_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let samples = write_wav(&dir.path().join("A - B.wav"), 2, 10_000);

    let session = LocalSession::open(dir.path()).unwrap();
    let track = session.search("").await.unwrap().remove(0);
    let (bridge, queue) = cat_bridge();

    session.stream_track(&track, bridge.sink()).await.unwrap();
    let (body, ended) = tokio::time::timeout(Duration::from_secs(10), collect(queue))
        .await
        .unwrap();
    bridge.close().await;

    assert!(ended);
    let expected: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    assert_eq!(body.len(), expected.len());
    assert_eq!(body, expected);
}

#[tokio::test]
async fn mono_files_are_upmixed() {
    let dir = tempfile::tempdir().unwrap();
    let samples = write_wav(&dir.path().join("Mono - Voice.wav"), 1, 3_000);

    let session = LocalSession::open(dir.path()).unwrap();
    let track = session.search("voice").await.unwrap().remove(0);
    let (bridge, queue) = cat_bridge();

    session.stream_track(&track, bridge.sink()).await.unwrap();
    let (body, ended) = tokio::time::timeout(Duration::from_secs(10), collect(queue))
        .await
        .unwrap();
    bridge.close().await;

    assert!(ended);
    assert_eq!(body.len(), samples.len() * 4);
    assert_eq!(&body[0..4], &[samples[0].to_le_bytes(), samples[0].to_le_bytes()].concat()[..]);
}

#[tokio::test]
async fn cancelled_delivery_leaves_room_for_the_next_one() {
    let dir = tempfile::tempdir().unwrap();
    let samples = write_wav(&dir.path().join("Long - Track.wav"), 2, 44_100 * 5);

    let session = LocalSession::open(dir.path()).unwrap();
    let track = session.search("long").await.unwrap().remove(0);

    // L'encodeur ne lit jamais son entrée : la livraison reste bloquée
    let stalled_options = EncoderOptions::with_program("sleep", vec!["30".into()])
        .with_exit_grace(Duration::from_millis(100));
    let (stalled, _stalled_queue) = TranscodeBridge::spawn(&stalled_options, 0).unwrap();
    session.stream_track(&track, stalled.sink()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(2), session.cancel_playback())
        .await
        .unwrap();
    stalled.close().await;

    let (bridge, queue) = cat_bridge();
    session.stream_track(&track, bridge.sink()).await.unwrap();
    let (body, ended) = tokio::time::timeout(Duration::from_secs(20), collect(queue))
        .await
        .unwrap();
    bridge.close().await;

    assert!(ended);
    assert_eq!(body.len(), samples.len() * 2);

    // Un arrêt sans livraison en cours est sans effet
    session.cancel_playback().await;
}
