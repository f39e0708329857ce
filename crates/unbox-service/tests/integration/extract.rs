use bytes::Bytes;
use futures::TryStreamExt;
use unbox_service::archive::ArchiveFormat;
use unbox_service::caching::{ArchiveError, cache_file_name};
use unbox_test as test;

use crate::setup_service;

#[tokio::test]
async fn test_extract_from_zip() {
    test::require_tool!("unzip");
    let env = setup_service(|_| {}).await;
    let archive = "games/glulx/story.zip";
    let zip = test::zip_archive(&[
        ("story.ulx", b"Glul\x00\x03\x01\x00"),
        ("docs/manual[1].txt", b"Read me first.\n"),
    ]);
    env.publish(archive, zip, &[archive]);

    let (hash, entry) = env.service.open(archive).await.unwrap();
    let extractor = env.service.extractor();

    let buffer = extractor
        .get_file_buffer(&hash, &entry, "docs/manual[1].txt", None)
        .await
        .unwrap();
    assert_eq!(&buffer[..], b"Read me first.\n");

    let chunks: Vec<Bytes> = env
        .service
        .get_file_stream(&hash, &entry, "story.ulx")
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(chunks.concat(), b"Glul\x00\x03\x01\x00");
}

#[tokio::test]
async fn test_extract_normalized_tar_gz() {
    test::require_tool!("tar");
    let env = setup_service(|_| {}).await;
    let archive = "games/zcode/story.tar.gz";

    let dir = test::tempdir();
    let path = dir.path().join("story.tar.gz");
    test::tar_archive(&path, &[("./a.txt", b"from tar\n"), ("b.txt", b"b")]);
    env.publish(archive, std::fs::read(&path).unwrap(), &[archive]);

    let (hash, entry) = env.service.open(archive).await.unwrap();
    assert_eq!(entry.contents, ["a.txt", "b.txt"]);
    assert_eq!(entry.original_path("a.txt"), "./a.txt");
    assert_eq!(env.cached_files(), [format!("{hash}.tar.gz")]);

    let buffer = env
        .service
        .extractor()
        .get_file_buffer(&hash, &entry, "a.txt", None)
        .await
        .unwrap();
    assert_eq!(&buffer[..], b"from tar\n");

    let result = env
        .service
        .extractor()
        .get_file_buffer(&hash, &entry, "missing.txt", None)
        .await;
    assert!(
        matches!(result, Err(ArchiveError::ExtractionError(_))),
        "{result:?}"
    );
}

async fn check_tarball(archive: &str, extension: &str) {
    let env = setup_service(|_| {}).await;

    let dir = test::tempdir();
    let path = dir.path().join(format!("story.{extension}"));
    test::tar_archive(
        &path,
        &[
            ("./story.z5", b"\x05\x00zcode"),
            ("-notes.txt", b"dash\n"),
        ],
    );
    env.publish(archive, std::fs::read(&path).unwrap(), &[archive]);

    let (hash, entry) = env.service.open(archive).await.unwrap();
    assert_eq!(entry.contents, ["-notes.txt", "story.z5"]);
    let format = ArchiveFormat::from_path(archive).unwrap();
    assert_eq!(env.cached_files(), [cache_file_name(&hash, format)]);

    let extractor = env.service.extractor();
    let buffer = extractor
        .get_file_buffer(&hash, &entry, "story.z5", None)
        .await
        .unwrap();
    assert_eq!(&buffer[..], b"\x05\x00zcode");

    let chunks: Vec<Bytes> = env
        .service
        .get_file_stream(&hash, &entry, "-notes.txt")
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(chunks.concat(), b"dash\n");
}

#[tokio::test]
async fn test_extract_tgz() {
    test::require_tool!("tar");
    test::require_tool!("gzip");
    check_tarball("games/zcode/story.tgz", "tgz").await;
}

#[tokio::test]
async fn test_extract_tar_z() {
    test::require_tool!("tar");
    test::require_tool!("compress");
    check_tarball("games/zcode/story.tar.Z", "tar.Z").await;
}

#[tokio::test]
async fn test_buffer_limit() {
    test::require_tool!("unzip");
    let env = setup_service(|config| config.caches.max_buffer = 10).await;
    let archive = "games/big.zip";
    let zip = test::zip_archive(&[("big.txt", &[b'x'; 64])]);
    env.publish(archive, zip, &[archive]);

    let (hash, entry) = env.service.open(archive).await.unwrap();
    let extractor = env.service.extractor();

    let result = extractor.get_file_buffer(&hash, &entry, "big.txt", None).await;
    assert_eq!(result, Err(ArchiveError::BufferLimitExceeded(10)));

    let buffer = extractor
        .get_file_buffer(&hash, &entry, "big.txt", Some(64))
        .await
        .unwrap();
    assert_eq!(buffer.len(), 64);
}

#[tokio::test]
async fn test_content_type() {
    test::require_tool!("unzip");
    test::require_tool!("file");
    let env = setup_service(|_| {}).await;
    let archive = "games/zcode/types.zip";
    let zip = test::zip_archive(&[
        ("story.z5", b"\x05\x00"),
        ("README", b"Just some plain text.\n"),
        ("notes.txt", b"More plain text.\n"),
    ]);
    env.publish(archive, zip, &[archive]);

    let (hash, entry) = env.service.open(archive).await.unwrap();

    let mime = env
        .service
        .content_type(&hash, &entry, "story.z5")
        .await
        .unwrap();
    assert_eq!(mime, "application/x-zmachine");

    let mime = env
        .service
        .content_type(&hash, &entry, "README")
        .await
        .unwrap();
    assert!(mime.starts_with("text/plain"), "{mime}");

    // Vague types are refined with a charset.
    let mime = env
        .service
        .content_type(&hash, &entry, "notes.txt")
        .await
        .unwrap();
    assert!(mime.starts_with("text/plain; charset="), "{mime}");
}
