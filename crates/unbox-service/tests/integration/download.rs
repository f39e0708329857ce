use futures::future::join_all;
use unbox_service::caching::ArchiveError;
use unbox_service::index::archive_hash;
use unbox_test as test;

use crate::{DATE, index_data, setup_service};

const ARCHIVE: &str = "games/zcode/test.zip";

fn test_zip() -> Vec<u8> {
    test::zip_archive(&[
        ("a.txt", b"hello"),
        ("sub/", b""),
        ("sub/b.txt", b"world"),
    ])
}

#[tokio::test]
async fn test_download_and_list() {
    test::require_tool!("unzip");
    let env = setup_service(|_| {}).await;
    let contents = test_zip();
    env.publish(ARCHIVE, contents.clone(), &[ARCHIVE]);

    let (hash, entry) = env
        .service
        .open("https://ifarchive.org/if-archive/games/zcode/test.zip")
        .await
        .unwrap();

    assert_eq!(hash, archive_hash(ARCHIVE));
    assert_eq!(entry.contents, ["a.txt", "sub/b.txt"]);
    assert_eq!(entry.normalised_paths, None);
    assert_eq!(entry.date, DATE);
    assert_eq!(entry.size, contents.len() as u64);
    assert_eq!(env.origin.hits(ARCHIVE), 1);

    let file_name = format!("{hash}.zip");
    assert_eq!(env.cached_files(), [file_name.as_str()]);
    assert!(env.tmp_files().is_empty());

    let metadata = std::fs::metadata(env.config.cache_dir().join(&file_name)).unwrap();
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    assert_eq!(mtime.unix_seconds() * 1000, DATE);

    // The second request is served from the cache.
    let (_, again) = env.service.open(ARCHIVE).await.unwrap();
    assert_eq!(again, entry);
    assert_eq!(env.origin.hits(ARCHIVE), 1);
}

#[tokio::test]
async fn test_concurrent_requests() {
    test::require_tool!("unzip");
    let env = setup_service(|_| {}).await;
    env.publish(ARCHIVE, test_zip(), &[ARCHIVE]);

    let results = join_all((0..4).map(|_| env.service.open(ARCHIVE))).await;
    for result in results {
        let (_, entry) = result.unwrap();
        assert_eq!(entry.contents, ["a.txt", "sub/b.txt"]);
    }
    assert_eq!(env.origin.hits(ARCHIVE), 1);
}

#[tokio::test]
async fn test_missing_date_header() {
    let env = setup_service(|_| {}).await;
    env.origin.add(ARCHIVE, test_zip(), None);
    env.service.index().update(&index_data(&[ARCHIVE]));

    let result = env.service.open(ARCHIVE).await;
    assert_eq!(result.unwrap_err(), ArchiveError::MissingDateHeader);
    assert!(env.cached_files().is_empty());
    assert!(env.tmp_files().is_empty());
    assert!(env.service.cache().hashes().is_empty());
}

#[tokio::test]
async fn test_origin_not_found() {
    let env = setup_service(|_| {}).await;
    env.service.index().update(&index_data(&[ARCHIVE]));

    match env.service.open(ARCHIVE).await {
        Err(ArchiveError::OriginFetchError(details)) => {
            assert!(details.contains("404"), "{details}");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(env.cached_files().is_empty());
    assert!(env.tmp_files().is_empty());

    // Failures are not cached.
    env.origin.add(ARCHIVE, b"still not found".to_vec(), None);
    assert_eq!(
        env.service.open(ARCHIVE).await.unwrap_err(),
        ArchiveError::MissingDateHeader
    );
    assert_eq!(env.origin.hits(ARCHIVE), 2);
}

#[tokio::test]
async fn test_corrupt_archive() {
    test::require_tool!("unzip");
    let env = setup_service(|_| {}).await;
    env.publish(ARCHIVE, b"this is not a zip file".to_vec(), &[ARCHIVE]);

    let result = env.service.open(ARCHIVE).await;
    assert!(
        matches!(result, Err(ArchiveError::ArchiveReadError(_))),
        "{result:?}"
    );
    assert!(env.cached_files().is_empty());
    assert!(env.tmp_files().is_empty());
}

#[tokio::test]
async fn test_resolve_errors() {
    let env = setup_service(|_| {}).await;
    let mut data = index_data(&["games/other.rar", "games/secret.zip"]);
    data.block(&archive_hash("games/secret.zip"));
    env.service.index().update(&data);

    assert_eq!(
        env.service.open("games/nothing.zip").await.unwrap_err(),
        ArchiveError::UnknownHash("games/nothing.zip".into())
    );
    assert_eq!(
        env.service
            .open("https://example.com/games/other.rar")
            .await
            .unwrap_err(),
        ArchiveError::UnknownHash("https://example.com/games/other.rar".into())
    );
    assert_eq!(
        env.service.open("games/secret.zip").await.unwrap_err(),
        ArchiveError::Blocked("games/secret.zip".into())
    );
    assert_eq!(
        env.service.open("games/other.rar").await.unwrap_err(),
        ArchiveError::UnsupportedFormat("games/other.rar".into())
    );
    assert_eq!(env.origin.hits("games/other.rar"), 0);
}

#[tokio::test]
async fn test_symlinks() {
    test::require_tool!("unzip");
    let env = setup_service(|_| {}).await;
    env.origin.add(ARCHIVE, test_zip(), Some(test::LAST_MODIFIED));

    let mut data = index_data(&[ARCHIVE]);
    data.add_symlink("infocom", "games/zcode");
    data.add_symlink("games/latest.zip", "infocom/test.zip");
    env.service.index().update(&data);

    let hash = archive_hash(ARCHIVE);
    assert_eq!(env.service.resolve("infocom/test.zip").unwrap(), hash);
    assert_eq!(env.service.resolve("games/latest.zip").unwrap(), hash);

    let (resolved, _) = env.service.open("games/latest.zip").await.unwrap();
    assert_eq!(resolved, hash);
    assert_eq!(env.origin.hits(ARCHIVE), 1);
}

#[tokio::test]
async fn test_purge_on_index_update() {
    test::require_tool!("unzip");
    let env = setup_service(|_| {}).await;
    env.publish(ARCHIVE, test_zip(), &[ARCHIVE, "games/other.zip"]);
    env.service.open(ARCHIVE).await.unwrap();
    assert_eq!(env.cached_files().len(), 1);

    // Unrelated changes keep the archive.
    env.service.index().update(&index_data(&[ARCHIVE]));
    assert_eq!(env.cached_files().len(), 1);

    // A new version of the archive replaces the cached one.
    let mut data = index_data(&[]);
    data.add_file(ARCHIVE, DATE + 1000);
    env.service.index().update(&data);
    assert!(env.cached_files().is_empty());
    assert!(env.service.cache().hashes().is_empty());
}

#[tokio::test]
async fn test_evicts_to_bounds() {
    test::require_tool!("unzip");
    let env = setup_service(|config| config.caches.max_entries = 2).await;
    let paths = ["games/a.zip", "games/b.zip", "games/c.zip"];
    for path in paths {
        env.origin.add(path, test_zip(), Some(test::LAST_MODIFIED));
    }
    env.service.index().update(&index_data(&paths));

    for path in paths {
        env.service.open(path).await.unwrap();
    }

    let expected = [archive_hash("games/c.zip"), archive_hash("games/b.zip")];
    assert_eq!(env.service.cache().hashes(), expected);

    let mut files: Vec<String> = expected.iter().map(|hash| format!("{hash}.zip")).collect();
    files.sort();
    assert_eq!(env.cached_files(), files);
}

#[tokio::test]
async fn test_restore_after_restart() {
    test::require_tool!("unzip");
    let env = setup_service(|_| {}).await;
    env.publish(ARCHIVE, test_zip(), &[ARCHIVE]);
    let (hash, entry) = env.service.open(ARCHIVE).await.unwrap();

    index_data(&[ARCHIVE])
        .store(&env.config.index_data_path())
        .unwrap();

    // A leftover of an interrupted download.
    std::fs::write(env.config.tmp_dir().join("partial.zip"), b"partial").unwrap();

    let restarted = unbox_service::service::UnboxService::create(&env.config)
        .await
        .unwrap();
    assert_eq!(restarted.cache().hashes(), [hash.as_str()]);
    assert!(env.tmp_files().is_empty());

    let (_, restored) = restarted.open(ARCHIVE).await.unwrap();
    assert_eq!(restored, entry);
    assert_eq!(env.origin.hits(ARCHIVE), 1);
}
