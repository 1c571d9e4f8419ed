//! Integration tests for resolution, packages, invalidation and removal.

mod common;

use common::{SITE, TestEngine, next_event, remote, test_config};
use larder_core::config::EngineConfig;
use larder_core::{
    DownloadStatus, FileDescriptor, FileId, FileLink, FileMeta, RemoteFile, Version,
};
use larder_engine::{
    EngineError, EngineEvent, EventFilter, FetchErrorKind, FileAction, InvalidateScope,
    ResolveOptions, SizeCheck,
};
use larder_metadata::repos::{FileRepo, LinkRepo};
use std::time::Duration;

fn downloaded(event: &EngineEvent, file_id: &FileId) -> bool {
    matches!(
        event,
        EngineEvent::File(e)
            if e.action == FileAction::Download
                && e.success == Some(true)
                && e.file_id == file_id.as_str()
    )
}

/// Resolve once and wait for the background download it schedules.
async fn resolve_and_settle(t: &TestEngine, url: &str) -> String {
    let file_id = FileId::from_url(url);
    let mut events = t.engine.subscribe(EventFilter::File {
        site_id: SITE.to_string(),
        file_id: file_id.to_string(),
    });
    let resolved = t
        .engine
        .resolve_url(SITE, RemoteFile::url(url), ResolveOptions::default())
        .await
        .unwrap();
    next_event(&mut events, |e| downloaded(e, &file_id)).await;
    t.engine.wait_until_idle().await;
    resolved
}

fn files(names: &[&str]) -> Vec<RemoteFile> {
    names.iter().map(|n| RemoteFile::url(remote(n))).collect()
}

// =============================================================================
// Resolution
// =============================================================================

#[tokio::test]
async fn test_resolve_returns_remote_then_local() {
    let t = TestEngine::new().await;
    let url = remote("doc.pdf");
    t.fetcher.serve(&url, "document");

    let first = resolve_and_settle(&t, &url).await;
    assert_eq!(first, url);

    let second = t
        .engine
        .resolve_url(SITE, RemoteFile::url(&url), ResolveOptions::default())
        .await
        .unwrap();
    assert_ne!(second, url);
    assert_eq!(t.read_local(&second), b"document");
    assert_eq!(t.fetcher.fetch_count(&url), 1);
}

#[tokio::test]
async fn test_resolve_keeps_fragment_and_src_uses_file_url() {
    let t = TestEngine::new().await;
    let url = remote("book.html");
    t.fetcher.serve(&url, "<html/>");
    resolve_and_settle(&t, &url).await;

    let with_fragment = format!("{url}#chapter-2");
    let local = t
        .engine
        .resolve_url(SITE, RemoteFile::url(&with_fragment), ResolveOptions::default())
        .await
        .unwrap();
    assert!(local.ends_with("#chapter-2"));
    assert!(!local.starts_with("https://"));

    let src = t
        .engine
        .resolve_src(SITE, RemoteFile::url(&url), ResolveOptions::default())
        .await
        .unwrap();
    assert!(src.starts_with("file://"));
}

#[tokio::test]
async fn test_resolve_offline_never_queues() {
    let t = TestEngine::offline().await;
    let url = remote("offline.pdf");

    let resolved = t
        .engine
        .resolve_url(SITE, RemoteFile::url(&url), ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(resolved, url);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(t.engine.queue_entries(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resolve_returns_signed_remote_url() {
    let t = TestEngine::offline().await;
    t.engine
        .register_site(std::sync::Arc::new(larder_engine::StaticSite::new("signed").with_token("s3cret")));

    let url = remote("signed.pdf");
    let resolved = t
        .engine
        .resolve_url("signed", RemoteFile::url(&url), ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(resolved, format!("{url}?token=s3cret"));
}

#[tokio::test]
async fn test_resolve_requeues_file_missing_on_disk() {
    let t = TestEngine::new().await;
    let url = remote("gone.pdf");
    t.fetcher.serve(&url, "first");
    resolve_and_settle(&t, &url).await;

    let local = t
        .engine
        .resolve_url(SITE, RemoteFile::url(&url), ResolveOptions::default())
        .await
        .unwrap();
    std::fs::remove_file(&local).unwrap();
    t.fetcher.serve(&url, "second");

    let file_id = FileId::from_url(&url);
    let mut events = t.engine.subscribe(EventFilter::All);
    let resolved = t
        .engine
        .resolve_url(SITE, RemoteFile::url(&url), ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(resolved, url);

    next_event(&mut events, |e| downloaded(e, &file_id)).await;
    t.engine.wait_until_idle().await;
    let local = t
        .engine
        .resolve_url(SITE, RemoteFile::url(&url), ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(t.read_local(&local), b"second");
}

#[tokio::test]
async fn test_stale_file_served_offline_but_not_online() {
    let t = TestEngine::new().await;
    let url = remote("stale.pdf");
    t.fetcher.serve(&url, "v1");
    resolve_and_settle(&t, &url).await;

    assert!(t.engine.invalidate_file(SITE, &url).await.unwrap());

    t.network.set_online(false);
    let offline = t
        .engine
        .resolve_url(SITE, RemoteFile::url(&url), ResolveOptions::default())
        .await
        .unwrap();
    assert_ne!(offline, url);
    assert_eq!(t.read_local(&offline), b"v1");

    t.network.set_online(true);
    t.fetcher.serve(&url, "v2");
    let online = resolve_and_settle(&t, &url).await;
    assert_eq!(online, url);

    let refreshed = t
        .engine
        .resolve_url(SITE, RemoteFile::url(&url), ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(t.read_local(&refreshed), b"v2");
}

#[tokio::test]
async fn test_newer_revision_is_outdated() {
    let t = TestEngine::new().await;
    let v1 = "https://school.example/pluginfile.php/12/mod_page/content/1/page.html";
    let v2 = "https://school.example/pluginfile.php/12/mod_page/content/2/page.html";
    t.fetcher.serve(v1, "old");
    t.fetcher.serve(v2, "new");
    resolve_and_settle(&t, v1).await;

    assert_eq!(FileId::from_url(v1), FileId::from_url(v2));
    assert_eq!(
        t.engine
            .get_file_state(SITE, v2, Version::default())
            .await
            .unwrap(),
        DownloadStatus::Outdated
    );

    let resolved = resolve_and_settle(&t, v2).await;
    assert_eq!(resolved, v2);
    let row = t
        .metadata
        .get_file(SITE, FileId::from_url(v2).as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.revision, Some(2));
}

#[tokio::test]
async fn test_size_check_gates_background_download() {
    let config = EngineConfig {
        download_threshold_bytes: 100,
        unmetered_download_threshold_bytes: 1_000,
        ..test_config()
    };
    let t = TestEngine::with_config(config, true).await;
    t.network.set_metered(true);
    let url = remote("medium.bin");
    t.fetcher.serve(&url, common::seeded_bytes(1, 500));

    let resolved = t
        .engine
        .resolve_url_with_size_check(SITE, RemoteFile::url(&url), None, SizeCheck::default())
        .await
        .unwrap();
    assert_eq!(resolved, url);
    tokio::time::timeout(Duration::from_secs(5), async {
        while t.fetcher.size_lookups() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(t.engine.queue_entries(None).await.unwrap().is_empty());
    assert_eq!(t.fetcher.total_fetches(), 0);

    t.network.set_metered(false);
    let file_id = FileId::from_url(&url);
    let mut events = t.engine.subscribe(EventFilter::All);
    t.engine
        .resolve_url_with_size_check(SITE, RemoteFile::url(&url), None, SizeCheck::default())
        .await
        .unwrap();
    next_event(&mut events, |e| downloaded(e, &file_id)).await;
    assert_eq!(t.fetcher.size_lookups(), 1);
}

#[tokio::test]
async fn test_size_check_uses_descriptor_size() {
    let t = TestEngine::new().await;
    t.network.set_metered(true);
    let url = remote("huge.iso");
    let descriptor = FileDescriptor {
        url: url.clone(),
        filename: Some("huge.iso".into()),
        filesize: Some(500 * 1024 * 1024),
        time_modified: None,
        is_external_file: false,
        repository_type: None,
        mimetype: None,
    };

    t.engine
        .resolve_url_with_size_check(
            SITE,
            RemoteFile::descriptor(descriptor.clone()),
            None,
            SizeCheck::default(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(t.engine.queue_entries(None).await.unwrap().is_empty());
    assert_eq!(t.fetcher.size_lookups(), 0);

    t.fetcher.close();
    let forced = SizeCheck {
        force: true,
        ..Default::default()
    };
    t.engine
        .resolve_url_with_size_check(SITE, RemoteFile::descriptor(descriptor), None, forced)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while t.engine.queue_entries(None).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    t.fetcher.open();
    t.engine.wait_until_idle().await;
}

// =============================================================================
// Direct downloads
// =============================================================================

#[tokio::test]
async fn test_download_url_reuses_fresh_copy() {
    let t = TestEngine::new().await;
    let url = remote("direct.pdf");
    t.fetcher.serve(&url, "direct");

    let path = t
        .engine
        .download_url(SITE, RemoteFile::url(&url), Some(FileLink::new("mod_resource", Some("9"))), false)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"direct");

    let again = t
        .engine
        .download_url(SITE, RemoteFile::url(&url), None, false)
        .await
        .unwrap();
    assert_eq!(path, again);
    assert_eq!(t.fetcher.fetch_count(&url), 1);

    let links = t
        .metadata
        .links_for_file(SITE, FileId::from_url(&url).as_str())
        .await
        .unwrap();
    assert_eq!(links.len(), 1);
}

#[tokio::test]
async fn test_moved_destination_removes_previous_copy() {
    let t = TestEngine::new().await;
    let url = remote("notes.pdf");
    t.fetcher.serve(&url, "notes");

    let at = |revision: i64, path: &str| {
        RemoteFile::with_meta(
            &url,
            FileMeta {
                revision: Some(revision),
                path: Some(path.to_string()),
                ..FileMeta::default()
            },
        )
    };
    let old = t
        .engine
        .download_url(SITE, at(1, "course/old/notes.pdf"), None, false)
        .await
        .unwrap();
    assert!(old.exists());

    let new = t
        .engine
        .download_url(SITE, at(2, "course/new/notes.pdf"), None, false)
        .await
        .unwrap();
    assert_ne!(old, new);
    assert_eq!(std::fs::read(&new).unwrap(), b"notes");
    assert!(!old.exists());

    let row = t
        .metadata
        .get_file(SITE, FileId::from_url(&url).as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.path, "course/new/notes.pdf");
}

#[tokio::test]
async fn test_download_url_offline_is_rejected() {
    let t = TestEngine::offline().await;
    let err = t
        .engine
        .download_url(SITE, RemoteFile::url(remote("x.pdf")), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Offline));
}

#[tokio::test]
async fn test_download_refused_for_site_without_downloads() {
    let t = TestEngine::new().await;
    t.engine.register_site(std::sync::Arc::new(
        larder_engine::StaticSite::new("locked").with_downloads(false),
    ));
    let err = t
        .engine
        .download_url("locked", RemoteFile::url(remote("x.pdf")), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DownloadsDisabled(_)));
}

#[tokio::test]
async fn test_stale_copy_refreshed_with_conditional_request() {
    let t = TestEngine::new().await;
    let url = remote("conditional.pdf");
    t.fetcher.serve(&url, "body");
    t.engine
        .download_url(SITE, RemoteFile::url(&url), None, false)
        .await
        .unwrap();
    t.engine.invalidate_file(SITE, &url).await.unwrap();
    t.fetcher.unchanged(&url);

    let path = t
        .engine
        .download_url(SITE, RemoteFile::url(&url), None, false)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"body");

    let requests = t.fetcher.requests_for(&url);
    assert_eq!(requests.len(), 2);
    assert!(requests[0].if_modified_since.is_none());
    assert!(requests[1].if_modified_since.is_some());

    let row = t
        .metadata
        .get_file(SITE, FileId::from_url(&url).as_str())
        .await
        .unwrap()
        .unwrap();
    assert!(!row.stale);
}

#[tokio::test]
async fn test_not_modified_without_local_copy_fails() {
    let t = TestEngine::new().await;
    let url = remote("never-stored.pdf");
    t.fetcher.fail(&url, FetchErrorKind::NotModified);
    let err = t
        .engine
        .download_url(SITE, RemoteFile::url(&url), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Fetch(e) if e.kind == FetchErrorKind::NotModified));
}

// =============================================================================
// Packages
// =============================================================================

#[tokio::test]
async fn test_download_package_marks_downloaded_and_links() {
    let t = TestEngine::new().await;
    for name in ["p1.pdf", "p2.pdf"] {
        t.fetcher.serve(&remote(name), name.as_bytes().to_vec());
    }
    let mut events = t.engine.subscribe(EventFilter::Component {
        site_id: SITE.to_string(),
        component: "mod_folder".to_string(),
        component_id: Some("7".to_string()),
    });

    t.engine
        .download_package(SITE, files(&["p1.pdf", "p2.pdf"]), "mod_folder", "7", Some("hash-a".into()))
        .await
        .unwrap();

    assert_eq!(
        t.engine.get_package_status(SITE, "mod_folder", "7").await.unwrap(),
        DownloadStatus::Downloaded
    );
    let row = t
        .engine
        .get_package_data(SITE, "mod_folder", "7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.extra.as_deref(), Some("hash-a"));
    assert_eq!(
        t.engine
            .get_files_by_component(SITE, "mod_folder", Some("7"))
            .await
            .unwrap()
            .len(),
        2
    );

    let first = next_event(&mut events, |e| matches!(e, EngineEvent::PackageStatus(_))).await;
    assert!(matches!(first, EngineEvent::PackageStatus(e) if e.status == DownloadStatus::Downloading));
}

#[tokio::test]
async fn test_concurrent_package_downloads_share_one_run() {
    let t = TestEngine::new().await;
    for name in ["a.pdf", "b.pdf"] {
        t.fetcher.serve(&remote(name), "content");
    }
    t.fetcher.close();

    let (first, second, _) = tokio::join!(
        t.engine
            .download_package(SITE, files(&["a.pdf", "b.pdf"]), "mod_page", "1", None),
        t.engine
            .download_package(SITE, files(&["a.pdf", "b.pdf"]), "mod_page", "1", None),
        async {
            tokio::time::timeout(Duration::from_secs(5), async {
                while t.fetcher.total_fetches() < 2 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
            assert_eq!(
                t.engine.get_package_status(SITE, "mod_page", "1").await.unwrap(),
                DownloadStatus::Downloading
            );
            t.fetcher.open();
        }
    );

    first.unwrap();
    second.unwrap();
    assert_eq!(t.fetcher.fetch_count(&remote("a.pdf")), 1);
    assert_eq!(t.fetcher.fetch_count(&remote("b.pdf")), 1);
    assert_eq!(
        t.engine.get_package_status(SITE, "mod_page", "1").await.unwrap(),
        DownloadStatus::Downloaded
    );
}

#[tokio::test]
async fn test_failed_package_rolls_back_to_previous_status() {
    let t = TestEngine::new().await;
    t.fetcher.serve(&remote("one.pdf"), "1");
    t.fetcher.serve(&remote("two.pdf"), "2");
    t.engine
        .download_package(
            SITE,
            files(&["one.pdf", "two.pdf"]),
            "mod_book",
            "3",
            Some("hash-v1".into()),
        )
        .await
        .unwrap();
    let before = t
        .engine
        .get_package_data(SITE, "mod_book", "3")
        .await
        .unwrap()
        .unwrap();

    t.fetcher.fail(&remote("three.pdf"), FetchErrorKind::NotFound);
    let err = t
        .engine
        .download_package(
            SITE,
            files(&["one.pdf", "two.pdf", "three.pdf"]),
            "mod_book",
            "3",
            Some("hash-v2".into()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Fetch(_)));

    let after = t
        .engine
        .get_package_data(SITE, "mod_book", "3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status().unwrap(), DownloadStatus::Downloaded);
    assert_eq!(after.download_time, before.download_time);
    // The new payload is only recorded once a download succeeds.
    assert_eq!(after.extra.as_deref(), Some("hash-v1"));
}

#[tokio::test]
async fn test_first_failed_package_returns_to_not_downloaded() {
    let t = TestEngine::new().await;
    t.fetcher.fail(&remote("broken.pdf"), FetchErrorKind::InvalidResponse);
    t.engine
        .download_package(SITE, files(&["broken.pdf"]), "mod_resource", "5", None)
        .await
        .unwrap_err();
    assert_eq!(
        t.engine.get_package_status(SITE, "mod_resource", "5").await.unwrap(),
        DownloadStatus::NotDownloaded
    );
}

#[tokio::test]
async fn test_prefetch_package_goes_through_queue() {
    let t = TestEngine::new().await;
    t.fetcher.serve(&remote("q1.pdf"), "q1");
    t.fetcher.serve(&remote("q2.pdf"), "q2");

    t.engine
        .prefetch_package(SITE, files(&["q1.pdf", "q2.pdf"]), "mod_folder", "8", None)
        .await
        .unwrap();
    t.engine.wait_until_idle().await;

    assert_eq!(
        t.engine.get_package_status(SITE, "mod_folder", "8").await.unwrap(),
        DownloadStatus::Downloaded
    );
    assert_eq!(
        t.engine
            .get_files_by_component(SITE, "mod_folder", Some("8"))
            .await
            .unwrap()
            .len(),
        2
    );
    assert!(t.engine.queue_entries(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalidate_package_emits_once() {
    let t = TestEngine::new().await;
    assert!(!t.engine.invalidate_package(SITE, "mod_page", "2").await.unwrap());

    t.fetcher.serve(&remote("page.html"), "page");
    t.engine
        .download_package(SITE, files(&["page.html"]), "mod_page", "2", None)
        .await
        .unwrap();

    let mut events = t.engine.subscribe(EventFilter::Component {
        site_id: SITE.to_string(),
        component: "mod_page".to_string(),
        component_id: None,
    });
    assert!(t.engine.invalidate_package(SITE, "mod_page", "2").await.unwrap());
    assert!(!t.engine.invalidate_package(SITE, "mod_page", "2").await.unwrap());

    let event = next_event(&mut events, |_| true).await;
    assert!(matches!(event, EngineEvent::PackageStatus(e) if e.status == DownloadStatus::Outdated));
    assert!(events.try_recv().is_none());
    assert_eq!(
        t.engine.get_package_status(SITE, "mod_page", "2").await.unwrap(),
        DownloadStatus::Outdated
    );
}

#[tokio::test]
async fn test_packages_status_aggregates() {
    let t = TestEngine::new().await;
    t.fetcher.serve(&remote("s1.pdf"), "s1");
    t.engine
        .download_package(SITE, files(&["s1.pdf"]), "mod_page", "10", None)
        .await
        .unwrap();

    let both = vec![
        ("mod_page".to_string(), "10".to_string()),
        ("mod_page".to_string(), "11".to_string()),
    ];
    assert_eq!(
        t.engine.get_packages_status(SITE, &both).await.unwrap(),
        DownloadStatus::NotDownloaded
    );
    assert_eq!(
        t.engine.get_packages_status(SITE, &both[..1]).await.unwrap(),
        DownloadStatus::Downloaded
    );
    assert_eq!(
        t.engine.get_packages_status(SITE, &[]).await.unwrap(),
        DownloadStatus::NotDownloadable
    );
}

#[tokio::test]
async fn test_clear_all_packages_status() {
    let t = TestEngine::new().await;
    t.fetcher.serve(&remote("c.pdf"), "c");
    for id in ["1", "2"] {
        t.engine
            .download_package(SITE, files(&["c.pdf"]), "mod_label", id, None)
            .await
            .unwrap();
    }

    let mut events = t.engine.subscribe(EventFilter::All);
    assert_eq!(t.engine.clear_all_packages_status(SITE).await.unwrap(), 2);
    let event = next_event(&mut events, |e| matches!(e, EngineEvent::PackageStatus(_))).await;
    assert!(matches!(event, EngineEvent::PackageStatus(e) if e.status == DownloadStatus::NotDownloaded));
    assert!(t.engine.list_packages(SITE, None).await.unwrap().is_empty());
}

// =============================================================================
// File status, invalidation and removal
// =============================================================================

#[tokio::test]
async fn test_file_state_transitions() {
    let t = TestEngine::offline().await;
    let url = remote("state.pdf");
    t.fetcher.serve(&url, "state");

    assert_eq!(
        t.engine.get_file_state(SITE, &url, Version::default()).await.unwrap(),
        DownloadStatus::NotDownloaded
    );
    t.engine
        .add_to_queue(SITE, RemoteFile::url(&url), 0, None)
        .await
        .unwrap();
    assert_eq!(
        t.engine.get_file_state(SITE, &url, Version::default()).await.unwrap(),
        DownloadStatus::Downloading
    );

    t.go_online().await;
    assert_eq!(
        t.engine.get_file_state(SITE, &url, Version::default()).await.unwrap(),
        DownloadStatus::Downloaded
    );
    assert_eq!(
        t.engine
            .get_file_state(SITE, &url, Version::new(Some(5), None))
            .await
            .unwrap(),
        DownloadStatus::Outdated
    );
    assert_eq!(
        t.engine
            .get_files_status(SITE, vec![RemoteFile::url(&url), RemoteFile::url(remote("no.pdf"))])
            .await
            .unwrap(),
        DownloadStatus::NotDownloaded
    );
}

#[tokio::test]
async fn test_invalidate_only_unknown_freshness() {
    let t = TestEngine::new().await;
    let versioned = remote("versioned.pdf");
    let unversioned = "https://school.example/files/plain.pdf".to_string();
    t.fetcher.serve(&versioned, "v");
    t.fetcher.serve(&unversioned, "u");
    for url in [&versioned, &unversioned] {
        t.engine
            .download_url(SITE, RemoteFile::url(url), None, false)
            .await
            .unwrap();
    }

    let marked = t
        .engine
        .invalidate(SITE, InvalidateScope::All, true)
        .await
        .unwrap();
    assert_eq!(marked, 1);
    assert_eq!(
        t.engine
            .get_file_state(SITE, &versioned, Version::default())
            .await
            .unwrap(),
        DownloadStatus::Downloaded
    );
    assert_eq!(
        t.engine
            .get_file_state(SITE, &unversioned, Version::default())
            .await
            .unwrap(),
        DownloadStatus::Outdated
    );

    t.engine
        .invalidate(SITE, InvalidateScope::All, false)
        .await
        .unwrap();
    assert_eq!(
        t.engine
            .get_file_state(SITE, &versioned, Version::default())
            .await
            .unwrap(),
        DownloadStatus::Outdated
    );
    // Invalidation never touches the queue.
    assert!(t.engine.queue_entries(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalidate_component_scope() {
    let t = TestEngine::new().await;
    let a = remote("ca.pdf");
    let b = remote("cb.pdf");
    t.fetcher.serve(&a, "a");
    t.fetcher.serve(&b, "b");
    t.engine
        .download_url(SITE, RemoteFile::url(&a), Some(FileLink::new("mod_quiz", Some("1"))), false)
        .await
        .unwrap();
    t.engine
        .download_url(SITE, RemoteFile::url(&b), Some(FileLink::new("mod_quiz", Some("2"))), false)
        .await
        .unwrap();

    let scope = InvalidateScope::Component {
        component: "mod_quiz".to_string(),
        component_id: Some("1".to_string()),
    };
    assert_eq!(t.engine.invalidate(SITE, scope, false).await.unwrap(), 1);
    assert_eq!(
        t.engine.get_file_state(SITE, &a, Version::default()).await.unwrap(),
        DownloadStatus::Outdated
    );
    assert_eq!(
        t.engine.get_file_state(SITE, &b, Version::default()).await.unwrap(),
        DownloadStatus::Downloaded
    );
}

#[tokio::test]
async fn test_remove_file_by_url() {
    let t = TestEngine::new().await;
    let url = remote("remove.pdf");
    t.fetcher.serve(&url, "remove");
    let path = t
        .engine
        .download_url(SITE, RemoteFile::url(&url), Some(FileLink::new("mod_resource", Some("1"))), false)
        .await
        .unwrap();

    let file_id = FileId::from_url(&url);
    let mut events = t.engine.subscribe(EventFilter::Component {
        site_id: SITE.to_string(),
        component: "mod_resource".to_string(),
        component_id: Some("1".to_string()),
    });
    assert!(t.engine.remove_file_by_url(SITE, &url).await.unwrap());
    assert!(!path.exists());
    assert!(t.metadata.get_file(SITE, file_id.as_str()).await.unwrap().is_none());
    assert!(t.metadata.links_for_file(SITE, file_id.as_str()).await.unwrap().is_empty());

    let event = next_event(&mut events, |_| true).await;
    assert!(matches!(event, EngineEvent::File(e) if e.action == FileAction::Deleted));

    assert!(!t.engine.remove_file_by_url(SITE, &url).await.unwrap());
}

#[tokio::test]
async fn test_remove_by_component_keeps_shared_files() {
    let t = TestEngine::new().await;
    let shared = remote("shared.pdf");
    let own = remote("own.pdf");
    t.fetcher.serve(&shared, "shared");
    t.fetcher.serve(&own, "own");

    for (url, id) in [(&shared, "1"), (&own, "1"), (&shared, "2")] {
        t.engine
            .download_url(SITE, RemoteFile::url(url), Some(FileLink::new("mod_folder", Some(id))), false)
            .await
            .unwrap();
    }
    assert_eq!(
        t.engine
            .get_component_disk_usage(SITE, "mod_folder", Some("1"))
            .await
            .unwrap(),
        9
    );

    let removed = t
        .engine
        .remove_files_by_component(SITE, "mod_folder", Some("1"))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let remaining = t.engine.list_files(SITE).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].file_id, FileId::from_url(&shared).as_str());
    assert!(
        t.engine
            .get_files_by_component(SITE, "mod_folder", Some("1"))
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        t.engine
            .get_component_disk_usage(SITE, "mod_folder", Some("2"))
            .await
            .unwrap(),
        6
    );
}
