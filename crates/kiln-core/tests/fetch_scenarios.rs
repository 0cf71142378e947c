//! Fetch-engine scenarios: ranged HTTP downloads, marker-gated
//! re-fetching, git checkouts, and file-source misses.

mod common;

use std::collections::HashMap;
use std::path::Path;

use tempfile::TempDir;

use kiln_core::fetch::FetchError;
use kiln_core::runbook::RunbookError;
use kiln_core::{Engine, LoadError};

fn register_blob(engine: &Engine, base: &str, sum: &str) {
    let url = format!("{base}/blob-1.0.bin#{sum}");
    engine.new_carton("blob", file!(), move |c| {
        c.set_src_path("src");
        c.resource().push_http("1.0", &url);
    });
}

/// A body over the ranged threshold from a server that accepts ranges
/// arrives intact through the sliced download path.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ranged_download_reassembles() {
    let tmp = TempDir::new().unwrap();
    let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let sum = common::sha256_of(&payload);

    let mut files = HashMap::new();
    files.insert("/blob-1.0.bin".to_string(), payload.clone());
    let base = common::serve(files, true).await;

    let engine = Engine::new(common::settings(tmp.path()));
    register_blob(&engine, &base, &sum);

    let loader = engine.new_loader("kiln").await.unwrap();
    loader
        .run(&["blob".to_string()], false, false)
        .await
        .unwrap();

    let dest = tmp.path().join("build/downloads/blob-1.0.bin");
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
    assert!(Path::new(&format!("{}.done", dest.display())).exists());
    // No slice leftovers.
    assert!(!Path::new(&format!("{}.0", dest.display())).exists());
}

/// A present `.done` marker bypasses re-downloading; dropping it
/// forces a fresh fetch even though the archive file exists.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_download_marker_gates_refetch() {
    let tmp = TempDir::new().unwrap();
    let payload = b"original payload".to_vec();
    let sum = common::sha256_of(&payload);

    let mut files = HashMap::new();
    files.insert("/blob-1.0.bin".to_string(), payload.clone());
    let base = common::serve(files, false).await;

    let run = |force: bool| {
        let base = base.clone();
        let sum = sum.clone();
        let tmp = tmp.path().to_path_buf();
        async move {
            let engine = Engine::new(common::settings(&tmp));
            register_blob(&engine, &base, &sum);
            let loader = engine.new_loader("kiln").await.unwrap();
            loader.run(&["blob".to_string()], false, force).await
        }
    };

    run(false).await.unwrap();
    let dest = tmp.path().join("build/downloads/blob-1.0.bin");

    // Scribble over the archive; the marker keeps the fetcher away.
    std::fs::write(&dest, b"scribbled").unwrap();
    run(true).await.unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), b"scribbled");

    // Without the marker the archive is re-fetched and re-verified.
    std::fs::remove_file(format!("{}.done", dest.display())).unwrap();
    run(true).await.unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}

/// Clone a repository, check out a tag, and detect the HEAD move.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_git_clone_and_tag_checkout() {
    if std::process::Command::new("git")
        .arg("--version")
        .output()
        .is_err()
    {
        return;
    }

    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("upstream");
    std::fs::create_dir_all(&repo).unwrap();
    let git = |args: &[&str]| {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(&repo)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@t")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@t")
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?}: {out:?}");
    };
    git(&["init"]);
    std::fs::write(repo.join("lib.c"), "int one(void) { return 1; }\n").unwrap();
    git(&["add", "-A"]);
    git(&["commit", "-m", "one"]);
    git(&["branch", "-m", "master"]);
    git(&["tag", "v1.0"]);
    std::fs::write(repo.join("lib.c"), "int one(void) { return 2; }\n").unwrap();
    git(&["add", "-A"]);
    git(&["commit", "-m", "two"]);

    let engine = Engine::new(common::settings(tmp.path()));
    let url = format!("{}@v1.0", repo.display());
    engine.new_carton("upstream", file!(), move |c| {
        c.resource().push_vcs("1.0", &url);
        c.set_src_path("upstream");
    });

    let loader = engine.new_loader("kiln").await.unwrap();
    loader
        .run(&["upstream".to_string()], false, false)
        .await
        .unwrap();

    // The checkout sits at the tagged revision, not the branch tip.
    let wd = common::temp_dir_of(tmp.path(), "upstream", "1.0")
        .parent()
        .unwrap()
        .to_path_buf();
    let content = std::fs::read_to_string(wd.join("upstream/lib.c")).unwrap();
    assert!(content.contains("return 1"), "expected the v1.0 tree");
}

/// A `file://` source missing from every search path is an error.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_source_not_found() {
    let tmp = TempDir::new().unwrap();
    let meta = tmp.path().join("meta");
    std::fs::create_dir_all(&meta).unwrap();

    let engine = Engine::new(common::settings(tmp.path()));
    engine.new_carton("app", file!(), move |c| {
        c.add_file_path(meta).unwrap();
        c.set_src_path("src");
        c.resource().push_file("1.0", "file://missing/thing");
    });

    let loader = engine.new_loader("kiln").await.unwrap();
    let err = loader
        .run(&["app".to_string()], false, false)
        .await
        .unwrap_err();
    let LoadError::Failed { source, .. } = &err else {
        panic!("expected Failed, got {err}");
    };
    assert!(matches!(
        source,
        RunbookError::Fetch(FetchError::NotFoundInPaths(_))
    ));
}

/// An HTTP URL without a checksum is rejected outright.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_http_url_requires_checksum() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::new(common::settings(tmp.path()));
    engine.new_carton("app", file!(), |c| {
        c.set_src_path("src");
        c.resource()
            .push_http("1.0", "http://127.0.0.1:9/app-1.0.tar.gz");
    });

    let loader = engine.new_loader("kiln").await.unwrap();
    let err = loader
        .run(&["app".to_string()], false, false)
        .await
        .unwrap_err();
    let LoadError::Failed { source, .. } = &err else {
        panic!("expected Failed, got {err}");
    };
    assert!(matches!(
        source,
        RunbookError::Fetch(FetchError::MissingChecksum(_))
    ));
}
