//! End-to-end loader scenarios: dependency ordering, checksum
//! enforcement, stage caching and invalidation, rendezvous, task
//! forces, cancellation, and the lockfile.

mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use kiln_core::carton::{BUILD, INSTALL, PACKAGE, PREPARE};
use kiln_core::fetch::FetchError;
use kiln_core::runbook::{Flow, Notifier, RunbookError};
use kiln_core::{Engine, LoadError, Task};

const STAGES: [&str; 6] = ["fetch", "patch", "prepare", "build", "install", "package"];

fn event_task(events: &Arc<Mutex<Vec<String>>>, tag: &str) -> Task {
    let events = Arc::clone(events);
    let tag = tag.to_string();
    Task::native(move |_ctx| {
        let events = Arc::clone(&events);
        let tag = tag.clone();
        async move {
            events.lock().unwrap().push(tag);
            Ok(())
        }
    })
}

fn counter_task(path: std::path::PathBuf) -> Task {
    Task::native(move |_ctx| {
        let path = path.clone();
        async move {
            common::bump(&path);
            Ok(())
        }
    })
}

/// S1: `zlib` depends on `busybox`; every stage of busybox completes
/// before zlib's package stage, markers land for both, and the
/// rendezvous notifier observes the dependency's completion.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_s1_dependency_order_and_markers() {
    let tmp = TempDir::new().unwrap();
    let bb = common::tgz(&[("busybox-1.32.0/README", "busybox")]);
    let zl = common::tgz(&[("zlib-1.2.11/README", "zlib")]);
    let bb_sum = common::sha256_of(&bb);
    let zl_sum = common::sha256_of(&zl);

    let mut files = HashMap::new();
    files.insert("/busybox-1.32.0.tar.gz".to_string(), bb);
    files.insert("/zlib-1.2.11.tar.gz".to_string(), zl);
    let base = common::serve(files, false).await;

    let events: Arc<Mutex<Vec<String>>> = Arc::default();
    let engine = Engine::new(common::settings(tmp.path()));

    {
        let base = base.clone();
        let events = Arc::clone(&events);
        engine.new_carton("busybox", file!(), move |c| {
            c.resource()
                .push_http("1.32.0", &format!("{base}/busybox-1.32.0.tar.gz#{bb_sum}"));
            let stage = c.runbook().stage(PACKAGE).unwrap();
            let _ = stage.add_task(0, event_task(&events, "busybox:package"));
        });
    }
    {
        let events = Arc::clone(&events);
        engine.new_carton("zlib", file!(), move |c| {
            c.depends_on("busybox");
            c.resource()
                .push_http("1.2.11", &format!("{base}/zlib-1.2.11.tar.gz#{zl_sum}"));

            let build = c.runbook().stage(BUILD).unwrap();
            let _ = build.add_task(0, event_task(&events, "zlib:build"));

            let notify_events = Arc::clone(&events);
            let notifier: Notifier = Arc::new(move |_ctx, stage| {
                notify_events.lock().unwrap().push(format!("notified:{stage}"));
                Ok(Flow::Continue)
            });
            build.depends_on("busybox@install", Some(notifier));
        });
    }

    let loader = engine.new_loader("kiln").await.unwrap();
    loader
        .run(&["zlib".to_string()], false, false)
        .await
        .unwrap();

    let events = events.lock().unwrap();
    let bb_pkg = events.iter().position(|e| e == "busybox:package").unwrap();
    let zl_build = events.iter().position(|e| e == "zlib:build").unwrap();
    let notified = events
        .iter()
        .position(|e| e == "notified:install")
        .unwrap();
    assert!(bb_pkg < zl_build, "busybox must package before zlib builds");
    assert!(notified < zl_build, "notifier fires before the waiter runs");

    common::assert_markers(
        &common::temp_dir_of(tmp.path(), "busybox", "1.32.0"),
        &STAGES,
    );
    common::assert_markers(&common::temp_dir_of(tmp.path(), "zlib", "1.2.11"), &STAGES);
}

/// S2: a wrong checksum fails the dependent carton with
/// `CheckSumError`, names it in the banner, leaves no download
/// marker, and does not stop the dependency from finishing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_s2_checksum_mismatch() {
    let tmp = TempDir::new().unwrap();
    let bb = common::tgz(&[("busybox-1.32.0/README", "busybox")]);
    let zl = common::tgz(&[("zlib-1.2.11/README", "zlib")]);
    let bb_sum = common::sha256_of(&bb);
    let bogus = "0".repeat(64);

    let mut files = HashMap::new();
    files.insert("/busybox-1.32.0.tar.gz".to_string(), bb);
    files.insert("/zlib-1.2.11.tar.gz".to_string(), zl);
    let base = common::serve(files, false).await;

    let engine = Engine::new(common::settings(tmp.path()));
    {
        let base = base.clone();
        engine.new_carton("busybox", file!(), move |c| {
            c.resource()
                .push_http("1.32.0", &format!("{base}/busybox-1.32.0.tar.gz#{bb_sum}"));
        });
    }
    engine.new_carton("zlib", file!(), move |c| {
        c.depends_on("busybox");
        c.resource()
            .push_http("1.2.11", &format!("{base}/zlib-1.2.11.tar.gz#{bogus}"));
    });

    let loader = engine.new_loader("kiln").await.unwrap();
    let err = loader
        .run(&["zlib".to_string()], false, false)
        .await
        .unwrap_err();

    let LoadError::Failed { carton, source, .. } = &err else {
        panic!("expected Failed, got {err}");
    };
    assert_eq!(carton, "zlib");
    assert!(matches!(
        source,
        RunbookError::Fetch(FetchError::CheckSum { .. })
    ));
    assert!(err.to_string().contains("zlib"));

    // The dependency completed before zlib's fetch could fail.
    common::assert_markers(
        &common::temp_dir_of(tmp.path(), "busybox", "1.32.0"),
        &STAGES,
    );
    // No validation marker for the bad archive, no stage marker either.
    assert!(!tmp
        .path()
        .join("build/downloads/zlib-1.2.11.tar.gz.done")
        .exists());
    assert!(!common::temp_dir_of(tmp.path(), "zlib", "1.2.11")
        .join("fetch.done")
        .exists());
}

/// Unknown carton names surface as a failed entry, not a hang.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_carton_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::new(common::settings(tmp.path()));
    engine.new_carton("real", file!(), |c| {
        c.set_src_path("src");
    });

    let loader = engine.new_loader("kiln").await.unwrap();
    let err = loader
        .run(&["ghost".to_string()], false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Failed { carton, .. } if carton == "ghost"));
}

fn register_counting_app(
    engine: &Engine,
    base: &str,
    sum: &str,
    counters: &Path,
) {
    let base = base.to_string();
    let sum = sum.to_string();
    let counters = counters.to_path_buf();
    engine.new_carton("app", file!(), move |c| {
        c.resource()
            .push_http("1.0", &format!("{base}/app-1.0.tar.gz#{sum}"));
        let rb = c.runbook().clone();
        for stage in [PREPARE, BUILD, INSTALL] {
            let _ = rb
                .stage(stage)
                .unwrap()
                .add_task(0, counter_task(counters.join(stage)));
        }
    });
}

/// Property 7: a second run replays nothing; removing one marker
/// replays that stage and everything after it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idempotent_replay_and_marker_removal() {
    let tmp = TempDir::new().unwrap();
    let archive = common::tgz(&[("app-1.0/README", "app")]);
    let sum = common::sha256_of(&archive);
    let mut files = HashMap::new();
    files.insert("/app-1.0.tar.gz".to_string(), archive);
    let base = common::serve(files, false).await;

    let counters = tmp.path().join("counters");
    std::fs::create_dir_all(&counters).unwrap();

    for _ in 0..2 {
        let engine = Engine::new(common::settings(tmp.path()));
        register_counting_app(&engine, &base, &sum, &counters);
        let loader = engine.new_loader("kiln").await.unwrap();
        loader
            .run(&["app".to_string()], false, false)
            .await
            .unwrap();
    }

    // Unchanged inputs: every counted stage ran exactly once.
    assert_eq!(common::counter(&counters.join(PREPARE)), 1);
    assert_eq!(common::counter(&counters.join(BUILD)), 1);
    assert_eq!(common::counter(&counters.join(INSTALL)), 1);

    // Drop build's marker: build and every stage after it replay.
    let temp = common::temp_dir_of(tmp.path(), "app", "1.0");
    std::fs::remove_file(temp.join("build.done")).unwrap();

    let engine = Engine::new(common::settings(tmp.path()));
    register_counting_app(&engine, &base, &sum, &counters);
    let loader = engine.new_loader("kiln").await.unwrap();
    loader
        .run(&["app".to_string()], false, false)
        .await
        .unwrap();

    assert_eq!(common::counter(&counters.join(PREPARE)), 1);
    assert_eq!(common::counter(&counters.join(BUILD)), 2);
    assert_eq!(common::counter(&counters.join(INSTALL)), 2);
    common::assert_markers(&temp, &STAGES);
}

/// `--force` drops every marker first, replaying the whole runbook.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_force_replays_all_stages() {
    let tmp = TempDir::new().unwrap();
    let archive = common::tgz(&[("app-1.0/README", "app")]);
    let sum = common::sha256_of(&archive);
    let mut files = HashMap::new();
    files.insert("/app-1.0.tar.gz".to_string(), archive);
    let base = common::serve(files, false).await;

    let counters = tmp.path().join("counters");
    std::fs::create_dir_all(&counters).unwrap();

    for force in [false, true] {
        let engine = Engine::new(common::settings(tmp.path()));
        register_counting_app(&engine, &base, &sum, &counters);
        let loader = engine.new_loader("kiln").await.unwrap();
        loader
            .run(&["app".to_string()], false, force)
            .await
            .unwrap();
    }

    assert_eq!(common::counter(&counters.join(BUILD)), 2);
    assert_eq!(common::counter(&counters.join(INSTALL)), 2);
}

/// S6 / property 8: a changed `file://` source flips `updated`, which
/// resets every later stage's marker so the runbook replays.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_source_change_invalidates_stages() {
    let tmp = TempDir::new().unwrap();
    let recipe_dir = tmp.path().join("meta");
    std::fs::create_dir_all(recipe_dir.join("files")).unwrap();
    std::fs::write(recipe_dir.join("files/fix.patch"), "-old\n+new\n").unwrap();

    let counters = tmp.path().join("counters");
    std::fs::create_dir_all(&counters).unwrap();

    let register = |engine: &Engine| {
        let recipe_dir = recipe_dir.clone();
        let counters = counters.clone();
        engine.new_carton("app", file!(), move |c| {
            c.add_file_path(recipe_dir).unwrap();
            c.set_src_path("files");
            c.resource().push_file("1.0", "file://files/fix.patch");
            let rb = c.runbook().clone();
            for stage in [PREPARE, BUILD, INSTALL] {
                let _ = rb
                    .stage(stage)
                    .unwrap()
                    .add_task(0, counter_task(counters.join(stage)));
            }
        });
    };

    for _ in 0..2 {
        let engine = Engine::new(common::settings(tmp.path()));
        register(&engine);
        let loader = engine.new_loader("kiln").await.unwrap();
        loader
            .run(&["app".to_string()], false, false)
            .await
            .unwrap();
    }
    // Same content on the second run: nothing replayed.
    assert_eq!(common::counter(&counters.join(BUILD)), 1);

    // Change the source; the fetcher syncs it and resets later stages.
    std::fs::write(recipe_dir.join("files/fix.patch"), "-old\n+newer\n").unwrap();
    let engine = Engine::new(common::settings(tmp.path()));
    register(&engine);
    let loader = engine.new_loader("kiln").await.unwrap();
    loader
        .run(&["app".to_string()], false, false)
        .await
        .unwrap();

    assert_eq!(common::counter(&counters.join(PREPARE)), 2);
    assert_eq!(common::counter(&counters.join(BUILD)), 2);
    assert_eq!(common::counter(&counters.join(INSTALL)), 2);

    // The synced copy matches the new content.
    let wd = common::temp_dir_of(tmp.path(), "app", "1.0")
        .parent()
        .unwrap()
        .to_path_buf();
    assert_eq!(
        std::fs::read_to_string(wd.join("files/fix.patch")).unwrap(),
        "-old\n+newer\n"
    );
}

/// S4: a task-force target runs no stage.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_s4_printenv_runs_no_stage() {
    let tmp = TempDir::new().unwrap();

    let engine = Engine::new(common::settings(tmp.path()));
    engine.new_carton("app", file!(), |c| {
        c.set_src_path("src");
    });

    let loader = engine.new_loader("kiln").await.unwrap();
    loader
        .run(&["app@printenv".to_string()], false, false)
        .await
        .unwrap();

    // Task forces skip the stage machinery entirely.
    let temp = common::temp_dir_of(tmp.path(), "app", "");
    for stage in STAGES {
        assert!(!temp.join(format!("{stage}.done")).exists());
    }
}

/// The context snapshot carries every key the environment contract
/// promises to scripts.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_context_snapshot_keys() {
    let tmp = TempDir::new().unwrap();
    let seen: Arc<Mutex<HashMap<String, String>>> = Arc::default();

    let engine = Engine::new(common::settings(tmp.path()));
    {
        let seen = Arc::clone(&seen);
        engine.new_carton("app", file!(), move |c| {
            c.set_src_path("src");
            let seen = Arc::clone(&seen);
            let _ = c.runbook().add_task_force(
                "snapenv",
                Task::native(move |ctx| {
                    let seen = Arc::clone(&seen);
                    async move {
                        ctx.range(|k, v| {
                            seen.lock().unwrap().insert(k.to_string(), v.to_string());
                        });
                        Ok(())
                    }
                }),
            );
        });
    }

    let loader = engine.new_loader("kiln").await.unwrap();
    loader
        .run(&["app@snapenv".to_string()], false, false)
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    for key in ["WORKDIR", "S", "D", "T", "PN", "TARGETARCH", "DLDIR", "TOPDIR"] {
        assert!(seen.contains_key(key), "missing context key {key}");
    }
    assert_eq!(seen["PN"], "app");
    assert_eq!(seen["TARGETARCH"], "arm");
    assert!(seen["S"].ends_with("/src"));
}

/// Scripts see the context as environment variables and run under
/// `/bin/bash`; a failing script surfaces its stderr in the banner.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_script_env_and_error_transcript() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::new(common::settings(tmp.path()));

    engine.new_image("envapp", file!(), |c| {
        let rb = c.runbook().clone();
        let _ = rb.stage(PREPARE).unwrap().add_task(
            0,
            Task::script(r#"[ -n "$WORKDIR" ] && [ "$PN" = envapp ] && [ -n "$T" ]"#),
        );
        let _ = rb
            .stage(BUILD)
            .unwrap()
            .add_task(0, Task::script("echo boom >&2; exit 3"));
    });

    let loader = engine.new_loader("kiln").await.unwrap();
    let err = loader
        .run(&["envapp".to_string()], false, false)
        .await
        .unwrap_err();

    let LoadError::Failed { carton, source, log } = &err else {
        panic!("expected Failed, got {err}");
    };
    assert_eq!(carton, "envapp");
    assert!(matches!(
        source,
        RunbookError::ScriptFailed { code: 3, .. }
    ));
    assert!(log.contains("boom"), "transcript should carry stderr: {log:?}");

    // The prepare stage passed; its marker exists, build's does not.
    let temp = common::temp_dir_of(tmp.path(), "envapp", "");
    assert!(temp.join("prepare.done").exists());
    assert!(!temp.join("build.done").exists());
}

/// Property 10: cancelling the loader kills running scripts promptly
/// and leaves no marker for the in-flight stage.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_kills_subprocesses() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::new(common::settings(tmp.path()));

    engine.new_image("slow", file!(), |c| {
        let rb = c.runbook().clone();
        let _ = rb
            .stage(PREPARE)
            .unwrap()
            .add_task(0, Task::script("sleep 30 & sleep 30"));
    });

    let loader = engine.new_loader("kiln").await.unwrap();
    let started = Instant::now();
    {
        let loader = Arc::clone(&loader);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            loader.cancel();
        });
    }

    let err = loader
        .run(&["slow".to_string()], false, false)
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    let LoadError::Failed { source, .. } = &err else {
        panic!("expected Failed, got {err}");
    };
    assert!(matches!(
        source,
        RunbookError::Cancelled | RunbookError::Context(_)
    ));

    let temp = common::temp_dir_of(tmp.path(), "slow", "");
    assert!(!temp.join("prepare.done").exists());
}

/// A stage that overruns `TIMEOUT` fails with the expired error.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stage_timeout_expires() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::new(common::settings(tmp.path()));

    engine.new_image("laggard", file!(), |c| {
        c.set("TIMEOUT", 1);
        let rb = c.runbook().clone();
        let _ = rb.stage(PREPARE).unwrap().add_task(0, Task::script("sleep 30"));
    });

    let loader = engine.new_loader("kiln").await.unwrap();
    let started = Instant::now();
    let err = loader
        .run(&["laggard".to_string()], false, false)
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    let LoadError::Failed { source, .. } = &err else {
        panic!("expected Failed, got {err}");
    };
    assert!(matches!(
        source,
        RunbookError::Expired { secs: 1, .. }
    ));
}

/// S5: a second loader against the same build directory is refused.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_s5_lockfile_excludes_second_loader() {
    let tmp = TempDir::new().unwrap();

    let engine1 = Engine::new(common::settings(tmp.path()));
    engine1.new_carton("a", file!(), |c| {
        c.set_src_path("src");
    });
    let loader1 = engine1.new_loader("kiln").await.unwrap();

    let engine2 = Engine::new(common::settings(tmp.path()));
    engine2.new_carton("a", file!(), |c| {
        c.set_src_path("src");
    });
    let err = engine2.new_loader("kiln").await.unwrap_err();
    assert!(matches!(err, LoadError::Busy { .. }));

    // Releasing the first loader frees the build directory.
    drop(loader1);
    assert!(engine2.new_loader("kiln").await.is_ok());
}

/// A disabled stage plays as a no-op: its tasks never run and no
/// marker appears, but the rest of the runbook proceeds.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disabled_stage_is_noop() {
    let tmp = TempDir::new().unwrap();
    let counters = tmp.path().join("counters");
    std::fs::create_dir_all(&counters).unwrap();

    let engine = Engine::new(common::settings(tmp.path()));
    {
        let counters = counters.clone();
        engine.new_image("partial", file!(), move |c| {
            let rb = c.runbook().clone();
            let prepare = rb.stage(PREPARE).unwrap();
            let _ = prepare.add_task(0, counter_task(counters.join(PREPARE)));
            prepare.disable();
            let _ = rb
                .stage(BUILD)
                .unwrap()
                .add_task(0, counter_task(counters.join(BUILD)));
        });
    }

    let loader = engine.new_loader("kiln").await.unwrap();
    loader
        .run(&["partial".to_string()], false, false)
        .await
        .unwrap();

    assert_eq!(common::counter(&counters.join(PREPARE)), 0);
    assert_eq!(common::counter(&counters.join(BUILD)), 1);
    let temp = common::temp_dir_of(tmp.path(), "partial", "");
    assert!(!temp.join("prepare.done").exists());
    assert!(temp.join("build.done").exists());
}

/// A `-native` dependency builds in its own host-flavored work
/// directory.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_native_dependency_uses_native_workdir() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::new(common::settings(tmp.path()));

    engine.new_carton("tool", file!(), |c| {
        c.set_src_path("src");
    });
    engine.new_carton("app", file!(), |c| {
        c.set_src_path("src");
        c.build_depends_on("tool-native");
    });

    let loader = engine.new_loader("kiln").await.unwrap();
    loader
        .run(&["app".to_string()], false, false)
        .await
        .unwrap();

    let native_temp = tmp
        .path()
        .join("build/tmp/work")
        .join(format!(
            "{}-{}",
            std::env::consts::ARCH,
            std::env::consts::OS
        ))
        .join("tool-native")
        .join("temp");
    assert!(native_temp.join("package.done").exists());
    // The cross flavor of the tool was never scheduled.
    assert!(!common::temp_dir_of(tmp.path(), "tool", "")
        .join("package.done")
        .exists());
}
