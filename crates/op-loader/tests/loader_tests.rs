//! End-to-end loads over the in-memory file system

mod common;

use common::*;
use op_core::error::{LoadError, PakError};
use op_format::{DependencyKind, Layout, PackageBuilder, PackageGuid, PackageIndex};
use op_loader::{LoadFlags, LoadResult, ObjectFlags, RawData};
use std::time::Duration;

fn chain_package(name: &str, exports: usize, depth: usize) -> PackageBuilder {
    let mut builder = PackageBuilder::new(name);
    let class = builder.import_class(SCRIPT, BLOB);
    let mut previous = PackageIndex::NULL;
    for i in 0..exports {
        let outer = if i % 5 == 4 { previous } else { PackageIndex::NULL };
        let export = builder.add_export(&format!("Obj{}", i), class, outer, vec![i as u8; i + 1]);
        if depth > 0 && i % (depth + 1) != 0 {
            builder.add_dependency(export, DependencyKind::SerializeBeforeSerialize, previous);
        }
        previous = export;
    }
    builder
}

fn expected_path(name: &str, i: usize) -> String {
    if i % 5 == 4 {
        format!("{}.Obj{}.Obj{}", name, i - 1, i)
    } else {
        format!("{}.Obj{}", name, i)
    }
}

#[test]
fn test_roundtrip_identity_triples() {
    for multithreaded in [false, true] {
        let harness = Harness::new(multithreaded);
        let log = CompletionLog::new();
        let mut names = Vec::new();
        for exports in [0usize, 1, 50] {
            for depth in [0usize, 3] {
                let name = format!("/Game/Chain{}_{}", exports, depth);
                harness.install(&chain_package(&name, exports, depth), Layout::Combined);
                harness.request(&name, &log);
                names.push((name, exports));
            }
        }
        harness.loader.flush(None).unwrap();
        assert_eq!(log.len(), names.len());

        for (name, exports) in names {
            assert!(log.result_of(&name).is_success(), "{} failed", name);
            let package = harness.store.find(&name).unwrap();
            assert!(package.has_flags(ObjectFlags::FULLY_LOADED));
            for i in 0..exports {
                let path = expected_path(&name, i);
                let object = harness.store.find(&path).unwrap_or_else(|| panic!("{} missing", path));
                assert_eq!(object.name(), format!("Obj{}", i));
                assert_eq!(object.class(), "/Script/Core.Blob");
                let outer = if i % 5 == 4 {
                    expected_path(&name, i - 1)
                } else {
                    name.clone()
                };
                assert_eq!(object.outer(), Some(outer.as_str()));
                assert!(object.has_flags(ObjectFlags::FULLY_LOADED));
                let data = object.data_as::<RawData>().unwrap();
                assert_eq!(data.bytes, vec![i as u8; i + 1]);
                assert!(data.post_loaded);
            }
        }
        assert_eq!(harness.loader.in_flight_package_count(), 0);
    }
}

#[test]
fn test_split_layout_loads() {
    let harness = Harness::new(false);
    let log = CompletionLog::new();
    harness.install(&blob_package("/Game/Split", &[vec![1, 2, 3], vec![4; 40]]), Layout::Split);
    harness.request("/Game/Split", &log);
    harness.loader.flush(None).unwrap();

    assert!(log.result_of("/Game/Split").is_success());
    let object = harness.store.find("/Game/Split.Obj1").unwrap();
    assert_eq!(object.data_as::<RawData>().unwrap().bytes, vec![4; 40]);
}

#[test]
fn test_duplicate_requests_share_one_package() {
    let harness = Harness::new(false);
    let log = CompletionLog::new();
    harness.install(&blob_package("/Game/Twice", &[vec![9; 8]]), Layout::Combined);
    let first = harness.request("/Game/Twice", &log);
    let second = harness.request("/Game/Twice", &log);
    assert_ne!(first, second);
    harness.loader.flush(None).unwrap();

    let entries = log.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|c| c.result.is_success()));
    let objects: Vec<_> = entries.iter().map(|c| c.object.clone().unwrap()).collect();
    assert!(std::sync::Arc::ptr_eq(&objects[0], &objects[1]));
    assert_eq!(harness.loader.stats().packages_created, 1);
}

#[test]
fn test_loaded_package_completes_immediately() {
    let harness = Harness::new(false);
    let log = CompletionLog::new();
    harness.install(&blob_package("/Game/Again", &[vec![1]]), Layout::Combined);
    harness.request("/Game/Again", &log);
    harness.loader.flush(None).unwrap();
    harness.request("/Game/Again", &log);
    harness.loader.flush(None).unwrap();

    assert_eq!(log.len(), 2);
    assert!(log.entries().iter().all(|c| c.result.is_success()));
    assert_eq!(harness.loader.stats().packages_created, 1);
}

/// A.Foo reads B.Bar, so B's Bar must serialize before Foo
fn install_a_and_b(harness: &Harness) {
    let mut b = PackageBuilder::new("/Game/B");
    let widget = b.import_class(SCRIPT, WIDGET);
    b.add_export("Bar", widget, PackageIndex::NULL, widget_payload(7, PackageIndex::NULL));
    harness.install(&b, Layout::Combined);

    let mut a = PackageBuilder::new("/Game/A");
    let bar = a.import_object("/Game/B", SCRIPT, WIDGET, "Bar");
    let widget = a.import_class(SCRIPT, WIDGET);
    let foo = a.add_export("Foo", widget, PackageIndex::NULL, widget_payload(1, bar));
    a.add_dependency(foo, DependencyKind::SerializeBeforeSerialize, bar);
    harness.install(&a, Layout::Combined);
}

#[test]
fn test_import_waits_for_dependency() {
    for multithreaded in [false, true] {
        let harness = Harness::new(multithreaded);
        install_a_and_b(&harness);
        let log = CompletionLog::new();
        harness.request("/Game/A", &log);
        harness.loader.flush(None).unwrap();

        assert!(log.result_of("/Game/A").is_success());
        let foo = harness.store.find("/Game/A.Foo").unwrap();
        let widget = foo.data_as::<Widget>().unwrap();
        assert_eq!(widget.value, 1);
        assert_eq!(widget.link.as_deref(), Some("/Game/B.Bar"));
        assert!(widget.post_loaded);

        let bar = harness.store.find("/Game/B.Bar").unwrap();
        assert!(bar.has_flags(ObjectFlags::FULLY_LOADED));
        assert_eq!(bar.data_as::<Widget>().unwrap().value, 7);
        assert!(harness.store.find("/Game/B").unwrap().has_flags(ObjectFlags::FULLY_LOADED));

        let stats = harness.loader.stats();
        assert_eq!(stats.packages_created, 2);
        assert_eq!(stats.packages_completed, 2);
        assert_eq!(harness.loader.deferred_package_count(), 0);
    }
}

#[test]
fn test_later_package_resolves_import_from_memory() {
    let harness = Harness::new(false);
    install_a_and_b(&harness);
    let log = CompletionLog::new();
    harness.request("/Game/B", &log);
    harness.loader.flush(None).unwrap();
    harness.request("/Game/A", &log);
    harness.loader.flush(None).unwrap();

    assert!(log.result_of("/Game/A").is_success());
    assert_eq!(harness.loader.stats().packages_created, 2);
    let foo = harness.store.find("/Game/A.Foo").unwrap();
    assert_eq!(foo.data_as::<Widget>().unwrap().link.as_deref(), Some("/Game/B.Bar"));
}

#[test]
fn test_missing_dependency_fails_once_cached() {
    let harness = Harness::new(false);
    let mut a = PackageBuilder::new("/Game/Orphan");
    let gone = a.import_object("/Game/Gone", SCRIPT, WIDGET, "Thing");
    let widget = a.import_class(SCRIPT, WIDGET);
    a.add_export("Foo", widget, PackageIndex::NULL, widget_payload(1, gone));
    harness.install(&a, Layout::Combined);

    let log = CompletionLog::new();
    harness.request("/Game/Orphan", &log);
    harness.loader.flush(None).unwrap();
    harness.request("/Game/Orphan", &log);
    harness.loader.flush(None).unwrap();

    let entries = log.entries();
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        match entry.result.error() {
            Some(PakError::Load(LoadError::MissingPackage(name))) => assert_eq!(name, "/Game/Gone"),
            other => panic!("unexpected result {:?}", other),
        }
    }
    assert_eq!(harness.loader.missing_cache().len(), 1);
    assert!(harness.store.find("/Game/Orphan.Foo").is_none());
}

#[test]
fn test_missing_package_request() {
    let harness = Harness::new(false);
    let log = CompletionLog::new();
    harness.loader.enqueue(
        "/Game/Nowhere",
        None,
        None,
        0,
        LoadFlags::NO_MISSING_CACHE,
        Some(log.callback()),
    );
    harness.loader.flush(None).unwrap();
    assert!(matches!(log.result_of("/Game/Nowhere"), LoadResult::Failed(_)));
    assert!(harness.loader.missing_cache().is_empty());
}

#[test]
fn test_cycle_is_diagnosed() {
    let harness = Harness::new(false);
    for (name, other) in [("/Game/Ping", "/Game/Pong"), ("/Game/Pong", "/Game/Ping")] {
        let mut builder = PackageBuilder::new(name);
        let import = builder.import_object(other, SCRIPT, WIDGET, "Ball");
        let widget = builder.import_class(SCRIPT, WIDGET);
        let ball = builder.add_export("Ball", widget, PackageIndex::NULL, widget_payload(0, import));
        builder.add_dependency(ball, DependencyKind::SerializeBeforeCreate, import);
        harness.install(&builder, Layout::Combined);
    }

    let log = CompletionLog::new();
    harness.request("/Game/Ping", &log);
    let result = harness.loader.flush(None);
    assert!(matches!(result, Err(PakError::Load(LoadError::GraphCycle(_)))));

    for name in ["/Game/Ping", "/Game/Pong"] {
        assert!(harness.store.find(&format!("{}.Ball", name)).is_none());
    }
    assert!(matches!(
        log.result_of("/Game/Ping"),
        LoadResult::Failed(error) if matches!(*error, PakError::Load(LoadError::GraphCycle(_)))
    ));
    assert_eq!(harness.loader.stats().stalls, 1);
    assert!(!harness.loader.is_loading());
}

#[test]
fn test_guid_mismatch_fails() {
    let harness = Harness::new(false);
    let builder = blob_package("/Game/Guarded", &[vec![1]]).with_guid(PackageGuid([1; 16]));
    harness.install(&builder, Layout::Combined);

    let log = CompletionLog::new();
    harness.loader.enqueue(
        "/Game/Guarded",
        None,
        Some(PackageGuid([2; 16])),
        0,
        LoadFlags::empty(),
        Some(log.callback()),
    );
    harness.loader.flush(None).unwrap();
    assert!(matches!(
        log.result_of("/Game/Guarded").error(),
        Some(PakError::Load(LoadError::GuidMismatch { .. }))
    ));

    harness.loader.enqueue(
        "/Game/Guarded",
        None,
        Some(PackageGuid([1; 16])),
        0,
        LoadFlags::empty(),
        Some(log.callback()),
    );
    harness.loader.flush(None).unwrap();
    assert_eq!(log.entries().iter().filter(|c| c.result.is_success()).count(), 1);
}

#[test]
fn test_size_mismatch_is_fatal_unless_deprecated() {
    let harness = Harness::new(false);
    for (name, class) in [("/Game/Drift", SHORT), ("/Game/Legacy", OLD_SHORT)] {
        let mut builder = PackageBuilder::new(name);
        let class = builder.import_class(SCRIPT, class);
        builder.add_export("Thing", class, PackageIndex::NULL, vec![0; 4]);
        builder.add_export("Fine", class, PackageIndex::NULL, vec![0; 1]);
        harness.install(&builder, Layout::Combined);
    }

    let log = CompletionLog::new();
    harness.request("/Game/Drift", &log);
    harness.request("/Game/Legacy", &log);
    harness.loader.flush(None).unwrap();

    assert!(matches!(
        log.result_of("/Game/Drift").error(),
        Some(PakError::Load(LoadError::SizeMismatch { expected: 4, consumed: 1, .. }))
    ));
    assert!(log.result_of("/Game/Legacy").is_success());
    assert!(harness.store.find("/Game/Legacy.Thing").is_some());
    assert!(harness.store.find("/Game/Drift.Thing").is_none());
}

#[test]
fn test_redirect_reads_other_file() {
    let harness = Harness::new(false);
    harness.install(&blob_package("/Game/Real", &[vec![5; 3]]), Layout::Combined);

    let log = CompletionLog::new();
    harness.loader.enqueue(
        "/Game/Alias",
        Some("/Game/Real"),
        None,
        0,
        LoadFlags::empty(),
        Some(log.callback()),
    );
    harness.loader.flush(None).unwrap();

    assert!(log.result_of("/Game/Alias").is_success());
    let object = harness.store.find("/Game/Alias.Obj0").unwrap();
    assert_eq!(object.data_as::<RawData>().unwrap().bytes, vec![5; 3]);
    assert!(harness.store.find("/Game/Real.Obj0").is_none());
}

#[test]
fn test_cancel_fires_every_callback_once() {
    for multithreaded in [false, true] {
        let harness = Harness::new(multithreaded);
        let log = CompletionLog::new();
        for i in 0..20 {
            let name = format!("/Game/Bulk{}", i);
            harness.install(&chain_package(&name, 10, 3), Layout::Split);
            harness.request(&name, &log);
        }
        harness.request("/Game/NotThere", &log);
        if !multithreaded {
            harness.loader.tick(Duration::from_millis(2));
        }
        harness.loader.cancel();

        let entries = log.entries();
        assert_eq!(entries.len(), 21);
        let mut ids: Vec<_> = entries.iter().map(|c| c.request).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 21);
        assert!(entries
            .iter()
            .all(|c| matches!(c.result, LoadResult::Canceled)));
        assert_eq!(harness.loader.in_flight_package_count(), 0);
        assert!(!harness.loader.is_loading());
        assert!(harness.store.find("/Game/Bulk0.Obj1").is_none());
    }
}

#[test]
fn test_loader_usable_after_cancel() {
    let harness = Harness::new(true);
    harness.install(&blob_package("/Game/Later", &[vec![2; 2]]), Layout::Combined);
    let log = CompletionLog::new();
    harness.request("/Game/Later", &log);
    harness.loader.cancel();
    harness.request("/Game/Later", &log);
    harness.loader.flush(None).unwrap();

    let entries = log.entries();
    assert_eq!(entries.len(), 2);
    assert!(matches!(entries[0].result, LoadResult::Canceled));
    assert!(entries[1].result.is_success());
}

#[test]
fn test_clusters_follow_flags() {
    let harness = Harness::new(false);
    harness.install(&blob_package("/Game/Clustered", &[vec![1], vec![2]]), Layout::Combined);
    harness.install(&blob_package("/Game/Loose", &[vec![1]]), Layout::Combined);

    let log = CompletionLog::new();
    harness.request("/Game/Clustered", &log);
    harness.loader.enqueue(
        "/Game/Loose",
        None,
        None,
        0,
        LoadFlags::NO_CLUSTERS,
        Some(log.callback()),
    );
    harness.loader.flush(None).unwrap();

    assert_eq!(harness.store.cluster_count(), 1);
    let clustered = harness.store.find("/Game/Clustered.Obj1").unwrap();
    assert!(clustered.has_flags(ObjectFlags::IN_CLUSTER));
    let cluster = harness.store.cluster(clustered.cluster().unwrap()).unwrap();
    assert_eq!(cluster.members.len(), 2);
    let loose = harness.store.find("/Game/Loose.Obj0").unwrap();
    assert!(!loose.has_flags(ObjectFlags::IN_CLUSTER));
}

#[test]
fn test_small_memory_budget_still_completes() {
    let harness = Harness::with_config(false, |config| {
        config.precache.memory_budget_bytes = 64;
        config.precache.max_merged_bytes = 32;
    });
    let payloads: Vec<Vec<u8>> = (0..12).map(|i| vec![i as u8; 30]).collect();
    harness.install(&blob_package("/Game/Big", &payloads), Layout::Split);

    let log = CompletionLog::new();
    harness.request("/Game/Big", &log);
    harness.loader.flush(None).unwrap();

    assert!(log.result_of("/Game/Big").is_success());
    assert!(harness.loader.stats().reads_issued >= 6);
    for i in 0..12 {
        let object = harness.store.find(&format!("/Game/Big.Obj{}", i)).unwrap();
        assert_eq!(object.data_as::<RawData>().unwrap().bytes, vec![i as u8; 30]);
    }
}
