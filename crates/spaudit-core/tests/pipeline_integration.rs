//! End-to-end audit runs over fixture tenants.
//!
//! Covers the two-site scenario, resume after an interruption at every stage boundary,
//! resume after a global timeout mid-crawl, branch isolation, bounded concurrency and the
//! circuit breaker boundary.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{pipeline, rows, scenario_tenant, snapshot, test_config, NESTED_USER, OUTER_GROUP};
use spaudit_core::model::{Row, RunStatus, Table};
use spaudit_core::remote::SiteListing;
use spaudit_core::store::{query_all, RowFilter};
use spaudit_core::{
    ApiGateway, CheckpointStore, FixtureApi, FixtureTenant, InventoryStore, MemoryStore,
    PipelineError, RemoteError,
};

fn memory_store() -> Arc<dyn InventoryStore> {
    Arc::new(MemoryStore::new())
}

#[tokio::test]
async fn test_two_site_scenario() {
    let api = Arc::new(FixtureApi::new(scenario_tenant()));
    let store = memory_store();
    let summary = pipeline("run-scenario", api, store.clone(), &test_config(), None)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.record.status, RunStatus::Completed);
    assert_eq!(summary.record.sites, 2);
    assert_eq!(summary.record.libraries, 2);
    assert_eq!(summary.record.folders, 2);
    assert_eq!(summary.record.files, 4);

    let permissions: Vec<_> = rows(store.as_ref(), Table::Permissions)
        .await
        .into_iter()
        .filter_map(|row| match row {
            Row::Permission(p) => Some(p),
            _ => None,
        })
        .collect();
    // Per site: group + nested user on site, library, folder and the shared file; one
    // external grant on the private file.
    assert_eq!(permissions.len(), 18);
    assert_eq!(summary.record.permissions, 18);

    for site in ["site-alpha", "site-beta"] {
        let private: Vec<_> = permissions
            .iter()
            .filter(|p| p.object_id == format!("{}-private", site))
            .collect();
        assert_eq!(private.len(), 1);
        assert!(private[0].entry.is_external);
        assert!(!private[0].entry.is_inherited);
        assert_eq!(private[0].entry.permission_level, "Read");

        let shared_user = permissions
            .iter()
            .find(|p| {
                p.object_id == format!("{}-shared", site) && p.entry.principal_id == NESTED_USER
            })
            .expect("nested user reaches the shared file");
        assert!(shared_user.entry.is_inherited);
        assert_eq!(shared_user.entry.permission_level, "Edit");
        assert_eq!(shared_user.entry.granted_by.as_deref(), Some(OUTER_GROUP));
        assert_eq!(shared_user.entry.inheritance_source.as_deref(), Some(site));
    }
    assert_eq!(permissions.iter().filter(|p| p.entry.is_external).count(), 2);

    for row in rows(store.as_ref(), Table::Files).await {
        let Row::File(file) = row else { continue };
        if file.file_id.ends_with("-shared") {
            assert_eq!(file.extension.as_deref(), Some("docx"));
            assert_eq!(file.size_category.as_deref(), Some("Small"));
            assert_eq!(file.path_depth, Some(3));
        } else {
            assert_eq!(file.extension.as_deref(), Some("xlsx"));
            assert_eq!(file.size_category.as_deref(), Some("Tiny"));
        }
    }
    assert_eq!(summary.metrics.custom("external_users"), Some(2.0));
    assert_eq!(summary.metrics.custom("anonymous_links"), Some(0.0));
}

#[tokio::test]
async fn test_resume_after_interruption_matches_uninterrupted_run() {
    let config = test_config();
    let reference = memory_store();
    pipeline(
        "run-ref",
        Arc::new(FixtureApi::new(scenario_tenant())),
        reference.clone(),
        &config,
        None,
    )
    .run()
    .await
    .unwrap();
    let expected = snapshot(reference.as_ref()).await;

    for interrupt_at in 0..6 {
        let store = memory_store();
        let run_id = format!("run-resume-{}", interrupt_at);

        let first = pipeline(
            &run_id,
            Arc::new(FixtureApi::new(scenario_tenant())),
            store.clone(),
            &config,
            Some(interrupt_at),
        )
        .run()
        .await;
        assert!(
            matches!(first, Err(PipelineError::StageFailed { .. })),
            "interrupt at {} did not fail the run",
            interrupt_at
        );

        // A fresh pipeline, as a new invocation would build it.
        let second = pipeline(
            &run_id,
            Arc::new(FixtureApi::new(scenario_tenant())),
            store.clone(),
            &config,
            None,
        )
        .run()
        .await
        .unwrap();
        assert_eq!(second.skipped_stages.len(), interrupt_at);
        assert_eq!(second.record.files, 4, "interrupt at {}", interrupt_at);
        assert_eq!(second.record.permissions, 18, "interrupt at {}", interrupt_at);
        assert_eq!(snapshot(store.as_ref()).await, expected, "interrupt at {}", interrupt_at);
    }
}

#[tokio::test]
async fn test_resume_from_journal_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let config = test_config();

    {
        let store: Arc<dyn InventoryStore> =
            Arc::new(spaudit_core::JournalStore::open(&path, false).await.unwrap());
        let first = pipeline(
            "run-journal",
            Arc::new(FixtureApi::new(scenario_tenant())),
            store,
            &config,
            Some(4),
        )
        .run()
        .await;
        assert!(first.is_err());
    }

    let store: Arc<dyn InventoryStore> =
        Arc::new(spaudit_core::JournalStore::open(&path, false).await.unwrap());
    let api = Arc::new(FixtureApi::new(scenario_tenant()));
    let summary = pipeline("run-journal", api.clone(), store, &config, None)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.skipped_stages.len(), 4);
    assert_eq!(summary.record.permissions, 18);
    assert_eq!(api.calls("list_sites"), 0);
}

#[tokio::test]
async fn test_completed_run_refuses_second_invocation() {
    let store = memory_store();
    let config = test_config();
    pipeline("run-once", Arc::new(FixtureApi::new(scenario_tenant())), store.clone(), &config, None)
        .run()
        .await
        .unwrap();
    let again = pipeline("run-once", Arc::new(FixtureApi::new(scenario_tenant())), store, &config, None)
        .run()
        .await;
    assert!(matches!(again, Err(PipelineError::AlreadyFinished { .. })));
}

#[tokio::test]
async fn test_poisoned_branch_is_isolated() {
    let api = Arc::new(FixtureApi::new(scenario_tenant()));
    api.poison_folder(
        "site-alpha-general",
        RemoteError::Status {
            status: 403,
            message: "access denied".into(),
        },
    );
    let store = memory_store();
    let summary = pipeline("run-poison", api, store.clone(), &test_config(), None)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.record.status, RunStatus::CompletedWithErrors);
    assert_eq!(summary.record.sites, 2);
    assert_eq!(summary.record.folders, 2);
    // Only beta's two files were reachable.
    assert_eq!(summary.record.files, 2);
    assert!(summary
        .record
        .errors
        .iter()
        .any(|e| e.stage == "discovery" && e.message.contains("403")));
}

fn poisoned_api() -> Arc<FixtureApi> {
    let api = Arc::new(FixtureApi::new(scenario_tenant()));
    api.poison_folder(
        "site-alpha-general",
        RemoteError::Status {
            status: 403,
            message: "access denied".into(),
        },
    );
    api
}

fn error_keys(record: &spaudit_core::model::RunRecord) -> Vec<(String, String, String)> {
    let mut keys: Vec<_> = record
        .errors
        .iter()
        .map(|e| (e.stage.clone(), e.scope.clone(), e.message.clone()))
        .collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn test_resume_keeps_branch_errors_of_completed_stages() {
    let config = test_config();
    let reference = pipeline("run-errors-ref", poisoned_api(), memory_store(), &config, None)
        .run()
        .await
        .unwrap();
    assert_eq!(reference.record.status, RunStatus::CompletedWithErrors);

    for interrupt_at in 0..6 {
        let store = memory_store();
        let run_id = format!("run-errors-{}", interrupt_at);
        let first = pipeline(&run_id, poisoned_api(), store.clone(), &config, Some(interrupt_at))
            .run()
            .await;
        assert!(first.is_err());

        let resumed = pipeline(&run_id, poisoned_api(), store, &config, None)
            .run()
            .await
            .unwrap();
        assert_eq!(
            resumed.record.status,
            RunStatus::CompletedWithErrors,
            "interrupt at {}",
            interrupt_at
        );
        assert_eq!(
            resumed.record.error_count, reference.record.error_count,
            "interrupt at {}",
            interrupt_at
        );
        assert_eq!(error_keys(&resumed.record), error_keys(&reference.record));
    }
}

#[tokio::test]
async fn test_failed_permission_fetches_become_run_errors() {
    let api = Arc::new(FixtureApi::new(scenario_tenant()));
    api.fail_operation(
        "role_assignments",
        1_000,
        RemoteError::Status {
            status: 403,
            message: "forbidden".into(),
        },
    );
    let summary = pipeline("run-denied", api, memory_store(), &test_config(), None)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.record.status, RunStatus::CompletedWithErrors);
    let mut scopes: Vec<&str> = summary
        .record
        .errors
        .iter()
        .filter(|e| e.stage == "permissions")
        .map(|e| e.scope.as_str())
        .collect();
    scopes.sort();
    assert_eq!(
        scopes,
        vec![
            "file:site-alpha-private",
            "file:site-beta-private",
            "site:site-alpha",
            "site:site-beta",
        ]
    );
    assert_eq!(summary.metrics.custom("unknown_permission_entries"), Some(4.0));
}

#[tokio::test]
async fn test_remote_calls_stay_bounded() {
    let api = Arc::new(
        FixtureApi::new(FixtureTenant::synthetic(12, 3)).with_latency(Duration::from_millis(5)),
    );
    let mut config = test_config();
    config.crawl.max_concurrent_sites = 4;
    config.crawl.max_concurrent_calls = 3;
    config.permissions.batch_concurrency = 2;

    let store = memory_store();
    let summary = pipeline("run-bounded", api.clone(), store, &config, None)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.record.sites, 12);

    // Discovery holds at most three calls; resolution runs two objects at a time, each
    // issuing its calls sequentially.
    assert!(api.peak_in_flight() <= 3, "peak {}", api.peak_in_flight());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_threshold_and_recovers() {
    let api = Arc::new(FixtureApi::new(scenario_tenant()));
    api.fail_operation("list_libraries", 5, RemoteError::unavailable("throttled backend"));
    let mut retry = test_config().retry;
    retry.max_attempts = 1;
    let gateway = ApiGateway::from_config(api.clone(), Default::default(), retry);

    for _ in 0..5 {
        let err = gateway.list_libraries("site-alpha").await.unwrap_err();
        assert!(!err.is_circuit_open());
    }
    let refused = gateway.list_libraries("site-alpha").await.unwrap_err();
    assert!(refused.is_circuit_open());
    assert_eq!(api.calls("list_libraries"), 5);

    // Other operations keep their own breaker.
    assert!(gateway.list_sites(&SiteListing::default()).await.is_ok());

    tokio::time::advance(Duration::from_secs(61)).await;
    let libraries = gateway.list_libraries("site-alpha").await.unwrap();
    assert_eq!(libraries.len(), 1);
    assert_eq!(api.calls("list_libraries"), 6);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_during_discovery_keeps_crawled_sites_for_resume() {
    let tenant = FixtureTenant::synthetic(6, 17);
    let reference_store = memory_store();
    let reference = pipeline(
        "run-reference",
        Arc::new(FixtureApi::new(tenant.clone())),
        reference_store.clone(),
        &test_config(),
        None,
    )
    .run()
    .await
    .unwrap();

    // Each call takes 400 ms and sites are crawled one at a time, so the 3 s limit lands
    // part-way through the site crawl.
    let api = Arc::new(FixtureApi::new(tenant).with_latency(Duration::from_millis(400)));
    let store = memory_store();
    let mut config = test_config();
    config.crawl.max_concurrent_sites = 1;
    config.run.global_timeout_secs = 3;
    let result = pipeline("run-slow", api.clone(), store.clone(), &config, None)
        .run()
        .await;
    assert!(matches!(result, Err(PipelineError::TimedOut(d)) if d == Duration::from_secs(3)));

    let checkpoints = CheckpointStore::new("run-slow", store.clone());
    assert!(!checkpoints.is_stage_completed("discovery").await.unwrap());
    let mut completed = Vec::new();
    for s in 0..6 {
        let site_id = format!("site-{}", s);
        if checkpoints.is_site_completed(&site_id).await.unwrap() {
            completed.push(site_id);
        }
    }
    assert!(
        !completed.is_empty() && completed.len() < 6,
        "completed sites: {:?}",
        completed
    );
    let filter = RowFilter::SiteIds(completed.iter().cloned().collect());
    for table in [Table::Sites, Table::Libraries, Table::Files] {
        let kept = query_all(store.as_ref(), table, filter.clone()).await.unwrap();
        assert!(!kept.is_empty(), "{:?} rows of completed sites", table);
    }

    config.run.global_timeout_secs = 0;
    let libraries_before = api.calls("list_libraries");
    let resumed = pipeline("run-slow", api.clone(), store.clone(), &config, None)
        .run()
        .await
        .unwrap();
    assert_eq!(resumed.record.status, RunStatus::Completed);
    assert!(resumed.skipped_stages.is_empty());
    assert_eq!(
        resumed.metrics.custom("sites_resumed"),
        Some(completed.len() as f64)
    );
    assert_eq!(
        api.calls("list_libraries") - libraries_before,
        (6 - completed.len()) as u64
    );

    assert_eq!(resumed.record.sites, reference.record.sites);
    assert_eq!(resumed.record.libraries, reference.record.libraries);
    assert_eq!(resumed.record.folders, reference.record.folders);
    assert_eq!(resumed.record.files, reference.record.files);
    assert_eq!(resumed.record.permissions, reference.record.permissions);
    assert_eq!(
        snapshot(store.as_ref()).await,
        snapshot(reference_store.as_ref()).await
    );
}
