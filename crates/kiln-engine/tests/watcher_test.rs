// Integration tests for development-mode stylesheet watchers.

mod support;

use kiln_engine::{RenderRequest, WatcherRegistry, WatcherStatus};
use kiln_metrics::MetricsRegistry;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use support::{eventually, FakeStyleCompiler, Project};

fn registry(project: &Project, styles: &Arc<FakeStyleCompiler>) -> Arc<WatcherRegistry> {
    Arc::new(WatcherRegistry::new(
        styles.clone(),
        project.watch_config(),
        Arc::new(MetricsRegistry::new()),
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_first_requests_start_one_watcher() {
    let project = Project::new();
    let styles = Arc::new(FakeStyleCompiler::new("body{margin:0}"));
    let watchers = registry(&project, &styles);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let watchers = Arc::clone(&watchers);
        let component = project.component.clone();
        let stylesheet = project.stylesheet.clone();
        tasks.push(tokio::spawn(async move {
            watchers
                .stylesheet(&component, &stylesheet, SystemTime::now())
                .await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), "body{margin:0}");
    }

    assert_eq!(styles.launches(), 1);
    assert_eq!(watchers.len(), 1);
    assert_eq!(watchers.status(&project.stylesheet), WatcherStatus::Ready);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exited_watcher_is_removed_and_restarted() {
    let project = Project::new();
    let styles = Arc::new(FakeStyleCompiler::new("body{}"));
    let watchers = registry(&project, &styles);

    watchers
        .stylesheet(&project.component, &project.stylesheet, SystemTime::now())
        .await
        .unwrap();
    assert_eq!(watchers.status(&project.stylesheet), WatcherStatus::Ready);

    styles.exit_all();
    assert!(
        eventually(Duration::from_secs(2), || {
            watchers.status(&project.stylesheet) == WatcherStatus::Absent
        })
        .await
    );

    watchers
        .stylesheet(&project.component, &project.stylesheet, SystemTime::now())
        .await
        .unwrap();
    assert_eq!(styles.launches(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_watcher_fails_and_is_killed() {
    let project = Project::new();
    let styles = Arc::new(FakeStyleCompiler::new("body{}"));
    styles.silent_watch(true);
    let watchers = registry(&project, &styles);

    let err = watchers
        .stylesheet(&project.component, &project.stylesheet, SystemTime::now())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no output"), "got {}", err);
    assert_eq!(watchers.status(&project.stylesheet), WatcherStatus::Absent);
    assert!(eventually(Duration::from_secs(2), || styles.kills() == 1).await);

    // the next caller starts over
    styles.silent_watch(false);
    watchers
        .stylesheet(&project.component, &project.stylesheet, SystemTime::now())
        .await
        .unwrap();
    assert_eq!(styles.launches(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_stops_watchers() {
    let project = Project::new();
    let styles = Arc::new(FakeStyleCompiler::new("body{}"));
    let watchers = registry(&project, &styles);

    watchers
        .ensure_watcher(&project.component, &project.stylesheet)
        .await
        .unwrap();
    watchers.shutdown();

    assert!(watchers.is_empty());
    assert!(eventually(Duration::from_secs(2), || styles.kills() == 1).await);
    assert!(watchers
        .ensure_watcher(&project.component, &project.stylesheet)
        .await
        .is_err());
}

// ============================================================================
// Through the engine
// ============================================================================

fn watching_engine(project: &Project) -> (kiln_engine::Engine, support::Doubles) {
    let config = project.config().with_styles(project.watch_config());
    support::engine(project, config)
}

fn home(project: &Project) -> RenderRequest {
    RenderRequest::new(&project.component).with_props(json!({ "title": "Fixture" }))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_render_uses_watch_output() {
    let project = Project::new();
    let (engine, doubles) = watching_engine(&project);

    let output = engine.render(home(&project)).await.unwrap();
    assert_eq!(&*output.stylesheet, "body{color:red}");
    assert_eq!(doubles.styles.launches(), 1);
    assert_eq!(doubles.styles.compiles(), 0);
    assert_eq!(engine.metrics().watchers.launches, 1);

    engine.shutdown();
    assert!(engine.watchers().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_watcher_failure_falls_back_to_one_shot_compile() {
    let project = Project::new();
    let (engine, doubles) = watching_engine(&project);
    doubles.styles.fail_watch(true);

    let output = engine.render(home(&project)).await.unwrap();
    assert_eq!(&*output.stylesheet, "body{color:red}");
    assert_eq!(doubles.styles.launches(), 1);
    assert_eq!(doubles.styles.compiles(), 1);
    assert_eq!(
        engine.watchers().unwrap().status(&project.stylesheet),
        WatcherStatus::Absent
    );
    assert_eq!(engine.metrics().watchers.failures, 1);
}
