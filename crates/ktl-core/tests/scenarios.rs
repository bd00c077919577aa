//! End-to-end pipeline scenarios against the in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use ktl_core::apply::{ApplyEngine, ApplyOptions};
use ktl_core::cancel::CancelToken;
use ktl_core::client::KubeClient;
use ktl_core::compare::{compare_gate, compare_plans};
use ktl_core::plan::{PlanEngine, PlanOptions};
use ktl_core::secrets::SecretResolver;
use ktl_core::testutil::{CollectingObserver, FakeInstaller, FakeKube, FakeRenderer};
use ktl_events::{EventBus, PhaseTimer};
use ktl_types::{ChangeKind, EventKind, KtlError, PlanResult, ReleaseStatus, ResourceKey};

const CONFIGMAP: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
  namespace: prod
data:
  k: v
";

const DEPLOYMENT_V2: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: prod
spec:
  replicas: 2
  template:
    spec:
      containers:
        - name: nginx
          image: nginx:2
";

const SERVICE: &str = "\
apiVersion: v1
kind: Service
metadata:
  name: web
  namespace: prod
spec:
  ports:
    - port: 80
";

fn run_plan(
    renderer: &FakeRenderer,
    kube: &FakeKube,
    installer: &FakeInstaller,
    opts: &PlanOptions,
) -> anyhow::Result<PlanResult> {
    let bus = EventBus::new();
    let timer = PhaseTimer::new();
    let secrets = SecretResolver::new();
    let engine = PlanEngine {
        renderer,
        client: kube,
        installer,
        secrets: &secrets,
        bus: &bus,
        timer: &timer,
    };
    engine.execute(opts, &CancelToken::new())
}

fn plan_opts(chart: &str) -> PlanOptions {
    PlanOptions {
        chart: chart.into(),
        release: "web".into(),
        namespace: "prod".into(),
        ..Default::default()
    }
}

// S1: chart renders one ConfigMap; nothing live, nothing previous.
#[test]
fn s1_pure_create() {
    let plan = run_plan(
        &FakeRenderer::with_manifest(CONFIGMAP),
        &FakeKube::new(),
        &FakeInstaller::new(),
        &plan_opts("core"),
    )
    .unwrap();

    assert_eq!(
        (
            plan.summary.creates,
            plan.summary.updates,
            plan.summary.deletes,
            plan.summary.unchanged
        ),
        (1, 0, 0, 0)
    );
    assert_eq!(plan.changes.len(), 1);
    assert_eq!(plan.changes[0].kind, ChangeKind::Create);
    assert!(plan.changes[0].diff.as_ref().unwrap().contains("+kind: ConfigMap"));

    assert_eq!(plan.graph.nodes.len(), 1);
    assert_eq!(plan.graph.nodes[0].id, "prod|configmap|cfg");
    assert!(plan.graph.edges.is_empty());
}

// S2: live Deployment runs nginx:1, chart wants nginx:2.
#[test]
fn s2_update_with_workload_warning() {
    let kube = FakeKube::new();
    kube.put_manifest(&DEPLOYMENT_V2.replace("nginx:2", "nginx:1"));

    let plan = run_plan(
        &FakeRenderer::with_manifest(DEPLOYMENT_V2),
        &kube,
        &FakeInstaller::new(),
        &plan_opts("core"),
    )
    .unwrap();

    assert_eq!(plan.summary.updates, 1);
    assert!(
        plan.warnings
            .iter()
            .any(|w| w == "Updating core/web Deployment (prod) will restart pods"),
        "warnings: {:?}",
        plan.warnings
    );
    let diff = plan.changes[0].diff.as_ref().unwrap();
    assert!(
        diff.lines()
            .any(|l| l.starts_with('-') && l.contains("image: nginx:1"))
    );
    assert!(
        diff.lines()
            .any(|l| l.starts_with('+') && l.contains("image: nginx:2"))
    );
}

// S3: desired set is empty; the previous release applied a Service.
#[test]
fn s3_delete_previous_only() {
    let installer = FakeInstaller::with_release("web", "core", "1.0.0", SERVICE);
    let plan = run_plan(
        &FakeRenderer::with_manifest(""),
        &FakeKube::new(),
        &installer,
        &plan_opts("core"),
    )
    .unwrap();

    assert_eq!(plan.summary.deletes, 1);
    assert_eq!(plan.changes.len(), 1);
    assert_eq!(plan.changes[0].kind, ChangeKind::Delete);
    assert_eq!(plan.changes[0].key.kind, "Service");
}

// S4: every GET fails; the plan still succeeds offline.
#[test]
fn s4_offline_fallback() {
    let kube = FakeKube::new();
    kube.fail_gets("connection refused");
    let installer = FakeInstaller::with_release("web", "core", "1.0.0", CONFIGMAP);

    let plan = run_plan(
        &FakeRenderer::with_manifest(&CONFIGMAP.replace("k: v", "k: v2")),
        &kube,
        &installer,
        &plan_opts("core"),
    )
    .unwrap();

    assert!(plan.offline_fallback);
    assert!(plan.warnings.iter().any(|w| {
        w.contains("Live lookup failed")
            && w.contains("connection refused")
            && w.contains("falling back to previous release manifest")
    }));
    // The diff is computed against the previous release manifest.
    assert_eq!(plan.summary.updates, 1);
    let diff = plan.changes[0].diff.as_ref().unwrap();
    assert!(diff.contains("-  k: v"));
    assert!(diff.contains("+  k: v2"));
}

// Offline fallback never removes changes that online mode would report.
#[test]
fn offline_fallback_is_monotonic_for_creates() {
    let offline_kube = FakeKube::new();
    offline_kube.fail_gets("connection refused");
    let plan = run_plan(
        &FakeRenderer::with_manifest(CONFIGMAP),
        &offline_kube,
        &FakeInstaller::new(),
        &plan_opts("core"),
    )
    .unwrap();
    assert_eq!(plan.summary.creates, 1);
    assert!(plan.offline_fallback);
}

// S5: baseline has one update; current adds a create.
#[test]
fn s5_compare_regression() {
    let installer = FakeInstaller::with_release(
        "web",
        "core",
        "1.0.0",
        &DEPLOYMENT_V2.replace("nginx:2", "nginx:1"),
    );
    let kube = FakeKube::new();
    kube.put_manifest(&DEPLOYMENT_V2.replace("nginx:2", "nginx:1"));

    let baseline = run_plan(
        &FakeRenderer::with_manifest(DEPLOYMENT_V2),
        &kube,
        &installer,
        &plan_opts("core"),
    )
    .unwrap();
    assert_eq!(baseline.summary.updates, 1);

    let current_manifest = format!("{DEPLOYMENT_V2}---\n{CONFIGMAP}");
    let mut current = run_plan(
        &FakeRenderer::with_manifest(&current_manifest),
        &kube,
        &installer,
        &plan_opts("core"),
    )
    .unwrap();

    let compare = compare_plans(&current, &baseline);
    assert_eq!(compare.new.len(), 1);
    assert_eq!(
        compare.new[0].key,
        ResourceKey::new("", "v1", "ConfigMap", "prod", "cfg")
    );
    assert_eq!(compare.new[0].kind, ChangeKind::Create);
    assert!(compare.changed.is_empty());
    assert!(compare.resolved.is_empty());
    assert!(compare.has_regressions());

    current.compare = Some(compare);
    let err = compare_gate(&current, true).unwrap_err();
    assert_eq!(err.exit_code(), 2);
}

// S6: verify report attests a digest the rendered manifest does not match.
#[test]
fn s6_verify_digest_mismatch_blocks_apply() {
    let kube = FakeKube::new();
    kube.add_namespace("prod");
    let kube = Arc::new(kube);
    let renderer = FakeRenderer::with_manifest(CONFIGMAP);
    let installer = FakeInstaller::new();
    let secrets = SecretResolver::new();
    let bus = EventBus::new();
    let timer = PhaseTimer::new();

    let observer = CollectingObserver::new("capture");
    let seen = observer.events();
    bus.attach(Box::new(observer));

    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("verify.json");
    std::fs::write(
        &report,
        format!(
            r#"{{"inputs":[{{"kind":"chart","renderedSha256":"{}"}}]}}"#,
            "a".repeat(64)
        ),
    )
    .unwrap();

    let engine = ApplyEngine {
        renderer: &renderer,
        client: Arc::clone(&kube) as Arc<dyn KubeClient>,
        installer: &installer,
        secrets: &secrets,
        confirmer: None,
        bus: &bus,
        timer: &timer,
    };
    let err = engine
        .execute(
            &ApplyOptions {
                chart: "core".into(),
                release: "web".into(),
                namespace: "prod".into(),
                auto_approve: true,
                verify_report: Some(report),
                timeout: Duration::from_secs(60),
                ..Default::default()
            },
            &CancelToken::new(),
        )
        .unwrap_err();

    assert_eq!(err.downcast_ref::<KtlError>().unwrap().exit_code(), 2);
    assert!(installer.install_requests().is_empty(), "no mutation happened");

    bus.close_all(Duration::from_secs(5));
    let events = seen.lock().unwrap();
    let summary = events
        .iter()
        .rev()
        .find_map(|e| match &e.event {
            EventKind::Summary(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(summary.status, ReleaseStatus::Failed);
    let error = summary.error.unwrap();
    assert!(error.contains(&"a".repeat(64)));
    assert!(error.contains("verify-digest-mismatch"));
}

// Change classification completeness: one change per key in
// desired ∪ previous, and the summary adds up.
#[test]
fn classification_is_complete_and_summary_adds_up() {
    let kube = FakeKube::new();
    kube.put_manifest(CONFIGMAP); // unchanged live object
    let installer = FakeInstaller::with_release(
        "web",
        "core",
        "1.0.0",
        &format!("{CONFIGMAP}---\n{SERVICE}"),
    );

    // Desired: unchanged ConfigMap + new Deployment. Previous-only Service.
    let desired = format!("{CONFIGMAP}---\n{DEPLOYMENT_V2}");
    let plan = run_plan(
        &FakeRenderer::with_manifest(&desired),
        &kube,
        &installer,
        &plan_opts("core"),
    )
    .unwrap();

    assert_eq!(plan.summary.creates, 1); // deployment
    assert_eq!(plan.summary.deletes, 1); // service
    assert_eq!(plan.summary.unchanged, 1); // configmap
    assert_eq!(
        plan.changes.len() as u32,
        plan.summary.creates + plan.summary.updates + plan.summary.deletes
    );
    // |changes| + unchanged == |desired| + |previous-only|
    assert_eq!(
        plan.changes.len() as u32 + plan.summary.unchanged,
        2 + 1
    );
    // Exactly one change per key.
    let mut keys: Vec<String> = plan.changes.iter().map(|c| c.key.to_string()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), plan.changes.len());
}

// Plan determinism across runs (generatedAt aside).
#[test]
fn plan_runs_are_deterministic() {
    let kube = FakeKube::new();
    kube.put_manifest(CONFIGMAP);
    let installer = FakeInstaller::with_release("web", "core", "1.0.0", CONFIGMAP);
    let renderer = FakeRenderer::with_manifest(&format!("{CONFIGMAP}---\n{DEPLOYMENT_V2}"));

    let mut a = run_plan(&renderer, &kube, &installer, &plan_opts("core")).unwrap();
    let mut b = run_plan(&renderer, &kube, &installer, &plan_opts("core")).unwrap();
    a.generated_at = b.generated_at;
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}

// A full apply emits phases, resource snapshots, and a deployed summary
// to an attached observer, in a single total order.
#[test]
fn apply_streams_a_complete_event_narrative() {
    let kube = FakeKube::new();
    kube.add_namespace("prod");
    kube.put_manifest(CONFIGMAP);
    let kube = Arc::new(kube);
    let renderer = FakeRenderer::with_manifest(CONFIGMAP);
    let installer = FakeInstaller::new();
    let secrets = SecretResolver::new();
    let bus = EventBus::new();
    let timer = PhaseTimer::new();

    let observer = CollectingObserver::new("console");
    let seen = observer.events();
    bus.attach(Box::new(observer));

    let engine = ApplyEngine {
        renderer: &renderer,
        client: Arc::clone(&kube) as Arc<dyn KubeClient>,
        installer: &installer,
        secrets: &secrets,
        confirmer: None,
        bus: &bus,
        timer: &timer,
    };
    let summary = engine
        .execute(
            &ApplyOptions {
                chart: "core".into(),
                release: "web".into(),
                namespace: "prod".into(),
                auto_approve: true,
                wait: true,
                timeout: Duration::from_secs(60),
                ..Default::default()
            },
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(summary.status, ReleaseStatus::Deployed);

    bus.close_all(Duration::from_secs(5));
    let events = seen.lock().unwrap();
    let phases: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.event {
            EventKind::Phase(p) => Some(p.phase.clone()),
            _ => None,
        })
        .collect();
    for expected in ["render", "release", "live", "diff", "quota", "preview", "install"] {
        assert!(phases.contains(&expected.to_string()), "missing phase {expected}");
    }
    assert!(events.iter().any(|e| matches!(e.event, EventKind::Diff(_))));
    assert!(
        events
            .iter()
            .any(|e| matches!(e.event, EventKind::Summary(_)))
    );
}
