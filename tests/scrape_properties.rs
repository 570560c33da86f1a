use promcheck::config::{configure, CheckDefaults, CheckFile, InstanceConfig};
use promcheck::join::JoinState;
use promcheck::model::{Submission, SubmissionKind};
use promcheck::{ConfigError, OpenMetricsScraper};

fn instance(extra: &str) -> InstanceConfig {
    let yaml = format!("endpoint_url: http://localhost:8080/metrics\nnamespace: app\n{}", extra);
    serde_yaml::from_str(&yaml).unwrap()
}

fn scraper(extra: &str) -> OpenMetricsScraper {
    OpenMetricsScraper::new(configure(&instance(extra), &CheckDefaults::default()).unwrap()).unwrap()
}

fn scrape(scraper: &mut OpenMetricsScraper, payload: &str) -> Vec<String> {
    let mut sink: Vec<Submission> = Vec::new();
    scraper.process_lines(payload.lines(), &mut sink);
    sink.iter().map(|s| s.to_string()).collect()
}

const KSM_PAYLOAD: &str = r#"# HELP kube_pod_container_status_restarts_total Restarts.
# TYPE kube_pod_container_status_restarts_total counter
kube_pod_container_status_restarts_total{namespace="default",pod="web-1"} 3
kube_pod_container_status_restarts_total{namespace="default",pod="web-2"} 0
# HELP kube_pod_info Information about pod.
# TYPE kube_pod_info gauge
kube_pod_info{namespace="default",pod="web-1",node="node-a",pod_ip="10.0.0.1"} 1
kube_pod_info{namespace="default",pod="web-2",node="node-b",pod_ip="10.0.0.2"} 1
"#;

const JOIN_CONFIG: &str = r#"metrics:
  - kube_pod_container_status_restarts_total: container.restarts
label_joins:
  kube_pod_info:
    labels_to_match: [pod]
    labels_to_get: [node]
"#;

#[test]
fn missing_endpoint_fails_at_configure_time() {
    let inst: InstanceConfig = serde_yaml::from_str("namespace: app").unwrap();
    assert!(matches!(
        configure(&inst, &CheckDefaults::default()),
        Err(ConfigError::MissingEndpoint)
    ));
}

#[test]
fn check_file_instances_resolve_with_init_defaults() {
    let check = CheckFile::load_from_str(
        r#"
init_config:
  default_namespace: kubernetes_state
  default_instances:
    kubernetes_state:
      metrics: [kube_pod_info]
      send_monotonic_counter: false
instances:
  - prometheus_url: http://ksm:8080/metrics
    tags: ["cluster:prod"]
"#,
    )
    .unwrap();
    let defaults = CheckDefaults::from(check.init_config);
    let config = configure(&check.instances[0], &defaults).unwrap();
    assert_eq!(config.namespace, "kubernetes_state");
    assert_eq!(config.endpoint, "http://ksm:8080/metrics");
    assert!(config.metrics_mapper.contains_key("kube_pod_info"));
    assert!(!config.send_monotonic_counter);
    assert_eq!(config.custom_tags, vec!["cluster:prod".to_string()]);
}

#[test]
fn non_finite_values_are_never_submitted() {
    let mut scraper = scraper("metrics: [\"*\"]\n");
    let payload = "# TYPE temperature gauge\n\
temperature{room=\"a\"} NaN\n\
temperature{room=\"b\"} +Inf\n\
temperature{room=\"c\"} -Inf\n\
temperature{room=\"d\"} 21.5\n\
# TYPE latency summary\n\
latency{quantile=\"0.5\"} NaN\n\
latency_sum 3\n\
latency_count 2\n";
    let mut sink: Vec<Submission> = Vec::new();
    scraper.process_lines(payload.lines(), &mut sink);
    for submission in &sink {
        if let Submission::Metric { value, .. } = submission {
            assert!(value.is_finite(), "{} submitted", submission);
        }
    }
    assert_eq!(
        sink.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        vec![
            "app.temperature:21.5|g|#room:d",
            "app.latency.sum:3|g",
            "app.latency.count:2|g",
        ]
    );
}

#[test]
fn explicit_mapping_wins_over_wildcard() {
    let mut scraper = scraper("metrics:\n  - \"go_*\"\n  - go_goroutines: goroutines\n");
    let out = scrape(
        &mut scraper,
        "# TYPE go_goroutines gauge\ngo_goroutines 7\n# TYPE go_threads gauge\ngo_threads 9\n",
    );
    assert_eq!(out, vec!["app.goroutines:7|g", "app.go_threads:9|g"]);
}

#[test]
fn output_is_idempotent_without_label_joins() {
    let mut scraper = scraper("metrics: [\"*\"]\n");
    let first = scrape(&mut scraper, KSM_PAYLOAD);
    assert_eq!(scraper.join_cache().state(), JoinState::Active);
    let second = scrape(&mut scraper, KSM_PAYLOAD);
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn label_join_converges_after_dry_run() {
    let mut scraper = scraper(JOIN_CONFIG);
    assert!(scrape(&mut scraper, KSM_PAYLOAD).is_empty());

    let second = scrape(&mut scraper, KSM_PAYLOAD);
    assert_eq!(
        second,
        vec![
            "app.container.restarts:3|mc|#namespace:default,node:node-a,pod:web-1",
            "app.container.restarts:0|mc|#namespace:default,node:node-b,pod:web-2",
        ]
    );
    assert_eq!(second, scrape(&mut scraper, KSM_PAYLOAD));
}

#[test]
fn label_join_evicts_vanished_donors() {
    let mut scraper = scraper(JOIN_CONFIG);
    scrape(&mut scraper, KSM_PAYLOAD);
    assert_eq!(scraper.join_cache().cached_len("pod"), 2);

    // web-2 is gone entirely, donor and dependent
    let without_web2: String = KSM_PAYLOAD
        .lines()
        .filter(|l| !l.contains("web-2"))
        .map(|l| format!("{}\n", l))
        .collect();
    scrape(&mut scraper, &without_web2);
    assert_eq!(scraper.join_cache().cached_len("pod"), 1);
    assert!(scraper.join_cache().lookup("pod", "web-2").is_none());

    // it comes back without its info row: no stale node label
    let restarts_only: String = KSM_PAYLOAD
        .lines()
        .filter(|l| !l.contains("kube_pod_info"))
        .map(|l| format!("{}\n", l))
        .collect();
    let out = scrape(&mut scraper, &restarts_only);
    assert_eq!(
        out,
        vec![
            "app.container.restarts:3|mc|#namespace:default,node:node-a,pod:web-1",
            "app.container.restarts:0|mc|#namespace:default,pod:web-2",
        ]
    );
}

#[test]
fn bucket_example_submits_only_finite_bound() {
    let mut scraper = scraper("metrics: [request_latency]\nsend_distribution_counts_as_monotonic: true\n");
    let mut sink: Vec<Submission> = Vec::new();
    scraper.process_lines(
        [
            "# TYPE request_latency histogram",
            "request_latency_bucket{le=\"0.5\"} 3",
            "request_latency_bucket{le=\"+Inf\"} 5",
            "request_latency_sum 1.2",
            "request_latency_count 5",
        ],
        &mut sink,
    );
    let buckets: Vec<_> = sink
        .iter()
        .filter_map(|s| match s {
            Submission::Metric {
                kind, value, tags, ..
            } if tags.iter().any(|t| t.starts_with("upper_bound:") && t != "upper_bound:none") => {
                Some((*kind, *value, tags.clone()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        buckets,
        vec![(
            SubmissionKind::MonotonicCount,
            3.0,
            vec!["upper_bound:0.5".to_string()]
        )]
    );
}

#[test]
fn non_cumulative_buckets_end_to_end() {
    let mut scraper = scraper("metrics: [rpc]\nnon_cumulative_buckets: true\nexclude_labels: [job]\n");
    let out = scrape(
        &mut scraper,
        "# TYPE rpc histogram\n\
rpc_bucket{job=\"x\",le=\"1\"} 2\n\
rpc_bucket{job=\"x\",le=\"5\"} 7\n\
rpc_bucket{job=\"x\",le=\"+Inf\"} 8\n\
rpc_sum{job=\"x\"} 20\n\
rpc_count{job=\"x\"} 8\n",
    );
    assert_eq!(
        out,
        vec![
            "app.rpc.count:2|g|#upper_bound:1.0,lower_bound:0.0",
            "app.rpc.count:5|g|#upper_bound:5.0,lower_bound:1.0",
            "app.rpc.sum:20|g",
            "app.rpc.count:8|g|#upper_bound:none",
        ]
    );
}

#[test]
fn distribution_buckets_end_to_end() {
    let check = CheckFile::load_from_str(
        r#"
instances:
  - endpoint_url: http://localhost:8080/metrics
    namespace: app
    metrics: [rpc]
    send_distribution_buckets: true
    exclude_labels: [job]
"#,
    )
    .unwrap();
    let config = configure(&check.instances[0], &CheckDefaults::default()).unwrap();
    assert!(config.non_cumulative_buckets);

    let mut scraper = OpenMetricsScraper::new(config).unwrap();
    let out = scrape(
        &mut scraper,
        "# TYPE rpc histogram\n\
rpc_bucket{job=\"x\",le=\"1\"} 2\n\
rpc_bucket{job=\"x\",le=\"5\"} 7\n\
rpc_bucket{job=\"x\",le=\"+Inf\"} 8\n\
rpc_sum{job=\"x\"} 20\n\
rpc_count{job=\"x\"} 8\n",
    );
    assert_eq!(
        out,
        vec![
            "app.rpc:2|hb|@0:1|#upper_bound:1.0,lower_bound:0.0",
            "app.rpc:5|hb|@1:5|#upper_bound:5.0,lower_bound:1.0",
        ]
    );
}

#[test]
fn hostname_comes_from_label() {
    let mut scraper = scraper(
        "metrics: [node_load1]\nlabel_to_hostname: node\nlabel_to_hostname_suffix: \"-prod\"\n",
    );
    let out = scrape(
        &mut scraper,
        "# TYPE node_load1 gauge\nnode_load1{node=\"worker-3\"} 0.7\nnode_load1 0.2\n",
    );
    assert_eq!(
        out,
        vec![
            "app.node_load1:0.7|g|#node:worker-3|h:worker-3-prod",
            "app.node_load1:0.2|g",
        ]
    );
}

#[test]
fn type_override_promotes_untyped_family() {
    let mut scraper = scraper("metrics: [legacy_jobs_total]\ntype_overrides:\n  legacy_jobs_total: counter\n");
    let out = scrape(&mut scraper, "legacy_jobs_total{queue=\"q1\"} 42\n");
    assert_eq!(out, vec!["app.legacy_jobs_total:42|mc|#queue:q1"]);
}

#[test]
fn demo_check_file_configures() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/kube-state-metrics.yaml");
    let check = CheckFile::load_from_file(path).unwrap();
    let instances = check.instances.clone();
    let defaults = CheckDefaults::from(check.init_config);
    let configs: Vec<_> = instances
        .iter()
        .map(|i| configure(i, &defaults).unwrap())
        .collect();
    assert_eq!(configs[0].namespace, "kubernetes_state");
    assert_eq!(
        configs[0].label_joins["kube_pod_info"].mapping_key(),
        "namespace,pod"
    );
    assert!(configs[0].is_ignored("kube_node_status_capacity_cpu_cores"));
    assert_eq!(configs[1].namespace, "node");
    assert!(configs[1].telemetry);
}
