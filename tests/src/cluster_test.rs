// Scenario runner for an in-process NameStore cluster
use namestore::{
    Config, FieldUpdate, KeepCurrentActives, LocalCluster, NameStoreError, NodeId, UpdateOperation,
};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CLUSTER_SIZE: u32 = 6;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting NameStore cluster scenarios");

    tracing_subscriber::fmt::init();

    let mut cluster = LocalCluster::start_with(CLUSTER_SIZE, Arc::new(KeepCurrentActives), |config: Config| {
        let mut config = config.with_rc_timeout_ms(200);
        config.quorum_timeout_ms = 2000;
        config
    })
    .await?;

    let mut test_results = TestResults::new();

    test_results.add_suite_result("records", run_record_tests(&cluster).await);
    test_results.add_suite_result("migration", run_migration_tests(&cluster).await);
    test_results.add_suite_result("removal", run_removal_tests(&cluster).await);
    test_results.add_suite_result("load_distribution", run_load_distribution_tests(&cluster).await);

    let failed = test_results.generate_report();
    cluster.shutdown();

    if failed > 0 {
        return Err(format!("{} scenarios failed", failed).into());
    }
    println!("Cluster scenarios completed");
    Ok(())
}

fn values(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn first_controller(cluster: &LocalCluster, name: &str) -> NodeId {
    cluster
        .controllers_for(name)
        .into_iter()
        .next()
        .unwrap_or(NodeId(1))
}

fn record(suite: &mut SuiteResult, name: &str, start: Instant, outcome: Result<(), String>) {
    match outcome {
        Ok(()) => suite.add_test_result(TestResult::passed(name, start.elapsed())),
        Err(error) => suite.add_test_result(TestResult::failed(name, start.elapsed(), &error)),
    }
}

async fn add_then_lookup(cluster: &LocalCluster, id: NodeId) -> Result<(), String> {
    let node = cluster.node(id).ok_or("missing node")?;
    node.add("alice", "email", values(&["alice@example.com"]))
        .await
        .map_err(|e| e.to_string())?;
    match node.lookup("alice", "email").await.map_err(|e| e.to_string())? {
        Some(found) if found == values(&["alice@example.com"]) => Ok(()),
        other => Err(format!("unexpected lookup result {:?}", other)),
    }
}

async fn duplicate_add_rejected(cluster: &LocalCluster, id: NodeId) -> Result<(), String> {
    let node = cluster.node(id).ok_or("missing node")?;
    match node.add("alice", "email", values(&["other"])).await {
        Err(NameStoreError::DuplicateName(_)) => Ok(()),
        other => Err(format!("expected DuplicateName, got {:?}", other)),
    }
}

async fn compare_and_swap(cluster: &LocalCluster, id: NodeId) -> Result<(), String> {
    let node = cluster.node(id).ok_or("missing node")?;
    let update = FieldUpdate::new("email", UpdateOperation::Substitute, values(&["alice@new.example"]))
        .with_old_values(values(&["alice@example.com"]));
    node.update("alice", update).await.map_err(|e| e.to_string())?;

    let stale = FieldUpdate::new("email", UpdateOperation::Substitute, values(&["x"]))
        .with_old_values(values(&["alice@example.com"]));
    match node.update("alice", stale).await {
        Err(NameStoreError::CompareFailed(_)) => Ok(()),
        other => Err(format!("expected CompareFailed, got {:?}", other)),
    }
}

async fn run_record_tests(cluster: &LocalCluster) -> SuiteResult {
    println!("Testing add, update and lookup...");
    let mut suite = SuiteResult::new("records");
    let id = first_controller(cluster, "alice");

    let start = Instant::now();
    record(&mut suite, "add_then_lookup", start, add_then_lookup(cluster, id).await);

    let start = Instant::now();
    record(&mut suite, "duplicate_add_rejected", start, duplicate_add_rejected(cluster, id).await);

    let start = Instant::now();
    record(&mut suite, "compare_and_swap", start, compare_and_swap(cluster, id).await);

    suite
}

async fn move_to_complement(cluster: &LocalCluster) -> Result<(), String> {
    let controllers = cluster.controllers_for("bob");
    let targets: BTreeSet<NodeId> = cluster.node_ids().difference(&controllers).copied().collect();
    let node = cluster.node(first_controller(cluster, "bob")).ok_or("missing node")?;

    node.add("bob", "x", values(&["1"])).await.map_err(|e| e.to_string())?;
    node.propose_new_actives("bob", targets.clone())
        .await
        .map_err(|e| e.to_string())?
        .ok_or("nothing proposed")?;

    let expected = &targets;
    let migrated = LocalCluster::wait_until(Duration::from_secs(5), move || async move {
        matches!(
            node.controller_record("bob").await,
            Ok(Some(record)) if record.active_running && &record.active_servers == expected
        )
    })
    .await;
    if !migrated {
        return Err("migration did not finish".to_string());
    }

    let target = targets.iter().next().copied().ok_or("no target")?;
    let active = cluster.node(target).ok_or("missing target")?;
    match active.lookup("bob", "x").await.map_err(|e| e.to_string())? {
        Some(found) if found == values(&["1"]) => Ok(()),
        other => Err(format!("value lost in migration: {:?}", other)),
    }
}

async fn run_migration_tests(cluster: &LocalCluster) -> SuiteResult {
    println!("Testing active set migration...");
    let mut suite = SuiteResult::new("migration");

    let start = Instant::now();
    record(&mut suite, "move_to_complement", start, move_to_complement(cluster).await);

    suite
}

async fn remove_then_re_add(cluster: &LocalCluster) -> Result<(), String> {
    let node = cluster.node(first_controller(cluster, "carol")).ok_or("missing node")?;
    node.add("carol", "phone", values(&["555"])).await.map_err(|e| e.to_string())?;
    node.remove("carol").await.map_err(|e| e.to_string())?;
    match node.lookup("carol", "phone").await {
        Err(NameStoreError::InvalidName(_)) => {}
        other => return Err(format!("expected InvalidName, got {:?}", other)),
    }
    node.add("carol", "phone", values(&["556"])).await.map_err(|e| e.to_string())
}

async fn run_removal_tests(cluster: &LocalCluster) -> SuiteResult {
    println!("Testing removal...");
    let mut suite = SuiteResult::new("removal");

    let start = Instant::now();
    record(&mut suite, "remove_then_re_add", start, remove_then_re_add(cluster).await);

    suite
}

async fn add_at_controller(cluster: &LocalCluster, name: String) -> Result<(), String> {
    let node = cluster
        .node(first_controller(cluster, &name))
        .ok_or_else(|| format!("no controller for {}", name))?;
    node.add(&name, "v", values(&["0"])).await.map_err(|e| e.to_string())
}

async fn run_load_distribution_tests(cluster: &LocalCluster) -> SuiteResult {
    println!("Testing controller placement...");
    let mut suite = SuiteResult::new("load_distribution");

    let start = Instant::now();
    let mut per_node: HashMap<NodeId, usize> = HashMap::new();
    for i in 0..600 {
        for controller in cluster.controllers_for(&format!("name-{}", i)) {
            *per_node.entry(controller).or_default() += 1;
        }
    }
    let outcome = if per_node.len() == CLUSTER_SIZE as usize {
        Ok(())
    } else {
        Err(format!("only {} nodes control any name", per_node.len()))
    };
    println!("   Controller load: {:?}", per_node);
    record(&mut suite, "every_node_controls_names", start, outcome);

    let start = Instant::now();
    let adds = (0..20).map(|i| add_at_controller(cluster, format!("bulk-{}", i)));
    let failures: Vec<String> = futures::future::join_all(adds)
        .await
        .into_iter()
        .filter_map(|result| result.err())
        .collect();
    let outcome = if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    };
    record(&mut suite, "concurrent_adds", start, outcome);

    suite
}

// Test result tracking

struct TestResults {
    suites: Vec<SuiteResult>,
    start_time: Instant,
}

#[derive(Debug, Clone)]
struct SuiteResult {
    name: String,
    tests: Vec<TestResult>,
    start_time: Instant,
}

#[derive(Debug, Clone)]
struct TestResult {
    name: String,
    status: TestStatus,
    duration: Duration,
    error_message: Option<String>,
}

#[derive(Debug, Clone)]
enum TestStatus {
    Passed,
    Failed,
}

impl TestResults {
    fn new() -> Self {
        Self {
            suites: Vec::new(),
            start_time: Instant::now(),
        }
    }

    fn add_suite_result(&mut self, name: &str, mut suite: SuiteResult) {
        suite.name = name.to_string();
        self.suites.push(suite);
    }

    /// Prints the report, writes it as JSON and returns the failure count.
    fn generate_report(&self) -> usize {
        let total_duration = self.start_time.elapsed();

        println!("\nNameStore Cluster Scenario Report");
        println!("{}", "=".repeat(60));

        let mut total_tests = 0;
        let mut passed_tests = 0;
        let mut failed_tests = 0;

        for suite in &self.suites {
            println!("\nSuite: {}", suite.name);
            println!("   Duration: {:?}", suite.start_time.elapsed());

            for test in &suite.tests {
                let status_symbol = match test.status {
                    TestStatus::Passed => "PASS",
                    TestStatus::Failed => "FAIL",
                };
                println!("   {} {} ({:?})", status_symbol, test.name, test.duration);
                if let Some(error) = &test.error_message {
                    println!("      Error: {}", error);
                }

                total_tests += 1;
                match test.status {
                    TestStatus::Passed => passed_tests += 1,
                    TestStatus::Failed => failed_tests += 1,
                }
            }
        }

        println!("\nSummary");
        println!("   Total: {}", total_tests);
        println!("   Passed: {}", passed_tests);
        println!("   Failed: {}", failed_tests);
        println!("   Total Duration: {:?}", total_duration);

        let json_report = json!({
            "timestamp": chrono::Utc::now(),
            "total_duration_ms": total_duration.as_millis(),
            "summary": {
                "total": total_tests,
                "passed": passed_tests,
                "failed": failed_tests,
            },
            "suites": self.suites.iter().map(|suite| {
                json!({
                    "name": suite.name,
                    "tests": suite.tests.iter().map(|test| {
                        json!({
                            "name": test.name,
                            "status": format!("{:?}", test.status),
                            "duration_ms": test.duration.as_millis(),
                            "error": test.error_message,
                        })
                    }).collect::<Vec<_>>()
                })
            }).collect::<Vec<_>>()
        });

        if let Ok(json_str) = serde_json::to_string_pretty(&json_report) {
            if let Err(e) = std::fs::write("cluster_test_results.json", json_str) {
                println!("Failed to write results: {}", e);
            } else {
                println!("Results saved to cluster_test_results.json");
            }
        }

        failed_tests
    }
}

impl SuiteResult {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tests: Vec::new(),
            start_time: Instant::now(),
        }
    }

    fn add_test_result(&mut self, result: TestResult) {
        self.tests.push(result);
    }
}

impl TestResult {
    fn passed(name: &str, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            status: TestStatus::Passed,
            duration,
            error_message: None,
        }
    }

    fn failed(name: &str, duration: Duration, error: &str) -> Self {
        Self {
            name: name.to_string(),
            status: TestStatus::Failed,
            duration,
            error_message: Some(error.to_string()),
        }
    }
}
