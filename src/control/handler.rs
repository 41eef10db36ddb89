//! Executes harness commands against the clusters and test runs it owns.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use super::ControlError;
use super::command::Command;
use crate::clock::Chrono;
use crate::cluster::{BucketOptions, BucketType, Cluster, ClusterError, ClusterHooks, ClusterOptions, NodeOptions};
use crate::hooks::{Cancel, CancelSource};
use crate::logging::{debug, info, warn};

/// Bucket, scope and collection every started test runs against.
const TEST_BUCKET: &str = "default";
const TEST_SCOPE: &str = "_default";
const TEST_COLLECTION: &str = "_default";

/// Create the cluster harnesses expect: two nodes, a couchbase bucket
/// `default` with one replica and a memcached bucket `memd`.
pub async fn default_cluster(opts: ClusterOptions) -> Result<Cluster, ClusterError> {
    let cluster = Cluster::new(opts).await?;
    cluster.add_node(NodeOptions::default()).await?;
    cluster.add_bucket(BucketOptions {
        name: TEST_BUCKET.to_string(),
        bucket_type: BucketType::Membase,
        replicas: 1,
        ..BucketOptions::default()
    })?;
    cluster.add_bucket(BucketOptions {
        name: "memd".to_string(),
        bucket_type: BucketType::Memcached,
        replicas: 0,
        ..BucketOptions::default()
    })?;
    Ok(cluster)
}

/// A test in progress. Its hooks are removed and its waiters cancelled
/// when it ends.
#[derive(Debug)]
struct ActiveTest {
    name: String,
    hooks: ClusterHooks,
    cancel: CancelSource,
}

impl ActiveTest {
    fn end(self) {
        self.cancel.cancel();
        self.hooks.destroy();
        debug!(test = %self.name, "test ended");
    }
}

#[derive(Debug)]
struct TestRun {
    client: String,
    cluster: Cluster,
    test: Option<ActiveTest>,
}

#[derive(Debug, Default)]
struct ControlState {
    clusters: HashMap<String, Cluster>,
    runs: HashMap<String, TestRun>,
}

/// What a test body needs to install expectations on the running test.
#[derive(Debug, Clone)]
pub struct TestContext {
    pub name: String,
    pub cluster: Cluster,
    /// Child chains owned by the test.
    pub hooks: ClusterHooks,
    /// Fires when the test ends.
    pub cancel: Cancel,
}

/// Serves harness commands. Shared by every control connection.
#[derive(Debug)]
pub struct ControlHandler {
    options: ClusterOptions,
    state: Mutex<ControlState>,
}

impl Default for ControlHandler {
    fn default() -> Self {
        Self::new(ClusterOptions::default())
    }
}

impl ControlHandler {
    /// Clusters created through this handler use `options`, each with its own clock.
    pub fn new(options: ClusterOptions) -> Self {
        Self {
            options,
            state: Mutex::new(ControlState::default()),
        }
    }

    fn cluster_options(&self) -> ClusterOptions {
        ClusterOptions {
            chrono: Chrono::new(),
            ..self.options.clone()
        }
    }

    /// A cluster created by `createcluster`.
    pub fn cluster(&self, id: &str) -> Option<Cluster> {
        self.state.lock().clusters.get(id).cloned()
    }

    /// The cluster backing a test run.
    pub fn run_cluster(&self, run: &str) -> Option<Cluster> {
        self.state.lock().runs.get(run).map(|r| r.cluster.clone())
    }

    /// The test currently running in `run`, if any.
    pub fn current_test(&self, run: &str) -> Option<TestContext> {
        let state = self.state.lock();
        let run = state.runs.get(run)?;
        let test = run.test.as_ref()?;
        Some(TestContext {
            name: test.name.clone(),
            cluster: run.cluster.clone(),
            hooks: test.hooks.clone(),
            cancel: test.cancel.token(),
        })
    }

    /// Answer one command. `None` means the command is not a request and
    /// the connection should be dropped.
    pub async fn handle(&self, cmd: Command) -> Option<Command> {
        debug!(command = cmd.name(), "control command received");
        let reply = match cmd {
            Command::Hello => Command::Hello,
            Command::CreateCluster { id } => self.create_cluster(id).await,
            Command::StartTesting { run, client } => self.start_testing(run, client).await,
            Command::EndTesting { run } => self.end_testing(&run),
            Command::StartTest { run, test } => self.start_test(&run, test),
            Command::EndTest { run, .. } => Command::EndedTest {
                error: self.end_test(&run).err().map(|e| e.to_string()).unwrap_or_default(),
            },
            Command::TimeTravel { run, cluster, amount_ms } => Command::TimeTravelled {
                error: self
                    .time_travel(&run, &cluster, Duration::from_millis(amount_ms))
                    .err()
                    .map(|e| e.to_string()),
            },
            Command::AddBucket {
                cluster,
                name,
                replicas,
                bucket_type,
            } => Command::AddedBucket {
                error: self
                    .add_bucket(&cluster, name, replicas, &bucket_type)
                    .err()
                    .map(|e| e.to_string()),
            },
            other => {
                warn!(command = other.name(), "unexpected control command");
                return None;
            }
        };
        Some(reply)
    }

    async fn create_cluster(&self, id: String) -> Command {
        match default_cluster(self.cluster_options()).await {
            Ok(cluster) => {
                let info = cluster.info();
                info!(id = %id, connstr = %info.connection_string, "control cluster created");
                if let Some(old) = self.state.lock().clusters.insert(id, cluster) {
                    old.close();
                }
                Command::CreatedCluster {
                    mgmt_addrs: info.mgmt_addrs,
                    connstr: info.connection_string,
                    error: None,
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to create cluster");
                Command::CreatedCluster {
                    mgmt_addrs: Vec::new(),
                    connstr: String::new(),
                    error: Some(err.to_string()),
                }
            }
        }
    }

    async fn start_testing(&self, run: String, client: String) -> Command {
        match default_cluster(self.cluster_options()).await {
            Ok(cluster) => {
                let info = cluster.info();
                info!(run = %run, client = %client, "test run started");
                let previous = self.state.lock().runs.insert(
                    run,
                    TestRun {
                        client,
                        cluster,
                        test: None,
                    },
                );
                if let Some(previous) = previous {
                    close_run(previous);
                }
                Command::StartedTesting {
                    mgmt_addrs: info.mgmt_addrs,
                    connstr: info.connection_string,
                    error: None,
                }
            }
            Err(err) => Command::StartedTesting {
                mgmt_addrs: Vec::new(),
                connstr: String::new(),
                error: Some(err.to_string()),
            },
        }
    }

    fn end_testing(&self, run_id: &str) -> Command {
        let Some(run) = self.state.lock().runs.remove(run_id) else {
            return Command::EndedTesting {
                report: serde_json::Value::Null,
                error: Some(ControlError::UnknownRun(run_id.to_string()).to_string()),
            };
        };
        info!(run = %run_id, client = %run.client, "test run ended");
        close_run(run);
        Command::EndedTesting {
            report: json!({}),
            error: None,
        }
    }

    fn start_test(&self, run_id: &str, name: String) -> Command {
        let mut state = self.state.lock();
        let Some(run) = state.runs.get_mut(run_id) else {
            return Command::StartedTest {
                connstr: String::new(),
                bucket: String::new(),
                scope: String::new(),
                collection: String::new(),
                error: Some(ControlError::UnknownRun(run_id.to_string()).to_string()),
            };
        };
        if let Some(previous) = run.test.take() {
            warn!(run = %run_id, test = %previous.name, "test started before the previous one ended");
            previous.end();
        }
        debug!(run = %run_id, test = %name, "test started");
        run.test = Some(ActiveTest {
            name,
            hooks: run.cluster.hooks().child(),
            cancel: CancelSource::new(),
        });
        Command::StartedTest {
            connstr: run.cluster.connection_string(),
            bucket: TEST_BUCKET.to_string(),
            scope: TEST_SCOPE.to_string(),
            collection: TEST_COLLECTION.to_string(),
            error: None,
        }
    }

    /// End the running test of `run_id`, cancelling its pending waits.
    pub fn end_test(&self, run_id: &str) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ControlError::UnknownRun(run_id.to_string()))?;
        let test = run.test.take().ok_or_else(|| ControlError::NoRunningTest(run_id.to_string()))?;
        test.end();
        Ok(())
    }

    /// Advance the clock of a cluster, a run's cluster, or both.
    pub fn time_travel(&self, run_id: &str, cluster_id: &str, amount: Duration) -> Result<(), ControlError> {
        let state = self.state.lock();
        let mut targets = Vec::new();
        if !cluster_id.is_empty() {
            let cluster = state
                .clusters
                .get(cluster_id)
                .ok_or_else(|| ControlError::UnknownCluster(cluster_id.to_string()))?;
            targets.push(cluster.clone());
        }
        if !run_id.is_empty() {
            let run = state
                .runs
                .get(run_id)
                .ok_or_else(|| ControlError::UnknownRun(run_id.to_string()))?;
            targets.push(run.cluster.clone());
        }
        drop(state);
        if targets.is_empty() {
            return Err(ControlError::UnknownCluster(String::new()));
        }
        for cluster in targets {
            cluster.chrono().time_travel(amount);
        }
        debug!(amount_ms = amount.as_millis(), "time travelled");
        Ok(())
    }

    pub fn add_bucket(&self, cluster_id: &str, name: String, replicas: u32, bucket_type: &str) -> Result<(), ControlError> {
        let cluster = self
            .cluster(cluster_id)
            .ok_or_else(|| ControlError::UnknownCluster(cluster_id.to_string()))?;
        cluster.add_bucket(BucketOptions {
            name,
            bucket_type: BucketType::parse(bucket_type),
            replicas,
            ..BucketOptions::default()
        })?;
        Ok(())
    }
}

fn close_run(mut run: TestRun) {
    if let Some(test) = run.test.take() {
        test.end();
    }
    run.cluster.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_clusters_and_adds_buckets() -> anyhow::Result<()> {
        let handler = ControlHandler::default();
        let reply = handler.handle(Command::CreateCluster { id: "c1".to_string() }).await;
        let Some(Command::CreatedCluster { connstr, mgmt_addrs, error }) = reply else {
            anyhow::bail!("unexpected reply {reply:?}");
        };
        assert!(error.is_none());
        assert!(connstr.starts_with("couchbase://"));
        assert_eq!(mgmt_addrs.len(), 2);

        let reply = handler
            .handle(Command::AddBucket {
                cluster: "c1".to_string(),
                name: "travel".to_string(),
                replicas: 0,
                bucket_type: "couchbase".to_string(),
            })
            .await;
        assert_eq!(reply, Some(Command::AddedBucket { error: None }));
        assert!(handler.cluster("c1").unwrap().get_bucket("travel").is_some());

        let reply = handler
            .handle(Command::AddBucket {
                cluster: "missing".to_string(),
                name: "x".to_string(),
                replicas: 0,
                bucket_type: String::new(),
            })
            .await;
        assert!(matches!(reply, Some(Command::AddedBucket { error: Some(_) })));
        Ok(())
    }

    #[tokio::test]
    async fn time_travel_moves_the_cluster_clock() -> anyhow::Result<()> {
        let handler = ControlHandler::default();
        handler.handle(Command::CreateCluster { id: "c1".to_string() }).await;
        let before = handler.cluster("c1").unwrap().chrono().now();
        let reply = handler
            .handle(Command::TimeTravel {
                run: String::new(),
                cluster: "c1".to_string(),
                amount_ms: 60_000,
            })
            .await;
        assert_eq!(reply, Some(Command::TimeTravelled { error: None }));
        let after = handler.cluster("c1").unwrap().chrono().now();
        assert!(after.duration_since(before)? >= Duration::from_secs(60));

        let reply = handler
            .handle(Command::TimeTravel {
                run: "nope".to_string(),
                cluster: String::new(),
                amount_ms: 1,
            })
            .await;
        assert!(matches!(reply, Some(Command::TimeTravelled { error: Some(_) })));
        Ok(())
    }

    #[tokio::test]
    async fn ending_a_test_cancels_its_waiters() -> anyhow::Result<()> {
        let handler = ControlHandler::default();
        handler
            .handle(Command::StartTesting {
                run: "r1".to_string(),
                client: "sdk".to_string(),
            })
            .await;
        let reply = handler
            .handle(Command::StartTest {
                run: "r1".to_string(),
                test: "kv/crud".to_string(),
            })
            .await;
        assert!(matches!(&reply, Some(Command::StartedTest { bucket, error: None, .. }) if bucket == "default"));

        let ctx = handler.current_test("r1").unwrap();
        let mut cancel = ctx.cancel.clone();
        let waiter = tokio::spawn(async move { ctx.hooks.kv_in.expect().key("never").wait(&mut cancel).await });

        let reply = handler
            .handle(Command::EndTest {
                run: "r1".to_string(),
                result: serde_json::Value::Null,
            })
            .await;
        assert_eq!(reply, Some(Command::EndedTest { error: String::new() }));
        assert!(waiter.await?.is_err());
        assert!(handler.current_test("r1").is_none());

        let reply = handler.handle(Command::EndTesting { run: "r1".to_string() }).await;
        assert!(matches!(reply, Some(Command::EndedTesting { error: None, .. })));
        Ok(())
    }

    #[tokio::test]
    async fn replies_are_not_requests() {
        let handler = ControlHandler::default();
        assert!(handler.handle(Command::AddedBucket { error: None }).await.is_none());
        assert_eq!(handler.handle(Command::Hello).await, Some(Command::Hello));
    }
}
