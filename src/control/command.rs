//! Harness commands and their replies.

use serde::{Deserialize, Serialize};

/// One control message. The `type` field selects the variant.
///
/// Replies carry an `error` field when the request could not be served;
/// harnesses that predate it simply ignore the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    Hello,
    CreateCluster {
        #[serde(default)]
        id: String,
    },
    CreatedCluster {
        #[serde(default)]
        mgmt_addrs: Vec<String>,
        #[serde(default)]
        connstr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StartTesting {
        #[serde(default)]
        run: String,
        #[serde(default)]
        client: String,
    },
    StartedTesting {
        #[serde(default)]
        mgmt_addrs: Vec<String>,
        #[serde(default)]
        connstr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    EndTesting {
        #[serde(default)]
        run: String,
    },
    EndedTesting {
        #[serde(default)]
        report: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StartTest {
        #[serde(default)]
        run: String,
        #[serde(default)]
        test: String,
    },
    StartedTest {
        #[serde(default)]
        connstr: String,
        #[serde(default)]
        bucket: String,
        #[serde(default)]
        scope: String,
        #[serde(default)]
        collection: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    EndTest {
        #[serde(default)]
        run: String,
        #[serde(default, rename = "Result")]
        result: serde_json::Value,
    },
    EndedTest {
        #[serde(default, rename = "Error")]
        error: String,
    },
    TimeTravel {
        #[serde(default)]
        run: String,
        #[serde(default)]
        cluster: String,
        #[serde(default)]
        amount_ms: u64,
    },
    TimeTravelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AddBucket {
        #[serde(default)]
        cluster: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        replicas: u32,
        #[serde(default)]
        bucket_type: String,
    },
    AddedBucket {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Command {
    /// The wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Hello => "hello",
            Command::CreateCluster { .. } => "createcluster",
            Command::CreatedCluster { .. } => "createdcluster",
            Command::StartTesting { .. } => "starttesting",
            Command::StartedTesting { .. } => "startedtesting",
            Command::EndTesting { .. } => "endtesting",
            Command::EndedTesting { .. } => "endedtesting",
            Command::StartTest { .. } => "starttest",
            Command::StartedTest { .. } => "startedtest",
            Command::EndTest { .. } => "endtest",
            Command::EndedTest { .. } => "endedtest",
            Command::TimeTravel { .. } => "timetravel",
            Command::TimeTravelled { .. } => "timetravelled",
            Command::AddBucket { .. } => "addbucket",
            Command::AddedBucket { .. } => "addedbucket",
        }
    }
}
