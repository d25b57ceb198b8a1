use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Default output file produced by an indexer when the job does not name one.
pub const DEFAULT_OUTFILE: &str = "dump.lsif";

/// A record that can be leased out by the manager.
///
/// The lease manager is generic over the payload it hands to workers; it only
/// needs a stable identifier and a wire representation.
pub trait QueueRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn record_id(&self) -> i64;
}

/// One containerized step of an indexing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    /// Working directory relative to the repository root.
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Step {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            commands: Vec::new(),
            root: String::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// An indexing job as handed out to workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: i64,
    pub repository_name: String,
    pub commit: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Directory the indexer and the upload run in.
    #[serde(default)]
    pub root: String,
    /// Optional indexer image, run after every step.
    #[serde(default)]
    pub indexer: Option<String>,
    #[serde(default)]
    pub indexer_args: Vec<String>,
    #[serde(default)]
    pub outfile: Option<String>,
}

impl Job {
    pub fn new(id: i64, repository_name: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            id,
            repository_name: repository_name.into(),
            commit: commit.into(),
            steps: Vec::new(),
            root: String::new(),
            indexer: None,
            indexer_args: Vec::new(),
            outfile: None,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_indexer<I, S>(mut self, image: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexer = Some(image.into());
        self.indexer_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Output file the upload step reads, falling back to [`DEFAULT_OUTFILE`].
    pub fn outfile(&self) -> &str {
        match self.outfile.as_deref() {
            Some(outfile) if !outfile.is_empty() => outfile,
            _ => DEFAULT_OUTFILE,
        }
    }
}

impl QueueRecord for Job {
    fn record_id(&self) -> i64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outfile_defaults_when_missing_or_empty() {
        let mut job = Job::new(1, "github.com/foo/bar", "deadbeef");
        assert_eq!(job.outfile(), DEFAULT_OUTFILE);

        job.outfile = Some(String::new());
        assert_eq!(job.outfile(), DEFAULT_OUTFILE);

        job.outfile = Some("index.scip".to_string());
        assert_eq!(job.outfile(), "index.scip");
    }

    #[test]
    fn job_wire_format_is_camel_case() {
        let job = Job::new(7, "github.com/foo/bar", "deadbeef")
            .with_step(Step::new("alpine").with_commands(["true"]).with_env("A", "1"));

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["repositoryName"], "github.com/foo/bar");
        assert_eq!(value["steps"][0]["image"], "alpine");
        assert_eq!(value["steps"][0]["env"]["A"], "1");
    }

    #[test]
    fn missing_optional_fields_deserialize() {
        let job: Job = serde_json::from_str(
            r#"{"id": 3, "repositoryName": "r", "commit": "c", "steps": [{"image": "alpine"}]}"#,
        )
        .unwrap();
        assert_eq!(job.steps[0].commands.len(), 0);
        assert!(job.indexer.is_none());
        assert_eq!(job.record_id(), 3);
    }
}
