//! Process settings, parsed once from the command line and environment.

use std::path::PathBuf;
use std::time::Duration;

use broker::BrokerSettings;
use clap::{Args, ValueEnum};
use control::FetchPolicy;
use stages::DEFAULT_BLOB_SCHEME;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Arguments of the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Pipeline definition JSON file
    #[arg(
        long,
        env = "INDEXER_PIPELINE_FILE",
        conflicts_with = "control_url",
        required_unless_present = "control_url"
    )]
    pub pipeline_file: Option<PathBuf>,

    /// Base URL of the control endpoint serving the pipeline definition
    #[arg(long, env = "INDEXER_CONTROL_URL")]
    pub control_url: Option<String>,

    /// Definition fetch attempts before start-up fails
    #[arg(long, default_value_t = 3)]
    pub fetch_attempts: u32,

    /// Delay before the first fetch retry, doubled on each further retry
    #[arg(long, default_value_t = 500, value_name = "MILLIS")]
    pub fetch_backoff_ms: u64,

    #[arg(long, default_value_t = 2)]
    pub max_connections: usize,

    #[arg(long, default_value_t = 10)]
    pub max_channels: usize,

    /// Root directory of the filesystem blob store (in-memory when absent)
    #[arg(long, env = "INDEXER_BLOB_DIR")]
    pub blob_dir: Option<PathBuf>,

    /// Scheme written into blob locators
    #[arg(long, default_value = DEFAULT_BLOB_SCHEME)]
    pub blob_scheme: String,

    /// PostgreSQL URL of the task status store (in-memory when absent)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, default_value_t = 5)]
    pub database_max_connections: u32,

    /// JSON array of documents searched by the crawler stage
    #[arg(long, env = "INDEXER_CORPUS_FILE")]
    pub corpus_file: Option<PathBuf>,

    /// Source name crawler locators address (`web://<source>?...`)
    #[arg(long, default_value = "arxiv")]
    pub source: String,

    /// Submit one crawl task for this query after start-up
    #[arg(long)]
    pub query: Option<String>,

    #[arg(long, default_value_t = 10)]
    pub limit: u32,

    #[arg(long, default_value = "default")]
    pub department: String,

    /// Exit once the submitted task settles, printing its progress report
    #[arg(long, requires = "query")]
    pub once: bool,

    /// With `--once`, give up if the task has not settled after this long
    #[arg(long, default_value_t = 300, value_name = "SECS")]
    pub settle_timeout_secs: u64,
}

/// Where the pipeline definition comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionSource {
    File(PathBuf),
    Control { base_url: String, policy: FetchPolicy },
}

/// A crawl submitted right after start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub query: String,
    pub limit: u32,
    pub department: String,
    pub wait: bool,
    pub settle_timeout: Duration,
}

/// Everything the `run` subcommand needs, resolved from [`RunArgs`].
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub definition: DefinitionSource,
    pub broker: BrokerSettings,
    pub blob_dir: Option<PathBuf>,
    pub blob_scheme: String,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub corpus_file: Option<PathBuf>,
    pub source: String,
    pub submission: Option<Submission>,
}

impl From<RunArgs> for Settings {
    fn from(args: RunArgs) -> Self {
        let definition = match (args.pipeline_file, args.control_url) {
            (Some(path), _) => DefinitionSource::File(path),
            (None, url) => DefinitionSource::Control {
                base_url: url.unwrap_or_default(),
                policy: FetchPolicy {
                    attempts: args.fetch_attempts.max(1),
                    initial_backoff: Duration::from_millis(args.fetch_backoff_ms),
                    ..FetchPolicy::default()
                },
            },
        };
        let submission = args.query.map(|query| Submission {
            query,
            limit: args.limit,
            department: args.department,
            wait: args.once,
            settle_timeout: Duration::from_secs(args.settle_timeout_secs),
        });

        Self {
            definition,
            broker: BrokerSettings {
                max_connections: args.max_connections.max(1),
                max_channels: args.max_channels.max(1),
            },
            blob_dir: args.blob_dir,
            blob_scheme: args.blob_scheme,
            database_url: args.database_url,
            database_max_connections: args.database_max_connections,
            corpus_file: args.corpus_file,
            source: args.source,
            submission,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunArgs,
    }

    fn settings(args: &[&str]) -> Settings {
        let mut argv = vec!["indexer"];
        argv.extend_from_slice(args);
        Harness::try_parse_from(argv).unwrap().run.into()
    }

    #[test]
    fn control_url_uses_fetch_policy_flags() {
        let settings = settings(&[
            "--control-url",
            "http://control:8080",
            "--fetch-attempts",
            "5",
            "--fetch-backoff-ms",
            "100",
        ]);
        let DefinitionSource::Control { base_url, policy } = settings.definition else {
            panic!("expected control source");
        };
        assert_eq!(base_url, "http://control:8080");
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(settings.broker, BrokerSettings::default());
    }

    #[test]
    fn pipeline_file_and_control_url_conflict() {
        let parsed = Harness::try_parse_from([
            "indexer",
            "--pipeline-file",
            "p.json",
            "--control-url",
            "http://control",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn query_becomes_submission() {
        let settings = settings(&[
            "--pipeline-file",
            "p.json",
            "--query",
            "graph networks",
            "--limit",
            "3",
            "--once",
            "--settle-timeout-secs",
            "30",
        ]);
        assert_eq!(settings.definition, DefinitionSource::File("p.json".into()));
        assert_eq!(
            settings.submission,
            Some(Submission {
                query: "graph networks".into(),
                limit: 3,
                department: "default".into(),
                wait: true,
                settle_timeout: Duration::from_secs(30),
            })
        );
    }

    #[test]
    fn once_requires_query() {
        assert!(Harness::try_parse_from(["indexer", "--pipeline-file", "p.json", "--once"]).is_err());
    }
}
