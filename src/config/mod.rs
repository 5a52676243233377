use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Job configuration.
///
/// The top-level fields map one-to-one onto the job's environment variables
/// (`SOURCE_BUCKET`, `GLUE_TABLE`, ...). Tuning sections are nested and read
/// from `ICELOAD_<SECTION>__<KEY>` variables or an optional config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub source_bucket: String,
    pub source_prefix: String,
    pub target_bucket: String,
    pub glue_database: String,
    pub glue_table: String,
    #[serde(default = "default_region")]
    pub aws_region: String,
    /// Partition date used when the event carries none. Empty means unset.
    #[serde(default)]
    pub default_target_date: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub append: AppendConfig,
}

fn default_region() -> String {
    "ap-northeast-1".to_string()
}

/// DuckDB settings applied to the warm handle and to every ingest session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_home_directory")]
    pub home_directory: String,
    /// Where extensions are installed. DuckDB's default (under home) when unset.
    #[serde(default)]
    pub extension_directory: Option<String>,
    /// Base directory for per-session swap directories.
    #[serde(default = "default_temp_directory")]
    pub temp_directory: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_max_temp_directory_size")]
    pub max_temp_directory_size: String,
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Install an S3 secret backed by the AWS credential chain.
    #[serde(default = "default_true")]
    pub credential_chain: bool,
}

fn default_home_directory() -> String {
    "/tmp".to_string()
}

fn default_temp_directory() -> String {
    "/tmp/duckdb_swap".to_string()
}

fn default_memory_limit() -> String {
    "3GB".to_string()
}

fn default_max_temp_directory_size() -> String {
    "7GB".to_string()
}

fn default_extensions() -> Vec<String> {
    vec!["httpfs".to_string(), "aws".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home_directory: default_home_directory(),
            extension_directory: None,
            temp_directory: default_temp_directory(),
            memory_limit: default_memory_limit(),
            max_temp_directory_size: default_max_temp_directory_size(),
            threads: None,
            extensions: default_extensions(),
            credential_chain: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Glob template with `{bucket}`, `{prefix}` and `{date}` placeholders.
    #[serde(default = "default_path_template")]
    pub path_template: String,
    /// Query file overriding the embedded extraction query.
    #[serde(default)]
    pub query_path: Option<String>,
    /// Reject partition dates that are not `YYYY-MM-DD` instead of passing them through.
    #[serde(default)]
    pub validate_partition_date: bool,
    /// Deadline for one invocation, in seconds. No deadline when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_path_template() -> String {
    "s3://{bucket}/{prefix}/id=*/date={date}/*.csv".to_string()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            path_template: default_path_template(),
            query_path: None,
            validate_partition_date: false,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// `glue` or `rest`.
    #[serde(rename = "type", default = "default_catalog_type")]
    pub catalog_type: String,
    /// REST catalog endpoint. Required for `rest`.
    #[serde(default)]
    pub uri: Option<String>,
    /// REST catalog bearer token.
    #[serde(default)]
    pub token: Option<String>,
    /// Overrides the `s3://{target_bucket}/iceberg/` warehouse location.
    #[serde(default)]
    pub warehouse: Option<String>,
}

fn default_catalog_type() -> String {
    "glue".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            catalog_type: default_catalog_type(),
            uri: None,
            token: None,
            warehouse: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppendConfig {
    /// Output file size hint used when the table sets no `write.target-file-size-bytes`.
    #[serde(default = "default_target_file_size_bytes")]
    pub target_file_size_bytes: usize,
}

fn default_target_file_size_bytes() -> usize {
    512 * 1024 * 1024
}

impl Default for AppendConfig {
    fn default() -> Self {
        Self {
            target_file_size_bytes: default_target_file_size_bytes(),
        }
    }
}

/// Unprefixed variables read into the top-level fields. Anything else in the
/// environment is ignored, so a stray `ENGINE` or `INGEST` cannot shadow a
/// section.
const JOB_VARIABLES: [&str; 7] = [
    "SOURCE_BUCKET",
    "SOURCE_PREFIX",
    "TARGET_BUCKET",
    "GLUE_DATABASE",
    "GLUE_TABLE",
    "AWS_REGION",
    "DEFAULT_TARGET_DATE",
];

fn job_variables(env: Option<&HashMap<String, String>>) -> HashMap<String, String> {
    let lookup = |name: &str| match env {
        Some(env) => env.get(name).cloned(),
        None => std::env::var(name).ok(),
    };
    JOB_VARIABLES
        .iter()
        .filter_map(|name| lookup(name).map(|value| (name.to_string(), value)))
        .collect()
}

impl AppConfig {
    /// Load configuration from an optional file and the process environment.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        Self::load_from(config_path, None)
    }

    /// Load configuration, reading environment variables from `env` instead of
    /// the process environment when given.
    pub fn load_from(config_path: Option<&str>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Job variables: SOURCE_BUCKET, GLUE_TABLE, AWS_REGION, ...
        builder = builder
            .add_source(config::Environment::default().source(Some(job_variables(env.as_ref()))));

        // Tuning: ICELOAD_ENGINE__MEMORY_LIMIT=2GB
        builder = builder.add_source(
            config::Environment::with_prefix("ICELOAD")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("engine.extensions")
                .try_parsing(true)
                .source(env),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // An exported-but-empty DEFAULT_TARGET_DATE means "not configured".
        if config
            .default_target_date
            .as_deref()
            .is_some_and(|d| d.trim().is_empty())
        {
            config.default_target_date = None;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("SOURCE_BUCKET", &self.source_bucket),
            ("SOURCE_PREFIX", &self.source_prefix),
            ("TARGET_BUCKET", &self.target_bucket),
            ("GLUE_DATABASE", &self.glue_database),
            ("GLUE_TABLE", &self.glue_table),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }

        match self.catalog.catalog_type.as_str() {
            "glue" => {
                if self.aws_region.trim().is_empty() {
                    anyhow::bail!("Glue catalog requires a region");
                }
            }
            "rest" => {
                if self.catalog.uri.is_none() {
                    anyhow::bail!("REST catalog requires 'uri'");
                }
            }
            _ => anyhow::bail!("Invalid catalog type: {}", self.catalog.catalog_type),
        }

        if !self.ingest.path_template.contains("{date}") {
            anyhow::bail!("Path template must contain a {{date}} placeholder");
        }

        if self.append.target_file_size_bytes == 0 {
            anyhow::bail!("target_file_size_bytes must be greater than zero");
        }

        Ok(())
    }

    /// Warehouse location for the target catalog.
    pub fn warehouse(&self) -> String {
        self.catalog
            .warehouse
            .clone()
            .unwrap_or_else(|| format!("s3://{}/iceberg/", self.target_bucket))
    }
}
