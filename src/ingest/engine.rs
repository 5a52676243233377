//! DuckDB engine settings and the process-wide warm handle.

use async_trait::async_trait;
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::IngestError;
use crate::config::AppConfig;
use crate::credentials::{CredentialError, CredentialProvider};

/// Settings applied to every DuckDB connection this process opens.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub home_directory: String,
    pub extension_directory: Option<String>,
    /// Base directory; each session gets its own subdirectory.
    pub temp_directory: PathBuf,
    pub memory_limit: Option<String>,
    pub max_temp_directory_size: Option<String>,
    pub threads: Option<u32>,
    pub extensions: Vec<String>,
    pub credential_chain: bool,
    pub region: Option<String>,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let engine = &config.engine;
        Self {
            home_directory: engine.home_directory.clone(),
            extension_directory: engine.extension_directory.clone(),
            temp_directory: PathBuf::from(&engine.temp_directory),
            memory_limit: Some(engine.memory_limit.clone()),
            max_temp_directory_size: Some(engine.max_temp_directory_size.clone()),
            threads: engine.threads,
            extensions: engine.extensions.clone(),
            credential_chain: engine.credential_chain,
            region: Some(config.aws_region.clone()),
        }
    }

    /// Settings for reading local files only: no extensions, no S3 secret.
    pub fn local(temp_directory: impl Into<PathBuf>) -> Self {
        Self {
            home_directory: std::env::temp_dir().to_string_lossy().into_owned(),
            extension_directory: None,
            temp_directory: temp_directory.into(),
            memory_limit: None,
            max_temp_directory_size: None,
            threads: None,
            extensions: Vec::new(),
            credential_chain: false,
            region: None,
        }
    }

    /// Statements that make a fresh connection able to read object storage.
    pub fn base_statements(&self) -> Result<Vec<String>, IngestError> {
        let mut statements = vec![format!(
            "SET home_directory = {}",
            quote_literal(&self.home_directory)
        )];

        if let Some(dir) = &self.extension_directory {
            statements.push(format!("SET extension_directory = {}", quote_literal(dir)));
        }

        for extension in &self.extensions {
            if !is_identifier(extension) {
                return Err(IngestError::Setup(format!(
                    "invalid extension name '{}'",
                    extension
                )));
            }
            statements.push(format!("INSTALL {}", extension));
            statements.push(format!("LOAD {}", extension));
        }

        Ok(statements)
    }

    /// Memory and spill settings, spilling into `swap_dir`.
    pub fn tuning_statements(&self, swap_dir: &Path) -> Vec<String> {
        let mut statements = vec![format!(
            "SET temp_directory = {}",
            quote_literal(&swap_dir.to_string_lossy())
        )];

        if let Some(limit) = &self.memory_limit {
            statements.push(format!("SET memory_limit = {}", quote_literal(limit)));
        }
        if let Some(size) = &self.max_temp_directory_size {
            statements.push(format!(
                "SET max_temp_directory_size = {}",
                quote_literal(size)
            ));
        }
        if let Some(threads) = self.threads {
            statements.push(format!("SET threads = {}", threads));
        }

        statements
    }

    /// The S3 secret backed by the AWS credential chain, if enabled.
    pub fn secret_statement(&self) -> Option<String> {
        if !self.credential_chain {
            return None;
        }

        Some(match &self.region {
            Some(region) => format!(
                "CREATE OR REPLACE SECRET (TYPE s3, PROVIDER credential_chain, REGION {})",
                quote_literal(region)
            ),
            None => "CREATE OR REPLACE SECRET (TYPE s3, PROVIDER credential_chain)".to_string(),
        })
    }
}

/// Run setup statements in order, stopping at the first failure.
pub(crate) fn apply_statements(conn: &Connection, statements: &[String]) -> Result<(), IngestError> {
    for statement in statements {
        debug!(statement = %statement, "Applying DuckDB setup");
        conn.execute_batch(statement)
            .map_err(|e| IngestError::Setup(format!("{}: {}", statement, e)))?;
    }
    Ok(())
}

/// Quote a string as a SQL literal.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Long-lived DuckDB handle kept for the lifetime of the process.
///
/// Construction installs and loads the configured extensions, applies the
/// engine settings and issues the S3 secret once. Afterwards the handle is
/// only used to re-issue that secret; all data work happens in fresh
/// sessions.
#[derive(Debug)]
pub struct WarmEngine {
    conn: Arc<Mutex<Connection>>,
    settings: Arc<EngineSettings>,
}

impl WarmEngine {
    pub fn start(settings: Arc<EngineSettings>) -> Result<Self, IngestError> {
        std::fs::create_dir_all(&settings.temp_directory)?;

        let conn = Connection::open_in_memory()
            .map_err(|e| IngestError::Connection(e.to_string()))?;

        apply_statements(&conn, &settings.base_statements()?)?;
        apply_statements(&conn, &settings.tuning_statements(&settings.temp_directory))?;
        if let Some(secret) = settings.secret_statement() {
            apply_statements(&conn, &[secret])?;
        }

        info!(
            extensions = ?settings.extensions,
            credential_chain = settings.credential_chain,
            "Warm engine initialized"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            settings,
        })
    }

    pub fn settings(&self) -> &Arc<EngineSettings> {
        &self.settings
    }
}

#[async_trait]
impl CredentialProvider for WarmEngine {
    async fn refresh(&self) -> Result<(), CredentialError> {
        let Some(secret) = self.settings.secret_statement() else {
            debug!("Credential chain disabled; nothing to refresh");
            return Ok(());
        };

        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| CredentialError::Refresh("warm engine lock poisoned".to_string()))?;
            conn.execute_batch(&secret)
                .map_err(|e| CredentialError::Refresh(e.to_string()))
        })
        .await
        .map_err(|e| CredentialError::Refresh(e.to_string()))??;

        debug!("Object-store credential refreshed");
        Ok(())
    }
}
