use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use iceberg::{Catalog, NamespaceIdent, TableIdent};
use iceberg_catalog_glue::{GlueCatalog, GlueCatalogConfig};
use iceberg_catalog_rest::{RestCatalog, RestCatalogConfig};

use super::AppendError;
use crate::config::AppConfig;

// Property constants for REST catalog
const REST_TOKEN: &str = "token";

// Property constants for Glue catalog
const AWS_REGION: &str = "region_name";
const S3_REGION: &str = "s3.region";

/// Which catalog service owns the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogKind {
    /// AWS Glue, authenticated through the ambient credential chain.
    Glue { region: String },
    Rest { uri: String, token: Option<String> },
}

/// Everything needed to load the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogDescriptor {
    pub kind: CatalogKind,
    /// Warehouse location (e.g., s3://bucket/iceberg/)
    pub warehouse: String,
}

impl CatalogDescriptor {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppendError> {
        let kind = match config.catalog.catalog_type.as_str() {
            "glue" => CatalogKind::Glue {
                region: config.aws_region.clone(),
            },
            "rest" => CatalogKind::Rest {
                uri: config.catalog.uri.clone().ok_or_else(|| {
                    AppendError::CatalogLoad("REST catalog requires 'uri'".to_string())
                })?,
                token: config.catalog.token.clone(),
            },
            other => {
                return Err(AppendError::CatalogLoad(format!(
                    "unknown catalog type '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            kind,
            warehouse: config.warehouse(),
        })
    }

    /// Extra properties handed to the catalog client. The warehouse and the
    /// REST uri travel in the catalog config itself.
    pub fn properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();
        match &self.kind {
            CatalogKind::Glue { region } => {
                props.insert(AWS_REGION.to_string(), region.clone());
                props.insert(S3_REGION.to_string(), region.clone());
            }
            CatalogKind::Rest { token, .. } => {
                if let Some(token) = token {
                    props.insert(REST_TOKEN.to_string(), token.clone());
                }
            }
        }
        props
    }

    /// Build an Iceberg catalog client.
    pub async fn load(&self) -> Result<Arc<dyn Catalog>, AppendError> {
        let props = self.properties();

        match &self.kind {
            CatalogKind::Glue { .. } => {
                let config = GlueCatalogConfig::builder()
                    .warehouse(self.warehouse.clone())
                    .props(props)
                    .build();
                let catalog = GlueCatalog::new(config)
                    .await
                    .map_err(|e| AppendError::CatalogLoad(e.to_string()))?;
                Ok(Arc::new(catalog))
            }
            CatalogKind::Rest { uri, .. } => {
                let config = RestCatalogConfig::builder()
                    .uri(uri.clone())
                    .warehouse(self.warehouse.clone())
                    .props(props)
                    .build();
                Ok(Arc::new(RestCatalog::new(config)))
            }
        }
    }
}

/// Two-part table identifier: namespace (Glue database) and table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub namespace: String,
    pub table: String,
}

impl TableName {
    pub fn new(namespace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            table: table.into(),
        }
    }

    pub fn to_ident(&self) -> Result<TableIdent, AppendError> {
        let parts: Vec<&str> = self.namespace.split('.').collect();
        let namespace =
            NamespaceIdent::from_strs(&parts).map_err(|e| AppendError::TableLoad(e.to_string()))?;
        Ok(TableIdent::new(namespace, self.table.clone()))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.table)
    }
}
