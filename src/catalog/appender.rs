//! Append accumulated batches to an Iceberg table as one snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use arrow_array_55 as arrow55_array;
use arrow_ipc_55 as arrow55_ipc;
use async_trait::async_trait;
use datafusion::arrow::record_batch::RecordBatch;
use iceberg::arrow::schema_to_arrow_schema;
use iceberg::spec::PROPERTY_COMMIT_NUM_RETRIES;
use iceberg::table::Table;
use iceberg::transaction::{ApplyTransactionAction, Transaction};
use iceberg::Catalog;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::writer::DataFileFanout;
use super::{AppendError, AppendSummary, CatalogAppender, CatalogDescriptor, TableName};
use crate::ingest::AccumulatedTable;

const TARGET_FILE_SIZE_PROPERTY: &str = "write.target-file-size-bytes";
const OBJECT_STORAGE_PROPERTY: &str = "write.object-storage.enabled";

#[derive(Debug)]
enum CatalogSource {
    /// Loaded per append, so each run sees fresh catalog credentials.
    Descriptor(CatalogDescriptor),
    Loaded(Arc<dyn Catalog>),
}

/// Writes Parquet data files for a table and commits them with a fast append.
#[derive(Debug)]
pub struct IcebergAppender {
    source: CatalogSource,
    table: TableName,
    default_target_file_size: usize,
}

impl IcebergAppender {
    pub fn new(
        descriptor: CatalogDescriptor,
        table: TableName,
        default_target_file_size: usize,
    ) -> Self {
        Self {
            source: CatalogSource::Descriptor(descriptor),
            table,
            default_target_file_size,
        }
    }

    /// Use an already-built catalog client.
    pub fn with_catalog(
        catalog: Arc<dyn Catalog>,
        table: TableName,
        default_target_file_size: usize,
    ) -> Self {
        Self {
            source: CatalogSource::Loaded(catalog),
            table,
            default_target_file_size,
        }
    }

    async fn catalog(&self) -> Result<Arc<dyn Catalog>, AppendError> {
        match &self.source {
            CatalogSource::Descriptor(descriptor) => descriptor.load().await,
            CatalogSource::Loaded(catalog) => Ok(catalog.clone()),
        }
    }

    fn target_file_size(&self, table: &Table) -> usize {
        table
            .metadata()
            .properties()
            .get(TARGET_FILE_SIZE_PROPERTY)
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|size| *size > 0)
            .unwrap_or(self.default_target_file_size)
    }
}

#[async_trait]
impl CatalogAppender for IcebergAppender {
    fn target(&self) -> &TableName {
        &self.table
    }

    #[tracing::instrument(
        name = "iceberg_append",
        skip(self, data, abort),
        fields(iceload.table = %self.table, iceload.rows = data.num_rows())
    )]
    async fn append(
        &self,
        data: &AccumulatedTable,
        abort: &CancellationToken,
    ) -> Result<AppendSummary, AppendError> {
        let catalog = self.catalog().await?;
        let ident = self.table.to_ident()?;

        let table = catalog
            .load_table(&ident)
            .await
            .map_err(|e| AppendError::TableLoad(format!("{}: {}", self.table, e)))?;

        let object_storage = table
            .metadata()
            .properties()
            .get(OBJECT_STORAGE_PROPERTY)
            .map(String::as_str)
            .unwrap_or("(not set)");
        info!(
            table = %self.table,
            location = %table.metadata().location(),
            object_storage_enabled = %object_storage,
            "Target table loaded"
        );

        let table_schema = Arc::new(
            schema_to_arrow_schema(table.metadata().current_schema())
                .map_err(|e| AppendError::SchemaMismatch(e.to_string()))?,
        );
        check_columns(data.schema().fields(), &table_schema)?;

        // Batches cross the arrow version boundary one at a time; each bridged
        // copy is dropped once its rows are in a data file.
        let mut fanout = DataFileFanout::new(&table, self.target_file_size(&table))?;
        for batch in data.batches() {
            if abort.is_cancelled() {
                return Err(AppendError::Aborted);
            }
            let bridged = to_iceberg_arrow(batch)?;
            fanout.write(rebind(bridged, &table_schema)?).await?;
        }
        let data_files = fanout.finish().await?;
        let file_count = data_files.len();
        debug!(data_files = file_count, "Data files written");

        if abort.is_cancelled() {
            return Err(AppendError::Aborted);
        }
        // Past this point the commit runs to completion; its result is the run's result.
        let table = without_commit_retries(table)?;
        let tx = Transaction::new(&table);
        let action = tx.fast_append().add_data_files(data_files);
        let tx = action
            .apply(tx)
            .map_err(|e| AppendError::Commit(e.to_string()))?;
        let committed = tx
            .commit(catalog.as_ref())
            .await
            .map_err(|e| AppendError::Commit(e.to_string()))?;

        let snapshot_id = committed
            .metadata()
            .current_snapshot()
            .map(|s| s.snapshot_id());

        info!(
            table = %self.table,
            rows = data.num_rows(),
            data_files = file_count,
            snapshot_id = ?snapshot_id,
            "Append committed"
        );

        Ok(AppendSummary {
            rows: data.num_rows(),
            data_files: file_count,
            snapshot_id,
        })
    }
}

/// Pin `commit.retry.num-retries` to zero on the in-memory table handle so a
/// rejected commit fails the run instead of being retried.
fn without_commit_retries(table: Table) -> Result<Table, AppendError> {
    let metadata = table
        .metadata()
        .clone()
        .into_builder(None)
        .set_properties(HashMap::from([(
            PROPERTY_COMMIT_NUM_RETRIES.to_string(),
            "0".to_string(),
        )]))
        .and_then(|builder| builder.build())
        .map_err(|e| AppendError::Commit(e.to_string()))?
        .metadata;

    let mut builder = Table::builder()
        .file_io(table.file_io().clone())
        .metadata(metadata)
        .identifier(table.identifier().clone());
    if let Some(location) = table.metadata_location() {
        builder = builder.metadata_location(location);
    }
    builder
        .build()
        .map_err(|e| AppendError::Commit(e.to_string()))
}

/// Convert one engine batch (arrow 56) to the arrow version iceberg writes
/// (arrow 55) using IPC serialization as a bridge between arrow versions.
fn to_iceberg_arrow(batch: &RecordBatch) -> Result<arrow55_array::RecordBatch, AppendError> {
    use arrow55_ipc::reader::StreamReader as Arrow55StreamReader;
    use datafusion::arrow::ipc::writer::StreamWriter as DatafusionStreamWriter;

    let mut buffer = Vec::new();
    {
        let mut stream_writer = DatafusionStreamWriter::try_new(&mut buffer, batch.schema().as_ref())
            .map_err(|e| AppendError::Conversion(format!("IPC write error: {}", e)))?;
        stream_writer
            .write(batch)
            .map_err(|e| AppendError::Conversion(format!("IPC write error: {}", e)))?;
        stream_writer
            .finish()
            .map_err(|e| AppendError::Conversion(format!("IPC finish error: {}", e)))?;
    }

    let cursor = std::io::Cursor::new(buffer);
    let mut stream_reader = Arrow55StreamReader::try_new(cursor, None)
        .map_err(|e| AppendError::Conversion(format!("IPC read error: {}", e)))?;

    stream_reader
        .next()
        .ok_or_else(|| AppendError::Conversion("Empty IPC stream".to_string()))?
        .map_err(|e| AppendError::Conversion(format!("IPC read error: {}", e)))
}

/// Columns are matched by position and must carry the table's names.
fn check_columns(
    extracted: &datafusion::arrow::datatypes::Fields,
    table_schema: &arrow_schema_55::Schema,
) -> Result<(), AppendError> {
    let actual: Vec<&str> = extracted.iter().map(|f| f.name().as_str()).collect();
    let expected: Vec<&str> = table_schema.fields().iter().map(|f| f.name().as_str()).collect();
    if actual != expected {
        return Err(AppendError::SchemaMismatch(format!(
            "extracted columns {:?} do not match table columns {:?}",
            actual, expected
        )));
    }
    Ok(())
}

/// Attach the table's Arrow schema (with Iceberg field ids) to a bridged batch.
fn rebind(
    batch: arrow55_array::RecordBatch,
    table_schema: &Arc<arrow_schema_55::Schema>,
) -> Result<arrow55_array::RecordBatch, AppendError> {
    arrow55_array::RecordBatch::try_new(table_schema.clone(), batch.columns().to_vec())
        .map_err(|e| AppendError::SchemaMismatch(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{ArrayRef, Int64Array, StringArray};
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use iceberg::spec::{NestedField, PrimitiveType, Type};

    fn batch(ids: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let names: Vec<Option<String>> = ids.iter().map(|i| Some(format!("row-{}", i))).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)) as ArrayRef,
                Arc::new(StringArray::from(names)) as ArrayRef,
            ],
        )
        .unwrap()
    }

    fn table_schema() -> Arc<arrow_schema_55::Schema> {
        let schema = iceberg::spec::Schema::builder()
            .with_fields(vec![
                NestedField::required(1, "id", Type::Primitive(PrimitiveType::Long)).into(),
                NestedField::optional(2, "name", Type::Primitive(PrimitiveType::String)).into(),
            ])
            .build()
            .unwrap();
        Arc::new(schema_to_arrow_schema(&schema).unwrap())
    }

    #[test]
    fn test_bridge_preserves_rows_and_names() {
        let converted = to_iceberg_arrow(&batch(vec![1, 2, 3])).unwrap();

        assert_eq!(converted.num_rows(), 3);
        assert_eq!(converted.schema().field(1).name(), "name");
    }

    #[test]
    fn test_rebind_attaches_field_ids() {
        let schema = table_schema();
        let bound = rebind(to_iceberg_arrow(&batch(vec![1, 2])).unwrap(), &schema).unwrap();

        assert_eq!(bound.schema(), schema);
        assert!(bound
            .schema()
            .field(0)
            .metadata()
            .contains_key("PARQUET:field_id"));
    }

    #[test]
    fn test_check_columns_rejects_renamed_column() {
        let extracted = batch(vec![1]).schema().fields().clone();
        assert!(check_columns(&extracted, &table_schema()).is_ok());

        let renamed = Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("label", DataType::Utf8, true),
        ]);
        let err = check_columns(renamed.fields(), &table_schema()).unwrap_err();
        assert!(matches!(err, AppendError::SchemaMismatch(_)));
    }
}
