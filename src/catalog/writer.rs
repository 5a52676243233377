//! Parquet data file writers, one open file per partition value.

use std::collections::HashMap;
use std::sync::Arc;

use arrow_array_55::{Array, ArrayRef, RecordBatch, StructArray, UInt32Array};
use arrow_schema_55::{DataType, Fields};
use arrow_select_55::take::take_record_batch;
use iceberg::arrow::{arrow_struct_to_literal, type_to_arrow_type};
use iceberg::spec::{
    DataFile, DataFileFormat, Literal, PartitionSpec, Schema, Struct, StructType, Type,
};
use iceberg::table::Table;
use iceberg::transform::{create_transform_function, BoxedTransformFunction};
use iceberg::writer::base_writer::data_file_writer::{DataFileWriter, DataFileWriterBuilder};
use iceberg::writer::file_writer::location_generator::{
    DefaultFileNameGenerator, DefaultLocationGenerator,
};
use iceberg::writer::file_writer::ParquetWriterBuilder;
use iceberg::writer::{IcebergWriter, IcebergWriterBuilder};
use parquet_55::file::properties::WriterProperties;
use tracing::debug;

use super::AppendError;

type FileBuilder = ParquetWriterBuilder<DefaultLocationGenerator, DefaultFileNameGenerator>;

struct OpenFile {
    writer: DataFileWriter<FileBuilder>,
    written: usize,
}

/// Writes batches bound to the table schema into data files for the table's
/// default partition spec. A partition's file is closed once the in-memory size
/// written to it reaches the target size; the next batch opens a fresh one.
pub(super) struct DataFileFanout {
    file_builder: FileBuilder,
    spec_id: i32,
    splitter: Option<PartitionSplitter>,
    target_size: usize,
    open: HashMap<Option<Struct>, OpenFile>,
    closed: Vec<DataFile>,
}

impl DataFileFanout {
    pub(super) fn new(table: &Table, target_size: usize) -> Result<Self, AppendError> {
        let metadata = table.metadata();
        let location_generator = DefaultLocationGenerator::new(metadata.clone())
            .map_err(|e| AppendError::Write(e.to_string()))?;
        let file_name_generator = DefaultFileNameGenerator::new(
            format!("iceload-{}", nanoid::nanoid!(8)),
            None,
            DataFileFormat::Parquet,
        );
        let file_builder = ParquetWriterBuilder::new(
            WriterProperties::default(),
            metadata.current_schema().clone(),
            table.file_io().clone(),
            location_generator,
            file_name_generator,
        );

        let spec = metadata.default_partition_spec();
        let splitter = if spec.is_unpartitioned() {
            None
        } else {
            Some(PartitionSplitter::new(spec, metadata.current_schema())?)
        };

        Ok(Self {
            file_builder,
            spec_id: metadata.default_partition_spec_id(),
            splitter,
            target_size,
            open: HashMap::new(),
            closed: Vec::new(),
        })
    }

    pub(super) async fn write(&mut self, batch: RecordBatch) -> Result<(), AppendError> {
        let parts = match &self.splitter {
            Some(splitter) => splitter
                .split(&batch)?
                .into_iter()
                .map(|(value, part)| (Some(value), part))
                .collect(),
            None => vec![(None, batch)],
        };

        for (partition, part) in parts {
            self.write_partition(partition, part).await?;
        }
        Ok(())
    }

    async fn write_partition(
        &mut self,
        partition: Option<Struct>,
        batch: RecordBatch,
    ) -> Result<(), AppendError> {
        let mut file = match self.open.remove(&partition) {
            Some(file) => file,
            None => OpenFile {
                writer: DataFileWriterBuilder::new(
                    self.file_builder.clone(),
                    partition.clone(),
                    self.spec_id,
                )
                .build()
                .await
                .map_err(|e| AppendError::Write(e.to_string()))?,
                written: 0,
            },
        };

        file.written += batch.get_array_memory_size();
        file.writer
            .write(batch)
            .await
            .map_err(|e| AppendError::Write(e.to_string()))?;

        if file.written >= self.target_size {
            self.close_file(file).await
        } else {
            self.open.insert(partition, file);
            Ok(())
        }
    }

    async fn close_file(&mut self, mut file: OpenFile) -> Result<(), AppendError> {
        let files = file
            .writer
            .close()
            .await
            .map_err(|e| AppendError::Write(e.to_string()))?;
        self.closed.extend(files);
        Ok(())
    }

    /// Close every open file and return all data files written.
    pub(super) async fn finish(mut self) -> Result<Vec<DataFile>, AppendError> {
        let open: Vec<OpenFile> = self.open.drain().map(|(_, file)| file).collect();
        for file in open {
            self.close_file(file).await?;
        }
        debug!(data_files = self.closed.len(), "Data files closed");
        Ok(self.closed)
    }
}

/// Computes partition values for each row and groups rows by value.
struct PartitionSplitter {
    /// Source column position and transform, one per partition field.
    sources: Vec<(usize, BoxedTransformFunction)>,
    partition_type: StructType,
    partition_fields: Fields,
}

impl PartitionSplitter {
    fn new(spec: &PartitionSpec, schema: &Schema) -> Result<Self, AppendError> {
        let partition_type = spec
            .partition_type(schema)
            .map_err(|e| AppendError::Unsupported(e.to_string()))?;
        let partition_fields = match type_to_arrow_type(&Type::Struct(partition_type.clone())) {
            Ok(DataType::Struct(fields)) => fields,
            Ok(other) => {
                return Err(AppendError::Unsupported(format!(
                    "partition type maps to {}",
                    other
                )))
            }
            Err(e) => return Err(AppendError::Unsupported(e.to_string())),
        };

        let columns = schema.as_struct().fields();
        let sources = spec
            .fields()
            .iter()
            .map(|field| {
                let position = columns
                    .iter()
                    .position(|column| column.id == field.source_id)
                    .ok_or_else(|| {
                        AppendError::Unsupported(format!(
                            "partition field '{}' is not sourced from a top-level column",
                            field.name
                        ))
                    })?;
                let transform = create_transform_function(&field.transform)
                    .map_err(|e| AppendError::Unsupported(e.to_string()))?;
                Ok((position, transform))
            })
            .collect::<Result<Vec<_>, AppendError>>()?;

        Ok(Self {
            sources,
            partition_type,
            partition_fields,
        })
    }

    /// Split a batch into one batch per distinct partition value, in order of
    /// first appearance.
    fn split(&self, batch: &RecordBatch) -> Result<Vec<(Struct, RecordBatch)>, AppendError> {
        let transformed = self
            .sources
            .iter()
            .map(|(position, transform)| transform.transform(batch.column(*position).clone()))
            .collect::<iceberg::Result<Vec<ArrayRef>>>()
            .map_err(|e| AppendError::Write(format!("partition transform: {}", e)))?;
        let values: ArrayRef = Arc::new(
            StructArray::try_new(self.partition_fields.clone(), transformed, None)
                .map_err(|e| AppendError::Write(format!("partition values: {}", e)))?,
        );
        let literals = arrow_struct_to_literal(&values, &self.partition_type)
            .map_err(|e| AppendError::Write(format!("partition values: {}", e)))?;

        let mut groups: Vec<(Struct, Vec<u32>)> = Vec::new();
        let mut slots: HashMap<Struct, usize> = HashMap::new();
        for (row, literal) in literals.into_iter().enumerate() {
            let Some(Literal::Struct(value)) = literal else {
                return Err(AppendError::Write(format!(
                    "row {} has no partition value",
                    row
                )));
            };
            let slot = match slots.get(&value) {
                Some(slot) => *slot,
                None => {
                    slots.insert(value.clone(), groups.len());
                    groups.push((value, Vec::new()));
                    groups.len() - 1
                }
            };
            groups[slot].1.push(row as u32);
        }

        if groups.len() == 1 {
            let (value, _) = groups.remove(0);
            return Ok(vec![(value, batch.clone())]);
        }

        groups
            .into_iter()
            .map(|(value, rows)| {
                let part = take_record_batch(batch, &UInt32Array::from(rows))
                    .map_err(|e| AppendError::Write(e.to_string()))?;
                Ok((value, part))
            })
            .collect()
    }
}
