//! Folds streamed batches into one owned, chunked table.

use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;

/// Result of extracting one partition.
#[derive(Debug)]
pub enum Extraction {
    /// Nothing matched or every batch was empty. Not an error.
    NoData,
    /// At least one row was extracted.
    Rows(AccumulatedTable),
}

impl Extraction {
    pub fn num_rows(&self) -> usize {
        match self {
            Extraction::NoData => 0,
            Extraction::Rows(table) => table.num_rows(),
        }
    }
}

/// All batches of a run, sharing one schema.
///
/// Batches are kept as separate chunks; their column buffers are shared,
/// not copied. Dropping the table releases every batch.
#[derive(Debug, Clone)]
pub struct AccumulatedTable {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    num_rows: usize,
}

impl AccumulatedTable {
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }
}

/// Collects owned batches handed over by an ingest stream.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    schema: Option<SchemaRef>,
    batches: Vec<RecordBatch>,
    num_rows: usize,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a batch. Zero-row batches are dropped on the spot.
    pub fn push(&mut self, batch: RecordBatch) {
        if batch.num_rows() == 0 {
            return;
        }

        match &self.schema {
            Some(schema) => debug_assert_eq!(
                schema.fields(),
                batch.schema().fields(),
                "extraction query produced batches with differing schemas"
            ),
            None => self.schema = Some(batch.schema()),
        }

        self.num_rows += batch.num_rows();
        self.batches.push(batch);
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn finish(self) -> Extraction {
        match self.schema {
            Some(schema) if self.num_rows > 0 => Extraction::Rows(AccumulatedTable {
                schema,
                batches: self.batches,
                num_rows: self.num_rows,
            }),
            _ => Extraction::NoData,
        }
    }
}
