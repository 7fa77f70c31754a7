//! Parquet encodings of checkpoints and year artifacts.
//!
//! Checkpoints keep the raw extracted text of every field (null when the
//! element was absent) so coercion happens once, when the artifact is built.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use efile_core::{
    officer_column, FieldType, ParsedRecord, RawValue, SchemaField, SchemaTable, TypedValue,
    OFFICER_SLOTS,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use tracing::warn;

pub const GROUP_COLUMN: &str = "group";

pub fn checkpoint_schema(schema: &SchemaTable) -> SchemaRef {
    let mut fields: Vec<ArrowField> = schema
        .fields()
        .iter()
        .map(|field| ArrowField::new(&field.name, DataType::Utf8, true))
        .collect();
    fields.extend(officer_fields());
    Arc::new(Schema::new(fields))
}

pub fn artifact_schema(schema: &SchemaTable) -> SchemaRef {
    let mut fields: Vec<ArrowField> = schema
        .fields()
        .iter()
        .map(|field| ArrowField::new(&field.name, arrow_type(field.field_type), false))
        .collect();
    fields.extend(officer_fields());
    fields.push(ArrowField::new(GROUP_COLUMN, DataType::UInt32, false));
    Arc::new(Schema::new(fields))
}

fn officer_fields() -> impl Iterator<Item = ArrowField> {
    (0..OFFICER_SLOTS).map(|slot| ArrowField::new(officer_column(slot), DataType::Int64, false))
}

fn arrow_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::Int => DataType::Int64,
        FieldType::Float => DataType::Float64,
        FieldType::Str => DataType::Utf8,
        FieldType::Bool => DataType::Boolean,
    }
}

/// Write one group's records, in entry order, to `path`.
pub fn write_checkpoint(path: &Path, schema: &SchemaTable, records: &[ParsedRecord]) -> Result<()> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len() + OFFICER_SLOTS);
    for field in schema.fields() {
        let values = records
            .iter()
            .map(|record| record.get(&field.name).and_then(RawValue::as_text))
            .collect::<Vec<_>>();
        columns.push(Arc::new(StringArray::from(values)));
    }
    for slot in 0..OFFICER_SLOTS {
        let amounts = records
            .iter()
            .map(|record| record.officer_compensation[slot])
            .collect::<Vec<_>>();
        columns.push(Arc::new(Int64Array::from(amounts)));
    }

    let batch = RecordBatch::try_new(checkpoint_schema(schema), columns)
        .context("building checkpoint record batch")?;
    let mut writer = ParquetSink::create(path, batch.schema())?;
    writer.write(&batch)?;
    writer.close()
}

pub fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("parquet reader init failed for {}", path.display()))?
        .build()
        .with_context(|| format!("parquet reader build failed for {}", path.display()))?;

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.with_context(|| format!("reading batch from {}", path.display()))?);
    }
    Ok(batches)
}

/// Row count from the parquet footer, without decoding any pages.
pub fn row_count(path: &Path) -> Result<usize> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet footer of {}", path.display()))?;
    let rows = builder.metadata().file_metadata().num_rows();
    usize::try_from(rows).with_context(|| format!("negative row count in {}", path.display()))
}

/// Coerce one checkpoint batch into the typed artifact layout.
pub fn typed_batch(
    schema: &SchemaTable,
    artifact: SchemaRef,
    checkpoint: &RecordBatch,
    ordinal: u32,
) -> Result<RecordBatch> {
    let rows = checkpoint.num_rows();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(artifact.fields().len());
    for field in schema.fields() {
        let raw = checkpoint_column::<StringArray>(checkpoint, &field.name)?;
        columns.push(typed_column(field, raw, ordinal));
    }
    for slot in 0..OFFICER_SLOTS {
        let amounts = checkpoint_column::<Int64Array>(checkpoint, &officer_column(slot))?;
        columns.push(Arc::new(amounts.clone()));
    }
    columns.push(Arc::new(UInt32Array::from(vec![ordinal; rows])));

    RecordBatch::try_new(artifact, columns)
        .with_context(|| format!("building artifact batch for group {ordinal}"))
}

fn checkpoint_column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("checkpoint has no `{name}` column"))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("checkpoint column `{name}` has an unexpected type"))
}

fn typed_column(field: &SchemaField, raw: &StringArray, ordinal: u32) -> ArrayRef {
    let values = (0..raw.len()).map(|row| {
        let value = if raw.is_null(row) {
            RawValue::Absent
        } else {
            RawValue::Text(raw.value(row).to_string())
        };
        field.field_type.coerce(&value).unwrap_or_else(|err| {
            warn!(group = ordinal, row, field = %field.name, error = %err, "using type default");
            field.field_type.default_value()
        })
    });

    match field.field_type {
        FieldType::Int => Arc::new(Int64Array::from_iter_values(values.map(|v| match v {
            TypedValue::Int(n) => n,
            _ => 0,
        }))),
        FieldType::Float => Arc::new(Float64Array::from_iter_values(values.map(|v| match v {
            TypedValue::Float(n) => n,
            _ => 0.0,
        }))),
        FieldType::Str => Arc::new(StringArray::from_iter_values(values.map(|v| match v {
            TypedValue::Str(s) => s,
            _ => String::from("0"),
        }))),
        FieldType::Bool => Arc::new(BooleanArray::from(
            values
                .map(|v| matches!(v, TypedValue::Bool(true)))
                .collect::<Vec<_>>(),
        )),
    }
}

/// Thin wrapper over [`ArrowWriter`] with path-bearing error context.
pub struct ParquetSink {
    path: String,
    writer: ArrowWriter<File>,
}

impl ParquetSink {
    pub fn create(path: &Path, schema: SchemaRef) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let writer = ArrowWriter::try_new(file, schema, None)
            .with_context(|| format!("opening parquet writer {}", path.display()))?;
        Ok(Self {
            path: path.display().to_string(),
            writer,
        })
    }

    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        self.writer
            .write(batch)
            .with_context(|| format!("writing record batch {}", self.path))
    }

    pub fn close(self) -> Result<()> {
        self.writer
            .close()
            .with_context(|| format!("closing parquet writer {}", self.path))?;
        Ok(())
    }
}
