//! Result cursor handed to the caller of a reduce query.

use std::pin::Pin;
use std::task::{Context, Poll};

use arrow::array::{Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use tsq_common::{Result, TsqError};

/// Lazily produced, non-restartable sequence of result batches.
///
/// The cursor owns whatever the producing attempt still holds (participant
/// pages, engine session); dropping it releases them and cancels any
/// participant that has not been fully drained.
pub struct QueryCursor {
    schema: SchemaRef,
    inner: BoxStream<'static, Result<RecordBatch>>,
}

impl QueryCursor {
    pub fn new<S>(schema: SchemaRef, inner: S) -> Self
    where
        S: Stream<Item = Result<RecordBatch>> + Send + 'static,
    {
        Self {
            schema,
            inner: inner.boxed(),
        }
    }

    /// Cursor over batches that are already materialized.
    pub fn from_batches(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self::new(schema, futures::stream::iter(batches.into_iter().map(Ok)))
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Drain the remaining batches.
    pub async fn collect_batches(self) -> Result<Vec<RecordBatch>> {
        self.inner.try_collect().await
    }
}

impl Stream for QueryCursor {
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for QueryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCursor")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Single `PLAN` column of explain output.
pub fn plan_schema() -> SchemaRef {
    std::sync::Arc::new(Schema::new(vec![Field::new("PLAN", DataType::Utf8, false)]))
}

pub fn plan_batch(plans: Vec<String>) -> Result<RecordBatch> {
    RecordBatch::try_new(
        plan_schema(),
        vec![std::sync::Arc::new(StringArray::from(plans))],
    )
    .map_err(|e| TsqError::Engine(format!("failed to build plan rows: {e}")))
}

/// First value of the first column, as text.
pub fn first_text(batches: &[RecordBatch]) -> Option<String> {
    let batch = batches.iter().find(|b| b.num_rows() > 0)?;
    let col = batch.column(0).as_any().downcast_ref::<StringArray>()?;
    col.is_valid(0).then(|| col.value(0).to_string())
}
