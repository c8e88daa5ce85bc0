//! Embedded relational engine seam and the scratch merge tables hosted in it.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use tsq_common::{Result, TsqError};

use crate::merge::MergeStore;
use crate::query::SqlFragment;

pub type BatchIter = Box<dyn Iterator<Item = Result<RecordBatch>> + Send>;

/// Result of a statement run on the local engine.
pub struct EngineRows {
    pub schema: SchemaRef,
    pub batches: BatchIter,
}

impl std::fmt::Debug for EngineRows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRows")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Embedded engine used for the reduce step.
pub trait LocalEngine: Send + Sync {
    /// Create a scratch table whose rows are supplied by a bound [`MergeStore`].
    fn create_merge_table(&self, name: &str) -> Result<()>;
    /// Open a session scoped to one attempt; closed on drop.
    fn connect(&self, space: &str) -> Result<Box<dyn EngineConnection>>;
}

/// Per-attempt engine session. Merge table bindings are visible to this
/// session only.
pub trait EngineConnection: Send {
    /// Point scratch table `name` at `store`, or clear it with `None`.
    fn bind_merge_table(&mut self, name: &str, store: Option<Arc<MergeStore>>) -> Result<()>;
    fn query(&mut self, statement: &SqlFragment) -> Result<EngineRows>;
}

/// Scratch table name for positional slot `idx`.
pub fn merge_table_name(idx: usize) -> String {
    format!("__T{idx}")
}

/// Scratch tables created so far, reused by every later query.
#[derive(Debug, Default)]
pub struct ScratchTables {
    slots: RwLock<Vec<String>>,
    create: Mutex<()>,
}

impl ScratchTables {
    /// Name of slot `idx`, creating it (and any lower missing slot) on first use.
    pub fn slot(&self, engine: &dyn LocalEngine, idx: usize) -> Result<String> {
        if let Some(name) = self.slots.read().get(idx) {
            return Ok(name.clone());
        }

        let _guard = self.create.lock();
        let created = self.slots.read().len();
        for missing in created..=idx {
            let name = merge_table_name(missing);
            engine.create_merge_table(&name)?;
            debug!(
                table = %name,
                operator = "ScratchTables",
                "created scratch merge table"
            );
            self.slots.write().push(name);
        }
        self.slots
            .read()
            .get(idx)
            .cloned()
            .ok_or_else(|| TsqError::Engine(format!("scratch slot {idx} was not created")))
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}
