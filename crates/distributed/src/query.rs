//! Two-step query descriptor handed to the coordinator by the SQL splitter.

use std::collections::BTreeSet;

use arrow_schema::SchemaRef;
use serde::{Deserialize, Serialize};
use tsq_common::{Result, TsqError};

/// Scalar bound to a `?` placeholder of a query fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// SQL text plus bound parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<ParamValue>,
    /// Wire form of `params`, present once [`SqlFragment::marshal_params`] ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_bytes: Option<Vec<u8>>,
}

impl SqlFragment {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            params_bytes: None,
        }
    }

    pub fn with_params(mut self, params: Vec<ParamValue>) -> Self {
        self.params = params;
        self.params_bytes = None;
        self
    }

    /// Serialize parameters for delivery to a remote participant.
    pub fn marshal_params(&mut self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.params)
            .map_err(|e| TsqError::Codec(format!("parameter marshalling failed: {e}")))?;
        self.params_bytes = Some(bytes);
        Ok(())
    }

    /// Restore parameters from their marshalled form (remote side).
    pub fn unmarshal_params(&mut self) -> Result<()> {
        if let Some(bytes) = &self.params_bytes {
            self.params = serde_json::from_slice(bytes)
                .map_err(|e| TsqError::Codec(format!("parameter unmarshalling failed: {e}")))?;
        }
        Ok(())
    }

    pub fn is_marshalled(&self) -> bool {
        self.params.is_empty() || self.params_bytes.is_some()
    }

    /// Same fragment wrapped in an `EXPLAIN` statement.
    pub fn explain(&self) -> Self {
        Self {
            sql: format!("EXPLAIN {}", self.sql),
            params: self.params.clone(),
            params_bytes: None,
        }
    }
}

/// One map query: executed independently on every participant.
#[derive(Debug, Clone)]
pub struct MapQuery {
    pub fragment: SqlFragment,
    /// Columns the participant returns, in order. Used to shape the merge table.
    pub columns: SchemaRef,
}

/// Query already split into map queries plus one local reduce query.
#[derive(Debug, Clone)]
pub struct TwoStepQuery {
    pub map_queries: Vec<MapQuery>,
    pub reduce: SqlFragment,
    /// Rows per page; `0` selects the configured default.
    pub page_size: u32,
    pub explain: bool,
    /// Single map query whose rows are returned as-is, without a reduce step.
    pub skip_merge_table: bool,
    /// Every cache referenced by the query, including the main one.
    pub spaces: BTreeSet<String>,
}

impl TwoStepQuery {
    pub fn validate(&self) -> Result<()> {
        if self.map_queries.is_empty() {
            return Err(TsqError::InvalidConfig(
                "two-step query requires at least one map query".to_string(),
            ));
        }
        if self.skip_merge_table && !self.explain && self.map_queries.len() != 1 {
            return Err(TsqError::InvalidConfig(format!(
                "skip_merge_table requires exactly one map query, got {}",
                self.map_queries.len()
            )));
        }
        Ok(())
    }

    /// Whether rows bypass the local engine (explain always materializes).
    pub fn uses_pass_through(&self) -> bool {
        !self.explain && self.skip_merge_table
    }

    /// Caches referenced besides `main`, or empty when only `main` is used.
    pub fn extra_spaces(&self, main: &str) -> Vec<String> {
        self.spaces
            .iter()
            .filter(|s| s.as_str() != main)
            .cloned()
            .collect()
    }
}
