//! Database schema definitions for SQLx.
//!
//! This module contains the row type of the persisted job table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Represents a job record in the `jobs` table
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for the job, assigned in insertion order
    pub id: i64,
    /// Label identifying which handler logic applies
    pub task: String,
    /// JSON data containing the job payload
    #[sqlx(json)]
    pub data: Value,
    /// Priority of the job (0 = most important)
    pub priority: u32,
    /// Number of failed processing attempts
    pub attempts: u32,
    /// Timestamp when the job was created
    pub stamp: DateTime<Utc>,
}

impl Job {
    /// Deserialize the payload into a concrete type.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}
