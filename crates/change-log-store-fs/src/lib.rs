//! File-backed change log storage.
//!
//! - [`ChangeLogStore`]: per-character JSON logs with rotation, retention and
//!   atomic rewrites.
//! - [`ChangeLogQuery`]: filtering, search and causation reporting over
//!   stored entries.
//! - [`MaintenanceService`]: health checks and re-runnable sweeps.
//! - [`ErrorHandler`]: failure journal, retry policy and component health.
//! - [`ChangeLogService`]: the enrich-and-append write path.

mod atomic;
pub mod error_handler;
pub mod journal;
pub mod locator;
pub mod maintenance;
pub mod query;
pub mod service;
pub mod store;

pub use error_handler::{
    ComponentAlert, ComponentHealth, ErrorCategory, ErrorHandler, ErrorRecord, ErrorSeverity,
    ErrorStatistics,
};
pub use journal::{HealthJournal, HealthJournalFile, HealthOperation, HealthSummary};
pub use locator::{
    rotation_number, sanitize_name, LogFileInfo, LogFileKind, LogFileSet, LogLocator,
};
pub use maintenance::{
    DiskThresholds, FileSummary, HealthCheck, HealthStatus, MaintenanceReport, MaintenanceRun,
    MaintenanceService, MaintenanceSummary, StorageHealth, SweepResult, WrittenReport,
};
pub use query::{
    CascadeAnalysis, CauseCount, CausationReport, ChangeLogQuery, CleanupCriteria,
    CriteriaCleanupReport, FilterOperator, QueryFilter, QueryOptions, QueryResult, SortDirection,
    SortField,
};
pub use service::ChangeLogService;
pub use store::{
    AppendReceipt, ChangeLogStore, CharacterStatistics, CleanupReport, FileCheck, RotationOutcome,
};
