//! # batiplan-db: Database Layer for Batiplan
//!
//! This crate persists DQEs and the projects created from them, on SQLite
//! with sqlx, and exposes the service the UI/API collaborator calls.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Batiplan Data Flow                               │
//! │                                                                         │
//! │  UI / API collaborator (validate, convert, edit déboursé)               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   batiplan-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │ EstimateServ. │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │ (service.rs)  │───►│ (estimate.rs) │    │  (embedded)  │  │   │
//! │  │   │               │    │ (project.rs)  │    │              │  │   │
//! │  │   │ load → core   │    │               │    │ 001_init.sql │  │   │
//! │  │   │ rules → save  │    │ SqlitePool    │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   BATIPLAN_DATABASE_PATH (default ./batiplan.db)                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - Environment configuration
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - DQE and project repositories
//! - [`service`] - Read-modify-write operations and the atomic conversion
//!
//! ## Usage
//!
//! ```rust,ignore
//! use batiplan_db::{AppConfig, Database, EstimateService};
//!
//! let config = AppConfig::from_env()?;
//! let db = Database::new(config.db_config()).await?;
//! let service = EstimateService::from_config(db, &config);
//!
//! let preview = service.get_conversion_preview(&dqe_id, &request).await?;
//! let outcome = service.convert_to_project(&dqe_id, &request, "user-1").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod service;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{AppConfig, ConfigError};
pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use service::{ConversionOutcome, EstimateService};

// Repository re-exports for convenience
pub use repository::estimate::{DqeStatistics, DqeSummary, EstimateRepository, StatusCount};
pub use repository::project::{Project, ProjectRepository, Stage};
