//! # Repository Module
//!
//! Database repository implementations for Batiplan.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  EstimateService                                                        │
//! │       │                                                                 │
//! │       │  db.estimates().load(id)                                        │
//! │       ▼                                                                 │
//! │  EstimateRepository                 ProjectRepository                   │
//! │  ├── load(&self, id)                ├── create_project_from_preview()   │
//! │  ├── save(&self, &mut dqe)          ├── get_project(&self, id)          │
//! │  ├── list(&self, status)            └── get_stages(&self, project_id)   │
//! │  └── statistics(&self)                                                  │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each repository also exposes `pub(crate)` functions over a bare
//! `SqliteConnection` so the service can chain them in one transaction.
//!
//! ## Available Repositories
//!
//! - [`EstimateRepository`] - DQE trees, lists and statistics
//! - [`ProjectRepository`] - Projects and stages

pub mod estimate;
pub mod project;

pub use estimate::EstimateRepository;
pub use project::ProjectRepository;
