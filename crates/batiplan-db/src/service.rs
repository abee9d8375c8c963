//! # Estimate Service
//!
//! The operations the UI/API collaborator calls. Each one is a full
//! read-modify-write cycle over the database, with the rules of
//! batiplan-core applied in between.
//!
//! ## Conversion Transaction
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    convert_to_project(id, request)                      │
//! │                                                                         │
//! │  BEGIN                                                                  │
//! │    │                                                                    │
//! │    ├── lock_for_update(id)      ← second caller waits here              │
//! │    ├── load_in(id)              ← sees the first caller's commit        │
//! │    ├── get_conversion_preview   ← AlreadyConverted / NotConvertible     │
//! │    ├── insert project + stages                                          │
//! │    └── record conversion fields (WHERE is_converted = 0)                │
//! │    │                                                                    │
//! │  COMMIT  (any error above: ROLLBACK, nothing written)                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use batiplan_core::conversion::{self, DurationAdjustment};
use batiplan_core::debourse::{
    self, DebourseLineUpdate, DqeMarginSummary, ItemCostReport, NewDebourseLine,
};
use batiplan_core::hierarchy::NewDqe;
use batiplan_core::{
    ConversionEligibility, ConversionPreview, ConversionRequest, ConversionStatus, CoreResult, Dqe,
    DqeStatus, TaxRate,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::DbResult;
use crate::pool::Database;
use crate::repository::estimate::{self, DqeStatistics, DqeSummary};
use crate::repository::project::{self, Project, Stage};

/// Result of a successful conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionOutcome {
    #[serde(rename = "projetId")]
    pub project_id: String,
    #[serde(rename = "projet")]
    pub project: Project,
    #[serde(rename = "etapes")]
    pub stages: Vec<Stage>,
    /// Durations the allocator changed, as shown in the preview.
    #[serde(rename = "ajustements")]
    pub adjustments: Vec<DurationAdjustment>,
}

/// Service over the DQE and project repositories.
#[derive(Debug, Clone)]
pub struct EstimateService {
    db: Database,
    default_vat_rate: TaxRate,
}

impl EstimateService {
    pub fn new(db: Database, default_vat_rate: TaxRate) -> Self {
        EstimateService {
            db,
            default_vat_rate,
        }
    }

    pub fn from_config(db: Database, config: &AppConfig) -> Self {
        Self::new(db, config.default_vat_rate)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // -------------------------------------------------------------------------
    // DQE
    // -------------------------------------------------------------------------

    /// Creates and stores a new draft DQE.
    ///
    /// A missing VAT rate takes the configured default.
    pub async fn create_dqe(&self, mut input: NewDqe) -> DbResult<Dqe> {
        input.vat_rate = input.vat_rate.or(Some(self.default_vat_rate));
        let mut dqe = Dqe::new(input, Utc::now())?;
        self.db.estimates().save(&mut dqe).await?;
        info!(dqe_id = %dqe.id(), reference = %dqe.header().reference, "DQE created");
        Ok(dqe)
    }

    pub async fn load_dqe_with_hierarchy(&self, id: &str) -> DbResult<Dqe> {
        self.db.estimates().load(id).await
    }

    /// Stores `dqe`, failing with `VersionConflict` if it is stale.
    ///
    /// The stored status decides what may change: a converted DQE is never
    /// overwritten and a frozen structure must come back unchanged.
    pub async fn save_dqe(&self, dqe: &mut Dqe) -> DbResult<()> {
        self.db.estimates().save(dqe).await
    }

    /// Loads a DQE, applies `change` and saves the result.
    ///
    /// Nothing is written when `change` fails. Concurrent edits of the same
    /// DQE are caught by the version check on save.
    pub async fn edit<T, F>(&self, id: &str, change: F) -> DbResult<(Dqe, T)>
    where
        F: FnOnce(&mut Dqe) -> CoreResult<T>,
    {
        let repo = self.db.estimates();
        let mut dqe = repo.load(id).await?;
        let output = change(&mut dqe)?;
        dqe.touch(Utc::now());
        repo.save(&mut dqe).await?;
        Ok((dqe, output))
    }

    /// Recomputed copy of a stored DQE. Fails on an incomplete tree.
    pub async fn recompute_totals(&self, id: &str) -> DbResult<Dqe> {
        let dqe = self.db.estimates().load(id).await?;
        Ok(batiplan_core::recompute_totals(&dqe)?)
    }

    pub async fn delete_dqe(&self, id: &str) -> DbResult<()> {
        self.db.estimates().delete(id).await
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub async fn validate_dqe(&self, id: &str, validator_id: &str) -> DbResult<Dqe> {
        let (dqe, ()) = self
            .edit(id, |dqe| dqe.validate(validator_id, Utc::now()))
            .await?;
        info!(
            dqe_id = %dqe.id(),
            validated_by = %validator_id,
            total_ht = dqe.total_ht().units(),
            "DQE validated"
        );
        Ok(dqe)
    }

    pub async fn start_progress(&self, id: &str) -> DbResult<Dqe> {
        Ok(self.edit(id, |dqe| dqe.start_progress(Utc::now())).await?.0)
    }

    pub async fn refuse_dqe(&self, id: &str) -> DbResult<Dqe> {
        let (dqe, ()) = self.edit(id, |dqe| dqe.refuse(Utc::now())).await?;
        info!(dqe_id = %dqe.id(), "DQE refused");
        Ok(dqe)
    }

    pub async fn archive_dqe(&self, id: &str) -> DbResult<Dqe> {
        let (dqe, ()) = self.edit(id, |dqe| dqe.archive(Utc::now())).await?;
        info!(dqe_id = %dqe.id(), "DQE archived");
        Ok(dqe)
    }

    // -------------------------------------------------------------------------
    // Déboursé
    // -------------------------------------------------------------------------

    pub async fn create_line(&self, item_id: &str, input: NewDebourseLine) -> DbResult<ItemCostReport> {
        let dqe_id = self.db.estimates().find_dqe_id_for_item(item_id).await?;
        let (dqe, _) = self
            .edit(&dqe_id, |dqe| dqe.create_debourse_line(item_id, input))
            .await?;
        Ok(debourse::item_cost_report(&dqe, item_id)?)
    }

    pub async fn update_line(
        &self,
        item_id: &str,
        line_id: &str,
        update: DebourseLineUpdate,
    ) -> DbResult<ItemCostReport> {
        let dqe_id = self.db.estimates().find_dqe_id_for_item(item_id).await?;
        let (dqe, ()) = self
            .edit(&dqe_id, |dqe| dqe.update_debourse_line(item_id, line_id, update))
            .await?;
        Ok(debourse::item_cost_report(&dqe, item_id)?)
    }

    pub async fn delete_line(&self, item_id: &str, line_id: &str) -> DbResult<ItemCostReport> {
        let dqe_id = self.db.estimates().find_dqe_id_for_item(item_id).await?;
        let (dqe, ()) = self
            .edit(&dqe_id, |dqe| dqe.delete_debourse_line(item_id, line_id))
            .await?;
        Ok(debourse::item_cost_report(&dqe, item_id)?)
    }

    pub async fn item_cost_report(&self, item_id: &str) -> DbResult<ItemCostReport> {
        let dqe_id = self.db.estimates().find_dqe_id_for_item(item_id).await?;
        let dqe = self.db.estimates().load(&dqe_id).await?;
        Ok(debourse::item_cost_report(&dqe, item_id)?)
    }

    pub async fn margin_summary(&self, id: &str) -> DbResult<DqeMarginSummary> {
        let dqe = self.db.estimates().load(id).await?;
        Ok(debourse::dqe_margin_summary(&dqe))
    }

    // -------------------------------------------------------------------------
    // Conversion
    // -------------------------------------------------------------------------

    pub async fn can_convert(&self, id: &str) -> DbResult<ConversionEligibility> {
        let dqe = self.db.estimates().load(id).await?;
        Ok(conversion::can_convert(&dqe))
    }

    pub async fn conversion_status(&self, id: &str) -> DbResult<ConversionStatus> {
        let dqe = self.db.estimates().load(id).await?;
        Ok(conversion::conversion_status(&dqe))
    }

    /// Preview of the project a conversion would create. Writes nothing.
    pub async fn get_conversion_preview(
        &self,
        id: &str,
        request: &ConversionRequest,
    ) -> DbResult<ConversionPreview> {
        let dqe = self.db.estimates().load(id).await?;
        Ok(conversion::get_conversion_preview(&dqe, request)?)
    }

    /// Converts a validated DQE into a project, atomically.
    ///
    /// Of two concurrent calls on the same DQE exactly one succeeds; the
    /// other fails with `AlreadyConverted` and creates nothing.
    pub async fn convert_to_project(
        &self,
        id: &str,
        request: &ConversionRequest,
        converted_by: &str,
    ) -> DbResult<ConversionOutcome> {
        let mut tx = self.db.pool().begin().await?;

        estimate::lock_for_update(&mut tx, id).await?;
        let mut dqe = estimate::load_in(&mut tx, id).await?;

        let preview = match conversion::get_conversion_preview(&dqe, request) {
            Ok(preview) => preview,
            Err(err) => {
                warn!(dqe_id = %id, error = %err, "Conversion rejected");
                return Err(err.into());
            }
        };

        let now = Utc::now();
        let project_id = Uuid::new_v4().to_string();
        dqe.mark_converted(&project_id, converted_by, now)?;

        let (project, stages) =
            project::insert_from_preview(&mut tx, &project_id, &preview, converted_by, now).await?;
        estimate::record_conversion(&mut tx, &dqe).await?;

        tx.commit().await?;

        info!(
            dqe_id = %id,
            project_id = %project_id,
            stages = stages.len(),
            adjustments = preview.adjustments.len(),
            "DQE converted to project"
        );

        Ok(ConversionOutcome {
            project_id,
            project,
            stages,
            adjustments: preview.adjustments,
        })
    }

    // -------------------------------------------------------------------------
    // Lists
    // -------------------------------------------------------------------------

    pub async fn list_dqes(&self, status: Option<DqeStatus>) -> DbResult<Vec<DqeSummary>> {
        self.db.estimates().list(status).await
    }

    pub async fn statistics(&self) -> DbResult<DqeStatistics> {
        self.db.estimates().statistics().await
    }

    pub async fn get_project(&self, project_id: &str) -> DbResult<Project> {
        self.db.projects().get_project(project_id).await
    }

    pub async fn get_stages(&self, project_id: &str) -> DbResult<Vec<Stage>> {
        self.db.projects().get_stages(project_id).await
    }
}
