//! # Project Repository
//!
//! Projects and their stages, created from a conversion preview.
//!
//! ```text
//! ConversionPreview ──► projects (1 row) + project_stages (1 row per lot)
//! ```
//!
//! A project is written once and never edited here; scheduling changes belong
//! to the project tooling downstream.

use batiplan_core::{ConversionPreview, CoreError, DurationMethod, Money};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};

// =============================================================================
// Types
// =============================================================================

/// A scheduled project created from a DQE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub dqe_id: String,
    #[serde(rename = "nom")]
    pub name: String,
    pub description: Option<String>,
    pub client: Option<String>,
    #[serde(rename = "dateDebut")]
    pub start_date: NaiveDate,
    #[serde(rename = "dateFinPrevue")]
    pub planned_end_date: NaiveDate,
    #[serde(rename = "dureeTotaleJours")]
    pub total_duration_days: i64,
    #[serde(rename = "budgetInitial")]
    pub initial_budget: Money,
    #[serde(rename = "methodeCalculDurees")]
    pub duration_method: DurationMethod,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// One stage of a project, mapped from one lot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    pub project_id: String,
    pub lot_id: String,
    pub ordre: u32,
    #[serde(rename = "nom")]
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    #[serde(rename = "dateDebut")]
    pub start_date: NaiveDate,
    #[serde(rename = "dateFinPrevue")]
    pub planned_end_date: NaiveDate,
    #[serde(rename = "dureeJours")]
    pub duration_days: i64,
    #[serde(rename = "budgetPrevu")]
    pub planned_budget: Money,
    #[serde(rename = "pourcentageBudget")]
    pub budget_percentage: f64,
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    dqe_id: String,
    nom: String,
    description: Option<String>,
    client: Option<String>,
    date_debut: NaiveDate,
    date_fin_prevue: NaiveDate,
    duree_totale_jours: i64,
    budget_initial: i64,
    methode_calcul_durees: DurationMethod,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Project {
            id: row.id,
            dqe_id: row.dqe_id,
            name: row.nom,
            description: row.description,
            client: row.client,
            start_date: row.date_debut,
            planned_end_date: row.date_fin_prevue,
            total_duration_days: row.duree_totale_jours,
            initial_budget: Money::from_units(row.budget_initial),
            duration_method: row.methode_calcul_durees,
            created_by: row.created_by,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    id: String,
    project_id: String,
    lot_id: String,
    ordre: u32,
    nom: String,
    code: String,
    description: Option<String>,
    date_debut: NaiveDate,
    date_fin_prevue: NaiveDate,
    duree_jours: i64,
    budget_prevu: i64,
    pourcentage_budget: f64,
}

impl From<StageRow> for Stage {
    fn from(row: StageRow) -> Self {
        Stage {
            id: row.id,
            project_id: row.project_id,
            lot_id: row.lot_id,
            ordre: row.ordre,
            name: row.nom,
            code: row.code,
            description: row.description,
            start_date: row.date_debut,
            planned_end_date: row.date_fin_prevue,
            duration_days: row.duree_jours,
            planned_budget: Money::from_units(row.budget_prevu),
            budget_percentage: row.pourcentage_budget,
        }
    }
}

const PROJECT_COLUMNS: &str = "id, dqe_id, nom, description, client, date_debut, date_fin_prevue, \
     duree_totale_jours, budget_initial, methode_calcul_durees, created_by, created_at";

// =============================================================================
// Repository
// =============================================================================

/// Repository for project database operations.
#[derive(Debug, Clone)]
pub struct ProjectRepository {
    pool: SqlitePool,
}

impl ProjectRepository {
    /// Creates a new ProjectRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ProjectRepository { pool }
    }

    /// Creates a project and its stages from a preview, in one transaction.
    ///
    /// This does not touch the DQE; the conversion service pairs it with the
    /// conversion fields inside its own transaction.
    pub async fn create_project_from_preview(
        &self,
        preview: &ConversionPreview,
        created_by: &str,
    ) -> DbResult<(Project, Vec<Stage>)> {
        let project_id = uuid::Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;
        let created = insert_from_preview(&mut tx, &project_id, preview, created_by, Utc::now()).await?;
        tx.commit().await?;
        Ok(created)
    }

    /// Gets a project by ID.
    pub async fn get_project(&self, id: &str) -> DbResult<Project> {
        let row: Option<ProjectRow> =
            sqlx::query_as(&format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Project::from)
            .ok_or_else(|| DbError::not_found("Project", id))
    }

    /// The project created from a DQE, if it was converted.
    pub async fn get_project_by_dqe(&self, dqe_id: &str) -> DbResult<Option<Project>> {
        let row: Option<ProjectRow> =
            sqlx::query_as(&format!("SELECT {} FROM projects WHERE dqe_id = ?1", PROJECT_COLUMNS))
                .bind(dqe_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Project::from))
    }

    /// Stages of a project, in `ordre` order.
    pub async fn get_stages(&self, project_id: &str) -> DbResult<Vec<Stage>> {
        let rows: Vec<StageRow> = sqlx::query_as(
            r#"
            SELECT
                id, project_id, lot_id, ordre, nom, code, description,
                date_debut, date_fin_prevue, duree_jours, budget_prevu, pourcentage_budget
            FROM project_stages
            WHERE project_id = ?1
            ORDER BY ordre
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Stage::from).collect())
    }
}

// =============================================================================
// Connection-level operations (shared with the conversion transaction)
// =============================================================================

pub(crate) async fn insert_from_preview(
    conn: &mut SqliteConnection,
    project_id: &str,
    preview: &ConversionPreview,
    created_by: &str,
    now: DateTime<Utc>,
) -> DbResult<(Project, Vec<Stage>)> {
    let project = Project {
        id: project_id.to_string(),
        dqe_id: preview.dqe_id.clone(),
        name: preview.name.clone(),
        description: preview.description.clone(),
        client: preview.client.clone(),
        start_date: preview.start_date,
        planned_end_date: preview.planned_end_date,
        total_duration_days: preview.total_duration_days,
        initial_budget: preview.initial_budget,
        duration_method: preview.duration_method,
        created_by: created_by.to_string(),
        created_at: now,
    };

    debug!(project_id = %project.id, dqe_id = %project.dqe_id, "Inserting project");

    sqlx::query(&format!(
        "INSERT INTO projects ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        PROJECT_COLUMNS
    ))
    .bind(&project.id)
    .bind(&project.dqe_id)
    .bind(&project.name)
    .bind(&project.description)
    .bind(&project.client)
    .bind(project.start_date)
    .bind(project.planned_end_date)
    .bind(project.total_duration_days)
    .bind(project.initial_budget.units())
    .bind(project.duration_method)
    .bind(&project.created_by)
    .bind(project.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| match DbError::from(e) {
        // projects.dqe_id is unique: a project already exists for this DQE
        DbError::UniqueViolation { .. } => DbError::Domain(CoreError::AlreadyConverted {
            dqe_id: preview.dqe_id.clone(),
            project_id: None,
        }),
        other => other,
    })?;

    let mut stages = Vec::with_capacity(preview.stages.len());
    for planned in &preview.stages {
        let stage = Stage {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            lot_id: planned.lot_id.clone(),
            ordre: planned.ordre,
            name: planned.name.clone(),
            code: planned.code.clone(),
            description: planned.description.clone(),
            start_date: planned.start_date,
            planned_end_date: planned.planned_end_date,
            duration_days: planned.duration_days,
            planned_budget: planned.planned_budget,
            budget_percentage: planned.budget_percentage,
        };

        sqlx::query(
            r#"
            INSERT INTO project_stages (
                id, project_id, lot_id, ordre, nom, code, description,
                date_debut, date_fin_prevue, duree_jours, budget_prevu, pourcentage_budget
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&stage.id)
        .bind(&stage.project_id)
        .bind(&stage.lot_id)
        .bind(stage.ordre)
        .bind(&stage.name)
        .bind(&stage.code)
        .bind(&stage.description)
        .bind(stage.start_date)
        .bind(stage.planned_end_date)
        .bind(stage.duration_days)
        .bind(stage.planned_budget.units())
        .bind(stage.budget_percentage)
        .execute(&mut *conn)
        .await?;

        stages.push(stage);
    }

    Ok((project, stages))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use batiplan_core::hierarchy::{NewChapter, NewDqe, NewItem, NewLot};
    use batiplan_core::{get_conversion_preview, ConversionRequest, Dqe, Quantity};

    /// A validated DQE with two lots worth 700 000 and 300 000, saved.
    async fn saved_validated(db: &Database, reference: &str) -> Dqe {
        let mut dqe = Dqe::new(
            NewDqe {
                reference: reference.to_string(),
                name: "Entrepôt".to_string(),
                client: None,
                description: Some("Hangar de stockage".to_string()),
                vat_rate: None,
                created_by: "user-1".to_string(),
            },
            Utc::now(),
        )
        .unwrap();
        for (n, price) in [(1, 700_000), (2, 300_000)] {
            let lot = dqe
                .add_lot(NewLot {
                    code: format!("LOT{}", n),
                    name: format!("Lot {}", n),
                    description: None,
                    ordre: None,
                })
                .unwrap();
            let chapter = dqe
                .add_chapter(
                    &lot,
                    NewChapter {
                        code: format!("CH{}", n),
                        name: format!("Chapitre {}", n),
                        ordre: None,
                    },
                )
                .unwrap();
            dqe.add_item(
                &chapter,
                NewItem {
                    code: format!("P{}", n),
                    designation: format!("Poste {}", n),
                    unit: "ens".to_string(),
                    quantity: Quantity::from_units(1),
                    unit_price_ht: Money::from_units(price),
                    ordre: None,
                },
            )
            .unwrap();
        }
        dqe.validate("validator-1", Utc::now()).unwrap();
        db.estimates().save(&mut dqe).await.unwrap();
        dqe
    }

    fn request() -> ConversionRequest {
        ConversionRequest {
            start_date: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            total_duration_days: 30,
            duration_method: DurationMethod::Proportional,
            custom_durations: None,
            project_name: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let dqe = saved_validated(&db, "DQE-PRJ-1").await;
        let preview = get_conversion_preview(&dqe, &request()).unwrap();

        let (project, stages) = db
            .projects()
            .create_project_from_preview(&preview, "user-2")
            .await
            .unwrap();

        assert_eq!(project.initial_budget, Money::from_units(1_000_000));
        assert_eq!(stages.len(), 2);

        let fetched = db.projects().get_project(&project.id).await.unwrap();
        assert_eq!(fetched, project);
        let fetched_stages = db.projects().get_stages(&project.id).await.unwrap();
        assert_eq!(fetched_stages, stages);
        assert_eq!(fetched_stages[0].duration_days, 21);
        assert_eq!(fetched_stages[1].duration_days, 9);
        assert_eq!(
            fetched_stages[1].planned_end_date,
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
        );

        let by_dqe = db.projects().get_project_by_dqe(dqe.id()).await.unwrap();
        assert_eq!(by_dqe.map(|p| p.id), Some(project.id));
    }

    #[tokio::test]
    async fn test_second_project_for_same_dqe_is_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let dqe = saved_validated(&db, "DQE-PRJ-2").await;
        let preview = get_conversion_preview(&dqe, &request()).unwrap();

        db.projects()
            .create_project_from_preview(&preview, "user-2")
            .await
            .unwrap();
        let err = db
            .projects()
            .create_project_from_preview(&preview, "user-2")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "already_converted");
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(matches!(
            db.projects().get_project("nope").await.unwrap_err(),
            DbError::NotFound { .. }
        ));
        assert!(db.projects().get_project_by_dqe("nope").await.unwrap().is_none());
        assert!(db.projects().get_stages("nope").await.unwrap().is_empty());
    }
}
