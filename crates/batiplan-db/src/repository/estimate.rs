//! # Estimate Repository
//!
//! Load and save of a whole DQE tree, plus the read models of the DQE list.
//!
//! ## Save Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Read-Modify-Write                                 │
//! │                                                                         │
//! │  1. LOAD                                                                │
//! │     └── load() → Dqe { version: 3 }                                     │
//! │                                                                         │
//! │  2. MUTATE (batiplan-core, in memory)                                   │
//! │     └── add_item(), validate(), ...                                     │
//! │                                                                         │
//! │  3. SAVE (one transaction)                                              │
//! │     └── UPDATE dqes ... WHERE id = ? AND version = 3                    │
//! │         ├── 1 row  → replace lots, chapters, items, lines → version 4   │
//! │         └── 0 rows → VersionConflict (someone saved version 4 first)    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stored totals are a read model for lists; loading always recomputes them
//! from quantities and prices.

use std::collections::HashMap;

use batiplan_core::conversion::ConversionStatus;
use batiplan_core::lifecycle;
use batiplan_core::{
    Chapter, Coefficient, CoreError, DebourseLine, Dqe, DqeHeader, DqeStatus, ExpenseType, Item,
    Lot, Money, Quantity, TaxRate,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};

// =============================================================================
// Rows
// =============================================================================

#[derive(sqlx::FromRow)]
struct DqeRow {
    id: String,
    reference: String,
    nom: String,
    client: Option<String>,
    description: Option<String>,
    statut: DqeStatus,
    taux_tva_bps: u32,
    total_ht: i64,
    montant_tva: i64,
    total_ttc: i64,
    notes: Option<String>,
    utilisateur_creation: String,
    date_validation: Option<DateTime<Utc>>,
    valide_par: Option<String>,
    is_converted: bool,
    linked_project_id: Option<String>,
    converted_at: Option<DateTime<Utc>>,
    converted_by_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl DqeRow {
    fn into_header(self) -> DqeHeader {
        DqeHeader {
            id: self.id,
            reference: self.reference,
            name: self.nom,
            client: self.client,
            description: self.description,
            status: self.statut,
            vat_rate: TaxRate::from_bps(self.taux_tva_bps),
            total_ht: Money::from_units(self.total_ht),
            vat_amount: Money::from_units(self.montant_tva),
            total_ttc: Money::from_units(self.total_ttc),
            notes: self.notes,
            created_by: self.utilisateur_creation,
            validated_at: self.date_validation,
            validated_by: self.valide_par,
            is_converted: self.is_converted,
            linked_project_id: self.linked_project_id,
            converted_at: self.converted_at,
            converted_by: self.converted_by_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LotRow {
    id: String,
    code: String,
    nom: String,
    description: Option<String>,
    ordre: u32,
}

#[derive(sqlx::FromRow)]
struct ChapterRow {
    id: String,
    lot_id: String,
    code: String,
    nom: String,
    ordre: u32,
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: String,
    chapter_id: String,
    code: String,
    designation: String,
    unite: String,
    quantite_milli: i64,
    prix_unitaire_ht: i64,
    ordre: u32,
}

#[derive(sqlx::FromRow)]
struct LineRow {
    id: String,
    item_id: String,
    type_depense: ExpenseType,
    designation: String,
    unite: String,
    quantite_milli: i64,
    prix_unitaire_ht: i64,
    coefficient_e4: i64,
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: String,
    reference: String,
    nom: String,
    client: Option<String>,
    statut: DqeStatus,
    total_ht: i64,
    total_ttc: i64,
    is_converted: bool,
    linked_project_id: Option<String>,
    lot_count: i64,
    updated_at: DateTime<Utc>,
}

// =============================================================================
// Read Models
// =============================================================================

/// One row of the DQE list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DqeSummary {
    pub id: String,
    pub reference: String,
    #[serde(rename = "nom")]
    pub name: String,
    pub client: Option<String>,
    #[serde(rename = "statut")]
    pub status: DqeStatus,
    #[serde(rename = "totalRevenueHT")]
    pub total_ht: Money,
    #[serde(rename = "totalRevenueTTC")]
    pub total_ttc: Money,
    pub is_converted: bool,
    pub linked_project_id: Option<String>,
    /// Derived on every read, never stored.
    pub conversion_status: ConversionStatus,
    #[serde(rename = "nombreLots")]
    pub lot_count: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCount {
    #[serde(rename = "statut")]
    pub status: DqeStatus,
    #[serde(rename = "nombre")]
    pub count: u32,
}

/// Counts and amounts over every DQE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DqeStatistics {
    #[serde(rename = "total")]
    pub total_count: u32,
    /// One entry per status, in lifecycle order, zero counts included.
    #[serde(rename = "parStatut")]
    pub by_status: Vec<StatusCount>,
    #[serde(rename = "convertibles")]
    pub convertible_count: u32,
    #[serde(rename = "convertis")]
    pub converted_count: u32,
    #[serde(rename = "nonConvertibles")]
    pub not_convertible_count: u32,
    #[serde(rename = "totalRevenueHT")]
    pub total_revenue_ht: Money,
    #[serde(rename = "totalConvertiHT")]
    pub converted_revenue_ht: Money,
}

impl DqeStatistics {
    pub fn count_for(&self, status: DqeStatus) -> u32 {
        self.by_status
            .iter()
            .find(|entry| entry.status == status)
            .map(|entry| entry.count)
            .unwrap_or(0)
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for DQE database operations.
#[derive(Debug, Clone)]
pub struct EstimateRepository {
    pool: SqlitePool,
}

impl EstimateRepository {
    /// Creates a new EstimateRepository.
    pub fn new(pool: SqlitePool) -> Self {
        EstimateRepository { pool }
    }

    /// Loads a DQE with its full hierarchy and déboursé lines.
    pub async fn load(&self, id: &str) -> DbResult<Dqe> {
        // One read transaction: every table is seen at the same snapshot
        let mut tx = self.pool.begin().await?;
        let dqe = load_in(&mut tx, id).await?;
        tx.commit().await?;
        Ok(dqe)
    }

    /// Saves the header and the full tree in one transaction.
    ///
    /// A new DQE (version 0) is inserted; a loaded one is updated only if its
    /// stored version still matches. On success `dqe` carries the new version.
    pub async fn save(&self, dqe: &mut Dqe) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let version = save_in(&mut tx, dqe).await?;
        tx.commit().await?;
        dqe.mark_persisted(version);
        Ok(())
    }

    /// Removes a DQE that never became a project.
    pub async fn delete(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM dqes WHERE id = ?1 AND is_converted = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let converted: Option<bool> =
                sqlx::query_scalar("SELECT is_converted FROM dqes WHERE id = ?1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(match converted {
                Some(_) => CoreError::ImmutableState {
                    dqe_id: id.to_string(),
                    reason: "a converted DQE is kept with its project".to_string(),
                }
                .into(),
                None => DbError::not_found("DQE", id),
            });
        }

        debug!(dqe_id = %id, "DQE deleted");
        Ok(())
    }

    /// Lists DQEs, most recently changed first.
    pub async fn list(&self, status: Option<DqeStatus>) -> DbResult<Vec<DqeSummary>> {
        let rows: Vec<SummaryRow> = sqlx::query_as(
            r#"
            SELECT
                d.id, d.reference, d.nom, d.client, d.statut,
                d.total_ht, d.total_ttc, d.is_converted, d.linked_project_id,
                (SELECT COUNT(*) FROM dqe_lots l WHERE l.dqe_id = d.id) AS lot_count,
                d.updated_at
            FROM dqes d
            WHERE ?1 IS NULL OR d.statut = ?1
            ORDER BY d.updated_at DESC, d.reference
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let total_ht = Money::from_units(row.total_ht);
                DqeSummary {
                    conversion_status: ConversionStatus::derive(row.statut, row.is_converted, total_ht),
                    id: row.id,
                    reference: row.reference,
                    name: row.nom,
                    client: row.client,
                    status: row.statut,
                    total_ht,
                    total_ttc: Money::from_units(row.total_ttc),
                    is_converted: row.is_converted,
                    linked_project_id: row.linked_project_id,
                    lot_count: u32::try_from(row.lot_count).unwrap_or(u32::MAX),
                    updated_at: row.updated_at,
                }
            })
            .collect())
    }

    /// Computes the statistics fresh from the stored rows.
    pub async fn statistics(&self) -> DbResult<DqeStatistics> {
        let rows: Vec<(DqeStatus, bool, i64)> =
            sqlx::query_as("SELECT statut, is_converted, total_ht FROM dqes")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = DqeStatistics {
            total_count: 0,
            by_status: DqeStatus::ALL
                .iter()
                .map(|&status| StatusCount { status, count: 0 })
                .collect(),
            convertible_count: 0,
            converted_count: 0,
            not_convertible_count: 0,
            total_revenue_ht: Money::zero(),
            converted_revenue_ht: Money::zero(),
        };

        for (status, is_converted, total_ht) in rows {
            let total_ht = Money::from_units(total_ht);
            stats.total_count += 1;
            stats.total_revenue_ht += total_ht;
            if let Some(entry) = stats.by_status.iter_mut().find(|e| e.status == status) {
                entry.count += 1;
            }
            match ConversionStatus::derive(status, is_converted, total_ht) {
                ConversionStatus::Converted => {
                    stats.converted_count += 1;
                    stats.converted_revenue_ht += total_ht;
                }
                ConversionStatus::Convertible => stats.convertible_count += 1,
                ConversionStatus::NotConvertible => stats.not_convertible_count += 1,
            }
        }

        Ok(stats)
    }

    /// The DQE an item belongs to.
    pub async fn find_dqe_id_for_item(&self, item_id: &str) -> DbResult<String> {
        sqlx::query_scalar("SELECT dqe_id FROM dqe_items WHERE id = ?1")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("Item", item_id))
    }
}

// =============================================================================
// Connection-level operations (shared with the conversion transaction)
// =============================================================================

pub(crate) async fn load_in(conn: &mut SqliteConnection, id: &str) -> DbResult<Dqe> {
    let header: DqeRow = sqlx::query_as(
        r#"
        SELECT
            id, reference, nom, client, description, statut, taux_tva_bps,
            total_ht, montant_tva, total_ttc, notes, utilisateur_creation,
            date_validation, valide_par, is_converted, linked_project_id,
            converted_at, converted_by_id, created_at, updated_at, version
        FROM dqes
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| DbError::not_found("DQE", id))?;

    let lots: Vec<LotRow> = sqlx::query_as(
        "SELECT id, code, nom, description, ordre FROM dqe_lots WHERE dqe_id = ?1 ORDER BY ordre",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    let chapters: Vec<ChapterRow> = sqlx::query_as(
        "SELECT id, lot_id, code, nom, ordre FROM dqe_chapters WHERE dqe_id = ?1 ORDER BY lot_id, ordre",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    let items: Vec<ItemRow> = sqlx::query_as(
        r#"
        SELECT id, chapter_id, code, designation, unite, quantite_milli, prix_unitaire_ht, ordre
        FROM dqe_items
        WHERE dqe_id = ?1
        ORDER BY chapter_id, ordre
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    let lines: Vec<LineRow> = sqlx::query_as(
        r#"
        SELECT
            l.id, l.item_id, l.type_depense, l.designation, l.unite,
            l.quantite_milli, l.prix_unitaire_ht, l.coefficient_e4
        FROM debourse_lines l
        JOIN dqe_items i ON i.id = l.item_id
        WHERE i.dqe_id = ?1
        ORDER BY l.item_id, l.ordre
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    let mut lines_by_item: HashMap<String, Vec<DebourseLine>> = HashMap::new();
    for row in lines {
        lines_by_item.entry(row.item_id).or_default().push(DebourseLine {
            id: row.id,
            expense_type: row.type_depense,
            designation: row.designation,
            unit: row.unite,
            quantity: Quantity::from_milli(row.quantite_milli),
            unit_price_ht: Money::from_units(row.prix_unitaire_ht),
            coefficient: Coefficient::from_ten_thousandths(row.coefficient_e4),
            amount_ht: Money::zero(),
        });
    }

    let lots = lots
        .into_iter()
        .map(|row| Lot {
            id: row.id,
            code: row.code,
            name: row.nom,
            description: row.description,
            ordre: row.ordre,
            total_ht: Money::zero(),
            percentage_of_total: 0.0,
        })
        .collect();

    let chapters = chapters
        .into_iter()
        .map(|row| Chapter {
            id: row.id,
            lot_id: row.lot_id,
            code: row.code,
            name: row.nom,
            ordre: row.ordre,
            total_ht: Money::zero(),
        })
        .collect();

    let items = items
        .into_iter()
        .map(|row| Item {
            debourse_lines: lines_by_item.remove(&row.id).unwrap_or_default(),
            id: row.id,
            chapter_id: row.chapter_id,
            code: row.code,
            designation: row.designation,
            unit: row.unite,
            quantity: Quantity::from_milli(row.quantite_milli),
            unit_price_ht: Money::from_units(row.prix_unitaire_ht),
            ordre: row.ordre,
            total_ht: Money::zero(),
            debourse_sec: Money::zero(),
        })
        .collect();

    Ok(Dqe::from_parts(header.into_header(), lots, chapters, items)?)
}

/// Writes `dqe` and returns the version now stored.
///
/// Updates are checked against the stored state, not the in-memory one:
/// once the stored structure is frozen only the status, notes and déboursé
/// lines are written, and the conversion columns are left to
/// [`record_conversion`].
pub(crate) async fn save_in(conn: &mut SqliteConnection, dqe: &Dqe) -> DbResult<i64> {
    let header = dqe.header();

    if header.version == 0 {
        lifecycle::ensure_insert_allowed(dqe)?;

        debug!(dqe_id = %header.id, reference = %header.reference, "Inserting DQE");

        sqlx::query(
            r#"
            INSERT INTO dqes (
                id, reference, nom, client, description, statut, taux_tva_bps,
                total_ht, montant_tva, total_ttc, notes, utilisateur_creation,
                date_validation, valide_par, is_converted, linked_project_id,
                converted_at, converted_by_id, created_at, updated_at, version
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11, ?12,
                ?13, ?14, 0, NULL,
                NULL, NULL, ?15, ?16, 1
            )
            "#,
        )
        .bind(&header.id)
        .bind(&header.reference)
        .bind(&header.name)
        .bind(&header.client)
        .bind(&header.description)
        .bind(header.status)
        .bind(header.vat_rate.bps())
        .bind(header.total_ht.units())
        .bind(header.vat_amount.units())
        .bind(header.total_ttc.units())
        .bind(&header.notes)
        .bind(&header.created_by)
        .bind(header.validated_at)
        .bind(&header.validated_by)
        .bind(header.created_at)
        .bind(header.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { .. } => DbError::duplicate("reference", &header.reference),
            other => other,
        })?;

        replace_tree(conn, dqe).await?;
        return Ok(1);
    }

    // Write lock first, so the stored state read below cannot go stale.
    lock_for_update(conn, &header.id).await?;
    let stored = load_in(conn, &header.id).await?;
    if stored.header().version != header.version {
        return Err(version_conflict(header, stored.header().version));
    }
    lifecycle::ensure_save_allowed(&stored, dqe)?;

    let structure_editable = stored.status().is_structure_editable();
    debug!(
        dqe_id = %header.id,
        version = header.version,
        structure_editable,
        "Updating DQE"
    );

    let result = if structure_editable {
        sqlx::query(
            r#"
            UPDATE dqes SET
                reference = ?1, nom = ?2, client = ?3, description = ?4, statut = ?5,
                taux_tva_bps = ?6, total_ht = ?7, montant_tva = ?8, total_ttc = ?9,
                notes = ?10, date_validation = ?11, valide_par = ?12,
                updated_at = ?13, version = version + 1
            WHERE id = ?14 AND version = ?15 AND is_converted = 0
            "#,
        )
        .bind(&header.reference)
        .bind(&header.name)
        .bind(&header.client)
        .bind(&header.description)
        .bind(header.status)
        .bind(header.vat_rate.bps())
        .bind(header.total_ht.units())
        .bind(header.vat_amount.units())
        .bind(header.total_ttc.units())
        .bind(&header.notes)
        .bind(header.validated_at)
        .bind(&header.validated_by)
        .bind(header.updated_at)
        .bind(&header.id)
        .bind(header.version)
        .execute(&mut *conn)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { .. } => DbError::duplicate("reference", &header.reference),
            other => other,
        })?
    } else {
        sqlx::query(
            r#"
            UPDATE dqes SET
                statut = ?1, notes = ?2, updated_at = ?3, version = version + 1
            WHERE id = ?4 AND version = ?5 AND is_converted = 0
            "#,
        )
        .bind(header.status)
        .bind(&header.notes)
        .bind(header.updated_at)
        .bind(&header.id)
        .bind(header.version)
        .execute(&mut *conn)
        .await?
    };

    if result.rows_affected() == 0 {
        return Err(version_conflict(header, stored.header().version));
    }

    if structure_editable {
        replace_tree(conn, dqe).await?;
    } else if !stored.status().is_terminal() {
        replace_cost_lines(conn, dqe).await?;
    }
    Ok(header.version + 1)
}

fn version_conflict(header: &DqeHeader, stored: i64) -> DbError {
    warn!(
        dqe_id = %header.id,
        expected = header.version,
        stored,
        "Version conflict on DQE save"
    );
    DbError::VersionConflict {
        entity: "DQE".to_string(),
        id: header.id.clone(),
        expected: header.version,
    }
}

/// Rewrites the déboursé lines and `deboursseSec` of every item, leaving the
/// rest of the tree as stored.
async fn replace_cost_lines(conn: &mut SqliteConnection, dqe: &Dqe) -> DbResult<()> {
    sqlx::query(
        "DELETE FROM debourse_lines WHERE item_id IN (SELECT id FROM dqe_items WHERE dqe_id = ?1)",
    )
    .bind(dqe.id())
    .execute(&mut *conn)
    .await?;

    for item in dqe.items() {
        sqlx::query("UPDATE dqe_items SET debourse_sec = ?1 WHERE id = ?2 AND dqe_id = ?3")
            .bind(item.debourse_sec.units())
            .bind(&item.id)
            .bind(dqe.id())
            .execute(&mut *conn)
            .await?;
        insert_lines(conn, item).await?;
    }

    debug!(dqe_id = %dqe.id(), items = dqe.item_count(), "DQE cost lines written");
    Ok(())
}

/// Replaces the stored lots, chapters, items and lines with those of `dqe`.
async fn replace_tree(conn: &mut SqliteConnection, dqe: &Dqe) -> DbResult<()> {
    let dqe_id = dqe.id();

    sqlx::query(
        "DELETE FROM debourse_lines WHERE item_id IN (SELECT id FROM dqe_items WHERE dqe_id = ?1)",
    )
    .bind(dqe_id)
    .execute(&mut *conn)
    .await?;
    for table in ["dqe_items", "dqe_chapters", "dqe_lots"] {
        sqlx::query(&format!("DELETE FROM {} WHERE dqe_id = ?1", table))
            .bind(dqe_id)
            .execute(&mut *conn)
            .await?;
    }

    for lot in dqe.lots() {
        sqlx::query(
            r#"
            INSERT INTO dqe_lots (id, dqe_id, code, nom, description, ordre, total_ht)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&lot.id)
        .bind(dqe_id)
        .bind(&lot.code)
        .bind(&lot.name)
        .bind(&lot.description)
        .bind(lot.ordre)
        .bind(lot.total_ht.units())
        .execute(&mut *conn)
        .await?;

        for chapter in dqe.chapters_of(&lot.id) {
            sqlx::query(
                r#"
                INSERT INTO dqe_chapters (id, dqe_id, lot_id, code, nom, ordre, total_ht)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&chapter.id)
            .bind(dqe_id)
            .bind(&chapter.lot_id)
            .bind(&chapter.code)
            .bind(&chapter.name)
            .bind(chapter.ordre)
            .bind(chapter.total_ht.units())
            .execute(&mut *conn)
            .await?;

            for item in dqe.items_of(&chapter.id) {
                insert_item(conn, dqe_id, item).await?;
            }
        }
    }

    debug!(
        dqe_id = %dqe_id,
        lots = dqe.lot_count(),
        chapters = dqe.chapter_count(),
        items = dqe.item_count(),
        "DQE tree written"
    );
    Ok(())
}

async fn insert_item(conn: &mut SqliteConnection, dqe_id: &str, item: &Item) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO dqe_items (
            id, dqe_id, chapter_id, code, designation, unite,
            quantite_milli, prix_unitaire_ht, ordre, total_ht, debourse_sec
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&item.id)
    .bind(dqe_id)
    .bind(&item.chapter_id)
    .bind(&item.code)
    .bind(&item.designation)
    .bind(&item.unit)
    .bind(item.quantity.milli())
    .bind(item.unit_price_ht.units())
    .bind(item.ordre)
    .bind(item.total_ht.units())
    .bind(item.debourse_sec.units())
    .execute(&mut *conn)
    .await?;

    insert_lines(conn, item).await
}

async fn insert_lines(conn: &mut SqliteConnection, item: &Item) -> DbResult<()> {
    for (position, line) in item.debourse_lines.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO debourse_lines (
                id, item_id, ordre, type_depense, designation, unite,
                quantite_milli, prix_unitaire_ht, coefficient_e4, montant_ht
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&line.id)
        .bind(&item.id)
        .bind(position as i64 + 1)
        .bind(line.expense_type)
        .bind(&line.designation)
        .bind(&line.unit)
        .bind(line.quantity.milli())
        .bind(line.unit_price_ht.units())
        .bind(line.coefficient.ten_thousandths())
        .bind(line.amount_ht.units())
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Takes the SQLite write lock before the DQE row is read.
///
/// A second writer blocks here until the first commits, then reads what the
/// first one wrote.
pub(crate) async fn lock_for_update(conn: &mut SqliteConnection, id: &str) -> DbResult<()> {
    let result = sqlx::query("UPDATE dqes SET version = version WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("DQE", id));
    }
    Ok(())
}

/// Persists the conversion fields of `dqe`.
pub(crate) async fn record_conversion(conn: &mut SqliteConnection, dqe: &Dqe) -> DbResult<()> {
    let header = dqe.header();

    let result = sqlx::query(
        r#"
        UPDATE dqes SET
            is_converted = 1, linked_project_id = ?1, converted_at = ?2,
            converted_by_id = ?3, updated_at = ?4, version = version + 1
        WHERE id = ?5 AND is_converted = 0
        "#,
    )
    .bind(&header.linked_project_id)
    .bind(header.converted_at)
    .bind(&header.converted_by)
    .bind(header.updated_at)
    .bind(&header.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::AlreadyConverted {
            dqe_id: header.id.clone(),
            project_id: None,
        }
        .into());
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
