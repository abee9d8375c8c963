//! # Hierarchy Module
//!
//! The DQE aggregate: Lot → Chapter → Item, held as an arena.
//!
//! ## Arena Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Dqe                                                                    │
//! │  ├── header      statut, tauxTVA, totals, validation/conversion fields  │
//! │  ├── lots        [Lot0, Lot1, ...]          (insertion order)           │
//! │  ├── chapters    [Ch0, Ch1, ...]            (each knows its lot_id)     │
//! │  ├── items       [It0, It1, ...]            (each knows its chapter_id) │
//! │  └── topology    derived, rebuilt after every structural change         │
//! │        lot_order      lots sorted by (ordre, code)                      │
//! │        lot_chapters   lot index → chapter indices, sorted               │
//! │        chapter_items  chapter index → item indices, sorted              │
//! │        *_index        id → arena index                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutation checks editability, validates its input, rebuilds the
//! topology and runs the rollup, so totals and percentages are always current.
//! Sibling `ordre` values are unique; ties in sorting fall back to `code`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use ts_rs::TS;
use uuid::Uuid;

use crate::debourse::DebourseLine;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::lifecycle;
use crate::money::{Money, Quantity};
use crate::rollup;
use crate::types::{DqeStatus, TaxRate};
use crate::validation::{
    validate_code, validate_label, validate_quantity, validate_unit, validate_unit_price,
    validate_user_id, validate_vat_rate_bps,
};

/// Generates a new node id (UUID v4).
pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Nodes
// =============================================================================

/// DQE-level fields: identity, status, totals, validation and conversion metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct DqeHeader {
    pub id: String,

    /// Business reference, e.g. `DQE-2024-017`.
    pub reference: String,

    #[serde(rename = "nom")]
    pub name: String,

    #[serde(default)]
    pub client: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(rename = "statut", default)]
    pub status: DqeStatus,

    #[serde(rename = "tauxTVA", default)]
    pub vat_rate: TaxRate,

    #[serde(rename = "totalRevenueHT", default)]
    pub total_ht: Money,

    #[serde(rename = "montantTVA", default)]
    pub vat_amount: Money,

    #[serde(rename = "totalRevenueTTC", default)]
    pub total_ttc: Money,

    /// Free annotation, still editable after validation.
    #[serde(default)]
    pub notes: Option<String>,

    #[serde(rename = "utilisateurCreation")]
    pub created_by: String,

    #[serde(rename = "dateValidation", default)]
    #[ts(as = "Option<String>")]
    pub validated_at: Option<DateTime<Utc>>,

    #[serde(rename = "validePar", default)]
    pub validated_by: Option<String>,

    /// Monotonic: once true, never false again.
    #[serde(default)]
    pub is_converted: bool,

    /// Immutable once set.
    #[serde(default)]
    pub linked_project_id: Option<String>,

    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub converted_at: Option<DateTime<Utc>>,

    #[serde(rename = "convertedById", default)]
    pub converted_by: Option<String>,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,

    /// Optimistic concurrency version, 0 until first persisted.
    #[serde(default)]
    pub version: i64,
}

/// Top-level trade / work package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Lot {
    pub id: String,
    pub code: String,
    #[serde(rename = "nom")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub ordre: u32,
    #[serde(rename = "totalRevenueHT", default)]
    pub total_ht: Money,
    /// Share of the DQE total, display only.
    #[serde(rename = "pourcentageTotal", default)]
    pub percentage_of_total: f64,
}

/// Grouping of items inside a lot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Chapter {
    pub id: String,
    pub lot_id: String,
    pub code: String,
    #[serde(rename = "nom")]
    pub name: String,
    pub ordre: u32,
    #[serde(rename = "totalRevenueHT", default)]
    pub total_ht: Money,
}

/// Priced leaf line (poste).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Item {
    pub id: String,
    pub chapter_id: String,
    pub code: String,
    pub designation: String,
    #[serde(rename = "unite")]
    pub unit: String,
    #[serde(rename = "quantite")]
    #[ts(type = "string")]
    pub quantity: Quantity,
    #[serde(rename = "prixUnitaireHT")]
    pub unit_price_ht: Money,
    pub ordre: u32,
    /// `quantite × prixUnitaireHT`, rounded to the unit.
    #[serde(rename = "totalRevenueHT", default)]
    pub total_ht: Money,
    #[serde(rename = "lignesDebourse", default)]
    pub debourse_lines: Vec<DebourseLine>,
    /// Sum of the déboursé lines, independent of `total_ht`.
    #[serde(rename = "deboursseSec", default)]
    pub debourse_sec: Money,
}

// =============================================================================
// Topology
// =============================================================================

/// Parent/children index lists derived from the node arenas.
#[derive(Debug, Clone, Default)]
pub(crate) struct Topology {
    pub(crate) lot_index: HashMap<String, usize>,
    pub(crate) chapter_index: HashMap<String, usize>,
    pub(crate) item_index: HashMap<String, usize>,
    pub(crate) lot_order: Vec<usize>,
    pub(crate) lot_chapters: Vec<Vec<usize>>,
    pub(crate) chapter_items: Vec<Vec<usize>>,
    pub(crate) chapter_lot: Vec<usize>,
    pub(crate) item_chapter: Vec<usize>,
}

impl Topology {
    pub(crate) fn build(
        lots: &[Lot],
        chapters: &[Chapter],
        items: &[Item],
    ) -> Result<Self, ValidationError> {
        let mut topology = Topology::default();

        for (i, lot) in lots.iter().enumerate() {
            if topology.lot_index.insert(lot.id.clone(), i).is_some() {
                return Err(ValidationError::DuplicateId {
                    entity: "lot".to_string(),
                    id: lot.id.clone(),
                });
            }
        }

        topology.lot_chapters = vec![Vec::new(); lots.len()];
        for (i, chapter) in chapters.iter().enumerate() {
            if topology.chapter_index.insert(chapter.id.clone(), i).is_some() {
                return Err(ValidationError::DuplicateId {
                    entity: "chapter".to_string(),
                    id: chapter.id.clone(),
                });
            }
            let parent = *topology.lot_index.get(&chapter.lot_id).ok_or_else(|| {
                ValidationError::DanglingParent {
                    entity: "chapter".to_string(),
                    id: chapter.id.clone(),
                    parent_id: chapter.lot_id.clone(),
                }
            })?;
            topology.chapter_lot.push(parent);
            topology.lot_chapters[parent].push(i);
        }

        topology.chapter_items = vec![Vec::new(); chapters.len()];
        for (i, item) in items.iter().enumerate() {
            if topology.item_index.insert(item.id.clone(), i).is_some() {
                return Err(ValidationError::DuplicateId {
                    entity: "item".to_string(),
                    id: item.id.clone(),
                });
            }
            let parent = *topology.chapter_index.get(&item.chapter_id).ok_or_else(|| {
                ValidationError::DanglingParent {
                    entity: "item".to_string(),
                    id: item.id.clone(),
                    parent_id: item.chapter_id.clone(),
                }
            })?;
            topology.item_chapter.push(parent);
            topology.chapter_items[parent].push(i);
        }

        topology.lot_order = (0..lots.len()).collect();
        topology
            .lot_order
            .sort_by(|&a, &b| (lots[a].ordre, &lots[a].code).cmp(&(lots[b].ordre, &lots[b].code)));
        ensure_unique_ordre(topology.lot_order.iter().map(|&i| lots[i].ordre), || {
            "DQE".to_string()
        })?;

        for (lot, list) in topology.lot_chapters.iter_mut().enumerate() {
            list.sort_by(|&a, &b| {
                (chapters[a].ordre, &chapters[a].code).cmp(&(chapters[b].ordre, &chapters[b].code))
            });
            ensure_unique_ordre(list.iter().map(|&i| chapters[i].ordre), || {
                format!("lot {}", lots[lot].code)
            })?;
        }

        for (chapter, list) in topology.chapter_items.iter_mut().enumerate() {
            list.sort_by(|&a, &b| {
                (items[a].ordre, &items[a].code).cmp(&(items[b].ordre, &items[b].code))
            });
            ensure_unique_ordre(list.iter().map(|&i| items[i].ordre), || {
                format!("chapter {}", chapters[chapter].code)
            })?;
        }

        Ok(topology)
    }
}

/// Checks an already sorted `ordre` sequence for duplicates.
fn ensure_unique_ordre(
    sorted: impl Iterator<Item = u32>,
    scope: impl FnOnce() -> String,
) -> Result<(), ValidationError> {
    let mut previous = None;
    for ordre in sorted {
        if previous == Some(ordre) {
            return Err(ValidationError::DuplicateOrdre {
                scope: scope(),
                ordre,
            });
        }
        previous = Some(ordre);
    }
    Ok(())
}

/// Picks the `ordre` of a new or moved node among its siblings.
///
/// `None` appends after the last sibling.
fn resolve_ordre(siblings: &[u32], requested: Option<u32>, scope: &str) -> Result<u32, ValidationError> {
    match requested {
        Some(ordre) if siblings.contains(&ordre) => Err(ValidationError::DuplicateOrdre {
            scope: scope.to_string(),
            ordre,
        }),
        Some(ordre) => Ok(ordre),
        None => match siblings.iter().max() {
            None => Ok(1),
            Some(max) => max.checked_add(1).ok_or_else(|| ValidationError::OutOfRange {
                field: "ordre".to_string(),
                min: 1,
                max: i64::from(u32::MAX),
            }),
        },
    }
}

/// Checks that `ids` lists every sibling exactly once.
fn ensure_permutation(ids: &[String], siblings: &[&str], scope: &str) -> Result<(), ValidationError> {
    let requested: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let current: HashSet<&str> = siblings.iter().copied().collect();
    if ids.len() != siblings.len() || requested.len() != ids.len() || requested != current {
        return Err(ValidationError::InvalidReorder {
            scope: scope.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Inputs
// =============================================================================

/// Fields needed to open a new DQE.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDqe {
    pub reference: String,
    #[serde(rename = "nom")]
    pub name: String,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// `None` uses [`TaxRate::default`].
    #[serde(rename = "tauxTVA", default)]
    pub vat_rate: Option<TaxRate>,
    #[serde(rename = "utilisateurCreation")]
    pub created_by: String,
}

/// Editable DQE details. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DqeDetailsUpdate {
    #[serde(rename = "nom", default)]
    pub name: Option<String>,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLot {
    pub code: String,
    #[serde(rename = "nom")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ordre: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LotUpdate {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(rename = "nom", default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ordre: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChapter {
    pub code: String,
    #[serde(rename = "nom")]
    pub name: String,
    #[serde(default)]
    pub ordre: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterUpdate {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(rename = "nom", default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ordre: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub code: String,
    pub designation: String,
    #[serde(rename = "unite")]
    pub unit: String,
    #[serde(rename = "quantite")]
    pub quantity: Quantity,
    #[serde(rename = "prixUnitaireHT")]
    pub unit_price_ht: Money,
    #[serde(default)]
    pub ordre: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdate {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub designation: Option<String>,
    #[serde(rename = "unite", default)]
    pub unit: Option<String>,
    #[serde(rename = "quantite", default)]
    pub quantity: Option<Quantity>,
    #[serde(rename = "prixUnitaireHT", default)]
    pub unit_price_ht: Option<Money>,
    #[serde(default)]
    pub ordre: Option<u32>,
}

// =============================================================================
// DQE Aggregate
// =============================================================================

/// A quantity estimate with its full hierarchy.
///
/// Serializes as a flat [`DqeDocument`]; deserialization re-links the arena
/// and re-derives every total.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "DqeDocument", into = "DqeDocument")]
pub struct Dqe {
    pub(crate) header: DqeHeader,
    pub(crate) lots: Vec<Lot>,
    pub(crate) chapters: Vec<Chapter>,
    pub(crate) items: Vec<Item>,
    pub(crate) topology: Topology,
}

/// Wire / storage shape of a [`Dqe`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DqeDocument {
    #[serde(flatten)]
    pub header: DqeHeader,
    #[serde(default)]
    pub lots: Vec<Lot>,
    #[serde(rename = "chapitres", default)]
    pub chapters: Vec<Chapter>,
    #[serde(rename = "postes", default)]
    pub items: Vec<Item>,
}

impl TryFrom<DqeDocument> for Dqe {
    type Error = ValidationError;

    fn try_from(document: DqeDocument) -> Result<Self, Self::Error> {
        Dqe::from_parts(document.header, document.lots, document.chapters, document.items)
    }
}

impl From<Dqe> for DqeDocument {
    fn from(dqe: Dqe) -> Self {
        DqeDocument {
            header: dqe.header,
            lots: dqe.lots,
            chapters: dqe.chapters,
            items: dqe.items,
        }
    }
}

/// Equality over the stored nodes; the topology is derived from them.
impl PartialEq for Dqe {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
            && self.lots == other.lots
            && self.chapters == other.chapters
            && self.items == other.items
    }
}

impl Dqe {
    /// Opens a new DQE in `brouillon`.
    pub fn new(input: NewDqe, now: DateTime<Utc>) -> CoreResult<Self> {
        validate_code("reference", &input.reference)?;
        validate_label("nom", &input.name)?;
        validate_user_id("utilisateurCreation", &input.created_by)?;
        let vat_rate = input.vat_rate.unwrap_or_default();
        validate_vat_rate_bps(vat_rate.bps())?;

        let header = DqeHeader {
            id: new_id(),
            reference: input.reference.trim().to_string(),
            name: input.name.trim().to_string(),
            client: input.client,
            description: input.description,
            status: DqeStatus::Draft,
            vat_rate,
            total_ht: Money::zero(),
            vat_amount: Money::zero(),
            total_ttc: Money::zero(),
            notes: None,
            created_by: input.created_by,
            validated_at: None,
            validated_by: None,
            is_converted: false,
            linked_project_id: None,
            converted_at: None,
            converted_by: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        Ok(Dqe {
            header,
            lots: Vec::new(),
            chapters: Vec::new(),
            items: Vec::new(),
            topology: Topology::default(),
        })
    }

    /// Rebuilds an aggregate from stored nodes (persistence, deserialization).
    ///
    /// Derived fields (totals, percentages, line amounts) are recomputed.
    pub fn from_parts(
        header: DqeHeader,
        lots: Vec<Lot>,
        chapters: Vec<Chapter>,
        items: Vec<Item>,
    ) -> Result<Self, ValidationError> {
        let topology = Topology::build(&lots, &chapters, &items)?;
        let mut dqe = Dqe {
            header,
            lots,
            chapters,
            items,
            topology,
        };
        rollup::refresh_totals(&mut dqe)?;
        Ok(dqe)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn header(&self) -> &DqeHeader {
        &self.header
    }

    pub fn status(&self) -> DqeStatus {
        self.header.status
    }

    pub fn total_ht(&self) -> Money {
        self.header.total_ht
    }

    pub fn is_converted(&self) -> bool {
        self.header.is_converted
    }

    /// Lots in `ordre` order.
    pub fn lots(&self) -> impl Iterator<Item = &Lot> + '_ {
        self.topology.lot_order.iter().map(move |&i| &self.lots[i])
    }

    pub fn lot(&self, lot_id: &str) -> Option<&Lot> {
        self.topology.lot_index.get(lot_id).map(|&i| &self.lots[i])
    }

    pub fn chapter(&self, chapter_id: &str) -> Option<&Chapter> {
        self.topology.chapter_index.get(chapter_id).map(|&i| &self.chapters[i])
    }

    pub fn item(&self, item_id: &str) -> Option<&Item> {
        self.topology.item_index.get(item_id).map(|&i| &self.items[i])
    }

    /// Chapters of a lot in `ordre` order; empty for an unknown lot.
    pub fn chapters_of<'a>(&'a self, lot_id: &str) -> impl Iterator<Item = &'a Chapter> + 'a {
        let indices: &'a [usize] = match self.topology.lot_index.get(lot_id) {
            Some(&i) => &self.topology.lot_chapters[i],
            None => &[],
        };
        indices.iter().map(move |&i| &self.chapters[i])
    }

    /// Items of a chapter in `ordre` order; empty for an unknown chapter.
    pub fn items_of<'a>(&'a self, chapter_id: &str) -> impl Iterator<Item = &'a Item> + 'a {
        let indices: &'a [usize] = match self.topology.chapter_index.get(chapter_id) {
            Some(&i) => &self.topology.chapter_items[i],
            None => &[],
        };
        indices.iter().map(move |&i| &self.items[i])
    }

    /// Every item, in tree order (lot, chapter, item).
    pub fn items(&self) -> impl Iterator<Item = &Item> + '_ {
        self.topology
            .lot_order
            .iter()
            .flat_map(move |&lot| self.topology.lot_chapters[lot].iter())
            .flat_map(move |&chapter| self.topology.chapter_items[chapter].iter())
            .map(move |&i| &self.items[i])
    }

    /// The lot an item belongs to.
    pub fn lot_of_item(&self, item_id: &str) -> Option<&Lot> {
        let item = *self.topology.item_index.get(item_id)?;
        let chapter = self.topology.item_chapter[item];
        Some(&self.lots[self.topology.chapter_lot[chapter]])
    }

    pub fn lot_count(&self) -> usize {
        self.lots.len()
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Records the time of the last change.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.header.updated_at = now;
    }

    /// Records the version assigned by the persistence layer.
    pub fn mark_persisted(&mut self, version: i64) {
        self.header.version = version;
    }

    // -------------------------------------------------------------------------
    // Internal lookups
    // -------------------------------------------------------------------------

    fn lot_idx(&self, lot_id: &str) -> CoreResult<usize> {
        self.topology
            .lot_index
            .get(lot_id)
            .copied()
            .ok_or_else(|| CoreError::not_found("Lot", lot_id))
    }

    fn chapter_idx(&self, chapter_id: &str) -> CoreResult<usize> {
        self.topology
            .chapter_index
            .get(chapter_id)
            .copied()
            .ok_or_else(|| CoreError::not_found("Chapter", chapter_id))
    }

    pub(crate) fn item_idx(&self, item_id: &str) -> CoreResult<usize> {
        self.topology
            .item_index
            .get(item_id)
            .copied()
            .ok_or_else(|| CoreError::not_found("Item", item_id))
    }

    /// `lot <code>`, for ordre error messages.
    fn lot_scope(&self, lot_id: &str) -> String {
        format!("lot {}", self.lot(lot_id).map_or(lot_id, |lot| lot.code.as_str()))
    }

    fn chapter_scope(&self, chapter_id: &str) -> String {
        let code = self
            .chapter(chapter_id)
            .map_or(chapter_id, |chapter| chapter.code.as_str());
        format!("chapter {}", code)
    }

    /// Rebuilds the topology and re-runs the rollup.
    fn relink(&mut self) -> CoreResult<()> {
        self.topology = Topology::build(&self.lots, &self.chapters, &self.items)?;
        rollup::refresh_totals(self)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // DQE details
    // -------------------------------------------------------------------------

    pub fn update_details(&mut self, update: DqeDetailsUpdate) -> CoreResult<()> {
        lifecycle::ensure_structure_editable(self)?;
        if let Some(name) = &update.name {
            validate_label("nom", name)?;
        }
        if let Some(name) = update.name {
            self.header.name = name.trim().to_string();
        }
        if let Some(client) = update.client {
            self.header.client = Some(client);
        }
        if let Some(description) = update.description {
            self.header.description = Some(description);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lots
    // -------------------------------------------------------------------------

    /// Adds a lot and returns its id.
    pub fn add_lot(&mut self, input: NewLot) -> CoreResult<String> {
        lifecycle::ensure_structure_editable(self)?;
        validate_code("code", &input.code)?;
        validate_label("nom", &input.name)?;

        let siblings: Vec<u32> = self.lots.iter().map(|lot| lot.ordre).collect();
        let ordre = resolve_ordre(&siblings, input.ordre, "DQE")?;

        let id = new_id();
        self.lots.push(Lot {
            id: id.clone(),
            code: input.code.trim().to_string(),
            name: input.name.trim().to_string(),
            description: input.description,
            ordre,
            total_ht: Money::zero(),
            percentage_of_total: 0.0,
        });
        self.relink()?;
        Ok(id)
    }

    pub fn update_lot(&mut self, lot_id: &str, update: LotUpdate) -> CoreResult<()> {
        lifecycle::ensure_structure_editable(self)?;
        let idx = self.lot_idx(lot_id)?;
        if let Some(code) = &update.code {
            validate_code("code", code)?;
        }
        if let Some(name) = &update.name {
            validate_label("nom", name)?;
        }
        if let Some(ordre) = update.ordre {
            let siblings: Vec<u32> = self
                .lots
                .iter()
                .filter(|lot| lot.id != lot_id)
                .map(|lot| lot.ordre)
                .collect();
            resolve_ordre(&siblings, Some(ordre), "DQE")?;
        }

        let lot = &mut self.lots[idx];
        if let Some(code) = update.code {
            lot.code = code.trim().to_string();
        }
        if let Some(name) = update.name {
            lot.name = name.trim().to_string();
        }
        if let Some(description) = update.description {
            lot.description = Some(description);
        }
        if let Some(ordre) = update.ordre {
            lot.ordre = ordre;
        }
        self.relink()
    }

    /// Removes a lot with all its chapters and items.
    pub fn remove_lot(&mut self, lot_id: &str) -> CoreResult<()> {
        lifecycle::ensure_structure_editable(self)?;
        self.lot_idx(lot_id)?;

        let chapter_ids: HashSet<String> = self
            .chapters
            .iter()
            .filter(|chapter| chapter.lot_id == lot_id)
            .map(|chapter| chapter.id.clone())
            .collect();
        self.items.retain(|item| !chapter_ids.contains(&item.chapter_id));
        self.chapters.retain(|chapter| chapter.lot_id != lot_id);
        self.lots.retain(|lot| lot.id != lot_id);
        self.relink()
    }

    /// Renumbers lots `1..n` following `ordered_ids`.
    pub fn reorder_lots(&mut self, ordered_ids: &[String]) -> CoreResult<()> {
        lifecycle::ensure_structure_editable(self)?;
        let siblings: Vec<&str> = self.lots.iter().map(|lot| lot.id.as_str()).collect();
        ensure_permutation(ordered_ids, &siblings, "DQE")?;

        for (position, id) in ordered_ids.iter().enumerate() {
            let idx = self.lot_idx(id)?;
            self.lots[idx].ordre = position as u32 + 1;
        }
        self.relink()
    }

    // -------------------------------------------------------------------------
    // Chapters
    // -------------------------------------------------------------------------

    /// Adds a chapter to a lot and returns its id.
    pub fn add_chapter(&mut self, lot_id: &str, input: NewChapter) -> CoreResult<String> {
        lifecycle::ensure_structure_editable(self)?;
        self.lot_idx(lot_id)?;
        validate_code("code", &input.code)?;
        validate_label("nom", &input.name)?;

        let siblings: Vec<u32> = self.chapters_of(lot_id).map(|chapter| chapter.ordre).collect();
        let scope = self.lot_scope(lot_id);
        let ordre = resolve_ordre(&siblings, input.ordre, &scope)?;

        let id = new_id();
        self.chapters.push(Chapter {
            id: id.clone(),
            lot_id: lot_id.to_string(),
            code: input.code.trim().to_string(),
            name: input.name.trim().to_string(),
            ordre,
            total_ht: Money::zero(),
        });
        self.relink()?;
        Ok(id)
    }

    pub fn update_chapter(&mut self, chapter_id: &str, update: ChapterUpdate) -> CoreResult<()> {
        lifecycle::ensure_structure_editable(self)?;
        let idx = self.chapter_idx(chapter_id)?;
        if let Some(code) = &update.code {
            validate_code("code", code)?;
        }
        if let Some(name) = &update.name {
            validate_label("nom", name)?;
        }
        if let Some(ordre) = update.ordre {
            let lot_id = self.chapters[idx].lot_id.clone();
            let siblings: Vec<u32> = self
                .chapters_of(&lot_id)
                .filter(|chapter| chapter.id != chapter_id)
                .map(|chapter| chapter.ordre)
                .collect();
            resolve_ordre(&siblings, Some(ordre), &self.lot_scope(&lot_id))?;
        }

        let chapter = &mut self.chapters[idx];
        if let Some(code) = update.code {
            chapter.code = code.trim().to_string();
        }
        if let Some(name) = update.name {
            chapter.name = name.trim().to_string();
        }
        if let Some(ordre) = update.ordre {
            chapter.ordre = ordre;
        }
        self.relink()
    }

    /// Removes a chapter with all its items.
    pub fn remove_chapter(&mut self, chapter_id: &str) -> CoreResult<()> {
        lifecycle::ensure_structure_editable(self)?;
        self.chapter_idx(chapter_id)?;

        self.items.retain(|item| item.chapter_id != chapter_id);
        self.chapters.retain(|chapter| chapter.id != chapter_id);
        self.relink()
    }

    /// Renumbers the chapters of a lot `1..n` following `ordered_ids`.
    pub fn reorder_chapters(&mut self, lot_id: &str, ordered_ids: &[String]) -> CoreResult<()> {
        lifecycle::ensure_structure_editable(self)?;
        self.lot_idx(lot_id)?;
        let siblings: Vec<&str> = self.chapters_of(lot_id).map(|chapter| chapter.id.as_str()).collect();
        ensure_permutation(ordered_ids, &siblings, &self.lot_scope(lot_id))?;

        for (position, id) in ordered_ids.iter().enumerate() {
            let idx = self.chapter_idx(id)?;
            self.chapters[idx].ordre = position as u32 + 1;
        }
        self.relink()
    }

    // -------------------------------------------------------------------------
    // Items
    // -------------------------------------------------------------------------

    /// Adds an item to a chapter and returns its id.
    pub fn add_item(&mut self, chapter_id: &str, input: NewItem) -> CoreResult<String> {
        lifecycle::ensure_structure_editable(self)?;
        self.chapter_idx(chapter_id)?;
        validate_code("code", &input.code)?;
        validate_label("designation", &input.designation)?;
        validate_unit(&input.unit)?;
        validate_quantity(input.quantity)?;
        validate_unit_price(input.unit_price_ht)?;

        let siblings: Vec<u32> = self.items_of(chapter_id).map(|item| item.ordre).collect();
        let scope = self.chapter_scope(chapter_id);
        let ordre = resolve_ordre(&siblings, input.ordre, &scope)?;

        let id = new_id();
        let mut next = self.clone();
        next.items.push(Item {
            id: id.clone(),
            chapter_id: chapter_id.to_string(),
            code: input.code.trim().to_string(),
            designation: input.designation.trim().to_string(),
            unit: input.unit.trim().to_string(),
            quantity: input.quantity,
            unit_price_ht: input.unit_price_ht,
            ordre,
            total_ht: Money::zero(),
            debourse_lines: Vec::new(),
            debourse_sec: Money::zero(),
        });
        next.relink()?;
        *self = next;
        Ok(id)
    }

    pub fn update_item(&mut self, item_id: &str, update: ItemUpdate) -> CoreResult<()> {
        lifecycle::ensure_structure_editable(self)?;
        let idx = self.item_idx(item_id)?;
        if let Some(code) = &update.code {
            validate_code("code", code)?;
        }
        if let Some(designation) = &update.designation {
            validate_label("designation", designation)?;
        }
        if let Some(unit) = &update.unit {
            validate_unit(unit)?;
        }
        if let Some(quantity) = update.quantity {
            validate_quantity(quantity)?;
        }
        if let Some(price) = update.unit_price_ht {
            validate_unit_price(price)?;
        }
        if let Some(ordre) = update.ordre {
            let chapter_id = self.items[idx].chapter_id.clone();
            let siblings: Vec<u32> = self
                .items_of(&chapter_id)
                .filter(|item| item.id != item_id)
                .map(|item| item.ordre)
                .collect();
            resolve_ordre(&siblings, Some(ordre), &self.chapter_scope(&chapter_id))?;
        }

        let mut next = self.clone();
        let item = &mut next.items[idx];
        if let Some(code) = update.code {
            item.code = code.trim().to_string();
        }
        if let Some(designation) = update.designation {
            item.designation = designation.trim().to_string();
        }
        if let Some(unit) = update.unit {
            item.unit = unit.trim().to_string();
        }
        if let Some(quantity) = update.quantity {
            item.quantity = quantity;
        }
        if let Some(price) = update.unit_price_ht {
            item.unit_price_ht = price;
        }
        if let Some(ordre) = update.ordre {
            item.ordre = ordre;
        }
        next.relink()?;
        *self = next;
        Ok(())
    }

    pub fn remove_item(&mut self, item_id: &str) -> CoreResult<()> {
        lifecycle::ensure_structure_editable(self)?;
        self.item_idx(item_id)?;

        self.items.retain(|item| item.id != item_id);
        self.relink()
    }

    /// Moves an item (with its déboursé lines) to another chapter.
    pub fn move_item(
        &mut self,
        item_id: &str,
        target_chapter_id: &str,
        ordre: Option<u32>,
    ) -> CoreResult<()> {
        lifecycle::ensure_structure_editable(self)?;
        let idx = self.item_idx(item_id)?;
        self.chapter_idx(target_chapter_id)?;

        let siblings: Vec<u32> = self
            .items_of(target_chapter_id)
            .filter(|item| item.id != item_id)
            .map(|item| item.ordre)
            .collect();
        let scope = self.chapter_scope(target_chapter_id);
        let ordre = resolve_ordre(&siblings, ordre, &scope)?;

        let item = &mut self.items[idx];
        item.chapter_id = target_chapter_id.to_string();
        item.ordre = ordre;
        self.relink()
    }

    /// Renumbers the items of a chapter `1..n` following `ordered_ids`.
    pub fn reorder_items(&mut self, chapter_id: &str, ordered_ids: &[String]) -> CoreResult<()> {
        lifecycle::ensure_structure_editable(self)?;
        self.chapter_idx(chapter_id)?;
        let siblings: Vec<&str> = self.items_of(chapter_id).map(|item| item.id.as_str()).collect();
        ensure_permutation(ordered_ids, &siblings, &self.chapter_scope(chapter_id))?;

        for (position, id) in ordered_ids.iter().enumerate() {
            let idx = self.item_idx(id)?;
            self.items[idx].ordre = position as u32 + 1;
        }
        self.relink()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
