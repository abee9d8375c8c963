//! End-to-end tests of the estimate service on SQLite.

use std::collections::BTreeMap;
use std::path::PathBuf;

use batiplan_core::debourse::{DebourseLineUpdate, NewDebourseLine};
use batiplan_core::hierarchy::{NewChapter, NewDqe, NewItem, NewLot};
use batiplan_core::{
    Coefficient, ConversionRequest, ConversionStatus, CoreResult, Dqe, DqeStatus, DurationMethod,
    ExpenseType, Money, NotConvertibleReason, Quantity, TaxRate,
};
use batiplan_db::{Database, DbConfig, DbError, EstimateService};
use chrono::NaiveDate;

// =============================================================================
// Helpers
// =============================================================================

async fn service() -> EstimateService {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    EstimateService::new(db, TaxRate::from_bps(1_800))
}

fn new_dqe(reference: &str) -> NewDqe {
    NewDqe {
        reference: reference.to_string(),
        name: "Immeuble R+2".to_string(),
        client: Some("SCI Les Palmiers".to_string()),
        description: Some("Immeuble de bureaux".to_string()),
        vat_rate: None,
        created_by: "user-1".to_string(),
    }
}

/// One lot, chapter and single-unit item per revenue.
fn add_lots(dqe: &mut Dqe, revenues: &[i64]) -> CoreResult<()> {
    for (n, revenue) in revenues.iter().enumerate() {
        let lot = dqe.add_lot(NewLot {
            code: format!("LOT{}", n + 1),
            name: format!("Lot {}", n + 1),
            description: None,
            ordre: None,
        })?;
        let chapter = dqe.add_chapter(
            &lot,
            NewChapter {
                code: format!("CH{}", n + 1),
                name: format!("Chapitre {}", n + 1),
                ordre: None,
            },
        )?;
        dqe.add_item(
            &chapter,
            NewItem {
                code: format!("P{}", n + 1),
                designation: format!("Poste {}", n + 1),
                unit: "ens".to_string(),
                quantity: Quantity::from_units(1),
                unit_price_ht: Money::from_units(*revenue),
                ordre: None,
            },
        )?;
    }
    Ok(())
}

/// A stored, validated DQE with the given lot revenues.
async fn validated(service: &EstimateService, reference: &str, revenues: &[i64]) -> String {
    let dqe = service.create_dqe(new_dqe(reference)).await.unwrap();
    let id = dqe.id().to_string();
    service.edit(&id, |dqe| add_lots(dqe, revenues)).await.unwrap();
    service.validate_dqe(&id, "validator-1").await.unwrap();
    id
}

fn request(days: i64) -> ConversionRequest {
    ConversionRequest {
        start_date: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
        total_duration_days: days,
        duration_method: DurationMethod::Proportional,
        custom_durations: None,
        project_name: None,
        description: None,
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn project_count(service: &EstimateService) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM projects")
        .fetch_one(service.database().pool())
        .await
        .unwrap()
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_create_uses_configured_vat_rate() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let service = EstimateService::new(db, TaxRate::from_bps(1_000));

    let dqe = service.create_dqe(new_dqe("DQE-VAT-1")).await.unwrap();
    assert_eq!(dqe.header().vat_rate.bps(), 1_000);
    assert_eq!(dqe.status(), DqeStatus::Draft);

    let mut explicit = new_dqe("DQE-VAT-2");
    explicit.vat_rate = Some(TaxRate::zero());
    let dqe = service.create_dqe(explicit).await.unwrap();
    assert!(dqe.header().vat_rate.is_zero());
}

#[tokio::test]
async fn test_validate_freezes_totals() {
    let service = service().await;
    let id = validated(&service, "DQE-VAL-1", &[700_000, 300_000]).await;

    let dqe = service.load_dqe_with_hierarchy(&id).await.unwrap();
    assert_eq!(dqe.status(), DqeStatus::Validated);
    assert_eq!(dqe.header().validated_by.as_deref(), Some("validator-1"));
    assert!(dqe.header().validated_at.is_some());
    assert_eq!(dqe.total_ht(), Money::from_units(1_000_000));
    assert_eq!(dqe.header().vat_amount, Money::from_units(180_000));
    assert_eq!(dqe.header().total_ttc, Money::from_units(1_180_000));

    let err = service
        .edit(&id, |dqe| add_lots(dqe, &[5_000]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "immutable_state");
}

#[tokio::test]
async fn test_failed_validation_changes_nothing() {
    let service = service().await;
    let dqe = service.create_dqe(new_dqe("DQE-VAL-2")).await.unwrap();
    let id = dqe.id().to_string();
    service
        .edit(&id, |dqe| {
            add_lots(dqe, &[100_000])?;
            dqe.add_lot(NewLot {
                code: "VIDE".to_string(),
                name: "Lot sans chapitre".to_string(),
                description: None,
                ordre: None,
            })
        })
        .await
        .unwrap();

    let err = service.validate_dqe(&id, "validator-1").await.unwrap_err();
    assert_eq!(err.code(), "validation");

    let stored = service.load_dqe_with_hierarchy(&id).await.unwrap();
    assert_eq!(stored.status(), DqeStatus::Draft);
    assert!(stored.header().validated_by.is_none());
}

#[tokio::test]
async fn test_stale_edit_is_rejected() {
    let service = service().await;
    let dqe = service.create_dqe(new_dqe("DQE-VER-1")).await.unwrap();

    let mut stale = service.load_dqe_with_hierarchy(dqe.id()).await.unwrap();
    service
        .edit(dqe.id(), |dqe| add_lots(dqe, &[10_000]))
        .await
        .unwrap();

    stale.set_notes(Some("note".to_string())).unwrap();
    let err = service.save_dqe(&mut stale).await.unwrap_err();
    assert!(matches!(err, DbError::VersionConflict { .. }));
}

#[tokio::test]
async fn test_refuse_then_nothing_moves() {
    let service = service().await;
    let id = validated(&service, "DQE-REF-1", &[50_000]).await;

    let refused = service.refuse_dqe(&id).await.unwrap();
    assert_eq!(refused.status(), DqeStatus::Refused);

    assert_eq!(service.archive_dqe(&id).await.unwrap_err().code(), "invalid_state");
    let eligibility = service.can_convert(&id).await.unwrap();
    assert_eq!(eligibility.reason, Some(NotConvertibleReason::NotValidated));
}

// =============================================================================
// Déboursé
// =============================================================================

#[tokio::test]
async fn test_debourse_crud_returns_recomputed_item() {
    let service = service().await;
    let dqe = service.create_dqe(new_dqe("DQE-DEB-1")).await.unwrap();
    let (dqe, ()) = service
        .edit(dqe.id(), |dqe| add_lots(dqe, &[100_000]))
        .await
        .unwrap();
    let item_id = dqe.items().next().unwrap().id.clone();

    let report = service
        .create_line(
            &item_id,
            NewDebourseLine {
                expense_type: ExpenseType::Materials,
                designation: "Ciment".to_string(),
                unit: "sac".to_string(),
                quantity: Quantity::from_units(10),
                unit_price_ht: Money::from_units(2_500),
                coefficient: Some(Coefficient::from_ten_thousandths(12_000)),
            },
        )
        .await
        .unwrap();
    assert_eq!(report.item.debourse_sec, Money::from_units(30_000));
    assert_eq!(report.margin.margin, Money::from_units(70_000));
    let line_id = report.item.debourse_lines[0].id.clone();

    let report = service
        .update_line(
            &item_id,
            &line_id,
            DebourseLineUpdate {
                quantity: Some(Quantity::from_units(20)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.item.debourse_sec, Money::from_units(60_000));
    assert_eq!(
        report.recapitulatif.entry(ExpenseType::Materials).map(|e| e.subtotal),
        Some(Money::from_units(60_000))
    );

    let report = service.delete_line(&item_id, &line_id).await.unwrap();
    assert!(report.item.debourse_lines.is_empty());
    assert_eq!(report.item.debourse_sec, Money::zero());

    let err = service.delete_line(&item_id, &line_id).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn test_debourse_editable_after_validation_not_after_archive() {
    let service = service().await;
    let id = validated(&service, "DQE-DEB-2", &[100_000]).await;
    let dqe = service.load_dqe_with_hierarchy(&id).await.unwrap();
    let item_id = dqe.items().next().unwrap().id.clone();

    let line = || NewDebourseLine {
        expense_type: ExpenseType::Labor,
        designation: "Maçon".to_string(),
        unit: "h".to_string(),
        quantity: Quantity::from_units(8),
        unit_price_ht: Money::from_units(1_500),
        coefficient: None,
    };

    let report = service.create_line(&item_id, line()).await.unwrap();
    assert_eq!(report.item.debourse_sec, Money::from_units(12_000));

    let summary = service.margin_summary(&id).await.unwrap();
    assert_eq!(summary.debourse_sec, Money::from_units(12_000));
    assert_eq!(summary.margin, Money::from_units(88_000));

    service.archive_dqe(&id).await.unwrap();
    let err = service.create_line(&item_id, line()).await.unwrap_err();
    assert_eq!(err.code(), "immutable_state");
}

// =============================================================================
// Conversion
// =============================================================================

#[tokio::test]
async fn test_convert_creates_project_and_stages() {
    let service = service().await;
    let id = validated(&service, "DQE-CNV-1", &[700_000, 300_000]).await;

    let preview = service.get_conversion_preview(&id, &request(30)).await.unwrap();
    assert_eq!(preview.stages[0].duration_days, 21);
    assert_eq!(preview.stages[1].duration_days, 9);
    assert_eq!(project_count(&service).await, 0);

    let outcome = service
        .convert_to_project(&id, &request(30), "user-2")
        .await
        .unwrap();
    assert_eq!(outcome.project.id, outcome.project_id);
    assert_eq!(outcome.project.name, "Immeuble R+2");
    assert_eq!(outcome.project.initial_budget, Money::from_units(1_000_000));
    assert_eq!(outcome.project.planned_end_date, date(2024, 5, 1));
    assert!(outcome.adjustments.is_empty());

    let stages = service.get_stages(&outcome.project_id).await.unwrap();
    assert_eq!(stages, outcome.stages);
    assert_eq!(stages[0].start_date, date(2024, 4, 1));
    assert_eq!(stages[0].planned_end_date, date(2024, 4, 22));
    assert_eq!(stages[1].start_date, date(2024, 4, 22));
    assert_eq!(stages[1].planned_budget, Money::from_units(300_000));
    assert_eq!(stages.iter().map(|s| s.duration_days).sum::<i64>(), 30);

    let dqe = service.load_dqe_with_hierarchy(&id).await.unwrap();
    assert!(dqe.is_converted());
    assert_eq!(dqe.header().linked_project_id.as_deref(), Some(outcome.project_id.as_str()));
    assert_eq!(dqe.header().converted_by.as_deref(), Some("user-2"));
    assert!(dqe.header().converted_at.is_some());
    assert_eq!(
        service.conversion_status(&id).await.unwrap(),
        ConversionStatus::Converted
    );

    let project = service.get_project(&outcome.project_id).await.unwrap();
    assert_eq!(project, outcome.project);
}

#[tokio::test]
async fn test_second_conversion_is_already_converted() {
    let service = service().await;
    let id = validated(&service, "DQE-CNV-2", &[400_000, 100_000]).await;

    service
        .convert_to_project(&id, &request(20), "user-2")
        .await
        .unwrap();
    let err = service
        .convert_to_project(&id, &request(20), "user-2")
        .await
        .unwrap_err();

    assert_eq!(err.code(), "already_converted");
    assert_eq!(project_count(&service).await, 1);
}

#[tokio::test]
async fn test_draft_conversion_writes_nothing() {
    let service = service().await;
    let dqe = service.create_dqe(new_dqe("DQE-CNV-3")).await.unwrap();
    service
        .edit(dqe.id(), |dqe| add_lots(dqe, &[250_000]))
        .await
        .unwrap();

    let err = service
        .convert_to_project(dqe.id(), &request(10), "user-2")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_convertible");
    assert_eq!(project_count(&service).await, 0);

    let stored = service.load_dqe_with_hierarchy(dqe.id()).await.unwrap();
    assert!(!stored.is_converted());
    assert_eq!(
        service.conversion_status(dqe.id()).await.unwrap(),
        ConversionStatus::NotConvertible
    );
}

#[tokio::test]
async fn test_too_short_duration_is_rejected() {
    let service = service().await;
    let id = validated(&service, "DQE-CNV-4", &[1, 1, 1]).await;

    let err = service
        .convert_to_project(&id, &request(2), "user-2")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation");
    assert_eq!(project_count(&service).await, 0);
    assert!(!service.load_dqe_with_hierarchy(&id).await.unwrap().is_converted());
}

#[tokio::test]
async fn test_custom_durations_report_adjustments() {
    let service = service().await;
    let id = validated(&service, "DQE-CNV-5", &[200_000, 200_000]).await;
    let dqe = service.load_dqe_with_hierarchy(&id).await.unwrap();
    let lot_ids: Vec<String> = dqe.lots().map(|l| l.id.clone()).collect();

    let mut custom = BTreeMap::new();
    custom.insert(lot_ids[0].clone(), 20);
    custom.insert(lot_ids[1].clone(), 20);
    let mut req = request(30);
    req.duration_method = DurationMethod::Custom;
    req.custom_durations = Some(custom);

    let outcome = service.convert_to_project(&id, &req, "user-2").await.unwrap();
    let days: Vec<i64> = outcome.stages.iter().map(|s| s.duration_days).collect();
    assert_eq!(days, vec![20, 10]);
    assert_eq!(outcome.adjustments.len(), 1);
    assert_eq!(outcome.adjustments[0].lot_id, lot_ids[1]);
    assert_eq!(outcome.adjustments[0].calculated_days, 20);
    assert_eq!(outcome.adjustments[0].final_days, 10);
}

#[tokio::test]
async fn test_converted_dqe_rejects_every_change() {
    let service = service().await;
    let id = validated(&service, "DQE-CNV-6", &[90_000]).await;
    service
        .convert_to_project(&id, &request(5), "user-2")
        .await
        .unwrap();

    let err = service
        .edit(&id, |dqe| dqe.set_notes(Some("après conversion".to_string())))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "immutable_state");
    assert_eq!(service.archive_dqe(&id).await.unwrap_err().code(), "immutable_state");
    assert_eq!(service.delete_dqe(&id).await.unwrap_err().code(), "immutable_state");
}

/// Round-trips a stored DQE through its JSON document, applying `change`.
fn rewrite_document(dqe: &Dqe, change: impl FnOnce(&mut serde_json::Value)) -> Dqe {
    let mut document = serde_json::to_value(dqe).unwrap();
    change(&mut document);
    serde_json::from_value(document).unwrap()
}

#[tokio::test]
async fn test_saving_a_reopened_converted_document_fails() {
    let service = service().await;
    let id = validated(&service, "DQE-CNV-7", &[90_000]).await;
    let outcome = service
        .convert_to_project(&id, &request(5), "user-2")
        .await
        .unwrap();

    let stored = service.load_dqe_with_hierarchy(&id).await.unwrap();
    let mut forged = rewrite_document(&stored, |document| {
        document["isConverted"] = serde_json::json!(false);
        document["linkedProjectId"] = serde_json::Value::Null;
        document["statut"] = serde_json::json!("brouillon");
        document["postes"][0]["prixUnitaireHT"] = serde_json::json!(5);
    });
    assert!(!forged.is_converted());

    let err = service.save_dqe(&mut forged).await.unwrap_err();
    assert_eq!(err.code(), "immutable_state");

    let reloaded = service.load_dqe_with_hierarchy(&id).await.unwrap();
    assert!(reloaded.is_converted());
    assert_eq!(
        reloaded.header().linked_project_id.as_deref(),
        Some(outcome.project_id.as_str())
    );
    assert_eq!(reloaded.status(), DqeStatus::Validated);
    assert_eq!(reloaded.total_ht(), Money::from_units(90_000));
}

#[tokio::test]
async fn test_saving_a_validated_document_keeps_the_frozen_tree() {
    let service = service().await;
    let id = validated(&service, "DQE-VAL-4", &[60_000, 40_000]).await;
    let stored = service.load_dqe_with_hierarchy(&id).await.unwrap();

    let mut repriced = rewrite_document(&stored, |document| {
        document["postes"][0]["prixUnitaireHT"] = serde_json::json!(5);
    });
    let err = service.save_dqe(&mut repriced).await.unwrap_err();
    assert_eq!(err.code(), "immutable_state");

    let mut reopened = rewrite_document(&stored, |document| {
        document["statut"] = serde_json::json!("brouillon");
    });
    let err = service.save_dqe(&mut reopened).await.unwrap_err();
    assert_eq!(err.code(), "invalid_state");

    let mut self_converted = stored.clone();
    self_converted
        .mark_converted("project-x", "user-2", chrono::Utc::now())
        .unwrap();
    let err = service.save_dqe(&mut self_converted).await.unwrap_err();
    assert_eq!(err.code(), "immutable_state");

    let reloaded = service.load_dqe_with_hierarchy(&id).await.unwrap();
    assert!(!reloaded.is_converted());
    assert_eq!(reloaded.status(), DqeStatus::Validated);
    assert_eq!(reloaded.total_ht(), Money::from_units(100_000));
    assert_eq!(reloaded.header().version, stored.header().version);
    assert_eq!(project_count(&service).await, 0);
}

#[tokio::test]
async fn test_saving_a_draft_document_as_validated_needs_a_valid_tree() {
    let service = service().await;
    let dqe = service.create_dqe(new_dqe("DQE-VAL-5")).await.unwrap();

    let mut forged = rewrite_document(&dqe, |document| {
        document["statut"] = serde_json::json!("valide");
        document["validePar"] = serde_json::json!("validator-1");
        document["dateValidation"] = serde_json::json!("2024-03-01T08:00:00Z");
    });
    let err = service.save_dqe(&mut forged).await.unwrap_err();
    assert_eq!(err.code(), "validation");

    let reloaded = service.load_dqe_with_hierarchy(dqe.id()).await.unwrap();
    assert_eq!(reloaded.status(), DqeStatus::Draft);
}

#[tokio::test]
async fn test_list_and_statistics_follow_conversion() {
    let service = service().await;
    let converted = validated(&service, "DQE-STA-1", &[600_000]).await;
    validated(&service, "DQE-STA-2", &[150_000]).await;
    service.create_dqe(new_dqe("DQE-STA-3")).await.unwrap();
    service
        .convert_to_project(&converted, &request(10), "user-2")
        .await
        .unwrap();

    let list = service.list_dqes(None).await.unwrap();
    assert_eq!(list.len(), 3);
    let row = list.iter().find(|row| row.id == converted).unwrap();
    assert_eq!(row.conversion_status, ConversionStatus::Converted);
    assert!(row.linked_project_id.is_some());

    let stats = service.statistics().await.unwrap();
    assert_eq!(stats.total_count, 3);
    assert_eq!(stats.converted_count, 1);
    assert_eq!(stats.convertible_count, 1);
    assert_eq!(stats.not_convertible_count, 1);
    assert_eq!(stats.count_for(DqeStatus::Validated), 2);
    assert_eq!(stats.count_for(DqeStatus::Draft), 1);
    assert_eq!(stats.converted_revenue_ht, Money::from_units(600_000));
    assert_eq!(stats.total_revenue_ht, Money::from_units(750_000));
}

// =============================================================================
// Concurrency
// =============================================================================

/// Deletes the database file and its WAL companions on drop.
struct TempDb(PathBuf);

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.0.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(path);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_conversions_yield_one_project() {
    let temp = TempDb(std::env::temp_dir().join(format!("batiplan-{}.db", uuid::Uuid::new_v4())));
    let db = Database::new(DbConfig::new(temp.0.clone()).max_connections(4))
        .await
        .unwrap();
    let service = EstimateService::new(db, TaxRate::from_bps(1_800));
    let id = validated(&service, "DQE-RACE-1", &[700_000, 300_000]).await;

    let first = service.clone();
    let second = service.clone();
    let req = request(30);
    let (a, b) = tokio::join!(
        first.convert_to_project(&id, &req, "user-a"),
        second.convert_to_project(&id, &req, "user-b"),
    );

    let outcomes = [a, b];
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(loser.code(), "already_converted");
    assert_eq!(project_count(&service).await, 1);

    let dqe = service.load_dqe_with_hierarchy(&id).await.unwrap();
    let winner = outcomes.iter().find_map(|r| r.as_ref().ok()).unwrap();
    assert_eq!(dqe.header().linked_project_id.as_deref(), Some(winner.project_id.as_str()));

    service.database().close().await;
}
