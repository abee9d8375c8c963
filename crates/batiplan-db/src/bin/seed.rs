//! # Seed Data Generator
//!
//! Loads a sample estimate into the database, validates it, prints its
//! conversion preview and optionally converts it.
//!
//! ## Usage
//! ```bash
//! # Sample DQE in ./batiplan.db (or BATIPLAN_DATABASE_PATH)
//! cargo run -p batiplan-db --bin seed
//!
//! # Plan over 120 days starting on a given date, then convert
//! cargo run -p batiplan-db --bin seed -- --days 120 --start 2024-04-01 --convert
//!
//! # Specify database path
//! cargo run -p batiplan-db --bin seed -- --db ./data/batiplan.db
//! ```
//!
//! ## Generated Estimate
//! A small villa in three lots (gros oeuvre, charpente-couverture, second
//! oeuvre), each item with a few déboursé lines so the margin summary is not
//! empty.

use batiplan_core::debourse::NewDebourseLine;
use batiplan_core::hierarchy::{NewChapter, NewDqe, NewItem, NewLot};
use batiplan_core::{Coefficient, ConversionRequest, DurationMethod, ExpenseType, Money, Quantity};
use batiplan_db::{AppConfig, Database, EstimateService};
use chrono::{NaiveDate, Utc};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// (expense type, designation, unit, quantity in thousandths, unit price, coefficient e4)
type SampleLine = (ExpenseType, &'static str, &'static str, i64, i64, i64);

/// (code, designation, unit, quantity in thousandths, unit price, lines)
type SampleItem = (&'static str, &'static str, &'static str, i64, i64, &'static [SampleLine]);

/// (code, name, chapters)
type SampleLot = (&'static str, &'static str, &'static [(&'static str, &'static str, &'static [SampleItem])]);

const SAMPLE: &[SampleLot] = &[
    (
        "GO",
        "Gros oeuvre",
        &[
            (
                "GO.1",
                "Terrassements",
                &[(
                    "GO.1.1",
                    "Fouilles en rigole",
                    "m3",
                    38_500,
                    6_500,
                    &[
                        (ExpenseType::Labor, "Manoeuvres", "h", 96_000, 1_250, 10_000),
                        (ExpenseType::Equipment, "Mini-pelle", "j", 2_000, 45_000, 10_000),
                    ],
                )],
            ),
            (
                "GO.2",
                "Fondations",
                &[
                    (
                        "GO.2.1",
                        "Béton de propreté dosé à 150 kg",
                        "m3",
                        4_200,
                        62_000,
                        &[(ExpenseType::Materials, "Ciment CPJ 35", "t", 630, 98_000, 10_500)],
                    ),
                    (
                        "GO.2.2",
                        "Béton armé pour semelles",
                        "m3",
                        12_800,
                        185_000,
                        &[
                            (ExpenseType::Materials, "Ciment CPJ 45", "t", 4_480, 105_000, 10_500),
                            (ExpenseType::Materials, "Acier HA", "kg", 1_024_000, 850, 10_000),
                            (ExpenseType::Labor, "Ferrailleurs", "h", 160_000, 1_750, 10_000),
                        ],
                    ),
                ],
            ),
        ],
    ),
    (
        "CC",
        "Charpente - Couverture",
        &[(
            "CC.1",
            "Couverture",
            &[(
                "CC.1.1",
                "Tôles bac alu 6/10",
                "m2",
                142_000,
                14_500,
                &[
                    (ExpenseType::Materials, "Tôles bac alu", "m2", 149_100, 8_200, 10_000),
                    (ExpenseType::Subcontract, "Pose couvreur", "m2", 142_000, 2_500, 10_000),
                ],
            )],
        )],
    ),
    (
        "SO",
        "Second oeuvre",
        &[
            (
                "SO.1",
                "Menuiseries",
                &[(
                    "SO.1.1",
                    "Portes isoplanes",
                    "u",
                    9_000,
                    95_000,
                    &[(ExpenseType::Subcontract, "Menuisier", "u", 9_000, 72_000, 10_000)],
                )],
            ),
            (
                "SO.2",
                "Peinture",
                &[(
                    "SO.2.1",
                    "Peinture vinylique intérieure",
                    "m2",
                    410_000,
                    2_800,
                    &[
                        (ExpenseType::Materials, "Peinture vinylique", "kg", 123_000, 3_500, 10_000),
                        (ExpenseType::Labor, "Peintres", "h", 120_000, 1_500, 10_000),
                        (ExpenseType::Other, "Petit matériel", "ens", 1_000, 25_000, 10_000),
                    ],
                )],
            ),
        ],
    ),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = AppConfig::from_env()?;

    // Parse command line arguments
    let args: Vec<String> = env::args().collect();

    let mut total_days: i64 = 90;
    let mut start_date = Utc::now().date_naive();
    let mut method = DurationMethod::Proportional;
    let mut convert = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    config.database_path = args[i + 1].clone().into();
                    i += 1;
                }
            }
            "--days" => {
                if i + 1 < args.len() {
                    total_days = args[i + 1].parse().unwrap_or(90);
                    i += 1;
                }
            }
            "--start" => {
                if i + 1 < args.len() {
                    start_date = NaiveDate::parse_from_str(&args[i + 1], "%Y-%m-%d")?;
                    i += 1;
                }
            }
            "--equal" => method = DurationMethod::Equal,
            "--convert" => convert = true,
            "--help" | "-h" => {
                println!("Batiplan Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>        Database file path (default: BATIPLAN_DATABASE_PATH or ./batiplan.db)");
                println!("      --days <N>         Project duration in days (default: 90)");
                println!("      --start <DATE>     Project start date, YYYY-MM-DD (default: today)");
                println!("      --equal            Split days equally instead of by budget");
                println!("      --convert          Convert the sample DQE into a project");
                println!("  -h, --help             Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 Batiplan Seed Data Generator");
    println!("===============================");
    println!("Database: {}", config.database_path.display());
    println!("Currency: {}", config.currency_code);
    println!();

    let db = Database::new(config.db_config()).await?;
    let service = EstimateService::from_config(db, &config);

    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let reference = format!("DQE-{}", Utc::now().format("%Y%m%d-%H%M%S"));
    let dqe = service
        .create_dqe(NewDqe {
            reference: reference.clone(),
            name: "Villa F4 - Cocody".to_string(),
            client: Some("SCI Les Palmiers".to_string()),
            description: Some("Construction d'une villa basse de 4 pièces".to_string()),
            vat_rate: None,
            created_by: "seed".to_string(),
        })
        .await?;
    let dqe_id = dqe.id().to_string();

    let (dqe, ()) = service.edit(&dqe_id, build_sample).await?;
    info!(dqe_id = %dqe_id, items = dqe.item_count(), "Sample tree stored");

    let dqe = service.validate_dqe(&dqe_id, "seed").await?;
    println!();
    println!("✓ {} validated", reference);
    println!("  Total HT:  {} {}", dqe.header().total_ht, config.currency_code);
    println!("  TVA:       {} {}", dqe.header().vat_amount, config.currency_code);
    println!("  Total TTC: {} {}", dqe.header().total_ttc, config.currency_code);

    let margin = service.margin_summary(&dqe_id).await?;
    println!(
        "  Déboursé sec: {} {} (marge {:.1}%)",
        margin.debourse_sec, config.currency_code, margin.margin_rate
    );

    let request = ConversionRequest {
        start_date,
        total_duration_days: total_days,
        duration_method: method,
        custom_durations: None,
        project_name: None,
        description: None,
    };

    let preview = service.get_conversion_preview(&dqe_id, &request).await?;
    println!();
    println!("Conversion preview:");
    println!("{}", serde_json::to_string_pretty(&preview)?);

    if convert {
        let outcome = service.convert_to_project(&dqe_id, &request, "seed").await?;
        println!();
        println!(
            "✓ Project {} created with {} stages",
            outcome.project_id,
            outcome.stages.len()
        );
    }

    println!();
    println!("✓ Seed complete!");

    Ok(())
}

/// Adds the sample lots, chapters, items and déboursé lines.
fn build_sample(dqe: &mut batiplan_core::Dqe) -> batiplan_core::CoreResult<()> {
    for (lot_code, lot_name, chapters) in SAMPLE {
        let lot_id = dqe.add_lot(NewLot {
            code: lot_code.to_string(),
            name: lot_name.to_string(),
            description: None,
            ordre: None,
        })?;

        for (chapter_code, chapter_name, items) in chapters.iter() {
            let chapter_id = dqe.add_chapter(
                &lot_id,
                NewChapter {
                    code: chapter_code.to_string(),
                    name: chapter_name.to_string(),
                    ordre: None,
                },
            )?;

            for (code, designation, unit, milli, price, lines) in items.iter() {
                let item_id = dqe.add_item(
                    &chapter_id,
                    NewItem {
                        code: code.to_string(),
                        designation: designation.to_string(),
                        unit: unit.to_string(),
                        quantity: Quantity::from_milli(*milli),
                        unit_price_ht: Money::from_units(*price),
                        ordre: None,
                    },
                )?;

                for (expense_type, line_designation, line_unit, line_milli, line_price, coef) in
                    lines.iter()
                {
                    dqe.create_debourse_line(
                        &item_id,
                        NewDebourseLine {
                            expense_type: *expense_type,
                            designation: line_designation.to_string(),
                            unit: line_unit.to_string(),
                            quantity: Quantity::from_milli(*line_milli),
                            unit_price_ht: Money::from_units(*line_price),
                            coefficient: Some(Coefficient::from_ten_thousandths(*coef)),
                        },
                    )?;
                }
            }
        }
    }
    Ok(())
}
