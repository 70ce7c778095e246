use std::fs;

use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use replrs::json::{create_json_output, JsonDocument, JsonOutput};
use replrs::{ReplicationError, ReplicationJsonBuilder, Settings, TableInput};

fn table(table_id: &str, column: u32, n: usize, seed: u64) -> TableInput {
    let mut rng = SmallRng::seed_from_u64(seed);
    let y = DVector::from_fn(n, |_, _| rng.gen_range(0.5..20.0));
    let x = DMatrix::from_fn(n, 3, |_, j| if j == 0 { 1.0 } else { rng.gen::<f64>() });
    TableInput::new(table_id, column, y, x, 1usize)
}

#[test]
fn saved_document_loads_back_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let n = 25;
    let mut builder = ReplicationJsonBuilder::new("058").with_output_dir(dir.path().join("json"));
    builder
        .add_table(
            table("4", 2, n, 1)
                .fixed_effects(DMatrix::from_fn(n, 2, |i, j| ((i + j) % 2) as f64), vec![3, 4])
                .instruments(DMatrix::from_fn(n, 1, |i, _| i as f64 / 7.0), vec![5])
                .elasticity(true),
        )
        .unwrap();
    builder.add_table(table("5", 1, n, 2).binary(true)).unwrap();

    let path = builder.save(None).unwrap();
    assert_eq!(path, dir.path().join("json").join("058.json"));

    let loaded = JsonDocument::load(&path).unwrap();
    assert_eq!(loaded, builder.document());
    assert_eq!(loaded.tables[0].x.len(), 6);
    assert_eq!(loaded.tables[0].fes, vec![3, 4]);
    assert_eq!(loaded.tables[0].ivs, vec![5]);
    assert!(!path.with_extension("json.partial").exists());
}

#[test]
fn tables_keep_insertion_order() {
    let mut builder = ReplicationJsonBuilder::new("066");
    builder.add_table(table("3", 4, 10, 3)).unwrap();
    builder.add_table(table("1", 1, 12, 4)).unwrap();
    builder.add_table(table("3", 2, 8, 5)).unwrap();

    let order: Vec<(&str, u32)> = builder
        .tables()
        .iter()
        .map(|entry| (entry.table_id.as_str(), entry.column))
        .collect();
    assert_eq!(order, vec![("3", 4), ("1", 1), ("3", 2)]);
}

#[test]
fn checkpointing_rewrites_after_each_table() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = ReplicationJsonBuilder::new("012")
        .with_output_dir(dir.path())
        .with_checkpointing(true);
    builder.add_table(table("2", 1, 6, 6)).unwrap();
    let path = dir.path().join("012.json");
    assert_eq!(JsonDocument::load(&path).unwrap().tables.len(), 1);

    builder.add_table(table("2", 2, 6, 7)).unwrap();
    assert_eq!(JsonDocument::load(&path).unwrap().tables.len(), 2);
}

#[test]
fn settings_file_drives_output_location() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.yaml");
    let output = dir.path().join("exports");
    fs::write(
        &config,
        format!("rawdata: raw\noutputdata: {}\n", output.display()),
    )
    .unwrap();

    let settings = Settings::load(&config).unwrap();
    assert_eq!(settings.output, output);
    let saved = create_json_output("077", table("1", 3, 5, 8), &settings, true, Some("t1.json"))
        .unwrap();
    match saved {
        JsonOutput::Saved(path) => assert_eq!(path, output.join("t1.json")),
        JsonOutput::Document(_) => panic!("document was not saved"),
    }
}

#[test]
fn misaligned_instruments_are_rejected() {
    let mut builder = ReplicationJsonBuilder::new("058");
    let result = builder.add_table(
        table("4", 1, 10, 9).instruments(DMatrix::from_element(9, 1, 1.0), vec![3]),
    );
    assert!(matches!(
        result,
        Err(ReplicationError::DimensionMismatch { context: "z rows", .. })
    ));
}
