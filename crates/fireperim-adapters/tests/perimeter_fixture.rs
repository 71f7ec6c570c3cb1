use fireperim_adapters::load_response_file;

fn fixture_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/arcgis/perimeters_response.json")
}

#[test]
fn fixture_response_decodes_every_well_formed_feature() {
    let parsed = load_response_file(fixture_path()).expect("load fixture");

    assert_eq!(parsed.features.len(), 4);
    assert_eq!(parsed.skipped, 1);

    let multi_ring = parsed
        .features
        .iter()
        .find(|f| f.object_id() == Some(11))
        .expect("feature 11");
    assert_eq!(multi_ring.rings().len(), 3);
    assert_eq!(multi_ring.mission().as_deref(), Some("CA-BTU-PARK-N01"));

    let unassigned = parsed
        .features
        .iter()
        .find(|f| f.object_id() == Some(12))
        .expect("feature 12");
    assert_eq!(unassigned.mission(), None);
}

#[test]
fn missing_fixture_reports_the_path() {
    let err = load_response_file("does/not/exist.json").expect_err("missing file");
    assert!(format!("{err:#}").contains("does/not/exist.json"));
}
