mod common;

use std::fs;

use assert_cmd::Command;
use common::{CONTACTS_MAPPING, TestWorkspace};
use predicates::prelude::*;
use predicates::str::contains;

fn loader() -> Command {
    let mut cmd = Command::cargo_bin("crm-stage-loader").expect("binary exists");
    cmd.env_remove("DATABASE_URL").env("RUST_LOG", "off");
    cmd
}

#[test]
fn lists_available_mappings() {
    let ws = TestWorkspace::new();
    let dir = ws.mapping("contacts", CONTACTS_MAPPING);
    ws.mapping("jobs", "target_object: jobs_and_placements\n");
    ws.write("Mappings/README.txt", "not a mapping");

    loader()
        .args(["--mappings-dir", dir.to_str().unwrap(), "mappings"])
        .assert()
        .success()
        .stdout("contacts\njobs\n");
}

#[test]
fn show_mapping_reports_mode_and_columns() {
    let ws = TestWorkspace::new();
    let dir = ws.mapping("contacts", CONTACTS_MAPPING);

    loader()
        .args(["--mappings-dir", dir.to_str().unwrap(), "show-mapping", "-m", "contacts"])
        .assert()
        .success()
        .stdout(contains("staging.contacts"))
        .stdout(contains("upsert on (contact_sfid)"))
        .stdout(contains("trim|boolean"));
}

#[test]
fn validate_passes_clean_export() {
    let ws = TestWorkspace::new();
    let dir = ws.mapping("contacts", CONTACTS_MAPPING);
    let input = ws.write(
        "contacts.csv",
        "Contact ID,First Name,Email Opt Out,Created\n003A,Ann,Y,\n003B,Bob,N,\n",
    );

    loader()
        .args([
            "--mappings-dir",
            dir.to_str().unwrap(),
            "validate",
            "-m",
            "contacts",
            "-i",
            input.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(contains("QA validation PASSED"))
        .stdout(contains("rows:         2"));
}

#[test]
fn validate_exits_with_two_on_duplicates() {
    let ws = TestWorkspace::new();
    let dir = ws.mapping("contacts", CONTACTS_MAPPING);
    let input = ws.write(
        "contacts.csv",
        "Contact ID,First Name,Email Opt Out,Created\n003A,Ann,Y,\n003A,Ann,Y,\n",
    );

    let output = loader()
        .args([
            "--mappings-dir",
            dir.to_str().unwrap(),
            "validate",
            "-m",
            "contacts",
            "-i",
            input.to_str().unwrap(),
            "--json",
        ])
        .assert()
        .code(2)
        .stderr(contains("QA validation failed"))
        .get_output()
        .stdout
        .clone();

    let report: serde_json::Value = serde_json::from_slice(&output).expect("json report");
    assert_eq!(report["stats"]["duplicates"], 1);
    assert_eq!(report["stats"]["total_rows"], 2);
    assert_eq!(report["duplicate_keys"][0]["occurrences"], 2);
}

#[test]
fn transform_is_reproducible_with_fixed_extract_timestamp() {
    let ws = TestWorkspace::new();
    let dir = ws.mapping("contacts", CONTACTS_MAPPING);
    let input = ws.write_bytes(
        "contacts.csv",
        b"Contact ID,First Name,Email Opt Out,Created\n003A, Ren\xe9e ,yes,2024-03-07\n003B,,N/A,\n",
    );
    let first = ws.path().join("first.csv");
    let second = ws.path().join("second.csv");

    for output in [&first, &second] {
        loader()
            .args([
                "--mappings-dir",
                dir.to_str().unwrap(),
                "transform",
                "-m",
                "contacts",
                "-i",
                input.to_str().unwrap(),
                "-o",
                output.to_str().unwrap(),
                "--partition-date",
                "2024-03-07",
                "--file-name",
                "contacts.csv",
                "--extract-ts",
                "2024-03-07T06:00:00Z",
            ])
            .assert()
            .success()
            .stdout(contains("2 row(s) written"));
    }

    let contents = fs::read_to_string(&first).unwrap();
    assert_eq!(contents, fs::read_to_string(&second).unwrap());
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(
        lines[0],
        "contact_sfid,first_name,email_opt_out,created_at,_partition_date,_file_name,_source_report,_extract_ts"
    );
    assert_eq!(
        lines[1],
        "003A,Renée,true,2024-03-07T00:00:00+00:00,2024-03-07,contacts.csv,Contacts Daily,2024-03-07T06:00:00.000000+00:00"
    );
    assert_eq!(
        lines[2],
        "003B,,,,2024-03-07,contacts.csv,Contacts Daily,2024-03-07T06:00:00.000000+00:00"
    );
}

#[test]
fn unknown_mapping_fails_with_status_one() {
    let ws = TestWorkspace::new();
    let dir = ws.mapping("contacts", CONTACTS_MAPPING);
    let input = ws.write("contacts.csv", "Contact ID\n1\n");

    loader()
        .args([
            "--mappings-dir",
            dir.to_str().unwrap(),
            "validate",
            "-m",
            "missing",
            "-i",
            input.to_str().unwrap(),
        ])
        .assert()
        .code(1)
        .stderr(contains("mapping 'missing' not found"));
}

#[test]
fn database_commands_require_a_url() {
    loader()
        .args(["history"])
        .assert()
        .code(1)
        .stderr(contains("no database url").and(contains("DATABASE_URL")));
}
