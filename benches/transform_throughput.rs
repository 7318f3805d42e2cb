use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use chrono::{NaiveDate, TimeZone, Utc};
use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use crm_stage_loader::mapping::MappingSpec;
use crm_stage_loader::transform::{TransformContext, Transformer};
use crm_stage_loader::validate::Validator;
use tempfile::TempDir;

const ROWS: usize = 50_000;

const MAPPING: &str = r#"
target_object: contacts
columns:
  Contact ID: contact_sfid
  Full Name: full_name
  Opt Out: email_opt_out
  Created: created_at
  Lifetime Value: lifetime_value
coercions:
  full_name: trim
  email_opt_out: boolean
  created_at: timestamptz
  lifetime_value: numeric
natural_key: [contact_sfid]
"#;

fn generate_contacts(rows: usize) -> (TempDir, PathBuf) {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let csv_path = temp_dir.path().join("contacts.csv");
    let mut file = File::create(&csv_path).expect("create csv");
    writeln!(file, "Contact ID,Full Name,Opt Out,Created,Lifetime Value,Notes").expect("header");
    for i in 0..rows {
        let opt_out = if i % 2 == 0 { "Y" } else { "no" };
        let day = (i % 28) + 1;
        let hour = i % 12 + 1;
        writeln!(
            file,
            "003{i:08}, Contact {i} ,{opt_out},3/{day}/2024 {hour}:15 PM,\"${},{:03}.50\",n/a",
            i % 9 + 1,
            i % 1000
        )
        .expect("row");
    }
    (temp_dir, csv_path)
}

fn transform_benchmark(c: &mut Criterion) {
    let (dir, input) = generate_contacts(ROWS);
    let mapping = MappingSpec::from_yaml_str("contacts", MAPPING).expect("mapping");
    let context = TransformContext {
        partition_date: NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
        file_name: "contacts.csv".to_string(),
        source_report: "Bench".to_string(),
        extract_ts: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
    };

    let mut group = c.benchmark_group("contacts_50k");
    group.throughput(Throughput::Elements(ROWS as u64));
    group.sample_size(10);
    group.bench_function("transform", |b| {
        b.iter_batched(
            || dir.path().join("out.csv"),
            |output| {
                Transformer::new(&mapping)
                    .transform_file(&input, &output, &context)
                    .expect("transform")
            },
            BatchSize::SmallInput,
        )
    });
    group.bench_function("validate", |b| {
        b.iter(|| {
            Validator::new(&mapping)
                .validate_file(&input, None)
                .expect("validate")
        })
    });
    group.finish();
}

criterion_group!(benches, transform_benchmark);
criterion_main!(benches);
