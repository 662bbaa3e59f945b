//! File-level flows that need no external tools: catalog score file to variant-ID score
//! file, compressed kit to canonical genotypes, and score tables to a comparison.

use approx::assert_abs_diff_eq;
use flate2::Compression;
use flate2::write::GzEncoder;
use pgs_compare::config::PipelineConfig;
use pgs_compare::genotype_convert::normalize_genotype_file;
use pgs_compare::reformat::{NormalizeOptions, ScoreFileShape, normalize_score_file};
use pgs_compare::remap::{RemapOutcome, remap_score_file};
use pgs_compare::stats::{compare, retention_percent, summarize_table};
use pgs_compare::types::{KitType, RowPolicy};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

fn write_gz(path: &Path, text: &str) {
    let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap();
}

#[test]
fn catalog_download_becomes_a_variant_id_score_file() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("PGS000001.txt.gz");
    write_gz(
        &archive,
        "###PGS CATALOG SCORING FILE\n\
#pgs_id=PGS000001\n\
rsID\tchr_name\tchr_position\teffect_allele\tother_allele\teffect_weight\n\
rs1\tchr1\t100\tA\tG\t0.5\n\
rs2\t23\t200\tC\tT\t-0.25\n\
rs9\t5\t999\tT\tC\t0.3\n",
    );

    let normalized = dir.path().join("PGS000001.norm.tsv");
    let report = normalize_score_file(&archive, &normalized, &NormalizeOptions::default()).unwrap();
    assert_eq!(report.shape, ScoreFileShape::PositionKeyed);
    assert_eq!(report.rows_written, 3);

    let kit = dir.path().join("kit");
    fs::create_dir_all(&kit).unwrap();
    fs::write(
        kit.join("kit.pvar"),
        "##fileformat=PVARv1.0\n#CHROM\tPOS\tID\tREF\tALT\n1\t100\trs1\tG\tA\nX\t200\trs2\tT\tC\n5\t999\t.\tC\tT\n",
    )
    .unwrap();

    let outcome = remap_score_file(&normalized, &kit, &dir.path().join("out")).unwrap();
    let RemapOutcome::Remapped {
        path,
        kept,
        unmapped,
    } = outcome
    else {
        panic!("expected a remapped file, got {outcome:?}");
    };
    assert_eq!((kept, unmapped), (2, 1));
    assert_eq!(path, dir.path().join("out").join("PGS000001.norm.rsid.score"));
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "rsID\teffect_allele\teffect_weight\nrs1\tA\t0.5\nrs2\tC\t-0.25\n"
    );

    // A variant-ID file is already scoreable and is handed back untouched.
    let again = remap_score_file(&path, &kit, &dir.path().join("out2")).unwrap();
    assert_eq!(again, RemapOutcome::Unchanged(path));
}

#[test]
fn compressed_23andme_kit_is_canonicalized() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("genome.txt.gz");
    write_gz(
        &raw,
        "# This data file generated by 23andMe\n\
# rsid\tchromosome\tposition\tgenotype\n\
rs1\t1\t100\tAG\n\
i700\tMT\t16000\tA\n\
rs2\tX\t200\t--\n",
    );
    let out = dir.path().join("genome_4col.txt");

    let report = normalize_genotype_file(&raw, &out, RowPolicy::Tolerant).unwrap();
    assert_eq!(report.kit_type, KitType::TwentyThreeAndMe);
    assert_eq!((report.rows_written, report.rows_dropped), (2, 1));
    assert_eq!(
        fs::read_to_string(&out).unwrap(),
        "rs1\t1\t100\tAG\nrs2\tX\t200\t--\n"
    );

    assert!(normalize_genotype_file(&raw, &out, RowPolicy::Strict).is_err());
}

#[test]
fn score_tables_reduce_to_a_comparison() {
    let dir = tempfile::tempdir().unwrap();
    let individual = dir.path().join("me.sscore");
    let population = dir.path().join("panel.sscore");
    fs::write(&individual, "#IID\tALLELE_CT\tSCORE1_SUM\nme\t4\t2\n").unwrap();
    fs::write(
        &population,
        "#IID\tALLELE_CT\tNAMED_ALLELE_DOSAGE_SUM\tSCORE1_AVG\tSCORE1_SUM\n\
a\t2\t1\t0.1\t0.2\nb\t2\t1\t0.3\t0.6\nc\t2\t1\t0.5\t1.0\n",
    )
    .unwrap();

    let user = summarize_table(&individual).unwrap();
    let panel = summarize_table(&population).unwrap();
    assert_abs_diff_eq!(user.mean, 0.5, epsilon = 1e-12);
    assert_abs_diff_eq!(panel.mean, 0.3, epsilon = 1e-12);
    assert_abs_diff_eq!(panel.sd, 0.2, epsilon = 1e-12);

    let cmp = compare(user.mean, &panel);
    assert_abs_diff_eq!(cmp.z_score.unwrap(), 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(cmp.percentile.unwrap(), 0.841_344_746, epsilon = 1e-6);

    let snplist = dir.path().join("PGS1.snplist");
    let normalized = dir.path().join("PGS1.norm.tsv");
    fs::write(&snplist, "rs1\nrs2\n").unwrap();
    fs::write(
        &normalized,
        "chr_name\tchr_position\teffect_allele\teffect_weight\n1\t1\tA\t1\n1\t2\tA\t1\n1\t3\tA\t1\n1\t4\tA\t1\n",
    )
    .unwrap();
    assert_abs_diff_eq!(retention_percent(&snplist, &normalized), 50.0, epsilon = 1e-12);
}

#[test]
fn configuration_file_overrides_only_what_it_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pgs-compare.toml");
    fs::write(
        &path,
        "data_dir = \"/srv/pgs/data\"\napply_exclusions = true\n\n[tools]\ntimeout_secs = 90\n",
    )
    .unwrap();

    let config = PipelineConfig::load(&path).unwrap();
    let defaults = PipelineConfig::default();
    assert_eq!(config.data_dir, Path::new("/srv/pgs/data"));
    assert!(config.apply_exclusions);
    assert_eq!(config.tool_timeout().as_secs(), 90);
    assert_eq!(config.tools.plink2, defaults.tools.plink2);
    assert_eq!(config.kit_store_path(), Path::new("/srv/pgs/data/kits.json"));
    assert_eq!(config.row_policy, RowPolicy::Tolerant);

    fs::write(&path, "workers = \"many\"\n").unwrap();
    assert!(PipelineConfig::load(&path).is_err());
}
