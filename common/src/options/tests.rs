use super::*;
use crate::dirconfig::ConfiguredOption;
use crate::testutils::{list_names, setup_staging};
use crate::url::Scheme;
use tracing_test::traced_test;

fn job(lines: &[&str]) -> JobEntry {
    JobEntry {
        job_id: 0x1234,
        priority: 9,
        dir_index: 0,
        dir_id: 0xabcd,
        dir_alias: "in".to_string(),
        file_group: 0,
        filter: FileFilter::default(),
        local_options: lines
            .iter()
            .map(|line| ConfiguredOption {
                line: line.to_string(),
                option: LocalOption::parse(line).unwrap().unwrap(),
            })
            .collect(),
        standard_options: Vec::new(),
        schedules: Vec::new(),
        recipient: "ftp://u@h/x".to_string(),
        url: crate::url::parse("ftp://u@h/x").unwrap(),
        scheme: Scheme::Ftp,
        host_alias: "h".to_string(),
        host_index: 0,
        config_id: 1,
    }
}

async fn run(env: &PipelineEnv, job: &JobEntry, dir: &std::path::Path) -> (Summary, Vec<String>) {
    let batch = Batch::from_dir(dir).await.unwrap();
    let mut ctx = PipelineContext::new(env, job, dir.to_path_buf(), batch);
    let summary = apply(&mut ctx).await.unwrap();
    let mut names: Vec<String> = ctx.batch.names().map(str::to_string).collect();
    names.sort();
    // the batch must always describe the directory
    assert_eq!(names, list_names(dir).await);
    (summary, names)
}

fn env_with_rules(rules: &str) -> PipelineEnv {
    let env = PipelineEnv::default();
    env.set_rename_rules(RenameRules::parse(rules));
    env
}

#[test]
fn parses_option_lines() {
    assert_eq!(
        LocalOption::parse("rename daily overwrite"),
        Ok(Some(LocalOption::Rename {
            rule: "daily".to_string(),
            overwrite: true
        }))
    );
    assert_eq!(
        LocalOption::parse("prefix add X_"),
        Ok(Some(LocalOption::AddPrefix("X_".to_string())))
    );
    assert_eq!(
        LocalOption::parse("convert dos2unix"),
        Ok(Some(LocalOption::Convert(ConvertKind::Dos2Unix)))
    );
    assert_eq!(
        LocalOption::parse("wmo2ascii"),
        Ok(Some(LocalOption::Codec(CodecKind::Wmo2Ascii)))
    );
    assert!(matches!(
        LocalOption::parse("extract WMO SM*"),
        Ok(Some(LocalOption::Extract {
            framing: ExtractFraming::Wmo,
            filter: Some(_)
        }))
    ));
    assert!(matches!(
        LocalOption::parse("assemble ascii out_%n"),
        Ok(Some(LocalOption::Assemble {
            framing: AssembleFraming::Ascii,
            ..
        }))
    ));
    assert_eq!(LocalOption::parse("archive 3"), Ok(None));
    assert!(LocalOption::parse("rename").is_err());
    assert!(LocalOption::parse("basename now").is_err());
    assert!(LocalOption::parse("prefix swap x").is_err());
    assert!(LocalOption::parse("toupper please").is_err());
    assert!(LocalOption::parse("extract BOGUS").is_err());
    assert!(LocalOption::parse("assemble VAX").is_err());
}

#[tokio::test]
async fn rename_rule_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    setup_staging(tmp.path(), &[("report_001.dat", b"r"), ("other", b"o")]).await;
    let env = env_with_rules("[daily_rule]\nreport_* out_*\n");
    let job = job(&["rename daily_rule"]);
    let (summary, names) = run(&env, &job, tmp.path()).await;
    assert_eq!(names, ["other", "out_001.dat"]);
    assert_eq!(summary.files_renamed, 1);
    assert_eq!(summary.warnings, 0);
}

#[tokio::test]
async fn rename_collision_appends_suffix() {
    let tmp = tempfile::tempdir().unwrap();
    setup_staging(tmp.path(), &[("a1", b"1"), ("a2", b"2"), ("b", b"b")]).await;
    let env = env_with_rules("[r]\na* b\n");
    let (summary, names) = run(&env, &job(&["rename r"]), tmp.path()).await;
    assert_eq!(names, ["b", "b-0", "b-1"]);
    assert_eq!(summary.files_renamed, 2);
    assert_eq!(tokio::fs::read(tmp.path().join("b")).await.unwrap(), b"b");
}

#[tokio::test]
#[traced_test]
async fn rename_overwrite_removes_exactly_one() {
    let tmp = tempfile::tempdir().unwrap();
    let log_path = tmp.path().join("delete.log");
    let staging = tmp.path().join("staging");
    setup_staging(&staging, &[("a1", b"1"), ("a2", b"2"), ("c", b"c")]).await;
    let env = PipelineEnv {
        delete_log: LineLog::open(Some(log_path.as_path())).await.unwrap(),
        ..env_with_rules("[r]\na* b\n")
    };
    let (summary, names) = run(&env, &job(&["rename r overwrite"]), &staging).await;
    assert_eq!(names, ["b", "c"]);
    assert_eq!(tokio::fs::read(staging.join("b")).await.unwrap(), b"2");
    assert_eq!(summary.warnings, 1);
    assert!(logs_contain("'a2' overwrites 'b'"));
    env.delete_log.flush().await.unwrap();
    let log = tokio::fs::read_to_string(&log_path).await.unwrap();
    let record: DeleteRecord = serde_json::from_str(log.lines().next().unwrap()).unwrap();
    assert_eq!(record.reason, DeleteReason::Duplicate);
    assert_eq!(record.file_name, "b");
}

// after MAX_COLLISION_ATTEMPTS suffixes the target is overwritten; this loses a file on
// purpose and must say so
#[tokio::test]
#[traced_test]
async fn rename_forces_overwrite_after_cap() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("a"), "new").unwrap();
    std::fs::write(tmp.path().join("b"), "old").unwrap();
    for attempt in 0..MAX_COLLISION_ATTEMPTS {
        std::fs::write(tmp.path().join(format!("b-{}", attempt)), "").unwrap();
    }
    let env = env_with_rules("[r]\na b\n");
    let (summary, names) = run(&env, &job(&["rename r"]), tmp.path()).await;
    assert_eq!(names.len(), MAX_COLLISION_ATTEMPTS as usize + 1);
    assert!(!names.contains(&"a".to_string()));
    assert_eq!(std::fs::read(tmp.path().join("b")).unwrap(), b"new");
    assert_eq!(summary.warnings, 2);
    assert!(logs_contain("after 1000 attempts"));
}

#[tokio::test]
async fn empty_target_drops_file() {
    let tmp = tempfile::tempdir().unwrap();
    setup_staging(tmp.path(), &[("x.junk", b"j"), ("keep", b"k")]).await;
    let env = env_with_rules("[r]\n*.junk\n");
    let (summary, names) = run(&env, &job(&["rename r"]), tmp.path()).await;
    assert_eq!(names, ["keep"]);
    assert_eq!(summary.files_dropped, 1);
}

#[tokio::test]
#[traced_test]
async fn missing_rule_skips_option() {
    let tmp = tempfile::tempdir().unwrap();
    setup_staging(tmp.path(), &[("a", b"a")]).await;
    let env = PipelineEnv::default();
    let (summary, names) = run(&env, &job(&["rename nope", "toupper"]), tmp.path()).await;
    assert_eq!(names, ["A"]);
    assert_eq!(summary.options_skipped, 1);
    assert!(logs_contain("rename rule 'nope' does not exist"));
}

#[tokio::test]
async fn name_edits() {
    let tmp = tempfile::tempdir().unwrap();
    setup_staging(tmp.path(), &[("obs.2024.dat", b"1"), ("Mixed", b"2")]).await;
    let env = PipelineEnv::default();
    let (_, names) = run(&env, &job(&["extension"]), tmp.path()).await;
    assert_eq!(names, ["Mixed", "obs.2024"]);
    let (_, names) = run(&env, &job(&["basename", "prefix add P_"]), tmp.path()).await;
    assert_eq!(names, ["P_Mixed", "P_obs"]);
    let (_, names) = run(&env, &job(&["prefix del P_", "tolower"]), tmp.path()).await;
    assert_eq!(names, ["mixed", "obs"]);
}

#[tokio::test]
#[traced_test]
async fn one_bad_file_is_isolated() {
    let tmp = tempfile::tempdir().unwrap();
    setup_staging(
        tmp.path(),
        &[
            ("good1", b"00000002ANok"),
            ("bad", b"00000099ANtruncated"),
            ("good2", b"plain\r\n"),
        ],
    )
    .await;
    let env = PipelineEnv::default();
    let (summary, names) = run(&env, &job(&["wmo2ascii"]), tmp.path()).await;
    assert_eq!(names, ["good1", "good2"]);
    assert_eq!(summary.warnings, 1);
    assert_eq!(summary.files_dropped, 1);
    assert!(logs_contain("'bad' dropped"));
    assert_eq!(tokio::fs::read(tmp.path().join("good2")).await.unwrap(), b"plain\n");
}

#[tokio::test]
#[traced_test]
async fn missing_codec_is_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    setup_staging(tmp.path(), &[("img", b"II*")]).await;
    let env = PipelineEnv::default();
    let (summary, names) = run(&env, &job(&["tiff2gts"]), tmp.path()).await;
    assert_eq!(names, ["img"]);
    assert_eq!(summary.options_skipped, 1);
    assert!(logs_contain("codec tiff2gts is not available"));
}

#[tokio::test]
async fn convert_updates_sizes() {
    let tmp = tempfile::tempdir().unwrap();
    setup_staging(tmp.path(), &[("t", b"a\r\nb\r\n")]).await;
    let env = PipelineEnv::default();
    let batch = Batch::from_dir(tmp.path()).await.unwrap();
    let job = job(&["convert dos2unix"]);
    let mut ctx = PipelineContext::new(&env, &job, tmp.path().to_path_buf(), batch);
    let summary = apply(&mut ctx).await.unwrap();
    assert_eq!(summary.files_converted, 1);
    assert_eq!(ctx.batch.total_size(), 4);
    assert_eq!(tokio::fs::read(tmp.path().join("t")).await.unwrap(), b"a\nb\n");
}

#[tokio::test]
async fn codecs_leave_other_links_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let staging = tmp.path().join("staging");
    setup_staging(&staging, &[("bull", b"\x01\r\r\nHEADER\r\r\nbody\r\r\n\x03")]).await;
    let shared = tmp.path().join("shared");
    tokio::fs::hard_link(staging.join("bull"), &shared).await.unwrap();
    let env = PipelineEnv::default();
    let (summary, names) = run(&env, &job(&["wmo2ascii"]), &staging).await;
    assert_eq!(names, ["bull"]);
    assert_eq!(summary.files_converted, 1);
    assert_eq!(
        tokio::fs::read(staging.join("bull")).await.unwrap(),
        b"\nHEADER\nbody\n"
    );
    assert_eq!(
        tokio::fs::read(&shared).await.unwrap(),
        b"\x01\r\r\nHEADER\r\r\nbody\r\r\n\x03"
    );
}

#[tokio::test]
async fn exec_edits_a_private_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let staging = tmp.path().join("staging");
    setup_staging(&staging, &[("f", b"one\n")]).await;
    let shared = tmp.path().join("shared");
    tokio::fs::hard_link(staging.join("f"), &shared).await.unwrap();
    let env = PipelineEnv::default();
    let (_, names) = run(&env, &job(&["exec echo two >> %s"]), &staging).await;
    assert_eq!(names, ["f"]);
    assert_eq!(tokio::fs::read(staging.join("f")).await.unwrap(), b"one\ntwo\n");
    assert_eq!(tokio::fs::read(&shared).await.unwrap(), b"one\n");
}

#[tokio::test]
async fn execd_runs_per_file_and_deletes_originals() {
    let tmp = tempfile::tempdir().unwrap();
    let staging = tmp.path().join("staging");
    setup_staging(&staging, &[("f1", b"1")]).await;
    let env = PipelineEnv::default();
    let line = format!("execd touch {}/marker_%s", tmp.path().display());
    let (_, names) = run(&env, &job(&[&line]), &staging).await;
    assert!(names.is_empty());
    assert!(tmp.path().join("marker_f1").exists());
    assert_eq!(env.exec_stats.report().counts[ExecOutcome::Success], 1);
}

#[tokio::test]
async fn execd_deletes_even_on_failure() {
    let tmp = tempfile::tempdir().unwrap();
    setup_staging(tmp.path(), &[("f1", b"1"), ("f2", b"2")]).await;
    let env = PipelineEnv::default();
    let (summary, names) = run(&env, &job(&["execd false %s"]), tmp.path()).await;
    assert!(names.is_empty());
    assert_eq!(summary.warnings, 2);
    assert_eq!(env.exec_stats.report().counts[ExecOutcome::Failed], 2);
}

#[tokio::test]
async fn exec_batch_mode_sees_new_files() {
    let tmp = tempfile::tempdir().unwrap();
    setup_staging(tmp.path(), &[("a", b"1"), ("b", b"22")]).await;
    let env = PipelineEnv::default();
    let (_, names) = run(&env, &job(&["exec cat a b > ab"]), tmp.path()).await;
    assert_eq!(names, ["a", "ab", "b"]);
    let (_, names) = run(&env, &job(&["exec -D false"]), tmp.path()).await;
    assert!(names.is_empty());
}

#[tokio::test]
async fn exec_save_moves_to_error_store() {
    let tmp = tempfile::tempdir().unwrap();
    let staging = tmp.path().join("staging");
    setup_staging(&staging, &[("f", b"1"), ("g", b"2")]).await;
    let env = PipelineEnv {
        error_store: Some(tmp.path().join("errors")),
        ..PipelineEnv::default()
    };
    let (_, names) = run(&env, &job(&["exec -s test %s = g"]), &staging).await;
    assert_eq!(names, ["g"]);
    assert!(tmp.path().join("errors/00001234/f").exists());
}

#[tokio::test]
async fn assemble_then_extract() {
    let tmp = tempfile::tempdir().unwrap();
    setup_staging(
        tmp.path(),
        &[
            ("one", b"SMAA01 EDZW 010000\r\r\nAAXX"),
            ("two", b"SNBB02 LFPW 010000\r\r\nBBXX"),
        ],
    )
    .await;
    let env = PipelineEnv::default();
    let (summary, names) = run(&env, &job(&["assemble ASCII bundle_%n"]), tmp.path()).await;
    assert_eq!(names, ["bundle_0000"]);
    assert_eq!(summary.files_created, 1);
    let (summary, names) = run(&env, &job(&["extract ASCII SM*"]), tmp.path()).await;
    assert_eq!(names, ["SMAA01_EDZW_010000"]);
    assert_eq!(summary.files_created, 1);
}

#[tokio::test]
async fn production_log_records_renames() {
    let tmp = tempfile::tempdir().unwrap();
    let staging = tmp.path().join("staging");
    let log_path = tmp.path().join("production.log");
    setup_staging(&staging, &[("a", b"abc")]).await;
    let env = PipelineEnv {
        production_log: LineLog::open(Some(log_path.as_path())).await.unwrap(),
        ..PipelineEnv::default()
    };
    run(&env, &job(&["toupper"]), &staging).await;
    env.production_log.flush().await.unwrap();
    let log = tokio::fs::read_to_string(&log_path).await.unwrap();
    let record: ProductionRecord = serde_json::from_str(log.trim()).unwrap();
    assert_eq!(record.original_name, "a");
    assert_eq!(record.new_name, "A");
    assert_eq!(record.new_size, 3);
    assert_eq!(record.job_id, 0x1234);
    assert_eq!(record.option, "toupper");
}

#[test]
fn summary_adds_up() {
    let a = Summary {
        files_renamed: 1,
        warnings: 2,
        ..Summary::default()
    };
    let total = a + a;
    assert_eq!(total.files_renamed, 2);
    assert_eq!(total.warnings, 4);
    assert!(total.to_string().contains("files renamed: 2"));
}
