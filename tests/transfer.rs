// [[file:../fleet.note::9e0b4c27][9e0b4c27]]
mod common;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;

use gosh_fleet::config::HadoopConfig;
use gosh_fleet::job::{plan_job, InputFormat, JobSpec, StageProgram};
use gosh_fleet::storage::ObjectUri;
use gosh_fleet::transfer::{Transfer, COPY_MAPPERS, STORE_TO_FLEET_MAPPER};
use gosh_fleet::ClusterError;

use common::*;
// 9e0b4c27 ends here

// [[file:../fleet.note::64d1a8f3][64d1a8f3]]
const PROGRAM_DIR: &str = "gs://bucket-fuga/mapreduce/mapper-reducer";

fn transfer(fakes: &Fakes) -> Transfer {
    for (name, content) in COPY_MAPPERS {
        fakes.store.insert(&format!("{PROGRAM_DIR}/{name}"), content);
    }
    Transfer::new(
        fakes.store.clone(),
        fakes.fs.clone(),
        fakes.engine.clone(),
        HadoopConfig::default(),
        ObjectUri::parse(PROGRAM_DIR).unwrap(),
        CancellationToken::new(),
    )
}

fn uri(s: &str) -> ObjectUri {
    ObjectUri::parse(s).unwrap()
}

async fn round_trip(objects: &[(&str, &str)]) -> BTreeMap<String, String> {
    let fakes = Fakes::new(FakeShell::default());
    let transfer = transfer(&fakes);
    for (rel, content) in objects {
        fakes.store.insert(&format!("gs://data/in/{rel}"), content);
    }

    let report = transfer.copy_into_fleet(&uri("gs://data/in"), "/work/in", 3).await.unwrap();
    assert_eq!(report.copied, objects.len());
    let report = transfer.copy_out_of_fleet("/work/in", &uri("gs://data/back"), 3).await.unwrap();
    assert_eq!(report.copied, objects.len());
    assert!(report.combined.is_empty());
    // scratch directories are cleaned up
    assert!(fakes.fs.paths().iter().all(|p| p.starts_with("/work/in/")));

    fakes.store.tree("gs://data/back")
}

#[tokio::test]
async fn test_round_trip_empty() {
    let back = round_trip(&[]).await;
    assert!(back.is_empty());
}

#[tokio::test]
async fn test_round_trip() {
    let objects = [
        ("a.txt", "alpha"),
        ("sub/b.txt", "beta"),
        // looks like a result part but has no success marker next to it
        ("part-00000", "gamma"),
    ];
    let back = round_trip(&objects).await;
    let expected: BTreeMap<String, String> = objects.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    assert_eq!(back, expected);
}

#[tokio::test]
async fn test_combine_result_parts() {
    let fakes = Fakes::new(FakeShell::default());
    let transfer = transfer(&fakes);
    fakes.fs.insert("/job/out/_SUCCESS", "");
    fakes.fs.insert("/job/out/part-9", "a");
    fakes.fs.insert("/job/out/part-10", "b");
    fakes.fs.insert("/job/out/_logs/history/job.xml", "<xml/>");
    fakes.fs.insert("/job/out/notes.txt", "n");

    let report = transfer.copy_out_of_fleet("/job/out", &uri("gs://data/results"), 2).await.unwrap();
    assert_eq!(report.combined, vec![uri("gs://data/results/results")]);
    assert_eq!(report.copied, 1);

    let back = fakes.store.tree("gs://data/results");
    assert_eq!(back.len(), 2);
    assert_eq!(back["results"], "ab");
    assert_eq!(back["notes.txt"], "n");
}

#[tokio::test]
async fn test_unstaged_copy_mapper() {
    // copy mappers were never staged
    let fakes = Fakes::new(FakeShell::default());
    let transfer = Transfer::new(
        fakes.store.clone(),
        fakes.fs.clone(),
        fakes.engine.clone(),
        HadoopConfig::default(),
        uri(PROGRAM_DIR),
        CancellationToken::new(),
    );
    fakes.store.insert("gs://data/in/a.txt", "alpha");
    let e = transfer.copy_into_fleet(&uri("gs://data/in"), "/work/in", 1).await.unwrap_err();
    assert!(matches!(e, ClusterError::JobSubmission { .. }), "{e}");
    assert!(fakes.fs.paths().is_empty());
}

#[tokio::test]
async fn test_copy_out_listing_failure() {
    let fakes = Fakes::new(FakeShell::default());
    let transfer = transfer(&fakes);
    fakes.fs.insert("/job/out/_SUCCESS", "");
    fakes.fs.insert("/job/out/part-00000", "a");
    fakes.fs.fail_list.store(true, Ordering::SeqCst);

    let e = transfer.copy_out_of_fleet("/job/out", &uri("gs://data/out"), 2).await.unwrap_err();
    assert!(matches!(e, ClusterError::Transfer { .. }), "{e}");
    // nothing was copied and no job ran
    assert!(fakes.store.tree("gs://data/out").is_empty());
    assert!(fakes.engine.submitted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_lost_copies_are_named() {
    let fakes = Fakes::new(FakeShell::default());
    let transfer = transfer(&fakes);
    fakes.fs.insert("/work/out/a.txt", "alpha");
    fakes.fs.insert("/work/out/b.txt", "beta");
    fakes.engine.lost.lock().unwrap().insert("/work/out/b.txt".into());

    let e = transfer.copy_out_of_fleet("/work/out", &uri("gs://data/out"), 2).await.unwrap_err();
    match e {
        ClusterError::Transfer { objects, .. } => assert_eq!(objects, vec!["gs://data/out/b.txt"]),
        e => panic!("unexpected error: {e}"),
    }
    let back = fakes.store.tree("gs://data/out");
    assert_eq!(back.keys().collect::<Vec<_>>(), vec!["a.txt"]);

    fakes.store.insert("gs://data/in/c.txt", "gamma");
    fakes.engine.lost.lock().unwrap().insert("gs://data/in/c.txt".into());
    let e = transfer.copy_into_fleet(&uri("gs://data/in"), "/work/in", 1).await.unwrap_err();
    match e {
        ClusterError::Transfer { objects, .. } => assert_eq!(objects, vec!["gs://data/in/c.txt"]),
        e => panic!("unexpected error: {e}"),
    }
    assert!(fakes.fs.read("/work/in/c.txt").is_none());
}

#[tokio::test]
async fn test_results_name_clash() {
    let fakes = Fakes::new(FakeShell::default());
    let transfer = transfer(&fakes);
    fakes.fs.insert("/job/out/_SUCCESS", "");
    fakes.fs.insert("/job/out/part-00000", "a");
    fakes.fs.insert("/job/out/results", "written by the job");

    let e = transfer.copy_out_of_fleet("/job/out", &uri("gs://data/out"), 2).await.unwrap_err();
    match e {
        ClusterError::Transfer { objects, .. } => assert_eq!(objects, vec!["/job/out/results"]),
        e => panic!("unexpected error: {e}"),
    }
    assert!(fakes.store.tree("gs://data/out").is_empty());
}

/// A copy job and an identity job of the same width differ only in the
/// stage-1 program.
#[test]
fn test_copy_job_is_identity_job() {
    let hadoop = HadoopConfig::default();
    let job = |stage1: StageProgram| JobSpec {
        name: "gosh-fleet-copy-abc123".into(),
        stage1,
        stage1_width: 7,
        stage2: StageProgram::Identity,
        stage2_width: 0,
        input: "/scratch/manifest".into(),
        output: "/scratch/out".into(),
        input_format: InputFormat::LinePerTask,
    };
    let copy = StageProgram::staged(uri(&format!("{PROGRAM_DIR}/{STORE_TO_FLEET_MAPPER}")), "gosh-fleet-copy-abc123");
    let copy = plan_job(&job(copy), &hadoop).unwrap();
    let identity = plan_job(&job(StageProgram::Identity), &hadoop).unwrap();

    let mut stripped = copy.argv.clone();
    let i = stripped.iter().position(|x| x == "-file").unwrap();
    stripped.drain(i..i + 2);
    let differ = stripped
        .iter()
        .zip(&identity.argv)
        .filter(|(a, b)| a != b)
        .collect::<Vec<_>>();
    assert_eq!(stripped.len(), identity.argv.len());
    assert_eq!(differ, vec![(&STORE_TO_FLEET_MAPPER.to_string(), &"cat".to_string())]);
    assert_eq!(copy.fetch.len(), 1);
    assert!(identity.fetch.is_empty());
}
// 64d1a8f3 ends here
