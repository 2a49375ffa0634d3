use predicates::prelude::PredicateBooleanExt;
use std::io::Read;

struct TestEnv {
    share: tempfile::TempDir,
    work: tempfile::TempDir,
}

impl TestEnv {
    fn roots_file(&self) -> std::path::PathBuf {
        self.work.path().join("roots.toml")
    }

    fn cmd(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::cargo_bin("sharecat").unwrap();
        cmd.arg("--roots").arg(self.roots_file());
        cmd
    }
}

// share
// |- movies
//    |- a.mkv
//    |- b.srt
//    |- extras
//       |- c.mkv
fn setup_test_env() -> TestEnv {
    let share = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let movies = share.path().join("movies");
    std::fs::create_dir_all(movies.join("extras")).unwrap();
    std::fs::write(movies.join("a.mkv"), "aaaaa").unwrap();
    std::fs::write(movies.join("b.srt"), "").unwrap();
    std::fs::write(movies.join("extras").join("c.mkv"), "ccc").unwrap();
    let roots = format!(
        r#"
[[root]]
id = 1
name = "nas"
protocol = "local"
path = "{}"
username = "media"
password = "hunter2"

[[root]]
id = 2
name = "offline"
protocol = "local"
path = "{}"
enabled = false
"#,
        share.path().display(),
        share.path().display(),
    );
    let env = TestEnv { share, work };
    std::fs::write(env.roots_file(), roots).unwrap();
    env
}

#[test]
fn check_sharecat_help() {
    let mut cmd = assert_cmd::Command::cargo_bin("sharecat").unwrap();
    cmd.arg("--help").assert().success();
}

#[test]
fn test_roots_are_listed_without_credentials() {
    let env = setup_test_env();
    let output = env.cmd().arg("roots").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(!stdout.contains("hunter2"));
    let roots: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let roots = roots.as_array().unwrap();
    assert_eq!(roots.len(), 2);
    assert_eq!(roots[0]["name"], "nas");
    assert_eq!(roots[0]["password"], "***");
    assert_eq!(roots[1]["enabled"], false);
}

#[test]
fn test_missing_roots_file_fails() {
    let env = setup_test_env();
    std::fs::remove_file(env.roots_file()).unwrap();
    env.cmd()
        .arg("roots")
        .assert()
        .failure()
        .code(1)
        .stderr(predicates::str::contains("failed loading storage roots"));
}

#[test]
fn test_copy_root_to_local() {
    let env = setup_test_env();
    let dst = env.work.path().join("copy");
    env.cmd()
        .args(["copy", "nas:/movies", dst.to_str().unwrap(), "--summary"])
        .assert()
        .success()
        .stdout(predicates::str::contains("files copied: 3"));
    assert_eq!(std::fs::read_to_string(dst.join("a.mkv")).unwrap(), "aaaaa");
    assert_eq!(
        std::fs::read_to_string(dst.join("extras").join("c.mkv")).unwrap(),
        "ccc"
    );
}

#[test]
fn test_copy_local_to_root_respects_overwrite() {
    let env = setup_test_env();
    let src = env.work.path().join("a.mkv");
    std::fs::write(&src, "new").unwrap();
    env.cmd()
        .args(["copy", src.to_str().unwrap(), "nas:/movies/a.mkv"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("already exists"));
    assert_eq!(
        std::fs::read_to_string(env.share.path().join("movies/a.mkv")).unwrap(),
        "aaaaa"
    );
    env.cmd()
        .args(["copy", "--overwrite", src.to_str().unwrap(), "nas:/movies/a.mkv"])
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(env.share.path().join("movies/a.mkv")).unwrap(),
        "new"
    );
}

#[test]
fn test_copy_with_depth_limit() {
    let env = setup_test_env();
    let dst = env.work.path().join("shallow");
    env.cmd()
        .args(["copy", "nas:/movies", dst.to_str().unwrap(), "--max-depth", "0"])
        .assert()
        .success();
    assert!(dst.join("a.mkv").exists());
    assert!(!dst.join("extras").join("c.mkv").exists());
}

#[test]
fn test_copy_between_local_paths_is_rejected() {
    let env = setup_test_env();
    let src = env.work.path().join("a");
    let dst = env.work.path().join("b");
    std::fs::write(&src, "a").unwrap();
    env.cmd()
        .args(["copy", src.to_str().unwrap(), dst.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicates::str::contains("storage root"));
    assert!(!dst.exists());
}

#[test]
fn test_copy_into_own_subtree_is_rejected() {
    let env = setup_test_env();
    env.cmd()
        .args(["copy", "nas:/movies", "nas:/movies/backup"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .failure()
        .code(1)
        .stderr(predicates::str::contains("inside"));
    assert!(!env.share.path().join("movies/backup").exists());
}

#[test]
fn test_disabled_root_is_rejected() {
    let env = setup_test_env();
    let dst = env.work.path().join("out");
    env.cmd()
        .args(["copy", "offline:/movies", dst.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicates::str::contains("disabled"));
}

#[test]
fn test_download_file() {
    let env = setup_test_env();
    let out = env.work.path().join("a.mkv");
    env.cmd()
        .args(["download", "nas:/movies/a.mkv", out.to_str().unwrap()])
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "aaaaa");
    env.cmd()
        .args(["download", "1:/movies/extras/c.mkv", out.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicates::str::contains("--overwrite"));
    env.cmd()
        .args(["download", "-o", "1:/movies/extras/c.mkv", out.to_str().unwrap()])
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "ccc");
}

#[test]
fn test_download_directory_fails() {
    let env = setup_test_env();
    let out = env.work.path().join("movies");
    env.cmd()
        .args(["download", "nas:/movies", out.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicates::str::contains("directory"));
    assert!(!out.exists());
}

fn archive_names(path: &std::path::Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let archive = zip::ZipArchive::new(file).unwrap();
    let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
    names.sort();
    names
}

#[test]
fn test_archive_directory() {
    let env = setup_test_env();
    let out = env.work.path().join("movies.zip");
    env.cmd()
        .args(["archive", "nas:/movies", out.to_str().unwrap()])
        .assert()
        .success();
    assert_eq!(
        archive_names(&out),
        vec!["a.mkv", "b.srt", "extras/", "extras/c.mkv"]
    );
    let mut archive = zip::ZipArchive::new(std::fs::File::open(&out).unwrap()).unwrap();
    let mut contents = String::new();
    archive
        .by_name("a.mkv")
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "aaaaa");
}

#[test]
fn test_archive_not_recursive() {
    let env = setup_test_env();
    let out = env.work.path().join("flat.zip");
    env.cmd()
        .args([
            "archive",
            "nas:/movies",
            out.to_str().unwrap(),
            "--no-recursive",
        ])
        .assert()
        .success();
    assert_eq!(archive_names(&out), vec!["a.mkv", "b.srt", "extras/"]);
}

#[test]
fn test_archive_size_limit_removes_partial_file() {
    let env = setup_test_env();
    let out = env.work.path().join("big.zip");
    env.cmd()
        .args([
            "archive",
            "nas:/movies",
            out.to_str().unwrap(),
            "--max-archive-size",
            "6",
        ])
        .assert()
        .failure()
        .stderr(predicates::str::contains("size limit"));
    assert!(!out.exists());
}

#[test]
fn test_scan_prints_final_status() {
    let env = setup_test_env();
    let output = env.cmd().args(["scan", "nas"]).output().unwrap();
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["state"], "completed");
    assert_eq!(status["storage_root"], "nas");
    // movies, a.mkv, b.srt, extras, c.mkv
    assert_eq!(status["files_found"], 5);
    assert_eq!(status["error_count"], 0);
}

#[test]
fn test_scan_missing_path_fails() {
    let env = setup_test_env();
    env.cmd()
        .args(["scan", "nas", "--path", "/shows"])
        .assert()
        .failure()
        .stdout(predicates::str::contains("\"failed\""))
        .stderr(predicates::str::contains("scan of").and(predicates::str::contains("nas")));
}
