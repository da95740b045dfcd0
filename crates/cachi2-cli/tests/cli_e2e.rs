use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, content).expect("write");
}

fn init_git_repo(root: &Path) {
    write_file(&root.join(".git").join("HEAD"), "ref: refs/heads/main\n");
}

fn create_npm_project(root: &Path) {
    init_git_repo(root);
    write_file(
        &root.join("app/package.json"),
        r#"{ "name": "demo", "version": "1.0.0" }"#,
    );
    write_file(
        &root.join("app/package-lock.json"),
        r#"{
  "name": "demo",
  "version": "1.0.0",
  "lockfileVersion": 3,
  "packages": {
    "": { "name": "demo", "version": "1.0.0", "dependencies": { "left-pad": "file:../left-pad" } },
    "node_modules/left-pad": {
      "version": "1.3.0",
      "resolved": "file:../left-pad",
      "link": true
    }
  }
}"#,
    );
    write_file(&root.join("left-pad/package.json"), r#"{ "name": "left-pad", "version": "1.3.0" }"#);
}

fn cachi2_cmd() -> Command {
    Command::cargo_bin("cachi2").expect("binary builds")
}

#[test]
fn fetch_deps_writes_bom_and_output_json() {
    let td = tempdir().expect("tempdir");
    create_npm_project(td.path());
    let output_dir = td.path().join("cachi2-output");

    cachi2_cmd()
        .arg("fetch-deps")
        .arg("--source")
        .arg(td.path())
        .arg("--output")
        .arg(&output_dir)
        .arg(r#"[{"type":"npm","path":"app"}]"#)
        .assert()
        .success()
        .stdout(contains("component(s) resolved"));

    assert!(output_dir.join("bom.json").exists());
    assert!(output_dir.join("output.json").exists());

    let bom = fs::read_to_string(output_dir.join("bom.json")).expect("read bom");
    assert!(bom.contains("left-pad"));
}

#[test]
fn fetch_deps_accepts_bare_kind_string() {
    let td = tempdir().expect("tempdir");
    create_npm_project(td.path());
    let output_dir = td.path().join("out");

    cachi2_cmd()
        .arg("fetch-deps")
        .arg("--source")
        .arg(td.path().join("app"))
        .arg("--output")
        .arg(&output_dir)
        .arg("\"npm\"")
        .assert()
        .success();

    assert!(output_dir.join("bom.json").exists());
}

#[test]
fn fetch_deps_rejects_source_outside_a_git_repo() {
    let td = tempdir().expect("tempdir");
    write_file(&td.path().join("app/package.json"), r#"{ "name": "demo", "version": "1.0.0" }"#);
    let output_dir = td.path().join("out");

    cachi2_cmd()
        .arg("fetch-deps")
        .arg("--source")
        .arg(td.path())
        .arg("--output")
        .arg(&output_dir)
        .arg(r#"[{"type":"npm","path":"app"}]"#)
        .assert()
        .failure();
}

#[test]
fn fetch_deps_rejects_unparsable_packages_argument() {
    let td = tempdir().expect("tempdir");
    init_git_repo(td.path());
    let output_dir = td.path().join("out");

    cachi2_cmd()
        .arg("fetch-deps")
        .arg("--source")
        .arg(td.path())
        .arg("--output")
        .arg(&output_dir)
        .arg("not json")
        .assert()
        .failure();
}

#[test]
fn generate_env_round_trips_through_fetch_deps() {
    let td = tempdir().expect("tempdir");
    create_npm_project(td.path());
    let output_dir = td.path().join("out");

    cachi2_cmd()
        .arg("fetch-deps")
        .arg("--source")
        .arg(td.path())
        .arg("--output")
        .arg(&output_dir)
        .arg(r#"[{"type":"npm","path":"app"}]"#)
        .assert()
        .success();

    cachi2_cmd()
        .arg("generate-env")
        .arg("--output")
        .arg(&output_dir)
        .assert()
        .success()
        .stdout(contains("export "));
}

#[test]
fn generate_env_json_format_is_well_formed() {
    let td = tempdir().expect("tempdir");
    create_npm_project(td.path());
    let output_dir = td.path().join("out");

    cachi2_cmd()
        .arg("fetch-deps")
        .arg("--source")
        .arg(td.path())
        .arg("--output")
        .arg(&output_dir)
        .arg(r#"[{"type":"npm","path":"app"}]"#)
        .assert()
        .success();

    let assertion = cachi2_cmd()
        .arg("generate-env")
        .arg("--output")
        .arg(&output_dir)
        .arg("--format")
        .arg("json")
        .assert()
        .success();

    let raw = String::from_utf8(assertion.get_output().stdout.clone()).expect("utf8");
    let parsed: serde_json::Value = serde_json::from_str(raw.trim()).expect("valid json");
    assert!(parsed.is_object());
}

#[test]
fn generate_env_without_a_prior_fetch_deps_run_fails() {
    let td = tempdir().expect("tempdir");
    fs::create_dir_all(td.path()).expect("mkdir");

    cachi2_cmd()
        .arg("generate-env")
        .arg("--output")
        .arg(td.path())
        .assert()
        .failure();
}

#[test]
fn inject_files_without_for_output_dir_reports_no_op() {
    let td = tempdir().expect("tempdir");
    create_npm_project(td.path());
    let output_dir = td.path().join("out");

    cachi2_cmd()
        .arg("fetch-deps")
        .arg("--source")
        .arg(td.path())
        .arg("--output")
        .arg(&output_dir)
        .arg(r#"[{"type":"npm","path":"app"}]"#)
        .assert()
        .success();

    cachi2_cmd()
        .arg("inject-files")
        .arg("--output")
        .arg(&output_dir)
        .assert()
        .success()
        .stderr(contains("nothing to inject"));
}
