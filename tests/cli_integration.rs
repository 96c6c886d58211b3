use assert_cmd::Command;
use predicates::prelude::*;

fn write(root: &std::path::Path, rel: &str, content: &str) {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, content).unwrap();
}

#[test]
fn stats_command_prints_counts() {
    let temp = tempfile::tempdir().unwrap();
    write(temp.path(), "a.md", "[[b]]\n");
    write(temp.path(), "b.md", "x\n");

    Command::cargo_bin("notegraph")
        .unwrap()
        .args(["--vault"])
        .arg(temp.path())
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"note_count\": 2"));
}

#[test]
fn search_command_finds_content() {
    let temp = tempfile::tempdir().unwrap();
    write(
        temp.path(),
        "note.md",
        "# Note\nquarterly migration planning\n",
    );

    Command::cargo_bin("notegraph")
        .unwrap()
        .args(["--vault"])
        .arg(temp.path())
        .args(["search", "migration", "--scope", "content"])
        .assert()
        .success()
        .stdout(predicate::str::contains("note.md"));
}

#[test]
fn preset_blocks_filtered_operations() {
    let temp = tempfile::tempdir().unwrap();
    write(temp.path(), "a.md", "x\n");

    Command::cargo_bin("notegraph")
        .unwrap()
        .args(["--vault"])
        .arg(temp.path())
        .args(["--ops", "search"])
        .args(["hubs"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not in session preset"));
}
