//! CLI tests for `editloop init`, `parse` and `apply`.
//!
//! Spawns the editloop binary against a temp project and checks exit codes
//! and what reaches disk.

use std::fs;
use std::process::Command;

use editloop::exit_codes;
use editloop::io::config::load_config;
use editloop::io::init::EditloopPaths;

const TRANSCRIPT: &str = "Moving the helper and adding a page.\n\
<edit-rename from=\"src/util.ts\" to=\"src/lib/util.ts\" />\n\
<edit-write path=\"app/page.tsx\" description=\"landing page\">\n\
```tsx\n\
export default function Page() {\n\
  return null;\n\
}\n\
```\n\
</edit-write>\n\
<edit-delete path=\"../outside.txt\" />\n";

fn editloop(dir: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_editloop"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run editloop")
}

#[test]
fn init_writes_config_and_refuses_overwrite() {
    let temp = tempfile::tempdir().expect("tempdir");

    let first = editloop(temp.path(), &["init"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    let paths = EditloopPaths::new(temp.path());
    let cfg = load_config(&paths.config_path).expect("config");
    assert_eq!(cfg.max_attempts, 3);

    let second = editloop(temp.path(), &["init"]);
    assert_eq!(second.status.code(), Some(exit_codes::INVALID));

    let forced = editloop(temp.path(), &["init", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn parse_prints_directives_and_issues() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("out.txt"), TRANSCRIPT).expect("transcript");

    let output = editloop(temp.path(), &["parse", "out.txt", "--chunk-bytes", "3"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    let directives = parsed["directives"].as_array().expect("directives");
    assert_eq!(directives.len(), 2);
    assert_eq!(directives[0]["type"], "rename");
    assert_eq!(directives[1]["type"], "write");
    assert_eq!(parsed["issues"][0]["kind"], "path_escape");
}

#[test]
fn apply_commit_mutates_project() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(temp.path().join("src")).expect("src dir");
    fs::write(temp.path().join("src/util.ts"), "export const util = 1;\n").expect("util");
    fs::write(temp.path().join("out.txt"), TRANSCRIPT).expect("transcript");

    let dry = editloop(temp.path(), &["apply", "out.txt"]);
    assert_eq!(dry.status.code(), Some(exit_codes::OK));
    assert!(temp.path().join("src/util.ts").exists());
    assert!(!temp.path().join("app/page.tsx").exists());

    let output = editloop(temp.path(), &["apply", "out.txt", "--commit"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(summary["applied"], 2);
    assert_eq!(summary["committed"], true);

    assert!(!temp.path().join("src/util.ts").exists());
    assert_eq!(
        fs::read_to_string(temp.path().join("src/lib/util.ts")).expect("moved"),
        "export const util = 1;\n"
    );
    assert_eq!(
        fs::read_to_string(temp.path().join("app/page.tsx")).expect("page"),
        "export default function Page() {\n  return null;\n}\n"
    );
}

#[test]
fn missing_transcript_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = editloop(temp.path(), &["parse", "nope.txt"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}
