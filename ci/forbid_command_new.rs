use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// The only place allowed to build an OS command.
const ALLOW: &[&str] = &["crates/rfdeck-core/src/supervisor.rs"];

const SHELLS: &[&str] = &["\"sh\"", "\"bash\"", "\"/bin/sh\"", "\"/bin/bash\""];

fn main() {
    if let Err(err) = run() {
        eprintln!("forbid_command_new: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let repo = env::current_dir().map_err(|e| format!("cwd: {e}"))?;
    let allow: Vec<PathBuf> = ALLOW.iter().map(|p| repo.join(p)).collect();

    let mut violations = Vec::new();
    visit_rs(&repo, &allow, &mut violations)?;

    if !violations.is_empty() {
        eprintln!("forbid_command_new: found forbidden Command usage:");
        for v in violations {
            eprintln!("{v}");
        }
        return Err("Command usage outside allowlist".to_string());
    }

    println!("forbid_command_new: OK");
    Ok(())
}

fn visit_rs(dir: &Path, allow: &[PathBuf], out: &mut Vec<String>) -> Result<(), String> {
    let entries = fs::read_dir(dir).map_err(|e| format!("read dir {}: {e}", dir.display()))?;
    for entry in entries {
        let entry = entry.map_err(|e| format!("read entry {}: {e}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            if should_skip_dir(&path) {
                continue;
            }
            visit_rs(&path, allow, out)?;
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("rs") {
            continue;
        }

        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(_) => continue,
        };
        let allowed = allow.iter().any(|a| path.starts_with(a));
        out.extend(violations_in(&path, &text, allowed));
    }
    Ok(())
}

fn violations_in(path: &Path, text: &str, allowed: bool) -> Vec<String> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let builds_command = line.contains("Command::new") || line.contains("process::Command");
        if !builds_command {
            continue;
        }
        let spawns_shell = SHELLS.iter().any(|shell| line.contains(shell));
        if !allowed || spawns_shell {
            out.push(format!("{}:{}: {}", path.display(), idx + 1, line.trim()));
        }
    }
    out
}

fn should_skip_dir(path: &Path) -> bool {
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
    matches!(
        name,
        ".git" | "ci" | "target" | "examples" | "original_source" | "vendor" | "tmp"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlisted_file_may_build_commands_but_not_shells() {
        let path = Path::new("supervisor.rs");
        let program = "let mut cmd = Command::new(&spec.program);";
        assert!(violations_in(path, program, true).is_empty());
        assert_eq!(violations_in(path, program, false).len(), 1);

        let shell = "let cmd = Command::new(\"sh\");";
        assert_eq!(violations_in(path, shell, true).len(), 1);
    }
}
