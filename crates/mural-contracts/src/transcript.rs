//! Declarative checks over a recorded tool-use transcript.
//!
//! A transcript is a JSONL file of agent entries; assistant entries carry a
//! `message.content` list of `tool_use` and `text` blocks. Checks are a flat
//! rule set (string containment, regex match, call-count assertions) supplied
//! as JSON; evaluation produces a pass/fail report with per-check detail.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    pub input: Map<String, Value>,
}

impl ToolCall {
    fn input_str(&self, key: &str) -> &str {
        self.input.get(key).and_then(Value::as_str).unwrap_or("")
    }
}

/// Parsed transcript: tool calls in invocation order plus assistant text.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    pub tool_calls: Vec<ToolCall>,
    pub assistant_text: Vec<String>,
}

impl Transcript {
    pub fn calls_named<'a>(&'a self, tool: &'a str) -> impl Iterator<Item = &'a ToolCall> {
        self.tool_calls.iter().filter(move |call| call.tool == tool)
    }

    pub fn count_named(&self, tool: &str) -> usize {
        self.calls_named(tool).count()
    }

    fn full_text_lower(&self) -> String {
        self.assistant_text.join(" ").to_lowercase()
    }
}

/// Parse a JSONL transcript file. Malformed lines are skipped.
pub fn parse_transcript(path: &Path) -> Result<Transcript> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading transcript {}", path.display()))?;

    let mut transcript = Transcript::default();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if entry.get("type").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let blocks = entry
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    transcript.tool_calls.push(ToolCall {
                        tool: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        input: block
                            .get("input")
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default(),
                    });
                }
                Some("text") => {
                    transcript.assistant_text.push(
                        block
                            .get("text")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    );
                }
                _ => {}
            }
        }
    }
    Ok(transcript)
}

/// The recognized checks. Absent fields are not evaluated; the boolean
/// checks only run when set to `true`.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct CheckSet {
    pub has_bash_command: Option<String>,
    pub has_bash_command_pattern: Option<String>,
    pub has_bash_command_pattern_2: Option<String>,
    pub no_task_calls: Option<bool>,
    pub output_contains: Option<String>,
    pub output_contains_any: Option<Vec<String>>,
    pub has_skill_invocation: Option<bool>,
    pub skill_name_is: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub check: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub total_checks: usize,
    pub passed_checks: usize,
    pub failed_checks: usize,
    pub total_tool_calls: usize,
    pub bash_calls: usize,
    pub task_calls: usize,
    pub skill_calls: usize,
    pub assistant_text_blocks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub passed: bool,
    pub checks: Vec<CheckResult>,
    pub summary: ReportSummary,
}

fn excerpt(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

fn pattern_check(
    name: &'static str,
    pattern: &str,
    transcript: &Transcript,
) -> Result<CheckResult> {
    let regex =
        Regex::new(pattern).with_context(|| format!("invalid regex for {name}: {pattern:?}"))?;
    let matched = transcript
        .calls_named("Bash")
        .map(|call| call.input_str("command"))
        .find(|command| regex.is_match(command));
    Ok(CheckResult {
        check: name,
        passed: matched.is_some(),
        detail: match matched {
            Some(command) => format!(
                "Matched pattern: \"{pattern}\" in \"{}\"",
                excerpt(command, 80)
            ),
            None => format!("No Bash command matching pattern: \"{pattern}\""),
        },
    })
}

/// Run every requested check against a parsed transcript, in the fixed
/// check order.
pub fn run_checks(checks: &CheckSet, transcript: &Transcript) -> Result<Vec<CheckResult>> {
    let mut results = Vec::new();

    if let Some(expected) = checks.has_bash_command.as_deref() {
        let found = transcript
            .calls_named("Bash")
            .any(|call| call.input_str("command").contains(expected));
        results.push(CheckResult {
            check: "has_bash_command",
            passed: found,
            detail: if found {
                format!("Found Bash: \"{expected}\"")
            } else {
                format!("Missing Bash command: \"{expected}\"")
            },
        });
    }

    if let Some(pattern) = checks.has_bash_command_pattern.as_deref() {
        results.push(pattern_check("has_bash_command_pattern", pattern, transcript)?);
    }

    if let Some(pattern) = checks.has_bash_command_pattern_2.as_deref() {
        results.push(pattern_check(
            "has_bash_command_pattern_2",
            pattern,
            transcript,
        )?);
    }

    if checks.no_task_calls.unwrap_or(false) {
        let task_calls = transcript.count_named("Task");
        results.push(CheckResult {
            check: "no_task_calls",
            passed: task_calls == 0,
            detail: if task_calls == 0 {
                "No Task calls (correct)".to_string()
            } else {
                format!("Found {task_calls} Task calls (should be 0)")
            },
        });
    }

    if let Some(keyword) = checks.output_contains.as_deref() {
        let found = transcript.full_text_lower().contains(&keyword.to_lowercase());
        results.push(CheckResult {
            check: "output_contains",
            passed: found,
            detail: if found {
                format!("Found \"{keyword}\" in output")
            } else {
                format!("Missing \"{keyword}\" in output")
            },
        });
    }

    if let Some(keywords) = checks.output_contains_any.as_deref() {
        let full_text = transcript.full_text_lower();
        let matched = keywords
            .iter()
            .find(|keyword| full_text.contains(&keyword.to_lowercase()));
        results.push(CheckResult {
            check: "output_contains_any",
            passed: matched.is_some(),
            detail: match matched {
                Some(keyword) => format!("Found \"{keyword}\" in output"),
                None => format!("None of {keywords:?} found in output"),
            },
        });
    }

    if checks.has_skill_invocation.unwrap_or(false) {
        let skill_calls = transcript.count_named("Skill");
        results.push(CheckResult {
            check: "has_skill_invocation",
            passed: skill_calls > 0,
            detail: if skill_calls > 0 {
                format!("Found {skill_calls} Skill invocation(s)")
            } else {
                "No Skill tool calls found".to_string()
            },
        });
    }

    if let Some(expected) = checks.skill_name_is.as_deref() {
        let found = transcript
            .calls_named("Skill")
            .any(|call| call.input_str("skill") == expected);
        results.push(CheckResult {
            check: "skill_name_is",
            passed: found,
            detail: if found {
                format!("Skill \"{expected}\" invoked")
            } else {
                let seen: Vec<&str> = transcript
                    .calls_named("Skill")
                    .map(|call| call.input_str("skill"))
                    .collect();
                format!("Skill \"{expected}\" not invoked (found: {seen:?})")
            },
        });
    }

    Ok(results)
}

/// Evaluate a check set and assemble the full report.
pub fn evaluate(checks: &CheckSet, transcript: &Transcript) -> Result<Report> {
    let results = run_checks(checks, transcript)?;
    let passed_checks = results.iter().filter(|result| result.passed).count();
    Ok(Report {
        passed: results.iter().all(|result| result.passed),
        summary: ReportSummary {
            total_checks: results.len(),
            passed_checks,
            failed_checks: results.len() - passed_checks,
            total_tool_calls: transcript.tool_calls.len(),
            bash_calls: transcript.count_named("Bash"),
            task_calls: transcript.count_named("Task"),
            skill_calls: transcript.count_named("Skill"),
            assistant_text_blocks: transcript.assistant_text.len(),
        },
        checks: results,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    fn write_transcript(lines: &[Value]) -> Result<(tempfile::TempDir, std::path::PathBuf)> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("transcript.jsonl");
        let mut file = fs::File::create(&path)?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        Ok((temp, path))
    }

    fn assistant_entry(blocks: Value) -> Value {
        json!({"type": "assistant", "message": {"content": blocks}})
    }

    fn sample_transcript() -> Result<(tempfile::TempDir, Transcript)> {
        let (temp, path) = write_transcript(&[
            assistant_entry(json!([
                {"type": "tool_use", "name": "Bash", "input": {"command": "git worktree list"}},
                {"type": "text", "text": "Listing worktrees now."}
            ])),
            json!({"type": "user", "message": {"content": []}}),
            assistant_entry(json!([
                {"type": "tool_use", "name": "Skill", "input": {"skill": "dev:git-worktree"}},
                {"type": "tool_use", "name": "Bash", "input": {"command": "git check-ignore target"}}
            ])),
        ])?;
        let transcript = parse_transcript(&path)?;
        Ok((temp, transcript))
    }

    #[test]
    fn parse_skips_malformed_and_non_assistant_lines() -> Result<()> {
        let (temp, path) = write_transcript(&[assistant_entry(json!([
            {"type": "tool_use", "name": "Bash", "input": {"command": "ls"}}
        ]))])?;
        fs::OpenOptions::new()
            .append(true)
            .open(&path)?
            .write_all(b"not json\n\n{\"type\": \"system\"}\n")?;

        let transcript = parse_transcript(&path)?;
        assert_eq!(transcript.tool_calls.len(), 1);
        assert_eq!(transcript.count_named("Bash"), 1);
        drop(temp);
        Ok(())
    }

    #[test]
    fn containment_and_pattern_checks() -> Result<()> {
        let (_temp, transcript) = sample_transcript()?;
        let checks = CheckSet {
            has_bash_command: Some("git worktree list".to_string()),
            has_bash_command_pattern: Some("git (worktree|branch)".to_string()),
            has_bash_command_pattern_2: Some("git check-ignore".to_string()),
            ..CheckSet::default()
        };
        let results = run_checks(&checks, &transcript)?;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|result| result.passed));
        assert!(results[1].detail.contains("git worktree list"));
        Ok(())
    }

    #[test]
    fn missing_command_fails_with_detail() -> Result<()> {
        let (_temp, transcript) = sample_transcript()?;
        let checks = CheckSet {
            has_bash_command: Some("cargo test".to_string()),
            ..CheckSet::default()
        };
        let results = run_checks(&checks, &transcript)?;
        assert!(!results[0].passed);
        assert_eq!(results[0].detail, "Missing Bash command: \"cargo test\"");
        Ok(())
    }

    #[test]
    fn task_and_skill_checks() -> Result<()> {
        let (_temp, transcript) = sample_transcript()?;
        let checks = CheckSet {
            no_task_calls: Some(true),
            has_skill_invocation: Some(true),
            skill_name_is: Some("dev:git-worktree".to_string()),
            ..CheckSet::default()
        };
        let results = run_checks(&checks, &transcript)?;
        assert!(results.iter().all(|result| result.passed));

        let wrong_skill = CheckSet {
            skill_name_is: Some("dev:other".to_string()),
            ..CheckSet::default()
        };
        let results = run_checks(&wrong_skill, &transcript)?;
        assert!(!results[0].passed);
        assert!(results[0].detail.contains("dev:git-worktree"));
        Ok(())
    }

    #[test]
    fn output_checks_are_case_insensitive() -> Result<()> {
        let (_temp, transcript) = sample_transcript()?;
        let checks = CheckSet {
            output_contains: Some("WORKTREES".to_string()),
            output_contains_any: Some(vec!["create".to_string(), "listing".to_string()]),
            ..CheckSet::default()
        };
        let results = run_checks(&checks, &transcript)?;
        assert!(results[0].passed);
        assert!(results[1].passed);
        assert_eq!(results[1].detail, "Found \"listing\" in output");
        Ok(())
    }

    #[test]
    fn report_summary_counts_are_consistent() -> Result<()> {
        let (_temp, transcript) = sample_transcript()?;
        let checks = CheckSet {
            has_bash_command: Some("git worktree".to_string()),
            output_contains: Some("nowhere".to_string()),
            ..CheckSet::default()
        };
        let report = evaluate(&checks, &transcript)?;
        assert!(!report.passed);
        assert_eq!(report.summary.total_checks, 2);
        assert_eq!(report.summary.passed_checks, 1);
        assert_eq!(report.summary.failed_checks, 1);
        assert_eq!(report.summary.total_tool_calls, 3);
        assert_eq!(report.summary.bash_calls, 2);
        assert_eq!(report.summary.task_calls, 0);
        assert_eq!(report.summary.skill_calls, 1);
        assert_eq!(report.summary.assistant_text_blocks, 1);
        Ok(())
    }

    #[test]
    fn invalid_regex_is_an_error() -> Result<()> {
        let (_temp, transcript) = sample_transcript()?;
        let checks = CheckSet {
            has_bash_command_pattern: Some("(unclosed".to_string()),
            ..CheckSet::default()
        };
        assert!(run_checks(&checks, &transcript).is_err());
        Ok(())
    }
}
