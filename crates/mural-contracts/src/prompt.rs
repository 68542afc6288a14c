use std::sync::OnceLock;

use regex::Regex;

use crate::request::InputError;

/// Characters that would need quoting if the prompt ever reached a shell.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '\\', '!',
];

/// Validate and neutralize a prompt before it is sent anywhere.
///
/// Empty or all-whitespace prompts are rejected. Prompts containing shell
/// metacharacters come back shell-quoted; everything else passes through
/// unchanged. Defense in depth, not a rejection gate.
pub fn sanitize_prompt(prompt: &str) -> Result<String, InputError> {
    if prompt.trim().is_empty() {
        return Err(InputError::EmptyPrompt);
    }
    if prompt.contains(SHELL_METACHARACTERS) {
        return Ok(shell_words::quote(prompt).into_owned());
    }
    Ok(prompt.to_string())
}

fn injection_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)```\s*bash",
            r"(?i)```\s*shell",
            r"\$\{.*\}",
            r"\$\(.*\)",
            r"[;&|`]",
            r"(?i)<script",
            r"(?i)javascript:",
        ]
        .into_iter()
        .map(|pattern| Regex::new(pattern).unwrap())
        .collect()
    })
}

/// Scan externally supplied style-template text for command/script
/// injection content.
///
/// Returns a "looks clean" flag plus one advisory warning per pattern
/// family that matched. The caller is expected to surface the warnings and
/// use the template as-is; this never blocks execution.
pub fn validate_style_content(content: &str) -> (bool, Vec<String>) {
    let mut warnings = Vec::new();
    for pattern in injection_patterns() {
        if let Some(found) = pattern.find(content) {
            let excerpt: String = found.as_str().chars().take(50).collect();
            warnings.push(format!("Suspicious pattern: {excerpt}..."));
        }
    }
    (warnings.is_empty(), warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prompt_is_rejected() {
        assert_eq!(sanitize_prompt(""), Err(InputError::EmptyPrompt));
        assert_eq!(sanitize_prompt("   \t\n"), Err(InputError::EmptyPrompt));
    }

    #[test]
    fn clean_prompt_passes_through_unchanged() {
        assert_eq!(
            sanitize_prompt("A minimal 3D cube").as_deref(),
            Ok("A minimal 3D cube")
        );
    }

    #[test]
    fn metacharacters_trigger_shell_quoting() {
        let quoted = sanitize_prompt("red cube; rm -rf /").unwrap();
        assert_ne!(quoted, "red cube; rm -rf /");
        assert_eq!(
            shell_words::split(&quoted).unwrap(),
            vec!["red cube; rm -rf /".to_string()]
        );

        let dollar = sanitize_prompt("echo $HOME").unwrap();
        assert_eq!(
            shell_words::split(&dollar).unwrap(),
            vec!["echo $HOME".to_string()]
        );
    }

    #[test]
    fn clean_style_content_yields_no_warnings() {
        let (clean, warnings) =
            validate_style_content("Render in soft glass, muted pastel palette.");
        assert!(clean);
        assert!(warnings.is_empty());
    }

    #[test]
    fn each_pattern_family_warns_once() {
        let samples = [
            "```bash\nls\n```",
            "``` shell\necho hi\n```",
            "use ${HOME} here",
            "run $(whoami) now",
            "<script>alert(1)</script>",
            "click javascript:void(0)",
        ];
        for sample in samples {
            let (clean, warnings) = validate_style_content(sample);
            assert!(!clean, "expected warning for {sample:?}");
            assert!(!warnings.is_empty());
            assert!(warnings[0].starts_with("Suspicious pattern: "));
        }
    }

    #[test]
    fn warning_excerpt_is_capped() {
        let long = format!("${{{}}}", "A".repeat(200));
        let (_, warnings) = validate_style_content(&long);
        let excerpt = warnings[0]
            .trim_start_matches("Suspicious pattern: ")
            .trim_end_matches("...");
        assert_eq!(excerpt.chars().count(), 50);
    }
}
