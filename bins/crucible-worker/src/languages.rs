// Per-language sandbox runtime boundary: one image and one fixed
// shell invocation per supported language.

use crate::errors::ExecError;
use crucible_common::types::Language;

/// Fixed in-sandbox working path; the host scratch directory is
/// bind-mounted here.
pub const WORKDIR: &str = "/app";

pub fn image_for(language: Language) -> &'static str {
    match language {
        Language::Javascript | Language::Typescript => "node:16-alpine",
        Language::Python => "python:3.9-alpine",
        Language::Go => "golang:1.17-alpine",
    }
}

fn file_extension(language: Language) -> &'static str {
    match language {
        Language::Javascript => "js",
        Language::Typescript => "ts",
        Language::Python => "py",
        Language::Go => "go",
    }
}

/// Interpreter invocation for a language, or `UnsupportedLanguage` for
/// languages that are provisioned but have no run template yet.
/// Checked before any sandbox work.
pub fn interpreter(language: Language) -> Result<&'static str, ExecError> {
    match language {
        Language::Javascript => Ok("node"),
        Language::Python => Ok("python"),
        Language::Go => Ok("go run"),
        Language::Typescript => Err(ExecError::UnsupportedLanguage(language)),
    }
}

/// `sh -c "cat <input> | <interpreter> <source>"` — the staged input
/// file is piped into the runtime invoked on the staged source file.
pub fn run_command(interpreter: &str, source_file: &str, input_file: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "cat {workdir}/{input} | {interpreter} {workdir}/{source}",
            workdir = WORKDIR,
            input = input_file,
            source = source_file,
        ),
    ]
}

/// Collision-resistant staged file names; the scratch directory is
/// shared across every sandbox of this process.
pub fn source_filename(language: Language) -> String {
    format!(
        "solution-{}.{}",
        uuid::Uuid::new_v4(),
        file_extension(language)
    )
}

pub fn input_filename() -> String {
    format!("input-{}.txt", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_mapping() {
        assert_eq!(image_for(Language::Javascript), "node:16-alpine");
        assert_eq!(image_for(Language::Typescript), "node:16-alpine");
        assert_eq!(image_for(Language::Python), "python:3.9-alpine");
        assert_eq!(image_for(Language::Go), "golang:1.17-alpine");
    }

    #[test]
    fn test_typescript_has_no_run_template() {
        assert!(interpreter(Language::Typescript).is_err());
        assert!(interpreter(Language::Javascript).is_ok());
    }

    #[test]
    fn test_run_command_pipes_input() {
        let cmd = run_command("python", "solution-1.py", "input-1.txt");
        assert_eq!(cmd[0], "sh");
        assert_eq!(cmd[1], "-c");
        assert_eq!(cmd[2], "cat /app/input-1.txt | python /app/solution-1.py");
    }

    #[test]
    fn test_staged_names_are_unique() {
        assert_ne!(
            source_filename(Language::Python),
            source_filename(Language::Python)
        );
        assert_ne!(input_filename(), input_filename());
        assert!(source_filename(Language::Go).ends_with(".go"));
        assert!(input_filename().starts_with("input-"));
    }
}
