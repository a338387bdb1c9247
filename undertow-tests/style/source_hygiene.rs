//! Source Hygiene Enforcement
//!
//! Production code propagates errors instead of unwrapping them and does not
//! silence dead code. Everything from the first `#[cfg(test)]` of a file on is
//! test code and exempt, as are feature-gated test helpers.

use std::fs;
use std::path::{Path, PathBuf};

/// Source roots of the production crates, relative to this package.
const PRODUCTION_ROOTS: &[&str] = &[
    "../undertow-core/src",
    "../undertow-sim/src",
    "../undertow-cli/src",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Unwrap,
    Expect,
    DeadCode,
}

impl Rule {
    fn matching(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.starts_with("//") {
            return None;
        }
        if trimmed.contains("#[allow(") && trimmed.contains("dead_code") {
            Some(Rule::DeadCode)
        } else if trimmed.contains(".unwrap()") {
            Some(Rule::Unwrap)
        } else if trimmed.contains(".expect(") {
            Some(Rule::Expect)
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct HygieneViolation {
    file_path: String,
    line_number: usize,
    rule: Rule,
    context: String,
}

#[derive(Default)]
struct HygieneChecker {
    violations: Vec<HygieneViolation>,
    files_checked: usize,
}

impl HygieneChecker {
    fn collect_rust_files(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_rust_files(&path, files)?;
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                files.push(path);
            }
        }
        Ok(())
    }

    fn is_test_helper(path: &Path) -> bool {
        path.file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with("test_"))
    }

    fn check_source(&mut self, file_path: &str, content: &str) {
        self.files_checked += 1;

        for (index, line) in content.lines().enumerate() {
            if line.trim_start().starts_with("#[cfg(test)]") {
                break;
            }
            if let Some(rule) = Rule::matching(line) {
                self.violations.push(HygieneViolation {
                    file_path: file_path.to_string(),
                    line_number: index + 1,
                    rule,
                    context: line.trim().to_string(),
                });
            }
        }
    }

    fn check_workspace(&mut self) -> std::io::Result<()> {
        let mut files = Vec::new();
        for root in PRODUCTION_ROOTS {
            Self::collect_rust_files(Path::new(root), &mut files)?;
        }

        for file in files.iter().filter(|file| !Self::is_test_helper(file)) {
            let content = fs::read_to_string(file)?;
            self.check_source(&file.to_string_lossy(), &content);
        }
        Ok(())
    }

    fn report_violations(&self) -> bool {
        if self.violations.is_empty() {
            println!(
                "Source hygiene: {} files checked, no violations found",
                self.files_checked
            );
            return true;
        }

        println!("Source hygiene violations found:");
        for violation in &self.violations {
            println!(
                "{}:{} [{:?}]\n  {}",
                violation.file_path, violation.line_number, violation.rule, violation.context
            );
        }
        println!(
            "Found {} violation(s) in {} file(s) checked",
            self.violations.len(),
            self.files_checked
        );
        println!("Propagate errors with `?` and delete unused code instead of allowing it.");

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_match_production_patterns() {
        assert_eq!(Rule::matching("let x = y.unwrap();"), Some(Rule::Unwrap));
        assert_eq!(
            Rule::matching("    .expect(\"thread spawn\")"),
            Some(Rule::Expect)
        );
        assert_eq!(
            Rule::matching("#[allow(clippy::too_many_arguments, dead_code)]"),
            Some(Rule::DeadCode)
        );

        assert_eq!(Rule::matching("let x = y.unwrap_or_default();"), None);
        assert_eq!(Rule::matching("/// call `.unwrap()` in tests only"), None);
    }

    #[test]
    fn test_code_after_test_module_is_exempt() {
        let mut checker = HygieneChecker::default();
        let source = r#"
fn production() -> Option<u8> {
    Some(1).map(|x| x + 1)
}

#[allow(dead_code)]
fn unused() {}

#[cfg(test)]
mod tests {
    #[test]
    fn test_it() {
        assert_eq!(super::production().unwrap(), 2);
    }
}
"#;

        checker.check_source("sample.rs", source);

        assert_eq!(checker.violations.len(), 1);
        assert_eq!(checker.violations[0].line_number, 6);
        assert_eq!(checker.violations[0].rule, Rule::DeadCode);
    }

    #[test]
    fn test_helpers_are_exempt() {
        assert!(HygieneChecker::is_test_helper(Path::new(
            "src/network/test_support.rs"
        )));
        assert!(!HygieneChecker::is_test_helper(Path::new(
            "src/network/transport.rs"
        )));
    }

    #[test]
    fn source_hygiene_enforcement() {
        let mut checker = HygieneChecker::default();

        checker
            .check_workspace()
            .expect("Failed to scan workspace sources");

        assert!(
            checker.report_violations(),
            "Source hygiene violations found in production code - see output above"
        );
    }
}
