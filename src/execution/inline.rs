//! Inline-code test cases: materialise the code as a throwaway test file.
//!
//! The code is never evaluated in-process. It is written into a fresh temp
//! directory under a file name the framework will collect, then run through
//! the same adapter as any repository-backed test.

use std::path::Path;

use tempfile::TempDir;

use crate::framework::Framework;

/// File name an inline script gets for `framework`; each matches that
/// framework's discovery predicate.
pub fn inline_file_name(framework: Framework) -> &'static str {
    match framework {
        Framework::Pytest => "test_inline.py",
        Framework::Unittest => "inline_test.py",
        Framework::Robot => "inline.robot",
        Framework::Cypress => "inline.cy.js",
        Framework::Playwright => "inline.spec.js",
    }
}

/// A written inline script. The directory is removed on drop.
#[derive(Debug)]
pub struct InlineScript {
    dir: TempDir,
    file_name: &'static str,
}

impl InlineScript {
    pub fn write(framework: Framework, code: &str) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("flowtest-inline-").tempdir()?;
        let file_name = inline_file_name(framework);
        std::fs::write(dir.path().join(file_name), code)?;
        Ok(Self { dir, file_name })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn file_name(&self) -> &'static str {
        self.file_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_collectable() {
        for fw in Framework::ALL {
            assert!(fw.is_test_file(inline_file_name(fw)), "{fw} would not collect its inline file");
        }
    }

    #[test]
    fn test_script_removed_on_drop() {
        let script = InlineScript::write(Framework::Pytest, "def test_ok():\n    assert True\n").unwrap();
        let path = script.dir().join(script.file_name());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "def test_ok():\n    assert True\n");
        drop(script);
        assert!(!path.exists());
    }
}
