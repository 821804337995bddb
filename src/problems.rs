use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{JudgeError, Result};
use crate::harness::{TEST_DATA_FILE, TestData};
use crate::language::Language;

/// Driver and test data stored for one problem
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Problem {
    pub driver_code: Option<String>,
    pub test_data: Option<TestData>,
}

/// Problems laid out on disk as `<dir>/<problem_id>/driver.<ext>` and `<dir>/<problem_id>/test_data.txt`
#[derive(Debug, Clone)]
pub struct ProblemStore {
    dir: Option<PathBuf>,
}

impl ProblemStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        if dir.is_none() {
            log::warn!("No problems directory configured, requests must carry their own driver");
        }
        Self { dir }
    }

    /// Loads what is stored for `problem_id` in the given language
    ///
    /// A problem directory without a driver for this language, or without test
    /// data, yields `None` for the missing part.
    pub fn load(&self, problem_id: &str, language: Language) -> Result<Problem> {
        validate_id(problem_id)?;
        let not_found = || JudgeError::ProblemNotFound(problem_id.to_string());

        let dir = self.dir.as_deref().ok_or_else(not_found)?.join(problem_id);
        if !dir.is_dir() {
            return Err(not_found());
        }

        let driver_code = read_optional(&dir.join(language.profile().driver_file))?;
        let test_data = read_optional(&dir.join(TEST_DATA_FILE))?.map(TestData::Raw);
        if driver_code.is_none() {
            log::debug!("Problem {problem_id} has no {language} driver");
        }

        Ok(Problem {
            driver_code,
            test_data,
        })
    }
}

/// Ids become path components: only letters, digits, `-` and `_` are allowed
fn validate_id(problem_id: &str) -> Result<()> {
    let valid = !problem_id.is_empty()
        && problem_id.len() <= 128
        && problem_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(JudgeError::InvalidRequest(format!(
            "invalid problem id `{problem_id}`"
        )))
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
