use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JudgeError, Result};
use crate::language::Language;
use crate::sandbox::Workspace;
use crate::session::ExecutionRequest;

/// File the serialized test data is written to, next to the driver
pub const TEST_DATA_FILE: &str = "test_data.txt";

const CASE_PREFIX: &str = "CASE|";
const CASE_FIELDS: usize = 6;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CaseData {
    pub input: Value,
    pub expected: Value,
}

/// Test data attached to a request
///
/// Structured cases are handed to the driver one JSON object per line; raw
/// text is passed through untouched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum TestData {
    Cases(Vec<CaseData>),
    Raw(String),
}

impl TestData {
    pub fn to_text(&self) -> Result<String> {
        match self {
            Self::Cases(cases) => {
                let mut text = String::new();
                for case in cases {
                    let line = serde_json::to_string(case).map_err(|e| {
                        JudgeError::InvalidRequest(format!("test case cannot be serialized: {e}"))
                    })?;
                    text.push_str(&line);
                    text.push('\n');
                }
                Ok(text)
            }
            Self::Raw(text) => Ok(text.clone()),
        }
    }
}

/// Source files of an assembled execution, relative to its workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sources {
    /// Script to interpret or translation unit to compile
    pub entry: String,
    pub files: Vec<String>,
}

#[derive(Debug)]
pub struct Assembled {
    pub sources: Sources,
    /// Text to feed on the program's stdin
    pub stdin: Option<String>,
}

/// Writes solution, driver and test data into the workspace
///
/// A compiled driver that does not `#include` the solution itself gets a
/// synthesized unit including the solution first, then the driver.
pub fn assemble(request: &ExecutionRequest, workspace: &Workspace) -> Result<Assembled> {
    let profile = request.language.profile();

    workspace.write(profile.solution_file, &request.source_code)?;
    let mut files = vec![profile.solution_file.to_string()];

    let entry = match &request.driver_code {
        Some(driver) => {
            workspace.write(profile.driver_file, driver)?;
            files.push(profile.driver_file.to_string());
            match profile.synthesized_unit {
                Some(unit) if !includes(driver, profile.solution_file) => {
                    workspace.write(unit, &synthesize_unit(request.language))?;
                    files.push(unit.to_string());
                    unit.to_string()
                }
                _ => profile.driver_file.to_string(),
            }
        }
        None => profile.solution_file.to_string(),
    };

    let stdin = match &request.test_data {
        Some(data) => {
            let text = data.to_text()?;
            workspace.write(TEST_DATA_FILE, &text)?;
            Some(text)
        }
        None => None,
    };

    Ok(Assembled {
        sources: Sources { entry, files },
        stdin,
    })
}

fn includes(driver: &str, solution_file: &str) -> bool {
    let quoted = format!("\"{solution_file}\"");
    driver
        .lines()
        .any(|line| line.trim_start().starts_with("#include") && line.contains(&quoted))
}

fn synthesize_unit(language: Language) -> String {
    let profile = language.profile();
    format!(
        "#include \"{}\"\n#include \"{}\"\n",
        profile.solution_file, profile.driver_file
    )
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CaseStatus {
    Pass,
    Fail,
}

impl CaseStatus {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "PASS" => Some(Self::Pass),
            "FAIL" => Some(Self::Fail),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

/// One `CASE|<id>|<PASS|FAIL>|<input>|<actual>|<expected>` line reported by a driver
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub id: String,
    pub status: CaseStatus,
    pub input_summary: String,
    pub actual_output: String,
    pub expected_output: String,
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CASE_PREFIX}{}|{}|{}|{}|{}",
            self.id,
            self.status.as_str(),
            self.input_summary,
            self.actual_output,
            self.expected_output
        )
    }
}

/// A `CASE|` line that could not be understood
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    /// 1-based line number in the program output
    pub line: usize,
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    AllPassed,
    SomeFailed,
    NoCasesParsed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedResults {
    pub cases: Vec<TestCase>,
    pub warnings: Vec<ParseWarning>,
}

impl ParsedResults {
    pub fn verdict(&self) -> Verdict {
        if self.cases.is_empty() {
            Verdict::NoCasesParsed
        } else if self.cases.iter().all(|c| c.status == CaseStatus::Pass) {
            Verdict::AllPassed
        } else {
            Verdict::SomeFailed
        }
    }
}

/// Extracts the per-case results from raw program output
pub fn parse_results(raw: &str) -> ParsedResults {
    let mut results = ParsedResults::default();

    for (index, line) in raw.lines().enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if !line.starts_with(CASE_PREFIX) {
            continue;
        }
        match parse_case_line(line) {
            Ok(case) => results.cases.push(case),
            Err(reason) => {
                log::debug!("Malformed result line {}: {reason}", index + 1);
                results.warnings.push(ParseWarning {
                    line: index + 1,
                    reason,
                });
            }
        }
    }

    results
}

fn parse_case_line(line: &str) -> std::result::Result<TestCase, String> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() != CASE_FIELDS {
        return Err(format!(
            "expected {CASE_FIELDS} `|`-separated fields, found {}",
            fields.len()
        ));
    }
    let status = CaseStatus::parse(fields[2])
        .ok_or_else(|| format!("unknown case status `{}`", fields[2]))?;

    Ok(TestCase {
        id: fields[1].to_string(),
        status,
        input_summary: fields[3].to_string(),
        actual_output: fields[4].to_string(),
        expected_output: fields[5].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{LimitProfile, Mode};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TWO_SUM_OUTPUT: &str = "\
CASE|1|PASS|nums=[2,7,11,15], target=9|[0, 1]|[0, 1]
CASE|2|PASS|nums=[3,2,4], target=6|[1, 2]|[1, 2]
debug: done
";

    fn request(language: Language, driver: Option<&str>) -> ExecutionRequest {
        ExecutionRequest {
            language,
            source_code: "solution".to_string(),
            driver_code: driver.map(str::to_string),
            test_data: Some(TestData::Cases(vec![CaseData {
                input: json!({"nums": [2, 7, 11, 15], "target": 9}),
                expected: json!([0, 1]),
            }])),
            mode: Mode::Batch,
            limits: LimitProfile::Judge,
        }
    }

    #[test]
    fn test_two_sum_all_passed() {
        let results = parse_results(TWO_SUM_OUTPUT);
        assert_eq!(results.cases.len(), 2);
        assert!(results.warnings.is_empty());
        assert_eq!(results.verdict(), Verdict::AllPassed);
        assert_eq!(results.cases[0].input_summary, "nums=[2,7,11,15], target=9");
        assert_eq!(results.cases[1].actual_output, "[1, 2]");
    }

    #[test]
    fn test_two_sum_some_failed() {
        let raw = "CASE|1|PASS|a|[0, 1]|[0, 1]\r\nCASE|2|FAIL|b|[]|[1, 2]\r\n";
        let results = parse_results(raw);
        assert_eq!(results.verdict(), Verdict::SomeFailed);
        assert_eq!(results.cases[1].status, CaseStatus::Fail);
        assert_eq!(results.cases[1].expected_output, "[1, 2]");
    }

    #[test]
    fn test_malformed_lines_become_warnings() {
        let raw = "hello\nCASE|1|PASS|x|y\nCASE|2|MAYBE|x|y|z\nCASE|3|FAIL|x|y|z\n";
        let results = parse_results(raw);
        assert_eq!(results.cases.len(), 1);
        assert_eq!(results.cases[0].id, "3");
        assert_eq!(
            results.warnings.iter().map(|w| w.line).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert_eq!(results.verdict(), Verdict::SomeFailed);
    }

    #[test]
    fn test_no_cases_parsed() {
        assert_eq!(parse_results("").verdict(), Verdict::NoCasesParsed);
        assert_eq!(parse_results("42\n").verdict(), Verdict::NoCasesParsed);
    }

    #[test]
    fn test_case_line_round_trip() {
        let case = TestCase {
            id: "7".to_string(),
            status: CaseStatus::Fail,
            input_summary: "s=\"abc\"".to_string(),
            actual_output: "2".to_string(),
            expected_output: "3".to_string(),
        };
        let line = case.to_string();
        assert_eq!(line, "CASE|7|FAIL|s=\"abc\"|2|3");
        assert_eq!(parse_results(&line).cases, vec![case]);
    }

    #[test]
    fn test_test_data_lines() {
        let data: TestData = serde_json::from_value(json!([
            {"input": {"n": 1}, "expected": 1},
            {"input": {"n": 2}, "expected": 2},
        ]))
        .unwrap();
        let text = data.to_text().unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[1], json!({"input": {"n": 2}, "expected": 2}));

        let raw: TestData = serde_json::from_value(json!("1 2\n")).unwrap();
        assert_eq!(raw.to_text().unwrap(), "1 2\n");
    }

    #[test]
    fn test_assemble_python_with_driver() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        let assembled =
            assemble(&request(Language::Python, Some("import solution\n")), &workspace).unwrap();

        assert_eq!(assembled.sources.entry, "driver.py");
        assert_eq!(assembled.sources.files, vec!["solution.py", "driver.py"]);
        let on_disk = std::fs::read_to_string(workspace.join(TEST_DATA_FILE)).unwrap();
        assert_eq!(Some(on_disk), assembled.stdin);
    }

    #[test]
    fn test_assemble_cpp_driver_including_solution() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        let driver = "#include \"solution.cpp\"\nint main() {}\n";
        let assembled = assemble(&request(Language::Cpp, Some(driver)), &workspace).unwrap();
        assert_eq!(assembled.sources.entry, "driver.cpp");
    }

    #[test]
    fn test_assemble_cpp_synthesizes_unit() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        let assembled =
            assemble(&request(Language::Cpp, Some("int main() {}\n")), &workspace).unwrap();

        assert_eq!(assembled.sources.entry, "judge_main.cpp");
        let unit = std::fs::read_to_string(workspace.join("judge_main.cpp")).unwrap();
        assert_eq!(unit, "#include \"solution.cpp\"\n#include \"driver.cpp\"\n");
    }

    #[test]
    fn test_assemble_without_driver_or_data() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        let mut req = request(Language::C, None);
        req.test_data = None;
        let assembled = assemble(&req, &workspace).unwrap();

        assert_eq!(assembled.sources.entry, "solution.c");
        assert!(assembled.stdin.is_none());
        assert!(!workspace.join(TEST_DATA_FILE).exists());
    }
}
