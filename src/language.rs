use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ToolchainConfig;

/// Languages the judge can build and run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    #[serde(alias = "c++")]
    Cpp,
    C,
}

impl Language {
    pub fn name(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Cpp => "cpp",
            Self::C => "c",
        }
    }

    pub fn profile(self) -> &'static LanguageProfile {
        match self {
            Self::Python => &PYTHON,
            Self::Cpp => &CPP,
            Self::C => &C,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inputs of the build and invoke steps
pub struct BuildContext<'a> {
    pub toolchains: &'a ToolchainConfig,
    pub workdir: &'a Path,
    /// File name of the program entry: script to interpret or unit to compile
    pub entry: &'a str,
    /// Every source file the build must look at
    pub sources: &'a [String],
}

/// Fixed build/invoke strategy of one language
///
/// `build` returns the command of the preparation step (load check or
/// compilation), `invoke` the command that runs the prepared program.
pub struct LanguageProfile {
    pub solution_file: &'static str,
    pub driver_file: &'static str,
    /// Translation unit written when a driver does not include the solution itself
    pub synthesized_unit: Option<&'static str>,
    pub build: fn(&BuildContext) -> Option<Vec<String>>,
    pub invoke: fn(&BuildContext) -> Vec<String>,
}

impl LanguageProfile {
    pub fn is_compiled(&self) -> bool {
        self.synthesized_unit.is_some()
    }
}

const BINARY_NAME: &str = "solution";

// Compiles every file and resolves its top-level imports without executing it;
// a SyntaxError or a missing module exits non-zero with the reason on stderr
const PYTHON_LOAD_CHECK: &str = "\
import ast
import importlib.util
import sys
for path in sys.argv[1:]:
    with open(path, encoding='utf-8') as source:
        text = source.read()
    compile(text, path, 'exec')
    for node in ast.parse(text, path).body:
        if isinstance(node, ast.Import):
            names = [alias.name for alias in node.names]
        elif isinstance(node, ast.ImportFrom) and node.level == 0 and node.module:
            names = [node.module]
        else:
            continue
        for name in names:
            if importlib.util.find_spec(name.partition('.')[0]) is None:
                sys.exit(f'{path}:{node.lineno}: ModuleNotFoundError: No module named {name!r}')
";

static PYTHON: LanguageProfile = LanguageProfile {
    solution_file: "solution.py",
    driver_file: "driver.py",
    synthesized_unit: None,
    build: python_load_check,
    invoke: python_script,
};

static CPP: LanguageProfile = LanguageProfile {
    solution_file: "solution.cpp",
    driver_file: "driver.cpp",
    synthesized_unit: Some("judge_main.cpp"),
    build: cxx_compile,
    invoke: compiled_binary,
};

static C: LanguageProfile = LanguageProfile {
    solution_file: "solution.c",
    driver_file: "driver.c",
    synthesized_unit: Some("judge_main.c"),
    build: c_compile,
    invoke: compiled_binary,
};

fn python_load_check(ctx: &BuildContext) -> Option<Vec<String>> {
    let mut command = vec![
        ctx.toolchains.python.clone(),
        "-c".to_string(),
        PYTHON_LOAD_CHECK.to_string(),
    ];
    command.extend(ctx.sources.iter().cloned());
    Some(command)
}

fn python_script(ctx: &BuildContext) -> Vec<String> {
    vec![
        ctx.toolchains.python.clone(),
        "-u".to_string(),
        ctx.entry.to_string(),
    ]
}

fn compile_command(compiler: &str, standard: &str, entry: &str) -> Vec<String> {
    vec![
        compiler.to_string(),
        format!("-std={standard}"),
        "-O1".to_string(),
        "-pipe".to_string(),
        "-I.".to_string(),
        "-o".to_string(),
        BINARY_NAME.to_string(),
        entry.to_string(),
    ]
}

fn cxx_compile(ctx: &BuildContext) -> Option<Vec<String>> {
    Some(compile_command(
        &ctx.toolchains.cxx,
        &ctx.toolchains.cxx_std,
        ctx.entry,
    ))
}

fn c_compile(ctx: &BuildContext) -> Option<Vec<String>> {
    let mut command = compile_command(&ctx.toolchains.cc, &ctx.toolchains.c_std, ctx.entry);
    command.push("-lm".to_string());
    Some(command)
}

fn compiled_binary(ctx: &BuildContext) -> Vec<String> {
    vec![ctx.workdir.join(BINARY_NAME).to_string_lossy().into_owned()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn context<'a>(
        toolchains: &'a ToolchainConfig,
        entry: &'a str,
        sources: &'a [String],
    ) -> BuildContext<'a> {
        BuildContext {
            toolchains,
            workdir: Path::new("/work/run-1"),
            entry,
            sources,
        }
    }

    #[test]
    fn test_language_names_round_trip() {
        for language in [Language::Python, Language::Cpp, Language::C] {
            let json = serde_json::to_string(&language).unwrap();
            assert_eq!(json, format!("\"{}\"", language.name()));
            assert_eq!(serde_json::from_str::<Language>(&json).unwrap(), language);
        }
        assert_eq!(serde_json::from_str::<Language>("\"c++\"").unwrap(), Language::Cpp);
        assert!(serde_json::from_str::<Language>("\"java\"").is_err());
    }

    #[test]
    fn test_python_strategy() {
        let toolchains = ToolchainConfig::default();
        let sources = vec!["solution.py".to_string(), "driver.py".to_string()];
        let ctx = context(&toolchains, "driver.py", &sources);
        let profile = Language::Python.profile();

        let build = (profile.build)(&ctx).unwrap();
        assert_eq!(build[0], "python3");
        assert_eq!(build[1], "-c");
        assert_eq!(&build[3..], &sources[..]);
        assert_eq!((profile.invoke)(&ctx), vec!["python3", "-u", "driver.py"]);
        assert!(!profile.is_compiled());
    }

    #[test]
    fn test_cpp_strategy() {
        let toolchains = ToolchainConfig::default();
        let sources = vec!["solution.cpp".to_string(), "driver.cpp".to_string()];
        let ctx = context(&toolchains, "driver.cpp", &sources);
        let profile = Language::Cpp.profile();

        assert_eq!(
            (profile.build)(&ctx).unwrap(),
            vec!["g++", "-std=c++17", "-O1", "-pipe", "-I.", "-o", "solution", "driver.cpp"]
        );
        assert_eq!((profile.invoke)(&ctx), vec!["/work/run-1/solution"]);
        assert!(profile.is_compiled());
    }

    #[test]
    fn test_c_links_libm() {
        let toolchains = ToolchainConfig::default();
        let sources = vec!["solution.c".to_string()];
        let ctx = context(&toolchains, "solution.c", &sources);
        let build = (Language::C.profile().build)(&ctx).unwrap();
        assert_eq!(build[0], "gcc");
        assert_eq!(build.last().unwrap(), "-lm");
    }
}
