mod preprocess;

use std::collections::HashMap;

use uuid::Uuid;

use crate::engine::{config::PoolConfig, error::EngineError, models::Language};

/// Directory inside every sandbox where sources are uploaded and built.
pub const WORKSPACE_DIR: &str = "/sandbox";

type CommandTemplate = fn(&str) -> Vec<String>;

#[derive(Debug, Clone)]
pub struct LanguageProfile {
    pub language: Language,
    pub image: &'static str,
    pub extension: &'static str,
    pub requires_compilation: bool,
    /// Shell snippets run once against a freshly created container.
    pub setup_commands: &'static [&'static str],
    pub pool_size: usize,
    compile: Option<CommandTemplate>,
    run: CommandTemplate,
    preprocess: Option<fn(&str) -> String>,
    filename: Option<fn(&str) -> Option<String>>,
}

impl LanguageProfile {
    fn for_language(language: Language, pool_size: usize) -> Self {
        let base = Self {
            language,
            image: "",
            extension: "",
            requires_compilation: false,
            setup_commands: &[],
            pool_size,
            compile: None,
            run: |_| Vec::new(),
            preprocess: None,
            filename: None,
        };
        match language {
            Language::Python => Self {
                image: "python:3.12-alpine",
                extension: "py",
                run: |file| argv(["python3", "-u", &workspace_path(file)]),
                ..base
            },
            Language::JavaScript => Self {
                image: "node:22-alpine",
                extension: "js",
                run: |file| argv(["node", &workspace_path(file)]),
                preprocess: Some(preprocess::javascript),
                ..base
            },
            Language::TypeScript => Self {
                image: "mcr.microsoft.com/devcontainers/typescript-node:22",
                extension: "ts",
                requires_compilation: true,
                setup_commands: &["tsc --version"],
                compile: Some(|file| {
                    argv([
                        "tsc",
                        "--target",
                        "es2020",
                        "--module",
                        "commonjs",
                        "--outDir",
                        WORKSPACE_DIR,
                        &workspace_path(file),
                    ])
                }),
                run: |file| argv(["node", &workspace_path(&format!("{}.js", stem(file)))]),
                preprocess: Some(preprocess::typescript),
                ..base
            },
            Language::Java => Self {
                image: "eclipse-temurin:21-jdk-alpine",
                extension: "java",
                requires_compilation: true,
                compile: Some(|file| argv(["javac", "-d", WORKSPACE_DIR, &workspace_path(file)])),
                run: |file| argv(["java", "-cp", WORKSPACE_DIR, stem(file)]),
                preprocess: Some(preprocess::java),
                filename: Some(preprocess::java_class_name),
                ..base
            },
            Language::C => Self {
                image: "gcc:14",
                extension: "c",
                requires_compilation: true,
                compile: Some(|file| {
                    argv([
                        "gcc",
                        "-O2",
                        "-o",
                        &workspace_path(stem(file)),
                        &workspace_path(file),
                        "-lm",
                    ])
                }),
                run: |file| argv([workspace_path(stem(file)).as_str()]),
                preprocess: Some(preprocess::c),
                ..base
            },
            Language::Cpp => Self {
                image: "gcc:14",
                extension: "cpp",
                requires_compilation: true,
                compile: Some(|file| {
                    argv([
                        "g++",
                        "-O2",
                        "-std=c++17",
                        "-o",
                        &workspace_path(stem(file)),
                        &workspace_path(file),
                    ])
                }),
                run: |file| argv([workspace_path(stem(file)).as_str()]),
                preprocess: Some(preprocess::cpp),
                ..base
            },
            Language::Go => Self {
                image: "golang:1.22-alpine",
                extension: "go",
                requires_compilation: true,
                compile: Some(|file| {
                    argv([
                        "go",
                        "build",
                        "-o",
                        &workspace_path(stem(file)),
                        &workspace_path(file),
                    ])
                }),
                run: |file| argv([workspace_path(stem(file)).as_str()]),
                preprocess: Some(preprocess::go),
                ..base
            },
            Language::Ruby => Self {
                image: "ruby:3.3-alpine",
                extension: "rb",
                run: |file| argv(["ruby", &workspace_path(file)]),
                ..base
            },
            Language::Php => Self {
                image: "php:8.3-cli-alpine",
                extension: "php",
                run: |file| argv(["php", &workspace_path(file)]),
                preprocess: Some(preprocess::php),
                ..base
            },
            Language::Kotlin => Self {
                image: "zenika/kotlin:1.9",
                extension: "kt",
                requires_compilation: true,
                setup_commands: &["kotlinc -version"],
                compile: Some(|file| {
                    argv([
                        "kotlinc",
                        &workspace_path(file),
                        "-include-runtime",
                        "-d",
                        &workspace_path(&format!("{}.jar", stem(file))),
                    ])
                }),
                run: |file| {
                    argv(["java", "-jar", &workspace_path(&format!("{}.jar", stem(file)))])
                },
                preprocess: Some(preprocess::kotlin),
                ..base
            },
        }
    }

    /// Source filename for one execution; unique per `id` unless the
    /// language ties the filename to the code (Java public classes).
    pub fn filename_for(&self, code: &str, id: &Uuid) -> String {
        self.filename
            .and_then(|derive| derive(code))
            .map(|name| format!("{name}.{}", self.extension))
            .unwrap_or_else(|| format!("code_{}.{}", id.simple(), self.extension))
    }

    pub fn prepare_source(&self, code: &str) -> String {
        match self.preprocess {
            Some(transform) => transform(code),
            None => code.to_string(),
        }
    }

    pub fn compile_command(&self, filename: &str) -> Option<Vec<String>> {
        if !self.requires_compilation {
            return None;
        }
        self.compile.map(|template| template(filename))
    }

    pub fn run_command(&self, filename: &str) -> Vec<String> {
        (self.run)(filename)
    }
}

#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, LanguageProfile>,
}

impl LanguageRegistry {
    pub fn new(pool: &PoolConfig) -> Self {
        let profiles = Language::ALL
            .into_iter()
            .map(|language| {
                (
                    language,
                    LanguageProfile::for_language(language, pool.pool_size(language)),
                )
            })
            .collect();
        Self { profiles }
    }

    pub fn lookup(&self, language: Language) -> Result<&LanguageProfile, EngineError> {
        self.profiles
            .get(&language)
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.to_string()))
    }

    pub fn lookup_tag(&self, tag: &str) -> Result<&LanguageProfile, EngineError> {
        let language = tag
            .parse::<Language>()
            .map_err(EngineError::UnsupportedLanguage)?;
        self.lookup(language)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.values()
    }
}

fn workspace_path(name: &str) -> String {
    format!("{WORKSPACE_DIR}/{name}")
}

fn stem(filename: &str) -> &str {
    filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(filename)
}

fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}
