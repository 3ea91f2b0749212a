use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Java,
    C,
    Cpp,
    Go,
    Ruby,
    Php,
    Kotlin,
}

impl Language {
    pub const ALL: [Language; 10] = [
        Language::Python,
        Language::JavaScript,
        Language::TypeScript,
        Language::Java,
        Language::C,
        Language::Cpp,
        Language::Go,
        Language::Ruby,
        Language::Php,
        Language::Kotlin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Go => "go",
            Language::Ruby => "ruby",
            Language::Php => "php",
            Language::Kotlin => "kotlin",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Self::Python),
            "javascript" | "js" => Ok(Self::JavaScript),
            "typescript" | "ts" => Ok(Self::TypeScript),
            "java" => Ok(Self::Java),
            "c" => Ok(Self::C),
            "cpp" | "c++" => Ok(Self::Cpp),
            "go" | "golang" => Ok(Self::Go),
            "ruby" | "rb" => Ok(Self::Ruby),
            "php" => Ok(Self::Php),
            "kotlin" | "kt" => Ok(Self::Kotlin),
            _ => Err(s.to_string()),
        }
    }
}

/// Resource ceilings applied to every sandbox container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerLimits {
    pub cpu_cores: f32,
    pub memory_mb: u64,
    pub max_processes: i64,
    pub max_output_bytes: usize,
}

impl ContainerLimits {
    pub fn normalized(mut self) -> Self {
        self.cpu_cores = self.cpu_cores.clamp(0.1, 4.0);
        self.memory_mb = self.memory_mb.clamp(32, 8192);
        self.max_processes = self.max_processes.clamp(8, 1024);
        self.max_output_bytes = self.max_output_bytes.clamp(1024, 4 * 1024 * 1024);
        self
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_cores as f64 * 1_000_000_000.0) as i64
    }
}

/// Language stays a raw string here so unknown tags surface as
/// `UnsupportedLanguage` rather than a JSON rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub language: Language,
    pub limit: usize,
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
}

#[cfg(test)]
mod tests {
    use super::{ContainerLimits, Language};

    #[test]
    fn normalizes_limits_to_safe_bounds() {
        let normalized = ContainerLimits {
            cpu_cores: 0.01,
            memory_mb: 1,
            max_processes: 99_999,
            max_output_bytes: 99_000_000,
        }
        .normalized();

        assert_eq!(normalized.cpu_cores, 0.1);
        assert_eq!(normalized.memory_mb, 32);
        assert_eq!(normalized.max_processes, 1024);
        assert_eq!(normalized.max_output_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn parses_tags_and_aliases() {
        assert_eq!("Python".parse::<Language>(), Ok(Language::Python));
        assert_eq!("c++".parse::<Language>(), Ok(Language::Cpp));
        assert_eq!(" golang ".parse::<Language>(), Ok(Language::Go));
        assert_eq!("ts".parse::<Language>(), Ok(Language::TypeScript));
        assert!("ruby2".parse::<Language>().is_err());
    }

    #[test]
    fn display_round_trips_every_tag() {
        for language in Language::ALL {
            assert_eq!(language.to_string().parse::<Language>(), Ok(language));
        }
    }
}
