//! 批处理模式的执行语言

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 执行语言：决定脚本文件名与运行命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    JavaScript,
    Bash,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Python, Language::JavaScript, Language::Bash];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Bash => "bash",
        }
    }

    /// 提示词里使用的名字
    pub fn display_name(&self) -> &'static str {
        match self {
            Language::Python => "Python",
            Language::JavaScript => "JavaScript",
            Language::Bash => "Bash",
        }
    }

    pub fn script_name(&self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::JavaScript => "main.js",
            Language::Bash => "main.sh",
        }
    }

    fn runner(&self) -> &'static str {
        match self {
            Language::Python => "python3",
            Language::JavaScript => "node",
            Language::Bash => "bash",
        }
    }

    /// 运行 `<dir>/<script>` 的命令
    pub fn command(&self, script_path: &str) -> String {
        format!("{} {}", self.runner(), super::shell_quote(script_path))
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" | "python3" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "bash" | "sh" | "shell" => Ok(Language::Bash),
            other => Err(format!(
                "unsupported language '{}' (expected python, javascript or bash)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_commands() {
        assert_eq!(
            Language::Python.command("project/main.py"),
            "python3 'project/main.py'"
        );
        assert_eq!(Language::JavaScript.script_name(), "main.js");
        assert_eq!(Language::Bash.command("p/main.sh"), "bash 'p/main.sh'");
    }

    #[test]
    fn test_parse() {
        assert_eq!("JS".parse::<Language>(), Ok(Language::JavaScript));
        assert_eq!("py".parse::<Language>(), Ok(Language::Python));
        assert!("ruby".parse::<Language>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        let lang: Language = serde_json::from_str("\"javascript\"").unwrap();
        assert_eq!(lang, Language::JavaScript);
        assert_eq!(serde_json::to_string(&Language::Bash).unwrap(), "\"bash\"");
    }
}
