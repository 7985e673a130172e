//! The closed set of languages a run can be requested in.

use crate::error::SandboxError;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Language {
    JavaScript,
    TypeScript,
    /// JSX with optional TypeScript annotations.
    React,
    /// Markup, shown as passive content unless it carries scripts.
    Html,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::JavaScript,
        Language::TypeScript,
        Language::React,
        Language::Html,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::React => "react",
            Language::Html => "html",
        }
    }

    pub(crate) fn dialect(&self) -> Dialect {
        match self {
            Language::JavaScript | Language::Html => Dialect::default(),
            Language::TypeScript => Dialect {
                typescript: true,
                jsx: false,
            },
            Language::React => Dialect {
                typescript: true,
                jsx: true,
            },
        }
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" => Ok(Language::JavaScript),
            "typescript" | "ts" => Ok(Language::TypeScript),
            "react" | "jsx" | "tsx" => Ok(Language::React),
            "html" => Ok(Language::Html),
            _ => Err(SandboxError::UnsupportedLanguage(tag.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Syntax extensions accepted on top of JavaScript.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Dialect {
    pub typescript: bool,
    pub jsx: bool,
}

impl Dialect {
    /// Whether parse failures are reported as translation errors.
    pub fn translates(&self) -> bool {
        self.typescript || self.jsx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        assert_eq!("js".parse::<Language>().unwrap(), Language::JavaScript);
        assert_eq!("TypeScript".parse::<Language>().unwrap(), Language::TypeScript);
        assert_eq!("tsx".parse::<Language>().unwrap(), Language::React);
        assert_eq!("html".parse::<Language>().unwrap(), Language::Html);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert_eq!(
            "unsupported".parse::<Language>(),
            Err(SandboxError::UnsupportedLanguage("unsupported".into()))
        );
    }
}
