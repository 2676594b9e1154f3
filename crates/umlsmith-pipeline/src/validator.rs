use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use umlsmith_core::Settings;

use crate::repair::{SyntaxValidator, Validation};

const EMPTY_DIAGRAM: &str = "PlantUML diagram is empty.";

/// Syntax check through `java -jar plantuml.jar -check`.
#[derive(Debug, Clone)]
pub struct PlantUmlValidator {
    jar: Option<PathBuf>,
    java_cmd: String,
    timeout: Duration,
}

impl PlantUmlValidator {
    pub fn new(jar: Option<PathBuf>, java_cmd: impl Into<String>, timeout: Duration) -> Self {
        Self {
            jar,
            java_cmd: java_cmd.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.plantuml_jar.as_ref().map(PathBuf::from),
            settings.java_cmd.clone(),
            Duration::from_secs(settings.validator_timeout_secs),
        )
    }

    fn jar(&self) -> Option<&Path> {
        self.jar.as_deref().filter(|p| p.is_file())
    }

    async fn run_check(&self, jar: &Path, payload: &str) -> Validation {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(error = %e, "cannot create validator workspace");
                return Validation::Unavailable;
            }
        };
        let file = dir.path().join("diagram.puml");
        if let Err(e) = tokio::fs::write(&file, payload).await {
            tracing::warn!(error = %e, "cannot write diagram for validation");
            return Validation::Unavailable;
        }

        let child = Command::new(&self.java_cmd)
            .arg("-jar")
            .arg(jar)
            .arg("-check")
            .arg(&file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(java = %self.java_cmd, error = %e, "cannot start plantuml");
                return Validation::Unavailable;
            }
        };

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "plantuml did not complete");
                return Validation::Unavailable;
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "plantuml check timed out");
                return Validation::Unavailable;
            }
        };

        if output.status.success() {
            return Validation::Valid;
        }
        let mut diagnostic = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !diagnostic.is_empty() {
                diagnostic.push('\n');
            }
            diagnostic.push_str(stderr.trim());
        }
        Validation::Invalid(diagnostic)
    }
}

#[async_trait]
impl SyntaxValidator for PlantUmlValidator {
    fn is_available(&self) -> bool {
        self.jar().is_some() && which::which(&self.java_cmd).is_ok()
    }

    async fn validate(&self, payload: &str) -> Validation {
        if payload.trim().is_empty() {
            return Validation::Invalid(EMPTY_DIAGRAM.to_string());
        }
        let Some(jar) = self.jar() else {
            return Validation::Unavailable;
        };
        self.run_check(jar, payload).await
    }
}

/// Validator for setups without a syntax checker.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoValidator;

#[async_trait]
impl SyntaxValidator for NoValidator {
    fn is_available(&self) -> bool {
        false
    }

    async fn validate(&self, _payload: &str) -> Validation {
        Validation::Unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_diagram_is_invalid_even_without_jar() {
        let validator = PlantUmlValidator::new(None, "java", Duration::from_secs(5));
        assert_eq!(
            validator.validate("  \n").await,
            Validation::Invalid(EMPTY_DIAGRAM.to_string())
        );
    }

    #[tokio::test]
    async fn missing_jar_is_unavailable() {
        let validator = PlantUmlValidator::new(
            Some(PathBuf::from("/nonexistent/plantuml.jar")),
            "java",
            Duration::from_secs(5),
        );
        assert!(!validator.is_available());
        assert_eq!(
            validator.validate("@startuml\nA -> B\n@enduml").await,
            Validation::Unavailable
        );
    }

    #[tokio::test]
    async fn unknown_java_command_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("plantuml.jar");
        std::fs::write(&jar, b"not really a jar").unwrap();
        let validator = PlantUmlValidator::new(
            Some(jar),
            "definitely-not-a-java-binary-umlsmith",
            Duration::from_secs(5),
        );
        assert!(!validator.is_available());
        assert_eq!(
            validator.validate("@startuml\nA -> B\n@enduml").await,
            Validation::Unavailable
        );
    }
}
