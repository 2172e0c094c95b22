use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::subprocess::ProcessCommand;

/// Fluent construction of a [`ProcessCommand`]
pub struct ProcessCommandBuilder {
    command: ProcessCommand,
}

impl ProcessCommandBuilder {
    pub fn new(program: &str) -> Self {
        Self {
            command: ProcessCommand {
                program: program.to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                working_dir: None,
                timeout: None,
            },
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.command.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.command
            .args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Paths are passed with forward slashes so backends see repo-relative form
    pub fn arg_path(self, path: &Path) -> Self {
        let text = path.to_string_lossy().replace('\\', "/");
        self.arg(&text)
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.command.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Force untranslated backend messages; the classifiers match English text
    pub fn c_locale(self) -> Self {
        self.env("LC_ALL", "C").env("LANG", "C")
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.command.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.command.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ProcessCommand {
        self.command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_arguments() {
        let command = ProcessCommandBuilder::new("git")
            .arg("add")
            .args(["--", "datasets/cam1/data.dvc"])
            .arg_path(Path::new("datasets/cam1/dataset.yaml"))
            .c_locale()
            .timeout(Duration::from_secs(5))
            .build();

        assert_eq!(command.program, "git");
        assert_eq!(
            command.args,
            vec!["add", "--", "datasets/cam1/data.dvc", "datasets/cam1/dataset.yaml"]
        );
        assert_eq!(command.env.get("LC_ALL").map(String::as_str), Some("C"));
        assert_eq!(command.timeout, Some(Duration::from_secs(5)));
        assert_eq!(
            command.display(),
            "git add -- datasets/cam1/data.dvc datasets/cam1/dataset.yaml"
        );
    }
}
