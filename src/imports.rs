use crate::error::{HarnessError, Result};
use crate::failures::FailureList;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// stdio functions, none of which are async-signal-safe (`man signal-safety`)
pub const STDIO_FUNCTIONS: &[&str] = &[
    "clearerr", "fclose", "fdopen", "feof", "ferror", "fflush", "fgetc", "fgetpos", "fgets",
    "fileno", "fopen", "fprintf", "fpurge", "fputc", "fputs", "fread", "freopen", "fscanf",
    "fseek", "fsetpos", "ftell", "fwrite", "getc", "getchar", "gets", "getw", "mktemp",
    "perror", "printf", "putc", "putchar", "puts", "putw", "remove", "rewind", "scanf",
    "setbuf", "setbuffer", "setlinebuf", "sprintf", "sscanf", "strerror", "sys_errlist",
    "sys_nerr", "tempnam", "tmpfile", "tmpnam", "ungetc", "vfprintf", "vfscanf", "vprintf",
    "vscanf", "vsprintf", "vsscanf",
];

/// Dynamically relocated symbols of a built artifact
#[derive(Debug, Clone)]
pub struct DynamicImports {
    artifact: PathBuf,
    symbols: BTreeSet<String>,
}

impl DynamicImports {
    /// Runs `objdump -R` on `artifact`.
    pub async fn read(artifact: impl AsRef<Path>) -> Result<Self> {
        let artifact = artifact.as_ref();
        let command = format!("objdump -R {}", artifact.display());
        let output = Command::new("objdump")
            .arg("-R")
            .arg(artifact)
            .output()
            .await
            .map_err(|e| HarnessError::command(&command, e))?;
        if !output.status.success() || !output.stderr.is_empty() {
            return Err(HarnessError::command(
                command,
                String::from_utf8_lossy(&output.stderr).trim_end(),
            ));
        }
        Ok(Self::parse(artifact, &String::from_utf8_lossy(&output.stdout)))
    }

    /// Parses `objdump -R` output. Version suffixes (`@GLIBC_2.2.5`) and
    /// addends (`+0x10`) are dropped.
    pub fn parse(artifact: impl Into<PathBuf>, listing: &str) -> Self {
        let symbols = listing
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let offset = fields.next()?;
                let kind = fields.next()?;
                let value = fields.next()?;
                if !offset.chars().all(|c| c.is_ascii_hexdigit()) || !kind.starts_with("R_") {
                    return None;
                }
                let symbol = value.split(['@', '+']).next()?;
                (!symbol.is_empty() && !symbol.starts_with('*')).then(|| symbol.to_string())
            })
            .collect();
        Self {
            artifact: artifact.into(),
            symbols,
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(String::as_str)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    fn artifact_name(&self) -> String {
        self.artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.artifact.display().to_string())
    }

    /// Records a failure unless `symbol` is imported.
    pub fn require(&self, symbol: &str, failures: &mut FailureList) {
        if !self.contains(symbol) {
            failures.push(format!(
                "{} does not call {}. Replicate this check with `objdump -R {}`",
                self.artifact_name(),
                symbol,
                self.artifact.display()
            ));
        }
    }

    /// Records one failure listing every imported symbol from `forbidden`.
    pub fn forbid<'a, I>(&self, forbidden: I, failures: &mut FailureList)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let found: Vec<&str> = forbidden.into_iter().filter(|s| self.contains(s)).collect();
        if !found.is_empty() {
            failures.push(format!(
                "Forbidden functions found in {}: {}. Replicate this check with `objdump -R {}`",
                self.artifact_name(),
                found.join(", "),
                self.artifact.display()
            ));
        }
    }
}
