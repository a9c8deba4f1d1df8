use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kiln_types::{DataError, KilnResult};

/// Durable store that trial checkpoint directories are uploaded to.
///
/// Targets are `/`-separated relative paths (for example
/// `experiment/trial_0003`); each implementation maps them onto its own
/// namespace.
#[async_trait]
pub trait DurableStorage: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Copy the whole of `source` to `target`, replacing what was there.
    async fn copy_dir(&self, source: &Path, target: &str) -> KilnResult<()>;

    /// Remove `target` and everything below it. Missing targets are not an error.
    async fn delete_dir(&self, target: &str) -> KilnResult<()>;
}

fn storage_error(target: &str, message: impl Into<String>) -> DataError {
    DataError::Storage {
        target: target.to_string(),
        message: message.into(),
    }
}

/// Storage rooted at a local (or mounted) directory.
#[derive(Debug, Clone)]
pub struct LocalDirStorage {
    pub root: PathBuf,
}

impl LocalDirStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn resolve(&self, target: &str) -> PathBuf {
        target
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

#[async_trait]
impl DurableStorage for LocalDirStorage {
    fn name(&self) -> &str {
        "local"
    }

    async fn copy_dir(&self, source: &Path, target: &str) -> KilnResult<()> {
        let source = source.to_path_buf();
        let destination = self.resolve(target);
        let label = target.to_string();

        tokio::task::spawn_blocking(move || -> KilnResult<()> {
            if !source.is_dir() {
                return Err(storage_error(
                    &label,
                    format!("source {} is not a directory", source.display()),
                )
                .into());
            }
            if destination.exists() {
                fs::remove_dir_all(&destination)?;
            }
            copy_dir_recursive(&source, &destination)?;
            Ok(())
        })
        .await
        .map_err(|e| storage_error(target, e.to_string()))?
    }

    async fn delete_dir(&self, target: &str) -> KilnResult<()> {
        let destination = self.resolve(target);
        match tokio::fs::remove_dir_all(&destination).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(target, e.to_string()).into()),
        }
    }
}

/// Storage driven by shell command templates, for remote stores with a CLI
/// (`aws s3 sync {source} s3://bucket/{target}` and the like).
///
/// `{source}` and `{target}` are substituted, single-quoted, before the
/// command runs under `sh -c`. A non-zero exit status is a storage error.
#[derive(Debug, Clone)]
pub struct CommandStorage {
    pub sync_template: String,
    pub delete_template: String,
}

impl CommandStorage {
    pub fn new(sync_template: impl Into<String>, delete_template: impl Into<String>) -> Self {
        Self {
            sync_template: sync_template.into(),
            delete_template: delete_template.into(),
        }
    }

    /// Single pass, so a placeholder inside a substituted value stays literal.
    fn render(template: &str, source: Option<&Path>, target: &str) -> String {
        let source = source.map(|path| shell_quote(&path.display().to_string()));
        let target = shell_quote(target);
        let mut rendered = String::with_capacity(template.len() + target.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            rendered.push_str(&rest[..start]);
            let tail = &rest[start..];
            if let Some(after) = tail.strip_prefix("{target}") {
                rendered.push_str(&target);
                rest = after;
            } else if let (Some(after), Some(source)) = (tail.strip_prefix("{source}"), &source) {
                rendered.push_str(source);
                rest = after;
            } else {
                rendered.push('{');
                rest = &tail[1..];
            }
        }
        rendered.push_str(rest);
        rendered
    }

    async fn run(&self, command: String, target: &str) -> KilnResult<()> {
        tracing::debug!(%command, "Running storage command");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await
            .map_err(|e| storage_error(target, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(storage_error(
                target,
                format!("command exited with {}: {}", output.status, stderr.trim()),
            )
            .into());
        }
        Ok(())
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl DurableStorage for CommandStorage {
    fn name(&self) -> &str {
        "command"
    }

    async fn copy_dir(&self, source: &Path, target: &str) -> KilnResult<()> {
        let command = Self::render(&self.sync_template, Some(source), target);
        self.run(command, target).await
    }

    async fn delete_dir(&self, target: &str) -> KilnResult<()> {
        let command = Self::render(&self.delete_template, None, target);
        self.run(command, target).await
    }
}

/// Recursively copy a directory tree.
pub fn copy_dir_recursive(source: &Path, destination: &Path) -> std::io::Result<()> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checkpoint(dir: &Path) -> PathBuf {
        let source = dir.join("trial_0000");
        fs::create_dir_all(source.join("model")).unwrap();
        fs::write(source.join("model/weights.bin"), [1u8, 2, 3]).unwrap();
        fs::write(source.join("stats.json"), "{}").unwrap();
        source
    }

    #[tokio::test]
    async fn test_local_storage_copy_and_delete() {
        let work = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let source = checkpoint(work.path());
        let storage = LocalDirStorage::new(remote.path());

        storage.copy_dir(&source, "exp/trial_0000").await.unwrap();
        let copied = remote.path().join("exp/trial_0000");
        assert_eq!(fs::read(copied.join("model/weights.bin")).unwrap(), vec![1, 2, 3]);
        assert!(copied.join("stats.json").exists());

        storage.delete_dir("exp/trial_0000").await.unwrap();
        assert!(!copied.exists());
        // deleting twice is fine
        storage.delete_dir("exp/trial_0000").await.unwrap();
    }

    #[test]
    fn test_local_storage_resolve_stays_under_root() {
        let storage = LocalDirStorage::new("/remote");
        assert_eq!(storage.resolve("../exp//t1"), PathBuf::from("/remote/exp/t1"));
    }

    #[tokio::test]
    async fn test_local_storage_missing_source() {
        let remote = TempDir::new().unwrap();
        let storage = LocalDirStorage::new(remote.path());
        let err = storage
            .copy_dir(&remote.path().join("nope"), "exp/t")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exp/t"));
    }

    #[tokio::test]
    async fn test_command_storage() {
        let work = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let source = checkpoint(work.path());

        let root = remote.path().display().to_string();
        let storage = CommandStorage::new(
            format!("mkdir -p {root}/{{target}} && cp -r {{source}}/. {root}/{{target}}"),
            format!("rm -rf {root}/{{target}}"),
        );
        storage.copy_dir(&source, "exp/t1").await.unwrap();
        assert!(remote.path().join("exp/t1/model/weights.bin").exists());

        storage.delete_dir("exp/t1").await.unwrap();
        assert!(!remote.path().join("exp/t1").exists());

        let failing = CommandStorage::new("exit 3", "exit 0");
        assert!(failing.copy_dir(&source, "exp/t2").await.is_err());
    }

    #[test]
    fn test_command_storage_quotes_substitutions() {
        let rendered = CommandStorage::render(
            "cp -r {source} {target} {other}",
            Some(Path::new("/tmp/it's here")),
            "exp/{source}",
        );
        assert_eq!(rendered, r"cp -r '/tmp/it'\''s here' 'exp/{source}' {other}");
    }

    #[tokio::test]
    async fn test_command_storage_paths_with_shell_characters() {
        let work = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let source = checkpoint(&work.path().join("my run's $HOME"));

        let root = remote.path().display().to_string();
        let storage = CommandStorage::new(
            format!("mkdir -p {root}/{{target}} && cp -r {{source}}/. {root}/{{target}}"),
            format!("rm -rf {root}/{{target}}"),
        );
        let target = "exp/t1; touch injected";
        storage.copy_dir(&source, target).await.unwrap();
        assert!(remote.path().join(target).join("model/weights.bin").exists());
        assert!(!remote.path().join("injected").exists());
        assert!(!Path::new("injected").exists());

        storage.delete_dir(target).await.unwrap();
        assert!(!remote.path().join(target).exists());
        assert!(remote.path().join("exp").exists());
    }
}
