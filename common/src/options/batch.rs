use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub name: String,
    pub size: u64,
    /// seconds since the epoch
    pub mtime: i64,
}

/// Files of one staging directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub files: Vec<BatchFile>,
}

fn mtime_secs(metadata: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    metadata.mtime()
}

impl Batch {
    /// Lists the regular files of `dir`, skipping dot files, sorted by name.
    pub async fn from_dir(dir: &std::path::Path) -> Result<Self> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", dir))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                tracing::warn!("skipping non UTF-8 file name in {:?}", dir);
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // removed while listing
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("failed reading metadata of {:?}", entry.path()));
                }
            };
            if !metadata.is_file() {
                continue;
            }
            files.push(BatchFile {
                name,
                size: metadata.len(),
                mtime: mtime_secs(&metadata),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.files.iter().position(|file| file.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|file| file.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_regular_files_only() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("b"), "22").await.unwrap();
        tokio::fs::write(tmp.path().join("a"), "1").await.unwrap();
        tokio::fs::write(tmp.path().join(".partial"), "x").await.unwrap();
        tokio::fs::create_dir(tmp.path().join("sub")).await.unwrap();
        let batch = Batch::from_dir(tmp.path()).await.unwrap();
        assert_eq!(batch.names().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(batch.total_size(), 3);
        assert_eq!(batch.position("b"), Some(1));
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Batch::from_dir(&tmp.path().join("nope")).await.is_err());
    }
}
