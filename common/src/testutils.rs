use crate::CompileSettings;

/// Compiler settings that keep everything below `root`.
pub fn test_settings(root: &std::path::Path) -> CompileSettings {
    CompileSettings {
        spool_root: root.join("spool"),
        ..CompileSettings::default()
    }
}

pub fn rule_file(dir: &std::path::Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Creates `dir` with the given files and returns its sorted listing.
pub async fn setup_staging(dir: &std::path::Path, files: &[(&str, &[u8])]) -> Vec<String> {
    tokio::fs::create_dir_all(dir).await.unwrap();
    for (name, content) in files {
        tokio::fs::write(dir.join(name), content).await.unwrap();
    }
    list_names(dir).await
}

pub async fn list_names(dir: &std::path::Path) -> Vec<String> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    names
}
