// Stamps the git description into FDIST_GIT_DESCRIBE for version::BuildVersion.
//
// Packagers building from a tarball can set FDIST_GIT_DESCRIBE themselves.

fn git_describe() -> Option<String> {
    let output = std::process::Command::new("git")
        .current_dir("..")
        .args(["describe", "--tags", "--long", "--always", "--dirty"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let describe = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!describe.is_empty()).then_some(describe)
}

fn main() {
    println!("cargo:rerun-if-env-changed=FDIST_GIT_DESCRIBE");
    let describe = std::env::var("FDIST_GIT_DESCRIBE")
        .ok()
        .filter(|value| !value.is_empty())
        .or_else(git_describe);
    if let Some(describe) = describe {
        println!("cargo:rustc-env=FDIST_GIT_DESCRIBE={}", describe);
    }
    let head = std::path::Path::new("..").join(".git").join("HEAD");
    if head.exists() {
        println!("cargo:rerun-if-changed=../.git/HEAD");
        println!("cargo:rerun-if-changed=../.git/refs");
    }
}
