use common::dirconfig::{Compiled, DefaultOptionChecker};

/// Compiles one directory `<root>/in` taking every file, followed by `destinations`.
pub fn compile_rules(root: &std::path::Path, destinations: &str) -> Compiled {
    let rules = root.join("rules");
    std::fs::write(
        &rules,
        format!(
            "[directory] {}/in\n[files]\n*\n\n{}",
            root.display(),
            destinations
        ),
    )
    .unwrap();
    let settings = common::CompileSettings {
        spool_root: root.join("spool"),
        ..Default::default()
    };
    common::dirconfig::compile(&[rules], &settings, &DefaultOptionChecker, None).unwrap()
}
