//! `kiln scan`: list discovered components without building them.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::component::{Component, ParseStatus};
use crate::config::EngineConfig;
use crate::core::{CancelScope, ProjectRoot};
use crate::log;
use crate::registry::{ComponentRegistry, RegistryOptions};
use crate::scanner::{MetadataCache, ScanOptions, ScanReport, Scanner};
use crate::utils::plural::plural_count;

/// Scan the project once and print every component. Returns `false` when
/// a file failed to parse or two files declare the same component.
pub fn scan_components(config: &EngineConfig) -> Result<bool> {
    let (registry, report) = scan_once(config)?;
    print!("{}", render(&registry.get_all(), &report, &config.root));

    let clean = report.errors.is_empty() && report.conflicts.is_empty();
    log!(
        "scan";
        "{} in {}",
        plural_count(registry.len(), "component"),
        plural_count(report.files, "file")
    );
    Ok(clean)
}

/// Metadata-only scan: no compiler, no persisted caches.
fn scan_once(config: &EngineConfig) -> Result<(Arc<ComponentRegistry>, ScanReport)> {
    let root = ProjectRoot::new(&config.root)?;
    let registry = Arc::new(ComponentRegistry::new(RegistryOptions::from(
        &config.registry,
    )));
    let metadata = Arc::new(MetadataCache::new(
        config.cache.capacity,
        Duration::from_millis(config.cache.ttl_ms),
    ));
    let scanner = Scanner::new(
        root,
        ScanOptions::from_config(config),
        Arc::clone(&registry),
        metadata,
    )?;
    let report = scanner.scan(&CancelScope::new());
    Ok((registry, report))
}

fn render(components: &[Arc<Component>], report: &ScanReport, root: &Path) -> String {
    let mut sorted: Vec<&Arc<Component>> = components.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = String::new();
    for component in sorted {
        let path = component.path.strip_prefix(root).unwrap_or(&component.path);
        let params = component
            .params
            .iter()
            .map(|p| format!("{} {}", p.name, p.ty))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(
            out,
            "{}({})  {}",
            component.name.bold(),
            params,
            path.display().dimmed()
        );
        if !component.dependencies.is_empty() {
            let _ = write!(out, "  uses {}", component.dependencies.join(", "));
        }
        if let ParseStatus::Error(error) = &component.status {
            let _ = write!(
                out,
                "  {} {}:{}: {}",
                "error".red().bold(),
                error.line,
                error.column,
                error.message
            );
        }
        out.push('\n');
    }

    for conflict in &report.conflicts {
        let _ = writeln!(
            out,
            "{} {}: keeping {}, ignoring {}",
            "conflict".yellow().bold(),
            conflict.name,
            conflict.kept.display(),
            conflict.displaced.display()
        );
    }
    for error in &report.errors {
        let _ = writeln!(out, "{} {}", "error".red().bold(), error);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn project(files: &[(&str, &str)]) -> (TempDir, EngineConfig) {
        let dir = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let config = EngineConfig::load(dir.path(), None).unwrap();
        (dir, config)
    }

    #[test]
    fn test_render_lists_components_by_name() {
        owo_colors::set_override(false);
        let (_dir, config) = project(&[
            (
                "ui/card.component",
                "package ui\n\ncomponent Card(title string) {\n    @Button(title)\n}\n",
            ),
            (
                "button.component",
                "component Button(label string) {\n    <button>{ label }</button>\n}\n",
            ),
        ]);
        let (registry, report) = scan_once(&config).unwrap();
        let out = render(&registry.get_all(), &report, &config.root);
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Button(label string)"));
        assert!(lines[1].starts_with("ui.Card(title string)"));
        assert!(lines[1].contains("uses ui.Button"));
    }

    #[test]
    fn test_parse_errors_fail_the_scan() {
        owo_colors::set_override(false);
        let (_dir, config) = project(&[("bad.component", "component Bad(label string {\n")]);
        assert!(!scan_components(&config).unwrap());

        let (_dir, config) = project(&[(
            "ok.component",
            "component Ok() {\n    <p>fine</p>\n}\n",
        )]);
        assert!(scan_components(&config).unwrap());
    }
}
