//! Ahead-of-time instrumentation of a class tree
//!
//! Runs every class of a directory (or a single class file) through the same
//! load hook a live host would use. Class names come from the class itself,
//! or from the path relative to the input root when it does not parse.
//! Everything that is not a class is copied.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use crate::agent::LoadHook;
use crate::classfile::ClassFile;

/// Counts reported after a tree was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct TreeSummary {
    pub classes: usize,
    pub instrumented: usize,
    /// Non-class files copied as they were
    pub copied: usize,
}

/// Rewrite `input` into `output` through `hook`
pub fn instrument_tree(hook: &dyn LoadHook, input: &Path, output: &Path) -> Result<TreeSummary> {
    let mut summary = TreeSummary::default();
    if input.is_file() {
        let file_name = input
            .file_name()
            .with_context(|| format!("Input has no file name: {}", input.display()))?;
        fs::create_dir_all(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        process_file(hook, input, Path::new(file_name), output, &mut summary)?;
        return Ok(summary);
    }

    let input_root =
        resolve(input).with_context(|| format!("Failed to resolve {}", input.display()))?;
    let output_root =
        resolve(output).with_context(|| format!("Failed to resolve {}", output.display()))?;
    if output_root.starts_with(&input_root) {
        bail!(
            "Output directory {} is inside input directory {}",
            output.display(),
            input.display()
        );
    }

    for entry in WalkDir::new(input).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to read {}", input.display()))?;
        let relative = entry.path().strip_prefix(input)?;
        if entry.file_type().is_dir() {
            let dir = output.join(relative);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        } else {
            process_file(hook, entry.path(), relative, output, &mut summary)?;
        }
    }
    Ok(summary)
}

/// Canonical form of `path`; trailing components that do not exist yet are
/// appended to the canonical form of the deepest existing ancestor
fn resolve(path: &Path) -> io::Result<PathBuf> {
    let mut missing = Vec::new();
    let mut existing = path;
    loop {
        match existing.canonicalize() {
            Ok(found) => {
                return Ok(missing
                    .into_iter()
                    .rev()
                    .fold(found, |resolved, part| resolved.join(part)))
            }
            Err(err) => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Err(err);
                };
                missing.push(name);
                existing = if parent.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    parent
                };
            }
        }
    }
}

fn process_file(
    hook: &dyn LoadHook,
    source: &Path,
    relative: &Path,
    output: &Path,
    summary: &mut TreeSummary,
) -> Result<()> {
    let target = output.join(relative);
    if relative.extension().map_or(true, |ext| ext != "class") {
        fs::copy(source, &target)
            .with_context(|| format!("Failed to copy {}", source.display()))?;
        summary.copied += 1;
        return Ok(());
    }

    let bytes = fs::read(source).with_context(|| format!("Failed to read {}", source.display()))?;
    summary.classes += 1;
    let name = ClassFile::parse(&bytes)
        .and_then(|class| class.internal_name())
        .unwrap_or_else(|_| class_name(relative));
    let written = match hook.on_class_load(&name, &bytes) {
        Some(rewritten) => {
            summary.instrumented += 1;
            rewritten
        }
        None => bytes,
    };
    fs::write(&target, written).with_context(|| format!("Failed to write {}", target.display()))
}

/// `app/Foo.class` -> `app/Foo`
fn class_name(relative: &Path) -> String {
    let path = relative.with_extension("");
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
