//! Fixture preparation and path placeholders.
//!
//! Every case starts from a known tree: an empty `fixtures/scratch`, the
//! canonical `fixtures/hello_repo/src/lib.rs`, and optionally a fresh working
//! copy of a fixture template and an empty agent session store.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;

use crate::case::FixtureSpec;

/// Canonical content of `fixtures/hello_repo/src/lib.rs`.
pub const HELLO_LIB_RS: &str = r#"pub fn greet(name: &str) -> String {
    // TODO: add proper greeting
    format!("Hello, {}!", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greet() {
        assert_eq!(greet("World"), "Hello, World!");
    }
}
"#;

/// Resolved fixture locations for one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixturePaths {
    pub project_root: PathBuf,
    pub fixtures: PathBuf,
    pub scratch: PathBuf,
    pub working_copy: Option<PathBuf>,
    pub sessions: PathBuf,
}

impl FixturePaths {
    pub fn new(project_root: &Path, spec: &FixtureSpec) -> Self {
        let fixtures = project_root.join("fixtures");
        Self {
            project_root: project_root.to_path_buf(),
            scratch: fixtures.join("scratch"),
            working_copy: spec
                .working_copy
                .as_ref()
                .map(|template| fixtures.join(format!("{template}_scratch"))),
            sessions: project_root.join(".brainpro").join("sessions"),
            fixtures,
        }
    }

    /// Replace `{project_root}`, `{fixtures}`, `{scratch}`, `{working_copy}` and `{sessions}`.
    pub fn substitute(&self, text: &str) -> Result<String> {
        let mut out = text
            .replace("{project_root}", &self.project_root.display().to_string())
            .replace("{fixtures}", &self.fixtures.display().to_string())
            .replace("{scratch}", &self.scratch.display().to_string())
            .replace("{sessions}", &self.sessions.display().to_string());
        if out.contains("{working_copy}") {
            let working_copy = self
                .working_copy
                .as_ref()
                .ok_or_else(|| anyhow!("{{working_copy}} used without fixtures.working_copy"))?;
            out = out.replace("{working_copy}", &working_copy.display().to_string());
        }
        Ok(out)
    }

    /// Substitute placeholders and anchor relative paths at the project root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let path = PathBuf::from(self.substitute(path)?);
        Ok(if path.is_absolute() {
            path
        } else {
            self.project_root.join(path)
        })
    }
}

/// Bring the fixture tree into the state the case expects.
pub fn prepare(project_root: &Path, spec: &FixtureSpec) -> Result<FixturePaths> {
    let paths = FixturePaths::new(project_root, spec);

    if spec.scratch {
        reset_dir(&paths.scratch)?;
    }
    restore_hello_repo(&paths.fixtures)?;

    if let (Some(template), Some(working_copy)) = (&spec.working_copy, &paths.working_copy) {
        let source = paths.fixtures.join(template);
        if !source.is_dir() {
            bail!("fixture template {} not found", source.display());
        }
        if working_copy.exists() {
            fs::remove_dir_all(working_copy)
                .with_context(|| format!("remove {}", working_copy.display()))?;
        }
        copy_dir_recursive(&source, working_copy)?;
    }

    if spec.sessions {
        reset_dir(&paths.sessions)?;
    }

    debug!(
        scratch = %paths.scratch.display(),
        working_copy = ?paths.working_copy,
        "fixtures prepared"
    );
    Ok(paths)
}

/// Remove the working copy once the case is done. Scratch is kept for inspection.
pub fn cleanup(paths: &FixturePaths) -> Result<()> {
    if let Some(working_copy) = &paths.working_copy
        && working_copy.exists()
    {
        fs::remove_dir_all(working_copy)
            .with_context(|| format!("remove {}", working_copy.display()))?;
    }
    Ok(())
}

fn restore_hello_repo(fixtures: &Path) -> Result<()> {
    let src = fixtures.join("hello_repo").join("src");
    fs::create_dir_all(&src).with_context(|| format!("create {}", src.display()))?;
    let lib_rs = src.join("lib.rs");
    fs::write(&lib_rs, HELLO_LIB_RS).with_context(|| format!("write {}", lib_rs.display()))
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target).with_context(|| format!("copy {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(working_copy: Option<&str>, sessions: bool) -> FixtureSpec {
        FixtureSpec {
            scratch: true,
            working_copy: working_copy.map(str::to_string),
            sessions,
        }
    }

    #[test]
    fn prepare_resets_scratch_and_restores_hello_repo() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("fixtures/scratch")).expect("scratch");
        fs::write(root.join("fixtures/scratch/leftover.txt"), "old").expect("leftover");
        fs::create_dir_all(root.join("fixtures/hello_repo/src")).expect("hello_repo");
        fs::write(root.join("fixtures/hello_repo/src/lib.rs"), "pub fn edited() {}\n")
            .expect("edited lib");

        let paths = prepare(root, &spec(None, false)).expect("prepare");

        assert!(paths.scratch.is_dir());
        assert!(!paths.scratch.join("leftover.txt").exists());
        assert_eq!(
            fs::read_to_string(root.join("fixtures/hello_repo/src/lib.rs")).expect("lib"),
            HELLO_LIB_RS
        );
        assert!(!paths.sessions.exists());
    }

    #[test]
    fn prepare_refreshes_working_copy_and_sessions() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("fixtures/mock_webapp/src/api")).expect("template");
        fs::write(root.join("fixtures/mock_webapp/src/api/handlers.rs"), "// handlers\n")
            .expect("template file");
        fs::create_dir_all(root.join("fixtures/mock_webapp_scratch")).expect("stale copy");
        fs::write(root.join("fixtures/mock_webapp_scratch/stale.rs"), "").expect("stale file");
        fs::create_dir_all(root.join(".brainpro/sessions")).expect("sessions");
        fs::write(root.join(".brainpro/sessions/old.json"), "{}").expect("old session");

        let paths = prepare(root, &spec(Some("mock_webapp"), true)).expect("prepare");
        let working_copy = paths.working_copy.clone().expect("working copy");

        assert!(working_copy.join("src/api/handlers.rs").exists());
        assert!(!working_copy.join("stale.rs").exists());
        assert!(paths.sessions.is_dir());
        assert!(!paths.sessions.join("old.json").exists());

        cleanup(&paths).expect("cleanup");
        assert!(!working_copy.exists());
    }

    #[test]
    fn missing_template_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let err = prepare(temp.path(), &spec(Some("nope"), false)).expect_err("missing");
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn substitutes_placeholders() {
        let paths = FixturePaths::new(Path::new("/srv/project"), &spec(Some("mock_webapp"), false));
        assert_eq!(
            paths.substitute("{scratch}/a.txt in {working_copy}").expect("substitute"),
            "/srv/project/fixtures/scratch/a.txt in /srv/project/fixtures/mock_webapp_scratch"
        );
        assert_eq!(
            paths.resolve("fixtures/hello_repo/src/lib.rs").expect("resolve"),
            PathBuf::from("/srv/project/fixtures/hello_repo/src/lib.rs")
        );
        assert_eq!(
            paths.resolve("{sessions}").expect("resolve"),
            PathBuf::from("/srv/project/.brainpro/sessions")
        );
    }

    #[test]
    fn working_copy_placeholder_requires_template() {
        let paths = FixturePaths::new(Path::new("/srv/project"), &spec(None, false));
        paths
            .substitute("{working_copy}/src")
            .expect_err("no working copy");
    }
}
