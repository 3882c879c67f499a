//! On-disk project store.
//!
//! Layout:
//!   {root}/core/                          shared scripts, imported as `@core/`
//!   {root}/projects/{name}/               lib scripts, imported as `@lib/`
//!   {root}/projects/{name}/config.json    name, workdir, extra permissions
//!   {root}/projects/{name}/context.md     free-form notes for the agent
//!   {root}/projects/{name}/deno.json      import map for lib scripts
//!   {root}/projects/{name}/scripts/       temp scripts, own import map
//!   {root}/projects/{name}/.cache/        expert answers

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::sandbox::capabilities::{CapabilitySet, Grant};
use crate::sandbox::dns::dns_capabilities;

const CORE_FOLDER: &str = "core";
const PROJECTS_FOLDER: &str = "projects";
const SCRIPTS_FOLDER: &str = "scripts";
const CONFIG_FILE: &str = "config.json";
const CONTEXT_FILE: &str = "context.md";
const IMPORT_MAP_FILE: &str = "deno.json";
const SCRIPT_EXTENSION: &str = ".ts";

const PROJECT_IMPORT_MAP: &str = r#"{
  "imports": {
    "@core/": "../../core/",
    "@lib/": "./"
  }
}
"#;

const SCRIPTS_IMPORT_MAP: &str = r#"{
  "imports": {
    "@core/": "../../../core/",
    "@lib/": "../"
  }
}
"#;

/// Contents of `projects/{name}/config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Directory scripts run in; empty for none
    #[serde(default)]
    pub workdir: String,
    /// Extra permissions on top of the base set
    #[serde(default)]
    pub permissions: CapabilitySet,
}

impl ProjectConfig {
    pub fn new(name: &str, workdir: &str) -> Self {
        Self {
            name: name.to_string(),
            created_at: Utc::now(),
            workdir: workdir.to_string(),
            permissions: CapabilitySet::default(),
        }
    }

    pub fn workdir_path(&self) -> Option<PathBuf> {
        let workdir = self.workdir.trim();
        (!workdir.is_empty()).then(|| PathBuf::from(workdir))
    }

    /// Everything a script of this project may do: read/write on the
    /// current directory and the workdir, all environment variables, DNS
    /// lookups, plus the project's own permissions.
    pub fn resolve_capabilities(&self, dns_servers: &[String]) -> CapabilitySet {
        let mut roots = vec![".".to_string()];
        if let Some(workdir) = self.workdir_path() {
            roots.push(workdir.to_string_lossy().into_owned());
        }

        let base = CapabilitySet {
            allow_read: Some(Grant::scopes(roots.clone())),
            allow_write: Some(Grant::scopes(roots)),
            allow_env: Some(Grant::AllowAll),
            ..Default::default()
        };
        let dns = dns_capabilities(dns_servers);

        CapabilitySet::merge_all([&base, &dns, &self.permissions])
    }
}

/// A flat folder of `.ts` scripts.
struct ScriptFolder {
    path: PathBuf,
}

impl ScriptFolder {
    fn list(&self) -> Result<Vec<String>> {
        fs::create_dir_all(&self.path)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_file() && name.ends_with(SCRIPT_EXTENSION) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, filename: &str) -> Result<Option<String>> {
        validate_filename(filename)?;
        match fs::read_to_string(self.path.join(filename)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, filename: &str, content: &str) -> Result<()> {
        validate_filename(filename)?;
        fs::create_dir_all(&self.path)?;
        fs::write(self.path.join(filename), content)?;
        Ok(())
    }
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.starts_with('.')
    {
        anyhow::bail!("Invalid {kind} name: {name:?}");
    }
    Ok(())
}

fn validate_filename(filename: &str) -> Result<()> {
    validate_name("file", filename)
}

/// Projects and shared scripts under one sandbox root.
pub struct ProjectDb {
    root: PathBuf,
}

impl ProjectDb {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn core_dir(&self) -> PathBuf {
        self.root.join(CORE_FOLDER)
    }

    pub fn project_dir(&self, name: &str) -> PathBuf {
        self.root.join(PROJECTS_FOLDER).join(name)
    }

    /// Where temp scripts of `name` are written.
    pub fn scripts_dir(&self, name: &str) -> PathBuf {
        self.project_dir(name).join(SCRIPTS_FOLDER)
    }

    /// Creates the project folders, import maps, config and empty context.
    /// Fails if the project already exists.
    pub fn create_project(&self, name: &str, workdir: &str) -> Result<ProjectConfig> {
        validate_name("project", name)?;
        fs::create_dir_all(self.root.join(PROJECTS_FOLDER))?;
        fs::create_dir_all(self.core_dir())?;

        let project_dir = self.project_dir(name);
        fs::create_dir(&project_dir)
            .with_context(|| format!("Cannot create project {name}"))?;
        let scripts_dir = self.scripts_dir(name);
        fs::create_dir(&scripts_dir)?;

        fs::write(project_dir.join(IMPORT_MAP_FILE), PROJECT_IMPORT_MAP)?;
        fs::write(scripts_dir.join(IMPORT_MAP_FILE), SCRIPTS_IMPORT_MAP)?;

        let config = ProjectConfig::new(name, workdir);
        self.write_config(name, &config)?;
        fs::write(project_dir.join(CONTEXT_FILE), "")?;

        info!("Created project {name} at {}", project_dir.display());
        Ok(config)
    }

    /// Returns `None` when the project has no config file.
    pub fn read_config(&self, name: &str) -> Result<Option<ProjectConfig>> {
        validate_name("project", name)?;
        let path = self.project_dir(name).join(CONFIG_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config: ProjectConfig = serde_json::from_str(&content)
            .with_context(|| format!("Invalid project config {}", path.display()))?;
        config.permissions.validate()?;
        Ok(Some(config))
    }

    pub fn write_config(&self, name: &str, config: &ProjectConfig) -> Result<()> {
        validate_name("project", name)?;
        let json = serde_json::to_string_pretty(config)?;
        fs::write(self.project_dir(name).join(CONFIG_FILE), json)?;
        Ok(())
    }

    /// Every project with a readable config, sorted by name.
    pub fn list_projects(&self) -> Result<Vec<ProjectConfig>> {
        let projects_dir = self.root.join(PROJECTS_FOLDER);
        if !projects_dir.exists() {
            return Ok(Vec::new());
        }
        let mut projects = Vec::new();
        for entry in fs::read_dir(projects_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_name("project", &name).is_err() {
                continue;
            }
            if let Ok(Some(config)) = self.read_config(&name) {
                projects.push(config);
            }
        }
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    /// Contents of `context.md`, created empty when missing.
    pub fn read_context(&self, name: &str) -> Result<String> {
        validate_name("project", name)?;
        let path = self.project_dir(name).join(CONTEXT_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::write(&path, "")?;
                Ok(String::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lib_folder(&self, name: &str) -> Result<ScriptFolder> {
        validate_name("project", name)?;
        Ok(ScriptFolder {
            path: self.project_dir(name),
        })
    }

    fn core_folder(&self) -> ScriptFolder {
        ScriptFolder {
            path: self.core_dir(),
        }
    }

    pub fn list_lib_scripts(&self, name: &str) -> Result<Vec<String>> {
        self.lib_folder(name)?.list()
    }

    pub fn read_lib_script(&self, name: &str, filename: &str) -> Result<Option<String>> {
        self.lib_folder(name)?.read(filename)
    }

    pub fn write_lib_script(&self, name: &str, filename: &str, content: &str) -> Result<()> {
        self.lib_folder(name)?.write(filename, content)
    }

    pub fn list_core_scripts(&self) -> Result<Vec<String>> {
        self.core_folder().list()
    }

    pub fn read_core_script(&self, filename: &str) -> Result<Option<String>> {
        self.core_folder().read(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> (tempfile::TempDir, ProjectDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = ProjectDb::new(dir.path());
        (dir, db)
    }

    #[test]
    fn test_create_project_layout() {
        let (_dir, db) = db();
        let config = db.create_project("demo", "/tmp/work").unwrap();
        assert_eq!(config.name, "demo");
        assert_eq!(config.workdir, "/tmp/work");

        let project = db.project_dir("demo");
        assert!(project.join("config.json").is_file());
        assert!(project.join("context.md").is_file());
        assert!(db.scripts_dir("demo").is_dir());
        assert!(db.core_dir().is_dir());

        let import_map = fs::read_to_string(project.join("deno.json")).unwrap();
        assert!(import_map.contains(r#""@lib/": "./""#));
        let scripts_map = fs::read_to_string(db.scripts_dir("demo").join("deno.json")).unwrap();
        assert!(scripts_map.contains(r#""@core/": "../../../core/""#));
    }

    #[test]
    fn test_create_existing_project_fails() {
        let (_dir, db) = db();
        db.create_project("demo", "").unwrap();
        assert!(db.create_project("demo", "").is_err());
    }

    #[test]
    fn test_invalid_project_names() {
        let (_dir, db) = db();
        for name in ["", "..", "a/b", ".hidden", "a\\b"] {
            assert!(db.create_project(name, "").is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn test_config_roundtrip_and_missing() {
        let (_dir, db) = db();
        assert_eq!(db.read_config("nope").unwrap(), None);

        let mut config = db.create_project("demo", "").unwrap();
        config.permissions.allow_run = Some(Grant::scopes(["git"]));
        db.write_config("demo", &config).unwrap();
        assert_eq!(db.read_config("demo").unwrap(), Some(config));
    }

    #[test]
    fn test_reads_camel_case_config() {
        let (_dir, db) = db();
        db.create_project("demo", "").unwrap();
        let json = r#"{
            "name": "demo",
            "createdAt": "2024-11-02T10:00:00.000Z",
            "workdir": "/home/me/code",
            "permissions": {
                "allowRead": [],
                "allowNet": true,
                "denyNet": ["evil.example"],
                "allowSys": ["hostname", "osRelease"]
            }
        }"#;
        fs::write(db.project_dir("demo").join("config.json"), json).unwrap();

        let config = db.read_config("demo").unwrap().unwrap();
        assert_eq!(config.workdir, "/home/me/code");
        assert_eq!(config.permissions.allow_net, Some(Grant::AllowAll));
        assert_eq!(
            config.permissions.to_flags(),
            vec![
                "--allow-net",
                "--deny-net=evil.example",
                "--allow-sys=hostname,osRelease"
            ]
        );
    }

    #[test]
    fn test_rejects_false_permission() {
        let (_dir, db) = db();
        db.create_project("demo", "").unwrap();
        let json = r#"{"name":"demo","createdAt":"2024-11-02T10:00:00Z","workdir":"","permissions":{"allowRun":false}}"#;
        fs::write(db.project_dir("demo").join("config.json"), json).unwrap();
        assert!(db.read_config("demo").is_err());
    }

    #[test]
    fn test_lib_and_core_scripts() {
        let (_dir, db) = db();
        db.create_project("demo", "").unwrap();

        db.write_lib_script("demo", "b.ts", "export const b = 2;").unwrap();
        db.write_lib_script("demo", "a.ts", "export const a = 1;").unwrap();
        assert_eq!(db.list_lib_scripts("demo").unwrap(), vec!["a.ts", "b.ts"]);
        assert_eq!(
            db.read_lib_script("demo", "a.ts").unwrap().as_deref(),
            Some("export const a = 1;")
        );
        assert_eq!(db.read_lib_script("demo", "missing.ts").unwrap(), None);
        assert!(db.write_lib_script("demo", "../escape.ts", "").is_err());

        fs::write(db.core_dir().join("git.ts"), "// core").unwrap();
        assert_eq!(db.list_core_scripts().unwrap(), vec!["git.ts"]);
        assert_eq!(db.read_core_script("git.ts").unwrap().as_deref(), Some("// core"));
    }

    #[test]
    fn test_context_created_when_missing() {
        let (_dir, db) = db();
        db.create_project("demo", "").unwrap();
        fs::remove_file(db.project_dir("demo").join("context.md")).unwrap();
        assert_eq!(db.read_context("demo").unwrap(), "");
        assert!(db.project_dir("demo").join("context.md").exists());
    }

    #[test]
    fn test_list_projects() {
        let (_dir, db) = db();
        assert!(db.list_projects().unwrap().is_empty());
        db.create_project("zeta", "").unwrap();
        db.create_project("alpha", "").unwrap();
        let names: Vec<_> = db.list_projects().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_resolve_capabilities() {
        let mut config = ProjectConfig::new("demo", "/work");
        config.permissions.allow_net = Some(Grant::scopes(["api.github.com"]));
        config.permissions.allow_run = Some(Grant::scopes(["git"]));

        let caps = config.resolve_capabilities(&["10.0.0.1".to_string()]);
        assert_eq!(
            caps.to_flags(),
            vec![
                "--allow-read=.,/work",
                "--allow-write=.,/work",
                "--allow-net=10.0.0.1:53,api.github.com",
                "--allow-env",
                "--allow-run=git",
            ]
        );
    }

    #[test]
    fn test_resolve_capabilities_without_workdir() {
        let config = ProjectConfig::new("demo", "  ");
        let caps = config.resolve_capabilities(&[]);
        assert_eq!(
            caps.to_flags(),
            vec!["--allow-read=.", "--allow-write=.", "--allow-env"]
        );
    }
}
