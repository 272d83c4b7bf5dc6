//! Builds on the local docker daemon

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use taskpilot_api::{ApiClient, LogLevel};
use ulid::Ulid;

use super::docker::{DockerEngine, CONTEXT_DOCKERFILE};
use super::log::BuildLogSink;
use super::recipe::{build_dockerfile, Recipe};
use super::{
    build_args, image_url, BuildCreator, BuildError, BuildRequest, BuildResponse,
    RegistryTokenCache,
};
use crate::archive::{ArchiveError, IgnoreRules, TarError, TreeWriter};
use crate::cancel::CancelToken;
use crate::config::DEFAULT_IGNORE_FILE;

pub struct LocalBuildCreator {
    client: Arc<dyn ApiClient>,
    engine: Arc<dyn DockerEngine>,
    log: Arc<dyn BuildLogSink>,
    ignore_file: String,
    push: bool,
    registry: RegistryTokenCache,
}

impl LocalBuildCreator {
    pub fn new(
        client: Arc<dyn ApiClient>,
        engine: Arc<dyn DockerEngine>,
        log: Arc<dyn BuildLogSink>,
    ) -> Self {
        Self {
            client,
            engine,
            log,
            ignore_file: DEFAULT_IGNORE_FILE.to_string(),
            push: true,
            registry: RegistryTokenCache::default(),
        }
    }

    /// Whether built images are pushed to the registry
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    pub fn with_ignore_file(mut self, name: impl Into<String>) -> Self {
        self.ignore_file = name.into();
        self
    }
}

impl BuildCreator for LocalBuildCreator {
    fn create_build(
        &self,
        cancel: &CancelToken,
        req: &BuildRequest,
    ) -> Result<BuildResponse, BuildError> {
        cancel.check().map_err(|_| BuildError::Cancelled)?;
        let auth = self.registry.get(&self.client)?;
        let recipe = build_dockerfile(req.kind, &req.root, &req.kind_options, req.shim)?;
        let rules = IgnoreRules::for_root(&req.root, &self.ignore_file)
            .map_err(ArchiveError::from)?;
        let context = write_context(&req.root, &rules, &recipe)?;

        let build_id = Ulid::new().to_string().to_lowercase();
        let uri = image_url(&auth.repo, &req.task_id, &build_id);
        tracing::info!(task = %req.slug, image = %uri, "building image locally");

        let mut on_line = |line: &str| self.log.log(&req.slug, LogLevel::Info, line);
        self.engine.build(
            cancel,
            context.path(),
            &uri,
            &build_args(&req.env),
            &mut on_line,
        )?;
        if self.push {
            self.engine.push(cancel, &uri, &auth, &mut on_line)?;
            tracing::info!(task = %req.slug, image = %uri, "pushed image");
        }

        Ok(BuildResponse {
            image_url: uri,
            build_id,
        })
    }
}

/// Uncompressed build context: the filtered task tree plus the recipe and
/// its generated files
fn write_context(
    root: &Path,
    rules: &IgnoreRules,
    recipe: &Recipe,
) -> Result<tempfile::NamedTempFile, TarError> {
    let io_err = |source: std::io::Error| TarError::Io {
        context: "writing build context for",
        path: root.to_path_buf(),
        source,
    };
    let file = tempfile::Builder::new()
        .prefix("taskpilot-context-")
        .suffix(".tar")
        .tempfile()
        .map_err(io_err)?;
    let handle: File = file.reopen().map_err(io_err)?;

    let mut tree = TreeWriter::new(handle);
    tree.append_tree(root, rules)?;
    tree.append_bytes(CONTEXT_DOCKERFILE, recipe.dockerfile.as_bytes())?;
    for (path, contents) in &recipe.files {
        tree.append_bytes(path, contents.as_bytes())?;
    }
    tree.finish().map_err(io_err)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use std::sync::Mutex;

    use taskpilot_api::{KindOptions, MockClient, RegistryTokenResponse, TaskEnv, TaskKind, EnvVar};

    use crate::build::{DockerError, MemoryBuildLog};

    #[derive(Default)]
    struct FakeEngine {
        built: Mutex<Vec<(String, Vec<String>, Vec<(String, String)>)>>,
        pushed: Mutex<Vec<(String, String)>>,
    }

    impl DockerEngine for FakeEngine {
        fn build(
            &self,
            _cancel: &CancelToken,
            context: &Path,
            tag: &str,
            build_args: &[(String, String)],
            on_line: &mut dyn FnMut(&str),
        ) -> Result<(), DockerError> {
            let mut names = Vec::new();
            let mut archive = tar::Archive::new(File::open(context).unwrap());
            for entry in archive.entries().unwrap() {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().to_string();
                if name == CONTEXT_DOCKERFILE {
                    let mut text = String::new();
                    entry.read_to_string(&mut text).unwrap();
                    assert!(text.starts_with("FROM "));
                }
                names.push(name);
            }
            on_line("Step 1/5 : FROM python");
            self.built
                .lock()
                .unwrap()
                .push((tag.to_string(), names, build_args.to_vec()));
            Ok(())
        }

        fn push(
            &self,
            _cancel: &CancelToken,
            image: &str,
            auth: &RegistryTokenResponse,
            _on_line: &mut dyn FnMut(&str),
        ) -> Result<(), DockerError> {
            self.pushed
                .lock()
                .unwrap()
                .push((image.to_string(), auth.host().to_string()));
            Ok(())
        }
    }

    fn python_request(root: &Path) -> BuildRequest {
        let mut env = TaskEnv::new();
        env.insert("GREETING".into(), EnvVar::value("hi"));
        BuildRequest {
            root: root.to_path_buf(),
            slug: "hello".into(),
            task_id: "tsk1".into(),
            kind: TaskKind::Python,
            kind_options: KindOptions::new().with("entrypoint", "main.py"),
            env,
            shim: true,
            git_meta: None,
        }
    }

    #[test]
    fn test_builds_tags_and_pushes() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("main.py"), "def main(p): pass\n").unwrap();
        fs::create_dir_all(root.path().join("__pycache__")).unwrap();
        fs::write(root.path().join("__pycache__/main.pyc"), "").unwrap();

        let engine = Arc::new(FakeEngine::default());
        let log = Arc::new(MemoryBuildLog::default());
        let creator = LocalBuildCreator::new(Arc::new(MockClient::new()), engine.clone(), log.clone());
        let resp = creator
            .create_build(&CancelToken::new(), &python_request(root.path()))
            .unwrap();

        assert!(resp.image_url.starts_with("registry.test/project/tasks/task-tska:"));
        assert!(resp.image_url.ends_with(&resp.build_id));
        assert_eq!(resp.build_id, resp.build_id.to_lowercase());

        let built = engine.built.lock().unwrap();
        let (tag, names, args) = &built[0];
        assert_eq!(tag, &resp.image_url);
        assert!(names.contains(&"main.py".to_string()));
        assert!(names.contains(&".taskpilot/Dockerfile".to_string()));
        assert!(names.contains(&".taskpilot/shim.py".to_string()));
        assert!(!names.iter().any(|n| n.contains("__pycache__")));
        assert_eq!(args, &vec![("GREETING".to_string(), "hi".to_string())]);

        let pushed = engine.pushed.lock().unwrap();
        assert_eq!(pushed[0], (resp.image_url.clone(), "registry.test".to_string()));
        assert_eq!(log.lines(), vec!["[build hello] Step 1/5 : FROM python"]);
    }

    #[test]
    fn test_push_disabled() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("main.py"), "").unwrap();
        let engine = Arc::new(FakeEngine::default());
        let creator = LocalBuildCreator::new(
            Arc::new(MockClient::new()),
            engine.clone(),
            Arc::new(MemoryBuildLog::default()),
        )
        .with_push(false);
        creator
            .create_build(&CancelToken::new(), &python_request(root.path()))
            .unwrap();
        assert_eq!(engine.built.lock().unwrap().len(), 1);
        assert!(engine.pushed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_entrypoint_never_reaches_engine() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let creator = LocalBuildCreator::new(
            Arc::new(MockClient::new()),
            engine.clone(),
            Arc::new(MemoryBuildLog::default()),
        );
        let err = creator
            .create_build(&CancelToken::new(), &python_request(root.path()))
            .unwrap_err();
        assert_eq!(err.to_string(), "build: the file main.py is required");
        assert!(engine.built.lock().unwrap().is_empty());
    }
}
