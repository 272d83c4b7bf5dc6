use std::fs;
use std::path::{Path, PathBuf};

use taskpilot_api::{KindOptions, TaskKind};

use super::{entrypoint, in_workdir, quoted, require, Recipe, RecipeError, GENERATED_DIR, WORKDIR};

/// User Dockerfiles a shell task may build on, in lookup order
pub const DOCKERFILE_NAMES: &[&str] = &["Dockerfile.taskpilot", "Dockerfile"];

const DEFAULT_BASE: &str = "\
FROM ubuntu:22.04
RUN apt-get update && export DEBIAN_FRONTEND=noninteractive \\
    && apt-get -y install --no-install-recommends \\
        ca-certificates \\
        curl \\
        jq \\
        less \\
        openssh-client \\
        procps \\
        unzip \\
        wget \\
        zip \\
    && apt-get autoremove -y && apt-get clean -y && rm -rf /var/lib/apt/lists/*
";

/// Exports each JSON parameter as `PARAM_<NAME>` and execs the script
const SHIM: &str = r#"#!/bin/bash
# Generated by taskpilot. Exposes run parameters as PARAM_ variables.
set -euo pipefail

params="${1:-}"
if [ -z "$params" ]; then
  params='{}'
fi
while IFS= read -r name; do
  value="$(jq -r --arg k "$name" '.[$k] | if type == "string" then . else tojson end' <<<"$params")"
  export "PARAM_$(tr '[:lower:]-' '[:upper:]_' <<<"$name")=$value"
done < <(jq -r 'keys[]' <<<"$params")

exec {entrypoint}
"#;

/// First of [`DOCKERFILE_NAMES`] present under `root`
pub fn find_dockerfile(root: &Path) -> Option<PathBuf> {
    DOCKERFILE_NAMES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

pub(super) fn recipe(root: &Path, options: &KindOptions) -> Result<Recipe, RecipeError> {
    let main = entrypoint(TaskKind::Shell, options)?;
    require(root, &[&main])?;

    let base = match find_dockerfile(root) {
        Some(path) => {
            let mut contents =
                fs::read_to_string(&path).map_err(|source| RecipeError::Read { path, source })?;
            if !contents.ends_with('\n') {
                contents.push('\n');
            }
            contents
        }
        None => DEFAULT_BASE.to_string(),
    };

    let relative = format!("./{}", main.trim_start_matches("./"));
    let shim_path = format!("{GENERATED_DIR}/shim.sh");
    let dockerfile = format!(
        "{base}\
         WORKDIR {WORKDIR}\n\
         COPY . .\n\
         RUN chmod +x {main}\n\
         ENTRYPOINT [\"bash\", {shim}]\n",
        main = quoted(&relative),
        shim = quoted(&in_workdir(&shim_path)),
    );
    let shim = SHIM.replace("{entrypoint}", &quoted(&relative));
    Ok(Recipe::new(dockerfile).with_file(shim_path, shim))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_base_and_shim() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("run.sh"), "echo hi\n").unwrap();
        let options = KindOptions::new().with("entrypoint", "run.sh");

        let recipe = recipe(dir.path(), &options).unwrap();
        assert!(recipe.dockerfile.starts_with("FROM ubuntu:22.04\n"));
        assert!(recipe.dockerfile.contains("RUN chmod +x \"./run.sh\"\n"));
        assert!(recipe
            .dockerfile
            .ends_with("ENTRYPOINT [\"bash\", \"/taskpilot/.taskpilot/shim.sh\"]\n"));
        let (path, shim) = &recipe.files[0];
        assert_eq!(path, ".taskpilot/shim.sh");
        assert!(shim.contains("exec \"./run.sh\""));
    }

    #[test]
    fn test_builds_on_user_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("run.sh"), "").unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM debian:12").unwrap();
        fs::write(dir.path().join("Dockerfile.taskpilot"), "FROM alpine:3").unwrap();
        let options = KindOptions::new().with("entrypoint", "run.sh");

        let recipe = recipe(dir.path(), &options).unwrap();
        assert!(recipe.dockerfile.starts_with("FROM alpine:3\nWORKDIR /taskpilot\n"));
    }
}
