use std::path::Path;

use taskpilot_api::{KindOptions, TaskKind};

use super::{
    entrypoint, in_workdir, option, quoted, require, Recipe, RecipeError, GENERATED_DIR, WORKDIR,
};
use crate::build::versions;

const DEFAULT_NODE_VERSION: &str = "18";
const DEFAULT_TS_BUILD_DIR: &str = ".taskpilot-build";

/// Calls the task's default export with the JSON parameters
const SHIM: &str = r#"// Generated by taskpilot. Runs the task with its JSON parameters.
const mod = require({main});
const task = mod.default || mod;

async function main() {
  if (process.argv.length !== 3) {
    console.error("shim: expected a single JSON argument");
    process.exit(1);
  }
  try {
    await task(JSON.parse(process.argv[2]));
  } catch (err) {
    console.error(err);
    process.exit(1);
  }
}

main();
"#;

pub(super) fn recipe(root: &Path, options: &KindOptions, shim: bool) -> Result<Recipe, RecipeError> {
    let entry = entrypoint(TaskKind::Node, options)?;
    // Package directory inside the root, for tasks living in a monorepo sub-package
    let package = option(options, "workdir")
        .map(|w| w.trim_matches('/').trim_start_matches("./").to_string())
        .filter(|w| !w.is_empty() && w != ".");
    let package_dir = match &package {
        Some(dir) => root.join(dir),
        None => root.to_path_buf(),
    };
    let manifest = match &package {
        Some(dir) => format!("{dir}/package.json"),
        None => "package.json".to_string(),
    };
    require(root, &[&entry, &manifest])?;

    // Entrypoint relative to the package directory when it lives inside it
    let mut main = match &package {
        Some(dir) => entry
            .trim_start_matches("./")
            .strip_prefix(&format!("{dir}/"))
            .map(str::to_string)
            .unwrap_or_else(|| entry.clone()),
        None => entry.clone(),
    };
    let package_workdir = match &package {
        Some(dir) => in_workdir(dir),
        None => WORKDIR.to_string(),
    };

    let mut commands = Vec::new();
    if package_dir.join("package-lock.json").exists() {
        commands.push("npm ci".to_string());
    } else if package_dir.join("yarn.lock").exists() {
        commands.push("yarn install --frozen-lockfile".to_string());
    }

    let build_command = option(options, "buildCommand");
    let mut run_dir = package_workdir.clone();
    let language = option(options, "language").unwrap_or_default();
    match language.as_str() {
        "typescript" => {
            let build_dir =
                option(options, "buildDir").unwrap_or_else(|| DEFAULT_TS_BUILD_DIR.to_string());
            commands.push("npm install -g typescript@5".to_string());
            commands.push(
                r#"[ -f tsconfig.json ] || echo '{"include": ["*", "**/*"], "exclude": ["node_modules"]}' > tsconfig.json"#
                    .to_string(),
            );
            commands.push(format!(
                "rm -rf {build_dir} && tsc --outDir {build_dir} --rootDir ."
            ));
            commands.extend(build_command);
            run_dir = format!("{package_workdir}/{}", build_dir.trim_start_matches("./"));
            if let Some(stem) = main.strip_suffix(".ts") {
                main = format!("{stem}.js");
            }
        }
        "javascript" => {
            commands.extend(build_command);
            if let Some(build_dir) = option(options, "buildDir") {
                run_dir = format!("{package_workdir}/{}", build_dir.trim_start_matches("./"));
            }
        }
        other => return Err(RecipeError::UnknownLanguage(other.to_string())),
    }
    let main = format!("{run_dir}/{}", main.trim_start_matches("./"));

    let version = option(options, "nodeVersion").unwrap_or_else(|| DEFAULT_NODE_VERSION.to_string());
    let base = versions::lookup("node", &version)
        .and_then(|v| v.reference())
        .unwrap_or_else(|| format!("node:{version}-buster"));

    let mut runs = String::new();
    if package.is_some() {
        runs.push_str(&format!("WORKDIR {package_workdir}\n"));
    }
    runs.extend(commands.iter().map(|c| format!("RUN {c}\n")));
    let mut recipe = Recipe::new(String::new());
    let target = if shim {
        let path = format!("{GENERATED_DIR}/shim.js");
        recipe = recipe.with_file(path.clone(), SHIM.replace("{main}", &quoted(&main)));
        in_workdir(&path)
    } else {
        main
    };

    recipe.dockerfile = format!(
        "FROM {base}\n\
         WORKDIR {WORKDIR}\n\
         \n\
         # BUILD_NPM_RC or BUILD_NPM_TOKEN configure private registry auth\n\
         ARG BUILD_NPM_RC\n\
         ARG BUILD_NPM_TOKEN\n\
         RUN [ -z \"${{BUILD_NPM_RC}}\" ] || echo \"${{BUILD_NPM_RC}}\" > .npmrc\n\
         RUN [ -z \"${{BUILD_NPM_TOKEN}}\" ] || echo \"//registry.npmjs.org/:_authToken=${{BUILD_NPM_TOKEN}}\" > .npmrc\n\
         \n\
         COPY . {WORKDIR}\n\
         {runs}\
         WORKDIR {run_dir}\n\
         ENTRYPOINT [\"node\", {target}]\n",
        target = quoted(&target),
    );
    Ok(recipe)
}
