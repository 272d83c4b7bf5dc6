use std::path::Path;

use taskpilot_api::{KindOptions, TaskKind};

use super::{entrypoint, in_workdir, quoted, require, Recipe, RecipeError, GENERATED_DIR, WORKDIR};
use crate::build::versions;

const FALLBACK_BASE: &str = "python:3-bookworm";

const SHIM: &str = r#"# Generated by taskpilot. Runs the task's main() with its JSON parameters.
import importlib.util as util
import json
import sys


def run(args):
    if len(args) != 2:
        raise Exception("shim: expected a single JSON argument, got {}".format(args[1:]))

    sys.path.append({workdir})
    spec = util.spec_from_file_location("mod.main", {main})
    mod = util.module_from_spec(spec)
    spec.loader.exec_module(mod)

    try:
        mod.main(json.loads(args[1]))
    except Exception as e:
        raise Exception("shim: executing " + {main}) from e


if __name__ == "__main__":
    run(sys.argv)
"#;

pub(super) fn recipe(root: &Path, options: &KindOptions, shim: bool) -> Result<Recipe, RecipeError> {
    let main = entrypoint(TaskKind::Python, options)?;
    require(root, &[&main])?;

    let base = versions::lookup("python", "3")
        .and_then(|v| v.reference())
        .unwrap_or_else(|| FALLBACK_BASE.to_string());
    let requirements = if root.join("requirements.txt").exists() {
        ""
    } else {
        "RUN echo > requirements.txt\n"
    };

    let main = in_workdir(&main);
    let mut recipe = Recipe::new(String::new());
    let target = if shim {
        let path = format!("{GENERATED_DIR}/shim.py");
        let contents = SHIM
            .replace("{workdir}", &quoted(WORKDIR))
            .replace("{main}", &quoted(&main));
        recipe = recipe.with_file(path.clone(), contents);
        in_workdir(&path)
    } else {
        main
    };

    recipe.dockerfile = format!(
        "FROM {base}\n\
         WORKDIR {WORKDIR}\n\
         {requirements}\
         COPY . .\n\
         RUN pip install -r requirements.txt\n\
         ENTRYPOINT [\"python\", {target}]\n",
        target = quoted(&target),
    );
    Ok(recipe)
}
