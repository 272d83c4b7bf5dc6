use std::path::Path;

use taskpilot_api::{KindOptions, TaskKind};

use super::{entrypoint, quoted, require, Recipe, RecipeError, GENERATED_DIR, WORKDIR};

const BASE_IMAGE: &str = "denoland/deno:alpine-1.37.0";

const SHIM: &str = r#"// Generated by taskpilot. Runs the task with its JSON parameters.
import task from {import};

if (Deno.args.length !== 1) {
  console.error("shim: expected a single JSON argument");
  Deno.exit(1);
}
await task(JSON.parse(Deno.args[0]));
"#;

pub(super) fn recipe(root: &Path, options: &KindOptions, shim: bool) -> Result<Recipe, RecipeError> {
    let main = entrypoint(TaskKind::Deno, options)?;
    require(root, &[&main])?;

    let mut recipe = Recipe::new(String::new());
    let target = if shim {
        let path = format!("{GENERATED_DIR}/shim.ts");
        let import = format!("../{}", main.trim_start_matches("./"));
        recipe = recipe.with_file(path.clone(), SHIM.replace("{import}", &quoted(&import)));
        path
    } else {
        main
    };

    recipe.dockerfile = format!(
        "FROM {BASE_IMAGE}\n\
         WORKDIR {WORKDIR}\n\
         COPY . .\n\
         RUN deno cache {cache}\n\
         USER deno\n\
         ENTRYPOINT [\"deno\", \"run\", \"-A\", {target}]\n",
        cache = quoted(&target),
        target = quoted(&target),
    );
    Ok(recipe)
}
