use std::path::Path;

use taskpilot_api::{KindOptions, TaskKind};

use super::{entrypoint, in_workdir, quoted, require, Recipe, RecipeError, WORKDIR};

const BASE_IMAGE: &str = "golang:1.21-alpine";

pub(super) fn recipe(root: &Path, options: &KindOptions) -> Result<Recipe, RecipeError> {
    let main = entrypoint(TaskKind::Go, options)?;
    require(root, &["go.mod", "go.sum", &main])?;

    Ok(Recipe::new(format!(
        "FROM {BASE_IMAGE}\n\
         WORKDIR {WORKDIR}\n\
         COPY go.mod go.sum ./\n\
         RUN go mod download\n\
         COPY . .\n\
         ENTRYPOINT [\"go\", \"run\", {main}]\n",
        main = quoted(&in_workdir(&main)),
    )))
}
