use std::fs;
use std::path::Path;

use taskpilot_api::{KindOptions, TaskKind};

use super::{option, require, Recipe, RecipeError};

/// The user's own Dockerfile, used verbatim
pub(super) fn recipe(root: &Path, options: &KindOptions) -> Result<Recipe, RecipeError> {
    let name = option(options, "dockerfile").ok_or(RecipeError::MissingOption {
        kind: TaskKind::Dockerfile,
        option: "dockerfile",
    })?;
    require(root, &[&name])?;
    let path = root.join(&name);
    let contents = fs::read_to_string(&path).map_err(|source| RecipeError::Read { path, source })?;
    Ok(Recipe::new(contents))
}
