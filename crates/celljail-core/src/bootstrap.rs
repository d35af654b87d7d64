//! Composes and runs the initialization script for a session.
//!
//! Layout of the composed source, in order:
//! 1. the binding layer (`bootstrap/prelude.lua`)
//! 2. the user script
//! 3. the epilogue, which serializes `_catalog` into the `catalog` global

use crate::cell::CellScope;
use crate::error::CellError;
use std::sync::Arc;

/// Script-side registry of exposed commands
pub const CATALOG_TABLE: &str = "_catalog";

/// Global holding the serialized catalog after initialization
pub const CATALOG_GLOBAL: &str = "catalog";

const PRELUDE: &str = include_str!("bootstrap/prelude.lua");

/// Builds init scripts around user source.
#[derive(Debug, Clone)]
pub struct BootstrapLoader {
    prelude: Arc<str>,
}

impl Default for BootstrapLoader {
    fn default() -> Self {
        Self {
            prelude: Arc::from(PRELUDE),
        }
    }
}

impl BootstrapLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the built-in binding layer.
    #[must_use]
    pub fn with_prelude(prelude: impl Into<Arc<str>>) -> Self {
        Self {
            prelude: prelude.into(),
        }
    }

    pub fn prelude(&self) -> &str {
        &self.prelude
    }

    pub fn build_init_script(&self, user_source: &str) -> String {
        let epilogue = epilogue();
        let mut script =
            String::with_capacity(self.prelude.len() + user_source.len() + epilogue.len() + 2);
        script.push_str(&self.prelude);
        script.push('\n');
        script.push_str(user_source);
        script.push('\n');
        script.push_str(&epilogue);
        script
    }

    /// Run the cell's captured bootstrap, then the composed script, and return
    /// the serialized catalog.
    ///
    /// The host call surface must already be installed. Globals written before
    /// a failure stay in place.
    pub fn load(
        &self,
        scope: &CellScope<'_>,
        bootstrap: &str,
        user_source: &str,
    ) -> Result<String, CellError> {
        if !bootstrap.trim().is_empty() {
            scope.run(bootstrap)?;
        }
        scope.run(&self.build_init_script(user_source))?;
        let catalog = scope.get(CATALOG_GLOBAL)?;
        scope.display_text(catalog)
    }
}

fn epilogue() -> String {
    format!("{CATALOG_GLOBAL} = json.encode({CATALOG_TABLE})")
}
