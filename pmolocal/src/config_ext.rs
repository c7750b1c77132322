//! Extension pour intégrer la bibliothèque locale dans pmoconfig

use anyhow::Result;
use pmoconfig::Config;

const DEFAULT_LIBRARY_DIR: &str = "music";

pub trait LibraryConfigExt {
    /// Répertoire de la bibliothèque, résolu par rapport au répertoire de configuration
    fn get_library_directory(&self) -> String;

    fn set_library_directory(&self, directory: &str) -> Result<()>;
}

impl LibraryConfigExt for Config {
    fn get_library_directory(&self) -> String {
        let dir = self.get_string(&["library", "directory"], DEFAULT_LIBRARY_DIR);
        self.resolve_path(&dir)
    }

    fn set_library_directory(&self, directory: &str) -> Result<()> {
        self.set_string(&["library", "directory"], directory)
    }
}
