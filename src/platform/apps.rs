use std::path::PathBuf;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Interface for abstracting the platform's installed-app catalog.
#[cfg_attr(test, automock)]
pub trait AppCatalog: Send + Sync + 'static {
    /// Display label for a package. Implementations fall back to the package
    /// id when the platform has no better name.
    fn label(&self, package: &str) -> Arc<str>;

    fn icon(&self, package: &str) -> Option<PathBuf>;
}

/// Catalog without platform access: every package is labelled by its id.
pub struct PlainCatalog;

impl AppCatalog for PlainCatalog {
    fn label(&self, package: &str) -> Arc<str> {
        package.into()
    }

    fn icon(&self, _package: &str) -> Option<PathBuf> {
        None
    }
}
