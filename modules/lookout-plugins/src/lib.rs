//! The shipped adapters: built-in filters, the RSS/URL/file monitors and
//! the file/command/webhook sinks. Each module registers its plugins into
//! the registry during [`builtin`], the load phase.

pub mod execute;
pub mod file;
pub mod filters;
pub mod rss;
pub mod url_fetch;
pub mod webhook;

use lookout_core::PluginRegistry;

/// Build the registry of all built-in plugins.
pub fn builtin() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    filters::register(&mut registry);
    rss::register(&mut registry);
    url_fetch::register(&mut registry);
    file::register(&mut registry);
    execute::register(&mut registry);
    webhook::register(&mut registry);
    registry
}
