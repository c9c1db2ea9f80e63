//! Resource policy used when the content process rewrites a navigation URL.

/// Decides whether a URL may be loaded and where it actually lives.
///
/// The host application owns access policy (packaged resources, allowed
/// navigation targets, locale-specific copies). The bridge only asks two
/// questions per URL.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::resource::ResourceResolver;
///
/// struct PackagedOnly;
///
/// impl ResourceResolver for PackagedOnly {
///     fn allowed(&self, url: &str) -> bool {
///         url.starts_with("file:///opt/apps/")
///     }
///
///     fn localized_path(&self, url: &str) -> String {
///         url.replacen("/res/", "/res/locales/en/", 1)
///     }
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait ResourceResolver: Send + Sync {
    /// Whether loading `url` is permitted at all.
    fn allowed(&self, url: &str) -> bool;

    /// Path or URL to load instead of `url`. Returning `url` unchanged is valid.
    fn localized_path(&self, url: &str) -> String;
}
