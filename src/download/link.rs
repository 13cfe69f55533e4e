use url::Url;

use crate::util::has_package_extension;

/// Scheme of indirect install links, e.g. `itms-services://?action=download-manifest&url=...`
pub const INSTALL_SCHEME: &str = "itms-services";

/// How a caller should treat a link the user navigated to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Points at a manifest that names the real package
    InstallManifest,
    /// Points directly at a package file
    Package,
    /// Anything else, let the page navigate normally
    Other,
}

/// Whether the URL's path ends in the package extension
pub fn is_package_url(url: &Url) -> bool {
    has_package_extension(url.path())
}

pub fn is_install_url(url: &Url) -> bool {
    url.scheme().eq_ignore_ascii_case(INSTALL_SCHEME)
}

pub fn classify_link(url: &Url) -> LinkKind {
    if is_install_url(url) {
        LinkKind::InstallManifest
    } else if is_package_url(url) {
        LinkKind::Package
    } else {
        LinkKind::Other
    }
}
