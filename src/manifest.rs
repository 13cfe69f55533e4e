//! Resolution of indirect install links
//!
//! An install link such as
//! `itms-services://?action=download-manifest&url=https://host/manifest.plist`
//! does not point at a package. Its `url` query parameter names a property
//! list manifest, and the package URL is the `url` of the first
//! `software-package` asset of the manifest's first item.

use reqwest::Client;
use tracing::{debug, info, instrument, trace};
use ulid::Ulid;
use url::Url;

use crate::download::TransferEngine;
use crate::error::ResolveError;
use crate::util::filename_from_url;

const PACKAGE_ASSET_KIND: &str = "software-package";

/// Transfer started from an install link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTransfer {
    pub id: Ulid,
    /// Name of the file in the storage directory
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct ManifestResolver {
    client: Client,
    engine: TransferEngine,
}

impl ManifestResolver {
    pub fn new(client: Client, engine: TransferEngine) -> Self {
        Self { client, engine }
    }

    /// Resolves an install link and starts the package transfer.
    ///
    /// No record is created unless resolution succeeds.
    #[instrument(level = "debug", skip(self))]
    pub async fn resolve_and_start(
        &self,
        indirect_url: &str,
    ) -> Result<ResolvedTransfer, ResolveError> {
        let manifest_url = manifest_url_from(indirect_url)?;
        let package_url = self.resolve(&manifest_url).await?;

        let filename = filename_from_url(&package_url);
        let (id, filename) = self.engine.start_named(package_url.as_str(), &filename)?;

        info!(id = %id, package = %package_url, filename = %filename, "Install link resolved");
        Ok(ResolvedTransfer { id, filename })
    }

    /// Fetches a manifest and returns the package URL it names
    pub async fn resolve(&self, manifest_url: &Url) -> Result<Url, ResolveError> {
        debug!(manifest = %manifest_url, "Fetching manifest");

        let response = self
            .client
            .get(manifest_url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(ResolveError::ManifestFetchFailed)?;
        let body = response
            .bytes()
            .await
            .map_err(ResolveError::ManifestFetchFailed)?;

        if body.is_empty() {
            return Err(ResolveError::ManifestEmpty);
        }
        trace!(bytes = body.len(), "Manifest received");

        package_url_from_manifest(&body)
    }
}

/// Extracts the manifest location from an install link's `url` parameter
pub fn manifest_url_from(indirect_url: &str) -> Result<Url, ResolveError> {
    let indirect = Url::parse(indirect_url).map_err(|_| ResolveError::InvalidManifestUrl)?;

    let manifest = indirect
        .query_pairs()
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.into_owned())
        .ok_or(ResolveError::InvalidManifestUrl)?;

    let manifest = Url::parse(&manifest).map_err(|_| ResolveError::InvalidManifestUrl)?;
    match manifest.scheme() {
        "http" | "https" => Ok(manifest),
        _ => Err(ResolveError::InvalidManifestUrl),
    }
}

/// Finds the package URL in a manifest (XML or binary property list)
pub fn package_url_from_manifest(data: &[u8]) -> Result<Url, ResolveError> {
    let manifest = plist::Value::from_reader(std::io::Cursor::new(data)).map_err(|e| {
        debug!(error = %e, "Manifest is not a property list");
        ResolveError::NoPackageUrlFound
    })?;

    let assets = manifest
        .as_dictionary()
        .and_then(|root| root.get("items"))
        .and_then(|items| items.as_array())
        .and_then(|items| items.first())
        .and_then(|item| item.as_dictionary())
        .and_then(|item| item.get("assets"))
        .and_then(|assets| assets.as_array())
        .ok_or(ResolveError::NoPackageUrlFound)?;

    assets
        .iter()
        .filter_map(|asset| asset.as_dictionary())
        .filter(|asset| {
            asset.get("kind").and_then(|kind| kind.as_string()) == Some(PACKAGE_ASSET_KIND)
        })
        .filter_map(|asset| asset.get("url").and_then(|url| url.as_string()))
        .find_map(|url| Url::parse(url).ok())
        .ok_or(ResolveError::NoPackageUrlFound)
}
