//! Points a layer's build at the feeds of the layers below it.
//!
//! Each upstream layer `D` has an include file `<D>-ipk-feed.inc` in the
//! layer's include directory, assigning `<D>_IPK_SERVER_PATH`. Only the
//! value of that single assignment is rewritten.

use std::path::PathBuf;

use convenient_bitbake::{ConfError, ConfFile};
use tracing::{debug, info};

use crate::environment::{FeedDescriptor, LayerSpec};

#[derive(Debug, thiserror::Error)]
pub enum FeedConfigError {
    #[error("Feed include file {0:?} does not exist")]
    MissingInclude(PathBuf),

    #[error("Feed of {0} cannot be configured for {1}, it is not an earlier layer")]
    NotUpstream(String, String),

    #[error(transparent)]
    Conf(#[from] ConfError),
}

/// Include file of `feed` inside the layer described by `spec`.
pub fn include_path(spec: &LayerSpec, feed: &FeedDescriptor) -> PathBuf {
    spec.work_dir
        .join(&spec.include_dir)
        .join(format!("{}-ipk-feed.inc", feed.layer))
}

/// Rewrite the feed include files of `spec` for all `upstream` feeds.
/// Returns the edited files.
pub fn configure_feeds(
    spec: &LayerSpec,
    upstream: &[FeedDescriptor],
) -> Result<Vec<PathBuf>, FeedConfigError> {
    if upstream.is_empty() {
        debug!("{} has no upstream feeds to configure", spec.layer);
        return Ok(Vec::new());
    }

    let mut edited = Vec::with_capacity(upstream.len());
    for feed in upstream {
        if feed.layer >= spec.layer {
            return Err(FeedConfigError::NotUpstream(
                feed.layer.to_string(),
                spec.layer.to_string(),
            ));
        }

        let path = include_path(spec, feed);
        if !path.is_file() {
            return Err(FeedConfigError::MissingInclude(path));
        }
        let mut conf = ConfFile::read(&path)?;
        let key = feed.layer.feed_key();
        let before = conf.to_text();
        conf.set_value(&key, &feed.url)?;
        if conf.to_text() == before {
            debug!("{} already points at {}", key, feed.url);
        } else {
            conf.save()?;
        }
        edited.push(path);
    }
    info!(
        "Configured {} upstream feeds for {}",
        edited.len(),
        spec.layer
    );
    Ok(edited)
}
