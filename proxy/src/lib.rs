use std::{num::NonZeroUsize, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

mod errors;
mod prepare;
mod report;
mod stream;

pub mod builder;
pub mod catalog;
pub mod file_requests;
pub mod layer_cache;
pub mod metadata;
pub mod upstream;

use crate::{builder::BundleBuilder, catalog::Catalog, layer_cache::LayerCache};
use crate::{metadata::MetadataStore, upstream::LayerSource};

#[cfg(test)]
use rstest_reuse;


#[derive(Clone)]
pub struct AppState {
    catalog: Arc<Catalog>,
    builder: Arc<BundleBuilder>,
}

impl AppState {
    pub fn new(
        source: Arc<dyn LayerSource>,
        store: Arc<dyn MetadataStore>,
        layer_cache_capacity: NonZeroUsize,
    ) -> Self {
        let cache = Arc::new(LayerCache::new(source.clone(), layer_cache_capacity));
        Self {
            catalog: Arc::new(Catalog::new(source, store)),
            builder: Arc::new(BundleBuilder::new(cache)),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn builder(&self) -> &Arc<BundleBuilder> {
        &self.builder
    }
}

pub fn gen_router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/prepare/:image", get(prepare::get))
        .route("/from/:from/to/:to", get(stream::get))
        .route("/report", post(report::post))
        .layer(TraceLayer::new_for_http())
}

async fn root() -> &'static str {
    "layerlift proxy OK\n"
}
