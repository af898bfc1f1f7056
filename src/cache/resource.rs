//! Resource states emitted by stale-while-revalidate reads

use std::sync::Arc;

use crate::error::Error;

/// One emission of [`CacheManager::get_with_swr`](super::CacheManager::get_with_swr)
#[derive(Debug, Clone)]
pub enum CachedResource<T> {
    /// Lookup in progress
    Loading { data: Option<T> },
    /// Data is available
    Success {
        data: T,
        is_from_cache: bool,
        is_stale: bool,
    },
    /// The fetch failed; `data` is the cached value, if any
    Error {
        cause: Arc<Error>,
        data: Option<T>,
        is_from_cache: bool,
    },
}

impl<T> CachedResource<T> {
    /// Best data carried by this state
    pub fn data(&self) -> Option<&T> {
        match self {
            CachedResource::Loading { data } | CachedResource::Error { data, .. } => data.as_ref(),
            CachedResource::Success { data, .. } => Some(data),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, CachedResource::Loading { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CachedResource::Error { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, CachedResource::Success { is_stale: true, .. })
    }
}
